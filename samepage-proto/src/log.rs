use crate::record::{EventRecord, EVENT_RECORD_SIZE};
use samepage_base::Result;

const GROW_FACTOR: usize = 2;
const INITIAL_RECORDS: usize = 1024;

/// Append-only log of 32-byte event records kept as one contiguous byte
/// buffer, because the peer reads it in place by one-sided RDMA. Capacity
/// grows by doubling; clearing keeps the allocation for the next cycle.
///
/// The engine's decision log and the host's error table are both this type.
#[derive(Debug, Default)]
pub struct EventLog {
    bytes: Vec<u8>,
}

impl EventLog {
    pub fn new() -> Self {
        EventLog {
            bytes: Vec::with_capacity(INITIAL_RECORDS * EVENT_RECORD_SIZE),
        }
    }

    pub fn push(&mut self, rec: EventRecord) {
        if self.bytes.len() + EVENT_RECORD_SIZE > self.bytes.capacity() {
            let want = (self.bytes.capacity() * GROW_FACTOR).max(INITIAL_RECORDS * EVENT_RECORD_SIZE);
            self.bytes.reserve_exact(want - self.bytes.len());
        }
        rec.encode(&mut self.bytes);
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.bytes.len() / EVENT_RECORD_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn capacity_bytes(&self) -> usize {
        self.bytes.capacity()
    }

    pub fn iter(&self) -> impl Iterator<Item = Result<EventRecord>> + '_ {
        self.bytes
            .chunks_exact(EVENT_RECORD_SIZE)
            .map(EventRecord::decode)
    }

    /// Decode `cnt` records from a raw buffer fetched from the peer. The
    /// buffer may be longer than `cnt` records (window-granular reads).
    pub fn decode_all(bytes: &[u8], cnt: usize) -> Result<Vec<EventRecord>> {
        bytes
            .chunks_exact(EVENT_RECORD_SIZE)
            .take(cnt)
            .map(EventRecord::decode)
            .collect()
    }
}
