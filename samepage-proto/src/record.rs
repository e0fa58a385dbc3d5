use crate::wire::{ByteReader, ByteWriter};
use samepage_base::{proto, PageKey, Result};

pub const EVENT_RECORD_SIZE: usize = 32;

const TAG_DPU_STABLE_MERGE: u32 = 1;
const TAG_DPU_UNSTABLE_MERGE: u32 = 2;
const TAG_DPU_STALE_STABLE_NODE: u32 = 3;
const TAG_DPU_ITEM_STATE_CHANGE: u32 = 4;
const TAG_HOST_STALE_STABLE_NODE: u32 = 5;
const TAG_HOST_NO_STABLE_NODE: u32 = 6;
const TAG_HOST_MERGE_ONE_FAILED: u32 = 7;
const TAG_HOST_MERGE_TWO_FAILED: u32 = 8;

/// One 32-byte entry of the decision log (engine to host) or the error
/// table (host to engine). The engine-origin variants record merge
/// decisions; the host-origin variants mirror them to report replay
/// failures from the previous cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventRecord {
    /// An item joined an existing stable node.
    StableMerge {
        from: PageKey,
        kpfn: u64,
        shared_cnt: i32,
    },
    /// Two unstable items were promoted into a fresh stable node.
    UnstableMerge { from: PageKey, to: PageKey },
    /// A stable node lost its last sharer; the host should forget the frame.
    StaleStableNode { last: PageKey, kpfn: u64 },
    /// An item detached from a still-populated stable node.
    ItemStateChange {
        item: PageKey,
        kpfn: u64,
        shared_cnt: i32,
    },
    HostStaleStableNode { last: PageKey, kpfn: u64 },
    /// Carried for wire compatibility; never legitimately produced.
    HostNoStableNode,
    HostMergeOneFailed { from: PageKey, kpfn: u64 },
    HostMergeTwoFailed { from: PageKey, to: PageKey },
}

impl EventRecord {
    pub fn tag(&self) -> u32 {
        match self {
            EventRecord::StableMerge { .. } => TAG_DPU_STABLE_MERGE,
            EventRecord::UnstableMerge { .. } => TAG_DPU_UNSTABLE_MERGE,
            EventRecord::StaleStableNode { .. } => TAG_DPU_STALE_STABLE_NODE,
            EventRecord::ItemStateChange { .. } => TAG_DPU_ITEM_STATE_CHANGE,
            EventRecord::HostStaleStableNode { .. } => TAG_HOST_STALE_STABLE_NODE,
            EventRecord::HostNoStableNode => TAG_HOST_NO_STABLE_NODE,
            EventRecord::HostMergeOneFailed { .. } => TAG_HOST_MERGE_ONE_FAILED,
            EventRecord::HostMergeTwoFailed { .. } => TAG_HOST_MERGE_TWO_FAILED,
        }
    }

    /// Append exactly EVENT_RECORD_SIZE bytes.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        let mut wr = ByteWriter::new(buf);
        wr.put_u32(self.tag());
        wr.put_pad(4);
        match *self {
            EventRecord::StableMerge {
                from,
                kpfn,
                shared_cnt,
            }
            | EventRecord::ItemStateChange {
                item: from,
                kpfn,
                shared_cnt,
            } => {
                wr.put_u64(from.va);
                wr.put_u64(kpfn);
                wr.put_i32(from.mm_id);
                wr.put_i32(shared_cnt);
            }
            EventRecord::HostMergeOneFailed { from, kpfn } => {
                wr.put_u64(from.va);
                wr.put_u64(kpfn);
                wr.put_i32(from.mm_id);
                wr.put_pad(4);
            }
            EventRecord::UnstableMerge { from, to }
            | EventRecord::HostMergeTwoFailed { from, to } => {
                wr.put_u64(from.va);
                wr.put_u64(to.va);
                wr.put_i32(from.mm_id);
                wr.put_i32(to.mm_id);
            }
            EventRecord::StaleStableNode { last, kpfn }
            | EventRecord::HostStaleStableNode { last, kpfn } => {
                wr.put_u64(last.va);
                wr.put_u64(kpfn);
                wr.put_i32(last.mm_id);
                wr.put_pad(4);
            }
            EventRecord::HostNoStableNode => {
                wr.put_pad(24);
            }
        }
    }

    /// Decode one record from a 32-byte slice.
    pub fn decode(bytes: &[u8]) -> Result<EventRecord> {
        let mut rd = ByteReader::new(bytes);
        let tag = rd.get_u32()?;
        rd.skip(4)?;
        let rec = match tag {
            TAG_DPU_STABLE_MERGE | TAG_DPU_ITEM_STATE_CHANGE => {
                let va = rd.get_u64()?;
                let kpfn = rd.get_u64()?;
                let mm_id = rd.get_i32()?;
                let shared_cnt = rd.get_i32()?;
                let key = PageKey::new(mm_id, va);
                if tag == TAG_DPU_STABLE_MERGE {
                    EventRecord::StableMerge {
                        from: key,
                        kpfn,
                        shared_cnt,
                    }
                } else {
                    EventRecord::ItemStateChange {
                        item: key,
                        kpfn,
                        shared_cnt,
                    }
                }
            }
            TAG_HOST_MERGE_ONE_FAILED => {
                let va = rd.get_u64()?;
                let kpfn = rd.get_u64()?;
                let mm_id = rd.get_i32()?;
                EventRecord::HostMergeOneFailed {
                    from: PageKey::new(mm_id, va),
                    kpfn,
                }
            }
            TAG_DPU_UNSTABLE_MERGE | TAG_HOST_MERGE_TWO_FAILED => {
                let from_va = rd.get_u64()?;
                let to_va = rd.get_u64()?;
                let from_mm = rd.get_i32()?;
                let to_mm = rd.get_i32()?;
                let from = PageKey::new(from_mm, from_va);
                let to = PageKey::new(to_mm, to_va);
                if tag == TAG_DPU_UNSTABLE_MERGE {
                    EventRecord::UnstableMerge { from, to }
                } else {
                    EventRecord::HostMergeTwoFailed { from, to }
                }
            }
            TAG_DPU_STALE_STABLE_NODE | TAG_HOST_STALE_STABLE_NODE => {
                let va = rd.get_u64()?;
                let kpfn = rd.get_u64()?;
                let mm_id = rd.get_i32()?;
                let last = PageKey::new(mm_id, va);
                if tag == TAG_DPU_STALE_STABLE_NODE {
                    EventRecord::StaleStableNode { last, kpfn }
                } else {
                    EventRecord::HostStaleStableNode { last, kpfn }
                }
            }
            TAG_HOST_NO_STABLE_NODE => EventRecord::HostNoStableNode,
            _ => return Err(proto("unknown event record tag")),
        };
        Ok(rec)
    }
}
