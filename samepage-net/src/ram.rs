use crate::verbs::{Completion, RemoteRegion, Verbs, WcStatus, WrTag};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use samepage_base::{err, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

#[derive(Default)]
pub(crate) struct RegionTable {
    next_rkey: u32,
    regions: HashMap<u32, Vec<u8>>,
}

impl RegionTable {
    pub(crate) fn register(&mut self, bytes: Vec<u8>) -> RemoteRegion {
        self.next_rkey += 1;
        let rkey = self.next_rkey;
        self.regions.insert(rkey, bytes);
        RemoteRegion { rkey, addr: 0 }
    }

    pub(crate) fn invalidate(&mut self, region: RemoteRegion) -> Result<()> {
        self.regions
            .remove(&region.rkey)
            .map(|_| ())
            .ok_or_else(|| err("invalidating unknown region"))
    }

    pub(crate) fn read(&self, rkey: u32, addr: u64, len: usize) -> Option<Vec<u8>> {
        let region = self.regions.get(&rkey)?;
        let lo = addr as usize;
        let hi = lo.checked_add(len)?;
        if hi > region.len() {
            return None;
        }
        Some(region[lo..hi].to_vec())
    }
}

/// In-process verbs pair: both ends share each other's region tables and a
/// pair of channels standing in for the wire. One-sided reads are served
/// directly from the peer's table; a dropped peer surfaces as a transport
/// failure on the next operation, like a disconnect.
pub struct RamVerbs {
    local: Arc<Mutex<RegionTable>>,
    peer: Arc<Mutex<RegionTable>>,
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
    completions: VecDeque<Completion>,
    pending_recvs: VecDeque<WrTag>,
}

pub fn ram_pair() -> (RamVerbs, RamVerbs) {
    let a_regions = Arc::new(Mutex::new(RegionTable::default()));
    let b_regions = Arc::new(Mutex::new(RegionTable::default()));
    let (a_tx, b_rx) = unbounded();
    let (b_tx, a_rx) = unbounded();
    let a = RamVerbs {
        local: a_regions.clone(),
        peer: b_regions.clone(),
        tx: a_tx,
        rx: a_rx,
        completions: VecDeque::new(),
        pending_recvs: VecDeque::new(),
    };
    let b = RamVerbs {
        local: b_regions,
        peer: a_regions,
        tx: b_tx,
        rx: b_rx,
        completions: VecDeque::new(),
        pending_recvs: VecDeque::new(),
    };
    (a, b)
}

impl Verbs for RamVerbs {
    fn register(&mut self, bytes: Vec<u8>) -> Result<RemoteRegion> {
        Ok(self.local.lock().register(bytes))
    }

    fn invalidate(&mut self, region: RemoteRegion) -> Result<()> {
        self.local.lock().invalidate(region)
    }

    fn post_read(&mut self, tag: WrTag, rkey: u32, addr: u64, len: usize) -> Result<()> {
        let completion = match self.peer.lock().read(rkey, addr, len) {
            Some(data) => Completion {
                tag,
                status: WcStatus::Success,
                data: Some(data),
            },
            None => Completion {
                tag,
                status: WcStatus::Fail,
                data: None,
            },
        };
        self.completions.push_back(completion);
        Ok(())
    }

    fn post_send(&mut self, tag: WrTag, bytes: &[u8]) -> Result<()> {
        self.tx
            .send(bytes.to_vec())
            .map_err(|_| err("peer disconnected"))?;
        self.completions.push_back(Completion {
            tag,
            status: WcStatus::Success,
            data: None,
        });
        Ok(())
    }

    fn post_recv(&mut self, tag: WrTag) -> Result<()> {
        self.pending_recvs.push_back(tag);
        Ok(())
    }

    fn poll(&mut self) -> Result<Completion> {
        if let Some(c) = self.completions.pop_front() {
            return Ok(c);
        }
        if let Some(tag) = self.pending_recvs.pop_front() {
            let data = self.rx.recv().map_err(|_| err("peer disconnected"))?;
            return Ok(Completion {
                tag,
                status: WcStatus::Success,
                data: Some(data),
            });
        }
        Err(err("poll with no outstanding work requests"))
    }
}
