use crate::merge;
use crate::meta::MergeMeta;
use crate::prehash::{PreHash, PRE_HASH_NUM};
use crate::{CycleStats, EngineOptions};
use crossbeam_channel::{bounded, Receiver, Sender};
use samepage_base::{err, inv, proto, Error, PageKey, Result, PAGE_SIZE};
use samepage_proto::{EventLog, ShadowPte};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::debug;

/// Everything that changes during one cycle, handed into the worker at
/// cycle start and handed back at cycle end. No locks: ownership moves.
pub(crate) struct ScanState {
    pub meta: MergeMeta,
    pub log: EventLog,
    pub stats: CycleStats,
    pub cycle: u32,
}

/// One read window of pages plus the map slice it came from. The remote
/// key/address of the window travel along for future zero-copy paths.
pub(crate) struct Batch {
    pub mm_id: i32,
    pub map: Arc<Vec<ShadowPte>>,
    pub idx_adjust: usize,
    pub pages: Arc<Vec<u8>>,
    pub rkey: u32,
    pub pages_addr: u64,
}

enum ToWorker {
    Start(Box<ScanState>),
    Batch(Batch),
    Finish,
    Shutdown,
}

enum FromWorker {
    Done(Box<ScanState>),
    Failed(Error),
}

/// The compare-and-merge worker thread. The batch channel is a single
/// slot: the driver's send of window N+1 blocks exactly until the worker
/// has picked window N up, which is the two-slot ping-pong with the RDMA
/// read of the next window overlapped with compare work on the current.
pub(crate) struct MergeWorker {
    tx: Sender<ToWorker>,
    rx: Receiver<FromWorker>,
    handle: Option<JoinHandle<()>>,
}

impl MergeWorker {
    pub fn spawn(opts: EngineOptions, prehash: Option<PreHash>) -> Result<MergeWorker> {
        let (tx, to_rx) = bounded(1);
        let (from_tx, rx) = bounded(1);
        let handle = std::thread::Builder::new()
            .name("samepage-merge".into())
            .spawn(move || run(to_rx, from_tx, opts, prehash))?;
        Ok(MergeWorker {
            tx,
            rx,
            handle: Some(handle),
        })
    }

    pub fn start_cycle(&self, state: ScanState) -> Result<()> {
        self.tx
            .send(ToWorker::Start(Box::new(state)))
            .map_err(|_| err("merge worker is gone"))
    }

    /// Blocks while the worker still holds the previous window.
    pub fn submit(&self, batch: Batch) -> Result<()> {
        self.tx
            .send(ToWorker::Batch(batch))
            .map_err(|_| err("merge worker is gone"))
    }

    /// Drain the worker and take the cycle state back.
    pub fn finish_cycle(&self) -> Result<ScanState> {
        self.tx
            .send(ToWorker::Finish)
            .map_err(|_| err("merge worker is gone"))?;
        match self.rx.recv() {
            Ok(FromWorker::Done(state)) => Ok(*state),
            Ok(FromWorker::Failed(e)) => Err(e),
            Err(_) => Err(err("merge worker is gone")),
        }
    }
}

impl Drop for MergeWorker {
    fn drop(&mut self) {
        let _ = self.tx.send(ToWorker::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run(
    rx: Receiver<ToWorker>,
    tx: Sender<FromWorker>,
    opts: EngineOptions,
    prehash: Option<PreHash>,
) {
    let mut state: Option<Box<ScanState>> = None;
    let mut failure: Option<Error> = None;
    loop {
        let msg = match rx.recv() {
            Ok(msg) => msg,
            Err(_) => return,
        };
        match msg {
            ToWorker::Start(s) => {
                state = Some(s);
                failure = None;
            }
            ToWorker::Batch(batch) => {
                // After a failure, keep draining batches so the driver
                // never deadlocks on the full channel; the error surfaces
                // at Finish.
                if failure.is_some() {
                    continue;
                }
                match state.as_mut() {
                    Some(s) => {
                        if let Err(e) = process_batch(s, &batch, &opts, prehash.as_ref()) {
                            failure = Some(e);
                        }
                    }
                    None => failure = Some(inv("batch before cycle start")),
                }
            }
            ToWorker::Finish => {
                let reply = match (state.take(), failure.take()) {
                    (Some(s), None) => FromWorker::Done(s),
                    (_, Some(e)) => FromWorker::Failed(e),
                    (None, None) => FromWorker::Failed(inv("finish before cycle start")),
                };
                if tx.send(reply).is_err() {
                    return;
                }
            }
            ToWorker::Shutdown => return,
        }
    }
}

fn process_batch(
    state: &mut ScanState,
    batch: &Batch,
    opts: &EngineOptions,
    prehash: Option<&PreHash>,
) -> Result<()> {
    let num_pages = batch.pages.len() / PAGE_SIZE;
    debug!(
        "batch of {} pages for mm {} (window rkey {:x} addr {:x})",
        num_pages, batch.mm_id, batch.rkey, batch.pages_addr
    );
    let prehash = if opts.effective_pre_hash() {
        prehash
    } else {
        None
    };
    for i in 0..num_pages {
        if let Some(ph) = prehash {
            if i % PRE_HASH_NUM == 0 {
                let max_idx = (num_pages - i).min(PRE_HASH_NUM);
                ph.start(batch.pages.clone(), i * PAGE_SIZE, max_idx);
            }
        }
        let idx = batch.idx_adjust + i;
        let pte = batch
            .map
            .get(idx)
            .ok_or_else(|| proto("page window exceeds shadow page table"))?;
        let key = PageKey::new(batch.mm_id, pte.va);
        state.meta.touch(key, pte.pfn, state.cycle);
        state.stats.accessed += 1;
        let page = &batch.pages[i * PAGE_SIZE..(i + 1) * PAGE_SIZE];
        if opts.legacy_merge {
            merge::cmp_and_merge_one_old(
                &mut state.meta,
                &mut state.log,
                page,
                i % PRE_HASH_NUM,
                key,
                prehash,
                opts,
                &mut state.stats,
            )?;
        } else {
            merge::cmp_and_merge_one(
                &mut state.meta,
                &mut state.log,
                page,
                i % PRE_HASH_NUM,
                key,
                prehash,
                opts,
                &mut state.stats,
            )?;
        }
    }
    state.stats.scanned += num_pages as u64;
    Ok(())
}
