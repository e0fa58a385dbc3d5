use crossbeam_utils::atomic::AtomicCell;
use parking_lot::{Condvar, Mutex};
use samepage_base::{HashPair, Result, PAGE_SIZE};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::debug;

/// Stripe size of the pre-hash chunk: the worker fills at most this many
/// hash pairs per handed-in batch, into one reused allocation.
pub const PRE_HASH_NUM: usize = 16384;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Status {
    Ready,
    DataReady,
    InProgress,
    WorkDone,
}

struct Ctl {
    status: Status,
    pages: Option<Arc<Vec<u8>>>,
    base: usize,
    max_idx: usize,
}

struct Shared {
    ctl: Mutex<Ctl>,
    cv: Condvar,
    /// Asks the worker to stop at its next iteration boundary.
    stop: AtomicBool,
    shutdown: AtomicBool,
    /// Hash pairs below this index are published. Release on store,
    /// acquire on load; the chunk cells themselves carry no ordering.
    completed: AtomicUsize,
    chunk: Box<[AtomicCell<HashPair>]>,
}

/// Background hasher for the batch currently in front of the
/// compare-and-merge worker. Behavior-transparent: a miss is computed on
/// demand and is byte-identical to a hit.
pub struct PreHash {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl PreHash {
    pub fn spawn() -> Result<PreHash> {
        let chunk: Vec<AtomicCell<HashPair>> = (0..PRE_HASH_NUM)
            .map(|_| AtomicCell::new(HashPair::NULL))
            .collect();
        let shared = Arc::new(Shared {
            ctl: Mutex::new(Ctl {
                status: Status::Ready,
                pages: None,
                base: 0,
                max_idx: 0,
            }),
            cv: Condvar::new(),
            stop: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            completed: AtomicUsize::new(0),
            chunk: chunk.into_boxed_slice(),
        });
        let worker_shared = shared.clone();
        let handle = std::thread::Builder::new()
            .name("samepage-prehash".into())
            .spawn(move || run(worker_shared))?;
        Ok(PreHash {
            shared,
            handle: Some(handle),
        })
    }

    /// Hand the worker a new stripe: `max_idx` pages starting at byte
    /// offset `base` of `pages`. If the worker is mid-stripe it is asked to
    /// stop at its next iteration boundary; this call returns only once the
    /// new stripe is installed.
    pub fn start(&self, pages: Arc<Vec<u8>>, base: usize, max_idx: usize) {
        loop {
            let mut ctl = self.shared.ctl.lock();
            match ctl.status {
                Status::Ready | Status::WorkDone => {
                    ctl.pages = Some(pages);
                    ctl.base = base;
                    ctl.max_idx = max_idx.min(PRE_HASH_NUM);
                    self.shared.completed.store(0, Ordering::Release);
                    self.shared.stop.store(false, Ordering::Relaxed);
                    ctl.status = Status::DataReady;
                    self.shared.cv.notify_one();
                    return;
                }
                Status::InProgress => {
                    self.shared.stop.store(true, Ordering::Relaxed);
                }
                Status::DataReady => {}
            }
            drop(ctl);
            std::thread::yield_now();
        }
    }

    /// Precomputed pair for the `rel_idx`-th page of the current stripe, if
    /// the worker already got there.
    pub fn lookup(&self, rel_idx: usize) -> Option<HashPair> {
        if rel_idx >= PRE_HASH_NUM {
            return None;
        }
        if rel_idx < self.shared.completed.load(Ordering::Acquire) {
            Some(self.shared.chunk[rel_idx].load())
        } else {
            None
        }
    }
}

impl Drop for PreHash {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Relaxed);
        self.shared.cv.notify_one();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run(shared: Arc<Shared>) {
    loop {
        let (pages, base, max_idx) = {
            let mut ctl = shared.ctl.lock();
            while ctl.status != Status::DataReady {
                if shared.shutdown.load(Ordering::Relaxed) {
                    return;
                }
                shared.cv.wait(&mut ctl);
            }
            ctl.status = Status::InProgress;
            match ctl.pages.clone() {
                Some(pages) => (pages, ctl.base, ctl.max_idx),
                None => {
                    ctl.status = Status::Ready;
                    continue;
                }
            }
        };

        for i in 0..max_idx {
            if shared.stop.load(Ordering::Relaxed) {
                debug!("pre-hash stopped at {}/{}", i, max_idx);
                break;
            }
            let off = base + i * PAGE_SIZE;
            let hash = HashPair::of_page(&pages[off..off + PAGE_SIZE]);
            shared.chunk[i].store(hash);
            shared.completed.fetch_add(1, Ordering::Release);
        }

        let mut ctl = shared.ctl.lock();
        ctl.pages = None;
        ctl.status = Status::WorkDone;
    }
}
