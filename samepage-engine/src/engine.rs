use crate::driver;
use crate::meta::MergeMeta;
use crate::prehash::PreHash;
use crate::reconcile;
use crate::worker::{MergeWorker, ScanState};
use crate::{CycleStats, EngineOptions};
use samepage_base::{err, Result};
use samepage_net::{Connection, RemoteRegion, WrTag};
use samepage_proto::{EventLog, MetadataDesc, ResultDesc};
use tracing::info;

/// One engine instance: persistent merge metadata, its worker threads, and
/// the per-connection serve loop. Metadata survives across cycles on the
/// same connection and dies with the engine.
pub struct Engine {
    opts: EngineOptions,
    cycle: u32,
    worker: MergeWorker,
    scan: Option<ScanState>,
    result_region: Option<RemoteRegion>,
}

impl Engine {
    pub fn new(opts: EngineOptions) -> Result<Engine> {
        let prehash = if opts.effective_pre_hash() {
            Some(PreHash::spawn()?)
        } else {
            None
        };
        let worker = MergeWorker::spawn(opts.clone(), prehash)?;
        let scan = ScanState {
            meta: MergeMeta::new(opts.max_page_sharing),
            log: EventLog::new(),
            stats: CycleStats::default(),
            cycle: 0,
        };
        Ok(Engine {
            opts,
            cycle: 0,
            worker,
            scan: Some(scan),
            result_region: None,
        })
    }

    /// Serve scan cycles until the peer disconnects (clean shutdown) or a
    /// fault surfaces. Invariant faults poison the connection so no
    /// further scans run on it.
    pub fn serve(&mut self, conn: &mut Connection) -> Result<()> {
        conn.post_recv(WrTag::RecvMetadata)?;
        loop {
            let md_bytes = match conn.complete_recv(WrTag::RecvMetadata) {
                Ok(bytes) => bytes,
                Err(_) => {
                    info!("peer disconnected between cycles");
                    return Ok(());
                }
            };
            if let Err(e) = self.run_cycle(conn, &md_bytes) {
                if e.is_invariant() {
                    conn.poison();
                }
                return Err(e);
            }
        }
    }

    fn run_cycle(&mut self, conn: &mut Connection, md_bytes: &[u8]) -> Result<()> {
        let desc = MetadataDesc::decode(md_bytes)?;
        info!(
            "metadata received: pt_cnt={} et_cnt={}",
            desc.tables.len(),
            desc.errors.total_cnt
        );

        // The host has read the previous log by now: its send of this
        // cycle's metadata happens-after its reads.
        if let Some(region) = self.result_region.take() {
            conn.invalidate(region)?;
        }

        let mut state = self
            .scan
            .take()
            .ok_or_else(|| err("scan state lost by an earlier failure"))?;
        state.log.clear();
        state.stats = CycleStats::default();
        state.cycle = self.cycle;

        reconcile::run(conn, &desc.errors, &mut state, &self.opts)?;

        self.worker.start_cycle(state)?;
        let scan_res = driver::run_scan(conn, &desc, &self.worker);
        let finish_res = self.worker.finish_cycle();
        let scanned = scan_res?;
        let state = finish_res?;

        let region = conn.register(state.log.as_bytes().to_vec())?;
        let result = ResultDesc {
            total_scanned_cnt: scanned,
            log_cnt: state.log.len() as i32,
            rkey: region.rkey as u64,
            result_table_addr: region.addr,
        };
        conn.send(WrTag::SendResult, &result.encode())?;
        conn.post_recv(WrTag::RecvMetadata)?;
        self.result_region = Some(region);

        self.log_cycle_summary(&state);
        self.scan = Some(state);
        self.cycle += 1;
        Ok(())
    }

    fn log_cycle_summary(&self, state: &ScanState) {
        let s = &state.stats;
        info!(
            "cycle {}: scanned {} pages, {} log entries, {} items, {} stable nodes",
            self.cycle,
            s.scanned,
            state.log.len(),
            state.meta.item_cnt(),
            state.meta.stable_node_cnt(),
        );
        info!(
            "cycle {}: skipped {}, volatile {}, noisy-stable {}, noisy-unstable {}, broken {}, collisions {}, pruned {}",
            self.cycle,
            s.skipped,
            s.volatile_items,
            s.highly_volatile_stable_merged,
            s.highly_volatile_unstable_merged,
            s.broken_merges,
            s.unstable_collisions,
            s.pruned_items,
        );
        info!(
            "cycle {}: pre-hash hit {}, miss {}",
            self.cycle, s.prehash_hits, s.prehash_misses
        );
    }

    /// Cycle counter, for observability.
    pub fn cycles_served(&self) -> u32 {
        self.cycle
    }
}
