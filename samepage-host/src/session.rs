use crate::shadow::{FrameStore, ShadowMm};
use samepage_base::{err, proto, PageKey, Result, PAGE_SIZE};
use samepage_net::{Connection, RemoteRegion, WrTag};
use samepage_proto::{
    ErrorTableDesc, ErrorWindowDesc, EventLog, EventRecord, MetadataDesc, PageWindowDesc,
    ResultDesc, ShadowPtDesc, ShadowPte, EVENT_RECORD_SIZE, MAX_PAGES_IN_SGL,
};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// What one cycle produced, as seen from the host.
#[derive(Debug)]
pub struct CycleReport {
    pub scanned: i32,
    pub records: Vec<EventRecord>,
    pub failures: usize,
}

/// One host's connection to the engine: the exported address spaces, the
/// frame store behind them, the merged-page bookkeeping, and the error
/// table carried to the next cycle.
pub struct HostSession {
    conn: Connection,
    mms: Vec<ShadowMm>,
    store: FrameStore,
    error_table: EventLog,
    merged: BTreeMap<PageKey, u64>,
    cycle_regions: Vec<RemoteRegion>,
}

impl HostSession {
    pub fn new(conn: Connection) -> HostSession {
        HostSession {
            conn,
            mms: Vec::new(),
            store: FrameStore::new(),
            error_table: EventLog::new(),
            merged: BTreeMap::new(),
            cycle_regions: Vec::new(),
        }
    }

    pub fn store(&self) -> &FrameStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut FrameStore {
        &mut self.store
    }

    /// The shadow table for an address space, created on first use.
    pub fn mm_mut(&mut self, mm_id: i32) -> &mut ShadowMm {
        if let Some(i) = self.mms.iter().position(|m| m.mm_id == mm_id) {
            return &mut self.mms[i];
        }
        self.mms.push(ShadowMm::new(mm_id));
        self.mms.last_mut().unwrap()
    }

    pub fn merged_pages(&self) -> &BTreeMap<PageKey, u64> {
        &self.merged
    }

    /// Rejections accumulated since the last exchange.
    pub fn error_table(&self) -> &EventLog {
        &self.error_table
    }

    /// Register this cycle's descriptors, send them, and read back the
    /// decision log. Replay is separate so callers can interleave guest
    /// writes between the scan and the replay.
    pub fn exchange(&mut self) -> Result<(i32, Vec<EventRecord>)> {
        let mut md = MetadataDesc::default();
        for mm in &self.mms {
            let entry_cnt = mm.entry_cnt();
            let mut map_bytes = Vec::with_capacity(entry_cnt * 16);
            ShadowPte::encode_slice(mm.entries(), &mut map_bytes);
            let map_region = self.conn.register(map_bytes)?;
            self.cycle_regions.push(map_region);

            // One contiguous page buffer per window, frames laid out in
            // map order so a single read covers the whole window.
            let mut windows = Vec::new();
            for chunk in mm.entries().chunks(MAX_PAGES_IN_SGL) {
                let mut buf = Vec::with_capacity(chunk.len() * PAGE_SIZE);
                for pte in chunk {
                    let frame = self
                        .store
                        .read(pte.pfn)
                        .ok_or_else(|| err("exported frame missing from the store"))?;
                    buf.extend_from_slice(frame);
                }
                let region = self.conn.register(buf)?;
                self.cycle_regions.push(region);
                windows.push(PageWindowDesc {
                    pages_rkey: region.rkey,
                    pages_base_addr: region.addr,
                });
            }
            md.tables.push(ShadowPtDesc {
                mm_id: mm.mm_id,
                map_rkey: map_region.rkey,
                pt_base_addr: map_region.addr,
                windows,
                entry_cnt: entry_cnt as u64,
            });
        }
        md.errors = self.register_error_table()?;

        self.conn.post_recv(WrTag::RecvResult)?;
        self.conn.send(WrTag::SendMetadata, &md.encode()?)?;
        self.error_table.clear();

        let result_bytes = self.conn.complete_recv(WrTag::RecvResult)?;
        let result = ResultDesc::decode(&result_bytes)?;
        info!(
            "result received: scanned {} pages, {} log entries",
            result.total_scanned_cnt, result.log_cnt
        );
        let records = if result.log_cnt > 0 {
            let log_bytes = self.conn.read(
                WrTag::ReadResult,
                result.rkey as u32,
                result.result_table_addr,
                result.log_cnt as usize * EVENT_RECORD_SIZE,
            )?;
            EventLog::decode_all(&log_bytes, result.log_cnt as usize)?
        } else {
            Vec::new()
        };

        // The engine's reads of our regions happened before its result.
        for region in self.cycle_regions.drain(..) {
            self.conn.invalidate(region)?;
        }
        Ok((result.total_scanned_cnt, records))
    }

    fn register_error_table(&mut self) -> Result<ErrorTableDesc> {
        let total_cnt = self.error_table.len() as i32;
        if total_cnt == 0 {
            return Ok(ErrorTableDesc::default());
        }
        let mut bytes = self.error_table.as_bytes().to_vec();
        // The engine reads the table in page granules.
        bytes.resize(bytes.len().div_ceil(PAGE_SIZE) * PAGE_SIZE, 0);
        let mut windows = Vec::new();
        for chunk in bytes.chunks(MAX_PAGES_IN_SGL * PAGE_SIZE) {
            let region = self.conn.register(chunk.to_vec())?;
            self.cycle_regions.push(region);
            windows.push(ErrorWindowDesc {
                rkey: region.rkey as u64,
                base_addr: region.addr,
            });
        }
        Ok(ErrorTableDesc { total_cnt, windows })
    }

    /// Replay the decision log against live frames. Every merge re-checks
    /// byte equality before the mapping is rewritten; rejections land in
    /// the error table for the next cycle. Returns the rejection count.
    pub fn replay(&mut self, records: &[EventRecord]) -> Result<usize> {
        let mut failures = 0;
        for rec in records {
            match *rec {
                EventRecord::StableMerge { from, kpfn, .. } => {
                    if !self.try_merge_one(from, kpfn)? {
                        failures += 1;
                    }
                }
                EventRecord::UnstableMerge { from, to } => {
                    if !self.try_merge_two(from, to)? {
                        failures += 1;
                    }
                }
                EventRecord::StaleStableNode { kpfn, .. } => {
                    debug!("engine retired stale frame {}", kpfn);
                    self.merged.retain(|_, v| *v != kpfn);
                }
                EventRecord::ItemStateChange { item, .. } => {
                    self.merged.remove(&item);
                }
                _ => return Err(proto("host-origin record in the decision log")),
            }
        }
        Ok(failures)
    }

    /// Exchange plus immediate replay; the common quiet-guest cycle.
    pub fn run_cycle(&mut self) -> Result<CycleReport> {
        let (scanned, records) = self.exchange()?;
        let failures = self.replay(&records)?;
        Ok(CycleReport {
            scanned,
            records,
            failures,
        })
    }

    fn current_pfn(&self, key: PageKey) -> Result<u64> {
        self.mms
            .iter()
            .find(|m| m.mm_id == key.mm_id)
            .and_then(|m| m.pfn_of(key.va))
            .ok_or_else(|| proto("decision log names an unexported page"))
    }

    fn remap(&mut self, key: PageKey, kpfn: u64) -> Result<()> {
        let mm = self
            .mms
            .iter_mut()
            .find(|m| m.mm_id == key.mm_id)
            .ok_or_else(|| proto("decision log names an unknown address space"))?;
        mm.set_pfn(key.va, kpfn)?;
        self.merged.insert(key, kpfn);
        Ok(())
    }

    /// Merge one page into an established shared frame.
    fn try_merge_one(&mut self, from: PageKey, kpfn: u64) -> Result<bool> {
        let pfn = self.current_pfn(from)?;
        if pfn != kpfn && !self.store.same_content(pfn, kpfn) {
            debug!("stable merge of {} into {} rejected", from, kpfn);
            self.error_table
                .push(EventRecord::HostMergeOneFailed { from, kpfn });
            return Ok(false);
        }
        self.remap(from, kpfn)?;
        Ok(true)
    }

    /// Merge two freshly promoted pages; the from-item's frame becomes the
    /// shared one.
    fn try_merge_two(&mut self, from: PageKey, to: PageKey) -> Result<bool> {
        let kpfn = self.current_pfn(from)?;
        let to_pfn = self.current_pfn(to)?;
        if !self.store.same_content(kpfn, to_pfn) {
            debug!("unstable merge of {} with {} rejected", from, to);
            self.error_table
                .push(EventRecord::HostMergeTwoFailed { from, to });
            return Ok(false);
        }
        self.remap(to, kpfn)?;
        self.merged.insert(from, kpfn);
        Ok(true)
    }
}
