use crate::worker::{Batch, MergeWorker};
use samepage_base::{proto, Result, PAGE_SIZE};
use samepage_net::{Connection, WrTag};
use samepage_proto::{MetadataDesc, ShadowPtDesc, ShadowPte, MAX_PAGES_IN_SGL, SHADOW_PTE_SIZE};
use std::sync::Arc;
use tracing::{debug, info};

/// Outer scan loop for one cycle: per shadow page table, read the
/// va-to-frame map, then read page windows and pipe them into the worker.
/// The one-sided read of window N+1 overlaps with compare-and-merge on
/// window N; the worker's single-slot inbox provides the back pressure.
pub(crate) fn run_scan(
    conn: &mut Connection,
    desc: &MetadataDesc,
    worker: &MergeWorker,
) -> Result<i32> {
    let mut scanned: u64 = 0;
    for pt in &desc.tables {
        info!("scanning mm {} with {} entries", pt.mm_id, pt.entry_cnt);
        let entry_cnt = pt.entry_cnt as usize;
        let map_bytes = conn.read(
            WrTag::ReadMap,
            pt.map_rkey,
            pt.pt_base_addr,
            entry_cnt * SHADOW_PTE_SIZE,
        )?;
        let map = ShadowPte::decode_slice(&map_bytes, entry_cnt)?;
        if map.first().map_or(true, |e| e.va == 0) {
            return Err(proto("invalid shadow page table read"));
        }
        let map = Arc::new(map);

        let window_cnt = ShadowPtDesc::window_cnt(pt.entry_cnt);
        if window_cnt != pt.windows.len() {
            return Err(proto("window descriptors out of step with entry count"));
        }
        for (w, window) in pt.windows.iter().enumerate() {
            let this_cnt = if w == window_cnt - 1 {
                entry_cnt - w * MAX_PAGES_IN_SGL
            } else {
                MAX_PAGES_IN_SGL
            };
            debug!("reading window of {} pages", this_cnt);
            let pages = conn.read(
                WrTag::ReadPage,
                window.pages_rkey,
                window.pages_base_addr,
                this_cnt * PAGE_SIZE,
            )?;
            worker.submit(Batch {
                mm_id: pt.mm_id,
                map: map.clone(),
                idx_adjust: w * MAX_PAGES_IN_SGL,
                pages: Arc::new(pages),
                rkey: window.pages_rkey,
                pages_addr: window.pages_base_addr,
            })?;
            scanned += this_cnt as u64;
        }
    }
    Ok(scanned as i32)
}
