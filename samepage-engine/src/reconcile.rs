use crate::meta::ItemState;
use crate::worker::ScanState;
use crate::EngineOptions;
use samepage_base::{inv, proto, PageKey, Result, PAGE_SIZE};
use samepage_net::{Connection, WrTag};
use samepage_proto::{ErrorTableDesc, EventLog, EventRecord, EVENT_RECORD_SIZE, MAX_PAGES_IN_SGL};
use tracing::debug;

/// Cycle-start reconciliation: read the host's error table, roll back
/// every decision the host rejected, then clear the unstable index and
/// prune items the host stopped exporting. Runs before any scanning.
pub(crate) fn run(
    conn: &mut Connection,
    et: &ErrorTableDesc,
    state: &mut ScanState,
    opts: &EngineOptions,
) -> Result<()> {
    let total = et.total_cnt as usize;
    if total > 0 {
        debug!("applying {} host failure records", total);
    }
    let total_pages = (total * EVENT_RECORD_SIZE).div_ceil(PAGE_SIZE);
    let mut remaining = total;
    for (i, w) in et.windows.iter().enumerate() {
        let this_pages = if i == et.windows.len() - 1 {
            total_pages - i * MAX_PAGES_IN_SGL
        } else {
            MAX_PAGES_IN_SGL
        };
        let bytes = conn.read(
            WrTag::ReadPage,
            w.rkey as u32,
            w.base_addr,
            this_pages * PAGE_SIZE,
        )?;
        let cnt = remaining.min(this_pages * PAGE_SIZE / EVENT_RECORD_SIZE);
        for rec in EventLog::decode_all(&bytes, cnt)? {
            apply(state, rec)?;
        }
        remaining -= cnt;
    }
    if remaining != 0 {
        return Err(proto("error table windows do not cover total_cnt"));
    }

    state.meta.clear_unstable()?;
    state.stats.pruned_items =
        state
            .meta
            .prune(state.cycle, opts.rmap_prune_margin, &mut state.log)? as u64;
    Ok(())
}

fn apply(state: &mut ScanState, rec: EventRecord) -> Result<()> {
    match rec {
        EventRecord::HostStaleStableNode { last, kpfn } => {
            debug!("host reported stale node {} via {}", kpfn, last);
            Err(inv("host observed a stale stable node the engine never announced"))
        }
        EventRecord::HostNoStableNode => Err(inv("host reported a missing stable node")),
        EventRecord::HostMergeOneFailed { from, kpfn } => {
            debug!("undoing stable merge of {} into {}", from, kpfn);
            let node_id = state
                .meta
                .item(from)
                .ok_or_else(|| inv("failure record names unknown item"))?
                .stable_node
                .ok_or_else(|| inv("failed stable merge on item without node"))?;
            {
                let node = state
                    .meta
                    .node(node_id)
                    .ok_or_else(|| inv("failure record names freed node"))?;
                if node.pfn != kpfn {
                    return Err(inv("unexpected pfn while undoing stable merge"));
                }
                if node.shared_cnt < 1 {
                    return Err(inv("invalid shared count for stable node"));
                }
            }
            let remaining = state.meta.detach(node_id, from)?;
            state.meta.reset_item(from)?;
            let item = state
                .meta
                .item_mut(from)
                .ok_or_else(|| inv("item vanished during reconciliation"))?;
            item.volatility_score = item.volatility_score.saturating_add(1);
            if remaining == 0 {
                state
                    .meta
                    .remove_stale_node_and_log(node_id, from, &mut state.log)?;
            }
            Ok(())
        }
        EventRecord::HostMergeTwoFailed { from, to } => {
            debug!("undoing unstable merge of {} with {}", from, to);
            let node_id = state
                .meta
                .item(from)
                .ok_or_else(|| inv("failure record names unknown item"))?
                .stable_node
                .ok_or_else(|| inv("failed unstable merge on item without node"))?;
            let sharers: Vec<PageKey> = state
                .meta
                .node(node_id)
                .ok_or_else(|| inv("failure record names freed node"))?
                .sharers
                .iter()
                .copied()
                .collect();
            for key in sharers {
                let is_stable = state.meta.item(key).map(|i| i.state) == Some(ItemState::Stable);
                if !is_stable {
                    return Err(inv("non-stable sharer while undoing unstable merge"));
                }
                state.meta.reset_item(key)?;
                let item = state
                    .meta
                    .item_mut(key)
                    .ok_or_else(|| inv("item vanished during reconciliation"))?;
                item.volatility_score = item.volatility_score.saturating_add(1);
            }
            state.meta.remove_node_no_item(node_id)?;
            Ok(())
        }
        _ => Err(inv("engine-origin record in host error table")),
    }
}
