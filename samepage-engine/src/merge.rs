use crate::meta::{ItemState, MergeMeta, RmapItem};
use crate::prehash::PreHash;
use crate::{CycleStats, EngineOptions};
use samepage_base::{inv, HashPair, PageKey, Result};
use samepage_proto::{EventLog, EventRecord};
use tracing::debug;

/// Skips to grant a volatile item, from its score and how long it has been
/// scanned. Zero score means no grace at all.
pub(crate) fn skip_volatile(volatility_score: u16, age: u16) -> u16 {
    if volatility_score == 0 {
        return 0;
    }
    let grace = volatility_score as u32 + age as u32;
    if grace < 3 {
        1
    } else if grace == 3 {
        2
    } else if grace == 4 {
        4
    } else {
        8
    }
}

fn fetch(meta: &MergeMeta, key: PageKey) -> Result<&RmapItem> {
    meta.item(key).ok_or_else(|| inv("item vanished mid-merge"))
}

fn fetch_mut(meta: &mut MergeMeta, key: PageKey) -> Result<&mut RmapItem> {
    meta.item_mut(key)
        .ok_or_else(|| inv("item vanished mid-merge"))
}

/// Consume one skip if the item has any banked; recharge the bank when it
/// runs dry. Identically false with skipping disabled.
pub(crate) fn should_skip(meta: &mut MergeMeta, key: PageKey, skip_opt: bool) -> bool {
    if !skip_opt {
        return false;
    }
    let item = match meta.item_mut(key) {
        Some(item) => item,
        None => return false,
    };
    match item.state {
        ItemState::None | ItemState::Stable => return false,
        ItemState::Volatile | ItemState::Unstable => {}
    }
    if item.skip_cnt > 0 {
        item.skip_cnt -= 1;
        true
    } else {
        item.skip_cnt = skip_volatile(item.volatility_score, item.age);
        false
    }
}

/// Hash pair for a page of the current batch: pre-hash hit when the worker
/// already got to `stripe_rel`, on-demand computation otherwise.
fn hash_of(
    page: &[u8],
    stripe_rel: usize,
    prehash: Option<&PreHash>,
    stats: &mut CycleStats,
) -> HashPair {
    if let Some(ph) = prehash {
        if let Some(hash) = ph.lookup(stripe_rel) {
            stats.prehash_hits += 1;
            return hash;
        }
        stats.prehash_misses += 1;
    }
    HashPair::of_page(page)
}

/// Stable-item maintenance shared by both merge paths. Returns true when
/// the item broke its mapping and must restart from Volatile.
#[allow(clippy::too_many_arguments)]
fn maintain_stable(
    meta: &mut MergeMeta,
    log: &mut EventLog,
    page: &[u8],
    stripe_rel: usize,
    key: PageKey,
    prehash: Option<&PreHash>,
    stats: &mut CycleStats,
    legacy: bool,
) -> Result<bool> {
    let (node_id, item_pfn, item_old_hash) = {
        let item = fetch(meta, key)?;
        (
            item.stable_node
                .ok_or_else(|| inv("stable item without node"))?,
            item.pfn,
            item.old_hash,
        )
    };
    let (node_pfn, node_hash) = {
        let node = meta
            .node(node_id)
            .ok_or_else(|| inv("stable item names freed node"))?;
        (node.pfn, node.page_hash)
    };

    if node_pfn != item_pfn {
        // The host re-faulted the page since we merged it.
        debug!(
            "pfn mismatch implies mapping change: {} vs {}",
            node_pfn, item_pfn
        );
        let remaining = meta.detach(node_id, key)?;
        meta.reset_item(key)?;
        if remaining == 0 {
            meta.remove_stale_node_and_log(node_id, key, log)?;
        } else {
            log.push(EventRecord::ItemStateChange {
                item: key,
                kpfn: node_pfn,
                shared_cnt: remaining,
            });
        }
        if !legacy {
            let item = fetch_mut(meta, key)?;
            item.volatility_score = item.volatility_score.saturating_add(1);
            stats.broken_merges += 1;
        }
        return Ok(true);
    }

    // Frame unchanged but contents may have moved on: an unstable merge
    // already rewrote the physical page since the node's hash was set.
    let curr = hash_of(page, stripe_rel, prehash, stats);
    if curr != item_old_hash {
        if item_old_hash != node_hash {
            return Err(inv("hash mismatch against both item history and node"));
        }
        meta.propagate_node_hash(node_id, curr)?;
    }
    if !legacy {
        let item = fetch_mut(meta, key)?;
        if item.volatility_score > 0 {
            item.volatility_score -= 1;
        }
    }
    Ok(false)
}

fn promote_unstable_pair(
    meta: &mut MergeMeta,
    log: &mut EventLog,
    curr: HashPair,
    key: PageKey,
    partner: PageKey,
) -> Result<()> {
    let pfn = fetch(meta, key)?.pfn;
    let node_id = meta.insert_stable_node(curr, pfn)?;
    meta.attach(node_id, partner)?;
    meta.attach(node_id, key)?;
    log.push(EventRecord::UnstableMerge { from: key, to: partner });
    debug!("{} and {} merged into fresh stable node {}", key, partner, pfn);
    Ok(())
}

/// Per-page state machine, current path: volatility scoring, skip
/// heuristic, and age tracking around the stable/unstable merge search.
#[allow(clippy::too_many_arguments)]
pub(crate) fn cmp_and_merge_one(
    meta: &mut MergeMeta,
    log: &mut EventLog,
    page: &[u8],
    stripe_rel: usize,
    key: PageKey,
    prehash: Option<&PreHash>,
    opts: &EngineOptions,
    stats: &mut CycleStats,
) -> Result<()> {
    loop {
        let state = fetch(meta, key)?.state;
        match state {
            ItemState::None | ItemState::Unstable => {
                return Err(inv("invalid state for item at merge entry"));
            }
            ItemState::Stable => {
                if maintain_stable(meta, log, page, stripe_rel, key, prehash, stats, false)? {
                    continue;
                }
                return Ok(());
            }
            ItemState::Volatile => {
                stats.volatile_items += 1;
                {
                    let item = fetch_mut(meta, key)?;
                    item.age = item.age.saturating_add(1);
                }
                if should_skip(meta, key, opts.effective_skip()) {
                    stats.skipped += 1;
                    debug!("skipping volatile item {}", key);
                    return Ok(());
                }

                let curr = hash_of(page, stripe_rel, prehash, stats);
                let old = fetch(meta, key)?.old_hash;
                if old == curr {
                    {
                        let item = fetch_mut(meta, key)?;
                        if item.volatility_score > 0 {
                            item.volatility_score -= 1;
                        }
                    }
                    if let Some(node_id) = meta.stable_lookup(curr) {
                        if fetch(meta, key)?.volatility_score > 0 {
                            stats.highly_volatile_stable_merged += 1;
                        }
                        let (kpfn, shared_cnt) = meta.attach(node_id, key)?;
                        log.push(EventRecord::StableMerge {
                            from: key,
                            kpfn,
                            shared_cnt,
                        });
                        debug!(
                            "{} merged with stable node {} ({} sharers)",
                            key, kpfn, shared_cnt
                        );
                    } else if let Some(partner) = meta.unstable_take(curr) {
                        let noisy = fetch(meta, key)?.volatility_score > 0
                            || meta.item(partner).map_or(false, |i| i.volatility_score > 0);
                        promote_unstable_pair(meta, log, curr, key, partner)?;
                        if noisy {
                            stats.highly_volatile_unstable_merged += 1;
                        }
                    } else if meta.unstable_insert(curr, key) {
                        let item = fetch_mut(meta, key)?;
                        item.old_hash = curr;
                        item.state = ItemState::Unstable;
                    } else {
                        stats.unstable_collisions += 1;
                    }
                } else {
                    let item = fetch_mut(meta, key)?;
                    if !item.old_hash.is_null() {
                        item.volatility_score = item.volatility_score.saturating_add(1);
                    }
                    item.old_hash = curr;
                }
                return Ok(());
            }
        }
    }
}

/// Per-page state machine, legacy path: stable lookup before the old-hash
/// comparison and no volatility bookkeeping anywhere.
#[allow(clippy::too_many_arguments)]
pub(crate) fn cmp_and_merge_one_old(
    meta: &mut MergeMeta,
    log: &mut EventLog,
    page: &[u8],
    stripe_rel: usize,
    key: PageKey,
    prehash: Option<&PreHash>,
    _opts: &EngineOptions,
    stats: &mut CycleStats,
) -> Result<()> {
    loop {
        let state = fetch(meta, key)?.state;
        match state {
            ItemState::None | ItemState::Unstable => {
                return Err(inv("invalid state for item at merge entry"));
            }
            ItemState::Stable => {
                if maintain_stable(meta, log, page, stripe_rel, key, prehash, stats, true)? {
                    continue;
                }
                return Ok(());
            }
            ItemState::Volatile => {
                let curr = hash_of(page, stripe_rel, prehash, stats);
                if let Some(node_id) = meta.stable_lookup(curr) {
                    let (kpfn, shared_cnt) = meta.attach(node_id, key)?;
                    log.push(EventRecord::StableMerge {
                        from: key,
                        kpfn,
                        shared_cnt,
                    });
                } else {
                    let old = fetch(meta, key)?.old_hash;
                    if old == curr {
                        if let Some(partner) = meta.unstable_take(curr) {
                            let partner_hash = meta
                                .item(partner)
                                .ok_or_else(|| inv("unstable partner vanished"))?
                                .old_hash;
                            if partner_hash != curr {
                                return Err(inv("hash mismatch with unstable partner"));
                            }
                            promote_unstable_pair(meta, log, curr, key, partner)?;
                        } else if meta.unstable_insert(curr, key) {
                            let item = fetch_mut(meta, key)?;
                            item.old_hash = curr;
                            item.state = ItemState::Unstable;
                        } else {
                            stats.unstable_collisions += 1;
                        }
                    } else {
                        fetch_mut(meta, key)?.old_hash = curr;
                    }
                }
                return Ok(());
            }
        }
    }
}
