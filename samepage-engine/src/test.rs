use crate::merge::{self, should_skip, skip_volatile};
use crate::meta::{ChainRole, ItemState, MergeMeta};
use crate::prehash::PreHash;
use crate::reconcile;
use crate::worker::ScanState;
use crate::{CycleStats, EngineOptions};
use samepage_base::{HashPair, PageKey, Result, PAGE_SIZE};
use samepage_net::{ram_pair, Connection};
use samepage_proto::{ErrorTableDesc, ErrorWindowDesc, EventLog, EventRecord};
use std::sync::Arc;
use test_log::test;

fn page_of(byte: u8) -> Vec<u8> {
    vec![byte; PAGE_SIZE]
}

fn opts() -> EngineOptions {
    EngineOptions::default()
}

/// Touch + compare-and-merge for one item, the way the worker drives it.
fn scan_one(
    meta: &mut MergeMeta,
    log: &mut EventLog,
    stats: &mut CycleStats,
    opts: &EngineOptions,
    key: PageKey,
    pfn: u64,
    page: &[u8],
    cycle: u32,
) -> Result<()> {
    meta.touch(key, pfn, cycle);
    if opts.legacy_merge {
        merge::cmp_and_merge_one_old(meta, log, page, 0, key, None, opts, stats)
    } else {
        merge::cmp_and_merge_one(meta, log, page, 0, key, None, opts, stats)
    }
}

#[test]
fn test_skip_volatile_table() {
    assert_eq!(skip_volatile(0, 100), 0);
    assert_eq!(skip_volatile(1, 0), 1);
    assert_eq!(skip_volatile(1, 1), 1);
    assert_eq!(skip_volatile(1, 2), 2);
    assert_eq!(skip_volatile(2, 2), 4);
    assert_eq!(skip_volatile(3, 2), 8);
    assert_eq!(skip_volatile(5, 100), 8);
}

#[test]
fn test_should_skip_consumes_and_recharges() {
    let mut meta = MergeMeta::new(256);
    let key = PageKey::new(1, 0x1000);
    meta.touch(key, 7, 0);
    {
        let item = meta.item_mut(key).unwrap();
        item.volatility_score = 2;
        item.age = 1;
    }
    // First call recharges (skip_cnt was 0) and does not skip.
    assert!(!should_skip(&mut meta, key, true));
    assert_eq!(meta.item(key).unwrap().skip_cnt, 2);
    // Banked skips are then consumed one by one.
    assert!(should_skip(&mut meta, key, true));
    assert!(should_skip(&mut meta, key, true));
    assert!(!should_skip(&mut meta, key, true));

    // Disabled: identically false, and no bank is touched.
    let before = meta.item(key).unwrap().skip_cnt;
    assert!(!should_skip(&mut meta, key, false));
    assert_eq!(meta.item(key).unwrap().skip_cnt, before);
}

#[test]
fn test_two_items_converge_over_two_cycles() {
    let mut meta = MergeMeta::new(256);
    let mut log = EventLog::new();
    let mut stats = CycleStats::default();
    let opts = opts();
    let a = PageKey::new(1, 0x1000);
    let b = PageKey::new(1, 0x2000);
    let page = page_of(0x5a);

    // Cycle 0: both first-seen, old hash is null, so both only store.
    scan_one(&mut meta, &mut log, &mut stats, &opts, a, 10, &page, 0).unwrap();
    scan_one(&mut meta, &mut log, &mut stats, &opts, b, 11, &page, 0).unwrap();
    assert!(log.is_empty());
    assert_eq!(meta.item(a).unwrap().state, ItemState::Volatile);
    assert_eq!(meta.item(b).unwrap().state, ItemState::Volatile);
    // The null old hash must not count as churn.
    assert_eq!(meta.item(a).unwrap().volatility_score, 0);

    // Cycle 1: a parks in the unstable index, b finds it and promotes.
    meta.clear_unstable().unwrap();
    scan_one(&mut meta, &mut log, &mut stats, &opts, a, 10, &page, 1).unwrap();
    assert_eq!(meta.item(a).unwrap().state, ItemState::Unstable);
    scan_one(&mut meta, &mut log, &mut stats, &opts, b, 11, &page, 1).unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(
        log.iter().next().unwrap().unwrap(),
        EventRecord::UnstableMerge { from: b, to: a }
    );
    assert_eq!(meta.item(a).unwrap().state, ItemState::Stable);
    assert_eq!(meta.item(b).unwrap().state, ItemState::Stable);
    assert_eq!(meta.stable_node_cnt(), 1);
    // The fresh node takes the promoting item's frame.
    let node = meta.node(meta.item(b).unwrap().stable_node.unwrap()).unwrap();
    assert_eq!(node.pfn, 11);
    assert_eq!(node.shared_cnt, 2);
    meta.check_invariants().unwrap();
}

/// Builds the two-item stable node of the convergence test and returns
/// (meta, log, keys a and b).
fn converged_pair() -> (MergeMeta, EventLog, PageKey, PageKey) {
    let mut meta = MergeMeta::new(256);
    let mut log = EventLog::new();
    let mut stats = CycleStats::default();
    let opts = opts();
    let a = PageKey::new(1, 0x1000);
    let b = PageKey::new(1, 0x2000);
    let page = page_of(0x5a);
    scan_one(&mut meta, &mut log, &mut stats, &opts, a, 10, &page, 0).unwrap();
    scan_one(&mut meta, &mut log, &mut stats, &opts, b, 11, &page, 0).unwrap();
    meta.clear_unstable().unwrap();
    scan_one(&mut meta, &mut log, &mut stats, &opts, a, 10, &page, 1).unwrap();
    scan_one(&mut meta, &mut log, &mut stats, &opts, b, 11, &page, 1).unwrap();
    log.clear();
    (meta, log, a, b)
}

#[test]
fn test_third_item_joins_stable_node() {
    let (mut meta, mut log, _a, b) = converged_pair();
    let mut stats = CycleStats::default();
    let opts = opts();
    let c = PageKey::new(2, 0x9000);
    let page = page_of(0x5a);
    let kpfn = meta.node(meta.item(b).unwrap().stable_node.unwrap()).unwrap().pfn;

    // C needs one cycle to establish a stable hash history.
    scan_one(&mut meta, &mut log, &mut stats, &opts, c, kpfn, &page, 2).unwrap();
    assert!(log.is_empty());
    meta.clear_unstable().unwrap();
    scan_one(&mut meta, &mut log, &mut stats, &opts, c, kpfn, &page, 3).unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(
        log.iter().next().unwrap().unwrap(),
        EventRecord::StableMerge {
            from: c,
            kpfn,
            shared_cnt: 3
        }
    );
    meta.check_invariants().unwrap();
}

#[test]
fn test_saturation_starts_a_chain() {
    let mut meta = MergeMeta::new(2);
    let mut log = EventLog::new();
    let mut stats = CycleStats::default();
    let opts = EngineOptions {
        max_page_sharing: 2,
        ..EngineOptions::default()
    };
    let page = page_of(0x77);
    let keys: Vec<PageKey> = (0..4).map(|i| PageKey::new(1, 0x1000 * (i + 1))).collect();

    for cycle in 0..2 {
        meta.clear_unstable().unwrap();
        for (i, key) in keys.iter().enumerate() {
            scan_one(
                &mut meta,
                &mut log,
                &mut stats,
                &opts,
                *key,
                100 + i as u64,
                &page,
                cycle,
            )
            .unwrap();
        }
    }

    // Two saturated nodes now share the hash: a HEAD in the index and a
    // CHAIN node reachable only through it.
    assert_eq!(meta.stable_node_cnt(), 2);
    let head_id = {
        let id = meta.item(keys[0]).unwrap().stable_node.unwrap();
        let node = meta.node(id).unwrap();
        assert_eq!(node.role, ChainRole::Head);
        assert_eq!(node.shared_cnt, 2);
        id
    };
    let chain_id = meta.node(head_id).unwrap().next.unwrap();
    let chain = meta.node(chain_id).unwrap();
    assert_eq!(chain.role, ChainRole::Chain);
    assert_eq!(chain.prev, Some(head_id));
    assert_eq!(chain.shared_cnt, 2);
    // A saturated HEAD never comes back from lookup; its chain node does
    // until it saturates too.
    assert_eq!(meta.stable_lookup(HashPair::of_page(&page)), None);
    meta.check_invariants().unwrap();
}

#[test]
fn test_refault_breaks_stable_item() {
    let (mut meta, mut log, a, b) = converged_pair();
    let mut stats = CycleStats::default();
    let opts = opts();
    let page = page_of(0x5a);
    let node_id = meta.item(b).unwrap().stable_node.unwrap();
    let kpfn = meta.node(node_id).unwrap().pfn;

    // The host re-faulted b onto a new frame.
    scan_one(&mut meta, &mut log, &mut stats, &opts, b, 999, &page, 2).unwrap();
    assert_eq!(stats.broken_merges, 1);
    assert_eq!(meta.node(node_id).unwrap().shared_cnt, 1);
    let recs: Vec<EventRecord> = log.iter().map(|r| r.unwrap()).collect();
    assert_eq!(
        recs[0],
        EventRecord::ItemStateChange {
            item: b,
            kpfn,
            shared_cnt: 1
        }
    );
    // b restarted from Volatile with a bumped score; the restarted pass
    // stored the current hash as its fresh history.
    let item = meta.item(b).unwrap();
    assert_eq!(item.state, ItemState::Volatile);
    assert_eq!(item.volatility_score, 1);
    assert_eq!(item.old_hash, HashPair::of_page(&page));

    // a re-faulting too empties the node, which goes stale.
    scan_one(&mut meta, &mut log, &mut stats, &opts, a, 998, &page, 2).unwrap();
    let recs: Vec<EventRecord> = log.iter().map(|r| r.unwrap()).collect();
    assert_eq!(recs[1], EventRecord::StaleStableNode { last: a, kpfn });
    assert_eq!(meta.stable_node_cnt(), 0);
    meta.check_invariants().unwrap();
}

#[test]
fn test_chain_wide_hash_propagation() {
    let (mut meta, mut log, a, b) = converged_pair();
    let mut stats = CycleStats::default();
    let opts = opts();
    let node_id = meta.item(b).unwrap().stable_node.unwrap();
    let kpfn = meta.node(node_id).unwrap().pfn;

    // Same frame, new contents: an unstable merge already rewrote the
    // physical page, so the node follows the new hash.
    let new_page = page_of(0x11);
    let new_hash = HashPair::of_page(&new_page);
    scan_one(&mut meta, &mut log, &mut stats, &opts, b, kpfn, &new_page, 2).unwrap();
    assert!(log.is_empty());
    assert_eq!(meta.node(node_id).unwrap().page_hash, new_hash);
    assert_eq!(meta.item(a).unwrap().old_hash, new_hash);
    assert_eq!(meta.item(b).unwrap().old_hash, new_hash);
    assert_eq!(meta.stable_lookup(new_hash), Some(node_id));
    meta.check_invariants().unwrap();

    // Propagating the already-current hash is a no-op.
    meta.propagate_node_hash(node_id, new_hash).unwrap();
    assert_eq!(meta.stable_lookup(new_hash), Some(node_id));
    meta.check_invariants().unwrap();
}

#[test]
fn test_volatility_scoring() {
    let mut meta = MergeMeta::new(256);
    let mut log = EventLog::new();
    let mut stats = CycleStats::default();
    let opts = EngineOptions {
        skip_opt: false,
        ..EngineOptions::default()
    };
    let key = PageKey::new(1, 0x1000);

    // First sight: null old hash suppresses the churn bump.
    scan_one(&mut meta, &mut log, &mut stats, &opts, key, 5, &page_of(1), 0).unwrap();
    assert_eq!(meta.item(key).unwrap().volatility_score, 0);
    // Changed contents bump the score.
    scan_one(&mut meta, &mut log, &mut stats, &opts, key, 5, &page_of(2), 1).unwrap();
    assert_eq!(meta.item(key).unwrap().volatility_score, 1);
    // Stable contents decrement back towards zero.
    meta.clear_unstable().unwrap();
    scan_one(&mut meta, &mut log, &mut stats, &opts, key, 5, &page_of(2), 2).unwrap();
    assert_eq!(meta.item(key).unwrap().volatility_score, 0);
    assert_eq!(meta.item(key).unwrap().state, ItemState::Unstable);
}

#[test]
fn test_legacy_path_keeps_score_quiet() {
    let mut meta = MergeMeta::new(256);
    let mut log = EventLog::new();
    let mut stats = CycleStats::default();
    let opts = EngineOptions {
        legacy_merge: true,
        ..EngineOptions::default()
    };
    let key = PageKey::new(1, 0x1000);
    scan_one(&mut meta, &mut log, &mut stats, &opts, key, 5, &page_of(1), 0).unwrap();
    scan_one(&mut meta, &mut log, &mut stats, &opts, key, 5, &page_of(2), 1).unwrap();
    let item = meta.item(key).unwrap();
    assert_eq!(item.volatility_score, 0);
    assert_eq!(item.age, 0);
}

fn error_table_region(
    host: &mut Connection,
    records: &[EventRecord],
) -> ErrorTableDesc {
    let mut log = EventLog::new();
    for r in records {
        log.push(*r);
    }
    let mut bytes = log.as_bytes().to_vec();
    // The engine reads in page granules; pad the window out.
    bytes.resize(bytes.len().div_ceil(PAGE_SIZE).max(1) * PAGE_SIZE, 0);
    let region = host.register(bytes).unwrap();
    ErrorTableDesc {
        total_cnt: records.len() as i32,
        windows: vec![ErrorWindowDesc {
            rkey: region.rkey as u64,
            base_addr: region.addr,
        }],
    }
}

#[test]
fn test_reconcile_empty_error_table_is_noop() {
    let (mut meta, log, a, b) = converged_pair();
    let (_host, e) = ram_pair();
    let mut conn = Connection::new(Box::new(e));
    let before_items = meta.item_cnt();
    meta.unstable_insert(HashPair::of_page(&page_of(9)), PageKey::new(3, 0x3000));
    meta.touch(PageKey::new(3, 0x3000), 1, 1);
    meta.item_mut(PageKey::new(3, 0x3000)).unwrap().state = ItemState::Unstable;

    let mut state = ScanState {
        meta,
        log,
        stats: CycleStats::default(),
        cycle: 2,
    };
    let et = ErrorTableDesc::default();
    reconcile::run(&mut conn, &et, &mut state, &opts()).unwrap();
    // Only the unstable index was cleared.
    assert_eq!(state.meta.unstable_cnt(), 0);
    assert_eq!(state.meta.item_cnt(), before_items + 1);
    assert_eq!(state.meta.item(a).unwrap().state, ItemState::Stable);
    assert_eq!(state.meta.item(b).unwrap().state, ItemState::Stable);
    state.meta.check_invariants().unwrap();
}

#[test]
fn test_reconcile_unstable_merge_rejection() {
    let (meta, log, a, b) = converged_pair();
    let (h, e) = ram_pair();
    let mut host = Connection::new(Box::new(h));
    let mut conn = Connection::new(Box::new(e));
    let et = error_table_region(&mut host, &[EventRecord::HostMergeTwoFailed { from: b, to: a }]);

    let mut state = ScanState {
        meta,
        log,
        stats: CycleStats::default(),
        cycle: 2,
    };
    reconcile::run(&mut conn, &et, &mut state, &opts()).unwrap();
    assert_eq!(state.meta.stable_node_cnt(), 0);
    for key in [a, b] {
        let item = state.meta.item(key).unwrap();
        assert_eq!(item.state, ItemState::Volatile);
        assert_eq!(item.volatility_score, 1);
    }
    state.meta.check_invariants().unwrap();
}

#[test]
fn test_reconcile_stable_merge_rejection() {
    // Three items converged on one node; the host rejects the third.
    let (mut meta, mut log, _a, b) = converged_pair();
    let mut stats = CycleStats::default();
    let c = PageKey::new(2, 0x9000);
    let page = page_of(0x5a);
    let node_id = meta.item(b).unwrap().stable_node.unwrap();
    let kpfn = meta.node(node_id).unwrap().pfn;
    scan_one(&mut meta, &mut log, &mut stats, &opts(), c, kpfn, &page, 2).unwrap();
    meta.clear_unstable().unwrap();
    scan_one(&mut meta, &mut log, &mut stats, &opts(), c, kpfn, &page, 3).unwrap();
    assert_eq!(meta.node(node_id).unwrap().shared_cnt, 3);
    log.clear();

    let (h, e) = ram_pair();
    let mut host = Connection::new(Box::new(h));
    let mut conn = Connection::new(Box::new(e));
    let et = error_table_region(&mut host, &[EventRecord::HostMergeOneFailed { from: c, kpfn }]);
    let mut state = ScanState {
        meta,
        log,
        stats: CycleStats::default(),
        cycle: 4,
    };
    reconcile::run(&mut conn, &et, &mut state, &opts()).unwrap();
    let item = state.meta.item(c).unwrap();
    assert_eq!(item.state, ItemState::Volatile);
    assert_eq!(item.volatility_score, 1);
    assert_eq!(state.meta.node(node_id).unwrap().shared_cnt, 2);
    state.meta.check_invariants().unwrap();
}

#[test]
fn test_reconcile_host_stale_node_is_invariant_fault() {
    let (meta, log, a, _b) = converged_pair();
    let (h, e) = ram_pair();
    let mut host = Connection::new(Box::new(h));
    let mut conn = Connection::new(Box::new(e));
    let et = error_table_region(
        &mut host,
        &[EventRecord::HostStaleStableNode { last: a, kpfn: 11 }],
    );
    let mut state = ScanState {
        meta,
        log,
        stats: CycleStats::default(),
        cycle: 2,
    };
    let err = reconcile::run(&mut conn, &et, &mut state, &opts()).unwrap_err();
    assert!(err.is_invariant());
}

#[test]
fn test_prune_detaches_and_logs() {
    let (mut meta, mut log, a, b) = converged_pair();
    let kpfn = meta.node(meta.item(b).unwrap().stable_node.unwrap()).unwrap().pfn;
    // Nobody re-exported a or b; with a zero margin they go away at cycle 3
    // and the emptied node is announced stale.
    let pruned = meta.prune(3, 0, &mut log).unwrap();
    assert_eq!(pruned, 2);
    assert_eq!(meta.item_cnt(), 0);
    assert_eq!(meta.stable_node_cnt(), 0);
    let recs: Vec<EventRecord> = log.iter().map(|r| r.unwrap()).collect();
    assert_eq!(recs.len(), 1);
    match recs[0] {
        EventRecord::StaleStableNode { kpfn: k, .. } => assert_eq!(k, kpfn),
        other => panic!("unexpected record {:?}", other),
    }
    meta.check_invariants().unwrap();

    // Below the margin nothing moves.
    let (mut meta, mut log, _, _) = converged_pair();
    assert_eq!(meta.prune(3, 1000, &mut log).unwrap(), 0);
    assert_eq!(meta.item_cnt(), 2);
}

#[test]
fn test_unstable_collision_is_a_miss() {
    let mut meta = MergeMeta::new(256);
    let hash = HashPair::of_page(&page_of(1));
    let first = PageKey::new(1, 0x1000);
    let second = PageKey::new(1, 0x2000);
    assert!(meta.unstable_insert(hash, first));
    assert!(!meta.unstable_insert(hash, second));
    assert_eq!(meta.unstable_take(hash), Some(first));
    assert_eq!(meta.unstable_take(hash), None);
}

#[test]
fn test_prehash_matches_on_demand() {
    let ph = PreHash::spawn().unwrap();
    let pages = Arc::new({
        let mut v = Vec::with_capacity(4 * PAGE_SIZE);
        for i in 0..4u8 {
            v.extend_from_slice(&page_of(i));
        }
        v
    });

    // Hand the worker only the first two pages, like a stripe interrupted
    // by STOP after two iterations.
    ph.start(pages.clone(), 0, 2);
    while ph.lookup(1).is_none() {
        std::thread::yield_now();
    }
    for idx in 0..2 {
        let expect = HashPair::of_page(&pages[idx * PAGE_SIZE..(idx + 1) * PAGE_SIZE]);
        assert_eq!(ph.lookup(idx), Some(expect));
    }
    // Pages beyond the completed index miss; callers compute them on
    // demand with the same function the worker uses.
    for idx in 2..4 {
        assert_eq!(ph.lookup(idx), None);
    }

    // A new stripe preempts and replaces the old one.
    let other = Arc::new(page_of(0xee));
    ph.start(other.clone(), 0, 1);
    while ph.lookup(0) != Some(HashPair::of_page(&other)) {
        std::thread::yield_now();
    }
}
