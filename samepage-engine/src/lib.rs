// The remote half of the scan cycle: persistent merge metadata, the
// compare-and-merge state machine, the pre-hash pipeline, the scan driver,
// and the per-connection serve loop. Only the compare-and-merge worker
// mutates merge metadata; cycle boundaries are ownership handoffs over
// channels rather than shared locks.

mod driver;
mod engine;
mod merge;
mod meta;
mod prehash;
mod reconcile;
mod worker;

#[cfg(test)]
mod test;

pub use engine::Engine;
pub use meta::{ChainRole, ItemState, MergeMeta, NodeId, RmapItem, StableNode};
pub use prehash::{PreHash, PRE_HASH_NUM};

pub const MAX_PAGE_SHARING: usize = 256;
pub const RMAP_PRUNE_MARGIN: usize = 1000;

/// Tunables of one engine instance. The reference binary flips these from
/// the command line; tests lower `max_page_sharing` to force chains.
#[derive(Clone, Debug)]
pub struct EngineOptions {
    /// Volatility-aware skipping of recently-churning items.
    pub skip_opt: bool,
    /// Background pre-hashing of the next batch.
    pub pre_hash_opt: bool,
    /// Use the legacy compare-and-merge path: no volatility scoring, which
    /// also forces skipping and pre-hashing off.
    pub legacy_merge: bool,
    pub max_page_sharing: usize,
    pub rmap_prune_margin: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            skip_opt: true,
            pre_hash_opt: true,
            legacy_merge: false,
            max_page_sharing: MAX_PAGE_SHARING,
            rmap_prune_margin: RMAP_PRUNE_MARGIN,
        }
    }
}

impl EngineOptions {
    pub(crate) fn effective_skip(&self) -> bool {
        self.skip_opt && !self.legacy_merge
    }

    pub(crate) fn effective_pre_hash(&self) -> bool {
        self.pre_hash_opt && !self.legacy_merge
    }
}

/// Observational counters for one scan cycle, reported at cycle end and
/// reset. Nothing reads these for control flow.
#[derive(Clone, Copy, Debug, Default)]
pub struct CycleStats {
    pub scanned: u64,
    pub accessed: u64,
    pub skipped: u64,
    pub volatile_items: u64,
    pub highly_volatile_stable_merged: u64,
    pub highly_volatile_unstable_merged: u64,
    pub broken_merges: u64,
    pub unstable_collisions: u64,
    pub prehash_hits: u64,
    pub prehash_misses: u64,
    pub pruned_items: u64,
}
