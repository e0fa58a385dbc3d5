use samepage_base::{inv, HashPair, PageKey, Result};
use samepage_proto::{EventLog, EventRecord};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

/// Per-page lifecycle. `None` exists only transiently while an item is
/// being rewired; the worker must never observe it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ItemState {
    None,
    Volatile,
    Unstable,
    Stable,
}

/// Persistent record for one tracked virtual page.
#[derive(Clone, Debug)]
pub struct RmapItem {
    pub key: PageKey,
    pub state: ItemState,
    /// Frame observed in the most recent shadow page table.
    pub pfn: u64,
    /// Frame the page had before its last stable linkage.
    pub old_pfn: u64,
    /// Hash pair observed last cycle, or the null pair.
    pub old_hash: HashPair,
    pub age: u16,
    pub last_access: u32,
    pub volatility_score: u16,
    pub skip_cnt: u16,
    /// Present exactly when `state == Stable`.
    pub stable_node: Option<NodeId>,
}

impl RmapItem {
    fn new(key: PageKey) -> RmapItem {
        RmapItem {
            key,
            state: ItemState::Volatile,
            pfn: 0,
            old_pfn: 0,
            old_hash: HashPair::NULL,
            age: 0,
            last_access: 0,
            volatility_score: 0,
            skip_cnt: 0,
            stable_node: None,
        }
    }
}

/// Arena handle for a stable node. Chains are threaded through handles so
/// the HEAD-swap surgery needs no aliased pointers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChainRole {
    Head,
    Chain,
}

/// One physical frame the engine believes is shared. Nodes with the same
/// hash pair that saturated independently are threaded on a doubly-linked
/// chain; only the HEAD sits in the stable index.
#[derive(Clone, Debug)]
pub struct StableNode {
    pub page_hash: HashPair,
    pub shared_cnt: i32,
    pub pfn: u64,
    pub sharers: BTreeSet<PageKey>,
    pub role: ChainRole,
    pub next: Option<NodeId>,
    pub prev: Option<NodeId>,
}

#[derive(Debug, Default)]
struct NodeArena {
    slots: Vec<Option<StableNode>>,
    free: Vec<NodeId>,
}

impl NodeArena {
    fn alloc(&mut self, node: StableNode) -> NodeId {
        if let Some(id) = self.free.pop() {
            self.slots[id.0 as usize] = Some(node);
            id
        } else {
            self.slots.push(Some(node));
            NodeId((self.slots.len() - 1) as u32)
        }
    }

    fn get(&self, id: NodeId) -> Option<&StableNode> {
        self.slots.get(id.0 as usize)?.as_ref()
    }

    fn get_mut(&mut self, id: NodeId) -> Option<&mut StableNode> {
        self.slots.get_mut(id.0 as usize)?.as_mut()
    }

    fn release(&mut self, id: NodeId) -> Option<StableNode> {
        let node = self.slots.get_mut(id.0 as usize)?.take();
        if node.is_some() {
            self.free.push(id);
        }
        node
    }

    fn live(&self) -> impl Iterator<Item = (NodeId, &StableNode)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|n| (NodeId(i as u32), n)))
    }

    fn live_cnt(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

/// All persistent merge metadata of one engine. Exclusively owned: between
/// cycles by the serve loop, during a cycle by the compare-and-merge
/// worker. Nothing here is shared or locked.
#[derive(Debug)]
pub struct MergeMeta {
    items: BTreeMap<PageKey, RmapItem>,
    stable_index: HashMap<HashPair, NodeId>,
    unstable_index: HashMap<HashPair, PageKey>,
    arena: NodeArena,
    max_page_sharing: i32,
}

impl MergeMeta {
    pub fn new(max_page_sharing: usize) -> MergeMeta {
        MergeMeta {
            items: BTreeMap::new(),
            stable_index: HashMap::new(),
            unstable_index: HashMap::new(),
            arena: NodeArena::default(),
            max_page_sharing: max_page_sharing as i32,
        }
    }

    pub fn item_cnt(&self) -> usize {
        self.items.len()
    }

    pub fn stable_node_cnt(&self) -> usize {
        self.arena.live_cnt()
    }

    pub fn unstable_cnt(&self) -> usize {
        self.unstable_index.len()
    }

    pub fn item(&self, key: PageKey) -> Option<&RmapItem> {
        self.items.get(&key)
    }

    pub fn item_mut(&mut self, key: PageKey) -> Option<&mut RmapItem> {
        self.items.get_mut(&key)
    }

    pub fn node(&self, id: NodeId) -> Option<&StableNode> {
        self.arena.get(id)
    }

    /// Find-or-create the item for a map entry, stamping the cycle and the
    /// currently observed frame.
    pub fn touch(&mut self, key: PageKey, pfn: u64, cycle: u32) {
        let item = self.items.entry(key).or_insert_with(|| {
            debug!("new rmap item: {}", key);
            RmapItem::new(key)
        });
        item.last_access = cycle;
        item.pfn = pfn;
    }

    /// First non-saturated node for this hash pair: the HEAD if it has
    /// room, else the first chain node with room, else none.
    pub fn stable_lookup(&self, hash: HashPair) -> Option<NodeId> {
        let mut cursor = Some(*self.stable_index.get(&hash)?);
        while let Some(id) = cursor {
            let node = self.arena.get(id)?;
            if node.shared_cnt < self.max_page_sharing {
                return Some(id);
            }
            cursor = node.next;
        }
        None
    }

    /// Insert a fresh node for `hash`. If the bucket already has a HEAD the
    /// node is appended to its chain tail; otherwise it becomes the HEAD.
    pub fn insert_stable_node(&mut self, hash: HashPair, pfn: u64) -> Result<NodeId> {
        let node = StableNode {
            page_hash: hash,
            shared_cnt: 0,
            pfn,
            sharers: BTreeSet::new(),
            role: ChainRole::Head,
            next: None,
            prev: None,
        };
        let id = self.arena.alloc(node);
        if let Some(&head) = self.stable_index.get(&hash) {
            let mut tail = head;
            while let Some(next) = self
                .arena
                .get(tail)
                .ok_or_else(|| inv("chain walk reached freed node"))?
                .next
            {
                tail = next;
            }
            let tail_node = self
                .arena
                .get_mut(tail)
                .ok_or_else(|| inv("chain tail freed during insert"))?;
            tail_node.next = Some(id);
            let node = self
                .arena
                .get_mut(id)
                .ok_or_else(|| inv("fresh node vanished from the arena"))?;
            node.role = ChainRole::Chain;
            node.prev = Some(tail);
        } else {
            self.stable_index.insert(hash, id);
        }
        Ok(id)
    }

    /// Link an item into a stable node: item state, hash, and frame all
    /// move to the node's view of the world.
    pub fn attach(&mut self, id: NodeId, key: PageKey) -> Result<(u64, i32)> {
        let (node_hash, node_pfn) = {
            let node = self.arena.get(id).ok_or_else(|| inv("attach to freed node"))?;
            (node.page_hash, node.pfn)
        };
        let item = self
            .items
            .get_mut(&key)
            .ok_or_else(|| inv("attach of unknown item"))?;
        match item.state {
            ItemState::None | ItemState::Stable => {
                return Err(inv("cannot insert to stable node: invalid item state"));
            }
            ItemState::Volatile | ItemState::Unstable => {}
        }
        item.state = ItemState::Stable;
        item.old_hash = node_hash;
        item.old_pfn = item.pfn;
        item.pfn = node_pfn;
        item.stable_node = Some(id);
        let node = self
            .arena
            .get_mut(id)
            .ok_or_else(|| inv("attach to freed node"))?;
        node.shared_cnt += 1;
        node.sharers.insert(key);
        Ok((node_pfn, node.shared_cnt))
    }

    /// Unlink an item from a node; the item itself is not rewritten (pair
    /// with `reset_item`). Returns the node's remaining share count.
    pub fn detach(&mut self, id: NodeId, key: PageKey) -> Result<i32> {
        let node = self
            .arena
            .get_mut(id)
            .ok_or_else(|| inv("detach from freed node"))?;
        node.shared_cnt -= 1;
        node.sharers.remove(&key);
        Ok(node.shared_cnt)
    }

    /// Return an item to Volatile: its own pre-merge frame comes back, its
    /// hash history is forgotten.
    pub fn reset_item(&mut self, key: PageKey) -> Result<()> {
        let item = self
            .items
            .get_mut(&key)
            .ok_or_else(|| inv("reset of unknown item"))?;
        item.state = ItemState::Volatile;
        item.pfn = item.old_pfn;
        item.old_pfn = 0;
        item.old_hash = HashPair::NULL;
        item.stable_node = None;
        Ok(())
    }

    /// Free a node that holds no items any more, with the chain surgery:
    /// a HEAD hands the index entry to its first chain node, a CHAIN node
    /// is spliced out of its neighbors.
    pub fn remove_node_no_item(&mut self, id: NodeId) -> Result<StableNode> {
        let (role, prev, next, hash) = {
            let node = self
                .arena
                .get(id)
                .ok_or_else(|| inv("removing freed stable node"))?;
            (node.role, node.prev, node.next, node.page_hash)
        };
        match role {
            ChainRole::Head => {
                if prev.is_some() {
                    return Err(inv("HEAD node with a chain predecessor"));
                }
                if self.stable_index.get(&hash) != Some(&id) {
                    return Err(inv("HEAD node not owning its index bucket"));
                }
                self.stable_index.remove(&hash);
                if let Some(next_id) = next {
                    let next_node = self
                        .arena
                        .get_mut(next_id)
                        .ok_or_else(|| inv("chain successor freed"))?;
                    next_node.role = ChainRole::Head;
                    next_node.prev = None;
                    self.stable_index.insert(hash, next_id);
                }
            }
            ChainRole::Chain => {
                let prev_id = prev.ok_or_else(|| inv("CHAIN node with no predecessor"))?;
                let prev_node = self
                    .arena
                    .get_mut(prev_id)
                    .ok_or_else(|| inv("chain predecessor freed"))?;
                prev_node.next = next;
                if let Some(next_id) = next {
                    let next_node = self
                        .arena
                        .get_mut(next_id)
                        .ok_or_else(|| inv("chain successor freed"))?;
                    next_node.prev = Some(prev_id);
                }
            }
        }
        self.arena
            .release(id)
            .ok_or_else(|| inv("stable node vanished during removal"))
    }

    /// Free an emptied node and tell the host the frame went stale.
    pub fn remove_stale_node_and_log(
        &mut self,
        id: NodeId,
        last: PageKey,
        log: &mut EventLog,
    ) -> Result<()> {
        let kpfn = self
            .arena
            .get(id)
            .ok_or_else(|| inv("stale removal of freed node"))?
            .pfn;
        log.push(EventRecord::StaleStableNode { last, kpfn });
        self.remove_node_no_item(id)?;
        Ok(())
    }

    /// The page contents changed under an unbroken mapping: re-key the
    /// whole chain to the new hash. Walks to the HEAD, pulls the index
    /// entry, rewrites every chain node's hash and every sharer's
    /// `old_hash`, and re-inserts the HEAD. Idempotent for the current
    /// hash.
    pub fn propagate_node_hash(&mut self, id: NodeId, new_hash: HashPair) -> Result<()> {
        let mut head = id;
        loop {
            let node = self
                .arena
                .get(head)
                .ok_or_else(|| inv("hash propagation into freed node"))?;
            match (node.role, node.prev) {
                (ChainRole::Head, _) => break,
                (ChainRole::Chain, Some(prev)) => head = prev,
                (ChainRole::Chain, None) => {
                    return Err(inv("CHAIN node with no predecessor"));
                }
            }
        }
        let old_hash = self
            .arena
            .get(head)
            .ok_or_else(|| inv("chain HEAD freed during propagation"))?
            .page_hash;
        if self.stable_index.get(&old_hash) != Some(&head) {
            return Err(inv("HEAD node not owning its index bucket"));
        }
        self.stable_index.remove(&old_hash);

        let mut cursor = Some(head);
        while let Some(cur) = cursor {
            let sharers = {
                let node = self
                    .arena
                    .get_mut(cur)
                    .ok_or_else(|| inv("hash propagation into freed node"))?;
                node.page_hash = new_hash;
                node.sharers.clone()
            };
            for key in sharers {
                let item = self
                    .items
                    .get_mut(&key)
                    .ok_or_else(|| inv("sharer missing during hash propagation"))?;
                if item.state != ItemState::Stable {
                    return Err(inv("non-stable sharer during hash propagation"));
                }
                item.old_hash = new_hash;
            }
            cursor = self
                .arena
                .get(cur)
                .ok_or_else(|| inv("hash propagation into freed node"))?
                .next;
        }

        if let Some(displaced) = self.stable_index.insert(new_hash, head) {
            debug!("stable index bucket displaced node {:?}", displaced);
        }
        Ok(())
    }

    /// Take the unstable partner for this hash, if one collided earlier in
    /// the cycle. Removal on hit mirrors promotion consuming the bucket.
    pub fn unstable_take(&mut self, hash: HashPair) -> Option<PageKey> {
        self.unstable_index.remove(&hash)
    }

    /// Try to park an item in the unstable index. A colliding occupant is
    /// kept and the insertion reports a miss.
    pub fn unstable_insert(&mut self, hash: HashPair, key: PageKey) -> bool {
        use std::collections::hash_map::Entry;
        match self.unstable_index.entry(hash) {
            Entry::Occupied(_) => false,
            Entry::Vacant(v) => {
                v.insert(key);
                true
            }
        }
    }

    /// Drop the whole unstable index; every parked item reverts to
    /// Volatile. Runs at the top of each cycle.
    pub fn clear_unstable(&mut self) -> Result<()> {
        let keys: Vec<PageKey> = self.unstable_index.drain().map(|(_, k)| k).collect();
        for key in keys {
            let item = self
                .items
                .get_mut(&key)
                .ok_or_else(|| inv("unstable index names unknown item"))?;
            if item.state != ItemState::Unstable {
                return Err(inv("unstable index names item in wrong state"));
            }
            item.state = ItemState::Volatile;
        }
        Ok(())
    }

    /// Drop items the host stopped exporting: anything last seen more than
    /// one cycle ago, once more than `margin` of them have piled up.
    pub fn prune(&mut self, cycle: u32, margin: usize, log: &mut EventLog) -> Result<usize> {
        let mut stale: Vec<PageKey> = Vec::new();
        for (key, item) in &self.items {
            if item.last_access + 1 < cycle {
                match item.state {
                    ItemState::None | ItemState::Unstable => {
                        return Err(inv("invalid state for unaccessed item"));
                    }
                    ItemState::Stable => {
                        if item.stable_node.is_none() {
                            return Err(inv("stable item without node during prune"));
                        }
                    }
                    ItemState::Volatile => {}
                }
                stale.push(*key);
            }
        }
        if stale.len() <= margin {
            return Ok(0);
        }
        let cnt = stale.len();
        for key in stale {
            let node_id = self.items.get(&key).and_then(|i| i.stable_node);
            if let Some(id) = node_id {
                if self.detach(id, key)? == 0 {
                    self.remove_stale_node_and_log(id, key, log)?;
                }
            }
            self.items.remove(&key);
        }
        debug!("pruned {} items from the rmap", cnt);
        Ok(cnt)
    }

    /// Verify the reachable-state invariants. Used by tests after every
    /// mutation-heavy sequence; cheap enough to run on demand in the field.
    pub fn check_invariants(&self) -> Result<()> {
        // Stable items sit in exactly one node's sharer set and agree with
        // it on hash and frame.
        for (key, item) in &self.items {
            let holders = self
                .arena
                .live()
                .filter(|(_, n)| n.sharers.contains(key))
                .count();
            match item.state {
                ItemState::Stable => {
                    let id = item
                        .stable_node
                        .ok_or_else(|| inv("stable item without node"))?;
                    let node = self.arena.get(id).ok_or_else(|| inv("stable item names freed node"))?;
                    if holders != 1 || !node.sharers.contains(key) {
                        return Err(inv("stable item not in exactly one sharer set"));
                    }
                    if item.old_hash != node.page_hash {
                        return Err(inv("stable item hash diverged from node"));
                    }
                    if item.pfn != node.pfn {
                        return Err(inv("stable item frame diverged from node"));
                    }
                }
                _ => {
                    if holders != 0 || item.stable_node.is_some() {
                        return Err(inv("non-stable item referenced by a node"));
                    }
                }
            }
        }
        // Node counts and chain shape.
        for (id, node) in self.arena.live() {
            if node.shared_cnt as usize != node.sharers.len() {
                return Err(inv("shared_cnt out of sync with sharer set"));
            }
            if node.shared_cnt > self.max_page_sharing {
                return Err(inv("shared_cnt above the sharing limit"));
            }
            match node.role {
                ChainRole::Head => {
                    if node.prev.is_some() {
                        return Err(inv("HEAD with a predecessor"));
                    }
                }
                ChainRole::Chain => {
                    // Walk prev links to a HEAD with the same hash.
                    let mut cur = id;
                    loop {
                        let n = self
                            .arena
                            .get(cur)
                            .ok_or_else(|| inv("chain walk reached freed node"))?;
                        match (n.role, n.prev) {
                            (ChainRole::Head, _) => break,
                            (ChainRole::Chain, Some(p)) => cur = p,
                            (ChainRole::Chain, None) => {
                                return Err(inv("CHAIN node with no path to a HEAD"));
                            }
                        }
                    }
                    let head = self
                        .arena
                        .get(cur)
                        .ok_or_else(|| inv("chain walk reached freed node"))?;
                    if head.page_hash != node.page_hash {
                        return Err(inv("chain node hash diverged from its HEAD"));
                    }
                }
            }
        }
        // Index entries point at HEADs keyed by their own hash.
        for (hash, id) in &self.stable_index {
            let node = self
                .arena
                .get(*id)
                .ok_or_else(|| inv("index entry names freed node"))?;
            if node.role != ChainRole::Head || node.page_hash != *hash {
                return Err(inv("index entry not a HEAD under its own hash"));
            }
        }
        Ok(())
    }
}
