//! The node arena: every container the runtime allocates lives here.
//!
//! Arrays, text, binaries, contexts, paramlists, pairings, and handles
//! are all one fixed-size [`Node`] in a slotted arena with a free list:
//! the Rust rendition of the original's fixed-size node pools. Nodes are
//! born *unmanaged* and tracked in the manuals registry: the creator
//! either frees them deterministically or calls [`Heap::manage`], after
//! which only the collector may free them.
//!
//! The collector is a precise mark-and-sweep: callers provide the root
//! set (frames, data stack, named globals); the manuals and guarded
//! registries are always roots. The uniform node shape lets the mark
//! phase enumerate referenced nodes per variant without any per-kind
//! dispatch tables.

use std::collections::BTreeMap;
use std::fmt;

use crate::{
    cell::{Cell, ContextKind, Param, Value},
    resource::MemTracker,
    types::{ActionFlags, Array, Binary, Context, Dispatcher, Handle, ParamList, Text},
    unwind::RunResult,
};

/// Index of a node in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct NodeId(u32);

impl NodeId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Per-node flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct NodeFlags(u16);

impl NodeFlags {
    pub const NONE: Self = Self(0);
    /// GC owns this node; manual free is forbidden.
    pub const MANAGED: Self = Self(1 << 0);
    /// Shallow immutability.
    pub const FROZEN: Self = Self(1 << 1);
    /// Deep immutability (set on every reachable array at freeze time).
    pub const FROZEN_DEEP: Self = Self(1 << 2);
    /// This keylist is shared by several contexts; expansion must fork.
    pub const KEYLIST_SHARED: Self = Self(1 << 3);
    /// Frame context whose activation ended; reads through stale
    /// bindings report an expired-frame error.
    pub const FRAME_EXPIRED: Self = Self(1 << 4);
    /// Mold hint: array renders with a trailing newline.
    pub const NEWLINE_AT_TAIL: Self = Self(1 << 5);

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Payload of an arena node.
#[derive(Debug)]
pub(crate) enum NodeData {
    Array(Array),
    ParamList(ParamList),
    Context(Context),
    Text(Text),
    Binary(Binary),
    Pairing([Cell; 2]),
    Handle(Handle),
}

impl NodeData {
    /// Static name for stats breakdowns.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Array(_) => "Array",
            Self::ParamList(_) => "ParamList",
            Self::Context(_) => "Context",
            Self::Text(_) => "Text",
            Self::Binary(_) => "Binary",
            Self::Pairing(_) => "Pairing",
            Self::Handle(_) => "Handle",
        }
    }

    /// Approximate heap bytes: the node itself plus out-of-line buffers.
    pub fn estimate_size(&self) -> usize {
        let inline = size_of::<Node>();
        inline
            + match self {
                Self::Array(a) => a.capacity_bytes(),
                Self::ParamList(p) => p.capacity_bytes(),
                Self::Context(c) => c.capacity_bytes(),
                Self::Text(t) => t.capacity_bytes(),
                Self::Binary(b) => b.capacity_bytes(),
                Self::Pairing(_) | Self::Handle(_) => 0,
            }
    }

    /// Pushes every node this one references, for the mark phase.
    fn child_refs(&self, out: &mut Vec<NodeId>) {
        match self {
            Self::Array(a) => {
                for cell in a.cells() {
                    cell.node_refs(out);
                }
            }
            Self::ParamList(p) => {
                for cell in p.cells() {
                    cell.node_refs(out);
                }
                out.push(p.underlying);
                out.push(p.details);
                if let Some(facade) = p.facade {
                    out.push(facade);
                }
                if let Some(meta) = p.meta {
                    out.push(meta);
                }
            }
            Self::Context(c) => {
                out.push(c.keylist);
                if let Some(phase) = c.phase {
                    out.push(phase);
                }
                for cell in c.cells() {
                    cell.node_refs(out);
                }
            }
            Self::Pairing(cells) => {
                for cell in cells {
                    cell.node_refs(out);
                }
            }
            Self::Text(_) | Self::Binary(_) | Self::Handle(_) => {}
        }
    }
}

#[derive(Debug)]
pub(crate) struct Node {
    pub flags: NodeFlags,
    pub data: NodeData,
}

/// Result of one collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CollectReport {
    pub freed_nodes: usize,
    pub freed_bytes: usize,
}

/// How many recently expanded nodes to remember for the doubling policy.
const EXPANSION_RING: usize = 8;

/// The arena.
#[derive(Debug)]
pub(crate) struct Heap<T: MemTracker> {
    entries: Vec<Option<Node>>,
    free: Vec<NodeId>,
    /// Unmanaged nodes awaiting free-or-manage, in creation order so the
    /// fail path can truncate back to a snapshot.
    manuals: Vec<NodeId>,
    /// Transient GC-safety roots (push before allocating, drop after).
    guarded: Vec<NodeId>,
    tracker: T,
    /// Allocations allowed before the next automatic collection.
    pub ballast: u32,
    allocs_since_gc: u32,
    /// Ring of recently expanded nodes; a hit means "double, don't nudge".
    recent_expansions: [Option<NodeId>; EXPANSION_RING],
    expansion_cursor: usize,
    /// Debug aid: bypass slot recycling so stale ids stay dead.
    always_malloc: bool,
}

impl<T: MemTracker> Heap<T> {
    pub fn new(tracker: T, ballast: u32, always_malloc: bool) -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
            manuals: Vec::new(),
            guarded: Vec::new(),
            tracker,
            ballast,
            allocs_since_gc: 0,
            recent_expansions: [None; EXPANSION_RING],
            expansion_cursor: 0,
            always_malloc,
        }
    }

    pub fn tracker(&self) -> &T {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut T {
        &mut self.tracker
    }

    /// Allocates an unmanaged node, registering it in the manuals.
    pub fn alloc(&mut self, data: NodeData) -> RunResult<NodeId> {
        self.tracker.on_allocate(|| data.estimate_size())?;
        self.allocs_since_gc += 1;
        let node = Node {
            flags: NodeFlags::NONE,
            data,
        };
        let id = if self.always_malloc {
            None
        } else {
            self.free.pop()
        };
        let id = match id {
            Some(id) => {
                self.entries[id.index()] = Some(node);
                id
            }
            None => {
                let id = NodeId(u32::try_from(self.entries.len()).expect("arena overflow"));
                self.entries.push(Some(node));
                id
            }
        };
        self.manuals.push(id);
        Ok(id)
    }

    pub fn alloc_pairing(&mut self, cells: [Cell; 2]) -> RunResult<NodeId> {
        self.alloc(NodeData::Pairing(cells))
    }

    /// Allocates a context node whose archetype points at itself.
    ///
    /// Construction cannot know the node id, so the archetype goes in
    /// with a placeholder and is patched once the slot is assigned.
    pub fn alloc_context(&mut self, kind: ContextKind, keylist: NodeId, len: usize) -> RunResult<NodeId> {
        let placeholder = NodeId(u32::MAX);
        let id = self.alloc(NodeData::Context(Context::with_archetype(kind, keylist, placeholder, len)))?;
        *self.context_mut(id).archetype_mut() = Cell::of(Value::Context(kind, id));
        Ok(id)
    }

    /// Allocates a paramlist node with a self-pointing archetype.
    ///
    /// `underlying` of `None` means the paramlist is its own underlying
    /// (a primitive action, not a composition).
    pub fn alloc_paramlist(
        &mut self,
        params: &[Param],
        underlying: Option<NodeId>,
        dispatcher: Dispatcher,
        details: NodeId,
        flags: ActionFlags,
    ) -> RunResult<NodeId> {
        let placeholder = NodeId(u32::MAX);
        let id = self.alloc(NodeData::ParamList(ParamList::new(
            placeholder,
            params,
            placeholder,
            dispatcher,
            details,
            flags,
        )))?;
        let under = underlying.unwrap_or(id);
        self.paramlist_mut(id).patch_identity(id, under);
        Ok(id)
    }

    /// Hands an unmanaged node to the collector.
    ///
    /// Usually the node is the most recent allocation; managing an older
    /// node mid-registry is legal but pays a backward scan.
    pub fn manage(&mut self, id: NodeId) {
        if self.node(id).flags.contains(NodeFlags::MANAGED) {
            return;
        }
        let pos = self
            .manuals
            .iter()
            .rposition(|&m| m == id)
            .expect("manage of node missing from manuals");
        self.manuals.swap_remove(pos);
        self.set_flag(id, NodeFlags::MANAGED);
    }

    pub fn is_managed(&self, id: NodeId) -> bool {
        self.node(id).flags.contains(NodeFlags::MANAGED)
    }

    /// Frees an unmanaged node deterministically.
    pub fn free_manual(&mut self, id: NodeId) {
        assert!(!self.is_managed(id), "manual free of a managed node");
        let pos = self
            .manuals
            .iter()
            .rposition(|&m| m == id)
            .expect("free of node missing from manuals");
        self.manuals.swap_remove(pos);
        self.free_slot(id);
    }

    fn free_slot(&mut self, id: NodeId) {
        let node = self.entries[id.index()].take().expect("double free of arena node");
        self.tracker.on_free(|| node.data.estimate_size());
        if let NodeData::Handle(handle) = &node.data
            && let Some(cleaner) = handle.cleaner
        {
            cleaner(handle.data, handle.len);
        }
        if !self.always_malloc {
            self.free.push(id);
        }
    }

    // --- guarded-node protocol -------------------------------------------

    pub fn guard(&mut self, id: NodeId) {
        self.guarded.push(id);
    }

    /// Drops the most recent guard of `id` (push/drop discipline).
    pub fn unguard(&mut self, id: NodeId) {
        let pos = self
            .guarded
            .iter()
            .rposition(|&g| g == id)
            .expect("unguard of node that is not guarded");
        self.guarded.remove(pos);
    }

    pub fn guarded_len(&self) -> usize {
        self.guarded.len()
    }

    pub fn truncate_guarded(&mut self, len: usize) {
        self.guarded.truncate(len);
    }

    pub fn manuals_len(&self) -> usize {
        self.manuals.len()
    }

    /// Fail cleanup: frees every manual allocated after the snapshot.
    pub fn truncate_manuals(&mut self, len: usize) {
        while self.manuals.len() > len {
            let id = self.manuals.pop().expect("manuals length checked");
            self.free_slot(id);
        }
    }

    // --- accessors --------------------------------------------------------

    pub fn node(&self, id: NodeId) -> &Node {
        self.entries[id.index()].as_ref().expect("access to freed arena node")
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.entries[id.index()].as_mut().expect("access to freed arena node")
    }

    pub fn has_flag(&self, id: NodeId, flag: NodeFlags) -> bool {
        self.node(id).flags.contains(flag)
    }

    pub fn set_flag(&mut self, id: NodeId, flag: NodeFlags) {
        let node = self.node_mut(id);
        node.flags = NodeFlags(node.flags.0 | flag.0);
    }

    pub fn array(&self, id: NodeId) -> &Array {
        match &self.node(id).data {
            NodeData::Array(a) => a,
            other => panic!("expected array node, found {}", other.name()),
        }
    }

    pub fn array_mut(&mut self, id: NodeId) -> &mut Array {
        match &mut self.node_mut(id).data {
            NodeData::Array(a) => a,
            other => panic!("expected array node, found {}", other.name()),
        }
    }

    pub fn text(&self, id: NodeId) -> &Text {
        match &self.node(id).data {
            NodeData::Text(t) => t,
            other => panic!("expected text node, found {}", other.name()),
        }
    }

    pub fn text_mut(&mut self, id: NodeId) -> &mut Text {
        match &mut self.node_mut(id).data {
            NodeData::Text(t) => t,
            other => panic!("expected text node, found {}", other.name()),
        }
    }

    pub fn binary(&self, id: NodeId) -> &Binary {
        match &self.node(id).data {
            NodeData::Binary(b) => b,
            other => panic!("expected binary node, found {}", other.name()),
        }
    }

    pub fn binary_mut(&mut self, id: NodeId) -> &mut Binary {
        match &mut self.node_mut(id).data {
            NodeData::Binary(b) => b,
            other => panic!("expected binary node, found {}", other.name()),
        }
    }

    pub fn context(&self, id: NodeId) -> &Context {
        match &self.node(id).data {
            NodeData::Context(c) => c,
            other => panic!("expected context node, found {}", other.name()),
        }
    }

    pub fn context_mut(&mut self, id: NodeId) -> &mut Context {
        match &mut self.node_mut(id).data {
            NodeData::Context(c) => c,
            other => panic!("expected context node, found {}", other.name()),
        }
    }

    pub fn paramlist(&self, id: NodeId) -> &ParamList {
        match &self.node(id).data {
            NodeData::ParamList(p) => p,
            other => panic!("expected paramlist node, found {}", other.name()),
        }
    }

    pub fn paramlist_mut(&mut self, id: NodeId) -> &mut ParamList {
        match &mut self.node_mut(id).data {
            NodeData::ParamList(p) => p,
            other => panic!("expected paramlist node, found {}", other.name()),
        }
    }

    pub fn pairing(&self, id: NodeId) -> &[Cell; 2] {
        match &self.node(id).data {
            NodeData::Pairing(p) => p,
            other => panic!("expected pairing node, found {}", other.name()),
        }
    }

    pub fn pairing_mut(&mut self, id: NodeId) -> &mut [Cell; 2] {
        match &mut self.node_mut(id).data {
            NodeData::Pairing(p) => p,
            other => panic!("expected pairing node, found {}", other.name()),
        }
    }

    pub fn handle(&self, id: NodeId) -> &Handle {
        match &self.node(id).data {
            NodeData::Handle(h) => h,
            other => panic!("expected handle node, found {}", other.name()),
        }
    }

    /// Key cells of a keylist node, which is an object keylist (array of
    /// params) or an action paramlist.
    pub fn keys_of(&self, keylist: NodeId) -> &[Cell] {
        match &self.node(keylist).data {
            NodeData::Array(a) => a.cells(),
            NodeData::ParamList(p) => p.cells(),
            other => panic!("keylist node is {}", other.name()),
        }
    }

    // --- expansion policy -------------------------------------------------

    /// Records an expansion of `id`; returns true when this node expanded
    /// recently, in which case the caller doubles instead of nudging.
    pub fn note_expansion(&mut self, id: NodeId) -> bool {
        let seen = self.recent_expansions.contains(&Some(id));
        self.recent_expansions[self.expansion_cursor] = Some(id);
        self.expansion_cursor = (self.expansion_cursor + 1) % EXPANSION_RING;
        seen
    }

    // --- frame collapse ---------------------------------------------------

    /// Collapses an ended frame context: argument storage is released,
    /// the archetype stays so stale bindings still name the action.
    pub fn expire_frame(&mut self, varlist: NodeId) {
        self.context_mut(varlist).collapse();
        self.set_flag(varlist, NodeFlags::FRAME_EXPIRED);
    }

    // --- collection -------------------------------------------------------

    pub fn should_collect(&self) -> bool {
        self.allocs_since_gc >= self.ballast
    }

    /// Precise mark-and-sweep.
    ///
    /// `roots` are the caller's roots (frames, data stack, globals, mold
    /// stack); the manuals and guarded registries are appended here so
    /// unmanaged and explicitly protected nodes always survive.
    pub fn collect(&mut self, mut roots: Vec<NodeId>) -> CollectReport {
        roots.extend_from_slice(&self.manuals);
        roots.extend_from_slice(&self.guarded);

        // Mark phase: worklist over a reachability bitmap.
        let mut reachable = vec![false; self.entries.len()];
        let mut work = roots;
        while let Some(id) = work.pop() {
            let idx = id.index();
            if reachable[idx] {
                continue;
            }
            reachable[idx] = true;
            if let Some(node) = &self.entries[idx] {
                node.data.child_refs(&mut work);
            }
        }

        // Sweep phase: free unmarked managed nodes.
        let mut freed_nodes = 0;
        let mut freed_bytes = 0;
        for idx in 0..self.entries.len() {
            if reachable[idx] {
                continue;
            }
            let Some(node) = &self.entries[idx] else { continue };
            if !node.flags.contains(NodeFlags::MANAGED) {
                continue;
            }
            let id = NodeId(u32::try_from(idx).expect("arena index fits u32"));
            freed_bytes += self.node(id).data.estimate_size();
            freed_nodes += 1;
            self.free_slot(id);
        }

        self.allocs_since_gc = 0;
        CollectReport {
            freed_nodes,
            freed_bytes,
        }
    }

    // --- stats ------------------------------------------------------------

    pub fn stats(&self, interned_symbols: usize) -> HeapStats {
        let mut nodes_by_type = BTreeMap::new();
        let mut live_nodes = 0;
        for entry in self.entries.iter().flatten() {
            live_nodes += 1;
            *nodes_by_type.entry(entry.data.name()).or_insert(0) += 1;
        }
        HeapStats {
            live_nodes,
            free_slots: self.free.len(),
            total_slots: self.entries.len(),
            nodes_by_type,
            interned_symbols,
            tracker_bytes: self.tracker.bytes_in_use(),
            tracker_allocations: self.tracker.allocation_count(),
        }
    }
}

/// Snapshot of arena state at a point in time.
///
/// The `nodes_by_type` map uses `BTreeMap` for deterministic iteration
/// order, making snapshots suitable for display and comparison without
/// sort overhead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapStats {
    /// Live nodes, managed and manual alike.
    pub live_nodes: usize,
    /// Recycled slots available for reuse.
    pub free_slots: usize,
    /// Total arena capacity (live + free).
    pub total_slots: usize,
    /// Breakdown of live nodes by payload variant name.
    pub nodes_by_type: BTreeMap<&'static str, usize>,
    /// Symbols interned by the owning machine.
    pub interned_symbols: usize,
    /// Tracked bytes, when the machine's tracker counts them.
    pub tracker_bytes: Option<usize>,
    /// Live allocation count, when the tracker counts it.
    pub tracker_allocations: Option<usize>,
}

impl HeapStats {
    /// Computes `other - self` deltas for every counter.
    #[must_use]
    pub fn diff(&self, other: &Self) -> HeapDiff {
        let mut by_type = BTreeMap::new();
        for (&name, &count) in &self.nodes_by_type {
            let after = other.nodes_by_type.get(name).copied().unwrap_or(0);
            by_type.insert(name, isize_delta(count, after));
        }
        for (&name, &count) in &other.nodes_by_type {
            by_type.entry(name).or_insert_with(|| count as isize);
        }
        HeapDiff {
            live_nodes_delta: isize_delta(self.live_nodes, other.live_nodes),
            total_slots_delta: isize_delta(self.total_slots, other.total_slots),
            nodes_by_type_delta: by_type,
            interned_symbols_delta: isize_delta(self.interned_symbols, other.interned_symbols),
            tracker_bytes_delta: match (self.tracker_bytes, other.tracker_bytes) {
                (Some(b), Some(a)) => Some(isize_delta(b, a)),
                _ => None,
            },
        }
    }
}

/// Difference between two heap snapshots; positive deltas mean growth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapDiff {
    pub live_nodes_delta: isize,
    pub total_slots_delta: isize,
    /// Per-variant deltas for variants present in either snapshot.
    pub nodes_by_type_delta: BTreeMap<&'static str, isize>,
    pub interned_symbols_delta: isize,
    pub tracker_bytes_delta: Option<isize>,
}

impl HeapDiff {
    /// True when nothing changed between the snapshots.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live_nodes_delta == 0
            && self.total_slots_delta == 0
            && self.interned_symbols_delta == 0
            && self.nodes_by_type_delta.values().all(|&v| v == 0)
            && self.tracker_bytes_delta.is_none_or(|d| d == 0)
    }
}

impl fmt::Display for HeapDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "HeapDiff: no changes");
        }
        write!(
            f,
            "HeapDiff: {:+} live nodes, {:+} slots",
            self.live_nodes_delta, self.total_slots_delta
        )?;
        for (&name, &delta) in &self.nodes_by_type_delta {
            if delta != 0 {
                write!(f, "\n  {name}: {delta:+}")?;
            }
        }
        if self.interned_symbols_delta != 0 {
            write!(f, "\n  Interned symbols: {:+}", self.interned_symbols_delta)?;
        }
        if let Some(bytes) = self.tracker_bytes_delta
            && bytes != 0
        {
            write!(f, "\n  Tracker bytes: {bytes:+}")?;
        }
        Ok(())
    }
}

fn isize_delta(before: usize, after: usize) -> isize {
    (after as isize).wrapping_sub(before as isize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::NoLimitTracker;

    fn heap() -> Heap<NoLimitTracker> {
        Heap::new(NoLimitTracker, 1024, false)
    }

    #[test]
    fn alloc_starts_unmanaged_in_manuals() {
        let mut h = heap();
        let id = h.alloc(NodeData::Array(Array::new())).unwrap();
        assert!(!h.is_managed(id));
        assert_eq!(h.manuals_len(), 1);
        h.manage(id);
        assert!(h.is_managed(id));
        assert_eq!(h.manuals_len(), 0);
    }

    #[test]
    fn manual_free_recycles_slot() {
        let mut h = heap();
        let id = h.alloc(NodeData::Array(Array::new())).unwrap();
        h.free_manual(id);
        let id2 = h.alloc(NodeData::Array(Array::new())).unwrap();
        assert_eq!(id, id2, "freed slot is reused");
    }

    #[test]
    fn always_malloc_disables_recycling() {
        let mut h = Heap::new(NoLimitTracker, 1024, true);
        let id = h.alloc(NodeData::Array(Array::new())).unwrap();
        h.free_manual(id);
        let id2 = h.alloc(NodeData::Array(Array::new())).unwrap();
        assert_ne!(id, id2);
    }

    #[test]
    fn collect_frees_unreachable_managed_only() {
        let mut h = heap();
        let kept = h.alloc(NodeData::Array(Array::new())).unwrap();
        let lost = h.alloc(NodeData::Array(Array::new())).unwrap();
        let manual = h.alloc(NodeData::Array(Array::new())).unwrap();
        h.manage(kept);
        h.manage(lost);
        let report = h.collect(vec![kept]);
        assert_eq!(report.freed_nodes, 1);
        assert!(h.entries[lost.index()].is_none());
        assert!(h.entries[kept.index()].is_some());
        assert!(h.entries[manual.index()].is_some(), "manuals are roots");
    }

    #[test]
    fn collect_traces_through_pairings() {
        let mut h = heap();
        let inner = h.alloc(NodeData::Text(Text::from_string("x".into()))).unwrap();
        h.manage(inner);
        let pair = h
            .alloc_pairing([Cell::integer(1), Cell::of(crate::cell::Value::Text(inner))])
            .unwrap();
        h.manage(pair);
        let report = h.collect(vec![pair]);
        assert_eq!(report.freed_nodes, 0);
        assert!(h.entries[inner.index()].is_some());
    }

    #[test]
    fn guarded_nodes_survive_collection() {
        let mut h = heap();
        let id = h.alloc(NodeData::Array(Array::new())).unwrap();
        h.manage(id);
        h.guard(id);
        assert_eq!(h.collect(vec![]).freed_nodes, 0);
        h.unguard(id);
        assert_eq!(h.collect(vec![]).freed_nodes, 1);
    }

    #[test]
    fn handle_cleaner_fires_on_sweep() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static CLEANED: AtomicUsize = AtomicUsize::new(0);
        fn cleaner(data: usize, _len: usize) {
            CLEANED.fetch_add(data, Ordering::SeqCst);
        }
        let mut h = heap();
        let id = h.alloc(NodeData::Handle(Handle::new(7, 0, Some(cleaner)))).unwrap();
        h.manage(id);
        h.collect(vec![]);
        assert_eq!(CLEANED.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn truncate_manuals_frees_later_allocations() {
        let mut h = heap();
        let keep = h.alloc(NodeData::Array(Array::new())).unwrap();
        let snap = h.manuals_len();
        let drop1 = h.alloc(NodeData::Array(Array::new())).unwrap();
        let drop2 = h.alloc(NodeData::Array(Array::new())).unwrap();
        h.truncate_manuals(snap);
        assert!(h.entries[keep.index()].is_some());
        assert!(h.entries[drop1.index()].is_none());
        assert!(h.entries[drop2.index()].is_none());
    }

    #[test]
    fn stats_and_diff_track_allocation() {
        let mut h = heap();
        let before = h.stats(0);
        let id = h.alloc(NodeData::Text(Text::from_string("hi".into()))).unwrap();
        let after = h.stats(0);
        let diff = before.diff(&after);
        assert_eq!(diff.live_nodes_delta, 1);
        assert_eq!(diff.nodes_by_type_delta.get("Text"), Some(&1));
        h.free_manual(id);
        assert!(after.diff(&h.stats(0)).live_nodes_delta == -1);
    }

    #[test]
    fn expansion_ring_detects_repeats() {
        let mut h = heap();
        let a = h.alloc(NodeData::Array(Array::new())).unwrap();
        let b = h.alloc(NodeData::Array(Array::new())).unwrap();
        assert!(!h.note_expansion(a));
        assert!(!h.note_expansion(b));
        assert!(h.note_expansion(a), "second expansion of the same node detected");
    }
}
