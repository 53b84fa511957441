//! Bindings, specifiers, and the scoped binder.
//!
//! A word cell either carries no binding, a concrete slot in some
//! context's varlist, or a *relative* binding to a paramlist. Relative
//! words appear in function bodies shared by every activation; the
//! [`Specifier`] traveling with each array reference supplies the
//! concrete frame that turns a relative binding into storage.
//!
//! The binder used while building contexts is a scoped hash map keyed by
//! symbol id. Unlike the original's in-symbol scratch slots it has no
//! teardown obligation and nests freely.

use ahash::AHashMap;

use crate::{
    cell::{Cell, Param, ParamClass, Value, Word, OPT_ANY_VALUE},
    heap::{Heap, NodeData, NodeFlags, NodeId},
    intern::SymbolId,
    resource::MemTracker,
    types::Array,
    unwind::RunResult,
};

/// How a word reaches storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Binding {
    Unbound,
    /// Concrete varlist slot.
    Slot { varlist: NodeId, index: u32 },
    /// Slot in whichever frame of `paramlist` the specifier supplies.
    Relative { paramlist: NodeId, index: u32 },
}

/// Resolver carried by array references: maps relative bindings found in
/// the array to a concrete frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum Specifier {
    #[default]
    None,
    /// Varlist node of the frame that instantiates relative words.
    Frame(NodeId),
}

impl Specifier {
    /// Composes the specifier for a nested array: an array cell that
    /// carries its own frame keeps it; otherwise it inherits the
    /// traversal's specifier.
    pub fn derive(outer: Self, cell_specifier: Self) -> Self {
        match cell_specifier {
            Self::Frame(_) => cell_specifier,
            Self::None => outer,
        }
    }
}

/// Outcome of word→storage resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Resolve {
    /// Varlist node and slot index.
    Slot(NodeId, usize),
    Unbound,
    /// Relative word with no frame in the specifier chain.
    NoFrame,
    /// The target frame's activation already ended.
    Expired,
}

/// Resolves a word to a storage location.
pub(crate) fn resolve_word(heap: &Heap<impl MemTracker>, word: &Word, specifier: Specifier) -> Resolve {
    match word.binding {
        Binding::Unbound => Resolve::Unbound,
        Binding::Slot { varlist, index } => {
            if heap.has_flag(varlist, NodeFlags::FRAME_EXPIRED) {
                Resolve::Expired
            } else {
                Resolve::Slot(varlist, index as usize)
            }
        }
        Binding::Relative { paramlist, index } => {
            let Specifier::Frame(varlist) = specifier else {
                return Resolve::NoFrame;
            };
            if heap.has_flag(varlist, NodeFlags::FRAME_EXPIRED) {
                return Resolve::Expired;
            }
            if !frame_instantiates(heap, varlist, paramlist) {
                return Resolve::NoFrame;
            }
            Resolve::Slot(varlist, index as usize)
        }
    }
}

/// True when `varlist` is an activation whose shape can satisfy words
/// bound relative to `paramlist` (the frame's own keylist, or one
/// sharing its underlying).
fn frame_instantiates(heap: &Heap<impl MemTracker>, varlist: NodeId, paramlist: NodeId) -> bool {
    let keylist = heap.context(varlist).keylist;
    if keylist == paramlist {
        return true;
    }
    let matches = |id: NodeId| match &heap.node(id).data {
        NodeData::ParamList(p) => p.underlying,
        _ => id,
    };
    matches(keylist) == matches(paramlist)
}

/// Finds a symbol's slot in a context, archetype slot excluded.
pub(crate) fn find_in_context(heap: &Heap<impl MemTracker>, varlist: NodeId, sym: SymbolId) -> Option<usize> {
    let keylist = heap.context(varlist).keylist;
    find_key(heap.keys_of(keylist), sym)
}

/// Finds a symbol among key cells (index 0 is the rootkey/archetype).
pub(crate) fn find_key(keys: &[Cell], sym: SymbolId) -> Option<usize> {
    keys.iter().enumerate().skip(1).find_map(|(i, cell)| match cell.value {
        Value::Param(p) if p.sym == sym => Some(i),
        _ => None,
    })
}

/// Appends a new key/value slot to a context, forking the keylist first
/// when it is shared with other contexts.
pub(crate) fn expand_context(
    heap: &mut Heap<impl MemTracker>,
    varlist: NodeId,
    sym: SymbolId,
    value: Cell,
) -> RunResult<usize> {
    let keylist = heap.context(varlist).keylist;
    if heap.has_flag(keylist, NodeFlags::KEYLIST_SHARED) {
        let forked_cells = heap.keys_of(keylist).to_vec();
        let forked = heap.alloc(NodeData::Array(Array::from_cells(forked_cells)))?;
        heap.manage(forked);
        heap.context_mut(varlist).keylist = forked;
    }
    let keylist = heap.context(varlist).keylist;
    heap.array_mut(keylist).push(Cell::of(Value::Param(Param {
        sym,
        class: ParamClass::Normal,
        types: OPT_ANY_VALUE,
    })));
    heap.context_mut(varlist).push(value);
    let index = heap.context(varlist).len() - 1;
    debug_assert_eq!(
        heap.context(varlist).len(),
        heap.keys_of(heap.context(varlist).keylist).len(),
        "keylist and varlist lengths diverged"
    );
    Ok(index)
}

/// Transient symbol→slot map used while building contexts and binding
/// arrays. Scoped: drop ends the binder, nested binders are fine.
#[derive(Debug, Default)]
pub(crate) struct Binder {
    map: AHashMap<SymbolId, u32>,
}

impl Binder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims a symbol's index; later claims of the same symbol keep the
    /// first (leftmost key wins, matching context construction order).
    pub fn claim(&mut self, sym: SymbolId, index: u32) {
        self.map.entry(sym).or_insert(index);
    }

    pub fn get(&self, sym: SymbolId) -> Option<u32> {
        self.map.get(&sym).copied()
    }

    /// Seeds the binder from a context's keys.
    pub fn seed_from_context(&mut self, heap: &Heap<impl MemTracker>, varlist: NodeId) {
        let keylist = heap.context(varlist).keylist;
        for (i, cell) in heap.keys_of(keylist).iter().enumerate().skip(1) {
            if let Value::Param(p) = cell.value {
                self.claim(p.sym, u32::try_from(i).expect("context too large"));
            }
        }
    }

    /// Seeds the binder from a paramlist's params.
    pub fn seed_from_paramlist(&mut self, heap: &Heap<impl MemTracker>, paramlist: NodeId) {
        for (i, cell) in heap.paramlist(paramlist).cells().iter().enumerate().skip(1) {
            if let Value::Param(p) = cell.value {
                self.claim(p.sym, u32::try_from(i).expect("paramlist too large"));
            }
        }
    }
}

/// Rewrites word bindings throughout an array.
#[derive(Debug, Clone, Copy)]
enum BindTarget {
    Context(NodeId),
    Relative(NodeId),
}

fn bind_deep(heap: &mut Heap<impl MemTracker>, root: NodeId, binder: &Binder, target: BindTarget) {
    let mut visited: Vec<NodeId> = Vec::new();
    let mut work = vec![root];
    while let Some(array_id) = work.pop() {
        if visited.contains(&array_id) {
            continue;
        }
        visited.push(array_id);
        let len = heap.array(array_id).len();
        for i in 0..len {
            let cell = *heap.array(array_id).get(i).expect("length checked");
            match cell.value {
                Value::Word(mut w) | Value::SetWord(mut w) | Value::GetWord(mut w) | Value::LitWord(mut w) => {
                    let Some(index) = binder.get(w.sym) else { continue };
                    w.binding = match target {
                        BindTarget::Context(varlist) => Binding::Slot { varlist, index },
                        BindTarget::Relative(paramlist) => Binding::Relative { paramlist, index },
                    };
                    let slot = heap.array_mut(array_id).get_mut(i).expect("length checked");
                    slot.value = match cell.value {
                        Value::Word(_) => Value::Word(w),
                        Value::SetWord(_) => Value::SetWord(w),
                        Value::GetWord(_) => Value::GetWord(w),
                        Value::LitWord(_) => Value::LitWord(w),
                        _ => unreachable!("word kinds matched above"),
                    };
                }
                Value::Block(s) | Value::Group(s) | Value::Path(s) | Value::SetPath(s) | Value::GetPath(s) => {
                    work.push(s.node);
                }
                _ => {}
            }
        }
    }
}

/// Binds every matching word in an array (deeply) to a context's slots.
pub(crate) fn bind_array_to_context(heap: &mut Heap<impl MemTracker>, root: NodeId, varlist: NodeId) {
    let mut binder = Binder::new();
    binder.seed_from_context(heap, varlist);
    bind_deep(heap, root, &binder, BindTarget::Context(varlist));
}

/// Binds matching words in a function body relative to its paramlist, so
/// the shared body resolves through whichever frame runs it.
pub(crate) fn bind_array_relative(heap: &mut Heap<impl MemTracker>, root: NodeId, paramlist: NodeId) {
    let mut binder = Binder::new();
    binder.seed_from_paramlist(heap, paramlist);
    bind_deep(heap, root, &binder, BindTarget::Relative(paramlist));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cell::{ContextKind, SeriesRef},
        resource::NoLimitTracker,
    };

    fn heap() -> Heap<NoLimitTracker> {
        Heap::new(NoLimitTracker, 1024, false)
    }

    fn rootkey(sym: SymbolId) -> Cell {
        Cell::of(Value::Param(Param {
            sym,
            class: ParamClass::Local,
            types: crate::cell::TypeSet::NONE,
        }))
    }

    /// Builds a one-slot object context for binder tests.
    fn small_context(h: &mut Heap<NoLimitTracker>, sym: SymbolId) -> NodeId {
        let keylist = h
            .alloc(NodeData::Array(Array::from_cells(vec![
                rootkey(sym),
                Cell::of(Value::Param(Param {
                    sym,
                    class: ParamClass::Normal,
                    types: OPT_ANY_VALUE,
                })),
            ])))
            .unwrap();
        h.manage(keylist);
        let varlist = h.alloc_context(ContextKind::Object, keylist, 2).unwrap();
        h.manage(varlist);
        varlist
    }

    #[test]
    fn binder_is_scoped_and_nestable() {
        let mut outer = Binder::new();
        let sym = SymbolId::from(crate::intern::Sym::Value);
        outer.claim(sym, 1);
        {
            let mut inner = Binder::new();
            inner.claim(sym, 9);
            assert_eq!(inner.get(sym), Some(9));
        }
        assert_eq!(outer.get(sym), Some(1), "inner binder never disturbed the outer");
    }

    #[test]
    fn first_claim_wins() {
        let mut binder = Binder::new();
        let sym = SymbolId::from(crate::intern::Sym::Value);
        binder.claim(sym, 1);
        binder.claim(sym, 2);
        assert_eq!(binder.get(sym), Some(1));
    }

    #[test]
    fn bind_array_to_context_rewrites_words_deeply() {
        let mut h = heap();
        let sym = SymbolId::from(crate::intern::Sym::Value);
        let varlist = small_context(&mut h, sym);

        let inner = h
            .alloc(NodeData::Array(Array::from_cells(vec![Cell::of(Value::Word(
                Word::unbound(sym),
            ))])))
            .unwrap();
        let outer = h
            .alloc(NodeData::Array(Array::from_cells(vec![
                Cell::of(Value::SetWord(Word::unbound(sym))),
                Cell::of(Value::Block(SeriesRef::head(inner))),
            ])))
            .unwrap();
        bind_array_to_context(&mut h, outer, varlist);

        let Value::SetWord(w) = h.array(outer).get(0).unwrap().value else {
            panic!("set-word expected");
        };
        assert_eq!(w.binding, Binding::Slot { varlist, index: 1 });
        let Value::Word(w) = h.array(inner).get(0).unwrap().value else {
            panic!("word expected");
        };
        assert_eq!(w.binding, Binding::Slot { varlist, index: 1 });
    }

    #[test]
    fn resolve_relative_needs_frame_specifier() {
        let mut h = heap();
        let paramlist = h.alloc(NodeData::Array(Array::new())).unwrap();
        let word = Word {
            sym: SymbolId::from(crate::intern::Sym::Value),
            binding: Binding::Relative { paramlist, index: 1 },
        };
        assert_eq!(resolve_word(&h, &word, Specifier::None), Resolve::NoFrame);
    }

    #[test]
    fn expired_frame_resolution_reports_expired() {
        let mut h = heap();
        let sym = SymbolId::from(crate::intern::Sym::Value);
        let varlist = small_context(&mut h, sym);
        h.set_flag(varlist, NodeFlags::FRAME_EXPIRED);
        let word = Word {
            sym,
            binding: Binding::Slot { varlist, index: 1 },
        };
        assert_eq!(resolve_word(&h, &word, Specifier::None), Resolve::Expired);
    }

    #[test]
    fn expand_context_forks_shared_keylist() {
        let mut h = heap();
        let sym = SymbolId::from(crate::intern::Sym::Value);
        let varlist = small_context(&mut h, sym);
        let shared_keylist = h.context(varlist).keylist;
        h.set_flag(shared_keylist, NodeFlags::KEYLIST_SHARED);

        let other = SymbolId::from(crate::intern::Sym::Count);
        let index = expand_context(&mut h, varlist, other, Cell::integer(5)).unwrap();
        assert_eq!(index, 2);
        assert_ne!(h.context(varlist).keylist, shared_keylist, "expansion forked");
        assert_eq!(h.keys_of(shared_keylist).len(), 2, "shared keylist untouched");
        assert_eq!(find_in_context(&h, varlist, other), Some(2));
    }
}
