//! Paramlists: action identity, interface, and dispatch metadata.

use crate::{
    cell::{ActionRef, Cell, Param, Value},
    heap::NodeId,
    natives::Native,
    types::buf::Buf,
};

/// Behavior-affecting action properties, honored by the evaluator's
/// enfix lookahead and return handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct ActionFlags(u8);

impl ActionFlags {
    pub const NONE: Self = Self(0);
    /// Enfix: wait for the enclosing expression to finish before taking
    /// the left operand (THEN/ELSE grouping).
    pub const DEFERS_LOOKBACK: Self = Self(1 << 0);
    /// Enfix: run as late as possible without reordering side effects.
    pub const POSTPONES_ENTIRELY: Self = Self(1 << 1);
    /// Result must be re-checked against the facade's return types
    /// (installed when a reskin broadens).
    pub const RETURN_RECHECK: Self = Self(1 << 2);

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

/// How an action's behavior is implemented.
///
/// Composition dispatchers read their private state from the leading
/// cells of the details array; `Native` indexes the boot-registered
/// dispatcher table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dispatcher {
    /// Interpreted body; result is the body's last value.
    Noop,
    /// Interpreted body with a definitional RETURN in the frame.
    Returner,
    /// details: [prelude block, inner action].
    Adapter,
    /// details: [block of actions], piped left to right.
    Chainer,
    /// details: [inner action, outer action]; outer receives the
    /// pre-built inner frame unrun.
    Encloser,
    /// details: [exemplar frame, inner action].
    Specializer,
    /// details: [replacement action]; shim for incompatible paramlists.
    Hijacker,
    /// details: [datatype or typeset]; arity-1 boolean predicate.
    Typechecker,
    /// details: [inner action]; facade narrows or broadens types.
    Skinner,
    Native(Native),
}

/// An action's paramlist node: identity array plus dispatch metadata.
///
/// `cells[0]` is the action archetype (pointing back at this node),
/// `cells[1..]` are the parameter typesets. The `underlying` paramlist is
/// the one whose shape argument frames are built with; it is `self`'s id
/// for primitive actions and shared across all compositions over one
/// target.
#[derive(Debug)]
pub(crate) struct ParamList {
    cells: Buf<Cell>,
    pub underlying: NodeId,
    /// Type-narrowing variant interface, when a reskin created one.
    pub facade: Option<NodeId>,
    /// HELP metadata context.
    pub meta: Option<NodeId>,
    pub dispatcher: Dispatcher,
    pub details: NodeId,
    pub flags: ActionFlags,
}

impl ParamList {
    /// Builds a paramlist whose archetype points at `own_id` (the node
    /// this value is being stored into).
    pub fn new(
        own_id: NodeId,
        params: &[Param],
        underlying: NodeId,
        dispatcher: Dispatcher,
        details: NodeId,
        flags: ActionFlags,
    ) -> Self {
        let mut cells = Vec::with_capacity(params.len() + 1);
        cells.push(Cell::of(Value::Action(ActionRef {
            paramlist: own_id,
            binding: None,
        })));
        cells.extend(params.iter().map(|&p| Cell::of(Value::Param(p))));
        Self {
            cells: Buf::from_vec(cells),
            underlying,
            facade: None,
            meta: None,
            dispatcher,
            details,
            flags,
        }
    }

    pub fn archetype(&self) -> &Cell {
        self.cells.get(0).expect("paramlist missing archetype")
    }

    /// Fixes up the self-referential identity after the node id is known
    /// (allocation assigns the id, so construction uses a placeholder).
    pub fn patch_identity(&mut self, own_id: NodeId, underlying: NodeId) {
        *self.cells.get_mut(0).expect("paramlist missing archetype") = Cell::of(Value::Action(ActionRef {
            paramlist: own_id,
            binding: None,
        }));
        self.underlying = underlying;
    }

    /// Parameter cells (archetype excluded).
    pub fn params(&self) -> &[Cell] {
        &self.cells.as_slice()[1..]
    }

    pub fn params_mut(&mut self) -> &mut [Cell] {
        &mut self.cells.as_mut_slice()[1..]
    }

    /// Frame length this paramlist implies (archetype slot included).
    pub fn frame_len(&self) -> usize {
        self.cells.len()
    }

    pub fn cells(&self) -> &[Cell] {
        self.cells.as_slice()
    }

    pub fn param(&self, index: usize) -> Param {
        match self.params()[index].value {
            Value::Param(p) => p,
            ref other => panic!("paramlist element is not a param: {other:?}"),
        }
    }

    pub fn capacity_bytes(&self) -> usize {
        self.cells.capacity_bytes()
    }
}
