//! Contexts: the keylist/varlist pair behind objects, modules, errors,
//! and function frames.

use crate::{
    cell::{Cell, ContextKind, Value},
    heap::NodeId,
    types::buf::Buf,
};

/// A context's varlist plus the link to its keylist.
///
/// The node holding this data *is* the varlist: bindings and frame
/// references identify a context by this node's id. Slot 0 is the
/// archetype cell, whose [`ContextKind`] tags the context subtype and
/// whose binding (for frames) carries the phase.
#[derive(Debug)]
pub(crate) struct Context {
    pub keylist: NodeId,
    /// For frame contexts: the action identity currently running this
    /// frame (moves inward through composition layers).
    pub phase: Option<NodeId>,
    vars: Buf<Cell>,
}

impl Context {
    /// Builds a varlist of `len` slots (archetype included), archetype
    /// populated, the rest trash until filled.
    pub fn with_archetype(kind: ContextKind, keylist: NodeId, varlist_id: NodeId, len: usize) -> Self {
        let mut vars = Vec::with_capacity(len);
        vars.push(Cell::of(Value::Context(kind, varlist_id)));
        vars.resize(len, Cell::TRASH);
        Self {
            keylist,
            phase: None,
            vars: Buf::from_vec(vars),
        }
    }

    /// Total slots, archetype included. Always equals keylist length.
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn archetype(&self) -> &Cell {
        self.vars.get(0).expect("context varlist missing archetype")
    }

    pub fn archetype_mut(&mut self) -> &mut Cell {
        self.vars.get_mut(0).expect("context varlist missing archetype")
    }

    pub fn kind(&self) -> ContextKind {
        match self.archetype().value {
            Value::Context(kind, _) => kind,
            _ => panic!("context archetype is not a context cell"),
        }
    }

    pub fn get(&self, index: usize) -> &Cell {
        self.vars.get(index).expect("context slot out of range")
    }

    pub fn get_mut(&mut self, index: usize) -> &mut Cell {
        self.vars.get_mut(index).expect("context slot out of range")
    }

    pub fn cells(&self) -> &[Cell] {
        self.vars.as_slice()
    }

    /// Appends one slot (for context expansion; the keylist grows in the
    /// same operation, keeping lengths equal).
    pub fn push(&mut self, cell: Cell) {
        self.vars.push(cell);
    }

    /// Frame collapse: releases argument storage, preserving only the
    /// archetype so extant bindings still identify action and phase.
    pub fn collapse(&mut self) {
        self.vars.truncate(1);
        self.vars.compact();
    }

    pub fn capacity_bytes(&self) -> usize {
        self.vars.capacity_bytes()
    }
}
