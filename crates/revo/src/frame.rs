//! Evaluator activation records.

use crate::{bind::Specifier, heap::NodeId, intern::SymbolId};

/// Per-frame evaluator flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct FrameFlags(u8);

impl FrameFlags {
    pub const NONE: Self = Self(0);
    /// This frame is gathering the left operand of an enfix call.
    pub const FULFILLING_ENFIX: Self = Self(1 << 0);
    /// Varlist outlives the pop (an encloser handed it onward), so the
    /// pop must not collapse it.
    pub const KEEP_VARLIST: Self = Self(1 << 1);

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

/// One action activation on the machine's frame stack.
///
/// `original` is the action identity the frame was pushed for; `phase`
/// moves inward as composition layers (adapt, specialize, skin) hand
/// dispatch to their inner actions. The feed fields snapshot where in
/// the source the call happened, for NEAR reporting.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Frame {
    pub label: Option<SymbolId>,
    pub original: NodeId,
    pub phase: NodeId,
    pub varlist: NodeId,
    /// Binding of the invoking action cell (definitional-return target).
    pub binding: Option<NodeId>,
    pub feed_node: Option<NodeId>,
    pub feed_index: u32,
    pub specifier: Specifier,
    pub flags: FrameFlags,
    /// Data-stack depth at entry; the frame must restore it on exit.
    pub ds_mark: usize,
}

impl Frame {
    /// GC roots held by this activation.
    pub fn node_roots(&self, out: &mut Vec<NodeId>) {
        out.push(self.original);
        out.push(self.phase);
        out.push(self.varlist);
        if let Some(binding) = self.binding {
            out.push(binding);
        }
        if let Some(feed) = self.feed_node {
            out.push(feed);
        }
        if let Specifier::Frame(varlist) = self.specifier {
            out.push(varlist);
        }
    }
}
