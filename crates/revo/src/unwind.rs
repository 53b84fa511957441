//! The two channels of abnormal exit.
//!
//! **Fail** is a non-local jump modeled as ordinary `Result` propagation:
//! [`Raised`] travels up through `?` until a rescue barrier truncates the
//! machine's shared state back to its [`RescueSnapshot`]. **Throw** is
//! cooperative: dispatchers return [`Flow::Thrown`] and every frame hands
//! the same signal to its caller until a construct recognizes the label
//! and catches. A throw that reaches the bottom becomes a no-catch fail;
//! a fail is never caught by throw machinery.

use crate::{
    cell::{Cell, Value},
    heap::NodeId,
    resource::ResourceError,
};

/// A raised (failing) condition in flight.
///
/// The three non-`Error` variants are pre-built conditions: raising them
/// allocates nothing, which matters because they fire exactly when
/// allocation budgets or the frame stack are exhausted. The machine
/// resolves them to their boot-time error contexts at the barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Raised {
    /// A constructed error context.
    Error(NodeId),
    OutOfMemory,
    StackOverflow,
    /// HALT signal observed at an evaluator step.
    Halted,
}

pub(crate) type RunResult<T> = Result<T, Raised>;

impl From<ResourceError> for Raised {
    fn from(err: ResourceError) -> Self {
        match err {
            ResourceError::Memory { .. } | ResourceError::Allocation { .. } => Self::OutOfMemory,
            ResourceError::Recursion { .. } => Self::StackOverflow,
        }
    }
}

/// A cooperative throw in flight: the label names what is being thrown
/// (an action cell for return/break/continue, a word or blank for
/// user-level THROW) and the arg is the payload the catcher receives.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Thrown {
    pub label: Cell,
    pub arg: Cell,
}

impl Thrown {
    /// The frame varlist a definitional throw targets, when the label is
    /// an action bound to one.
    pub fn target(&self) -> Option<NodeId> {
        match self.label.value {
            Value::Action(a) => a.binding,
            _ => None,
        }
    }

    /// The action identity carried by the label, for identity-matched
    /// catches (break/continue).
    pub fn label_action(&self) -> Option<NodeId> {
        match self.label.value {
            Value::Action(a) => Some(a.paramlist),
            _ => None,
        }
    }
}

/// Dispatcher result modes.
///
/// `Out` is the normal completed value. `Invisible` leaves the caller's
/// previous output untouched (COMMENT). `Redo` asks the evaluator to
/// re-dispatch the same frame, optionally skipping argument re-checking.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Flow {
    Out(Cell),
    Thrown(Thrown),
    Invisible,
    Redo { checked: bool },
}

/// Counters captured when a rescue barrier opens.
///
/// On a fail caught at the barrier, every field is truncated back so the
/// data stack, guarded list, mold buffer, mold stack, manuals registry,
/// and frame chain all return to their state at the snapshot. The debug
/// balance check on successful exits verifies the same counters, which
/// catches push/drop protocol violations early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RescueSnapshot {
    pub data_stack: usize,
    pub guarded: usize,
    pub manuals: usize,
    pub mold_bytes: usize,
    pub mold_chars: usize,
    pub mold_stack: usize,
    pub frames: usize,
    pub signals: u32,
}
