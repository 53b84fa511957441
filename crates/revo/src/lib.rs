#![doc = include_str!("../../../README.md")]
#![expect(dead_code, reason = "series and cell APIs stay complete beyond current native coverage")]
#![expect(clippy::cast_possible_truncation, reason = "index narrowing is bounds-checked at the site")]
#![expect(clippy::cast_sign_loss, reason = "sign-dropping casts follow a range check")]
#![expect(clippy::cast_possible_wrap, reason = "length-to-integer conversions cannot wrap in practice")]

mod bind;
mod cell;
mod compose;
mod datum;
mod error;
mod eval;
mod frame;
mod heap;
mod intern;
mod machine;
mod mold;
mod natives;
mod resource;
mod stack;
mod trace;
mod types;
mod unwind;

pub use crate::{
    datum::{Datum, Fault, ValueHandle},
    heap::{HeapDiff, HeapStats},
    machine::{Machine, MachineConfig},
    resource::{LimitedTracker, MemTracker, NoLimitTracker, ResourceError, DEFAULT_MAX_FRAME_DEPTH},
    trace::{NoopTracer, RecordingTracer, StderrTracer, TraceEvent, Tracer},
};
