//! Evaluator observability hooks.
//!
//! The machine owns one [`Tracer`]; the default [`NoopTracer`] costs a
//! virtual call per hook and nothing else. [`StderrTracer`] is the
//! debugging companion (`PROBE_FAILURES` routes raised errors through
//! the same hook), and [`RecordingTracer`] captures events for tests.

use std::fmt;

/// One observable runtime event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    /// An action dispatch, with its call label when known.
    Dispatch { label: Option<String> },
    /// An error was raised and is about to propagate.
    Fail { id: String, message: String },
    /// A throw signal began bubbling.
    Throw { label: String },
    /// A collection ran.
    Gc { freed_nodes: usize },
}

impl fmt::Display for TraceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dispatch { label } => write!(f, "dispatch {}", label.as_deref().unwrap_or("~anonymous~")),
            Self::Fail { id, message } => write!(f, "fail {id}: {message}"),
            Self::Throw { label } => write!(f, "throw {label}"),
            Self::Gc { freed_nodes } => write!(f, "gc freed {freed_nodes}"),
        }
    }
}

pub trait Tracer: fmt::Debug {
    fn event(&mut self, event: &TraceEvent);

    /// Recorded history, for tracers that keep one. Lets callers read a
    /// recording back through `Machine::take_tracer` without downcasting.
    fn recorded(&self) -> Option<&[TraceEvent]> {
        None
    }
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

impl Tracer for NoopTracer {
    #[inline]
    fn event(&mut self, _event: &TraceEvent) {}
}

/// Writes each event to stderr.
#[derive(Debug, Clone, Copy, Default)]
pub struct StderrTracer;

impl Tracer for StderrTracer {
    fn event(&mut self, event: &TraceEvent) {
        eprintln!("revo: {event}");
    }
}

/// Keeps every event for later inspection.
#[derive(Debug, Default)]
pub struct RecordingTracer {
    pub events: Vec<TraceEvent>,
}

impl Tracer for RecordingTracer {
    fn event(&mut self, event: &TraceEvent) {
        self.events.push(event.clone());
    }

    fn recorded(&self) -> Option<&[TraceEvent]> {
        Some(&self.events)
    }
}
