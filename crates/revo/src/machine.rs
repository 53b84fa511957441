//! The per-task runtime: every piece of ambient state, threaded
//! explicitly.
//!
//! One `Machine` owns the node arena, symbol table, data stack, mold
//! buffer, frame stack, signal mask, and the boot-time globals (lib
//! context, error catalog, pre-built errors, native registry). There are
//! no process globals and no locks: the runtime is single-threaded
//! cooperative by design, and isolation is "one machine per task".

use crate::{
    cell::{Cell, SeriesRef, Value, Word},
    error::{self, build_catalog, build_error, build_error_keylist, Catalog, ErrorId},
    frame::{Frame, FrameFlags},
    heap::{CollectReport, Heap, HeapStats, NodeId},
    intern::{Sym, SymbolId, Symbols},
    mold::{mold_cell, MoldBuffer},
    natives,
    resource::{MemTracker, NoLimitTracker},
    stack::DataStack,
    trace::{NoopTracer, TraceEvent, Tracer},
    types::Array,
    unwind::{Raised, RescueSnapshot, RunResult},
};

/// Signal bits checked at evaluator steps.
pub(crate) const SIG_HALT: u32 = 1 << 0;

/// Boot-time configuration.
///
/// Every environment control has a programmatic field so tests and hosts
/// need not mutate the process environment.
#[derive(Debug, Clone)]
pub struct MachineConfig {
    /// Allocations between automatic collections.
    pub ballast: u32,
    /// Zero the ballast: collect at every evaluator step. Debug aid.
    pub memory_torture: bool,
    /// Dump each raised error to the tracer/stderr before propagation.
    pub probe_failures: bool,
    /// Bypass arena slot recycling. Debug aid for memory tools.
    pub always_malloc: bool,
    /// Default cap on molded output length, in characters.
    pub mold_limit: Option<usize>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            ballast: 8192,
            memory_torture: false,
            probe_failures: false,
            always_malloc: false,
            mold_limit: None,
        }
    }
}

impl MachineConfig {
    /// Reads the environment controls (`MEMORY_TORTURE`,
    /// `PROBE_FAILURES`, `ALWAYS_MALLOC`), all optional.
    #[must_use]
    pub fn from_env() -> Self {
        fn flag(name: &str) -> bool {
            std::env::var(name).is_ok_and(|v| !v.is_empty() && v != "0")
        }
        Self {
            memory_torture: flag("MEMORY_TORTURE"),
            probe_failures: flag("PROBE_FAILURES"),
            always_malloc: flag("ALWAYS_MALLOC"),
            ..Self::default()
        }
    }
}

/// The runtime.
#[derive(Debug)]
pub struct Machine<T: MemTracker = NoLimitTracker> {
    pub(crate) heap: Heap<T>,
    pub(crate) syms: Symbols,
    pub(crate) ds: DataStack,
    pub(crate) mold: MoldBuffer,
    pub(crate) frames: Vec<Frame>,
    pub(crate) signals: u32,
    pub(crate) catalog: Catalog,
    /// The lib context: where natives are defined and top-level
    /// set-words land.
    pub(crate) lib: NodeId,
    pub(crate) error_keylist: NodeId,
    pub(crate) prebuilt_overflow: NodeId,
    pub(crate) prebuilt_oom: NodeId,
    pub(crate) prebuilt_halt: NodeId,
    /// Action node per native, indexed by `Native` discriminant.
    pub(crate) native_actions: Vec<NodeId>,
    /// Last feed position an evaluator step saw, for NEAR reporting.
    pub(crate) recent_feed: Option<(NodeId, u32)>,
    pub(crate) config: MachineConfig,
    pub(crate) tracer: Box<dyn Tracer>,
    booted: bool,
}

impl Machine<NoLimitTracker> {
    /// Boots an unlimited machine configured from the environment.
    #[must_use]
    pub fn boot() -> Self {
        Self::with_tracker(MachineConfig::from_env(), NoLimitTracker)
    }
}

impl<T: MemTracker> Machine<T> {
    /// Boots a machine with explicit configuration and tracker.
    ///
    /// # Panics
    /// Panics if the tracker's budgets are too small to boot: before the
    /// catalog and pre-built errors exist there is no way to describe a
    /// failure, so any fail during boot is a panic by design.
    pub fn with_tracker(config: MachineConfig, tracker: T) -> Self {
        let syms = Symbols::new();
        let ballast = if config.memory_torture { 0 } else { config.ballast };
        let mut heap = Heap::new(tracker, ballast, config.always_malloc);
        let catalog = build_catalog();

        let error_keylist = build_error_keylist(&mut heap).expect("boot: error keylist");

        // lib starts as an empty module context with just its rootkey
        let lib_keylist = heap
            .alloc(crate::heap::NodeData::Array(Array::from_cells(vec![Cell::of(Value::Param(
                crate::cell::Param {
                    sym: Sym::Root.into(),
                    class: crate::cell::ParamClass::Local,
                    types: crate::cell::TypeSet::NONE,
                },
            ))])))
            .expect("boot: lib keylist");
        heap.manage(lib_keylist);
        let lib = heap
            .alloc_context(crate::cell::ContextKind::Module, lib_keylist, 1)
            .expect("boot: lib context");
        heap.manage(lib);

        let mut machine = Self {
            heap,
            syms,
            ds: DataStack::new(),
            mold: MoldBuffer::new(),
            frames: Vec::new(),
            signals: 0,
            catalog,
            lib,
            error_keylist,
            prebuilt_overflow: lib, // patched below
            prebuilt_oom: lib,
            prebuilt_halt: lib,
            native_actions: Vec::new(),
            recent_feed: None,
            config,
            tracer: Box::new(NoopTracer),
            booted: false,
        };

        machine.prebuilt_overflow = machine.build_boot_error(ErrorId::StackOverflow);
        machine.prebuilt_oom = machine.build_boot_error(ErrorId::OutOfMemory);
        machine.prebuilt_halt = machine.build_boot_error(ErrorId::Halted);

        natives::install(&mut machine);
        machine.booted = true;
        machine
    }

    fn build_boot_error(&mut self, id: ErrorId) -> NodeId {
        let node = build_error(
            &mut self.heap,
            &mut self.syms,
            &mut self.mold,
            &self.catalog,
            self.error_keylist,
            id,
            &[],
        )
        .expect("boot: pre-built error");
        self.heap.manage(node);
        node
    }

    // --- tracer ----------------------------------------------------------

    pub fn set_tracer(&mut self, tracer: Box<dyn Tracer>) {
        self.tracer = tracer;
    }

    /// Replaces the tracer with a no-op and returns the old one, so
    /// tests can inspect recorded events.
    pub fn take_tracer(&mut self) -> Box<dyn Tracer> {
        std::mem::replace(&mut self.tracer, Box::new(NoopTracer))
    }

    // --- failing ---------------------------------------------------------

    /// Builds an error context and returns the raised condition for it.
    ///
    /// WHERE and NEAR are populated from the live frame chain here, while
    /// it still exists. The usual call shape is
    /// `return Err(self.raise(id, &args))`.
    pub(crate) fn raise(&mut self, id: ErrorId, args: &[Cell]) -> Raised {
        assert!(self.booted, "fail before boot completed: {id}");
        let node = match build_error(
            &mut self.heap,
            &mut self.syms,
            &mut self.mold,
            &self.catalog,
            self.error_keylist,
            id,
            args,
        ) {
            Ok(node) => node,
            // out of memory while describing an error: fall back to the
            // pre-built condition
            Err(raised) => return raised,
        };
        self.heap.manage(node);

        if let Some(wh) = self.where_block() {
            *self.heap.context_mut(node).get_mut(error::SLOT_WHERE) = wh;
        }
        if let Some((feed, index)) = self.recent_feed {
            *self.heap.context_mut(node).get_mut(error::SLOT_NEAR) = Cell::of(Value::Block(SeriesRef {
                node: feed,
                index,
                specifier: crate::bind::Specifier::None,
            }));
            let (file, line) = {
                let array = self.heap.array(feed);
                (array.file, array.line)
            };
            if let (Some(file), Some(line)) = (file, line) {
                *self.heap.context_mut(node).get_mut(error::SLOT_FILE) =
                    Cell::of(Value::Word(Word::unbound(file)));
                *self.heap.context_mut(node).get_mut(error::SLOT_LINE) =
                    Cell::integer(i64::from(line));
            }
        }

        let id_text = id.to_string();
        let message = self.error_message_text(node);
        self.tracer.event(&TraceEvent::Fail {
            id: id_text.clone(),
            message: message.clone(),
        });
        if self.config.probe_failures {
            eprintln!("** {id_text}: {message}");
        }
        Raised::Error(node)
    }

    /// WHERE backtrace: the labels of every open frame, innermost first.
    fn where_block(&mut self) -> Option<Cell> {
        let mut words = Vec::with_capacity(self.frames.len());
        for frame in self.frames.iter().rev() {
            if let Some(sym) = frame.label {
                words.push(Cell::of(Value::Word(Word::unbound(sym))));
            }
        }
        let node = self
            .heap
            .alloc(crate::heap::NodeData::Array(Array::from_cells(words)))
            .ok()?;
        self.heap.manage(node);
        Some(Cell::of(Value::Block(SeriesRef::head(node))))
    }

    /// The message text of an error context, for tracing and display.
    pub(crate) fn error_message_text(&self, error: NodeId) -> String {
        match self.heap.context(error).get(error::SLOT_MESSAGE).value {
            Value::Text(id) => self.heap.text(id).as_str().to_string(),
            _ => String::new(),
        }
    }

    /// Resolves a raised condition to its error context.
    pub(crate) fn resolve_raised(&self, raised: Raised) -> NodeId {
        match raised {
            Raised::Error(node) => node,
            Raised::OutOfMemory => self.prebuilt_oom,
            Raised::StackOverflow => self.prebuilt_overflow,
            Raised::Halted => self.prebuilt_halt,
        }
    }

    // --- rescue barrier ---------------------------------------------------

    pub(crate) fn snapshot(&self) -> RescueSnapshot {
        RescueSnapshot {
            data_stack: self.ds.depth(),
            guarded: self.heap.guarded_len(),
            manuals: self.heap.manuals_len(),
            mold_bytes: self.mold.byte_len(),
            mold_chars: self.mold.char_len(),
            mold_stack: self.mold.stack_len(),
            frames: self.frames.len(),
            signals: self.signals,
        }
    }

    /// Fail cleanup: abort frames above the barrier and truncate every
    /// shared structure back to the snapshot.
    pub(crate) fn restore(&mut self, snap: RescueSnapshot) {
        while self.frames.len() > snap.frames {
            let frame = self.frames.pop().expect("frame count checked");
            if !frame.flags.contains(FrameFlags::KEEP_VARLIST) {
                self.heap.expire_frame(frame.varlist);
            }
        }
        self.ds.truncate(snap.data_stack);
        self.heap.truncate_guarded(snap.guarded);
        self.heap.truncate_manuals(snap.manuals);
        self.mold.truncate(snap.mold_bytes, snap.mold_chars, snap.mold_stack);
        // intersect rather than assign: a signal consumed during the
        // failed evaluation must not come back to life
        self.signals &= snap.signals;
    }

    /// Runs `body` under a rescue barrier. A raised condition restores
    /// the snapshot and comes back as the error context node.
    pub(crate) fn rescue_raised<R>(
        &mut self,
        body: impl FnOnce(&mut Self) -> RunResult<R>,
    ) -> Result<R, NodeId> {
        let snap = self.snapshot();
        match body(self) {
            Ok(value) => {
                debug_assert_eq!(self.snapshot(), snap, "unbalanced state at rescue exit");
                Ok(value)
            }
            Err(raised) => {
                let node = self.resolve_raised(raised);
                self.restore(snap);
                Err(node)
            }
        }
    }

    // --- signals ----------------------------------------------------------

    /// Requests that the next evaluator step raise a halt.
    pub fn request_halt(&mut self) {
        self.signals |= SIG_HALT;
    }

    pub(crate) fn check_signals(&mut self) -> RunResult<()> {
        if self.signals & SIG_HALT != 0 {
            self.signals &= !SIG_HALT;
            return Err(Raised::Halted);
        }
        Ok(())
    }

    // --- collection --------------------------------------------------------

    /// Runs a collection now, rooting the frame stack, data stack, mold
    /// stack, current feed, and boot globals.
    pub fn recycle(&mut self) -> usize {
        let mut roots = vec![
            self.lib,
            self.error_keylist,
            self.prebuilt_overflow,
            self.prebuilt_oom,
            self.prebuilt_halt,
        ];
        roots.extend_from_slice(&self.native_actions);
        for frame in &self.frames {
            frame.node_roots(&mut roots);
        }
        self.ds.node_roots(&mut roots);
        self.mold.node_roots(&mut roots);
        if let Some((feed, _)) = self.recent_feed {
            roots.push(feed);
        }
        let report: CollectReport = self.heap.collect(roots);
        self.tracer.event(&TraceEvent::Gc {
            freed_nodes: report.freed_nodes,
        });
        report.freed_nodes
    }

    pub(crate) fn maybe_collect(&mut self) {
        if self.heap.should_collect() {
            self.recycle();
        }
    }

    // --- introspection -----------------------------------------------------

    /// Arena statistics snapshot.
    #[must_use]
    pub fn stats(&self) -> HeapStats {
        self.heap.stats(self.syms.len())
    }

    // --- lib context --------------------------------------------------------

    /// Defines (or overwrites) a word in lib.
    pub(crate) fn define_in_lib(&mut self, sym: SymbolId, cell: Cell) -> RunResult<usize> {
        if let Some(index) = crate::bind::find_in_context(&self.heap, self.lib, sym) {
            *self.heap.context_mut(self.lib).get_mut(index) = cell;
            Ok(index)
        } else {
            crate::bind::expand_context(&mut self.heap, self.lib, sym, cell)
        }
    }

    /// Molds a value to an owned string, honoring an explicit or
    /// configured character limit.
    pub(crate) fn mold_to_string(&mut self, cell: &Cell, form: bool, limit: Option<usize>) -> String {
        let push = self.mold.begin();
        mold_cell(&self.heap, &self.syms, &mut self.mold, cell, form);
        let mut out = self.mold.extract(push);
        let limit = limit.or(self.config.mold_limit);
        if let Some(max) = limit
            && out.chars().count() > max
        {
            let truncated: String = out.chars().take(max).collect();
            out = truncated + "...";
        }
        out
    }
}
