//! The evaluator: step classification, enfix lookahead, argument
//! fulfillment, and the dispatch loop.
//!
//! Evaluation is re-entrant over a [`Feed`] cursor. One *step* produces
//! one value (or an invisible, or a bubbling throw); a *to-end* run
//! folds steps left to right, keeping its running output parked on the
//! data stack so the collector can always see it. Action invocation
//! pushes a frame, fulfills arguments per parameter class against the
//! action's *underlying* paramlist shape, then loops the dispatcher
//! until it stops redoing.
//!
//! Throw travels as an ordinary `Ok(...Thrown)` value through every
//! layer; fail travels as `Err(Raised)` and is invisible to this module
//! beyond `?`.

use smallvec::SmallVec;

use crate::{
    bind::{resolve_word, Resolve, Specifier},
    cell::{
        unquote_cell, ActionRef, Cell, CellFlags, ContextKind, Kind, Param, ParamClass, SeriesRef, Value, Word,
    },
    error::ErrorId,
    frame::{Frame, FrameFlags},
    heap::{NodeFlags, NodeId},
    intern::SymbolId,
    machine::Machine,
    resource::MemTracker,
    trace::TraceEvent,
    types::{ActionFlags, Dispatcher},
    unwind::{Flow, Raised, RunResult, Thrown},
};

/// A source cursor: array position plus the specifier resolving the
/// relative words inside it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Feed {
    pub node: NodeId,
    pub index: usize,
    pub specifier: Specifier,
}

/// Result of running a feed to its end.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Eval {
    Done(Cell),
    Thrown(Thrown),
}

/// Result of one evaluator step.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Step {
    Value(Cell),
    Invisible,
    Thrown(Thrown),
}

/// Result of fetching one argument's worth of evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Fetched {
    Value(Cell),
    Thrown(Thrown),
    End,
}

/// How a path is being used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PathMode {
    /// Actions at the end of the path are invoked (refinements apply).
    Eval,
    /// Fetch only; actions come back as values.
    Get,
}

impl<T: MemTracker> Machine<T> {
    // --- entry points -----------------------------------------------------

    /// Evaluates an array from a series reference to its end.
    pub(crate) fn do_series(&mut self, series: SeriesRef) -> RunResult<Eval> {
        let mut feed = Feed {
            node: series.node,
            index: series.index as usize,
            specifier: series.specifier,
        };
        self.heap.guard(feed.node);
        let result = self.eval_feed_to_end(&mut feed);
        self.heap.unguard(feed.node);
        result
    }

    /// Folds steps until the feed is exhausted. An empty feed yields the
    /// nulled non-value; invisibles leave the running output untouched.
    pub(crate) fn eval_feed_to_end(&mut self, feed: &mut Feed) -> RunResult<Eval> {
        let out_mark = self.ds.mark();
        self.ds.push(Cell::NULLED);
        let result = loop {
            if feed.index >= self.heap.array(feed.node).len() {
                break Eval::Done(self.ds.at(out_mark));
            }
            match self.eval_step(feed, true, true)? {
                Step::Value(v) => self.ds.set_at(out_mark, v),
                Step::Invisible => {}
                Step::Thrown(t) => break Eval::Thrown(t),
            }
        };
        self.ds.drop_to(out_mark);
        Ok(result)
    }

    // --- the single step --------------------------------------------------

    /// One evaluation step. `statement` marks the outermost expression
    /// level (where deferred enfix may finally run); `lookahead` gates
    /// enfix entirely (tight argument fulfillment turns it off).
    fn eval_step(&mut self, feed: &mut Feed, statement: bool, lookahead: bool) -> RunResult<Step> {
        self.check_signals()?;
        self.maybe_collect();
        self.recent_feed = Some((feed.node, feed.index as u32));

        let cell = *self.heap.array(feed.node).get(feed.index).expect("feed bounds checked");
        feed.index += 1;

        let mut current = if cell.quote > 0 {
            // quoted values are inert; evaluation peels one level
            Step::Value(unquote_cell(&mut self.heap, &cell)?)
        } else {
            match cell.value {
                Value::Word(w) => {
                    let (slot, flags) = self.word_value(&w, feed.specifier)?;
                    if slot.quote == 0
                        && let Value::Action(action) = slot.value
                    {
                        if flags.contains(CellFlags::ENFIXED) {
                            let name = Cell::of(Value::Word(w));
                            return Err(self.raise(ErrorId::NoLeftArg, &[name]));
                        }
                        self.invoke(feed, action, Some(w.sym), None, false, &[])?
                    } else if slot.is_nulled() {
                        let name = Cell::of(Value::Word(w));
                        return Err(self.raise(ErrorId::NoValue, &[name]));
                    } else {
                        Step::Value(slot.copied())
                    }
                }
                Value::GetWord(w) => {
                    let (slot, _flags) = self.word_value(&w, feed.specifier)?;
                    Step::Value(slot.copied())
                }
                Value::LitWord(w) => Step::Value(Cell::of(Value::Word(w))),
                Value::SetWord(w) => match self.eval_next_value(feed, true)? {
                    Fetched::End => {
                        let name = Cell::of(Value::SetWord(w));
                        return Err(self.raise(ErrorId::NeedNonEnd, &[name]));
                    }
                    Fetched::Thrown(t) => Step::Thrown(t),
                    Fetched::Value(v) => {
                        self.assign_word(&w, feed.specifier, v)?;
                        Step::Value(v)
                    }
                },
                Value::Group(s) => {
                    let series = SeriesRef {
                        node: s.node,
                        index: s.index,
                        specifier: Specifier::derive(feed.specifier, s.specifier),
                    };
                    match self.do_series(series)? {
                        Eval::Done(v) => Step::Value(v),
                        Eval::Thrown(t) => Step::Thrown(t),
                    }
                }
                Value::Path(s) => self.eval_path(feed, s, PathMode::Eval)?,
                Value::GetPath(s) => self.eval_path(feed, s, PathMode::Get)?,
                Value::SetPath(s) => match self.eval_next_value(feed, true)? {
                    Fetched::End => {
                        let name = cell.copied();
                        return Err(self.raise(ErrorId::NeedNonEnd, &[name]));
                    }
                    Fetched::Thrown(t) => Step::Thrown(t),
                    Fetched::Value(v) => {
                        self.assign_path(feed, s, v)?;
                        Step::Value(v)
                    }
                },
                Value::Block(s) => Step::Value(inherit_specifier(cell, Value::Block, s, feed.specifier)),
                Value::Action(action) => self.invoke(feed, action, None, None, false, &[])?,
                _ => Step::Value(cell.copied()),
            }
        };

        if lookahead && let Step::Value(value) = current {
            current = self.lookahead_enfix(feed, value, statement)?;
        }
        Ok(current)
    }

    /// Steps until a real value (skipping invisibles) or the feed ends.
    pub(crate) fn eval_next_value(&mut self, feed: &mut Feed, lookahead: bool) -> RunResult<Fetched> {
        loop {
            if feed.index >= self.heap.array(feed.node).len() {
                return Ok(Fetched::End);
            }
            match self.eval_step(feed, false, lookahead)? {
                Step::Value(v) => return Ok(Fetched::Value(v)),
                Step::Invisible => {}
                Step::Thrown(t) => return Ok(Fetched::Thrown(t)),
            }
        }
    }

    // --- enfix ------------------------------------------------------------

    /// After producing a value, checks whether the next feed item is an
    /// enfixed variable and, if so, re-enters invocation with the value
    /// as the left operand. Defer-lookback and postpone-entirely hold
    /// the action back until the statement level reaches it.
    fn lookahead_enfix(&mut self, feed: &mut Feed, mut value: Cell, statement: bool) -> RunResult<Step> {
        loop {
            let Some(&next) = self.heap.array(feed.node).get(feed.index) else {
                break;
            };
            if next.quote != 0 {
                break;
            }
            let Value::Word(w) = next.value else { break };
            let Some((slot, flags)) = self.peek_word_value(&w, feed.specifier) else {
                break;
            };
            if !flags.contains(CellFlags::ENFIXED) || slot.quote != 0 {
                break;
            }
            let Value::Action(action) = slot.value else { break };
            let aflags = self.heap.paramlist(action.paramlist).flags;
            let defers = aflags.contains(ActionFlags::DEFERS_LOOKBACK)
                || aflags.contains(ActionFlags::POSTPONES_ENTIRELY);
            if defers && !statement {
                // the enclosing expression finishes first; the statement
                // level re-runs this lookahead with the full result
                break;
            }
            feed.index += 1;
            match self.invoke(feed, action, Some(w.sym), Some(value), true, &[])? {
                Step::Value(v) => value = v,
                Step::Invisible => {}
                Step::Thrown(t) => return Ok(Step::Thrown(t)),
            }
        }
        Ok(Step::Value(value))
    }

    // --- word access ------------------------------------------------------

    /// Resolution with the module-level fallback: a word with no binding
    /// of its own reaches whatever lib defines under its symbol. This is
    /// what lets code reference definitions made earlier in the same
    /// evaluation (set-words expand lib at runtime, after host words
    /// were already built).
    fn resolve_with_lib(&self, word: &Word, specifier: Specifier) -> Resolve {
        match resolve_word(&self.heap, word, specifier) {
            Resolve::Unbound => match crate::bind::find_in_context(&self.heap, self.lib, word.sym) {
                Some(index) => Resolve::Slot(self.lib, index),
                None => Resolve::Unbound,
            },
            other => other,
        }
    }

    /// Reads a word's storage slot, failing on unbound or expired.
    pub(crate) fn word_value(&mut self, word: &Word, specifier: Specifier) -> RunResult<(Cell, CellFlags)> {
        match self.resolve_with_lib(word, specifier) {
            Resolve::Slot(varlist, index) => {
                let slot = *self.heap.context(varlist).get(index);
                Ok((slot, slot.flags))
            }
            Resolve::Unbound | Resolve::NoFrame => {
                let name = Cell::of(Value::Word(*word));
                Err(self.raise(ErrorId::NotBound, &[name]))
            }
            Resolve::Expired => Err(self.raise(ErrorId::ExpiredFrame, &[])),
        }
    }

    /// Quiet resolution for lookahead: no failure, just `None` when the
    /// word does not reach readable storage.
    fn peek_word_value(&self, word: &Word, specifier: Specifier) -> Option<(Cell, CellFlags)> {
        match self.resolve_with_lib(word, specifier) {
            Resolve::Slot(varlist, index) => {
                let slot = *self.heap.context(varlist).get(index);
                Some((slot, slot.flags))
            }
            _ => None,
        }
    }

    /// Set-word assignment. Unbound set-words expand the lib context,
    /// the way module-level definition works.
    pub(crate) fn assign_word(&mut self, word: &Word, specifier: Specifier, value: Cell) -> RunResult<()> {
        match self.resolve_with_lib(word, specifier) {
            Resolve::Slot(varlist, index) => {
                let slot = self.heap.context(varlist).get(index);
                if slot.flags.contains(CellFlags::PROTECTED) {
                    let name = Cell::of(Value::Word(*word));
                    return Err(self.raise(ErrorId::Protected, &[name]));
                }
                *self.heap.context_mut(varlist).get_mut(index) = value.copied();
                Ok(())
            }
            Resolve::Unbound | Resolve::NoFrame => {
                let lib = self.lib;
                crate::bind::expand_context(&mut self.heap, lib, word.sym, value.copied())?;
                Ok(())
            }
            Resolve::Expired => Err(self.raise(ErrorId::ExpiredFrame, &[])),
        }
    }

    // --- paths ------------------------------------------------------------

    /// Walks a path left to right, dispatching per-kind picking; groups
    /// evaluate in place. In `Eval` mode a trailing action is invoked
    /// with the collected refinements.
    fn eval_path(&mut self, feed: &mut Feed, s: SeriesRef, mode: PathMode) -> RunResult<Step> {
        let spec = Specifier::derive(feed.specifier, s.specifier);
        let cells: Vec<Cell> = self.heap.array(s.node).cells_at(s.index).to_vec();
        if cells.is_empty() {
            let path = Cell::of(Value::Path(s));
            return Err(self.raise(ErrorId::BadPath, &[path]));
        }

        let mut head_sym = None;
        let mut current = match cells[0].value {
            Value::Word(w) => {
                head_sym = Some(w.sym);
                self.word_value(&w, spec)?.0
            }
            _ => cells[0].copied(),
        };

        let mut refinements: SmallVec<[SymbolId; 4]> = SmallVec::new();
        for elem in &cells[1..] {
            if let Value::Action(_) = current.value {
                // remaining path elements name refinements
                match elem.value {
                    Value::Word(w) => refinements.push(w.sym),
                    _ => {
                        let path = Cell::of(Value::Path(s));
                        return Err(self.raise(ErrorId::BadPath, &[path]));
                    }
                }
                continue;
            }
            let picker = match elem.value {
                Value::Group(g) => {
                    let series = SeriesRef {
                        node: g.node,
                        index: g.index,
                        specifier: Specifier::derive(spec, g.specifier),
                    };
                    match self.do_series(series)? {
                        Eval::Done(v) => v,
                        Eval::Thrown(t) => return Ok(Step::Thrown(t)),
                    }
                }
                _ => elem.copied(),
            };
            current = self.pick(&current, &picker, s)?;
        }

        if let Value::Action(action) = current.value {
            match mode {
                PathMode::Eval => return self.invoke(feed, action, head_sym, None, false, &refinements),
                PathMode::Get => {}
            }
        }
        Ok(Step::Value(current))
    }

    /// One picking step of path traversal.
    fn pick(&mut self, target: &Cell, picker: &Cell, path: SeriesRef) -> RunResult<Cell> {
        let bad_path = |m: &mut Self| {
            let p = Cell::of(Value::Path(path));
            Err(m.raise(ErrorId::BadPath, &[p]))
        };
        match (target.value, picker.value) {
            (Value::Context(_, varlist), Value::Word(w)) => {
                match crate::bind::find_in_context(&self.heap, varlist, w.sym) {
                    Some(index) => Ok(self.heap.context(varlist).get(index).copied()),
                    None => bad_path(self),
                }
            }
            (Value::Block(s) | Value::Group(s), Value::Integer(n)) => {
                if n < 1 {
                    return bad_path(self);
                }
                let at = s.index as usize + (n as usize) - 1;
                Ok(self
                    .heap
                    .array(s.node)
                    .get(at)
                    .map_or(Cell::NULLED, |c| {
                        let copied = c.copied();
                        match copied.value {
                            Value::Block(inner) => inherit_specifier(copied, Value::Block, inner, s.specifier),
                            _ => copied,
                        }
                    }))
            }
            (Value::Text(id), Value::Integer(n)) => {
                if n < 1 {
                    return bad_path(self);
                }
                Ok(self
                    .heap
                    .text(id)
                    .char_at(n as usize - 1)
                    .map_or(Cell::NULLED, |c| Cell::of(Value::Char(c))))
            }
            (Value::Binary(id), Value::Integer(n)) => {
                if n < 1 {
                    return bad_path(self);
                }
                Ok(self
                    .heap
                    .binary(id)
                    .as_bytes()
                    .get(n as usize - 1)
                    .map_or(Cell::NULLED, |&b| Cell::integer(i64::from(b))))
            }
            _ => bad_path(self),
        }
    }

    /// Set-path assignment: walk to the last container, then poke.
    fn assign_path(&mut self, feed: &mut Feed, s: SeriesRef, value: Cell) -> RunResult<()> {
        let spec = Specifier::derive(feed.specifier, s.specifier);
        let cells: Vec<Cell> = self.heap.array(s.node).cells_at(s.index).to_vec();
        if cells.len() < 2 {
            let path = Cell::of(Value::SetPath(s));
            return Err(self.raise(ErrorId::BadPath, &[path]));
        }
        let mut current = match cells[0].value {
            Value::Word(w) => self.word_value(&w, spec)?.0,
            _ => cells[0].copied(),
        };
        for elem in &cells[1..cells.len() - 1] {
            let picker = elem.copied();
            current = self.pick(&current, &picker, s)?;
        }
        let last = cells[cells.len() - 1].copied();
        match (current.value, last.value) {
            (Value::Context(_, varlist), Value::Word(w)) => {
                match crate::bind::find_in_context(&self.heap, varlist, w.sym) {
                    Some(index) => {
                        if self.heap.context(varlist).get(index).flags.contains(CellFlags::PROTECTED) {
                            let name = Cell::of(Value::Word(w));
                            return Err(self.raise(ErrorId::Protected, &[name]));
                        }
                        *self.heap.context_mut(varlist).get_mut(index) = value.copied();
                        Ok(())
                    }
                    None => {
                        crate::bind::expand_context(&mut self.heap, varlist, w.sym, value.copied())?;
                        Ok(())
                    }
                }
            }
            (Value::Block(b), Value::Integer(n)) => {
                if n < 1 {
                    let path = Cell::of(Value::SetPath(s));
                    return Err(self.raise(ErrorId::BadPath, &[path]));
                }
                if self.heap.has_flag(b.node, NodeFlags::FROZEN) {
                    let path = Cell::of(Value::SetPath(s));
                    return Err(self.raise(ErrorId::Protected, &[path]));
                }
                let at = b.index as usize + (n as usize) - 1;
                match self.heap.array_mut(b.node).get_mut(at) {
                    Some(slot) => {
                        *slot = value.copied();
                        Ok(())
                    }
                    None => Err(self.raise(ErrorId::PastEnd, &[])),
                }
            }
            _ => {
                let path = Cell::of(Value::SetPath(s));
                Err(self.raise(ErrorId::BadPath, &[path]))
            }
        }
    }

    // --- invocation -------------------------------------------------------

    /// Pushes a frame for an action, fulfills its arguments from the
    /// feed, and runs the dispatch loop.
    fn invoke(
        &mut self,
        feed: &mut Feed,
        action: ActionRef,
        label: Option<SymbolId>,
        left: Option<Cell>,
        enfix: bool,
        refinements: &[SymbolId],
    ) -> RunResult<Step> {
        self.heap.tracker().check_depth(self.frames.len()).map_err(Raised::from)?;

        let surface = action.paramlist;
        let underlying = self.heap.paramlist(surface).underlying;

        // park the left operand where the collector can see it
        let park = self.ds.mark();
        if let Some(l) = left {
            self.ds.push(l);
        }

        let frame_len = self.heap.paramlist(underlying).frame_len();
        let varlist = self.heap.alloc_context(ContextKind::Frame, underlying, frame_len)?;
        self.heap.manage(varlist);
        self.heap.context_mut(varlist).phase = Some(surface);

        self.frames.push(Frame {
            label,
            original: surface,
            phase: surface,
            varlist,
            binding: action.binding,
            feed_node: Some(feed.node),
            feed_index: feed.index as u32,
            specifier: feed.specifier,
            flags: if enfix {
                FrameFlags::FULFILLING_ENFIX
            } else {
                FrameFlags::NONE
            },
            ds_mark: self.ds.depth(),
        });
        self.trace_dispatch(label);

        // fulfillment uses the surface paramlist when its shape matches
        // the underlying (compositions never add parameters)
        let fulfill_list = if self.heap.paramlist(surface).frame_len() == frame_len {
            surface
        } else {
            underlying
        };

        let exemplar = self.find_exemplar(surface);
        let flow = self.fulfill(feed, fulfill_list, varlist, exemplar, left, enfix, label, refinements);
        let flow = match flow {
            Ok(None) => self.run_dispatch(varlist),
            Ok(Some(thrown)) => Ok(Flow::Thrown(thrown)),
            Err(raised) => Err(raised),
        }?;

        let frame = self.frames.pop().expect("invoke pushed this frame");
        debug_assert_eq!(self.ds.depth(), frame.ds_mark, "dispatch left the data stack unbalanced");
        if !frame.flags.contains(FrameFlags::KEEP_VARLIST) {
            self.heap.expire_frame(varlist);
        }
        self.ds.drop_to(park);

        Ok(match flow {
            Flow::Out(v) => Step::Value(v),
            Flow::Invisible => Step::Invisible,
            Flow::Thrown(t) => Step::Thrown(t),
            Flow::Redo { .. } => unreachable!("redo is resolved inside the dispatch loop"),
        })
    }

    /// Fulfills every parameter of the frame. Returns a throw if one of
    /// the argument expressions threw.
    #[expect(clippy::too_many_arguments, reason = "invocation state is wide by nature")]
    fn fulfill(
        &mut self,
        feed: &mut Feed,
        fulfill_list: NodeId,
        varlist: NodeId,
        exemplar: Option<NodeId>,
        mut left: Option<Cell>,
        enfix: bool,
        label: Option<SymbolId>,
        refinements: &[SymbolId],
    ) -> RunResult<Option<Thrown>> {
        let count = self.heap.paramlist(fulfill_list).frame_len() - 1;
        let mut refine_active = true;
        let mut refines_seen: SmallVec<[SymbolId; 4]> = SmallVec::new();
        for i in 1..=count {
            let param = self.heap.paramlist(fulfill_list).param(i - 1);
            if param.class == ParamClass::Refinement && refinements.contains(&param.sym) {
                refines_seen.push(param.sym);
            }

            if let Some(ex) = exemplar {
                let filled = *self.heap.context(ex).get(i);
                if !matches!(filled.value, Value::Param(_)) {
                    let arg = self.typecheck_arg(filled.copied(), &param, label)?;
                    if param.class == ParamClass::Refinement {
                        refine_active = !arg.is_nulled() && arg.is_truthy();
                    }
                    *self.heap.context_mut(varlist).get_mut(i) = arg;
                    continue;
                }
            }

            let slot = match param.class {
                ParamClass::Local => Cell::NULLED,
                ParamClass::Return => Cell::of(Value::Action(ActionRef {
                    paramlist: self.native_action(crate::natives::Native::Return),
                    binding: Some(varlist),
                })),
                ParamClass::Refinement => {
                    refine_active = refinements.contains(&param.sym);
                    Cell::logic(refine_active)
                }
                ParamClass::Variadic => {
                    let rest = Cell::of(Value::Block(SeriesRef {
                        node: feed.node,
                        index: u32::try_from(feed.index).expect("feed index fits u32"),
                        specifier: feed.specifier,
                    }));
                    feed.index = self.heap.array(feed.node).len();
                    let pairing = self.heap.alloc_pairing([rest, Cell::integer(0)])?;
                    self.heap.manage(pairing);
                    Cell::of(Value::Varargs(pairing))
                }
                ParamClass::Normal | ParamClass::Tight | ParamClass::Hard | ParamClass::Soft => {
                    if !refine_active {
                        *self.heap.context_mut(varlist).get_mut(i) = Cell::NULLED;
                        continue;
                    }
                    let fetched = if let Some(l) = left.take() {
                        Fetched::Value(l)
                    } else {
                        match param.class {
                            ParamClass::Normal => self.eval_next_value(feed, !enfix)?,
                            ParamClass::Tight => self.eval_next_value(feed, false)?,
                            ParamClass::Hard => self.fetch_literal(feed, false),
                            ParamClass::Soft => match self.fetch_literal(feed, true) {
                                Fetched::Value(v) => match v.value {
                                    Value::Group(g) if v.quote == 0 => {
                                        let series = SeriesRef {
                                            node: g.node,
                                            index: g.index,
                                            specifier: Specifier::derive(feed.specifier, g.specifier),
                                        };
                                        match self.do_series(series)? {
                                            Eval::Done(v) => Fetched::Value(v),
                                            Eval::Thrown(t) => Fetched::Thrown(t),
                                        }
                                    }
                                    _ => Fetched::Value(v),
                                },
                                other => other,
                            },
                            _ => unreachable!("classes matched above"),
                        }
                    };
                    match fetched {
                        Fetched::Thrown(t) => return Ok(Some(t)),
                        Fetched::End => {
                            let args = self.no_arg_cells(label, param.sym);
                            return Err(self.raise(ErrorId::NoArg, &args));
                        }
                        Fetched::Value(v) => self.typecheck_arg(v, &param, label)?,
                    }
                }
            };
            *self.heap.context_mut(varlist).get_mut(i) = slot;
        }
        if let Some(missing) = refinements.iter().copied().find(|sym| !refines_seen.contains(sym)) {
            let name = Cell::of(Value::Word(Word::unbound(missing)));
            return Err(self.raise(ErrorId::BadRefine, &[name]));
        }
        Ok(None)
    }

    /// Takes the next feed item literally (hard quoting). `soft` only
    /// affects the caller's group handling; the fetch is the same.
    fn fetch_literal(&mut self, feed: &mut Feed, _soft: bool) -> Fetched {
        let Some(&cell) = self.heap.array(feed.node).get(feed.index) else {
            return Fetched::End;
        };
        feed.index += 1;
        let cell = cell.copied();
        Fetched::Value(match cell.value {
            Value::Block(s) => inherit_specifier(cell, Value::Block, s, feed.specifier),
            Value::Group(s) => inherit_specifier(cell, Value::Group, s, feed.specifier),
            _ => cell,
        })
    }

    /// Typeset check with ARG_CHECKED tagging.
    fn typecheck_arg(&mut self, value: Cell, param: &Param, label: Option<SymbolId>) -> RunResult<Cell> {
        if value.flags.contains(CellFlags::ARG_CHECKED) {
            return Ok(value);
        }
        let kind = value.kind();
        let ok = if kind == Kind::Nulled {
            param.types.nullable()
        } else {
            param.types.contains(kind)
        };
        if !ok {
            let name = label.map_or(Cell::BLANK, |sym| Cell::of(Value::Word(Word::unbound(sym))));
            let wanted = Cell::of(Value::Datatype(kind));
            let which = Cell::of(Value::Word(Word::unbound(param.sym)));
            return Err(self.raise(ErrorId::ExpectArg, &[name, wanted, which]));
        }
        let mut out = value;
        out.flags = out.flags.with(CellFlags::ARG_CHECKED);
        Ok(out)
    }

    fn no_arg_cells(&self, label: Option<SymbolId>, param: SymbolId) -> [Cell; 2] {
        [
            label.map_or(Cell::BLANK, |sym| Cell::of(Value::Word(Word::unbound(sym)))),
            Cell::of(Value::Word(Word::unbound(param))),
        ]
    }

    fn trace_dispatch(&mut self, label: Option<SymbolId>) {
        let text = label.map(|sym| self.syms.spelling(sym).to_string());
        self.tracer.event(&TraceEvent::Dispatch { label: text });
    }

    /// The nearest specialization exemplar in the phase chain, already
    /// merged by SPECIALIZE at composition time. Walks through every
    /// composition layer that delegates to an inner action.
    pub(crate) fn find_exemplar(&self, surface: NodeId) -> Option<NodeId> {
        let mut current = surface;
        loop {
            let plist = self.heap.paramlist(current);
            let details = plist.details;
            match plist.dispatcher {
                Dispatcher::Specializer => {
                    return match self.heap.array(details).get(0).map(|c| c.value) {
                        Some(Value::Context(ContextKind::Frame, exemplar)) => Some(exemplar),
                        _ => None,
                    };
                }
                Dispatcher::Adapter => match self.heap.array(details).get(1).map(|c| c.value) {
                    Some(Value::Action(inner)) => current = inner.paramlist,
                    _ => return None,
                },
                Dispatcher::Skinner | Dispatcher::Encloser | Dispatcher::Hijacker => {
                    match self.heap.array(details).get(0).map(|c| c.value) {
                        Some(Value::Action(inner)) => current = inner.paramlist,
                        _ => return None,
                    }
                }
                Dispatcher::Chainer => {
                    // the first pipeline action is the interface
                    let first = match self.heap.array(details).get(0).map(|c| c.value) {
                        Some(Value::Block(s)) => self.heap.array(s.node).cells_at(s.index).first().map(|c| c.value),
                        _ => None,
                    };
                    match first {
                        Some(Value::Action(inner)) => current = inner.paramlist,
                        _ => return None,
                    }
                }
                Dispatcher::Noop | Dispatcher::Returner | Dispatcher::Typechecker | Dispatcher::Native(_) => {
                    return None;
                }
            }
        }
    }

    // --- dispatch ---------------------------------------------------------

    /// Loops the current frame's dispatcher until it produces a result,
    /// catching definitional throws that target this frame and
    /// re-checking returns when the surface demands it.
    pub(crate) fn run_dispatch(&mut self, varlist: NodeId) -> RunResult<Flow> {
        loop {
            let phase = self.frames.last().expect("dispatch needs a frame").phase;
            let flow = self.dispatch_once(varlist, phase)?;
            match flow {
                Flow::Redo { checked } => {
                    if !checked {
                        self.recheck_frame_args(varlist)?;
                    }
                }
                Flow::Thrown(t) => {
                    if t.target() == Some(varlist) {
                        let caught = t.arg;
                        return Ok(Flow::Out(self.recheck_return(caught)?));
                    }
                    self.tracer.event(&TraceEvent::Throw {
                        label: format!("{:?}", t.label.value.kind()),
                    });
                    return Ok(Flow::Thrown(t));
                }
                Flow::Out(v) => return Ok(Flow::Out(self.recheck_return(v)?)),
                Flow::Invisible => return Ok(Flow::Invisible),
            }
        }
    }

    /// Redo-unchecked support: re-verifies every fulfilled slot against
    /// the current phase's typesets after a dispatcher mutated the frame.
    fn recheck_frame_args(&mut self, varlist: NodeId) -> RunResult<()> {
        let frame = *self.frames.last().expect("dispatch needs a frame");
        let count = self.heap.paramlist(frame.phase).frame_len() - 1;
        for i in 1..=count {
            let param = self.heap.paramlist(frame.phase).param(i - 1);
            if matches!(param.class, ParamClass::Local | ParamClass::Return) {
                continue;
            }
            let mut slot = *self.heap.context(varlist).get(i);
            slot.flags = slot.flags.without(CellFlags::ARG_CHECKED);
            let checked = self.typecheck_arg(slot, &param, frame.label)?;
            *self.heap.context_mut(varlist).get_mut(i) = checked;
        }
        Ok(())
    }

    /// Return-slot typechecking: used on normal completion and on
    /// definitional-return catches.
    fn recheck_return(&mut self, value: Cell) -> RunResult<Cell> {
        let frame = *self.frames.last().expect("dispatch needs a frame");
        let surface = self.heap.paramlist(frame.original);
        let check_list = if surface.flags.contains(ActionFlags::RETURN_RECHECK) {
            surface.facade.unwrap_or(frame.original)
        } else {
            frame.original
        };
        let plist = self.heap.paramlist(check_list);
        let ret = plist
            .params()
            .iter()
            .filter_map(|c| match c.value {
                Value::Param(p) if p.class == ParamClass::Return => Some(p),
                _ => None,
            })
            .next();
        let Some(param) = ret else { return Ok(value) };
        if param.types == crate::cell::TypeSet::NONE {
            return Ok(value);
        }
        let mut unchecked = value;
        unchecked.flags = unchecked.flags.without(CellFlags::ARG_CHECKED);
        self.typecheck_arg(unchecked, &param, frame.label)
    }

    /// One dispatcher activation for the frame's current phase.
    fn dispatch_once(&mut self, varlist: NodeId, phase: NodeId) -> RunResult<Flow> {
        let plist = self.heap.paramlist(phase);
        let dispatcher = plist.dispatcher;
        let details = plist.details;
        match dispatcher {
            Dispatcher::Noop | Dispatcher::Returner => {
                let body = *self.heap.array(details).get(0).expect("body details");
                let Value::Block(s) = body.value else {
                    panic!("interpreted action body is not a block");
                };
                let series = SeriesRef {
                    node: s.node,
                    index: s.index,
                    specifier: Specifier::Frame(varlist),
                };
                match self.do_series(series)? {
                    Eval::Done(v) => Ok(Flow::Out(v)),
                    Eval::Thrown(t) => Ok(Flow::Thrown(t)),
                }
            }
            Dispatcher::Adapter => {
                let prelude = *self.heap.array(details).get(0).expect("adapter prelude");
                let inner = *self.heap.array(details).get(1).expect("adapter inner");
                let Value::Block(s) = prelude.value else {
                    panic!("adapter prelude is not a block");
                };
                let series = SeriesRef {
                    node: s.node,
                    index: s.index,
                    specifier: Specifier::Frame(varlist),
                };
                if let Eval::Thrown(t) = self.do_series(series)? {
                    return Ok(Flow::Thrown(t));
                }
                let Value::Action(inner) = inner.value else {
                    panic!("adapter inner is not an action");
                };
                self.set_phase(varlist, inner.paramlist);
                Ok(Flow::Redo { checked: true })
            }
            Dispatcher::Specializer | Dispatcher::Skinner => {
                let inner_at = match dispatcher {
                    Dispatcher::Specializer => 1,
                    _ => 0,
                };
                let inner = *self.heap.array(details).get(inner_at).expect("composition inner");
                let Value::Action(inner) = inner.value else {
                    panic!("composition inner is not an action");
                };
                self.set_phase(varlist, inner.paramlist);
                Ok(Flow::Redo { checked: true })
            }
            Dispatcher::Chainer => {
                let pipeline = *self.heap.array(details).get(0).expect("chain pipeline");
                let Value::Block(s) = pipeline.value else {
                    panic!("chain pipeline is not a block");
                };
                let actions: Vec<ActionRef> = self
                    .heap
                    .array(s.node)
                    .cells_at(s.index)
                    .iter()
                    .filter_map(|c| match c.value {
                        Value::Action(a) => Some(a),
                        _ => None,
                    })
                    .collect();
                let first = *actions.first().expect("chain pipeline is empty");
                self.set_phase(varlist, first.paramlist);
                let mut flow = self.run_dispatch(varlist)?;
                for action in &actions[1..] {
                    let value = match flow {
                        Flow::Out(v) => v,
                        Flow::Invisible => Cell::NULLED,
                        Flow::Thrown(t) => return Ok(Flow::Thrown(t)),
                        Flow::Redo { .. } => unreachable!("run_dispatch resolves redo"),
                    };
                    let park = self.ds.mark();
                    self.ds.push(value);
                    flow = self.apply_action(*action, &[value], None)?;
                    self.ds.drop_to(park);
                }
                Ok(flow)
            }
            Dispatcher::Encloser => {
                let inner = *self.heap.array(details).get(0).expect("enclose inner");
                let outer = *self.heap.array(details).get(1).expect("enclose outer");
                let (Value::Action(inner), Value::Action(outer)) = (inner.value, outer.value) else {
                    panic!("enclose details are not actions");
                };
                let frame = self.frames.last_mut().expect("dispatch needs a frame");
                frame.flags = frame.flags.with(FrameFlags::KEEP_VARLIST);
                self.heap.context_mut(varlist).phase = Some(inner.paramlist);
                let frame_value = Cell::of(Value::Context(ContextKind::Frame, varlist));
                self.apply_action(outer, &[frame_value], None)
            }
            Dispatcher::Hijacker => {
                let replacement = *self.heap.array(details).get(0).expect("hijack replacement");
                let Value::Action(replacement) = replacement.value else {
                    panic!("hijack replacement is not an action");
                };
                if self.heap.paramlist(replacement.paramlist).underlying
                    == self.heap.paramlist(phase).underlying
                {
                    // args were checked against the old interface, not
                    // the replacement's
                    self.set_phase(varlist, replacement.paramlist);
                    return Ok(Flow::Redo { checked: false });
                }
                // incompatible shapes: shim rebuilds a frame from the
                // current argument values
                let args: Vec<Cell> = self.frame_args(varlist);
                self.apply_action(replacement, &args, None)
            }
            Dispatcher::Typechecker => {
                let test = *self.heap.array(details).get(0).expect("typechecker test");
                let arg = *self.heap.context(varlist).get(1);
                let matched = match test.value {
                    Value::Datatype(kind) => arg.kind() == kind,
                    Value::Typeset(set) => set.contains(arg.kind()),
                    _ => panic!("typechecker details are not a type test"),
                };
                Ok(Flow::Out(Cell::logic(matched)))
            }
            Dispatcher::Native(native) => crate::natives::call_native(self, varlist, native),
        }
    }

    fn set_phase(&mut self, varlist: NodeId, phase: NodeId) {
        self.frames.last_mut().expect("dispatch needs a frame").phase = phase;
        self.heap.context_mut(varlist).phase = Some(phase);
    }

    /// The current non-local argument values, in parameter order.
    fn frame_args(&self, varlist: NodeId) -> Vec<Cell> {
        let keylist = self.heap.context(varlist).keylist;
        let keys = self.heap.keys_of(keylist).to_vec();
        let mut args = Vec::new();
        for (i, key) in keys.iter().enumerate().skip(1) {
            if let Value::Param(p) = key.value
                && !matches!(p.class, ParamClass::Local | ParamClass::Return)
            {
                args.push(*self.heap.context(varlist).get(i));
            }
        }
        args
    }

    /// Invokes an action on explicit positional arguments (no feed).
    ///
    /// APPLY, CHAIN piping, the hijack shim, and DO-of-frame all come
    /// through here.
    pub(crate) fn apply_action(
        &mut self,
        action: ActionRef,
        args: &[Cell],
        label: Option<SymbolId>,
    ) -> RunResult<Flow> {
        self.heap.tracker().check_depth(self.frames.len()).map_err(Raised::from)?;

        let surface = action.paramlist;
        let underlying = self.heap.paramlist(surface).underlying;
        let frame_len = self.heap.paramlist(underlying).frame_len();
        let varlist = self.heap.alloc_context(ContextKind::Frame, underlying, frame_len)?;
        self.heap.manage(varlist);
        self.heap.context_mut(varlist).phase = Some(surface);

        self.frames.push(Frame {
            label,
            original: surface,
            phase: surface,
            varlist,
            binding: action.binding,
            feed_node: None,
            feed_index: 0,
            specifier: Specifier::None,
            flags: FrameFlags::NONE,
            ds_mark: self.ds.depth(),
        });
        self.trace_dispatch(label);

        let fulfill_list = if self.heap.paramlist(surface).frame_len() == frame_len {
            surface
        } else {
            underlying
        };
        let exemplar = self.find_exemplar(surface);

        let filled = self.fill_positional(fulfill_list, varlist, exemplar, args, label);
        let flow = match filled {
            Ok(()) => self.run_dispatch(varlist),
            Err(raised) => Err(raised),
        }?;

        let frame = self.frames.pop().expect("apply pushed this frame");
        debug_assert_eq!(self.ds.depth(), frame.ds_mark, "dispatch left the data stack unbalanced");
        if !frame.flags.contains(FrameFlags::KEEP_VARLIST) {
            self.heap.expire_frame(varlist);
        }
        Ok(flow)
    }

    fn fill_positional(
        &mut self,
        fulfill_list: NodeId,
        varlist: NodeId,
        exemplar: Option<NodeId>,
        args: &[Cell],
        label: Option<SymbolId>,
    ) -> RunResult<()> {
        let count = self.heap.paramlist(fulfill_list).frame_len() - 1;
        let mut supplied = args.iter().copied();
        for i in 1..=count {
            let param = self.heap.paramlist(fulfill_list).param(i - 1);

            if let Some(ex) = exemplar {
                let filled = *self.heap.context(ex).get(i);
                if !matches!(filled.value, Value::Param(_)) {
                    let arg = self.typecheck_arg(filled.copied(), &param, label)?;
                    *self.heap.context_mut(varlist).get_mut(i) = arg;
                    continue;
                }
            }

            let slot = match param.class {
                ParamClass::Local => Cell::NULLED,
                ParamClass::Return => Cell::of(Value::Action(ActionRef {
                    paramlist: self.native_action(crate::natives::Native::Return),
                    binding: Some(varlist),
                })),
                _ => match supplied.next() {
                    Some(v) => self.typecheck_arg(v, &param, label)?,
                    None => {
                        if param.types.nullable() || param.class == ParamClass::Refinement {
                            Cell::NULLED
                        } else {
                            let args = self.no_arg_cells(label, param.sym);
                            return Err(self.raise(ErrorId::NoArg, &args));
                        }
                    }
                },
            };
            *self.heap.context_mut(varlist).get_mut(i) = slot;
        }
        if supplied.next().is_some() {
            let extra = Cell::integer(args.len() as i64);
            return Err(self.raise(ErrorId::InvalidArg, &[extra]));
        }
        Ok(())
    }

    /// DO of a FRAME! value: runs the frame's phase in place, then the
    /// activation is spent.
    pub(crate) fn do_frame(&mut self, varlist: NodeId) -> RunResult<Flow> {
        if self.heap.has_flag(varlist, NodeFlags::FRAME_EXPIRED) {
            return Err(self.raise(ErrorId::ExpiredFrame, &[]));
        }
        self.heap.tracker().check_depth(self.frames.len()).map_err(Raised::from)?;
        let keylist = self.heap.context(varlist).keylist;
        let phase = self.heap.context(varlist).phase.unwrap_or(keylist);
        self.frames.push(Frame {
            label: None,
            original: phase,
            phase,
            varlist,
            binding: None,
            feed_node: None,
            feed_index: 0,
            specifier: Specifier::None,
            flags: FrameFlags::NONE,
            ds_mark: self.ds.depth(),
        });
        let flow = self.run_dispatch(varlist);
        self.frames.pop().expect("do_frame pushed this frame");
        if flow.is_ok() {
            self.heap.expire_frame(varlist);
        }
        flow
    }

    /// Pulls the next value from a varargs handle, evaluating from the
    /// captured feed position.
    pub(crate) fn take_vararg(&mut self, pairing: NodeId) -> RunResult<Option<Eval>> {
        let [source, taken] = *self.heap.pairing(pairing);
        let Value::Block(s) = source.value else {
            panic!("varargs pairing does not hold its source");
        };
        let Value::Integer(n) = taken.value else {
            panic!("varargs pairing does not hold its cursor");
        };
        let mut feed = Feed {
            node: s.node,
            index: s.index as usize + usize::try_from(n).expect("vararg cursor"),
            specifier: s.specifier,
        };
        match self.eval_next_value(&mut feed, true)? {
            Fetched::End => Ok(None),
            Fetched::Thrown(t) => Ok(Some(Eval::Thrown(t))),
            Fetched::Value(v) => {
                let consumed = feed.index - s.index as usize;
                self.heap.pairing_mut(pairing)[1] = Cell::integer(consumed as i64);
                Ok(Some(Eval::Done(v)))
            }
        }
    }

    pub(crate) fn native_action(&self, native: crate::natives::Native) -> NodeId {
        self.native_actions[native as usize]
    }
}

/// Rewraps an array cell so it inherits the traversal's specifier.
fn inherit_specifier(cell: Cell, ctor: fn(SeriesRef) -> Value, s: SeriesRef, outer: Specifier) -> Cell {
    let mut out = cell;
    out.value = ctor(SeriesRef {
        node: s.node,
        index: s.index,
        specifier: Specifier::derive(outer, s.specifier),
    });
    out
}
