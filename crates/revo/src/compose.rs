//! Action composition: FUNC, SPECIALIZE, ADAPT, CHAIN, ENCLOSE, HIJACK,
//! TIGHTEN, RESKIN, TYPECHECKER.
//!
//! Every builder here produces a fresh paramlist node (a fresh action
//! *identity*) while sharing the target's *underlying* paramlist, so
//! that no matter how many layers wrap an interpreted function, words
//! bound relative to it keep resolving against the one frame shape the
//! composition bottoms out in.

use std::str::FromStr;

use crate::{
    cell::{
        ActionRef, Cell, ContextKind, Kind, Param, ParamClass, SeriesRef, TypeSet, Value, ANY_VALUE, OPT_ANY_VALUE,
    },
    error::ErrorId,
    eval::Eval,
    heap::{NodeData, NodeId},
    intern::Sym,
    machine::Machine,
    resource::MemTracker,
    types::{ActionFlags, Array, Dispatcher},
    unwind::RunResult,
};

impl<T: MemTracker> Machine<T> {
    // --- interpreted functions --------------------------------------------

    /// FUNC: builds an interpreted action from a spec block and a body.
    ///
    /// Spec conventions: plain word = normal parameter, lit-word = hard
    /// quote, get-word = soft quote, `/word` = refinement, a block after
    /// a parameter narrows its typeset. A definitional RETURN slot is
    /// always appended, and the body is bound relative to the new
    /// paramlist so every activation instantiates it through its own
    /// frame.
    pub(crate) fn make_func(&mut self, spec: SeriesRef, body: SeriesRef) -> RunResult<ActionRef> {
        let mut params = self.parse_spec(spec)?;
        params.push(Param {
            sym: Sym::Return.into(),
            class: ParamClass::Return,
            types: TypeSet::NONE,
        });

        let details = self.heap.alloc(NodeData::Array(Array::from_cells(vec![Cell::of(Value::Block(
            SeriesRef {
                node: body.node,
                index: body.index,
                specifier: crate::bind::Specifier::None,
            },
        ))])))?;
        self.heap.manage(details);
        let paramlist = self
            .heap
            .alloc_paramlist(&params, None, Dispatcher::Returner, details, ActionFlags::NONE)?;
        self.heap.manage(paramlist);

        crate::bind::bind_array_relative(&mut self.heap, body.node, paramlist);
        Ok(ActionRef {
            paramlist,
            binding: None,
        })
    }

    /// Parses a FUNC-style parameter spec block.
    fn parse_spec(&mut self, spec: SeriesRef) -> RunResult<Vec<Param>> {
        let cells: Vec<Cell> = self.heap.array(spec.node).cells_at(spec.index).to_vec();
        let mut params: Vec<Param> = Vec::new();
        for cell in cells {
            match cell.value {
                Value::Word(w) => {
                    let spelling = self.syms.spelling(w.sym).to_string();
                    let class = if spelling.starts_with('/') {
                        ParamClass::Refinement
                    } else {
                        ParamClass::Normal
                    };
                    let sym = if spelling.starts_with('/') {
                        self.syms.intern(&spelling[1..])
                    } else {
                        w.sym
                    };
                    params.push(Param {
                        sym,
                        class,
                        types: if class == ParamClass::Refinement {
                            TypeSet::of(Kind::Logic).with(Kind::Nulled)
                        } else {
                            ANY_VALUE
                        },
                    });
                }
                Value::LitWord(w) => params.push(Param {
                    sym: w.sym,
                    class: ParamClass::Hard,
                    types: ANY_VALUE.with(Kind::Nulled),
                }),
                Value::GetWord(w) => params.push(Param {
                    sym: w.sym,
                    class: ParamClass::Soft,
                    types: ANY_VALUE.with(Kind::Nulled),
                }),
                Value::Block(s) => {
                    // a types block narrows the preceding parameter; a
                    // varargs! entry switches it to on-demand pulling
                    let types = self.parse_typeset(s)?;
                    let Some(last) = params.last_mut() else {
                        let bad = cell.copied();
                        return Err(self.raise(ErrorId::InvalidArg, &[bad]));
                    };
                    if types.contains(Kind::Varargs) {
                        last.class = ParamClass::Variadic;
                        last.types = OPT_ANY_VALUE;
                    } else {
                        last.types = types;
                    }
                }
                Value::Text(_) => {} // description strings are HELP-only
                _ => {
                    let bad = cell.copied();
                    return Err(self.raise(ErrorId::InvalidArg, &[bad]));
                }
            }
        }
        Ok(params)
    }

    /// Reads a `[integer! text! ...]` block into a typeset.
    fn parse_typeset(&mut self, s: SeriesRef) -> RunResult<TypeSet> {
        let cells: Vec<Cell> = self.heap.array(s.node).cells_at(s.index).to_vec();
        let mut types = TypeSet::NONE;
        for cell in cells {
            let Value::Word(w) = cell.value else {
                let bad = cell.copied();
                return Err(self.raise(ErrorId::InvalidArg, &[bad]));
            };
            let spelling = self.syms.spelling(w.sym).to_string();
            let name = spelling.strip_suffix('!').unwrap_or(&spelling);
            match Kind::from_str(name) {
                Ok(kind) => types = types.with(kind),
                Err(_) => {
                    let bad = cell.copied();
                    return Err(self.raise(ErrorId::InvalidType, &[bad]));
                }
            }
        }
        Ok(types)
    }

    // --- identity helpers -------------------------------------------------

    /// Clones an action into a fresh identity with the same params,
    /// dispatcher, details, and underlying. COPY of an action, and the
    /// save-the-original half of HIJACK.
    pub(crate) fn clone_action(&mut self, action: ActionRef) -> RunResult<ActionRef> {
        let src = self.heap.paramlist(action.paramlist);
        let params = param_vec(src.params());
        let underlying = src.underlying;
        let dispatcher = src.dispatcher;
        let details = src.details;
        let flags = src.flags;
        let facade = src.facade;
        let paramlist = self
            .heap
            .alloc_paramlist(&params, Some(underlying), dispatcher, details, flags)?;
        self.heap.paramlist_mut(paramlist).facade = facade;
        self.heap.manage(paramlist);
        Ok(ActionRef {
            paramlist,
            binding: action.binding,
        })
    }

    // --- composition builders ---------------------------------------------

    /// SPECIALIZE: evaluates a fills block inside an exemplar frame;
    /// slots the block assigns are skipped at fulfillment ever after.
    pub(crate) fn specialize_action(&mut self, action: ActionRef, fills: SeriesRef) -> RunResult<ActionRef> {
        let surface = action.paramlist;
        let underlying = self.heap.paramlist(surface).underlying;
        let frame_len = self.heap.paramlist(underlying).frame_len();

        let exemplar = self.heap.alloc_context(ContextKind::Frame, underlying, frame_len)?;
        self.heap.manage(exemplar);
        // seed slots: inherit the inner exemplar's fills, or mark
        // unfilled with the param cell itself
        let inherited = self.find_exemplar(surface);
        for i in 1..frame_len {
            let seed = match inherited {
                Some(inner) => *self.heap.context(inner).get(i),
                None => {
                    let param = self.heap.paramlist(underlying).param(i - 1);
                    Cell::of(Value::Param(param))
                }
            };
            *self.heap.context_mut(exemplar).get_mut(i) = seed;
        }

        self.heap.guard(exemplar);
        crate::bind::bind_array_to_context(&mut self.heap, fills.node, exemplar);
        let run = self.do_series(fills);
        self.heap.unguard(exemplar);
        if let Eval::Thrown(t) = run? {
            return Err(self.raise(ErrorId::NoCatch, &[t.label]));
        }

        let params = param_vec(self.heap.paramlist(surface).params());
        let details = self.alloc_details(&[
            Cell::of(Value::Context(ContextKind::Frame, exemplar)),
            Cell::of(Value::Action(action)),
        ])?;
        let paramlist = self.heap.alloc_paramlist(
            &params,
            Some(underlying),
            Dispatcher::Specializer,
            details,
            ActionFlags::NONE,
        )?;
        self.heap.manage(paramlist);
        Ok(ActionRef {
            paramlist,
            binding: None,
        })
    }

    /// ADAPT: a prelude block runs in the fulfilled frame before the
    /// inner action dispatches.
    pub(crate) fn adapt_action(&mut self, action: ActionRef, prelude: SeriesRef) -> RunResult<ActionRef> {
        let surface = action.paramlist;
        let underlying = self.heap.paramlist(surface).underlying;
        crate::bind::bind_array_relative(&mut self.heap, prelude.node, underlying);
        let params = param_vec(self.heap.paramlist(surface).params());
        let details = self.alloc_details(&[
            Cell::of(Value::Block(SeriesRef {
                node: prelude.node,
                index: prelude.index,
                specifier: crate::bind::Specifier::None,
            })),
            Cell::of(Value::Action(action)),
        ])?;
        let paramlist = self
            .heap
            .alloc_paramlist(&params, Some(underlying), Dispatcher::Adapter, details, ActionFlags::NONE)?;
        self.heap.manage(paramlist);
        Ok(ActionRef {
            paramlist,
            binding: None,
        })
    }

    /// CHAIN: the first action is the interface; each later action takes
    /// the previous result as its sole argument.
    pub(crate) fn chain_actions(&mut self, pipeline: &[ActionRef]) -> RunResult<ActionRef> {
        let first = *pipeline.first().expect("chain caller checked arity");
        let surface = first.paramlist;
        let underlying = self.heap.paramlist(surface).underlying;
        let params = param_vec(self.heap.paramlist(surface).params());

        let action_cells: Vec<Cell> = pipeline.iter().map(|&a| Cell::of(Value::Action(a))).collect();
        let block = self.heap.alloc(NodeData::Array(Array::from_cells(action_cells)))?;
        self.heap.manage(block);
        let details = self.alloc_details(&[Cell::of(Value::Block(SeriesRef::head(block)))])?;
        let paramlist = self
            .heap
            .alloc_paramlist(&params, Some(underlying), Dispatcher::Chainer, details, ActionFlags::NONE)?;
        self.heap.manage(paramlist);
        Ok(ActionRef {
            paramlist,
            binding: None,
        })
    }

    /// ENCLOSE: outer receives the pre-built, unrun inner frame.
    pub(crate) fn enclose_action(&mut self, inner: ActionRef, outer: ActionRef) -> RunResult<ActionRef> {
        let surface = inner.paramlist;
        let underlying = self.heap.paramlist(surface).underlying;
        let params = param_vec(self.heap.paramlist(surface).params());
        let details = self.alloc_details(&[Cell::of(Value::Action(inner)), Cell::of(Value::Action(outer))])?;
        let paramlist = self
            .heap
            .alloc_paramlist(&params, Some(underlying), Dispatcher::Encloser, details, ActionFlags::NONE)?;
        self.heap.manage(paramlist);
        Ok(ActionRef {
            paramlist,
            binding: None,
        })
    }

    /// HIJACK: the target's identity now runs the replacement; the old
    /// behavior comes back as a fresh action.
    ///
    /// Compatible paramlists (same underlying) alias the replacement's
    /// dispatcher and details directly; incompatible ones install a shim
    /// that rebuilds a frame at each call.
    pub(crate) fn hijack_action(&mut self, target: ActionRef, replacement: ActionRef) -> RunResult<ActionRef> {
        let old = self.clone_action(target)?;
        let compatible = self.heap.paramlist(target.paramlist).underlying
            == self.heap.paramlist(replacement.paramlist).underlying;
        if compatible {
            let src = self.heap.paramlist(replacement.paramlist);
            let dispatcher = src.dispatcher;
            let details = src.details;
            let dst = self.heap.paramlist_mut(target.paramlist);
            dst.dispatcher = dispatcher;
            dst.details = details;
        } else {
            let details = self.alloc_details(&[Cell::of(Value::Action(replacement))])?;
            let dst = self.heap.paramlist_mut(target.paramlist);
            dst.dispatcher = Dispatcher::Hijacker;
            dst.details = details;
        }
        Ok(old)
    }

    /// TIGHTEN: an alias whose normal parameters are all tight.
    pub(crate) fn tighten_action(&mut self, action: ActionRef) -> RunResult<ActionRef> {
        let alias = self.clone_action(action)?;
        for cell in self.heap.paramlist_mut(alias.paramlist).params_mut() {
            if let Value::Param(mut p) = cell.value
                && p.class == ParamClass::Normal
            {
                p.class = ParamClass::Tight;
                cell.value = Value::Param(p);
            }
        }
        Ok(alias)
    }

    /// RESKIN: alters parameter classes and types per a FUNC-style spec.
    /// Broadening any typeset installs the deferred return re-check.
    pub(crate) fn reskin_action(&mut self, action: ActionRef, spec: SeriesRef) -> RunResult<ActionRef> {
        let surface = action.paramlist;
        let underlying = self.heap.paramlist(surface).underlying;
        let skin = self.parse_spec(spec)?;

        let mut params = param_vec(self.heap.paramlist(surface).params());
        let mut broadened = false;
        for new in &skin {
            let Some(old) = params.iter_mut().find(|p| p.sym == new.sym) else {
                let name = Cell::of(Value::Word(crate::cell::Word::unbound(new.sym)));
                return Err(self.raise(ErrorId::InvalidArg, &[name]));
            };
            if new.types.0 & !old.types.0 != 0 {
                broadened = true;
            }
            old.class = new.class;
            old.types = new.types;
        }

        let surface_details = self.heap.paramlist(surface).details;
        let facade = self.heap.alloc_paramlist(
            &params,
            Some(underlying),
            Dispatcher::Skinner,
            surface_details,
            ActionFlags::NONE,
        )?;
        self.heap.manage(facade);

        let details = self.alloc_details(&[Cell::of(Value::Action(action))])?;
        let flags = if broadened {
            ActionFlags::RETURN_RECHECK
        } else {
            ActionFlags::NONE
        };
        let paramlist = self
            .heap
            .alloc_paramlist(&params, Some(underlying), Dispatcher::Skinner, details, flags)?;
        self.heap.paramlist_mut(paramlist).facade = Some(facade);
        self.heap.manage(paramlist);
        Ok(ActionRef {
            paramlist,
            binding: None,
        })
    }

    /// TYPECHECKER: an arity-1 predicate against a datatype or typeset.
    pub(crate) fn make_typechecker(&mut self, test: Cell) -> RunResult<ActionRef> {
        let params = [Param {
            sym: Sym::Value.into(),
            class: ParamClass::Normal,
            types: OPT_ANY_VALUE,
        }];
        let details = self.alloc_details(&[test])?;
        let paramlist = self
            .heap
            .alloc_paramlist(&params, None, Dispatcher::Typechecker, details, ActionFlags::NONE)?;
        self.heap.manage(paramlist);
        Ok(ActionRef {
            paramlist,
            binding: None,
        })
    }

    // --- shared plumbing --------------------------------------------------

    fn alloc_details(&mut self, cells: &[Cell]) -> RunResult<NodeId> {
        let details = self.heap.alloc(NodeData::Array(Array::from_cells(cells.to_vec())))?;
        self.heap.manage(details);
        Ok(details)
    }
}

fn param_vec(cells: &[Cell]) -> Vec<Param> {
    cells
        .iter()
        .filter_map(|c| match c.value {
            Value::Param(p) => Some(p),
            _ => None,
        })
        .collect()
}
