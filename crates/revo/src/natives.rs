//! The native registry: boot-time binding of Rust dispatchers to words.
//!
//! Each entry in [`SPECS`] pairs a lib word with a parameter spec and a
//! [`Native`] discriminant; [`install`] walks the table, builds a
//! paramlist per native, and defines the word (plus any operator alias)
//! in the lib context. The table order must match the enum order, since
//! the resulting action nodes are indexed by discriminant.

use crate::{
    cell::{
        cells_equal, quote_cell, ActionRef, Cell, CellFlags, ContextKind, Kind, Param, ParamClass, SeriesRef,
        TypeSet, Value, Word, ANY_NUMBER, ANY_VALUE, OPT_ANY_VALUE,
    },
    error::ErrorId,
    eval::{Eval, Feed, Fetched},
    heap::{NodeData, NodeId},
    intern::Sym,
    machine::Machine,
    resource::MemTracker,
    types::{ActionFlags, Array, Dispatcher, Text},
    unwind::{Flow, Raised, RunResult, Thrown},
};

/// Dispatcher table index. Order must match [`SPECS`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub(crate) enum Native {
    Do,
    If,
    Either,
    Else,
    Then,
    Any,
    All,
    While,
    Repeat,
    Break,
    Continue,
    Catch,
    Throw,
    Return,
    Func,
    Quote,
    Comment,
    Get,
    Set,
    TypeOf,
    EqualQ,
    LesserQ,
    GreaterQ,
    Not,
    Add,
    Subtract,
    Multiply,
    Divide,
    Negate,
    Copy,
    Append,
    Insert,
    LengthOf,
    Pick,
    First,
    Last,
    Mold,
    Form,
    Reduce,
    Rescue,
    Fail,
    Attempt,
    Specialize,
    Adapt,
    Chain,
    Enclose,
    Hijack,
    Tighten,
    Typechecker,
    Reskin,
    Apply,
    Recycle,
    Stats,
    Take,
    Freeze,
}

#[derive(Debug, Clone, Copy)]
struct ParamSpec {
    sym: Sym,
    class: ParamClass,
    types: TypeSet,
}

#[derive(Debug, Clone, Copy)]
struct NativeSpec {
    name: Sym,
    native: Native,
    /// Define the primary name itself as an enfixed variable.
    enfix: bool,
    /// Additionally define an operator alias, always enfixed.
    alias: Option<Sym>,
    flags: ActionFlags,
    params: &'static [ParamSpec],
}

const fn p(sym: Sym, class: ParamClass, types: TypeSet) -> ParamSpec {
    ParamSpec { sym, class, types }
}

const TS_BLOCK: TypeSet = TypeSet::of(Kind::Block);
const TS_BRANCH: TypeSet = TypeSet::of(Kind::Block).with(Kind::Action);
const TS_INT: TypeSet = TypeSet::of(Kind::Integer);
const TS_ACTION: TypeSet = TypeSet::of(Kind::Action);
const TS_WORD: TypeSet = TypeSet::of(Kind::Word);
const TS_OPT_WORD: TypeSet = TypeSet::of(Kind::Word).with(Kind::Nulled);
const TS_OPT_INT: TypeSet = TypeSet::of(Kind::Integer).with(Kind::Nulled);
const TS_SERIES_MUT: TypeSet = TypeSet::of(Kind::Block).with(Kind::Text).with(Kind::Binary);
const TS_FAIL_REASON: TypeSet = TypeSet::of(Kind::Text)
    .with(Kind::Word)
    .with(Kind::Block)
    .with(Kind::Error);
const TS_TYPE_TEST: TypeSet = TypeSet::of(Kind::Datatype).with(Kind::Typeset);
const TS_TAKE: TypeSet = TypeSet::of(Kind::Block).with(Kind::Varargs);
const TS_REFINE: TypeSet = TypeSet::of(Kind::Logic).with(Kind::Nulled);

/// The boot spec table. Same order as [`Native`].
static SPECS: &[NativeSpec] = &[
    NativeSpec {
        name: Sym::Do,
        native: Native::Do,
        enfix: false,
        alias: None,
        flags: ActionFlags::NONE,
        params: &[p(Sym::Value, ParamClass::Normal, OPT_ANY_VALUE)],
    },
    NativeSpec {
        name: Sym::If,
        native: Native::If,
        enfix: false,
        alias: None,
        flags: ActionFlags::NONE,
        params: &[
            p(Sym::Condition, ParamClass::Normal, OPT_ANY_VALUE),
            p(Sym::Branch, ParamClass::Normal, TS_BRANCH),
        ],
    },
    NativeSpec {
        name: Sym::Either,
        native: Native::Either,
        enfix: false,
        alias: None,
        flags: ActionFlags::NONE,
        params: &[
            p(Sym::Condition, ParamClass::Normal, OPT_ANY_VALUE),
            p(Sym::TrueBranch, ParamClass::Normal, TS_BRANCH),
            p(Sym::FalseBranch, ParamClass::Normal, TS_BRANCH),
        ],
    },
    NativeSpec {
        name: Sym::Else,
        native: Native::Else,
        enfix: true,
        alias: None,
        flags: ActionFlags::DEFERS_LOOKBACK,
        params: &[
            p(Sym::Left, ParamClass::Normal, OPT_ANY_VALUE),
            p(Sym::Branch, ParamClass::Normal, TS_BRANCH),
        ],
    },
    NativeSpec {
        name: Sym::Then,
        native: Native::Then,
        enfix: true,
        alias: None,
        flags: ActionFlags::DEFERS_LOOKBACK,
        params: &[
            p(Sym::Left, ParamClass::Normal, OPT_ANY_VALUE),
            p(Sym::Branch, ParamClass::Normal, TS_BRANCH),
        ],
    },
    NativeSpec {
        name: Sym::Any,
        native: Native::Any,
        enfix: false,
        alias: None,
        flags: ActionFlags::NONE,
        params: &[p(Sym::Block, ParamClass::Normal, TS_BLOCK)],
    },
    NativeSpec {
        name: Sym::All,
        native: Native::All,
        enfix: false,
        alias: None,
        flags: ActionFlags::NONE,
        params: &[p(Sym::Block, ParamClass::Normal, TS_BLOCK)],
    },
    NativeSpec {
        name: Sym::While,
        native: Native::While,
        enfix: false,
        alias: None,
        flags: ActionFlags::NONE,
        params: &[
            p(Sym::Condition, ParamClass::Normal, TS_BLOCK),
            p(Sym::Body, ParamClass::Normal, TS_BLOCK),
        ],
    },
    NativeSpec {
        name: Sym::Repeat,
        native: Native::Repeat,
        enfix: false,
        alias: None,
        flags: ActionFlags::NONE,
        params: &[
            p(Sym::Count, ParamClass::Normal, TS_INT),
            p(Sym::Body, ParamClass::Normal, TS_BLOCK),
        ],
    },
    NativeSpec {
        name: Sym::Break,
        native: Native::Break,
        enfix: false,
        alias: None,
        flags: ActionFlags::NONE,
        params: &[],
    },
    NativeSpec {
        name: Sym::Continue,
        native: Native::Continue,
        enfix: false,
        alias: None,
        flags: ActionFlags::NONE,
        params: &[],
    },
    NativeSpec {
        name: Sym::Catch,
        native: Native::Catch,
        enfix: false,
        alias: None,
        flags: ActionFlags::NONE,
        params: &[
            p(Sym::Block, ParamClass::Normal, TS_BLOCK),
            p(Sym::Name, ParamClass::Refinement, TS_REFINE),
            p(Sym::Word, ParamClass::Normal, TS_OPT_WORD),
        ],
    },
    NativeSpec {
        name: Sym::Throw,
        native: Native::Throw,
        enfix: false,
        alias: None,
        flags: ActionFlags::NONE,
        params: &[
            p(Sym::Value, ParamClass::Normal, OPT_ANY_VALUE),
            p(Sym::Name, ParamClass::Refinement, TS_REFINE),
            p(Sym::Word, ParamClass::Normal, TS_OPT_WORD),
        ],
    },
    NativeSpec {
        name: Sym::Return,
        native: Native::Return,
        enfix: false,
        alias: None,
        flags: ActionFlags::NONE,
        params: &[p(Sym::Value, ParamClass::Normal, OPT_ANY_VALUE)],
    },
    NativeSpec {
        name: Sym::Func,
        native: Native::Func,
        enfix: false,
        alias: None,
        flags: ActionFlags::NONE,
        params: &[
            p(Sym::Spec, ParamClass::Normal, TS_BLOCK),
            p(Sym::Body, ParamClass::Normal, TS_BLOCK),
        ],
    },
    NativeSpec {
        name: Sym::Quote,
        native: Native::Quote,
        enfix: false,
        alias: None,
        flags: ActionFlags::NONE,
        params: &[p(Sym::Value, ParamClass::Hard, OPT_ANY_VALUE)],
    },
    NativeSpec {
        name: Sym::Comment,
        native: Native::Comment,
        enfix: false,
        alias: None,
        flags: ActionFlags::NONE,
        params: &[p(Sym::Value, ParamClass::Hard, ANY_VALUE)],
    },
    NativeSpec {
        name: Sym::Get,
        native: Native::Get,
        enfix: false,
        alias: None,
        flags: ActionFlags::NONE,
        params: &[p(Sym::Word, ParamClass::Normal, TS_WORD)],
    },
    NativeSpec {
        name: Sym::Set,
        native: Native::Set,
        enfix: false,
        alias: None,
        flags: ActionFlags::NONE,
        params: &[
            p(Sym::Word, ParamClass::Normal, TS_WORD),
            p(Sym::Value, ParamClass::Normal, OPT_ANY_VALUE),
        ],
    },
    NativeSpec {
        name: Sym::TypeOf,
        native: Native::TypeOf,
        enfix: false,
        alias: None,
        flags: ActionFlags::NONE,
        params: &[p(Sym::Value, ParamClass::Normal, OPT_ANY_VALUE)],
    },
    NativeSpec {
        name: Sym::EqualQ,
        native: Native::EqualQ,
        enfix: false,
        alias: Some(Sym::OpEqual),
        flags: ActionFlags::NONE,
        params: &[
            p(Sym::Left, ParamClass::Normal, OPT_ANY_VALUE),
            p(Sym::Right, ParamClass::Normal, OPT_ANY_VALUE),
        ],
    },
    NativeSpec {
        name: Sym::LesserQ,
        native: Native::LesserQ,
        enfix: false,
        alias: Some(Sym::OpLesser),
        flags: ActionFlags::NONE,
        params: &[
            p(Sym::Left, ParamClass::Normal, ANY_VALUE),
            p(Sym::Right, ParamClass::Normal, ANY_VALUE),
        ],
    },
    NativeSpec {
        name: Sym::GreaterQ,
        native: Native::GreaterQ,
        enfix: false,
        alias: Some(Sym::OpGreater),
        flags: ActionFlags::NONE,
        params: &[
            p(Sym::Left, ParamClass::Normal, ANY_VALUE),
            p(Sym::Right, ParamClass::Normal, ANY_VALUE),
        ],
    },
    NativeSpec {
        name: Sym::Not,
        native: Native::Not,
        enfix: false,
        alias: None,
        flags: ActionFlags::NONE,
        params: &[p(Sym::Value, ParamClass::Normal, OPT_ANY_VALUE)],
    },
    NativeSpec {
        name: Sym::Add,
        native: Native::Add,
        enfix: false,
        alias: Some(Sym::OpAdd),
        flags: ActionFlags::NONE,
        params: &[
            p(Sym::Left, ParamClass::Normal, ANY_NUMBER),
            p(Sym::Right, ParamClass::Normal, ANY_NUMBER),
        ],
    },
    NativeSpec {
        name: Sym::Subtract,
        native: Native::Subtract,
        enfix: false,
        alias: Some(Sym::OpSubtract),
        flags: ActionFlags::NONE,
        params: &[
            p(Sym::Left, ParamClass::Normal, ANY_NUMBER),
            p(Sym::Right, ParamClass::Normal, ANY_NUMBER),
        ],
    },
    NativeSpec {
        name: Sym::Multiply,
        native: Native::Multiply,
        enfix: false,
        alias: Some(Sym::OpMultiply),
        flags: ActionFlags::NONE,
        params: &[
            p(Sym::Left, ParamClass::Normal, ANY_NUMBER),
            p(Sym::Right, ParamClass::Normal, ANY_NUMBER),
        ],
    },
    NativeSpec {
        name: Sym::Divide,
        native: Native::Divide,
        enfix: false,
        alias: Some(Sym::OpDivide),
        flags: ActionFlags::NONE,
        params: &[
            p(Sym::Left, ParamClass::Normal, ANY_NUMBER),
            p(Sym::Right, ParamClass::Normal, ANY_NUMBER),
        ],
    },
    NativeSpec {
        name: Sym::Negate,
        native: Native::Negate,
        enfix: false,
        alias: None,
        flags: ActionFlags::NONE,
        params: &[p(Sym::Value, ParamClass::Normal, ANY_NUMBER)],
    },
    NativeSpec {
        name: Sym::Copy,
        native: Native::Copy,
        enfix: false,
        alias: None,
        flags: ActionFlags::NONE,
        params: &[
            p(Sym::Value, ParamClass::Normal, ANY_VALUE),
            p(Sym::Deep, ParamClass::Refinement, TS_REFINE),
        ],
    },
    NativeSpec {
        name: Sym::Append,
        native: Native::Append,
        enfix: false,
        alias: None,
        flags: ActionFlags::NONE,
        params: &[
            p(Sym::Series, ParamClass::Normal, TS_SERIES_MUT),
            p(Sym::Value, ParamClass::Normal, ANY_VALUE),
        ],
    },
    NativeSpec {
        name: Sym::Insert,
        native: Native::Insert,
        enfix: false,
        alias: None,
        flags: ActionFlags::NONE,
        params: &[
            p(Sym::Series, ParamClass::Normal, TS_SERIES_MUT),
            p(Sym::Value, ParamClass::Normal, ANY_VALUE),
        ],
    },
    NativeSpec {
        name: Sym::LengthOf,
        native: Native::LengthOf,
        enfix: false,
        alias: None,
        flags: ActionFlags::NONE,
        params: &[p(Sym::Series, ParamClass::Normal, TS_SERIES_MUT)],
    },
    NativeSpec {
        name: Sym::Pick,
        native: Native::Pick,
        enfix: false,
        alias: None,
        flags: ActionFlags::NONE,
        params: &[
            p(Sym::Series, ParamClass::Normal, TS_SERIES_MUT),
            p(Sym::Index, ParamClass::Normal, TS_INT),
        ],
    },
    NativeSpec {
        name: Sym::First,
        native: Native::First,
        enfix: false,
        alias: None,
        flags: ActionFlags::NONE,
        params: &[p(Sym::Series, ParamClass::Normal, TS_SERIES_MUT)],
    },
    NativeSpec {
        name: Sym::Last,
        native: Native::Last,
        enfix: false,
        alias: None,
        flags: ActionFlags::NONE,
        params: &[p(Sym::Series, ParamClass::Normal, TS_SERIES_MUT)],
    },
    NativeSpec {
        name: Sym::Mold,
        native: Native::Mold,
        enfix: false,
        alias: None,
        flags: ActionFlags::NONE,
        params: &[
            p(Sym::Value, ParamClass::Normal, ANY_VALUE),
            p(Sym::Limit, ParamClass::Refinement, TS_REFINE),
            p(Sym::Count, ParamClass::Normal, TS_OPT_INT),
        ],
    },
    NativeSpec {
        name: Sym::Form,
        native: Native::Form,
        enfix: false,
        alias: None,
        flags: ActionFlags::NONE,
        params: &[p(Sym::Value, ParamClass::Normal, ANY_VALUE)],
    },
    NativeSpec {
        name: Sym::Reduce,
        native: Native::Reduce,
        enfix: false,
        alias: None,
        flags: ActionFlags::NONE,
        params: &[p(Sym::Block, ParamClass::Normal, TS_BLOCK)],
    },
    NativeSpec {
        name: Sym::Rescue,
        native: Native::Rescue,
        enfix: false,
        alias: None,
        flags: ActionFlags::NONE,
        params: &[p(Sym::Block, ParamClass::Normal, TS_BLOCK)],
    },
    NativeSpec {
        name: Sym::Fail,
        native: Native::Fail,
        enfix: false,
        alias: None,
        flags: ActionFlags::NONE,
        params: &[p(Sym::Reason, ParamClass::Normal, TS_FAIL_REASON)],
    },
    NativeSpec {
        name: Sym::Attempt,
        native: Native::Attempt,
        enfix: false,
        alias: None,
        flags: ActionFlags::NONE,
        params: &[p(Sym::Block, ParamClass::Normal, TS_BLOCK)],
    },
    NativeSpec {
        name: Sym::Specialize,
        native: Native::Specialize,
        enfix: false,
        alias: None,
        flags: ActionFlags::NONE,
        params: &[
            p(Sym::Action, ParamClass::Normal, TS_ACTION),
            p(Sym::Fills, ParamClass::Normal, TS_BLOCK),
        ],
    },
    NativeSpec {
        name: Sym::Adapt,
        native: Native::Adapt,
        enfix: false,
        alias: None,
        flags: ActionFlags::NONE,
        params: &[
            p(Sym::Action, ParamClass::Normal, TS_ACTION),
            p(Sym::Prelude, ParamClass::Normal, TS_BLOCK),
        ],
    },
    NativeSpec {
        name: Sym::Chain,
        native: Native::Chain,
        enfix: false,
        alias: None,
        flags: ActionFlags::NONE,
        params: &[p(Sym::Pipeline, ParamClass::Normal, TS_BLOCK)],
    },
    NativeSpec {
        name: Sym::Enclose,
        native: Native::Enclose,
        enfix: false,
        alias: None,
        flags: ActionFlags::NONE,
        params: &[
            p(Sym::Inner, ParamClass::Normal, TS_ACTION),
            p(Sym::Outer, ParamClass::Normal, TS_ACTION),
        ],
    },
    NativeSpec {
        name: Sym::Hijack,
        native: Native::Hijack,
        enfix: false,
        alias: None,
        flags: ActionFlags::NONE,
        params: &[
            p(Sym::Target, ParamClass::Normal, TS_ACTION),
            p(Sym::Action, ParamClass::Normal, TS_ACTION),
        ],
    },
    NativeSpec {
        name: Sym::Tighten,
        native: Native::Tighten,
        enfix: false,
        alias: None,
        flags: ActionFlags::NONE,
        params: &[p(Sym::Action, ParamClass::Normal, TS_ACTION)],
    },
    NativeSpec {
        name: Sym::Typechecker,
        native: Native::Typechecker,
        enfix: false,
        alias: None,
        flags: ActionFlags::NONE,
        params: &[p(Sym::Test, ParamClass::Normal, TS_TYPE_TEST)],
    },
    NativeSpec {
        name: Sym::Reskin,
        native: Native::Reskin,
        enfix: false,
        alias: None,
        flags: ActionFlags::NONE,
        params: &[
            p(Sym::Action, ParamClass::Normal, TS_ACTION),
            p(Sym::Spec, ParamClass::Normal, TS_BLOCK),
        ],
    },
    NativeSpec {
        name: Sym::Apply,
        native: Native::Apply,
        enfix: false,
        alias: None,
        flags: ActionFlags::NONE,
        params: &[
            p(Sym::Action, ParamClass::Normal, TS_ACTION),
            p(Sym::Block, ParamClass::Normal, TS_BLOCK),
        ],
    },
    NativeSpec {
        name: Sym::Recycle,
        native: Native::Recycle,
        enfix: false,
        alias: None,
        flags: ActionFlags::NONE,
        params: &[],
    },
    NativeSpec {
        name: Sym::Stats,
        native: Native::Stats,
        enfix: false,
        alias: None,
        flags: ActionFlags::NONE,
        params: &[],
    },
    NativeSpec {
        name: Sym::Take,
        native: Native::Take,
        enfix: false,
        alias: None,
        flags: ActionFlags::NONE,
        params: &[p(Sym::Series, ParamClass::Normal, TS_TAKE)],
    },
    NativeSpec {
        name: Sym::Freeze,
        native: Native::Freeze,
        enfix: false,
        alias: None,
        flags: ActionFlags::NONE,
        params: &[
            p(Sym::Series, ParamClass::Normal, TS_SERIES_MUT),
            p(Sym::Deep, ParamClass::Refinement, TS_REFINE),
        ],
    },
];

/// Builds every native action and defines it in lib.
pub(crate) fn install<T: MemTracker>(machine: &mut Machine<T>) {
    for (i, spec) in SPECS.iter().enumerate() {
        debug_assert_eq!(i, spec.native as usize, "spec table out of order at {}", spec.name);
        let params: Vec<Param> = spec
            .params
            .iter()
            .map(|ps| Param {
                sym: ps.sym.into(),
                class: ps.class,
                types: ps.types,
            })
            .collect();
        let details = machine
            .heap
            .alloc(NodeData::Array(Array::new()))
            .expect("boot: native details");
        machine.heap.manage(details);
        let paramlist = machine
            .heap
            .alloc_paramlist(&params, None, Dispatcher::Native(spec.native), details, spec.flags)
            .expect("boot: native paramlist");
        machine.heap.manage(paramlist);
        machine.native_actions.push(paramlist);

        let action = Cell::of(Value::Action(ActionRef {
            paramlist,
            binding: None,
        }));
        let mut primary = action;
        if spec.enfix {
            primary.flags = primary.flags.with(CellFlags::ENFIXED);
        }
        machine
            .define_in_lib(spec.name.into(), primary)
            .expect("boot: native definition");
        if let Some(alias) = spec.alias {
            let mut aliased = action;
            aliased.flags = aliased.flags.with(CellFlags::ENFIXED);
            machine
                .define_in_lib(alias.into(), aliased)
                .expect("boot: operator alias");
        }
    }
}

/// Outcome of matching a throw against loop catchers.
enum LoopSignal {
    Break,
    Continue,
    Pass(Thrown),
}

/// The native dispatch: one match arm per [`Native`].
pub(crate) fn call_native<T: MemTracker>(machine: &mut Machine<T>, varlist: NodeId, native: Native) -> RunResult<Flow> {
    let arg = |machine: &Machine<T>, i: usize| *machine.heap.context(varlist).get(i);

    match native {
        Native::Do => {
            let value = arg(machine, 1);
            match value.value {
                Value::Block(s) | Value::Group(s) if value.quote == 0 => eval_to_flow(machine.do_series(s)?),
                Value::Action(act) if value.quote == 0 => machine.apply_action(act, &[], None),
                Value::Context(ContextKind::Frame, id) if value.quote == 0 => machine.do_frame(id),
                Value::Context(ContextKind::Error, id) if value.quote == 0 => Err(Raised::Error(id)),
                _ => Ok(Flow::Out(value)),
            }
        }
        Native::If => {
            let condition = arg(machine, 1);
            if condition.is_nulled() || !condition.is_truthy() {
                return Ok(Flow::Out(Cell::NULLED));
            }
            run_branch(machine, arg(machine, 2))
        }
        Native::Either => {
            let condition = arg(machine, 1);
            let branch = if !condition.is_nulled() && condition.is_truthy() {
                arg(machine, 2)
            } else {
                arg(machine, 3)
            };
            run_branch(machine, branch)
        }
        Native::Else => {
            let left = arg(machine, 1);
            if left.is_nulled() {
                run_branch(machine, arg(machine, 2))
            } else {
                Ok(Flow::Out(left))
            }
        }
        Native::Then => {
            let left = arg(machine, 1);
            if left.is_nulled() {
                Ok(Flow::Out(Cell::NULLED))
            } else {
                run_branch(machine, arg(machine, 2))
            }
        }
        Native::Any => {
            let Value::Block(s) = arg(machine, 1).value else {
                unreachable!("typeset checked")
            };
            let mut feed = Feed {
                node: s.node,
                index: s.index as usize,
                specifier: s.specifier,
            };
            loop {
                match machine.eval_next_value(&mut feed, true)? {
                    Fetched::End => return Ok(Flow::Out(Cell::NULLED)),
                    Fetched::Thrown(t) => return Ok(Flow::Thrown(t)),
                    Fetched::Value(v) => {
                        if !v.is_nulled() && v.is_truthy() {
                            return Ok(Flow::Out(v));
                        }
                    }
                }
            }
        }
        Native::All => {
            let Value::Block(s) = arg(machine, 1).value else {
                unreachable!("typeset checked")
            };
            let mut feed = Feed {
                node: s.node,
                index: s.index as usize,
                specifier: s.specifier,
            };
            let mut last = Cell::logic(true);
            loop {
                match machine.eval_next_value(&mut feed, true)? {
                    Fetched::End => return Ok(Flow::Out(last)),
                    Fetched::Thrown(t) => return Ok(Flow::Thrown(t)),
                    Fetched::Value(v) => {
                        if v.is_nulled() || !v.is_truthy() {
                            return Ok(Flow::Out(Cell::NULLED));
                        }
                        last = v;
                    }
                }
            }
        }
        Native::While => {
            let Value::Block(condition) = arg(machine, 1).value else {
                unreachable!("typeset checked")
            };
            let Value::Block(body) = arg(machine, 2).value else {
                unreachable!("typeset checked")
            };
            loop {
                match machine.do_series(condition)? {
                    Eval::Thrown(t) => match loop_signal(machine, t) {
                        LoopSignal::Break => return Ok(Flow::Out(Cell::NULLED)),
                        LoopSignal::Continue => continue,
                        LoopSignal::Pass(t) => return Ok(Flow::Thrown(t)),
                    },
                    Eval::Done(c) => {
                        if c.is_nulled() || !c.is_truthy() {
                            return Ok(Flow::Out(Cell::NULLED));
                        }
                    }
                }
                match machine.do_series(body)? {
                    Eval::Done(_) => {}
                    Eval::Thrown(t) => match loop_signal(machine, t) {
                        LoopSignal::Break => return Ok(Flow::Out(Cell::NULLED)),
                        LoopSignal::Continue => {}
                        LoopSignal::Pass(t) => return Ok(Flow::Thrown(t)),
                    },
                }
            }
        }
        Native::Repeat => {
            let Value::Integer(count) = arg(machine, 1).value else {
                unreachable!("typeset checked")
            };
            let Value::Block(body) = arg(machine, 2).value else {
                unreachable!("typeset checked")
            };
            let mut last = Cell::NULLED;
            for _ in 0..count.max(0) {
                match machine.do_series(body)? {
                    Eval::Done(v) => last = v,
                    Eval::Thrown(t) => match loop_signal(machine, t) {
                        LoopSignal::Break => return Ok(Flow::Out(Cell::NULLED)),
                        LoopSignal::Continue => {}
                        LoopSignal::Pass(t) => return Ok(Flow::Thrown(t)),
                    },
                }
            }
            Ok(Flow::Out(last))
        }
        Native::Break => Ok(Flow::Thrown(Thrown {
            label: Cell::of(Value::Action(ActionRef {
                paramlist: machine.native_action(Native::Break),
                binding: None,
            })),
            arg: Cell::NULLED,
        })),
        Native::Continue => Ok(Flow::Thrown(Thrown {
            label: Cell::of(Value::Action(ActionRef {
                paramlist: machine.native_action(Native::Continue),
                binding: None,
            })),
            arg: Cell::NULLED,
        })),
        Native::Catch => {
            let Value::Block(s) = arg(machine, 1).value else {
                unreachable!("typeset checked")
            };
            let named = arg(machine, 2).is_truthy();
            match machine.do_series(s)? {
                Eval::Done(v) => Ok(Flow::Out(v)),
                Eval::Thrown(t) => {
                    if t.target().is_some() {
                        return Ok(Flow::Thrown(t));
                    }
                    let catches = if named {
                        match (t.label.value, arg(machine, 3).value) {
                            (Value::Word(thrown), Value::Word(wanted)) => thrown.sym == wanted.sym,
                            _ => false,
                        }
                    } else {
                        matches!(t.label.value, Value::Blank)
                    };
                    if catches {
                        Ok(Flow::Out(t.arg))
                    } else {
                        Ok(Flow::Thrown(t))
                    }
                }
            }
        }
        Native::Throw => {
            let value = arg(machine, 1);
            let label = if arg(machine, 2).is_truthy() {
                arg(machine, 3)
            } else {
                Cell::BLANK
            };
            Ok(Flow::Thrown(Thrown { label, arg: value }))
        }
        Native::Return => {
            let value = arg(machine, 1);
            let target = machine.frames.last().and_then(|f| f.binding);
            let Some(target) = target else {
                let name = Cell::of(Value::Word(Word::unbound(Sym::Return.into())));
                return Err(machine.raise(ErrorId::NoCatch, &[name]));
            };
            Ok(Flow::Thrown(Thrown {
                label: Cell::of(Value::Action(ActionRef {
                    paramlist: machine.native_action(Native::Return),
                    binding: Some(target),
                })),
                arg: value,
            }))
        }
        Native::Func => {
            let (Value::Block(spec), Value::Block(body)) = (arg(machine, 1).value, arg(machine, 2).value) else {
                unreachable!("typeset checked")
            };
            let action = machine.make_func(spec, body)?;
            Ok(Flow::Out(Cell::of(Value::Action(action))))
        }
        Native::Quote => {
            let value = arg(machine, 1);
            Ok(Flow::Out(quote_cell(&mut machine.heap, value, 1)?))
        }
        Native::Comment => Ok(Flow::Invisible),
        Native::Get => {
            let Value::Word(w) = arg(machine, 1).value else {
                unreachable!("typeset checked")
            };
            let (slot, _flags) = machine.word_value(&w, crate::bind::Specifier::None)?;
            Ok(Flow::Out(slot))
        }
        Native::Set => {
            let Value::Word(w) = arg(machine, 1).value else {
                unreachable!("typeset checked")
            };
            let value = arg(machine, 2);
            machine.assign_word(&w, crate::bind::Specifier::None, value)?;
            Ok(Flow::Out(value))
        }
        Native::TypeOf => Ok(Flow::Out(Cell::of(Value::Datatype(arg(machine, 1).kind())))),
        Native::EqualQ => {
            let equal = cells_equal(&machine.heap, &arg(machine, 1), &arg(machine, 2), 0);
            Ok(Flow::Out(Cell::logic(equal)))
        }
        Native::LesserQ => compare_native(machine, varlist, std::cmp::Ordering::Less),
        Native::GreaterQ => compare_native(machine, varlist, std::cmp::Ordering::Greater),
        Native::Not => {
            let value = arg(machine, 1);
            let truthy = !value.is_nulled() && value.is_truthy();
            Ok(Flow::Out(Cell::logic(!truthy)))
        }
        Native::Add => math_native(machine, varlist, MathOp::Add),
        Native::Subtract => math_native(machine, varlist, MathOp::Subtract),
        Native::Multiply => math_native(machine, varlist, MathOp::Multiply),
        Native::Divide => math_native(machine, varlist, MathOp::Divide),
        Native::Negate => {
            let value = arg(machine, 1);
            match value.value {
                Value::Integer(n) => match n.checked_neg() {
                    Some(out) => Ok(Flow::Out(Cell::integer(out))),
                    None => Err(machine.raise(ErrorId::Overflow, &[])),
                },
                Value::Decimal(d) => Ok(Flow::Out(Cell::of(Value::Decimal(-d)))),
                _ => unreachable!("typeset checked"),
            }
        }
        Native::Copy => copy_native(machine, varlist),
        Native::Append => {
            let series = arg(machine, 1);
            let value = arg(machine, 2);
            series_insert(machine, series, value, InsertAt::Tail)?;
            Ok(Flow::Out(series))
        }
        Native::Insert => {
            let series = arg(machine, 1);
            let value = arg(machine, 2);
            series_insert(machine, series, value, InsertAt::Position)?;
            let advanced = match series.value {
                Value::Block(s) => Cell::of(Value::Block(SeriesRef {
                    node: s.node,
                    index: s.index + 1,
                    specifier: s.specifier,
                })),
                _ => series,
            };
            Ok(Flow::Out(advanced))
        }
        Native::LengthOf => {
            let len = match arg(machine, 1).value {
                Value::Block(s) => machine.heap.array(s.node).cells_at(s.index).len(),
                Value::Text(id) => machine.heap.text(id).len_chars(),
                Value::Binary(id) => machine.heap.binary(id).len(),
                _ => unreachable!("typeset checked"),
            };
            Ok(Flow::Out(Cell::integer(len as i64)))
        }
        Native::Pick => {
            let Value::Integer(n) = arg(machine, 2).value else {
                unreachable!("typeset checked")
            };
            if n < 1 {
                return Ok(Flow::Out(Cell::NULLED));
            }
            pick_at(machine, arg(machine, 1), n as usize - 1)
        }
        Native::First => pick_at(machine, arg(machine, 1), 0),
        Native::Last => {
            let series = arg(machine, 1);
            let len = match series.value {
                Value::Block(s) => machine.heap.array(s.node).cells_at(s.index).len(),
                Value::Text(id) => machine.heap.text(id).len_chars(),
                Value::Binary(id) => machine.heap.binary(id).len(),
                _ => unreachable!("typeset checked"),
            };
            if len == 0 {
                return Ok(Flow::Out(Cell::NULLED));
            }
            pick_at(machine, series, len - 1)
        }
        Native::Mold => {
            let value = arg(machine, 1);
            let limit = if arg(machine, 2).is_truthy() {
                match arg(machine, 3).value {
                    Value::Integer(n) if n >= 0 => Some(n as usize),
                    _ => None,
                }
            } else {
                None
            };
            let text = machine.mold_to_string(&value, false, limit);
            let node = machine.heap.alloc(NodeData::Text(Text::from_string(text)))?;
            machine.heap.manage(node);
            Ok(Flow::Out(Cell::of(Value::Text(node))))
        }
        Native::Form => {
            let text = machine.mold_to_string(&arg(machine, 1), true, None);
            let node = machine.heap.alloc(NodeData::Text(Text::from_string(text)))?;
            machine.heap.manage(node);
            Ok(Flow::Out(Cell::of(Value::Text(node))))
        }
        Native::Reduce => {
            let Value::Block(s) = arg(machine, 1).value else {
                unreachable!("typeset checked")
            };
            match reduce_into(machine, s)? {
                Err(t) => Ok(Flow::Thrown(t)),
                Ok(values) => {
                    let node = machine.heap.alloc(NodeData::Array(Array::from_cells(values)))?;
                    machine.heap.manage(node);
                    Ok(Flow::Out(Cell::of(Value::Block(SeriesRef::head(node)))))
                }
            }
        }
        Native::Rescue => {
            let Value::Block(s) = arg(machine, 1).value else {
                unreachable!("typeset checked")
            };
            match machine.rescue_raised(|m| m.do_series(s)) {
                Ok(Eval::Done(v)) => Ok(Flow::Out(v)),
                // throw is not an error: it crosses the rescue untouched
                Ok(Eval::Thrown(t)) => Ok(Flow::Thrown(t)),
                Err(error) => Ok(Flow::Out(Cell::of(Value::Context(ContextKind::Error, error)))),
            }
        }
        Native::Fail => {
            let reason = arg(machine, 1);
            match reason.value {
                Value::Context(ContextKind::Error, id) => Err(Raised::Error(id)),
                Value::Text(_) | Value::Word(_) => Err(machine.raise(ErrorId::User, &[reason])),
                Value::Block(_) => {
                    let formed = machine.mold_to_string(&reason, true, None);
                    let node = machine.heap.alloc(NodeData::Text(Text::from_string(formed)))?;
                    machine.heap.manage(node);
                    let text = Cell::of(Value::Text(node));
                    Err(machine.raise(ErrorId::User, &[text]))
                }
                _ => unreachable!("typeset checked"),
            }
        }
        Native::Attempt => {
            let Value::Block(s) = arg(machine, 1).value else {
                unreachable!("typeset checked")
            };
            match machine.rescue_raised(|m| m.do_series(s)) {
                Ok(Eval::Done(v)) => Ok(Flow::Out(v)),
                Ok(Eval::Thrown(t)) => Ok(Flow::Thrown(t)),
                Err(_error) => Ok(Flow::Out(Cell::NULLED)),
            }
        }
        Native::Specialize => {
            let (Value::Action(action), Value::Block(fills)) = (arg(machine, 1).value, arg(machine, 2).value) else {
                unreachable!("typeset checked")
            };
            let out = machine.specialize_action(action, fills)?;
            Ok(Flow::Out(Cell::of(Value::Action(out))))
        }
        Native::Adapt => {
            let (Value::Action(action), Value::Block(prelude)) = (arg(machine, 1).value, arg(machine, 2).value) else {
                unreachable!("typeset checked")
            };
            let out = machine.adapt_action(action, prelude)?;
            Ok(Flow::Out(Cell::of(Value::Action(out))))
        }
        Native::Chain => {
            let Value::Block(s) = arg(machine, 1).value else {
                unreachable!("typeset checked")
            };
            let values = match reduce_into(machine, s)? {
                Err(t) => return Ok(Flow::Thrown(t)),
                Ok(values) => values,
            };
            let pipeline: Vec<ActionRef> = values
                .iter()
                .filter_map(|c| match c.value {
                    Value::Action(a) => Some(a),
                    _ => None,
                })
                .collect();
            if pipeline.len() != values.len() || pipeline.is_empty() {
                let bad = arg(machine, 1);
                return Err(machine.raise(ErrorId::InvalidArg, &[bad]));
            }
            let out = machine.chain_actions(&pipeline)?;
            Ok(Flow::Out(Cell::of(Value::Action(out))))
        }
        Native::Enclose => {
            let (Value::Action(inner), Value::Action(outer)) = (arg(machine, 1).value, arg(machine, 2).value) else {
                unreachable!("typeset checked")
            };
            let out = machine.enclose_action(inner, outer)?;
            Ok(Flow::Out(Cell::of(Value::Action(out))))
        }
        Native::Hijack => {
            let (Value::Action(target), Value::Action(replacement)) = (arg(machine, 1).value, arg(machine, 2).value)
            else {
                unreachable!("typeset checked")
            };
            let old = machine.hijack_action(target, replacement)?;
            Ok(Flow::Out(Cell::of(Value::Action(old))))
        }
        Native::Tighten => {
            let Value::Action(action) = arg(machine, 1).value else {
                unreachable!("typeset checked")
            };
            let out = machine.tighten_action(action)?;
            Ok(Flow::Out(Cell::of(Value::Action(out))))
        }
        Native::Typechecker => {
            let out = machine.make_typechecker(arg(machine, 1))?;
            Ok(Flow::Out(Cell::of(Value::Action(out))))
        }
        Native::Reskin => {
            let (Value::Action(action), Value::Block(spec)) = (arg(machine, 1).value, arg(machine, 2).value) else {
                unreachable!("typeset checked")
            };
            let out = machine.reskin_action(action, spec)?;
            Ok(Flow::Out(Cell::of(Value::Action(out))))
        }
        Native::Apply => {
            let (Value::Action(action), Value::Block(s)) = (arg(machine, 1).value, arg(machine, 2).value) else {
                unreachable!("typeset checked")
            };
            let args = match reduce_into(machine, s)? {
                Err(t) => return Ok(Flow::Thrown(t)),
                Ok(values) => values,
            };
            let park = machine.ds.mark();
            for &cell in &args {
                machine.ds.push(cell);
            }
            let flow = machine.apply_action(action, &args, None);
            machine.ds.drop_to(park);
            flow
        }
        Native::Recycle => {
            let freed = machine.recycle();
            Ok(Flow::Out(Cell::integer(freed as i64)))
        }
        Native::Stats => {
            let live = machine.stats().live_nodes;
            Ok(Flow::Out(Cell::integer(live as i64)))
        }
        Native::Take => {
            let series = arg(machine, 1);
            match series.value {
                // varargs pull: evaluate one value from the captured feed
                Value::Varargs(pairing) => match machine.take_vararg(pairing)? {
                    None => Ok(Flow::Out(Cell::NULLED)),
                    Some(Eval::Done(v)) => Ok(Flow::Out(v)),
                    Some(Eval::Thrown(t)) => Ok(Flow::Thrown(t)),
                },
                Value::Block(s) => {
                    if machine.heap.has_flag(s.node, crate::heap::NodeFlags::FROZEN) {
                        return Err(machine.raise(ErrorId::Protected, &[series]));
                    }
                    let at = s.index as usize;
                    let Some(&taken) = machine.heap.array(s.node).get(at) else {
                        return Ok(Flow::Out(Cell::NULLED));
                    };
                    machine.heap.array_mut(s.node).remove_range(at, 1);
                    Ok(Flow::Out(taken.copied()))
                }
                _ => unreachable!("typeset checked"),
            }
        }
        Native::Freeze => {
            let series = arg(machine, 1);
            let deep = arg(machine, 2).is_truthy();
            let node = match series.value {
                Value::Block(s) => s.node,
                Value::Text(id) | Value::Binary(id) => id,
                _ => unreachable!("typeset checked"),
            };
            freeze_node(machine, node, deep);
            Ok(Flow::Out(series))
        }
    }
}

/// Sets the immutability flags; /deep walks every reachable array once.
fn freeze_node<T: MemTracker>(machine: &mut Machine<T>, root: NodeId, deep: bool) {
    use crate::heap::NodeFlags;
    if !deep {
        machine.heap.set_flag(root, NodeFlags::FROZEN);
        return;
    }
    let mut visited: Vec<NodeId> = Vec::new();
    let mut work = vec![root];
    while let Some(node) = work.pop() {
        if visited.contains(&node) {
            continue;
        }
        visited.push(node);
        machine.heap.set_flag(node, NodeFlags::FROZEN);
        machine.heap.set_flag(node, NodeFlags::FROZEN_DEEP);
        if matches!(machine.heap.node(node).data, crate::heap::NodeData::Array(_)) {
            for cell in machine.heap.array(node).cells().to_vec() {
                match cell.value {
                    Value::Block(s) | Value::Group(s) | Value::Path(s) | Value::SetPath(s) | Value::GetPath(s) => {
                        work.push(s.node);
                    }
                    Value::Text(id) | Value::Binary(id) => work.push(id),
                    _ => {}
                }
            }
        }
    }
}

/// Shared branch execution: blocks evaluate, actions run with no
/// arguments.
fn run_branch<T: MemTracker>(machine: &mut Machine<T>, branch: Cell) -> RunResult<Flow> {
    match branch.value {
        Value::Block(s) if branch.quote == 0 => eval_to_flow(machine.do_series(s)?),
        Value::Action(act) if branch.quote == 0 => machine.apply_action(act, &[], None),
        _ => Ok(Flow::Out(branch)),
    }
}

fn eval_to_flow(eval: Eval) -> RunResult<Flow> {
    Ok(match eval {
        Eval::Done(v) => Flow::Out(v),
        Eval::Thrown(t) => Flow::Thrown(t),
    })
}

/// Matches a bubbling throw against BREAK/CONTINUE identities.
fn loop_signal<T: MemTracker>(machine: &Machine<T>, thrown: Thrown) -> LoopSignal {
    if thrown.target().is_none() {
        if thrown.label_action() == Some(machine.native_action(Native::Break)) {
            return LoopSignal::Break;
        }
        if thrown.label_action() == Some(machine.native_action(Native::Continue)) {
            return LoopSignal::Continue;
        }
    }
    LoopSignal::Pass(thrown)
}

/// Evaluates a block into a vector of values, keeping them parked on the
/// data stack while evaluation runs.
fn reduce_into<T: MemTracker>(machine: &mut Machine<T>, s: SeriesRef) -> RunResult<Result<Vec<Cell>, Thrown>> {
    let mark = machine.ds.mark();
    let mut feed = Feed {
        node: s.node,
        index: s.index as usize,
        specifier: s.specifier,
    };
    loop {
        match machine.eval_next_value(&mut feed, true) {
            Err(raised) => return Err(raised),
            Ok(Fetched::End) => break,
            Ok(Fetched::Thrown(t)) => {
                machine.ds.drop_to(mark);
                return Ok(Err(t));
            }
            Ok(Fetched::Value(v)) => machine.ds.push(v),
        }
    }
    Ok(Ok(machine.ds.take_above(mark)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MathOp {
    Add,
    Subtract,
    Multiply,
    Divide,
}

fn math_native<T: MemTracker>(machine: &mut Machine<T>, varlist: NodeId, op: MathOp) -> RunResult<Flow> {
    let left = *machine.heap.context(varlist).get(1);
    let right = *machine.heap.context(varlist).get(2);
    match (left.value, right.value) {
        (Value::Integer(a), Value::Integer(b)) => {
            let out = match op {
                MathOp::Add => a.checked_add(b),
                MathOp::Subtract => a.checked_sub(b),
                MathOp::Multiply => a.checked_mul(b),
                MathOp::Divide => {
                    if b == 0 {
                        return Err(machine.raise(ErrorId::ZeroDivide, &[]));
                    }
                    if a % b == 0 {
                        a.checked_div(b)
                    } else {
                        return Ok(Flow::Out(Cell::of(Value::Decimal(a as f64 / b as f64))));
                    }
                }
            };
            match out {
                Some(n) => Ok(Flow::Out(Cell::integer(n))),
                None => Err(machine.raise(ErrorId::Overflow, &[])),
            }
        }
        _ => {
            let (a, b) = (as_decimal(&left), as_decimal(&right));
            let out = match op {
                MathOp::Add => a + b,
                MathOp::Subtract => a - b,
                MathOp::Multiply => a * b,
                MathOp::Divide => {
                    if b == 0.0 {
                        return Err(machine.raise(ErrorId::ZeroDivide, &[]));
                    }
                    a / b
                }
            };
            if out.is_infinite() {
                return Err(machine.raise(ErrorId::Overflow, &[]));
            }
            Ok(Flow::Out(Cell::of(Value::Decimal(out))))
        }
    }
}

fn as_decimal(cell: &Cell) -> f64 {
    match cell.value {
        Value::Integer(n) => n as f64,
        Value::Decimal(d) => d,
        _ => unreachable!("typeset checked"),
    }
}

fn compare_native<T: MemTracker>(
    machine: &mut Machine<T>,
    varlist: NodeId,
    wanted: std::cmp::Ordering,
) -> RunResult<Flow> {
    let left = *machine.heap.context(varlist).get(1);
    let right = *machine.heap.context(varlist).get(2);
    let ordering = match (left.value, right.value) {
        (Value::Integer(a), Value::Integer(b)) => a.partial_cmp(&b),
        (Value::Char(a), Value::Char(b)) => a.partial_cmp(&b),
        (Value::Integer(_) | Value::Decimal(_), Value::Integer(_) | Value::Decimal(_)) => {
            as_decimal(&left).partial_cmp(&as_decimal(&right))
        }
        (Value::Text(a), Value::Text(b)) => {
            Some(machine.heap.text(a).as_str().cmp(machine.heap.text(b).as_str()))
        }
        _ => None,
    };
    match ordering {
        Some(ord) => Ok(Flow::Out(Cell::logic(ord == wanted))),
        None => {
            let bad = left;
            Err(machine.raise(ErrorId::InvalidArg, &[bad]))
        }
    }
}

fn copy_native<T: MemTracker>(machine: &mut Machine<T>, varlist: NodeId) -> RunResult<Flow> {
    let value = *machine.heap.context(varlist).get(1);
    let deep = machine.heap.context(varlist).get(2).is_truthy();
    let out = copy_value(machine, value, deep, 0)?;
    Ok(Flow::Out(out))
}

fn copy_value<T: MemTracker>(machine: &mut Machine<T>, value: Cell, deep: bool, depth: u32) -> RunResult<Cell> {
    assert!(depth < 64, "copy/deep recursion too deep (cyclic value?)");
    match value.value {
        Value::Block(s) | Value::Group(s) | Value::Path(s) | Value::SetPath(s) | Value::GetPath(s) => {
            let mut cells: Vec<Cell> = machine.heap.array(s.node).cells_at(s.index).to_vec();
            if deep {
                for cell in &mut cells {
                    *cell = copy_value(machine, *cell, true, depth + 1)?;
                }
            }
            let node = machine.heap.alloc(NodeData::Array(Array::from_cells(cells)))?;
            machine.heap.manage(node);
            let series = SeriesRef {
                node,
                index: 0,
                specifier: s.specifier,
            };
            let mut out = value;
            out.value = match value.value {
                Value::Block(_) => Value::Block(series),
                Value::Group(_) => Value::Group(series),
                Value::Path(_) => Value::Path(series),
                Value::SetPath(_) => Value::SetPath(series),
                _ => Value::GetPath(series),
            };
            Ok(out)
        }
        Value::Text(id) => {
            let text = machine.heap.text(id).as_str().to_string();
            let node = machine.heap.alloc(NodeData::Text(Text::from_string(text)))?;
            machine.heap.manage(node);
            Ok(Cell::of(Value::Text(node)))
        }
        Value::Binary(id) => {
            let bytes = machine.heap.binary(id).as_bytes().to_vec();
            let node = machine
                .heap
                .alloc(NodeData::Binary(crate::types::Binary::from_bytes(bytes)))?;
            machine.heap.manage(node);
            Ok(Cell::of(Value::Binary(node)))
        }
        Value::Action(action) => {
            let clone = machine.clone_action(action)?;
            Ok(Cell::of(Value::Action(clone)))
        }
        _ => Ok(value.copied()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InsertAt {
    Tail,
    Position,
}

/// APPEND/INSERT shared mutation. Values go in as single elements (no
/// splicing), which is what lets a series contain itself.
fn series_insert<T: MemTracker>(machine: &mut Machine<T>, series: Cell, value: Cell, at: InsertAt) -> RunResult<()> {
    match series.value {
        Value::Block(s) => {
            if machine.heap.has_flag(s.node, crate::heap::NodeFlags::FROZEN) {
                return Err(machine.raise(ErrorId::Protected, &[series]));
            }
            let double = machine.heap.note_expansion(s.node);
            let array = machine.heap.array_mut(s.node);
            let index = match at {
                InsertAt::Tail => array.len(),
                InsertAt::Position => (s.index as usize).min(array.len()),
            };
            array.insert_at(index, &[value.copied()], double);
            Ok(())
        }
        Value::Text(id) => {
            if machine.heap.has_flag(id, crate::heap::NodeFlags::FROZEN) {
                return Err(machine.raise(ErrorId::Protected, &[series]));
            }
            let formed = machine.mold_to_string(&value, true, None);
            let double = machine.heap.note_expansion(id);
            let text = machine.heap.text_mut(id);
            match at {
                InsertAt::Tail => text.push_str(&formed),
                InsertAt::Position => text.insert_str(0, &formed, double),
            }
            Ok(())
        }
        Value::Binary(id) => {
            if machine.heap.has_flag(id, crate::heap::NodeFlags::FROZEN) {
                return Err(machine.raise(ErrorId::Protected, &[series]));
            }
            let bytes: Vec<u8> = match value.value {
                Value::Integer(n) if (0..=255).contains(&n) => vec![n as u8],
                Value::Binary(other) => machine.heap.binary(other).as_bytes().to_vec(),
                _ => return Err(machine.raise(ErrorId::InvalidArg, &[value])),
            };
            let double = machine.heap.note_expansion(id);
            let binary = machine.heap.binary_mut(id);
            let index = match at {
                InsertAt::Tail => binary.len(),
                InsertAt::Position => 0,
            };
            binary.insert_at(index, &bytes, double);
            Ok(())
        }
        _ => unreachable!("typeset checked"),
    }
}

fn pick_at<T: MemTracker>(machine: &mut Machine<T>, series: Cell, at: usize) -> RunResult<Flow> {
    let out = match series.value {
        Value::Block(s) => machine
            .heap
            .array(s.node)
            .get(s.index as usize + at)
            .map_or(Cell::NULLED, Cell::copied),
        Value::Text(id) => machine
            .heap
            .text(id)
            .char_at(at)
            .map_or(Cell::NULLED, |c| Cell::of(Value::Char(c))),
        Value::Binary(id) => machine
            .heap
            .binary(id)
            .as_bytes()
            .get(at)
            .map_or(Cell::NULLED, |&b| Cell::integer(i64::from(b))),
        _ => unreachable!("typeset checked"),
    };
    Ok(Flow::Out(out))
}
