//! Structured errors: catalog, templates, and error-context construction.
//!
//! An error is an ordinary context with a fixed leading field layout
//! (id, type, message, near, where, file, line, then three argument
//! slots). Templates live in a boot-built catalog keyed by [`ErrorId`];
//! construction fills the message template from the argument cells.
//! Construction itself never fails a second time: it allocates through
//! the normal arena path, and the conditions that cannot afford to
//! allocate (stack overflow, out of memory, halt) use contexts pre-built
//! at boot.

use indexmap::IndexMap;

use crate::{
    cell::{Cell, ContextKind, Param, ParamClass, TypeSet, Value, Word, OPT_ANY_VALUE},
    heap::{Heap, NodeData, NodeId},
    intern::{Sym, Symbols},
    mold::{mold_cell, MoldBuffer},
    resource::MemTracker,
    types::{Array, Text},
    unwind::RunResult,
};

/// Error categories, mirroring the boot catalog's sections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub(crate) enum ErrorCat {
    Internal,
    Syntax,
    Script,
    Math,
    Access,
    User,
}

/// Every error id the runtime can raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumIter)]
#[strum(serialize_all = "kebab-case")]
pub(crate) enum ErrorId {
    // internal
    StackOverflow,
    OutOfMemory,
    Halted,
    // script
    NoValue,
    NotBound,
    NeedNonEnd,
    ExpectArg,
    NoArg,
    BadRefine,
    InvalidArg,
    InvalidType,
    NoCatch,
    NoLeftArg,
    BadPath,
    PastEnd,
    Protected,
    ExpiredFrame,
    NotAnAction,
    // math
    ZeroDivide,
    Overflow,
    // user
    User,
}

/// A message template: literal runs interleaved with argument slots.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Part {
    Txt(&'static str),
    /// Index into the error's arg1..arg3 slots.
    Arg(u8),
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Template {
    pub cat: ErrorCat,
    pub parts: &'static [Part],
}

/// The boot-built error catalog, searched by id at raise time.
pub(crate) type Catalog = IndexMap<ErrorId, Template>;

pub(crate) fn build_catalog() -> Catalog {
    use ErrorCat as C;
    use Part::{Arg, Txt};
    let entries: &[(ErrorId, ErrorCat, &'static [Part])] = &[
        (ErrorId::StackOverflow, C::Internal, &[Txt("stack overflow")]),
        (ErrorId::OutOfMemory, C::Internal, &[Txt("not enough memory")]),
        (ErrorId::Halted, C::Internal, &[Txt("halted by request")]),
        (ErrorId::NoValue, C::Script, &[Arg(0), Txt(" has no value")]),
        (ErrorId::NotBound, C::Script, &[Arg(0), Txt(" word is not bound to a context")]),
        (
            ErrorId::NeedNonEnd,
            C::Script,
            &[Txt("end of input where value was needed after "), Arg(0)],
        ),
        (
            ErrorId::ExpectArg,
            C::Script,
            &[Arg(0), Txt(" does not allow "), Arg(1), Txt(" for its "), Arg(2), Txt(" argument")],
        ),
        (ErrorId::NoArg, C::Script, &[Arg(0), Txt(" is missing its "), Arg(1), Txt(" argument")]),
        (ErrorId::BadRefine, C::Script, &[Txt("incompatible or duplicate refinement: "), Arg(0)]),
        (ErrorId::InvalidArg, C::Script, &[Txt("invalid argument: "), Arg(0)]),
        (ErrorId::InvalidType, C::Script, &[Arg(0), Txt(" type is not allowed here")]),
        (ErrorId::NoCatch, C::Script, &[Txt("no catch for throw: "), Arg(0)]),
        (ErrorId::NoLeftArg, C::Script, &[Arg(0), Txt(" has no left operand")]),
        (ErrorId::BadPath, C::Script, &[Txt("cannot follow path: "), Arg(0)]),
        (ErrorId::PastEnd, C::Script, &[Txt("index is past the end of the series")]),
        (ErrorId::Protected, C::Script, &[Txt("protected value or series: "), Arg(0)]),
        (ErrorId::ExpiredFrame, C::Script, &[Txt("frame of a finished call is no longer accessible")]),
        (ErrorId::NotAnAction, C::Script, &[Arg(0), Txt(" does not evaluate to an action")]),
        (ErrorId::ZeroDivide, C::Math, &[Txt("attempt to divide by zero")]),
        (ErrorId::Overflow, C::Math, &[Txt("math or number overflow")]),
        (ErrorId::User, C::User, &[Arg(0)]),
    ];
    entries.iter().map(|&(id, cat, parts)| (id, Template { cat, parts })).collect()
}

/// Leading fields of every error context, in slot order after the
/// archetype.
const ERROR_FIELDS: [Sym; 10] = [
    Sym::Id,
    Sym::Type,
    Sym::Message,
    Sym::Near,
    Sym::Where,
    Sym::File,
    Sym::Line,
    Sym::Arg1,
    Sym::Arg2,
    Sym::Arg3,
];

/// Slot indices within an error context.
pub(crate) const SLOT_ID: usize = 1;
pub(crate) const SLOT_TYPE: usize = 2;
pub(crate) const SLOT_MESSAGE: usize = 3;
pub(crate) const SLOT_NEAR: usize = 4;
pub(crate) const SLOT_WHERE: usize = 5;
pub(crate) const SLOT_FILE: usize = 6;
pub(crate) const SLOT_LINE: usize = 7;
const SLOT_ARG1: usize = 8;

/// Builds the keylist every error context shares.
pub(crate) fn build_error_keylist(heap: &mut Heap<impl MemTracker>) -> RunResult<NodeId> {
    let mut keys = Vec::with_capacity(ERROR_FIELDS.len() + 1);
    keys.push(Cell::of(Value::Param(Param {
        sym: Sym::Root.into(),
        class: ParamClass::Local,
        types: TypeSet::NONE,
    })));
    keys.extend(ERROR_FIELDS.iter().map(|&sym| {
        Cell::of(Value::Param(Param {
            sym: sym.into(),
            class: ParamClass::Normal,
            types: OPT_ANY_VALUE,
        }))
    }));
    let keylist = heap.alloc(NodeData::Array(Array::from_cells(keys)))?;
    heap.manage(keylist);
    heap.set_flag(keylist, crate::heap::NodeFlags::KEYLIST_SHARED);
    Ok(keylist)
}

/// Constructs an error context from the catalog.
///
/// NEAR/WHERE/FILE/LINE start nulled; the raise site fills them from the
/// live frame chain. The returned node is unmanaged: the caller guards
/// or manages it.
pub(crate) fn build_error(
    heap: &mut Heap<impl MemTracker>,
    syms: &mut Symbols,
    scratch: &mut MoldBuffer,
    catalog: &Catalog,
    keylist: NodeId,
    id: ErrorId,
    args: &[Cell],
) -> RunResult<NodeId> {
    let template = catalog
        .get(&id)
        .unwrap_or_else(|| panic!("error id missing from catalog: {id}"));
    assert!(args.len() <= 3, "error templates take at most three args");

    let varlist = heap.alloc_context(ContextKind::Error, keylist, ERROR_FIELDS.len() + 1)?;

    let id_sym = syms.intern(&id.to_string());
    let cat_sym = syms.intern(&template.cat.to_string());

    // message: fill the template, forming argument cells in place
    let push = scratch.begin();
    for part in template.parts {
        match *part {
            Part::Txt(text) => scratch.push_str(text),
            Part::Arg(n) => match args.get(n as usize) {
                Some(cell) => mold_cell(heap, syms, scratch, cell, true),
                None => scratch.push_str("~missing~"),
            },
        }
    }
    let message = scratch.extract(push);
    let message_node = heap.alloc(NodeData::Text(Text::from_string(message)))?;
    heap.manage(message_node);

    let ctx = heap.context_mut(varlist);
    *ctx.get_mut(SLOT_ID) = Cell::of(Value::Word(Word::unbound(id_sym)));
    *ctx.get_mut(SLOT_TYPE) = Cell::of(Value::Word(Word::unbound(cat_sym)));
    *ctx.get_mut(SLOT_MESSAGE) = Cell::of(Value::Text(message_node));
    for slot in [SLOT_NEAR, SLOT_WHERE, SLOT_FILE, SLOT_LINE] {
        *ctx.get_mut(slot) = Cell::NULLED;
    }
    for n in 0..3 {
        *ctx.get_mut(SLOT_ARG1 + n) = args.get(n).map_or(Cell::NULLED, Cell::copied);
    }
    Ok(varlist)
}

/// Reads the id word of an error context back as an [`ErrorId`] spelling.
pub(crate) fn error_id_spelling<'s>(
    heap: &Heap<impl MemTracker>,
    syms: &'s Symbols,
    error: NodeId,
) -> &'s str {
    match heap.context(error).get(SLOT_ID).value {
        Value::Word(w) => syms.spelling(w.sym),
        _ => "~unset-id~",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::NoLimitTracker;

    #[test]
    fn catalog_covers_every_id() {
        use strum::IntoEnumIterator;
        let catalog = build_catalog();
        for id in ErrorId::iter() {
            assert!(catalog.contains_key(&id), "missing template for {id}");
        }
    }

    #[test]
    fn build_error_fills_message_from_args() {
        let mut heap = Heap::new(NoLimitTracker, 1024, false);
        let mut syms = Symbols::new();
        let mut scratch = MoldBuffer::new();
        let catalog = build_catalog();
        let keylist = build_error_keylist(&mut heap).unwrap();

        let arg = Cell::of(Value::Word(Word::unbound(Sym::Append.into())));
        let err = build_error(&mut heap, &mut syms, &mut scratch, &catalog, keylist, ErrorId::NoValue, &[arg]).unwrap();

        assert_eq!(error_id_spelling(&heap, &syms, err), "no-value");
        let Value::Text(msg) = heap.context(err).get(SLOT_MESSAGE).value else {
            panic!("message is not text");
        };
        assert_eq!(heap.text(msg).as_str(), "append has no value");
        let Value::Word(ty) = heap.context(err).get(SLOT_TYPE).value else {
            panic!("type is not a word");
        };
        assert_eq!(syms.spelling(ty.sym), "script");
        assert_eq!(scratch.byte_len(), 0, "scratch buffer left balanced");
    }

    #[test]
    fn error_keylist_matches_varlist_length() {
        let mut heap = Heap::new(NoLimitTracker, 1024, false);
        let mut syms = Symbols::new();
        let mut scratch = MoldBuffer::new();
        let catalog = build_catalog();
        let keylist = build_error_keylist(&mut heap).unwrap();
        let err = build_error(&mut heap, &mut syms, &mut scratch, &catalog, keylist, ErrorId::ZeroDivide, &[]).unwrap();
        assert_eq!(heap.context(err).len(), heap.keys_of(keylist).len());
    }
}
