//! Symbol interning: canonical, case-folded spellings with stable ids.
//!
//! Every word spelling used by the runtime is interned exactly once per
//! machine. The canon is the case-folded form: `Append`, `APPEND` and
//! `append` all resolve to the same `SymbolId`, while the spelling first
//! seen is preserved for molding. Well-known symbols (native names, error
//! field names, operators) are pre-interned from the [`Sym`] enum so that
//! boot code and natives can refer to them without hashing; the id of a
//! `Sym` variant is its discriminant.

use ahash::AHashMap;
use strum::{EnumCount, IntoEnumIterator};

/// Index into the symbol table.
///
/// Uses `u32` to keep word payloads small. Ids below [`Sym::COUNT`] are the
/// pre-interned well-known symbols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SymbolId(u32);

impl SymbolId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl From<Sym> for SymbolId {
    #[inline]
    fn from(sym: Sym) -> Self {
        Self(sym as u32)
    }
}

/// Well-known symbols, pre-interned at machine boot in declaration order.
///
/// The string form is the language-level spelling (kebab-case words,
/// operator glyphs, `?`-suffixed predicates).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumCount, strum::EnumIter, strum::IntoStaticStr,
)]
#[strum(serialize_all = "kebab-case")]
#[repr(u32)]
pub(crate) enum Sym {
    /// Reserved slot-0 key of every keylist.
    #[strum(serialize = "~root~")]
    Root,

    // Error object fields, in fixed leading layout order.
    Id,
    Type,
    Message,
    Near,
    Where,
    File,
    Line,
    Arg1,
    Arg2,
    Arg3,

    // Evaluator / composition natives.
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
    #[strum(serialize = "type-of")]
    TypeOf,
    #[strum(serialize = "equal?")]
    EqualQ,
    #[strum(serialize = "lesser?")]
    LesserQ,
    #[strum(serialize = "greater?")]
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
    Take,
    Freeze,
    #[strum(serialize = "length-of")]
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

    // Operator spellings, defined enfix in lib.
    #[strum(serialize = "+")]
    OpAdd,
    #[strum(serialize = "-")]
    OpSubtract,
    #[strum(serialize = "*")]
    OpMultiply,
    #[strum(serialize = "/")]
    OpDivide,
    #[strum(serialize = "=")]
    OpEqual,
    #[strum(serialize = "<")]
    OpLesser,
    #[strum(serialize = ">")]
    OpGreater,

    // Parameter names used by the native spec table.
    Value,
    Condition,
    Branch,
    #[strum(serialize = "true-branch")]
    TrueBranch,
    #[strum(serialize = "false-branch")]
    FalseBranch,
    Left,
    Right,
    Series,
    Block,
    Body,
    Spec,
    Count,
    Word,
    Action,
    Target,
    Name,
    Index,
    Reason,
    Prelude,
    Pipeline,
    Inner,
    Outer,
    Fills,
    Test,
    Limit,
    Deep,
    Result,
}

impl Sym {
    /// The language-level spelling of this symbol.
    #[inline]
    pub fn spelling(self) -> &'static str {
        self.into()
    }
}

/// Stored data for one interned symbol.
#[derive(Debug)]
struct SymbolData {
    /// Spelling as first interned (case preserved for molding).
    spelling: Box<str>,
}

/// Per-machine symbol table.
///
/// Spellings are stored once; the canon map is keyed by the case-folded
/// form so lookups are case-insensitive. There is no per-symbol binder
/// state: binding scratch lives in scoped [`crate::bind::Binder`] maps.
#[derive(Debug)]
pub(crate) struct Symbols {
    table: Vec<SymbolData>,
    canon: AHashMap<Box<str>, SymbolId>,
}

impl Symbols {
    /// Builds the table with every [`Sym`] pre-interned at its fixed id.
    pub fn new() -> Self {
        let mut syms = Self {
            table: Vec::with_capacity(Sym::COUNT * 2),
            canon: AHashMap::with_capacity(Sym::COUNT * 2),
        };
        for sym in Sym::iter() {
            let id = syms.intern(sym.spelling());
            debug_assert_eq!(id, SymbolId::from(sym), "Sym table out of order: {sym:?}");
        }
        syms
    }

    /// Interns a spelling, returning its canonical id.
    ///
    /// The first spelling seen for a canon wins for mold output; later
    /// case variants map to the same id.
    pub fn intern(&mut self, spelling: &str) -> SymbolId {
        let folded = fold_case(spelling);
        if let Some(&id) = self.canon.get(folded.as_str()) {
            return id;
        }
        let id = SymbolId(u32::try_from(self.table.len()).expect("symbol table overflow"));
        self.table.push(SymbolData {
            spelling: spelling.into(),
        });
        self.canon.insert(folded.into_boxed_str(), id);
        id
    }

    /// Looks up a spelling without interning it.
    pub fn find(&self, spelling: &str) -> Option<SymbolId> {
        self.canon.get(fold_case(spelling).as_str()).copied()
    }

    /// Returns the preserved spelling for an id.
    ///
    /// # Panics
    /// Panics if the id was not produced by this table.
    pub fn spelling(&self, id: SymbolId) -> &str {
        &self.table[id.index()].spelling
    }

    /// Number of interned symbols, pre-interned [`Sym`] set included.
    pub fn len(&self) -> usize {
        self.table.len()
    }
}

/// Case-folds a spelling to its canonical key.
///
/// ASCII-range folding is what word comparison in this family uses;
/// non-ASCII codepoints pass through unchanged.
fn fold_case(spelling: &str) -> String {
    spelling.to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_known_symbols_have_fixed_ids() {
        let syms = Symbols::new();
        assert_eq!(syms.find("~root~"), Some(Sym::Root.into()));
        assert_eq!(syms.find("length-of"), Some(Sym::LengthOf.into()));
        assert_eq!(syms.find("+"), Some(Sym::OpAdd.into()));
        assert_eq!(syms.find("equal?"), Some(Sym::EqualQ.into()));
    }

    #[test]
    fn interning_is_case_insensitive_but_spelling_preserving() {
        let mut syms = Symbols::new();
        let a = syms.intern("Frobnicate");
        let b = syms.intern("FROBNICATE");
        let c = syms.intern("frobnicate");
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert_eq!(syms.spelling(a), "Frobnicate", "first spelling wins");
    }

    #[test]
    fn distinct_spellings_get_distinct_ids() {
        let mut syms = Symbols::new();
        let a = syms.intern("alpha");
        let b = syms.intern("beta");
        assert_ne!(a, b);
        assert_eq!(syms.spelling(b), "beta");
    }

    #[test]
    fn find_does_not_intern() {
        let mut syms = Symbols::new();
        let before = syms.len();
        assert_eq!(syms.find("never-seen"), None);
        assert_eq!(syms.len(), before);
        syms.intern("never-seen");
        assert!(syms.find("NEVER-SEEN").is_some());
    }
}
