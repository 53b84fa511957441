//! The host conversion surface.
//!
//! Embedders do not touch cells: they hand the machine [`Datum`] trees
//! (the public mirror of the cell model) and get datums or [`Fault`]s
//! back. Words convert with a binding into lib when the spelling is
//! defined there, so programmatically built code behaves like loaded
//! source. [`ValueHandle`] is the keep-alive mechanism for hosts that
//! want a machine value to survive across calls: the handle guards a
//! pairing node until explicitly released.

use std::fmt;

use crate::{
    cell::{peel_quotes, quote_cell, Cell, ContextKind, SeriesRef, Value, Word},
    error::{self, ErrorId},
    eval::Eval,
    heap::{NodeData, NodeId},
    machine::Machine,
    resource::MemTracker,
    types::{Array, Binary, Text},
    unwind::RunResult,
};

/// Host-side value: what goes into and comes out of a machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Datum {
    Null,
    Blank,
    Logic(bool),
    Integer(i64),
    Decimal(f64),
    Char(char),
    Text(String),
    Binary(Vec<u8>),
    Word(String),
    SetWord(String),
    GetWord(String),
    LitWord(String),
    Block(Vec<Datum>),
    Group(Vec<Datum>),
    Path(Vec<Datum>),
    SetPath(Vec<Datum>),
    GetPath(Vec<Datum>),
    Quoted(u32, Box<Datum>),
    /// An action came back; actions have no host representation beyond
    /// their existence.
    Action,
    /// An error value (from RESCUE or an uncaught fail).
    Error(Box<Fault>),
    /// A datatype, by its `name!` spelling.
    Datatype(String),
    /// Anything without a natural host mapping, molded.
    Opaque(String),
}

/// A raised error, flattened for the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    /// Error id spelling, e.g. `zero-divide`.
    pub id: String,
    /// Category spelling, e.g. `math`.
    pub category: String,
    /// Message with argument slots filled.
    pub message: String,
    /// Labels of open calls, innermost first.
    pub where_: Vec<String>,
    /// Molded source excerpt around the raise site.
    pub near: String,
    pub file: Option<String>,
    pub line: Option<u32>,
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "** {} error: {}", self.category, self.message)?;
        if !self.where_.is_empty() {
            writeln!(f, "** where: {}", self.where_.join(" "))?;
        }
        if !self.near.is_empty() {
            writeln!(f, "** near: {}", self.near)?;
        }
        Ok(())
    }
}

impl std::error::Error for Fault {}

/// A guarded machine value held on behalf of the host.
///
/// The underlying node stays collector-protected until
/// [`Machine::release_handle`] drops the guard.
#[derive(Debug)]
pub struct ValueHandle {
    pub(crate) node: NodeId,
}

impl<T: MemTracker> Machine<T> {
    // --- evaluation -------------------------------------------------------

    /// Builds a block from datums, evaluates it, and converts the result
    /// back. An uncaught throw reports as a no-catch fault, per the
    /// bottom-of-stack rule.
    pub fn eval(&mut self, code: &[Datum]) -> Result<Datum, Fault> {
        self.eval_inner(code, None)
    }

    /// Like [`Self::eval`], tagging the code with source provenance so
    /// raised errors carry FILE and LINE.
    pub fn eval_script(&mut self, code: &[Datum], file: &str, line: u32) -> Result<Datum, Fault> {
        let file = self.syms.intern(file);
        self.eval_inner(code, Some((file, line)))
    }

    fn eval_inner(
        &mut self,
        code: &[Datum],
        provenance: Option<(crate::intern::SymbolId, u32)>,
    ) -> Result<Datum, Fault> {
        let block = match self.rescue_raised(|m| m.datums_to_array(code)) {
            Ok(node) => node,
            Err(error) => return Err(self.fault_from_error(error)),
        };
        if let Some((file, line)) = provenance {
            let array = self.heap.array_mut(block);
            array.file = Some(file);
            array.line = Some(line);
        }
        self.heap.guard(block);
        let outcome = self.rescue_raised(|m| {
            let series = SeriesRef::head(block);
            match m.do_series(series)? {
                Eval::Done(v) => Ok(v),
                Eval::Thrown(t) => Err(m.raise(ErrorId::NoCatch, &[t.label])),
            }
        });
        self.heap.unguard(block);
        match outcome {
            Ok(cell) => Ok(self.cell_to_datum(&cell, 0)),
            Err(error) => Err(self.fault_from_error(error)),
        }
    }

    /// MOLD from the host side.
    pub fn mold(&mut self, value: &Datum) -> Result<String, Fault> {
        let cell = match self.rescue_raised(|m| m.datum_to_cell(value)) {
            Ok(cell) => cell,
            Err(error) => return Err(self.fault_from_error(error)),
        };
        Ok(self.mold_to_string(&cell, false, None))
    }

    // --- handles ----------------------------------------------------------

    /// Wraps a datum as a guarded, machine-held value.
    pub fn make_handle(&mut self, value: &Datum) -> Result<ValueHandle, Fault> {
        let node = match self.rescue_raised(|m| {
            let cell = m.datum_to_cell(value)?;
            let pairing = m.heap.alloc_pairing([cell, Cell::NULLED])?;
            m.heap.manage(pairing);
            m.heap.guard(pairing);
            Ok(pairing)
        }) {
            Ok(node) => node,
            Err(error) => return Err(self.fault_from_error(error)),
        };
        Ok(ValueHandle { node })
    }

    /// Reads a handle's value back out.
    #[must_use]
    pub fn read_handle(&self, handle: &ValueHandle) -> Datum {
        let cell = self.heap.pairing(handle.node)[0];
        self.cell_to_datum(&cell, 0)
    }

    /// Releases a handle; the value becomes collectable.
    pub fn release_handle(&mut self, handle: ValueHandle) {
        self.heap.unguard(handle.node);
    }

    // --- conversions ------------------------------------------------------

    pub(crate) fn datums_to_array(&mut self, code: &[Datum]) -> RunResult<NodeId> {
        let mut cells = Vec::with_capacity(code.len());
        for datum in code {
            cells.push(self.datum_to_cell(datum)?);
        }
        let node = self.heap.alloc(NodeData::Array(Array::from_cells(cells)))?;
        self.heap.manage(node);
        Ok(node)
    }

    pub(crate) fn datum_to_cell(&mut self, datum: &Datum) -> RunResult<Cell> {
        Ok(match datum {
            Datum::Null => Cell::NULLED,
            Datum::Blank => Cell::BLANK,
            Datum::Logic(b) => Cell::logic(*b),
            Datum::Integer(n) => Cell::integer(*n),
            Datum::Decimal(d) => Cell::of(Value::Decimal(*d)),
            Datum::Char(c) => Cell::of(Value::Char(*c)),
            Datum::Text(s) => {
                let node = self.heap.alloc(NodeData::Text(Text::from_string(s.clone())))?;
                self.heap.manage(node);
                Cell::of(Value::Text(node))
            }
            Datum::Binary(b) => {
                let node = self.heap.alloc(NodeData::Binary(Binary::from_bytes(b.clone())))?;
                self.heap.manage(node);
                Cell::of(Value::Binary(node))
            }
            Datum::Word(s) => Cell::of(Value::Word(self.host_word(s))),
            Datum::SetWord(s) => Cell::of(Value::SetWord(self.host_word(s))),
            Datum::GetWord(s) => Cell::of(Value::GetWord(self.host_word(s))),
            Datum::LitWord(s) => Cell::of(Value::LitWord(self.host_word(s))),
            Datum::Block(items) => self.host_array(items, Value::Block)?,
            Datum::Group(items) => self.host_array(items, Value::Group)?,
            Datum::Path(items) => self.host_array(items, Value::Path)?,
            Datum::SetPath(items) => self.host_array(items, Value::SetPath)?,
            Datum::GetPath(items) => self.host_array(items, Value::GetPath)?,
            Datum::Quoted(depth, inner) => {
                let cell = self.datum_to_cell(inner)?;
                quote_cell(&mut self.heap, cell, *depth)?
            }
            Datum::Action | Datum::Error(_) | Datum::Datatype(_) | Datum::Opaque(_) => {
                let text = format!("{datum:?}");
                let node = self.heap.alloc(NodeData::Text(Text::from_string(text)))?;
                self.heap.manage(node);
                let bad = Cell::of(Value::Text(node));
                return Err(self.raise(ErrorId::InvalidArg, &[bad]));
            }
        })
    }

    /// Interns a spelling and binds it into lib when defined there, so
    /// host-built words reach the natives.
    fn host_word(&mut self, spelling: &str) -> Word {
        let sym = self.syms.intern(spelling);
        match crate::bind::find_in_context(&self.heap, self.lib, sym) {
            Some(index) => Word {
                sym,
                binding: crate::bind::Binding::Slot {
                    varlist: self.lib,
                    index: u32::try_from(index).expect("lib context too large"),
                },
            },
            None => Word::unbound(sym),
        }
    }

    fn host_array(&mut self, items: &[Datum], ctor: fn(SeriesRef) -> Value) -> RunResult<Cell> {
        let node = self.datums_to_array(items)?;
        Ok(Cell::of(ctor(SeriesRef::head(node))))
    }

    pub(crate) fn cell_to_datum(&self, cell: &Cell, depth: u32) -> Datum {
        if depth > 64 {
            return Datum::Opaque("...".to_string());
        }
        let (inner, quotes) = peel_quotes(&self.heap, cell);
        let base = match inner.value {
            Value::Nulled => Datum::Null,
            Value::Trash => Datum::Opaque("~trash~".to_string()),
            Value::Blank => Datum::Blank,
            Value::Logic(b) => Datum::Logic(b),
            Value::Integer(n) => Datum::Integer(n),
            Value::Decimal(d) => Datum::Decimal(d),
            Value::Char(c) => Datum::Char(c),
            Value::Text(id) => Datum::Text(self.heap.text(id).as_str().to_string()),
            Value::Binary(id) => Datum::Binary(self.heap.binary(id).as_bytes().to_vec()),
            Value::Word(w) => Datum::Word(self.syms.spelling(w.sym).to_string()),
            Value::SetWord(w) => Datum::SetWord(self.syms.spelling(w.sym).to_string()),
            Value::GetWord(w) => Datum::GetWord(self.syms.spelling(w.sym).to_string()),
            Value::LitWord(w) => Datum::LitWord(self.syms.spelling(w.sym).to_string()),
            Value::Block(s) => Datum::Block(self.series_to_datums(s, depth)),
            Value::Group(s) => Datum::Group(self.series_to_datums(s, depth)),
            Value::Path(s) => Datum::Path(self.series_to_datums(s, depth)),
            Value::SetPath(s) => Datum::SetPath(self.series_to_datums(s, depth)),
            Value::GetPath(s) => Datum::GetPath(self.series_to_datums(s, depth)),
            Value::Action(_) => Datum::Action,
            Value::Context(ContextKind::Error, id) => Datum::Error(Box::new(self.fault_from_error(id))),
            Value::Datatype(kind) => Datum::Datatype(kind.name()),
            _ => Datum::Opaque(format!("#[{}]", inner.value.kind())),
        };
        if quotes > 0 {
            Datum::Quoted(quotes, Box::new(base))
        } else {
            base
        }
    }

    fn series_to_datums(&self, s: SeriesRef, depth: u32) -> Vec<Datum> {
        self.heap
            .array(s.node)
            .cells_at(s.index)
            .iter()
            .map(|c| self.cell_to_datum(c, depth + 1))
            .collect()
    }

    /// Flattens an error context for the host.
    pub(crate) fn fault_from_error(&self, node: NodeId) -> Fault {
        let id = error::error_id_spelling(&self.heap, &self.syms, node).to_string();
        let ctx = self.heap.context(node);
        let category = match ctx.get(error::SLOT_TYPE).value {
            Value::Word(w) => self.syms.spelling(w.sym).to_string(),
            _ => String::new(),
        };
        let message = match ctx.get(error::SLOT_MESSAGE).value {
            Value::Text(id) => self.heap.text(id).as_str().to_string(),
            _ => String::new(),
        };
        let where_ = match ctx.get(error::SLOT_WHERE).value {
            Value::Block(s) => self
                .heap
                .array(s.node)
                .cells_at(s.index)
                .iter()
                .filter_map(|c| match c.value {
                    Value::Word(w) => Some(self.syms.spelling(w.sym).to_string()),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        };
        let near = if matches!(ctx.get(error::SLOT_NEAR).value, Value::Block(_)) {
            let mut buf = crate::mold::MoldBuffer::new();
            let push = buf.begin();
            crate::mold::mold_cell(&self.heap, &self.syms, &mut buf, ctx.get(error::SLOT_NEAR), false);
            buf.extract(push)
        } else {
            String::new()
        };
        let file = match ctx.get(error::SLOT_FILE).value {
            Value::Word(w) => Some(self.syms.spelling(w.sym).to_string()),
            _ => None,
        };
        let line = match ctx.get(error::SLOT_LINE).value {
            Value::Integer(n) => u32::try_from(n).ok(),
            _ => None,
        };
        Fault {
            id,
            category,
            message,
            where_,
            near,
            file,
            line,
        }
    }
}
