//! MOLD and FORM: building source-loadable and display text.
//!
//! All molding goes through one machine-wide UTF-8 buffer with a
//! push/extract/drop discipline: record the head offset, build, then
//! either split the new tail off as a fresh string or drop back. The
//! buffer also owns the mold stack of containers currently being
//! molded, which is what makes cyclic values terminate: a container
//! revisited while still on the stack renders as a bracketed ellipsis.

use crate::{
    cell::{peel_quotes, Cell, ContextKind, Value},
    heap::{Heap, NodeFlags, NodeId},
    intern::Symbols,
    resource::MemTracker,
};

/// Offsets recorded when a mold begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MoldPush {
    bytes: usize,
    chars: usize,
}

/// The shared mold buffer and cycle stack.
#[derive(Debug, Default)]
pub(crate) struct MoldBuffer {
    text: String,
    chars: usize,
    /// Containers currently being molded, for cycle detection.
    stack: Vec<NodeId>,
}

impl MoldBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self) -> MoldPush {
        MoldPush {
            bytes: self.text.len(),
            chars: self.chars,
        }
    }

    /// Splits off everything molded since `push` as an owned string.
    pub fn extract(&mut self, push: MoldPush) -> String {
        let out = self.text.split_off(push.bytes);
        self.chars = push.chars;
        out
    }

    /// Abandons everything molded since `push`.
    pub fn drop_to(&mut self, push: MoldPush) {
        self.text.truncate(push.bytes);
        self.chars = push.chars;
    }

    pub fn push_str(&mut self, s: &str) {
        self.chars += s.chars().count();
        self.text.push_str(s);
    }

    pub fn push_char(&mut self, c: char) {
        self.chars += 1;
        self.text.push(c);
    }

    // Snapshot surface for the fail path.

    pub fn byte_len(&self) -> usize {
        self.text.len()
    }

    pub fn char_len(&self) -> usize {
        self.chars
    }

    pub fn stack_len(&self) -> usize {
        self.stack.len()
    }

    /// Fail cleanup back to a rescue snapshot.
    pub fn truncate(&mut self, bytes: usize, chars: usize, stack: usize) {
        self.text.truncate(bytes);
        self.chars = chars;
        self.stack.truncate(stack);
    }

    /// GC roots: containers on the mold stack must not be collected
    /// mid-mold.
    pub fn node_roots(&self, out: &mut Vec<NodeId>) {
        out.extend_from_slice(&self.stack);
    }
}

/// Molds one cell into the buffer. `form` selects the human display
/// variant (no delimiters on strings, no brackets on blocks).
pub(crate) fn mold_cell(heap: &Heap<impl MemTracker>, syms: &Symbols, buf: &mut MoldBuffer, cell: &Cell, form: bool) {
    let (inner, depth) = peel_quotes(heap, cell);
    if !form {
        for _ in 0..depth {
            buf.push_char('\'');
        }
    }
    match inner.value {
        Value::Nulled => buf.push_str("~null~"),
        Value::Trash => buf.push_str("~trash~"),
        Value::Blank => buf.push_char('_'),
        Value::Logic(b) => buf.push_str(if b { "true" } else { "false" }),
        Value::Integer(n) => buf.push_str(&n.to_string()),
        Value::Decimal(d) => {
            let mut fmt = ryu::Buffer::new();
            buf.push_str(fmt.format(d));
        }
        Value::Char(c) => {
            if form {
                buf.push_char(c);
            } else {
                buf.push_str("#\"");
                buf.push_char(c);
                buf.push_char('"');
            }
        }
        Value::Text(id) => {
            let text = heap.text(id);
            if form {
                buf.push_str(text.as_str());
            } else {
                buf.push_char('"');
                for c in text.as_str().chars() {
                    match c {
                        '"' => buf.push_str("^\""),
                        '^' => buf.push_str("^^"),
                        '\n' => buf.push_str("^/"),
                        _ => buf.push_char(c),
                    }
                }
                buf.push_char('"');
            }
        }
        Value::Binary(id) => {
            buf.push_str("#{");
            for byte in heap.binary(id).as_bytes() {
                buf.push_str(&format!("{byte:02X}"));
            }
            buf.push_char('}');
        }
        Value::Word(w) => buf.push_str(syms.spelling(w.sym)),
        Value::SetWord(w) => {
            buf.push_str(syms.spelling(w.sym));
            buf.push_char(':');
        }
        Value::GetWord(w) => {
            buf.push_char(':');
            buf.push_str(syms.spelling(w.sym));
        }
        Value::LitWord(w) => {
            buf.push_char('\'');
            buf.push_str(syms.spelling(w.sym));
        }
        Value::Block(s) => mold_array(heap, syms, buf, s.node, s.index, form, ("[", "]")),
        Value::Group(s) => mold_array(heap, syms, buf, s.node, s.index, form, ("(", ")")),
        Value::Path(s) => mold_path(heap, syms, buf, s.node, s.index, "", ""),
        Value::SetPath(s) => mold_path(heap, syms, buf, s.node, s.index, "", ":"),
        Value::GetPath(s) => mold_path(heap, syms, buf, s.node, s.index, ":", ""),
        Value::Action(_) => buf.push_str("#[action!]"),
        Value::Context(kind, id) => mold_context(heap, syms, buf, kind, id),
        Value::Datatype(kind) => buf.push_str(&kind.name()),
        Value::Typeset(_) => buf.push_str("#[typeset!]"),
        Value::Param(p) => {
            buf.push_str("#[param ");
            buf.push_str(syms.spelling(p.sym));
            buf.push_char(']');
        }
        Value::Handle(_) => buf.push_str("#[handle!]"),
        Value::Varargs(_) => buf.push_str("#[varargs!]"),
        Value::QuoteLift(_) => unreachable!("peel_quotes removed the lift"),
    }
}

fn mold_array(
    heap: &Heap<impl MemTracker>,
    syms: &Symbols,
    buf: &mut MoldBuffer,
    node: NodeId,
    index: u32,
    form: bool,
    (open, close): (&str, &str),
) {
    if buf.stack.contains(&node) {
        buf.push_str(open);
        buf.push_str("...");
        buf.push_str(close);
        return;
    }
    buf.stack.push(node);
    if !form {
        buf.push_str(open);
    }
    let array = heap.array(node);
    let mut first = true;
    for cell in array.cells_at(index) {
        if !first {
            if cell.flags.contains(crate::cell::CellFlags::NEWLINE_BEFORE) && !form {
                buf.push_char('\n');
            } else {
                buf.push_char(' ');
            }
        }
        first = false;
        mold_cell(heap, syms, buf, cell, form);
    }
    if !form {
        if heap.has_flag(node, NodeFlags::NEWLINE_AT_TAIL) {
            buf.push_char('\n');
        }
        buf.push_str(close);
    }
    buf.stack.pop();
}

fn mold_path(
    heap: &Heap<impl MemTracker>,
    syms: &Symbols,
    buf: &mut MoldBuffer,
    node: NodeId,
    index: u32,
    prefix: &str,
    suffix: &str,
) {
    buf.push_str(prefix);
    if buf.stack.contains(&node) {
        buf.push_str(".../...");
        buf.push_str(suffix);
        return;
    }
    buf.stack.push(node);
    let array = heap.array(node);
    let mut first = true;
    for cell in array.cells_at(index) {
        if !first {
            buf.push_char('/');
        }
        first = false;
        mold_cell(heap, syms, buf, cell, false);
    }
    buf.stack.pop();
    buf.push_str(suffix);
}

fn mold_context(heap: &Heap<impl MemTracker>, syms: &Symbols, buf: &mut MoldBuffer, kind: ContextKind, id: NodeId) {
    let ctor = match kind {
        ContextKind::Object => "make object! [",
        ContextKind::Module => "make module! [",
        ContextKind::Port => "make port! [",
        ContextKind::Error => "make error! [",
        ContextKind::Frame => "make frame! [",
    };
    if buf.stack.contains(&id) {
        buf.push_str(ctor);
        buf.push_str("...]");
        return;
    }
    buf.stack.push(id);
    buf.push_str(ctor);
    let keylist = heap.context(id).keylist;
    let keys = heap.keys_of(keylist).to_vec();
    let mut first = true;
    for (i, key) in keys.iter().enumerate().skip(1) {
        let Value::Param(p) = key.value else { continue };
        let slot = *heap.context(id).get(i);
        if slot.is_nulled() {
            continue;
        }
        if !first {
            buf.push_char(' ');
        }
        first = false;
        buf.push_str(syms.spelling(p.sym));
        buf.push_str(": ");
        mold_cell(heap, syms, buf, &slot, false);
    }
    buf.push_char(']');
    buf.stack.pop();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cell::{SeriesRef, Word},
        heap::NodeData,
        intern::Sym,
        resource::NoLimitTracker,
        types::{Array, Text},
    };

    fn mold_one(heap: &Heap<NoLimitTracker>, syms: &Symbols, cell: &Cell, form: bool) -> String {
        let mut buf = MoldBuffer::new();
        let push = buf.begin();
        mold_cell(heap, syms, &mut buf, cell, form);
        buf.extract(push)
    }

    #[test]
    fn scalars_mold() {
        let heap = Heap::new(NoLimitTracker, 1024, false);
        let syms = Symbols::new();
        assert_eq!(mold_one(&heap, &syms, &Cell::integer(-5), false), "-5");
        assert_eq!(mold_one(&heap, &syms, &Cell::of(Value::Decimal(1.5)), false), "1.5");
        assert_eq!(mold_one(&heap, &syms, &Cell::BLANK, false), "_");
        assert_eq!(mold_one(&heap, &syms, &Cell::logic(true), false), "true");
    }

    #[test]
    fn text_mold_vs_form() {
        let mut heap = Heap::new(NoLimitTracker, 1024, false);
        let syms = Symbols::new();
        let id = heap.alloc(NodeData::Text(Text::from_string("hi \"x\"".into()))).unwrap();
        let cell = Cell::of(Value::Text(id));
        assert_eq!(mold_one(&heap, &syms, &cell, false), "\"hi ^\"x^\"\"");
        assert_eq!(mold_one(&heap, &syms, &cell, true), "hi \"x\"");
    }

    #[test]
    fn words_mold_with_sigils() {
        let heap = Heap::new(NoLimitTracker, 1024, false);
        let syms = Symbols::new();
        let w = Word::unbound(Sym::Append.into());
        assert_eq!(mold_one(&heap, &syms, &Cell::of(Value::Word(w)), false), "append");
        assert_eq!(mold_one(&heap, &syms, &Cell::of(Value::SetWord(w)), false), "append:");
        assert_eq!(mold_one(&heap, &syms, &Cell::of(Value::GetWord(w)), false), ":append");
        assert_eq!(mold_one(&heap, &syms, &Cell::of(Value::LitWord(w)), false), "'append");
    }

    #[test]
    fn quoted_cells_mold_with_apostrophes() {
        let heap = Heap::new(NoLimitTracker, 1024, false);
        let syms = Symbols::new();
        let mut cell = Cell::integer(3);
        cell.quote = 2;
        assert_eq!(mold_one(&heap, &syms, &cell, false), "''3");
    }

    #[test]
    fn cyclic_array_molds_with_ellipsis() {
        let mut heap = Heap::new(NoLimitTracker, 1024, false);
        let syms = Symbols::new();
        let node = heap
            .alloc(NodeData::Array(Array::from_cells(vec![Cell::integer(1)])))
            .unwrap();
        // make the array contain itself
        let self_ref = Cell::of(Value::Block(SeriesRef::head(node)));
        heap.array_mut(node).push(self_ref);
        let cell = Cell::of(Value::Block(SeriesRef::head(node)));
        let out = mold_one(&heap, &syms, &cell, false);
        assert_eq!(out, "[1 [...]]");
    }

    #[test]
    fn extract_and_drop_restore_buffer() {
        let mut buf = MoldBuffer::new();
        buf.push_str("keep");
        let push = buf.begin();
        buf.push_str("temp");
        buf.drop_to(push);
        assert_eq!(buf.byte_len(), 4);
        let push2 = buf.begin();
        buf.push_str("-tail");
        assert_eq!(buf.extract(push2), "-tail");
        assert_eq!(buf.byte_len(), 4);
    }
}
