//! Text (UTF-8 with codepoint index caching) and binary sequences.

use std::cell::Cell as StdCell;

use crate::types::buf::Buf;

/// UTF-8 text with a cached codepoint length and one bookmark.
///
/// The bookmark is a (codepoint index, byte offset) pair remembered from
/// the last random access, so sequential or nearby `char_at`/slicing
/// calls do not rescan from the head every time.
#[derive(Debug, Default)]
pub(crate) struct Text {
    buf: Buf<u8>,
    len_chars: usize,
    bookmark: StdCell<(usize, usize)>,
}

impl Text {
    pub fn from_string(s: String) -> Self {
        let len_chars = s.chars().count();
        Self {
            buf: Buf::from_vec(s.into_bytes()),
            len_chars,
            bookmark: StdCell::new((0, 0)),
        }
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(self.buf.as_slice()).expect("text node holds invalid UTF-8")
    }

    pub fn len_bytes(&self) -> usize {
        self.buf.len()
    }

    pub fn len_chars(&self) -> usize {
        self.len_chars
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Byte offset of a codepoint index, advancing from the bookmark when
    /// it is closer than the head.
    fn byte_at(&self, char_index: usize) -> usize {
        let s = self.as_str();
        let (mark_chars, mark_bytes) = self.bookmark.get();
        let (mut chars, mut bytes) = if mark_chars <= char_index && mark_bytes <= s.len() {
            (mark_chars, mark_bytes)
        } else {
            (0, 0)
        };
        while chars < char_index {
            let Some(c) = s[bytes..].chars().next() else { break };
            bytes += c.len_utf8();
            chars += 1;
        }
        self.bookmark.set((chars, bytes));
        bytes
    }

    pub fn char_at(&self, char_index: usize) -> Option<char> {
        if char_index >= self.len_chars {
            return None;
        }
        let at = self.byte_at(char_index);
        self.as_str()[at..].chars().next()
    }

    /// Tail substring from a codepoint index.
    pub fn str_at(&self, char_index: usize) -> &str {
        let at = self.byte_at(char_index.min(self.len_chars));
        &self.as_str()[at..]
    }

    pub fn push_str(&mut self, s: &str) {
        self.len_chars += s.chars().count();
        self.buf.insert_slice(self.buf.len(), s.as_bytes(), false);
        self.bookmark.set((0, 0));
    }

    pub fn insert_str(&mut self, char_index: usize, s: &str, double: bool) {
        let at = self.byte_at(char_index.min(self.len_chars));
        self.len_chars += s.chars().count();
        self.buf.insert_slice(at, s.as_bytes(), double);
        self.bookmark.set((0, 0));
    }

    pub fn remove_chars(&mut self, char_index: usize, count: usize) {
        let char_index = char_index.min(self.len_chars);
        let removed = count.min(self.len_chars - char_index);
        let start = self.byte_at(char_index);
        let end = self.byte_at(char_index + removed);
        self.buf.remove_range(start, end - start);
        self.len_chars -= removed;
        self.bookmark.set((0, 0));
    }

    pub fn capacity_bytes(&self) -> usize {
        self.buf.capacity_bytes()
    }
}

/// Raw byte sequence.
#[derive(Debug, Default)]
pub(crate) struct Binary {
    buf: Buf<u8>,
}

impl Binary {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            buf: Buf::from_vec(bytes),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.buf.as_slice()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn insert_at(&mut self, at: usize, src: &[u8], double: bool) {
        self.buf.insert_slice(at, src, double);
    }

    pub fn remove_range(&mut self, at: usize, count: usize) {
        self.buf.remove_range(at, count);
    }

    pub fn capacity_bytes(&self) -> usize {
        self.buf.capacity_bytes()
    }
}
