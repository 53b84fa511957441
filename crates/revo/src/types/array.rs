//! Arrays: ordered cell sequences with optional file/line provenance.

use crate::{cell::Cell, intern::SymbolId, types::buf::Buf};

#[derive(Debug, Default)]
pub(crate) struct Array {
    cells: Buf<Cell>,
    /// Provenance when the array came from a source file.
    pub file: Option<SymbolId>,
    pub line: Option<u32>,
}

impl Array {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_cells(cells: Vec<Cell>) -> Self {
        Self {
            cells: Buf::from_vec(cells),
            file: None,
            line: None,
        }
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn cells(&self) -> &[Cell] {
        self.cells.as_slice()
    }

    pub fn cells_mut(&mut self) -> &mut [Cell] {
        self.cells.as_mut_slice()
    }

    /// Tail slice from a series index, clamped at the end.
    pub fn cells_at(&self, index: u32) -> &[Cell] {
        let at = (index as usize).min(self.len());
        &self.cells.as_slice()[at..]
    }

    pub fn get(&self, index: usize) -> Option<&Cell> {
        self.cells.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Cell> {
        self.cells.get_mut(index)
    }

    pub fn push(&mut self, cell: Cell) {
        self.cells.push(cell);
    }

    pub fn insert_at(&mut self, at: usize, src: &[Cell], double: bool) {
        self.cells.insert_slice(at, src, double);
    }

    pub fn remove_range(&mut self, at: usize, count: usize) {
        self.cells.remove_range(at, count);
    }

    pub fn truncate(&mut self, len: usize) {
        self.cells.truncate(len);
    }

    /// Releases spare capacity; used when a frame varlist collapses.
    pub fn compact(&mut self) {
        self.cells.compact();
    }

    pub fn capacity_bytes(&self) -> usize {
        self.cells.capacity_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_slice_clamps() {
        let arr = Array::from_cells(vec![Cell::integer(1), Cell::integer(2)]);
        assert_eq!(arr.cells_at(1).len(), 1);
        assert_eq!(arr.cells_at(9).len(), 0);
    }

    #[test]
    fn insert_and_remove() {
        let mut arr = Array::from_cells(vec![Cell::integer(1), Cell::integer(3)]);
        arr.insert_at(1, &[Cell::integer(2)], false);
        assert_eq!(arr.len(), 3);
        arr.remove_range(0, 1);
        assert_eq!(arr.get(0), Some(&Cell::integer(2)));
    }
}
