//! Cell addressing for the 64x64 foil matrix.
//!
//! The device prefixes every frame with one row's worth of header bytes. All
//! per-cell buffers are indexed by [`Cell`], and the header offset is applied
//! only when a sample is pulled out of a [`RawFrame`].

use std::ops::{Index, IndexMut};

pub const GRID_ROWS: usize = 64;
pub const GRID_COLS: usize = 64;
pub const CELL_COUNT: usize = GRID_ROWS * GRID_COLS;

/// Bytes preceding the cell matrix in a raw frame.
pub const FRAME_HEADER_LEN: usize = GRID_COLS;

/// Total size of one raw frame as delivered by the bulk-in endpoint.
pub const FRAME_LEN: usize = FRAME_HEADER_LEN + CELL_COUNT;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cell {
    pub row: usize,
    pub col: usize,
}

impl Cell {
    pub const fn new(row: usize, col: usize) -> Self {
        Self { row, col }
    }

    /// Linear index into a row-major cell buffer.
    pub const fn index(self) -> usize {
        self.row * GRID_COLS + self.col
    }

    /// Neighbouring cell, or `None` when the offset leaves the matrix.
    pub fn offset(self, d_row: isize, d_col: isize) -> Option<Cell> {
        let row = self.row.checked_add_signed(d_row)?;
        let col = self.col.checked_add_signed(d_col)?;
        (row < GRID_ROWS && col < GRID_COLS).then_some(Cell { row, col })
    }

    /// Every cell in row-major scan order.
    pub fn all() -> impl Iterator<Item = Cell> {
        (0..GRID_ROWS).flat_map(|row| (0..GRID_COLS).map(move |col| Cell { row, col }))
    }
}

/// Owned, fixed-size matrix with one value per cell.
#[derive(Clone)]
pub struct CellGrid<T> {
    data: Box<[T]>,
}

impl<T: Copy + Default> CellGrid<T> {
    pub fn new() -> Self {
        Self::filled(T::default())
    }

    pub fn filled(value: T) -> Self {
        Self {
            data: vec![value; CELL_COUNT].into_boxed_slice(),
        }
    }

    pub fn fill(&mut self, value: T) {
        self.data.fill(value);
    }

    pub fn copy_from(&mut self, other: &CellGrid<T>) {
        self.data.copy_from_slice(&other.data);
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }
}

impl<T: Copy + Default> Default for CellGrid<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Index<Cell> for CellGrid<T> {
    type Output = T;

    fn index(&self, cell: Cell) -> &T {
        &self.data[cell.index()]
    }
}

impl<T> IndexMut<Cell> for CellGrid<T> {
    fn index_mut(&mut self, cell: Cell) -> &mut T {
        &mut self.data[cell.index()]
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for CellGrid<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CellGrid")
            .field("rows", &GRID_ROWS)
            .field("cols", &GRID_COLS)
            .finish_non_exhaustive()
    }
}

/// One raw frame: header bytes followed by one unsigned byte per cell.
#[derive(Clone)]
pub struct RawFrame {
    bytes: Box<[u8]>,
}

impl RawFrame {
    pub fn new() -> Self {
        Self {
            bytes: vec![0u8; FRAME_LEN].into_boxed_slice(),
        }
    }

    /// Copy a complete frame out of `bytes`. Returns `None` for short input.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let src = bytes.get(..FRAME_LEN)?;
        let mut frame = Self::new();
        frame.bytes.copy_from_slice(src);
        Some(frame)
    }

    pub fn sample(&self, cell: Cell) -> u8 {
        self.bytes[FRAME_HEADER_LEN + cell.index()]
    }

    pub fn set_sample(&mut self, cell: Cell, value: u8) {
        self.bytes[FRAME_HEADER_LEN + cell.index()] = value;
    }

    pub fn header(&self) -> &[u8] {
        &self.bytes[..FRAME_HEADER_LEN]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl Default for RawFrame {
    fn default() -> Self {
        Self::new()
    }
}
