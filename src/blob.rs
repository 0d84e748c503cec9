//! Greedy single-pass grouping of triggered cells into finger contacts.

use crate::grid::{Cell, CellGrid};

/// Cells a contact's box is widened by on every side when testing whether a
/// triggered cell belongs to it.
pub const DILATION_MARGIN: usize = 2;

/// One finger contact, in cell units. Extents grow right and down only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Contact {
    pub slot: usize,
    pub x: usize,
    pub y: usize,
    pub w: usize,
    pub h: usize,
}

impl Contact {
    fn new(slot: usize, cell: Cell) -> Self {
        Self {
            slot,
            x: cell.col,
            y: cell.row,
            w: 1,
            h: 1,
        }
    }

    /// `x-2 <= col < x+w+3`, and likewise for rows.
    fn dilated_contains(&self, cell: Cell) -> bool {
        cell.col + DILATION_MARGIN >= self.x
            && cell.col < self.x + self.w + DILATION_MARGIN + 1
            && cell.row + DILATION_MARGIN >= self.y
            && cell.row < self.y + self.h + DILATION_MARGIN + 1
    }

    fn grow_to(&mut self, cell: Cell) {
        self.w = self.w.max((cell.col + 1).saturating_sub(self.x));
        self.h = self.h.max((cell.row + 1).saturating_sub(self.y));
    }
}

/// Scan `scores` row-major and group every cell above `threshold`.
///
/// A triggered cell joins the first contact whose dilated box holds it;
/// otherwise it opens a new contact, unless `max_contacts` are already open,
/// in which case it is dropped. Contacts are never merged with each other.
pub fn extract_contacts(
    scores: &CellGrid<u16>,
    threshold: u16,
    max_contacts: usize,
) -> Vec<Contact> {
    let mut contacts: Vec<Contact> = Vec::with_capacity(max_contacts);

    for cell in Cell::all().filter(|&cell| scores[cell] > threshold) {
        let open = contacts.len();
        match contacts.iter_mut().find(|c| c.dilated_contains(cell)) {
            Some(contact) => contact.grow_to(cell),
            None if open < max_contacts => contacts.push(Contact::new(open, cell)),
            None => {}
        }
    }

    contacts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid_with(cells: &[(usize, usize)], value: u16) -> CellGrid<u16> {
        let mut grid = CellGrid::new();
        for &(row, col) in cells {
            grid[Cell::new(row, col)] = value;
        }
        grid
    }

    #[test]
    fn test_no_triggered_cells_yields_nothing() {
        let grid = grid_with(&[(5, 5)], 275);
        assert!(extract_contacts(&grid, 275, 10).is_empty());
    }

    #[test]
    fn test_adjacent_cells_form_one_contact() {
        let grid = grid_with(&[(10, 10), (10, 11), (11, 10), (11, 11)], 510);
        let contacts = extract_contacts(&grid, 275, 10);
        assert_eq!(
            contacts,
            vec![Contact {
                slot: 0,
                x: 10,
                y: 10,
                w: 2,
                h: 2
            }]
        );
    }

    #[test]
    fn test_dilation_margin_bridges_small_gaps() {
        // Two cells apart horizontally: still inside the dilated box.
        let grid = grid_with(&[(20, 20), (20, 23)], 300);
        let contacts = extract_contacts(&grid, 275, 10);
        assert_eq!(contacts.len(), 1);
        assert_eq!(contacts[0].w, 4);

        // Four cells apart starts a new contact.
        let grid = grid_with(&[(20, 20), (20, 25)], 300);
        assert_eq!(extract_contacts(&grid, 275, 10).len(), 2);
    }

    #[test]
    fn test_cells_left_of_origin_do_not_shrink_box() {
        let grid = grid_with(&[(30, 30), (31, 28)], 300);
        let contacts = extract_contacts(&grid, 275, 10);
        assert_eq!(contacts.len(), 1);
        assert_eq!((contacts[0].x, contacts[0].w, contacts[0].h), (30, 1, 2));
    }

    #[test]
    fn test_slots_follow_creation_order() {
        let grid = grid_with(&[(40, 5), (2, 60), (2, 2)], 300);
        let contacts = extract_contacts(&grid, 275, 10);
        let origins: Vec<_> = contacts.iter().map(|c| (c.slot, c.x, c.y)).collect();
        assert_eq!(origins, vec![(0, 2, 2), (1, 60, 2), (2, 5, 40)]);
    }

    #[test]
    fn test_extraction_is_deterministic() {
        let cells: Vec<_> = (0..64).step_by(7).flat_map(|r| [(r, r), (r, 63 - r)]).collect();
        let grid = grid_with(&cells, 400);
        assert_eq!(
            extract_contacts(&grid, 275, 10),
            extract_contacts(&grid, 275, 10)
        );
    }

    #[test]
    fn test_cap_drops_new_contacts_but_keeps_growing_existing() {
        let mut cells: Vec<_> = (0..12).map(|i| (0, i * 5)).collect();
        // Below contact 0 and inside its dilated box.
        cells.push((1, 0));
        let grid = grid_with(&cells, 300);

        let contacts = extract_contacts(&grid, 275, 10);
        assert_eq!(contacts.len(), 10);
        assert!(contacts.iter().all(|c| c.x < 50));
        assert_eq!(contacts[0].h, 2);
        assert!(contacts[1..].iter().all(|c| c.w == 1 && c.h == 1));
    }
}
