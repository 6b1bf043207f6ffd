//! The 8×8 depth grid shared by every pipeline stage.

/// Number of cells per grid side.
pub const GRID_SIDE: usize = 8;

/// Number of cells in a depth grid.
pub const GRID_CELLS: usize = GRID_SIDE * GRID_SIDE;

/// Largest distance a cell may hold, in millimetres.
pub const MAX_DISTANCE_MM: u16 = 11_999;

/// Returns `true` when `mm` is a usable distance (`1..=11999`).
#[inline]
#[must_use]
pub fn is_valid_mm(mm: u16) -> bool {
    (1..=MAX_DISTANCE_MM).contains(&mm)
}

/// Row-major index of cell (`x`, `y`).
#[inline]
#[must_use]
pub const fn cell_index(x: usize, y: usize) -> usize {
    y * GRID_SIDE + x
}

/// 64 depth cells, each either invalid (`0`) or a distance in `1..=11999` mm.
///
/// Cells are stored row-major: index `y * 8 + x`. Values written through
/// [`DepthFrame::set`] that fall outside the valid range are stored as invalid,
/// so a frame never carries an out-of-range distance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DepthFrame {
    cells: [u16; GRID_CELLS],
}

impl Default for DepthFrame {
    fn default() -> Self {
        Self::empty()
    }
}

impl DepthFrame {
    /// A frame with every cell invalid.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            cells: [0; GRID_CELLS],
        }
    }

    /// Builds a frame from raw millimetre values; out-of-range values become invalid.
    #[must_use]
    pub fn from_mm(raw: [u16; GRID_CELLS]) -> Self {
        let mut frame = Self::empty();
        for (i, &mm) in raw.iter().enumerate() {
            frame.set(i, mm);
        }
        frame
    }

    /// Distance at `index`, or `None` when the cell is invalid.
    #[inline]
    #[must_use]
    pub fn get(&self, index: usize) -> Option<u16> {
        let mm = self.cells[index];
        is_valid_mm(mm).then_some(mm)
    }

    /// Distance at (`x`, `y`), or `None` when the cell is invalid.
    #[inline]
    #[must_use]
    pub fn at(&self, x: usize, y: usize) -> Option<u16> {
        self.get(cell_index(x, y))
    }

    /// Stores `mm` at `index`; anything outside `1..=11999` clears the cell.
    #[inline]
    pub fn set(&mut self, index: usize, mm: u16) {
        self.cells[index] = if is_valid_mm(mm) { mm } else { 0 };
    }

    /// Marks the cell at `index` invalid.
    #[inline]
    pub fn clear(&mut self, index: usize) {
        self.cells[index] = 0;
    }

    /// Raw cell values, `0` meaning invalid.
    #[must_use]
    pub fn as_mm(&self) -> &[u16; GRID_CELLS] {
        &self.cells
    }

    /// Number of valid cells.
    #[must_use]
    pub fn valid_count(&self) -> usize {
        self.cells.iter().filter(|&&mm| is_valid_mm(mm)).count()
    }

    /// Iterates over `(index, mm)` for the valid cells only.
    pub fn valid_cells(&self) -> impl Iterator<Item = (usize, u16)> + '_ {
        self.cells
            .iter()
            .enumerate()
            .filter(|(_, &mm)| is_valid_mm(mm))
            .map(|(i, &mm)| (i, mm))
    }

    /// Smallest valid distance in the frame.
    #[must_use]
    pub fn nearest(&self) -> Option<u16> {
        self.valid_cells().map(|(_, mm)| mm).min()
    }

    /// Valid values among the up-to-8 neighbours of (`x`, `y`).
    ///
    /// Returns the number of values written into `out`.
    pub fn neighbours(&self, x: usize, y: usize, out: &mut [u16; 8]) -> usize {
        let mut n = 0;
        for dy in -1i32..=1 {
            for dx in -1i32..=1 {
                if dx == 0 && dy == 0 {
                    continue;
                }
                let nx = x as i32 + dx;
                let ny = y as i32 + dy;
                if !(0..GRID_SIDE as i32).contains(&nx) || !(0..GRID_SIDE as i32).contains(&ny) {
                    continue;
                }
                if let Some(mm) = self.at(nx as usize, ny as usize) {
                    out[n] = mm;
                    n += 1;
                }
            }
        }
        n
    }
}

/// Median of a small scratch slice; sorts it in place. `None` when empty.
pub(crate) fn median(values: &mut [u16]) -> Option<u16> {
    if values.is_empty() {
        return None;
    }
    values.sort_unstable();
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        #[allow(clippy::cast_possible_truncation)]
        Some(((u32::from(values[mid - 1]) + u32::from(values[mid])) / 2) as u16)
    } else {
        Some(values[mid])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_range_values_are_stored_invalid() {
        let mut frame = DepthFrame::empty();
        frame.set(0, 12_000);
        frame.set(1, 11_999);
        frame.set(2, 0);
        assert_eq!(frame.get(0), None);
        assert_eq!(frame.get(1), Some(11_999));
        assert_eq!(frame.get(2), None);
        assert_eq!(frame.as_mm()[0], 0);
    }

    #[test]
    fn corner_has_three_neighbours() {
        let frame = DepthFrame::from_mm([500; GRID_CELLS]);
        let mut buf = [0; 8];
        assert_eq!(frame.neighbours(0, 0, &mut buf), 3);
        assert_eq!(frame.neighbours(7, 3, &mut buf), 5);
        assert_eq!(frame.neighbours(4, 4, &mut buf), 8);
    }

    #[test]
    fn median_of_even_and_odd_sets() {
        assert_eq!(median(&mut [5, 1, 3]), Some(3));
        assert_eq!(median(&mut [4, 1, 3, 2]), Some(2));
        assert_eq!(median(&mut []), None);
    }
}
