//! Placement of one sub-capture's 16 zones onto the 8×8 grid.
//!
//! The device scans the 64 zones in four sub-captures of 16. Which cells a
//! sub-capture covers depends on the SPAD map in use, so the mapping is a
//! runtime strategy: a [`ZoneLayout`] family composed with a per-capture
//! permutation.

use crate::grid::{cell_index, GRID_CELLS};

/// Number of sub-captures per full grid.
pub const CAPTURES: usize = 4;

/// Zones reported per sub-capture.
pub const ZONES_PER_CAPTURE: usize = 16;

/// How a sub-capture's 4×4 zones spread over the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ZoneLayout {
    /// Every other row and column, phase chosen by the capture's two bits:
    /// x = 2·col + (slot & 1), y = 2·row + (slot >> 1).
    #[default]
    Interleaved,
    /// One 4×4 quadrant per capture, left-to-right then top-to-bottom.
    Quadrant,
    /// Two full rows per capture.
    RowBand,
    /// Two full columns per capture.
    ColumnBand,
}

/// Runtime zone mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ZoneMap {
    layout: ZoneLayout,
    permutation: [u8; CAPTURES],
}

impl Default for ZoneMap {
    fn default() -> Self {
        Self::new(ZoneLayout::Interleaved)
    }
}

impl ZoneMap {
    /// Mapping with the identity capture permutation.
    #[must_use]
    pub const fn new(layout: ZoneLayout) -> Self {
        Self {
            layout,
            permutation: [0, 1, 2, 3],
        }
    }

    /// Mapping where device capture `c` lands in layout slot `permutation[c]`.
    ///
    /// Returns `None` unless `permutation` is a permutation of `0..4`.
    #[must_use]
    pub fn with_permutation(layout: ZoneLayout, permutation: [u8; CAPTURES]) -> Option<Self> {
        let mut seen = 0u8;
        for &slot in &permutation {
            if usize::from(slot) >= CAPTURES || seen & (1 << slot) != 0 {
                return None;
            }
            seen |= 1 << slot;
        }
        Some(Self {
            layout,
            permutation,
        })
    }

    /// Layout family.
    #[must_use]
    pub fn layout(&self) -> ZoneLayout {
        self.layout
    }

    /// Grid cell index for `zone` (`0..16`) of device capture `capture` (`0..4`).
    ///
    /// # Panics
    ///
    /// Panics if `capture >= 4` or `zone >= 16`.
    #[must_use]
    pub fn cell(&self, capture: usize, zone: usize) -> usize {
        assert!(capture < CAPTURES && zone < ZONES_PER_CAPTURE);
        let slot = usize::from(self.permutation[capture]);
        let (x, y) = match self.layout {
            ZoneLayout::Interleaved => {
                let (col, row) = (zone & 0x3, zone >> 2);
                ((col << 1) | (slot & 1), (row << 1) | (slot >> 1))
            }
            ZoneLayout::Quadrant => {
                let (col, row) = (zone & 0x3, zone >> 2);
                ((slot & 1) * 4 + col, (slot >> 1) * 4 + row)
            }
            ZoneLayout::RowBand => (zone % 8, slot * 2 + zone / 8),
            ZoneLayout::ColumnBand => (slot * 2 + zone % 2, zone / 2),
        };
        let index = cell_index(x, y);
        debug_assert!(index < GRID_CELLS);
        index
    }
}
