//! Reassembly of four sub-captures into one 64-cell grid.

use crate::frame::{select, FrameConfig, ResultFrame};
use crate::grid::{DepthFrame, GRID_CELLS};
use crate::zone_map::{CAPTURES, ZONES_PER_CAPTURE};

const ALL_CAPTURES: u8 = (1 << CAPTURES) - 1;

/// Bookkeeping reported alongside each merged grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CaptureStats {
    /// Sequence id of the merged frame.
    pub sequence: u8,
    /// Sub-capture index of the merged frame.
    pub capture: u8,
    /// Capture mask after this merge, before a completed cycle resets it.
    pub mask: u8,
    /// Zones refreshed by this frame.
    pub updated: u8,
    /// Zones refreshed since the sequence started.
    pub sequence_updated: u16,
    /// Valid cells in the merged grid.
    pub valid_cells: u8,
    /// Grids completed since the last reset.
    pub completed: u32,
}

/// Per-sequence accumulation state.
///
/// Holds the best-known value of every cell plus a saturating streak of
/// consecutive captures in which that cell's zone came back empty.
#[derive(Debug, Clone)]
pub struct CaptureCycle {
    last: DepthFrame,
    invalid_streak: [u8; GRID_CELLS],
    mask: u8,
    sequence: Option<u8>,
    sequence_updated: u16,
    completed: u32,
}

impl Default for CaptureCycle {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureCycle {
    /// Empty state.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            last: DepthFrame::empty(),
            invalid_streak: [0; GRID_CELLS],
            mask: 0,
            sequence: None,
            sequence_updated: 0,
            completed: 0,
        }
    }

    /// Forgets every held value, streak and partial sequence.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Best-known grid.
    #[must_use]
    pub fn grid(&self) -> &DepthFrame {
        &self.last
    }

    /// Sub-captures merged so far in the current sequence.
    #[must_use]
    pub fn mask(&self) -> u8 {
        self.mask
    }

    /// Consecutive empty captures recorded for `cell`.
    #[must_use]
    pub fn invalid_streak(&self, cell: usize) -> u8 {
        self.invalid_streak[cell]
    }

    /// Merges one decoded sub-capture.
    ///
    /// Returns the best-known grid and whether this merge completed the
    /// sequence, i.e. every one of the four sub-captures has refreshed at
    /// least one zone since the sequence started.
    pub fn merge(&mut self, frame: &ResultFrame, config: &FrameConfig) -> (DepthFrame, bool, CaptureStats) {
        if self.sequence != Some(frame.sequence) {
            if self.mask != 0 {
                trace!("Sequence {:?} replaced by {} with mask {:#x}", self.sequence, frame.sequence, self.mask);
            }
            self.sequence = Some(frame.sequence);
            self.mask = 0;
            self.sequence_updated = 0;
        }

        let capture = usize::from(frame.capture & 0x03);
        let mut updated = 0u8;
        for (zone, objects) in frame.zones.iter().enumerate().take(ZONES_PER_CAPTURE) {
            let cell = config.zone_map.cell(capture, zone);
            if let Some(mm) = select(objects, config).mm(config) {
                self.last.set(cell, mm);
                self.invalid_streak[cell] = 0;
                updated += 1;
            } else if self.last.get(cell).is_some() && self.invalid_streak[cell] < config.hold_frames {
                self.invalid_streak[cell] += 1;
            } else {
                self.last.clear(cell);
                self.invalid_streak[cell] = self.invalid_streak[cell].saturating_add(1);
            }
        }

        self.sequence_updated = self.sequence_updated.saturating_add(u16::from(updated));
        if updated > 0 {
            self.mask |= 1 << capture;
        }
        let mask = self.mask;
        let complete = mask == ALL_CAPTURES;
        if complete {
            self.completed = self.completed.wrapping_add(1);
        }

        #[allow(clippy::cast_possible_truncation)]
        let stats = CaptureStats {
            sequence: frame.sequence,
            capture: frame.capture & 0x03,
            mask,
            updated,
            sequence_updated: self.sequence_updated,
            valid_cells: self.last.valid_count() as u8,
            completed: self.completed,
        };
        trace!(
            "seq={} cap={} mask={:#x} valid={} updated={}",
            stats.sequence,
            stats.capture,
            stats.mask,
            stats.valid_cells,
            stats.sequence_updated
        );

        if complete {
            self.mask = 0;
            self.sequence_updated = 0;
        }
        (self.last, complete, stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::ObjectRecord;

    fn frame(capture: u8, sequence: u8, mm: impl Fn(usize) -> u16) -> ResultFrame {
        let mut zones = [[ObjectRecord::default(); 2]; ZONES_PER_CAPTURE];
        for (zone, objects) in zones.iter_mut().enumerate() {
            objects[0] = ObjectRecord {
                confidence: 60,
                distance: mm(zone).to_le_bytes(),
            };
        }
        ResultFrame {
            capture,
            sequence,
            zones,
        }
    }

    #[test]
    fn four_captures_in_any_order_fill_the_grid() {
        let cfg = FrameConfig::default();
        let mut cycle = CaptureCycle::new();
        let order = [2u8, 0, 3, 1];
        for (i, &capture) in order.iter().enumerate() {
            let (grid, complete, _) =
                cycle.merge(&frame(capture, 7, |z| 1000 + u16::from(capture) * 100 + z as u16), &cfg);
            assert_eq!(complete, i == order.len() - 1);
            if complete {
                assert_eq!(grid.valid_count(), GRID_CELLS);
                for y in 0..8 {
                    for x in 0..8 {
                        let capture = ((y % 2) << 1) | (x % 2);
                        let zone = (y / 2) * 4 + x / 2;
                        assert_eq!(grid.at(x, y), Some(1000 + capture as u16 * 100 + zone as u16));
                    }
                }
            }
        }
        assert_eq!(cycle.mask(), 0);
    }

    #[test]
    fn new_sequence_restarts_the_mask() {
        let cfg = FrameConfig::default();
        let mut cycle = CaptureCycle::new();
        cycle.merge(&frame(0, 1, |_| 800), &cfg);
        cycle.merge(&frame(1, 1, |_| 800), &cfg);
        cycle.merge(&frame(2, 1, |_| 800), &cfg);
        let (_, complete, stats) = cycle.merge(&frame(3, 2, |_| 800), &cfg);
        assert!(!complete);
        assert_eq!(stats.mask, 0b1000);
    }

    #[test]
    fn empty_capture_does_not_count_towards_completion() {
        let cfg = FrameConfig::default();
        let mut cycle = CaptureCycle::new();
        cycle.merge(&frame(0, 3, |_| 800), &cfg);
        cycle.merge(&frame(1, 3, |_| 800), &cfg);
        cycle.merge(&frame(2, 3, |_| 0xFFFF), &cfg);
        let (_, complete, stats) = cycle.merge(&frame(3, 3, |_| 800), &cfg);
        assert!(!complete);
        assert_eq!(stats.mask, 0b1011);
    }

    #[test]
    fn missing_zone_is_held_then_cleared() {
        let cfg = FrameConfig {
            hold_frames: 3,
            ..FrameConfig::default()
        };
        let mut cycle = CaptureCycle::new();
        let cell = cfg.zone_map.cell(0, 5);
        cycle.merge(&frame(0, 0, |_| 640), &cfg);

        let gap = |z: usize| if z == 5 { 0xFFFF } else { 640 };
        for miss in 1..=3u8 {
            let (grid, _, _) = cycle.merge(&frame(0, miss, gap), &cfg);
            assert_eq!(grid.get(cell), Some(640), "held through miss {miss}");
            assert_eq!(cycle.invalid_streak(cell), miss);
        }
        let (grid, _, _) = cycle.merge(&frame(0, 9, gap), &cfg);
        assert_eq!(grid.get(cell), None);
        assert_eq!(cycle.invalid_streak(cell), 4);

        let (grid, _, _) = cycle.merge(&frame(0, 10, |_| 700), &cfg);
        assert_eq!(grid.get(cell), Some(700));
        assert_eq!(cycle.invalid_streak(cell), 0);
    }

    #[test]
    fn invalid_streak_saturates() {
        let cfg = FrameConfig::default();
        let mut cycle = CaptureCycle::new();
        for seq in 0..300u32 {
            cycle.merge(&frame(1, (seq % 64) as u8, |_| 0xFFFF), &cfg);
        }
        assert_eq!(cycle.invalid_streak(cfg.zone_map.cell(1, 0)), u8::MAX);
    }

    #[test]
    fn too_close_returns_update_the_grid() {
        let cfg = FrameConfig::default();
        let mut cycle = CaptureCycle::new();
        let mut f = frame(0, 0, |_| 0);
        let (grid, _, stats) = cycle.merge(&f, &cfg);
        assert_eq!(stats.updated, 16);
        assert_eq!(grid.get(cfg.zone_map.cell(0, 0)), Some(20));

        f.zones[0][0].confidence = 0;
        let (_, _, stats) = cycle.merge(&f, &cfg);
        assert_eq!(stats.updated, 15);
    }
}
