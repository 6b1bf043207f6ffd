//! Spatial repair and outlier-aware temporal filtering of depth grids.
//!
//! Each tick the raw grid is hole-filled, its corners are repaired, and every
//! cell is then fused with a spatial prediction and its own history:
//!
//! 1. predict from the median of the valid 3×3 neighbours, or from the cell's
//!    previous output when too few neighbours are valid;
//! 2. pull the live sample toward the prediction in proportion to how far it
//!    strays beyond a spread-adaptive outlier threshold;
//! 3. smooth against the previous output with a ratio that grows with the
//!    frame's valid fraction and jumps on large changes.
//!
//! A cell without a live sample holds its previous output for a few ticks and
//! then loses trust geometrically until it is dropped.

use crate::grid::{cell_index, median, DepthFrame, GRID_CELLS, GRID_SIDE};

/// Q10 unity.
const ONE: u32 = 1024;
const FULL_TRUST: u16 = 1024;

/// Denoiser tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DenoiseConfig {
    /// Hole-fill passes per tick.
    pub hole_fill_passes: u8,
    /// Valid neighbours needed to fill a hole.
    pub hole_fill_min_neighbours: u8,
    /// A corner further than this from the mean of its three neighbours is replaced.
    pub corner_max_delta_mm: u16,
    /// Valid neighbours needed for a spatial prediction.
    pub spatial_min_neighbours: u8,
    /// Outlier threshold before spread adaptation, mm.
    pub outlier_base_mm: u16,
    /// Lower clamp of the outlier threshold, mm.
    pub outlier_min_mm: u16,
    /// Upper clamp of the outlier threshold, mm.
    pub outlier_max_mm: u16,
    /// Weight (Q10) left on a sample that deviates by three thresholds or more.
    pub outlier_floor_q10: u16,
    /// Ticks a cell without a live sample keeps its value at full trust.
    pub hold_frames: u8,
    /// Trust retained per tick once the hold expires (Q10).
    pub decay_q10: u16,
    /// Trust (Q10) below which a held cell is dropped.
    pub drop_q10: u16,
    /// Temporal blend ratio (Q10) when no cell of the raw frame is valid.
    pub smoothing_min_q10: u16,
    /// Temporal blend ratio (Q10) when every cell of the raw frame is valid.
    pub smoothing_max_q10: u16,
    /// A tick-to-tick change above this tracks at `fast_blend_q10` at least.
    pub fast_change_mm: u16,
    /// Temporal blend ratio (Q10) used for fast changes.
    pub fast_blend_q10: u16,
}

impl Default for DenoiseConfig {
    fn default() -> Self {
        Self {
            hole_fill_passes: 2,
            hole_fill_min_neighbours: 3,
            corner_max_delta_mm: 250,
            spatial_min_neighbours: 3,
            outlier_base_mm: 80,
            outlier_min_mm: 60,
            outlier_max_mm: 600,
            outlier_floor_q10: 128,
            hold_frames: 3,
            decay_q10: 768,
            drop_q10: 128,
            smoothing_min_q10: 256,
            smoothing_max_q10: 768,
            fast_change_mm: 300,
            fast_blend_q10: 896,
        }
    }
}

/// Fills invalid cells with the mean of their valid 3×3 neighbours.
///
/// Each pass reads from a snapshot, so cells filled in one pass only feed
/// the next pass. A cell needs `min_neighbours` valid neighbours to be filled.
#[allow(clippy::cast_possible_truncation)]
pub fn hole_fill(frame: &mut DepthFrame, passes: u8, min_neighbours: u8) {
    let mut buf = [0u16; 8];
    for _ in 0..passes {
        if frame.valid_count() == GRID_CELLS {
            return;
        }
        let src = *frame;
        for y in 0..GRID_SIDE {
            for x in 0..GRID_SIDE {
                if src.at(x, y).is_some() {
                    continue;
                }
                let n = src.neighbours(x, y, &mut buf);
                if n == 0 || n < usize::from(min_neighbours) {
                    continue;
                }
                let sum: u32 = buf[..n].iter().map(|&v| u32::from(v)).sum();
                frame.set(cell_index(x, y), (sum / n as u32) as u16);
            }
        }
    }
}

const CORNERS: [((usize, usize), [(usize, usize); 3]); 4] = [
    ((0, 0), [(1, 0), (0, 1), (1, 1)]),
    ((7, 0), [(6, 0), (7, 1), (6, 1)]),
    ((0, 7), [(1, 7), (0, 6), (1, 6)]),
    ((7, 7), [(6, 7), (7, 6), (6, 6)]),
];

/// Replaces invalid or biased corners with the mean of their three neighbours.
///
/// Needs at least two valid neighbours to touch a corner.
pub fn repair_corners(frame: &mut DepthFrame, max_delta_mm: u16) {
    for ((cx, cy), neighbours) in CORNERS {
        let mut sum = 0u32;
        let mut n = 0u32;
        for (x, y) in neighbours {
            if let Some(mm) = frame.at(x, y) {
                sum += u32::from(mm);
                n += 1;
            }
        }
        if n < 2 {
            continue;
        }
        #[allow(clippy::cast_possible_truncation)]
        let mean = (sum / n) as u16;
        let replace = match frame.at(cx, cy) {
            None => true,
            Some(mm) => mm.abs_diff(mean) > max_delta_mm,
        };
        if replace {
            frame.set(cell_index(cx, cy), mean);
        }
    }
}

/// Interquartile range of the valid cells, or 0 with fewer than four.
fn spread(frame: &DepthFrame) -> u16 {
    let mut values = [0u16; GRID_CELLS];
    let mut n = 0;
    for (_, mm) in frame.valid_cells() {
        values[n] = mm;
        n += 1;
    }
    if n < 4 {
        return 0;
    }
    let values = &mut values[..n];
    values.sort_unstable();
    values[(n * 3) / 4] - values[n / 4]
}

/// Q10 weight kept on the live sample for a given deviation from prediction.
fn sample_weight(deviation: u16, threshold: u16, floor_q10: u16) -> u32 {
    let t = u32::from(threshold.max(1));
    let d = u32::from(deviation);
    let floor = u32::from(floor_q10).min(ONE);
    if d <= t {
        ONE
    } else if d >= 3 * t {
        floor
    } else {
        ONE - (ONE - floor) * (d - t) / (2 * t)
    }
}

fn blend(from: u16, to: u16, ratio_q10: u32) -> u16 {
    let from = i64::from(from);
    let delta = i64::from(to) - from;
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let out = (from + delta * i64::from(ratio_q10) / i64::from(ONE)) as u16;
    out
}

#[derive(Debug, Clone, Copy, Default)]
struct CellHistory {
    /// Previous output, 0 when none.
    mm: u16,
    missing: u8,
    trust_q10: u16,
}

/// Stateful denoising stage.
#[derive(Debug, Clone)]
pub struct Denoiser {
    config: DenoiseConfig,
    history: [CellHistory; GRID_CELLS],
}

impl Denoiser {
    /// Creates a denoiser with empty history.
    #[must_use]
    pub fn new(config: DenoiseConfig) -> Self {
        Self {
            config,
            history: [CellHistory::default(); GRID_CELLS],
        }
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &DenoiseConfig {
        &self.config
    }

    /// Drops all per-cell history.
    pub fn reset(&mut self) {
        self.history = [CellHistory::default(); GRID_CELLS];
    }

    /// Outlier threshold for a frame with the given interquartile spread.
    #[must_use]
    pub fn outlier_threshold(&self, spread_mm: u16) -> u16 {
        let cfg = &self.config;
        cfg.outlier_base_mm
            .saturating_add(spread_mm / 2)
            .clamp(cfg.outlier_min_mm, cfg.outlier_max_mm.max(cfg.outlier_min_mm))
    }

    /// Runs one tick over `raw` and returns the filtered grid.
    ///
    /// `raw` is the reader's best-known grid; pass an empty frame when the
    /// reader produced nothing this tick so every cell ages.
    #[allow(clippy::cast_possible_truncation)]
    pub fn process(&mut self, raw: &DepthFrame) -> DepthFrame {
        let cfg = self.config;

        let valid_fraction_q10 = (raw.valid_count() as u32 * ONE / GRID_CELLS as u32).min(ONE);

        let mut repaired = *raw;
        hole_fill(&mut repaired, cfg.hole_fill_passes, cfg.hole_fill_min_neighbours);
        repair_corners(&mut repaired, cfg.corner_max_delta_mm);

        let threshold = self.outlier_threshold(spread(&repaired));
        let smoothing = u32::from(cfg.smoothing_min_q10)
            + (u32::from(cfg.smoothing_max_q10.max(cfg.smoothing_min_q10)) - u32::from(cfg.smoothing_min_q10))
                * valid_fraction_q10
                / ONE;

        let mut out = DepthFrame::empty();
        let mut buf = [0u16; 8];
        for y in 0..GRID_SIDE {
            for x in 0..GRID_SIDE {
                let idx = cell_index(x, y);
                let hist = &mut self.history[idx];
                let previous = (hist.mm != 0).then_some(hist.mm);

                let n = repaired.neighbours(x, y, &mut buf);
                let prediction = if n >= usize::from(cfg.spatial_min_neighbours.max(1)) {
                    median(&mut buf[..n])
                } else {
                    previous
                };

                match repaired.at(x, y) {
                    Some(sample) => {
                        let fused = match prediction {
                            Some(p) => {
                                let w = sample_weight(sample.abs_diff(p), threshold, cfg.outlier_floor_q10);
                                blend(p, sample, w)
                            }
                            None => sample,
                        };
                        let value = match previous {
                            Some(prev) => {
                                let mut ratio = smoothing;
                                if fused.abs_diff(prev) > cfg.fast_change_mm {
                                    ratio = ratio.max(u32::from(cfg.fast_blend_q10));
                                }
                                blend(prev, fused, ratio.min(ONE))
                            }
                            None => fused,
                        };
                        out.set(idx, value);
                        *hist = CellHistory {
                            mm: out.get(idx).unwrap_or(0),
                            missing: 0,
                            trust_q10: FULL_TRUST,
                        };
                    }
                    None => {
                        let Some(prev) = previous else {
                            continue;
                        };
                        hist.missing = hist.missing.saturating_add(1);
                        if hist.missing > cfg.hold_frames {
                            hist.trust_q10 = (u32::from(hist.trust_q10) * u32::from(cfg.decay_q10) / ONE) as u16;
                        }
                        if hist.trust_q10 < cfg.drop_q10 {
                            *hist = CellHistory::default();
                        } else {
                            out.set(idx, prev);
                        }
                    }
                }
            }
        }
        out
    }
}

impl Default for Denoiser {
    fn default() -> Self {
        Self::new(DenoiseConfig::default())
    }
}
