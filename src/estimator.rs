//! Distance and fullness estimation from a filtered depth grid.
//!
//! All arithmetic is fixed point: distances fuse in Q8 millimetres, while
//! confidence and fullness are Q10 fractions in `0..=1024`.

use crate::grid::{cell_index, median, DepthFrame, GRID_CELLS, GRID_SIDE};

const ONE: i32 = 1024;

/// Estimator tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EstimatorConfig {
    /// Initial near (full) bound, mm.
    pub near_mm: u16,
    /// Initial far (empty) bound, mm.
    pub far_mm: u16,
    /// Allowed range of the near bound, mm.
    pub near_range_mm: (u16, u16),
    /// Allowed range of the far bound, mm.
    pub far_range_mm: (u16, u16),
    /// Smallest allowed distance between the bounds, mm.
    pub min_bound_gap_mm: u16,
    /// Valid cells at which the count score reaches half.
    pub min_valid_cells: u8,
    /// Spread at or below which the spread score is full, mm.
    pub spread_good_mm: u16,
    /// Spread at or above which the spread score is zero, mm.
    pub spread_bad_mm: u16,
    /// Valid center cells needed before the center average is blended in.
    pub center_min_samples: u8,
    /// Weight (Q10) of the center average in the primary estimate.
    pub center_weight_q10: u16,
    /// Confidence (Q10) needed before the bounds adapt.
    pub calibration_min_confidence_q10: u16,
    /// An estimate within this distance of a bound pulls that bound, mm.
    pub calibration_margin_mm: u16,
    /// Bound adaptation rate as a right shift (5 is 1/32 per tick).
    pub calibration_rate_shift: u8,
    /// Confidence (Q10) above which fusion uses its faster denominators.
    pub high_confidence_q10: u16,
    /// Distance step treated as a fast change during fusion, mm.
    pub fast_delta_mm: u16,
    /// Fullness step (Q10) treated as a fast change.
    pub fast_fullness_delta_q10: u16,
    /// Valid cells a row needs to contribute to the roll curve.
    pub roll_min_row_cells: u8,
    /// Contributing rows needed for a roll-curve estimate.
    pub roll_min_rows: u8,
    /// Below this many valid cells a high mean reads as empty.
    pub empty_sparse_cells: u8,
    /// Mean distance that, with few valid cells, reads as empty, mm.
    pub empty_sparse_mean_mm: u16,
    /// Nearest sample at or beyond which the grid reads as empty, mm.
    pub empty_trigger_mm: u16,
    /// Nearest sample at or below which a sparse grid reads as full, mm.
    pub sparse_full_nearest_mm: u16,
    /// Valid cells below which a very close return may read as full.
    pub sparse_full_max_cells: u8,
    /// Mean distance at or above which a very close return reads as full, mm.
    pub sparse_full_mean_mm: u16,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            near_mm: 120,
            far_mm: 2200,
            near_range_mm: (30, 600),
            far_range_mm: (800, 4000),
            min_bound_gap_mm: 400,
            min_valid_cells: 8,
            spread_good_mm: 80,
            spread_bad_mm: 600,
            center_min_samples: 6,
            center_weight_q10: 256,
            calibration_min_confidence_q10: 800,
            calibration_margin_mm: 120,
            calibration_rate_shift: 5,
            high_confidence_q10: 700,
            fast_delta_mm: 150,
            fast_fullness_delta_q10: 160,
            roll_min_row_cells: 2,
            roll_min_rows: 3,
            empty_sparse_cells: 12,
            empty_sparse_mean_mm: 1800,
            empty_trigger_mm: 1900,
            sparse_full_nearest_mm: 60,
            sparse_full_max_cells: 16,
            sparse_full_mean_mm: 900,
        }
    }
}

/// Output of one estimator tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Estimate {
    /// Fused distance, mm.
    pub mm: u16,
    /// Filtered fullness, Q10.
    pub fullness_q10: u16,
    /// Measurement confidence, Q10.
    pub confidence_q10: u16,
    /// No usable signal, or everything usable is far away.
    pub hard_empty: bool,
    /// A very close reflector dominates an otherwise distant, sparse read.
    pub sparse_full: bool,
    /// Nearest valid sample, mm.
    pub nearest_mm: Option<u16>,
    /// Valid cells seen this tick.
    pub valid_cells: u8,
    /// Interquartile spread of the valid cells, mm.
    pub spread_mm: u16,
    /// Roll-curve secondary estimate, mm.
    pub roll_mm: Option<u16>,
}

/// Fullness for `mm` between fixed bounds: 1024 at or below `near_mm`, 0 at or
/// above `far_mm`, linear in between.
#[must_use]
pub fn fullness_from_mm(mm: u16, near_mm: u16, far_mm: u16) -> u16 {
    if mm <= near_mm {
        return 1024;
    }
    if mm >= far_mm {
        return 0;
    }
    let span = u32::from(far_mm - near_mm);
    let remaining = u32::from(far_mm - mm);
    #[allow(clippy::cast_possible_truncation)]
    let full = (remaining * 1024 / span) as u16;
    full
}

/// Fusion step denominator for a given confidence class and step size.
const fn denominator(high_confidence: bool, fast: bool) -> i32 {
    match (high_confidence, fast) {
        (true, true) => 2,
        (true, false) | (false, true) => 4,
        (false, false) => 8,
    }
}

/// Moves `value` toward `target` by `1/den` of the gap, at least one unit.
fn approach(value: i32, target: i32, den: i32) -> i32 {
    let delta = target - value;
    if delta == 0 {
        return value;
    }
    let step = delta / den;
    if step == 0 {
        value + delta.signum()
    } else {
        value + step
    }
}

/// Robust statistics of one grid.
#[derive(Debug, Clone, Copy, Default)]
struct Summary {
    count: usize,
    mean: u32,
    trimmed_mean: u32,
    nearest: Option<u16>,
    spread: u16,
    center: Option<u32>,
    roll: Option<u16>,
}

#[allow(clippy::cast_possible_truncation)]
fn summarize(frame: &DepthFrame, config: &EstimatorConfig) -> Summary {
    let mut values = [0u16; GRID_CELLS];
    let mut count = 0;
    for (_, mm) in frame.valid_cells() {
        values[count] = mm;
        count += 1;
    }
    if count == 0 {
        return Summary::default();
    }
    let sorted = &mut values[..count];
    sorted.sort_unstable();

    let sum: u32 = sorted.iter().map(|&v| u32::from(v)).sum();
    let trim = count >> 3;
    let kept = &sorted[trim..count - trim];
    let kept_sum: u32 = kept.iter().map(|&v| u32::from(v)).sum();
    let spread = if count >= 4 {
        sorted[(count * 3) / 4] - sorted[count / 4]
    } else {
        sorted[count - 1] - sorted[0]
    };

    let mut center_sum = 0u32;
    let mut center_n = 0u32;
    for y in 2..GRID_SIDE - 2 {
        for x in 2..GRID_SIDE - 2 {
            if let Some(mm) = frame.at(x, y) {
                center_sum += u32::from(mm);
                center_n += 1;
            }
        }
    }

    Summary {
        count,
        mean: sum / count as u32,
        trimmed_mean: kept_sum / kept.len() as u32,
        nearest: Some(sorted[0]),
        spread,
        center: (center_n >= u32::from(config.center_min_samples) && center_n > 0).then(|| center_sum / center_n),
        roll: roll_curve(frame, config),
    }
}

/// Per-row second-nearest values, skipping the outer columns, reduced by median.
fn roll_curve(frame: &DepthFrame, config: &EstimatorConfig) -> Option<u16> {
    let mut rows = [0u16; GRID_SIDE];
    let mut row_count = 0;
    for y in 0..GRID_SIDE {
        let mut row = [0u16; GRID_SIDE];
        let mut n = 0;
        for x in 1..GRID_SIDE - 1 {
            if let Some(mm) = frame.get(cell_index(x, y)) {
                row[n] = mm;
                n += 1;
            }
        }
        if n < usize::from(config.roll_min_row_cells.max(2)) {
            continue;
        }
        let row = &mut row[..n];
        row.sort_unstable();
        rows[row_count] = if n <= 3 {
            #[allow(clippy::cast_possible_truncation)]
            let mean = ((u32::from(row[0]) + u32::from(row[1])) / 2) as u16;
            mean
        } else {
            row[1]
        };
        row_count += 1;
    }
    if row_count < usize::from(config.roll_min_rows.max(1)) {
        return None;
    }
    median(&mut rows[..row_count])
}

/// Stateful estimator.
#[derive(Debug, Clone)]
pub struct Estimator {
    config: EstimatorConfig,
    near_q8: i32,
    far_q8: i32,
    fused_q8: Option<i32>,
    fullness_q10: i32,
    last: Estimate,
}

impl Default for Estimator {
    fn default() -> Self {
        Self::new(EstimatorConfig::default())
    }
}

impl Estimator {
    /// Estimator with bounds taken from `config`.
    #[must_use]
    pub fn new(config: EstimatorConfig) -> Self {
        let mut estimator = Self {
            config,
            near_q8: i32::from(config.near_mm) << 8,
            far_q8: i32::from(config.far_mm) << 8,
            fused_q8: None,
            fullness_q10: 0,
            last: Estimate::default(),
        };
        estimator.clamp_bounds();
        estimator
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    /// Current `(near, far)` calibration bounds, mm.
    #[must_use]
    pub fn bounds(&self) -> (u16, u16) {
        (q8_to_mm(self.near_q8), q8_to_mm(self.far_q8))
    }

    /// Last produced estimate.
    #[must_use]
    pub fn estimate(&self) -> Estimate {
        self.last
    }

    /// Clears the fused state; calibration bounds are kept.
    pub fn reset(&mut self) {
        self.fused_q8 = None;
        self.fullness_q10 = 0;
        self.last = Estimate::default();
    }

    /// No usable signal, few cells at a high average, or the nearest sample
    /// beyond the empty trigger with the roll curve agreeing.
    fn is_hard_empty(&self, s: &Summary) -> bool {
        let cfg = &self.config;
        if s.count == 0 {
            return true;
        }
        if s.count < usize::from(cfg.empty_sparse_cells) && s.mean >= u32::from(cfg.empty_sparse_mean_mm) {
            return true;
        }
        let far_nearest = s.nearest.is_some_and(|mm| mm >= cfg.empty_trigger_mm);
        let roll_agrees = s.roll.map_or(true, |mm| mm >= cfg.empty_trigger_mm);
        far_nearest && roll_agrees
    }

    /// Very close nearest sample over a sparse grid that otherwise reads far.
    fn is_sparse_full(&self, s: &Summary) -> bool {
        let cfg = &self.config;
        s.nearest.is_some_and(|mm| mm <= cfg.sparse_full_nearest_mm)
            && s.count < usize::from(cfg.sparse_full_max_cells)
            && s.mean >= u32::from(cfg.sparse_full_mean_mm)
    }

    fn confidence(&self, s: &Summary, live: bool) -> i32 {
        let cfg = &self.config;
        if s.count == 0 {
            return 0;
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        let count_score = (s.count as i32 * ONE / (2 * i32::from(cfg.min_valid_cells.max(1)))).min(ONE);
        let good = i32::from(cfg.spread_good_mm);
        let bad = i32::from(cfg.spread_bad_mm).max(good + 1);
        let spread = i32::from(s.spread);
        let spread_score = if spread <= good {
            ONE
        } else if spread >= bad {
            0
        } else {
            (bad - spread) * ONE / (bad - good)
        };
        let confidence = (count_score + spread_score) / 2;
        if live {
            confidence
        } else {
            confidence / 2
        }
    }

    fn clamp_bounds(&mut self) {
        let cfg = &self.config;
        let (near_lo, near_hi) = cfg.near_range_mm;
        let (far_lo, far_hi) = cfg.far_range_mm;
        self.near_q8 = self.near_q8.clamp(i32::from(near_lo) << 8, i32::from(near_hi.max(near_lo)) << 8);
        self.far_q8 = self.far_q8.clamp(i32::from(far_lo) << 8, i32::from(far_hi.max(far_lo)) << 8);
        let gap = i32::from(cfg.min_bound_gap_mm) << 8;
        if self.far_q8 - self.near_q8 < gap {
            self.far_q8 = (self.near_q8 + gap).min(i32::from(far_hi.max(far_lo)) << 8);
            self.near_q8 = self.near_q8.min(self.far_q8 - gap);
        }
    }

    fn calibrate(&mut self, estimate_mm: i32) {
        let cfg = self.config;
        let target = estimate_mm << 8;
        let margin = i32::from(cfg.calibration_margin_mm) << 8;
        let shift = u32::from(cfg.calibration_rate_shift.min(15));
        if (target - self.near_q8).abs() <= margin {
            self.near_q8 += (target - self.near_q8) >> shift;
        }
        if (target - self.far_q8).abs() <= margin {
            self.far_q8 += (target - self.far_q8) >> shift;
        }
        self.clamp_bounds();
    }

    /// Runs one tick over a filtered grid.
    ///
    /// `live` is false when the reader produced nothing new this tick; the
    /// estimate then continues from the held grid at reduced confidence.
    pub fn update(&mut self, frame: &DepthFrame, live: bool) -> Estimate {
        let cfg = self.config;
        let s = summarize(frame, &cfg);
        let confidence = self.confidence(&s, live).clamp(0, ONE);
        let hard_empty = self.is_hard_empty(&s);
        let sparse_full = !hard_empty && self.is_sparse_full(&s);

        #[allow(clippy::cast_possible_wrap)]
        let primary = s.center.map_or(s.trimmed_mean as i32, |center| {
            let w = i32::from(cfg.center_weight_q10).min(ONE);
            (s.trimmed_mean as i32 * (ONE - w) + center as i32 * w) / ONE
        });
        let blended = match s.roll {
            Some(roll) if s.count > 0 => (3 * primary + 2 * i32::from(roll)) / 5,
            _ => primary,
        };

        let (target_q8, fullness_target) = if hard_empty {
            (self.far_q8, 0)
        } else if sparse_full {
            (self.near_q8, ONE)
        } else {
            if confidence >= i32::from(cfg.calibration_min_confidence_q10) {
                self.calibrate(blended);
            }
            (blended << 8, -1)
        };

        let high = confidence >= i32::from(cfg.high_confidence_q10);
        let fused = match self.fused_q8 {
            None => target_q8,
            Some(fused) => {
                let fast = (target_q8 - fused).abs() > i32::from(cfg.fast_delta_mm) << 8;
                approach(fused, target_q8, denominator(high, fast))
            }
        };
        self.fused_q8 = Some(fused);

        let (near, far) = self.bounds();
        let fused_mm = q8_to_mm(fused);
        let fullness_target = if fullness_target < 0 {
            i32::from(fullness_from_mm(fused_mm, near, far))
        } else {
            fullness_target
        };
        let fast = (fullness_target - self.fullness_q10).abs() > i32::from(cfg.fast_fullness_delta_q10);
        self.fullness_q10 = approach(self.fullness_q10, fullness_target, denominator(high, fast)).clamp(0, ONE);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let estimate = Estimate {
            mm: fused_mm,
            fullness_q10: self.fullness_q10 as u16,
            confidence_q10: confidence as u16,
            hard_empty,
            sparse_full,
            nearest_mm: s.nearest,
            valid_cells: s.count as u8,
            spread_mm: s.spread,
            roll_mm: s.roll,
        };
        if hard_empty != self.last.hard_empty || sparse_full != self.last.sparse_full {
            debug!(
                "Extreme flags changed: hard_empty={} sparse_full={} valid={}",
                hard_empty, sparse_full, estimate.valid_cells
            );
        }
        self.last = estimate;
        estimate
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn q8_to_mm(q8: i32) -> u16 {
    ((q8.max(0) + 128) >> 8).min(i32::from(u16::MAX)) as u16
}
