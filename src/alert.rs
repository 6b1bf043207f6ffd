//! Discrete alert level with hysteresis, consensus and popup arming.

use crate::estimator::Estimate;

/// Number of fullness segments; fullness maps onto `0..=SEGMENTS`.
pub const SEGMENTS: u8 = 8;

/// Committed alert level, from full to empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AlertLevel {
    /// Roll present and plentiful.
    #[default]
    Full,
    /// Roll partly used.
    Medium,
    /// Roll nearly used up.
    Low,
    /// No roll left.
    Empty,
}

impl AlertLevel {
    /// Low and Empty are warning levels.
    #[must_use]
    pub fn is_warning(self) -> bool {
        matches!(self, AlertLevel::Low | AlertLevel::Empty)
    }
}

/// Hysteresis bands and debounce for [`AlertMachine`].
///
/// Thresholds are fullness segments in `0..=8`. Each level is left downward at
/// a lower segment than the one it is re-entered from below.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AlertConfig {
    /// Consecutive agreeing observations needed to commit a change.
    pub consensus_frames: u8,
    /// Segment at or above which any lower level returns to Full.
    pub full_enter_segment: u8,
    /// Full drops to Medium at or below this segment.
    pub full_exit_segment: u8,
    /// Full or Medium drop to Low at or below this segment.
    pub low_enter_segment: u8,
    /// Low recovers to Medium at or above this segment.
    pub low_exit_segment: u8,
    /// Segment at or below which Empty may be entered, together with `empty_enter_mm`.
    pub empty_enter_segment: u8,
    /// Distance at or beyond which Empty may be entered, together with `empty_enter_segment`, mm.
    pub empty_enter_mm: u16,
    /// Empty recovers to Low at or above this segment.
    pub empty_exit_segment: u8,
    /// A nearest sample at or below this distance counts toward the near-field streak, mm.
    pub near_field_mm: u16,
    /// Consecutive near-field observations that commit Full immediately.
    pub near_field_streak: u8,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            consensus_frames: 4,
            full_enter_segment: 7,
            full_exit_segment: 5,
            low_enter_segment: 3,
            low_exit_segment: 5,
            empty_enter_segment: 0,
            empty_enter_mm: 1800,
            empty_exit_segment: 2,
            near_field_mm: 80,
            near_field_streak: 3,
        }
    }
}

/// One input to the alert machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Observation {
    /// Fullness segment, `0..=8`.
    pub segment: u8,
    /// Fused distance, mm.
    pub mm: u16,
    /// Estimator reported no usable signal.
    pub hard_empty: bool,
    /// Nearest valid sample, mm.
    pub nearest_mm: Option<u16>,
}

impl Observation {
    /// Observation derived from an estimator output.
    #[must_use]
    pub fn from_estimate(estimate: &Estimate) -> Self {
        Self {
            segment: segment(estimate.fullness_q10),
            mm: estimate.mm,
            hard_empty: estimate.hard_empty,
            nearest_mm: estimate.nearest_mm,
        }
    }
}

/// Rounded fullness segment for a Q10 fullness.
#[must_use]
pub fn segment(fullness_q10: u16) -> u8 {
    let scaled = (u32::from(fullness_q10.min(1024)) * u32::from(SEGMENTS) + 512) / 1024;
    #[allow(clippy::cast_possible_truncation)]
    let segment = scaled as u8;
    segment
}

/// What the application should show after an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AlertStatus {
    /// Committed level.
    pub level: AlertLevel,
    /// A warning popup is armed and not yet dismissed.
    pub popup_should_show: bool,
}

/// Alert level state machine.
#[derive(Debug, Clone)]
pub struct AlertMachine {
    config: AlertConfig,
    level: AlertLevel,
    pending: Option<AlertLevel>,
    agree: u8,
    near_streak: u8,
    popup_active: bool,
    rearm_required: bool,
}

impl Default for AlertMachine {
    fn default() -> Self {
        Self::new(AlertConfig::default())
    }
}

impl AlertMachine {
    /// Starts at [`AlertLevel::Full`] with no popup armed.
    #[must_use]
    pub fn new(config: AlertConfig) -> Self {
        Self {
            config,
            level: AlertLevel::Full,
            pending: None,
            agree: 0,
            near_streak: 0,
            popup_active: false,
            rearm_required: false,
        }
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &AlertConfig {
        &self.config
    }

    /// Committed level and popup state.
    #[must_use]
    pub fn status(&self) -> AlertStatus {
        AlertStatus {
            level: self.level,
            popup_should_show: self.popup_active,
        }
    }

    /// Hides an active popup without rearming it.
    pub fn dismiss_popup(&mut self) {
        self.popup_active = false;
    }

    fn empty_condition(&self, obs: &Observation) -> bool {
        obs.hard_empty || (obs.segment <= self.config.empty_enter_segment && obs.mm >= self.config.empty_enter_mm)
    }

    /// Level the observation points at, given the committed level.
    fn classify(&self, obs: &Observation) -> AlertLevel {
        let cfg = &self.config;
        let seg = obs.segment;
        match self.level {
            AlertLevel::Full => {
                if self.empty_condition(obs) {
                    AlertLevel::Empty
                } else if seg <= cfg.low_enter_segment {
                    AlertLevel::Low
                } else if seg <= cfg.full_exit_segment {
                    AlertLevel::Medium
                } else {
                    AlertLevel::Full
                }
            }
            AlertLevel::Medium => {
                if self.empty_condition(obs) {
                    AlertLevel::Empty
                } else if seg >= cfg.full_enter_segment {
                    AlertLevel::Full
                } else if seg <= cfg.low_enter_segment {
                    AlertLevel::Low
                } else {
                    AlertLevel::Medium
                }
            }
            AlertLevel::Low => {
                if self.empty_condition(obs) {
                    AlertLevel::Empty
                } else if seg >= cfg.full_enter_segment {
                    AlertLevel::Full
                } else if seg >= cfg.low_exit_segment {
                    AlertLevel::Medium
                } else {
                    AlertLevel::Low
                }
            }
            AlertLevel::Empty => {
                if seg >= cfg.full_enter_segment {
                    AlertLevel::Full
                } else if seg >= cfg.low_exit_segment {
                    AlertLevel::Medium
                } else if seg >= cfg.empty_exit_segment && !obs.hard_empty {
                    AlertLevel::Low
                } else {
                    AlertLevel::Empty
                }
            }
        }
    }

    fn commit(&mut self, level: AlertLevel) {
        if level == self.level {
            return;
        }
        info!("Alert level {:?} -> {:?}", self.level, level);
        self.level = level;
        self.pending = None;
        self.agree = 0;
        if level == AlertLevel::Full {
            self.popup_active = false;
            self.rearm_required = false;
        } else if level.is_warning() && !self.rearm_required {
            self.popup_active = true;
            self.rearm_required = true;
        }
    }

    /// Feeds one observation and returns the resulting status.
    pub fn observe(&mut self, obs: &Observation) -> AlertStatus {
        let near_field = obs.nearest_mm.is_some_and(|mm| mm <= self.config.near_field_mm);
        self.near_streak = if near_field { self.near_streak.saturating_add(1) } else { 0 };
        if self.level != AlertLevel::Full && self.near_streak >= self.config.near_field_streak.max(1) {
            debug!("Near-field streak {}, roll replaced", self.near_streak);
            self.commit(AlertLevel::Full);
            return self.status();
        }

        let candidate = self.classify(obs);
        if candidate == self.level {
            self.pending = None;
            self.agree = 0;
            return self.status();
        }

        if self.pending == Some(candidate) {
            self.agree = self.agree.saturating_add(1);
        } else {
            self.pending = Some(candidate);
            self.agree = 1;
        }

        if (candidate == AlertLevel::Empty && obs.hard_empty) || self.agree >= self.config.consensus_frames {
            self.commit(candidate);
        }
        self.status()
    }

    /// Feeds an estimator output.
    pub fn update(&mut self, estimate: &Estimate) -> AlertStatus {
        self.observe(&Observation::from_estimate(estimate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(segment: u8, mm: u16) -> Observation {
        Observation {
            segment,
            mm,
            hard_empty: false,
            nearest_mm: Some(mm),
        }
    }

    #[test]
    fn segments_round_to_nearest() {
        assert_eq!(segment(0), 0);
        assert_eq!(segment(63), 0);
        assert_eq!(segment(64), 1);
        assert_eq!(segment(1024), 8);
        assert_eq!(segment(u16::MAX), 8);
    }

    #[test]
    fn full_then_low_settles_without_empty() {
        let mut alert = AlertMachine::default();
        for _ in 0..40 {
            alert.observe(&obs(8, 300));
        }
        assert_eq!(alert.status().level, AlertLevel::Full);
        for _ in 0..40 {
            alert.observe(&obs(1, 2000));
        }
        let status = alert.status();
        assert_eq!(status.level, AlertLevel::Low);
        assert!(status.popup_should_show);
    }

    #[test]
    fn single_dip_does_not_change_level() {
        let mut alert = AlertMachine::default();
        for _ in 0..10 {
            alert.observe(&obs(8, 300));
        }
        alert.observe(&obs(0, 1000));
        for _ in 0..10 {
            assert_eq!(alert.observe(&obs(8, 300)).level, AlertLevel::Full);
        }
    }

    #[test]
    fn change_needs_consensus() {
        let mut alert = AlertMachine::default();
        for i in 1..4 {
            assert_eq!(alert.observe(&obs(4, 900)).level, AlertLevel::Full, "tick {i}");
        }
        assert_eq!(alert.observe(&obs(4, 900)).level, AlertLevel::Medium);
        assert!(!alert.status().popup_should_show);
    }

    #[test]
    fn hysteresis_holds_medium_between_bands() {
        let mut alert = AlertMachine::default();
        for _ in 0..4 {
            alert.observe(&obs(5, 900));
        }
        assert_eq!(alert.status().level, AlertLevel::Medium);
        for _ in 0..20 {
            alert.observe(&obs(6, 800));
        }
        assert_eq!(alert.status().level, AlertLevel::Medium);
    }

    #[test]
    fn hard_empty_bypasses_consensus() {
        let mut alert = AlertMachine::default();
        let status = alert.observe(&Observation {
            segment: 0,
            mm: 2200,
            hard_empty: true,
            nearest_mm: None,
        });
        assert_eq!(status.level, AlertLevel::Empty);
        assert!(status.popup_should_show);
    }

    #[test]
    fn popup_rearms_only_after_full() {
        let mut alert = AlertMachine::default();
        for _ in 0..4 {
            alert.observe(&obs(2, 1500));
        }
        assert!(alert.status().popup_should_show);
        alert.dismiss_popup();
        assert!(!alert.status().popup_should_show);

        for _ in 0..4 {
            alert.observe(&obs(5, 900));
        }
        assert_eq!(alert.status().level, AlertLevel::Medium);
        for _ in 0..4 {
            alert.observe(&obs(2, 1500));
        }
        assert_eq!(alert.status().level, AlertLevel::Low);
        assert!(!alert.status().popup_should_show);

        for _ in 0..4 {
            alert.observe(&obs(8, 300));
        }
        assert_eq!(alert.status().level, AlertLevel::Full);
        for _ in 0..4 {
            alert.observe(&obs(2, 1500));
        }
        assert!(alert.status().popup_should_show);
    }

    #[test]
    fn near_field_streak_restores_full() {
        let mut alert = AlertMachine::default();
        for _ in 0..4 {
            alert.observe(&obs(2, 1500));
        }
        assert_eq!(alert.status().level, AlertLevel::Low);
        let close = Observation {
            segment: 2,
            mm: 1500,
            hard_empty: false,
            nearest_mm: Some(50),
        };
        alert.observe(&close);
        alert.observe(&close);
        let status = alert.observe(&close);
        assert_eq!(status.level, AlertLevel::Full);
        assert!(!status.popup_should_show);
    }
}
