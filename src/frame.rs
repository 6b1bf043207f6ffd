//! Result frame decoding and per-zone object selection.
//!
//! A result frame is 132 bytes read from the config/result page. Byte 0
//! echoes the measure command, byte 4 carries the result number (sequence id
//! in the upper six bits, sub-capture index in the lower two). Object records
//! start at byte 24: 18 raw slots of 6 bytes, each holding two
//! `(confidence, distance_lsb, distance_msb)` objects. Raw slots 8 and 17 are
//! unused in 8×8 mode, leaving 16 zones.

use crate::grid::is_valid_mm;
use crate::register::Command;
use crate::zone_map::{ZoneMap, ZONES_PER_CAPTURE};

/// Size of one result frame.
pub const RESULT_FRAME_LEN: usize = 132;

/// Offset of the first object record.
pub const OBJECT_OFFSET: usize = 24;

/// Bytes per raw object slot (two objects).
pub const OBJECT_SLOT_LEN: usize = 6;

/// Raw object slots per frame.
pub const RAW_SLOTS: usize = 18;

/// Raw slots that carry no zone in 8×8 mode.
pub const UNUSED_SLOTS: [usize; 2] = [8, 17];

const RESULT_NUMBER_OFFSET: usize = 4;

/// Steady-state frame decode failure. The frame is dropped, never fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DataError {
    /// Fewer than [`RESULT_FRAME_LEN`] bytes.
    Truncated(usize),
    /// Leading byte is not the measure command echo.
    UnexpectedEcho(u8),
}

impl core::fmt::Display for DataError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// How to pick one distance from a zone's two object returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ObjectPolicy {
    /// Nearer of the valid objects.
    Nearest,
    /// First object, second only when the first is invalid.
    PreferFirst,
    /// First object only; the second is ignored even when the first is invalid.
    ///
    /// Either object still counts as a saturated close return.
    #[default]
    FirstOnly,
}

/// Linear close-range correction: `raw * scale_q10 / 1024 + offset_mm`, rounded
/// and clamped, applied only to raw values in `1..=cutoff_mm`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CloseRangeCalibration {
    /// Gain, 1024 = unity.
    pub scale_q10: i32,
    /// Offset added after scaling, in millimetres.
    pub offset_mm: i32,
    /// Raw distances above this are passed through untouched.
    pub cutoff_mm: u16,
}

impl Default for CloseRangeCalibration {
    fn default() -> Self {
        Self {
            scale_q10: 1024,
            offset_mm: 0,
            cutoff_mm: 120,
        }
    }
}

impl CloseRangeCalibration {
    /// Applies the correction to a raw distance.
    #[must_use]
    pub fn apply(&self, raw_mm: u16) -> u16 {
        if raw_mm == 0 || raw_mm > self.cutoff_mm {
            return raw_mm;
        }
        let corrected = (i32::from(raw_mm) * self.scale_q10 + 512) / 1024 + self.offset_mm;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let corrected = corrected.clamp(0, i32::from(u16::MAX)) as u16;
        corrected
    }
}

/// Frame decoding and merge parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FrameConfig {
    /// Close-range correction.
    pub calibration: CloseRangeCalibration,
    /// Distance reported for a zero-distance, non-zero-confidence return.
    pub too_close_mm: u16,
    /// Missed captures a zone keeps its last value for before it is cleared.
    pub hold_frames: u8,
    /// Objects below this confidence are ignored.
    pub min_confidence: u8,
    /// Object selection.
    pub policy: ObjectPolicy,
    /// Sub-capture to grid mapping.
    pub zone_map: ZoneMap,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            calibration: CloseRangeCalibration::default(),
            too_close_mm: 20,
            hold_frames: 10,
            min_confidence: 0,
            policy: ObjectPolicy::default(),
            zone_map: ZoneMap::default(),
        }
    }
}

/// One object return as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ObjectRecord {
    /// Confidence byte.
    pub confidence: u8,
    /// Distance bytes in wire order.
    pub distance: [u8; 2],
}

impl ObjectRecord {
    fn raw_le(&self) -> u16 {
        u16::from_le_bytes(self.distance)
    }
}

/// A decoded result frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ResultFrame {
    /// Sub-capture index, `0..4`.
    pub capture: u8,
    /// Device sequence id grouping four sub-captures.
    pub sequence: u8,
    /// Two objects per zone, in zone order.
    pub zones: [[ObjectRecord; 2]; ZONES_PER_CAPTURE],
}

/// Parses a raw result frame.
///
/// # Errors
///
/// * `Err(DataError::Truncated)` - `raw` is shorter than [`RESULT_FRAME_LEN`]
/// * `Err(DataError::UnexpectedEcho)` - byte 0 is not the measure command
pub fn decode(raw: &[u8]) -> Result<ResultFrame, DataError> {
    if raw.len() < RESULT_FRAME_LEN {
        return Err(DataError::Truncated(raw.len()));
    }
    if raw[0] != u8::from(Command::Measure) {
        return Err(DataError::UnexpectedEcho(raw[0]));
    }
    let result_number = raw[RESULT_NUMBER_OFFSET];
    let mut zones = [[ObjectRecord::default(); 2]; ZONES_PER_CAPTURE];
    let slots = (0..RAW_SLOTS).filter(|slot| !UNUSED_SLOTS.contains(slot));
    for (zone, slot) in zones.iter_mut().zip(slots) {
        let off = OBJECT_OFFSET + slot * OBJECT_SLOT_LEN;
        let rec = &raw[off..off + OBJECT_SLOT_LEN];
        zone[0] = ObjectRecord {
            confidence: rec[0],
            distance: [rec[1], rec[2]],
        };
        zone[1] = ObjectRecord {
            confidence: rec[3],
            distance: [rec[4], rec[5]],
        };
    }
    Ok(ResultFrame {
        capture: result_number & 0x03,
        sequence: result_number >> 2,
        zones,
    })
}

/// Decodes a distance word, little-endian first.
///
/// Each byte order is calibrated and accepted only if it lands in
/// `1..=11999`; little-endian wins when both do. `None` when neither does.
#[must_use]
pub fn decode_distance(bytes: [u8; 2], calibration: &CloseRangeCalibration) -> Option<u16> {
    let le = calibration.apply(u16::from_le_bytes(bytes));
    if is_valid_mm(le) {
        return Some(le);
    }
    let be = calibration.apply(u16::from_be_bytes(bytes));
    is_valid_mm(be).then_some(be)
}

/// What a zone contributes to the grid this capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ZoneSample {
    /// A usable distance, mm.
    Distance(u16),
    /// A target too close to range; stands in at the configured minimum.
    TooClose,
    /// Nothing usable.
    Invalid,
}

impl ZoneSample {
    /// Distance written into the grid, if any.
    #[must_use]
    pub fn mm(self, config: &FrameConfig) -> Option<u16> {
        match self {
            ZoneSample::Distance(mm) => Some(mm),
            ZoneSample::TooClose => Some(config.too_close_mm),
            ZoneSample::Invalid => None,
        }
    }
}

/// Applies the object policy to one zone.
#[must_use]
pub fn select(objects: &[ObjectRecord; 2], config: &FrameConfig) -> ZoneSample {
    let considered: &[ObjectRecord] = match config.policy {
        ObjectPolicy::FirstOnly => &objects[..1],
        ObjectPolicy::Nearest | ObjectPolicy::PreferFirst => &objects[..],
    };
    let usable = |obj: &ObjectRecord| {
        if obj.confidence < config.min_confidence {
            return None;
        }
        decode_distance(obj.distance, &config.calibration)
    };

    let chosen = match config.policy {
        ObjectPolicy::Nearest => considered.iter().filter_map(usable).min(),
        ObjectPolicy::PreferFirst | ObjectPolicy::FirstOnly => considered.iter().find_map(usable),
    };
    if let Some(mm) = chosen {
        return ZoneSample::Distance(mm);
    }

    // Saturated close returns read as 0 mm with non-zero confidence, on either object.
    if objects.iter().any(|obj| obj.raw_le() == 0 && obj.confidence > 0) {
        ZoneSample::TooClose
    } else {
        ZoneSample::Invalid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(confidence: u8, mm: u16) -> ObjectRecord {
        ObjectRecord {
            confidence,
            distance: mm.to_le_bytes(),
        }
    }

    fn config(policy: ObjectPolicy) -> FrameConfig {
        FrameConfig {
            policy,
            ..FrameConfig::default()
        }
    }

    #[test]
    fn little_endian_preferred_big_endian_fallback() {
        let cal = CloseRangeCalibration::default();
        assert_eq!(decode_distance([0xE8, 0x03], &cal), Some(1000));
        // LE 0xFF10 is out of range, BE 0x10FF = 4351 is not
        assert_eq!(decode_distance([0x10, 0xFF], &cal), Some(4351));
        assert_eq!(decode_distance([0xFF, 0xFF], &cal), None);
        assert_eq!(decode_distance([0x00, 0x00], &cal), None);
    }

    #[test]
    fn close_range_calibration_only_below_cutoff() {
        let cal = CloseRangeCalibration {
            scale_q10: 1126,
            offset_mm: -5,
            cutoff_mm: 120,
        };
        // 100 * 1126 / 1024 = 109.96 -> 110, minus 5
        assert_eq!(cal.apply(100), 105);
        assert_eq!(cal.apply(121), 121);
        assert_eq!(cal.apply(0), 0);
        let negative = CloseRangeCalibration {
            offset_mm: -500,
            ..cal
        };
        assert_eq!(negative.apply(50), 0);
    }

    #[test]
    fn nearest_policy_takes_closer_object() {
        let zone = [obj(40, 900), obj(30, 600)];
        assert_eq!(select(&zone, &config(ObjectPolicy::Nearest)), ZoneSample::Distance(600));
        assert_eq!(select(&zone, &config(ObjectPolicy::PreferFirst)), ZoneSample::Distance(900));
        assert_eq!(select(&zone, &config(ObjectPolicy::FirstOnly)), ZoneSample::Distance(900));
    }

    #[test]
    fn second_object_used_only_by_fallback_policies() {
        let zone = [ObjectRecord::default(), obj(30, 700)];
        assert_eq!(select(&zone, &config(ObjectPolicy::Nearest)), ZoneSample::Distance(700));
        assert_eq!(select(&zone, &config(ObjectPolicy::PreferFirst)), ZoneSample::Distance(700));
        assert_eq!(select(&zone, &config(ObjectPolicy::FirstOnly)), ZoneSample::Invalid);
    }

    #[test]
    fn zero_distance_with_confidence_is_too_close() {
        let zone = [obj(12, 0), ObjectRecord::default()];
        let cfg = FrameConfig::default();
        assert_eq!(select(&zone, &cfg), ZoneSample::TooClose);
        assert_eq!(ZoneSample::TooClose.mm(&cfg), Some(20));
        assert_eq!(select(&[ObjectRecord::default(); 2], &cfg), ZoneSample::Invalid);
    }

    #[test]
    fn saturated_second_object_is_too_close_under_every_policy() {
        let zone = [ObjectRecord::default(), obj(9, 0)];
        for policy in [ObjectPolicy::FirstOnly, ObjectPolicy::PreferFirst, ObjectPolicy::Nearest] {
            assert_eq!(select(&zone, &config(policy)), ZoneSample::TooClose, "{policy:?}");
        }
        let usable_first = [obj(40, 850), obj(9, 0)];
        assert_eq!(select(&usable_first, &config(ObjectPolicy::FirstOnly)), ZoneSample::Distance(850));
    }

    #[test]
    fn low_confidence_objects_are_skipped() {
        let cfg = FrameConfig {
            min_confidence: 20,
            policy: ObjectPolicy::PreferFirst,
            ..FrameConfig::default()
        };
        assert_eq!(select(&[obj(10, 800), obj(25, 950)], &cfg), ZoneSample::Distance(950));
    }

    #[test]
    fn decode_skips_unused_slots_and_splits_result_number() {
        let mut raw = [0u8; RESULT_FRAME_LEN];
        raw[0] = 0x10;
        raw[4] = (9 << 2) | 2;
        let mut zone = 0u16;
        for slot in 0..RAW_SLOTS {
            let off = OBJECT_OFFSET + slot * OBJECT_SLOT_LEN;
            let mm = if UNUSED_SLOTS.contains(&slot) {
                9999
            } else {
                zone += 1;
                zone * 10
            };
            raw[off] = 50;
            raw[off + 1..off + 3].copy_from_slice(&mm.to_le_bytes());
        }

        let frame = decode(&raw).unwrap();
        assert_eq!(frame.capture, 2);
        assert_eq!(frame.sequence, 9);
        for (i, zone) in frame.zones.iter().enumerate() {
            assert_eq!(zone[0].raw_le(), (i as u16 + 1) * 10);
        }
    }

    #[test]
    fn malformed_frames_are_rejected() {
        assert_eq!(decode(&[0x10; 40]), Err(DataError::Truncated(40)));
        let mut raw = [0u8; RESULT_FRAME_LEN];
        raw[0] = 0x11;
        assert_eq!(decode(&raw), Err(DataError::UnexpectedEcho(0x11)));
    }
}
