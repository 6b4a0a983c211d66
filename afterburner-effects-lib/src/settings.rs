//! User-editable lighting settings.
//!
//! [`Settings`] can only hold values inside their documented ranges: every
//! write goes through [`Settings::apply`] or [`Settings::apply_patch`], and
//! deserialization runs the same checks. A rejected write leaves the record
//! untouched.

use std::ops::RangeInclusive;

use derive_more::{Display, Error};
use rgb::RGB8;
use serde::{Deserialize, Serialize};

pub const SPEED_MS_RANGE: RangeInclusive<u16> = 100..=5000;
pub const BRIGHTNESS_RANGE: RangeInclusive<u8> = 10..=255;
pub const NUM_LEDS_RANGE: RangeInclusive<u16> = 1..=300;
pub const AB_THRESHOLD_RANGE: RangeInclusive<u8> = 0..=100;

/// Errors produced when a settings write is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
pub enum SettingsError {
    #[display("{field}={value} is outside {min}..={max}")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },
    #[display("unknown mode {value}")]
    UnknownMode { value: u8 },
}

fn check_range<T>(field: &'static str, value: T, range: &RangeInclusive<T>) -> Result<T, SettingsError>
where
    T: PartialOrd + Copy + Into<u32>,
{
    if range.contains(&value) {
        Ok(value)
    } else {
        Err(SettingsError::OutOfRange {
            field,
            value: value.into(),
            min: (*range.start()).into(),
            max: (*range.end()).into(),
        })
    }
}

/// Throttle response curve and modulation style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Mode {
    /// No easing, no breathing.
    Linear = 0,
    /// Eased throttle with breathing.
    #[default]
    Ease = 1,
    /// Eased throttle with breathing and a pulsing afterburner.
    Pulse = 2,
}

impl Mode {
    /// Whether the throttle goes through the power curve and breathing applies.
    #[must_use]
    pub const fn is_eased(self) -> bool {
        !matches!(self, Self::Linear)
    }
}

impl TryFrom<u8> for Mode {
    type Error = SettingsError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Linear),
            1 => Ok(Self::Ease),
            2 => Ok(Self::Pulse),
            value => Err(SettingsError::UnknownMode { value }),
        }
    }
}

impl From<Mode> for u8 {
    fn from(mode: Mode) -> Self {
        mode as Self
    }
}

/// Lighting settings in the control-channel wire format (camelCase keys,
/// colors as `[r, g, b]` arrays, mode as an integer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "RawSettings")]
pub struct Settings {
    mode: Mode,
    #[serde(with = "color_array")]
    start_color: RGB8,
    #[serde(with = "color_array")]
    end_color: RGB8,
    speed_ms: u16,
    brightness: u8,
    num_leds: u16,
    ab_threshold: u8,
}

const fn default_mode() -> u8 {
    Mode::Ease as u8
}

const fn default_start_color() -> RGB8 {
    RGB8::new(255, 100, 0)
}

const fn default_end_color() -> RGB8 {
    RGB8::new(154, 0, 255)
}

const fn default_speed_ms() -> u16 {
    1200
}

const fn default_brightness() -> u8 {
    200
}

const fn default_num_leds() -> u16 {
    45
}

const fn default_ab_threshold() -> u8 {
    80
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            start_color: default_start_color(),
            end_color: default_end_color(),
            speed_ms: default_speed_ms(),
            brightness: default_brightness(),
            num_leds: default_num_leds(),
            ab_threshold: default_ab_threshold(),
        }
    }
}

impl Settings {
    #[must_use]
    pub const fn mode(&self) -> Mode {
        self.mode
    }

    #[must_use]
    pub const fn start_color(&self) -> RGB8 {
        self.start_color
    }

    #[must_use]
    pub const fn end_color(&self) -> RGB8 {
        self.end_color
    }

    #[must_use]
    pub const fn speed_ms(&self) -> u16 {
        self.speed_ms
    }

    #[must_use]
    pub const fn brightness(&self) -> u8 {
        self.brightness
    }

    /// Pixels per ring (ignored by channel topologies).
    #[must_use]
    pub const fn num_leds(&self) -> u16 {
        self.num_leds
    }

    /// Afterburner threshold in percent.
    #[must_use]
    pub const fn ab_threshold(&self) -> u8 {
        self.ab_threshold
    }

    /// Animation frequency in Hz (`1000 / speedMs`).
    #[must_use]
    pub fn frequency_hz(&self) -> f32 {
        1000.0 / f32::from(self.speed_ms)
    }

    /// Apply a single field write, rejecting out-of-range values.
    ///
    /// # Errors
    /// Returns [`SettingsError`] and leaves `self` unchanged if the value is
    /// outside the field's valid range.
    pub fn apply(&mut self, write: SettingWrite) -> Result<(), SettingsError> {
        match write {
            SettingWrite::Mode(value) => self.mode = Mode::try_from(value)?,
            SettingWrite::StartColor(color) => self.start_color = color,
            SettingWrite::EndColor(color) => self.end_color = color,
            SettingWrite::SpeedMs(value) => {
                self.speed_ms = check_range("speedMs", value, &SPEED_MS_RANGE)?;
            }
            SettingWrite::Brightness(value) => {
                self.brightness = check_range("brightness", value, &BRIGHTNESS_RANGE)?;
            }
            SettingWrite::NumLeds(value) => {
                self.num_leds = check_range("numLeds", value, &NUM_LEDS_RANGE)?;
            }
            SettingWrite::AbThreshold(value) => {
                self.ab_threshold = check_range("abThreshold", value, &AB_THRESHOLD_RANGE)?;
            }
        }
        Ok(())
    }

    /// Apply every field present in `patch`, all or nothing.
    ///
    /// Returns whether any value actually changed.
    ///
    /// # Errors
    /// Returns the first [`SettingsError`] encountered; in that case no field
    /// of `self` is modified.
    pub fn apply_patch(&mut self, patch: &SettingsPatch) -> Result<bool, SettingsError> {
        let mut next = *self;
        for write in patch.writes() {
            next.apply(write)?;
        }
        let changed = next != *self;
        *self = next;
        Ok(changed)
    }
}

/// A single-field settings write, one variant per wireless attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingWrite {
    Mode(u8),
    StartColor(RGB8),
    EndColor(RGB8),
    SpeedMs(u16),
    Brightness(u8),
    NumLeds(u16),
    AbThreshold(u8),
}

/// Partial settings update as received from the control channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_color: Option<[u8; 3]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_color: Option<[u8; 3]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed_ms: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brightness: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_leds: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ab_threshold: Option<u8>,
}

impl SettingsPatch {
    /// The writes this patch carries, in field order.
    pub fn writes(&self) -> impl Iterator<Item = SettingWrite> + '_ {
        let to_rgb = |[r, g, b]: [u8; 3]| RGB8::new(r, g, b);
        [
            self.mode.map(SettingWrite::Mode),
            self.start_color.map(to_rgb).map(SettingWrite::StartColor),
            self.end_color.map(to_rgb).map(SettingWrite::EndColor),
            self.speed_ms.map(SettingWrite::SpeedMs),
            self.brightness.map(SettingWrite::Brightness),
            self.num_leds.map(SettingWrite::NumLeds),
            self.ab_threshold.map(SettingWrite::AbThreshold),
        ]
        .into_iter()
        .flatten()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.writes().next().is_none()
    }
}

/// Deserialization shape for [`Settings`]; missing keys take defaults and the
/// result is validated through [`Settings::apply`].
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSettings {
    #[serde(default = "default_mode")]
    mode: u8,
    #[serde(default = "default_start_color", with = "color_array")]
    start_color: RGB8,
    #[serde(default = "default_end_color", with = "color_array")]
    end_color: RGB8,
    #[serde(default = "default_speed_ms")]
    speed_ms: u16,
    #[serde(default = "default_brightness")]
    brightness: u8,
    #[serde(default = "default_num_leds")]
    num_leds: u16,
    #[serde(default = "default_ab_threshold")]
    ab_threshold: u8,
}

impl TryFrom<RawSettings> for Settings {
    type Error = SettingsError;

    fn try_from(raw: RawSettings) -> Result<Self, Self::Error> {
        let mut settings = Self::default();
        settings.apply_patch(&SettingsPatch {
            mode: Some(raw.mode),
            start_color: Some([raw.start_color.r, raw.start_color.g, raw.start_color.b]),
            end_color: Some([raw.end_color.r, raw.end_color.g, raw.end_color.b]),
            speed_ms: Some(raw.speed_ms),
            brightness: Some(raw.brightness),
            num_leds: Some(raw.num_leds),
            ab_threshold: Some(raw.ab_threshold),
        })?;
        Ok(settings)
    }
}

mod color_array {
    use rgb::RGB8;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(color: &RGB8, serializer: S) -> Result<S::Ok, S::Error> {
        [color.r, color.g, color.b].serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<RGB8, D::Error> {
        let [r, g, b] = <[u8; 3]>::deserialize(deserializer)?;
        Ok(RGB8::new(r, g, b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.mode(), Mode::Ease);
        assert_eq!(s.start_color(), RGB8::new(255, 100, 0));
        assert_eq!(s.end_color(), RGB8::new(154, 0, 255));
        assert_eq!(s.speed_ms(), 1200);
        assert_eq!(s.brightness(), 200);
        assert_eq!(s.num_leds(), 45);
        assert_eq!(s.ab_threshold(), 80);
    }

    #[test]
    fn test_brightness_below_minimum_rejected() {
        let mut s = Settings::default();
        s.apply(SettingWrite::Brightness(120)).unwrap();

        let err = s.apply(SettingWrite::Brightness(5)).unwrap_err();
        assert_eq!(
            err,
            SettingsError::OutOfRange {
                field: "brightness",
                value: 5,
                min: 10,
                max: 255
            }
        );
        // Previous value kept
        assert_eq!(s.brightness(), 120);
    }

    #[test]
    fn test_brightness_in_range_accepted() {
        let mut s = Settings::default();
        s.apply(SettingWrite::Brightness(10)).unwrap();
        s.apply(SettingWrite::Brightness(200)).unwrap();
        assert_eq!(s.brightness(), 200);
    }

    #[test]
    fn test_range_edges() {
        let mut s = Settings::default();
        assert!(s.apply(SettingWrite::SpeedMs(99)).is_err());
        assert!(s.apply(SettingWrite::SpeedMs(100)).is_ok());
        assert!(s.apply(SettingWrite::SpeedMs(5000)).is_ok());
        assert!(s.apply(SettingWrite::SpeedMs(5001)).is_err());
        assert_eq!(s.speed_ms(), 5000);

        assert!(s.apply(SettingWrite::NumLeds(0)).is_err());
        assert!(s.apply(SettingWrite::NumLeds(301)).is_err());
        assert!(s.apply(SettingWrite::NumLeds(300)).is_ok());

        assert!(s.apply(SettingWrite::AbThreshold(101)).is_err());
        assert!(s.apply(SettingWrite::AbThreshold(0)).is_ok());
        assert_eq!(s.ab_threshold(), 0);
    }

    #[test]
    fn test_unknown_mode_rejected() {
        let mut s = Settings::default();
        assert_eq!(
            s.apply(SettingWrite::Mode(3)),
            Err(SettingsError::UnknownMode { value: 3 })
        );
        assert_eq!(s.mode(), Mode::Ease);
        s.apply(SettingWrite::Mode(2)).unwrap();
        assert_eq!(s.mode(), Mode::Pulse);
    }

    #[test]
    fn test_patch_is_all_or_nothing() {
        let mut s = Settings::default();
        let patch = SettingsPatch {
            mode: Some(0),
            brightness: Some(100),
            speed_ms: Some(20), // invalid
            ..SettingsPatch::default()
        };
        assert!(s.apply_patch(&patch).is_err());
        // Valid fields of the rejected patch must not leak through
        assert_eq!(s, Settings::default());
    }

    #[test]
    fn test_patch_reports_change() {
        let mut s = Settings::default();
        let same = SettingsPatch {
            brightness: Some(200),
            ..SettingsPatch::default()
        };
        assert!(!s.apply_patch(&same).unwrap());

        let different = SettingsPatch {
            start_color: Some([1, 2, 3]),
            ..SettingsPatch::default()
        };
        assert!(s.apply_patch(&different).unwrap());
        assert_eq!(s.start_color(), RGB8::new(1, 2, 3));
    }

    #[test]
    fn test_empty_patch() {
        assert!(SettingsPatch::default().is_empty());
        let patch: SettingsPatch = serde_json::from_str(r#"{"numLeds":12}"#).unwrap();
        assert!(!patch.is_empty());
        assert_eq!(patch.writes().collect::<Vec<_>>(), vec![SettingWrite::NumLeds(12)]);
    }

    #[test]
    fn test_wire_format() {
        let json = serde_json::to_value(Settings::default()).unwrap();
        assert_eq!(json["mode"], 1);
        assert_eq!(json["startColor"], serde_json::json!([255, 100, 0]));
        assert_eq!(json["endColor"], serde_json::json!([154, 0, 255]));
        assert_eq!(json["speedMs"], 1200);
        assert_eq!(json["abThreshold"], 80);
        assert_eq!(json["numLeds"], 45);
    }

    #[test]
    fn test_deserialize_fills_defaults() {
        let s: Settings = serde_json::from_str(r#"{"mode":2,"brightness":64}"#).unwrap();
        assert_eq!(s.mode(), Mode::Pulse);
        assert_eq!(s.brightness(), 64);
        assert_eq!(s.speed_ms(), 1200);
        assert_eq!(s.end_color(), RGB8::new(154, 0, 255));
    }

    #[test]
    fn test_deserialize_rejects_out_of_range() {
        assert!(serde_json::from_str::<Settings>(r#"{"brightness":5}"#).is_err());
        assert!(serde_json::from_str::<Settings>(r#"{"mode":7}"#).is_err());
        assert!(serde_json::from_str::<Settings>(r#"{"startColor":[1,2]}"#).is_err());
    }

    #[test]
    fn test_frequency() {
        let mut s = Settings::default();
        s.apply(SettingWrite::SpeedMs(500)).unwrap();
        assert!((s.frequency_hz() - 2.0).abs() < 1e-6);
    }
}
