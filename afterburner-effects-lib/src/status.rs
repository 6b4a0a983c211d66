//! Status notifications published to the control channel.

use serde::Serialize;

use crate::calibration::CalibrationBounds;
use crate::settings::Mode;

/// Periodic throttle/mode report.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StatusReport {
    /// Rendered throttle, rounded to two decimals.
    pub thr: f32,
    pub mode: Mode,
    /// Whether a pulse was read this tick (always true in demo mode).
    pub signal: bool,
}

impl StatusReport {
    #[must_use]
    pub fn new(throttle: f32, mode: Mode, signal: bool) -> Self {
        Self {
            thr: (throttle * 100.0).round() / 100.0,
            mode,
            signal,
        }
    }
}

/// Live extrema and visit counts of an active calibration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationProgress {
    pub min: u32,
    pub max: u32,
    pub min_visits: u32,
    pub max_visits: u32,
}

/// How a calibration run or command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CalibrationResult {
    Complete,
    /// The run gave up; the bounds are whatever was committed before it.
    TimedOut,
    Reset,
}

/// Calibration state after completion, timeout or reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CalibrationStatus {
    pub calibrated: bool,
    pub min: u32,
    pub max: u32,
    /// Absent when the status is read rather than produced by a run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<CalibrationResult>,
}

impl CalibrationStatus {
    /// Status for the given committed bounds; reports the defaults when
    /// nothing sane is committed.
    #[must_use]
    pub fn from_committed(committed: Option<CalibrationBounds>) -> Self {
        let bounds = CalibrationBounds::effective(committed);
        Self {
            calibrated: committed.is_some_and(CalibrationBounds::is_sane),
            min: bounds.min_us,
            max: bounds.max_us,
            result: None,
        }
    }

    /// Tag the status with the outcome that produced it.
    #[must_use]
    pub const fn with_result(self, result: CalibrationResult) -> Self {
        Self {
            result: Some(result),
            ..self
        }
    }
}

/// Everything the core publishes, tagged with `"type"` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StatusMessage {
    Status(StatusReport),
    CalibrationProgress(CalibrationProgress),
    Calibration(CalibrationStatus),
}
