//! Throttle-to-light core for the Afterburner controller
//!
//! This library turns RC throttle pulses into animated afterburner lighting:
//! pulse capture, stick calibration, throttle smoothing and the layered
//! compositor. It is hardware-agnostic and can be tested without embedded
//! hardware; the firmware supplies the [`PulseCapture`], [`SettingsStore`]
//! and [`OutputSink`] implementations.

pub mod calibration;
pub mod compositor;
pub mod engine;
pub mod pulse;
pub mod settings;
pub mod status;
pub mod throttle;

pub use calibration::{
    CalibrationBounds, CalibrationEvent, CalibrationPhase, CalibrationPolicy, ThrottleCalibrator,
};
pub use compositor::{BaseFrame, Frame, LightCompositor, Topology};
pub use engine::{
    AfterburnerEngine, Command, EngineConfig, MemorySettingsStore, OutputSink, SettingsStore,
    TickOutcome,
};
pub use pulse::{PulseCapture, ReplayCapture, DEFAULT_PULSE_TIMEOUT_US};
pub use rgb::RGB8;
pub use settings::{Mode, SettingWrite, Settings, SettingsError, SettingsPatch};
pub use status::{CalibrationProgress, CalibrationResult, CalibrationStatus, StatusMessage, StatusReport};
pub use throttle::{map_to_throttle, ThrottleMapper};
