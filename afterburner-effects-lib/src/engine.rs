//! Per-tick pipeline tying pulse input, calibration, mapping and rendering.
//!
//! The engine owns no hardware. Each [`AfterburnerEngine::tick`] borrows a
//! [`PulseCapture`], a [`SettingsStore`] and an [`OutputSink`]; the firmware
//! passes real peripherals and tests pass in-memory ones.

use std::convert::Infallible;
use std::fmt::Display;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::calibration::{
    CalibrationBounds, CalibrationEvent, CalibrationPolicy, ThrottleCalibrator,
};
use crate::compositor::{Frame, LightCompositor, Topology};
use crate::pulse::{PulseCapture, DEFAULT_PULSE_TIMEOUT_US};
use crate::settings::Settings;
use crate::status::{CalibrationResult, CalibrationStatus, StatusMessage, StatusReport};
use crate::throttle::{ThrottleMapper, DEFAULT_SMOOTHING_ALPHA};

/// Minimum interval between two status reports.
pub const STATUS_INTERVAL_MS: u64 = 200;
/// Minimum interval between two calibration progress reports.
pub const PROGRESS_INTERVAL_MS: u64 = 1000;

/// Persistent settings and committed calibration.
pub trait SettingsStore {
    type Error: Display;

    /// Current settings snapshot.
    fn settings(&self) -> Settings;

    /// Committed calibration, if any.
    fn calibration_bounds(&self) -> Option<CalibrationBounds>;

    fn is_calibrated(&self) -> bool {
        self.calibration_bounds().is_some_and(CalibrationBounds::is_sane)
    }

    /// Persist a completed calibration.
    ///
    /// # Errors
    /// Returns the store's error if the bounds could not be persisted.
    fn commit_calibration(&mut self, bounds: CalibrationBounds) -> Result<(), Self::Error>;

    /// Forget the committed calibration.
    ///
    /// # Errors
    /// Returns the store's error if the change could not be persisted.
    fn reset_calibration(&mut self) -> Result<(), Self::Error>;
}

/// Destination for finished frames.
pub trait OutputSink {
    type Error: Display;

    /// Push one frame to the outputs.
    ///
    /// # Errors
    /// Returns the sink's error if the hardware write failed.
    fn apply(&mut self, frame: &Frame) -> Result<(), Self::Error>;
}

impl<S: OutputSink + ?Sized> OutputSink for &mut S {
    type Error = S::Error;

    fn apply(&mut self, frame: &Frame) -> Result<(), Self::Error> {
        (**self).apply(frame)
    }
}

/// Store that keeps everything in RAM.
#[derive(Debug, Clone, Default)]
pub struct MemorySettingsStore {
    pub settings: Settings,
    pub calibration: Option<CalibrationBounds>,
}

impl SettingsStore for MemorySettingsStore {
    type Error = Infallible;

    fn settings(&self) -> Settings {
        self.settings
    }

    fn calibration_bounds(&self) -> Option<CalibrationBounds> {
        self.calibration
    }

    fn commit_calibration(&mut self, bounds: CalibrationBounds) -> Result<(), Self::Error> {
        self.calibration = Some(bounds);
        Ok(())
    }

    fn reset_calibration(&mut self) -> Result<(), Self::Error> {
        self.calibration = None;
        Ok(())
    }
}

/// Tuning that is fixed for the lifetime of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub smoothing_alpha: f32,
    pub pulse_timeout_us: u32,
    pub calibration_policy: CalibrationPolicy,
    pub topology: Topology,
    /// Seed for the sparkle generator.
    pub rng_seed: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            smoothing_alpha: DEFAULT_SMOOTHING_ALPHA,
            pulse_timeout_us: DEFAULT_PULSE_TIMEOUT_US,
            calibration_policy: CalibrationPolicy::default(),
            topology: Topology::default(),
            rng_seed: 0x0af7_e4b0,
        }
    }
}

/// Requests from the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    StartCalibration,
    ResetCalibration,
    SetDemoMode(bool),
}

/// Result of one tick.
#[derive(Debug, Clone, PartialEq)]
pub struct TickOutcome {
    /// Smoothed throttle that was rendered.
    pub throttle: f32,
    pub signal_valid: bool,
    pub frame: Frame,
    /// Notifications due this tick, in order.
    pub messages: Vec<StatusMessage>,
}

/// Single-owner throttle-to-light pipeline.
#[derive(Debug)]
pub struct AfterburnerEngine {
    config: EngineConfig,
    calibrator: ThrottleCalibrator,
    mapper: ThrottleMapper,
    compositor: LightCompositor,
    last_status_ms: Option<u64>,
    last_progress_ms: Option<u64>,
}

impl AfterburnerEngine {
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            calibrator: ThrottleCalibrator::new(config.calibration_policy),
            mapper: ThrottleMapper::new(config.smoothing_alpha),
            compositor: LightCompositor::new(config.topology, config.rng_seed),
            last_status_ms: None,
            last_progress_ms: None,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub const fn calibrator(&self) -> &ThrottleCalibrator {
        &self.calibrator
    }

    #[must_use]
    pub const fn mapper(&self) -> &ThrottleMapper {
        &self.mapper
    }

    #[must_use]
    pub const fn topology(&self) -> Topology {
        self.compositor.topology()
    }

    /// Apply a control-channel command. Returns a notification when the
    /// command changes what clients should display.
    pub fn handle_command<S: SettingsStore>(
        &mut self,
        command: Command,
        store: &mut S,
        now_ms: u64,
    ) -> Option<StatusMessage> {
        match command {
            Command::StartCalibration => {
                self.calibrator.start(now_ms);
                self.last_progress_ms = None;
                None
            }
            Command::ResetCalibration => {
                self.calibrator.reset();
                if let Err(e) = store.reset_calibration() {
                    warn!("Failed to clear calibration: {e}");
                }
                Some(StatusMessage::Calibration(
                    CalibrationStatus::from_committed(store.calibration_bounds())
                        .with_result(CalibrationResult::Reset),
                ))
            }
            Command::SetDemoMode(enabled) => {
                self.mapper.set_demo_mode(enabled);
                None
            }
        }
    }

    /// Run one iteration: read, calibrate, map, render, output, report.
    pub fn tick<P, S, O>(&mut self, pulse: &mut P, store: &mut S, sink: &mut O, now_ms: u64) -> TickOutcome
    where
        P: PulseCapture + ?Sized,
        S: SettingsStore,
        O: OutputSink + ?Sized,
    {
        let settings = store.settings();
        let mut messages = Vec::new();

        let reading = if self.mapper.is_demo() {
            None
        } else {
            pulse.read_pulse_width_micros(self.config.pulse_timeout_us)
        };

        if self.calibrator.is_calibrating() {
            self.observe_calibration(reading, store, now_ms, &mut messages);
        }

        let throttle = self.mapper.update(reading, store.calibration_bounds(), now_ms);
        let signal_valid = self.mapper.signal_valid();

        let frame = self.compositor.render(&settings, throttle, now_ms);
        if let Err(e) = sink.apply(&frame) {
            warn!("Failed to update outputs: {e}");
        }

        if due(self.last_status_ms, now_ms, STATUS_INTERVAL_MS) {
            self.last_status_ms = Some(now_ms);
            messages.push(StatusMessage::Status(StatusReport::new(
                throttle,
                settings.mode(),
                signal_valid,
            )));
        }

        TickOutcome {
            throttle,
            signal_valid,
            frame,
            messages,
        }
    }

    fn observe_calibration<S: SettingsStore>(
        &mut self,
        reading: Option<u32>,
        store: &mut S,
        now_ms: u64,
        messages: &mut Vec<StatusMessage>,
    ) {
        match self.calibrator.observe(reading, now_ms) {
            Some(CalibrationEvent::Completed(bounds)) => {
                if let Err(e) = store.commit_calibration(bounds) {
                    warn!("Failed to persist calibration: {e}");
                }
                messages.push(StatusMessage::Calibration(
                    CalibrationStatus::from_committed(Some(bounds)).with_result(CalibrationResult::Complete),
                ));
            }
            Some(CalibrationEvent::TimedOut) => {
                messages.push(StatusMessage::Calibration(
                    CalibrationStatus::from_committed(store.calibration_bounds())
                        .with_result(CalibrationResult::TimedOut),
                ));
            }
            Some(CalibrationEvent::Restarted) => {
                debug!("Calibration run restarted");
            }
            Some(CalibrationEvent::Sampled | CalibrationEvent::Discarded) | None => {}
        }

        if due(self.last_progress_ms, now_ms, PROGRESS_INTERVAL_MS) {
            if let Some(progress) = self.calibrator.progress() {
                self.last_progress_ms = Some(now_ms);
                messages.push(StatusMessage::CalibrationProgress(progress));
            }
        }
    }
}

#[inline]
fn due(last_ms: Option<u64>, now_ms: u64, interval_ms: u64) -> bool {
    last_ms.map_or(true, |t| now_ms.saturating_sub(t) >= interval_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::CalibrationPhase;
    use crate::pulse::ReplayCapture;
    use crate::settings::{Mode, SettingWrite};

    #[derive(Default)]
    struct RecordingSink {
        frames: Vec<Frame>,
    }

    impl OutputSink for RecordingSink {
        type Error = Infallible;

        fn apply(&mut self, frame: &Frame) -> Result<(), Self::Error> {
            self.frames.push(frame.clone());
            Ok(())
        }
    }

    struct FailingSink;

    impl OutputSink for FailingSink {
        type Error = &'static str;

        fn apply(&mut self, _frame: &Frame) -> Result<(), Self::Error> {
            Err("bus error")
        }
    }

    /// Always returns the same reading.
    struct Steady(Option<u32>);

    impl PulseCapture for Steady {
        fn read_pulse_width_micros(&mut self, _timeout_us: u32) -> Option<u32> {
            self.0
        }
    }

    fn status_count(messages: &[StatusMessage]) -> usize {
        messages
            .iter()
            .filter(|m| matches!(m, StatusMessage::Status(_)))
            .count()
    }

    #[test]
    fn test_tick_renders_and_reports() {
        let mut engine = AfterburnerEngine::new(EngineConfig {
            smoothing_alpha: 1.0,
            ..EngineConfig::default()
        });
        let mut store = MemorySettingsStore::default();
        let mut sink = RecordingSink::default();

        let outcome = engine.tick(&mut Steady(Some(1450)), &mut store, &mut sink, 0);
        assert!((outcome.throttle - 0.5).abs() < 1e-6);
        assert!(outcome.signal_valid);
        assert_eq!(sink.frames.len(), 1);
        assert_eq!(sink.frames[0], outcome.frame);
        assert_eq!(outcome.frame.len(), 4);
        assert_eq!(
            outcome.messages,
            vec![StatusMessage::Status(StatusReport::new(0.5, Mode::Ease, true))]
        );
    }

    #[test]
    fn test_status_rate_limited() {
        let mut engine = AfterburnerEngine::new(EngineConfig::default());
        let mut store = MemorySettingsStore::default();
        let mut sink = RecordingSink::default();
        let mut pulse = Steady(Some(1500));

        let mut reports = 0;
        for tick in 0..100u64 {
            let outcome = engine.tick(&mut pulse, &mut store, &mut sink, tick * 10);
            reports += status_count(&outcome.messages);
        }
        // 0, 200, ... 800 over one second of 10ms ticks
        assert_eq!(reports, 5);
        assert_eq!(sink.frames.len(), 100);
    }

    #[test]
    fn test_signal_loss_reported() {
        let mut engine = AfterburnerEngine::new(EngineConfig {
            smoothing_alpha: 1.0,
            ..EngineConfig::default()
        });
        let mut store = MemorySettingsStore::default();
        let mut sink = RecordingSink::default();
        let mut pulse = ReplayCapture::new([Some(2000)]);

        engine.tick(&mut pulse, &mut store, &mut sink, 0);
        let outcome = engine.tick(&mut pulse, &mut store, &mut sink, 300);
        assert!(!outcome.signal_valid);
        assert_eq!(outcome.throttle, 1.0);
        assert_eq!(
            outcome.messages,
            vec![StatusMessage::Status(StatusReport::new(1.0, Mode::Ease, false))]
        );
    }

    #[test]
    fn test_calibration_commits_to_store() {
        let mut engine = AfterburnerEngine::new(EngineConfig::default());
        let mut store = MemorySettingsStore::default();
        let mut sink = RecordingSink::default();
        assert!(!store.is_calibrated());

        assert_eq!(engine.handle_command(Command::StartCalibration, &mut store, 0), None);
        assert!(engine.calibrator().is_calibrating());

        let mut pulse = ReplayCapture::default();
        let mut samples = Vec::new();
        let mut t = 0;
        for i in 0..5u32 {
            samples.push((1000 - i * 60, t));
            t += 600;
            samples.push((1900 + i * 60, t));
            t += 600;
        }

        let mut saw_progress = false;
        let mut committed = None;
        for (p, now) in samples {
            pulse.push(Some(p));
            let outcome = engine.tick(&mut pulse, &mut store, &mut sink, now);
            for m in outcome.messages {
                match m {
                    StatusMessage::CalibrationProgress(_) => saw_progress = true,
                    StatusMessage::Calibration(status) => committed = Some(status),
                    StatusMessage::Status(_) => {}
                }
            }
            if committed.is_some() {
                break;
            }
        }

        assert!(saw_progress);
        let status = committed.unwrap();
        assert!(status.calibrated);
        assert_eq!(status.result, Some(CalibrationResult::Complete));
        assert_eq!(store.calibration_bounds(), Some(CalibrationBounds::new(status.min, status.max)));
        assert!(store.is_calibrated());
        assert!(matches!(engine.calibrator().phase(), CalibrationPhase::Complete(_)));
    }

    #[test]
    fn test_calibration_timeout_keeps_previous_bounds() {
        let previous = CalibrationBounds::new(1000, 1900);
        let mut store = MemorySettingsStore {
            calibration: Some(previous),
            ..MemorySettingsStore::default()
        };
        let mut engine = AfterburnerEngine::new(EngineConfig::default());
        let mut sink = RecordingSink::default();
        engine.handle_command(Command::StartCalibration, &mut store, 1000);

        let mut pulse = Steady(None);
        let mut result = None;
        for tick in 0..400u64 {
            let outcome = engine.tick(&mut pulse, &mut store, &mut sink, 1000 + tick * 100);
            if let Some(StatusMessage::Calibration(status)) = outcome
                .messages
                .into_iter()
                .find(|m| matches!(m, StatusMessage::Calibration(_)))
            {
                result = Some(status);
                break;
            }
        }

        assert_eq!(
            result,
            Some(CalibrationStatus {
                calibrated: true,
                min: 1000,
                max: 1900,
                result: Some(CalibrationResult::TimedOut),
            })
        );
        assert_eq!(engine.calibrator().phase(), CalibrationPhase::TimedOut);
        assert_eq!(store.calibration_bounds(), Some(previous));
    }

    #[test]
    fn test_reset_command_clears_store() {
        let mut store = MemorySettingsStore {
            calibration: Some(CalibrationBounds::new(1000, 1900)),
            ..MemorySettingsStore::default()
        };
        let mut engine = AfterburnerEngine::new(EngineConfig::default());
        engine.handle_command(Command::StartCalibration, &mut store, 0);

        let message = engine.handle_command(Command::ResetCalibration, &mut store, 10);
        assert_eq!(
            message,
            Some(StatusMessage::Calibration(CalibrationStatus {
                calibrated: false,
                min: 900,
                max: 2000,
                result: Some(CalibrationResult::Reset),
            }))
        );
        assert_eq!(store.calibration_bounds(), None);
        assert_eq!(engine.calibrator().phase(), CalibrationPhase::Idle);
    }

    #[test]
    fn test_demo_mode_skips_pulse_input() {
        let mut engine = AfterburnerEngine::new(EngineConfig::default());
        let mut store = MemorySettingsStore::default();
        let mut sink = RecordingSink::default();
        engine.handle_command(Command::SetDemoMode(true), &mut store, 0);

        let mut pulse = ReplayCapture::new([Some(2000), Some(2000)]);
        let outcome = engine.tick(&mut pulse, &mut store, &mut sink, 100);
        assert!(outcome.signal_valid);
        assert!((outcome.throttle - 0.02).abs() < 1e-6);
        assert_eq!(pulse.remaining(), 2);
    }

    #[test]
    fn test_settings_snapshot_used_per_tick() {
        let mut engine = AfterburnerEngine::new(EngineConfig {
            topology: Topology::Rings { rings: 1 },
            ..EngineConfig::default()
        });
        let mut store = MemorySettingsStore::default();
        let mut sink = RecordingSink::default();
        let mut pulse = Steady(Some(1500));

        assert_eq!(engine.tick(&mut pulse, &mut store, &mut sink, 0).frame.len(), 45);
        store.settings.apply(SettingWrite::NumLeds(12)).unwrap();
        assert_eq!(engine.tick(&mut pulse, &mut store, &mut sink, 10).frame.len(), 12);
    }

    #[test]
    fn test_sink_errors_do_not_stop_ticking() {
        let mut engine = AfterburnerEngine::new(EngineConfig::default());
        let mut store = MemorySettingsStore::default();
        let mut pulse = Steady(Some(1500));
        let outcome = engine.tick(&mut pulse, &mut store, &mut FailingSink, 0);
        assert!(outcome.signal_valid);
        assert_eq!(status_count(&outcome.messages), 1);
    }

    #[test]
    fn test_config_json_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{"smoothingAlpha":0.25}"#).unwrap();
        assert_eq!(config.smoothing_alpha, 0.25);
        assert_eq!(config.pulse_timeout_us, DEFAULT_PULSE_TIMEOUT_US);
        assert_eq!(config.topology, Topology::Channels { count: 4 });
    }
}
