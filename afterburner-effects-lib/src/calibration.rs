//! Throttle endpoint calibration.
//!
//! [`ThrottleCalibrator`] learns the physical stick's minimum and maximum
//! pulse widths from a live stream of samples. A run is started externally,
//! fed one sample per tick, and ends either [`CalibrationPhase::Complete`]
//! with a sane [`CalibrationBounds`] or [`CalibrationPhase::TimedOut`].
//!
//! With [`CalibrationPolicy::VisitConfirmed`] the stick has to approach each
//! extreme several times, each approach separated in time and in value from
//! the previous one, before the range is accepted. The simpler
//! [`CalibrationPolicy::FixedSamples`] accepts the range after a fixed number
//! of valid samples and restarts when that range is too narrow.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::status::CalibrationProgress;

/// Smallest pulse width accepted as a real reading.
pub const MIN_PWM_VALUE: u32 = 500;
/// Largest pulse width accepted as a real reading.
pub const MAX_PWM_VALUE: u32 = 2500;
pub const DEFAULT_THROTTLE_MIN: u32 = 900;
pub const DEFAULT_THROTTLE_MAX: u32 = 2000;
/// Minimum span between the endpoints for a calibration to be usable.
pub const MIN_RANGE: u32 = 500;
/// Pulse difference that separates two visits to the same extreme.
pub const STABILITY_THRESHOLD: u32 = 50;
/// Minimum time between two visits to the same extreme.
pub const TIME_BETWEEN_VISITS_MS: u64 = 1000;
pub const MIN_VISITS_REQUIRED: u32 = 3;
pub const MAX_VISITS_REQUIRED: u32 = 3;
pub const CALIBRATION_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_FIXED_SAMPLE_COUNT: u32 = 200;

/// Whether `pulse_us` lies inside the range a real receiver can produce.
#[must_use]
pub const fn is_valid_sample(pulse_us: u32) -> bool {
    pulse_us >= MIN_PWM_VALUE && pulse_us <= MAX_PWM_VALUE
}

/// Pulse widths corresponding to 0% and 100% throttle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibrationBounds {
    pub min_us: u32,
    pub max_us: u32,
}

impl Default for CalibrationBounds {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl CalibrationBounds {
    pub const DEFAULT: Self = Self {
        min_us: DEFAULT_THROTTLE_MIN,
        max_us: DEFAULT_THROTTLE_MAX,
    };

    #[must_use]
    pub const fn new(min_us: u32, max_us: u32) -> Self {
        Self { min_us, max_us }
    }

    /// Ordered, wider than [`MIN_RANGE`], and inside the valid pulse range.
    #[must_use]
    pub const fn is_sane(self) -> bool {
        self.min_us < self.max_us
            && self.max_us - self.min_us > MIN_RANGE
            && self.min_us >= MIN_PWM_VALUE
            && self.max_us <= MAX_PWM_VALUE
    }

    /// The committed bounds if they are sane, the defaults otherwise.
    #[must_use]
    pub fn effective(committed: Option<Self>) -> Self {
        committed.filter(|b| b.is_sane()).unwrap_or(Self::DEFAULT)
    }
}

/// How a calibration run decides it is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CalibrationPolicy {
    /// Repeated, debounced visits to both extremes.
    #[default]
    VisitConfirmed,
    /// Accept the observed range after `samples` valid samples.
    FixedSamples { samples: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CalibrationPhase {
    #[default]
    Idle,
    Calibrating,
    Complete(CalibrationBounds),
    TimedOut,
}

/// What a single [`ThrottleCalibrator::observe`] call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationEvent {
    /// Sample folded into the running extrema.
    Sampled,
    /// No sample, or one outside the valid pulse range.
    Discarded,
    /// The fixed-sample run ended with a degenerate range and began again.
    Restarted,
    Completed(CalibrationBounds),
    TimedOut,
}

/// Per-run state, reset every time calibration starts.
#[derive(Debug, Clone)]
struct CalibrationRun {
    started_ms: u64,
    observed_min: u32,
    observed_max: u32,
    min_visits: u32,
    max_visits: u32,
    last_min_value: u32,
    last_max_value: u32,
    last_min_time: Option<u64>,
    last_max_time: Option<u64>,
    samples: u32,
}

impl CalibrationRun {
    fn new(started_ms: u64) -> Self {
        Self {
            started_ms,
            observed_min: MAX_PWM_VALUE,
            observed_max: MIN_PWM_VALUE,
            min_visits: 0,
            max_visits: 0,
            last_min_value: MAX_PWM_VALUE,
            last_max_value: MIN_PWM_VALUE,
            last_min_time: None,
            last_max_time: None,
            samples: 0,
        }
    }

    const fn bounds(&self) -> CalibrationBounds {
        CalibrationBounds::new(self.observed_min, self.observed_max)
    }

    fn record(&mut self, pulse_us: u32, now_ms: u64) {
        self.samples += 1;
        self.observed_min = self.observed_min.min(pulse_us);
        self.observed_max = self.observed_max.max(pulse_us);

        if pulse_us <= self.observed_min + STABILITY_THRESHOLD
            && visit_gap_elapsed(self.last_min_time, now_ms)
            && pulse_us.abs_diff(self.last_min_value) > STABILITY_THRESHOLD
        {
            self.min_visits += 1;
            self.last_min_value = pulse_us;
            self.last_min_time = Some(now_ms);
            debug!("Calibration: min visit {} at {pulse_us}us", self.min_visits);
        }

        if pulse_us + STABILITY_THRESHOLD >= self.observed_max
            && visit_gap_elapsed(self.last_max_time, now_ms)
            && pulse_us.abs_diff(self.last_max_value) > STABILITY_THRESHOLD
        {
            self.max_visits += 1;
            self.last_max_value = pulse_us;
            self.last_max_time = Some(now_ms);
            debug!("Calibration: max visit {} at {pulse_us}us", self.max_visits);
        }
    }

    const fn visits_satisfied(&self) -> bool {
        self.min_visits >= MIN_VISITS_REQUIRED && self.max_visits >= MAX_VISITS_REQUIRED
    }

    fn progress(&self) -> CalibrationProgress {
        CalibrationProgress {
            min: self.observed_min,
            max: self.observed_max,
            min_visits: self.min_visits,
            max_visits: self.max_visits,
        }
    }
}

fn visit_gap_elapsed(last: Option<u64>, now_ms: u64) -> bool {
    last.map_or(true, |t| now_ms.saturating_sub(t) > TIME_BETWEEN_VISITS_MS)
}

/// Calibration state machine: `Idle -> Calibrating -> {Complete, TimedOut}`.
#[derive(Debug, Clone, Default)]
pub struct ThrottleCalibrator {
    policy: CalibrationPolicy,
    phase: CalibrationPhase,
    run: Option<CalibrationRun>,
}

impl ThrottleCalibrator {
    #[must_use]
    pub fn new(policy: CalibrationPolicy) -> Self {
        Self {
            policy,
            phase: CalibrationPhase::Idle,
            run: None,
        }
    }

    #[must_use]
    pub const fn phase(&self) -> CalibrationPhase {
        self.phase
    }

    #[must_use]
    pub const fn is_calibrating(&self) -> bool {
        matches!(self.phase, CalibrationPhase::Calibrating)
    }

    #[must_use]
    pub const fn policy(&self) -> CalibrationPolicy {
        self.policy
    }

    /// Begin a new run, discarding any run in progress.
    pub fn start(&mut self, now_ms: u64) {
        info!("Calibration started ({:?}): move the stick to both ends repeatedly", self.policy);
        self.run = Some(CalibrationRun::new(now_ms));
        self.phase = CalibrationPhase::Calibrating;
    }

    /// Abandon any run and return to `Idle`.
    pub fn reset(&mut self) {
        if self.is_calibrating() {
            info!("Calibration cancelled");
        }
        self.run = None;
        self.phase = CalibrationPhase::Idle;
    }

    /// Feed one tick's reading. Returns `None` when no run is active.
    pub fn observe(&mut self, sample: Option<u32>, now_ms: u64) -> Option<CalibrationEvent> {
        if !self.is_calibrating() {
            return None;
        }
        let run = self.run.as_mut()?;

        if now_ms.saturating_sub(run.started_ms) > CALIBRATION_TIMEOUT_MS {
            warn!(
                "Calibration did not complete within {CALIBRATION_TIMEOUT_MS}ms (min visits {}, max visits {})",
                run.min_visits, run.max_visits
            );
            self.phase = CalibrationPhase::TimedOut;
            self.run = None;
            return Some(CalibrationEvent::TimedOut);
        }

        let Some(pulse_us) = sample.filter(|&p| is_valid_sample(p)) else {
            return Some(CalibrationEvent::Discarded);
        };
        run.record(pulse_us, now_ms);

        let bounds = run.bounds();
        match self.policy {
            CalibrationPolicy::VisitConfirmed => {
                if run.visits_satisfied() && bounds.is_sane() {
                    return Some(self.complete(bounds));
                }
            }
            CalibrationPolicy::FixedSamples { samples } => {
                if run.samples >= samples {
                    if bounds.is_sane() {
                        return Some(self.complete(bounds));
                    }
                    warn!(
                        "Calibration range {}..{}us too narrow after {samples} samples, restarting",
                        bounds.min_us, bounds.max_us
                    );
                    // Keep the first deadline so a stuck stick still times out
                    *run = CalibrationRun::new(run.started_ms);
                    return Some(CalibrationEvent::Restarted);
                }
            }
        }
        Some(CalibrationEvent::Sampled)
    }

    fn complete(&mut self, bounds: CalibrationBounds) -> CalibrationEvent {
        info!("Calibration complete: {}..{}us", bounds.min_us, bounds.max_us);
        self.phase = CalibrationPhase::Complete(bounds);
        self.run = None;
        CalibrationEvent::Completed(bounds)
    }

    /// Running extrema and visit counts of the active run.
    #[must_use]
    pub fn progress(&self) -> Option<CalibrationProgress> {
        self.run.as_ref().map(CalibrationRun::progress)
    }
}
