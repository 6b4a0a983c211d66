//! Pulse width to normalized throttle.

use log::{info, warn};

use crate::calibration::CalibrationBounds;

pub const DEFAULT_SMOOTHING_ALPHA: f32 = 0.10;
/// Demo sweep advances by this much per step.
pub const DEMO_STEP: f32 = 0.02;
pub const DEMO_STEP_INTERVAL_MS: u64 = 50;

/// Map a pulse width onto `[0, 1]`.
///
/// Uses `calibration` when it is sane, [`CalibrationBounds::DEFAULT`]
/// otherwise. Inputs outside the bounds clamp to exactly 0.0 or 1.0.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn map_to_throttle(pulse_us: u32, calibration: Option<CalibrationBounds>) -> f32 {
    let bounds = CalibrationBounds::effective(calibration);
    let clamped = pulse_us.clamp(bounds.min_us, bounds.max_us);
    // Pulse widths are at most a few thousand, exact in f32
    let result = (clamped - bounds.min_us) as f32 / (bounds.max_us - bounds.min_us) as f32;
    result.clamp(0.0, 1.0)
}

#[derive(Debug, Clone, Copy)]
struct DemoSweep {
    direction: f32,
    last_step_ms: Option<u64>,
}

/// Smoothed throttle with signal-loss hold and an optional demo sweep.
#[derive(Debug, Clone)]
pub struct ThrottleMapper {
    alpha: f32,
    smoothed: f32,
    signal_valid: bool,
    last_signal_ms: Option<u64>,
    demo: Option<DemoSweep>,
}

impl Default for ThrottleMapper {
    fn default() -> Self {
        Self::new(DEFAULT_SMOOTHING_ALPHA)
    }
}

impl ThrottleMapper {
    /// Create a mapper with the given smoothing factor.
    ///
    /// `alpha` must lie in `(0, 1]`; anything else falls back to
    /// [`DEFAULT_SMOOTHING_ALPHA`].
    #[must_use]
    pub fn new(alpha: f32) -> Self {
        let alpha = if alpha > 0.0 && alpha <= 1.0 {
            alpha
        } else {
            warn!("Smoothing alpha {alpha} outside (0, 1], using {DEFAULT_SMOOTHING_ALPHA}");
            DEFAULT_SMOOTHING_ALPHA
        };
        Self {
            alpha,
            smoothed: 0.0,
            signal_valid: false,
            last_signal_ms: None,
            demo: None,
        }
    }

    #[must_use]
    pub const fn alpha(&self) -> f32 {
        self.alpha
    }

    #[must_use]
    pub const fn smoothed(&self) -> f32 {
        self.smoothed
    }

    /// Whether the last update saw a pulse (demo mode counts as valid).
    #[must_use]
    pub const fn signal_valid(&self) -> bool {
        self.signal_valid
    }

    #[must_use]
    pub const fn last_signal_ms(&self) -> Option<u64> {
        self.last_signal_ms
    }

    #[must_use]
    pub const fn is_demo(&self) -> bool {
        self.demo.is_some()
    }

    /// Switch the demo sweep on or off. Enabling restarts the sweep from zero.
    pub fn set_demo_mode(&mut self, enabled: bool) {
        if enabled == self.is_demo() {
            return;
        }
        if enabled {
            info!("Demo sweep enabled");
            self.smoothed = 0.0;
            self.demo = Some(DemoSweep {
                direction: 1.0,
                last_step_ms: None,
            });
        } else {
            info!("Demo sweep disabled");
            self.demo = None;
        }
    }

    /// Advance one tick and return the smoothed throttle.
    ///
    /// Without a pulse the previous value is held and the signal is marked
    /// invalid. In demo mode `pulse_us` is ignored.
    pub fn update(
        &mut self,
        pulse_us: Option<u32>,
        calibration: Option<CalibrationBounds>,
        now_ms: u64,
    ) -> f32 {
        if let Some(demo) = self.demo.as_mut() {
            let due = demo
                .last_step_ms
                .map_or(true, |t| now_ms.saturating_sub(t) > DEMO_STEP_INTERVAL_MS);
            if due {
                self.smoothed += demo.direction * DEMO_STEP;
                if self.smoothed >= 1.0 {
                    self.smoothed = 1.0;
                    demo.direction = -1.0;
                } else if self.smoothed <= 0.0 {
                    self.smoothed = 0.0;
                    demo.direction = 1.0;
                }
                demo.last_step_ms = Some(now_ms);
            }
            self.signal_valid = true;
            return self.smoothed;
        }

        match pulse_us.filter(|&p| p > 0) {
            Some(pulse_us) => {
                if !self.signal_valid {
                    info!("Throttle signal acquired ({pulse_us}us)");
                }
                self.signal_valid = true;
                self.last_signal_ms = Some(now_ms);
                let raw = map_to_throttle(pulse_us, calibration);
                self.smoothed += self.alpha * (raw - self.smoothed);
                self.smoothed = self.smoothed.clamp(0.0, 1.0);
            }
            None => {
                if self.signal_valid {
                    warn!("Throttle signal lost, holding {:.2}", self.smoothed);
                }
                self.signal_valid = false;
            }
        }
        self.smoothed
    }
}
