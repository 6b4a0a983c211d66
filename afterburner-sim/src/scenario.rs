//! Scripted throttle sticks for the simulator

use afterburner_effects_lib::PulseCapture;
use clap::ValueEnum;

const STICK_MIN_US: f32 = 900.0;
const STICK_MAX_US: f32 = 2000.0;
const RAMP_MS: u64 = 4000;
const HOLD_MS: u64 = 3000;
const CYCLE_MS: u64 = 2 * (RAMP_MS + HOLD_MS);

/// Time at each end of the stick while calibrating.
const FLICK_MS: u64 = 1200;
/// Each flick reaches this much further than the previous one.
const FLICK_OVERSHOOT_US: u32 = 60;
const FLICK_MAX_STEPS: u32 = 4;

const SIGNAL_LOSS_START_MS: u64 = 3000;
const SIGNAL_LOSS_END_MS: u64 = 4500;
const SIGNAL_LOSS_PULSE_US: u32 = 1600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Scenario {
    /// Ramp idle to full, hold, ramp back down, hold.
    Sweep,
    /// Start calibration and flick the stick between its ends.
    Calibrate,
    /// Steady throttle with a dropout in the middle.
    SignalLoss,
    /// No receiver, internal demo sweep.
    Demo,
}

/// Stick position as a function of virtual time.
#[derive(Debug, Clone)]
pub struct ScriptedStick {
    scenario: Scenario,
    now_ms: u64,
}

impl ScriptedStick {
    pub const fn new(scenario: Scenario) -> Self {
        Self { scenario, now_ms: 0 }
    }

    pub fn set_time(&mut self, now_ms: u64) {
        self.now_ms = now_ms;
    }

    pub fn pulse_at(&self, now_ms: u64) -> Option<u32> {
        match self.scenario {
            Scenario::Sweep => Some(sweep_pulse(now_ms)),
            Scenario::Calibrate => Some(flick_pulse(now_ms)),
            Scenario::SignalLoss => {
                if (SIGNAL_LOSS_START_MS..SIGNAL_LOSS_END_MS).contains(&now_ms) {
                    None
                } else {
                    Some(SIGNAL_LOSS_PULSE_US)
                }
            }
            Scenario::Demo => None,
        }
    }
}

impl PulseCapture for ScriptedStick {
    fn read_pulse_width_micros(&mut self, _timeout_us: u32) -> Option<u32> {
        self.pulse_at(self.now_ms)
    }
}

#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn sweep_pulse(now_ms: u64) -> u32 {
    let phase = now_ms % CYCLE_MS;
    let span = STICK_MAX_US - STICK_MIN_US;

    let pulse = if phase < RAMP_MS {
        STICK_MIN_US + span * (phase as f32 / RAMP_MS as f32)
    } else if phase < RAMP_MS + HOLD_MS {
        STICK_MAX_US
    } else if phase < 2 * RAMP_MS + HOLD_MS {
        let ramp_phase = phase - RAMP_MS - HOLD_MS;
        STICK_MAX_US - span * (ramp_phase as f32 / RAMP_MS as f32)
    } else {
        STICK_MIN_US
    };

    pulse.round() as u32
}

#[allow(clippy::cast_possible_truncation)]
fn flick_pulse(now_ms: u64) -> u32 {
    let cycle = now_ms / (2 * FLICK_MS);
    let step = (cycle as u32).min(FLICK_MAX_STEPS);
    if now_ms % (2 * FLICK_MS) < FLICK_MS {
        1100 - step * FLICK_OVERSHOOT_US
    } else {
        1900 + step * FLICK_OVERSHOOT_US
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sweep_shape() {
        let stick = ScriptedStick::new(Scenario::Sweep);
        assert_eq!(stick.pulse_at(0), Some(900));
        assert_eq!(stick.pulse_at(2000), Some(1450));
        assert_eq!(stick.pulse_at(5000), Some(2000));
        assert_eq!(stick.pulse_at(9000), Some(1450));
        assert_eq!(stick.pulse_at(12_000), Some(900));
        assert_eq!(stick.pulse_at(CYCLE_MS), Some(900));
    }

    #[test]
    fn test_flicks_reach_further_each_time() {
        let stick = ScriptedStick::new(Scenario::Calibrate);
        assert_eq!(stick.pulse_at(0), Some(1100));
        assert_eq!(stick.pulse_at(1200), Some(1900));
        assert_eq!(stick.pulse_at(2400), Some(1040));
        assert_eq!(stick.pulse_at(3600), Some(1960));
        // Overshoot stops growing after the fourth cycle
        assert_eq!(stick.pulse_at(60_000), Some(1100 - 4 * 60));
        assert_eq!(stick.pulse_at(61_200), Some(1900 + 4 * 60));
    }

    #[test]
    fn test_signal_loss_window() {
        let mut stick = ScriptedStick::new(Scenario::SignalLoss);
        stick.set_time(2990);
        assert_eq!(stick.read_pulse_width_micros(25_000), Some(1600));
        stick.set_time(3000);
        assert_eq!(stick.read_pulse_width_micros(25_000), None);
        stick.set_time(4500);
        assert_eq!(stick.read_pulse_width_micros(25_000), Some(1600));
    }
}
