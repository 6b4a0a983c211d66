//! Pulse-width input seam.

/// Upper bound for a single pulse read (25 ms covers one 50 Hz RC frame).
pub const DEFAULT_PULSE_TIMEOUT_US: u32 = 25_000;

/// Source of PWM throttle pulse widths.
///
/// Implementations block for at most `timeout_us` and return `None` when no
/// complete high pulse was observed in that window. `None` means signal
/// loss, never zero throttle.
pub trait PulseCapture {
    fn read_pulse_width_micros(&mut self, timeout_us: u32) -> Option<u32>;
}

impl<P: PulseCapture + ?Sized> PulseCapture for &mut P {
    fn read_pulse_width_micros(&mut self, timeout_us: u32) -> Option<u32> {
        (**self).read_pulse_width_micros(timeout_us)
    }
}

/// Capture that replays a fixed sequence of readings, then reports signal loss.
#[derive(Debug, Clone, Default)]
pub struct ReplayCapture {
    readings: std::collections::VecDeque<Option<u32>>,
}

impl ReplayCapture {
    pub fn new(readings: impl IntoIterator<Item = Option<u32>>) -> Self {
        Self {
            readings: readings.into_iter().collect(),
        }
    }

    pub fn push(&mut self, reading: Option<u32>) {
        self.readings.push_back(reading);
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.readings.len()
    }
}

impl PulseCapture for ReplayCapture {
    fn read_pulse_width_micros(&mut self, _timeout_us: u32) -> Option<u32> {
        // A zero-width reading is the same as no pulse
        self.readings.pop_front().flatten().filter(|&p| p > 0)
    }
}
