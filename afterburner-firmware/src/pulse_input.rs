//! RC throttle pulse timing on a GPIO
//!
//! Measures the high time of the receiver's PWM signal by polling the pin
//! against the microsecond system timer. Every read is bounded by the
//! caller's timeout so a disconnected receiver never stalls the render loop.

use afterburner_effects_lib::PulseCapture;
use anyhow::Result;
use esp_idf_hal::gpio::{AnyIOPin, Input, PinDriver, Pull};
use esp_idf_svc::sys::esp_timer_get_time;
use log::info;

/// Microseconds since boot
fn now_us() -> i64 {
    // SAFETY: esp_timer_get_time only reads the system timer
    unsafe { esp_timer_get_time() }
}

pub struct GpioPulseCapture {
    pin: PinDriver<'static, AnyIOPin, Input>,
}

impl GpioPulseCapture {
    pub fn new(gpio: u8) -> Result<Self> {
        // SAFETY: We trust the user-configured GPIO pin number is valid for this board
        let pin = unsafe { AnyIOPin::new(i32::from(gpio)) };
        let mut pin = PinDriver::input(pin)?;
        // Hold the line low when the receiver is unplugged
        pin.set_pull(Pull::Down)?;
        info!("Throttle input on GPIO {gpio}");
        Ok(Self { pin })
    }

    /// Spin until the pin reaches `high`, or give up at `deadline`.
    fn wait_for_level(&self, high: bool, deadline: i64) -> Option<i64> {
        loop {
            let now = now_us();
            if self.pin.is_high() == high {
                return Some(now);
            }
            if now >= deadline {
                return None;
            }
        }
    }
}

impl PulseCapture for GpioPulseCapture {
    fn read_pulse_width_micros(&mut self, timeout_us: u32) -> Option<u32> {
        let deadline = now_us() + i64::from(timeout_us);

        // A pulse already in progress has an unknown start, skip it
        self.wait_for_level(false, deadline)?;
        let rise = self.wait_for_level(true, deadline)?;
        let fall = self.wait_for_level(false, deadline)?;

        u32::try_from(fall - rise).ok().filter(|&width| width > 0)
    }
}
