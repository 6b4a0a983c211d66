//! Light output drivers
//!
//! Both drivers take finished [`Frame`]s from the engine. Brightness is
//! already applied by the compositor, so the ring driver only adds gamma.

use afterburner_effects_lib::{Frame, OutputSink, RGB8};
use anyhow::{anyhow, Result};
use esp_idf_hal::gpio::{AnyOutputPin, OutputPin};
use esp_idf_hal::ledc::config::TimerConfig;
use esp_idf_hal::ledc::{LedcChannel, LedcDriver, LedcTimer, LedcTimerDriver, Resolution};
use esp_idf_hal::peripheral::Peripheral;
use esp_idf_hal::prelude::*;
use esp_idf_hal::rmt::config::TransmitConfig;
use esp_idf_hal::rmt::{RmtChannel, TxRmtDriver};
use log::{debug, info, warn};
use smart_leds::{gamma, SmartLedsWrite};
use std::thread::sleep;
use std::time::Duration;
use ws2812_esp32_rmt_driver::Ws2812Esp32Rmt;

const PWM_FREQUENCY_HZ: u32 = 5_000;

/// Boot indicator: three short amber blinks
const BOOT_BLINK_COLOR: RGB8 = RGB8::new(255, 100, 0);
const BOOT_BLINK_LEVEL: u8 = 128;
const BOOT_BLINK_DURATION: Duration = Duration::from_millis(250);

/// Discrete PWM channels driven by LEDC at 8-bit resolution.
pub struct ChannelOutput {
    channels: Vec<LedcDriver<'static>>,
    max_duty: u32,
}

impl ChannelOutput {
    /// Bring up one LEDC timer and up to four channels on `gpios`.
    pub fn new<T, C0, C1, C2, C3>(
        timer: impl Peripheral<P = T> + 'static,
        channels: (
            impl Peripheral<P = C0> + 'static,
            impl Peripheral<P = C1> + 'static,
            impl Peripheral<P = C2> + 'static,
            impl Peripheral<P = C3> + 'static,
        ),
        gpios: &[u8],
    ) -> Result<Self>
    where
        T: LedcTimer + 'static,
        C0: LedcChannel<SpeedMode = T::SpeedMode>,
        C1: LedcChannel<SpeedMode = T::SpeedMode>,
        C2: LedcChannel<SpeedMode = T::SpeedMode>,
        C3: LedcChannel<SpeedMode = T::SpeedMode>,
    {
        let timer_config = TimerConfig::new()
            .frequency(PWM_FREQUENCY_HZ.Hz())
            .resolution(Resolution::Bits8);
        let timer = LedcTimerDriver::new(timer, &timer_config)?;

        // SAFETY: We trust the user-configured GPIO pin numbers are valid for this board
        let pin = |i: usize| -> Result<AnyOutputPin> {
            let gpio = gpios
                .get(i)
                .ok_or_else(|| anyhow!("no GPIO configured for PWM channel {i}"))?;
            Ok(unsafe { AnyOutputPin::new(i32::from(*gpio)) })
        };

        let mut drivers = Vec::with_capacity(gpios.len());
        drivers.push(LedcDriver::new(channels.0, &timer, pin(0)?)?);
        if gpios.len() > 1 {
            drivers.push(LedcDriver::new(channels.1, &timer, pin(1)?)?);
        }
        if gpios.len() > 2 {
            drivers.push(LedcDriver::new(channels.2, &timer, pin(2)?)?);
        }
        if gpios.len() > 3 {
            drivers.push(LedcDriver::new(channels.3, &timer, pin(3)?)?);
        }
        // The timer has to keep running for as long as the channels exist
        std::mem::forget(timer);

        let max_duty = drivers.first().map_or(255, LedcDriver::get_max_duty);
        info!(
            "PWM outputs ready: {} channels on GPIO {:?} ({PWM_FREQUENCY_HZ}Hz, max duty {max_duty})",
            drivers.len(),
            &gpios[..drivers.len()]
        );
        Ok(Self {
            channels: drivers,
            max_duty,
        })
    }

    fn write_duty(&mut self, duty: &[u8]) -> Result<()> {
        for (channel, &d) in self.channels.iter_mut().zip(duty) {
            channel.set_duty(u32::from(d) * self.max_duty / 255)?;
        }
        Ok(())
    }

    pub fn boot_animation(&mut self) -> Result<()> {
        let on = vec![BOOT_BLINK_LEVEL; self.channels.len()];
        let off = vec![0; self.channels.len()];
        for _ in 0..3 {
            self.write_duty(&on)?;
            sleep(BOOT_BLINK_DURATION);
            self.write_duty(&off)?;
            sleep(BOOT_BLINK_DURATION);
        }
        Ok(())
    }
}

impl OutputSink for ChannelOutput {
    type Error = anyhow::Error;

    fn apply(&mut self, frame: &Frame) -> Result<()> {
        match frame {
            Frame::Channels(duty) => self.write_duty(duty),
            Frame::Pixels(_) => Err(anyhow!("pixel frame sent to PWM outputs")),
        }
    }
}

/// One or two WS2812 rings chained on a single data line.
pub struct RingOutput {
    driver: Ws2812Esp32Rmt<'static>,
}

impl RingOutput {
    pub fn new<C: RmtChannel, P: OutputPin>(
        pin: impl Peripheral<P = P> + 'static,
        channel: impl Peripheral<P = C> + 'static,
    ) -> Result<Self> {
        debug!("Creating WS2812 ring output");
        // Extra memory blocks give the RMT headroom when WiFi interrupts it
        let config = TransmitConfig::new().clock_divider(1).mem_block_num(4);
        let tx_driver = TxRmtDriver::new(channel, pin, &config)?;
        let driver = Ws2812Esp32Rmt::new_with_rmt_driver(tx_driver)?;
        Ok(Self { driver })
    }

    fn write_pixels(&mut self, pixels: &[RGB8]) -> Result<()> {
        self.driver.write(gamma(pixels.iter().copied()))?;
        Ok(())
    }

    pub fn boot_animation(&mut self, total_leds: usize) -> Result<()> {
        let dim = |c: u8| u8::try_from(u16::from(c) * u16::from(BOOT_BLINK_LEVEL) / 255).unwrap_or(u8::MAX);
        let color = RGB8::new(dim(BOOT_BLINK_COLOR.r), dim(BOOT_BLINK_COLOR.g), dim(BOOT_BLINK_COLOR.b));
        for _ in 0..3 {
            self.write_pixels(&vec![color; total_leds])?;
            sleep(BOOT_BLINK_DURATION);
            self.write_pixels(&vec![RGB8::default(); total_leds])?;
            sleep(BOOT_BLINK_DURATION);
        }
        Ok(())
    }
}

impl OutputSink for RingOutput {
    type Error = anyhow::Error;

    fn apply(&mut self, frame: &Frame) -> Result<()> {
        match frame {
            Frame::Pixels(pixels) => self.write_pixels(pixels),
            Frame::Channels(_) => Err(anyhow!("channel frame sent to pixel ring")),
        }
    }
}

/// Whichever output the configured topology selected at boot.
pub enum LightOutput {
    Channels(ChannelOutput),
    Rings(RingOutput),
}

impl LightOutput {
    /// Blink the outputs three times as a boot indicator
    pub fn boot_animation(&mut self, total_leds: usize) {
        let result = match self {
            Self::Channels(c) => c.boot_animation(),
            Self::Rings(r) => r.boot_animation(total_leds),
        };
        if let Err(e) = result {
            warn!("Boot animation failed: {e}");
        }
    }
}

impl OutputSink for LightOutput {
    type Error = anyhow::Error;

    fn apply(&mut self, frame: &Frame) -> Result<()> {
        match self {
            Self::Channels(c) => c.apply(frame),
            Self::Rings(r) => r.apply(frame),
        }
    }
}
