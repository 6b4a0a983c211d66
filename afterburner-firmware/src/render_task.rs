//! Throttle read and light render loop
//!
//! Owns the pulse input, the light outputs and the engine. Each iteration:
//! - applies queued commands from the web server
//! - runs one engine tick (bounded pulse read, calibration, render, output)
//! - forwards notifications to SSE clients and the status endpoint

use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use afterburner_effects_lib::{
    AfterburnerEngine, CalibrationProgress, CalibrationStatus, Command, StatusMessage, StatusReport,
};
use log::{debug, info, warn};
use serde::Serialize;

use crate::config::SharedConfig;
use crate::leds::LightOutput;
use crate::pulse_input::GpioPulseCapture;
use crate::sse_server::SseMessage;
use crate::watchdog::WatchdogHandle;
use crate::State;

/// Pause after each tick so lower-priority tasks on this core get to run
const LOOP_DELAY: Duration = Duration::from_millis(10);

/// Messages sent to the render task
#[derive(Debug, Clone, Copy)]
pub enum RenderTaskMessage {
    Command(Command),
}

/// Channel sender for messages to the render task
pub type RenderTaskSender = Sender<RenderTaskMessage>;

/// Latest notifications, served by `GET /api/status`
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Telemetry {
    pub status: Option<StatusReport>,
    /// Present while a calibration run is active
    pub calibration_progress: Option<CalibrationProgress>,
    /// Outcome of the last run, completion, timeout or reset
    pub last_calibration: Option<CalibrationStatus>,
}

impl Telemetry {
    fn record(&mut self, message: &StatusMessage) {
        match *message {
            StatusMessage::Status(status) => self.status = Some(status),
            StatusMessage::CalibrationProgress(progress) => self.calibration_progress = Some(progress),
            StatusMessage::Calibration(outcome) => {
                self.calibration_progress = None;
                self.last_calibration = Some(outcome);
            }
        }
    }
}

/// Hardware owned by the render task
pub struct RenderHardware {
    pub pulse: GpioPulseCapture,
    pub output: LightOutput,
}

fn publish(state: &State, message: StatusMessage) {
    if let Ok(mut telemetry) = state.telemetry.lock() {
        telemetry.record(&message);
    }
    if !matches!(message, StatusMessage::Status(_)) {
        debug!("Publishing {message:?}");
    }
    let _ = state.sse_tx.send(SseMessage::Status(message));
}

/// Milliseconds since the task started
fn elapsed_ms(start: Instant) -> u64 {
    // u64::MAX milliseconds = 584 million years, safe to truncate
    #[allow(clippy::cast_possible_truncation)]
    let ms = start.elapsed().as_millis() as u64;
    ms
}

/// Run the render loop.
///
/// Never returns unless the command channel disconnects.
// Receiver is intentionally moved into this task for exclusive ownership
#[allow(clippy::needless_pass_by_value)]
pub fn render_task(
    state: &Arc<State>,
    mut engine: AfterburnerEngine,
    mut hardware: RenderHardware,
    rx: Receiver<RenderTaskMessage>,
) {
    let mut store: SharedConfig = state.config.clone();

    let (total_leds, demo_mode) = {
        let cfg = store.lock();
        (engine.topology().element_count(&cfg.settings), cfg.demo_mode)
    };
    hardware.output.boot_animation(total_leds);

    let watchdog = WatchdogHandle::register(c"render_task");
    info!("Render task started ({:?}, {total_leds} outputs)", engine.topology());

    let start = Instant::now();
    if demo_mode {
        let _ = engine.handle_command(Command::SetDemoMode(true), &mut store, 0);
    }

    loop {
        watchdog.feed();

        // Apply everything queued since the last tick
        loop {
            match rx.try_recv() {
                Ok(RenderTaskMessage::Command(command)) => {
                    debug!("Render task command: {command:?}");
                    if let Some(message) = engine.handle_command(command, &mut store, elapsed_ms(start)) {
                        publish(state, message);
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    warn!("Render channel disconnected, exiting task");
                    return;
                }
            }
        }

        let outcome = engine.tick(
            &mut hardware.pulse,
            &mut store,
            &mut hardware.output,
            elapsed_ms(start),
        );
        for message in outcome.messages {
            publish(state, message);
        }

        std::thread::sleep(LOOP_DELAY);
    }
}

