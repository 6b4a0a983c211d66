//! Host-side simulator for the afterburner pipeline
//!
//! Usage: cargo run -p afterburner-sim -- --scenario calibrate --topology dual-ring
//!
//! Runs the same engine as the firmware against a scripted throttle stick and
//! virtual time, printing status notifications and a summary of each frame.

use std::convert::Infallible;

use afterburner_effects_lib::{
    AfterburnerEngine, CalibrationPolicy, CalibrationResult, Command, EngineConfig, Frame,
    MemorySettingsStore, OutputSink, SettingWrite, StatusMessage, Topology,
};
use clap::{Parser, ValueEnum};
use log::{info, warn, LevelFilter};

mod scenario;

use scenario::{Scenario, ScriptedStick};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TopologyArg {
    /// Four PWM channels.
    Channels,
    /// One pixel ring.
    Ring,
    /// Two concentric pixel rings.
    DualRing,
}

impl From<TopologyArg> for Topology {
    fn from(arg: TopologyArg) -> Self {
        match arg {
            TopologyArg::Channels => Self::Channels { count: 4 },
            TopologyArg::Ring => Self::Rings { rings: 1 },
            TopologyArg::DualRing => Self::Rings { rings: 2 },
        }
    }
}

/// Drive the afterburner engine with a scripted throttle stick.
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Stick script to run.
    #[arg(short, long, value_enum, default_value_t = Scenario::Sweep)]
    scenario: Scenario,

    /// Output hardware to render for.
    #[arg(short, long, value_enum, default_value_t = TopologyArg::Channels)]
    topology: TopologyArg,

    /// Number of ticks to simulate.
    #[arg(short = 'n', long, default_value_t = 1500)]
    ticks: u64,

    /// Virtual time per tick in milliseconds.
    #[arg(long, default_value_t = 10)]
    tick_ms: u64,

    /// Pixels per ring.
    #[arg(long)]
    leds: Option<u16>,

    /// Effect mode (0 = linear, 1 = ease, 2 = pulse).
    #[arg(short, long)]
    mode: Option<u8>,

    /// Accept calibration after this many samples instead of confirmed visits.
    #[arg(long)]
    fixed_samples: Option<u32>,

    /// Print notifications as JSON lines, as the control channel sends them.
    #[arg(long)]
    json: bool,

    /// Seed for sparkle randomness.
    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// Enable debug logging.
    #[arg(short, long)]
    verbose: bool,
}

/// Keeps the latest frame for printing.
#[derive(Default)]
struct LastFrame(Option<Frame>);

impl OutputSink for LastFrame {
    type Error = Infallible;

    fn apply(&mut self, frame: &Frame) -> Result<(), Self::Error> {
        self.0 = Some(frame.clone());
        Ok(())
    }
}

fn describe(frame: &Frame) -> String {
    match frame {
        Frame::Channels(duty) => format!("duty={duty:?}"),
        Frame::Pixels(pixels) => {
            let lit = pixels.iter().filter(|p| p.r > 0 || p.g > 0 || p.b > 0).count();
            let n = pixels.len().max(1);
            let sum = pixels.iter().fold([0usize; 3], |acc, p| {
                [
                    acc[0] + usize::from(p.r),
                    acc[1] + usize::from(p.g),
                    acc[2] + usize::from(p.b),
                ]
            });
            format!(
                "lit={lit}/{} avg=({},{},{})",
                pixels.len(),
                sum[0] / n,
                sum[1] / n,
                sum[2] / n
            )
        }
    }
}

fn print_message(message: &StatusMessage, now_ms: u64, frame: Option<&Frame>, json: bool) {
    if json {
        match serde_json::to_string(message) {
            Ok(line) => println!("{line}"),
            Err(e) => warn!("Failed to encode {message:?}: {e}"),
        }
        return;
    }

    #[allow(clippy::cast_precision_loss)]
    let seconds = now_ms as f64 / 1000.0;
    match message {
        StatusMessage::Status(status) => {
            let signal = if status.signal { "ok" } else { "LOST" };
            let frame = frame.map(describe).unwrap_or_default();
            println!("{seconds:>7.2}s  thr={:.2} signal={signal:<4} {frame}", status.thr);
        }
        StatusMessage::CalibrationProgress(p) => {
            println!(
                "{seconds:>7.2}s  calibrating {}..{}us visits min={} max={}",
                p.min, p.max, p.min_visits, p.max_visits
            );
        }
        StatusMessage::Calibration(c) => {
            let state = if c.calibrated { "calibrated" } else { "uncalibrated" };
            let result = match c.result {
                Some(CalibrationResult::Complete) => " (run complete)",
                Some(CalibrationResult::TimedOut) => " (run did not complete)",
                Some(CalibrationResult::Reset) => " (reset)",
                None => "",
            };
            println!("{seconds:>7.2}s  {state} {}..{}us{result}", c.min, c.max);
        }
    }
}

fn main() {
    let args = Args::parse();

    let level = if args.verbose { LevelFilter::Debug } else { LevelFilter::Info };
    env_logger::builder().filter_level(level).init();

    let mut store = MemorySettingsStore::default();
    let writes = [
        args.mode.map(SettingWrite::Mode),
        args.leds.map(SettingWrite::NumLeds),
    ];
    for write in writes.into_iter().flatten() {
        if let Err(e) = store.settings.apply(write) {
            eprintln!("Invalid setting: {e}");
            std::process::exit(1);
        }
    }

    let config = EngineConfig {
        topology: args.topology.into(),
        rng_seed: args.seed,
        calibration_policy: args
            .fixed_samples
            .map_or(CalibrationPolicy::VisitConfirmed, |samples| CalibrationPolicy::FixedSamples { samples }),
        ..EngineConfig::default()
    };
    let mut engine = AfterburnerEngine::new(config);
    let mut stick = ScriptedStick::new(args.scenario);
    let mut sink = LastFrame::default();

    info!(
        "Simulating {:?} on {:?} for {} ticks of {}ms",
        args.scenario, config.topology, args.ticks, args.tick_ms
    );

    match args.scenario {
        Scenario::Calibrate => {
            let _ = engine.handle_command(Command::StartCalibration, &mut store, 0);
        }
        Scenario::Demo => {
            let _ = engine.handle_command(Command::SetDemoMode(true), &mut store, 0);
        }
        Scenario::Sweep | Scenario::SignalLoss => {}
    }

    for tick in 0..args.ticks {
        let now_ms = tick * args.tick_ms;
        stick.set_time(now_ms);
        let outcome = engine.tick(&mut stick, &mut store, &mut sink, now_ms);
        for message in &outcome.messages {
            print_message(message, now_ms, sink.0.as_ref(), args.json);
        }
    }

    match store.calibration {
        Some(bounds) => info!("Final calibration: {}..{}us", bounds.min_us, bounds.max_us),
        None => info!("Final calibration: defaults"),
    }
}
