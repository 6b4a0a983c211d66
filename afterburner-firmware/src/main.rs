use afterburner_effects_lib::{AfterburnerEngine, Topology};
use anyhow::{anyhow, Result};
use esp_idf_hal::cpu::Core;
use esp_idf_hal::delay::FreeRtos;
use esp_idf_hal::gpio::AnyOutputPin;
use esp_idf_hal::prelude::*;
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::mdns::EspMdns;
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use esp_idf_svc::wifi::{AccessPointConfiguration, AuthMethod, BlockingWifi, Configuration, EspWifi};
use log::{info, warn};
use std::sync::{mpsc, Arc, Mutex};

mod config;
mod leds;
mod pulse_input;
mod render_task;
mod sse_server;
mod thread_util;
mod watchdog;
mod web_server;

use config::{Config, SharedConfig};
use leds::{ChannelOutput, LightOutput, RingOutput};
use pulse_input::GpioPulseCapture;
use render_task::{render_task, RenderHardware, RenderTaskSender, Telemetry};
use sse_server::SseSender;

/// State shared between the web server and the background tasks
pub struct State {
    pub config: SharedConfig,
    pub wifi: Mutex<BlockingWifi<EspWifi<'static>>>,
    pub sse_tx: SseSender,
    pub render_tx: RenderTaskSender,
    pub telemetry: Mutex<Telemetry>,
}

/// Initialize mDNS for local discovery (afterburner.local)
fn setup_mdns() -> Option<EspMdns> {
    match EspMdns::take() {
        Ok(mut m) => {
            let _ = m.set_hostname("afterburner");
            let _ = m.set_instance_name("Afterburner Lights");
            let _ = m.add_service(None, "_http", "_tcp", 80, &[]);
            info!("mDNS started: afterburner.local");
            Some(m)
        }
        Err(e) => {
            warn!("Failed to start mDNS: {e:?}");
            None
        }
    }
}

/// Bring up the soft-AP the control page is served on
fn start_access_point(config: &Config, wifi: &mut BlockingWifi<EspWifi<'static>>) -> Result<()> {
    let ap_password = config.ap_password.as_deref().unwrap_or("");
    let auth_method = if ap_password.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPA2Personal
    };

    info!("Starting WiFi AP '{}' ({auth_method:?})", config.ap_ssid);
    wifi.set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
        ssid: config
            .ap_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("AP SSID '{}' is too long", config.ap_ssid))?,
        password: ap_password.try_into().unwrap_or_default(),
        auth_method,
        channel: 1,
        ..Default::default()
    }))?;
    wifi.start()?;
    wifi.wait_netif_up()?;
    Ok(())
}

fn main() -> Result<()> {
    // It is necessary to call this function once. Otherwise some patches to the runtime
    // implemented by esp-idf-sys might not link properly. See https://github.com/esp-rs/esp-idf-template/issues/71
    esp_idf_svc::sys::link_patches();

    // Bind the log crate to the ESP Logging facilities
    esp_idf_svc::log::EspLogger::initialize_default();

    info!("Starting afterburner firmware {}...", env!("GIT_VERSION"));

    let peripherals = Peripherals::take()?;
    let sys_loop = EspSystemEventLoop::take()?;
    let nvs = EspDefaultNvsPartition::take()?;

    // Initialize NVS for config storage
    config::init_nvs(nvs.clone())?;

    let config = SharedConfig::new(Config::load_or_default());

    // Apply configured log level
    {
        let cfg = config.lock();
        let level = cfg.log_level.as_level_filter();
        // Set for all targets (use "*" for global)
        if let Err(e) = esp_idf_svc::log::set_target_level("*", level) {
            warn!("Failed to set log level: {e}");
        } else {
            info!("Log level set to {:?}", cfg.log_level);
        }
    }

    let (engine_config, throttle_gpio, outputs) = {
        let cfg = config.lock();
        (cfg.engine, cfg.throttle_gpio, cfg.outputs.clone())
    };

    let output = match engine_config.topology {
        Topology::Channels { count } => {
            let gpios = &outputs.channel_gpios[..usize::from(count).min(outputs.channel_gpios.len())];
            info!("Initializing {} PWM channels...", gpios.len());
            LightOutput::Channels(ChannelOutput::new(
                peripherals.ledc.timer0,
                (
                    peripherals.ledc.channel0,
                    peripherals.ledc.channel1,
                    peripherals.ledc.channel2,
                    peripherals.ledc.channel3,
                ),
                gpios,
            )?)
        }
        Topology::Rings { rings } => {
            info!("Initializing {rings} LED ring(s) on GPIO {}...", outputs.ring_gpio);
            // SAFETY: We trust the user-configured GPIO pin number is valid for this board
            let ring_pin = unsafe { AnyOutputPin::new(i32::from(outputs.ring_gpio)) };
            LightOutput::Rings(RingOutput::new(ring_pin, peripherals.rmt.channel0)?)
        }
    };
    let pulse = GpioPulseCapture::new(throttle_gpio)?;

    info!("Initializing WiFi...");
    let mut wifi = BlockingWifi::wrap(
        EspWifi::new(peripherals.modem, sys_loop.clone(), Some(nvs))?,
        sys_loop,
    )?;
    start_access_point(&config.lock(), &mut wifi)?;
    let ap_ip_info = wifi.wifi().ap_netif().get_ip_info()?;
    info!("AP started - connect to '{}' and navigate to http://{}", config.lock().ap_ssid, ap_ip_info.ip);

    // Start SSE server for status streaming (on port 8081)
    let sse_tx = sse_server::start_sse_server();

    let (render_tx, render_rx) = mpsc::channel();

    let state = Arc::new(State {
        config,
        wifi: Mutex::new(wifi),
        sse_tx,
        render_tx,
        telemetry: Mutex::new(Telemetry::default()),
    });

    web_server::start_server(&state)?;
    info!("Control page available at http://{}", ap_ip_info.ip);

    // Start mDNS for local discovery (afterburner.local)
    let _mdns = setup_mdns();

    // The render task owns the engine and the hardware, no locking in the hot path
    let engine = AfterburnerEngine::new(engine_config);
    let hardware = RenderHardware { pulse, output };
    {
        let state = state.clone();
        thread_util::spawn_named_on_core(c"render", Core::Core1, move || {
            render_task(&state, engine, hardware, render_rx);
        });
    }

    info!("All systems running!");

    // Main loop - keep alive
    loop {
        FreeRtos::delay_ms(1000);
    }
}
