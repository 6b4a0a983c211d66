use afterburner_effects_lib::{
    CalibrationBounds, EngineConfig, Settings, SettingsStore, Topology,
};
use anyhow::{anyhow, Result};
use esp_idf_svc::nvs::{EspNvs, EspNvsPartition, NvsDefault};
use esp_idf_svc::sys::{esp_mac_type_t_ESP_MAC_WIFI_STA, esp_read_mac};
use log::{debug, info, warn, LevelFilter};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};

const AP_SSID_PREFIX: &str = "Afterburner-";

/// Number of LEDC channels wired for the channel topology.
pub const MAX_PWM_CHANNELS: u8 = 4;

/// Read WiFi STA MAC address from eFuse (available before WiFi driver init)
fn get_wifi_sta_mac() -> [u8; 6] {
    let mut mac = [0u8; 6];
    // SAFETY: esp_read_mac just reads from eFuse, no driver needed
    unsafe {
        esp_read_mac(mac.as_mut_ptr(), esp_mac_type_t_ESP_MAC_WIFI_STA);
    }
    mac
}

/// Generate default AP SSID from WiFi MAC address
fn default_ap_ssid() -> String {
    let mac = get_wifi_sta_mac();
    format!("{AP_SSID_PREFIX}{:02X}{:02X}", mac[4], mac[5])
}

/// Configurable log level
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
}

impl LogLevel {
    #[must_use]
    pub const fn as_level_filter(self) -> LevelFilter {
        match self {
            Self::Off => LevelFilter::Off,
            Self::Error => LevelFilter::Error,
            Self::Warn => LevelFilter::Warn,
            Self::Info => LevelFilter::Info,
            Self::Debug => LevelFilter::Debug,
        }
    }
}

const NVS_NAMESPACE: &str = "afterburner";
const NVS_CONFIG_KEY: &str = "config";

// Global NVS handle - initialized once in main
static NVS: Mutex<Option<EspNvs<NvsDefault>>> = Mutex::new(None);

pub fn init_nvs(nvs_partition: EspNvsPartition<NvsDefault>) -> Result<()> {
    debug!("Initializing NVS namespace: {NVS_NAMESPACE}");
    let nvs = EspNvs::new(nvs_partition, NVS_NAMESPACE, true)?;
    *NVS.lock().map_err(|_| anyhow!("NVS lock poisoned"))? = Some(nvs);
    info!("NVS initialized");
    Ok(())
}

/// GPIO assignment for the light outputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputPins {
    /// LEDC outputs, one per channel, in rotation order
    #[serde(default = "default_channel_gpios")]
    pub channel_gpios: Vec<u8>,
    /// WS2812 data line; ring 2 is chained after ring 1
    #[serde(default = "default_ring_gpio")]
    pub ring_gpio: u8,
}

fn default_channel_gpios() -> Vec<u8> {
    vec![4, 5, 6, 7]
}

const fn default_ring_gpio() -> u8 {
    48
}

impl Default for OutputPins {
    fn default() -> Self {
        Self {
            channel_gpios: default_channel_gpios(),
            ring_gpio: default_ring_gpio(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Lighting settings exposed over the control API
    #[serde(default)]
    pub settings: Settings,
    /// Committed stick calibration, absent until the first successful run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calibration: Option<CalibrationBounds>,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub demo_mode: bool,
    #[serde(default = "default_throttle_gpio")]
    pub throttle_gpio: u8,
    #[serde(default)]
    pub outputs: OutputPins,
    /// AP SSID (defaults to "Afterburner-XXXX" where XXXX is derived from MAC)
    #[serde(default = "default_ap_ssid")]
    pub ap_ssid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ap_password: Option<String>,
    #[serde(default)]
    pub log_level: LogLevel,
}

const fn default_throttle_gpio() -> u8 {
    2
}

/// WPA2 needs at least 8 characters
const MIN_AP_PASSWORD_LEN: usize = 8;

impl Default for Config {
    fn default() -> Self {
        Self {
            settings: Settings::default(),
            calibration: None,
            engine: EngineConfig::default(),
            demo_mode: false,
            throttle_gpio: default_throttle_gpio(),
            outputs: OutputPins::default(),
            ap_ssid: default_ap_ssid(),
            ap_password: None,
            log_level: LogLevel::default(),
        }
    }
}

impl Config {
    /// Clamp values to valid ranges and fix invalid values
    pub fn validate(&mut self) {
        let defaults = EngineConfig::default();
        let alpha = self.engine.smoothing_alpha;
        if !(alpha > 0.0 && alpha <= 1.0) {
            warn!("Smoothing alpha {alpha} outside (0, 1], resetting to {}", defaults.smoothing_alpha);
            self.engine.smoothing_alpha = defaults.smoothing_alpha;
        }
        if self.engine.pulse_timeout_us == 0 || self.engine.pulse_timeout_us > defaults.pulse_timeout_us * 2 {
            warn!(
                "Clamping pulse_timeout_us from {} to {}",
                self.engine.pulse_timeout_us, defaults.pulse_timeout_us
            );
            self.engine.pulse_timeout_us = defaults.pulse_timeout_us;
        }
        self.engine.topology = match self.engine.topology.clamped() {
            Topology::Channels { count } => {
                if self.outputs.channel_gpios.is_empty() {
                    warn!("No channel GPIOs configured, resetting to defaults");
                    self.outputs.channel_gpios = default_channel_gpios();
                }
                self.outputs.channel_gpios.truncate(usize::from(MAX_PWM_CHANNELS));
                let wired = u8::try_from(self.outputs.channel_gpios.len()).unwrap_or(MAX_PWM_CHANNELS);
                if count > wired {
                    warn!("Clamping channel count from {count} to {wired} wired outputs");
                }
                Topology::Channels { count: count.min(wired) }
            }
            rings @ Topology::Rings { .. } => rings,
        };
        if let Some(bounds) = self.calibration {
            if !bounds.is_sane() {
                warn!(
                    "Discarding stored calibration {}..{}us, not a usable range",
                    bounds.min_us, bounds.max_us
                );
                self.calibration = None;
            }
        }
        if self.ap_ssid.is_empty() {
            warn!("AP SSID is empty, resetting to default");
            self.ap_ssid = default_ap_ssid();
        }
        if self
            .ap_password
            .as_ref()
            .is_some_and(|pw| !pw.is_empty() && pw.len() < MIN_AP_PASSWORD_LEN)
        {
            warn!("AP password shorter than {MIN_AP_PASSWORD_LEN} characters, running an open AP");
            self.ap_password = None;
        }
    }

    pub fn load_or_default() -> Self {
        match Self::load() {
            Ok(mut config) => {
                info!("Loaded config from NVS");
                config.validate();
                config
            }
            Err(e) => {
                warn!("Failed to load config from NVS: {e}, using defaults");
                Self::default()
            }
        }
    }

    pub fn load() -> Result<Self> {
        debug!("Loading config from NVS");
        let nvs_guard = NVS.lock().map_err(|_| anyhow!("NVS lock poisoned"))?;
        let nvs = nvs_guard.as_ref().ok_or_else(|| anyhow!("NVS not initialized"))?;

        // Get the blob length first
        let len = nvs.blob_len(NVS_CONFIG_KEY)?;
        if let Some(len) = len {
            debug!("Config blob size: {len} bytes");
            let mut buf = vec![0u8; len];
            nvs.get_blob(NVS_CONFIG_KEY, &mut buf)?;
            let config: Config = serde_json::from_slice(&buf)?;
            debug!(
                "Config parsed: topology={:?}, throttle_gpio={}, calibrated={}",
                config.engine.topology,
                config.throttle_gpio,
                config.calibration.is_some()
            );
            Ok(config)
        } else {
            Err(anyhow!("No config found in NVS"))
        }
    }

    pub fn save(&self) -> Result<()> {
        debug!("Saving config to NVS");
        let mut nvs_guard = NVS.lock().map_err(|_| anyhow!("NVS lock poisoned"))?;
        let nvs = nvs_guard.as_mut().ok_or_else(|| anyhow!("NVS not initialized"))?;

        let json = serde_json::to_vec(self)?;
        debug!("Config JSON size: {} bytes", json.len());
        nvs.set_blob(NVS_CONFIG_KEY, &json)?;
        info!("Config saved to NVS");
        Ok(())
    }
}

/// Config shared between the web server and the render task.
///
/// Implements [`SettingsStore`] so the engine reads settings and commits
/// calibration straight to NVS.
#[derive(Clone)]
pub struct SharedConfig(Arc<Mutex<Config>>);

impl SharedConfig {
    pub fn new(config: Config) -> Self {
        Self(Arc::new(Mutex::new(config)))
    }

    /// Lock the config, recovering it if a panicking thread left it poisoned.
    pub fn lock(&self) -> MutexGuard<'_, Config> {
        self.0.lock().unwrap_or_else(|poisoned| {
            warn!("Config lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Apply `f` to the config and persist the result.
    pub fn update<R>(&self, f: impl FnOnce(&mut Config) -> R) -> Result<R> {
        let mut cfg = self.lock();
        let result = f(&mut cfg);
        cfg.save()?;
        Ok(result)
    }
}

impl SettingsStore for SharedConfig {
    type Error = anyhow::Error;

    fn settings(&self) -> Settings {
        self.lock().settings
    }

    fn calibration_bounds(&self) -> Option<CalibrationBounds> {
        self.lock().calibration
    }

    fn commit_calibration(&mut self, bounds: CalibrationBounds) -> Result<()> {
        self.update(|cfg| cfg.calibration = Some(bounds))
    }

    fn reset_calibration(&mut self) -> Result<()> {
        self.update(|cfg| cfg.calibration = None)
    }
}
