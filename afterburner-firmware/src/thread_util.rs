//! Spawning threads with FreeRTOS task names
//!
//! `std::thread::Builder::name()` only renames the pthread after the FreeRTOS
//! task already exists, so task lists show the default name. Setting a
//! `ThreadSpawnConfiguration` before spawning names the task itself.

use esp_idf_hal::cpu::Core;
use esp_idf_hal::task::thread::ThreadSpawnConfiguration;
use log::warn;
use std::ffi::CStr;
use std::thread::JoinHandle;

/// Spawn with `conf` in effect, then restore whatever was configured before.
fn spawn_with<F, T>(conf: &ThreadSpawnConfiguration, f: F) -> JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let prev_conf = ThreadSpawnConfiguration::get();

    if let Err(e) = conf.set() {
        warn!("Failed to set thread spawn configuration {:?}: {e}", conf.name);
    }

    let handle = std::thread::spawn(f);

    let restored = prev_conf.unwrap_or_default().set();
    if let Err(e) = restored {
        warn!("Failed to restore thread spawn configuration: {e}");
    }

    handle
}

/// Spawn a thread with a FreeRTOS task name (at most 15 characters).
pub fn spawn_named<F, T>(name: &'static CStr, f: F) -> JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let conf = ThreadSpawnConfiguration {
        name: Some(name.to_bytes_with_nul()),
        ..Default::default()
    };
    spawn_with(&conf, f)
}

/// Spawn a named thread pinned to `core`.
///
/// The render loop runs on core 1, away from the WiFi stack on core 0.
pub fn spawn_named_on_core<F, T>(name: &'static CStr, core: Core, f: F) -> JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let conf = ThreadSpawnConfiguration {
        name: Some(name.to_bytes_with_nul()),
        pin_to_core: Some(core),
        ..Default::default()
    };
    spawn_with(&conf, f)
}
