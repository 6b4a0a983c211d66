//! Task watchdog (TWDT) users for the long-running loops.
//!
//! Each loop registers one [`WatchdogHandle`] and feeds it once per
//! iteration. A loop that stalls past the TWDT timeout resets the chip.

use esp_idf_svc::sys::{
    esp_task_wdt_add_user, esp_task_wdt_delete_user, esp_task_wdt_reset_user,
    esp_task_wdt_user_handle_t,
};
use log::{debug, error};
use std::ffi::CStr;

/// Registered watchdog user, removed again on drop.
pub struct WatchdogHandle {
    handle: esp_task_wdt_user_handle_t,
    name: &'static CStr,
}

impl WatchdogHandle {
    /// Register a watchdog user named after the loop it guards.
    ///
    /// # Panics
    /// Panics if the TWDT refuses the user; the loop would run unguarded.
    pub fn register(name: &'static CStr) -> Self {
        let mut handle: esp_task_wdt_user_handle_t = std::ptr::null_mut();

        // SAFETY: name is a static C string and handle a valid out-pointer
        let result = unsafe { esp_task_wdt_add_user(name.as_ptr(), &mut handle) };
        assert!(
            result == 0,
            "Watchdog: failed to register user {name:?}: error code {result}"
        );
        debug!("Watchdog: registered user {name:?}");
        Self { handle, name }
    }

    /// Reset this user's timeout.
    pub fn feed(&self) {
        // SAFETY: handle came from esp_task_wdt_add_user and is still registered
        let result = unsafe { esp_task_wdt_reset_user(self.handle) };
        if result != 0 {
            error!("Watchdog: failed to feed {:?}: error code {result}", self.name);
        }
    }
}

impl Drop for WatchdogHandle {
    fn drop(&mut self) {
        debug!("Watchdog: unregistering user {:?}", self.name);
        // SAFETY: handle is still registered, it is only deleted here
        let result = unsafe { esp_task_wdt_delete_user(self.handle) };
        if result != 0 {
            error!("Watchdog: failed to unregister {:?}: error code {result}", self.name);
        }
    }
}
