use afterburner_effects_lib::{CalibrationProgress, CalibrationStatus, Command, SettingsPatch};
use anyhow::Result;
use embedded_svc::http::Method;
use embedded_svc::io::Write;
use esp_idf_svc::http::server::{Configuration, EspHttpServer};
use log::{debug, info, warn};
use std::sync::Arc;

use crate::render_task::RenderTaskMessage;
use crate::sse_server::SSE_PORT;
use crate::State;

/// Demo mode toggle from the web UI
#[derive(serde::Deserialize)]
struct DemoRequest {
    enabled: bool,
}

/// Committed calibration plus the live run, if any
#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct CalibrationResponse {
    #[serde(flatten)]
    status: CalibrationStatus,
    calibrating: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    progress: Option<CalibrationProgress>,
}

// HTML split into two parts to inject SSE_PORT without runtime allocation
// Generated by build.rs from src/index.html
const HTML_INDEX_START: &str = include_str!(concat!(env!("OUT_DIR"), "/index_start.html"));
const HTML_INDEX_END: &str = include_str!(concat!(env!("OUT_DIR"), "/index_end.html"));

/// Request bodies are small JSON objects
const MAX_BODY_LEN: usize = 512;

fn send_command(state: &State, command: Command) -> bool {
    match state.render_tx.send(RenderTaskMessage::Command(command)) {
        Ok(()) => true,
        Err(e) => {
            warn!("Render task not listening, dropped {command:?}: {e}");
            false
        }
    }
}

#[allow(clippy::too_many_lines)] // Route registration function - length is proportional to endpoints
pub fn start_server(state: &Arc<State>) -> Result<()> {
    info!("Web server starting...");

    // LWIP max is 16 sockets; leave room for SSE, mDNS and httpd control
    let server_config = Configuration {
        max_open_sockets: 6,
        session_timeout: core::time::Duration::from_secs(2),
        lru_purge_enable: true,
        ..Default::default()
    };
    let mut server = EspHttpServer::new(&server_config)?;

    // Serve the control page (inject SSE port between two static parts)
    server.fn_handler("/", Method::Get, |req| -> Result<(), esp_idf_svc::io::EspIOError> {
        let mut response = req.into_ok_response()?;
        response.write_all(HTML_INDEX_START.as_bytes())?;
        response.write_all(SSE_PORT.to_string().as_bytes())?;
        response.write_all(HTML_INDEX_END.as_bytes())?;
        Ok(())
    })?;

    let state_clone = state.clone();
    server.fn_handler("/api/settings", Method::Get, move |req| -> Result<(), esp_idf_svc::io::EspIOError> {
        debug!("HTTP: GET /api/settings");
        let settings = state_clone.config.lock().settings;
        let json = serde_json::to_string(&settings).unwrap_or_else(|_| "{}".to_string());

        let mut response = req.into_ok_response()?;
        response.write_all(json.as_bytes())?;
        Ok(())
    })?;

    // POST settings: every field optional, the whole patch is checked before any field changes
    let state_clone = state.clone();
    server.fn_handler("/api/settings", Method::Post, move |mut req| -> Result<(), esp_idf_svc::io::EspIOError> {
        info!("HTTP: POST /api/settings");
        let mut buf = [0u8; MAX_BODY_LEN];
        let bytes_read = req.read(&mut buf)?;

        let patch = match serde_json::from_slice::<SettingsPatch>(&buf[..bytes_read]) {
            Ok(patch) => patch,
            Err(e) => {
                warn!("Invalid settings JSON received: {e}");
                let mut response = req.into_status_response(400)?;
                response.write_all(e.to_string().as_bytes())?;
                return Ok(());
            }
        };

        let result = {
            let mut cfg = state_clone.config.lock();
            let result = cfg.settings.apply_patch(&patch);
            if matches!(result, Ok(true)) {
                if let Err(e) = cfg.save() {
                    warn!("Failed to save settings: {e}");
                }
            }
            result.map(|_| cfg.settings)
        };

        match result {
            Ok(settings) => {
                debug!("Settings now {settings:?}");
                let json = serde_json::to_string(&settings).unwrap_or_else(|_| "{}".to_string());
                let mut response = req.into_ok_response()?;
                response.write_all(json.as_bytes())?;
            }
            Err(e) => {
                warn!("Rejected settings write: {e}");
                let mut response = req.into_status_response(400)?;
                response.write_all(e.to_string().as_bytes())?;
            }
        }
        Ok(())
    })?;

    let state_clone = state.clone();
    server.fn_handler("/api/calibration", Method::Get, move |req| -> Result<(), esp_idf_svc::io::EspIOError> {
        debug!("HTTP: GET /api/calibration");
        let status = CalibrationStatus::from_committed(state_clone.config.lock().calibration);
        let progress = state_clone
            .telemetry
            .lock()
            .ok()
            .and_then(|t| t.calibration_progress);
        let body = CalibrationResponse {
            status,
            calibrating: progress.is_some(),
            progress,
        };
        let json = serde_json::to_string(&body).unwrap_or_else(|_| "{}".to_string());

        let mut response = req.into_ok_response()?;
        response.write_all(json.as_bytes())?;
        Ok(())
    })?;

    let state_clone = state.clone();
    server.fn_handler("/api/calibration/start", Method::Post, move |req| -> Result<(), esp_idf_svc::io::EspIOError> {
        info!("HTTP: POST /api/calibration/start");
        if send_command(&state_clone, Command::StartCalibration) {
            req.into_ok_response()?;
        } else {
            req.into_status_response(503)?;
        }
        Ok(())
    })?;

    let state_clone = state.clone();
    server.fn_handler("/api/calibration/reset", Method::Post, move |req| -> Result<(), esp_idf_svc::io::EspIOError> {
        info!("HTTP: POST /api/calibration/reset");
        if send_command(&state_clone, Command::ResetCalibration) {
            req.into_ok_response()?;
        } else {
            req.into_status_response(503)?;
        }
        Ok(())
    })?;

    // Latest status, calibration progress and outcome from the render task
    let state_clone = state.clone();
    server.fn_handler("/api/status", Method::Get, move |req| -> Result<(), esp_idf_svc::io::EspIOError> {
        debug!("HTTP: GET /api/status");
        let json = state_clone
            .telemetry
            .lock()
            .ok()
            .and_then(|t| serde_json::to_string(&*t).ok())
            .unwrap_or_else(|| "{}".to_string());

        let mut response = req.into_ok_response()?;
        response.write_all(json.as_bytes())?;
        Ok(())
    })?;

    let state_clone = state.clone();
    server.fn_handler("/api/demo", Method::Post, move |mut req| -> Result<(), esp_idf_svc::io::EspIOError> {
        info!("HTTP: POST /api/demo");
        let mut buf = [0u8; 64];
        let bytes_read = req.read(&mut buf)?;

        if let Ok(demo) = serde_json::from_slice::<DemoRequest>(&buf[..bytes_read]) {
            info!("Demo mode {}", if demo.enabled { "enabled" } else { "disabled" });
            if let Err(e) = state_clone.config.update(|cfg| cfg.demo_mode = demo.enabled) {
                warn!("Failed to save demo mode: {e}");
            }
            if send_command(&state_clone, Command::SetDemoMode(demo.enabled)) {
                req.into_ok_response()?;
            } else {
                req.into_status_response(503)?;
            }
        } else {
            warn!("Invalid demo JSON received");
            req.into_status_response(400)?;
        }
        Ok(())
    })?;

    let state_clone = state.clone();
    server.fn_handler("/api/reboot", Method::Post, move |req| -> Result<(), esp_idf_svc::io::EspIOError> {
        info!("HTTP: POST /api/reboot - Device reboot requested");

        req.into_ok_response()?;

        // Schedule restart after response is sent
        let state = state_clone.clone();
        crate::thread_util::spawn_named(c"restart", move || {
            std::thread::sleep(std::time::Duration::from_secs(1));

            info!("Stopping WiFi before reboot...");
            if let Ok(mut wifi) = state.wifi.lock() {
                if let Err(e) = wifi.stop() {
                    warn!("Failed to stop WiFi: {e:?}");
                }
            }

            info!("Rebooting device now...");
            unsafe {
                esp_idf_svc::sys::esp_restart();
            }
        });

        Ok(())
    })?;

    info!("Web server started on http://0.0.0.0:80");

    // Keep server alive
    std::mem::forget(server);

    Ok(())
}
