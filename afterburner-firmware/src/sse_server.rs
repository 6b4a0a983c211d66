//! Standalone SSE server for status streaming
//!
//! This runs on a separate port (8081) to avoid blocking the main HTTP server.
//! Browsers can connect via EventSource with CORS.

use afterburner_effects_lib::StatusMessage;
use log::{debug, error, info, warn};
use smallvec::SmallVec;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::time::{Duration, Instant};

use crate::thread_util::spawn_named;
use crate::watchdog::WatchdogHandle;

/// Port for the SSE server (separate from main HTTP server)
pub const SSE_PORT: u16 = 8081;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const MAX_SSE_CLIENTS: usize = 3;

/// Message types for SSE server
pub enum SseMessage {
    /// Notification from the render task to broadcast
    Status(StatusMessage),
}

/// Sender for SSE messages
pub type SseSender = Sender<SseMessage>;

/// Start the SSE server and return a sender for status updates
pub fn start_sse_server() -> SseSender {
    let (tx, rx) = mpsc::channel::<SseMessage>();

    spawn_named(c"sse_server", move || {
        if let Err(e) = run_sse_server(&rx) {
            error!("SSE server error: {e}");
        }
    });

    tx
}

/// Encode one notification as an SSE `data:` event
fn encode_event(message: &StatusMessage) -> Option<String> {
    match serde_json::to_string(message) {
        Ok(json) => Some(format!("data: {json}\n\n")),
        Err(e) => {
            warn!("SSE: Failed to encode {message:?}: {e}");
            None
        }
    }
}

/// Latest event of each kind, replayed to clients as they connect
#[derive(Default)]
struct Snapshot {
    status: Option<String>,
    calibration: Option<String>,
}

impl Snapshot {
    fn record(&mut self, message: &StatusMessage, event: &str) {
        match message {
            StatusMessage::Status(_) => self.status = Some(event.to_string()),
            // Progress supersedes the last outcome until the run ends
            StatusMessage::CalibrationProgress(_) | StatusMessage::Calibration(_) => {
                self.calibration = Some(event.to_string());
            }
        }
    }

    fn events(&self) -> impl Iterator<Item = &str> {
        [self.calibration.as_deref(), self.status.as_deref()]
            .into_iter()
            .flatten()
    }
}

/// SSE server main loop
fn run_sse_server(rx: &Receiver<SseMessage>) -> std::io::Result<()> {
    info!("SSE server starting on port {SSE_PORT}...");

    let listener = TcpListener::bind(("0.0.0.0", SSE_PORT))?;
    listener.set_nonblocking(true)?;

    let watchdog = WatchdogHandle::register(c"sse_server");

    info!("SSE server started on port {SSE_PORT}");

    let mut clients: SmallVec<[TcpStream; MAX_SSE_CLIENTS]> = SmallVec::new();
    let mut snapshot = Snapshot::default();
    let mut last_heartbeat = Instant::now();

    loop {
        watchdog.feed();

        // Accept new connections (non-blocking)
        match listener.accept() {
            Ok((stream, addr)) => {
                info!("SSE: New connection from {addr}");
                if let Some(client) = handle_new_connection(stream) {
                    // Enforce max client limit - close oldest if at capacity
                    if clients.len() >= MAX_SSE_CLIENTS {
                        info!("SSE: Max clients reached ({MAX_SSE_CLIENTS}), closing oldest connection");
                        let oldest = clients.remove(0);
                        let _ = oldest.shutdown(std::net::Shutdown::Both);
                    }

                    for event in snapshot.events() {
                        let _ = send_to_client(&client, event.as_bytes());
                    }
                    clients.push(client);
                    info!("SSE: Client connected (total={})", clients.len());
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                // No pending connections, continue
            }
            Err(e) => {
                warn!("SSE: Accept error: {e}");
            }
        }

        // Send heartbeat to detect dead connections
        if last_heartbeat.elapsed() >= HEARTBEAT_INTERVAL && !clients.is_empty() {
            let before = clients.len();
            clients.retain(|client| send_to_client(client, b": heartbeat\n\n").is_ok());
            let removed = before - clients.len();
            if removed > 0 {
                info!("SSE: Heartbeat removed {removed} dead clients, {} remaining", clients.len());
            }
            last_heartbeat = Instant::now();
        }

        // Process incoming messages
        match rx.try_recv() {
            Ok(SseMessage::Status(message)) => {
                let Some(event) = encode_event(&message) else {
                    continue;
                };
                snapshot.record(&message, &event);

                let before = clients.len();
                clients.retain(|client| send_to_client(client, event.as_bytes()).is_ok());
                let removed = before - clients.len();
                if removed > 0 {
                    debug!("SSE: Removed {removed} dead clients during broadcast, {} remaining", clients.len());
                }
            }
            Err(TryRecvError::Empty) => {
                // No messages, brief sleep to prevent busy loop
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(TryRecvError::Disconnected) => {
                warn!("SSE: Channel disconnected, shutting down");
                break;
            }
        }
    }

    Ok(())
}

/// Handle a new connection - read HTTP request and send SSE headers
fn handle_new_connection(mut stream: TcpStream) -> Option<TcpStream> {
    stream.set_read_timeout(Some(Duration::from_secs(5))).ok()?;
    stream.set_write_timeout(Some(Duration::from_secs(5))).ok()?;

    // Read the HTTP request (we don't really parse it, just consume it)
    let mut buf = [0u8; 1024];
    let n = match stream.read(&mut buf) {
        Ok(n) if n > 0 => n,
        _ => {
            debug!("SSE: Failed to read request");
            return None;
        }
    };

    let request = String::from_utf8_lossy(&buf[..n]);
    if !request.starts_with("GET ") {
        debug!("SSE: Not a GET request");
        return None;
    }

    let response = concat!(
        "HTTP/1.1 200 OK\r\n",
        "Content-Type: text/event-stream\r\n",
        "Cache-Control: no-cache\r\n",
        "Connection: keep-alive\r\n",
        "Access-Control-Allow-Origin: *\r\n",
        "\r\n",
    );

    if stream.write_all(response.as_bytes()).is_err() {
        debug!("SSE: Failed to send headers");
        return None;
    }

    // Switch to non-blocking for the event loop
    stream.set_nonblocking(true).ok()?;
    stream.set_read_timeout(None).ok();
    stream.set_write_timeout(Some(Duration::from_secs(5))).ok();

    Some(stream)
}

/// Send data to a client, returns Ok if successful
fn send_to_client(client: &TcpStream, data: &[u8]) -> std::io::Result<()> {
    (&*client).write_all(data)?;
    (&*client).flush()
}
