//! TCP control endpoint.
//!
//! Serves the one control operation the session supports: "save map". The
//! wire format is a 4-byte big-endian length prefix followed by a JSON body,
//! in both directions:
//!
//! - request:  `{"command": "save_map"}`
//! - response: `{"ok": true}`
//!
//! The endpoint runs on its own thread and executes the save synchronously,
//! so a response is only sent after the persist has finished. Mutual
//! exclusion against shutdown-time saves is the coordinator's job; joining
//! this thread therefore waits out any in-flight save.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::saver::SaveCoordinator;

/// Upper bound on a control frame body.
const MAX_FRAME_LEN: usize = 4096;

#[derive(Debug, Deserialize)]
struct ControlRequest {
    command: String,
}

#[derive(Debug, Serialize)]
struct ControlResponse {
    ok: bool,
}

/// Control endpoint thread handle.
pub struct ControlServer {
    handle: JoinHandle<()>,
    local_addr: SocketAddr,
}

impl ControlServer {
    /// Bind the endpoint and spawn its thread. Port 0 binds an OS-assigned
    /// port (see [`ControlServer::local_addr`]).
    pub fn spawn(
        port: u16,
        coordinator: Arc<SaveCoordinator>,
        running: Arc<AtomicBool>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        let local_addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let handle = thread::Builder::new()
            .name("control".into())
            .spawn(move || run_control_loop(listener, coordinator, running))
            .expect("Failed to spawn control thread");

        Ok(Self { handle, local_addr })
    }

    /// Address the endpoint is actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the thread to finish (it exits when the running flag clears).
    pub fn join(self) -> thread::Result<()> {
        self.handle.join()
    }
}

fn run_control_loop(
    listener: TcpListener,
    coordinator: Arc<SaveCoordinator>,
    running: Arc<AtomicBool>,
) {
    log::info!(
        "Control endpoint listening on {}",
        listener.local_addr().map(|a| a.to_string()).unwrap_or_default()
    );

    while running.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, addr)) => {
                log::info!("Control client connected: {}", addr);
                handle_client(stream, addr, &coordinator, &running);
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                log::warn!("Control accept failed: {}", e);
                thread::sleep(Duration::from_millis(50));
            }
        }
    }

    log::info!("Control endpoint stopped");
}

/// Serve framed requests on one connection until it closes.
fn handle_client(
    mut stream: TcpStream,
    addr: SocketAddr,
    coordinator: &SaveCoordinator,
    running: &AtomicBool,
) {
    stream.set_nonblocking(false).ok();
    stream
        .set_read_timeout(Some(Duration::from_millis(500)))
        .ok();

    while running.load(Ordering::Relaxed) {
        let request = match read_frame(&mut stream) {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(FrameError::Timeout) => continue,
            Err(FrameError::Closed) => break,
        };

        let ok = match request.command.as_str() {
            "save_map" => coordinator.request_save(),
            other => {
                log::warn!("Unknown control command from {}: {:?}", addr, other);
                false
            }
        };

        if !write_frame(&mut stream, &ControlResponse { ok }) {
            break;
        }
    }

    log::info!("Control client disconnected: {}", addr);
}

enum FrameError {
    /// No frame arrived within the read timeout; the connection is fine.
    Timeout,
    /// Connection closed or unusable.
    Closed,
}

fn read_frame(stream: &mut TcpStream) -> std::result::Result<Option<ControlRequest>, FrameError> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(ref e)
            if e.kind() == std::io::ErrorKind::WouldBlock
                || e.kind() == std::io::ErrorKind::TimedOut =>
        {
            return Err(FrameError::Timeout);
        }
        Err(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(_) => return Err(FrameError::Closed),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 || len > MAX_FRAME_LEN {
        log::warn!("Control client sent invalid frame length {}", len);
        return Err(FrameError::Closed);
    }

    let mut body = vec![0u8; len];
    if stream.read_exact(&mut body).is_err() {
        return Err(FrameError::Closed);
    }

    match serde_json::from_slice(&body) {
        Ok(request) => Ok(Some(request)),
        Err(e) => {
            log::warn!("Invalid control request: {}", e);
            Err(FrameError::Closed)
        }
    }
}

fn write_frame(stream: &mut TcpStream, response: &ControlResponse) -> bool {
    let body = match serde_json::to_vec(response) {
        Ok(body) => body,
        Err(e) => {
            log::error!("Failed to encode control response: {}", e);
            return false;
        }
    };
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    stream.write_all(&frame).and_then(|_| stream.flush()).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::engine::{MapBuilder, SensorFrame};
    use crate::saver::SaveCoordinator;

    fn send_command(addr: SocketAddr, command: &str) -> bool {
        let mut stream = TcpStream::connect(("127.0.0.1", addr.port())).unwrap();
        let body = serde_json::to_vec(&serde_json::json!({ "command": command })).unwrap();
        let mut frame = Vec::new();
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(&body);
        stream.write_all(&frame).unwrap();

        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).unwrap();
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut response = vec![0u8; len];
        stream.read_exact(&mut response).unwrap();
        serde_json::from_slice::<serde_json::Value>(&response).unwrap()["ok"]
            .as_bool()
            .unwrap()
    }

    fn spawn_server(folder: Option<std::path::PathBuf>) -> (ControlServer, Arc<AtomicBool>) {
        let mut builder = MapBuilder::new(None);
        for i in 0..20u64 {
            builder.process(&SensorFrame::Image {
                timestamp_us: 1_000 + i * 50_000,
                camera_index: 0,
            });
        }
        let coordinator = Arc::new(SaveCoordinator::new(
            Arc::new(Mutex::new(builder)),
            folder,
            false,
        ));
        let running = Arc::new(AtomicBool::new(true));
        let server = ControlServer::spawn(0, coordinator, running.clone()).unwrap();
        (server, running)
    }

    #[test]
    fn test_save_map_command_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let (server, running) = spawn_server(Some(dir.path().join("map")));

        assert!(send_command(server.local_addr(), "save_map"));
        assert!(dir.path().join("map").join("map.yaml").exists());

        running.store(false, Ordering::Relaxed);
        server.join().unwrap();
    }

    #[test]
    fn test_save_map_without_folder_reports_failure() {
        let (server, running) = spawn_server(None);

        assert!(!send_command(server.local_addr(), "save_map"));

        running.store(false, Ordering::Relaxed);
        server.join().unwrap();
    }

    #[test]
    fn test_unknown_command_reports_failure() {
        let (server, running) = spawn_server(None);

        assert!(!send_command(server.local_addr(), "reticulate"));

        running.store(false, Ordering::Relaxed);
        server.join().unwrap();
    }
}
