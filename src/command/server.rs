//! Line-oriented TCP transport for [`Command`]s.
//!
//! One request per connection. Every connection gets its own thread, so a
//! `stats` request is answered while a `sync` is still draining, and a
//! second `sync` reaches the engine's gate and is turned away.

use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::error::SyncError;
use crate::sync::SyncEngine;

use super::{dispatch, Command, Reply};

pub struct CommandServer {
    local_addr: SocketAddr,
    stopping: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl CommandServer {
    /// Listen on `addr` and serve commands against `engine` until shut down.
    pub fn bind(addr: &str, engine: Arc<SyncEngine>) -> Result<Self, SyncError> {
        let listener = TcpListener::bind(addr)
            .map_err(|e| SyncError::Command(format!("cannot listen on {}: {}", addr, e)))?;
        let local_addr = listener.local_addr()?;
        let stopping = Arc::new(AtomicBool::new(false));

        let handle = {
            let stopping = Arc::clone(&stopping);
            thread::Builder::new()
                .name("command-server".to_string())
                .spawn(move || accept_loop(listener, engine, stopping))?
        };

        tracing::info!(addr = %local_addr, "Command server listening");
        Ok(Self {
            local_addr,
            stopping,
            handle: Some(handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections. Requests already accepted finish on
    /// their own threads.
    pub fn shutdown(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.stopping.store(true, Ordering::SeqCst);
        // Wake the blocking accept.
        let _ = TcpStream::connect(self.local_addr);
        if handle.join().is_err() {
            tracing::error!("Command server thread panicked");
        }
        tracing::debug!("Command server stopped");
    }
}

impl Drop for CommandServer {
    fn drop(&mut self) {
        self.halt();
    }
}

fn accept_loop(listener: TcpListener, engine: Arc<SyncEngine>, stopping: Arc<AtomicBool>) {
    for stream in listener.incoming() {
        if stopping.load(Ordering::SeqCst) {
            break;
        }
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!("Failed to accept command connection: {}", e);
                continue;
            }
        };
        let engine = Arc::clone(&engine);
        let spawned = thread::Builder::new()
            .name("command-conn".to_string())
            .spawn(move || {
                if let Err(e) = serve_connection(stream, &engine) {
                    tracing::warn!("Command connection failed: {}", e);
                }
            });
        if let Err(e) = spawned {
            tracing::error!("Failed to spawn command handler: {}", e);
        }
    }
}

fn serve_connection(stream: TcpStream, engine: &SyncEngine) -> Result<(), SyncError> {
    let peer = stream.peer_addr()?;
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Ok(());
    }

    let reply = match serde_json::from_str::<Command>(line.trim()) {
        Ok(command) => {
            tracing::info!(%peer, ?command, "Command received");
            dispatch(engine, command)
        }
        Err(e) => {
            tracing::warn!(%peer, "Malformed command: {}", e);
            Reply::Error {
                message: format!("malformed command: {}", e),
            }
        }
    };
    write_line(&stream, &reply)
}

fn write_line<T: serde::Serialize>(mut stream: &TcpStream, value: &T) -> Result<(), SyncError> {
    let mut encoded = serde_json::to_string(value)?;
    encoded.push('\n');
    stream.write_all(encoded.as_bytes())?;
    stream.flush()?;
    Ok(())
}

/// Send `command` to the server at `addr` and wait for its reply.
pub fn send_command(addr: &str, command: Command) -> Result<Reply, SyncError> {
    let stream = TcpStream::connect(addr)
        .map_err(|e| SyncError::Command(format!("cannot connect to {}: {}", addr, e)))?;
    write_line(&stream, &command)?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Err(SyncError::Command(
            "server closed the connection without replying".to_string(),
        ));
    }
    Ok(serde_json::from_str(line.trim())?)
}
