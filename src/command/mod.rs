//! Commands accepted from outside the process.
//!
//! Each command is a variant of [`Command`] and is handled by a fixed
//! `match` in [`dispatch`]. On the wire both commands and replies are one
//! JSON object per line, e.g. `{"command":"sync"}`.
//!
//! The process that owns the mount and its [`SyncEngine`] embeds
//! [`CommandServer`]. The `dxsync` binary is only a client: its `sync` and
//! `stats` subcommands go through [`send_command`].

pub mod server;

use serde::{Deserialize, Serialize};

use crate::sync::{SyncEngine, SyncReport};
use crate::transfer::stats::StatsSnapshot;

pub use server::{send_command, CommandServer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    /// Flush every dirty file and wait for the uploads.
    Sync,
    /// Report the engine's counters.
    Stats,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Reply {
    Synced(SyncReport),
    Stats(StatsSnapshot),
    Error { message: String },
}

/// Run `command` against `engine`. Blocks for as long as the command does.
pub fn dispatch(engine: &SyncEngine, command: Command) -> Reply {
    match command {
        Command::Sync => match engine.trigger_explicit_sync() {
            Ok(report) => Reply::Synced(report),
            Err(e) => {
                tracing::warn!("Sync command rejected: {}", e);
                Reply::Error {
                    message: e.to_string(),
                }
            }
        },
        Command::Stats => Reply::Stats(engine.stats()),
    }
}
