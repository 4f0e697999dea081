use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Verbosity level controlling tracing output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    /// Suppress all output except errors
    Quiet,
    /// Normal output (info level)
    Normal,
    /// Verbose output (debug level), per-file and per-chunk progress
    Verbose,
    /// Maximum output (trace level)
    Trace,
}

impl From<(bool, u8)> for Verbosity {
    /// Convert from (quiet_flag, verbose_count) to Verbosity.
    ///
    /// - quiet=true -> Quiet (regardless of verbose count)
    /// - verbose=0  -> Normal
    /// - verbose=1  -> Verbose
    /// - verbose=2+ -> Trace
    fn from((quiet, verbose_count): (bool, u8)) -> Self {
        if quiet {
            Verbosity::Quiet
        } else {
            match verbose_count {
                0 => Verbosity::Normal,
                1 => Verbosity::Verbose,
                _ => Verbosity::Trace,
            }
        }
    }
}

impl Verbosity {
    /// Return the tracing filter string for this verbosity level.
    pub fn as_tracing_filter(&self) -> &'static str {
        match self {
            Verbosity::Quiet => "error",
            Verbosity::Normal => "info",
            Verbosity::Verbose => "debug",
            Verbosity::Trace => "trace",
        }
    }
}

pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_WAKE_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_FILE_WORKERS: usize = 4;
pub const DEFAULT_CHUNK_WORKERS: usize = 8;
pub const DEFAULT_CHUNK_QUEUE_CAPACITY: usize = 10;
pub const DEFAULT_COMMAND_ADDR: &str = "127.0.0.1:7077";

/// Tunables of the synchronization engine.
///
/// Every field has a default, so a config file only needs the keys it
/// changes:
///
/// ```toml
/// sweep_interval_secs = 120
/// chunk_workers = 16
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Seconds between two periodic sweeps of inactive dirty files.
    pub sweep_interval_secs: u64,
    /// Sweeper tick; bounds how long a stop request waits.
    pub wake_interval_ms: u64,
    /// Threads orchestrating whole-file updates.
    pub file_workers: usize,
    /// Threads uploading individual parts.
    pub chunk_workers: usize,
    /// Parts buffered between the file workers and the chunk workers.
    pub chunk_queue_capacity: usize,
    /// Address the command server listens on.
    pub command_addr: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            wake_interval_ms: DEFAULT_WAKE_INTERVAL_MS,
            file_workers: DEFAULT_FILE_WORKERS,
            chunk_workers: DEFAULT_CHUNK_WORKERS,
            chunk_queue_capacity: DEFAULT_CHUNK_QUEUE_CAPACITY,
            command_addr: DEFAULT_COMMAND_ADDR.to_string(),
        }
    }
}

impl SyncConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn wake_interval(&self) -> Duration {
        Duration::from_millis(self.wake_interval_ms.max(1))
    }

    pub fn file_workers(&self) -> usize {
        self.file_workers.max(1)
    }

    pub fn chunk_workers(&self) -> usize {
        self.chunk_workers.max(1)
    }

    /// The chunk queue holds at least one part per chunk worker, so no
    /// worker idles while file workers are still reading.
    pub fn chunk_queue_capacity(&self) -> usize {
        self.chunk_queue_capacity.max(self.chunk_workers())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_from_flags() {
        assert_eq!(Verbosity::from((true, 3)), Verbosity::Quiet);
        assert_eq!(Verbosity::from((false, 0)), Verbosity::Normal);
        assert_eq!(Verbosity::from((false, 1)), Verbosity::Verbose);
        assert_eq!(Verbosity::from((false, 2)), Verbosity::Trace);
        assert_eq!(Verbosity::Verbose.as_tracing_filter(), "debug");
    }

    #[test]
    fn chunk_queue_never_smaller_than_worker_count() {
        let config = SyncConfig {
            chunk_workers: 32,
            chunk_queue_capacity: 10,
            ..SyncConfig::default()
        };
        assert_eq!(config.chunk_queue_capacity(), 32);
        assert_eq!(SyncConfig::default().chunk_queue_capacity(), 10);
    }

    #[test]
    fn zero_worker_counts_are_clamped() {
        let config = SyncConfig {
            file_workers: 0,
            chunk_workers: 0,
            wake_interval_ms: 0,
            ..SyncConfig::default()
        };
        assert_eq!(config.file_workers(), 1);
        assert_eq!(config.chunk_workers(), 1);
        assert_eq!(config.wake_interval(), Duration::from_millis(1));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: SyncConfig = toml::from_str("chunk_workers = 16\n").unwrap();
        assert_eq!(config.chunk_workers, 16);
        assert_eq!(config.file_workers, DEFAULT_FILE_WORKERS);
        assert_eq!(config.sweep_interval(), Duration::from_secs(60));
    }
}
