use thiserror::Error;

use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("File of {file_size} bytes cannot be uploaded: {reason}")]
    Validation { file_size: u64, reason: String },

    #[error("Remote {op} failed: {reason}")]
    Transport { op: &'static str, reason: String },

    #[error("Remote state changed during {op}: {reason}")]
    Consistency { op: &'static str, reason: String },

    #[error("Another sync operation is already running")]
    SyncAlreadyRunning,

    #[error("Update queue is closed, request discarded")]
    QueueClosed,

    #[error("Sync engine is not running")]
    NotRunning,

    #[error("Sync engine is already started")]
    AlreadyStarted,

    #[error("Metadata store error: {0}")]
    Metadata(String),

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Command error: {0}")]
    Command(String),
}

impl SyncError {
    /// Wrap an object-store failure, tagging it with the operation that
    /// produced it. Missing remote state is a consistency outcome, not a
    /// transport failure.
    pub fn from_store(op: &'static str, err: StoreError) -> Self {
        match err {
            StoreError::NotFound(reason) => SyncError::Consistency { op, reason },
            StoreError::Transport(reason) => SyncError::Transport { op, reason },
        }
    }

    /// Returns a user-friendly suggestion for how to fix the error.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            SyncError::Validation { .. } => {
                Some("The file exceeds the project's upload limits. Split it or check `dxsync part-size`.")
            }
            SyncError::Transport { .. } => {
                Some("Local data is kept. The file is uploaded again after its next modification.")
            }
            SyncError::Consistency { .. } => {
                Some("The remote folder or object was changed concurrently. Refresh the mount.")
            }
            SyncError::SyncAlreadyRunning => Some("Wait for the running sync to finish."),
            SyncError::NotRunning => Some("Check that the filesystem is mounted."),
            SyncError::Config(_) => Some("Check the TOML syntax of the dxsync config file."),
            SyncError::Command(_) => {
                Some("Check the command server address with `--addr`.")
            }
            _ => None,
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Command(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::Config(format!("TOML parse error: {}", err))
    }
}
