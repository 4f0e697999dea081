pub mod paths;
pub mod types;

pub use paths::load_config;
pub use types::{SyncConfig, Verbosity};
