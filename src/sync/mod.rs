pub mod attributes;
pub mod engine;
pub mod gate;
pub mod sweep;
pub mod token;
pub mod upload;

pub use engine::{SyncEngine, SyncReport};
pub use sweep::SweepReport;
