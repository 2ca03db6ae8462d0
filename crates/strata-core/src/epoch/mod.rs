mod manager;
pub mod naming;
mod parameters;
mod snapshot;

pub use manager::{CleanupStats, EpochManager, MaintenanceStats};
pub use parameters::EpochParameters;
pub use snapshot::{CurrentSnapshot, RangeCheckpoint};
