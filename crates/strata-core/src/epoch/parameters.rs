use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StrataError};
use crate::util::duration_secs;

const MIN_EPOCH_DURATION_FLOOR: Duration = Duration::from_secs(10 * 60);
const MIN_COUNT_THRESHOLD: usize = 10;
const MIN_SIZE_THRESHOLD: u64 = 1024 * 1024;

/// Tuning for epoch advancement, compaction and cleanup. Persisted in the
/// format blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochParameters {
    pub enabled: bool,
    /// An epoch cannot advance until its blobs span at least this long.
    #[serde(with = "duration_secs")]
    pub min_epoch_duration: Duration,
    /// How long a loaded snapshot of the epoch state is trusted.
    #[serde(with = "duration_secs")]
    pub epoch_refresh_frequency: Duration,
    /// Settled epochs needed past the last range checkpoint before a new
    /// one is generated.
    pub full_checkpoint_frequency: u64,
    /// Grace period before superseded blobs are deleted, protecting
    /// readers that listed them earlier.
    #[serde(with = "duration_secs")]
    pub cleanup_safety_margin: Duration,
    pub epoch_advance_on_count_threshold: usize,
    pub epoch_advance_on_total_size_bytes_threshold: u64,
    pub delete_parallelism: usize,
}

impl Default for EpochParameters {
    fn default() -> Self {
        Self {
            enabled: true,
            min_epoch_duration: Duration::from_secs(24 * 60 * 60),
            epoch_refresh_frequency: Duration::from_secs(20 * 60),
            full_checkpoint_frequency: 7,
            cleanup_safety_margin: Duration::from_secs(4 * 60 * 60),
            epoch_advance_on_count_threshold: 20,
            epoch_advance_on_total_size_bytes_threshold: 10 * 1024 * 1024,
            delete_parallelism: 4,
        }
    }
}

impl EpochParameters {
    /// Parameters of a legacy (V0) repository.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let invalid = |msg: String| Err(StrataError::Config(format!("epoch parameters: {msg}")));
        if self.min_epoch_duration < MIN_EPOCH_DURATION_FLOOR {
            return invalid(format!(
                "min_epoch_duration must be at least {}s",
                MIN_EPOCH_DURATION_FLOOR.as_secs()
            ));
        }
        if self.epoch_refresh_frequency.is_zero()
            || self.epoch_refresh_frequency * 3 > self.min_epoch_duration
        {
            return invalid(
                "epoch_refresh_frequency must be non-zero and at most a third of min_epoch_duration"
                    .into(),
            );
        }
        if self.full_checkpoint_frequency == 0 {
            return invalid("full_checkpoint_frequency must be positive".into());
        }
        if self.cleanup_safety_margin < self.epoch_refresh_frequency * 3 {
            return invalid(
                "cleanup_safety_margin must be at least three refresh periods".into(),
            );
        }
        if self.epoch_advance_on_count_threshold < MIN_COUNT_THRESHOLD {
            return invalid(format!(
                "epoch_advance_on_count_threshold must be at least {MIN_COUNT_THRESHOLD}"
            ));
        }
        if self.epoch_advance_on_total_size_bytes_threshold < MIN_SIZE_THRESHOLD {
            return invalid(format!(
                "epoch_advance_on_total_size_bytes_threshold must be at least {MIN_SIZE_THRESHOLD}"
            ));
        }
        if self.delete_parallelism == 0 {
            return invalid("delete_parallelism must be positive".into());
        }
        Ok(())
    }
}
