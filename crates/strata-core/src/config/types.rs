use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::defaults::*;
use crate::compress::Compression;
use crate::content::RecoverOptions;
use crate::crypto::EncryptionMode;
use crate::epoch::EpochParameters;
use crate::error::Result;
use crate::upgrade::UpgradeOptions;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrataConfig {
    pub repository: RepositoryConfig,
    #[serde(default)]
    pub encryption: EncryptionConfig,
    #[serde(default)]
    pub compression: CompressionConfig,
    #[serde(default)]
    pub epoch: EpochConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub upgrade: UpgradeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// `memory://`, `file:///path` or a plain directory path.
    pub url: String,
    /// Local directory for the index blob cache. No cache when unset.
    pub cache_dir: Option<String>,
    #[serde(default = "default_max_pack_size")]
    pub max_pack_size: u64,
}

impl RepositoryConfig {
    pub fn cache_path(&self) -> Option<PathBuf> {
        self.cache_dir.as_deref().map(PathBuf::from)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionConfig {
    #[serde(default = "default_encryption_mode")]
    pub mode: String,
    pub passphrase: Option<String>,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            mode: default_encryption_mode(),
            passphrase: None,
        }
    }
}

impl EncryptionConfig {
    pub fn encryption_mode(&self) -> Result<EncryptionMode> {
        EncryptionMode::parse(&self.mode)
    }

    /// The configured passphrase, falling back to the environment.
    pub fn resolve_passphrase(&self) -> Option<String> {
        self.passphrase
            .clone()
            .or_else(|| std::env::var(super::PASSPHRASE_ENV_VAR).ok())
            .filter(|p| !p.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
    #[serde(default = "default_zstd_level")]
    pub zstd_level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            algorithm: default_algorithm(),
            zstd_level: default_zstd_level(),
        }
    }
}

impl CompressionConfig {
    pub fn to_compression(&self) -> Result<Compression> {
        Compression::from_config(&self.algorithm, self.zstd_level)
    }
}

/// Overrides applied on top of the default epoch parameters when a
/// repository is created or upgraded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EpochConfig {
    pub min_epoch_duration: Option<String>,
    pub refresh_frequency: Option<String>,
    pub full_checkpoint_frequency: Option<u64>,
    pub cleanup_safety_margin: Option<String>,
    pub advance_on_count: Option<usize>,
    pub advance_on_size_bytes: Option<u64>,
    pub delete_parallelism: Option<usize>,
}

impl EpochConfig {
    pub fn to_parameters(&self) -> Result<EpochParameters> {
        let mut params = EpochParameters::default();
        if let Some(raw) = &self.min_epoch_duration {
            params.min_epoch_duration = parse_human_duration(raw)?;
        }
        if let Some(raw) = &self.refresh_frequency {
            params.epoch_refresh_frequency = parse_human_duration(raw)?;
        }
        if let Some(n) = self.full_checkpoint_frequency {
            params.full_checkpoint_frequency = n;
        }
        if let Some(raw) = &self.cleanup_safety_margin {
            params.cleanup_safety_margin = parse_human_duration(raw)?;
        }
        if let Some(n) = self.advance_on_count {
            params.epoch_advance_on_count_threshold = n;
        }
        if let Some(n) = self.advance_on_size_bytes {
            params.epoch_advance_on_total_size_bytes_threshold = n;
        }
        if let Some(n) = self.delete_parallelism {
            params.delete_parallelism = n;
        }
        params.validate()?;
        Ok(params)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    #[serde(default = "default_recovery_parallelism")]
    pub parallelism: usize,
    #[serde(default)]
    pub ignore_errors: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            parallelism: default_recovery_parallelism(),
            ignore_errors: false,
        }
    }
}

impl RecoveryConfig {
    pub fn to_options(&self, commit: bool) -> RecoverOptions {
        RecoverOptions {
            parallelism: self.parallelism.max(1),
            ignore_errors: self.ignore_errors,
            commit,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpgradeConfig {
    #[serde(default = "default_io_drain_timeout")]
    pub io_drain_timeout: String,
    #[serde(default = "default_status_poll_interval")]
    pub status_poll_interval: String,
    #[serde(default = "default_max_clock_drift")]
    pub max_permitted_clock_drift: String,
    /// Unset means the lock takes effect immediately.
    pub advance_notice: Option<String>,
    #[serde(default)]
    pub allow_unsafe_drain_timeout: bool,
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            io_drain_timeout: default_io_drain_timeout(),
            status_poll_interval: default_status_poll_interval(),
            max_permitted_clock_drift: default_max_clock_drift(),
            advance_notice: None,
            allow_unsafe_drain_timeout: false,
        }
    }
}

impl UpgradeConfig {
    pub fn to_options(
        &self,
        owner_id: &str,
        message: &str,
        epoch_parameters: EpochParameters,
    ) -> Result<UpgradeOptions> {
        let advance_notice = match &self.advance_notice {
            Some(raw) => parse_human_duration(raw)?,
            None => Duration::ZERO,
        };
        Ok(UpgradeOptions {
            owner_id: owner_id.to_string(),
            advance_notice,
            io_drain_timeout: parse_human_duration(&self.io_drain_timeout)?,
            status_poll_interval: parse_human_duration(&self.status_poll_interval)?,
            max_permitted_clock_drift: parse_human_duration(&self.max_permitted_clock_drift)?,
            message: message.to_string(),
            allow_unsafe_drain_timeout: self.allow_unsafe_drain_timeout,
            epoch_parameters,
        })
    }
}
