pub mod upgrade_lock;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::clock::{chrono_duration, Clock};
use crate::epoch::EpochParameters;
use crate::error::{Result, ResultExt, StrataError};
use crate::index::IndexVersion;
use crate::storage::BlobStorage;
use crate::util::duration_secs;

pub use upgrade_lock::UpgradeLockIntent;

pub const FORMAT_BLOB_ID: &str = "strata.repository";
pub const FORMAT_BACKUP_BLOB_ID: &str = "strata.repository.backup";
pub const BLOB_CFG_BLOB_ID: &str = "strata.blobcfg";
pub const KEY_BLOB_ID: &str = "strata.keys";

pub const FORMAT_VERSION: u32 = 1;
pub const HASH_ALGORITHM: &str = "blake2b-256-keyed";

/// How long a loaded format blob is trusted before re-reading it.
pub const FORMAT_CACHE_DURATION: Duration = Duration::from_secs(15 * 60);

pub const DEFAULT_MAX_PACK_SIZE: u64 = 20 * 1024 * 1024;
const MAX_PACK_SIZE_LIMIT: u64 = 512 * 1024 * 1024;

pub const FEATURE_INDEX_V1: &str = "index-v1";
pub const FEATURE_EPOCH_MANAGER: &str = "epoch-manager";
/// Features this build understands. A repository requiring anything else
/// is refused.
pub const SUPPORTED_FEATURES: &[&str] = &[FEATURE_INDEX_V1, FEATURE_EPOCH_MANAGER];

/// Parameters that may change over the life of a repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutableParameters {
    pub max_pack_size: u64,
    pub index_version: IndexVersion,
    pub epoch_parameters: EpochParameters,
}

impl Default for MutableParameters {
    fn default() -> Self {
        Self {
            max_pack_size: DEFAULT_MAX_PACK_SIZE,
            index_version: IndexVersion::V1,
            epoch_parameters: EpochParameters::default(),
        }
    }
}

impl MutableParameters {
    /// Parameters of a repository still on the flat legacy index.
    pub fn legacy() -> Self {
        Self {
            index_version: IndexVersion::V0,
            epoch_parameters: EpochParameters::disabled(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_pack_size == 0 || self.max_pack_size > MAX_PACK_SIZE_LIMIT {
            return Err(StrataError::Config(format!(
                "max_pack_size ({}) must be between 1 and {MAX_PACK_SIZE_LIMIT}",
                self.max_pack_size
            )));
        }
        if self.index_version == IndexVersion::V1 && !self.epoch_parameters.enabled {
            return Err(StrataError::Config(
                "index v1 requires epoch parameters to be enabled".into(),
            ));
        }
        self.epoch_parameters.validate()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionMode {
    #[default]
    None,
    Governance,
    Compliance,
}

/// Blob-store level settings, kept apart from the format blob.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobCfg {
    pub retention_mode: RetentionMode,
    #[serde(with = "duration_secs")]
    pub retention_period: Duration,
}

impl BlobCfg {
    pub fn retention(mode: RetentionMode, period: Duration) -> Self {
        Self {
            retention_mode: mode,
            retention_period: period,
        }
    }

    pub fn is_retention_enabled(&self) -> bool {
        self.retention_mode != RetentionMode::None && !self.retention_period.is_zero()
    }
}

/// The singleton format blob, stored as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatBlob {
    pub unique_id: String,
    pub format_version: u32,
    pub hash: String,
    pub encryption: String,
    pub parameters: MutableParameters,
    #[serde(default)]
    pub required_features: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgrade_lock: Option<UpgradeLockIntent>,
}

impl FormatBlob {
    pub fn new(encryption: &str, parameters: MutableParameters) -> Self {
        let mut id = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut id);
        let required_features = features_for(&parameters);
        Self {
            unique_id: hex::encode(id),
            format_version: FORMAT_VERSION,
            hash: HASH_ALGORITHM.to_string(),
            encryption: encryption.to_string(),
            parameters,
            required_features,
            upgrade_lock: None,
        }
    }

    /// Refuse repositories this build cannot safely write to.
    pub fn check_supported(&self) -> Result<()> {
        if self.format_version != FORMAT_VERSION {
            return Err(StrataError::UnsupportedVersion(self.format_version));
        }
        if let Some(missing) = self
            .required_features
            .iter()
            .find(|f| !SUPPORTED_FEATURES.contains(&f.as_str()))
        {
            return Err(StrataError::UnsupportedFeature(missing.clone()));
        }
        Ok(())
    }
}

/// Features a repository with these parameters requires of its clients.
pub fn features_for(params: &MutableParameters) -> Vec<String> {
    if params.index_version == IndexVersion::V1 {
        vec![FEATURE_INDEX_V1.to_string(), FEATURE_EPOCH_MANAGER.to_string()]
    } else {
        Vec::new()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SetParametersOptions {
    /// Acknowledge that turning blob retention off exposes old blobs to
    /// deletion.
    pub allow_retention_disable: bool,
}

struct CachedFormat {
    blob: FormatBlob,
    loaded_at: DateTime<Utc>,
}

/// Reads and updates the format blob, the blob configuration and the
/// upgrade lock they carry.
pub struct FormatManager {
    storage: Arc<dyn BlobStorage>,
    clock: Arc<dyn Clock>,
    cache_duration: Duration,
    cached: Mutex<Option<CachedFormat>>,
}

impl FormatManager {
    /// Write the format and blob configuration of a new repository.
    pub fn create(
        storage: Arc<dyn BlobStorage>,
        clock: Arc<dyn Clock>,
        blob: FormatBlob,
        blob_cfg: &BlobCfg,
    ) -> Result<Self> {
        if storage.exists(FORMAT_BLOB_ID)? {
            return Err(StrataError::RepoAlreadyExists(FORMAT_BLOB_ID.into()));
        }
        blob.parameters.validate()?;
        storage.put(BLOB_CFG_BLOB_ID, &serde_json::to_vec_pretty(blob_cfg)?)?;
        let manager = Self::new(storage, clock);
        manager.write_format(&blob)?;
        Ok(manager)
    }

    /// Open an existing repository's format blob.
    pub fn open(storage: Arc<dyn BlobStorage>, clock: Arc<dyn Clock>) -> Result<Self> {
        let manager = Self::new(storage, clock);
        let blob = manager.load_fresh()?;
        blob.check_supported()?;
        Ok(manager)
    }

    fn new(storage: Arc<dyn BlobStorage>, clock: Arc<dyn Clock>) -> Self {
        Self {
            storage,
            clock,
            cache_duration: FORMAT_CACHE_DURATION,
            cached: Mutex::new(None),
        }
    }

    pub fn with_cache_duration(mut self, duration: Duration) -> Self {
        self.cache_duration = duration;
        self
    }

    /// How long [`FormatManager::format`] trusts a loaded blob.
    pub fn cache_duration(&self) -> Duration {
        self.cache_duration
    }

    fn write_format(&self, blob: &FormatBlob) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(blob)?;
        self.storage
            .put(FORMAT_BLOB_ID, &bytes)
            .context("writing format blob")?;
        self.remember(blob.clone());
        Ok(())
    }

    fn remember(&self, blob: FormatBlob) {
        let loaded_at = self.clock.now();
        *self.cached.lock().unwrap_or_else(|e| e.into_inner()) =
            Some(CachedFormat { blob, loaded_at });
    }

    /// Read the format blob from the store, bypassing the cache.
    pub fn load_fresh(&self) -> Result<FormatBlob> {
        let bytes = self
            .storage
            .get(FORMAT_BLOB_ID)?
            .ok_or_else(|| StrataError::RepoNotFound(FORMAT_BLOB_ID.into()))?;
        let blob: FormatBlob = serde_json::from_slice(&bytes)
            .map_err(|e| StrataError::InvalidFormat(format!("format blob: {e}")))?;
        self.remember(blob.clone());
        Ok(blob)
    }

    /// The format blob, re-read once the cached copy is older than the
    /// cache duration.
    pub fn format(&self) -> Result<FormatBlob> {
        let now = self.clock.now();
        {
            let cached = self.cached.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(c) = cached.as_ref() {
                if now < c.loaded_at + chrono_duration(self.cache_duration) {
                    return Ok(c.blob.clone());
                }
            }
        }
        self.load_fresh()
    }

    pub fn refresh(&self) -> Result<FormatBlob> {
        self.load_fresh()
    }

    pub fn mutable_parameters(&self) -> Result<MutableParameters> {
        Ok(self.format()?.parameters)
    }

    pub fn required_features(&self) -> Result<Vec<String>> {
        Ok(self.format()?.required_features)
    }

    pub fn blob_cfg(&self) -> Result<BlobCfg> {
        match self.storage.get(BLOB_CFG_BLOB_ID)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| StrataError::InvalidFormat(format!("blob config: {e}"))),
            None => Ok(BlobCfg::default()),
        }
    }

    /// Replace the mutable parameters, blob configuration and required
    /// features in one step. An active upgrade lock is carried over.
    pub fn set_parameters(
        &self,
        params: MutableParameters,
        blob_cfg: BlobCfg,
        required_features: Vec<String>,
        opts: SetParametersOptions,
    ) -> Result<()> {
        let mut current = self.load_fresh()?;
        let current_cfg = self.blob_cfg()?;

        let mut features = required_features;
        features.sort();
        features.dedup();
        let mut current_features = current.required_features.clone();
        current_features.sort();

        if params == current.parameters && blob_cfg == current_cfg && features == current_features
        {
            return Err(StrataError::NoChanges);
        }
        if params.index_version < current.parameters.index_version {
            return Err(StrataError::IndexVersionDowngrade {
                from: current.parameters.index_version.into(),
                to: params.index_version.into(),
            });
        }
        params.validate()?;
        let weakens_retention = current_cfg.is_retention_enabled()
            && (!blob_cfg.is_retention_enabled()
                || blob_cfg.retention_period < current_cfg.retention_period);
        if weakens_retention && !opts.allow_retention_disable {
            return Err(StrataError::DangerousOperation(
                "disabling or shortening blob retention requires explicit acknowledgement".into(),
            ));
        }
        if let Some(unknown) = features
            .iter()
            .find(|f| !SUPPORTED_FEATURES.contains(&f.as_str()))
        {
            return Err(StrataError::UnsupportedFeature(unknown.clone()));
        }

        if blob_cfg != current_cfg {
            self.storage
                .put(BLOB_CFG_BLOB_ID, &serde_json::to_vec_pretty(&blob_cfg)?)
                .context("writing blob configuration")?;
        }
        current.parameters = params;
        current.required_features = features;
        self.write_format(&current)?;
        info!(
            index_version = ?current.parameters.index_version,
            "updated repository parameters"
        );
        Ok(())
    }

    /// Place an upgrade lock. Setting the same intent again is a no-op that
    /// returns the stored lock; any other intent fails while a lock is held.
    pub fn set_upgrade_lock_intent(&self, intent: UpgradeLockIntent) -> Result<UpgradeLockIntent> {
        intent.validate()?;
        let mut current = self.load_fresh()?;
        if let Some(existing) = &current.upgrade_lock {
            if existing.same_intent(&intent) {
                debug!(owner = %existing.owner_id, "upgrade lock already set by this owner");
                return Ok(existing.clone());
            }
            return Err(StrataError::UpgradeLockAlreadyHeld(existing.owner_id.clone()));
        }

        let backup = serde_json::to_vec_pretty(&current)?;
        self.storage
            .put(FORMAT_BACKUP_BLOB_ID, &backup)
            .context("writing format backup")?;
        current.upgrade_lock = Some(intent.clone());
        self.write_format(&current)?;
        info!(
            owner = %intent.owner_id,
            upgrade_time = %intent.upgrade_time(),
            "upgrade lock intent set"
        );
        Ok(intent)
    }

    /// The current lock, always read from the store.
    pub fn upgrade_lock_intent(&self) -> Result<Option<UpgradeLockIntent>> {
        Ok(self.load_fresh()?.upgrade_lock)
    }

    /// The format blob as it was before the current lock was set.
    pub fn format_backup(&self) -> Result<Option<FormatBlob>> {
        let Some(bytes) = self.storage.get(FORMAT_BACKUP_BLOB_ID)? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StrataError::InvalidFormat(format!("format backup: {e}")))
    }

    /// Clear the lock and discard the rollback backup. Irreversible.
    pub fn commit_upgrade(&self) -> Result<()> {
        let mut current = self.load_fresh()?;
        if current.upgrade_lock.take().is_none() {
            return Err(StrataError::UpgradeLockNotHeld);
        }
        self.write_format(&current)?;
        self.storage.delete(FORMAT_BACKUP_BLOB_ID)?;
        info!("upgrade committed");
        Ok(())
    }

    /// Restore the format blob saved when the lock was set.
    pub fn rollback_upgrade(&self) -> Result<()> {
        let Some(restored) = self.format_backup()? else {
            let mut current = self.load_fresh()?;
            if current.upgrade_lock.take().is_none() {
                return Err(StrataError::UpgradeLockNotHeld);
            }
            self.write_format(&current)?;
            return Ok(());
        };
        self.write_format(&restored)?;
        self.storage.delete(FORMAT_BACKUP_BLOB_ID)?;
        info!("upgrade rolled back");
        Ok(())
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}
