use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tracing::{debug, info};

use crate::clock::Clock;
use crate::compress::Compression;
use crate::config::StrataConfig;
use crate::content::{ContentManager, ContentManagerOptions};
use crate::crypto::key::{KeyFile, MasterKey};
use crate::crypto::{CryptoEngine, EncryptionMode};
use crate::epoch::EpochManager;
use crate::error::{Result, ResultExt, StrataError};
use crate::format::{BlobCfg, FormatBlob, FormatManager, MutableParameters, KEY_BLOB_ID};
use crate::index::{IndexBlobIo, MetadataCache};
use crate::storage::{backend_from_url, BlobStorage, RetentionBackend};
use crate::upgrade::{UpgradeOptions, UpgradeStateMachine};

/// Everything fixed at creation time.
#[derive(Debug, Clone)]
pub struct InitOptions {
    pub encryption: EncryptionMode,
    pub passphrase: Option<String>,
    pub parameters: MutableParameters,
    pub blob_cfg: BlobCfg,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            encryption: EncryptionMode::None,
            passphrase: None,
            parameters: MutableParameters::default(),
            blob_cfg: BlobCfg::default(),
        }
    }
}

#[derive(Clone, Default)]
pub struct OpenOptions {
    pub passphrase: Option<String>,
    /// Root of the local index blob cache. A subdirectory per repository
    /// is used beneath it.
    pub cache_dir: Option<PathBuf>,
    pub compression: Compression,
    pub shutdown: Option<Arc<AtomicBool>>,
}

/// A handle to an opened repository.
pub struct Repository {
    storage: Arc<dyn BlobStorage>,
    crypto: Arc<dyn CryptoEngine>,
    format: Arc<FormatManager>,
    clock: Arc<dyn Clock>,
    cache: Option<Arc<MetadataCache>>,
    shutdown: Option<Arc<AtomicBool>>,
    content: ContentManager,
}

impl Repository {
    /// Create a new repository and open it.
    pub fn init(
        storage: Arc<dyn BlobStorage>,
        clock: Arc<dyn Clock>,
        init: &InitOptions,
        opts: OpenOptions,
    ) -> Result<Self> {
        if storage.exists(KEY_BLOB_ID)? {
            return Err(StrataError::RepoAlreadyExists(KEY_BLOB_ID.into()));
        }
        init.parameters.validate()?;

        let master = MasterKey::generate();
        let key_file = KeyFile::create(init.encryption, &master, init.passphrase.as_deref())?;
        let blob = FormatBlob::new(init.encryption.as_str(), init.parameters.clone());
        FormatManager::create(storage.clone(), clock.clone(), blob, &init.blob_cfg)
            .context("writing format blob")?;
        storage
            .put(KEY_BLOB_ID, &serde_json::to_vec_pretty(&key_file)?)
            .context("writing key blob")?;
        info!(
            encryption = init.encryption.as_str(),
            index_version = ?init.parameters.index_version,
            "repository initialized"
        );

        let opts = OpenOptions {
            passphrase: opts.passphrase.or_else(|| init.passphrase.clone()),
            ..opts
        };
        Self::open(storage, clock, opts)
    }

    /// Open an existing repository.
    pub fn open(
        storage: Arc<dyn BlobStorage>,
        clock: Arc<dyn Clock>,
        opts: OpenOptions,
    ) -> Result<Self> {
        let key_bytes = storage
            .get(KEY_BLOB_ID)?
            .ok_or_else(|| StrataError::RepoNotFound(KEY_BLOB_ID.into()))?;
        let key_file: KeyFile = serde_json::from_slice(&key_bytes)
            .map_err(|e| StrataError::InvalidFormat(format!("key blob: {e}")))?;
        let crypto = key_file.open_engine(opts.passphrase.as_deref())?;

        let format = FormatManager::open(storage.clone(), clock.clone())?;
        let blob = format.format()?;
        let blob_cfg = format.blob_cfg()?;
        let format = Arc::new(format);

        // Format and key blobs are rewritten in place, so only the data
        // path goes through the retention guard.
        let data_storage: Arc<dyn BlobStorage> = if blob_cfg.is_retention_enabled() {
            debug!(
                period_secs = blob_cfg.retention_period.as_secs(),
                "blob retention enabled"
            );
            Arc::new(RetentionBackend::new(
                storage,
                blob_cfg.retention_period,
                clock.clone(),
            ))
        } else {
            storage
        };

        let cache = match &opts.cache_dir {
            Some(dir) => Some(Arc::new(MetadataCache::open(dir.join(&blob.unique_id))?)),
            None => None,
        };

        let content = ContentManager::open(
            data_storage.clone(),
            crypto.clone(),
            format.clone(),
            clock.clone(),
            ContentManagerOptions {
                compression: opts.compression,
                cache: cache.clone(),
                shutdown: opts.shutdown.clone(),
            },
        )?;

        Ok(Self {
            storage: data_storage,
            crypto,
            format,
            clock,
            cache,
            shutdown: opts.shutdown,
            content,
        })
    }

    /// Open the repository a config file points at.
    pub fn open_from_config(
        config: &StrataConfig,
        clock: Arc<dyn Clock>,
        shutdown: Option<Arc<AtomicBool>>,
    ) -> Result<Self> {
        let storage = backend_from_url(&config.repository.url)?;
        Self::open(storage, clock, open_options(config, shutdown)?)
    }

    /// Create the repository a config file points at.
    pub fn init_from_config(
        config: &StrataConfig,
        clock: Arc<dyn Clock>,
        parameters: MutableParameters,
        blob_cfg: BlobCfg,
        shutdown: Option<Arc<AtomicBool>>,
    ) -> Result<Self> {
        let storage = backend_from_url(&config.repository.url)?;
        let init = InitOptions {
            encryption: config.encryption.encryption_mode()?,
            passphrase: config.encryption.resolve_passphrase(),
            parameters,
            blob_cfg,
        };
        Self::init(storage, clock, &init, open_options(config, shutdown)?)
    }

    pub fn storage(&self) -> &Arc<dyn BlobStorage> {
        &self.storage
    }

    pub fn crypto(&self) -> &Arc<dyn CryptoEngine> {
        &self.crypto
    }

    pub fn format(&self) -> &Arc<FormatManager> {
        &self.format
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn content(&self) -> &ContentManager {
        &self.content
    }

    pub fn content_mut(&mut self) -> &mut ContentManager {
        &mut self.content
    }

    pub fn epoch_manager(&self) -> Result<Arc<EpochManager>> {
        self.content.epoch_manager()
    }

    /// Raw index blob access sharing the repository's cache.
    pub fn index_io(&self) -> IndexBlobIo {
        IndexBlobIo::new(self.storage.clone(), self.crypto.clone(), self.cache.clone())
    }

    /// A state machine that upgrades this repository's index format.
    pub fn upgrade(&self, opts: UpgradeOptions) -> UpgradeStateMachine {
        let machine = UpgradeStateMachine::new(
            self.format.clone(),
            self.index_io(),
            self.clock.clone(),
            opts,
        );
        match &self.shutdown {
            Some(flag) => machine.with_shutdown(flag.clone()),
            None => machine,
        }
    }

    /// Flush pending writes. Call before dropping the handle.
    pub fn close(mut self) -> Result<()> {
        self.content.flush()?;
        Ok(())
    }
}

fn open_options(config: &StrataConfig, shutdown: Option<Arc<AtomicBool>>) -> Result<OpenOptions> {
    Ok(OpenOptions {
        passphrase: config.encryption.resolve_passphrase(),
        cache_dir: config.repository.cache_path(),
        compression: config.compression.to_compression()?,
        shutdown,
    })
}
