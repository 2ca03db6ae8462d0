use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::clock::{Clock, ManualClock};
use crate::content::CONTENT_FORMAT_VERSION;
use crate::crypto::{CryptoEngine, PlaintextEngine};
use crate::epoch::{EpochManager, EpochParameters};
use crate::format::{BlobCfg, MutableParameters};
use crate::index::{ContentInfo, IndexBlobIo};
use crate::repo::{InitOptions, OpenOptions, Repository};
use crate::storage::MemoryBackend;
use strata_types::{BlobId, ContentId};

pub const TEST_START: i64 = 1_700_000_000;

pub fn test_clock() -> Arc<ManualClock> {
    let start = DateTime::<Utc>::from_timestamp(TEST_START, 0).unwrap();
    Arc::new(ManualClock::new(start))
}

/// Epoch parameters small enough to drive every transition in a test:
/// a one hour epoch that fills at ten blobs.
pub fn fast_epoch_parameters() -> EpochParameters {
    EpochParameters {
        enabled: true,
        min_epoch_duration: Duration::from_secs(60 * 60),
        epoch_refresh_frequency: Duration::from_secs(20 * 60),
        full_checkpoint_frequency: 2,
        cleanup_safety_margin: Duration::from_secs(60 * 60),
        epoch_advance_on_count_threshold: 10,
        epoch_advance_on_total_size_bytes_threshold: 1024 * 1024,
        delete_parallelism: 2,
    }
}

pub fn fast_v1_parameters() -> MutableParameters {
    MutableParameters {
        epoch_parameters: fast_epoch_parameters(),
        ..MutableParameters::default()
    }
}

/// Everything a test needs to poke at a repository from the outside.
pub struct TestRepo {
    pub clock: Arc<ManualClock>,
    pub storage: Arc<MemoryBackend>,
    pub repo: Repository,
}

impl TestRepo {
    /// Open a second handle on the same store, as another client would.
    pub fn reopen(&self) -> Repository {
        Repository::open(self.storage.clone(), self.clock.clone(), OpenOptions::default())
            .unwrap()
    }
}

pub fn test_repo_with(parameters: MutableParameters, blob_cfg: BlobCfg) -> TestRepo {
    let clock = test_clock();
    let storage = Arc::new(MemoryBackend::with_clock(clock.clone()));
    let init = InitOptions {
        parameters,
        blob_cfg,
        ..InitOptions::default()
    };
    let repo = Repository::init(
        storage.clone(),
        clock.clone(),
        &init,
        OpenOptions::default(),
    )
    .unwrap();
    TestRepo {
        clock,
        storage,
        repo,
    }
}

/// Plaintext repository on the epoch index.
pub fn test_repo_plaintext() -> TestRepo {
    test_repo_with(fast_v1_parameters(), BlobCfg::default())
}

/// Plaintext repository still on the flat legacy index.
pub fn test_repo_legacy() -> TestRepo {
    test_repo_with(MutableParameters::legacy(), BlobCfg::default())
}

pub fn plaintext_crypto() -> Arc<dyn CryptoEngine> {
    Arc::new(PlaintextEngine::new(&[0x42; 32]))
}

/// A bare store with an epoch manager on top and no repository around it.
pub struct TestEpoch {
    pub clock: Arc<ManualClock>,
    pub storage: Arc<MemoryBackend>,
    pub io: IndexBlobIo,
    pub manager: EpochManager,
}

pub fn test_epoch_manager() -> TestEpoch {
    let clock = test_clock();
    let storage = Arc::new(MemoryBackend::with_clock(clock.clone()));
    let io = IndexBlobIo::new(storage.clone(), plaintext_crypto(), None);
    let dyn_clock: Arc<dyn Clock> = clock.clone();
    let manager = EpochManager::new(io.clone(), fast_epoch_parameters(), dyn_clock).unwrap();
    TestEpoch {
        clock,
        storage,
        io,
        manager,
    }
}

pub fn cid(n: u32) -> ContentId {
    let mut hash = [0u8; 32];
    hash[..4].copy_from_slice(&n.to_be_bytes());
    ContentId::from_parts(None, hash).unwrap()
}

/// A live index entry for content `n` in `pack` at `timestamp`.
pub fn info(n: u32, pack: &str, timestamp: i64) -> ContentInfo {
    ContentInfo {
        content_id: cid(n),
        pack_blob_id: BlobId::new(pack),
        packed_offset: u64::from(n) * 100,
        packed_length: 100,
        original_length: 90,
        compression_header_id: 0,
        encryption_key_id: 0,
        deleted: false,
        timestamp,
        format_version: CONTENT_FORMAT_VERSION,
    }
}

/// Entries `first..first + count`, all in one pack.
pub fn batch(first: u32, count: u32, timestamp: i64) -> Vec<ContentInfo> {
    (first..first + count)
        .map(|n| info(n, "p00aa", timestamp))
        .collect()
}
