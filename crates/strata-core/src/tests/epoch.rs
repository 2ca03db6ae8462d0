use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{Clock, ManualClock};
use crate::epoch::{EpochManager, EpochParameters};
use crate::error::Result;
use crate::index::{IndexBlobIo, IndexBlobManager};
use crate::storage::{BlobStorage, MemoryBackend, RetentionBackend};
use crate::testutil::{
    batch, fast_epoch_parameters, plaintext_crypto, test_clock, test_epoch_manager,
    test_repo_legacy, TestEpoch,
};
use strata_types::{BlobMetadata, StrataError};

const STEP: Duration = Duration::from_secs(7 * 60);

/// Ten single-entry writes seven minutes apart: enough blobs and enough
/// elapsed time to fill an epoch with the fast parameters.
fn fill_epoch(manager: &EpochManager, clock: &ManualClock, first: u32) {
    for i in 0..10 {
        if i > 0 {
            clock.advance(STEP);
        }
        let ts = clock.now().timestamp();
        manager.write_index(&batch(first + i, 1, ts)).unwrap();
    }
}

fn write_epoch(t: &TestEpoch) -> u64 {
    t.manager.refresh_snapshot().unwrap().write_epoch
}

#[test]
fn epoch_advances_once_full_and_old_enough() {
    let t = test_epoch_manager();
    assert_eq!(write_epoch(&t), 0);

    fill_epoch(&t.manager, &t.clock, 0);
    assert_eq!(write_epoch(&t), 1);
    assert!(t.storage.exists("xe1").unwrap());
    assert_eq!(t.storage.list("xn0_").unwrap().len(), 10);
}

#[test]
fn blob_count_alone_does_not_advance() {
    let t = test_epoch_manager();
    for i in 0..15 {
        t.manager.write_index(&batch(i, 1, 1_000)).unwrap();
    }
    assert_eq!(t.manager.advance_if_needed().unwrap(), None);
    assert_eq!(write_epoch(&t), 0);
}

#[test]
fn elapsed_time_alone_does_not_advance() {
    let t = test_epoch_manager();
    for i in 0..3 {
        t.manager.write_index(&batch(i, 1, 1_000)).unwrap();
        t.clock.advance(Duration::from_secs(2 * 60 * 60));
    }
    assert_eq!(t.manager.advance_if_needed().unwrap(), None);
    assert_eq!(write_epoch(&t), 0);
}

#[test]
fn write_epoch_never_decreases() {
    let t = test_epoch_manager();
    let mut seen = Vec::new();
    for round in 0..4 {
        fill_epoch(&t.manager, &t.clock, round * 10);
        seen.push(write_epoch(&t));
        t.manager.maintain().unwrap();
        seen.push(write_epoch(&t));
        t.clock.advance(Duration::from_secs(2 * 60 * 60));
        t.manager.cleanup().unwrap();
        seen.push(write_epoch(&t));

        let restarted =
            EpochManager::new(t.io.clone(), fast_epoch_parameters(), t.clock.clone()).unwrap();
        seen.push(restarted.current().unwrap().write_epoch);
    }
    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "{seen:?}");
    assert_eq!(seen.last(), Some(&4));
}

#[test]
fn settled_epochs_compact_then_checkpoint() {
    let t = test_epoch_manager();
    fill_epoch(&t.manager, &t.clock, 0);
    fill_epoch(&t.manager, &t.clock, 10);
    assert_eq!(write_epoch(&t), 2);
    let before = t.manager.load_merged().unwrap();

    assert_eq!(t.manager.compact_settled_epochs().unwrap(), 1);
    assert_eq!(t.storage.list("xs0_").unwrap().len(), 1);
    assert_eq!(t.manager.compact_settled_epochs().unwrap(), 0);
    assert_eq!(t.manager.generate_range_checkpoint(false).unwrap(), None);

    fill_epoch(&t.manager, &t.clock, 20);
    assert_eq!(write_epoch(&t), 3);
    assert_eq!(t.manager.compact_settled_epochs().unwrap(), 1);
    assert_eq!(t.manager.generate_range_checkpoint(false).unwrap(), Some((0, 1)));
    assert_eq!(t.storage.list("xr0_1_").unwrap().len(), 1);

    let after = t.manager.load_merged().unwrap();
    assert_eq!(after.len(), 30);
    for entry in before.iter() {
        assert_eq!(after.get(&entry.content_id), Some(entry));
    }

    let set = t.manager.complete_index_set(3).unwrap();
    let ids: Vec<&str> = set.iter().map(|b| b.id.as_str()).collect();
    assert!(ids[0].starts_with("xr0_1_"), "{ids:?}");
    assert!(ids[1..].iter().all(|id| id.starts_with("xn2_")), "{ids:?}");
}

#[test]
fn forced_checkpoint_ignores_frequency() {
    let t = test_epoch_manager();
    fill_epoch(&t.manager, &t.clock, 0);
    fill_epoch(&t.manager, &t.clock, 10);
    assert_eq!(t.manager.generate_range_checkpoint(false).unwrap(), None);
    assert_eq!(t.manager.generate_range_checkpoint(true).unwrap(), Some((0, 0)));
    assert_eq!(t.manager.generate_range_checkpoint(true).unwrap(), None);
}

#[test]
fn cleanup_waits_for_safety_margin() {
    let t = test_epoch_manager();
    fill_epoch(&t.manager, &t.clock, 0);
    fill_epoch(&t.manager, &t.clock, 10);
    t.manager.compact_settled_epochs().unwrap();

    let stats = t.manager.cleanup().unwrap();
    assert_eq!(stats.deleted, 0);
    assert_eq!(t.storage.list("xn0_").unwrap().len(), 10);

    let superseded: Vec<_> = t
        .manager
        .list_index_blobs(true)
        .unwrap()
        .into_iter()
        .filter(|b| b.superseded)
        .collect();
    assert_eq!(superseded.len(), 10);
    assert!(superseded.iter().all(|b| b.id.has_prefix("xn0_")));
    assert!(t
        .manager
        .list_index_blobs(false)
        .unwrap()
        .iter()
        .all(|b| !b.id.has_prefix("xn0_")));

    t.clock.advance(Duration::from_secs(61 * 60));
    let stats = t.manager.cleanup().unwrap();
    assert_eq!(stats.deleted, 10);
    assert!(t.storage.list("xn0_").unwrap().is_empty());
    assert_eq!(t.manager.load_merged().unwrap().len(), 20);
}

#[test]
fn cleanup_skips_retention_protected_blobs() {
    let clock = test_clock();
    let inner = Arc::new(MemoryBackend::with_clock(clock.clone()));
    let guarded: Arc<dyn BlobStorage> = Arc::new(RetentionBackend::new(
        inner.clone(),
        Duration::from_secs(10 * 24 * 60 * 60),
        clock.clone(),
    ));
    let io = IndexBlobIo::new(guarded, plaintext_crypto(), None);
    let manager = EpochManager::new(io, fast_epoch_parameters(), clock.clone()).unwrap();

    fill_epoch(&manager, &clock, 0);
    fill_epoch(&manager, &clock, 10);
    manager.compact_settled_epochs().unwrap();
    clock.advance(Duration::from_secs(2 * 60 * 60));

    let stats = manager.cleanup().unwrap();
    assert_eq!(stats.deleted, 0);
    assert_eq!(stats.protected, 10);
    assert_eq!(inner.list("xn0_").unwrap().len(), 10);
}

/// Places the next epoch marker right after the first uncompacted blob of
/// epoch 0 lands, as a concurrent writer would.
struct AdvancingStore {
    inner: MemoryBackend,
    armed: AtomicBool,
}

impl BlobStorage for AdvancingStore {
    fn get(&self, id: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get(id)
    }

    fn get_range(&self, id: &str, offset: u64, length: u64) -> Result<Option<Vec<u8>>> {
        self.inner.get_range(id, offset, length)
    }

    fn put(&self, id: &str, data: &[u8]) -> Result<()> {
        self.inner.put(id, data)?;
        if id.starts_with("xn0_") && self.armed.swap(false, Ordering::SeqCst) {
            self.inner.put("xe1", &[])?;
        }
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<()> {
        self.inner.delete(id)
    }

    fn stat(&self, id: &str) -> Result<Option<BlobMetadata>> {
        self.inner.stat(id)
    }

    fn list(&self, prefix: &str) -> Result<Vec<BlobMetadata>> {
        self.inner.list(prefix)
    }
}

#[test]
fn write_lands_in_new_epoch_when_epoch_moves_underneath() {
    let clock = test_clock();
    let store = Arc::new(AdvancingStore {
        inner: MemoryBackend::with_clock(clock.clone()),
        armed: AtomicBool::new(true),
    });
    let io = IndexBlobIo::new(store.clone(), plaintext_crypto(), None);
    let manager = EpochManager::new(io, fast_epoch_parameters(), clock).unwrap();

    let written = manager.write_index(&batch(0, 3, 1_000)).unwrap();
    assert_eq!(written.len(), 2);
    assert!(written[0].id.has_prefix("xn0_"));
    assert!(written[1].id.has_prefix("xn1_"));
    assert_eq!(store.list("xn1_").unwrap().len(), 1);
}

#[test]
fn disabled_parameters_have_no_epoch_manager() {
    let io = IndexBlobIo::new(
        Arc::new(MemoryBackend::new()),
        plaintext_crypto(),
        None,
    );
    assert!(matches!(
        EpochManager::new(io, EpochParameters::disabled(), test_clock()),
        Err(StrataError::EpochManagerNotActive)
    ));

    let legacy = test_repo_legacy();
    assert!(matches!(
        legacy.repo.epoch_manager(),
        Err(StrataError::EpochManagerNotActive)
    ));
}

#[test]
fn invalid_parameters_are_rejected() {
    let io = IndexBlobIo::new(
        Arc::new(MemoryBackend::new()),
        plaintext_crypto(),
        None,
    );
    let params = EpochParameters {
        cleanup_safety_margin: Duration::from_secs(60),
        ..fast_epoch_parameters()
    };
    assert!(matches!(
        EpochManager::new(io, params, test_clock()),
        Err(StrataError::Config(_))
    ));
}

#[test]
fn write_epoch_start_follows_marker() {
    let t = test_epoch_manager();
    t.manager.write_index(&batch(0, 1, 1_000)).unwrap();
    let first = t.manager.write_epoch_start().unwrap();
    assert_eq!(first, Some(t.clock.now()));

    t.clock.advance(STEP);
    fill_epoch(&t.manager, &t.clock, 1);
    let start = t.manager.write_epoch_start().unwrap();
    let marker = t.storage.stat("xe1").unwrap().unwrap();
    assert_eq!(start, Some(marker.timestamp));
}

#[test]
fn shutdown_flag_interrupts_writes() {
    let t = test_epoch_manager();
    let flag = Arc::new(AtomicBool::new(true));
    let manager = EpochManager::new(t.io.clone(), fast_epoch_parameters(), t.clock.clone())
        .unwrap()
        .with_shutdown(flag);
    assert!(matches!(
        manager.write_index(&batch(0, 1, 1_000)),
        Err(StrataError::Interrupted)
    ));
    assert!(t.storage.list("xn").unwrap().is_empty());
}
