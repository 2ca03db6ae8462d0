use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::format::{
    FEATURE_EPOCH_MANAGER, FEATURE_INDEX_V1, FORMAT_BACKUP_BLOB_ID, FORMAT_CACHE_DURATION,
};
use crate::index::{IndexBlobManager, IndexVersion, LegacyIndexManager};
use crate::storage::BlobStorage;
use crate::testutil::{batch, fast_epoch_parameters, test_repo_legacy, TestRepo};
use crate::upgrade::{UpgradeOptions, UpgradeState, UpgradeStateMachine};
use strata_types::{ContentId, StrataError};

fn options() -> UpgradeOptions {
    UpgradeOptions {
        owner_id: "upgrader@host".into(),
        io_drain_timeout: FORMAT_CACHE_DURATION,
        status_poll_interval: Duration::from_secs(60),
        max_permitted_clock_drift: Duration::from_secs(5),
        message: "moving to the epoch index".into(),
        epoch_parameters: fast_epoch_parameters(),
        ..UpgradeOptions::default()
    }
}

/// A legacy repository holding two index blobs worth of contents.
fn populated_legacy() -> (TestRepo, Vec<ContentId>) {
    let mut t = test_repo_legacy();
    let content = t.repo.content_mut();
    let mut ids = Vec::new();
    for round in 0..2 {
        for i in 0..3 {
            let data = format!("legacy {round} {i}");
            ids.push(content.write_content(data.as_bytes(), None, None).unwrap());
        }
        content.flush().unwrap();
    }
    assert_eq!(t.storage.list("n").unwrap().len(), 2);
    (t, ids)
}

fn advance_to(machine: &mut UpgradeStateMachine, target: UpgradeState) {
    while machine.state() != target {
        machine.advance().unwrap();
    }
}

#[test]
fn short_drain_timeout_is_refused_before_locking() {
    let (t, _) = populated_legacy();
    let mut machine = t.repo.upgrade(UpgradeOptions {
        io_drain_timeout: Duration::from_secs(60),
        status_poll_interval: Duration::from_secs(10),
        ..options()
    });
    assert!(matches!(
        machine.run(),
        Err(StrataError::DangerousOperation(_))
    ));
    assert_eq!(machine.state(), UpgradeState::Unlocked);
    assert!(t.repo.format().upgrade_lock_intent().unwrap().is_none());
    assert!(!t.storage.exists(FORMAT_BACKUP_BLOB_ID).unwrap());
}

#[test]
fn short_drain_timeout_runs_when_acknowledged() {
    let (t, _) = populated_legacy();
    let mut machine = t.repo.upgrade(UpgradeOptions {
        io_drain_timeout: Duration::from_secs(10),
        status_poll_interval: Duration::from_secs(5),
        allow_unsafe_drain_timeout: true,
        ..options()
    });
    assert_eq!(machine.run().unwrap(), UpgradeState::Committed);
}

#[test]
fn legacy_index_is_migrated_and_committed() {
    let (mut t, ids) = populated_legacy();
    let start = t.clock.now();
    let mut machine = t.repo.upgrade(options());
    assert_eq!(machine.run().unwrap(), UpgradeState::Committed);
    // Drain took at least drift + 2 x io drain.
    assert!(t.clock.now() - start >= chrono::Duration::seconds(2 * 15 * 60 + 5));

    assert!(t.storage.list("n").unwrap().is_empty());
    assert!(!t.storage.list("xn0_").unwrap().is_empty());
    assert!(!t.storage.exists(FORMAT_BACKUP_BLOB_ID).unwrap());

    let format = t.repo.format().load_fresh().unwrap();
    assert!(format.upgrade_lock.is_none());
    assert_eq!(format.parameters.index_version, IndexVersion::V1);
    assert!(format.required_features.iter().any(|f| f == FEATURE_INDEX_V1));
    assert!(format
        .required_features
        .iter()
        .any(|f| f == FEATURE_EPOCH_MANAGER));

    let content = t.repo.content_mut();
    content.refresh().unwrap();
    assert_eq!(content.index_version(), IndexVersion::V1);
    for id in &ids {
        assert!(content.read_content(id).is_ok());
    }
    content.write_content(b"after the upgrade", None, None).unwrap();
    content.flush().unwrap();

    let reopened = t.reopen();
    assert!(reopened.epoch_manager().is_ok());
    assert_eq!(reopened.content().iterate_contents(false).len(), ids.len() + 1);
}

#[test]
fn writers_pick_up_the_new_index_without_refresh() {
    let (mut t, ids) = populated_legacy();
    t.repo.upgrade(options()).run().unwrap();

    let content = t.repo.content_mut();
    let id = content.write_content(b"first v1 write", None, None).unwrap();
    assert_eq!(content.index_version(), IndexVersion::V1);
    content.flush().unwrap();
    assert!(t.storage.list("n").unwrap().is_empty());
    let reopened = t.reopen();
    assert!(reopened.content().read_content(&id).is_ok());
    assert!(reopened.content().read_content(&ids[0]).is_ok());
}

#[test]
fn client_with_cached_format_stops_writing_before_migration() {
    let (t, ids) = populated_legacy();
    let mut other = t.reopen();
    let mut machine = t.repo.upgrade(options());
    advance_to(&mut machine, UpgradeState::Draining);

    // The other client has not re-read the format blob yet.
    let early = other
        .content_mut()
        .write_content(b"before the lock was seen", None, None)
        .unwrap();
    other.content_mut().flush().unwrap();

    t.clock.advance(FORMAT_CACHE_DURATION);
    assert!(matches!(
        other.content_mut().write_content(b"during the drain", None, None),
        Err(StrataError::UpgradeInProgress(_))
    ));

    assert_eq!(machine.run().unwrap(), UpgradeState::Committed);
    let late = other
        .content_mut()
        .write_content(b"after the commit", None, None)
        .unwrap();
    other.content_mut().flush().unwrap();
    assert_eq!(other.content().index_version(), IndexVersion::V1);
    assert!(t.storage.list("n").unwrap().is_empty());

    let fresh = t.reopen();
    for id in ids.iter().chain([&early, &late]) {
        assert!(fresh.content().read_content(id).is_ok(), "{id} lost");
    }
}

#[test]
fn advance_notice_parks_until_upgrade_time() {
    let (t, _) = populated_legacy();
    let opts = UpgradeOptions {
        advance_notice: Duration::from_secs(60 * 60),
        ..options()
    };
    let mut machine = t.repo.upgrade(opts.clone());
    assert_eq!(machine.run().unwrap(), UpgradeState::Waiting);
    let lock = t.repo.format().upgrade_lock_intent().unwrap().unwrap();
    assert_eq!(
        lock.upgrade_time(),
        lock.creation_time + chrono::Duration::hours(1)
    );

    t.clock.advance(Duration::from_secs(30 * 60));
    let mut resumed = t.repo.upgrade(opts.clone());
    assert_eq!(resumed.run().unwrap(), UpgradeState::Waiting);
    assert_eq!(
        t.repo.format().upgrade_lock_intent().unwrap().unwrap(),
        lock,
        "resuming keeps the original lock"
    );

    t.clock.advance(Duration::from_secs(30 * 60));
    let mut resumed = t.repo.upgrade(opts);
    assert_eq!(resumed.run().unwrap(), UpgradeState::Committed);
    assert!(t.storage.list("n").unwrap().is_empty());
}

#[test]
fn another_owner_cannot_start_an_upgrade() {
    let (t, _) = populated_legacy();
    let mut first = t.repo.upgrade(options());
    first.advance().unwrap();

    let mut second = t.repo.upgrade(UpgradeOptions {
        owner_id: "someone-else@host".into(),
        ..options()
    });
    assert!(matches!(
        second.run(),
        Err(StrataError::UpgradeLockAlreadyHeld(owner)) if owner == "upgrader@host"
    ));
}

#[test]
fn rollback_needs_force() {
    let (t, _) = populated_legacy();
    let mut machine = t.repo.upgrade(options());
    machine.advance().unwrap();
    assert!(matches!(
        machine.force_rollback(false),
        Err(StrataError::DangerousOperation(_))
    ));
    assert!(t.repo.format().upgrade_lock_intent().unwrap().is_some());
}

#[test]
fn forced_rollback_after_migration_restores_legacy_index() {
    let (t, ids) = populated_legacy();
    let before = t.repo.format().load_fresh().unwrap();
    let mut machine = t.repo.upgrade(options());
    advance_to(&mut machine, UpgradeState::Validating);
    assert!(!t.storage.list("x").unwrap().is_empty());

    machine.force_rollback(true).unwrap();
    assert_eq!(machine.state(), UpgradeState::RolledBack);
    assert!(t.storage.list("x").unwrap().is_empty());
    assert_eq!(t.storage.list("n").unwrap().len(), 2);
    assert_eq!(t.repo.format().load_fresh().unwrap(), before);

    let mut reopened = t.reopen();
    assert_eq!(reopened.content().index_version(), IndexVersion::V0);
    for id in &ids {
        assert!(reopened.content().read_content(id).is_ok());
    }
    reopened
        .content_mut()
        .write_content(b"writable again", None, None)
        .unwrap();
    reopened.content_mut().flush().unwrap();
}

#[test]
fn committed_upgrade_cannot_be_rolled_back() {
    let (t, _) = populated_legacy();
    let mut machine = t.repo.upgrade(options());
    machine.run().unwrap();
    assert!(machine.force_rollback(true).is_err());
    assert!(matches!(machine.advance(), Err(StrataError::Other(_))));
}

#[test]
fn index_mismatch_keeps_the_repository_locked() {
    let (t, _) = populated_legacy();
    let mut machine = t.repo.upgrade(options());
    advance_to(&mut machine, UpgradeState::Validating);

    // A late legacy blob the migration never saw.
    let ts = t.clock.now().timestamp();
    LegacyIndexManager::new(t.repo.index_io())
        .write_index_blob(&batch(900, 2, ts))
        .unwrap();

    assert!(matches!(
        machine.advance(),
        Err(StrataError::IndexValidationFailed(2))
    ));
    assert_eq!(machine.state(), UpgradeState::Validating);
    assert!(t.repo.format().upgrade_lock_intent().unwrap().is_some());
    assert!(t.storage.exists(FORMAT_BACKUP_BLOB_ID).unwrap());
    assert_eq!(t.storage.list("n").unwrap().len(), 3);
}

#[test]
fn shutdown_interrupts_the_drain() {
    let (t, _) = populated_legacy();
    let flag = Arc::new(AtomicBool::new(false));
    let mut machine = t.repo.upgrade(options()).with_shutdown(flag.clone());
    advance_to(&mut machine, UpgradeState::Draining);

    flag.store(true, Ordering::SeqCst);
    assert!(matches!(machine.advance(), Err(StrataError::Interrupted)));
    assert_eq!(machine.state(), UpgradeState::Draining);
    assert!(t.repo.format().upgrade_lock_intent().unwrap().is_some());
    assert_eq!(t.storage.list("n").unwrap().len(), 2);
}

#[test]
fn already_migrated_repository_commits_without_draining() {
    let (t, _) = populated_legacy();
    t.repo.upgrade(options()).run().unwrap();
    let after_first = t.clock.now();

    let mut again = t.repo.upgrade(options());
    assert_eq!(again.run().unwrap(), UpgradeState::Committed);
    assert_eq!(t.clock.now(), after_first);
    assert!(t.repo.format().upgrade_lock_intent().unwrap().is_none());
}

#[test]
fn corrupt_legacy_index_stops_the_migration() {
    let (t, _) = populated_legacy();
    let broken = t.storage.list("n").unwrap()[0].id.clone();
    t.storage.corrupt(broken.as_str(), |bytes| bytes.truncate(3));

    let repo = t.reopen();
    let mut machine = repo.upgrade(options());
    advance_to(&mut machine, UpgradeState::Upgrading);
    assert!(matches!(machine.advance(), Err(StrataError::Other(_))));
    assert_eq!(
        repo.format().load_fresh().unwrap().parameters.index_version,
        IndexVersion::V0
    );
    assert!(t.storage.exists(broken.as_str()).unwrap());
}
