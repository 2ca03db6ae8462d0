use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::compress::Compression;
use crate::crypto::EncryptionMode;
use crate::format::UpgradeLockIntent;
use crate::repo::{InitOptions, OpenOptions, Repository};
use crate::storage::{BlobStorage, MemoryBackend};
use crate::testutil::{cid, fast_v1_parameters, test_clock, test_repo_plaintext};
use strata_types::StrataError;

#[test]
fn written_content_reads_back_before_and_after_flush() {
    let mut t = test_repo_plaintext();
    let content = t.repo.content_mut();
    let id = content
        .write_content(b"hello strata", None, Some(Compression::Zstd { level: 3 }))
        .unwrap();
    assert_eq!(content.read_content(&id).unwrap(), b"hello strata");
    assert!(content.content_info(&id).is_none(), "not in a pack yet");

    content.flush().unwrap();
    let info = content.content_info(&id).unwrap();
    assert!(info.pack_blob_id.has_prefix("p"));
    assert_eq!(info.original_length, 12);
    assert_eq!(content.read_content(&id).unwrap(), b"hello strata");
    assert_eq!(t.reopen().content().read_content(&id).unwrap(), b"hello strata");
}

#[test]
fn identical_payloads_are_stored_once() {
    let mut t = test_repo_plaintext();
    let content = t.repo.content_mut();
    let a = content.write_content(b"same bytes", None, None).unwrap();
    let b = content.write_content(b"same bytes", None, None).unwrap();
    assert_eq!(a, b);
    content.flush().unwrap();
    let c = content.write_content(b"same bytes", None, None).unwrap();
    assert_eq!(a, c);
    assert_eq!(content.flush().unwrap(), None);
    assert_eq!(t.storage.list("p").unwrap().len(), 1);
}

#[test]
fn prefixed_contents_go_to_metadata_packs() {
    let mut t = test_repo_plaintext();
    let content = t.repo.content_mut();
    let plain = content.write_content(b"payload", None, None).unwrap();
    let prefixed = content.write_content(b"payload", Some('k'), None).unwrap();
    assert_ne!(plain, prefixed);
    content.flush().unwrap();

    assert!(content.content_info(&prefixed).unwrap().pack_blob_id.has_prefix("q"));
    assert!(content.content_info(&plain).unwrap().pack_blob_id.has_prefix("p"));
    assert!(matches!(
        content.write_content(b"x", Some('A'), None),
        Err(StrataError::InvalidContentId(_))
    ));
}

#[test]
fn failed_pack_write_leaves_nothing_referenced() {
    let mut t = test_repo_plaintext();
    t.storage.fail_puts_with_prefix(Some("p"));
    let content = t.repo.content_mut();
    let ids: Vec<_> = (0..5)
        .map(|i| {
            content
                .write_content(format!("atomic {i}").as_bytes(), None, None)
                .unwrap()
        })
        .collect();
    assert!(content.flush().is_err());

    assert!(t.storage.list("p").unwrap().is_empty());
    assert!(t.storage.list("x").unwrap().is_empty());
    let other = t.reopen();
    assert!(other.content().iterate_contents(true).is_empty());

    t.storage.fail_puts_with_prefix(None);
    let content = t.repo.content_mut();
    content.flush().unwrap();
    for id in &ids {
        let info = content.content_info(id).unwrap();
        assert!(t.storage.exists(info.pack_blob_id.as_str()).unwrap());
        assert!(content.read_content(id).is_ok());
    }
}

#[test]
fn failed_index_write_keeps_entries_for_retry() {
    let mut t = test_repo_plaintext();
    t.storage.fail_puts_with_prefix(Some("xn"));
    let content = t.repo.content_mut();
    let id = content.write_content(b"retry me", None, None).unwrap();
    assert!(content.flush().is_err());
    assert_eq!(t.storage.list("p").unwrap().len(), 1);
    assert!(t.reopen().content().content_info(&id).is_none());

    t.storage.fail_puts_with_prefix(None);
    let content = t.repo.content_mut();
    assert!(content.flush().unwrap().is_some());
    assert!(t.reopen().content().content_info(&id).is_some());
}

#[test]
fn delete_then_rewrite_revives_content() {
    let mut t = test_repo_plaintext();
    let content = t.repo.content_mut();
    let id = content.write_content(b"phoenix", None, None).unwrap();
    content.flush().unwrap();
    let original = content.content_info(&id).unwrap();

    content.delete_content(&id).unwrap();
    let tombstone = content.content_info(&id).unwrap();
    assert!(tombstone.deleted);
    assert!(tombstone.timestamp > original.timestamp);
    assert!(matches!(
        content.read_content(&id),
        Err(StrataError::ContentNotFound(_))
    ));
    assert_eq!(content.iterate_contents(false).len(), 0);
    assert_eq!(content.iterate_contents(true).len(), 1);

    content.write_content(b"phoenix", None, None).unwrap();
    let revived = content.content_info(&id).unwrap();
    assert!(!revived.deleted);
    assert!(revived.timestamp > tombstone.timestamp);
    assert_eq!(revived.pack_blob_id, original.pack_blob_id);
    content.flush().unwrap();
    assert_eq!(t.reopen().content().read_content(&id).unwrap(), b"phoenix");
}

#[test]
fn deleting_pending_content_flushes_its_pack() {
    let mut t = test_repo_plaintext();
    let content = t.repo.content_mut();
    let id = content.write_content(b"short", None, None).unwrap();
    content.delete_content(&id).unwrap();
    content.flush().unwrap();
    assert!(content.content_info(&id).unwrap().deleted);
    assert_eq!(t.storage.list("p").unwrap().len(), 1);
}

#[test]
fn unknown_content_is_not_found() {
    let mut t = test_repo_plaintext();
    let content = t.repo.content_mut();
    assert!(matches!(
        content.read_content(&cid(99)),
        Err(StrataError::ContentNotFound(_))
    ));
    assert!(matches!(
        content.delete_content(&cid(99)),
        Err(StrataError::ContentNotFound(_))
    ));
}

#[test]
fn writes_are_refused_while_upgrade_lock_is_in_effect() {
    let mut t = test_repo_plaintext();
    let id = t
        .repo
        .content_mut()
        .write_content(b"before the lock", None, None)
        .unwrap();

    let lock = UpgradeLockIntent {
        owner_id: "upgrader@host".into(),
        creation_time: t.clock.now(),
        advance_notice: Duration::ZERO,
        io_drain_timeout: Duration::from_secs(60),
        status_poll_interval: Duration::from_secs(10),
        max_permitted_clock_drift: Duration::from_secs(5),
        message: "index upgrade".into(),
    };
    t.repo.format().set_upgrade_lock_intent(lock).unwrap();

    let content = t.repo.content_mut();
    assert!(matches!(
        content.write_content(b"after the lock", None, None),
        Err(StrataError::UpgradeInProgress(_))
    ));
    assert!(matches!(
        content.flush(),
        Err(StrataError::UpgradeInProgress(_))
    ));
    assert!(matches!(
        content.delete_content(&id),
        Err(StrataError::UpgradeInProgress(_))
    ));
    assert_eq!(content.read_content(&id).unwrap(), b"before the lock");
}

#[test]
fn advance_notice_keeps_writes_open_until_drain_window() {
    let mut t = test_repo_plaintext();
    let lock = UpgradeLockIntent {
        owner_id: "upgrader@host".into(),
        creation_time: t.clock.now(),
        advance_notice: Duration::from_secs(60 * 60),
        io_drain_timeout: Duration::from_secs(60),
        status_poll_interval: Duration::from_secs(10),
        max_permitted_clock_drift: Duration::from_secs(5),
        message: String::new(),
    };
    t.repo.format().set_upgrade_lock_intent(lock).unwrap();
    let content = t.repo.content_mut();
    content.write_content(b"early", None, None).unwrap();
    content.flush().unwrap();

    // Locked once now + drift reaches upgrade time - total drain (125s).
    t.clock.advance(Duration::from_secs(3600 - 130));
    let content = t.repo.content_mut();
    assert!(matches!(
        content.write_content(b"late", None, None),
        Err(StrataError::UpgradeInProgress(_))
    ));
}

#[test]
fn encrypted_repository_roundtrip() {
    let clock = test_clock();
    let storage = Arc::new(MemoryBackend::with_clock(clock.clone()));
    let init = InitOptions {
        encryption: EncryptionMode::Aes256Gcm,
        passphrase: Some("correct horse".into()),
        parameters: fast_v1_parameters(),
        ..InitOptions::default()
    };
    let mut repo =
        Repository::init(storage.clone(), clock.clone(), &init, OpenOptions::default()).unwrap();
    let id = repo
        .content_mut()
        .write_content(b"secret payload", None, None)
        .unwrap();
    repo.close().unwrap();

    let wrong = Repository::open(
        storage.clone(),
        clock.clone(),
        OpenOptions {
            passphrase: Some("wrong".into()),
            ..OpenOptions::default()
        },
    );
    assert!(matches!(wrong, Err(StrataError::DecryptionFailed)));

    let repo = Repository::open(
        storage,
        clock,
        OpenOptions {
            passphrase: Some("correct horse".into()),
            ..OpenOptions::default()
        },
    )
    .unwrap();
    assert!(repo.crypto().is_encrypting());
    assert_eq!(repo.content().read_content(&id).unwrap(), b"secret payload");
}
