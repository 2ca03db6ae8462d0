use crate::index::format::decode_index_blob_versioned;
use crate::index::{
    check_index_info, decode_index_blob, encode_index_blob, CompactOptions, IndexBlobIo,
    IndexBlobManager, IndexVersion, LegacyIndexManager, MergedIndex,
};
use crate::storage::{BlobStorage, MemoryBackend};
use crate::testutil::{batch, cid, info, plaintext_crypto, test_clock};
use strata_types::StrataError;

use std::sync::Arc;

#[test]
fn later_timestamp_wins_regardless_of_order() {
    let old = info(1, "p01", 100);
    let new = info(1, "p02", 200);

    let forward: MergedIndex = [old.clone(), new.clone()].into_iter().collect();
    let backward: MergedIndex = [new.clone(), old].into_iter().collect();

    assert_eq!(forward.get(&cid(1)), Some(&new));
    assert_eq!(backward.get(&cid(1)), Some(&new));
}

#[test]
fn later_tombstone_shows_deleted() {
    let live = info(7, "p01", 100);
    let tombstone = live.tombstone(101);

    let mut merged = MergedIndex::new();
    merged.add(tombstone);
    assert!(!merged.add(live));
    assert!(merged.get(&cid(7)).unwrap().deleted);
}

#[test]
fn equal_timestamps_break_ties_deterministically() {
    let live = info(3, "p0b", 100);
    let dead = info(3, "p0a", 100).tombstone(100);
    let merged: MergedIndex = [dead.clone(), live.clone()].into_iter().collect();
    assert_eq!(merged.get(&cid(3)), Some(&live), "live entry beats tombstone");

    let a = info(3, "p0a", 100);
    let b = info(3, "p0b", 100);
    for order in [[a.clone(), b.clone()], [b.clone(), a.clone()]] {
        let merged: MergedIndex = order.into_iter().collect();
        assert_eq!(merged.get(&cid(3)).unwrap().pack_blob_id, a.pack_blob_id);
    }

    let mut near = info(3, "p0a", 100);
    near.packed_offset = 10;
    let mut far = near.clone();
    far.packed_offset = 20;
    let merged: MergedIndex = [far, near.clone()].into_iter().collect();
    assert_eq!(merged.get(&cid(3)), Some(&near));
}

#[test]
fn check_index_info_lists_each_difference() {
    let a = info(1, "p01", 100);
    assert!(check_index_info(&a, &a).is_empty());

    let mut b = a.clone();
    b.packed_offset += 1;
    b.deleted = true;
    let lines = check_index_info(&a, &b);
    assert_eq!(lines.len(), 2);
    assert!(lines[0].contains("packed_offset"));
    assert!(lines[1].contains("deleted"));
}

#[test]
fn both_encodings_decode_to_the_same_entries() {
    let crypto = plaintext_crypto();
    let mut entries = batch(0, 20, 1_000);
    entries.push(info(50, "q0123", 1_001).tombstone(1_002));
    entries.reverse();

    let mut expected = entries.clone();
    expected.sort_by(|a, b| a.content_id.cmp(&b.content_id));

    for version in [IndexVersion::V0, IndexVersion::V1] {
        let bytes = encode_index_blob(&entries, version, crypto.as_ref()).unwrap();
        let (decoded_version, decoded) =
            decode_index_blob_versioned(&bytes, crypto.as_ref()).unwrap();
        assert_eq!(decoded_version, version);
        assert_eq!(decoded, expected, "{version:?}");
    }
}

#[test]
fn corrupted_index_blob_is_a_decode_error() {
    let crypto = plaintext_crypto();
    let bytes = encode_index_blob(&batch(0, 5, 1_000), IndexVersion::V0, crypto.as_ref()).unwrap();

    let mut flipped = bytes.clone();
    let last = flipped.len() - 1;
    flipped[last] ^= 0xff;
    assert!(matches!(
        decode_index_blob(&flipped, crypto.as_ref()),
        Err(StrataError::IndexDecode(_))
    ));

    let truncated = &bytes[..bytes.len() / 2];
    assert!(matches!(
        decode_index_blob(truncated, crypto.as_ref()),
        Err(StrataError::IndexDecode(_))
    ));
}

fn legacy_manager() -> (Arc<MemoryBackend>, LegacyIndexManager) {
    let storage = Arc::new(MemoryBackend::with_clock(test_clock()));
    let io = IndexBlobIo::new(storage.clone(), plaintext_crypto(), None);
    (storage, LegacyIndexManager::new(io))
}

#[test]
fn legacy_compaction_merges_small_blobs_into_one() {
    let (storage, manager) = legacy_manager();
    for i in 0..3 {
        manager.write_index_blob(&batch(i * 10, 10, 1_000)).unwrap();
    }
    let before = manager.load_merged().unwrap();

    let stats = manager
        .compact(&CompactOptions {
            max_small_blobs: 1,
            ..CompactOptions::default()
        })
        .unwrap();
    assert_eq!(stats.input_blobs, 3);
    assert_eq!(stats.output_blobs, 1);
    assert_eq!(stats.deleted_blobs, 3);

    let blobs = manager.list_index_blobs(true).unwrap();
    assert_eq!(blobs.len(), 1);
    let after = manager.load_merged().unwrap();
    assert_eq!(after.len(), 30);
    for entry in before.iter() {
        assert_eq!(after.get(&entry.content_id), Some(entry));
    }
    assert!(storage.list("m").unwrap().is_empty(), "compaction log removed");
}

#[test]
fn legacy_compaction_keeps_inputs_when_output_write_fails() {
    let (storage, manager) = legacy_manager();
    for i in 0..3 {
        manager.write_index_blob(&batch(i * 10, 10, 1_000)).unwrap();
    }
    storage.fail_puts_with_prefix(Some("n"));
    let opts = CompactOptions {
        max_small_blobs: 1,
        ..CompactOptions::default()
    };
    assert!(manager.compact(&opts).is_err());
    storage.fail_puts_with_prefix(None);

    assert_eq!(manager.list_index_blobs(false).unwrap().len(), 3);
    assert_eq!(manager.load_merged().unwrap().len(), 30);
}

#[test]
fn legacy_compaction_below_threshold_does_nothing() {
    let (_storage, manager) = legacy_manager();
    manager.write_index_blob(&batch(0, 5, 1_000)).unwrap();
    manager.write_index_blob(&batch(5, 5, 1_000)).unwrap();
    let stats = manager
        .compact(&CompactOptions {
            max_small_blobs: 4,
            ..CompactOptions::default()
        })
        .unwrap();
    assert_eq!(stats.input_blobs, 0);
    assert_eq!(manager.list_index_blobs(false).unwrap().len(), 2);
}

#[test]
fn dropping_contents_needs_acknowledgement() {
    let (_storage, manager) = legacy_manager();
    manager.write_index_blob(&batch(0, 5, 1_000)).unwrap();
    let mut opts = CompactOptions {
        drop_contents: vec![cid(2)],
        ..CompactOptions::default()
    };
    assert!(matches!(
        manager.compact(&opts),
        Err(StrataError::DangerousOperation(_))
    ));

    opts.allow_dangerous = true;
    let stats = manager.compact(&opts).unwrap();
    assert_eq!(stats.dropped_entries, 1);
    let merged = manager.load_merged().unwrap();
    assert_eq!(merged.len(), 4);
    assert!(!merged.contains(&cid(2)));
}
