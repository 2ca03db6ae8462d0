use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use super::CONTENT_FORMAT_VERSION;
use crate::crypto::CryptoEngine;
use crate::error::{Result, ResultExt, StrataError};
use crate::index::{ContentInfo, MergedIndex};
use crate::pack::{read_pack_header, scan_pack_records, PackEntry, PACK_BLOB_PREFIXES};
use crate::storage::BlobStorage;
use crate::util::check_interrupted;
use strata_types::{BlobId, BlobMetadata};

/// Minimum spacing between progress lines.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct RecoverOptions {
    pub parallelism: usize,
    /// Log and skip packs that fail instead of aborting the run.
    pub ignore_errors: bool,
    pub commit: bool,
}

impl Default for RecoverOptions {
    fn default() -> Self {
        Self {
            parallelism: 4,
            ignore_errors: false,
            commit: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoverStats {
    pub discovered_blobs: usize,
    pub processed_blobs: usize,
    pub failed_blobs: usize,
    pub recovered_contents: usize,
    /// Recovered entries the index did not have.
    pub added_contents: usize,
    pub unrecoverable_bytes: u64,
    /// Undecodable index blobs removed once their packs were re-indexed.
    pub removed_corrupt_index_blobs: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryReport {
    pub blob_id: BlobId,
    pub entries: Vec<ContentInfo>,
    pub unrecoverable_bytes: u64,
    /// Entries absent from the index; written when committing.
    pub added: usize,
}

pub(crate) struct RecoveredPack {
    pub entries: Vec<ContentInfo>,
    pub unrecoverable_bytes: u64,
}

/// Derive index entries for one pack: the trailer header when it is
/// intact, otherwise a forward scan that keeps the readable prefix.
pub(crate) fn recover_pack(
    storage: &dyn BlobStorage,
    crypto: &dyn CryptoEngine,
    blob_id: &BlobId,
    known_length: Option<u64>,
) -> Result<RecoveredPack> {
    let meta = storage
        .stat(blob_id.as_str())?
        .ok_or_else(|| StrataError::BlobNotFound(blob_id.to_string()))?;
    recover_pack_with_metadata(storage, crypto, &meta, known_length)
}

fn recover_pack_with_metadata(
    storage: &dyn BlobStorage,
    crypto: &dyn CryptoEngine,
    meta: &BlobMetadata,
    known_length: Option<u64>,
) -> Result<RecoveredPack> {
    let length = known_length.unwrap_or(meta.length);
    let (entries, unrecoverable_bytes) =
        match read_pack_header(storage, &meta.id, length, crypto) {
            Ok(entries) => (entries, 0),
            Err(e) => {
                debug!(pack = %meta.id, "pack header unreadable, scanning records: {e}");
                let scan = scan_pack_records(storage, &meta.id, length, crypto)
                    .with_context(|| format!("scanning pack {}", meta.id))?;
                (scan.entries, scan.unrecoverable_bytes)
            }
        };
    let timestamp = meta.timestamp.timestamp();
    let key_id = crypto.key_id();
    let entries = entries
        .into_iter()
        .map(|e: PackEntry| ContentInfo {
            content_id: e.content_id,
            pack_blob_id: meta.id.clone(),
            packed_offset: e.offset,
            packed_length: e.stored_length,
            original_length: e.original_length,
            compression_header_id: e.compression,
            encryption_key_id: key_id,
            deleted: false,
            timestamp,
            format_version: CONTENT_FORMAT_VERSION,
        })
        .collect();
    Ok(RecoveredPack {
        entries,
        unrecoverable_bytes,
    })
}

/// Recover every pack in the store with a fixed pool of workers.
///
/// A lister thread streams pack metadata into a bounded channel, workers
/// each take one pack at a time and send their entries to the collector
/// on the calling thread. Counters are shared atomics. Unless
/// `ignore_errors` is set, the first failure stops the lister and every
/// worker and is returned with the pack it happened on.
pub(crate) fn recover_all(
    storage: &dyn BlobStorage,
    crypto: &dyn CryptoEngine,
    opts: &RecoverOptions,
    shutdown: Option<&AtomicBool>,
) -> Result<(MergedIndex, RecoverStats)> {
    let parallelism = opts.parallelism.max(1);
    let (work_tx, work_rx) = crossbeam_channel::bounded::<BlobMetadata>(parallelism * 2);
    let (result_tx, result_rx) = crossbeam_channel::bounded::<RecoveredPack>(parallelism * 2);

    let discovered = AtomicUsize::new(0);
    let processed = AtomicUsize::new(0);
    let failed = AtomicUsize::new(0);
    let recovered = AtomicUsize::new(0);
    let unrecoverable = AtomicU64::new(0);
    let stop = AtomicBool::new(false);
    let first_error: Mutex<Option<StrataError>> = Mutex::new(None);
    let fail = |e: StrataError| {
        first_error
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get_or_insert(e);
        stop.store(true, Ordering::SeqCst);
    };
    let started = Instant::now();

    let merged = std::thread::scope(|s| {
        let (discovered, processed, failed, recovered, unrecoverable, stop, fail) = (
            &discovered,
            &processed,
            &failed,
            &recovered,
            &unrecoverable,
            &stop,
            &fail,
        );

        s.spawn(move || {
            let listed = PACK_BLOB_PREFIXES.iter().try_for_each(|prefix| {
                storage.for_each_blob(prefix, &mut |meta| {
                    if stop.load(Ordering::SeqCst) {
                        return Err(StrataError::Interrupted);
                    }
                    check_interrupted(shutdown)?;
                    discovered.fetch_add(1, Ordering::Relaxed);
                    work_tx.send(meta).map_err(|_| StrataError::Interrupted)
                })
            });
            drop(work_tx);
            if let Err(e) = listed {
                if !stop.load(Ordering::SeqCst) {
                    fail(e.context("listing pack blobs"));
                }
            }
        });

        for _ in 0..parallelism {
            let work_rx = work_rx.clone();
            let result_tx = result_tx.clone();
            s.spawn(move || {
                for meta in work_rx {
                    if stop.load(Ordering::SeqCst) {
                        break;
                    }
                    if let Err(e) = check_interrupted(shutdown) {
                        fail(e);
                        break;
                    }
                    match recover_pack_with_metadata(storage, crypto, &meta, None) {
                        Ok(pack) => {
                            processed.fetch_add(1, Ordering::Relaxed);
                            recovered.fetch_add(pack.entries.len(), Ordering::Relaxed);
                            unrecoverable.fetch_add(pack.unrecoverable_bytes, Ordering::Relaxed);
                            if result_tx.send(pack).is_err() {
                                break;
                            }
                        }
                        Err(e) if opts.ignore_errors => {
                            warn!(pack = %meta.id, "skipping unrecoverable pack: {e}");
                            processed.fetch_add(1, Ordering::Relaxed);
                            failed.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            fail(e.context(format!("recovering pack {}", meta.id)));
                            break;
                        }
                    }
                }
            });
        }
        drop(work_rx);
        drop(result_tx);

        let mut merged = MergedIndex::new();
        let mut last_report = Instant::now();
        for pack in result_rx {
            merged.add_all(pack.entries);
            if last_report.elapsed() >= PROGRESS_INTERVAL {
                last_report = Instant::now();
                log_progress(
                    processed.load(Ordering::Relaxed),
                    discovered.load(Ordering::Relaxed),
                    started.elapsed(),
                );
            }
        }
        merged
    });

    if let Some(e) = first_error.into_inner().unwrap_or_else(|p| p.into_inner()) {
        return Err(e);
    }
    let stats = RecoverStats {
        discovered_blobs: discovered.into_inner(),
        processed_blobs: processed.into_inner(),
        failed_blobs: failed.into_inner(),
        recovered_contents: recovered.into_inner(),
        added_contents: 0,
        unrecoverable_bytes: unrecoverable.into_inner(),
        removed_corrupt_index_blobs: 0,
    };
    info!(
        packs = stats.processed_blobs,
        failed = stats.failed_blobs,
        contents = stats.recovered_contents,
        elapsed_secs = started.elapsed().as_secs(),
        "pack recovery finished"
    );
    Ok((merged, stats))
}

/// Remaining time extrapolated from the share of discovered packs done.
/// The listing may still be running, so this is an estimate.
pub(crate) fn estimate_remaining(
    processed: usize,
    discovered: usize,
    elapsed: Duration,
) -> Option<Duration> {
    if processed == 0 || discovered == 0 {
        return None;
    }
    let fraction = processed as f64 / discovered as f64;
    let total = elapsed.as_secs_f64() / fraction;
    Some(Duration::from_secs_f64((total - elapsed.as_secs_f64()).max(0.0)))
}

fn log_progress(processed: usize, discovered: usize, elapsed: Duration) {
    match estimate_remaining(processed, discovered, elapsed) {
        Some(eta) => info!(
            processed,
            discovered,
            eta_secs = eta.as_secs(),
            "recovering index from packs"
        ),
        None => info!(processed, discovered, "recovering index from packs"),
    }
}
