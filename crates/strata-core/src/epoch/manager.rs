use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::naming::{
    deletion_watermark_id, epoch_marker_id, parse_marker, range_checkpoint_prefix,
    set_prefix_of, single_epoch_prefix, uncompacted_prefix, EPOCH_INDEX_PREFIX,
    RANGE_CHECKPOINT_PREFIX, SINGLE_EPOCH_PREFIX, UNCOMPACTED_PREFIX,
};
use super::parameters::EpochParameters;
use super::snapshot::CurrentSnapshot;
use crate::clock::{chrono_duration, Clock};
use crate::error::{Result, ResultExt, StrataError};
use crate::index::manager::{is_vanished_blob, MAX_LOAD_ATTEMPTS, SMALL_INDEX_BLOB_BYTES};
use crate::index::{
    CompactOptions, CompactStats, ContentInfo, IndexBlobInfo, IndexBlobIo, IndexBlobManager,
    IndexVersion, MergedIndex,
};
use crate::util::check_interrupted;
use strata_types::{BlobId, BlobMetadata, ContentId};

/// Times `write_index` rewrites a batch because the epoch moved under it.
const MAX_WRITE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupStats {
    pub deleted: usize,
    /// Deletes refused by blob retention.
    pub protected: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceStats {
    pub advanced_to: Option<u64>,
    pub compacted_epochs: usize,
    pub range_checkpoint: Option<(u64, u64)>,
    pub cleanup: CleanupStats,
}

/// Epoch-grouped (V1) index blob manager.
pub struct EpochManager {
    io: IndexBlobIo,
    params: EpochParameters,
    clock: Arc<dyn Clock>,
    shutdown: Option<Arc<AtomicBool>>,
    snapshot: Mutex<Option<CurrentSnapshot>>,
}

impl EpochManager {
    pub fn new(io: IndexBlobIo, params: EpochParameters, clock: Arc<dyn Clock>) -> Result<Self> {
        if !params.enabled {
            return Err(StrataError::EpochManagerNotActive);
        }
        params.validate()?;
        Ok(Self {
            io,
            params,
            clock,
            shutdown: None,
            snapshot: Mutex::new(None),
        })
    }

    pub fn with_shutdown(mut self, shutdown: Arc<AtomicBool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn parameters(&self) -> &EpochParameters {
        &self.params
    }

    fn interrupted(&self) -> Result<()> {
        check_interrupted(self.shutdown.as_deref())
    }

    /// Cached snapshot, reloaded once it is older than the refresh period.
    pub fn current(&self) -> Result<CurrentSnapshot> {
        let now = self.clock.now();
        {
            let cached = self.snapshot.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(snap) = cached.as_ref().filter(|s| now < s.valid_until) {
                return Ok(snap.clone());
            }
        }
        self.refresh_snapshot()
    }

    /// Re-list the store and replace the cached snapshot.
    pub fn refresh_snapshot(&self) -> Result<CurrentSnapshot> {
        let blobs = self
            .io
            .list(EPOCH_INDEX_PREFIX)
            .context("listing epoch index blobs")?;
        let valid_until = self.clock.now() + chrono_duration(self.params.epoch_refresh_frequency);
        let snap = CurrentSnapshot::from_listing(blobs, valid_until);
        *self.snapshot.lock().unwrap_or_else(|e| e.into_inner()) = Some(snap.clone());
        Ok(snap)
    }

    fn invalidate(&self) {
        *self.snapshot.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Write a batch into the current write epoch. If the epoch advanced
    /// while the blob was being written, the batch is written again into
    /// the new epoch so it cannot land in one that is being compacted.
    pub fn write_index(&self, entries: &[ContentInfo]) -> Result<Vec<IndexBlobInfo>> {
        let mut written = Vec::new();
        for _ in 0..MAX_WRITE_ATTEMPTS {
            self.interrupted()?;
            let before = self.refresh_snapshot()?;
            let info = self.io.write(
                &uncompacted_prefix(before.write_epoch),
                entries,
                IndexVersion::V1,
            )?;
            written.push(info);

            let after = self.refresh_snapshot()?;
            if after.write_epoch == before.write_epoch {
                self.advance_from(&after)?;
                return Ok(written);
            }
            debug!(
                from = before.write_epoch,
                to = after.write_epoch,
                "epoch advanced during index write, rewriting"
            );
        }
        Err(StrataError::Other(format!(
            "epoch kept advancing across {MAX_WRITE_ATTEMPTS} index write attempts"
        )))
    }

    /// Whether the write epoch of `snap` meets the advance rule.
    pub fn should_advance(&self, snap: &CurrentSnapshot) -> bool {
        let Some(blobs) = snap.uncompacted.get(&snap.write_epoch) else {
            return false;
        };
        let (Some(first), Some(last)) = (
            blobs.iter().map(|b| b.timestamp).min(),
            blobs.iter().map(|b| b.timestamp).max(),
        ) else {
            return false;
        };
        if last - first < chrono_duration(self.params.min_epoch_duration) {
            return false;
        }
        let total: u64 = blobs.iter().map(|b| b.length).sum();
        blobs.len() >= self.params.epoch_advance_on_count_threshold
            || total >= self.params.epoch_advance_on_total_size_bytes_threshold
    }

    fn advance_from(&self, snap: &CurrentSnapshot) -> Result<Option<u64>> {
        if !self.should_advance(snap) {
            return Ok(None);
        }
        let next = snap.write_epoch + 1;
        let marker = epoch_marker_id(next);
        self.io
            .storage()
            .put(&marker, &[])
            .with_context(|| format!("writing epoch marker {marker}"))?;
        self.invalidate();
        info!(epoch = next, "advanced write epoch");
        Ok(Some(next))
    }

    /// Advance the write epoch if the current one is full. Returns the new
    /// epoch when it moved.
    pub fn advance_if_needed(&self) -> Result<Option<u64>> {
        let snap = self.refresh_snapshot()?;
        self.advance_from(&snap)
    }

    /// Merge each settled epoch that has no single-epoch set and is not
    /// covered by a range checkpoint into an `xs` blob.
    pub fn compact_settled_epochs(&self) -> Result<usize> {
        let snap = self.refresh_snapshot()?;
        let Some(settled_max) = snap.settled_max() else {
            return Ok(0);
        };
        let covered = snap.checkpoint_max();
        let mut compacted = 0;
        for (&epoch, blobs) in snap.uncompacted.range(..=settled_max) {
            let in_checkpoint = covered.is_some_and(|max| epoch <= max);
            if in_checkpoint || snap.single_epoch_sets.contains_key(&epoch) {
                continue;
            }
            self.interrupted()?;
            let merged = self
                .read_live_set(&snap, blobs.iter().map(|b| &b.id))
                .with_context(|| format!("reading epoch {epoch}"))?;
            let out = self.io.write(
                &single_epoch_prefix(epoch),
                &merged.into_entries(),
                IndexVersion::V1,
            )?;
            debug!(epoch, inputs = blobs.len(), blob = %out.id, "compacted settled epoch");
            compacted += 1;
        }
        if compacted > 0 {
            self.invalidate();
            info!(epochs = compacted, "compacted settled epochs");
        }
        Ok(compacted)
    }

    /// Write a range checkpoint over `[0, max_settled]` once enough settled
    /// epochs follow the existing chain. `force` ignores the frequency.
    pub fn generate_range_checkpoint(&self, force: bool) -> Result<Option<(u64, u64)>> {
        let snap = self.refresh_snapshot()?;
        let Some(settled_max) = snap.settled_max() else {
            return Ok(None);
        };
        let start = snap.checkpoint_max().map_or(0, |max| max + 1);
        if start > settled_max {
            return Ok(None);
        }
        let pending = settled_max - start + 1;
        if !force && pending < self.params.full_checkpoint_frequency {
            debug!(pending, "range checkpoint not due");
            return Ok(None);
        }
        self.interrupted()?;
        let inputs = snap.complete_index_set(settled_max);
        let merged = self
            .read_live_set(&snap, inputs.iter().map(|b| &b.id))
            .context("reading range checkpoint inputs")?;
        let out = self.io.write(
            &range_checkpoint_prefix(0, settled_max),
            &merged.into_entries(),
            IndexVersion::V1,
        )?;
        self.invalidate();
        info!(max_epoch = settled_max, blob = %out.id, "wrote range checkpoint");
        Ok(Some((0, settled_max)))
    }

    /// Delete blobs whose replacement has existed for longer than the
    /// cleanup safety margin.
    pub fn cleanup(&self) -> Result<CleanupStats> {
        let snap = self.refresh_snapshot()?;
        let cutoff = self.clock.now() - chrono_duration(self.params.cleanup_safety_margin);
        let settled = |replacement: &[BlobMetadata]| {
            !replacement.is_empty() && replacement.iter().all(|b| b.timestamp < cutoff)
        };

        let mut doomed: Vec<BlobId> = Vec::new();
        for (epoch, blobs) in &snap.uncompacted {
            let replacement = match snap.chain_range_for(*epoch) {
                Some(range) => Some(range.blobs.as_slice()),
                None => snap.single_epoch_sets.get(epoch).map(Vec::as_slice),
            };
            if replacement.is_some_and(settled) {
                doomed.extend(blobs.iter().map(|b| b.id.clone()));
            }
        }
        for (epoch, blobs) in &snap.single_epoch_sets {
            if snap
                .chain_range_for(*epoch)
                .is_some_and(|range| settled(&range.blobs))
            {
                doomed.extend(blobs.iter().map(|b| b.id.clone()));
            }
        }
        for range in &snap.range_checkpoints {
            if snap.longest_range_chain.contains(range) {
                continue;
            }
            let replaced = snap.longest_range_chain.iter().any(|c| {
                c.min_epoch <= range.min_epoch && range.max_epoch <= c.max_epoch && settled(&c.blobs)
            });
            if replaced {
                doomed.extend(range.blobs.iter().map(|b| b.id.clone()));
            }
        }
        for marker in &snap.markers {
            let Some(epoch) = parse_marker(marker.id.as_str()) else {
                continue;
            };
            if epoch < snap.write_epoch
                && snap
                    .chain_range_for(epoch)
                    .is_some_and(|range| settled(&range.blobs))
            {
                doomed.push(marker.id.clone());
            }
        }
        if let Some(latest) = snap.deletion_watermark {
            let latest_id = deletion_watermark_id(latest);
            doomed.extend(
                snap.deletion_watermark_blobs
                    .iter()
                    .filter(|b| b.id.as_str() != latest_id)
                    .map(|b| b.id.clone()),
            );
        }

        if doomed.is_empty() {
            debug!("nothing to clean up");
            return Ok(CleanupStats::default());
        }
        let stats = self.delete_blobs(doomed)?;
        self.invalidate();
        info!(
            deleted = stats.deleted,
            protected = stats.protected,
            "cleaned up superseded epoch blobs"
        );
        Ok(stats)
    }

    /// Delete blobs with a fixed pool of workers fed from a bounded channel.
    /// The first hard failure stops the feeder and the remaining workers.
    fn delete_blobs(&self, ids: Vec<BlobId>) -> Result<CleanupStats> {
        let workers = self.params.delete_parallelism.max(1).min(ids.len().max(1));
        let (tx, rx) = crossbeam_channel::bounded::<BlobId>(workers * 2);
        let deleted = AtomicUsize::new(0);
        let protected = AtomicUsize::new(0);
        let stop = AtomicBool::new(false);
        let first_error: Mutex<Option<StrataError>> = Mutex::new(None);

        std::thread::scope(|s| {
            for _ in 0..workers {
                let rx = rx.clone();
                let (deleted, protected, stop, first_error) =
                    (&deleted, &protected, &stop, &first_error);
                s.spawn(move || {
                    for id in rx {
                        if stop.load(Ordering::Relaxed) {
                            break;
                        }
                        match self.io.delete(&id) {
                            Ok(()) => {
                                debug!(blob = %id, "deleted epoch blob");
                                deleted.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(e) if matches!(e.root(), StrataError::BlobProtected(_)) => {
                                warn!(blob = %id, "skipping retention-protected blob");
                                protected.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(e) => {
                                stop.store(true, Ordering::Relaxed);
                                let mut slot =
                                    first_error.lock().unwrap_or_else(|p| p.into_inner());
                                slot.get_or_insert(e.context(format!("deleting {id}")));
                                break;
                            }
                        }
                    }
                });
            }
            drop(rx);
            for id in ids {
                if stop.load(Ordering::Relaxed) || self.interrupted().is_err() {
                    break;
                }
                if tx.send(id).is_err() {
                    break;
                }
            }
            drop(tx);
        });

        if let Some(e) = first_error.into_inner().unwrap_or_else(|e| e.into_inner()) {
            return Err(e);
        }
        self.interrupted()?;
        Ok(CleanupStats {
            deleted: deleted.into_inner(),
            protected: protected.into_inner(),
        })
    }

    /// One full maintenance pass.
    pub fn maintain(&self) -> Result<MaintenanceStats> {
        let advanced_to = self.advance_if_needed()?;
        let compacted_epochs = self.compact_settled_epochs()?;
        let range_checkpoint = self.generate_range_checkpoint(false)?;
        let cleanup = self.cleanup()?;
        Ok(MaintenanceStats {
            advanced_to,
            compacted_epochs,
            range_checkpoint,
            cleanup,
        })
    }

    /// Blob set that describes epochs `0..=max_epoch`.
    pub fn complete_index_set(&self, max_epoch: u64) -> Result<Vec<BlobMetadata>> {
        Ok(self.current()?.complete_index_set(max_epoch))
    }

    /// Merge `blobs`, leaving out tombstones older than the deletion
    /// watermark so a blob that outlived the drop cannot bring them back.
    fn read_live_set<'a>(
        &self,
        snap: &CurrentSnapshot,
        blobs: impl IntoIterator<Item = &'a BlobId>,
    ) -> Result<MergedIndex> {
        let mut merged = self.io.read_merged(blobs)?;
        let Some(watermark) = snap.deletion_watermark else {
            return Ok(merged);
        };
        let cutoff = watermark.timestamp();
        let purged: Vec<ContentId> = merged
            .iter()
            .filter(|e| e.deleted && e.timestamp < cutoff)
            .map(|e| e.content_id)
            .collect();
        for id in &purged {
            merged.remove(id);
        }
        if !purged.is_empty() {
            debug!(purged = purged.len(), "left out tombstones below the deletion watermark");
        }
        Ok(merged)
    }

    /// Rewrite every live blob that holds a dropped entry, under the same
    /// set prefix, then delete the original. Sets that end up empty are
    /// still written so the epoch keeps its compacted form.
    fn drop_entries(&self, opts: &CompactOptions) -> Result<CompactStats> {
        let snap = self.refresh_snapshot()?;
        let inputs = snap.complete_index_set(snap.max_epoch());
        let merged = self.io.read_merged(inputs.iter().map(|b| &b.id))?;
        let ids = opts.ids_to_drop(&merged);
        if ids.is_empty() {
            debug!("no index entries match the drop criteria");
            return Ok(CompactStats::default());
        }
        if let Some(cutoff) = opts.drop_deleted_before {
            let mark = deletion_watermark_id(cutoff);
            self.io.storage().put(&mark, &[])?;
        }

        let mut stats = CompactStats {
            input_blobs: inputs.len(),
            ..CompactStats::default()
        };
        for blob in &inputs {
            self.interrupted()?;
            let Some(entries) = self.io.read_or_skip(&blob.id)? else {
                continue;
            };
            let before = entries.len();
            let kept: Vec<ContentInfo> = entries
                .into_iter()
                .filter(|e| !ids.contains(&e.content_id))
                .collect();
            if kept.len() == before {
                continue;
            }
            let prefix = set_prefix_of(blob.id.as_str()).ok_or_else(|| {
                StrataError::InvalidBlobId(format!("not an epoch set blob: {}", blob.id))
            })?;
            let out = self.io.write(prefix, &kept, IndexVersion::V1)?;
            stats.output_blobs += 1;
            stats.dropped_entries += before - kept.len();
            if out.id != blob.id {
                self.io.delete(&blob.id)?;
                stats.deleted_blobs += 1;
            }
        }
        self.invalidate();
        info!(
            dropped = stats.dropped_entries,
            rewritten = stats.output_blobs,
            "dropped entries from epoch index"
        );
        Ok(stats)
    }

    /// Merge small uncompacted blobs of epochs that are still open.
    fn merge_open_epochs(&self, opts: &CompactOptions, stats: &mut CompactStats) -> Result<()> {
        let snap = self.refresh_snapshot()?;
        let first_open = snap.settled_max().map_or(0, |m| m + 1);
        for (&epoch, blobs) in snap.uncompacted.range(first_open..) {
            let inputs: Vec<&BlobMetadata> = blobs
                .iter()
                .filter(|b| opts.all_indexes || b.length < SMALL_INDEX_BLOB_BYTES)
                .collect();
            if inputs.len() <= opts.max_small_blobs.max(1) {
                continue;
            }
            self.interrupted()?;
            let merged = self.read_live_set(&snap, inputs.iter().map(|b| &b.id))?;
            let out = self.io.write(
                &uncompacted_prefix(epoch),
                &merged.into_entries(),
                IndexVersion::V1,
            )?;
            stats.input_blobs += inputs.len();
            stats.output_blobs += 1;
            for input in inputs {
                if input.id != out.id && !self.io.is_corrupt(&input.id) {
                    self.io.delete(&input.id)?;
                    stats.deleted_blobs += 1;
                }
            }
            debug!(epoch, blob = %out.id, "merged open epoch blobs");
        }
        self.invalidate();
        Ok(())
    }

    /// Remove every epoch blob. Used when an upgrade is rolled back.
    pub fn delete_all_blobs(&self) -> Result<usize> {
        let ids: Vec<BlobId> = self
            .io
            .list(EPOCH_INDEX_PREFIX)?
            .into_iter()
            .map(|m| m.id)
            .collect();
        let count = ids.len();
        for id in ids {
            self.io.delete(&id)?;
        }
        self.invalidate();
        Ok(count)
    }

    /// Time the current write epoch started, if known.
    pub fn write_epoch_start(&self) -> Result<Option<DateTime<Utc>>> {
        let snap = self.current()?;
        Ok(snap.epoch_start_times.get(&snap.write_epoch).copied())
    }
}

impl IndexBlobManager for EpochManager {
    fn index_version(&self) -> IndexVersion {
        IndexVersion::V1
    }

    fn blob_prefixes(&self) -> &'static [&'static str] {
        &[UNCOMPACTED_PREFIX, SINGLE_EPOCH_PREFIX, RANGE_CHECKPOINT_PREFIX]
    }

    fn write_index_blob(&self, entries: &[ContentInfo]) -> Result<IndexBlobInfo> {
        self.write_index(entries)?
            .pop()
            .ok_or_else(|| StrataError::Other("no index blob written".into()))
    }

    fn list_index_blobs(&self, include_superseded: bool) -> Result<Vec<IndexBlobInfo>> {
        let snap = self.current()?;
        let active: BTreeSet<BlobId> = snap
            .complete_index_set(snap.max_epoch())
            .into_iter()
            .map(|b| b.id)
            .collect();
        let mut out: Vec<IndexBlobInfo> = snap
            .uncompacted
            .values()
            .chain(snap.single_epoch_sets.values())
            .flatten()
            .chain(snap.range_checkpoints.iter().flat_map(|r| r.blobs.iter()))
            .map(|b| IndexBlobInfo::from_metadata(b.clone(), !active.contains(&b.id)))
            .filter(|info| include_superseded || !info.superseded)
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    fn load_merged(&self) -> Result<MergedIndex> {
        let mut attempt = 0;
        let mut snap = self.current()?;
        loop {
            attempt += 1;
            let blobs = snap.complete_index_set(snap.max_epoch());
            match self.read_live_set(&snap, blobs.iter().map(|b| &b.id)) {
                Err(e) if is_vanished_blob(&e) && attempt < MAX_LOAD_ATTEMPTS => {
                    debug!("epoch index blob vanished during load, re-listing: {e}");
                    snap = self.refresh_snapshot()?;
                }
                other => return other,
            }
        }
    }

    fn compact(&self, opts: &CompactOptions) -> Result<CompactStats> {
        opts.validate()?;
        if opts.has_drops() {
            return self.drop_entries(opts);
        }
        let mut stats = CompactStats::default();
        let compacted = self.compact_settled_epochs()?;
        stats.output_blobs += compacted;
        if self.generate_range_checkpoint(opts.all_indexes)?.is_some() {
            stats.output_blobs += 1;
        }
        self.merge_open_epochs(opts, &mut stats)?;
        Ok(stats)
    }

    fn refresh(&self) -> Result<()> {
        self.refresh_snapshot().map(|_| ())
    }
}
