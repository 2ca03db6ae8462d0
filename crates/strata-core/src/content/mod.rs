mod recovery;

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::clock::{chrono_duration, Clock};
use crate::compress::Compression;
use crate::crypto::CryptoEngine;
use crate::epoch::EpochManager;
use crate::error::{Result, ResultExt, StrataError};
use crate::format::{FormatManager, MutableParameters};
use crate::index::{
    CompactOptions, CompactStats, ContentInfo, IndexBlobInfo, IndexBlobIo, IndexBlobManager,
    IndexVersion, LegacyIndexManager, MergedIndex, MetadataCache, SyncStats,
};
use crate::pack::{
    decode_content_payload, encode_content_payload, read_content_range, PackType, PackWriter,
    PendingLocation,
};
use crate::storage::BlobStorage;
use crate::util::check_interrupted;
use strata_types::{BlobId, ContentId};

pub use recovery::{RecoverOptions, RecoverStats, RecoveryReport};

/// Layout version recorded in every index entry this build writes.
pub const CONTENT_FORMAT_VERSION: u8 = 1;

/// A content appended to an open pack whose blob ID is not known yet.
#[derive(Debug, Clone, Copy)]
struct PendingContent {
    pack_type: PackType,
    location: PendingLocation,
    original_length: u32,
    compression_header_id: u8,
    timestamp: i64,
}

#[derive(Clone, Default)]
pub struct ContentManagerOptions {
    /// Codec for contents written without an explicit one.
    pub compression: Compression,
    pub cache: Option<Arc<MetadataCache>>,
    pub shutdown: Option<Arc<AtomicBool>>,
}

/// Build the index blob manager matching the repository's parameters.
pub(crate) fn index_manager_for(
    io: &IndexBlobIo,
    params: &MutableParameters,
    clock: &Arc<dyn Clock>,
    shutdown: Option<&Arc<AtomicBool>>,
) -> Result<(Arc<dyn IndexBlobManager>, Option<Arc<EpochManager>>)> {
    match params.index_version {
        IndexVersion::V0 => Ok((Arc::new(LegacyIndexManager::new(io.clone())), None)),
        IndexVersion::V1 => {
            let mut epoch =
                EpochManager::new(io.clone(), params.epoch_parameters.clone(), clock.clone())?;
            if let Some(flag) = shutdown {
                epoch = epoch.with_shutdown(flag.clone());
            }
            let epoch = Arc::new(epoch);
            Ok((epoch.clone(), Some(epoch)))
        }
    }
}

/// Writes, reads and deletes contents, keeping packs and the index in step.
pub struct ContentManager {
    storage: Arc<dyn BlobStorage>,
    crypto: Arc<dyn CryptoEngine>,
    format: Arc<FormatManager>,
    clock: Arc<dyn Clock>,
    io: IndexBlobIo,
    compression: Compression,
    shutdown: Option<Arc<AtomicBool>>,
    index: Arc<dyn IndexBlobManager>,
    epoch: Option<Arc<EpochManager>>,
    /// Everything the store's index blobs resolve to as of the last load.
    committed: MergedIndex,
    /// Entries whose packs are written but whose index blob is not.
    uncommitted: MergedIndex,
    data_writer: PackWriter,
    meta_writer: PackWriter,
    pending: HashMap<ContentId, PendingContent>,
}

impl ContentManager {
    pub fn open(
        storage: Arc<dyn BlobStorage>,
        crypto: Arc<dyn CryptoEngine>,
        format: Arc<FormatManager>,
        clock: Arc<dyn Clock>,
        opts: ContentManagerOptions,
    ) -> Result<Self> {
        let params = format.mutable_parameters()?;
        let io = IndexBlobIo::new(storage.clone(), crypto.clone(), opts.cache);
        let (index, epoch) = index_manager_for(&io, &params, &clock, opts.shutdown.as_ref())?;
        let committed = index.load_merged().context("loading index")?;
        let target = params.max_pack_size as usize;
        debug!(
            entries = committed.len(),
            version = ?index.index_version(),
            "content manager opened"
        );
        Ok(Self {
            storage,
            crypto,
            format,
            clock,
            io,
            compression: opts.compression,
            shutdown: opts.shutdown,
            index,
            epoch,
            committed,
            uncommitted: MergedIndex::new(),
            data_writer: PackWriter::new(PackType::Data, target),
            meta_writer: PackWriter::new(PackType::Metadata, target),
            pending: HashMap::new(),
        })
    }

    pub fn storage(&self) -> &Arc<dyn BlobStorage> {
        &self.storage
    }

    pub fn crypto(&self) -> &Arc<dyn CryptoEngine> {
        &self.crypto
    }

    pub fn format_manager(&self) -> &Arc<FormatManager> {
        &self.format
    }

    pub fn index_manager(&self) -> &Arc<dyn IndexBlobManager> {
        &self.index
    }

    pub fn index_version(&self) -> IndexVersion {
        self.index.index_version()
    }

    /// The epoch manager, or `EpochManagerNotActive` on a legacy index.
    pub fn epoch_manager(&self) -> Result<Arc<EpochManager>> {
        self.epoch.clone().ok_or(StrataError::EpochManagerNotActive)
    }

    fn writer_mut(&mut self, pack_type: PackType) -> &mut PackWriter {
        match pack_type {
            PackType::Data => &mut self.data_writer,
            PackType::Metadata => &mut self.meta_writer,
        }
    }

    fn writer(&self, pack_type: PackType) -> &PackWriter {
        match pack_type {
            PackType::Data => &self.data_writer,
            PackType::Metadata => &self.meta_writer,
        }
    }

    /// Refuse writes while an upgrade lock is in effect. The check runs
    /// ahead of local time by the lock's permitted clock drift.
    fn check_writable(&mut self) -> Result<()> {
        let format = self.format.format()?;
        if let Some(lock) = &format.upgrade_lock {
            let now = self.clock.now() + chrono_duration(lock.max_permitted_clock_drift);
            if lock.is_locked(now).0 {
                return Err(StrataError::UpgradeInProgress(format!(
                    "locked by {} until the upgrade completes",
                    lock.owner_id
                )));
            }
        }
        if format.parameters.index_version != self.index.index_version() {
            self.switch_index(&format.parameters)?;
        }
        Ok(())
    }

    fn switch_index(&mut self, params: &MutableParameters) -> Result<()> {
        let (index, epoch) =
            index_manager_for(&self.io, params, &self.clock, self.shutdown.as_ref())?;
        info!(
            from = ?self.index.index_version(),
            to = ?index.index_version(),
            "index format changed, switching index manager"
        );
        self.index = index;
        self.epoch = epoch;
        self.committed = self.index.load_merged()?;
        Ok(())
    }

    /// Newest known entry for `id` across committed and uncommitted state.
    fn lookup(&self, id: &ContentId) -> Option<&ContentInfo> {
        match (self.committed.get(id), self.uncommitted.get(id)) {
            (Some(c), Some(u)) => Some(if u.supersedes(c) { u } else { c }),
            (c, u) => u.or(c),
        }
    }

    /// Store `data` and return its content ID. Existing live contents are
    /// not written again; a deleted one is brought back.
    pub fn write_content(
        &mut self,
        data: &[u8],
        prefix: Option<char>,
        compression: Option<Compression>,
    ) -> Result<ContentId> {
        check_interrupted(self.shutdown.as_deref())?;
        self.check_writable()?;
        let id = self.crypto.content_id(prefix, data)?;
        if self.pending.contains_key(&id) {
            return Ok(id);
        }
        let now = self.clock.now().timestamp();
        if let Some(existing) = self.lookup(&id).cloned() {
            if !existing.deleted {
                return Ok(id);
            }
            if self.storage.exists(existing.pack_blob_id.as_str())? {
                debug!(content = %id, "undeleting content");
                let mut revived = existing.clone();
                revived.deleted = false;
                revived.timestamp = now.max(existing.timestamp + 1);
                self.uncommitted.add(revived);
                return Ok(id);
            }
        }

        let original_length = u32::try_from(data.len()).map_err(|_| {
            StrataError::Other(format!("content of {} bytes is too large", data.len()))
        })?;
        let compression = compression.unwrap_or(self.compression);
        let payload = encode_content_payload(&id, data, compression, self.crypto.as_ref())?;
        let pack_type = PackType::for_content(&id);
        let writer = self.writer_mut(pack_type);
        let location = writer.append(id, &payload, original_length, compression.header_id());
        let full = writer.should_flush();
        self.pending.insert(
            id,
            PendingContent {
                pack_type,
                location,
                original_length,
                compression_header_id: compression.header_id(),
                timestamp: now,
            },
        );
        if full {
            self.flush_pack(pack_type)?;
        }
        Ok(id)
    }

    pub fn read_content(&self, id: &ContentId) -> Result<Vec<u8>> {
        if let Some(p) = self.pending.get(id) {
            let payload = self
                .writer(p.pack_type)
                .read_pending(p.location)
                .ok_or_else(|| StrataError::ContentNotFound(id.to_string()))?;
            return decode_content_payload(id, payload, self.crypto.as_ref());
        }
        let info = self
            .lookup(id)
            .filter(|info| !info.deleted)
            .ok_or_else(|| StrataError::ContentNotFound(id.to_string()))?;
        let payload = read_content_range(
            self.storage.as_ref(),
            &info.pack_blob_id,
            info.packed_offset,
            info.packed_length,
        )
        .with_context(|| format!("reading content {id}"))?;
        decode_content_payload(id, &payload, self.crypto.as_ref())
    }

    /// Mark a content deleted. The tombstone is always newer than the entry
    /// it replaces so it wins the merge.
    pub fn delete_content(&mut self, id: &ContentId) -> Result<()> {
        self.check_writable()?;
        if let Some(p) = self.pending.get(id).copied() {
            self.flush_pack(p.pack_type)?;
        }
        let info = self
            .lookup(id)
            .cloned()
            .ok_or_else(|| StrataError::ContentNotFound(id.to_string()))?;
        if info.deleted {
            return Ok(());
        }
        let now = self.clock.now().timestamp();
        self.uncommitted
            .add(info.tombstone(now.max(info.timestamp + 1)));
        debug!(content = %id, "deleted content");
        Ok(())
    }

    /// Index entry for a content that has reached a pack blob.
    pub fn content_info(&self, id: &ContentId) -> Option<ContentInfo> {
        self.lookup(id).cloned()
    }

    /// Every indexed content in ID order, optionally with tombstones.
    pub fn iterate_contents(&self, include_deleted: bool) -> Vec<ContentInfo> {
        let mut view = self.committed.clone();
        view.add_all(self.uncommitted.iter().cloned());
        view.into_entries()
            .into_iter()
            .filter(|info| include_deleted || !info.deleted)
            .collect()
    }

    /// Seal one open pack and turn its records into uncommitted entries.
    /// If the write fails the records stay pending.
    fn flush_pack(&mut self, pack_type: PackType) -> Result<()> {
        let storage = self.storage.clone();
        let crypto = self.crypto.clone();
        let Some(sealed) = self
            .writer_mut(pack_type)
            .flush(storage.as_ref(), crypto.as_ref())?
        else {
            return Ok(());
        };
        let key_id = self.crypto.key_id();
        for entry in sealed.entries {
            let Some(p) = self.pending.remove(&entry.content_id) else {
                continue;
            };
            self.uncommitted.add(ContentInfo {
                content_id: entry.content_id,
                pack_blob_id: sealed.blob_id.clone(),
                packed_offset: entry.offset,
                packed_length: entry.stored_length,
                original_length: p.original_length,
                compression_header_id: p.compression_header_id,
                encryption_key_id: key_id,
                deleted: false,
                timestamp: p.timestamp,
                format_version: CONTENT_FORMAT_VERSION,
            });
        }
        Ok(())
    }

    /// Write open packs, then one index blob for everything uncommitted.
    pub fn flush(&mut self) -> Result<Option<IndexBlobInfo>> {
        if self.pending.is_empty() && self.uncommitted.is_empty() {
            return Ok(None);
        }
        self.check_writable()?;
        self.flush_pack(PackType::Data)?;
        self.flush_pack(PackType::Metadata)?;
        self.commit_uncommitted()
    }

    fn commit_uncommitted(&mut self) -> Result<Option<IndexBlobInfo>> {
        if self.uncommitted.is_empty() {
            return Ok(None);
        }
        let entries: Vec<ContentInfo> = self.uncommitted.iter().cloned().collect();
        let info = self
            .index
            .write_index_blob(&entries)
            .context("writing index blob")?;
        let batch = std::mem::take(&mut self.uncommitted);
        self.committed.add_all(batch.into_entries());
        debug!(blob = %info.id, entries = entries.len(), "committed index entries");
        Ok(Some(info))
    }

    /// Re-read the format blob and the index from the store.
    pub fn refresh(&mut self) -> Result<()> {
        let format = self.format.refresh()?;
        if format.parameters.index_version != self.index.index_version() {
            return self.switch_index(&format.parameters);
        }
        self.index.refresh()?;
        self.committed = self.index.load_merged()?;
        Ok(())
    }

    /// Compact index blobs. Uncommitted entries are flushed first so they
    /// take part.
    pub fn compact_indexes(&mut self, opts: &CompactOptions) -> Result<CompactStats> {
        opts.validate()?;
        self.flush()?;
        let stats = self.index.compact(opts)?;
        self.committed = self.index.load_merged()?;
        Ok(stats)
    }

    /// Index blobs skipped on load because they did not decode. Their
    /// contents read as missing until [`ContentManager::recover_indexes`]
    /// rebuilds them.
    pub fn corrupt_index_blobs(&self) -> Vec<BlobId> {
        self.io.corrupt_blobs()
    }

    pub fn index_blobs(&self, include_superseded: bool) -> Result<Vec<IndexBlobInfo>> {
        self.index.list_index_blobs(include_superseded)
    }

    /// Reconcile the local index blob cache with the store.
    pub fn sync_metadata_cache(&self) -> Result<SyncStats> {
        let Some(cache) = self.io.cache() else {
            debug!("no metadata cache configured");
            return Ok(SyncStats::default());
        };
        cache.sync(
            self.storage.as_ref(),
            self.index.blob_prefixes(),
            self.crypto.as_ref(),
        )
    }

    /// Rebuild index entries from one pack blob. With `commit` the entries
    /// the index does not know yet are written; otherwise nothing changes.
    pub fn recover_index_from_pack_blob(
        &mut self,
        blob_id: &BlobId,
        known_length: Option<u64>,
        commit: bool,
    ) -> Result<RecoveryReport> {
        let recovered = recovery::recover_pack(
            self.storage.as_ref(),
            self.crypto.as_ref(),
            blob_id,
            known_length,
        )?;
        let fresh: Vec<ContentInfo> = recovered
            .entries
            .iter()
            .filter(|e| self.lookup(&e.content_id).is_none())
            .cloned()
            .collect();
        let added = fresh.len();
        if commit && added > 0 {
            self.check_writable()?;
            self.uncommitted.add_all(fresh);
            self.commit_uncommitted()?;
        }
        info!(
            pack = %blob_id,
            recovered = recovered.entries.len(),
            added,
            commit,
            "recovered index entries from pack"
        );
        Ok(RecoveryReport {
            blob_id: blob_id.clone(),
            entries: recovered.entries,
            unrecoverable_bytes: recovered.unrecoverable_bytes,
            added,
        })
    }

    /// Rebuild index entries from every pack blob in the store.
    pub fn recover_indexes(&mut self, opts: &RecoverOptions) -> Result<RecoverStats> {
        let (merged, mut stats) = recovery::recover_all(
            self.storage.as_ref(),
            self.crypto.as_ref(),
            opts,
            self.shutdown.as_deref(),
        )?;
        let fresh: Vec<ContentInfo> = merged
            .into_entries()
            .into_iter()
            .filter(|e| self.lookup(&e.content_id).is_none())
            .collect();
        stats.added_contents = fresh.len();
        if !opts.commit {
            return Ok(stats);
        }
        if !fresh.is_empty() {
            self.check_writable()?;
            self.uncommitted.add_all(fresh);
            self.commit_uncommitted()?;
        }
        if stats.failed_blobs == 0 {
            for id in self.io.corrupt_blobs() {
                match self.io.delete(&id) {
                    Ok(()) => stats.removed_corrupt_index_blobs += 1,
                    Err(e) => warn!(blob = %id, "keeping corrupt index blob: {e}"),
                }
            }
            if stats.removed_corrupt_index_blobs > 0 {
                self.index.refresh()?;
                info!(
                    removed = stats.removed_corrupt_index_blobs,
                    "removed corrupt index blobs"
                );
            }
        }
        Ok(stats)
    }
}
