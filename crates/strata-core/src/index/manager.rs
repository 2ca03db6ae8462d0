use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{ContentInfo, IndexVersion, MergedIndex};
use crate::error::{Result, StrataError};
use strata_types::{BlobId, BlobMetadata, ContentId};

/// Index blobs smaller than this are candidates for routine compaction.
pub const SMALL_INDEX_BLOB_BYTES: u64 = 1 << 20;

/// How many times a reader re-lists after an index blob vanished under it.
pub(crate) const MAX_LOAD_ATTEMPTS: usize = 5;

/// One index blob as reported to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexBlobInfo {
    pub id: BlobId,
    pub length: u64,
    pub timestamp: DateTime<Utc>,
    /// Logically replaced by a compaction but not yet deleted.
    pub superseded: bool,
}

impl IndexBlobInfo {
    pub fn from_metadata(meta: BlobMetadata, superseded: bool) -> Self {
        Self {
            id: meta.id,
            length: meta.length,
            timestamp: meta.timestamp,
            superseded,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CompactOptions {
    /// Routine compaction only runs when more small blobs than this exist.
    pub max_small_blobs: usize,
    /// Ignore the small-blob size ceiling and compact everything.
    pub all_indexes: bool,
    /// Content IDs to purge entirely. Needs `allow_dangerous`.
    pub drop_contents: Vec<ContentId>,
    /// Purge tombstones older than this.
    pub drop_deleted_before: Option<DateTime<Utc>>,
    pub allow_dangerous: bool,
}

impl CompactOptions {
    pub fn has_drops(&self) -> bool {
        !self.drop_contents.is_empty() || self.drop_deleted_before.is_some()
    }

    /// Reject dangerous options that were not explicitly acknowledged.
    pub fn validate(&self) -> Result<()> {
        if !self.drop_contents.is_empty() && !self.allow_dangerous {
            return Err(StrataError::DangerousOperation(
                "dropping contents from the index requires explicit acknowledgement".into(),
            ));
        }
        Ok(())
    }

    /// Content IDs these options remove from `merged`.
    pub(crate) fn ids_to_drop(&self, merged: &MergedIndex) -> BTreeSet<ContentId> {
        let mut ids: BTreeSet<ContentId> = self.drop_contents.iter().copied().collect();
        if let Some(cutoff) = self.drop_deleted_before {
            let cutoff = cutoff.timestamp();
            ids.extend(
                merged
                    .iter()
                    .filter(|e| e.deleted && e.timestamp < cutoff)
                    .map(|e| e.content_id),
            );
        }
        ids
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CompactStats {
    pub input_blobs: usize,
    pub output_blobs: usize,
    pub deleted_blobs: usize,
    pub dropped_entries: usize,
}

/// Storage strategy for index blobs: legacy flat (V0) or epoch-grouped (V1).
pub trait IndexBlobManager: Send + Sync {
    fn index_version(&self) -> IndexVersion;

    /// Prefixes every index blob of this manager lives under.
    fn blob_prefixes(&self) -> &'static [&'static str];

    /// Persist one batch of entries as a new index blob.
    fn write_index_blob(&self, entries: &[ContentInfo]) -> Result<IndexBlobInfo>;

    /// Index blobs currently in the store, optionally including ones that a
    /// compaction already replaced.
    fn list_index_blobs(&self, include_superseded: bool) -> Result<Vec<IndexBlobInfo>>;

    /// Reconstruct the current logical index.
    fn load_merged(&self) -> Result<MergedIndex>;

    /// Merge small blobs and apply any requested drops. Inputs are removed
    /// only after their replacement is written.
    fn compact(&self, opts: &CompactOptions) -> Result<CompactStats>;

    /// Discard cached listings.
    fn refresh(&self) -> Result<()> {
        Ok(())
    }
}

/// Whether an error means an index blob disappeared mid-read.
pub(crate) fn is_vanished_blob(err: &StrataError) -> bool {
    matches!(err.root(), StrataError::BlobNotFound(_))
}
