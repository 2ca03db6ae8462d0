pub mod blob_io;
pub mod format;
pub mod legacy;
pub mod manager;
pub mod metadata_cache;

use std::collections::btree_map::{self, BTreeMap};
use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::error::StrataError;
use strata_types::{BlobId, ContentId};

pub use blob_io::IndexBlobIo;
pub use format::{decode_index_blob, encode_index_blob};
pub use legacy::LegacyIndexManager;
pub use manager::{CompactOptions, CompactStats, IndexBlobInfo, IndexBlobManager};
pub use metadata_cache::{MetadataCache, SyncStats};

/// Index encoding generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum IndexVersion {
    /// Flat list of `n` blobs, no epochs.
    V0 = 0,
    /// Epoch-grouped `x*` blobs.
    V1 = 1,
}

impl From<IndexVersion> for u8 {
    fn from(v: IndexVersion) -> u8 {
        v as u8
    }
}

impl TryFrom<u8> for IndexVersion {
    type Error = StrataError;

    fn try_from(v: u8) -> Result<Self, StrataError> {
        match v {
            0 => Ok(IndexVersion::V0),
            1 => Ok(IndexVersion::V1),
            other => Err(StrataError::UnsupportedVersion(other as u32)),
        }
    }
}

/// One index entry: where a content lives and what state it is in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentInfo {
    pub content_id: ContentId,
    pub pack_blob_id: BlobId,
    pub packed_offset: u64,
    pub packed_length: u32,
    pub original_length: u32,
    pub compression_header_id: u8,
    pub encryption_key_id: u32,
    pub deleted: bool,
    /// Seconds since the UNIX epoch.
    pub timestamp: i64,
    pub format_version: u8,
}

impl ContentInfo {
    /// Whether `self` replaces `other` for the same content ID.
    ///
    /// Later timestamp wins, tombstones included. On equal timestamps a live
    /// entry beats a tombstone, then the smaller pack blob ID, then the
    /// smaller offset, so the outcome never depends on read order.
    pub fn supersedes(&self, other: &ContentInfo) -> bool {
        self.merge_order(other) == Ordering::Greater
    }

    fn merge_order(&self, other: &ContentInfo) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| other.deleted.cmp(&self.deleted))
            .then_with(|| other.pack_blob_id.cmp(&self.pack_blob_id))
            .then_with(|| other.packed_offset.cmp(&self.packed_offset))
    }

    /// The tuple a reader resolves: (pack, offset, length, deleted).
    pub fn location(&self) -> (&BlobId, u64, u32, bool) {
        (
            &self.pack_blob_id,
            self.packed_offset,
            self.packed_length,
            self.deleted,
        )
    }

    /// A tombstone for this content at `timestamp`.
    pub fn tombstone(&self, timestamp: i64) -> ContentInfo {
        ContentInfo {
            deleted: true,
            timestamp,
            ..self.clone()
        }
    }
}

/// Compare two representations of the same content, field by field.
/// Returns one line per mismatch; empty when they agree.
pub fn check_index_info(a: &ContentInfo, b: &ContentInfo) -> Vec<String> {
    let mut out = Vec::new();
    let id = &a.content_id;
    macro_rules! cmp_field {
        ($field:ident) => {
            if a.$field != b.$field {
                out.push(format!(
                    "content {}: {} mismatch: {:?} vs {:?}",
                    id,
                    stringify!($field),
                    a.$field,
                    b.$field
                ));
            }
        };
    }
    cmp_field!(content_id);
    cmp_field!(pack_blob_id);
    cmp_field!(packed_offset);
    cmp_field!(packed_length);
    cmp_field!(original_length);
    cmp_field!(compression_header_id);
    cmp_field!(encryption_key_id);
    cmp_field!(deleted);
    cmp_field!(timestamp);
    cmp_field!(format_version);
    out
}

/// Reconstructed view over any number of index blobs: one winning entry
/// per content ID.
#[derive(Debug, Clone, Default)]
pub struct MergedIndex {
    entries: BTreeMap<ContentId, ContentInfo>,
}

impl MergedIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one entry. Returns true if it became the active entry.
    pub fn add(&mut self, info: ContentInfo) -> bool {
        match self.entries.entry(info.content_id) {
            btree_map::Entry::Vacant(slot) => {
                slot.insert(info);
                true
            }
            btree_map::Entry::Occupied(mut slot) => {
                if info.supersedes(slot.get()) {
                    slot.insert(info);
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn add_all(&mut self, infos: impl IntoIterator<Item = ContentInfo>) {
        for info in infos {
            self.add(info);
        }
    }

    pub fn get(&self, id: &ContentId) -> Option<&ContentInfo> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &ContentId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn remove(&mut self, id: &ContentId) -> Option<ContentInfo> {
        self.entries.remove(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in content ID order.
    pub fn iter(&self) -> impl Iterator<Item = &ContentInfo> {
        self.entries.values()
    }

    pub fn into_entries(self) -> Vec<ContentInfo> {
        self.entries.into_values().collect()
    }
}

impl FromIterator<ContentInfo> for MergedIndex {
    fn from_iter<I: IntoIterator<Item = ContentInfo>>(iter: I) -> Self {
        let mut merged = MergedIndex::new();
        merged.add_all(iter);
        merged
    }
}
