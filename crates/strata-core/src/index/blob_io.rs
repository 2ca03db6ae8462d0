use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use tracing::{debug, warn};

use super::format::{decode_index_blob, encode_index_blob};
use super::manager::IndexBlobInfo;
use super::metadata_cache::MetadataCache;
use super::{ContentInfo, IndexVersion, MergedIndex};
use crate::crypto::CryptoEngine;
use crate::error::{Result, ResultExt, StrataError};
use crate::storage::BlobStorage;
use strata_types::{BlobId, BlobMetadata};

/// Hex characters of the content hash kept in an index blob ID.
const INDEX_BLOB_HASH_CHARS: usize = 32;

/// Reads and writes index blobs, going through the local metadata cache
/// when one is configured.
#[derive(Clone)]
pub struct IndexBlobIo {
    storage: Arc<dyn BlobStorage>,
    crypto: Arc<dyn CryptoEngine>,
    cache: Option<Arc<MetadataCache>>,
    /// Blobs that failed to decode, skipped by merged reads.
    corrupt: Arc<Mutex<BTreeSet<BlobId>>>,
}

impl IndexBlobIo {
    pub fn new(
        storage: Arc<dyn BlobStorage>,
        crypto: Arc<dyn CryptoEngine>,
        cache: Option<Arc<MetadataCache>>,
    ) -> Self {
        Self {
            storage,
            crypto,
            cache,
            corrupt: Arc::default(),
        }
    }

    pub fn storage(&self) -> &Arc<dyn BlobStorage> {
        &self.storage
    }

    pub fn crypto(&self) -> &Arc<dyn CryptoEngine> {
        &self.crypto
    }

    pub fn cache(&self) -> Option<&Arc<MetadataCache>> {
        self.cache.as_ref()
    }

    /// Encode `entries` and write them under `prefix` followed by a content
    /// hash, so identical batches map to the same blob.
    pub fn write(
        &self,
        prefix: &str,
        entries: &[ContentInfo],
        version: IndexVersion,
    ) -> Result<IndexBlobInfo> {
        let bytes = encode_index_blob(entries, version, self.crypto.as_ref())?;
        let digest = hex::encode(Blake2b::<U32>::digest(&bytes));
        let id = format!("{prefix}{}", &digest[..INDEX_BLOB_HASH_CHARS]);
        self.storage
            .put(&id, &bytes)
            .with_context(|| format!("writing index blob {id}"))?;
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.put(&id, &bytes) {
                warn!(blob = %id, "failed to cache index blob: {e}");
            }
        }
        let meta = self
            .storage
            .stat(&id)?
            .ok_or_else(|| StrataError::BlobNotFound(id.clone()))?;
        debug!(blob = %id, entries = entries.len(), "wrote index blob");
        Ok(IndexBlobInfo::from_metadata(meta, false))
    }

    /// Read and decode one index blob.
    pub fn read(&self, id: &BlobId) -> Result<Vec<ContentInfo>> {
        if let Some(cache) = &self.cache {
            if let Some(bytes) = cache.get(id.as_str()) {
                match decode_index_blob(&bytes, self.crypto.as_ref()) {
                    Ok(entries) => return Ok(entries),
                    Err(e) => {
                        warn!(blob = %id, "dropping undecodable cached index blob: {e}");
                        cache.remove(id.as_str());
                    }
                }
            }
        }
        let bytes = self
            .storage
            .get(id.as_str())?
            .ok_or_else(|| StrataError::BlobNotFound(id.to_string()))?;
        let entries = decode_index_blob(&bytes, self.crypto.as_ref())
            .with_context(|| format!("decoding index blob {id}"))?;
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.put(id.as_str(), &bytes) {
                warn!(blob = %id, "failed to cache index blob: {e}");
            }
        }
        Ok(entries)
    }

    /// Like [`IndexBlobIo::read`], but a blob that does not decode is
    /// recorded as corrupt and yields `None`. Its entries come back through
    /// pack recovery.
    pub fn read_or_skip(&self, id: &BlobId) -> Result<Option<Vec<ContentInfo>>> {
        match self.read(id) {
            Ok(entries) => {
                self.corrupt_set().remove(id);
                Ok(Some(entries))
            }
            Err(e) if matches!(e.root(), StrataError::IndexDecode(_)) => {
                warn!(blob = %id, "skipping corrupt index blob: {e}");
                self.corrupt_set().insert(id.clone());
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Read several blobs and merge them into one view, skipping corrupt
    /// ones.
    pub fn read_merged<'a>(
        &self,
        ids: impl IntoIterator<Item = &'a BlobId>,
    ) -> Result<MergedIndex> {
        let mut merged = MergedIndex::new();
        for id in ids {
            if let Some(entries) = self.read_or_skip(id)? {
                merged.add_all(entries);
            }
        }
        Ok(merged)
    }

    fn corrupt_set(&self) -> std::sync::MutexGuard<'_, BTreeSet<BlobId>> {
        self.corrupt.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Index blobs found undecodable since this handle was created.
    pub fn corrupt_blobs(&self) -> Vec<BlobId> {
        self.corrupt_set().iter().cloned().collect()
    }

    pub fn is_corrupt(&self, id: &BlobId) -> bool {
        self.corrupt_set().contains(id)
    }

    /// Delete an index blob from the store and the cache.
    pub fn delete(&self, id: &BlobId) -> Result<()> {
        self.storage.delete(id.as_str())?;
        if let Some(cache) = &self.cache {
            cache.remove(id.as_str());
        }
        self.corrupt_set().remove(id);
        Ok(())
    }

    pub fn list(&self, prefix: &str) -> Result<Vec<BlobMetadata>> {
        self.storage.list(prefix)
    }
}
