use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::format::decode_index_blob;
use crate::crypto::CryptoEngine;
use crate::error::Result;
use crate::storage::{validate_blob_id, BlobStorage};

/// Local on-disk copy of index blobs, keyed by blob ID.
///
/// Index blobs are immutable, so a cached copy is either identical to the
/// store's or stale (deleted upstream). The store always wins.
pub struct MetadataCache {
    dir: PathBuf,
}

/// What a cache sync changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub downloaded: usize,
    pub removed_stale: usize,
    pub dropped_corrupt: usize,
    pub kept: usize,
}

impl MetadataCache {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> Option<PathBuf> {
        validate_blob_id(id).ok()?;
        Some(self.dir.join(id))
    }

    pub fn get(&self, id: &str) -> Option<Vec<u8>> {
        fs::read(self.path_for(id)?).ok()
    }

    pub fn put(&self, id: &str, data: &[u8]) -> Result<()> {
        let Some(path) = self.path_for(id) else {
            return Ok(());
        };
        let mut tmp = tempfile::Builder::new()
            .prefix(".tmp-")
            .tempfile_in(&self.dir)?;
        tmp.write_all(data)?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    pub fn remove(&self, id: &str) {
        if let Some(path) = self.path_for(id) {
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(blob = id, "failed to remove cached blob: {e}");
                }
            }
        }
    }

    /// IDs currently present in the cache.
    pub fn cached_ids(&self) -> Result<BTreeSet<String>> {
        let mut ids = BTreeSet::new();
        for entry in fs::read_dir(&self.dir)? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if !name.starts_with('.') {
                ids.insert(name);
            }
        }
        Ok(ids)
    }

    /// Reconcile the cache with the store for every blob under `prefixes`:
    /// download what is missing, delete what the store no longer has, and
    /// replace cached copies that no longer decode.
    pub fn sync(
        &self,
        storage: &dyn BlobStorage,
        prefixes: &[&str],
        crypto: &dyn CryptoEngine,
    ) -> Result<SyncStats> {
        let mut upstream = BTreeSet::new();
        for prefix in prefixes {
            for meta in storage.list(prefix)? {
                upstream.insert(meta.id.into_string());
            }
        }

        let mut stats = SyncStats::default();
        for id in self.cached_ids()? {
            let in_scope = prefixes.iter().any(|p| id.starts_with(p));
            if in_scope && !upstream.contains(&id) {
                self.remove(&id);
                stats.removed_stale += 1;
            }
        }

        for id in &upstream {
            if let Some(bytes) = self.get(id) {
                if decode_index_blob(&bytes, crypto).is_ok() {
                    stats.kept += 1;
                    continue;
                }
                debug!(blob = %id, "cached copy is corrupt, refetching");
                self.remove(id);
                stats.dropped_corrupt += 1;
            }
            // The blob may vanish between list and get (concurrent cleanup).
            if let Some(bytes) = storage.get(id)? {
                self.put(id, &bytes)?;
                stats.downloaded += 1;
            }
        }
        info!(
            downloaded = stats.downloaded,
            removed = stats.removed_stale,
            corrupt = stats.dropped_corrupt,
            "metadata cache synchronized"
        );
        Ok(stats)
    }
}
