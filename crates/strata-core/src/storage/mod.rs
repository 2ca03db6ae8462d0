pub mod local_backend;
pub mod memory_backend;
pub mod retention;

use std::sync::Arc;

use crate::error::{Result, StrataError};
use strata_types::BlobMetadata;

pub use local_backend::LocalBackend;
pub use memory_backend::MemoryBackend;
pub use retention::RetentionBackend;

/// Flat, prefix-listable blob store. The single source of truth for every
/// pack, index and format blob.
pub trait BlobStorage: Send + Sync {
    /// Read a whole blob. `Ok(None)` if it does not exist.
    fn get(&self, id: &str) -> Result<Option<Vec<u8>>>;

    /// Read `length` bytes at `offset`. Returns fewer bytes when the range
    /// runs past the end of the blob.
    fn get_range(&self, id: &str, offset: u64, length: u64) -> Result<Option<Vec<u8>>>;

    /// Write a blob, replacing any previous content atomically.
    fn put(&self, id: &str, data: &[u8]) -> Result<()>;

    /// Delete a blob. Deleting a missing blob is not an error.
    fn delete(&self, id: &str) -> Result<()>;

    fn stat(&self, id: &str) -> Result<Option<BlobMetadata>>;

    /// List all blobs whose ID starts with `prefix`, sorted by ID.
    fn list(&self, prefix: &str) -> Result<Vec<BlobMetadata>>;

    /// Stream a prefix listing into `f`. Stops at the first callback error.
    fn for_each_blob(
        &self,
        prefix: &str,
        f: &mut dyn FnMut(BlobMetadata) -> Result<()>,
    ) -> Result<()> {
        for meta in self.list(prefix)? {
            f(meta)?;
        }
        Ok(())
    }

    fn exists(&self, id: &str) -> Result<bool> {
        Ok(self.stat(id)?.is_some())
    }
}

/// Read exactly `length` bytes at `offset` or fail.
pub fn read_exact_range(
    storage: &dyn BlobStorage,
    id: &str,
    offset: u64,
    length: u64,
) -> Result<Vec<u8>> {
    let data = storage
        .get_range(id, offset, length)?
        .ok_or_else(|| StrataError::BlobNotFound(id.to_string()))?;
    if data.len() as u64 != length {
        return Err(StrataError::Other(format!(
            "short read on {id} at offset {offset}: expected {length} bytes, got {}",
            data.len()
        )));
    }
    Ok(data)
}

/// Read a whole blob that must exist.
pub fn read_required(storage: &dyn BlobStorage, id: &str) -> Result<Vec<u8>> {
    storage
        .get(id)?
        .ok_or_else(|| StrataError::BlobNotFound(id.to_string()))
}

/// Reject blob IDs that could escape a flat namespace.
pub fn validate_blob_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(StrataError::InvalidBlobId("empty".into()));
    }
    if id.contains('/') || id.contains('\\') {
        return Err(StrataError::InvalidBlobId(format!(
            "{id} contains a path separator"
        )));
    }
    if id == "." || id.contains("..") {
        return Err(StrataError::InvalidBlobId(format!(
            "{id} contains parent traversal"
        )));
    }
    if id.starts_with('.') {
        return Err(StrataError::InvalidBlobId(format!("{id} is hidden")));
    }
    Ok(())
}

/// Build a storage backend from a repository URL.
///
/// `memory://` selects a process-local store (useful for dry runs and tests);
/// anything else, with or without a `file://` scheme, is a local directory.
pub fn backend_from_url(url: &str) -> Result<Arc<dyn BlobStorage>> {
    let url = url.trim();
    if url.is_empty() {
        return Err(StrataError::Config("repository url must not be empty".into()));
    }
    if url == "memory://" || url.starts_with("memory://") {
        return Ok(Arc::new(MemoryBackend::new()));
    }
    if let Some((scheme, _)) = url.split_once("://") {
        if scheme != "file" {
            return Err(StrataError::Config(format!(
                "unsupported repository scheme '{scheme}'"
            )));
        }
    }
    let path = url.strip_prefix("file://").unwrap_or(url);
    Ok(Arc::new(LocalBackend::new(path)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_blob_id_rejects_unsafe_ids() {
        assert!(validate_blob_id("").is_err());
        assert!(validate_blob_id("../escape").is_err());
        assert!(validate_blob_id("a/b").is_err());
        assert!(validate_blob_id("a\\b").is_err());
        assert!(validate_blob_id(".hidden").is_err());
    }

    #[test]
    fn validate_blob_id_accepts_repository_ids() {
        for id in ["strata.repository", "xn0_abcd", "xr0_6_ff", "p00aa", "xe3"] {
            assert!(validate_blob_id(id).is_ok(), "{id}");
        }
    }

    #[test]
    fn backend_from_url_rejects_unknown_scheme() {
        assert!(backend_from_url("s3://bucket").is_err());
        assert!(backend_from_url("").is_err());
        assert!(backend_from_url("memory://").is_ok());
    }
}
