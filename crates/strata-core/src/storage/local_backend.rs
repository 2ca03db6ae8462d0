use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use super::{validate_blob_id, BlobStorage};
use crate::error::{Result, StrataError};
use strata_types::{BlobId, BlobMetadata};

/// One file per blob in a single directory.
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    /// Create a backend rooted at `root`, creating the directory if needed.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root_path = root.as_ref();
        fs::create_dir_all(root_path)?;
        let root = fs::canonicalize(root_path)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, id: &str) -> Result<PathBuf> {
        validate_blob_id(id)?;
        Ok(self.root.join(id))
    }

    /// Write to a temp file in the same directory, then rename into place so
    /// readers never see a partial blob.
    fn atomic_write(&self, path: &Path, data: &[u8]) -> Result<()> {
        let mut tmp = tempfile::Builder::new()
            .prefix(".tmp-")
            .tempfile_in(&self.root)?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    fn metadata_for(id: String, meta: &fs::Metadata) -> Result<BlobMetadata> {
        let modified: DateTime<Utc> = meta.modified()?.into();
        Ok(BlobMetadata {
            id: BlobId::new(id),
            length: meta.len(),
            timestamp: modified,
        })
    }
}

impl BlobStorage for LocalBackend {
    fn get(&self, id: &str) -> Result<Option<Vec<u8>>> {
        let path = self.resolve(id)?;
        match fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn get_range(&self, id: &str, offset: u64, length: u64) -> Result<Option<Vec<u8>>> {
        let path = self.resolve(id)?;
        let mut file = match fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::with_capacity(length.min(64 * 1024 * 1024) as usize);
        file.take(length).read_to_end(&mut buf)?;
        Ok(Some(buf))
    }

    fn put(&self, id: &str, data: &[u8]) -> Result<()> {
        let path = self.resolve(id)?;
        self.atomic_write(&path, data)
    }

    fn delete(&self, id: &str) -> Result<()> {
        let path = self.resolve(id)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn stat(&self, id: &str) -> Result<Option<BlobMetadata>> {
        let path = self.resolve(id)?;
        match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => Ok(Some(Self::metadata_for(id.to_string(), &meta)?)),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<BlobMetadata>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            // Temp files from in-flight writes are never listed.
            if name.starts_with('.') || !name.starts_with(prefix) {
                continue;
            }
            let meta = match entry.metadata() {
                Ok(m) => m,
                // Deleted between read_dir and metadata.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(StrataError::Io(e)),
            };
            if meta.is_file() {
                out.push(Self::metadata_for(name, &meta)?);
            }
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }
}
