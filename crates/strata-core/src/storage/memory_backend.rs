use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use super::{validate_blob_id, BlobStorage};
use crate::clock::{Clock, SystemClock};
use crate::error::{Result, StrataError};
use strata_types::{BlobId, BlobMetadata};

struct StoredBlob {
    data: Vec<u8>,
    timestamp: DateTime<Utc>,
}

#[derive(Default)]
struct Faults {
    fail_puts_with_prefix: Option<String>,
    /// Ranged reads that touch bytes at or past this position fail.
    fail_range_reads_after: BTreeMap<String, u64>,
}

/// In-process blob store. Timestamps come from the injected clock so
/// epoch and retention timing is deterministic under test.
pub struct MemoryBackend {
    blobs: Mutex<BTreeMap<String, StoredBlob>>,
    faults: Mutex<Faults>,
    clock: Arc<dyn Clock>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            blobs: Mutex::new(BTreeMap::new()),
            faults: Mutex::new(Faults::default()),
            clock,
        }
    }

    /// Make every `put` whose ID starts with `prefix` fail with an I/O error.
    /// `None` clears the fault.
    pub fn fail_puts_with_prefix(&self, prefix: Option<&str>) {
        self.faults.lock().unwrap_or_else(|e| e.into_inner()).fail_puts_with_prefix =
            prefix.map(str::to_string);
    }

    /// Make ranged reads of `id` fail once they reach byte `position`.
    pub fn fail_range_reads_after(&self, id: &str, position: u64) {
        self.faults
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .fail_range_reads_after
            .insert(id.to_string(), position);
    }

    /// Overwrite a blob's bytes in place, keeping its timestamp.
    pub fn corrupt(&self, id: &str, f: impl FnOnce(&mut Vec<u8>)) -> bool {
        let mut blobs = self.blobs.lock().unwrap_or_else(|e| e.into_inner());
        match blobs.get_mut(id) {
            Some(blob) => {
                f(&mut blob.data);
                true
            }
            None => false,
        }
    }

    pub fn blob_count(&self) -> usize {
        self.blobs.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn injected_io_error(msg: String) -> StrataError {
        StrataError::Io(std::io::Error::other(msg))
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl BlobStorage for MemoryBackend {
    fn get(&self, id: &str) -> Result<Option<Vec<u8>>> {
        validate_blob_id(id)?;
        let blobs = self.blobs.lock().unwrap_or_else(|e| e.into_inner());
        Ok(blobs.get(id).map(|b| b.data.clone()))
    }

    fn get_range(&self, id: &str, offset: u64, length: u64) -> Result<Option<Vec<u8>>> {
        validate_blob_id(id)?;
        if let Some(limit) = self
            .faults
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .fail_range_reads_after
            .get(id)
        {
            if offset.saturating_add(length) > *limit {
                return Err(Self::injected_io_error(format!(
                    "injected read error on {id} at offset {limit}"
                )));
            }
        }
        let blobs = self.blobs.lock().unwrap_or_else(|e| e.into_inner());
        Ok(blobs.get(id).map(|b| {
            let start = (offset as usize).min(b.data.len());
            let end = start.saturating_add(length as usize).min(b.data.len());
            b.data[start..end].to_vec()
        }))
    }

    fn put(&self, id: &str, data: &[u8]) -> Result<()> {
        validate_blob_id(id)?;
        if let Some(prefix) = &self
            .faults
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .fail_puts_with_prefix
        {
            if id.starts_with(prefix.as_str()) {
                return Err(Self::injected_io_error(format!("injected put failure for {id}")));
            }
        }
        let timestamp = self.clock.now();
        let mut blobs = self.blobs.lock().unwrap_or_else(|e| e.into_inner());
        blobs.insert(
            id.to_string(),
            StoredBlob {
                data: data.to_vec(),
                timestamp,
            },
        );
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<()> {
        validate_blob_id(id)?;
        self.blobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
        Ok(())
    }

    fn stat(&self, id: &str) -> Result<Option<BlobMetadata>> {
        validate_blob_id(id)?;
        let blobs = self.blobs.lock().unwrap_or_else(|e| e.into_inner());
        Ok(blobs.get(id).map(|b| BlobMetadata {
            id: BlobId::new(id),
            length: b.data.len() as u64,
            timestamp: b.timestamp,
        }))
    }

    fn list(&self, prefix: &str) -> Result<Vec<BlobMetadata>> {
        let blobs = self.blobs.lock().unwrap_or_else(|e| e.into_inner());
        Ok(blobs
            .range(prefix.to_string()..)
            .take_while(|(id, _)| id.starts_with(prefix))
            .map(|(id, b)| BlobMetadata {
                id: BlobId::new(id.as_str()),
                length: b.data.len() as u64,
                timestamp: b.timestamp,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn timestamps_follow_injected_clock() {
        let clock = Arc::new(ManualClock::new(DateTime::from_timestamp(1000, 0).unwrap()));
        let backend = MemoryBackend::with_clock(clock.clone());
        backend.put("a", b"1").unwrap();
        clock.advance(std::time::Duration::from_secs(60));
        backend.put("b", b"2").unwrap();
        let listed = backend.list("").unwrap();
        assert_eq!(listed[0].timestamp.timestamp(), 1000);
        assert_eq!(listed[1].timestamp.timestamp(), 1060);
    }

    #[test]
    fn put_fault_only_hits_matching_prefix() {
        let backend = MemoryBackend::new();
        backend.fail_puts_with_prefix(Some("p"));
        assert!(backend.put("p123", b"x").is_err());
        backend.put("xn0_1", b"x").unwrap();
        backend.fail_puts_with_prefix(None);
        backend.put("p123", b"x").unwrap();
    }

    #[test]
    fn range_read_fault_allows_prefix_reads() {
        let backend = MemoryBackend::new();
        backend.put("p1", &[7u8; 100]).unwrap();
        backend.fail_range_reads_after("p1", 50);
        assert_eq!(backend.get_range("p1", 0, 50).unwrap().unwrap().len(), 50);
        assert!(backend.get_range("p1", 40, 20).is_err());
    }

    #[test]
    fn list_is_prefix_scoped_and_sorted() {
        let backend = MemoryBackend::new();
        for id in ["xn1_b", "xn0_a", "xs0_c", "p0"] {
            backend.put(id, b"").unwrap();
        }
        let ids: Vec<String> = backend
            .list("xn")
            .unwrap()
            .into_iter()
            .map(|m| m.id.into_string())
            .collect();
        assert_eq!(ids, vec!["xn0_a", "xn1_b"]);
    }
}
