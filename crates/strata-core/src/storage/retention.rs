use std::sync::Arc;
use std::time::Duration;

use super::BlobStorage;
use crate::clock::{chrono_duration, Clock};
use crate::error::{Result, StrataError};
use strata_types::BlobMetadata;

/// Emulates object-lock retention: a blob cannot be deleted until it is
/// older than the retention period.
pub struct RetentionBackend {
    inner: Arc<dyn BlobStorage>,
    period: Duration,
    clock: Arc<dyn Clock>,
}

impl RetentionBackend {
    pub fn new(inner: Arc<dyn BlobStorage>, period: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner,
            period,
            clock,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}

impl BlobStorage for RetentionBackend {
    fn get(&self, id: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get(id)
    }

    fn get_range(&self, id: &str, offset: u64, length: u64) -> Result<Option<Vec<u8>>> {
        self.inner.get_range(id, offset, length)
    }

    fn put(&self, id: &str, data: &[u8]) -> Result<()> {
        self.inner.put(id, data)
    }

    fn delete(&self, id: &str) -> Result<()> {
        if let Some(meta) = self.inner.stat(id)? {
            let protected_until = meta.timestamp + chrono_duration(self.period);
            if self.clock.now() < protected_until {
                return Err(StrataError::BlobProtected(id.to_string()));
            }
        }
        self.inner.delete(id)
    }

    fn stat(&self, id: &str) -> Result<Option<BlobMetadata>> {
        self.inner.stat(id)
    }

    fn list(&self, prefix: &str) -> Result<Vec<BlobMetadata>> {
        self.inner.list(prefix)
    }
}
