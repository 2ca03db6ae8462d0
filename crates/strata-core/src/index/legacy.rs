use std::collections::BTreeSet;

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::blob_io::IndexBlobIo;
use super::manager::{
    is_vanished_blob, CompactOptions, CompactStats, IndexBlobInfo, IndexBlobManager,
    MAX_LOAD_ATTEMPTS, SMALL_INDEX_BLOB_BYTES,
};
use super::{ContentInfo, IndexVersion, MergedIndex};
use crate::error::Result;
use strata_types::BlobId;

pub const LEGACY_INDEX_PREFIX: &str = "n";
/// Compaction logs: which inputs a written output replaces.
pub const COMPACTION_LOG_PREFIX: &str = "m";

#[derive(Debug, Serialize, Deserialize)]
struct CompactionLog {
    inputs: Vec<BlobId>,
    outputs: Vec<BlobId>,
}

/// Flat V0 index: every `n` blob is read, compaction merges them in place.
pub struct LegacyIndexManager {
    io: IndexBlobIo,
}

impl LegacyIndexManager {
    pub fn new(io: IndexBlobIo) -> Self {
        Self { io }
    }

    /// Inputs named by a compaction log whose outputs all exist.
    fn superseded_blobs(&self) -> Result<BTreeSet<BlobId>> {
        let mut superseded = BTreeSet::new();
        for meta in self.io.list(COMPACTION_LOG_PREFIX)? {
            let Some(bytes) = self.io.storage().get(meta.id.as_str())? else {
                continue;
            };
            let log: CompactionLog = serde_json::from_slice(&bytes)?;
            let mut complete = true;
            for out in &log.outputs {
                if !self.io.storage().exists(out.as_str())? {
                    complete = false;
                    break;
                }
            }
            if complete {
                superseded.extend(log.inputs);
            }
        }
        Ok(superseded)
    }

    fn write_log(&self, log: &CompactionLog) -> Result<BlobId> {
        let bytes = serde_json::to_vec(log)?;
        let digest = hex::encode(Blake2b::<U32>::digest(&bytes));
        let id = BlobId::new(format!("{COMPACTION_LOG_PREFIX}{}", &digest[..32]));
        self.io.storage().put(id.as_str(), &bytes)?;
        Ok(id)
    }

    /// Remove every legacy index blob and compaction log. Used once an
    /// upgrade to the epoch index has been committed.
    pub fn delete_all(&self) -> Result<usize> {
        let mut deleted = 0;
        for prefix in [LEGACY_INDEX_PREFIX, COMPACTION_LOG_PREFIX] {
            for meta in self.io.list(prefix)? {
                self.io.delete(&meta.id)?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}

impl IndexBlobManager for LegacyIndexManager {
    fn index_version(&self) -> IndexVersion {
        IndexVersion::V0
    }

    fn blob_prefixes(&self) -> &'static [&'static str] {
        &[LEGACY_INDEX_PREFIX]
    }

    fn write_index_blob(&self, entries: &[ContentInfo]) -> Result<IndexBlobInfo> {
        self.io.write(LEGACY_INDEX_PREFIX, entries, IndexVersion::V0)
    }

    fn list_index_blobs(&self, include_superseded: bool) -> Result<Vec<IndexBlobInfo>> {
        let superseded = self.superseded_blobs()?;
        Ok(self
            .io
            .list(LEGACY_INDEX_PREFIX)?
            .into_iter()
            .map(|meta| {
                let gone = superseded.contains(&meta.id);
                IndexBlobInfo::from_metadata(meta, gone)
            })
            .filter(|info| include_superseded || !info.superseded)
            .collect())
    }

    fn load_merged(&self) -> Result<MergedIndex> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let blobs = self.list_index_blobs(false)?;
            match self.io.read_merged(blobs.iter().map(|b| &b.id)) {
                Err(e) if is_vanished_blob(&e) && attempt < MAX_LOAD_ATTEMPTS => {
                    debug!("index blob vanished during load, re-listing: {e}");
                }
                other => return other,
            }
        }
    }

    fn compact(&self, opts: &CompactOptions) -> Result<CompactStats> {
        opts.validate()?;
        let active = self.list_index_blobs(false)?;
        let drops = opts.has_drops();
        let inputs: Vec<IndexBlobInfo> = if opts.all_indexes || drops {
            active
        } else {
            active
                .into_iter()
                .filter(|b| b.length < SMALL_INDEX_BLOB_BYTES)
                .collect()
        };
        if inputs.is_empty() || (!drops && inputs.len() <= opts.max_small_blobs.max(1)) {
            debug!(candidates = inputs.len(), "legacy index compaction not needed");
            return Ok(CompactStats::default());
        }

        let mut merged = self.io.read_merged(inputs.iter().map(|b| &b.id))?;
        let mut dropped = 0;
        for id in opts.ids_to_drop(&merged) {
            if merged.remove(&id).is_some() {
                dropped += 1;
            }
        }
        let entries = merged.into_entries();
        let output = if entries.is_empty() {
            None
        } else {
            Some(self.write_index_blob(&entries)?)
        };

        let log_id = self.write_log(&CompactionLog {
            inputs: inputs.iter().map(|b| b.id.clone()).collect(),
            outputs: output.iter().map(|o| o.id.clone()).collect(),
        })?;
        let mut deleted = 0;
        for input in &inputs {
            if output.as_ref().is_some_and(|o| o.id == input.id) || self.io.is_corrupt(&input.id)
            {
                continue;
            }
            self.io.delete(&input.id)?;
            deleted += 1;
        }
        self.io.storage().delete(log_id.as_str())?;

        info!(
            inputs = inputs.len(),
            dropped,
            "compacted legacy index blobs"
        );
        Ok(CompactStats {
            input_blobs: inputs.len(),
            output_blobs: usize::from(output.is_some()),
            deleted_blobs: deleted,
            dropped_entries: dropped,
        })
    }
}
