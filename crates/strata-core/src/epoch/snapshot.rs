use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use super::naming::{
    parse_epoch, parse_marker, parse_range, parse_watermark, DELETION_WATERMARK_PREFIX,
    EPOCH_MARKER_PREFIX, SINGLE_EPOCH_PREFIX, UNCOMPACTED_PREFIX,
};
use strata_types::BlobMetadata;

/// All blobs of one `xr<min>_<max>_` checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeCheckpoint {
    pub min_epoch: u64,
    pub max_epoch: u64,
    pub blobs: Vec<BlobMetadata>,
}

impl RangeCheckpoint {
    pub fn covers(&self, epoch: u64) -> bool {
        self.min_epoch <= epoch && epoch <= self.max_epoch
    }
}

/// Point-in-time view of the epoch index, built from one listing of `x`.
#[derive(Debug, Clone)]
pub struct CurrentSnapshot {
    pub write_epoch: u64,
    /// When each known epoch began (marker timestamp; first blob for 0).
    pub epoch_start_times: BTreeMap<u64, DateTime<Utc>>,
    pub uncompacted: BTreeMap<u64, Vec<BlobMetadata>>,
    pub single_epoch_sets: BTreeMap<u64, Vec<BlobMetadata>>,
    /// Every range checkpoint found, ordered by `(min, max)`.
    pub range_checkpoints: Vec<RangeCheckpoint>,
    /// Contiguous checkpoints from epoch 0 reaching furthest.
    pub longest_range_chain: Vec<RangeCheckpoint>,
    pub markers: Vec<BlobMetadata>,
    pub deletion_watermark: Option<DateTime<Utc>>,
    pub deletion_watermark_blobs: Vec<BlobMetadata>,
    pub valid_until: DateTime<Utc>,
}

impl CurrentSnapshot {
    pub(crate) fn from_listing(blobs: Vec<BlobMetadata>, valid_until: DateTime<Utc>) -> Self {
        let mut uncompacted: BTreeMap<u64, Vec<BlobMetadata>> = BTreeMap::new();
        let mut single_epoch_sets: BTreeMap<u64, Vec<BlobMetadata>> = BTreeMap::new();
        let mut ranges: BTreeMap<(u64, u64), Vec<BlobMetadata>> = BTreeMap::new();
        let mut markers = Vec::new();
        let mut epoch_start_times = BTreeMap::new();
        let mut watermark_blobs = Vec::new();
        let mut deletion_watermark: Option<DateTime<Utc>> = None;

        for meta in blobs {
            let id = meta.id.as_str();
            if let Some(epoch) = parse_epoch(id, UNCOMPACTED_PREFIX) {
                uncompacted.entry(epoch).or_default().push(meta);
            } else if let Some(epoch) = parse_epoch(id, SINGLE_EPOCH_PREFIX) {
                single_epoch_sets.entry(epoch).or_default().push(meta);
            } else if let Some(range) = parse_range(id) {
                ranges.entry(range).or_default().push(meta);
            } else if id.starts_with(EPOCH_MARKER_PREFIX) {
                if let Some(epoch) = parse_marker(id) {
                    epoch_start_times.insert(epoch, meta.timestamp);
                    markers.push(meta);
                }
            } else if id.starts_with(DELETION_WATERMARK_PREFIX) {
                if let Some(ts) = parse_watermark(id) {
                    deletion_watermark = deletion_watermark.max(Some(ts));
                    watermark_blobs.push(meta);
                }
            }
        }

        let write_epoch = markers
            .iter()
            .filter_map(|m| parse_marker(m.id.as_str()))
            .max()
            .unwrap_or(0);
        if let Some(first) = uncompacted
            .get(&0)
            .and_then(|blobs| blobs.iter().map(|b| b.timestamp).min())
        {
            epoch_start_times.entry(0).or_insert(first);
        }

        let range_checkpoints: Vec<RangeCheckpoint> = ranges
            .into_iter()
            .map(|((min_epoch, max_epoch), blobs)| RangeCheckpoint {
                min_epoch,
                max_epoch,
                blobs,
            })
            .collect();
        let longest_range_chain = longest_chain(&range_checkpoints);

        Self {
            write_epoch,
            epoch_start_times,
            uncompacted,
            single_epoch_sets,
            range_checkpoints,
            longest_range_chain,
            markers,
            deletion_watermark,
            deletion_watermark_blobs: watermark_blobs,
            valid_until,
        }
    }

    /// Highest epoch covered by the range checkpoint chain.
    pub fn checkpoint_max(&self) -> Option<u64> {
        self.longest_range_chain.last().map(|r| r.max_epoch)
    }

    /// Newest epoch no writer can still be adding blobs to.
    pub fn settled_max(&self) -> Option<u64> {
        self.write_epoch.checked_sub(2)
    }

    /// Highest epoch holding any blob, never below the write epoch.
    pub fn max_epoch(&self) -> u64 {
        let last_uncompacted = self.uncompacted.keys().next_back().copied().unwrap_or(0);
        self.write_epoch.max(last_uncompacted)
    }

    /// Checkpoint in the chain that covers `epoch`.
    pub fn chain_range_for(&self, epoch: u64) -> Option<&RangeCheckpoint> {
        self.longest_range_chain.iter().find(|r| r.covers(epoch))
    }

    /// The minimal blob set describing epochs `0..=max_epoch`: the range
    /// chain first, then per epoch its single-epoch set if present, else its
    /// uncompacted blobs.
    pub fn complete_index_set(&self, max_epoch: u64) -> Vec<BlobMetadata> {
        let mut out = Vec::new();
        let mut next = 0;
        for range in &self.longest_range_chain {
            if range.max_epoch > max_epoch {
                break;
            }
            out.extend(range.blobs.iter().cloned());
            next = range.max_epoch + 1;
        }
        let epochs = self
            .uncompacted
            .keys()
            .chain(self.single_epoch_sets.keys())
            .copied()
            .filter(|e| *e >= next && *e <= max_epoch)
            .collect::<std::collections::BTreeSet<u64>>();
        for epoch in epochs {
            match self.single_epoch_sets.get(&epoch) {
                Some(set) if !set.is_empty() => out.extend(set.iter().cloned()),
                _ => {
                    if let Some(blobs) = self.uncompacted.get(&epoch) {
                        out.extend(blobs.iter().cloned());
                    }
                }
            }
        }
        out
    }
}

/// Contiguous chain of checkpoints starting at epoch 0 that reaches the
/// highest epoch.
fn longest_chain(ranges: &[RangeCheckpoint]) -> Vec<RangeCheckpoint> {
    let mut order: Vec<usize> = (0..ranges.len()).collect();
    order.sort_by(|a, b| ranges[*b].min_epoch.cmp(&ranges[*a].min_epoch));

    // start epoch -> (furthest epoch reached, chain of indices)
    let mut best: BTreeMap<u64, (u64, Vec<usize>)> = BTreeMap::new();
    for i in order {
        let range = &ranges[i];
        let (reach, mut chain) = best
            .get(&(range.max_epoch + 1))
            .cloned()
            .unwrap_or((range.max_epoch, Vec::new()));
        chain.insert(0, i);
        let reach = reach.max(range.max_epoch);
        match best.get(&range.min_epoch) {
            Some((existing, _)) if *existing >= reach => {}
            _ => {
                best.insert(range.min_epoch, (reach, chain));
            }
        }
    }

    best.remove(&0)
        .map(|(_, chain)| chain.into_iter().map(|i| ranges[i].clone()).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_types::BlobId;

    fn meta(id: &str, secs: i64) -> BlobMetadata {
        BlobMetadata {
            id: BlobId::new(id),
            length: 100,
            timestamp: DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap(),
        }
    }

    fn snapshot(ids: &[&str]) -> CurrentSnapshot {
        let blobs = ids.iter().enumerate().map(|(i, id)| meta(id, i as i64)).collect();
        CurrentSnapshot::from_listing(blobs, Utc::now())
    }

    #[test]
    fn write_epoch_is_highest_marker() {
        assert_eq!(snapshot(&[]).write_epoch, 0);
        assert_eq!(snapshot(&["xe1", "xe3", "xe2"]).write_epoch, 3);
    }

    #[test]
    fn longest_chain_prefers_furthest_reach() {
        let snap = snapshot(&["xr0_3_a", "xr0_5_b", "xr4_9_c", "xr6_8_d", "xr2_20_e"]);
        let chain: Vec<(u64, u64)> = snap
            .longest_range_chain
            .iter()
            .map(|r| (r.min_epoch, r.max_epoch))
            .collect();
        assert_eq!(chain, vec![(0, 3), (4, 9)]);
        assert_eq!(snap.checkpoint_max(), Some(9));
    }

    #[test]
    fn complete_set_prefers_compacted_forms() {
        let snap = snapshot(&[
            "xr0_1_r", "xn0_a", "xn1_b", "xn2_c", "xs2_s", "xn3_d", "xn3_e", "xe3",
        ]);
        let ids: Vec<String> = snap
            .complete_index_set(snap.max_epoch())
            .into_iter()
            .map(|m| m.id.into_string())
            .collect();
        assert_eq!(ids, vec!["xr0_1_r", "xs2_s", "xn3_d", "xn3_e"]);
    }

    #[test]
    fn keeps_latest_watermark() {
        let snap = snapshot(&["xd1700000000", "xd1700000500"]);
        assert_eq!(
            snap.deletion_watermark.map(|t| t.timestamp()),
            Some(1_700_000_500)
        );
        assert_eq!(snap.deletion_watermark_blobs.len(), 2);
    }
}
