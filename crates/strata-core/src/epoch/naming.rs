//! Blob naming for the epoch index.
//!
//! - `xn<epoch>_<hash>`: uncompacted index blob written during `epoch`
//! - `xs<epoch>_<hash>`: single-epoch compaction of `epoch`
//! - `xr<min>_<max>_<hash>`: range checkpoint covering `[min, max]`
//! - `xe<epoch>`: marker that `epoch` has started
//! - `xd<unix seconds>`: deletion watermark

use chrono::{DateTime, Utc};

/// Every epoch-index blob lives under this prefix.
pub const EPOCH_INDEX_PREFIX: &str = "x";
pub const UNCOMPACTED_PREFIX: &str = "xn";
pub const SINGLE_EPOCH_PREFIX: &str = "xs";
pub const RANGE_CHECKPOINT_PREFIX: &str = "xr";
pub const EPOCH_MARKER_PREFIX: &str = "xe";
pub const DELETION_WATERMARK_PREFIX: &str = "xd";

pub fn uncompacted_prefix(epoch: u64) -> String {
    format!("{UNCOMPACTED_PREFIX}{epoch}_")
}

pub fn single_epoch_prefix(epoch: u64) -> String {
    format!("{SINGLE_EPOCH_PREFIX}{epoch}_")
}

pub fn range_checkpoint_prefix(min_epoch: u64, max_epoch: u64) -> String {
    format!("{RANGE_CHECKPOINT_PREFIX}{min_epoch}_{max_epoch}_")
}

pub fn epoch_marker_id(epoch: u64) -> String {
    format!("{EPOCH_MARKER_PREFIX}{epoch}")
}

pub fn deletion_watermark_id(time: DateTime<Utc>) -> String {
    format!("{DELETION_WATERMARK_PREFIX}{}", time.timestamp())
}

/// Split a leading decimal number terminated by `_` off `s`.
fn leading_number(s: &str) -> Option<(u64, &str)> {
    let (digits, rest) = s.split_once('_')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((digits.parse().ok()?, rest))
}

/// Epoch number of an `xn` or `xs` blob.
pub fn parse_epoch(id: &str, prefix: &str) -> Option<u64> {
    leading_number(id.strip_prefix(prefix)?).map(|(epoch, _)| epoch)
}

/// `(min, max)` of an `xr` blob.
pub fn parse_range(id: &str) -> Option<(u64, u64)> {
    let (min, rest) = leading_number(id.strip_prefix(RANGE_CHECKPOINT_PREFIX)?)?;
    let (max, _) = leading_number(rest)?;
    (min <= max).then_some((min, max))
}

fn whole_number(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

pub fn parse_marker(id: &str) -> Option<u64> {
    whole_number(id.strip_prefix(EPOCH_MARKER_PREFIX)?)
}

pub fn parse_watermark(id: &str) -> Option<DateTime<Utc>> {
    let secs = whole_number(id.strip_prefix(DELETION_WATERMARK_PREFIX)?)?;
    DateTime::from_timestamp(i64::try_from(secs).ok()?, 0)
}

/// The name prefix a replacement for `id` must be written under so it
/// lands in the same set.
pub fn set_prefix_of(id: &str) -> Option<&str> {
    let cut = id.rfind('_')?;
    Some(&id[..=cut])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_blob_family() {
        assert_eq!(parse_epoch("xn12_abcdef", UNCOMPACTED_PREFIX), Some(12));
        assert_eq!(parse_epoch("xs3_ff", SINGLE_EPOCH_PREFIX), Some(3));
        assert_eq!(parse_range("xr0_6_abc"), Some((0, 6)));
        assert_eq!(parse_marker("xe7"), Some(7));
        assert_eq!(
            parse_watermark("xd1700000000").map(|t| t.timestamp()),
            Some(1_700_000_000)
        );
    }

    #[test]
    fn rejects_malformed_names() {
        assert_eq!(parse_epoch("xn_abc", UNCOMPACTED_PREFIX), None);
        assert_eq!(parse_epoch("xnab_c", UNCOMPACTED_PREFIX), None);
        assert_eq!(parse_range("xr5_2_abc"), None);
        assert_eq!(parse_range("xr5_abc"), None);
        assert_eq!(parse_marker("xe"), None);
        assert_eq!(parse_marker("xe1_"), None);
    }

    #[test]
    fn set_prefix_keeps_epoch_and_range() {
        assert_eq!(set_prefix_of("xn4_deadbeef"), Some("xn4_"));
        assert_eq!(set_prefix_of("xr0_9_deadbeef"), Some("xr0_9_"));
        assert_eq!(
            format!("{}abc", range_checkpoint_prefix(0, 9)),
            "xr0_9_abc"
        );
    }
}
