use std::time::Duration;

use crate::error::{Result, StrataError};

pub(super) fn default_encryption_mode() -> String {
    "none".to_string()
}

pub(super) fn default_algorithm() -> String {
    "lz4".to_string()
}

pub(super) fn default_zstd_level() -> i32 {
    3
}

pub(super) fn default_max_pack_size() -> u64 {
    crate::format::DEFAULT_MAX_PACK_SIZE
}

pub(super) fn default_recovery_parallelism() -> usize {
    4
}

pub(super) fn default_io_drain_timeout() -> String {
    "15m".to_string()
}

pub(super) fn default_status_poll_interval() -> String {
    "1m".to_string()
}

pub(super) fn default_max_clock_drift() -> String {
    "5s".to_string()
}

/// Parse `30s`, `15m`, `4h` or `7d`. A bare number is seconds.
pub fn parse_human_duration(raw: &str) -> Result<Duration> {
    let input = raw.trim();
    let (num_part, unit) = match input.chars().last() {
        Some(c) if c.is_ascii_alphabetic() => (&input[..input.len() - 1], Some(c)),
        Some(_) => (input, None),
        None => {
            return Err(StrataError::Config("duration must not be empty".into()));
        }
    };

    let value: u64 = num_part
        .trim()
        .parse()
        .map_err(|_| StrataError::Config(format!("invalid duration value: '{raw}'")))?;

    let secs = match unit {
        None | Some('s') | Some('S') => value,
        Some('m') | Some('M') => value.saturating_mul(60),
        Some('h') | Some('H') => value.saturating_mul(60 * 60),
        Some('d') | Some('D') => value.saturating_mul(60 * 60 * 24),
        Some(other) => {
            return Err(StrataError::Config(format!(
                "unsupported duration suffix '{other}' in '{raw}' (use s/m/h/d)"
            )));
        }
    };

    if secs == 0 {
        return Err(StrataError::Config(
            "duration must be greater than zero".into(),
        ));
    }

    Ok(Duration::from_secs(secs))
}
