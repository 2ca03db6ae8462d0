use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::clock::Clock;
use crate::error::{Result, StrataError};

/// Longest slice a real sleep waits before re-checking the shutdown flag.
const SLEEP_SLICE: Duration = Duration::from_millis(250);

/// Return `Err(StrataError::Interrupted)` if the shutdown flag is set.
pub fn check_interrupted(shutdown: Option<&AtomicBool>) -> Result<()> {
    if shutdown.is_some_and(|f| f.load(Ordering::Relaxed)) {
        return Err(StrataError::Interrupted);
    }
    Ok(())
}

/// Sleep through `clock`, waking in slices so an interrupt aborts the wait
/// with an error instead of a silent return.
pub fn sleep_interruptible(
    clock: &dyn Clock,
    duration: Duration,
    shutdown: Option<&AtomicBool>,
) -> Result<()> {
    let mut remaining = duration;
    while !remaining.is_zero() {
        check_interrupted(shutdown)?;
        let step = remaining.min(SLEEP_SLICE);
        clock.sleep(step);
        remaining -= step;
    }
    check_interrupted(shutdown)
}

/// Serialize `std::time::Duration` as whole seconds.
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
