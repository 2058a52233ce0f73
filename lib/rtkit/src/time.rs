use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the unix epoch; a pre-epoch clock reads as zero.
#[inline]
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}
