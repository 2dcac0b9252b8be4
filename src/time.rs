use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the epoch, matching the original's `time_t now = time(0)`.
pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the epoch")
        .as_secs()
}
