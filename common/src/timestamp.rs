use chrono::{DateTime, Utc};
use chrono_tz::Tz;

use crate::network::WifiMode;

/// `SSSSSS.mmm` seconds since boot.
pub fn uptime_stamp(uptime_ms: u64) -> String {
    format!("{:06}.{:03}", uptime_ms / 1_000, uptime_ms % 1_000)
}

/// Wall-clock local time in station mode once time is synchronized, uptime
/// otherwise.
pub fn timestamp(
    mode: WifiMode,
    wall_clock: Option<DateTime<Utc>>,
    timezone: Tz,
    uptime_ms: u64,
) -> String {
    match (mode, wall_clock) {
        (WifiMode::Station, Some(now)) => now
            .with_timezone(&timezone)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string(),
        _ => uptime_stamp(uptime_ms),
    }
}
