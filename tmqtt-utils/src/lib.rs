//! Small helpers shared by the tmqtt crates.
//!
//! - [`Counter`]: lock-free current/peak gauge used by the broker statistics
//! - duration strings such as `"1h30m15s"` or `"500ms"` via [`to_duration`],
//!   plus the serde helper so settings can carry them
//! - millisecond wall-clock timestamps
//!
//! ```
//! use tmqtt_utils::{to_duration, timestamp_millis};
//!
//! assert_eq!(to_duration("1h30m15s").as_secs(), 5415);
//! assert!(timestamp_millis() > 0);
//! ```

#![deny(unsafe_code)]

use std::time::Duration;

use serde::{de::Deserializer, Deserialize};

mod counter;

pub use counter::Counter;

/// Identifier of a broker node.
pub type NodeId = u64;

/// Milliseconds since the Unix epoch.
pub type TimestampMillis = i64;

/// Parses a duration written as a sequence of `<number><unit>` groups.
///
/// Units: `ms`, `s`, `m`, `h`, `d`, `w`. Unknown or malformed groups count as zero.
///
/// ```
/// assert_eq!(tmqtt_utils::to_duration("2w3d12h").as_secs(), 1_512_000);
/// assert_eq!(tmqtt_utils::to_duration("1s250ms").as_millis(), 1250);
/// ```
pub fn to_duration(text: &str) -> Duration {
    // "ms" is folded into one marker so each unit is a single char
    let text = text.trim().to_lowercase().replace("ms", "Y");
    let millis: u64 = text
        .split_inclusive(['Y', 's', 'm', 'h', 'd', 'w'])
        .map(|group| {
            let mut chars = group.chars();
            let unit = match chars.next_back() {
                Some(u) => u,
                None => return 0,
            };
            let value = match chars.as_str().parse::<u64>() {
                Ok(v) => v,
                Err(_) => return 0,
            };
            match unit {
                'Y' => value,
                's' => value * 1_000,
                'm' => value * 60_000,
                'h' => value * 3_600_000,
                'd' => value * 86_400_000,
                'w' => value * 604_800_000,
                _ => 0,
            }
        })
        .sum();
    Duration::from_millis(millis)
}

#[inline]
pub fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let v = String::deserialize(deserializer)?;
    Ok(to_duration(&v))
}

/// Current wall-clock time in milliseconds.
#[inline]
pub fn timestamp_millis() -> TimestampMillis {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|t| t.as_millis() as i64)
        .unwrap_or_else(|_| chrono::Local::now().timestamp_millis())
}
