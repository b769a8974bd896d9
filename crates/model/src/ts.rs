//! Hybrid logical timestamps.
//!
//! A `Ts` packs a physical wall-clock component (milliseconds since the Unix
//! epoch) into the upper bits and a logical counter into the lower 18 bits,
//! mirroring the upstream store's TSO layout. `0` is the sentinel "unknown"
//! timestamp throughout the processor.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// 64-bit hybrid logical timestamp. Total order; `0` means "unknown".
pub type Ts = u64;

/// Number of low bits reserved for the logical counter.
pub const LOGICAL_BITS: u32 = 18;

/// Compose a timestamp from a physical millisecond clock and a logical counter.
pub fn compose(physical_ms: u64, logical: u64) -> Ts {
    (physical_ms << LOGICAL_BITS) | (logical & ((1 << LOGICAL_BITS) - 1))
}

/// Extract the physical component in milliseconds since the Unix epoch.
pub fn physical_ms(ts: Ts) -> u64 {
    ts >> LOGICAL_BITS
}

/// Extract the logical counter.
pub fn logical(ts: Ts) -> u64 {
    ts & ((1 << LOGICAL_BITS) - 1)
}

/// Convert a timestamp's physical component to a `SystemTime`.
pub fn to_system_time(ts: Ts) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(physical_ms(ts))
}

/// Compose a timestamp from a wall-clock instant, logical counter zero.
///
/// Times before the Unix epoch clamp to `0`.
pub fn from_system_time(t: SystemTime) -> Ts {
    let ms = t
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    compose(ms, 0)
}

/// Current wall-clock time as a timestamp, logical counter zero.
pub fn now() -> Ts {
    from_system_time(SystemTime::now())
}
