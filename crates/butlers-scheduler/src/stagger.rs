//! Deterministic per-butler schedule staggering.
//!
//! Many butlers declaring the same cron line would otherwise fire in one
//! synchronized burst. Each butler's firings are shifted by a stable
//! offset derived from its name, bounded by `min(15 minutes, interval/2)`
//! so the cadence itself never changes.

use chrono::Duration;

/// Upper bound on any stagger offset.
const MAX_OFFSET_SECS: i64 = 15 * 60;

/// FNV-1a over the butler name. Stable across runs and platforms.
fn stable_hash(name: &str) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325_u64;
    for byte in name.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// The stagger offset for one butler and cadence.
///
/// Bounded by `min(15 minutes, interval/2)`; an unknown or degenerate
/// interval yields no offset.
#[must_use]
pub fn stagger_offset(butler: &str, interval_seconds: Option<i64>) -> Duration {
    let Some(interval) = interval_seconds else {
        return Duration::zero();
    };
    let bound = MAX_OFFSET_SECS.min(interval / 2);
    if bound <= 0 {
        return Duration::zero();
    }
    let offset = i64::try_from(stable_hash(butler) % u64::try_from(bound).unwrap_or(1))
        .unwrap_or(0);
    Duration::seconds(offset)
}
