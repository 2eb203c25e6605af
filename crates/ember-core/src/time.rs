//! Wall-clock timestamps for datagram expiry.
//!
//! Discovery packets carry an absolute expiration in seconds since the
//! Unix epoch; a packet whose expiration is in the past is rejected.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Seconds since the Unix epoch.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// Creates a timestamp from raw seconds.
    pub const fn new(secs: u64) -> Self {
        Self(secs)
    }

    /// The current wall-clock time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        Self(duration.as_secs())
    }

    /// A timestamp `duration` ahead of now.
    pub fn from_now(duration: Duration) -> Self {
        Self(Self::now().0.saturating_add(duration.as_secs()))
    }

    /// Raw seconds since the epoch.
    pub const fn as_secs(&self) -> u64 {
        self.0
    }

    /// Returns true if this deadline has passed relative to `now`.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.0 < now.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}s", self.0)
    }
}

impl From<u64> for Timestamp {
    fn from(secs: u64) -> Self {
        Self(secs)
    }
}

impl From<Timestamp> for u64 {
    fn from(ts: Timestamp) -> Self {
        ts.0
    }
}
