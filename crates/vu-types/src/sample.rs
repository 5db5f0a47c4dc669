//! The samples channel payload. See `spec.md` §6 ("Samples channel") and
//! §4.3 step 6 (the "trail" sample emitted at the end of every iteration).

use crate::tags::TagSet;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-connection timing breakdown captured by the VU's dialer during one
/// iteration. Durations default to zero when the iteration made no network
/// call (a pure-compute script still emits a trail with all-zero timings).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectTiming {
    pub blocked: Duration,
    pub connecting: Duration,
    pub tls_handshaking: Duration,
    pub sending: Duration,
    pub waiting: Duration,
    pub receiving: Duration,
}

impl ConnectTiming {
    pub fn total(&self) -> Duration {
        self.blocked
            + self.connecting
            + self.tls_handshaking
            + self.sending
            + self.waiting
            + self.receiving
    }
}

/// The synthetic "trail" sample summarizing one iteration's network
/// activity, per `spec.md` §4.3 step 6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trail {
    pub vu_id: u64,
    pub iteration: u64,
    pub timings: ConnectTiming,
    pub tags: TagSet,
    /// False when the iteration was cut short by cancellation.
    pub full_iteration: bool,
    /// True when the configured exec name was the script-language default
    /// export (as opposed to a named alternate exec).
    pub is_default_exec: bool,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub duration: Duration,
}

/// A value emitted on the samples channel. `Trail` is the only variant the
/// core itself produces; `Custom` lets modules registered via the custom
/// module registry (`spec.md` §4.5) emit additional measurement points
/// (e.g. an HTTP module's per-request metric) on the same channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SampleContainer {
    Trail(Trail),
    Custom {
        metric: String,
        value: f64,
        tags: TagSet,
    },
}
