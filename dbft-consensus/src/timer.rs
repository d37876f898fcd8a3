//! Timer policy.
//!
//! There is a single outstanding deadline per round. Re-arming replaces it,
//! extending it never shortens it.

use std::time::Duration;

use dbft_types::{RoundTag, Timestamp, ViewNumber};

/// `base << exp`, saturating.
pub fn backoff(base: Duration, exp: u32) -> Duration {
    let f = 1u64.checked_shl(exp).unwrap_or(u64::MAX);
    Duration::from_millis((base.as_millis() as u64).saturating_mul(f))
}

/// How long a voter waits for progress in the given view.
pub fn view_timeout(block_time: Duration, v: ViewNumber) -> Duration {
    backoff(block_time, u32::from(v.u8()) + 1)
}

/// How long the proposer waits after sending its proposal.
///
/// View 0 saves one block time, the proposer does not need the full interval.
pub fn proposal_timeout(block_time: Duration, v: ViewNumber) -> Duration {
    let t = view_timeout(block_time, v);
    if v.is_zero() {
        t.saturating_sub(block_time)
    } else {
        t
    }
}

/// How long the proposer waits before proposing at the start of a height.
///
/// `elapsed` is the time since the previous block arrived, if it was the one
/// directly before this height.
pub fn proposer_delay(block_time: Duration, elapsed: Option<Duration>) -> Duration {
    match elapsed {
        Some(d) => block_time.saturating_sub(d),
        None => block_time,
    }
}

/// The time an extension by factor `k` adds, `k * block_time / m`.
pub fn extension(block_time: Duration, k: u32, m: usize) -> Duration {
    let ms = block_time.as_millis() as u64 * u64::from(k) / m.max(1) as u64;
    Duration::from_millis(ms)
}

/// The currently armed deadline.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Deadline {
    tag: RoundTag,
    armed_at: Timestamp,
    delay: Duration,
}

impl Deadline {
    pub fn new(tag: RoundTag, armed_at: Timestamp, delay: Duration) -> Self {
        Self {
            tag,
            armed_at,
            delay,
        }
    }

    pub fn tag(&self) -> RoundTag {
        self.tag
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn expires_at(&self) -> Timestamp {
        self.armed_at + self.delay
    }

    pub fn remaining(&self, now: Timestamp) -> Duration {
        self.delay.saturating_sub(now.since(self.armed_at))
    }

    /// The delay to re-arm with if extending by `add` makes the deadline later.
    pub fn extended(&self, now: Timestamp, add: Duration) -> Option<Duration> {
        let remaining = self.remaining(now);
        let next = remaining + add;
        (next > remaining).then_some(next)
    }
}
