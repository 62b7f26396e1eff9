//! Per-peer rate limiting of profile discovery traffic.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Minimum spacing between profile requests sent to one peer.
pub const PROFILE_REQUEST_INTERVAL: Duration = Duration::from_millis(5000);
/// Minimum spacing between profile replies sent to one peer.
pub const PROFILE_REPLY_INTERVAL: Duration = Duration::from_millis(2000);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThrottlePurpose {
    ProfileRequest,
    ProfileReply,
}

/// Two independent limiters keyed by peer. Windows are created on first use and kept
/// for the life of the process.
#[derive(Debug)]
pub struct ThrottlePolicy {
    request_interval: Duration,
    reply_interval: Duration,
    last: HashMap<(ThrottlePurpose, String), Instant>,
}

impl ThrottlePolicy {
    pub fn new() -> Self {
        Self::with_intervals(PROFILE_REQUEST_INTERVAL, PROFILE_REPLY_INTERVAL)
    }

    pub fn with_intervals(request_interval: Duration, reply_interval: Duration) -> Self {
        Self {
            request_interval,
            reply_interval,
            last: HashMap::new(),
        }
    }

    pub fn interval(&self, purpose: ThrottlePurpose) -> Duration {
        match purpose {
            ThrottlePurpose::ProfileRequest => self.request_interval,
            ThrottlePurpose::ProfileReply => self.reply_interval,
        }
    }

    /// Returns false (and records `now`) when the action may proceed; true when it falls
    /// inside the window, in which case the recorded instant is left untouched.
    pub fn should_throttle(&mut self, purpose: ThrottlePurpose, peer: &str, now: Instant) -> bool {
        let interval = self.interval(purpose);
        let key = (purpose, peer.to_string());
        if let Some(prev) = self.last.get(&key) {
            if now.saturating_duration_since(*prev) < interval {
                return true;
            }
        }
        self.last.insert(key, now);
        false
    }

    /// Number of (purpose, peer) windows currently tracked.
    pub fn tracked(&self) -> usize {
        self.last.len()
    }
}

impl Default for ThrottlePolicy {
    fn default() -> Self {
        Self::new()
    }
}
