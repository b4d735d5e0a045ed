//! Replay and staleness gate for inbound messages.
//!
//! Each inbound message carries a nonce and a claimed timestamp. A message
//! is rejected when the claimed timestamp falls outside the validity
//! window, or when its nonce was already accepted within the window.
//!
//! Freshness is judged against the timestamp *claimed* by the sender;
//! duplicate suppression is judged against the *local* time the nonce was
//! first accepted. A nonce accepted near the end of the window therefore
//! still blocks a late duplicate, and a peer with a skewed clock can be
//! rejected as stale even when its message is genuine. Both asymmetries
//! are intentional; do not trust claimed time for de-duplication.

use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

/// Validity window for nonces and claimed timestamps: 5 minutes
pub const REPLAY_WINDOW: Duration = Duration::from_secs(300);

/// In-memory nonce/timestamp deduplication gate
///
/// Check-and-record is atomic: of any set of concurrent calls bearing the
/// same nonce, exactly one is accepted. Records older than the window are
/// evicted through a time-ordered index, swept at the head of every call,
/// so the table never grows past one window of traffic.
pub struct ReplayProtector {
    window_ms: i64,
    state: Mutex<ReplayState>,
}

#[derive(Default)]
struct ReplayState {
    /// nonce → local acceptance time (epoch millis)
    seen: HashMap<String, i64>,
    /// (acceptance time, insertion seq) → nonce, for expiry sweeps
    by_time: BTreeMap<(i64, u64), String>,
    seq: u64,
}

impl Default for ReplayProtector {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplayProtector {
    /// Create a protector with the standard 5-minute window.
    pub fn new() -> Self {
        Self::with_window(REPLAY_WINDOW)
    }

    /// Create a protector with a custom window.
    pub fn with_window(window: Duration) -> Self {
        Self {
            window_ms: window.as_millis() as i64,
            state: Mutex::new(ReplayState::default()),
        }
    }

    /// Returns `true` when the message must be rejected as stale or as a
    /// duplicate. A rejected-as-stale nonce is not recorded.
    pub fn is_replay(&self, nonce: &str, claimed_timestamp_ms: i64) -> bool {
        let now = Utc::now().timestamp_millis();
        let mut state = self.state.lock().unwrap();
        state.evict_older_than(now - self.window_ms);

        // staleness: claimed time, not local time
        if now - claimed_timestamp_ms > self.window_ms {
            return true;
        }

        // duplicate: local acceptance time, not claimed time
        if let Some(&accepted_at) = state.seen.get(nonce) {
            if now - accepted_at <= self.window_ms {
                return true;
            }
        }

        let seq = state.seq;
        state.seq += 1;
        state.seen.insert(nonce.to_string(), now);
        state.by_time.insert((now, seq), nonce.to_string());
        false
    }

    /// Number of nonces currently tracked
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().seen.len()
    }

    /// Whether no nonces are currently tracked
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ReplayState {
    fn evict_older_than(&mut self, cutoff: i64) {
        loop {
            match self.by_time.first_key_value() {
                Some((&(ts, _), _)) if ts < cutoff => {}
                _ => break,
            }
            if let Some(((ts, _), nonce)) = self.by_time.pop_first() {
                // drop the table entry only if it still refers to this acceptance
                if self.seen.get(&nonce) == Some(&ts) {
                    self.seen.remove(&nonce);
                }
            }
        }
    }
}
