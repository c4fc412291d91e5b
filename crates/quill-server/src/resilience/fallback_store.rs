//! Process-local window counters used while the shared store is unreachable.
//!
//! Limits enforced here are per instance. With several instances behind a
//! load balancer a caller can get up to `instances * max_requests` through
//! while the shared store is down.
//!
//! Windows are aligned to multiples of the policy window, the same
//! boundaries the shared counters use, so a caller's reset time does not
//! move when the limiter switches between the two.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::debug;

use quill_core::Clock;

use super::policy::RateLimitPolicy;
use super::rate_limiter::RateLimitDecision;

/// Default entry count above which expired entries are swept on insert
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

#[derive(Debug, Clone, Copy)]
struct WindowCounterEntry {
    count: u64,
    reset_at_ms: u64,
}

/// In-memory fixed-window counter keyed by (policy, identity)
#[derive(Debug)]
pub struct FallbackStore {
    entries: DashMap<(String, String), WindowCounterEntry>,
    max_entries: usize,
}

impl FallbackStore {
    /// Create a store that sweeps once it holds more than `max_entries`
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries,
        }
    }

    /// Count one request and decide on it
    pub fn check(&self, policy: &RateLimitPolicy, identity: &str, now_ms: u64) -> RateLimitDecision {
        let key = (policy.name.clone(), identity.to_string());
        let window_ms = policy.window_ms.max(1);
        let window_end = (now_ms / window_ms * window_ms).saturating_add(window_ms);

        let entry = {
            let mut slot = self.entries.entry(key).or_insert(WindowCounterEntry {
                count: 0,
                reset_at_ms: 0,
            });
            if slot.count == 0 || now_ms >= slot.reset_at_ms {
                *slot = WindowCounterEntry {
                    count: 1,
                    reset_at_ms: window_end,
                };
            } else {
                slot.count += 1;
            }
            *slot
        };

        // The shard lock is released above; retain() would deadlock otherwise.
        if self.entries.len() > self.max_entries {
            let removed = self.sweep_expired(now_ms);
            debug!(removed, remaining = self.entries.len(), "Fallback store over capacity, swept expired entries");
        }

        RateLimitDecision::from_count(policy, entry.count, entry.reset_at_ms, true)
    }

    /// Drop every entry whose window has ended; returns how many were removed
    pub fn sweep_expired(&self, now_ms: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| now_ms < entry.reset_at_ms);
        before.saturating_sub(self.entries.len())
    }

    /// Sweep periodically on a background task
    pub fn spawn_sweeper(self: Arc<Self>, clock: Arc<dyn Clock>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            loop {
                ticker.tick().await;
                let removed = self.sweep_expired(clock.now_ms());
                if removed > 0 {
                    debug!(removed, "Fallback sweeper removed expired entries");
                }
            }
        })
    }

    /// Number of tracked (policy, identity) pairs
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is tracked
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for FallbackStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}
