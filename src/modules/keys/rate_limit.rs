use std::collections::VecDeque;

use dashmap::DashMap;

/// Per-key sliding-window request limiter. In-process only; the interface is
/// narrow enough that a shared backend can replace it for multi-process
/// deployments.
pub struct SlidingWindowLimiter {
    windows: DashMap<String, VecDeque<i64>>,
    max_tracked: usize,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Limited { retry_after_secs: u64 },
}

impl SlidingWindowLimiter {
    pub fn new(max_tracked: usize) -> Self {
        Self {
            windows: DashMap::new(),
            max_tracked,
        }
    }

    /// Admit or reject one request for `key_id` under `max_requests` per
    /// `window_ms`. Admission records the request.
    pub fn check(&self, key_id: &str, max_requests: u32, window_ms: u64) -> RateDecision {
        let now = chrono::Utc::now().timestamp_millis();
        let window_start = now - window_ms as i64;

        let mut entry = self.windows.entry(key_id.to_string()).or_default();
        while entry.front().is_some_and(|&t| t <= window_start) {
            entry.pop_front();
        }

        if entry.len() >= max_requests as usize {
            let oldest = entry.front().copied().unwrap_or(now);
            let retry_after_ms = (oldest + window_ms as i64 - now).max(0) as u64;
            return RateDecision::Limited {
                retry_after_secs: retry_after_ms.div_ceil(1_000).max(1),
            };
        }

        entry.push_back(now);
        drop(entry);

        if self.windows.len() > self.max_tracked {
            self.evict_stale(window_start);
        }
        RateDecision::Allowed
    }

    pub fn clear(&self, key_id: &str) {
        self.windows.remove(key_id);
    }

    fn evict_stale(&self, window_start: i64) {
        self.windows
            .retain(|_, timestamps| timestamps.back().is_some_and(|&t| t > window_start));
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.windows.len()
    }
}
