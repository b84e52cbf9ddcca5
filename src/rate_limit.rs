use std::collections::VecDeque;
use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Length of the trailing admission window.
pub const WINDOW: Duration = Duration::from_secs(60);

/// Per-origin sliding-window limiter.
///
/// Each origin keeps the instants of its admitted requests. Stale entries are
/// pruned lazily when the origin is next checked. Check and append happen
/// under the same map-entry guard.
#[derive(Debug)]
pub struct RateLimiter {
    cap: usize,
    window: Duration,
    windows: DashMap<String, VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(cap: usize) -> Self {
        Self::with_window(cap, WINDOW)
    }

    pub fn with_window(cap: usize, window: Duration) -> Self {
        Self {
            cap,
            window,
            windows: DashMap::new(),
        }
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn admit(&self, origin: &str) -> bool {
        self.admit_at(origin, Instant::now())
    }

    /// Admit `origin` at `now` if fewer than `cap` requests fall inside the
    /// window. A denial leaves the window untouched.
    pub fn admit_at(&self, origin: &str, now: Instant) -> bool {
        let mut window = self.windows.entry(origin.to_string()).or_default();
        while let Some(oldest) = window.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                window.pop_front();
            } else {
                break;
            }
        }
        if window.len() >= self.cap {
            return false;
        }
        window.push_back(now);
        true
    }

    /// Drop origins whose windows have fully expired.
    pub fn prune(&self, now: Instant) {
        self.windows.retain(|_, window| {
            window
                .back()
                .is_some_and(|last| now.saturating_duration_since(*last) < self.window)
        });
    }

    pub fn tracked_origins(&self) -> usize {
        self.windows.len()
    }
}
