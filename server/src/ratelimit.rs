//! §4.D Rate Limiter — fixed 1s window per IP, O(1) `allow`, swept every
//! 10 min. Guarded by a single mutex: the window check-then-update must
//! be one atomic step, so this is plain `Mutex<HashMap<..>>` rather than
//! a lock-free `DashMap` like the other registries (see DESIGN.md).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(1);
const SWEEP_INTERVAL: Duration = Duration::from_secs(600);
const SWEEP_IDLE_THRESHOLD: Duration = Duration::from_secs(600);

struct Visitor {
    count: u32,
    last_reset: Instant,
}

pub struct RateLimiter {
    visitors: Mutex<HashMap<String, Visitor>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        RateLimiter {
            visitors: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `true` if `ip` may proceed under `limit` requests/second.
    pub fn allow(&self, ip: &str, limit: u32) -> bool {
        let now = Instant::now();
        let mut visitors = self.visitors.lock().unwrap();
        match visitors.get_mut(ip) {
            None => {
                visitors.insert(
                    ip.to_string(),
                    Visitor {
                        count: 1,
                        last_reset: now,
                    },
                );
                true
            }
            Some(v) => {
                if now.duration_since(v.last_reset) > WINDOW {
                    v.count = 1;
                    v.last_reset = now;
                    true
                } else if v.count >= limit {
                    false
                } else {
                    v.count += 1;
                    true
                }
            }
        }
    }

    fn sweep(&self) {
        let now = Instant::now();
        let mut visitors = self.visitors.lock().unwrap();
        visitors.retain(|_, v| now.duration_since(v.last_reset) <= SWEEP_IDLE_THRESHOLD);
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawns the background sweeper task. Returns its `JoinHandle` so the
/// caller can hold onto it if it ever needs to be stopped explicitly;
/// in practice the server never tears this down before process exit.
pub fn spawn_sweeper(limiter: std::sync::Arc<RateLimiter>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tick.tick().await;
            limiter.sweep();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_limit_then_rejects() {
        let limiter = RateLimiter::new();
        for _ in 0..3 {
            assert!(limiter.allow("1.2.3.4", 3));
        }
        assert!(!limiter.allow("1.2.3.4", 3));
        assert!(!limiter.allow("1.2.3.4", 3));
    }

    #[test]
    fn separate_ips_have_separate_windows() {
        let limiter = RateLimiter::new();
        assert!(limiter.allow("a", 1));
        assert!(limiter.allow("b", 1));
        assert!(!limiter.allow("a", 1));
    }
}
