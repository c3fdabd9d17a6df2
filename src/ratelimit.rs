//! Fixed-window request limiting for the token routes.
//!
//! State lives in this process only; every instance counts on its own.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Deserialize, Debug, Clone, Copy)]
pub struct RateLimitConfig {
    #[serde(default = "default_requests")]
    pub requests: u32,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Most windows held at once; new keys are refused beyond it.
    #[serde(default = "default_max_tracked")]
    pub max_tracked: usize,
}

fn default_requests() -> u32 {
    30
}

fn default_window_secs() -> u64 {
    60
}

fn default_max_tracked() -> usize {
    10_000
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests: default_requests(),
            window_secs: default_window_secs(),
            max_tracked: default_max_tracked(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    reset_at: Instant,
}

pub struct RateLimiter {
    limit: u32,
    window: Duration,
    max_tracked: usize,
    entries: std::sync::RwLock<HashMap<String, Window>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            limit: config.requests,
            window: Duration::from_secs(config.window_secs),
            max_tracked: config.max_tracked,
            entries: Default::default(),
        }
    }

    /// Counts one request under `key`; false once the window is exhausted.
    pub fn check(&self, key: &str) -> bool {
        self.check_at(key, Instant::now())
    }

    fn check_at(&self, key: &str, now: Instant) -> bool {
        let mut entries = match self.entries.write() {
            Ok(e) => e,
            Err(poisoned) => poisoned.into_inner(),
        };
        match entries.get_mut(key) {
            Some(w) if w.reset_at > now => {
                if w.count >= self.limit {
                    false
                } else {
                    w.count += 1;
                    true
                }
            }
            Some(_) => {
                entries.insert(key.to_string(), Window { count: 1, reset_at: now + self.window });
                self.limit > 0
            }
            None => {
                if entries.len() >= self.max_tracked {
                    entries.retain(|_, w| w.reset_at > now);
                    if entries.len() >= self.max_tracked {
                        warn!("Tracking {} rate limit windows, refusing new keys", entries.len());
                        return false;
                    }
                }
                entries.insert(key.to_string(), Window { count: 1, reset_at: now + self.window });
                self.limit > 0
            }
        }
    }

    /// Drops expired windows, returning how many were removed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    fn sweep_at(&self, now: Instant) -> usize {
        let mut entries = match self.entries.write() {
            Ok(e) => e,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = entries.len();
        entries.retain(|_, w| w.reset_at > now);
        before - entries.len()
    }

    pub fn tracked(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }
}

/// Spawns the sweeper once the server is up and stops it on shutdown.
pub fn sweeper() -> rocket::fairing::AdHoc {
    rocket::fairing::AdHoc::on_liftoff("Rate limit sweeper", |rocket| Box::pin(async move {
        let limiter = match rocket.state::<Arc<RateLimiter>>() {
            Some(l) => l.clone(),
            None => {
                warn!("No rate limiter managed, not sweeping");
                return;
            }
        };
        let shutdown = rocket.shutdown();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.tick().await;
            tokio::pin!(shutdown);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = limiter.sweep();
                        trace!("Swept {} rate limit window(s), {} tracked", removed, limiter.tracked());
                    }
                    _ = &mut shutdown => break,
                }
            }
        });
    }))
}
