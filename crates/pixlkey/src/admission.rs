//! Attempt-counting rate limiter guarding run admission and downloads.
//!
//! Keys are `{action}_{actor}` (e.g. `zipproc_203.0.113.7`). A key is denied
//! once it has `limit` recorded attempts inside the sliding `window`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use moka::sync::Cache;

use crate::config::RateLimitConfig;

pub const PROCESS_ACTION: &str = "zipproc";
pub const DOWNLOAD_ACTION: &str = "download";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Denied { retry_after: Duration },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub limit: u32,
    pub window: Duration,
}

impl RateLimitPolicy {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self { limit, window }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.limit, Duration::from_secs(config.window_secs))
    }
}

pub trait RateLimitStore: Send + Sync {
    fn admit(&self, key: &str, policy: &RateLimitPolicy) -> Admission;
    fn record(&self, key: &str);
    fn reset(&self, key: &str);
}

pub fn rate_key(action: &str, actor: &str) -> String {
    format!("{}_{}", action, actor)
}

type Attempts = Arc<Mutex<VecDeque<Instant>>>;

/// In-process store. Idle keys expire from the cache after `idle_ttl`.
pub struct MemoryRateLimiter {
    attempts: Cache<String, Attempts>,
}

impl MemoryRateLimiter {
    pub fn new(idle_ttl: Duration) -> Self {
        Self {
            attempts: Cache::builder()
                .max_capacity(100_000)
                .time_to_idle(idle_ttl)
                .build(),
        }
    }

    fn bucket(&self, key: &str) -> Attempts {
        self.attempts
            .get_with(key.to_string(), || Arc::new(Mutex::new(VecDeque::new())))
    }
}

impl RateLimitStore for MemoryRateLimiter {
    fn admit(&self, key: &str, policy: &RateLimitPolicy) -> Admission {
        let Some(bucket) = self.attempts.get(key) else {
            return Admission::Allowed;
        };
        let Ok(mut attempts) = bucket.lock() else {
            return Admission::Allowed;
        };

        let now = Instant::now();
        while attempts
            .front()
            .is_some_and(|t| now.duration_since(*t) >= policy.window)
        {
            attempts.pop_front();
        }

        if (attempts.len() as u32) < policy.limit {
            return Admission::Allowed;
        }
        let oldest = attempts.front().copied().unwrap_or(now);
        Admission::Denied {
            retry_after: policy.window.saturating_sub(now.duration_since(oldest)),
        }
    }

    fn record(&self, key: &str) {
        if let Ok(mut attempts) = self.bucket(key).lock() {
            attempts.push_back(Instant::now());
        }
    }

    fn reset(&self, key: &str) {
        self.attempts.invalidate(key);
    }
}

/// A store paired with the policy it enforces for one action.
#[derive(Clone)]
pub struct AdmissionGate {
    store: Arc<dyn RateLimitStore>,
    policy: RateLimitPolicy,
    action: &'static str,
}

impl AdmissionGate {
    pub fn new(store: Arc<dyn RateLimitStore>, policy: RateLimitPolicy, action: &'static str) -> Self {
        Self {
            store,
            policy,
            action,
        }
    }

    /// Checks the actor and, when allowed, records the attempt.
    pub fn enter(&self, actor: &str) -> Admission {
        let key = rate_key(self.action, actor);
        let admission = self.store.admit(&key, &self.policy);
        if admission.is_allowed() {
            self.store.record(&key);
        } else {
            log::warn!("Rate limit reached for {}", self.action);
        }
        admission
    }

    /// Clears the actor's attempts after a successful run.
    pub fn clear(&self, actor: &str) {
        self.store.reset(&rate_key(self.action, actor));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn policy(limit: u32, window_ms: u64) -> RateLimitPolicy {
        RateLimitPolicy::new(limit, Duration::from_millis(window_ms))
    }

    #[test]
    fn test_rate_key_format() {
        assert_eq!(rate_key(PROCESS_ACTION, "203.0.113.7"), "zipproc_203.0.113.7");
    }

    #[test]
    fn test_denies_after_limit() {
        let limiter = MemoryRateLimiter::new(Duration::from_secs(60));
        let p = policy(3, 60_000);
        for _ in 0..3 {
            assert!(limiter.admit("k", &p).is_allowed());
            limiter.record("k");
        }
        match limiter.admit("k", &p) {
            Admission::Denied { retry_after } => {
                assert!(retry_after <= Duration::from_secs(60));
                assert!(retry_after > Duration::from_secs(50));
            }
            Admission::Allowed => panic!("expected denial"),
        }
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = MemoryRateLimiter::new(Duration::from_secs(60));
        let p = policy(1, 60_000);
        limiter.record("a");
        assert!(!limiter.admit("a", &p).is_allowed());
        assert!(limiter.admit("b", &p).is_allowed());
    }

    #[test]
    fn test_window_slides() {
        let limiter = MemoryRateLimiter::new(Duration::from_secs(60));
        let p = policy(1, 30);
        limiter.record("k");
        assert!(!limiter.admit("k", &p).is_allowed());
        thread::sleep(Duration::from_millis(50));
        assert!(limiter.admit("k", &p).is_allowed());
    }

    #[test]
    fn test_reset_clears_attempts() {
        let limiter = MemoryRateLimiter::new(Duration::from_secs(60));
        let p = policy(1, 60_000);
        limiter.record("k");
        limiter.reset("k");
        assert!(limiter.admit("k", &p).is_allowed());
    }

    #[test]
    fn test_gate_records_and_clears() {
        let store: Arc<dyn RateLimitStore> = Arc::new(MemoryRateLimiter::new(Duration::from_secs(60)));
        let gate = AdmissionGate::new(store, policy(2, 60_000), PROCESS_ACTION);

        assert!(gate.enter("ip").is_allowed());
        assert!(gate.enter("ip").is_allowed());
        assert!(!gate.enter("ip").is_allowed());

        gate.clear("ip");
        assert!(gate.enter("ip").is_allowed());
    }
}
