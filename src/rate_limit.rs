use dashmap::DashMap;
use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

use crate::metrics::RATE_LIMIT_KEYS;

pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub requests_per_window: u32,
    pub window: Duration,
}

// Rate limit history is kept per (service, client) pair
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AdmissionKey {
    pub service: String,
    pub client: IpAddr,
}

impl AdmissionKey {
    pub fn new(service: impl Into<String>, client: IpAddr) -> Self {
        Self {
            service: service.into(),
            client,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admit,
    Deny { retry_after: Duration },
}

/// Decides whether a request may proceed given recent traffic for its key.
///
/// Implementations own all cross-request state. Decisions must be atomic per
/// key; unrelated keys should not wait on each other.
pub trait AdmissionController: Send + Sync {
    fn admit(&self, key: &AdmissionKey, policy: &RateLimitPolicy) -> Admission;

    /// Drop history for keys with no recent traffic. Returns how many were removed.
    fn prune_idle(&self) -> usize {
        0
    }
}

// Timestamps of admitted requests inside the trailing window
#[derive(Debug, Default)]
struct RateWindow {
    admitted: VecDeque<Instant>,
    window: Duration,
}

impl RateWindow {
    fn prune(&mut self, now: Instant) {
        let Some(cutoff) = now.checked_sub(self.window) else {
            return;
        };
        while self.admitted.front().is_some_and(|t| *t <= cutoff) {
            self.admitted.pop_front();
        }
    }
}

/// Sliding-window log limiter. Each key's window lives in its own DashMap
/// entry, so the shard lock gives per-key exclusion without a global mutex.
#[derive(Debug, Default)]
pub struct SlidingWindowLimiter {
    windows: DashMap<AdmissionKey, RateWindow>,
}

impl SlidingWindowLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }

    pub fn admit_at(&self, key: &AdmissionKey, policy: &RateLimitPolicy, now: Instant) -> Admission {
        let mut entry = self.windows.entry(key.clone()).or_default();
        let window = entry.value_mut();

        window.window = policy.window;
        window.prune(now);

        if window.admitted.len() >= policy.requests_per_window as usize {
            return Admission::Deny {
                retry_after: policy.window,
            };
        }

        window.admitted.push_back(now);
        Admission::Admit
    }

    pub fn prune_idle_at(&self, now: Instant) -> usize {
        let before = self.windows.len();
        // retain holds the shard write lock, so no admission can interleave
        // between the prune and the removal
        self.windows.retain(|_, window| {
            window.prune(now);
            !window.admitted.is_empty()
        });
        let after = self.windows.len();
        RATE_LIMIT_KEYS.set(after as f64);
        before.saturating_sub(after)
    }
}

impl AdmissionController for SlidingWindowLimiter {
    fn admit(&self, key: &AdmissionKey, policy: &RateLimitPolicy) -> Admission {
        self.admit_at(key, policy, Instant::now())
    }

    fn prune_idle(&self) -> usize {
        self.prune_idle_at(Instant::now())
    }
}

// Periodic sweep of idle rate-limit windows, stops on shutdown
pub async fn idle_sweeper(
    limiter: Arc<dyn AdmissionController>,
    sweep_interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = interval(sweep_interval);
    // first tick fires immediately
    ticker.tick().await;

    tracing::debug!(interval = ?sweep_interval, "rate limit sweeper started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let removed = limiter.prune_idle();
                if removed > 0 {
                    tracing::debug!(removed, "swept idle rate limit windows");
                }
            }
        }
    }

    tracing::debug!("rate limit sweeper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn key(service: &str, last_octet: u8) -> AdmissionKey {
        AdmissionKey::new(service, IpAddr::V4(Ipv4Addr::new(10, 0, 0, last_octet)))
    }

    fn policy(n: u32) -> RateLimitPolicy {
        RateLimitPolicy {
            requests_per_window: n,
            window: DEFAULT_WINDOW,
        }
    }

    #[test]
    fn test_denies_after_limit() {
        let limiter = SlidingWindowLimiter::new();
        let now = Instant::now();
        let k = key("svc", 1);

        for i in 0..3 {
            let at = now + Duration::from_secs(i);
            assert_eq!(limiter.admit_at(&k, &policy(3), at), Admission::Admit);
        }
        assert_eq!(
            limiter.admit_at(&k, &policy(3), now + Duration::from_secs(5)),
            Admission::Deny {
                retry_after: DEFAULT_WINDOW
            }
        );
    }

    #[test]
    fn test_window_slides_instead_of_resetting() {
        let limiter = SlidingWindowLimiter::new();
        let t0 = Instant::now();
        let k = key("svc", 1);
        let p = policy(2);
        let at = |secs| t0 + Duration::from_secs(secs);

        assert_eq!(limiter.admit_at(&k, &p, at(0)), Admission::Admit);
        assert_eq!(limiter.admit_at(&k, &p, at(30)), Admission::Admit);
        assert!(matches!(limiter.admit_at(&k, &p, at(50)), Admission::Deny { .. }));
        // only the t=0 entry has aged out
        assert_eq!(limiter.admit_at(&k, &p, at(61)), Admission::Admit);
        assert!(matches!(limiter.admit_at(&k, &p, at(70)), Admission::Deny { .. }));
        // t=30 is gone now
        assert_eq!(limiter.admit_at(&k, &p, at(91)), Admission::Admit);
    }

    #[test]
    fn test_denied_requests_are_not_recorded() {
        let limiter = SlidingWindowLimiter::new();
        let t0 = Instant::now();
        let k = key("svc", 1);
        let p = policy(1);

        assert_eq!(limiter.admit_at(&k, &p, t0), Admission::Admit);
        for s in 1..59 {
            assert!(matches!(
                limiter.admit_at(&k, &p, t0 + Duration::from_secs(s)),
                Admission::Deny { .. }
            ));
        }
        // a denied request must not extend the window
        assert_eq!(
            limiter.admit_at(&k, &p, t0 + Duration::from_secs(61)),
            Admission::Admit
        );
    }

    #[test]
    fn test_zero_limit_denies_everything() {
        let limiter = SlidingWindowLimiter::new();
        let k = key("svc", 1);
        for _ in 0..5 {
            assert!(matches!(limiter.admit(&k, &policy(0)), Admission::Deny { .. }));
        }
    }

    #[test]
    fn test_keys_are_isolated() {
        let limiter = SlidingWindowLimiter::new();
        let now = Instant::now();
        let p = policy(1);

        assert_eq!(limiter.admit_at(&key("x", 1), &p, now), Admission::Admit);
        assert!(matches!(limiter.admit_at(&key("x", 1), &p, now), Admission::Deny { .. }));

        // same service, other client
        assert_eq!(limiter.admit_at(&key("x", 2), &p, now), Admission::Admit);
        // same client, other service
        assert_eq!(limiter.admit_at(&key("y", 1), &p, now), Admission::Admit);
    }

    #[test]
    fn test_prune_idle_removes_only_expired_windows() {
        let limiter = SlidingWindowLimiter::new();
        let t0 = Instant::now();
        let p = policy(5);

        limiter.admit_at(&key("svc", 1), &p, t0);
        limiter.admit_at(&key("svc", 2), &p, t0 + Duration::from_secs(40));
        assert_eq!(limiter.tracked_keys(), 2);

        let removed = limiter.prune_idle_at(t0 + Duration::from_secs(70));
        assert_eq!(removed, 1);
        assert_eq!(limiter.tracked_keys(), 1);

        // the surviving key still counts its earlier request
        let p1 = policy(1);
        assert!(matches!(
            limiter.admit_at(&key("svc", 2), &p1, t0 + Duration::from_secs(75)),
            Admission::Deny { .. }
        ));
    }

    #[test]
    fn test_concurrent_admissions_never_exceed_limit() {
        let limiter = Arc::new(SlidingWindowLimiter::new());
        let p = policy(25);

        // 100 threads x 10 requests, spread over 10 clients
        let handles: Vec<_> = (0..100u32)
            .map(|i| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || {
                    (0..10u32)
                        .map(|j| {
                            let k = key("svc", ((i + j) % 10) as u8);
                            (k.client, limiter.admit(&k, &p) == Admission::Admit)
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut admitted = std::collections::HashMap::new();
        for handle in handles {
            for (client, ok) in handle.join().unwrap() {
                if ok {
                    *admitted.entry(client).or_insert(0) += 1;
                }
            }
        }

        assert_eq!(admitted.len(), 10);
        for count in admitted.values() {
            assert_eq!(*count, 25);
        }
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_shutdown() {
        let limiter: Arc<dyn AdmissionController> = Arc::new(SlidingWindowLimiter::new());
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(idle_sweeper(
            limiter,
            Duration::from_millis(10),
            shutdown.clone(),
        ));

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("sweeper should stop")
            .unwrap();
    }
}
