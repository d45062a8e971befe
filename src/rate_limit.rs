//! # Rate Limiter
//!
//! Sliding 60-second windows per `(client address, endpoint class)`.
//! Buckets are created lazily on first request; buckets idle past five
//! minutes are pruned on access so the table stays bounded without a
//! background task.

use dashmap::DashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

pub const WINDOW: Duration = Duration::from_secs(60);
const BUCKET_IDLE: Duration = Duration::from_secs(300);

pub const FINETUNE_LIMIT: u32 = 10;
pub const MODEL_PULL_LIMIT: u32 = 5;

/// Which per-minute budget a request draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointClass {
    Chat,
    FineTune,
    ModelPull,
    Unlimited,
}

impl EndpointClass {
    /// Classify a request path. Model pulls are checked before the
    /// generic model routes so they get the tighter budget.
    pub fn classify(path: &str) -> Self {
        if path.starts_with("/api/models/pull") {
            EndpointClass::ModelPull
        } else if path.starts_with("/api/chat") {
            EndpointClass::Chat
        } else if path.starts_with("/api/finetune") {
            EndpointClass::FineTune
        } else {
            EndpointClass::Unlimited
        }
    }
}

struct Bucket {
    count: u32,
    window_start: Instant,
    window_start_unix: u64,
}

/// The verdict for one request, carrying everything the response headers
/// need.
#[derive(Debug, Clone, Copy)]
pub struct Decision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Unix second at which the current window resets.
    pub reset_unix: u64,
}

pub struct RateLimiter {
    buckets: DashMap<(IpAddr, EndpointClass), Bucket>,
    chat_limit: u32,
}

impl RateLimiter {
    pub fn new(chat_limit: u32) -> Self {
        Self {
            buckets: DashMap::new(),
            chat_limit,
        }
    }

    fn limit_for(&self, class: EndpointClass) -> Option<u32> {
        match class {
            EndpointClass::Chat => Some(self.chat_limit),
            EndpointClass::FineTune => Some(FINETUNE_LIMIT),
            EndpointClass::ModelPull => Some(MODEL_PULL_LIMIT),
            EndpointClass::Unlimited => None,
        }
    }

    /// Charge one request against the client's window. `None` means the
    /// endpoint class is unlimited and carries no headers.
    pub fn check(&self, client: IpAddr, class: EndpointClass) -> Option<Decision> {
        let limit = self.limit_for(class)?;
        let now = Instant::now();
        let now_unix = unix_now();

        self.prune(now);

        let mut bucket = self
            .buckets
            .entry((client, class))
            .or_insert_with(|| Bucket {
                count: 0,
                window_start: now,
                window_start_unix: now_unix,
            });

        if now.duration_since(bucket.window_start) > WINDOW {
            bucket.count = 0;
            bucket.window_start = now;
            bucket.window_start_unix = now_unix;
        }

        let reset_unix = bucket.window_start_unix + WINDOW.as_secs();

        if bucket.count >= limit {
            return Some(Decision {
                allowed: false,
                limit,
                remaining: 0,
                reset_unix,
            });
        }

        bucket.count += 1;
        Some(Decision {
            allowed: true,
            limit,
            remaining: limit - bucket.count,
            reset_unix,
        })
    }

    /// Drop buckets whose window ended more than `BUCKET_IDLE` ago.
    fn prune(&self, now: Instant) {
        self.buckets
            .retain(|_, bucket| now.duration_since(bucket.window_start) < BUCKET_IDLE);
    }

    /// Number of live buckets; admin surface.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn client() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))
    }

    #[test]
    fn classify_maps_paths_to_classes() {
        assert_eq!(EndpointClass::classify("/api/chat"), EndpointClass::Chat);
        assert_eq!(
            EndpointClass::classify("/api/chat/stream"),
            EndpointClass::Chat
        );
        assert_eq!(
            EndpointClass::classify("/api/finetune/jobs"),
            EndpointClass::FineTune
        );
        assert_eq!(
            EndpointClass::classify("/api/models/pull/llama2"),
            EndpointClass::ModelPull
        );
        assert_eq!(EndpointClass::classify("/api/models"), EndpointClass::Unlimited);
        assert_eq!(EndpointClass::classify("/health"), EndpointClass::Unlimited);
    }

    #[test]
    fn requests_over_the_limit_are_denied() {
        let limiter = RateLimiter::new(3);
        for i in 0..3 {
            let decision = limiter.check(client(), EndpointClass::Chat).unwrap();
            assert!(decision.allowed, "request {} should pass", i);
            assert_eq!(decision.remaining, 2 - i);
        }

        let denied = limiter.check(client(), EndpointClass::Chat).unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert!(denied.reset_unix > 0);
    }

    #[test]
    fn classes_have_independent_budgets() {
        let limiter = RateLimiter::new(1);
        assert!(limiter.check(client(), EndpointClass::Chat).unwrap().allowed);
        assert!(!limiter.check(client(), EndpointClass::Chat).unwrap().allowed);
        // Same client, different class: its own window.
        assert!(limiter.check(client(), EndpointClass::FineTune).unwrap().allowed);
    }

    #[test]
    fn clients_have_independent_budgets() {
        let limiter = RateLimiter::new(1);
        let other = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
        assert!(limiter.check(client(), EndpointClass::Chat).unwrap().allowed);
        assert!(limiter.check(other, EndpointClass::Chat).unwrap().allowed);
    }

    #[test]
    fn unlimited_class_is_never_charged() {
        let limiter = RateLimiter::new(1);
        for _ in 0..100 {
            assert!(limiter.check(client(), EndpointClass::Unlimited).is_none());
        }
        assert_eq!(limiter.bucket_count(), 0);
    }

    #[test]
    fn fixed_class_limits_apply() {
        let limiter = RateLimiter::new(60);
        for _ in 0..MODEL_PULL_LIMIT {
            assert!(limiter.check(client(), EndpointClass::ModelPull).unwrap().allowed);
        }
        assert!(!limiter.check(client(), EndpointClass::ModelPull).unwrap().allowed);
    }
}
