//! Keyed token-bucket rate limiting.
//!
//! Two instances exist: one keyed by client IP as HTTP middleware, one
//! keyed by sender identity to throttle the typing sub-protocol.

use std::collections::HashMap;
use std::hash::Hash;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::ConnectInfo,
    http::{Request, StatusCode},
    middleware::Next,
    response::Response,
};
use tokio::sync::Mutex;
use tracing::warn;

#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: f64) -> Self {
        Self {
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    fn try_consume(&mut self, rate: f64, capacity: f64) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;

        self.tokens = (self.tokens + elapsed * rate).min(capacity);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Token buckets keyed by an arbitrary hashable key (client IP, user id).
pub struct KeyedLimiter<K> {
    buckets: Arc<Mutex<HashMap<K, TokenBucket>>>,
    rate: f64,
    capacity: f64,
}

impl<K> Clone for KeyedLimiter<K> {
    fn clone(&self) -> Self {
        Self {
            buckets: self.buckets.clone(),
            rate: self.rate,
            capacity: self.capacity,
        }
    }
}

impl<K: Eq + Hash> KeyedLimiter<K> {
    pub fn new(rate: f64, capacity: f64) -> Self {
        Self {
            buckets: Arc::new(Mutex::new(HashMap::new())),
            rate,
            capacity,
        }
    }

    pub async fn check(&self, key: K) -> bool {
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets
            .entry(key)
            .or_insert_with(|| TokenBucket::new(self.capacity));
        bucket.try_consume(self.rate, self.capacity)
    }

    pub async fn purge_stale(&self, max_idle_secs: f64) {
        let mut buckets = self.buckets.lock().await;
        let now = Instant::now();
        buckets.retain(|_, bucket| {
            now.duration_since(bucket.last_refill).as_secs_f64() < max_idle_secs
        });
    }
}

/// Per-IP limiter applied to the REST surface.
pub type IpRateLimiter = KeyedLimiter<IpAddr>;

pub async fn rate_limit_middleware(
    axum::extract::State(limiter): axum::extract::State<IpRateLimiter>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let ip = extract_client_ip(&req);

    if let Some(ip) = ip {
        if !limiter.check(ip).await {
            warn!(ip = %ip, "Rate limit exceeded");
            return Err(StatusCode::TOO_MANY_REQUESTS);
        }
    }

    Ok(next.run(req).await)
}

/// Try ConnectInfo first, then X-Forwarded-For, then X-Real-IP.
fn extract_client_ip<B>(req: &Request<B>) -> Option<IpAddr> {
    if let Some(connect_info) = req.extensions().get::<ConnectInfo<std::net::SocketAddr>>() {
        return Some(connect_info.0.ip());
    }

    if let Some(forwarded) = req.headers().get("x-forwarded-for") {
        if let Ok(value) = forwarded.to_str() {
            if let Some(first) = value.split(',').next() {
                if let Ok(ip) = first.trim().parse::<IpAddr>() {
                    return Some(ip);
                }
            }
        }
    }

    if let Some(real_ip) = req.headers().get("x-real-ip") {
        if let Ok(value) = real_ip.to_str() {
            if let Ok(ip) = value.trim().parse::<IpAddr>() {
                return Some(ip);
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_shared::UserId;

    #[tokio::test]
    async fn test_limiter_allows_burst() {
        let limiter: KeyedLimiter<IpAddr> = KeyedLimiter::new(10.0, 5.0);
        let ip: IpAddr = "127.0.0.1".parse().unwrap();

        for _ in 0..5 {
            assert!(limiter.check(ip).await);
        }

        assert!(!limiter.check(ip).await);
    }

    #[tokio::test]
    async fn test_limiter_keys_are_independent() {
        let limiter: KeyedLimiter<UserId> = KeyedLimiter::new(10.0, 2.0);
        let alice = UserId::new();
        let bob = UserId::new();

        assert!(limiter.check(alice).await);
        assert!(limiter.check(alice).await);
        assert!(!limiter.check(alice).await);

        assert!(limiter.check(bob).await);
    }

    #[tokio::test]
    async fn test_purge_stale() {
        let limiter: KeyedLimiter<IpAddr> = KeyedLimiter::new(10.0, 5.0);
        let ip: IpAddr = "192.168.1.1".parse().unwrap();
        assert!(limiter.check(ip).await);

        limiter.purge_stale(0.0).await;

        let buckets = limiter.buckets.lock().await;
        assert!(buckets.is_empty());
    }
}
