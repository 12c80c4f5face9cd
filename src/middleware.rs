//! HTTP middleware for the payload-contract surface.
//!
//! Request logging with latency fields, and a per-IP token-bucket rate
//! limit with a burst allowance guarding the admin operations.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use parking_lot::Mutex;
use tracing::{info, warn};

/// Log method, path, status, and latency for every request. Health checks
/// stay out of the log.
pub async fn request_logging(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    if path == "/health" {
        return next.run(request).await;
    }

    let start = Instant::now();
    let response = next.run(request).await;
    let status = response.status().as_u16();
    let latency_ms = start.elapsed().as_millis() as u64;

    if status >= 500 {
        warn!(%method, path, status, latency_ms, "request failed");
    } else {
        info!(%method, path, status, latency_ms, "request completed");
    }
    response
}

#[derive(Clone)]
pub struct RateLimitConfig {
    /// Sustained rate a single caller may hold.
    pub requests_per_minute: u32,
    /// Bucket capacity: how many requests a quiet caller can fire at once
    /// before the refill rate takes over.
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            burst: 20,
        }
    }
}

struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

/// Per-IP token-bucket limiter. Each caller's bucket starts full, drains
/// one token per request, and refills continuously at the sustained rate.
/// One instance is shared across the router.
#[derive(Clone)]
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: Arc<Mutex<HashMap<IpAddr, TokenBucket>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn refill_per_second(&self) -> f64 {
        f64::from(self.config.requests_per_minute.max(1)) / 60.0
    }

    fn capacity(&self) -> f64 {
        f64::from(self.config.burst.max(1))
    }

    /// Take one token, or report how long until the next one drips in.
    fn check(&self, ip: IpAddr) -> Result<(), Duration> {
        let now = Instant::now();
        let rate = self.refill_per_second();
        let capacity = self.capacity();

        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(ip).or_insert(TokenBucket {
            tokens: capacity,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * rate).min(capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - bucket.tokens;
            Err(Duration::from_secs_f64(deficit / rate))
        }
    }

    /// Forget callers whose buckets have long since refilled to full.
    /// Called from a housekeeping task.
    pub fn cleanup(&self) {
        let idle_cutoff = Duration::from_secs_f64(self.capacity() / self.refill_per_second())
            + Duration::from_secs(60);
        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        buckets.retain(|_, bucket| now.duration_since(bucket.last_refill) < idle_cutoff);
    }
}

pub async fn rate_limit(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    axum::extract::State(limiter): axum::extract::State<RateLimiter>,
    request: Request<Body>,
    next: Next,
) -> Response {
    match limiter.check(addr.ip()) {
        Ok(()) => next.run(request).await,
        Err(retry_after) => {
            warn!(ip = %addr.ip(), retry_after_secs = retry_after.as_secs(), "rate limited");
            let body = serde_json::json!({
                "error": "rate_limit_exceeded",
                "retry_after_seconds": retry_after.as_secs(),
            });
            (
                StatusCode::TOO_MANY_REQUESTS,
                [("Retry-After", retry_after.as_secs().to_string())],
                axum::Json(body),
            )
                .into_response()
        }
    }
}
