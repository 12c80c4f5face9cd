//! Payload-contract HTTP surface.
//!
//! `/nearby` serves the public locator; `/admin/*` exposes the review and
//! sync operations; `/health` reports store counts. Transport concerns
//! beyond these handlers (auth, sessions) live outside this crate.

pub mod admin;
pub mod nearby;

use std::sync::Arc;
use std::time::Instant;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;

use crate::middleware::{self, RateLimitConfig, RateLimiter};
use crate::storage::Store;

use nearby::NearbyCache;

#[derive(Clone)]
pub struct ApiState {
    pub store: Store,
    pub nearby_cache: Arc<NearbyCache>,
    pub started_at: Instant,
}

impl ApiState {
    pub fn new(store: Store, cache_entries: usize, cache_ttl: std::time::Duration) -> Self {
        Self {
            store,
            nearby_cache: Arc::new(NearbyCache::new(cache_entries, cache_ttl)),
            started_at: Instant::now(),
        }
    }
}

/// Assemble the full router. The admin surface sits behind the per-IP
/// rate limit; everything gets request logging and permissive CORS.
pub fn router(state: ApiState) -> Router {
    let limiter = RateLimiter::new(RateLimitConfig::default());

    let admin = Router::new()
        .route("/admin/review/pending", get(admin::list_pending))
        .route("/admin/review/approve", post(admin::approve))
        .route("/admin/review/partial-approve", post(admin::partial_approve))
        .route("/admin/review/reject", post(admin::reject))
        .route("/admin/review/bulk-reject", post(admin::bulk_reject))
        .route("/admin/review/stats", get(admin::review_stats))
        .route("/admin/sync/preview", get(admin::sync_preview))
        .route("/admin/sync/execute", post(admin::sync_execute))
        .route("/admin/chains", get(admin::list_chains).post(admin::seed_chain))
        .route("/admin/strategies", get(admin::list_strategies))
        .route("/admin/strategies/deprecate", post(admin::deprecate_strategy))
        .layer(axum::middleware::from_fn_with_state(
            limiter,
            middleware::rate_limit,
        ));

    Router::new()
        .route("/nearby", get(nearby::nearby))
        .route("/health", get(admin::health))
        .merge(admin)
        .layer(axum::middleware::from_fn(middleware::request_logging))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
