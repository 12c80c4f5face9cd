//! Admin payload contracts: review queue, sync, strategies, health.
//!
//! The transport layer lives elsewhere; these handlers define the payload
//! shapes external collaborators rely on.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::models::{Chain, DiscoveredVenue};
use crate::review::{ReviewQueue, ReviewStats, SyncPlanner, SyncPreview, SyncRequest};
use crate::storage::ReviewFilter;

use super::ApiState;

fn status_for(error: &EngineError) -> StatusCode {
    match error {
        EngineError::Conflict(_) => StatusCode::CONFLICT,
        EngineError::Policy(_) => StatusCode::UNPROCESSABLE_ENTITY,
        EngineError::Config(_) => StatusCode::BAD_REQUEST,
        EngineError::Quota(_) => StatusCode::TOO_MANY_REQUESTS,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

// ── review queue ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct PendingQuery {
    pub country: Option<String>,
    pub platform: Option<String>,
    pub chain: Option<String>,
    pub min_confidence: Option<f64>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct PendingResponse {
    pub venues: Vec<DiscoveredVenue>,
    pub count: usize,
}

pub async fn list_pending(
    Query(query): Query<PendingQuery>,
    State(state): State<ApiState>,
) -> Result<Json<PendingResponse>, StatusCode> {
    let filter = ReviewFilter {
        country: query.country,
        platform: query.platform,
        chain_id: query.chain,
        min_confidence: query.min_confidence,
        limit: query.limit.unwrap_or(50).min(500),
        offset: query.offset.unwrap_or(0),
    };
    let venues = ReviewQueue::new(&state.store)
        .list_pending(&filter)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(PendingResponse {
        count: venues.len(),
        venues,
    }))
}

/// One venue reference with the caller's last-seen timestamp.
#[derive(Debug, Deserialize)]
pub struct VenueRef {
    pub venue_id: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct ApproveRequest {
    pub venues: Vec<VenueRef>,
    pub actor: String,
}

#[derive(Debug, Serialize)]
pub struct BatchOutcome {
    pub ok: usize,
    pub failures: Vec<FailureEntry>,
}

#[derive(Debug, Serialize)]
pub struct FailureEntry {
    pub venue_id: String,
    pub error: String,
    pub conflict: bool,
}

pub async fn approve(
    State(state): State<ApiState>,
    Json(request): Json<ApproveRequest>,
) -> Result<Json<BatchOutcome>, StatusCode> {
    let queue = ReviewQueue::new(&state.store);
    let mut outcome = BatchOutcome {
        ok: 0,
        failures: Vec::new(),
    };
    for venue in &request.venues {
        match queue.approve(&venue.venue_id, venue.updated_at, &request.actor) {
            Ok(()) => outcome.ok += 1,
            Err(e) => outcome.failures.push(FailureEntry {
                venue_id: venue.venue_id.clone(),
                conflict: matches!(&e, EngineError::Conflict(_)),
                error: e.to_string(),
            }),
        }
    }
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
pub struct PartialApproveRequest {
    pub venue_id: String,
    pub updated_at: DateTime<Utc>,
    pub dish_ids: Vec<String>,
    pub feedback: Option<String>,
    pub actor: String,
}

pub async fn partial_approve(
    State(state): State<ApiState>,
    Json(request): Json<PartialApproveRequest>,
) -> Result<StatusCode, (StatusCode, String)> {
    ReviewQueue::new(&state.store)
        .partial_approve(
            &request.venue_id,
            &request.dish_ids,
            request.feedback.as_deref(),
            request.updated_at,
            &request.actor,
        )
        .map_err(|e| (status_for(&e), e.to_string()))?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct RejectRequest {
    pub venue_id: String,
    pub updated_at: DateTime<Utc>,
    pub reason: String,
    pub actor: String,
}

pub async fn reject(
    State(state): State<ApiState>,
    Json(request): Json<RejectRequest>,
) -> Result<StatusCode, (StatusCode, String)> {
    ReviewQueue::new(&state.store)
        .reject(&request.venue_id, &request.reason, request.updated_at, &request.actor)
        .map_err(|e| (status_for(&e), e.to_string()))?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct BulkRejectRequest {
    pub venues: Vec<VenueRef>,
    pub reason: String,
    pub actor: String,
}

pub async fn bulk_reject(
    State(state): State<ApiState>,
    Json(request): Json<BulkRejectRequest>,
) -> Result<Json<BatchOutcome>, (StatusCode, String)> {
    let targets: Vec<(String, DateTime<Utc>)> = request
        .venues
        .iter()
        .map(|v| (v.venue_id.clone(), v.updated_at))
        .collect();
    let failures = ReviewQueue::new(&state.store)
        .bulk_reject(&targets, &request.reason, &request.actor)
        .map_err(|e| (status_for(&e), e.to_string()))?;
    Ok(Json(BatchOutcome {
        ok: targets.len() - failures.len(),
        failures: failures
            .into_iter()
            .map(|(venue_id, e)| FailureEntry {
                venue_id,
                conflict: matches!(&e, EngineError::Conflict(_)),
                error: e.to_string(),
            })
            .collect(),
    }))
}

pub async fn review_stats(
    State(state): State<ApiState>,
) -> Result<Json<ReviewStats>, StatusCode> {
    ReviewQueue::new(&state.store)
        .stats()
        .map(Json)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

// ── sync ────────────────────────────────────────────────────────────

pub async fn sync_preview(
    State(state): State<ApiState>,
) -> Result<Json<SyncPreview>, StatusCode> {
    SyncPlanner::new(&state.store)
        .preview()
        .map(Json)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

#[derive(Debug, Deserialize)]
pub struct SyncExecuteRequest {
    #[serde(default)]
    pub venue_ids: Vec<String>,
    #[serde(default)]
    pub dish_ids: Vec<String>,
    #[serde(default)]
    pub sync_all: bool,
    pub actor: String,
}

pub async fn sync_execute(
    State(state): State<ApiState>,
    Json(request): Json<SyncExecuteRequest>,
) -> Result<Json<crate::models::SyncHistoryRecord>, (StatusCode, String)> {
    let record = SyncPlanner::new(&state.store)
        .execute(&SyncRequest {
            venue_ids: request.venue_ids,
            dish_ids: request.dish_ids,
            sync_all: request.sync_all,
            actor: request.actor,
        })
        .map_err(|e| (status_for(&e), e.to_string()))?;
    Ok(Json(record))
}

// ── chains ──────────────────────────────────────────────────────────

pub async fn list_chains(
    State(state): State<ApiState>,
) -> Result<Json<Vec<Chain>>, StatusCode> {
    state
        .store
        .list_chains(false)
        .map(Json)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

/// Operator-supplied chain data: footprint, locations, verified flag.
/// This is the seed path for tier-1 planning; discovery also stages
/// unverified chains on its own as the classifier spots them.
#[derive(Debug, Deserialize)]
pub struct SeedChainRequest {
    pub name: String,
    #[serde(default)]
    pub countries: Vec<String>,
    #[serde(default)]
    pub locations_count: u32,
    /// (country, city) pairs with at least one location.
    #[serde(default)]
    pub cities: Vec<(String, String)>,
    #[serde(default)]
    pub verified: bool,
}

pub async fn seed_chain(
    State(state): State<ApiState>,
    Json(request): Json<SeedChainRequest>,
) -> Result<Json<Chain>, (StatusCode, String)> {
    if request.name.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "chain name required".to_string()));
    }
    let existing = state
        .store
        .find_chain_by_name(&request.name)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    let now = Utc::now();
    let chain = match existing {
        // Operator data is authoritative; only identity survives.
        Some(current) => Chain {
            id: current.id,
            name: request.name.trim().to_string(),
            countries: request.countries,
            locations_count: request.locations_count,
            cities: request.cities,
            verified: request.verified,
            created_at: current.created_at,
            updated_at: now,
        },
        None => Chain {
            id: uuid::Uuid::new_v4().to_string(),
            name: request.name.trim().to_string(),
            countries: request.countries,
            locations_count: request.locations_count,
            cities: request.cities,
            verified: request.verified,
            created_at: now,
            updated_at: now,
        },
    };
    state
        .store
        .upsert_chain(&chain)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(chain))
}

// ── strategies ──────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct StrategyView {
    pub id: String,
    pub template: String,
    pub country: String,
    pub uses: u64,
    pub successes: u64,
    pub false_positives: u64,
    pub success_rate: f64,
    pub deprecated: bool,
    pub untested: bool,
}

pub async fn list_strategies(
    State(state): State<ApiState>,
) -> Result<Json<Vec<StrategyView>>, StatusCode> {
    let strategies = state
        .store
        .list_strategies()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(
        strategies
            .into_iter()
            .map(|s| StrategyView {
                success_rate: s.success_rate(),
                untested: s.is_untested(),
                id: s.id,
                template: s.template,
                country: s.country,
                uses: s.uses,
                successes: s.successes,
                false_positives: s.false_positives,
                deprecated: s.deprecated,
            })
            .collect(),
    ))
}

#[derive(Debug, Deserialize)]
pub struct DeprecateRequest {
    pub strategy_id: String,
}

pub async fn deprecate_strategy(
    State(state): State<ApiState>,
    Json(request): Json<DeprecateRequest>,
) -> Result<StatusCode, (StatusCode, String)> {
    let strategy = state
        .store
        .get_strategy(&request.strategy_id)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    let Some(mut strategy) = strategy else {
        return Err((StatusCode::NOT_FOUND, "unknown strategy".to_string()));
    };
    strategy.deprecated = true;
    strategy.updated_at = Utc::now();
    state
        .store
        .upsert_strategy(&strategy)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(StatusCode::NO_CONTENT)
}

// ── health ──────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_secs: u64,
    pub collections: Vec<(String, u64)>,
    pub pending_review: usize,
}

pub async fn health(State(state): State<ApiState>) -> Result<Json<HealthResponse>, StatusCode> {
    let collections = state
        .store
        .collection_counts()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let pending = state
        .store
        .list_pending_review(&ReviewFilter {
            limit: 100_000,
            ..Default::default()
        })
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .len();
    Ok(Json(HealthResponse {
        status: "ok",
        uptime_secs: state.started_at.elapsed().as_secs(),
        collections,
        pending_review: pending,
    }))
}
