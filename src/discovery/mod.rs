//! Discovery executor.
//!
//! Takes a query plan, walks it tier by tier through the credential pool,
//! the external search provider, and the classifier, and stages candidate
//! venues. Strategy statistics recorded here feed the next planner run.

pub mod classifier;
pub mod search;

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use futures_util::future::join_all;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{DiscoveryMode, EngineConfig};
use crate::credentials::CredentialPool;
use crate::error::EngineError;
use crate::learning::LearningRecord;
use crate::models::{Chain, DiscoveredVenue, OriginTrace, VenueStatus};
use crate::planner::{self, PlannedQuery, PlannerSnapshot, QueryPlan, Tier};
use crate::review::verifier::url_matches_reject_pattern;
use crate::storage::Store;

use classifier::{
    classify_with_retry, CandidateClassifier, ClassifiedCandidate, ClassifyContext,
};
use search::SearchProvider;

/// Confidence at or above which an accepted candidate counts as a
/// strategy success.
const SUCCESS_CONFIDENCE: f64 = 70.0;
/// Confidence below which a candidate is a clear negative signal.
const FALSE_POSITIVE_CONFIDENCE: f64 = 20.0;

/// Everything a discovery run borrows. No ambient singletons: the caller
/// assembles and passes the services in.
pub struct DiscoveryDeps<'a> {
    pub store: &'a Store,
    pub pool: &'a CredentialPool,
    pub search: &'a dyn SearchProvider,
    pub classifier: &'a dyn CandidateClassifier,
    pub fallback_classifier: Option<&'a dyn CandidateClassifier>,
    pub cancelled: &'a AtomicBool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PhaseError {
    pub phase: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DiscoveryRunReport {
    pub queries_planned: u32,
    pub queries_executed: u32,
    pub queries_successful: u32,
    pub queries_classified: u32,
    pub venues_discovered: u32,
    pub venues_merged: u32,
    pub duplicates_skipped: u32,
    pub chains_detected: u32,
    pub credentials_exhausted: u32,
    pub backpressure: bool,
    pub cancelled: bool,
    pub per_tier_executed: Vec<(String, u32)>,
    pub errors: Vec<PhaseError>,
}

/// Outcome of staging one classified candidate.
enum UpsertOutcome {
    New,
    Merged,
    SkippedRejected,
    SkippedDuplicateUrl,
}

/// What one executed query contributes to the report and the strategy
/// counters. Aggregated sequentially so per-strategy updates serialize.
struct QueryOutcome {
    query: PlannedQuery,
    executed: bool,
    successful: bool,
    classified: bool,
    quota_exhausted: bool,
    backpressure: bool,
    new_venues: u32,
    merged_venues: u32,
    duplicates: u32,
    chains: Vec<String>,
    successes: u32,
    false_positives: u32,
    error: Option<String>,
}

impl QueryOutcome {
    fn empty(query: PlannedQuery) -> Self {
        Self {
            query,
            executed: false,
            successful: false,
            classified: false,
            quota_exhausted: false,
            backpressure: false,
            new_venues: 0,
            merged_venues: 0,
            duplicates: 0,
            chains: Vec::new(),
            successes: 0,
            false_positives: 0,
            error: None,
        }
    }
}

/// Build the plan for the configured mode and execute it.
pub async fn run(
    deps: &DiscoveryDeps<'_>,
    config: &EngineConfig,
) -> anyhow::Result<DiscoveryRunReport> {
    let plan = build_plan(deps.store, config)?;
    info!(
        mode = ?config.discovery.mode,
        planned = plan.total_queries(),
        budget = plan.total_budget,
        "discovery run starting"
    );
    execute_plan(deps, config, &plan).await
}

/// Plan construction per mode. Explore uses the full four-tier allocation;
/// enumerate binds every query to a named chain; verify re-checks staged
/// venues.
pub fn build_plan(store: &Store, config: &EngineConfig) -> anyhow::Result<QueryPlan> {
    let budget = config.discovery.max_queries;
    match config.discovery.mode {
        DiscoveryMode::Explore => {
            // Built-in templates become real strategies first, so tier 3
            // and 4 queries have rows for their counters to land on.
            planner::ensure_builtin_strategies(store, config)?;
            let snapshot = PlannerSnapshot::gather(store, config)?;
            Ok(planner::allocate(&snapshot, config, budget))
        }
        DiscoveryMode::Enumerate => {
            let mut queries = Vec::new();
            'outer: for name in &config.discovery.chains {
                let Some(chain) = store.find_chain_by_name(name)? else {
                    warn!(chain = %name, "enumerate: unknown chain, skipping");
                    continue;
                };
                let mut cities = chain.cities.clone();
                cities.sort();
                for (country, city) in cities {
                    for platform in &config.discovery.platforms {
                        if queries.len() as u32 >= budget {
                            break 'outer;
                        }
                        queries.push(PlannedQuery {
                            query: format!("{} planted {} {}", chain.name, city, platform.as_str()),
                            tier: Tier::ChainEnumeration,
                            country: country.clone(),
                            city: Some(city.clone()),
                            platform: Some(*platform),
                            chain_id: Some(chain.id.clone()),
                            chain_name: Some(chain.name.clone()),
                            strategy_id: None,
                        });
                    }
                }
            }
            Ok(single_group_plan(budget, Tier::ChainEnumeration, queries))
        }
        DiscoveryMode::Verify => {
            let mut queries = Vec::new();
            for venue in store.list_venues_by_status(VenueStatus::Discovered)? {
                if queries.len() as u32 >= budget {
                    break;
                }
                queries.push(PlannedQuery {
                    query: format!("{} {} planted", venue.name, venue.address.city),
                    tier: Tier::CityExploration,
                    country: venue.address.country.clone(),
                    city: Some(venue.address.city.clone()),
                    platform: None,
                    chain_id: venue.chain_id.clone(),
                    chain_name: None,
                    strategy_id: None,
                });
            }
            Ok(single_group_plan(budget, Tier::CityExploration, queries))
        }
    }
}

fn single_group_plan(budget: u32, tier: Tier, queries: Vec<PlannedQuery>) -> QueryPlan {
    QueryPlan {
        total_budget: budget,
        groups: vec![crate::planner::QueryGroup {
            tier,
            allowance: budget,
            queries,
        }],
    }
}

/// Execute an already-built plan. Queries inside a tier run through a
/// small worker pool; results are folded sequentially so strategy updates
/// for one strategy never race.
pub async fn execute_plan(
    deps: &DiscoveryDeps<'_>,
    config: &EngineConfig,
    plan: &QueryPlan,
) -> anyhow::Result<DiscoveryRunReport> {
    let mut report = DiscoveryRunReport {
        queries_planned: plan.total_queries(),
        ..Default::default()
    };
    let concurrency = config.pacing.concurrency.max(1);
    let dry_run = config.discovery.dry_run;
    let mut chains_seen: Vec<String> = Vec::new();
    let mut learning = LearningRecord::new("discovery");

    'tiers: for group in &plan.groups {
        let mut tier_executed = 0u32;
        for chunk in group.queries.chunks(concurrency) {
            if deps.cancelled.load(Ordering::Relaxed) {
                report.cancelled = true;
                break 'tiers;
            }

            let outcomes = join_all(
                chunk
                    .iter()
                    .map(|query| execute_query(deps, query.clone(), dry_run)),
            )
            .await;

            let mut tier_backpressure = false;
            for outcome in outcomes {
                tier_backpressure |= outcome.backpressure;
                tier_executed += u32::from(outcome.executed);
                fold_outcome(deps, &mut report, &mut chains_seen, &mut learning, outcome, dry_run);
            }
            if tier_backpressure {
                // Pool is dry: surrender the rest of this tier.
                report.backpressure = true;
                warn!(tier = group.tier.as_str(), "credential backpressure, aborting tier");
                break;
            }
        }
        report
            .per_tier_executed
            .push((group.tier.as_str().to_string(), tier_executed));
    }

    report.chains_detected = chains_seen.len() as u32;
    if !dry_run {
        learning.persist(deps.store)?;
    }
    metrics::counter!("discovery_queries_executed", report.queries_executed as u64);
    metrics::counter!("discovery_venues_new", report.venues_discovered as u64);
    info!(
        executed = report.queries_executed,
        new = report.venues_discovered,
        merged = report.venues_merged,
        backpressure = report.backpressure,
        "discovery run finished"
    );
    Ok(report)
}

/// One query through the full pipeline: lease → search → classify → stage.
async fn execute_query(
    deps: &DiscoveryDeps<'_>,
    query: PlannedQuery,
    dry_run: bool,
) -> QueryOutcome {
    let mut outcome = QueryOutcome::empty(query);

    if deps.cancelled.load(Ordering::Relaxed) {
        return outcome;
    }

    let Some(lease) = deps.pool.lease() else {
        outcome.backpressure = true;
        return outcome;
    };
    outcome.executed = true;

    let hits = match deps.search.search(&outcome.query.query, &lease).await {
        Ok(hits) => {
            deps.pool.report(&lease.id, true, false);
            outcome.successful = true;
            hits
        }
        Err(e) => {
            let quota = matches!(&e, EngineError::Quota(_));
            let auth = matches!(&e, EngineError::Auth { .. })
                || matches!(&e, EngineError::Protocol { status: Some(s), .. } if *s == 401 || *s == 403);
            deps.pool.report(&lease.id, !auth && !quota, quota);
            outcome.quota_exhausted = quota;
            outcome.error = Some(format!("search: {e}"));
            return outcome;
        }
    };

    if deps.cancelled.load(Ordering::Relaxed) {
        return outcome;
    }

    let ctx = ClassifyContext {
        query: outcome.query.query.clone(),
        country: outcome.query.country.clone(),
        city: outcome.query.city.clone(),
        chain_name: outcome.query.chain_name.clone(),
    };
    let Some(candidates) =
        classify_with_retry(deps.classifier, deps.fallback_classifier, &hits, &ctx).await
    else {
        // Executed but not classified; the query still consumed budget.
        outcome.error = Some("classifier unavailable, query not classified".to_string());
        return outcome;
    };
    outcome.classified = true;

    for candidate in candidates {
        let negative = candidate.confidence < FALSE_POSITIVE_CONFIDENCE
            || candidate
                .platform_links
                .iter()
                .any(|l| url_matches_reject_pattern(&l.url));
        if negative {
            outcome.false_positives += 1;
            continue;
        }

        if let Some(chain) = candidate
            .chain_guess
            .clone()
            .or_else(|| outcome.query.chain_name.clone())
        {
            outcome.chains.push(chain);
        }

        if dry_run {
            outcome.new_venues += 1;
            if candidate.confidence >= SUCCESS_CONFIDENCE {
                outcome.successes += 1;
            }
            continue;
        }

        match stage_candidate(deps.store, &outcome.query, candidate) {
            Ok((UpsertOutcome::New, confidence)) => {
                outcome.new_venues += 1;
                if confidence >= SUCCESS_CONFIDENCE {
                    outcome.successes += 1;
                }
            }
            Ok((UpsertOutcome::Merged, confidence)) => {
                outcome.merged_venues += 1;
                if confidence >= SUCCESS_CONFIDENCE {
                    outcome.successes += 1;
                }
            }
            Ok((UpsertOutcome::SkippedRejected, _)) => {}
            Ok((UpsertOutcome::SkippedDuplicateUrl, _)) => outcome.duplicates += 1,
            Err(e) => outcome.error = Some(format!("stage: {e}")),
        }
    }

    outcome
}

/// Deduplicate a candidate against staging and upsert it.
///
/// Key: `(name_lowercase, city_lowercase, url host+path)`. A rejected
/// match wins (the candidate is dropped); a live match absorbs the new
/// platform links; a URL already held by any other live venue makes the
/// candidate a duplicate.
fn stage_candidate(
    store: &Store,
    query: &PlannedQuery,
    candidate: ClassifiedCandidate,
) -> anyhow::Result<(UpsertOutcome, f64)> {
    let name_lower = candidate.name.trim().to_lowercase();
    let city_lower = candidate.city.trim().to_lowercase();

    let matches = store.find_venues_by_name_city(&name_lower, &city_lower)?;
    if let Some(existing) = matches.first() {
        if existing.status == VenueStatus::Rejected {
            debug!(venue = %existing.id, "candidate matches rejected venue, skipping");
            return Ok((UpsertOutcome::SkippedRejected, candidate.confidence));
        }
        let mut venue = existing.clone();
        let changed = venue.merge_links(&candidate.platform_links);
        if candidate.confidence > venue.confidence_score {
            venue.confidence_score = candidate.confidence;
        }
        if changed || candidate.confidence > existing.confidence_score {
            venue.updated_at = Utc::now();
            store.upsert_venue(&venue)?;
        }
        return Ok((UpsertOutcome::Merged, candidate.confidence));
    }

    // A different live venue already owning one of the URLs makes this a
    // duplicate; staging never holds two live venues with one URL.
    for link in &candidate.platform_links {
        if let Some(normalized) = crate::models::normalize_delivery_url(&link.url) {
            let holders = store.venue_ids_with_url(&normalized, Some(VenueStatus::Rejected))?;
            if !holders.is_empty() {
                return Ok((UpsertOutcome::SkippedDuplicateUrl, candidate.confidence));
            }
        }
    }

    let mut venue = DiscoveredVenue::new(
        candidate.name,
        crate::models::Address {
            street: candidate.street,
            city: candidate.city,
            postal_code: candidate.postal_code,
            country: candidate.country,
        },
        OriginTrace {
            strategy_id: query.strategy_id.clone(),
            search_query: query.query.clone(),
        },
    )
    .with_confidence(candidate.confidence)
    .with_links(candidate.platform_links);
    venue.positive_factors = candidate.positive_factors;
    venue.negative_factors = candidate.negative_factors;
    if let Some(chain_id) = &query.chain_id {
        venue.chain_id = Some(chain_id.clone());
    } else if let Some(guess) = &candidate.chain_guess {
        venue.chain_id = Some(record_detected_chain(store, guess, &venue)?);
    }
    let confidence = venue.confidence_score;
    store.upsert_venue(&venue)?;
    Ok((UpsertOutcome::New, confidence))
}

/// Write a classifier-detected chain back to the store. First sightings
/// create an unverified row; repeat sightings grow its country and city
/// footprint so tier-1 planning has real coverage data to work with.
fn record_detected_chain(
    store: &Store,
    name: &str,
    venue: &DiscoveredVenue,
) -> anyhow::Result<String> {
    let country = venue.address.country.clone();
    let city = venue.address.city.clone();

    if let Some(mut chain) = store.find_chain_by_name(name)? {
        let mut changed = false;
        if !chain.countries.contains(&country) {
            chain.countries.push(country.clone());
            chain.countries.sort();
            changed = true;
        }
        let city_known = chain
            .cities
            .iter()
            .any(|(co, ci)| co == &country && ci.eq_ignore_ascii_case(&city));
        if !city_known {
            chain.cities.push((country, city));
            chain.locations_count = chain.locations_count.max(chain.cities.len() as u32);
            changed = true;
        }
        if changed {
            chain.updated_at = Utc::now();
            store.upsert_chain(&chain)?;
        }
        return Ok(chain.id);
    }

    let now = Utc::now();
    let chain = Chain {
        id: Uuid::new_v4().to_string(),
        name: name.trim().to_string(),
        countries: vec![country.clone()],
        locations_count: 1,
        cities: vec![(country, city)],
        verified: false,
        created_at: now,
        updated_at: now,
    };
    store.upsert_chain(&chain)?;
    debug!(chain = %chain.name, "new chain detected, staged unverified");
    Ok(chain.id)
}

/// Fold one query outcome into the report, the learning record, and the
/// persisted strategy counters.
fn fold_outcome(
    deps: &DiscoveryDeps<'_>,
    report: &mut DiscoveryRunReport,
    chains_seen: &mut Vec<String>,
    learning: &mut LearningRecord,
    outcome: QueryOutcome,
    dry_run: bool,
) {
    report.queries_executed += u32::from(outcome.executed);
    report.queries_successful += u32::from(outcome.successful);
    report.queries_classified += u32::from(outcome.classified);
    report.venues_discovered += outcome.new_venues;
    report.venues_merged += outcome.merged_venues;
    report.duplicates_skipped += outcome.duplicates;
    report.credentials_exhausted += u32::from(outcome.quota_exhausted);
    for chain in &outcome.chains {
        if !chains_seen.contains(chain) {
            chains_seen.push(chain.clone());
        }
    }
    if let Some(message) = outcome.error {
        learning.note_failure(&message);
        report.errors.push(PhaseError {
            phase: format!("query:{}", outcome.query.query),
            message,
        });
    }

    if dry_run || !outcome.executed {
        return;
    }
    let Some(strategy_id) = &outcome.query.strategy_id else {
        return;
    };
    learning.note_strategy(strategy_id, outcome.new_venues + outcome.merged_venues);
    // Read-modify-write is safe here: outcomes fold on one task.
    match deps.store.get_strategy(strategy_id) {
        Ok(Some(mut strategy)) => {
            strategy.uses += 1;
            strategy.successes += outcome.successes.min(1) as u64;
            strategy.false_positives += outcome.false_positives.min(1) as u64;
            // Counter invariant: successes + false_positives <= uses.
            if strategy.successes + strategy.false_positives > strategy.uses {
                strategy.false_positives = strategy.uses.saturating_sub(strategy.successes);
            }
            strategy.updated_at = Utc::now();
            if let Err(e) = deps.store.upsert_strategy(&strategy) {
                warn!(strategy = %strategy_id, error = %e, "strategy update failed");
            }
        }
        Ok(None) => debug!(strategy = %strategy_id, "strategy vanished during run"),
        Err(e) => warn!(strategy = %strategy_id, error = %e, "strategy read failed"),
    }
}
