//! Dish extractor.
//!
//! Walks selected staged venues, fetches their platform pages under the
//! pacing rules, pulls out brand-containing dishes, and stages them with
//! confidence scores. Three consecutive failed runs park a venue behind a
//! 24 h cooldown.

pub mod adapters;
pub mod fetcher;
pub mod menu;
pub mod pacing;

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, ExtractionMode, ExtractionTarget};
use crate::error::EngineError;
use crate::learning::LearningRecord;
use crate::models::{DiscoveredVenue, VenueStatus};
use crate::storage::Store;

use adapters::{adapter_for, country_from_url};
use fetcher::{fetch_with_retry, FetchRequest, PageData, PageFetcher};
use pacing::{HostPacer, UrlCache};

const MAX_CONSECUTIVE_RUN_FAILURES: u32 = 3;

/// How long a venue with three consecutive failed runs stays parked.
fn failure_cooldown() -> chrono::Duration {
    chrono::Duration::hours(24)
}

pub struct ExtractionDeps<'a> {
    pub store: &'a Store,
    pub fetcher: &'a dyn PageFetcher,
    pub pacer: &'a HostPacer,
    pub cache: &'a UrlCache,
    pub cancelled: &'a AtomicBool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtractionError {
    pub venue_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExtractionRunReport {
    pub venues_selected: u32,
    pub venues_processed: u32,
    pub venues_failed: u32,
    pub pages_fetched: u32,
    pub pages_from_cache: u32,
    pub dishes_found: u32,
    pub dishes_new: u32,
    pub cancelled: bool,
    /// (platform, ok, failed) fetch outcomes.
    pub per_platform: Vec<(String, u32, u32)>,
    pub errors: Vec<ExtractionError>,
}

/// Result of working one venue, folded into the report on one task.
struct VenueOutcome {
    venue_id: String,
    processed: bool,
    any_success: bool,
    pages_fetched: u32,
    pages_from_cache: u32,
    dishes_found: u32,
    dishes_new: u32,
    platform_results: Vec<(String, bool)>,
    error: Option<String>,
    /// Global quota errors stop the whole run, not just this venue.
    abort_run: bool,
}

pub async fn run(
    deps: &ExtractionDeps<'_>,
    config: &EngineConfig,
) -> anyhow::Result<ExtractionRunReport> {
    let venues = select_venues(deps.store, config)?;
    let mut report = ExtractionRunReport {
        venues_selected: venues.len() as u32,
        ..Default::default()
    };
    let mut learning = LearningRecord::new("extraction");
    let concurrency = config.pacing.concurrency.max(1);
    let batch_size = config.pacing.batch_size.max(1) as usize;

    info!(
        selected = venues.len(),
        mode = ?config.extraction.mode,
        dry_run = config.extraction.dry_run,
        "extraction run starting"
    );

    let mut abort = false;
    'batches: for (batch_index, batch) in venues.chunks(batch_size).enumerate() {
        if batch_index > 0 && config.pacing.batch_delay_ms > 0 {
            debug!(pause_ms = config.pacing.batch_delay_ms, "batch pause");
            tokio::time::sleep(Duration::from_millis(config.pacing.batch_delay_ms)).await;
        }

        for chunk in batch.chunks(concurrency) {
            if deps.cancelled.load(Ordering::Relaxed) {
                report.cancelled = true;
                break 'batches;
            }
            let outcomes = join_all(
                chunk
                    .iter()
                    .map(|venue| process_venue(deps, config, venue)),
            )
            .await;
            for outcome in outcomes {
                abort |= outcome.abort_run;
                fold_outcome(deps, config, &mut report, &mut learning, outcome);
            }
            if abort {
                warn!("global request cap reached, aborting extraction run");
                break 'batches;
            }
        }
    }

    if config.extraction.learn && !config.extraction.dry_run {
        learning.persist(deps.store)?;
    }
    metrics::counter!("extraction_pages_fetched", report.pages_fetched as u64);
    metrics::counter!("extraction_dishes_new", report.dishes_new as u64);
    info!(
        processed = report.venues_processed,
        failed = report.venues_failed,
        dishes_new = report.dishes_new,
        "extraction run finished"
    );
    Ok(report)
}

/// Resolve the configured target to a concrete venue list.
fn select_venues(store: &Store, config: &EngineConfig) -> anyhow::Result<Vec<DiscoveredVenue>> {
    let limit = config.extraction.max_venues as usize;
    let mut venues = match config.extraction.resolved_target()? {
        ExtractionTarget::All => store.venues_pending_extraction(failure_cooldown(), limit)?,
        ExtractionTarget::Chain { chain_id } => store
            .venues_pending_extraction(failure_cooldown(), 100_000)?
            .into_iter()
            .filter(|v| v.chain_id.as_deref() == Some(chain_id.as_str()))
            .take(limit)
            .collect(),
        ExtractionTarget::Venues { venue_ids } => {
            let mut selected = Vec::new();
            for id in venue_ids.iter().take(limit) {
                if let Some(venue) = store.get_venue(id)? {
                    if !matches!(venue.status, VenueStatus::Rejected) {
                        selected.push(venue);
                    }
                }
            }
            selected
        }
    };

    if !config.extraction.countries.is_empty() {
        venues.retain(|v| config.extraction.countries.contains(&v.address.country));
    }

    // Mode selects by dish presence: enrich fills gaps, refresh redoes
    // everything, verify revisits venues that already have dishes.
    let mode = config.extraction.mode;
    if mode != ExtractionMode::Refresh {
        let ids: Vec<String> = venues.iter().map(|v| v.id.clone()).collect();
        let counts = store.dish_counts_by_venue(&ids)?;
        venues.retain(|v| {
            let has_dishes = counts.iter().any(|(id, total, _)| id == &v.id && *total > 0);
            match mode {
                ExtractionMode::Enrich => !has_dishes,
                ExtractionMode::Verify => has_dishes,
                ExtractionMode::Refresh => true,
            }
        });
    }

    venues.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(venues)
}

/// Work one venue: every platform link, cache → pacer → fetch → extract.
async fn process_venue(
    deps: &ExtractionDeps<'_>,
    config: &EngineConfig,
    venue: &DiscoveredVenue,
) -> VenueOutcome {
    let mut outcome = VenueOutcome {
        venue_id: venue.id.clone(),
        processed: false,
        any_success: false,
        pages_fetched: 0,
        pages_from_cache: 0,
        dishes_found: 0,
        dishes_new: 0,
        platform_results: Vec::new(),
        error: None,
        abort_run: false,
    };

    for link in &venue.platform_links {
        if deps.cancelled.load(Ordering::Relaxed) {
            return outcome;
        }
        if !config.extraction.platforms.contains(&link.platform) {
            continue;
        }
        outcome.processed = true;
        let adapter = adapter_for(link.platform);
        let country = country_from_url(link.platform, &link.url)
            .unwrap_or_else(|| venue.address.country.clone());

        let cached = deps.cache.get(&link.url);
        let from_cache = cached.is_some();
        let page = match cached {
            Some(html) => {
                outcome.pages_from_cache += 1;
                Ok(PageData {
                    url: link.url.clone(),
                    html,
                })
            }
            None => fetch_page(deps, config, adapter, &link.url, &country).await,
        };

        match page {
            Ok(page) => {
                if !from_cache {
                    deps.cache.put(&link.url, page.html.clone());
                }
                outcome.pages_fetched += 1;
                outcome.platform_results.push((link.platform.as_str().to_string(), true));
                outcome.any_success = true;

                let items = menu::extract_items(&page, adapter);
                let dishes = menu::build_dishes(items, &venue.id, &country);
                outcome.dishes_found += dishes.len() as u32;
                if !config.extraction.dry_run {
                    match persist_dishes(deps.store, venue, dishes) {
                        Ok(new) => outcome.dishes_new += new,
                        Err(e) => outcome.error = Some(format!("persist: {e}")),
                    }
                }
            }
            Err(e) => {
                outcome.platform_results.push((link.platform.as_str().to_string(), false));
                let global = matches!(&e, EngineError::Quota(message) if message.contains("global"));
                outcome.abort_run |= global;
                outcome.error = Some(e.to_string());
                debug!(venue = %venue.id, url = %link.url, error = %e, "link extraction failed");
            }
        }
    }

    outcome
}

async fn fetch_page(
    deps: &ExtractionDeps<'_>,
    config: &EngineConfig,
    adapter: &adapters::PlatformAdapter,
    url: &str,
    country: &str,
) -> Result<PageData, EngineError> {
    let host = url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_string()))
        .ok_or_else(|| EngineError::Content(format!("unparseable url {url}")))?;

    deps.pacer.acquire(&host).await?;

    let request = FetchRequest {
        url: url.to_string(),
        country: country.to_string(),
        wait_selector: adapter.wait_selector.to_string(),
        scroll_to_bottom: adapter.scroll_to_bottom,
        viewport: (1366, 900),
        timeout: Duration::from_secs(config.pacing.fetch_timeout_secs),
    };
    fetch_with_retry(deps.fetcher, &request).await
}

/// Upsert extracted dishes, merging by lowercase name within the venue.
fn persist_dishes(
    store: &Store,
    venue: &DiscoveredVenue,
    dishes: Vec<crate::models::DiscoveredDish>,
) -> anyhow::Result<u32> {
    let existing = store.dishes_for_venue(&venue.id)?;
    let mut new_count = 0;
    for dish in dishes {
        let name_lower = dish.name.trim().to_lowercase();
        match existing
            .iter()
            .find(|d| d.name.trim().to_lowercase() == name_lower)
        {
            Some(current) => {
                let mut merged = current.clone();
                merged.description = dish.description.or(merged.description);
                merged.category = dish.category.or(merged.category);
                for (country, price) in dish.prices {
                    merged.prices.insert(country, price);
                }
                if dish.confidence_score > merged.confidence_score {
                    merged.confidence = dish.confidence;
                    merged.confidence_score = dish.confidence_score;
                    merged.needs_review = dish.needs_review;
                    merged.product_tag = dish.product_tag;
                }
                merged.updated_at = Utc::now();
                store.upsert_dish(&merged)?;
            }
            None => {
                store.upsert_dish(&dish)?;
                new_count += 1;
            }
        }
    }
    Ok(new_count)
}

/// Fold a venue outcome into the report and update the venue's failure
/// accounting.
fn fold_outcome(
    deps: &ExtractionDeps<'_>,
    config: &EngineConfig,
    report: &mut ExtractionRunReport,
    learning: &mut LearningRecord,
    outcome: VenueOutcome,
) {
    if !outcome.processed {
        return;
    }
    report.venues_processed += 1;
    report.pages_fetched += outcome.pages_fetched;
    report.pages_from_cache += outcome.pages_from_cache;
    report.dishes_found += outcome.dishes_found;
    report.dishes_new += outcome.dishes_new;
    for (platform, ok) in &outcome.platform_results {
        learning.note_platform(platform, *ok);
        match report.per_platform.iter_mut().find(|(p, _, _)| p == platform) {
            Some((_, ok_count, fail_count)) => {
                *ok_count += u32::from(*ok);
                *fail_count += u32::from(!*ok);
            }
            None => report
                .per_platform
                .push((platform.clone(), u32::from(*ok), u32::from(!*ok))),
        }
    }
    if let Some(message) = &outcome.error {
        learning.note_failure(message);
        report.errors.push(ExtractionError {
            venue_id: outcome.venue_id.clone(),
            message: message.clone(),
        });
    }
    if !outcome.any_success {
        report.venues_failed += 1;
    }

    if config.extraction.dry_run {
        return;
    }
    // Failure accounting on the venue record drives the cooldown.
    if let Ok(Some(mut venue)) = deps.store.get_venue(&outcome.venue_id) {
        // Dishes found here trace back to whichever strategy staged the
        // venue; the learning record credits it.
        if let Some(strategy_id) = &venue.origin.strategy_id {
            learning.note_strategy(strategy_id, outcome.dishes_found);
        }
        if outcome.any_success {
            venue.extraction_failures = 0;
        } else {
            venue.extraction_failures = (venue.extraction_failures + 1).min(MAX_CONSECUTIVE_RUN_FAILURES);
            if venue.extraction_failures >= MAX_CONSECUTIVE_RUN_FAILURES {
                warn!(venue = %venue.id, "marked extraction_failed, cooling down");
            }
        }
        venue.last_extraction_at = Some(Utc::now());
        venue.updated_at = Utc::now();
        if let Err(e) = deps.store.upsert_venue(&venue) {
            warn!(venue = %venue.id, error = %e, "failure accounting update failed");
        }
    }
}
