//! End-to-end extraction and sync: canned platform pages → staged dishes
//! → verification → atomic promotion → locator-visible production data.

use std::sync::atomic::AtomicBool;

use platescout_backend::config::{EngineConfig, ExtractionMode};
use platescout_backend::error::EngineError;
use platescout_backend::extraction::{
    self,
    fetcher::StaticFetcher,
    pacing::{HostPacer, UrlCache},
    ExtractionDeps,
};
use platescout_backend::models::{
    Address, DeliveryPlatformLink, DiscoveredVenue, OriginTrace, Platform, ProductTag,
    VenueStatus,
};
use platescout_backend::review::{SyncPlanner, SyncRequest};
use platescout_backend::storage::Store;

fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.pacing.min_delay_ms = 0;
    config.pacing.max_delay_ms = 0;
    config.pacing.batch_delay_ms = 0;
    config.pacing.max_requests_per_minute = 1000;
    config.pacing.max_requests_per_hour = 1000;
    config.pacing.max_requests_per_day = 1000;
    config.pacing.global_daily_cap = 1000;
    config.extraction.mode = ExtractionMode::Refresh;
    config
}

fn staged_venue(store: &Store, name: &str, url: &str) -> DiscoveredVenue {
    let mut venue = DiscoveredVenue::new(
        name.to_string(),
        Address {
            street: None,
            city: "Zurich".to_string(),
            postal_code: Some("8001".to_string()),
            country: "CH".to_string(),
        },
        OriginTrace {
            strategy_id: Some("strat-origin".to_string()),
            search_query: "planted Zurich".to_string(),
        },
    )
    .with_confidence(85.0);
    venue.platform_links.push(DeliveryPlatformLink {
        platform: Platform::Wolt,
        url: url.to_string(),
        active: None,
    });
    store.upsert_venue(&venue).unwrap();
    venue
}

const MENU_PAGE: &str = r#"<html><body>
  <div data-test-id="MenuSection">
    <div data-test-id="horizontal-item-card">
      <div data-test-id="horizontal-item-card-header">Caesar with planted.chicken</div>
      <div data-test-id="horizontal-item-card-description">Crisp romaine, planted strips</div>
      <div data-test-id="horizontal-item-card-price">CHF 18.50</div>
    </div>
    <div data-test-id="horizontal-item-card">
      <div data-test-id="horizontal-item-card-header">Beef Burger</div>
      <div data-test-id="horizontal-item-card-price">CHF 21.00</div>
    </div>
  </div>
</body></html>"#;

#[tokio::test]
async fn extraction_stages_brand_dishes() {
    let store = Store::open_in_memory().unwrap();
    let url = "https://wolt.com/en/che/zurich/restaurant/caesar-place";
    let venue = staged_venue(&store, "Caesar Place", url);

    let fetcher = StaticFetcher::new();
    fetcher.insert(url, MENU_PAGE);
    let config = fast_config();
    let pacer = HostPacer::new(config.pacing.clone());
    let cache = UrlCache::new();
    let cancelled = AtomicBool::new(false);
    let deps = ExtractionDeps {
        store: &store,
        fetcher: &fetcher,
        pacer: &pacer,
        cache: &cache,
        cancelled: &cancelled,
    };

    let report = extraction::run(&deps, &config).await.unwrap();
    assert_eq!(report.venues_processed, 1);
    assert_eq!(report.dishes_new, 1);

    let dishes = store.dishes_for_venue(&venue.id).unwrap();
    assert_eq!(dishes.len(), 1);
    let dish = &dishes[0];
    assert_eq!(dish.product_tag, ProductTag::PlantedChicken);
    assert!(dish.confidence_score >= 80.0, "got {}", dish.confidence_score);
    // Country derived from the Wolt market segment in the URL.
    assert_eq!(dish.prices["CH"].currency, "CHF");
    assert_eq!(dish.prices["CH"].amount, 18.5);

    // Learning record landed for the planner's next pass.
    let learning = platescout_backend::learning::LearningRecord::load_last(&store, "extraction")
        .unwrap()
        .unwrap();
    assert_eq!(learning.platform_outcomes[0].platform, "wolt");
    assert_eq!(learning.platform_outcomes[0].successes, 1);
    // The staging strategy gets credit for the brand dish its venue
    // yielded (the non-brand item never counts).
    assert_eq!(learning.strategy_hits, vec![("strat-origin".to_string(), 1)]);
}

#[tokio::test]
async fn second_run_hits_url_cache_and_merges() {
    let store = Store::open_in_memory().unwrap();
    let url = "https://wolt.com/en/che/zurich/restaurant/caesar-place";
    let venue = staged_venue(&store, "Caesar Place", url);

    let fetcher = StaticFetcher::new();
    fetcher.insert(url, MENU_PAGE);
    let config = fast_config();
    let pacer = HostPacer::new(config.pacing.clone());
    let cache = UrlCache::new();
    let cancelled = AtomicBool::new(false);
    let deps = ExtractionDeps {
        store: &store,
        fetcher: &fetcher,
        pacer: &pacer,
        cache: &cache,
        cancelled: &cancelled,
    };

    extraction::run(&deps, &config).await.unwrap();
    let second = extraction::run(&deps, &config).await.unwrap();
    assert_eq!(second.pages_from_cache, 1);
    assert_eq!(second.dishes_new, 0);
    // Still exactly one staged dish for the venue.
    assert_eq!(store.dishes_for_venue(&venue.id).unwrap().len(), 1);
}

#[tokio::test]
async fn three_failures_park_the_venue() {
    let store = Store::open_in_memory().unwrap();
    let url = "https://wolt.com/en/che/zurich/restaurant/flaky";
    let venue = staged_venue(&store, "Flaky Corner", url);

    let fetcher = StaticFetcher::new();
    fetcher.insert_failure(
        url,
        EngineError::Protocol {
            message: "captcha challenge".to_string(),
            status: None,
        },
    );
    let config = fast_config();
    let pacer = HostPacer::new(config.pacing.clone());
    let cache = UrlCache::new();
    let cancelled = AtomicBool::new(false);
    let deps = ExtractionDeps {
        store: &store,
        fetcher: &fetcher,
        pacer: &pacer,
        cache: &cache,
        cancelled: &cancelled,
    };

    for _ in 0..3 {
        let report = extraction::run(&deps, &config).await.unwrap();
        assert_eq!(report.venues_failed, 1);
    }
    let parked = store.get_venue(&venue.id).unwrap().unwrap();
    assert_eq!(parked.extraction_failures, 3);

    // Inside the cooldown the venue is no longer selected.
    let report = extraction::run(&deps, &config).await.unwrap();
    assert_eq!(report.venues_selected, 0);
}

#[tokio::test]
async fn full_flow_to_production() {
    let store = Store::open_in_memory().unwrap();
    let url = "https://wolt.com/en/che/zurich/restaurant/caesar-place";
    let venue = staged_venue(&store, "Caesar Place", url);

    let fetcher = StaticFetcher::new();
    fetcher.insert(url, MENU_PAGE);
    let config = fast_config();
    let pacer = HostPacer::new(config.pacing.clone());
    let cache = UrlCache::new();
    let cancelled = AtomicBool::new(false);
    let deps = ExtractionDeps {
        store: &store,
        fetcher: &fetcher,
        pacer: &pacer,
        cache: &cache,
        cancelled: &cancelled,
    };
    extraction::run(&deps, &config).await.unwrap();

    // Reviewer approves the venue (and thereby its dishes).
    let queue = platescout_backend::review::ReviewQueue::new(&store);
    let current = store.get_venue(&venue.id).unwrap().unwrap();
    queue.approve(&venue.id, current.updated_at, "reviewer").unwrap();

    // Preview shows one addition with its verified dish.
    let planner = SyncPlanner::new(&store);
    let preview = planner.preview().unwrap();
    assert_eq!(preview.additions.len(), 1);
    assert_eq!(preview.additions[0].verified_dish_count, 1);

    let record = planner
        .execute(&SyncRequest {
            sync_all: true,
            actor: "ops".to_string(),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(record.failed, 0);
    assert_eq!(record.venue_ids.len(), 1);
    assert_eq!(record.dish_ids.len(), 1);

    // Production is consistent: promoted staging rows point at real
    // production rows, and the dish hangs off the production venue.
    let staged = store.get_venue(&venue.id).unwrap().unwrap();
    assert_eq!(staged.status, VenueStatus::Promoted);
    let production_id = staged.production_venue_id.unwrap();
    let production = store.get_production_venue(&production_id).unwrap().unwrap();
    assert_eq!(production.name, "Caesar Place");
    let production_dishes = store.production_dishes_for_venue(&production_id).unwrap();
    assert_eq!(production_dishes.len(), 1);
    assert_eq!(production_dishes[0].product_tag, ProductTag::PlantedChicken);

    // Second preview: the set is drained.
    assert!(planner.preview().unwrap().additions.is_empty());
}
