//! End-to-end discovery scenarios against the mock search provider and
//! classifier: candidate staging, auto-verification, strategy feedback,
//! idempotence, and credential backpressure.

use std::sync::atomic::AtomicBool;

use platescout_backend::config::{EngineConfig, SearchProviderKind};
use platescout_backend::credentials::CredentialPool;
use platescout_backend::discovery::{
    self,
    classifier::MockClassifier,
    search::MockSearchProvider,
    DiscoveryDeps,
};
use platescout_backend::models::{DiscoveryStrategy, Platform, SearchCredential, VenueStatus};
use platescout_backend::planner::{PlannedQuery, QueryGroup, QueryPlan, Tier};
use platescout_backend::review::AutoVerifier;
use platescout_backend::storage::Store;

fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.discovery.search_provider = SearchProviderKind::Mock;
    config.discovery.countries = vec!["CH".to_string()];
    config.pacing.concurrency = 2;
    config
}

fn pool_with_quota(store: &Store, quota: u32) -> CredentialPool {
    CredentialPool::load(
        store.clone(),
        vec![SearchCredential::new(
            "cred-1".to_string(),
            "key".to_string(),
            "engine".to_string(),
            quota,
        )],
    )
    .unwrap()
}

/// Three tier-2 queries bound to one strategy, one city each.
fn strategy_plan(strategy_id: &str) -> QueryPlan {
    let queries = ["Zurich", "Basel", "Bern"]
        .iter()
        .map(|city| PlannedQuery {
            query: format!("planted {city}"),
            tier: Tier::HighYield,
            country: "CH".to_string(),
            city: Some(city.to_string()),
            platform: Some(Platform::Wolt),
            chain_id: None,
            chain_name: None,
            strategy_id: Some(strategy_id.to_string()),
        })
        .collect();
    QueryPlan {
        total_budget: 3,
        groups: vec![QueryGroup {
            tier: Tier::HighYield,
            allowance: 3,
            queries,
        }],
    }
}

fn seed_strategy(store: &Store) -> DiscoveryStrategy {
    let mut strategy = DiscoveryStrategy::new("planted {city}".to_string(), "CH".to_string());
    strategy.id = "strat-1".to_string();
    store.upsert_strategy(&strategy).unwrap();
    strategy
}

#[tokio::test]
async fn mock_run_stages_and_auto_verifies() {
    let store = Store::open_in_memory().unwrap();
    let pool = pool_with_quota(&store, 100);
    seed_strategy(&store);
    let config = test_config();
    let search = MockSearchProvider::new(2);
    let classifier = MockClassifier::new(95.0);
    let cancelled = AtomicBool::new(false);

    let deps = DiscoveryDeps {
        store: &store,
        pool: &pool,
        search: &search,
        classifier: &classifier,
        fallback_classifier: None,
        cancelled: &cancelled,
    };
    let report = discovery::execute_plan(&deps, &config, &strategy_plan("strat-1"))
        .await
        .unwrap();

    // 3 queries, 2 hits each, all classified at confidence 95.
    assert_eq!(report.queries_executed, 3);
    assert_eq!(report.queries_successful, 3);
    assert_eq!(report.queries_classified, 3);
    assert_eq!(report.venues_discovered, 6);
    assert!(!report.backpressure);

    // Strategy counters: one use per query, success capped at one per
    // query, invariant holds.
    let strategy = store.get_strategy("strat-1").unwrap().unwrap();
    assert_eq!(strategy.uses, 3);
    assert_eq!(strategy.successes, 3);
    assert!(strategy.successes + strategy.false_positives <= strategy.uses);

    // Rule 5 (confidence >= 95) verifies all six candidates.
    let verifier = AutoVerifier::new(&store);
    let (verified, rejected, needs_review) = verifier.sweep(false).unwrap();
    assert_eq!(verified, 6);
    assert_eq!(rejected, 0);
    assert_eq!(needs_review, 0);
}

#[tokio::test]
async fn rerun_is_idempotent() {
    let store = Store::open_in_memory().unwrap();
    let pool = pool_with_quota(&store, 100);
    seed_strategy(&store);
    let config = test_config();
    let search = MockSearchProvider::new(2);
    let classifier = MockClassifier::new(95.0);
    let cancelled = AtomicBool::new(false);
    let deps = DiscoveryDeps {
        store: &store,
        pool: &pool,
        search: &search,
        classifier: &classifier,
        fallback_classifier: None,
        cancelled: &cancelled,
    };

    let first = discovery::execute_plan(&deps, &config, &strategy_plan("strat-1"))
        .await
        .unwrap();
    assert_eq!(first.venues_discovered, 6);
    let rate_after_first = store.get_strategy("strat-1").unwrap().unwrap().success_rate();

    let second = discovery::execute_plan(&deps, &config, &strategy_plan("strat-1"))
        .await
        .unwrap();
    // No world change: merges only, zero new venues.
    assert_eq!(second.venues_discovered, 0);
    assert_eq!(second.venues_merged, 6);
    assert_eq!(
        store.list_venues_by_status(VenueStatus::Discovered).unwrap().len(),
        6
    );

    // Feedback is idempotent in rate terms: merges count like the
    // original acceptances, so the success rate is unchanged.
    let strategy = store.get_strategy("strat-1").unwrap().unwrap();
    assert_eq!(strategy.uses, 6);
    assert_eq!(strategy.success_rate(), rate_after_first);
    assert!(strategy.successes + strategy.false_positives <= strategy.uses);
}

#[tokio::test]
async fn exhausted_pool_surrenders_budget() {
    let store = Store::open_in_memory().unwrap();
    // One credential with a single query of quota: the second query in
    // the tier hits backpressure.
    let pool = pool_with_quota(&store, 1);
    seed_strategy(&store);
    let mut config = test_config();
    config.pacing.concurrency = 1;
    let search = MockSearchProvider::new(2);
    let classifier = MockClassifier::new(95.0);
    let cancelled = AtomicBool::new(false);
    let deps = DiscoveryDeps {
        store: &store,
        pool: &pool,
        search: &search,
        classifier: &classifier,
        fallback_classifier: None,
        cancelled: &cancelled,
    };

    let report = discovery::execute_plan(&deps, &config, &strategy_plan("strat-1"))
        .await
        .unwrap();
    assert!(report.backpressure);
    assert_eq!(report.queries_executed, 1);
    // The remaining budget was surrendered, not errored.
    assert!(report.errors.is_empty());
}

#[tokio::test]
async fn rejected_match_blocks_restaging() {
    let store = Store::open_in_memory().unwrap();
    let pool = pool_with_quota(&store, 100);
    seed_strategy(&store);
    let config = test_config();
    let search = MockSearchProvider::new(1);
    let classifier = MockClassifier::new(95.0);
    let cancelled = AtomicBool::new(false);
    let deps = DiscoveryDeps {
        store: &store,
        pool: &pool,
        search: &search,
        classifier: &classifier,
        fallback_classifier: None,
        cancelled: &cancelled,
    };

    let plan = strategy_plan("strat-1");
    discovery::execute_plan(&deps, &config, &plan).await.unwrap();

    // Reject everything that was staged.
    for mut venue in store.list_venues_by_status(VenueStatus::Discovered).unwrap() {
        venue.status = VenueStatus::Rejected;
        venue.rejection_reason = Some("not a partner".to_string());
        store.upsert_venue(&venue).unwrap();
    }

    // The same hits come back; rejected matches must not be restaged.
    let report = discovery::execute_plan(&deps, &config, &plan).await.unwrap();
    assert_eq!(report.venues_discovered, 0);
    assert_eq!(report.venues_merged, 0);
    assert!(store.list_venues_by_status(VenueStatus::Discovered).unwrap().is_empty());
}

#[tokio::test]
async fn detected_chains_land_in_the_store() {
    let store = Store::open_in_memory().unwrap();
    let pool = pool_with_quota(&store, 100);
    let config = test_config();
    let search = MockSearchProvider::new(1);
    let classifier = MockClassifier::new(95.0);
    let cancelled = AtomicBool::new(false);
    let deps = DiscoveryDeps {
        store: &store,
        pool: &pool,
        search: &search,
        classifier: &classifier,
        fallback_classifier: None,
        cancelled: &cancelled,
    };

    // A chain-hinted query without a pre-seeded chain row: the classifier
    // guesses the chain and discovery must write it back.
    let plan = QueryPlan {
        total_budget: 1,
        groups: vec![QueryGroup {
            tier: Tier::CityExploration,
            allowance: 1,
            queries: vec![PlannedQuery {
                query: "Hiltl planted Zurich".to_string(),
                tier: Tier::CityExploration,
                country: "CH".to_string(),
                city: Some("Zurich".to_string()),
                platform: Some(Platform::Wolt),
                chain_id: None,
                chain_name: Some("Hiltl".to_string()),
                strategy_id: None,
            }],
        }],
    };
    let report = discovery::execute_plan(&deps, &config, &plan).await.unwrap();
    assert_eq!(report.venues_discovered, 1);
    assert_eq!(report.chains_detected, 1);

    let chain = store.find_chain_by_name("Hiltl").unwrap().expect("chain staged");
    assert!(!chain.verified);
    assert_eq!(chain.countries, vec!["CH".to_string()]);
    assert_eq!(chain.cities.len(), 1);

    // The staged venue points at the new chain row.
    let venues = store.list_venues_by_status(VenueStatus::Discovered).unwrap();
    assert_eq!(venues[0].chain_id.as_deref(), Some(chain.id.as_str()));
}

#[tokio::test]
async fn explore_run_accrues_counters_on_materialized_strategies() {
    let store = Store::open_in_memory().unwrap();
    let pool = pool_with_quota(&store, 100);
    let mut config = test_config();
    config.discovery.max_queries = 12;
    let search = MockSearchProvider::new(1);
    let classifier = MockClassifier::new(95.0);
    let cancelled = AtomicBool::new(false);
    let deps = DiscoveryDeps {
        store: &store,
        pool: &pool,
        search: &search,
        classifier: &classifier,
        fallback_classifier: None,
        cancelled: &cancelled,
    };

    // No hand-seeded strategies: a fresh database.
    assert!(store.list_strategies().unwrap().is_empty());

    let report = discovery::run(&deps, &config).await.unwrap();
    assert!(report.queries_executed > 0);

    // Explore planning materialized the built-in templates and the run's
    // feedback accrued on them.
    let strategies = store.list_strategies().unwrap();
    assert!(!strategies.is_empty());
    let used: u64 = strategies.iter().map(|s| s.uses).sum();
    assert_eq!(used as u32, report.queries_executed);
    for strategy in &strategies {
        assert!(strategy.successes + strategy.false_positives <= strategy.uses);
    }

    // The learning record credits the strategies that staged venues.
    let learning = platescout_backend::learning::LearningRecord::load_last(&store, "discovery")
        .unwrap()
        .unwrap();
    assert!(!learning.strategy_hits.is_empty());
    let credited: u32 = learning.strategy_hits.iter().map(|(_, n)| n).sum();
    assert_eq!(credited, report.venues_discovered + report.venues_merged);
}

#[tokio::test]
async fn dry_run_persists_nothing() {
    let store = Store::open_in_memory().unwrap();
    let pool = pool_with_quota(&store, 100);
    seed_strategy(&store);
    let mut config = test_config();
    config.discovery.dry_run = true;
    let search = MockSearchProvider::new(2);
    let classifier = MockClassifier::new(95.0);
    let cancelled = AtomicBool::new(false);
    let deps = DiscoveryDeps {
        store: &store,
        pool: &pool,
        search: &search,
        classifier: &classifier,
        fallback_classifier: None,
        cancelled: &cancelled,
    };

    let report = discovery::execute_plan(&deps, &config, &strategy_plan("strat-1"))
        .await
        .unwrap();
    assert_eq!(report.venues_discovered, 6);
    assert!(store.list_venues_by_status(VenueStatus::Discovered).unwrap().is_empty());
    // Strategy counters untouched in dry runs.
    let strategy = store.get_strategy("strat-1").unwrap().unwrap();
    assert_eq!(strategy.uses, 0);
}
