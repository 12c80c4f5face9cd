//! platescout: discovery & extraction engine for the planted partner
//! catalog.
//!
//! Subcommands run the pipeline pieces on their own or as one long-lived
//! process serving the locator API. Exit codes: 0 success, 1 fatal run
//! error, 2 misconfiguration.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use platescout_backend::api::{self, ApiState};
use platescout_backend::config::{EngineConfig, SearchProviderKind};
use platescout_backend::credentials::CredentialPool;
use platescout_backend::discovery::{
    self,
    classifier::{CandidateClassifier, FallbackClassifier, MockClassifier, PrimaryClassifier},
    search::{FallbackSearchProvider, MockSearchProvider, PrimarySearchProvider, SearchProvider},
    DiscoveryDeps, DiscoveryRunReport,
};
use platescout_backend::extraction::{
    self,
    fetcher::{HeadlessFetcher, PageFetcher},
    pacing::{HostPacer, UrlCache},
    ExtractionDeps, ExtractionRunReport,
};
use platescout_backend::models::SearchCredential;
use platescout_backend::review::{AutoVerifier, SyncPlanner, SyncRequest};
use platescout_backend::storage::{self, Store};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "platescout", version, about = "Partner discovery & extraction engine")]
struct Cli {
    /// Path to the JSON config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Evaluate everything, persist nothing.
    #[arg(long, global = true)]
    dry_run: bool,

    /// Persist results even where the config says dry run.
    #[arg(long, global = true)]
    wet_run: bool,

    /// Debug-level logging.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Full pipeline (discovery → extraction → auto-verify), then serve
    /// the locator API until interrupted.
    Run,

    /// One discovery run.
    Discovery,

    /// One extraction run.
    Extraction,

    /// Auto-verify staged venues and show the review queue.
    Review,

    /// Preview staging → production; promote with --execute.
    Sync {
        /// Execute the promotion instead of previewing.
        #[arg(long)]
        execute: bool,

        /// Promote every eligible staged entity.
        #[arg(long)]
        sync_all: bool,

        /// Explicit staged venue ids to promote.
        #[arg(long, value_delimiter = ',')]
        venue_ids: Vec<String>,

        /// Apply the production staleness transitions first.
        #[arg(long)]
        stale_sweep: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = match EngineConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "configuration error");
            return ExitCode::from(2);
        }
    };
    if cli.dry_run {
        config.discovery.dry_run = true;
        config.extraction.dry_run = true;
    }
    if cli.wet_run {
        config.discovery.dry_run = false;
        config.extraction.dry_run = false;
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "runtime init failed");
            return ExitCode::from(1);
        }
    };
    match runtime.block_on(dispatch(cli.command, config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fatal run error");
            ExitCode::from(1)
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose {
        "platescout_backend=debug,platescout=debug,info"
    } else {
        "info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Shared service wiring for every subcommand.
struct Services {
    store: Store,
    pool: CredentialPool,
    http_client: reqwest::Client,
    cancelled: Arc<AtomicBool>,
}

fn build_services(config: &EngineConfig) -> Result<Services> {
    let store = Store::open(&config.database_path)?;
    let configured: Vec<SearchCredential> = config
        .search_credentials
        .iter()
        .map(|spec| {
            SearchCredential::new(
                spec.id.clone(),
                spec.api_key.clone(),
                spec.engine_id.clone(),
                spec.daily_quota,
            )
        })
        .collect();
    let pool = CredentialPool::load(store.clone(), configured)?;
    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .context("building http client")?;
    Ok(Services {
        store,
        pool,
        http_client,
        cancelled: Arc::new(AtomicBool::new(false)),
    })
}

fn build_search_provider(
    config: &EngineConfig,
    client: &reqwest::Client,
) -> Box<dyn SearchProvider> {
    match config.discovery.search_provider {
        SearchProviderKind::Primary => Box::new(PrimarySearchProvider::new(client.clone())),
        SearchProviderKind::Fallback => Box::new(FallbackSearchProvider::new(client.clone())),
        SearchProviderKind::Mock => Box::new(MockSearchProvider::new(2)),
    }
}

fn build_classifiers(
    config: &EngineConfig,
    client: &reqwest::Client,
) -> Result<(Box<dyn CandidateClassifier>, Option<Box<dyn CandidateClassifier>>)> {
    if config.discovery.search_provider == SearchProviderKind::Mock {
        return Ok((Box::new(MockClassifier::new(95.0)), None));
    }
    let Some(primary_key) = &config.ai_primary_key else {
        anyhow::bail!("AI_PRIMARY_API_KEY is required unless searchProvider is mock");
    };
    let primary: Box<dyn CandidateClassifier> =
        Box::new(PrimaryClassifier::new(client.clone(), primary_key.clone()));
    let fallback: Option<Box<dyn CandidateClassifier>> = config
        .ai_fallback_key
        .as_ref()
        .map(|key| {
            Box::new(FallbackClassifier::new(client.clone(), key.clone()))
                as Box<dyn CandidateClassifier>
        });
    Ok((primary, fallback))
}

async fn dispatch(command: Command, config: EngineConfig) -> Result<()> {
    let services = build_services(&config)?;
    match command {
        Command::Run => run_engine(&config, &services).await,
        Command::Discovery => {
            let report = run_discovery(&config, &services).await?;
            print_discovery_summary(&report);
            finish_run(&config, &services, "discovery", serde_json::to_value(&report)?).await;
            Ok(())
        }
        Command::Extraction => {
            let report = run_extraction(&config, &services).await?;
            print_extraction_summary(&report);
            finish_run(&config, &services, "extraction", serde_json::to_value(&report)?).await;
            Ok(())
        }
        Command::Review => {
            let dry_run = config.discovery.dry_run;
            let verifier = AutoVerifier::new(&services.store);
            let (verified, rejected, needs_review) = verifier.sweep(dry_run)?;
            println!("auto-verify{}:", if dry_run { " (dry run)" } else { "" });
            println!("  verified      {verified}");
            println!("  rejected      {rejected}");
            println!("  needs review  {needs_review}");
            Ok(())
        }
        Command::Sync {
            execute,
            sync_all,
            venue_ids,
            stale_sweep,
        } => {
            if stale_sweep {
                let transitions = storage::apply_staleness(&services.store, chrono::Utc::now())?;
                println!("staleness sweep: {} transitions", transitions.len());
            }
            let planner = SyncPlanner::new(&services.store);
            if execute {
                let record = planner.execute(&SyncRequest {
                    venue_ids,
                    dish_ids: Vec::new(),
                    sync_all,
                    actor: "cli".to_string(),
                })?;
                println!("sync execute:");
                println!("  added   {}", record.added);
                println!("  failed  {}", record.failed);
                for failure in &record.errors {
                    println!("    {}: {}", failure.entity_id, failure.message);
                }
            } else {
                let preview = planner.preview()?;
                let (additions, updates, removals) = preview.totals();
                println!("sync preview:");
                println!("  additions          {additions}");
                println!("  updates            {updates}");
                println!("  potential removals {removals}");
                for addition in &preview.additions {
                    println!(
                        "    + {} ({} dishes, {} verified)",
                        addition.name, addition.dish_count, addition.verified_dish_count
                    );
                }
            }
            Ok(())
        }
    }
}

async fn run_discovery(
    config: &EngineConfig,
    services: &Services,
) -> Result<DiscoveryRunReport> {
    let search = build_search_provider(config, &services.http_client);
    let (classifier, fallback) = build_classifiers(config, &services.http_client)?;
    let deps = DiscoveryDeps {
        store: &services.store,
        pool: &services.pool,
        search: search.as_ref(),
        classifier: classifier.as_ref(),
        fallback_classifier: fallback.as_deref(),
        cancelled: &services.cancelled,
    };
    discovery::run(&deps, config).await
}

async fn run_extraction(
    config: &EngineConfig,
    services: &Services,
) -> Result<ExtractionRunReport> {
    let fetcher: Box<dyn PageFetcher> = Box::new(HeadlessFetcher::new());
    let pacer = HostPacer::new(config.pacing.clone());
    let cache = UrlCache::new();
    let deps = ExtractionDeps {
        store: &services.store,
        fetcher: fetcher.as_ref(),
        pacer: &pacer,
        cache: &cache,
        cancelled: &services.cancelled,
    };
    extraction::run(&deps, config).await
}

/// The long-lived mode: one pipeline pass, then serve the API until
/// interrupted. Cancellation drains workers for the grace period.
async fn run_engine(config: &EngineConfig, services: &Services) -> Result<()> {
    info!("platescout engine starting");

    let cancelled = services.cancelled.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, draining");
            cancelled.store(true, Ordering::Relaxed);
            tokio::time::sleep(SHUTDOWN_GRACE).await;
            warn!("grace period over, terminating");
            std::process::exit(1);
        }
    });

    if config.discovery.enabled {
        let report = run_discovery(config, services).await?;
        print_discovery_summary(&report);
        finish_run(config, services, "discovery", serde_json::to_value(&report)?).await;
    }
    if config.extraction.enabled && !services.cancelled.load(Ordering::Relaxed) {
        let report = run_extraction(config, services).await?;
        print_extraction_summary(&report);
        finish_run(config, services, "extraction", serde_json::to_value(&report)?).await;
    }
    if !services.cancelled.load(Ordering::Relaxed) {
        let verifier = AutoVerifier::new(&services.store);
        let (verified, rejected, needs_review) = verifier.sweep(config.discovery.dry_run)?;
        info!(verified, rejected, needs_review, "auto-verify sweep done");
    }

    let state = ApiState::new(
        services.store.clone(),
        config.api.nearby_cache_entries,
        Duration::from_secs(config.api.nearby_cache_ttl_secs),
    );
    let app = api::router(state);
    let addr = format!("0.0.0.0:{}", config.api.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(addr, "locator API listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await
    .context("server error")?;
    Ok(())
}

fn print_discovery_summary(report: &DiscoveryRunReport) {
    println!("discovery run:");
    println!(
        "  queries   {} executed / {} successful / {} classified (planned {})",
        report.queries_executed,
        report.queries_successful,
        report.queries_classified,
        report.queries_planned
    );
    for (tier, executed) in &report.per_tier_executed {
        println!("    {tier:<18} {executed}");
    }
    println!(
        "  venues    {} new / {} merged / {} duplicates skipped",
        report.venues_discovered, report.venues_merged, report.duplicates_skipped
    );
    println!(
        "  chains    {} detected, credentials exhausted: {}",
        report.chains_detected, report.credentials_exhausted
    );
    if report.backpressure {
        println!("  backpressure: credential pool exhausted, budget surrendered");
    }
    for error in &report.errors {
        println!("  error [{}]: {}", error.phase, error.message);
    }
}

fn print_extraction_summary(report: &ExtractionRunReport) {
    println!("extraction run:");
    println!(
        "  venues    {} selected / {} processed / {} failed",
        report.venues_selected, report.venues_processed, report.venues_failed
    );
    println!(
        "  pages     {} fetched ({} from cache)",
        report.pages_fetched, report.pages_from_cache
    );
    println!(
        "  dishes    {} found / {} new",
        report.dishes_found, report.dishes_new
    );
    for (platform, ok, failed) in &report.per_platform {
        println!("    {platform:<12} ok {ok} / failed {failed}");
    }
    for error in &report.errors {
        println!("  error [{}]: {}", error.venue_id, error.message);
    }
}

/// Post-run bookkeeping: last-run summary into system metadata, then the
/// optional webhook notification.
async fn finish_run(
    config: &EngineConfig,
    services: &Services,
    run_kind: &str,
    report: serde_json::Value,
) {
    if let Err(e) = services
        .store
        .set_metadata(&format!("last_run:{run_kind}"), &report.to_string())
    {
        warn!(error = %e, "failed to record last-run summary");
    }
    notify(config, &services.http_client, run_kind, &report).await;
}

/// Fire-and-forget run notification. Failures are logged, never fatal.
async fn notify(
    config: &EngineConfig,
    client: &reqwest::Client,
    run_kind: &str,
    report: &serde_json::Value,
) {
    let Some(url) = &config.webhook_url else {
        return;
    };
    let payload = serde_json::json!({
        "engine": "platescout",
        "run": run_kind,
        "report": report,
    });
    match client.post(url).json(&payload).send().await {
        Ok(response) if response.status().is_success() => {}
        Ok(response) => warn!(status = %response.status(), "webhook rejected notification"),
        Err(e) => warn!(error = %e, "webhook notification failed"),
    }
}
