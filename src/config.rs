//! Engine configuration.
//!
//! A JSON config file selects what a run does; environment variables carry
//! secrets (search/AI credentials, database location, webhook URL) and
//! override file values. Relative paths resolve against the repository
//! root so invoking from a subdirectory never creates a second database.

use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::models::Platform;

/// Search provider selection for discovery runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchProviderKind {
    Primary,
    Fallback,
    Mock,
}

impl Default for SearchProviderKind {
    fn default() -> Self {
        SearchProviderKind::Primary
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryMode {
    Explore,
    Enumerate,
    Verify,
}

impl Default for DiscoveryMode {
    fn default() -> Self {
        DiscoveryMode::Explore
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMode {
    Enrich,
    Refresh,
    Verify,
}

impl Default for ExtractionMode {
    fn default() -> Self {
        ExtractionMode::Enrich
    }
}

/// Target selector keyword from the config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    All,
    Chain,
    Venues,
}

impl Default for TargetKind {
    fn default() -> Self {
        TargetKind::All
    }
}

/// Which venues an extraction run targets, resolved from the config's
/// `target` / `chainId` / `venueIds` options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractionTarget {
    /// All venues pending extraction.
    All,
    /// Every venue of one chain.
    Chain { chain_id: String },
    /// An explicit id list.
    Venues { venue_ids: Vec<String> },
}

fn default_max_queries() -> u32 {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DiscoveryConfig {
    pub enabled: bool,
    pub mode: DiscoveryMode,
    pub platforms: Vec<Platform>,
    pub countries: Vec<String>,
    /// Explicit chain names for enumerate mode.
    pub chains: Vec<String>,
    pub max_queries: u32,
    pub search_provider: SearchProviderKind,
    pub dry_run: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: DiscoveryMode::Explore,
            platforms: vec![Platform::UberEats, Platform::Wolt, Platform::Lieferando],
            countries: vec!["CH".to_string(), "DE".to_string(), "AT".to_string()],
            chains: Vec::new(),
            max_queries: default_max_queries(),
            search_provider: SearchProviderKind::Primary,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExtractionConfig {
    pub enabled: bool,
    pub mode: ExtractionMode,
    pub target: TargetKind,
    pub chain_id: Option<String>,
    pub venue_ids: Vec<String>,
    pub platforms: Vec<Platform>,
    pub countries: Vec<String>,
    pub max_venues: u32,
    /// Persist a learning record when the run completes.
    pub learn: bool,
    pub dry_run: bool,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: ExtractionMode::Enrich,
            target: TargetKind::All,
            chain_id: None,
            venue_ids: Vec::new(),
            platforms: Platform::ALL.to_vec(),
            countries: Vec::new(),
            max_venues: 20,
            learn: true,
            dry_run: false,
        }
    }
}

impl ExtractionConfig {
    /// Resolve the target keyword plus its selectors into one value.
    pub fn resolved_target(&self) -> Result<ExtractionTarget> {
        match self.target {
            TargetKind::All => Ok(ExtractionTarget::All),
            TargetKind::Chain => {
                let chain_id = self
                    .chain_id
                    .clone()
                    .context("target 'chain' requires chainId")?;
                Ok(ExtractionTarget::Chain { chain_id })
            }
            TargetKind::Venues => {
                if self.venue_ids.is_empty() {
                    anyhow::bail!("target 'venues' requires venueIds");
                }
                Ok(ExtractionTarget::Venues {
                    venue_ids: self.venue_ids.clone(),
                })
            }
        }
    }
}

/// Fetch pacing. Ultra-conservative defaults: a platform noticing us costs
/// far more than a slow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PacingConfig {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub batch_size: u32,
    pub batch_delay_ms: u64,
    pub max_requests_per_minute: u32,
    pub max_requests_per_hour: u32,
    pub max_requests_per_day: u32,
    /// Process-wide external-request circuit breaker.
    pub global_daily_cap: u32,
    pub fetch_timeout_secs: u64,
    pub concurrency: usize,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 30_000,
            max_delay_ms: 60_000,
            batch_size: 5,
            batch_delay_ms: 300_000,
            max_requests_per_minute: 2,
            max_requests_per_hour: 40,
            max_requests_per_day: 150,
            global_daily_cap: 200,
            fetch_timeout_secs: 30,
            concurrency: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ApiConfig {
    pub port: u16,
    pub nearby_cache_entries: usize,
    pub nearby_cache_ttl_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            nearby_cache_entries: 100,
            nearby_cache_ttl_secs: 60,
        }
    }
}

/// Full engine configuration: file sections plus env-sourced secrets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    pub discovery: DiscoveryConfig,
    pub extraction: ExtractionConfig,
    pub pacing: PacingConfig,
    pub api: ApiConfig,
    /// Target city universe per country, used by planner tiers 3 and 4.
    pub cities: BTreeMap<String, Vec<String>>,
    pub database_path: String,

    // Env-sourced; never serialized back out.
    #[serde(skip)]
    pub search_credentials: Vec<CredentialSpec>,
    #[serde(skip)]
    pub ai_primary_key: Option<String>,
    #[serde(skip)]
    pub ai_fallback_key: Option<String>,
    #[serde(skip)]
    pub proxy_api_key: Option<String>,
    #[serde(skip)]
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CredentialSpec {
    pub id: String,
    pub api_key: String,
    pub engine_id: String,
    pub daily_quota: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let mut cities = BTreeMap::new();
        cities.insert(
            "CH".to_string(),
            ["Zurich", "Geneva", "Basel", "Bern", "Lausanne", "Winterthur", "Lucerne", "St. Gallen"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        );
        cities.insert(
            "DE".to_string(),
            ["Berlin", "Hamburg", "Munich", "Cologne", "Frankfurt", "Stuttgart", "Dusseldorf", "Leipzig"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        );
        cities.insert(
            "AT".to_string(),
            ["Vienna", "Graz", "Linz", "Salzburg", "Innsbruck"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        );
        Self {
            discovery: DiscoveryConfig::default(),
            extraction: ExtractionConfig::default(),
            pacing: PacingConfig::default(),
            api: ApiConfig::default(),
            cities,
            database_path: "platescout.db".to_string(),
            search_credentials: Vec::new(),
            ai_primary_key: None,
            ai_fallback_key: None,
            proxy_api_key: None,
            webhook_url: None,
        }
    }
}

impl EngineConfig {
    /// Load the JSON config file (when given), then apply env overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenv::dotenv().ok();

        let mut config = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p)
                    .with_context(|| format!("reading config file {}", p.display()))?;
                serde_json::from_str::<EngineConfig>(&raw)
                    .with_context(|| format!("parsing config file {}", p.display()))?
            }
            None => EngineConfig::default(),
        };

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(path) = env::var("DATABASE_PATH") {
            self.database_path = path;
        }
        self.database_path = resolve_data_path(&self.database_path);

        // SEARCH_CREDENTIALS="key1:engine1[:quota],key2:engine2", one
        // credential per comma-separated entry.
        if let Ok(raw) = env::var("SEARCH_CREDENTIALS") {
            self.search_credentials = raw
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .enumerate()
                .filter_map(|(i, entry)| {
                    let mut parts = entry.trim().split(':');
                    let api_key = parts.next()?.to_string();
                    let engine_id = parts.next()?.to_string();
                    let daily_quota = parts
                        .next()
                        .and_then(|q| q.parse().ok())
                        .unwrap_or(100);
                    Some(CredentialSpec {
                        id: format!("cred-{}", i + 1),
                        api_key,
                        engine_id,
                        daily_quota,
                    })
                })
                .collect();
        }

        self.ai_primary_key = env::var("AI_PRIMARY_API_KEY").ok().filter(|s| !s.is_empty());
        self.ai_fallback_key = env::var("AI_FALLBACK_API_KEY").ok().filter(|s| !s.is_empty());
        self.proxy_api_key = env::var("PROXY_API_KEY").ok().filter(|s| !s.is_empty());
        self.webhook_url = env::var("NOTIFY_WEBHOOK_URL").ok().filter(|s| !s.is_empty());
    }

    fn validate(&self) -> Result<()> {
        self.extraction.resolved_target().map(drop)?;
        if self.pacing.min_delay_ms > self.pacing.max_delay_ms {
            anyhow::bail!(
                "pacing: minDelayMs ({}) > maxDelayMs ({})",
                self.pacing.min_delay_ms,
                self.pacing.max_delay_ms
            );
        }
        if self.pacing.concurrency == 0 {
            anyhow::bail!("pacing: concurrency must be at least 1");
        }
        for country in self
            .discovery
            .countries
            .iter()
            .chain(self.extraction.countries.iter())
        {
            if country.len() != 2 || !country.chars().all(|c| c.is_ascii_uppercase()) {
                anyhow::bail!("country code '{country}' is not ISO alpha-2 uppercase");
            }
        }
        Ok(())
    }
}

/// Resolve a possibly-relative path against the repository root so running
/// from a subdirectory never lands in a different working directory.
pub fn resolve_data_path(path: &str) -> String {
    let p = PathBuf::from(path);
    if p.is_absolute() {
        return path.to_string();
    }
    let root = repo_root();
    root.join(p).to_string_lossy().into_owned()
}

fn repo_root() -> PathBuf {
    if let Ok(root) = env::var("REPO_ROOT") {
        return PathBuf::from(root);
    }
    let manifest = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    if manifest.exists() {
        manifest
    } else {
        env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pacing.batch_size, 5);
        assert_eq!(config.pacing.global_daily_cap, 200);
    }

    #[test]
    fn bad_country_code_rejected() {
        let mut config = EngineConfig::default();
        config.discovery.countries = vec!["Switzerland".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn inverted_delays_rejected() {
        let mut config = EngineConfig::default();
        config.pacing.min_delay_ms = 10_000;
        config.pacing.max_delay_ms = 5_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_file_round_trip() {
        let json = r#"{
            "discovery": {"mode": "enumerate", "maxQueries": 40, "chains": ["Hiltl"]},
            "extraction": {"target": "chain", "chainId": "ch-1", "maxVenues": 5},
            "databasePath": "/tmp/test.db"
        }"#;
        let config: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.discovery.mode, DiscoveryMode::Enumerate);
        assert_eq!(config.discovery.max_queries, 40);
        assert_eq!(
            config.extraction.resolved_target().unwrap(),
            ExtractionTarget::Chain { chain_id: "ch-1".to_string() }
        );
        // Untouched sections keep defaults.
        assert_eq!(config.pacing.batch_size, 5);
    }

    #[test]
    fn chain_target_without_id_rejected() {
        let mut config = EngineConfig::default();
        config.extraction.target = TargetKind::Chain;
        assert!(config.validate().is_err());
    }
}
