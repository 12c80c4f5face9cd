//! Fetch pacing and request ceilings.
//!
//! Platform pages are fetched at a crawl: jittered per-host delays,
//! per-minute/hour/day ceilings with a 24 h cooldown when the daily one is
//! hit, and a process-wide daily circuit breaker. A small per-URL cache
//! avoids refetching a page inside its TTL.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, warn};

use crate::config::PacingConfig;
use crate::error::{EngineError, EngineResult};

const HOST_COOLDOWN: Duration = Duration::from_secs(24 * 3600);
const URL_CACHE_TTL: Duration = Duration::from_secs(24 * 3600);
const URL_CACHE_ENTRIES: usize = 256;

struct HostState {
    last_request: Option<Instant>,
    requests: VecDeque<Instant>,
    cooldown_until: Option<Instant>,
}

impl HostState {
    fn new() -> Self {
        Self {
            last_request: None,
            requests: VecDeque::new(),
            cooldown_until: None,
        }
    }
}

/// Decides when the next request to a host may go out.
pub struct HostPacer {
    config: PacingConfig,
    hosts: Mutex<HashMap<String, HostState>>,
    global: Mutex<VecDeque<Instant>>,
}

impl HostPacer {
    pub fn new(config: PacingConfig) -> Self {
        Self {
            config,
            hosts: Mutex::new(HashMap::new()),
            global: Mutex::new(VecDeque::new()),
        }
    }

    /// Wait until a request to `host` is allowed, then record it. Returns
    /// `Quota` when the host is cooling down or a ceiling is exhausted.
    pub async fn acquire(&self, host: &str) -> EngineResult<()> {
        let wait = self.check_and_delay(host)?;
        if !wait.is_zero() {
            debug!(host, wait_ms = wait.as_millis() as u64, "pacing sleep");
            tokio::time::sleep(wait).await;
        }
        self.record(host)
    }

    /// Compute the jittered delay owed to this host, failing fast on
    /// ceilings. Split from `record` so the sleep happens without locks.
    fn check_and_delay(&self, host: &str) -> EngineResult<Duration> {
        let now = Instant::now();

        {
            let mut global = self.global.lock();
            prune(&mut global, now, Duration::from_secs(24 * 3600));
            if global.len() as u32 >= self.config.global_daily_cap {
                return Err(EngineError::Quota(
                    "global daily request cap reached".to_string(),
                ));
            }
        }

        let mut hosts = self.hosts.lock();
        let state = hosts
            .entry(host.to_string())
            .or_insert_with(HostState::new);

        if let Some(until) = state.cooldown_until {
            if now < until {
                return Err(EngineError::Quota(format!("host {host} cooling down")));
            }
            state.cooldown_until = None;
            state.requests.clear();
        }

        let minute = count_within(&state.requests, now, Duration::from_secs(60));
        let hour = count_within(&state.requests, now, Duration::from_secs(3600));
        let day = count_within(&state.requests, now, Duration::from_secs(24 * 3600));
        if day as u32 >= self.config.max_requests_per_day {
            warn!(host, "daily ceiling hit, 24h cooldown");
            state.cooldown_until = Some(now + HOST_COOLDOWN);
            return Err(EngineError::Quota(format!("host {host} daily ceiling")));
        }
        if hour as u32 >= self.config.max_requests_per_hour {
            return Err(EngineError::Quota(format!("host {host} hourly ceiling")));
        }
        if minute as u32 >= self.config.max_requests_per_minute {
            return Err(EngineError::Quota(format!("host {host} minute ceiling")));
        }

        let jittered = Duration::from_millis(
            rand::thread_rng().gen_range(self.config.min_delay_ms..=self.config.max_delay_ms),
        );
        let wait = match state.last_request {
            Some(last) => jittered.saturating_sub(now.duration_since(last)),
            None => Duration::ZERO,
        };
        Ok(wait)
    }

    fn record(&self, host: &str) -> EngineResult<()> {
        let now = Instant::now();
        {
            let mut global = self.global.lock();
            global.push_back(now);
        }
        let mut hosts = self.hosts.lock();
        let state = hosts
            .entry(host.to_string())
            .or_insert_with(HostState::new);
        state.last_request = Some(now);
        state.requests.push_back(now);
        prune(&mut state.requests, now, Duration::from_secs(24 * 3600));
        Ok(())
    }
}

fn prune(window: &mut VecDeque<Instant>, now: Instant, horizon: Duration) {
    while window
        .front()
        .is_some_and(|t| now.duration_since(*t) > horizon)
    {
        window.pop_front();
    }
}

fn count_within(window: &VecDeque<Instant>, now: Instant, horizon: Duration) -> usize {
    window
        .iter()
        .filter(|t| now.duration_since(**t) <= horizon)
        .count()
}

/// Bounded per-URL page cache with a 24 h TTL.
pub struct UrlCache {
    entries: Mutex<HashMap<String, (Instant, String)>>,
}

impl UrlCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, url: &str) -> Option<String> {
        let entries = self.entries.lock();
        entries.get(url).and_then(|(at, html)| {
            (at.elapsed() < URL_CACHE_TTL).then(|| html.clone())
        })
    }

    pub fn put(&self, url: &str, html: String) {
        let mut entries = self.entries.lock();
        if entries.len() >= URL_CACHE_ENTRIES {
            entries.retain(|_, (at, _)| at.elapsed() < URL_CACHE_TTL);
            if entries.len() >= URL_CACHE_ENTRIES {
                // Still full of fresh entries: drop the oldest.
                if let Some(oldest) = entries
                    .iter()
                    .min_by_key(|(_, (at, _))| *at)
                    .map(|(k, _)| k.clone())
                {
                    entries.remove(&oldest);
                }
            }
        }
        entries.insert(url.to_string(), (Instant::now(), html));
    }
}

impl Default for UrlCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> PacingConfig {
        PacingConfig {
            min_delay_ms: 0,
            max_delay_ms: 0,
            batch_size: 5,
            batch_delay_ms: 0,
            max_requests_per_minute: 3,
            max_requests_per_hour: 5,
            max_requests_per_day: 6,
            global_daily_cap: 100,
            fetch_timeout_secs: 1,
            concurrency: 2,
        }
    }

    #[tokio::test]
    async fn minute_ceiling_enforced() {
        let pacer = HostPacer::new(fast_config());
        for _ in 0..3 {
            pacer.acquire("wolt.com").await.unwrap();
        }
        let err = pacer.acquire("wolt.com").await.unwrap_err();
        assert!(matches!(err, EngineError::Quota(_)));

        // Other hosts are unaffected.
        pacer.acquire("ubereats.com").await.unwrap();
    }

    #[tokio::test]
    async fn daily_ceiling_triggers_cooldown() {
        let mut config = fast_config();
        config.max_requests_per_minute = 100;
        config.max_requests_per_hour = 100;
        config.max_requests_per_day = 2;
        let pacer = HostPacer::new(config);
        pacer.acquire("wolt.com").await.unwrap();
        pacer.acquire("wolt.com").await.unwrap();
        assert!(pacer.acquire("wolt.com").await.is_err());
        // Cooled down: still refused.
        assert!(pacer.acquire("wolt.com").await.is_err());
    }

    #[tokio::test]
    async fn global_circuit_breaker() {
        let mut config = fast_config();
        config.max_requests_per_minute = 100;
        config.max_requests_per_hour = 100;
        config.max_requests_per_day = 100;
        config.global_daily_cap = 2;
        let pacer = HostPacer::new(config);
        pacer.acquire("a.com").await.unwrap();
        pacer.acquire("b.com").await.unwrap();
        let err = pacer.acquire("c.com").await.unwrap_err();
        assert!(matches!(err, EngineError::Quota(_)));
    }

    #[test]
    fn url_cache_round_trip() {
        let cache = UrlCache::new();
        assert!(cache.get("https://wolt.com/x").is_none());
        cache.put("https://wolt.com/x", "<html>".to_string());
        assert_eq!(cache.get("https://wolt.com/x").unwrap(), "<html>");
    }
}
