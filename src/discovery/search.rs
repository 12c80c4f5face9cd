//! Search execution against external web-search providers.
//!
//! One trait, three implementations: a primary JSON search API, a fallback
//! with a different wire shape, and a deterministic mock for tests and dry
//! runs. Transport failures retry with exponential backoff inside a hard
//! 30-second ceiling per query; 4xx is terminal; 429 additionally marks
//! the leased credential quota-exhausted via the error taxonomy.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::credentials::LeasedCredential;
use crate::error::{backoff_delay, EngineError, EngineResult};

const SEARCH_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_ATTEMPTS: u32 = 3;

/// A raw hit as returned by the search engine, before classification.
#[derive(Debug, Clone)]
pub struct RawSearchHit {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

#[async_trait]
pub trait SearchProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn search(
        &self,
        query: &str,
        credential: &LeasedCredential,
    ) -> EngineResult<Vec<RawSearchHit>>;
}

// ── primary ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct PrimaryResponse {
    #[serde(default)]
    items: Vec<PrimaryItem>,
}

#[derive(Debug, Deserialize)]
struct PrimaryItem {
    title: String,
    link: String,
    #[serde(default)]
    snippet: String,
}

/// Custom-search-shaped JSON API: key + engine id as query parameters.
pub struct PrimarySearchProvider {
    client: reqwest::Client,
    base_url: String,
}

impl PrimarySearchProvider {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            base_url: "https://www.googleapis.com/customsearch/v1".to_string(),
        }
    }
}

#[async_trait]
impl SearchProvider for PrimarySearchProvider {
    fn name(&self) -> &'static str {
        "primary"
    }

    async fn search(
        &self,
        query: &str,
        credential: &LeasedCredential,
    ) -> EngineResult<Vec<RawSearchHit>> {
        let request = self
            .client
            .get(&self.base_url)
            .query(&[
                ("key", credential.api_key.as_str()),
                ("cx", credential.engine_id.as_str()),
                ("q", query),
                ("num", "10"),
            ])
            .build()
            .map_err(|e| EngineError::transport(e.to_string()))?;

        let response: PrimaryResponse =
            execute_with_retry(&self.client, request, self.name()).await?;
        Ok(response
            .items
            .into_iter()
            .map(|item| RawSearchHit {
                title: item.title,
                url: item.link,
                snippet: item.snippet,
            })
            .collect())
    }
}

// ── fallback ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct FallbackResponse {
    #[serde(rename = "webPages", default)]
    web_pages: Option<FallbackPages>,
}

#[derive(Debug, Deserialize)]
struct FallbackPages {
    #[serde(default)]
    value: Vec<FallbackItem>,
}

#[derive(Debug, Deserialize)]
struct FallbackItem {
    name: String,
    url: String,
    #[serde(default)]
    snippet: String,
}

/// Fallback provider with a subscription-key header and a nested result
/// shape. Same contract, different wire format.
pub struct FallbackSearchProvider {
    client: reqwest::Client,
    base_url: String,
}

impl FallbackSearchProvider {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            base_url: "https://api.bing.microsoft.com/v7.0/search".to_string(),
        }
    }
}

#[async_trait]
impl SearchProvider for FallbackSearchProvider {
    fn name(&self) -> &'static str {
        "fallback"
    }

    async fn search(
        &self,
        query: &str,
        credential: &LeasedCredential,
    ) -> EngineResult<Vec<RawSearchHit>> {
        let request = self
            .client
            .get(&self.base_url)
            .header("Ocp-Apim-Subscription-Key", &credential.api_key)
            .query(&[("q", query), ("count", "10")])
            .build()
            .map_err(|e| EngineError::transport(e.to_string()))?;

        let response: FallbackResponse =
            execute_with_retry(&self.client, request, self.name()).await?;
        Ok(response
            .web_pages
            .map(|pages| pages.value)
            .unwrap_or_default()
            .into_iter()
            .map(|item| RawSearchHit {
                title: item.name,
                url: item.url,
                snippet: item.snippet,
            })
            .collect())
    }
}

// ── mock ────────────────────────────────────────────────────────────

/// Deterministic provider for tests and dry runs: every query yields the
/// configured number of synthetic delivery-platform hits.
pub struct MockSearchProvider {
    pub hits_per_query: usize,
}

impl MockSearchProvider {
    pub fn new(hits_per_query: usize) -> Self {
        Self { hits_per_query }
    }
}

#[async_trait]
impl SearchProvider for MockSearchProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn search(
        &self,
        query: &str,
        _credential: &LeasedCredential,
    ) -> EngineResult<Vec<RawSearchHit>> {
        let slug: String = query
            .chars()
            .map(|c| if c.is_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
            .collect();
        Ok((0..self.hits_per_query)
            .map(|i| RawSearchHit {
                title: format!("Mock venue {i} for {query}"),
                url: format!("https://wolt.com/en/mock/{slug}-{i}"),
                snippet: format!("Menu with planted.chicken, result {i}"),
            })
            .collect())
    }
}

// ── shared retry loop ───────────────────────────────────────────────

/// Send a request with the discovery retry discipline: hard timeout,
/// backoff on transport failures, terminal on 4xx, `Quota` on 429.
async fn execute_with_retry<T: serde::de::DeserializeOwned>(
    client: &reqwest::Client,
    request: reqwest::Request,
    provider: &str,
) -> EngineResult<T> {
    let mut last_error = EngineError::transport("no attempt made");

    for attempt in 0..MAX_ATTEMPTS {
        let Some(request) = request.try_clone() else {
            return Err(EngineError::transport("request not cloneable"));
        };

        match timeout(SEARCH_TIMEOUT, client.execute(request)).await {
            Ok(Ok(response)) => {
                let status = response.status().as_u16();
                if response.status().is_success() {
                    let body = response
                        .text()
                        .await
                        .map_err(|e| EngineError::transport(e.to_string()))?;
                    return serde_json::from_str(&body).map_err(|e| EngineError::Protocol {
                        message: format!("{provider}: parse: {e}"),
                        status: Some(status),
                    });
                }
                let error = EngineError::from_status(status, provider);
                if !error.is_retryable() {
                    // 4xx (including 429 → Quota) is terminal for this query.
                    return Err(error);
                }
                warn!(provider, status, attempt = attempt + 1, "search retryable failure");
                last_error = error;
            }
            Ok(Err(e)) => {
                warn!(provider, attempt = attempt + 1, error = %e, "search request failed");
                last_error = EngineError::transport(e.to_string());
            }
            Err(_) => {
                warn!(provider, attempt = attempt + 1, "search request timed out");
                last_error = EngineError::transport("timeout");
            }
        }

        if attempt + 1 < MAX_ATTEMPTS {
            let delay = backoff_delay(attempt);
            debug!(provider, delay_ms = delay.as_millis() as u64, "backing off");
            sleep(delay).await;
        }
    }

    Err(last_error)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease() -> LeasedCredential {
        LeasedCredential {
            id: "c1".into(),
            api_key: "key".into(),
            engine_id: "engine".into(),
        }
    }

    #[tokio::test]
    async fn mock_provider_is_deterministic() {
        let provider = MockSearchProvider::new(2);
        let a = provider.search("planted Zurich", &lease()).await.unwrap();
        let b = provider.search("planted Zurich", &lease()).await.unwrap();
        assert_eq!(a.len(), 2);
        assert_eq!(a[0].url, b[0].url);
        assert!(a[0].url.starts_with("https://wolt.com/"));
    }

    #[tokio::test]
    async fn mock_provider_distinct_urls_per_query() {
        let provider = MockSearchProvider::new(1);
        let a = provider.search("planted Zurich", &lease()).await.unwrap();
        let b = provider.search("planted Basel", &lease()).await.unwrap();
        assert_ne!(a[0].url, b[0].url);
    }
}
