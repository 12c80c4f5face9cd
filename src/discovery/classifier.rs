//! AI-assisted candidate classification.
//!
//! Raw search hits go in, venue candidates with confidence and factor
//! lists come out. Two providers implement the same contract (a primary
//! messages-style API and a fallback chat-completions API) plus a
//! deterministic mock. Both real providers ask for a strict JSON array and
//! parse it out of the completion text.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};
use crate::models::{DeliveryPlatformLink, Platform};

use super::search::RawSearchHit;

const CLASSIFY_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_COMPLETION_TOKENS: u32 = 2048;

/// Context handed to the classifier alongside the raw hits.
#[derive(Debug, Clone, Default)]
pub struct ClassifyContext {
    pub query: String,
    pub country: String,
    pub city: Option<String>,
    /// Set in enumeration mode: candidates must fuzzy-match this chain.
    pub chain_name: Option<String>,
}

/// A candidate venue as the classifier sees it.
#[derive(Debug, Clone)]
pub struct ClassifiedCandidate {
    pub name: String,
    pub street: Option<String>,
    pub city: String,
    pub postal_code: Option<String>,
    pub country: String,
    pub platform_links: Vec<DeliveryPlatformLink>,
    pub confidence: f64,
    pub positive_factors: Vec<String>,
    pub negative_factors: Vec<String>,
    pub chain_guess: Option<String>,
}

#[async_trait]
pub trait CandidateClassifier: Send + Sync {
    fn name(&self) -> &'static str;

    async fn classify(
        &self,
        hits: &[RawSearchHit],
        ctx: &ClassifyContext,
    ) -> EngineResult<Vec<ClassifiedCandidate>>;
}

// ── wire shape shared by both AI providers ──────────────────────────

#[derive(Debug, Deserialize)]
struct CandidatePayload {
    name: String,
    #[serde(default)]
    street: Option<String>,
    #[serde(default)]
    city: Option<String>,
    #[serde(default)]
    postal_code: Option<String>,
    #[serde(default)]
    country: Option<String>,
    #[serde(default)]
    urls: Vec<String>,
    confidence: f64,
    #[serde(default)]
    positive_factors: Vec<String>,
    #[serde(default)]
    negative_factors: Vec<String>,
    #[serde(default)]
    chain: Option<String>,
}

fn build_prompt(hits: &[RawSearchHit], ctx: &ClassifyContext) -> String {
    let mut prompt = String::from(
        "You are classifying web search results for food-delivery venues that \
         sell planted brand products. Return ONLY a JSON array. Each element: \
         {\"name\", \"street\", \"city\", \"postal_code\", \"country\", \
         \"urls\": [..], \"confidence\": 0-100, \"positive_factors\": [..], \
         \"negative_factors\": [..], \"chain\": null|string}. \
         Skip results that are not individual venue pages on a delivery platform.\n",
    );
    if let Some(chain) = &ctx.chain_name {
        prompt.push_str(&format!(
            "Only include venues belonging to the chain \"{chain}\"; drop everything else.\n"
        ));
    }
    prompt.push_str(&format!(
        "Search query: {}\nCountry: {}\n",
        ctx.query, ctx.country
    ));
    if let Some(city) = &ctx.city {
        prompt.push_str(&format!("Expected city: {city}\n"));
    }
    prompt.push_str("Results:\n");
    for (i, hit) in hits.iter().enumerate() {
        prompt.push_str(&format!(
            "{}. title: {}\n   url: {}\n   snippet: {}\n",
            i + 1,
            hit.title,
            hit.url,
            hit.snippet
        ));
    }
    prompt
}

/// Pull the JSON array out of a completion, tolerating code fences and
/// prose around it.
fn parse_completion(content: &str, ctx: &ClassifyContext) -> EngineResult<Vec<ClassifiedCandidate>> {
    let start = content.find('[');
    let end = content.rfind(']');
    let (Some(start), Some(end)) = (start, end) else {
        return Err(EngineError::Content(
            "classifier returned no JSON array".to_string(),
        ));
    };
    let payloads: Vec<CandidatePayload> = serde_json::from_str(&content[start..=end])
        .map_err(|e| EngineError::Content(format!("classifier JSON: {e}")))?;

    let mut candidates = Vec::new();
    for payload in payloads {
        let links: Vec<DeliveryPlatformLink> = payload
            .urls
            .iter()
            .filter_map(|url| {
                platform_for_url(url).map(|platform| DeliveryPlatformLink {
                    platform,
                    url: url.clone(),
                    active: None,
                })
            })
            .collect();
        if links.is_empty() {
            continue;
        }
        let candidate = ClassifiedCandidate {
            name: payload.name,
            street: payload.street,
            city: payload
                .city
                .or_else(|| ctx.city.clone())
                .unwrap_or_default(),
            postal_code: payload.postal_code,
            country: payload.country.unwrap_or_else(|| ctx.country.clone()),
            platform_links: links,
            confidence: payload.confidence.clamp(0.0, 100.0),
            positive_factors: payload.positive_factors,
            negative_factors: payload.negative_factors,
            chain_guess: payload.chain,
        };
        candidates.push(candidate);
    }

    // Enumeration mode: the chain filter is hard, whatever the model says.
    if let Some(chain) = &ctx.chain_name {
        candidates.retain(|c| fuzzy_chain_match(&c.name, chain));
    }
    Ok(candidates)
}

/// Derive the platform from a URL host, or drop the link.
pub fn platform_for_url(url: &str) -> Option<Platform> {
    let host = url::Url::parse(url).ok()?.host_str()?.to_ascii_lowercase();
    if host.contains("ubereats") || host.contains("uber.com") {
        Some(Platform::UberEats)
    } else if host.contains("wolt.com") {
        Some(Platform::Wolt)
    } else if host.contains("lieferando") {
        Some(Platform::Lieferando)
    } else if host.contains("just-eat") || host.contains("justeat") {
        Some(Platform::JustEat)
    } else if host.contains("deliveroo") {
        Some(Platform::Deliveroo)
    } else if host.contains("smood") {
        Some(Platform::Smood)
    } else if host.contains("eat.ch") {
        Some(Platform::EatCh)
    } else {
        None
    }
}

/// Token-overlap fuzzy match for chain enumeration: every significant
/// token of the chain name must appear in the candidate name.
pub fn fuzzy_chain_match(candidate_name: &str, chain_name: &str) -> bool {
    let normalize = |s: &str| -> Vec<String> {
        s.to_lowercase()
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { ' ' })
            .collect::<String>()
            .split_whitespace()
            .filter(|t| t.len() > 2)
            .map(|t| t.to_string())
            .collect()
    };
    let candidate_tokens = normalize(candidate_name);
    let chain_tokens = normalize(chain_name);
    if chain_tokens.is_empty() {
        return false;
    }
    chain_tokens
        .iter()
        .all(|t| candidate_tokens.iter().any(|c| c == t || c.starts_with(t.as_str())))
}

// ── primary provider (messages-style API) ───────────────────────────

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<MessagesContent>,
}

#[derive(Debug, Deserialize)]
struct MessagesContent {
    #[serde(default)]
    text: String,
}

pub struct PrimaryClassifier {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl PrimaryClassifier {
    pub fn new(client: reqwest::Client, api_key: String) -> Self {
        Self {
            client,
            api_key,
            model: "claude-3-5-haiku-latest".to_string(),
            base_url: "https://api.anthropic.com/v1/messages".to_string(),
        }
    }
}

#[async_trait]
impl CandidateClassifier for PrimaryClassifier {
    fn name(&self) -> &'static str {
        "primary"
    }

    async fn classify(
        &self,
        hits: &[RawSearchHit],
        ctx: &ClassifyContext,
    ) -> EngineResult<Vec<ClassifiedCandidate>> {
        if hits.is_empty() {
            return Ok(Vec::new());
        }
        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": MAX_COMPLETION_TOKENS,
            "messages": [{"role": "user", "content": build_prompt(hits, ctx)}],
        });
        let response = self
            .client
            .post(&self.base_url)
            .timeout(CLASSIFY_TIMEOUT)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .map_err(EngineError::from)?;

        let status = response.status().as_u16();
        if status != 200 {
            return Err(EngineError::from_status(status, "classifier primary"));
        }
        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|e| EngineError::Content(format!("classifier primary: {e}")))?;
        let content = parsed
            .content
            .first()
            .map(|c| c.text.clone())
            .unwrap_or_default();
        debug!(chars = content.len(), "primary classifier responded");
        parse_completion(&content, ctx)
    }
}

// ── fallback provider (chat-completions API) ────────────────────────

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Option<ChatMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: String,
}

pub struct FallbackClassifier {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl FallbackClassifier {
    pub fn new(client: reqwest::Client, api_key: String) -> Self {
        Self {
            client,
            api_key,
            model: "gpt-4o-mini".to_string(),
            base_url: "https://api.openai.com/v1/chat/completions".to_string(),
        }
    }
}

#[async_trait]
impl CandidateClassifier for FallbackClassifier {
    fn name(&self) -> &'static str {
        "fallback"
    }

    async fn classify(
        &self,
        hits: &[RawSearchHit],
        ctx: &ClassifyContext,
    ) -> EngineResult<Vec<ClassifiedCandidate>> {
        if hits.is_empty() {
            return Ok(Vec::new());
        }
        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": MAX_COMPLETION_TOKENS,
            "messages": [
                {"role": "system", "content": "Respond with a JSON array only."},
                {"role": "user", "content": build_prompt(hits, ctx)},
            ],
        });
        let response = self
            .client
            .post(&self.base_url)
            .timeout(CLASSIFY_TIMEOUT)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(EngineError::from)?;

        let status = response.status().as_u16();
        if status != 200 {
            return Err(EngineError::from_status(status, "classifier fallback"));
        }
        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| EngineError::Content(format!("classifier fallback: {e}")))?;
        let content = parsed
            .choices
            .first()
            .and_then(|c| c.message.as_ref())
            .map(|m| m.content.clone())
            .unwrap_or_default();
        parse_completion(&content, ctx)
    }
}

// ── mock ────────────────────────────────────────────────────────────

/// Deterministic classifier: one candidate per hit whose URL maps to a
/// known platform, at a fixed confidence.
pub struct MockClassifier {
    pub confidence: f64,
    /// When set, every call fails, for exercising the skip path.
    pub fail: bool,
}

impl MockClassifier {
    pub fn new(confidence: f64) -> Self {
        Self {
            confidence,
            fail: false,
        }
    }
}

#[async_trait]
impl CandidateClassifier for MockClassifier {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn classify(
        &self,
        hits: &[RawSearchHit],
        ctx: &ClassifyContext,
    ) -> EngineResult<Vec<ClassifiedCandidate>> {
        if self.fail {
            return Err(EngineError::transport("mock classifier failure"));
        }
        let mut candidates: Vec<ClassifiedCandidate> = hits
            .iter()
            .filter_map(|hit| {
                let platform = platform_for_url(&hit.url)?;
                Some(ClassifiedCandidate {
                    name: hit.title.clone(),
                    street: None,
                    city: ctx.city.clone().unwrap_or_else(|| "Zurich".to_string()),
                    postal_code: None,
                    country: ctx.country.clone(),
                    platform_links: vec![DeliveryPlatformLink {
                        platform,
                        url: hit.url.clone(),
                        active: None,
                    }],
                    confidence: self.confidence,
                    positive_factors: vec!["mock".to_string()],
                    negative_factors: Vec::new(),
                    chain_guess: ctx.chain_name.clone(),
                })
            })
            .collect();
        if let Some(chain) = &ctx.chain_name {
            candidates.retain(|c| fuzzy_chain_match(&c.name, chain));
        }
        Ok(candidates)
    }
}

/// Run the primary classifier with one retry, then the fallback. A `None`
/// return means the query should be recorded `executed` but
/// `not_classified`.
pub async fn classify_with_retry(
    primary: &dyn CandidateClassifier,
    fallback: Option<&dyn CandidateClassifier>,
    hits: &[RawSearchHit],
    ctx: &ClassifyContext,
) -> Option<Vec<ClassifiedCandidate>> {
    for attempt in 0..2 {
        match primary.classify(hits, ctx).await {
            Ok(candidates) => return Some(candidates),
            Err(e) => {
                warn!(
                    provider = primary.name(),
                    attempt = attempt + 1,
                    error = %e,
                    "classifier failed"
                );
            }
        }
    }
    if let Some(fallback) = fallback {
        match fallback.classify(hits, ctx).await {
            Ok(candidates) => return Some(candidates),
            Err(e) => warn!(provider = fallback.name(), error = %e, "fallback classifier failed"),
        }
    }
    None
}
