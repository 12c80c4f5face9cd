//! Page fetching.
//!
//! Venue pages render client-side, so the real fetcher drives a headless
//! browser configured to look like a person: rotated user agent,
//! per-country Accept-Language, automation fingerprints off, a normal
//! viewport, and an optional scroll to the bottom to trigger lazy menu
//! loading. An HTTP fetcher covers pages that serve useful HTML without a
//! browser, and tests inject a canned fetcher.

use std::ffi::OsStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use lazy_static::lazy_static;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::error::{backoff_delay, EngineError, EngineResult};

const MAX_FETCH_ATTEMPTS: u32 = 3;

lazy_static! {
    /// Rotated across fetches. Ordinary desktop browsers only.
    static ref USER_AGENTS: Vec<&'static str> = vec![
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
        "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    ];
}

static UA_COUNTER: AtomicUsize = AtomicUsize::new(0);

pub fn next_user_agent() -> &'static str {
    let index = UA_COUNTER.fetch_add(1, Ordering::Relaxed);
    USER_AGENTS[index % USER_AGENTS.len()]
}

pub fn accept_language_for(country: &str) -> &'static str {
    match country {
        "CH" => "de-CH,de;q=0.9,fr-CH;q=0.7,en;q=0.5",
        "DE" => "de-DE,de;q=0.9,en;q=0.5",
        "AT" => "de-AT,de;q=0.9,en;q=0.5",
        "FR" => "fr-FR,fr;q=0.9,en;q=0.5",
        "GB" => "en-GB,en;q=0.9",
        _ => "en-US,en;q=0.8",
    }
}

/// What one fetch needs to know.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,
    pub country: String,
    pub wait_selector: String,
    pub scroll_to_bottom: bool,
    pub viewport: (u32, u32),
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct PageData {
    pub url: String,
    pub html: String,
}

#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> EngineResult<PageData>;
}

/// Markers that mean the platform served a bot challenge instead of a
/// venue page. Terminal for this venue in headless mode.
pub fn looks_like_captcha(html: &str) -> bool {
    let lower = html.to_lowercase();
    ["captcha", "cf-challenge", "are you a robot", "press & hold"]
        .iter()
        .any(|marker| lower.contains(marker))
}

// ── headless browser ────────────────────────────────────────────────

pub struct HeadlessFetcher;

impl HeadlessFetcher {
    pub fn new() -> Self {
        Self
    }

    fn fetch_blocking(request: &FetchRequest) -> EngineResult<String> {
        use headless_chrome::{Browser, LaunchOptions};

        let options = LaunchOptions::default_builder()
            .headless(true)
            .sandbox(false)
            .window_size(Some(request.viewport))
            .args(vec![
                OsStr::new("--disable-blink-features=AutomationControlled"),
                OsStr::new("--disable-infobars"),
                OsStr::new("--no-first-run"),
            ])
            .idle_browser_timeout(request.timeout + Duration::from_secs(10))
            .build()
            .map_err(|e| EngineError::transport(format!("browser launch options: {e}")))?;

        let browser = Browser::new(options)
            .map_err(|e| EngineError::transport(format!("browser launch: {e}")))?;
        let tab = browser
            .new_tab()
            .map_err(|e| EngineError::transport(format!("new tab: {e}")))?;
        tab.set_default_timeout(request.timeout);
        tab.set_user_agent(
            next_user_agent(),
            Some(accept_language_for(&request.country)),
            Some("Linux x86_64"),
        )
        .map_err(|e| EngineError::transport(format!("set user agent: {e}")))?;

        tab.navigate_to(&request.url)
            .map_err(|e| EngineError::transport(format!("navigate: {e}")))?;
        tab.wait_until_navigated()
            .map_err(|e| EngineError::transport(format!("navigation: {e}")))?;

        if request.scroll_to_bottom {
            // Lazy menus load on scroll; a failure here is not fatal.
            let _ = tab.evaluate(
                "window.scrollTo(0, document.body.scrollHeight); true",
                false,
            );
        }

        let selector_found = tab.wait_for_element(&request.wait_selector).is_ok();
        let html = tab
            .get_content()
            .map_err(|e| EngineError::transport(format!("read page: {e}")))?;

        if looks_like_captcha(&html) {
            return Err(EngineError::Protocol {
                message: format!("captcha challenge at {}", request.url),
                status: None,
            });
        }
        if !selector_found {
            return Err(EngineError::Content(format!(
                "selector '{}' not found after scroll at {}",
                request.wait_selector, request.url
            )));
        }
        Ok(html)
    }
}

impl Default for HeadlessFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PageFetcher for HeadlessFetcher {
    async fn fetch(&self, request: &FetchRequest) -> EngineResult<PageData> {
        let request_clone = request.clone();
        let html = tokio::task::spawn_blocking(move || Self::fetch_blocking(&request_clone))
            .await
            .map_err(|e| EngineError::transport(format!("fetch task: {e}")))??;
        Ok(PageData {
            url: request.url.clone(),
            html,
        })
    }
}

// ── plain HTTP ──────────────────────────────────────────────────────

/// For pages whose server-rendered HTML or embedded state JSON is enough.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, request: &FetchRequest) -> EngineResult<PageData> {
        let response = timeout(
            request.timeout,
            self.client
                .get(&request.url)
                .header(reqwest::header::USER_AGENT, next_user_agent())
                .header(
                    reqwest::header::ACCEPT_LANGUAGE,
                    accept_language_for(&request.country),
                )
                .send(),
        )
        .await
        .map_err(|_| EngineError::transport("fetch timeout"))?
        .map_err(EngineError::from)?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(EngineError::from_status(status, "page fetch"));
        }
        let html = response
            .text()
            .await
            .map_err(|e| EngineError::transport(e.to_string()))?;
        if looks_like_captcha(&html) {
            return Err(EngineError::Protocol {
                message: format!("captcha challenge at {}", request.url),
                status: None,
            });
        }
        Ok(PageData {
            url: request.url.clone(),
            html,
        })
    }
}

// ── canned pages for tests ──────────────────────────────────────────

pub struct StaticFetcher {
    pages: parking_lot::Mutex<std::collections::HashMap<String, EngineResult<String>>>,
}

impl StaticFetcher {
    pub fn new() -> Self {
        Self {
            pages: parking_lot::Mutex::new(std::collections::HashMap::new()),
        }
    }

    pub fn insert(&self, url: &str, html: &str) {
        self.pages
            .lock()
            .insert(url.to_string(), Ok(html.to_string()));
    }

    pub fn insert_failure(&self, url: &str, error: EngineError) {
        self.pages.lock().insert(url.to_string(), Err(error));
    }
}

impl Default for StaticFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PageFetcher for StaticFetcher {
    async fn fetch(&self, request: &FetchRequest) -> EngineResult<PageData> {
        let pages = self.pages.lock();
        match pages.get(&request.url) {
            Some(Ok(html)) => Ok(PageData {
                url: request.url.clone(),
                html: html.clone(),
            }),
            Some(Err(e)) => Err(clone_error(e)),
            None => Err(EngineError::Protocol {
                message: format!("no canned page for {}", request.url),
                status: Some(404),
            }),
        }
    }
}

fn clone_error(e: &EngineError) -> EngineError {
    match e {
        EngineError::Transport { message, status } => EngineError::Transport {
            message: message.clone(),
            status: *status,
        },
        EngineError::Protocol { message, status } => EngineError::Protocol {
            message: message.clone(),
            status: *status,
        },
        EngineError::Content(m) => EngineError::Content(m.clone()),
        EngineError::Quota(m) => EngineError::Quota(m.clone()),
        other => EngineError::transport(other.to_string()),
    }
}

/// Fetch with the extraction retry discipline: up to three attempts with
/// backoff on retryable errors, immediate return otherwise.
pub async fn fetch_with_retry(
    fetcher: &dyn PageFetcher,
    request: &FetchRequest,
) -> EngineResult<PageData> {
    let mut last_error = EngineError::transport("no attempt made");
    for attempt in 0..MAX_FETCH_ATTEMPTS {
        match fetcher.fetch(request).await {
            Ok(page) => return Ok(page),
            Err(e) if e.is_retryable() => {
                warn!(url = %request.url, attempt = attempt + 1, error = %e, "fetch retry");
                last_error = e;
                if attempt + 1 < MAX_FETCH_ATTEMPTS {
                    let delay = backoff_delay(attempt);
                    debug!(delay_ms = delay.as_millis() as u64, "fetch backoff");
                    sleep(delay).await;
                }
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_error)
}
