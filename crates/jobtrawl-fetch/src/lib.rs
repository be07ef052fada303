//! Rendered-page fetch capability for jobtrawl.
//!
//! The pipeline only ever sees [`PageFetcher`]: given a URL it returns the
//! markup as rendered at fetch time. [`HttpPageFetcher`] is the networked
//! implementation, [`StaticPageFetcher`] serves fixtures.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "jobtrawl-fetch";

/// Desktop Chrome user agent the listing pages were historically requested with.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/92.0.4515.107 Safari/537.36";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPage {
    pub url: String,
    pub final_url: String,
    pub status: u16,
    pub markup: String,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("fetch of {url} timed out after {timeout:?}")]
    Timeout { url: String, timeout: Duration },
    #[error("no page available for {0}")]
    NotFound(String),
    #[error("fetcher is shut down")]
    Closed,
}

#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError>;
}

#[async_trait]
impl<T: PageFetcher + ?Sized> PageFetcher for Arc<T> {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
        (**self).fetch(url).await
    }
}

impl FetchError {
    /// Throttling, server errors and dropped connections are worth another
    /// attempt; a missing page or a closed fetcher is not.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::HttpStatus { status, .. } => *status == 429 || (500..600).contains(status),
            FetchError::Timeout { .. } => true,
            FetchError::Request(err) => err.is_timeout() || err.is_connect(),
            FetchError::NotFound(_) | FetchError::Closed => false,
        }
    }
}

/// Retry schedule applied by [`RetryingFetcher`]. Zero retries is the default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Pause before retry number `retry` (zero-based): doubles each time, capped.
    pub fn delay_before(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Wraps any fetcher and re-issues transient failures with capped
/// exponential backoff. Permanent errors and the final transient error are
/// returned unchanged.
#[derive(Debug)]
pub struct RetryingFetcher<F> {
    inner: F,
    policy: RetryPolicy,
}

impl<F: PageFetcher> RetryingFetcher<F> {
    pub fn new(inner: F, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &F {
        &self.inner
    }
}

#[async_trait]
impl<F: PageFetcher> PageFetcher for RetryingFetcher<F> {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let mut retry = 0u32;
        loop {
            match self.inner.fetch(url).await {
                Err(err) if err.is_transient() && retry < self.policy.max_retries => {
                    let delay = self.policy.delay_before(retry);
                    warn!(url, error = %err, retry, ?delay, "transient fetch failure, backing off");
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                result => return result,
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: Some(DEFAULT_USER_AGENT.to_string()),
            concurrency: 4,
        }
    }
}

/// reqwest-backed fetcher. One request per call; wrap it in
/// [`RetryingFetcher`] for retries.
///
/// One semaphore permit is one fetch session. It is taken right before the
/// request is sent and dropped on every exit path, including timeouts and
/// cancellation of the calling task.
#[derive(Debug)]
pub struct HttpPageFetcher {
    client: reqwest::Client,
    sessions: Arc<Semaphore>,
    timeout: Duration,
}

impl HttpPageFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build()?;
        Ok(Self {
            client,
            sessions: Arc::new(Semaphore::new(config.concurrency.max(1))),
            timeout: config.timeout,
        })
    }

    pub fn available_sessions(&self) -> usize {
        self.sessions.available_permits()
    }

    async fn fetch_once(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let _session = self
            .sessions
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;

        let resp = self.client.get(url).send().await.map_err(|err| {
            if err.is_timeout() {
                FetchError::Timeout {
                    url: url.to_string(),
                    timeout: self.timeout,
                }
            } else {
                FetchError::Request(err)
            }
        })?;

        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        let markup = resp.text().await?;
        debug!(status = status.as_u16(), bytes = markup.len(), "page fetched");
        Ok(FetchedPage {
            url: url.to_string(),
            final_url,
            status: status.as_u16(),
            markup,
            fetched_at: Utc::now(),
        })
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let span = info_span!("http_fetch", url);
        self.fetch_once(url).instrument(span).await
    }
}

/// Fixture-backed fetcher. Each URL maps to a sequence of renders; successive
/// fetches walk the sequence and then keep returning its last entry, which
/// models a page that finishes lazy-loading after a few polls.
#[derive(Debug, Default)]
pub struct StaticPageFetcher {
    pages: HashMap<String, Vec<String>>,
    failures: HashMap<String, u16>,
    flaky: HashMap<String, (u16, usize)>,
    served: Mutex<HashMap<String, usize>>,
    total_fetches: AtomicUsize,
    delay: Duration,
}

impl StaticPageFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(mut self, url: impl Into<String>, markup: impl Into<String>) -> Self {
        self.pages.insert(url.into(), vec![markup.into()]);
        self
    }

    pub fn with_renders(mut self, url: impl Into<String>, renders: Vec<String>) -> Self {
        self.pages.insert(url.into(), renders);
        self
    }

    pub fn with_failure(mut self, url: impl Into<String>, status: u16) -> Self {
        self.failures.insert(url.into(), status);
        self
    }

    /// The first `attempts` fetches of `url` fail with `status`; later ones
    /// serve the page registered for it.
    pub fn with_failures_before(mut self, url: impl Into<String>, status: u16, attempts: usize) -> Self {
        self.flaky.insert(url.into(), (status, attempts));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn total_fetches(&self) -> usize {
        self.total_fetches.load(Ordering::SeqCst)
    }

    pub fn fetches_of(&self, url: &str) -> usize {
        let served = self.served.lock().unwrap_or_else(|e| e.into_inner());
        served.get(url).copied().unwrap_or(0)
    }
}

#[async_trait]
impl PageFetcher for StaticPageFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
        self.total_fetches.fetch_add(1, Ordering::SeqCst);
        let index = {
            let mut served = self.served.lock().unwrap_or_else(|e| e.into_inner());
            let count = served.entry(url.to_string()).or_default();
            *count += 1;
            *count - 1
        };

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if let Some(status) = self.failures.get(url) {
            return Err(FetchError::HttpStatus {
                status: *status,
                url: url.to_string(),
            });
        }

        let mut index = index;
        if let Some((status, attempts)) = self.flaky.get(url) {
            if index < *attempts {
                return Err(FetchError::HttpStatus {
                    status: *status,
                    url: url.to_string(),
                });
            }
            index -= *attempts;
        }

        let renders = self
            .pages
            .get(url)
            .filter(|r| !r.is_empty())
            .ok_or_else(|| FetchError::NotFound(url.to_string()))?;
        let markup = renders
            .get(index)
            .or_else(|| renders.last())
            .cloned()
            .unwrap_or_default();

        Ok(FetchedPage {
            url: url.to_string(),
            final_url: url.to_string(),
            status: 200,
            markup,
            fetched_at: Utc::now(),
        })
    }
}

/// Bounded wait for a page to finish rendering its expected content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl WaitPolicy {
    /// Accept the first render without polling.
    pub fn immediate() -> Self {
        Self {
            timeout: Duration::ZERO,
            poll_interval: Duration::ZERO,
        }
    }
}

/// Fetches `url` until `ready` accepts the markup or the wait budget runs out.
///
/// On budget exhaustion the last render is returned; the extractor then
/// reports what it actually found. Fetch errors are returned immediately.
pub async fn fetch_settled<F, R>(
    fetcher: &F,
    url: &str,
    policy: WaitPolicy,
    ready: R,
) -> Result<FetchedPage, FetchError>
where
    F: PageFetcher + ?Sized,
    R: Fn(&str) -> bool,
{
    let deadline = Instant::now() + policy.timeout;
    let mut polls = 0usize;
    loop {
        let page = fetcher.fetch(url).await?;
        polls += 1;
        if ready(&page.markup) {
            debug!(url, polls, "page settled");
            return Ok(page);
        }
        if policy.poll_interval.is_zero() || Instant::now() + policy.poll_interval > deadline {
            warn!(url, polls, "page did not settle within wait budget; using last render");
            return Ok(page);
        }
        tokio::time::sleep(policy.poll_interval).await;
    }
}
