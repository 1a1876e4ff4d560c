//! Append-only findings log and the storefront HTTP transport for bidwatch.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use bidwatch_core::FoundListing;
use chrono::NaiveDate;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "bidwatch-storage";

pub const FINDINGS_FILE: &str = "findings.json";
pub const DAILY_LOG_DIR: &str = "logs";

/// Append-only JSON-lines record of every newly reported listing.
///
/// Each finding lands in `findings.json` and in `logs/findings_YYYY-MM-DD.json`.
#[derive(Debug, Clone)]
pub struct FindingsLog {
    root: PathBuf,
}

impl FindingsLog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn findings_path(&self) -> PathBuf {
        self.root.join(FINDINGS_FILE)
    }

    pub fn daily_path(&self, date: NaiveDate) -> PathBuf {
        self.root
            .join(DAILY_LOG_DIR)
            .join(format!("findings_{}.json", date.format("%Y-%m-%d")))
    }

    pub async fn append(&self, found: &FoundListing) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(found).context("serializing finding")?;
        line.push(b'\n');

        append_line(&self.findings_path(), &line).await?;

        let daily = self.daily_path(found.found.date_naive());
        if let Some(parent) = daily.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating daily log directory {}", parent.display()))?;
        }
        append_line(&daily, &line).await
    }

    /// Reads `findings.json` back into `{query -> urls}`. Malformed lines are skipped.
    pub async fn load_seen(&self) -> anyhow::Result<HashMap<String, HashSet<String>>> {
        let path = self.findings_path();
        let mut seen: HashMap<String, HashSet<String>> = HashMap::new();
        if !fs::try_exists(&path)
            .await
            .with_context(|| format!("checking {}", path.display()))?
        {
            return Ok(seen);
        }

        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        for (index, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<FoundListing>(line) {
                Ok(found) => {
                    seen.entry(found.query).or_default().insert(found.item.url);
                }
                Err(err) => {
                    warn!(path = %path.display(), line = index + 1, %err, "skipping malformed finding");
                }
            }
        }
        Ok(seen)
    }
}

async fn append_line(path: &Path, line: &[u8]) -> anyhow::Result<()> {
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("opening {}", path.display()))?;
    file.write_all(line)
        .await
        .with_context(|| format!("appending to {}", path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing {}", path.display()))
}

/// Spaces consecutive storefront requests at least `gap` apart.
///
/// Searches run one after another, so this is the only politeness control needed: the first
/// request goes out at once, every later one waits until `gap` has passed since the previous.
#[derive(Debug)]
pub struct RequestPacer {
    gap: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RequestPacer {
    pub fn new(gap: Duration) -> Self {
        Self {
            gap,
            next_slot: Mutex::new(None),
        }
    }

    pub fn gap(&self) -> Duration {
        self.gap
    }

    pub async fn wait_turn(&self) {
        let mut next_slot = self.next_slot.lock().await;
        if let Some(at) = *next_slot {
            tokio::time::sleep_until(at).await;
        }
        *next_slot = Some(Instant::now() + self.gap);
    }
}

/// How often and how patiently a search page fetch is repeated.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub retries: u32,
    pub first_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            first_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based): doubles each time, never above `max_delay`.
    /// A server-provided `Retry-After` replaces the computed delay, still capped.
    pub fn delay_before(&self, retry: u32, retry_after: Option<Duration>) -> Duration {
        let doubled = self
            .first_delay
            .saturating_mul(2u32.saturating_pow(retry));
        retry_after.unwrap_or(doubled).min(self.max_delay)
    }
}

/// Storefront throttling and outages are worth another try; anything else is final.
pub fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

pub fn is_transient_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

/// `Retry-After` in its delta-seconds form. HTTP-date values are ignored.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: RetryPolicy,
    /// Minimum spacing between requests; `None` sends them back to back.
    pub request_gap: Option<Duration>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            retry: RetryPolicy::default(),
            request_gap: None,
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    pacer: Option<RequestPacer>,
    retry: RetryPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build().context("building reqwest client")?,
            pacer: config
                .request_gap
                .filter(|gap| !gap.is_zero())
                .map(RequestPacer::new),
            retry: config.retry,
        })
    }

    /// Fetches one search results page, retrying transient failures.
    pub async fn fetch_bytes(&self, query: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", query, url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut retry = 0u32;
        loop {
            if let Some(pacer) = &self.pacer {
                pacer.wait_turn().await;
            }
            let exhausted = retry >= self.retry.retries;

            let wait = match self.client.get(url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    let body = resp.bytes().await?.to_vec();
                    debug!(%status, bytes = body.len(), "search page fetched");
                    return Ok(FetchedResponse {
                        status,
                        final_url,
                        body,
                    });
                }
                Ok(resp) => {
                    let status = resp.status();
                    if exhausted || !is_transient_status(status) {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: resp.url().to_string(),
                        });
                    }
                    let wait = self.retry.delay_before(retry, retry_after(resp.headers()));
                    warn!(%status, retry, wait_ms = wait.as_millis() as u64, "storefront busy, retrying");
                    wait
                }
                Err(err) => {
                    if exhausted || !is_transient_error(&err) {
                        return Err(FetchError::Request(err));
                    }
                    let wait = self.retry.delay_before(retry, None);
                    warn!(%err, retry, wait_ms = wait.as_millis() as u64, "request failed, retrying");
                    wait
                }
            };

            tokio::time::sleep(wait).await;
            retry += 1;
        }
    }
}
