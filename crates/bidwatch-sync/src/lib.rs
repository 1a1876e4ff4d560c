//! Watch configuration, per-query deduplication and the polling loop.

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bidwatch_adapters::{
    AdapterError, EbaySearchSource, FixtureSearchSource, ListingExtractor,
    ListingSelectors, SearchSource, DEFAULT_SEARCH_URL,
};
use bidwatch_core::{
    rejection, FoundListing, Listing, ListingTypeFilter, SearchCriteria, TimeLeft,
};
use bidwatch_storage::{
    FindingsLog, HttpClientConfig, HttpFetcher,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "bidwatch-sync";

/// Poll interval used when the watch file leaves it unset or non-positive.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },
    #[error("no searches configured")]
    NoSearches,
    #[error("search #{index}: query is empty")]
    EmptyQuery { index: usize },
    #[error("search '{query}': unknown listing type {value}")]
    ListingType { query: String, value: String },
    #[error("search '{query}': min_price {min} exceeds max_price {max}")]
    PriceRange { query: String, min: f64, max: f64 },
    #[error("search '{query}': min_watchers {min} exceeds max_watchers {max}")]
    WatcherRange { query: String, min: u32, max: u32 },
    #[error("search '{query}': watcher bound {value} is out of range")]
    WatcherBound { query: String, value: i64 },
    #[error("search '{query}': invalid time ceiling `{value}`, expected DD:HH:MM")]
    TimeCeiling { query: String, value: String },
    #[error(transparent)]
    Selectors(#[from] AdapterError),
}

/// Listing type as written in a watch file: a legacy numeric code or a name.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum RawListingType {
    Code(i64),
    Name(String),
}

/// Time ceiling as written in a watch file: `"DD:HH:MM"` or `{days, hours, minutes}`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum RawTimeLeft {
    Clock(String),
    Parts(TimeParts),
}

/// Struct form of a time ceiling. Older watch files spell the keys `Days`, `Hours`, `Minutes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeParts {
    #[serde(default, alias = "Days")]
    pub days: u32,
    #[serde(default, alias = "Hours")]
    pub hours: u32,
    #[serde(default, alias = "Minutes")]
    pub minutes: u32,
}

impl TimeParts {
    /// Hours must stay below 24 and minutes below 60.
    pub fn to_time_left(self) -> Option<TimeLeft> {
        (self.hours < 24 && self.minutes < 60)
            .then(|| TimeLeft::new(self.days, self.hours, self.minutes))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchEntry {
    pub query: String,
    #[serde(default)]
    pub listing_type: Option<RawListingType>,
    #[serde(default)]
    pub min_price: Option<f64>,
    #[serde(default)]
    pub max_price: Option<f64>,
    #[serde(default)]
    pub min_watchers: Option<i64>,
    #[serde(default)]
    pub max_watchers: Option<i64>,
    #[serde(default)]
    pub max_time_left: Option<RawTimeLeft>,
}

/// On-disk watch file, JSON or YAML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WatchFile {
    #[serde(default)]
    pub check_interval_seconds: Option<i64>,
    #[serde(default)]
    pub searches: Vec<SearchEntry>,
    #[serde(default)]
    pub selectors: Option<ListingSelectors>,
}

/// One monitored query with its validated criteria.
#[derive(Debug, Clone, PartialEq)]
pub struct Search {
    pub query: String,
    pub criteria: SearchCriteria,
}

/// Validated, read-only input to the poller.
#[derive(Debug, Clone)]
pub struct WatchPlan {
    pub interval: Duration,
    pub searches: Vec<Search>,
    pub extractor: ListingExtractor,
}

pub fn interval_from_seconds(seconds: Option<i64>) -> Duration {
    match seconds {
        Some(s) if s > 0 => Duration::from_secs(s as u64),
        _ => DEFAULT_INTERVAL,
    }
}

/// Parses `DD:HH:MM` with hours below 24 and minutes below 60.
pub fn parse_clock(value: &str) -> Option<TimeLeft> {
    let parts = value.trim().split(':').collect::<Vec<_>>();
    let [days, hours, minutes] = parts.as_slice() else {
        return None;
    };
    TimeParts {
        days: days.trim().parse().ok()?,
        hours: hours.trim().parse().ok()?,
        minutes: minutes.trim().parse().ok()?,
    }
    .to_time_left()
}

impl SearchEntry {
    pub fn validate(self, index: usize) -> Result<Search, ConfigError> {
        let query = self.query.trim().to_string();
        if query.is_empty() {
            return Err(ConfigError::EmptyQuery { index });
        }

        let listing_type = match &self.listing_type {
            None => ListingTypeFilter::Any,
            Some(RawListingType::Code(code)) => ListingTypeFilter::from_code(*code).ok_or_else(
                || ConfigError::ListingType {
                    query: query.clone(),
                    value: code.to_string(),
                },
            )?,
            Some(RawListingType::Name(name)) => ListingTypeFilter::from_name(name).ok_or_else(
                || ConfigError::ListingType {
                    query: query.clone(),
                    value: format!("`{name}`"),
                },
            )?,
        };

        // Negative prices are the legacy "no limit" sentinel.
        let min_price = self.min_price.filter(|p| *p >= 0.0);
        let max_price = self.max_price.filter(|p| *p >= 0.0);
        if let (Some(min), Some(max)) = (min_price, max_price) {
            if min > max {
                return Err(ConfigError::PriceRange { query, min, max });
            }
        }

        let min_watchers = watcher_bound(&query, self.min_watchers)?;
        let max_watchers = watcher_bound(&query, self.max_watchers)?;
        if let (Some(min), Some(max)) = (min_watchers, max_watchers) {
            if min > max {
                return Err(ConfigError::WatcherRange { query, min, max });
            }
        }

        let max_time_left = match self.max_time_left {
            None => None,
            Some(RawTimeLeft::Parts(parts)) => {
                Some(parts.to_time_left().ok_or_else(|| ConfigError::TimeCeiling {
                    query: query.clone(),
                    value: format!("{:02}:{:02}:{:02}", parts.days, parts.hours, parts.minutes),
                })?)
            }
            Some(RawTimeLeft::Clock(value)) if value.trim().is_empty() => None,
            Some(RawTimeLeft::Clock(value)) => Some(parse_clock(&value).ok_or_else(|| {
                ConfigError::TimeCeiling {
                    query: query.clone(),
                    value,
                }
            })?),
        };

        Ok(Search {
            query,
            criteria: SearchCriteria {
                listing_type,
                min_price,
                max_price,
                min_watchers,
                max_watchers,
                max_time_left,
            },
        })
    }
}

/// Watcher bounds of zero or below mean "no bound".
fn watcher_bound(query: &str, value: Option<i64>) -> Result<Option<u32>, ConfigError> {
    match value {
        Some(v) if v > 0 => u32::try_from(v).map(Some).map_err(|_| ConfigError::WatcherBound {
            query: query.to_string(),
            value: v,
        }),
        _ => Ok(None),
    }
}

impl WatchFile {
    pub fn validate(self) -> Result<WatchPlan, ConfigError> {
        if self.searches.is_empty() {
            return Err(ConfigError::NoSearches);
        }
        let searches = self
            .searches
            .into_iter()
            .enumerate()
            .map(|(index, entry)| entry.validate(index + 1))
            .collect::<Result<Vec<_>, _>>()?;
        let extractor = ListingExtractor::new(&self.selectors.unwrap_or_default())?;

        Ok(WatchPlan {
            interval: interval_from_seconds(self.check_interval_seconds),
            searches,
            extractor,
        })
    }
}

/// `config.json` -> `config.template.json`.
pub fn template_path_for(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("config");
    let name = match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{stem}.template.{ext}"),
        None => format!("{stem}.template"),
    };
    path.with_file_name(name)
}

/// Loads a watch file, seeding it from its sibling template when it does not exist yet.
pub fn load_watch_file(path: &Path) -> Result<WatchFile, ConfigError> {
    if !path.exists() {
        let template = template_path_for(path);
        if template.exists() {
            std::fs::copy(&template, path).map_err(|source| ConfigError::Read {
                path: template.clone(),
                source,
            })?;
            info!(template = %template.display(), config = %path.display(), "created watch file from template");
        }
    }

    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_watch_file(path, &text)
}

pub fn parse_watch_file(path: &Path, text: &str) -> Result<WatchFile, ConfigError> {
    let parse_error = |message: String| ConfigError::Parse {
        path: path.to_path_buf(),
        message,
    };
    match path.extension().and_then(|e| e.to_str()) {
        Some("yaml") | Some("yml") => {
            serde_yaml::from_str(text).map_err(|e| parse_error(e.to_string()))
        }
        _ => serde_json::from_str(text).map_err(|e| parse_error(e.to_string())),
    }
}

pub fn load_watch_plan(path: &Path) -> Result<WatchPlan, ConfigError> {
    load_watch_file(path)?.validate()
}

/// Process-level settings taken from the environment.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub config_path: PathBuf,
    pub data_dir: PathBuf,
    pub search_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub request_gap_ms: u64,
    pub reseed: bool,
    pub fixtures_dir: Option<PathBuf>,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            config_path: lookup("BIDWATCH_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("config.json")),
            data_dir: lookup("BIDWATCH_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            search_url: lookup("BIDWATCH_SEARCH_URL")
                .unwrap_or_else(|| DEFAULT_SEARCH_URL.to_string()),
            user_agent: lookup("BIDWATCH_USER_AGENT")
                .unwrap_or_else(|| "Mozilla/5.0 (compatible; bidwatch/0.1)".to_string()),
            http_timeout_secs: lookup("BIDWATCH_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            request_gap_ms: lookup("BIDWATCH_REQUEST_GAP_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            reseed: lookup("BIDWATCH_RESEED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            fixtures_dir: lookup("BIDWATCH_FIXTURES_DIR").map(PathBuf::from),
        }
    }

    /// Pause between storefront requests; zero means none.
    pub fn request_gap(&self) -> Option<Duration> {
        (self.request_gap_ms > 0).then(|| Duration::from_millis(self.request_gap_ms))
    }
}

/// Per-query record of listing urls that were already reported.
#[derive(Debug, Clone, Default)]
pub struct SeenStore {
    seen: HashSet<String>,
}

impl SeenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps the listings whose url was never reported, in input order, and records them.
    pub fn filter_new(&mut self, listings: Vec<Listing>) -> Vec<Listing> {
        listings
            .into_iter()
            .filter(|listing| self.seen.insert(listing.url.clone()))
            .collect()
    }

    pub fn seed(&mut self, urls: impl IntoIterator<Item = String>) {
        self.seen.extend(urls);
    }

    pub fn contains(&self, url: &str) -> bool {
        self.seen.contains(url)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Durable, append-only destination for newly reported listings.
#[async_trait]
pub trait FindingsSink: Send + Sync {
    async fn record(&self, listing: &Listing, query: &str, found_at: DateTime<Utc>) -> Result<()>;
}

#[async_trait]
impl FindingsSink for FindingsLog {
    async fn record(&self, listing: &Listing, query: &str, found_at: DateTime<Utc>) -> Result<()> {
        self.append(&FoundListing {
            item: listing.clone(),
            found: found_at,
            query: query.to_string(),
        })
        .await
    }
}

pub trait Presenter: Send {
    fn present(&mut self, listing: &Listing, query: &str) -> std::io::Result<()>;
}

/// Plain-text rendering of new listings.
pub struct TextPresenter<W> {
    out: W,
}

impl TextPresenter<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> TextPresenter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> Presenter for TextPresenter<W> {
    fn present(&mut self, listing: &Listing, query: &str) -> std::io::Result<()> {
        let kind = if listing.is_auction {
            match listing.raw_time_left.as_deref() {
                Some(left) => format!("Auction - {left} remaining"),
                None => "Auction".to_string(),
            }
        } else {
            "Buy Now".to_string()
        };
        let watchers = if listing.watchers > 0 {
            format!(" ({} watchers)", listing.watchers)
        } else {
            String::new()
        };

        writeln!(self.out, "\n{}", "-".repeat(80))?;
        writeln!(self.out, "Title: {}", listing.title)?;
        writeln!(self.out, "Price: {}", listing.raw_price)?;
        writeln!(self.out, "Type: {kind}{watchers}")?;
        writeln!(self.out, "URL: {}", listing.url)?;
        writeln!(self.out, "Query: {query}")?;
        self.out.flush()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PollerState {
    Idle,
    Running,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SearchStatus {
    Completed {
        extracted: usize,
        matched: usize,
        new_items: Vec<Listing>,
    },
    Skipped {
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchOutcome {
    pub query: String,
    pub status: SearchStatus,
}

impl SearchOutcome {
    pub fn new_items(&self) -> &[Listing] {
        match &self.status {
            SearchStatus::Completed { new_items, .. } => new_items,
            SearchStatus::Skipped { .. } => &[],
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub cycle: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub searches: Vec<SearchOutcome>,
    pub interrupted: bool,
}

impl CycleSummary {
    pub fn new_item_count(&self) -> usize {
        self.searches.iter().map(|s| s.new_items().len()).sum()
    }

    pub fn skipped_count(&self) -> usize {
        self.searches
            .iter()
            .filter(|s| matches!(s.status, SearchStatus::Skipped { .. }))
            .count()
    }
}

/// Drives fetch -> extract -> filter -> dedup -> emit over every configured search, forever.
pub struct Poller {
    source: Box<dyn SearchSource>,
    extractor: ListingExtractor,
    searches: Vec<Search>,
    interval: Duration,
    seen: HashMap<String, SeenStore>,
    findings: Box<dyn FindingsSink>,
    presenter: Box<dyn Presenter>,
    state: PollerState,
    cycles: u64,
}

impl Poller {
    pub fn new(
        plan: WatchPlan,
        source: Box<dyn SearchSource>,
        findings: Box<dyn FindingsSink>,
        presenter: Box<dyn Presenter>,
    ) -> Self {
        let seen = plan
            .searches
            .iter()
            .map(|s| (s.query.clone(), SeenStore::new()))
            .collect();
        Self {
            source,
            extractor: plan.extractor,
            searches: plan.searches,
            interval: plan.interval,
            seen,
            findings,
            presenter,
            state: PollerState::Idle,
            cycles: 0,
        }
    }

    /// Marks previously reported urls as seen; queries not in the plan are ignored.
    pub fn seed_seen(&mut self, seen: HashMap<String, HashSet<String>>) {
        for (query, urls) in seen {
            if let Some(store) = self.seen.get_mut(&query) {
                store.seed(urls);
            }
        }
    }

    pub fn state(&self) -> PollerState {
        self.state
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn seen_store(&self, query: &str) -> Option<&SeenStore> {
        self.seen.get(query)
    }

    /// Runs one full pass over every search.
    pub async fn run_cycle(&mut self) -> CycleSummary {
        self.cycle(None).await
    }

    /// Polls until `shutdown` turns true. The signal is honoured before each search and during
    /// the end-of-cycle sleep. Returns the number of cycles run.
    pub async fn run_until(&mut self, mut shutdown: watch::Receiver<bool>) -> u64 {
        info!(
            searches = self.searches.len(),
            interval_secs = self.interval.as_secs(),
            source = self.source.source_id(),
            "starting continuous monitoring"
        );
        let started = self.cycles;
        loop {
            if *shutdown.borrow() {
                break;
            }
            let summary = self.cycle(Some(&shutdown)).await;
            if summary.interrupted {
                break;
            }
            if sleep_or_shutdown(self.interval, &mut shutdown).await {
                break;
            }
        }
        info!(cycles = self.cycles - started, "monitoring stopped");
        self.cycles - started
    }

    async fn cycle(&mut self, shutdown: Option<&watch::Receiver<bool>>) -> CycleSummary {
        self.state = PollerState::Running;
        self.cycles += 1;
        let span = info_span!("poll_cycle", cycle = self.cycles, cycle_id = %Uuid::new_v4());
        let summary = self.cycle_inner(shutdown).instrument(span).await;
        self.state = PollerState::Idle;
        summary
    }

    async fn cycle_inner(&mut self, shutdown: Option<&watch::Receiver<bool>>) -> CycleSummary {
        let started_at = Utc::now();
        let mut outcomes = Vec::with_capacity(self.searches.len());
        let mut interrupted = false;

        for index in 0..self.searches.len() {
            if shutdown.is_some_and(|rx| *rx.borrow()) {
                interrupted = true;
                break;
            }
            let search = self.searches[index].clone();
            outcomes.push(self.poll_search(&search).await);
        }

        CycleSummary {
            cycle: self.cycles,
            started_at,
            finished_at: Utc::now(),
            searches: outcomes,
            interrupted,
        }
    }

    async fn poll_search(&mut self, search: &Search) -> SearchOutcome {
        let query = search.query.as_str();
        let skipped = |reason: String| SearchOutcome {
            query: query.to_string(),
            status: SearchStatus::Skipped { reason },
        };

        let page = match self.source.fetch_search(query).await {
            Ok(page) => page,
            Err(err) => {
                warn!(query, %err, "fetch failed; skipping search this cycle");
                return skipped(format!("fetch failed: {err}"));
            }
        };

        let listings = match self.extractor.extract(&page.body) {
            Ok(listings) => listings,
            Err(err) => {
                warn!(query, %err, "parse failed; skipping search this cycle");
                return skipped(format!("parse failed: {err}"));
            }
        };

        if listings.is_empty() {
            debug!(query, url = %page.url, bytes = page.body.len(), "page contained no listings");
        }

        let extracted = listings.len();
        let matched = listings
            .into_iter()
            .filter(|listing| match rejection(listing, &search.criteria) {
                None => true,
                Some(check) => {
                    debug!(query, url = %listing.url, %check, "listing excluded");
                    false
                }
            })
            .collect::<Vec<_>>();
        let matched_count = matched.len();

        let new_items = self
            .seen
            .entry(query.to_string())
            .or_default()
            .filter_new(matched);

        let found_at = Utc::now();
        for listing in &new_items {
            if let Err(err) = self.findings.record(listing, query, found_at).await {
                warn!(query, url = %listing.url, err = %format!("{err:#}"), "failed to record finding");
            }
            if let Err(err) = self.presenter.present(listing, query) {
                warn!(query, url = %listing.url, %err, "failed to present finding");
            }
        }

        if new_items.is_empty() {
            info!(query, extracted, matched = matched_count, "no new items");
        } else {
            info!(query, extracted, matched = matched_count, new = new_items.len(), "found new items");
        }

        SearchOutcome {
            query: query.to_string(),
            status: SearchStatus::Completed {
                extracted,
                matched: matched_count,
                new_items,
            },
        }
    }
}

/// Returns `true` when shutdown was requested before the interval elapsed.
async fn sleep_or_shutdown(interval: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    let sleep = tokio::time::sleep(interval);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return false,
            changed = shutdown.changed() => match changed {
                Ok(()) if *shutdown.borrow() => return true,
                Ok(()) => continue,
                Err(_) => {
                    (&mut sleep).await;
                    return false;
                }
            },
        }
    }
}

/// Wires the runtime configuration into a ready-to-run poller.
pub async fn build_poller(runtime: &RuntimeConfig, plan: WatchPlan) -> Result<Poller> {
    let source: Box<dyn SearchSource> = match &runtime.fixtures_dir {
        Some(dir) => Box::new(FixtureSearchSource::new(dir)),
        None => {
            let http = HttpFetcher::new(HttpClientConfig {
                timeout: Duration::from_secs(runtime.http_timeout_secs),
                user_agent: Some(runtime.user_agent.clone()),
                request_gap: runtime.request_gap(),
                ..Default::default()
            })?;
            Box::new(EbaySearchSource::new(http, runtime.search_url.clone()))
        }
    };

    tokio::fs::create_dir_all(&runtime.data_dir)
        .await
        .with_context(|| format!("creating {}", runtime.data_dir.display()))?;
    let findings = FindingsLog::new(&runtime.data_dir);
    let seeded = if runtime.reseed {
        Some(findings.load_seen().await.context("reseeding from findings log")?)
    } else {
        None
    };

    let mut poller = Poller::new(
        plan,
        source,
        Box::new(findings),
        Box::new(TextPresenter::stdout()),
    );
    if let Some(seen) = seeded {
        let urls = seen.values().map(HashSet::len).sum::<usize>();
        info!(queries = seen.len(), urls, "reseeded seen listings from findings log");
        poller.seed_seen(seen);
    }
    Ok(poller)
}
