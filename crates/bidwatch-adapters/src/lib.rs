//! Search page sources, field normalization and listing extraction.

use std::path::PathBuf;
use std::sync::LazyLock;

use async_trait::async_trait;
use bidwatch_core::{Listing, TimeLeft};
use bidwatch_storage::{FetchError, HttpFetcher};
use chrono::{DateTime, Utc};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;

pub const CRATE_NAME: &str = "bidwatch-adapters";

pub const DEFAULT_SEARCH_URL: &str = "https://www.ebay.de/sch/i.html";

/// Currency token prefixed to every price on the German storefront.
pub const CURRENCY_PREFIX: &str = "EUR";
/// Marker the storefront prepends to titles of fresh listings.
pub const NEW_LISTING_MARKER: &str = "Neues Angebot";
/// Title of the placeholder card rendered at the top of result lists.
pub const PROMO_PLACEHOLDER: &str = "shop on ebay";
/// Appears in link urls of advertisement/meta cards.
pub const NON_LISTING_URL_MARKER: &str = "itmmeta";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid selector `{selector}`: {message}")]
    Selector { selector: String, message: String },
    #[error("search page is empty")]
    EmptyDocument,
    #[error("invalid search url: {0}")]
    Url(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("reading fixture {}: {source}", path.display())]
    Fixture {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{0}")]
    Message(String),
}

// ---------------------------------------------------------------------------
// Field normalization

/// Parses a storefront price such as `EUR 1.234,56`.
///
/// Commas become decimal points and everything except digits and points is dropped. When several
/// points remain, all but the last are thousands separators, and every group between the first
/// and the last must then be exactly three digits; anything else (a price range such as
/// `EUR 10,00 bis EUR 20,00`) is not a single price. A lone point is always the decimal point,
/// so `EUR 1.234` is 1.234. Returns `None` when no single number is left; callers treat that as
/// an unknown price, never as zero.
pub fn parse_price(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    let without_currency = trimmed
        .strip_prefix(CURRENCY_PREFIX)
        .unwrap_or(trimmed)
        .trim();

    let cleaned = without_currency
        .chars()
        .map(|c| if c == ',' { '.' } else { c })
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect::<String>();

    let groups = cleaned.split('.').collect::<Vec<_>>();
    let normalized = match groups.as_slice() {
        [first, thousands @ .., decimals] if !thousands.is_empty() => {
            let grouped = (1..=3).contains(&first.len()) && thousands.iter().all(|g| g.len() == 3);
            if !grouped {
                return None;
            }
            format!("{first}{}.{decimals}", thousands.concat())
        }
        _ => cleaned.clone(),
    };

    normalized.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// First run of digits anywhere in the text, `0` when there is none.
pub fn parse_watchers(raw: &str) -> u32 {
    raw.chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect::<String>()
        .parse()
        .unwrap_or(0)
}

static DAYS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([0-9]+)T").expect("days pattern"));
static HOURS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([0-9]+)Std").expect("hours pattern"));
static MINUTES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([0-9]+)\s*Min").expect("minutes pattern"));

fn capture_count(re: &Regex, text: &str) -> Option<u32> {
    re.captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().parse().unwrap_or(0))
}

/// Parses remaining time in either the compact form (`5T 12Std`, `30 Min`) or the spaced form
/// (`Noch 3 Tage 5 Std`).
///
/// Returns `None` only for empty input. Text in neither form, whitespace included, yields an
/// all-zero value.
pub fn parse_time_left(raw: &str) -> Option<TimeLeft> {
    if raw.is_empty() {
        return None;
    }
    let text = raw.trim();

    let days = capture_count(&DAYS_RE, text);
    let hours = capture_count(&HOURS_RE, text);
    let minutes = capture_count(&MINUTES_RE, text);

    if days.is_some() || hours.is_some() || minutes.is_some() {
        return Some(TimeLeft::new(
            days.unwrap_or(0),
            hours.unwrap_or(0),
            minutes.unwrap_or(0),
        ));
    }

    let tokens = text.split_whitespace().collect::<Vec<_>>();
    let mut spaced = TimeLeft::default();
    for (i, token) in tokens.iter().enumerate().skip(1) {
        let count = || tokens[i - 1].parse::<u32>().unwrap_or(0);
        if token.starts_with('T') {
            spaced.days = count();
        }
        if token.starts_with("Std") {
            spaced.hours = count();
        }
    }
    Some(spaced)
}

pub fn clean_title(raw: &str) -> String {
    let trimmed = raw.trim();
    trimmed
        .strip_prefix(NEW_LISTING_MARKER)
        .unwrap_or(trimmed)
        .trim()
        .to_string()
}

// ---------------------------------------------------------------------------
// Classification

/// A block is an auction when it shows a countdown or a bid count.
pub fn has_auction_signals(time_left_text: &str, bids_text: &str) -> bool {
    !time_left_text.trim().is_empty() || !bids_text.trim().is_empty()
}

pub fn is_valid_listing(title: &str, raw_price: &str, url: &str) -> bool {
    if title.is_empty() || raw_price.is_empty() || url.is_empty() {
        return false;
    }
    if title.to_lowercase().contains(PROMO_PLACEHOLDER) {
        return false;
    }
    !url.contains(NON_LISTING_URL_MARKER)
}

// ---------------------------------------------------------------------------
// Extraction

/// CSS selectors locating listing blocks and their fragments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListingSelectors {
    pub item: String,
    pub title: String,
    pub price: String,
    pub link: String,
    pub link_attr: String,
    pub watchers: String,
    pub time_left: String,
    pub bids: String,
}

impl Default for ListingSelectors {
    fn default() -> Self {
        Self {
            item: ".s-item".to_string(),
            title: ".s-item__title".to_string(),
            price: ".s-item__price".to_string(),
            link: "a.s-item__link".to_string(),
            link_attr: "href".to_string(),
            watchers: ".s-item__watchcount".to_string(),
            time_left: ".s-item__time-left".to_string(),
            bids: ".s-item__bids".to_string(),
        }
    }
}

fn compile(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Selector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

#[derive(Debug, Clone)]
pub struct ListingExtractor {
    item: Selector,
    title: Selector,
    price: Selector,
    link: Selector,
    link_attr: String,
    watchers: Selector,
    time_left: Selector,
    bids: Selector,
}

impl ListingExtractor {
    pub fn new(selectors: &ListingSelectors) -> Result<Self, AdapterError> {
        Ok(Self {
            item: compile(&selectors.item)?,
            title: compile(&selectors.title)?,
            price: compile(&selectors.price)?,
            link: compile(&selectors.link)?,
            link_attr: selectors.link_attr.clone(),
            watchers: compile(&selectors.watchers)?,
            time_left: compile(&selectors.time_left)?,
            bids: compile(&selectors.bids)?,
        })
    }

    /// Extracts every valid listing block in document order.
    pub fn extract(&self, document: &str) -> Result<Vec<Listing>, AdapterError> {
        if document.trim().is_empty() {
            return Err(AdapterError::EmptyDocument);
        }
        let html = Html::parse_document(document);
        Ok(html
            .select(&self.item)
            .filter_map(|block| self.extract_block(block))
            .collect())
    }

    pub fn extract_block(&self, block: ElementRef<'_>) -> Option<Listing> {
        let title = clean_title(&first_text(block, &self.title));
        let raw_price = first_text(block, &self.price);
        let url = first_attr(block, &self.link, &self.link_attr);

        if !is_valid_listing(&title, &raw_price, &url) {
            trace!(%title, %url, "dropping non-listing block");
            return None;
        }

        let time_left_text = first_text(block, &self.time_left);
        let watchers_text = first_text(block, &self.watchers);

        Some(Listing {
            price: parse_price(&raw_price),
            is_auction: self.is_auction(block),
            watchers: parse_watchers(&watchers_text),
            time_left: parse_time_left(&time_left_text),
            raw_time_left: Some(time_left_text).filter(|t| !t.is_empty()),
            title,
            raw_price,
            url,
        })
    }

    pub fn is_auction(&self, block: ElementRef<'_>) -> bool {
        has_auction_signals(
            &first_text(block, &self.time_left),
            &first_text(block, &self.bids),
        )
    }
}

fn first_text(block: ElementRef<'_>, selector: &Selector) -> String {
    block
        .select(selector)
        .next()
        .map(|n| n.text().collect::<String>().trim().to_string())
        .unwrap_or_default()
}

fn first_attr(block: ElementRef<'_>, selector: &Selector, attr: &str) -> String {
    block
        .select(selector)
        .next()
        .and_then(|n| n.value().attr(attr))
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Sources

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPage {
    pub query: String,
    pub url: String,
    pub body: String,
    pub fetched_at: DateTime<Utc>,
}

/// Delivers the raw search results document for a query.
#[async_trait]
pub trait SearchSource: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch_search(&self, query: &str) -> Result<FetchedPage, AdapterError>;
}

/// Fetches live search pages over HTTP.
#[derive(Debug)]
pub struct EbaySearchSource {
    http: HttpFetcher,
    base_url: String,
}

impl EbaySearchSource {
    pub fn new(http: HttpFetcher, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    pub fn search_url(&self, query: &str) -> Result<String, AdapterError> {
        reqwest::Url::parse_with_params(&self.base_url, &[("_nkw", query)])
            .map(|u| u.to_string())
            .map_err(|e| AdapterError::Url(format!("{}: {e}", self.base_url)))
    }
}

#[async_trait]
impl SearchSource for EbaySearchSource {
    fn source_id(&self) -> &str {
        "ebay"
    }

    async fn fetch_search(&self, query: &str) -> Result<FetchedPage, AdapterError> {
        let url = self.search_url(query)?;
        let response = self.http.fetch_bytes(query, &url).await?;
        Ok(FetchedPage {
            query: query.to_string(),
            url: response.final_url,
            body: String::from_utf8_lossy(&response.body).into_owned(),
            fetched_at: Utc::now(),
        })
    }
}

/// Serves previously captured pages from `<dir>/<query-slug>.html`.
#[derive(Debug, Clone)]
pub struct FixtureSearchSource {
    dir: PathBuf,
}

impl FixtureSearchSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn page_path(&self, query: &str) -> PathBuf {
        self.dir.join(format!("{}.html", query_slug(query)))
    }
}

#[async_trait]
impl SearchSource for FixtureSearchSource {
    fn source_id(&self) -> &str {
        "fixture"
    }

    async fn fetch_search(&self, query: &str) -> Result<FetchedPage, AdapterError> {
        let path = self.page_path(query);
        let body = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| AdapterError::Fixture {
                path: path.clone(),
                source,
            })?;
        Ok(FetchedPage {
            query: query.to_string(),
            url: path.display().to_string(),
            body,
            fetched_at: Utc::now(),
        })
    }
}

/// Lowercase, dash-separated form of a query, used for file names.
pub fn query_slug(query: &str) -> String {
    let slug = query
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.is_empty() {
        "query".to_string()
    } else {
        slug
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> ListingExtractor {
        ListingExtractor::new(&ListingSelectors::default()).unwrap()
    }

    fn block(inner: &str) -> String {
        format!(r#"<li class="s-item">{inner}</li>"#)
    }

    fn page(blocks: &[String]) -> String {
        format!("<html><body><ul>{}</ul></body></html>", blocks.concat())
    }

    #[test]
    fn price_with_thousands_and_decimal_comma() {
        assert_eq!(parse_price("EUR 1.234,56"), Some(1234.56));
        assert_eq!(parse_price("  EUR 12,50 "), Some(12.5));
        assert_eq!(parse_price("EUR 7"), Some(7.0));
        assert_eq!(parse_price("99.95"), Some(99.95));
    }

    #[test]
    fn price_without_digits_is_absent() {
        assert_eq!(parse_price(""), None);
        assert_eq!(parse_price("EUR"), None);
        assert_eq!(parse_price("Preis auf Anfrage"), None);
    }

    #[test]
    fn price_range_is_not_a_price() {
        assert_eq!(parse_price("EUR 10,00 bis EUR 20,00"), None);
        assert_eq!(parse_price("EUR 1.2.3"), None);
        assert_eq!(parse_price("EUR 1.234.567,89"), Some(1234567.89));
    }

    #[test]
    fn lone_point_is_a_decimal_point() {
        assert_eq!(parse_price("EUR 1.234"), Some(1.234));
    }

    #[test]
    fn watchers_take_first_digit_run() {
        assert_eq!(parse_watchers("12 watchers"), 12);
        assert_eq!(parse_watchers("Nur noch 3 übrig, 40 Beobachter"), 3);
        assert_eq!(parse_watchers(""), 0);
        assert_eq!(parse_watchers("Beobachter"), 0);
    }

    #[test]
    fn compact_time_left_forms() {
        let t = parse_time_left("5T 12Std").unwrap();
        assert_eq!((t.days, t.hours, t.minutes), (5, 12, 0));
        assert_eq!(t.total_minutes(), 7920);

        let t = parse_time_left("Noch 12Std 30 Min").unwrap();
        assert_eq!((t.days, t.hours, t.minutes), (0, 12, 30));

        let t = parse_time_left("45Min").unwrap();
        assert_eq!((t.days, t.hours, t.minutes), (0, 0, 45));
    }

    #[test]
    fn spaced_time_left_form_is_a_fallback() {
        let t = parse_time_left("Noch 3 Tage 5 Std").unwrap();
        assert_eq!((t.days, t.hours, t.minutes), (3, 5, 0));
    }

    #[test]
    fn unrecognized_time_left_degrades_to_zero() {
        assert_eq!(parse_time_left("endet bald"), Some(TimeLeft::default()));
        let t = parse_time_left("endet bald").unwrap();
        assert_eq!((t.days, t.hours, t.minutes), (0, 0, 0));
        assert_eq!(parse_time_left(""), None);
        assert_eq!(parse_time_left("   "), Some(TimeLeft::default()));
    }

    #[test]
    fn title_marker_is_stripped() {
        assert_eq!(clean_title("Neues AngebotLeica M6"), "Leica M6");
        assert_eq!(clean_title("  Neues Angebot  Leica M6 "), "Leica M6");
        assert_eq!(clean_title("Leica M6"), "Leica M6");
    }

    #[test]
    fn validity_gate_rejects_placeholders_and_meta_links() {
        assert!(is_valid_listing("Leica", "EUR 1,00", "https://x/itm/1"));
        assert!(!is_valid_listing("", "EUR 1,00", "https://x/itm/1"));
        assert!(!is_valid_listing("Leica", "", "https://x/itm/1"));
        assert!(!is_valid_listing("Leica", "EUR 1,00", ""));
        assert!(!is_valid_listing("Shop on eBay", "EUR 1,00", "https://x/itm/1"));
        assert!(!is_valid_listing("Leica", "EUR 1,00", "https://x/itm/1?itmmeta=abc"));
    }

    #[test]
    fn auction_signals() {
        assert!(has_auction_signals("2T 3Std", ""));
        assert!(has_auction_signals("", "3 Gebote"));
        assert!(!has_auction_signals("", ""));
    }

    #[test]
    fn extraction_keeps_document_order_and_drops_invalid_blocks() {
        let html = page(&[
            block(
                r#"<a class="s-item__link" href="https://x/itm/meta?itmmeta=1"><div class="s-item__title">Shop on eBay</div></a><span class="s-item__price">EUR 20,00</span>"#,
            ),
            block(
                r#"<a class="s-item__link" href="https://x/itm/2"><div class="s-item__title">Lens</div></a><span class="s-item__price">EUR 150,00</span><span class="s-item__time-left">1T 2Std</span><span class="s-item__watchcount">4 Beobachter</span>"#,
            ),
            block(r#"<div class="s-item__title">No link</div><span class="s-item__price">EUR 5,00</span>"#),
            block(
                r#"<a class="s-item__link" href="https://x/itm/3"><div class="s-item__title">Body</div></a><span class="s-item__price">Preis auf Anfrage</span>"#,
            ),
        ]);

        let listings = extractor().extract(&html).unwrap();
        assert_eq!(listings.len(), 2);

        assert_eq!(listings[0].url, "https://x/itm/2");
        assert!(listings[0].is_auction);
        assert_eq!(listings[0].watchers, 4);
        assert_eq!(listings[0].time_left, Some(TimeLeft::new(1, 2, 0)));
        assert_eq!(listings[0].raw_time_left.as_deref(), Some("1T 2Std"));

        assert_eq!(listings[1].url, "https://x/itm/3");
        assert_eq!(listings[1].price, None);
        assert!(!listings[1].is_auction);
        assert_eq!(listings[1].time_left, None);
        assert_eq!(listings[1].raw_time_left, None);
    }

    #[test]
    fn duplicate_blocks_are_not_deduplicated_at_extraction() {
        let dup = block(
            r#"<a class="s-item__link" href="https://x/itm/9"><div class="s-item__title">Flash</div></a><span class="s-item__price">EUR 30,00</span>"#,
        );
        let listings = extractor().extract(&page(&[dup.clone(), dup])).unwrap();
        assert_eq!(listings.len(), 2);
    }

    #[test]
    fn bids_alone_mark_an_auction() {
        let html = page(&[block(
            r#"<a class="s-item__link" href="https://x/itm/4"><div class="s-item__title">Tripod</div></a><span class="s-item__price">EUR 45,50</span><span class="s-item__bids">1 Gebot</span>"#,
        )]);
        let document = Html::parse_document(&html);
        let item = Selector::parse(".s-item").unwrap();
        let element = document.select(&item).next().unwrap();
        assert!(extractor().is_auction(element));

        let listing = extractor().extract_block(element).unwrap();
        assert!(listing.is_auction);
        assert_eq!(listing.time_left, None);
        assert_eq!(listing.price, Some(45.5));
    }

    #[test]
    fn empty_document_is_a_parse_failure() {
        assert!(matches!(
            extractor().extract("  \n"),
            Err(AdapterError::EmptyDocument)
        ));
    }

    #[test]
    fn page_without_listing_blocks_yields_nothing() {
        let listings = extractor()
            .extract("<html><body><p>Captcha</p></body></html>")
            .unwrap();
        assert!(listings.is_empty());
    }

    #[test]
    fn invalid_selector_is_reported() {
        let selectors = ListingSelectors {
            item: "li[".to_string(),
            ..ListingSelectors::default()
        };
        assert!(matches!(
            ListingExtractor::new(&selectors),
            Err(AdapterError::Selector { .. })
        ));
    }

    #[test]
    fn search_url_form_encodes_query() {
        let http = HttpFetcher::new(Default::default()).unwrap();
        let source = EbaySearchSource::new(http, DEFAULT_SEARCH_URL);
        assert_eq!(
            source.search_url("leica m6 ttl").unwrap(),
            "https://www.ebay.de/sch/i.html?_nkw=leica+m6+ttl"
        );
    }

    #[test]
    fn query_slugs() {
        assert_eq!(query_slug("Leica M6 TTL"), "leica-m6-ttl");
        assert_eq!(query_slug("  canon / ae-1 "), "canon-ae-1");
        assert_eq!(query_slug("!!!"), "query");
    }

    #[tokio::test]
    async fn fixture_source_reads_slugged_page() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("leica-m6.html"), "<html></html>").unwrap();
        let source = FixtureSearchSource::new(dir.path());

        let page = source.fetch_search("Leica M6").await.unwrap();
        assert_eq!(page.body, "<html></html>");

        let missing = source.fetch_search("nikon f3").await;
        assert!(matches!(missing, Err(AdapterError::Fixture { .. })));
    }
}
