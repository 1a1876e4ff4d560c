//! Core listing model and search criteria evaluation for bidwatch.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "bidwatch-core";

/// Remaining auction time (or a time ceiling), compared by total minutes.
///
/// The days/hours/minutes breakdown is not canonical: `{0, 25, 0}` and `{1, 1, 0}` are equal.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TimeLeft {
    #[serde(default)]
    pub days: u32,
    #[serde(default)]
    pub hours: u32,
    #[serde(default)]
    pub minutes: u32,
}

impl TimeLeft {
    pub const fn new(days: u32, hours: u32, minutes: u32) -> Self {
        Self {
            days,
            hours,
            minutes,
        }
    }

    pub fn total_minutes(&self) -> u64 {
        u64::from(self.days) * 24 * 60 + u64::from(self.hours) * 60 + u64::from(self.minutes)
    }
}

impl PartialEq for TimeLeft {
    fn eq(&self, other: &Self) -> bool {
        self.total_minutes() == other.total_minutes()
    }
}

impl Eq for TimeLeft {}

impl PartialOrd for TimeLeft {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimeLeft {
    fn cmp(&self, other: &Self) -> Ordering {
        self.total_minutes().cmp(&other.total_minutes())
    }
}

impl fmt::Display for TimeLeft {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}d {}h {}m", self.days, self.hours, self.minutes)
    }
}

/// Which listing formats a search admits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingTypeFilter {
    #[default]
    Any,
    FixedPriceOnly,
    AuctionOnly,
}

impl ListingTypeFilter {
    /// Maps the legacy numeric listing type codes (0 = all, 1 = buy-now, 2 = auction).
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Any),
            1 => Some(Self::FixedPriceOnly),
            2 => Some(Self::AuctionOnly),
            _ => None,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "any" | "all" => Some(Self::Any),
            "fixed_price" | "fixed_price_only" | "buy_now" => Some(Self::FixedPriceOnly),
            "auction" | "auction_only" | "auctions" => Some(Self::AuctionOnly),
            _ => None,
        }
    }
}

impl fmt::Display for ListingTypeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Any => "any",
            Self::FixedPriceOnly => "fixed price only",
            Self::AuctionOnly => "auction only",
        };
        f.write_str(label)
    }
}

/// One extracted marketplace item with normalized fields.
///
/// Built only when title, raw price and url are all non-empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub title: String,
    pub raw_price: String,
    /// `None` when the price text could not be parsed.
    pub price: Option<f64>,
    pub url: String,
    pub is_auction: bool,
    pub watchers: u32,
    pub time_left: Option<TimeLeft>,
    #[serde(default)]
    pub raw_time_left: Option<String>,
}

/// Filter bounds configured for one monitored query. `None` means unbounded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchCriteria {
    pub listing_type: ListingTypeFilter,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    pub min_watchers: Option<u32>,
    pub max_watchers: Option<u32>,
    pub max_time_left: Option<TimeLeft>,
}

/// The individual checks evaluated by [`matches`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterCheck {
    Price,
    ListingType,
    TimeLeft,
    Watchers,
}

impl fmt::Display for FilterCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Price => "price range",
            Self::ListingType => "listing type",
            Self::TimeLeft => "time left ceiling",
            Self::Watchers => "watcher range",
        };
        f.write_str(label)
    }
}

pub fn price_in_range(price: Option<f64>, criteria: &SearchCriteria) -> bool {
    let Some(price) = price else {
        return false;
    };
    if price < 0.0 || price.is_nan() {
        return false;
    }
    if criteria.min_price.is_some_and(|min| price < min) {
        return false;
    }
    if criteria.max_price.is_some_and(|max| price > max) {
        return false;
    }
    true
}

pub fn listing_type_allowed(is_auction: bool, filter: ListingTypeFilter) -> bool {
    match filter {
        ListingTypeFilter::Any => true,
        ListingTypeFilter::FixedPriceOnly => !is_auction,
        ListingTypeFilter::AuctionOnly => is_auction,
    }
}

/// Time ceilings only apply to auction-only searches.
pub fn time_left_within(time_left: Option<TimeLeft>, criteria: &SearchCriteria) -> bool {
    if criteria.listing_type != ListingTypeFilter::AuctionOnly {
        return true;
    }
    let Some(ceiling) = criteria.max_time_left else {
        return true;
    };
    match time_left {
        Some(remaining) => remaining.total_minutes() <= ceiling.total_minutes(),
        None => false,
    }
}

pub fn watchers_in_range(watchers: u32, criteria: &SearchCriteria) -> bool {
    if criteria.min_watchers.is_some_and(|min| watchers < min) {
        return false;
    }
    if criteria.max_watchers.is_some_and(|max| watchers > max) {
        return false;
    }
    true
}

/// Returns the first check the listing fails, or `None` when it matches.
pub fn rejection(listing: &Listing, criteria: &SearchCriteria) -> Option<FilterCheck> {
    if !price_in_range(listing.price, criteria) {
        return Some(FilterCheck::Price);
    }
    if !listing_type_allowed(listing.is_auction, criteria.listing_type) {
        return Some(FilterCheck::ListingType);
    }
    if !time_left_within(listing.time_left, criteria) {
        return Some(FilterCheck::TimeLeft);
    }
    if !watchers_in_range(listing.watchers, criteria) {
        return Some(FilterCheck::Watchers);
    }
    None
}

pub fn matches(listing: &Listing, criteria: &SearchCriteria) -> bool {
    rejection(listing, criteria).is_none()
}

/// Durable record of a newly reported listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoundListing {
    pub item: Listing,
    pub found: DateTime<Utc>,
    pub query: String,
}
