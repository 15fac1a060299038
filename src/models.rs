use anyhow::{anyhow, bail, Context, Result};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Marketplace {
    Klein,
    Ebay,
}

impl Marketplace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Marketplace::Klein => "KLEIN",
            Marketplace::Ebay => "EBAY",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value.to_ascii_uppercase().as_str() {
            "KLEIN" => Ok(Marketplace::Klein),
            "EBAY" => Ok(Marketplace::Ebay),
            other => Err(anyhow!("Unknown marketplace '{}'. Use KLEIN or EBAY", other)),
        }
    }

    /// Table holding the persisted posts of this marketplace.
    pub fn post_table(&self) -> &'static str {
        match self {
            Marketplace::Klein => "klein_posts",
            Marketplace::Ebay => "ebay_posts",
        }
    }
}

impl fmt::Display for Marketplace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingOrigin {
    Scraped,
    CrossSource,
}

/// A single scraped ad. Lives for one run only.
#[derive(Debug, Clone)]
pub struct Listing {
    pub source_id: u64,
    pub marketplace: Marketplace,
    pub title: String,
    pub raw_price: String,
    pub shipping_text: String,
    pub location_text: String,
    pub link: String,
    pub origin: ListingOrigin,
    // filled in while evaluating
    pub old_price: Option<String>,
    pub price_hint: Option<String>,
    pub price_range_display: Option<String>,
    pub is_priority_eligible: bool,
}

pub const NO_TITLE: &str = "No Title";
pub const NO_PRICE: &str = "No Price";
pub const NO_SHIPPING: &str = "No Shipping";
pub const NO_LOCATION: &str = "No location";

impl Listing {
    pub fn new(source_id: u64, marketplace: Marketplace) -> Self {
        Self {
            source_id,
            marketplace,
            title: NO_TITLE.to_string(),
            raw_price: NO_PRICE.to_string(),
            shipping_text: NO_SHIPPING.to_string(),
            location_text: NO_LOCATION.to_string(),
            link: String::new(),
            origin: ListingOrigin::Scraped,
            old_price: None,
            price_hint: None,
            price_range_display: None,
            is_priority_eligible: false,
        }
    }

    pub fn post_id(&self) -> String {
        self.source_id.to_string()
    }

    /// Pickup-only listings are the ones subject to the geofence.
    pub fn is_pickup_only(&self) -> bool {
        self.shipping_text == NO_SHIPPING
    }
}

/// Durable projection of a listing, one row per `post_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedPost {
    pub post_id: String,
    pub marketplace: Marketplace,
    pub price: String,
    pub link_id: Option<i64>,
    pub title: String,
    pub shipping: Option<String>,
}

impl PersistedPost {
    pub fn from_listing(listing: &Listing, link_id: Option<i64>) -> Self {
        Self {
            post_id: listing.post_id(),
            marketplace: listing.marketplace,
            price: listing.raw_price.clone(),
            link_id,
            title: listing.title.clone(),
            shipping: Some(listing.shipping_text.clone()),
        }
    }
}

/// Field-level update of a stored post. `None` leaves the column untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PersistedPostPatch {
    pub price: Option<String>,
    pub link_id: Option<i64>,
}

impl PersistedPostPatch {
    pub fn is_empty(&self) -> bool {
        self.price.is_none() && self.link_id.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchStatus {
    Disabled = 0,
    Active = 1,
    Silent = 2,
}

impl SearchStatus {
    pub fn from_code(code: i64) -> Result<Self> {
        match code {
            0 => Ok(SearchStatus::Disabled),
            1 => Ok(SearchStatus::Active),
            2 => Ok(SearchStatus::Silent),
            other => Err(anyhow!("Invalid search status {} (expected 0, 1 or 2)", other)),
        }
    }

    pub fn code(&self) -> i64 {
        *self as i64
    }
}

impl fmt::Display for SearchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SearchStatus::Disabled => "disabled",
            SearchStatus::Active => "active",
            SearchStatus::Silent => "silent",
        };
        f.write_str(label)
    }
}

/// One entry of a structured multi-target table (`label:target`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceTarget {
    pub label: String,
    pub target: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PricePolicy {
    Target {
        target: i64,
        price_info: Vec<PriceTarget>,
    },
    Range {
        low: i64,
        high: i64,
    },
}

impl fmt::Display for PricePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PricePolicy::Target { target, .. } => write!(f, "'TARGET 0' = {}€", target),
            PricePolicy::Range { low, high } => write!(f, "RANGE {}€ - {}€", low, high),
        }
    }
}

/// Parses `label:target-label:target-...`.
pub fn parse_price_info(raw: &str) -> Result<Vec<PriceTarget>> {
    raw.split('-')
        .filter(|entry| !entry.trim().is_empty())
        .map(|entry| {
            let (label, target) = entry
                .split_once(':')
                .ok_or_else(|| anyhow!("Price info entry '{}' is missing ':'", entry))?;
            let target = target
                .trim()
                .parse::<i64>()
                .with_context(|| format!("Invalid target in price info entry '{}'", entry))?;
            Ok(PriceTarget {
                label: label.trim().to_string(),
                target,
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistanceGroup {
    pub max_distance_km: u32,
    pub zipcodes: Vec<String>,
}

/// Parses `dist,zip,zip-dist,zip,...` into ordered distance groups.
pub fn parse_distance_groups(raw: &str) -> Result<Vec<DistanceGroup>> {
    let mut groups = Vec::new();
    for area in raw.split('-').map(str::trim).filter(|a| !a.is_empty()) {
        let mut parts = area.split(',').map(str::trim);
        let distance = parts.next().unwrap_or_default();
        let max_distance_km = distance
            .parse::<u32>()
            .with_context(|| format!("Invalid distance '{}' in area '{}'", distance, area))?;
        let zipcodes: Vec<String> = parts
            .filter(|zip| !zip.is_empty())
            .map(str::to_string)
            .collect();
        if zipcodes.is_empty() {
            bail!("Area '{}' has a distance but no zipcodes", area);
        }
        groups.push(DistanceGroup {
            max_distance_km,
            zipcodes,
        });
    }
    Ok(groups)
}

/// A configured watch, validated from its stored row.
#[derive(Debug, Clone)]
pub struct Search {
    pub id: i64,
    pub marketplace: Marketplace,
    pub url: String,
    pub search_string: String,
    pub status: SearchStatus,
    pub policy: PricePolicy,
    pub zipcodes: Option<Vec<DistanceGroup>>,
    pub chat_id: Option<String>,
}

/// Raw `searches` row as stored.
#[derive(Debug, Clone, Default)]
pub struct SearchRow {
    pub id: i64,
    pub marketplace: String,
    pub url: String,
    pub search_string: String,
    pub status: i64,
    pub price_low: Option<i64>,
    pub price_high: Option<i64>,
    pub price_target: Option<i64>,
    pub price_info: Option<String>,
    pub zipcodes: Option<String>,
    pub chat_id: Option<String>,
}

impl TryFrom<SearchRow> for Search {
    type Error = anyhow::Error;

    fn try_from(row: SearchRow) -> Result<Self> {
        let marketplace = Marketplace::parse(&row.marketplace)?;
        let status = SearchStatus::from_code(row.status)?;

        let policy = match (row.price_target, row.price_low, row.price_high) {
            (Some(target), _, _) => PricePolicy::Target {
                target,
                price_info: match row.price_info.as_deref() {
                    Some(raw) if !raw.trim().is_empty() => parse_price_info(raw)?,
                    _ => Vec::new(),
                },
            },
            (None, Some(low), Some(high)) => {
                if low > high {
                    bail!("Search {} has price_low {} above price_high {}", row.id, low, high);
                }
                PricePolicy::Range { low, high }
            }
            _ => bail!(
                "Search {} has no pricing policy (set price_target or price_low/price_high)",
                row.id
            ),
        };

        let zipcodes = match row.zipcodes.as_deref() {
            Some(raw) if !raw.trim().is_empty() => Some(
                parse_distance_groups(raw)
                    .with_context(|| format!("Invalid zipcodes for search {}", row.id))?,
            ),
            _ => None,
        };

        Ok(Search {
            id: row.id,
            marketplace,
            url: row.url,
            search_string: row.search_string,
            status,
            policy,
            zipcodes,
            chat_id: row.chat_id.filter(|c| !c.trim().is_empty()),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceCode {
    Excluded,
    Offer,
    InTarget,
    Bargain,
    NearTarget,
    Negligible,
    AboveRange,
    BelowRange,
    GeofenceChecked,
    InArea,
    OutOfArea,
    GeocodeFailed,
}

impl TraceCode {
    pub fn as_char(&self) -> char {
        match self {
            TraceCode::Excluded => 'f',
            TraceCode::Offer => 'o',
            TraceCode::InTarget => 'X',
            TraceCode::Bargain => 'b',
            TraceCode::NearTarget => 'n',
            TraceCode::Negligible => 'v',
            TraceCode::AboveRange => 'h',
            TraceCode::BelowRange => 'l',
            TraceCode::GeofenceChecked => '?',
            TraceCode::InArea => '+',
            TraceCode::OutOfArea => '-',
            TraceCode::GeocodeFailed => '!',
        }
    }
}

/// Ordered, append-only decision log for one listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvaluationTrace(Vec<TraceCode>);

impl EvaluationTrace {
    pub fn push(&mut self, code: TraceCode) {
        self.0.push(code);
    }

    pub fn codes(&self) -> &[TraceCode] {
        &self.0
    }
}

impl fmt::Display for EvaluationTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.codes().iter().try_for_each(|code| write!(f, "{}", code.as_char()))
    }
}
