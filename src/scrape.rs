use anyhow::{Context, Result};
use rand::seq::SliceRandom;
use rand::Rng;
use scraper::{ElementRef, Html, Selector};
use std::sync::OnceLock;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::config::ScrapeConfig;
use crate::matcher::SearchTerms;
use crate::models::{Listing, Marketplace, Search, NO_PRICE};

const PAGE_PLACEHOLDER: &str = "{PAGENSEARCH}";
const NO_URL: &str = "No url found.";
const NEW_OFFER_PREFIX: &str = "Neues Angebot";

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_2) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Safari/605.1.15",
];

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("GET {url} returned {status}: {body}")]
    Status { url: String, status: u16, body: String },

    #[error("GET {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

#[derive(Debug, Default)]
pub struct FetchedPage {
    pub listings: Vec<Listing>,
    pub has_more: bool,
}

pub trait PageFetcher {
    fn fetch_page(&self, search: &Search, page: u32) -> Result<FetchedPage, FetchError>;
}

struct KleinSelectors {
    item: Selector,
    title: Selector,
    price: Selector,
    shipping: Selector,
    location: Selector,
    link: Selector,
    pagination: Selector,
}

fn klein_selectors() -> &'static KleinSelectors {
    static SELECTORS: OnceLock<KleinSelectors> = OnceLock::new();
    SELECTORS.get_or_init(|| {
        let parse = |css: &str| Selector::parse(css).expect("Invalid selector");
        KleinSelectors {
            item: parse("#srchrslt-adtable .ad-listitem.lazyload-item article"),
            title: parse(".ellipsis"),
            price: parse(".aditem-main--middle--price-shipping--price"),
            shipping: parse(".aditem-main--middle--price-shipping--shipping"),
            location: parse(".aditem-main--top--left"),
            link: parse("a[href]"),
            pagination: parse(".pagination-pages"),
        }
    })
}

struct EbaySelectors {
    item: Selector,
    title: Selector,
    price: Selector,
    shipping: Selector,
    link: Selector,
}

fn ebay_selectors() -> &'static EbaySelectors {
    static SELECTORS: OnceLock<EbaySelectors> = OnceLock::new();
    SELECTORS.get_or_init(|| {
        let parse = |css: &str| Selector::parse(css).expect("Invalid selector");
        EbaySelectors {
            item: parse(".b-list__items_nofooter .s-item.s-item--large"),
            title: parse(".s-item__title"),
            price: parse(".s-item__price"),
            shipping: parse(".s-item__shipping.s-item__logisticsCost"),
            link: parse("a[href]"),
        }
    })
}

/// Whitespace-normalised text of the first match, `None` when missing or blank.
fn text_of(element: ElementRef, selector: &Selector) -> Option<String> {
    let el = element.select(selector).next()?;
    let text = el.text().flat_map(str::split_whitespace).collect::<Vec<_>>().join(" ");
    (!text.is_empty()).then_some(text)
}

/// Result page URL: `{PAGENSEARCH}` becomes `seite:N/` (from page 2 on)
/// followed by the lowercased include terms joined with `-`.
pub fn klein_url(base_url: &str, search: &Search, page: u32) -> String {
    let mut segment = String::new();
    if page > 1 {
        segment.push_str(&format!("seite:{}/", page));
    }
    let terms = SearchTerms::parse(&search.search_string, &[])
        .include_terms()
        .map(str::to_string)
        .collect::<Vec<_>>();
    if !terms.is_empty() {
        segment.push_str(&terms.join("-"));
        segment.push('/');
    }
    format!(
        "{}{}",
        base_url.trim_end_matches('/'),
        search.url.replace(PAGE_PLACEHOLDER, &segment)
    )
}

pub fn ebay_url(base_url: &str, search: &Search) -> String {
    format!("{}{}", base_url.trim_end_matches('/'), search.url)
}

/// Listings of one result page plus the number of pages the pager shows.
pub fn parse_klein_page(html: &str, base_url: &str) -> (Vec<Listing>, u32) {
    let document = Html::parse_document(html);
    let sel = klein_selectors();
    let base_url = base_url.trim_end_matches('/');

    let mut listings = Vec::new();
    for article in document.select(&sel.item) {
        let Some(source_id) = article
            .value()
            .attr("data-adid")
            .and_then(|id| id.trim().parse::<u64>().ok())
        else {
            debug!("Skipping ad without a numeric data-adid");
            continue;
        };

        let mut listing = Listing::new(source_id, Marketplace::Klein);
        if let Some(title) = text_of(article, &sel.title) {
            listing.title = title;
        }
        if let Some(price) = text_of(article, &sel.price) {
            listing.raw_price = price;
        }
        if let Some(shipping) = text_of(article, &sel.shipping) {
            listing.shipping_text = shipping;
        }
        if let Some(location) = text_of(article, &sel.location) {
            listing.location_text = location;
        }
        listing.link = article
            .select(&sel.link)
            .next()
            .and_then(|a| a.value().attr("href"))
            .filter(|href| !href.is_empty())
            .map(|href| format!("{}{}", base_url, href))
            .unwrap_or_else(|| NO_URL.to_string());
        listings.push(listing);
    }

    let pages_found = document
        .select(&sel.pagination)
        .next()
        // every element below the pager counts, wrappers included
        .map(|pager| pager.descendants().skip(1).filter_map(ElementRef::wrap).count() as u32)
        .unwrap_or(0);

    (listings, pages_found)
}

/// "EUR 123,45" becomes "123 €".
fn ebay_price(text: &str) -> String {
    let amount = text.trim().trim_start_matches("EUR").trim();
    let whole = amount.split(',').next().unwrap_or(amount).trim();
    format!("{} €", whole)
}

pub fn parse_ebay_page(html: &str) -> Vec<Listing> {
    let document = Html::parse_document(html);
    let sel = ebay_selectors();

    let mut listings = Vec::new();
    for item in document.select(&sel.item) {
        let Some(href) = item.select(&sel.link).next().and_then(|a| a.value().attr("href")) else {
            continue;
        };
        let link = href.split('?').next().unwrap_or(href);
        let Some(source_id) = link.rsplit('/').next().and_then(|id| id.parse::<u64>().ok()) else {
            debug!(href, "Skipping item without a numeric id");
            continue;
        };

        let mut listing = Listing::new(source_id, Marketplace::Ebay);
        listing.link = link.to_string();
        listing.location_text = "Ebay".to_string();
        if let Some(title) = text_of(item, &sel.title) {
            let title = title.strip_prefix(NEW_OFFER_PREFIX).unwrap_or(&title).trim();
            if !title.is_empty() {
                listing.title = title.to_string();
            }
        }
        listing.raw_price = text_of(item, &sel.price)
            .map(|p| ebay_price(&p))
            .unwrap_or_else(|| NO_PRICE.to_string());
        if let Some(shipping) = text_of(item, &sel.shipping) {
            listing.shipping_text = shipping;
        }
        listings.push(listing);
    }
    listings
}

/// Fetches marketplace result pages over HTTP with a rotating User-Agent.
pub struct HttpPageFetcher {
    client: reqwest::blocking::Client,
    klein_base_url: String,
    ebay_base_url: String,
}

impl HttpPageFetcher {
    pub fn new(config: &ScrapeConfig) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            klein_base_url: config.klein_base_url.clone(),
            ebay_base_url: config.ebay_base_url.clone(),
        })
    }

    fn get(&self, url: &str) -> Result<String, FetchError> {
        let user_agent = USER_AGENTS
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or(USER_AGENTS[0]);
        let transport = |source| FetchError::Transport {
            url: url.to_string(),
            source,
        };

        let response = self
            .client
            .get(url)
            .header(reqwest::header::USER_AGENT, user_agent)
            .header(reqwest::header::ACCEPT_LANGUAGE, "de-DE,de;q=0.9")
            .send()
            .map_err(transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
                body: body.chars().take(500).collect(),
            });
        }
        response.text().map_err(transport)
    }
}

impl PageFetcher for HttpPageFetcher {
    fn fetch_page(&self, search: &Search, page: u32) -> Result<FetchedPage, FetchError> {
        match search.marketplace {
            Marketplace::Klein => {
                let url = klein_url(&self.klein_base_url, search, page);
                debug!(search_id = search.id, page, url = %url, "Fetching result page");
                let html = self.get(&url)?;
                let (listings, pages_found) = parse_klein_page(&html, &self.klein_base_url);
                Ok(FetchedPage {
                    listings,
                    has_more: page < pages_found,
                })
            }
            Marketplace::Ebay => {
                let url = ebay_url(&self.ebay_base_url, search);
                debug!(search_id = search.id, url = %url, "Fetching result page");
                let html = self.get(&url)?;
                Ok(FetchedPage {
                    listings: parse_ebay_page(&html),
                    has_more: false,
                })
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct Collected {
    pub listings: Vec<Listing>,
    pub pages: u32,
    pub failed: bool,
}

/// Pages through a search up to `depth` pages. A failing page ends the walk;
/// listings from earlier pages are kept.
pub fn collect_listings(
    fetcher: &dyn PageFetcher,
    search: &Search,
    depth: u32,
    page_delay_max_ms: u64,
) -> Collected {
    let mut collected = Collected::default();
    let depth = depth.max(1);

    for page in 1..=depth {
        match fetcher.fetch_page(search, page) {
            Ok(fetched) => {
                collected.pages += 1;
                collected.listings.extend(fetched.listings);
                if !fetched.has_more || page == depth {
                    break;
                }
            }
            Err(e) => {
                error!(search_id = search.id, page, error = %e, "Fetching result page failed");
                collected.failed = true;
                break;
            }
        }

        if page_delay_max_ms > 0 {
            let delay = rand::thread_rng().gen_range(0..=page_delay_max_ms);
            thread::sleep(Duration::from_millis(delay));
        }
    }

    info!(
        search_id = search.id,
        pages = collected.pages,
        listings = collected.listings.len(),
        "Collected listings"
    );
    collected
}
