use anyhow::Result;
use tracing::{debug, error, warn};

use crate::config::ScrapeConfig;
use crate::db::Database;
use crate::dedup::RunLedger;
use crate::matcher::TitleMatcher;
use crate::models::{
    Listing, ListingOrigin, Marketplace, PersistedPost, PersistedPostPatch, Search, NO_SHIPPING,
};

pub const CROSS_SOURCE_LOCATION: &str = "Ebay";

/// Builds the listing view of an unclaimed marketplace-B post.
pub fn listing_from_post(post: &PersistedPost, scrape: &ScrapeConfig) -> Option<Listing> {
    let source_id = match post.post_id.parse::<u64>() {
        Ok(id) => id,
        Err(_) => {
            warn!(post_id = %post.post_id, "Skipping post with non-numeric id");
            return None;
        }
    };

    let mut listing = Listing::new(source_id, post.marketplace);
    listing.title = post.title.clone();
    listing.raw_price = post.price.clone();
    listing.shipping_text = post
        .shipping
        .clone()
        .unwrap_or_else(|| NO_SHIPPING.to_string());
    listing.location_text = CROSS_SOURCE_LOCATION.to_string();
    listing.link = scrape.ebay_item_url(&post.post_id);
    listing.origin = ListingOrigin::CrossSource;
    listing.is_priority_eligible = true;
    Some(listing)
}

/// Claims unmatched EBAY posts whose title fits a KLEIN search.
///
/// Claims go through the run's `ledger`, so a dry run hands each post to one
/// search only, as a persisting run would.
pub fn enrich(
    db: &Database,
    ledger: &mut RunLedger,
    search: &Search,
    matcher: &TitleMatcher,
    scrape: &ScrapeConfig,
    write_database: bool,
) -> Result<Vec<Listing>> {
    if search.marketplace != Marketplace::Klein {
        return Ok(Vec::new());
    }

    let terms = matcher.terms(&search.search_string);
    let mut promoted = Vec::new();

    for post in ledger.unlinked_posts(db, Marketplace::Ebay)? {
        if !terms.matches(&post.title) {
            continue;
        }
        let Some(listing) = listing_from_post(&post, scrape) else {
            continue;
        };

        let patch = PersistedPostPatch {
            link_id: Some(search.id),
            ..Default::default()
        };
        if let Err(e) = ledger.update_post(db, &post, &patch, write_database) {
            error!(post_id = %post.post_id, error = %e, "Failed to claim post");
            continue;
        }

        debug!(post_id = %post.post_id, search_id = search.id, "Claimed cross-source post");
        promoted.push(listing);
    }

    Ok(promoted)
}
