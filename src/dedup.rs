use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::{debug, error};

use crate::db::Database;
use crate::models::{Listing, Marketplace, PersistedPost, PersistedPostPatch};

/// Posts written during one run, layered over the store.
///
/// Every write of the run lands here as well; with `write_database == false`
/// it lands only here. Later searches of the same run read through it and so
/// see the same rows in a dry run as in a persisting one.
#[derive(Debug, Default)]
pub struct RunLedger {
    posts: HashMap<(Marketplace, String), PersistedPost>,
}

impl RunLedger {
    pub fn get_post(
        &self,
        db: &Database,
        marketplace: Marketplace,
        post_id: &str,
    ) -> Result<Option<PersistedPost>> {
        match self.posts.get(&(marketplace, post_id.to_string())) {
            Some(post) => Ok(Some(post.clone())),
            None => db.get_post(marketplace, post_id),
        }
    }

    /// Unclaimed posts: store rows untouched this run, then rows written this
    /// run ordered by post id.
    pub fn unlinked_posts(&self, db: &Database, marketplace: Marketplace) -> Result<Vec<PersistedPost>> {
        let mut posts: Vec<PersistedPost> = db
            .unlinked_posts(marketplace)?
            .into_iter()
            .filter(|post| !self.posts.contains_key(&(marketplace, post.post_id.clone())))
            .collect();

        let mut written: Vec<PersistedPost> = self
            .posts
            .iter()
            .filter(|((m, _), post)| *m == marketplace && post.link_id.is_none())
            .map(|(_, post)| post.clone())
            .collect();
        written.sort_by(|a, b| a.post_id.cmp(&b.post_id));

        posts.extend(written);
        Ok(posts)
    }

    pub fn create_post(&mut self, db: &Database, post: PersistedPost, write_database: bool) -> Result<()> {
        if write_database {
            db.create_post(&post)?;
        }
        self.posts.insert((post.marketplace, post.post_id.clone()), post);
        Ok(())
    }

    pub fn update_post(
        &mut self,
        db: &Database,
        stored: &PersistedPost,
        patch: &PersistedPostPatch,
        write_database: bool,
    ) -> Result<()> {
        if write_database {
            db.update_post(stored.marketplace, &stored.post_id, patch)?;
        }
        let mut post = stored.clone();
        if let Some(price) = &patch.price {
            post.price = price.clone();
        }
        if let Some(link_id) = patch.link_id {
            post.link_id = Some(link_id);
        }
        self.posts.insert((post.marketplace, post.post_id.clone()), post);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreChange {
    Created,
    Linked,
    Repriced,
    Ingested,
}

impl StoreChange {
    pub fn as_char(&self) -> char {
        match self {
            StoreChange::Created => 'C',
            StoreChange::Linked => 'u',
            StoreChange::Repriced => 'U',
            StoreChange::Ingested => 'E',
        }
    }
}

#[derive(Debug, Default)]
pub struct Reconciliation {
    /// New or repriced listings, in scrape order.
    pub candidates: Vec<Listing>,
    pub changes: Vec<StoreChange>,
    pub failures: usize,
}

impl Reconciliation {
    pub fn change_log(&self) -> String {
        self.changes.iter().map(StoreChange::as_char).collect()
    }
}

impl fmt::Display for Reconciliation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.changes.is_empty() {
            f.write_str("Nothing new for DB.")
        } else {
            write!(f, "Changes in DB: {}", self.change_log())
        }
    }
}

/// Reconciles scraped listings of one search against the store.
///
/// With `write_database == false` nothing is written but the emitted
/// candidates are the same as for a persisting run.
pub fn reconcile(
    db: &Database,
    ledger: &mut RunLedger,
    listings: Vec<Listing>,
    search_id: i64,
    write_database: bool,
) -> Reconciliation {
    let mut outcome = Reconciliation::default();
    let mut seen = HashSet::new();

    for mut listing in listings {
        let post_id = listing.post_id();
        // the same ad can show up on two result pages
        if !seen.insert(post_id.clone()) {
            continue;
        }

        let stored = match ledger.get_post(db, listing.marketplace, &post_id) {
            Ok(stored) => stored,
            Err(e) => {
                error!(post_id = %post_id, error = %e, "Post lookup failed");
                outcome.failures += 1;
                continue;
            }
        };

        let Some(mut stored) = stored else {
            let post = PersistedPost::from_listing(&listing, Some(search_id));
            if let Err(e) = ledger.create_post(db, post, write_database) {
                error!(post_id = %post_id, error = %e, "Failed to store new post");
                outcome.failures += 1;
                continue;
            }
            debug!(post_id = %post_id, search_id, "New post");
            outcome.changes.push(StoreChange::Created);
            outcome.candidates.push(listing);
            continue;
        };

        if stored.link_id.is_none() {
            let patch = PersistedPostPatch {
                link_id: Some(search_id),
                ..Default::default()
            };
            if apply_patch(db, ledger, &stored, &patch, write_database) {
                outcome.changes.push(StoreChange::Linked);
                stored.link_id = Some(search_id);
            } else {
                outcome.failures += 1;
            }
        }

        if stored.price != listing.raw_price {
            let patch = PersistedPostPatch {
                price: Some(listing.raw_price.clone()),
                ..Default::default()
            };
            if !apply_patch(db, ledger, &stored, &patch, write_database) {
                outcome.failures += 1;
                continue;
            }
            debug!(post_id = %post_id, old = %stored.price, new = %listing.raw_price, "Price changed");
            listing.old_price = Some(stored.price);
            outcome.changes.push(StoreChange::Repriced);
            outcome.candidates.push(listing);
        }
    }

    outcome
}

/// False when the write failed; a dry run always succeeds.
fn apply_patch(
    db: &Database,
    ledger: &mut RunLedger,
    stored: &PersistedPost,
    patch: &PersistedPostPatch,
    write_database: bool,
) -> bool {
    match ledger.update_post(db, stored, patch, write_database) {
        Ok(()) => true,
        Err(e) => {
            error!(post_id = %stored.post_id, error = %e, "Failed to update post");
            false
        }
    }
}

/// Stores listings of a plain URL watch as unclaimed rows for later matching.
pub fn ingest_unlinked(
    db: &Database,
    ledger: &mut RunLedger,
    listings: Vec<Listing>,
    write_database: bool,
) -> Reconciliation {
    let mut outcome = Reconciliation::default();
    let mut seen = HashSet::new();

    for listing in listings {
        let post_id = listing.post_id();
        if !seen.insert(post_id.clone()) {
            continue;
        }
        match ledger.get_post(db, listing.marketplace, &post_id) {
            Ok(Some(_)) => {}
            Ok(None) => {
                let post = PersistedPost::from_listing(&listing, None);
                if let Err(e) = ledger.create_post(db, post, write_database) {
                    error!(post_id = %post_id, error = %e, "Failed to store unclaimed post");
                    outcome.failures += 1;
                    continue;
                }
                outcome.changes.push(StoreChange::Ingested);
                outcome.candidates.push(listing);
            }
            Err(e) => {
                error!(post_id = %post_id, error = %e, "Post lookup failed");
                outcome.failures += 1;
            }
        }
    }

    outcome
}
