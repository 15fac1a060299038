use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::db::Database;
use crate::dedup::{self, RunLedger};
use crate::enrich;
use crate::geofence::{self, GeofenceOutcome, Geocoder};
use crate::matcher::TitleMatcher;
use crate::models::{
    DistanceGroup, EvaluationTrace, Listing, Marketplace, Search, SearchStatus, TraceCode,
};
use crate::notify::{self, DispatchRequest, MessageDispatcher};
use crate::pricing::{self, PriceSettings};
use crate::scrape::{self, PageFetcher};

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// `false` for `--nonperm`: decisions are made but nothing is stored.
    pub write_database: bool,
    /// `false` for `--silent`.
    pub send_messages: bool,
    pub exclusive: Option<i64>,
    pub depth: u32,
    pub verbose: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            write_database: true,
            send_messages: true,
            exclusive: None,
            depth: 1,
            verbose: false,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunStats {
    pub searches: usize,
    pub skipped_searches: usize,
    pub fetch_failures: usize,
    pub listings_scraped: usize,
    pub candidates: usize,
    pub worth_messaging: usize,
    pub messages_sent: usize,
    pub dispatch_failures: usize,
    pub store_failures: usize,
}

/// Area decision for one listing, when the geofence ran.
#[derive(Debug, Clone, PartialEq)]
pub enum AreaCheck {
    Resolved(GeofenceOutcome),
    /// The listing location could not be geocoded.
    Unresolved,
}

/// Outcome of running one candidate through matcher, pricing and geofence.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub listing: Listing,
    pub trace: EvaluationTrace,
    pub excluded: bool,
    pub area: Option<AreaCheck>,
    pub worth_messaging: bool,
    pub dispatches: Vec<DispatchRequest>,
}

impl Evaluation {
    /// Whether the trace belongs in the per-search summary line.
    pub fn is_reported(&self) -> bool {
        self.worth_messaging || self.excluded || self.area.is_some()
    }
}

pub struct Engine<'a> {
    db: &'a Database,
    fetcher: &'a dyn PageFetcher,
    geocoder: &'a dyn Geocoder,
    dispatcher: &'a dyn MessageDispatcher,
    config: &'a Config,
    options: RunOptions,
    matcher: TitleMatcher,
    fallback_groups: Vec<DistanceGroup>,
}

impl<'a> Engine<'a> {
    pub fn new(
        db: &'a Database,
        fetcher: &'a dyn PageFetcher,
        geocoder: &'a dyn Geocoder,
        dispatcher: &'a dyn MessageDispatcher,
        config: &'a Config,
        options: RunOptions,
    ) -> Result<Self> {
        let fallback_groups = config.geofence.fallback_groups()?;
        Ok(Self {
            db,
            fetcher,
            geocoder,
            dispatcher,
            config,
            options,
            matcher: TitleMatcher::new(config.matcher.implicit_exclusions.clone()),
            fallback_groups,
        })
    }

    fn price_settings(&self) -> PriceSettings {
        PriceSettings {
            target_benefit: self.config.pricing.target_benefit,
            verbose: self.options.verbose,
        }
    }

    /// One batch pass over all configured searches.
    ///
    /// Individual searches that fail are logged and skipped. Only a store
    /// that cannot be read or a geocoding failure under `fail_fast` ends the
    /// run early.
    pub fn run(&self) -> Result<RunStats> {
        let mut stats = RunStats::default();
        let mut ledger = RunLedger::default();

        for row in self.db.list_search_rows()? {
            if self.options.exclusive.is_some_and(|id| id != row.id) {
                continue;
            }
            let id = row.id;
            let search = match Search::try_from(row) {
                Ok(search) => search,
                Err(e) => {
                    error!(search_id = id, error = %e, "Skipping invalid search");
                    stats.skipped_searches += 1;
                    continue;
                }
            };
            if search.status == SearchStatus::Disabled {
                continue;
            }

            stats.searches += 1;
            match search.marketplace {
                Marketplace::Ebay => self.run_ingestion(&search, &mut ledger, &mut stats),
                Marketplace::Klein => self.run_search(&search, &mut ledger, &mut stats)?,
            }
        }

        info!(?stats, "Run finished");
        Ok(stats)
    }

    fn area_hint(&self, search: &Search) -> &'static str {
        if search.zipcodes.is_some() {
            " (Area from: search)"
        } else if !self.fallback_groups.is_empty() {
            " (Area from: config)"
        } else {
            ""
        }
    }

    fn run_ingestion(&self, search: &Search, ledger: &mut RunLedger, stats: &mut RunStats) {
        println!(">> Searching ID:{}: type '{}'", search.id, search.marketplace);

        let collected = scrape::collect_listings(
            self.fetcher,
            search,
            1,
            self.config.scrape.page_delay_max_ms,
        );
        if collected.failed {
            stats.fetch_failures += 1;
        }
        stats.listings_scraped += collected.listings.len();

        let outcome = dedup::ingest_unlinked(
            self.db,
            ledger,
            collected.listings,
            self.options.write_database,
        );
        stats.store_failures += outcome.failures;
        println!("  {}", outcome);
    }

    fn run_search(
        &self,
        search: &Search,
        ledger: &mut RunLedger,
        stats: &mut RunStats,
    ) -> Result<()> {
        println!(
            ">> Searching ID:{}: type '{}', filter '{}', mode: {}{}",
            search.id,
            search.marketplace,
            search.search_string,
            search.policy,
            self.area_hint(search)
        );

        let collected = scrape::collect_listings(
            self.fetcher,
            search,
            self.options.depth,
            self.config.scrape.page_delay_max_ms,
        );
        if collected.failed {
            stats.fetch_failures += 1;
        }
        stats.listings_scraped += collected.listings.len();

        let outcome = dedup::reconcile(
            self.db,
            ledger,
            collected.listings,
            search.id,
            self.options.write_database,
        );
        stats.store_failures += outcome.failures;
        println!("  {}", outcome);

        if search.status == SearchStatus::Silent {
            println!("  (Silent search)");
            return Ok(());
        }

        let mut candidates = outcome.candidates;
        match enrich::enrich(
            self.db,
            ledger,
            search,
            &self.matcher,
            &self.config.scrape,
            self.options.write_database,
        ) {
            Ok(promoted) => candidates.extend(promoted),
            Err(e) => error!(search_id = search.id, error = %e, "Cross-source enrichment failed"),
        }

        if candidates.is_empty() {
            println!("  Nothing to report.");
            return Ok(());
        }
        stats.candidates += candidates.len();

        let mut traces = Vec::new();
        for listing in candidates {
            let evaluation = self.evaluate_candidate(listing, search)?;
            if !evaluation.is_reported() {
                continue;
            }
            traces.push(evaluation.trace.to_string());
            if evaluation.worth_messaging {
                stats.worth_messaging += 1;
            }
            if self.options.send_messages {
                self.dispatch(&evaluation.dispatches, stats);
            }
        }

        if traces.is_empty() {
            println!("  Nothing worth messaging.");
        } else {
            println!("  Messages: {}", traces.join(" "));
        }
        Ok(())
    }

    /// Title exclusion, price evaluation and geofence for one candidate.
    ///
    /// Errors only when a geocoding lookup fails and `geofence.fail_fast`
    /// is set.
    pub fn evaluate_candidate(&self, mut listing: Listing, search: &Search) -> Result<Evaluation> {
        let mut trace = EvaluationTrace::default();

        if let Some(term) = self.matcher.terms(&search.search_string).excluded_by(&listing.title) {
            info!(post_id = %listing.post_id(), term, "Excluded by title");
            trace.push(TraceCode::Excluded);
            return Ok(Evaluation {
                listing,
                trace,
                excluded: true,
                area: None,
                worth_messaging: false,
                dispatches: Vec::new(),
            });
        }

        let verdict = pricing::evaluate(&listing, search, &self.price_settings());
        debug!(
            post_id = %listing.post_id(),
            price = verdict.numeric_price,
            category = ?verdict.category,
            worth_messaging = verdict.worth_messaging,
            "Price evaluated"
        );
        if let Some(code) = verdict.category.trace_code() {
            trace.push(code);
        }
        verdict.annotate(&mut listing);
        let mut worth_messaging = verdict.worth_messaging;

        let mut area = None;
        let force_priority = self.config.geofence.force_priority;
        if let Some(groups) = geofence::groups_for(search, &self.fallback_groups) {
            if geofence::applies(&listing, worth_messaging, force_priority) {
                trace.push(TraceCode::GeofenceChecked);
                match geofence::check(self.geocoder, &listing.location_text, groups) {
                    Ok(outcome) => {
                        match &outcome {
                            GeofenceOutcome::InRange { zipcode, distance_km } => {
                                info!(post_id = %listing.post_id(), zipcode = %zipcode, distance_km, "In area");
                                trace.push(TraceCode::InArea);
                                if force_priority {
                                    listing.is_priority_eligible = true;
                                }
                            }
                            GeofenceOutcome::OutOfRange => {
                                trace.push(TraceCode::OutOfArea);
                                if listing.is_pickup_only() {
                                    worth_messaging = false;
                                }
                            }
                        }
                        area = Some(AreaCheck::Resolved(outcome));
                    }
                    Err(e) if self.config.geofence.fail_fast => {
                        return Err(e).with_context(|| {
                            format!("Geocoding failed for post {}", listing.post_id())
                        });
                    }
                    Err(e) => {
                        warn!(post_id = %listing.post_id(), location = %listing.location_text, error = %e, "Geocoding failed, skipping listing");
                        trace.push(TraceCode::GeocodeFailed);
                        worth_messaging = false;
                        area = Some(AreaCheck::Unresolved);
                    }
                }
            }
        }

        let dispatches = notify::route(&listing, search, worth_messaging, &self.config.telegram);
        Ok(Evaluation {
            listing,
            trace,
            excluded: false,
            area,
            worth_messaging,
            dispatches,
        })
    }

    fn dispatch(&self, requests: &[DispatchRequest], stats: &mut RunStats) {
        for request in requests {
            match self.dispatcher.send(request) {
                Ok(true) => stats.messages_sent += 1,
                Ok(false) => stats.dispatch_failures += 1,
                Err(e) => {
                    error!(chat_id = %request.chat_id, error = %e, "Failed to send message");
                    stats.dispatch_failures += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GeofenceConfig, TelegramConfig};
    use crate::db::NewSearch;
    use crate::geofence::{Coordinates, GeocodeError};
    use crate::notify::Channel;
    use crate::scrape::{FetchError, FetchedPage};
    use std::cell::RefCell;
    use std::collections::HashMap;

    /// Serves a fixed result list per marketplace.
    #[derive(Default)]
    struct FakeFetcher {
        klein: RefCell<Vec<Listing>>,
        ebay: RefCell<Vec<Listing>>,
    }

    impl PageFetcher for FakeFetcher {
        fn fetch_page(&self, search: &Search, _page: u32) -> Result<FetchedPage, FetchError> {
            let listings = match search.marketplace {
                Marketplace::Klein => self.klein.borrow().clone(),
                Marketplace::Ebay => self.ebay.borrow().clone(),
            };
            Ok(FetchedPage {
                listings,
                has_more: false,
            })
        }
    }

    struct FakeGeocoder(HashMap<&'static str, Coordinates>);

    impl Geocoder for FakeGeocoder {
        fn geocode(&self, query: &str) -> Result<Coordinates, GeocodeError> {
            self.0
                .get(query)
                .copied()
                .ok_or_else(|| GeocodeError::NotFound(query.to_string()))
        }
    }

    fn geocoder() -> FakeGeocoder {
        // 10115 and 10117 are ~1 km apart, 80331 is far away
        FakeGeocoder(HashMap::from([
            ("10115", Coordinates { latitude: 52.532, longitude: 13.384 }),
            ("10117", Coordinates { latitude: 52.517, longitude: 13.388 }),
            ("80331", Coordinates { latitude: 48.135, longitude: 11.575 }),
        ]))
    }

    #[derive(Default)]
    struct RecordingDispatcher(RefCell<Vec<DispatchRequest>>);

    impl MessageDispatcher for RecordingDispatcher {
        fn send(&self, request: &DispatchRequest) -> Result<bool> {
            self.0.borrow_mut().push(request.clone());
            Ok(true)
        }
    }

    fn config() -> Config {
        Config {
            telegram: TelegramConfig {
                chat_id: "chat".to_string(),
                priority_chat_id: Some("prio".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn klein_listing(id: u64, title: &str, price: &str) -> Listing {
        let mut listing = Listing::new(id, Marketplace::Klein);
        listing.title = title.to_string();
        listing.raw_price = price.to_string();
        listing.shipping_text = "Versand möglich".to_string();
        listing.location_text = "10115 Mitte".to_string();
        listing.link = format!("https://www.kleinanzeigen.de/s-anzeige/{}", id);
        listing
    }

    fn range_search(db: &Database, status: i64) -> i64 {
        db.add_search(&NewSearch {
            marketplace: "KLEIN".to_string(),
            url: "/s-{PAGENSEARCH}k0".to_string(),
            search_string: "rtx 3080".to_string(),
            status,
            price_low: Some(50),
            price_high: Some(150),
            ..Default::default()
        })
        .unwrap()
    }

    fn options() -> RunOptions {
        RunOptions {
            depth: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_new_changed_and_unchanged_listing() {
        let db = Database::open_in_memory().unwrap();
        range_search(&db, 1);
        let fetcher = FakeFetcher::default();
        fetcher.klein.borrow_mut().push(klein_listing(555, "RTX 3080 Ti", "100,00 €"));
        let geocoder = geocoder();
        let dispatcher = RecordingDispatcher::default();
        let config = config();
        let engine = Engine::new(&db, &fetcher, &geocoder, &dispatcher, &config, options()).unwrap();

        let stats = engine.run().unwrap();
        assert_eq!(stats.messages_sent, 1);
        let stored = db.get_post(Marketplace::Klein, "555").unwrap().unwrap();
        assert_eq!(stored.price, "100,00 €");
        {
            let sent = dispatcher.0.borrow();
            assert_eq!(sent[0].chat_id, "chat");
            assert!(sent[0].text.contains("50€ [.....X.....] 150€"));
        }

        // unchanged: nothing new
        let stats = engine.run().unwrap();
        assert_eq!(stats.candidates, 0);
        assert_eq!(dispatcher.0.borrow().len(), 1);

        fetcher.klein.borrow_mut()[0].raw_price = "80,00 €".to_string();
        let stats = engine.run().unwrap();
        assert_eq!(stats.messages_sent, 1);
        assert!(dispatcher.0.borrow()[1].text.contains("NEW: 100,00 € → 80,00 €"));
        assert_eq!(
            db.get_post(Marketplace::Klein, "555").unwrap().unwrap().price,
            "80,00 €"
        );
    }

    #[test]
    fn test_silent_search_stores_without_messages() {
        let db = Database::open_in_memory().unwrap();
        range_search(&db, 2);
        let fetcher = FakeFetcher::default();
        fetcher.klein.borrow_mut().push(klein_listing(1, "RTX 3080", "100 €"));
        let geocoder = geocoder();
        let dispatcher = RecordingDispatcher::default();
        let config = config();
        let engine = Engine::new(&db, &fetcher, &geocoder, &dispatcher, &config, options()).unwrap();

        engine.run().unwrap();
        assert!(db.get_post(Marketplace::Klein, "1").unwrap().is_some());
        assert!(dispatcher.0.borrow().is_empty());
    }

    #[test]
    fn test_nonperm_run_sends_but_stores_nothing() {
        let db = Database::open_in_memory().unwrap();
        range_search(&db, 1);
        let fetcher = FakeFetcher::default();
        fetcher.klein.borrow_mut().push(klein_listing(1, "RTX 3080", "100 €"));
        let geocoder = geocoder();
        let dispatcher = RecordingDispatcher::default();
        let config = config();
        let opts = RunOptions {
            write_database: false,
            ..options()
        };
        let engine = Engine::new(&db, &fetcher, &geocoder, &dispatcher, &config, opts).unwrap();

        engine.run().unwrap();
        engine.run().unwrap();
        assert!(db.get_post(Marketplace::Klein, "1").unwrap().is_none());
        assert_eq!(dispatcher.0.borrow().len(), 2);
    }

    #[test]
    fn test_dry_run_matches_persisting_run_across_searches() {
        let run = |write_database: bool| {
            let db = Database::open_in_memory().unwrap();
            range_search(&db, 1);
            range_search(&db, 1);
            let fetcher = FakeFetcher::default();
            fetcher.klein.borrow_mut().push(klein_listing(555, "RTX 3080", "100 €"));
            let geocoder = geocoder();
            let dispatcher = RecordingDispatcher::default();
            let config = config();
            let opts = RunOptions {
                write_database,
                ..options()
            };
            let engine = Engine::new(&db, &fetcher, &geocoder, &dispatcher, &config, opts).unwrap();
            let stats = engine.run().unwrap();
            let sent = dispatcher.0.borrow().len();
            (stats.candidates, stats.messages_sent, sent)
        };

        assert_eq!(run(true), (1, 1, 1));
        assert_eq!(run(false), run(true));
    }

    #[test]
    fn test_dry_run_claims_ingested_post_once() {
        let run = |write_database: bool| {
            let db = Database::open_in_memory().unwrap();
            db.add_search(&NewSearch {
                marketplace: "EBAY".to_string(),
                url: "/sch/i.html?_nkw=rtx+3080".to_string(),
                status: 1,
                price_target: Some(0),
                ..Default::default()
            })
            .unwrap();
            range_search(&db, 1);
            range_search(&db, 1);
            let fetcher = FakeFetcher::default();
            let mut ebay = Listing::new(4242, Marketplace::Ebay);
            ebay.title = "Zotac RTX 3080".to_string();
            ebay.raw_price = "120 €".to_string();
            fetcher.ebay.borrow_mut().push(ebay);
            let geocoder = geocoder();
            let dispatcher = RecordingDispatcher::default();
            let config = config();
            let opts = RunOptions {
                write_database,
                ..options()
            };
            let engine = Engine::new(&db, &fetcher, &geocoder, &dispatcher, &config, opts).unwrap();
            engine.run().unwrap().candidates
        };

        assert_eq!(run(true), 1);
        assert_eq!(run(false), 1);
    }

    #[test]
    fn test_silent_flag_suppresses_dispatch() {
        let db = Database::open_in_memory().unwrap();
        range_search(&db, 1);
        let fetcher = FakeFetcher::default();
        fetcher.klein.borrow_mut().push(klein_listing(1, "RTX 3080", "100 €"));
        let geocoder = geocoder();
        let dispatcher = RecordingDispatcher::default();
        let config = config();
        let opts = RunOptions {
            send_messages: false,
            ..options()
        };
        let engine = Engine::new(&db, &fetcher, &geocoder, &dispatcher, &config, opts).unwrap();

        let stats = engine.run().unwrap();
        assert_eq!(stats.worth_messaging, 1);
        assert!(dispatcher.0.borrow().is_empty());
    }

    #[test]
    fn test_exclusive_and_disabled_searches() {
        let db = Database::open_in_memory().unwrap();
        let first = range_search(&db, 1);
        let second = range_search(&db, 1);
        range_search(&db, 0);
        let fetcher = FakeFetcher::default();
        let geocoder = geocoder();
        let dispatcher = RecordingDispatcher::default();
        let config = config();

        let engine = Engine::new(&db, &fetcher, &geocoder, &dispatcher, &config, options()).unwrap();
        assert_eq!(engine.run().unwrap().searches, 2);

        let opts = RunOptions {
            exclusive: Some(second),
            ..options()
        };
        let engine = Engine::new(&db, &fetcher, &geocoder, &dispatcher, &config, opts).unwrap();
        assert_eq!(engine.run().unwrap().searches, 1);
        assert_ne!(first, second);
    }

    #[test]
    fn test_invalid_search_is_skipped() {
        let db = Database::open_in_memory().unwrap();
        db.add_search(&NewSearch {
            marketplace: "KLEIN".to_string(),
            status: 1,
            ..Default::default()
        })
        .unwrap();
        range_search(&db, 1);
        let fetcher = FakeFetcher::default();
        let geocoder = geocoder();
        let dispatcher = RecordingDispatcher::default();
        let config = config();
        let engine = Engine::new(&db, &fetcher, &geocoder, &dispatcher, &config, options()).unwrap();

        let stats = engine.run().unwrap();
        assert_eq!(stats.skipped_searches, 1);
        assert_eq!(stats.searches, 1);
    }

    #[test]
    fn test_cross_source_listing_goes_to_priority_chat() {
        let db = Database::open_in_memory().unwrap();
        db.add_search(&NewSearch {
            marketplace: "EBAY".to_string(),
            url: "/sch/i.html?_nkw=rtx+3080".to_string(),
            status: 1,
            price_target: Some(0),
            ..Default::default()
        })
        .unwrap();
        let klein_id = range_search(&db, 1);

        let fetcher = FakeFetcher::default();
        let mut ebay = Listing::new(4242, Marketplace::Ebay);
        ebay.title = "Zotac RTX 3080".to_string();
        ebay.raw_price = "120 €".to_string();
        fetcher.ebay.borrow_mut().push(ebay);

        let geocoder = geocoder();
        let dispatcher = RecordingDispatcher::default();
        let config = config();
        let engine = Engine::new(&db, &fetcher, &geocoder, &dispatcher, &config, options()).unwrap();

        engine.run().unwrap();
        let sent = dispatcher.0.borrow();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].channel, Channel::Default);
        assert_eq!(sent[1].channel, Channel::Priority);
        assert_eq!(sent[1].chat_id, "prio");
        assert!(sent[0].text.contains("https://www.ebay.de/itm/4242"));
        assert!(sent[0].text.contains("(Ebay)"));
        assert_eq!(
            db.get_post(Marketplace::Ebay, "4242").unwrap().unwrap().link_id,
            Some(klein_id)
        );
    }

    fn search_with_area(zipcodes: &str) -> Search {
        Search {
            id: 1,
            marketplace: Marketplace::Klein,
            url: String::new(),
            search_string: "rtx 3080".to_string(),
            status: SearchStatus::Active,
            policy: crate::models::PricePolicy::Range { low: 50, high: 150 },
            zipcodes: Some(crate::models::parse_distance_groups(zipcodes).unwrap()),
            chat_id: None,
        }
    }

    fn evaluate_with(config: &Config, listing: Listing, search: &Search) -> Result<Evaluation> {
        let db = Database::open_in_memory().unwrap();
        let fetcher = FakeFetcher::default();
        let geocoder = geocoder();
        let dispatcher = RecordingDispatcher::default();
        let engine = Engine::new(&db, &fetcher, &geocoder, &dispatcher, config, options()).unwrap();
        engine.evaluate_candidate(listing, search)
    }

    fn pickup(location: &str) -> Listing {
        let mut listing = klein_listing(9, "RTX 3080", "100 €");
        listing.shipping_text = "No Shipping".to_string();
        listing.location_text = location.to_string();
        listing
    }

    fn codes(evaluation: &Evaluation) -> String {
        evaluation.trace.to_string()
    }

    #[test]
    fn test_pickup_listing_in_area_is_sent() {
        let evaluation = evaluate_with(&config(), pickup("10117 Mitte"), &search_with_area("10,10115")).unwrap();
        assert_eq!(codes(&evaluation), "X?+");
        assert!(evaluation.worth_messaging);
        assert!(matches!(
            evaluation.area,
            Some(AreaCheck::Resolved(GeofenceOutcome::InRange { distance_km: 2, .. }))
        ));
        assert_eq!(evaluation.dispatches.len(), 1);
    }

    #[test]
    fn test_pickup_listing_out_of_area_is_suppressed() {
        let evaluation = evaluate_with(&config(), pickup("80331 München"), &search_with_area("10,10115")).unwrap();
        assert_eq!(codes(&evaluation), "X?-");
        assert!(!evaluation.worth_messaging);
        assert_eq!(evaluation.area, Some(AreaCheck::Resolved(GeofenceOutcome::OutOfRange)));
        assert!(evaluation.is_reported());
        assert!(evaluation.dispatches.is_empty());
    }

    #[test]
    fn test_shipped_listing_skips_geofence() {
        let listing = klein_listing(9, "RTX 3080", "100 €");
        let evaluation = evaluate_with(&config(), listing, &search_with_area("10,10115")).unwrap();
        assert_eq!(codes(&evaluation), "X");
        assert!(evaluation.worth_messaging);
        assert_eq!(evaluation.area, None);
    }

    #[test]
    fn test_force_priority_checks_shipped_listings() {
        let mut config = config();
        config.geofence = GeofenceConfig {
            force_priority: true,
            ..Default::default()
        };

        let listing = klein_listing(9, "RTX 3080", "100 €");
        let evaluation = evaluate_with(&config, listing, &search_with_area("10,10117")).unwrap();
        assert_eq!(codes(&evaluation), "X?+");
        assert!(evaluation.listing.is_priority_eligible);
        assert_eq!(evaluation.dispatches.len(), 2);

        // shipped and out of area: still sent, just not priority
        let mut far = klein_listing(10, "RTX 3080", "100 €");
        far.location_text = "80331 München".to_string();
        let evaluation = evaluate_with(&config, far, &search_with_area("10,10117")).unwrap();
        assert_eq!(codes(&evaluation), "X?-");
        assert!(evaluation.worth_messaging);
        assert_eq!(evaluation.dispatches.len(), 1);
    }

    #[test]
    fn test_geocode_failure_skips_listing() {
        let evaluation = evaluate_with(&config(), pickup("99999 Nowhere"), &search_with_area("10,10115")).unwrap();
        assert_eq!(codes(&evaluation), "X?!");
        assert!(!evaluation.worth_messaging);
        assert_eq!(evaluation.area, Some(AreaCheck::Unresolved));
        // the failed lookup still shows up in the summary line
        assert!(evaluation.is_reported());
        assert!(evaluation.dispatches.is_empty());
    }

    #[test]
    fn test_geocode_failure_is_fatal_with_fail_fast() {
        let mut config = config();
        config.geofence.fail_fast = true;
        let result = evaluate_with(&config, pickup("99999 Nowhere"), &search_with_area("10,10115"));
        assert!(result.is_err());
    }

    #[test]
    fn test_excluded_title_stops_evaluation() {
        let evaluation = evaluate_with(&config(), klein_listing(9, "RTX 3080 defekt", "100 €"), &search_with_area("10,10115")).unwrap();
        assert_eq!(evaluation.trace.codes(), &[TraceCode::Excluded]);
        assert!(evaluation.excluded);
        assert!(evaluation.is_reported());
        assert!(evaluation.dispatches.is_empty());
    }

    #[test]
    fn test_fallback_area_from_config() {
        let mut config = config();
        config.geofence.location_filter = "10,10115".to_string();
        let mut search = search_with_area("10,10115");
        search.zipcodes = None;

        let evaluation = evaluate_with(&config, pickup("80331"), &search).unwrap();
        assert_eq!(codes(&evaluation), "X?-");
    }
}
