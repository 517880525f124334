use std::fmt;
use tracing::{debug, info, warn};

use crate::db::{Database, ResetScope};
use crate::error::{FetchError, PipelineError};
use crate::fetchers::{FetchOptions, FetcherRegistry, ListingFetcher, ALL_SOURCES};
use crate::models::{Listing, ListingStatus};
use crate::prefilter::{FilterConfig, Prefilter};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchStats {
    /// Raw records received from fetchers, valid or not.
    pub fetched: usize,
    pub inserted: usize,
    pub duplicates: usize,
    /// Records dropped by validation.
    pub errors: usize,
    /// Sources that aborted with a `FetchError` while fetching "all".
    pub failed_sources: Vec<String>,
}

impl fmt::Display for FetchStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "fetched {}, inserted {}, duplicates {}, errors {}",
            self.fetched, self.inserted, self.duplicates, self.errors
        )?;
        if !self.failed_sources.is_empty() {
            write!(f, ", failed sources: {}", self.failed_sources.join(", "))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterStats {
    pub evaluated: usize,
    pub passed: usize,
    pub failed: usize,
}

impl fmt::Display for FilterStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "evaluated {}, passed {}, failed {}",
            self.evaluated, self.passed, self.failed
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DailyStats {
    pub fetch: FetchStats,
    pub reset: usize,
    pub filter: FilterStats,
}

/// Sequences fetch, store and filter. Holds no state of its own between runs.
pub struct Pipeline<'a> {
    db: &'a Database,
    registry: &'a FetcherRegistry,
}

impl<'a> Pipeline<'a> {
    pub fn new(db: &'a Database, registry: &'a FetcherRegistry) -> Self {
        Self { db, registry }
    }

    /// Streams `count` records per source into the repository.
    ///
    /// Under `"all"` a failing source is recorded in `failed_sources` and the next
    /// source still runs. A single named source that fails aborts with the partial tally.
    pub fn run_fetch(
        &self,
        source: &str,
        count: usize,
        options: &FetchOptions,
    ) -> Result<FetchStats, PipelineError> {
        let fetchers = self.registry.resolve(source)?;
        let mut stats = FetchStats::default();

        for fetcher in fetchers {
            if let Err(error) = self.fetch_one(fetcher, count, options, &mut stats)? {
                if source != ALL_SOURCES {
                    return Err(PipelineError::FetchAborted {
                        error,
                        partial: stats,
                    });
                }
                warn!(source = fetcher.source_name(), error = %error, "source failed, continuing");
                stats.failed_sources.push(fetcher.source_name().to_string());
            }
        }

        info!(source, %stats, "fetch complete");
        Ok(stats)
    }

    /// Repository errors abort the run; a fetcher error is handed back for the caller's policy.
    fn fetch_one(
        &self,
        fetcher: &dyn ListingFetcher,
        count: usize,
        options: &FetchOptions,
        stats: &mut FetchStats,
    ) -> Result<Result<(), FetchError>, PipelineError> {
        let name = fetcher.source_name();
        let mut options = options.clone();
        options.known_ids = self.db.known_source_ids(name)?;
        info!(source = name, count, known = options.known_ids.len(), "fetching");

        for item in fetcher.fetch(count, &options) {
            let raw = match item {
                Ok(raw) => raw,
                Err(e) => return Ok(Err(e)),
            };
            stats.fetched += 1;

            let raw = if raw.get("source_name").is_none() {
                raw.with("source_name", name)
            } else {
                raw
            };

            let listing = match Listing::validate(&raw) {
                Ok(listing) => listing,
                Err(e) => {
                    warn!(source = name, id = ?raw.source_id(), error = %e, "dropping invalid record");
                    stats.errors += 1;
                    continue;
                }
            };

            let (_, was_new) = self.db.upsert(&listing)?;
            if was_new {
                stats.inserted += 1;
                debug!(key = %listing.key, "inserted");
            } else {
                stats.duplicates += 1;
            }
        }

        Ok(Ok(()))
    }

    /// Classifies every listing still in `new`. Already classified listings are untouched.
    pub fn run_filter(&self, config: &FilterConfig) -> Result<FilterStats, PipelineError> {
        let prefilter = Prefilter::new(config.clone());
        let pending = self.db.find_by_status(ListingStatus::New, None)?;
        debug!(pending = pending.len(), config = ?prefilter.config(), "filtering");
        let mut stats = FilterStats::default();

        for stored in &pending {
            let evaluation = prefilter.apply(self.db, stored)?;
            stats.evaluated += 1;
            if evaluation.passed {
                stats.passed += 1;
            } else {
                stats.failed += 1;
            }
        }

        info!(%stats, "filter complete");
        Ok(stats)
    }

    /// Fetch, return every prefilter outcome to `new`, then filter everything again
    /// so a changed config applies to the whole backlog.
    pub fn run_daily(
        &self,
        source: &str,
        count: usize,
        options: &FetchOptions,
        config: &FilterConfig,
    ) -> Result<DailyStats, PipelineError> {
        let fetch = match self.run_fetch(source, count, options) {
            Ok(stats) => stats,
            Err(PipelineError::FetchAborted { error, mut partial }) => {
                warn!(error = %error, "fetch aborted, filtering what was stored");
                partial.failed_sources.push(error.source_name.clone());
                partial
            }
            Err(e) => return Err(e),
        };

        let mut reset = 0;
        for status in [ListingStatus::PrefilterPass, ListingStatus::PrefilterFail] {
            reset += self.db.reset_status(&ResetScope {
                status: Some(status),
                source_name: None,
            })?;
        }

        let filter = self.run_filter(config)?;
        Ok(DailyStats {
            fetch,
            reset,
            filter,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RepositoryError;
    use crate::fetchers::{FetchStream, MockFetcher};
    use crate::models::{ListingKey, RawListing};
    use crate::prefilter::TitleKeyword;
    use std::collections::BTreeMap;

    /// Replays fixed records, optionally failing at a position.
    struct FixedFetcher {
        name: String,
        records: Vec<RawListing>,
        fail_at: Option<usize>,
    }

    impl FixedFetcher {
        fn new(name: &str, records: Vec<RawListing>) -> Self {
            Self {
                name: name.to_string(),
                records,
                fail_at: None,
            }
        }

        fn failing_at(mut self, index: usize) -> Self {
            self.fail_at = Some(index);
            self
        }
    }

    impl ListingFetcher for FixedFetcher {
        fn source_name(&self) -> &str {
            &self.name
        }

        fn fetch<'a>(&'a self, count: usize, _options: &'a FetchOptions) -> FetchStream<'a> {
            let fail_at = self.fail_at;
            Box::new(
                self.records
                    .iter()
                    .take(count)
                    .enumerate()
                    .map_while(move |(i, raw)| {
                        if fail_at.is_some_and(|f| i > f) {
                            None
                        } else if fail_at == Some(i) {
                            Some(Err(FetchError::new(self.name.clone(), "connection reset")))
                        } else {
                            Some(Ok(raw.clone()))
                        }
                    }),
            )
        }
    }

    fn record(id: &str, title: &str) -> RawListing {
        RawListing::new().with("source_id", id).with("title", title)
    }

    fn setup() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.init().unwrap();
        db
    }

    fn mock_registry() -> FetcherRegistry {
        let mut registry = FetcherRegistry::new();
        registry.register(Box::new(MockFetcher::new(42)));
        registry
    }

    fn classification(db: &Database) -> BTreeMap<String, (ListingStatus, Vec<String>)> {
        db.list(None, None)
            .unwrap()
            .into_iter()
            .map(|s| (s.key().to_string(), (s.status, s.reasons)))
            .collect()
    }

    #[test]
    fn test_fetch_twice_stores_once() {
        let db = setup();
        let registry = mock_registry();
        let pipeline = Pipeline::new(&db, &registry);
        let options = FetchOptions::default();

        let first = pipeline.run_fetch("mock", 10, &options).unwrap();
        assert_eq!(first.fetched, 10);
        assert_eq!(first.inserted, 10);
        assert_eq!(first.duplicates, 0);

        let second = pipeline.run_fetch("mock", 10, &options).unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.duplicates, 10);
        assert_eq!(db.stats().unwrap().total, 10);
    }

    #[test]
    fn test_refetch_fills_blanks_without_clearing() {
        let db = setup();
        let mut registry = FetcherRegistry::new();
        registry.register(Box::new(FixedFetcher::new(
            "fixed",
            vec![record("1", "Bakery"), record("1", "Bakery").with("revenue", 400_000)],
        )));
        let pipeline = Pipeline::new(&db, &registry);

        let stats = pipeline
            .run_fetch("fixed", 10, &FetchOptions::default())
            .unwrap();
        assert_eq!((stats.inserted, stats.duplicates), (1, 1));

        let key = ListingKey::new("1", "fixed");
        assert_eq!(db.get(&key).unwrap().unwrap().listing.revenue, Some(400_000));

        let mut registry = FetcherRegistry::new();
        registry.register(Box::new(FixedFetcher::new("fixed", vec![record("1", "Bakery")])));
        Pipeline::new(&db, &registry)
            .run_fetch("fixed", 10, &FetchOptions::default())
            .unwrap();
        assert_eq!(db.get(&key).unwrap().unwrap().listing.revenue, Some(400_000));
    }

    #[test]
    fn test_invalid_records_are_counted_and_skipped() {
        let db = setup();
        let mut registry = FetcherRegistry::new();
        registry.register(Box::new(FixedFetcher::new(
            "fixed",
            vec![
                record("1", "Cafe"),
                RawListing::new().with("source_id", "2"),
                record("3", "Gym"),
            ],
        )));
        let pipeline = Pipeline::new(&db, &registry);

        let stats = pipeline
            .run_fetch("fixed", 10, &FetchOptions::default())
            .unwrap();
        assert_eq!(stats.fetched, 3);
        assert_eq!(stats.inserted, 2);
        assert_eq!(stats.errors, 1);
    }

    #[test]
    fn test_unknown_source_fails_immediately() {
        let db = setup();
        let registry = mock_registry();
        let err = Pipeline::new(&db, &registry)
            .run_fetch("bizbuysell", 5, &FetchOptions::default())
            .unwrap_err();
        assert!(matches!(err, PipelineError::UnknownSource(_)));
        assert_eq!(db.stats().unwrap().total, 0);
    }

    #[test]
    fn test_single_source_failure_keeps_partial_results() {
        let db = setup();
        let mut registry = FetcherRegistry::new();
        registry.register(Box::new(MockFetcher::new(1).failing_after(3)));
        let pipeline = Pipeline::new(&db, &registry);

        let err = pipeline
            .run_fetch("mock", 10, &FetchOptions::default())
            .unwrap_err();
        match err {
            PipelineError::FetchAborted { error, partial } => {
                assert_eq!(error.source_name, "mock");
                assert_eq!(partial.inserted, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(db.stats().unwrap().total, 3);
    }

    #[test]
    fn test_all_continues_past_failing_source() {
        let db = setup();
        let mut registry = FetcherRegistry::new();
        registry.register(Box::new(
            FixedFetcher::new("broken", vec![record("1", "A"), record("2", "B")]).failing_at(1),
        ));
        registry.register(Box::new(MockFetcher::new(5)));
        let pipeline = Pipeline::new(&db, &registry);

        let stats = pipeline
            .run_fetch(ALL_SOURCES, 4, &FetchOptions::default())
            .unwrap();
        assert_eq!(stats.failed_sources, vec!["broken".to_string()]);
        assert_eq!(stats.inserted, 5);
        assert!(stats.to_string().contains("failed sources: broken"));
    }

    #[test]
    fn test_filter_keeps_reason_invariant() {
        let db = setup();
        let registry = mock_registry();
        let pipeline = Pipeline::new(&db, &registry);
        pipeline
            .run_fetch("mock", 40, &FetchOptions::default())
            .unwrap();

        let config = FilterConfig {
            min_revenue: Some(500_000),
            min_ebitda_margin: Some(0.15),
            ..FilterConfig::default()
        };
        let stats = pipeline.run_filter(&config).unwrap();
        assert_eq!(stats.evaluated, 40);
        assert_eq!(stats.passed + stats.failed, 40);

        for stored in db.list(None, None).unwrap() {
            match stored.status {
                ListingStatus::PrefilterFail => assert!(!stored.reasons.is_empty()),
                ListingStatus::PrefilterPass => assert!(stored.reasons.is_empty()),
                other => panic!("unexpected status {other}"),
            }
        }
    }

    #[test]
    fn test_second_filter_run_is_a_no_op() {
        let db = setup();
        let registry = mock_registry();
        let pipeline = Pipeline::new(&db, &registry);
        pipeline
            .run_fetch("mock", 15, &FetchOptions::default())
            .unwrap();

        let config = FilterConfig::default();
        pipeline.run_filter(&config).unwrap();
        let before = classification(&db);

        let second = pipeline.run_filter(&config).unwrap();
        assert_eq!(second, FilterStats::default());
        assert_eq!(classification(&db), before);
    }

    #[test]
    fn test_reset_then_filter_reproduces_classification() {
        let db = setup();
        let registry = mock_registry();
        let pipeline = Pipeline::new(&db, &registry);
        pipeline
            .run_fetch("mock", 25, &FetchOptions::default())
            .unwrap();

        let config = FilterConfig::default();
        pipeline.run_filter(&config).unwrap();
        let before = classification(&db);

        let reset = db.reset_status(&ResetScope::default()).unwrap();
        assert_eq!(reset, 25);
        assert_eq!(db.stats().unwrap().count(ListingStatus::New), 25);

        let stats = pipeline.run_filter(&config).unwrap();
        assert_eq!(stats.evaluated, 25);
        assert_eq!(classification(&db), before);
    }

    #[test]
    fn test_multiple_reasons_accumulate() {
        let db = setup();
        let mut registry = FetcherRegistry::new();
        registry.register(Box::new(FixedFetcher::new(
            "fixed",
            vec![record("r1", "Corner Store")
                .with("price", 900_000)
                .with("revenue", 400_000)
                .with("industry", "retail")
                .with("days_listed", 10)],
        )));
        let pipeline = Pipeline::new(&db, &registry);
        pipeline
            .run_fetch("fixed", 1, &FetchOptions::default())
            .unwrap();

        let config = FilterConfig {
            max_price: Some(1_000_000),
            min_revenue: Some(500_000),
            min_ebitda_margin: Some(0.15),
            max_days_listed: None,
            excluded_industries: vec!["retail".to_string()],
            excluded_title_keywords: vec![],
        };
        let stats = pipeline.run_filter(&config).unwrap();
        assert_eq!(stats.failed, 1);

        let stored = db.get(&ListingKey::new("r1", "fixed")).unwrap().unwrap();
        assert_eq!(stored.status, ListingStatus::PrefilterFail);
        assert!(stored.reasons.iter().any(|r| r.contains("Revenue")));
        assert!(stored.reasons.iter().any(|r| r.contains("retail")));
    }

    #[test]
    fn test_title_override_passes() {
        let db = setup();
        let mut registry = FetcherRegistry::new();
        registry.register(Box::new(FixedFetcher::new(
            "fixed",
            vec![record("f1", "Franchise Accounting Practice")],
        )));
        let pipeline = Pipeline::new(&db, &registry);
        pipeline
            .run_fetch("fixed", 1, &FetchOptions::default())
            .unwrap();

        let config = FilterConfig {
            excluded_title_keywords: vec![TitleKeyword::new("franchise").allowing(&["accounting"])],
            ..FilterConfig::unrestricted()
        };
        let stats = pipeline.run_filter(&config).unwrap();
        assert_eq!(stats.passed, 1);
    }

    #[test]
    fn test_daily_reclassifies_backlog() {
        let db = setup();
        let registry = mock_registry();
        let pipeline = Pipeline::new(&db, &registry);
        let options = FetchOptions::default();

        let first = pipeline
            .run_daily("mock", 10, &options, &FilterConfig::unrestricted())
            .unwrap();
        assert_eq!(first.fetch.inserted, 10);
        assert_eq!(first.reset, 0);
        assert_eq!(first.filter.passed, 10);

        let strict = FilterConfig {
            max_price: Some(0),
            ..FilterConfig::unrestricted()
        };
        let second = pipeline.run_daily("mock", 10, &options, &strict).unwrap();
        assert_eq!(second.fetch.duplicates, 10);
        assert_eq!(second.reset, 10);
        assert_eq!(second.filter.evaluated, 10);
        assert_eq!(db.stats().unwrap().count(ListingStatus::PrefilterFail), 10);
    }

    #[test]
    fn test_daily_leaves_researching_alone() {
        let db = setup();
        let registry = mock_registry();
        let pipeline = Pipeline::new(&db, &registry);
        let options = FetchOptions::default();
        pipeline
            .run_daily("mock", 3, &options, &FilterConfig::unrestricted())
            .unwrap();

        let key = ListingKey::new("mock_0", "mock");
        db.update_status(&key, ListingStatus::Researching, &[])
            .unwrap();

        let stats = pipeline
            .run_daily("mock", 3, &options, &FilterConfig::unrestricted())
            .unwrap();
        assert_eq!(stats.reset, 2);
        assert_eq!(
            db.get(&key).unwrap().unwrap().status,
            ListingStatus::Researching
        );
    }

    #[test]
    fn test_repository_invariant_is_fatal() {
        let db = setup();
        let registry = mock_registry();
        Pipeline::new(&db, &registry)
            .run_fetch("mock", 1, &FetchOptions::default())
            .unwrap();

        let err = db
            .update_status(&ListingKey::new("mock_0", "mock"), ListingStatus::PrefilterFail, &[])
            .unwrap_err();
        assert!(matches!(err, RepositoryError::InvariantViolation(_)));
    }
}
