pub mod mock;
pub mod seek;

use std::collections::HashSet;
use tracing::debug;

use crate::error::{FetchError, UnknownSourceError};
use crate::models::RawListing;

pub use mock::MockFetcher;
pub use seek::SeekFetcher;

/// Source name that selects every registered fetcher.
pub const ALL_SOURCES: &str = "all";

/// Lazy stream of raw records. An `Err` item ends the stream; records before it are valid.
pub type FetchStream<'a> = Box<dyn Iterator<Item = Result<RawListing, FetchError>> + 'a>;

// --- Fetcher trait ---

pub trait ListingFetcher {
    fn source_name(&self) -> &str;

    /// Yields at most `count` records, paging through the source as needed.
    fn fetch<'a>(&'a self, count: usize, options: &'a FetchOptions) -> FetchStream<'a>;

    fn health_check(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub location: Option<String>,
    pub radius_km: Option<u32>,
    pub fetch_details: bool,
    /// Source ids already stored; fetchers may skip them instead of fetching detail pages.
    pub known_ids: HashSet<String>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            location: None,
            radius_km: None,
            fetch_details: true,
            known_ids: HashSet::new(),
        }
    }
}

// --- Registry ---

/// Fetchers by source name, in registration order.
#[derive(Default)]
pub struct FetcherRegistry {
    fetchers: Vec<Box<dyn ListingFetcher>>,
}

impl FetcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a fetcher, replacing any previous one with the same source name.
    pub fn register(&mut self, fetcher: Box<dyn ListingFetcher>) {
        let name = fetcher.source_name().to_string();
        match self.fetchers.iter().position(|f| f.source_name() == name) {
            Some(idx) => self.fetchers[idx] = fetcher,
            None => self.fetchers.push(fetcher),
        }
        debug!(source = %name, "registered fetcher");
    }

    pub fn sources(&self) -> Vec<&str> {
        self.fetchers.iter().map(|f| f.source_name()).collect()
    }

    pub fn get(&self, name: &str) -> Result<&dyn ListingFetcher, UnknownSourceError> {
        self.fetchers
            .iter()
            .find(|f| f.source_name() == name)
            .map(|f| f.as_ref())
            .ok_or_else(|| UnknownSourceError {
                name: name.to_string(),
                available: self.sources().into_iter().map(String::from).collect(),
            })
    }

    /// One fetcher for a source name, or every fetcher for `"all"`.
    pub fn resolve(&self, name: &str) -> Result<Vec<&dyn ListingFetcher>, UnknownSourceError> {
        if name == ALL_SOURCES {
            Ok(self.fetchers.iter().map(|f| f.as_ref()).collect())
        } else {
            Ok(vec![self.get(name)?])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_get() {
        let mut registry = FetcherRegistry::new();
        registry.register(Box::new(MockFetcher::new(1)));
        registry.register(Box::new(MockFetcher::new(2).with_source_name("other")));

        assert_eq!(registry.sources(), vec!["mock", "other"]);
        assert_eq!(registry.get("other").unwrap().source_name(), "other");
    }

    #[test]
    fn test_register_replaces_same_name() {
        let mut registry = FetcherRegistry::new();
        registry.register(Box::new(MockFetcher::new(1)));
        registry.register(Box::new(MockFetcher::new(2).with_source_name("other")));
        registry.register(Box::new(MockFetcher::new(3)));
        assert_eq!(registry.sources(), vec!["mock", "other"]);
    }

    #[test]
    fn test_unknown_source() {
        let mut registry = FetcherRegistry::new();
        registry.register(Box::new(MockFetcher::new(1)));

        let err = registry.get("bizbuysell").err().unwrap();
        assert_eq!(err.name, "bizbuysell");
        assert_eq!(err.available, vec!["mock".to_string()]);
        assert!(err.to_string().contains("available: mock"));
        assert!(registry.resolve("bizbuysell").is_err());
    }

    #[test]
    fn test_resolve_all_keeps_registration_order() {
        let mut registry = FetcherRegistry::new();
        registry.register(Box::new(MockFetcher::new(1).with_source_name("b")));
        registry.register(Box::new(MockFetcher::new(1).with_source_name("a")));

        let names: Vec<&str> = registry
            .resolve(ALL_SOURCES)
            .unwrap()
            .iter()
            .map(|f| f.source_name())
            .collect();
        assert_eq!(names, vec!["b", "a"]);

        assert!(FetcherRegistry::new().resolve(ALL_SOURCES).unwrap().is_empty());
    }
}
