use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde_json::json;

use super::{FetchOptions, FetchStream, ListingFetcher};
use crate::error::FetchError;
use crate::models::{format_money, RawListing};

const INDUSTRIES: &[&str] = &[
    "Plumbing Services",
    "HVAC Installation & Repair",
    "Commercial Cleaning",
    "Auto Repair Shop",
    "Landscaping & Lawn Care",
    "Electrical Contracting",
    "Pest Control Services",
    "Coffee Shop / Cafe",
    "Digital Marketing Agency",
    "IT Services & Support",
    "Manufacturing - Industrial Parts",
    "Distribution - Wholesale Goods",
    "Restaurant - Fast Casual",
    "Fitness Center / Gym",
    "Medical Practice",
];

const LOCATIONS: &[&str] = &[
    "Brisbane, QLD",
    "Sydney, NSW",
    "Melbourne, VIC",
    "Perth, WA",
    "Adelaide, SA",
    "Gold Coast, QLD",
    "Austin, TX",
    "Miami, FL",
    "Denver, CO",
    "Phoenix, AZ",
];

const TITLE_TEMPLATES: &[&str] = &[
    "Profitable {industry} with Established Customer Base",
    "Turnkey {industry} - Owner Retiring",
    "Growing {industry} - High Margins",
    "Well-Established {industry} - 20+ Years",
    "Scalable {industry} with Recurring Revenue",
];

const SALE_REASONS: &[&str] = &["Retirement", "Relocation", "New venture", "Health reasons"];

/// Generates plausible listings without touching the network.
/// The same seed and index always produce the same record.
#[derive(Debug, Clone)]
pub struct MockFetcher {
    source_name: String,
    seed: u64,
    fail_after: Option<usize>,
}

impl MockFetcher {
    pub fn new(seed: u64) -> Self {
        Self {
            source_name: "mock".to_string(),
            seed,
            fail_after: None,
        }
    }

    #[cfg(test)]
    pub fn with_source_name(mut self, name: &str) -> Self {
        self.source_name = name.to_string();
        self
    }

    /// Emits a `FetchError` after `count` records.
    #[cfg(test)]
    pub fn failing_after(mut self, count: usize) -> Self {
        self.fail_after = Some(count);
        self
    }

    pub fn generate(&self, index: usize) -> RawListing {
        let seed = self.seed.wrapping_mul(1_000_003).wrapping_add(index as u64);
        let mut rng = StdRng::seed_from_u64(seed);

        let industry = pick(&mut rng, INDUSTRIES);
        let location = pick(&mut rng, LOCATIONS);
        let title = pick(&mut rng, TITLE_TEMPLATES).replace("{industry}", industry);

        let revenue: i64 = rng.gen_range(200_000..=2_000_000);
        let margin: f64 = rng.gen_range(0.05..0.35);
        let ebitda = (revenue as f64 * margin) as i64;
        let multiple: f64 = rng.gen_range(2.0..5.0);
        let price = (ebitda as f64 * multiple) as i64;
        let days_listed: i64 = rng.gen_range(0..=90);
        // Some sellers keep their financials private
        let discloses_financials = rng.gen_bool(0.85);

        let source_id = format!("{}_{}", self.source_name, index);
        let description = format!(
            "Well-established {} operating in {}. Annual revenue of {} with {:.1}% EBITDA margin. \
             Trained staff in place. Owner willing to provide transition training.",
            industry,
            location,
            format_money(revenue),
            margin * 100.0
        );

        RawListing::new()
            .with("source_id", source_id.clone())
            .with("source_name", self.source_name.clone())
            .with("title", title)
            .with("description", description)
            .with("price", price)
            .with("revenue", discloses_financials.then_some(revenue))
            .with("ebitda", discloses_financials.then_some(ebitda))
            .with("location", location)
            .with("industry", industry)
            .with("url", format!("https://example.com/listing/{}", source_id))
            .with("days_listed", days_listed)
            .with(
                "raw_data",
                json!({
                    "employees": rng.gen_range(2..=25),
                    "years_in_business": rng.gen_range(5..=30),
                    "reason_for_selling": pick(&mut rng, SALE_REASONS),
                }),
            )
    }
}

fn pick<'a>(rng: &mut StdRng, options: &[&'a str]) -> &'a str {
    options.choose(rng).copied().unwrap_or_default()
}

impl ListingFetcher for MockFetcher {
    fn source_name(&self) -> &str {
        &self.source_name
    }

    fn fetch<'a>(&'a self, count: usize, _options: &'a FetchOptions) -> FetchStream<'a> {
        let mut index = 0;
        let mut failed = false;

        Box::new(std::iter::from_fn(move || {
            if failed || index >= count {
                return None;
            }
            if self.fail_after == Some(index) {
                failed = true;
                return Some(Err(FetchError::new(
                    self.source_name.clone(),
                    format!("simulated failure after {} records", index),
                )));
            }
            let record = self.generate(index);
            index += 1;
            Some(Ok(record))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Listing;

    #[test]
    fn test_same_seed_same_records() {
        let options = FetchOptions::default();
        let a: Vec<_> = MockFetcher::new(7)
            .fetch(5, &options)
            .map(|r| r.unwrap())
            .collect();
        let b: Vec<_> = MockFetcher::new(7)
            .fetch(5, &options)
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(a, b);

        let other: Vec<_> = MockFetcher::new(8)
            .fetch(5, &options)
            .map(|r| r.unwrap())
            .collect();
        assert_ne!(a, other);
    }

    #[test]
    fn test_fetch_respects_count() {
        let fetcher = MockFetcher::new(1);
        let options = FetchOptions::default();
        assert_eq!(fetcher.fetch(3, &options).count(), 3);
        assert_eq!(fetcher.fetch(0, &options).count(), 0);
    }

    #[test]
    fn test_records_validate() {
        let fetcher = MockFetcher::new(99).with_source_name("demo");
        for record in fetcher.fetch(20, &FetchOptions::default()) {
            let listing = Listing::validate(&record.unwrap()).unwrap();
            assert_eq!(listing.key.source_name, "demo");
            assert!(listing.key.source_id.starts_with("demo_"));
            assert!(listing.price.is_some());
            if let (Some(revenue), Some(ebitda)) = (listing.revenue, listing.ebitda) {
                assert!(ebitda < revenue);
            }
        }
    }

    #[test]
    fn test_identities_are_stable_across_fetches() {
        let fetcher = MockFetcher::new(3);
        assert_eq!(fetcher.generate(4).source_id(), Some("mock_4"));
        assert_eq!(fetcher.generate(4), fetcher.generate(4));
    }

    #[test]
    fn test_failing_after_delivers_partial_results() {
        let fetcher = MockFetcher::new(1).failing_after(2);
        let options = FetchOptions::default();
        let results: Vec<_> = fetcher.fetch(10, &options).collect();

        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(results[1].is_ok());
        let err = results[2].as_ref().unwrap_err();
        assert_eq!(err.source_name, "mock");
    }
}
