use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;

use crate::db::Database;
use crate::error::RepositoryError;
use crate::models::{format_money, Listing, ListingStatus, StoredListing};

/// An excluded title keyword.
///
/// `allow` waives it when the title also mentions one of those words.
/// `allow_industries` waives it when the listing's industry label mentions one of those.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "TitleKeywordRepr")]
pub struct TitleKeyword {
    pub keyword: String,
    pub allow: Vec<String>,
    pub allow_industries: Vec<String>,
}

impl TitleKeyword {
    pub fn new(keyword: &str) -> Self {
        Self {
            keyword: keyword.to_string(),
            allow: vec![],
            allow_industries: vec![],
        }
    }

    pub fn allowing(mut self, overrides: &[&str]) -> Self {
        self.allow = overrides.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn allowing_industries(mut self, industries: &[&str]) -> Self {
        self.allow_industries = industries.iter().map(|s| s.to_string()).collect();
        self
    }

    fn waived(&self, title_lower: &str, industry_lower: &str) -> bool {
        let title_override = self
            .allow
            .iter()
            .any(|allowed| title_lower.contains(&allowed.to_lowercase()));
        let industry_override = !industry_lower.is_empty()
            && self
                .allow_industries
                .iter()
                .any(|allowed| industry_lower.contains(&allowed.to_lowercase()));
        title_override || industry_override
    }
}

// Config files may list a keyword as a bare string or as a table with an allow-list
#[derive(Deserialize)]
#[serde(untagged)]
enum TitleKeywordRepr {
    Bare(String),
    Full {
        keyword: String,
        #[serde(default)]
        allow: Vec<String>,
        #[serde(default)]
        allow_industries: Vec<String>,
    },
}

impl From<TitleKeywordRepr> for TitleKeyword {
    fn from(repr: TitleKeywordRepr) -> Self {
        match repr {
            TitleKeywordRepr::Bare(keyword) => Self {
                keyword,
                allow: vec![],
                allow_industries: vec![],
            },
            TitleKeywordRepr::Full {
                keyword,
                allow,
                allow_industries,
            } => Self {
                keyword,
                allow,
                allow_industries,
            },
        }
    }
}

/// Thresholds left out of the `[filter]` table keep their defaults.
/// A `max_price` or `max_days_listed` of 0 switches that rule off.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    #[serde(deserialize_with = "zero_disables")]
    pub max_price: Option<i64>,
    pub min_revenue: Option<i64>,
    pub min_ebitda_margin: Option<f64>,
    #[serde(deserialize_with = "zero_disables")]
    pub max_days_listed: Option<i64>,
    pub excluded_industries: Vec<String>,
    pub excluded_title_keywords: Vec<TitleKeyword>,
}

fn zero_disables<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<i64>::deserialize(deserializer)?.filter(|limit| *limit != 0))
}

impl FilterConfig {
    /// A configuration with every rule switched off.
    #[cfg(test)]
    pub fn unrestricted() -> Self {
        Self {
            max_price: None,
            min_revenue: None,
            min_ebitda_margin: None,
            max_days_listed: None,
            excluded_industries: vec![],
            excluded_title_keywords: vec![],
        }
    }
}

const DEFAULT_EXCLUDED_INDUSTRIES: &[&str] = &[
    // Retail and hospitality
    "retail",
    "food & drink",
    "coffee",
    "cafe",
    "restaurant",
    "pub",
    "bar",
    "accommodation",
    "tourism",
    "leisure",
    "takeaway",
    "hospitality",
    "franchise",
    "master franchise",
    // Personal and trade services
    "driving school",
    "driving",
    "beauty",
    "hair",
    "spa",
    "massage",
    "pilates",
    "gym",
    "fitness",
    "f45",
    "mechanic",
    "automotive",
    "tyre",
    "car detailing",
    "electrical",
    "electrical services",
    "handyman",
    "home services",
    "cleaning",
    "maintenance",
    "dry cleaning",
    "laundromat",
    "laundry",
    "fencing",
    "sports",
    "pest control",
    "taxi",
    "transport",
    "chauffeur",
    "courier",
    "freight",
    "truck",
    "pet grooming",
    "dog grooming",
    "garden",
    "lawn",
    "mowing",
    "nursery",
    "landscaping",
    "removals",
    "air conditioning",
    "air-con",
    "carpet",
    "flooring",
    "refund",
];

const DEFAULT_EXCLUDED_TITLE_KEYWORDS: &[&str] = &[
    "pest control",
    "driving school",
    "driving",
    "massage",
    "pilates",
    "gym",
    "fitness",
    "f45",
    "beauty",
    "hair salon",
    "dry cleaning",
    "laundromat",
    "laundry",
    "handyman",
    "garden",
    "lawn",
    "mowing",
    "nursery",
    "courier",
    "taxi",
    "refund",
    "dog grooming",
    "pet grooming",
];

// Professional-services industries where a franchise is still worth a look
const FRANCHISE_ALLOWED_INDUSTRIES: &[&str] = &[
    "mortgage",
    "finance",
    "insurance",
    "legal",
    "accounting",
    "business services",
    "real estate",
];

impl Default for FilterConfig {
    fn default() -> Self {
        let mut excluded_title_keywords = vec![TitleKeyword::new("franchise").allowing_industries(FRANCHISE_ALLOWED_INDUSTRIES)];
        excluded_title_keywords.extend(DEFAULT_EXCLUDED_TITLE_KEYWORDS.iter().map(|k| TitleKeyword::new(k)));

        Self {
            max_price: Some(1_000_000),
            min_revenue: None,
            min_ebitda_margin: None,
            max_days_listed: Some(60),
            excluded_industries: DEFAULT_EXCLUDED_INDUSTRIES.iter().map(|s| s.to_string()).collect(),
            excluded_title_keywords,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub passed: bool,
    pub reasons: Vec<String>,
}

impl Evaluation {
    pub fn status(&self) -> ListingStatus {
        if self.passed {
            ListingStatus::PrefilterPass
        } else {
            ListingStatus::PrefilterFail
        }
    }
}

/// Runs every rule in order and collects one reason per failing rule.
pub fn evaluate(listing: &Listing, config: &FilterConfig) -> Evaluation {
    let reasons: Vec<String> = [
        check_price(listing, config),
        check_revenue(listing, config),
        check_ebitda_margin(listing, config),
        check_days_listed(listing, config),
        check_industry(listing, config),
        check_title(listing, config),
    ]
    .into_iter()
    .flatten()
    .collect();

    Evaluation {
        passed: reasons.is_empty(),
        reasons,
    }
}

fn check_price(listing: &Listing, config: &FilterConfig) -> Option<String> {
    let (price, max) = (listing.price?, config.max_price?);
    (price > max).then(|| format!("Price {} exceeds max {}", format_money(price), format_money(max)))
}

// Undisclosed revenue fails: missing data is never a free pass
fn check_revenue(listing: &Listing, config: &FilterConfig) -> Option<String> {
    let min = config.min_revenue?;
    match listing.revenue {
        None => Some(format!("Revenue not disclosed (min {})", format_money(min))),
        Some(revenue) if revenue < min => Some(format!(
            "Revenue {} below min {}",
            format_money(revenue),
            format_money(min)
        )),
        Some(_) => None,
    }
}

fn check_ebitda_margin(listing: &Listing, config: &FilterConfig) -> Option<String> {
    let min = config.min_ebitda_margin?;
    match listing.derived_metrics().ebitda_margin {
        None => Some(format!("EBITDA margin unknown (min {:.1}%)", min * 100.0)),
        Some(margin) if margin < min => Some(format!(
            "EBITDA margin {:.1}% below min {:.1}%",
            margin * 100.0,
            min * 100.0
        )),
        Some(_) => None,
    }
}

// Unknown listing age passes
fn check_days_listed(listing: &Listing, config: &FilterConfig) -> Option<String> {
    let (days, max) = (listing.days_listed?, config.max_days_listed?);
    (days > max).then(|| format!("Listed {} days ago (max {})", days, max))
}

fn check_industry(listing: &Listing, config: &FilterConfig) -> Option<String> {
    let industry = listing.industry.as_deref()?;
    let industry_lower = industry.to_lowercase();
    config
        .excluded_industries
        .iter()
        .find(|excluded| industry_lower.contains(&excluded.to_lowercase()))
        .map(|excluded| format!("Industry '{}' matches exclusion '{}'", industry, excluded))
}

fn check_title(listing: &Listing, config: &FilterConfig) -> Option<String> {
    let title_lower = listing.title.to_lowercase();
    let industry_lower = listing.industry.as_deref().unwrap_or("").to_lowercase();

    config
        .excluded_title_keywords
        .iter()
        .filter(|rule| title_lower.contains(&rule.keyword.to_lowercase()))
        .find(|rule| !rule.waived(&title_lower, &industry_lower))
        .map(|rule| format!("Title contains excluded keyword '{}'", rule.keyword))
}

pub struct Prefilter {
    config: FilterConfig,
}

impl Prefilter {
    pub fn new(config: FilterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    pub fn evaluate(&self, listing: &Listing) -> Evaluation {
        evaluate(listing, &self.config)
    }

    /// Evaluates a stored listing and records the outcome through the repository.
    pub fn apply(&self, db: &Database, stored: &StoredListing) -> Result<Evaluation, RepositoryError> {
        let evaluation = self.evaluate(&stored.listing);
        db.update_status(stored.key(), evaluation.status(), &evaluation.reasons)?;
        debug!(
            key = %stored.key(),
            passed = evaluation.passed,
            reasons = ?evaluation.reasons,
            "prefilter evaluated listing"
        );
        Ok(evaluation)
    }
}
