use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::error::ValidationError;

// --- Status lifecycle ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingStatus {
    New,
    PrefilterPass,
    PrefilterFail,
    Researching,
    Completed,
}

impl ListingStatus {
    pub const ALL: [ListingStatus; 5] = [
        ListingStatus::New,
        ListingStatus::PrefilterPass,
        ListingStatus::PrefilterFail,
        ListingStatus::Researching,
        ListingStatus::Completed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ListingStatus::New => "new",
            ListingStatus::PrefilterPass => "prefilter_pass",
            ListingStatus::PrefilterFail => "prefilter_fail",
            ListingStatus::Researching => "researching",
            ListingStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == s)
    }

    /// Forward-only lifecycle. Going back to `new` is a reset, not a transition.
    pub fn can_transition_to(self, next: ListingStatus) -> bool {
        matches!(
            (self, next),
            (ListingStatus::New, ListingStatus::PrefilterPass)
                | (ListingStatus::New, ListingStatus::PrefilterFail)
                | (ListingStatus::PrefilterPass, ListingStatus::Researching)
                | (ListingStatus::Researching, ListingStatus::Completed)
        )
    }
}

impl fmt::Display for ListingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ListingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(&s.trim().to_lowercase()).ok_or_else(|| {
            let valid: Vec<&str> = Self::ALL.iter().map(|status| status.as_str()).collect();
            format!("unknown status '{}' (expected one of: {})", s, valid.join(", "))
        })
    }
}

// --- Identity ---

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListingKey {
    pub source_id: String,
    pub source_name: String,
}

impl ListingKey {
    pub fn new(source_id: impl Into<String>, source_name: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            source_name: source_name.into(),
        }
    }
}

impl fmt::Display for ListingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.source_name, self.source_id)
    }
}

// --- Raw records from fetchers ---

/// Loosely typed record as produced by a fetcher, before validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawListing(Map<String, Value>);

impl RawListing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn source_id(&self) -> Option<&str> {
        self.get("source_id").and_then(Value::as_str)
    }
}

impl From<Map<String, Value>> for RawListing {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

// --- Listing ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub key: ListingKey,
    pub title: String,
    pub description: Option<String>,
    pub price: Option<i64>,
    pub revenue: Option<i64>,
    pub ebitda: Option<i64>,
    pub location: Option<String>,
    pub industry: Option<String>,
    pub url: Option<String>,
    pub days_listed: Option<i64>,
    pub raw_data: Option<Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct DerivedMetrics {
    pub ebitda_margin: Option<f64>,
    pub asking_multiple: Option<f64>,
}

impl Listing {
    pub fn validate(raw: &RawListing) -> Result<Self, ValidationError> {
        let source_id = required_id(raw, "source_id")?;
        let source_name = required_str(raw, "source_name")?;
        let title = required_str(raw, "title")?;

        Ok(Self {
            key: ListingKey::new(source_id, source_name),
            title,
            description: optional_str(raw, "description"),
            price: optional_amount(raw, "price"),
            revenue: optional_amount(raw, "revenue"),
            ebitda: optional_amount(raw, "ebitda"),
            location: optional_str(raw, "location"),
            industry: optional_str(raw, "industry"),
            url: optional_str(raw, "url"),
            days_listed: optional_count(raw, "days_listed"),
            raw_data: raw.get("raw_data").filter(|v| !v.is_null()).cloned(),
        })
    }

    pub fn derived_metrics(&self) -> DerivedMetrics {
        let ebitda_margin = match (self.ebitda, self.revenue) {
            (Some(ebitda), Some(revenue)) if revenue != 0 => Some(ebitda as f64 / revenue as f64),
            _ => None,
        };
        let asking_multiple = match (self.price, self.ebitda) {
            (Some(price), Some(ebitda)) if ebitda > 0 => Some(price as f64 / ebitda as f64),
            _ => None,
        };
        DerivedMetrics {
            ebitda_margin,
            asking_multiple,
        }
    }

    /// Copies fields from `incoming` only where this listing has none.
    /// Returns true if anything changed.
    pub fn fill_blanks(&mut self, incoming: &Listing) -> bool {
        let mut changed = false;
        changed |= fill(&mut self.description, &incoming.description);
        changed |= fill(&mut self.price, &incoming.price);
        changed |= fill(&mut self.revenue, &incoming.revenue);
        changed |= fill(&mut self.ebitda, &incoming.ebitda);
        changed |= fill(&mut self.location, &incoming.location);
        changed |= fill(&mut self.industry, &incoming.industry);
        changed |= fill(&mut self.url, &incoming.url);
        changed |= fill(&mut self.days_listed, &incoming.days_listed);
        changed |= fill(&mut self.raw_data, &incoming.raw_data);
        changed
    }
}

fn fill<T: Clone>(slot: &mut Option<T>, incoming: &Option<T>) -> bool {
    if slot.is_none() && incoming.is_some() {
        *slot = incoming.clone();
        true
    } else {
        false
    }
}

/// A listing as held by the repository.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredListing {
    pub id: i64,
    pub listing: Listing,
    pub status: ListingStatus,
    pub reasons: Vec<String>,
    pub first_seen_at: String,
    pub updated_at: String,
    pub processed_at: Option<String>,
}

impl StoredListing {
    pub fn key(&self) -> &ListingKey {
        &self.listing.key
    }
}

// --- Field extraction helpers ---

fn required_str(raw: &RawListing, field: &'static str) -> Result<String, ValidationError> {
    match raw.get(field) {
        None | Some(Value::Null) => Err(ValidationError::Missing(field)),
        Some(Value::String(s)) if s.trim().is_empty() => Err(ValidationError::Missing(field)),
        Some(Value::String(s)) => Ok(s.trim().to_string()),
        Some(_) => Err(ValidationError::WrongType {
            field,
            expected: "string",
        }),
    }
}

fn required_id(raw: &RawListing, field: &'static str) -> Result<String, ValidationError> {
    match raw.get(field) {
        Some(Value::Number(n)) if n.is_u64() || n.is_i64() => Ok(n.to_string()),
        Some(Value::Number(_)) => Err(ValidationError::WrongType {
            field,
            expected: "string or integer",
        }),
        _ => required_str(raw, field),
    }
}

fn optional_str(raw: &RawListing, field: &str) -> Option<String> {
    raw.get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn optional_amount(raw: &RawListing, field: &str) -> Option<i64> {
    match raw.get(field)? {
        Value::Number(n) => {
            let value = n.as_f64()?;
            (value.is_finite() && value >= 0.0).then(|| value.round() as i64)
        }
        Value::String(s) => parse_amount(s),
        _ => None,
    }
}

fn optional_count(raw: &RawListing, field: &str) -> Option<i64> {
    match raw.get(field)? {
        Value::Number(n) => n.as_u64().and_then(|v| i64::try_from(v).ok()),
        Value::String(s) => s.trim().parse::<u32>().ok().map(i64::from),
        _ => None,
    }
}

/// Parses money text such as "$475,000", "1.5m", "$2 million" or "250k".
pub fn parse_amount(text: &str) -> Option<i64> {
    let re = regex::Regex::new(
        r"^\$?\s*([0-9][0-9,]*(?:\.[0-9]+)?)\s*(k|thousand|m|mil|million)?$",
    )
    .ok()?;
    let lower = text.trim().to_lowercase();
    let caps = re.captures(&lower)?;

    let number: f64 = caps.get(1)?.as_str().replace(',', "").parse().ok()?;
    let multiplier = match caps.get(2).map(|m| m.as_str()) {
        Some("k") | Some("thousand") => 1_000.0,
        Some("m") | Some("mil") | Some("million") => 1_000_000.0,
        _ => 1.0,
    };
    Some((number * multiplier).round() as i64)
}

pub fn format_money(amount: i64) -> String {
    let digits = amount.unsigned_abs().to_string();
    let mut grouped = String::new();
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    if amount < 0 {
        format!("-${}", grouped)
    } else {
        format!("${}", grouped)
    }
}
