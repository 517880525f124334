use rand::Rng;
use regex::Regex;
use reqwest::blocking::Client;
use scraper::{ElementRef, Html, Selector};
use serde_json::{json, Map, Value};
use std::collections::{HashSet, VecDeque};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{FetchOptions, FetchStream, ListingFetcher};
use crate::config::SeekConfig;
use crate::error::FetchError;
use crate::models::{parse_amount, RawListing};

pub const SOURCE_NAME: &str = "seekbusiness";

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

const TEMPLATE_PHRASES: &[&str] = &[
    "All communication is now over to you and the advertiser. Why not make another enquiry to compare it with a similar business?",
    "Thanks for confirming. You'll be one of the first to know when a new business matches your preferences.",
    "NOW UNDER OFFER",
];

const PARAGRAPH_NOISE: &[&str] = &[
    "all communication is now over to you",
    "thanks for confirming",
    "you'll be one of the first to know",
    "why not make another enquiry",
    "sign in",
    "register",
    "menu",
    "cookie",
    "privacy",
];

const DESCRIPTION_SELECTORS: &[&str] = &[
    r#"[data-testid="listing-description"]"#,
    r#"[data-testid="description"]"#,
    ".listing-description",
    "#listing-description",
    r#"[class*="description"]"#,
    r#"main [class*="content"]"#,
    "article",
    r#"[role="main"]"#,
    "#sbus-ad-detail-cont",
];

/// Scrapes seekbusiness.com.au search results, optionally visiting each detail page.
pub struct SeekFetcher {
    client: Client,
    config: SeekConfig,
}

impl SeekFetcher {
    pub fn new(config: SeekConfig) -> Result<Self, FetchError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| FetchError::new(SOURCE_NAME, e))?;

        Ok(Self { client, config })
    }

    fn search_url(&self, location: &str, radius_km: u32, page: u32) -> String {
        format!(
            "{}/businesses-for-sale/in-{}?rad={}&pg={}",
            self.config.base_url.trim_end_matches('/'),
            location,
            radius_km,
            page
        )
    }

    fn get_html(&self, url: &str) -> Result<String, reqwest::Error> {
        self.client.get(url).send()?.error_for_status()?.text()
    }

    /// Retries with linear backoff plus jitter. Returns the last error once attempts run out.
    fn get_with_retry(&self, url: &str) -> Result<String, reqwest::Error> {
        let mut attempt = 1;
        loop {
            match self.get_html(url) {
                Ok(html) => return Ok(html),
                Err(e) if attempt < self.config.max_retries => {
                    let backoff = backoff_for(attempt);
                    warn!(url, attempt, error = %e, "request failed, retrying in {:?}", backoff);
                    std::thread::sleep(backoff);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// `None` when the detail page could not be fetched; the card data is used instead.
    fn fetch_detail(&self, url: &str) -> Option<DetailPage> {
        for attempt in 1..=self.config.max_retries {
            self.pause_before_request();

            let html = match self.get_html(url) {
                Ok(html) => html,
                Err(e) => {
                    warn!(url, attempt, error = %e, "detail page failed");
                    if attempt < self.config.max_retries {
                        std::thread::sleep(backoff_for(attempt));
                    }
                    continue;
                }
            };

            let mut detail = parse_detail_page(&html);
            if detail.is_blocked() {
                if attempt < self.config.max_retries {
                    warn!(url, attempt, "blocked by sign-in wall, backing off");
                    std::thread::sleep(backoff_for(attempt) * 2);
                    continue;
                }
                detail.title = title_from_url(url);
            }
            return Some(detail);
        }
        None
    }

    fn pause_before_request(&self) {
        if self.config.request_delay_ms > 0 {
            let millis = rand::thread_rng().gen_range(0..=self.config.request_delay_ms);
            std::thread::sleep(Duration::from_millis(millis));
        }
    }
}

fn backoff_for(attempt: u32) -> Duration {
    let jitter = rand::thread_rng().gen_range(0..=2_000);
    Duration::from_millis(3_000 * u64::from(attempt) + jitter)
}

impl ListingFetcher for SeekFetcher {
    fn source_name(&self) -> &str {
        SOURCE_NAME
    }

    fn fetch<'a>(&'a self, count: usize, options: &'a FetchOptions) -> FetchStream<'a> {
        let location = options
            .location
            .clone()
            .unwrap_or_else(|| self.config.location.clone());
        let radius_km = options.radius_km.unwrap_or(self.config.radius_km);
        info!(source = SOURCE_NAME, %location, radius_km, count, "starting search");

        Box::new(SeekStream {
            fetcher: self,
            options,
            location,
            radius_km,
            fetch_details: options.fetch_details && self.config.fetch_details,
            remaining: count,
            page: 1,
            buffer: VecDeque::new(),
            seen: HashSet::new(),
            done: false,
        })
    }

    fn health_check(&self) -> bool {
        match self.client.get(&self.config.base_url).send() {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!(error = %e, "health check failed");
                false
            }
        }
    }
}

// --- Lazy paging ---

struct SeekStream<'a> {
    fetcher: &'a SeekFetcher,
    options: &'a FetchOptions,
    location: String,
    radius_km: u32,
    fetch_details: bool,
    remaining: usize,
    page: u32,
    buffer: VecDeque<SearchCard>,
    seen: HashSet<String>,
    done: bool,
}

impl SeekStream<'_> {
    /// Loads the next search page into the buffer. `Ok(false)` means the results ran out.
    fn load_next_page(&mut self) -> Result<bool, FetchError> {
        let url = self
            .fetcher
            .search_url(&self.location, self.radius_km, self.page);
        debug!(%url, page = self.page, "fetching search page");

        let html = self
            .fetcher
            .get_with_retry(&url)
            .map_err(|e| FetchError::new(SOURCE_NAME, e))?;
        let cards = parse_search_page(&html, &self.fetcher.config.base_url);

        // Sites that clamp the page number keep serving the last page
        if cards.is_empty() || cards.iter().all(|c| self.seen.contains(&c.id)) {
            info!(page = self.page, "no more listings");
            return Ok(false);
        }

        debug!(page = self.page, cards = cards.len(), "parsed search page");
        self.buffer.extend(cards);
        self.page += 1;
        Ok(true)
    }
}

impl Iterator for SeekStream<'_> {
    type Item = Result<RawListing, FetchError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done || self.remaining == 0 {
                return None;
            }

            let Some(card) = self.buffer.pop_front() else {
                match self.load_next_page() {
                    Ok(true) => continue,
                    Ok(false) => {
                        self.done = true;
                        return None;
                    }
                    Err(e) => {
                        self.done = true;
                        return Some(Err(e));
                    }
                }
            };

            if !self.seen.insert(card.id.clone()) {
                continue;
            }
            if card.is_sold() {
                debug!(id = %card.id, "skipping sold listing");
                continue;
            }
            if self.options.known_ids.contains(&card.id) {
                debug!(id = %card.id, "already stored, skipping");
                continue;
            }

            let detail = if self.fetch_details {
                self.fetcher.fetch_detail(&card.url)
            } else {
                None
            };
            if detail.as_ref().is_some_and(DetailPage::is_sold) {
                debug!(id = %card.id, "detail page marks listing sold");
                continue;
            }

            self.remaining -= 1;
            return Some(Ok(card.into_raw(detail)));
        }
    }
}

// --- HTML parsing ---

/// One result card from a search page.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchCard {
    pub id: String,
    pub title: String,
    pub url: String,
    pub price: Option<i64>,
    pub location: Option<String>,
    pub industry: Option<String>,
    pub broker_name: Option<String>,
    pub listing_type: Option<String>,
}

impl SearchCard {
    pub fn is_sold(&self) -> bool {
        self.title.to_lowercase().contains("sold")
    }

    pub fn into_raw(self, detail: Option<DetailPage>) -> RawListing {
        let detail_fetched = detail.is_some();
        let detail = detail.unwrap_or_default();

        RawListing::new()
            .with("source_id", self.id)
            .with("source_name", SOURCE_NAME)
            .with("title", detail.title.unwrap_or(self.title))
            .with("description", detail.description)
            .with("price", self.price)
            .with("location", self.location)
            .with("industry", self.industry)
            .with("url", self.url)
            .with("days_listed", detail.days_listed)
            .with(
                "raw_data",
                json!({
                    "broker_name": self.broker_name,
                    "listing_type": self.listing_type,
                    "posted_date_relative": detail.posted_relative,
                    "structured_data": detail.structured_data,
                    "detail_fetched": detail_fetched,
                }),
            )
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetailPage {
    pub title: Option<String>,
    pub description: Option<String>,
    pub posted_relative: Option<String>,
    pub days_listed: Option<i64>,
    pub structured_data: Map<String, Value>,
}

impl DetailPage {
    pub fn is_sold(&self) -> bool {
        self.title
            .as_deref()
            .is_some_and(|t| t.to_lowercase().contains("sold"))
    }

    /// Sign-in walls replace the listing with a generic page.
    pub fn is_blocked(&self) -> bool {
        match self.title.as_deref() {
            Some(title) => {
                let lower = title.to_lowercase();
                lower.contains("sign in") || lower.contains("log in") || title == "Verified Businesses"
            }
            None => false,
        }
    }
}

pub fn parse_search_page(html: &str, base_url: &str) -> Vec<SearchCard> {
    let document = Html::parse_document(html);
    let Some(card_selector) =
        Selector::parse(r#"[data-testid="search-listings-result-item"]"#).ok()
    else {
        return Vec::new();
    };

    document
        .select(&card_selector)
        .filter_map(|card| parse_card(card, base_url))
        .collect()
}

fn parse_card(card: ElementRef, base_url: &str) -> Option<SearchCard> {
    let link_selector = Selector::parse("h2 a[href]").ok()?;
    let link = card.select(&link_selector).next()?;
    let href = link.value().attr("href")?;

    let id_re = Regex::new(r"/business-listing/[^/]+/(\d+)/?$").ok()?;
    let numeric_id = id_re.captures(href)?.get(1)?.as_str();

    let url = if href.starts_with("http") {
        href.to_string()
    } else {
        let base = base_url.trim_end_matches('/');
        match href.strip_prefix('/') {
            Some(path) => format!("{}/{}", base, path),
            None => format!("{}/{}", base, href),
        }
    };

    let mut title = element_text(link);
    if title.is_empty() {
        title = card
            .value()
            .attr("aria-label")
            .unwrap_or("Unknown Business")
            .to_string();
    }
    let title = title.split('|').next().unwrap_or_default().trim().to_string();

    let industry = testid_text(card, "search-result-item-industry-breadcrumbs").map(|text| {
        text.split('>')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" > ")
    });

    Some(SearchCard {
        id: format!("seek_{}", numeric_id),
        title,
        url,
        price: parse_card_price(&element_text(card)),
        location: testid_text(card, "search-result-item-location-breadcrumbs"),
        industry,
        broker_name: testid_text(card, "serp-listing-business-name"),
        listing_type: testid_text(card, "serp-listing-item-type"),
    })
}

/// Finds the first dollar amount in card text, e.g. "$475,000" or "$1.5M".
pub fn parse_card_price(text: &str) -> Option<i64> {
    let re = Regex::new(r"(?i)\$\s*\d[\d,]*(?:\.\d+)?(?:\s*(?:million|m)\b)?").ok()?;
    let found = re.find(text)?.as_str();
    parse_amount(&found.replace(' ', ""))
}

pub fn parse_detail_page(html: &str) -> DetailPage {
    let document = Html::parse_document(html);
    let page_text = element_text(document.root_element());
    let posted = parse_days_ago(&page_text);

    DetailPage {
        title: detail_title(&document),
        description: detail_description(&document),
        posted_relative: posted.as_ref().map(|(relative, _)| relative.clone()),
        days_listed: posted.map(|(_, days)| days),
        structured_data: embedded_data(html),
    }
}

fn detail_title(document: &Html) -> Option<String> {
    let h1 = Selector::parse("h1").ok()?;
    if let Some(el) = document.select(&h1).next() {
        let title = element_text(el);
        let title = title.split('|').next().unwrap_or_default().trim();
        if title.len() > 3 {
            return Some(title.to_string());
        }
    }

    let title_tag = Selector::parse("title").ok()?;
    let el = document.select(&title_tag).next()?;
    let title = element_text(el);
    let title = title.split('|').next().unwrap_or_default().trim();
    let location_suffix = Regex::new(r"\s+in\s+[^|]+$").ok()?;
    let title = location_suffix.replace(title, "");
    (title.len() > 3).then(|| title.to_string())
}

fn detail_description(document: &Html) -> Option<String> {
    if let Some(text) = about_the_business(document) {
        return Some(text);
    }

    for css in DESCRIPTION_SELECTORS {
        let Some(selector) = Selector::parse(css).ok() else {
            continue;
        };
        if let Some(el) = document.select(&selector).next() {
            let text = strip_template_text(&element_text(el));
            if text.len() > 100 && text.len() < 5_000 {
                return Some(text);
            }
        }
    }

    let p = Selector::parse("p").ok()?;
    let paragraphs: Vec<String> = document
        .select(&p)
        .map(element_text)
        .filter(|text| {
            let lower = text.to_lowercase();
            text.len() > 100 && !PARAGRAPH_NOISE.iter().any(|noise| lower.contains(noise))
        })
        .take(3)
        .collect();

    (!paragraphs.is_empty()).then(|| paragraphs.join(" "))
}

fn about_the_business(document: &Html) -> Option<String> {
    let item = Selector::parse("div.infoItem").ok()?;
    let h4 = Selector::parse("h4").ok()?;

    document
        .select(&item)
        .find(|el| {
            el.select(&h4)
                .any(|header| element_text(header).contains("About the Business"))
        })
        .map(|el| {
            element_text(el)
                .replacen("About the Business", "", 1)
                .trim()
                .to_string()
        })
        .filter(|text| text.len() > 100)
}

fn strip_template_text(text: &str) -> String {
    let mut cleaned = text.to_string();
    for phrase in TEMPLATE_PHRASES {
        if let Ok(re) = Regex::new(&format!("(?i){}", regex::escape(phrase))) {
            cleaned = re.replace_all(&cleaned, "").into_owned();
        }
    }
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Parses "6 days ago" style posting ages into a day count. Hours round down to zero.
pub fn parse_days_ago(text: &str) -> Option<(String, i64)> {
    let re = Regex::new(r"(?i)(\d+)\s+(day|days|hour|hours|week|weeks|month|months)\s+ago").ok()?;
    let caps = re.captures(text)?;
    let num: i64 = caps.get(1)?.as_str().parse().ok()?;
    let unit = caps.get(2)?.as_str().to_lowercase();

    let days = match unit.trim_end_matches('s') {
        "hour" => 0,
        "week" => num.checked_mul(7)?,
        "month" => num.checked_mul(30)?,
        _ => num,
    };
    Some((caps.get(0)?.as_str().to_lowercase(), days))
}

/// Pulls the analytics objects the site embeds in inline scripts.
fn embedded_data(html: &str) -> Map<String, Value> {
    let mut data = Map::new();
    for (var, key) in [
        ("loopaData", "loopa"),
        ("heapListingData", "heap"),
        ("seekDmpData", "dmp"),
    ] {
        let Ok(re) = Regex::new(&format!(r"(?s)var {} = (\{{.+?\}});", var)) else {
            continue;
        };
        let Some(body) = re.captures(html).and_then(|c| c.get(1)) else {
            continue;
        };
        let body = body.as_str().replace("&amp;", "&").replace("\\u0026", "&");
        match serde_json::from_str::<Value>(&body) {
            Ok(value) => {
                data.insert(key.to_string(), value);
            }
            Err(e) => debug!(var, error = %e, "embedded data is not JSON"),
        }
    }
    data
}

fn title_from_url(url: &str) -> Option<String> {
    let re = Regex::new(r"/business-listing/([^/]+)/\d+").ok()?;
    let slug = re.captures(url)?.get(1)?.as_str();
    let state_codes = ["in", "qld", "nsw", "vic", "wa", "sa", "act", "nt"];

    let words: Vec<String> = slug
        .split('-')
        .filter(|w| !w.is_empty() && !state_codes.contains(&w.to_lowercase().as_str()))
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect();
    (!words.is_empty()).then(|| words.join(" "))
}

fn testid_text(card: ElementRef, testid: &str) -> Option<String> {
    let selector = Selector::parse(&format!(r#"[data-testid="{}"]"#, testid)).ok()?;
    let text = element_text(card.select(&selector).next()?);
    (!text.is_empty()).then_some(text)
}

fn element_text(el: ElementRef) -> String {
    el.text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}
