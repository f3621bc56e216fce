//! Candidate market discovery through the Gamma public-search API.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use time::format_description::well_known::Rfc3339;
use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time, UtcOffset, Weekday};
use tracing::{debug, info, instrument, warn};

use super::types::{Market, Outcome, SidePick};
use crate::error::MarketError;

/// Assets whose up/down markets qualify.
const CRYPTO_TERMS: &[&str] = &[
    "bitcoin", "ethereum", "btc", "eth", "solana", "sol", "xrp", "dogecoin", "doge",
];

/// "January 27, 8am ET" or "January 27, 10:15am ET".
static QUESTION_TIME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(\w+)\s+(\d{1,2})(?:st|nd|rd|th)?,?\s*(\d{1,2})(?::(\d{2}))?\s*(am|pm)\s*ET")
        .expect("valid regex")
});

/// Filter applied when asking for the next market to snipe.
#[derive(Debug, Clone)]
pub struct CandidateFilter {
    /// Reference time for the horizon.
    pub now: OffsetDateTime,
    /// Only markets resolving within this window qualify.
    pub horizon: Duration,
    /// Condition ids already attempted this run.
    pub exclude: HashSet<String>,
}

impl CandidateFilter {
    /// Whether a market passes the filter.
    pub fn accepts(&self, market: &Market) -> bool {
        let horizon_end = self.now + self.horizon;
        market.deadline > self.now
            && market.deadline <= horizon_end
            && !self.exclude.contains(&market.id)
    }
}

/// Source of candidate markets for the supervisor.
#[async_trait]
pub trait MarketScanner: Send + Sync {
    /// The soonest-resolving market that passes the filter, if any.
    async fn next_candidate(&self, filter: &CandidateFilter) -> Result<Option<Market>, MarketError>;
}

/// Either a JSON-encoded list in a string or a plain list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum StringList {
    /// Native JSON array.
    List(Vec<String>),
    /// `"[\"a\",\"b\"]"` or `"a, b"`.
    Text(String),
}

impl StringList {
    /// Flatten into owned strings.
    pub fn items(&self) -> Vec<String> {
        match self {
            StringList::List(items) => items.clone(),
            StringList::Text(text) => {
                let text = text.trim();
                if text.starts_with('[') {
                    serde_json::from_str(text).unwrap_or_default()
                } else {
                    text.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                }
            }
        }
    }
}

/// Market as returned inside a public-search event.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GammaMarket {
    /// Market question.
    #[serde(default)]
    pub question: Option<String>,
    /// Condition id.
    #[serde(default)]
    pub condition_id: Option<String>,
    /// End date (ISO format).
    #[serde(default)]
    pub end_date: Option<String>,
    /// End date (ISO format, alternate field).
    #[serde(default)]
    pub end_date_iso: Option<String>,
    /// CLOB token ids.
    #[serde(default)]
    pub clob_token_ids: Option<StringList>,
    /// Outcome labels aligned with the token ids.
    #[serde(default)]
    pub outcomes: Option<StringList>,
    /// Whether the market is closed.
    #[serde(default)]
    pub closed: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct SearchEvent {
    #[serde(default)]
    markets: Vec<GammaMarket>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    events: Vec<SearchEvent>,
}

/// Scanner backed by `GET {gamma}/public-search?q=`.
#[derive(Debug, Clone)]
pub struct GammaScanner {
    http: reqwest::Client,
    base_url: String,
    queries: Vec<String>,
    side: SidePick,
}

impl GammaScanner {
    /// Create a scanner for the given queries.
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, queries: Vec<String>, side: SidePick) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            queries,
            side,
        }
    }

    /// Run one search query and flatten `events[].markets[]`.
    #[instrument(skip(self))]
    pub async fn search(&self, query: &str) -> Result<Vec<GammaMarket>, MarketError> {
        let url = format!("{}/public-search", self.base_url);
        let response = self
            .http
            .get(&url)
            .query(&[("q", query)])
            .header("Accept", "application/json")
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(MarketError::SearchFailed {
                query: query.to_string(),
                reason: format!("HTTP {}", response.status()),
            });
        }

        let body: SearchResponse = response.json().await.map_err(|e| {
            MarketError::ParseError(format!("failed to parse public-search response: {}", e))
        })?;

        Ok(body.events.into_iter().flat_map(|e| e.markets).collect())
    }

    /// All qualifying future markets across the configured queries, soonest first.
    pub async fn scan(&self, now: OffsetDateTime) -> Result<Vec<Market>, MarketError> {
        let mut raw = Vec::new();
        let mut last_error = None;

        for query in &self.queries {
            match self.search(query).await {
                Ok(markets) => {
                    debug!(query = %query, count = markets.len(), "Search returned markets");
                    raw.extend(markets);
                }
                Err(e) => {
                    warn!(query = %query, error = %e, "Market search failed");
                    last_error = Some(e);
                }
            }
        }

        if raw.is_empty() {
            if let Some(e) = last_error {
                return Err(e);
            }
        }

        Ok(qualifying_markets(raw, now, self.side))
    }
}

#[async_trait]
impl MarketScanner for GammaScanner {
    async fn next_candidate(&self, filter: &CandidateFilter) -> Result<Option<Market>, MarketError> {
        let markets = self.scan(filter.now).await?;
        let candidate = markets.into_iter().find(|m| filter.accepts(m));
        if let Some(market) = &candidate {
            info!(market = %market.id, deadline = %market.deadline, question = market.label(), "Found candidate market");
        }
        Ok(candidate)
    }
}

/// Dedupe by condition id, keep open crypto up/down markets ending after `now`, soonest first.
pub fn qualifying_markets(raw: Vec<GammaMarket>, now: OffsetDateTime, side: SidePick) -> Vec<Market> {
    let mut seen = HashSet::new();
    let mut markets: Vec<Market> = raw
        .into_iter()
        .filter(|m| match &m.condition_id {
            Some(id) => seen.insert(id.clone()),
            None => false,
        })
        .filter(|m| m.closed != Some(true))
        .filter(|m| m.question.as_deref().is_some_and(is_crypto_up_down))
        .filter_map(|m| to_market(m, now, side))
        .filter(|m| m.deadline > now)
        .collect();

    markets.sort_by_key(|m| m.deadline);
    markets
}

fn to_market(raw: GammaMarket, now: OffsetDateTime, side: SidePick) -> Option<Market> {
    let deadline = raw
        .question
        .as_deref()
        .and_then(|q| parse_question_deadline(q, now))
        .or_else(|| raw.end_date_iso.as_deref().and_then(parse_iso_end))
        .or_else(|| raw.end_date.as_deref().and_then(parse_iso_end))?;

    let token_ids = raw.clob_token_ids.as_ref()?.items();
    let labels = raw.outcomes.as_ref().map(StringList::items).unwrap_or_default();
    let (up, down) = map_tokens(&token_ids, &labels)?;

    Some(Market {
        id: raw.condition_id?,
        up_token_id: up,
        down_token_id: down,
        side,
        deadline,
        question: raw.question,
    })
}

/// Match token ids to Up/Down by outcome label, falling back to position.
pub fn map_tokens(token_ids: &[String], labels: &[String]) -> Option<(String, String)> {
    let mut up = None;
    let mut down = None;

    for (label, token) in labels.iter().zip(token_ids) {
        match label.parse::<Outcome>() {
            Ok(Outcome::Up) => up = Some(token.clone()),
            Ok(Outcome::Down) => down = Some(token.clone()),
            Err(_) => {}
        }
    }

    match (up, down) {
        (Some(up), Some(down)) => Some((up, down)),
        _ if token_ids.len() >= 2 => Some((token_ids[0].clone(), token_ids[1].clone())),
        _ => None,
    }
}

/// Question mentions a crypto asset and "up or down".
pub fn is_crypto_up_down(question: &str) -> bool {
    let q = question.to_lowercase();
    if !q.contains("up or down") {
        return false;
    }
    q.split(|c: char| !c.is_ascii_alphanumeric())
        .any(|word| CRYPTO_TERMS.contains(&word))
}

fn parse_iso_end(s: &str) -> Option<OffsetDateTime> {
    if let Ok(t) = OffsetDateTime::parse(s, &Rfc3339) {
        return Some(t);
    }
    // Date-only values resolve at midnight UTC.
    let date = Date::parse(s, time::macros::format_description!("[year]-[month]-[day]")).ok()?;
    Some(date.midnight().assume_utc())
}

/// Extract the resolution time from question text, interpreted in US Eastern time.
pub fn parse_question_deadline(question: &str, now: OffsetDateTime) -> Option<OffsetDateTime> {
    let caps = QUESTION_TIME.captures(question)?;

    let month = month_from_name(caps.get(1)?.as_str())?;
    let day: u8 = caps.get(2)?.as_str().parse().ok()?;
    let mut hour: u8 = caps.get(3)?.as_str().parse().ok()?;
    let minute: u8 = match caps.get(4) {
        Some(m) => m.as_str().parse().ok()?,
        None => 0,
    };
    let pm = caps.get(5)?.as_str().eq_ignore_ascii_case("pm");

    if hour == 0 || hour > 12 {
        return None;
    }
    if pm && hour != 12 {
        hour += 12;
    } else if !pm && hour == 12 {
        hour = 0;
    }

    let time = Time::from_hms(hour, minute, 0).ok()?;
    let at_year = |year: i32| -> Option<OffsetDateTime> {
        let date = Date::from_calendar_date(year, month, day).ok()?;
        let local = PrimitiveDateTime::new(date, time);
        Some(local.assume_offset(us_eastern_offset(local)))
    };

    let this_year = at_year(now.year())?;
    // December scan of a January market.
    if this_year < now - time::Duration::days(180) {
        return at_year(now.year() + 1);
    }
    Some(this_year)
}

fn month_from_name(name: &str) -> Option<Month> {
    let month = match name.to_lowercase().as_str() {
        "january" | "jan" => Month::January,
        "february" | "feb" => Month::February,
        "march" | "mar" => Month::March,
        "april" | "apr" => Month::April,
        "may" => Month::May,
        "june" | "jun" => Month::June,
        "july" | "jul" => Month::July,
        "august" | "aug" => Month::August,
        "september" | "sep" | "sept" => Month::September,
        "october" | "oct" => Month::October,
        "november" | "nov" => Month::November,
        "december" | "dec" => Month::December,
        _ => return None,
    };
    Some(month)
}

/// US Eastern offset for a local wall time: EDT from the second Sunday of March
/// 02:00 to the first Sunday of November 02:00, EST otherwise.
pub fn us_eastern_offset(local: PrimitiveDateTime) -> UtcOffset {
    let edt = UtcOffset::from_hms(-4, 0, 0).unwrap_or(UtcOffset::UTC);
    let est = UtcOffset::from_hms(-5, 0, 0).unwrap_or(UtcOffset::UTC);

    let year = local.year();
    let (Some(start), Some(end)) = (
        nth_sunday(year, Month::March, 2),
        nth_sunday(year, Month::November, 1),
    ) else {
        return est;
    };
    let two_am = Time::from_hms(2, 0, 0).unwrap_or(Time::MIDNIGHT);

    if local >= PrimitiveDateTime::new(start, two_am) && local < PrimitiveDateTime::new(end, two_am) {
        edt
    } else {
        est
    }
}

fn nth_sunday(year: i32, month: Month, n: u8) -> Option<Date> {
    let first = Date::from_calendar_date(year, month, 1).ok()?;
    let offset = (7 - first.weekday().number_days_from_sunday()) % 7;
    let day = 1 + offset + (n - 1) * 7;
    let date = Date::from_calendar_date(year, month, day).ok()?;
    debug_assert_eq!(date.weekday(), Weekday::Sunday);
    Some(date)
}
