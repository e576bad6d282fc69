//! Canonical record types shared by the Cinepoint ingestion crates.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Days, Months, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "cinepoint-core";

/// Upper bound, in bytes, on response bodies quoted in error messages.
pub const ERROR_BODY_LIMIT: usize = 500;

/// Cuts `text` to at most `max` bytes without splitting a character.
/// Returns whether anything was removed.
pub fn truncate_on_char_boundary(text: &mut String, max: usize) -> bool {
    if text.len() <= max {
        return false;
    }
    let cut = (0..=max).rev().find(|i| text.is_char_boundary(*i)).unwrap_or(0);
    text.truncate(cut);
    true
}

/// Reporting period of a box-office ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl Period {
    pub const ALL: [Period; 4] = [
        Period::Daily,
        Period::Weekly,
        Period::Monthly,
        Period::Yearly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Period::Daily => "daily",
            Period::Weekly => "weekly",
            Period::Monthly => "monthly",
            Period::Yearly => "yearly",
        }
    }

    /// The date `steps` periods before `date`. Month arithmetic is taken from
    /// `date` each time so month-end dates do not drift.
    pub fn steps_before(&self, date: NaiveDate, steps: u32) -> Option<NaiveDate> {
        match self {
            Period::Daily => date.checked_sub_days(Days::new(u64::from(steps))),
            Period::Weekly => date.checked_sub_days(Days::new(7 * u64::from(steps))),
            Period::Monthly => date.checked_sub_months(Months::new(steps)),
            Period::Yearly => date.checked_sub_months(Months::new(steps.checked_mul(12)?)),
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} `{value}`")]
pub struct ParseKeyError {
    pub kind: &'static str,
    pub value: String,
}

impl FromStr for Period {
    type Err = ParseKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "daily" => Ok(Period::Daily),
            "weekly" => Ok(Period::Weekly),
            "monthly" => Ok(Period::Monthly),
            "yearly" => Ok(Period::Yearly),
            _ => Err(ParseKeyError {
                kind: "period",
                value: s.to_string(),
            }),
        }
    }
}

/// One independently synced record stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stream {
    Movies,
    BoxOffice(Period),
    Showtimes,
    Insights,
}

impl Stream {
    /// Every stream in the order a full run visits them.
    pub fn all() -> Vec<Stream> {
        let mut streams = vec![Stream::Movies, Stream::Showtimes];
        streams.extend(Period::ALL.into_iter().map(Stream::BoxOffice));
        streams.push(Stream::Insights);
        streams
    }

    pub fn key(&self) -> String {
        match self {
            Stream::Movies => "movies".to_string(),
            Stream::BoxOffice(period) => format!("box_office:{period}"),
            Stream::Showtimes => "showtimes".to_string(),
            Stream::Insights => "insights".to_string(),
        }
    }

    /// Streams whose records are addressed by calendar date.
    pub fn is_date_addressed(&self) -> bool {
        matches!(self, Stream::BoxOffice(_) | Stream::Showtimes)
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

impl FromStr for Stream {
    type Err = ParseKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim().to_ascii_lowercase();
        match key.as_str() {
            "movies" => Ok(Stream::Movies),
            "showtimes" => Ok(Stream::Showtimes),
            "insights" => Ok(Stream::Insights),
            "box_office" => Ok(Stream::BoxOffice(Period::Daily)),
            other => match other.strip_prefix("box_office:") {
                Some(period) => period.parse().map(Stream::BoxOffice).map_err(|_| ParseKeyError {
                    kind: "stream",
                    value: s.to_string(),
                }),
                None => Err(ParseKeyError {
                    kind: "stream",
                    value: s.to_string(),
                }),
            },
        }
    }
}

/// Movie directory entry. Identity is the upstream numeric id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Movie {
    pub id: i64,
    pub title: String,
    pub original_title: Option<String>,
    pub poster_url: Option<String>,
    pub backdrop_url: Option<String>,
    pub genres: Vec<String>,
    pub duration_minutes: Option<i64>,
    pub release_date: Option<NaiveDate>,
    pub country: Option<String>,
    pub rating: String,
    pub synopsis: String,
    pub cast: Vec<String>,
    pub directors: Vec<String>,
    pub score: Option<f64>,
    pub total_admissions: Option<i64>,
    pub status: Option<String>,
    pub last_updated: DateTime<Utc>,
}

impl Movie {
    pub fn document_id(&self) -> String {
        self.id.to_string()
    }
}

/// Box-office ranking row, one per `(movie_id, date, period)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoxOfficeRecord {
    pub movie_id: i64,
    pub movie_title: String,
    pub date: NaiveDate,
    pub period: Period,
    pub rank: i64,
    pub admissions: i64,
    pub total_admissions: i64,
    pub showtimes: Option<i64>,
    pub market_share: Option<f64>,
    pub rank_change: Option<i64>,
    pub admission_change: Option<f64>,
    pub scraped_at: DateTime<Utc>,
}

impl BoxOfficeRecord {
    pub fn document_id(&self) -> String {
        format!("{}_{}_{}", self.movie_id, self.date, self.period)
    }
}

/// Daily showtime ranking row, one per `(movie_id, date)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShowtimeRanking {
    pub movie_id: i64,
    pub movie_title: String,
    pub date: NaiveDate,
    pub rank: i64,
    pub showtime_count: i64,
    pub showtime_change: i64,
    pub market_share_percent: f64,
    pub scraped_at: DateTime<Utc>,
}

impl ShowtimeRanking {
    pub fn document_id(&self) -> String {
        format!("{}_{}", self.movie_id, self.date)
    }
}

/// Editorial article. Content is replaced on refetch, never appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsightArticle {
    pub id: String,
    pub title: String,
    pub slug: String,
    pub excerpt: String,
    pub content: String,
    pub category: String,
    pub image_url: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub scraped_at: DateTime<Utc>,
}

/// Inclusive calendar date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    /// Returns `None` when `start` is after `end`.
    pub fn new(start: NaiveDate, end: NaiveDate) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    pub fn days(&self) -> impl Iterator<Item = NaiveDate> {
        let end = self.end;
        self.start.iter_days().take_while(move |day| *day <= end)
    }

    pub fn len_days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    /// Period end dates inside the range, oldest first, stepping back from
    /// `end`. A non-empty range always yields `end` last.
    pub fn period_ends(&self, period: Period) -> Vec<NaiveDate> {
        let mut dates = Vec::new();
        for step in 0.. {
            match period.steps_before(self.end, step) {
                Some(date) if date >= self.start => dates.push(date),
                _ => break,
            }
        }
        dates.reverse();
        dates
    }
}

/// Structured `details` payload written with a stream's sync log entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncDetails {
    pub run_id: Option<Uuid>,
    pub status: String,
    pub fetched: usize,
    pub written: usize,
    pub skipped: usize,
    pub date_range: Option<DateRange>,
    pub error_kind: Option<String>,
    pub error: Option<String>,
}

/// Append-only audit record of one sync outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncLogEntry {
    #[serde(rename = "type")]
    pub kind: String,
    pub details: JsonValue,
    pub timestamp: DateTime<Utc>,
}

impl SyncLogEntry {
    pub fn new(kind: impl Into<String>, details: JsonValue) -> Self {
        Self {
            kind: kind.into(),
            details,
            timestamp: Utc::now(),
        }
    }

    pub fn for_stream(stream: Stream, details: &SyncDetails) -> Self {
        let details = serde_json::to_value(details).unwrap_or(JsonValue::Null);
        Self::new(stream.key(), details)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").expect("date")
    }

    #[test]
    fn stream_keys_round_trip_through_from_str() {
        for stream in Stream::all() {
            assert_eq!(stream.key().parse::<Stream>().expect("parse"), stream);
        }
        assert_eq!(
            "box_office".parse::<Stream>().expect("alias"),
            Stream::BoxOffice(Period::Daily)
        );
        assert!("box_office:hourly".parse::<Stream>().is_err());
        assert!("theatres".parse::<Stream>().is_err());
    }

    #[test]
    fn full_run_covers_seven_streams() {
        let streams = Stream::all();
        assert_eq!(streams.len(), 7);
        assert_eq!(streams.iter().filter(|s| s.is_date_addressed()).count(), 5);
    }

    #[test]
    fn composite_ids_keep_periods_apart() {
        let scraped_at = Utc::now();
        let daily = BoxOfficeRecord {
            movie_id: 42,
            movie_title: "Agak Laen".into(),
            date: date("2024-12-15"),
            period: Period::Daily,
            rank: 1,
            admissions: 10,
            total_admissions: 100,
            showtimes: None,
            market_share: None,
            rank_change: None,
            admission_change: None,
            scraped_at,
        };
        let weekly = BoxOfficeRecord {
            period: Period::Weekly,
            ..daily.clone()
        };
        assert_eq!(daily.document_id(), "42_2024-12-15_daily");
        assert_ne!(daily.document_id(), weekly.document_id());
    }

    #[test]
    fn date_range_iterates_inclusive_days() {
        let range = DateRange::new(date("2024-12-30"), date("2025-01-02")).expect("range");
        let days: Vec<_> = range.days().collect();
        assert_eq!(days.len(), 4);
        assert_eq!(range.len_days(), 4);
        assert_eq!(days.last().copied(), Some(date("2025-01-02")));
        assert!(DateRange::new(date("2025-01-02"), date("2025-01-01")).is_none());
    }

    #[test]
    fn period_ends_step_by_period_from_the_end() {
        let range = DateRange::new(date("2024-12-02"), date("2024-12-15")).expect("range");
        assert_eq!(range.period_ends(Period::Daily).len(), 14);
        assert_eq!(
            range.period_ends(Period::Weekly),
            vec![date("2024-12-08"), date("2024-12-15")]
        );
        assert_eq!(range.period_ends(Period::Monthly), vec![date("2024-12-15")]);

        let quarter = DateRange::new(date("2024-01-01"), date("2024-03-31")).expect("range");
        assert_eq!(
            quarter.period_ends(Period::Monthly),
            vec![date("2024-01-31"), date("2024-02-29"), date("2024-03-31")]
        );

        let decade = DateRange::new(date("2022-06-01"), date("2024-12-15")).expect("range");
        assert_eq!(
            decade.period_ends(Period::Yearly),
            vec![date("2022-12-15"), date("2023-12-15"), date("2024-12-15")]
        );
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let mut short = "ok".to_string();
        assert!(!truncate_on_char_boundary(&mut short, 10));
        assert_eq!(short, "ok");

        let mut text = "héllo".to_string();
        assert!(truncate_on_char_boundary(&mut text, 2));
        assert_eq!(text, "h");
    }

    #[test]
    fn sync_log_entry_serializes_type_field() {
        let details = SyncDetails {
            status: "success".into(),
            fetched: 3,
            written: 3,
            ..Default::default()
        };
        let entry = SyncLogEntry::for_stream(Stream::Showtimes, &details);
        let json = serde_json::to_value(&entry).expect("json");
        assert_eq!(json["type"], "showtimes");
        assert_eq!(json["details"]["written"], 3);
    }
}
