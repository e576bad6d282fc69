//! Upstream JSON shapes and their pure mappings onto canonical records.
//!
//! Every upstream field is optional at the serde level; whether a field is
//! required is decided by the mapping function, which reports the offending
//! field together with a fragment of the raw payload.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use cinepoint_core::{
    truncate_on_char_boundary, BoxOfficeRecord, InsightArticle, Movie, Period, ShowtimeRanking,
};
use serde::de::{DeserializeOwned, Deserializer, Error as _};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "cinepoint-adapters";

const FRAGMENT_LIMIT: usize = 240;
const DEFAULT_RATING: &str = "SU";
const DEFAULT_CATEGORY: &str = "general";

/// Per-run mapping inputs, so the same payload always maps to the same record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapContext {
    pub fetched_at: DateTime<Utc>,
}

impl MapContext {
    pub fn new(fetched_at: DateTime<Utc>) -> Self {
        Self { fetched_at }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MappingError {
    #[error("missing required field `{field}` in {fragment}")]
    MissingField {
        field: &'static str,
        fragment: String,
    },
    #[error("malformed payload ({message}) in {fragment}")]
    Malformed { message: String, fragment: String },
}

impl MappingError {
    fn missing(field: &'static str, raw: &JsonValue) -> Self {
        MappingError::MissingField {
            field,
            fragment: fragment(raw),
        }
    }
}

/// Truncated JSON rendering of a payload for error reports.
pub fn fragment(raw: &JsonValue) -> String {
    let mut text = raw.to_string();
    if truncate_on_char_boundary(&mut text, FRAGMENT_LIMIT) {
        text.push_str("...");
    }
    text
}

/// One page of a `{ data: { items, total } }` list response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub items: Vec<JsonValue>,
    pub total: Option<u64>,
}

impl Page {
    /// A body without `data.items` is read as an empty page.
    pub fn from_body(body: &JsonValue) -> Self {
        let data = body.get("data").unwrap_or(&JsonValue::Null);
        let items = data
            .get("items")
            .and_then(JsonValue::as_array)
            .cloned()
            .unwrap_or_default();
        let total = data.get("total").and_then(|t| match t {
            JsonValue::Number(n) => n.as_u64(),
            JsonValue::String(s) => s.trim().parse().ok(),
            _ => None,
        });
        Self { items, total }
    }

    /// Whether no page after `page` (zero-indexed) can hold more items.
    pub fn is_last(&self, page: u32, limit: u32) -> bool {
        if self.items.is_empty() {
            return true;
        }
        match self.total {
            Some(total) => (u64::from(page) + 1) * u64::from(limit) >= total,
            None => self.items.len() < limit as usize,
        }
    }
}

/// The `data` object of a detail response, or the body itself if unwrapped.
pub fn detail_data(body: &JsonValue) -> &JsonValue {
    match body.get("data") {
        Some(data) if data.is_object() => data,
        _ => body,
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum PersonRef {
    Named { name: String },
    Plain(String),
}

impl PersonRef {
    fn into_name(self) -> String {
        match self {
            PersonRef::Named { name } => name,
            PersonRef::Plain(name) => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum StringList {
    Many(Vec<String>),
    One(String),
}

impl StringList {
    fn into_vec(self) -> Vec<String> {
        match self {
            StringList::Many(values) => values,
            StringList::One(value) => value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MovieDirectoryItem {
    #[serde(deserialize_with = "lenient_i64")]
    pub id: Option<i64>,
    pub title: Option<String>,
    pub original_title: Option<String>,
    pub poster: Option<String>,
    pub backdrop: Option<String>,
    pub genre: Option<StringList>,
    #[serde(deserialize_with = "lenient_i64")]
    pub duration: Option<i64>,
    pub release_date: Option<String>,
    pub country: Option<String>,
    pub rating: Option<String>,
    pub synopsis: Option<String>,
    pub cast: Option<Vec<PersonRef>>,
    pub directors: Option<Vec<PersonRef>>,
    #[serde(alias = "cinepointScore", deserialize_with = "lenient_f64")]
    pub cinepoint_score: Option<f64>,
    #[serde(alias = "totalAdmissions", deserialize_with = "lenient_i64")]
    pub total_admissions: Option<i64>,
    pub status: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BoxOfficeItem {
    #[serde(deserialize_with = "lenient_i64")]
    pub id: Option<i64>,
    pub title: Option<String>,
    #[serde(deserialize_with = "lenient_i64")]
    pub admission: Option<i64>,
    #[serde(deserialize_with = "lenient_i64")]
    pub admission_total: Option<i64>,
    #[serde(deserialize_with = "lenient_i64")]
    pub rank: Option<i64>,
    #[serde(deserialize_with = "lenient_i64")]
    pub rank_delta: Option<i64>,
    #[serde(alias = "showtime_count", deserialize_with = "lenient_i64")]
    pub showtime: Option<i64>,
    #[serde(alias = "showtime_pct", deserialize_with = "lenient_f64")]
    pub market_share: Option<f64>,
    #[serde(alias = "admission_change", deserialize_with = "lenient_f64")]
    pub admission_delta: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DailyShowtimeItem {
    #[serde(deserialize_with = "lenient_i64")]
    pub id: Option<i64>,
    pub title: Option<String>,
    #[serde(deserialize_with = "lenient_f64")]
    pub showtime_pct: Option<f64>,
    #[serde(deserialize_with = "lenient_i64")]
    pub showtime_count: Option<i64>,
    #[serde(deserialize_with = "lenient_i64")]
    pub showtime_delta: Option<i64>,
    #[serde(deserialize_with = "lenient_i64")]
    pub rank: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct InsightListItem {
    #[serde(deserialize_with = "lenient_string")]
    pub id: Option<String>,
    pub slug: Option<String>,
    pub title: Option<String>,
    pub excerpt: Option<String>,
    pub image: Option<String>,
    pub published_at: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct InsightDetail {
    pub title: Option<String>,
    pub excerpt: Option<String>,
    pub content: Option<String>,
    pub category: Option<String>,
    pub image: Option<String>,
    pub published_at: Option<String>,
}

fn lenient_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    match Option::<JsonValue>::deserialize(deserializer)? {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
            .map(Some)
            .ok_or_else(|| D::Error::custom(format!("expected integer, got {n}"))),
        Some(JsonValue::String(s)) if s.trim().is_empty() => Ok(None),
        Some(JsonValue::String(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| D::Error::custom(format!("expected integer, got \"{s}\""))),
        Some(other) => Err(D::Error::custom(format!("expected integer, got {other}"))),
    }
}

fn lenient_f64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
    match Option::<JsonValue>::deserialize(deserializer)? {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::Number(n)) => Ok(n.as_f64()),
        Some(JsonValue::String(s)) if s.trim().is_empty() => Ok(None),
        Some(JsonValue::String(s)) => s
            .trim()
            .trim_end_matches('%')
            .parse()
            .map(Some)
            .map_err(|_| D::Error::custom(format!("expected number, got \"{s}\""))),
        Some(other) => Err(D::Error::custom(format!("expected number, got {other}"))),
    }
}

fn lenient_string<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    match Option::<JsonValue>::deserialize(deserializer)? {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::String(s)) => Ok(Some(s)),
        Some(JsonValue::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(D::Error::custom(format!("expected string id, got {other}"))),
    }
}

fn decode<T: DeserializeOwned>(raw: &JsonValue) -> Result<T, MappingError> {
    if !raw.is_object() {
        return Err(MappingError::Malformed {
            message: "expected a json object".to_string(),
            fragment: fragment(raw),
        });
    }
    T::deserialize(raw).map_err(|err| MappingError::Malformed {
        message: err.to_string(),
        fragment: fragment(raw),
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|v| {
        let trimmed = v.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

fn names(people: Option<Vec<PersonRef>>) -> Vec<String> {
    people
        .unwrap_or_default()
        .into_iter()
        .filter_map(|p| non_empty(Some(p.into_name())))
        .collect()
}

fn parse_date(value: &str) -> Option<NaiveDate> {
    let head = value.trim().get(..10)?;
    NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    parse_date(value)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

pub fn map_movie(raw: &JsonValue, ctx: &MapContext) -> Result<Movie, MappingError> {
    let item: MovieDirectoryItem = decode(raw)?;
    let id = item.id.ok_or_else(|| MappingError::missing("id", raw))?;
    let title = non_empty(item.title).ok_or_else(|| MappingError::missing("title", raw))?;

    Ok(Movie {
        id,
        title,
        original_title: non_empty(item.original_title),
        poster_url: non_empty(item.poster),
        backdrop_url: non_empty(item.backdrop),
        genres: item.genre.map(StringList::into_vec).unwrap_or_default(),
        duration_minutes: item.duration,
        release_date: item.release_date.as_deref().and_then(parse_date),
        country: non_empty(item.country),
        rating: non_empty(item.rating).unwrap_or_else(|| DEFAULT_RATING.to_string()),
        synopsis: item.synopsis.unwrap_or_default(),
        cast: names(item.cast),
        directors: names(item.directors),
        score: item.cinepoint_score,
        total_admissions: item.total_admissions,
        status: non_empty(item.status),
        last_updated: ctx.fetched_at,
    })
}

pub fn map_box_office(
    raw: &JsonValue,
    date: NaiveDate,
    period: Period,
    ctx: &MapContext,
) -> Result<BoxOfficeRecord, MappingError> {
    let item: BoxOfficeItem = decode(raw)?;
    let movie_id = item.id.ok_or_else(|| MappingError::missing("id", raw))?;
    let rank = item.rank.ok_or_else(|| MappingError::missing("rank", raw))?;

    Ok(BoxOfficeRecord {
        movie_id,
        movie_title: non_empty(item.title).unwrap_or_default(),
        date,
        period,
        rank,
        admissions: item.admission.unwrap_or(0),
        total_admissions: item.admission_total.unwrap_or(0),
        showtimes: item.showtime,
        market_share: item.market_share,
        rank_change: item.rank_delta,
        admission_change: item.admission_delta,
        scraped_at: ctx.fetched_at,
    })
}

pub fn map_showtime(
    raw: &JsonValue,
    date: NaiveDate,
    ctx: &MapContext,
) -> Result<ShowtimeRanking, MappingError> {
    let item: DailyShowtimeItem = decode(raw)?;
    let movie_id = item.id.ok_or_else(|| MappingError::missing("id", raw))?;
    let rank = item.rank.ok_or_else(|| MappingError::missing("rank", raw))?;

    Ok(ShowtimeRanking {
        movie_id,
        movie_title: non_empty(item.title).unwrap_or_default(),
        date,
        rank,
        showtime_count: item.showtime_count.unwrap_or(0),
        showtime_change: item.showtime_delta.unwrap_or(0),
        market_share_percent: item.showtime_pct.unwrap_or(0.0),
        scraped_at: ctx.fetched_at,
    })
}

/// Identity of an insight list entry: `(id, slug)`, each falling back to the other.
pub fn insight_key(raw: &JsonValue) -> Result<(String, String), MappingError> {
    let item: InsightListItem = decode(raw)?;
    let id = non_empty(item.id);
    let slug = non_empty(item.slug);
    match (id, slug) {
        (Some(id), Some(slug)) => Ok((id, slug)),
        (Some(id), None) => Ok((id.clone(), id)),
        (None, Some(slug)) => Ok((slug.clone(), slug)),
        (None, None) => Err(MappingError::missing("id", raw)),
    }
}

/// Combines a list entry with its detail payload; detail values win.
pub fn map_insight(
    list_raw: &JsonValue,
    detail_raw: Option<&JsonValue>,
    ctx: &MapContext,
) -> Result<InsightArticle, MappingError> {
    let (id, slug) = insight_key(list_raw)?;
    let item: InsightListItem = decode(list_raw)?;
    let detail: InsightDetail = match detail_raw {
        Some(raw) => decode(detail_data(raw))?,
        None => InsightDetail::default(),
    };

    let published_at = non_empty(detail.published_at)
        .or(non_empty(item.published_at))
        .as_deref()
        .and_then(parse_timestamp);

    Ok(InsightArticle {
        title: non_empty(detail.title)
            .or(non_empty(item.title))
            .unwrap_or_else(|| slug.clone()),
        excerpt: non_empty(item.excerpt)
            .or(non_empty(detail.excerpt))
            .unwrap_or_default(),
        content: detail.content.unwrap_or_default(),
        category: non_empty(detail.category).unwrap_or_else(|| DEFAULT_CATEGORY.to_string()),
        image_url: non_empty(detail.image).or(non_empty(item.image)),
        published_at,
        scraped_at: ctx.fetched_at,
        id,
        slug,
    })
}

/// Records that mapped cleanly plus the per-item failures.
#[derive(Debug, Clone, PartialEq)]
pub struct MapOutcome<T> {
    pub records: Vec<T>,
    pub failures: Vec<MappingError>,
}

pub fn map_all<T, F>(items: &[JsonValue], mut map: F) -> MapOutcome<T>
where
    F: FnMut(&JsonValue) -> Result<T, MappingError>,
{
    let mut records = Vec::with_capacity(items.len());
    let mut failures = Vec::new();
    for item in items {
        match map(item) {
            Ok(record) => records.push(record),
            Err(err) => failures.push(err),
        }
    }
    MapOutcome { records, failures }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn ctx() -> MapContext {
        MapContext::new(Utc.with_ymd_and_hms(2024, 12, 16, 1, 0, 0).single().expect("ts"))
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").expect("date")
    }

    fn directory_item() -> JsonValue {
        json!({
            "id": 3121,
            "title": "Agak Laen",
            "poster": "https://img.example/agak-laen.jpg",
            "genre": ["Comedy", "Horror"],
            "duration": 119,
            "release_date": "2024-02-01",
            "country": "Local",
            "rating": "R13+",
            "synopsis": "Four friends run a haunted house.",
            "cast": [{ "name": "Bene Dion" }, { "name": "Oki Rengga" }],
            "directors": [{ "name": "Muhadkly Acho" }],
            "status": "now_playing"
        })
    }

    #[test]
    fn mapping_same_directory_item_twice_is_deterministic() {
        let raw = directory_item();
        let first = map_movie(&raw, &ctx()).expect("first");
        let second = map_movie(&raw, &ctx()).expect("second");
        assert_eq!(first, second);
        assert_eq!(first.id, 3121);
        assert_eq!(first.cast, vec!["Bene Dion", "Oki Rengga"]);
        assert_eq!(first.release_date, Some(date("2024-02-01")));
    }

    #[test]
    fn absent_optional_fields_map_to_none_or_defaults() {
        let raw = json!({ "id": 7, "title": "Sparse" });
        let movie = map_movie(&raw, &ctx()).expect("sparse movie");
        assert_eq!(movie.original_title, None);
        assert_eq!(movie.poster_url, None);
        assert!(movie.genres.is_empty());
        assert_eq!(movie.rating, "SU");
        assert_eq!(movie.synopsis, "");
        assert_eq!(movie.status, None);
    }

    #[test]
    fn missing_movie_id_names_the_field_and_payload() {
        let raw = json!({ "title": "No Id" });
        match map_movie(&raw, &ctx()) {
            Err(MappingError::MissingField { field, fragment }) => {
                assert_eq!(field, "id");
                assert!(fragment.contains("No Id"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn wrongly_typed_id_is_malformed() {
        let raw = json!({ "id": "abc", "title": "Bad" });
        assert!(matches!(
            map_movie(&raw, &ctx()),
            Err(MappingError::Malformed { .. })
        ));
        assert!(matches!(
            map_movie(&json!([1, 2]), &ctx()),
            Err(MappingError::Malformed { .. })
        ));
    }

    #[test]
    fn numeric_strings_and_plain_names_are_tolerated() {
        let raw = json!({
            "id": "44",
            "title": "Lenient",
            "genre": "Drama, Family",
            "cast": ["A", { "name": "B" }]
        });
        let movie = map_movie(&raw, &ctx()).expect("lenient");
        assert_eq!(movie.id, 44);
        assert_eq!(movie.genres, vec!["Drama", "Family"]);
        assert_eq!(movie.cast, vec!["A", "B"]);
    }

    #[test]
    fn box_office_item_maps_with_period_and_date() {
        let raw = json!({
            "id": 10,
            "title": "Moana 2",
            "admission": 52000,
            "admission_total": 1200000,
            "rank": 2,
            "rank_delta": -1
        });
        let record = map_box_office(&raw, date("2024-12-15"), Period::Weekly, &ctx()).expect("bo");
        assert_eq!(record.document_id(), "10_2024-12-15_weekly");
        assert_eq!(record.rank_change, Some(-1));
        assert_eq!(record.showtimes, None);
        assert_eq!(record.scraped_at, ctx().fetched_at);

        let missing_rank = json!({ "id": 10 });
        assert!(matches!(
            map_box_office(&missing_rank, date("2024-12-15"), Period::Daily, &ctx()),
            Err(MappingError::MissingField { field: "rank", .. })
        ));
    }

    #[test]
    fn showtime_item_maps_percentages() {
        let raw = json!({
            "id": 5,
            "title": "Wicked",
            "showtime_pct": "12.5%",
            "showtime_count": 840,
            "showtime_delta": -20,
            "rank": 3
        });
        let ranking = map_showtime(&raw, date("2024-12-15"), &ctx()).expect("showtime");
        assert_eq!(ranking.market_share_percent, 12.5);
        assert_eq!(ranking.showtime_change, -20);
        assert_eq!(ranking.document_id(), "5_2024-12-15");
    }

    #[test]
    fn insight_prefers_detail_values_and_falls_back_to_slug() {
        let list = json!({
            "slug": "box-office-recap-2024",
            "title": "List title",
            "excerpt": "Short",
            "image": "https://img.example/list.jpg",
            "published_at": "2024-12-10"
        });
        let detail = json!({
            "data": {
                "title": "Full title",
                "content": "<p>Body</p>",
                "published_at": "2024-12-10T08:30:00+07:00"
            }
        });
        let article = map_insight(&list, Some(&detail), &ctx()).expect("insight");
        assert_eq!(article.id, "box-office-recap-2024");
        assert_eq!(article.title, "Full title");
        assert_eq!(article.excerpt, "Short");
        assert_eq!(article.category, "general");
        assert_eq!(article.image_url.as_deref(), Some("https://img.example/list.jpg"));
        assert_eq!(
            article.published_at,
            Utc.with_ymd_and_hms(2024, 12, 10, 1, 30, 0).single()
        );

        assert_eq!(
            insight_key(&json!({ "id": 991, "slug": "x" })).expect("key"),
            ("991".to_string(), "x".to_string())
        );
        assert!(insight_key(&json!({ "title": "orphan" })).is_err());
    }

    #[test]
    fn page_end_detection_uses_total_or_short_page() {
        let body = json!({ "data": { "items": [{}, {}], "total": 4 } });
        let page = Page::from_body(&body);
        assert!(!page.is_last(0, 2));
        assert!(page.is_last(1, 2));

        let untotalled = Page::from_body(&json!({ "data": { "items": [{}] } }));
        assert!(untotalled.is_last(0, 50));

        let empty = Page::from_body(&json!({ "status": 200 }));
        assert!(empty.items.is_empty());
        assert!(empty.is_last(0, 50));
    }

    #[test]
    fn map_all_separates_failures_from_records() {
        let items = vec![
            json!({ "id": 1, "rank": 1 }),
            json!({ "rank": 2 }),
            json!({ "id": 3, "rank": 3 }),
        ];
        let outcome = map_all(&items, |raw| map_showtime(raw, date("2024-12-15"), &ctx()));
        assert_eq!(outcome.records.len(), 2);
        assert_eq!(outcome.failures.len(), 1);
    }

    #[test]
    fn long_fragments_are_truncated() {
        let raw = json!({ "content": "x".repeat(1000) });
        let text = fragment(&raw);
        assert!(text.len() <= FRAGMENT_LIMIT + 3);
        assert!(text.ends_with("..."));
    }
}
