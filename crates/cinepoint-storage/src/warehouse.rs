//! Analytics warehouse backend: fixed table schemas, append-only inserts.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use cinepoint_core::{
    BoxOfficeRecord, InsightArticle, Movie, Period, ShowtimeRanking, Stream, SyncLogEntry,
};
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info};

use crate::{
    expect_success, google_http_client, read_json, truncated_body, StorageBackend, StorageError,
    UpsertGuarantee,
};

pub const DEFAULT_PROJECT_ID: &str = "cineradar-481014";
pub const DEFAULT_DATASET: &str = "cinepoint";
pub const DEFAULT_LOCATION: &str = "asia-southeast1";
pub const DEFAULT_BIGQUERY_URL: &str = "https://bigquery.googleapis.com/bigquery/v2";

const INSERT_CHUNK: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub kind: &'static str,
    pub mode: &'static str,
}

const fn col(name: &'static str, kind: &'static str, mode: &'static str) -> Column {
    Column { name, kind, mode }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSpec {
    pub name: &'static str,
    pub columns: &'static [Column],
}

impl TableSpec {
    pub fn schema_json(&self) -> JsonValue {
        let fields = self
            .columns
            .iter()
            .map(|c| json!({ "name": c.name, "type": c.kind, "mode": c.mode }))
            .collect::<Vec<_>>();
        json!({ "fields": fields })
    }
}

pub const MOVIES: TableSpec = TableSpec {
    name: "movies",
    columns: &[
        col("id", "INTEGER", "REQUIRED"),
        col("title", "STRING", "REQUIRED"),
        col("original_title", "STRING", "NULLABLE"),
        col("poster_url", "STRING", "NULLABLE"),
        col("backdrop_url", "STRING", "NULLABLE"),
        col("genre", "STRING", "REPEATED"),
        col("duration", "INTEGER", "NULLABLE"),
        col("release_date", "DATE", "NULLABLE"),
        col("country", "STRING", "NULLABLE"),
        col("rating", "STRING", "NULLABLE"),
        col("synopsis", "STRING", "NULLABLE"),
        col("cast", "STRING", "REPEATED"),
        col("directors", "STRING", "REPEATED"),
        col("cinepoint_score", "FLOAT", "NULLABLE"),
        col("total_admissions", "INTEGER", "NULLABLE"),
        col("status", "STRING", "NULLABLE"),
        col("last_updated", "TIMESTAMP", "NULLABLE"),
    ],
};

pub const BOX_OFFICE: TableSpec = TableSpec {
    name: "box_office",
    columns: &[
        col("movie_id", "INTEGER", "REQUIRED"),
        col("movie_title", "STRING", "NULLABLE"),
        col("date", "DATE", "REQUIRED"),
        col("period", "STRING", "REQUIRED"),
        col("rank", "INTEGER", "NULLABLE"),
        col("admissions", "INTEGER", "NULLABLE"),
        col("total_admissions", "INTEGER", "NULLABLE"),
        col("showtimes", "INTEGER", "NULLABLE"),
        col("market_share", "FLOAT", "NULLABLE"),
        col("rank_change", "INTEGER", "NULLABLE"),
        col("admission_change", "FLOAT", "NULLABLE"),
        col("scraped_at", "TIMESTAMP", "NULLABLE"),
    ],
};

pub const SHOWTIMES: TableSpec = TableSpec {
    name: "showtimes",
    columns: &[
        col("movie_id", "INTEGER", "REQUIRED"),
        col("movie_title", "STRING", "NULLABLE"),
        col("date", "DATE", "REQUIRED"),
        col("rank", "INTEGER", "NULLABLE"),
        col("showtime_count", "INTEGER", "NULLABLE"),
        col("showtime_change", "INTEGER", "NULLABLE"),
        col("market_share_percent", "FLOAT", "NULLABLE"),
        col("scraped_at", "TIMESTAMP", "NULLABLE"),
    ],
};

pub const INSIGHTS: TableSpec = TableSpec {
    name: "insights",
    columns: &[
        col("id", "STRING", "REQUIRED"),
        col("title", "STRING", "NULLABLE"),
        col("slug", "STRING", "NULLABLE"),
        col("excerpt", "STRING", "NULLABLE"),
        col("content", "STRING", "NULLABLE"),
        col("published_at", "TIMESTAMP", "NULLABLE"),
        col("category", "STRING", "NULLABLE"),
        col("image_url", "STRING", "NULLABLE"),
        col("scraped_at", "TIMESTAMP", "NULLABLE"),
    ],
};

pub const SYNC_LOG: TableSpec = TableSpec {
    name: "sync_log",
    columns: &[
        col("type", "STRING", "NULLABLE"),
        col("details", "JSON", "NULLABLE"),
        col("timestamp", "TIMESTAMP", "NULLABLE"),
    ],
};

pub const TABLES: [TableSpec; 5] = [MOVIES, BOX_OFFICE, SHOWTIMES, INSIGHTS, SYNC_LOG];

/// One `insertAll` row. `insert_id` lets the warehouse drop verbatim retries.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertRow {
    pub insert_id: String,
    pub json: JsonValue,
}

impl InsertRow {
    pub fn new(table: &str, json: JsonValue) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(table.as_bytes());
        hasher.update(b"\n");
        hasher.update(json.to_string().as_bytes());
        Self {
            insert_id: hex::encode(hasher.finalize()),
            json,
        }
    }
}

/// `MAX(date)` lookup behind a stream's watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxDateQuery {
    pub table: &'static str,
    pub column: &'static str,
    /// The column is a TIMESTAMP and is truncated with `DATE(..)`.
    pub timestamp: bool,
    pub period: Option<Period>,
}

impl MaxDateQuery {
    pub fn for_stream(stream: Stream) -> Self {
        match stream {
            Stream::Movies => Self {
                table: MOVIES.name,
                column: "last_updated",
                timestamp: true,
                period: None,
            },
            Stream::BoxOffice(period) => Self {
                table: BOX_OFFICE.name,
                column: "date",
                timestamp: false,
                period: Some(period),
            },
            Stream::Showtimes => Self {
                table: SHOWTIMES.name,
                column: "date",
                timestamp: false,
                period: None,
            },
            Stream::Insights => Self {
                table: INSIGHTS.name,
                column: "published_at",
                timestamp: true,
                period: None,
            },
        }
    }

    pub fn to_sql(&self, project_id: &str, dataset: &str) -> String {
        let expr = if self.timestamp {
            format!("DATE({})", self.column)
        } else {
            self.column.to_string()
        };
        let mut sql = format!(
            "SELECT MAX({expr}) AS latest_date FROM `{project_id}.{dataset}.{}`",
            self.table
        );
        if self.period.is_some() {
            sql.push_str(" WHERE period = @period");
        }
        sql
    }
}

fn movie_row(m: &Movie) -> JsonValue {
    json!({
        "id": m.id,
        "title": m.title,
        "original_title": m.original_title,
        "poster_url": m.poster_url,
        "backdrop_url": m.backdrop_url,
        "genre": m.genres,
        "duration": m.duration_minutes,
        "release_date": m.release_date,
        "country": m.country,
        "rating": m.rating,
        "synopsis": m.synopsis,
        "cast": m.cast,
        "directors": m.directors,
        "cinepoint_score": m.score,
        "total_admissions": m.total_admissions,
        "status": m.status,
        "last_updated": m.last_updated,
    })
}

fn box_office_row(r: &BoxOfficeRecord) -> JsonValue {
    json!({
        "movie_id": r.movie_id,
        "movie_title": r.movie_title,
        "date": r.date,
        "period": r.period,
        "rank": r.rank,
        "admissions": r.admissions,
        "total_admissions": r.total_admissions,
        "showtimes": r.showtimes,
        "market_share": r.market_share,
        "rank_change": r.rank_change,
        "admission_change": r.admission_change,
        "scraped_at": r.scraped_at,
    })
}

fn showtime_row(r: &ShowtimeRanking) -> JsonValue {
    json!({
        "movie_id": r.movie_id,
        "movie_title": r.movie_title,
        "date": r.date,
        "rank": r.rank,
        "showtime_count": r.showtime_count,
        "showtime_change": r.showtime_change,
        "market_share_percent": r.market_share_percent,
        "scraped_at": r.scraped_at,
    })
}

fn insight_row(a: &InsightArticle) -> JsonValue {
    json!({
        "id": a.id,
        "title": a.title,
        "slug": a.slug,
        "excerpt": a.excerpt,
        "content": a.content,
        "published_at": a.published_at,
        "category": a.category,
        "image_url": a.image_url,
        "scraped_at": a.scraped_at,
    })
}

fn sync_log_row(entry: &SyncLogEntry) -> JsonValue {
    // JSON columns take their value as an encoded string.
    json!({
        "type": entry.kind,
        "details": entry.details.to_string(),
        "timestamp": entry.timestamp,
    })
}

/// Calls the warehouse makes against its service.
#[async_trait]
pub trait WarehouseApi: Send + Sync {
    /// Creates the dataset if absent. An "already exists" answer is success.
    async fn ensure_dataset(&self) -> Result<(), StorageError>;

    async fn ensure_table(&self, table: &TableSpec) -> Result<(), StorageError>;

    async fn insert_rows(&self, table: &str, rows: Vec<InsertRow>) -> Result<usize, StorageError>;

    async fn max_date(&self, query: &MaxDateQuery) -> Result<Option<NaiveDate>, StorageError>;

    async fn distinct_strings(&self, table: &str, column: &str)
        -> Result<Vec<String>, StorageError>;
}

#[derive(Debug, Clone)]
pub struct BigQueryConfig {
    pub project_id: String,
    pub dataset: String,
    pub location: String,
    pub access_token: String,
    pub base_url: String,
    pub timeout: Duration,
}

impl BigQueryConfig {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            project_id: DEFAULT_PROJECT_ID.to_string(),
            dataset: DEFAULT_DATASET.to_string(),
            location: DEFAULT_LOCATION.to_string(),
            access_token: access_token.into(),
            base_url: DEFAULT_BIGQUERY_URL.to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

/// BigQuery REST v2 client.
#[derive(Debug, Clone)]
pub struct BigQueryClient {
    http: reqwest::Client,
    config: BigQueryConfig,
}

impl BigQueryClient {
    pub fn new(config: BigQueryConfig) -> Result<Self, StorageError> {
        Ok(Self {
            http: google_http_client(config.timeout)?,
            config: BigQueryConfig {
                base_url: config.base_url.trim_end_matches('/').to_string(),
                ..config
            },
        })
    }

    pub fn config(&self) -> &BigQueryConfig {
        &self.config
    }

    fn project_url(&self) -> String {
        format!("{}/projects/{}", self.config.base_url, self.config.project_id)
    }

    fn dataset_url(&self) -> String {
        format!("{}/datasets/{}", self.project_url(), self.config.dataset)
    }

    /// GETs `url`; `Ok(true)` when the resource exists, `Ok(false)` on 404.
    async fn exists(&self, url: &str, operation: &str) -> Result<bool, StorageError> {
        let resp = self
            .http
            .get(url)
            .bearer_auth(&self.config.access_token)
            .send()
            .await
            .map_err(|source| StorageError::Request {
                operation: operation.to_string(),
                source,
            })?;
        match resp.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => Err(StorageError::Status {
                operation: operation.to_string(),
                status: s.as_u16(),
                body: truncated_body(resp).await,
            }),
        }
    }

    async fn create(
        &self,
        url: String,
        body: JsonValue,
        operation: &str,
    ) -> Result<(), StorageError> {
        let sent = self
            .http
            .post(url)
            .bearer_auth(&self.config.access_token)
            .json(&body)
            .send()
            .await;
        if let Ok(resp) = &sent {
            if resp.status() == StatusCode::CONFLICT {
                debug!(operation, "already exists");
                return Ok(());
            }
        }
        expect_success(sent, operation).await.map(|_| ())
    }

    /// Runs a standard-SQL query and returns each row's cell values.
    async fn query(
        &self,
        sql: String,
        params: Vec<JsonValue>,
    ) -> Result<Vec<Vec<JsonValue>>, StorageError> {
        let operation = "query";
        let mut body = json!({
            "query": sql,
            "useLegacySql": false,
            "location": self.config.location,
            "timeoutMs": 30_000,
        });
        if !params.is_empty() {
            body["parameterMode"] = json!("NAMED");
            body["queryParameters"] = JsonValue::Array(params);
        }

        let sent = self
            .http
            .post(format!("{}/queries", self.project_url()))
            .bearer_auth(&self.config.access_token)
            .json(&body)
            .send()
            .await;
        let resp = expect_success(sent, operation).await?;
        let value = read_json(resp, operation).await?;

        if value.get("jobComplete").and_then(JsonValue::as_bool) == Some(false) {
            return Err(StorageError::decode(operation, "query did not complete in time"));
        }
        let rows = value
            .get("rows")
            .and_then(JsonValue::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(rows
            .into_iter()
            .map(|row| {
                row.get("f")
                    .and_then(JsonValue::as_array)
                    .map(|cells| {
                        cells
                            .iter()
                            .map(|c| c.get("v").cloned().unwrap_or(JsonValue::Null))
                            .collect()
                    })
                    .unwrap_or_default()
            })
            .collect())
    }
}

#[async_trait]
impl WarehouseApi for BigQueryClient {
    async fn ensure_dataset(&self) -> Result<(), StorageError> {
        if self.exists(&self.dataset_url(), "get dataset").await? {
            return Ok(());
        }
        info!(dataset = %self.config.dataset, location = %self.config.location, "creating dataset");
        let body = json!({
            "datasetReference": {
                "projectId": self.config.project_id,
                "datasetId": self.config.dataset,
            },
            "location": self.config.location,
        });
        self.create(format!("{}/datasets", self.project_url()), body, "create dataset")
            .await
    }

    async fn ensure_table(&self, table: &TableSpec) -> Result<(), StorageError> {
        let url = format!("{}/tables/{}", self.dataset_url(), table.name);
        if self.exists(&url, "get table").await? {
            return Ok(());
        }
        info!(table = table.name, "creating table");
        let body = json!({
            "tableReference": {
                "projectId": self.config.project_id,
                "datasetId": self.config.dataset,
                "tableId": table.name,
            },
            "schema": table.schema_json(),
        });
        self.create(format!("{}/tables", self.dataset_url()), body, "create table")
            .await
    }

    async fn insert_rows(&self, table: &str, rows: Vec<InsertRow>) -> Result<usize, StorageError> {
        let url = format!("{}/tables/{table}/insertAll", self.dataset_url());
        let mut inserted = 0usize;

        for chunk in rows.chunks(INSERT_CHUNK) {
            let body = json!({
                "kind": "bigquery#tableDataInsertAllRequest",
                "ignoreUnknownValues": true,
                "rows": chunk,
            });
            let sent = self
                .http
                .post(&url)
                .bearer_auth(&self.config.access_token)
                .json(&body)
                .send()
                .await;
            let result = match expect_success(sent, "insertAll").await {
                Ok(resp) => read_json(resp, "insertAll").await,
                Err(err) => Err(err),
            };
            let value = match result {
                Ok(value) => value,
                Err(err) if inserted > 0 => {
                    return Err(StorageError::PartialCommit {
                        committed: inserted,
                        source: Box::new(err),
                    })
                }
                Err(err) => return Err(err),
            };

            let errors = insert_errors(&value);
            if !errors.is_empty() {
                let rejected = StorageError::Rejected {
                    table: table.to_string(),
                    errors,
                };
                if inserted > 0 {
                    return Err(StorageError::PartialCommit {
                        committed: inserted,
                        source: Box::new(rejected),
                    });
                }
                return Err(rejected);
            }
            inserted += chunk.len();
        }
        Ok(inserted)
    }

    async fn max_date(&self, query: &MaxDateQuery) -> Result<Option<NaiveDate>, StorageError> {
        let sql = query.to_sql(&self.config.project_id, &self.config.dataset);
        let params = query
            .period
            .map(|p| {
                vec![json!({
                    "name": "period",
                    "parameterType": { "type": "STRING" },
                    "parameterValue": { "value": p.as_str() },
                })]
            })
            .unwrap_or_default();
        let rows = self.query(sql, params).await?;
        Ok(rows
            .first()
            .and_then(|cells| cells.first())
            .and_then(JsonValue::as_str)
            .and_then(parse_date_prefix))
    }

    async fn distinct_strings(
        &self,
        table: &str,
        column: &str,
    ) -> Result<Vec<String>, StorageError> {
        let sql = format!(
            "SELECT DISTINCT {column} FROM `{}.{}.{table}`",
            self.config.project_id, self.config.dataset
        );
        let rows = self.query(sql, Vec::new()).await?;
        Ok(rows
            .into_iter()
            .filter_map(|cells| cells.into_iter().next())
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect())
    }
}

fn insert_errors(value: &JsonValue) -> Vec<String> {
    value
        .get("insertErrors")
        .and_then(JsonValue::as_array)
        .map(|entries| {
            entries
                .iter()
                .map(|entry| {
                    let index = entry.get("index").and_then(JsonValue::as_u64).unwrap_or(0);
                    let reasons = entry
                        .get("errors")
                        .and_then(JsonValue::as_array)
                        .map(|errs| {
                            errs.iter()
                                .filter_map(|e| e.get("message").and_then(JsonValue::as_str))
                                .collect::<Vec<_>>()
                                .join(", ")
                        })
                        .unwrap_or_default();
                    format!("row {index}: {reasons}")
                })
                .collect()
        })
        .unwrap_or_default()
}

fn parse_date_prefix(value: &str) -> Option<NaiveDate> {
    let head = value.get(..10)?;
    NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()
}

/// In-process warehouse. Drops rows whose `insert_id` it has already seen,
/// mirroring the best-effort dedup of the real service.
#[derive(Debug, Default)]
pub struct MemoryWarehouse {
    state: Mutex<MemoryWarehouseState>,
}

#[derive(Debug, Default)]
struct MemoryWarehouseState {
    dataset_ready: bool,
    dataset_setups: usize,
    tables: BTreeMap<String, Vec<InsertRow>>,
    seen_insert_ids: HashSet<String>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn rows(&self, table: &str) -> Vec<JsonValue> {
        let state = self.state.lock().await;
        state
            .tables
            .get(table)
            .map(|rows| rows.iter().map(|r| r.json.clone()).collect())
            .unwrap_or_default()
    }

    /// How many times dataset setup ran.
    pub async fn dataset_setups(&self) -> usize {
        self.state.lock().await.dataset_setups
    }
}

#[async_trait]
impl WarehouseApi for MemoryWarehouse {
    async fn ensure_dataset(&self) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        state.dataset_setups += 1;
        state.dataset_ready = true;
        Ok(())
    }

    async fn ensure_table(&self, table: &TableSpec) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        if !state.dataset_ready {
            return Err(StorageError::Status {
                operation: "create table".to_string(),
                status: 404,
                body: "dataset not found".to_string(),
            });
        }
        state.tables.entry(table.name.to_string()).or_default();
        Ok(())
    }

    async fn insert_rows(&self, table: &str, rows: Vec<InsertRow>) -> Result<usize, StorageError> {
        let mut state = self.state.lock().await;
        if !state.tables.contains_key(table) {
            return Err(StorageError::Status {
                operation: "insertAll".to_string(),
                status: 404,
                body: format!("table {table} not found"),
            });
        }
        let count = rows.len();
        for row in rows {
            if state.seen_insert_ids.insert(row.insert_id.clone()) {
                state.tables.entry(table.to_string()).or_default().push(row);
            }
        }
        Ok(count)
    }

    async fn max_date(&self, query: &MaxDateQuery) -> Result<Option<NaiveDate>, StorageError> {
        let state = self.state.lock().await;
        let Some(rows) = state.tables.get(query.table) else {
            return Ok(None);
        };
        Ok(rows
            .iter()
            .filter(|row| match query.period {
                Some(period) => {
                    row.json.get("period").and_then(JsonValue::as_str) == Some(period.as_str())
                }
                None => true,
            })
            .filter_map(|row| row.json.get(query.column).and_then(JsonValue::as_str))
            .filter_map(parse_date_prefix)
            .max())
    }

    async fn distinct_strings(
        &self,
        table: &str,
        column: &str,
    ) -> Result<Vec<String>, StorageError> {
        let state = self.state.lock().await;
        let mut seen = HashSet::new();
        Ok(state
            .tables
            .get(table)
            .into_iter()
            .flatten()
            .filter_map(|row| row.json.get(column).and_then(JsonValue::as_str))
            .filter(|value| seen.insert(value.to_string()))
            .map(str::to_string)
            .collect())
    }
}

/// Warehouse-backed storage. Setup of the dataset and tables happens once,
/// lazily, on the first call that needs it.
pub struct WarehouseBackend<W> {
    api: W,
    ready: OnceCell<()>,
}

impl<W: WarehouseApi> WarehouseBackend<W> {
    pub fn new(api: W) -> Self {
        Self {
            api,
            ready: OnceCell::new(),
        }
    }

    pub fn api(&self) -> &W {
        &self.api
    }

    async fn ensure_ready(&self) -> Result<(), StorageError> {
        self.ready
            .get_or_try_init(|| async {
                self.api.ensure_dataset().await?;
                for table in &TABLES {
                    self.api.ensure_table(table).await?;
                }
                info!(tables = TABLES.len(), "warehouse ready");
                Ok::<(), StorageError>(())
            })
            .await?;
        Ok(())
    }

    async fn insert<T>(
        &self,
        table: &TableSpec,
        records: &[T],
        to_row: fn(&T) -> JsonValue,
    ) -> Result<usize, StorageError> {
        if records.is_empty() {
            return Ok(0);
        }
        self.ensure_ready().await?;
        let rows = records
            .iter()
            .map(|r| InsertRow::new(table.name, to_row(r)))
            .collect();
        let inserted = self.api.insert_rows(table.name, rows).await?;
        debug!(table = table.name, inserted, "rows appended");
        Ok(inserted)
    }
}

#[async_trait]
impl<W: WarehouseApi> StorageBackend for WarehouseBackend<W> {
    fn name(&self) -> &'static str {
        "warehouse"
    }

    fn upsert_guarantee(&self) -> UpsertGuarantee {
        UpsertGuarantee::AppendOnly
    }

    async fn latest_date(&self, stream: Stream) -> Result<Option<NaiveDate>, StorageError> {
        self.ensure_ready().await?;
        self.api.max_date(&MaxDateQuery::for_stream(stream)).await
    }

    async fn upsert_movies(&self, movies: &[Movie]) -> Result<usize, StorageError> {
        self.insert(&MOVIES, movies, movie_row).await
    }

    async fn upsert_box_office(&self, records: &[BoxOfficeRecord]) -> Result<usize, StorageError> {
        self.insert(&BOX_OFFICE, records, box_office_row).await
    }

    async fn upsert_showtimes(&self, records: &[ShowtimeRanking]) -> Result<usize, StorageError> {
        self.insert(&SHOWTIMES, records, showtime_row).await
    }

    async fn upsert_insight(&self, article: &InsightArticle) -> Result<(), StorageError> {
        self.insert(&INSIGHTS, std::slice::from_ref(article), insight_row)
            .await
            .map(|_| ())
    }

    async fn log_sync(&self, entry: &SyncLogEntry) -> Result<(), StorageError> {
        self.insert(&SYNC_LOG, std::slice::from_ref(entry), sync_log_row)
            .await
            .map(|_| ())
    }

    async fn insight_ids(&self) -> Result<HashSet<String>, StorageError> {
        self.ensure_ready().await?;
        Ok(self
            .api
            .distinct_strings(INSIGHTS.name, "id")
            .await?
            .into_iter()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn movie(minute: u32) -> Movie {
        Movie {
            id: 3121,
            title: "Agak Laen".into(),
            original_title: None,
            poster_url: None,
            backdrop_url: None,
            genres: vec!["Comedy".into()],
            duration_minutes: Some(119),
            release_date: NaiveDate::from_ymd_opt(2024, 2, 1),
            country: None,
            rating: "R13+".into(),
            synopsis: String::new(),
            cast: vec![],
            directors: vec![],
            score: None,
            total_admissions: None,
            status: None,
            last_updated: Utc
                .with_ymd_and_hms(2024, 12, 16, 1, minute, 0)
                .single()
                .expect("ts"),
        }
    }

    fn box_office(date: NaiveDate, period: Period) -> BoxOfficeRecord {
        BoxOfficeRecord {
            movie_id: 1,
            movie_title: "Moana 2".into(),
            date,
            period,
            rank: 1,
            admissions: 10,
            total_admissions: 100,
            showtimes: None,
            market_share: None,
            rank_change: None,
            admission_change: None,
            scraped_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn repeated_upserts_append_rather_than_replace() {
        let backend = WarehouseBackend::new(MemoryWarehouse::new());
        assert_eq!(backend.upsert_guarantee(), UpsertGuarantee::AppendOnly);

        backend.upsert_movies(&[movie(0)]).await.expect("first");
        backend.upsert_movies(&[movie(30)]).await.expect("rescrape");
        assert_eq!(backend.api().rows("movies").await.len(), 2);

        // A verbatim retry carries the same insert id and is dropped.
        backend.upsert_movies(&[movie(30)]).await.expect("retry");
        assert_eq!(backend.api().rows("movies").await.len(), 2);
    }

    #[tokio::test]
    async fn setup_runs_once_across_concurrent_first_calls() {
        let backend = WarehouseBackend::new(MemoryWarehouse::new());
        let date = NaiveDate::from_ymd_opt(2024, 12, 15).expect("date");
        let rows = [box_office(date, Period::Daily)];
        let (a, b) = tokio::join!(
            backend.upsert_box_office(&rows),
            backend.latest_date(Stream::Showtimes),
        );
        a.expect("insert");
        b.expect("latest");
        backend.insight_ids().await.expect("ids");
        assert_eq!(backend.api().dataset_setups().await, 1);
    }

    #[tokio::test]
    async fn latest_box_office_date_is_filtered_by_period() {
        let backend = WarehouseBackend::new(MemoryWarehouse::new());
        let d14 = NaiveDate::from_ymd_opt(2024, 12, 14).expect("date");
        let d15 = NaiveDate::from_ymd_opt(2024, 12, 15).expect("date");
        backend
            .upsert_box_office(&[box_office(d15, Period::Daily), box_office(d14, Period::Weekly)])
            .await
            .expect("insert");

        assert_eq!(
            backend.latest_date(Stream::BoxOffice(Period::Daily)).await.expect("daily"),
            Some(d15)
        );
        assert_eq!(
            backend.latest_date(Stream::BoxOffice(Period::Weekly)).await.expect("weekly"),
            Some(d14)
        );
        assert_eq!(
            backend.latest_date(Stream::BoxOffice(Period::Yearly)).await.expect("yearly"),
            None
        );
        assert_eq!(
            backend.latest_date(Stream::Movies).await.expect("movies"),
            None
        );
    }

    #[test]
    fn watermark_queries_render_expected_sql() {
        let sql = MaxDateQuery::for_stream(Stream::BoxOffice(Period::Monthly))
            .to_sql("proj", "cinepoint");
        assert_eq!(
            sql,
            "SELECT MAX(date) AS latest_date FROM `proj.cinepoint.box_office` \
             WHERE period = @period"
        );
        let sql = MaxDateQuery::for_stream(Stream::Insights).to_sql("proj", "cinepoint");
        assert!(sql.starts_with("SELECT MAX(DATE(published_at))"));
    }

    #[test]
    fn insert_ids_are_stable_and_table_scoped() {
        let row = json!({ "id": 1, "title": "x" });
        let a = InsertRow::new("movies", row.clone());
        let b = InsertRow::new("movies", row.clone());
        let c = InsertRow::new("insights", row);
        assert_eq!(a.insert_id, b.insert_id);
        assert_ne!(a.insert_id, c.insert_id);
        assert_eq!(a.insert_id.len(), 64);
    }

    #[test]
    fn schemas_mark_list_columns_repeated() {
        let repeated: Vec<_> = MOVIES
            .columns
            .iter()
            .filter(|c| c.mode == "REPEATED")
            .map(|c| c.name)
            .collect();
        assert_eq!(repeated, vec!["genre", "cast", "directors"]);
        assert_eq!(TABLES.len(), 5);
    }
}
