//! Document store backend: one document per record identity.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use cinepoint_core::{
    BoxOfficeRecord, InsightArticle, Movie, ShowtimeRanking, Stream, SyncLogEntry,
};
use serde::Serialize;
use serde_json::{json, Map, Value as JsonValue};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{
    expect_success, google_http_client, read_json, StorageBackend, StorageError, UpsertGuarantee,
};

pub type JsonMap = Map<String, JsonValue>;

pub const DEFAULT_FIRESTORE_URL: &str = "https://firestore.googleapis.com/v1";
pub const DEFAULT_DATABASE: &str = "(default)";
pub const DEFAULT_BATCH_SIZE: usize = 400;
/// Hard per-commit write limit of the store.
pub const MAX_BATCH_SIZE: usize = 500;

pub const MOVIES_COLLECTION: &str = "cinepoint_movies";
pub const BOX_OFFICE_COLLECTION: &str = "cinepoint_box_office";
pub const SHOWTIMES_COLLECTION: &str = "cinepoint_showtimes";
pub const INSIGHTS_COLLECTION: &str = "cinepoint_insights";
pub const SYNC_LOG_COLLECTION: &str = "cinepoint_sync_log";

const LIST_PAGE_SIZE: &str = "300";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Overwrite only the written fields; others on the document survive.
    Merge,
    /// Replace the whole document.
    Replace,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DocumentWrite {
    pub collection: String,
    pub id: String,
    pub fields: JsonMap,
    pub mode: WriteMode,
}

/// Calls the document backend makes against its service.
#[async_trait]
pub trait DocumentApi: Send + Sync {
    /// Applies all writes atomically.
    async fn commit(&self, writes: &[DocumentWrite]) -> Result<(), StorageError>;

    /// Fields of the document with the greatest `order_by`, optionally
    /// restricted to documents whose `filter.0` equals `filter.1`.
    async fn latest_by(
        &self,
        collection: &str,
        order_by: &str,
        filter: Option<(&str, &str)>,
    ) -> Result<Option<JsonMap>, StorageError>;

    async fn list_ids(&self, collection: &str) -> Result<Vec<String>, StorageError>;

    /// Creates a document under a store-assigned id.
    async fn add(&self, collection: &str, fields: JsonMap) -> Result<(), StorageError>;
}

pub fn to_firestore_value(value: &JsonValue) -> JsonValue {
    match value {
        JsonValue::Null => json!({ "nullValue": null }),
        JsonValue::Bool(b) => json!({ "booleanValue": b }),
        JsonValue::Number(n) if n.is_i64() || n.is_u64() => {
            json!({ "integerValue": n.to_string() })
        }
        JsonValue::Number(n) => json!({ "doubleValue": n.as_f64() }),
        JsonValue::String(s) => json!({ "stringValue": s }),
        JsonValue::Array(items) => json!({
            "arrayValue": { "values": items.iter().map(to_firestore_value).collect::<Vec<_>>() }
        }),
        JsonValue::Object(map) => json!({ "mapValue": { "fields": encode_fields(map) } }),
    }
}

pub fn encode_fields(map: &JsonMap) -> JsonValue {
    JsonValue::Object(
        map.iter()
            .map(|(k, v)| (k.clone(), to_firestore_value(v)))
            .collect(),
    )
}

pub fn from_firestore_value(value: &JsonValue) -> JsonValue {
    let Some(obj) = value.as_object() else {
        return JsonValue::Null;
    };
    if let Some(s) = obj.get("stringValue").or_else(|| obj.get("timestampValue")) {
        return s.clone();
    }
    if let Some(i) = obj.get("integerValue") {
        return match i {
            JsonValue::String(s) => s
                .parse::<i64>()
                .map(JsonValue::from)
                .unwrap_or(JsonValue::Null),
            other => other.clone(),
        };
    }
    if let Some(d) = obj.get("doubleValue") {
        return d.clone();
    }
    if let Some(b) = obj.get("booleanValue") {
        return b.clone();
    }
    if let Some(arr) = obj.get("arrayValue") {
        return JsonValue::Array(
            arr.get("values")
                .and_then(JsonValue::as_array)
                .map(|values| values.iter().map(from_firestore_value).collect())
                .unwrap_or_default(),
        );
    }
    if let Some(map) = obj.get("mapValue") {
        return JsonValue::Object(decode_fields(map.get("fields").unwrap_or(&JsonValue::Null)));
    }
    JsonValue::Null
}

pub fn decode_fields(fields: &JsonValue) -> JsonMap {
    fields
        .as_object()
        .map(|obj| {
            obj.iter()
                .map(|(k, v)| (k.clone(), from_firestore_value(v)))
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Debug, Clone)]
pub struct FirestoreConfig {
    pub project_id: String,
    pub database: String,
    pub access_token: String,
    pub base_url: String,
    pub timeout: Duration,
}

impl FirestoreConfig {
    pub fn new(project_id: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            database: DEFAULT_DATABASE.to_string(),
            access_token: access_token.into(),
            base_url: DEFAULT_FIRESTORE_URL.to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

/// Firestore REST v1 client.
#[derive(Debug, Clone)]
pub struct FirestoreClient {
    http: reqwest::Client,
    config: FirestoreConfig,
}

impl FirestoreClient {
    pub fn new(config: FirestoreConfig) -> Result<Self, StorageError> {
        Ok(Self {
            http: google_http_client(config.timeout)?,
            config: FirestoreConfig {
                base_url: config.base_url.trim_end_matches('/').to_string(),
                ..config
            },
        })
    }

    fn documents_root(&self) -> String {
        format!(
            "projects/{}/databases/{}/documents",
            self.config.project_id, self.config.database
        )
    }

    fn documents_url(&self) -> String {
        format!("{}/{}", self.config.base_url, self.documents_root())
    }

    fn encode_write(&self, write: &DocumentWrite) -> JsonValue {
        let mut encoded = json!({
            "update": {
                "name": format!("{}/{}/{}", self.documents_root(), write.collection, write.id),
                "fields": encode_fields(&write.fields),
            }
        });
        if write.mode == WriteMode::Merge {
            let paths = write.fields.keys().collect::<Vec<_>>();
            encoded["updateMask"] = json!({ "fieldPaths": paths });
        }
        encoded
    }
}

#[async_trait]
impl DocumentApi for FirestoreClient {
    async fn commit(&self, writes: &[DocumentWrite]) -> Result<(), StorageError> {
        let body = json!({
            "writes": writes.iter().map(|w| self.encode_write(w)).collect::<Vec<_>>(),
        });
        let sent = self
            .http
            .post(format!("{}:commit", self.documents_url()))
            .bearer_auth(&self.config.access_token)
            .json(&body)
            .send()
            .await;
        expect_success(sent, "commit").await.map(|_| ())
    }

    async fn latest_by(
        &self,
        collection: &str,
        order_by: &str,
        filter: Option<(&str, &str)>,
    ) -> Result<Option<JsonMap>, StorageError> {
        let mut query = json!({
            "from": [{ "collectionId": collection }],
            "orderBy": [{ "field": { "fieldPath": order_by }, "direction": "DESCENDING" }],
            "limit": 1,
        });
        if let Some((field, value)) = filter {
            query["where"] = json!({
                "fieldFilter": {
                    "field": { "fieldPath": field },
                    "op": "EQUAL",
                    "value": { "stringValue": value },
                }
            });
        }
        let sent = self
            .http
            .post(format!("{}:runQuery", self.documents_url()))
            .bearer_auth(&self.config.access_token)
            .json(&json!({ "structuredQuery": query }))
            .send()
            .await;
        let resp = expect_success(sent, "runQuery").await?;
        let value = read_json(resp, "runQuery").await?;
        Ok(value
            .as_array()
            .into_iter()
            .flatten()
            .find_map(|item| item.get("document"))
            .map(|doc| decode_fields(doc.get("fields").unwrap_or(&JsonValue::Null))))
    }

    async fn list_ids(&self, collection: &str) -> Result<Vec<String>, StorageError> {
        let url = format!("{}/{collection}", self.documents_url());
        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut params = vec![
                ("mask.fieldPaths", "id".to_string()),
                ("pageSize", LIST_PAGE_SIZE.to_string()),
            ];
            if let Some(token) = &page_token {
                params.push(("pageToken", token.clone()));
            }
            let sent = self
                .http
                .get(&url)
                .query(&params)
                .bearer_auth(&self.config.access_token)
                .send()
                .await;
            let resp = expect_success(sent, "list documents").await?;
            let value = read_json(resp, "list documents").await?;

            ids.extend(
                value
                    .get("documents")
                    .and_then(JsonValue::as_array)
                    .into_iter()
                    .flatten()
                    .filter_map(|doc| doc.get("name").and_then(JsonValue::as_str))
                    .filter_map(|name| name.rsplit('/').next())
                    .map(str::to_string),
            );

            page_token = value
                .get("nextPageToken")
                .and_then(JsonValue::as_str)
                .filter(|t| !t.is_empty())
                .map(str::to_string);
            if page_token.is_none() {
                return Ok(ids);
            }
        }
    }

    async fn add(&self, collection: &str, fields: JsonMap) -> Result<(), StorageError> {
        let sent = self
            .http
            .post(format!("{}/{collection}", self.documents_url()))
            .bearer_auth(&self.config.access_token)
            .json(&json!({ "fields": encode_fields(&fields) }))
            .send()
            .await;
        expect_success(sent, "create document").await.map(|_| ())
    }
}

fn compare_json(a: &JsonValue, b: &JsonValue) -> Ordering {
    match (a, b) {
        (JsonValue::String(a), JsonValue::String(b)) => a.cmp(b),
        (JsonValue::Number(a), JsonValue::Number(b)) => a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .unwrap_or(Ordering::Equal),
        (JsonValue::Null, JsonValue::Null) => Ordering::Equal,
        (JsonValue::Null, _) => Ordering::Less,
        (_, JsonValue::Null) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

/// In-process document store with the same write semantics as the service.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    state: Mutex<MemoryDocumentState>,
}

#[derive(Debug, Default)]
struct MemoryDocumentState {
    collections: BTreeMap<String, BTreeMap<String, JsonMap>>,
    commits: usize,
    next_auto_id: u64,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn document(&self, collection: &str, id: &str) -> Option<JsonMap> {
        let state = self.state.lock().await;
        state.collections.get(collection)?.get(id).cloned()
    }

    pub async fn documents(&self, collection: &str) -> Vec<JsonMap> {
        let state = self.state.lock().await;
        state
            .collections
            .get(collection)
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn count(&self, collection: &str) -> usize {
        let state = self.state.lock().await;
        state.collections.get(collection).map_or(0, BTreeMap::len)
    }

    pub async fn commits(&self) -> usize {
        self.state.lock().await.commits
    }
}

#[async_trait]
impl DocumentApi for MemoryDocumentStore {
    async fn commit(&self, writes: &[DocumentWrite]) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        state.commits += 1;
        for write in writes {
            let docs = state.collections.entry(write.collection.clone()).or_default();
            match write.mode {
                WriteMode::Merge => docs
                    .entry(write.id.clone())
                    .or_default()
                    .extend(write.fields.clone()),
                WriteMode::Replace => {
                    docs.insert(write.id.clone(), write.fields.clone());
                }
            }
        }
        Ok(())
    }

    async fn latest_by(
        &self,
        collection: &str,
        order_by: &str,
        filter: Option<(&str, &str)>,
    ) -> Result<Option<JsonMap>, StorageError> {
        let state = self.state.lock().await;
        let Some(docs) = state.collections.get(collection) else {
            return Ok(None);
        };
        Ok(docs
            .values()
            .filter(|doc| match filter {
                Some((field, value)) => doc.get(field).and_then(JsonValue::as_str) == Some(value),
                None => true,
            })
            .filter(|doc| doc.contains_key(order_by))
            .max_by(|a, b| compare_json(&a[order_by], &b[order_by]))
            .cloned())
    }

    async fn list_ids(&self, collection: &str) -> Result<Vec<String>, StorageError> {
        let state = self.state.lock().await;
        Ok(state
            .collections
            .get(collection)
            .map(|docs| docs.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn add(&self, collection: &str, fields: JsonMap) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        state.next_auto_id += 1;
        let id = format!("auto-{:08}", state.next_auto_id);
        state
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(id, fields);
        Ok(())
    }
}

fn to_fields<T: Serialize>(record: &T, what: &str) -> Result<JsonMap, StorageError> {
    match serde_json::to_value(record).map_err(|err| StorageError::decode(what, err))? {
        JsonValue::Object(map) => Ok(map),
        other => Err(StorageError::decode(what, format!("expected an object, got {other}"))),
    }
}

fn parse_date_prefix(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value.get(..10)?, "%Y-%m-%d").ok()
}

/// Document-store-backed storage with keyed, batched writes.
pub struct DocumentBackend<D> {
    api: D,
    batch_size: usize,
}

impl<D: DocumentApi> DocumentBackend<D> {
    pub fn new(api: D) -> Self {
        Self {
            api,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.clamp(1, MAX_BATCH_SIZE);
        self
    }

    pub fn api(&self) -> &D {
        &self.api
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Commits `writes` in sequential batches. A failed batch after earlier
    /// successes is reported as `PartialCommit` with the committed count.
    async fn write_batched(&self, writes: Vec<DocumentWrite>) -> Result<usize, StorageError> {
        let mut committed = 0usize;
        for batch in writes.chunks(self.batch_size) {
            if let Err(err) = self.api.commit(batch).await {
                warn!(committed, batch = batch.len(), error = %err, "document batch failed");
                if committed == 0 {
                    return Err(err);
                }
                return Err(StorageError::PartialCommit {
                    committed,
                    source: Box::new(err),
                });
            }
            committed += batch.len();
            debug!(committed, "document batch committed");
        }
        Ok(committed)
    }

    fn writes<T: Serialize>(
        collection: &str,
        records: &[T],
        id: fn(&T) -> String,
        mode: WriteMode,
    ) -> Result<Vec<DocumentWrite>, StorageError> {
        records
            .iter()
            .map(|record| {
                Ok(DocumentWrite {
                    collection: collection.to_string(),
                    id: id(record),
                    fields: to_fields(record, collection)?,
                    mode,
                })
            })
            .collect()
    }
}

#[async_trait]
impl<D: DocumentApi> StorageBackend for DocumentBackend<D> {
    fn name(&self) -> &'static str {
        "document"
    }

    fn upsert_guarantee(&self) -> UpsertGuarantee {
        UpsertGuarantee::Idempotent
    }

    async fn latest_date(&self, stream: Stream) -> Result<Option<NaiveDate>, StorageError> {
        let (collection, field, filter) = match stream {
            Stream::Movies => (MOVIES_COLLECTION, "lastUpdated", None),
            Stream::BoxOffice(period) => (
                BOX_OFFICE_COLLECTION,
                "date",
                Some(("period", period.as_str())),
            ),
            Stream::Showtimes => (SHOWTIMES_COLLECTION, "date", None),
            Stream::Insights => (INSIGHTS_COLLECTION, "publishedAt", None),
        };
        let latest = self.api.latest_by(collection, field, filter).await?;
        Ok(latest
            .as_ref()
            .and_then(|doc| doc.get(field))
            .and_then(JsonValue::as_str)
            .and_then(parse_date_prefix))
    }

    async fn upsert_movies(&self, movies: &[Movie]) -> Result<usize, StorageError> {
        let writes = Self::writes(MOVIES_COLLECTION, movies, Movie::document_id, WriteMode::Merge)?;
        self.write_batched(writes).await
    }

    async fn upsert_box_office(&self, records: &[BoxOfficeRecord]) -> Result<usize, StorageError> {
        let writes = Self::writes(
            BOX_OFFICE_COLLECTION,
            records,
            BoxOfficeRecord::document_id,
            WriteMode::Replace,
        )?;
        self.write_batched(writes).await
    }

    async fn upsert_showtimes(&self, records: &[ShowtimeRanking]) -> Result<usize, StorageError> {
        let writes = Self::writes(
            SHOWTIMES_COLLECTION,
            records,
            ShowtimeRanking::document_id,
            WriteMode::Replace,
        )?;
        self.write_batched(writes).await
    }

    async fn upsert_insight(&self, article: &InsightArticle) -> Result<(), StorageError> {
        let write = DocumentWrite {
            collection: INSIGHTS_COLLECTION.to_string(),
            id: article.id.clone(),
            fields: to_fields(article, INSIGHTS_COLLECTION)?,
            mode: WriteMode::Merge,
        };
        self.api.commit(std::slice::from_ref(&write)).await
    }

    async fn log_sync(&self, entry: &SyncLogEntry) -> Result<(), StorageError> {
        let fields = to_fields(entry, SYNC_LOG_COLLECTION)?;
        self.api.add(SYNC_LOG_COLLECTION, fields).await
    }

    async fn insight_ids(&self) -> Result<HashSet<String>, StorageError> {
        Ok(self.api.list_ids(INSIGHTS_COLLECTION).await?.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use cinepoint_core::Period;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 12, day).expect("date")
    }

    fn showtime(movie_id: i64, day: u32, count: i64) -> ShowtimeRanking {
        ShowtimeRanking {
            movie_id,
            movie_title: format!("Movie {movie_id}"),
            date: date(day),
            rank: movie_id,
            showtime_count: count,
            showtime_change: 0,
            market_share_percent: 1.5,
            scraped_at: Utc.with_ymd_and_hms(2024, 12, 16, 1, 0, 0).single().expect("ts"),
        }
    }

    fn box_office(movie_id: i64, day: u32, period: Period) -> BoxOfficeRecord {
        BoxOfficeRecord {
            movie_id,
            movie_title: "Moana 2".into(),
            date: date(day),
            period,
            rank: 1,
            admissions: 52_000,
            total_admissions: 1_200_000,
            showtimes: None,
            market_share: None,
            rank_change: None,
            admission_change: None,
            scraped_at: Utc::now(),
        }
    }

    /// Delegates to a memory store but fails the `fail_at`-th commit (0-based).
    struct FailingStore {
        inner: MemoryDocumentStore,
        fail_at: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DocumentApi for FailingStore {
        async fn commit(&self, writes: &[DocumentWrite]) -> Result<(), StorageError> {
            if self.calls.fetch_add(1, AtomicOrdering::SeqCst) == self.fail_at {
                return Err(StorageError::Status {
                    operation: "commit".into(),
                    status: 503,
                    body: "unavailable".into(),
                });
            }
            self.inner.commit(writes).await
        }

        async fn latest_by(
            &self,
            collection: &str,
            order_by: &str,
            filter: Option<(&str, &str)>,
        ) -> Result<Option<JsonMap>, StorageError> {
            self.inner.latest_by(collection, order_by, filter).await
        }

        async fn list_ids(&self, collection: &str) -> Result<Vec<String>, StorageError> {
            self.inner.list_ids(collection).await
        }

        async fn add(&self, collection: &str, fields: JsonMap) -> Result<(), StorageError> {
            self.inner.add(collection, fields).await
        }
    }

    #[tokio::test]
    async fn upserting_same_records_twice_leaves_one_document_each() {
        let backend = DocumentBackend::new(MemoryDocumentStore::new());
        assert_eq!(backend.upsert_guarantee(), UpsertGuarantee::Idempotent);

        let records = vec![showtime(1, 15, 100), showtime(2, 15, 80)];
        assert_eq!(backend.upsert_showtimes(&records).await.expect("first"), 2);
        let first = backend.api().documents(SHOWTIMES_COLLECTION).await;

        assert_eq!(backend.upsert_showtimes(&records).await.expect("second"), 2);
        let second = backend.api().documents(SHOWTIMES_COLLECTION).await;

        assert_eq!(backend.api().count(SHOWTIMES_COLLECTION).await, 2);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn box_office_periods_are_distinct_documents() {
        let backend = DocumentBackend::new(MemoryDocumentStore::new());
        backend
            .upsert_box_office(&[
                box_office(7, 15, Period::Daily),
                box_office(7, 15, Period::Weekly),
            ])
            .await
            .expect("upsert");
        assert_eq!(backend.api().count(BOX_OFFICE_COLLECTION).await, 2);
        assert!(backend
            .api()
            .document(BOX_OFFICE_COLLECTION, "7_2024-12-15_weekly")
            .await
            .is_some());
    }

    #[tokio::test]
    async fn movie_merge_keeps_fields_written_elsewhere() {
        let store = MemoryDocumentStore::new();
        let mut extra = JsonMap::new();
        extra.insert("trailerUrl".into(), json!("https://video.example/t"));
        store
            .commit(&[DocumentWrite {
                collection: MOVIES_COLLECTION.into(),
                id: "3121".into(),
                fields: extra,
                mode: WriteMode::Merge,
            }])
            .await
            .expect("seed");

        let backend = DocumentBackend::new(store);
        let movie = Movie {
            id: 3121,
            title: "Agak Laen".into(),
            original_title: None,
            poster_url: None,
            backdrop_url: None,
            genres: vec![],
            duration_minutes: None,
            release_date: None,
            country: None,
            rating: "SU".into(),
            synopsis: String::new(),
            cast: vec![],
            directors: vec![],
            score: None,
            total_admissions: None,
            status: None,
            last_updated: Utc::now(),
        };
        backend.upsert_movies(&[movie]).await.expect("upsert");

        let doc = backend
            .api()
            .document(MOVIES_COLLECTION, "3121")
            .await
            .expect("doc");
        assert_eq!(doc["title"], "Agak Laen");
        assert_eq!(doc["trailerUrl"], "https://video.example/t");
    }

    #[tokio::test]
    async fn failure_in_later_batch_reports_committed_records() {
        let backend = DocumentBackend::new(FailingStore {
            inner: MemoryDocumentStore::new(),
            fail_at: 2,
            calls: AtomicUsize::new(0),
        });
        let records: Vec<_> = (0..900).map(|i| showtime(i, 15, i)).collect();

        let err = backend.upsert_showtimes(&records).await.expect_err("third batch fails");
        match err {
            StorageError::PartialCommit { committed, .. } => assert_eq!(committed, 800),
            other => panic!("unexpected {other}"),
        }
        assert_eq!(backend.api().inner.count(SHOWTIMES_COLLECTION).await, 800);
    }

    #[tokio::test]
    async fn failure_in_first_batch_is_returned_as_is() {
        let backend = DocumentBackend::new(FailingStore {
            inner: MemoryDocumentStore::new(),
            fail_at: 0,
            calls: AtomicUsize::new(0),
        })
        .with_batch_size(10);
        let err = backend
            .upsert_showtimes(&[showtime(1, 15, 1)])
            .await
            .expect_err("fails");
        assert!(matches!(err, StorageError::Status { status: 503, .. }));
    }

    #[tokio::test]
    async fn batch_size_is_clamped_to_store_limit() {
        let backend = DocumentBackend::new(MemoryDocumentStore::new()).with_batch_size(5_000);
        assert_eq!(backend.batch_size(), MAX_BATCH_SIZE);
        let records: Vec<_> = (0..1_001).map(|i| showtime(i, 15, i)).collect();
        backend.upsert_showtimes(&records).await.expect("upsert");
        assert_eq!(backend.api().commits().await, 3);
    }

    #[tokio::test]
    async fn latest_date_follows_period_filter() {
        let backend = DocumentBackend::new(MemoryDocumentStore::new());
        backend
            .upsert_box_office(&[
                box_office(1, 13, Period::Daily),
                box_office(1, 15, Period::Daily),
                box_office(1, 14, Period::Weekly),
            ])
            .await
            .expect("upsert");

        assert_eq!(
            backend.latest_date(Stream::BoxOffice(Period::Daily)).await.expect("daily"),
            Some(date(15))
        );
        assert_eq!(
            backend.latest_date(Stream::BoxOffice(Period::Weekly)).await.expect("weekly"),
            Some(date(14))
        );
        assert_eq!(backend.latest_date(Stream::Showtimes).await.expect("empty"), None);
    }

    #[tokio::test]
    async fn sync_log_entries_are_appended() {
        let backend = DocumentBackend::new(MemoryDocumentStore::new());
        let entry = SyncLogEntry::new("daily", json!({ "status": "success" }));
        backend.log_sync(&entry).await.expect("log");
        backend.log_sync(&entry).await.expect("log");
        let docs = backend.api().documents(SYNC_LOG_COLLECTION).await;
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0]["type"], "daily");
    }

    #[test]
    fn typed_values_round_trip_through_firestore_encoding() {
        let value = json!({
            "id": 3121,
            "score": 8.5,
            "genres": ["Comedy", "Horror"],
            "status": null,
            "nested": { "ok": true }
        });
        let JsonValue::Object(map) = &value else {
            panic!("object");
        };
        let encoded = encode_fields(map);
        assert_eq!(encoded["id"]["integerValue"], "3121");
        assert_eq!(encoded["score"]["doubleValue"], 8.5);
        assert_eq!(encoded["genres"]["arrayValue"]["values"][1]["stringValue"], "Horror");
        assert_eq!(JsonValue::Object(decode_fields(&encoded)), value);
    }
}
