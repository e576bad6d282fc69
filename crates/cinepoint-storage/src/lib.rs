//! Persistence for synced Cinepoint records.
//!
//! Two interchangeable backends sit behind [`StorageBackend`]: an analytics
//! warehouse (append-only inserts) and a document store (keyed upserts).
//! Each backend talks to its service through a small API trait so that the
//! REST clients can be swapped for in-memory stores in tests.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use cinepoint_core::{
    truncate_on_char_boundary, BoxOfficeRecord, InsightArticle, Movie, ShowtimeRanking, Stream,
    SyncLogEntry, ERROR_BODY_LIMIT,
};
use serde::Serialize;
use thiserror::Error;

pub mod document;
pub mod warehouse;

pub use document::{
    DocumentApi, DocumentBackend, DocumentWrite, FirestoreClient, FirestoreConfig,
    MemoryDocumentStore, WriteMode,
};
pub use warehouse::{
    BigQueryClient, BigQueryConfig, InsertRow, MaxDateQuery, MemoryWarehouse, TableSpec,
    WarehouseApi, WarehouseBackend,
};

pub const CRATE_NAME: &str = "cinepoint-storage";

/// What a repeated upsert of the same record leaves behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertGuarantee {
    /// One stored record per identity, last write wins.
    Idempotent,
    /// Every call appends; readers must deduplicate by identity.
    AppendOnly,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage request failed during {operation}: {source}")]
    Request {
        operation: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{operation} returned http {status}: {body}")]
    Status {
        operation: String,
        status: u16,
        body: String,
    },
    #[error("table {table} rejected {} row(s): {}", errors.len(), errors.join("; "))]
    Rejected { table: String, errors: Vec<String> },
    #[error("could not decode {what}: {message}")]
    Decode { what: String, message: String },
    #[error("{committed} record(s) committed before a batch failed: {source}")]
    PartialCommit {
        committed: usize,
        #[source]
        source: Box<StorageError>,
    },
}

impl StorageError {
    pub(crate) fn decode(what: impl Into<String>, message: impl ToString) -> Self {
        StorageError::Decode {
            what: what.into(),
            message: message.to_string(),
        }
    }

    /// Records durably written before the failure.
    pub fn committed(&self) -> usize {
        match self {
            StorageError::PartialCommit { committed, .. } => *committed,
            _ => 0,
        }
    }
}

/// Persistence seam used by the sync orchestrator.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn upsert_guarantee(&self) -> UpsertGuarantee;

    /// Most recent date already stored for `stream`, if any.
    async fn latest_date(&self, stream: Stream) -> Result<Option<NaiveDate>, StorageError>;

    async fn upsert_movies(&self, movies: &[Movie]) -> Result<usize, StorageError>;

    async fn upsert_box_office(&self, records: &[BoxOfficeRecord]) -> Result<usize, StorageError>;

    async fn upsert_showtimes(&self, records: &[ShowtimeRanking]) -> Result<usize, StorageError>;

    async fn upsert_insight(&self, article: &InsightArticle) -> Result<(), StorageError>;

    async fn log_sync(&self, entry: &SyncLogEntry) -> Result<(), StorageError>;

    async fn insight_ids(&self) -> Result<HashSet<String>, StorageError>;
}

pub(crate) fn google_http_client(timeout: Duration) -> Result<reqwest::Client, StorageError> {
    reqwest::Client::builder()
        .gzip(true)
        .timeout(timeout)
        .build()
        .map_err(|source| StorageError::Request {
            operation: "building http client".to_string(),
            source,
        })
}

/// Passes 2xx responses through and turns everything else into `Status`.
pub(crate) async fn expect_success(
    resp: Result<reqwest::Response, reqwest::Error>,
    operation: &str,
) -> Result<reqwest::Response, StorageError> {
    let resp = resp.map_err(|source| StorageError::Request {
        operation: operation.to_string(),
        source,
    })?;
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status().as_u16();
    Err(StorageError::Status {
        operation: operation.to_string(),
        status,
        body: truncated_body(resp).await,
    })
}

pub(crate) async fn truncated_body(resp: reqwest::Response) -> String {
    let mut body = resp.text().await.unwrap_or_default();
    truncate_on_char_boundary(&mut body, ERROR_BODY_LIMIT);
    body
}

pub(crate) async fn read_json(
    resp: reqwest::Response,
    operation: &str,
) -> Result<serde_json::Value, StorageError> {
    let bytes = resp.bytes().await.map_err(|source| StorageError::Request {
        operation: operation.to_string(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|err| StorageError::decode(operation, err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_commit_reports_committed_count() {
        let err = StorageError::PartialCommit {
            committed: 400,
            source: Box::new(StorageError::Status {
                operation: "commit".into(),
                status: 503,
                body: "unavailable".into(),
            }),
        };
        assert_eq!(err.committed(), 400);
        assert!(err.to_string().contains("400 record(s) committed"));

        let plain = StorageError::decode("query", "bad json");
        assert_eq!(plain.committed(), 0);
    }

    #[test]
    fn rejected_rows_are_listed_in_message() {
        let err = StorageError::Rejected {
            table: "movies".into(),
            errors: vec!["row 0: invalid".into(), "row 3: invalid".into()],
        };
        let text = err.to_string();
        assert!(text.contains("2 row(s)"));
        assert!(text.contains("row 3"));
    }
}
