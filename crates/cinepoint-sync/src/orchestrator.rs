//! Per-stream fetch → map → persist → log cycle.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Days, FixedOffset, NaiveDate, Offset, Utc};
use cinepoint_adapters::{
    insight_key, map_all, map_box_office, map_insight, map_movie, map_showtime, MapContext,
    MappingError, Page,
};
use cinepoint_core::{DateRange, Period, Stream, SyncDetails, SyncLogEntry};
use cinepoint_storage::{StorageBackend, StorageError, UpsertGuarantee};
use cinepoint_upstream::{FetchError, UpstreamClient};
use serde::{Serialize, Serializer};
use serde_json::{json, Map, Value as JsonValue};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::StreamPlan;

/// Safety stop for paginated fetches of a single date or list.
pub const DEFAULT_MAX_PAGES: u32 = 100;
pub const DEFAULT_REPORTING_UTC_OFFSET_HOURS: i32 = 7;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("sync cancelled")]
    Cancelled,
}

impl SyncError {
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Fetch(err) => err.kind(),
            SyncError::Storage(_) => "storage",
            SyncError::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    #[default]
    Daily,
    Backfill,
}

impl RunKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunKind::Daily => "daily",
            RunKind::Backfill => "backfill",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub kind: RunKind,
    /// Restricts the run to these streams; `None` runs every planned stream.
    pub streams: Option<Vec<Stream>>,
    /// Last date to fetch. Defaults to today in the reporting timezone.
    pub end_date: Option<NaiveDate>,
    /// Fetch this many days back regardless of stored watermarks.
    pub lookback_days: Option<u32>,
}

impl RunOptions {
    pub fn daily() -> Self {
        Self::default()
    }

    pub fn backfill(days: u32) -> Self {
        Self {
            kind: RunKind::Backfill,
            lookback_days: Some(days.max(1)),
            ..Self::default()
        }
    }

    pub fn with_streams(mut self, streams: Vec<Stream>) -> Self {
        self.streams = Some(streams);
        self
    }

    pub fn with_end_date(mut self, end_date: NaiveDate) -> Self {
        self.end_date = Some(end_date);
        self
    }

    fn ignores_watermark(&self) -> bool {
        self.lookback_days.is_some()
    }
}

/// Dates a date-addressed stream should fetch this run, or `None` when the
/// stream is already past `end`.
pub fn date_window(
    watermark: Option<NaiveDate>,
    end: NaiveDate,
    lookback_days: u32,
    overlap_days: u32,
) -> Option<DateRange> {
    let start = match watermark {
        Some(mark) => mark
            .checked_add_days(Days::new(1))?
            .checked_sub_days(Days::new(u64::from(overlap_days)))?,
        None => end.checked_sub_days(Days::new(u64::from(lookback_days.max(1) - 1)))?,
    };
    DateRange::new(start, end)
}

pub fn reporting_offset(hours: i32) -> FixedOffset {
    FixedOffset::east_opt(hours.saturating_mul(3600)).unwrap_or_else(|| Utc.fix())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    Success,
    Failed,
    Cancelled,
}

impl StreamStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamStatus::Success => "success",
            StreamStatus::Failed => "failed",
            StreamStatus::Cancelled => "cancelled",
        }
    }
}

fn serialize_stream<S: Serializer>(stream: &Stream, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&stream.key())
}

/// Outcome of one stream's cycle. Counts are kept even when the cycle fails.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamReport {
    #[serde(serialize_with = "serialize_stream")]
    pub stream: Stream,
    pub status: StreamStatus,
    pub fetched: usize,
    pub written: usize,
    pub skipped: usize,
    pub date_range: Option<DateRange>,
    pub error_kind: Option<String>,
    pub error: Option<String>,
}

impl StreamReport {
    fn new(stream: Stream) -> Self {
        Self {
            stream,
            status: StreamStatus::Success,
            fetched: 0,
            written: 0,
            skipped: 0,
            date_range: None,
            error_kind: None,
            error: None,
        }
    }

    fn cancelled(stream: Stream) -> Self {
        let mut report = Self::new(stream);
        report.fail(&SyncError::Cancelled);
        report
    }

    fn fail(&mut self, err: &SyncError) {
        self.status = match err {
            SyncError::Cancelled => StreamStatus::Cancelled,
            _ => StreamStatus::Failed,
        };
        self.error_kind = Some(err.kind().to_string());
        self.error = Some(err.to_string());
    }

    pub fn details(&self, run_id: Uuid) -> SyncDetails {
        SyncDetails {
            run_id: Some(run_id),
            status: self.status.as_str().to_string(),
            fetched: self.fetched,
            written: self.written,
            skipped: self.skipped,
            date_range: self.date_range,
            error_kind: self.error_kind.clone(),
            error: self.error.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub kind: RunKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub end_date: NaiveDate,
    pub backend: String,
    pub upsert_guarantee: UpsertGuarantee,
    pub reports: Vec<StreamReport>,
}

impl SyncRunSummary {
    pub fn is_success(&self) -> bool {
        self.reports
            .iter()
            .all(|r| r.status == StreamStatus::Success)
    }

    pub fn report(&self, stream: Stream) -> Option<&StreamReport> {
        self.reports.iter().find(|r| r.stream == stream)
    }

    pub fn failed(&self) -> impl Iterator<Item = &StreamReport> {
        self.reports
            .iter()
            .filter(|r| r.status != StreamStatus::Success)
    }

    pub fn total_written(&self) -> usize {
        self.reports.iter().map(|r| r.written).sum()
    }
}

#[derive(Debug, Clone, Copy)]
enum DatedFeed {
    Showtimes,
    BoxOffice(Period),
}

fn note_failures(report: &mut StreamReport, failures: &[MappingError]) {
    for failure in failures {
        warn!(stream = %report.stream, error = %failure, "skipping unmappable record");
    }
    report.skipped += failures.len();
}

fn tally(report: &mut StreamReport, written: Result<usize, StorageError>) -> Result<(), SyncError> {
    match written {
        Ok(count) => {
            report.written += count;
            Ok(())
        }
        Err(err) => {
            report.written += err.committed();
            Err(err.into())
        }
    }
}

/// Runs each planned stream in turn against one shared client and backend.
pub struct SyncOrchestrator {
    client: Arc<UpstreamClient>,
    storage: Arc<dyn StorageBackend>,
    plans: Vec<StreamPlan>,
    offset: FixedOffset,
    max_pages: u32,
    cancel: CancellationToken,
    run_gate: Mutex<()>,
}

impl SyncOrchestrator {
    pub fn new(
        client: Arc<UpstreamClient>,
        storage: Arc<dyn StorageBackend>,
        plans: Vec<StreamPlan>,
    ) -> Self {
        Self {
            client,
            storage,
            plans,
            offset: reporting_offset(DEFAULT_REPORTING_UTC_OFFSET_HOURS),
            max_pages: DEFAULT_MAX_PAGES,
            cancel: CancellationToken::new(),
            run_gate: Mutex::new(()),
        }
    }

    pub fn with_reporting_offset(mut self, offset: FixedOffset) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_max_pages(mut self, max_pages: u32) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    pub fn plans(&self) -> &[StreamPlan] {
        &self.plans
    }

    pub fn today(&self) -> NaiveDate {
        Utc::now().with_timezone(&self.offset).date_naive()
    }

    /// Runs unless another run holds the gate, in which case returns `None`.
    pub async fn try_run(&self, options: &RunOptions) -> Option<SyncRunSummary> {
        let _gate = self.run_gate.try_lock().ok()?;
        Some(self.run_locked(options).await)
    }

    pub async fn run(&self, options: &RunOptions) -> SyncRunSummary {
        let _gate = self.run_gate.lock().await;
        self.run_locked(options).await
    }

    async fn run_locked(&self, options: &RunOptions) -> SyncRunSummary {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let ctx = MapContext::new(started_at);
        let end_date = options.end_date.unwrap_or_else(|| self.today());

        let plans = self
            .plans
            .iter()
            .filter(|plan| match &options.streams {
                Some(only) => only.contains(&plan.stream),
                None => true,
            })
            .collect::<Vec<_>>();

        info!(
            %run_id,
            kind = options.kind.as_str(),
            %end_date,
            backend = self.storage.name(),
            streams = plans.len(),
            "sync run starting"
        );

        let mut reports = Vec::with_capacity(plans.len());
        for plan in plans {
            if self.cancel.is_cancelled() {
                reports.push(StreamReport::cancelled(plan.stream));
                continue;
            }
            let span = info_span!("sync_stream", stream = %plan.stream, %run_id);
            let report = self
                .sync_stream(plan, end_date, options, &ctx)
                .instrument(span)
                .await;
            self.log_stream(run_id, &report).await;
            reports.push(report);
        }

        let finished_at = Utc::now();
        let summary = SyncRunSummary {
            run_id,
            kind: options.kind,
            started_at,
            finished_at,
            end_date,
            backend: self.storage.name().to_string(),
            upsert_guarantee: self.storage.upsert_guarantee(),
            reports,
        };
        self.log_run(&summary).await;
        info!(
            %run_id,
            success = summary.is_success(),
            written = summary.total_written(),
            "sync run finished"
        );
        summary
    }

    async fn sync_stream(
        &self,
        plan: &StreamPlan,
        end_date: NaiveDate,
        options: &RunOptions,
        ctx: &MapContext,
    ) -> StreamReport {
        let mut report = StreamReport::new(plan.stream);
        let result = match plan.stream {
            Stream::Movies => self.sync_movies(plan, ctx, &mut report).await,
            Stream::Insights => self.sync_insights(plan, ctx, &mut report).await,
            Stream::Showtimes => {
                let feed = DatedFeed::Showtimes;
                self.sync_dated(plan, feed, end_date, options, ctx, &mut report)
                    .await
            }
            Stream::BoxOffice(period) => {
                let feed = DatedFeed::BoxOffice(period);
                self.sync_dated(plan, feed, end_date, options, ctx, &mut report)
                    .await
            }
        };

        match result {
            Ok(()) => info!(
                fetched = report.fetched,
                written = report.written,
                skipped = report.skipped,
                "stream synced"
            ),
            Err(err) => {
                warn!(
                    error_kind = err.kind(),
                    error = %err,
                    written = report.written,
                    "stream failed"
                );
                report.fail(&err);
            }
        }
        report
    }

    fn check_cancelled(&self) -> Result<(), SyncError> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        Ok(())
    }

    /// Awaits an upstream call unless the run is cancelled first. Upstream
    /// calls may spend a long time in backoff, so they are raced against the
    /// token; storage writes are not.
    async fn until_cancelled<T>(
        &self,
        fetch: impl Future<Output = Result<T, FetchError>>,
    ) -> Result<T, SyncError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SyncError::Cancelled),
            result = fetch => result.map_err(SyncError::from),
        }
    }

    /// Pages through a list endpoint and returns every raw item.
    async fn collect_pages<F, Fut>(
        &self,
        limit: u32,
        report: &mut StreamReport,
        mut fetch_page: F,
    ) -> Result<Vec<JsonValue>, SyncError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<JsonValue, FetchError>>,
    {
        let mut items = Vec::new();
        for page in 0..self.max_pages {
            self.check_cancelled()?;
            let body = self.until_cancelled(fetch_page(page)).await?;
            let page_data = Page::from_body(&body);
            let last = page_data.is_last(page, limit);
            debug!(page, items = page_data.items.len(), total = ?page_data.total, "page fetched");
            report.fetched += page_data.items.len();
            items.extend(page_data.items);
            if last {
                return Ok(items);
            }
        }
        warn!(max_pages = self.max_pages, "page limit reached");
        Ok(items)
    }

    async fn sync_movies(
        &self,
        plan: &StreamPlan,
        ctx: &MapContext,
        report: &mut StreamReport,
    ) -> Result<(), SyncError> {
        let limit = plan.page_limit;
        let items = self
            .collect_pages(limit, report, |page| {
                self.client.movie_directory(page, limit, None)
            })
            .await?;
        let outcome = map_all(&items, |raw| map_movie(raw, ctx));
        note_failures(report, &outcome.failures);
        self.check_cancelled()?;
        tally(report, self.storage.upsert_movies(&outcome.records).await)
    }

    async fn sync_dated(
        &self,
        plan: &StreamPlan,
        feed: DatedFeed,
        end_date: NaiveDate,
        options: &RunOptions,
        ctx: &MapContext,
        report: &mut StreamReport,
    ) -> Result<(), SyncError> {
        let watermark = if options.ignores_watermark() {
            None
        } else {
            self.storage.latest_date(plan.stream).await?
        };
        let lookback = options.lookback_days.unwrap_or(plan.initial_lookback_days);
        let Some(range) = date_window(watermark, end_date, lookback, plan.overlap_days) else {
            info!(?watermark, %end_date, "stream already up to date");
            return Ok(());
        };
        info!(?watermark, start = %range.start, end = %range.end, "fetching date range");
        report.date_range = Some(range);

        let dates = match feed {
            DatedFeed::Showtimes => range.days().collect::<Vec<_>>(),
            DatedFeed::BoxOffice(period) => range.period_ends(period),
        };
        let limit = plan.page_limit;
        for date in dates {
            self.check_cancelled()?;
            match feed {
                DatedFeed::Showtimes => {
                    let items = self
                        .collect_pages(limit, report, |page| {
                            self.client.daily_showtime(date, page, limit)
                        })
                        .await?;
                    let outcome = map_all(&items, |raw| map_showtime(raw, date, ctx));
                    note_failures(report, &outcome.failures);
                    tally(report, self.storage.upsert_showtimes(&outcome.records).await)?;
                }
                DatedFeed::BoxOffice(period) => {
                    let items = self
                        .collect_pages(limit, report, |page| {
                            self.client.box_office(date, period, page, limit)
                        })
                        .await?;
                    let outcome = map_all(&items, |raw| map_box_office(raw, date, period, ctx));
                    note_failures(report, &outcome.failures);
                    tally(report, self.storage.upsert_box_office(&outcome.records).await)?;
                }
            }
        }
        Ok(())
    }

    /// Newest-first listing; stops at the first page with nothing new.
    async fn sync_insights(
        &self,
        plan: &StreamPlan,
        ctx: &MapContext,
        report: &mut StreamReport,
    ) -> Result<(), SyncError> {
        let mut known = self.storage.insight_ids().await?;
        debug!(known = known.len(), "existing insight ids loaded");
        let limit = plan.page_limit;

        for page in 0..self.max_pages {
            self.check_cancelled()?;
            let body = self.until_cancelled(self.client.insights(page, limit)).await?;
            let page_data = Page::from_body(&body);
            report.fetched += page_data.items.len();

            let mut new_on_page = 0usize;
            for item in &page_data.items {
                let (id, slug) = match insight_key(item) {
                    Ok(key) => key,
                    Err(err) => {
                        note_failures(report, std::slice::from_ref(&err));
                        continue;
                    }
                };
                if known.contains(&id) {
                    continue;
                }
                new_on_page += 1;

                self.check_cancelled()?;
                let detail = match self.until_cancelled(self.client.insight_detail(&slug)).await {
                    Ok(detail) => detail,
                    Err(SyncError::Fetch(
                        err @ (FetchError::Upstream { .. } | FetchError::InvalidBody { .. }),
                    )) => {
                        warn!(%slug, error = %err, "insight detail unavailable, skipping article");
                        report.skipped += 1;
                        continue;
                    }
                    Err(err) => return Err(err),
                };

                match map_insight(item, Some(&detail), ctx) {
                    Ok(article) => {
                        self.storage.upsert_insight(&article).await?;
                        report.written += 1;
                        known.insert(id);
                    }
                    Err(err) => note_failures(report, std::slice::from_ref(&err)),
                }
            }

            if new_on_page == 0 {
                debug!(page, "no new insights on page, stopping");
                return Ok(());
            }
            if page_data.is_last(page, limit) {
                return Ok(());
            }
        }
        warn!(max_pages = self.max_pages, "page limit reached");
        Ok(())
    }

    async fn log_stream(&self, run_id: Uuid, report: &StreamReport) {
        let entry = SyncLogEntry::for_stream(report.stream, &report.details(run_id));
        if let Err(err) = self.storage.log_sync(&entry).await {
            warn!(stream = %report.stream, error = %err, "could not write sync log entry");
        }
    }

    async fn log_run(&self, summary: &SyncRunSummary) {
        let results = summary
            .reports
            .iter()
            .map(|r| (r.stream.key(), json!(r.status.as_str())))
            .collect::<Map<_, _>>();
        let duration = (summary.finished_at - summary.started_at).num_seconds();
        let entry = SyncLogEntry::new(
            summary.kind.as_str(),
            json!({
                "runId": summary.run_id,
                "endDate": summary.end_date,
                "durationSeconds": duration,
                "status": if summary.is_success() { "success" } else { "partial" },
                "written": summary.total_written(),
                "results": results,
            }),
        );
        if let Err(err) = self.storage.log_sync(&entry).await {
            warn!(run_id = %summary.run_id, error = %err, "could not write run log entry");
        }
    }
}
