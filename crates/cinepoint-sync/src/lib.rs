//! Sync configuration, stream registry, run reports and scheduling.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use cinepoint_core::{ParseKeyError, Period, Stream};
use cinepoint_storage::{
    BigQueryClient, BigQueryConfig, DocumentBackend, FirestoreClient, FirestoreConfig,
    MemoryDocumentStore, StorageBackend, UpsertGuarantee, WarehouseBackend,
};
use cinepoint_upstream::{
    BackoffPolicy, TokenBucketConfig, UpstreamClient, UpstreamConfig, DEFAULT_BASE_URL,
};
use serde::de::{Deserializer, Error as _};
use serde::Deserialize;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

mod orchestrator;

pub use orchestrator::{
    date_window, reporting_offset, RunKind, RunOptions, StreamReport, StreamStatus, SyncError,
    SyncOrchestrator, SyncRunSummary, DEFAULT_MAX_PAGES, DEFAULT_REPORTING_UTC_OFFSET_HOURS,
};

pub const CRATE_NAME: &str = "cinepoint-sync";
pub const DEFAULT_PAGE_LIMIT: u32 = 50;
pub const DEFAULT_INSIGHTS_PAGE_LIMIT: u32 = 20;
pub const SYNC_REPORT_FILE: &str = "sync_report.json";
pub const DAILY_BRIEF_FILE: &str = "daily_brief.md";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Warehouse,
    Document,
    Memory,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Warehouse => "warehouse",
            BackendKind::Document => "document",
            BackendKind::Memory => "memory",
        }
    }
}

impl FromStr for BackendKind {
    type Err = ParseKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "warehouse" | "bigquery" => Ok(BackendKind::Warehouse),
            "document" | "firestore" => Ok(BackendKind::Document),
            "memory" => Ok(BackendKind::Memory),
            _ => Err(ParseKeyError {
                kind: "backend",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub access_token: String,
    pub base_url: String,
    pub backend: BackendKind,
    pub google_access_token: Option<String>,
    pub gcp_project_id: String,
    pub bigquery_dataset: String,
    pub bigquery_location: String,
    pub firestore_database: String,
    pub min_interval_ms: u64,
    pub max_attempts: usize,
    pub backoff_base_ms: u64,
    pub http_timeout_secs: u64,
    /// Burst size of the request quota, regaining one request every
    /// `quota_refill_ms`. `None` disables the quota.
    pub quota_capacity: Option<u32>,
    pub quota_refill_ms: u64,
    pub reporting_utc_offset_hours: i32,
    pub initial_lookback_days: u32,
    pub overlap_days: u32,
    pub page_limit: u32,
    pub max_pages: u32,
    pub scheduler_enabled: bool,
    pub sync_cron_1: String,
    pub sync_cron_2: String,
    pub reports_dir: PathBuf,
    pub workspace_root: PathBuf,
}

fn flag(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "TRUE" | "True" | "yes")
}

fn setting<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "ignoring unparseable setting");
            default
        }),
        _ => default,
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; `from_env` uses the process env.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let workspace_root = lookup("CINEPOINT_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let reports_dir = lookup("CINEPOINT_REPORTS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| workspace_root.join("reports"));

        Self {
            access_token: lookup("CINEPOINT_ACCESS_TOKEN").unwrap_or_default(),
            base_url: lookup("CINEPOINT_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            backend: setting(&lookup, "CINEPOINT_BACKEND", BackendKind::Warehouse),
            google_access_token: lookup("GOOGLE_ACCESS_TOKEN").filter(|t| !t.trim().is_empty()),
            gcp_project_id: lookup("GCP_PROJECT_ID")
                .unwrap_or_else(|| cinepoint_storage::warehouse::DEFAULT_PROJECT_ID.to_string()),
            bigquery_dataset: lookup("BIGQUERY_DATASET")
                .unwrap_or_else(|| cinepoint_storage::warehouse::DEFAULT_DATASET.to_string()),
            bigquery_location: lookup("BIGQUERY_LOCATION")
                .unwrap_or_else(|| cinepoint_storage::warehouse::DEFAULT_LOCATION.to_string()),
            firestore_database: lookup("FIRESTORE_DATABASE")
                .unwrap_or_else(|| cinepoint_storage::document::DEFAULT_DATABASE.to_string()),
            min_interval_ms: setting(&lookup, "CINEPOINT_MIN_INTERVAL_MS", 3_000),
            max_attempts: setting(&lookup, "CINEPOINT_MAX_ATTEMPTS", 3),
            backoff_base_ms: setting(&lookup, "CINEPOINT_BACKOFF_BASE_MS", 5_000),
            http_timeout_secs: setting(&lookup, "CINEPOINT_HTTP_TIMEOUT_SECS", 30),
            quota_capacity: Some(setting(&lookup, "CINEPOINT_QUOTA_CAPACITY", 0u32))
                .filter(|capacity| *capacity > 0),
            quota_refill_ms: setting(&lookup, "CINEPOINT_QUOTA_REFILL_MS", 3_000),
            reporting_utc_offset_hours: setting(
                &lookup,
                "CINEPOINT_REPORTING_UTC_OFFSET_HOURS",
                DEFAULT_REPORTING_UTC_OFFSET_HOURS,
            ),
            initial_lookback_days: setting(&lookup, "CINEPOINT_INITIAL_LOOKBACK_DAYS", 2),
            overlap_days: setting(&lookup, "CINEPOINT_OVERLAP_DAYS", 1),
            page_limit: setting(&lookup, "CINEPOINT_PAGE_LIMIT", DEFAULT_PAGE_LIMIT),
            max_pages: setting(&lookup, "CINEPOINT_MAX_PAGES", DEFAULT_MAX_PAGES),
            scheduler_enabled: lookup("CINEPOINT_SCHEDULER_ENABLED")
                .map(|v| flag(&v))
                .unwrap_or(false),
            sync_cron_1: lookup("SYNC_CRON_1").unwrap_or_else(|| "0 0 6 * * *".to_string()),
            sync_cron_2: lookup("SYNC_CRON_2").unwrap_or_else(|| "0 0 18 * * *".to_string()),
            reports_dir,
            workspace_root,
        }
    }

    pub fn upstream_config(&self) -> UpstreamConfig {
        let mut config = UpstreamConfig::new(self.access_token.clone());
        config.base_url = self.base_url.clone();
        config.timeout = Duration::from_secs(self.http_timeout_secs);
        config.min_interval = Duration::from_millis(self.min_interval_ms);
        config.backoff = BackoffPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.backoff_base_ms),
            ..BackoffPolicy::default()
        };
        config.token_bucket = self.quota_capacity.map(|capacity| TokenBucketConfig {
            capacity,
            refill_every: Duration::from_millis(self.quota_refill_ms),
        });
        config
    }

    pub fn streams_path(&self) -> PathBuf {
        self.workspace_root.join("streams.yaml")
    }

    fn google_token(&self) -> Result<String> {
        match &self.google_access_token {
            Some(token) => Ok(token.clone()),
            None => bail!(
                "GOOGLE_ACCESS_TOKEN is required for the {} backend",
                self.backend.as_str()
            ),
        }
    }
}

/// Stream-level settings for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamPlan {
    pub stream: Stream,
    pub page_limit: u32,
    pub initial_lookback_days: u32,
    pub overlap_days: u32,
}

impl StreamPlan {
    pub fn new(
        stream: Stream,
        page_limit: u32,
        initial_lookback_days: u32,
        overlap_days: u32,
    ) -> Self {
        Self {
            stream,
            page_limit: page_limit.max(1),
            initial_lookback_days: initial_lookback_days.max(1),
            overlap_days,
        }
    }
}

fn deserialize_stream<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Stream, D::Error> {
    let key = String::deserialize(deserializer)?;
    key.parse().map_err(D::Error::custom)
}

fn enabled_by_default() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamSettings {
    #[serde(deserialize_with = "deserialize_stream")]
    pub stream: Stream,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub page_limit: Option<u32>,
    #[serde(default)]
    pub initial_lookback_days: Option<u32>,
    #[serde(default)]
    pub overlap_days: Option<u32>,
}

/// Contents of `streams.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamRegistry {
    pub streams: Vec<StreamSettings>,
}

impl StreamRegistry {
    pub fn all_enabled() -> Self {
        Self {
            streams: Stream::all()
                .into_iter()
                .map(|stream| StreamSettings {
                    stream,
                    enabled: true,
                    page_limit: None,
                    initial_lookback_days: None,
                    overlap_days: None,
                })
                .collect(),
        }
    }

    /// Reads `path`; a missing file yields `None`.
    pub async fn load(path: &Path) -> Result<Option<Self>> {
        if !fs::try_exists(path).await.unwrap_or(false) {
            return Ok(None);
        }
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let registry = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(registry))
    }

    /// Enabled streams in file order, first entry per stream wins.
    pub fn plans(&self, config: &SyncConfig) -> Vec<StreamPlan> {
        let mut seen = HashSet::new();
        self.streams
            .iter()
            .filter(|s| s.enabled)
            .filter(|s| seen.insert(s.stream))
            .map(|s| {
                let default_limit = match s.stream {
                    Stream::Insights => DEFAULT_INSIGHTS_PAGE_LIMIT,
                    _ => config.page_limit,
                };
                StreamPlan::new(
                    s.stream,
                    s.page_limit.unwrap_or(default_limit),
                    s.initial_lookback_days.unwrap_or(config.initial_lookback_days),
                    s.overlap_days.unwrap_or(config.overlap_days),
                )
            })
            .collect()
    }
}

/// Expands a command-line stream selector. `boxoffice` means every period.
pub fn parse_stream_selector(selector: &str) -> Result<Vec<Stream>, ParseKeyError> {
    match selector.trim().to_ascii_lowercase().as_str() {
        "boxoffice" | "box_office" | "box-office" => {
            Ok(Period::ALL.into_iter().map(Stream::BoxOffice).collect())
        }
        other => other.parse().map(|stream| vec![stream]),
    }
}

pub fn build_backend(config: &SyncConfig) -> Result<Arc<dyn StorageBackend>> {
    let timeout = Duration::from_secs(config.http_timeout_secs.max(30));
    match config.backend {
        BackendKind::Memory => Ok(Arc::new(DocumentBackend::new(MemoryDocumentStore::new()))),
        BackendKind::Warehouse => {
            let mut bq = BigQueryConfig::new(config.google_token()?);
            bq.project_id = config.gcp_project_id.clone();
            bq.dataset = config.bigquery_dataset.clone();
            bq.location = config.bigquery_location.clone();
            bq.timeout = timeout;
            let client = BigQueryClient::new(bq).context("building warehouse client")?;
            Ok(Arc::new(WarehouseBackend::new(client)))
        }
        BackendKind::Document => {
            let mut fs_config =
                FirestoreConfig::new(config.gcp_project_id.clone(), config.google_token()?);
            fs_config.database = config.firestore_database.clone();
            fs_config.timeout = timeout;
            let client = FirestoreClient::new(fs_config).context("building document store client")?;
            Ok(Arc::new(DocumentBackend::new(client)))
        }
    }
}

/// Config plus a ready orchestrator, as used by the CLI.
pub struct SyncService {
    config: SyncConfig,
    orchestrator: Arc<SyncOrchestrator>,
}

impl SyncService {
    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let client = UpstreamClient::new(config.upstream_config())?;
        let storage = build_backend(&config)?;
        let registry = StreamRegistry::load(&config.streams_path())
            .await?
            .unwrap_or_else(StreamRegistry::all_enabled);
        let plans = registry.plans(&config);
        info!(
            backend = storage.name(),
            streams = plans.len(),
            "sync service configured"
        );

        let orchestrator = SyncOrchestrator::new(Arc::new(client), storage, plans)
            .with_reporting_offset(reporting_offset(config.reporting_utc_offset_hours))
            .with_max_pages(config.max_pages);
        Ok(Self {
            config,
            orchestrator: Arc::new(orchestrator),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn orchestrator(&self) -> &Arc<SyncOrchestrator> {
        &self.orchestrator
    }

    pub async fn run_once(&self, options: &RunOptions) -> Result<(SyncRunSummary, PathBuf)> {
        let summary = self.orchestrator.run(options).await;
        let reports_dir = write_reports(&self.config.reports_dir, &summary).await?;
        Ok((summary, reports_dir))
    }

    pub async fn maybe_build_scheduler(&self) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        for cron in [&self.config.sync_cron_1, &self.config.sync_cron_2] {
            if cron.trim().is_empty() {
                continue;
            }
            let orchestrator = Arc::clone(&self.orchestrator);
            let reports_dir = self.config.reports_dir.clone();
            let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
                let orchestrator = Arc::clone(&orchestrator);
                let reports_dir = reports_dir.clone();
                Box::pin(async move {
                    let Some(summary) = orchestrator.try_run(&RunOptions::daily()).await else {
                        warn!("previous sync still running; skipping scheduled run");
                        return;
                    };
                    if let Err(err) = write_reports(&reports_dir, &summary).await {
                        warn!(error = %format!("{err:#}"), "could not write run reports");
                    }
                })
            })
            .with_context(|| format!("creating scheduler job for cron {cron}"))?;
            sched.add(job).await.context("adding scheduler job")?;
            info!(%cron, "scheduled sync job");
        }
        Ok(Some(sched))
    }
}

pub async fn run_sync_once_from_env(options: &RunOptions) -> Result<(SyncRunSummary, PathBuf)> {
    let service = SyncService::from_config(SyncConfig::from_env()).await?;
    service.run_once(options).await
}

pub fn render_daily_brief(summary: &SyncRunSummary) -> String {
    let mut lines = vec![
        "# Cinepoint Sync Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Kind: {}", summary.kind.as_str()),
        format!("- End date: {}", summary.end_date),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        format!("- Backend: {}", summary.backend),
        format!(
            "- Status: {}",
            if summary.is_success() { "success" } else { "partial" }
        ),
    ];
    if summary.upsert_guarantee == UpsertGuarantee::AppendOnly {
        lines.push(
            "- Note: this backend appends on every write; \
             rows re-fetched by overlapping runs are duplicated."
                .to_string(),
        );
    }

    lines.push(String::new());
    lines.push("## Streams".to_string());
    lines.push(String::new());
    lines.push("| Stream | Status | Fetched | Written | Skipped | Dates | Error |".to_string());
    lines.push("|---|---|---:|---:|---:|---|---|".to_string());
    for r in &summary.reports {
        let dates = r
            .date_range
            .map(|d| format!("{}..{}", d.start, d.end))
            .unwrap_or_else(|| "-".to_string());
        lines.push(format!(
            "| {} | {} | {} | {} | {} | {} | {} |",
            r.stream,
            r.status.as_str(),
            r.fetched,
            r.written,
            r.skipped,
            dates,
            r.error_kind.as_deref().unwrap_or("-")
        ));
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Writes `<reports_dir>/<run_id>/{sync_report.json,daily_brief.md}`.
pub async fn write_reports(reports_dir: &Path, summary: &SyncRunSummary) -> Result<PathBuf> {
    let run_dir = reports_dir.join(summary.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing sync report")?;
    fs::write(run_dir.join(SYNC_REPORT_FILE), json)
        .await
        .with_context(|| format!("writing {SYNC_REPORT_FILE}"))?;
    fs::write(run_dir.join(DAILY_BRIEF_FILE), render_daily_brief(summary))
        .await
        .with_context(|| format!("writing {DAILY_BRIEF_FILE}"))?;
    Ok(run_dir)
}

/// Markdown digest of the `runs` most recent run reports under `reports_dir`.
pub fn report_daily_markdown(runs: usize, reports_dir: &Path) -> Result<String> {
    let entries = std::fs::read_dir(reports_dir)
        .with_context(|| format!("reading {}", reports_dir.display()))?;

    let mut reports = Vec::new();
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path().join(SYNC_REPORT_FILE);
        if !path.is_file() {
            continue;
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let value: serde_json::Value = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        reports.push(value);
    }
    reports.sort_by(|a, b| {
        let key = |v: &serde_json::Value| v["finished_at"].as_str().unwrap_or_default().to_string();
        key(b).cmp(&key(a))
    });

    let mut lines = vec!["# Cinepoint Sync Report".to_string(), String::new()];
    if reports.is_empty() {
        lines.push("No sync runs recorded yet.".to_string());
    }
    for report in reports.into_iter().take(runs.max(1)) {
        let text = |key: &str| report[key].as_str().unwrap_or("unknown").to_string();
        lines.push(format!("## Run `{}`", text("run_id")));
        lines.push(format!("- kind: {}", text("kind")));
        lines.push(format!("- finished: {}", text("finished_at")));
        lines.push(format!("- backend: {}", text("backend")));
        for stream in report["reports"].as_array().into_iter().flatten() {
            lines.push(format!(
                "- {}: {} (fetched {}, written {}, skipped {})",
                stream["stream"].as_str().unwrap_or("?"),
                stream["status"].as_str().unwrap_or("?"),
                stream["fetched"].as_u64().unwrap_or(0),
                stream["written"].as_u64().unwrap_or(0),
                stream["skipped"].as_u64().unwrap_or(0),
            ));
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone, Utc};
    use std::collections::HashMap;
    use uuid::Uuid;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn summary(minute: u32, status: StreamStatus) -> SyncRunSummary {
        let at = Utc
            .with_ymd_and_hms(2024, 12, 16, 1, minute, 0)
            .single()
            .expect("ts");
        SyncRunSummary {
            run_id: Uuid::new_v4(),
            kind: RunKind::Daily,
            started_at: at,
            finished_at: at,
            end_date: NaiveDate::from_ymd_opt(2024, 12, 15).expect("date"),
            backend: "warehouse".into(),
            upsert_guarantee: UpsertGuarantee::AppendOnly,
            reports: vec![StreamReport {
                stream: Stream::BoxOffice(Period::Daily),
                status,
                fetched: 3,
                written: 3,
                skipped: 0,
                date_range: None,
                error_kind: None,
                error: None,
            }],
        }
    }

    #[test]
    fn config_defaults_match_upstream_limits() {
        let config = SyncConfig::from_lookup(lookup(&[]));
        assert_eq!(config.backend, BackendKind::Warehouse);
        assert_eq!(config.min_interval_ms, 3_000);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.reporting_utc_offset_hours, 7);
        assert_eq!(config.reports_dir, PathBuf::from("./reports"));
        assert!(!config.scheduler_enabled);

        let upstream = config.upstream_config();
        assert_eq!(upstream.min_interval, Duration::from_secs(3));
        assert_eq!(upstream.backoff.base_delay, Duration::from_secs(5));
        assert!(upstream.token_bucket.is_none());
    }

    #[test]
    fn quota_settings_reach_the_upstream_client_config() {
        let config = SyncConfig::from_lookup(lookup(&[
            ("CINEPOINT_QUOTA_CAPACITY", "40"),
            ("CINEPOINT_QUOTA_REFILL_MS", "1500"),
        ]));
        let bucket = config.upstream_config().token_bucket.expect("quota configured");
        assert_eq!(bucket.capacity, 40);
        assert_eq!(bucket.refill_every, Duration::from_millis(1500));

        let disabled = SyncConfig::from_lookup(lookup(&[("CINEPOINT_QUOTA_CAPACITY", "0")]));
        assert!(disabled.upstream_config().token_bucket.is_none());
    }

    #[test]
    fn config_reads_overrides_and_ignores_garbage() {
        let config = SyncConfig::from_lookup(lookup(&[
            ("CINEPOINT_BACKEND", "firestore"),
            ("CINEPOINT_PAGE_LIMIT", "25"),
            ("CINEPOINT_OVERLAP_DAYS", "not-a-number"),
            ("CINEPOINT_SCHEDULER_ENABLED", "true"),
            ("CINEPOINT_WORKSPACE_ROOT", "/srv/cinepoint"),
        ]));
        assert_eq!(config.backend, BackendKind::Document);
        assert_eq!(config.page_limit, 25);
        assert_eq!(config.overlap_days, 1);
        assert!(config.scheduler_enabled);
        assert_eq!(config.reports_dir, PathBuf::from("/srv/cinepoint/reports"));
    }

    #[test]
    fn google_backends_require_a_token() {
        let config = SyncConfig::from_lookup(lookup(&[("CINEPOINT_BACKEND", "warehouse")]));
        let err = build_backend(&config).err().expect("missing token");
        assert!(err.to_string().contains("GOOGLE_ACCESS_TOKEN"));

        let memory = SyncConfig::from_lookup(lookup(&[("CINEPOINT_BACKEND", "memory")]));
        let backend = build_backend(&memory).expect("memory backend");
        assert_eq!(backend.upsert_guarantee(), UpsertGuarantee::Idempotent);
    }

    #[test]
    fn registry_yaml_overrides_per_stream_settings() {
        let yaml = r#"
streams:
  - stream: movies
  - stream: box_office:weekly
    page_limit: 10
    initial_lookback_days: 14
  - stream: insights
    enabled: false
  - stream: movies
    page_limit: 5
"#;
        let registry: StreamRegistry = serde_yaml::from_str(yaml).expect("yaml");
        let config = SyncConfig::from_lookup(lookup(&[]));
        let plans = registry.plans(&config);
        assert_eq!(plans.len(), 2);
        assert_eq!(plans[0], StreamPlan::new(Stream::Movies, 50, 2, 1));
        assert_eq!(plans[1].stream, Stream::BoxOffice(Period::Weekly));
        assert_eq!(plans[1].page_limit, 10);
        assert_eq!(plans[1].initial_lookback_days, 14);

        let bad = serde_yaml::from_str::<StreamRegistry>("streams:\n  - stream: theatres\n");
        assert!(bad.is_err());
    }

    #[test]
    fn default_registry_pages_insights_in_twenties() {
        let config = SyncConfig::from_lookup(lookup(&[]));
        let plans = StreamRegistry::all_enabled().plans(&config);
        assert_eq!(plans.len(), 7);
        let insights = plans
            .iter()
            .find(|p| p.stream == Stream::Insights)
            .expect("insights");
        assert_eq!(insights.page_limit, DEFAULT_INSIGHTS_PAGE_LIMIT);
    }

    #[test]
    fn stream_selector_expands_box_office() {
        assert_eq!(parse_stream_selector("boxoffice").expect("all").len(), 4);
        assert_eq!(
            parse_stream_selector("box_office:yearly").expect("one"),
            vec![Stream::BoxOffice(Period::Yearly)]
        );
        assert!(parse_stream_selector("cinemas").is_err());
    }

    #[tokio::test]
    async fn missing_registry_file_is_not_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let loaded = StreamRegistry::load(&dir.path().join("streams.yaml"))
            .await
            .expect("load");
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn reports_are_written_and_summarised_newest_first() {
        let dir = tempfile::tempdir().expect("tempdir");
        let older = summary(0, StreamStatus::Success);
        let newer = summary(30, StreamStatus::Failed);

        let run_dir = write_reports(dir.path(), &older).await.expect("older");
        write_reports(dir.path(), &newer).await.expect("newer");

        let brief = std::fs::read_to_string(run_dir.join(DAILY_BRIEF_FILE)).expect("brief");
        assert!(brief.contains("| box_office:daily | success | 3 | 3 | 0 | - | - |"));
        assert!(brief.contains("appends on every write"));

        let markdown = report_daily_markdown(1, dir.path()).expect("markdown");
        assert!(markdown.contains(&newer.run_id.to_string()));
        assert!(!markdown.contains(&older.run_id.to_string()));
        assert!(markdown.contains("- box_office:daily: failed"));
    }

    #[tokio::test]
    async fn scheduler_is_not_built_when_disabled() {
        let config = SyncConfig::from_lookup(lookup(&[
            ("CINEPOINT_ACCESS_TOKEN", "token"),
            ("CINEPOINT_BACKEND", "memory"),
            ("CINEPOINT_WORKSPACE_ROOT", "/nonexistent/cinepoint"),
        ]));
        let service = SyncService::from_config(config).await.expect("service");
        assert!(service.maybe_build_scheduler().await.expect("scheduler").is_none());
        assert_eq!(service.orchestrator().plans().len(), 7);
    }
}
