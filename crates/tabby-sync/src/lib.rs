//! Snapshot pipeline: scrape, dedup, diff against the last master, persist.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tabby_adapters::{
    acquire, AcquireOptions, FixtureDirSource, PageSource, WebObsSource, DEFAULT_BASE_URL,
    DEFAULT_STAR,
};
use tabby_core::{dedup, diff, DiffError, Observation};
use tabby_storage::{read_snapshot, ArtifactStore, HttpClientConfig, HttpFetcher, SnapshotStore};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tabby-sync";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub snapshot_dir: PathBuf,
    pub star: String,
    pub base_url: String,
    pub start_page: u32,
    pub max_pages: u32,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    /// Keep every fetched page here when set.
    pub archive_dir: Option<PathBuf>,
    /// Read `page-<n>.html` files from here instead of the live site.
    pub fixtures_dir: Option<PathBuf>,
    /// Six-field cron expression (with seconds) for `watch` mode.
    pub sync_cron: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let acquire = AcquireOptions::default();
        Self {
            snapshot_dir: PathBuf::from("."),
            star: DEFAULT_STAR.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            start_page: acquire.start_page,
            max_pages: acquire.max_pages,
            user_agent: "tabby-watch/0.1".to_string(),
            http_timeout_secs: 20,
            archive_dir: None,
            fixtures_dir: None,
            sync_cron: "0 0 */6 * * *".to_string(),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Read a YAML config file; environment variables still win.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Self =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        Ok(config.with_overrides(|key| std::env::var(key).ok()))
    }

    /// Apply `TABBY_*` overrides from `lookup`. Unparseable numbers are ignored.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(v) = lookup("TABBY_SNAPSHOT_DIR") {
            self.snapshot_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("TABBY_STAR") {
            self.star = v;
        }
        if let Some(v) = lookup("TABBY_BASE_URL") {
            self.base_url = v;
        }
        if let Some(v) = lookup("TABBY_START_PAGE").and_then(|v| v.parse().ok()) {
            self.start_page = v;
        }
        if let Some(v) = lookup("TABBY_MAX_PAGES").and_then(|v| v.parse().ok()) {
            self.max_pages = v;
        }
        if let Some(v) = lookup("TABBY_USER_AGENT") {
            self.user_agent = v;
        }
        if let Some(v) = lookup("TABBY_HTTP_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.http_timeout_secs = v;
        }
        if let Some(v) = lookup("TABBY_ARCHIVE_DIR") {
            self.archive_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("TABBY_FIXTURES_DIR") {
            self.fixtures_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("TABBY_SYNC_CRON") {
            self.sync_cron = v;
        }
        self
    }

    pub fn acquire_options(&self) -> AcquireOptions {
        AcquireOptions {
            start_page: self.start_page,
            max_pages: self.max_pages.max(1),
        }
    }
}

/// The outcome of comparing a fresh scrape with the previous master.
#[derive(Debug, Clone)]
pub struct SnapshotPlan {
    /// Deduplicated scrape, newest first; becomes the next master.
    pub master: Vec<Observation>,
    /// Records of `master` absent from the previous master, in master order.
    pub added: Vec<Observation>,
    pub duplicates_dropped: usize,
}

/// Pure stage of a run: dedup the scrape, then diff it against `previous`.
pub fn plan_snapshot(
    previous: &[Observation],
    scraped: Vec<Observation>,
) -> Result<SnapshotPlan, DiffError> {
    let scraped_len = scraped.len();
    let master = dedup(scraped);
    let added = diff(previous, &master)?;
    Ok(SnapshotPlan {
        duplicates_dropped: scraped_len - master.len(),
        master,
        added,
    })
}

/// Offline comparison of two snapshot files, as a run would do it.
pub async fn diff_snapshot_files(previous: &Path, current: &Path) -> Result<Vec<Observation>> {
    let previous = read_snapshot(previous).await?;
    let current = read_snapshot(current).await?;
    let plan = plan_snapshot(&previous, current)?;
    Ok(plan.added)
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub source_id: String,
    pub pages_fetched: u32,
    pub archived_pages: usize,
    pub previous_master: Option<String>,
    pub previous_records: usize,
    pub scraped_records: usize,
    pub duplicates_dropped: usize,
    pub master_records: usize,
    pub added_records: usize,
    pub master_path: String,
    pub added_path: String,
}

pub struct SyncPipeline {
    config: SyncConfig,
    store: SnapshotStore,
    archive: Option<ArtifactStore>,
    source: Box<dyn PageSource>,
    run_lock: Mutex<()>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let source: Box<dyn PageSource> = match &config.fixtures_dir {
            Some(dir) => Box::new(FixtureDirSource::new(dir.clone())),
            None => {
                let http = HttpFetcher::new(HttpClientConfig {
                    timeout: Duration::from_secs(config.http_timeout_secs),
                    user_agent: Some(config.user_agent.clone()),
                })?;
                Box::new(WebObsSource::new(http, config.base_url.clone(), config.star.clone()))
            }
        };

        Ok(Self {
            store: SnapshotStore::new(config.snapshot_dir.clone()),
            archive: config.archive_dir.clone().map(ArtifactStore::new),
            source,
            config,
            run_lock: Mutex::new(()),
        })
    }

    pub fn with_source(mut self, source: Box<dyn PageSource>) -> Self {
        self.source = source;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        self.run_at(Local::now().naive_local()).await
    }

    /// Run unless another run is still in progress.
    pub async fn run_if_idle(&self) -> Option<Result<SyncRunSummary>> {
        let _guard = self.run_lock.try_lock().ok()?;
        Some(self.run_unlocked(Local::now().naive_local()).await)
    }

    /// One full run whose snapshot files are stamped with `captured_at`.
    /// Waits for any run already in progress.
    ///
    /// Nothing is written unless every page was fetched and parsed and the
    /// diff succeeded.
    pub async fn run_at(&self, captured_at: NaiveDateTime) -> Result<SyncRunSummary> {
        let _guard = self.run_lock.lock().await;
        self.run_unlocked(captured_at).await
    }

    async fn run_unlocked(&self, captured_at: NaiveDateTime) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        info!(%run_id, source = self.source.source_id(), "starting snapshot run");

        let previous = self
            .store
            .latest_master()
            .await
            .context("loading previous master snapshot")?;
        let (previous_path, previous) = match previous {
            Some(loaded) => (Some(loaded.path), loaded.observations),
            None => {
                info!("no previous master snapshot; every record counts as added");
                (None, Vec::new())
            }
        };

        let acquired = acquire(
            self.source.as_ref(),
            self.config.acquire_options(),
            self.archive.as_ref(),
        )
        .await
        .context("collecting current observations")?;
        let scraped_records = acquired.observations.len();

        let plan = plan_snapshot(&previous, acquired.observations)
            .context("diffing against previous master")?;
        info!(
            master = plan.master.len(),
            added = plan.added.len(),
            duplicates = plan.duplicates_dropped,
            "computed additions"
        );

        let written = self
            .store
            .write_run(captured_at, &plan.master, &plan.added)
            .await
            .context("writing snapshots")?;

        Ok(SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            source_id: self.source.source_id().to_string(),
            pages_fetched: acquired.pages_fetched,
            archived_pages: acquired.archived_pages,
            previous_master: previous_path.map(|p| p.display().to_string()),
            previous_records: previous.len(),
            scraped_records,
            duplicates_dropped: plan.duplicates_dropped,
            master_records: plan.master.len(),
            added_records: plan.added.len(),
            master_path: written.master_path.display().to_string(),
            added_path: written.added_path.display().to_string(),
        })
    }
}

pub async fn run_sync_once(config: SyncConfig) -> Result<SyncRunSummary> {
    SyncPipeline::new(config)?.run_once().await
}

/// Scheduler that runs `pipeline` on its configured cron expression.
/// Ticks that fire while a run is still in progress are skipped.
pub async fn build_scheduler(pipeline: Arc<SyncPipeline>) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = pipeline.config.sync_cron.clone();

    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move {
            match pipeline.run_if_idle().await {
                Some(Ok(summary)) => info!(
                    run_id = %summary.run_id,
                    added = summary.added_records,
                    master = summary.master_records,
                    "scheduled run complete"
                ),
                Some(Err(err)) => warn!("scheduled run failed: {err:#}"),
                None => warn!("previous run still in progress; skipping tick"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fs;

    use chrono::NaiveDate;
    use tabby_storage::SnapshotKind;
    use tempfile::tempdir;

    use super::*;

    fn obs(timestamp: &str, observer: &str) -> Observation {
        Observation::new(timestamp, "label", "12.0", "0.01", "V", observer).expect("observation")
    }

    fn keys(items: &[Observation]) -> Vec<(f64, String)> {
        items
            .iter()
            .map(|o| (o.timestamp(), o.observer_id().to_string()))
            .collect()
    }

    fn at(hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2017, 5, 20)
            .and_then(|d| d.and_hms_opt(hour, 0, 0))
            .expect("time")
    }

    fn page_html(rows: &[(&str, &str)], has_next: bool) -> String {
        let body = rows
            .iter()
            .map(|(jd, observer)| {
                format!(
                    "<tr class=\"obs tr-even\"><td>+</td><td>KIC 8462852</td><td>{jd}</td>\
                     <td>2017 May. 19.5</td><td><a href=\"#\">11.9</a></td><td>&#8212;</td>\
                     <td>V</td><td>{observer}</td><td>000-BLM-612</td></tr>"
                )
            })
            .collect::<String>();
        let pager = if has_next { "<a href=\"?page=2\">Next</a>" } else { "" };
        format!("<html><body><table>{body}</table>{pager}</body></html>")
    }

    fn test_config(root: &Path) -> SyncConfig {
        SyncConfig {
            snapshot_dir: root.join("snapshots"),
            fixtures_dir: Some(root.join("pages")),
            ..SyncConfig::default()
        }
    }

    fn write_pages(root: &Path, pages: &[String]) {
        let dir = root.join("pages");
        fs::create_dir_all(&dir).expect("pages dir");
        for (idx, html) in pages.iter().enumerate() {
            fs::write(dir.join(format!("page-{}.html", idx + 1)), html).expect("page");
        }
    }

    #[test]
    fn plan_dedups_then_diffs() {
        let previous = vec![obs("100", "X")];
        let scraped = vec![obs("100", "X"), obs("105", "Y"), obs("105", "Y")];
        let plan = plan_snapshot(&previous, scraped).expect("plan");
        assert_eq!(plan.duplicates_dropped, 1);
        assert_eq!(
            keys(&plan.master),
            vec![(105.0, "Y".to_string()), (100.0, "X".to_string())]
        );
        assert_eq!(keys(&plan.added), vec![(105.0, "Y".to_string())]);
    }

    #[test]
    fn plan_without_previous_adds_everything() {
        let plan = plan_snapshot(&[], vec![obs("1", "A"), obs("3", "B")]).expect("plan");
        assert_eq!(keys(&plan.added), keys(&plan.master));
        assert_eq!(plan.added.len(), 2);
    }

    #[test]
    fn plan_rejects_unsorted_previous() {
        let previous = vec![obs("1", "A"), obs("2", "A")];
        assert!(plan_snapshot(&previous, vec![obs("3", "A")]).is_err());
    }

    #[test]
    fn overrides_replace_defaults() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("TABBY_SNAPSHOT_DIR", "/data/tabby"),
            ("TABBY_STAR", "KIC 12557548"),
            ("TABBY_START_PAGE", "372"),
            ("TABBY_MAX_PAGES", "not-a-number"),
            ("TABBY_ARCHIVE_DIR", "/data/pages"),
        ]);
        let config = SyncConfig::default().with_overrides(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.snapshot_dir, PathBuf::from("/data/tabby"));
        assert_eq!(config.star, "KIC 12557548");
        assert_eq!(config.start_page, 372);
        assert_eq!(config.max_pages, AcquireOptions::default().max_pages);
        assert_eq!(config.archive_dir, Some(PathBuf::from("/data/pages")));
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
    }

    #[test]
    fn yaml_config_fills_missing_fields_with_defaults() {
        let config: SyncConfig =
            serde_yaml::from_str("snapshot_dir: /srv/tabby\nmax_pages: 50\n").expect("yaml");
        assert_eq!(config.snapshot_dir, PathBuf::from("/srv/tabby"));
        assert_eq!(config.max_pages, 50);
        assert_eq!(config.star, DEFAULT_STAR);
        assert_eq!(config.fixtures_dir, None);
    }

    #[tokio::test]
    async fn diff_snapshot_files_reports_new_rows() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());
        let old = store
            .write_snapshot(SnapshotKind::Master, at(1), &[obs("100", "X")])
            .await
            .expect("old");
        let new = store
            .write_snapshot(SnapshotKind::Master, at(2), &[obs("105", "Y"), obs("100", "X")])
            .await
            .expect("new");

        let added = diff_snapshot_files(&old, &new).await.expect("diff");
        assert_eq!(keys(&added), vec![(105.0, "Y".to_string())]);
    }

    #[tokio::test]
    async fn consecutive_runs_report_only_new_records() {
        let dir = tempdir().expect("tempdir");
        let root = dir.path();

        write_pages(
            root,
            &[
                page_html(&[("2457890.5", "AAA"), ("2457890.25", "BBB")], true),
                page_html(&[("2457890.25", "BBB"), ("2457889.75", "CCC")], false),
            ],
        );
        let pipeline = SyncPipeline::new(test_config(root)).expect("pipeline");

        let first = pipeline.run_at(at(6)).await.expect("first run");
        assert_eq!(first.pages_fetched, 2);
        assert_eq!(first.scraped_records, 4);
        assert_eq!(first.duplicates_dropped, 1);
        assert_eq!(first.master_records, 3);
        assert_eq!(first.added_records, 3);
        assert!(first.previous_master.is_none());

        write_pages(
            root,
            &[
                page_html(&[("2457891.0", "DDD"), ("2457890.5", "AAA")], true),
                page_html(&[("2457890.25", "BBB"), ("2457889.75", "CCC")], false),
            ],
        );
        let second = pipeline.run_at(at(12)).await.expect("second run");
        assert_eq!(second.previous_records, 3);
        assert_eq!(second.master_records, 4);
        assert_eq!(second.added_records, 1);
        assert!(second
            .previous_master
            .as_deref()
            .is_some_and(|p| p.ends_with("MASTER2017-05-20_06:00.csv")));

        let added = read_snapshot(&second.added_path)
            .await
            .expect("added file");
        assert_eq!(keys(&added), vec![(2457891.0, "DDD".to_string())]);
        assert_eq!(added[0].uncertainty(), 0.0);

        let masters = pipeline
            .store()
            .list(SnapshotKind::Master)
            .await
            .expect("list");
        assert_eq!(masters.len(), 2);
    }

    #[tokio::test]
    async fn failed_scrape_writes_nothing() {
        let dir = tempdir().expect("tempdir");
        let root = dir.path();
        // Page 1 promises a page 2 that does not exist.
        write_pages(root, &[page_html(&[("2457890.5", "AAA")], true)]);

        let pipeline = SyncPipeline::new(test_config(root)).expect("pipeline");
        assert!(pipeline.run_at(at(6)).await.is_err());
        assert!(pipeline
            .store()
            .list(SnapshotKind::Master)
            .await
            .expect("list")
            .is_empty());
        assert!(pipeline
            .store()
            .list(SnapshotKind::Added)
            .await
            .expect("list")
            .is_empty());
    }

    #[tokio::test]
    async fn run_if_idle_runs_when_nothing_else_is_running() {
        let dir = tempdir().expect("tempdir");
        let root = dir.path();
        write_pages(root, &[page_html(&[("2457890.5", "AAA")], false)]);

        let config = SyncConfig {
            snapshot_dir: root.join("snapshots"),
            ..SyncConfig::default()
        };
        let pipeline = SyncPipeline::new(config)
            .expect("pipeline")
            .with_source(Box::new(FixtureDirSource::new(root.join("pages"))));
        let summary = pipeline
            .run_if_idle()
            .await
            .expect("idle pipeline runs")
            .expect("run succeeds");
        assert_eq!(summary.added_records, 1);
    }

    #[tokio::test]
    async fn busy_pipeline_skips_the_tick() {
        let dir = tempdir().expect("tempdir");
        let root = dir.path();
        write_pages(root, &[page_html(&[("2457890.5", "AAA")], false)]);
        let pipeline = SyncPipeline::new(test_config(root)).expect("pipeline");

        let held = pipeline.run_lock.lock().await;
        assert!(pipeline.run_if_idle().await.is_none());
        assert!(pipeline
            .store()
            .list(SnapshotKind::Master)
            .await
            .expect("list")
            .is_empty());

        drop(held);
        assert!(pipeline.run_if_idle().await.is_some_and(|run| run.is_ok()));
    }

    #[tokio::test]
    async fn run_at_waits_for_the_run_in_progress() {
        let dir = tempdir().expect("tempdir");
        let root = dir.path();
        write_pages(root, &[page_html(&[("2457890.5", "AAA")], false)]);
        let pipeline = SyncPipeline::new(test_config(root)).expect("pipeline");

        let held = pipeline.run_lock.lock().await;
        let blocked = tokio::time::timeout(Duration::from_millis(50), pipeline.run_at(at(6))).await;
        assert!(blocked.is_err());

        drop(held);
        assert!(pipeline.run_at(at(6)).await.is_ok());
    }
}
