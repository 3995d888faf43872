//! Scrape-and-reconcile pipeline: diff scraped items against the store and
//! commit the result in bounded atomic groups.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use mpt_core::{
    is_unwanted, normalize_product_id, round_cents, truncate_description, PriceHistoryEntry,
    Product, ProductProjection, ScrapedItem,
};
use mpt_scraper::{
    BrowserLauncher, ChromiumLauncher, ExtractionReport, ExtractorSettings, PageExtractor,
    SelectorConfig, SelectorError, SelectorSet, DEFAULT_TARGET_URL,
};
use mpt_storage::{
    ArtifactStore, BackoffPolicy, DocumentStore, PriceTransition, ProductUpdate, StoreError,
    WriteOp, STORE_MAX_OPS_PER_COMMIT,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "mpt-sync";

pub const DEFAULT_MAX_OPS_PER_COMMIT: usize = 450;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("environment variable {0} is required")]
    MissingVar(&'static str),
    #[error("{var}={value:?} is invalid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error(transparent)]
    Selectors(#[from] SelectorError),
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub target_url: String,
    pub headless: bool,
    pub max_items: usize,
    pub debug: bool,
    pub selectors_path: Option<PathBuf>,
    pub artifacts_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub max_ops_per_commit: usize,
    pub nav_timeout: Duration,
    pub store_read_timeout: Duration,
    pub scheduler_enabled: bool,
    pub sync_cron_1: String,
    pub sync_cron_2: Option<String>,
}

fn env_flag(value: Option<String>, default: bool) -> bool {
    value
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn env_number<T: std::str::FromStr>(
    var: &'static str,
    value: Option<String>,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match value {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

fn reports_dir(lookup: impl Fn(&str) -> Option<String>) -> PathBuf {
    lookup("REPORTS_DIR")
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("./reports"))
}

/// `REPORTS_DIR` on its own, for commands that only read run reports.
pub fn reports_dir_from_env() -> PathBuf {
    reports_dir(|key| std::env::var(key).ok())
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let database_url = get("DATABASE_URL").ok_or(ConfigError::MissingVar("DATABASE_URL"))?;
        let max_ops_per_commit = env_number(
            "MAX_OPS_PER_COMMIT",
            get("MAX_OPS_PER_COMMIT"),
            DEFAULT_MAX_OPS_PER_COMMIT,
        )?;
        if !(2..STORE_MAX_OPS_PER_COMMIT).contains(&max_ops_per_commit) {
            return Err(ConfigError::Invalid {
                var: "MAX_OPS_PER_COMMIT",
                value: max_ops_per_commit.to_string(),
                reason: format!("must be at least 2 and below {STORE_MAX_OPS_PER_COMMIT}"),
            });
        }

        Ok(Self {
            database_url,
            target_url: get("TARGET_URL").unwrap_or_else(|| DEFAULT_TARGET_URL.to_string()),
            headless: env_flag(get("HEADLESS"), true),
            max_items: env_number("MAX_ITEMS", get("MAX_ITEMS"), 0)?,
            debug: env_flag(get("DEBUG_LOG"), false),
            selectors_path: get("SELECTORS_PATH").map(PathBuf::from),
            artifacts_dir: get("ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./artifacts")),
            reports_dir: reports_dir(&lookup),
            max_ops_per_commit,
            nav_timeout: Duration::from_secs(env_number(
                "NAV_TIMEOUT_SECS",
                get("NAV_TIMEOUT_SECS"),
                30,
            )?),
            store_read_timeout: Duration::from_secs(env_number(
                "STORE_READ_TIMEOUT_SECS",
                get("STORE_READ_TIMEOUT_SECS"),
                20,
            )?),
            scheduler_enabled: env_flag(get("MPT_SCHEDULER_ENABLED"), false),
            sync_cron_1: get("SYNC_CRON_1").unwrap_or_else(|| "0 0 * * * *".to_string()),
            sync_cron_2: get("SYNC_CRON_2"),
        })
    }

    pub fn selector_set(&self) -> Result<SelectorSet, ConfigError> {
        let config = SelectorConfig::load(self.selectors_path.as_deref())?;
        Ok(SelectorSet::compile(config)?)
    }

    pub fn extractor_settings(&self) -> ExtractorSettings {
        ExtractorSettings {
            target_url: self.target_url.clone(),
            max_items: self.max_items,
            debug: self.debug,
            ..ExtractorSettings::default()
        }
    }

    pub fn chromium_launcher(&self) -> ChromiumLauncher {
        ChromiumLauncher {
            headless: self.headless,
            operation_timeout: self.nav_timeout,
        }
    }

    pub fn read_policy(&self) -> ReadPolicy {
        ReadPolicy {
            timeout: self.store_read_timeout,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Timeout and retry schedule for the reconciliation read.
#[derive(Debug, Clone, Copy)]
pub struct ReadPolicy {
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for ReadPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeKind {
    New,
    Changed,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemOutcome {
    pub product_id: String,
    pub name: String,
    pub kind: OutcomeKind,
    pub previous_price: Option<f64>,
    pub current_price: f64,
    pub changed: bool,
    pub delta: f64,
}

/// A product write plus, when present, its history append. Never split.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteUnit {
    pub product_id: String,
    pub ops: Vec<WriteOp>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PreparedRecord {
    pub id: String,
    pub item: ScrapedItem,
}

/// Scraped items filtered, keyed and deduplicated for reconciliation.
#[derive(Debug, Clone, Default)]
pub struct PreparedBatch {
    pub records: Vec<PreparedRecord>,
    pub rejected: usize,
    pub empty_ids: usize,
    pub duplicates: usize,
}

impl PreparedBatch {
    pub fn from_items(items: Vec<ScrapedItem>) -> Self {
        let mut batch = Self::default();
        let mut seen = HashSet::new();
        for item in items {
            if is_unwanted(&item.name, item.price) {
                batch.rejected += 1;
                continue;
            }
            let id = normalize_product_id(&item.name);
            if id.is_empty() {
                warn!(name = %item.name, "name normalizes to an empty id; skipping");
                batch.empty_ids += 1;
                continue;
            }
            if !seen.insert(id.clone()) {
                batch.duplicates += 1;
                continue;
            }
            batch.records.push(PreparedRecord { id, item });
        }
        batch
    }

    pub fn ids(&self) -> Vec<String> {
        self.records.iter().map(|r| r.id.clone()).collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct WritePlan {
    pub units: Vec<WriteUnit>,
    pub outcomes: Vec<ItemOutcome>,
}

impl WritePlan {
    pub fn count(&self, kind: OutcomeKind) -> usize {
        self.outcomes.iter().filter(|o| o.kind == kind).count()
    }

    pub fn op_count(&self) -> usize {
        self.units.iter().map(|u| u.ops.len()).sum()
    }
}

/// Decides create / update / transition for every prepared record.
pub fn plan_writes(
    existing: &HashMap<String, ProductProjection>,
    batch: &PreparedBatch,
    now: DateTime<Utc>,
) -> WritePlan {
    let mut plan = WritePlan::default();
    for PreparedRecord { id, item } in &batch.records {
        let name = item.name.trim().to_string();
        let description = truncate_description(&item.description);
        let observed = item.price;
        let history = WriteOp::AppendHistory {
            product_id: id.clone(),
            entry: PriceHistoryEntry {
                price: observed,
                at: now,
            },
        };

        let (ops, outcome) = match existing.get(id) {
            None => (
                vec![
                    WriteOp::CreateProduct(Product {
                        id: id.clone(),
                        name: name.clone(),
                        description,
                        current_price: observed,
                        last_price: observed,
                        created_at: now,
                        last_seen_at: now,
                        price_changed_at: None,
                        change_count: 0,
                        snapshot: item.displayed(),
                    }),
                    history,
                ],
                ItemOutcome {
                    product_id: id.clone(),
                    name,
                    kind: OutcomeKind::New,
                    previous_price: None,
                    current_price: observed,
                    changed: false,
                    delta: 0.0,
                },
            ),
            Some(stored) => {
                let changed = observed != stored.current_price;
                let update = ProductUpdate {
                    id: id.clone(),
                    name: name.clone(),
                    description,
                    last_seen_at: now,
                    snapshot: item.displayed(),
                    transition: changed.then_some(PriceTransition {
                        last_price: stored.current_price,
                        current_price: observed,
                        changed_at: now,
                    }),
                };
                let mut ops = vec![WriteOp::UpdateProduct(update)];
                if changed {
                    ops.push(history);
                }
                (
                    ops,
                    ItemOutcome {
                        product_id: id.clone(),
                        name,
                        kind: if changed {
                            OutcomeKind::Changed
                        } else {
                            OutcomeKind::Unchanged
                        },
                        previous_price: Some(stored.current_price),
                        current_price: observed,
                        changed,
                        delta: if changed {
                            round_cents(observed - stored.current_price)
                        } else {
                            0.0
                        },
                    },
                )
            }
        };
        plan.units.push(WriteUnit {
            product_id: id.clone(),
            ops,
        });
        plan.outcomes.push(outcome);
    }
    plan
}

#[derive(Debug, Clone, Default)]
pub struct Reconciliation {
    pub plan: WritePlan,
    pub rejected: usize,
    pub empty_ids: usize,
    pub duplicates: usize,
    /// The batched read failed and every record was planned as new.
    pub degraded: bool,
}

/// Reads the stored projection for every record in one call, then plans writes.
pub async fn reconcile(
    store: &dyn DocumentStore,
    items: Vec<ScrapedItem>,
    now: DateTime<Utc>,
    policy: &ReadPolicy,
) -> Reconciliation {
    let batch = PreparedBatch::from_items(items);
    let ids = batch.ids();

    let (existing, degraded) = if ids.is_empty() {
        (HashMap::new(), false)
    } else {
        match policy
            .backoff
            .run(policy.timeout, || store.get_projections(&ids))
            .await
        {
            Ok(existing) => (existing, false),
            Err(err) => {
                warn!(
                    error = %err,
                    records = ids.len(),
                    "batched product read failed; treating every record as new"
                );
                (HashMap::new(), true)
            }
        }
    };

    Reconciliation {
        plan: plan_writes(&existing, &batch, now),
        rejected: batch.rejected,
        empty_ids: batch.empty_ids,
        duplicates: batch.duplicates,
        degraded,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChunkError {
    #[error("max_ops must be at least 2 and below {limit}, got {max_ops}")]
    InvalidCeiling { max_ops: usize, limit: usize },
    #[error("write unit for {product_id} has {ops} operations, above max_ops {max_ops}")]
    UnitTooLarge {
        product_id: String,
        ops: usize,
        max_ops: usize,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitGroup {
    pub ops: Vec<WriteOp>,
    pub product_ids: Vec<String>,
}

/// Packs consecutive units into groups of at most `max_ops` operations.
pub fn chunk_write_units(
    units: Vec<WriteUnit>,
    max_ops: usize,
) -> Result<Vec<CommitGroup>, ChunkError> {
    if !(2..STORE_MAX_OPS_PER_COMMIT).contains(&max_ops) {
        return Err(ChunkError::InvalidCeiling {
            max_ops,
            limit: STORE_MAX_OPS_PER_COMMIT,
        });
    }

    let mut groups = Vec::new();
    let mut current = CommitGroup::default();
    for unit in units {
        if unit.ops.len() > max_ops {
            return Err(ChunkError::UnitTooLarge {
                product_id: unit.product_id,
                ops: unit.ops.len(),
                max_ops,
            });
        }
        if current.ops.len() + unit.ops.len() > max_ops {
            groups.push(std::mem::take(&mut current));
        }
        current.product_ids.push(unit.product_id);
        current.ops.extend(unit.ops);
    }
    if !current.ops.is_empty() {
        groups.push(current);
    }
    Ok(groups)
}

#[derive(Debug, Error)]
#[error(
    "commit group {group_index} failed after {committed_groups} groups ({committed_ops} operations) were committed: {source}"
)]
pub struct CommitFailure {
    pub group_index: usize,
    pub committed_groups: usize,
    pub committed_ops: usize,
    #[source]
    pub source: StoreError,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitStats {
    pub groups: usize,
    pub ops: usize,
}

pub async fn commit_groups(
    store: &dyn DocumentStore,
    groups: &[CommitGroup],
) -> Result<CommitStats, CommitFailure> {
    commit_groups_from(store, groups, 0).await
}

/// Commits `groups[start..]` in order, stopping at the first failure.
pub async fn commit_groups_from(
    store: &dyn DocumentStore,
    groups: &[CommitGroup],
    start: usize,
) -> Result<CommitStats, CommitFailure> {
    let mut stats = CommitStats::default();
    for (group_index, group) in groups.iter().enumerate().skip(start) {
        if let Err(source) = store.commit(&group.ops).await {
            return Err(CommitFailure {
                group_index,
                committed_groups: stats.groups,
                committed_ops: stats.ops,
                source,
            });
        }
        stats.groups += 1;
        stats.ops += group.ops.len();
        info!(
            group = group_index + 1,
            total = groups.len(),
            ops = group.ops.len(),
            "committed group"
        );
    }
    Ok(stats)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeOutcome {
    pub product_id: String,
    pub existed: bool,
    pub history_removed: usize,
}

/// Deletes the product named `name` together with its whole price history.
pub async fn purge_product(store: &dyn DocumentStore, name: &str) -> Result<PurgeOutcome> {
    let product_id = normalize_product_id(name);
    anyhow::ensure!(!product_id.is_empty(), "{name:?} does not name a product");
    let existed = store
        .get_product(&product_id)
        .await
        .with_context(|| format!("reading {product_id}"))?
        .is_some();
    let history_removed = store
        .delete_product_with_history(&product_id)
        .await
        .with_context(|| format!("deleting {product_id}"))?;
    info!(%product_id, existed, history_removed, "purged product");
    Ok(PurgeOutcome {
        product_id,
        existed,
        history_removed,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub target_url: String,
    pub new: usize,
    pub changed: usize,
    pub unchanged: usize,
    pub rejected: usize,
    pub skipped_empty_ids: usize,
    pub duplicates: usize,
    pub degraded_read: bool,
    pub commit_groups: usize,
    pub committed_ops: usize,
    pub extraction: ExtractionReport,
    pub outcomes: Vec<ItemOutcome>,
    pub diagnostics: Vec<String>,
    pub reports_dir: String,
}

pub struct SyncPipeline {
    config: SyncConfig,
    store: Arc<dyn DocumentStore>,
    launcher: Arc<dyn BrowserLauncher>,
    extractor: PageExtractor,
    run_lock: Arc<Mutex<()>>,
}

impl SyncPipeline {
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn DocumentStore>,
        launcher: Arc<dyn BrowserLauncher>,
    ) -> Result<Self, ConfigError> {
        let extractor = PageExtractor::new(config.selector_set()?, config.extractor_settings())
            .with_artifacts(ArtifactStore::new(config.artifacts_dir.clone()));
        Ok(Self {
            config,
            store,
            launcher,
            extractor,
            run_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Shares a run lock with other triggers so runs never overlap.
    pub fn with_run_lock(mut self, run_lock: Arc<Mutex<()>>) -> Self {
        self.run_lock = run_lock;
        self
    }

    pub fn with_extractor(mut self, extractor: PageExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn DocumentStore> {
        self.store.clone()
    }

    /// Runs once, waiting for any run in progress to finish first.
    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let _guard = self.run_lock.lock().await;
        self.run_locked().await
    }

    /// Runs once unless another run holds the lock, in which case `None`.
    pub async fn try_run_once(&self) -> Result<Option<SyncRunSummary>> {
        let Ok(_guard) = self.run_lock.try_lock() else {
            warn!("a scrape run is already in progress; skipping trigger");
            return Ok(None);
        };
        self.run_locked().await.map(Some)
    }

    async fn run_locked(&self) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("scrape_run", %run_id);
        async move {
            let started_at = Utc::now();
            info!(target_url = %self.config.target_url, "starting run");

            let scraped = self
                .extractor
                .scrape(self.launcher.as_ref())
                .await
                .context("scraping menu page")?;

            let now = Utc::now();
            let reconciliation = reconcile(
                self.store.as_ref(),
                scraped.items,
                now,
                &self.config.read_policy(),
            )
            .await;
            let plan = reconciliation.plan;
            let new = plan.count(OutcomeKind::New);
            let changed = plan.count(OutcomeKind::Changed);
            let unchanged = plan.count(OutcomeKind::Unchanged);

            let groups = chunk_write_units(plan.units, self.config.max_ops_per_commit)
                .context("grouping writes")?;
            let stats = commit_groups(self.store.as_ref(), &groups).await?;

            let reports_dir = self.config.reports_dir.join(run_id.to_string());
            let summary = SyncRunSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                target_url: self.config.target_url.clone(),
                new,
                changed,
                unchanged,
                rejected: scraped.report.rejected + reconciliation.rejected,
                skipped_empty_ids: reconciliation.empty_ids,
                duplicates: scraped.report.duplicates + reconciliation.duplicates,
                degraded_read: reconciliation.degraded,
                commit_groups: stats.groups,
                committed_ops: stats.ops,
                extraction: scraped.report,
                outcomes: plan.outcomes,
                diagnostics: scraped
                    .diagnostics
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect(),
                reports_dir: reports_dir.display().to_string(),
            };
            write_reports(&reports_dir, &summary).await?;

            info!(new, changed, unchanged, groups = stats.groups, "run finished");
            Ok(summary)
        }
        .instrument(span)
        .await
    }

    /// Registers cron jobs that trigger runs when scheduling is enabled.
    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let crons = std::iter::once(&self.config.sync_cron_1).chain(self.config.sync_cron_2.as_ref());
        for cron in crons {
            let pipeline = Arc::clone(self);
            let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
                let pipeline = Arc::clone(&pipeline);
                Box::pin(async move {
                    match pipeline.try_run_once().await {
                        Ok(Some(summary)) => info!(run_id = %summary.run_id, "scheduled run finished"),
                        Ok(None) => {}
                        Err(err) => warn!(error = %format!("{err:#}"), "scheduled run failed"),
                    }
                })
            })
            .with_context(|| format!("creating scheduler job for cron {cron}"))?;
            sched.add(job).await.context("adding scheduler job")?;
        }
        Ok(Some(sched))
    }
}

fn brief_markdown(summary: &SyncRunSummary) -> String {
    let mut lines = vec![
        "# Menu Price Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Page: {}", summary.target_url),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        format!(
            "- New: {} / Changed: {} / Unchanged: {}",
            summary.new, summary.changed, summary.unchanged
        ),
        format!("- Rejected: {}", summary.rejected),
        format!(
            "- Commits: {} groups, {} operations",
            summary.commit_groups, summary.committed_ops
        ),
    ];
    if summary.degraded_read {
        lines.push("- Store read degraded: every item was written as new".to_string());
    }
    lines.push(String::new());
    lines.push("## Price Changes".to_string());
    let changes = summary
        .outcomes
        .iter()
        .filter(|o| o.changed)
        .map(|o| {
            format!(
                "- {}: {:.2} -> {:.2} ({:+.2})",
                o.name,
                o.previous_price.unwrap_or_default(),
                o.current_price,
                o.delta
            )
        })
        .collect::<Vec<_>>();
    if changes.is_empty() {
        lines.push("- none".to_string());
    } else {
        lines.extend(changes);
    }
    lines.push(String::new());
    lines.join("\n")
}

async fn write_reports(reports_dir: &Path, summary: &SyncRunSummary) -> Result<()> {
    fs::create_dir_all(reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;
    fs::write(reports_dir.join("brief.md"), brief_markdown(summary))
        .await
        .context("writing brief.md")?;
    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(reports_dir.join("summary.json"), json)
        .await
        .context("writing summary.json")?;
    Ok(())
}

/// Renders the latest `runs` run reports, newest first.
pub fn report_recent_markdown(runs: usize, reports_root: &Path) -> Result<String> {
    let mut dirs = std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .filter_map(|entry| {
            let path = entry.path().join("summary.json");
            let text = std::fs::read_to_string(&path).ok()?;
            serde_json::from_str::<SyncRunSummary>(&text).ok()
        })
        .collect::<Vec<_>>();
    dirs.sort_by(|a, b| b.finished_at.cmp(&a.finished_at));

    let mut lines = vec!["# Recent Runs".to_string(), String::new()];
    for summary in dirs.into_iter().take(runs.max(1)) {
        lines.push(format!("## Run `{}`", summary.run_id));
        lines.push(format!("- finished: {}", summary.finished_at));
        lines.push(format!(
            "- new {} / changed {} / unchanged {} / rejected {}",
            summary.new, summary.changed, summary.unchanged, summary.rejected
        ));
        if summary.degraded_read {
            lines.push("- degraded store read".to_string());
        }
        lines.push(format!("- brief: `{}/brief.md`", summary.reports_dir));
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}
