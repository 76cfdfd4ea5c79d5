//! Month-end reconciliation engine: change detection, per-job cycle
//! orchestration, and the scheduler that owns the concurrent job set.
//!
//! The external source keeps revising "final" month-end numbers for days
//! after the boundary. Each job re-fetches its district/month, compares the
//! fetched snapshot against the cached record, updates the cache in place on
//! material change, and finalizes once a configured quiet stretch (or the
//! bounded maximum window) is reached.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use mere_core::{
    is_last_day_of_month, DataChanges, DistrictSnapshot, JobStatus, MetricDelta,
    ReconciliationConfig, ReconciliationJob, TargetMonth, TimelineEntry,
};
use mere_fetch::{DataFetcher, FetchWindow, FixtureDataFetcher, HttpDataFetcher, HttpFetchConfig};
use mere_store::{
    BackoffPolicy, CacheStore, FileCacheStore, InMemoryJobStore, JobStore, JobStoreError,
    PgJobStore,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "mere-engine";

/// Process-level configuration, environment-driven.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_url: Option<String>,
    pub cache_dir: PathBuf,
    pub districts_file: PathBuf,
    /// When set, fetch from local fixture payloads instead of HTTP.
    pub fixtures_dir: Option<PathBuf>,
    pub source_base_url: String,
    pub user_agent: String,
    pub fetch_timeout_secs: u64,
    pub tick_cron: String,
    pub worker_concurrency: usize,
    pub retention_days: i64,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL").ok(),
            cache_dir: std::env::var("MERE_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./cache")),
            districts_file: std::env::var("MERE_DISTRICTS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./districts.yaml")),
            fixtures_dir: std::env::var("MERE_FIXTURES_DIR").map(PathBuf::from).ok(),
            source_base_url: std::env::var("MERE_SOURCE_BASE_URL")
                .unwrap_or_else(|_| "https://dashboards.example.org/api".to_string()),
            user_agent: std::env::var("MERE_USER_AGENT")
                .unwrap_or_else(|_| "mere-bot/0.1".to_string()),
            fetch_timeout_secs: std::env::var("MERE_FETCH_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            tick_cron: std::env::var("MERE_TICK_CRON")
                .unwrap_or_else(|_| "0 0 6 * * *".to_string()),
            worker_concurrency: std::env::var("MERE_WORKER_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8),
            retention_days: std::env::var("MERE_RETENTION_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
        }
    }
}

/// Districts tracked for month-end reconciliation, from `districts.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct DistrictRegistry {
    pub districts: Vec<DistrictConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DistrictConfig {
    pub district_id: String,
    pub display_name: String,
    pub enabled: bool,
}

impl DistrictRegistry {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &DistrictConfig> {
        self.districts.iter().filter(|d| d.enabled)
    }
}

/// Load and validate operator reconciliation parameters. Defaults apply when
/// no file is configured; an invalid file never reaches a running job.
pub fn load_reconciliation_config(path: Option<&Path>) -> Result<ReconciliationConfig> {
    let config = match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
        }
        None => ReconciliationConfig::default(),
    };
    config.validate().context("reconciliation config rejected")?;
    Ok(config)
}

// ---------------------------------------------------------------------------
// Change detection
// ---------------------------------------------------------------------------

/// Compare the cached record against freshly fetched data. Pure: no I/O, no
/// clock reads, deterministic for identical inputs.
///
/// A metric present on one side and absent on the other is a change in
/// itself; absent-on-both metrics produce no delta at all.
pub fn detect_changes(
    cached: Option<&DistrictSnapshot>,
    current: &DistrictSnapshot,
    timestamp: DateTime<Utc>,
) -> DataChanges {
    fn delta(previous: Option<i64>, current: Option<i64>) -> Option<MetricDelta> {
        if previous.is_none() && current.is_none() {
            return None;
        }
        Some(MetricDelta::between(previous, current))
    }

    let (prev_membership, prev_clubs, prev_distinguished) = match cached {
        Some(c) => (c.membership, c.club_count, c.distinguished_clubs),
        None => (None, None, None),
    };

    let membership = delta(prev_membership, current.membership);
    let club_count = delta(prev_clubs, current.club_count);
    let distinguished = delta(prev_distinguished, current.distinguished_clubs);

    let mut changed_fields = Vec::new();
    for (name, d) in [
        ("membership", membership),
        ("club_count", club_count),
        ("distinguished_clubs", distinguished),
    ] {
        if d.is_some_and(|d| d.changed()) {
            changed_fields.push(name.to_string());
        }
    }

    DataChanges {
        has_changes: !changed_fields.is_empty(),
        changed_fields,
        membership,
        club_count,
        distinguished,
        timestamp,
        source_data_date: current.as_of_date,
    }
}

/// Threshold classification: a single metric over its limit is enough to
/// keep the job open (logical OR, not an aggregate score).
pub fn is_significant_change(changes: &DataChanges, config: &ReconciliationConfig) -> bool {
    // Percent is undefined for from-zero movement and presence flips; any
    // such movement exceeds every finite threshold.
    fn percent_exceeds(delta: &MetricDelta, threshold: f64) -> bool {
        match delta.percent {
            Some(pct) => pct.abs() >= threshold,
            None => delta.changed(),
        }
    }

    let membership_hit = changes
        .membership
        .as_ref()
        .is_some_and(|d| percent_exceeds(d, config.membership_change_percent));
    let clubs_hit = changes
        .club_count
        .as_ref()
        .is_some_and(|d| d.absolute.abs() >= config.club_count_change || d.previous.is_some() != d.current.is_some());
    let distinguished_hit = changes
        .distinguished
        .as_ref()
        .is_some_and(|d| percent_exceeds(d, config.distinguished_change_percent));

    membership_hit || clubs_hit || distinguished_hit
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Lifecycle decision one cycle produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Job was already terminal when the cycle started (e.g. cancelled).
    AlreadyTerminal,
    /// Fetch or cache write failed; job stays active for the next tick.
    FetchFailed,
    /// Source has not re-published newer data; nothing recorded.
    SourceNotAdvanced,
    /// Cycle recorded; job remains active.
    Continue { significant: bool, cache_updated: bool },
    /// Max window reached with a recent significant change; window extended.
    Extended,
    Completed { forced: bool },
}

/// Drives one job's fetch → compare → update → finalize cycle.
///
/// Holds no per-job state: each cycle loads the durable record, applies one
/// transition, and persists it, so cancellations issued between ticks are
/// always observed and concurrent cycles for *different* jobs never share
/// mutable state.
pub struct ReconciliationOrchestrator {
    fetcher: Arc<dyn DataFetcher>,
    cache: Arc<dyn CacheStore>,
    jobs: Arc<dyn JobStore>,
    fetch_timeout: Duration,
    save_backoff: BackoffPolicy,
}

impl ReconciliationOrchestrator {
    pub fn new(
        fetcher: Arc<dyn DataFetcher>,
        cache: Arc<dyn CacheStore>,
        jobs: Arc<dyn JobStore>,
    ) -> Self {
        Self {
            fetcher,
            cache,
            jobs,
            fetch_timeout: Duration::from_secs(30),
            save_backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Run one cycle for `job_id` at the injected instant `now`.
    pub async fn run_cycle(
        &self,
        job_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(ReconciliationJob, CycleOutcome)> {
        let mut job = self
            .jobs
            .load(job_id)
            .await?
            .with_context(|| format!("job {job_id} not found in store"))?;

        let span = info_span!(
            "reconcile_cycle",
            job_id = %job.id,
            district_id = %job.district_id,
            month = %job.target_month,
        );
        let _guard = span.enter();

        if job.status.is_terminal() {
            debug!(status = %job.status, "skipping cycle for terminal job");
            return Ok((job, CycleOutcome::AlreadyTerminal));
        }

        let window = FetchWindow::for_month(job.target_month);
        let fetched = match tokio::time::timeout(
            self.fetch_timeout,
            self.fetcher.fetch(&job.district_id, window),
        )
        .await
        {
            Ok(Ok(snapshot)) => Some(snapshot),
            Ok(Err(err)) => {
                self.note_cycle_failure(&mut job, format!("fetch failed: {err}"));
                None
            }
            Err(_elapsed) => {
                self.note_cycle_failure(&mut job, "fetch timed out".to_string());
                None
            }
        };

        let outcome = match fetched {
            Some(snapshot) => self.apply_snapshot(&mut job, snapshot, now).await?,
            None => {
                job.last_cycle_at = Some(now);
                // The max window keeps counting down while the source is
                // unreachable; fetch failure alone is never terminal.
                if now.date_naive() >= job.max_end_date {
                    finalize_or_extend(&mut job, now)
                } else {
                    CycleOutcome::FetchFailed
                }
            }
        };

        self.persist(&mut job).await?;
        Ok((job, outcome))
    }

    fn note_cycle_failure(&self, job: &mut ReconciliationJob, message: String) {
        job.fetch_failures += 1;
        job.last_error = Some(message.clone());
        if job.fetch_failures >= job.config.max_fetch_failures {
            warn!(
                failures = job.fetch_failures,
                stalled_since = ?job.progress.stalled_since(),
                "job cannot advance: {message}"
            );
        } else {
            debug!(failures = job.fetch_failures, "{message}");
        }
    }

    async fn apply_snapshot(
        &self,
        job: &mut ReconciliationJob,
        current: DistrictSnapshot,
        now: DateTime<Utc>,
    ) -> Result<CycleOutcome> {
        let today = now.date_naive();

        // Source data that has not advanced past the last applied as-of date
        // is the same publication we already processed; recording it again
        // would fabricate a quiet entry for data that never moved.
        if let Some(seen) = job.current_data_date {
            if current.as_of_date <= seen {
                debug!(as_of = %current.as_of_date, seen = %seen, "source not advanced");
                job.last_cycle_at = Some(now);
                return Ok(if today >= job.max_end_date {
                    finalize_or_extend(job, now)
                } else {
                    CycleOutcome::SourceNotAdvanced
                });
            }
        }

        let cache_key = job.cache_key();
        let cached = self.cache.get(&cache_key).await?;
        let changes = detect_changes(cached.as_ref(), &current, now);
        let is_significant = is_significant_change(&changes, &job.config);
        let source_data_date = current.as_of_date;

        let mut cache_updated = false;
        if changes.has_changes {
            if let Err(err) = self.cache.set(&cache_key, &current).await {
                // Not committed: the cached record and current_data_date are
                // only advanced together, so readers never see a torn update.
                self.note_cycle_failure(job, format!("cache write failed: {err}"));
                job.last_cycle_at = Some(now);
                return Ok(CycleOutcome::FetchFailed);
            }
            cache_updated = true;
            job.current_data_date = Some(source_data_date);
            info!(
                as_of = %source_data_date,
                fields = ?changes.changed_fields,
                significant = is_significant,
                "cached record updated",
            );
        }

        job.fetch_failures = 0;
        job.last_error = None;
        job.last_cycle_at = Some(now);
        job.progress.record_entry(TimelineEntry {
            date: today,
            source_data_date,
            changes,
            is_significant,
            cache_updated,
        });

        if job
            .progress
            .stable_period(job.config.stability_period_days)
            .is_some()
        {
            job.status = JobStatus::Completed;
            job.finalized_date = Some(today);
            job.end_date = Some(today);
            info!(finalized = %today, "data stable, reconciliation finalized");
            return Ok(CycleOutcome::Completed { forced: false });
        }

        if today >= job.max_end_date {
            return Ok(finalize_or_extend(job, now));
        }

        Ok(CycleOutcome::Continue {
            significant: is_significant,
            cache_updated,
        })
    }

    /// Persist the cycle result. A revision conflict means the durable record
    /// moved underneath us — the only concurrent writer is a cancellation (or
    /// another terminal transition), which always wins.
    async fn persist(&self, job: &mut ReconciliationJob) -> Result<()> {
        for attempt in 0..=self.save_backoff.max_retries {
            match self.jobs.save(job).await {
                Ok(()) => return Ok(()),
                Err(JobStoreError::Conflict { .. }) => {
                    let stored = self
                        .jobs
                        .load(job.id)
                        .await?
                        .with_context(|| format!("job {} vanished during save", job.id))?;
                    if stored.status.is_terminal() {
                        info!(status = %stored.status, "dropping cycle result for terminal job");
                        *job = stored;
                        return Ok(());
                    }
                    job.revision = stored.revision;
                }
                Err(err) if attempt < self.save_backoff.max_retries => {
                    warn!(error = %err, "job save failed, retrying");
                    tokio::time::sleep(self.save_backoff.delay_for_attempt(attempt)).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
        anyhow::bail!("job {} save kept conflicting", job.id)
    }
}

/// Max-window decision: grant a bounded extension when a significant change
/// landed inside the trailing lookback window, otherwise finalize with the
/// best available data. Jobs always terminate within the extension cap.
fn finalize_or_extend(job: &mut ReconciliationJob, now: DateTime<Utc>) -> CycleOutcome {
    let today = now.date_naive();
    let lookback_start = today - chrono::Duration::days(job.config.extension_lookback_days);
    let recent_significant = job
        .progress
        .last_significant_date()
        .is_some_and(|d| d >= lookback_start);

    if job.config.auto_extension_enabled
        && recent_significant
        && job.extensions_granted < job.config.max_extensions
    {
        job.extensions_granted += 1;
        job.max_end_date += chrono::Duration::days(job.config.max_extension_days);
        info!(
            extensions = job.extensions_granted,
            new_max_end = %job.max_end_date,
            "significant change near window end, extension granted",
        );
        return CycleOutcome::Extended;
    }

    let forced = job
        .progress
        .stable_period(job.config.stability_period_days)
        .is_none();
    job.status = JobStatus::Completed;
    job.forced_finalization = forced;
    job.finalized_date = Some(today);
    job.end_date = Some(today);
    if forced {
        warn!(finalized = %today, "max window reached, finalizing with best available data");
    } else {
        info!(finalized = %today, "max window reached on stable data, finalized");
    }
    CycleOutcome::Completed { forced }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct SchedulerOptions {
    /// Cap on concurrently running cycles across distinct jobs.
    pub worker_concurrency: usize,
    /// Days a terminal job stays in the working set before retirement.
    pub retention_days: i64,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            worker_concurrency: 8,
            retention_days: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TickSummary {
    pub at: DateTime<Utc>,
    pub jobs_created: usize,
    pub cycles_dispatched: usize,
    pub ticks_dropped: usize,
    pub cycle_failures: usize,
    pub jobs_retired: usize,
}

/// Owns the active-job set, detects month boundaries, and fans cycles out to
/// a bounded worker pool. Orchestrator cycles receive only a job id and
/// return an updated snapshot, so workers share no mutable job state.
pub struct ReconciliationScheduler {
    config: Arc<ReconciliationConfig>,
    registry: DistrictRegistry,
    jobs: Arc<dyn JobStore>,
    orchestrator: Arc<ReconciliationOrchestrator>,
    working_set: Mutex<HashMap<Uuid, ReconciliationJob>>,
    /// At most one in-flight cycle per job; an overlapping tick is dropped.
    /// Entries are held by [`InFlightGuard`]s, never removed manually.
    in_flight: Arc<StdMutex<HashSet<Uuid>>>,
    worker_limit: Arc<Semaphore>,
    retention_days: i64,
}

impl ReconciliationScheduler {
    pub fn new(
        config: Arc<ReconciliationConfig>,
        registry: DistrictRegistry,
        jobs: Arc<dyn JobStore>,
        orchestrator: Arc<ReconciliationOrchestrator>,
        options: SchedulerOptions,
    ) -> Self {
        Self {
            config,
            registry,
            jobs,
            orchestrator,
            working_set: Mutex::new(HashMap::new()),
            in_flight: Arc::new(StdMutex::new(HashSet::new())),
            worker_limit: Arc::new(Semaphore::new(options.worker_concurrency.max(1))),
            retention_days: options.retention_days,
        }
    }

    /// One scheduler pass at the injected instant: create month-boundary
    /// jobs, dispatch due cycles, retire old terminal jobs.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickSummary> {
        let jobs_created = self.scan_month_boundary(now).await?;
        self.refresh_working_set().await?;

        let due: Vec<Uuid> = {
            let working_set = self.working_set.lock().await;
            working_set
                .values()
                .filter(|j| j.is_due(now))
                .map(|j| j.id)
                .collect()
        };

        let mut cycles_dispatched = 0;
        let mut ticks_dropped = 0;
        let mut cycle_failures = 0;
        let mut workers: JoinSet<(Uuid, Result<(ReconciliationJob, CycleOutcome)>)> =
            JoinSet::new();

        for job_id in due {
            // A cycle from a previous tick may still be running; skip
            // rather than queue so slow fetches cannot build backlog.
            let Some(guard) = InFlightGuard::acquire(&self.in_flight, job_id) else {
                ticks_dropped += 1;
                continue;
            };
            cycles_dispatched += 1;

            let orchestrator = self.orchestrator.clone();
            let worker_limit = self.worker_limit.clone();
            workers.spawn(async move {
                // The guard lives for the whole task, so even a panicking
                // cycle frees the job for the next tick.
                let _in_flight = guard;
                let _permit = worker_limit
                    .acquire_owned()
                    .await
                    .expect("semaphore not closed");
                let result = orchestrator.run_cycle(job_id, now).await;
                (job_id, result)
            });
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((job_id, Ok((job, outcome)))) => {
                    debug!(%job_id, ?outcome, "cycle finished");
                    self.working_set.lock().await.insert(job_id, job);
                }
                // One job's failure never aborts another job or the tick.
                Ok((job_id, Err(err))) => {
                    cycle_failures += 1;
                    warn!(%job_id, error = %err, "cycle failed");
                }
                Err(join_err) => {
                    cycle_failures += 1;
                    warn!(error = %join_err, "cycle worker panicked");
                }
            }
        }

        let jobs_retired = self.retire_terminal(now).await;

        Ok(TickSummary {
            at: now,
            jobs_created,
            cycles_dispatched,
            ticks_dropped,
            cycle_failures,
            jobs_retired,
        })
    }

    /// Jobs whose next check is due per their configured frequency.
    pub async fn check_pending_reconciliations(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        self.working_set
            .lock()
            .await
            .values()
            .filter(|j| j.is_due(now))
            .map(|j| j.id)
            .collect()
    }

    async fn scan_month_boundary(&self, now: DateTime<Utc>) -> Result<usize> {
        let today = now.date_naive();
        let yesterday = today - chrono::Duration::days(1);
        if !is_last_day_of_month(yesterday) {
            return Ok(0);
        }

        let month = TargetMonth::containing(yesterday);
        let mut created = 0;
        for district in self.registry.enabled() {
            if self
                .jobs
                .find_for_month(&district.district_id, month)
                .await?
                .is_some()
            {
                continue;
            }
            let mut job = ReconciliationJob::new(
                &district.district_id,
                month,
                now,
                (*self.config).clone(),
            );
            self.jobs.save(&mut job).await?;
            info!(
                job_id = %job.id,
                district_id = %job.district_id,
                month = %month,
                max_end = %job.max_end_date,
                "month boundary crossed, reconciliation job created",
            );
            self.working_set.lock().await.insert(job.id, job);
            created += 1;
        }
        Ok(created)
    }

    /// Pull active jobs from the durable store into the working set. After a
    /// restart this is what resumes in-flight reconciliations.
    async fn refresh_working_set(&self) -> Result<()> {
        let active = self.jobs.list_active().await?;
        let mut working_set = self.working_set.lock().await;
        for job in active {
            working_set.insert(job.id, job);
        }
        Ok(())
    }

    /// Drop terminal jobs from the working set once the retention period has
    /// passed. Durable records are never deleted here.
    async fn retire_terminal(&self, now: DateTime<Utc>) -> usize {
        let today = now.date_naive();
        let mut working_set = self.working_set.lock().await;
        let before = working_set.len();
        working_set.retain(|_, job| {
            if !job.status.is_terminal() {
                return true;
            }
            let ended = job.end_date.unwrap_or(job.max_end_date);
            today - ended < chrono::Duration::days(self.retention_days)
        });
        before - working_set.len()
    }

    /// Wire the daily tick into a cron-driven scheduler.
    pub async fn build_cron_scheduler(self: &Arc<Self>, cron: &str) -> Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let scheduler = Arc::clone(self);
        let job = Job::new_async(cron, move |_uuid, _lock| {
            let scheduler = scheduler.clone();
            Box::pin(async move {
                match scheduler.tick(Utc::now()).await {
                    Ok(summary) => info!(
                        created = summary.jobs_created,
                        dispatched = summary.cycles_dispatched,
                        dropped = summary.ticks_dropped,
                        retired = summary.jobs_retired,
                        "scheduler tick complete",
                    ),
                    Err(err) => warn!(error = %err, "scheduler tick failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(sched)
    }
}

/// Marks one job's cycle as in flight for the lifetime of its worker task.
/// Released on drop, which runs on every exit path including a panic
/// unwinding the task, so a crashed cycle can be re-dispatched next tick.
struct InFlightGuard {
    in_flight: Arc<StdMutex<HashSet<Uuid>>>,
    job_id: Uuid,
}

impl InFlightGuard {
    /// `None` when a cycle for this job is already in flight.
    fn acquire(in_flight: &Arc<StdMutex<HashSet<Uuid>>>, job_id: Uuid) -> Option<Self> {
        lock_unpoisoned(in_flight).insert(job_id).then(|| Self {
            in_flight: in_flight.clone(),
            job_id,
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        lock_unpoisoned(&self.in_flight).remove(&self.job_id);
    }
}

/// The set stays consistent even if a holder panicked: insert and remove
/// are single operations, so a poisoned lock carries no partial state.
fn lock_unpoisoned(set: &StdMutex<HashSet<Uuid>>) -> MutexGuard<'_, HashSet<Uuid>> {
    set.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Service facade (consumed by the out-of-scope UI/API layer)
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("reconciliation job {0} not found")]
    NotFound(Uuid),
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

pub struct ReconciliationService {
    jobs: Arc<dyn JobStore>,
    default_config: Arc<ReconciliationConfig>,
}

impl ReconciliationService {
    pub fn new(jobs: Arc<dyn JobStore>, default_config: Arc<ReconciliationConfig>) -> Self {
        Self {
            jobs,
            default_config,
        }
    }

    /// Schedule reconciliation for the month containing `month_end_date`.
    /// Returns the live job when one is already mid-flight; completed jobs
    /// are never reopened — an explicit re-run gets a fresh job.
    pub async fn schedule_month_end_reconciliation(
        &self,
        district_id: &str,
        month_end_date: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<ReconciliationJob, ServiceError> {
        let month = TargetMonth::containing(month_end_date);
        if let Some(existing) = self.jobs.find_for_month(district_id, month).await? {
            if existing.status == JobStatus::Active {
                return Ok(existing);
            }
        }
        let mut job =
            ReconciliationJob::new(district_id, month, now, (*self.default_config).clone());
        self.jobs.save(&mut job).await?;
        info!(job_id = %job.id, district_id, month = %month, "reconciliation scheduled");
        Ok(job)
    }

    pub async fn list_active_jobs(&self) -> Result<Vec<ReconciliationJob>, ServiceError> {
        Ok(self.jobs.list_active().await?)
    }

    pub async fn get_reconciliation_job(
        &self,
        job_id: Uuid,
    ) -> Result<ReconciliationJob, ServiceError> {
        self.jobs
            .load(job_id)
            .await?
            .ok_or(ServiceError::NotFound(job_id))
    }

    pub async fn get_reconciliation_timeline(
        &self,
        job_id: Uuid,
    ) -> Result<Vec<TimelineEntry>, ServiceError> {
        let job = self.get_reconciliation_job(job_id).await?;
        Ok(job.progress.timeline().to_vec())
    }

    /// ETA for finalization, `None` once terminal or with too little history.
    pub async fn estimate_completion(
        &self,
        job_id: Uuid,
    ) -> Result<Option<NaiveDate>, ServiceError> {
        let job = self.get_reconciliation_job(job_id).await?;
        if job.status.is_terminal() {
            return Ok(None);
        }
        Ok(job.progress.estimate_completion(&job.config, job.max_end_date))
    }

    /// Cooperative cancellation: flips the durable record to cancelled; an
    /// in-flight cycle finishes its current cache write, then observes the
    /// new revision and drops its result. Idempotent on terminal jobs.
    pub async fn cancel_reconciliation(
        &self,
        job_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ReconciliationJob, ServiceError> {
        for _attempt in 0..3 {
            let mut job = self.get_reconciliation_job(job_id).await?;
            if job.status.is_terminal() {
                return Ok(job);
            }
            job.status = JobStatus::Cancelled;
            job.end_date = Some(now.date_naive());
            match self.jobs.save(&mut job).await {
                Ok(()) => {
                    info!(%job_id, "reconciliation cancelled");
                    return Ok(job);
                }
                Err(JobStoreError::Conflict { .. }) => continue,
                Err(err) => return Err(err.into()),
            }
        }
        // Lost the race three times; report whatever state won.
        self.get_reconciliation_job(job_id).await
    }
}

// ---------------------------------------------------------------------------
// Environment assembly
// ---------------------------------------------------------------------------

/// Assemble a scheduler + service from environment configuration, mirroring
/// the deployed wiring: Postgres job store and HTTP fetcher when configured,
/// in-memory/fixture fallbacks otherwise.
pub async fn build_from_env(
    engine_config: &EngineConfig,
) -> Result<(Arc<ReconciliationScheduler>, ReconciliationService)> {
    let reconciliation = Arc::new(load_reconciliation_config(
        std::env::var("MERE_RECONCILIATION_CONFIG")
            .ok()
            .map(PathBuf::from)
            .as_deref(),
    )?);

    let registry = DistrictRegistry::load(&engine_config.districts_file)?;

    let jobs: Arc<dyn JobStore> = match &engine_config.database_url {
        Some(url) => {
            let store = PgJobStore::connect(url).await.context("connecting job store")?;
            store.ensure_schema().await.context("preparing job store schema")?;
            Arc::new(store)
        }
        None => {
            warn!("DATABASE_URL unset; job records will not survive restart");
            Arc::new(InMemoryJobStore::default())
        }
    };

    let cache: Arc<dyn CacheStore> = Arc::new(FileCacheStore::new(&engine_config.cache_dir));

    let fetcher: Arc<dyn DataFetcher> = match &engine_config.fixtures_dir {
        Some(dir) => Arc::new(FixtureDataFetcher::new(dir)),
        None => Arc::new(
            HttpDataFetcher::new(HttpFetchConfig {
                base_url: engine_config.source_base_url.clone(),
                timeout: Duration::from_secs(engine_config.fetch_timeout_secs),
                user_agent: Some(engine_config.user_agent.clone()),
                backoff: BackoffPolicy::default(),
            })
            .context("building http fetcher")?,
        ),
    };

    let orchestrator = Arc::new(
        ReconciliationOrchestrator::new(fetcher, cache, jobs.clone())
            .with_fetch_timeout(Duration::from_secs(engine_config.fetch_timeout_secs)),
    );

    let scheduler = Arc::new(ReconciliationScheduler::new(
        reconciliation.clone(),
        registry,
        jobs.clone(),
        orchestrator,
        SchedulerOptions {
            worker_concurrency: engine_config.worker_concurrency,
            retention_days: engine_config.retention_days,
        },
    ));

    let service = ReconciliationService::new(jobs, reconciliation);
    Ok((scheduler, service))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use mere_fetch::FetchError;
    use mere_store::InMemoryCacheStore;

    fn nov(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 11, day, 6, 0, 0).single().unwrap()
    }

    fn nov_date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 11, day).unwrap()
    }

    fn october() -> TargetMonth {
        "2025-10".parse().unwrap()
    }

    fn snap(district: &str, as_of_day: u32, membership: i64, clubs: i64, distinguished: i64) -> DistrictSnapshot {
        DistrictSnapshot {
            district_id: district.to_string(),
            target_month: october(),
            as_of_date: nov_date(as_of_day),
            membership: Some(membership),
            club_count: Some(clubs),
            distinguished_clubs: Some(distinguished),
            fetched_at: nov(as_of_day),
            payload_sha256: format!("hash-{membership}-{clubs}-{distinguished}"),
        }
    }

    #[derive(Default)]
    struct ScriptedFetcher {
        responses: std::sync::Mutex<HashMap<String, Result<DistrictSnapshot, String>>>,
    }

    impl ScriptedFetcher {
        fn publish(&self, snapshot: DistrictSnapshot) {
            self.responses
                .lock()
                .unwrap()
                .insert(snapshot.district_id.clone(), Ok(snapshot));
        }

        fn fail(&self, district: &str, message: &str) {
            self.responses
                .lock()
                .unwrap()
                .insert(district.to_string(), Err(message.to_string()));
        }
    }

    #[async_trait::async_trait]
    impl DataFetcher for ScriptedFetcher {
        async fn fetch(
            &self,
            district_id: &str,
            _window: FetchWindow,
        ) -> Result<DistrictSnapshot, FetchError> {
            match self.responses.lock().unwrap().get(district_id) {
                Some(Ok(snapshot)) => Ok(snapshot.clone()),
                Some(Err(message)) => Err(FetchError::Io(std::io::Error::other(message.clone()))),
                None => Err(FetchError::Io(std::io::Error::other("no scripted response"))),
            }
        }
    }

    struct Harness {
        fetcher: Arc<ScriptedFetcher>,
        cache: Arc<InMemoryCacheStore>,
        jobs: Arc<InMemoryJobStore>,
        orchestrator: ReconciliationOrchestrator,
    }

    impl Harness {
        fn new() -> Self {
            let fetcher = Arc::new(ScriptedFetcher::default());
            let cache = Arc::new(InMemoryCacheStore::default());
            let jobs = Arc::new(InMemoryJobStore::default());
            let orchestrator = ReconciliationOrchestrator::new(
                fetcher.clone(),
                cache.clone(),
                jobs.clone(),
            );
            Self {
                fetcher,
                cache,
                jobs,
                orchestrator,
            }
        }

        async fn active_job(&self, config: ReconciliationConfig) -> ReconciliationJob {
            let mut job = ReconciliationJob::new("D101", october(), nov(1), config);
            self.jobs.save(&mut job).await.unwrap();
            job
        }

        async fn seed_cache(&self, snapshot: DistrictSnapshot) {
            self.cache
                .set(&format!("{}:{}", snapshot.district_id, snapshot.target_month), &snapshot)
                .await
                .unwrap();
        }
    }

    fn sample_registry() -> DistrictRegistry {
        DistrictRegistry {
            districts: vec![
                DistrictConfig {
                    district_id: "D101".into(),
                    display_name: "District 101".into(),
                    enabled: true,
                },
                DistrictConfig {
                    district_id: "D102".into(),
                    display_name: "District 102".into(),
                    enabled: true,
                },
                DistrictConfig {
                    district_id: "D103".into(),
                    display_name: "District 103 (paused)".into(),
                    enabled: false,
                },
            ],
        }
    }

    fn scheduler_for(harness: &Harness, registry: DistrictRegistry) -> Arc<ReconciliationScheduler> {
        Arc::new(ReconciliationScheduler::new(
            Arc::new(ReconciliationConfig::default()),
            registry,
            harness.jobs.clone(),
            Arc::new(ReconciliationOrchestrator::new(
                harness.fetcher.clone(),
                harness.cache.clone(),
                harness.jobs.clone(),
            )),
            SchedulerOptions::default(),
        ))
    }

    // -- change detection ---------------------------------------------------

    #[test]
    fn detect_changes_flags_each_moved_metric() {
        let cached = snap("D101", 1, 100, 40, 8);
        let mut current = snap("D101", 2, 105, 40, 9);
        current.payload_sha256 = "other".into();

        let changes = detect_changes(Some(&cached), &current, nov(2));
        assert!(changes.has_changes);
        assert_eq!(changes.changed_fields, vec!["membership", "distinguished_clubs"]);
        assert_eq!(changes.membership.unwrap().absolute, 5);
        assert_eq!(changes.club_count.unwrap().absolute, 0);
        assert_eq!(changes.source_data_date, nov_date(2));
    }

    #[test]
    fn detect_changes_treats_absence_as_change() {
        let cached = snap("D101", 1, 100, 40, 8);
        let mut current = snap("D101", 2, 100, 40, 8);
        current.distinguished_clubs = None;

        let changes = detect_changes(Some(&cached), &current, nov(2));
        assert!(changes.has_changes);
        assert_eq!(changes.changed_fields, vec!["distinguished_clubs"]);
    }

    #[test]
    fn detect_changes_with_empty_cache_is_first_publication() {
        let current = snap("D101", 1, 100, 40, 8);
        let changes = detect_changes(None, &current, nov(1));
        assert!(changes.has_changes);
        assert_eq!(
            changes.changed_fields,
            vec!["membership", "club_count", "distinguished_clubs"]
        );
    }

    #[test]
    fn identical_snapshots_produce_no_changes() {
        let cached = snap("D101", 1, 100, 40, 8);
        let current = snap("D101", 2, 100, 40, 8);
        let changes = detect_changes(Some(&cached), &current, nov(2));
        assert!(!changes.has_changes);
        assert!(changes.changed_fields.is_empty());
    }

    #[test]
    fn significance_is_a_logical_or_across_metrics() {
        let config = ReconciliationConfig {
            membership_change_percent: 5.0,
            club_count_change: 2,
            distinguished_change_percent: 10.0,
            ..ReconciliationConfig::default()
        };

        // Membership moved 1% (below 5%), clubs moved 2 (at threshold).
        let cached = snap("D101", 1, 1000, 40, 10);
        let current = snap("D101", 2, 1010, 42, 10);
        let changes = detect_changes(Some(&cached), &current, nov(2));
        assert!(is_significant_change(&changes, &config));

        // Same membership move alone stays insignificant.
        let current = snap("D101", 2, 1010, 40, 10);
        let changes = detect_changes(Some(&cached), &current, nov(2));
        assert!(!is_significant_change(&changes, &config));
    }

    #[test]
    fn from_zero_movement_is_significant() {
        let cached = snap("D101", 1, 0, 40, 10);
        let current = snap("D101", 2, 50, 40, 10);
        let changes = detect_changes(Some(&cached), &current, nov(2));
        assert!(is_significant_change(&changes, &ReconciliationConfig::default()));
    }

    // -- orchestrator -------------------------------------------------------

    #[tokio::test]
    async fn finalizes_after_three_quiet_days() {
        let h = Harness::new();
        let job = h.active_job(ReconciliationConfig::default()).await;
        h.seed_cache(DistrictSnapshot {
            as_of_date: NaiveDate::from_ymd_opt(2025, 10, 31).unwrap(),
            ..snap("D101", 1, 100, 40, 8)
        })
        .await;

        // Day 1: membership 100 -> 105, significant at the 1% threshold.
        h.fetcher.publish(snap("D101", 1, 105, 40, 8));
        let (job1, outcome) = h.orchestrator.run_cycle(job.id, nov(1)).await.unwrap();
        assert_eq!(
            outcome,
            CycleOutcome::Continue { significant: true, cache_updated: true }
        );
        assert_eq!(job1.current_data_date, Some(nov_date(1)));

        // Days 2-4: source re-publishes unchanged numbers.
        for day in 2..=4 {
            h.fetcher.publish(snap("D101", day, 105, 40, 8));
            h.orchestrator.run_cycle(job.id, nov(day)).await.unwrap();
        }

        let done = h.jobs.load(job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert!(!done.forced_finalization);
        assert_eq!(done.finalized_date, Some(nov_date(4)));
        assert_eq!(done.end_date, Some(nov_date(4)));
        assert_eq!(done.progress.timeline().len(), 4);

        // Cache reflects the last applied change and its as-of date.
        let cached = h.cache.get(&done.cache_key()).await.unwrap().unwrap();
        assert_eq!(cached.membership, Some(105));
        assert_eq!(Some(cached.as_of_date), done.current_data_date);
    }

    #[tokio::test]
    async fn same_day_rerun_records_one_entry() {
        let h = Harness::new();
        let job = h.active_job(ReconciliationConfig::default()).await;
        h.seed_cache(snap("D101", 1, 100, 40, 8)).await;

        // Quiet cycle: no cache update, so the as-of watermark stays unset
        // and the rerun takes the full compare-and-record path again.
        h.fetcher.publish(snap("D101", 1, 100, 40, 8));
        h.orchestrator.run_cycle(job.id, nov(1)).await.unwrap();
        let (job2, _) = h.orchestrator.run_cycle(job.id, nov(1)).await.unwrap();

        assert_eq!(job2.progress.timeline().len(), 1);
        assert_eq!(job2.progress.timeline()[0].date, nov_date(1));
    }

    #[tokio::test]
    async fn stale_as_of_date_skips_recording() {
        let h = Harness::new();
        let job = h.active_job(ReconciliationConfig::default()).await;
        h.seed_cache(snap("D101", 1, 100, 40, 8)).await;

        h.fetcher.publish(snap("D101", 1, 105, 40, 8));
        h.orchestrator.run_cycle(job.id, nov(1)).await.unwrap();

        // Next day the source still serves the Nov 1 publication, even with
        // different numbers; nothing is recorded until as-of advances.
        h.fetcher.publish(snap("D101", 1, 999, 40, 8));
        let (job2, outcome) = h.orchestrator.run_cycle(job.id, nov(2)).await.unwrap();
        assert_eq!(outcome, CycleOutcome::SourceNotAdvanced);
        assert_eq!(job2.progress.timeline().len(), 1);
        assert_eq!(job2.current_data_date, Some(nov_date(1)));

        let cached = h.cache.get(&job2.cache_key()).await.unwrap().unwrap();
        assert_eq!(cached.membership, Some(105));
    }

    #[tokio::test]
    async fn fetch_failure_is_never_terminal() {
        let h = Harness::new();
        let job = h.active_job(ReconciliationConfig::default()).await;
        h.fetcher.fail("D101", "connection refused");

        for day in 1..=3 {
            let (job_after, outcome) = h.orchestrator.run_cycle(job.id, nov(day)).await.unwrap();
            assert_eq!(outcome, CycleOutcome::FetchFailed);
            assert_eq!(job_after.status, JobStatus::Active);
            assert_eq!(job_after.fetch_failures, day);
        }

        let stored = h.jobs.load(job.id).await.unwrap().unwrap();
        assert!(stored.progress.timeline().is_empty());
        assert!(stored.last_error.as_deref().unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn successful_cycle_clears_failure_streak() {
        let h = Harness::new();
        let job = h.active_job(ReconciliationConfig::default()).await;

        h.fetcher.fail("D101", "503");
        h.orchestrator.run_cycle(job.id, nov(1)).await.unwrap();
        h.fetcher.publish(snap("D101", 2, 105, 40, 8));
        let (job2, _) = h.orchestrator.run_cycle(job.id, nov(2)).await.unwrap();

        assert_eq!(job2.fetch_failures, 0);
        assert_eq!(job2.last_error, None);
    }

    #[tokio::test]
    async fn window_expiry_forces_finalization_without_stability() {
        let h = Harness::new();
        let config = ReconciliationConfig {
            max_reconciliation_days: 2,
            auto_extension_enabled: false,
            ..ReconciliationConfig::default()
        };
        let job = h.active_job(config).await;
        h.seed_cache(snap("D101", 1, 100, 40, 8)).await;

        h.fetcher.publish(snap("D101", 1, 105, 40, 8));
        h.orchestrator.run_cycle(job.id, nov(1)).await.unwrap();
        h.fetcher.publish(snap("D101", 3, 110, 40, 8));
        let (done, outcome) = h.orchestrator.run_cycle(job.id, nov(3)).await.unwrap();

        assert_eq!(outcome, CycleOutcome::Completed { forced: true });
        assert_eq!(done.status, JobStatus::Completed);
        assert!(done.forced_finalization);
        // Best-available data still landed in the cache.
        let cached = h.cache.get(&done.cache_key()).await.unwrap().unwrap();
        assert_eq!(cached.membership, Some(110));
    }

    #[tokio::test]
    async fn late_change_extends_window_instead_of_forcing() {
        let h = Harness::new();
        let config = ReconciliationConfig {
            max_reconciliation_days: 3,
            ..ReconciliationConfig::default()
        };
        let job = h.active_job(config.clone()).await;
        h.seed_cache(snap("D101", 1, 100, 40, 8)).await;

        h.fetcher.publish(snap("D101", 1, 105, 40, 8));
        h.orchestrator.run_cycle(job.id, nov(1)).await.unwrap();
        for day in 2..=3 {
            h.fetcher.publish(snap("D101", day, 105, 40, 8));
            h.orchestrator.run_cycle(job.id, nov(day)).await.unwrap();
        }

        // Max end date (day 4) arrives together with a fresh revision.
        h.fetcher.publish(snap("D101", 4, 112, 40, 8));
        let (extended, outcome) = h.orchestrator.run_cycle(job.id, nov(4)).await.unwrap();
        assert_eq!(outcome, CycleOutcome::Extended);
        assert_eq!(extended.status, JobStatus::Active);
        assert_eq!(extended.extensions_granted, 1);
        assert_eq!(extended.max_end_date, nov_date(9));

        // Quiet days inside the extension finalize normally.
        for day in 5..=7 {
            h.fetcher.publish(snap("D101", day, 112, 40, 8));
            h.orchestrator.run_cycle(job.id, nov(day)).await.unwrap();
        }
        let done = h.jobs.load(job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert!(!done.forced_finalization);
        assert_eq!(done.finalized_date, Some(nov_date(7)));

        // Bounded lifetime: finalization within start + window + extensions.
        let bound = done.start_date
            + chrono::Duration::days(
                config.max_reconciliation_days
                    + i64::from(done.extensions_granted) * config.max_extension_days,
            );
        assert!(done.finalized_date.unwrap() <= bound);
    }

    #[tokio::test]
    async fn extension_cap_forces_finalization() {
        let h = Harness::new();
        let config = ReconciliationConfig {
            max_reconciliation_days: 2,
            max_extensions: 0,
            ..ReconciliationConfig::default()
        };
        let job = h.active_job(config).await;
        h.seed_cache(snap("D101", 1, 100, 40, 8)).await;

        h.fetcher.publish(snap("D101", 1, 105, 40, 8));
        h.orchestrator.run_cycle(job.id, nov(1)).await.unwrap();
        h.fetcher.publish(snap("D101", 3, 110, 40, 8));
        let (done, outcome) = h.orchestrator.run_cycle(job.id, nov(3)).await.unwrap();

        // Recent significant change, but no extensions left to grant.
        assert_eq!(outcome, CycleOutcome::Completed { forced: true });
        assert_eq!(done.extensions_granted, 0);
    }

    #[tokio::test]
    async fn cancelled_job_skips_cycles() {
        let h = Harness::new();
        let job = h.active_job(ReconciliationConfig::default()).await;
        let service = ReconciliationService::new(
            h.jobs.clone(),
            Arc::new(ReconciliationConfig::default()),
        );

        let cancelled = service.cancel_reconciliation(job.id, nov(2)).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);

        h.fetcher.publish(snap("D101", 2, 105, 40, 8));
        let (after, outcome) = h.orchestrator.run_cycle(job.id, nov(2)).await.unwrap();
        assert_eq!(outcome, CycleOutcome::AlreadyTerminal);
        assert_eq!(after.status, JobStatus::Cancelled);
        assert!(h.cache.get(&after.cache_key()).await.unwrap().is_none());

        // Cancelling again is a no-op.
        let again = service.cancel_reconciliation(job.id, nov(3)).await.unwrap();
        assert_eq!(again.status, JobStatus::Cancelled);
    }

    // -- scheduler ----------------------------------------------------------

    #[tokio::test]
    async fn month_boundary_creates_one_job_per_enabled_district() {
        let h = Harness::new();
        let scheduler = scheduler_for(&h, sample_registry());
        h.fetcher.publish(snap("D101", 1, 100, 40, 8));
        h.fetcher.publish(snap("D102", 1, 200, 50, 9));

        // Nov 1: yesterday was Oct 31, the month boundary.
        let summary = scheduler.tick(nov(1)).await.unwrap();
        assert_eq!(summary.jobs_created, 2);
        assert_eq!(summary.cycles_dispatched, 2);

        // Same tick again: jobs already exist, nothing new created, and the
        // 24h frequency means no cycle is due yet.
        let summary = scheduler.tick(nov(1)).await.unwrap();
        assert_eq!(summary.jobs_created, 0);
        assert_eq!(summary.cycles_dispatched, 0);

        let active = h.jobs.list_active().await.unwrap();
        assert_eq!(active.len(), 2);
        assert!(active.iter().all(|j| j.target_month == october()));
    }

    #[tokio::test]
    async fn mid_month_tick_creates_no_jobs() {
        let h = Harness::new();
        let scheduler = scheduler_for(&h, sample_registry());
        let summary = scheduler.tick(nov(15)).await.unwrap();
        assert_eq!(summary.jobs_created, 0);
    }

    #[tokio::test]
    async fn pending_check_follows_configured_frequency() {
        let h = Harness::new();
        let scheduler = scheduler_for(&h, sample_registry());
        h.fetcher.publish(snap("D101", 1, 100, 40, 8));
        h.fetcher.publish(snap("D102", 1, 200, 50, 9));
        scheduler.tick(nov(1)).await.unwrap();

        assert!(scheduler.check_pending_reconciliations(nov(1)).await.is_empty());
        assert_eq!(scheduler.check_pending_reconciliations(nov(2)).await.len(), 2);
    }

    #[tokio::test]
    async fn concurrent_jobs_do_not_interfere() {
        let h = Harness::new();
        let scheduler = scheduler_for(&h, sample_registry());
        h.fetcher.publish(snap("D101", 1, 100, 40, 8));
        h.fetcher.publish(snap("D102", 1, 200, 50, 9));

        scheduler.tick(nov(1)).await.unwrap();

        let d101 = h.cache.get("D101:2025-10").await.unwrap().unwrap();
        let d102 = h.cache.get("D102:2025-10").await.unwrap().unwrap();
        assert_eq!(d101.membership, Some(100));
        assert_eq!(d102.membership, Some(200));

        let active = h.jobs.list_active().await.unwrap();
        let d101_job = active.iter().find(|j| j.district_id == "D101").unwrap();
        let d102_job = active.iter().find(|j| j.district_id == "D102").unwrap();
        assert_ne!(d101_job.id, d102_job.id);
        assert_eq!(d101_job.progress.timeline().len(), 1);
        assert_eq!(d102_job.progress.timeline().len(), 1);
    }

    #[tokio::test]
    async fn restart_recovers_active_jobs_from_store() {
        let h = Harness::new();
        let mut job = ReconciliationJob::new(
            "D101",
            october(),
            nov(1),
            ReconciliationConfig::default(),
        );
        h.jobs.save(&mut job).await.unwrap();

        // Fresh scheduler instance with an empty working set.
        let scheduler = scheduler_for(&h, sample_registry());
        h.fetcher.publish(snap("D101", 2, 105, 40, 8));
        let summary = scheduler.tick(nov(2)).await.unwrap();
        assert_eq!(summary.cycles_dispatched, 1);

        let resumed = h.jobs.load(job.id).await.unwrap().unwrap();
        assert_eq!(resumed.progress.timeline().len(), 1);
    }

    struct PanicOnceFetcher {
        tripped: std::sync::atomic::AtomicBool,
        snapshot: DistrictSnapshot,
    }

    #[async_trait::async_trait]
    impl DataFetcher for PanicOnceFetcher {
        async fn fetch(
            &self,
            _district_id: &str,
            _window: FetchWindow,
        ) -> Result<DistrictSnapshot, FetchError> {
            if !self.tripped.swap(true, std::sync::atomic::Ordering::SeqCst) {
                panic!("payload decoder blew up");
            }
            Ok(self.snapshot.clone())
        }
    }

    #[tokio::test]
    async fn panicked_cycle_does_not_wedge_the_job() {
        let fetcher = Arc::new(PanicOnceFetcher {
            tripped: Default::default(),
            snapshot: snap("D101", 3, 105, 40, 8),
        });
        let cache = Arc::new(InMemoryCacheStore::default());
        let jobs = Arc::new(InMemoryJobStore::default());
        let mut job = ReconciliationJob::new(
            "D101",
            october(),
            nov(1),
            ReconciliationConfig::default(),
        );
        jobs.save(&mut job).await.unwrap();

        let registry = DistrictRegistry {
            districts: vec![DistrictConfig {
                district_id: "D101".into(),
                display_name: "District 101".into(),
                enabled: true,
            }],
        };
        let scheduler = ReconciliationScheduler::new(
            Arc::new(ReconciliationConfig::default()),
            registry,
            jobs.clone(),
            Arc::new(ReconciliationOrchestrator::new(fetcher, cache, jobs.clone())),
            SchedulerOptions::default(),
        );

        let summary = scheduler.tick(nov(2)).await.unwrap();
        assert_eq!(summary.cycles_dispatched, 1);
        assert_eq!(summary.cycle_failures, 1);

        // The crashed worker persisted nothing, and its job must not be
        // left marked in flight: the next tick dispatches it again.
        let summary = scheduler.tick(nov(3)).await.unwrap();
        assert_eq!(summary.ticks_dropped, 0);
        assert_eq!(summary.cycles_dispatched, 1);
        assert_eq!(summary.cycle_failures, 0);

        let recovered = jobs.load(job.id).await.unwrap().unwrap();
        assert_eq!(recovered.progress.timeline().len(), 1);
    }

    #[tokio::test]
    async fn terminal_jobs_retire_after_retention() {
        let h = Harness::new();
        let registry = DistrictRegistry {
            districts: vec![DistrictConfig {
                district_id: "D101".into(),
                display_name: "District 101".into(),
                enabled: true,
            }],
        };
        let config = ReconciliationConfig {
            max_reconciliation_days: 1,
            auto_extension_enabled: false,
            ..ReconciliationConfig::default()
        };
        let scheduler = Arc::new(ReconciliationScheduler::new(
            Arc::new(config),
            registry,
            h.jobs.clone(),
            Arc::new(ReconciliationOrchestrator::new(
                h.fetcher.clone(),
                h.cache.clone(),
                h.jobs.clone(),
            )),
            SchedulerOptions {
                worker_concurrency: 2,
                retention_days: 30,
            },
        ));

        h.fetcher.publish(snap("D101", 1, 100, 40, 8));
        scheduler.tick(nov(1)).await.unwrap();
        h.fetcher.publish(snap("D101", 2, 100, 40, 8));
        let summary = scheduler.tick(nov(2)).await.unwrap();
        assert_eq!(summary.jobs_retired, 0);

        let job_id = {
            let active = h.jobs.list_active().await.unwrap();
            assert!(active.is_empty(), "job should have force-finalized at its window");
            h.jobs
                .find_for_month("D101", october())
                .await
                .unwrap()
                .unwrap()
                .id
        };

        // Retention elapses; the working set drops the job but the durable
        // record survives.
        let later = Utc.with_ymd_and_hms(2025, 12, 15, 6, 0, 0).single().unwrap();
        let summary = scheduler.tick(later).await.unwrap();
        assert_eq!(summary.jobs_retired, 1);
        assert!(h.jobs.load(job_id).await.unwrap().is_some());
    }

    // -- service facade -----------------------------------------------------

    #[tokio::test]
    async fn service_schedules_and_reports() {
        let h = Harness::new();
        let service = ReconciliationService::new(
            h.jobs.clone(),
            Arc::new(ReconciliationConfig::default()),
        );
        let month_end = NaiveDate::from_ymd_opt(2025, 10, 31).unwrap();

        let job = service
            .schedule_month_end_reconciliation("D101", month_end, nov(1))
            .await
            .unwrap();
        assert_eq!(job.target_month, october());

        // Re-scheduling while active returns the live job.
        let same = service
            .schedule_month_end_reconciliation("D101", month_end, nov(1))
            .await
            .unwrap();
        assert_eq!(same.id, job.id);

        // Not enough history for an estimate yet.
        assert_eq!(service.estimate_completion(job.id).await.unwrap(), None);

        h.fetcher.publish(snap("D101", 1, 105, 40, 8));
        h.orchestrator.run_cycle(job.id, nov(1)).await.unwrap();
        h.fetcher.publish(snap("D101", 2, 105, 40, 8));
        h.orchestrator.run_cycle(job.id, nov(2)).await.unwrap();

        // Last significant change Nov 1 + 3-day stability window.
        assert_eq!(
            service.estimate_completion(job.id).await.unwrap(),
            Some(nov_date(4))
        );
        let timeline = service.get_reconciliation_timeline(job.id).await.unwrap();
        assert_eq!(timeline.len(), 2);
        assert!(timeline[0].is_significant);
        assert!(!timeline[1].is_significant);

        let missing = service.get_reconciliation_job(Uuid::new_v4()).await;
        assert!(matches!(missing, Err(ServiceError::NotFound(_))));
    }

    #[tokio::test]
    async fn completed_jobs_are_not_reopened_by_rescheduling() {
        let h = Harness::new();
        let service = ReconciliationService::new(
            h.jobs.clone(),
            Arc::new(ReconciliationConfig::default()),
        );
        let month_end = NaiveDate::from_ymd_opt(2025, 10, 31).unwrap();

        let first = service
            .schedule_month_end_reconciliation("D101", month_end, nov(1))
            .await
            .unwrap();
        service.cancel_reconciliation(first.id, nov(2)).await.unwrap();

        let second = service
            .schedule_month_end_reconciliation("D101", month_end, nov(20))
            .await
            .unwrap();
        assert_ne!(second.id, first.id);
        assert_eq!(second.status, JobStatus::Active);
        assert_eq!(service.estimate_completion(first.id).await.unwrap(), None);
    }

    #[test]
    fn registry_yaml_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("districts.yaml");
        std::fs::write(
            &path,
            "districts:\n  - district_id: D101\n    display_name: District 101\n    enabled: true\n  - district_id: D102\n    display_name: District 102\n    enabled: false\n",
        )
        .unwrap();

        let registry = DistrictRegistry::load(&path).unwrap();
        assert_eq!(registry.districts.len(), 2);
        assert_eq!(registry.enabled().count(), 1);
    }

    #[test]
    fn invalid_reconciliation_config_is_rejected_at_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("reconciliation.yaml");
        std::fs::write(&path, "stability_period_days: 0\n").unwrap();
        assert!(load_reconciliation_config(Some(&path)).is_err());

        std::fs::write(&path, "stability_period_days: 4\nmax_extensions: 1\n").unwrap();
        let config = load_reconciliation_config(Some(&path)).unwrap();
        assert_eq!(config.stability_period_days, 4);
        assert_eq!(config.max_extensions, 1);
        assert_eq!(config.max_reconciliation_days, 15);
    }
}
