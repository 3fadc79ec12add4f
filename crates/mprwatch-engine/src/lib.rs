//! Orchestration for mprwatch: run tracking, alerting, backfill jobs,
//! quote refresh, and the polling scheduler.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveTime, Utc, Weekday};
use mprwatch_core::{
    BackfillJob, CostEstimate, ErrorKind, EventType, JobStatus, LogEvent, MarketQuote, Report, Run,
    RunState,
};
use mprwatch_feeds::{
    AlertNotifier, BulletinSource, FeedError, FetchOutcome, MarketDataSource, ParsedBulletin,
    ReportDefinition, ReportRegistry, SymbolUniverse, TestAlertReceipt,
};
use mprwatch_storage::{payload_hash, Warehouse};
use serde::Serialize;
use serde_json::json;
use tokio::sync::{Mutex, Semaphore};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "mprwatch-engine";

/// Local trading window for quote refresh ticks.
const QUOTE_WINDOW_START: (u32, u32) = (8, 20);
const QUOTE_WINDOW_END: (u32, u32) = (13, 30);

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Consecutive failures at which a notification fires.
    pub alert_threshold: u32,
    /// Transient fetch retries before a run is recorded failed.
    pub attempt_ceiling: usize,
    pub poll_tick_seconds: u64,
    pub max_concurrency: usize,
    pub backfill_workers: usize,
    pub http_timeout_secs: u64,
    /// Market local time relative to UTC; bulletin cycles roll over at this
    /// offset's midnight.
    pub utc_offset_hours: i32,
    pub master_alert_email: String,
    pub quote_refresh_seconds: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            alert_threshold: 3,
            attempt_ceiling: 3,
            poll_tick_seconds: 60,
            max_concurrency: 4,
            backfill_workers: 8,
            http_timeout_secs: 20,
            utc_offset_hours: -6,
            master_alert_email: "alerts@example.com".to_string(),
            quote_refresh_seconds: 300,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            alert_threshold: env_parsed("MPRWATCH_ALERT_THRESHOLD", defaults.alert_threshold),
            attempt_ceiling: env_parsed("MPRWATCH_ATTEMPT_CEILING", defaults.attempt_ceiling),
            poll_tick_seconds: env_parsed("MPRWATCH_POLL_TICK_SECONDS", defaults.poll_tick_seconds),
            max_concurrency: env_parsed("MPRWATCH_MAX_CONCURRENCY", defaults.max_concurrency),
            backfill_workers: env_parsed("MPRWATCH_BACKFILL_WORKERS", defaults.backfill_workers),
            http_timeout_secs: env_parsed("MPRWATCH_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            utc_offset_hours: env_parsed("MPRWATCH_UTC_OFFSET_HOURS", defaults.utc_offset_hours),
            master_alert_email: std::env::var("MPRWATCH_MASTER_ALERT_EMAIL")
                .unwrap_or(defaults.master_alert_email),
            quote_refresh_seconds: env_parsed(
                "MPRWATCH_QUOTE_REFRESH_SECONDS",
                defaults.quote_refresh_seconds,
            ),
        }
    }

    pub fn local_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_hours * 3600)
            .unwrap_or_else(|| FixedOffset::east_opt(0).expect("zero offset is valid"))
    }

    pub fn local_today(&self) -> NaiveDate {
        Utc::now().with_timezone(&self.local_offset()).date_naive()
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// ---------------------------------------------------------------------------
// Alert engine

/// Drives the per-report consecutive-failure counter and decides when to ask
/// the delivery collaborator to notify.
pub struct AlertEngine {
    warehouse: Arc<Warehouse>,
    notifier: Arc<dyn AlertNotifier>,
    threshold: u32,
}

impl AlertEngine {
    pub fn new(warehouse: Arc<Warehouse>, notifier: Arc<dyn AlertNotifier>, threshold: u32) -> Self {
        Self {
            warehouse,
            notifier,
            threshold: threshold.max(1),
        }
    }

    pub async fn record_outcome(&self, report_id: &str, succeeded: bool) {
        if succeeded {
            self.warehouse.alerts.record_success(report_id).await;
            return;
        }
        let state = self.warehouse.alerts.record_failure(report_id).await;
        // Notify on the transition onto the threshold and nowhere else:
        // failure N+1 of the same streak stays quiet, the reset on success
        // re-arms the crossing.
        if state.consecutive_failures == self.threshold {
            if let Err(err) = self
                .notifier
                .send_alert(report_id, state.consecutive_failures)
                .await
            {
                warn!(report_id, error = %err, "alert delivery failed");
            }
        }
    }

    pub async fn list(&self) -> Vec<mprwatch_core::AlertState> {
        self.warehouse.alerts.list().await
    }

    pub async fn send_test_alert(&self) -> Result<TestAlertReceipt, FeedError> {
        self.notifier.send_test_alert().await
    }
}

// ---------------------------------------------------------------------------
// Run tracker

#[derive(Debug, Clone)]
pub enum StartedRun {
    Started(Run),
    /// A run for this cycle is already in flight; the caller observes it
    /// instead of racing to create a duplicate.
    AlreadyRunning(Run),
}

impl StartedRun {
    pub fn run(&self) -> &Run {
        match self {
            StartedRun::Started(run) | StartedRun::AlreadyRunning(run) => run,
        }
    }
}

#[derive(Debug)]
pub enum RunOutcome {
    Success(ParsedBulletin),
    Failed { kind: ErrorKind, message: String },
    Waiting,
}

#[derive(Debug, Clone, Copy)]
struct CycleState {
    cycle_date: NaiveDate,
    attempts_used: u32,
    in_flight: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GatherSummary {
    pub inserted: usize,
    pub skipped: usize,
}

/// Owns the Run/Version lifecycle for every report: one in-flight run per
/// report cycle, attempt numbering, version registration, and the event +
/// alert side effects of every transition.
pub struct RunTracker {
    warehouse: Arc<Warehouse>,
    alerts: Arc<AlertEngine>,
    source: Arc<dyn BulletinSource>,
    offset: FixedOffset,
    cycles: Mutex<HashMap<String, CycleState>>,
    cancels: Mutex<HashMap<Uuid, Arc<AtomicBool>>>,
}

impl RunTracker {
    pub fn new(
        warehouse: Arc<Warehouse>,
        alerts: Arc<AlertEngine>,
        source: Arc<dyn BulletinSource>,
        offset: FixedOffset,
    ) -> Self {
        Self {
            warehouse,
            alerts,
            source,
            offset,
            cycles: Mutex::new(HashMap::new()),
            cancels: Mutex::new(HashMap::new()),
        }
    }

    fn local_today(&self) -> NaiveDate {
        Utc::now().with_timezone(&self.offset).date_naive()
    }

    async fn definition(&self, report_id: &str) -> Result<ReportDefinition> {
        let config = self
            .warehouse
            .catalog
            .config(report_id)
            .await
            .with_context(|| format!("loading config for {report_id}"))?;
        ReportDefinition::from_config_json(config)
            .with_context(|| format!("stored config for {report_id} has an invalid shape"))
    }

    /// Create the cycle's next run, or observe the one already running.
    pub async fn start_run(&self, report_id: &str) -> Result<StartedRun> {
        let today = self.local_today();
        let mut cycles = self.cycles.lock().await;
        let state = cycles.entry(report_id.to_string()).or_insert(CycleState {
            cycle_date: today,
            attempts_used: 0,
            in_flight: None,
        });
        if state.cycle_date != today {
            // new business day, new cycle; the in-flight guard survives so a
            // run straddling midnight cannot be duplicated
            state.cycle_date = today;
            state.attempts_used = 0;
        }

        if let Some(run_id) = state.in_flight {
            if let Some(existing) = self.warehouse.runs.get(run_id).await {
                if existing.state == RunState::Running {
                    return Ok(StartedRun::AlreadyRunning(existing));
                }
            }
            state.in_flight = None;
        }

        // Waiting outcomes are attempt-neutral (the source simply has not
        // published yet), so only prior Success/Failed runs in this cycle
        // consume attempt numbers.
        let attempt = state.attempts_used + 1;
        let run = self.warehouse.runs.insert(Run::new(report_id, attempt)).await;
        let run = self
            .warehouse
            .runs
            .update(run.id, |r| r.state = RunState::Running)
            .await?;
        state.in_flight = Some(run.id);
        drop(cycles);

        self.warehouse
            .events
            .append(LogEvent::for_run(
                run.id,
                report_id,
                EventType::RunStarted,
                format!("attempt {attempt} started"),
                json!({ "attempt": attempt }),
            ))
            .await;
        Ok(StartedRun::Started(run))
    }

    /// Apply a terminal (or waiting) outcome to an in-flight run, with the
    /// version/event/alert side effects the transition requires.
    pub async fn complete_run(&self, run_id: Uuid, outcome: RunOutcome) -> Result<Run> {
        let run = self
            .warehouse
            .runs
            .get(run_id)
            .await
            .with_context(|| format!("run {run_id} not found"))?;
        let report_id = run.report_id.clone();

        match outcome {
            RunOutcome::Success(bulletin) => {
                let hash = payload_hash(&bulletin.payloads);
                let registered = self
                    .warehouse
                    .versions
                    .register(
                        &report_id,
                        bulletin.report_date,
                        &hash,
                        bulletin.parsed_fields.clone(),
                        bulletin.source_urls.clone(),
                    )
                    .await;

                let registered = match registered {
                    Ok(registered) => registered,
                    Err(err) => {
                        // A successful fetch must never be dropped silently:
                        // record the storage failure on the run and surface
                        // the error to the caller.
                        let message = err.to_string();
                        let _ = self
                            .warehouse
                            .runs
                            .update(run_id, |r| {
                                r.state = RunState::Failed;
                                r.report_date = Some(bulletin.report_date);
                                r.run_finished_at = Some(Utc::now());
                                r.error_type = Some(ErrorKind::Storage);
                                r.error_message = Some(message.clone());
                            })
                            .await;
                        self.finish_cycle(&report_id, run_id, true).await;
                        self.append_run_event(
                            run_id,
                            &report_id,
                            EventType::Error,
                            &message,
                            json!({ "error_type": ErrorKind::Storage.as_str() }),
                        )
                        .await;
                        self.alerts.record_outcome(&report_id, false).await;
                        return Err(err).context("registering version");
                    }
                };

                let run = self
                    .warehouse
                    .runs
                    .update(run_id, |r| {
                        r.state = RunState::Success;
                        r.report_date = Some(bulletin.report_date);
                        r.run_finished_at = Some(Utc::now());
                        r.payload_hash = Some(hash.clone());
                    })
                    .await?;
                self.finish_cycle(&report_id, run_id, true).await;
                self.append_run_event(
                    run_id,
                    &report_id,
                    EventType::Published,
                    if registered.created {
                        "published new version"
                    } else {
                        "published, content unchanged"
                    },
                    json!({
                        "payload_hash": hash,
                        "created": registered.created,
                        "report_date": bulletin.report_date.to_string(),
                    }),
                )
                .await;
                self.alerts.record_outcome(&report_id, true).await;
                info!(%report_id, created = registered.created, "run succeeded");
                Ok(run)
            }
            RunOutcome::Failed { kind, message } => {
                let run = self
                    .warehouse
                    .runs
                    .update(run_id, |r| {
                        r.state = RunState::Failed;
                        r.run_finished_at = Some(Utc::now());
                        r.error_type = Some(kind);
                        r.error_message = Some(message.clone());
                    })
                    .await?;
                self.finish_cycle(&report_id, run_id, true).await;
                self.append_run_event(
                    run_id,
                    &report_id,
                    EventType::Error,
                    &message,
                    json!({ "error_type": kind.as_str() }),
                )
                .await;
                self.alerts.record_outcome(&report_id, false).await;
                Ok(run)
            }
            RunOutcome::Waiting => {
                // not a failure: no finish timestamp, no alert counting, and
                // the cycle's attempt counter is left untouched
                let run = self
                    .warehouse
                    .runs
                    .update(run_id, |r| r.state = RunState::Waiting)
                    .await?;
                self.finish_cycle(&report_id, run_id, false).await;
                self.append_run_event(
                    run_id,
                    &report_id,
                    EventType::WaitingForSource,
                    "source has not published yet",
                    json!({}),
                )
                .await;
                Ok(run)
            }
        }
    }

    async fn finish_cycle(&self, report_id: &str, run_id: Uuid, consume_attempt: bool) {
        let mut cycles = self.cycles.lock().await;
        if let Some(state) = cycles.get_mut(report_id) {
            if state.in_flight == Some(run_id) {
                state.in_flight = None;
            }
            if consume_attempt {
                state.attempts_used += 1;
            }
        }
    }

    async fn append_run_event(
        &self,
        run_id: Uuid,
        report_id: &str,
        event_type: EventType,
        message: &str,
        data: serde_json::Value,
    ) {
        self.warehouse
            .events
            .append(LogEvent::for_run(run_id, report_id, event_type, message, data))
            .await;
    }

    /// One full fetch cycle: start (or observe) the run, fetch, classify,
    /// complete. Transient retries already happened inside the source's
    /// client by the time an error surfaces here.
    pub async fn execute_cycle(&self, report_id: &str) -> Result<Run> {
        let definition = self.definition(report_id).await?;
        let started = self.start_run(report_id).await?;
        let run = match started {
            StartedRun::AlreadyRunning(run) => return Ok(run),
            StartedRun::Started(run) => run,
        };

        let cancel = Arc::new(AtomicBool::new(false));
        self.cancels.lock().await.insert(run.id, cancel.clone());

        let outcome = if cancel.load(Ordering::SeqCst) {
            RunOutcome::Failed {
                kind: ErrorKind::Cancelled,
                message: "cancelled by operator".to_string(),
            }
        } else {
            match self.source.fetch_current(&definition, self.local_today()).await {
                Ok(FetchOutcome::Published(bulletin)) => RunOutcome::Success(bulletin),
                Ok(FetchOutcome::NotPublished) => RunOutcome::Waiting,
                Err(err) => RunOutcome::Failed {
                    kind: err.kind(),
                    message: err.message().to_string(),
                },
            }
        };

        let result = self.complete_run(run.id, outcome).await;
        self.cancels.lock().await.remove(&run.id);
        result
    }

    /// Cooperative cancel: the fetch already in progress finishes and records
    /// its own outcome; only work not yet started is skipped.
    pub async fn cancel_run(&self, run_id: Uuid) -> bool {
        let cancels = self.cancels.lock().await;
        match cancels.get(&run_id) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Bulk historical ingest over a date range, through the same dedup path
    /// as live runs. Returns how many versions were new vs. already known.
    pub async fn gather_range(
        &self,
        report_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<GatherSummary> {
        let definition = self.definition(report_id).await?;
        let bulletins = self
            .source
            .fetch_range(&definition, start, end)
            .await
            .map_err(|err| anyhow::anyhow!("range fetch failed: {err}"))?;

        let mut summary = GatherSummary {
            inserted: 0,
            skipped: 0,
        };
        for bulletin in bulletins {
            let hash = payload_hash(&bulletin.payloads);
            let registered = self
                .warehouse
                .versions
                .register(
                    report_id,
                    bulletin.report_date,
                    &hash,
                    bulletin.parsed_fields,
                    bulletin.source_urls,
                )
                .await
                .context("registering gathered version")?;
            if registered.created {
                summary.inserted += 1;
            } else {
                summary.skipped += 1;
            }
        }
        Ok(summary)
    }

    pub async fn report_ids(&self) -> Vec<String> {
        self.warehouse
            .catalog
            .list()
            .await
            .into_iter()
            .map(|r| r.report_id)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Backfill manager

pub fn business_days(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    let mut days = Vec::new();
    let mut day = start;
    while day <= end {
        if !matches!(day.weekday(), Weekday::Sat | Weekday::Sun) {
            days.push(day);
        }
        match day.succ_opt() {
            Some(next) => day = next,
            None => break,
        }
    }
    days
}

/// Schedules and tracks bulk historical retrieval. Sub-fetches fan out per
/// symbol under a bounded worker pool; a job's terminal status is a pure
/// function of the per-symbol tally.
pub struct BackfillManager {
    warehouse: Arc<Warehouse>,
    source: Arc<dyn MarketDataSource>,
    workers: usize,
    cancels: Mutex<HashMap<Uuid, Arc<AtomicBool>>>,
    handles: Mutex<HashMap<Uuid, tokio::task::JoinHandle<()>>>,
}

impl BackfillManager {
    pub fn new(warehouse: Arc<Warehouse>, source: Arc<dyn MarketDataSource>, workers: usize) -> Self {
        Self {
            warehouse,
            source,
            workers: workers.max(1),
            cancels: Mutex::new(HashMap::new()),
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Pure, side-effect-free projection from the symbol universe, the date
    /// span's business days, and the vendor's per-symbol-day rate.
    pub fn estimate_cost(&self, universe: &[String], start: NaiveDate, end: NaiveDate) -> CostEstimate {
        let days = business_days(start, end).len();
        CostEstimate {
            estimated_cost: self.source.rate_per_symbol_day()
                * universe.len() as f64
                * days as f64,
            symbol_count: universe.len(),
        }
    }

    pub async fn run_backfill(
        self: &Arc<Self>,
        symbols: Vec<String>,
        start: NaiveDate,
        end: NaiveDate,
    ) -> BackfillJob {
        let job = self
            .warehouse
            .jobs
            .insert(BackfillJob::queued(symbols, start, end))
            .await;
        self.warehouse
            .events
            .append(LogEvent::for_job(
                EventType::JobQueued,
                format!("backfill queued over {} symbols", job.symbols.len()),
                json!({
                    "job_id": job.job_id,
                    "symbol_count": job.symbols.len(),
                    "start_date": job.start_date.to_string(),
                    "end_date": job.end_date.to_string(),
                }),
            ))
            .await;

        let cancel = Arc::new(AtomicBool::new(false));
        self.cancels.lock().await.insert(job.job_id, cancel.clone());

        let this = self.clone();
        let job_id = job.job_id;
        let handle = tokio::spawn(async move {
            this.execute_job(job_id, cancel).await;
        });
        self.handles.lock().await.insert(job_id, handle);
        job
    }

    /// Dry-run rehearsal: the identical execution path, narrowed to exactly
    /// two symbols.
    pub async fn run_test_backfill(
        self: &Arc<Self>,
        universe: &[String],
        start: NaiveDate,
        end: NaiveDate,
    ) -> BackfillJob {
        let symbols: Vec<String> = universe.iter().take(2).cloned().collect();
        self.run_backfill(symbols, start, end).await
    }

    async fn execute_job(self: Arc<Self>, job_id: Uuid, cancel: Arc<AtomicBool>) {
        let Some(job) = self.warehouse.jobs.get(job_id).await else {
            return;
        };
        if self
            .warehouse
            .jobs
            .update(job_id, |j| j.status = JobStatus::Running)
            .await
            .is_err()
        {
            return;
        }

        let days = Arc::new(business_days(job.start_date, job.end_date));
        let pool = Arc::new(Semaphore::new(self.workers));
        let last_error: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let mut handles = Vec::with_capacity(job.symbols.len());

        for symbol in job.symbols.clone() {
            // cooperative cancellation: nothing new starts after the flag
            // flips, in-flight symbols run to completion below
            if cancel.load(Ordering::SeqCst) {
                break;
            }
            let permit = pool
                .clone()
                .acquire_owned()
                .await
                .expect("semaphore not closed");
            if cancel.load(Ordering::SeqCst) {
                break;
            }
            let this = self.clone();
            let days = days.clone();
            let last_error = last_error.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                match this.fetch_symbol(&symbol, &days).await {
                    Ok(bars) => {
                        info!(%symbol, bars, "backfill symbol complete");
                        true
                    }
                    Err(err) => {
                        warn!(%symbol, error = %err, "backfill symbol failed");
                        *last_error.lock().await = Some(format!("{symbol}: {}", err.message()));
                        false
                    }
                }
            }));
        }

        let mut succeeded = 0usize;
        let mut failed = 0usize;
        for handle in handles {
            match handle.await {
                Ok(true) => succeeded += 1,
                Ok(false) => failed += 1,
                Err(err) => {
                    failed += 1;
                    *last_error.lock().await = Some(format!("worker panicked: {err}"));
                }
            }
        }

        let status = JobStatus::from_tally(succeeded, failed);
        let message = last_error.lock().await.clone();
        let _ = self
            .warehouse
            .jobs
            .update(job_id, |j| {
                j.status = status;
                j.last_error = message.clone();
            })
            .await;
        self.warehouse
            .events
            .append(LogEvent::for_job(
                EventType::JobCompleted,
                format!("backfill finished {}", status.as_str()),
                json!({
                    "job_id": job_id,
                    "status": status.as_str(),
                    "succeeded": succeeded,
                    "failed": failed,
                }),
            ))
            .await;
        self.cancels.lock().await.remove(&job_id);
    }

    async fn fetch_symbol(&self, symbol: &str, days: &[NaiveDate]) -> Result<usize, FeedError> {
        let mut bars = Vec::new();
        for day in days {
            // an absent bar is a day without data, not a failure
            if let Some(bar) = self.source.fetch_historical_bar(symbol, *day).await? {
                bars.push(bar);
            }
        }
        let count = bars.len();
        self.warehouse.bars.upsert(bars).await;
        Ok(count)
    }

    pub async fn cancel(&self, job_id: Uuid) -> bool {
        let cancels = self.cancels.lock().await;
        match cancels.get(&job_id) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    pub async fn list_jobs(&self) -> Vec<BackfillJob> {
        self.warehouse.jobs.list().await
    }

    /// Block until a spawned job's executor finishes. Used by tests and the
    /// CLI's one-shot backfill command.
    pub async fn wait(&self, job_id: Uuid) {
        let handle = self.handles.lock().await.remove(&job_id);
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Quote service

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefreshSummary {
    pub updated: usize,
    pub failed: Vec<String>,
}

pub struct QuoteService {
    warehouse: Arc<Warehouse>,
    source: Arc<dyn MarketDataSource>,
}

impl QuoteService {
    pub fn new(warehouse: Arc<Warehouse>, source: Arc<dyn MarketDataSource>) -> Self {
        Self { warehouse, source }
    }

    pub async fn refresh(&self, symbols: Vec<String>) -> Result<RefreshSummary> {
        let ticks = self
            .source
            .fetch_quotes(&symbols)
            .await
            .map_err(|err| anyhow::anyhow!("quote fetch failed: {err}"))?;
        let now = Utc::now();
        let quotes: Vec<MarketQuote> = ticks
            .iter()
            .map(|t| MarketQuote {
                symbol: t.symbol.clone(),
                price: t.price,
                last_update: t.timestamp,
                updated_at: now,
            })
            .collect();
        let updated = self.warehouse.quotes.upsert(quotes).await;
        let failed = symbols
            .into_iter()
            .filter(|s| !ticks.iter().any(|t| &t.symbol == s))
            .collect();
        Ok(RefreshSummary { updated, failed })
    }

    pub async fn cached(&self, symbols: Option<&[String]>) -> Vec<MarketQuote> {
        self.warehouse.quotes.cached(symbols).await
    }
}

// ---------------------------------------------------------------------------
// Scheduler

#[derive(Debug, Clone, Copy)]
struct ScheduleState {
    next_due: DateTime<Utc>,
    error_count: u32,
}

/// Polls every registered report on its own cadence: tighter inside the
/// publication window, exponential backoff while a report keeps erroring,
/// and a little jitter so reports never stampede the source together.
pub struct Scheduler {
    tracker: Arc<RunTracker>,
    quotes: Arc<QuoteService>,
    config: EngineConfig,
    state: Mutex<HashMap<String, ScheduleState>>,
    run_limit: Arc<Semaphore>,
}

impl Scheduler {
    pub fn new(tracker: Arc<RunTracker>, quotes: Arc<QuoteService>, config: EngineConfig) -> Self {
        let run_limit = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        Self {
            tracker,
            quotes,
            config,
            state: Mutex::new(HashMap::new()),
            run_limit,
        }
    }

    fn in_window(definition: &ReportDefinition, local_time: NaiveTime) -> bool {
        definition
            .windows
            .iter()
            .any(|w| w.start <= local_time && local_time <= w.end)
    }

    fn next_due(&self, definition: &ReportDefinition, now: DateTime<Utc>, error_count: u32) -> DateTime<Utc> {
        let local_time = now.with_timezone(&self.config.local_offset()).time();
        let polling = &definition.polling;
        let mut base = if Self::in_window(definition, local_time) {
            polling.inside_cadence_sec
        } else {
            polling.outside_cadence_sec
        };
        if error_count > 0 {
            let exponential = polling
                .error_backoff_base_sec
                .saturating_mul(1u64 << (error_count - 1).min(16));
            base = polling.error_backoff_max_sec.min(base.max(exponential));
        }
        let jitter = jitter_secs(polling.jitter_sec);
        now + chrono::Duration::seconds((base + jitter) as i64)
    }

    pub async fn tick(self: &Arc<Self>) {
        let now = Utc::now();
        for report_id in self.tracker.report_ids().await {
            let definition = match self.tracker.definition(&report_id).await {
                Ok(definition) => definition,
                Err(err) => {
                    warn!(%report_id, error = %err, "skipping report with bad config");
                    continue;
                }
            };
            let mut state = self.state.lock().await;
            let entry = state.entry(report_id.clone()).or_insert(ScheduleState {
                next_due: now,
                error_count: 0,
            });
            if now < entry.next_due {
                continue;
            }
            entry.next_due = self.next_due(&definition, now, entry.error_count);
            drop(state);

            let this = self.clone();
            tokio::spawn(async move {
                this.run_one(report_id).await;
            });
        }
    }

    async fn run_one(self: &Arc<Self>, report_id: String) {
        let _permit = self.run_limit.acquire().await.expect("semaphore not closed");
        let failed = match self.tracker.execute_cycle(&report_id).await {
            Ok(run) => run.state == RunState::Failed,
            Err(err) => {
                warn!(%report_id, error = %err, "scheduled cycle failed");
                true
            }
        };
        let mut state = self.state.lock().await;
        if let Some(entry) = state.get_mut(&report_id) {
            entry.error_count = if failed { entry.error_count + 1 } else { 0 };
        }
    }

    async fn refresh_quotes_if_open(self: &Arc<Self>) {
        let local = Utc::now().with_timezone(&self.config.local_offset()).time();
        let open = NaiveTime::from_hms_opt(QUOTE_WINDOW_START.0, QUOTE_WINDOW_START.1, 0)
            .expect("valid window time");
        let close = NaiveTime::from_hms_opt(QUOTE_WINDOW_END.0, QUOTE_WINDOW_END.1, 0)
            .expect("valid window time");
        if local < open || local > close {
            return;
        }
        let universe = SymbolUniverse::quotes(self.config.local_today());
        if let Err(err) = self.quotes.refresh(universe).await {
            warn!(error = %err, "scheduled quote refresh failed");
        }
    }

    /// Host the periodic jobs. The returned scheduler must be kept alive for
    /// the jobs to keep firing.
    pub async fn start(self: Arc<Self>) -> Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;

        let this = self.clone();
        let tick = Job::new_repeated_async(
            Duration::from_secs(self.config.poll_tick_seconds.max(1)),
            move |_uuid, _lock| {
                let this = this.clone();
                Box::pin(async move {
                    this.tick().await;
                })
            },
        )
        .context("creating poll tick job")?;
        sched.add(tick).await.context("adding poll tick job")?;

        let this = self.clone();
        let quotes = Job::new_repeated_async(
            Duration::from_secs(self.config.quote_refresh_seconds.max(1)),
            move |_uuid, _lock| {
                let this = this.clone();
                Box::pin(async move {
                    this.refresh_quotes_if_open().await;
                })
            },
        )
        .context("creating quote refresh job")?;
        sched.add(quotes).await.context("adding quote refresh job")?;

        sched.start().await.context("starting scheduler")?;
        Ok(sched)
    }
}

fn jitter_secs(limit: u64) -> u64 {
    if limit == 0 {
        return 0;
    }
    u64::from(Utc::now().timestamp_subsec_nanos()) % (limit + 1)
}

// ---------------------------------------------------------------------------
// Engine facade

/// Everything wired together; web and CLI share one of these behind an Arc.
pub struct Engine {
    pub config: EngineConfig,
    pub warehouse: Arc<Warehouse>,
    pub tracker: Arc<RunTracker>,
    pub alerts: Arc<AlertEngine>,
    pub backfill: Arc<BackfillManager>,
    pub quotes: Arc<QuoteService>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        warehouse: Arc<Warehouse>,
        bulletins: Arc<dyn BulletinSource>,
        markets: Arc<dyn MarketDataSource>,
        notifier: Arc<dyn AlertNotifier>,
    ) -> Self {
        let alerts = Arc::new(AlertEngine::new(
            warehouse.clone(),
            notifier,
            config.alert_threshold,
        ));
        let tracker = Arc::new(RunTracker::new(
            warehouse.clone(),
            alerts.clone(),
            bulletins,
            config.local_offset(),
        ));
        let backfill = Arc::new(BackfillManager::new(
            warehouse.clone(),
            markets.clone(),
            config.backfill_workers,
        ));
        let quotes = Arc::new(QuoteService::new(warehouse.clone(), markets));
        Self {
            config,
            warehouse,
            tracker,
            alerts,
            backfill,
            quotes,
        }
    }

    /// Seed the report catalog and alert rows from a registry. Existing
    /// (possibly operator-edited) catalog entries win.
    pub async fn seed(&self, registry: &ReportRegistry) {
        for definition in &registry.reports {
            self.warehouse
                .catalog
                .seed(
                    Report {
                        report_id: definition.report_id.clone(),
                        name: definition.name.clone(),
                    },
                    definition.to_config_json(),
                )
                .await;
            self.warehouse.alerts.ensure(&definition.report_id).await;
        }
    }

    pub fn history_universe(&self) -> Vec<String> {
        SymbolUniverse::history(self.config.local_today())
    }

    pub fn quote_universe(&self) -> Vec<String> {
        SymbolUniverse::quotes(self.config.local_today())
    }

    pub fn scheduler(self: &Arc<Self>) -> Arc<Scheduler> {
        Arc::new(Scheduler::new(
            self.tracker.clone(),
            self.quotes.clone(),
            self.config.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    #[test]
    fn business_days_skip_weekends_inclusively() {
        // 2024-01-01 is a Monday; the month has 23 business days
        let days = business_days(day(2024, 1, 1), day(2024, 1, 31));
        assert_eq!(days.len(), 23);
        assert_eq!(days.first(), Some(&day(2024, 1, 1)));
        assert_eq!(days.last(), Some(&day(2024, 1, 31)));
        assert!(!days.contains(&day(2024, 1, 6)));
        assert!(!days.contains(&day(2024, 1, 7)));

        // single weekend day
        assert!(business_days(day(2024, 1, 6), day(2024, 1, 6)).is_empty());
        // inverted range
        assert!(business_days(day(2024, 1, 5), day(2024, 1, 1)).is_empty());
    }

    #[test]
    fn jitter_respects_its_bound() {
        assert_eq!(jitter_secs(0), 0);
        for _ in 0..32 {
            assert!(jitter_secs(30) <= 30);
        }
    }

    #[test]
    fn engine_config_defaults_are_sane() {
        let config = EngineConfig::default();
        assert_eq!(config.alert_threshold, 3);
        assert_eq!(config.local_offset().local_minus_utc(), -6 * 3600);
    }
}
