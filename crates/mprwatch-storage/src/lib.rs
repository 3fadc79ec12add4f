//! In-process stores and content hashing for mprwatch.
//!
//! Every store guards its rows behind a single async lock, so read-modify-write
//! sequences (version dedup, alert counters, run transitions) are serialized
//! without a read-then-write window.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, NaiveDate, Utc};
use mprwatch_core::{
    AlertState, BackfillJob, EventType, LogEvent, MarketQuote, OhlcvBar, Recipient, Report, Run,
    Version,
};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

pub const CRATE_NAME: &str = "mprwatch-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("run not found: {0}")]
    RunNotFound(Uuid),
    #[error("run {0} is terminal and immutable")]
    RunImmutable(Uuid),
    #[error("job not found: {0}")]
    JobNotFound(Uuid),
    #[error("report not found: {0}")]
    ReportNotFound(String),
    #[error("recipient not found: {0}")]
    RecipientNotFound(Uuid),
    #[error("recipient email already exists: {0}")]
    DuplicateEmail(String),
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Deterministic fingerprint of parsed bulletin payloads. Object keys are
/// serialized in sorted order so two payloads that differ only in key order
/// hash identically.
pub fn payload_hash(payloads: &[Value]) -> String {
    let mut canonical = String::new();
    canonical.push('[');
    for (idx, payload) in payloads.iter().enumerate() {
        if idx > 0 {
            canonical.push(',');
        }
        write_canonical(&mut canonical, payload);
    }
    canonical.push(']');
    sha256_hex(canonical.as_bytes())
}

fn write_canonical(out: &mut String, value: &Value) {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            out.push('{');
            for (idx, (key, val)) in sorted.into_iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(out, val);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_canonical(out, item);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

#[derive(Debug, Clone)]
pub struct RegisteredVersion {
    pub version: Version,
    pub created: bool,
}

/// Content-addressed version shelf. Dedup key is `(report_id, payload_hash)`;
/// registration is an upsert-or-lookup under one lock.
#[derive(Debug, Default)]
pub struct VersionStore {
    inner: Mutex<VersionShelf>,
}

#[derive(Debug, Default)]
struct VersionShelf {
    by_key: HashMap<(String, String), usize>,
    rows: Vec<Version>,
}

impl VersionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register parsed content. Re-registering an identical `(report_id, hash)`
    /// returns the existing row unchanged with `created = false` — no new row,
    /// no timestamp update.
    pub async fn register(
        &self,
        report_id: &str,
        report_date: NaiveDate,
        payload_hash: &str,
        parsed_fields: Map<String, Value>,
        source_urls: Vec<String>,
    ) -> Result<RegisteredVersion, StoreError> {
        let mut shelf = self.inner.lock().await;
        let key = (report_id.to_string(), payload_hash.to_string());
        if let Some(&idx) = shelf.by_key.get(&key) {
            return Ok(RegisteredVersion {
                version: shelf.rows[idx].clone(),
                created: false,
            });
        }
        let version = Version {
            id: Uuid::new_v4(),
            report_id: report_id.to_string(),
            report_date,
            payload_hash: payload_hash.to_string(),
            parsed_fields,
            source_urls,
            created_at: Utc::now(),
        };
        let idx = shelf.rows.len();
        shelf.by_key.insert(key, idx);
        shelf.rows.push(version.clone());
        Ok(RegisteredVersion {
            version,
            created: true,
        })
    }

    pub async fn latest(&self, report_id: &str) -> Option<Version> {
        let shelf = self.inner.lock().await;
        shelf
            .rows
            .iter()
            .filter(|v| v.report_id == report_id)
            .max_by_key(|v| (v.report_date, v.created_at))
            .cloned()
    }

    /// Versions within the date range, ascending by report date.
    pub async fn historicals(
        &self,
        report_id: &str,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
        limit: usize,
    ) -> Vec<Version> {
        let shelf = self.inner.lock().await;
        let mut rows: Vec<Version> = shelf
            .rows
            .iter()
            .filter(|v| v.report_id == report_id)
            .filter(|v| start.is_none_or(|s| v.report_date >= s))
            .filter(|v| end.is_none_or(|e| v.report_date <= e))
            .cloned()
            .collect();
        rows.sort_by_key(|v| (v.report_date, v.created_at));
        rows.truncate(limit);
        rows
    }

    pub async fn latest_per_report(&self) -> HashMap<String, Version> {
        let shelf = self.inner.lock().await;
        let mut latest: HashMap<String, Version> = HashMap::new();
        for version in &shelf.rows {
            let slot = latest.entry(version.report_id.clone()).or_insert_with(|| version.clone());
            if (version.report_date, version.created_at) > (slot.report_date, slot.created_at) {
                *slot = version.clone();
            }
        }
        latest
    }

    async fn drain(&self) -> usize {
        let mut shelf = self.inner.lock().await;
        shelf.by_key.clear();
        let count = shelf.rows.len();
        shelf.rows.clear();
        count
    }
}

/// Run rows. Mutation goes through [`RunStore::update`], which refuses to
/// touch a run that already reached a terminal state.
#[derive(Debug, Default)]
pub struct RunStore {
    inner: Mutex<Vec<Run>>,
}

impl RunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, run: Run) -> Run {
        let mut rows = self.inner.lock().await;
        rows.push(run.clone());
        run
    }

    pub async fn get(&self, run_id: Uuid) -> Option<Run> {
        let rows = self.inner.lock().await;
        rows.iter().find(|r| r.id == run_id).cloned()
    }

    pub async fn update(
        &self,
        run_id: Uuid,
        apply: impl FnOnce(&mut Run),
    ) -> Result<Run, StoreError> {
        let mut rows = self.inner.lock().await;
        let run = rows
            .iter_mut()
            .find(|r| r.id == run_id)
            .ok_or(StoreError::RunNotFound(run_id))?;
        if run.state.is_terminal() {
            return Err(StoreError::RunImmutable(run_id));
        }
        apply(run);
        Ok(run.clone())
    }

    pub async fn list_for_report(&self, report_id: &str, limit: usize) -> Vec<Run> {
        let rows = self.inner.lock().await;
        let mut out: Vec<Run> = rows.iter().filter(|r| r.report_id == report_id).cloned().collect();
        out.sort_by(|a, b| b.run_started_at.cmp(&a.run_started_at));
        out.truncate(limit);
        out
    }

    pub async fn latest_per_report(&self) -> HashMap<String, Run> {
        let rows = self.inner.lock().await;
        let mut latest: HashMap<String, Run> = HashMap::new();
        for run in rows.iter() {
            let slot = latest.entry(run.report_id.clone()).or_insert_with(|| run.clone());
            if run.run_started_at > slot.run_started_at {
                *slot = run.clone();
            }
        }
        latest
    }

    async fn drain(&self) -> usize {
        let mut rows = self.inner.lock().await;
        let count = rows.len();
        rows.clear();
        count
    }
}

/// Per-report consecutive-failure counters. One row per report; updates are
/// read-modify-write under the store lock, so counting is serialized per
/// report even under concurrent terminal runs.
#[derive(Debug, Default)]
pub struct AlertStore {
    inner: Mutex<HashMap<String, AlertState>>,
}

impl AlertStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a zero row so dashboards list every report, failures or not.
    pub async fn ensure(&self, report_id: &str) {
        let mut rows = self.inner.lock().await;
        rows.entry(report_id.to_string())
            .or_insert_with(|| AlertState::zero(report_id));
    }

    pub async fn record_failure(&self, report_id: &str) -> AlertState {
        let mut rows = self.inner.lock().await;
        let state = rows
            .entry(report_id.to_string())
            .or_insert_with(|| AlertState::zero(report_id));
        state.consecutive_failures += 1;
        state.last_failure_at = Some(Utc::now());
        state.updated_at = Utc::now();
        state.clone()
    }

    pub async fn record_success(&self, report_id: &str) -> AlertState {
        let mut rows = self.inner.lock().await;
        let state = rows
            .entry(report_id.to_string())
            .or_insert_with(|| AlertState::zero(report_id));
        state.consecutive_failures = 0;
        state.updated_at = Utc::now();
        state.clone()
    }

    pub async fn list(&self) -> Vec<AlertState> {
        let rows = self.inner.lock().await;
        let mut out: Vec<AlertState> = rows.values().cloned().collect();
        out.sort_by(|a, b| a.report_id.cmp(&b.report_id));
        out
    }
}

#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub event_type: Option<EventType>,
    /// Substring match against the event's report id.
    pub report_id: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

/// Append-only audit log. `append` is best-effort: when the sink is marked
/// unavailable the event lands in a process-local overflow buffer and is
/// drained into the sink on the next successful append, so a log failure
/// never fails the run/version/alert transition that produced it.
#[derive(Debug)]
pub struct EventLog {
    sink: Mutex<Vec<LogEvent>>,
    overflow: Mutex<Vec<LogEvent>>,
    available: AtomicBool,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLog {
    pub fn new() -> Self {
        Self {
            sink: Mutex::new(Vec::new()),
            overflow: Mutex::new(Vec::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Maintenance hook: a durable backend flips this off while unreachable.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub async fn append(&self, event: LogEvent) {
        if !self.available.load(Ordering::SeqCst) {
            warn!(event_type = event.event_type.as_str(), "event sink unavailable, buffering");
            self.overflow.lock().await.push(event);
            return;
        }
        let mut buffered = {
            let mut overflow = self.overflow.lock().await;
            std::mem::take(&mut *overflow)
        };
        let mut sink = self.sink.lock().await;
        sink.append(&mut buffered);
        sink.push(event);
    }

    /// Filtered view, newest first.
    pub async fn query(&self, filter: &EventFilter) -> Vec<LogEvent> {
        let sink = self.sink.lock().await;
        let mut out: Vec<LogEvent> = sink
            .iter()
            .filter(|e| filter.event_type.is_none_or(|t| e.event_type == t))
            .filter(|e| {
                filter.report_id.as_deref().is_none_or(|needle| {
                    e.report_id.as_deref().is_some_and(|rid| rid.contains(needle))
                })
            })
            .filter(|e| filter.from.is_none_or(|f| e.created_at >= f))
            .filter(|e| filter.to.is_none_or(|t| e.created_at <= t))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out.truncate(filter.limit.unwrap_or(200));
        out
    }

    async fn drain(&self) -> usize {
        let mut sink = self.sink.lock().await;
        let mut overflow = self.overflow.lock().await;
        let count = sink.len() + overflow.len();
        sink.clear();
        overflow.clear();
        count
    }
}

#[derive(Debug, Default)]
pub struct JobStore {
    inner: Mutex<Vec<BackfillJob>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, job: BackfillJob) -> BackfillJob {
        let mut rows = self.inner.lock().await;
        rows.push(job.clone());
        job
    }

    pub async fn get(&self, job_id: Uuid) -> Option<BackfillJob> {
        let rows = self.inner.lock().await;
        rows.iter().find(|j| j.job_id == job_id).cloned()
    }

    pub async fn update(
        &self,
        job_id: Uuid,
        apply: impl FnOnce(&mut BackfillJob),
    ) -> Result<BackfillJob, StoreError> {
        let mut rows = self.inner.lock().await;
        let job = rows
            .iter_mut()
            .find(|j| j.job_id == job_id)
            .ok_or(StoreError::JobNotFound(job_id))?;
        apply(job);
        job.updated_at = Utc::now();
        Ok(job.clone())
    }

    pub async fn list(&self) -> Vec<BackfillJob> {
        let rows = self.inner.lock().await;
        let mut out = rows.clone();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out
    }
}

/// Daily bars keyed `(symbol, trade_date)`; backfill re-runs overwrite in
/// place rather than duplicating.
#[derive(Debug, Default)]
pub struct OhlcvStore {
    inner: Mutex<HashMap<(String, NaiveDate), OhlcvBar>>,
}

impl OhlcvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn upsert(&self, bars: Vec<OhlcvBar>) -> usize {
        let mut rows = self.inner.lock().await;
        let count = bars.len();
        for bar in bars {
            rows.insert((bar.symbol.clone(), bar.trade_date), bar);
        }
        count
    }

    pub async fn history(
        &self,
        symbol: &str,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> Vec<OhlcvBar> {
        let rows = self.inner.lock().await;
        let mut out: Vec<OhlcvBar> = rows
            .values()
            .filter(|b| b.symbol == symbol)
            .filter(|b| start.is_none_or(|s| b.trade_date >= s))
            .filter(|b| end.is_none_or(|e| b.trade_date <= e))
            .cloned()
            .collect();
        out.sort_by_key(|b| b.trade_date);
        out
    }

    pub async fn date_span(&self, symbol: &str) -> Option<(NaiveDate, NaiveDate)> {
        let rows = self.inner.lock().await;
        let mut dates = rows.values().filter(|b| b.symbol == symbol).map(|b| b.trade_date);
        let first = dates.next()?;
        let (min, max) = dates.fold((first, first), |(lo, hi), d| (lo.min(d), hi.max(d)));
        Some((min, max))
    }
}

#[derive(Debug, Default)]
pub struct QuoteStore {
    inner: Mutex<HashMap<String, MarketQuote>>,
}

impl QuoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn upsert(&self, quotes: Vec<MarketQuote>) -> usize {
        let mut rows = self.inner.lock().await;
        let count = quotes.len();
        for quote in quotes {
            rows.insert(quote.symbol.clone(), quote);
        }
        count
    }

    pub async fn cached(&self, symbols: Option<&[String]>) -> Vec<MarketQuote> {
        let rows = self.inner.lock().await;
        let mut out: Vec<MarketQuote> = rows
            .values()
            .filter(|q| symbols.is_none_or(|wanted| wanted.iter().any(|s| s == &q.symbol)))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        out
    }
}

/// Registered reports plus their opaque configuration documents. The core
/// never interprets the config beyond passthrough; shape validation happens
/// at the edge.
#[derive(Debug, Default)]
pub struct ReportCatalog {
    inner: Mutex<BTreeMap<String, CatalogEntry>>,
}

#[derive(Debug, Clone)]
struct CatalogEntry {
    report: Report,
    config: Value,
}

impl ReportCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert if absent; an existing entry (possibly operator-edited) wins.
    pub async fn seed(&self, report: Report, config: Value) {
        let mut rows = self.inner.lock().await;
        rows.entry(report.report_id.clone())
            .or_insert(CatalogEntry { report, config });
    }

    pub async fn list(&self) -> Vec<Report> {
        let rows = self.inner.lock().await;
        rows.values().map(|e| e.report.clone()).collect()
    }

    pub async fn contains(&self, report_id: &str) -> bool {
        let rows = self.inner.lock().await;
        rows.contains_key(report_id)
    }

    pub async fn config(&self, report_id: &str) -> Result<Value, StoreError> {
        let rows = self.inner.lock().await;
        rows.get(report_id)
            .map(|e| e.config.clone())
            .ok_or_else(|| StoreError::ReportNotFound(report_id.to_string()))
    }

    pub async fn set_config(
        &self,
        report_id: &str,
        name: String,
        config: Value,
    ) -> Result<(), StoreError> {
        let mut rows = self.inner.lock().await;
        let entry = rows
            .get_mut(report_id)
            .ok_or_else(|| StoreError::ReportNotFound(report_id.to_string()))?;
        entry.report.name = name;
        entry.config = config;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct RecipientStore {
    inner: Mutex<RecipientShelf>,
}

#[derive(Debug, Default)]
struct RecipientShelf {
    rows: Vec<Recipient>,
    subscriptions: HashMap<Uuid, BTreeSet<String>>,
}

#[derive(Debug, Clone)]
pub struct RecipientWithReports {
    pub recipient: Recipient,
    pub report_ids: Vec<String>,
}

impl RecipientStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(
        &self,
        email: &str,
        name: Option<String>,
        is_active: bool,
        report_ids: Vec<String>,
    ) -> Result<Recipient, StoreError> {
        let mut shelf = self.inner.lock().await;
        if shelf.rows.iter().any(|r| r.email == email) {
            return Err(StoreError::DuplicateEmail(email.to_string()));
        }
        let mut recipient = Recipient::new(email, name);
        recipient.is_active = is_active;
        shelf
            .subscriptions
            .insert(recipient.id, report_ids.into_iter().collect());
        shelf.rows.push(recipient.clone());
        Ok(recipient)
    }

    pub async fn update(
        &self,
        id: Uuid,
        email: Option<String>,
        name: Option<Option<String>>,
        is_active: Option<bool>,
    ) -> Result<Recipient, StoreError> {
        let mut shelf = self.inner.lock().await;
        if let Some(new_email) = &email {
            if shelf.rows.iter().any(|r| r.email == *new_email && r.id != id) {
                return Err(StoreError::DuplicateEmail(new_email.clone()));
            }
        }
        let row = shelf
            .rows
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(StoreError::RecipientNotFound(id))?;
        if let Some(new_email) = email {
            row.email = new_email;
        }
        if let Some(new_name) = name {
            row.name = new_name;
        }
        if let Some(active) = is_active {
            row.is_active = active;
        }
        Ok(row.clone())
    }

    pub async fn set_reports(&self, id: Uuid, report_ids: Vec<String>) -> Result<(), StoreError> {
        let mut shelf = self.inner.lock().await;
        if !shelf.rows.iter().any(|r| r.id == id) {
            return Err(StoreError::RecipientNotFound(id));
        }
        shelf.subscriptions.insert(id, report_ids.into_iter().collect());
        Ok(())
    }

    pub async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        let mut shelf = self.inner.lock().await;
        let before = shelf.rows.len();
        shelf.rows.retain(|r| r.id != id);
        if shelf.rows.len() == before {
            return Err(StoreError::RecipientNotFound(id));
        }
        shelf.subscriptions.remove(&id);
        Ok(())
    }

    pub async fn list(&self) -> Vec<RecipientWithReports> {
        let shelf = self.inner.lock().await;
        let mut out: Vec<RecipientWithReports> = shelf
            .rows
            .iter()
            .map(|r| RecipientWithReports {
                recipient: r.clone(),
                report_ids: shelf
                    .subscriptions
                    .get(&r.id)
                    .map(|ids| ids.iter().cloned().collect())
                    .unwrap_or_default(),
            })
            .collect();
        out.sort_by(|a, b| a.recipient.email.cmp(&b.recipient.email));
        out
    }

    pub async fn emails_for_report(&self, report_id: &str) -> Vec<String> {
        let shelf = self.inner.lock().await;
        shelf
            .rows
            .iter()
            .filter(|r| r.is_active)
            .filter(|r| {
                shelf
                    .subscriptions
                    .get(&r.id)
                    .is_some_and(|ids| ids.contains(report_id))
            })
            .map(|r| r.email.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct ClearCounts {
    pub deleted_events: usize,
    pub deleted_runs: usize,
    pub deleted_versions: usize,
}

/// All stores behind one handle; engine and web share an `Arc<Warehouse>`.
#[derive(Debug, Default)]
pub struct Warehouse {
    pub catalog: ReportCatalog,
    pub runs: RunStore,
    pub versions: VersionStore,
    pub alerts: AlertStore,
    pub events: EventLog,
    pub jobs: JobStore,
    pub bars: OhlcvStore,
    pub quotes: QuoteStore,
    pub recipients: RecipientStore,
}

impl Warehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Destructive maintenance: delete events, runs, and versions together,
    /// returning exact counts. Reports, alert counters, recipients, and
    /// market data survive.
    pub async fn clear_history(&self) -> ClearCounts {
        ClearCounts {
            deleted_events: self.events.drain().await,
            deleted_runs: self.runs.drain().await,
            deleted_versions: self.versions.drain().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use mprwatch_core::{ErrorKind, RunState};
    use serde_json::json;
    use std::sync::Arc;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    fn fields(pairs: &[(&str, f64)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), json!(v)))
            .collect()
    }

    #[test]
    fn payload_hash_ignores_key_order() {
        let a = json!({"wtd_avg": 92.5, "head_count": 4411});
        let b = json!({"head_count": 4411, "wtd_avg": 92.5});
        assert_eq!(payload_hash(&[a]), payload_hash(&[b]));

        let changed = json!({"head_count": 4412, "wtd_avg": 92.5});
        assert_ne!(
            payload_hash(&[json!({"head_count": 4411, "wtd_avg": 92.5})]),
            payload_hash(&[changed])
        );
    }

    #[tokio::test]
    async fn identical_registration_is_idempotent() {
        let store = VersionStore::new();
        let first = store
            .register("PK600", day(2024, 3, 4), "h1", fields(&[("wtd_avg", 92.5)]), vec![])
            .await
            .expect("register");
        let second = store
            .register("PK600", day(2024, 3, 5), "h1", fields(&[("wtd_avg", 92.5)]), vec![])
            .await
            .expect("register");

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.version.id, second.version.id);
        // the original row is returned untouched, including its report_date
        assert_eq!(second.version.report_date, day(2024, 3, 4));
    }

    #[tokio::test]
    async fn concurrent_identical_registrations_create_one_version() {
        let store = Arc::new(VersionStore::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .register("PK600", day(2024, 3, 4), "h1", Map::new(), vec![])
                    .await
                    .expect("register")
            }));
        }
        let mut created = 0;
        for handle in handles {
            if handle.await.expect("join").created {
                created += 1;
            }
        }
        assert_eq!(created, 1);
    }

    #[tokio::test]
    async fn historicals_are_range_filtered_and_ascending() {
        let store = VersionStore::new();
        for (d, h) in [(day(2024, 1, 3), "a"), (day(2024, 1, 1), "b"), (day(2024, 1, 2), "c")] {
            store
                .register("XB402", d, h, Map::new(), vec![])
                .await
                .expect("register");
        }
        let rows = store
            .historicals("XB402", Some(day(2024, 1, 2)), None, 10)
            .await;
        let dates: Vec<NaiveDate> = rows.iter().map(|v| v.report_date).collect();
        assert_eq!(dates, vec![day(2024, 1, 2), day(2024, 1, 3)]);

        let latest = store.latest("XB402").await.expect("latest");
        assert_eq!(latest.report_date, day(2024, 1, 3));
    }

    #[tokio::test]
    async fn terminal_runs_are_immutable() {
        let store = RunStore::new();
        let run = store.insert(Run::new("PK600", 1)).await;
        store
            .update(run.id, |r| {
                r.state = RunState::Failed;
                r.run_finished_at = Some(Utc::now());
                r.error_type = Some(ErrorKind::Fetch);
                r.error_message = Some("timeout".into());
            })
            .await
            .expect("first transition");

        let err = store
            .update(run.id, |r| r.state = RunState::Success)
            .await
            .expect_err("terminal run must reject mutation");
        assert!(matches!(err, StoreError::RunImmutable(_)));
    }

    #[tokio::test]
    async fn alert_counter_increments_and_resets() {
        let store = AlertStore::new();
        store.ensure("LM_XB403").await;
        assert_eq!(store.record_failure("LM_XB403").await.consecutive_failures, 1);
        assert_eq!(store.record_failure("LM_XB403").await.consecutive_failures, 2);
        let reset = store.record_success("LM_XB403").await;
        assert_eq!(reset.consecutive_failures, 0);
        // the failure timestamp is history, not cleared by success
        assert!(reset.last_failure_at.is_some());
    }

    #[tokio::test]
    async fn event_log_buffers_while_sink_unavailable() {
        let log = EventLog::new();
        log.set_available(false);
        log.append(LogEvent::for_run(
            Uuid::new_v4(),
            "PK600",
            EventType::RunStarted,
            "run started",
            json!({}),
        ))
        .await;
        assert!(log.query(&EventFilter::default()).await.is_empty());

        log.set_available(true);
        log.append(LogEvent::for_run(
            Uuid::new_v4(),
            "PK600",
            EventType::Published,
            "published",
            json!({}),
        ))
        .await;
        let events = log.query(&EventFilter::default()).await;
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn event_query_filters_type_substring_and_range() {
        let log = EventLog::new();
        log.append(LogEvent::for_run(
            Uuid::new_v4(),
            "PK600_MORNING_CASH",
            EventType::Published,
            "published",
            json!({}),
        ))
        .await;
        log.append(LogEvent::for_run(
            Uuid::new_v4(),
            "XB402_AFTERNOON_CUTOUT",
            EventType::Error,
            "boom",
            json!({}),
        ))
        .await;

        let filter = EventFilter {
            report_id: Some("PK600".into()),
            ..Default::default()
        };
        let events = log.query(&filter).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::Published);

        let filter = EventFilter {
            event_type: Some(EventType::Error),
            ..Default::default()
        };
        assert_eq!(log.query(&filter).await.len(), 1);
    }

    #[tokio::test]
    async fn clear_history_counts_exactly_and_spares_alerts() {
        let warehouse = Warehouse::new();
        warehouse.runs.insert(Run::new("PK600", 1)).await;
        warehouse.runs.insert(Run::new("PK600", 2)).await;
        warehouse
            .versions
            .register("PK600", day(2024, 3, 4), "h1", Map::new(), vec![])
            .await
            .expect("register");
        warehouse
            .events
            .append(LogEvent::for_run(
                Uuid::new_v4(),
                "PK600",
                EventType::Published,
                "published",
                json!({}),
            ))
            .await;
        warehouse.alerts.record_failure("PK600").await;

        let counts = warehouse.clear_history().await;
        assert_eq!(counts.deleted_events, 1);
        assert_eq!(counts.deleted_runs, 2);
        assert_eq!(counts.deleted_versions, 1);
        // alert rows survive the purge
        assert_eq!(warehouse.alerts.list().await.len(), 1);
        assert!(warehouse.events.query(&EventFilter::default()).await.is_empty());
    }

    #[tokio::test]
    async fn quote_cache_overwrites_on_refresh() {
        let store = QuoteStore::new();
        store
            .upsert(vec![MarketQuote {
                symbol: "HEJ26".into(),
                price: Some(88.5),
                last_update: Some(1_760_000_000),
                updated_at: Utc::now(),
            }])
            .await;
        store
            .upsert(vec![MarketQuote {
                symbol: "HEJ26".into(),
                price: Some(89.1),
                last_update: Some(1_760_000_060),
                updated_at: Utc::now(),
            }])
            .await;
        let cached = store.cached(None).await;
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].price, Some(89.1));
    }

    #[tokio::test]
    async fn recipient_emails_must_be_unique() {
        let store = RecipientStore::new();
        store
            .create("desk@example.com", None, true, vec!["PK600".into()])
            .await
            .expect("create");
        let err = store
            .create("desk@example.com", None, true, vec![])
            .await
            .expect_err("duplicate email");
        assert!(matches!(err, StoreError::DuplicateEmail(_)));

        assert_eq!(store.emails_for_report("PK600").await, vec!["desk@example.com"]);
        assert!(store.emails_for_report("XB402").await.is_empty());
    }
}
