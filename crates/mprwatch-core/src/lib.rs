//! Core domain model for mprwatch: reports, runs, versions, alerts, jobs.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub const CRATE_NAME: &str = "mprwatch-core";

/// A monitored report. Static configuration (endpoints, polling windows,
/// schema) is an opaque JSON document owned by the configuration
/// collaborator and referenced by `report_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub report_id: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Running,
    Success,
    Failed,
    Waiting,
}

impl RunState {
    /// Terminal states carry `run_finished_at`; `Waiting` does not — the
    /// source simply has not published yet and the cycle may retry.
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Success | RunState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Pending => "pending",
            RunState::Running => "running",
            RunState::Success => "success",
            RunState::Failed => "failed",
            RunState::Waiting => "waiting",
        }
    }
}

/// Classified failure kind surfaced to consumers alongside a human message.
/// Stack-level detail never crosses this boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transient source error (network, timeout, 5xx). Retried up to the
    /// configured attempt ceiling before a run is recorded failed.
    Fetch,
    /// Content fetched but unparseable. Never retried within a run.
    Parse,
    /// A run/version/event write failure. Surfaced as a hard error.
    Storage,
    /// Operator cancelled the in-flight run.
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Fetch => "fetch",
            ErrorKind::Parse => "parse",
            ErrorKind::Storage => "storage",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

/// One fetch/parse attempt for a report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub report_id: String,
    /// Business date the bulletin covers; known only after a successful parse.
    pub report_date: Option<NaiveDate>,
    pub state: RunState,
    pub attempt: u32,
    pub run_started_at: DateTime<Utc>,
    pub run_finished_at: Option<DateTime<Utc>>,
    pub error_type: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub payload_hash: Option<String>,
}

impl Run {
    pub fn new(report_id: impl Into<String>, attempt: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            report_id: report_id.into(),
            report_date: None,
            state: RunState::Pending,
            attempt,
            run_started_at: Utc::now(),
            run_finished_at: None,
            error_type: None,
            error_message: None,
            payload_hash: None,
        }
    }
}

/// An immutable, hash-deduplicated snapshot of parsed bulletin content.
/// At most one Version exists per `(report_id, payload_hash)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Version {
    pub id: Uuid,
    pub report_id: String,
    pub report_date: NaiveDate,
    pub payload_hash: String,
    pub parsed_fields: Map<String, Value>,
    pub source_urls: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Per-report consecutive-failure counter driving notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertState {
    pub report_id: String,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl AlertState {
    pub fn zero(report_id: impl Into<String>) -> Self {
        Self {
            report_id: report_id.into(),
            consecutive_failures: 0,
            last_failure_at: None,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    RunStarted,
    Published,
    WaitingForSource,
    Error,
    JobQueued,
    JobCompleted,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::RunStarted => "run_started",
            EventType::Published => "published",
            EventType::WaitingForSource => "waiting_for_source",
            EventType::Error => "error",
            EventType::JobQueued => "job_queued",
            EventType::JobCompleted => "job_completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "run_started" => Some(EventType::RunStarted),
            "published" => Some(EventType::Published),
            "waiting_for_source" => Some(EventType::WaitingForSource),
            "error" => Some(EventType::Error),
            "job_queued" => Some(EventType::JobQueued),
            "job_completed" => Some(EventType::JobCompleted),
            _ => None,
        }
    }
}

/// Append-only audit record. Run-scoped events carry `run_id`; job-scoped
/// events carry the job id inside `data` instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    pub id: Uuid,
    pub run_id: Option<Uuid>,
    pub report_id: Option<String>,
    pub event_type: EventType,
    pub message: String,
    pub data: Value,
    pub created_at: DateTime<Utc>,
}

impl LogEvent {
    pub fn for_run(
        run_id: Uuid,
        report_id: impl Into<String>,
        event_type: EventType,
        message: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id: Some(run_id),
            report_id: Some(report_id.into()),
            event_type,
            message: message.into(),
            data,
            created_at: Utc::now(),
        }
    }

    pub fn for_job(event_type: EventType, message: impl Into<String>, data: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id: None,
            report_id: None,
            event_type,
            message: message.into(),
            data,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Partial,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed | JobStatus::Partial)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Partial => "partial",
        }
    }

    /// Terminal status as a pure function of the per-symbol outcome tally.
    /// A job with nothing attempted (cancelled before any sub-fetch started,
    /// or an empty universe) counts as failed.
    pub fn from_tally(succeeded: usize, failed: usize) -> Self {
        if succeeded == 0 {
            JobStatus::Failed
        } else if failed == 0 {
            JobStatus::Succeeded
        } else {
            JobStatus::Partial
        }
    }
}

/// A bulk historical retrieval task spanning many symbols over a date range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackfillJob {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub symbols: Vec<String>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl BackfillJob {
    pub fn queued(symbols: Vec<String>, start_date: NaiveDate, end_date: NaiveDate) -> Self {
        let now = Utc::now();
        Self {
            job_id: Uuid::new_v4(),
            status: JobStatus::Queued,
            symbols,
            start_date,
            end_date,
            created_at: now,
            updated_at: now,
            last_error: None,
        }
    }
}

/// Daily bar as delivered by the history collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OhlcvBar {
    pub symbol: String,
    pub trade_date: NaiveDate,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub volume: Option<f64>,
    pub open_interest: Option<f64>,
}

/// Cache entry, overwritten on refresh, never historically versioned.
/// `last_update` is epoch seconds exactly as delivered by the quote
/// collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketQuote {
    pub symbol: String,
    pub price: Option<f64>,
    pub last_update: Option<i64>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub id: Uuid,
    pub email: String,
    pub name: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl Recipient {
    pub fn new(email: impl Into<String>, name: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            email: email.into(),
            name,
            is_active: true,
            created_at: Utc::now(),
        }
    }
}

/// Pure backfill cost projection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
    pub estimated_cost: f64,
    pub symbol_count: usize,
}
