//! Collaborator contracts and edge clients for mprwatch: bulletin feeds,
//! market data, and alert delivery.
//!
//! The core never interprets report formats itself — everything
//! format-specific lives behind [`BulletinSource`], driven by the opaque
//! per-report configuration in the registry.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, NaiveTime};
use mprwatch_core::{ErrorKind, OhlcvBar};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info_span, warn};

pub const CRATE_NAME: &str = "mprwatch-feeds";

pub const DATAMART_BASE: &str = "https://mpr.datamart.ams.usda.gov/services/v1.1/reports";

/// Classified feed failure. Only the kind and a human message cross this
/// boundary; transport detail stays inside the client.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("source error: {0}")]
    Fetch(String),
    #[error("unparseable content: {0}")]
    Parse(String),
}

impl FeedError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FeedError::Fetch(_) => ErrorKind::Fetch,
            FeedError::Parse(_) => ErrorKind::Parse,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            FeedError::Fetch(msg) | FeedError::Parse(msg) => msg,
        }
    }
}

// ---------------------------------------------------------------------------
// Report registry

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDef {
    #[serde(default)]
    pub report_number: u32,
    #[serde(default)]
    pub report_path: String,
    #[serde(default)]
    pub absolute_url: Option<String>,
}

impl EndpointDef {
    pub fn build_url(&self, base: &str, date_query: &str) -> String {
        if let Some(absolute) = &self.absolute_url {
            return absolute.clone();
        }
        let path = self.report_path.replace(' ', "%20");
        format!(
            "{base}/{number}/{path}?q=report_date={date_query}",
            number = self.report_number
        )
    }
}

/// Local-time span during which a report is expected to publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollingWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollingRule {
    pub inside_cadence_sec: u64,
    pub outside_cadence_sec: u64,
    pub max_late_hours: u32,
    pub error_backoff_base_sec: u64,
    pub error_backoff_max_sec: u64,
    pub jitter_sec: u64,
}

/// How to pick the row of interest out of a fetched payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SelectRule {
    RowIndex { index: usize },
    DateMatch,
    FieldEquals { field: String, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSchema {
    pub required_fields: Vec<String>,
    pub select_rule: SelectRule,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportDefinition {
    pub report_id: String,
    pub name: String,
    pub endpoints: Vec<EndpointDef>,
    pub windows: Vec<PollingWindow>,
    pub polling: PollingRule,
    #[serde(default = "default_search_window")]
    pub date_search_window_days: u32,
    pub schema: ReportSchema,
}

fn default_search_window() -> u32 {
    1
}

impl ReportDefinition {
    pub fn to_config_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Shape validation for the config passthrough: the document must
    /// deserialize back into a definition. Content is otherwise opaque.
    pub fn from_config_json(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReportRegistry {
    pub reports: Vec<ReportDefinition>,
}

impl ReportRegistry {
    pub fn from_yaml_str(text: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(text).context("parsing report registry yaml")
    }

    pub fn get(&self, report_id: &str) -> Option<&ReportDefinition> {
        self.reports.iter().find(|r| r.report_id == report_id)
    }

    /// The monitored USDA bulletin set shipped with the binary; a registry
    /// file can replace it wholesale.
    pub fn builtin() -> Self {
        let standard = PollingRule {
            inside_cadence_sec: 300,
            outside_cadence_sec: 900,
            max_late_hours: 6,
            error_backoff_base_sec: 120,
            error_backoff_max_sec: 1800,
            jitter_sec: 30,
        };
        let slow = PollingRule {
            inside_cadence_sec: 600,
            outside_cadence_sec: 1800,
            max_late_hours: 8,
            error_backoff_base_sec: 180,
            error_backoff_max_sec: 3600,
            jitter_sec: 60,
        };
        let window = |sh: u32, sm: u32, eh: u32, em: u32| PollingWindow {
            start: NaiveTime::from_hms_opt(sh, sm, 0).expect("valid window time"),
            end: NaiveTime::from_hms_opt(eh, em, 0).expect("valid window time"),
        };
        let api = |number: u32, path: &str| EndpointDef {
            report_number: number,
            report_path: path.to_string(),
            absolute_url: None,
        };

        Self {
            reports: vec![
                ReportDefinition {
                    report_id: "PK600_MORNING_CASH".into(),
                    name: "PK600 Morning Cash".into(),
                    endpoints: vec![api(2674, "National Volume and Price Data")],
                    windows: vec![window(6, 30, 9, 0)],
                    polling: standard,
                    date_search_window_days: 1,
                    schema: ReportSchema {
                        required_fields: vec![
                            "head_count".into(),
                            "wtd_avg".into(),
                            "price_low".into(),
                            "price_high".into(),
                        ],
                        select_rule: SelectRule::DateMatch,
                    },
                },
                ReportDefinition {
                    report_id: "PK600_AFTERNOON_CASH".into(),
                    name: "PK600 Afternoon Cash".into(),
                    endpoints: vec![api(2675, "National Volume and Price Data")],
                    windows: vec![window(12, 0, 14, 30)],
                    polling: standard,
                    date_search_window_days: 1,
                    schema: ReportSchema {
                        required_fields: vec![
                            "head_count".into(),
                            "wtd_avg".into(),
                            "price_low".into(),
                            "price_high".into(),
                        ],
                        select_rule: SelectRule::DateMatch,
                    },
                },
                ReportDefinition {
                    report_id: "PK600_AFTERNOON_CUTOUT".into(),
                    name: "PK600 Afternoon Pork Cutout".into(),
                    endpoints: vec![
                        api(2498, "Cutout and Primal Values"),
                        api(2498, "Change From Prior Day"),
                    ],
                    windows: vec![window(12, 0, 14, 30)],
                    polling: standard,
                    date_search_window_days: 1,
                    schema: ReportSchema {
                        required_fields: vec!["cutout_value".into(), "primal_value".into()],
                        select_rule: SelectRule::DateMatch,
                    },
                },
                ReportDefinition {
                    report_id: "XB402_AFTERNOON_CUTOUT".into(),
                    name: "XB402 Afternoon Beef Cutout".into(),
                    endpoints: vec![
                        api(2453, "Current Cutout Values"),
                        api(2453, "Change From Prior Day"),
                        api(2453, "Current Volume"),
                    ],
                    windows: vec![window(12, 0, 15, 0)],
                    polling: standard,
                    date_search_window_days: 1,
                    schema: ReportSchema {
                        required_fields: vec!["cutout_value".into(), "volume".into()],
                        select_rule: SelectRule::DateMatch,
                    },
                },
                ReportDefinition {
                    report_id: "HG201_CME_INDEX".into(),
                    name: "HG201 CME Index".into(),
                    endpoints: vec![api(2511, "Barrows/Gilts")],
                    windows: vec![window(13, 0, 16, 30)],
                    polling: slow,
                    date_search_window_days: 7,
                    schema: ReportSchema {
                        required_fields: vec!["avg_net_price".into(), "head_count".into()],
                        select_rule: SelectRule::FieldEquals {
                            field: "purchase_type".into(),
                            value: "Prod. Sold (All Purchase Types)".into(),
                        },
                    },
                },
            ],
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP plumbing

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Exponential backoff, capped. `max_retries` is the transient-error attempt
/// ceiling: once it is exhausted the fetch is reported failed, never retried
/// further within the run.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_source_concurrency: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchHttpError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Shared JSON fetcher: timeout, retry-with-backoff on transient failures,
/// bounded concurrency globally and per source so no publisher is hammered.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    pub async fn fetch_json(&self, source_id: &str, url: &str) -> Result<Value, FetchHttpError> {
        let _global = self.global_limit.acquire().await.expect("semaphore not closed");
        let per_source = self.per_source_semaphore(source_id).await;
        let _source = per_source.acquire().await.expect("semaphore not closed");

        let span = info_span!("feed_fetch", source_id, url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        return Ok(resp.json::<Value>().await?);
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchHttpError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchHttpError::Request(err));
                }
            }
        }

        Err(FetchHttpError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

// ---------------------------------------------------------------------------
// Bulletin source

/// Parsed output of one bulletin for one business date.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedBulletin {
    pub report_date: NaiveDate,
    /// One row array per endpoint, in endpoint order. Hashing input.
    pub payloads: Vec<Value>,
    pub parsed_fields: Map<String, Value>,
    pub source_urls: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Published(ParsedBulletin),
    /// The source has nothing for the requested date yet. Expected, not a
    /// failure.
    NotPublished,
}

#[async_trait]
pub trait BulletinSource: Send + Sync {
    /// Fetch the freshest available edition, searching back over the
    /// definition's date window.
    async fn fetch_current(
        &self,
        definition: &ReportDefinition,
        as_of: NaiveDate,
    ) -> Result<FetchOutcome, FeedError>;

    /// Fetch a historical date range, one bulletin per date with data,
    /// ascending.
    async fn fetch_range(
        &self,
        definition: &ReportDefinition,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<ParsedBulletin>, FeedError>;
}

const ROW_DATE_KEYS: [&str; 4] = ["report_date", "report date", "reportdate", "Report Date"];

fn mdy(date: NaiveDate) -> String {
    date.format("%m/%d/%Y").to_string()
}

pub fn row_report_date(row: &Value) -> Option<NaiveDate> {
    for key in ROW_DATE_KEYS {
        if let Some(raw) = row.get(key).and_then(Value::as_str) {
            if let Ok(parsed) = NaiveDate::parse_from_str(raw.trim(), "%m/%d/%Y") {
                return Some(parsed);
            }
        }
    }
    None
}

pub fn select_row<'a>(
    rows: &'a [Value],
    rule: &SelectRule,
    report_date: NaiveDate,
) -> Option<&'a Value> {
    match rule {
        SelectRule::RowIndex { index } => rows.get(*index),
        SelectRule::DateMatch => {
            let target = mdy(report_date);
            rows.iter().find(|row| {
                ROW_DATE_KEYS.iter().any(|key| {
                    row.get(key)
                        .and_then(Value::as_str)
                        .is_some_and(|v| v.trim() == target)
                })
            })
        }
        SelectRule::FieldEquals { field, value } => rows.iter().find(|row| {
            row.get(field)
                .map(json_as_comparable)
                .is_some_and(|v| v == *value)
        }),
    }
    .or_else(|| rows.first())
}

fn json_as_comparable(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Pull the schema's required fields out of the selected row. Missing keys
/// come through as null — the core never branches on specific field names.
pub fn parse_bulletin(
    definition: &ReportDefinition,
    report_date: NaiveDate,
    payloads: Vec<Value>,
    source_urls: Vec<String>,
) -> Result<ParsedBulletin, FeedError> {
    let rows = payloads
        .first()
        .and_then(Value::as_array)
        .ok_or_else(|| FeedError::Parse("payload is not a row array".into()))?;
    let row = select_row(rows, &definition.schema.select_rule, report_date)
        .ok_or_else(|| FeedError::Parse("no matching row for report date".into()))?;

    let mut parsed_fields = Map::new();
    for field in &definition.schema.required_fields {
        parsed_fields.insert(field.clone(), row.get(field).cloned().unwrap_or(Value::Null));
    }
    parsed_fields.insert(
        "report_date".into(),
        Value::String(report_date.format("%Y-%m-%d").to_string()),
    );

    Ok(ParsedBulletin {
        report_date,
        payloads,
        parsed_fields,
        source_urls,
    })
}

fn response_rows(data: Value) -> Vec<Value> {
    match data {
        Value::Array(rows) => rows,
        Value::Object(mut map) => match map.remove("results") {
            Some(Value::Array(rows)) => rows,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

/// USDA datamart client: per-date and date-range fetches against the JSON
/// report endpoints.
#[derive(Debug)]
pub struct DatamartClient {
    http: HttpFetcher,
    base_url: String,
}

impl DatamartClient {
    pub fn new(http: HttpFetcher) -> Self {
        Self {
            http,
            base_url: DATAMART_BASE.to_string(),
        }
    }

    pub fn with_base_url(http: HttpFetcher, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    async fn fetch_payloads(
        &self,
        definition: &ReportDefinition,
        date_query: &str,
    ) -> Result<(Vec<Value>, Vec<String>), FeedError> {
        let mut payloads = Vec::with_capacity(definition.endpoints.len());
        let mut urls = Vec::with_capacity(definition.endpoints.len());
        for endpoint in &definition.endpoints {
            let url = endpoint.build_url(&self.base_url, date_query);
            let data = self
                .http
                .fetch_json(&definition.report_id, &url)
                .await
                .map_err(|err| FeedError::Fetch(err.to_string()))?;
            payloads.push(Value::Array(response_rows(data)));
            urls.push(url);
        }
        Ok((payloads, urls))
    }
}

#[async_trait]
impl BulletinSource for DatamartClient {
    async fn fetch_current(
        &self,
        definition: &ReportDefinition,
        as_of: NaiveDate,
    ) -> Result<FetchOutcome, FeedError> {
        let search_days = definition.date_search_window_days.max(1);
        for offset in 0..search_days {
            let target = as_of - chrono::Duration::days(i64::from(offset));
            let (payloads, urls) = self.fetch_payloads(definition, &mdy(target)).await?;
            let has_rows = payloads
                .iter()
                .any(|p| p.as_array().is_some_and(|rows| !rows.is_empty()));
            if has_rows {
                return Ok(FetchOutcome::Published(parse_bulletin(
                    definition, target, payloads, urls,
                )?));
            }
        }
        Ok(FetchOutcome::NotPublished)
    }

    async fn fetch_range(
        &self,
        definition: &ReportDefinition,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<ParsedBulletin>, FeedError> {
        let date_query = format!("{}:{}", mdy(start), mdy(end));
        let mut by_date: BTreeMap<NaiveDate, Vec<Value>> = BTreeMap::new();
        let mut urls = Vec::with_capacity(definition.endpoints.len());

        for endpoint in &definition.endpoints {
            let url = endpoint.build_url(&self.base_url, &date_query);
            let data = self
                .http
                .fetch_json(&definition.report_id, &url)
                .await
                .map_err(|err| FeedError::Fetch(err.to_string()))?;
            urls.push(url);

            let mut grouped: BTreeMap<NaiveDate, Vec<Value>> = BTreeMap::new();
            for row in response_rows(data) {
                if let Some(date) = row_report_date(&row) {
                    grouped.entry(date).or_default().push(row);
                }
            }
            for (date, rows) in grouped {
                by_date.entry(date).or_default().push(Value::Array(rows));
            }
        }

        let mut bulletins = Vec::with_capacity(by_date.len());
        for (date, payloads) in by_date {
            bulletins.push(parse_bulletin(definition, date, payloads, urls.clone())?);
        }
        Ok(bulletins)
    }
}

// ---------------------------------------------------------------------------
// Market data collaborators

#[derive(Debug, Clone, PartialEq)]
pub struct QuoteTick {
    pub symbol: String,
    pub price: Option<f64>,
    /// Epoch seconds exactly as delivered by the collaborator.
    pub timestamp: Option<i64>,
}

#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Quotes for the symbols the source could serve; missing symbols are
    /// simply absent from the result.
    async fn fetch_quotes(&self, symbols: &[String]) -> Result<Vec<QuoteTick>, FeedError>;

    /// One daily bar, `None` when the source has no data for that date.
    async fn fetch_historical_bar(
        &self,
        symbol: &str,
        date: NaiveDate,
    ) -> Result<Option<OhlcvBar>, FeedError>;

    /// Vendor list price per symbol-day, input to the pure cost estimate.
    fn rate_per_symbol_day(&self) -> f64;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestAlertReceipt {
    pub recipient: String,
}

/// Outbound alert delivery. Sending is the collaborator's problem; the core
/// only decides when to ask.
#[async_trait]
pub trait AlertNotifier: Send + Sync {
    async fn send_alert(&self, report_id: &str, consecutive_failures: u32) -> Result<(), FeedError>;
    async fn send_test_alert(&self) -> Result<TestAlertReceipt, FeedError>;
}

/// Delivery stub that records alerts in the log stream only. Used when no
/// real delivery collaborator is configured.
#[derive(Debug, Clone)]
pub struct LogNotifier {
    recipient: String,
}

impl LogNotifier {
    pub fn new(recipient: impl Into<String>) -> Self {
        Self {
            recipient: recipient.into(),
        }
    }
}

#[async_trait]
impl AlertNotifier for LogNotifier {
    async fn send_alert(&self, report_id: &str, consecutive_failures: u32) -> Result<(), FeedError> {
        warn!(report_id, consecutive_failures, "alert threshold reached");
        Ok(())
    }

    async fn send_test_alert(&self) -> Result<TestAlertReceipt, FeedError> {
        Ok(TestAlertReceipt {
            recipient: self.recipient.clone(),
        })
    }
}

/// Commodity quote/history vendor client. Quote payload shapes vary between
/// vendor versions, so field extraction is tolerant about key names.
#[derive(Debug)]
pub struct CommodityApiClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    rate_per_symbol_day: f64,
}

impl CommodityApiClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        rate_per_symbol_day: f64,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building commodity api client")?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
            rate_per_symbol_day,
        })
    }

    async fn get_json(&self, path: &str, query: &[(&str, String)]) -> Result<Value, FeedError> {
        let url = format!("{}/{path}", self.base_url);
        let resp = self
            .client
            .get(&url)
            .header("X-Api-Key", &self.api_key)
            .query(query)
            .send()
            .await
            .map_err(|err| FeedError::Fetch(err.to_string()))?;
        if !resp.status().is_success() {
            return Err(FeedError::Fetch(format!(
                "http status {} for {url}",
                resp.status().as_u16()
            )));
        }
        resp.json::<Value>()
            .await
            .map_err(|err| FeedError::Parse(err.to_string()))
    }
}

pub fn quote_tick_from_payload(payload: &Value) -> Option<QuoteTick> {
    let record = match payload {
        Value::Array(items) => items.first()?,
        other => other,
    };
    let symbol = record
        .get("symbol")
        .or_else(|| record.get("ticker"))
        .and_then(Value::as_str)?
        .to_string();
    let price = ["price", "last_price", "last", "value"]
        .iter()
        .find_map(|key| record.get(*key))
        .and_then(value_as_f64);
    let timestamp = ["last_update", "last_updated", "timestamp", "time", "updated"]
        .iter()
        .find_map(|key| record.get(*key))
        .and_then(value_as_i64);
    Some(QuoteTick {
        symbol,
        price,
        timestamp,
    })
}

fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn value_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[async_trait]
impl MarketDataSource for CommodityApiClient {
    async fn fetch_quotes(&self, symbols: &[String]) -> Result<Vec<QuoteTick>, FeedError> {
        let mut ticks = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            match self
                .get_json("commoditycontract", &[("symbol", symbol.clone())])
                .await
            {
                Ok(payload) => {
                    if let Some(tick) = quote_tick_from_payload(&payload) {
                        ticks.push(tick);
                    }
                }
                Err(err) => {
                    warn!(%symbol, error = %err, "quote fetch failed");
                }
            }
        }
        Ok(ticks)
    }

    async fn fetch_historical_bar(
        &self,
        symbol: &str,
        date: NaiveDate,
    ) -> Result<Option<OhlcvBar>, FeedError> {
        let payload = self
            .get_json(
                "commodityhistory",
                &[
                    ("symbol", symbol.to_string()),
                    ("date", date.format("%Y-%m-%d").to_string()),
                ],
            )
            .await?;
        let record = match &payload {
            Value::Array(items) => match items.first() {
                Some(first) => first,
                None => return Ok(None),
            },
            Value::Null => return Ok(None),
            other => other,
        };
        if record.as_object().is_none_or(|map| map.is_empty()) {
            return Ok(None);
        }
        Ok(Some(OhlcvBar {
            symbol: symbol.to_string(),
            trade_date: date,
            open: record.get("open").and_then(value_as_f64),
            high: record.get("high").and_then(value_as_f64),
            low: record.get("low").and_then(value_as_f64),
            close: record.get("close").and_then(value_as_f64),
            volume: record.get("volume").and_then(value_as_f64),
            open_interest: record.get("open_interest").and_then(value_as_f64),
        }))
    }

    fn rate_per_symbol_day(&self) -> f64 {
        self.rate_per_symbol_day
    }
}

// ---------------------------------------------------------------------------
// Futures symbol universe

/// CME lean hog contract month codes, in calendar order.
pub const HE_MONTH_CODES: [char; 8] = ['G', 'J', 'K', 'M', 'N', 'Q', 'V', 'Z'];

fn he_month(code: char) -> Option<u32> {
    match code {
        'G' => Some(2),
        'J' => Some(4),
        'K' => Some(5),
        'M' => Some(6),
        'N' => Some(7),
        'Q' => Some(8),
        'V' => Some(10),
        'Z' => Some(12),
        _ => None,
    }
}

pub fn generate_he_symbols(start: NaiveDate, end: NaiveDate) -> Vec<String> {
    let mut symbols = Vec::new();
    for year in start.year()..=end.year() {
        let suffix = year.rem_euclid(100);
        for code in HE_MONTH_CODES {
            symbols.push(format!("HE{code}{suffix:02}"));
        }
    }
    symbols
}

pub fn generate_he_symbols_future(start: NaiveDate, end: NaiveDate) -> Vec<String> {
    let cutoff = month_start(start);
    generate_he_symbols(start, end)
        .into_iter()
        .filter(|s| symbol_month_start(s).is_some_and(|m| m >= cutoff))
        .collect()
}

pub fn filter_future_symbols(symbols: &[String], cutoff: NaiveDate) -> Vec<String> {
    let cutoff_month = month_start(cutoff);
    symbols
        .iter()
        .filter(|s| symbol_month_start(s).is_some_and(|m| m >= cutoff_month))
        .cloned()
        .collect()
}

fn month_start(date: NaiveDate) -> NaiveDate {
    NaiveDate::from_ymd_opt(date.year(), date.month(), 1).expect("first of month is valid")
}

pub fn symbol_month_start(symbol: &str) -> Option<NaiveDate> {
    let mut chars = symbol.chars();
    if chars.next() != Some('H') || chars.next() != Some('E') {
        return None;
    }
    let month = he_month(chars.next()?)?;
    let suffix: String = chars.collect();
    let year = 2000 + suffix.parse::<i32>().ok()?;
    NaiveDate::from_ymd_opt(year, month, 1)
}

pub fn add_months(date: NaiveDate, months: u32) -> NaiveDate {
    let zero_based = date.month0() + months;
    let year = date.year() + (zero_based / 12) as i32;
    let month = zero_based % 12 + 1;
    let day = date.day().min(days_in_month(year, month));
    NaiveDate::from_ymd_opt(year, month, day).expect("clamped day is valid")
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    };
    let first = NaiveDate::from_ymd_opt(year, month, 1);
    match (first, next) {
        (Some(first), Some(next)) => next.signed_duration_since(first).num_days() as u32,
        _ => 28,
    }
}

/// Active symbol sets derived from a reference date: history spans three
/// years back through eighteen months forward; quotes only track contracts
/// that have not yet expired.
#[derive(Debug, Clone, Copy)]
pub struct SymbolUniverse;

impl SymbolUniverse {
    pub fn history(as_of: NaiveDate) -> Vec<String> {
        let start = NaiveDate::from_ymd_opt(as_of.year() - 3, 1, 1).expect("jan 1 is valid");
        generate_he_symbols(start, add_months(as_of, 18))
    }

    pub fn quotes(as_of: NaiveDate) -> Vec<String> {
        generate_he_symbols_future(as_of, add_months(as_of, 18))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    fn definition(rule: SelectRule, fields: &[&str]) -> ReportDefinition {
        ReportDefinition {
            report_id: "PK600_MORNING_CASH".into(),
            name: "PK600 Morning Cash".into(),
            endpoints: vec![EndpointDef {
                report_number: 2674,
                report_path: "National Volume and Price Data".into(),
                absolute_url: None,
            }],
            windows: vec![],
            polling: PollingRule {
                inside_cadence_sec: 300,
                outside_cadence_sec: 900,
                max_late_hours: 6,
                error_backoff_base_sec: 120,
                error_backoff_max_sec: 1800,
                jitter_sec: 30,
            },
            date_search_window_days: 1,
            schema: ReportSchema {
                required_fields: fields.iter().map(|f| f.to_string()).collect(),
                select_rule: rule,
            },
        }
    }

    #[test]
    fn endpoint_url_encodes_path_and_date_query() {
        let endpoint = EndpointDef {
            report_number: 2674,
            report_path: "National Volume and Price Data".into(),
            absolute_url: None,
        };
        let url = endpoint.build_url(DATAMART_BASE, "03/04/2024");
        assert_eq!(
            url,
            "https://mpr.datamart.ams.usda.gov/services/v1.1/reports/2674/National%20Volume%20and%20Price%20Data?q=report_date=03/04/2024"
        );

        let absolute = EndpointDef {
            report_number: 0,
            report_path: String::new(),
            absolute_url: Some("https://example.com/fixed.json".into()),
        };
        assert_eq!(
            absolute.build_url(DATAMART_BASE, "ignored"),
            "https://example.com/fixed.json"
        );
    }

    #[test]
    fn date_match_select_rule_finds_the_target_row() {
        let rows = vec![
            json!({"report_date": "03/01/2024", "wtd_avg": 90.0}),
            json!({"Report Date": "03/04/2024", "wtd_avg": 92.5}),
        ];
        let row = select_row(&rows, &SelectRule::DateMatch, day(2024, 3, 4)).expect("row");
        assert_eq!(row.get("wtd_avg"), Some(&json!(92.5)));
    }

    #[test]
    fn field_equals_select_rule_compares_stringified_values() {
        let rows = vec![
            json!({"purchase_type": "Negotiated", "avg_net_price": 80.0}),
            json!({"purchase_type": "Prod. Sold (All Purchase Types)", "avg_net_price": 85.5}),
        ];
        let rule = SelectRule::FieldEquals {
            field: "purchase_type".into(),
            value: "Prod. Sold (All Purchase Types)".into(),
        };
        let row = select_row(&rows, &rule, day(2024, 3, 4)).expect("row");
        assert_eq!(row.get("avg_net_price"), Some(&json!(85.5)));
    }

    #[test]
    fn parse_bulletin_extracts_required_fields_and_stamps_date() {
        let def = definition(SelectRule::DateMatch, &["head_count", "wtd_avg"]);
        let payloads = vec![json!([
            {"report_date": "03/04/2024", "head_count": 4411, "wtd_avg": 92.5, "extra": true}
        ])];
        let bulletin =
            parse_bulletin(&def, day(2024, 3, 4), payloads, vec!["u".into()]).expect("parse");
        assert_eq!(bulletin.parsed_fields.get("head_count"), Some(&json!(4411)));
        assert_eq!(bulletin.parsed_fields.get("wtd_avg"), Some(&json!(92.5)));
        assert_eq!(
            bulletin.parsed_fields.get("report_date"),
            Some(&json!("2024-03-04"))
        );
        // fields absent from the row surface as null, not as an error
        let def = definition(SelectRule::DateMatch, &["head_count", "missing_field"]);
        let payloads = vec![json!([{"report_date": "03/04/2024", "head_count": 4411}])];
        let bulletin =
            parse_bulletin(&def, day(2024, 3, 4), payloads, vec![]).expect("parse");
        assert_eq!(bulletin.parsed_fields.get("missing_field"), Some(&Value::Null));
    }

    #[test]
    fn response_rows_accepts_bare_arrays_and_results_envelopes() {
        assert_eq!(response_rows(json!([1, 2])).len(), 2);
        assert_eq!(response_rows(json!({"results": [1, 2, 3]})).len(), 3);
        assert!(response_rows(json!({"unexpected": true})).is_empty());
        assert!(response_rows(json!("text")).is_empty());
    }

    #[test]
    fn row_report_date_tries_known_key_spellings() {
        assert_eq!(
            row_report_date(&json!({"report date": " 03/04/2024 "})),
            Some(day(2024, 3, 4))
        );
        assert_eq!(row_report_date(&json!({"other": "03/04/2024"})), None);
        assert_eq!(row_report_date(&json!({"report_date": "2024-03-04"})), None);
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn builtin_registry_round_trips_through_config_json() {
        let registry = ReportRegistry::builtin();
        assert_eq!(registry.reports.len(), 5);
        for def in &registry.reports {
            let parsed = ReportDefinition::from_config_json(def.to_config_json())
                .expect("config json round trip");
            assert_eq!(&parsed, def);
        }
        assert!(registry.get("HG201_CME_INDEX").is_some());
        assert!(registry.get("NOPE").is_none());
    }

    #[test]
    fn registry_parses_from_yaml() {
        let text = r#"
reports:
  - report_id: PK600_MORNING_CASH
    name: PK600 Morning Cash
    endpoints:
      - report_number: 2674
        report_path: National Volume and Price Data
    windows:
      - start: "06:30:00"
        end: "09:00:00"
    polling:
      inside_cadence_sec: 300
      outside_cadence_sec: 900
      max_late_hours: 6
      error_backoff_base_sec: 120
      error_backoff_max_sec: 1800
      jitter_sec: 30
    schema:
      required_fields: [head_count, wtd_avg]
      select_rule:
        type: date_match
"#;
        let registry = ReportRegistry::from_yaml_str(text).expect("yaml registry");
        assert_eq!(registry.reports.len(), 1);
        let def = &registry.reports[0];
        assert_eq!(def.date_search_window_days, 1);
        assert_eq!(def.schema.select_rule, SelectRule::DateMatch);
        assert_eq!(
            def.windows[0].start,
            NaiveTime::from_hms_opt(6, 30, 0).expect("time")
        );
    }

    #[test]
    fn he_symbol_generation_matches_contract_months() {
        let symbols = generate_he_symbols(day(2023, 1, 1), day(2027, 8, 12));
        assert!(symbols.contains(&"HEG23".to_string()));
        assert!(symbols.contains(&"HEZ26".to_string()));
        assert!(symbols.contains(&"HEQ27".to_string()));
        assert_eq!(symbols.len(), 40);
    }

    #[test]
    fn add_months_clamps_and_rolls_years() {
        assert_eq!(add_months(day(2026, 2, 12), 18), day(2027, 8, 12));
        assert_eq!(add_months(day(2024, 1, 31), 1), day(2024, 2, 29));
        assert_eq!(add_months(day(2023, 1, 31), 1), day(2023, 2, 28));
    }

    #[test]
    fn future_symbols_exclude_expired_contracts() {
        let symbols = generate_he_symbols_future(day(2026, 2, 12), day(2027, 6, 1));
        assert!(symbols.contains(&"HEG26".to_string()));
        assert!(!symbols.contains(&"HEZ25".to_string()));
    }

    #[test]
    fn quote_tick_extraction_tolerates_vendor_shapes() {
        let tick = quote_tick_from_payload(&json!([
            {"ticker": "HEJ26", "last_price": "88.5", "updated": 1760000000}
        ]))
        .expect("tick");
        assert_eq!(tick.symbol, "HEJ26");
        assert_eq!(tick.price, Some(88.5));
        assert_eq!(tick.timestamp, Some(1_760_000_000));

        assert!(quote_tick_from_payload(&json!({"price": 1.0})).is_none());
    }

    #[tokio::test]
    async fn log_notifier_reports_its_recipient() {
        let notifier = LogNotifier::new("alerts@example.com");
        let receipt = notifier.send_test_alert().await.expect("test alert");
        assert_eq!(receipt.recipient, "alerts@example.com");
        notifier.send_alert("PK600", 3).await.expect("send alert");
    }
}
