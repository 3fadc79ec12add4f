//! Axum JSON API for mprwatch. Serves the shape-stable contracts the
//! dashboard consumes; no HTML is rendered here.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use mprwatch_core::{EventType, Run, Version};
use mprwatch_engine::Engine;
use mprwatch_storage::{EventFilter, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::info;
use uuid::Uuid;

pub const CRATE_NAME: &str = "mprwatch-web";

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            started_at: Utc::now(),
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/reports", get(reports_handler))
        .route("/api/reports/{report_id}/runs", get(report_runs_handler))
        .route("/api/reports/{report_id}/latest", get(report_latest_handler))
        .route(
            "/api/reports/{report_id}/historicals",
            get(report_historicals_handler),
        )
        .route(
            "/api/reports/{report_id}/config",
            get(report_config_handler).put(report_config_update_handler),
        )
        .route("/api/reports/{report_id}/gather", post(report_gather_handler))
        .route("/api/reports/{report_id}/run", post(report_run_handler))
        .route("/api/alerts", get(alerts_handler))
        .route("/api/logs", get(logs_handler))
        .route("/api/logs/test-alert", post(test_alert_handler))
        .route("/api/logs/clear", post(logs_clear_handler))
        .route("/api/markets/contracts", get(markets_contracts_handler))
        .route("/api/markets/quote-symbols", get(markets_quote_symbols_handler))
        .route("/api/markets/quotes", get(markets_quotes_handler))
        .route("/api/markets/quotes/refresh", post(markets_quotes_refresh_handler))
        .route("/api/markets/history", get(markets_history_handler))
        .route("/api/markets/history/meta", get(markets_history_meta_handler))
        .route("/api/markets/backfill/cost", post(backfill_cost_handler))
        .route("/api/markets/backfill/run", post(backfill_run_handler))
        .route("/api/markets/backfill/test", post(backfill_test_handler))
        .route("/api/markets/backfill/jobs", get(backfill_jobs_handler))
        .route(
            "/api/markets/backfill/{job_id}/cancel",
            post(backfill_cancel_handler),
        )
        .route(
            "/api/recipients",
            get(recipients_handler).post(recipients_create_handler),
        )
        .route(
            "/api/recipients/{recipient_id}",
            put(recipients_update_handler).delete(recipients_delete_handler),
        )
        .route(
            "/api/recipients/{recipient_id}/reports",
            put(recipients_reports_handler),
        )
        .with_state(Arc::new(state))
}

pub async fn serve(engine: Arc<Engine>, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "api listening");
    axum::serve(listener, app(AppState::new(engine))).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Error envelope

/// Classified kind + human message; internal detail never leaks past here.
struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: "bad_request",
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            kind: "not_found",
            message: message.into(),
        }
    }

    fn internal(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            kind: "internal",
            message: err.to_string(),
        }
    }

    fn upstream(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_GATEWAY,
            kind: "upstream",
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "error": { "kind": self.kind, "message": self.message } })),
        )
            .into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let status = match &err {
            StoreError::RunNotFound(_)
            | StoreError::JobNotFound(_)
            | StoreError::ReportNotFound(_)
            | StoreError::RecipientNotFound(_) => StatusCode::NOT_FOUND,
            StoreError::DuplicateEmail(_) | StoreError::RunImmutable(_) => StatusCode::CONFLICT,
        };
        Self {
            status,
            kind: "store",
            message: err.to_string(),
        }
    }
}

fn parse_date(value: &str) -> ApiResult<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|_| ApiError::bad_request("invalid date format (expected YYYY-MM-DD)"))
}

fn parse_date_opt(value: &Option<String>) -> ApiResult<Option<NaiveDate>> {
    value.as_deref().map(parse_date).transpose()
}

fn parse_range(start: &str, end: &str) -> ApiResult<(NaiveDate, NaiveDate)> {
    let start = parse_date(start)?;
    let end = parse_date(end)?;
    if start > end {
        return Err(ApiError::bad_request("start_date must be <= end_date"));
    }
    Ok((start, end))
}

// ---------------------------------------------------------------------------
// Reports

#[derive(Serialize)]
struct ReportSummary {
    report_id: String,
    name: String,
    latest_run: Option<Run>,
    latest_version: Option<VersionSummary>,
}

#[derive(Serialize)]
struct VersionSummary {
    id: Uuid,
    report_id: String,
    report_date: NaiveDate,
    payload_hash: String,
    created_at: DateTime<Utc>,
}

impl From<Version> for VersionSummary {
    fn from(version: Version) -> Self {
        Self {
            id: version.id,
            report_id: version.report_id,
            report_date: version.report_date,
            payload_hash: version.payload_hash,
            created_at: version.created_at,
        }
    }
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let uptime = (Utc::now() - state.started_at).num_seconds();
    let reports = state.engine.warehouse.catalog.list().await.len();
    Json(json!({ "status": "ok", "uptime_seconds": uptime, "reports": reports }))
}

async fn reports_handler(State(state): State<Arc<AppState>>) -> Json<Vec<ReportSummary>> {
    let engine = &state.engine;
    let reports = engine.warehouse.catalog.list().await;
    let mut latest_runs = engine.warehouse.runs.latest_per_report().await;
    let mut latest_versions = engine.warehouse.versions.latest_per_report().await;
    let summaries = reports
        .into_iter()
        .map(|r| ReportSummary {
            latest_run: latest_runs.remove(&r.report_id),
            latest_version: latest_versions.remove(&r.report_id).map(VersionSummary::from),
            report_id: r.report_id,
            name: r.name,
        })
        .collect();
    Json(summaries)
}

#[derive(Debug, Deserialize, Default)]
struct LimitQuery {
    limit: Option<usize>,
}

async fn report_runs_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(report_id): AxumPath<String>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Json<Vec<Run>>> {
    require_report(&state, &report_id).await?;
    let runs = state
        .engine
        .warehouse
        .runs
        .list_for_report(&report_id, query.limit.unwrap_or(50))
        .await;
    Ok(Json(runs))
}

async fn report_latest_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(report_id): AxumPath<String>,
) -> ApiResult<Json<Value>> {
    let version = state
        .engine
        .warehouse
        .versions
        .latest(&report_id)
        .await
        .ok_or_else(|| ApiError::not_found("no version found"))?;
    Ok(Json(json!({
        "report_id": version.report_id,
        "report_date": version.report_date,
        "payload_hash": version.payload_hash,
        "parsed_fields": version.parsed_fields,
        "source_urls": version.source_urls,
        "created_at": version.created_at,
    })))
}

#[derive(Debug, Deserialize, Default)]
struct HistoricalsQuery {
    start_date: Option<String>,
    end_date: Option<String>,
    limit: Option<usize>,
}

async fn report_historicals_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(report_id): AxumPath<String>,
    Query(query): Query<HistoricalsQuery>,
) -> ApiResult<Json<Vec<Value>>> {
    require_report(&state, &report_id).await?;
    let start = parse_date_opt(&query.start_date)?;
    let end = parse_date_opt(&query.end_date)?;
    let versions = state
        .engine
        .warehouse
        .versions
        .historicals(&report_id, start, end, query.limit.unwrap_or(500))
        .await;
    let rows = versions
        .into_iter()
        .map(|v| {
            json!({
                "report_id": v.report_id,
                "report_date": v.report_date,
                "payload_hash": v.payload_hash,
                "parsed_fields": v.parsed_fields,
                "created_at": v.created_at,
            })
        })
        .collect();
    Ok(Json(rows))
}

async fn report_config_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(report_id): AxumPath<String>,
) -> ApiResult<Json<Value>> {
    let config = state.engine.warehouse.catalog.config(&report_id).await?;
    Ok(Json(config))
}

async fn report_config_update_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(report_id): AxumPath<String>,
    Json(payload): Json<Value>,
) -> ApiResult<Json<Value>> {
    // passthrough with shape validation only; the engine re-reads the
    // document on the next cycle
    let parsed = mprwatch_feeds::ReportDefinition::from_config_json(payload.clone())
        .map_err(|err| ApiError::bad_request(format!("invalid config shape: {err}")))?;
    if parsed.report_id != report_id {
        return Err(ApiError::bad_request("report_id mismatch"));
    }
    state
        .engine
        .warehouse
        .catalog
        .set_config(&report_id, parsed.name.clone(), payload)
        .await?;
    Ok(Json(json!({ "status": "updated" })))
}

#[derive(Debug, Deserialize)]
struct DateRangeBody {
    start_date: String,
    end_date: String,
}

async fn report_gather_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(report_id): AxumPath<String>,
    Json(body): Json<DateRangeBody>,
) -> ApiResult<Json<Value>> {
    require_report(&state, &report_id).await?;
    let (start, end) = parse_range(&body.start_date, &body.end_date)?;
    let summary = state
        .engine
        .tracker
        .gather_range(&report_id, start, end)
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(json!({
        "status": "ok",
        "inserted": summary.inserted,
        "skipped": summary.skipped,
    })))
}

async fn report_run_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(report_id): AxumPath<String>,
) -> ApiResult<Json<Value>> {
    require_report(&state, &report_id).await?;
    let tracker = state.engine.tracker.clone();
    let id = report_id.clone();
    tokio::spawn(async move {
        if let Err(err) = tracker.execute_cycle(&id).await {
            tracing::warn!(report_id = %id, error = %err, "triggered cycle failed");
        }
    });
    Ok(Json(json!({ "status": "started", "report_id": report_id })))
}

async fn require_report(state: &Arc<AppState>, report_id: &str) -> ApiResult<()> {
    if state.engine.warehouse.catalog.contains(report_id).await {
        Ok(())
    } else {
        Err(ApiError::not_found("report not found"))
    }
}

// ---------------------------------------------------------------------------
// Alerts and logs

async fn alerts_handler(State(state): State<Arc<AppState>>) -> Json<Vec<mprwatch_core::AlertState>> {
    Json(state.engine.alerts.list().await)
}

#[derive(Debug, Deserialize, Default)]
struct LogsQuery {
    event_type: Option<String>,
    report_id: Option<String>,
    start_date: Option<String>,
    end_date: Option<String>,
    limit: Option<usize>,
}

async fn logs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Json<Vec<mprwatch_core::LogEvent>>> {
    let event_type = match &query.event_type {
        Some(raw) => Some(
            EventType::parse(raw)
                .ok_or_else(|| ApiError::bad_request(format!("unknown event_type: {raw}")))?,
        ),
        None => None,
    };
    let from = parse_date_opt(&query.start_date)?
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc());
    let to = parse_date_opt(&query.end_date)?
        .and_then(|d| d.and_hms_opt(23, 59, 59))
        .map(|dt| dt.and_utc());
    let filter = EventFilter {
        event_type,
        report_id: query.report_id.clone(),
        from,
        to,
        limit: query.limit,
    };
    Ok(Json(state.engine.warehouse.events.query(&filter).await))
}

async fn test_alert_handler(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    let receipt = state
        .engine
        .alerts
        .send_test_alert()
        .await
        .map_err(|err| ApiError::upstream(format!("failed to send test alert: {err}")))?;
    Ok(Json(json!({ "status": "sent", "recipient": receipt.recipient })))
}

async fn logs_clear_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let counts = state.engine.warehouse.clear_history().await;
    Json(json!({
        "deleted_events": counts.deleted_events,
        "deleted_runs": counts.deleted_runs,
        "deleted_versions": counts.deleted_versions,
    }))
}

// ---------------------------------------------------------------------------
// Markets

async fn markets_contracts_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "symbols": state.engine.history_universe() }))
}

async fn markets_quote_symbols_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "symbols": state.engine.quote_universe() }))
}

#[derive(Debug, Deserialize, Default)]
struct QuotesQuery {
    symbols: Option<String>,
}

async fn markets_quotes_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<QuotesQuery>,
) -> Json<Vec<mprwatch_core::MarketQuote>> {
    let symbols: Option<Vec<String>> = query
        .symbols
        .map(|csv| csv.split(',').map(|s| s.trim().to_string()).collect());
    Json(state.engine.quotes.cached(symbols.as_deref()).await)
}

#[derive(Debug, Deserialize, Default)]
struct RefreshBody {
    symbols: Option<Vec<String>>,
}

async fn markets_quotes_refresh_handler(
    State(state): State<Arc<AppState>>,
    body: Option<Json<RefreshBody>>,
) -> ApiResult<Json<Value>> {
    let symbols = body
        .and_then(|Json(b)| b.symbols)
        .unwrap_or_else(|| state.engine.quote_universe());
    let summary = state
        .engine
        .quotes
        .refresh(symbols)
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(json!({
        "status": "ok",
        "updated": summary.updated,
        "failed": summary.failed,
    })))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    symbol: String,
    start_date: Option<String>,
    end_date: Option<String>,
}

async fn markets_history_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<Vec<Value>>> {
    let start = parse_date_opt(&query.start_date)?;
    let end = parse_date_opt(&query.end_date)?;
    let bars = state
        .engine
        .warehouse
        .bars
        .history(&query.symbol, start, end)
        .await;
    let rows = bars
        .into_iter()
        .map(|b| {
            json!({
                "date": b.trade_date,
                "open": b.open,
                "high": b.high,
                "low": b.low,
                "close": b.close,
                "volume": b.volume,
                "open_interest": b.open_interest,
            })
        })
        .collect();
    Ok(Json(rows))
}

#[derive(Debug, Deserialize)]
struct SymbolQuery {
    symbol: String,
}

async fn markets_history_meta_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SymbolQuery>,
) -> ApiResult<Json<Value>> {
    let (min_date, max_date) = state
        .engine
        .warehouse
        .bars
        .date_span(&query.symbol)
        .await
        .ok_or_else(|| ApiError::not_found("no data for symbol"))?;
    Ok(Json(json!({
        "symbol": query.symbol,
        "min_date": min_date,
        "max_date": max_date,
    })))
}

async fn backfill_cost_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<DateRangeBody>,
) -> ApiResult<Json<Value>> {
    let (start, end) = parse_range(&body.start_date, &body.end_date)?;
    let universe = state.engine.history_universe();
    let estimate = state.engine.backfill.estimate_cost(&universe, start, end);
    Ok(Json(json!({
        "estimated_cost": estimate.estimated_cost,
        "symbol_count": estimate.symbol_count,
    })))
}

async fn backfill_run_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<DateRangeBody>,
) -> ApiResult<Json<Value>> {
    let (start, end) = parse_range(&body.start_date, &body.end_date)?;
    let universe = state.engine.history_universe();
    let job = state.engine.backfill.run_backfill(universe, start, end).await;
    Ok(Json(json!({ "job_id": job.job_id, "status": job.status })))
}

async fn backfill_test_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<DateRangeBody>,
) -> ApiResult<Json<Value>> {
    let (start, end) = parse_range(&body.start_date, &body.end_date)?;
    let universe = state.engine.history_universe();
    let job = state
        .engine
        .backfill
        .run_test_backfill(&universe, start, end)
        .await;
    Ok(Json(json!({
        "job_id": job.job_id,
        "status": job.status,
        "symbols": job.symbols,
    })))
}

async fn backfill_jobs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> Json<Vec<Value>> {
    let jobs = state.engine.backfill.list_jobs().await;
    let rows = jobs
        .into_iter()
        .take(query.limit.unwrap_or(20))
        .map(|j| {
            json!({
                "job_id": j.job_id,
                "status": j.status,
                "symbol_count": j.symbols.len(),
                "start_date": j.start_date,
                "end_date": j.end_date,
                "updated_at": j.updated_at,
                "last_error": j.last_error,
            })
        })
        .collect();
    Json(rows)
}

async fn backfill_cancel_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(job_id): AxumPath<Uuid>,
) -> ApiResult<Json<Value>> {
    if state.engine.backfill.cancel(job_id).await {
        Ok(Json(json!({ "status": "cancelling", "job_id": job_id })))
    } else {
        Err(ApiError::not_found("no cancellable job with that id"))
    }
}

// ---------------------------------------------------------------------------
// Recipients

#[derive(Serialize)]
struct RecipientRow {
    id: Uuid,
    email: String,
    name: Option<String>,
    is_active: bool,
    report_ids: Vec<String>,
}

async fn recipients_handler(State(state): State<Arc<AppState>>) -> Json<Vec<RecipientRow>> {
    let rows = state
        .engine
        .warehouse
        .recipients
        .list()
        .await
        .into_iter()
        .map(|r| RecipientRow {
            id: r.recipient.id,
            email: r.recipient.email,
            name: r.recipient.name,
            is_active: r.recipient.is_active,
            report_ids: r.report_ids,
        })
        .collect();
    Json(rows)
}

#[derive(Debug, Deserialize)]
struct RecipientCreateBody {
    email: String,
    name: Option<String>,
    is_active: Option<bool>,
    report_ids: Option<Vec<String>>,
}

async fn recipients_create_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RecipientCreateBody>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let email = validate_email(&body.email)?;
    let report_ids = validate_report_ids(&state, body.report_ids.unwrap_or_default()).await?;
    let recipient = state
        .engine
        .warehouse
        .recipients
        .create(
            &email,
            body.name.and_then(clean_optional),
            body.is_active.unwrap_or(true),
            report_ids,
        )
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "status": "created", "id": recipient.id })),
    ))
}

#[derive(Debug, Deserialize)]
struct RecipientUpdateBody {
    email: Option<String>,
    /// An empty string clears the stored name.
    name: Option<String>,
    is_active: Option<bool>,
}

async fn recipients_update_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(recipient_id): AxumPath<Uuid>,
    Json(body): Json<RecipientUpdateBody>,
) -> ApiResult<Json<Value>> {
    let email = body.email.as_deref().map(validate_email).transpose()?;
    let name = body.name.map(clean_optional);
    state
        .engine
        .warehouse
        .recipients
        .update(recipient_id, email, name, body.is_active)
        .await?;
    Ok(Json(json!({ "status": "updated" })))
}

#[derive(Debug, Deserialize)]
struct RecipientReportsBody {
    report_ids: Vec<String>,
}

async fn recipients_reports_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(recipient_id): AxumPath<Uuid>,
    Json(body): Json<RecipientReportsBody>,
) -> ApiResult<Json<Value>> {
    let report_ids = validate_report_ids(&state, body.report_ids).await?;
    state
        .engine
        .warehouse
        .recipients
        .set_reports(recipient_id, report_ids.clone())
        .await?;
    Ok(Json(json!({ "status": "updated", "report_ids": report_ids })))
}

async fn recipients_delete_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(recipient_id): AxumPath<Uuid>,
) -> ApiResult<Json<Value>> {
    state.engine.warehouse.recipients.delete(recipient_id).await?;
    Ok(Json(json!({ "status": "deleted" })))
}

fn validate_email(raw: &str) -> ApiResult<String> {
    let email = raw.trim().to_ascii_lowercase();
    if email.is_empty() {
        return Err(ApiError::bad_request("recipient email is required"));
    }
    let Some((local, domain)) = email.split_once('@') else {
        return Err(ApiError::bad_request("recipient email must contain '@'"));
    };
    if local.is_empty() || !domain.contains('.') {
        return Err(ApiError::bad_request("recipient email format is invalid"));
    }
    Ok(email)
}

fn clean_optional(value: String) -> Option<String> {
    let cleaned = value.trim().to_string();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

async fn validate_report_ids(
    state: &Arc<AppState>,
    raw: Vec<String>,
) -> ApiResult<Vec<String>> {
    let mut deduped = Vec::new();
    for report_id in raw {
        let report_id = report_id.trim().to_string();
        if report_id.is_empty() || deduped.contains(&report_id) {
            continue;
        }
        if !state.engine.warehouse.catalog.contains(&report_id).await {
            return Err(ApiError::bad_request(format!("unknown report id: {report_id}")));
        }
        deduped.push(report_id);
    }
    Ok(deduped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header, Request};
    use chrono::NaiveDate;
    use http_body_util::BodyExt;
    use mprwatch_core::OhlcvBar;
    use mprwatch_engine::EngineConfig;
    use mprwatch_feeds::{
        BulletinSource, FeedError, FetchOutcome, LogNotifier, MarketDataSource, ParsedBulletin,
        QuoteTick, ReportDefinition, ReportRegistry,
    };
    use mprwatch_storage::Warehouse;
    use tower::ServiceExt;

    struct QuietBulletins;

    #[async_trait]
    impl BulletinSource for QuietBulletins {
        async fn fetch_current(
            &self,
            _definition: &ReportDefinition,
            _as_of: NaiveDate,
        ) -> Result<FetchOutcome, FeedError> {
            Ok(FetchOutcome::NotPublished)
        }

        async fn fetch_range(
            &self,
            _definition: &ReportDefinition,
            _start: NaiveDate,
            _end: NaiveDate,
        ) -> Result<Vec<ParsedBulletin>, FeedError> {
            Ok(Vec::new())
        }
    }

    struct SteadyMarket;

    #[async_trait]
    impl MarketDataSource for SteadyMarket {
        async fn fetch_quotes(&self, symbols: &[String]) -> Result<Vec<QuoteTick>, FeedError> {
            Ok(symbols
                .iter()
                .map(|s| QuoteTick {
                    symbol: s.clone(),
                    price: Some(90.0),
                    timestamp: Some(1_760_000_000),
                })
                .collect())
        }

        async fn fetch_historical_bar(
            &self,
            symbol: &str,
            date: NaiveDate,
        ) -> Result<Option<OhlcvBar>, FeedError> {
            Ok(Some(OhlcvBar {
                symbol: symbol.to_string(),
                trade_date: date,
                open: Some(1.0),
                high: Some(1.0),
                low: Some(1.0),
                close: Some(1.0),
                volume: Some(1.0),
                open_interest: None,
            }))
        }

        fn rate_per_symbol_day(&self) -> f64 {
            0.45
        }
    }

    async fn test_app() -> Router {
        let engine = Arc::new(Engine::new(
            EngineConfig::default(),
            Arc::new(Warehouse::new()),
            Arc::new(QuietBulletins),
            Arc::new(SteadyMarket),
            Arc::new(LogNotifier::new("ops@example.test")),
        ));
        engine.seed(&ReportRegistry::builtin()).await;
        app(AppState::new(engine))
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).expect("request")
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    async fn body_json(resp: Response) -> Value {
        let bytes = resp.into_body().collect().await.expect("body").to_bytes();
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn health_reports_status_and_report_count() {
        let app = test_app().await;
        let resp = app.oneshot(get_request("/api/health")).await.expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["reports"], 5);
    }

    #[tokio::test]
    async fn reports_list_joins_latest_run_and_version() {
        let app = test_app().await;
        let resp = app.oneshot(get_request("/api/reports")).await.expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        let rows = body.as_array().expect("array");
        assert_eq!(rows.len(), 5);
        assert!(rows.iter().any(|r| r["report_id"] == "PK600_MORNING_CASH"));
        assert!(rows[0]["latest_run"].is_null());
        assert!(rows[0]["latest_version"].is_null());
    }

    #[tokio::test]
    async fn latest_is_404_until_a_version_exists() {
        let app = test_app().await;
        let resp = app
            .oneshot(get_request("/api/reports/PK600_MORNING_CASH/latest"))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body = body_json(resp).await;
        assert_eq!(body["error"]["kind"], "not_found");
    }

    #[tokio::test]
    async fn run_trigger_starts_for_known_reports_only() {
        let app = test_app().await;
        let resp = app
            .clone()
            .oneshot(post_json("/api/reports/PK600_MORNING_CASH/run", json!({})))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "started");

        let resp = app
            .oneshot(post_json("/api/reports/NOPE/run", json!({})))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn gather_rejects_inverted_ranges() {
        let app = test_app().await;
        let resp = app
            .oneshot(post_json(
                "/api/reports/PK600_MORNING_CASH/gather",
                json!({ "start_date": "2024-02-01", "end_date": "2024-01-01" }),
            ))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn config_roundtrip_validates_shape_and_id() {
        let app = test_app().await;
        let resp = app
            .clone()
            .oneshot(get_request("/api/reports/HG201_CME_INDEX/config"))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        let config = body_json(resp).await;
        assert_eq!(config["report_id"], "HG201_CME_INDEX");

        // same document back is accepted
        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/api/reports/HG201_CME_INDEX/config")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(config.to_string()))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);

        // posting it under another report id is a mismatch
        let resp = app
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/api/reports/PK600_MORNING_CASH/config")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(config.to_string()))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn logs_clear_returns_exact_counts() {
        let app = test_app().await;
        let resp = app
            .oneshot(post_json("/api/logs/clear", json!({})))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["deleted_events"], 0);
        assert_eq!(body["deleted_runs"], 0);
        assert_eq!(body["deleted_versions"], 0);
    }

    #[tokio::test]
    async fn logs_reject_unknown_event_types() {
        let app = test_app().await;
        let resp = app
            .oneshot(get_request("/api/logs?event_type=no_such_event"))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_alert_reports_the_delivery_recipient() {
        let app = test_app().await;
        let resp = app
            .oneshot(post_json("/api/logs/test-alert", json!({})))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["status"], "sent");
        assert_eq!(body["recipient"], "ops@example.test");
    }

    #[tokio::test]
    async fn backfill_cost_and_test_run_shapes() {
        let app = test_app().await;
        let range = json!({ "start_date": "2024-01-01", "end_date": "2024-01-31" });

        let resp = app
            .clone()
            .oneshot(post_json("/api/markets/backfill/cost", range.clone()))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        let cost = body_json(resp).await;
        assert!(cost["symbol_count"].as_u64().expect("count") > 0);
        assert!(cost["estimated_cost"].as_f64().expect("cost") > 0.0);

        let resp = app
            .clone()
            .oneshot(post_json("/api/markets/backfill/test", range))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        let job = body_json(resp).await;
        assert_eq!(job["status"], "queued");
        assert_eq!(job["symbols"].as_array().expect("symbols").len(), 2);

        let resp = app
            .oneshot(get_request("/api/markets/backfill/jobs"))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        let jobs = body_json(resp).await;
        assert_eq!(jobs.as_array().expect("jobs").len(), 1);
    }

    #[tokio::test]
    async fn quote_refresh_and_cache_round_trip() {
        let app = test_app().await;
        let resp = app
            .clone()
            .oneshot(post_json(
                "/api/markets/quotes/refresh",
                json!({ "symbols": ["HEJ26", "HEK26"] }),
            ))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["updated"], 2);
        assert!(body["failed"].as_array().expect("failed").is_empty());

        let resp = app
            .oneshot(get_request("/api/markets/quotes?symbols=HEJ26"))
            .await
            .expect("response");
        let quotes = body_json(resp).await;
        assert_eq!(quotes.as_array().expect("quotes").len(), 1);
        assert_eq!(quotes[0]["symbol"], "HEJ26");
    }

    #[tokio::test]
    async fn recipient_lifecycle_with_validation() {
        let app = test_app().await;

        let resp = app
            .clone()
            .oneshot(post_json(
                "/api/recipients",
                json!({ "email": "Desk@Example.com", "report_ids": ["PK600_MORNING_CASH"] }),
            ))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::CREATED);

        // duplicate email conflicts (emails are normalized to lowercase)
        let resp = app
            .clone()
            .oneshot(post_json("/api/recipients", json!({ "email": "desk@example.com" })))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = app
            .clone()
            .oneshot(post_json("/api/recipients", json!({ "email": "not-an-email" })))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = app
            .clone()
            .oneshot(post_json(
                "/api/recipients",
                json!({ "email": "other@example.com", "report_ids": ["NOPE"] }),
            ))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = app.oneshot(get_request("/api/recipients")).await.expect("response");
        let rows = body_json(resp).await;
        let rows = rows.as_array().expect("rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["email"], "desk@example.com");
        assert_eq!(rows[0]["report_ids"], json!(["PK600_MORNING_CASH"]));
    }
}
