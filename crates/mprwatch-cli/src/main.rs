use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use mprwatch_engine::{Engine, EngineConfig};
use mprwatch_feeds::{
    BackoffPolicy, CommodityApiClient, DatamartClient, HttpClientConfig, HttpFetcher, LogNotifier,
    ReportRegistry,
};
use mprwatch_storage::Warehouse;

#[derive(Debug, Parser)]
#[command(name = "mprwatch-cli")]
#[command(about = "Market price report watch command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the API server with the polling scheduler.
    Serve,
    /// Execute one fetch cycle for a report and print the run outcome.
    Run { report_id: String },
    /// Bulk-ingest a historical date range for a report.
    Gather {
        report_id: String,
        start_date: NaiveDate,
        end_date: NaiveDate,
    },
    /// Queue a backfill over the active symbol universe and wait for it.
    Backfill {
        start_date: NaiveDate,
        end_date: NaiveDate,
        /// Rehearse on exactly two symbols instead of the full universe.
        #[arg(long)]
        test: bool,
    },
    /// Print the cost projection for a backfill date range.
    EstimateCost {
        start_date: NaiveDate,
        end_date: NaiveDate,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let engine = build_engine().await?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let port: u16 = std::env::var("MPRWATCH_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000);
            let _scheduler = engine.scheduler().start().await?;
            mprwatch_web::serve(engine, port).await?;
        }
        Commands::Run { report_id } => {
            let run = engine.tracker.execute_cycle(&report_id).await?;
            println!(
                "run {} for {}: {} (attempt {})",
                run.id,
                run.report_id,
                run.state.as_str(),
                run.attempt
            );
        }
        Commands::Gather {
            report_id,
            start_date,
            end_date,
        } => {
            let summary = engine
                .tracker
                .gather_range(&report_id, start_date, end_date)
                .await?;
            println!(
                "gather complete: inserted={} skipped={}",
                summary.inserted, summary.skipped
            );
        }
        Commands::Backfill {
            start_date,
            end_date,
            test,
        } => {
            let universe = engine.history_universe();
            let job = if test {
                engine
                    .backfill
                    .run_test_backfill(&universe, start_date, end_date)
                    .await
            } else {
                engine.backfill.run_backfill(universe, start_date, end_date).await
            };
            println!("job {} queued over {} symbols", job.job_id, job.symbols.len());
            engine.backfill.wait(job.job_id).await;
            let finished = engine
                .warehouse
                .jobs
                .get(job.job_id)
                .await
                .context("job disappeared")?;
            println!(
                "job {} finished: {}{}",
                finished.job_id,
                finished.status.as_str(),
                finished
                    .last_error
                    .map(|e| format!(" (last error: {e})"))
                    .unwrap_or_default()
            );
        }
        Commands::EstimateCost {
            start_date,
            end_date,
        } => {
            let universe = engine.history_universe();
            let estimate = engine.backfill.estimate_cost(&universe, start_date, end_date);
            println!(
                "estimated cost: {:.2} over {} symbols",
                estimate.estimated_cost, estimate.symbol_count
            );
        }
    }

    Ok(())
}

async fn build_engine() -> Result<Arc<Engine>> {
    let config = EngineConfig::from_env();

    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some("mprwatch/0.1".to_string()),
        backoff: BackoffPolicy {
            max_retries: config.attempt_ceiling,
            ..Default::default()
        },
        ..Default::default()
    })?;
    let bulletins = Arc::new(DatamartClient::new(http));

    let market_base = std::env::var("MPRWATCH_MARKET_BASE_URL")
        .unwrap_or_else(|_| "https://api.api-ninjas.com/v1".to_string());
    let market_key = std::env::var("MPRWATCH_MARKET_API_KEY").unwrap_or_default();
    let market_rate: f64 = std::env::var("MPRWATCH_MARKET_RATE_PER_SYMBOL_DAY")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0.45);
    let markets = Arc::new(CommodityApiClient::new(
        market_base,
        market_key,
        market_rate,
        Duration::from_secs(config.http_timeout_secs),
    )?);

    let notifier = Arc::new(LogNotifier::new(config.master_alert_email.clone()));

    let registry = match std::env::var("MPRWATCH_REGISTRY") {
        Ok(path) => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading registry file {path}"))?;
            ReportRegistry::from_yaml_str(&text)?
        }
        Err(_) => ReportRegistry::builtin(),
    };

    let engine = Arc::new(Engine::new(
        config,
        Arc::new(Warehouse::new()),
        bulletins,
        markets,
        notifier,
    ));
    engine.seed(&registry).await;
    Ok(engine)
}
