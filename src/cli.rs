// src/cli.rs
use crate::aggregator::Period;
use crate::config::AppConfig;
use crate::error::{FetchError, QueryError};
use crate::indicators::{IndicatorRegistry, IndicatorSpec};
use crate::models::RawBarRecord;
use crate::processor::{BarQuery, BarSource, JsonFileBarSource, QueryRequest, QueryResult, QueryService, UpdateCallback};
use crate::stream::{FeedTransport, WsTransport};
use crate::utils::system_clock;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "kline-analytics")]
#[command(about = "Bar aggregation, technical indicators and live feed CLI", long_about = None)]
pub struct Cli {
    /// Configuration file (defaults to ./kline-analytics.toml when present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Aggregate bars from a JSON file and compute indicators
    Query {
        /// JSON file with raw daily bar records
        #[arg(short, long)]
        file: PathBuf,

        /// Instrument code (e.g., "600519")
        #[arg(short, long)]
        instrument: String,

        /// Period: day, week or month
        #[arg(short, long, default_value = "day")]
        period: Period,

        /// First date to include (YYYY-MM-DD)
        #[arg(long)]
        start: Option<NaiveDate>,

        /// Last date to include (YYYY-MM-DD)
        #[arg(long)]
        end: Option<NaiveDate>,

        /// Indicator as id or id:name=value,... (repeatable), e.g. "sma20" or "macd:fastPeriod=10"
        #[arg(long = "indicator")]
        indicators: Vec<IndicatorSpec>,

        /// Number of trailing bars to print
        #[arg(long, default_value = "10")]
        tail: usize,

        /// Export the full result to a JSON file
        #[arg(long)]
        export: Option<PathBuf>,
    },

    /// List the built-in indicator templates
    Indicators,

    /// Follow the live feed for an instrument and print refreshed results
    Watch {
        /// Instrument code
        #[arg(short, long)]
        instrument: String,

        /// JSON file with the daily history to start from
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Period: day, week or month
        #[arg(short, long, default_value = "day")]
        period: Period,

        /// Indicator as id or id:name=value,... (repeatable)
        #[arg(long = "indicator")]
        indicators: Vec<IndicatorSpec>,
    },
}

/// Bar source with no history, for watching a feed from scratch.
struct EmptyBarSource;

#[async_trait]
impl BarSource for EmptyBarSource {
    async fn fetch_bars(&self, _query: &BarQuery) -> Result<Vec<RawBarRecord>, FetchError> {
        Ok(Vec::new())
    }
}

/// Execute a command from the CLI
pub async fn execute_command(cli: Cli) -> Result<()> {
    let config = AppConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Query {
            file,
            instrument,
            period,
            start,
            end,
            indicators,
            tail,
            export,
        } => {
            let source: Arc<dyn BarSource> = Arc::new(JsonFileBarSource::new(&file));
            let service = QueryService::new(source, None, &config, system_clock());

            let mut request = QueryRequest::new(instrument, period).with_range(start, end);
            request.indicators = indicators;

            let result = service
                .query(request)
                .await
                .with_context(|| format!("Query against {} failed", file.display()))?;

            print_result(&result, tail);

            if let Some(export_path) = export {
                let json = serde_json::to_string_pretty(result.as_ref())?;
                std::fs::write(&export_path, json)
                    .with_context(|| format!("Failed to write {}", export_path.display()))?;
                println!("\nResult exported to: {}", export_path.display());
            }
            service.dispose();
        }

        Commands::Indicators => {
            let registry = IndicatorRegistry::builtin();
            println!("{:<10} | {:<14} | {:<10} | {:<8} | {:<5} | {}", "ID", "Name", "Category", "Color", "Width", "Default spec");
            println!("{:-<10}-+-{:-<14}-+-{:-<10}-+-{:-<8}-+-{:-<5}-+-{:-<30}", "", "", "", "", "", "");
            for t in registry.templates() {
                println!(
                    "{:<10} | {:<14} | {:<10} | {:<8} | {:<5} | {}",
                    t.id,
                    t.name,
                    t.category,
                    t.color,
                    t.line_width,
                    t.to_spec().fingerprint()
                );
            }
        }

        Commands::Watch {
            instrument,
            file,
            period,
            indicators,
        } => {
            let ws_url = match config.stream.ws_url.clone() {
                Some(url) => url,
                None => bail!("stream.ws_url is not configured (set it in the config file or KLINE__STREAM__WS_URL)"),
            };
            let source: Arc<dyn BarSource> = match &file {
                Some(path) => Arc::new(JsonFileBarSource::new(path)),
                None => Arc::new(EmptyBarSource),
            };
            let transport: Arc<dyn FeedTransport> = Arc::new(WsTransport::new(ws_url));
            let service = Arc::new(QueryService::new(source, Some(transport), &config, system_clock()));
            service.start();

            let mut request = QueryRequest::new(instrument.clone(), period);
            request.indicators = indicators;

            let (failure_tx, mut failure_rx) = mpsc::unbounded_channel::<QueryError>();
            let on_update: UpdateCallback = Arc::new(move |update: Result<Arc<QueryResult>, QueryError>| match update {
                Ok(result) => print_update(&result),
                Err(e) => {
                    error!("Live feed failed: {}", e);
                    let _ = failure_tx.send(e);
                }
            });
            let subscription = service.subscribe(request, on_update).await?;
            println!(
                "Watching {} ({} bars loaded). Press Ctrl-C to stop.",
                instrument,
                subscription.initial().bars.len()
            );

            let failure = wait_for_watch_end(tokio::signal::ctrl_c(), &mut failure_rx).await?;
            if failure.is_none() {
                info!("Stopping watch for {}", instrument);
            }
            subscription.unsubscribe();
            service.dispose();

            if let Some(e) = failure {
                return Err(e).with_context(|| format!("Live feed for {} ended", instrument));
            }
        }
    }

    Ok(())
}

/// Wait for either the stop signal or a terminal feed failure, whichever comes first.
async fn wait_for_watch_end<F>(stop: F, failures: &mut mpsc::UnboundedReceiver<QueryError>) -> Result<Option<QueryError>>
where
    F: Future<Output = std::io::Result<()>>,
{
    tokio::select! {
        signal = stop => {
            signal.context("Failed to listen for Ctrl-C")?;
            Ok(None)
        }
        Some(failure) = failures.recv() => Ok(Some(failure)),
    }
}

fn print_result(result: &QueryResult, tail: usize) {
    println!(
        "Instrument: {}  Period: {}  Bars: {}",
        result.instrument,
        result.period.label(),
        result.bars.len()
    );
    println!(
        "{:<10} | {:>10} | {:>10} | {:>10} | {:>10} | {:>14}",
        "Date", "Open", "High", "Low", "Close", "Volume"
    );
    println!("{:-<10}-+-{:->10}-+-{:->10}-+-{:->10}-+-{:->10}-+-{:->14}", "", "", "", "", "", "");
    let skip = result.bars.len().saturating_sub(tail);
    for bar in result.bars.iter().skip(skip) {
        println!(
            "{:<10} | {:>10.2} | {:>10.2} | {:>10.2} | {:>10.2} | {:>14.0}",
            bar.time, bar.open, bar.high, bar.low, bar.close, bar.volume
        );
    }

    if !result.indicators.is_empty() {
        println!("\n=== INDICATORS ({}) ===", result.indicators.len());
        for (id, series) in &result.indicators {
            match series.last() {
                Some(point) => println!("- {} ({} points) last {}: {}", id, series.len(), point.time, point.value),
                None => println!("- {} (not enough history)", id),
            }
        }
    }
}

fn print_update(result: &QueryResult) {
    match result.last_bar() {
        Some(bar) => {
            let latest: Vec<String> = result
                .indicators
                .iter()
                .filter_map(|(id, series)| series.last().map(|p| format!("{} {}", id, p.value)))
                .collect();
            println!(
                "{} {} close={:.2} vol={:.0} {}",
                result.instrument,
                bar.time,
                bar.close,
                bar.volume,
                latest.join(" | ")
            );
        }
        None => println!("{}: no bars yet", result.instrument),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StreamError;

    #[tokio::test]
    async fn test_watch_ends_on_terminal_feed_failure() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(QueryError::Stream(StreamError::ReconnectExhausted { attempts: 5 })).unwrap();

        let ended = wait_for_watch_end(std::future::pending(), &mut rx).await.unwrap();
        assert_eq!(ended, Some(QueryError::Stream(StreamError::ReconnectExhausted { attempts: 5 })));
    }

    #[tokio::test]
    async fn test_watch_ends_on_stop_signal() {
        let (_tx, mut rx) = mpsc::unbounded_channel();
        let ended = wait_for_watch_end(async { Ok(()) }, &mut rx).await.unwrap();
        assert_eq!(ended, None);
    }
}
