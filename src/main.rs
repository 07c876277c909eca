//! AUTOBET: pattern-triggered betting decision engine.
//!
//! Entry point. Loads configuration, initialises structured logging,
//! registers the configured strategies and feeds outcome events read as JSON
//! lines on stdin into the engine until Ctrl+C. Approved decisions go to the
//! executor; settlements are reconciled and appended to the audit ledger.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};

use autobet::config::AppConfig;
use autobet::engine::accountant::{Accountant, SessionStats};
use autobet::engine::executor::{Executor, JsonLineSink};
use autobet::engine::pipeline::DecisionPipeline;
use autobet::engine::runtime::Engine;
use autobet::engine::EngineEvent;
use autobet::storage;
use autobet::types::{OutcomeEvent, TableId};

const BANNER: &str = r#"
    _   _   _ _____ ___  ___ ___ _____
   /_\ | | | |_   _/ _ \| _ ) __|_   _|
  / _ \| |_| | | || (_) | _ \ _|  | |
 /_/ \_\\___/  |_| \___/|___/___| |_|

  Pattern-triggered decision engine v0.1.0
"#;

/// One line of operator input.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum InputLine {
    Outcome(OutcomeEvent),
    Cancel { cancel: TableId },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let config_path = std::env::var("AUTOBET_CONFIG").unwrap_or_else(|_| "config.toml".into());
    let cfg = AppConfig::load(&config_path)?;

    init_logging();

    eprintln!("{BANNER}");
    info!(
        engine_name = %cfg.engine.name,
        strategies = cfg.strategies.len(),
        dry_run = cfg.engine.dry_run,
        settling_ms = cfg.engine.durations.settling_ms,
        bettable_ms = cfg.engine.durations.bettable_ms,
        locked_ms = cfg.engine.durations.locked_ms,
        "AUTOBET starting up"
    );

    // -- Ledger ------------------------------------------------------------

    let ledger_path = cfg.engine.ledger_path.as_deref();
    if let Some(path) = ledger_path {
        let replayed = storage::replay(&storage::load(Some(path))?);
        for (key, history) in &replayed.per_strategy {
            info!(
                strategy = %key,
                pnl = format!("{:.2}", history.cumulative_pnl),
                layer = ?history.current_layer(),
                settlements = history.layers.len(),
                "Ledger history"
            );
        }
    }

    // -- Engine ------------------------------------------------------------

    let pipeline = Arc::new(DecisionPipeline::new(cfg.pipeline_config()));
    for def in cfg.strategies.iter().cloned() {
        let key = def.key.clone();
        pipeline
            .register_strategy(def)
            .with_context(|| format!("Failed to register strategy '{key}'"))?;
    }

    let (engine, mut events) = Engine::new(Arc::clone(&pipeline), cfg.engine.durations);

    let executor = if cfg.engine.dry_run {
        Executor::dry_run()
    } else {
        Executor::new("json-lines", Box::new(JsonLineSink))
    };

    let mut stats = SessionStats::default();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut input_open = true;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!(sink = executor.sink_name(), "Reading outcome events from stdin. Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown signal received");
                break;
            }

            line = lines.next_line(), if input_open => match line {
                Ok(Some(line)) => handle_input(&engine, &line),
                Ok(None) => {
                    info!("Input closed; timers keep running until Ctrl+C");
                    input_open = false;
                }
                Err(e) => {
                    error!(error = %e, "Failed to read input");
                    input_open = false;
                }
            },

            Some(event) = events.recv() => {
                handle_event(event, &pipeline, &executor, &mut stats, ledger_path).await;
            }
        }
    }

    // -- Shutdown ----------------------------------------------------------

    engine.stop().await;
    while let Ok(event) = events.try_recv() {
        handle_event(event, &pipeline, &executor, &mut stats, ledger_path).await;
    }

    let positions = pipeline.position_stats();
    info!(
        settled = stats.settled,
        session_pnl = format!("{:.2}", stats.cumulative_pnl),
        max_drawdown = format!("{:.2}", stats.max_drawdown),
        open_positions = positions.total_pending,
        "AUTOBET shut down"
    );
    for (key, tally) in &stats.per_strategy {
        info!(
            strategy = %key,
            wins = tally.wins,
            losses = tally.losses,
            pnl = format!("{:.2}", tally.pnl),
            "Strategy summary"
        );
    }

    Ok(())
}

fn handle_input(engine: &Engine, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    let result = match serde_json::from_str::<InputLine>(line) {
        Ok(InputLine::Outcome(event)) => engine.submit(event),
        Ok(InputLine::Cancel { cancel }) => engine.cancel_round(&cancel),
        Err(e) => {
            warn!(error = %e, input = line, "Unrecognised input line");
            return;
        }
    };
    if let Err(e) = result {
        warn!(error = %e, "Input rejected");
    }
}

async fn handle_event(
    event: EngineEvent,
    pipeline: &DecisionPipeline,
    executor: &Executor,
    stats: &mut SessionStats,
    ledger_path: Option<&str>,
) {
    match event {
        EngineEvent::Decision(decision) => {
            debug!(round = %decision.round, strategy = %decision.strategy, "Dispatching decision");
            executor.execute_batch(std::slice::from_ref(&decision)).await;
        }
        EngineEvent::Settlement(notice) => {
            let Some(record) = pipeline.settlement_for(&notice.round, &notice.strategy) else {
                warn!(round = %notice.round, strategy = %notice.strategy, "Settlement no longer in history");
                return;
            };
            Accountant::reconcile(stats, std::slice::from_ref(&record));
            if ledger_path.is_some() {
                if let Err(e) = storage::append(std::slice::from_ref(&record), ledger_path) {
                    error!(error = %e, "Failed to append to ledger");
                }
            }
        }
        EngineEvent::RiskTriggered(risk) => {
            warn!(
                strategy = %risk.strategy,
                table = %risk.table,
                scope = %risk.scope,
                action = %risk.action,
                until = ?risk.until,
                "Risk level triggered"
            );
        }
        EngineEvent::RoundOpened { table, round, .. } => {
            debug!(table = %table, round = %round, "Round opened");
        }
        EngineEvent::PhaseChanged { table, round, phase } => {
            debug!(table = %table, round = %round, phase = %phase, "Phase changed");
        }
    }
}

/// Initialise the tracing subscriber with env-filter and optional JSON.
///
/// Logs go to stderr so stdout stays free for the decision stream.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("autobet=info"));

    let json_logging = std::env::var("AUTOBET_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .with_target(true)
            .init();
    }
}
