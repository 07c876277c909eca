//! Decision executor.
//!
//! Hands approved decisions to a [`DecisionSink`] (the actuator boundary)
//! and tracks what was placed. The dry-run sink only logs.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{info, warn};
use uuid::Uuid;

use crate::types::{ApprovedDecision, RoundId, StrategyKey, TableId};

// ---------------------------------------------------------------------------
// Sink boundary
// ---------------------------------------------------------------------------

/// Acknowledgement from the sink for one placed decision.
#[derive(Debug, Clone, PartialEq)]
pub struct Placement {
    pub placement_id: String,
    pub table: TableId,
    pub round: RoundId,
    pub strategy: StrategyKey,
    pub amount: Decimal,
    pub placed_at: DateTime<Utc>,
}

impl Placement {
    /// Placement produced without touching any real table.
    pub fn dry_run(decision: &ApprovedDecision) -> Self {
        Self {
            placement_id: format!("dry-run-{}", Uuid::new_v4()),
            table: decision.table.clone(),
            round: decision.round.clone(),
            strategy: decision.strategy.clone(),
            amount: decision.amount,
            placed_at: Utc::now(),
        }
    }
}

/// Whatever physically places the bet.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DecisionSink: Send + Sync {
    async fn place(&self, decision: &ApprovedDecision) -> Result<Placement>;
}

/// Logs decisions instead of placing them.
#[derive(Debug, Default)]
pub struct DryRunSink;

#[async_trait]
impl DecisionSink for DryRunSink {
    async fn place(&self, decision: &ApprovedDecision) -> Result<Placement> {
        info!(
            table = %decision.table,
            round = %decision.round,
            strategy = %decision.strategy,
            direction = %decision.direction,
            amount = format!("{:.2}", decision.amount),
            layer = decision.layer_index,
            "[DRY RUN] Would place bet"
        );
        Ok(Placement::dry_run(decision))
    }
}

/// Writes each decision as one JSON line on stdout for an external actuator
/// to pick up.
#[derive(Debug, Default)]
pub struct JsonLineSink;

#[async_trait]
impl DecisionSink for JsonLineSink {
    async fn place(&self, decision: &ApprovedDecision) -> Result<Placement> {
        use tokio::io::AsyncWriteExt;

        let mut line = serde_json::to_vec(decision)
            .with_context(|| format!("Failed to serialise decision for {}", decision.round))?;
        line.push(b'\n');

        let mut out = tokio::io::stdout();
        out.write_all(&line).await.context("Failed to write decision")?;
        out.flush().await.context("Failed to flush decision")?;

        Ok(Placement {
            placement_id: format!("{}:{}", decision.round, decision.strategy),
            table: decision.table.clone(),
            round: decision.round.clone(),
            strategy: decision.strategy.clone(),
            amount: decision.amount,
            placed_at: Utc::now(),
        })
    }
}

// ---------------------------------------------------------------------------
// Execution report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct ExecutionReport {
    pub placed: Vec<Placement>,
    pub failed: Vec<FailedPlacement>,
    pub total_committed: Decimal,
}

#[derive(Debug, Clone)]
pub struct FailedPlacement {
    pub table: TableId,
    pub round: RoundId,
    pub strategy: StrategyKey,
    pub reason: String,
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

pub struct Executor {
    sink_name: String,
    sink: Box<dyn DecisionSink>,
}

impl Executor {
    pub fn new(sink_name: impl Into<String>, sink: Box<dyn DecisionSink>) -> Self {
        Self {
            sink_name: sink_name.into(),
            sink,
        }
    }

    pub fn dry_run() -> Self {
        Self::new("dry-run", Box::new(DryRunSink))
    }

    pub fn sink_name(&self) -> &str {
        &self.sink_name
    }

    /// Place a batch of decisions. A failed placement is reported and does
    /// not stop the rest of the batch.
    pub async fn execute_batch(&self, decisions: &[ApprovedDecision]) -> ExecutionReport {
        let mut report = ExecutionReport::default();
        if decisions.is_empty() {
            return report;
        }

        for decision in decisions {
            match self.sink.place(decision).await {
                Ok(placement) => {
                    report.total_committed += placement.amount;
                    report.placed.push(placement);
                }
                Err(e) => {
                    warn!(
                        sink = %self.sink_name,
                        table = %decision.table,
                        round = %decision.round,
                        strategy = %decision.strategy,
                        error = %e,
                        "Placement failed"
                    );
                    report.failed.push(FailedPlacement {
                        table: decision.table.clone(),
                        round: decision.round.clone(),
                        strategy: decision.strategy.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        info!(
            sink = %self.sink_name,
            placed = report.placed.len(),
            failed = report.failed.len(),
            committed = format!("{:.2}", report.total_committed),
            "Batch execution complete"
        );
        report
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
