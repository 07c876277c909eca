//! Recording sink for integration testing.
//!
//! A deterministic `DecisionSink` that keeps every decision it is handed,
//! in memory, and can be told to fail.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

use autobet::engine::executor::{DecisionSink, Placement};
use autobet::types::ApprovedDecision;

/// Cloning shares the recorded state, so a test can keep a handle after
/// boxing the sink into an executor.
#[derive(Clone, Default)]
pub struct RecordingSink {
    placed: Arc<Mutex<Vec<ApprovedDecision>>>,
    /// If set, every placement fails with this message.
    force_error: Arc<Mutex<Option<String>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_error(&self, msg: &str) {
        *self.force_error.lock().unwrap() = Some(msg.to_string());
    }

    pub fn clear_error(&self) {
        *self.force_error.lock().unwrap() = None;
    }

    pub fn placed(&self) -> Vec<ApprovedDecision> {
        self.placed.lock().unwrap().clone()
    }
}

#[async_trait]
impl DecisionSink for RecordingSink {
    async fn place(&self, decision: &ApprovedDecision) -> Result<Placement> {
        if let Some(msg) = self.force_error.lock().unwrap().clone() {
            return Err(anyhow!(msg));
        }
        self.placed.lock().unwrap().push(decision.clone());
        Ok(Placement::dry_run(decision))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autobet::engine::executor::Executor;
    use autobet::types::{LayerTransition, Outcome, RoundId, StrategyKey, TableId};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn decision(key: &str) -> ApprovedDecision {
        let table = TableId::from("T1");
        ApprovedDecision {
            round: RoundId::new(table.clone(), 1),
            table,
            strategy: StrategyKey::from(key),
            direction: Outcome::Player,
            amount: dec!(25),
            layer_index: 0,
            staking_sequence: vec![dec!(25), dec!(50)],
            on_win: LayerTransition::Reset,
            on_loss: LayerTransition::Advance,
            decided_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_sink_records_placements() {
        let sink = RecordingSink::new();
        let executor = Executor::new("recording", Box::new(sink.clone()));

        let report = executor.execute_batch(&[decision("a"), decision("b")]).await;
        assert_eq!(report.placed.len(), 2);
        assert_eq!(report.total_committed, dec!(50));
        assert_eq!(sink.placed().len(), 2);
    }

    #[tokio::test]
    async fn test_sink_forced_error() {
        let sink = RecordingSink::new();
        let executor = Executor::new("recording", Box::new(sink.clone()));

        sink.set_error("table unreachable");
        let report = executor.execute_batch(&[decision("a")]).await;
        assert_eq!(report.failed.len(), 1);
        assert!(sink.placed().is_empty());

        sink.clear_error();
        let report = executor.execute_batch(&[decision("a")]).await;
        assert_eq!(report.placed.len(), 1);
    }
}
