//! Entry evaluator.
//!
//! Owns every line's state (status, freeze window, layer index) and turns a
//! table's BETTABLE phase into candidate decisions. In accumulate mode one
//! line is shared by all tables a strategy runs on; every read and write of
//! line state goes through a single mutex so shared layers stay linearizable.
//!
//! Layers only move through [`LayerLedger::apply_settlement`], called by the
//! position manager when a position settles.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info};

use crate::strategy::registry::RegisteredStrategy;
use crate::strategy::risk::RiskCoordinator;
use crate::strategy::signal::TrackerBook;
use crate::strategy::StrategyDefinition;
use crate::types::{
    CandidateDecision, CrossTableMode, LayerChange, LayerTransition, RoundId, StrategyKey, TableId,
};

// ---------------------------------------------------------------------------
// Line state
// ---------------------------------------------------------------------------

/// Identity of a line: per table, or shared across tables.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LineKey {
    Table(TableId, StrategyKey),
    Shared(StrategyKey),
}

impl LineKey {
    pub fn for_definition(table: &TableId, definition: &StrategyDefinition) -> Self {
        match definition.cross_table {
            CrossTableMode::Independent => LineKey::Table(table.clone(), definition.key.clone()),
            CrossTableMode::Accumulate => LineKey::Shared(definition.key.clone()),
        }
    }
}

impl std::fmt::Display for LineKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LineKey::Table(t, s) => write!(f, "{t}:{s}"),
            LineKey::Shared(s) => write!(f, "*:{s}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LineStatus {
    #[default]
    Idle,
    /// A decision was produced and awaits settlement.
    Armed,
    Frozen,
}

#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct LineState {
    pub status: LineStatus,
    /// `None` while frozen means frozen until explicitly lifted.
    pub frozen_until: Option<DateTime<Utc>>,
    pub layer_index: usize,
    pub armed_round: Option<RoundId>,
    pub pnl: Decimal,
    pub settled: u64,
}

impl LineState {
    fn is_frozen(&self, now: DateTime<Utc>) -> bool {
        self.status == LineStatus::Frozen && self.frozen_until.map_or(true, |until| now < until)
    }
}

/// Where settlements write their layer transitions.
pub trait LayerLedger {
    /// Apply `transition` to the line of (`table`, `definition`) and book the
    /// settlement's PnL. Returns the change actually applied.
    fn apply_settlement(
        &self,
        table: &TableId,
        definition: &StrategyDefinition,
        transition: LayerTransition,
        pnl: Decimal,
    ) -> LayerChange;
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct EntryEvaluator {
    lines: Mutex<HashMap<LineKey, LineState>>,
}

impl EntryEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Produce candidates for `round` from the strategies bound to `table`.
    ///
    /// Per strategy: skip frozen lines and risk-blocked pairs, ask the
    /// tracker whether the pattern just completed, then stake at the line's
    /// current layer. The per-round stake cap is not applied here: it only
    /// sees candidates that survived conflict resolution.
    pub fn evaluate(
        &self,
        table: &TableId,
        round: &RoundId,
        strategies: &[RegisteredStrategy],
        trackers: &mut TrackerBook,
        risk: &RiskCoordinator,
        now: DateTime<Utc>,
    ) -> Vec<CandidateDecision> {
        let mut candidates = Vec::new();

        for registered in strategies {
            let def = registered.definition.as_ref();
            let key = LineKey::for_definition(table, def);

            let layer_index = {
                let mut lines = self.lines.lock();
                let line = lines.entry(key.clone()).or_default();
                if line.status == LineStatus::Frozen {
                    if line.is_frozen(now) {
                        debug!(table = %table, strategy = %def.key, "Line frozen, skipping");
                        continue;
                    }
                    line.status = LineStatus::Idle;
                    line.frozen_until = None;
                    info!(line = %key, "Line freeze expired");
                }
                line.layer_index.min(def.staking.last_index())
            };

            if risk.is_blocked(&def.key, table, now) {
                debug!(table = %table, strategy = %def.key, "Blocked by risk, skipping");
                continue;
            }

            if !trackers.tracker_mut(table, def).should_trigger(now) {
                continue;
            }

            let amount = def.staking.stake_at(layer_index);

            {
                let mut lines = self.lines.lock();
                let line = lines.entry(key).or_default();
                line.status = LineStatus::Armed;
                line.armed_round = Some(round.clone());
            }

            let candidate = CandidateDecision {
                table: table.clone(),
                round: round.clone(),
                strategy: def.key.clone(),
                direction: def.entry.target,
                amount,
                layer_index,
                priority_score: def.priority_score(layer_index),
                decided_at: now,
                declaration_order: registered.declaration_order,
            };
            info!(
                table = %table,
                round = %round,
                strategy = %def.key,
                direction = %candidate.direction,
                amount = %amount,
                layer = layer_index,
                "Pattern triggered"
            );
            candidates.push(candidate);
        }

        candidates
    }

    /// Return an armed line to idle (candidate rejected or never opened).
    pub fn disarm(&self, table: &TableId, definition: &StrategyDefinition) {
        let mut lines = self.lines.lock();
        if let Some(line) = lines.get_mut(&LineKey::for_definition(table, definition)) {
            if line.status == LineStatus::Armed {
                line.status = LineStatus::Idle;
                line.armed_round = None;
            }
        }
    }

    /// Freeze a line until `until`, or until lifted when `None`.
    pub fn freeze(&self, table: &TableId, definition: &StrategyDefinition, until: Option<DateTime<Utc>>) {
        let key = LineKey::for_definition(table, definition);
        let mut lines = self.lines.lock();
        let line = lines.entry(key.clone()).or_default();
        line.status = LineStatus::Frozen;
        line.frozen_until = until;
        info!(line = %key, until = ?until, "Line frozen");
    }

    /// Lift every freeze.
    pub fn unfreeze_all(&self) {
        for line in self.lines.lock().values_mut() {
            if line.status == LineStatus::Frozen {
                line.status = LineStatus::Idle;
                line.frozen_until = None;
            }
        }
    }

    pub fn line(&self, table: &TableId, definition: &StrategyDefinition) -> Option<LineState> {
        self.lines
            .lock()
            .get(&LineKey::for_definition(table, definition))
            .cloned()
    }

    /// Current layer of a line (0 for a line never seen).
    pub fn layer_index(&self, table: &TableId, definition: &StrategyDefinition) -> usize {
        self.line(table, definition).map_or(0, |l| l.layer_index)
    }

    pub fn snapshot(&self) -> Vec<(String, LineState)> {
        let mut out: Vec<(String, LineState)> = self
            .lines
            .lock()
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

impl LayerLedger for EntryEvaluator {
    fn apply_settlement(
        &self,
        table: &TableId,
        definition: &StrategyDefinition,
        transition: LayerTransition,
        pnl: Decimal,
    ) -> LayerChange {
        let key = LineKey::for_definition(table, definition);
        let mut lines = self.lines.lock();
        let line = lines.entry(key.clone()).or_default();

        let from = line.layer_index;
        let to = definition.staking.apply(from, transition);
        line.layer_index = to;
        line.pnl += pnl;
        line.settled += 1;
        if line.status == LineStatus::Armed {
            line.status = LineStatus::Idle;
            line.armed_round = None;
        }

        if from != to {
            info!(line = %key, from, to, transition = %transition, "Layer moved");
        }
        LayerChange { transition, from, to }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
