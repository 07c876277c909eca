//! Position manager.
//!
//! Owns pending positions from approval to settlement. At most one position
//! exists per (table, round, strategy). Settling a round classifies each
//! position (WIN / LOSS / SKIPPED / CANCELLED), computes PnL from the payout
//! table, moves the line's layer through the [`LayerLedger`] and appends an
//! immutable [`SettlementRecord`].

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::evaluator::LayerLedger;
use crate::engine::rounds::ParticipationLedger;
use crate::strategy::StrategyDefinition;
use crate::types::{
    ApprovedDecision, Direction, EngineError, Outcome, RoundId, SettlementOutcome, SettlementRecord,
    StrategyKey, TableId,
};

pub const DEFAULT_SETTLEMENT_HISTORY: usize = 1_000;

// ---------------------------------------------------------------------------
// Payouts
// ---------------------------------------------------------------------------

/// Win multiples per direction (profit per unit staked).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Payouts {
    #[serde(default = "default_banker")]
    pub banker: Decimal,
    #[serde(default = "default_player")]
    pub player: Decimal,
    #[serde(default = "default_tie")]
    pub tie: Decimal,
}

fn default_banker() -> Decimal {
    dec!(0.95)
}
fn default_player() -> Decimal {
    dec!(1.0)
}
fn default_tie() -> Decimal {
    dec!(8.0)
}

impl Default for Payouts {
    fn default() -> Self {
        Self {
            banker: default_banker(),
            player: default_player(),
            tie: default_tie(),
        }
    }
}

impl Payouts {
    pub fn multiple(&self, direction: Direction) -> Decimal {
        match direction {
            Outcome::Banker => self.banker,
            Outcome::Player => self.player,
            Outcome::Tie => self.tie,
        }
    }

    /// Classify a bet against a round result and compute its PnL.
    /// `None` means the round was voided.
    pub fn settle(&self, direction: Direction, stake: Decimal, result: Option<Outcome>) -> (SettlementOutcome, Decimal) {
        match result {
            None => (SettlementOutcome::Cancelled, Decimal::ZERO),
            Some(r) if r == direction => (SettlementOutcome::Win, stake * self.multiple(direction)),
            Some(Outcome::Tie) => (SettlementOutcome::Skipped, Decimal::ZERO),
            Some(_) => (SettlementOutcome::Loss, -stake),
        }
    }
}

// ---------------------------------------------------------------------------
// Pending positions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PendingPosition {
    pub table: TableId,
    pub round: RoundId,
    pub strategy: StrategyKey,
    pub direction: Direction,
    pub stake: Decimal,
    pub layer_index: usize,
    pub opened_at: DateTime<Utc>,
    pub definition: Arc<StrategyDefinition>,
}

type PositionKey = (TableId, RoundId, StrategyKey);

/// Aggregate settlement statistics since start (or the last clear).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PositionStats {
    pub total_settled: u64,
    pub total_pending: usize,
    pub wins: u64,
    pub losses: u64,
    pub skipped: u64,
    pub cancelled: u64,
    pub total_pnl: Decimal,
    /// Wins over decided outcomes; `None` before the first decided one.
    pub win_rate: Option<Decimal>,
    pub total_exposure: Decimal,
}

#[derive(Debug)]
pub struct PositionManager {
    payouts: Payouts,
    pending: HashMap<PositionKey, PendingPosition>,
    history: VecDeque<SettlementRecord>,
    history_capacity: usize,
    tally: PositionStats,
}

impl Default for PositionManager {
    fn default() -> Self {
        Self::new(Payouts::default(), DEFAULT_SETTLEMENT_HISTORY)
    }
}

impl PositionManager {
    pub fn new(payouts: Payouts, history_capacity: usize) -> Self {
        Self {
            payouts,
            pending: HashMap::new(),
            history: VecDeque::new(),
            history_capacity: history_capacity.max(1),
            tally: PositionStats::default(),
        }
    }

    pub fn payouts(&self) -> &Payouts {
        &self.payouts
    }

    /// Open a position for an approved decision and mark the round as
    /// participated for its strategy.
    ///
    /// Rejected when a position already exists for (table, round, strategy),
    /// or when the round is no longer current; nothing is stored in either
    /// case.
    pub fn open(
        &mut self,
        decision: &ApprovedDecision,
        definition: Arc<StrategyDefinition>,
        opened_at: DateTime<Utc>,
        participation: &mut impl ParticipationLedger,
    ) -> Result<(), EngineError> {
        let key = (decision.table.clone(), decision.round.clone(), decision.strategy.clone());
        if self.pending.contains_key(&key) {
            warn!(
                table = %decision.table,
                round = %decision.round,
                strategy = %decision.strategy,
                "Duplicate position rejected"
            );
            return Err(EngineError::DuplicatePosition {
                round: decision.round.clone(),
                strategy: decision.strategy.clone(),
            });
        }

        participation.mark_participated(&decision.table, &decision.round, &decision.strategy)?;

        self.pending.insert(
            key,
            PendingPosition {
                table: decision.table.clone(),
                round: decision.round.clone(),
                strategy: decision.strategy.clone(),
                direction: decision.direction,
                stake: decision.amount,
                layer_index: decision.layer_index,
                opened_at,
                definition,
            },
        );
        info!(
            table = %decision.table,
            round = %decision.round,
            strategy = %decision.strategy,
            direction = %decision.direction,
            stake = %decision.amount,
            layer = decision.layer_index,
            "Position opened"
        );
        Ok(())
    }

    /// Settle every pending position of (`table`, `round`) against `result`.
    /// `None` voids the round. Records come back ordered by strategy key.
    pub fn settle(
        &mut self,
        table: &TableId,
        round: &RoundId,
        result: Option<Outcome>,
        layers: &impl LayerLedger,
        at: DateTime<Utc>,
    ) -> Vec<SettlementRecord> {
        let mut keys: Vec<PositionKey> = self
            .pending
            .keys()
            .filter(|(t, r, _)| t == table && r == round)
            .cloned()
            .collect();
        keys.sort_by(|a, b| a.2.cmp(&b.2));

        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(position) = self.pending.remove(&key) else {
                continue;
            };
            let (outcome, pnl) = self.payouts.settle(position.direction, position.stake, result);
            let transition = position.definition.staking.transition_for(outcome);
            let layer = layers.apply_settlement(table, &position.definition, transition, pnl);

            let record = SettlementRecord {
                id: Uuid::new_v4(),
                table: position.table,
                round: position.round,
                strategy: position.strategy,
                direction: position.direction,
                stake: position.stake,
                outcome,
                pnl,
                layer,
                settled_at: at,
            };
            info!(
                table = %record.table,
                round = %record.round,
                strategy = %record.strategy,
                outcome = %record.outcome,
                pnl = %record.pnl,
                layer_from = layer.from,
                layer_to = layer.to,
                "Position settled"
            );
            self.book(&record);
            records.push(record);
        }
        records
    }

    fn book(&mut self, record: &SettlementRecord) {
        let t = &mut self.tally;
        t.total_settled += 1;
        t.total_pnl += record.pnl;
        match record.outcome {
            SettlementOutcome::Win => t.wins += 1,
            SettlementOutcome::Loss => t.losses += 1,
            SettlementOutcome::Skipped => t.skipped += 1,
            SettlementOutcome::Cancelled => t.cancelled += 1,
        }

        self.history.push_back(record.clone());
        while self.history.len() > self.history_capacity {
            self.history.pop_front();
        }
    }

    // ---- queries ----

    pub fn get(&self, table: &TableId, round: &RoundId, strategy: &StrategyKey) -> Option<&PendingPosition> {
        self.pending
            .get(&(table.clone(), round.clone(), strategy.clone()))
    }

    pub fn has(&self, table: &TableId, round: &RoundId, strategy: &StrategyKey) -> bool {
        self.get(table, round, strategy).is_some()
    }

    /// Whether `strategy` holds any pending position, on any table.
    pub fn has_any_for_strategy(&self, strategy: &StrategyKey) -> bool {
        self.pending.keys().any(|(_, _, s)| s == strategy)
    }

    pub fn for_table(&self, table: &TableId) -> Vec<&PendingPosition> {
        let mut out: Vec<&PendingPosition> = self.pending.values().filter(|p| &p.table == table).collect();
        out.sort_by(|a, b| a.round.cmp(&b.round).then_with(|| a.strategy.cmp(&b.strategy)));
        out
    }

    pub fn for_round(&self, table: &TableId, round: &RoundId) -> Vec<&PendingPosition> {
        self.for_table(table)
            .into_iter()
            .filter(|p| &p.round == round)
            .collect()
    }

    pub fn count_pending(&self) -> usize {
        self.pending.len()
    }

    /// Drop a position without settling it.
    pub fn remove(&mut self, table: &TableId, round: &RoundId, strategy: &StrategyKey) -> Option<PendingPosition> {
        let removed = self
            .pending
            .remove(&(table.clone(), round.clone(), strategy.clone()));
        if removed.is_some() {
            warn!(table = %table, round = %round, strategy = %strategy, "Position removed without settlement");
        }
        removed
    }

    /// Drop every pending position. Returns how many were dropped.
    pub fn clear(&mut self) -> usize {
        let n = self.pending.len();
        self.pending.clear();
        n
    }

    /// Settlement history, newest last, at most `limit` entries.
    pub fn history(&self, limit: usize) -> Vec<SettlementRecord> {
        let skip = self.history.len().saturating_sub(limit);
        self.history.iter().skip(skip).cloned().collect()
    }

    /// The settlement of one strategy on one round, if still in history.
    pub fn settlement_for(&self, round: &RoundId, strategy: &StrategyKey) -> Option<SettlementRecord> {
        self.history
            .iter()
            .rev()
            .find(|r| &r.round == round && &r.strategy == strategy)
            .cloned()
    }

    /// The most recent settlements of one strategy, newest last.
    pub fn recent_for(&self, strategy: &StrategyKey, limit: usize) -> Vec<SettlementRecord> {
        let mut out: Vec<SettlementRecord> = self
            .history
            .iter()
            .rev()
            .filter(|r| &r.strategy == strategy)
            .take(limit)
            .cloned()
            .collect();
        out.reverse();
        out
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    pub fn stats(&self) -> PositionStats {
        let mut stats = self.tally.clone();
        stats.total_pending = self.pending.len();
        stats.total_exposure = self.pending.values().map(|p| p.stake).sum();
        let decided = stats.wins + stats.losses;
        stats.win_rate = (decided > 0).then(|| Decimal::from(stats.wins) / Decimal::from(decided));
        stats
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
