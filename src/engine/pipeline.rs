//! Decision pipeline: the synchronous core that sequences one table's
//! round events through settlement, history, evaluation, conflict
//! resolution and position opening.
//!
//! Every component keeps its own lock. Lock order, when two are held:
//! positions → rounds, positions → lines, trackers → lines. The rounds lock is
//! never held while positions are taken.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use super::evaluator::{EntryEvaluator, LineState};
use super::positions::{Payouts, PositionManager, PositionStats, DEFAULT_SETTLEMENT_HISTORY};
use super::rounds::{Round, RoundBook, DEFAULT_ROUND_HISTORY};
use super::EngineEvent;
use crate::strategy::conflict::{ConflictConfig, ConflictResolver};
use crate::strategy::registry::{RegistrySnapshot, StrategyRegistry};
use crate::strategy::risk::{RiskConfig, RiskCoordinator, RiskEvent};
use crate::strategy::signal::{TrackerBook, DEFAULT_HISTORY_CAPACITY};
use crate::strategy::StrategyDefinition;
use crate::types::{
    ApprovedDecision, EngineError, Outcome, OutcomeEvent, RoundId, RoundPhase, SettlementNotice,
    SettlementRecord, StrategyKey, TableId,
};

/// Tunables for the pipeline's components.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub payouts: Payouts,
    pub risk: RiskConfig,
    pub conflict: ConflictConfig,
    /// Outcomes retained per (table, strategy) tracker.
    pub signal_history: Option<usize>,
    /// Closed rounds retained per table.
    pub round_history: Option<usize>,
    /// Settlement records retained by the position manager.
    pub settlement_history: Option<usize>,
}

/// What one outcome did to its table.
#[derive(Debug, Clone)]
pub struct OutcomeReport {
    pub closed: Option<RoundId>,
    pub opened: RoundId,
    pub settlements: Vec<SettlementRecord>,
    pub events: Vec<EngineEvent>,
}

/// What one phase timer did to its table.
#[derive(Debug, Clone, Default)]
pub struct PhaseStep {
    /// The phase entered, or `None` when the timer was stale.
    pub phase: Option<RoundPhase>,
    pub decisions: Vec<ApprovedDecision>,
    pub events: Vec<EngineEvent>,
}

pub struct DecisionPipeline {
    registry: RwLock<StrategyRegistry>,
    trackers: Mutex<TrackerBook>,
    rounds: Mutex<RoundBook>,
    evaluator: EntryEvaluator,
    resolver: ConflictResolver,
    positions: Mutex<PositionManager>,
    risk: RiskCoordinator,
}

impl Default for DecisionPipeline {
    fn default() -> Self {
        Self::new(PipelineConfig::default())
    }
}

impl DecisionPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            registry: RwLock::new(StrategyRegistry::new()),
            trackers: Mutex::new(TrackerBook::new(
                config.signal_history.unwrap_or(DEFAULT_HISTORY_CAPACITY),
            )),
            rounds: Mutex::new(RoundBook::new(
                config.round_history.unwrap_or(DEFAULT_ROUND_HISTORY),
            )),
            evaluator: EntryEvaluator::new(),
            resolver: ConflictResolver::new(config.conflict),
            positions: Mutex::new(PositionManager::new(
                config.payouts,
                config.settlement_history.unwrap_or(DEFAULT_SETTLEMENT_HISTORY),
            )),
            risk: RiskCoordinator::new(config.risk),
        }
    }

    // ---- registration ----

    pub fn register_strategy(&self, definition: StrategyDefinition) -> Result<Arc<StrategyDefinition>, EngineError> {
        let definition = self.registry.write().register(definition)?;
        self.risk.register_strategy(&definition);
        Ok(definition)
    }

    pub fn unregister_strategy(&self, key: &StrategyKey) -> bool {
        let removed = self.registry.write().unregister(key);
        if removed {
            self.risk.unregister_strategy(key);
        }
        removed
    }

    pub fn bind(&self, table: &TableId, key: &StrategyKey) -> Result<(), EngineError> {
        self.registry.write().bind(table, key)
    }

    pub fn unbind(&self, table: &TableId, key: &StrategyKey) -> bool {
        self.registry.write().unbind(table, key)
    }

    pub fn detach_all(&self, table: &TableId) -> usize {
        self.registry.write().detach_all(table)
    }

    // ---- round events ----

    /// Handle a detected outcome: close and settle the previous round, feed
    /// the outcome to the histories of strategies that sat it out, open the
    /// next round.
    pub fn on_outcome(&self, event: &OutcomeEvent) -> Result<OutcomeReport, EngineError> {
        let table = &event.table;
        let at = event.detected_at;

        let transition = self.rounds.lock().on_outcome(table, event.outcome, at)?;

        let mut events = Vec::new();
        let mut settlements = Vec::new();

        if let Some(closed) = &transition.closed {
            if !closed.cancelled {
                settlements = self
                    .positions
                    .lock()
                    .settle(table, &closed.id, Some(event.outcome), &self.evaluator, at);
                events.extend(self.after_settlement(&settlements));
            }
        }

        self.record_history(table, event.outcome, at, transition.closed.as_ref(), &settlements);

        // Positions from rounds older than the one just closed never settled.
        let stale: Vec<RoundId> = self
            .positions
            .lock()
            .for_table(table)
            .into_iter()
            .filter(|p| p.round != transition.opened)
            .map(|p| p.round.clone())
            .collect();
        if !stale.is_empty() {
            warn!(table = %table, count = stale.len(), "Unsettled positions from earlier rounds");
        }

        events.push(EngineEvent::RoundOpened {
            table: table.clone(),
            round: transition.opened.clone(),
            at,
        });

        Ok(OutcomeReport {
            closed: transition.closed.map(|r| r.id),
            opened: transition.opened,
            settlements,
            events,
        })
    }

    /// Strategies with a position (or participation) in the closed round skip
    /// its outcome; all others record it. A cancelled round records nothing.
    fn record_history(
        &self,
        table: &TableId,
        outcome: Outcome,
        at: DateTime<Utc>,
        closed: Option<&Round>,
        settlements: &[SettlementRecord],
    ) {
        if closed.is_some_and(|r| r.cancelled) {
            debug!(table = %table, "Cancelled round outcome not recorded");
            return;
        }

        let strategies = self.registry.read().strategies_for(table);
        let mut trackers = self.trackers.lock();
        for registered in strategies {
            let def = &registered.definition;
            let settled = settlements.iter().any(|r| r.strategy == def.key);
            if settled {
                continue;
            }
            if closed.is_some_and(|r| r.is_participated(&def.key)) {
                warn!(table = %table, strategy = %def.key, "Participated round without settled position, outcome not recorded");
                continue;
            }
            trackers.record(table, def, outcome, at);
        }
    }

    /// Feed settlements to risk and apply line pauses.
    fn after_settlement(&self, records: &[SettlementRecord]) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        for record in records {
            events.push(EngineEvent::Settlement(SettlementNotice::from(record)));
            for risk_event in self.risk.record_settlement(record) {
                self.apply_risk_event(&risk_event);
                events.push(EngineEvent::RiskTriggered(risk_event));
            }
        }
        events
    }

    fn apply_risk_event(&self, event: &RiskEvent) {
        if !event.is_line_pause() {
            return;
        }
        let definition = self
            .registry
            .read()
            .get(&event.strategy)
            .map(|r| Arc::clone(&r.definition));
        if let Some(def) = definition {
            self.evaluator.freeze(&event.table, &def, event.until);
        }
    }

    /// Handle a phase timer for `round`. Entering BETTABLE runs evaluation.
    pub fn on_phase_elapsed(&self, table: &TableId, round: &RoundId, now: DateTime<Utc>) -> PhaseStep {
        let Some(phase) = self.rounds.lock().advance_phase(table, round) else {
            return PhaseStep::default();
        };

        let mut step = PhaseStep {
            phase: Some(phase),
            ..Default::default()
        };
        // IDLE is silent.
        if phase == RoundPhase::Idle {
            return step;
        }

        step.events.push(EngineEvent::PhaseChanged {
            table: table.clone(),
            round: round.clone(),
            phase,
        });
        if phase == RoundPhase::Bettable {
            step.decisions = self.evaluate_and_decide(table, round, now);
            step.events
                .extend(step.decisions.iter().cloned().map(EngineEvent::Decision));
        }
        step
    }

    /// Run one evaluation pass for `round` and open positions for the
    /// approved decisions.
    ///
    /// The per-round stake cap is spent in rank order over the candidates
    /// that survived conflict resolution, so a rejected candidate never
    /// consumes budget.
    pub fn evaluate_and_decide(&self, table: &TableId, round: &RoundId, now: DateTime<Utc>) -> Vec<ApprovedDecision> {
        self.risk.refresh(now);

        let strategies = self.registry.read().strategies_for(table);
        if strategies.is_empty() {
            return Vec::new();
        }

        let candidates = {
            let mut trackers = self.trackers.lock();
            self.evaluator
                .evaluate(table, round, &strategies, &mut trackers, &self.risk, now)
        };
        if candidates.is_empty() {
            return Vec::new();
        }

        let resolution = self.resolver.resolve(candidates);
        let definition_of = |key: &StrategyKey| {
            strategies
                .iter()
                .find(|r| &r.definition.key == key)
                .map(|r| Arc::clone(&r.definition))
        };

        for rejected in &resolution.rejected {
            if let Some(def) = definition_of(&rejected.decision.strategy) {
                self.evaluator.disarm(table, &def);
            }
        }

        let mut approved = Vec::with_capacity(resolution.approved.len());
        let mut committed = Decimal::ZERO;
        for candidate in resolution.approved {
            let Some(def) = definition_of(&candidate.strategy) else {
                continue;
            };
            if self.risk.exceeds_round_cap(committed, candidate.amount) {
                info!(
                    table = %table,
                    round = %round,
                    strategy = %candidate.strategy,
                    amount = %candidate.amount,
                    committed = %committed,
                    "Per-round cap reached, candidate dropped"
                );
                self.evaluator.disarm(table, &def);
                continue;
            }
            let decision = ApprovedDecision {
                table: candidate.table,
                round: candidate.round,
                strategy: candidate.strategy,
                direction: candidate.direction,
                amount: candidate.amount,
                layer_index: candidate.layer_index,
                staking_sequence: def.staking.effective_sequence(),
                on_win: def.staking.transition_for(crate::types::SettlementOutcome::Win),
                on_loss: def.staking.transition_for(crate::types::SettlementOutcome::Loss),
                decided_at: candidate.decided_at,
            };

            let opened = {
                let mut positions = self.positions.lock();
                let mut rounds = self.rounds.lock();
                positions.open(&decision, Arc::clone(&def), now, &mut *rounds)
            };
            match opened {
                Ok(()) => {
                    info!(decision = %decision, "Decision approved");
                    committed += decision.amount;
                    approved.push(decision);
                }
                Err(e) => {
                    warn!(table = %table, strategy = %decision.strategy, error = %e, "Decision dropped");
                    self.evaluator.disarm(table, &def);
                }
            }
        }
        approved
    }

    /// Void the table's current round: its positions settle as CANCELLED
    /// and its outcome will not enter any history.
    pub fn cancel_round(&self, table: &TableId, at: DateTime<Utc>) -> Option<(RoundId, Vec<EngineEvent>)> {
        let round = self.rounds.lock().cancel_round(table)?;
        let records = self
            .positions
            .lock()
            .settle(table, &round, None, &self.evaluator, at);
        let events = self.after_settlement(&records);
        Some((round, events))
    }

    /// Clear risk counters, freezes and line freezes.
    pub fn reset_session(&self) {
        self.risk.reset_session();
        self.evaluator.unfreeze_all();
    }

    // ---- queries ----

    pub fn risk(&self) -> &RiskCoordinator {
        &self.risk
    }

    pub fn registry_snapshot(&self) -> RegistrySnapshot {
        self.registry.read().snapshot()
    }

    pub fn strategy(&self, key: &StrategyKey) -> Option<Arc<StrategyDefinition>> {
        self.registry
            .read()
            .get(key)
            .map(|r| Arc::clone(&r.definition))
    }

    /// Recorded outcome history of one (table, strategy) tracker.
    pub fn history(&self, table: &TableId, key: &StrategyKey) -> Vec<Outcome> {
        self.trackers
            .lock()
            .get(table, key)
            .map(|t| t.history())
            .unwrap_or_default()
    }

    pub fn line(&self, table: &TableId, key: &StrategyKey) -> Option<LineState> {
        let def = self.strategy(key)?;
        self.evaluator.line(table, &def)
    }

    pub fn phase(&self, table: &TableId) -> Option<RoundPhase> {
        self.rounds.lock().phase(table)
    }

    pub fn current_round(&self, table: &TableId) -> Option<RoundId> {
        self.rounds.lock().current_id(table)
    }

    pub fn round_history(&self, table: &TableId) -> Vec<Round> {
        self.rounds.lock().history(table)
    }

    pub fn pending_count(&self) -> usize {
        self.positions.lock().count_pending()
    }

    pub fn position_stats(&self) -> PositionStats {
        self.positions.lock().stats()
    }

    pub fn settlements(&self, limit: usize) -> Vec<SettlementRecord> {
        self.positions.lock().history(limit)
    }

    pub fn settlement_for(&self, round: &RoundId, strategy: &StrategyKey) -> Option<SettlementRecord> {
        self.positions.lock().settlement_for(round, strategy)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
