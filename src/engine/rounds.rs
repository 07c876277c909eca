//! Round lifecycle per table.
//!
//! Each table cycles SETTLING → BETTABLE → LOCKED → IDLE. A detected outcome
//! closes the current round (that outcome is its result) and opens a new one
//! in SETTLING. Phase changes are driven by timers owned by the runtime; this
//! module only holds the state and validates transitions.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::types::{EngineError, Outcome, RoundId, RoundPhase, StrategyKey, TableId};

pub const DEFAULT_ROUND_HISTORY: usize = 100;

// ---------------------------------------------------------------------------
// Phase timing
// ---------------------------------------------------------------------------

/// How long each timed phase lasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseDurations {
    #[serde(default = "default_settling_ms")]
    pub settling_ms: u64,
    #[serde(default = "default_bettable_ms")]
    pub bettable_ms: u64,
    #[serde(default = "default_locked_ms")]
    pub locked_ms: u64,
}

fn default_settling_ms() -> u64 {
    2_000
}
fn default_bettable_ms() -> u64 {
    10_000
}
fn default_locked_ms() -> u64 {
    5_000
}

impl Default for PhaseDurations {
    fn default() -> Self {
        Self {
            settling_ms: default_settling_ms(),
            bettable_ms: default_bettable_ms(),
            locked_ms: default_locked_ms(),
        }
    }
}

impl PhaseDurations {
    /// Time spent in `phase` before the next transition. IDLE waits for the
    /// next outcome and has no timer.
    pub fn of(&self, phase: RoundPhase) -> Option<Duration> {
        match phase {
            RoundPhase::Settling => Some(Duration::from_millis(self.settling_ms)),
            RoundPhase::Bettable => Some(Duration::from_millis(self.bettable_ms)),
            RoundPhase::Locked => Some(Duration::from_millis(self.locked_ms)),
            RoundPhase::Idle => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Round
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Round {
    pub id: RoundId,
    pub phase: RoundPhase,
    pub opened_at: DateTime<Utc>,
    /// Result of the round, known once the next outcome is detected.
    pub outcome: Option<Outcome>,
    /// Strategies that held a position in this round.
    pub participated: HashSet<StrategyKey>,
    /// Voided externally; its outcome is recorded nowhere.
    pub cancelled: bool,
}

impl Round {
    fn open(id: RoundId, at: DateTime<Utc>) -> Self {
        Self {
            id,
            phase: RoundPhase::Settling,
            opened_at: at,
            outcome: None,
            participated: HashSet::new(),
            cancelled: false,
        }
    }

    pub fn is_participated(&self, strategy: &StrategyKey) -> bool {
        self.participated.contains(strategy)
    }
}

/// Result of feeding an outcome to a table.
#[derive(Debug, Clone)]
pub struct RoundTransition {
    /// The round that just ended, carrying the detected outcome.
    pub closed: Option<Round>,
    pub opened: RoundId,
}

/// Anything that can record which strategies took part in a round.
pub trait ParticipationLedger {
    fn mark_participated(
        &mut self,
        table: &TableId,
        round: &RoundId,
        strategy: &StrategyKey,
    ) -> Result<(), EngineError>;
}

// ---------------------------------------------------------------------------
// Round book
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct TableRounds {
    current: Option<Round>,
    history: VecDeque<Round>,
    last_detected: Option<DateTime<Utc>>,
    last_stamp_ms: Option<i64>,
}

#[derive(Debug)]
pub struct RoundBook {
    tables: HashMap<TableId, TableRounds>,
    history_capacity: usize,
}

impl Default for RoundBook {
    fn default() -> Self {
        Self::new(DEFAULT_ROUND_HISTORY)
    }
}

impl RoundBook {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            tables: HashMap::new(),
            history_capacity: history_capacity.max(1),
        }
    }

    /// Close the table's current round with `outcome` and open a new one.
    ///
    /// Events at or before the last processed detection time are rejected
    /// as stale and change nothing.
    pub fn on_outcome(
        &mut self,
        table: &TableId,
        outcome: Outcome,
        detected_at: DateTime<Utc>,
    ) -> Result<RoundTransition, EngineError> {
        let capacity = self.history_capacity;
        let rounds = self.tables.entry(table.clone()).or_default();

        if let Some(last) = rounds.last_detected {
            if detected_at <= last {
                warn!(table = %table, detected_at = %detected_at, last = %last, "Stale outcome dropped");
                return Err(EngineError::StaleEvent {
                    table: table.clone(),
                    detected_at,
                    last_processed: last,
                });
            }
        }
        rounds.last_detected = Some(detected_at);

        let closed = rounds.current.take().map(|mut round| {
            round.outcome = Some(outcome);
            round.phase = RoundPhase::Idle;
            rounds.history.push_back(round.clone());
            while rounds.history.len() > capacity {
                rounds.history.pop_front();
            }
            round
        });

        // Millisecond stamps stay strictly increasing per table.
        let mut stamp = detected_at.timestamp_millis();
        if let Some(prev) = rounds.last_stamp_ms {
            stamp = stamp.max(prev + 1);
        }
        rounds.last_stamp_ms = Some(stamp);

        let id = RoundId::new(table.clone(), stamp);
        rounds.current = Some(Round::open(id.clone(), detected_at));

        if let Some(round) = &closed {
            debug!(table = %table, round = %round.id, outcome = %outcome, "Round closed");
        }
        info!(table = %table, round = %id, "Round opened");

        Ok(RoundTransition { closed, opened: id })
    }

    /// Move the current round to its next phase. Returns the new phase, or
    /// `None` when `round` is no longer current or is already IDLE.
    pub fn advance_phase(&mut self, table: &TableId, round: &RoundId) -> Option<RoundPhase> {
        let current = self.tables.get_mut(table)?.current.as_mut()?;
        if &current.id != round {
            debug!(table = %table, round = %round, "Timer for superseded round ignored");
            return None;
        }
        let next = match current.phase {
            RoundPhase::Settling => RoundPhase::Bettable,
            RoundPhase::Bettable => RoundPhase::Locked,
            RoundPhase::Locked => RoundPhase::Idle,
            RoundPhase::Idle => return None,
        };
        current.phase = next;
        if next == RoundPhase::Idle {
            debug!(table = %table, round = %round, "Table idle");
        } else {
            info!(table = %table, round = %round, phase = %next, "Phase changed");
        }
        Some(next)
    }

    /// Void the current round. Its eventual outcome will not be recorded.
    pub fn cancel_round(&mut self, table: &TableId) -> Option<RoundId> {
        let current = self.tables.get_mut(table)?.current.as_mut()?;
        if current.cancelled {
            return None;
        }
        current.cancelled = true;
        current.phase = RoundPhase::Idle;
        warn!(table = %table, round = %current.id, "Round cancelled");
        Some(current.id.clone())
    }

    pub fn current(&self, table: &TableId) -> Option<&Round> {
        self.tables.get(table)?.current.as_ref()
    }

    pub fn current_id(&self, table: &TableId) -> Option<RoundId> {
        self.current(table).map(|r| r.id.clone())
    }

    pub fn phase(&self, table: &TableId) -> Option<RoundPhase> {
        self.current(table).map(|r| r.phase)
    }

    /// Closed rounds, oldest first.
    pub fn history(&self, table: &TableId) -> Vec<Round> {
        self.tables
            .get(table)
            .map(|t| t.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn last_detected(&self, table: &TableId) -> Option<DateTime<Utc>> {
        self.tables.get(table)?.last_detected
    }

    pub fn tables(&self) -> Vec<TableId> {
        let mut tables: Vec<TableId> = self.tables.keys().cloned().collect();
        tables.sort();
        tables
    }
}

impl ParticipationLedger for RoundBook {
    /// Flag `strategy` as having a position in `round`. Fails when `round`
    /// is not the table's current round.
    fn mark_participated(
        &mut self,
        table: &TableId,
        round: &RoundId,
        strategy: &StrategyKey,
    ) -> Result<(), EngineError> {
        let current = self
            .tables
            .get_mut(table)
            .and_then(|t| t.current.as_mut())
            .filter(|r| &r.id == round);
        match current {
            Some(r) => {
                r.participated.insert(strategy.clone());
                debug!(table = %table, round = %round, strategy = %strategy, "Round marked participated");
                Ok(())
            }
            None => {
                warn!(table = %table, round = %round, strategy = %strategy, "Participation for non-current round ignored");
                Err(EngineError::RoundMismatch {
                    table: table.clone(),
                    requested: round.clone(),
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
