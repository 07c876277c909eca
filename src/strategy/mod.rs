//! Strategy layer: definitions, registry, signal tracking, conflict
//! resolution and risk gating.
//!
//! A [`StrategyDefinition`] is immutable once registered. Everything that
//! changes over time (layer index, history, counters) lives in the engine
//! components that own it.

pub mod conflict;
pub mod registry;
pub mod risk;
pub mod signal;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::types::{
    AdvanceRule, CrossTableMode, DedupMode, Direction, EngineError, LayerTransition, Outcome,
    SettlementOutcome, StrategyKey, TableId,
};
use risk::RiskLevel;

/// Upper bound for any configured window or cooldown, in seconds (30 days).
pub const MAX_DURATION_SECS: u64 = 30 * 24 * 60 * 60;

// ---------------------------------------------------------------------------
// Entry
// ---------------------------------------------------------------------------

/// When a strategy enters and which way it bets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryConfig {
    /// Outcomes that must appear, in order, at the end of the history.
    pub pattern: Vec<Outcome>,
    /// Direction bet once the pattern matches.
    pub target: Direction,
    #[serde(default)]
    pub dedup: DedupMode,
    /// Maximum age of the first symbol of the matching window.
    #[serde(default)]
    pub valid_window_secs: Option<u64>,
}

// ---------------------------------------------------------------------------
// Staking
// ---------------------------------------------------------------------------

/// Stake progression through layers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StakingPlan {
    pub sequence: Vec<Decimal>,
    #[serde(default)]
    pub advance_on: AdvanceRule,
    #[serde(default = "default_true")]
    pub reset_on_win: bool,
    #[serde(default)]
    pub reset_on_loss: bool,
    /// Truncates the usable part of `sequence`.
    #[serde(default)]
    pub max_layers: Option<usize>,
    /// Upper bound applied to any single stake.
    #[serde(default)]
    pub per_hand_cap: Option<Decimal>,
}

fn default_true() -> bool {
    true
}

impl StakingPlan {
    pub fn new(sequence: Vec<Decimal>) -> Self {
        Self {
            sequence,
            advance_on: AdvanceRule::Loss,
            reset_on_win: true,
            reset_on_loss: false,
            max_layers: None,
            per_hand_cap: None,
        }
    }

    /// Number of layers actually in play.
    pub fn layer_count(&self) -> usize {
        let len = self.sequence.len();
        self.max_layers.map_or(len, |m| m.min(len))
    }

    pub fn last_index(&self) -> usize {
        self.layer_count().saturating_sub(1)
    }

    /// Stake for a layer, clamped to the last layer and to `per_hand_cap`.
    pub fn stake_at(&self, layer: usize) -> Decimal {
        let Some(amount) = self.sequence.get(layer.min(self.last_index())).copied() else {
            return Decimal::ZERO;
        };
        match self.per_hand_cap {
            Some(cap) => amount.min(cap),
            None => amount,
        }
    }

    /// The usable part of the sequence (snapshot sent with decisions).
    pub fn effective_sequence(&self) -> Vec<Decimal> {
        self.sequence[..self.layer_count()].to_vec()
    }

    /// Layer movement for a settled outcome. A configured reset takes
    /// precedence over an advance on the same outcome.
    pub fn transition_for(&self, outcome: SettlementOutcome) -> LayerTransition {
        match outcome {
            SettlementOutcome::Win => {
                if self.reset_on_win {
                    LayerTransition::Reset
                } else if self.advance_on == AdvanceRule::Win {
                    LayerTransition::Advance
                } else {
                    LayerTransition::Hold
                }
            }
            SettlementOutcome::Loss => {
                if self.reset_on_loss {
                    LayerTransition::Reset
                } else if self.advance_on == AdvanceRule::Loss {
                    LayerTransition::Advance
                } else {
                    LayerTransition::Hold
                }
            }
            SettlementOutcome::Skipped | SettlementOutcome::Cancelled => LayerTransition::Hold,
        }
    }

    /// Apply a transition to a layer index, capped at the last layer.
    pub fn apply(&self, index: usize, transition: LayerTransition) -> usize {
        match transition {
            LayerTransition::Advance => (index + 1).min(self.last_index()),
            LayerTransition::Reset => 0,
            LayerTransition::Hold => index.min(self.last_index()),
        }
    }
}

// ---------------------------------------------------------------------------
// Definition
// ---------------------------------------------------------------------------

/// Complete, immutable description of one strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyDefinition {
    pub key: StrategyKey,
    pub entry: EntryConfig,
    pub staking: StakingPlan,
    /// Explicit priority score; higher wins conflicts.
    #[serde(default)]
    pub priority: Option<Decimal>,
    /// Base confidence in [0, 1] used when no explicit priority is set.
    #[serde(default)]
    pub ev_weight: Option<Decimal>,
    #[serde(default)]
    pub cross_table: CrossTableMode,
    /// Tables bound at registration time.
    #[serde(default)]
    pub tables: Vec<TableId>,
    #[serde(default)]
    pub risk_levels: Vec<RiskLevel>,
}

impl StrategyDefinition {
    pub fn new(
        key: impl Into<StrategyKey>,
        pattern: Vec<Outcome>,
        target: Direction,
        sequence: Vec<Decimal>,
    ) -> Self {
        Self {
            key: key.into(),
            entry: EntryConfig {
                pattern,
                target,
                dedup: DedupMode::Strict,
                valid_window_secs: None,
            },
            staking: StakingPlan::new(sequence),
            priority: None,
            ev_weight: None,
            cross_table: CrossTableMode::Independent,
            tables: Vec::new(),
            risk_levels: Vec::new(),
        }
    }

    pub fn with_dedup(mut self, dedup: DedupMode) -> Self {
        self.entry.dedup = dedup;
        self
    }

    pub fn with_valid_window(mut self, secs: u64) -> Self {
        self.entry.valid_window_secs = Some(secs);
        self
    }

    pub fn with_staking(mut self, staking: StakingPlan) -> Self {
        self.staking = staking;
        self
    }

    pub fn with_priority(mut self, priority: Decimal) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_cross_table(mut self, mode: CrossTableMode) -> Self {
        self.cross_table = mode;
        self
    }

    pub fn with_tables<I, T>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TableId>,
    {
        self.tables = tables.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_risk_level(mut self, level: RiskLevel) -> Self {
        self.risk_levels.push(level);
        self
    }

    pub fn pattern_len(&self) -> usize {
        self.entry.pattern.len()
    }

    /// Reject definitions that can never produce a valid decision.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.key.is_empty() {
            return Err(EngineError::EmptyStrategyKey);
        }
        if self.entry.pattern.is_empty() {
            return Err(EngineError::EmptyPattern(self.key.clone()));
        }
        if self.staking.sequence.is_empty() {
            return Err(EngineError::EmptyStakingSequence(self.key.clone()));
        }
        if let Some((layer, value)) = self
            .staking
            .sequence
            .iter()
            .enumerate()
            .find(|(_, v)| **v <= Decimal::ZERO)
        {
            return Err(EngineError::NonPositiveStake {
                key: self.key.clone(),
                layer,
                value: *value,
            });
        }
        if self.staking.max_layers == Some(0) {
            return Err(EngineError::InvalidStrategy(
                self.key.clone(),
                "max_layers must be at least 1".into(),
            ));
        }
        if let Some(cap) = self.staking.per_hand_cap {
            if cap <= Decimal::ZERO {
                return Err(EngineError::InvalidStrategy(
                    self.key.clone(),
                    format!("per_hand_cap must be positive, got {cap}"),
                ));
            }
        }
        if let Some(secs) = self.entry.valid_window_secs {
            if secs == 0 || secs > MAX_DURATION_SECS {
                return Err(EngineError::InvalidStrategy(
                    self.key.clone(),
                    format!("valid_window_secs must be within 1..={MAX_DURATION_SECS}, got {secs}"),
                ));
            }
        }
        if let Some(w) = self.ev_weight {
            if w < Decimal::ZERO || w > Decimal::ONE {
                return Err(EngineError::InvalidStrategy(
                    self.key.clone(),
                    format!("ev_weight must be within [0, 1], got {w}"),
                ));
            }
        }
        for level in &self.risk_levels {
            level
                .validate()
                .map_err(|msg| EngineError::InvalidStrategy(self.key.clone(), msg))?;
        }
        Ok(())
    }

    /// Conflict priority for a decision at `layer`.
    ///
    /// An explicit `priority` wins outright. Otherwise the score is derived
    /// from `ev_weight` (default 0.5), nudged up on the first two layers and
    /// down past the fourth, clamped to [0, 1].
    pub fn priority_score(&self, layer: usize) -> Decimal {
        if let Some(p) = self.priority {
            return p;
        }
        let mut ev = self.ev_weight.unwrap_or(dec!(0.5));
        match layer {
            0 => ev += dec!(0.10),
            1 => ev += dec!(0.05),
            l if l > 3 => ev -= dec!(0.05) * Decimal::from(l - 3),
            _ => {}
        }
        ev.max(Decimal::ZERO).min(Decimal::ONE)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
