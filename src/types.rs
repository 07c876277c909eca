//! Shared types for the AUTOBET engine.
//!
//! These types form the data model used across all modules.
//! Identifiers, outcome symbols, decisions and settlement records live here
//! so that strategy and engine modules can depend on them without circular
//! references.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Identifier of a physical/virtual game table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableId(String);

impl TableId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TableId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TableId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Unique key of a registered strategy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StrategyKey(String);

impl StrategyKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for StrategyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StrategyKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for StrategyKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Round identifier, derived from the detection time of the outcome that
/// opened the round. Unique and totally ordered within a table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoundId {
    pub table: TableId,
    /// Detection time in epoch milliseconds, bumped by one when two
    /// detections share the same millisecond.
    pub stamp_ms: i64,
}

impl RoundId {
    pub fn new(table: TableId, stamp_ms: i64) -> Self {
        Self { table, stamp_ms }
    }
}

impl PartialOrd for RoundId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RoundId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.table
            .cmp(&other.table)
            .then(self.stamp_ms.cmp(&other.stamp_ms))
    }
}

impl fmt::Display for RoundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "round-{}-{}", self.table, self.stamp_ms)
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Result of a round, and equally the direction a bet is placed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    #[serde(alias = "B", alias = "b", alias = "BANKER", alias = "Banker")]
    Banker,
    #[serde(alias = "P", alias = "p", alias = "PLAYER", alias = "Player")]
    Player,
    #[serde(alias = "T", alias = "t", alias = "TIE", alias = "Tie")]
    Tie,
}

/// A bet direction is expressed with the same symbols as an outcome.
pub type Direction = Outcome;

impl Outcome {
    pub const ALL: &'static [Outcome] = &[Outcome::Banker, Outcome::Player, Outcome::Tie];

    /// Single-letter code used in compact history logs.
    pub fn code(&self) -> char {
        match self {
            Outcome::Banker => 'B',
            Outcome::Player => 'P',
            Outcome::Tie => 'T',
        }
    }

    /// The mutually exclusive direction. Tie has none.
    pub fn opposite(&self) -> Option<Self> {
        match self {
            Outcome::Banker => Some(Outcome::Player),
            Outcome::Player => Some(Outcome::Banker),
            Outcome::Tie => None,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Banker => write!(f, "banker"),
            Outcome::Player => write!(f, "player"),
            Outcome::Tie => write!(f, "tie"),
        }
    }
}

/// Parse an outcome symbol (case-insensitive, full name or single letter).
impl std::str::FromStr for Outcome {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "b" | "banker" => Ok(Outcome::Banker),
            "p" | "player" => Ok(Outcome::Player),
            "t" | "tie" => Ok(Outcome::Tie),
            _ => Err(EngineError::InvalidOutcome(s.to_string())),
        }
    }
}

/// Render a sequence of outcomes compactly, e.g. `PPB`.
pub fn format_outcomes(outcomes: &[Outcome]) -> String {
    outcomes.iter().map(Outcome::code).collect()
}

/// Lifecycle phase of a table's current round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoundPhase {
    Settling,
    Bettable,
    Locked,
    Idle,
}

impl fmt::Display for RoundPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoundPhase::Settling => write!(f, "SETTLING"),
            RoundPhase::Bettable => write!(f, "BETTABLE"),
            RoundPhase::Locked => write!(f, "LOCKED"),
            RoundPhase::Idle => write!(f, "IDLE"),
        }
    }
}

/// How overlapping pattern matches are deduplicated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DedupMode {
    /// A new window may not overlap the last consumed window.
    #[default]
    Strict,
    /// Every fresh window end that matches is eligible.
    Overlap,
}

/// Which settled outcome advances the staking layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AdvanceRule {
    #[default]
    #[serde(alias = "on_loss")]
    Loss,
    #[serde(alias = "on_win")]
    Win,
}

/// Whether a strategy's layer is tracked per table or shared across tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CrossTableMode {
    #[default]
    Independent,
    Accumulate,
}

/// Result of settling one position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SettlementOutcome {
    Win,
    Loss,
    /// Tie against a banker/player bet: stake returned.
    Skipped,
    /// Round voided externally.
    Cancelled,
}

impl SettlementOutcome {
    /// Whether the outcome decided the bet (win or loss).
    pub fn is_decided(&self) -> bool {
        matches!(self, SettlementOutcome::Win | SettlementOutcome::Loss)
    }
}

impl fmt::Display for SettlementOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettlementOutcome::Win => write!(f, "WIN"),
            SettlementOutcome::Loss => write!(f, "LOSS"),
            SettlementOutcome::Skipped => write!(f, "SKIPPED"),
            SettlementOutcome::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// Movement of the staking layer after a settlement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerTransition {
    Advance,
    Reset,
    Hold,
}

impl fmt::Display for LayerTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayerTransition::Advance => write!(f, "advance"),
            LayerTransition::Reset => write!(f, "reset"),
            LayerTransition::Hold => write!(f, "hold"),
        }
    }
}

/// A layer transition as actually applied to a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerChange {
    pub transition: LayerTransition,
    pub from: usize,
    pub to: usize,
}

impl LayerChange {
    pub fn hold(index: usize) -> Self {
        Self {
            transition: LayerTransition::Hold,
            from: index,
            to: index,
        }
    }
}

// ---------------------------------------------------------------------------
// Inbound events
// ---------------------------------------------------------------------------

/// An outcome observed on a table by the external observer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeEvent {
    pub table: TableId,
    pub outcome: Outcome,
    pub detected_at: DateTime<Utc>,
}

impl OutcomeEvent {
    pub fn new(table: impl Into<TableId>, outcome: Outcome, detected_at: DateTime<Utc>) -> Self {
        Self {
            table: table.into(),
            outcome,
            detected_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

/// A candidate bet produced by the entry evaluator, consumed by the
/// conflict resolver within one evaluation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateDecision {
    pub table: TableId,
    pub round: RoundId,
    pub strategy: StrategyKey,
    pub direction: Direction,
    pub amount: Decimal,
    pub layer_index: usize,
    /// Higher wins during conflict resolution.
    pub priority_score: Decimal,
    pub decided_at: DateTime<Utc>,
    /// Registration sequence of the strategy (lower declared first).
    pub declaration_order: u64,
}

impl fmt::Display for CandidateDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {} ${:.2} layer={} score={:.3}",
            self.round, self.strategy, self.direction, self.amount, self.layer_index, self.priority_score,
        )
    }
}

/// A decision approved for execution, as handed to the actuator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovedDecision {
    pub table: TableId,
    pub round: RoundId,
    pub strategy: StrategyKey,
    pub direction: Direction,
    pub amount: Decimal,
    pub layer_index: usize,
    pub staking_sequence: Vec<Decimal>,
    pub on_win: LayerTransition,
    pub on_loss: LayerTransition,
    pub decided_at: DateTime<Utc>,
}

impl fmt::Display for ApprovedDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} bet {} ${:.2} (layer {}/{}, win→{}, loss→{})",
            self.round,
            self.strategy,
            self.direction,
            self.amount,
            self.layer_index + 1,
            self.staking_sequence.len(),
            self.on_win,
            self.on_loss,
        )
    }
}

// ---------------------------------------------------------------------------
// Settlement
// ---------------------------------------------------------------------------

/// Immutable record of a settled position. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementRecord {
    pub id: Uuid,
    pub table: TableId,
    pub round: RoundId,
    pub strategy: StrategyKey,
    pub direction: Direction,
    pub stake: Decimal,
    pub outcome: SettlementOutcome,
    pub pnl: Decimal,
    pub layer: LayerChange,
    pub settled_at: DateTime<Utc>,
}

impl fmt::Display for SettlementRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.pnl >= Decimal::ZERO { "+" } else { "" };
        write!(
            f,
            "[{}] {} {} ${:.2} → {} ({sign}{:.2}) layer {}→{}",
            self.round,
            self.strategy,
            self.direction,
            self.stake,
            self.outcome,
            self.pnl,
            self.layer.from,
            self.layer.to,
        )
    }
}

/// Outbound settlement notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementNotice {
    pub table: TableId,
    pub round: RoundId,
    pub strategy: StrategyKey,
    pub outcome: SettlementOutcome,
    pub pnl: Decimal,
}

impl From<&SettlementRecord> for SettlementNotice {
    fn from(record: &SettlementRecord) -> Self {
        Self {
            table: record.table.clone(),
            round: record.round.clone(),
            strategy: record.strategy.clone(),
            outcome: record.outcome,
            pnl: record.pnl,
        }
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Domain-specific error types for AUTOBET.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error("Strategy key cannot be empty")]
    EmptyStrategyKey,

    #[error("Strategy {0}: entry pattern cannot be empty")]
    EmptyPattern(StrategyKey),

    #[error("Strategy {0}: staking sequence cannot be empty")]
    EmptyStakingSequence(StrategyKey),

    #[error("Strategy {key}: stake at layer {layer} must be positive, got {value}")]
    NonPositiveStake {
        key: StrategyKey,
        layer: usize,
        value: Decimal,
    },

    #[error("Strategy {0}: invalid configuration: {1}")]
    InvalidStrategy(StrategyKey, String),

    #[error("Duplicate strategy key: {0}")]
    DuplicateStrategy(StrategyKey),

    #[error("Strategy not registered: {0}")]
    UnknownStrategy(StrategyKey),

    #[error("Unknown outcome symbol: {0}")]
    InvalidOutcome(String),

    #[error("Position already open: {strategy} in {round}")]
    DuplicatePosition { round: RoundId, strategy: StrategyKey },

    #[error("Stale event on table {table}: {detected_at} is not after {last_processed}")]
    StaleEvent {
        table: TableId,
        detected_at: DateTime<Utc>,
        last_processed: DateTime<Utc>,
    },

    #[error("Round {requested} is not the current round of table {table}")]
    RoundMismatch { table: TableId, requested: RoundId },

    #[error("Engine has been stopped")]
    Stopped,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
