//! Risk coordinator.
//!
//! A gate consulted before any strategy triggers. Session-wide stop-loss and
//! take-profit come from [`RiskConfig`]; per-strategy [`RiskLevel`]s watch
//! counters kept per scope (session, table, table+strategy line, strategy
//! across tables) and pause, halt or merely notify when a threshold is hit.
//!
//! The only mutations are counter updates driven by settlements and the
//! freezes those updates produce.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{StrategyDefinition, MAX_DURATION_SECS};
use crate::types::{SettlementOutcome, SettlementRecord, StrategyKey, TableId};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Session-wide limits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Maximum session loss, as a positive amount.
    #[serde(default)]
    pub session_stop_loss: Option<Decimal>,
    /// Session profit at which evaluation stops.
    #[serde(default)]
    pub session_take_profit: Option<Decimal>,
    /// Maximum total stake committed on one table+round.
    #[serde(default)]
    pub per_round_cap: Option<Decimal>,
}

impl RiskConfig {
    /// Every configured limit must be a positive amount.
    pub fn validate(&self) -> Result<(), String> {
        let limits = [
            ("session_stop_loss", self.session_stop_loss),
            ("session_take_profit", self.session_take_profit),
            ("per_round_cap", self.per_round_cap),
        ];
        for (name, value) in limits {
            if let Some(v) = value.filter(|v| *v <= Decimal::ZERO) {
                return Err(format!("{name} must be positive, got {v}"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskScope {
    /// Every settlement in the session.
    Session,
    /// Every strategy on one table.
    Table,
    /// One strategy on one table.
    Line,
    /// One strategy across all tables.
    Strategy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RiskAction {
    /// Halt evaluation for the whole session.
    StopAll,
    /// Freeze the scope, for `cooldown_secs` or until the session is reset.
    #[default]
    Pause,
    /// Emit the event and carry on.
    Notify,
}

impl fmt::Display for RiskAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskAction::StopAll => write!(f, "stop_all"),
            RiskAction::Pause => write!(f, "pause"),
            RiskAction::Notify => write!(f, "notify"),
        }
    }
}

/// One threshold set attached to a strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskLevel {
    pub scope: RiskScope,
    #[serde(default)]
    pub take_profit: Option<Decimal>,
    /// Positive loss amount.
    #[serde(default)]
    pub stop_loss: Option<Decimal>,
    #[serde(default)]
    pub max_consecutive_losses: Option<u32>,
    #[serde(default)]
    pub action: RiskAction,
    #[serde(default)]
    pub cooldown_secs: Option<u64>,
}

impl RiskLevel {
    pub fn new(scope: RiskScope, action: RiskAction) -> Self {
        Self {
            scope,
            take_profit: None,
            stop_loss: None,
            max_consecutive_losses: None,
            action,
            cooldown_secs: None,
        }
    }

    pub fn with_stop_loss(mut self, amount: Decimal) -> Self {
        self.stop_loss = Some(amount);
        self
    }

    pub fn with_take_profit(mut self, amount: Decimal) -> Self {
        self.take_profit = Some(amount);
        self
    }

    pub fn with_max_losses(mut self, count: u32) -> Self {
        self.max_consecutive_losses = Some(count);
        self
    }

    pub fn with_cooldown(mut self, secs: u64) -> Self {
        self.cooldown_secs = Some(secs);
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.take_profit.is_none() && self.stop_loss.is_none() && self.max_consecutive_losses.is_none() {
            return Err(format!("risk level ({:?}) has no threshold", self.scope));
        }
        if self.take_profit.is_some_and(|v| v <= Decimal::ZERO) {
            return Err("take_profit must be positive".into());
        }
        if self.stop_loss.is_some_and(|v| v <= Decimal::ZERO) {
            return Err("stop_loss must be a positive loss amount".into());
        }
        if self.max_consecutive_losses == Some(0) {
            return Err("max_consecutive_losses must be at least 1".into());
        }
        if let Some(secs) = self.cooldown_secs.filter(|s| *s == 0 || *s > MAX_DURATION_SECS) {
            return Err(format!("cooldown_secs must be within 1..={MAX_DURATION_SECS}, got {secs}"));
        }
        Ok(())
    }

    /// Which threshold the counters cross, if any. Stop-loss is checked first.
    fn breached(&self, counters: &Counters) -> Option<RiskTrigger> {
        if self.stop_loss.is_some_and(|sl| counters.pnl <= -sl) {
            return Some(RiskTrigger::StopLoss);
        }
        if self.take_profit.is_some_and(|tp| counters.pnl >= tp) {
            return Some(RiskTrigger::TakeProfit);
        }
        if self
            .max_consecutive_losses
            .is_some_and(|n| counters.loss_streak >= n)
        {
            return Some(RiskTrigger::LossStreak);
        }
        None
    }
}

// ---------------------------------------------------------------------------
// Counters and events
// ---------------------------------------------------------------------------

/// Concrete scope instance a counter or freeze is keyed by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ScopeKey {
    Session,
    Table(TableId),
    Line(TableId, StrategyKey),
    Strategy(StrategyKey),
}

impl ScopeKey {
    pub fn for_scope(scope: RiskScope, table: &TableId, strategy: &StrategyKey) -> Self {
        match scope {
            RiskScope::Session => ScopeKey::Session,
            RiskScope::Table => ScopeKey::Table(table.clone()),
            RiskScope::Line => ScopeKey::Line(table.clone(), strategy.clone()),
            RiskScope::Strategy => ScopeKey::Strategy(strategy.clone()),
        }
    }

    /// Every scope instance a (table, strategy) settlement contributes to.
    fn all_for(table: &TableId, strategy: &StrategyKey) -> [ScopeKey; 4] {
        [
            ScopeKey::Session,
            ScopeKey::Table(table.clone()),
            ScopeKey::Line(table.clone(), strategy.clone()),
            ScopeKey::Strategy(strategy.clone()),
        ]
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeKey::Session => write!(f, "session"),
            ScopeKey::Table(t) => write!(f, "table:{t}"),
            ScopeKey::Line(t, s) => write!(f, "line:{t}:{s}"),
            ScopeKey::Strategy(s) => write!(f, "strategy:{s}"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Counters {
    pub pnl: Decimal,
    pub loss_streak: u32,
}

impl Counters {
    fn apply(&mut self, outcome: SettlementOutcome, pnl: Decimal) {
        self.pnl += pnl;
        match outcome {
            SettlementOutcome::Loss => self.loss_streak += 1,
            SettlementOutcome::Win => self.loss_streak = 0,
            SettlementOutcome::Skipped | SettlementOutcome::Cancelled => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTrigger {
    StopLoss,
    TakeProfit,
    LossStreak,
}

impl fmt::Display for RiskTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskTrigger::StopLoss => write!(f, "stop_loss"),
            RiskTrigger::TakeProfit => write!(f, "take_profit"),
            RiskTrigger::LossStreak => write!(f, "loss_streak"),
        }
    }
}

/// Emitted when a risk level fires.
#[derive(Debug, Clone, PartialEq)]
pub struct RiskEvent {
    pub strategy: StrategyKey,
    pub table: TableId,
    pub scope: ScopeKey,
    pub trigger: RiskTrigger,
    pub action: RiskAction,
    /// End of the freeze for `Pause`; `None` means until the session reset.
    pub until: Option<DateTime<Utc>>,
    pub at: DateTime<Utc>,
}

impl RiskEvent {
    /// A pause on a line scope is applied to the line's own state.
    pub fn is_line_pause(&self) -> bool {
        self.action == RiskAction::Pause && matches!(self.scope, ScopeKey::Line(..))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RiskSnapshot {
    pub session_pnl: Decimal,
    pub halted: bool,
    pub counters: BTreeMap<String, Counters>,
    pub frozen: Vec<String>,
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct RiskState {
    levels: HashMap<StrategyKey, Vec<RiskLevel>>,
    counters: HashMap<ScopeKey, Counters>,
    session_pnl: Decimal,
    /// Active freezes. `None` = until the session is reset.
    freezes: HashMap<ScopeKey, Option<DateTime<Utc>>>,
    halted: bool,
}

/// Thread-safe risk gate. Reads take a shared lock; settlement updates take
/// the exclusive one briefly.
#[derive(Debug)]
pub struct RiskCoordinator {
    config: RiskConfig,
    state: RwLock<RiskState>,
}

impl RiskCoordinator {
    pub fn new(config: RiskConfig) -> Self {
        Self {
            config,
            state: RwLock::new(RiskState::default()),
        }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Track a strategy's risk levels. Re-registering replaces them.
    pub fn register_strategy(&self, definition: &StrategyDefinition) {
        self.state
            .write()
            .levels
            .insert(definition.key.clone(), definition.risk_levels.clone());
    }

    pub fn unregister_strategy(&self, key: &StrategyKey) {
        self.state.write().levels.remove(key);
    }

    /// Whether `strategy` may trigger on `table` at `now`.
    ///
    /// An unknown strategy is reported and treated as not blocked.
    pub fn is_blocked(&self, strategy: &StrategyKey, table: &TableId, now: DateTime<Utc>) -> bool {
        let state = self.state.read();
        if state.halted {
            return true;
        }
        if self.session_limit_hit(state.session_pnl).is_some() {
            return true;
        }
        if !state.levels.contains_key(strategy) {
            warn!(strategy = %strategy, table = %table, "No risk state for strategy, treating as not blocked");
            return false;
        }
        [
            ScopeKey::Session,
            ScopeKey::Table(table.clone()),
            ScopeKey::Strategy(strategy.clone()),
        ]
        .iter()
        .any(|key| match state.freezes.get(key) {
            Some(None) => true,
            Some(Some(until)) => now < *until,
            None => false,
        })
    }

    /// Whether adding `amount` to what is already committed on the round
    /// would exceed the per-round cap.
    pub fn exceeds_round_cap(&self, committed: Decimal, amount: Decimal) -> bool {
        self.config
            .per_round_cap
            .is_some_and(|cap| committed + amount > cap)
    }

    /// Fold a settlement into every scope's counters and evaluate the
    /// strategy's risk levels. Counters of a scope restart from zero when a
    /// level on that scope fires.
    pub fn record_settlement(&self, record: &SettlementRecord) -> Vec<RiskEvent> {
        let mut state = self.state.write();
        let at = record.settled_at;

        state.session_pnl += record.pnl;
        for key in ScopeKey::all_for(&record.table, &record.strategy) {
            state
                .counters
                .entry(key)
                .or_default()
                .apply(record.outcome, record.pnl);
        }

        let mut events = Vec::new();

        if let Some(trigger) = self.session_limit_hit(state.session_pnl) {
            if !state.halted {
                state.halted = true;
                warn!(session_pnl = %state.session_pnl, trigger = %trigger, "Session limit hit, halting");
                events.push(RiskEvent {
                    strategy: record.strategy.clone(),
                    table: record.table.clone(),
                    scope: ScopeKey::Session,
                    trigger,
                    action: RiskAction::StopAll,
                    until: None,
                    at,
                });
            }
        }

        let levels = state.levels.get(&record.strategy).cloned().unwrap_or_default();
        for level in &levels {
            let key = ScopeKey::for_scope(level.scope, &record.table, &record.strategy);
            let counters = state.counters.get(&key).copied().unwrap_or_default();
            let Some(trigger) = level.breached(&counters) else {
                continue;
            };

            let until = level.cooldown_secs.and_then(|secs| {
                let until = i64::try_from(secs)
                    .ok()
                    .and_then(Duration::try_seconds)
                    .and_then(|d| at.checked_add_signed(d));
                if until.is_none() {
                    warn!(strategy = %record.strategy, cooldown_secs = secs, "Cooldown out of range, freezing until reset");
                }
                until
            });
            match level.action {
                RiskAction::StopAll => state.halted = true,
                RiskAction::Pause => {
                    if !matches!(key, ScopeKey::Line(..)) {
                        state.freezes.insert(key.clone(), until);
                    }
                }
                RiskAction::Notify => {}
            }
            state.counters.insert(key.clone(), Counters::default());

            info!(
                strategy = %record.strategy,
                table = %record.table,
                scope = %key,
                trigger = %trigger,
                action = %level.action,
                pnl = %counters.pnl,
                loss_streak = counters.loss_streak,
                "Risk level triggered"
            );
            events.push(RiskEvent {
                strategy: record.strategy.clone(),
                table: record.table.clone(),
                scope: key,
                trigger,
                action: level.action,
                until,
                at,
            });
        }
        events
    }

    /// Drop freezes whose cooldown has elapsed. Returns how many were lifted.
    pub fn refresh(&self, now: DateTime<Utc>) -> usize {
        let mut state = self.state.write();
        let before = state.freezes.len();
        state.freezes.retain(|key, until| {
            let keep = until.map_or(true, |u| now < u);
            if !keep {
                debug!(scope = %key, "Risk freeze lifted");
            }
            keep
        });
        before - state.freezes.len()
    }

    /// Clear counters, freezes and the halt flag. Registered levels stay.
    pub fn reset_session(&self) {
        let mut state = self.state.write();
        state.counters.clear();
        state.freezes.clear();
        state.session_pnl = Decimal::ZERO;
        state.halted = false;
        info!("Risk session reset");
    }

    pub fn is_halted(&self) -> bool {
        self.state.read().halted
    }

    pub fn session_pnl(&self) -> Decimal {
        self.state.read().session_pnl
    }

    pub fn counters(&self, key: &ScopeKey) -> Counters {
        self.state.read().counters.get(key).copied().unwrap_or_default()
    }

    pub fn snapshot(&self) -> RiskSnapshot {
        let state = self.state.read();
        let mut frozen: Vec<String> = state.freezes.keys().map(|k| k.to_string()).collect();
        frozen.sort();
        RiskSnapshot {
            session_pnl: state.session_pnl,
            halted: state.halted,
            counters: state
                .counters
                .iter()
                .map(|(k, c)| (k.to_string(), *c))
                .collect(),
            frozen,
        }
    }

    fn session_limit_hit(&self, session_pnl: Decimal) -> Option<RiskTrigger> {
        if self
            .config
            .session_stop_loss
            .is_some_and(|sl| session_pnl <= -sl)
        {
            return Some(RiskTrigger::StopLoss);
        }
        if self
            .config
            .session_take_profit
            .is_some_and(|tp| session_pnl >= tp)
        {
            return Some(RiskTrigger::TakeProfit);
        }
        None
    }
}

impl Default for RiskCoordinator {
    fn default() -> Self {
        Self::new(RiskConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
