//! Signal history tracking.
//!
//! One [`SignalTracker`] per (table, strategy) keeps a bounded, time-ordered
//! history of observed outcomes and decides whether the strategy's entry
//! pattern has just been completed. Indices are absolute (they keep counting
//! after old entries fall out of the ring), so dedup bookkeeping survives
//! eviction.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use super::StrategyDefinition;
use crate::types::{format_outcomes, DedupMode, Outcome, StrategyKey, TableId};

/// Default number of outcomes kept per tracker.
pub const DEFAULT_HISTORY_CAPACITY: usize = 20;

#[derive(Debug, Clone)]
pub struct SignalTracker {
    pattern: Vec<Outcome>,
    dedup: DedupMode,
    valid_window: Option<Duration>,
    capacity: usize,
    history: VecDeque<(Outcome, DateTime<Utc>)>,
    /// Total outcomes ever recorded (absolute index of the next entry).
    recorded: u64,
    /// Absolute index of the last entry of the last triggered window.
    last_trigger_end: Option<u64>,
}

impl SignalTracker {
    /// Build a tracker for a definition. The capacity never drops below the
    /// pattern length.
    pub fn new(definition: &StrategyDefinition, capacity: usize) -> Self {
        Self {
            pattern: definition.entry.pattern.clone(),
            dedup: definition.entry.dedup,
            valid_window: definition
                .entry
                .valid_window_secs
                .and_then(|s| i64::try_from(s).ok())
                .and_then(Duration::try_seconds),
            capacity: capacity.max(definition.pattern_len()),
            history: VecDeque::new(),
            recorded: 0,
            last_trigger_end: None,
        }
    }

    /// Append an observed outcome. The caller is responsible for skipping
    /// rounds the strategy participated in.
    pub fn record(&mut self, outcome: Outcome, at: DateTime<Utc>) {
        self.history.push_back((outcome, at));
        self.recorded += 1;
        while self.history.len() > self.capacity {
            self.history.pop_front();
        }
    }

    /// Whether the newest window completes the pattern and is eligible under
    /// the dedup policy. A positive answer consumes the window.
    pub fn should_trigger(&mut self, now: DateTime<Utc>) -> bool {
        let k = self.pattern.len();
        if k == 0 || self.history.len() < k {
            return false;
        }

        let window_start_pos = self.history.len() - k;
        let matches = self
            .history
            .iter()
            .skip(window_start_pos)
            .map(|(o, _)| *o)
            .eq(self.pattern.iter().copied());
        if !matches {
            return false;
        }

        if let Some(max_age) = self.valid_window {
            let (_, first_at) = self.history[window_start_pos];
            if now - first_at > max_age {
                debug!(age_secs = (now - first_at).num_seconds(), "Pattern window expired");
                return false;
            }
        }

        let end = self.recorded - 1;
        let start = self.recorded - k as u64;
        let eligible = match (self.dedup, self.last_trigger_end) {
            (_, None) => true,
            (DedupMode::Strict, Some(last_end)) => start > last_end,
            (DedupMode::Overlap, Some(last_end)) => end > last_end,
        };
        if !eligible {
            return false;
        }

        self.last_trigger_end = Some(end);
        true
    }

    /// The most recent `n` outcomes, oldest first.
    pub fn recent(&self, n: usize) -> Vec<Outcome> {
        let skip = self.history.len().saturating_sub(n);
        self.history.iter().skip(skip).map(|(o, _)| *o).collect()
    }

    /// The full retained history, oldest first.
    pub fn history(&self) -> Vec<Outcome> {
        self.history.iter().map(|(o, _)| *o).collect()
    }

    pub fn pattern(&self) -> &[Outcome] {
        &self.pattern
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn total_recorded(&self) -> u64 {
        self.recorded
    }

    pub fn last_trigger_end(&self) -> Option<u64> {
        self.last_trigger_end
    }

    fn is_for(&self, definition: &StrategyDefinition) -> bool {
        self.pattern == definition.entry.pattern && self.dedup == definition.entry.dedup
    }
}

// ---------------------------------------------------------------------------
// Tracker book
// ---------------------------------------------------------------------------

/// All trackers, keyed by (table, strategy).
#[derive(Debug)]
pub struct TrackerBook {
    capacity: usize,
    trackers: HashMap<(TableId, StrategyKey), SignalTracker>,
}

impl Default for TrackerBook {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl TrackerBook {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            trackers: HashMap::new(),
        }
    }

    /// Tracker for (table, strategy), created on first use. A tracker built
    /// for a different entry config under the same key is replaced.
    pub fn tracker_mut(&mut self, table: &TableId, definition: &StrategyDefinition) -> &mut SignalTracker {
        let key = (table.clone(), definition.key.clone());
        let capacity = self.capacity;
        let tracker = self
            .trackers
            .entry(key)
            .or_insert_with(|| SignalTracker::new(definition, capacity));
        if !tracker.is_for(definition) {
            debug!(table = %table, strategy = %definition.key, "Entry config changed, resetting tracker");
            *tracker = SignalTracker::new(definition, capacity);
        }
        tracker
    }

    pub fn get(&self, table: &TableId, key: &StrategyKey) -> Option<&SignalTracker> {
        self.trackers.get(&(table.clone(), key.clone()))
    }

    /// Record an outcome for one strategy and log the resulting history.
    pub fn record(&mut self, table: &TableId, definition: &StrategyDefinition, outcome: Outcome, at: DateTime<Utc>) {
        let tracker = self.tracker_mut(table, definition);
        tracker.record(outcome, at);
        debug!(
            table = %table,
            strategy = %definition.key,
            outcome = %outcome,
            history = %format_outcomes(&tracker.recent(10)),
            "Outcome recorded"
        );
    }

    pub fn len(&self) -> usize {
        self.trackers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trackers.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
