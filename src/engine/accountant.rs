//! Accountant: session PnL, per-strategy tallies and drawdown.
//!
//! Reconciles each batch of settlement records into the running session
//! statistics and reports what the batch changed.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::{SettlementOutcome, SettlementRecord, StrategyKey};

// ---------------------------------------------------------------------------
// Session statistics
// ---------------------------------------------------------------------------

/// Running totals for one strategy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StrategyTally {
    pub wins: u64,
    pub losses: u64,
    pub skipped: u64,
    pub cancelled: u64,
    pub staked: Decimal,
    pub pnl: Decimal,
}

impl StrategyTally {
    pub fn decided(&self) -> u64 {
        self.wins + self.losses
    }

    pub fn win_rate(&self) -> Option<Decimal> {
        let decided = self.decided();
        (decided > 0).then(|| Decimal::from(self.wins) / Decimal::from(decided))
    }
}

/// Running totals for the whole session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionStats {
    pub settled: u64,
    pub cumulative_pnl: Decimal,
    pub peak_pnl: Decimal,
    /// Largest drop from a PnL peak, as a positive amount.
    pub max_drawdown: Decimal,
    pub per_strategy: BTreeMap<StrategyKey, StrategyTally>,
    pub last_settled_at: Option<DateTime<Utc>>,
}

impl SessionStats {
    pub fn current_drawdown(&self) -> Decimal {
        self.peak_pnl - self.cumulative_pnl
    }

    pub fn tally(&self, key: &StrategyKey) -> Option<&StrategyTally> {
        self.per_strategy.get(key)
    }
}

// ---------------------------------------------------------------------------
// Reconcile report
// ---------------------------------------------------------------------------

/// What one reconciled batch contributed.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileReport {
    pub settled: usize,
    pub batch_pnl: Decimal,
    pub cumulative_pnl: Decimal,
    pub drawdown: Decimal,
    pub new_peak: bool,
}

// ---------------------------------------------------------------------------
// Accountant
// ---------------------------------------------------------------------------

pub struct Accountant;

impl Accountant {
    /// Fold a batch of settlements into `stats`.
    pub fn reconcile(stats: &mut SessionStats, records: &[SettlementRecord]) -> ReconcileReport {
        let peak_before = stats.peak_pnl;
        let mut batch_pnl = Decimal::ZERO;

        for record in records {
            let tally = stats.per_strategy.entry(record.strategy.clone()).or_default();
            match record.outcome {
                SettlementOutcome::Win => tally.wins += 1,
                SettlementOutcome::Loss => tally.losses += 1,
                SettlementOutcome::Skipped => tally.skipped += 1,
                SettlementOutcome::Cancelled => tally.cancelled += 1,
            }
            if record.outcome.is_decided() {
                tally.staked += record.stake;
            }
            tally.pnl += record.pnl;

            stats.settled += 1;
            stats.cumulative_pnl += record.pnl;
            batch_pnl += record.pnl;

            // Peak and drawdown follow each record, not only the batch end.
            if stats.cumulative_pnl > stats.peak_pnl {
                stats.peak_pnl = stats.cumulative_pnl;
            }
            let drawdown = stats.current_drawdown();
            if drawdown > stats.max_drawdown {
                stats.max_drawdown = drawdown;
            }
            stats.last_settled_at = Some(record.settled_at);
        }

        let report = ReconcileReport {
            settled: records.len(),
            batch_pnl,
            cumulative_pnl: stats.cumulative_pnl,
            drawdown: stats.current_drawdown(),
            new_peak: stats.peak_pnl > peak_before,
        };

        if !records.is_empty() {
            info!(
                settled = report.settled,
                batch_pnl = format!("{:.2}", report.batch_pnl),
                session_pnl = format!("{:.2}", report.cumulative_pnl),
                drawdown = format!("{:.2}", report.drawdown),
                "Settlements reconciled"
            );
        }
        if report.drawdown > Decimal::ZERO && report.drawdown == stats.max_drawdown && report.batch_pnl < Decimal::ZERO {
            warn!(drawdown = %report.drawdown, "New session max drawdown");
        }

        report
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LayerChange, Outcome, RoundId, TableId};
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn rec(key: &str, outcome: SettlementOutcome, pnl: Decimal) -> SettlementRecord {
        let table = TableId::from("T1");
        SettlementRecord {
            id: Uuid::new_v4(),
            round: RoundId::new(table.clone(), 1),
            table,
            strategy: StrategyKey::from(key),
            direction: Outcome::Banker,
            stake: dec!(100),
            outcome,
            pnl,
            layer: LayerChange::hold(0),
            settled_at: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        }
    }

    #[test]
    fn test_reconcile_accumulates_pnl() {
        let mut stats = SessionStats::default();
        let report = Accountant::reconcile(
            &mut stats,
            &[
                rec("a", SettlementOutcome::Win, dec!(95)),
                rec("a", SettlementOutcome::Loss, dec!(-100)),
            ],
        );
        assert_eq!(report.settled, 2);
        assert_eq!(report.batch_pnl, dec!(-5));
        assert_eq!(stats.cumulative_pnl, dec!(-5));
        assert_eq!(stats.peak_pnl, dec!(95));
        assert_eq!(stats.max_drawdown, dec!(100));
        assert!(report.new_peak);
    }

    #[test]
    fn test_reconcile_per_strategy_tally() {
        let mut stats = SessionStats::default();
        Accountant::reconcile(
            &mut stats,
            &[
                rec("a", SettlementOutcome::Win, dec!(95)),
                rec("b", SettlementOutcome::Skipped, Decimal::ZERO),
                rec("b", SettlementOutcome::Cancelled, Decimal::ZERO),
                rec("a", SettlementOutcome::Loss, dec!(-100)),
            ],
        );
        let a = stats.tally(&StrategyKey::from("a")).unwrap();
        assert_eq!((a.wins, a.losses), (1, 1));
        assert_eq!(a.staked, dec!(200));
        assert_eq!(a.win_rate(), Some(dec!(0.5)));

        let b = stats.tally(&StrategyKey::from("b")).unwrap();
        assert_eq!((b.skipped, b.cancelled), (1, 1));
        assert_eq!(b.staked, Decimal::ZERO);
        assert_eq!(b.win_rate(), None);
    }

    #[test]
    fn test_reconcile_empty_batch() {
        let mut stats = SessionStats::default();
        let report = Accountant::reconcile(&mut stats, &[]);
        assert_eq!(report.settled, 0);
        assert!(!report.new_peak);
        assert_eq!(stats, SessionStats::default());
    }

    #[test]
    fn test_drawdown_across_batches() {
        let mut stats = SessionStats::default();
        Accountant::reconcile(&mut stats, &[rec("a", SettlementOutcome::Win, dec!(200))]);
        Accountant::reconcile(&mut stats, &[rec("a", SettlementOutcome::Loss, dec!(-100))]);
        Accountant::reconcile(&mut stats, &[rec("a", SettlementOutcome::Loss, dec!(-100))]);
        assert_eq!(stats.current_drawdown(), dec!(200));
        assert_eq!(stats.max_drawdown, dec!(200));

        let report = Accountant::reconcile(&mut stats, &[rec("a", SettlementOutcome::Win, dec!(300))]);
        assert!(report.new_peak);
        assert_eq!(report.drawdown, Decimal::ZERO);
        assert_eq!(stats.max_drawdown, dec!(200));
    }
}
