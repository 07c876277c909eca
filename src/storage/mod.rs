//! Audit ledger.
//!
//! Append-only JSON lines of settlement records, one per line. The ledger is
//! not needed for the engine to run; it lets a session's cumulative PnL and
//! layer history be reconstructed afterwards.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::types::{LayerChange, RoundId, SettlementRecord, StrategyKey};

/// Default ledger file path.
pub const DEFAULT_LEDGER_FILE: &str = "autobet_ledger.jsonl";

/// Append records to the ledger, creating the file if needed.
pub fn append(records: &[SettlementRecord], path: Option<&str>) -> Result<()> {
    if records.is_empty() {
        return Ok(());
    }
    let path = path.unwrap_or(DEFAULT_LEDGER_FILE);

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .context(format!("Failed to open ledger {path}"))?;

    let mut buf = String::new();
    for record in records {
        let line = serde_json::to_string(record)
            .context(format!("Failed to serialise settlement {}", record.id))?;
        buf.push_str(&line);
        buf.push('\n');
    }
    file.write_all(buf.as_bytes())
        .context(format!("Failed to append to ledger {path}"))?;

    debug!(path, records = records.len(), "Ledger appended");
    Ok(())
}

/// Load every record from the ledger. A missing file is an empty ledger.
///
/// A line that fails to parse is an error: the ledger is only ever written
/// by [`append`], so a bad line means the file is corrupt.
pub fn load(path: Option<&str>) -> Result<Vec<SettlementRecord>> {
    let path = path.unwrap_or(DEFAULT_LEDGER_FILE);

    if !Path::new(path).exists() {
        info!(path, "No ledger found, starting fresh");
        return Ok(Vec::new());
    }

    let file = std::fs::File::open(path).context(format!("Failed to read ledger {path}"))?;
    let mut records = Vec::new();
    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line.context(format!("Failed to read line {} of {path}", n + 1))?;
        if line.trim().is_empty() {
            continue;
        }
        let record: SettlementRecord = serde_json::from_str(&line)
            .context(format!("Failed to parse line {} of {path}", n + 1))?;
        records.push(record);
    }

    info!(path, records = records.len(), "Ledger loaded");
    Ok(records)
}

/// Delete the ledger file (for testing or reset).
pub fn delete(path: Option<&str>) -> Result<()> {
    let path = path.unwrap_or(DEFAULT_LEDGER_FILE);
    if Path::new(path).exists() {
        std::fs::remove_file(path).context(format!("Failed to delete ledger {path}"))?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Replay
// ---------------------------------------------------------------------------

/// One strategy's history as reconstructed from the ledger.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StrategyReplay {
    pub cumulative_pnl: Decimal,
    /// Applied layer changes, in ledger order.
    pub layers: Vec<(RoundId, LayerChange)>,
}

impl StrategyReplay {
    /// Layer the strategy sat on after its last settlement.
    pub fn current_layer(&self) -> Option<usize> {
        self.layers.last().map(|(_, change)| change.to)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LedgerReplay {
    pub records: usize,
    pub total_pnl: Decimal,
    pub per_strategy: BTreeMap<StrategyKey, StrategyReplay>,
}

/// Rebuild per-strategy PnL and layer history from ledger records.
pub fn replay(records: &[SettlementRecord]) -> LedgerReplay {
    let mut out = LedgerReplay::default();
    let mut last_round: BTreeMap<&StrategyKey, &RoundId> = BTreeMap::new();

    for record in records {
        if let Some(prev) = last_round.get(&record.strategy) {
            if record.round.table == prev.table && record.round < **prev {
                warn!(
                    strategy = %record.strategy,
                    round = %record.round,
                    previous = %prev,
                    "Ledger out of round order"
                );
            }
        }
        last_round.insert(&record.strategy, &record.round);

        let entry = out.per_strategy.entry(record.strategy.clone()).or_default();
        entry.cumulative_pnl += record.pnl;
        entry.layers.push((record.round.clone(), record.layer));
        out.total_pnl += record.pnl;
        out.records += 1;
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LayerTransition, Outcome, SettlementOutcome, TableId};
    use chrono::DateTime;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn temp_path() -> String {
        let mut p = std::env::temp_dir();
        p.push(format!("autobet_test_ledger_{}.jsonl", Uuid::new_v4()));
        p.to_string_lossy().to_string()
    }

    fn rec(key: &str, stamp: i64, outcome: SettlementOutcome, pnl: Decimal, layer: LayerChange) -> SettlementRecord {
        let table = TableId::from("T1");
        SettlementRecord {
            id: Uuid::new_v4(),
            round: RoundId::new(table.clone(), stamp),
            table,
            strategy: StrategyKey::from(key),
            direction: Outcome::Banker,
            stake: dec!(100),
            outcome,
            pnl,
            layer,
            settled_at: DateTime::from_timestamp(1_700_000_000 + stamp, 0).unwrap(),
        }
    }

    fn advance(from: usize, to: usize) -> LayerChange {
        LayerChange {
            transition: LayerTransition::Advance,
            from,
            to,
        }
    }

    fn reset(from: usize) -> LayerChange {
        LayerChange {
            transition: LayerTransition::Reset,
            from,
            to: 0,
        }
    }

    #[test]
    fn test_append_and_load() {
        let path = temp_path();
        let first = rec("a", 1, SettlementOutcome::Loss, dec!(-100), advance(0, 1));
        let second = rec("a", 2, SettlementOutcome::Win, dec!(190), reset(1));

        append(&[first.clone()], Some(&path)).unwrap();
        append(&[second.clone()], Some(&path)).unwrap();

        let loaded = load(Some(&path)).unwrap();
        assert_eq!(loaded, vec![first, second]);

        delete(Some(&path)).unwrap();
    }

    #[test]
    fn test_load_nonexistent() {
        let loaded = load(Some("/tmp/autobet_nonexistent_ledger_12345.jsonl")).unwrap();
        assert!(loaded.is_empty());
    }

    #[test]
    fn test_load_corrupt_line_fails() {
        let path = temp_path();
        append(&[rec("a", 1, SettlementOutcome::Skipped, Decimal::ZERO, LayerChange::hold(0))], Some(&path)).unwrap();
        std::fs::write(&path, format!("{}not json\n", std::fs::read_to_string(&path).unwrap())).unwrap();

        let err = load(Some(&path)).unwrap_err();
        assert!(err.to_string().contains("line 2"));

        delete(Some(&path)).unwrap();
    }

    #[test]
    fn test_append_empty_creates_nothing() {
        let path = temp_path();
        append(&[], Some(&path)).unwrap();
        assert!(!Path::new(&path).exists());
    }

    #[test]
    fn test_replay_reconstructs_strategies() {
        let records = vec![
            rec("a", 1, SettlementOutcome::Loss, dec!(-100), advance(0, 1)),
            rec("b", 1, SettlementOutcome::Win, dec!(95), LayerChange::hold(0)),
            rec("a", 2, SettlementOutcome::Loss, dec!(-200), advance(1, 2)),
            rec("a", 3, SettlementOutcome::Win, dec!(380), reset(2)),
        ];
        let replayed = replay(&records);

        assert_eq!(replayed.records, 4);
        assert_eq!(replayed.total_pnl, dec!(175));

        let a = &replayed.per_strategy[&StrategyKey::from("a")];
        assert_eq!(a.cumulative_pnl, dec!(80));
        let path: Vec<usize> = a.layers.iter().map(|(_, c)| c.to).collect();
        assert_eq!(path, vec![1, 2, 0]);
        assert_eq!(a.current_layer(), Some(0));

        let b = &replayed.per_strategy[&StrategyKey::from("b")];
        assert_eq!(b.cumulative_pnl, dec!(95));
    }

    #[test]
    fn test_replay_empty() {
        let replayed = replay(&[]);
        assert_eq!(replayed, LedgerReplay::default());
    }
}
