//! Conflict resolution between candidates targeting the same table and round.
//!
//! Banker and player are mutually exclusive within a round: the best-ranked
//! candidate decides which of the two directions survives. Tie bets coexist
//! with either, unlike a strict winner-takes-the-round rule that would drop
//! them alongside the losing side. An optional cap limits how many strategies
//! may enter one round.
//!
//! Ranking is a fixed total order:
//! 1. higher `priority_score`
//! 2. earlier `decided_at`
//! 3. lower `declaration_order`
//! 4. strategy key (lexicographic)

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::types::{CandidateDecision, Direction, Outcome, RoundId, TableId};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConflictConfig {
    /// Maximum strategies approved per table+round. `None` = unlimited.
    #[serde(default)]
    pub per_round_strategy_cap: Option<usize>,
}

/// Why a candidate was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictReason {
    /// Lost to a higher-ranked candidate on the opposite side.
    OppositeDirection,
    /// The per-round strategy cap was already filled.
    ResourceLimit,
}

impl std::fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictReason::OppositeDirection => write!(f, "opposite_direction"),
            ConflictReason::ResourceLimit => write!(f, "resource_limit"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub decision: CandidateDecision,
    pub reason: ConflictReason,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    /// Approved candidates, best-ranked first within each round.
    pub approved: Vec<CandidateDecision>,
    pub rejected: Vec<Rejection>,
}

impl Resolution {
    pub fn is_empty(&self) -> bool {
        self.approved.is_empty() && self.rejected.is_empty()
    }
}

/// Total ranking order; `Less` means `a` ranks ahead of `b`.
pub fn rank(a: &CandidateDecision, b: &CandidateDecision) -> Ordering {
    b.priority_score
        .cmp(&a.priority_score)
        .then_with(|| a.decided_at.cmp(&b.decided_at))
        .then_with(|| a.declaration_order.cmp(&b.declaration_order))
        .then_with(|| a.strategy.cmp(&b.strategy))
}

#[derive(Debug, Clone, Default)]
pub struct ConflictResolver {
    config: ConflictConfig,
}

impl ConflictResolver {
    pub fn new(config: ConflictConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ConflictConfig {
        &self.config
    }

    /// Reduce one evaluation pass's candidates to the approved subset.
    /// Zero candidates is a normal, empty resolution.
    pub fn resolve(&self, candidates: Vec<CandidateDecision>) -> Resolution {
        let mut groups: BTreeMap<(TableId, RoundId), Vec<CandidateDecision>> = BTreeMap::new();
        for c in candidates {
            groups
                .entry((c.table.clone(), c.round.clone()))
                .or_default()
                .push(c);
        }

        let mut resolution = Resolution::default();
        for ((table, round), mut group) in groups {
            group.sort_by(rank);

            // First banker/player candidate in rank order fixes the side.
            let side: Option<Direction> = group
                .iter()
                .map(|c| c.direction)
                .find(|d| *d != Outcome::Tie);

            let mut kept = 0usize;
            for candidate in group {
                let opposed = match (side, candidate.direction.opposite()) {
                    (Some(side), Some(_)) => candidate.direction != side,
                    _ => false,
                };
                if opposed {
                    info!(
                        table = %table,
                        round = %round,
                        strategy = %candidate.strategy,
                        direction = %candidate.direction,
                        "Candidate rejected: opposite direction"
                    );
                    resolution.rejected.push(Rejection {
                        decision: candidate,
                        reason: ConflictReason::OppositeDirection,
                    });
                    continue;
                }

                if self.config.per_round_strategy_cap.is_some_and(|cap| kept >= cap) {
                    info!(
                        table = %table,
                        round = %round,
                        strategy = %candidate.strategy,
                        "Candidate rejected: per-round strategy cap reached"
                    );
                    resolution.rejected.push(Rejection {
                        decision: candidate,
                        reason: ConflictReason::ResourceLimit,
                    });
                    continue;
                }

                kept += 1;
                debug!(table = %table, round = %round, strategy = %candidate.strategy, "Candidate approved");
                resolution.approved.push(candidate);
            }
        }
        resolution
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StrategyKey;
    use chrono::{DateTime, Duration, Utc};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use Outcome::{Banker as B, Player as P, Tie as T};

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn cand(key: &str, dir: Direction, score: Decimal, order: u64) -> CandidateDecision {
        let table = TableId::from("T1");
        CandidateDecision {
            round: RoundId::new(table.clone(), 1_000),
            table,
            strategy: StrategyKey::from(key),
            direction: dir,
            amount: dec!(100),
            layer_index: 0,
            priority_score: score,
            decided_at: t0(),
            declaration_order: order,
        }
    }

    fn keys(list: &[CandidateDecision]) -> Vec<&str> {
        list.iter().map(|c| c.strategy.as_str()).collect()
    }

    #[test]
    fn test_empty_input() {
        let r = ConflictResolver::default().resolve(vec![]);
        assert!(r.is_empty());
    }

    #[test]
    fn test_opposite_directions_higher_priority_wins() {
        let r = ConflictResolver::default().resolve(vec![
            cand("low", B, dec!(0.5), 0),
            cand("high", P, dec!(0.7), 1),
        ]);
        assert_eq!(keys(&r.approved), vec!["high"]);
        assert_eq!(r.rejected.len(), 1);
        assert_eq!(r.rejected[0].reason, ConflictReason::OppositeDirection);
        assert_eq!(r.rejected[0].decision.strategy.as_str(), "low");
    }

    #[test]
    fn test_tie_break_by_time_then_declaration() {
        let mut early = cand("early", B, dec!(0.5), 5);
        early.decided_at = t0() - Duration::milliseconds(1);
        let r = ConflictResolver::default().resolve(vec![cand("late", P, dec!(0.5), 0), early]);
        assert_eq!(keys(&r.approved), vec!["early"]);

        let r = ConflictResolver::default().resolve(vec![
            cand("second", P, dec!(0.5), 1),
            cand("first", B, dec!(0.5), 0),
        ]);
        assert_eq!(keys(&r.approved), vec!["first"]);
    }

    #[test]
    fn test_same_direction_all_approved() {
        let r = ConflictResolver::default().resolve(vec![
            cand("a", B, dec!(0.5), 0),
            cand("b", B, dec!(0.6), 1),
        ]);
        assert_eq!(keys(&r.approved), vec!["b", "a"]);
        assert!(r.rejected.is_empty());
    }

    #[test]
    fn test_tie_coexists_with_either_side() {
        let r = ConflictResolver::default().resolve(vec![
            cand("tie", T, dec!(0.9), 0),
            cand("banker", B, dec!(0.5), 1),
            cand("player", P, dec!(0.4), 2),
        ]);
        assert_eq!(keys(&r.approved), vec!["tie", "banker"]);
        assert_eq!(r.rejected[0].decision.strategy.as_str(), "player");
    }

    #[test]
    fn test_per_round_cap() {
        let resolver = ConflictResolver::new(ConflictConfig {
            per_round_strategy_cap: Some(1),
        });
        let r = resolver.resolve(vec![cand("a", B, dec!(0.5), 0), cand("b", B, dec!(0.6), 1)]);
        assert_eq!(keys(&r.approved), vec!["b"]);
        assert_eq!(r.rejected[0].reason, ConflictReason::ResourceLimit);
    }

    #[test]
    fn test_groups_are_independent() {
        let mut other = cand("other", P, dec!(0.1), 1);
        other.table = TableId::from("T2");
        other.round = RoundId::new(TableId::from("T2"), 1_000);
        let r = ConflictResolver::default().resolve(vec![cand("a", B, dec!(0.9), 0), other]);
        assert_eq!(r.approved.len(), 2);
    }

    #[test]
    fn test_at_most_one_side_survives() {
        let dirs = [B, P, T];
        for mask in 0..27u32 {
            let mut m = mask;
            let group: Vec<CandidateDecision> = (0..3u64)
                .map(|i| {
                    let d = dirs[(m % 3) as usize];
                    m /= 3;
                    cand(&format!("s{i}"), d, dec!(0.5), i)
                })
                .collect();
            let r = ConflictResolver::default().resolve(group);
            let has_b = r.approved.iter().any(|c| c.direction == B);
            let has_p = r.approved.iter().any(|c| c.direction == P);
            assert!(!(has_b && has_p), "mask {mask}");
        }
    }

    #[test]
    fn test_contents_unchanged() {
        let c = cand("a", B, dec!(0.5), 0);
        let r = ConflictResolver::default().resolve(vec![c.clone()]);
        assert_eq!(r.approved, vec![c]);
    }
}
