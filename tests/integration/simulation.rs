//! Multi-table replay simulation.
//!
//! Replays a generated shoe on several tables through the async engine with
//! tokio's clock paused, then checks the session-wide properties that must
//! hold whatever the outcome sequence.

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::{DateTime, Duration as ChronoDuration, Utc};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use tokio::sync::mpsc;

    use crate::mock_sink::RecordingSink;
    use autobet::engine::accountant::{Accountant, SessionStats};
    use autobet::engine::executor::Executor;
    use autobet::engine::pipeline::{DecisionPipeline, PipelineConfig};
    use autobet::engine::rounds::PhaseDurations;
    use autobet::engine::runtime::Engine;
    use autobet::engine::EngineEvent;
    use autobet::strategy::conflict::ConflictConfig;
    use autobet::strategy::StrategyDefinition;
    use autobet::types::Outcome::{self, Banker as B, Player as P, Tie as T};
    use autobet::types::{
        ApprovedDecision, CrossTableMode, DedupMode, OutcomeEvent, RoundId, SettlementOutcome, StrategyKey,
    };

    const TABLES: [&str; 3] = ["T1", "T2", "T3"];
    const HANDS: usize = 60;

    /// Deterministic shoe: roughly 45% banker, 45% player, 10% tie.
    fn shoe(seed: u64, len: usize) -> Vec<Outcome> {
        let mut state = seed;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                match (state >> 33) % 20 {
                    0..=8 => B,
                    9..=17 => P,
                    _ => T,
                }
            })
            .collect()
    }

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn strategies() -> Vec<StrategyDefinition> {
        vec![
            StrategyDefinition::new("ppp_b", vec![P, P, P], B, vec![dec!(10), dec!(20), dec!(40)]).with_tables(TABLES),
            StrategyDefinition::new("bb_p", vec![B, B], P, vec![dec!(5), dec!(10)])
                .with_dedup(DedupMode::Overlap)
                .with_priority(dec!(0.9))
                .with_tables(TABLES),
            StrategyDefinition::new("bp_tie", vec![B, P], T, vec![dec!(1)]).with_tables(TABLES),
            StrategyDefinition::new("p_follow", vec![P], P, vec![dec!(10), dec!(20)])
                .with_cross_table(CrossTableMode::Accumulate)
                .with_tables(TABLES),
        ]
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<EngineEvent>) -> Vec<EngineEvent> {
        let mut out = Vec::new();
        while let Ok(e) = rx.try_recv() {
            out.push(e);
        }
        out
    }

    struct Run {
        pipeline: Arc<DecisionPipeline>,
        events: Vec<EngineEvent>,
    }

    async fn run(seed: u64) -> Run {
        let pipeline = Arc::new(DecisionPipeline::new(PipelineConfig {
            conflict: ConflictConfig {
                per_round_strategy_cap: Some(2),
            },
            ..Default::default()
        }));
        for def in strategies() {
            pipeline.register_strategy(def).unwrap();
        }
        let (engine, mut rx) = Engine::new(Arc::clone(&pipeline), PhaseDurations::default());

        let shoes: Vec<Vec<Outcome>> = (0..TABLES.len() as u64).map(|i| shoe(seed + i, HANDS)).collect();
        let mut events = Vec::new();
        for hand in 0..HANDS {
            for (i, table) in TABLES.iter().enumerate() {
                let at = t0() + ChronoDuration::seconds(20 * hand as i64) + ChronoDuration::milliseconds(i as i64);
                engine.submit(OutcomeEvent::new(*table, shoes[i][hand], at)).unwrap();
            }
            // Longer than SETTLING + BETTABLE + LOCKED.
            tokio::time::sleep(Duration::from_secs(20)).await;
            events.extend(drain(&mut rx));
        }

        engine.stop().await;
        events.extend(drain(&mut rx));
        Run { pipeline, events }
    }

    fn decisions(events: &[EngineEvent]) -> Vec<&ApprovedDecision> {
        events
            .iter()
            .filter_map(|e| match e {
                EngineEvent::Decision(d) => Some(d),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_decision_per_strategy_per_round() {
        let run = run(7).await;
        let decisions = decisions(&run.events);
        assert!(!decisions.is_empty());

        let mut seen: HashSet<(RoundId, StrategyKey)> = HashSet::new();
        for d in &decisions {
            assert!(seen.insert((d.round.clone(), d.strategy.clone())), "duplicate decision {d}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_round_backs_both_sides() {
        let run = run(11).await;
        let mut sides: HashMap<RoundId, HashSet<Outcome>> = HashMap::new();
        for d in decisions(&run.events) {
            sides.entry(d.round.clone()).or_default().insert(d.direction);
        }
        for (round, dirs) in sides {
            assert!(!(dirs.contains(&B) && dirs.contains(&P)), "{round} backs both sides");
            let count = decisions(&run.events).iter().filter(|d| d.round == round).count();
            assert!(count <= 2, "{round} exceeds the strategy cap");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_decision_settles_once() {
        let run = run(23).await;
        let decided = decisions(&run.events).len();
        let notices: Vec<_> = run
            .events
            .iter()
            .filter_map(|e| match e {
                EngineEvent::Settlement(n) => Some(n),
                _ => None,
            })
            .collect();

        // The last hand's positions are still open when the run stops.
        assert_eq!(notices.len() + run.pipeline.pending_count(), decided);

        let unique: HashSet<_> = notices.iter().map(|n| (n.round.clone(), n.strategy.clone())).collect();
        assert_eq!(unique.len(), notices.len());
    }

    #[tokio::test(start_paused = true)]
    async fn test_accounting_matches_positions() {
        let run = run(42).await;
        let records = run.pipeline.settlements(usize::MAX);

        let mut stats = SessionStats::default();
        Accountant::reconcile(&mut stats, &records);
        let positions = run.pipeline.position_stats();
        assert_eq!(stats.cumulative_pnl, positions.total_pnl);
        assert_eq!(stats.settled, positions.total_settled);

        let notice_pnl: Decimal = run
            .events
            .iter()
            .filter_map(|e| match e {
                EngineEvent::Settlement(n) => Some(n.pnl),
                _ => None,
            })
            .sum();
        assert_eq!(notice_pnl, stats.cumulative_pnl);

        for r in &records {
            match r.outcome {
                SettlementOutcome::Win => assert!(r.pnl > Decimal::ZERO),
                SettlementOutcome::Loss => assert_eq!(r.pnl, -r.stake),
                SettlementOutcome::Skipped | SettlementOutcome::Cancelled => assert_eq!(r.pnl, Decimal::ZERO),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_decisions_reach_the_sink() {
        let run = run(5).await;
        let sink = RecordingSink::new();
        let executor = Executor::new("recording", Box::new(sink.clone()));

        let batch: Vec<ApprovedDecision> = decisions(&run.events).into_iter().cloned().collect();
        let report = executor.execute_batch(&batch).await;
        assert_eq!(report.placed.len(), batch.len());
        assert_eq!(sink.placed(), batch);
        assert_eq!(report.total_committed, batch.iter().map(|d| d.amount).sum::<Decimal>());
    }
}
