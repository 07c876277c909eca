//! End-to-end scenarios through the synchronous pipeline API, with the
//! executor, accountant and ledger wired the way the binary wires them.

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, Utc};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    use crate::mock_sink::RecordingSink;
    use autobet::config::AppConfig;
    use autobet::engine::accountant::{Accountant, SessionStats};
    use autobet::engine::executor::Executor;
    use autobet::engine::pipeline::{DecisionPipeline, PipelineConfig};
    use autobet::engine::EngineEvent;
    use autobet::storage;
    use autobet::strategy::risk::{RiskAction, RiskConfig, RiskLevel, RiskScope, RiskTrigger};
    use autobet::strategy::StrategyDefinition;
    use autobet::types::Outcome::{Banker as B, Player as P, Tie as T};
    use autobet::types::{
        ApprovedDecision, CrossTableMode, DedupMode, Outcome, OutcomeEvent, SettlementOutcome, SettlementRecord,
        StrategyKey, TableId,
    };

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    /// Outcome on `table` at round slot `n`, then the SETTLING timer.
    fn play(p: &DecisionPipeline, table: &str, n: i64, outcome: Outcome) -> (Vec<SettlementRecord>, Vec<ApprovedDecision>, Vec<EngineEvent>) {
        let at = t0() + Duration::seconds(20 * n);
        let report = p.on_outcome(&OutcomeEvent::new(table, outcome, at)).unwrap();
        let step = p.on_phase_elapsed(&TableId::from(table), &report.opened, at + Duration::seconds(2));
        let mut events = report.events;
        events.extend(step.events);
        (report.settlements, step.decisions, events)
    }

    #[test]
    fn test_accumulate_shares_layer_across_tables() {
        let p = DecisionPipeline::default();
        p.register_strategy(
            StrategyDefinition::new("b_follow", vec![B], B, vec![dec!(10), dec!(20), dec!(40)])
                .with_dedup(DedupMode::Overlap)
                .with_cross_table(CrossTableMode::Accumulate)
                .with_tables(["T1", "T2"]),
        )
        .unwrap();

        let (_, d, _) = play(&p, "T1", 0, B);
        assert_eq!(d[0].amount, dec!(10));
        let (s, _, _) = play(&p, "T1", 1, P);
        assert_eq!(s[0].outcome, SettlementOutcome::Loss);

        // T2 has never lost, but the layer is shared.
        let (_, d, _) = play(&p, "T2", 2, B);
        assert_eq!(d[0].amount, dec!(20));
        assert_eq!(d[0].layer_index, 1);
    }

    #[test]
    fn test_independent_layers_per_table() {
        let p = DecisionPipeline::default();
        p.register_strategy(
            StrategyDefinition::new("b_follow", vec![B], B, vec![dec!(10), dec!(20)])
                .with_dedup(DedupMode::Overlap)
                .with_tables(["T1", "T2"]),
        )
        .unwrap();

        play(&p, "T1", 0, B);
        play(&p, "T1", 1, P);
        let (_, d, _) = play(&p, "T2", 2, B);
        assert_eq!(d[0].amount, dec!(10));
    }

    #[test]
    fn test_line_pause_expires_after_cooldown() {
        let p = DecisionPipeline::default();
        p.register_strategy(
            StrategyDefinition::new("b_follow", vec![B], B, vec![dec!(100)])
                .with_dedup(DedupMode::Overlap)
                .with_tables(["T1"])
                .with_risk_level(
                    RiskLevel::new(RiskScope::Line, RiskAction::Pause)
                        .with_max_losses(1)
                        .with_cooldown(30),
                ),
        )
        .unwrap();

        play(&p, "T1", 0, B);
        // Loss settled at t+20s freezes the line until t+50s.
        let (_, _, events) = play(&p, "T1", 1, P);
        assert!(events.iter().any(|e| matches!(e, EngineEvent::RiskTriggered(r) if r.trigger == RiskTrigger::LossStreak)));

        let (_, d, _) = play(&p, "T1", 2, B);
        assert!(d.is_empty(), "still frozen at t+42s");
        let (_, d, _) = play(&p, "T1", 3, B);
        assert_eq!(d.len(), 1, "freeze lifted at t+62s");
    }

    #[test]
    fn test_session_stop_loss_halts_every_strategy() {
        let p = DecisionPipeline::new(PipelineConfig {
            risk: RiskConfig {
                session_stop_loss: Some(dec!(150)),
                ..Default::default()
            },
            ..Default::default()
        });
        p.register_strategy(
            StrategyDefinition::new("b_follow", vec![B], B, vec![dec!(100)])
                .with_dedup(DedupMode::Overlap)
                .with_tables(["T1", "T2"]),
        )
        .unwrap();
        p.register_strategy(StrategyDefinition::new("p_follow", vec![P], P, vec![dec!(5)]).with_tables(["T2"]))
            .unwrap();

        play(&p, "T1", 0, B);
        play(&p, "T1", 1, P);
        play(&p, "T1", 2, B);
        let (_, _, events) = play(&p, "T1", 3, P);
        assert!(events
            .iter()
            .any(|e| matches!(e, EngineEvent::RiskTriggered(r) if r.action == RiskAction::StopAll)));
        assert!(p.risk().is_halted());

        // Nothing triggers anywhere once halted.
        let (_, d, _) = play(&p, "T2", 4, P);
        assert!(d.is_empty());
        let (_, d, _) = play(&p, "T1", 5, B);
        assert!(d.is_empty());

        p.reset_session();
        let (_, d, _) = play(&p, "T1", 6, B);
        assert_eq!(d.len(), 1);
    }

    #[test]
    fn test_round_cap_limits_commitment() {
        let p = DecisionPipeline::new(PipelineConfig {
            risk: RiskConfig {
                per_round_cap: Some(dec!(120)),
                ..Default::default()
            },
            ..Default::default()
        });
        for (key, amount) in [("a", dec!(100)), ("b", dec!(50)), ("c", dec!(20))] {
            p.register_strategy(StrategyDefinition::new(key, vec![P], B, vec![amount]).with_tables(["T1"]))
                .unwrap();
        }

        let (_, d, _) = play(&p, "T1", 0, P);
        let total: Decimal = d.iter().map(|d| d.amount).sum();
        assert!(total <= dec!(120));
        assert_eq!(d.len(), 2);
    }

    #[test]
    fn test_tie_bet_coexists_with_side_bet() {
        let p = DecisionPipeline::default();
        p.register_strategy(StrategyDefinition::new("side", vec![P], B, vec![dec!(100)]).with_tables(["T1"]))
            .unwrap();
        p.register_strategy(StrategyDefinition::new("tie", vec![P], T, vec![dec!(10)]).with_tables(["T1"]))
            .unwrap();

        let (_, d, _) = play(&p, "T1", 0, P);
        assert_eq!(d.len(), 2);

        let (s, _, _) = play(&p, "T1", 1, T);
        let side = s.iter().find(|r| r.strategy.as_str() == "side").unwrap();
        let tie = s.iter().find(|r| r.strategy.as_str() == "tie").unwrap();
        assert_eq!(side.outcome, SettlementOutcome::Skipped);
        assert_eq!(tie.pnl, dec!(80));
    }

    #[tokio::test]
    async fn test_config_to_ledger_round_trip() {
        let cfg = AppConfig::from_toml(
            r#"
            [engine]
            name = "scenario"

            [[strategies]]
            key = "pp_b"
            tables = ["T1"]
            [strategies.entry]
            pattern = ["P", "P"]
            target = "B"
            [strategies.staking]
            sequence = [10, 20]
            "#,
        )
        .unwrap();

        let p = DecisionPipeline::new(cfg.pipeline_config());
        for def in cfg.strategies.iter().cloned() {
            p.register_strategy(def).unwrap();
        }

        let sink = RecordingSink::new();
        let executor = Executor::new("recording", Box::new(sink.clone()));
        let mut stats = SessionStats::default();
        let path = std::env::temp_dir()
            .join(format!("autobet_scenario_{}.jsonl", uuid::Uuid::new_v4()))
            .to_string_lossy()
            .to_string();

        let sequence = [P, P, P, P, P, B, P, P, B];
        for (n, outcome) in sequence.into_iter().enumerate() {
            let (settled, decisions, _) = play(&p, "T1", n as i64, outcome);
            executor.execute_batch(&decisions).await;
            Accountant::reconcile(&mut stats, &settled);
            storage::append(&settled, Some(&path)).unwrap();
        }

        let placed = sink.placed();
        assert!(!placed.is_empty());
        let settled_total = stats.settled as usize + p.pending_count();
        assert_eq!(settled_total, placed.len());

        let replayed = storage::replay(&storage::load(Some(&path)).unwrap());
        assert_eq!(replayed.total_pnl, stats.cumulative_pnl);
        assert_eq!(replayed.total_pnl, p.position_stats().total_pnl);
        let line = p.line(&TableId::from("T1"), &StrategyKey::from("pp_b")).unwrap();
        assert_eq!(
            replayed.per_strategy[&StrategyKey::from("pp_b")].current_layer(),
            Some(line.layer_index)
        );

        storage::delete(Some(&path)).unwrap();
    }
}
