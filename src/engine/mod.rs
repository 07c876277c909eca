//! Core engine: outcome → settle → evaluate → decide, per table.

pub mod accountant;
pub mod evaluator;
pub mod executor;
pub mod pipeline;
pub mod positions;
pub mod rounds;
pub mod runtime;

use chrono::{DateTime, Utc};

use crate::strategy::risk::RiskEvent;
use crate::types::{ApprovedDecision, RoundId, RoundPhase, SettlementNotice, TableId};

/// Outbound notifications for the actuator / UI side.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    RoundOpened {
        table: TableId,
        round: RoundId,
        at: DateTime<Utc>,
    },
    /// BETTABLE and LOCKED only; entering IDLE is not announced.
    PhaseChanged {
        table: TableId,
        round: RoundId,
        phase: RoundPhase,
    },
    Decision(ApprovedDecision),
    Settlement(SettlementNotice),
    RiskTriggered(RiskEvent),
}

impl EngineEvent {
    pub fn table(&self) -> &TableId {
        match self {
            EngineEvent::RoundOpened { table, .. } | EngineEvent::PhaseChanged { table, .. } => table,
            EngineEvent::Decision(d) => &d.table,
            EngineEvent::Settlement(n) => &n.table,
            EngineEvent::RiskTriggered(e) => &e.table,
        }
    }
}
