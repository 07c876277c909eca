//! Async runtime around the decision pipeline.
//!
//! One tokio task per table, spawned on the table's first event. A task owns
//! its table's phase timer and handles commands strictly one at a time, so
//! settlement of round N always completes before round N+1 is evaluated.
//! Tables never wait on each other.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::pipeline::DecisionPipeline;
use super::rounds::PhaseDurations;
use super::EngineEvent;
use crate::types::{EngineError, OutcomeEvent, RoundId, RoundPhase, TableId};

#[derive(Debug)]
enum TableCommand {
    Outcome(OutcomeEvent),
    Cancel,
}

pub struct Engine {
    pipeline: Arc<DecisionPipeline>,
    durations: PhaseDurations,
    events: mpsc::UnboundedSender<EngineEvent>,
    tables: Mutex<HashMap<TableId, mpsc::UnboundedSender<TableCommand>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
    stopped: AtomicBool,
}

impl Engine {
    /// Build an engine and the receiving end of its notification stream.
    pub fn new(
        pipeline: Arc<DecisionPipeline>,
        durations: PhaseDurations,
    ) -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        let engine = Self {
            pipeline,
            durations,
            events,
            tables: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            shutdown,
            stopped: AtomicBool::new(false),
        };
        (engine, rx)
    }

    pub fn pipeline(&self) -> &Arc<DecisionPipeline> {
        &self.pipeline
    }

    /// Queue an observed outcome for its table.
    pub fn submit(&self, event: OutcomeEvent) -> Result<(), EngineError> {
        let sender = self.sender_for(&event.table)?;
        sender
            .send(TableCommand::Outcome(event))
            .map_err(|_| EngineError::Stopped)
    }

    /// Void the table's current round.
    pub fn cancel_round(&self, table: &TableId) -> Result<(), EngineError> {
        let sender = self.sender_for(table)?;
        sender.send(TableCommand::Cancel).map_err(|_| EngineError::Stopped)
    }

    pub fn table_count(&self) -> usize {
        self.tables.lock().len()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Cancel every table timer and wait for the table tasks to finish the
    /// command they are handling.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.send_replace(true);
        self.tables.lock().clear();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        let count = tasks.len();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Table task ended abnormally");
            }
        }
        info!(tables = count, "Engine stopped");
    }

    fn sender_for(&self, table: &TableId) -> Result<mpsc::UnboundedSender<TableCommand>, EngineError> {
        if self.is_stopped() {
            return Err(EngineError::Stopped);
        }
        let mut tables = self.tables.lock();
        if let Some(sender) = tables.get(table) {
            if !sender.is_closed() {
                return Ok(sender.clone());
            }
            // The task dropped its receiver without a shutdown: it panicked.
            error!(table = %table, "Table task died, respawning");
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_table(
            table.clone(),
            Arc::clone(&self.pipeline),
            self.durations,
            rx,
            self.events.clone(),
            self.shutdown.subscribe(),
        ));
        self.tasks.lock().push(handle);
        tables.insert(table.clone(), tx.clone());
        debug!(table = %table, "Table task spawned");
        Ok(tx)
    }
}

// ---------------------------------------------------------------------------
// Table task
// ---------------------------------------------------------------------------

async fn run_table(
    table: TableId,
    pipeline: Arc<DecisionPipeline>,
    durations: PhaseDurations,
    mut commands: mpsc::UnboundedReceiver<TableCommand>,
    events: mpsc::UnboundedSender<EngineEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut timer: Option<(Instant, RoundId)> = None;

    loop {
        if *shutdown.borrow() {
            break;
        }
        let deadline = timer.as_ref().map(|(at, _)| *at);

        tokio::select! {
            biased;

            _ = shutdown.changed() => break,

            command = commands.recv() => {
                let Some(command) = command else { break };
                match command {
                    TableCommand::Outcome(event) => match pipeline.on_outcome(&event) {
                        Ok(report) => {
                            publish(&events, report.events);
                            timer = schedule(&durations, RoundPhase::Settling, report.opened);
                        }
                        Err(e) => warn!(table = %table, error = %e, "Outcome dropped"),
                    },
                    TableCommand::Cancel => {
                        if let Some((round, evs)) = pipeline.cancel_round(&table, Utc::now()) {
                            debug!(table = %table, round = %round, "Round voided");
                            publish(&events, evs);
                        }
                        timer = None;
                    }
                }
            }

            _ = wait_until(deadline) => {
                let Some((_, round)) = timer.take() else { continue };
                let step = pipeline.on_phase_elapsed(&table, &round, Utc::now());
                publish(&events, step.events);
                timer = step.phase.and_then(|phase| schedule(&durations, phase, round));
            }
        }
    }

    debug!(table = %table, "Table task finished");
}

fn schedule(durations: &PhaseDurations, phase: RoundPhase, round: RoundId) -> Option<(Instant, RoundId)> {
    durations.of(phase).map(|d| (Instant::now() + d, round))
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn publish(events: &mpsc::UnboundedSender<EngineEvent>, batch: Vec<EngineEvent>) {
    for event in batch {
        if events.send(event).is_err() {
            debug!("Event receiver dropped");
            return;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
