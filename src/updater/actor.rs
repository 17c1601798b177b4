//! Tokio runtime for one [`EntityFsm`].
//!
//! The task owns the state machine exclusively, so an entity's metadata
//! and write model are only ever touched by one task. At most one
//! persistence future is alive per task.

use super::fsm::{Effect, EntityFsm, Event, FsmSettings, State, StopReason, TimerKind};
use super::Command;
use crate::config::UpdaterConfig;
use crate::metrics::SyncMetrics;
use crate::model::{EntityId, Metadata};
use crate::persistence::{
    cancellation, CancelHandle, Cancellation, PersistenceFlow, PersistenceResult,
    WriteModelRecovery,
};
use crate::write_model::WriteModel;
use anyhow::Result;
use std::future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Collaborators shared by every updater.
#[derive(Clone)]
pub struct UpdaterContext {
    pub flow: Arc<dyn PersistenceFlow>,
    pub recovery: Arc<dyn WriteModelRecovery>,
    pub metrics: Arc<SyncMetrics>,
    pub settings: FsmSettings,
    pub persistence_timeout: Duration,
    /// Supervisory stop: cancels an in-flight write and ends the task.
    pub terminate: Cancellation,
}

impl UpdaterContext {
    pub fn new(
        flow: Arc<dyn PersistenceFlow>,
        recovery: Arc<dyn WriteModelRecovery>,
        metrics: Arc<SyncMetrics>,
        config: &UpdaterConfig,
        persistence_timeout: Duration,
    ) -> Self {
        Self {
            flow,
            recovery,
            metrics,
            settings: FsmSettings::from(config),
            persistence_timeout,
            terminate: Cancellation::never(),
        }
    }

    pub fn with_terminate(mut self, terminate: Cancellation) -> Self {
        self.terminate = terminate;
        self
    }
}

struct InFlight {
    handle: JoinHandle<PersistenceResult>,
    cancel: CancelHandle,
}

/// How an updater ended, with the commands it never processed.
#[derive(Debug)]
pub struct UpdaterExit {
    pub reason: StopReason,
    /// Queued behind the stop, oldest first. Empty after a supervisory stop.
    pub undelivered: Vec<Command>,
}

/// One entity's synchronization task.
pub struct EntityUpdater {
    fsm: EntityFsm,
    mailbox: mpsc::Receiver<Command>,
    context: UpdaterContext,
    timers: [Option<Instant>; 4],
    recovery: Option<JoinHandle<Result<WriteModel>>>,
    in_flight: Option<InFlight>,
}

impl EntityUpdater {
    pub fn new(
        entity_id: EntityId,
        mailbox: mpsc::Receiver<Command>,
        context: UpdaterContext,
    ) -> Self {
        Self {
            fsm: EntityFsm::new(entity_id, context.settings),
            mailbox,
            context,
            timers: [None; 4],
            recovery: None,
            in_flight: None,
        }
    }

    /// Spawn an updater with a fresh mailbox of `capacity`.
    pub fn spawn(
        entity_id: EntityId,
        capacity: usize,
        context: UpdaterContext,
    ) -> (mpsc::Sender<Command>, JoinHandle<UpdaterExit>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let updater = Self::new(entity_id, rx, context);
        (tx, tokio::spawn(updater.run()))
    }

    pub fn entity_id(&self) -> &EntityId {
        self.fsm.entity_id()
    }

    /// Drive the state machine until it stops, then close the mailbox and
    /// hand back every command that was accepted but never processed.
    pub async fn run(mut self) -> UpdaterExit {
        let reason = self.drive().await;
        self.mailbox.close();
        let mut undelivered = Vec::new();
        if reason != StopReason::Terminated {
            undelivered = self.fsm.take_stash();
            // Returns `None` only once no sender holds a permit.
            while let Some(command) = self.mailbox.recv().await {
                undelivered.push(command);
            }
        }
        if !undelivered.is_empty() {
            debug!(entity_id = %self.fsm.entity_id(), count = undelivered.len(), "commands left after stop");
        }
        UpdaterExit {
            reason,
            undelivered,
        }
    }

    async fn drive(&mut self) -> StopReason {
        let start = self.fsm.start();
        if let Some(reason) = self.apply(start) {
            return reason;
        }
        let mut terminate = self.context.terminate.clone();
        let mut mailbox_open = true;

        loop {
            let deadline = self.next_deadline();
            let event = tokio::select! {
                biased;
                _ = terminate.cancelled() => {
                    return self.terminate().await;
                }
                joined = join_opt(&mut self.in_flight) => {
                    self.in_flight = None;
                    Event::Persisted(joined.unwrap_or(PersistenceResult::WriteError))
                }
                joined = join_recovery(&mut self.recovery) => {
                    self.recovery = None;
                    match joined {
                        Ok(Ok(model)) => Event::Recovered(Ok(model)),
                        Ok(Err(err)) => Event::Recovered(Err(err.to_string())),
                        Err(err) => Event::Recovered(Err(err.to_string())),
                    }
                }
                command = self.mailbox.recv(), if mailbox_open => match command {
                    Some(command) => Event::Command(command),
                    None => {
                        // Every sender is gone: nobody can reach this entity again.
                        mailbox_open = false;
                        Event::Command(Command::Shutdown)
                    }
                },
                kind = sleep_until(deadline) => {
                    self.timers[kind.slot()] = None;
                    Event::Timer(kind)
                }
            };

            if let Event::Recovered(Err(err)) = &event {
                error!(entity_id = %self.fsm.entity_id(), error = %err, "write model recovery failed");
            }
            let before = self.fsm.state();
            let effects = self.fsm.handle(event);
            let after = self.fsm.state();
            if before != after {
                debug!(entity_id = %self.fsm.entity_id(), from = %before, to = %after, "updater transition");
            }
            if let Some(reason) = self.apply(effects) {
                return reason;
            }
        }
    }

    fn apply(&mut self, effects: Vec<Effect>) -> Option<StopReason> {
        for effect in effects {
            match effect {
                Effect::Recover => {
                    let recovery = Arc::clone(&self.context.recovery);
                    let entity_id = self.fsm.entity_id().clone();
                    self.recovery =
                        Some(tokio::spawn(async move { recovery.recover(&entity_id).await }));
                }
                Effect::Persist { metadata, last } => self.start_persistence(metadata, last),
                Effect::StartTimer(kind, after) => {
                    self.timers[kind.slot()] = Some(Instant::now() + after);
                }
                Effect::CancelTimer(kind) => self.timers[kind.slot()] = None,
                Effect::Acknowledge { requests, indexed } => {
                    for request in requests {
                        let ack = request.acknowledgement(self.fsm.entity_id(), indexed);
                        self.context.metrics.record_ack(request.timer.elapsed());
                        if !request.recipient.deliver(ack) {
                            debug!(entity_id = %self.fsm.entity_id(), "acknowledgement recipient gone");
                        }
                    }
                }
                Effect::Record(result) => self.record(result),
                Effect::Stop(reason) => {
                    debug!(entity_id = %self.fsm.entity_id(), ?reason, "updater stopped");
                    return Some(reason);
                }
            }
        }
        None
    }

    fn start_persistence(&mut self, metadata: Metadata, last: WriteModel) {
        debug_assert!(self.in_flight.is_none(), "second write in flight");
        let (cancel, token) = cancellation();
        let flow = Arc::clone(&self.context.flow);
        let timeout = self.context.persistence_timeout;
        let entity_id = metadata.entity_id.clone();
        let handle = tokio::spawn(async move {
            match tokio::time::timeout(timeout, flow.persist(metadata, last, token)).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(entity_id = %entity_id, ?timeout, "persistence timed out");
                    PersistenceResult::WriteError
                }
            }
        });
        self.in_flight = Some(InFlight { handle, cancel });
    }

    fn record(&self, result: PersistenceResult) {
        let metrics = &self.context.metrics;
        match result {
            PersistenceResult::Ok => metrics.record_ok(),
            PersistenceResult::IncorrectPatch => {
                metrics.record_incorrect_patch();
                warn!(entity_id = %self.fsm.entity_id(), attempts = self.fsm.attempts(), "incorrect patch, rebuilding");
            }
            failure => {
                metrics.record_write_failure();
                warn!(entity_id = %self.fsm.entity_id(), result = %failure, attempts = self.fsm.attempts(), "index write failed, retrying");
            }
        }
    }

    /// Supervisory stop: cancel the in-flight write and wait for it to
    /// settle so nothing keeps writing after the task is gone.
    async fn terminate(&mut self) -> StopReason {
        if let Some(in_flight) = self.in_flight.take() {
            in_flight.cancel.cancel();
            let _ = in_flight.handle.await;
        }
        if let Some(recovery) = self.recovery.take() {
            recovery.abort();
        }
        debug!(entity_id = %self.fsm.entity_id(), state = %self.fsm.state(), "updater terminated");
        StopReason::Terminated
    }

    fn next_deadline(&self) -> Option<(Instant, TimerKind)> {
        TimerKind::ALL
            .iter()
            .filter_map(|kind| self.timers[kind.slot()].map(|at| (at, *kind)))
            .min_by_key(|(at, _)| *at)
    }

    pub fn state(&self) -> State {
        self.fsm.state()
    }
}

async fn join_opt(in_flight: &mut Option<InFlight>) -> Result<PersistenceResult, JoinError> {
    match in_flight {
        Some(in_flight) => (&mut in_flight.handle).await,
        None => future::pending().await,
    }
}

async fn join_recovery(
    recovery: &mut Option<JoinHandle<Result<WriteModel>>>,
) -> Result<Result<WriteModel>, JoinError> {
    match recovery {
        Some(handle) => handle.await,
        None => future::pending().await,
    }
}

async fn sleep_until(deadline: Option<(Instant, TimerKind)>) -> TimerKind {
    match deadline {
        Some((at, kind)) => {
            tokio::time::sleep_until(at).await;
            kind
        }
        None => future::pending().await,
    }
}
