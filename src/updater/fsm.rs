//! Pure state machine of one entity updater.
//!
//! `handle` consumes one [`Event`] and returns the [`Effect`]s the runtime
//! must carry out. Nothing here touches clocks, channels or the index, so
//! every transition is testable synchronously.

use super::{ChangeNotification, Command};
use crate::backoff::ExponentialBackoff;
use crate::model::{AckRequest, EntityId, Metadata, Revision};
use crate::persistence::PersistenceResult;
use crate::write_model::WriteModel;
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Recovering,
    Ready,
    Persisting,
    Retrying,
    Stopped,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Recovering => "recovering",
            State::Ready => "ready",
            State::Persisting => "persisting",
            State::Retrying => "retrying",
            State::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Coalesce,
    Backoff,
    Idle,
    DeletionGrace,
}

impl TimerKind {
    pub const ALL: [TimerKind; 4] = [
        TimerKind::Coalesce,
        TimerKind::Backoff,
        TimerKind::Idle,
        TimerKind::DeletionGrace,
    ];

    pub fn slot(self) -> usize {
        match self {
            TimerKind::Coalesce => 0,
            TimerKind::Backoff => 1,
            TimerKind::Idle => 2,
            TimerKind::DeletionGrace => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StopReason {
    Idle,
    Shutdown,
    Deleted,
    RecoveryFailed,
    Terminated,
}

/// Input to the state machine.
#[derive(Debug)]
pub enum Event {
    Command(Command),
    /// Recovery read finished; the error is already rendered for logging.
    Recovered(Result<WriteModel, String>),
    /// The in-flight persistence finished.
    Persisted(PersistenceResult),
    Timer(TimerKind),
}

/// Work the runtime performs on behalf of the state machine.
#[derive(Debug)]
pub enum Effect {
    Recover,
    Persist { metadata: Metadata, last: WriteModel },
    StartTimer(TimerKind, Duration),
    CancelTimer(TimerKind),
    Acknowledge {
        requests: Vec<AckRequest>,
        indexed: Revision,
    },
    Record(PersistenceResult),
    Stop(StopReason),
}

/// Timing knobs of the state machine.
#[derive(Debug, Clone, Copy)]
pub struct FsmSettings {
    pub coalesce: Duration,
    pub idle_timeout: Duration,
    pub deletion_grace: Duration,
    pub backoff: ExponentialBackoff,
}

impl From<&crate::config::UpdaterConfig> for FsmSettings {
    fn from(config: &crate::config::UpdaterConfig) -> Self {
        Self {
            coalesce: config.coalesce(),
            idle_timeout: config.idle_timeout(),
            deletion_grace: config.deletion_grace(),
            backoff: config.backoff(),
        }
    }
}

#[derive(Debug)]
pub struct EntityFsm {
    entity_id: EntityId,
    settings: FsmSettings,
    state: State,
    metadata: Metadata,
    write_model: WriteModel,
    /// Snapshot handed to the in-flight persistence.
    in_flight: Option<Metadata>,
    attempts: u32,
    stash: VecDeque<Command>,
    coalesce_armed: bool,
    backoff_pending: bool,
    deletion_armed: bool,
    flush_requested: bool,
    force_rebuild: bool,
    stop_after_persist: Option<StopReason>,
}

impl EntityFsm {
    pub fn new(entity_id: EntityId, settings: FsmSettings) -> Self {
        Self {
            metadata: Metadata::deleted(entity_id.clone()),
            write_model: WriteModel::unwritten(entity_id.clone()),
            entity_id,
            settings,
            state: State::Recovering,
            in_flight: None,
            attempts: 0,
            stash: VecDeque::new(),
            coalesce_armed: false,
            backoff_pending: false,
            deletion_armed: false,
            flush_requested: false,
            force_rebuild: false,
            stop_after_persist: None,
        }
    }

    /// Effects to run when the updater starts.
    pub fn start(&self) -> Vec<Effect> {
        vec![
            Effect::Recover,
            Effect::StartTimer(TimerKind::Idle, self.settings.idle_timeout),
        ]
    }

    pub fn entity_id(&self) -> &EntityId {
        &self.entity_id
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn write_model(&self) -> &WriteModel {
        &self.write_model
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn stashed(&self) -> usize {
        self.stash.len()
    }

    /// Commands still queued behind a stop, oldest first.
    pub fn take_stash(&mut self) -> Vec<Command> {
        self.stash.drain(..).collect()
    }

    pub fn handle(&mut self, event: Event) -> Vec<Effect> {
        let mut effects = Vec::new();
        match (self.state, event) {
            (State::Stopped, _) => {}
            (State::Recovering, Event::Command(command)) => {
                self.stash.push_back(command);
            }
            (State::Recovering, Event::Recovered(Ok(model))) => {
                self.metadata = seed_metadata(&model);
                self.write_model = model;
                self.state = State::Ready;
                while let Some(command) = self.stash.pop_front() {
                    self.on_command(command, &mut effects);
                    if self.state == State::Stopped {
                        break;
                    }
                }
            }
            (State::Recovering, Event::Recovered(Err(_))) => {
                self.stop(StopReason::RecoveryFailed, &mut effects);
            }
            (State::Recovering, Event::Timer(TimerKind::Idle)) => {
                effects.push(Effect::StartTimer(
                    TimerKind::Idle,
                    self.settings.idle_timeout,
                ));
            }
            (State::Recovering, Event::Timer(_)) => {}
            (_, Event::Command(command)) => self.on_command(command, &mut effects),
            (State::Persisting, Event::Persisted(result)) => {
                self.on_persisted(result, &mut effects);
            }
            (_, Event::Timer(kind)) => self.on_timer(kind, &mut effects),
            // Stale completions cannot happen with one write in flight.
            (_, Event::Persisted(_)) | (_, Event::Recovered(_)) => {}
        }
        effects
    }

    fn on_command(&mut self, command: Command, effects: &mut Vec<Effect>) {
        effects.push(Effect::StartTimer(
            TimerKind::Idle,
            self.settings.idle_timeout,
        ));
        match command {
            Command::Notify(notification) => self.on_notify(notification, effects),
            Command::Resync(metadata) => self.on_resync(metadata, effects),
            Command::Shutdown => self.on_shutdown(effects),
        }
    }

    fn on_notify(&mut self, notification: ChangeNotification, effects: &mut Vec<Effect>) {
        let ChangeNotification {
            metadata,
            flush_now,
        } = notification;
        if metadata.revision > self.metadata.revision {
            self.metadata.merge(metadata);
        } else {
            self.metadata.merge_stale(metadata);
            self.acknowledge_covered(effects);
        }
        if self.metadata.deleted && !self.deletion_armed {
            self.deletion_armed = true;
            effects.push(Effect::StartTimer(
                TimerKind::DeletionGrace,
                self.settings.deletion_grace,
            ));
        }
        if flush_now {
            self.request_flush(effects);
        } else {
            self.arm_coalesce(effects);
        }
    }

    /// Stop once everything merged so far is written. A retrying updater
    /// waits out its backoff and gets one more attempt.
    fn on_shutdown(&mut self, effects: &mut Vec<Effect>) {
        self.stop_after_persist = Some(StopReason::Shutdown);
        match self.state {
            State::Persisting => {}
            State::Retrying if self.backoff_pending => {}
            _ => self.try_flush(effects),
        }
    }

    fn on_resync(&mut self, metadata: Metadata, effects: &mut Vec<Effect>) {
        if metadata.revision >= self.metadata.revision {
            let mut acks = std::mem::take(&mut self.metadata.acks);
            let mut replacement = metadata;
            acks.append(&mut replacement.acks);
            replacement.acks = acks;
            self.metadata = replacement;
        } else {
            self.metadata.merge_stale(metadata);
        }
        if self.state == State::Persisting {
            self.force_rebuild = true;
        } else {
            self.write_model = self.write_model.downgrade();
        }
        self.request_flush(effects);
    }

    fn on_timer(&mut self, kind: TimerKind, effects: &mut Vec<Effect>) {
        match kind {
            TimerKind::Coalesce => {
                self.coalesce_armed = false;
                self.request_flush(effects);
            }
            TimerKind::Backoff => {
                self.backoff_pending = false;
                self.try_flush(effects);
            }
            TimerKind::Idle => {
                let clean = self.state == State::Ready
                    && self.metadata.acks.is_empty()
                    && !self.write_model.needs_write(&self.metadata);
                if clean {
                    self.stop(StopReason::Idle, effects);
                } else {
                    effects.push(Effect::StartTimer(
                        TimerKind::Idle,
                        self.settings.idle_timeout,
                    ));
                }
            }
            TimerKind::DeletionGrace => {
                self.deletion_armed = false;
                if !self.metadata.deleted {
                    return;
                }
                if self.stop_after_persist.is_none() {
                    self.stop_after_persist = Some(StopReason::Deleted);
                }
                self.request_flush(effects);
            }
        }
    }

    fn on_persisted(&mut self, result: PersistenceResult, effects: &mut Vec<Effect>) {
        let snapshot = match self.in_flight.take() {
            Some(snapshot) => snapshot,
            None => return,
        };
        effects.push(Effect::Record(result));

        if result.is_ok() {
            self.attempts = 0;
            self.write_model = WriteModel::target(&snapshot);
            if self.force_rebuild {
                self.force_rebuild = false;
                self.write_model = self.write_model.downgrade();
            }
            let satisfied = self.metadata.settle(&snapshot);
            if !satisfied.is_empty() {
                effects.push(Effect::Acknowledge {
                    requests: satisfied,
                    indexed: snapshot.revision,
                });
            }
            self.state = State::Ready;

            let pending_stop = self.stop_after_persist;
            match pending_stop {
                Some(StopReason::Shutdown) => {
                    self.stop(StopReason::Shutdown, effects);
                    return;
                }
                Some(reason) if !self.write_model.needs_write(&self.metadata) => {
                    self.stop(reason, effects);
                    return;
                }
                _ => {}
            }
            if std::mem::take(&mut self.flush_requested) || self.stop_after_persist.is_some() {
                self.try_flush(effects);
            } else if self.write_model.needs_write(&self.metadata) {
                self.arm_coalesce(effects);
            }
        } else {
            self.attempts = self.attempts.saturating_add(1);
            self.write_model = self.write_model.downgrade();
            self.force_rebuild = false;
            self.flush_requested = false;
            if self.stop_after_persist == Some(StopReason::Shutdown) {
                self.stop(StopReason::Shutdown, effects);
                return;
            }
            self.state = State::Retrying;
            self.backoff_pending = true;
            effects.push(Effect::StartTimer(
                TimerKind::Backoff,
                self.settings.backoff.delay(self.attempts),
            ));
        }
    }

    fn arm_coalesce(&mut self, effects: &mut Vec<Effect>) {
        if !self.coalesce_armed {
            self.coalesce_armed = true;
            effects.push(Effect::StartTimer(TimerKind::Coalesce, self.settings.coalesce));
        }
    }

    /// Flush now if possible, otherwise remember the request for when the
    /// current write completes.
    fn request_flush(&mut self, effects: &mut Vec<Effect>) {
        if self.state == State::Persisting {
            self.flush_requested = true;
        } else {
            self.try_flush(effects);
        }
    }

    fn try_flush(&mut self, effects: &mut Vec<Effect>) {
        match self.state {
            State::Ready => {}
            State::Retrying if !self.backoff_pending => {}
            _ => return,
        }
        if !self.write_model.needs_write(&self.metadata) {
            self.acknowledge_covered(effects);
            if self.state == State::Retrying {
                self.state = State::Ready;
            }
            if let Some(reason) = self.stop_after_persist {
                self.stop(reason, effects);
            }
            return;
        }
        if self.coalesce_armed {
            self.coalesce_armed = false;
            effects.push(Effect::CancelTimer(TimerKind::Coalesce));
        }
        let snapshot = self.metadata.clone();
        self.in_flight = Some(snapshot.clone());
        self.state = State::Persisting;
        effects.push(Effect::Persist {
            metadata: snapshot,
            last: self.write_model.clone(),
        });
    }

    /// Satisfy acknowledgement requests the confirmed write model already covers.
    fn acknowledge_covered(&mut self, effects: &mut Vec<Effect>) {
        let model = &self.write_model;
        let (covered, open): (Vec<_>, Vec<_>) = std::mem::take(&mut self.metadata.acks)
            .into_iter()
            .partition(|ack| model.covers(ack.revision));
        self.metadata.acks = open;
        if !covered.is_empty() {
            effects.push(Effect::Acknowledge {
                requests: covered,
                indexed: self.write_model.revision(),
            });
        }
    }

    fn stop(&mut self, reason: StopReason, effects: &mut Vec<Effect>) {
        self.state = State::Stopped;
        effects.push(Effect::Stop(reason));
    }
}

/// Metadata matching what a recovered write model says is indexed.
fn seed_metadata(model: &WriteModel) -> Metadata {
    let mut metadata = Metadata::deleted(model.entity_id().clone());
    metadata.revision = model.revision();
    if let WriteModel::Document { tags, .. } = model {
        metadata.deleted = false;
        metadata.related_tags = tags.clone();
    }
    metadata
}
