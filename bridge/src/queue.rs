//! The Eventually Queue: durable staging of writes plus the drain worker.
//!
//! Every change to the queue is staged on a copy of the state, written to
//! SQLite in one transaction and only then swapped in, so memory is never
//! ahead of disk.

use crate::db::{self, Pool};
use crate::error::{AppError, Result};
use crate::executor::CommandExecutor;
use crate::identities::Identities;
use futures::stream::{self, StreamExt};
use parcel_engine::{
    BackendError, BackendObject, Command, CommandDraft, CommandId, CommandKind, Completion,
    EnqueueAck, LocalHandle, Outcome, QueueState, QueuedCommand, Resolution, RetryPolicy, Timestamp,
};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex, Notify};

const EVENT_CAPACITY: usize = 256;

/// Current wall-clock time in milliseconds.
pub fn now_ms() -> Timestamp {
    chrono::Utc::now().timestamp_millis().max(0) as Timestamp
}

/// Asynchronous report of what became of a queued command.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEvent {
    Committed {
        command_id: CommandId,
        kind: CommandKind,
        class_name: String,
        local_id: u64,
        object_id: Option<String>,
    },
    RetryScheduled {
        command_id: CommandId,
        kind: CommandKind,
        class_name: String,
        local_id: u64,
        attempts: u32,
        retry_in_ms: u64,
        code: i32,
        message: String,
    },
    /// Dropped after a terminal failure or after running out of attempts.
    Failed {
        command_id: CommandId,
        kind: CommandKind,
        class_name: String,
        local_id: u64,
        code: i32,
        message: String,
    },
}

/// Totals of one [`EventuallyQueue::drain`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub committed: usize,
    pub retried: usize,
    pub failed: usize,
}

impl DrainReport {
    pub fn is_empty(&self) -> bool {
        self.committed + self.retried + self.failed == 0
    }
}

pub struct EventuallyQueue {
    state: Mutex<QueueState>,
    identities: Arc<Identities>,
    executor: Arc<CommandExecutor>,
    pool: Pool,
    policy: RetryPolicy,
    parallelism: usize,
    drain_interval: Duration,
    wake: Notify,
    events: broadcast::Sender<QueueEvent>,
}

impl EventuallyQueue {
    /// Rebuild the queue from the persisted log. Every command comes back
    /// `Pending`; whatever was in flight when the process stopped runs again.
    pub async fn load(
        pool: Pool,
        identities: Arc<Identities>,
        executor: Arc<CommandExecutor>,
        policy: RetryPolicy,
        parallelism: usize,
        drain_interval: Duration,
    ) -> Result<Self> {
        let mut commands = Vec::new();
        for row in db::load_commands(&pool).await? {
            match row.to_command() {
                Ok(command) => commands.push(command),
                Err(reason) => {
                    tracing::error!(command_id = row.id, %reason, "Skipping unreadable command");
                }
            }
        }
        let next_id = db::load_next_command_id(&pool).await?;
        let state = QueueState::from_log(commands, next_id);

        if let Some(max) = state.referenced_handles().iter().next_back() {
            LocalHandle::reserve_through(max.as_u64());
        }
        tracing::info!(pending = state.len(), next_id = state.next_id(), "Loaded eventually queue");

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            state: Mutex::new(state),
            identities,
            executor,
            pool,
            policy,
            parallelism: parallelism.max(1),
            drain_interval,
            wake: Notify::new(),
            events,
        })
    }

    /// Queue a save of `object` and of every unsaved object it references.
    ///
    /// The whole batch is durable when this returns. The acknowledgment is
    /// the one of `object` itself.
    pub async fn enqueue_save(&self, object: &BackendObject) -> Result<EnqueueAck> {
        let mut registry = self.identities.write().await;
        let mut object = object.clone();
        registry.resolve_nested(&mut object);

        let batch: Vec<BackendObject> = registry
            .save_order(&object)?
            .into_iter()
            .cloned()
            .collect();
        let mut staged_registry = registry.clone();
        let mut drafts = Vec::with_capacity(batch.len());
        let mut touched = BTreeSet::new();
        for item in &batch {
            staged_registry.track(item)?;
            touched.insert(item.handle());
            drafts.push(CommandDraft::save(item));
        }
        let rows: Vec<_> = touched
            .into_iter()
            .filter_map(|handle| staged_registry.get(handle).map(|i| (handle, i.clone())))
            .collect();

        let mut state = self.state.lock().await;
        let mut staged = state.clone();
        let (acks, change) = staged.enqueue_batch(drafts, now_ms())?;
        db::persist_change(&self.pool, &change, &rows).await?;
        *state = staged;
        *registry = staged_registry;
        drop(state);
        drop(registry);

        let ack = acks
            .last()
            .cloned()
            .ok_or_else(|| AppError::Internal("empty save batch".into()))?;
        tracing::debug!(
            class_name = object.class_name(),
            handle = %object.handle(),
            batch = batch.len(),
            ack = ?ack,
            "Enqueued save"
        );
        self.wake.notify_one();
        Ok(ack)
    }

    /// Queue a delete of `object`.
    ///
    /// A delete that collapses also drops the object's identity: it never
    /// reached the backend, so nothing will ever resolve it again.
    pub async fn enqueue_delete(&self, object: &BackendObject) -> Result<EnqueueAck> {
        let mut registry = self.identities.write().await;
        let mut draft = CommandDraft::delete_object(object);
        if draft.remote_id.is_none() {
            draft.remote_id = registry.resolve(object.handle()).cloned();
        }

        let mut state = self.state.lock().await;
        let mut staged = state.clone();
        let (ack, change) = staged.enqueue(draft, now_ms())?;
        if !change.is_empty() {
            db::persist_change(&self.pool, &change, &[]).await?;
        }
        *state = staged;
        drop(state);

        if matches!(ack, EnqueueAck::Collapsed { .. }) && registry.get(object.handle()).is_some() {
            if let Err(err) = db::delete_identity(&self.pool, object.handle()).await {
                tracing::error!(handle = %object.handle(), error = %err, "Failed to drop identity");
            } else {
                registry.forget(object.handle());
            }
        }
        drop(registry);

        tracing::debug!(
            class_name = object.class_name(),
            handle = %object.handle(),
            ack = ?ack,
            "Enqueued delete"
        );
        self.wake.notify_one();
        Ok(ack)
    }

    /// Execute ready commands until nothing is ready.
    ///
    /// Commands for distinct objects run concurrently, up to the configured
    /// parallelism. An object with a command in flight, from this drain or a
    /// concurrent one, is skipped until that command settles.
    pub async fn drain(&self) -> Result<DrainReport> {
        let mut report = DrainReport::default();
        let mut retried = BTreeSet::new();

        loop {
            let batch = {
                let mut state = self.state.lock().await;
                let mut batch = state.next_ready(now_ms(), self.parallelism);
                // A command retried in this pass waits for the next one.
                batch.retain(|command| {
                    if retried.contains(&command.id) {
                        state.release(command.id);
                        false
                    } else {
                        true
                    }
                });
                batch
            };
            if batch.is_empty() {
                break;
            }

            let executor = &self.executor;
            let results: Vec<(Command, Outcome)> = stream::iter(batch)
                .map(|command| async move {
                    let outcome = executor.execute(&command).await;
                    (command, outcome)
                })
                .buffer_unordered(self.parallelism)
                .collect()
                .await;

            let mut failure = None;
            for (command, outcome) in results {
                if failure.is_some() {
                    self.state.lock().await.release(command.id);
                    continue;
                }
                if matches!(outcome, Outcome::RetryableFailure(_)) {
                    retried.insert(command.id);
                }
                if let Err(err) = self.settle(&command, outcome, &mut report).await {
                    failure = Some(err);
                }
            }
            if let Some(err) = failure {
                return Err(err);
            }
        }

        if !report.is_empty() {
            tracing::info!(
                committed = report.committed,
                retried = report.retried,
                failed = report.failed,
                "Drain pass finished"
            );
        }
        Ok(report)
    }

    /// Record the outcome of an executed command.
    async fn settle(&self, command: &Command, outcome: Outcome, report: &mut DrainReport) -> Result<()> {
        let learned_id = match &outcome {
            Outcome::Success(server) => server.remote_id.clone(),
            _ => None,
        };
        let (resolution, error) = match outcome {
            Outcome::Success(server) => (
                Resolution::Committed {
                    remote_id: server.remote_id,
                },
                None,
            ),
            Outcome::RetryableFailure(err) => (Resolution::Retry, Some(err)),
            Outcome::TerminalFailure(err) => (Resolution::Failed, Some(err)),
        };

        let now = now_ms();
        let mut state = self.state.lock().await;
        let mut staged = state.clone();
        let Some((completion, change)) = staged.complete(command.id, resolution, now, &self.policy) else {
            return Ok(());
        };
        if let Err(err) = db::persist_change(&self.pool, &change, &[]).await {
            tracing::error!(command_id = command.id, error = %err, "Failed to record command outcome");
            state.release(command.id);
            return Err(err.into());
        }
        *state = staged;
        let forget = matches!(completion, Completion::Committed { .. })
            && command.kind == CommandKind::Delete
            && state.pending_for(command.target).is_empty();
        drop(state);

        if forget {
            if let Err(err) = self.identities.forget(command.target).await {
                tracing::error!(handle = %command.target, error = %err, "Failed to drop identity");
            }
        }

        let error = error.unwrap_or_else(|| BackendError::new(0, ""));
        let event = match completion {
            Completion::Committed { command } => {
                report.committed += 1;
                tracing::debug!(command_id = command.id, kind = %command.kind, "Command committed");
                QueueEvent::Committed {
                    command_id: command.id,
                    kind: command.kind,
                    class_name: command.class_name,
                    local_id: command.target.as_u64(),
                    object_id: learned_id.or(command.remote_id),
                }
            }
            Completion::RetryScheduled { command, not_before } => {
                report.retried += 1;
                let retry_in_ms = not_before.saturating_sub(now);
                tracing::warn!(
                    command_id = command.id,
                    attempts = command.attempts,
                    retry_in_ms,
                    code = error.code,
                    "Command failed, retry scheduled: {}",
                    error.message
                );
                QueueEvent::RetryScheduled {
                    command_id: command.id,
                    kind: command.kind,
                    class_name: command.class_name,
                    local_id: command.target.as_u64(),
                    attempts: command.attempts,
                    retry_in_ms,
                    code: error.code,
                    message: error.message,
                }
            }
            Completion::Failed { command } | Completion::Exhausted { command } => {
                report.failed += 1;
                tracing::warn!(
                    command_id = command.id,
                    class_name = %command.class_name,
                    code = error.code,
                    "Command dropped after failure: {}",
                    error.message
                );
                QueueEvent::Failed {
                    command_id: command.id,
                    kind: command.kind,
                    class_name: command.class_name,
                    local_id: command.target.as_u64(),
                    code: error.code,
                    message: error.message,
                }
            }
        };
        // No subscribers is fine.
        let _ = self.events.send(event);
        Ok(())
    }

    /// Background worker. Drains at startup, when woken, on the periodic
    /// timer and when the earliest backoff expires, until `shutdown` flips.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.drain_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;

        tracing::info!(interval_secs = self.drain_interval.as_secs(), "Drain worker started");
        loop {
            if let Err(err) = self.drain().await {
                tracing::error!(error = %err, "Drain failed");
            }

            let until_retry = self
                .state
                .lock()
                .await
                .next_wakeup()
                .map(|at| Duration::from_millis(at.saturating_sub(now_ms())))
                .unwrap_or(self.drain_interval);

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {}
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(until_retry) => {}
            }
        }
        tracing::info!("Drain worker stopped");
    }

    /// Wake the worker.
    pub fn notify(&self) {
        self.wake.notify_one();
    }

    /// Connectivity is back: cancel pending backoffs and drain.
    pub async fn connectivity_restored(&self) -> usize {
        let woken = self.state.lock().await.expedite();
        tracing::info!(woken, "Connectivity restored");
        self.wake.notify_one();
        woken
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Snapshot of the queued commands in id order.
    pub async fn pending(&self) -> Vec<QueuedCommand> {
        self.state.lock().await.iter().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.is_empty()
    }
}
