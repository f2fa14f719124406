//! The eventually queue state machine.
//!
//! [`QueueState`] is the in-memory image of the persisted command log. It
//! never touches storage: every mutation returns a [`LogChange`] describing
//! the rows to write, and the caller persists it before publishing the new
//! state.
//!
//! Per object, commands run strictly in id order and at most one is in flight.
//! Commands for different objects are independent, except that a save whose
//! fields reference an unsaved object waits for that object's queued save.

use crate::{
    codec, error::Result, Command, CommandDraft, CommandId, CommandKind, CommandState, Error,
    LocalHandle, RemoteId, Timestamp,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Retry schedule for failed commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Attempts after which a retryable failure is given up on.
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 1_000,
            max_backoff_ms: 300_000,
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after the `attempt`-th failure (1-based).
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let base = self.initial_backoff_ms.max(1);
        let max = self.max_backoff_ms.max(base);
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        base.saturating_mul(factor).min(max)
    }

    fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }
}

/// A command together with its lifecycle state.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedCommand {
    pub command: Command,
    pub state: CommandState,
}

/// What enqueueing did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueAck {
    /// A new command was appended.
    Queued(CommandId),
    /// The write was folded into an existing queued command.
    Merged(CommandId),
    /// A delete of an object that never reached the backend cancelled its
    /// queued commands. Nothing is left to send.
    Collapsed { dropped: Vec<CommandId> },
}

impl EnqueueAck {
    /// The command that will carry the write, if any.
    pub fn command_id(&self) -> Option<CommandId> {
        match self {
            EnqueueAck::Queued(id) | EnqueueAck::Merged(id) => Some(*id),
            EnqueueAck::Collapsed { .. } => None,
        }
    }
}

/// Rows to write so the persisted log matches the new state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogChange {
    /// Commands to insert or overwrite, by id.
    pub upserts: Vec<Command>,
    /// Command ids to delete.
    pub removals: Vec<CommandId>,
    /// Value of the id counter after the change.
    pub next_id: CommandId,
}

impl LogChange {
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.removals.is_empty()
    }

    /// Fold a later change into this one.
    pub fn absorb(&mut self, later: LogChange) {
        for id in &later.removals {
            self.upserts.retain(|c| c.id != *id);
            if !self.removals.contains(id) {
                self.removals.push(*id);
            }
        }
        for command in later.upserts {
            self.upserts.retain(|c| c.id != command.id);
            self.upserts.push(command);
        }
        self.next_id = self.next_id.max(later.next_id);
    }
}

/// How an in-flight command ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The backend confirmed the write. A save reports the remote id it
    /// learned or confirmed.
    Committed { remote_id: Option<RemoteId> },
    /// Terminal failure: drop the command.
    Failed,
    /// Retryable failure: try again after a backoff.
    Retry,
}

/// The effect of [`QueueState::complete`].
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Committed { command: Command },
    RetryScheduled { command: Command, not_before: Timestamp },
    Failed { command: Command },
    /// A retryable failure hit the attempt ceiling. Dropped like a failure.
    Exhausted { command: Command },
}

impl Completion {
    pub fn command(&self) -> &Command {
        match self {
            Completion::Committed { command }
            | Completion::RetryScheduled { command, .. }
            | Completion::Failed { command }
            | Completion::Exhausted { command } => command,
        }
    }
}

/// In-memory image of the command log.
#[derive(Debug, Clone)]
pub struct QueueState {
    entries: BTreeMap<CommandId, QueuedCommand>,
    next_id: CommandId,
}

impl Default for QueueState {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueState {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Rebuild from persisted commands.
    ///
    /// Everything comes back `Pending`: a command that was in flight when the
    /// process died is sent again.
    pub fn from_log(commands: Vec<Command>, next_id: CommandId) -> Self {
        let max_id = commands.iter().map(|c| c.id).max().unwrap_or(0);
        let entries = commands
            .into_iter()
            .map(|command| {
                (
                    command.id,
                    QueuedCommand {
                        command,
                        state: CommandState::Pending,
                    },
                )
            })
            .collect();
        Self {
            entries,
            next_id: next_id.max(max_id + 1).max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn next_id(&self) -> CommandId {
        self.next_id
    }

    pub fn get(&self, id: CommandId) -> Option<&QueuedCommand> {
        self.entries.get(&id)
    }

    /// All queued commands, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &QueuedCommand> {
        self.entries.values()
    }

    /// Queued commands for one object, oldest first.
    pub fn pending_for(&self, target: LocalHandle) -> Vec<&Command> {
        self.entries
            .values()
            .filter(|e| e.command.target == target)
            .map(|e| &e.command)
            .collect()
    }

    /// Handles referenced by queued commands, as targets or dependencies.
    pub fn referenced_handles(&self) -> BTreeSet<LocalHandle> {
        self.entries
            .values()
            .flat_map(|e| std::iter::once(e.command.target).chain(e.command.depends_on.iter().copied()))
            .collect()
    }

    pub fn in_flight(&self) -> usize {
        self.entries
            .values()
            .filter(|e| e.state == CommandState::InFlight)
            .count()
    }

    fn has_queued_save(&self, target: LocalHandle) -> bool {
        self.entries
            .values()
            .any(|e| e.command.target == target && e.command.kind == CommandKind::Save)
    }

    fn has_save_before(&self, target: LocalHandle, id: CommandId) -> bool {
        self.entries
            .range(..id)
            .any(|(_, e)| e.command.target == target && e.command.kind == CommandKind::Save)
    }

    fn tail_for(&self, target: LocalHandle) -> Option<CommandId> {
        self.entries
            .iter()
            .rev()
            .find(|(_, e)| e.command.target == target)
            .map(|(id, _)| *id)
    }

    fn change(&self) -> LogChange {
        LogChange {
            next_id: self.next_id,
            ..LogChange::default()
        }
    }

    fn append(&mut self, draft: CommandDraft, depends_on: Vec<LocalHandle>, now: Timestamp) -> Command {
        let id = self.next_id;
        self.next_id += 1;
        let command = Command {
            id,
            kind: draft.kind,
            target: draft.target,
            class_name: draft.class_name,
            remote_id: draft.remote_id,
            fields: draft.fields,
            depends_on,
            created_at: now,
            attempts: 0,
        };
        self.entries.insert(
            id,
            QueuedCommand {
                command: command.clone(),
                state: CommandState::Pending,
            },
        );
        command
    }

    /// Stage a write.
    ///
    /// - A save following a save of the same object that is not yet in
    ///   flight merges into it, later values winning per field.
    /// - A delete of an object that has no remote id and no command in flight
    ///   drops the object's queued commands and is itself dropped.
    /// - A delete following a delete of the same object merges into it.
    ///
    /// A save referencing an unsaved object fails with
    /// [`Error::Serialization`] unless that object has a queued save. A save
    /// writing a reserved field name is refused the same way the codec
    /// refuses it.
    pub fn enqueue(&mut self, draft: CommandDraft, now: Timestamp) -> Result<(EnqueueAck, LogChange)> {
        match draft.kind {
            CommandKind::Save => self.enqueue_save(draft, now),
            CommandKind::Delete => Ok(self.enqueue_delete(draft, now)),
        }
    }

    fn enqueue_save(&mut self, draft: CommandDraft, now: Timestamp) -> Result<(EnqueueAck, LogChange)> {
        if let Some(fields) = &draft.fields {
            codec::validate_fields(fields)?;
        }
        let depends_on = draft.unresolved_handles();
        for handle in &depends_on {
            if *handle == draft.target {
                return Err(Error::Serialization(format!(
                    "{} object (local {}) references itself",
                    draft.class_name, handle
                )));
            }
            if !self.has_queued_save(*handle) {
                return Err(Error::Serialization(format!(
                    "{} object (local {}) references unsaved object (local {}) with no queued save",
                    draft.class_name, draft.target, handle
                )));
            }
        }

        let mut change = self.change();
        // A merged command keeps its position, so every dependency must
        // already have a save queued ahead of it.
        let mergeable = self.tail_for(draft.target).filter(|id| {
            self.entries.get(id).is_some_and(|e| {
                e.command.kind == CommandKind::Save && e.state != CommandState::InFlight
            }) && depends_on.iter().all(|handle| self.has_save_before(*handle, *id))
        });

        if let Some(id) = mergeable {
            if let Some(entry) = self.entries.get_mut(&id) {
                let command = &mut entry.command;
                let fields = command.fields.get_or_insert_with(BTreeMap::new);
                fields.extend(draft.fields.unwrap_or_default());
                for handle in depends_on {
                    if !command.depends_on.contains(&handle) {
                        command.depends_on.push(handle);
                    }
                }
                if command.remote_id.is_none() {
                    command.remote_id = draft.remote_id;
                }
                change.upserts.push(command.clone());
                return Ok((EnqueueAck::Merged(id), change));
            }
        }

        let command = self.append(draft, depends_on, now);
        change.next_id = self.next_id;
        let ack = EnqueueAck::Queued(command.id);
        change.upserts.push(command);
        Ok((ack, change))
    }

    fn enqueue_delete(&mut self, draft: CommandDraft, now: Timestamp) -> (EnqueueAck, LogChange) {
        let mut change = self.change();
        let target = draft.target;
        let queued: Vec<CommandId> = self
            .entries
            .iter()
            .filter(|(_, e)| e.command.target == target)
            .map(|(id, _)| *id)
            .collect();

        let known_remote = draft.remote_id.is_some()
            || queued
                .iter()
                .any(|id| self.entries[id].command.remote_id.is_some());
        let in_flight = queued
            .iter()
            .any(|id| self.entries[id].state == CommandState::InFlight);

        if !known_remote && !in_flight {
            for id in &queued {
                self.entries.remove(id);
            }
            change.removals = queued.clone();
            return (EnqueueAck::Collapsed { dropped: queued }, change);
        }

        if let Some(tail) = queued.last() {
            if self.entries[tail].command.kind == CommandKind::Delete {
                return (EnqueueAck::Merged(*tail), change);
            }
        }

        let mut draft = draft;
        if draft.remote_id.is_none() {
            draft.remote_id = queued
                .iter()
                .find_map(|id| self.entries[id].command.remote_id.clone());
        }
        let command = self.append(draft, Vec::new(), now);
        change.next_id = self.next_id;
        let ack = EnqueueAck::Queued(command.id);
        change.upserts.push(command);
        (ack, change)
    }

    /// Stage several writes as one unit: either all of them apply or none do.
    pub fn enqueue_batch(
        &mut self,
        drafts: Vec<CommandDraft>,
        now: Timestamp,
    ) -> Result<(Vec<EnqueueAck>, LogChange)> {
        let mut staged = self.clone();
        let mut acks = Vec::with_capacity(drafts.len());
        let mut change = staged.change();
        for draft in drafts {
            let (ack, step) = staged.enqueue(draft, now)?;
            acks.push(ack);
            change.absorb(step);
        }
        *self = staged;
        Ok((acks, change))
    }

    /// Mark up to `limit` runnable commands in flight and return them.
    ///
    /// A command is runnable when it heads its object's queue, no command for
    /// that object is in flight, its backoff has elapsed and no object it
    /// depends on has a command ahead of it. Enqueueing keeps every
    /// dependency's save ahead of its dependents, so looking back is enough.
    pub fn next_ready(&mut self, now: Timestamp, limit: usize) -> Vec<Command> {
        let busy: BTreeSet<LocalHandle> = self
            .entries
            .values()
            .filter(|e| e.state == CommandState::InFlight)
            .map(|e| e.command.target)
            .collect();

        let mut heads = BTreeSet::new();
        let mut ready = Vec::new();
        for (id, entry) in &self.entries {
            if ready.len() >= limit {
                break;
            }
            let target = entry.command.target;
            if !heads.insert(target) || busy.contains(&target) {
                continue;
            }
            if let CommandState::RetryScheduled { not_before } = entry.state {
                if not_before > now {
                    continue;
                }
            }
            let blocked = entry.command.depends_on.iter().any(|handle| {
                self.entries
                    .range(..*id)
                    .any(|(_, e)| e.command.target == *handle)
            });
            if blocked {
                continue;
            }
            ready.push(*id);
        }

        ready
            .into_iter()
            .filter_map(|id| {
                let entry = self.entries.get_mut(&id)?;
                entry.state = CommandState::InFlight;
                Some(entry.command.clone())
            })
            .collect()
    }

    /// Settle an in-flight command. Returns `None` for unknown ids.
    pub fn complete(
        &mut self,
        id: CommandId,
        resolution: Resolution,
        now: Timestamp,
        policy: &RetryPolicy,
    ) -> Option<(Completion, LogChange)> {
        let mut change = self.change();
        let completion = match resolution {
            Resolution::Committed { remote_id } => {
                let entry = self.entries.remove(&id)?;
                change.removals.push(id);
                if let Some(remote_id) = remote_id {
                    for later in self.entries.values_mut() {
                        if later.command.target == entry.command.target
                            && later.command.remote_id.is_none()
                        {
                            later.command.remote_id = Some(remote_id.clone());
                            change.upserts.push(later.command.clone());
                        }
                    }
                }
                Completion::Committed {
                    command: entry.command,
                }
            }
            Resolution::Failed => {
                let entry = self.entries.remove(&id)?;
                change.removals.push(id);
                Completion::Failed {
                    command: entry.command,
                }
            }
            Resolution::Retry => {
                let entry = self.entries.get_mut(&id)?;
                entry.command.attempts = entry.command.attempts.saturating_add(1);
                if policy.exhausted(entry.command.attempts) {
                    let entry = self.entries.remove(&id)?;
                    change.removals.push(id);
                    Completion::Exhausted {
                        command: entry.command,
                    }
                } else {
                    let not_before = now.saturating_add(policy.backoff_ms(entry.command.attempts));
                    entry.state = CommandState::RetryScheduled { not_before };
                    change.upserts.push(entry.command.clone());
                    Completion::RetryScheduled {
                        command: entry.command.clone(),
                        not_before,
                    }
                }
            }
        };
        Some((completion, change))
    }

    /// Return an in-flight command to `Pending` without counting an attempt.
    pub fn release(&mut self, id: CommandId) -> bool {
        match self.entries.get_mut(&id) {
            Some(entry) if entry.state == CommandState::InFlight => {
                entry.state = CommandState::Pending;
                true
            }
            _ => false,
        }
    }

    /// Earliest time a backed-off command becomes runnable again.
    pub fn next_wakeup(&self) -> Option<Timestamp> {
        self.entries
            .values()
            .filter_map(|e| match e.state {
                CommandState::RetryScheduled { not_before } => Some(not_before),
                _ => None,
            })
            .min()
    }

    /// Cancel every pending backoff so backed-off commands run on the next
    /// pass. Attempt counts are kept. Returns how many commands were woken.
    pub fn expedite(&mut self) -> usize {
        let mut woken = 0;
        for entry in self.entries.values_mut() {
            if let CommandState::RetryScheduled { .. } = entry.state {
                entry.state = CommandState::Pending;
                woken += 1;
            }
        }
        woken
    }
}
