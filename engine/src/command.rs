//! Write commands staged in the eventually queue.

use crate::{BackendObject, ClassName, FieldName, FieldValue, LocalHandle, RemoteId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Monotonic command identifier, assigned at enqueue time.
pub type CommandId = u64;

/// What a command does to its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    Save,
    Delete,
}

impl CommandKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CommandKind::Save => "save",
            CommandKind::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "save" => Some(CommandKind::Save),
            "delete" => Some(CommandKind::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted write command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub id: CommandId,
    pub kind: CommandKind,
    /// Object the command writes.
    pub target: LocalHandle,
    pub class_name: ClassName,
    /// Known backend identity of the target at the time of the last update.
    pub remote_id: Option<RemoteId>,
    /// Fields to write (Save only). Nested objects are stubs.
    pub fields: Option<BTreeMap<FieldName, FieldValue>>,
    /// Objects whose queued saves must commit before this command can run.
    pub depends_on: Vec<LocalHandle>,
    pub created_at: Timestamp,
    pub attempts: u32,
}

impl Command {
    pub fn is_save(&self) -> bool {
        self.kind == CommandKind::Save
    }

    /// Names of the fields this command writes.
    pub fn field_names(&self) -> Vec<FieldName> {
        self.fields
            .as_ref()
            .map(|f| f.keys().cloned().collect())
            .unwrap_or_default()
    }
}

/// A write a caller asks the queue to stage. The queue assigns id, creation
/// time and dependencies.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandDraft {
    pub kind: CommandKind,
    pub target: LocalHandle,
    pub class_name: ClassName,
    pub remote_id: Option<RemoteId>,
    pub fields: Option<BTreeMap<FieldName, FieldValue>>,
}

impl CommandDraft {
    /// Save the dirty fields of `object`.
    ///
    /// Nested objects are reduced to stubs: the queue references them by
    /// identity and never writes their fields as part of this command.
    pub fn save(object: &BackendObject) -> Self {
        let mut fields = object.dirty_snapshot();
        for value in fields.values_mut() {
            value.for_each_object_mut(&mut |nested| *nested = nested.stub());
        }
        Self {
            kind: CommandKind::Save,
            target: object.handle(),
            class_name: object.class_name().to_string(),
            remote_id: object.remote_id().cloned(),
            fields: Some(fields),
        }
    }

    pub fn delete(
        target: LocalHandle,
        class_name: impl Into<ClassName>,
        remote_id: Option<RemoteId>,
    ) -> Self {
        Self {
            kind: CommandKind::Delete,
            target,
            class_name: class_name.into(),
            remote_id,
            fields: None,
        }
    }

    /// Delete `object`.
    pub fn delete_object(object: &BackendObject) -> Self {
        Self::delete(
            object.handle(),
            object.class_name(),
            object.remote_id().cloned(),
        )
    }

    /// Handles of nested stubs that have no remote id yet.
    pub fn unresolved_handles(&self) -> Vec<LocalHandle> {
        let mut handles = Vec::new();
        if let Some(fields) = &self.fields {
            for value in fields.values() {
                value.for_each_object(&mut |nested| {
                    if nested.is_new() && !handles.contains(&nested.handle()) {
                        handles.push(nested.handle());
                    }
                });
            }
        }
        handles
    }
}

/// Where a queued command is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CommandState {
    Pending,
    InFlight,
    RetryScheduled { not_before: Timestamp },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_draft_stubs_nested_objects() {
        let comment = BackendObject::new("Comment").with("text", "hello");
        let post = BackendObject::new("Post")
            .with("title", "t")
            .with("comments", FieldValue::List(vec![comment.clone().into()]));

        let draft = CommandDraft::save(&post);
        let fields = draft.fields.as_ref().unwrap();
        let FieldValue::List(items) = &fields["comments"] else {
            panic!("expected list");
        };
        let stub = items[0].as_object().unwrap();
        assert_eq!(stub.handle(), comment.handle());
        assert!(stub.fields().is_empty());
        assert_eq!(draft.unresolved_handles(), vec![comment.handle()]);
    }

    #[test]
    fn save_draft_only_carries_dirty_fields() {
        let mut post = BackendObject::without_data("Post", "p1").with("title", "t");
        post.clear_dirty(&["title".to_string()]);
        post.set("body", "b");

        let draft = CommandDraft::save(&post);
        assert_eq!(draft.remote_id.as_deref(), Some("p1"));
        assert_eq!(
            draft.fields.unwrap().keys().collect::<Vec<_>>(),
            vec![&"body".to_string()]
        );
    }

    #[test]
    fn kind_names() {
        assert_eq!(CommandKind::parse("save"), Some(CommandKind::Save));
        assert_eq!(CommandKind::Delete.to_string(), "delete");
        assert_eq!(CommandKind::parse("update"), None);
    }
}
