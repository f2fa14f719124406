//! Edge case tests for parcel-engine
//!
//! These tests cover boundary conditions, unusual inputs and the end-to-end
//! queue scenarios a drain worker relies on.

use parcel_engine::codec::{self, EncodeContext};
use parcel_engine::outcome::{self, codes};
use parcel_engine::{
    BackendError, BackendObject, Command, CommandDraft, CommandKind, Completion, EnqueueAck,
    Error, FieldValue, IdentityRegistry, Outcome, QueueState, Resolution, RetryPolicy,
    ServerFields,
};
use serde_json::json;
use std::collections::BTreeMap;

/// Stand-in for the backend: remote id to stored fields.
#[derive(Default)]
struct FakeBackend {
    objects: BTreeMap<String, BTreeMap<String, FieldValue>>,
    next_id: u64,
}

impl FakeBackend {
    fn execute(&mut self, command: &Command) -> Outcome {
        let result = match command.kind {
            CommandKind::Save => {
                let remote_id = command.remote_id.clone().unwrap_or_else(|| {
                    self.next_id += 1;
                    format!("obj{}", self.next_id)
                });
                let stored = self.objects.entry(remote_id.clone()).or_default();
                stored.extend(command.fields.clone().unwrap_or_default());
                Ok(ServerFields {
                    remote_id: Some(remote_id),
                    ..ServerFields::default()
                })
            }
            CommandKind::Delete => match command.remote_id.as_ref().and_then(|id| self.objects.remove(id)) {
                Some(_) => Ok(ServerFields::default()),
                None => Err(BackendError::not_found("Object not found.")),
            },
        };
        outcome::classify(command.kind, result)
    }
}

fn drain(queue: &mut QueueState, backend: &mut FakeBackend, now: u64) -> Vec<Completion> {
    let policy = RetryPolicy::default();
    let mut completions = Vec::new();
    loop {
        let ready = queue.next_ready(now, 16);
        if ready.is_empty() {
            return completions;
        }
        for command in ready {
            let resolution = match backend.execute(&command) {
                Outcome::Success(fields) => Resolution::Committed {
                    remote_id: fields.remote_id,
                },
                Outcome::RetryableFailure(_) => Resolution::Retry,
                Outcome::TerminalFailure(_) => Resolution::Failed,
            };
            let (completion, _) = queue.complete(command.id, resolution, now, &policy).unwrap();
            completions.push(completion);
        }
    }
}

// ============================================================================
// String Edge Cases
// ============================================================================

#[test]
fn empty_string_fields() {
    let object = BackendObject::without_data("Item", "i1").with("name", "");
    let map = codec::encode(&object, EncodeContext::Durable).unwrap();
    assert_eq!(map["name"], json!(""));
    assert_eq!(codec::decode(&map, None).unwrap(), object);
}

#[test]
fn unicode_strings() {
    let names = [
        "日本語テスト",
        "Привет мир",
        "مرحبا بالعالم",
        "🎉🚀💯",
        "Hello\nWorld\tTab",
        "Null\0Test",
    ];

    for name in names {
        let object = BackendObject::without_data("Item", "i1").with("name", name);
        let map = codec::encode(&object, EncodeContext::Immediate).unwrap();
        let decoded = codec::decode(&map, Some("Item")).unwrap();
        assert_eq!(decoded.get("name").and_then(FieldValue::as_str), Some(name));
    }
}

#[test]
fn very_long_strings() {
    let long = "x".repeat(1_000_000);
    let object = BackendObject::without_data("Item", "i1").with("blob", long.as_str());
    let map = codec::encode(&object, EncodeContext::Durable).unwrap();
    assert_eq!(map["blob"].as_str().map(str::len), Some(1_000_000));
}

// ============================================================================
// Numeric Edge Cases
// ============================================================================

#[test]
fn integer_boundaries() {
    let object = BackendObject::without_data("Item", "i1")
        .with("max", i64::MAX)
        .with("min", i64::MIN)
        .with("umax", u64::MAX);
    let map = codec::encode(&object, EncodeContext::Durable).unwrap();
    let decoded = codec::decode(&map, None).unwrap();

    assert_eq!(decoded.get("max").and_then(FieldValue::as_i64), Some(i64::MAX));
    assert_eq!(decoded.get("min").and_then(FieldValue::as_i64), Some(i64::MIN));
    assert_eq!(decoded, object);
}

#[test]
fn float_values_survive() {
    let value = FieldValue::float(0.1 + 0.2).unwrap();
    let encoded = codec::encode_value(&value, EncodeContext::Durable).unwrap();
    assert_eq!(codec::decode_value(&encoded).unwrap(), value);
}

// ============================================================================
// Value Shape Edge Cases
// ============================================================================

#[test]
fn deeply_nested_maps() {
    let mut value = FieldValue::from("leaf");
    for depth in 0..64 {
        value = FieldValue::Map(BTreeMap::from([(format!("level{}", depth), value)]));
    }
    let object = BackendObject::without_data("Item", "i1").with("tree", value);
    let map = codec::encode(&object, EncodeContext::Durable).unwrap();
    assert_eq!(codec::decode(&map, None).unwrap(), object);
}

#[test]
fn empty_bytes_and_lists() {
    let object = BackendObject::without_data("Item", "i1")
        .with("bytes", Vec::<u8>::new())
        .with("list", Vec::<FieldValue>::new());
    let map = codec::encode(&object, EncodeContext::Durable).unwrap();
    assert_eq!(map["bytes"], json!({"__type": "Bytes", "base64": ""}));
    assert_eq!(map["list"], json!([]));
    assert_eq!(codec::decode(&map, None).unwrap(), object);
}

#[test]
fn unsaved_object_inside_list_is_rejected_for_durable_use() {
    let object = BackendObject::new("Post").with(
        "comments",
        FieldValue::List(vec![
            BackendObject::without_data("Comment", "c1").into(),
            BackendObject::new("Comment").into(),
        ]),
    );
    assert!(matches!(
        codec::encode(&object, EncodeContext::Durable),
        Err(Error::Serialization(_))
    ));
    assert!(codec::encode(&object, EncodeContext::Immediate).is_ok());
}

// ============================================================================
// Queue Scenarios
// ============================================================================

#[test]
fn merged_saves_write_all_fields() {
    let mut queue = QueueState::new();
    let mut backend = FakeBackend::default();
    let mut person = BackendObject::new("Person");

    person.set("name", "a");
    queue.enqueue(CommandDraft::save(&person), 1).unwrap();
    let mut person = BackendObject::new("Person").with_handle(person.handle());
    person.set("age", 3);
    queue.enqueue(CommandDraft::save(&person), 2).unwrap();

    let completions = drain(&mut queue, &mut backend, 10);
    assert_eq!(completions.len(), 1);
    assert!(queue.is_empty());

    let stored = &backend.objects["obj1"];
    assert_eq!(stored.len(), 2);
    assert_eq!(stored["name"], FieldValue::from("a"));
    assert_eq!(stored["age"], FieldValue::from(3));
}

#[test]
fn delete_of_missing_object_succeeds_quietly() {
    let mut queue = QueueState::new();
    let mut backend = FakeBackend::default();
    let ghost = BackendObject::without_data("Person", "gone");

    let (ack, _) = queue.enqueue(CommandDraft::delete_object(&ghost), 1).unwrap();
    assert_eq!(ack, EnqueueAck::Queued(1));

    let completions = drain(&mut queue, &mut backend, 10);
    assert!(matches!(completions[..], [Completion::Committed { .. }]));
    assert!(queue.is_empty());
}

#[test]
fn delete_of_never_saved_object_is_noop() {
    let mut queue = QueueState::new();
    let object = BackendObject::new("Person");
    let (ack, change) = queue.enqueue(CommandDraft::delete_object(&object), 1).unwrap();
    assert_eq!(ack, EnqueueAck::Collapsed { dropped: vec![] });
    assert!(change.is_empty());
}

#[test]
fn save_then_delete_of_saved_object_runs_both_in_order() {
    let mut queue = QueueState::new();
    let mut backend = FakeBackend::default();
    backend.objects.insert("p1".into(), BTreeMap::new());
    let object = BackendObject::without_data("Person", "p1").with("name", "z");

    queue.enqueue(CommandDraft::save(&object), 1).unwrap();
    queue.enqueue(CommandDraft::delete_object(&object), 2).unwrap();

    let kinds: Vec<_> = drain(&mut queue, &mut backend, 10)
        .iter()
        .map(|c| c.command().kind)
        .collect();
    assert_eq!(kinds, vec![CommandKind::Save, CommandKind::Delete]);
    assert!(backend.objects.is_empty());
}

#[test]
fn restart_resumes_without_loss_or_duplication() {
    let mut queue = QueueState::new();
    let a = BackendObject::new("A").with("n", 1);
    let b = BackendObject::new("B").with("n", 2);
    let mut persisted: BTreeMap<u64, Command> = BTreeMap::new();
    let mut next_id = 1;

    for object in [&a, &b] {
        let (_, change) = queue.enqueue(CommandDraft::save(object), 1).unwrap();
        for command in change.upserts {
            persisted.insert(command.id, command);
        }
        for id in change.removals {
            persisted.remove(&id);
        }
        next_id = change.next_id;
    }
    // The process dies with both commands pending.
    drop(queue);

    let mut queue = QueueState::from_log(persisted.into_values().collect(), next_id);
    assert_eq!(queue.len(), 2);

    let mut backend = FakeBackend::default();
    let completions = drain(&mut queue, &mut backend, 10);
    let targets: Vec<_> = completions.iter().map(|c| c.command().target).collect();
    assert_eq!(targets, vec![a.handle(), b.handle()]);
    assert_eq!(backend.objects.len(), 2);
    assert!(queue.is_empty());
    assert_eq!(queue.next_id(), 3);
}

#[test]
fn nested_batch_drains_children_first() {
    let mut queue = QueueState::new();
    let mut backend = FakeBackend::default();
    let registry = IdentityRegistry::new();

    let tag = BackendObject::new("Tag").with("label", "rust");
    let comment = BackendObject::new("Comment").with("tag", tag.clone());
    let post = BackendObject::new("Post").with("comment", comment.clone());

    let drafts = registry
        .save_order(&post)
        .unwrap()
        .into_iter()
        .map(CommandDraft::save)
        .collect();
    queue.enqueue_batch(drafts, 1).unwrap();

    let order: Vec<_> = drain(&mut queue, &mut backend, 10)
        .iter()
        .map(|c| c.command().target)
        .collect();
    assert_eq!(order, vec![tag.handle(), comment.handle(), post.handle()]);
}

#[test]
fn terminal_failure_is_reported_once() {
    let mut queue = QueueState::new();
    let object = BackendObject::without_data("Person", "p1").with("age", -1);
    queue.enqueue(CommandDraft::save(&object), 1).unwrap();

    let ready = queue.next_ready(2, 4);
    let outcome = outcome::classify(
        CommandKind::Save,
        Err(BackendError::new(codes::VALIDATION_ERROR, "age must be positive")),
    );
    assert!(matches!(outcome, Outcome::TerminalFailure(_)));

    let (completion, change) = queue
        .complete(ready[0].id, Resolution::Failed, 3, &RetryPolicy::default())
        .unwrap();
    assert!(matches!(completion, Completion::Failed { .. }));
    assert_eq!(change.removals, vec![ready[0].id]);
    assert!(queue.complete(ready[0].id, Resolution::Failed, 3, &RetryPolicy::default()).is_none());
}
