//! Property tests for the codec and the queue's merge and collapse rules.

use chrono::{TimeZone, Utc};
use parcel_engine::codec::{self, EncodeContext};
use parcel_engine::{
    BackendObject, CommandDraft, CommandKind, EnqueueAck, FieldValue, QueueState, Resolution,
    RetryPolicy,
};
use proptest::prelude::*;
use std::collections::BTreeMap;

fn field_name() -> impl Strategy<Value = String> {
    prop_oneof![
        8 => "[a-z][a-zA-Z0-9]{0,8}",
        1 => prop::sample::select(vec![
            codec::KEY_LOCAL_ID,
            codec::KEY_OBJECT_ID,
            codec::KEY_CLASS_NAME,
            codec::KEY_CREATED_AT,
            codec::KEY_UPDATED_AT,
            codec::KEY_TYPE,
        ])
        .prop_map(str::to_string),
    ]
}

/// Whether anything in `object` uses a name the transport form reserves.
fn uses_reserved_name(object: &BackendObject) -> bool {
    object
        .fields()
        .iter()
        .any(|(name, value)| codec::is_reserved_key(name) || value_uses_reserved_name(value))
}

fn value_uses_reserved_name(value: &FieldValue) -> bool {
    match value {
        FieldValue::List(items) => items.iter().any(value_uses_reserved_name),
        FieldValue::Map(entries) => {
            entries.contains_key(codec::KEY_TYPE) || entries.values().any(value_uses_reserved_name)
        }
        FieldValue::Object(object) => uses_reserved_name(object),
        _ => false,
    }
}

fn leaf() -> impl Strategy<Value = FieldValue> {
    prop_oneof![
        Just(FieldValue::Null),
        any::<bool>().prop_map(FieldValue::Bool),
        any::<i64>().prop_map(|n: i64| FieldValue::from(n)),
        any::<f64>().prop_filter_map("finite", FieldValue::float),
        ".{0,16}".prop_map(FieldValue::String),
        (0i64..4_102_444_800, 0u32..1_000_000_000)
            .prop_map(|(secs, nanos)| FieldValue::Date(Utc.timestamp_opt(secs, nanos).unwrap())),
        prop::collection::vec(any::<u8>(), 0..32).prop_map(FieldValue::Bytes),
        ("[A-Z][a-z]{1,6}", "[a-zA-Z0-9]{10}")
            .prop_map(|(class, id)| FieldValue::reference(class, id)),
    ]
}

fn value() -> impl Strategy<Value = FieldValue> {
    leaf().prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(FieldValue::List),
            prop::collection::btree_map(field_name(), inner, 0..4).prop_map(FieldValue::Map),
        ]
    })
}

fn saved_object() -> impl Strategy<Value = BackendObject> {
    (
        "[A-Z][a-z]{1,8}",
        "[a-zA-Z0-9]{10}",
        prop::collection::btree_map(field_name(), value(), 0..6),
    )
        .prop_map(|(class, id, fields)| {
            let mut object = BackendObject::without_data(class, id);
            for (name, value) in fields {
                object.set(name, value);
            }
            object
        })
}

proptest! {
    #[test]
    fn decode_inverts_encode(object in saved_object(), nested in saved_object()) {
        let object = object.with("nested", nested);
        match codec::encode(&object, EncodeContext::Immediate) {
            Ok(map) => {
                prop_assert!(!uses_reserved_name(&object));
                let decoded = codec::decode(&map, None).unwrap();
                prop_assert_eq!(decoded, object);
            }
            Err(_) => prop_assert!(uses_reserved_name(&object)),
        }
    }

    #[test]
    fn durable_encoding_fails_only_on_reserved_names(object in saved_object()) {
        let encoded = codec::encode(&object, EncodeContext::Durable);
        prop_assert_eq!(encoded.is_ok(), !uses_reserved_name(&object));
    }

    #[test]
    fn queue_refuses_what_the_codec_refuses(object in saved_object()) {
        let mut queue = QueueState::new();
        let queued = queue.enqueue(CommandDraft::save(&object), 0);
        prop_assert_eq!(queued.is_ok(), !uses_reserved_name(&object));
    }

    #[test]
    fn saves_before_drain_merge_into_one(
        writes in prop::collection::vec(
            prop::collection::btree_map("[a-d]", any::<i32>(), 1..4),
            1..8,
        ),
        saved in any::<bool>(),
    ) {
        let mut queue = QueueState::new();
        let handle = BackendObject::new("Item").handle();
        let mut expected = BTreeMap::new();

        for write in &writes {
            let mut object = if saved {
                BackendObject::without_data("Item", "i1")
            } else {
                BackendObject::new("Item")
            }
            .with_handle(handle);
            for (name, value) in write {
                object.set(name.clone(), *value);
                expected.insert(name.clone(), FieldValue::from(*value));
            }
            queue.enqueue(CommandDraft::save(&object), 0).unwrap();
        }

        prop_assert_eq!(queue.len(), 1);
        let command = &queue.iter().next().unwrap().command;
        prop_assert_eq!(command.fields.clone().unwrap(), expected);
    }

    #[test]
    fn delete_after_pending_save_collapses_or_orders(saved in any::<bool>(), saves in 1usize..4) {
        let mut queue = QueueState::new();
        let object = if saved {
            BackendObject::without_data("Item", "i1")
        } else {
            BackendObject::new("Item")
        };
        for i in 0..saves {
            let write = object.clone().with("n", i as i64);
            queue.enqueue(CommandDraft::save(&write), 0).unwrap();
        }

        let (ack, _) = queue.enqueue(CommandDraft::delete_object(&object), 0).unwrap();
        let kinds: Vec<_> = queue.iter().map(|e| e.command.kind).collect();
        if saved {
            prop_assert_eq!(kinds, vec![CommandKind::Save, CommandKind::Delete]);
        } else {
            let collapsed = matches!(ack, EnqueueAck::Collapsed { .. });
            prop_assert!(collapsed);
            prop_assert!(kinds.is_empty());
        }
    }

    #[test]
    fn per_object_order_is_preserved(
        script in prop::collection::vec((0usize..3, any::<bool>(), any::<bool>()), 1..24),
    ) {
        // Each step writes to one of three saved objects, then either the
        // command succeeds or fails retryably.
        let objects: Vec<_> = (0..3)
            .map(|i| BackendObject::without_data("Item", format!("i{}", i)))
            .collect();
        let mut queue = QueueState::new();
        let policy = RetryPolicy { initial_backoff_ms: 1, max_backoff_ms: 1, max_attempts: None };

        for (i, (which, delete, _)) in script.iter().enumerate() {
            let draft = if *delete {
                CommandDraft::delete_object(&objects[*which])
            } else {
                CommandDraft::save(&objects[*which].clone().with("step", i as i64))
            };
            queue.enqueue(draft, 0).unwrap();
        }

        let mut executed: Vec<(usize, u64)> = Vec::new();
        let mut now = 0;
        let mut outcomes = script.iter().map(|(_, _, ok)| *ok).cycle();
        while !queue.is_empty() {
            now += 10;
            for command in queue.next_ready(now, 2) {
                let index = objects.iter().position(|o| o.handle() == command.target).unwrap();
                let resolution = if outcomes.next().unwrap_or(true) || command.attempts >= 2 {
                    executed.push((index, command.id));
                    Resolution::Committed { remote_id: None }
                } else {
                    Resolution::Retry
                };
                queue.complete(command.id, resolution, now, &policy).unwrap();
            }
        }

        for index in 0..3 {
            let ids: Vec<_> = executed.iter().filter(|(i, _)| *i == index).map(|(_, id)| *id).collect();
            let mut sorted = ids.clone();
            sorted.sort_unstable();
            prop_assert_eq!(ids, sorted);
        }
    }
}
