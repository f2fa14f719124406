//! Identity registry: local handles to backend identities.
//!
//! The registry is the single owner of the handle to remote id mapping. An
//! object's remote id is written here once, when its first save is confirmed,
//! and copied into the object by the caller.

use crate::{error::Result, BackendObject, ClassName, Error, FieldName, FieldValue, LocalHandle, RemoteId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// What the registry knows about one handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub class_name: ClassName,
    pub remote_id: Option<RemoteId>,
    /// Fields modified locally and not yet confirmed by a save.
    pub dirty: BTreeSet<FieldName>,
}

impl Identity {
    pub fn new(class_name: impl Into<ClassName>) -> Self {
        Self {
            class_name: class_name.into(),
            remote_id: None,
            dirty: BTreeSet::new(),
        }
    }
}

/// Maps [`LocalHandle`]s to backend identities and tracks dirty fields.
#[derive(Debug, Clone, Default)]
pub struct IdentityRegistry {
    entries: BTreeMap<LocalHandle, Identity>,
    by_remote: BTreeMap<(ClassName, RemoteId), LocalHandle>,
}

impl IdentityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking an object, or refresh what is known about it.
    ///
    /// The object's dirty fields are added to the tracked set. A remote id on
    /// the object is recorded, subject to the write-once rule.
    pub fn track(&mut self, object: &BackendObject) -> Result<()> {
        let handle = object.handle();
        let entry = self
            .entries
            .entry(handle)
            .or_insert_with(|| Identity::new(object.class_name()));
        entry.dirty.extend(object.dirty_fields().iter().cloned());

        if let Some(remote_id) = object.remote_id() {
            self.assign_remote_id(handle, remote_id.clone())?;
        }
        Ok(())
    }

    pub fn get(&self, handle: LocalHandle) -> Option<&Identity> {
        self.entries.get(&handle)
    }

    pub fn contains(&self, handle: LocalHandle) -> bool {
        self.entries.contains_key(&handle)
    }

    pub fn resolve(&self, handle: LocalHandle) -> Option<&RemoteId> {
        self.entries.get(&handle).and_then(|e| e.remote_id.as_ref())
    }

    /// Record the backend identity of a handle. Assigning the same id again is
    /// a no-op, a different one is an [`Error::IdentityConflict`].
    pub fn assign_remote_id(&mut self, handle: LocalHandle, remote_id: RemoteId) -> Result<()> {
        let entry = self
            .entries
            .get_mut(&handle)
            .ok_or(Error::UnknownHandle(handle))?;

        match &entry.remote_id {
            Some(existing) if *existing != remote_id => Err(Error::IdentityConflict {
                handle,
                existing: existing.clone(),
                attempted: remote_id,
            }),
            Some(_) => Ok(()),
            None => {
                self.by_remote
                    .insert((entry.class_name.clone(), remote_id.clone()), handle);
                entry.remote_id = Some(remote_id);
                Ok(())
            }
        }
    }

    pub fn mark_dirty<'a>(
        &mut self,
        handle: LocalHandle,
        names: impl IntoIterator<Item = &'a FieldName>,
    ) -> Result<()> {
        let entry = self
            .entries
            .get_mut(&handle)
            .ok_or(Error::UnknownHandle(handle))?;
        entry.dirty.extend(names.into_iter().cloned());
        Ok(())
    }

    /// Forget dirty fields after a confirmed save.
    pub fn clear_dirty<'a>(
        &mut self,
        handle: LocalHandle,
        names: impl IntoIterator<Item = &'a FieldName>,
    ) -> Result<()> {
        let entry = self
            .entries
            .get_mut(&handle)
            .ok_or(Error::UnknownHandle(handle))?;
        for name in names {
            entry.dirty.remove(name);
        }
        Ok(())
    }

    pub fn dirty_fields(&self, handle: LocalHandle) -> Option<&BTreeSet<FieldName>> {
        self.entries.get(&handle).map(|e| &e.dirty)
    }

    /// The handle already bound to a backend identity, if any.
    pub fn handle_for(&self, class_name: &str, remote_id: &str) -> Option<LocalHandle> {
        self.by_remote
            .get(&(class_name.to_string(), remote_id.to_string()))
            .copied()
    }

    /// Rebind an object, and every object nested in it, to the handles
    /// already known for their backend identities.
    ///
    /// Objects decoded from the wire get fresh handles. Adopting them keeps a
    /// single handle per backend object across calls.
    pub fn adopt(&self, object: &mut BackendObject) {
        if let Some(handle) = object
            .remote_id()
            .and_then(|id| self.handle_for(object.class_name(), id))
        {
            object.set_handle(handle);
        }
        for value in object.fields_mut().values_mut() {
            value.for_each_object_mut(&mut |nested| self.adopt(nested));
        }
    }

    /// Objects that must be saved, in order, to save `object`.
    ///
    /// Every nested object reachable through dirty fields that has no remote
    /// id, and that the registry cannot resolve, comes first, innermost first
    /// and each once. `object` itself is last.
    pub fn save_order<'a>(&self, object: &'a BackendObject) -> Result<Vec<&'a BackendObject>> {
        let mut order = Vec::new();
        let mut seen = BTreeSet::new();
        let mut path = Vec::new();
        self.collect_unsaved(object, &mut path, &mut seen, &mut order)?;
        Ok(order)
    }

    fn collect_unsaved<'a>(
        &self,
        object: &'a BackendObject,
        path: &mut Vec<LocalHandle>,
        seen: &mut BTreeSet<LocalHandle>,
        order: &mut Vec<&'a BackendObject>,
    ) -> Result<()> {
        let handle = object.handle();
        if path.contains(&handle) {
            return Err(Error::Serialization(format!(
                "{} object (local {}) contains itself",
                object.class_name(),
                handle
            )));
        }
        if !seen.insert(handle) {
            return Ok(());
        }

        path.push(handle);
        for child in object.unresolved_children() {
            if self.resolve(child.handle()).is_some() {
                continue;
            }
            self.collect_unsaved(child, path, seen, order)?;
        }
        path.pop();

        order.push(object);
        Ok(())
    }

    /// Fill in remote ids of nested objects the registry has since learned.
    pub fn resolve_references(&self, fields: &mut BTreeMap<FieldName, FieldValue>) {
        for value in fields.values_mut() {
            value.for_each_object_mut(&mut |nested| self.resolve_nested(nested));
        }
    }

    /// [`IdentityRegistry::resolve_references`] on an object, itself included.
    pub fn resolve_nested(&self, object: &mut BackendObject) {
        if let Some(remote_id) = self.resolve(object.handle()) {
            object.fill_remote_id(remote_id.clone());
        }
        self.resolve_references(object.fields_mut());
    }

    /// Drop a handle, typically after its object was deleted on the backend.
    pub fn forget(&mut self, handle: LocalHandle) -> Option<Identity> {
        let identity = self.entries.remove(&handle)?;
        if let Some(remote_id) = &identity.remote_id {
            let key = (identity.class_name.clone(), remote_id.clone());
            if self.by_remote.get(&key) == Some(&handle) {
                self.by_remote.remove(&key);
            }
        }
        Some(identity)
    }

    /// Reinstate a persisted entry.
    pub fn restore(&mut self, handle: LocalHandle, identity: Identity) {
        if let Some(remote_id) = &identity.remote_id {
            self.by_remote
                .insert((identity.class_name.clone(), remote_id.clone()), handle);
        }
        self.entries.insert(handle, identity);
    }

    pub fn iter(&self) -> impl Iterator<Item = (LocalHandle, &Identity)> {
        self.entries.iter().map(|(h, i)| (*h, i))
    }

    /// Largest handle ever tracked.
    pub fn max_handle(&self) -> Option<LocalHandle> {
        self.entries.keys().next_back().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assign_is_write_once() {
        let object = BackendObject::new("Post");
        let mut registry = IdentityRegistry::new();
        registry.track(&object).unwrap();

        assert_eq!(registry.resolve(object.handle()), None);
        registry.assign_remote_id(object.handle(), "p1".into()).unwrap();
        registry.assign_remote_id(object.handle(), "p1".into()).unwrap();

        let err = registry
            .assign_remote_id(object.handle(), "p2".into())
            .unwrap_err();
        assert!(matches!(err, Error::IdentityConflict { .. }));
        assert_eq!(registry.resolve(object.handle()).map(String::as_str), Some("p1"));
        assert_eq!(registry.handle_for("Post", "p1"), Some(object.handle()));
    }

    #[test]
    fn unknown_handles_are_rejected() {
        let mut registry = IdentityRegistry::new();
        let handle = LocalHandle::next();
        assert_eq!(
            registry.assign_remote_id(handle, "x".into()),
            Err(Error::UnknownHandle(handle))
        );
        assert!(registry.mark_dirty(handle, &["a".to_string()]).is_err());
    }

    #[test]
    fn dirty_tracking() {
        let object = BackendObject::new("Post").with("title", "t").with("body", "b");
        let mut registry = IdentityRegistry::new();
        registry.track(&object).unwrap();
        assert_eq!(registry.dirty_fields(object.handle()).unwrap().len(), 2);

        registry
            .clear_dirty(object.handle(), &["title".to_string()])
            .unwrap();
        registry
            .mark_dirty(object.handle(), &["tags".to_string()])
            .unwrap();
        let dirty: Vec<_> = registry
            .dirty_fields(object.handle())
            .unwrap()
            .iter()
            .cloned()
            .collect();
        assert_eq!(dirty, vec!["body".to_string(), "tags".to_string()]);
    }

    #[test]
    fn save_order_is_innermost_first() {
        let author = BackendObject::new("_User").with("name", "ann");
        let comment = BackendObject::new("Comment")
            .with("author", author.clone())
            .with("text", "hi");
        let post = BackendObject::new("Post")
            .with("comment", comment.clone())
            .with("owner", author.clone());

        let registry = IdentityRegistry::new();
        let order: Vec<_> = registry
            .save_order(&post)
            .unwrap()
            .into_iter()
            .map(|o| o.handle())
            .collect();

        assert_eq!(order, vec![author.handle(), comment.handle(), post.handle()]);
    }

    #[test]
    fn save_order_skips_resolved_children() {
        let comment = BackendObject::new("Comment").with("text", "hi");
        let post = BackendObject::new("Post").with("comment", comment.clone());

        let mut registry = IdentityRegistry::new();
        registry.track(&comment).unwrap();
        registry
            .assign_remote_id(comment.handle(), "c1".into())
            .unwrap();

        let order = registry.save_order(&post).unwrap();
        assert_eq!(order.len(), 1);

        let mut post = post;
        registry.resolve_nested(&mut post);
        let nested = post.get("comment").and_then(FieldValue::as_object).unwrap();
        assert_eq!(nested.remote_id().map(String::as_str), Some("c1"));
    }

    #[test]
    fn save_order_rejects_self_containment() {
        let mut post = BackendObject::new("Post");
        let copy = post.clone().with("title", "inner");
        post.set("self", copy);

        let registry = IdentityRegistry::new();
        assert!(matches!(
            registry.save_order(&post),
            Err(Error::Serialization(_))
        ));
    }

    #[test]
    fn adopt_rebinds_known_objects() {
        let original = BackendObject::without_data("Post", "p1");
        let mut registry = IdentityRegistry::new();
        registry.track(&original).unwrap();

        let mut refetched = BackendObject::new("Feed").with("top", BackendObject::without_data("Post", "p1"));
        registry.adopt(&mut refetched);

        let nested = refetched.get("top").and_then(FieldValue::as_object).unwrap();
        assert_eq!(nested.handle(), original.handle());
    }

    #[test]
    fn restore_and_forget() {
        let handle = LocalHandle::next();
        let mut registry = IdentityRegistry::new();
        registry.restore(
            handle,
            Identity {
                class_name: "Post".into(),
                remote_id: Some("p9".into()),
                dirty: BTreeSet::new(),
            },
        );
        assert_eq!(registry.handle_for("Post", "p9"), Some(handle));
        assert_eq!(registry.max_handle(), Some(handle));

        assert!(registry.forget(handle).is_some());
        assert_eq!(registry.handle_for("Post", "p9"), None);
        assert!(registry.is_empty());
    }
}
