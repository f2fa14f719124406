//! Backend objects and their process-local handles.

use crate::codec;
use crate::outcome::ServerFields;
use crate::{error::Result, ClassName, Error, FieldName, FieldValue, RemoteId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

/// Opaque local identity of an object, unique for the lifetime of the process.
///
/// Handles referenced by the persisted queue are reloaded on startup, and the
/// allocator is advanced past them with [`LocalHandle::reserve_through`] so a
/// fresh handle never aliases a persisted one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalHandle(u64);

impl LocalHandle {
    /// Allocate a new handle.
    pub fn next() -> Self {
        LocalHandle(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed))
    }

    /// Rebuild a handle from its raw value (persisted log, channel `localId`).
    pub fn from_raw(raw: u64) -> Self {
        LocalHandle(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Ensure every handle allocated from now on is greater than `raw`.
    pub fn reserve_through(raw: u64) {
        NEXT_HANDLE.fetch_max(raw.saturating_add(1), Ordering::Relaxed);
    }
}

impl fmt::Display for LocalHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An object stored on the backend, or about to be.
///
/// The remote id is written once, either when the object is created from a
/// persisted representation or when its first save is confirmed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendObject {
    handle: LocalHandle,
    class_name: ClassName,
    remote_id: Option<RemoteId>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    fields: BTreeMap<FieldName, FieldValue>,
    dirty: BTreeSet<FieldName>,
}

impl BackendObject {
    /// Create a new, unsaved object.
    pub fn new(class_name: impl Into<ClassName>) -> Self {
        Self {
            handle: LocalHandle::next(),
            class_name: class_name.into(),
            remote_id: None,
            created_at: None,
            updated_at: None,
            fields: BTreeMap::new(),
            dirty: BTreeSet::new(),
        }
    }

    /// Create a handle on an existing backend object without any data.
    pub fn without_data(class_name: impl Into<ClassName>, remote_id: impl Into<RemoteId>) -> Self {
        let mut object = Self::new(class_name);
        object.remote_id = Some(remote_id.into());
        object
    }

    /// Replace the local handle, keeping everything else.
    pub fn with_handle(mut self, handle: LocalHandle) -> Self {
        self.handle = handle;
        self
    }

    pub fn handle(&self) -> LocalHandle {
        self.handle
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn remote_id(&self) -> Option<&RemoteId> {
        self.remote_id.as_ref()
    }

    /// Whether the backend has never confirmed this object.
    pub fn is_new(&self) -> bool {
        self.remote_id.is_none()
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    pub fn fields(&self) -> &BTreeMap<FieldName, FieldValue> {
        &self.fields
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Set a field and mark it dirty.
    ///
    /// Reserved names (see [`codec::is_reserved_key`]) are accepted here but
    /// refused when the object is encoded or queued. Use
    /// [`BackendObject::try_set`] to refuse them up front.
    pub fn set(&mut self, name: impl Into<FieldName>, value: impl Into<FieldValue>) {
        let name = name.into();
        self.dirty.insert(name.clone());
        self.fields.insert(name, value.into());
    }

    /// [`BackendObject::set`], refusing names that carry identity on the wire.
    pub fn try_set(&mut self, name: impl Into<FieldName>, value: impl Into<FieldValue>) -> Result<()> {
        let name = name.into();
        codec::check_field_name(&name)?;
        self.set(name, value);
        Ok(())
    }

    /// Builder-style [`BackendObject::set`].
    pub fn with(mut self, name: impl Into<FieldName>, value: impl Into<FieldValue>) -> Self {
        self.set(name, value);
        self
    }

    /// Set a field as known server state, without marking it dirty.
    pub(crate) fn insert_clean(&mut self, name: FieldName, value: FieldValue) {
        self.fields.insert(name, value);
    }

    pub(crate) fn set_timestamps(
        &mut self,
        created_at: Option<DateTime<Utc>>,
        updated_at: Option<DateTime<Utc>>,
    ) {
        if created_at.is_some() {
            self.created_at = created_at;
        }
        if updated_at.is_some() {
            self.updated_at = updated_at;
        }
    }

    pub fn dirty_fields(&self) -> &BTreeSet<FieldName> {
        &self.dirty
    }

    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Treat every present field as locally modified.
    pub fn mark_all_dirty(&mut self) {
        self.dirty = self.fields.keys().cloned().collect();
    }

    /// [`mark_all_dirty`](Self::mark_all_dirty) on this object and on every
    /// embedded object that has no remote id yet, at any depth.
    pub fn mark_unsaved_dirty(&mut self) {
        self.mark_all_dirty();
        for value in self.fields.values_mut() {
            value.for_each_object_mut(&mut |nested| {
                if nested.is_new() {
                    nested.mark_unsaved_dirty();
                }
            });
        }
    }

    pub fn clear_dirty<'a>(&mut self, names: impl IntoIterator<Item = &'a FieldName>) {
        for name in names {
            self.dirty.remove(name);
        }
    }

    /// Assign the backend identity. A second, different assignment is refused.
    pub fn assign_remote_id(&mut self, remote_id: impl Into<RemoteId>) -> Result<()> {
        let remote_id = remote_id.into();
        match &self.remote_id {
            Some(existing) if *existing != remote_id => Err(Error::IdentityConflict {
                handle: self.handle,
                existing: existing.clone(),
                attempted: remote_id,
            }),
            Some(_) => Ok(()),
            None => {
                self.remote_id = Some(remote_id);
                Ok(())
            }
        }
    }

    /// Merge a confirmed save or fetch into this object.
    ///
    /// Server-provided fields overwrite local ones, and `saved` fields stop
    /// being dirty.
    pub fn apply_server_fields<'a>(
        &mut self,
        server: &ServerFields,
        saved: impl IntoIterator<Item = &'a FieldName>,
    ) -> Result<()> {
        if let Some(remote_id) = &server.remote_id {
            self.assign_remote_id(remote_id.clone())?;
        }
        self.set_timestamps(server.created_at, server.updated_at);
        for (name, value) in &server.fields {
            self.fields.insert(name.clone(), value.clone());
        }
        self.clear_dirty(saved);
        Ok(())
    }

    /// Snapshot of the dirty fields, the payload of a save.
    pub fn dirty_snapshot(&self) -> BTreeMap<FieldName, FieldValue> {
        self.dirty
            .iter()
            .filter_map(|name| self.fields.get(name).map(|v| (name.clone(), v.clone())))
            .collect()
    }

    /// Embedded objects reachable through dirty fields that have no remote id.
    pub fn unresolved_children(&self) -> Vec<&BackendObject> {
        let mut children = Vec::new();
        for name in &self.dirty {
            if let Some(value) = self.fields.get(name) {
                value.for_each_object(&mut |obj| {
                    if obj.is_new() {
                        children.push(obj);
                    }
                });
            }
        }
        children
    }

    /// Same identity, no data. Queued snapshots hold children this way.
    pub fn stub(&self) -> BackendObject {
        BackendObject {
            handle: self.handle,
            class_name: self.class_name.clone(),
            remote_id: self.remote_id.clone(),
            created_at: None,
            updated_at: None,
            fields: BTreeMap::new(),
            dirty: BTreeSet::new(),
        }
    }

    pub(crate) fn set_handle(&mut self, handle: LocalHandle) {
        self.handle = handle;
    }

    pub(crate) fn fields_mut(&mut self) -> &mut BTreeMap<FieldName, FieldValue> {
        &mut self.fields
    }

    pub(crate) fn fill_remote_id(&mut self, remote_id: RemoteId) {
        if self.remote_id.is_none() {
            self.remote_id = Some(remote_id);
        }
    }
}

/// Objects are equal when they carry the same data. The local handle and the
/// dirty set are bookkeeping and do not take part.
impl PartialEq for BackendObject {
    fn eq(&self, other: &Self) -> bool {
        self.class_name == other.class_name
            && self.remote_id == other.remote_id
            && self.created_at == other.created_at
            && self.updated_at == other.updated_at
            && self.fields == other.fields
    }
}
