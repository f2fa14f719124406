//! The identity registry shared by the queue, the executor and the
//! dispatcher, backed by the `identities` table.

use crate::db::{self, Pool};
use crate::error::Result;
use parcel_engine::{
    BackendObject, ClassName, Error as EngineError, FieldName, FieldValue, Identity, IdentityRegistry,
    LocalHandle, RemoteId,
};
use std::collections::BTreeMap;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug)]
pub struct Identities {
    pool: Pool,
    registry: RwLock<IdentityRegistry>,
}

impl Identities {
    /// Rebuild the registry from disk and move the handle allocator past
    /// every persisted handle.
    pub async fn load(pool: Pool) -> Result<Self> {
        let mut registry = IdentityRegistry::new();
        for row in db::load_identities(&pool).await? {
            registry.restore(row.handle(), row.to_identity());
        }
        if let Some(max) = registry.max_handle() {
            LocalHandle::reserve_through(max.as_u64());
        }
        tracing::debug!(identities = registry.len(), "Loaded identity registry");

        Ok(Self {
            pool,
            registry: RwLock::new(registry),
        })
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, IdentityRegistry> {
        self.registry.read().await
    }

    pub async fn write(&self) -> RwLockWriteGuard<'_, IdentityRegistry> {
        self.registry.write().await
    }

    pub async fn resolve(&self, handle: LocalHandle) -> Option<RemoteId> {
        self.registry.read().await.resolve(handle).cloned()
    }

    pub async fn resolve_references(&self, fields: &mut BTreeMap<FieldName, FieldValue>) {
        self.registry.read().await.resolve_references(fields);
    }

    pub async fn resolve_nested(&self, object: &mut BackendObject) {
        self.registry.read().await.resolve_nested(object);
    }

    pub async fn adopt(&self, object: &mut BackendObject) {
        self.registry.read().await.adopt(object);
    }

    /// Record a confirmed save: the remote id (write-once) and the fields
    /// that are no longer dirty. The row is written before memory changes.
    pub async fn confirm_save(
        &self,
        handle: LocalHandle,
        class_name: &str,
        remote_id: Option<&RemoteId>,
        saved: &[FieldName],
    ) -> Result<()> {
        let mut registry = self.registry.write().await;
        let mut identity = registry
            .get(handle)
            .cloned()
            .unwrap_or_else(|| Identity::new(ClassName::from(class_name)));

        if let Some(remote_id) = remote_id {
            match &identity.remote_id {
                Some(existing) if existing != remote_id => {
                    return Err(EngineError::IdentityConflict {
                        handle,
                        existing: existing.clone(),
                        attempted: remote_id.clone(),
                    }
                    .into());
                }
                Some(_) => {}
                None => identity.remote_id = Some(remote_id.clone()),
            }
        }
        for name in saved {
            identity.dirty.remove(name);
        }

        let mut conn = self.pool.acquire().await?;
        db::upsert_identity(&mut *conn, handle, &identity).await?;
        registry.restore(handle, identity);
        Ok(())
    }

    /// Drop a handle whose object was deleted on the backend.
    pub async fn forget(&self, handle: LocalHandle) -> Result<()> {
        let mut registry = self.registry.write().await;
        db::delete_identity(&self.pool, handle).await?;
        registry.forget(handle);
        Ok(())
    }
}
