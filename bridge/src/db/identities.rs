//! Database operations for the identities table.

use parcel_engine::{FieldName, Identity, LocalHandle};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use std::collections::BTreeSet;

use super::Pool;

/// A stored identity row.
#[derive(Debug)]
pub struct StoredIdentity {
    pub handle: i64,
    pub class_name: String,
    pub remote_id: Option<String>,
    pub dirty: String,
}

impl<'r> sqlx::FromRow<'r, SqliteRow> for StoredIdentity {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(StoredIdentity {
            handle: row.try_get("handle")?,
            class_name: row.try_get("class_name")?,
            remote_id: row.try_get("remote_id")?,
            dirty: row.try_get("dirty")?,
        })
    }
}

impl StoredIdentity {
    pub fn handle(&self) -> LocalHandle {
        LocalHandle::from_raw(self.handle as u64)
    }

    /// Convert the row to a registry entry. A corrupt dirty set reads as empty.
    pub fn to_identity(&self) -> Identity {
        let dirty: BTreeSet<FieldName> = serde_json::from_str(&self.dirty).unwrap_or_default();
        Identity {
            class_name: self.class_name.clone(),
            remote_id: self.remote_id.clone(),
            dirty,
        }
    }
}

pub async fn load_identities(pool: &Pool) -> Result<Vec<StoredIdentity>, sqlx::Error> {
    sqlx::query_as::<_, StoredIdentity>(
        "SELECT handle, class_name, remote_id, dirty FROM identities ORDER BY handle ASC",
    )
    .fetch_all(pool)
    .await
}

/// Insert or overwrite the row of one handle.
pub async fn upsert_identity(
    conn: &mut SqliteConnection,
    handle: LocalHandle,
    identity: &Identity,
) -> Result<(), sqlx::Error> {
    let dirty = serde_json::to_string(&identity.dirty).map_err(|e| sqlx::Error::Encode(Box::new(e)))?;

    sqlx::query(
        r#"
        INSERT INTO identities (handle, class_name, remote_id, dirty)
        VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT (handle) DO UPDATE SET
            remote_id = COALESCE(identities.remote_id, excluded.remote_id),
            dirty = excluded.dirty
        "#,
    )
    .bind(handle.as_u64() as i64)
    .bind(&identity.class_name)
    .bind(&identity.remote_id)
    .bind(dirty)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

pub async fn delete_identity(pool: &Pool, handle: LocalHandle) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM identities WHERE handle = ?1")
        .bind(handle.as_u64() as i64)
        .execute(pool)
        .await?;
    Ok(())
}
