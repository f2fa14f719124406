//! Database operations for the eventually_commands table.

use parcel_engine::{
    Command, CommandId, CommandKind, FieldName, FieldValue, Identity, LocalHandle, LogChange,
};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use std::collections::BTreeMap;

use super::{upsert_identity, Pool};

const NEXT_COMMAND_ID: &str = "next_command_id";

/// A stored command row from the database.
#[derive(Debug)]
pub struct StoredCommand {
    pub id: i64,
    pub kind: String,
    pub target: i64,
    pub class_name: String,
    pub remote_id: Option<String>,
    pub fields: Option<String>,
    pub depends_on: String,
    pub created_at: i64,
    pub attempts: i64,
}

impl<'r> sqlx::FromRow<'r, SqliteRow> for StoredCommand {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(StoredCommand {
            id: row.try_get("id")?,
            kind: row.try_get("kind")?,
            target: row.try_get("target")?,
            class_name: row.try_get("class_name")?,
            remote_id: row.try_get("remote_id")?,
            fields: row.try_get("fields")?,
            depends_on: row.try_get("depends_on")?,
            created_at: row.try_get("created_at")?,
            attempts: row.try_get("attempts")?,
        })
    }
}

impl StoredCommand {
    /// Convert a database row to an engine command.
    pub fn to_command(&self) -> Result<Command, String> {
        let kind = CommandKind::parse(&self.kind)
            .ok_or_else(|| format!("Unknown command kind: {}", self.kind))?;
        let fields = match &self.fields {
            Some(text) => Some(
                serde_json::from_str::<BTreeMap<FieldName, FieldValue>>(text)
                    .map_err(|e| format!("Corrupt field snapshot of command {}: {}", self.id, e))?,
            ),
            None => None,
        };
        let depends_on: Vec<u64> = serde_json::from_str(&self.depends_on)
            .map_err(|e| format!("Corrupt dependencies of command {}: {}", self.id, e))?;

        Ok(Command {
            id: self.id as CommandId,
            kind,
            target: LocalHandle::from_raw(self.target as u64),
            class_name: self.class_name.clone(),
            remote_id: self.remote_id.clone(),
            fields,
            depends_on: depends_on.into_iter().map(LocalHandle::from_raw).collect(),
            created_at: self.created_at as u64,
            attempts: self.attempts as u32,
        })
    }
}

/// Load every persisted command, oldest first.
pub async fn load_commands(pool: &Pool) -> Result<Vec<StoredCommand>, sqlx::Error> {
    sqlx::query_as::<_, StoredCommand>(
        r#"
        SELECT id, kind, target, class_name, remote_id, fields,
               depends_on, created_at, attempts
        FROM eventually_commands
        ORDER BY id ASC
        "#,
    )
    .fetch_all(pool)
    .await
}

/// Load the command id counter. Zero when nothing was ever queued.
pub async fn load_next_command_id(pool: &Pool) -> Result<CommandId, sqlx::Error> {
    let row: Option<(i64,)> = sqlx::query_as("SELECT value FROM queue_meta WHERE key = ?1")
        .bind(NEXT_COMMAND_ID)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|(value,)| value as CommandId).unwrap_or(0))
}

/// Largest object handle referenced by the log.
pub async fn max_command_target(pool: &Pool) -> Result<Option<u64>, sqlx::Error> {
    let row: (Option<i64>,) = sqlx::query_as("SELECT MAX(target) FROM eventually_commands")
        .fetch_one(pool)
        .await?;
    Ok(row.0.map(|raw| raw as u64))
}

fn encode_error(err: serde_json::Error) -> sqlx::Error {
    sqlx::Error::Encode(Box::new(err))
}

/// Insert or overwrite one command row.
pub async fn upsert_command(conn: &mut SqliteConnection, command: &Command) -> Result<(), sqlx::Error> {
    let fields = command
        .fields
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(encode_error)?;
    let depends_on: Vec<u64> = command.depends_on.iter().map(|h| h.as_u64()).collect();
    let depends_on = serde_json::to_string(&depends_on).map_err(encode_error)?;

    sqlx::query(
        r#"
        INSERT INTO eventually_commands (
            id, kind, target, class_name, remote_id, fields,
            depends_on, created_at, attempts
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        ON CONFLICT (id) DO UPDATE SET
            remote_id = excluded.remote_id,
            fields = excluded.fields,
            depends_on = excluded.depends_on,
            attempts = excluded.attempts
        "#,
    )
    .bind(command.id as i64)
    .bind(command.kind.as_str())
    .bind(command.target.as_u64() as i64)
    .bind(&command.class_name)
    .bind(&command.remote_id)
    .bind(fields)
    .bind(depends_on)
    .bind(command.created_at as i64)
    .bind(command.attempts as i64)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Write a [`LogChange`] on an open connection or transaction.
pub async fn apply_change(conn: &mut SqliteConnection, change: &LogChange) -> Result<(), sqlx::Error> {
    for command in &change.upserts {
        upsert_command(conn, command).await?;
    }

    for id in &change.removals {
        sqlx::query("DELETE FROM eventually_commands WHERE id = ?1")
            .bind(*id as i64)
            .execute(&mut *conn)
            .await?;
    }

    sqlx::query(
        r#"
        INSERT INTO queue_meta (key, value) VALUES (?1, ?2)
        ON CONFLICT (key) DO UPDATE SET value = MAX(value, excluded.value)
        "#,
    )
    .bind(NEXT_COMMAND_ID)
    .bind(change.next_id as i64)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Persist a log change together with the identities it relies on, in one
/// transaction.
pub async fn persist_change(
    pool: &Pool,
    change: &LogChange,
    identities: &[(LocalHandle, Identity)],
) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    for (handle, identity) in identities {
        upsert_identity(&mut *tx, *handle, identity).await?;
    }
    apply_change(&mut *tx, change).await?;
    tx.commit().await
}
