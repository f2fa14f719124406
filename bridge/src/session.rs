//! Process-wide session state.
//!
//! Holds the current user, the installation identity and the last fetched
//! configuration. Everything is loaded from `session_state` at startup and
//! written back on every change; logging out clears the current user.

use crate::db::{self, Pool};
use crate::error::{AppError, Result};
use parcel_engine::codec::KEY_OBJECT_ID;
use parcel_engine::{LocalHandle, Mapping};
use serde_json::Value;
use tokio::sync::RwLock;

const KEY_CURRENT_USER: &str = "currentUser";
const KEY_INSTALLATION_ID: &str = "installationId";
const KEY_INSTALLATION_HANDLE: &str = "installationHandle";
const KEY_CONFIG: &str = "config";

/// Key of the session token on a user mapping.
pub const SESSION_TOKEN: &str = "sessionToken";

#[derive(Debug, Default)]
struct State {
    current_user: Option<Mapping>,
    config: Option<Mapping>,
}

#[derive(Debug)]
pub struct Session {
    pool: Pool,
    installation_id: String,
    installation_handle: LocalHandle,
    state: RwLock<State>,
}

async fn load_mapping(pool: &Pool, key: &str) -> Result<Option<Mapping>> {
    match db::get_value(pool, key).await? {
        Some(text) => match serde_json::from_str::<Value>(&text) {
            Ok(Value::Object(map)) => Ok(Some(map)),
            _ => {
                tracing::warn!(key, "Discarding unreadable session entry");
                Ok(None)
            }
        },
        None => Ok(None),
    }
}

async fn store_mapping(pool: &Pool, key: &str, value: &Mapping) -> Result<()> {
    let text = serde_json::to_string(value).map_err(|e| AppError::Internal(e.to_string()))?;
    db::set_value(pool, key, &text).await?;
    Ok(())
}

impl Session {
    /// Load session state, creating the installation identity on first run.
    ///
    /// Must run after every persisted handle has been reserved, since a
    /// first run allocates the installation handle.
    pub async fn load(pool: Pool) -> Result<Self> {
        let installation_id = match db::get_value(&pool, KEY_INSTALLATION_ID).await? {
            Some(id) => id,
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                db::set_value(&pool, KEY_INSTALLATION_ID, &id).await?;
                tracing::info!(installation_id = %id, "Created installation identity");
                id
            }
        };

        let stored_handle = db::get_value(&pool, KEY_INSTALLATION_HANDLE)
            .await?
            .and_then(|raw| raw.parse::<u64>().ok());
        let installation_handle = match stored_handle {
            Some(raw) => {
                LocalHandle::reserve_through(raw);
                LocalHandle::from_raw(raw)
            }
            None => {
                let handle = LocalHandle::next();
                db::set_value(&pool, KEY_INSTALLATION_HANDLE, &handle.to_string()).await?;
                handle
            }
        };

        let state = State {
            current_user: load_mapping(&pool, KEY_CURRENT_USER).await?,
            config: load_mapping(&pool, KEY_CONFIG).await?,
        };

        Ok(Self {
            pool,
            installation_id,
            installation_handle,
            state: RwLock::new(state),
        })
    }

    pub fn installation_id(&self) -> &str {
        &self.installation_id
    }

    /// Handle of the installation object, stable across restarts.
    pub fn installation_handle(&self) -> LocalHandle {
        self.installation_handle
    }

    pub async fn current_user(&self) -> Option<Mapping> {
        self.state.read().await.current_user.clone()
    }

    pub async fn session_token(&self) -> Option<String> {
        self.state
            .read()
            .await
            .current_user
            .as_ref()
            .and_then(|user| user.get(SESSION_TOKEN))
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    pub async fn set_current_user(&self, user: Mapping) -> Result<()> {
        let mut state = self.state.write().await;
        store_mapping(&self.pool, KEY_CURRENT_USER, &user).await?;
        state.current_user = Some(user);
        Ok(())
    }

    pub async fn clear_current_user(&self) -> Result<()> {
        let mut state = self.state.write().await;
        db::delete_value(&self.pool, KEY_CURRENT_USER).await?;
        state.current_user = None;
        Ok(())
    }

    /// Merge a saved or fetched user into the current user when it is the
    /// same user. The session token is kept. Returns whether it matched.
    pub async fn refresh_current_user(&self, user: &Mapping) -> Result<bool> {
        let mut state = self.state.write().await;
        let Some(current) = state.current_user.as_ref() else {
            return Ok(false);
        };
        let same = match (current.get(KEY_OBJECT_ID), user.get(KEY_OBJECT_ID)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        };
        if !same {
            return Ok(false);
        }

        let mut merged = current.clone();
        for (key, value) in user {
            if key != SESSION_TOKEN && key != "password" {
                merged.insert(key.clone(), value.clone());
            }
        }
        store_mapping(&self.pool, KEY_CURRENT_USER, &merged).await?;
        state.current_user = Some(merged);
        Ok(true)
    }

    pub async fn config(&self) -> Option<Mapping> {
        self.state.read().await.config.clone()
    }

    pub async fn set_config(&self, config: Mapping) -> Result<()> {
        let mut state = self.state.write().await;
        store_mapping(&self.pool, KEY_CONFIG, &config).await?;
        state.config = Some(config);
        Ok(())
    }
}
