//! In-process backend.
//!
//! Keeps objects, users and configuration in memory and records every call.
//! It can be taken offline or told to fail the next calls with a given error,
//! which is how the queue's retry paths are exercised. A latency can be set
//! to keep calls in flight long enough for concurrent drains to overlap.

use super::{Backend, BackendResult, QueryRequest, QueryResponse};
use async_trait::async_trait;
use parcel_engine::codec::{format_date, KEY_CREATED_AT, KEY_OBJECT_ID, KEY_UPDATED_AT};
use parcel_engine::outcome::codes;
use parcel_engine::{BackendError, Mapping};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;

/// One request received by a [`MemoryBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    Create { class_name: String },
    Update { class_name: String, remote_id: String },
    Delete { class_name: String, remote_id: String },
    Fetch { class_name: String, remote_id: String },
    Query { class_name: String },
    LogIn { username: String },
    SignUp { username: String },
    LogOut,
    FetchConfig,
}

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<(String, String), Mapping>,
    /// username -> (password, objectId)
    users: HashMap<String, (String, String)>,
    /// session token -> objectId
    sessions: HashMap<String, String>,
    config: Mapping,
    faults: VecDeque<BackendError>,
    offline: bool,
    journal: Vec<BackendCall>,
}

#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<State>,
    latency: Mutex<Option<Duration>>,
}

fn new_object_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..10].to_string()
}

fn now() -> Value {
    Value::String(format_date(&chrono::Utc::now()))
}

fn object_key(class_name: &str, remote_id: &str) -> (String, String) {
    (class_name.to_string(), remote_id.to_string())
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline every call fails with a connection error.
    pub async fn set_offline(&self, offline: bool) {
        self.state.lock().await.offline = offline;
    }

    /// Delay every call by `latency` before it is handled. Other calls are
    /// not blocked while one waits.
    pub async fn set_latency(&self, latency: Duration) {
        *self.latency.lock().await = Some(latency);
    }

    /// Fail the next call with `error`. Faults queue up in order.
    pub async fn fail_next(&self, error: BackendError) {
        self.state.lock().await.faults.push_back(error);
    }

    /// Every call received so far, including failed ones.
    pub async fn journal(&self) -> Vec<BackendCall> {
        self.state.lock().await.journal.clone()
    }

    pub async fn object(&self, class_name: &str, remote_id: &str) -> Option<Mapping> {
        self.state
            .lock()
            .await
            .objects
            .get(&object_key(class_name, remote_id))
            .cloned()
    }

    pub async fn objects_of(&self, class_name: &str) -> Vec<Mapping> {
        self.state
            .lock()
            .await
            .objects
            .iter()
            .filter(|((class, _), _)| class == class_name)
            .map(|(_, object)| object.clone())
            .collect()
    }

    /// Store an object as if another client had created it. Returns its id.
    pub async fn insert_object(&self, class_name: &str, mut fields: Mapping) -> String {
        let id = new_object_id();
        fields.insert(KEY_OBJECT_ID.into(), Value::String(id.clone()));
        fields.insert(KEY_CREATED_AT.into(), now());
        fields.insert(KEY_UPDATED_AT.into(), now());
        self.state
            .lock()
            .await
            .objects
            .insert(object_key(class_name, &id), fields);
        id
    }

    pub async fn set_config(&self, config: Mapping) {
        self.state.lock().await.config = config;
    }

    /// Record the call, then apply offline mode and queued faults.
    async fn begin(&self, call: BackendCall) -> BackendResult<tokio::sync::MutexGuard<'_, State>> {
        let latency = *self.latency.lock().await;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.state.lock().await;
        state.journal.push(call);
        if state.offline {
            return Err(BackendError::connection("backend unreachable"));
        }
        if let Some(fault) = state.faults.pop_front() {
            return Err(fault);
        }
        Ok(state)
    }
}

impl State {
    fn user_for_session(&self, session: Option<&str>) -> Option<&String> {
        session.and_then(|token| self.sessions.get(token))
    }

    fn open_session(&mut self, user_id: &str) -> String {
        let token = format!("r:{}", uuid::Uuid::new_v4().simple());
        self.sessions.insert(token.clone(), user_id.to_string());
        token
    }
}

fn matches(object: &Mapping, constraints: Option<&Mapping>) -> bool {
    constraints.map_or(true, |constraints| {
        constraints
            .iter()
            .all(|(key, expected)| object.get(key).unwrap_or(&Value::Null) == expected)
    })
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn save(
        &self,
        class_name: &str,
        remote_id: Option<&str>,
        body: Mapping,
        session: Option<&str>,
    ) -> BackendResult<Mapping> {
        let call = match remote_id {
            Some(id) => BackendCall::Update {
                class_name: class_name.to_string(),
                remote_id: id.to_string(),
            },
            None => BackendCall::Create {
                class_name: class_name.to_string(),
            },
        };
        let mut state = self.begin(call).await?;

        match remote_id {
            Some(id) => {
                if class_name == "_User" && state.user_for_session(session).map(String::as_str) != Some(id) {
                    return Err(BackendError::new(
                        codes::SESSION_MISSING,
                        "cannot modify user without an authenticated session",
                    ));
                }
                let stored = state
                    .objects
                    .get_mut(&object_key(class_name, id))
                    .ok_or_else(|| BackendError::not_found("Object not found."))?;
                stored.extend(body);
                let updated_at = now();
                stored.insert(KEY_UPDATED_AT.into(), updated_at.clone());

                let mut response = Mapping::new();
                response.insert(KEY_UPDATED_AT.into(), updated_at);
                Ok(response)
            }
            None => {
                let id = new_object_id();
                let created_at = now();
                let mut stored = body;
                stored.insert(KEY_OBJECT_ID.into(), Value::String(id.clone()));
                stored.insert(KEY_CREATED_AT.into(), created_at.clone());
                stored.insert(KEY_UPDATED_AT.into(), created_at.clone());
                state.objects.insert(object_key(class_name, &id), stored);

                let mut response = Mapping::new();
                response.insert(KEY_OBJECT_ID.into(), Value::String(id));
                response.insert(KEY_CREATED_AT.into(), created_at);
                Ok(response)
            }
        }
    }

    async fn delete(&self, class_name: &str, remote_id: &str, _session: Option<&str>) -> BackendResult<()> {
        let mut state = self
            .begin(BackendCall::Delete {
                class_name: class_name.to_string(),
                remote_id: remote_id.to_string(),
            })
            .await?;
        state
            .objects
            .remove(&object_key(class_name, remote_id))
            .map(|_| ())
            .ok_or_else(|| BackendError::not_found("Object not found."))
    }

    async fn fetch(&self, class_name: &str, remote_id: &str, _session: Option<&str>) -> BackendResult<Mapping> {
        let state = self
            .begin(BackendCall::Fetch {
                class_name: class_name.to_string(),
                remote_id: remote_id.to_string(),
            })
            .await?;
        let mut object = state
            .objects
            .get(&object_key(class_name, remote_id))
            .cloned()
            .ok_or_else(|| BackendError::not_found("Object not found."))?;
        object.remove("password");
        Ok(object)
    }

    async fn query(&self, request: &QueryRequest, _session: Option<&str>) -> BackendResult<QueryResponse> {
        let state = self
            .begin(BackendCall::Query {
                class_name: request.class_name.clone(),
            })
            .await?;

        let found = state
            .objects
            .iter()
            .filter(|((class, _), object)| {
                *class == request.class_name && matches(object, request.r#where.as_ref())
            })
            .map(|(_, object)| object);

        if request.count {
            return Ok(QueryResponse::Count(found.count() as i64));
        }

        let skip = request.skip.unwrap_or(0).max(0) as usize;
        let limit = request.limit.unwrap_or(100).max(0) as usize;
        let results = found
            .skip(skip)
            .take(limit)
            .map(|object| {
                let mut object = object.clone();
                object.remove("password");
                object
            })
            .collect();
        Ok(QueryResponse::Results(results))
    }

    async fn log_in(&self, username: &str, password: &str) -> BackendResult<Mapping> {
        let mut state = self
            .begin(BackendCall::LogIn {
                username: username.to_string(),
            })
            .await?;

        let user_id = match state.users.get(username) {
            Some((stored, id)) if stored == password => id.clone(),
            _ => {
                return Err(BackendError::not_found("Invalid username/password."));
            }
        };
        let token = state.open_session(&user_id);
        let mut user = state
            .objects
            .get(&object_key("_User", &user_id))
            .cloned()
            .unwrap_or_default();
        user.remove("password");
        user.insert("sessionToken".into(), Value::String(token));
        Ok(user)
    }

    async fn sign_up(&self, user: Mapping) -> BackendResult<Mapping> {
        let username = user
            .get("username")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let mut state = self
            .begin(BackendCall::SignUp {
                username: username.clone(),
            })
            .await?;

        if username.is_empty() {
            return Err(BackendError::new(codes::USERNAME_MISSING, "bad or missing username"));
        }
        let password = match user.get("password").and_then(Value::as_str) {
            Some(password) if !password.is_empty() => password.to_string(),
            _ => return Err(BackendError::new(codes::PASSWORD_MISSING, "password is required")),
        };
        if state.users.contains_key(&username) {
            return Err(BackendError::new(
                codes::USERNAME_TAKEN,
                "Account already exists for this username.",
            ));
        }

        let id = new_object_id();
        let created_at = now();
        let mut stored = user;
        stored.insert(KEY_OBJECT_ID.into(), Value::String(id.clone()));
        stored.insert(KEY_CREATED_AT.into(), created_at.clone());
        stored.insert(KEY_UPDATED_AT.into(), created_at);
        state.users.insert(username, (password, id.clone()));
        state.objects.insert(object_key("_User", &id), stored.clone());

        let token = state.open_session(&id);
        stored.remove("password");
        stored.insert("sessionToken".into(), Value::String(token));
        Ok(stored)
    }

    async fn log_out(&self, session: &str) -> BackendResult<()> {
        let mut state = self.begin(BackendCall::LogOut).await?;
        state.sessions.remove(session);
        Ok(())
    }

    async fn fetch_config(&self, _session: Option<&str>) -> BackendResult<Mapping> {
        let state = self.begin(BackendCall::FetchConfig).await?;
        Ok(state.config.clone())
    }
}
