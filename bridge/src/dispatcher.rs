//! Bridge Dispatcher: named operations over transport mappings.
//!
//! The typed methods are the API; [`Dispatcher::call`] routes the channel's
//! method names onto them and renders results as JSON.

use crate::backend::QueryRequest;
use crate::error::{AppError, Result};
use crate::executor::{CommandExecutor, QueryOutput};
use crate::identities::Identities;
use crate::queue::EventuallyQueue;
use crate::session::Session;
use parcel_engine::codec::{self, EncodeContext, KEY_CLASS_NAME, KEY_LOCAL_ID, KEY_OBJECT_ID};
use parcel_engine::outcome::codes;
use parcel_engine::{BackendObject, CommandState, EnqueueAck, LocalHandle, Mapping, QueuedCommand};
use serde_json::{json, Value};
use std::sync::Arc;

const USER_CLASS: &str = "_User";
const INSTALLATION_CLASS: &str = "_Installation";

pub struct Dispatcher {
    executor: Arc<CommandExecutor>,
    queue: Arc<EventuallyQueue>,
    identities: Arc<Identities>,
    session: Arc<Session>,
    device_type: String,
}

/// Accept an argument object, or a string holding one.
fn parse_args(args: Value) -> Result<Mapping> {
    match args {
        Value::Object(map) => Ok(map),
        Value::String(text) => match serde_json::from_str(&text) {
            Ok(Value::Object(map)) => Ok(map),
            _ => Err(AppError::invalid_json("invalid parse object")),
        },
        _ => Err(AppError::invalid_json("invalid parse object")),
    }
}

fn string_arg<'a>(args: &'a Mapping, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

fn render_object(object: &BackendObject) -> Result<Value> {
    let mut map = codec::encode(object, EncodeContext::Immediate)?;
    map.insert(KEY_LOCAL_ID.into(), json!(object.handle().as_u64()));
    Ok(Value::Object(map))
}

fn render_ack(ack: &EnqueueAck, handle: LocalHandle) -> Value {
    let (status, dropped) = match ack {
        EnqueueAck::Queued(_) => ("queued", Vec::new()),
        EnqueueAck::Merged(_) => ("merged", Vec::new()),
        EnqueueAck::Collapsed { dropped } => ("collapsed", dropped.clone()),
    };
    json!({
        "status": status,
        "commandId": ack.command_id(),
        "dropped": dropped,
        "localId": handle.as_u64(),
    })
}

fn render_pending(entry: &QueuedCommand) -> Value {
    let command = &entry.command;
    let (state, not_before) = match entry.state {
        CommandState::Pending => ("pending", None),
        CommandState::InFlight => ("in_flight", None),
        CommandState::RetryScheduled { not_before } => ("retry_scheduled", Some(not_before)),
    };
    json!({
        "commandId": command.id,
        "kind": command.kind.as_str(),
        "className": command.class_name,
        "objectId": command.remote_id,
        "localId": command.target.as_u64(),
        "fields": command.field_names(),
        "attempts": command.attempts,
        "state": state,
        "notBefore": not_before,
    })
}

/// A user mapping as returned to callers.
fn user_value(mut user: Mapping) -> Value {
    user.remove("password");
    user.entry(KEY_CLASS_NAME)
        .or_insert_with(|| Value::String(USER_CLASS.into()));
    Value::Object(user)
}

impl Dispatcher {
    pub fn new(
        executor: Arc<CommandExecutor>,
        queue: Arc<EventuallyQueue>,
        identities: Arc<Identities>,
        session: Arc<Session>,
        device_type: impl Into<String>,
    ) -> Self {
        Self {
            executor,
            queue,
            identities,
            session,
            device_type: device_type.into(),
        }
    }

    /// Decode the object an operation acts on.
    ///
    /// The object keeps the handle it had in earlier calls: the one named by
    /// `localId`, or the one already bound to its `objectId`. Every field
    /// sent is treated as modified, on the object and on the unsaved objects
    /// embedded in it.
    pub async fn object_from_args(&self, args: &Mapping) -> Result<BackendObject> {
        let class_name =
            codec::class_name_of(args).ok_or_else(|| AppError::invalid_json("no className found"))?;
        let mut object = codec::decode(args, Some(&class_name))?;
        self.identities.adopt(&mut object).await;

        if let Some(local_id) = args.get(KEY_LOCAL_ID) {
            let raw = local_id
                .as_u64()
                .ok_or_else(|| AppError::invalid_json("localId must be a non-negative integer"))?;
            LocalHandle::reserve_through(raw);
            object = object.with_handle(LocalHandle::from_raw(raw));
        }
        object.mark_unsaved_dirty();
        Ok(object)
    }

    pub async fn save(&self, mut object: BackendObject) -> Result<BackendObject> {
        self.executor.save_now(&mut object).await?;
        Ok(object)
    }

    pub async fn save_eventually(&self, object: &BackendObject) -> Result<EnqueueAck> {
        self.queue.enqueue_save(object).await
    }

    pub async fn delete(&self, object: &BackendObject) -> Result<()> {
        self.executor.delete_now(object).await
    }

    pub async fn delete_eventually(&self, object: &BackendObject) -> Result<EnqueueAck> {
        self.queue.enqueue_delete(object).await
    }

    pub async fn fetch(&self, mut object: BackendObject) -> Result<BackendObject> {
        self.executor.fetch(&mut object).await?;
        Ok(object)
    }

    pub async fn query(&self, request: &QueryRequest) -> Result<QueryOutput> {
        self.executor.query(request).await
    }

    pub async fn current_user(&self) -> Option<Mapping> {
        self.session.current_user().await
    }

    pub async fn log_in(&self, username: &str, password: &str) -> Result<Mapping> {
        let user = self.executor.log_in(username, password).await?;
        self.session.set_current_user(user.clone()).await?;
        tracing::info!(username, "Logged in");
        Ok(user)
    }

    /// Sign up a new user. Every key besides the identity keys is stored on
    /// the user.
    pub async fn register(&self, mut user: Mapping) -> Result<Mapping> {
        for key in [KEY_CLASS_NAME, KEY_LOCAL_ID, KEY_OBJECT_ID] {
            user.remove(key);
        }
        let created = self.executor.sign_up(user).await?;
        self.session.set_current_user(created.clone()).await?;
        tracing::info!(
            username = created.get("username").and_then(serde_json::Value::as_str).unwrap_or_default(),
            "Registered user"
        );
        Ok(created)
    }

    /// Log out. The local session ends even when the backend cannot be told.
    pub async fn log_out(&self) -> Result<()> {
        if let Some(token) = self.session.session_token().await {
            if let Err(err) = self.executor.log_out(&token).await {
                tracing::warn!(error = %err, "Backend logout failed, clearing local session anyway");
            }
        }
        self.session.clear_current_user().await
    }

    pub async fn current_config(&self) -> Option<Mapping> {
        self.session.config().await
    }

    pub async fn fetch_config(&self) -> Result<Mapping> {
        let config = self.executor.fetch_config().await?;
        self.session.set_config(config.clone()).await?;
        Ok(config)
    }

    /// Queue a save of this device's installation object.
    pub async fn register_installation(&self) -> Result<EnqueueAck> {
        let installation = BackendObject::new(INSTALLATION_CLASS)
            .with_handle(self.session.installation_handle())
            .with("installationId", self.session.installation_id())
            .with("deviceType", self.device_type.as_str());
        self.queue.enqueue_save(&installation).await
    }

    pub async fn pending(&self) -> Vec<QueuedCommand> {
        self.queue.pending().await
    }

    pub async fn connectivity_restored(&self) -> usize {
        self.queue.connectivity_restored().await
    }

    /// Route a channel method.
    pub async fn call(&self, method: &str, args: Value) -> Result<Value> {
        tracing::debug!(method, "Dispatching call");
        match method {
            "initialize" => Ok(Value::Bool(true)),

            "installation" => {
                self.register_installation().await?;
                Ok(Value::Bool(true))
            }

            "getCurrentUser" => Ok(self.current_user().await.map(user_value).unwrap_or(Value::Null)),

            "login" => {
                let args = parse_args(args)?;
                let username = string_arg(&args, "username")
                    .ok_or_else(|| AppError::bad_request(codes::USERNAME_MISSING, "username is required"))?;
                let password = string_arg(&args, "password")
                    .ok_or_else(|| AppError::bad_request(codes::PASSWORD_MISSING, "password is required"))?;
                Ok(user_value(self.log_in(username, password).await?))
            }

            "register" => {
                let args = parse_args(args)?;
                if string_arg(&args, "username").is_none() {
                    return Err(AppError::bad_request(codes::USERNAME_MISSING, "username is required"));
                }
                if string_arg(&args, "password").is_none() {
                    return Err(AppError::bad_request(codes::PASSWORD_MISSING, "password is required"));
                }
                Ok(user_value(self.register(args).await?))
            }

            "logout" => {
                self.log_out().await?;
                Ok(Value::Null)
            }

            "saveInBackground" => {
                let args = parse_args(args)?;
                let object = self.object_from_args(&args).await?;
                render_object(&self.save(object).await?)
            }

            "saveEventually" => {
                let args = parse_args(args)?;
                let object = self.object_from_args(&args).await?;
                let ack = self.save_eventually(&object).await?;
                Ok(render_ack(&ack, object.handle()))
            }

            "deleteInBackground" => {
                let args = parse_args(args)?;
                if codec::class_name_of(&args).is_none() || string_arg(&args, KEY_OBJECT_ID).is_none() {
                    return Err(AppError::invalid_json("no className or objectId found"));
                }
                let object = self.object_from_args(&args).await?;
                self.delete(&object).await?;
                Ok(Value::Null)
            }

            "deleteEventually" => {
                let args = parse_args(args)?;
                let identified = string_arg(&args, KEY_OBJECT_ID).is_some() || args.contains_key(KEY_LOCAL_ID);
                if codec::class_name_of(&args).is_none() || !identified {
                    return Err(AppError::invalid_json("no className or objectId found"));
                }
                let object = self.object_from_args(&args).await?;
                let ack = self.delete_eventually(&object).await?;
                Ok(render_ack(&ack, object.handle()))
            }

            "fetchInBackground" => {
                let args = parse_args(args)?;
                if string_arg(&args, KEY_OBJECT_ID).is_none() {
                    return Err(AppError::invalid_json("no className or objectId found"));
                }
                let object = self.object_from_args(&args).await?;
                render_object(&self.fetch(object).await?)
            }

            "queryInBackground" => {
                let args = parse_args(args)?;
                let class_name =
                    codec::class_name_of(&args).ok_or_else(|| AppError::invalid_json("no className found"))?;
                let request = QueryRequest::from_args(class_name, &args);
                match self.query(&request).await? {
                    QueryOutput::Count(count) => Ok(json!(count)),
                    QueryOutput::Objects(objects) => objects
                        .iter()
                        .map(render_object)
                        .collect::<Result<Vec<_>>>()
                        .map(Value::Array),
                }
            }

            "configGetCurrent" => Ok(self.current_config().await.map(Value::Object).unwrap_or(Value::Null)),

            "configFetchInBackground" => Ok(Value::Object(self.fetch_config().await?)),

            "pendingEventually" => Ok(Value::Array(
                self.pending().await.iter().map(render_pending).collect(),
            )),

            "connectivityRestored" => Ok(json!({ "woken": self.connectivity_restored().await })),

            other => Err(AppError::NotImplemented(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_may_be_a_json_string() {
        let args = parse_args(Value::String(r#"{"className":"GameScore"}"#.into())).unwrap();
        assert_eq!(args["className"], json!("GameScore"));
    }

    #[test]
    fn other_args_are_rejected() {
        for args in [json!(42), json!([1, 2]), Value::Null, json!("not json")] {
            let err = parse_args(args).unwrap_err();
            assert_eq!(err.code(), codes::INVALID_JSON);
            assert_eq!(err.body().message, "invalid parse object");
        }
    }

    #[test]
    fn collapsed_ack_lists_dropped_commands() {
        let handle = LocalHandle::from_raw(9);
        let value = render_ack(&EnqueueAck::Collapsed { dropped: vec![3, 4] }, handle);
        assert_eq!(
            value,
            json!({"status": "collapsed", "commandId": null, "dropped": [3, 4], "localId": 9})
        );
    }

    #[test]
    fn user_value_hides_password() {
        let user = json!({"username": "cooldude6", "password": "secret"});
        let value = user_value(user.as_object().cloned().unwrap());
        assert_eq!(value, json!({"username": "cooldude6", "className": "_User"}));
    }
}
