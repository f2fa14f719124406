//! Command Executor: runs commands and synchronous requests against the
//! backend.
//!
//! Every network attempt is bounded by the request timeout, and an expired
//! attempt is a retryable failure.

use crate::backend::{Backend, BackendResult, QueryRequest, QueryResponse};
use crate::error::Result;
use crate::identities::Identities;
use crate::session::Session;
use parcel_engine::codec::{self, EncodeContext};
use parcel_engine::outcome::classify;
use parcel_engine::{
    BackendError, BackendObject, Command, CommandKind, Error as EngineError, FieldName, FieldValue,
    Mapping, Outcome, RemoteId, ServerFields,
};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// What a query produced.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutput {
    Objects(Vec<BackendObject>),
    Count(i64),
}

pub struct CommandExecutor {
    backend: Arc<dyn Backend>,
    identities: Arc<Identities>,
    session: Arc<Session>,
    timeout: Duration,
}

fn engine_failure(err: EngineError) -> BackendError {
    BackendError::new(err.code(), err.to_string())
}

impl CommandExecutor {
    pub fn new(
        backend: Arc<dyn Backend>,
        identities: Arc<Identities>,
        session: Arc<Session>,
        timeout: Duration,
    ) -> Self {
        Self {
            backend,
            identities,
            session,
            timeout,
        }
    }

    /// Run one backend call under the request timeout.
    async fn timed<T>(&self, call: impl Future<Output = BackendResult<T>>) -> BackendResult<T> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::timeout(format!(
                "no response within {} ms",
                self.timeout.as_millis()
            ))),
        }
    }

    /// Remote id to address: the one captured with the command, else the one
    /// the registry learned since. A save that committed just before a crash
    /// therefore replays as an update, never as a second create.
    async fn effective_remote_id(&self, command: &Command) -> Option<RemoteId> {
        match &command.remote_id {
            Some(id) => Some(id.clone()),
            None => self.identities.resolve(command.target).await,
        }
    }

    /// Execute a queued command.
    pub async fn execute(&self, command: &Command) -> Outcome {
        let remote_id = self.effective_remote_id(command).await;
        match command.kind {
            CommandKind::Save => self.execute_save(command, remote_id).await,
            CommandKind::Delete => self.execute_delete(command, remote_id).await,
        }
    }

    async fn execute_save(&self, command: &Command, remote_id: Option<RemoteId>) -> Outcome {
        let mut fields = command.fields.clone().unwrap_or_default();
        self.identities.resolve_references(&mut fields).await;
        let body = match codec::encode_fields(&fields, EncodeContext::Durable) {
            Ok(body) => body,
            Err(err) => return Outcome::TerminalFailure(engine_failure(err)),
        };

        let session = self.session.session_token().await;
        let result = self
            .timed(self.backend.save(
                &command.class_name,
                remote_id.as_deref(),
                body,
                session.as_deref(),
            ))
            .await
            .and_then(|response| ServerFields::from_response(&response).map_err(engine_failure));

        match classify(CommandKind::Save, result) {
            Outcome::Success(mut server) => {
                if server.remote_id.is_none() {
                    server.remote_id = remote_id;
                }
                let saved = command.field_names();
                match self
                    .identities
                    .confirm_save(command.target, &command.class_name, server.remote_id.as_ref(), &saved)
                    .await
                {
                    Ok(()) => {}
                    Err(crate::error::AppError::Engine(err)) => {
                        return Outcome::TerminalFailure(engine_failure(err));
                    }
                    Err(err) => {
                        // The backend has the write. The queue still learns the
                        // remote id from the outcome and records it with the
                        // completion.
                        tracing::error!(
                            command_id = command.id,
                            handle = %command.target,
                            error = %err,
                            "Failed to persist confirmed identity"
                        );
                    }
                }
                if command.class_name == "_User" {
                    self.refresh_user(&server, &fields).await;
                }
                Outcome::Success(server)
            }
            other => other,
        }
    }

    async fn execute_delete(&self, command: &Command, remote_id: Option<RemoteId>) -> Outcome {
        // Never reached the backend, nothing to delete.
        let Some(remote_id) = remote_id else {
            return Outcome::Success(ServerFields::default());
        };
        let session = self.session.session_token().await;
        let result = self
            .timed(
                self.backend
                    .delete(&command.class_name, &remote_id, session.as_deref()),
            )
            .await
            .map(|()| ServerFields::default());
        classify(CommandKind::Delete, result)
    }

    /// Keep the stored current user in step with a saved `_User`.
    async fn refresh_user(&self, server: &ServerFields, fields: &BTreeMap<FieldName, FieldValue>) {
        let Some(remote_id) = &server.remote_id else {
            return;
        };
        let mut object = BackendObject::without_data("_User", remote_id.clone());
        for (name, value) in fields.iter().chain(server.fields.iter()) {
            object.set(name.clone(), value.clone());
        }
        let Ok(mapping) = codec::encode(&object, EncodeContext::Immediate) else {
            return;
        };
        if let Err(err) = self.session.refresh_current_user(&mapping).await {
            tracing::warn!(error = %err, "Failed to refresh current user");
        }
    }

    /// Save one object now, its own remote id resolved through the registry.
    async fn save_one(&self, object: &BackendObject, session: Option<&str>) -> Result<ServerFields> {
        let mut object = object.clone();
        self.identities.resolve_nested(&mut object).await;

        let saved: Vec<FieldName> = object.dirty_fields().iter().cloned().collect();
        let body = codec::encode_fields(&object.dirty_snapshot(), EncodeContext::Durable)?;
        let remote_id = object.remote_id().cloned();

        let response = self
            .timed(
                self.backend
                    .save(object.class_name(), remote_id.as_deref(), body, session),
            )
            .await?;
        let mut server = ServerFields::from_response(&response)?;
        if server.remote_id.is_none() {
            server.remote_id = remote_id;
        }

        self.identities
            .confirm_save(object.handle(), object.class_name(), server.remote_id.as_ref(), &saved)
            .await?;
        tracing::debug!(
            class_name = object.class_name(),
            handle = %object.handle(),
            "Saved object"
        );
        Ok(server)
    }

    /// Save an object and every unsaved object it references, children first.
    pub async fn save_now(&self, object: &mut BackendObject) -> Result<()> {
        self.identities.resolve_nested(object).await;
        let order: Vec<BackendObject> = {
            let registry = self.identities.read().await;
            registry
                .save_order(object)?
                .into_iter()
                .cloned()
                .collect()
        };
        let session = self.session.session_token().await;

        let Some((_, children)) = order.split_last() else {
            return Ok(());
        };
        for child in children {
            self.save_one(child, session.as_deref()).await?;
        }

        self.identities.resolve_nested(object).await;
        let saved: Vec<FieldName> = object.dirty_fields().iter().cloned().collect();
        let server = self.save_one(object, session.as_deref()).await?;
        object.apply_server_fields(&server, &saved)?;
        self.identities.resolve_nested(object).await;

        if object.class_name() == "_User" {
            let mapping = codec::encode(object, EncodeContext::Immediate)?;
            self.session.refresh_current_user(&mapping).await?;
        }
        Ok(())
    }

    /// Delete an object now.
    pub async fn delete_now(&self, object: &BackendObject) -> Result<()> {
        let remote_id = match object.remote_id().cloned() {
            Some(id) => id,
            None => self
                .identities
                .resolve(object.handle())
                .await
                .ok_or_else(|| EngineError::Schema("no className or objectId found".into()))?,
        };
        let session = self.session.session_token().await;
        let result = self
            .timed(
                self.backend
                    .delete(object.class_name(), &remote_id, session.as_deref()),
            )
            .await;
        match classify(CommandKind::Delete, result.map(|()| ServerFields::default())) {
            Outcome::Success(_) => {}
            Outcome::RetryableFailure(err) | Outcome::TerminalFailure(err) => return Err(err.into()),
        }
        self.identities.forget(object.handle()).await?;
        Ok(())
    }

    /// Refresh an object from the backend. Server values replace local ones.
    pub async fn fetch(&self, object: &mut BackendObject) -> Result<()> {
        let remote_id = object
            .remote_id()
            .cloned()
            .ok_or_else(|| EngineError::Schema("no objectId found".into()))?;
        let session = self.session.session_token().await;
        let response = self
            .timed(
                self.backend
                    .fetch(object.class_name(), &remote_id, session.as_deref()),
            )
            .await?;

        let server = ServerFields::from_response(&response)?;
        let names: Vec<FieldName> = server.fields.keys().cloned().collect();
        object.apply_server_fields(&server, &names)?;
        let registry = self.identities.read().await;
        registry.adopt(object);
        Ok(())
    }

    /// Run a query. Results are decoded as objects of the queried class.
    pub async fn query(&self, request: &QueryRequest) -> Result<QueryOutput> {
        let session = self.session.session_token().await;
        let response = self
            .timed(self.backend.query(request, session.as_deref()))
            .await?;
        match response {
            QueryResponse::Count(count) => Ok(QueryOutput::Count(count)),
            QueryResponse::Results(results) => {
                let registry = self.identities.read().await;
                let objects = results
                    .iter()
                    .map(|mapping| {
                        let mut object = codec::decode(mapping, Some(&request.class_name))?;
                        registry.adopt(&mut object);
                        Ok(object)
                    })
                    .collect::<std::result::Result<Vec<_>, EngineError>>()?;
                Ok(QueryOutput::Objects(objects))
            }
        }
    }

    pub async fn log_in(&self, username: &str, password: &str) -> Result<Mapping> {
        Ok(self.timed(self.backend.log_in(username, password)).await?)
    }

    pub async fn sign_up(&self, user: Mapping) -> Result<Mapping> {
        Ok(self.timed(self.backend.sign_up(user)).await?)
    }

    pub async fn log_out(&self, session: &str) -> Result<()> {
        Ok(self.timed(self.backend.log_out(session)).await?)
    }

    pub async fn fetch_config(&self) -> Result<Mapping> {
        let session = self.session.session_token().await;
        Ok(self
            .timed(self.backend.fetch_config(session.as_deref()))
            .await?)
    }
}
