//! Inbound frame dispatch
//!
//! Classifies each frame, enforces the initialization gate, routes by
//! method, and correlates responses with pending outbound slots. Every
//! request or notification runs on its own task; only classification
//! happens on the transport's read path.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::context::RequestContext;
use crate::errors::ServerError;
use crate::protocol::types::{
    CallToolParams, GetPromptParams, InitializeParams, InitializeResult, ListPromptsResult,
    ListResourceTemplatesResult, ListResourcesResult, ListToolsResult, ReadResourceParams,
    SubscribeParams,
};
use crate::protocol::{self, Message, RequestId, RpcError};
use crate::session::SessionState;

use super::ServerCore;

/// Methods a session may use before `notifications/initialized` lands.
fn allowed_before_initialized(method: &str) -> bool {
    matches!(method, "initialize" | "ping" | "notifications/initialized")
}

impl ServerCore {
    /// Entry point for every inbound frame, called on the transport's read
    /// path. A returned error means the frame was dropped without a reply.
    pub(crate) fn receive(
        self: &Arc<Self>,
        session_id: &str,
        frame: &[u8],
    ) -> Result<(), ServerError> {
        let value: Value =
            serde_json::from_slice(frame).map_err(|err| ServerError::Parse(err.to_string()))?;
        let recovered_id = value.get("id").and_then(RequestId::from_value);

        let message = match Message::from_value(&value) {
            Ok(message) => message,
            Err(err) => {
                let error = ServerError::InvalidRequest(err.to_string());
                // Reply when the envelope at least carries a usable id;
                // otherwise there is nothing to correlate the error with.
                return match recovered_id {
                    Some(id) => {
                        self.send_reply(
                            session_id,
                            protocol::error_envelope(Some(&id), &error.to_rpc_error()),
                        );
                        Ok(())
                    }
                    None => Err(error),
                };
            }
        };

        let session = self.sessions.open(session_id);
        session.touch();

        match message {
            Message::Response { id, result, error } => {
                self.deliver_response(&session, id, result, error);
                Ok(())
            }
            Message::Request { id, method, params } => {
                if self.in_shutdown() {
                    self.send_reply(
                        session_id,
                        protocol::error_envelope(
                            Some(&id),
                            &ServerError::ServerClosed.to_rpc_error(),
                        ),
                    );
                    return Ok(());
                }
                if !session.is_initialized() && !allowed_before_initialized(&method) {
                    self.send_reply(
                        session_id,
                        protocol::error_envelope(
                            Some(&id),
                            &ServerError::NotInitialized.to_rpc_error(),
                        ),
                    );
                    return Ok(());
                }

                let core = self.clone();
                let guard = self.inflight_guard();
                tokio::spawn(async move {
                    let _guard = guard;
                    let reply = core.handle_request(&session, &id, &method, params).await;
                    core.send_reply(session.id(), reply);
                });
                Ok(())
            }
            Message::Notification { method, params } => {
                if !session.is_initialized() && !allowed_before_initialized(&method) {
                    debug!(
                        session_id,
                        method = %method,
                        "notification before initialization dropped"
                    );
                    return Ok(());
                }

                // Best-effort even while draining.
                let core = self.clone();
                let guard = self.inflight_guard();
                tokio::spawn(async move {
                    let _guard = guard;
                    if let Err(err) = core.handle_notification(&session, &method, params).await {
                        warn!(
                            session_id = %session.id(),
                            method = %method,
                            error = %err,
                            "notification handler failed"
                        );
                    }
                });
                Ok(())
            }
        }
    }

    pub(crate) fn send_reply(&self, session_id: &str, envelope: Value) {
        if let Err(err) = self.transport.send(session_id, envelope.to_string()) {
            warn!(session_id, error = %err, "outbound frame dropped");
        }
    }

    /// Routes a response to the pending slot that issued its id. Unknown or
    /// non-numeric ids are dropped without erroring the session.
    fn deliver_response(
        &self,
        session: &Arc<SessionState>,
        id: RequestId,
        result: Option<Value>,
        error: Option<RpcError>,
    ) {
        let id = match id {
            RequestId::Number(id) => id,
            RequestId::String(other) => {
                debug!(session_id = %session.id(), id = %other, "response with non-numeric id dropped");
                return;
            }
        };
        match session.take_pending(id) {
            Some(slot) => {
                let outcome = match error {
                    Some(error) => Err(error),
                    None => Ok(result.unwrap_or(Value::Null)),
                };
                if slot.send(outcome).is_err() {
                    debug!(session_id = %session.id(), id, "reply slot abandoned before delivery");
                }
            }
            None => debug!(session_id = %session.id(), id, "response with unknown id dropped"),
        }
    }

    async fn handle_request(
        self: &Arc<Self>,
        session: &Arc<SessionState>,
        id: &RequestId,
        method: &str,
        params: Option<Value>,
    ) -> Value {
        match self.route_request(session, method, params).await {
            Ok(result) => protocol::result_envelope(id, result),
            Err(err) => {
                debug!(
                    session_id = %session.id(),
                    method,
                    error = %err,
                    "request failed"
                );
                protocol::error_envelope(Some(id), &err.to_rpc_error())
            }
        }
    }

    async fn route_request(
        self: &Arc<Self>,
        session: &Arc<SessionState>,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, ServerError> {
        let ctx = RequestContext::new(session.id());
        match method {
            "initialize" => self.handle_initialize(session, params),
            "ping" => Ok(json!({})),
            "tools/list" => to_result(ListToolsResult {
                tools: self.registry.list_tools(),
                next_cursor: None,
            }),
            "tools/call" => {
                let params: CallToolParams = parse_params(params)?;
                let handler = self.registry.get_tool(&params.name).ok_or_else(|| {
                    ServerError::invalid_params(format!("unknown tool: {}", params.name))
                })?;
                to_result(recovering(handler.call(ctx, params)).await?)
            }
            "prompts/list" => to_result(ListPromptsResult {
                prompts: self.registry.list_prompts(),
                next_cursor: None,
            }),
            "prompts/get" => {
                let params: GetPromptParams = parse_params(params)?;
                let handler = self.registry.get_prompt(&params.name).ok_or_else(|| {
                    ServerError::invalid_params(format!("unknown prompt: {}", params.name))
                })?;
                to_result(recovering(handler.get(ctx, params)).await?)
            }
            "resources/list" => to_result(ListResourcesResult {
                resources: self.registry.list_resources(),
                next_cursor: None,
            }),
            "resources/templates/list" => to_result(ListResourceTemplatesResult {
                resource_templates: self.registry.list_resource_templates(),
                next_cursor: None,
            }),
            "resources/read" => {
                let params: ReadResourceParams = parse_params(params)?;
                let handler = self
                    .registry
                    .resolve_resource(&params.uri)
                    .ok_or_else(|| ServerError::ResourceNotFound(params.uri.clone()))?;
                to_result(recovering(handler.read(ctx, params)).await?)
            }
            "resources/subscribe" => {
                let params: SubscribeParams = parse_params(params)?;
                session.subscribe(&params.uri);
                Ok(json!({}))
            }
            "resources/unsubscribe" => {
                let params: SubscribeParams = parse_params(params)?;
                session.unsubscribe(&params.uri);
                Ok(json!({}))
            }
            other => Err(ServerError::MethodNotFound(other.to_string())),
        }
    }

    fn handle_initialize(
        &self,
        session: &Arc<SessionState>,
        params: Option<Value>,
    ) -> Result<Value, ServerError> {
        let params: InitializeParams = parse_params(params)?;
        let version = protocol::negotiate_protocol_version(&params.protocol_version);
        debug!(
            session_id = %session.id(),
            client = %params.client_info.name,
            offered = %params.protocol_version,
            negotiated = version,
            "initialize handshake"
        );
        session.record_handshake(params.client_info, params.capabilities);

        to_result(InitializeResult {
            protocol_version: version.to_string(),
            capabilities: self.capabilities.clone(),
            server_info: self.server_info.clone(),
            instructions: self.instructions.clone(),
        })
    }

    async fn handle_notification(
        &self,
        session: &Arc<SessionState>,
        method: &str,
        _params: Option<Value>,
    ) -> Result<(), ServerError> {
        match method {
            "notifications/initialized" => {
                session.mark_initialized();
                debug!(session_id = %session.id(), "session initialized");
            }
            other => {
                debug!(session_id = %session.id(), method = %other, "notification ignored");
            }
        }
        Ok(())
    }
}

fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T, ServerError> {
    serde_json::from_value(params.unwrap_or(Value::Null))
        .map_err(|err| ServerError::invalid_params(err.to_string()))
}

fn to_result<T: Serialize>(value: T) -> Result<Value, ServerError> {
    serde_json::to_value(value).map_err(|err| ServerError::internal(err.to_string()))
}

/// Awaits a handler future, converting a panic into `InternalError` instead
/// of taking the dispatch task down with it.
async fn recovering<T>(
    fut: impl std::future::Future<Output = Result<T, ServerError>>,
) -> Result<T, ServerError> {
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .copied()
                .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
                .unwrap_or("opaque panic payload");
            warn!(panic = message, "handler panicked");
            Err(ServerError::internal(format!("handler panicked: {message}")))
        }
    }
}
