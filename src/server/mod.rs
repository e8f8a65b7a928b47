//! The central Model Context Protocol server runtime
//!
//! Owns the session table and registries, drives the transport, broadcasts
//! list-change notifications, correlates server-initiated requests with
//! their replies, and drains in-flight work on shutdown.

mod dispatch;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::errors::{ServerError, TransportError};
use crate::protocol::types::{
    Implementation, Prompt, Resource, ResourceTemplate, ServerCapabilities, Tool,
};
use crate::protocol::{self, RequestId};
use crate::registry::{PromptHandler, Registry, ResourceHandler, ToolHandler};
use crate::session::{SessionManager, SessionState};
use crate::transport::{ServerTransport, Wiring};

/// Cadence of the liveness probe over all sessions.
pub const PING_INTERVAL: Duration = Duration::from_secs(60);
/// Deadline for one liveness ping.
pub const PING_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ServerBuilder {
    transport: Arc<dyn ServerTransport>,
    capabilities: ServerCapabilities,
    server_info: Implementation,
    instructions: Option<String>,
}

impl ServerBuilder {
    /// Overrides the capability set advertised in the `initialize` reply.
    pub fn capabilities(mut self, capabilities: ServerCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn server_info(mut self, server_info: Implementation) -> Self {
        self.server_info = server_info;
        self
    }

    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn build(self) -> Server {
        let (in_flight, _) = watch::channel(0usize);
        let core = Arc::new(ServerCore {
            transport: self.transport,
            sessions: Arc::new(SessionManager::new()),
            registry: Registry::new(),
            capabilities: self.capabilities,
            server_info: self.server_info,
            instructions: self.instructions,
            in_shutdown: AtomicBool::new(false),
            in_flight,
        });

        // The transport holds the dispatcher weakly; the server owns the
        // transport, never the other way around.
        let weak = Arc::downgrade(&core);
        let wiring = Wiring {
            receiver: Arc::new(move |session_id, frame| match weak.upgrade() {
                Some(core) => core.receive(session_id, frame),
                None => Err(ServerError::ServerClosed),
            }),
            sessions: core.sessions.clone(),
        };
        core.transport.bind(wiring);

        Server { core }
    }
}

/// Handle to the runtime. Clones share one underlying server.
#[derive(Clone)]
pub struct Server {
    core: Arc<ServerCore>,
}

pub(crate) struct ServerCore {
    pub(crate) transport: Arc<dyn ServerTransport>,
    pub(crate) sessions: Arc<SessionManager>,
    pub(crate) registry: Registry,
    pub(crate) capabilities: ServerCapabilities,
    pub(crate) server_info: Implementation,
    pub(crate) instructions: Option<String>,
    in_shutdown: AtomicBool,
    in_flight: watch::Sender<usize>,
}

impl Server {
    pub fn builder(transport: Arc<dyn ServerTransport>) -> ServerBuilder {
        ServerBuilder {
            transport,
            capabilities: ServerCapabilities::standard(),
            server_info: Implementation {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            instructions: None,
        }
    }

    pub fn new(transport: Arc<dyn ServerTransport>) -> Self {
        Self::builder(transport).build()
    }

    pub fn register_tool(&self, tool: Tool, handler: Arc<dyn ToolHandler>) {
        self.core.registry.register_tool(tool, handler);
        self.core
            .broadcast_list_changed(protocol::NOTIFICATION_TOOLS_LIST_CHANGED);
    }

    pub fn unregister_tool(&self, name: &str) {
        if self.core.registry.unregister_tool(name) {
            self.core
                .broadcast_list_changed(protocol::NOTIFICATION_TOOLS_LIST_CHANGED);
        }
    }

    pub fn register_prompt(&self, prompt: Prompt, handler: Arc<dyn PromptHandler>) {
        self.core.registry.register_prompt(prompt, handler);
        self.core
            .broadcast_list_changed(protocol::NOTIFICATION_PROMPTS_LIST_CHANGED);
    }

    pub fn unregister_prompt(&self, name: &str) {
        if self.core.registry.unregister_prompt(name) {
            self.core
                .broadcast_list_changed(protocol::NOTIFICATION_PROMPTS_LIST_CHANGED);
        }
    }

    pub fn register_resource(&self, resource: Resource, handler: Arc<dyn ResourceHandler>) {
        self.core.registry.register_resource(resource, handler);
        self.core
            .broadcast_list_changed(protocol::NOTIFICATION_RESOURCES_LIST_CHANGED);
    }

    pub fn unregister_resource(&self, uri: &str) {
        if self.core.registry.unregister_resource(uri) {
            self.core
                .broadcast_list_changed(protocol::NOTIFICATION_RESOURCES_LIST_CHANGED);
        }
    }

    /// Validates the template synchronously; a stored entry makes the call
    /// successful even if the follow-up broadcast cannot be delivered.
    pub fn register_resource_template(
        &self,
        template: ResourceTemplate,
        handler: Arc<dyn ResourceHandler>,
    ) -> Result<(), ServerError> {
        self.core
            .registry
            .register_resource_template(template, handler)?;
        self.core
            .broadcast_list_changed(protocol::NOTIFICATION_RESOURCES_LIST_CHANGED);
        Ok(())
    }

    pub fn unregister_resource_template(&self, uri_template: &str) {
        if self.core.registry.unregister_resource_template(uri_template) {
            self.core
                .broadcast_list_changed(protocol::NOTIFICATION_RESOURCES_LIST_CHANGED);
        }
    }

    /// Tells every session subscribed to `uri` that the resource changed.
    pub fn notify_resource_updated(&self, uri: &str) {
        self.core.notify_resource_updated(uri);
    }

    /// Issues a server-initiated request on a session and waits for the
    /// matching response. Ids are allocated monotonically per session and
    /// never reused. Dropping the returned future releases the reply slot.
    pub async fn call(
        &self,
        session_id: &str,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, ServerError> {
        self.core.call(session_id, method, params, timeout).await
    }

    pub async fn ping(&self, session_id: &str) -> Result<(), ServerError> {
        self.core.ping(session_id).await
    }

    /// Serves until the transport terminates. A liveness probe ticks once a
    /// minute and reaps sessions the transport no longer knows.
    pub async fn run(&self) -> Result<(), ServerError> {
        let transport = self.core.transport.clone();
        let mut transport_task = tokio::spawn(async move { transport.run().await });

        let start = tokio::time::Instant::now() + PING_INTERVAL;
        let mut ticker = tokio::time::interval_at(start, PING_INTERVAL);

        loop {
            tokio::select! {
                joined = &mut transport_task => {
                    return match joined {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(err)) => Err(err.into()),
                        Err(err) => Err(ServerError::internal(format!(
                            "transport task failed: {err}"
                        ))),
                    };
                }
                _ = ticker.tick() => {
                    if self.core.in_shutdown() {
                        continue;
                    }
                    let core = self.core.clone();
                    tokio::spawn(async move { core.probe_sessions().await });
                }
            }
        }
    }

    /// Stops accepting requests, waits for in-flight work to drain, then
    /// lets the transport release its I/O. `user` bounds the wait: if it
    /// fires first the transport reports cancellation instead.
    pub async fn shutdown(&self, user: CancellationToken) -> Result<(), ServerError> {
        self.core.in_shutdown.store(true, Ordering::SeqCst);
        info!("server draining");

        let drained = CancellationToken::new();
        let mut in_flight = self.core.in_flight.subscribe();
        {
            let drained = drained.clone();
            tokio::spawn(async move {
                let _ = in_flight.wait_for(|count| *count == 0).await;
                drained.cancel();
            });
        }

        match self.core.transport.shutdown(user, drained).await {
            Ok(()) => {
                self.core.sessions.close_all();
                info!("server stopped");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

impl ServerCore {
    pub(crate) fn in_shutdown(&self) -> bool {
        self.in_shutdown.load(Ordering::SeqCst)
    }

    pub(crate) fn inflight_guard(self: &Arc<Self>) -> InFlightGuard {
        self.in_flight.send_modify(|count| *count += 1);
        InFlightGuard { core: self.clone() }
    }

    fn broadcast_list_changed(&self, method: &'static str) {
        if self.sessions.is_empty() {
            return;
        }
        let frame = protocol::notification_envelope(method, None).to_string();
        self.sessions.for_each(|session| {
            if !session.is_initialized() {
                return;
            }
            if let Err(err) = self.transport.send(session.id(), frame.clone()) {
                warn!(
                    session_id = %session.id(),
                    method,
                    error = %err,
                    "list-changed broadcast dropped"
                );
            }
        });
    }

    fn notify_resource_updated(&self, uri: &str) {
        let params = serde_json::json!({ "uri": uri });
        let frame =
            protocol::notification_envelope(protocol::NOTIFICATION_RESOURCE_UPDATED, Some(params))
                .to_string();
        self.sessions.for_each(|session| {
            if !session.is_subscribed(uri) {
                return;
            }
            if let Err(err) = self.transport.send(session.id(), frame.clone()) {
                warn!(
                    session_id = %session.id(),
                    uri,
                    error = %err,
                    "resource-updated notification dropped"
                );
            }
        });
    }

    pub(crate) async fn call(
        &self,
        session_id: &str,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, ServerError> {
        let session = self
            .sessions
            .get(session_id)
            .ok_or_else(|| ServerError::UnknownSession(session_id.to_string()))?;

        let id = session.next_outbound_id();
        let (tx, rx) = oneshot::channel();
        session.register_pending(id, tx);
        let _slot = PendingSlotGuard {
            session: session.clone(),
            id,
        };

        let frame =
            protocol::request_envelope(&RequestId::Number(id), method, params).to_string();
        self.transport
            .send(session_id, frame)
            .map_err(|err| match err {
                TransportError::UnknownSession(id) => ServerError::UnknownSession(id),
                other => ServerError::Transport(other),
            })?;

        match tokio::time::timeout(timeout, rx).await {
            Err(_) => Err(ServerError::Timeout),
            Ok(Err(_)) => Err(ServerError::SessionClosed),
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(error))) => Err(ServerError::Peer(error)),
        }
    }

    pub(crate) async fn ping(&self, session_id: &str) -> Result<(), ServerError> {
        self.call(session_id, "ping", None, PING_TIMEOUT)
            .await
            .map(|_| ())
    }

    async fn probe_sessions(&self) {
        let mut session_ids = Vec::new();
        self.sessions
            .for_each(|session| session_ids.push(session.id().to_string()));

        for session_id in session_ids {
            if self.in_shutdown() {
                return;
            }
            if let Err(err) = self.ping(&session_id).await {
                warn!(session_id = %session_id, error = %err, "liveness ping failed");
                if err.is_unknown_session() {
                    self.sessions.close(&session_id);
                }
            }
        }
    }
}

/// Keeps the drain counter honest no matter how a handler task ends.
pub(crate) struct InFlightGuard {
    core: Arc<ServerCore>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.core.in_flight.send_modify(|count| *count -= 1);
    }
}

/// Releases the pending reply slot if the caller stops waiting.
struct PendingSlotGuard {
    session: Arc<SessionState>,
    id: i64,
}

impl Drop for PendingSlotGuard {
    fn drop(&mut self) {
        self.session.take_pending(self.id);
    }
}
