//! HTTP + Server-Sent-Events transport
//!
//! Each connected client gets a freshly assigned session token. The SSE
//! stream is the server→client lane; its first event tells the client
//! where to POST, and every later `message` event carries one JSON-RPC
//! envelope. The POST endpoint is the client→server lane.
//!
//! The transport can own its listener (`bound`) or stay `unbound` and hand
//! the host two plain axum routes; no global routing state is touched
//! either way.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use parking_lot::RwLock;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::TransportError;
use crate::transport::{ServerTransport, Wiring};

#[derive(Debug, Clone)]
pub struct SseOptions {
    pub sse_path: String,
    pub message_path: String,
    pub keep_alive: Duration,
}

impl Default for SseOptions {
    fn default() -> Self {
        Self {
            sse_path: "/sse".to_string(),
            message_path: "/message".to_string(),
            keep_alive: Duration::from_secs(15),
        }
    }
}

pub struct SseTransport {
    options: SseOptions,
    bind_addr: Option<SocketAddr>,
    wiring: RwLock<Option<Wiring>>,
    channels: RwLock<HashMap<String, mpsc::UnboundedSender<String>>>,
    closed: CancellationToken,
    // Lets `run` hand the handlers a shared reference to this instance.
    weak: Weak<SseTransport>,
}

impl SseTransport {
    /// A transport that owns its listener and serves its own router.
    pub fn bound(addr: SocketAddr, options: SseOptions) -> Arc<Self> {
        Self::build(Some(addr), options)
    }

    /// A transport without a listener. The host mounts [`SseTransport::router`]
    /// (or nests it) into its own HTTP stack.
    pub fn unbound(options: SseOptions) -> Arc<Self> {
        Self::build(None, options)
    }

    fn build(bind_addr: Option<SocketAddr>, options: SseOptions) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            options,
            bind_addr,
            wiring: RwLock::new(None),
            channels: RwLock::new(HashMap::new()),
            closed: CancellationToken::new(),
            weak: weak.clone(),
        })
    }

    /// The two protocol routes as a plain axum router, free of any global
    /// multiplexer state.
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route(&self.options.sse_path, get(handle_sse))
            .route(&self.options.message_path, post(handle_message))
            .with_state(self.clone())
    }

    pub fn session_count(&self) -> usize {
        self.channels.read().len()
    }

    fn open_session(self: &Arc<Self>, wiring: &Wiring) -> (String, mpsc::UnboundedReceiver<String>) {
        let session_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels.write().insert(session_id.clone(), tx);
        wiring.sessions.open(&session_id);
        info!(session_id = %session_id, "sse session connected");
        (session_id, rx)
    }

    fn drop_session(&self, session_id: &str) {
        self.channels.write().remove(session_id);
        if let Some(wiring) = self.wiring.read().as_ref() {
            wiring.sessions.close(session_id);
        }
        info!(session_id = %session_id, "sse session disconnected");
    }
}

#[async_trait]
impl ServerTransport for SseTransport {
    fn bind(&self, wiring: Wiring) {
        *self.wiring.write() = Some(wiring);
    }

    async fn run(&self) -> Result<(), TransportError> {
        let wiring = self.wiring.read().clone().ok_or(TransportError::NotBound)?;

        if let Some(addr) = self.bind_addr {
            let this = self.weak.upgrade().ok_or(TransportError::NotRunning)?;
            let listener = tokio::net::TcpListener::bind(addr).await?;
            info!(addr = %addr, "sse transport listening");
            axum::serve(listener, this.router())
                .with_graceful_shutdown(self.closed.clone().cancelled_owned())
                .await?;
        } else {
            self.closed.cancelled().await;
        }

        let drained: Vec<String> = self.channels.write().drain().map(|(id, _)| id).collect();
        for session_id in drained {
            wiring.sessions.close(&session_id);
        }
        Ok(())
    }

    fn send(&self, session_id: &str, frame: String) -> Result<(), TransportError> {
        let channels = self.channels.read();
        let tx = channels
            .get(session_id)
            .ok_or_else(|| TransportError::UnknownSession(session_id.to_string()))?;
        tx.send(frame)
            .map_err(|_| TransportError::ChannelClosed(session_id.to_string()))
    }

    async fn shutdown(
        &self,
        user: CancellationToken,
        drained: CancellationToken,
    ) -> Result<(), TransportError> {
        tokio::select! {
            _ = drained.cancelled() => {
                self.closed.cancel();
                // Dropping the senders ends every event stream, which lets
                // the HTTP layer finish its connections.
                self.channels.write().clear();
                Ok(())
            }
            _ = user.cancelled() => Err(TransportError::ShutdownCancelled),
        }
    }
}

#[derive(Debug, Deserialize)]
struct MessageQuery {
    #[serde(rename = "sessionID")]
    session_id: Option<String>,
}

/// Ends the session when the client's event stream goes away.
struct StreamGuard {
    transport: Arc<SseTransport>,
    session_id: String,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.transport.drop_session(&self.session_id);
    }
}

async fn handle_sse(State(transport): State<Arc<SseTransport>>) -> Response {
    let Some(wiring) = transport.wiring.read().clone() else {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };

    let (session_id, mut rx) = transport.open_session(&wiring);
    let endpoint = format!(
        "{}?sessionID={}",
        transport.options.message_path, session_id
    );
    let keep_alive = KeepAlive::new().interval(transport.options.keep_alive);

    let guard = StreamGuard {
        transport,
        session_id,
    };
    let stream = async_stream::stream! {
        let _guard = guard;
        yield Ok::<_, std::convert::Infallible>(
            Event::default().event("endpoint").data(endpoint),
        );
        while let Some(frame) = rx.recv().await {
            yield Ok(Event::default().event("message").data(frame));
        }
    };

    Sse::new(stream).keep_alive(keep_alive).into_response()
}

async fn handle_message(
    State(transport): State<Arc<SseTransport>>,
    Query(query): Query<MessageQuery>,
    body: Bytes,
) -> Response {
    let Some(wiring) = transport.wiring.read().clone() else {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };

    let Some(session_id) = query
        .session_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
    else {
        return (StatusCode::BAD_REQUEST, "missing sessionID").into_response();
    };

    if !transport.channels.read().contains_key(session_id) {
        return (StatusCode::BAD_REQUEST, "unknown session").into_response();
    }

    debug!(session_id = %session_id, bytes = body.len(), "message received");
    if let Err(err) = (wiring.receiver)(session_id, &body) {
        warn!(session_id = %session_id, error = %err, "inbound frame dropped");
        return (StatusCode::BAD_REQUEST, err.to_string()).into_response();
    }

    StatusCode::ACCEPTED.into_response()
}
