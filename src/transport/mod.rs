//! Transport abstraction: session-aware byte channels feeding the dispatcher
//!
//! A transport frames bytes on the wire, owns the mapping from connections
//! to session ids, and hands every inbound frame to the receiver callback
//! installed at construction. Sends are non-blocking enqueues; a dedicated
//! per-session writer drains them, so no caller ever blocks on a slow peer.

pub mod sse;
pub mod stdio;

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::errors::{ServerError, TransportError};
use crate::session::SessionManager;

/// Callback invoked for every inbound frame. A returned error means the
/// frame was dropped; the transport logs it and keeps running.
pub type FrameReceiver = Arc<dyn Fn(&str, &[u8]) -> Result<(), ServerError> + Send + Sync>;

/// Receiver and session table handed to a transport when the server is
/// built. Transports only borrow the ability to create, look up, and close
/// sessions; the table itself is owned above them.
#[derive(Clone)]
pub struct Wiring {
    pub receiver: FrameReceiver,
    pub sessions: Arc<SessionManager>,
}

#[async_trait]
pub trait ServerTransport: Send + Sync + 'static {
    /// Installs the inbound callback and session table. Called exactly once,
    /// by `Server` construction, before `run`.
    fn bind(&self, wiring: Wiring);

    /// Serves the wire until EOF, a fatal error, or shutdown.
    async fn run(&self) -> Result<(), TransportError>;

    /// Enqueues one outbound frame for a session without blocking. Fails
    /// with `UnknownSession` when no such session exists.
    fn send(&self, session_id: &str, frame: String) -> Result<(), TransportError>;

    /// Waits for whichever side finishes first: `drained` (the server has
    /// no more in-flight work; release I/O and report success) or `user`
    /// (the caller gave up; report cancellation).
    async fn shutdown(
        &self,
        user: CancellationToken,
        drained: CancellationToken,
    ) -> Result<(), TransportError>;
}
