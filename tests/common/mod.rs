//! In-memory transport for exercising the runtime end to end.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use coremcp::{ServerError, ServerTransport, SessionManager, TransportError, Wiring};

/// A transport whose wire is a map of in-process channels. Tests connect
/// sessions, inject inbound frames, and read outbound frames per session.
pub struct MockTransport {
    wiring: RwLock<Option<Wiring>>,
    outbound: Mutex<HashMap<String, mpsc::UnboundedSender<String>>>,
    closed: CancellationToken,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            wiring: RwLock::new(None),
            outbound: Mutex::new(HashMap::new()),
            closed: CancellationToken::new(),
        })
    }

    fn wiring(&self) -> Wiring {
        self.wiring
            .read()
            .clone()
            .expect("transport must be bound to a server")
    }

    pub fn sessions(&self) -> Arc<SessionManager> {
        self.wiring().sessions
    }

    /// Opens a session the way a real transport would on client connect,
    /// returning the client's view of the server→client lane.
    pub fn connect(&self, session_id: &str) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.outbound.lock().insert(session_id.to_string(), tx);
        self.wiring().sessions.open(session_id);
        rx
    }

    pub fn disconnect(&self, session_id: &str) {
        self.outbound.lock().remove(session_id);
        self.wiring().sessions.close(session_id);
    }

    /// Feeds one inbound frame to the dispatcher, exactly as the read loop
    /// of a real transport would.
    pub fn inject(&self, session_id: &str, frame: &str) -> Result<(), ServerError> {
        (self.wiring().receiver)(session_id, frame.as_bytes())
    }
}

#[async_trait]
impl ServerTransport for MockTransport {
    fn bind(&self, wiring: Wiring) {
        *self.wiring.write() = Some(wiring);
    }

    async fn run(&self) -> Result<(), TransportError> {
        self.closed.cancelled().await;
        Ok(())
    }

    fn send(&self, session_id: &str, frame: String) -> Result<(), TransportError> {
        let outbound = self.outbound.lock();
        let tx = outbound
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
                Ok(())
            }
            _ = user.cancelled() => Err(TransportError::ShutdownCancelled),
        }
    }
}

/// Reads the next outbound frame as JSON, failing the test after a second.
pub async fn recv_frame(rx: &mut mpsc::UnboundedReceiver<String>) -> Value {
    let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for an outbound frame")
        .expect("outbound lane closed");
    serde_json::from_str(&frame).expect("outbound frame is valid JSON")
}

/// Asserts that no frame arrives within the grace window.
pub async fn assert_silent(rx: &mut mpsc::UnboundedReceiver<String>) {
    let outcome = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
    assert!(outcome.is_err(), "expected silence, got: {outcome:?}");
}

/// Drives a session through `initialize` + `notifications/initialized`.
pub async fn handshake(
    transport: &MockTransport,
    session_id: &str,
    rx: &mut mpsc::UnboundedReceiver<String>,
) {
    transport
        .inject(
            session_id,
            &format!(
                r#"{{"jsonrpc":"2.0","id":"init-{session_id}","method":"initialize","params":{{"protocolVersion":"2024-11-05","capabilities":{{}},"clientInfo":{{"name":"test-client","version":"0"}}}}}}"#
            ),
        )
        .expect("initialize accepted");
    let reply = recv_frame(rx).await;
    assert!(reply.get("result").is_some(), "initialize failed: {reply}");

    transport
        .inject(
            session_id,
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
        )
        .expect("initialized accepted");

    // The flag flips on a spawned task; wait for it to land.
    let sessions = transport.sessions();
    tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            let initialized = sessions
                .get(session_id)
                .map(|session| session.is_initialized())
                .unwrap_or(false);
            if initialized {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("session should finish initialization");
}
