//! Per-session protocol state and the concurrent session table
//!
//! The table exclusively owns session records; transports only borrow the
//! ability to create, look up, and close them. Closing a session releases
//! every pending outbound reply slot it holds.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use crate::protocol::types::{ClientCapabilities, Implementation};
use crate::protocol::RpcError;

/// Reply slot for one server-initiated request. Dropping the sender tells
/// the waiting caller the session went away.
pub(crate) type ReplySlot = oneshot::Sender<Result<Value, RpcError>>;

/// State carried for one logical connection.
pub struct SessionState {
    id: String,
    initialized: AtomicBool,
    client_info: Mutex<Option<Implementation>>,
    client_capabilities: Mutex<Option<ClientCapabilities>>,
    subscriptions: Mutex<HashSet<String>>,
    pending: Mutex<HashMap<i64, ReplySlot>>,
    next_outbound_id: AtomicI64,
    last_activity: Mutex<Instant>,
}

impl SessionState {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            initialized: AtomicBool::new(false),
            client_info: Mutex::new(None),
            client_capabilities: Mutex::new(None),
            subscriptions: Mutex::new(HashSet::new()),
            pending: Mutex::new(HashMap::new()),
            next_outbound_id: AtomicI64::new(0),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Records the client's `initialize` payload. The session stays gated
    /// until `notifications/initialized` arrives.
    pub fn record_handshake(&self, info: Implementation, capabilities: ClientCapabilities) {
        *self.client_info.lock() = Some(info);
        *self.client_capabilities.lock() = Some(capabilities);
    }

    pub fn mark_initialized(&self) {
        self.initialized.store(true, Ordering::SeqCst);
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn client_info(&self) -> Option<Implementation> {
        self.client_info.lock().clone()
    }

    pub fn client_capabilities(&self) -> Option<ClientCapabilities> {
        self.client_capabilities.lock().clone()
    }

    pub fn subscribe(&self, uri: &str) {
        self.subscriptions.lock().insert(uri.to_string());
    }

    pub fn unsubscribe(&self, uri: &str) {
        self.subscriptions.lock().remove(uri);
    }

    pub fn is_subscribed(&self, uri: &str) -> bool {
        self.subscriptions.lock().contains(uri)
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    /// Allocates the next outbound request id. Ids start at 1 and are never
    /// reused within the session's lifetime.
    pub(crate) fn next_outbound_id(&self) -> i64 {
        self.next_outbound_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn register_pending(&self, id: i64, slot: ReplySlot) {
        self.pending.lock().insert(id, slot);
    }

    pub(crate) fn take_pending(&self, id: i64) -> Option<ReplySlot> {
        self.pending.lock().remove(&id)
    }

    fn release_pending(&self) {
        let slots = std::mem::take(&mut *self.pending.lock());
        if !slots.is_empty() {
            debug!(
                session_id = %self.id,
                released = slots.len(),
                "released pending outbound slots"
            );
        }
    }
}

/// Concurrent, keyed store of session records.
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<SessionState>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the session for `id`, creating it on first contact.
    pub fn open(&self, id: &str) -> Arc<SessionState> {
        if let Some(existing) = self.sessions.read().get(id) {
            return existing.clone();
        }
        self.sessions
            .write()
            .entry(id.to_string())
            .or_insert_with(|| {
                debug!(session_id = %id, "session created");
                Arc::new(SessionState::new(id))
            })
            .clone()
    }

    pub fn get(&self, id: &str) -> Option<Arc<SessionState>> {
        self.sessions.read().get(id).cloned()
    }

    /// Removes the session and cancels its pending outbound slots. Closing
    /// a session twice is a no-op.
    pub fn close(&self, id: &str) {
        if let Some(session) = self.sessions.write().remove(id) {
            session.release_pending();
            debug!(session_id = %id, "session closed");
        }
    }

    pub fn close_all(&self) {
        let drained = std::mem::take(&mut *self.sessions.write());
        for session in drained.values() {
            session.release_pending();
        }
    }

    /// Iterates a read snapshot of the table; mutations made while iterating
    /// are not reflected in this pass.
    pub fn for_each(&self, mut f: impl FnMut(&Arc<SessionState>)) {
        let snapshot: Vec<_> = self.sessions.read().values().cloned().collect();
        for session in &snapshot {
            f(session);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn open_is_get_or_create() {
        let manager = SessionManager::new();
        let first = manager.open("a");
        let second = manager.open("a");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn close_is_idempotent() {
        let manager = SessionManager::new();
        manager.open("a");
        manager.close("a");
        manager.close("a");
        assert!(manager.is_empty());
    }

    #[test]
    fn initialization_is_a_two_step_handshake() {
        let manager = SessionManager::new();
        let session = manager.open("a");
        assert!(!session.is_initialized());

        session.record_handshake(
            Implementation {
                name: "client".into(),
                version: "1".into(),
            },
            ClientCapabilities::default(),
        );
        assert!(!session.is_initialized());

        session.mark_initialized();
        assert!(session.is_initialized());
        assert_eq!(session.client_info().expect("client info").name, "client");
    }

    #[test]
    fn subscriptions_are_per_session() {
        let manager = SessionManager::new();
        let a = manager.open("a");
        let b = manager.open("b");
        a.subscribe("file:///x");
        assert!(a.is_subscribed("file:///x"));
        assert!(!b.is_subscribed("file:///x"));
        a.unsubscribe("file:///x");
        assert!(!a.is_subscribed("file:///x"));
    }

    #[test]
    fn outbound_ids_are_monotonic() {
        let session = SessionState::new("a");
        assert_eq!(session.next_outbound_id(), 1);
        assert_eq!(session.next_outbound_id(), 2);
        assert_eq!(session.next_outbound_id(), 3);
    }

    #[tokio::test]
    async fn closing_a_session_cancels_pending_slots() {
        let manager = SessionManager::new();
        let session = manager.open("a");
        let (tx, rx) = oneshot::channel();
        session.register_pending(1, tx);

        manager.close("a");

        // The sender is gone, so the waiter observes cancellation.
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn delivered_slot_receives_its_reply() {
        let session = SessionState::new("a");
        let (tx, rx) = oneshot::channel();
        session.register_pending(7, tx);

        let slot = session.take_pending(7).expect("slot");
        slot.send(Ok(json!({"ok": true}))).expect("deliver");
        assert!(session.take_pending(7).is_none());
        assert_eq!(rx.await.expect("recv").expect("result")["ok"], json!(true));
    }

    #[test]
    fn for_each_sees_a_snapshot() {
        let manager = SessionManager::new();
        manager.open("a");
        manager.open("b");
        let mut seen = Vec::new();
        manager.for_each(|session| {
            // Mutating mid-iteration must not affect this pass.
            manager.close("b");
            seen.push(session.id().to_string());
        });
        seen.sort();
        assert_eq!(seen, vec!["a".to_string(), "b".to_string()]);
    }
}
