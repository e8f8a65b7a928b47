//! Ambient per-request context handed to every handler

use std::sync::Arc;

/// Identifies the session a request arrived on. Handlers use this to issue
/// server-initiated calls back to the same client; the session id itself
/// stays behind a typed accessor.
#[derive(Debug, Clone)]
pub struct RequestContext {
    session_id: Arc<str>,
}

impl RequestContext {
    pub(crate) fn new(session_id: &str) -> Self {
        Self {
            session_id: Arc::from(session_id),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposes_the_session_id() {
        let ctx = RequestContext::new("sess-1");
        assert_eq!(ctx.session_id(), "sess-1");
        assert_eq!(ctx.clone().session_id(), "sess-1");
    }
}
