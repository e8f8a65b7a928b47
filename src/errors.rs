//! Runtime and transport error types with their JSON-RPC representations

use thiserror::Error;

use crate::protocol::uri_template::TemplateError;
use crate::protocol::RpcError;

pub const CODE_PARSE_ERROR: i64 = -32700;
pub const CODE_INVALID_REQUEST: i64 = -32600;
pub const CODE_METHOD_NOT_FOUND: i64 = -32601;
pub const CODE_INVALID_PARAMS: i64 = -32602;
pub const CODE_INTERNAL_ERROR: i64 = -32603;
pub const CODE_SERVER_CLOSED: i64 = -32001;
pub const CODE_NOT_INITIALIZED: i64 = -32002;
pub const CODE_RESOURCE_NOT_FOUND: i64 = -32002;

/// Errors raised by the dispatcher, registries, and outbound calls. The
/// surfaced kinds map onto JSON-RPC error codes; the internal kinds
/// (`UnknownSession`, `Timeout`, `SessionClosed`) never leave the process.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("method not found: {0}")]
    MethodNotFound(String),
    #[error("invalid params: {0}")]
    InvalidParams(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error("session has not completed the initialization handshake")]
    NotInitialized,
    #[error("server is shutting down")]
    ServerClosed,
    #[error("resource not found: {0}")]
    ResourceNotFound(String),
    #[error("unknown session: {0}")]
    UnknownSession(String),
    #[error("request timed out")]
    Timeout,
    #[error("session closed while awaiting a reply")]
    SessionClosed,
    #[error("peer replied with an error: {0}")]
    Peer(RpcError),
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ServerError {
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::InvalidParams(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn is_unknown_session(&self) -> bool {
        matches!(
            self,
            Self::UnknownSession(_) | Self::Transport(TransportError::UnknownSession(_))
        )
    }

    pub fn jsonrpc_code(&self) -> i64 {
        match self {
            Self::Parse(_) => CODE_PARSE_ERROR,
            Self::InvalidRequest(_) => CODE_INVALID_REQUEST,
            Self::MethodNotFound(_) => CODE_METHOD_NOT_FOUND,
            Self::InvalidParams(_) | Self::Template(_) => CODE_INVALID_PARAMS,
            Self::NotInitialized => CODE_NOT_INITIALIZED,
            Self::ServerClosed => CODE_SERVER_CLOSED,
            Self::ResourceNotFound(_) => CODE_RESOURCE_NOT_FOUND,
            _ => CODE_INTERNAL_ERROR,
        }
    }

    /// The wire representation sent back in an error reply.
    pub fn to_rpc_error(&self) -> RpcError {
        RpcError {
            code: self.jsonrpc_code(),
            message: self.to_string(),
            data: None,
        }
    }
}

/// Errors raised below the dispatcher, at the byte-channel layer.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("unknown session: {0}")]
    UnknownSession(String),
    #[error("transport is not bound to a server")]
    NotBound,
    #[error("transport is not running")]
    NotRunning,
    #[error("outbound channel for session {0} is closed")]
    ChannelClosed(String),
    #[error("shutdown cancelled by caller")]
    ShutdownCancelled,
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn surfaced_kinds_map_to_their_codes() {
        assert_eq!(
            ServerError::Parse("bad".into()).jsonrpc_code(),
            CODE_PARSE_ERROR
        );
        assert_eq!(
            ServerError::MethodNotFound("x".into()).jsonrpc_code(),
            CODE_METHOD_NOT_FOUND
        );
        assert_eq!(ServerError::NotInitialized.jsonrpc_code(), -32002);
        assert_eq!(ServerError::ServerClosed.jsonrpc_code(), -32001);
        assert_eq!(
            ServerError::ResourceNotFound("file:///x".into()).jsonrpc_code(),
            -32002
        );
    }

    #[test]
    fn internal_kinds_fall_back_to_internal_error() {
        assert_eq!(ServerError::Timeout.jsonrpc_code(), CODE_INTERNAL_ERROR);
        assert_eq!(
            ServerError::SessionClosed.jsonrpc_code(),
            CODE_INTERNAL_ERROR
        );
        assert_eq!(
            ServerError::UnknownSession("s".into()).jsonrpc_code(),
            CODE_INTERNAL_ERROR
        );
    }

    #[test]
    fn unknown_session_is_detected_through_the_transport_wrapper() {
        let err = ServerError::Transport(TransportError::UnknownSession("s".into()));
        assert!(err.is_unknown_session());
        assert!(!ServerError::Timeout.is_unknown_session());
    }
}
