//! coremcp — a Model Context Protocol server runtime
//!
//! The runtime dispatches framed JSON-RPC 2.0 messages from pluggable
//! transports, tracks per-session protocol state through the
//! `initialize`/`initialized` handshake, serves dynamic tool, prompt, and
//! resource registries with `listChanged` broadcasting, correlates
//! server-initiated requests with their replies, and drains in-flight work
//! on shutdown.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use coremcp::protocol::types::{CallToolResult, Content, Tool};
//! use coremcp::registry::tool_fn;
//! use coremcp::transport::stdio::StdioTransport;
//! use coremcp::Server;
//!
//! # async fn serve() -> Result<(), coremcp::ServerError> {
//! let server = Server::new(Arc::new(StdioTransport::new()));
//! server.register_tool(
//!     Tool {
//!         name: "echo".into(),
//!         description: Some("Echo the msg argument back".into()),
//!         input_schema: serde_json::json!({
//!             "type": "object",
//!             "properties": {"msg": {"type": "string"}},
//!         }),
//!     },
//!     tool_fn(|_ctx, params| async move {
//!         let msg = params.arguments.get("msg").cloned().unwrap_or_default();
//!         Ok(CallToolResult {
//!             content: vec![Content::text(msg.as_str().unwrap_or_default())],
//!             is_error: None,
//!         })
//!     }),
//! );
//! server.run().await
//! # }
//! ```

pub mod config;
pub mod context;
pub mod errors;
pub mod logging;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod transport;

pub use context::RequestContext;
pub use errors::{ServerError, TransportError};
pub use registry::{PromptHandler, ResourceHandler, ToolHandler};
pub use server::{Server, ServerBuilder};
pub use session::{SessionManager, SessionState};
pub use transport::{ServerTransport, Wiring};
