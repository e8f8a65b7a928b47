use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use coremcp::config::{Config, TransportKind};
use coremcp::protocol::types::{CallToolResult, Content, Resource, Tool};
use coremcp::registry::{resource_fn, tool_fn};
use coremcp::transport::sse::{SseOptions, SseTransport};
use coremcp::transport::stdio::StdioTransport;
use coremcp::{logging, Server, ServerTransport};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init();

    let config = Config::from_env()?;
    let transport: Arc<dyn ServerTransport> = match config.transport {
        TransportKind::Stdio => Arc::new(StdioTransport::new()),
        TransportKind::Sse => SseTransport::bound(
            config.bind_socket()?,
            SseOptions {
                sse_path: config.sse_path.clone(),
                message_path: config.message_path.clone(),
                ..SseOptions::default()
            },
        ),
    };

    let server = Server::builder(transport)
        .instructions("Demo server: the echo tool repeats its msg argument.")
        .build();
    register_demo_entries(&server);

    info!(transport = ?config.transport, "server starting");

    let serving = server.clone();
    tokio::select! {
        result = serving.run() => Ok(result?),
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, draining");
            let user = CancellationToken::new();
            let deadline = user.clone();
            tokio::spawn(async move {
                tokio::time::sleep(SHUTDOWN_GRACE).await;
                deadline.cancel();
            });
            server.shutdown(user).await?;
            Ok(())
        }
    }
}

fn register_demo_entries(server: &Server) {
    server.register_tool(
        Tool {
            name: "echo".to_string(),
            description: Some("Echo the msg argument back".to_string()),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {"msg": {"type": "string"}},
                "required": ["msg"],
            }),
        },
        tool_fn(|_ctx, params| async move {
            let msg = params
                .arguments
                .get("msg")
                .and_then(|value| value.as_str())
                .unwrap_or_default()
                .to_string();
            Ok(CallToolResult {
                content: vec![Content::text(msg)],
                is_error: None,
            })
        }),
    );

    server.register_resource(
        Resource {
            uri: "info://about".to_string(),
            name: "About".to_string(),
            description: Some("What this server is".to_string()),
            mime_type: Some("text/plain".to_string()),
        },
        resource_fn(|_ctx, params| async move {
            Ok(coremcp::protocol::types::ReadResourceResult {
                contents: vec![coremcp::protocol::types::ResourceContents::Text {
                    uri: params.uri,
                    mime_type: Some("text/plain".to_string()),
                    text: format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
                }],
            })
        }),
    );
}
