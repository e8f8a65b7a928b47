//! Newline-delimited stdio transport with a single implicit session
//!
//! Frames are one JSON object per line on stdin/stdout. The process
//! lifetime is the session lifetime: the `"stdio"` session is created when
//! `run` starts and closed on EOF or shutdown. Diagnostics belong on
//! stderr, which the logging layer already targets.

use std::pin::Pin;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::TransportError;
use crate::transport::{ServerTransport, Wiring};

/// Session id carried by every frame on this transport.
pub const STDIO_SESSION_ID: &str = "stdio";

type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;
type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

pub struct StdioTransport {
    wiring: RwLock<Option<Wiring>>,
    outbound_tx: mpsc::UnboundedSender<String>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    reader: Mutex<Option<BoxedReader>>,
    writer: Mutex<Option<BoxedWriter>>,
    closed: CancellationToken,
}

impl StdioTransport {
    pub fn new() -> Self {
        Self::with_streams(tokio::io::stdin(), tokio::io::stdout())
    }

    /// Builds the transport over arbitrary streams. Production code wants
    /// `new`; this exists for in-process pipes and tests.
    pub fn with_streams(
        reader: impl AsyncRead + Send + 'static,
        writer: impl AsyncWrite + Send + 'static,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Self {
            wiring: RwLock::new(None),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            reader: Mutex::new(Some(Box::pin(reader))),
            writer: Mutex::new(Some(Box::pin(writer))),
            closed: CancellationToken::new(),
        }
    }
}

impl Default for StdioTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ServerTransport for StdioTransport {
    fn bind(&self, wiring: Wiring) {
        *self.wiring.write() = Some(wiring);
    }

    async fn run(&self) -> Result<(), TransportError> {
        let wiring = self
            .wiring
            .read()
            .clone()
            .ok_or(TransportError::NotBound)?;
        let mut outbound = self
            .outbound_rx
            .lock()
            .take()
            .ok_or(TransportError::NotRunning)?;
        let reader = self.reader.lock().take().ok_or(TransportError::NotRunning)?;
        let mut writer = self.writer.lock().take().ok_or(TransportError::NotRunning)?;

        wiring.sessions.open(STDIO_SESSION_ID);

        let writer_closed = self.closed.clone();
        let writer_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = outbound.recv() => match frame {
                        Some(frame) => {
                            if write_frame(&mut writer, &frame).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = writer_closed.cancelled() => {
                        // Replies already enqueued by drained handlers still
                        // go out before the writer stops.
                        while let Ok(frame) = outbound.try_recv() {
                            if write_frame(&mut writer, &frame).await.is_err() {
                                break;
                            }
                        }
                        break;
                    }
                }
            }
        });

        let mut lines = BufReader::new(reader).lines();
        let result = loop {
            tokio::select! {
                _ = self.closed.cancelled() => break Ok(()),
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        if let Err(err) = (wiring.receiver)(STDIO_SESSION_ID, line.as_bytes()) {
                            warn!(error = %err, "inbound frame dropped");
                        }
                    }
                    Ok(None) => {
                        debug!("stdin reached EOF");
                        break Ok(());
                    }
                    Err(err) => break Err(TransportError::Io(err)),
                },
            }
        };

        self.closed.cancel();
        let _ = writer_task.await;
        wiring.sessions.close(STDIO_SESSION_ID);
        result
    }

    fn send(&self, session_id: &str, frame: String) -> Result<(), TransportError> {
        if session_id != STDIO_SESSION_ID {
            return Err(TransportError::UnknownSession(session_id.to_string()));
        }
        self.outbound_tx
            .send(frame)
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

async fn write_frame(writer: &mut BoxedWriter, frame: &str) -> std::io::Result<()> {
    writer.write_all(frame.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}
