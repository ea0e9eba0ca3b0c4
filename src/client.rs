//! Window-side connection to the gateway.
//!
//! One TCP stream carries newline-delimited JSON both ways. A writer task
//! drains an unbounded queue of [`ClientMessage`]s; a reader task decodes
//! [`ServerMessage`]s into another queue. When the stream ends the inbound
//! queue closes, which is how the owning window learns the link is gone.

use crate::error::SessionError;
use crate::protocol::{decode_line, encode_line, ClientMessage, ServerMessage};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, warn};

pub struct GatewayClient {
    outbound: mpsc::UnboundedSender<ClientMessage>,
    inbound: mpsc::UnboundedReceiver<ServerMessage>,
}

impl GatewayClient {
    pub async fn connect(addr: &str) -> Result<Self, SessionError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| SessionError::Link(format!("cannot reach gateway at {addr}: {e}")))?;
        debug!(%addr, "connected to gateway");
        Ok(Self::from_stream(stream))
    }

    pub fn from_stream(stream: TcpStream) -> Self {
        let (read_half, mut write_half) = stream.into_split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<ServerMessage>();

        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let line = match encode_line(&message) {
                    Ok(line) => line,
                    Err(e) => {
                        error!(error = %e, "failed to encode client message");
                        continue;
                    }
                };
                if let Err(e) = write_half.write_all(line.as_bytes()).await {
                    debug!(error = %e, "gateway write failed");
                    break;
                }
            }
        });

        tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) if line.trim().is_empty() => continue,
                    Ok(Some(line)) => match decode_line::<ServerMessage>(&line) {
                        Ok(message) => {
                            if inbound_tx.send(message).is_err() {
                                return;
                            }
                        }
                        Err(e) => warn!(error = %e, "dropping malformed gateway frame"),
                    },
                    Ok(None) => break,
                    Err(e) => {
                        debug!(error = %e, "gateway read failed");
                        break;
                    }
                }
            }
            debug!("gateway stream ended");
        });

        Self {
            outbound: outbound_tx,
            inbound: inbound_rx,
        }
    }

    pub fn send(&self, message: ClientMessage) -> Result<(), SessionError> {
        self.outbound
            .send(message)
            .map_err(|_| SessionError::Link("gateway connection closed".into()))
    }

    pub async fn recv(&mut self) -> Option<ServerMessage> {
        self.inbound.recv().await
    }

    /// Send a correlated request and wait for the reply carrying the same
    /// correlation id. Unrelated pushes that arrive meanwhile are dropped.
    pub async fn request(&mut self, message: ClientMessage, wait: Duration) -> Result<ServerMessage, SessionError> {
        let correlation_id = message
            .correlation_id
            .clone()
            .ok_or_else(|| SessionError::Link("request needs a correlation id".into()))?;
        self.send(message)?;
        let reply = timeout(wait, async {
            while let Some(reply) = self.inbound.recv().await {
                if reply.correlation_id.as_deref() == Some(correlation_id.as_str()) {
                    return Some(reply);
                }
                debug!(payload = ?reply.payload, "ignoring unrelated gateway push");
            }
            None
        })
        .await
        .map_err(|_| SessionError::Link(format!("no reply from gateway after {}s", wait.as_secs())))?;
        reply.ok_or_else(|| SessionError::Link("gateway connection closed".into()))
    }

    /// Hand both queues to a window: the sender doubles as its gateway link.
    pub fn split(self) -> (mpsc::UnboundedSender<ClientMessage>, mpsc::UnboundedReceiver<ServerMessage>) {
        (self.outbound, self.inbound)
    }
}
