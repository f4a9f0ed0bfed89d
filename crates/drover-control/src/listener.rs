//! Inbound control connections from agents
//!
//! One task per accepted connection. A connection is authenticated only by its source
//! IP; anything from an unknown, unavailable or tearing-down server is dropped without
//! a reply. The body is read until the agent closes its side (bounded in size), decrypted,
//! and dispatched on the message vocabulary.

use crate::config::ControlConfig;
use crate::error::ControlError;
use crate::registry::{ServerRegistry, StoppedReport};
use crate::sender::ControlSender;
use crate::state::ServerState;
use drover_proto::{ControlMessage, MAX_FRAME_LEN};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// What happened to one inbound connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionOutcome {
    /// Source address not in the registry
    UnknownPeer,
    /// Server unavailable or in a teardown state
    Ignored,
    /// Body could not be read before the deadline
    ReadFailed,
    /// Body did not decrypt
    DecryptFailed,
    /// Decrypted payload outside the inbound vocabulary
    Unrecognized,
    /// `"started"` handled; carries the state the server was set to
    Started(ServerState),
    /// `"stopped"` handled
    Stopped(StoppedReport),
}

#[derive(Debug)]
struct ListenerContext {
    registry: ServerRegistry,
    sender: ControlSender,
    read_timeout: Duration,
}

/// Accept loop for agent notifications
#[derive(Debug)]
pub struct ControlListener {
    listener: TcpListener,
    context: Arc<ListenerContext>,
    permits: Arc<Semaphore>,
}

impl ControlListener {
    /// Bind the listener
    ///
    /// Failing to bind is the one fatal condition of the control plane.
    pub async fn bind(
        addr: SocketAddr,
        registry: ServerRegistry,
        sender: ControlSender,
        config: &ControlConfig,
    ) -> Result<Self, ControlError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ControlError::Bind {
                address: addr.ip().to_string(),
                port: addr.port(),
                reason: e.to_string(),
            })?;

        info!("Control listener bound to {}", listener.local_addr()?);

        Ok(Self {
            listener,
            context: Arc::new(ListenerContext {
                registry,
                sender,
                read_timeout: config.timeouts.read,
            }),
            permits: Arc::new(Semaphore::new(config.max_concurrent_connections.max(1))),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run the accept loop
    ///
    /// Each connection is handled on its own task; at most `max_concurrent_connections`
    /// handlers run at once and further connections wait in the accept backlog.
    pub async fn run(self) {
        loop {
            let permit = match self.permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    error!("Connection limiter closed, stopping control listener");
                    return;
                }
            };

            match self.listener.accept().await {
                Ok((socket, peer_addr)) => {
                    debug!("Accepted control connection from {}", peer_addr);
                    let context = self.context.clone();
                    tokio::spawn(async move {
                        let outcome = handle_connection(&context, socket, peer_addr).await;
                        debug!(peer = %peer_addr, ?outcome, "Control connection finished");
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!("Failed to accept control connection: {}", e);
                }
            }
        }
    }
}

/// Authenticate, read and dispatch one connection; the stream is dropped (closed) on return
async fn handle_connection<S>(
    context: &ListenerContext,
    mut stream: S,
    peer_addr: SocketAddr,
) -> ConnectionOutcome
where
    S: AsyncRead + Unpin,
{
    let Some(server) = context.registry.find_by_peer(&peer_addr) else {
        warn!(peer = %peer_addr.ip(), "Connection attempt from unknown address");
        return ConnectionOutcome::UnknownPeer;
    };

    if !server.accepts_control_traffic() {
        debug!(
            server = %server.address(),
            state = %server.state(),
            available = server.is_available(),
            "Ignoring control traffic from server"
        );
        return ConnectionOutcome::Ignored;
    }

    let mut body = Vec::new();
    // One byte past the cap is enough to tell an oversized body apart
    let mut limited = (&mut stream).take(MAX_FRAME_LEN as u64 + 1);
    match timeout(context.read_timeout, limited.read_to_end(&mut body)).await {
        Ok(Ok(len)) if len > MAX_FRAME_LEN => {
            warn!(
                server = %server.address(),
                max = MAX_FRAME_LEN,
                "Notification from agent exceeds maximum frame size"
            );
            return ConnectionOutcome::ReadFailed;
        }
        Ok(Ok(_)) => {}
        Ok(Err(e)) => {
            warn!(server = %server.address(), error = %e, "Error receiving notification from agent");
            return ConnectionOutcome::ReadFailed;
        }
        Err(_) => {
            warn!(
                server = %server.address(),
                timeout = ?context.read_timeout,
                "Timed out receiving notification from agent"
            );
            return ConnectionOutcome::ReadFailed;
        }
    }

    let payload = match context.sender.codec().decrypt(&body) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(server = %server.address(), error = %e, "Failed to decrypt notification");
            return ConnectionOutcome::DecryptFailed;
        }
    };

    match ControlMessage::from_wire(&payload) {
        Some(ControlMessage::Started) => {
            info!(server = %server.address(), "Agent announced started, verifying");
            // An announcement is only a prompt to re-check the agent's live status
            let state = if context.sender.is_running(server.address()).await {
                ServerState::Started
            } else {
                ServerState::Starting
            };
            if !server.set_state_unless_teardown(state) {
                debug!(server = %server.address(), "Server entered teardown during verification");
                return ConnectionOutcome::Ignored;
            }
            ConnectionOutcome::Started(state)
        }
        Some(ControlMessage::Stopped) => {
            ConnectionOutcome::Stopped(server.confirm_stop_or_mark_unavailable())
        }
        Some(ControlMessage::Stop) | None => {
            warn!(
                server = %server.address(),
                request = %String::from_utf8_lossy(&payload),
                "Unknown request from agent"
            );
            ConnectionOutcome::Unrecognized
        }
    }
}
