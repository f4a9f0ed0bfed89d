//! Outbound control connections to agents
//!
//! Commands are fire-and-forget: the agent's confirmation, if any, arrives later through
//! the control listener. Status queries answer `true` only on an exact `"started"` and
//! treat every failure as "not running".

use crate::config::{ControlConfig, ControlTimeouts};
use crate::error::ControlError;
use drover_proto::{ControlMessage, FrameCodec, RESPONSE_DELIMITER};
use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Sends commands to agents and queries their status
#[derive(Debug, Clone)]
pub struct ControlSender {
    codec: FrameCodec,
    port: u16,
    timeouts: ControlTimeouts,
}

impl ControlSender {
    /// Create a sender that reaches agents on `port`
    pub fn new(codec: FrameCodec, port: u16, timeouts: ControlTimeouts) -> Self {
        Self {
            codec,
            port,
            timeouts,
        }
    }

    pub fn from_config(config: &ControlConfig) -> Self {
        Self::new(config.codec(), config.port, config.timeouts.clone())
    }

    pub fn codec(&self) -> &FrameCodec {
        &self.codec
    }

    fn agent_addr(&self, server: IpAddr) -> SocketAddr {
        SocketAddr::new(server, self.port)
    }

    /// Push a command to the agent at `server`
    ///
    /// Makes up to `send_attempts` connection attempts and stops at the first one whose
    /// write succeeds. Failures are logged, never returned; the result only reports
    /// whether the frame was written.
    pub async fn send_command(&self, server: IpAddr, message: ControlMessage) -> bool {
        let addr = self.agent_addr(server);

        let delivered = with_attempts(self.timeouts.send_attempts, move |attempt| async move {
            let result = self.try_send(addr, message).await;
            if let Err(e) = &result {
                warn!(
                    server = %server,
                    %message,
                    attempt,
                    error = %e,
                    "Failed to deliver control command"
                );
            }
            result
        })
        .await;

        match delivered {
            Some(attempt) => {
                debug!(server = %server, %message, attempt, "Delivered control command");
                true
            }
            None => {
                warn!(
                    server = %server,
                    %message,
                    attempts = self.timeouts.send_attempts,
                    "Giving up on control command"
                );
                false
            }
        }
    }

    async fn try_send(&self, addr: SocketAddr, message: ControlMessage) -> Result<(), ControlError> {
        let mut stream = self.connect(addr).await?;
        let frame = self.codec.encrypt(message.as_bytes())?;
        self.write_frame(&mut stream, &frame).await
    }

    /// Write one unterminated frame and close the write side, under the read deadline
    async fn write_frame<S>(&self, stream: &mut S, frame: &[u8]) -> Result<(), ControlError>
    where
        S: AsyncWrite + Unpin,
    {
        timeout(self.timeouts.read, async {
            stream.write_all(frame).await?;
            // The agent reads until EOF
            let _ = stream.shutdown().await;
            Ok::<_, io::Error>(())
        })
        .await
        .map_err(|_| ControlError::Timeout {
            operation: "command write",
            after: self.timeouts.read,
        })??;
        Ok(())
    }

    /// Ask the agent at `server` whether its backend is running
    pub async fn is_running(&self, server: IpAddr) -> bool {
        match self.query_status(server).await {
            Ok(Some(ControlMessage::Started)) => true,
            Ok(Some(other)) => {
                debug!(server = %server, status = %other, "Agent reports server not running");
                false
            }
            Ok(None) => {
                warn!(server = %server, "Agent answered status query with unrecognized payload");
                false
            }
            Err(e) => {
                warn!(server = %server, error = %e, "Status query failed");
                false
            }
        }
    }

    /// Read one delimiter-terminated status frame from the agent at `server`
    ///
    /// Returns `Ok(None)` when the frame decrypts to something outside the vocabulary.
    pub async fn query_status(
        &self,
        server: IpAddr,
    ) -> Result<Option<ControlMessage>, ControlError> {
        let stream = self.connect(self.agent_addr(server)).await?;
        let mut reader = BufReader::new(stream);
        let mut line = Vec::new();

        timeout(
            self.timeouts.read,
            reader.read_until(RESPONSE_DELIMITER, &mut line),
        )
        .await
        .map_err(|_| ControlError::Timeout {
            operation: "status read",
            after: self.timeouts.read,
        })??;

        if line.last() != Some(&RESPONSE_DELIMITER) {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "agent closed connection before completing status response",
            )
            .into());
        }

        let payload = self.codec.decode_response(&line)?;
        Ok(ControlMessage::from_wire(&payload))
    }

    async fn connect(&self, addr: SocketAddr) -> Result<TcpStream, ControlError> {
        let stream = timeout(self.timeouts.connect, TcpStream::connect(addr))
            .await
            .map_err(|_| ControlError::Timeout {
                operation: "connect",
                after: self.timeouts.connect,
            })??;
        Ok(stream)
    }
}

/// Run `attempt` up to `attempts` times, stopping at the first success
///
/// Returns the 1-based number of the attempt that succeeded.
async fn with_attempts<F, Fut>(attempts: usize, mut attempt: F) -> Option<usize>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<(), ControlError>>,
{
    for n in 1..=attempts {
        if attempt(n).await.is_ok() {
            return Some(n);
        }
    }
    None
}
