//! Control-plane configuration
//!
//! The port and key come from the surrounding application's configuration; the
//! timeouts default to the values agents are deployed against.

use drover_proto::{ControlKey, FrameCodec};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Connect timeout for every outbound control connection
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Read deadline for status responses and inbound notifications
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a stop waits for the agent's confirmation
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection attempts made for a single command
pub const DEFAULT_SEND_ATTEMPTS: usize = 3;

/// Inbound connections handled concurrently by the listener
pub const DEFAULT_MAX_CONCURRENT_CONNECTIONS: usize = 256;

/// Deadlines and retry bounds for control-plane I/O
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlTimeouts {
    pub connect: Duration,
    pub read: Duration,
    pub stop_wait: Duration,
    pub send_attempts: usize,
}

impl Default for ControlTimeouts {
    fn default() -> Self {
        Self {
            connect: DEFAULT_CONNECT_TIMEOUT,
            read: DEFAULT_READ_TIMEOUT,
            stop_wait: DEFAULT_STOP_TIMEOUT,
            send_attempts: DEFAULT_SEND_ATTEMPTS,
        }
    }
}

/// Control-plane configuration
#[derive(Debug, Clone)]
pub struct ControlConfig {
    /// Communications port, shared by agents and the proxy listener
    pub port: u16,
    /// Shared symmetric key
    pub key: ControlKey,
    pub timeouts: ControlTimeouts,
    /// Upper bound on inbound connections handled at once
    pub max_concurrent_connections: usize,
}

impl ControlConfig {
    pub fn new(port: u16, key: ControlKey) -> Self {
        Self {
            port,
            key,
            timeouts: ControlTimeouts::default(),
            max_concurrent_connections: DEFAULT_MAX_CONCURRENT_CONNECTIONS,
        }
    }

    pub fn with_timeouts(mut self, timeouts: ControlTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_max_concurrent_connections(mut self, max: usize) -> Self {
        self.max_concurrent_connections = max.max(1);
        self
    }

    /// Address the listener binds to: every interface on the communications port
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port))
    }

    pub fn codec(&self) -> FrameCodec {
        FrameCodec::new(self.key.clone())
    }
}
