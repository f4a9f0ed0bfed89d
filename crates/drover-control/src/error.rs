//! Control-plane error taxonomy

use drover_proto::CodecError;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;

/// Control-plane errors
///
/// Transport and codec failures on the command, status and listener paths are logged
/// and absorbed where they occur; only setup failures and stop-orchestration misuse
/// reach callers.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("Failed to bind control listener to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different communications port")]
    Bind {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("Unknown server: {0}")]
    UnknownServer(IpAddr),

    #[error("Server {0} is not available for control commands")]
    ServerUnavailable(IpAddr),

    #[error("A stop is already pending for server {0}")]
    StopAlreadyPending(IpAddr),
}
