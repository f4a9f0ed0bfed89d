//! Control plane between the proxy and the agents fronting managed servers
//!
//! Commands go out through [`ControlSender`], notifications come in through
//! [`ControlListener`], and both feed the per-server lifecycle kept in
//! [`ServerRegistry`]. [`ControlPlane`] ties them together for stop orchestration.

pub mod config;
pub mod error;
pub mod listener;
pub mod notifier;
pub mod plane;
pub mod registry;
pub mod sender;
pub mod state;

pub use config::{ControlConfig, ControlTimeouts};
pub use error::ControlError;
pub use listener::{ConnectionOutcome, ControlListener};
pub use notifier::{StopOutcome, StopTicket};
pub use plane::ControlPlane;
pub use registry::{ManagedServer, ServerRegistry, StoppedReport};
pub use sender::ControlSender;
pub use state::ServerState;

pub use drover_proto::{ControlKey, ControlMessage, FrameCodec};
