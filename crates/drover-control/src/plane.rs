//! Control plane facade: stop orchestration and status refresh

use crate::config::ControlConfig;
use crate::error::ControlError;
use crate::listener::ControlListener;
use crate::notifier::StopOutcome;
use crate::registry::{ManagedServer, ServerRegistry};
use crate::sender::ControlSender;
use crate::state::ServerState;
use drover_proto::ControlMessage;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Drives agents through the control channel
#[derive(Debug, Clone)]
pub struct ControlPlane {
    config: Arc<ControlConfig>,
    registry: ServerRegistry,
    sender: ControlSender,
}

impl ControlPlane {
    pub fn new(config: ControlConfig, registry: ServerRegistry) -> Self {
        let sender = ControlSender::from_config(&config);
        Self {
            config: Arc::new(config),
            registry,
            sender,
        }
    }

    pub fn registry(&self) -> &ServerRegistry {
        &self.registry
    }

    /// Bind a listener that shares this plane's registry and sender
    pub async fn listen(&self, addr: SocketAddr) -> Result<ControlListener, ControlError> {
        ControlListener::bind(addr, self.registry.clone(), self.sender.clone(), &self.config)
            .await
    }

    fn resolve(&self, address: IpAddr) -> Result<Arc<ManagedServer>, ControlError> {
        self.registry
            .get(&address)
            .ok_or(ControlError::UnknownServer(address))
    }

    /// Stop the backend behind `address` and wait for the agent to confirm
    ///
    /// Returns once the agent reports `"stopped"` or the stop timeout elapses, whichever
    /// comes first.
    pub async fn stop_server(&self, address: IpAddr) -> Result<StopOutcome, ControlError> {
        let server = self.resolve(address)?;

        // Armed before the command goes out so a fast reply is never taken as unsolicited
        let ticket = server.arm_stop()?;
        let guard = spawn_timeout_guard(server.clone(), ticket.id(), self.config.timeouts.stop_wait);
        let started = Instant::now();

        info!(server = %address, stop_id = ticket.id(), "Stopping server");
        self.sender.send_command(address, ControlMessage::Stop).await;

        let outcome = ticket.wait().await;
        guard.abort();

        info!(
            server = %address,
            ?outcome,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Stop finished"
        );
        Ok(outcome)
    }

    /// Query the agent and record a positive answer as `Started`
    ///
    /// A negative or failed query leaves the state untouched. Returns the state after
    /// the query.
    pub async fn refresh_status(&self, address: IpAddr) -> Result<ServerState, ControlError> {
        let server = self.resolve(address)?;

        if self.sender.is_running(address).await {
            server.set_state_unless_teardown(ServerState::Started);
        } else {
            debug!(server = %address, "Agent not reporting started, state unchanged");
        }
        Ok(server.state())
    }

    /// Push a command without waiting for any confirmation
    pub async fn send_command(
        &self,
        address: IpAddr,
        message: ControlMessage,
    ) -> Result<bool, ControlError> {
        let server = self.resolve(address)?;
        if !server.is_available() {
            return Err(ControlError::ServerUnavailable(address));
        }
        Ok(self.sender.send_command(address, message).await)
    }
}

fn spawn_timeout_guard(server: Arc<ManagedServer>, stop_id: u64, after: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        server.expire_stop(stop_id);
    })
}
