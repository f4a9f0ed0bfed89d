//! Registry of managed servers and their lifecycle state
//!
//! Servers are keyed by the IP address their agent connects from; that address is the
//! only authentication the control plane has. Each server keeps its lifecycle state,
//! availability flag and pending stop behind one mutex, so the listener task, the
//! timeout guard and the stop caller never interleave a read-modify-write.

use crate::error::ControlError;
use crate::notifier::{self, StopOutcome, StopTicket, StopWaiter};
use crate::state::ServerState;
use dashmap::DashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// What the listener did with a `"stopped"` report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoppedReport {
    /// A stop-wait was pending and has been released
    Confirmed,
    /// Nothing was waiting; the server was marked unavailable
    MarkedUnavailable,
}

#[derive(Debug)]
struct ServerSlot {
    state: ServerState,
    available: bool,
    pending_stop: Option<StopWaiter>,
}

/// A server known to the control plane
#[derive(Debug)]
pub struct ManagedServer {
    address: IpAddr,
    slot: Mutex<ServerSlot>,
    next_stop_id: AtomicU64,
}

impl ManagedServer {
    pub fn new(address: IpAddr, state: ServerState, available: bool) -> Self {
        Self {
            address: address.to_canonical(),
            slot: Mutex::new(ServerSlot {
                state,
                available,
                pending_stop: None,
            }),
            next_stop_id: AtomicU64::new(1),
        }
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    // The slot holds plain values with no multi-step invariant, so a poisoned lock is
    // still consistent.
    fn lock(&self) -> MutexGuard<'_, ServerSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ServerState {
        self.lock().state
    }

    /// Set the lifecycle state unconditionally, returning the previous one
    pub fn set_state(&self, state: ServerState) -> ServerState {
        let previous = std::mem::replace(&mut self.lock().state, state);
        if previous != state {
            info!(server = %self.address, from = %previous, to = %state, "Server state changed");
        }
        previous
    }

    /// Set the lifecycle state unless the server has entered teardown meanwhile
    pub fn set_state_unless_teardown(&self, state: ServerState) -> bool {
        let previous = {
            let mut slot = self.lock();
            if slot.state.is_teardown() {
                return false;
            }
            std::mem::replace(&mut slot.state, state)
        };
        if previous != state {
            info!(server = %self.address, from = %previous, to = %state, "Server state changed");
        }
        true
    }

    pub fn is_available(&self) -> bool {
        self.lock().available
    }

    pub fn set_available(&self, available: bool) {
        self.lock().available = available;
        debug!(server = %self.address, available, "Server availability changed");
    }

    /// Whether inbound control traffic from this server should be processed at all
    pub fn accepts_control_traffic(&self) -> bool {
        let slot = self.lock();
        slot.available && !slot.state.is_teardown()
    }

    pub fn is_stop_pending(&self) -> bool {
        self.lock().pending_stop.is_some()
    }

    /// Arm a new stop-wait for this server
    ///
    /// The server must be available, and at most one stop-wait may be outstanding.
    pub fn arm_stop(&self) -> Result<StopTicket, ControlError> {
        let mut slot = self.lock();
        if !slot.available {
            return Err(ControlError::ServerUnavailable(self.address));
        }
        if slot.pending_stop.is_some() {
            return Err(ControlError::StopAlreadyPending(self.address));
        }

        let id = self.next_stop_id.fetch_add(1, Ordering::Relaxed);
        let (waiter, ticket) = notifier::arm(id);
        slot.pending_stop = Some(waiter);
        debug!(server = %self.address, stop_id = id, "Armed stop-wait");
        Ok(ticket)
    }

    /// Handle a `"stopped"` report from the agent
    ///
    /// Releases a pending stop-wait if there is one; otherwise the report is unsolicited
    /// and the server becomes unavailable. Both branches run under one lock acquisition.
    pub fn confirm_stop_or_mark_unavailable(&self) -> StoppedReport {
        let (waiter, previous) = {
            let mut slot = self.lock();
            match slot.pending_stop.take() {
                Some(waiter) => (Some(waiter), slot.state),
                None => {
                    let previous = std::mem::replace(&mut slot.state, ServerState::Unavailable);
                    (None, previous)
                }
            }
        };

        match waiter {
            Some(waiter) => {
                info!(server = %self.address, stop_id = waiter.id(), "Stop confirmed by agent");
                waiter.complete(StopOutcome::Confirmed);
                StoppedReport::Confirmed
            }
            None => {
                info!(
                    server = %self.address,
                    from = %previous,
                    "Unsolicited stop report, marking server unavailable"
                );
                StoppedReport::MarkedUnavailable
            }
        }
    }

    /// Complete the stop-wait `id` as timed out, if it is still pending
    ///
    /// A guard left over from an earlier stop never touches a newer wait.
    pub fn expire_stop(&self, id: u64) -> bool {
        let waiter = {
            let mut slot = self.lock();
            if slot.pending_stop.as_ref().map(StopWaiter::id) == Some(id) {
                slot.pending_stop.take()
            } else {
                None
            }
        };

        match waiter {
            Some(waiter) => {
                warn!(server = %self.address, stop_id = id, "Timed out waiting for stop confirmation");
                waiter.complete(StopOutcome::TimedOut);
                true
            }
            None => false,
        }
    }
}

/// Thread-safe registry of managed servers keyed by address
#[derive(Debug, Clone, Default)]
pub struct ServerRegistry {
    servers: Arc<DashMap<IpAddr, Arc<ManagedServer>>>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a server, replacing any existing entry for the same address
    pub fn register(
        &self,
        address: IpAddr,
        state: ServerState,
        available: bool,
    ) -> Arc<ManagedServer> {
        let server = Arc::new(ManagedServer::new(address, state, available));
        let replaced = self.servers.insert(server.address(), server.clone());

        if replaced.is_some() {
            info!(server = %address, %state, available, "Re-registered server (replaced existing entry)");
        } else {
            info!(server = %address, %state, available, "Registered server");
        }
        server
    }

    pub fn unregister(&self, address: &IpAddr) -> Option<Arc<ManagedServer>> {
        let removed = self
            .servers
            .remove(&address.to_canonical())
            .map(|(_, server)| server);

        if removed.is_some() {
            info!(server = %address, "Unregistered server");
        } else {
            warn!(server = %address, "Attempted to unregister unknown server");
        }
        removed
    }

    pub fn get(&self, address: &IpAddr) -> Option<Arc<ManagedServer>> {
        self.servers
            .get(&address.to_canonical())
            .map(|entry| entry.value().clone())
    }

    /// Resolve a connecting peer by exact IP match; the source port is ignored
    pub fn find_by_peer(&self, peer: &SocketAddr) -> Option<Arc<ManagedServer>> {
        self.get(&peer.ip())
    }

    pub fn list(&self) -> Vec<Arc<ManagedServer>> {
        self.servers
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_register_and_get() {
        let registry = ServerRegistry::new();
        registry.register(ip("10.0.0.5"), ServerState::Starting, true);

        let server = registry.get(&ip("10.0.0.5")).unwrap();
        assert_eq!(server.address(), ip("10.0.0.5"));
        assert_eq!(server.state(), ServerState::Starting);
        assert!(server.is_available());
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_register_replaces_existing() {
        let registry = ServerRegistry::new();
        registry.register(ip("10.0.0.5"), ServerState::Starting, true);
        registry.register(ip("10.0.0.5"), ServerState::Started, false);

        assert_eq!(registry.count(), 1);
        let server = registry.get(&ip("10.0.0.5")).unwrap();
        assert_eq!(server.state(), ServerState::Started);
        assert!(!server.is_available());
    }

    #[test]
    fn test_unregister() {
        let registry = ServerRegistry::new();
        registry.register(ip("10.0.0.5"), ServerState::Started, true);

        assert!(registry.unregister(&ip("10.0.0.5")).is_some());
        assert!(registry.unregister(&ip("10.0.0.5")).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_list() {
        let registry = ServerRegistry::new();
        registry.register(ip("10.0.0.5"), ServerState::Started, true);
        registry.register(ip("10.0.0.6"), ServerState::Starting, false);

        let mut addresses: Vec<IpAddr> = registry.list().iter().map(|s| s.address()).collect();
        addresses.sort();
        assert_eq!(addresses, vec![ip("10.0.0.5"), ip("10.0.0.6")]);
    }

    #[test]
    fn test_find_by_peer_ignores_port() {
        let registry = ServerRegistry::new();
        registry.register(ip("192.168.1.20"), ServerState::Started, true);

        let peer: SocketAddr = "192.168.1.20:51234".parse().unwrap();
        assert!(registry.find_by_peer(&peer).is_some());

        let other: SocketAddr = "192.168.1.21:51234".parse().unwrap();
        assert!(registry.find_by_peer(&other).is_none());
    }

    #[test]
    fn test_find_by_peer_ipv4_mapped() {
        let registry = ServerRegistry::new();
        registry.register(ip("192.168.1.20"), ServerState::Started, true);

        let peer: SocketAddr = "[::ffff:192.168.1.20]:40000".parse().unwrap();
        assert!(registry.find_by_peer(&peer).is_some());
    }

    #[test]
    fn test_accepts_control_traffic() {
        let server = ManagedServer::new(ip("10.0.0.1"), ServerState::Started, true);
        assert!(server.accepts_control_traffic());

        server.set_state(ServerState::Destroying);
        assert!(!server.accepts_control_traffic());

        server.set_state(ServerState::Snapshotting);
        assert!(!server.accepts_control_traffic());

        server.set_state(ServerState::Starting);
        server.set_available(false);
        assert!(!server.accepts_control_traffic());
    }

    #[test]
    fn test_set_state_returns_previous() {
        let server = ManagedServer::new(ip("10.0.0.1"), ServerState::Starting, true);
        assert_eq!(server.set_state(ServerState::Started), ServerState::Starting);
        assert_eq!(server.state(), ServerState::Started);
    }

    #[test]
    fn test_set_state_unless_teardown() {
        let server = ManagedServer::new(ip("10.0.0.1"), ServerState::Destroying, true);
        assert!(!server.set_state_unless_teardown(ServerState::Started));
        assert_eq!(server.state(), ServerState::Destroying);

        server.set_state(ServerState::Unavailable);
        assert!(server.set_state_unless_teardown(ServerState::Starting));
        assert_eq!(server.state(), ServerState::Starting);
    }

    #[test]
    fn test_unsolicited_stop_marks_unavailable() {
        let server = ManagedServer::new(ip("10.0.0.1"), ServerState::Started, true);
        assert_eq!(
            server.confirm_stop_or_mark_unavailable(),
            StoppedReport::MarkedUnavailable
        );
        assert_eq!(server.state(), ServerState::Unavailable);
    }

    #[tokio::test]
    async fn test_stop_confirmation_leaves_state_alone() {
        let server = ManagedServer::new(ip("10.0.0.1"), ServerState::Started, true);
        let ticket = server.arm_stop().unwrap();
        assert!(server.is_stop_pending());

        assert_eq!(
            server.confirm_stop_or_mark_unavailable(),
            StoppedReport::Confirmed
        );
        assert!(!server.is_stop_pending());
        assert_eq!(server.state(), ServerState::Started);
        assert_eq!(ticket.wait().await, StopOutcome::Confirmed);
    }

    #[tokio::test]
    async fn test_single_outstanding_stop() {
        let server = ManagedServer::new(ip("10.0.0.1"), ServerState::Started, true);
        let _ticket = server.arm_stop().unwrap();

        let err = server.arm_stop().unwrap_err();
        assert!(matches!(err, ControlError::StopAlreadyPending(addr) if addr == ip("10.0.0.1")));
    }

    #[test]
    fn test_arm_stop_requires_available_server() {
        let server = ManagedServer::new(ip("10.0.0.1"), ServerState::Started, false);

        let err = server.arm_stop().unwrap_err();
        assert!(matches!(err, ControlError::ServerUnavailable(addr) if addr == ip("10.0.0.1")));
        assert!(!server.is_stop_pending());

        server.set_available(true);
        assert!(server.arm_stop().is_ok());
        assert!(server.is_stop_pending());
    }

    #[tokio::test]
    async fn test_expire_stop() {
        let server = ManagedServer::new(ip("10.0.0.1"), ServerState::Started, true);
        let ticket = server.arm_stop().unwrap();
        let id = ticket.id();

        assert!(server.expire_stop(id));
        assert!(!server.expire_stop(id));
        assert!(!server.is_stop_pending());
        assert_eq!(ticket.wait().await, StopOutcome::TimedOut);
    }

    #[tokio::test]
    async fn test_stale_guard_ignores_newer_stop() {
        let server = ManagedServer::new(ip("10.0.0.1"), ServerState::Started, true);

        let first = server.arm_stop().unwrap();
        let stale_id = first.id();
        server.confirm_stop_or_mark_unavailable();
        assert_eq!(first.wait().await, StopOutcome::Confirmed);

        let second = server.arm_stop().unwrap();
        assert_ne!(second.id(), stale_id);

        // The first stop's guard fires late and must not release the second wait
        assert!(!server.expire_stop(stale_id));
        assert!(server.is_stop_pending());

        assert!(server.expire_stop(second.id()));
        assert_eq!(second.wait().await, StopOutcome::TimedOut);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_confirmation_and_timeout_race_completes_once() {
        for _ in 0..200 {
            let server = Arc::new(ManagedServer::new(
                ip("10.0.0.1"),
                ServerState::Started,
                true,
            ));
            let ticket = server.arm_stop().unwrap();
            let id = ticket.id();
            let barrier = Arc::new(tokio::sync::Barrier::new(2));

            let listener = {
                let server = server.clone();
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    server.confirm_stop_or_mark_unavailable() == StoppedReport::Confirmed
                })
            };
            let guard = {
                let server = server.clone();
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    server.expire_stop(id)
                })
            };

            let confirmed = listener.await.unwrap();
            let expired = guard.await.unwrap();
            assert!(confirmed ^ expired, "exactly one participant must win");

            let outcome = ticket.wait().await;
            if confirmed {
                assert_eq!(outcome, StopOutcome::Confirmed);
            } else {
                assert_eq!(outcome, StopOutcome::TimedOut);
                // The losing listener call saw no pending wait
                assert_eq!(server.state(), ServerState::Unavailable);
            }
            assert!(!server.is_stop_pending());
        }
    }
}
