//! One-shot completion signal for stop orchestration
//!
//! A stop caller holds a [`StopTicket`] while the matching [`StopWaiter`] sits in the
//! server's slot. Whoever removes the waiter from the slot (the listener on `"stopped"`,
//! or the timeout guard) completes it; `oneshot::Sender::send` consumes the waiter, so a
//! second completion cannot be expressed.

use tokio::sync::oneshot;
use tracing::debug;

/// How a stop-wait ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The agent reported `"stopped"` while the wait was pending
    Confirmed,
    /// The timeout guard fired first
    TimedOut,
    /// The waiter was discarded without completion (server removed from the registry)
    Abandoned,
}

/// Completion side of a pending stop, stored in the server's slot
#[derive(Debug)]
pub struct StopWaiter {
    id: u64,
    tx: oneshot::Sender<StopOutcome>,
}

/// Caller side of a pending stop
#[derive(Debug)]
pub struct StopTicket {
    id: u64,
    rx: oneshot::Receiver<StopOutcome>,
}

/// Arm a fresh waiter/ticket pair with the given generation id
pub fn arm(id: u64) -> (StopWaiter, StopTicket) {
    let (tx, rx) = oneshot::channel();
    (StopWaiter { id, tx }, StopTicket { id, rx })
}

impl StopWaiter {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Release the blocked caller
    ///
    /// Returns false if the caller already went away.
    pub fn complete(self, outcome: StopOutcome) -> bool {
        let id = self.id;
        if self.tx.send(outcome).is_err() {
            debug!(stop_id = id, ?outcome, "Stop caller dropped before completion");
            return false;
        }
        true
    }
}

impl StopTicket {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the stop to complete
    pub async fn wait(self) -> StopOutcome {
        self.rx.await.unwrap_or(StopOutcome::Abandoned)
    }
}
