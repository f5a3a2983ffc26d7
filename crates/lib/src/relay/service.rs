//! Relay event loop: one task owns the `SessionRelay` and applies commands in order.

use super::event::{RelayEvent, SessionId};
use super::registry::{Connection, ConnectionId, RelayStats, SessionRelay, SubscriptionHandle};
use crate::session::Snapshot;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// The relay task is no longer running.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("relay is closed")]
    Closed,
}

enum Command {
    Subscribe {
        session_id: SessionId,
        conn: Connection,
        reply: oneshot::Sender<SubscriptionHandle>,
    },
    Unsubscribe(SubscriptionHandle),
    Publish {
        session_id: SessionId,
        origin: Option<ConnectionId>,
        event: RelayEvent,
    },
    Snapshot {
        session_id: SessionId,
        user_id: String,
        reply: oneshot::Sender<Snapshot>,
    },
    Stats(oneshot::Sender<RelayStats>),
    Shutdown,
}

/// Cloneable handle to the relay task.
#[derive(Clone)]
pub struct RelayHandle {
    tx: mpsc::UnboundedSender<Command>,
}

/// Start the relay task. It runs until `shutdown` is called or every handle is dropped.
pub fn spawn_relay(relay: SessionRelay) -> (RelayHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(run(relay, rx));
    (RelayHandle { tx }, task)
}

/// How often idle tallies are checked, derived from the retention period.
fn sweep_period(retention: Duration) -> Duration {
    retention.clamp(Duration::from_secs(1), Duration::from_secs(60))
}

async fn run(mut relay: SessionRelay, mut rx: mpsc::UnboundedReceiver<Command>) {
    let mut sweep = tokio::time::interval(sweep_period(relay.policy().tally_retention));
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            cmd = rx.recv() => {
                let Some(cmd) = cmd else { break };
                if !apply(&mut relay, cmd) {
                    break;
                }
            }
            _ = sweep.tick() => {
                let evicted = relay.evict_idle(Instant::now());
                if evicted > 0 {
                    log::debug!("relay: evicted {} idle session tally(s)", evicted);
                }
            }
        }
    }
    log::debug!("relay task stopped");
}

/// Apply one command. Returns false once the relay has shut down.
fn apply(relay: &mut SessionRelay, cmd: Command) -> bool {
    match cmd {
        Command::Subscribe {
            session_id,
            conn,
            reply,
        } => {
            let handle = relay.subscribe(&session_id, conn);
            if let Err(handle) = reply.send(handle) {
                // Caller went away before hearing back.
                relay.unsubscribe(&handle);
            }
        }
        Command::Unsubscribe(handle) => {
            relay.unsubscribe(&handle);
        }
        Command::Publish {
            session_id,
            origin,
            event,
        } => {
            let delivered = relay.publish(&session_id, origin, &event);
            log::debug!(
                "relay: {} in session {} delivered to {} subscriber(s)",
                event.kind(),
                session_id,
                delivered
            );
        }
        Command::Snapshot {
            session_id,
            user_id,
            reply,
        } => {
            let _ = reply.send(relay.snapshot(&session_id, &user_id));
        }
        Command::Stats(reply) => {
            let _ = reply.send(relay.stats());
        }
        Command::Shutdown => {
            relay.shutdown();
            return false;
        }
    }
    true
}

impl RelayHandle {
    pub async fn subscribe(
        &self,
        session_id: impl Into<SessionId>,
        conn: Connection,
    ) -> Result<SubscriptionHandle, RelayError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Subscribe {
            session_id: session_id.into(),
            conn,
            reply,
        })?;
        rx.await.map_err(|_| RelayError::Closed)
    }

    /// Fire-and-forget; a second call for the same handle is a no-op in the relay.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), RelayError> {
        self.send(Command::Unsubscribe(handle))
    }

    /// Fire-and-forget: delivery failures are handled inside the relay.
    pub fn publish(
        &self,
        session_id: impl Into<SessionId>,
        origin: Option<ConnectionId>,
        event: RelayEvent,
    ) -> Result<(), RelayError> {
        self.send(Command::Publish {
            session_id: session_id.into(),
            origin,
            event,
        })
    }

    pub async fn snapshot(
        &self,
        session_id: impl Into<SessionId>,
        user_id: impl Into<String>,
    ) -> Result<Snapshot, RelayError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot {
            session_id: session_id.into(),
            user_id: user_id.into(),
            reply,
        })?;
        rx.await.map_err(|_| RelayError::Closed)
    }

    pub async fn stats(&self) -> Result<RelayStats, RelayError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stats(reply))?;
        rx.await.map_err(|_| RelayError::Closed)
    }

    /// Send the shutdown frame to every subscriber and stop the relay task.
    pub fn shutdown(&self) -> Result<(), RelayError> {
        self.send(Command::Shutdown)
    }

    fn send(&self, cmd: Command) -> Result<(), RelayError> {
        self.tx.send(cmd).map_err(|_| RelayError::Closed)
    }
}
