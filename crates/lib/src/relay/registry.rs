//! Subscriber registry: live connections per session and event fan-out.
//!
//! `SessionRelay` is plain data mutated through `&mut self`. It is owned by the relay
//! task (see `service`), which serializes every operation, so it needs no locks.

use super::event::{RelayEvent, SessionId};
use crate::session::{empty_snapshot, SessionTally, Snapshot};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Identity of one live connection (assigned by the gateway on upgrade).
pub type ConnectionId = uuid::Uuid;

/// Frame sent to every subscriber when the relay shuts down.
pub const SHUTDOWN_FRAME: &str = r#"{"type":"shutdown"}"#;

/// A live connection about to be subscribed: who it is and where its frames go.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: ConnectionId,
    pub user_id: String,
    /// Outbound queue drained by the connection's socket task.
    pub outbox: mpsc::Sender<String>,
}

impl Connection {
    pub fn new(user_id: impl Into<String>, outbox: mpsc::Sender<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            user_id: user_id.into(),
            outbox,
        }
    }
}

/// Returned by subscribe; pass back to unsubscribe.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub session_id: SessionId,
    pub connection_id: ConnectionId,
}

/// Fan-out policy knobs (from `relay.echoToSender`, `relay.snapshotOnSubscribe` and
/// `relay.tallyRetentionSecs`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayPolicy {
    /// Deliver an event back to the connection that published it.
    pub echo_to_sender: bool,
    /// Queue a snapshot frame to a new subscriber before registering it.
    pub snapshot_on_subscribe: bool,
    /// How long a session's tally outlives its last subscriber.
    pub tally_retention: Duration,
}

impl Default for RelayPolicy {
    fn default() -> Self {
        Self {
            echo_to_sender: false,
            snapshot_on_subscribe: true,
            tally_retention: Duration::from_secs(600),
        }
    }
}

/// Counts reported by the health endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub sessions: usize,
    pub subscribers: usize,
}

#[derive(Debug)]
struct Subscriber {
    user_id: String,
    outbox: mpsc::Sender<String>,
}

/// Sessions → subscribers, plus the tally behind catch-up snapshots.
#[derive(Debug, Default)]
pub struct SessionRelay {
    policy: RelayPolicy,
    /// Insertion order is kept so fan-out order is stable.
    sessions: HashMap<SessionId, Vec<(ConnectionId, Subscriber)>>,
    /// connection → session it is subscribed to.
    membership: HashMap<ConnectionId, SessionId>,
    tallies: HashMap<SessionId, SessionTally>,
    /// Sessions whose tally is kept but that have no subscribers, and since when.
    idle_since: HashMap<SessionId, Instant>,
}

impl SessionRelay {
    pub fn new(policy: RelayPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    pub fn policy(&self) -> RelayPolicy {
        self.policy
    }

    /// Register `conn` under `session_id`. Subscribing the same connection to the same
    /// session again returns the existing handle; subscribing it to another session
    /// moves it there.
    pub fn subscribe(&mut self, session_id: &str, conn: Connection) -> SubscriptionHandle {
        let handle = SubscriptionHandle {
            session_id: session_id.to_string(),
            connection_id: conn.id,
        };
        match self.membership.get(&conn.id).cloned() {
            Some(current) if current == session_id => return handle,
            Some(current) => {
                let previous = SubscriptionHandle {
                    session_id: current,
                    connection_id: conn.id,
                };
                log::debug!(
                    "relay: moving connection {} from session {} to {}",
                    conn.id,
                    previous.session_id,
                    session_id
                );
                self.unsubscribe(&previous);
            }
            None => {}
        }

        if self.policy.snapshot_on_subscribe {
            let frame = self.snapshot(session_id, &conn.user_id).to_frame();
            if let Err(e) = conn.outbox.try_send(frame) {
                // Same rule as a failed publish: the connection is not registered and
                // dropping its outbox closes it.
                log::warn!(
                    "relay: snapshot not queued for {} in session {}, not subscribing: {}",
                    conn.id,
                    session_id,
                    e
                );
                return handle;
            }
        }

        self.idle_since.remove(session_id);
        self.membership.insert(conn.id, session_id.to_string());
        self.sessions.entry(session_id.to_string()).or_default().push((
            conn.id,
            Subscriber {
                user_id: conn.user_id,
                outbox: conn.outbox,
            },
        ));
        log::debug!("relay: {} subscribed to session {}", conn.id, session_id);
        handle
    }

    /// Remove the subscription. Returns false when it was already gone.
    pub fn unsubscribe(&mut self, handle: &SubscriptionHandle) -> bool {
        if self.membership.get(&handle.connection_id) != Some(&handle.session_id) {
            return false;
        }
        self.membership.remove(&handle.connection_id);
        self.remove_from_session(&handle.session_id, handle.connection_id);
        log::debug!(
            "relay: {} unsubscribed from session {}",
            handle.connection_id,
            handle.session_id
        );
        true
    }

    /// Hand `event` to every subscriber of `session_id` (skipping `origin` unless echo
    /// is on). Subscribers whose queue is full or closed are removed; the rest still
    /// get the event. Returns how many subscribers the event was queued for.
    pub fn publish(
        &mut self,
        session_id: &str,
        origin: Option<ConnectionId>,
        event: &RelayEvent,
    ) -> usize {
        if self.may_tally(session_id, origin, event) {
            if let Some(tally) = self.tallies.get_mut(session_id) {
                tally.apply(event);
            } else if self.sessions.contains_key(session_id) {
                self.tallies
                    .entry(session_id.to_string())
                    .or_default()
                    .apply(event);
            }
        }

        let Some(subscribers) = self.sessions.get(session_id) else {
            return 0;
        };

        let frame = event.to_frame();
        let mut delivered = 0;
        let mut failed = Vec::new();
        for (id, sub) in subscribers {
            if !self.policy.echo_to_sender && Some(*id) == origin {
                continue;
            }
            match sub.outbox.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    log::warn!(
                        "relay: dropping slow subscriber {} ({}) in session {}",
                        id,
                        sub.user_id,
                        session_id
                    );
                    failed.push(*id);
                }
                Err(TrySendError::Closed(_)) => {
                    log::debug!("relay: subscriber {} is gone, removing", id);
                    failed.push(*id);
                }
            }
        }

        for id in failed {
            self.membership.remove(&id);
            self.remove_from_session(session_id, id);
        }
        delivered
    }

    /// Whether `event` may change the session tally. A vote published by a connection
    /// only counts when it is cast as the user that connection joined as; the event is
    /// still relayed either way.
    fn may_tally(&self, session_id: &str, origin: Option<ConnectionId>, event: &RelayEvent) -> bool {
        let (Some(origin), RelayEvent::Vote(vote)) = (origin, event) else {
            return true;
        };
        let joined_as = self
            .sessions
            .get(session_id)
            .and_then(|subs| subs.iter().find(|(id, _)| *id == origin))
            .map(|(_, sub)| sub.user_id.as_str());
        if joined_as == Some(vote.user_id.as_str()) {
            return true;
        }
        log::warn!(
            "relay: {} in session {} voted as {:?} but joined as {:?}; not counted",
            origin,
            session_id,
            vote.user_id,
            joined_as
        );
        false
    }

    /// Drop tallies of sessions that have had no subscribers for longer than the
    /// retention period. Returns how many were dropped.
    pub fn evict_idle(&mut self, now: Instant) -> usize {
        let retention = self.policy.tally_retention;
        let expired: Vec<SessionId> = self
            .idle_since
            .iter()
            .filter(|(_, since)| now.saturating_duration_since(**since) >= retention)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            self.idle_since.remove(id);
            self.tallies.remove(id);
            log::debug!("relay: dropped idle tally for session {}", id);
        }
        expired.len()
    }

    /// Number of sessions with a tally, including idle ones.
    pub fn tally_count(&self) -> usize {
        self.tallies.len()
    }

    /// Current cards, counts and `user_id`'s own votes for a session.
    pub fn snapshot(&self, session_id: &str, user_id: &str) -> Snapshot {
        match self.tallies.get(session_id) {
            Some(tally) => tally.snapshot(session_id, user_id),
            None => empty_snapshot(session_id),
        }
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            sessions: self.sessions.len(),
            subscribers: self.membership.len(),
        }
    }

    /// Number of subscribers currently registered for a session.
    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.sessions.get(session_id).map_or(0, Vec::len)
    }

    /// Tell every subscriber the relay is going away, then drop all subscriptions.
    /// Dropping the outbox senders ends each connection's send loop.
    pub fn shutdown(&mut self) {
        for (_, sub) in self.sessions.values().flatten() {
            let _ = sub.outbox.try_send(SHUTDOWN_FRAME.to_string());
        }
        self.sessions.clear();
        self.membership.clear();
        self.tallies.clear();
        self.idle_since.clear();
    }

    fn remove_from_session(&mut self, session_id: &str, connection_id: ConnectionId) {
        if let Some(subscribers) = self.sessions.get_mut(session_id) {
            subscribers.retain(|(id, _)| *id != connection_id);
            if subscribers.is_empty() {
                self.sessions.remove(session_id);
                if self.tallies.contains_key(session_id) {
                    self.idle_since.insert(session_id.to_string(), Instant::now());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::Card;

    fn connect(user: &str) -> (Connection, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(16);
        (Connection::new(user, tx), rx)
    }

    fn no_snapshot() -> RelayPolicy {
        RelayPolicy {
            echo_to_sender: false,
            snapshot_on_subscribe: false,
            ..RelayPolicy::default()
        }
    }

    fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<serde_json::Value> {
        let mut out = Vec::new();
        while let Ok(text) = rx.try_recv() {
            out.push(serde_json::from_str(&text).unwrap());
        }
        out
    }

    #[test]
    fn vote_reaches_other_subscriber_but_not_origin() {
        let mut relay = SessionRelay::new(no_snapshot());
        let (a, mut rx_a) = connect("u1");
        let (b, mut rx_b) = connect("u2");
        let a_id = a.id;
        relay.subscribe("sess-1", a);
        relay.subscribe("sess-1", b);

        let delivered = relay.publish("sess-1", Some(a_id), &RelayEvent::vote("c1", "u1", true));

        assert_eq!(delivered, 1);
        assert_eq!(
            drain(&mut rx_b),
            vec![serde_json::json!({"type": "vote", "card_id": "c1", "user_id": "u1", "vote": true})]
        );
        assert!(drain(&mut rx_a).is_empty());
    }

    #[test]
    fn echo_policy_delivers_to_origin_too() {
        let mut relay = SessionRelay::new(RelayPolicy {
            echo_to_sender: true,
            snapshot_on_subscribe: false,
            ..RelayPolicy::default()
        });
        let (a, mut rx_a) = connect("u1");
        let (b, mut rx_b) = connect("u2");
        let a_id = a.id;
        relay.subscribe("sess-1", a);
        relay.subscribe("sess-1", b);

        let event = RelayEvent::vote("c1", "u1", true);
        assert_eq!(relay.publish("sess-1", Some(a_id), &event), 2);

        let expected = serde_json::to_value(&event).unwrap();
        assert_eq!(drain(&mut rx_a), vec![expected.clone()]);
        assert_eq!(drain(&mut rx_b), vec![expected]);
    }

    #[test]
    fn events_never_cross_sessions() {
        let mut relay = SessionRelay::new(no_snapshot());
        let (a, _rx_a) = connect("u1");
        let (b, mut rx_b) = connect("u2");
        let (c, mut rx_c) = connect("u3");
        let a_id = a.id;
        relay.subscribe("s1", a);
        relay.subscribe("s1", b);
        relay.subscribe("s2", c);

        relay.publish("s1", Some(a_id), &RelayEvent::vote("c1", "u1", true));
        relay.publish("s1", None, &RelayEvent::card_added(Card::new("c2")));

        assert_eq!(drain(&mut rx_b).len(), 2);
        assert!(drain(&mut rx_c).is_empty());
    }

    #[test]
    fn unsubscribed_connection_gets_nothing_more() {
        let mut relay = SessionRelay::new(no_snapshot());
        let (a, _rx_a) = connect("u1");
        let (b, mut rx_b) = connect("u2");
        let a_id = a.id;
        relay.subscribe("sess-1", a);
        let handle_b = relay.subscribe("sess-1", b);

        relay.publish("sess-1", Some(a_id), &RelayEvent::vote("c1", "u1", true));
        assert_eq!(drain(&mut rx_b).len(), 1);

        assert!(relay.unsubscribe(&handle_b));
        relay.publish("sess-1", Some(a_id), &RelayEvent::vote("c1", "u1", false));
        relay.publish("sess-1", None, &RelayEvent::vote("c2", "u1", true));
        assert!(drain(&mut rx_b).is_empty());
    }

    #[test]
    fn unsubscribe_twice_is_noop() {
        let mut relay = SessionRelay::new(no_snapshot());
        let (a, _rx) = connect("u1");
        let handle = relay.subscribe("sess-1", a);

        assert!(relay.unsubscribe(&handle));
        assert!(!relay.unsubscribe(&handle));
        assert_eq!(relay.stats(), RelayStats::default());
    }

    #[test]
    fn subscribe_is_idempotent_per_connection() {
        let mut relay = SessionRelay::new(no_snapshot());
        let (a, _rx_a) = connect("u1");
        let (b, mut rx_b) = connect("u2");
        let first = relay.subscribe("sess-1", b.clone());
        let second = relay.subscribe("sess-1", b);
        assert_eq!(first, second);
        assert_eq!(relay.subscriber_count("sess-1"), 1);

        relay.publish("sess-1", Some(a.id), &RelayEvent::vote("c1", "u1", true));
        assert_eq!(drain(&mut rx_b).len(), 1);
    }

    #[test]
    fn resubscribing_elsewhere_moves_the_connection() {
        let mut relay = SessionRelay::new(no_snapshot());
        let (a, mut rx_a) = connect("u1");
        let old = relay.subscribe("s1", a.clone());
        relay.subscribe("s2", a);

        assert!(!relay.unsubscribe(&old));
        relay.publish("s1", None, &RelayEvent::vote("c1", "u9", true));
        assert!(drain(&mut rx_a).is_empty());
        relay.publish("s2", None, &RelayEvent::vote("c1", "u9", true));
        assert_eq!(drain(&mut rx_a).len(), 1);
    }

    #[test]
    fn votes_are_not_deduplicated() {
        let mut relay = SessionRelay::new(no_snapshot());
        let (watcher, mut rx) = connect("observer");
        relay.subscribe("sess-1", watcher);

        let voters: Vec<_> = (0..5).map(|i| connect(&format!("u{}", i))).collect();
        for (conn, _) in &voters {
            relay.subscribe("sess-1", conn.clone());
        }
        for (conn, _) in &voters {
            relay.publish(
                "sess-1",
                Some(conn.id),
                &RelayEvent::vote("c1", conn.user_id.clone(), true),
            );
        }

        let got = drain(&mut rx);
        assert_eq!(got.len(), 5);
        assert!(got.iter().all(|v| v["card_id"] == "c1"));
    }

    #[test]
    fn publish_to_unknown_session_is_noop() {
        let mut relay = SessionRelay::new(no_snapshot());
        assert_eq!(relay.publish("nobody", None, &RelayEvent::vote("c1", "u1", true)), 0);
        assert_eq!(relay.publish("nobody", None, &RelayEvent::card_added(Card::new("c1"))), 0);
        assert_eq!(relay.stats().sessions, 0);
        assert_eq!(relay.tally_count(), 0);
        let snap = relay.snapshot("nobody", "u1");
        assert!(snap.cards.is_empty());
        assert!(snap.counts.is_empty());
        assert!(snap.votes.is_empty());
    }

    #[test]
    fn closed_subscriber_is_removed_and_others_still_receive() {
        let mut relay = SessionRelay::new(no_snapshot());
        let (gone, rx_gone) = connect("u1");
        let (b, mut rx_b) = connect("u2");
        relay.subscribe("sess-1", gone);
        relay.subscribe("sess-1", b);
        drop(rx_gone);

        assert_eq!(relay.publish("sess-1", None, &RelayEvent::vote("c1", "u3", true)), 1);
        assert_eq!(drain(&mut rx_b).len(), 1);
        assert_eq!(relay.subscriber_count("sess-1"), 1);
    }

    #[test]
    fn full_queue_removes_slow_subscriber() {
        let mut relay = SessionRelay::new(no_snapshot());
        let (tx, mut rx_slow) = mpsc::channel(1);
        let slow = Connection::new("slow", tx);
        let (b, mut rx_b) = connect("u2");
        relay.subscribe("sess-1", slow);
        relay.subscribe("sess-1", b);

        relay.publish("sess-1", None, &RelayEvent::vote("c1", "u3", true));
        relay.publish("sess-1", None, &RelayEvent::vote("c1", "u4", true));

        assert_eq!(relay.subscriber_count("sess-1"), 1);
        assert_eq!(drain(&mut rx_b).len(), 2);
        assert_eq!(drain(&mut rx_slow).len(), 1);
    }

    #[test]
    fn subscribe_queues_snapshot_first() {
        let mut relay = SessionRelay::new(RelayPolicy::default());
        let (host, _rx_host) = connect("host");
        relay.subscribe("sess-1", host);
        relay.publish("sess-1", None, &RelayEvent::card_added(Card::new("c1")));
        relay.publish("sess-1", None, &RelayEvent::vote("c1", "u1", true));
        relay.publish("sess-1", None, &RelayEvent::vote("c1", "u2", false));

        let (a, mut rx_a) = connect("u1");
        relay.subscribe("sess-1", a);
        relay.publish("sess-1", None, &RelayEvent::vote("c1", "u3", true));

        let frames = drain(&mut rx_a);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0]["type"], "snapshot");
        assert_eq!(frames[0]["cards"][0]["id"], "c1");
        assert_eq!(frames[0]["counts"]["c1"]["yes"], 1);
        assert_eq!(frames[0]["counts"]["c1"]["no"], 1);
        assert_eq!(frames[0]["votes"]["c1"], true);
        assert_eq!(frames[1]["user_id"], "u3");
    }

    #[test]
    fn publishes_to_many_unjoined_sessions_leave_no_state() {
        let mut relay = SessionRelay::new(no_snapshot());
        for i in 0..1000 {
            let session = format!("ghost-{}", i);
            relay.publish(&session, None, &RelayEvent::card_added(Card::new("c1")));
            relay.publish(&session, None, &RelayEvent::vote("c1", "u1", true));
        }
        assert_eq!(relay.tally_count(), 0);
        assert_eq!(relay.stats(), RelayStats::default());
        assert!(relay.snapshot("ghost-7", "u1").cards.is_empty());
    }

    #[test]
    fn vote_cast_as_another_user_is_relayed_but_not_counted() {
        let mut relay = SessionRelay::new(no_snapshot());
        let (mallory, _rx_m) = connect("mallory");
        let (alice, mut rx_alice) = connect("alice");
        let mallory_id = mallory.id;
        let alice_id = alice.id;
        relay.subscribe("s", mallory);
        relay.subscribe("s", alice);

        relay.publish("s", Some(alice_id), &RelayEvent::vote("c1", "alice", true));
        let forged = RelayEvent::vote("c1", "alice", false);
        assert_eq!(relay.publish("s", Some(mallory_id), &forged), 1);

        assert_eq!(
            drain(&mut rx_alice),
            vec![serde_json::to_value(&forged).unwrap()]
        );
        let snap = relay.snapshot("s", "alice");
        assert_eq!(snap.votes.get("c1"), Some(&true));
        assert_eq!(snap.counts["c1"].yes, 1);
        assert_eq!(snap.counts["c1"].no, 0);

        relay.publish("s", Some(mallory_id), &RelayEvent::vote("c1", "mallory", false));
        assert_eq!(relay.snapshot("s", "mallory").counts["c1"].no, 1);
    }

    #[test]
    fn vote_from_unsubscribed_origin_is_not_counted() {
        let mut relay = SessionRelay::new(no_snapshot());
        let (a, _rx_a) = connect("u1");
        relay.subscribe("s", a);
        let stranger = uuid::Uuid::new_v4();

        relay.publish("s", Some(stranger), &RelayEvent::vote("c1", "u1", true));
        assert!(relay.snapshot("s", "u1").counts.is_empty());
    }

    #[test]
    fn idle_tally_is_kept_until_retention_passes() {
        let mut relay = SessionRelay::new(no_snapshot());
        let retention = relay.policy().tally_retention;
        let (a, _rx_a) = connect("u1");
        let handle = relay.subscribe("s", a.clone());
        relay.publish("s", Some(a.id), &RelayEvent::vote("c1", "u1", true));
        relay.unsubscribe(&handle);

        assert_eq!(relay.evict_idle(Instant::now()), 0);
        assert_eq!(relay.snapshot("s", "u1").counts["c1"].yes, 1);

        assert_eq!(relay.evict_idle(Instant::now() + retention), 1);
        assert_eq!(relay.tally_count(), 0);
        assert!(relay.snapshot("s", "u1").counts.is_empty());
    }

    #[test]
    fn resubscribing_cancels_eviction() {
        let mut relay = SessionRelay::new(no_snapshot());
        let retention = relay.policy().tally_retention;
        let (a, _rx_a) = connect("u1");
        let handle = relay.subscribe("s", a.clone());
        relay.publish("s", Some(a.id), &RelayEvent::vote("c1", "u1", true));
        relay.unsubscribe(&handle);

        let (b, _rx_b) = connect("u2");
        relay.subscribe("s", b);
        assert_eq!(relay.evict_idle(Instant::now() + retention), 0);
        assert_eq!(relay.snapshot("s", "u1").counts["c1"].yes, 1);
    }

    #[test]
    fn failed_snapshot_delivery_skips_registration() {
        let mut relay = SessionRelay::new(RelayPolicy::default());
        let (gone, rx_gone) = connect("u1");
        drop(rx_gone);

        let handle = relay.subscribe("sess-1", gone);

        assert_eq!(relay.subscriber_count("sess-1"), 0);
        assert_eq!(relay.stats(), RelayStats::default());
        assert!(!relay.unsubscribe(&handle));
    }

    #[test]
    fn full_queue_at_subscribe_skips_registration() {
        let mut relay = SessionRelay::new(RelayPolicy::default());
        let (tx, _rx) = mpsc::channel(1);
        tx.try_send("backlog".to_string()).unwrap();

        relay.subscribe("sess-1", Connection::new("u1", tx));

        assert_eq!(relay.subscriber_count("sess-1"), 0);
    }

    #[test]
    fn shutdown_notifies_and_clears() {
        let mut relay = SessionRelay::new(no_snapshot());
        let (a, mut rx_a) = connect("u1");
        relay.subscribe("sess-1", a);

        relay.shutdown();

        assert_eq!(relay.stats(), RelayStats::default());
        assert_eq!(rx_a.try_recv().unwrap(), SHUTDOWN_FRAME);
    }
}
