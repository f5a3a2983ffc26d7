//! Per-session vote tally used for catch-up snapshots.
//!
//! The relay does not persist anything; the tally only remembers enough of the
//! events it has relayed (cards, latest vote per user) to let a new subscriber
//! start from the current state instead of racing its own initial fetch.

use crate::relay::{Card, RelayEvent, SessionId, VoteEvent};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Yes/no counts for one card.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteCount {
    pub yes: u64,
    pub no: u64,
}

/// Catch-up frame: `{"type":"snapshot","session_id",...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(rename = "type")]
    pub typ: String,
    pub session_id: SessionId,
    pub cards: Vec<Card>,
    pub counts: BTreeMap<String, VoteCount>,
    /// The requesting user's own votes (card id → vote).
    pub votes: BTreeMap<String, bool>,
    /// RFC 3339 time the snapshot was taken.
    pub taken_at: String,
}

impl Snapshot {
    pub fn to_frame(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Cards and latest votes seen for one session.
#[derive(Debug, Clone, Default)]
pub struct SessionTally {
    cards: Vec<Card>,
    /// (card_id, user_id) → latest vote.
    votes: HashMap<(String, String), bool>,
}

impl SessionTally {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one relayed event into the tally.
    pub fn apply(&mut self, event: &RelayEvent) {
        match event {
            RelayEvent::Vote(VoteEvent {
                card_id,
                user_id,
                vote,
            }) => {
                self.votes.insert((card_id.clone(), user_id.clone()), *vote);
            }
            RelayEvent::CardAdded(added) => {
                match self.cards.iter_mut().find(|c| c.id == added.card.id) {
                    Some(existing) => *existing = added.card.clone(),
                    None => self.cards.push(added.card.clone()),
                }
            }
        }
    }

    pub fn cards(&self) -> &[Card] {
        &self.cards
    }

    /// Counts derived from the latest vote of each user, so a changed vote moves
    /// between yes and no instead of being counted twice.
    pub fn counts(&self) -> BTreeMap<String, VoteCount> {
        let mut counts: BTreeMap<String, VoteCount> = BTreeMap::new();
        for ((card_id, _), vote) in &self.votes {
            let entry = counts.entry(card_id.clone()).or_default();
            if *vote {
                entry.yes += 1;
            } else {
                entry.no += 1;
            }
        }
        counts
    }

    /// Votes cast by one user.
    pub fn votes_of(&self, user_id: &str) -> BTreeMap<String, bool> {
        self.votes
            .iter()
            .filter(|((_, user), _)| user == user_id)
            .map(|((card, _), vote)| (card.clone(), *vote))
            .collect()
    }

    pub fn snapshot(&self, session_id: &str, user_id: &str) -> Snapshot {
        Snapshot {
            typ: "snapshot".to_string(),
            session_id: session_id.to_string(),
            cards: self.cards.clone(),
            counts: self.counts(),
            votes: self.votes_of(user_id),
            taken_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Snapshot for a session the relay has never seen.
pub fn empty_snapshot(session_id: &str) -> Snapshot {
    SessionTally::new().snapshot(session_id, "")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_follow_latest_vote_per_user() {
        let mut tally = SessionTally::new();
        tally.apply(&RelayEvent::vote("c1", "u1", true));
        tally.apply(&RelayEvent::vote("c1", "u2", true));
        tally.apply(&RelayEvent::vote("c1", "u1", false));
        tally.apply(&RelayEvent::vote("c2", "u2", false));

        let counts = tally.counts();
        assert_eq!(counts["c1"], VoteCount { yes: 1, no: 1 });
        assert_eq!(counts["c2"], VoteCount { yes: 0, no: 1 });
    }

    #[test]
    fn votes_of_returns_only_that_user() {
        let mut tally = SessionTally::new();
        tally.apply(&RelayEvent::vote("c1", "u1", true));
        tally.apply(&RelayEvent::vote("c2", "u2", false));

        let mine = tally.votes_of("u1");
        assert_eq!(mine.len(), 1);
        assert_eq!(mine.get("c1"), Some(&true));
    }

    #[test]
    fn repeated_card_id_replaces_in_place() {
        let mut tally = SessionTally::new();
        tally.apply(&RelayEvent::card_added(Card::new("a")));
        tally.apply(&RelayEvent::card_added(Card::new("b")));
        tally.apply(&RelayEvent::card_added(
            Card::new("a").with_field("title", serde_json::json!("renamed")),
        ));

        let ids: Vec<&str> = tally.cards().iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(tally.cards()[0].fields["title"], "renamed");
    }

    #[test]
    fn empty_snapshot_has_no_cards_or_counts() {
        let snap = empty_snapshot("sess-x");
        assert_eq!(snap.typ, "snapshot");
        assert_eq!(snap.session_id, "sess-x");
        assert!(snap.cards.is_empty());
        assert!(snap.counts.is_empty());
        assert!(snap.votes.is_empty());
    }
}
