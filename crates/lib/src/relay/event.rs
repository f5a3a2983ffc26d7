//! Relay event types: the payloads clients publish and receive.

use serde::{Deserialize, Serialize};

/// Unique session identifier (opaque string).
pub type SessionId = String;

/// Event accepted from one connection and rebroadcast to the rest of its session.
///
/// Wire shape: `{"type":"vote",...}` or `{"type":"card_added",...}`. The session is
/// implied by the connection and is never read from the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayEvent {
    Vote(VoteEvent),
    CardAdded(CardAddedEvent),
}

/// One user's yes/no vote on a card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteEvent {
    pub card_id: String,
    pub user_id: String,
    pub vote: bool,
}

/// A card was added to the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardAddedEvent {
    pub card: Card,
}

/// A card as broadcast to clients: a string id plus whatever other fields the
/// client sent, kept verbatim and in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Card {
    pub id: String,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl RelayEvent {
    pub fn vote(card_id: impl Into<String>, user_id: impl Into<String>, vote: bool) -> Self {
        RelayEvent::Vote(VoteEvent {
            card_id: card_id.into(),
            user_id: user_id.into(),
            vote,
        })
    }

    pub fn card_added(card: Card) -> Self {
        RelayEvent::CardAdded(CardAddedEvent { card })
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayEvent::Vote(_) => "vote",
            RelayEvent::CardAdded(_) => "card_added",
        }
    }

    /// JSON text frame for this event.
    pub fn to_frame(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl Card {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: serde_json::Map::new(),
        }
    }

    /// Builder-style helper to attach an extra field.
    pub fn with_field(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }
}
