//! Session relay: accepts vote and card events for a session and rebroadcasts them
//! to the other connections subscribed to that session.
//!
//! All mutation happens in one task (`spawn_relay`); connections talk to it through
//! a cloneable `RelayHandle`.

mod event;
mod registry;
mod service;

pub use event::{Card, CardAddedEvent, RelayEvent, SessionId, VoteEvent};
pub use registry::{
    Connection, ConnectionId, RelayPolicy, RelayStats, SessionRelay, SubscriptionHandle,
    SHUTDOWN_FRAME,
};
pub use service::{spawn_relay, RelayError, RelayHandle};
