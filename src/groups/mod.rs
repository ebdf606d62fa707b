//! Group fan-out: named sets of live connections.
//!
//! Each connection owns a [`Member`] (an id plus an inbox). Publishing to a
//! group delivers the event to the inbox of every member currently joined.
//! Delivery order is only guaranteed per publisher.

pub mod local;
pub mod nats;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

pub use local::LocalGroups;
pub use nats::{NatsConnection, NatsGroups};

pub type MemberId = uuid::Uuid;

/// Events carried through a group. The tag tells the receiving connection
/// which addressing rule to apply before forwarding `data` to its client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum GroupEvent {
    /// Forward to every room member as is.
    Emit(Value),
    /// Forward only to the member bound to `data.receiver`.
    SendSdp(Value),
    /// Forward to every bound member except `data.sender`.
    SendToOthers(Value),
    /// Forward to a signed user notification socket.
    EmitEvent(Value),
}

#[derive(Debug, Error)]
pub enum GroupError {
    #[error("Group layer unavailable")]
    Unavailable,

    #[error("Group layer failed: {0}")]
    Backend(String),

    #[error("Group event could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Addressable handle for one connection.
#[derive(Debug, Clone)]
pub struct Member {
    id: MemberId,
    inbox: mpsc::UnboundedSender<GroupEvent>,
}

impl Member {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<GroupEvent>) {
        let (inbox, rx) = mpsc::unbounded_channel();
        (
            Self {
                id: uuid::Uuid::new_v4(),
                inbox,
            },
            rx,
        )
    }

    pub fn id(&self) -> MemberId {
        self.id
    }

    /// Returns `false` once the connection's receiver is gone.
    pub fn deliver(&self, event: GroupEvent) -> bool {
        self.inbox.send(event).is_ok()
    }
}

/// Pub/sub port used by the connection hubs.
#[async_trait]
pub trait GroupLayer: Send + Sync {
    async fn join(&self, group: &str, member: &Member) -> Result<(), GroupError>;

    async fn leave(&self, group: &str, member: MemberId) -> Result<(), GroupError>;

    async fn publish(&self, group: &str, event: GroupEvent) -> Result<(), GroupError>;
}

/// Group of a user's notification sockets.
pub fn user_group(user_id: &str) -> String {
    format!("message_user-{}", user_id)
}

/// Group of a room's signaling sockets.
pub fn room_group(room_name: &str) -> String {
    format!("room-{}", room_name)
}
