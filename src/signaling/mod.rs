//! WebSocket-facing actors: room signaling and user notifications.

pub mod presence;
pub mod protocol;
pub mod room_hub;

use std::sync::Arc;

use crate::groups::GroupLayer;
use crate::identity::IdentityResolver;
use crate::room::RoomRegistry;

pub use presence::{Notifier, PresenceHub, PresenceState};
pub use protocol::{decode_room_message, Inbound, MediaKind, RoomRequest};
pub use room_hub::RoomHub;

/// Collaborators shared by every connection.
#[derive(Clone)]
pub struct SignalingContext {
    pub registry: Arc<RoomRegistry>,
    pub groups: Arc<dyn GroupLayer>,
    pub identity: Arc<dyn IdentityResolver>,
}

impl SignalingContext {
    pub fn notifier(&self) -> Notifier {
        Notifier::new(self.groups.clone())
    }
}
