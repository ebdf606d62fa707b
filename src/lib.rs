//! Room signaling core for a WebRTC video-meeting service.
//!
//! Clients connect to a room socket, authenticate with a room password and
//! exchange SDP offers/answers, ICE candidates and media status through a
//! broadcast group per room. Room records live in an external key-value store
//! and room creation is serialized with a distributed lock. A second socket
//! per user carries server-side push notifications.

pub mod groups;
pub mod identity;
pub mod room;
pub mod server;
pub mod settings;
pub mod signaling;

pub use groups::{GroupError, GroupEvent, GroupLayer, LocalGroups, NatsGroups};
pub use identity::{AuthError, Identity, IdentityResolver};
pub use room::{Participant, Room, RoomError, RoomRegistry, RoomService};
pub use settings::{load_config, ServerSettings};
pub use signaling::{Notifier, PresenceHub, RoomHub, SignalingContext};
