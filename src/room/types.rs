//! Room and participant records as persisted in the room store.

use serde::{Deserialize, Serialize};

/// A room member's identity plus media-stream flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: String,
    pub username: String,
    pub audio_on: bool,
    pub video_on: bool,
}

impl Participant {
    /// A freshly joined participant has both streams off.
    pub fn new(user_id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            username: username.into(),
            audio_on: false,
            video_on: false,
        }
    }
}

/// Full room value. Always read and written whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub room_id: String,
    #[serde(default)]
    pub password: Option<String>,
    pub owner: String,
    /// Join order.
    #[serde(default)]
    pub participants: Vec<Participant>,
}

impl Room {
    /// Build a new room with a server-generated id. An empty password means
    /// the room is open.
    pub fn new(owner: impl Into<String>, password: &str) -> Self {
        Self {
            room_id: uuid::Uuid::new_v4().to_string(),
            password: (!password.is_empty()).then(|| password.to_string()),
            owner: owner.into(),
            participants: Vec::new(),
        }
    }

    pub fn has_password(&self) -> bool {
        self.password.as_deref().is_some_and(|p| !p.is_empty())
    }

    /// Whether `password` opens this room.
    pub fn accepts(&self, password: &str) -> bool {
        match self.password.as_deref() {
            Some(expected) if !expected.is_empty() => expected == password,
            _ => true,
        }
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.participants.iter().any(|p| p.user_id == user_id)
    }

    /// Appends `participant` unless an entry with the same user id exists.
    /// Returns whether the list changed.
    pub fn join(&mut self, participant: Participant) -> bool {
        if self.contains(&participant.user_id) {
            return false;
        }
        self.participants.push(participant);
        true
    }

    /// Drops every entry for `user_id`. Returns whether the list changed.
    pub fn leave(&mut self, user_id: &str) -> bool {
        let before = self.participants.len();
        self.participants.retain(|p| p.user_id != user_id);
        before != self.participants.len()
    }

    pub fn view(&self) -> RoomView {
        RoomView {
            room_id: self.room_id.clone(),
            owner: self.owner.clone(),
            participants: self.participants.clone(),
            has_password: self.has_password(),
        }
    }
}

/// Room as shown to clients: no password, derived `has_password`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomView {
    pub room_id: String,
    pub owner: String,
    pub participants: Vec<Participant>,
    pub has_password: bool,
}
