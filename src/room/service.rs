//! Room registry: authentication, lock-guarded creation and participant
//! bookkeeping over a [`RoomStore`].

use std::sync::Arc;

use log::{debug, info};

use crate::room::error::RoomError;
use crate::room::lock::DistributedLock;
use crate::room::store::RoomStore;
use crate::room::types::{Participant, Room, RoomView};

/// Tri-state outcome of checking a password against a room name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authentication {
    /// The room exists and the password opens it.
    Granted(Room),
    /// No room is stored under this name yet; it may be created.
    Absent,
    /// The room exists and has a different password.
    Denied,
}

/// Outcome of the REST room lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Found(RoomView),
    NotAuthenticated,
    NotFound,
    PasswordMismatch,
}

/// Shared handles for all rooms.
pub struct RoomRegistry {
    store: Arc<dyn RoomStore>,
    lock: DistributedLock,
    namespace: String,
}

impl RoomRegistry {
    pub fn new(store: Arc<dyn RoomStore>, lock: DistributedLock, namespace: impl Into<String>) -> Self {
        Self {
            store,
            lock,
            namespace: namespace.into(),
        }
    }

    /// Storage key for a room name: `<namespace>:rooms:<room_name>`.
    pub fn room_key(&self, room_name: &str) -> String {
        format!("{}:rooms:{}", self.namespace, room_name)
    }

    /// Handle for one room name.
    pub fn service(self: &Arc<Self>, room_name: &str) -> RoomService {
        RoomService {
            registry: self.clone(),
            room_name: room_name.to_string(),
            room_key: self.room_key(room_name),
        }
    }
}

/// Operations on a single room. Every call re-reads the store; nothing is
/// cached between calls.
#[derive(Clone)]
pub struct RoomService {
    registry: Arc<RoomRegistry>,
    room_name: String,
    room_key: String,
}

impl RoomService {
    pub fn room_name(&self) -> &str {
        &self.room_name
    }

    pub fn room_key(&self) -> &str {
        &self.room_key
    }

    fn lock_key(&self) -> String {
        format!("lock:{}", self.room_key)
    }

    pub async fn get_room_info(&self) -> Result<Option<Room>, RoomError> {
        Ok(self.registry.store.get(&self.room_key).await?)
    }

    pub async fn authenticate(&self, password: &str) -> Result<Authentication, RoomError> {
        Ok(match self.get_room_info().await? {
            Some(room) if room.accepts(password) => Authentication::Granted(room),
            Some(_) => Authentication::Denied,
            None => Authentication::Absent,
        })
    }

    /// Create-or-get under the room's lock. The first caller to take the lock
    /// assigns the room id; later callers get the stored room back.
    pub async fn create_room(&self, user_id: &str, password: &str) -> Result<Room, RoomError> {
        let lock_key = self.lock_key();
        self.registry
            .lock
            .with_lock(&lock_key, || self.create_locked(user_id, password))
            .await
    }

    async fn create_locked(&self, user_id: &str, password: &str) -> Result<Room, RoomError> {
        match self.authenticate(password).await? {
            Authentication::Denied => Err(RoomError::password_mismatch()),
            Authentication::Granted(room) => Ok(room),
            Authentication::Absent => {
                let room = Room::new(user_id, password);
                self.registry.store.set(&self.room_key, &room).await?;
                info!(
                    "Created room {} ({}) owned by {}",
                    self.room_name, room.room_id, user_id
                );
                Ok(room)
            }
        }
    }

    /// Appends the participant unless the user is already listed. Not
    /// lock-guarded; concurrent writers race last-write-wins.
    pub async fn add_participant(&self, participant: Participant) -> Result<Room, RoomError> {
        let mut room = self.require_room().await?;
        let user_id = participant.user_id.clone();
        if room.join(participant) {
            self.registry.store.set(&self.room_key, &room).await?;
            info!("Participant {} joined room {}", user_id, self.room_name);
        } else {
            debug!("Participant {} already in room {}", user_id, self.room_name);
        }
        Ok(room)
    }

    /// Filters the user out of the participant list. Not lock-guarded.
    pub async fn remove_participant(&self, user_id: &str) -> Result<(), RoomError> {
        let mut room = self.require_room().await?;
        if room.leave(user_id) {
            info!("Participant {} left room {}", user_id, self.room_name);
        }
        self.registry.store.set(&self.room_key, &room).await?;
        Ok(())
    }

    pub async fn drop_room(&self) -> Result<(), RoomError> {
        self.registry.store.delete(&self.room_key).await?;
        info!("Dropped room {}", self.room_name);
        Ok(())
    }

    /// Read-only lookup used by the HTTP room endpoint.
    pub async fn lookup(&self, user_id: Option<&str>, password: &str) -> Result<Lookup, RoomError> {
        if user_id.map_or(true, str::is_empty) {
            return Ok(Lookup::NotAuthenticated);
        }
        Ok(match self.authenticate(password).await? {
            Authentication::Granted(room) => Lookup::Found(room.view()),
            Authentication::Absent => Lookup::NotFound,
            Authentication::Denied => Lookup::PasswordMismatch,
        })
    }

    async fn require_room(&self) -> Result<Room, RoomError> {
        self.get_room_info().await?.ok_or_else(|| RoomError::RoomNotFound {
            room: self.room_name.clone(),
        })
    }
}
