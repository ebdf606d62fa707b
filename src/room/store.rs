//! Keyed room storage.
//!
//! The store only knows whole values: callers read a full [`Room`], mutate it
//! in memory and write the full value back. There are no partial updates and
//! no expiry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use redis::AsyncCommands;
use tokio::sync::RwLock;

use crate::room::error::StoreError;
use crate::room::types::Room;

/// Storage port for room values.
#[async_trait]
pub trait RoomStore: Send + Sync {
    /// `Ok(None)` means the key was never written (or was deleted), which is
    /// distinct from a room with no participants.
    async fn get(&self, key: &str) -> Result<Option<Room>, StoreError>;

    /// Writes the whole room without expiry.
    async fn set(&self, key: &str, room: &Room) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Redis-backed store holding JSON-serialized rooms.
pub struct RedisRoomStore {
    redis_client: Arc<redis::Client>,
}

impl RedisRoomStore {
    pub fn new(redis_client: Arc<redis::Client>) -> Self {
        Self { redis_client }
    }
}

#[async_trait]
impl RoomStore for RedisRoomStore {
    async fn get(&self, key: &str) -> Result<Option<Room>, StoreError> {
        let mut conn = self.redis_client.get_multiplexed_async_connection().await?;
        let room_json: Option<String> = conn.get(key).await?;
        match room_json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, room: &Room) -> Result<(), StoreError> {
        let mut conn = self.redis_client.get_multiplexed_async_connection().await?;
        let room_json = serde_json::to_string(room)?;
        let _: () = conn.set(key, room_json).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.redis_client.get_multiplexed_async_connection().await?;
        let _: () = conn.del(key).await?;
        Ok(())
    }
}

/// Process-local store. Values are kept serialized so reads never share
/// state with earlier writes.
#[derive(Default)]
pub struct MemoryRoomStore {
    rooms: RwLock<HashMap<String, String>>,
}

impl MemoryRoomStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RoomStore for MemoryRoomStore {
    async fn get(&self, key: &str) -> Result<Option<Room>, StoreError> {
        let rooms = self.rooms.read().await;
        match rooms.get(key) {
            Some(json) => Ok(Some(serde_json::from_str(json)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, room: &Room) -> Result<(), StoreError> {
        let json = serde_json::to_string(room)?;
        self.rooms.write().await.insert(key.to_string(), json);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.rooms.write().await.remove(key);
        Ok(())
    }
}
