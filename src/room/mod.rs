//! Room registry backed by an external key-value store.
//!
//! ```text
//! ┌─────────────┐     ┌─────────────────┐
//! │ RoomService │────▶│ DistributedLock │  (create only)
//! │ (per name)  │     └─────────────────┘
//! │             │     ┌─────────────────┐
//! │             │────▶│    RoomStore    │  read-modify-write
//! └─────────────┘     └─────────────────┘
//! ```

pub mod error;
pub mod lock;
pub mod service;
pub mod store;
pub mod types;

pub use error::{LockError, RoomError, StoreError};
pub use lock::{DistributedLock, LockBackend, LockGuard, MemoryLockBackend, RedisLockBackend};
pub use service::{Authentication, Lookup, RoomRegistry, RoomService};
pub use store::{MemoryRoomStore, RedisRoomStore, RoomStore};
pub use types::{Participant, Room, RoomView};
