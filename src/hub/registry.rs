//! Process-scoped room registry.
//!
//! One `Hub` is created at startup and shared through `AppState`. Rooms are
//! created lazily on first access and evicted by the sweeper once empty and
//! idle; persisted data is untouched by eviction, and the member cache of a
//! re-created room is rehydrated from storage on the next join.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::info;

use super::Conn;
use super::room::RoomHub;

#[derive(Default)]
pub struct Hub {
    rooms: Mutex<HashMap<String, Arc<RoomHub>>>,
}

impl Hub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<RoomHub>>> {
        self.rooms.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get the room for `code`, creating an empty one if absent.
    #[allow(dead_code)]
    pub fn get_room(&self, code: &str) -> Arc<RoomHub> {
        self.lock()
            .entry(code.to_owned())
            .or_insert_with(|| Arc::new(RoomHub::new(code)))
            .clone()
    }

    /// Get-or-create the room and register `conn` while still holding the
    /// registry lock, so an eviction can never strand the new connection in
    /// a room that is no longer reachable.
    pub fn join(&self, code: &str, conn: Arc<dyn Conn>) -> Arc<RoomHub> {
        let mut rooms = self.lock();
        let room = rooms
            .entry(code.to_owned())
            .or_insert_with(|| Arc::new(RoomHub::new(code)))
            .clone();
        room.register(conn);
        room
    }

    /// Copy of the current rooms, for passes that must not hold the
    /// registry lock.
    #[must_use]
    pub fn room_snapshot(&self) -> Vec<(String, Arc<RoomHub>)> {
        self.lock()
            .iter()
            .map(|(code, room)| (code.clone(), room.clone()))
            .collect()
    }

    /// Evict the room if it has no connections and has been idle longer
    /// than `idle` as of `now`. Both conditions are re-checked under the
    /// registry lock.
    pub fn try_delete_idle_room(&self, code: &str, now: Instant, idle: Duration) -> bool {
        let mut rooms = self.lock();
        let Some(room) = rooms.get(code) else {
            return false;
        };
        let evictable =
            room.conn_count() == 0 && now.saturating_duration_since(room.last_activity()) > idle;
        if evictable {
            rooms.remove(code);
            info!(code, "hub: evicted idle room");
        }
        evictable
    }

    /// Close every connection in every room.
    pub fn close_all(&self) {
        for (_, room) in self.room_snapshot() {
            room.close_all();
        }
    }
}

#[cfg(test)]
impl Hub {
    /// Look up a room without creating it.
    pub fn room(&self, code: &str) -> Option<Arc<RoomHub>> {
        self.lock().get(code).cloned()
    }

    pub fn contains(&self, code: &str) -> bool {
        self.lock().contains_key(code)
    }

    pub fn room_count(&self) -> usize {
        self.lock().len()
    }
}

#[cfg(test)]
#[path = "registry_test.rs"]
mod tests;
