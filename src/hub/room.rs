//! Per-room live state: connections and cached presence.
//!
//! DESIGN
//! ======
//! `RoomHub` guards its connection map, member cache and activity timestamp
//! with one `std::sync::Mutex`. Critical sections only touch those maps.
//! Anything that sends (presence, targeted sends) snapshots under the lock,
//! releases it, then awaits the sends.
//!
//! INVARIANT
//! =========
//! After `hydrate`, `sync_connected` and `disconnect`, a member's
//! `connected` flag is true exactly when the connection map holds that user.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use super::{Conn, MemberState};
use crate::envelope::{Data, Envelope, kinds};
use crate::services::room::{Role, RoomMember};

pub struct RoomHub {
    code: String,
    inner: Mutex<RoomInner>,
}

struct RoomInner {
    conns: HashMap<Uuid, Arc<dyn Conn>>,
    members: HashMap<Uuid, MemberState>,
    last_activity: Instant,
}

impl RoomInner {
    fn sync_connected(&mut self) {
        for (user_id, member) in &mut self.members {
            member.connected = self.conns.contains_key(user_id);
        }
    }
}

/// Connections removed by an idle sweep, plus what the sweeper needs to
/// decide on eviction.
pub struct IdleSweep {
    pub closed: Vec<Arc<dyn Conn>>,
    pub remaining: usize,
    pub last_activity: Instant,
}

impl RoomHub {
    #[must_use]
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            inner: Mutex::new(RoomInner {
                conns: HashMap::new(),
                members: HashMap::new(),
                last_activity: Instant::now(),
            }),
        }
    }

    #[cfg(test)]
    pub fn code(&self) -> &str {
        &self.code
    }

    fn lock(&self) -> MutexGuard<'_, RoomInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // =========================================================================
    // CONNECTIONS
    // =========================================================================

    /// Insert a connection. An existing connection for the same user is
    /// closed first, so each user has at most one live connection here.
    pub fn register(&self, conn: Arc<dyn Conn>) {
        let user_id = conn.user_id();
        let mut inner = self.lock();
        if let Some(old) = inner.conns.insert(user_id, conn) {
            info!(code = %self.code, %user_id, conn_id = %old.conn_id(), "room: superseding previous connection");
            old.close();
        }
        inner.last_activity = Instant::now();
    }

    /// Remove the user's connection. Leaves `connected` alone so the caller
    /// decides when presence changes.
    #[allow(dead_code)]
    pub fn unregister(&self, user_id: Uuid) {
        let mut inner = self.lock();
        inner.conns.remove(&user_id);
        inner.last_activity = Instant::now();
    }

    /// Remove the user's connection only if it is still `conn_id`, and mark
    /// them disconnected. Returns false when a newer connection replaced it.
    pub fn disconnect(&self, user_id: Uuid, conn_id: Uuid) -> bool {
        let mut inner = self.lock();
        let current = inner
            .conns
            .get(&user_id)
            .is_some_and(|c| c.conn_id() == conn_id);
        if !current {
            return false;
        }
        inner.conns.remove(&user_id);
        if let Some(member) = inner.members.get_mut(&user_id) {
            member.connected = false;
        }
        inner.last_activity = Instant::now();
        true
    }

    /// Remove every connection idle longer than `idle` as of `now` and mark
    /// those members disconnected. Closing is left to the caller.
    pub fn take_idle(&self, now: Instant, idle: Duration) -> IdleSweep {
        let mut inner = self.lock();
        let stale: Vec<Uuid> = inner
            .conns
            .iter()
            .filter(|(_, c)| now.saturating_duration_since(c.last_seen()) > idle)
            .map(|(uid, _)| *uid)
            .collect();

        let mut closed = Vec::with_capacity(stale.len());
        for user_id in stale {
            if let Some(conn) = inner.conns.remove(&user_id) {
                closed.push(conn);
            }
            match inner.members.get_mut(&user_id) {
                Some(member) => member.connected = false,
                None => debug!(code = %self.code, %user_id, "room: swept connection had no cached member"),
            }
        }

        IdleSweep { closed, remaining: inner.conns.len(), last_activity: inner.last_activity }
    }

    /// Close and drop every connection. Used on shutdown.
    pub fn close_all(&self) {
        let conns: Vec<Arc<dyn Conn>> = {
            let mut inner = self.lock();
            inner.conns.drain().map(|(_, c)| c).collect()
        };
        for conn in conns {
            conn.close();
        }
    }

    // =========================================================================
    // PRESENCE CACHE
    // =========================================================================

    /// Insert or replace one cached presence row.
    pub fn upsert_member_state(&self, state: MemberState) {
        self.lock().members.insert(state.user_id, state);
    }

    /// Update the connected flag of an already-cached member.
    #[allow(dead_code)]
    pub fn set_connected(&self, user_id: Uuid, connected: bool) {
        if let Some(member) = self.lock().members.get_mut(&user_id) {
            member.connected = connected;
        }
    }

    /// Recompute every connected flag from the connection map.
    pub fn sync_connected(&self) {
        self.lock().sync_connected();
    }

    /// Replace cached rows with fresh storage rows and recompute liveness,
    /// in one critical section.
    pub fn hydrate(&self, members: Vec<RoomMember>) {
        let mut inner = self.lock();
        for member in members {
            inner.members.insert(member.user_id, MemberState::from(member));
        }
        inner.sync_connected();
    }

    // =========================================================================
    // SENDING
    // =========================================================================

    /// Send the full member list to every live connection.
    pub async fn broadcast_presence(&self) {
        let (members, conns) = {
            let inner = self.lock();
            let mut members: Vec<MemberState> = inner.members.values().cloned().collect();
            members.sort_by(|a, b| {
                a.display_name
                    .cmp(&b.display_name)
                    .then(a.user_id.cmp(&b.user_id))
            });
            let conns: Vec<Arc<dyn Conn>> = inner.conns.values().cloned().collect();
            (members, conns)
        };

        let mut data = Data::new();
        data.insert("code".into(), serde_json::json!(self.code));
        data.insert("members".into(), serde_json::to_value(&members).unwrap_or_default());
        let msg = Envelope::new(kinds::ROOM_PRESENCE, data);

        for conn in &conns {
            if let Err(e) = conn.send(&msg).await {
                debug!(code = %self.code, user_id = %conn.user_id(), error = %e, "room: presence send failed");
            }
        }

        self.touch();
    }

    /// Send to one user's live connection. No-op if they have none.
    pub async fn send_to(&self, user_id: Uuid, msg: &Envelope) {
        let conn = self.lock().conns.get(&user_id).cloned();
        let Some(conn) = conn else {
            return;
        };
        if let Err(e) = conn.send(msg).await {
            debug!(code = %self.code, %user_id, kind = %msg.kind, error = %e, "room: targeted send failed");
        }
    }

    // =========================================================================
    // INSPECTION
    // =========================================================================

    /// Live connections holding the player role, sorted by user id.
    #[must_use]
    pub fn player_ids(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self
            .lock()
            .conns
            .values()
            .filter(|c| c.role() == Role::Player)
            .map(|c| c.user_id())
            .collect();
        ids.sort_unstable();
        ids
    }

    #[must_use]
    pub fn conn_count(&self) -> usize {
        self.lock().conns.len()
    }

    #[cfg(test)]
    pub fn member_count(&self) -> usize {
        self.lock().members.len()
    }

    #[must_use]
    pub fn member(&self, user_id: Uuid) -> Option<MemberState> {
        self.lock().members.get(&user_id).cloned()
    }

    #[cfg(test)]
    pub fn is_connected(&self, user_id: Uuid) -> bool {
        self.lock().conns.contains_key(&user_id)
    }

    #[must_use]
    pub fn last_activity(&self) -> Instant {
        self.lock().last_activity
    }

    pub fn touch(&self) {
        self.lock().last_activity = Instant::now();
    }
}

#[cfg(test)]
#[path = "room_test.rs"]
mod tests;
