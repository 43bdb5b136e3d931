//! Realtime room coordination.
//!
//! ARCHITECTURE
//! ============
//! - `conn`: single-writer wrapper around one socket sink
//! - `room`: per-room registry of live connections + cached presence
//! - `registry`: process-scoped map of room code -> `RoomHub`
//! - `sweeper`: periodic idle connection / idle room reaper
//!
//! LOCKING
//! =======
//! Each `RoomHub` owns one mutex for its connection map, member cache and
//! activity timestamp. The registry owns a separate mutex for its map. Lock
//! order is always registry -> room, and neither is held across `.await`.

pub mod conn;
pub mod registry;
pub mod room;
pub mod sweeper;

use serde::Serialize;
use tokio::time::Instant;
use uuid::Uuid;

use crate::envelope::Envelope;
use crate::services::room::{Role, RoomMember};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnError {
    #[error("connection closed")]
    Closed,
    #[error("failed to encode message: {0}")]
    Encode(String),
}

/// What the hub needs from a connection. The socket wrapper implements it;
/// tests substitute a channel-backed double.
#[async_trait::async_trait]
pub trait Conn: Send + Sync {
    /// Queue a message for delivery.
    ///
    /// # Errors
    ///
    /// Returns `ConnError::Closed` once the connection has been closed.
    async fn send(&self, envelope: &Envelope) -> Result<(), ConnError>;

    /// Close the connection. Idempotent.
    fn close(&self);

    /// Unique per connection, distinguishes a reconnect from its predecessor.
    fn conn_id(&self) -> Uuid;

    fn user_id(&self) -> Uuid;

    fn role(&self) -> Role;

    fn display_name(&self) -> &str;

    /// Last time an inbound message was seen.
    fn last_seen(&self) -> Instant;
}

/// Cached presence row for one member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberState {
    pub user_id: Uuid,
    pub display_name: String,
    pub role: Role,
    pub score: i32,
    pub connected: bool,
}

impl From<RoomMember> for MemberState {
    fn from(m: RoomMember) -> Self {
        Self { user_id: m.user_id, display_name: m.display_name, role: m.role, score: m.score, connected: false }
    }
}
