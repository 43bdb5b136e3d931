//! Room service — room lookup, membership, scoring, activity.
//!
//! DESIGN
//! ======
//! Rooms and members live in Postgres; the socket layer only keeps a cached
//! presence projection (see `hub::room`). Every function here is a single
//! statement against the pool, so none of them need a transaction.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use uuid::Uuid;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Authorization(String),
    #[error("must join first")]
    NotJoined,
    #[error("room not found: {0}")]
    RoomNotFound(String),
    #[error("member not found: {0}")]
    MemberNotFound(Uuid),
    #[error("current round must be ended before starting a new one")]
    RoundAlreadyActive,
    #[error("no packs selected for room")]
    NoPackSelection,
    #[error("not enough characters available (need {need}, found {found})")]
    NotEnoughCharacters { need: usize, found: usize },
    #[error("storage timed out")]
    Timeout,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl crate::envelope::ErrorCode for RoomError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "E_VALIDATION",
            Self::Authorization(_) => "E_FORBIDDEN",
            Self::NotJoined => "E_NOT_JOINED",
            Self::RoomNotFound(_) => "E_ROOM_NOT_FOUND",
            Self::MemberNotFound(_) => "E_MEMBER_NOT_FOUND",
            Self::RoundAlreadyActive => "E_ROUND_ACTIVE",
            Self::NoPackSelection => "E_NO_PACKS",
            Self::NotEnoughCharacters { .. } => "E_NOT_ENOUGH_CHARACTERS",
            Self::Timeout => "E_TIMEOUT",
            Self::Database(_) => "E_DATABASE",
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Timeout => true,
            Self::Database(e) => is_transient(e),
            _ => false,
        }
    }
}

/// Connection loss, pool exhaustion and lock conflicts clear up on their
/// own. Constraint and data errors fail the same way every time.
fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed => true,
        // serialization_failure, deadlock_detected
        sqlx::Error::Database(db) => matches!(db.code().as_deref(), Some("40001" | "40P01")),
        _ => false,
    }
}

/// Member role inside a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Player,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Player => "player",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown role: {0}")]
pub struct UnknownRole(pub String);

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "host" => Ok(Self::Host),
            "player" => Ok(Self::Player),
            other => Err(UnknownRole(other.to_string())),
        }
    }
}

/// Row from `rooms`.
#[derive(Debug, Clone)]
pub struct Room {
    pub id: Uuid,
    pub owner_user_id: Uuid,
}

/// Row from `room_members`. Canonical identity and score.
#[derive(Debug, Clone)]
pub struct RoomMember {
    pub user_id: Uuid,
    pub display_name: String,
    pub role: Role,
    pub score: i32,
}

// =============================================================================
// ROOMS
// =============================================================================

/// Look up a room by its join code.
///
/// # Errors
///
/// Returns a database error if the query fails.
pub async fn room_by_code(pool: &PgPool, code: &str) -> Result<Option<Room>, RoomError> {
    let row = sqlx::query(
        "SELECT id, owner_user_id
         FROM rooms
         WHERE code = $1",
    )
    .bind(code)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| Room {
        id: r.get("id"),
        owner_user_id: r.get("owner_user_id"),
    }))
}

/// Bump `rooms.last_activity_at`.
///
/// # Errors
///
/// Returns a database error if the update fails.
pub async fn touch_room(pool: &PgPool, room_id: Uuid) -> Result<(), RoomError> {
    sqlx::query("UPDATE rooms SET last_activity_at = now() WHERE id = $1")
        .bind(room_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Bump `users.last_seen_at`.
///
/// # Errors
///
/// Returns a database error if the update fails.
pub async fn touch_user(pool: &PgPool, user_id: Uuid) -> Result<(), RoomError> {
    sqlx::query("UPDATE users SET last_seen_at = now() WHERE id = $1")
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(())
}

// =============================================================================
// MEMBERS
// =============================================================================

/// Insert a member or refresh their display name and role.
///
/// # Errors
///
/// Returns a database error if the upsert fails.
pub async fn upsert_member(
    pool: &PgPool,
    room_id: Uuid,
    user_id: Uuid,
    display_name: &str,
    role: Role,
) -> Result<(), RoomError> {
    sqlx::query(
        "INSERT INTO room_members (room_id, user_id, display_name, role, score)
         VALUES ($1, $2, $3, $4, 0)
         ON CONFLICT (room_id, user_id) DO UPDATE
         SET display_name = EXCLUDED.display_name,
             role = EXCLUDED.role",
    )
    .bind(room_id)
    .bind(user_id)
    .bind(display_name)
    .bind(role.as_str())
    .execute(pool)
    .await?;
    Ok(())
}

/// List members in join order.
///
/// # Errors
///
/// Returns a database error if the query fails.
pub async fn list_members(pool: &PgPool, room_id: Uuid) -> Result<Vec<RoomMember>, RoomError> {
    let rows = sqlx::query_as::<_, (Uuid, String, String, i32)>(
        "SELECT user_id, display_name, role, score
         FROM room_members
         WHERE room_id = $1
         ORDER BY joined_at ASC",
    )
    .bind(room_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(user_id, display_name, role, score)| RoomMember {
            user_id,
            display_name,
            // EDGE: unknown roles in storage degrade to player rather than
            // dropping the member from presence.
            role: role.parse().unwrap_or(Role::Player),
            score,
        })
        .collect())
}

/// Apply an additive score change.
///
/// # Errors
///
/// Returns `MemberNotFound` if the user is not a member of the room, or a
/// database error if the update fails.
pub async fn add_member_score(pool: &PgPool, room_id: Uuid, user_id: Uuid, delta: i32) -> Result<(), RoomError> {
    let result = sqlx::query(
        "UPDATE room_members
         SET score = score + $3
         WHERE room_id = $1 AND user_id = $2",
    )
    .bind(room_id)
    .bind(user_id)
    .bind(delta)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(RoomError::MemberNotFound(user_id));
    }

    touch_room(pool, room_id).await
}

/// Pack ids currently selected for the room.
///
/// # Errors
///
/// Returns a database error if the query fails.
pub async fn selected_pack_ids(pool: &PgPool, room_id: Uuid) -> Result<Vec<Uuid>, RoomError> {
    let ids = sqlx::query_scalar::<_, Uuid>("SELECT pack_id FROM room_pack_selection WHERE room_id = $1")
        .bind(room_id)
        .fetch_all(pool)
        .await?;
    Ok(ids)
}

#[cfg(test)]
#[path = "room_test.rs"]
mod tests;
