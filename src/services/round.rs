//! Round service — character assignment and round lifecycle.
//!
//! DESIGN
//! ======
//! Starting a round is one Postgres transaction:
//!
//! 1. resolve the room's pack selection (outside the tx; read-only)
//! 2. lock the room row, refuse if a round is already open
//! 3. insert the round
//! 4. pick unused characters with `FOR UPDATE ... SKIP LOCKED`
//! 5. record the picks in the room's used-character ledger
//! 6. persist one assignment per player, positionally
//! 7. point `rooms.current_round_id` at the new round and commit
//!
//! ERROR HANDLING
//! ==============
//! Every early return after `begin()` drops the transaction, which rolls it
//! back: no round row, ledger entry, or assignment survives a failure, and
//! `current_round_id` is left as it was.

use serde::Serialize;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use super::room::{self, RoomError};

/// Fallback chain for character names after the requested language.
const FALLBACK_LANGS: [&str; 2] = ["es", "en"];

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssignedCharacter {
    pub id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    pub user_id: Uuid,
    pub character: AssignedCharacter,
}

/// Result of a successful round start.
#[derive(Debug, Clone)]
pub struct StartedRound {
    pub round_id: Uuid,
    pub assignments: Vec<Assignment>,
}

impl StartedRound {
    /// Every assignment except the given player's own.
    pub fn others(&self, user_id: Uuid) -> impl Iterator<Item = &Assignment> {
        self.assignments
            .iter()
            .filter(move |a| a.user_id != user_id)
    }
}

// =============================================================================
// START
// =============================================================================

/// Open a round for `players` and assign each one an unused character.
///
/// # Errors
///
/// - `Validation` if `players` is empty
/// - `NoPackSelection` if the room has no packs selected
/// - `RoundAlreadyActive` if `current_round_id` is set
/// - `NotEnoughCharacters` if fewer unused characters than players remain
/// - `Database` for any storage failure
pub async fn start_round(
    pool: &PgPool,
    room_id: Uuid,
    lang: &str,
    players: &[Uuid],
) -> Result<StartedRound, RoomError> {
    if players.is_empty() {
        return Err(RoomError::Validation("no players to assign".into()));
    }

    let pack_ids = room::selected_pack_ids(pool, room_id).await?;
    if pack_ids.is_empty() {
        return Err(RoomError::NoPackSelection);
    }

    let mut tx = pool.begin().await?;

    let current: Option<Uuid> =
        sqlx::query_scalar("SELECT current_round_id FROM rooms WHERE id = $1 FOR UPDATE")
            .bind(room_id)
            .fetch_one(tx.as_mut())
            .await?;
    if current.is_some() {
        return Err(RoomError::RoundAlreadyActive);
    }

    let round_id: Uuid = sqlx::query_scalar(
        "INSERT INTO room_rounds (room_id, started_at, lang)
         VALUES ($1, now(), $2)
         RETURNING id",
    )
    .bind(room_id)
    .bind(lang)
    .fetch_one(tx.as_mut())
    .await?;

    let need = players.len();
    let limit = i64::try_from(need).unwrap_or(i64::MAX);
    let picked = sqlx::query_as::<_, (Uuid, String)>(
        "SELECT
             c.id,
             COALESCE(ct_req.name, ct_a.name, ct_b.name, c.canonical_key) AS name
         FROM characters c
         LEFT JOIN character_translations ct_req ON ct_req.character_id = c.id AND ct_req.lang = $3
         LEFT JOIN character_translations ct_a   ON ct_a.character_id   = c.id AND ct_a.lang   = $5
         LEFT JOIN character_translations ct_b   ON ct_b.character_id   = c.id AND ct_b.lang   = $6
         WHERE c.pack_id = ANY($1)
           AND NOT EXISTS (
               SELECT 1 FROM room_used_characters u
               WHERE u.room_id = $2 AND u.character_id = c.id
           )
         ORDER BY random()
         LIMIT $4
         FOR UPDATE OF c SKIP LOCKED",
    )
    .bind(&pack_ids)
    .bind(room_id)
    .bind(lang)
    .bind(limit)
    .bind(FALLBACK_LANGS[0])
    .bind(FALLBACK_LANGS[1])
    .fetch_all(tx.as_mut())
    .await?;

    if picked.len() < need {
        return Err(RoomError::NotEnoughCharacters { need, found: picked.len() });
    }

    for (character_id, _) in &picked {
        sqlx::query(
            "INSERT INTO room_used_characters (room_id, character_id, first_used_at)
             VALUES ($1, $2, now())",
        )
        .bind(room_id)
        .bind(character_id)
        .execute(tx.as_mut())
        .await?;
    }

    let mut assignments = Vec::with_capacity(need);
    for (user_id, (character_id, name)) in players.iter().zip(picked) {
        sqlx::query(
            "INSERT INTO round_assignments (round_id, user_id, character_id, assigned_at)
             VALUES ($1, $2, $3, now())",
        )
        .bind(round_id)
        .bind(user_id)
        .bind(character_id)
        .execute(tx.as_mut())
        .await?;

        assignments.push(Assignment { user_id: *user_id, character: AssignedCharacter { id: character_id, name } });
    }

    sqlx::query("UPDATE rooms SET current_round_id = $2, last_activity_at = now() WHERE id = $1")
        .bind(room_id)
        .bind(round_id)
        .execute(tx.as_mut())
        .await?;

    tx.commit().await?;

    info!(%room_id, %round_id, players = need, lang, "round started");
    Ok(StartedRound { round_id, assignments })
}

// =============================================================================
// END
// =============================================================================

/// Close the open round, if any. The used-character ledger is untouched.
///
/// # Errors
///
/// Returns a database error if the transaction fails.
pub async fn end_round(pool: &PgPool, room_id: Uuid) -> Result<(), RoomError> {
    let mut tx = pool.begin().await?;

    let current: Option<Uuid> =
        sqlx::query_scalar("SELECT current_round_id FROM rooms WHERE id = $1 FOR UPDATE")
            .bind(room_id)
            .fetch_one(tx.as_mut())
            .await?;
    let Some(round_id) = current else {
        tx.commit().await?;
        return Ok(());
    };

    sqlx::query("UPDATE room_rounds SET ended_at = now() WHERE id = $1")
        .bind(round_id)
        .execute(tx.as_mut())
        .await?;
    sqlx::query("UPDATE rooms SET current_round_id = NULL, last_activity_at = now() WHERE id = $1")
        .bind(room_id)
        .execute(tx.as_mut())
        .await?;

    tx.commit().await?;

    info!(%room_id, %round_id, "round ended");
    Ok(())
}

#[cfg(test)]
#[path = "round_test.rs"]
mod tests;
