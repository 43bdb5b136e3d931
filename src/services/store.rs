//! Game store — the storage seam used by the socket layer.
//!
//! DESIGN
//! ======
//! The socket dispatcher never touches the pool directly; it talks to a
//! `GameStore` so the protocol can be exercised against an in-memory double
//! in tests. `PgStore` is the production implementation and simply forwards
//! to the `room` and `round` service functions.

use sqlx::PgPool;
use uuid::Uuid;

use super::room::{self, Role, Room, RoomError, RoomMember};
use super::round::{self, StartedRound};

/// Provider-neutral async trait for room persistence. Enables mocking in tests.
#[async_trait::async_trait]
pub trait GameStore: Send + Sync {
    async fn room_by_code(&self, code: &str) -> Result<Option<Room>, RoomError>;

    async fn upsert_member(&self, room_id: Uuid, user_id: Uuid, display_name: &str, role: Role)
    -> Result<(), RoomError>;

    async fn list_members(&self, room_id: Uuid) -> Result<Vec<RoomMember>, RoomError>;

    /// Run the round-assignment transaction. All-or-nothing.
    async fn start_round(&self, room_id: Uuid, lang: &str, players: &[Uuid]) -> Result<StartedRound, RoomError>;

    /// Close the open round; a no-op when none is open.
    async fn end_round(&self, room_id: Uuid) -> Result<(), RoomError>;

    async fn add_member_score(&self, room_id: Uuid, user_id: Uuid, delta: i32) -> Result<(), RoomError>;

    async fn touch_room(&self, room_id: Uuid) -> Result<(), RoomError>;

    async fn touch_user(&self, user_id: Uuid) -> Result<(), RoomError>;

    /// Readiness probe.
    async fn ping(&self) -> Result<(), RoomError>;
}

/// Postgres-backed store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl GameStore for PgStore {
    async fn room_by_code(&self, code: &str) -> Result<Option<Room>, RoomError> {
        room::room_by_code(&self.pool, code).await
    }

    async fn upsert_member(
        &self,
        room_id: Uuid,
        user_id: Uuid,
        display_name: &str,
        role: Role,
    ) -> Result<(), RoomError> {
        room::upsert_member(&self.pool, room_id, user_id, display_name, role).await
    }

    async fn list_members(&self, room_id: Uuid) -> Result<Vec<RoomMember>, RoomError> {
        room::list_members(&self.pool, room_id).await
    }

    async fn start_round(&self, room_id: Uuid, lang: &str, players: &[Uuid]) -> Result<StartedRound, RoomError> {
        round::start_round(&self.pool, room_id, lang, players).await
    }

    async fn end_round(&self, room_id: Uuid) -> Result<(), RoomError> {
        round::end_round(&self.pool, room_id).await
    }

    async fn add_member_score(&self, room_id: Uuid, user_id: Uuid, delta: i32) -> Result<(), RoomError> {
        room::add_member_score(&self.pool, room_id, user_id, delta).await
    }

    async fn touch_room(&self, room_id: Uuid) -> Result<(), RoomError> {
        room::touch_room(&self.pool, room_id).await
    }

    async fn touch_user(&self, user_id: Uuid) -> Result<(), RoomError> {
        room::touch_user(&self.pool, user_id).await
    }

    async fn ping(&self) -> Result<(), RoomError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
