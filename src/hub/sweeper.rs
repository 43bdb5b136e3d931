//! Idle sweeper — closes silent connections and evicts idle empty rooms.
//!
//! DESIGN
//! ======
//! One background task ticks on a fixed interval. Each pass snapshots the
//! registry, then per room removes stale connections under the room lock,
//! closes them after releasing it, and broadcasts presence once if anything
//! was removed. Rooms left with no connections and no recent activity are
//! evicted from the registry.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::registry::Hub;

pub const DEFAULT_CONN_IDLE_SECS: u64 = 30;
pub const DEFAULT_ROOM_IDLE_SECS: u64 = 600;
pub const DEFAULT_SWEEP_TICK_SECS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweeperConfig {
    pub conn_idle_timeout: Duration,
    pub room_idle_timeout: Duration,
    pub tick: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            conn_idle_timeout: Duration::from_secs(DEFAULT_CONN_IDLE_SECS),
            room_idle_timeout: Duration::from_secs(DEFAULT_ROOM_IDLE_SECS),
            tick: Duration::from_secs(DEFAULT_SWEEP_TICK_SECS),
        }
    }
}

/// Counts from one sweep pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub closed_conns: usize,
    pub evicted_rooms: usize,
}

/// Spawn the periodic sweeper. Stops when `cancel` fires.
pub fn spawn_sweeper(hub: Arc<Hub>, config: SweeperConfig, cancel: CancellationToken) -> JoinHandle<()> {
    info!(
        conn_idle_secs = config.conn_idle_timeout.as_secs(),
        room_idle_secs = config.room_idle_timeout.as_secs(),
        tick_secs = config.tick.as_secs(),
        "idle sweeper configured"
    );

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + config.tick, config.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("idle sweeper stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let report = sweep_once(&hub, config, Instant::now()).await;
                    if report != SweepReport::default() {
                        info!(closed = report.closed_conns, evicted = report.evicted_rooms, "idle sweep");
                    }
                }
            }
        }
    })
}

/// Run a single sweep pass as of `now`.
pub async fn sweep_once(hub: &Hub, config: SweeperConfig, now: Instant) -> SweepReport {
    let mut report = SweepReport::default();

    for (code, room) in hub.room_snapshot() {
        let sweep = room.take_idle(now, config.conn_idle_timeout);

        for conn in &sweep.closed {
            debug!(%code, user_id = %conn.user_id(), "sweeper: closing idle connection");
            conn.close();
        }
        if !sweep.closed.is_empty() {
            report.closed_conns += sweep.closed.len();
            room.broadcast_presence().await;
        }

        // Presence broadcast above bumps activity, so a room that just lost
        // its last connection is only evicted on a later pass.
        if sweep.remaining == 0
            && now.saturating_duration_since(sweep.last_activity) > config.room_idle_timeout
            && hub.try_delete_idle_room(&code, now, config.room_idle_timeout)
        {
            report.evicted_rooms += 1;
        }
    }

    report
}

#[cfg(test)]
#[path = "sweeper_test.rs"]
mod tests;
