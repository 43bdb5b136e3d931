use super::*;
use crate::envelope::kinds;
use crate::services::room::{Role, RoomMember};
use crate::state::test_helpers::{TestConn, assert_no_envelope, drain, recv_envelope};
use uuid::Uuid;

fn config() -> SweeperConfig {
    SweeperConfig {
        conn_idle_timeout: Duration::from_secs(30),
        room_idle_timeout: Duration::from_secs(600),
        tick: Duration::from_secs(10),
    }
}

fn player(user_id: Uuid, name: &str) -> RoomMember {
    RoomMember { user_id, display_name: name.into(), role: Role::Player, score: 0 }
}

#[tokio::test]
async fn silent_connection_is_closed_and_peers_see_one_presence() {
    let hub = Hub::new();
    let base = Instant::now();
    let silent_user = Uuid::new_v4();
    let active_user = Uuid::new_v4();

    let (silent, mut silent_rx) = TestConn::new(silent_user, Role::Player, "Quiet");
    let (active, mut active_rx) = TestConn::new(active_user, Role::Player, "Loud");
    silent.set_last_seen(base);
    active.set_last_seen(base + Duration::from_secs(29));

    let room = hub.join("ABC123", silent.clone());
    hub.join("ABC123", active.clone());
    room.hydrate(vec![player(silent_user, "Quiet"), player(active_user, "Loud")]);

    let report = sweep_once(&hub, config(), base + Duration::from_secs(31)).await;

    assert_eq!(report, SweepReport { closed_conns: 1, evicted_rooms: 0 });
    assert!(silent.is_closed());
    assert!(!active.is_closed());
    assert!(!room.member(silent_user).expect("cached").connected);
    assert!(room.member(active_user).expect("cached").connected);

    let env = recv_envelope(&mut active_rx).await;
    assert_eq!(env.kind, kinds::ROOM_PRESENCE);
    let quiet = env.payload["members"]
        .as_array()
        .expect("members")
        .iter()
        .find(|m| m["displayName"] == "Quiet")
        .cloned()
        .expect("quiet listed");
    assert_eq!(quiet["connected"], false);
    assert_no_envelope(&mut active_rx).await;

    assert!(drain(&mut silent_rx).is_empty(), "closed connection is not messaged");
}

#[tokio::test]
async fn nothing_is_sent_when_nothing_is_stale() {
    let hub = Hub::new();
    let base = Instant::now();
    let (conn, mut rx) = TestConn::new(Uuid::new_v4(), Role::Player, "Ana");
    conn.set_last_seen(base);
    hub.join("ABC123", conn.clone());

    let report = sweep_once(&hub, config(), base + Duration::from_secs(20)).await;

    assert_eq!(report, SweepReport::default());
    assert!(!conn.is_closed());
    assert_no_envelope(&mut rx).await;
}

#[tokio::test]
async fn idle_empty_room_is_evicted_and_recreated_empty() {
    let hub = Hub::new();
    let room = hub.get_room("ABC123");
    room.hydrate(vec![player(Uuid::new_v4(), "Gone")]);

    let report = sweep_once(&hub, config(), Instant::now() + Duration::from_secs(601)).await;

    assert_eq!(report.evicted_rooms, 1);
    assert!(!hub.contains("ABC123"));
    let fresh = hub.get_room("ABC123");
    assert_eq!(fresh.member_count(), 0);
    assert_eq!(fresh.conn_count(), 0);
}

#[tokio::test]
async fn empty_but_recent_room_is_kept() {
    let hub = Hub::new();
    hub.get_room("ABC123");

    let report = sweep_once(&hub, config(), Instant::now() + Duration::from_secs(60)).await;

    assert_eq!(report.evicted_rooms, 0);
    assert!(hub.contains("ABC123"));
}

#[tokio::test]
async fn room_emptied_by_sweep_is_evicted_on_a_later_pass() {
    let hub = Hub::new();
    let base = Instant::now();
    let (conn, _rx) = TestConn::new(Uuid::new_v4(), Role::Player, "Ana");
    conn.set_last_seen(base);
    hub.join("ABC123", conn.clone());

    let first = sweep_once(&hub, config(), base + Duration::from_secs(31)).await;
    assert_eq!(first, SweepReport { closed_conns: 1, evicted_rooms: 0 });
    assert!(hub.contains("ABC123"));

    let second = sweep_once(&hub, config(), base + Duration::from_secs(700)).await;
    assert_eq!(second.evicted_rooms, 1);
    assert!(!hub.contains("ABC123"));
}

#[tokio::test]
async fn spawned_sweeper_stops_on_cancel() {
    let hub = Arc::new(Hub::new());
    let cancel = CancellationToken::new();
    let handle = spawn_sweeper(hub, SweeperConfig { tick: Duration::from_millis(10), ..config() }, cancel.clone());

    tokio::time::sleep(Duration::from_millis(30)).await;
    cancel.cancel();

    tokio::time::timeout(Duration::from_millis(500), handle)
        .await
        .expect("sweeper should stop")
        .expect("sweeper task should not panic");
}

#[tokio::test]
async fn spawned_sweeper_closes_idle_connections() {
    let hub = Arc::new(Hub::new());
    let (conn, _rx) = TestConn::new(Uuid::new_v4(), Role::Player, "Ana");
    conn.set_last_seen(Instant::now() - Duration::from_millis(200));
    hub.join("ABC123", conn.clone());

    let cancel = CancellationToken::new();
    let cfg = SweeperConfig {
        conn_idle_timeout: Duration::from_millis(50),
        room_idle_timeout: Duration::from_secs(600),
        tick: Duration::from_millis(10),
    };
    let handle = spawn_sweeper(hub.clone(), cfg, cancel.clone());

    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();
    let _ = handle.await;

    assert!(conn.is_closed());
    assert_eq!(hub.get_room("ABC123").conn_count(), 0);
}
