//! WebSocket handler — room protocol dispatcher.
//!
//! DESIGN
//! ======
//! The token is verified before the upgrade. After the upgrade, one read
//! loop per socket decodes envelopes and dispatches on `type`. Handler
//! functions validate, call the store under a timeout, mutate the room hub,
//! and return an `Outcome`. The dispatch layer owns all outbound concerns:
//! reply to the sender, then presence broadcast.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → Authenticated-Unjoined; replies are written straight to the
//!    socket sink, which the read loop still owns
//! 2. `room:join` → the sink moves into a `WsConn`; from here every reply
//!    goes through its queue so it stays ordered with broadcasts
//! 3. Read error / close / connection cancelled → `leave` (unregister if
//!    still current, presence, close); the only teardown path

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::envelope::{Data, Envelope, ErrorCode, kinds, now_ms};
use crate::hub::conn::{WRITE_TIMEOUT, WsConn};
use crate::hub::room::RoomHub;
use crate::hub::{Conn, MemberState};
use crate::services::room::{Role, RoomError};
use crate::state::AppState;

/// Store timeout for join, score and end-round calls.
const STORE_TIMEOUT: Duration = Duration::from_secs(3);

/// Store timeout for the round-assignment transaction.
const ROUND_START_TIMEOUT: Duration = Duration::from_secs(8);

const DEFAULT_LANG: &str = "es";

// =============================================================================
// OUTCOME
// =============================================================================

/// Result returned by handler functions. The dispatch layer uses this to
/// decide who receives what.
#[derive(Debug)]
enum Outcome {
    /// Reply to the sender only.
    Reply(Envelope),
    /// Reply to the sender, then broadcast presence to the room.
    ReplyAndPresence(Envelope),
    /// Nothing to send.
    Ignore,
}

// =============================================================================
// SESSION
// =============================================================================

/// Per-socket protocol state.
pub(crate) struct Session {
    user_id: Uuid,
    joined: Option<Joined>,
}

struct Joined {
    room: Arc<RoomHub>,
    conn: Arc<dyn Conn>,
    room_id: Uuid,
    code: String,
    role: Role,
}

impl Session {
    pub(crate) fn new(user_id: Uuid) -> Self {
        Self { user_id, joined: None }
    }

    #[cfg(test)]
    pub(crate) fn is_joined(&self) -> bool {
        self.joined.is_some()
    }
}

/// Builds the connection wrapper on a successful join. The socket transport
/// hands over its sink; tests hand out channel-backed doubles.
pub(crate) trait ConnFactory: Send {
    fn open(&mut self, user_id: Uuid, role: Role, display_name: &str) -> Option<Arc<dyn Conn>>;
}

// =============================================================================
// PAYLOADS
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JoinPayload {
    #[serde(default)]
    code: String,
    #[serde(default)]
    display_name: String,
    #[serde(default)]
    role: String,
}

#[derive(Debug, Deserialize)]
struct StartRoundPayload {
    #[serde(default)]
    code: String,
    #[serde(default)]
    lang: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EndRoundPayload {
    #[serde(default)]
    code: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScoreAddPayload {
    #[serde(default)]
    user_id: String,
    #[serde(default)]
    delta: i32,
}

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(raw) = params
        .get("access_token")
        .or_else(|| params.get("token"))
        .filter(|t| !t.is_empty())
    else {
        return (StatusCode::UNAUTHORIZED, "missing access_token").into_response();
    };

    let user_id = match state.tokens.parse_access_token(raw) {
        Ok(uid) => uid,
        Err(e) => {
            debug!(error = %e, "ws: rejected token");
            return (StatusCode::UNAUTHORIZED, "invalid token").into_response();
        }
    };

    ws.on_upgrade(move |socket| run_ws(socket, state, user_id))
}

// =============================================================================
// CONNECTION
// =============================================================================

type SocketSink = SplitSink<WebSocket, Message>;

/// Owns the socket sink until a join moves it into a `WsConn`.
struct SocketLink {
    user_id: Uuid,
    sink: Option<SocketSink>,
    cancel: CancellationToken,
    conn: Option<Arc<WsConn>>,
}

impl SocketLink {
    async fn write_direct(&mut self, envelope: &Envelope) -> Result<(), ()> {
        let Some(sink) = self.sink.as_mut() else {
            return Err(());
        };
        let text = envelope.to_text().map_err(|e| {
            warn!(user_id = %self.user_id, error = %e, "ws: failed to encode message");
        })?;
        match timeout(WRITE_TIMEOUT, sink.send(Message::Text(text.into()))).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                warn!(user_id = %self.user_id, error = %e, "ws: failed to write message");
                Err(())
            }
            Err(_) => {
                warn!(user_id = %self.user_id, "ws: write timed out");
                Err(())
            }
        }
    }

    fn touch(&self) {
        if let Some(conn) = &self.conn {
            conn.touch();
        }
    }

    /// Close the socket if no wrapper took it over.
    async fn shutdown(&mut self) {
        if let Some(conn) = self.conn.take() {
            conn.close();
        }
        if let Some(mut sink) = self.sink.take() {
            let close = Message::Close(Some(CloseFrame { code: close_code::NORMAL, reason: "bye".into() }));
            let _ = timeout(WRITE_TIMEOUT, sink.send(close)).await;
            let _ = timeout(WRITE_TIMEOUT, sink.close()).await;
        }
    }
}

impl ConnFactory for SocketLink {
    fn open(&mut self, user_id: Uuid, role: Role, display_name: &str) -> Option<Arc<dyn Conn>> {
        let sink = self.sink.take()?;
        let conn = WsConn::spawn(sink, user_id, role, display_name, self.cancel.clone());
        self.conn = Some(conn.clone());
        Some(conn)
    }
}

async fn run_ws(socket: WebSocket, state: AppState, user_id: Uuid) {
    let (sink, mut stream) = socket.split();
    let cancel = CancellationToken::new();
    let mut link = SocketLink { user_id, sink: Some(sink), cancel: cancel.clone(), conn: None };
    let mut session = Session::new(user_id);

    info!(%user_id, "ws: connection established");

    'read: loop {
        let next = tokio::select! {
            () = cancel.cancelled() => {
                debug!(%user_id, "ws: connection cancelled");
                break;
            }
            next = stream.next() => next,
        };

        let msg = match next {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                info!(%user_id, error = %e, "ws: read error, closing connection");
                break;
            }
            None => break,
        };

        match msg {
            Message::Text(text) => {
                let direct = process_inbound_text(&state, &mut session, &mut link, text.as_str()).await;
                for envelope in direct {
                    if link.write_direct(&envelope).await.is_err() {
                        break 'read;
                    }
                }
                link.touch();
            }
            Message::Close(_) => break,
            _ => link.touch(),
        }
    }

    leave(&state, &mut session).await;
    link.shutdown().await;
    info!(%user_id, "ws: connection closed");
}

// =============================================================================
// DISPATCH
// =============================================================================

/// Parse and process one inbound text message.
///
/// Returns envelopes the transport must write itself, which only happens
/// before a join; once joined, replies are queued on the session's
/// connection so they stay ordered with broadcasts.
pub(crate) async fn process_inbound_text(
    state: &AppState,
    session: &mut Session,
    factory: &mut dyn ConnFactory,
    text: &str,
) -> Vec<Envelope> {
    let req: Envelope = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(e) => {
            warn!(user_id = %session.user_id, error = %e, "ws: received invalid JSON");
            return deliver(session, Envelope::error_message("bad json")).await;
        }
    };

    info!(user_id = %session.user_id, kind = %req.kind, "ws: message received");

    if let Some(joined) = &session.joined {
        joined.room.touch();
    }

    let result = match req.kind.as_str() {
        kinds::ROOM_JOIN => handle_join(state, session, factory, &req).await,
        kinds::HOST_START_ROUND => handle_start_round(state, session, &req).await,
        kinds::HOST_END_ROUND => handle_end_round(state, session, &req).await,
        kinds::HOST_SCORE_ADD => handle_score_add(state, session, &req).await,
        kinds::CLIENT_PING => Ok(handle_ping(&req)),
        other => {
            debug!(user_id = %session.user_id, kind = other, "ws: unknown message type, ignoring");
            Ok(Outcome::Ignore)
        }
    };

    match result {
        Ok(Outcome::Reply(reply)) => deliver(session, reply).await,
        Ok(Outcome::ReplyAndPresence(reply)) => {
            let direct = deliver(session, reply).await;
            if let Some(joined) = &session.joined {
                joined.room.broadcast_presence().await;
            }
            direct
        }
        Ok(Outcome::Ignore) => Vec::new(),
        Err(e) => {
            warn!(user_id = %session.user_id, kind = %req.kind, code = e.error_code(), error = %e, "ws: request failed");
            deliver(session, req.error_from(&e)).await
        }
    }
}

/// Queue on the joined connection, or hand back to the transport.
async fn deliver(session: &Session, envelope: Envelope) -> Vec<Envelope> {
    let Some(joined) = &session.joined else {
        return vec![envelope];
    };
    if let Err(e) = joined.conn.send(&envelope).await {
        debug!(user_id = %session.user_id, kind = %envelope.kind, error = %e, "ws: reply dropped");
    }
    Vec::new()
}

/// Tear down a joined session. Presence is only rebroadcast when this
/// connection was still the registered one.
pub(crate) async fn leave(state: &AppState, session: &mut Session) {
    let Some(joined) = session.joined.take() else {
        return;
    };

    if joined
        .room
        .disconnect(session.user_id, joined.conn.conn_id())
    {
        joined.room.broadcast_presence().await;
    } else {
        debug!(user_id = %session.user_id, code = %joined.code, "ws: connection already superseded");
    }
    joined.conn.close();

    if let Err(e) = with_timeout(STORE_TIMEOUT, state.store.touch_user(session.user_id)).await {
        warn!(user_id = %session.user_id, error = %e, "ws: failed to touch user activity");
    }
    info!(user_id = %session.user_id, code = %joined.code, "ws: left room");
}

// =============================================================================
// ROOM HANDLERS
// =============================================================================

async fn handle_join(
    state: &AppState,
    session: &mut Session,
    factory: &mut dyn ConnFactory,
    req: &Envelope,
) -> Result<Outcome, RoomError> {
    if session.joined.is_some() {
        return Err(RoomError::Validation("already joined".into()));
    }

    let invalid = || RoomError::Validation("invalid join payload".into());
    let payload: JoinPayload = req.parse_payload().map_err(|_| invalid())?;
    let code = payload.code.trim().to_owned();
    let display_name = payload.display_name.trim().to_owned();
    if code.is_empty() || display_name.is_empty() {
        return Err(invalid());
    }
    let role: Role = payload.role.parse().map_err(|_| invalid())?;

    let user_id = session.user_id;
    let room_row = with_timeout(STORE_TIMEOUT, state.store.room_by_code(&code))
        .await?
        .ok_or_else(|| RoomError::RoomNotFound(code.clone()))?;

    if role == Role::Host && room_row.owner_user_id != user_id {
        return Err(RoomError::Authorization("not host".into()));
    }

    with_timeout(STORE_TIMEOUT, state.store.upsert_member(room_row.id, user_id, &display_name, role)).await?;
    if let Err(e) = with_timeout(STORE_TIMEOUT, state.store.touch_room(room_row.id)).await {
        warn!(%user_id, %code, error = %e, "ws: failed to touch room activity");
    }

    let Some(conn) = factory.open(user_id, role, &display_name) else {
        return Err(RoomError::Validation("already joined".into()));
    };
    let room = state.hub.join(&code, conn.clone());

    match with_timeout(STORE_TIMEOUT, state.store.list_members(room_row.id)).await {
        Ok(members) => room.hydrate(members),
        Err(e) => {
            warn!(%user_id, %code, error = %e, "ws: failed to load members, using cached presence");
            let score = room.member(user_id).map_or(0, |m| m.score);
            room.upsert_member_state(MemberState {
                user_id: conn.user_id(),
                display_name: conn.display_name().to_owned(),
                role: conn.role(),
                score,
                connected: true,
            });
            room.sync_connected();
        }
    }

    info!(%user_id, %code, %role, "ws: joined room");

    let mut data = Data::new();
    data.insert("code".into(), serde_json::json!(code));
    data.insert("roomId".into(), serde_json::json!(room_row.id));
    data.insert("userId".into(), serde_json::json!(user_id));
    data.insert("role".into(), serde_json::json!(role));

    session.joined = Some(Joined { room, conn, room_id: room_row.id, code, role });

    Ok(Outcome::ReplyAndPresence(req.reply(kinds::ROOM_JOINED, data)))
}

/// Resolve the caller's joined room and require the host role.
fn require_host(session: &Session) -> Result<&Joined, RoomError> {
    let joined = session.joined.as_ref().ok_or(RoomError::NotJoined)?;
    if joined.role != Role::Host {
        return Err(RoomError::Authorization("host only".into()));
    }
    Ok(joined)
}

/// An empty code means "the joined room"; anything else must match it.
fn check_code(joined: &Joined, code: &str) -> Result<(), RoomError> {
    if !code.is_empty() && code != joined.code {
        return Err(RoomError::Validation(format!("not joined to room {code}")));
    }
    Ok(())
}

async fn handle_start_round(state: &AppState, session: &Session, req: &Envelope) -> Result<Outcome, RoomError> {
    let joined = require_host(session)?;

    let payload: StartRoundPayload = req
        .parse_payload()
        .map_err(|e| RoomError::Validation(format!("invalid payload: {e}")))?;
    if payload.code.is_empty() {
        return Err(RoomError::Validation("code is required".into()));
    }
    check_code(joined, &payload.code)?;
    let lang = payload
        .lang
        .filter(|l| !l.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_LANG.to_owned());

    let players = joined.room.player_ids();
    if players.is_empty() {
        return Err(RoomError::Validation("no players connected".into()));
    }

    let started = with_timeout(ROUND_START_TIMEOUT, state.store.start_round(joined.room_id, &lang, &players)).await?;

    info!(code = %joined.code, round_id = %started.round_id, players = players.len(), %lang, "ws: round started");

    for assignment in &started.assignments {
        let others: Vec<_> = started.others(assignment.user_id).collect();
        let mut data = Data::new();
        data.insert("roundId".into(), serde_json::json!(started.round_id));
        data.insert("assignments".into(), serde_json::to_value(&others).unwrap_or_default());
        joined
            .room
            .send_to(assignment.user_id, &Envelope::new(kinds::ROUND_ASSIGNED, data))
            .await;
    }

    let mut data = Data::new();
    data.insert("roundId".into(), serde_json::json!(started.round_id));
    data.insert("playerCount".into(), serde_json::json!(started.assignments.len()));
    data.insert("lang".into(), serde_json::json!(lang));
    Ok(Outcome::ReplyAndPresence(req.reply(kinds::HOST_ROUND_STARTED, data)))
}

async fn handle_end_round(state: &AppState, session: &Session, req: &Envelope) -> Result<Outcome, RoomError> {
    let joined = require_host(session)?;

    let payload: EndRoundPayload = req
        .parse_payload()
        .map_err(|e| RoomError::Validation(format!("invalid payload: {e}")))?;
    check_code(joined, &payload.code)?;

    with_timeout(STORE_TIMEOUT, state.store.end_round(joined.room_id)).await?;
    info!(code = %joined.code, "ws: round ended");

    let mut data = Data::new();
    data.insert("code".into(), serde_json::json!(joined.code));
    Ok(Outcome::ReplyAndPresence(req.reply(kinds::HOST_ROUND_ENDED, data)))
}

async fn handle_score_add(state: &AppState, session: &Session, req: &Envelope) -> Result<Outcome, RoomError> {
    let joined = require_host(session)?;

    let invalid = || RoomError::Validation("userId and delta required, delta must be non-zero".into());
    let payload: ScoreAddPayload = req.parse_payload().map_err(|_| invalid())?;
    let target: Uuid = payload.user_id.parse().map_err(|_| invalid())?;
    if payload.delta == 0 {
        return Err(invalid());
    }

    with_timeout(STORE_TIMEOUT, state.store.add_member_score(joined.room_id, target, payload.delta)).await?;

    match with_timeout(STORE_TIMEOUT, state.store.list_members(joined.room_id)).await {
        Ok(members) => joined.room.hydrate(members),
        Err(e) => warn!(code = %joined.code, error = %e, "ws: failed to reload members after score update"),
    }

    let mut data = Data::new();
    data.insert("userId".into(), serde_json::json!(target));
    data.insert("delta".into(), serde_json::json!(payload.delta));
    Ok(Outcome::ReplyAndPresence(req.reply(kinds::HOST_SCORE_ADDED, data)))
}

fn handle_ping(req: &Envelope) -> Outcome {
    let mut data = Data::new();
    data.insert("ts".into(), serde_json::json!(now_ms()));
    Outcome::Reply(req.reply(kinds::SERVER_PONG, data))
}

// =============================================================================
// HELPERS
// =============================================================================

async fn with_timeout<T>(limit: Duration, fut: impl Future<Output = Result<T, RoomError>>) -> Result<T, RoomError> {
    timeout(limit, fut)
        .await
        .map_err(|_| RoomError::Timeout)?
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
