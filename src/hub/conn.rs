//! Socket connection wrapper.
//!
//! DESIGN
//! ======
//! A `WsConn` owns a bounded outbound queue. Exactly one writer task drains
//! it into the socket sink, so writes for one socket never interleave no
//! matter how many tasks call `send` concurrently.
//!
//! LIFECYCLE
//! =========
//! 1. `spawn` moves the sink into the writer task
//! 2. producers `send` -> serialized text is queued (cap 64)
//! 3. `close` (or a failed write) cancels the token
//! 4. the writer closes the queue, sends a close frame, drops the sink
//!
//! The cancellation token is shared with the socket's read loop, which
//! treats cancellation as end-of-stream and runs the normal teardown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, close_code};
use futures::{Sink, SinkExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Conn, ConnError};
use crate::envelope::Envelope;
use crate::services::room::Role;

pub const OUTBOUND_QUEUE_CAPACITY: usize = 64;

pub(crate) const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct WsConn {
    id: Uuid,
    user_id: Uuid,
    role: Role,
    display_name: String,
    tx: mpsc::Sender<String>,
    cancel: CancellationToken,
    closed: AtomicBool,
    last_seen: Mutex<Instant>,
}

impl WsConn {
    /// Wrap `sink` and start its writer task.
    ///
    /// `cancel` is the connection's lifetime token; cancelling it from
    /// anywhere closes the wrapper.
    pub fn spawn<S>(sink: S, user_id: Uuid, role: Role, display_name: &str, cancel: CancellationToken) -> Arc<Self>
    where
        S: Sink<Message> + Unpin + Send + 'static,
        S::Error: std::fmt::Display,
    {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let conn = Arc::new(Self {
            id: Uuid::new_v4(),
            user_id,
            role,
            display_name: display_name.to_owned(),
            tx,
            cancel: cancel.clone(),
            closed: AtomicBool::new(false),
            last_seen: Mutex::new(Instant::now()),
        });
        tokio::spawn(write_loop(sink, rx, cancel, user_id));
        conn
    }

    /// Record inbound activity.
    pub fn touch(&self) {
        *self
            .last_seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[async_trait::async_trait]
impl Conn for WsConn {
    async fn send(&self, envelope: &Envelope) -> Result<(), ConnError> {
        let text = envelope.to_text().map_err(|e| {
            warn!(user_id = %self.user_id, kind = %envelope.kind, error = %e, "ws: failed to encode message");
            ConnError::Encode(e.to_string())
        })?;

        if self.cancel.is_cancelled() {
            return Err(ConnError::Closed);
        }

        tokio::select! {
            biased;
            () = self.cancel.cancelled() => {
                warn!(user_id = %self.user_id, kind = %envelope.kind, "ws: failed to queue message (connection closed)");
                Err(ConnError::Closed)
            }
            sent = self.tx.send(text) => {
                if sent.is_err() {
                    return Err(ConnError::Closed);
                }
                debug!(user_id = %self.user_id, kind = %envelope.kind, "ws: message queued");
                Ok(())
            }
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(user_id = %self.user_id, conn_id = %self.id, "ws: closing connection");
        self.cancel.cancel();
    }

    fn conn_id(&self) -> Uuid {
        self.id
    }

    fn user_id(&self) -> Uuid {
        self.user_id
    }

    fn role(&self) -> Role {
        self.role
    }

    fn display_name(&self) -> &str {
        &self.display_name
    }

    fn last_seen(&self) -> Instant {
        *self
            .last_seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

// =============================================================================
// WRITER
// =============================================================================

async fn write_loop<S>(mut sink: S, mut rx: mpsc::Receiver<String>, cancel: CancellationToken, user_id: Uuid)
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: std::fmt::Display,
{
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            next = rx.recv() => {
                let Some(text) = next else { break };
                let bytes = text.len();
                match timeout(WRITE_TIMEOUT, sink.send(Message::Text(text.into()))).await {
                    Ok(Ok(())) => debug!(%user_id, bytes, "ws: message sent"),
                    Ok(Err(e)) => {
                        warn!(%user_id, error = %e, "ws: failed to write message");
                        break;
                    }
                    Err(_) => {
                        warn!(%user_id, "ws: write timed out");
                        break;
                    }
                }
            }
        }
    }

    // A failed write ends the connection the same way an explicit close does.
    cancel.cancel();
    rx.close();

    let close = Message::Close(Some(CloseFrame { code: close_code::NORMAL, reason: "bye".into() }));
    let _ = timeout(WRITE_TIMEOUT, sink.send(close)).await;
    let _ = timeout(WRITE_TIMEOUT, sink.close()).await;
    info!(%user_id, "ws: writer stopped");
}

#[cfg(test)]
#[path = "conn_test.rs"]
mod tests;
