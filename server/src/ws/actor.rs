//! One task group per socket: a writer that owns the sink, a heartbeat,
//! and the reader loop below. The hub reaches the client through the
//! writer's channel.

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::ops::ControlFlow;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};
use uuid::Uuid;

use crate::auth::middleware::Claims;
use crate::chat::typing;
use crate::presence::{announce_offline, announce_online};
use crate::state::AppState;
use crate::ws::protocol::{self, ConnCtx};
use crate::ws::ConnectionHandle;

const CLOSE_GOING_AWAY: u16 = 1001;

pub async fn run_connection(socket: WebSocket, state: AppState, claims: Claims) {
    let (sink, mut stream) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<Message>();
    let conn_id = Uuid::now_v7();
    let user_id = claims.sub.clone();

    state.hub.register(ConnectionHandle {
        id: conn_id,
        user_id: user_id.clone(),
        role: claims.role,
        sender: tx.clone(),
    });
    let joined = state
        .presence
        .connect(&user_id, &claims.name, claims.role, crate::now_millis());
    if let Some(participant) = joined {
        announce_online(&state, participant);
    }
    tracing::info!(
        user_id = %user_id,
        connection_id = %conn_id,
        role = %claims.role,
        "Connection opened"
    );

    let writer = tokio::spawn(write_frames(sink, rx));
    let (pong_tx, pong_rx) = mpsc::unbounded_channel::<()>();
    let mut heartbeat = tokio::spawn(heartbeat(
        tx.clone(),
        pong_rx,
        Duration::from_secs(state.connection.ping_interval_secs.max(1)),
        Duration::from_secs(state.connection.pong_timeout_secs.max(1)),
        user_id.clone(),
    ));

    // A silent peer never ends the stream, so the heartbeat finishing
    // ends the reader too.
    let ctx = ConnCtx { conn_id, claims };
    loop {
        let frame = tokio::select! {
            frame = stream.next() => frame,
            _ = &mut heartbeat => break,
        };
        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                tracing::warn!(user_id = %user_id, error = %e, "Socket read failed");
                break;
            }
            None => break,
        };
        let flow = on_frame(frame, &ctx, &state, &tx, &pong_tx).await;
        if flow.is_break() {
            break;
        }
    }

    writer.abort();
    heartbeat.abort();
    release(&state, conn_id, &user_id);
    tracing::info!(user_id = %user_id, connection_id = %conn_id, "Connection closed");
}

async fn on_frame(
    frame: Message,
    ctx: &ConnCtx,
    state: &AppState,
    tx: &mpsc::UnboundedSender<Message>,
    pong_tx: &mpsc::UnboundedSender<()>,
) -> ControlFlow<()> {
    let user_id = ctx.claims.sub.as_str();
    match frame {
        Message::Text(text) => {
            state.presence.touch(user_id, crate::now_millis());
            protocol::handle_text(text.as_str(), ctx, state).await;
        }
        Message::Pong(_) => {
            state.presence.touch(user_id, crate::now_millis());
            let _ = pong_tx.send(());
        }
        Message::Ping(data) => {
            let _ = tx.send(Message::Pong(data));
        }
        Message::Binary(_) => tracing::debug!(user_id = %user_id, "Binary frame ignored"),
        Message::Close(frame) => {
            tracing::debug!(user_id = %user_id, reason = ?frame, "Client closed");
            return ControlFlow::Break(());
        }
    }
    ControlFlow::Continue(())
}

/// Ping on a fixed cadence. Returns once a pong is missed or the writer
/// is gone; the reader treats that as the end of the connection.
async fn heartbeat(
    tx: mpsc::UnboundedSender<Message>,
    mut pongs: mpsc::UnboundedReceiver<()>,
    every: Duration,
    within: Duration,
    user_id: String,
) {
    let mut ticker = interval(every);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if tx.send(Message::Ping(Default::default())).is_err() {
            return;
        }
        if !matches!(timeout(within, pongs.recv()).await, Ok(Some(()))) {
            tracing::warn!(user_id = %user_id, "Heartbeat missed, dropping connection");
            let _ = tx.send(Message::Close(Some(CloseFrame {
                code: CLOSE_GOING_AWAY,
                reason: "Heartbeat timeout".into(),
            })));
            return;
        }
    }
}

/// Room memberships die with the connection. Only the participant's last
/// socket takes them offline and clears their typing flags.
fn release(state: &AppState, conn_id: Uuid, user_id: &str) {
    let last = state
        .hub
        .unregister(conn_id)
        .map(|(_, last)| last)
        .unwrap_or(true);
    if let Some(participant) = state.presence.disconnect(user_id, crate::now_millis()) {
        announce_offline(state, participant);
    }
    if last {
        typing::clear_user(state, user_id);
    }
}

async fn write_frames(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        let closing = matches!(msg, Message::Close(_));
        if sink.send(msg).await.is_err() || closing {
            break;
        }
    }
}
