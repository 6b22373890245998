use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tower_sessions::Session;

use crate::config::FanoutScope;
use crate::session::USER_ID;
use crate::{AppResult, AppState};

use super::message::{Inbound, Outbound};
use super::registry::ConnectionRegistry;
use super::store::MessageStore;

/// GET /chat/ws — upgrade to the live chat channel. The session must
/// already carry a user id; identity resolution happens before the
/// channel opens, never on it.
pub async fn chat_ws(
    State(state): State<AppState>,
    session: Session,
    ws: WebSocketUpgrade,
) -> AppResult<Response> {
    let Some(user_id) = session.get::<String>(USER_ID).await? else {
        return Ok(StatusCode::UNAUTHORIZED.into_response());
    };

    Ok(ws.on_upgrade(move |socket| run_channel(socket, state, user_id)))
}

async fn run_channel(socket: WebSocket, state: AppState, user_id: String) {
    let (sink, mut receiver) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel();
    let conn_id = state.registry.register(&user_id, tx);
    tracing::info!(%user_id, %conn_id, "chat channel open");

    let last_pong = Arc::new(Mutex::new(Instant::now()));
    let mut writer = tokio::spawn(writer_task(
        sink,
        rx,
        state.config.heartbeat_interval,
        state.config.pong_timeout,
        last_pong.clone(),
    ));

    loop {
        tokio::select! {
            _ = &mut writer => break,
            frame = receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    handle_frame(
                        state.store.as_ref(),
                        &state.registry,
                        state.config.fanout,
                        text.as_str(),
                    )
                    .await;
                }
                Some(Ok(Message::Pong(_))) => {
                    *last_pong.lock().expect("pong lock poisoned") = Instant::now();
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    tracing::debug!(%user_id, error = %err, "channel transport error");
                    break;
                }
            }
        }
    }

    state.registry.unregister(conn_id);
    writer.abort();
    tracing::info!(%user_id, %conn_id, "chat channel closed");
}

/// Owns the socket's send half. Drains the outbound queue and pings on an
/// interval; a channel that stays silent past the pong deadline is closed
/// so the registry's live set only holds live connections.
async fn writer_task(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<String>,
    heartbeat: Duration,
    pong_timeout: Duration,
    last_pong: Arc<Mutex<Instant>>,
) {
    let mut ping = tokio::time::interval(heartbeat);
    ping.tick().await;

    loop {
        tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(text) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            _ = ping.tick() => {
                let silent = last_pong.lock().expect("pong lock poisoned").elapsed();
                if silent > heartbeat + pong_timeout {
                    tracing::warn!("no pong within deadline, closing channel");
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code: 1001,
                            reason: "pong timeout".into(),
                        })))
                        .await;
                    break;
                }
                if sink.send(Message::Ping(Bytes::from_static(b"hb"))).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// One inbound frame: validate, persist, then fan out. Fire-and-forget —
/// malformed frames and persistence failures are logged and dropped, and
/// the broadcast only ever carries a message that was stored first.
pub(crate) async fn handle_frame(
    store: &dyn MessageStore,
    registry: &ConnectionRegistry,
    fanout: FanoutScope,
    raw: &str,
) {
    let envelope = match serde_json::from_str::<Inbound>(raw) {
        Ok(envelope) => envelope,
        Err(err) => {
            tracing::warn!(error = %err, "dropping malformed envelope");
            return;
        }
    };

    let Inbound::Chat {
        sender_id,
        receiver_id,
        content,
        attachment_url,
    } = envelope;

    let stored = match store
        .create_message(&sender_id, &receiver_id, &content, attachment_url.as_deref())
        .await
    {
        Ok(stored) => stored,
        Err(err) => {
            tracing::error!(%sender_id, %receiver_id, error = %err, "dropping message, persistence failed");
            return;
        }
    };

    let payload = match serde_json::to_string(&Outbound::Chat {
        data: stored.clone(),
    }) {
        Ok(payload) => payload,
        Err(err) => {
            tracing::error!(message_id = %stored.id, error = %err, "failed to encode outbound envelope");
            return;
        }
    };

    let delivered = match fanout {
        FanoutScope::All => registry.broadcast(&payload),
        FanoutScope::Participants => registry.send_to_users(
            &[stored.sender_id.as_str(), stored.receiver_id.as_str()],
            &payload,
        ),
    };
    tracing::debug!(message_id = %stored.id, delivered, "chat message fanned out");
}
