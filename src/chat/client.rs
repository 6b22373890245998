//! Client half of the chat channel, for tools and tests that talk to the
//! dashboard server. One session per authenticated user: it owns the socket,
//! mirrors conversation state in memory, and re-dials with backoff when the
//! channel drops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use reqwest::header::COOKIE;
use time::OffsetDateTime;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use super::message::{ChatMessage, Inbound, Outbound};

const BACKOFF_BASE_MS: u64 = 500;
const BACKOFF_CAP: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Open,
}

struct Shared {
    http_base: String,
    ws_url: String,
    cookie: String,
    user_id: String,
    peer_id: String,
    state: Mutex<SessionState>,
    messages: Mutex<Vec<ChatMessage>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    closed: AtomicBool,
}

impl Shared {
    fn set_state(&self, state: SessionState) {
        *self.state.lock().expect("state lock poisoned") = state;
    }
}

/// A live chat session against one peer.
pub struct ChatSession {
    shared: Arc<Shared>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl ChatSession {
    /// `http_base` is the server origin, e.g. `http://127.0.0.1:8080`;
    /// `cookie` an already-authenticated session cookie.
    pub fn new(
        http_base: impl Into<String>,
        cookie: impl Into<String>,
        user_id: impl Into<String>,
        peer_id: impl Into<String>,
    ) -> anyhow::Result<Self> {
        let http_base = http_base.into();
        let ws_url = ws_url_for(&http_base)?;

        Ok(Self {
            shared: Arc::new(Shared {
                http_base,
                ws_url,
                cookie: cookie.into(),
                user_id: user_id.into(),
                peer_id: peer_id.into(),
                state: Mutex::new(SessionState::Disconnected),
                messages: Mutex::new(Vec::new()),
                outbound: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
            task: None,
        })
    }

    /// Start the connect/reconnect loop. Idempotent.
    pub fn connect(&mut self) {
        if self.task.is_none() {
            let shared = self.shared.clone();
            self.task = Some(tokio::spawn(run(shared)));
        }
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.lock().expect("state lock poisoned")
    }

    /// Snapshot of the locally mirrored conversation.
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.shared.messages.lock().expect("messages lock poisoned").clone()
    }

    /// Send a chat message to the peer. The local copy is appended
    /// optimistically before the server echo; if the channel is not open
    /// the wire send is dropped (reconnect catch-up will reconcile).
    pub fn send(&self, content: &str, attachment_url: Option<String>) {
        let local = ChatMessage {
            id: format!("local-{}", Uuid::now_v7()),
            sender_id: self.shared.user_id.clone(),
            receiver_id: self.shared.peer_id.clone(),
            message: content.to_owned(),
            attachment_url: attachment_url.clone(),
            read: false,
            created_at: OffsetDateTime::now_utc(),
        };
        self.shared
            .messages
            .lock()
            .expect("messages lock poisoned")
            .push(local);

        let envelope = Inbound::Chat {
            sender_id: self.shared.user_id.clone(),
            receiver_id: self.shared.peer_id.clone(),
            content: content.to_owned(),
            attachment_url,
        };
        let frame = match serde_json::to_string(&envelope) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::error!(error = %err, "failed to encode chat envelope");
                return;
            }
        };

        let outbound = self.shared.outbound.lock().expect("outbound lock poisoned");
        match outbound.as_ref() {
            Some(tx) if tx.send(frame).is_ok() => {}
            _ => tracing::debug!("chat channel not open, dropping send"),
        }
    }

    /// Tear the session down; no further reconnect attempts.
    pub fn close(&mut self) {
        self.shared.closed.store(true, Ordering::Relaxed);
        self.shared
            .outbound
            .lock()
            .expect("outbound lock poisoned")
            .take();
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.shared.set_state(SessionState::Disconnected);
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.close();
    }
}

fn ws_url_for(http_base: &str) -> anyhow::Result<String> {
    if let Some(rest) = http_base.strip_prefix("https://") {
        Ok(format!("wss://{rest}/chat/ws"))
    } else if let Some(rest) = http_base.strip_prefix("http://") {
        Ok(format!("ws://{rest}/chat/ws"))
    } else {
        anyhow::bail!("expected an http(s) base url, got `{http_base}`")
    }
}

/// Exponential backoff with up to 50% added jitter, capped at 30s.
fn backoff_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE_MS.saturating_mul(1 << attempt.min(10));
    let capped = Duration::from_millis(exp).min(BACKOFF_CAP);
    capped.mul_f64(1.0 + rand::rng().random_range(0.0..0.5))
}

async fn run(shared: Arc<Shared>) {
    let mut attempt: u32 = 0;
    loop {
        if shared.closed.load(Ordering::Relaxed) {
            break;
        }
        shared.set_state(SessionState::Connecting);

        match open_socket(&shared).await {
            Ok(stream) => {
                attempt = 0;

                // Patch whatever was missed while disconnected before
                // reporting the channel open; sends issued once the state
                // is Open must survive the catch-up replace.
                if let Err(err) = catch_up(&shared).await {
                    tracing::warn!(error = %err, "conversation catch-up failed");
                }

                let (tx, rx) = mpsc::unbounded_channel();
                *shared.outbound.lock().expect("outbound lock poisoned") = Some(tx);
                shared.set_state(SessionState::Open);

                drive_socket(&shared, stream, rx).await;

                shared.outbound.lock().expect("outbound lock poisoned").take();
                shared.set_state(SessionState::Disconnected);
            }
            Err(err) => {
                shared.set_state(SessionState::Disconnected);
                tracing::debug!(error = %err, "chat channel connect failed");
            }
        }

        if shared.closed.load(Ordering::Relaxed) {
            break;
        }
        let delay = backoff_delay(attempt);
        attempt = attempt.saturating_add(1);
        tracing::debug!(attempt, ?delay, "reconnecting chat channel");
        tokio::time::sleep(delay).await;
    }
}

async fn open_socket(
    shared: &Shared,
) -> anyhow::Result<WebSocketStream<MaybeTlsStream<TcpStream>>> {
    let mut request = shared.ws_url.as_str().into_client_request()?;
    request.headers_mut().insert(
        tokio_tungstenite::tungstenite::http::header::COOKIE,
        shared.cookie.parse()?,
    );
    let (stream, _) = connect_async(request).await?;
    Ok(stream)
}

async fn drive_socket(
    shared: &Shared,
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut rx: mpsc::UnboundedReceiver<String>,
) {
    let (mut sink, mut reader) = stream.split();
    loop {
        tokio::select! {
            out = rx.recv() => match out {
                Some(frame) => {
                    if sink.send(Message::Text(frame.into())).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            frame = reader.next() => match frame {
                Some(Ok(Message::Text(text))) => on_frame(shared, text.as_str()),
                Some(Ok(Message::Ping(data))) => {
                    let _ = sink.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    tracing::debug!(error = %err, "chat channel transport error");
                    break;
                }
            }
        }
    }
}

fn on_frame(shared: &Shared, raw: &str) {
    match serde_json::from_str::<Outbound>(raw) {
        Ok(Outbound::Chat { data }) => {
            shared
                .messages
                .lock()
                .expect("messages lock poisoned")
                .push(data);
        }
        Err(err) => tracing::warn!(error = %err, "dropping unrecognized server frame"),
    }
}

/// Re-fetch both directions of the conversation over REST and replace the
/// local mirror with the server's view.
async fn catch_up(shared: &Shared) -> anyhow::Result<()> {
    let client = reqwest::Client::new();
    let mut merged: Vec<ChatMessage> = Vec::new();
    for (from, to) in [
        (&shared.user_id, &shared.peer_id),
        (&shared.peer_id, &shared.user_id),
    ] {
        let url = format!("{}/chat/messages/{from}/{to}", shared.http_base);
        let batch: Vec<ChatMessage> = client
            .get(&url)
            .header(COOKIE, &shared.cookie)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        merged.extend(batch);
    }
    // Server ids are assigned monotonically, so they carry creation order
    // across both directions of the conversation.
    merged.sort_by(|a, b| a.id.cmp(&b.id));
    *shared.messages.lock().expect("messages lock poisoned") = merged;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_url_swaps_scheme() {
        assert_eq!(
            ws_url_for("http://127.0.0.1:8080").unwrap(),
            "ws://127.0.0.1:8080/chat/ws"
        );
        assert_eq!(
            ws_url_for("https://chat.example.com").unwrap(),
            "wss://chat.example.com/chat/ws"
        );
        assert!(ws_url_for("ftp://nope").is_err());
    }

    #[test]
    fn backoff_grows_exponentially_within_jitter_bounds() {
        for attempt in 0..12u32 {
            let base = Duration::from_millis(
                BACKOFF_BASE_MS.saturating_mul(1 << attempt.min(10)),
            )
            .min(BACKOFF_CAP);
            let delay = backoff_delay(attempt);
            assert!(delay >= base, "attempt {attempt}: {delay:?} < {base:?}");
            assert!(
                delay <= base.mul_f64(1.5),
                "attempt {attempt}: {delay:?} > 1.5x {base:?}"
            );
        }
    }

    #[test]
    fn backoff_is_capped() {
        assert!(backoff_delay(30) <= BACKOFF_CAP.mul_f64(1.5));
    }

    #[tokio::test]
    async fn session_starts_disconnected() {
        let session = ChatSession::new("http://127.0.0.1:1", "id=x", "u1", "u2").unwrap();
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(session.messages().is_empty());
    }

    #[tokio::test]
    async fn send_while_disconnected_keeps_optimistic_copy() {
        let session = ChatSession::new("http://127.0.0.1:1", "id=x", "u1", "u2").unwrap();
        session.send("hello", None);

        let messages = session.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].message, "hello");
        assert_eq!(messages[0].sender_id, "u1");
        assert_eq!(messages[0].receiver_id, "u2");
        assert!(!messages[0].read);
        assert!(messages[0].id.starts_with("local-"));
    }

    #[tokio::test]
    async fn inbound_chat_frames_are_appended() {
        let session = ChatSession::new("http://127.0.0.1:1", "id=x", "u1", "u2").unwrap();
        let raw = r#"{"type":"chat","data":{
            "id":"m1","senderId":"u2","receiverId":"u1","message":"yo",
            "attachmentUrl":null,"read":false,"createdAt":"2026-01-01T00:00:00Z"}}"#;
        on_frame(&session.shared, raw);
        on_frame(&session.shared, "garbage");

        let messages = session.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].message, "yo");
    }
}
