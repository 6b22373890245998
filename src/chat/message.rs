use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// A persisted chat message. Immutable once stored except for the `read`
/// flag, which only ever moves false -> true.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub message: String,
    pub attachment_url: Option<String>,
    pub read: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Client -> server frames. Tagged so the channel can reject anything it
/// doesn't recognize at the boundary instead of poking at raw JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Inbound {
    #[serde(rename_all = "camelCase")]
    Chat {
        sender_id: String,
        receiver_id: String,
        content: String,
        #[serde(default)]
        attachment_url: Option<String>,
    },
}

/// Server -> client frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Outbound {
    Chat { data: ChatMessage },
}
