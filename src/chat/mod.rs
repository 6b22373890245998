pub mod client;
pub mod message;
pub mod registry;
pub mod store;
mod ws;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_sessions::Session;

use crate::session::USER_ID;
use crate::{AppResult, AppState};

use self::store::StoreError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/messages/{sender_id}/{receiver_id}", get(conversation))
        .route("/read/{id}", post(mark_read))
        .route("/ws", get(ws::chat_ws))
}

/// GET /chat/messages/{sender_id}/{receiver_id} — one direction of a
/// conversation, creation order. Used for initial page load and for
/// catch-up after a reconnect.
async fn conversation(
    State(state): State<AppState>,
    session: Session,
    Path((sender_id, receiver_id)): Path<(String, String)>,
) -> AppResult<Response> {
    if session.get::<String>(USER_ID).await?.is_none() {
        return Ok(StatusCode::UNAUTHORIZED.into_response());
    }

    match state.store.get_conversation(&sender_id, &receiver_id).await {
        Ok(messages) => Ok(Json(messages).into_response()),
        Err(err) => Ok(store_error_response(err)),
    }
}

/// POST /chat/read/{id} — read receipt. Idempotent, 404 on unknown id.
async fn mark_read(
    State(state): State<AppState>,
    session: Session,
    Path(id): Path<String>,
) -> AppResult<Response> {
    if session.get::<String>(USER_ID).await?.is_none() {
        return Ok(StatusCode::UNAUTHORIZED.into_response());
    }

    match state.store.mark_read(&id).await {
        Ok(()) => Ok(StatusCode::NO_CONTENT.into_response()),
        Err(err) => Ok(store_error_response(err)),
    }
}

fn store_error_response(err: StoreError) -> Response {
    match err {
        StoreError::NotFound(id) => {
            (StatusCode::NOT_FOUND, format!("message {id} not found")).into_response()
        }
        // The live channel is currently the only write path; this arm keeps
        // the mapping total for any future REST create endpoint.
        StoreError::EmptyBody => {
            (StatusCode::BAD_REQUEST, err.to_string()).into_response()
        }
        StoreError::Unavailable(err) => {
            tracing::error!(error = %err, "storage unavailable");
            (StatusCode::SERVICE_UNAVAILABLE, "storage unavailable".to_owned()).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_to_client_statuses() {
        assert_eq!(
            store_error_response(StoreError::NotFound("x".into())).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            store_error_response(StoreError::EmptyBody).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            store_error_response(StoreError::Unavailable(sqlx::Error::PoolClosed)).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
