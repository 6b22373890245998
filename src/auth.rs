//! Session-cookie auth shim.
//!
//! The production dashboard resolves identities through its own user
//! directory and OAuth flow; the chat core only needs "the session carries
//! a user id before the channel opens". This module provides exactly that.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{debug_handler, Form, Router};
use serde::Deserialize;
use tower_sessions::Session;

use crate::session::USER_ID;
use crate::{AppResult, AppState};

#[derive(Deserialize)]
pub struct LoginForm {
    pub user_id: String,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/login", post(login))
        .route("/logout", get(logout))
}

#[debug_handler]
async fn login(session: Session, Form(LoginForm { user_id }): Form<LoginForm>) -> AppResult<Response> {
    if user_id.is_empty() {
        return Ok((StatusCode::BAD_REQUEST, "user_id must not be empty").into_response());
    }

    session.insert(USER_ID, &user_id).await?;
    tracing::info!(%user_id, "session established");
    Ok(StatusCode::NO_CONTENT.into_response())
}

#[debug_handler]
async fn logout(session: Session) -> AppResult<Response> {
    session.flush().await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}
