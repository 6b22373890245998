pub mod appresult;
pub mod auth;
pub mod chat;
pub mod config;
pub mod session;

use std::sync::Arc;

use axum::extract::FromRef;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_sessions::cookie::SameSite;
use tower_sessions::{Expiry, MemoryStore, SessionManagerLayer};

pub use appresult::{AppError, AppResult};
use chat::registry::ConnectionRegistry;
use chat::store::MessageStore;
use config::Config;

#[derive(Clone, FromRef)]
pub struct AppState {
    pub store: Arc<dyn MessageStore>,
    pub registry: ConnectionRegistry,
    pub config: Arc<Config>,
}

/// The full application router, session layer included. Shared between the
/// server binary and the integration tests.
pub fn app(state: AppState) -> Router {
    let session_store = MemoryStore::default();
    let session_layer = SessionManagerLayer::new(session_store)
        .with_secure(false)
        .with_same_site(SameSite::Lax)
        .with_expiry(Expiry::OnInactivity(time::Duration::hours(8)));

    Router::new()
        .merge(auth::router())
        .nest("/chat", chat::router())
        .with_state(state)
        .layer(session_layer)
        .layer(CorsLayer::permissive())
}
