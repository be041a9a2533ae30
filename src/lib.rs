use std::sync::Arc;

pub mod auth;
pub mod broker;
pub mod config;
pub mod error;
pub mod models;
pub mod routes;
pub mod services;
pub mod watcher;

use broker::Broker;
use config::Config;
use services::index::Index;
use services::notes::NoteService;
use services::vault::Vault;

/// Shared state handed to every request handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub vault: Arc<Vault>,
    pub index: Arc<Index>,
    pub notes: Arc<NoteService>,
    pub broker: Broker,
}

/// Build the full application router.
pub fn app(state: AppState) -> axum::Router {
    routes::router(state)
}
