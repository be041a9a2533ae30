pub mod attachments;
pub mod events;
pub mod graph;
pub mod notes;
pub mod search;

use axum::routing::{get, post};
use axum::{middleware, Router};
use tower_http::cors::CorsLayer;

use crate::{auth, AppState};

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route(
            "/notes",
            get(notes::list_notes).post(notes::create_note),
        )
        .route(
            "/notes/{*path}",
            get(notes::get_note)
                .put(notes::update_note)
                .delete(notes::delete_note),
        )
        .route("/move", post(notes::move_note))
        .route("/search", get(search::search))
        .route("/tags", get(search::tags))
        .route("/graph", get(graph::graph))
        .route("/backlinks/{*target}", get(graph::backlinks))
        .route("/events", get(events::subscribe))
        .route("/attachments", post(attachments::upload))
        .route("/attachments/{*path}", get(attachments::download))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ));

    Router::new()
        .route("/health", get(|| async { "ok" }))
        .nest("/api", api)
        // Local-only app; permissive CORS is fine.
        .layer(CorsLayer::permissive())
        .with_state(state)
}
