use axum::extract::{Path, State};
use axum::Json;

use crate::error::Result;
use crate::models::note::Graph;
use crate::AppState;

pub async fn graph(State(state): State<AppState>) -> Result<Json<Graph>> {
    Ok(Json(state.index.graph()?))
}

/// Backlinks by raw target: a wikilink token or a full path, as written.
pub async fn backlinks(
    State(state): State<AppState>,
    Path(target): Path<String>,
) -> Result<Json<Vec<String>>> {
    Ok(Json(state.index.backlinks(&target)?))
}
