use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;

use crate::error::Result;
use crate::models::note::SearchHit;
use crate::services::index::TagCount;
use crate::AppState;

const DEFAULT_SEARCH_LIMIT: u32 = 20;
const MAX_SEARCH_LIMIT: u32 = 100;

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub q: Option<String>,
    pub limit: Option<u32>,
}

pub async fn search(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Vec<SearchHit>>> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_SEARCH_LIMIT)
        .min(MAX_SEARCH_LIMIT);
    let hits = state.index.search(query.q.as_deref().unwrap_or(""), limit)?;
    Ok(Json(hits))
}

pub async fn tags(State(state): State<AppState>) -> Result<Json<Vec<TagCount>>> {
    Ok(Json(state.index.all_tags()?))
}
