use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::Json;
use serde::Deserialize;

use crate::error::Result;
use crate::models::note::{Note, NoteSummary};
use crate::services::index::{SortKey, DEFAULT_LIST_LIMIT};
use crate::AppState;

const MAX_LIST_LIMIT: u32 = 500;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    pub tag: Option<String>,
    pub sort: Option<String>,
}

pub async fn list_notes(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<NoteSummary>>> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .min(MAX_LIST_LIMIT);
    let notes = state.index.list_notes(
        limit,
        query.offset.unwrap_or(0),
        query.tag.as_deref(),
        SortKey::parse(query.sort.as_deref()),
    )?;
    Ok(Json(notes))
}

#[derive(Debug, Deserialize)]
pub struct CreateNoteRequest {
    pub path: String,
    pub content: String,
}

pub async fn create_note(
    State(state): State<AppState>,
    Json(req): Json<CreateNoteRequest>,
) -> Result<(StatusCode, Json<Note>)> {
    let note = state.notes.create(&req.path, &req.content)?;
    Ok((StatusCode::CREATED, Json(note)))
}

pub async fn get_note(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> Result<Json<Note>> {
    Ok(Json(state.notes.get(&path)?))
}

pub async fn update_note(
    State(state): State<AppState>,
    Path(path): Path<String>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<Note>> {
    let if_match = headers
        .get(header::IF_MATCH)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().trim_matches('"'));
    Ok(Json(state.notes.update(&path, &body, if_match)?))
}

pub async fn delete_note(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> Result<StatusCode> {
    state.notes.delete(&path)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct MoveNoteRequest {
    pub from: String,
    pub to: String,
}

pub async fn move_note(
    State(state): State<AppState>,
    Json(req): Json<MoveNoteRequest>,
) -> Result<Json<Note>> {
    Ok(Json(state.notes.rename(&req.from, &req.to)?))
}
