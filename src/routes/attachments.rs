use axum::body::Body;
use axum::extract::{Multipart, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tokio_util::io::ReaderStream;

use crate::error::{Error, Result};
use crate::AppState;

const MAX_FILE_SIZE: usize = 10 * 1024 * 1024; // 10MB

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub path: String,
    pub size: usize,
}

/// Store an uploaded file under `attachments/` in the vault. Same path
/// validation and atomic write as any other vault file.
pub async fn upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<UploadResponse>)> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::Invalid(format!("multipart: {e}")))?
    {
        if field.name() != Some("file") {
            continue;
        }

        let original = field
            .file_name()
            .map(sanitize_filename)
            .unwrap_or_else(|| format!("upload-{}", chrono::Utc::now().timestamp_millis()));

        let data = field
            .bytes()
            .await
            .map_err(|e| Error::Invalid(format!("read upload: {e}")))?;
        if data.len() > MAX_FILE_SIZE {
            return Err(Error::Invalid(format!(
                "file too large, maximum is {} MB",
                MAX_FILE_SIZE / 1024 / 1024
            )));
        }

        let rel = unique_attachment_path(&state, &original)?;
        state.vault.write(&rel, &data)?;

        return Ok((
            StatusCode::CREATED,
            Json(UploadResponse {
                path: rel,
                size: data.len(),
            }),
        ));
    }

    Err(Error::Invalid("no file field in upload".into()))
}

pub async fn download(State(state): State<AppState>, Path(path): Path<String>) -> Result<Response> {
    let rel = format!("attachments/{path}");
    let abs = state.vault.resolve(&rel)?;
    if !abs.is_file() {
        return Err(Error::NotFound(rel));
    }

    let file = tokio::fs::File::open(&abs).await?;
    let body = Body::from_stream(ReaderStream::new(file));

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, content_type(&path))],
        body,
    )
        .into_response())
}

fn sanitize_filename(original: &str) -> String {
    let (name, ext) = match original.rfind('.') {
        Some(idx) => (&original[..idx], &original[idx..]),
        None => (original, ""),
    };

    let safe: String = name
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();

    format!("{safe}{ext}")
}

fn unique_attachment_path(state: &AppState, filename: &str) -> Result<String> {
    let candidate = format!("attachments/{filename}");
    if !state.vault.resolve(&candidate)?.exists() {
        return Ok(candidate);
    }

    let (name, ext) = match filename.rfind('.') {
        Some(idx) => (&filename[..idx], &filename[idx..]),
        None => (filename, ""),
    };
    Ok(format!(
        "attachments/{name}_{}{ext}",
        chrono::Utc::now().timestamp_millis()
    ))
}

fn content_type(filename: &str) -> &'static str {
    let ext = filename.rsplit('.').next().unwrap_or("").to_lowercase();

    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "pdf" => "application/pdf",
        "md" | "txt" => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}
