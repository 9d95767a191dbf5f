//! Remote file endpoints, all over the session's SFTP channel.
//!
//! - `GET    /api/files/home`                  — remote home directory
//! - `GET    /api/files/list?path=...`         — list a directory
//! - `GET    /api/files/stat?path=...`         — file info
//! - `GET    /api/files/read?path=...`         — read a file
//! - `PUT    /api/files/write`                 — write a file
//! - `POST   /api/files/rename`                — rename/move
//! - `DELETE /api/files?path=...&directory=`   — delete a file or empty directory
//! - `POST   /api/files/mkdir`                 — create a directory
//! - `GET    /api/files/download?path=...`     — streamed download
//! - `POST   /api/files/upload?dir=...`        — streamed multipart upload
//!
//! ## Path validation
//!
//! All paths must be absolute and must not contain `..` components or null
//! bytes. There is no working directory.
//!
//! ## Size limits
//!
//! Whole-file reads and writes are capped at `files.max_file_size` (default
//! 2 MiB); binary content travels as base64. Uploads are streamed and capped
//! at `files.max_upload_size`.

use axum::{
    body::Body,
    extract::{Multipart, Query, State},
    http::header,
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::auth::SessionContext;
use crate::error::MuxError;
use crate::files::{join_path, ContentEncoding};
use crate::transport::basename;
use crate::AppState;

/// `?path=` for the read-only endpoints.
#[derive(Deserialize)]
pub struct PathQuery {
    pub path: String,
}

/// Query parameters for `DELETE /api/files`.
#[derive(Deserialize)]
pub struct DeleteQuery {
    pub path: String,
    /// Remove an (empty) directory rather than a file.
    #[serde(default)]
    pub directory: bool,
}

/// Query parameters for `POST /api/files/upload`.
#[derive(Deserialize)]
pub struct UploadQuery {
    /// Absolute destination directory.
    pub dir: String,
}

/// Request body for `PUT /api/files/write`.
#[derive(Deserialize)]
pub struct WriteRequest {
    pub path: String,
    /// UTF-8 text, or base64 when `encoding` is `"base64"`.
    pub content: String,
    #[serde(default)]
    pub encoding: ContentEncoding,
}

/// Request body for `POST /api/files/rename`.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenameRequest {
    pub old_path: String,
    pub new_path: String,
}

/// Request body for `POST /api/files/mkdir`.
#[derive(Deserialize)]
pub struct MkdirRequest {
    pub path: String,
}

pub async fn home(
    State(state): State<AppState>,
    Extension(ctx): Extension<SessionContext>,
) -> Result<Json<Value>, MuxError> {
    let path = state.files.resolve_home(&ctx.session_id).await?;
    Ok(Json(json!({"path": path})))
}

pub async fn list(
    State(state): State<AppState>,
    Extension(ctx): Extension<SessionContext>,
    Query(q): Query<PathQuery>,
) -> Result<Json<Value>, MuxError> {
    let entries = state.files.list(&ctx.session_id, &q.path).await?;
    Ok(Json(json!({"path": q.path, "entries": entries})))
}

pub async fn stat(
    State(state): State<AppState>,
    Extension(ctx): Extension<SessionContext>,
    Query(q): Query<PathQuery>,
) -> Result<Json<Value>, MuxError> {
    let entry = state.files.stat(&ctx.session_id, &q.path).await?;
    Ok(Json(json!({"path": q.path, "entry": entry})))
}

pub async fn read(
    State(state): State<AppState>,
    Extension(ctx): Extension<SessionContext>,
    Query(q): Query<PathQuery>,
) -> Result<Json<Value>, MuxError> {
    let content = state.files.read(&ctx.session_id, &q.path).await?;
    Ok(Json(json!(content)))
}

pub async fn write(
    State(state): State<AppState>,
    Extension(ctx): Extension<SessionContext>,
    Json(req): Json<WriteRequest>,
) -> Result<Json<Value>, MuxError> {
    let size = state
        .files
        .write(&ctx.session_id, &req.path, &req.content, req.encoding)
        .await?;
    Ok(Json(json!({"path": req.path, "size": size})))
}

pub async fn rename(
    State(state): State<AppState>,
    Extension(ctx): Extension<SessionContext>,
    Json(req): Json<RenameRequest>,
) -> Result<Json<Value>, MuxError> {
    state
        .files
        .rename(&ctx.session_id, &req.old_path, &req.new_path)
        .await?;
    Ok(Json(json!({"status": "ok"})))
}

pub async fn delete(
    State(state): State<AppState>,
    Extension(ctx): Extension<SessionContext>,
    Query(q): Query<DeleteQuery>,
) -> Result<Json<Value>, MuxError> {
    state
        .files
        .delete(&ctx.session_id, &q.path, q.directory)
        .await?;
    Ok(Json(json!({"status": "ok"})))
}

pub async fn mkdir(
    State(state): State<AppState>,
    Extension(ctx): Extension<SessionContext>,
    Json(req): Json<MkdirRequest>,
) -> Result<Json<Value>, MuxError> {
    state.files.mkdir(&ctx.session_id, &req.path).await?;
    Ok(Json(json!({"status": "ok", "path": req.path})))
}

/// `Content-Disposition` value with quotes and control characters stripped
/// from the file name.
fn attachment_header(path: &str) -> String {
    let name: String = basename(path)
        .chars()
        .filter(|c| *c != '"' && *c != '\\' && !c.is_control())
        .collect();
    format!("attachment; filename=\"{name}\"")
}

/// `GET /api/files/download` — stream a remote file without buffering it.
pub async fn download(
    State(state): State<AppState>,
    Extension(ctx): Extension<SessionContext>,
    Query(q): Query<PathQuery>,
) -> Result<Response, MuxError> {
    let download = state.files.download(&ctx.session_id, &q.path).await?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_LENGTH, download.entry.size.to_string()),
            (header::CONTENT_DISPOSITION, attachment_header(&q.path)),
        ],
        Body::from_stream(download.stream),
    )
        .into_response())
}

/// `POST /api/files/upload` — every multipart field with a file name is
/// streamed to `dir/<name>`. Stops at the first failing file.
pub async fn upload(
    State(state): State<AppState>,
    Extension(ctx): Extension<SessionContext>,
    Query(q): Query<UploadQuery>,
    mut multipart: Multipart,
) -> Result<Json<Value>, MuxError> {
    let mut uploaded = Vec::new();
    loop {
        let field = multipart
            .next_field()
            .await
            .map_err(|e| MuxError::InvalidRequest(format!("Malformed multipart body: {e}")))?;
        let Some(field) = field else { break };
        let Some(name) = field.file_name().map(ToString::to_string) else {
            continue;
        };
        let path = join_path(&q.dir, &name)?;
        let size = state.files.upload(&ctx.session_id, &path, field).await?;
        uploaded.push(json!({"path": path, "size": size}));
    }
    if uploaded.is_empty() {
        return Err(MuxError::InvalidRequest("No file in upload".into()));
    }
    Ok(Json(json!({"uploaded": uploaded})))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attachment_header_sanitized() {
        assert_eq!(
            attachment_header("/tmp/report.pdf"),
            "attachment; filename=\"report.pdf\""
        );
        assert_eq!(
            attachment_header("/tmp/we\"ird\nname"),
            "attachment; filename=\"weirdname\""
        );
    }
}
