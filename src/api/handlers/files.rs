use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Multipart, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;

use crate::api::response::{ApiError, AppQuery, JSend};
use crate::storage::FileItem;
use crate::AppState;

/// Upload names are capped before admission, matching the engine's flat
/// on-disk layout.
const MAX_NAME_LEN: usize = 220;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ItemResponse {
    pub name: String,
    pub path: String,
    pub create_date: String,
    pub size: u64,
    pub uploaded: u64,
    pub complete: bool,
}

#[derive(Debug, Deserialize)]
pub struct ListItemsParams {
    #[serde(default)]
    pub include_uploading: bool,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub stored: Vec<String>,
}

// ============================================================================
// Handlers
// ============================================================================

pub async fn list_items(
    State(state): State<Arc<AppState>>,
    Path(folder): Path<String>,
    AppQuery(params): AppQuery<ListItemsParams>,
) -> Result<Json<JSend<Vec<ItemResponse>>>, ApiError> {
    let items = state
        .engine
        .list_items(&folder, params.include_uploading)
        .await?;
    Ok(JSend::success(items.iter().map(item_to_response).collect()))
}

pub async fn get_item(
    State(state): State<Arc<AppState>>,
    Path((folder, name)): Path<(String, String)>,
) -> Result<Json<JSend<ItemResponse>>, ApiError> {
    let item = state.engine.get_item(&folder, &name).await?;
    Ok(JSend::success(item_to_response(&item)))
}

pub async fn delete_item(
    State(state): State<Arc<AppState>>,
    Path((folder, name)): Path<(String, String)>,
) -> Result<Json<JSend<()>>, ApiError> {
    state.engine.remove_item(&folder, &name).await?;
    tracing::debug!(folder = %folder, file = %name, "deleted item");
    Ok(JSend::success(()))
}

/// Multipart upload of one or more `files` fields. The body is buffered at
/// this boundary (bounded by `DefaultBodyLimit`); the engine streams it to
/// a temp file under the folder's quotas and rate limits.
pub async fn upload_items(
    State(state): State<Arc<AppState>>,
    Path(folder): Path<String>,
    mut multipart: Multipart,
) -> Result<Json<JSend<UploadResponse>>, ApiError> {
    let mut stored = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("Invalid multipart data: {e}")))?
    {
        if field.name() != Some("files") {
            continue;
        }
        let name = field
            .file_name()
            .map(trim_file_name)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| ApiError::bad_request("file field is missing a filename"))?;

        let data: Bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::bad_request(format!("Failed to read file: {e}")))?;

        let item = FileItem::new(name.clone(), data.len() as u64);
        state
            .engine
            .upload_item(&folder, item, std::io::Cursor::new(data))
            .await?;
        tracing::debug!(folder = %folder, file = %name, "uploaded item");
        stored.push(name);
    }

    if stored.is_empty() {
        return Err(ApiError::bad_request("no files field in multipart body"));
    }
    Ok(JSend::success(UploadResponse { stored }))
}

/// Stream a stored file back. The body is paced by the folder's download
/// rate; the active-download slot is released when the stream closes.
pub async fn download_item(
    State(state): State<Arc<AppState>>,
    Path((folder, name)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let item = state.engine.get_item(&folder, &name).await?;
    let stream = state.engine.open_item(&folder, &name).await?;

    let body = Body::from_stream(ReaderStream::new(stream));
    let mut response = (StatusCode::OK, body).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(header::CONTENT_LENGTH, header::HeaderValue::from(item.size));
    if let Ok(value) = format!("attachment; filename=\"{name}\"").parse() {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    Ok(response)
}

// ============================================================================
// Helpers
// ============================================================================

/// Base name, truncated to the byte length the engine accepts without
/// splitting a character.
fn trim_file_name(raw: &str) -> String {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or(raw);
    let mut name = String::new();
    for c in base.chars() {
        if name.len() + c.len_utf8() > MAX_NAME_LEN {
            break;
        }
        name.push(c);
    }
    name
}

fn item_to_response(item: &FileItem) -> ItemResponse {
    ItemResponse {
        name: item.name.clone(),
        path: item.path.clone(),
        create_date: item.create_date.to_rfc3339(),
        size: item.size,
        uploaded: item.uploaded,
        complete: item.is_complete(),
    }
}
