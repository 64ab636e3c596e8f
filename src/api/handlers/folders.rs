use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::api::response::{ApiError, AppJson, AppQuery, JSend};
use crate::storage::{clean_name, Folder};
use crate::AppState;

// ============================================================================
// Types
// ============================================================================

/// Folder policy as accepted by the API. Rates and sizes are plain byte
/// counts, the lifetime is in seconds.
#[derive(Debug, Deserialize)]
pub struct FolderRequest {
    pub name: String,
    #[serde(default)]
    pub max_file_size: Option<u64>,
    #[serde(default)]
    pub max_file_count: Option<u64>,
    #[serde(default)]
    pub max_total_size: Option<u64>,
    #[serde(default)]
    pub max_life_time_secs: Option<u64>,
    /// Bytes per second for download streams.
    #[serde(default)]
    pub download_rate: Option<u64>,
    /// Bytes per second for upload streams.
    #[serde(default)]
    pub upload_rate: Option<u64>,
    #[serde(default)]
    pub max_active_downloads: Option<u32>,
    #[serde(default)]
    pub max_active_uploads: Option<u32>,
    #[serde(default)]
    pub captcha_for_anonymous: bool,
    #[serde(default)]
    pub captcha_for_logged_users: bool,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default)]
    pub is_admin_only_readable: bool,
    #[serde(default)]
    pub password: Option<String>,
    /// Optional first login created together with the folder.
    #[serde(default)]
    pub login: Option<LoginRequest>,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub login: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct FolderResponse {
    pub name: String,
    pub create_date: String,
    pub max_file_size: Option<u64>,
    pub max_file_count: Option<u64>,
    pub max_total_size: Option<u64>,
    pub max_life_time_secs: Option<u64>,
    pub download_rate: Option<u64>,
    pub upload_rate: Option<u64>,
    pub max_active_downloads: Option<u32>,
    pub max_active_uploads: Option<u32>,
    pub captcha_for_anonymous: bool,
    pub captcha_for_logged_users: bool,
    pub is_private: bool,
    pub is_admin_only_readable: bool,
    pub has_password: bool,
    /// Login names only; stored hashes never leave the engine.
    pub logins: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListFoldersParams {
    #[serde(default)]
    pub include_private: bool,
}

#[derive(Debug, Deserialize)]
pub struct UpdateFolderParams {
    #[serde(default)]
    pub replace_users: bool,
}

// ============================================================================
// Handlers
// ============================================================================

pub async fn list_folders(
    State(state): State<Arc<AppState>>,
    AppQuery(params): AppQuery<ListFoldersParams>,
) -> Result<Json<JSend<Vec<FolderResponse>>>, ApiError> {
    let folders = state.engine.list_folders(params.include_private).await?;
    Ok(JSend::success(
        folders.iter().map(folder_to_response).collect(),
    ))
}

pub async fn create_folder(
    State(state): State<Arc<AppState>>,
    AppJson(req): AppJson<FolderRequest>,
) -> Result<Json<JSend<FolderResponse>>, ApiError> {
    let login = req.login.as_ref().map(|l| (l.login.clone(), l.password.clone()));
    let folder = request_to_folder(req);
    // The engine stores the path-cleaned name; look it up the same way.
    let name = clean_name(&folder.name);

    state.engine.create_folder(folder).await?;
    if let Some((login, password)) = login {
        state.engine.add_login(&name, &login, &password).await?;
    }

    let folder = state
        .engine
        .get_folder(&name)
        .await?
        .ok_or_else(|| ApiError::internal("folder not found after create"))?;
    tracing::debug!(folder = %name, "created folder");
    Ok(JSend::success(folder_to_response(&folder)))
}

pub async fn get_folder(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<JSend<FolderResponse>>, ApiError> {
    let folder = state
        .engine
        .get_folder(&name)
        .await?
        .ok_or_else(|| ApiError::not_found("Folder not found"))?;
    Ok(JSend::success(folder_to_response(&folder)))
}

pub async fn update_folder(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    AppQuery(params): AppQuery<UpdateFolderParams>,
    AppJson(req): AppJson<FolderRequest>,
) -> Result<Json<JSend<FolderResponse>>, ApiError> {
    let mut folder = request_to_folder(req);
    folder.name = name.clone();
    state
        .engine
        .update_folder(folder, params.replace_users)
        .await?;

    let folder = state
        .engine
        .get_folder(&name)
        .await?
        .ok_or_else(|| ApiError::internal("folder not found after update"))?;
    tracing::debug!(folder = %name, "updated folder");
    Ok(JSend::success(folder_to_response(&folder)))
}

pub async fn delete_folder(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<JSend<()>>, ApiError> {
    state.engine.remove_folder(&name).await?;
    tracing::debug!(folder = %name, "deleted folder");
    Ok(JSend::success(()))
}

pub async fn add_login(
    State(state): State<Arc<AppState>>,
    Path(folder): Path<String>,
    AppJson(req): AppJson<LoginRequest>,
) -> Result<Json<JSend<()>>, ApiError> {
    state
        .engine
        .add_login(&folder, &req.login, &req.password)
        .await?;
    Ok(JSend::success(()))
}

pub async fn remove_login(
    State(state): State<Arc<AppState>>,
    Path((folder, login)): Path<(String, String)>,
) -> Result<Json<JSend<()>>, ApiError> {
    state.engine.remove_login(&folder, &login).await?;
    Ok(JSend::success(()))
}

// ============================================================================
// Helpers
// ============================================================================

fn request_to_folder(req: FolderRequest) -> Folder {
    let mut folder = Folder::new(req.name);
    folder.max_file_size = req.max_file_size;
    folder.max_file_count = req.max_file_count;
    folder.max_total_size = req.max_total_size;
    folder.max_life_time = req.max_life_time_secs.map(Duration::from_secs);
    folder.read_rate = req.download_rate;
    folder.write_rate = req.upload_rate;
    folder.max_active_reads = req.max_active_downloads;
    folder.max_active_writes = req.max_active_uploads;
    folder.captcha_for_anonymous = req.captcha_for_anonymous;
    folder.captcha_for_logged_users = req.captcha_for_logged_users;
    folder.is_private = req.is_private;
    folder.is_admin_only_readable = req.is_admin_only_readable;
    folder.password = req.password;
    folder
}

fn folder_to_response(folder: &Folder) -> FolderResponse {
    let mut logins: Vec<String> = folder
        .users
        .as_ref()
        .map(|users| users.keys().cloned().collect())
        .unwrap_or_default();
    logins.sort();

    FolderResponse {
        name: folder.name.clone(),
        create_date: folder.create_date.to_rfc3339(),
        max_file_size: folder.max_file_size,
        max_file_count: folder.max_file_count,
        max_total_size: folder.max_total_size,
        max_life_time_secs: folder.max_life_time.map(|d| d.as_secs()),
        download_rate: folder.read_rate,
        upload_rate: folder.write_rate,
        max_active_downloads: folder.max_active_reads,
        max_active_uploads: folder.max_active_writes,
        captcha_for_anonymous: folder.captcha_for_anonymous,
        captcha_for_logged_users: folder.captcha_for_logged_users,
        is_private: folder.is_private,
        is_admin_only_readable: folder.is_admin_only_readable,
        has_password: folder.password.is_some(),
        logins,
    }
}
