mod files;
mod folders;

use axum::Json;
use serde::Serialize;

use crate::api::response::JSend;

pub use files::{delete_item, download_item, get_item, list_items, upload_items};
pub use folders::{
    add_login, create_folder, delete_folder, get_folder, list_folders, remove_login, update_folder,
};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

pub async fn health() -> Json<JSend<HealthResponse>> {
    JSend::success(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
