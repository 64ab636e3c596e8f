use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use super::handlers;
use crate::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    let upload_limit = state.config.max_upload_size as usize;

    Router::new()
        // Folders
        .route("/folders", get(handlers::list_folders))
        .route("/folders", post(handlers::create_folder))
        .route("/folders/:folder", get(handlers::get_folder))
        .route("/folders/:folder", put(handlers::update_folder))
        .route("/folders/:folder", delete(handlers::delete_folder))
        // Folder logins
        .route("/folders/:folder/logins", post(handlers::add_login))
        .route(
            "/folders/:folder/logins/:login",
            delete(handlers::remove_login),
        )
        // Items
        .route("/folders/:folder/files", get(handlers::list_items))
        .route(
            "/folders/:folder/files",
            post(handlers::upload_items).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/folders/:folder/files/:name", get(handlers::get_item))
        .route("/folders/:folder/files/:name", delete(handlers::delete_item))
        .route(
            "/folders/:folder/files/:name/content",
            get(handlers::download_item),
        )
        // Internal
        .route("/_internal/health", get(handlers::health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
