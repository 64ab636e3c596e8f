//! filedrop - an anonymous folder/file drop server
//!
//! This crate provides the folder/file engine behind a hidden drop box:
//! - Named folders with per-folder policies: size, count and lifetime caps,
//!   byte-rate limits, concurrency caps, optional secrets
//! - A single-writer serializer task owning all mutable state (no locks)
//! - Streaming uploads staged in temp files with liveness-based stall
//!   cancellation, and throttled streaming downloads
//! - A durable JSON snapshot of folders and items that survives restarts
//! - A REST API with multipart upload support

pub mod api;
pub mod auth;
pub mod config;
pub mod download;
pub mod engine;
pub mod error;
pub mod limiter;
pub mod storage;
#[cfg(test)]
pub mod testutil;

mod state_machine;
mod upload;

use config::Config;
use engine::Engine;

/// Shared application state
#[derive(Debug, Clone)]
pub struct AppState {
    pub config: Config,
    pub engine: Engine,
}
