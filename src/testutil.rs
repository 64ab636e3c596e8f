//! Shared test helpers for in-crate unit tests.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};

use crate::engine::EngineConfig;
use crate::state_machine::StateMachine;

/// Engine configuration rooted in a temp dir, with ticks fast enough for
/// tests.
pub(crate) fn test_engine_config(dir: &tempfile::TempDir) -> EngineConfig {
    let mut config = EngineConfig::new(
        dir.path().join("db.json"),
        dir.path().join("storage"),
        dir.path().join("tmp"),
    );
    config.update_interval = Duration::from_millis(200);
    config.autosave_interval = Duration::from_millis(400);
    config.stall_timeout = Duration::from_millis(500);
    config
}

/// A state machine that was never spawned, for driving handlers directly.
pub(crate) fn test_state_machine(dir: &tempfile::TempDir) -> StateMachine {
    let (_command_tx, command_rx) = mpsc::unbounded_channel();
    StateMachine::new(test_engine_config(dir), command_rx, Arc::new(Notify::new()))
}
