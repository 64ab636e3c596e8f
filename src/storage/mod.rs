//! Registry data model, in-memory registry and durable snapshot.

pub mod models;
pub mod registry;
pub mod snapshot;

pub use models::{clean_name, FileItem, Folder};
pub use registry::Registry;
pub use snapshot::Snapshot;
