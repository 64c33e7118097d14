//! Meeting Aggregator Library
//!
//! Aggregates meeting listings from many BMLT root servers into one store and
//! serves them back through a BMLT compatible read API.

pub mod config;
pub mod model;
pub mod reconcile;
pub mod server;
pub mod source_client;
pub mod sqlite_persistence;
pub mod store;
pub mod sync;

// Re-export commonly used types for convenience
pub use server::{make_app, run_server, RequestsLoggingLevel, ServerConfig};
pub use source_client::{HttpSourceClient, SourceClient};
pub use store::{MeetingStore, SqliteMeetingStore};
pub use sync::{create_scheduler, SyncHandle, SyncOrchestrator};
