// ABOUTME: Library root for lake-replicator
// ABOUTME: Relational-to-lake ingestion with watermark-driven incremental merges

pub mod config;
pub mod credentials;
pub mod error;
pub mod source;
pub mod store;
pub mod sync;
pub mod table;
pub mod utils;

pub use error::{SyncError, SyncResult};
