//! Persistence: one compressed snapshot file per partition, verified against
//! a hash manifest on every read.
//!
//! # Invariants
//! - A file whose hash disagrees with the manifest is never decoded.
//! - A store written by a different schema version refuses to open.
//! - Partition ids never escape the store directory.

mod codec;
pub mod store;

pub use store::{FileStore, FileStoreError, IntegrityManifest, ManifestEntry, STORE_SCHEMA_VERSION, StoreMeta};
