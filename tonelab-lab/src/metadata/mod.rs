//! Metadata editing
//!
//! Dry-run previews, atomic tag writes with backup-and-rename, bulk
//! operations, and conversion enqueueing. Every mutation lands in the
//! action log.

pub mod writer;

pub use writer::{
    BulkResult, MetadataWriter, TagChanges, TagDiff, WritePreview, WriteResult,
};
