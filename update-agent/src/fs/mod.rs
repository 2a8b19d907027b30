//! Filesystem helpers shared by staging, apply and rollback.

pub mod metadata;
pub mod walker;

pub use metadata::{copy_preserving, write_atomic, FileMetadata};
pub use walker::walk_directory;
