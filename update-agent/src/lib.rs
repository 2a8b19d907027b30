//! Update Agent Library
//!
//! Self-update manager for an installed application: release discovery,
//! archive download and extraction, staged apply with backup, and rollback
//! within a post-apply verification window.

pub mod api;
pub mod archive;
pub mod config;
pub mod daemon;
pub mod fs;
pub mod host;
pub mod layout;
pub mod manager;
pub mod release;
pub mod scheduler;
pub mod staging;
pub mod state;
pub mod transfer;
pub mod utils;
pub mod version;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use config::Config;
pub use manager::UpdateManager;
pub use utils::errors::UpdateError;
pub type Result<T> = std::result::Result<T, UpdateError>;
