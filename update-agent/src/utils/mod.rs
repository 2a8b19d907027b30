//! Utility modules for the update agent.

pub mod errors;
pub mod logger;

pub use errors::{Result, UpdateError};
