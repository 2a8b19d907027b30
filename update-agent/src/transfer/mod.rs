//! Network transfer: archive download and progress reporting.

pub mod download;
pub mod progress;

pub use download::HttpFetcher;
