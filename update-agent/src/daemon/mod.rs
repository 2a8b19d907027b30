//! Process lifecycle for the daemon.

pub mod shutdown;
