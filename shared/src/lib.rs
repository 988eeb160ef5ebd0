//! Shared types and utilities for Devscope
//!
//! This crate contains the host-device wire protocol, the job description types,
//! and small helpers used by the daemon and by device-side peers.

pub mod protocol;
pub mod types;
pub mod utils;

// Re-export commonly used types
pub use types::job::*;
