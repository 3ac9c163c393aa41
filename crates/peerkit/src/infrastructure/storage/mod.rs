//! Storage infrastructure: configuration file persistence.
//!
//! The `config` sub-module handles:
//!
//! - Reading the TOML configuration file from the platform-appropriate
//!   directory, or from an explicit path.
//! - Writing the stored self identity back to disk after a session reset.
//! - Providing defaults when the file does not exist yet (first run).
//!
//! The stored identity is the only state peerkit persists.

pub mod config;
