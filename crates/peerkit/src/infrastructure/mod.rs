//! Infrastructure layer for peerkit.
//!
//! Contains the concrete adapters: the in-process transport, file-system
//! storage for the configuration and stored identity, and the
//! [`context::NetworkContext`] that wires a session together and replaces it
//! on reset.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `peerkit_core`, but MUST NOT be imported by the `application` layer.

pub mod context;
pub mod storage;
pub mod transport;
