//! Transport adapters.
//!
//! # Sub-modules
//!
//! - **`memory`** – An in-process hub where every joined peer can find,
//!   invite, and message the others.  Used by the `peerkit-sim` binary and
//!   by the integration tests, and able to inject the faults a real radio
//!   transport produces (a peer that vanishes without a disconnect event, or
//!   an undefined state code).

pub mod memory;
