//! Session orchestration.
//!
//! Covers admission and the session registry, the startup recovery sweep,
//! and the service facade that callers use to start, steer, stop, and
//! observe sessions.

pub mod recovery;
pub mod service;
pub mod session_manager;
