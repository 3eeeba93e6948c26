#![forbid(unsafe_code)]

//! Supervision of conversational agent CLI sessions with durable,
//! replayable event logs.

pub mod agent;
pub mod config;
pub mod errors;
pub mod models;
pub mod orchestrator;
pub mod persistence;
pub mod runner;

pub use config::RunnerConfig;
pub use errors::{AppError, Result};
