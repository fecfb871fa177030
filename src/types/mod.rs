//! Core types shared across strider.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed identifiers (CrewId, MachineId)
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Configuration for the walker, runtime, timers and logging

mod config;
mod errors;
mod ids;

pub use config::{Config, ObservabilityConfig, RuntimeConfig, TimersConfig, WalkerConfig};
pub use errors::{Error, Result};
pub use ids::{CrewId, MachineId};
