#![deny(missing_docs)]

//! Shared configuration, error types, IDs, and memory accounting for basalt crates.
//!
//! Architecture role:
//! - defines engine/runtime configuration passed across layers
//! - provides the common [`EngineError`] / [`Result`] contracts
//! - hosts the hierarchical memory tracker charged by every subsystem
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`ids`]
//! - [`memory`]

/// Shared engine configuration types.
pub mod config;
/// Shared error taxonomy.
pub mod error;
/// Strongly-typed identifier wrappers.
pub mod ids;
/// Hierarchical memory accounting.
pub mod memory;

pub use config::{EngineConfig, StreamingPreaggPolicy, TransmissionCompression};
pub use error::{EngineError, Result};
pub use ids::*;
pub use memory::{MemTracker, TrackedBytes};
