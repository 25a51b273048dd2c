#![deny(missing_docs)]

//! Fragment runtime of the basalt execution core.
//!
//! Architecture role:
//! - the worker-wide execution environment (driver pool, RPC runtime,
//!   receiver registry, provider registry, memory pool)
//! - query/fragment contexts with first-error latching and completion
//! - plan-to-pipeline compilation and driver fan-out
//!
//! Key modules:
//! - [`context`]
//! - [`builder`]
//! - [`executor`]

/// Plan-to-pipeline compilation.
pub mod builder;
/// Environment and contexts.
pub mod context;
/// The fragment executor.
pub mod executor;

pub use builder::CompiledFragment;
pub use context::{ExecEnv, FragmentContext};
pub use executor::{FragmentExecutor, PreparedFragment};
