#![deny(missing_docs)]

//! Operator runtime of the basalt execution core.
//!
//! Architecture role:
//! - hash-key adaptors specialized over key shape ([`keys`])
//! - aggregate function registry and aggregation operators ([`agg`])
//! - hash-join build/probe operators ([`join`])
//! - the operator contract, pipelines and basic transforms ([`op`],
//!   [`pipeline`])
//! - cooperative pipeline drivers and their dispatcher ([`driver`],
//!   [`scheduler`])
//! - fragment descriptor ingress ([`plan`])
//!
//! The exchange sender/receiver live in `basalt-exchange`; fragment
//! assembly lives in `basalt-runtime`.

/// Aggregation engine.
pub mod agg;
/// Pipeline drivers.
pub mod driver;
/// Scalar expressions.
pub mod expr;
/// Hash join.
pub mod join;
/// Hash-key adaptors.
pub mod keys;
/// Local (in-fragment) exchange.
pub mod local_exchange;
/// Wake signaling.
pub mod observer;
/// Operator contract and basic operators.
pub mod op;
/// Pipeline assembly units.
pub mod pipeline;
/// Fragment descriptor types.
pub mod plan;
/// Driver dispatcher.
pub mod scheduler;
/// Morsels and scan sources.
pub mod source;
/// Per-fragment runtime state.
pub mod state;
/// Analytic (window) operator.
pub mod window;

pub use driver::{Driver, DriverState, DriverYield};
pub use observer::Observable;
pub use op::{Operator, OperatorFactory};
pub use pipeline::Pipeline;
pub use scheduler::DriverExecutor;
pub use state::RuntimeState;
