//! Hash aggregation: function registry, per-group states, and the
//! blocking/streaming/distinct operators.

/// Aggregator core shared by the operators.
pub mod aggregator;
/// Function contract and state model.
pub mod function;
/// Function implementations and the resolver.
pub mod functions;
/// Aggregation operators.
pub mod ops;

pub use aggregator::{AggMode, Aggregator, BoundAggCall};
pub use function::{AggFunction, AggState, NullableAggFunction};
pub use functions::AggFnResolver;
pub use ops::{
    AggCallDesc, AggDesc, AggregateBlockingFactory, AggregateStreamingFactory,
    DistinctGlobalFactory, DistinctLocalFactory,
};
