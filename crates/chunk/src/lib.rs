#![deny(missing_docs)]

//! Columnar chunk carrier for the basalt execution core.
//!
//! Architecture role:
//! - typed growable columns with null masks, constants and aggregate objects
//! - chunk batches with a header-once wire encoding for exchanges
//! - per-row FNV/CRC32 hashing used by partitioning and key adaptors
//! - ratio-gated payload compression
//! - the byte arena that owns variable-length hash-key bytes
//!
//! Key modules:
//! - [`column`] / [`chunk`]
//! - [`hash`] / [`compress`]
//! - [`arena`] / [`sketch`]

/// Byte arena for hash keys.
pub mod arena;
/// Chunk batches and schema headers.
pub mod chunk;
/// Typed columns.
pub mod column;
/// Payload compression.
pub mod compress;
/// Row hashing.
pub mod hash;
/// Approximate aggregate objects.
pub mod sketch;
/// Primitive types and datums.
pub mod types;

pub use arena::{Arena, ArenaRef, ARENA_SLICE_PAD};
pub use chunk::{Chunk, ChunkMeta, SlotMeta};
pub use column::{
    BinaryColumn, Column, ConstColumn, FixedColumn, NullableColumn, ObjectColumn, ObjectValue,
};
pub use sketch::{HllSketch, PercentileSketch};
pub use types::{Datum, ObjectType, PrimitiveType};
