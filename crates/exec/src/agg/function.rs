//! Aggregate function contract and per-group state.
//!
//! Functions are resolved once per plan into `Arc<dyn AggFunction>` bundles;
//! the aggregator owns one [`AggState`] row per group and drives the bundle
//! through update (raw rows), merge (serialized partial states), serialize
//! (partial emission) and finalize (result materialization).

use std::collections::HashSet;

use roaring::RoaringTreemap;

use basalt_chunk::{Column, Datum, HllSketch, PercentileSketch, PrimitiveType};
use basalt_common::{EngineError, Result};

/// Per-group accumulator state. One variant per state shape, shared by the
/// function implementations that use it.
#[derive(Debug, Clone)]
pub enum AggState {
    /// Row or value counter.
    Count(i64),
    /// Integer-family sum (wide accumulator).
    SumInt(i128),
    /// Float-family sum.
    SumFloat(f64),
    /// Average: running sum and count.
    Avg {
        /// Running sum.
        sum: f64,
        /// Rows accumulated.
        count: i64,
    },
    /// Min or max: current extreme, `None` before the first value.
    Extreme(Option<Datum>),
    /// Welford variance accumulator.
    Var {
        /// Rows accumulated.
        count: i64,
        /// Running mean.
        mean: f64,
        /// Sum of squared deviations.
        m2: f64,
    },
    /// HyperLogLog sketch.
    Hll(HllSketch),
    /// Percentile histogram plus the requested quantile.
    Percentile {
        /// Value histogram.
        sketch: PercentileSketch,
        /// Quantile in `[0, 1]`, captured from the call's second argument.
        q: f64,
    },
    /// Bitmap union accumulator.
    Bitmap(RoaringTreemap),
    /// Bitmap intersect accumulator; `None` until the first value.
    BitmapIntersect(Option<RoaringTreemap>),
    /// Distinct serialized values.
    DistinctSet(HashSet<Vec<u8>>),
    /// Collected group_concat parts plus the separator.
    Concat {
        /// Collected values in arrival order.
        parts: Vec<Vec<u8>>,
        /// Separator captured from the call's second argument.
        sep: Vec<u8>,
    },
    /// Nullable wrapper: inner state plus the any-non-null flag.
    Nullable {
        /// Whether any non-null argument row was accumulated.
        seen: bool,
        /// Wrapped state.
        inner: Box<AggState>,
    },
}

/// One aggregate function bundle.
///
/// Implementations are stateless; all per-group data lives in [`AggState`].
pub trait AggFunction: Send + Sync {
    /// Function name as registered.
    fn name(&self) -> &'static str;
    /// Result type.
    fn return_type(&self) -> PrimitiveType;
    /// Whether the result may be NULL.
    fn return_nullable(&self) -> bool {
        false
    }
    /// Fresh per-group state.
    fn create_state(&self) -> AggState;
    /// Fold `args[..][row]` into the state.
    fn update(&self, state: &mut AggState, args: &[Column], row: usize) -> Result<()>;
    /// Fold one serialized partial state into the state.
    fn merge(&self, state: &mut AggState, payload: &[u8]) -> Result<()>;
    /// Emit the partial form consumed by [`AggFunction::merge`].
    fn serialize_state(&self, state: &AggState, out: &mut Vec<u8>) -> Result<()>;
    /// Append the final result to `out`.
    fn finalize(&self, state: &AggState, out: &mut Column) -> Result<()>;
}

/// Nullable-argument wrapper.
///
/// Skips rows where any argument is NULL, tracks whether any row survived,
/// and finalizes to NULL when none did. Registered alongside every plain
/// form; mandatory whenever an argument column may be null.
pub struct NullableAggFunction {
    inner: std::sync::Arc<dyn AggFunction>,
}

impl NullableAggFunction {
    /// Wrap a plain function.
    pub fn new(inner: std::sync::Arc<dyn AggFunction>) -> Self {
        Self { inner }
    }

    fn unwrap_state<'a>(&self, state: &'a mut AggState) -> Result<(&'a mut bool, &'a mut AggState)> {
        match state {
            AggState::Nullable { seen, inner } => Ok((seen, inner)),
            _ => Err(EngineError::Internal(
                "nullable aggregate over non-nullable state".to_string(),
            )),
        }
    }
}

impl AggFunction for NullableAggFunction {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn return_type(&self) -> PrimitiveType {
        self.inner.return_type()
    }

    fn return_nullable(&self) -> bool {
        true
    }

    fn create_state(&self) -> AggState {
        AggState::Nullable {
            seen: false,
            inner: Box::new(self.inner.create_state()),
        }
    }

    fn update(&self, state: &mut AggState, args: &[Column], row: usize) -> Result<()> {
        if args.iter().any(|c| c.is_null_at(row)) {
            return Ok(());
        }
        let (seen, inner) = self.unwrap_state(state)?;
        *seen = true;
        self.inner.update(inner, args, row)
    }

    fn merge(&self, state: &mut AggState, payload: &[u8]) -> Result<()> {
        let Some((&flag, rest)) = payload.split_first() else {
            return Err(EngineError::InvalidArgument(
                "empty nullable aggregate payload".to_string(),
            ));
        };
        if flag == 0 {
            return Ok(());
        }
        let (seen, inner) = self.unwrap_state(state)?;
        *seen = true;
        self.inner.merge(inner, rest)
    }

    fn serialize_state(&self, state: &AggState, out: &mut Vec<u8>) -> Result<()> {
        let AggState::Nullable { seen, inner } = state else {
            return Err(EngineError::Internal(
                "nullable aggregate over non-nullable state".to_string(),
            ));
        };
        out.push(*seen as u8);
        if *seen {
            self.inner.serialize_state(inner, out)?;
        }
        Ok(())
    }

    fn finalize(&self, state: &AggState, out: &mut Column) -> Result<()> {
        let AggState::Nullable { seen, inner } = state else {
            return Err(EngineError::Internal(
                "nullable aggregate over non-nullable state".to_string(),
            ));
        };
        if *seen {
            self.inner.finalize(inner, out)
        } else {
            out.append_nulls(1)
        }
    }
}

/// Binary datum encoding shared by extreme/distinct states.
pub(crate) fn serialize_datum(d: &Datum, out: &mut Vec<u8>) {
    match d {
        Datum::Null => out.push(0),
        Datum::Boolean(v) => {
            out.push(1);
            out.push(*v as u8);
        }
        Datum::Int8(v) => {
            out.push(2);
            out.push(*v as u8);
        }
        Datum::Int16(v) => {
            out.push(3);
            out.extend_from_slice(&v.to_le_bytes());
        }
        Datum::Int32(v) => {
            out.push(4);
            out.extend_from_slice(&v.to_le_bytes());
        }
        Datum::Int64(v) => {
            out.push(5);
            out.extend_from_slice(&v.to_le_bytes());
        }
        Datum::Int128(v) => {
            out.push(6);
            out.extend_from_slice(&v.to_le_bytes());
        }
        Datum::Float32(v) => {
            out.push(7);
            out.extend_from_slice(&v.to_le_bytes());
        }
        Datum::Float64(v) => {
            out.push(8);
            out.extend_from_slice(&v.to_le_bytes());
        }
        Datum::Date(v) => {
            out.push(9);
            out.extend_from_slice(&v.to_le_bytes());
        }
        Datum::Timestamp(v) => {
            out.push(10);
            out.extend_from_slice(&v.to_le_bytes());
        }
        Datum::Binary(v) => {
            out.push(11);
            out.extend_from_slice(&(v.len() as u32).to_le_bytes());
            out.extend_from_slice(v);
        }
    }
}

/// Decode one datum written by [`serialize_datum`], advancing `buf`.
pub(crate) fn deserialize_datum(buf: &mut &[u8]) -> Result<Datum> {
    let Some((&tag, rest)) = buf.split_first() else {
        return Err(EngineError::InvalidArgument(
            "truncated datum payload".to_string(),
        ));
    };
    *buf = rest;
    let take = |buf: &mut &[u8], n: usize| -> Result<Vec<u8>> {
        if buf.len() < n {
            return Err(EngineError::InvalidArgument(
                "truncated datum payload".to_string(),
            ));
        }
        let (head, rest) = buf.split_at(n);
        let out = head.to_vec();
        *buf = rest;
        Ok(out)
    };
    Ok(match tag {
        0 => Datum::Null,
        1 => Datum::Boolean(take(buf, 1)?[0] != 0),
        2 => Datum::Int8(take(buf, 1)?[0] as i8),
        3 => Datum::Int16(i16::from_le_bytes(take(buf, 2)?.try_into().unwrap())),
        4 => Datum::Int32(i32::from_le_bytes(take(buf, 4)?.try_into().unwrap())),
        5 => Datum::Int64(i64::from_le_bytes(take(buf, 8)?.try_into().unwrap())),
        6 => Datum::Int128(i128::from_le_bytes(take(buf, 16)?.try_into().unwrap())),
        7 => Datum::Float32(f32::from_le_bytes(take(buf, 4)?.try_into().unwrap())),
        8 => Datum::Float64(f64::from_le_bytes(take(buf, 8)?.try_into().unwrap())),
        9 => Datum::Date(i32::from_le_bytes(take(buf, 4)?.try_into().unwrap())),
        10 => Datum::Timestamp(i64::from_le_bytes(take(buf, 8)?.try_into().unwrap())),
        11 => {
            let len = u32::from_le_bytes(take(buf, 4)?.try_into().unwrap()) as usize;
            Datum::Binary(take(buf, len)?)
        }
        other => {
            return Err(EngineError::InvalidArgument(format!(
                "unknown datum tag {other}"
            )))
        }
    })
}
