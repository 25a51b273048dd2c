//! Aggregate function implementations and the central resolver.
//!
//! Every function is registered in two forms: the plain form used over
//! statically non-nullable argument columns and the nullable wrapper used
//! whenever an argument may be null. The resolver key is
//! `(name, argument type, return type, nullable)`.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use roaring::RoaringTreemap;

use basalt_chunk::hash::table_hash;
use basalt_chunk::{Column, Datum, HllSketch, ObjectType, ObjectValue, PercentileSketch, PrimitiveType};
use basalt_common::{EngineError, Result};

use super::function::{
    deserialize_datum, serialize_datum, AggFunction, AggState, NullableAggFunction,
};

fn state_mismatch(name: &str) -> EngineError {
    EngineError::Internal(format!("aggregate state mismatch in {name}"))
}

fn payload_len(payload: &[u8], want: usize, name: &str) -> Result<()> {
    if payload.len() != want {
        return Err(EngineError::InvalidArgument(format!(
            "{name} partial payload has {} bytes, want {want}",
            payload.len()
        )));
    }
    Ok(())
}

fn object_at<'a>(col: &'a Column, row: usize, name: &str) -> Result<&'a ObjectValue> {
    match col {
        Column::Object(o) => Ok(o.get(row)),
        _ => Err(EngineError::InvalidArgument(format!(
            "{name} expects an object argument column"
        ))),
    }
}

fn push_object(out: &mut Column, value: ObjectValue) -> Result<()> {
    match out {
        Column::Object(o) => o.push(value),
        _ => Err(EngineError::Internal(
            "object aggregate finalizing into non-object column".to_string(),
        )),
    }
}

/// `count` / `count(*)`: row counter; the nullable form skips NULL arguments
/// but still finalizes to 0, never NULL.
struct CountFunction {
    skip_nulls: bool,
}

impl AggFunction for CountFunction {
    fn name(&self) -> &'static str {
        "count"
    }

    fn return_type(&self) -> PrimitiveType {
        PrimitiveType::Int64
    }

    fn create_state(&self) -> AggState {
        AggState::Count(0)
    }

    fn update(&self, state: &mut AggState, args: &[Column], row: usize) -> Result<()> {
        if self.skip_nulls && args.iter().any(|c| c.is_null_at(row)) {
            return Ok(());
        }
        match state {
            AggState::Count(n) => {
                *n += 1;
                Ok(())
            }
            _ => Err(state_mismatch("count")),
        }
    }

    fn merge(&self, state: &mut AggState, payload: &[u8]) -> Result<()> {
        payload_len(payload, 8, "count")?;
        let add = i64::from_le_bytes(payload.try_into().unwrap());
        match state {
            AggState::Count(n) => {
                *n += add;
                Ok(())
            }
            _ => Err(state_mismatch("count")),
        }
    }

    fn serialize_state(&self, state: &AggState, out: &mut Vec<u8>) -> Result<()> {
        match state {
            AggState::Count(n) => {
                out.extend_from_slice(&n.to_le_bytes());
                Ok(())
            }
            _ => Err(state_mismatch("count")),
        }
    }

    fn finalize(&self, state: &AggState, out: &mut Column) -> Result<()> {
        match state {
            AggState::Count(n) => out.append_datum(&Datum::Int64(*n)),
            _ => Err(state_mismatch("count")),
        }
    }
}

/// `sum` over the integer family (wide i128 accumulator) or floats.
struct SumFunction {
    float: bool,
    ret: PrimitiveType,
}

impl AggFunction for SumFunction {
    fn name(&self) -> &'static str {
        "sum"
    }

    fn return_type(&self) -> PrimitiveType {
        self.ret
    }

    fn create_state(&self) -> AggState {
        if self.float {
            AggState::SumFloat(0.0)
        } else {
            AggState::SumInt(0)
        }
    }

    fn update(&self, state: &mut AggState, args: &[Column], row: usize) -> Result<()> {
        let v = args[0].get(row);
        match state {
            AggState::SumInt(sum) => {
                *sum += v.as_int().ok_or_else(|| state_mismatch("sum"))?;
                Ok(())
            }
            AggState::SumFloat(sum) => {
                *sum += v.as_float().ok_or_else(|| state_mismatch("sum"))?;
                Ok(())
            }
            _ => Err(state_mismatch("sum")),
        }
    }

    fn merge(&self, state: &mut AggState, payload: &[u8]) -> Result<()> {
        match state {
            AggState::SumInt(sum) => {
                payload_len(payload, 16, "sum")?;
                *sum += i128::from_le_bytes(payload.try_into().unwrap());
                Ok(())
            }
            AggState::SumFloat(sum) => {
                payload_len(payload, 8, "sum")?;
                *sum += f64::from_le_bytes(payload.try_into().unwrap());
                Ok(())
            }
            _ => Err(state_mismatch("sum")),
        }
    }

    fn serialize_state(&self, state: &AggState, out: &mut Vec<u8>) -> Result<()> {
        match state {
            AggState::SumInt(sum) => out.extend_from_slice(&sum.to_le_bytes()),
            AggState::SumFloat(sum) => out.extend_from_slice(&sum.to_le_bytes()),
            _ => return Err(state_mismatch("sum")),
        }
        Ok(())
    }

    fn finalize(&self, state: &AggState, out: &mut Column) -> Result<()> {
        let d = match state {
            AggState::SumInt(sum) => match self.ret {
                PrimitiveType::Int128 | PrimitiveType::Decimal128 { .. } => Datum::Int128(*sum),
                _ => Datum::Int64(*sum as i64),
            },
            AggState::SumFloat(sum) => Datum::Float64(*sum),
            _ => return Err(state_mismatch("sum")),
        };
        out.append_datum(&d)
    }
}

/// `avg`: sum/count pair finalizing to double.
struct AvgFunction;

impl AggFunction for AvgFunction {
    fn name(&self) -> &'static str {
        "avg"
    }

    fn return_type(&self) -> PrimitiveType {
        PrimitiveType::Float64
    }

    fn create_state(&self) -> AggState {
        AggState::Avg { sum: 0.0, count: 0 }
    }

    fn update(&self, state: &mut AggState, args: &[Column], row: usize) -> Result<()> {
        let v = args[0]
            .get(row)
            .as_float()
            .ok_or_else(|| state_mismatch("avg"))?;
        match state {
            AggState::Avg { sum, count } => {
                *sum += v;
                *count += 1;
                Ok(())
            }
            _ => Err(state_mismatch("avg")),
        }
    }

    fn merge(&self, state: &mut AggState, payload: &[u8]) -> Result<()> {
        payload_len(payload, 16, "avg")?;
        match state {
            AggState::Avg { sum, count } => {
                *sum += f64::from_le_bytes(payload[0..8].try_into().unwrap());
                *count += i64::from_le_bytes(payload[8..16].try_into().unwrap());
                Ok(())
            }
            _ => Err(state_mismatch("avg")),
        }
    }

    fn serialize_state(&self, state: &AggState, out: &mut Vec<u8>) -> Result<()> {
        match state {
            AggState::Avg { sum, count } => {
                out.extend_from_slice(&sum.to_le_bytes());
                out.extend_from_slice(&count.to_le_bytes());
                Ok(())
            }
            _ => Err(state_mismatch("avg")),
        }
    }

    fn finalize(&self, state: &AggState, out: &mut Column) -> Result<()> {
        match state {
            AggState::Avg { sum, count } => {
                let d = if *count == 0 {
                    Datum::Null
                } else {
                    Datum::Float64(*sum / *count as f64)
                };
                out.append_datum(&d)
            }
            _ => Err(state_mismatch("avg")),
        }
    }

    fn return_nullable(&self) -> bool {
        // avg over zero accumulated rows has no value.
        true
    }
}

/// `min` / `max` over any ordered type.
struct ExtremeFunction {
    is_min: bool,
    ret: PrimitiveType,
}

impl AggFunction for ExtremeFunction {
    fn name(&self) -> &'static str {
        if self.is_min {
            "min"
        } else {
            "max"
        }
    }

    fn return_type(&self) -> PrimitiveType {
        self.ret
    }

    fn return_nullable(&self) -> bool {
        true
    }

    fn create_state(&self) -> AggState {
        AggState::Extreme(None)
    }

    fn update(&self, state: &mut AggState, args: &[Column], row: usize) -> Result<()> {
        let v = args[0].get(row);
        let AggState::Extreme(cur) = state else {
            return Err(state_mismatch(self.name()));
        };
        let replace = match cur {
            None => true,
            Some(existing) => {
                let ord = v.order_cmp(existing);
                if self.is_min {
                    ord == std::cmp::Ordering::Less
                } else {
                    ord == std::cmp::Ordering::Greater
                }
            }
        };
        if replace {
            *cur = Some(v);
        }
        Ok(())
    }

    fn merge(&self, state: &mut AggState, payload: &[u8]) -> Result<()> {
        let mut buf = payload;
        let Some((&has, rest)) = buf.split_first() else {
            return Err(state_mismatch(self.name()));
        };
        buf = rest;
        if has == 0 {
            return Ok(());
        }
        let incoming = deserialize_datum(&mut buf)?;
        let mut tmp = Column::new_for_type(self.ret, false)?;
        tmp.append_datum(&incoming)?;
        self.update(state, std::slice::from_ref(&tmp), 0)
    }

    fn serialize_state(&self, state: &AggState, out: &mut Vec<u8>) -> Result<()> {
        let AggState::Extreme(cur) = state else {
            return Err(state_mismatch(self.name()));
        };
        match cur {
            None => out.push(0),
            Some(d) => {
                out.push(1);
                serialize_datum(d, out);
            }
        }
        Ok(())
    }

    fn finalize(&self, state: &AggState, out: &mut Column) -> Result<()> {
        let AggState::Extreme(cur) = state else {
            return Err(state_mismatch(self.name()));
        };
        match cur {
            None => out.append_nulls(1),
            Some(d) => out.append_datum(d),
        }
    }
}

/// Variance/stddev family via Welford accumulation with parallel combine.
struct VarFunction {
    sample: bool,
    stddev: bool,
    name: &'static str,
}

impl AggFunction for VarFunction {
    fn name(&self) -> &'static str {
        self.name
    }

    fn return_type(&self) -> PrimitiveType {
        PrimitiveType::Float64
    }

    fn return_nullable(&self) -> bool {
        true
    }

    fn create_state(&self) -> AggState {
        AggState::Var {
            count: 0,
            mean: 0.0,
            m2: 0.0,
        }
    }

    fn update(&self, state: &mut AggState, args: &[Column], row: usize) -> Result<()> {
        let v = args[0]
            .get(row)
            .as_float()
            .ok_or_else(|| state_mismatch(self.name))?;
        let AggState::Var { count, mean, m2 } = state else {
            return Err(state_mismatch(self.name));
        };
        *count += 1;
        let delta = v - *mean;
        *mean += delta / *count as f64;
        *m2 += delta * (v - *mean);
        Ok(())
    }

    fn merge(&self, state: &mut AggState, payload: &[u8]) -> Result<()> {
        payload_len(payload, 24, self.name)?;
        let rc = i64::from_le_bytes(payload[0..8].try_into().unwrap());
        let rmean = f64::from_le_bytes(payload[8..16].try_into().unwrap());
        let rm2 = f64::from_le_bytes(payload[16..24].try_into().unwrap());
        if rc == 0 {
            return Ok(());
        }
        let AggState::Var { count, mean, m2 } = state else {
            return Err(state_mismatch(self.name));
        };
        let lc = *count as f64;
        let rcf = rc as f64;
        let total = lc + rcf;
        let delta = rmean - *mean;
        *m2 += rm2 + delta * delta * lc * rcf / total;
        *mean += delta * rcf / total;
        *count += rc;
        Ok(())
    }

    fn serialize_state(&self, state: &AggState, out: &mut Vec<u8>) -> Result<()> {
        let AggState::Var { count, mean, m2 } = state else {
            return Err(state_mismatch(self.name));
        };
        out.extend_from_slice(&count.to_le_bytes());
        out.extend_from_slice(&mean.to_le_bytes());
        out.extend_from_slice(&m2.to_le_bytes());
        Ok(())
    }

    fn finalize(&self, state: &AggState, out: &mut Column) -> Result<()> {
        let AggState::Var { count, m2, .. } = state else {
            return Err(state_mismatch(self.name));
        };
        let denom = if self.sample { *count - 1 } else { *count };
        if denom <= 0 {
            return out.append_nulls(1);
        }
        let var = *m2 / denom as f64;
        let v = if self.stddev { var.sqrt() } else { var };
        out.append_datum(&Datum::Float64(v))
    }
}

/// `ndv` / `approx_count_distinct`: HyperLogLog over hashed argument values.
struct NdvFunction;

impl AggFunction for NdvFunction {
    fn name(&self) -> &'static str {
        "ndv"
    }

    fn return_type(&self) -> PrimitiveType {
        PrimitiveType::Int64
    }

    fn create_state(&self) -> AggState {
        AggState::Hll(HllSketch::default())
    }

    fn update(&self, state: &mut AggState, args: &[Column], row: usize) -> Result<()> {
        let AggState::Hll(h) = state else {
            return Err(state_mismatch("ndv"));
        };
        let mut buf = Vec::with_capacity(24);
        serialize_datum(&args[0].get(row), &mut buf);
        h.insert_hash(table_hash(&buf));
        Ok(())
    }

    fn merge(&self, state: &mut AggState, payload: &[u8]) -> Result<()> {
        let AggState::Hll(h) = state else {
            return Err(state_mismatch("ndv"));
        };
        h.merge(&HllSketch::deserialize(payload)?)
    }

    fn serialize_state(&self, state: &AggState, out: &mut Vec<u8>) -> Result<()> {
        let AggState::Hll(h) = state else {
            return Err(state_mismatch("ndv"));
        };
        h.serialize_to(out);
        Ok(())
    }

    fn finalize(&self, state: &AggState, out: &mut Column) -> Result<()> {
        let AggState::Hll(h) = state else {
            return Err(state_mismatch("ndv"));
        };
        out.append_datum(&Datum::Int64(h.estimate().round() as i64))
    }
}

/// `hll_union`: merges HLL objects, emitting the merged object.
struct HllUnionFunction;

impl AggFunction for HllUnionFunction {
    fn name(&self) -> &'static str {
        "hll_union"
    }

    fn return_type(&self) -> PrimitiveType {
        PrimitiveType::Object(ObjectType::Hll)
    }

    fn create_state(&self) -> AggState {
        AggState::Hll(HllSketch::default())
    }

    fn update(&self, state: &mut AggState, args: &[Column], row: usize) -> Result<()> {
        let AggState::Hll(h) = state else {
            return Err(state_mismatch("hll_union"));
        };
        match object_at(&args[0], row, "hll_union")? {
            ObjectValue::Hll(other) => h.merge(&other),
            ObjectValue::Bitmap(_) => Err(EngineError::InvalidArgument(
                "hll_union over bitmap objects".to_string(),
            )),
        }
    }

    fn merge(&self, state: &mut AggState, payload: &[u8]) -> Result<()> {
        let AggState::Hll(h) = state else {
            return Err(state_mismatch("hll_union"));
        };
        h.merge(&HllSketch::deserialize(payload)?)
    }

    fn serialize_state(&self, state: &AggState, out: &mut Vec<u8>) -> Result<()> {
        let AggState::Hll(h) = state else {
            return Err(state_mismatch("hll_union"));
        };
        h.serialize_to(out);
        Ok(())
    }

    fn finalize(&self, state: &AggState, out: &mut Column) -> Result<()> {
        let AggState::Hll(h) = state else {
            return Err(state_mismatch("hll_union"));
        };
        push_object(out, ObjectValue::Hll(h.clone()))
    }
}

/// `percentile_approx(value, q)`: streaming histogram quantile.
struct PercentileFunction;

impl AggFunction for PercentileFunction {
    fn name(&self) -> &'static str {
        "percentile_approx"
    }

    fn return_type(&self) -> PrimitiveType {
        PrimitiveType::Float64
    }

    fn return_nullable(&self) -> bool {
        true
    }

    fn create_state(&self) -> AggState {
        AggState::Percentile {
            sketch: PercentileSketch::default(),
            q: 0.5,
        }
    }

    fn update(&self, state: &mut AggState, args: &[Column], row: usize) -> Result<()> {
        let v = args[0]
            .get(row)
            .as_float()
            .ok_or_else(|| state_mismatch("percentile_approx"))?;
        let AggState::Percentile { sketch, q } = state else {
            return Err(state_mismatch("percentile_approx"));
        };
        if let Some(requested) = args.get(1).and_then(|c| c.get(row).as_float()) {
            *q = requested.clamp(0.0, 1.0);
        }
        sketch.insert(v);
        Ok(())
    }

    fn merge(&self, state: &mut AggState, payload: &[u8]) -> Result<()> {
        if payload.len() < 8 {
            return Err(state_mismatch("percentile_approx"));
        }
        let incoming_q = f64::from_le_bytes(payload[0..8].try_into().unwrap());
        let incoming = PercentileSketch::deserialize(&payload[8..])?;
        let AggState::Percentile { sketch, q } = state else {
            return Err(state_mismatch("percentile_approx"));
        };
        *q = incoming_q;
        sketch.merge(&incoming);
        Ok(())
    }

    fn serialize_state(&self, state: &AggState, out: &mut Vec<u8>) -> Result<()> {
        let AggState::Percentile { sketch, q } = state else {
            return Err(state_mismatch("percentile_approx"));
        };
        out.extend_from_slice(&q.to_le_bytes());
        sketch.serialize_to(out);
        Ok(())
    }

    fn finalize(&self, state: &AggState, out: &mut Column) -> Result<()> {
        let AggState::Percentile { sketch, q } = state else {
            return Err(state_mismatch("percentile_approx"));
        };
        match sketch.quantile(*q) {
            Some(v) => out.append_datum(&Datum::Float64(v)),
            None => out.append_nulls(1),
        }
    }
}

/// Bitmap aggregates over object columns.
struct BitmapFunction {
    kind: BitmapKind,
}

#[derive(Clone, Copy, PartialEq)]
enum BitmapKind {
    Union,
    UnionCount,
    Intersect,
    IntersectCount,
}

impl AggFunction for BitmapFunction {
    fn name(&self) -> &'static str {
        match self.kind {
            BitmapKind::Union => "bitmap_union",
            BitmapKind::UnionCount => "bitmap_union_count",
            BitmapKind::Intersect => "bitmap_intersect",
            BitmapKind::IntersectCount => "bitmap_intersect_count",
        }
    }

    fn return_type(&self) -> PrimitiveType {
        match self.kind {
            BitmapKind::UnionCount | BitmapKind::IntersectCount => PrimitiveType::Int64,
            _ => PrimitiveType::Object(ObjectType::Bitmap),
        }
    }

    fn create_state(&self) -> AggState {
        match self.kind {
            BitmapKind::Intersect | BitmapKind::IntersectCount => AggState::BitmapIntersect(None),
            _ => AggState::Bitmap(RoaringTreemap::new()),
        }
    }

    fn update(&self, state: &mut AggState, args: &[Column], row: usize) -> Result<()> {
        let incoming = match object_at(&args[0], row, self.name())? {
            ObjectValue::Bitmap(b) => b,
            ObjectValue::Hll(_) => {
                return Err(EngineError::InvalidArgument(format!(
                    "{} over hll objects",
                    self.name()
                )))
            }
        };
        match state {
            AggState::Bitmap(acc) => {
                *acc |= incoming;
                Ok(())
            }
            AggState::BitmapIntersect(acc) => {
                match acc {
                    None => *acc = Some(incoming.clone()),
                    Some(existing) => *existing &= incoming,
                }
                Ok(())
            }
            _ => Err(state_mismatch(self.name())),
        }
    }

    fn merge(&self, state: &mut AggState, payload: &[u8]) -> Result<()> {
        match state {
            AggState::Bitmap(acc) => {
                let incoming = RoaringTreemap::deserialize_from(payload)
                    .map_err(|e| EngineError::InvalidArgument(format!("bad bitmap payload: {e}")))?;
                *acc |= incoming;
                Ok(())
            }
            AggState::BitmapIntersect(acc) => {
                let Some((&has, rest)) = payload.split_first() else {
                    return Err(state_mismatch(self.name()));
                };
                if has == 0 {
                    return Ok(());
                }
                let incoming = RoaringTreemap::deserialize_from(rest)
                    .map_err(|e| EngineError::InvalidArgument(format!("bad bitmap payload: {e}")))?;
                match acc {
                    None => *acc = Some(incoming),
                    Some(existing) => *existing &= incoming,
                }
                Ok(())
            }
            _ => Err(state_mismatch(self.name())),
        }
    }

    fn serialize_state(&self, state: &AggState, out: &mut Vec<u8>) -> Result<()> {
        match state {
            AggState::Bitmap(acc) => acc
                .serialize_into(out)
                .map_err(|e| EngineError::Internal(format!("bitmap serialize failed: {e}"))),
            AggState::BitmapIntersect(acc) => {
                match acc {
                    None => out.push(0),
                    Some(b) => {
                        out.push(1);
                        b.serialize_into(out).map_err(|e| {
                            EngineError::Internal(format!("bitmap serialize failed: {e}"))
                        })?;
                    }
                }
                Ok(())
            }
            _ => Err(state_mismatch(self.name())),
        }
    }

    fn finalize(&self, state: &AggState, out: &mut Column) -> Result<()> {
        match (state, self.kind) {
            (AggState::Bitmap(acc), BitmapKind::Union) => {
                push_object(out, ObjectValue::Bitmap(acc.clone()))
            }
            (AggState::Bitmap(acc), BitmapKind::UnionCount) => {
                out.append_datum(&Datum::Int64(acc.len() as i64))
            }
            (AggState::BitmapIntersect(acc), BitmapKind::Intersect) => push_object(
                out,
                ObjectValue::Bitmap(acc.clone().unwrap_or_default()),
            ),
            (AggState::BitmapIntersect(acc), BitmapKind::IntersectCount) => {
                let count = acc.as_ref().map_or(0, RoaringTreemap::len);
                out.append_datum(&Datum::Int64(count as i64))
            }
            _ => Err(state_mismatch(self.name())),
        }
    }
}

/// Exact distinct aggregates over a serialized-value set.
struct MultiDistinctFunction {
    sum: bool,
    ret: PrimitiveType,
}

impl AggFunction for MultiDistinctFunction {
    fn name(&self) -> &'static str {
        if self.sum {
            "multi_distinct_sum"
        } else {
            "multi_distinct_count"
        }
    }

    fn return_type(&self) -> PrimitiveType {
        self.ret
    }

    fn create_state(&self) -> AggState {
        AggState::DistinctSet(Default::default())
    }

    fn update(&self, state: &mut AggState, args: &[Column], row: usize) -> Result<()> {
        let AggState::DistinctSet(set) = state else {
            return Err(state_mismatch(self.name()));
        };
        let mut buf = Vec::with_capacity(24);
        serialize_datum(&args[0].get(row), &mut buf);
        set.insert(buf);
        Ok(())
    }

    fn merge(&self, state: &mut AggState, payload: &[u8]) -> Result<()> {
        let AggState::DistinctSet(set) = state else {
            return Err(state_mismatch(self.name()));
        };
        let mut buf = payload;
        if buf.len() < 4 {
            return Err(state_mismatch(self.name()));
        }
        let count = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
        buf = &buf[4..];
        for _ in 0..count {
            if buf.len() < 4 {
                return Err(state_mismatch(self.name()));
            }
            let len = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
            buf = &buf[4..];
            set.insert(buf[..len].to_vec());
            buf = &buf[len..];
        }
        Ok(())
    }

    fn serialize_state(&self, state: &AggState, out: &mut Vec<u8>) -> Result<()> {
        let AggState::DistinctSet(set) = state else {
            return Err(state_mismatch(self.name()));
        };
        out.extend_from_slice(&(set.len() as u32).to_le_bytes());
        let mut items: Vec<&Vec<u8>> = set.iter().collect();
        items.sort();
        for item in items {
            out.extend_from_slice(&(item.len() as u32).to_le_bytes());
            out.extend_from_slice(item);
        }
        Ok(())
    }

    fn finalize(&self, state: &AggState, out: &mut Column) -> Result<()> {
        let AggState::DistinctSet(set) = state else {
            return Err(state_mismatch(self.name()));
        };
        if !self.sum {
            return out.append_datum(&Datum::Int64(set.len() as i64));
        }
        let mut int_sum: i128 = 0;
        let mut float_sum = 0.0;
        let mut float = false;
        for item in set {
            let mut cursor = item.as_slice();
            let d = deserialize_datum(&mut cursor)?;
            if let Some(v) = d.as_int() {
                int_sum += v;
            } else if let Some(v) = d.as_float() {
                float = true;
                float_sum += v;
            }
        }
        let d = if float || self.ret == PrimitiveType::Float64 {
            Datum::Float64(float_sum + int_sum as f64)
        } else {
            Datum::Int64(int_sum as i64)
        };
        out.append_datum(&d)
    }
}

/// `group_concat(value[, sep])`: ordered byte-string concatenation.
struct GroupConcatFunction;

impl AggFunction for GroupConcatFunction {
    fn name(&self) -> &'static str {
        "group_concat"
    }

    fn return_type(&self) -> PrimitiveType {
        PrimitiveType::Varchar
    }

    fn return_nullable(&self) -> bool {
        true
    }

    fn create_state(&self) -> AggState {
        AggState::Concat {
            parts: Vec::new(),
            sep: b", ".to_vec(),
        }
    }

    fn update(&self, state: &mut AggState, args: &[Column], row: usize) -> Result<()> {
        let AggState::Concat { parts, sep } = state else {
            return Err(state_mismatch("group_concat"));
        };
        if let Some(custom) = args.get(1).and_then(|c| c.get_slice(row)) {
            *sep = custom.to_vec();
        }
        match args[0].get_slice(row) {
            Some(bytes) => {
                parts.push(bytes.to_vec());
                Ok(())
            }
            None => Err(EngineError::InvalidArgument(
                "group_concat expects string arguments".to_string(),
            )),
        }
    }

    fn merge(&self, state: &mut AggState, payload: &[u8]) -> Result<()> {
        let AggState::Concat { parts, sep } = state else {
            return Err(state_mismatch("group_concat"));
        };
        let mut buf = payload;
        if buf.len() < 4 {
            return Err(state_mismatch("group_concat"));
        }
        let sep_len = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
        buf = &buf[4..];
        *sep = buf[..sep_len].to_vec();
        buf = &buf[sep_len..];
        if buf.len() < 4 {
            return Err(state_mismatch("group_concat"));
        }
        let count = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
        buf = &buf[4..];
        for _ in 0..count {
            let len = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
            buf = &buf[4..];
            parts.push(buf[..len].to_vec());
            buf = &buf[len..];
        }
        Ok(())
    }

    fn serialize_state(&self, state: &AggState, out: &mut Vec<u8>) -> Result<()> {
        let AggState::Concat { parts, sep } = state else {
            return Err(state_mismatch("group_concat"));
        };
        out.extend_from_slice(&(sep.len() as u32).to_le_bytes());
        out.extend_from_slice(sep);
        out.extend_from_slice(&(parts.len() as u32).to_le_bytes());
        for p in parts {
            out.extend_from_slice(&(p.len() as u32).to_le_bytes());
            out.extend_from_slice(p);
        }
        Ok(())
    }

    fn finalize(&self, state: &AggState, out: &mut Column) -> Result<()> {
        let AggState::Concat { parts, sep } = state else {
            return Err(state_mismatch("group_concat"));
        };
        if parts.is_empty() {
            return out.append_nulls(1);
        }
        let mut joined = Vec::new();
        for (i, p) in parts.iter().enumerate() {
            if i > 0 {
                joined.extend_from_slice(sep);
            }
            joined.extend_from_slice(p);
        }
        out.append_datum(&Datum::Binary(joined))
    }
}

/// Resolver key: `(name, argument type, return type, nullable form)`.
/// Parameterized decimals are canonicalized so any precision resolves.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ResolverKey {
    name: String,
    arg: Option<PrimitiveType>,
    ret: PrimitiveType,
    nullable: bool,
}

fn canonical(t: PrimitiveType) -> PrimitiveType {
    match t {
        PrimitiveType::Decimal128 { .. } => PrimitiveType::Decimal128 {
            precision: 0,
            scale: 0,
        },
        other => other,
    }
}

/// Central aggregate resolver built once at engine init.
pub struct AggFnResolver {
    map: HashMap<ResolverKey, Arc<dyn AggFunction>>,
}

const SCALAR_TYPES: &[PrimitiveType] = &[
    PrimitiveType::Boolean,
    PrimitiveType::Int8,
    PrimitiveType::Int16,
    PrimitiveType::Int32,
    PrimitiveType::Int64,
    PrimitiveType::Int128,
    PrimitiveType::Float32,
    PrimitiveType::Float64,
    PrimitiveType::Date,
    PrimitiveType::Timestamp,
    PrimitiveType::Decimal128 {
        precision: 0,
        scale: 0,
    },
    PrimitiveType::Varchar,
];

const NUMERIC_TYPES: &[PrimitiveType] = &[
    PrimitiveType::Int8,
    PrimitiveType::Int16,
    PrimitiveType::Int32,
    PrimitiveType::Int64,
    PrimitiveType::Int128,
    PrimitiveType::Float32,
    PrimitiveType::Float64,
    PrimitiveType::Decimal128 {
        precision: 0,
        scale: 0,
    },
];

impl AggFnResolver {
    /// The process-wide resolver instance.
    pub fn global() -> &'static AggFnResolver {
        static RESOLVER: OnceLock<AggFnResolver> = OnceLock::new();
        RESOLVER.get_or_init(AggFnResolver::build)
    }

    fn build() -> Self {
        let mut resolver = AggFnResolver {
            map: HashMap::new(),
        };

        // count(*) has no argument and no nullable form.
        let count_star: Arc<dyn AggFunction> = Arc::new(CountFunction { skip_nulls: false });
        resolver.register_raw("count", None, false, Arc::clone(&count_star));
        resolver.register_raw("count", None, true, count_star);
        for &t in SCALAR_TYPES {
            resolver.register_raw(
                "count",
                Some(t),
                false,
                Arc::new(CountFunction { skip_nulls: false }),
            );
            // The nullable count skips null rows itself; it must not
            // finalize to NULL, so the generic wrapper does not apply.
            resolver.register_raw(
                "count",
                Some(t),
                true,
                Arc::new(CountFunction { skip_nulls: true }),
            );
        }

        for &t in NUMERIC_TYPES {
            let float = t.is_float();
            let ret = match t {
                PrimitiveType::Float32 | PrimitiveType::Float64 => PrimitiveType::Float64,
                PrimitiveType::Int128 => PrimitiveType::Int128,
                PrimitiveType::Decimal128 { .. } => canonical(t),
                _ => PrimitiveType::Int64,
            };
            resolver.register("sum", Some(t), Arc::new(SumFunction { float, ret }));
            resolver.register("avg", Some(t), Arc::new(AvgFunction));
            resolver.register(
                "percentile_approx",
                Some(t),
                Arc::new(PercentileFunction),
            );
            resolver.register(
                "multi_distinct_sum",
                Some(t),
                Arc::new(MultiDistinctFunction {
                    sum: true,
                    ret: if float { PrimitiveType::Float64 } else { PrimitiveType::Int64 },
                }),
            );
            for (name, sample, stddev) in [
                ("variance", false, false),
                ("var_pop", false, false),
                ("var_samp", true, false),
                ("stddev", false, true),
                ("stddev_pop", false, true),
                ("stddev_samp", true, true),
            ] {
                resolver.register(
                    name,
                    Some(t),
                    Arc::new(VarFunction {
                        sample,
                        stddev,
                        name,
                    }),
                );
            }
        }

        for &t in SCALAR_TYPES {
            resolver.register(
                "min",
                Some(t),
                Arc::new(ExtremeFunction {
                    is_min: true,
                    ret: t,
                }),
            );
            resolver.register(
                "max",
                Some(t),
                Arc::new(ExtremeFunction {
                    is_min: false,
                    ret: t,
                }),
            );
            resolver.register("ndv", Some(t), Arc::new(NdvFunction));
            resolver.register("approx_count_distinct", Some(t), Arc::new(NdvFunction));
            resolver.register(
                "multi_distinct_count",
                Some(t),
                Arc::new(MultiDistinctFunction {
                    sum: false,
                    ret: PrimitiveType::Int64,
                }),
            );
        }

        resolver.register(
            "group_concat",
            Some(PrimitiveType::Varchar),
            Arc::new(GroupConcatFunction),
        );
        resolver.register(
            "hll_union",
            Some(PrimitiveType::Object(ObjectType::Hll)),
            Arc::new(HllUnionFunction),
        );
        for kind in [
            BitmapKind::Union,
            BitmapKind::UnionCount,
            BitmapKind::Intersect,
            BitmapKind::IntersectCount,
        ] {
            resolver.register(
                match kind {
                    BitmapKind::Union => "bitmap_union",
                    BitmapKind::UnionCount => "bitmap_union_count",
                    BitmapKind::Intersect => "bitmap_intersect",
                    BitmapKind::IntersectCount => "bitmap_intersect_count",
                },
                Some(PrimitiveType::Object(ObjectType::Bitmap)),
                Arc::new(BitmapFunction { kind }),
            );
        }

        resolver
    }

    /// Register the plain form and its nullable wrapper.
    fn register(&mut self, name: &str, arg: Option<PrimitiveType>, func: Arc<dyn AggFunction>) {
        self.register_raw(name, arg, false, Arc::clone(&func));
        self.register_raw(name, arg, true, Arc::new(NullableAggFunction::new(func)));
    }

    fn register_raw(
        &mut self,
        name: &str,
        arg: Option<PrimitiveType>,
        nullable: bool,
        func: Arc<dyn AggFunction>,
    ) {
        let key = ResolverKey {
            name: name.to_string(),
            arg: arg.map(canonical),
            ret: canonical(func.return_type()),
            nullable,
        };
        self.map.insert(key, func);
    }

    /// Resolve `(name, argument type, return type, nullable)` to a bundle.
    pub fn resolve(
        &self,
        name: &str,
        arg: Option<PrimitiveType>,
        ret: PrimitiveType,
        nullable: bool,
    ) -> Result<Arc<dyn AggFunction>> {
        let key = ResolverKey {
            name: name.to_string(),
            arg: arg.map(canonical),
            ret: canonical(ret),
            nullable,
        };
        self.map.get(&key).cloned().ok_or_else(|| {
            EngineError::InvalidArgument(format!(
                "no aggregate registered for {name}({arg:?}) -> {ret} (nullable: {nullable})"
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolver_returns_distinct_forms_per_nullability() {
        let r = AggFnResolver::global();
        let plain = r
            .resolve("sum", Some(PrimitiveType::Int64), PrimitiveType::Int64, false)
            .unwrap();
        let nullable = r
            .resolve("sum", Some(PrimitiveType::Int64), PrimitiveType::Int64, true)
            .unwrap();
        assert!(!plain.return_nullable());
        assert!(nullable.return_nullable());
        assert!(r
            .resolve("sum", Some(PrimitiveType::Varchar), PrimitiveType::Int64, false)
            .is_err());
    }

    #[test]
    fn nullable_sum_skips_nulls_and_finalizes_null_when_unseen() {
        let r = AggFnResolver::global();
        let f = r
            .resolve("sum", Some(PrimitiveType::Int64), PrimitiveType::Int64, true)
            .unwrap();
        let col = Column::nullable_int64(&[Some(5), None, Some(7)]);
        let mut state = f.create_state();
        for row in 0..3 {
            f.update(&mut state, std::slice::from_ref(&col), row).unwrap();
        }
        let mut out = Column::new_for_type(PrimitiveType::Int64, true).unwrap();
        f.finalize(&state, &mut out).unwrap();
        assert_eq!(out.get(0), Datum::Int64(12));

        let all_null = Column::nullable_int64(&[None, None]);
        let mut state = f.create_state();
        for row in 0..2 {
            f.update(&mut state, std::slice::from_ref(&all_null), row)
                .unwrap();
        }
        let mut out = Column::new_for_type(PrimitiveType::Int64, true).unwrap();
        f.finalize(&state, &mut out).unwrap();
        assert_eq!(out.get(0), Datum::Null);
    }

    #[test]
    fn partial_states_merge_like_direct_updates() {
        let r = AggFnResolver::global();
        for name in ["sum", "avg", "variance", "stddev_samp", "ndv", "multi_distinct_count"] {
            let f = r
                .resolve(name, Some(PrimitiveType::Int64), {
                    match name {
                        "sum" => PrimitiveType::Int64,
                        "ndv" | "multi_distinct_count" => PrimitiveType::Int64,
                        _ => PrimitiveType::Float64,
                    }
                }, false)
                .unwrap();
            let left = Column::int64(&[1, 2, 3]);
            let right = Column::int64(&[3, 4, 5, 6]);

            // Split accumulation + merge.
            let mut a = f.create_state();
            for row in 0..3 {
                f.update(&mut a, std::slice::from_ref(&left), row).unwrap();
            }
            let mut b = f.create_state();
            for row in 0..4 {
                f.update(&mut b, std::slice::from_ref(&right), row).unwrap();
            }
            let mut payload = Vec::new();
            f.serialize_state(&b, &mut payload).unwrap();
            f.merge(&mut a, &payload).unwrap();

            // Direct accumulation over everything.
            let all = Column::int64(&[1, 2, 3, 3, 4, 5, 6]);
            let mut direct = f.create_state();
            for row in 0..7 {
                f.update(&mut direct, std::slice::from_ref(&all), row).unwrap();
            }

            let mut merged_out = Column::new_for_type(f.return_type(), true).unwrap();
            f.finalize(&a, &mut merged_out).unwrap();
            let mut direct_out = Column::new_for_type(f.return_type(), true).unwrap();
            f.finalize(&direct, &mut direct_out).unwrap();
            assert_eq!(merged_out, direct_out, "mismatch for {name}");
        }
    }

    #[test]
    fn count_star_counts_rows_including_nulls() {
        let r = AggFnResolver::global();
        let f = r
            .resolve("count", Some(PrimitiveType::Int64), PrimitiveType::Int64, true)
            .unwrap();
        let col = Column::nullable_int64(&[Some(1), None]);
        let mut state = f.create_state();
        for row in 0..2 {
            f.update(&mut state, std::slice::from_ref(&col), row).unwrap();
        }
        let mut out = Column::new_for_type(PrimitiveType::Int64, false).unwrap();
        f.finalize(&state, &mut out).unwrap();
        // count(col) skips the null row but still yields a number.
        assert_eq!(out.get(0), Datum::Int64(1));
    }

    #[test]
    fn bitmap_intersect_count_intersects_rows_and_partial_states() {
        let r = AggFnResolver::global();
        let f = r
            .resolve(
                "bitmap_intersect_count",
                Some(PrimitiveType::Object(ObjectType::Bitmap)),
                PrimitiveType::Int64,
                false,
            )
            .unwrap();

        let bitmap_col = |rows: &[&[u64]]| {
            let mut col = basalt_chunk::ObjectColumn::new(ObjectType::Bitmap);
            for values in rows {
                col.push(ObjectValue::Bitmap(values.iter().copied().collect()))
                    .unwrap();
            }
            Column::Object(col)
        };

        // {1,2,3} & {2,3,4} -> {2,3}.
        let left = bitmap_col(&[&[1, 2, 3], &[2, 3, 4]]);
        let mut state = f.create_state();
        for row in 0..2 {
            f.update(&mut state, std::slice::from_ref(&left), row).unwrap();
        }

        // Partial from another producer: {3,4} & {3,5} -> {3}.
        let right = bitmap_col(&[&[3, 4], &[3, 5]]);
        let mut other = f.create_state();
        for row in 0..2 {
            f.update(&mut other, std::slice::from_ref(&right), row).unwrap();
        }
        let mut payload = Vec::new();
        f.serialize_state(&other, &mut payload).unwrap();
        f.merge(&mut state, &payload).unwrap();

        // An empty partial (no rows observed) must not narrow the result.
        let empty = f.create_state();
        payload.clear();
        f.serialize_state(&empty, &mut payload).unwrap();
        f.merge(&mut state, &payload).unwrap();

        let mut out = Column::new_for_type(PrimitiveType::Int64, false).unwrap();
        f.finalize(&state, &mut out).unwrap();
        assert_eq!(out.get(0), Datum::Int64(1));

        // bitmap_intersect over the same rows emits the bitmap object itself.
        let intersect = r
            .resolve(
                "bitmap_intersect",
                Some(PrimitiveType::Object(ObjectType::Bitmap)),
                PrimitiveType::Object(ObjectType::Bitmap),
                false,
            )
            .unwrap();
        let mut state = intersect.create_state();
        for row in 0..2 {
            intersect
                .update(&mut state, std::slice::from_ref(&left), row)
                .unwrap();
        }
        let mut out =
            Column::new_for_type(PrimitiveType::Object(ObjectType::Bitmap), false).unwrap();
        intersect.finalize(&state, &mut out).unwrap();
        let Column::Object(objects) = &out else {
            panic!("expected object column");
        };
        let ObjectValue::Bitmap(bitmap) = objects.get(0) else {
            panic!("expected bitmap object");
        };
        assert_eq!(bitmap.iter().collect::<Vec<u64>>(), vec![2, 3]);
    }

    #[test]
    fn group_concat_joins_with_separator() {
        let r = AggFnResolver::global();
        let f = r
            .resolve(
                "group_concat",
                Some(PrimitiveType::Varchar),
                PrimitiveType::Varchar,
                false,
            )
            .unwrap();
        let col = Column::varchar(&["a", "b", "c"]);
        let mut state = f.create_state();
        for row in 0..3 {
            f.update(&mut state, std::slice::from_ref(&col), row).unwrap();
        }
        let mut out = Column::new_for_type(PrimitiveType::Varchar, true).unwrap();
        f.finalize(&state, &mut out).unwrap();
        assert_eq!(out.get(0), Datum::Binary(b"a, b, c".to_vec()));
    }
}
