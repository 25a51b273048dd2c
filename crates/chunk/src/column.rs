//! Typed columns: fixed-width vectors, binary vectors, nullable wrappers,
//! constants and opaque aggregate objects.
//!
//! Columns are growable: operators build output columns by appending rows
//! copied from input columns (`append_column`, `append_selective`). Row
//! equality, per-row hashing and the wire encoding all live here so the key
//! adaptors and the exchange never reimplement per-type dispatch.

use roaring::RoaringTreemap;

use basalt_common::{EngineError, Result};

use crate::hash::{crc32_bytes, fnv_mix};
use crate::sketch::HllSketch;
use crate::types::{Datum, ObjectType, PrimitiveType};

/// Fixed-width vector storing raw little-endian values.
#[derive(Debug, Clone, PartialEq)]
pub struct FixedColumn {
    ptype: PrimitiveType,
    data: Vec<u8>,
}

impl FixedColumn {
    /// Create an empty vector of `ptype`; the type must be fixed-width.
    pub fn new(ptype: PrimitiveType) -> Result<Self> {
        if ptype.fixed_width().is_none() {
            return Err(EngineError::Internal(format!(
                "fixed column cannot hold {ptype}"
            )));
        }
        Ok(Self {
            ptype,
            data: Vec::new(),
        })
    }

    /// Element type.
    pub fn ptype(&self) -> PrimitiveType {
        self.ptype
    }

    fn width(&self) -> usize {
        self.ptype.fixed_width().unwrap_or(1)
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.data.len() / self.width()
    }

    /// Whether the vector is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Raw bytes of row `i`.
    #[inline]
    pub fn value_bytes(&self, i: usize) -> &[u8] {
        let w = self.width();
        &self.data[i * w..(i + 1) * w]
    }

    /// Decode row `i` into a datum.
    pub fn get(&self, i: usize) -> Datum {
        decode_fixed(self.ptype, self.value_bytes(i))
    }

    /// Append one encoded value.
    pub fn push_datum(&mut self, d: &Datum) -> Result<()> {
        let mut scratch = [0u8; 16];
        let w = encode_fixed(self.ptype, d, &mut scratch)?;
        self.data.extend_from_slice(&scratch[..w]);
        Ok(())
    }

    /// Append raw encoded bytes of one value.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() != self.width() {
            return Err(EngineError::Internal(format!(
                "fixed value width mismatch: got {} want {}",
                bytes.len(),
                self.width()
            )));
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }
}

/// Variable-length byte-string vector: offsets plus a shared byte buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct BinaryColumn {
    offsets: Vec<u32>,
    bytes: Vec<u8>,
}

impl Default for BinaryColumn {
    fn default() -> Self {
        Self::new()
    }
}

impl BinaryColumn {
    /// Create an empty binary vector.
    pub fn new() -> Self {
        Self {
            offsets: vec![0],
            bytes: Vec::new(),
        }
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.offsets.len() - 1
    }

    /// Whether the vector is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Byte slice of row `i`.
    #[inline]
    pub fn value(&self, i: usize) -> &[u8] {
        &self.bytes[self.offsets[i] as usize..self.offsets[i + 1] as usize]
    }

    /// Append one byte string.
    pub fn push(&mut self, value: &[u8]) {
        self.bytes.extend_from_slice(value);
        self.offsets.push(self.bytes.len() as u32);
    }

    /// Append many byte strings at once.
    pub fn append_strings<'a>(&mut self, values: impl IntoIterator<Item = &'a [u8]>) {
        for v in values {
            self.push(v);
        }
    }

    /// Longest element length.
    pub fn max_value_len(&self) -> usize {
        (0..self.len())
            .map(|i| (self.offsets[i + 1] - self.offsets[i]) as usize)
            .max()
            .unwrap_or(0)
    }
}

/// Nullable wrapper: a data column plus a one-byte-per-row null mask.
#[derive(Debug, Clone, PartialEq)]
pub struct NullableColumn {
    data: Box<Column>,
    /// 1 marks NULL. Always the same length as `data`.
    nulls: Vec<u8>,
}

impl NullableColumn {
    /// Wrap an empty data column.
    pub fn new(data: Column) -> Self {
        let nulls = vec![0; data.len()];
        Self {
            data: Box::new(data),
            nulls,
        }
    }

    /// Whether row `i` is NULL.
    #[inline]
    pub fn is_null(&self, i: usize) -> bool {
        self.nulls[i] != 0
    }

    /// Whether any row is NULL.
    pub fn has_nulls(&self) -> bool {
        self.nulls.iter().any(|&n| n != 0)
    }

    /// The wrapped data column.
    pub fn data(&self) -> &Column {
        &self.data
    }

    /// The null mask (1 = NULL).
    pub fn null_mask(&self) -> &[u8] {
        &self.nulls
    }
}

/// Constant column: one value with a logical row count.
#[derive(Debug, Clone, PartialEq)]
pub struct ConstColumn {
    ptype: PrimitiveType,
    value: Datum,
    len: usize,
}

impl ConstColumn {
    /// Create a constant column.
    pub fn new(ptype: PrimitiveType, value: Datum, len: usize) -> Self {
        Self { ptype, value, len }
    }

    /// The constant value.
    pub fn value(&self) -> &Datum {
        &self.value
    }
}

/// Opaque per-row aggregate object.
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectValue {
    /// HyperLogLog sketch.
    Hll(HllSketch),
    /// 64-bit roaring bitmap.
    Bitmap(RoaringTreemap),
}

impl ObjectValue {
    fn otype(&self) -> ObjectType {
        match self {
            ObjectValue::Hll(_) => ObjectType::Hll,
            ObjectValue::Bitmap(_) => ObjectType::Bitmap,
        }
    }

    fn serialize_to(&self, out: &mut Vec<u8>) -> Result<()> {
        match self {
            ObjectValue::Hll(h) => {
                h.serialize_to(out);
                Ok(())
            }
            ObjectValue::Bitmap(b) => {
                b.serialize_into(out)
                    .map_err(|e| EngineError::Internal(format!("bitmap serialize failed: {e}")))
            }
        }
    }

    fn deserialize(otype: ObjectType, bytes: &[u8]) -> Result<Self> {
        match otype {
            ObjectType::Hll => Ok(ObjectValue::Hll(HllSketch::deserialize(bytes)?)),
            ObjectType::Bitmap => RoaringTreemap::deserialize_from(bytes)
                .map(ObjectValue::Bitmap)
                .map_err(|e| EngineError::InvalidArgument(format!("bad bitmap payload: {e}"))),
        }
    }
}

/// Vector of opaque objects of one kind.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectColumn {
    otype: ObjectType,
    items: Vec<ObjectValue>,
}

impl ObjectColumn {
    /// Create an empty object vector.
    pub fn new(otype: ObjectType) -> Self {
        Self {
            otype,
            items: Vec::new(),
        }
    }

    /// Object kind.
    pub fn otype(&self) -> ObjectType {
        self.otype
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Object at row `i`.
    pub fn get(&self, i: usize) -> &ObjectValue {
        &self.items[i]
    }

    /// Append one object; its kind must match the column.
    pub fn push(&mut self, value: ObjectValue) -> Result<()> {
        if value.otype() != self.otype {
            return Err(EngineError::Internal(
                "object kind mismatch on append".to_string(),
            ));
        }
        self.items.push(value);
        Ok(())
    }
}

/// One column of a chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    /// Fixed-width values.
    Fixed(FixedColumn),
    /// Variable-length byte strings.
    Binary(BinaryColumn),
    /// Nullable wrapper around a data column.
    Nullable(NullableColumn),
    /// Single value with a logical length.
    Const(ConstColumn),
    /// Opaque aggregate objects.
    Object(ObjectColumn),
}

impl Column {
    /// Number of rows.
    pub fn len(&self) -> usize {
        match self {
            Column::Fixed(c) => c.len(),
            Column::Binary(c) => c.len(),
            Column::Nullable(c) => c.data.len(),
            Column::Const(c) => c.len,
            Column::Object(c) => c.len(),
        }
    }

    /// Whether the column has no rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element type.
    pub fn ptype(&self) -> PrimitiveType {
        match self {
            Column::Fixed(c) => c.ptype,
            Column::Binary(_) => PrimitiveType::Varchar,
            Column::Nullable(c) => c.data.ptype(),
            Column::Const(c) => c.ptype,
            Column::Object(c) => PrimitiveType::Object(c.otype),
        }
    }

    /// Whether the column is a nullable wrapper (or a NULL constant).
    pub fn is_nullable(&self) -> bool {
        match self {
            Column::Nullable(_) => true,
            Column::Const(c) => c.value.is_null(),
            _ => false,
        }
    }

    /// Whether row `i` is NULL.
    #[inline]
    pub fn is_null_at(&self, i: usize) -> bool {
        match self {
            Column::Nullable(c) => c.is_null(i),
            Column::Const(c) => c.value.is_null(),
            _ => false,
        }
    }

    /// Decode row `i` into a datum. Object columns are not datum-addressable.
    pub fn get(&self, i: usize) -> Datum {
        match self {
            Column::Fixed(c) => c.get(i),
            Column::Binary(c) => Datum::Binary(c.value(i).to_vec()),
            Column::Nullable(c) => {
                if c.is_null(i) {
                    Datum::Null
                } else {
                    c.data.get(i)
                }
            }
            Column::Const(c) => c.value.clone(),
            Column::Object(_) => Datum::Null,
        }
    }

    /// Byte-string view of row `i` for binary-backed columns.
    pub fn get_slice(&self, i: usize) -> Option<&[u8]> {
        match self {
            Column::Binary(c) => Some(c.value(i)),
            Column::Nullable(c) => {
                if c.is_null(i) {
                    None
                } else {
                    c.data.get_slice(i)
                }
            }
            Column::Const(c) => c.value.as_bytes(),
            _ => None,
        }
    }

    /// Build an empty column of the same shape.
    pub fn new_empty_like(&self) -> Result<Column> {
        Ok(match self {
            Column::Fixed(c) => Column::Fixed(FixedColumn::new(c.ptype)?),
            Column::Binary(_) => Column::Binary(BinaryColumn::new()),
            Column::Nullable(c) => Column::Nullable(NullableColumn::new(c.data.new_empty_like()?)),
            Column::Const(c) => Column::Const(ConstColumn::new(c.ptype, c.value.clone(), 0)),
            Column::Object(c) => Column::Object(ObjectColumn::new(c.otype)),
        })
    }

    /// Build an empty, growable column for `(ptype, nullable)`.
    pub fn new_for_type(ptype: PrimitiveType, nullable: bool) -> Result<Column> {
        let data = match ptype {
            PrimitiveType::Varchar => Column::Binary(BinaryColumn::new()),
            PrimitiveType::Object(ot) => Column::Object(ObjectColumn::new(ot)),
            fixed => Column::Fixed(FixedColumn::new(fixed)?),
        };
        Ok(if nullable {
            Column::Nullable(NullableColumn::new(data))
        } else {
            data
        })
    }

    /// Append one datum; NULL requires a nullable column.
    pub fn append_datum(&mut self, d: &Datum) -> Result<()> {
        match self {
            Column::Fixed(c) => c.push_datum(d),
            Column::Binary(c) => match d {
                Datum::Binary(b) => {
                    c.push(b);
                    Ok(())
                }
                other => Err(EngineError::Internal(format!(
                    "cannot append {other:?} to binary column"
                ))),
            },
            Column::Nullable(c) => {
                if d.is_null() {
                    c.nulls.push(1);
                    c.data.append_default()
                } else {
                    c.nulls.push(0);
                    c.data.append_datum(d)
                }
            }
            Column::Const(c) => {
                if *d == c.value {
                    c.len += 1;
                    Ok(())
                } else {
                    Err(EngineError::Internal(
                        "cannot append a different value to a const column".to_string(),
                    ))
                }
            }
            Column::Object(_) => Err(EngineError::Internal(
                "cannot append datum to object column".to_string(),
            )),
        }
    }

    /// Append the type's zero value (placeholder under a NULL flag).
    fn append_default(&mut self) -> Result<()> {
        match self {
            Column::Fixed(c) => {
                let w = c.width();
                c.data.extend(std::iter::repeat(0u8).take(w));
                Ok(())
            }
            Column::Binary(c) => {
                c.push(b"");
                Ok(())
            }
            Column::Object(c) => {
                let v = match c.otype {
                    ObjectType::Hll => ObjectValue::Hll(HllSketch::default()),
                    ObjectType::Bitmap => ObjectValue::Bitmap(RoaringTreemap::new()),
                };
                c.items.push(v);
                Ok(())
            }
            _ => Err(EngineError::Internal(
                "append_default on wrapper column".to_string(),
            )),
        }
    }

    /// Append `n` NULL rows; requires a nullable column.
    pub fn append_nulls(&mut self, n: usize) -> Result<()> {
        match self {
            Column::Nullable(c) => {
                for _ in 0..n {
                    c.nulls.push(1);
                    c.data.append_default()?;
                }
                Ok(())
            }
            Column::Const(c) if c.value.is_null() => {
                c.len += n;
                Ok(())
            }
            _ => Err(EngineError::Internal(
                "append_nulls on non-nullable column".to_string(),
            )),
        }
    }

    /// Append rows `from..from+size` of `src`.
    pub fn append_column(&mut self, src: &Column, from: usize, size: usize) -> Result<()> {
        match (self, src) {
            (Column::Fixed(dst), Column::Fixed(s)) if dst.ptype == s.ptype => {
                let w = dst.width();
                dst.data.extend_from_slice(&s.data[from * w..(from + size) * w]);
                Ok(())
            }
            (Column::Binary(dst), Column::Binary(s)) => {
                for i in from..from + size {
                    dst.push(s.value(i));
                }
                Ok(())
            }
            (Column::Object(dst), Column::Object(s)) if dst.otype == s.otype => {
                dst.items.extend(s.items[from..from + size].iter().cloned());
                Ok(())
            }
            (Column::Nullable(dst), Column::Nullable(s)) => {
                dst.nulls.extend_from_slice(&s.nulls[from..from + size]);
                dst.data.append_column(&s.data, from, size)
            }
            (dst, Column::Const(s)) => {
                for _ in 0..size {
                    dst.append_datum(&s.value)?;
                }
                Ok(())
            }
            (Column::Nullable(dst), s) => {
                dst.nulls.extend(std::iter::repeat(0u8).take(size));
                dst.data.append_column(s, from, size)
            }
            (dst, s) => Err(EngineError::Internal(format!(
                "append_column shape mismatch: {} <- {}",
                dst.ptype(),
                s.ptype()
            ))),
        }
    }

    /// Append `src[idx[i]]` for each index, in order.
    pub fn append_selective(&mut self, src: &Column, indices: &[u32]) -> Result<()> {
        match (self, src) {
            (Column::Fixed(dst), Column::Fixed(s)) if dst.ptype == s.ptype => {
                let w = dst.width();
                dst.data.reserve(indices.len() * w);
                for &i in indices {
                    let i = i as usize;
                    dst.data.extend_from_slice(&s.data[i * w..(i + 1) * w]);
                }
                Ok(())
            }
            (Column::Binary(dst), Column::Binary(s)) => {
                for &i in indices {
                    dst.push(s.value(i as usize));
                }
                Ok(())
            }
            (Column::Object(dst), Column::Object(s)) if dst.otype == s.otype => {
                for &i in indices {
                    dst.items.push(s.items[i as usize].clone());
                }
                Ok(())
            }
            (Column::Nullable(dst), Column::Nullable(s)) => {
                for &i in indices {
                    dst.nulls.push(s.nulls[i as usize]);
                }
                dst.data.append_selective(&s.data, indices)
            }
            (dst, Column::Const(s)) => {
                for _ in indices {
                    dst.append_datum(&s.value)?;
                }
                Ok(())
            }
            (Column::Nullable(dst), s) => {
                dst.nulls.extend(std::iter::repeat(0u8).take(indices.len()));
                dst.data.append_selective(s, indices)
            }
            (dst, s) => Err(EngineError::Internal(format!(
                "append_selective shape mismatch: {} <- {}",
                dst.ptype(),
                s.ptype()
            ))),
        }
    }

    /// Row equality between two columns.
    ///
    /// With `null_safe`, NULL equals NULL; otherwise any NULL side compares
    /// unequal (SQL `=` semantics collapsed to false).
    pub fn equals(&self, row: usize, other: &Column, other_row: usize, null_safe: bool) -> bool {
        let a_null = self.is_null_at(row);
        let b_null = other.is_null_at(other_row);
        if a_null || b_null {
            return null_safe && a_null && b_null;
        }
        self.get(row) == other.get(other_row)
    }

    /// Mix each row's FNV-1a hash into `hashes` (general partitioning).
    pub fn fnv_hash(&self, hashes: &mut [u64]) -> Result<()> {
        self.check_hash_len(hashes.len())?;
        let mut scratch = [0u8; 16];
        for (i, h) in hashes.iter_mut().enumerate() {
            *h = fnv_mix(*h, self.row_hash_bytes(i, &mut scratch)?);
        }
        Ok(())
    }

    /// Chain each row's CRC32 into `hashes` (bucket-shuffle distribution).
    /// NULL rows leave the running hash untouched.
    pub fn crc32_hash(&self, hashes: &mut [u32]) -> Result<()> {
        self.check_hash_len(hashes.len())?;
        let mut scratch = [0u8; 16];
        for (i, h) in hashes.iter_mut().enumerate() {
            if let Some(bytes) = self.row_hash_bytes(i, &mut scratch)? {
                *h = crc32_bytes(*h, bytes);
            }
        }
        Ok(())
    }

    fn check_hash_len(&self, n: usize) -> Result<()> {
        if n != self.len() {
            return Err(EngineError::Internal(format!(
                "hash buffer length {} does not match column length {}",
                n,
                self.len()
            )));
        }
        Ok(())
    }

    /// Bytes hashed for row `i`; `None` for NULL rows.
    fn row_hash_bytes<'a>(&'a self, i: usize, scratch: &'a mut [u8; 16]) -> Result<Option<&'a [u8]>> {
        match self {
            Column::Fixed(c) => Ok(Some(c.value_bytes(i))),
            Column::Binary(c) => Ok(Some(c.value(i))),
            Column::Nullable(c) => {
                if c.is_null(i) {
                    Ok(None)
                } else {
                    c.data.row_hash_bytes(i, scratch)
                }
            }
            Column::Const(c) => {
                if c.value.is_null() {
                    Ok(None)
                } else if let Some(b) = c.value.as_bytes() {
                    Ok(Some(b))
                } else {
                    let w = encode_fixed(c.ptype, &c.value, scratch)?;
                    Ok(Some(&scratch[..w]))
                }
            }
            Column::Object(_) => Err(EngineError::Internal(
                "object columns cannot be hashed".to_string(),
            )),
        }
    }

    /// Serialize one row for composite-key encoding.
    ///
    /// Layout: nullable adds a flag byte (1 = NULL, value omitted); fixed
    /// values are raw bytes; binary values are u32 length + bytes.
    pub fn serialize_row_to(&self, row: usize, out: &mut Vec<u8>) -> Result<()> {
        match self {
            Column::Fixed(c) => {
                out.extend_from_slice(c.value_bytes(row));
                Ok(())
            }
            Column::Binary(c) => {
                let v = c.value(row);
                out.extend_from_slice(&(v.len() as u32).to_le_bytes());
                out.extend_from_slice(v);
                Ok(())
            }
            Column::Nullable(c) => {
                if c.is_null(row) {
                    out.push(1);
                    Ok(())
                } else {
                    out.push(0);
                    c.data.serialize_row_to(row, out)
                }
            }
            Column::Const(c) => {
                let mut tmp = self.const_row_column(c)?;
                tmp.serialize_row_to(0, out)
            }
            Column::Object(_) => Err(EngineError::Internal(
                "object columns cannot be key-serialized".to_string(),
            )),
        }
    }

    fn const_row_column(&self, c: &ConstColumn) -> Result<Column> {
        let mut col = Column::new_for_type(c.ptype, c.value.is_null())?;
        col.append_datum(&c.value)?;
        Ok(col)
    }

    /// Serialize one row into the start of `out`, returning bytes written.
    ///
    /// Same layout as [`Column::serialize_row_to`]; used by the composite-key
    /// scratch buffer, which writes rows at fixed stride offsets.
    pub fn serialize_row_into(&self, row: usize, out: &mut [u8]) -> Result<usize> {
        match self {
            Column::Fixed(c) => {
                let bytes = c.value_bytes(row);
                out[..bytes.len()].copy_from_slice(bytes);
                Ok(bytes.len())
            }
            Column::Binary(c) => {
                let v = c.value(row);
                out[..4].copy_from_slice(&(v.len() as u32).to_le_bytes());
                out[4..4 + v.len()].copy_from_slice(v);
                Ok(4 + v.len())
            }
            Column::Nullable(c) => {
                if c.is_null(row) {
                    out[0] = 1;
                    Ok(1)
                } else {
                    out[0] = 0;
                    Ok(1 + c.data.serialize_row_into(row, &mut out[1..])?)
                }
            }
            Column::Const(c) => {
                let tmp = self.const_row_column(c)?;
                tmp.serialize_row_into(0, out)
            }
            Column::Object(_) => Err(EngineError::Internal(
                "object columns cannot be key-serialized".to_string(),
            )),
        }
    }

    /// Append one row previously written by [`Column::serialize_row_to`],
    /// advancing `buf` past the consumed bytes.
    pub fn deserialize_row_from(&mut self, buf: &mut &[u8]) -> Result<()> {
        match self {
            Column::Fixed(c) => {
                let w = c.width();
                let (head, rest) = split_checked(buf, w)?;
                c.data.extend_from_slice(head);
                *buf = rest;
                Ok(())
            }
            Column::Binary(c) => {
                let (len_bytes, rest) = split_checked(buf, 4)?;
                let len = u32::from_le_bytes(len_bytes.try_into().unwrap()) as usize;
                let (value, rest) = split_checked(&rest, len)?;
                c.push(value);
                *buf = rest;
                Ok(())
            }
            Column::Nullable(c) => {
                let (flag, rest) = split_checked(buf, 1)?;
                *buf = rest;
                if flag[0] != 0 {
                    c.nulls.push(1);
                    c.data.append_default()
                } else {
                    c.nulls.push(0);
                    c.data.deserialize_row_from(buf)
                }
            }
            _ => Err(EngineError::Internal(
                "row deserialization targets fixed/binary/nullable columns".to_string(),
            )),
        }
    }

    /// Upper bound of one row's [`Column::serialize_row_to`] size.
    pub fn max_one_row_serialized_size(&self) -> usize {
        match self {
            Column::Fixed(c) => c.width(),
            Column::Binary(c) => 4 + c.max_value_len(),
            Column::Nullable(c) => 1 + c.data.max_one_row_serialized_size(),
            Column::Const(c) => match &c.value {
                Datum::Binary(b) => 4 + b.len(),
                _ => 1 + c.ptype.fixed_width().unwrap_or(0),
            },
            Column::Object(_) => 0,
        }
    }
}

impl Column {
    /// Serialize the column body in the wire layout (no metadata, no row count).
    pub(crate) fn serialize_body(&self, out: &mut Vec<u8>) -> Result<()> {
        match self {
            Column::Fixed(c) => {
                out.extend_from_slice(&c.data);
                Ok(())
            }
            Column::Binary(c) => {
                for off in &c.offsets {
                    out.extend_from_slice(&off.to_le_bytes());
                }
                out.extend_from_slice(&c.bytes);
                Ok(())
            }
            Column::Nullable(c) => {
                out.extend_from_slice(&c.nulls);
                c.data.serialize_body(out)
            }
            Column::Const(c) => {
                if c.value.is_null() {
                    out.push(1);
                    return Ok(());
                }
                out.push(0);
                if let Some(bytes) = c.value.as_bytes() {
                    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
                    out.extend_from_slice(bytes);
                } else {
                    let mut scratch = [0u8; 16];
                    let w = encode_fixed(c.ptype, &c.value, &mut scratch)?;
                    out.extend_from_slice(&scratch[..w]);
                }
                Ok(())
            }
            Column::Object(c) => {
                let mut scratch = Vec::new();
                for item in &c.items {
                    scratch.clear();
                    item.serialize_to(&mut scratch)?;
                    out.extend_from_slice(&(scratch.len() as u32).to_le_bytes());
                    out.extend_from_slice(&scratch);
                }
                Ok(())
            }
        }
    }

    /// Decode a column body written by [`Column::serialize_body`], advancing `buf`.
    pub(crate) fn deserialize_body(
        buf: &mut &[u8],
        ptype: PrimitiveType,
        nullable: bool,
        is_const: bool,
        rows: usize,
    ) -> Result<Column> {
        if is_const {
            let (flag, rest) = split_checked(buf, 1)?;
            *buf = rest;
            if flag[0] != 0 {
                return Ok(Column::Const(ConstColumn::new(ptype, Datum::Null, rows)));
            }
            let value = if ptype == PrimitiveType::Varchar {
                let (len_bytes, rest) = split_checked(buf, 4)?;
                let len = u32::from_le_bytes(len_bytes.try_into().unwrap()) as usize;
                let (bytes, rest) = split_checked(&rest, len)?;
                *buf = rest;
                Datum::Binary(bytes.to_vec())
            } else {
                let w = ptype.fixed_width().ok_or_else(|| {
                    EngineError::InvalidArgument(format!("const column of {ptype} on the wire"))
                })?;
                let (bytes, rest) = split_checked(buf, w)?;
                *buf = rest;
                decode_fixed(ptype, bytes)
            };
            return Ok(Column::Const(ConstColumn::new(ptype, value, rows)));
        }
        if nullable {
            let (mask, rest) = split_checked(buf, rows)?;
            let nulls = mask.to_vec();
            *buf = rest;
            let data = Column::deserialize_body(buf, ptype, false, false, rows)?;
            return Ok(Column::Nullable(NullableColumn {
                data: Box::new(data),
                nulls,
            }));
        }
        match ptype {
            PrimitiveType::Varchar => {
                let (off_bytes, rest) = split_checked(buf, (rows + 1) * 4)?;
                let offsets: Vec<u32> = off_bytes
                    .chunks_exact(4)
                    .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
                    .collect();
                let data_len = *offsets.last().unwrap_or(&0) as usize;
                let (bytes, rest) = split_checked(&rest, data_len)?;
                *buf = rest;
                if offsets.first() != Some(&0) {
                    return Err(EngineError::InvalidArgument(
                        "binary column offsets must start at 0".to_string(),
                    ));
                }
                Ok(Column::Binary(BinaryColumn {
                    offsets,
                    bytes: bytes.to_vec(),
                }))
            }
            PrimitiveType::Object(otype) => {
                let mut col = ObjectColumn::new(otype);
                for _ in 0..rows {
                    let (len_bytes, rest) = split_checked(buf, 4)?;
                    let len = u32::from_le_bytes(len_bytes.try_into().unwrap()) as usize;
                    let (payload, rest) = split_checked(&rest, len)?;
                    *buf = rest;
                    col.items.push(ObjectValue::deserialize(otype, payload)?);
                }
                Ok(Column::Object(col))
            }
            fixed => {
                let w = fixed.fixed_width().ok_or_else(|| {
                    EngineError::Internal(format!("{fixed} has no fixed width"))
                })?;
                let (data, rest) = split_checked(buf, rows * w)?;
                *buf = rest;
                Ok(Column::Fixed(FixedColumn {
                    ptype: fixed,
                    data: data.to_vec(),
                }))
            }
        }
    }

    /// Approximate heap bytes held by the column, for memory accounting.
    pub fn byte_usage(&self) -> usize {
        match self {
            Column::Fixed(c) => c.data.len(),
            Column::Binary(c) => c.bytes.len() + c.offsets.len() * 4,
            Column::Nullable(c) => c.nulls.len() + c.data.byte_usage(),
            Column::Const(c) => match &c.value {
                Datum::Binary(b) => b.len(),
                _ => 16,
            },
            Column::Object(c) => c
                .items
                .iter()
                .map(|v| match v {
                    ObjectValue::Hll(_) => 1 << 14,
                    ObjectValue::Bitmap(b) => (b.len() as usize).max(64),
                })
                .sum(),
        }
    }
}

fn split_checked<'a>(buf: &&'a [u8], n: usize) -> Result<(&'a [u8], &'a [u8])> {
    if buf.len() < n {
        return Err(EngineError::InvalidArgument(format!(
            "truncated payload: need {n} bytes, have {}",
            buf.len()
        )));
    }
    Ok(buf.split_at(n))
}

pub(crate) fn encode_fixed(ptype: PrimitiveType, d: &Datum, out: &mut [u8; 16]) -> Result<usize> {
    let width = ptype
        .fixed_width()
        .ok_or_else(|| EngineError::Internal(format!("{ptype} is not fixed-width")))?;
    match (ptype, d) {
        (PrimitiveType::Boolean, Datum::Boolean(v)) => out[0] = *v as u8,
        (PrimitiveType::Int8, Datum::Int8(v)) => out[0] = *v as u8,
        (PrimitiveType::Int16, Datum::Int16(v)) => out[..2].copy_from_slice(&v.to_le_bytes()),
        (PrimitiveType::Int32, Datum::Int32(v)) => out[..4].copy_from_slice(&v.to_le_bytes()),
        (PrimitiveType::Date, Datum::Date(v)) => out[..4].copy_from_slice(&v.to_le_bytes()),
        (PrimitiveType::Int64, Datum::Int64(v)) => out[..8].copy_from_slice(&v.to_le_bytes()),
        (PrimitiveType::Timestamp, Datum::Timestamp(v)) => {
            out[..8].copy_from_slice(&v.to_le_bytes())
        }
        (PrimitiveType::Int128, Datum::Int128(v)) => out[..16].copy_from_slice(&v.to_le_bytes()),
        (PrimitiveType::Decimal128 { .. }, Datum::Int128(v)) => {
            out[..16].copy_from_slice(&v.to_le_bytes())
        }
        (PrimitiveType::Float32, Datum::Float32(v)) => out[..4].copy_from_slice(&v.to_le_bytes()),
        (PrimitiveType::Float64, Datum::Float64(v)) => out[..8].copy_from_slice(&v.to_le_bytes()),
        (ptype, other) => {
            return Err(EngineError::Internal(format!(
                "datum {other:?} does not encode as {ptype}"
            )))
        }
    }
    Ok(width)
}

/// Decode one fixed-width value from its raw little-endian bytes.
pub fn decode_fixed(ptype: PrimitiveType, bytes: &[u8]) -> Datum {
    match ptype {
        PrimitiveType::Boolean => Datum::Boolean(bytes[0] != 0),
        PrimitiveType::Int8 => Datum::Int8(bytes[0] as i8),
        PrimitiveType::Int16 => Datum::Int16(i16::from_le_bytes(bytes[..2].try_into().unwrap())),
        PrimitiveType::Int32 => Datum::Int32(i32::from_le_bytes(bytes[..4].try_into().unwrap())),
        PrimitiveType::Date => Datum::Date(i32::from_le_bytes(bytes[..4].try_into().unwrap())),
        PrimitiveType::Int64 => Datum::Int64(i64::from_le_bytes(bytes[..8].try_into().unwrap())),
        PrimitiveType::Timestamp => {
            Datum::Timestamp(i64::from_le_bytes(bytes[..8].try_into().unwrap()))
        }
        PrimitiveType::Int128 | PrimitiveType::Decimal128 { .. } => {
            Datum::Int128(i128::from_le_bytes(bytes[..16].try_into().unwrap()))
        }
        PrimitiveType::Float32 => {
            Datum::Float32(f32::from_le_bytes(bytes[..4].try_into().unwrap()))
        }
        PrimitiveType::Float64 => {
            Datum::Float64(f64::from_le_bytes(bytes[..8].try_into().unwrap()))
        }
        PrimitiveType::Varchar | PrimitiveType::Object(_) => Datum::Null,
    }
}

// Test/builder conveniences used across the workspace.
impl Column {
    /// Non-nullable Int64 column from values.
    pub fn int64(values: &[i64]) -> Column {
        let mut c = FixedColumn::new(PrimitiveType::Int64).unwrap();
        for v in values {
            c.data.extend_from_slice(&v.to_le_bytes());
        }
        Column::Fixed(c)
    }

    /// Non-nullable Int32 column from values.
    pub fn int32(values: &[i32]) -> Column {
        let mut c = FixedColumn::new(PrimitiveType::Int32).unwrap();
        for v in values {
            c.data.extend_from_slice(&v.to_le_bytes());
        }
        Column::Fixed(c)
    }

    /// Non-nullable Float64 column from values.
    pub fn float64(values: &[f64]) -> Column {
        let mut c = FixedColumn::new(PrimitiveType::Float64).unwrap();
        for v in values {
            c.data.extend_from_slice(&v.to_le_bytes());
        }
        Column::Fixed(c)
    }

    /// Nullable Int64 column from optional values.
    pub fn nullable_int64(values: &[Option<i64>]) -> Column {
        let mut col = Column::new_for_type(PrimitiveType::Int64, true).unwrap();
        for v in values {
            let d = v.map_or(Datum::Null, Datum::Int64);
            col.append_datum(&d).unwrap();
        }
        col
    }

    /// Non-nullable Varchar column from strings.
    pub fn varchar(values: &[&str]) -> Column {
        let mut c = BinaryColumn::new();
        for v in values {
            c.push(v.as_bytes());
        }
        Column::Binary(c)
    }

    /// Nullable Varchar column from optional strings.
    pub fn nullable_varchar(values: &[Option<&str>]) -> Column {
        let mut col = Column::new_for_type(PrimitiveType::Varchar, true).unwrap();
        for v in values {
            let d = v.map_or(Datum::Null, |s| Datum::Binary(s.as_bytes().to_vec()));
            col.append_datum(&d).unwrap();
        }
        col
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_selective_copies_indexed_rows() {
        let src = Column::int64(&[10, 20, 30, 40]);
        let mut dst = src.new_empty_like().unwrap();
        dst.append_selective(&src, &[3, 1, 1]).unwrap();
        assert_eq!(dst.len(), 3);
        assert_eq!(dst.get(0), Datum::Int64(40));
        assert_eq!(dst.get(1), Datum::Int64(20));
        assert_eq!(dst.get(2), Datum::Int64(20));
    }

    #[test]
    fn nullable_mask_tracks_data_length() {
        let col = Column::nullable_int64(&[Some(1), None, Some(3)]);
        let Column::Nullable(n) = &col else {
            panic!("expected nullable column");
        };
        assert_eq!(n.null_mask().len(), n.data().len());
        assert!(col.is_null_at(1));
        assert!(!col.is_null_at(2));
    }

    #[test]
    fn nullable_accepts_non_nullable_source() {
        let src = Column::int64(&[7, 8]);
        let mut dst = Column::new_for_type(PrimitiveType::Int64, true).unwrap();
        dst.append_column(&src, 0, 2).unwrap();
        dst.append_nulls(1).unwrap();
        assert_eq!(dst.len(), 3);
        assert_eq!(dst.get(0), Datum::Int64(7));
        assert_eq!(dst.get(2), Datum::Null);
    }

    #[test]
    fn const_column_expands_on_append() {
        let src = Column::Const(ConstColumn::new(
            PrimitiveType::Int64,
            Datum::Int64(5),
            3,
        ));
        let mut dst = Column::new_for_type(PrimitiveType::Int64, false).unwrap();
        dst.append_selective(&src, &[0, 2]).unwrap();
        assert_eq!(dst.len(), 2);
        assert_eq!(dst.get(1), Datum::Int64(5));
    }

    #[test]
    fn equals_honors_null_safety() {
        let a = Column::nullable_int64(&[None, Some(1)]);
        let b = Column::nullable_int64(&[None, Some(1)]);
        assert!(!a.equals(0, &b, 0, false));
        assert!(a.equals(0, &b, 0, true));
        assert!(a.equals(1, &b, 1, false));
    }

    #[test]
    fn row_serialization_round_trips() {
        let src = Column::nullable_varchar(&[Some("ab"), None, Some("longer-value")]);
        let mut buf = Vec::new();
        for row in 0..3 {
            src.serialize_row_to(row, &mut buf).unwrap();
        }
        let mut dst = src.new_empty_like().unwrap();
        let mut cursor = buf.as_slice();
        for _ in 0..3 {
            dst.deserialize_row_from(&mut cursor).unwrap();
        }
        assert!(cursor.is_empty());
        assert_eq!(dst, src);
    }

    #[test]
    fn fnv_hash_distinguishes_null_from_zero() {
        let with_null = Column::nullable_int64(&[None]);
        let with_zero = Column::nullable_int64(&[Some(0)]);
        let mut h1 = vec![crate::hash::FNV_SEED];
        let mut h2 = vec![crate::hash::FNV_SEED];
        with_null.fnv_hash(&mut h1).unwrap();
        with_zero.fnv_hash(&mut h2).unwrap();
        assert_ne!(h1[0], h2[0]);
    }
}
