//! Key-shape-specialized hash adaptors for aggregation and distinct sets.
//!
//! Five shapes, picked from the key columns' types: single fixed-width key
//! (plain and nullable), single string key (plain and nullable), and the
//! serialized composite form for two or more key columns. Every adaptor
//! memoizes the seeded key hash next to the stored key so equality checks
//! reject mismatches before touching key bytes, and keeps a results vector
//! in group-id order to materialize key columns on finalization.
//!
//! Nullable single-key shapes track the null group in a dedicated bit: null
//! rows never enter the hash table, and `has_null_key` reports whether any
//! null key was observed.

use hashbrown::HashTable;

use basalt_chunk::arena::{Arena, ArenaRef, ARENA_SLICE_PAD};
use basalt_chunk::hash::table_hash;
use basalt_chunk::{Column, PrimitiveType};
use basalt_common::{EngineError, Result};

/// Zero-extend one fixed-width value to raw 128-bit key bits.
fn fixed_bits(col: &Column, row: usize) -> Result<u128> {
    let Column::Fixed(f) = col else {
        return Err(EngineError::Internal(
            "number key adaptor over non-fixed column".to_string(),
        ));
    };
    let bytes = f.value_bytes(row);
    let mut buf = [0u8; 16];
    buf[..bytes.len()].copy_from_slice(bytes);
    Ok(u128::from_le_bytes(buf))
}

fn binary_value(col: &Column, row: usize) -> Result<&[u8]> {
    match col {
        Column::Binary(b) => Ok(b.value(row)),
        _ => Err(EngineError::Internal(
            "string key adaptor over non-binary column".to_string(),
        )),
    }
}

/// Split a nullable key column into its data column and null mask.
fn split_nullable(col: &Column) -> (&Column, Option<&[u8]>) {
    match col {
        Column::Nullable(n) => (n.data(), Some(n.null_mask())),
        other => (other, None),
    }
}

/// Expand constant key columns so adaptors only see plain vectors.
pub fn decay_const(col: &Column) -> Result<Column> {
    match col {
        Column::Const(c) => {
            let rows = col.len();
            let mut out = Column::new_for_type(col.ptype(), c.value().is_null())?;
            out.append_column(col, 0, rows)?;
            Ok(out)
        }
        other => Ok(other.clone()),
    }
}

/// Single non-nullable fixed-width key; direct emplace.
#[derive(Default)]
pub struct OneNumberKey {
    ptype: Option<PrimitiveType>,
    table: HashTable<(u64, u32)>,
    results: Vec<u128>,
}

/// Single nullable fixed-width key; one bit tracks the null group.
#[derive(Default)]
pub struct OneNullableNumberKey {
    ptype: Option<PrimitiveType>,
    table: HashTable<(u64, u32)>,
    results: Vec<Option<u128>>,
    null_group: Option<u32>,
}

/// Single binary key; key bytes live in the adaptor arena.
#[derive(Default)]
pub struct OneStringKey {
    table: HashTable<(ArenaRef, u32)>,
    arena: Arena,
    results: Vec<ArenaRef>,
}

/// Nullable binary key with the same null-group bit as the number variant.
#[derive(Default)]
pub struct OneNullableStringKey {
    table: HashTable<(ArenaRef, u32)>,
    arena: Arena,
    results: Vec<Option<ArenaRef>>,
    null_group: Option<u32>,
}

/// K >= 2 key columns serialized row-wise into a scratch buffer.
pub struct SerializedKey {
    shapes: Vec<(PrimitiveType, bool)>,
    table: HashTable<(ArenaRef, u32)>,
    arena: Arena,
    scratch: Vec<u8>,
    stride: usize,
    results: Vec<ArenaRef>,
}

/// Deserialize-by-row threshold for composite keys, in bytes.
const SERIALIZED_BY_ROW_THRESHOLD: usize = 64;

/// Key adaptor dispatch over the five shapes.
pub enum KeyAdaptor {
    /// Single non-nullable fixed-width key.
    OneNumber(OneNumberKey),
    /// Single nullable fixed-width key.
    OneNullableNumber(OneNullableNumberKey),
    /// Single non-nullable string key.
    OneString(OneStringKey),
    /// Single nullable string key.
    OneNullableString(OneNullableStringKey),
    /// Serialized composite key.
    Serialized(SerializedKey),
}

impl KeyAdaptor {
    /// Pick the adaptor shape for the key columns' `(type, nullable)` pairs.
    pub fn for_shapes(shapes: &[(PrimitiveType, bool)]) -> Result<Self> {
        if shapes.is_empty() {
            return Err(EngineError::Internal(
                "key adaptor needs at least one key column".to_string(),
            ));
        }
        for (ptype, _) in shapes {
            if matches!(ptype, PrimitiveType::Object(_)) {
                return Err(EngineError::InvalidArgument(
                    "object columns cannot be group keys".to_string(),
                ));
            }
        }
        if shapes.len() == 1 {
            let (ptype, nullable) = shapes[0];
            return Ok(match (ptype, nullable) {
                (PrimitiveType::Varchar, false) => KeyAdaptor::OneString(OneStringKey::default()),
                (PrimitiveType::Varchar, true) => {
                    KeyAdaptor::OneNullableString(OneNullableStringKey::default())
                }
                (_, false) => KeyAdaptor::OneNumber(OneNumberKey {
                    ptype: Some(ptype),
                    ..Default::default()
                }),
                (_, true) => KeyAdaptor::OneNullableNumber(OneNullableNumberKey {
                    ptype: Some(ptype),
                    ..Default::default()
                }),
            });
        }
        Ok(KeyAdaptor::Serialized(SerializedKey {
            shapes: shapes.to_vec(),
            table: HashTable::new(),
            arena: Arena::new(),
            scratch: Vec::new(),
            stride: 0,
            results: Vec::new(),
        }))
    }

    /// Assign one group id per row, inserting unseen keys.
    ///
    /// `new_mask[i]` (when requested) is set iff row `i` created its group.
    pub fn build_groups(
        &mut self,
        cols: &[Column],
        groups: &mut Vec<u32>,
        mut new_mask: Option<&mut Vec<bool>>,
    ) -> Result<()> {
        let rows = cols.first().map_or(0, Column::len);
        groups.clear();
        groups.resize(rows, 0);
        if let Some(mask) = new_mask.as_deref_mut() {
            mask.clear();
            mask.resize(rows, false);
        }
        match self {
            KeyAdaptor::OneNumber(k) => k.build(&cols[0], groups, new_mask),
            KeyAdaptor::OneNullableNumber(k) => k.build(&cols[0], groups, new_mask),
            KeyAdaptor::OneString(k) => k.build(&cols[0], groups, new_mask),
            KeyAdaptor::OneNullableString(k) => k.build(&cols[0], groups, new_mask),
            KeyAdaptor::Serialized(k) => k.build(cols, rows, groups, new_mask),
        }
    }

    /// Probe without inserting: `not_found[i]` marks rows whose key is absent;
    /// found rows receive their group id.
    pub fn probe_groups(
        &mut self,
        cols: &[Column],
        groups: &mut Vec<u32>,
        not_found: &mut Vec<bool>,
    ) -> Result<()> {
        let rows = cols.first().map_or(0, Column::len);
        groups.clear();
        groups.resize(rows, 0);
        not_found.clear();
        not_found.resize(rows, false);
        match self {
            KeyAdaptor::OneNumber(k) => k.probe(&cols[0], groups, not_found),
            KeyAdaptor::OneNullableNumber(k) => k.probe(&cols[0], groups, not_found),
            KeyAdaptor::OneString(k) => k.probe(&cols[0], groups, not_found),
            KeyAdaptor::OneNullableString(k) => k.probe(&cols[0], groups, not_found),
            KeyAdaptor::Serialized(k) => k.probe(cols, rows, groups, not_found),
        }
    }

    /// Number of distinct groups, null group included.
    pub fn group_count(&self) -> usize {
        match self {
            KeyAdaptor::OneNumber(k) => k.results.len(),
            KeyAdaptor::OneNullableNumber(k) => k.results.len(),
            KeyAdaptor::OneString(k) => k.results.len(),
            KeyAdaptor::OneNullableString(k) => k.results.len(),
            KeyAdaptor::Serialized(k) => k.results.len(),
        }
    }

    /// Whether a null key was observed (nullable single-key shapes only).
    pub fn has_null_key(&self) -> bool {
        match self {
            KeyAdaptor::OneNullableNumber(k) => k.null_group.is_some(),
            KeyAdaptor::OneNullableString(k) => k.null_group.is_some(),
            _ => false,
        }
    }

    /// Materialize key columns for groups `from..to` in group-id order.
    pub fn key_columns(&self, from: usize, to: usize) -> Result<Vec<Column>> {
        match self {
            KeyAdaptor::OneNumber(k) => {
                let ptype = k
                    .ptype
                    .ok_or_else(|| EngineError::Internal("untyped number key adaptor".to_string()))?;
                let width = ptype.fixed_width().unwrap_or(16);
                let mut col = Column::new_for_type(ptype, false)?;
                for bits in &k.results[from..to] {
                    push_bits(&mut col, *bits, width)?;
                }
                Ok(vec![col])
            }
            KeyAdaptor::OneNullableNumber(k) => {
                let ptype = k
                    .ptype
                    .ok_or_else(|| EngineError::Internal("untyped number key adaptor".to_string()))?;
                let width = ptype.fixed_width().unwrap_or(16);
                let mut col = Column::new_for_type(ptype, true)?;
                for bits in &k.results[from..to] {
                    match bits {
                        Some(bits) => push_bits(&mut col, *bits, width)?,
                        None => col.append_nulls(1)?,
                    }
                }
                Ok(vec![col])
            }
            KeyAdaptor::OneString(k) => {
                let mut col = Column::new_for_type(PrimitiveType::Varchar, false)?;
                for r in &k.results[from..to] {
                    col.append_datum(&basalt_chunk::Datum::Binary(k.arena.get(*r).to_vec()))?;
                }
                Ok(vec![col])
            }
            KeyAdaptor::OneNullableString(k) => {
                let mut col = Column::new_for_type(PrimitiveType::Varchar, true)?;
                for r in &k.results[from..to] {
                    match r {
                        Some(r) => col
                            .append_datum(&basalt_chunk::Datum::Binary(k.arena.get(*r).to_vec()))?,
                        None => col.append_nulls(1)?,
                    }
                }
                Ok(vec![col])
            }
            KeyAdaptor::Serialized(k) => k.materialize(from, to),
        }
    }

    /// Approximate bytes held by the adaptor, for memory accounting.
    pub fn mem_usage(&self) -> usize {
        match self {
            KeyAdaptor::OneNumber(k) => k.results.len() * 28,
            KeyAdaptor::OneNullableNumber(k) => k.results.len() * 32,
            KeyAdaptor::OneString(k) => k.arena.len() + k.results.len() * 36,
            KeyAdaptor::OneNullableString(k) => k.arena.len() + k.results.len() * 40,
            KeyAdaptor::Serialized(k) => k.arena.len() + k.scratch.len() + k.results.len() * 36,
        }
    }
}

fn push_bits(col: &mut Column, bits: u128, width: usize) -> Result<()> {
    let bytes = bits.to_le_bytes();
    match col {
        Column::Fixed(f) => f.push_bytes(&bytes[..width]),
        Column::Nullable(_) => {
            let ptype = col.ptype();
            let datum = basalt_chunk::column::decode_fixed(ptype, &bytes[..width]);
            col.append_datum(&datum)
        }
        _ => Err(EngineError::Internal("push_bits on non-fixed column".to_string())),
    }
}

impl OneNumberKey {
    fn build(
        &mut self,
        col: &Column,
        groups: &mut [u32],
        mut new_mask: Option<&mut Vec<bool>>,
    ) -> Result<()> {
        for row in 0..col.len() {
            let bits = fixed_bits(col, row)?;
            let h = table_hash(&bits.to_le_bytes());
            let results = &self.results;
            if let Some(&(_, idx)) = self
                .table
                .find(h, |&(hash, i)| hash == h && results[i as usize] == bits)
            {
                groups[row] = idx;
            } else {
                let idx = self.results.len() as u32;
                self.results.push(bits);
                self.table.insert_unique(h, (h, idx), |&(hash, _)| hash);
                groups[row] = idx;
                if let Some(mask) = new_mask.as_deref_mut() {
                    mask[row] = true;
                }
            }
        }
        Ok(())
    }

    fn probe(&self, col: &Column, groups: &mut [u32], not_found: &mut [bool]) -> Result<()> {
        for row in 0..col.len() {
            let bits = fixed_bits(col, row)?;
            let h = table_hash(&bits.to_le_bytes());
            let results = &self.results;
            match self
                .table
                .find(h, |&(hash, i)| hash == h && results[i as usize] == bits)
            {
                Some(&(_, idx)) => groups[row] = idx,
                None => not_found[row] = true,
            }
        }
        Ok(())
    }
}

impl OneNullableNumberKey {
    fn build(
        &mut self,
        col: &Column,
        groups: &mut [u32],
        mut new_mask: Option<&mut Vec<bool>>,
    ) -> Result<()> {
        let (data, nulls) = split_nullable(col);
        for row in 0..col.len() {
            if nulls.is_some_and(|m| m[row] != 0) {
                let idx = match self.null_group {
                    Some(idx) => idx,
                    None => {
                        let idx = self.results.len() as u32;
                        self.results.push(None);
                        self.null_group = Some(idx);
                        if let Some(mask) = new_mask.as_deref_mut() {
                            mask[row] = true;
                        }
                        idx
                    }
                };
                groups[row] = idx;
                continue;
            }
            let bits = fixed_bits(data, row)?;
            let h = table_hash(&bits.to_le_bytes());
            let results = &self.results;
            if let Some(&(_, idx)) = self
                .table
                .find(h, |&(hash, i)| hash == h && results[i as usize] == Some(bits))
            {
                groups[row] = idx;
            } else {
                let idx = self.results.len() as u32;
                self.results.push(Some(bits));
                self.table.insert_unique(h, (h, idx), |&(hash, _)| hash);
                groups[row] = idx;
                if let Some(mask) = new_mask.as_deref_mut() {
                    mask[row] = true;
                }
            }
        }
        Ok(())
    }

    fn probe(&self, col: &Column, groups: &mut [u32], not_found: &mut [bool]) -> Result<()> {
        let (data, nulls) = split_nullable(col);
        for row in 0..col.len() {
            if nulls.is_some_and(|m| m[row] != 0) {
                match self.null_group {
                    Some(idx) => groups[row] = idx,
                    None => not_found[row] = true,
                }
                continue;
            }
            let bits = fixed_bits(data, row)?;
            let h = table_hash(&bits.to_le_bytes());
            let results = &self.results;
            match self
                .table
                .find(h, |&(hash, i)| hash == h && results[i as usize] == Some(bits))
            {
                Some(&(_, idx)) => groups[row] = idx,
                None => not_found[row] = true,
            }
        }
        Ok(())
    }
}

fn find_arena_key(
    table: &HashTable<(ArenaRef, u32)>,
    arena: &Arena,
    h: u64,
    bytes: &[u8],
) -> Option<u32> {
    table
        .find(h, |&(r, _)| r.hash == h && arena.get(r) == bytes)
        .map(|&(_, idx)| idx)
}

impl OneStringKey {
    fn build(
        &mut self,
        col: &Column,
        groups: &mut [u32],
        mut new_mask: Option<&mut Vec<bool>>,
    ) -> Result<()> {
        for row in 0..col.len() {
            let bytes = binary_value(col, row)?;
            let h = table_hash(bytes);
            if let Some(idx) = find_arena_key(&self.table, &self.arena, h, bytes) {
                groups[row] = idx;
            } else {
                let r = self.arena.insert(bytes, h);
                let idx = self.results.len() as u32;
                self.results.push(r);
                self.table.insert_unique(h, (r, idx), |&(r, _)| r.hash);
                groups[row] = idx;
                if let Some(mask) = new_mask.as_deref_mut() {
                    mask[row] = true;
                }
            }
        }
        Ok(())
    }

    fn probe(&self, col: &Column, groups: &mut [u32], not_found: &mut [bool]) -> Result<()> {
        for row in 0..col.len() {
            let bytes = binary_value(col, row)?;
            let h = table_hash(bytes);
            match find_arena_key(&self.table, &self.arena, h, bytes) {
                Some(idx) => groups[row] = idx,
                None => not_found[row] = true,
            }
        }
        Ok(())
    }
}

impl OneNullableStringKey {
    fn build(
        &mut self,
        col: &Column,
        groups: &mut [u32],
        mut new_mask: Option<&mut Vec<bool>>,
    ) -> Result<()> {
        let (data, nulls) = split_nullable(col);
        for row in 0..col.len() {
            if nulls.is_some_and(|m| m[row] != 0) {
                let idx = match self.null_group {
                    Some(idx) => idx,
                    None => {
                        let idx = self.results.len() as u32;
                        self.results.push(None);
                        self.null_group = Some(idx);
                        if let Some(mask) = new_mask.as_deref_mut() {
                            mask[row] = true;
                        }
                        idx
                    }
                };
                groups[row] = idx;
                continue;
            }
            let bytes = binary_value(data, row)?;
            let h = table_hash(bytes);
            let found = self
                .table
                .find(h, |&(r, _)| r.hash == h && self.arena.get(r) == bytes)
                .map(|&(_, idx)| idx);
            if let Some(idx) = found {
                groups[row] = idx;
            } else {
                let r = self.arena.insert(bytes, h);
                let idx = self.results.len() as u32;
                self.results.push(Some(r));
                self.table.insert_unique(h, (r, idx), |&(r, _)| r.hash);
                groups[row] = idx;
                if let Some(mask) = new_mask.as_deref_mut() {
                    mask[row] = true;
                }
            }
        }
        Ok(())
    }

    fn probe(&self, col: &Column, groups: &mut [u32], not_found: &mut [bool]) -> Result<()> {
        let (data, nulls) = split_nullable(col);
        for row in 0..col.len() {
            if nulls.is_some_and(|m| m[row] != 0) {
                match self.null_group {
                    Some(idx) => groups[row] = idx,
                    None => not_found[row] = true,
                }
                continue;
            }
            let bytes = binary_value(data, row)?;
            let h = table_hash(bytes);
            match find_arena_key(&self.table, &self.arena, h, bytes) {
                Some(idx) => groups[row] = idx,
                None => not_found[row] = true,
            }
        }
        Ok(())
    }
}

impl SerializedKey {
    /// Serialize all rows into the stride-addressed scratch buffer, growing it
    /// (and the stride) when the observed max row size grows.
    fn fill_scratch(&mut self, cols: &[Column], rows: usize) -> Result<Vec<usize>> {
        let row_max: usize = cols
            .iter()
            .map(Column::max_one_row_serialized_size)
            .sum();
        if row_max > self.stride {
            self.stride = row_max;
        }
        let needed = self.stride * rows + ARENA_SLICE_PAD;
        if self.scratch.len() < needed {
            self.scratch.resize(needed, 0);
        }
        let mut lens = vec![0usize; rows];
        for col in cols {
            for (row, len) in lens.iter_mut().enumerate() {
                let start = row * self.stride + *len;
                *len += col.serialize_row_into(row, &mut self.scratch[start..])?;
            }
        }
        Ok(lens)
    }

    fn build(
        &mut self,
        cols: &[Column],
        rows: usize,
        groups: &mut [u32],
        mut new_mask: Option<&mut Vec<bool>>,
    ) -> Result<()> {
        let lens = self.fill_scratch(cols, rows)?;
        for row in 0..rows {
            let start = row * self.stride;
            let bytes = &self.scratch[start..start + lens[row]];
            let h = table_hash(bytes);
            if let Some(idx) = find_arena_key(&self.table, &self.arena, h, bytes) {
                groups[row] = idx;
            } else {
                let r = self.arena.insert(bytes, h);
                let idx = self.results.len() as u32;
                self.results.push(r);
                self.table.insert_unique(h, (r, idx), |&(r, _)| r.hash);
                groups[row] = idx;
                if let Some(mask) = new_mask.as_deref_mut() {
                    mask[row] = true;
                }
            }
        }
        Ok(())
    }

    fn probe(
        &mut self,
        cols: &[Column],
        rows: usize,
        groups: &mut [u32],
        not_found: &mut [bool],
    ) -> Result<()> {
        let lens = self.fill_scratch(cols, rows)?;
        for row in 0..rows {
            let start = row * self.stride;
            let bytes = &self.scratch[start..start + lens[row]];
            let h = table_hash(bytes);
            match find_arena_key(&self.table, &self.arena, h, bytes) {
                Some(idx) => groups[row] = idx,
                None => not_found[row] = true,
            }
        }
        Ok(())
    }

    /// Deserialize composite keys back into the original column shapes.
    ///
    /// Wide rows decode row-at-a-time for locality; narrow rows decode
    /// column-at-a-time.
    fn materialize(&self, from: usize, to: usize) -> Result<Vec<Column>> {
        let mut cols: Vec<Column> = self
            .shapes
            .iter()
            .map(|&(ptype, nullable)| Column::new_for_type(ptype, nullable))
            .collect::<Result<_>>()?;
        if self.stride > SERIALIZED_BY_ROW_THRESHOLD {
            for r in &self.results[from..to] {
                let mut cursor = self.arena.get(*r);
                for col in cols.iter_mut() {
                    col.deserialize_row_from(&mut cursor)?;
                }
            }
        } else {
            let mut cursors: Vec<&[u8]> = self.results[from..to]
                .iter()
                .map(|r| self.arena.get(*r))
                .collect();
            for col in cols.iter_mut() {
                for cursor in cursors.iter_mut() {
                    col.deserialize_row_from(cursor)?;
                }
            }
        }
        Ok(cols)
    }
}
