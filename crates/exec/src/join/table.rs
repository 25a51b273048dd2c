//! Build-side hash table: bucket heads plus per-row chain links over the
//! accumulated build chunk.

use std::sync::atomic::{AtomicBool, Ordering};

use basalt_chunk::hash::FNV_SEED;
use basalt_chunk::{Chunk, Column};
use basalt_common::Result;

const CHAIN_END: u32 = u32::MAX;

/// Immutable after construction; probe drivers read it concurrently.
pub struct JoinHashTable {
    build_chunk: Chunk,
    key_cols: Vec<Column>,
    null_safe: Vec<bool>,
    hashes: Vec<u64>,
    first: Vec<u32>,
    next: Vec<u32>,
    bucket_mask: u64,
    matched: Vec<AtomicBool>,
}

impl JoinHashTable {
    /// Build the table over the concatenated build rows.
    ///
    /// `key_cols` are the evaluated build-key columns aligned with
    /// `build_chunk`. Rows with a null key only enter the table when
    /// `stores_nulls`; `dedup` drops rows whose full key already exists.
    pub fn build(
        build_chunk: Chunk,
        key_cols: Vec<Column>,
        null_safe: Vec<bool>,
        stores_nulls: bool,
        dedup: bool,
    ) -> Result<Self> {
        let rows = build_chunk.num_rows();
        let mut hashes = vec![FNV_SEED; rows];
        for col in &key_cols {
            col.fnv_hash(&mut hashes)?;
        }

        let buckets = (rows * 2).next_power_of_two().max(16);
        let bucket_mask = buckets as u64 - 1;
        let mut table = Self {
            build_chunk,
            key_cols,
            null_safe,
            hashes,
            first: vec![CHAIN_END; buckets],
            next: vec![CHAIN_END; rows],
            bucket_mask,
            matched: (0..rows).map(|_| AtomicBool::new(false)).collect(),
        };

        for row in 0..rows {
            if !stores_nulls && table.row_has_null_key(row) {
                continue;
            }
            let bucket = (table.hashes[row] & table.bucket_mask) as usize;
            if dedup && table.chain_contains_key(table.first[bucket], row) {
                continue;
            }
            table.next[row] = table.first[bucket];
            table.first[bucket] = row as u32;
        }
        Ok(table)
    }

    fn row_has_null_key(&self, row: usize) -> bool {
        self.key_cols.iter().any(|c| c.is_null_at(row))
    }

    fn chain_contains_key(&self, mut at: u32, row: usize) -> bool {
        while at != CHAIN_END {
            if self.hashes[at as usize] == self.hashes[row]
                && self.build_rows_equal(at as usize, row)
            {
                return true;
            }
            at = self.next[at as usize];
        }
        false
    }

    fn build_rows_equal(&self, a: usize, b: usize) -> bool {
        self.key_cols
            .iter()
            .zip(&self.null_safe)
            .all(|(c, &ns)| c.equals(a, c, b, ns))
    }

    /// Number of build rows (inserted or not).
    pub fn build_rows(&self) -> usize {
        self.build_chunk.num_rows()
    }

    /// The accumulated build chunk.
    pub fn build_chunk(&self) -> &Chunk {
        &self.build_chunk
    }

    /// Evaluated build-key column for equality condition `i`.
    pub fn key_column(&self, i: usize) -> &Column {
        &self.key_cols[i]
    }

    /// Iterate candidate build rows whose memoized hash equals `hash`.
    pub fn candidates(&self, hash: u64) -> CandidateIter<'_> {
        let bucket = (hash & self.bucket_mask) as usize;
        CandidateIter {
            table: self,
            hash,
            at: self.first[bucket],
        }
    }

    /// Full key equality between build row and probe row.
    pub fn keys_equal(&self, build_row: usize, probe_keys: &[Column], probe_row: usize) -> bool {
        self.key_cols
            .iter()
            .zip(probe_keys)
            .zip(&self.null_safe)
            .all(|((b, p), &ns)| b.equals(build_row, p, probe_row, ns))
    }

    /// Mark a build row matched; returns whether this call was the first.
    pub fn mark_matched(&self, row: usize) -> bool {
        !self.matched[row].swap(true, Ordering::AcqRel)
    }

    /// Build rows never marked matched, in row order.
    pub fn unmatched_rows(&self) -> Vec<u32> {
        self.matched
            .iter()
            .enumerate()
            .filter(|(_, m)| !m.load(Ordering::Acquire))
            .map(|(i, _)| i as u32)
            .collect()
    }
}

/// Iterator over one bucket chain, pre-filtered by memoized hash.
pub struct CandidateIter<'a> {
    table: &'a JoinHashTable,
    hash: u64,
    at: u32,
}

impl Iterator for CandidateIter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        while self.at != CHAIN_END {
            let row = self.at as usize;
            self.at = self.table.next[row];
            if self.table.hashes[row] == self.hash {
                return Some(row);
            }
        }
        None
    }
}
