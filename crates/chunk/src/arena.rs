//! Append-only byte arena backing variable-length hash keys.
//!
//! Keys are addressed by offset/length handles rather than pointers, so the
//! buffer may reallocate as it grows without invalidating anything. Every
//! table slot that references the arena is dropped before (or together with)
//! the arena, and the arena only ever grows between [`Arena::clear`] calls.

/// Handle to a byte range inside an [`Arena`], with the key's memoized hash.
///
/// The memoized hash lets equality checks reject non-matching keys before
/// touching arena memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaRef {
    /// Byte offset of the key.
    pub offset: u32,
    /// Key length in bytes.
    pub len: u32,
    /// Seeded table hash of the key bytes.
    pub hash: u64,
}

/// Overflow pad kept after the last key so wide compares stay in bounds.
pub const ARENA_SLICE_PAD: usize = 16;

/// Growable byte buffer owning hash-key bytes.
#[derive(Debug, Default)]
pub struct Arena {
    buf: Vec<u8>,
}

impl Arena {
    /// Create an empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an arena with reserved capacity.
    pub fn with_capacity(bytes: usize) -> Self {
        Self {
            buf: Vec::with_capacity(bytes + ARENA_SLICE_PAD),
        }
    }

    /// Copy `bytes` into the arena and return its handle.
    pub fn insert(&mut self, bytes: &[u8], hash: u64) -> ArenaRef {
        let offset = self.buf.len() as u32;
        self.buf.extend_from_slice(bytes);
        ArenaRef {
            offset,
            len: bytes.len() as u32,
            hash,
        }
    }

    /// Resolve a handle to its bytes.
    #[inline]
    pub fn get(&self, r: ArenaRef) -> &[u8] {
        &self.buf[r.offset as usize..(r.offset + r.len) as usize]
    }

    /// Bytes currently stored (excluding capacity slack).
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether the arena holds no keys.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Drop all keys. Callers must have dropped every table referencing the
    /// arena's handles first.
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::table_hash;

    #[test]
    fn handles_survive_reallocation() {
        let mut arena = Arena::new();
        let first = arena.insert(b"alpha", table_hash(b"alpha"));
        // Force growth well past the initial allocation.
        for i in 0..10_000u32 {
            let bytes = i.to_le_bytes();
            arena.insert(&bytes, table_hash(&bytes));
        }
        assert_eq!(arena.get(first), b"alpha");
        assert_eq!(first.hash, table_hash(b"alpha"));
    }
}
