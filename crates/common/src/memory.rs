//! Hierarchical memory accounting for fragments and operators.
//!
//! Every sizable allocation in the runtime is charged to a [`MemTracker`].
//! Trackers form a chain (operator → fragment → query → process pool);
//! consumption propagates to every ancestor, and the first ancestor whose
//! limit would be exceeded rejects the charge with a breakdown of its
//! heaviest children. A failed charge cancels the owning fragment.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{EngineError, Result};

/// One node in the tracker hierarchy.
#[derive(Debug)]
pub struct MemTracker {
    label: String,
    /// Byte limit; `i64::MAX` means unlimited.
    limit: i64,
    consumed: AtomicI64,
    peak: AtomicI64,
    parent: Option<Arc<MemTracker>>,
    children: Mutex<Vec<Arc<MemTracker>>>,
}

impl MemTracker {
    /// Create a root tracker (no parent).
    pub fn root(label: impl Into<String>, limit_bytes: Option<usize>) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            limit: limit_bytes.map_or(i64::MAX, |l| l as i64),
            consumed: AtomicI64::new(0),
            peak: AtomicI64::new(0),
            parent: None,
            children: Mutex::new(Vec::new()),
        })
    }

    /// Create a child tracker under `parent`.
    pub fn child(
        parent: &Arc<MemTracker>,
        label: impl Into<String>,
        limit_bytes: Option<usize>,
    ) -> Arc<Self> {
        let tracker = Arc::new(Self {
            label: label.into(),
            limit: limit_bytes.map_or(i64::MAX, |l| l as i64),
            consumed: AtomicI64::new(0),
            peak: AtomicI64::new(0),
            parent: Some(Arc::clone(parent)),
            children: Mutex::new(Vec::new()),
        });
        parent.children.lock().push(Arc::clone(&tracker));
        tracker
    }

    /// Tracker label for diagnostics.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Currently consumed bytes at this node.
    pub fn consumed(&self) -> i64 {
        self.consumed.load(Ordering::Acquire)
    }

    /// Peak consumed bytes observed at this node.
    pub fn peak(&self) -> i64 {
        self.peak.load(Ordering::Acquire)
    }

    /// Charge `bytes` to this tracker and all ancestors, failing if any limit
    /// would be exceeded. On failure nothing remains charged.
    pub fn try_consume(self: &Arc<Self>, bytes: usize) -> Result<()> {
        if bytes == 0 {
            return Ok(());
        }
        let bytes = bytes as i64;
        let mut node = Some(self.clone());
        let mut charged: Vec<Arc<MemTracker>> = Vec::new();
        while let Some(t) = node {
            let next = t.consumed.fetch_add(bytes, Ordering::AcqRel) + bytes;
            if next > t.limit {
                t.consumed.fetch_sub(bytes, Ordering::AcqRel);
                for c in charged {
                    c.consumed.fetch_sub(bytes, Ordering::AcqRel);
                }
                return Err(EngineError::MemoryLimitExceeded(t.limit_message(bytes)));
            }
            t.peak.fetch_max(next, Ordering::AcqRel);
            node = t.parent.clone();
            charged.push(t);
        }
        Ok(())
    }

    /// Charge without a limit check. Used for small bookkeeping deltas where a
    /// later `try_consume` covers the real growth.
    pub fn consume(&self, bytes: usize) {
        let bytes = bytes as i64;
        let mut node = Some(self);
        while let Some(t) = node {
            let next = t.consumed.fetch_add(bytes, Ordering::AcqRel) + bytes;
            t.peak.fetch_max(next, Ordering::AcqRel);
            node = t.parent.as_deref();
        }
    }

    /// Release previously charged bytes from this tracker and all ancestors.
    pub fn release(&self, bytes: usize) {
        let bytes = bytes as i64;
        let mut node = Some(self);
        while let Some(t) = node {
            t.consumed.fetch_sub(bytes, Ordering::AcqRel);
            node = t.parent.as_deref();
        }
    }

    fn limit_message(&self, requested: i64) -> String {
        let mut children: Vec<(String, i64)> = self
            .children
            .lock()
            .iter()
            .map(|c| (c.label.clone(), c.consumed()))
            .collect();
        children.sort_by_key(|(_, c)| std::cmp::Reverse(*c));
        children.truncate(5);
        let mut msg = format!(
            "tracker '{}' limit {} consumed {} requested {}",
            self.label,
            self.limit,
            self.consumed(),
            requested
        );
        if !children.is_empty() {
            msg.push_str("; heaviest children: ");
            for (i, (label, consumed)) in children.iter().enumerate() {
                if i > 0 {
                    msg.push_str(", ");
                }
                msg.push_str(&format!("{label}={consumed}"));
            }
        }
        msg
    }
}

/// RAII charge that releases its bytes on drop.
#[derive(Debug)]
pub struct TrackedBytes {
    tracker: Arc<MemTracker>,
    bytes: usize,
}

impl TrackedBytes {
    /// Charge `bytes` against `tracker`, returning a guard that releases on drop.
    pub fn try_new(tracker: &Arc<MemTracker>, bytes: usize) -> Result<Self> {
        tracker.try_consume(bytes)?;
        Ok(Self {
            tracker: Arc::clone(tracker),
            bytes,
        })
    }

    /// Grow or shrink the charge to `new_bytes`.
    pub fn resize(&mut self, new_bytes: usize) -> Result<()> {
        if new_bytes > self.bytes {
            self.tracker.try_consume(new_bytes - self.bytes)?;
        } else {
            self.tracker.release(self.bytes - new_bytes);
        }
        self.bytes = new_bytes;
        Ok(())
    }

    /// Bytes currently held by the guard.
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

impl Drop for TrackedBytes {
    fn drop(&mut self) {
        if self.bytes > 0 {
            self.tracker.release(self.bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consumption_propagates_to_ancestors() {
        let pool = MemTracker::root("pool", None);
        let query = MemTracker::child(&pool, "query", Some(1000));
        let fragment = MemTracker::child(&query, "fragment", Some(800));

        fragment.try_consume(500).unwrap();
        assert_eq!(fragment.consumed(), 500);
        assert_eq!(query.consumed(), 500);
        assert_eq!(pool.consumed(), 500);

        fragment.release(500);
        assert_eq!(pool.consumed(), 0);
    }

    #[test]
    fn limit_breach_rolls_back_and_names_children() {
        let query = MemTracker::root("query", Some(1000));
        let frag_a = MemTracker::child(&query, "fragment-a", None);
        let frag_b = MemTracker::child(&query, "fragment-b", None);

        frag_a.try_consume(700).unwrap();
        let err = frag_b.try_consume(400).unwrap_err();
        match err {
            EngineError::MemoryLimitExceeded(msg) => {
                assert!(msg.contains("fragment-a=700"), "message: {msg}");
            }
            other => panic!("unexpected error: {other}"),
        }
        // Failed charge must leave nothing behind.
        assert_eq!(frag_b.consumed(), 0);
        assert_eq!(query.consumed(), 700);
    }

    #[test]
    fn tracked_bytes_release_on_drop() {
        let root = MemTracker::root("root", Some(100));
        {
            let mut guard = TrackedBytes::try_new(&root, 60).unwrap();
            guard.resize(80).unwrap();
            assert!(TrackedBytes::try_new(&root, 40).is_err());
        }
        assert_eq!(root.consumed(), 0);
    }
}
