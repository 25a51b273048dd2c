//! Approximate aggregate objects carried by object columns.

use basalt_common::{EngineError, Result};

/// Dense HyperLogLog sketch with bias-corrected estimation.
///
/// Precision is clamped to `[4, 16]`; the default (14) keeps the relative
/// error near 0.8% at 16KB per sketch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HllSketch {
    p: u8,
    registers: Vec<u8>,
}

/// Default HLL precision used by ndv/approx_count_distinct.
pub const HLL_DEFAULT_PRECISION: u8 = 14;

impl HllSketch {
    /// Create an empty sketch with the given precision.
    pub fn new(p: u8) -> Self {
        let precision = p.clamp(4, 16);
        let m = 1usize << precision;
        Self {
            p: precision,
            registers: vec![0; m],
        }
    }

    /// Record one hashed value.
    pub fn insert_hash(&mut self, hash: u64) {
        let mask = (1_u64 << self.p) - 1;
        let idx = (hash & mask) as usize;
        let w = hash >> self.p;
        let max_rank = (64 - self.p) + 1;
        let rank = if w == 0 {
            max_rank
        } else {
            (w.trailing_zeros() as u8 + 1).min(max_rank)
        };
        if rank > self.registers[idx] {
            self.registers[idx] = rank;
        }
    }

    /// Merge another sketch of the same precision into this one.
    pub fn merge(&mut self, other: &Self) -> Result<()> {
        if self.p != other.p || self.registers.len() != other.registers.len() {
            return Err(EngineError::Internal(format!(
                "incompatible hll precision: {} vs {}",
                self.p, other.p
            )));
        }
        for (a, b) in self.registers.iter_mut().zip(other.registers.iter()) {
            *a = (*a).max(*b);
        }
        Ok(())
    }

    /// Cardinality estimate with the linear-counting fallback for small sets.
    pub fn estimate(&self) -> f64 {
        let m = self.registers.len() as f64;
        let alpha = match self.registers.len() {
            16 => 0.673,
            32 => 0.697,
            64 => 0.709,
            _ => 0.7213 / (1.0 + 1.079 / m),
        };
        let z = self
            .registers
            .iter()
            .map(|r| 2_f64.powi(-(*r as i32)))
            .sum::<f64>();
        let raw = alpha * m * m / z;
        let zeros = self.registers.iter().filter(|r| **r == 0).count() as f64;
        if raw <= 2.5 * m && zeros > 0.0 {
            m * (m / zeros).ln()
        } else {
            raw
        }
    }

    /// Serialize to precision byte + raw registers.
    pub fn serialize_to(&self, out: &mut Vec<u8>) {
        out.push(self.p);
        out.extend_from_slice(&self.registers);
    }

    /// Decode a sketch written by [`HllSketch::serialize_to`].
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let (&p, registers) = bytes
            .split_first()
            .ok_or_else(|| EngineError::InvalidArgument("empty hll payload".to_string()))?;
        let expected = 1usize << p.clamp(4, 16);
        if registers.len() != expected {
            return Err(EngineError::InvalidArgument(format!(
                "hll payload length {} does not match precision {p}",
                registers.len()
            )));
        }
        Ok(Self {
            p,
            registers: registers.to_vec(),
        })
    }
}

impl Default for HllSketch {
    fn default() -> Self {
        Self::new(HLL_DEFAULT_PRECISION)
    }
}

/// Streaming equal-weight histogram for approximate percentiles.
///
/// Ben-Haim/Tom-Tov style: values become unit-weight centroids; when the bin
/// budget is exceeded the two closest centroids merge. Deterministic for a
/// given insertion order and mergeable across partial states.
#[derive(Debug, Clone, PartialEq)]
pub struct PercentileSketch {
    max_bins: usize,
    /// (centroid, count), kept sorted by centroid.
    bins: Vec<(f64, u64)>,
}

/// Default bin budget for percentile_approx.
pub const PERCENTILE_DEFAULT_BINS: usize = 100;

impl PercentileSketch {
    /// Create an empty sketch with the given bin budget.
    pub fn new(max_bins: usize) -> Self {
        Self {
            max_bins: max_bins.max(2),
            bins: Vec::new(),
        }
    }

    /// Record one value.
    pub fn insert(&mut self, value: f64) {
        let pos = self
            .bins
            .partition_point(|(c, _)| c.total_cmp(&value) == std::cmp::Ordering::Less);
        if let Some((c, n)) = self.bins.get_mut(pos) {
            if c.total_cmp(&value) == std::cmp::Ordering::Equal {
                *n += 1;
                return;
            }
        }
        self.bins.insert(pos, (value, 1));
        self.shrink();
    }

    /// Merge another sketch into this one.
    pub fn merge(&mut self, other: &Self) {
        for &(c, n) in &other.bins {
            let pos = self
                .bins
                .partition_point(|(b, _)| b.total_cmp(&c) == std::cmp::Ordering::Less);
            match self.bins.get_mut(pos) {
                Some((b, m)) if b.total_cmp(&c) == std::cmp::Ordering::Equal => *m += n,
                _ => self.bins.insert(pos, (c, n)),
            }
        }
        self.shrink();
    }

    fn shrink(&mut self) {
        while self.bins.len() > self.max_bins {
            let mut best = 0;
            let mut best_gap = f64::INFINITY;
            for i in 0..self.bins.len() - 1 {
                let gap = self.bins[i + 1].0 - self.bins[i].0;
                if gap < best_gap {
                    best_gap = gap;
                    best = i;
                }
            }
            let (c1, n1) = self.bins[best];
            let (c2, n2) = self.bins[best + 1];
            let total = n1 + n2;
            self.bins[best] = ((c1 * n1 as f64 + c2 * n2 as f64) / total as f64, total);
            self.bins.remove(best + 1);
        }
    }

    /// Total recorded count.
    pub fn count(&self) -> u64 {
        self.bins.iter().map(|(_, n)| n).sum()
    }

    /// Approximate value at quantile `q` in `[0, 1]`; `None` when empty.
    pub fn quantile(&self, q: f64) -> Option<f64> {
        let total = self.count();
        if total == 0 {
            return None;
        }
        let q = q.clamp(0.0, 1.0);
        let target = q * (total as f64 - 1.0);
        let mut seen = 0.0;
        for (i, &(c, n)) in self.bins.iter().enumerate() {
            let next = seen + n as f64;
            if target < next || i == self.bins.len() - 1 {
                // Interpolate toward the next centroid within the bin.
                if target <= seen || i == self.bins.len() - 1 {
                    return Some(c);
                }
                let next_c = self.bins[i + 1].0;
                let frac = (target - seen) / n as f64;
                return Some(c + (next_c - c) * frac.min(1.0));
            }
            seen = next;
        }
        self.bins.last().map(|(c, _)| *c)
    }

    /// Serialize to max_bins + bin list.
    pub fn serialize_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.max_bins as u32).to_le_bytes());
        out.extend_from_slice(&(self.bins.len() as u32).to_le_bytes());
        for &(c, n) in &self.bins {
            out.extend_from_slice(&c.to_le_bytes());
            out.extend_from_slice(&n.to_le_bytes());
        }
    }

    /// Decode a sketch written by [`PercentileSketch::serialize_to`].
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 8 {
            return Err(EngineError::InvalidArgument(
                "truncated percentile payload".to_string(),
            ));
        }
        let max_bins = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
        let n = u32::from_le_bytes(bytes[4..8].try_into().unwrap()) as usize;
        let need = 8 + n * 16;
        if bytes.len() < need {
            return Err(EngineError::InvalidArgument(
                "truncated percentile payload".to_string(),
            ));
        }
        let mut bins = Vec::with_capacity(n);
        for i in 0..n {
            let off = 8 + i * 16;
            let c = f64::from_le_bytes(bytes[off..off + 8].try_into().unwrap());
            let cnt = u64::from_le_bytes(bytes[off + 8..off + 16].try_into().unwrap());
            bins.push((c, cnt));
        }
        Ok(Self { max_bins, bins })
    }
}

impl Default for PercentileSketch {
    fn default() -> Self {
        Self::new(PERCENTILE_DEFAULT_BINS)
    }
}
