//! Row dispatch across exchange channels.
//!
//! Hash modes fold every partition expression into one per-row hash (FNV for
//! HASH, CRC32 for BUCKET so the channel choice matches the storage
//! distribution), map it onto a channel, then group rows per channel with a
//! prefix-sum permutation instead of sorting.

use basalt_chunk::hash::FNV_SEED;
use basalt_chunk::{Chunk, Column};
use basalt_common::{EngineError, Result};
use basalt_exec::keys::decay_const;
use basalt_exec::plan::{PartitionDesc, RangeDesc};

/// How one chunk maps onto the sink's channels.
pub enum ChannelDispatch {
    /// Identical serialized payload to every channel.
    Broadcast,
    /// Whole chunk to one channel (round-robin counter lives in the sink).
    RoundRobin,
    /// Per-row channel assignment.
    PerRow(Vec<u32>),
}

/// Compute the dispatch of `chunk` over `n_channels`.
pub fn dispatch_chunk(
    partition: &PartitionDesc,
    chunk: &Chunk,
    n_channels: usize,
) -> Result<ChannelDispatch> {
    let rows = chunk.num_rows();
    match partition {
        PartitionDesc::Unpartitioned => Ok(ChannelDispatch::Broadcast),
        PartitionDesc::Random => Ok(ChannelDispatch::RoundRobin),
        PartitionDesc::Hash { exprs } => {
            let mut hashes = vec![FNV_SEED; rows];
            for expr in exprs {
                let col = decay_const(&expr.evaluate(chunk)?)?;
                col.fnv_hash(&mut hashes)?;
            }
            Ok(ChannelDispatch::PerRow(
                hashes
                    .iter()
                    .map(|h| (h % n_channels as u64) as u32)
                    .collect(),
            ))
        }
        PartitionDesc::Bucket { exprs } => {
            let crc = crc32_rows(exprs, chunk, rows)?;
            Ok(ChannelDispatch::PerRow(
                crc.iter()
                    .map(|h| (*h as u64 % n_channels as u64) as u32)
                    .collect(),
            ))
        }
        PartitionDesc::Range {
            partition_expr,
            distribute_exprs,
            ranges,
        } => {
            let key_col = decay_const(&partition_expr.evaluate(chunk)?)?;
            let crc = crc32_rows(distribute_exprs, chunk, rows)?;
            let mut ids = Vec::with_capacity(rows);
            for row in 0..rows {
                let key = key_col.get(row).as_int().ok_or_else(|| {
                    EngineError::InvalidArgument(
                        "range partition key must be integral".to_string(),
                    )
                })? as i64;
                let range = lookup_range(ranges, key)?;
                let channel =
                    range.channel_base + (crc[row] % range.bucket_count.max(1));
                if channel as usize >= n_channels {
                    return Err(EngineError::InvalidArgument(format!(
                        "range partition routes to channel {channel} of {n_channels}"
                    )));
                }
                ids.push(channel);
            }
            Ok(ChannelDispatch::PerRow(ids))
        }
    }
}

fn crc32_rows(exprs: &[basalt_exec::expr::Expr], chunk: &Chunk, rows: usize) -> Result<Vec<u32>> {
    let mut hashes = vec![0u32; rows];
    for expr in exprs {
        let col: Column = decay_const(&expr.evaluate(chunk)?)?;
        col.crc32_hash(&mut hashes)?;
    }
    Ok(hashes)
}

/// Binary search over the sorted range table (upper bounds exclusive).
fn lookup_range(ranges: &[RangeDesc], key: i64) -> Result<&RangeDesc> {
    let idx = ranges.partition_point(|r| r.upper_bound <= key);
    ranges.get(idx).ok_or_else(|| {
        EngineError::InvalidArgument(format!("range partition key {key} beyond the last range"))
    })
}

/// Group rows by channel without sorting.
///
/// Returns the row permutation plus per-channel start offsets: channel `c`
/// owns `perm[starts[c]..starts[c + 1]]`, in input order.
pub fn channel_row_permutation(channel_ids: &[u32], n_channels: usize) -> (Vec<u32>, Vec<u32>) {
    let mut counts = vec![0u32; n_channels];
    for &c in channel_ids {
        counts[c as usize] += 1;
    }
    let mut starts = vec![0u32; n_channels + 1];
    for c in 0..n_channels {
        starts[c + 1] = starts[c] + counts[c];
    }
    let mut cursor = starts[..n_channels].to_vec();
    let mut perm = vec![0u32; channel_ids.len()];
    for (row, &c) in channel_ids.iter().enumerate() {
        perm[cursor[c as usize] as usize] = row as u32;
        cursor[c as usize] += 1;
    }
    (perm, starts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use basalt_chunk::hash::fnv_hash_bytes;
    use basalt_chunk::PrimitiveType;
    use basalt_common::SlotId;
    use basalt_exec::expr::Expr;

    fn chunk(keys: &[i64]) -> Chunk {
        Chunk::from_columns(vec![(SlotId(0), Column::int64(keys))]).unwrap()
    }

    fn hash_desc() -> PartitionDesc {
        PartitionDesc::Hash {
            exprs: vec![Expr::slot(SlotId(0), PrimitiveType::Int64, false)],
        }
    }

    #[test]
    fn hash_dispatch_matches_fnv_mod_channels() {
        let keys = [10i64, 11, 12, 13, 14, 15];
        let ChannelDispatch::PerRow(ids) = dispatch_chunk(&hash_desc(), &chunk(&keys), 4).unwrap()
        else {
            panic!("expected per-row dispatch");
        };
        for (row, key) in keys.iter().enumerate() {
            let h = (fnv_hash_bytes(FNV_SEED, &key.to_le_bytes()) ^ FNV_SEED)
                .wrapping_mul(basalt_chunk::hash::FNV_PRIME);
            assert_eq!(ids[row], (h % 4) as u32, "row {row}");
        }
    }

    #[test]
    fn bucket_dispatch_is_stable_across_instances() {
        let desc = PartitionDesc::Bucket {
            exprs: vec![Expr::slot(SlotId(0), PrimitiveType::Int64, false)],
        };
        let a = dispatch_chunk(&desc, &chunk(&[1, 2, 3, 4, 5]), 3).unwrap();
        let b = dispatch_chunk(&desc, &chunk(&[1, 2, 3, 4, 5]), 3).unwrap();
        let (ChannelDispatch::PerRow(a), ChannelDispatch::PerRow(b)) = (a, b) else {
            panic!("expected per-row dispatch");
        };
        assert_eq!(a, b);
    }

    #[test]
    fn permutation_groups_rows_preserving_order() {
        let ids = vec![2u32, 0, 2, 1, 0, 2];
        let (perm, starts) = channel_row_permutation(&ids, 3);
        assert_eq!(starts, vec![0, 2, 3, 6]);
        assert_eq!(&perm[0..2], &[1, 4]); // channel 0 rows, input order
        assert_eq!(&perm[2..3], &[3]); // channel 1
        assert_eq!(&perm[3..6], &[0, 2, 5]); // channel 2
    }

    #[test]
    fn range_dispatch_routes_by_bound_then_crc() {
        let desc = PartitionDesc::Range {
            partition_expr: Expr::slot(SlotId(0), PrimitiveType::Int64, false),
            distribute_exprs: vec![Expr::slot(SlotId(0), PrimitiveType::Int64, false)],
            ranges: vec![
                RangeDesc {
                    upper_bound: 10,
                    bucket_count: 2,
                    channel_base: 0,
                },
                RangeDesc {
                    upper_bound: 100,
                    bucket_count: 2,
                    channel_base: 2,
                },
            ],
        };
        let ChannelDispatch::PerRow(ids) =
            dispatch_chunk(&desc, &chunk(&[1, 5, 50, 99]), 4).unwrap()
        else {
            panic!("expected per-row dispatch");
        };
        assert!(ids[0] < 2 && ids[1] < 2);
        assert!(ids[2] >= 2 && ids[3] >= 2);

        let err = dispatch_chunk(&desc, &chunk(&[100]), 4);
        assert!(err.is_err());
    }
}
