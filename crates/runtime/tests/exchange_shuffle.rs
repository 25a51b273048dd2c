//! Cross-fragment shuffle over the exchange transport.

mod support;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use basalt_chunk::hash::{fnv_hash_bytes, FNV_PRIME, FNV_SEED};
use basalt_chunk::{Chunk, Column, Datum, PrimitiveType};
use basalt_common::{
    EngineConfig, FragmentInstanceId, PlanNodeId, QueryId, SenderId, SlotId,
    TransmissionCompression,
};
use basalt_exec::plan::{
    DataStreamSinkDesc, DestinationDesc, ExchangeSenderCount, FragmentPlan, PartitionDesc,
    PlanNode, QueryOptions, ScanRangeDesc, ScanRangeEntry, SinkDesc,
};
use basalt_runtime::{FragmentContext, FragmentExecutor};

use support::*;

fn consumer_instance(lo: u64) -> FragmentInstanceId {
    FragmentInstanceId { hi: 99, lo }
}

/// One consumer fragment: exchange source -> result sink.
fn consumer_plan(exchange_node: i32, instance: FragmentInstanceId, senders: u32) -> FragmentPlan {
    FragmentPlan {
        query_id: QueryId { hi: 99, lo: 1 },
        instance_id: instance,
        degree: 1,
        root: PlanNode::Exchange {
            node_id: PlanNodeId(exchange_node),
            slots: vec![int_slot(0)],
        },
        sink: SinkDesc::Result,
        scan_ranges: vec![],
        exchange_senders: vec![ExchangeSenderCount {
            node_id: PlanNodeId(exchange_node),
            senders,
        }],
        options: QueryOptions::default(),
    }
}

/// One producer fragment: scan -> data-stream sink.
fn producer_plan(
    rows: u64,
    partition: PartitionDesc,
    destinations: Vec<DestinationDesc>,
    instance_lo: u64,
) -> FragmentPlan {
    FragmentPlan {
        query_id: QueryId { hi: 99, lo: 1 },
        instance_id: FragmentInstanceId {
            hi: 98,
            lo: instance_lo,
        },
        degree: 1,
        root: scan_node(1, "t", vec![int_slot(0)]),
        sink: SinkDesc::DataStream(DataStreamSinkDesc {
            dest_node_id: PlanNodeId(100),
            sender_id: SenderId(0),
            be_number: 1,
            partition,
            destinations,
        }),
        scan_ranges: vec![ScanRangeEntry {
            node_id: PlanNodeId(1),
            ranges: vec![ScanRangeDesc {
                tablet_id: 0,
                begin_row: 0,
                end_row: rows,
            }],
        }],
        exchange_senders: vec![],
        options: QueryOptions::default(),
    }
}

fn collect_ints(ctx: &Arc<FragmentContext>) -> Vec<i64> {
    collect_rows(ctx)
        .into_iter()
        .map(|row| match &row[0] {
            Datum::Int64(v) => *v,
            other => panic!("unexpected datum {other:?}"),
        })
        .collect()
}

fn expected_fnv_channel(key: i64, channels: u64) -> u64 {
    let h = (FNV_SEED ^ fnv_hash_bytes(FNV_SEED, &key.to_le_bytes())).wrapping_mul(FNV_PRIME);
    h % channels
}

#[test]
fn hash_shuffle_partitions_rows_across_channels() {
    // 4 channels, FNV over k=[10..=15]; every channel gets exactly the rows
    // whose FNV(k) mod 4 names it, and the union equals the input.
    let env = test_env(EngineConfig {
        chunk_size: 2,
        ..EngineConfig::default()
    });
    let addr = env
        .start_exchange_service("127.0.0.1:0".parse().unwrap())
        .unwrap();
    let keys = [10i64, 11, 12, 13, 14, 15];
    register_int64_table(&env, "t", SlotId(0), &keys);

    let executor = FragmentExecutor::new(Arc::clone(&env));
    let consumers: Vec<_> = (0..4)
        .map(|i| {
            executor
                .execute(&consumer_plan(100, consumer_instance(i), 1))
                .unwrap()
        })
        .collect();

    let destinations = (0..4)
        .map(|i| DestinationDesc {
            instance_id: consumer_instance(i),
            address: format!("http://{addr}"),
        })
        .collect();
    let producer = executor
        .execute(&producer_plan(
            6,
            PartitionDesc::Hash {
                exprs: vec![int_slot_ref(0)],
            },
            destinations,
            1,
        ))
        .unwrap();
    producer.wait_finished(Duration::from_secs(10)).unwrap();

    let mut union = Vec::new();
    for (channel, ctx) in consumers.iter().enumerate() {
        let got = collect_ints(ctx);
        for &k in &got {
            assert_eq!(
                expected_fnv_channel(k, 4),
                channel as u64,
                "row {k} landed on channel {channel}"
            );
        }
        union.extend(got);
    }
    union.sort_unstable();
    assert_eq!(union, keys.to_vec());
}

#[test]
fn broadcast_replicates_every_row_to_every_channel() {
    let env = test_env(EngineConfig {
        chunk_size: 3,
        ..EngineConfig::default()
    });
    let addr = env
        .start_exchange_service("127.0.0.1:0".parse().unwrap())
        .unwrap();
    let keys = [1i64, 2, 3, 4, 5];
    register_int64_table(&env, "t", SlotId(0), &keys);

    let executor = FragmentExecutor::new(Arc::clone(&env));
    let consumers: Vec<_> = (10..12)
        .map(|i| {
            executor
                .execute(&consumer_plan(100, consumer_instance(i), 1))
                .unwrap()
        })
        .collect();
    let destinations = (10..12)
        .map(|i| DestinationDesc {
            instance_id: consumer_instance(i),
            address: format!("http://{addr}"),
        })
        .collect();
    let producer = executor
        .execute(&producer_plan(5, PartitionDesc::Unpartitioned, destinations, 2))
        .unwrap();
    producer.wait_finished(Duration::from_secs(10)).unwrap();

    for ctx in &consumers {
        let mut got = collect_ints(ctx);
        got.sort_unstable();
        assert_eq!(got, keys.to_vec());
    }
}

#[test]
fn bucket_shuffle_routes_deterministically_across_runs() {
    let env = test_env(EngineConfig {
        chunk_size: 4,
        ..EngineConfig::default()
    });
    let addr = env
        .start_exchange_service("127.0.0.1:0".parse().unwrap())
        .unwrap();
    let keys: Vec<i64> = (0..32).collect();
    register_int64_table(&env, "t", SlotId(0), &keys);
    let executor = FragmentExecutor::new(Arc::clone(&env));

    let mut assignments: Vec<HashSet<i64>> = Vec::new();
    for run in 0..2 {
        let base = 20 + run * 4;
        let consumers: Vec<_> = (base..base + 3)
            .map(|i| {
                executor
                    .execute(&consumer_plan(100, consumer_instance(i), 1))
                    .unwrap()
            })
            .collect();
        let destinations = (base..base + 3)
            .map(|i| DestinationDesc {
                instance_id: consumer_instance(i),
                address: format!("http://{addr}"),
            })
            .collect();
        let producer = executor
            .execute(&producer_plan(
                32,
                PartitionDesc::Bucket {
                    exprs: vec![int_slot_ref(0)],
                },
                destinations,
                3 + run,
            ))
            .unwrap();
        producer.wait_finished(Duration::from_secs(10)).unwrap();

        let mut run_sets = Vec::new();
        let mut total = 0;
        for ctx in &consumers {
            let got = collect_ints(ctx);
            total += got.len();
            run_sets.push(got.into_iter().collect::<HashSet<i64>>());
        }
        assert_eq!(total, keys.len(), "bucket shuffle must conserve rows");
        if assignments.is_empty() {
            assignments = run_sets;
        } else {
            // CRC32(k) mod N is identical across fragment instances.
            assert_eq!(assignments, run_sets);
        }
    }
}

#[test]
fn random_shuffle_conserves_rows() {
    let env = test_env(EngineConfig {
        chunk_size: 2,
        ..EngineConfig::default()
    });
    let addr = env
        .start_exchange_service("127.0.0.1:0".parse().unwrap())
        .unwrap();
    let keys: Vec<i64> = (0..10).collect();
    register_int64_table(&env, "t", SlotId(0), &keys);
    let executor = FragmentExecutor::new(Arc::clone(&env));

    let consumers: Vec<_> = (40..42)
        .map(|i| {
            executor
                .execute(&consumer_plan(100, consumer_instance(i), 1))
                .unwrap()
        })
        .collect();
    let destinations = (40..42)
        .map(|i| DestinationDesc {
            instance_id: consumer_instance(i),
            address: format!("http://{addr}"),
        })
        .collect();
    let producer = executor
        .execute(&producer_plan(10, PartitionDesc::Random, destinations, 5))
        .unwrap();
    producer.wait_finished(Duration::from_secs(10)).unwrap();

    let mut union = Vec::new();
    for ctx in &consumers {
        union.extend(collect_ints(ctx));
    }
    union.sort_unstable();
    assert_eq!(union, keys);
}

#[test]
fn compressible_payloads_survive_the_wire_with_lz4() {
    // A long run of identical values compresses well; the receiver must
    // decode the identical chunk. Incompressible payloads take the
    // uncompressed path (ratio gate) and must also round-trip.
    let env = test_env(EngineConfig {
        chunk_size: 512,
        transmission_compression: TransmissionCompression::Lz4,
        ..EngineConfig::default()
    });
    let addr = env
        .start_exchange_service("127.0.0.1:0".parse().unwrap())
        .unwrap();
    let repetitive: Vec<i64> = std::iter::repeat(7).take(512).collect();
    register_int64_table(&env, "t", SlotId(0), &repetitive);

    let executor = FragmentExecutor::new(Arc::clone(&env));
    let consumer = executor
        .execute(&consumer_plan(100, consumer_instance(50), 1))
        .unwrap();
    let producer = executor
        .execute(&producer_plan(
            512,
            PartitionDesc::Unpartitioned,
            vec![DestinationDesc {
                instance_id: consumer_instance(50),
                address: format!("http://{addr}"),
            }],
            6,
        ))
        .unwrap();
    producer.wait_finished(Duration::from_secs(10)).unwrap();

    let got = collect_ints(&consumer);
    assert_eq!(got.len(), 512);
    assert!(got.iter().all(|&v| v == 7));
}

#[test]
fn producer_fails_when_no_receiver_is_registered() {
    let env = test_env(EngineConfig::default());
    let addr = env
        .start_exchange_service("127.0.0.1:0".parse().unwrap())
        .unwrap();
    register_int64_table(&env, "t", SlotId(0), &[1, 2, 3]);
    let executor = FragmentExecutor::new(Arc::clone(&env));
    let producer = executor
        .execute(&producer_plan(
            3,
            PartitionDesc::Unpartitioned,
            vec![DestinationDesc {
                instance_id: consumer_instance(77), // never registered
                address: format!("http://{addr}"),
            }],
            7,
        ))
        .unwrap();
    let err = producer.wait_finished(Duration::from_secs(10)).unwrap_err();
    assert!(
        matches!(err, basalt_common::EngineError::RemoteRpcFailed(_)),
        "unexpected error: {err}"
    );
}

#[test]
fn chunk_level_round_trip_matches_exactly() {
    // Mixed column shapes across the wire: nullable ints and strings.
    let env = test_env(EngineConfig::default());
    let addr = env
        .start_exchange_service("127.0.0.1:0".parse().unwrap())
        .unwrap();
    let chunk = Chunk::from_columns(vec![
        (
            SlotId(0),
            Column::nullable_int64(&[Some(1), None, Some(3), None]),
        ),
        (SlotId(1), Column::varchar(&["alpha", "", "gamma", "delta"])),
    ])
    .unwrap();
    register_table(&env, "t", chunk.clone());

    let executor = FragmentExecutor::new(Arc::clone(&env));
    let mut consumer_plan = consumer_plan(100, consumer_instance(60), 1);
    consumer_plan.root = PlanNode::Exchange {
        node_id: PlanNodeId(100),
        slots: vec![
            nullable_int_slot(0),
            basalt_exec::plan::SlotDesc {
                slot: SlotId(1),
                ptype: PrimitiveType::Varchar,
                nullable: false,
            },
        ],
    };
    let consumer = executor.execute(&consumer_plan).unwrap();
    let producer = executor
        .execute(&producer_plan(
            4,
            PartitionDesc::Unpartitioned,
            vec![DestinationDesc {
                instance_id: consumer_instance(60),
                address: format!("http://{addr}"),
            }],
            8,
        ))
        .unwrap();
    producer.wait_finished(Duration::from_secs(10)).unwrap();

    let rows = collect_rows(&consumer);
    assert_eq!(rows.len(), 4);
    assert_eq!(rows[0][0], Datum::Int64(1));
    assert_eq!(rows[1][0], Datum::Null);
    assert_eq!(rows[3][1], Datum::Binary(b"delta".to_vec()));
}
