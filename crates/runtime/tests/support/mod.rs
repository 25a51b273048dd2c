//! Shared helpers for fragment execution tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use basalt_chunk::{Chunk, Column, Datum, PrimitiveType};
use basalt_common::{EngineConfig, FragmentInstanceId, PlanNodeId, QueryId, SlotId};
use basalt_exec::expr::Expr;
use basalt_exec::plan::{
    FragmentPlan, PlanNode, QueryOptions, ScanRangeDesc, ScanRangeEntry, SinkDesc, SlotDesc,
};
use basalt_exec::source::MemoryTable;
use basalt_runtime::{ExecEnv, FragmentContext};

pub fn test_env(config: EngineConfig) -> Arc<ExecEnv> {
    ExecEnv::new(config).expect("build exec env")
}

pub fn small_chunk_env() -> Arc<ExecEnv> {
    test_env(EngineConfig {
        chunk_size: 4,
        driver_worker_threads: 3,
        ..EngineConfig::default()
    })
}

pub fn register_int64_table(env: &Arc<ExecEnv>, name: &str, slot: SlotId, values: &[i64]) {
    let chunk = Chunk::from_columns(vec![(slot, Column::int64(values))]).unwrap();
    env.register_table(name, Arc::new(MemoryTable::new().with_tablet(0, chunk)));
}

pub fn register_table(env: &Arc<ExecEnv>, name: &str, chunk: Chunk) {
    env.register_table(name, Arc::new(MemoryTable::new().with_tablet(0, chunk)));
}

pub fn scan_node(node: i32, table: &str, slots: Vec<SlotDesc>) -> PlanNode {
    PlanNode::Scan {
        node_id: PlanNodeId(node),
        table: table.to_string(),
        slots,
        conjuncts: vec![],
    }
}

pub fn int_slot(slot: i32) -> SlotDesc {
    SlotDesc {
        slot: SlotId(slot),
        ptype: PrimitiveType::Int64,
        nullable: false,
    }
}

pub fn nullable_int_slot(slot: i32) -> SlotDesc {
    SlotDesc {
        slot: SlotId(slot),
        ptype: PrimitiveType::Int64,
        nullable: true,
    }
}

pub fn varchar_slot(slot: i32) -> SlotDesc {
    SlotDesc {
        slot: SlotId(slot),
        ptype: PrimitiveType::Varchar,
        nullable: false,
    }
}

pub fn int_slot_ref(slot: i32) -> Expr {
    Expr::slot(SlotId(slot), PrimitiveType::Int64, false)
}

pub fn result_plan(
    root: PlanNode,
    scan_node_id: i32,
    rows: u64,
    instance_lo: u64,
) -> FragmentPlan {
    FragmentPlan {
        query_id: QueryId { hi: 7, lo: 7 },
        instance_id: FragmentInstanceId {
            hi: 7,
            lo: instance_lo,
        },
        degree: 2,
        root,
        sink: SinkDesc::Result,
        scan_ranges: vec![ScanRangeEntry {
            node_id: PlanNodeId(scan_node_id),
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

/// Drain every result chunk and flatten rows into datum vectors.
pub fn collect_rows(ctx: &Arc<FragmentContext>) -> Vec<Vec<Datum>> {
    let handle = ctx.result_handle().expect("result fragment").clone();
    let mut rows = Vec::new();
    while let Some(chunk) = handle.pull(Duration::from_secs(5)) {
        for row in 0..chunk.num_rows() {
            rows.push(
                (0..chunk.num_columns())
                    .map(|c| chunk.column(c).get(row))
                    .collect(),
            );
        }
    }
    ctx.wait_finished(Duration::from_secs(5)).expect("fragment status");
    rows
}

pub fn sorted_rows(mut rows: Vec<Vec<Datum>>) -> Vec<Vec<Datum>> {
    rows.sort_by(|a, b| format!("{a:?}").cmp(&format!("{b:?}")));
    rows
}
