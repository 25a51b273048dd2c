//! End-to-end fragment execution over in-memory tables.

mod support;

use std::sync::Arc;
use std::time::Duration;

use basalt_chunk::{Chunk, Column, Datum, PrimitiveType};
use basalt_common::{EngineError, PlanNodeId, SlotId};
use basalt_exec::agg::AggCallDesc;
use basalt_exec::expr::{CmpOp, Expr};
use basalt_exec::join::{EquiCond, JoinType, RuntimeFilterDesc};
use basalt_exec::plan::{AggNodeMode, GroupByItem, PlanNode, ProjectItem};
use basalt_exec::window::{WindowCallDesc, WindowFuncKind};
use basalt_runtime::FragmentExecutor;

use support::*;

fn sum_call(arg_slot: i32, out_slot: i32) -> AggCallDesc {
    AggCallDesc {
        name: "sum".to_string(),
        args: vec![int_slot_ref(arg_slot)],
        arg_type: Some(PrimitiveType::Int64),
        arg_nullable: false,
        return_type: PrimitiveType::Int64,
        return_nullable: false,
        output_slot: SlotId(out_slot),
    }
}

#[test]
fn group_by_sum_over_single_key() {
    // sum(x) group by x over [1,1,2,3,3,3] -> {1:2, 2:2, 3:9}.
    let env = small_chunk_env();
    register_int64_table(&env, "t", SlotId(0), &[1, 1, 2, 3, 3, 3]);
    let plan = result_plan(
        PlanNode::Aggregate {
            node_id: PlanNodeId(2),
            child: Box::new(scan_node(1, "t", vec![int_slot(0)])),
            mode: AggNodeMode::Complete,
            group_by: vec![GroupByItem {
                slot: SlotId(10),
                expr: int_slot_ref(0),
            }],
            distinct: vec![],
            calls: vec![sum_call(0, 11)],
        },
        1,
        6,
        1,
    );
    let ctx = FragmentExecutor::new(env).execute(&plan).unwrap();
    let rows = sorted_rows(collect_rows(&ctx));
    assert_eq!(
        rows,
        vec![
            vec![Datum::Int64(1), Datum::Int64(2)],
            vec![Datum::Int64(2), Datum::Int64(2)],
            vec![Datum::Int64(3), Datum::Int64(9)],
        ]
    );
}

#[test]
fn group_by_nullable_key_counts_null_group() {
    // count(v) group by x over x=[1,null,null,2] -> {1:1, null:2, 2:1}.
    let env = small_chunk_env();
    register_table(
        &env,
        "t",
        Chunk::from_columns(vec![
            (
                SlotId(0),
                Column::nullable_int64(&[Some(1), None, None, Some(2)]),
            ),
            (SlotId(1), Column::int64(&[10, 20, 30, 40])),
        ])
        .unwrap(),
    );
    let plan = result_plan(
        PlanNode::Aggregate {
            node_id: PlanNodeId(2),
            child: Box::new(scan_node(
                1,
                "t",
                vec![nullable_int_slot(0), int_slot(1)],
            )),
            mode: AggNodeMode::Complete,
            group_by: vec![GroupByItem {
                slot: SlotId(10),
                expr: Expr::slot(SlotId(0), PrimitiveType::Int64, true),
            }],
            distinct: vec![],
            calls: vec![AggCallDesc {
                name: "count".to_string(),
                args: vec![int_slot_ref(1)],
                arg_type: Some(PrimitiveType::Int64),
                arg_nullable: false,
                return_type: PrimitiveType::Int64,
                return_nullable: false,
                output_slot: SlotId(11),
            }],
        },
        1,
        4,
        2,
    );
    let ctx = FragmentExecutor::new(env).execute(&plan).unwrap();
    let rows = sorted_rows(collect_rows(&ctx));
    assert_eq!(
        rows,
        vec![
            vec![Datum::Int64(1), Datum::Int64(1)],
            vec![Datum::Int64(2), Datum::Int64(1)],
            vec![Datum::Null, Datum::Int64(2)],
        ]
    );
}

#[test]
fn partial_then_final_aggregation_within_one_fragment() {
    let env = small_chunk_env();
    register_int64_table(&env, "t", SlotId(0), &[4, 4, 5, 6, 6, 6, 7]);
    let partial = PlanNode::Aggregate {
        node_id: PlanNodeId(2),
        child: Box::new(scan_node(1, "t", vec![int_slot(0)])),
        mode: AggNodeMode::Partial,
        group_by: vec![GroupByItem {
            slot: SlotId(10),
            expr: int_slot_ref(0),
        }],
        distinct: vec![],
        calls: vec![sum_call(0, 11)],
    };
    let final_agg = PlanNode::Aggregate {
        node_id: PlanNodeId(3),
        child: Box::new(partial),
        mode: AggNodeMode::Final,
        group_by: vec![GroupByItem {
            slot: SlotId(10),
            expr: int_slot_ref(10),
        }],
        distinct: vec![],
        calls: vec![AggCallDesc {
            name: "sum".to_string(),
            args: vec![Expr::slot(SlotId(11), PrimitiveType::Varchar, false)],
            arg_type: Some(PrimitiveType::Int64),
            arg_nullable: false,
            return_type: PrimitiveType::Int64,
            return_nullable: false,
            output_slot: SlotId(11),
        }],
    };
    let plan = result_plan(final_agg, 1, 7, 3);
    let ctx = FragmentExecutor::new(env).execute(&plan).unwrap();
    let rows = sorted_rows(collect_rows(&ctx));
    assert_eq!(
        rows,
        vec![
            vec![Datum::Int64(4), Datum::Int64(8)],
            vec![Datum::Int64(5), Datum::Int64(5)],
            vec![Datum::Int64(6), Datum::Int64(18)],
            vec![Datum::Int64(7), Datum::Int64(7)],
        ]
    );
}

#[test]
fn distinct_two_phase_counts_distinct_values() {
    // count(distinct v) group by k.
    let env = small_chunk_env();
    register_table(
        &env,
        "t",
        Chunk::from_columns(vec![
            (SlotId(0), Column::int64(&[1, 1, 1, 2, 2, 2])),
            (SlotId(1), Column::int64(&[10, 10, 20, 30, 30, 30])),
        ])
        .unwrap(),
    );
    let local = PlanNode::Aggregate {
        node_id: PlanNodeId(2),
        child: Box::new(scan_node(1, "t", vec![int_slot(0), int_slot(1)])),
        mode: AggNodeMode::DistinctLocal,
        group_by: vec![GroupByItem {
            slot: SlotId(0),
            expr: int_slot_ref(0),
        }],
        distinct: vec![GroupByItem {
            slot: SlotId(1),
            expr: int_slot_ref(1),
        }],
        calls: vec![],
    };
    let global = PlanNode::Aggregate {
        node_id: PlanNodeId(3),
        child: Box::new(local),
        mode: AggNodeMode::DistinctGlobal,
        group_by: vec![GroupByItem {
            slot: SlotId(20),
            expr: int_slot_ref(0),
        }],
        distinct: vec![GroupByItem {
            slot: SlotId(1),
            expr: int_slot_ref(1),
        }],
        calls: vec![AggCallDesc {
            name: "count".to_string(),
            args: vec![int_slot_ref(1)],
            arg_type: Some(PrimitiveType::Int64),
            arg_nullable: false,
            return_type: PrimitiveType::Int64,
            return_nullable: false,
            output_slot: SlotId(21),
        }],
    };
    let plan = result_plan(global, 1, 6, 4);
    let ctx = FragmentExecutor::new(env).execute(&plan).unwrap();
    let rows = sorted_rows(collect_rows(&ctx));
    assert_eq!(
        rows,
        vec![
            vec![Datum::Int64(1), Datum::Int64(2)],
            vec![Datum::Int64(2), Datum::Int64(1)],
        ]
    );
}

fn join_test_tables(env: &Arc<basalt_runtime::ExecEnv>) {
    register_table(
        env,
        "probe",
        Chunk::from_columns(vec![
            (SlotId(0), Column::int64(&[1, 2, 3])),
            (SlotId(1), Column::varchar(&["x", "y", "z"])),
        ])
        .unwrap(),
    );
    register_table(
        env,
        "build",
        Chunk::from_columns(vec![
            (SlotId(10), Column::int64(&[1, 2, 2])),
            (SlotId(11), Column::varchar(&["a", "b", "c"])),
        ])
        .unwrap(),
    );
}

fn join_plan(join_type: JoinType, instance_lo: u64) -> basalt_exec::plan::FragmentPlan {
    let join = PlanNode::HashJoin {
        node_id: PlanNodeId(3),
        probe: Box::new(scan_node(1, "probe", vec![int_slot(0), varchar_slot(1)])),
        build: Box::new(scan_node(2, "build", vec![int_slot(10), varchar_slot(11)])),
        join_type,
        equi: vec![EquiCond {
            probe: int_slot_ref(0),
            build: int_slot_ref(10),
            null_safe: false,
        }],
        other_conjuncts: vec![],
        conjuncts: vec![],
        runtime_filters: vec![RuntimeFilterDesc {
            target_scan: PlanNodeId(1),
            probe_slot: SlotId(0),
            key_index: 0,
        }],
    };
    let mut plan = result_plan(join, 1, 3, instance_lo);
    plan.scan_ranges.push(basalt_exec::plan::ScanRangeEntry {
        node_id: PlanNodeId(2),
        ranges: vec![basalt_exec::plan::ScanRangeDesc {
            tablet_id: 0,
            begin_row: 0,
            end_row: 3,
        }],
    });
    plan
}

fn s(v: &str) -> Datum {
    Datum::Binary(v.as_bytes().to_vec())
}

#[test]
fn inner_join_fragment_matches_reference_semantics() {
    let env = small_chunk_env();
    join_test_tables(&env);
    let ctx = FragmentExecutor::new(env)
        .execute(&join_plan(JoinType::Inner, 5))
        .unwrap();
    let rows = sorted_rows(collect_rows(&ctx));
    assert_eq!(
        rows,
        vec![
            vec![Datum::Int64(1), s("x"), Datum::Int64(1), s("a")],
            vec![Datum::Int64(2), s("y"), Datum::Int64(2), s("b")],
            vec![Datum::Int64(2), s("y"), Datum::Int64(2), s("c")],
        ]
    );
}

#[test]
fn left_anti_join_fragment_emits_only_unmatched_probe() {
    let env = small_chunk_env();
    join_test_tables(&env);
    let ctx = FragmentExecutor::new(env)
        .execute(&join_plan(JoinType::LeftAnti, 6))
        .unwrap();
    let rows = collect_rows(&ctx);
    assert_eq!(rows, vec![vec![Datum::Int64(3), s("z")]]);
}

#[test]
fn filter_project_limit_chain() {
    let env = small_chunk_env();
    register_int64_table(&env, "t", SlotId(0), &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
    let filtered = PlanNode::Filter {
        node_id: PlanNodeId(2),
        child: Box::new(scan_node(1, "t", vec![int_slot(0)])),
        conjuncts: vec![Expr::Cmp {
            op: CmpOp::Gt,
            left: Box::new(int_slot_ref(0)),
            right: Box::new(Expr::int_lit(3)),
        }],
    };
    let projected = PlanNode::Project {
        node_id: PlanNodeId(3),
        child: Box::new(filtered),
        exprs: vec![ProjectItem {
            slot: SlotId(20),
            expr: Expr::Arith {
                op: basalt_exec::expr::ArithOp::Mul,
                left: Box::new(int_slot_ref(0)),
                right: Box::new(Expr::int_lit(10)),
            },
        }],
    };
    let limited = PlanNode::Limit {
        node_id: PlanNodeId(4),
        child: Box::new(projected),
        limit: 3,
    };
    let plan = result_plan(limited, 1, 10, 7);
    let ctx = FragmentExecutor::new(env).execute(&plan).unwrap();
    let rows = collect_rows(&ctx);
    assert_eq!(rows.len(), 3);
    for row in rows {
        let Datum::Int64(v) = row[0] else {
            panic!("unexpected datum");
        };
        assert!(v > 30 && v % 10 == 0);
    }
}

#[test]
fn analytic_fragment_computes_row_numbers_per_partition() {
    let env = small_chunk_env();
    register_table(
        &env,
        "t",
        Chunk::from_columns(vec![
            (SlotId(0), Column::int64(&[1, 1, 1, 2, 2])),
            (SlotId(1), Column::int64(&[10, 20, 30, 40, 50])),
        ])
        .unwrap(),
    );
    let analytic = PlanNode::Analytic {
        node_id: PlanNodeId(2),
        child: Box::new(scan_node(1, "t", vec![int_slot(0), int_slot(1)])),
        partition_by: vec![int_slot_ref(0)],
        order_by: vec![int_slot_ref(1)],
        calls: vec![WindowCallDesc {
            kind: WindowFuncKind::RowNumber,
            arg: None,
            offset: 1,
            default_value: None,
            output_slot: SlotId(20),
            return_type: PrimitiveType::Int64,
            return_nullable: false,
        }],
    };
    let plan = result_plan(analytic, 1, 5, 8);
    let ctx = FragmentExecutor::new(env).execute(&plan).unwrap();
    let rows = sorted_rows(collect_rows(&ctx));
    let row_numbers: Vec<Datum> = rows.iter().map(|r| r[2].clone()).collect();
    assert_eq!(
        row_numbers,
        vec![
            Datum::Int64(1),
            Datum::Int64(2),
            Datum::Int64(3),
            Datum::Int64(1),
            Datum::Int64(2),
        ]
    );
}

#[test]
fn fragment_memory_limit_cancels_with_breakdown() {
    let env = small_chunk_env();
    let values: Vec<i64> = (0..4096).collect();
    register_int64_table(&env, "t", SlotId(0), &values);
    let mut plan = result_plan(
        PlanNode::Aggregate {
            node_id: PlanNodeId(2),
            child: Box::new(scan_node(1, "t", vec![int_slot(0)])),
            mode: AggNodeMode::Complete,
            group_by: vec![GroupByItem {
                slot: SlotId(10),
                expr: int_slot_ref(0),
            }],
            distinct: vec![],
            calls: vec![sum_call(0, 11)],
        },
        1,
        4096,
        9,
    );
    plan.options.fragment_mem_limit_bytes = Some(1024);
    let ctx = FragmentExecutor::new(env).execute(&plan).unwrap();
    let err = ctx.wait_finished(Duration::from_secs(5)).unwrap_err();
    assert!(
        matches!(err, EngineError::MemoryLimitExceeded(_)),
        "unexpected error: {err}"
    );
}

#[test]
fn query_deadline_cancels_stalled_fragment() {
    // An exchange source with no producer parks forever; the deadline
    // watchdog must cancel it.
    let env = small_chunk_env();
    let mut plan = result_plan(
        PlanNode::Exchange {
            node_id: PlanNodeId(1),
            slots: vec![int_slot(0)],
        },
        99, // no scan ranges
        0,
        10,
    );
    plan.options.query_timeout_ms = Some(200);
    let ctx = FragmentExecutor::new(env).execute(&plan).unwrap();
    let err = ctx.wait_finished(Duration::from_secs(5)).unwrap_err();
    assert!(matches!(err, EngineError::Cancelled(_)), "unexpected: {err}");
}
