//! Fragment descriptor ingress.
//!
//! The coordinator ships each fragment as JSON: a plan-node tree plus scan
//! ranges, exchange sender counts, the sink definition, destinations and
//! query options. The runtime deserializes it here and compiles pipelines
//! from it; nothing in this module executes anything.

use serde::{Deserialize, Serialize};

use basalt_chunk::PrimitiveType;
use basalt_common::{
    EngineConfig, EngineError, FragmentInstanceId, PlanNodeId, QueryId, Result, SenderId, SlotId,
    StreamingPreaggPolicy, TransmissionCompression,
};

use crate::agg::AggCallDesc;
use crate::expr::Expr;
use crate::join::{EquiCond, JoinType, RuntimeFilterDesc};
use crate::window::WindowCallDesc;

/// Declared shape of one output slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotDesc {
    /// Slot id.
    pub slot: SlotId,
    /// Element type.
    pub ptype: PrimitiveType,
    /// Nullability.
    pub nullable: bool,
}

/// One projected column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectItem {
    /// Output slot.
    pub slot: SlotId,
    /// Producing expression.
    pub expr: Expr,
}

/// One group-by column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupByItem {
    /// Output slot of the key column.
    pub slot: SlotId,
    /// Key expression over the child's output.
    pub expr: Expr,
}

/// Aggregation node phase, including the two-phase distinct protocol stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggNodeMode {
    /// Single-phase aggregation.
    Complete,
    /// Producer side of two-phase aggregation (streaming pre-aggregation).
    Partial,
    /// Consumer side of two-phase aggregation.
    Final,
    /// Producer side of two-phase distinct: local dedup set.
    DistinctLocal,
    /// Consumer side of two-phase distinct: global dedup + aggregate.
    DistinctGlobal,
}

/// Physical plan-node tree of one fragment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum PlanNode {
    /// Morsel-parallel table scan.
    Scan {
        /// Node id.
        node_id: PlanNodeId,
        /// Table resolved through the provider registry.
        table: String,
        /// Produced slots.
        slots: Vec<SlotDesc>,
        /// Pushed-down predicates.
        conjuncts: Vec<Expr>,
    },
    /// Remote exchange receiver.
    Exchange {
        /// Node id (matched by incoming transmit requests).
        node_id: PlanNodeId,
        /// Slots carried by received chunks.
        slots: Vec<SlotDesc>,
    },
    /// Predicate filter.
    Filter {
        /// Node id.
        node_id: PlanNodeId,
        /// Input.
        child: Box<PlanNode>,
        /// Conjuncts.
        conjuncts: Vec<Expr>,
    },
    /// Expression projection.
    Project {
        /// Node id.
        node_id: PlanNodeId,
        /// Input.
        child: Box<PlanNode>,
        /// Projected columns.
        exprs: Vec<ProjectItem>,
    },
    /// Row limit.
    Limit {
        /// Node id.
        node_id: PlanNodeId,
        /// Input.
        child: Box<PlanNode>,
        /// Maximum rows.
        limit: u64,
    },
    /// Hash aggregation.
    Aggregate {
        /// Node id.
        node_id: PlanNodeId,
        /// Input.
        child: Box<PlanNode>,
        /// Phase.
        mode: AggNodeMode,
        /// Group-by columns.
        group_by: Vec<GroupByItem>,
        /// Distinct argument columns (distinct modes only); they follow the
        /// group keys in the stage's output.
        #[serde(default)]
        distinct: Vec<GroupByItem>,
        /// Aggregate calls.
        #[serde(default)]
        calls: Vec<AggCallDesc>,
    },
    /// Hash join; `build` is drained before `probe` produces.
    HashJoin {
        /// Node id.
        node_id: PlanNodeId,
        /// Probe (left) input.
        probe: Box<PlanNode>,
        /// Build (right) input.
        build: Box<PlanNode>,
        /// Join variant.
        join_type: JoinType,
        /// Equality conditions.
        equi: Vec<EquiCond>,
        /// Non-equi candidate-pair predicates.
        #[serde(default)]
        other_conjuncts: Vec<Expr>,
        /// Output predicates.
        #[serde(default)]
        conjuncts: Vec<Expr>,
        /// Runtime IN-filter targets.
        #[serde(default)]
        runtime_filters: Vec<RuntimeFilterDesc>,
    },
    /// Window functions over ordered partitions (input pre-sorted).
    Analytic {
        /// Node id.
        node_id: PlanNodeId,
        /// Input.
        child: Box<PlanNode>,
        /// Partition keys.
        partition_by: Vec<Expr>,
        /// Order keys.
        order_by: Vec<Expr>,
        /// Window calls.
        calls: Vec<WindowCallDesc>,
    },
}

impl PlanNode {
    /// This node's id.
    pub fn node_id(&self) -> PlanNodeId {
        match self {
            PlanNode::Scan { node_id, .. }
            | PlanNode::Exchange { node_id, .. }
            | PlanNode::Filter { node_id, .. }
            | PlanNode::Project { node_id, .. }
            | PlanNode::Limit { node_id, .. }
            | PlanNode::Aggregate { node_id, .. }
            | PlanNode::HashJoin { node_id, .. }
            | PlanNode::Analytic { node_id, .. } => *node_id,
        }
    }

    /// Output slot layout of this node.
    pub fn output_layout(&self) -> Result<Vec<SlotDesc>> {
        match self {
            PlanNode::Scan { slots, .. } | PlanNode::Exchange { slots, .. } => Ok(slots.clone()),
            PlanNode::Filter { child, .. } | PlanNode::Limit { child, .. } => {
                child.output_layout()
            }
            PlanNode::Project { exprs, .. } => Ok(exprs
                .iter()
                .map(|p| {
                    let (ptype, nullable) = p.expr.output_type();
                    SlotDesc {
                        slot: p.slot,
                        ptype,
                        nullable,
                    }
                })
                .collect()),
            PlanNode::Aggregate {
                mode,
                group_by,
                distinct,
                calls,
                ..
            } => {
                let mut out: Vec<SlotDesc> = group_by
                    .iter()
                    .map(|g| {
                        let (ptype, nullable) = g.expr.output_type();
                        SlotDesc {
                            slot: g.slot,
                            ptype,
                            nullable,
                        }
                    })
                    .collect();
                match mode {
                    AggNodeMode::DistinctLocal => {
                        for d in distinct {
                            let (ptype, nullable) = d.expr.output_type();
                            out.push(SlotDesc {
                                slot: d.slot,
                                ptype,
                                nullable,
                            });
                        }
                    }
                    AggNodeMode::Partial => {
                        for c in calls {
                            out.push(SlotDesc {
                                slot: c.output_slot,
                                ptype: PrimitiveType::Varchar,
                                nullable: false,
                            });
                        }
                    }
                    _ => {
                        for c in calls {
                            out.push(SlotDesc {
                                slot: c.output_slot,
                                ptype: c.return_type,
                                nullable: c.return_nullable,
                            });
                        }
                    }
                }
                Ok(out)
            }
            PlanNode::HashJoin {
                probe,
                build,
                join_type,
                ..
            } => {
                let mut out = Vec::new();
                if join_type.emits_probe_columns() {
                    for s in probe.output_layout()? {
                        out.push(SlotDesc {
                            nullable: s.nullable || join_type.probe_output_nullable(),
                            ..s
                        });
                    }
                }
                if join_type.emits_build_columns() {
                    for s in build.output_layout()? {
                        out.push(SlotDesc {
                            nullable: s.nullable || join_type.build_output_nullable(),
                            ..s
                        });
                    }
                }
                Ok(out)
            }
            PlanNode::Analytic { child, calls, .. } => {
                let mut out = child.output_layout()?;
                for c in calls {
                    out.push(SlotDesc {
                        slot: c.output_slot,
                        ptype: c.return_type,
                        nullable: c.return_nullable,
                    });
                }
                Ok(out)
            }
        }
    }
}

/// One scan range of a scan node (maps to one morsel).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRangeDesc {
    /// Tablet id.
    pub tablet_id: u64,
    /// First row (inclusive).
    pub begin_row: u64,
    /// Past-the-end row.
    pub end_row: u64,
}

/// Scan ranges keyed by plan node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRangeEntry {
    /// Scan node.
    pub node_id: PlanNodeId,
    /// Ranges assigned to this instance.
    pub ranges: Vec<ScanRangeDesc>,
}

/// Sender count of one exchange node (EOS accounting on the receiver).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ExchangeSenderCount {
    /// Exchange node.
    pub node_id: PlanNodeId,
    /// Number of upstream sender instances.
    pub senders: u32,
}

/// Partitioning applied by a data-stream sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PartitionDesc {
    /// Broadcast the same payload to every destination.
    Unpartitioned,
    /// Round-robin chunks across destinations.
    Random,
    /// FNV hash over expressions, modulo destination count.
    Hash {
        /// Partition expressions.
        exprs: Vec<Expr>,
    },
    /// CRC32 hash matching the storage bucket distribution.
    Bucket {
        /// Distribution expressions.
        exprs: Vec<Expr>,
    },
    /// Range lookup then CRC32 within the range's buckets.
    Range {
        /// Expression producing the range key.
        partition_expr: Expr,
        /// CRC32 distribution expressions within a range.
        distribute_exprs: Vec<Expr>,
        /// Sorted range table.
        ranges: Vec<RangeDesc>,
    },
}

/// One entry of a range-partition table.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RangeDesc {
    /// Exclusive upper bound of the range key.
    pub upper_bound: i64,
    /// Buckets within this range.
    pub bucket_count: u32,
    /// First destination index of this range's buckets.
    pub channel_base: u32,
}

/// One remote destination of a data-stream sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationDesc {
    /// Receiving fragment instance.
    pub instance_id: FragmentInstanceId,
    /// Transport address (`http://host:port`).
    pub address: String,
}

/// Data-stream sink definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataStreamSinkDesc {
    /// Exchange node id on the receiving side.
    pub dest_node_id: PlanNodeId,
    /// This instance's sender id within the exchange.
    pub sender_id: SenderId,
    /// Backend number reported in transmit requests.
    pub be_number: i32,
    /// Partitioning mode.
    pub partition: PartitionDesc,
    /// Destinations, one channel each.
    pub destinations: Vec<DestinationDesc>,
}

/// Fragment output sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "sink", rename_all = "snake_case")]
pub enum SinkDesc {
    /// Deliver chunks to the local result consumer.
    Result,
    /// Stream chunks to remote exchanges.
    DataStream(DataStreamSinkDesc),
}

/// Per-query option overrides carried by the descriptor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryOptions {
    /// Override chunk size.
    pub chunk_size: Option<usize>,
    /// Override query timeout.
    pub query_timeout_ms: Option<u64>,
    /// Override transmission compression.
    pub transmission_compression: Option<TransmissionCompression>,
    /// Override the fragment memory limit.
    pub fragment_mem_limit_bytes: Option<usize>,
    /// Override the pre-aggregation policy.
    pub streaming_preagg_policy: Option<StreamingPreaggPolicy>,
}

impl QueryOptions {
    /// Apply the overrides onto an engine config copy.
    pub fn apply(&self, config: &mut EngineConfig) {
        if let Some(v) = self.chunk_size {
            config.chunk_size = v;
        }
        if let Some(v) = self.query_timeout_ms {
            config.query_timeout_ms = v;
        }
        if let Some(v) = self.transmission_compression {
            config.transmission_compression = v;
        }
        if let Some(v) = self.fragment_mem_limit_bytes {
            config.fragment_mem_limit_bytes = v;
        }
        if let Some(v) = self.streaming_preagg_policy {
            config.streaming_preagg_policy = v;
        }
    }
}

/// Complete fragment descriptor accepted by the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FragmentPlan {
    /// Owning query.
    pub query_id: QueryId,
    /// This instance.
    pub instance_id: FragmentInstanceId,
    /// Driver count for non-leaf pipelines.
    pub degree: usize,
    /// Operator tree.
    pub root: PlanNode,
    /// Output sink.
    pub sink: SinkDesc,
    /// Scan ranges per scan node.
    #[serde(default)]
    pub scan_ranges: Vec<ScanRangeEntry>,
    /// Sender counts per exchange node.
    #[serde(default)]
    pub exchange_senders: Vec<ExchangeSenderCount>,
    /// Query option overrides.
    #[serde(default)]
    pub options: QueryOptions,
}

impl FragmentPlan {
    /// Decode a descriptor from its JSON wire form.
    pub fn from_json(payload: &str) -> Result<Self> {
        serde_json::from_str(payload)
            .map_err(|e| EngineError::InvalidArgument(format!("malformed fragment plan: {e}")))
    }

    /// Encode to the JSON wire form.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| EngineError::Internal(format!("fragment plan encode failed: {e}")))
    }

    /// Scan ranges of one node.
    pub fn ranges_for(&self, node: PlanNodeId) -> Vec<ScanRangeDesc> {
        self.scan_ranges
            .iter()
            .filter(|e| e.node_id == node)
            .flat_map(|e| e.ranges.clone())
            .collect()
    }

    /// Declared sender count of one exchange node.
    pub fn senders_for(&self, node: PlanNodeId) -> u32 {
        self.exchange_senders
            .iter()
            .find(|e| e.node_id == node)
            .map_or(1, |e| e.senders)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragment_plan_round_trips_through_json() {
        let plan = FragmentPlan {
            query_id: QueryId { hi: 1, lo: 2 },
            instance_id: FragmentInstanceId { hi: 1, lo: 3 },
            degree: 2,
            root: PlanNode::Filter {
                node_id: PlanNodeId(2),
                child: Box::new(PlanNode::Scan {
                    node_id: PlanNodeId(1),
                    table: "t".to_string(),
                    slots: vec![SlotDesc {
                        slot: SlotId(0),
                        ptype: PrimitiveType::Int64,
                        nullable: false,
                    }],
                    conjuncts: vec![],
                }),
                conjuncts: vec![Expr::Cmp {
                    op: crate::expr::CmpOp::Gt,
                    left: Box::new(Expr::slot(SlotId(0), PrimitiveType::Int64, false)),
                    right: Box::new(Expr::int_lit(5)),
                }],
            },
            sink: SinkDesc::Result,
            scan_ranges: vec![ScanRangeEntry {
                node_id: PlanNodeId(1),
                ranges: vec![ScanRangeDesc {
                    tablet_id: 0,
                    begin_row: 0,
                    end_row: 100,
                }],
            }],
            exchange_senders: vec![],
            options: QueryOptions::default(),
        };
        let json = plan.to_json().unwrap();
        let back = FragmentPlan::from_json(&json).unwrap();
        assert_eq!(back.degree, 2);
        assert_eq!(back.root.node_id(), PlanNodeId(2));
        assert_eq!(back.ranges_for(PlanNodeId(1)).len(), 1);
    }

    #[test]
    fn join_layout_widens_nullability_per_side() {
        let scan = |node: i32, slot: i32| PlanNode::Scan {
            node_id: PlanNodeId(node),
            table: "t".to_string(),
            slots: vec![SlotDesc {
                slot: SlotId(slot),
                ptype: PrimitiveType::Int64,
                nullable: false,
            }],
            conjuncts: vec![],
        };
        let join = PlanNode::HashJoin {
            node_id: PlanNodeId(3),
            probe: Box::new(scan(1, 0)),
            build: Box::new(scan(2, 10)),
            join_type: JoinType::LeftOuter,
            equi: vec![],
            other_conjuncts: vec![],
            conjuncts: vec![],
            runtime_filters: vec![],
        };
        let layout = join.output_layout().unwrap();
        assert!(!layout[0].nullable);
        assert!(layout[1].nullable);
    }
}
