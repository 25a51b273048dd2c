//! Plan-to-pipeline compilation.
//!
//! The plan tree is walked post-order; contiguous non-blocking operators
//! extend the current pipeline, and blocking boundaries (join build sides,
//! blocking aggregation, local/remote exchanges) close it. Blocking
//! aggregation keeps its hash tables driver-local by hash-splitting input
//! across a local exchange; analytic and keyless aggregation gather to one
//! driver the same way.

use std::sync::Arc;

use basalt_common::{EngineError, PlanNodeId, Result};
use basalt_exchange::{ExchangeReceiver, ExchangeSinkFactory, ExchangeSourceFactory, SinkShared};
use basalt_exec::agg::{
    AggDesc, AggMode, AggregateBlockingFactory, AggregateStreamingFactory, DistinctGlobalFactory,
    DistinctLocalFactory,
};
use basalt_exec::expr::Expr;
use basalt_exec::join::{JoinDesc, JoinSlot, JoinState};
use basalt_exec::join::{JoinBuildSinkFactory, JoinProbeFactory};
use basalt_exec::local_exchange::{
    LocalExchangeMode, LocalExchangeSinkFactory, LocalExchangeSourceFactory, LocalExchanger,
};
use basalt_exec::op::{
    FilterOperatorFactory, LimitOperatorFactory, OperatorFactory, ProjectOperatorFactory,
    ResultSinkHandle, ResultSinkOperatorFactory,
};
use basalt_exec::plan::{AggNodeMode, FragmentPlan, PlanNode, SinkDesc};
use basalt_exec::source::{Morsel, ScanOperatorFactory};
use basalt_exec::window::{AnalyticDesc, AnalyticFactory};
use basalt_exec::{Pipeline, RuntimeState};

use crate::context::ExecEnv;

const LOCAL_EXCHANGE_QUEUE_CHUNKS: usize = 16;
const RESULT_QUEUE_CHUNKS: usize = 32;

/// Compilation output: pipelines ready for driver fan-out, plus the result
/// handle for result-sink fragments.
pub struct CompiledFragment {
    /// Pipelines in submission order.
    pub pipelines: Vec<Pipeline>,
    /// Result consumer handle, present for result sinks.
    pub result: Option<Arc<ResultSinkHandle>>,
}

struct PipelineBuild {
    factories: Vec<Arc<dyn OperatorFactory>>,
    degree: usize,
}

pub(crate) struct FragmentCompiler<'a> {
    plan: &'a FragmentPlan,
    env: &'a Arc<ExecEnv>,
    runtime_state: &'a Arc<RuntimeState>,
    pipelines: Vec<Pipeline>,
}

impl<'a> FragmentCompiler<'a> {
    pub(crate) fn compile(
        plan: &'a FragmentPlan,
        env: &'a Arc<ExecEnv>,
        runtime_state: &'a Arc<RuntimeState>,
    ) -> Result<CompiledFragment> {
        let mut compiler = Self {
            plan,
            env,
            runtime_state,
            pipelines: Vec::new(),
        };
        let mut root = compiler.build_node(&plan.root)?;

        let result = match &plan.sink {
            SinkDesc::Result => {
                let handle = ResultSinkHandle::new(RESULT_QUEUE_CHUNKS);
                root.factories.push(Arc::new(ResultSinkOperatorFactory::new(
                    PlanNodeId(-1),
                    Arc::clone(&handle),
                )));
                Some(handle)
            }
            SinkDesc::DataStream(desc) => {
                let shared = SinkShared::new(
                    desc.clone(),
                    Arc::clone(runtime_state),
                    env.rpc_handle(),
                )?;
                root.factories
                    .push(Arc::new(ExchangeSinkFactory::new(desc.dest_node_id, shared)));
                None
            }
        };
        compiler
            .pipelines
            .push(Pipeline::new(root.factories, root.degree)?);

        Ok(CompiledFragment {
            pipelines: compiler.pipelines,
            result,
        })
    }

    /// Close `child` into a local exchange and open the follow-up pipeline
    /// reading from its queues.
    fn split_through_local_exchange(
        &mut self,
        node: PlanNodeId,
        mut child: PipelineBuild,
        mode: LocalExchangeMode,
        queues: usize,
    ) -> Result<PipelineBuild> {
        let exchanger = LocalExchanger::new(mode, queues, LOCAL_EXCHANGE_QUEUE_CHUNKS);
        child.factories.push(Arc::new(LocalExchangeSinkFactory::new(
            node,
            Arc::clone(&exchanger),
        )));
        self.pipelines
            .push(Pipeline::new(child.factories, child.degree)?);
        Ok(PipelineBuild {
            factories: vec![Arc::new(LocalExchangeSourceFactory::new(node, exchanger))],
            degree: queues,
        })
    }

    fn interior_degree(&self) -> usize {
        self.plan.degree.max(1)
    }

    fn build_node(&mut self, node: &PlanNode) -> Result<PipelineBuild> {
        match node {
            PlanNode::Scan {
                node_id,
                table,
                conjuncts,
                ..
            } => {
                let provider = self.env.provider(table)?;
                let morsels: Vec<Morsel> = self
                    .plan
                    .ranges_for(*node_id)
                    .into_iter()
                    .map(|r| Morsel {
                        plan_node_id: *node_id,
                        table: table.clone(),
                        tablet_id: r.tablet_id,
                        begin_row: r.begin_row,
                        end_row: r.end_row,
                    })
                    .collect();
                let factory =
                    ScanOperatorFactory::new(*node_id, morsels, provider, conjuncts.clone());
                let degree = factory.driver_count();
                Ok(PipelineBuild {
                    factories: vec![Arc::new(factory)],
                    degree,
                })
            }
            PlanNode::Exchange { node_id, .. } => {
                let receiver = ExchangeReceiver::new(
                    self.plan.instance_id,
                    *node_id,
                    self.plan.senders_for(*node_id),
                );
                self.env.receiver_registry().register(Arc::clone(&receiver));
                Ok(PipelineBuild {
                    factories: vec![Arc::new(ExchangeSourceFactory::new(*node_id, receiver))],
                    degree: self.interior_degree(),
                })
            }
            PlanNode::Filter {
                node_id,
                child,
                conjuncts,
            } => {
                let mut build = self.build_node(child)?;
                build
                    .factories
                    .push(Arc::new(FilterOperatorFactory::new(*node_id, conjuncts.clone())));
                Ok(build)
            }
            PlanNode::Project {
                node_id,
                child,
                exprs,
            } => {
                let mut build = self.build_node(child)?;
                let items: Vec<_> = exprs.iter().map(|p| (p.slot, p.expr.clone())).collect();
                build
                    .factories
                    .push(Arc::new(ProjectOperatorFactory::new(*node_id, items)));
                Ok(build)
            }
            PlanNode::Limit {
                node_id,
                child,
                limit,
            } => {
                let mut build = self.build_node(child)?;
                build
                    .factories
                    .push(Arc::new(LimitOperatorFactory::new(*node_id, *limit)));
                Ok(build)
            }
            PlanNode::Analytic {
                node_id,
                child,
                partition_by,
                order_by,
                calls,
            } => {
                // The analytic operator consumes its whole (sorted) input;
                // gather to one driver so partitions stay contiguous.
                let child_build = self.build_node(child)?;
                let mut build = self.split_through_local_exchange(
                    *node_id,
                    child_build,
                    LocalExchangeMode::Passthrough,
                    1,
                )?;
                build.factories.push(Arc::new(AnalyticFactory::new(
                    *node_id,
                    AnalyticDesc {
                        partition_by: partition_by.clone(),
                        order_by: order_by.clone(),
                        calls: calls.clone(),
                    },
                )));
                Ok(build)
            }
            PlanNode::Aggregate {
                node_id,
                child,
                mode,
                group_by,
                distinct,
                calls,
            } => {
                let key_exprs: Vec<Expr> = group_by.iter().map(|g| g.expr.clone()).collect();
                let key_slots = group_by.iter().map(|g| g.slot).collect::<Vec<_>>();
                match mode {
                    AggNodeMode::Partial => {
                        let mut build = self.build_node(child)?;
                        build.factories.push(Arc::new(AggregateStreamingFactory::new(
                            *node_id,
                            AggDesc {
                                mode: AggMode::Partial,
                                key_exprs,
                                key_slots,
                                calls: calls.clone(),
                            },
                        )));
                        Ok(build)
                    }
                    AggNodeMode::DistinctLocal => {
                        let mut build = self.build_node(child)?;
                        let mut set_exprs = key_exprs;
                        let mut set_slots = key_slots;
                        for d in distinct {
                            set_exprs.push(d.expr.clone());
                            set_slots.push(d.slot);
                        }
                        build.factories.push(Arc::new(DistinctLocalFactory::new(
                            *node_id,
                            set_exprs,
                            set_slots,
                            self.runtime_state.config().streaming_preagg_policy,
                        )));
                        Ok(build)
                    }
                    AggNodeMode::Complete | AggNodeMode::Final => {
                        let child_build = self.build_node(child)?;
                        let (mode_le, queues) = if key_exprs.is_empty() {
                            (LocalExchangeMode::Passthrough, 1)
                        } else {
                            (
                                LocalExchangeMode::Hash(key_exprs.clone()),
                                self.interior_degree(),
                            )
                        };
                        let mut build = self.split_through_local_exchange(
                            *node_id,
                            child_build,
                            mode_le,
                            queues,
                        )?;
                        let agg_mode = if *mode == AggNodeMode::Final {
                            AggMode::Final
                        } else {
                            AggMode::Complete
                        };
                        build.factories.push(Arc::new(AggregateBlockingFactory::new(
                            *node_id,
                            AggDesc {
                                mode: agg_mode,
                                key_exprs,
                                key_slots,
                                calls: calls.clone(),
                            },
                        )));
                        Ok(build)
                    }
                    AggNodeMode::DistinctGlobal => {
                        let child_build = self.build_node(child)?;
                        let (mode_le, queues) = if key_exprs.is_empty() {
                            (LocalExchangeMode::Passthrough, 1)
                        } else {
                            (
                                LocalExchangeMode::Hash(key_exprs.clone()),
                                self.interior_degree(),
                            )
                        };
                        let mut build = self.split_through_local_exchange(
                            *node_id,
                            child_build,
                            mode_le,
                            queues,
                        )?;
                        let mut set_exprs = key_exprs.clone();
                        for d in distinct {
                            set_exprs.push(d.expr.clone());
                        }
                        build.factories.push(Arc::new(DistinctGlobalFactory::new(
                            *node_id,
                            set_exprs,
                            AggDesc {
                                mode: AggMode::Complete,
                                key_exprs,
                                key_slots,
                                calls: calls.clone(),
                            },
                        )));
                        Ok(build)
                    }
                }
            }
            PlanNode::HashJoin {
                node_id,
                probe,
                build,
                join_type,
                equi,
                other_conjuncts,
                conjuncts,
                runtime_filters,
            } => {
                let probe_slots: Vec<JoinSlot> = probe
                    .output_layout()?
                    .into_iter()
                    .map(|s| JoinSlot {
                        slot: s.slot,
                        ptype: s.ptype,
                        nullable: s.nullable,
                    })
                    .collect();
                let build_slots: Vec<JoinSlot> = build
                    .output_layout()?
                    .into_iter()
                    .map(|s| JoinSlot {
                        slot: s.slot,
                        ptype: s.ptype,
                        nullable: s.nullable,
                    })
                    .collect();
                if equi.is_empty() {
                    return Err(EngineError::InvalidArgument(format!(
                        "hash join {node_id} without equality conditions"
                    )));
                }
                let desc = JoinDesc {
                    join_type: *join_type,
                    equi: equi.clone(),
                    other_conjuncts: other_conjuncts.clone(),
                    conjuncts: conjuncts.clone(),
                    probe_slots,
                    build_slots,
                    runtime_filters: runtime_filters.clone(),
                    probe_is_exchange: matches!(probe.as_ref(), PlanNode::Exchange { .. }),
                };
                let join_state = JoinState::new(desc);

                // The build side closes its own pipeline at the sink.
                let mut build_side = self.build_node(build)?;
                build_side.factories.push(Arc::new(JoinBuildSinkFactory::new(
                    *node_id,
                    Arc::clone(&join_state),
                )));
                self.pipelines
                    .push(Pipeline::new(build_side.factories, build_side.degree)?);

                let mut probe_side = self.build_node(probe)?;
                probe_side
                    .factories
                    .push(Arc::new(JoinProbeFactory::new(*node_id, join_state)));
                Ok(probe_side)
            }
        }
    }
}
