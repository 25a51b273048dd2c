//! Analytic operator: window functions over ordered partitions.
//!
//! Input arrives sorted by (partition keys, order keys); the operator
//! buffers until finishing, detects partition boundaries by key equality
//! (nulls compare equal so null partitions stay together), computes every
//! call over each partition, and emits the input columns extended with one
//! result column per call.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use basalt_chunk::{Chunk, Column, Datum, PrimitiveType};
use basalt_common::{EngineError, PlanNodeId, Result, SlotId};

use crate::expr::Expr;
use crate::keys::decay_const;
use crate::op::{Operator, OperatorFactory};
use crate::state::RuntimeState;

/// Supported window functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowFuncKind {
    /// 1-based row position within the partition.
    RowNumber,
    /// Rank with gaps; peers (equal order keys) share a rank.
    Rank,
    /// Rank without gaps.
    DenseRank,
    /// Value `offset` rows ahead in the partition.
    Lead,
    /// Value `offset` rows behind in the partition.
    Lag,
    /// First argument value of the partition.
    FirstValue,
    /// Last argument value of the partition.
    LastValue,
}

/// One window call as shipped in the plan descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowCallDesc {
    /// Function kind.
    pub kind: WindowFuncKind,
    /// Argument expression (value functions only).
    pub arg: Option<Expr>,
    /// Row offset for lead/lag; ignored otherwise.
    #[serde(default = "default_offset")]
    pub offset: i64,
    /// Fallback value for lead/lag past the partition edge.
    pub default_value: Option<Datum>,
    /// Output slot of the result column.
    pub output_slot: SlotId,
    /// Declared result type.
    pub return_type: PrimitiveType,
    /// Declared result nullability.
    pub return_nullable: bool,
}

fn default_offset() -> i64 {
    1
}

/// Analytic node description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticDesc {
    /// Partition key expressions.
    pub partition_by: Vec<Expr>,
    /// Order key expressions (rank peer detection).
    pub order_by: Vec<Expr>,
    /// Window calls.
    pub calls: Vec<WindowCallDesc>,
}

/// Buffering analytic operator.
pub struct AnalyticOperator {
    node: PlanNodeId,
    desc: Arc<AnalyticDesc>,
    buffered: Option<Chunk>,
    pending: VecDeque<Chunk>,
    finishing: bool,
    processed: bool,
}

impl AnalyticOperator {
    fn process(&mut self, state: &RuntimeState) -> Result<()> {
        self.processed = true;
        let Some(input) = self.buffered.take() else {
            return Ok(());
        };
        let rows = input.num_rows();
        if rows == 0 {
            return Ok(());
        }

        let part_cols = eval_all(&self.desc.partition_by, &input)?;
        let order_cols = eval_all(&self.desc.order_by, &input)?;

        // partition_start[i] = first row of the partition containing row i.
        let mut partition_start = vec![0usize; rows];
        for i in 1..rows {
            let same = rows_equal(&part_cols, i - 1, i);
            partition_start[i] = if same { partition_start[i - 1] } else { i };
        }
        let mut partition_end = vec![rows; rows];
        for i in (0..rows - 1).rev() {
            partition_end[i] = if partition_start[i + 1] == partition_start[i] {
                partition_end[i + 1]
            } else {
                i + 1
            };
        }

        let mut result_cols = Vec::with_capacity(self.desc.calls.len());
        for call in &self.desc.calls {
            result_cols.push((
                call.output_slot,
                self.compute_call(call, &input, &order_cols, &partition_start, &partition_end)?,
            ));
        }

        // Emit the input columns extended with the results, re-chunked.
        let chunk_size = state.chunk_size();
        let mut at = 0;
        while at < rows {
            let next = (at + chunk_size).min(rows);
            let indices: Vec<u32> = (at..next).map(|i| i as u32).collect();
            let mut out = Chunk::new();
            for (slot, col) in input.slot_ids().iter().zip(input.columns()) {
                let mut dst = col.new_empty_like()?;
                dst.append_selective(col, &indices)?;
                out.append_column_for_slot(*slot, dst)?;
            }
            for (slot, col) in &result_cols {
                let mut dst = col.new_empty_like()?;
                dst.append_selective(col, &indices)?;
                out.append_column_for_slot(*slot, dst)?;
            }
            self.pending.push_back(out);
            at = next;
        }
        Ok(())
    }

    fn compute_call(
        &self,
        call: &WindowCallDesc,
        input: &Chunk,
        order_cols: &[Column],
        partition_start: &[usize],
        partition_end: &[usize],
    ) -> Result<Column> {
        let rows = input.num_rows();
        let arg_col = call
            .arg
            .as_ref()
            .map(|e| e.evaluate(input).and_then(|c| decay_const(&c)))
            .transpose()?;
        let need_arg = || {
            arg_col.as_ref().ok_or_else(|| {
                EngineError::InvalidArgument(format!(
                    "window function {:?} requires an argument",
                    call.kind
                ))
            })
        };

        let mut out = Column::new_for_type(call.return_type, call.return_nullable)?;
        match call.kind {
            WindowFuncKind::RowNumber => {
                for i in 0..rows {
                    out.append_datum(&Datum::Int64((i - partition_start[i]) as i64 + 1))?;
                }
            }
            WindowFuncKind::Rank | WindowFuncKind::DenseRank => {
                let dense = call.kind == WindowFuncKind::DenseRank;
                let mut rank = 1i64;
                let mut dense_rank = 1i64;
                for i in 0..rows {
                    if i == partition_start[i] {
                        rank = 1;
                        dense_rank = 1;
                    } else if !rows_equal(order_cols, i - 1, i) {
                        rank = (i - partition_start[i]) as i64 + 1;
                        dense_rank += 1;
                    }
                    out.append_datum(&Datum::Int64(if dense { dense_rank } else { rank }))?;
                }
            }
            WindowFuncKind::Lead | WindowFuncKind::Lag => {
                let arg = need_arg()?;
                let offset = call.offset.max(0);
                for i in 0..rows {
                    let target = if call.kind == WindowFuncKind::Lead {
                        i as i64 + offset
                    } else {
                        i as i64 - offset
                    };
                    let in_partition = target >= partition_start[i] as i64
                        && target < partition_end[i] as i64;
                    let d = if in_partition {
                        arg.get(target as usize)
                    } else {
                        call.default_value.clone().unwrap_or(Datum::Null)
                    };
                    out.append_datum(&d)?;
                }
            }
            WindowFuncKind::FirstValue => {
                let arg = need_arg()?;
                for i in 0..rows {
                    out.append_datum(&arg.get(partition_start[i]))?;
                }
            }
            WindowFuncKind::LastValue => {
                let arg = need_arg()?;
                for i in 0..rows {
                    out.append_datum(&arg.get(partition_end[i] - 1))?;
                }
            }
        }
        Ok(out)
    }
}

fn eval_all(exprs: &[Expr], chunk: &Chunk) -> Result<Vec<Column>> {
    exprs
        .iter()
        .map(|e| e.evaluate(chunk).and_then(|c| decay_const(&c)))
        .collect()
}

fn rows_equal(cols: &[Column], a: usize, b: usize) -> bool {
    cols.iter().all(|c| c.equals(a, c, b, true))
}

impl Operator for AnalyticOperator {
    fn name(&self) -> &'static str {
        "analytic"
    }

    fn plan_node_id(&self) -> PlanNodeId {
        self.node
    }

    fn need_input(&self) -> bool {
        !self.finishing
    }

    fn has_output(&self) -> bool {
        !self.pending.is_empty()
    }

    fn is_finished(&self) -> bool {
        self.finishing && self.processed && self.pending.is_empty()
    }

    fn push_chunk(&mut self, _state: &RuntimeState, chunk: Chunk) -> Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        match self.buffered.as_mut() {
            Some(acc) => acc.append_chunk(&chunk),
            None => {
                self.buffered = Some(chunk);
                Ok(())
            }
        }
    }

    fn pull_chunk(&mut self, _state: &RuntimeState) -> Result<Option<Chunk>> {
        Ok(self.pending.pop_front())
    }

    fn set_finishing(&mut self, state: &RuntimeState) -> Result<()> {
        if !self.finishing {
            self.finishing = true;
            self.process(state)?;
        }
        Ok(())
    }

    fn set_finished(&mut self, _state: &RuntimeState) -> Result<()> {
        self.finishing = true;
        self.processed = true;
        self.buffered = None;
        self.pending.clear();
        Ok(())
    }
}

/// Factory for [`AnalyticOperator`].
pub struct AnalyticFactory {
    node: PlanNodeId,
    desc: Arc<AnalyticDesc>,
}

impl AnalyticFactory {
    /// Create an analytic factory.
    pub fn new(node: PlanNodeId, desc: AnalyticDesc) -> Self {
        Self {
            node,
            desc: Arc::new(desc),
        }
    }
}

impl OperatorFactory for AnalyticFactory {
    fn name(&self) -> &'static str {
        "analytic"
    }

    fn plan_node_id(&self) -> PlanNodeId {
        self.node
    }

    fn create(&self, _degree: usize, _driver_seq: usize) -> Result<Box<dyn Operator>> {
        Ok(Box::new(AnalyticOperator {
            node: self.node,
            desc: Arc::clone(&self.desc),
            buffered: None,
            pending: VecDeque::new(),
            finishing: false,
            processed: false,
        }))
    }
}
