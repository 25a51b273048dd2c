//! Group-by aggregation core shared by the blocking and streaming operators.
//!
//! One `Aggregator` owns a key adaptor plus one state row per group; the
//! surrounding operator decides when to push input and when to drain. The
//! three modes mirror two-phase distributed aggregation: `Complete` updates
//! raw rows and finalizes values, `Partial` updates raw rows and serializes
//! states, `Final` merges serialized states and finalizes values.

use std::sync::Arc;

use smallvec::SmallVec;

use basalt_chunk::{Chunk, Column, Datum, PrimitiveType};
use basalt_common::{EngineError, Result, SlotId, TrackedBytes};

use crate::expr::Expr;
use crate::keys::{decay_const, KeyAdaptor};
use crate::state::RuntimeState;

use super::function::{AggFunction, AggState};

/// Aggregation phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggMode {
    /// Single-phase: raw rows in, final values out.
    Complete,
    /// Producer side of two-phase: raw rows in, serialized states out.
    Partial,
    /// Consumer side of two-phase: serialized states in, final values out.
    Final,
}

/// One resolved aggregate call.
pub struct BoundAggCall {
    /// Resolved function bundle.
    pub func: Arc<dyn AggFunction>,
    /// Argument expressions (for `Final` mode: one slot ref to the
    /// serialized-state column).
    pub args: Vec<Expr>,
    /// Output slot of this call's column.
    pub output_slot: SlotId,
    /// Declared result type.
    pub return_type: PrimitiveType,
    /// Declared result nullability.
    pub return_nullable: bool,
}

type StateRow = SmallVec<[AggState; 4]>;

/// Hash aggregation engine: key adaptor + per-group state rows.
pub struct Aggregator {
    mode: AggMode,
    key_exprs: Vec<Expr>,
    key_slots: Vec<SlotId>,
    calls: Vec<BoundAggCall>,
    adaptor: Option<KeyAdaptor>,
    states: Vec<StateRow>,
    groups_scratch: Vec<u32>,
    drain_cursor: usize,
    input_rows: u64,
    tracked: Option<TrackedBytes>,
}

impl Aggregator {
    /// Create an aggregator; `key_exprs`/`key_slots` empty means one global group.
    pub fn new(
        mode: AggMode,
        key_exprs: Vec<Expr>,
        key_slots: Vec<SlotId>,
        calls: Vec<BoundAggCall>,
    ) -> Result<Self> {
        if key_exprs.len() != key_slots.len() {
            return Err(EngineError::Internal(
                "group-by expressions and output slots diverge".to_string(),
            ));
        }
        let adaptor = if key_exprs.is_empty() {
            None
        } else {
            let shapes: Vec<(PrimitiveType, bool)> =
                key_exprs.iter().map(Expr::output_type).collect();
            Some(KeyAdaptor::for_shapes(&shapes)?)
        };
        let mut agg = Self {
            mode,
            key_exprs,
            key_slots,
            calls,
            adaptor,
            states: Vec::new(),
            groups_scratch: Vec::new(),
            drain_cursor: 0,
            input_rows: 0,
            tracked: None,
        };
        if agg.adaptor.is_none() {
            // A global aggregate yields exactly one row even over no input.
            agg.states.push(agg.fresh_state_row());
        }
        Ok(agg)
    }

    fn fresh_state_row(&self) -> StateRow {
        self.calls.iter().map(|c| c.func.create_state()).collect()
    }

    /// Distinct groups seen so far.
    pub fn group_count(&self) -> usize {
        self.adaptor
            .as_ref()
            .map_or(self.states.len(), KeyAdaptor::group_count)
    }

    /// Raw rows accumulated so far.
    pub fn input_rows(&self) -> u64 {
        self.input_rows
    }

    /// Whether a null group key was observed (single nullable key shapes).
    pub fn has_null_key(&self) -> bool {
        self.adaptor.as_ref().is_some_and(KeyAdaptor::has_null_key)
    }

    /// Evaluate the group-by expressions of `chunk`.
    fn eval_keys(&self, chunk: &Chunk) -> Result<Vec<Column>> {
        self.key_exprs
            .iter()
            .map(|e| e.evaluate(chunk).and_then(|c| decay_const(&c)))
            .collect()
    }

    /// Accumulate one input chunk.
    pub fn push_chunk(&mut self, state: &RuntimeState, chunk: &Chunk) -> Result<()> {
        let rows = chunk.num_rows();
        if rows == 0 {
            return Ok(());
        }
        self.input_rows += rows as u64;

        if let Some(adaptor) = self.adaptor.as_mut() {
            let key_cols = self
                .key_exprs
                .iter()
                .map(|e| e.evaluate(chunk).and_then(|c| decay_const(&c)))
                .collect::<Result<Vec<_>>>()?;
            adaptor.build_groups(&key_cols, &mut self.groups_scratch, None)?;
            while self.states.len() < adaptor.group_count() {
                let row = self.calls.iter().map(|c| c.func.create_state()).collect();
                self.states.push(row);
            }
        } else {
            self.groups_scratch.clear();
            self.groups_scratch.resize(rows, 0);
        }

        for (call_idx, call) in self.calls.iter().enumerate() {
            match self.mode {
                AggMode::Final => {
                    let payload_col = call.args.first().ok_or_else(|| {
                        EngineError::Internal("merge aggregate without state column".to_string())
                    })?;
                    let payload_col = payload_col.evaluate(chunk)?;
                    for row in 0..rows {
                        let g = self.groups_scratch[row] as usize;
                        let payload = payload_col.get_slice(row).ok_or_else(|| {
                            EngineError::InvalidArgument(
                                "serialized aggregate state column is not binary".to_string(),
                            )
                        })?;
                        call.func.merge(&mut self.states[g][call_idx], payload)?;
                    }
                }
                _ => {
                    let arg_cols = call
                        .args
                        .iter()
                        .map(|e| e.evaluate(chunk))
                        .collect::<Result<Vec<_>>>()?;
                    for row in 0..rows {
                        let g = self.groups_scratch[row] as usize;
                        call.func
                            .update(&mut self.states[g][call_idx], &arg_cols, row)?;
                    }
                }
            }
        }

        self.account_memory(state)
    }

    fn account_memory(&mut self, state: &RuntimeState) -> Result<()> {
        let bytes = self
            .adaptor
            .as_ref()
            .map_or(0, KeyAdaptor::mem_usage)
            + self.states.len() * (self.calls.len().max(1)) * 64;
        match self.tracked.as_mut() {
            Some(t) => t.resize(bytes),
            None => {
                self.tracked = Some(TrackedBytes::try_new(state.mem_tracker(), bytes)?);
                Ok(())
            }
        }
    }

    /// Transform a chunk to the partial wire form without touching the tables:
    /// each row becomes its own serialized single-row state. Used when the
    /// partial stage switches to pass-through.
    pub fn passthrough_chunk(&self, chunk: &Chunk) -> Result<Chunk> {
        let rows = chunk.num_rows();
        let key_cols = self.eval_keys(chunk)?;
        let mut out = Chunk::new();
        for (slot, col) in self.key_slots.iter().zip(key_cols) {
            out.append_column_for_slot(*slot, col)?;
        }
        let mut buf = Vec::new();
        for call in &self.calls {
            let arg_cols = call
                .args
                .iter()
                .map(|e| e.evaluate(chunk))
                .collect::<Result<Vec<_>>>()?;
            let mut col = Column::new_for_type(PrimitiveType::Varchar, false)?;
            for row in 0..rows {
                let mut st = call.func.create_state();
                call.func.update(&mut st, &arg_cols, row)?;
                buf.clear();
                call.func.serialize_state(&st, &mut buf)?;
                col.append_datum(&Datum::Binary(buf.clone()))?;
            }
            out.append_column_for_slot(call.output_slot, col)?;
        }
        Ok(out)
    }

    /// Emit the next batch of groups, or `None` when fully drained.
    pub fn drain_chunk(&mut self, chunk_size: usize) -> Result<Option<Chunk>> {
        let total = self.group_count();
        if self.drain_cursor >= total {
            return Ok(None);
        }
        let from = self.drain_cursor;
        let to = (from + chunk_size.max(1)).min(total);
        self.drain_cursor = to;

        let mut out = Chunk::new();
        if let Some(adaptor) = self.adaptor.as_ref() {
            let key_cols = adaptor.key_columns(from, to)?;
            for (slot, col) in self.key_slots.iter().zip(key_cols) {
                out.append_column_for_slot(*slot, col)?;
            }
        }
        let mut buf = Vec::new();
        for (call_idx, call) in self.calls.iter().enumerate() {
            let mut col = match self.mode {
                AggMode::Partial => Column::new_for_type(PrimitiveType::Varchar, false)?,
                _ => Column::new_for_type(call.return_type, call.return_nullable)?,
            };
            for g in from..to {
                let st = &self.states[g][call_idx];
                match self.mode {
                    AggMode::Partial => {
                        buf.clear();
                        call.func.serialize_state(st, &mut buf)?;
                        col.append_datum(&Datum::Binary(buf.clone()))?;
                    }
                    _ => call.func.finalize(st, &mut col)?,
                }
            }
            out.append_column_for_slot(call.output_slot, col)?;
        }
        Ok(Some(out))
    }

    /// Whether every group was emitted.
    pub fn is_drained(&self) -> bool {
        self.drain_cursor >= self.group_count()
    }
}
