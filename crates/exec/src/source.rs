//! Morsels and the scan source over the storage seam.
//!
//! Storage I/O is an external collaborator: the executor only sees the
//! [`TableProvider`] trait. Scan ranges from the plan become [`Morsel`]s;
//! each leaf driver owns exactly one morsel and drains it to completion.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use basalt_chunk::Chunk;
use basalt_common::{EngineError, PlanNodeId, Result};

use crate::expr::Expr;
use crate::op::{eval_conjuncts, Operator, OperatorFactory};
use crate::state::RuntimeState;

/// One unit of scan work: a tablet row range owned by one driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Morsel {
    /// Scan node this morsel belongs to.
    pub plan_node_id: PlanNodeId,
    /// Table name resolved through the provider registry.
    pub table: String,
    /// Tablet within the table.
    pub tablet_id: u64,
    /// First row (inclusive).
    pub begin_row: u64,
    /// Past-the-end row.
    pub end_row: u64,
}

/// Chunk stream produced by a provider for one morsel.
pub type ChunkIter = Box<dyn Iterator<Item = Result<Chunk>> + Send>;

/// Narrow storage seam: resolves one morsel into a chunk stream.
pub trait TableProvider: Send + Sync {
    /// Open a stream over the morsel's row range.
    fn scan(&self, morsel: &Morsel, chunk_size: usize) -> Result<ChunkIter>;
}

/// In-memory table keyed by tablet id, used by tests and local execution.
#[derive(Default)]
pub struct MemoryTable {
    tablets: HashMap<u64, Chunk>,
}

impl MemoryTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) one tablet's rows.
    pub fn with_tablet(mut self, tablet_id: u64, chunk: Chunk) -> Self {
        self.tablets.insert(tablet_id, chunk);
        self
    }

    /// Row count of one tablet.
    pub fn tablet_rows(&self, tablet_id: u64) -> u64 {
        self.tablets.get(&tablet_id).map_or(0, |c| c.num_rows() as u64)
    }

    /// Tablet ids present in this table.
    pub fn tablet_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.tablets.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

impl TableProvider for MemoryTable {
    fn scan(&self, morsel: &Morsel, chunk_size: usize) -> Result<ChunkIter> {
        let tablet = self.tablets.get(&morsel.tablet_id).ok_or_else(|| {
            EngineError::InvalidArgument(format!(
                "unknown tablet {} in table {}",
                morsel.tablet_id, morsel.table
            ))
        })?;
        let end = (morsel.end_row as usize).min(tablet.num_rows());
        let begin = (morsel.begin_row as usize).min(end);
        let mut slices = Vec::new();
        let mut at = begin;
        while at < end {
            let next = (at + chunk_size.max(1)).min(end);
            let indices: Vec<u32> = (at..next).map(|i| i as u32).collect();
            let mut out = tablet.new_empty_like()?;
            out.append_selective(tablet, &indices)?;
            slices.push(Ok(out));
            at = next;
        }
        Ok(Box::new(slices.into_iter()))
    }
}

/// Morsel-driven scan source.
pub struct ScanOperator {
    node: PlanNodeId,
    /// `None` when the plan assigned this instance no ranges; the scan then
    /// finishes immediately.
    morsel: Option<Morsel>,
    provider: Arc<dyn TableProvider>,
    conjuncts: Arc<Vec<Expr>>,
    iter: Option<ChunkIter>,
    finished: bool,
}

impl ScanOperator {
    fn apply_runtime_filters(&self, state: &RuntimeState, chunk: Chunk) -> Result<Chunk> {
        let filters = state.filter_hub().filters_for(self.node);
        if filters.is_empty() {
            return Ok(chunk);
        }
        let mut keep = vec![true; chunk.num_rows()];
        for filter in filters {
            let col = chunk.column_by_slot(filter.slot)?;
            for (row, k) in keep.iter_mut().enumerate() {
                if *k && !filter.matches(&col.get(row)) {
                    *k = false;
                }
            }
        }
        chunk.filter(&keep)
    }
}

impl Operator for ScanOperator {
    fn name(&self) -> &'static str {
        "scan"
    }

    fn plan_node_id(&self) -> PlanNodeId {
        self.node
    }

    fn prepare(&mut self, state: &RuntimeState) -> Result<()> {
        match &self.morsel {
            Some(morsel) => self.iter = Some(self.provider.scan(morsel, state.chunk_size())?),
            None => self.finished = true,
        }
        Ok(())
    }

    fn need_input(&self) -> bool {
        false
    }

    fn has_output(&self) -> bool {
        !self.finished
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    fn push_chunk(&mut self, _state: &RuntimeState, _chunk: Chunk) -> Result<()> {
        Err(EngineError::Internal("push into scan source".to_string()))
    }

    fn pull_chunk(&mut self, state: &RuntimeState) -> Result<Option<Chunk>> {
        let Some(iter) = self.iter.as_mut() else {
            return Err(EngineError::Internal("scan pulled before prepare".to_string()));
        };
        match iter.next() {
            None => {
                self.finished = true;
                Ok(None)
            }
            Some(chunk) => {
                let chunk = chunk?;
                state
                    .metrics
                    .rows_scanned
                    .fetch_add(chunk.num_rows() as u64, Ordering::Relaxed);
                let chunk = if self.conjuncts.is_empty() {
                    chunk
                } else {
                    let keep = eval_conjuncts(&self.conjuncts, &chunk)?;
                    chunk.filter(&keep)?
                };
                let chunk = self.apply_runtime_filters(state, chunk)?;
                Ok(Some(chunk))
            }
        }
    }

    fn set_finishing(&mut self, _state: &RuntimeState) -> Result<()> {
        Ok(())
    }

    fn set_finished(&mut self, _state: &RuntimeState) -> Result<()> {
        self.finished = true;
        self.iter = None;
        Ok(())
    }

    fn is_source(&self) -> bool {
        true
    }
}

/// Factory creating one [`ScanOperator`] per morsel.
pub struct ScanOperatorFactory {
    node: PlanNodeId,
    morsels: Vec<Morsel>,
    provider: Arc<dyn TableProvider>,
    conjuncts: Arc<Vec<Expr>>,
}

impl ScanOperatorFactory {
    /// Create a scan factory over the node's morsels.
    pub fn new(
        node: PlanNodeId,
        morsels: Vec<Morsel>,
        provider: Arc<dyn TableProvider>,
        conjuncts: Vec<Expr>,
    ) -> Self {
        Self {
            node,
            morsels,
            provider,
            conjuncts: Arc::new(conjuncts),
        }
    }

    /// Leaf pipeline driver count: one driver per morsel, at least one.
    pub fn driver_count(&self) -> usize {
        self.morsels.len().max(1)
    }
}

impl OperatorFactory for ScanOperatorFactory {
    fn name(&self) -> &'static str {
        "scan"
    }

    fn plan_node_id(&self) -> PlanNodeId {
        self.node
    }

    fn create(&self, _degree: usize, driver_seq: usize) -> Result<Box<dyn Operator>> {
        if driver_seq > 0 && driver_seq >= self.morsels.len() {
            return Err(EngineError::Internal(format!(
                "scan node {} has {} morsels but driver {driver_seq} was created",
                self.node,
                self.morsels.len()
            )));
        }
        Ok(Box::new(ScanOperator {
            node: self.node,
            morsel: self.morsels.get(driver_seq).cloned(),
            provider: Arc::clone(&self.provider),
            conjuncts: Arc::clone(&self.conjuncts),
            iter: None,
            finished: false,
        }))
    }

    fn is_source(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use basalt_chunk::{Column, Datum};
    use basalt_common::{EngineConfig, FragmentInstanceId, MemTracker, QueryId, SlotId};

    fn runtime_state(chunk_size: usize) -> RuntimeState {
        let config = EngineConfig {
            chunk_size,
            ..EngineConfig::default()
        };
        RuntimeState::new(
            QueryId { hi: 0, lo: 1 },
            FragmentInstanceId { hi: 0, lo: 2 },
            config,
            MemTracker::root("test", None),
        )
    }

    fn morsel(begin: u64, end: u64) -> Morsel {
        Morsel {
            plan_node_id: PlanNodeId(1),
            table: "t".to_string(),
            tablet_id: 0,
            begin_row: begin,
            end_row: end,
        }
    }

    #[test]
    fn scan_emits_chunk_sized_slices_of_the_morsel_range() {
        let state = runtime_state(3);
        let table = MemoryTable::new().with_tablet(
            0,
            Chunk::from_columns(vec![(SlotId(0), Column::int64(&[0, 1, 2, 3, 4, 5, 6, 7]))])
                .unwrap(),
        );
        let factory = ScanOperatorFactory::new(
            PlanNodeId(1),
            vec![morsel(1, 8)],
            Arc::new(table),
            vec![],
        );
        let mut op = factory.create(1, 0).unwrap();
        op.prepare(&state).unwrap();

        let mut rows = Vec::new();
        while let Some(chunk) = op.pull_chunk(&state).unwrap() {
            for row in 0..chunk.num_rows() {
                rows.push(chunk.column(0).get(row));
            }
        }
        assert!(op.is_finished());
        assert_eq!(rows.len(), 7);
        assert_eq!(rows[0], Datum::Int64(1));
        assert_eq!(rows[6], Datum::Int64(7));
    }

    #[test]
    fn runtime_filter_prunes_scan_output() {
        use crate::state::InRuntimeFilter;
        let state = runtime_state(8);
        state.filter_hub().publish(
            PlanNodeId(1),
            InRuntimeFilter {
                build_node: PlanNodeId(9),
                slot: SlotId(0),
                values: [Datum::Int64(2), Datum::Int64(5)].into_iter().collect(),
            },
        );
        let table = MemoryTable::new().with_tablet(
            0,
            Chunk::from_columns(vec![(SlotId(0), Column::int64(&[1, 2, 3, 4, 5]))]).unwrap(),
        );
        let factory =
            ScanOperatorFactory::new(PlanNodeId(1), vec![morsel(0, 5)], Arc::new(table), vec![]);
        let mut op = factory.create(1, 0).unwrap();
        op.prepare(&state).unwrap();
        let chunk = op.pull_chunk(&state).unwrap().unwrap();
        assert_eq!(chunk.num_rows(), 2);
        assert_eq!(chunk.column(0).get(0), Datum::Int64(2));
        assert_eq!(chunk.column(0).get(1), Datum::Int64(5));
    }
}
