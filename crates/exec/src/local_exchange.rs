//! In-fragment exchange: repartitions chunks across local driver queues.
//!
//! Used wherever adjacent pipelines run at different degrees: gathering a
//! join build side to one driver, or hash-splitting rows so each blocking
//! aggregation driver owns a disjoint key range.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use basalt_chunk::hash::FNV_SEED;
use basalt_chunk::Chunk;
use basalt_common::{PlanNodeId, Result};

use crate::expr::Expr;
use crate::keys::decay_const;
use crate::observer::Observable;
use crate::op::{Operator, OperatorFactory};
use crate::state::RuntimeState;

/// Distribution of rows across the local queues.
pub enum LocalExchangeMode {
    /// Whole chunks round-robin across queues (degree changes, gather).
    Passthrough,
    /// FNV hash over the given expressions, rows split per queue.
    Hash(Vec<Expr>),
}

/// Shared queue set between local-exchange sinks and sources.
pub struct LocalExchanger {
    mode: LocalExchangeMode,
    queues: Vec<Mutex<VecDeque<Chunk>>>,
    source_obs: Vec<Arc<Observable>>,
    sink_obs: Arc<Observable>,
    capacity: usize,
    open_senders: AtomicUsize,
    rr_counter: AtomicUsize,
}

impl LocalExchanger {
    /// Create an exchanger with `queues` output queues and a per-queue soft
    /// cap of `capacity` chunks.
    pub fn new(mode: LocalExchangeMode, queues: usize, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            mode,
            queues: (0..queues).map(|_| Mutex::new(VecDeque::new())).collect(),
            source_obs: (0..queues).map(|_| Arc::new(Observable::new())).collect(),
            sink_obs: Arc::new(Observable::new()),
            capacity: capacity.max(1),
            open_senders: AtomicUsize::new(0),
            rr_counter: AtomicUsize::new(0),
        })
    }

    /// Number of output queues.
    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    fn has_capacity(&self) -> bool {
        self.queues.iter().all(|q| q.lock().len() < self.capacity)
    }

    fn push_to(&self, queue: usize, chunk: Chunk) {
        if chunk.is_empty() {
            return;
        }
        self.queues[queue].lock().push_back(chunk);
        self.source_obs[queue].notify();
    }

    fn route(&self, chunk: Chunk) -> Result<()> {
        match &self.mode {
            LocalExchangeMode::Passthrough => {
                let q = self.rr_counter.fetch_add(1, Ordering::Relaxed) % self.queues.len();
                self.push_to(q, chunk);
            }
            LocalExchangeMode::Hash(exprs) => {
                let rows = chunk.num_rows();
                let mut hashes = vec![FNV_SEED; rows];
                for expr in exprs {
                    let col = decay_const(&expr.evaluate(&chunk)?)?;
                    col.fnv_hash(&mut hashes)?;
                }
                let n = self.queues.len() as u64;
                let mut per_queue: Vec<Vec<u32>> = vec![Vec::new(); self.queues.len()];
                for (row, h) in hashes.iter().enumerate() {
                    per_queue[(h % n) as usize].push(row as u32);
                }
                for (q, indices) in per_queue.iter().enumerate() {
                    if indices.is_empty() {
                        continue;
                    }
                    let mut out = chunk.new_empty_like()?;
                    out.append_selective(&chunk, indices)?;
                    self.push_to(q, out);
                }
            }
        }
        Ok(())
    }

    fn pop(&self, queue: usize) -> Option<Chunk> {
        let chunk = self.queues[queue].lock().pop_front();
        if chunk.is_some() {
            self.sink_obs.notify();
        }
        chunk
    }

    fn sender_opened(&self) {
        self.open_senders.fetch_add(1, Ordering::AcqRel);
    }

    fn sender_closed(&self) {
        if self.open_senders.fetch_sub(1, Ordering::AcqRel) == 1 {
            for obs in &self.source_obs {
                obs.notify();
            }
        }
    }

    fn queue_finished(&self, queue: usize) -> bool {
        self.open_senders.load(Ordering::Acquire) == 0 && self.queues[queue].lock().is_empty()
    }
}

/// Sink half: routes pushed chunks into the shared queues.
pub struct LocalExchangeSinkOperator {
    node: PlanNodeId,
    exchanger: Arc<LocalExchanger>,
    finished: bool,
    closed_sender: bool,
}

impl Operator for LocalExchangeSinkOperator {
    fn name(&self) -> &'static str {
        "local_exchange_sink"
    }

    fn plan_node_id(&self) -> PlanNodeId {
        self.node
    }

    fn prepare(&mut self, _state: &RuntimeState) -> Result<()> {
        self.exchanger.sender_opened();
        Ok(())
    }

    fn need_input(&self) -> bool {
        !self.finished && self.exchanger.has_capacity()
    }

    fn has_output(&self) -> bool {
        false
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    fn push_chunk(&mut self, _state: &RuntimeState, chunk: Chunk) -> Result<()> {
        self.exchanger.route(chunk)
    }

    fn pull_chunk(&mut self, _state: &RuntimeState) -> Result<Option<Chunk>> {
        Ok(None)
    }

    fn set_finishing(&mut self, _state: &RuntimeState) -> Result<()> {
        if !self.finished {
            self.finished = true;
            if !self.closed_sender {
                self.closed_sender = true;
                self.exchanger.sender_closed();
            }
        }
        Ok(())
    }

    fn set_finished(&mut self, state: &RuntimeState) -> Result<()> {
        self.set_finishing(state)
    }

    fn is_sink(&self) -> bool {
        true
    }

    fn pending_observable(&self) -> Option<Arc<Observable>> {
        Some(Arc::clone(&self.exchanger.sink_obs))
    }
}

/// Source half: drains one queue of the shared exchanger.
pub struct LocalExchangeSourceOperator {
    node: PlanNodeId,
    exchanger: Arc<LocalExchanger>,
    queue: usize,
    finished: bool,
}

impl Operator for LocalExchangeSourceOperator {
    fn name(&self) -> &'static str {
        "local_exchange_source"
    }

    fn plan_node_id(&self) -> PlanNodeId {
        self.node
    }

    fn need_input(&self) -> bool {
        false
    }

    fn has_output(&self) -> bool {
        !self.finished && !self.exchanger.queues[self.queue].lock().is_empty()
    }

    fn is_finished(&self) -> bool {
        self.finished || self.exchanger.queue_finished(self.queue)
    }

    fn push_chunk(&mut self, _state: &RuntimeState, _chunk: Chunk) -> Result<()> {
        Err(basalt_common::EngineError::Internal(
            "push into local exchange source".to_string(),
        ))
    }

    fn pull_chunk(&mut self, _state: &RuntimeState) -> Result<Option<Chunk>> {
        Ok(self.exchanger.pop(self.queue))
    }

    fn set_finishing(&mut self, _state: &RuntimeState) -> Result<()> {
        Ok(())
    }

    fn set_finished(&mut self, _state: &RuntimeState) -> Result<()> {
        self.finished = true;
        Ok(())
    }

    fn is_source(&self) -> bool {
        true
    }

    fn pending_observable(&self) -> Option<Arc<Observable>> {
        Some(Arc::clone(&self.exchanger.source_obs[self.queue]))
    }
}

/// Factory for the sink half.
pub struct LocalExchangeSinkFactory {
    node: PlanNodeId,
    exchanger: Arc<LocalExchanger>,
}

impl LocalExchangeSinkFactory {
    /// Create a sink factory over a shared exchanger.
    pub fn new(node: PlanNodeId, exchanger: Arc<LocalExchanger>) -> Self {
        Self { node, exchanger }
    }
}

impl OperatorFactory for LocalExchangeSinkFactory {
    fn name(&self) -> &'static str {
        "local_exchange_sink"
    }

    fn plan_node_id(&self) -> PlanNodeId {
        self.node
    }

    fn create(&self, _degree: usize, _driver_seq: usize) -> Result<Box<dyn Operator>> {
        Ok(Box::new(LocalExchangeSinkOperator {
            node: self.node,
            exchanger: Arc::clone(&self.exchanger),
            finished: false,
            closed_sender: false,
        }))
    }
}

/// Factory for the source half; driver `i` owns queue `i`.
pub struct LocalExchangeSourceFactory {
    node: PlanNodeId,
    exchanger: Arc<LocalExchanger>,
}

impl LocalExchangeSourceFactory {
    /// Create a source factory over a shared exchanger.
    pub fn new(node: PlanNodeId, exchanger: Arc<LocalExchanger>) -> Self {
        Self { node, exchanger }
    }
}

impl OperatorFactory for LocalExchangeSourceFactory {
    fn name(&self) -> &'static str {
        "local_exchange_source"
    }

    fn plan_node_id(&self) -> PlanNodeId {
        self.node
    }

    fn create(&self, _degree: usize, driver_seq: usize) -> Result<Box<dyn Operator>> {
        if driver_seq >= self.exchanger.queue_count() {
            return Err(basalt_common::EngineError::Internal(format!(
                "local exchange has {} queues but driver {driver_seq} was created",
                self.exchanger.queue_count()
            )));
        }
        Ok(Box::new(LocalExchangeSourceOperator {
            node: self.node,
            exchanger: Arc::clone(&self.exchanger),
            queue: driver_seq,
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
    use basalt_chunk::{Column, PrimitiveType};
    use basalt_common::{EngineConfig, FragmentInstanceId, MemTracker, QueryId, SlotId};

    fn runtime_state() -> RuntimeState {
        RuntimeState::new(
            QueryId { hi: 0, lo: 1 },
            FragmentInstanceId { hi: 0, lo: 2 },
            EngineConfig::default(),
            MemTracker::root("test", None),
        )
    }

    #[test]
    fn hash_split_conserves_rows_and_is_deterministic() {
        let state = runtime_state();
        let exchanger = LocalExchanger::new(
            LocalExchangeMode::Hash(vec![Expr::slot(SlotId(0), PrimitiveType::Int64, false)]),
            3,
            16,
        );
        let sink_factory = LocalExchangeSinkFactory::new(PlanNodeId(1), Arc::clone(&exchanger));
        let mut sink = sink_factory.create(1, 0).unwrap();
        sink.prepare(&state).unwrap();

        let chunk = Chunk::from_columns(vec![(
            SlotId(0),
            Column::int64(&[1, 2, 3, 4, 5, 6, 7, 8]),
        )])
        .unwrap();
        sink.push_chunk(&state, chunk.clone()).unwrap();
        sink.set_finishing(&state).unwrap();

        let mut total = 0;
        let mut seen = Vec::new();
        for q in 0..3 {
            while let Some(c) = exchanger.pop(q) {
                total += c.num_rows();
                for row in 0..c.num_rows() {
                    seen.push((q, c.column(0).get(row)));
                }
            }
            assert!(exchanger.queue_finished(q));
        }
        assert_eq!(total, 8);

        // Same input must land on the same queues again.
        let exchanger2 = LocalExchanger::new(
            LocalExchangeMode::Hash(vec![Expr::slot(SlotId(0), PrimitiveType::Int64, false)]),
            3,
            16,
        );
        let sink_factory2 = LocalExchangeSinkFactory::new(PlanNodeId(1), exchanger2.clone());
        let mut sink2 = sink_factory2.create(1, 0).unwrap();
        sink2.prepare(&state).unwrap();
        sink2.push_chunk(&state, chunk).unwrap();
        let mut seen2 = Vec::new();
        for q in 0..3 {
            while let Some(c) = exchanger2.pop(q) {
                for row in 0..c.num_rows() {
                    seen2.push((q, c.column(0).get(row)));
                }
            }
        }
        assert_eq!(seen, seen2);
    }

    #[test]
    fn source_finishes_only_after_last_sender_closes() {
        let state = runtime_state();
        let exchanger = LocalExchanger::new(LocalExchangeMode::Passthrough, 1, 16);
        let sink_factory = LocalExchangeSinkFactory::new(PlanNodeId(1), Arc::clone(&exchanger));
        let source_factory =
            LocalExchangeSourceFactory::new(PlanNodeId(1), Arc::clone(&exchanger));
        let mut sink_a = sink_factory.create(2, 0).unwrap();
        let mut sink_b = sink_factory.create(2, 1).unwrap();
        sink_a.prepare(&state).unwrap();
        sink_b.prepare(&state).unwrap();
        let mut source = source_factory.create(1, 0).unwrap();

        sink_a.set_finishing(&state).unwrap();
        assert!(!source.is_finished());
        sink_b.set_finishing(&state).unwrap();
        assert!(source.is_finished());
        assert!(source.pull_chunk(&state).unwrap().is_none());
    }
}
