//! Operator contract and the basic transform/sink operators.
//!
//! Operators are push/pull state machines driven by one driver: the driver
//! moves chunks from an operator with output into the next operator that
//! wants input, propagates finishing when an upstream drains, and yields
//! when the head has nothing or the tail refuses input. Blocking operators
//! (aggregation, join build, exchanges) simply report
//! `need_input() == has_output() == false` to park their driver.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use basalt_chunk::Chunk;
use basalt_common::{PlanNodeId, Result, SlotId};

use crate::expr::Expr;
use crate::observer::Observable;
use crate::state::RuntimeState;

/// One operator instance inside a driver's chain.
pub trait Operator: Send {
    /// Stable operator name for logging.
    fn name(&self) -> &'static str;

    /// Originating plan node.
    fn plan_node_id(&self) -> PlanNodeId;

    /// One-time setup after the chain is assembled.
    fn prepare(&mut self, _state: &RuntimeState) -> Result<()> {
        Ok(())
    }

    /// Whether `push_chunk` is currently accepted.
    fn need_input(&self) -> bool;

    /// Whether `pull_chunk` can currently produce data.
    fn has_output(&self) -> bool;

    /// Whether the operator will never produce output again.
    fn is_finished(&self) -> bool;

    /// Accept one input chunk. Only legal while `need_input()` is true.
    fn push_chunk(&mut self, state: &RuntimeState, chunk: Chunk) -> Result<()>;

    /// Produce one output chunk if available.
    fn pull_chunk(&mut self, state: &RuntimeState) -> Result<Option<Chunk>>;

    /// Upstream is drained: flush internal state, then report finished once empty.
    fn set_finishing(&mut self, state: &RuntimeState) -> Result<()>;

    /// Downstream will not consume further output: release eagerly.
    fn set_finished(&mut self, _state: &RuntimeState) -> Result<()> {
        Ok(())
    }

    /// Release resources; called exactly once per operator.
    fn close(&mut self, _state: &RuntimeState) -> Result<()> {
        Ok(())
    }

    /// Whether this operator heads a pipeline.
    fn is_source(&self) -> bool {
        false
    }

    /// Whether this operator terminates a pipeline.
    fn is_sink(&self) -> bool {
        false
    }

    /// Precondition gate (join probe waits for the build barrier here).
    fn precondition_ready(&self) -> bool {
        true
    }

    /// Observable that fires when a blocked condition may have cleared:
    /// sources signal new input, sinks signal freed capacity, preconditions
    /// signal completion. Required whenever the operator can block.
    fn pending_observable(&self) -> Option<Arc<Observable>> {
        None
    }
}

/// Creates one operator instance per driver of a pipeline.
pub trait OperatorFactory: Send + Sync {
    /// Stable factory name.
    fn name(&self) -> &'static str;

    /// Originating plan node.
    fn plan_node_id(&self) -> PlanNodeId;

    /// Build the instance for driver `driver_seq` of `degree`.
    fn create(&self, degree: usize, driver_seq: usize) -> Result<Box<dyn Operator>>;

    /// Whether created operators are pipeline sources.
    fn is_source(&self) -> bool {
        false
    }
}

/// Conjunct filter.
pub struct FilterOperator {
    node: PlanNodeId,
    conjuncts: Arc<Vec<Expr>>,
    pending: Option<Chunk>,
    finishing: bool,
}

impl Operator for FilterOperator {
    fn name(&self) -> &'static str {
        "filter"
    }

    fn plan_node_id(&self) -> PlanNodeId {
        self.node
    }

    fn need_input(&self) -> bool {
        !self.finishing && self.pending.is_none()
    }

    fn has_output(&self) -> bool {
        self.pending.is_some()
    }

    fn is_finished(&self) -> bool {
        self.finishing && self.pending.is_none()
    }

    fn push_chunk(&mut self, _state: &RuntimeState, chunk: Chunk) -> Result<()> {
        let keep = eval_conjuncts(&self.conjuncts, &chunk)?;
        let filtered = chunk.filter(&keep)?;
        if !filtered.is_empty() {
            self.pending = Some(filtered);
        }
        Ok(())
    }

    fn pull_chunk(&mut self, _state: &RuntimeState) -> Result<Option<Chunk>> {
        Ok(self.pending.take())
    }

    fn set_finishing(&mut self, _state: &RuntimeState) -> Result<()> {
        self.finishing = true;
        Ok(())
    }

    fn set_finished(&mut self, _state: &RuntimeState) -> Result<()> {
        self.finishing = true;
        self.pending = None;
        Ok(())
    }
}

/// Evaluate a conjunct list into one keep-mask (AND across predicates).
pub fn eval_conjuncts(conjuncts: &[Expr], chunk: &Chunk) -> Result<Vec<bool>> {
    let mut keep = vec![true; chunk.num_rows()];
    for conjunct in conjuncts {
        let mask = conjunct.evaluate_predicate(chunk)?;
        for (k, m) in keep.iter_mut().zip(mask) {
            *k = *k && m;
        }
    }
    Ok(keep)
}

/// Factory for [`FilterOperator`].
pub struct FilterOperatorFactory {
    node: PlanNodeId,
    conjuncts: Arc<Vec<Expr>>,
}

impl FilterOperatorFactory {
    /// Create a filter factory.
    pub fn new(node: PlanNodeId, conjuncts: Vec<Expr>) -> Self {
        Self {
            node,
            conjuncts: Arc::new(conjuncts),
        }
    }
}

impl OperatorFactory for FilterOperatorFactory {
    fn name(&self) -> &'static str {
        "filter"
    }

    fn plan_node_id(&self) -> PlanNodeId {
        self.node
    }

    fn create(&self, _degree: usize, _driver_seq: usize) -> Result<Box<dyn Operator>> {
        Ok(Box::new(FilterOperator {
            node: self.node,
            conjuncts: Arc::clone(&self.conjuncts),
            pending: None,
            finishing: false,
        }))
    }
}

/// Expression projection: rebuilds the chunk with one column per expression.
pub struct ProjectOperator {
    node: PlanNodeId,
    exprs: Arc<Vec<(SlotId, Expr)>>,
    pending: Option<Chunk>,
    finishing: bool,
}

impl Operator for ProjectOperator {
    fn name(&self) -> &'static str {
        "project"
    }

    fn plan_node_id(&self) -> PlanNodeId {
        self.node
    }

    fn need_input(&self) -> bool {
        !self.finishing && self.pending.is_none()
    }

    fn has_output(&self) -> bool {
        self.pending.is_some()
    }

    fn is_finished(&self) -> bool {
        self.finishing && self.pending.is_none()
    }

    fn push_chunk(&mut self, _state: &RuntimeState, chunk: Chunk) -> Result<()> {
        let mut out = Chunk::new();
        for (slot, expr) in self.exprs.iter() {
            let col = expr.evaluate(&chunk)?;
            out.append_column_for_slot(*slot, col)?;
        }
        self.pending = Some(out);
        Ok(())
    }

    fn pull_chunk(&mut self, _state: &RuntimeState) -> Result<Option<Chunk>> {
        Ok(self.pending.take())
    }

    fn set_finishing(&mut self, _state: &RuntimeState) -> Result<()> {
        self.finishing = true;
        Ok(())
    }

    fn set_finished(&mut self, _state: &RuntimeState) -> Result<()> {
        self.finishing = true;
        self.pending = None;
        Ok(())
    }
}

/// Factory for [`ProjectOperator`].
pub struct ProjectOperatorFactory {
    node: PlanNodeId,
    exprs: Arc<Vec<(SlotId, Expr)>>,
}

impl ProjectOperatorFactory {
    /// Create a projection factory.
    pub fn new(node: PlanNodeId, exprs: Vec<(SlotId, Expr)>) -> Self {
        Self {
            node,
            exprs: Arc::new(exprs),
        }
    }
}

impl OperatorFactory for ProjectOperatorFactory {
    fn name(&self) -> &'static str {
        "project"
    }

    fn plan_node_id(&self) -> PlanNodeId {
        self.node
    }

    fn create(&self, _degree: usize, _driver_seq: usize) -> Result<Box<dyn Operator>> {
        Ok(Box::new(ProjectOperator {
            node: self.node,
            exprs: Arc::clone(&self.exprs),
            pending: None,
            finishing: false,
        }))
    }
}

/// Row limit shared across all drivers of the pipeline.
pub struct LimitOperator {
    node: PlanNodeId,
    remaining: Arc<AtomicI64>,
    pending: Option<Chunk>,
    finishing: bool,
}

impl Operator for LimitOperator {
    fn name(&self) -> &'static str {
        "limit"
    }

    fn plan_node_id(&self) -> PlanNodeId {
        self.node
    }

    fn need_input(&self) -> bool {
        !self.finishing && self.pending.is_none() && self.remaining.load(Ordering::Acquire) > 0
    }

    fn has_output(&self) -> bool {
        self.pending.is_some()
    }

    fn is_finished(&self) -> bool {
        self.pending.is_none()
            && (self.finishing || self.remaining.load(Ordering::Acquire) <= 0)
    }

    fn push_chunk(&mut self, _state: &RuntimeState, chunk: Chunk) -> Result<()> {
        let rows = chunk.num_rows() as i64;
        if rows == 0 {
            return Ok(());
        }
        let before = self.remaining.fetch_sub(rows, Ordering::AcqRel);
        if before <= 0 {
            return Ok(());
        }
        if rows <= before {
            self.pending = Some(chunk);
        } else {
            let keep: Vec<bool> = (0..chunk.num_rows()).map(|i| (i as i64) < before).collect();
            self.pending = Some(chunk.filter(&keep)?);
        }
        Ok(())
    }

    fn pull_chunk(&mut self, _state: &RuntimeState) -> Result<Option<Chunk>> {
        Ok(self.pending.take())
    }

    fn set_finishing(&mut self, _state: &RuntimeState) -> Result<()> {
        self.finishing = true;
        Ok(())
    }

    fn set_finished(&mut self, _state: &RuntimeState) -> Result<()> {
        self.finishing = true;
        self.pending = None;
        Ok(())
    }
}

/// Factory for [`LimitOperator`]; the budget is shared by every driver.
pub struct LimitOperatorFactory {
    node: PlanNodeId,
    remaining: Arc<AtomicI64>,
}

impl LimitOperatorFactory {
    /// Create a limit factory with a fragment-wide row budget.
    pub fn new(node: PlanNodeId, limit: u64) -> Self {
        Self {
            node,
            remaining: Arc::new(AtomicI64::new(limit.min(i64::MAX as u64) as i64)),
        }
    }
}

impl OperatorFactory for LimitOperatorFactory {
    fn name(&self) -> &'static str {
        "limit"
    }

    fn plan_node_id(&self) -> PlanNodeId {
        self.node
    }

    fn create(&self, _degree: usize, _driver_seq: usize) -> Result<Box<dyn Operator>> {
        Ok(Box::new(LimitOperator {
            node: self.node,
            remaining: Arc::clone(&self.remaining),
            pending: None,
            finishing: false,
        }))
    }
}

/// Consumer-facing handle over a fragment's result queue.
pub struct ResultSinkHandle {
    queue: Mutex<VecDeque<Chunk>>,
    cv: Condvar,
    capacity: usize,
    producer_obs: Arc<Observable>,
    open_sinks: AtomicUsize,
    failed: AtomicBool,
}

impl ResultSinkHandle {
    /// Create a handle with a soft queue capacity in chunks.
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
            capacity: capacity.max(1),
            producer_obs: Arc::new(Observable::new()),
            open_sinks: AtomicUsize::new(0),
            failed: AtomicBool::new(false),
        })
    }

    fn push(&self, chunk: Chunk) {
        self.queue.lock().push_back(chunk);
        self.cv.notify_all();
    }

    fn has_capacity(&self) -> bool {
        self.queue.lock().len() < self.capacity
    }

    /// Pop the next result chunk, waiting until one arrives or all sinks close.
    pub fn pull(&self, timeout: std::time::Duration) -> Option<Chunk> {
        let deadline = std::time::Instant::now() + timeout;
        let mut queue = self.queue.lock();
        loop {
            if let Some(chunk) = queue.pop_front() {
                drop(queue);
                self.producer_obs.notify();
                return Some(chunk);
            }
            if self.open_sinks.load(Ordering::Acquire) == 0 {
                return None;
            }
            if self.cv.wait_until(&mut queue, deadline).timed_out() {
                return None;
            }
        }
    }

    /// Mark delivery aborted so producers stop buffering.
    pub fn fail(&self) {
        self.failed.store(true, Ordering::Release);
        self.cv.notify_all();
    }

    fn sink_opened(&self) {
        self.open_sinks.fetch_add(1, Ordering::AcqRel);
    }

    fn sink_closed(&self) {
        if self.open_sinks.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.cv.notify_all();
        }
    }
}

/// Terminal sink delivering result chunks to the coordinator-side consumer.
pub struct ResultSinkOperator {
    node: PlanNodeId,
    handle: Arc<ResultSinkHandle>,
    finished: bool,
    opened: bool,
}

impl Operator for ResultSinkOperator {
    fn name(&self) -> &'static str {
        "result_sink"
    }

    fn plan_node_id(&self) -> PlanNodeId {
        self.node
    }

    fn prepare(&mut self, _state: &RuntimeState) -> Result<()> {
        self.handle.sink_opened();
        self.opened = true;
        Ok(())
    }

    fn need_input(&self) -> bool {
        !self.finished && self.handle.has_capacity()
    }

    fn has_output(&self) -> bool {
        false
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    fn push_chunk(&mut self, state: &RuntimeState, chunk: Chunk) -> Result<()> {
        state
            .metrics
            .rows_emitted
            .fetch_add(chunk.num_rows() as u64, Ordering::Relaxed);
        if !self.handle.failed.load(Ordering::Acquire) {
            self.handle.push(chunk);
        }
        Ok(())
    }

    fn pull_chunk(&mut self, _state: &RuntimeState) -> Result<Option<Chunk>> {
        Ok(None)
    }

    fn set_finishing(&mut self, _state: &RuntimeState) -> Result<()> {
        self.finished = true;
        Ok(())
    }

    fn close(&mut self, _state: &RuntimeState) -> Result<()> {
        if self.opened {
            self.opened = false;
            self.handle.sink_closed();
        }
        Ok(())
    }

    fn is_sink(&self) -> bool {
        true
    }

    fn pending_observable(&self) -> Option<Arc<Observable>> {
        Some(Arc::clone(&self.handle.producer_obs))
    }
}

/// Factory for [`ResultSinkOperator`].
pub struct ResultSinkOperatorFactory {
    node: PlanNodeId,
    handle: Arc<ResultSinkHandle>,
}

impl ResultSinkOperatorFactory {
    /// Create a result-sink factory bound to `handle`.
    pub fn new(node: PlanNodeId, handle: Arc<ResultSinkHandle>) -> Self {
        Self { node, handle }
    }
}

impl OperatorFactory for ResultSinkOperatorFactory {
    fn name(&self) -> &'static str {
        "result_sink"
    }

    fn plan_node_id(&self) -> PlanNodeId {
        self.node
    }

    fn create(&self, _degree: usize, _driver_seq: usize) -> Result<Box<dyn Operator>> {
        Ok(Box::new(ResultSinkOperator {
            node: self.node,
            handle: Arc::clone(&self.handle),
            finished: false,
            opened: false,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::CmpOp;
    use basalt_chunk::{Column, Datum, PrimitiveType};
    use basalt_common::{EngineConfig, FragmentInstanceId, MemTracker, QueryId};

    fn runtime_state() -> RuntimeState {
        RuntimeState::new(
            QueryId { hi: 0, lo: 1 },
            FragmentInstanceId { hi: 0, lo: 2 },
            EngineConfig::default(),
            MemTracker::root("test", None),
        )
    }

    #[test]
    fn filter_drops_failing_rows() {
        let state = runtime_state();
        let factory = FilterOperatorFactory::new(
            PlanNodeId(1),
            vec![Expr::Cmp {
                op: CmpOp::Gt,
                left: Box::new(Expr::slot(SlotId(0), PrimitiveType::Int64, false)),
                right: Box::new(Expr::int_lit(2)),
            }],
        );
        let mut op = factory.create(1, 0).unwrap();
        let chunk =
            Chunk::from_columns(vec![(SlotId(0), Column::int64(&[1, 2, 3, 4]))]).unwrap();
        op.push_chunk(&state, chunk).unwrap();
        let out = op.pull_chunk(&state).unwrap().unwrap();
        assert_eq!(out.num_rows(), 2);
        assert_eq!(out.column(0).get(0), Datum::Int64(3));
    }

    #[test]
    fn limit_truncates_across_chunks_and_finishes() {
        let state = runtime_state();
        let factory = LimitOperatorFactory::new(PlanNodeId(2), 3);
        let mut op = factory.create(1, 0).unwrap();

        let chunk = Chunk::from_columns(vec![(SlotId(0), Column::int64(&[1, 2]))]).unwrap();
        op.push_chunk(&state, chunk.clone()).unwrap();
        assert_eq!(op.pull_chunk(&state).unwrap().unwrap().num_rows(), 2);
        op.push_chunk(&state, chunk).unwrap();
        assert_eq!(op.pull_chunk(&state).unwrap().unwrap().num_rows(), 1);
        assert!(op.is_finished());
    }

    #[test]
    fn result_sink_reports_completion_to_consumer() {
        let state = runtime_state();
        let handle = ResultSinkHandle::new(4);
        let factory = ResultSinkOperatorFactory::new(PlanNodeId(3), Arc::clone(&handle));
        let mut op = factory.create(1, 0).unwrap();
        op.prepare(&state).unwrap();
        let chunk = Chunk::from_columns(vec![(SlotId(0), Column::int64(&[9]))]).unwrap();
        op.push_chunk(&state, chunk).unwrap();
        op.set_finishing(&state).unwrap();
        op.close(&state).unwrap();

        let got = handle.pull(std::time::Duration::from_millis(100)).unwrap();
        assert_eq!(got.num_rows(), 1);
        assert!(handle.pull(std::time::Duration::from_millis(10)).is_none());
    }
}
