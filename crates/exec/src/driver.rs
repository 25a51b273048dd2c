//! Pipeline drivers: one runnable operator chain with a blocking-aware FSM.
//!
//! A driver is owned by at most one worker thread at a time. `process()`
//! moves chunks head-to-tail until the time slice expires, the source runs
//! dry, the sink refuses input, a precondition is unmet, or every operator
//! finished. Chunks flow FIFO within a driver; no ordering is guaranteed
//! across drivers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use basalt_common::{EngineError, Result};

use crate::observer::Observable;
use crate::op::Operator;
use crate::state::RuntimeState;

/// Driver FSM states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    /// Queued, runnable.
    Ready,
    /// Owned by a worker thread.
    Running,
    /// Parked: the source has nothing to produce.
    InputBlocked,
    /// Parked: the sink refuses further input.
    OutputBlocked,
    /// Parked: an operator precondition (build barrier) is unmet.
    Pending,
    /// All operators finished and closed.
    Finished,
}

/// Outcome of one `process()` slice.
pub enum DriverYield {
    /// Time slice expired with work remaining; requeue.
    Ready,
    /// Park until the observable advances past `version` (or cancellation).
    Blocked {
        /// Which blocked state the driver entered.
        state: DriverState,
        /// The blocking resource's observable.
        observable: Arc<Observable>,
        /// Version sampled before the blocking condition was confirmed.
        version: u64,
        /// Cancel-observable version sampled at the same point.
        cancel_version: u64,
    },
    /// The driver completed (successfully or not) and was closed.
    Finished,
}

/// Completion callback invoked exactly once per driver.
pub type DriverCompletion = Box<dyn FnOnce(Result<()>) + Send>;

/// One runnable instantiation of a pipeline.
pub struct Driver {
    pub(crate) id: u64,
    state: DriverState,
    operators: Vec<Box<dyn Operator>>,
    finishing_sent: Vec<bool>,
    finished_sent: Vec<bool>,
    closed: bool,
    runtime: Arc<RuntimeState>,
    on_finished: Option<DriverCompletion>,
}

impl Driver {
    /// Create a driver over an assembled operator chain.
    pub fn new(
        operators: Vec<Box<dyn Operator>>,
        runtime: Arc<RuntimeState>,
        on_finished: DriverCompletion,
    ) -> Self {
        let n = operators.len();
        Self {
            id: 0,
            state: DriverState::Ready,
            operators,
            finishing_sent: vec![false; n],
            finished_sent: vec![false; n],
            closed: false,
            runtime,
            on_finished: Some(on_finished),
        }
    }

    /// Current FSM state.
    pub fn state(&self) -> DriverState {
        self.state
    }

    /// Prepare every operator in chain order.
    pub fn prepare(&mut self) -> Result<()> {
        let runtime = Arc::clone(&self.runtime);
        for op in &mut self.operators {
            op.prepare(&runtime)?;
        }
        Ok(())
    }

    /// Run until a yield point; never holds locks across the return.
    pub fn process(&mut self, time_slice: Duration) -> DriverYield {
        self.state = DriverState::Running;
        match self.process_inner(time_slice) {
            Ok(outcome) => {
                if let DriverYield::Blocked { state, .. } = &outcome {
                    self.state = *state;
                } else if matches!(outcome, DriverYield::Ready) {
                    self.state = DriverState::Ready;
                }
                outcome
            }
            Err(err) => {
                self.fail(err);
                DriverYield::Finished
            }
        }
    }

    fn process_inner(&mut self, time_slice: Duration) -> Result<DriverYield> {
        let start = Instant::now();
        let runtime = Arc::clone(&self.runtime);
        loop {
            runtime.check_cancelled()?;

            // Precondition gates (e.g. the hash-join build barrier).
            for op in &self.operators {
                if op.precondition_ready() {
                    continue;
                }
                let observable = op.pending_observable().ok_or_else(|| {
                    EngineError::Internal(format!(
                        "operator {} blocks on a precondition without an observable",
                        op.name()
                    ))
                })?;
                let cancel_version = runtime.cancel_observable().version();
                let version = observable.version();
                if op.precondition_ready() {
                    continue;
                }
                return Ok(DriverYield::Blocked {
                    state: DriverState::Pending,
                    observable,
                    version,
                    cancel_version,
                });
            }

            let n = self.operators.len();
            let mut progressed = false;
            for i in 0..n.saturating_sub(1) {
                let (head, tail) = self.operators.split_at_mut(i + 1);
                let prev = &mut head[i];
                let next = &mut tail[0];
                if prev.has_output() && next.need_input() {
                    if let Some(chunk) = prev.pull_chunk(&runtime)? {
                        if chunk.num_rows() > 0 {
                            next.push_chunk(&runtime, chunk)?;
                        }
                        progressed = true;
                    }
                }
                if prev.is_finished() && !self.finishing_sent[i + 1] {
                    self.finishing_sent[i + 1] = true;
                    next.set_finishing(&runtime)?;
                    progressed = true;
                }
            }

            // Early termination flows backward: a finished downstream
            // operator (limit reached) releases everything above it.
            if let Some(stop) = (0..n).rev().find(|&i| self.operators[i].is_finished()) {
                for j in 0..stop {
                    if !self.finished_sent[j] {
                        self.finished_sent[j] = true;
                        self.operators[j].set_finished(&runtime)?;
                        progressed = true;
                    }
                }
            }

            if self.operators[n - 1].is_finished() {
                self.finish(Ok(()))?;
                return Ok(DriverYield::Finished);
            }

            if start.elapsed() >= time_slice {
                return Ok(DriverYield::Ready);
            }

            if progressed {
                continue;
            }

            // Blocked: decide between source starvation and sink pushback.
            let source = &self.operators[0];
            if !source.has_output() && !source.is_finished() {
                if let Some(observable) = source.pending_observable() {
                    let cancel_version = runtime.cancel_observable().version();
                    let version = observable.version();
                    if source.has_output() || source.is_finished() {
                        continue;
                    }
                    return Ok(DriverYield::Blocked {
                        state: DriverState::InputBlocked,
                        observable,
                        version,
                        cancel_version,
                    });
                }
            }
            let sink = &self.operators[n - 1];
            if !sink.need_input() {
                if let Some(observable) = sink.pending_observable() {
                    let cancel_version = runtime.cancel_observable().version();
                    let version = observable.version();
                    if sink.need_input() || sink.is_finished() {
                        continue;
                    }
                    return Ok(DriverYield::Blocked {
                        state: DriverState::OutputBlocked,
                        observable,
                        version,
                        cancel_version,
                    });
                }
            }
            // No observable to park on: requeue rather than spin here.
            return Ok(DriverYield::Ready);
        }
    }

    /// Close all operators and invoke the completion callback.
    fn finish(&mut self, result: Result<()>) -> Result<()> {
        self.state = DriverState::Finished;
        let runtime = Arc::clone(&self.runtime);
        let mut close_error: Option<EngineError> = None;
        for op in &mut self.operators {
            if let Err(e) = op.close(&runtime) {
                tracing::warn!(op = op.name(), error = %e, "operator close failed");
                close_error.get_or_insert(e);
            }
        }
        self.closed = true;
        let final_result = match (result, close_error) {
            (Ok(()), Some(e)) => Err(e),
            (r, _) => r,
        };
        if let Some(cb) = self.on_finished.take() {
            cb(final_result);
        }
        Ok(())
    }

    fn fail(&mut self, err: EngineError) {
        if !err.is_cancelled() {
            tracing::warn!(driver = self.id, error = %err, "driver aborted");
        }
        let _ = self.finish(Err(err));
    }

    /// The cancel observable of this driver's fragment.
    pub fn cancel_observable(&self) -> Arc<Observable> {
        Arc::clone(self.runtime.cancel_observable())
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        if !self.closed {
            // Dropped without running to completion (executor shutdown or
            // fragment teardown): release operator resources.
            let runtime = Arc::clone(&self.runtime);
            for op in &mut self.operators {
                let _ = op.close(&runtime);
            }
            if let Some(cb) = self.on_finished.take() {
                cb(Err(EngineError::Cancelled(
                    "driver dropped before completion".to_string(),
                )));
            }
        }
    }
}
