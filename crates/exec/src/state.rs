//! Per-fragment runtime state shared by every operator and driver.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use basalt_chunk::Datum;
use basalt_common::{
    EngineConfig, EngineError, FragmentInstanceId, MemTracker, PlanNodeId, QueryId, Result, SlotId,
};

use crate::observer::Observable;

/// IN-list predicate synthesized from a small hash-join build side and pushed
/// to a probe-side scan.
#[derive(Debug)]
pub struct InRuntimeFilter {
    /// Join node that produced the filter.
    pub build_node: PlanNodeId,
    /// Probe-side slot the filter applies to.
    pub slot: SlotId,
    /// Distinct build-side key values.
    pub values: HashSet<Datum>,
}

impl InRuntimeFilter {
    /// Whether a probe value passes the filter. NULL never matches an
    /// IN-list built from non-null-safe equality.
    pub fn matches(&self, value: &Datum) -> bool {
        !value.is_null() && self.values.contains(value)
    }
}

/// Per-fragment registry of runtime filters, keyed by target scan node.
#[derive(Debug, Default)]
pub struct RuntimeFilterHub {
    filters: Mutex<std::collections::HashMap<PlanNodeId, Vec<Arc<InRuntimeFilter>>>>,
}

impl RuntimeFilterHub {
    /// Publish a filter for `target_scan`.
    pub fn publish(&self, target_scan: PlanNodeId, filter: InRuntimeFilter) {
        self.filters
            .lock()
            .entry(target_scan)
            .or_default()
            .push(Arc::new(filter));
    }

    /// Filters currently published for `target_scan`.
    pub fn filters_for(&self, target_scan: PlanNodeId) -> Vec<Arc<InRuntimeFilter>> {
        self.filters
            .lock()
            .get(&target_scan)
            .cloned()
            .unwrap_or_default()
    }
}

/// Fragment-level execution counters.
#[derive(Debug, Default)]
pub struct FragmentMetrics {
    /// Rows produced by source operators.
    pub rows_scanned: AtomicU64,
    /// Rows delivered to the fragment sink.
    pub rows_emitted: AtomicU64,
    /// Serialized bytes handed to the exchange transport.
    pub bytes_transmitted: AtomicU64,
    /// Transmit RPCs issued.
    pub rpcs_issued: AtomicU64,
}

/// Shared state of one running fragment instance.
///
/// Operators receive it on every call; it carries the cancellation flag and
/// deadline polled at operator boundaries, the fragment memory tracker, and
/// the runtime-filter hub.
#[derive(Debug)]
pub struct RuntimeState {
    query_id: QueryId,
    finst_id: FragmentInstanceId,
    config: EngineConfig,
    mem_tracker: Arc<MemTracker>,
    cancelled: AtomicBool,
    cancel_reason: Mutex<Option<String>>,
    failure: Mutex<Option<EngineError>>,
    deadline: Option<Instant>,
    filter_hub: RuntimeFilterHub,
    cancel_obs: Arc<Observable>,
    /// Execution counters for this fragment.
    pub metrics: FragmentMetrics,
}

impl RuntimeState {
    /// Create state for one fragment instance.
    pub fn new(
        query_id: QueryId,
        finst_id: FragmentInstanceId,
        config: EngineConfig,
        mem_tracker: Arc<MemTracker>,
    ) -> Self {
        let deadline = (config.query_timeout_ms > 0)
            .then(|| Instant::now() + std::time::Duration::from_millis(config.query_timeout_ms));
        Self {
            query_id,
            finst_id,
            config,
            mem_tracker,
            cancelled: AtomicBool::new(false),
            cancel_reason: Mutex::new(None),
            failure: Mutex::new(None),
            deadline,
            filter_hub: RuntimeFilterHub::default(),
            cancel_obs: Arc::new(Observable::new()),
            metrics: FragmentMetrics::default(),
        }
    }

    /// Owning query id.
    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    /// This fragment instance's id.
    pub fn fragment_instance_id(&self) -> FragmentInstanceId {
        self.finst_id
    }

    /// Engine configuration with query options applied.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Target chunk size for operators that rebuild chunks.
    pub fn chunk_size(&self) -> usize {
        self.config.chunk_size
    }

    /// Fragment memory tracker.
    pub fn mem_tracker(&self) -> &Arc<MemTracker> {
        &self.mem_tracker
    }

    /// Runtime-filter hub for this fragment.
    pub fn filter_hub(&self) -> &RuntimeFilterHub {
        &self.filter_hub
    }

    /// Request cancellation with a reason; first reason wins. Parked drivers
    /// are woken through the cancel observable so they can observe the flag.
    pub fn cancel(&self, reason: impl Into<String>) {
        {
            let mut guard = self.cancel_reason.lock();
            if guard.is_none() {
                let reason = reason.into();
                tracing::debug!(finst = %self.finst_id, %reason, "fragment cancelled");
                *guard = Some(reason);
            }
        }
        self.cancelled.store(true, Ordering::Release);
        self.cancel_obs.notify();
    }

    /// Observable fired on cancellation; blocked drivers attach to it in
    /// addition to their blocking resource.
    pub fn cancel_observable(&self) -> &Arc<Observable> {
        &self.cancel_obs
    }

    /// Record a first-cause failure (e.g. a failed transmit RPC) and cancel
    /// the fragment. Later failures are dropped; the first one wins.
    pub fn fail(&self, err: EngineError) {
        let reason = err.to_string();
        {
            let mut guard = self.failure.lock();
            if guard.is_none() {
                *guard = Some(err);
            }
        }
        self.cancel(reason);
    }

    /// Take the recorded first-cause failure, if any.
    pub fn take_failure(&self) -> Option<EngineError> {
        self.failure.lock().take()
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Poll cancellation and the query deadline; called at operator boundaries
    /// and before every RPC issue.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            let reason = self
                .cancel_reason
                .lock()
                .clone()
                .unwrap_or_else(|| "fragment cancelled".to_string());
            return Err(EngineError::Cancelled(reason));
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() > deadline {
                self.cancel("query deadline exceeded");
                return Err(EngineError::Cancelled("query deadline exceeded".to_string()));
            }
        }
        Ok(())
    }
}
