//! Execution environment and query/fragment contexts.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use basalt_common::{EngineConfig, EngineError, FragmentInstanceId, MemTracker, QueryId, Result};
use basalt_exchange::{ExchangeServiceImpl, ExchangeServiceServer, ReceiverRegistry};
use basalt_exec::op::ResultSinkHandle;
use basalt_exec::source::TableProvider;
use basalt_exec::{DriverExecutor, RuntimeState};

/// Process-wide execution environment of one worker.
///
/// Owns the driver pool, the RPC runtime serving and issuing transmits, the
/// receiver registry, the storage-provider registry and the root memory
/// tracker.
pub struct ExecEnv {
    config: EngineConfig,
    driver_executor: Arc<DriverExecutor>,
    rpc_runtime: tokio::runtime::Runtime,
    receiver_registry: Arc<ReceiverRegistry>,
    providers: Mutex<HashMap<String, Arc<dyn TableProvider>>>,
    pool_tracker: Arc<MemTracker>,
    query_trackers: Mutex<HashMap<QueryId, Weak<MemTracker>>>,
}

impl ExecEnv {
    /// Build an environment from configuration.
    pub fn new(config: EngineConfig) -> Result<Arc<Self>> {
        let driver_executor = DriverExecutor::new(
            config.driver_worker_threads,
            Duration::from_millis(config.driver_time_slice_ms.max(1)),
        );
        let rpc_runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("basalt-rpc")
            .enable_all()
            .build()?;
        Ok(Arc::new(Self {
            driver_executor,
            rpc_runtime,
            receiver_registry: ReceiverRegistry::new(),
            providers: Mutex::new(HashMap::new()),
            pool_tracker: MemTracker::root("process", None),
            query_trackers: Mutex::new(HashMap::new()),
            config,
        }))
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The driver dispatcher.
    pub fn driver_executor(&self) -> &Arc<DriverExecutor> {
        &self.driver_executor
    }

    /// Handle for spawning RPC and timer tasks.
    pub fn rpc_handle(&self) -> tokio::runtime::Handle {
        self.rpc_runtime.handle().clone()
    }

    /// The exchange receiver registry.
    pub fn receiver_registry(&self) -> &Arc<ReceiverRegistry> {
        &self.receiver_registry
    }

    /// Register a storage provider under a table name.
    pub fn register_table(&self, name: impl Into<String>, provider: Arc<dyn TableProvider>) {
        self.providers.lock().insert(name.into(), provider);
    }

    /// Resolve a table's provider.
    pub fn provider(&self, name: &str) -> Result<Arc<dyn TableProvider>> {
        self.providers.lock().get(name).cloned().ok_or_else(|| {
            EngineError::InvalidArgument(format!("no provider registered for table {name}"))
        })
    }

    /// Memory tracker of one query, created under the process pool on first
    /// use and shared by the query's fragments.
    pub fn query_tracker(&self, query_id: QueryId) -> Arc<MemTracker> {
        let mut trackers = self.query_trackers.lock();
        trackers.retain(|_, w| w.strong_count() > 0);
        if let Some(existing) = trackers.get(&query_id).and_then(Weak::upgrade) {
            return existing;
        }
        let tracker = MemTracker::child(&self.pool_tracker, format!("query-{query_id}"), None);
        trackers.insert(query_id, Arc::downgrade(&tracker));
        tracker
    }

    /// Serve the exchange endpoint, returning the bound address.
    pub fn start_exchange_service(&self, addr: SocketAddr) -> Result<SocketAddr> {
        let registry = Arc::clone(&self.receiver_registry);
        let listener = self
            .rpc_runtime
            .block_on(tokio::net::TcpListener::bind(addr))?;
        let bound = listener.local_addr()?;
        self.rpc_runtime.spawn(async move {
            let incoming = tokio_stream::wrappers::TcpListenerStream::new(listener);
            let service = ExchangeServiceServer::new(ExchangeServiceImpl::new(registry));
            if let Err(e) = tonic::transport::Server::builder()
                .add_service(service)
                .serve_with_incoming(incoming)
                .await
            {
                tracing::error!(error = %e, "exchange service terminated");
            }
        });
        tracing::debug!(%bound, "exchange service listening");
        Ok(bound)
    }
}

/// One fragment instance's lifecycle: driver accounting, first-error
/// latching, completion signaling and receiver cleanup.
pub struct FragmentContext {
    finst_id: FragmentInstanceId,
    runtime_state: Arc<RuntimeState>,
    receiver_registry: Arc<ReceiverRegistry>,
    drivers_remaining: AtomicUsize,
    first_error: Mutex<Option<EngineError>>,
    done: Mutex<bool>,
    done_cv: Condvar,
    result: Option<Arc<ResultSinkHandle>>,
}

impl FragmentContext {
    pub(crate) fn new(
        finst_id: FragmentInstanceId,
        runtime_state: Arc<RuntimeState>,
        receiver_registry: Arc<ReceiverRegistry>,
        driver_count: usize,
        result: Option<Arc<ResultSinkHandle>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            finst_id,
            runtime_state,
            receiver_registry,
            drivers_remaining: AtomicUsize::new(driver_count),
            first_error: Mutex::new(None),
            done: Mutex::new(false),
            done_cv: Condvar::new(),
            result,
        })
    }

    /// This fragment instance's id.
    pub fn fragment_instance_id(&self) -> FragmentInstanceId {
        self.finst_id
    }

    /// The fragment's runtime state.
    pub fn runtime_state(&self) -> &Arc<RuntimeState> {
        &self.runtime_state
    }

    /// The result-sink handle of a result fragment.
    pub fn result_handle(&self) -> Option<&Arc<ResultSinkHandle>> {
        self.result.as_ref()
    }

    /// Request fragment cancellation.
    pub fn cancel(&self, reason: impl Into<String>) {
        self.runtime_state.cancel(reason);
    }

    /// Driver completion callback: latch the first real error, cancel peers,
    /// and signal once every driver finished.
    pub(crate) fn on_driver_finished(&self, result: Result<()>) {
        if let Err(err) = result {
            if !err.is_cancelled() {
                let mut first = self.first_error.lock();
                if first.is_none() {
                    self.runtime_state.cancel(err.to_string());
                    *first = Some(err);
                } else {
                    tracing::debug!(finst = %self.finst_id, error = %err, "concurrent driver error");
                }
            }
        }
        if self.drivers_remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.receiver_registry.deregister_instance(self.finst_id);
            if let Some(handle) = &self.result {
                if self.first_error.lock().is_some() || self.runtime_state.is_cancelled() {
                    handle.fail();
                }
            }
            *self.done.lock() = true;
            self.done_cv.notify_all();
        }
    }

    /// Whether every driver finished.
    pub fn is_done(&self) -> bool {
        *self.done.lock()
    }

    /// Wait for completion and surface the fragment's final status: the
    /// first driver error, else a failure recorded by the exchange layer,
    /// else cancellation, else success.
    pub fn wait_finished(&self, timeout: Duration) -> Result<()> {
        let deadline = std::time::Instant::now() + timeout;
        {
            let mut done = self.done.lock();
            while !*done {
                if self.done_cv.wait_until(&mut done, deadline).timed_out() {
                    return Err(EngineError::Internal(format!(
                        "fragment {} did not finish within {timeout:?}",
                        self.finst_id
                    )));
                }
            }
        }
        if let Some(err) = self.first_error.lock().take() {
            return Err(err);
        }
        if let Some(err) = self.runtime_state.take_failure() {
            return Err(err);
        }
        self.runtime_state.check_cancelled()
    }
}
