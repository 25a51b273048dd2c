//! Cooperative driver dispatcher: a bounded worker pool over a shared
//! ready-queue.
//!
//! Workers pop drivers, run one time slice, and either requeue, drop
//! (finished) or park them. A parked driver re-enters the queue only when
//! its blocking resource fires its observable (or the fragment's cancel
//! observable), never by polling. The version handshake in
//! [`crate::observer::Observable`] closes the park/notify race.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::driver::{Driver, DriverYield};

struct ExecutorShared {
    queue: Mutex<std::collections::VecDeque<Box<Driver>>>,
    queue_cv: Condvar,
    parked: Mutex<HashMap<u64, Box<Driver>>>,
    shutdown: AtomicBool,
    next_driver_id: AtomicU64,
    time_slice: Duration,
}

impl ExecutorShared {
    fn enqueue(&self, driver: Box<Driver>) {
        self.queue.lock().push_back(driver);
        self.queue_cv.notify_one();
    }

    fn wake_parked(&self, driver_id: u64) {
        if let Some(driver) = self.parked.lock().remove(&driver_id) {
            self.enqueue(driver);
        }
    }
}

/// Bounded worker pool executing pipeline drivers cooperatively.
pub struct DriverExecutor {
    shared: Arc<ExecutorShared>,
    workers: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl DriverExecutor {
    /// Start `threads` workers with the given per-slice run budget.
    pub fn new(threads: usize, time_slice: Duration) -> Arc<Self> {
        let shared = Arc::new(ExecutorShared {
            queue: Mutex::new(std::collections::VecDeque::new()),
            queue_cv: Condvar::new(),
            parked: Mutex::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
            next_driver_id: AtomicU64::new(1),
            time_slice,
        });
        let executor = Arc::new(Self {
            shared: Arc::clone(&shared),
            workers: Mutex::new(Vec::new()),
        });
        let mut workers = executor.workers.lock();
        for i in 0..threads.max(1) {
            let shared = Arc::clone(&shared);
            workers.push(
                std::thread::Builder::new()
                    .name(format!("basalt-driver-{i}"))
                    .spawn(move || worker_loop(shared))
                    .expect("spawn driver worker"),
            );
        }
        drop(workers);
        executor
    }

    /// Submit one driver for execution.
    pub fn submit(&self, mut driver: Driver) {
        driver.id = self.shared.next_driver_id.fetch_add(1, Ordering::Relaxed);
        self.shared.enqueue(Box::new(driver));
    }

    /// Drivers currently parked (diagnostics).
    pub fn parked_count(&self) -> usize {
        self.shared.parked.lock().len()
    }

    /// Stop workers and drop queued/parked drivers. Fragments must be
    /// cancelled first so their completion callbacks have fired or will
    /// fire through driver teardown.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.queue_cv.notify_all();
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            let _ = handle.join();
        }
        self.shared.queue.lock().clear();
        self.shared.parked.lock().clear();
    }
}

impl Drop for DriverExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<ExecutorShared>) {
    loop {
        let mut driver = {
            let mut queue = shared.queue.lock();
            loop {
                if shared.shutdown.load(Ordering::Acquire) {
                    return;
                }
                if let Some(driver) = queue.pop_front() {
                    break driver;
                }
                shared.queue_cv.wait(&mut queue);
            }
        };

        match driver.process(shared.time_slice) {
            DriverYield::Ready => shared.enqueue(driver),
            DriverYield::Finished => drop(driver),
            DriverYield::Blocked {
                observable,
                version,
                cancel_version,
                ..
            } => {
                let id = driver.id;
                let cancel_obs = driver.cancel_observable();
                shared.parked.lock().insert(id, driver);

                let weak = Arc::downgrade(&shared);
                let armed = observable.attach(version, waker(weak.clone(), id));
                let cancel_armed = cancel_obs.attach(cancel_version, waker(weak, id));
                if !armed || !cancel_armed {
                    // The resource (or cancellation) advanced while parking.
                    shared.wake_parked(id);
                }
            }
        }
    }
}

fn waker(shared: Weak<ExecutorShared>, driver_id: u64) -> Box<dyn FnOnce() + Send> {
    Box::new(move || {
        if let Some(shared) = shared.upgrade() {
            shared.wake_parked(driver_id);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local_exchange::{
        LocalExchangeMode, LocalExchangeSinkFactory, LocalExchangeSourceFactory, LocalExchanger,
    };
    use crate::op::{OperatorFactory, ResultSinkHandle, ResultSinkOperatorFactory};
    use crate::source::{MemoryTable, Morsel, ScanOperatorFactory};
    use crate::state::RuntimeState;
    use basalt_chunk::{Chunk, Column, Datum};
    use basalt_common::{EngineConfig, FragmentInstanceId, MemTracker, PlanNodeId, QueryId, SlotId};
    use std::sync::mpsc;

    fn runtime_state() -> Arc<RuntimeState> {
        Arc::new(RuntimeState::new(
            QueryId { hi: 0, lo: 1 },
            FragmentInstanceId { hi: 0, lo: 2 },
            EngineConfig {
                chunk_size: 4,
                ..EngineConfig::default()
            },
            MemTracker::root("test", None),
        ))
    }

    #[test]
    fn scan_to_result_pipeline_runs_to_completion() {
        let state = runtime_state();
        let executor = DriverExecutor::new(2, Duration::from_millis(50));
        let table = MemoryTable::new().with_tablet(
            0,
            Chunk::from_columns(vec![(SlotId(0), Column::int64(&[1, 2, 3, 4, 5, 6, 7]))])
                .unwrap(),
        );
        let scan = ScanOperatorFactory::new(
            PlanNodeId(1),
            vec![Morsel {
                plan_node_id: PlanNodeId(1),
                table: "t".to_string(),
                tablet_id: 0,
                begin_row: 0,
                end_row: 7,
            }],
            Arc::new(table),
            vec![],
        );
        let handle = ResultSinkHandle::new(8);
        let sink = ResultSinkOperatorFactory::new(PlanNodeId(2), Arc::clone(&handle));

        let (tx, rx) = mpsc::channel();
        let mut driver = crate::driver::Driver::new(
            vec![scan.create(1, 0).unwrap(), sink.create(1, 0).unwrap()],
            Arc::clone(&state),
            Box::new(move |r| {
                let _ = tx.send(r.is_ok());
            }),
        );
        driver.prepare().unwrap();
        executor.submit(driver);

        let mut rows = 0;
        while let Some(chunk) = handle.pull(Duration::from_secs(2)) {
            rows += chunk.num_rows();
        }
        assert_eq!(rows, 7);
        assert!(rx.recv_timeout(Duration::from_secs(2)).unwrap());
        executor.shutdown();
    }

    #[test]
    fn blocked_driver_wakes_on_upstream_signal() {
        let state = runtime_state();
        let executor = DriverExecutor::new(2, Duration::from_millis(20));

        // Consumer pipeline reads from a local exchange fed later. The
        // feeder registers as a sender first so the source cannot finish
        // before data arrives.
        let exchanger = LocalExchanger::new(LocalExchangeMode::Passthrough, 1, 8);
        let sink_factory = LocalExchangeSinkFactory::new(PlanNodeId(1), Arc::clone(&exchanger));
        let mut feeder = sink_factory.create(1, 0).unwrap();
        feeder.prepare(&state).unwrap();

        let source = LocalExchangeSourceFactory::new(PlanNodeId(1), Arc::clone(&exchanger));
        let handle = ResultSinkHandle::new(8);
        let sink = ResultSinkOperatorFactory::new(PlanNodeId(2), Arc::clone(&handle));
        let mut consumer = crate::driver::Driver::new(
            vec![source.create(1, 0).unwrap(), sink.create(1, 0).unwrap()],
            Arc::clone(&state),
            Box::new(|_| {}),
        );
        consumer.prepare().unwrap();
        executor.submit(consumer);

        // Give the consumer time to park on the empty queue.
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(executor.parked_count(), 1);

        feeder
            .push_chunk(
                &state,
                Chunk::from_columns(vec![(SlotId(0), Column::int64(&[42]))]).unwrap(),
            )
            .unwrap();
        feeder.set_finishing(&state).unwrap();

        let chunk = handle.pull(Duration::from_secs(2)).expect("woken driver output");
        assert_eq!(chunk.column(0).get(0), Datum::Int64(42));
        executor.shutdown();
    }

    #[test]
    fn cancellation_wakes_and_finishes_parked_drivers() {
        let state = runtime_state();
        let executor = DriverExecutor::new(1, Duration::from_millis(20));
        let exchanger = LocalExchanger::new(LocalExchangeMode::Passthrough, 1, 8);
        // Keep a sender open so the source can never finish on its own.
        let sink_factory = LocalExchangeSinkFactory::new(PlanNodeId(1), Arc::clone(&exchanger));
        let mut pinned_sender = sink_factory.create(1, 0).unwrap();
        pinned_sender.prepare(&state).unwrap();

        let source = LocalExchangeSourceFactory::new(PlanNodeId(1), Arc::clone(&exchanger));
        let handle = ResultSinkHandle::new(8);
        let sink = ResultSinkOperatorFactory::new(PlanNodeId(2), Arc::clone(&handle));
        let (tx, rx) = mpsc::channel();
        let mut driver = crate::driver::Driver::new(
            vec![source.create(1, 0).unwrap(), sink.create(1, 0).unwrap()],
            Arc::clone(&state),
            Box::new(move |r| {
                let _ = tx.send(r);
            }),
        );
        driver.prepare().unwrap();
        executor.submit(driver);

        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(executor.parked_count(), 1);
        state.cancel("test cancel");

        let result = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(matches!(
            result,
            Err(basalt_common::EngineError::Cancelled(_))
        ));
        executor.shutdown();
    }
}
