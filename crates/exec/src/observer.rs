//! Wake signaling between blocking resources and parked drivers.
//!
//! A blocked driver never polls: it records the observable's version before
//! deciding to park, then attaches a waker against that version. If the
//! resource advanced in between, the attach fails and the driver re-queues
//! immediately, so no wake-up can be lost.

use parking_lot::Mutex;

/// Callback re-queuing one parked driver.
pub type Waker = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct ObservableState {
    version: u64,
    waiters: Vec<Waker>,
}

/// Versioned notification source owned by a blocking resource
/// (exchange queue, sink buffer, build barrier).
#[derive(Default)]
pub struct Observable {
    state: Mutex<ObservableState>,
}

impl Observable {
    /// Create a fresh observable.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current version; sampled before checking the guarded condition.
    pub fn version(&self) -> u64 {
        self.state.lock().version
    }

    /// Advance the version and fire all pending wakers.
    pub fn notify(&self) {
        let waiters = {
            let mut s = self.state.lock();
            s.version += 1;
            std::mem::take(&mut s.waiters)
        };
        for w in waiters {
            w();
        }
    }

    /// Attach a waker bound to `observed_version`.
    ///
    /// Returns false (without keeping the waker) when the observable already
    /// advanced past the observed version; the caller must not park.
    pub fn attach(&self, observed_version: u64, waker: Waker) -> bool {
        let mut s = self.state.lock();
        if s.version != observed_version {
            return false;
        }
        s.waiters.push(waker);
        true
    }
}

impl std::fmt::Debug for Observable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.state.lock();
        f.debug_struct("Observable")
            .field("version", &s.version)
            .field("waiters", &s.waiters.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn attach_fails_after_missed_notify() {
        let obs = Observable::new();
        let v = obs.version();
        obs.notify();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        assert!(!obs.attach(v, Box::new(move || {
            f.fetch_add(1, Ordering::SeqCst);
        })));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn notify_fires_attached_wakers_once() {
        let obs = Observable::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        let v = obs.version();
        assert!(obs.attach(v, Box::new(move || {
            f.fetch_add(1, Ordering::SeqCst);
        })));
        obs.notify();
        obs.notify();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
