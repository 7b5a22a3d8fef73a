//! The single backpressure flag shared by both sides of a pipeline

use std::sync::{Mutex, MutexGuard, PoisonError};

use futures::channel::oneshot;
use futures::future::{FutureExt, Shared};
use tracing::trace;

/// Settles the next time the backpressure flag changes
///
/// Any number of parties may await clones of it. Settling carries no value:
/// awaiters must read the flag again afterwards, since it may have changed
/// more than once in the meantime.
pub type BackpressureChange = Shared<oneshot::Receiver<()>>;

struct SignalInner {
    backpressure: bool,
    change: BackpressureChange,
    trigger: oneshot::Sender<()>,
}

/// A boolean flag paired with a future that settles when it next changes
///
/// Exactly one pending change future exists at any time. Every flip settles
/// it and installs a fresh one in the same step.
pub struct BackpressureSignal {
    inner: Mutex<SignalInner>,
}

impl BackpressureSignal {
    /// Create a signal with the given initial value
    pub fn new(backpressure: bool) -> Self {
        let (trigger, receiver) = oneshot::channel();
        Self {
            inner: Mutex::new(SignalInner {
                backpressure,
                change: receiver.shared(),
                trigger,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SignalInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current value of the flag
    pub fn is_set(&self) -> bool {
        self.lock().backpressure
    }

    /// Future for the next change
    pub fn changed(&self) -> BackpressureChange {
        self.lock().change.clone()
    }

    /// Current value together with the future for the next change
    pub fn snapshot(&self) -> (bool, BackpressureChange) {
        let inner = self.lock();
        (inner.backpressure, inner.change.clone())
    }

    /// Flip the flag to `backpressure`
    ///
    /// Setting the value the flag already holds is a caller bug.
    pub fn set(&self, backpressure: bool) {
        self.transition(backpressure);
    }

    /// Flip the flag only if it differs from `backpressure`
    ///
    /// Returns whether the flag changed. Used by fatal-error paths, which may
    /// find the flag already clear.
    pub fn update(&self, backpressure: bool) -> bool {
        self.flip(backpressure).1
    }

    /// Clear the flag and return the future for its next change, atomically
    ///
    /// The flag must be set.
    pub fn release(&self) -> BackpressureChange {
        self.transition(false)
    }

    fn transition(&self, backpressure: bool) -> BackpressureChange {
        let (change, flipped) = self.flip(backpressure);
        debug_assert!(
            flipped,
            "backpressure flag set to the value it already holds"
        );
        change
    }

    fn flip(&self, backpressure: bool) -> (BackpressureChange, bool) {
        let mut inner = self.lock();
        if inner.backpressure == backpressure {
            return (inner.change.clone(), false);
        }

        let (trigger, receiver) = oneshot::channel();
        let previous = std::mem::replace(&mut inner.trigger, trigger);
        inner.change = receiver.shared();
        inner.backpressure = backpressure;
        let change = inner.change.clone();
        drop(inner);

        // Nobody waiting on the old future is not an error
        let _ = previous.send(());
        trace!(backpressure, "backpressure changed");
        (change, true)
    }
}
