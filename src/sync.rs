// Copyright 2022 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

//! Completion signalling between transfer-complete callbacks and the
//! thread which started the transfer.
//!
//! Interrupt-driven transfers report completion by calling back into the
//! driver from a context which must not block. Each callback increments a
//! counting signal; the thread that issued the transfer blocks in
//! [`wait_for`] until it can take one unit, turning the asynchronous
//! completion back into a synchronous call.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use crate::command::Direction;
use crate::{Error, Result};

/// Counting wait primitive, as provided by an RTOS or the host OS.
pub trait WaitSignal: Send + Sync {
    /// Add one unit. Must not block; may be called from interrupt context.
    fn signal(&self);

    /// Block for up to `timeout` waiting for a unit.
    ///
    /// Returns true if a unit was taken, or false on timeout, in which
    /// case the count is unchanged.
    fn wait(&self, timeout: Duration) -> bool;

    /// Take every available unit without blocking, returning how many were taken.
    fn drain(&self) -> usize {
        let mut taken = 0;
        while self.wait(Duration::from_secs(0)) {
            taken += 1;
        }
        taken
    }
}

/// Creates a fresh signal with a count of zero.
pub type SignalFactory = fn() -> Arc<dyn WaitSignal>;

/// Default [`SignalFactory`], creating a [`Semaphore`].
pub fn semaphore() -> Arc<dyn WaitSignal> {
    Arc::new(Semaphore::new(0))
}

/// Counting semaphore built on a mutex and condition variable.
#[derive(Debug, Default)]
pub struct Semaphore {
    count: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    pub fn new(initial: usize) -> Self {
        Semaphore { count: Mutex::new(initial), available: Condvar::new() }
    }

    /// Current number of units available.
    pub fn count(&self) -> usize {
        *self.lock()
    }

    // Nothing here can leave the count inconsistent, so a poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, usize> {
        self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl WaitSignal for Semaphore {
    fn signal(&self) {
        *self.lock() += 1;
        self.available.notify_one();
    }

    fn wait(&self, timeout: Duration) -> bool {
        let guard = self.lock();
        let (mut count, _) = self.available
            .wait_timeout_while(guard, timeout, |count| *count == 0)
            .unwrap_or_else(PoisonError::into_inner);
        if *count > 0 {
            *count -= 1;
            true
        } else {
            false
        }
    }

    fn drain(&self) -> usize {
        std::mem::replace(&mut *self.lock(), 0)
    }
}

/// Block until `signal` is raised for a `direction` transfer or `timeout` elapses.
///
/// On success exactly one unit is consumed.
pub fn wait_for(signal: &dyn WaitSignal, direction: Direction, timeout: Duration) -> Result<()> {
    let t0 = Instant::now();
    if signal.wait(timeout) {
        log::trace!("{} completion after {:?}", direction, t0.elapsed());
        Ok(())
    } else {
        log::error!("No {} completion within {:?}", direction, timeout);
        Err(Error::TransferTimeout(direction))
    }
}

/// Handle given to the link so its completion interrupts can wake the driver.
#[derive(Clone)]
pub struct CompletionCallbacks {
    rx: Arc<dyn WaitSignal>,
    tx: Arc<dyn WaitSignal>,
}

impl CompletionCallbacks {
    /// An asynchronous receive has finished.
    pub fn on_receive_complete(&self) {
        self.rx.signal();
    }

    /// An asynchronous transmit has finished.
    pub fn on_transmit_complete(&self) {
        self.tx.signal();
    }
}

impl fmt::Debug for CompletionCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("CompletionCallbacks")
    }
}

/// Long-lived driver state: one completion signal per transfer direction.
///
/// Created once the chip has been brought up, and kept until the driver
/// is deinitialised.
pub struct DriverState {
    rx: Arc<dyn WaitSignal>,
    tx: Arc<dyn WaitSignal>,
}

impl DriverState {
    pub fn new(factory: SignalFactory) -> Self {
        DriverState { rx: factory(), tx: factory() }
    }

    /// Callbacks for the link to invoke on transfer completion.
    pub fn callbacks(&self) -> CompletionCallbacks {
        CompletionCallbacks { rx: self.rx.clone(), tx: self.tx.clone() }
    }

    /// Wait for the completion of a transfer in `direction`.
    pub fn wait_for(&self, direction: Direction, timeout: Duration) -> Result<()> {
        wait_for(self.signal(direction), direction, timeout)
    }

    /// Discard completions left over from earlier transfers in `direction`
    /// whose wait already timed out.
    ///
    /// Must be called before starting a transfer, so that only its own
    /// completion can end the following `wait_for()`.
    pub fn drain(&self, direction: Direction) -> usize {
        let stale = self.signal(direction).drain();
        if stale > 0 {
            log::warn!("Discarded {} late {} completion(s)", stale, direction);
        }
        stale
    }

    fn signal(&self, direction: Direction) -> &dyn WaitSignal {
        match direction {
            Direction::Receive => self.rx.as_ref(),
            Direction::Transmit => self.tx.as_ref(),
        }
    }
}

#[test]
fn test_semaphore_counts() {
    let sem = Semaphore::new(0);
    sem.signal();
    sem.signal();
    assert_eq!(sem.count(), 2);
    assert!(sem.wait(Duration::from_millis(1)));
    assert_eq!(sem.count(), 1);
    assert!(sem.wait(Duration::from_millis(1)));
    assert!(!sem.wait(Duration::from_millis(1)));
    assert_eq!(sem.count(), 0);
}

#[test]
fn test_wait_for_times_out() {
    let sem = Semaphore::new(0);
    let t0 = Instant::now();
    let result = wait_for(&sem, Direction::Receive, Duration::from_millis(20));
    assert!(matches!(result, Err(Error::TransferTimeout(Direction::Receive))));
    assert!(t0.elapsed() >= Duration::from_millis(20));
    assert!(t0.elapsed() < Duration::from_secs(5));
    assert_eq!(sem.count(), 0);
}

#[test]
fn test_signal_from_other_thread() {
    let state = DriverState::new(semaphore);
    let callbacks = state.callbacks();
    let handle = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(10));
        callbacks.on_transmit_complete();
    });
    assert!(state.wait_for(Direction::Transmit, Duration::from_secs(5)).is_ok());
    handle.join().unwrap();
    // The unit was consumed, so a second wait times out.
    assert!(state.wait_for(Direction::Transmit, Duration::from_millis(1)).is_err());
}

#[test]
fn test_drain_discards_late_completions() {
    let state = DriverState::new(semaphore);
    // Completions for two transfers whose waits already gave up.
    state.callbacks().on_receive_complete();
    state.callbacks().on_receive_complete();
    state.callbacks().on_transmit_complete();
    assert_eq!(state.drain(Direction::Receive), 2);
    assert!(state.wait_for(Direction::Receive, Duration::from_millis(1)).is_err());
    // The other direction is untouched.
    assert!(state.wait_for(Direction::Transmit, Duration::from_millis(1)).is_ok());
    assert_eq!(state.drain(Direction::Transmit), 0);
}

#[test]
fn test_default_drain_uses_wait() {
    struct Counter(Mutex<usize>);
    impl WaitSignal for Counter {
        fn signal(&self) {
            *self.0.lock().unwrap() += 1;
        }
        fn wait(&self, _timeout: Duration) -> bool {
            let mut count = self.0.lock().unwrap();
            if *count > 0 {
                *count -= 1;
                true
            } else {
                false
            }
        }
    }
    let counter = Counter(Mutex::new(0));
    counter.signal();
    counter.signal();
    assert_eq!(counter.drain(), 2);
    assert!(!counter.wait(Duration::from_millis(1)));
}

#[test]
fn test_callbacks_route_by_direction() {
    let state = DriverState::new(semaphore);
    state.callbacks().on_receive_complete();
    assert!(state.wait_for(Direction::Transmit, Duration::from_millis(1)).is_err());
    assert!(state.wait_for(Direction::Receive, Duration::from_millis(1)).is_ok());
}
