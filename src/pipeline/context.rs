//! Shared run state: the state machine, the fatal error slot and the
//! verbosity broadcast.
//!
//! Only the coordinator drives state transitions (start, pause, step, stop).
//! Workers read the state through the fetch gate, which blocks on the
//! condition variable while the run is paused. The one exception is a fatal
//! error, which any thread may report; it always moves the run to `Stopping`.

use super::Metrics;
use crate::config::Verbosity;
use crate::PipelineError;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    Paused,
    /// Paused, but the fetch gate may hand out the granted step permits.
    Stepping,
    Stopping,
    Finished,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Idle => "idle",
            RunState::Running => "running",
            RunState::Paused => "paused",
            RunState::Stepping => "stepping",
            RunState::Stopping => "stopping",
            RunState::Finished => "finished",
        };
        f.write_str(name)
    }
}

/// Answer of [`RunControl::wait_for_fetch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchPermit {
    Proceed,
    Stop,
}

#[derive(Debug)]
struct ControlInner {
    state: RunState,
    step_permits: u64,
}

/// The run state behind a mutex, with a condvar for paused fetchers.
#[derive(Debug)]
pub struct RunControl {
    inner: Mutex<ControlInner>,
    changed: Condvar,
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new()
    }
}

impl RunControl {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ControlInner {
                state: RunState::Idle,
                step_permits: 0,
            }),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ControlInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> RunState {
        self.lock().state
    }

    /// `Idle` to `Running`. Any other state is left alone.
    pub fn start(&self) {
        let mut inner = self.lock();
        if inner.state == RunState::Idle {
            inner.state = RunState::Running;
            self.changed.notify_all();
        }
    }

    /// Toggle between running and paused. Returns the resulting state.
    pub fn toggle_pause(&self) -> RunState {
        let mut inner = self.lock();
        inner.state = match inner.state {
            RunState::Running => RunState::Paused,
            RunState::Paused | RunState::Stepping => {
                inner.step_permits = 0;
                RunState::Running
            }
            other => other,
        };
        self.changed.notify_all();
        inner.state
    }

    /// Allow one more record through while paused.
    ///
    /// Returns false when the run is not paused.
    pub fn step(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            RunState::Paused | RunState::Stepping => {
                inner.state = RunState::Stepping;
                inner.step_permits += 1;
                self.changed.notify_all();
                true
            }
            _ => false,
        }
    }

    /// Fall back from `Stepping` to `Paused` once every permit was used.
    pub fn finish_step(&self) -> bool {
        let mut inner = self.lock();
        if inner.state == RunState::Stepping && inner.step_permits == 0 {
            inner.state = RunState::Paused;
            true
        } else {
            false
        }
    }

    /// Ask every worker to drain. Idempotent; a finished run stays finished.
    pub fn request_stop(&self) {
        let mut inner = self.lock();
        if inner.state != RunState::Finished {
            inner.state = RunState::Stopping;
            inner.step_permits = 0;
        }
        self.changed.notify_all();
    }

    pub fn is_stopping(&self) -> bool {
        matches!(self.state(), RunState::Stopping | RunState::Finished)
    }

    pub fn finish(&self) {
        self.lock().state = RunState::Finished;
        self.changed.notify_all();
    }

    /// Block while paused (or idle). Consumes a step permit when stepping.
    pub fn wait_for_fetch(&self) -> FetchPermit {
        let mut inner = self.lock();
        loop {
            match inner.state {
                RunState::Running => return FetchPermit::Proceed,
                RunState::Stepping if inner.step_permits > 0 => {
                    inner.step_permits -= 1;
                    return FetchPermit::Proceed;
                }
                RunState::Stopping | RunState::Finished => return FetchPermit::Stop,
                RunState::Idle | RunState::Paused | RunState::Stepping => {
                    inner = self
                        .changed
                        .wait(inner)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }
}

/// Everything the gates, workers and coordinator share for one run.
#[derive(Debug)]
pub struct RunContext {
    pub control: RunControl,
    pub metrics: Arc<Metrics>,
    fatal: Mutex<Option<PipelineError>>,
    verbosity: AtomicU8,
    verbosity_epoch: AtomicU64,
}

impl RunContext {
    pub fn new(metrics: Arc<Metrics>, verbosity: Verbosity) -> Self {
        Self {
            control: RunControl::new(),
            metrics,
            fatal: Mutex::new(None),
            verbosity: AtomicU8::new(verbosity.as_u8()),
            verbosity_epoch: AtomicU64::new(0),
        }
    }

    /// Record a fatal error and start draining. Only the first error is kept.
    pub fn fail(&self, err: PipelineError) {
        let mut slot = self.fatal.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            tracing::error!("Fatal: {}", err);
            *slot = Some(err);
        } else {
            tracing::debug!("Further error while stopping: {}", err);
        }
        drop(slot);
        self.control.request_stop();
    }

    pub fn has_failed(&self) -> bool {
        self.fatal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn take_error(&self) -> Option<PipelineError> {
        self.fatal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Broadcast a new verbosity to every worker chain.
    pub fn set_verbosity(&self, level: Verbosity) {
        self.verbosity.store(level.as_u8(), Ordering::Relaxed);
        self.verbosity_epoch.fetch_add(1, Ordering::Release);
    }

    pub fn verbosity(&self) -> Verbosity {
        Verbosity::from_u8(self.verbosity.load(Ordering::Relaxed))
    }

    /// Bumped on every verbosity change; workers compare it to their last seen value.
    pub fn verbosity_epoch(&self) -> u64 {
        self.verbosity_epoch.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_pause_toggle_and_step() {
        let control = RunControl::new();
        control.start();
        assert_eq!(control.toggle_pause(), RunState::Paused);

        assert!(control.step());
        assert_eq!(control.state(), RunState::Stepping);
        assert_eq!(control.wait_for_fetch(), FetchPermit::Proceed);
        assert!(control.finish_step());
        assert_eq!(control.state(), RunState::Paused);

        assert_eq!(control.toggle_pause(), RunState::Running);
        assert!(!control.step());
    }

    #[test]
    fn test_paused_fetch_blocks_until_resumed() {
        let control = Arc::new(RunControl::new());
        control.start();
        control.toggle_pause();

        let waiter = {
            let control = Arc::clone(&control);
            thread::spawn(move || control.wait_for_fetch())
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());

        control.toggle_pause();
        assert_eq!(waiter.join().unwrap(), FetchPermit::Proceed);
    }

    #[test]
    fn test_stop_releases_paused_fetchers() {
        let control = Arc::new(RunControl::new());
        control.start();
        control.toggle_pause();

        let waiter = {
            let control = Arc::clone(&control);
            thread::spawn(move || control.wait_for_fetch())
        };
        control.request_stop();
        assert_eq!(waiter.join().unwrap(), FetchPermit::Stop);
        assert!(control.is_stopping());
    }

    #[test]
    fn test_first_error_wins() {
        let ctx = RunContext::new(Metrics::new(), Verbosity::Info);
        ctx.control.start();
        ctx.fail(PipelineError::config("first"));
        ctx.fail(PipelineError::config("second"));

        assert_eq!(ctx.control.state(), RunState::Stopping);
        let err = ctx.take_error().unwrap();
        assert!(err.to_string().contains("first"));
        assert!(!ctx.has_failed());
    }

    #[test]
    fn test_verbosity_broadcast() {
        let ctx = RunContext::new(Metrics::new(), Verbosity::Info);
        let epoch = ctx.verbosity_epoch();
        ctx.set_verbosity(Verbosity::Debug);
        assert_eq!(ctx.verbosity(), Verbosity::Debug);
        assert_ne!(ctx.verbosity_epoch(), epoch);
    }
}
