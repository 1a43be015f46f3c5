use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, error, warn};

use crate::error::{PipelineError, Result};

/// Cooperative cancellation flag shared between the run worker and the
/// thread that started it. Cloning shares the same flag. One token per run,
/// reset only at run start.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear the flag for a new run.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    /// Request cancellation. Callable from any thread.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Raise-point form: error out of the current call stack if cancelled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Lifecycle of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunState {
    #[default]
    Idle,
    Running,
    Stopping,
    Error,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunState::Idle => "idle",
            RunState::Running => "running",
            RunState::Stopping => "stopping",
            RunState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Transitions accepted by the state machine. Everything else is rejected.
fn is_valid_transition(from: RunState, to: RunState) -> bool {
    matches!(
        (from, to),
        (RunState::Idle, RunState::Running)
            | (RunState::Running, RunState::Stopping)
            | (RunState::Running, RunState::Idle)
            | (RunState::Running, RunState::Error)
            | (RunState::Stopping, RunState::Idle)
            | (RunState::Error, RunState::Idle)
    )
}

type TransitionCallback = Arc<dyn Fn(RunState, RunState) + Send + Sync>;

struct StateInner {
    current: RunState,
    callbacks: Vec<TransitionCallback>,
}

/// Validated run-state machine with synchronous transition callbacks.
///
/// One coarse mutex guards both the state and the callback list. Callbacks
/// fire synchronously on accepted transitions with `(old, new)`, after the
/// lock is released, so a callback may safely re-enter the manager. A
/// panicking callback is caught and logged rather than propagated.
pub struct StateManager {
    inner: Mutex<StateInner>,
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}

impl StateManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StateInner {
                current: RunState::Idle,
                callbacks: Vec::new(),
            }),
        }
    }

    pub fn current(&self) -> RunState {
        self.inner.lock().expect("state lock poisoned").current
    }

    pub fn is_state(&self, state: RunState) -> bool {
        self.current() == state
    }

    /// A new run may start only from Idle.
    pub fn can_run(&self) -> bool {
        self.is_state(RunState::Idle)
    }

    /// Stop only makes sense while Running.
    pub fn can_stop(&self) -> bool {
        self.is_state(RunState::Running)
    }

    /// Attempt a transition. Returns `false` (and leaves the state
    /// untouched) when the transition is not in the table.
    pub fn transition_to(&self, new_state: RunState) -> bool {
        let (old_state, callbacks) = {
            let mut inner = self.inner.lock().expect("state lock poisoned");
            let old_state = inner.current;
            if old_state == new_state {
                return false;
            }
            if !is_valid_transition(old_state, new_state) {
                warn!("rejected state transition {} -> {}", old_state, new_state);
                return false;
            }
            inner.current = new_state;
            (old_state, inner.callbacks.clone())
        };
        debug!("state transition {} -> {}", old_state, new_state);
        for callback in &callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(old_state, new_state))).is_err() {
                error!(
                    "state callback panicked during {} -> {}",
                    old_state, new_state
                );
            }
        }
        true
    }

    /// Register a callback fired synchronously on every accepted transition.
    pub fn on_transition<F>(&self, callback: F)
    where
        F: Fn(RunState, RunState) + Send + Sync + 'static,
    {
        self.inner
            .lock()
            .expect("state lock poisoned")
            .callbacks
            .push(Arc::new(callback));
    }
}
