use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::PipelineError;
use crate::state::{CancelToken, RunState, StateManager};
use crate::types::RunReport;

const LOG_CHANNEL_CAPACITY: usize = 256;
const SUBPROCESS_KILL_GRACE: Duration = Duration::from_secs(5);
const WORKER_JOIN_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// One log line destined for the initiating thread's display.
#[derive(Debug, Clone)]
pub struct LogMessage {
    pub message: String,
    pub level: LogLevel,
    pub timestamp: DateTime<Utc>,
}

impl LogMessage {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            level,
            timestamp: Utc::now(),
        }
    }
}

type RunOutcome = std::result::Result<RunReport, String>;
type SharedChild = Arc<tokio::sync::Mutex<Option<Child>>>;

/// Runs one pipeline at a time on a spawned task, bridging it to the
/// initiating thread through a bounded log channel and the shared state
/// machine.
///
/// The worker owns all network and file I/O; the initiator only calls
/// `poll_logs` on its own tick and reads state through callbacks. Every
/// worker path ends in Idle or Error. When the channel is full, new log
/// lines are dropped rather than blocking the worker.
pub struct PipelineController {
    state: Arc<StateManager>,
    token: CancelToken,
    log_tx: mpsc::Sender<LogMessage>,
    log_rx: Mutex<mpsc::Receiver<LogMessage>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    subprocess: SharedChild,
    result: Arc<Mutex<Option<RunOutcome>>>,
}

impl Default for PipelineController {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineController {
    pub fn new() -> Self {
        let (log_tx, log_rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);
        Self {
            state: Arc::new(StateManager::new()),
            token: CancelToken::new(),
            log_tx,
            log_rx: Mutex::new(log_rx),
            worker: Mutex::new(None),
            subprocess: Arc::new(tokio::sync::Mutex::new(None)),
            result: Arc::new(Mutex::new(None)),
        }
    }

    pub fn state(&self) -> &Arc<StateManager> {
        &self.state
    }

    pub fn token(&self) -> CancelToken {
        self.token.clone()
    }

    /// Shared slot the video assembler registers its child process in so
    /// `stop` can terminate it.
    pub fn subprocess_slot(&self) -> SharedChild {
        Arc::clone(&self.subprocess)
    }

    pub fn is_running(&self) -> bool {
        self.state.is_state(RunState::Running)
    }

    pub fn is_stopping(&self) -> bool {
        self.state.is_state(RunState::Stopping)
    }

    /// Start a run. The closure receives the (freshly reset) cancel token
    /// and returns the future the worker drives. Rejected (returns `false`,
    /// nothing spawned) unless the state machine is Idle.
    pub fn start<F, Fut>(&self, run: F) -> bool
    where
        F: FnOnce(CancelToken) -> Fut,
        Fut: Future<Output = crate::error::Result<RunReport>> + Send + 'static,
    {
        if !self.state.transition_to(RunState::Running) {
            warn!("start rejected: a run is already active");
            return false;
        }
        self.token.reset();
        *self.result.lock().expect("result lock poisoned") = None;

        let future = run(self.token.clone());
        let state = Arc::clone(&self.state);
        let result_slot = Arc::clone(&self.result);
        let log_tx = self.log_tx.clone();

        let handle = tokio::spawn(async move {
            let outcome = match future.await {
                Ok(report) => {
                    info!(
                        "run finished with {} image chain(s)",
                        report.summary.len()
                    );
                    Ok(report)
                }
                Err(PipelineError::Cancelled) => {
                    info!("run cancelled");
                    Err(PipelineError::Cancelled.to_string())
                }
                Err(e) => {
                    error!("run failed: {}", e);
                    let _ = log_tx.try_send(LogMessage::new(
                        LogLevel::Error,
                        format!("pipeline failed: {}", e),
                    ));
                    Err(e.to_string())
                }
            };

            let failed =
                matches!(&outcome, Err(msg) if msg != &PipelineError::Cancelled.to_string());
            *result_slot.lock().expect("result lock poisoned") = Some(outcome);

            if failed {
                if !state.transition_to(RunState::Error) {
                    // Stop raced with the failure; finish the stop cleanly.
                    state.transition_to(RunState::Idle);
                }
            } else {
                // Covers both Running -> Idle (success) and the
                // Stopping -> Idle cleanup path after a cancel.
                state.transition_to(RunState::Idle);
            }
        });
        *self.worker.lock().expect("worker lock poisoned") = Some(handle);
        true
    }

    /// Request cancellation of the active run: flip the token, terminate
    /// any registered subprocess with a bounded grace period, and wait
    /// (bounded) for the worker to wind down. Returns `false` when no run
    /// is active.
    pub async fn stop(&self) -> bool {
        if !self.state.transition_to(RunState::Stopping) {
            warn!("stop rejected: no run is active");
            return false;
        }
        self.token.cancel();
        self.log(LogLevel::Info, "stop requested; cancelling run");

        self.kill_subprocess().await;

        let handle = self.worker.lock().expect("worker lock poisoned").take();
        if let Some(handle) = handle {
            match tokio::time::timeout(WORKER_JOIN_GRACE, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("worker task panicked: {}", e),
                Err(_) => warn!("worker did not exit within the grace period"),
            }
        }
        // The worker normally completes this transition itself; this is the
        // fallback when it timed out or was already gone.
        self.state.transition_to(RunState::Idle);
        true
    }

    async fn kill_subprocess(&self) {
        let mut slot = self.subprocess.lock().await;
        if let Some(child) = slot.as_mut() {
            info!("terminating registered subprocess");
            if let Err(e) = child.start_kill() {
                warn!("could not signal subprocess: {}", e);
            }
            match tokio::time::timeout(SUBPROCESS_KILL_GRACE, child.wait()).await {
                Ok(Ok(status)) => info!("subprocess exited with {}", status),
                Ok(Err(e)) => warn!("error waiting for subprocess: {}", e),
                Err(_) => warn!("subprocess did not exit within the grace period"),
            }
        }
        *slot = None;
    }

    /// Acknowledge an Error state, returning the machine to Idle.
    pub fn clear_error(&self) -> bool {
        if self.state.is_state(RunState::Error) {
            self.state.transition_to(RunState::Idle)
        } else {
            false
        }
    }

    /// Queue a log line for the initiating thread. Dropped when the channel
    /// is full so the worker never blocks on a slow consumer.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let _ = self.log_tx.try_send(LogMessage::new(level, message));
    }

    /// A sender half for worker code that wants to emit log lines directly.
    pub fn log_sender(&self) -> mpsc::Sender<LogMessage> {
        self.log_tx.clone()
    }

    /// Drain every queued log line. Called on the initiator's own tick.
    pub fn poll_logs(&self) -> Vec<LogMessage> {
        let mut rx = self.log_rx.lock().expect("log lock poisoned");
        let mut messages = Vec::new();
        while let Ok(message) = rx.try_recv() {
            messages.push(message);
        }
        messages
    }

    /// Take the finished run's outcome, if any. Consumes it.
    pub fn take_result(&self) -> Option<RunOutcome> {
        self.result.lock().expect("result lock poisoned").take()
    }
}
