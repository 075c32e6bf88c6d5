//! Session context — per-connection execution gate and interrupt signal.
//!
//! A session owns its conversation memory and admits at most one running
//! execution at a time. Admission hands out an [`ExecutionGuard`]; the guard
//! completes the execution exactly once, either explicitly or on drop.
//!
//! Closing a session while an execution runs leaves the memory writable
//! until that execution completes, so it can still record results for the
//! calls it was waiting on.

use clawlink_core::execution::{ExecutionId, ExecutionPhase};
use clawlink_memory::ConversationMemory;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

struct ExecutionState {
    phase: ExecutionPhase,
    active_request: Option<String>,
    iteration: u32,
    last_activity: Instant,
    closed: bool,
}

/// State of one connected session.
pub struct SessionContext {
    id: String,
    memory: ConversationMemory,
    state: Mutex<ExecutionState>,
    interrupted: AtomicBool,
    interrupt_signal: Notify,
    released: Notify,
}

impl SessionContext {
    pub fn new(id: impl Into<String>) -> Arc<Self> {
        let id = id.into();
        let memory = ConversationMemory::new(id.clone());
        Self::with_memory(id, memory)
    }

    pub fn with_memory(id: impl Into<String>, memory: ConversationMemory) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            memory,
            state: Mutex::new(ExecutionState {
                phase: ExecutionPhase::Idle,
                active_request: None,
                iteration: 0,
                last_activity: Instant::now(),
                closed: false,
            }),
            interrupted: AtomicBool::new(false),
            interrupt_signal: Notify::new(),
            released: Notify::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn memory(&self) -> &ConversationMemory {
        &self.memory
    }

    /// Admit a new execution if none is running.
    ///
    /// Clears any interrupt flag left over from a previous run.
    pub fn try_begin_execution(self: &Arc<Self>, request_id: &str) -> Option<ExecutionGuard> {
        let mut state = self.lock();
        if state.closed {
            return None;
        }
        if state.phase.is_active() {
            debug!(
                session_id = %self.id,
                request_id,
                active = ?state.active_request,
                "Session busy"
            );
            return None;
        }

        state.phase = ExecutionPhase::Running;
        state.active_request = Some(request_id.to_string());
        state.iteration = 0;
        state.last_activity = Instant::now();
        self.interrupted.store(false, Ordering::SeqCst);

        Some(ExecutionGuard {
            session: Arc::clone(self),
            id: ExecutionId::new(self.id.clone(), request_id),
            completed: false,
        })
    }

    /// Ask the running execution to stop at its next check point.
    ///
    /// Returns false if nothing is running.
    pub fn request_interrupt(&self) -> bool {
        let mut state = self.lock();
        if !state.phase.is_active() {
            return false;
        }
        state.phase = ExecutionPhase::InterruptRequested;
        self.interrupted.store(true, Ordering::SeqCst);
        drop(state);

        self.interrupt_signal.notify_waiters();
        debug!(session_id = %self.id, "Interrupt requested");
        true
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Resolves once an interrupt has been requested.
    pub async fn interrupted(&self) {
        loop {
            let notified = self.interrupt_signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_interrupted() {
                return;
            }
            notified.await;
        }
    }

    pub fn touch(&self) {
        self.lock().last_activity = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.lock().last_activity.elapsed()
    }

    pub fn phase(&self) -> ExecutionPhase {
        self.lock().phase
    }

    pub fn is_running(&self) -> bool {
        self.phase().is_active()
    }

    pub fn active_request(&self) -> Option<String> {
        self.lock().active_request.clone()
    }

    /// Tool rounds used by the current (or last) execution.
    pub fn iteration(&self) -> u32 {
        self.lock().iteration
    }

    /// Mark the session closed. Idempotent.
    ///
    /// Memory is sealed now if nothing runs, otherwise when the running
    /// execution completes.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        if !state.phase.is_active() {
            self.memory.close();
        }
    }

    /// Close the session if it has been idle for longer than `max_idle` and
    /// no execution is running. Check and close happen under the state lock.
    pub fn close_if_idle(&self, max_idle: Duration) -> bool {
        let mut state = self.lock();
        if state.closed || state.phase.is_active() || state.last_activity.elapsed() <= max_idle {
            return false;
        }
        state.closed = true;
        self.memory.close();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Resolves once no execution is running.
    pub async fn finished(&self) {
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.is_running() {
                return;
            }
            notified.await;
        }
    }

    fn complete_execution(&self, request_id: &str, phase: ExecutionPhase) {
        let mut state = self.lock();
        state.phase = phase;
        state.active_request = None;
        state.last_activity = Instant::now();
        if state.closed {
            self.memory.close();
        }
        drop(state);

        self.released.notify_waiters();
        debug!(session_id = %self.id, request_id, phase = ?phase, "Execution completed");
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ExecutionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Proof that an execution holds the session.
///
/// `complete` consumes the guard; dropping it without completing marks the
/// execution Failed.
pub struct ExecutionGuard {
    session: Arc<SessionContext>,
    id: ExecutionId,
    completed: bool,
}

impl ExecutionGuard {
    pub fn id(&self) -> &ExecutionId {
        &self.id
    }

    pub fn session(&self) -> &Arc<SessionContext> {
        &self.session
    }

    pub fn record_iteration(&self, iteration: u32) {
        self.session.lock().iteration = iteration;
    }

    /// Release the session with a terminal phase.
    pub fn complete(mut self, phase: ExecutionPhase) {
        self.completed = true;
        self.session.complete_execution(&self.id.request_id, phase);
    }
}

impl Drop for ExecutionGuard {
    fn drop(&mut self) {
        if !self.completed {
            warn!(execution = %self.id, "Execution dropped without completing");
            self.session
                .complete_execution(&self.id.request_id, ExecutionPhase::Failed);
        }
    }
}
