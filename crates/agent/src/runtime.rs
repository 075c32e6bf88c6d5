//! Agent runtime — the entry point transports talk to.
//!
//! Owns the session table, the correlation registry and the event
//! dispatcher, and spawns one task per accepted execution. Every method is
//! safe to call from a connection's receive loop: none of them awaits a
//! running execution.

use clawlink_config::{AppConfig, BusyPolicy};
use clawlink_core::event::{AgentEvent, EventDispatcher, EventKind, SubscriptionId};
use clawlink_core::execution::ExecutionId;
use clawlink_core::message::close_unanswered_calls;
use clawlink_core::provider::Provider;
use clawlink_core::tool::ToolRegistry;
use clawlink_memory::{ConversationMemory, NoopTurnStore, PersistenceFlusher, TurnStore};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::correlation::{CorrelationRegistry, ToolResponse, WaitKey};
use crate::executor::{CANCELLED, ExecutionReport, ExecutorSettings, ReactExecutor, RunInput};
use crate::session::SessionContext;

/// Why a run was refused before any execution was created.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RunError {
    #[error("Message content is empty")]
    EmptyContent,

    #[error("Request id is empty")]
    EmptyRequestId,

    #[error("Unknown session: {0}")]
    UnknownSession(String),

    #[error("Client tool '{0}' clashes with a built-in tool")]
    ToolNameConflict(String),
}

/// A running execution.
#[derive(Debug)]
pub struct ExecutionHandle {
    id: ExecutionId,
    task: JoinHandle<ExecutionReport>,
}

impl ExecutionHandle {
    pub fn id(&self) -> &ExecutionId {
        &self.id
    }

    /// Wait for the execution to finish. `None` if the task was aborted.
    pub async fn join(self) -> Option<ExecutionReport> {
        match self.task.await {
            Ok(report) => Some(report),
            Err(e) => {
                warn!(execution = %self.id, error = %e, "Execution task did not finish");
                None
            }
        }
    }
}

/// Answer to `begin_run`.
#[derive(Debug)]
pub enum Admission {
    Accepted(ExecutionHandle),
    /// Another execution holds the session.
    Busy,
}

impl Admission {
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy)
    }

    pub fn into_handle(self) -> Option<ExecutionHandle> {
        match self {
            Self::Accepted(handle) => Some(handle),
            Self::Busy => None,
        }
    }
}

/// Process-wide agent state shared by all connections.
pub struct AgentRuntime {
    sessions: RwLock<HashMap<String, Arc<SessionContext>>>,
    /// Closed sessions whose execution has not finished yet
    retiring: Mutex<HashMap<String, Arc<SessionContext>>>,
    correlation: Arc<CorrelationRegistry>,
    dispatcher: Arc<EventDispatcher>,
    executor: Arc<ReactExecutor>,
    store: Arc<dyn TurnStore>,
    flusher: Option<PersistenceFlusher>,
    busy_policy: BusyPolicy,
}

impl AgentRuntime {
    pub fn new(provider: Arc<dyn Provider>, tools: Arc<ToolRegistry>, settings: ExecutorSettings) -> Self {
        let correlation = Arc::new(CorrelationRegistry::new());
        let dispatcher = Arc::new(EventDispatcher::new());
        let executor = Arc::new(ReactExecutor::new(
            provider,
            tools,
            correlation.clone(),
            dispatcher.clone(),
            settings,
        ));
        Self {
            sessions: RwLock::new(HashMap::new()),
            retiring: Mutex::new(HashMap::new()),
            correlation,
            dispatcher,
            executor,
            store: Arc::new(NoopTurnStore),
            flusher: None,
            busy_policy: BusyPolicy::default(),
        }
    }

    /// Build from application config.
    pub fn from_config(config: &AppConfig, provider: Arc<dyn Provider>, tools: Arc<ToolRegistry>) -> Self {
        Self::new(provider, tools, ExecutorSettings::from_config(config))
            .with_busy_policy(config.agent.busy_policy)
    }

    /// Store consulted for history when a session is opened.
    pub fn with_store(mut self, store: Arc<dyn TurnStore>) -> Self {
        self.store = store;
        self
    }

    /// Writer to wait on before history is loaded.
    pub fn with_flusher(mut self, flusher: PersistenceFlusher) -> Self {
        self.flusher = Some(flusher);
        self
    }

    pub fn with_busy_policy(mut self, policy: BusyPolicy) -> Self {
        self.busy_policy = policy;
        self
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    pub fn correlation(&self) -> &Arc<CorrelationRegistry> {
        &self.correlation
    }

    pub fn store(&self) -> &Arc<dyn TurnStore> {
        &self.store
    }

    // ── Session lifecycle ──

    /// Open (or re-attach to) a session, restoring stored history.
    ///
    /// If an earlier instance of the session is still finishing its
    /// execution, waits for it and for the persistence writer, so the
    /// restored log is complete. Invocations left without a result are
    /// closed as cancelled.
    pub async fn open_session(&self, session_id: &str) -> Arc<SessionContext> {
        if let Some(existing) = self.session(session_id) {
            existing.touch();
            return existing;
        }

        self.await_retiring(session_id).await;
        if let Some(flusher) = &self.flusher {
            flusher.flush().await;
        }

        let history = match self.store.load(session_id).await {
            Ok(records) => records,
            Err(e) => {
                warn!(session_id, error = %e, "Failed to load session history");
                Vec::new()
            }
        };
        let (history, repaired) = close_unanswered_calls(history, CANCELLED);
        if repaired > 0 {
            warn!(session_id, repaired, "Restored history had unanswered tool calls");
        }
        let restored = history.len();
        let session = SessionContext::with_memory(
            session_id,
            ConversationMemory::with_history(session_id, history),
        );

        let mut sessions = self.sessions_write();
        // Another connection may have opened it while we were loading.
        let session = sessions
            .entry(session_id.to_string())
            .or_insert(session)
            .clone();
        info!(session_id, restored, "Session opened");
        session
    }

    /// Tear a session down: interrupt, release waits, seal memory.
    pub fn close_session(&self, session_id: &str) -> bool {
        let Some(session) = self.sessions_write().remove(session_id) else {
            return false;
        };
        self.shut_down(&session);
        info!(session_id, "Session closed");
        true
    }

    /// Close sessions idle for longer than `max_idle`. Sessions with a
    /// running execution are left alone.
    pub fn sweep_idle(&self, max_idle: Duration) -> Vec<String> {
        let closed: Vec<String> = {
            let mut sessions = self.sessions_write();
            let ids: Vec<String> = sessions
                .iter()
                .filter(|(_, s)| s.close_if_idle(max_idle))
                .map(|(id, _)| id.clone())
                .collect();
            for id in &ids {
                sessions.remove(id);
            }
            ids
        };

        for id in &closed {
            self.correlation.cancel_session(id);
        }
        self.retiring_lock().retain(|_, s| s.is_running());
        if !closed.is_empty() {
            info!(count = closed.len(), "Swept idle sessions");
        }
        closed
    }

    pub fn session(&self, session_id: &str) -> Option<Arc<SessionContext>> {
        self.sessions_read().get(session_id).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.sessions_read().len()
    }

    // ── Runs ──

    /// Validate and admit a run. On acceptance the execution starts on its
    /// own task; the call itself never waits for it.
    pub fn begin_run(&self, session_id: &str, request_id: &str, input: RunInput) -> Result<Admission, RunError> {
        if input.content.trim().is_empty() {
            return Err(RunError::EmptyContent);
        }
        if request_id.trim().is_empty() {
            return Err(RunError::EmptyRequestId);
        }
        let session = self
            .session(session_id)
            .filter(|s| !s.is_closed())
            .ok_or_else(|| RunError::UnknownSession(session_id.to_string()))?;
        if let Some(clash) = input
            .client_tools
            .iter()
            .find(|t| self.executor.tools().contains(&t.name))
        {
            return Err(RunError::ToolNameConflict(clash.name.clone()));
        }

        session.touch();
        let Some(guard) = session.try_begin_execution(request_id) else {
            if session.is_closed() {
                return Err(RunError::UnknownSession(session_id.to_string()));
            }
            info!(
                session_id,
                request_id,
                policy = ?self.busy_policy,
                "Run refused, session busy"
            );
            if self.busy_policy == BusyPolicy::Preempt {
                self.interrupt(session_id);
            }
            return Ok(Admission::Busy);
        };

        let id = guard.id().clone();
        let executor = Arc::clone(&self.executor);
        let task = tokio::spawn(async move { executor.run(guard, input).await });
        debug!(execution = %id, "Execution spawned");

        Ok(Admission::Accepted(ExecutionHandle { id, task }))
    }

    /// Deliver a client's tool result. False if nothing was waiting for it.
    pub fn submit_tool_result(
        &self,
        session_id: &str,
        request_id: &str,
        tool_call_id: &str,
        response: ToolResponse,
    ) -> bool {
        if let Some(session) = self.session(session_id) {
            session.touch();
        }
        let delivered = self
            .correlation
            .resolve(&WaitKey::new(session_id, request_id, tool_call_id), response);
        if !delivered {
            debug!(session_id, request_id, tool_call_id, "Tool result had no waiter");
        }
        delivered
    }

    /// Ask the session's running execution to stop. False if none is running.
    pub fn interrupt(&self, session_id: &str) -> bool {
        let Some(session) = self.session(session_id) else {
            return false;
        };
        let requested = session.request_interrupt();
        let released = self.correlation.cancel_session(session_id);
        info!(session_id, requested, released, "Interrupt");
        requested
    }

    // ── Events ──

    pub fn subscribe<F>(&self, kind: EventKind, listener: F) -> SubscriptionId
    where
        F: Fn(&AgentEvent) -> clawlink_core::Result<()> + Send + Sync + 'static,
    {
        self.dispatcher.subscribe(kind, listener)
    }

    pub fn subscribe_all<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&AgentEvent) -> clawlink_core::Result<()> + Send + Sync + 'static,
    {
        self.dispatcher.subscribe_all(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.dispatcher.unsubscribe(id)
    }

    fn shut_down(&self, session: &Arc<SessionContext>) {
        session.request_interrupt();
        self.correlation.cancel_session(session.id());
        session.close();
        if session.is_running() {
            self.retiring_lock()
                .insert(session.id().to_string(), Arc::clone(session));
        }
    }

    async fn await_retiring(&self, session_id: &str) {
        let Some(old) = self.retiring_lock().get(session_id).cloned() else {
            return;
        };
        debug!(session_id, "Waiting for the previous execution to finish");
        old.finished().await;

        let mut retiring = self.retiring_lock();
        if retiring.get(session_id).is_some_and(|s| Arc::ptr_eq(s, &old)) {
            retiring.remove(session_id);
        }
    }

    fn retiring_lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<SessionContext>>> {
        self.retiring.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn sessions_read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<SessionContext>>> {
        self.sessions.read().unwrap_or_else(|e| e.into_inner())
    }

    fn sessions_write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<SessionContext>>> {
        self.sessions.write().unwrap_or_else(|e| e.into_inner())
    }
}
