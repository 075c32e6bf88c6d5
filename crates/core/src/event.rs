//! Agent events and the in-process dispatcher that fans them out.
//!
//! The executor publishes progress as [`AgentEvent`]s. Listeners (the
//! connection writer, the persistence writer, tests) register closures,
//! either for one [`EventKind`] or for everything.
//!
//! Delivery is synchronous on the publishing task, in publish order. A
//! listener that fails or panics is logged and skipped; it never stops
//! delivery to the remaining listeners and never unwinds the publisher.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::execution::{ExecutionId, ExecutionOutcome};
use crate::message::{ToolInvocation, TurnRecord};
use crate::tool::ToolRoute;

/// Discriminant of [`EventPayload`], used to key subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Prompt,
    StreamChunk,
    ToolRequest,
    StreamComplete,
    MessagePersisted,
}

/// Category of a progress prompt shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PromptKind {
    Thinking,
    ToolCalling,
    ToolComplete,
    Interrupted,
    Error,
}

impl PromptKind {
    /// Human-readable text used when the executor has nothing more specific.
    pub fn default_message(self) -> &'static str {
        match self {
            Self::Thinking => "Thinking...",
            Self::ToolCalling => "Calling tool...",
            Self::ToolComplete => "Tool finished.",
            Self::Interrupted => "Execution interrupted.",
            Self::Error => "Something went wrong.",
        }
    }
}

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// Progress notice for the user.
    Prompt { kind: PromptKind, message: String },

    /// A partial text delta from the model.
    StreamChunk { content: String },

    /// A tool call that has to be carried out (or approved) by the client.
    ToolRequest { call: ToolInvocation, route: ToolRoute },

    /// The execution finished. Published exactly once per execution.
    StreamComplete {
        outcome: ExecutionOutcome,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        final_text: String,
    },

    /// A record was appended to the conversation at `index`.
    MessagePersisted { index: usize, record: TurnRecord },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Prompt { .. } => EventKind::Prompt,
            Self::StreamChunk { .. } => EventKind::StreamChunk,
            Self::ToolRequest { .. } => EventKind::ToolRequest,
            Self::StreamComplete { .. } => EventKind::StreamComplete,
            Self::MessagePersisted { .. } => EventKind::MessagePersisted,
        }
    }
}

/// An event tagged with the execution that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEvent {
    pub execution: ExecutionId,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl AgentEvent {
    pub fn new(execution: ExecutionId, payload: EventPayload) -> Self {
        Self {
            execution,
            timestamp: Utc::now(),
            payload,
        }
    }

    /// A prompt event carrying the kind's default message.
    pub fn prompt(execution: ExecutionId, kind: PromptKind) -> Self {
        Self::new(
            execution,
            EventPayload::Prompt {
                kind,
                message: kind.default_message().to_string(),
            },
        )
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    pub fn session_id(&self) -> &str {
        &self.execution.session_id
    }
}

/// Handle returned by `subscribe`, used to remove the listener again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// A registered event handler.
pub type Listener = Arc<dyn Fn(&AgentEvent) -> crate::Result<()> + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    /// `None` receives every kind.
    kind: Option<EventKind>,
    listener: Listener,
}

/// Synchronous publish/subscribe table of event listeners.
pub struct EventDispatcher {
    subscriptions: RwLock<Vec<Subscription>>,
    next_id: AtomicU64,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Receive events of one kind.
    pub fn subscribe<F>(&self, kind: EventKind, listener: F) -> SubscriptionId
    where
        F: Fn(&AgentEvent) -> crate::Result<()> + Send + Sync + 'static,
    {
        self.insert(Some(kind), Arc::new(listener))
    }

    /// Receive every event.
    pub fn subscribe_all<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&AgentEvent) -> crate::Result<()> + Send + Sync + 'static,
    {
        self.insert(None, Arc::new(listener))
    }

    /// Remove a listener. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subscriptions.write().unwrap_or_else(|e| e.into_inner());
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    /// Deliver an event to every matching listener, in registration order.
    pub fn publish(&self, event: AgentEvent) {
        let kind = event.kind();

        // Snapshot so listeners may (un)subscribe without deadlocking.
        let targets: Vec<(SubscriptionId, Listener)> = {
            let subs = self.subscriptions.read().unwrap_or_else(|e| e.into_inner());
            subs.iter()
                .filter(|s| s.kind.is_none_or(|k| k == kind))
                .map(|s| (s.id, Arc::clone(&s.listener)))
                .collect()
        };

        for (id, listener) in targets {
            match catch_unwind(AssertUnwindSafe(|| listener(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(
                        subscription = id.0,
                        kind = ?kind,
                        execution = %event.execution,
                        error = %e,
                        "Event listener failed"
                    );
                }
                Err(_) => {
                    tracing::error!(
                        subscription = id.0,
                        kind = ?kind,
                        execution = %event.execution,
                        "Event listener panicked"
                    );
                }
            }
        }
    }

    pub fn listener_count(&self) -> usize {
        self.subscriptions.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn insert(&self, kind: Option<EventKind>, listener: Listener) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscriptions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Subscription { id, kind, listener });
        id
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
