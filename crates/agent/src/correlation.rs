//! Correlation registry — matches asynchronous tool responses to the
//! execution waiting for them.
//!
//! Each externally mediated tool call registers a [`WaitKey`] and receives a
//! [`WaitHandle`]. The connection's receive loop later calls
//! [`CorrelationRegistry::resolve`] with the client's answer. The slot is a
//! `oneshot` channel kept in a mutex-protected map; whoever removes the key
//! from the map (resolver, canceller or the timing-out waiter) decides the
//! outcome, exactly once.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Identifies one pending tool call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WaitKey {
    pub session_id: String,
    pub request_id: String,
    pub tool_call_id: String,
}

impl WaitKey {
    pub fn new(
        session_id: impl Into<String>,
        request_id: impl Into<String>,
        tool_call_id: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            request_id: request_id.into(),
            tool_call_id: tool_call_id.into(),
        }
    }
}

impl fmt::Display for WaitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.session_id, self.request_id, self.tool_call_id)
    }
}

/// The remote party's answer to a tool call.
///
/// For approval-routed calls `success` carries the allow/deny decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResponse {
    pub success: bool,
    #[serde(default)]
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ToolResponse {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            data: None,
        }
    }

    pub fn failed(output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
            data: None,
        }
    }
}

/// How a wait ended.
#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome {
    Resolved(ToolResponse),
    TimedOut,
    Cancelled,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CorrelationError {
    #[error("A tool call is already pending for {0}")]
    DuplicateKey(WaitKey),
}

enum Delivery {
    Response(ToolResponse),
    Cancelled,
}

struct Slot {
    registration: u64,
    tx: oneshot::Sender<Delivery>,
}

/// Process-wide table of pending tool calls.
pub struct CorrelationRegistry {
    pending: Mutex<HashMap<WaitKey, Slot>>,
    next_registration: AtomicU64,
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            next_registration: AtomicU64::new(1),
        }
    }

    /// Create a pending slot for `key`.
    ///
    /// Fails if the same key is already outstanding.
    pub fn register(self: &Arc<Self>, key: WaitKey) -> Result<WaitHandle, CorrelationError> {
        let (tx, rx) = oneshot::channel();
        let registration = self.next_registration.fetch_add(1, Ordering::Relaxed);

        {
            let mut pending = self.lock();
            if pending.contains_key(&key) {
                return Err(CorrelationError::DuplicateKey(key));
            }
            pending.insert(key.clone(), Slot { registration, tx });
        }

        debug!(key = %key, "Registered pending tool call");
        Ok(WaitHandle {
            registry: Arc::clone(self),
            key,
            registration,
            rx,
            settled: false,
        })
    }

    /// Deliver a response. Returns true only for the call that wakes the
    /// waiter; later or unknown keys return false and change nothing.
    pub fn resolve(&self, key: &WaitKey, response: ToolResponse) -> bool {
        let mut pending = self.lock();
        let Some(slot) = pending.remove(key) else {
            debug!(key = %key, "Resolve for unknown or already settled tool call");
            return false;
        };
        // Sent while still holding the lock so a timing-out waiter that finds
        // the key gone can rely on the value being in its channel.
        slot.tx.send(Delivery::Response(response)).is_ok()
    }

    /// Force every outstanding wait of a session to end as `Cancelled`.
    ///
    /// Returns how many waits were cancelled.
    pub fn cancel_session(&self, session_id: &str) -> usize {
        let mut pending = self.lock();
        let keys: Vec<WaitKey> = pending
            .keys()
            .filter(|k| k.session_id == session_id)
            .cloned()
            .collect();

        let mut cancelled = 0;
        for key in keys {
            if let Some(slot) = pending.remove(&key) {
                if slot.tx.send(Delivery::Cancelled).is_ok() {
                    cancelled += 1;
                }
            }
        }
        if cancelled > 0 {
            debug!(session_id, cancelled, "Cancelled pending tool calls");
        }
        cancelled
    }

    pub fn is_pending(&self, key: &WaitKey) -> bool {
        self.lock().contains_key(key)
    }

    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    /// Remove `key` only if it still belongs to `registration`.
    fn remove_own(&self, key: &WaitKey, registration: u64) -> bool {
        let mut pending = self.lock();
        match pending.get(key) {
            Some(slot) if slot.registration == registration => {
                pending.remove(key);
                true
            }
            _ => false,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<WaitKey, Slot>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for CorrelationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The waiting side of one pending tool call.
///
/// Dropping the handle before it settles unregisters the key.
pub struct WaitHandle {
    registry: Arc<CorrelationRegistry>,
    key: WaitKey,
    registration: u64,
    rx: oneshot::Receiver<Delivery>,
    settled: bool,
}

impl WaitHandle {
    pub fn key(&self) -> &WaitKey {
        &self.key
    }

    /// Suspend until the call is resolved, cancelled, or `timeout` elapses.
    pub async fn wait(mut self, timeout: Duration) -> WaitOutcome {
        let outcome = tokio::select! {
            delivered = &mut self.rx => Self::outcome(delivered.ok()),
            _ = tokio::time::sleep(timeout) => {
                if self.registry.remove_own(&self.key, self.registration) {
                    warn!(key = %self.key, timeout_secs = timeout.as_secs(), "Tool call timed out");
                    WaitOutcome::TimedOut
                } else {
                    // Someone else removed the key first and already sent.
                    Self::outcome(self.rx.try_recv().ok())
                }
            }
        };
        self.settled = true;
        outcome
    }

    fn outcome(delivery: Option<Delivery>) -> WaitOutcome {
        match delivery {
            Some(Delivery::Response(response)) => WaitOutcome::Resolved(response),
            Some(Delivery::Cancelled) | None => WaitOutcome::Cancelled,
        }
    }
}

impl Drop for WaitHandle {
    fn drop(&mut self) {
        if !self.settled && self.registry.remove_own(&self.key, self.registration) {
            debug!(key = %self.key, "Pending tool call abandoned");
        }
    }
}
