//! ReAct executor — the Reason → Act → Observe loop of one execution.
//!
//! Each iteration:
//! 1. **Reason**: send system prompt + conversation + tool catalog to the model
//! 2. **Act**: route each requested tool call (local, client, or approval)
//! 3. **Observe**: append every result to conversation memory, then loop
//!
//! The loop ends on a final answer, when the iteration cap is used up, on
//! interruption, or on a model/session failure. Whatever happens, the run
//! finishes by completing the session's execution guard and publishing one
//! `StreamComplete` event.

use clawlink_config::AppConfig;
use clawlink_core::error::ToolError;
use clawlink_core::event::{AgentEvent, EventDispatcher, EventPayload, PromptKind};
use clawlink_core::execution::{ExecutionId, ExecutionOutcome};
use clawlink_core::message::{ToolInvocation, TurnRecord, history_window, unanswered_tool_calls};
use clawlink_core::provider::{Provider, ProviderRequest, ToolDefinition};
use clawlink_core::tool::{ToolCall, ToolContext, ToolRegistry, ToolRoute};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::correlation::{CorrelationRegistry, WaitKey, WaitOutcome};
use crate::session::{ExecutionGuard, SessionContext};

pub const MAX_ITERATIONS_REACHED: &str = "not executed: maximum iterations reached";
pub const CANCELLED: &str = "cancelled";
pub const DENIED_BY_USER: &str = "denied by user";
pub const TOOL_PANICKED: &str = "tool panicked";
pub const EXECUTION_FAILED: &str = "not executed: execution failed";

/// Input of one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunInput {
    /// The user's message
    pub content: String,

    /// A document the client sends along with the message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<String>,

    /// Tools the client will execute itself
    #[serde(default)]
    pub client_tools: Vec<ToolDefinition>,
}

impl RunInput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            attachment: None,
            client_tools: Vec::new(),
        }
    }

    pub fn with_client_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.client_tools = tools;
        self
    }

    pub fn with_attachment(mut self, attachment: impl Into<String>) -> Self {
        self.attachment = Some(attachment.into());
        self
    }

    /// The user turn as stored: the message, then any non-blank attachment.
    pub fn user_turn(&self) -> String {
        match self.attachment.as_deref().map(str::trim).filter(|a| !a.is_empty()) {
            Some(doc) => format!("{}\n\n<attachment>\n{doc}\n</attachment>", self.content),
            None => self.content.clone(),
        }
    }
}

/// Summary returned when an execution finishes.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReport {
    pub execution: ExecutionId,
    pub outcome: ExecutionOutcome,
    pub reason: Option<String>,
    pub final_text: String,
    /// Tool rounds dispatched
    pub iterations: u32,
    pub tool_calls: usize,
}

/// Tunables of the loop.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub max_iterations: u32,
    pub tool_timeout: Duration,
    /// Most recent records sent to the model; 0 sends the whole log
    pub max_messages: usize,
    /// Prepended to every model request; never stored in memory.
    pub system_prompt: Option<String>,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".into(),
            temperature: 0.7,
            max_tokens: None,
            max_iterations: 10,
            tool_timeout: Duration::from_secs(300),
            max_messages: 1000,
            system_prompt: None,
        }
    }
}

impl ExecutorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let prompt = config.agent.system_prompt.trim();
        Self {
            model: config.provider.model.clone(),
            temperature: config.provider.temperature,
            max_tokens: config.provider.max_tokens,
            max_iterations: config.agent.max_iterations,
            tool_timeout: Duration::from_secs(config.agent.tool_timeout_secs),
            max_messages: config.agent.max_messages,
            system_prompt: (!prompt.is_empty()).then(|| prompt.to_string()),
        }
    }
}

/// How the inner loop stopped.
struct LoopEnd {
    outcome: ExecutionOutcome,
    reason: Option<String>,
    final_text: String,
}

impl LoopEnd {
    fn interrupted() -> Self {
        Self {
            outcome: ExecutionOutcome::Interrupted,
            reason: Some("interrupted by client".into()),
            final_text: String::new(),
        }
    }
}

/// Result of asking the model once.
enum ModelTurn {
    Reply {
        content: String,
        tool_calls: Vec<ToolInvocation>,
    },
    Interrupted,
}

/// Result of one tool dispatch.
enum Dispatch {
    Done { success: bool, output: String },
    Cancelled,
}

impl Dispatch {
    fn failed(output: impl Into<String>) -> Self {
        Self::Done {
            success: false,
            output: output.into(),
        }
    }
}

/// Per-run bookkeeping shared by the loop's helpers.
struct RunScope<'a> {
    exec: &'a ExecutionId,
    session: &'a Arc<SessionContext>,
    client_tools: &'a HashSet<String>,
    rounds: u32,
    tool_calls: usize,
}

/// Drives executions. Shared by every session.
pub struct ReactExecutor {
    provider: Arc<dyn Provider>,
    tools: Arc<ToolRegistry>,
    correlation: Arc<CorrelationRegistry>,
    dispatcher: Arc<EventDispatcher>,
    settings: ExecutorSettings,
}

impl ReactExecutor {
    pub fn new(
        provider: Arc<dyn Provider>,
        tools: Arc<ToolRegistry>,
        correlation: Arc<CorrelationRegistry>,
        dispatcher: Arc<EventDispatcher>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            provider,
            tools,
            correlation,
            dispatcher,
            settings,
        }
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Run one execution to completion.
    ///
    /// Never fails and never unwinds: errors and panics inside the loop end
    /// the run as Failed.
    pub async fn run(&self, guard: ExecutionGuard, input: RunInput) -> ExecutionReport {
        let exec = guard.id().clone();
        let client_tools: HashSet<String> = input.client_tools.iter().map(|t| t.name.clone()).collect();
        let mut scope = RunScope {
            exec: &exec,
            session: guard.session(),
            client_tools: &client_tools,
            rounds: 0,
            tool_calls: 0,
        };

        info!(
            session_id = %exec.session_id,
            request_id = %exec.request_id,
            model = %self.settings.model,
            max_iter = self.settings.max_iterations,
            "Execution starting"
        );

        let result = AssertUnwindSafe(self.drive(&guard, &mut scope, &input))
            .catch_unwind()
            .await;
        let (rounds, tool_calls) = (scope.rounds, scope.tool_calls);

        let end = match result {
            Ok(Ok(end)) => end,
            Ok(Err(e)) => {
                error!(execution = %exec, error = %e, "Execution failed");
                self.settle_unanswered(&scope);
                LoopEnd {
                    outcome: ExecutionOutcome::Failed,
                    reason: Some(e.to_string()),
                    final_text: String::new(),
                }
            }
            Err(_) => {
                error!(execution = %exec, "Execution panicked");
                self.settle_unanswered(&scope);
                LoopEnd {
                    outcome: ExecutionOutcome::Failed,
                    reason: Some("execution panicked".into()),
                    final_text: String::new(),
                }
            }
        };

        self.finalize(guard, end, rounds, tool_calls)
    }

    fn finalize(
        &self,
        guard: ExecutionGuard,
        end: LoopEnd,
        iterations: u32,
        tool_calls: usize,
    ) -> ExecutionReport {
        let exec = guard.id().clone();

        match end.outcome {
            ExecutionOutcome::Interrupted => {
                self.publish(AgentEvent::prompt(exec.clone(), PromptKind::Interrupted));
            }
            ExecutionOutcome::Failed => {
                let message = end
                    .reason
                    .clone()
                    .unwrap_or_else(|| PromptKind::Error.default_message().to_string());
                self.prompt(&exec, PromptKind::Error, message);
            }
            ExecutionOutcome::Completed | ExecutionOutcome::MaxIterations => {}
        }

        guard.complete(end.outcome.phase());

        info!(
            session_id = %exec.session_id,
            request_id = %exec.request_id,
            outcome = %end.outcome,
            iterations,
            tool_calls,
            "Execution finished"
        );

        self.publish(
            AgentEvent::new(
                exec.clone(),
                EventPayload::StreamComplete {
                    outcome: end.outcome,
                    reason: end.reason.clone(),
                    final_text: end.final_text.clone(),
                },
            ),
        );

        ExecutionReport {
            execution: exec,
            outcome: end.outcome,
            reason: end.reason,
            final_text: end.final_text,
            iterations,
            tool_calls,
        }
    }

    async fn drive(
        &self,
        guard: &ExecutionGuard,
        scope: &mut RunScope<'_>,
        input: &RunInput,
    ) -> clawlink_core::Result<LoopEnd> {
        let catalog = self.catalog(&input.client_tools);
        self.append(scope, TurnRecord::user(input.user_turn()))?;

        loop {
            if scope.session.is_interrupted() {
                return Ok(LoopEnd::interrupted());
            }

            debug!(execution = %scope.exec, iteration = scope.rounds + 1, "ReAct iteration");
            self.publish(AgentEvent::prompt(scope.exec.clone(), PromptKind::Thinking));

            let (content, tool_calls) = match self.call_model(scope, &catalog).await? {
                ModelTurn::Reply { content, tool_calls } => (content, tool_calls),
                ModelTurn::Interrupted => return Ok(LoopEnd::interrupted()),
            };

            // ── Final answer ──
            if tool_calls.is_empty() {
                self.append(scope, TurnRecord::assistant(content.clone()))?;
                return Ok(LoopEnd {
                    outcome: ExecutionOutcome::Completed,
                    reason: None,
                    final_text: content,
                });
            }

            self.append(scope, TurnRecord::assistant_with_tools(content, tool_calls.clone()))?;

            // ── Iteration cap ──
            if scope.rounds >= self.settings.max_iterations {
                warn!(
                    execution = %scope.exec,
                    max_iter = self.settings.max_iterations,
                    "Maximum iterations reached"
                );
                self.fail_calls(scope, &tool_calls, MAX_ITERATIONS_REACHED)?;
                return Ok(LoopEnd {
                    outcome: ExecutionOutcome::MaxIterations,
                    reason: Some(format!(
                        "maximum iterations ({}) reached",
                        self.settings.max_iterations
                    )),
                    final_text: String::new(),
                });
            }

            scope.rounds += 1;
            guard.record_iteration(scope.rounds);

            for (idx, call) in tool_calls.iter().enumerate() {
                if scope.session.is_interrupted() {
                    self.fail_calls(scope, &tool_calls[idx..], CANCELLED)?;
                    return Ok(LoopEnd::interrupted());
                }

                scope.tool_calls += 1;
                match self.dispatch(scope, call).await {
                    Dispatch::Done { success, output } => {
                        self.append(
                            scope,
                            TurnRecord::tool_result(call.id.clone(), call.name.clone(), success, output),
                        )?;
                    }
                    Dispatch::Cancelled => {
                        self.fail_calls(scope, &tool_calls[idx..], CANCELLED)?;
                        return Ok(LoopEnd::interrupted());
                    }
                }

                if scope.session.is_interrupted() {
                    self.fail_calls(scope, &tool_calls[idx + 1..], CANCELLED)?;
                    return Ok(LoopEnd::interrupted());
                }
            }
        }
    }

    /// Local definitions followed by the client's own.
    fn catalog(&self, client_tools: &[ToolDefinition]) -> Vec<ToolDefinition> {
        let mut defs = self.tools.definitions();
        defs.extend(client_tools.iter().cloned());
        defs
    }

    async fn call_model(
        &self,
        scope: &RunScope<'_>,
        catalog: &[ToolDefinition],
    ) -> clawlink_core::Result<ModelTurn> {
        let history = scope.session.memory().snapshot()?;
        let window = history_window(&history, self.settings.max_messages);
        let mut messages = Vec::with_capacity(window.len() + 1);
        if let Some(prompt) = &self.settings.system_prompt {
            messages.push(TurnRecord::system(prompt.clone()));
        }
        messages.extend_from_slice(window);

        let request = ProviderRequest {
            model: self.settings.model.clone(),
            messages,
            temperature: self.settings.temperature,
            max_tokens: self.settings.max_tokens,
            tools: catalog.to_vec(),
            stream: true,
        };

        let mut rx = tokio::select! {
            rx = self.provider.stream(request) => rx?,
            _ = scope.session.interrupted() => return Ok(ModelTurn::Interrupted),
        };

        let mut content = String::new();
        let mut tool_calls: Vec<ToolInvocation> = Vec::new();

        loop {
            let next = tokio::select! {
                next = rx.recv() => next,
                _ = scope.session.interrupted() => return Ok(ModelTurn::Interrupted),
            };
            let Some(chunk) = next else { break };
            let chunk = chunk?;

            if let Some(delta) = chunk.content.filter(|d| !d.is_empty()) {
                content.push_str(&delta);
                self.publish(
                    AgentEvent::new(scope.exec.clone(), EventPayload::StreamChunk { content: delta }),
                );
            }
            tool_calls.extend(chunk.tool_calls);

            if chunk.done {
                break;
            }
        }

        debug!(
            execution = %scope.exec,
            chars = content.len(),
            tool_calls = tool_calls.len(),
            "Model replied"
        );
        Ok(ModelTurn::Reply { content, tool_calls })
    }

    fn route(&self, scope: &RunScope<'_>, name: &str) -> Option<ToolRoute> {
        if scope.client_tools.contains(name) {
            return Some(ToolRoute::Client);
        }
        self.tools.route(name)
    }

    async fn dispatch(&self, scope: &RunScope<'_>, call: &ToolInvocation) -> Dispatch {
        let Some(route) = self.route(scope, &call.name) else {
            warn!(execution = %scope.exec, tool = %call.name, "Model requested unknown tool");
            return Dispatch::failed(format!("unknown tool: {}", call.name));
        };

        self.prompt(scope.exec, PromptKind::ToolCalling, format!("Calling tool: {}", call.name));
        debug!(execution = %scope.exec, tool = %call.name, route = ?route, "Dispatching tool call");

        let result = match route {
            ToolRoute::Local => self.execute_local(scope, call).await,
            ToolRoute::Client => match self.round_trip(scope, call, route).await {
                WaitOutcome::Resolved(response) => Dispatch::Done {
                    success: response.success,
                    output: response.output,
                },
                WaitOutcome::TimedOut => Dispatch::failed(self.timeout_message()),
                WaitOutcome::Cancelled => Dispatch::Cancelled,
            },
            ToolRoute::Approval => match self.round_trip(scope, call, route).await {
                WaitOutcome::Resolved(response) if response.success => {
                    self.execute_local(scope, call).await
                }
                WaitOutcome::Resolved(_) => Dispatch::failed(DENIED_BY_USER),
                WaitOutcome::TimedOut => Dispatch::failed(self.timeout_message()),
                WaitOutcome::Cancelled => Dispatch::Cancelled,
            },
        };

        if let Dispatch::Done { success, .. } = &result {
            self.prompt(
                scope.exec,
                PromptKind::ToolComplete,
                format!("Tool {} {}", call.name, if *success { "finished" } else { "failed" }),
            );
        }
        result
    }

    /// Hand a call to the client and wait for its answer.
    async fn round_trip(
        &self,
        scope: &RunScope<'_>,
        call: &ToolInvocation,
        route: ToolRoute,
    ) -> WaitOutcome {
        let key = WaitKey::new(
            scope.exec.session_id.clone(),
            scope.exec.request_id.clone(),
            call.id.clone(),
        );
        let handle = match self.correlation.register(key) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(execution = %scope.exec, tool = %call.name, error = %e, "Cannot register tool call");
                return WaitOutcome::Resolved(crate::correlation::ToolResponse::failed(e.to_string()));
            }
        };

        // An interrupt that raced the registration would otherwise be missed.
        if scope.session.is_interrupted() {
            return WaitOutcome::Cancelled;
        }

        self.publish(
            AgentEvent::new(
                scope.exec.clone(),
                EventPayload::ToolRequest {
                    call: call.clone(),
                    route,
                },
            ),
        );

        tokio::select! {
            outcome = handle.wait(self.settings.tool_timeout) => outcome,
            _ = scope.session.interrupted() => WaitOutcome::Cancelled,
        }
    }

    async fn execute_local(&self, scope: &RunScope<'_>, call: &ToolInvocation) -> Dispatch {
        let ctx = ToolContext {
            session_id: scope.exec.session_id.clone(),
            request_id: scope.exec.request_id.clone(),
            call_id: call.id.clone(),
        };
        let tool_call = ToolCall {
            id: call.id.clone(),
            name: call.name.clone(),
            arguments: call.arguments_json(),
        };

        let start = std::time::Instant::now();
        let execution = AssertUnwindSafe(self.tools.execute(&ctx, &tool_call)).catch_unwind();
        let result = tokio::time::timeout(self.settings.tool_timeout, execution).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let result = match result {
            Ok(Ok(r)) => r,
            Ok(Err(_)) => {
                error!(execution = %scope.exec, tool = %call.name, duration_ms, "Tool panicked");
                return Dispatch::failed(TOOL_PANICKED);
            }
            Err(_) => Err(ToolError::Timeout {
                tool_name: call.name.clone(),
                timeout_secs: self.settings.tool_timeout.as_secs(),
            }),
        };

        match result {
            Ok(output) => {
                debug!(execution = %scope.exec, tool = %call.name, duration_ms, success = output.success, "Tool executed");
                Dispatch::Done {
                    success: output.success,
                    output: output.output,
                }
            }
            Err(e) => {
                warn!(execution = %scope.exec, tool = %call.name, duration_ms, error = %e, "Tool failed");
                Dispatch::failed(e.to_string())
            }
        }
    }

    fn timeout_message(&self) -> String {
        format!("timed out after {}s", self.settings.tool_timeout.as_secs())
    }

    /// Give every call in `calls` a failed result so pairing stays complete.
    fn fail_calls(
        &self,
        scope: &RunScope<'_>,
        calls: &[ToolInvocation],
        reason: &str,
    ) -> clawlink_core::Result<()> {
        for call in calls {
            self.append(
                scope,
                TurnRecord::tool_result(call.id.clone(), call.name.clone(), false, reason),
            )?;
        }
        Ok(())
    }

    /// Close calls a failed run left open, so the next run starts from a
    /// consistent log.
    fn settle_unanswered(&self, scope: &RunScope<'_>) {
        let Ok(log) = scope.session.memory().snapshot() else {
            return;
        };
        let open = unanswered_tool_calls(&log);
        if open.is_empty() {
            return;
        }
        warn!(execution = %scope.exec, calls = open.len(), "Closing unanswered tool calls");
        if let Err(e) = self.fail_calls(scope, &open, EXECUTION_FAILED) {
            warn!(execution = %scope.exec, error = %e, "Could not close unanswered tool calls");
        }
    }

    fn append(&self, scope: &RunScope<'_>, record: TurnRecord) -> clawlink_core::Result<()> {
        let index = scope.session.memory().append(record.clone())?;
        self.publish(
            AgentEvent::new(scope.exec.clone(), EventPayload::MessagePersisted { index, record }),
        );
        Ok(())
    }

    fn prompt(&self, exec: &ExecutionId, kind: PromptKind, message: String) {
        self.publish(AgentEvent::new(exec.clone(), EventPayload::Prompt { kind, message }));
    }

    fn publish(&self, event: AgentEvent) {
        self.dispatcher.publish(event);
    }
}
