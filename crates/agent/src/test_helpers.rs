//! Shared test helpers for executor and runtime tests.

use async_trait::async_trait;
use clawlink_core::error::{ProviderError, ToolError};
use clawlink_core::event::{AgentEvent, EventDispatcher, EventKind, EventPayload, PromptKind};
use clawlink_core::message::ToolInvocation;
use clawlink_core::provider::{
    ChunkReceiver, Provider, ProviderRequest, ProviderResponse, StreamChunk, ToolDefinition, Usage,
};
use clawlink_core::tool::{Tool, ToolContext, ToolRegistry, ToolResult};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// One scripted model turn.
pub enum Step {
    Reply(ProviderResponse),
    /// Stream these text deltas, then finish with no tool calls.
    Chunks(Vec<&'static str>),
    Fail(ProviderError),
    /// Never answer.
    Hang,
}

/// A mock provider that plays back a script, one step per call.
///
/// Panics if more calls are made than steps provided.
pub struct ScriptedProvider {
    steps: Mutex<VecDeque<Step>>,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl ScriptedProvider {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn next_step(&self, request: ProviderRequest) -> Step {
        self.requests.lock().unwrap().push(request);
        let mut steps = self.steps.lock().unwrap();
        match steps.pop_front() {
            Some(step) => step,
            None => panic!("ScriptedProvider: no more steps"),
        }
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted_mock"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        match self.next_step(request) {
            Step::Reply(response) => Ok(response),
            Step::Chunks(parts) => Ok(text(&parts.concat())),
            Step::Fail(e) => Err(e),
            Step::Hang => std::future::pending().await,
        }
    }

    async fn stream(&self, request: ProviderRequest) -> Result<ChunkReceiver, ProviderError> {
        let step = self.next_step(request);
        let (tx, rx) = tokio::sync::mpsc::channel(16);
        match step {
            Step::Reply(response) => {
                let _ = tx
                    .send(Ok(StreamChunk {
                        content: Some(response.content),
                        tool_calls: response.tool_calls,
                        done: true,
                        usage: response.usage,
                    }))
                    .await;
            }
            Step::Chunks(parts) => {
                for part in parts {
                    let _ = tx
                        .send(Ok(StreamChunk {
                            content: Some(part.to_string()),
                            ..StreamChunk::default()
                        }))
                        .await;
                }
                let _ = tx
                    .send(Ok(StreamChunk {
                        done: true,
                        ..StreamChunk::default()
                    }))
                    .await;
            }
            Step::Fail(e) => return Err(e),
            Step::Hang => {
                // Keep the sender alive so the receiver never closes.
                tokio::spawn(async move {
                    let _held = tx;
                    std::future::pending::<()>().await;
                });
            }
        }
        Ok(rx)
    }
}

fn usage() -> Option<Usage> {
    Some(Usage {
        prompt_tokens: 10,
        completion_tokens: 5,
        total_tokens: 15,
    })
}

/// A final text answer.
pub fn text(content: &str) -> ProviderResponse {
    ProviderResponse {
        content: content.to_string(),
        tool_calls: Vec::new(),
        usage: usage(),
        model: "mock-model".into(),
    }
}

/// A response requesting tools: `(id, name, raw json arguments)`.
pub fn tool_calls(thought: &str, calls: Vec<(&str, &str, &str)>) -> ProviderResponse {
    ProviderResponse {
        content: thought.to_string(),
        tool_calls: calls
            .into_iter()
            .map(|(id, name, args)| ToolInvocation::new(id, name, args))
            .collect(),
        usage: usage(),
        model: "mock-model".into(),
    }
}

pub fn client_tool(name: &str) -> ToolDefinition {
    ToolDefinition {
        name: name.to_string(),
        description: format!("Client-side {name}"),
        parameters: serde_json::json!({ "type": "object" }),
    }
}

/// Echoes the `text` argument.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }
    fn description(&self) -> &str {
        "Echoes back the input"
    }
    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": { "text": { "type": "string" } },
            "required": ["text"]
        })
    }
    async fn execute(&self, ctx: &ToolContext, arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        Ok(ToolResult {
            call_id: ctx.call_id.clone(),
            success: true,
            output: arguments["text"].as_str().unwrap_or_default().to_string(),
            data: None,
        })
    }
}

/// Always returns an error.
pub struct FailTool;

#[async_trait]
impl Tool for FailTool {
    fn name(&self) -> &str {
        "fail"
    }
    fn description(&self) -> &str {
        "Always fails"
    }
    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object" })
    }
    async fn execute(&self, _ctx: &ToolContext, _arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        Err(ToolError::ExecutionFailed {
            tool_name: "fail".into(),
            reason: "always fails".into(),
        })
    }
}

/// Panics when executed.
pub struct PanicTool;

#[async_trait]
impl Tool for PanicTool {
    fn name(&self) -> &str {
        "panic"
    }
    fn description(&self) -> &str {
        "Panics"
    }
    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object" })
    }
    async fn execute(&self, _ctx: &ToolContext, _arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        panic!("tool exploded");
    }
}

pub fn test_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Box::new(EchoTool));
    registry.register(Box::new(FailTool));
    registry.register(Box::new(PanicTool));
    registry
}

/// Records every published event.
#[derive(Clone)]
pub struct EventLog {
    events: Arc<Mutex<Vec<AgentEvent>>>,
}

impl EventLog {
    pub fn attach(dispatcher: &EventDispatcher) -> Self {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        dispatcher.subscribe_all(move |event| {
            sink.lock().unwrap().push(event.clone());
            Ok(())
        });
        Self { events }
    }

    pub fn all(&self) -> Vec<AgentEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn of_kind(&self, kind: EventKind) -> Vec<AgentEvent> {
        self.all().into_iter().filter(|e| e.kind() == kind).collect()
    }

    pub fn prompts(&self) -> Vec<PromptKind> {
        self.all()
            .into_iter()
            .filter_map(|e| match e.payload {
                EventPayload::Prompt { kind, .. } => Some(kind),
                _ => None,
            })
            .collect()
    }
}

/// Yield until `condition` holds, failing the test after a bounded wait.
pub async fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    }
    panic!("condition not reached in time");
}
