//! WebSocket frame format.
//!
//! Every frame, in both directions, is one JSON object:
//!
//! ```json
//! { "type": "USER_MESSAGE", "session_code": "abc", "request_id": "1712",
//!   "content": "hello", "data": { ... }, "timestamp": 1712000000000 }
//! ```
//!
//! `data` depends on `type`; see the `*Data` structs below.

use clawlink_agent::{RunInput, ToolResponse};
use clawlink_core::event::{AgentEvent, EventPayload, PromptKind};
use clawlink_core::execution::ExecutionOutcome;
use clawlink_core::provider::ToolDefinition;
use clawlink_core::tool::ToolRoute;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FrameType {
    // Client → server
    UserMessage,
    AgentToolCallResponse,
    Interrupt,
    Ping,
    // Server → client
    AgentPrompt,
    AgentStream,
    AgentComplete,
    AgentToolCallRequest,
    Pong,
}

/// One WebSocket frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    #[serde(default)]
    pub session_code: String,
    #[serde(default)]
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Milliseconds since the Unix epoch.
    #[serde(default)]
    pub timestamp: i64,
}

impl Frame {
    pub fn new(frame_type: FrameType, session_code: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self {
            frame_type,
            session_code: session_code.into(),
            request_id: request_id.into(),
            content: None,
            data: None,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn with_data(mut self, data: impl Serialize) -> Self {
        self.data = serde_json::to_value(data).ok();
        self
    }

    /// An `AGENT_PROMPT` frame of kind `ERROR`.
    pub fn error(session_code: &str, request_id: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        Self::new(FrameType::AgentPrompt, session_code, request_id)
            .with_content(message.clone())
            .with_data(PromptData {
                prompt_type: PromptKind::Error,
                message,
            })
    }

    /// Decode the `data` field, treating a missing one as `{}`.
    pub fn data_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        let value = self.data.clone().unwrap_or_else(|| serde_json::json!({}));
        serde_json::from_value(value)
    }

    /// Translate an agent event into the frame sent to the client.
    ///
    /// Persistence notifications stay server-side and yield `None`.
    pub fn from_event(event: &AgentEvent) -> Option<Self> {
        let exec = &event.execution;
        let frame = |frame_type| Self {
            timestamp: event.timestamp.timestamp_millis(),
            ..Self::new(frame_type, exec.session_id.clone(), exec.request_id.clone())
        };

        match &event.payload {
            EventPayload::Prompt { kind, message } => Some(
                frame(FrameType::AgentPrompt)
                    .with_content(message.clone())
                    .with_data(PromptData {
                        prompt_type: *kind,
                        message: message.clone(),
                    }),
            ),
            EventPayload::StreamChunk { content } => {
                Some(frame(FrameType::AgentStream).with_content(content.clone()))
            }
            EventPayload::ToolRequest { call, route } => {
                Some(frame(FrameType::AgentToolCallRequest).with_data(ToolCallRequestData {
                    tool_call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    tool_args: call.arguments.clone(),
                    is_client_tool: *route == ToolRoute::Client,
                }))
            }
            EventPayload::StreamComplete {
                outcome,
                reason,
                final_text,
            } => Some(
                frame(FrameType::AgentComplete)
                    .with_content(final_text.clone())
                    .with_data(CompleteData {
                        outcome: *outcome,
                        reason: reason.clone(),
                    }),
            ),
            EventPayload::MessagePersisted { .. } => None,
        }
    }
}

// ── Client → server data ──

/// A tool the client can execute, in MCP schema form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_object_schema")]
    pub input_schema: serde_json::Value,
}

fn empty_object_schema() -> serde_json::Value {
    serde_json::json!({ "type": "object" })
}

impl From<ToolSchema> for ToolDefinition {
    fn from(schema: ToolSchema) -> Self {
        ToolDefinition {
            name: schema.name,
            description: schema.description,
            parameters: schema.input_schema,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserMessageData {
    #[serde(default)]
    pub tool_schemas: Vec<ToolSchema>,
    /// The document the user is working on, as the client serialized it.
    #[serde(default)]
    pub workflow_content: Option<String>,
}

impl UserMessageData {
    pub fn into_run_input(self, content: String) -> RunInput {
        let input = RunInput::text(content)
            .with_client_tools(self.tool_schemas.into_iter().map(ToolDefinition::from).collect());
        match self.workflow_content {
            Some(doc) => input.with_attachment(doc),
            None => input,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolCallResponseData {
    pub tool_call_id: String,
    #[serde(default)]
    pub tool_name: String,
    /// False when the client only approved or denied a server-side tool.
    #[serde(default = "yes")]
    pub is_client_tool: bool,
    #[serde(default = "yes")]
    pub is_allow: bool,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub error: Option<String>,
}

fn yes() -> bool {
    true
}

impl ToolCallResponseData {
    /// The response handed to the waiting execution.
    pub fn into_response(self) -> ToolResponse {
        if !self.is_client_tool {
            return ToolResponse {
                success: self.is_allow,
                output: String::new(),
                data: None,
            };
        }
        if !self.is_allow {
            return ToolResponse::failed("denied by user");
        }
        if let Some(error) = self.error {
            return ToolResponse::failed(error);
        }
        ToolResponse {
            success: self.success.unwrap_or(true),
            output: self.result.unwrap_or_default(),
            data: None,
        }
    }
}

// ── Server → client data ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptData {
    pub prompt_type: PromptKind,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequestData {
    pub tool_call_id: String,
    pub tool_name: String,
    /// Raw JSON argument string, as produced by the model.
    pub tool_args: String,
    pub is_client_tool: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteData {
    pub outcome: ExecutionOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clawlink_core::execution::ExecutionId;
    use clawlink_core::message::{ToolInvocation, TurnRecord};

    fn exec() -> ExecutionId {
        ExecutionId::new("s1", "r1")
    }

    #[test]
    fn parse_user_message() {
        let frame: Frame = serde_json::from_str(
            r#"{"type":"USER_MESSAGE","session_code":"s1","request_id":"r1","content":"hi",
                "data":{"tool_schemas":[{"name":"read_file","input_schema":{"type":"object"}}]},
                "timestamp":1}"#,
        )
        .unwrap();
        assert_eq!(frame.frame_type, FrameType::UserMessage);

        let input = frame
            .data_as::<UserMessageData>()
            .unwrap()
            .into_run_input(frame.content.clone().unwrap());
        assert_eq!(input.content, "hi");
        assert_eq!(input.client_tools[0].name, "read_file");
        assert!(input.attachment.is_none());
    }

    #[test]
    fn workflow_content_becomes_attachment() {
        let data: UserMessageData = serde_json::from_value(serde_json::json!({
            "workflow_content": "{\"nodes\":[1]}"
        }))
        .unwrap();
        let input = data.into_run_input("tidy this".into());
        assert_eq!(input.attachment.as_deref(), Some("{\"nodes\":[1]}"));
        assert!(input.user_turn().starts_with("tidy this\n\n<attachment>"));
    }

    #[test]
    fn missing_data_and_ids_default() {
        let frame: Frame = serde_json::from_str(r#"{"type":"PING"}"#).unwrap();
        assert_eq!(frame.session_code, "");
        assert!(frame.data_as::<UserMessageData>().unwrap().tool_schemas.is_empty());
    }

    #[test]
    fn unknown_type_rejected() {
        assert!(serde_json::from_str::<Frame>(r#"{"type":"USER_ORDER"}"#).is_err());
    }

    #[test]
    fn tool_call_responses() {
        let parse = |json: serde_json::Value| {
            serde_json::from_value::<ToolCallResponseData>(json)
                .unwrap()
                .into_response()
        };

        let ok = parse(serde_json::json!({"tool_call_id": "c1", "result": "3 hits"}));
        assert_eq!(ok, ToolResponse::ok("3 hits"));

        let err = parse(serde_json::json!({"tool_call_id": "c1", "error": "ENOENT"}));
        assert_eq!(err, ToolResponse::failed("ENOENT"));

        let denied = parse(serde_json::json!({"tool_call_id": "c1", "is_allow": false}));
        assert_eq!(denied, ToolResponse::failed("denied by user"));

        let approved = parse(serde_json::json!({"tool_call_id": "c1", "is_client_tool": false}));
        assert!(approved.success);
        let rejected = parse(serde_json::json!({
            "tool_call_id": "c1", "is_client_tool": false, "is_allow": false
        }));
        assert!(!rejected.success);
    }

    #[test]
    fn prompt_event_to_frame() {
        let frame = Frame::from_event(&AgentEvent::prompt(exec(), PromptKind::Thinking)).unwrap();
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "AGENT_PROMPT");
        assert_eq!(json["session_code"], "s1");
        assert_eq!(json["request_id"], "r1");
        assert_eq!(json["data"]["prompt_type"], "THINKING");
        assert_eq!(json["content"], "Thinking...");
    }

    #[test]
    fn tool_request_event_to_frame() {
        let event = AgentEvent::new(
            exec(),
            EventPayload::ToolRequest {
                call: ToolInvocation::new("c1", "search", r#"{"q":"x"}"#),
                route: ToolRoute::Approval,
            },
        );
        let frame = Frame::from_event(&event).unwrap();
        assert_eq!(frame.frame_type, FrameType::AgentToolCallRequest);
        let data: ToolCallRequestData = frame.data_as().unwrap();
        assert_eq!(data.tool_call_id, "c1");
        assert_eq!(data.tool_args, r#"{"q":"x"}"#);
        assert!(!data.is_client_tool);
    }

    #[test]
    fn complete_event_to_frame() {
        let event = AgentEvent::new(
            exec(),
            EventPayload::StreamComplete {
                outcome: ExecutionOutcome::MaxIterations,
                reason: Some("iteration cap".into()),
                final_text: String::new(),
            },
        );
        let json = serde_json::to_value(Frame::from_event(&event).unwrap()).unwrap();
        assert_eq!(json["type"], "AGENT_COMPLETE");
        assert_eq!(json["data"]["outcome"], "max_iterations");
        assert_eq!(json["timestamp"], event.timestamp.timestamp_millis());
    }

    #[test]
    fn persisted_records_are_not_forwarded() {
        let event = AgentEvent::new(
            exec(),
            EventPayload::MessagePersisted {
                index: 0,
                record: TurnRecord::user("hi"),
            },
        );
        assert!(Frame::from_event(&event).is_none());
    }

    #[test]
    fn error_frame() {
        let frame = Frame::error("s1", "", "bad frame");
        assert_eq!(frame.frame_type, FrameType::AgentPrompt);
        assert_eq!(frame.content.as_deref(), Some("bad frame"));
        let data: PromptData = frame.data_as().unwrap();
        assert_eq!(data.prompt_type, PromptKind::Error);
    }
}
