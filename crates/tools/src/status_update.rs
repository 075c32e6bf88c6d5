//! Status update tool — a short progress note the agent wants the user to see.

use async_trait::async_trait;
use clawlink_core::error::ToolError;
use clawlink_core::tool::{Tool, ToolContext, ToolResult};

const MAX_STATUS_CHARS: usize = 200;

pub struct StatusUpdateTool;

#[async_trait]
impl Tool for StatusUpdateTool {
    fn name(&self) -> &str {
        "status_update"
    }

    fn description(&self) -> &str {
        "Tell the user what you are doing right now in one short sentence, e.g. 'Reading the config files'."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "status": {
                    "type": "string",
                    "description": "A short progress message (max 200 characters)"
                }
            },
            "required": ["status"]
        })
    }

    async fn execute(&self, ctx: &ToolContext, arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        let status = arguments["status"]
            .as_str()
            .map(str::trim)
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'status' argument".into()))?;

        if status.is_empty() {
            return Err(ToolError::InvalidArguments("Status must not be empty".into()));
        }
        let len = status.chars().count();
        if len > MAX_STATUS_CHARS {
            return Err(ToolError::InvalidArguments(format!(
                "Status is {len} characters, max is {MAX_STATUS_CHARS}"
            )));
        }

        Ok(ToolResult {
            call_id: ctx.call_id.clone(),
            success: true,
            output: status.to_string(),
            data: Some(serde_json::json!({
                "status": status,
                "timestamp": chrono::Utc::now().to_rfc3339(),
            })),
        })
    }
}
