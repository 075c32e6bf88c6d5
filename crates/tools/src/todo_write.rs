//! Todo list tool — lets the agent plan multi-step work and track it.
//!
//! Each call replaces the whole list for the calling session. The rendered
//! list is returned so the model (and the user, through the tool result)
//! sees the current plan.

use async_trait::async_trait;
use clawlink_core::error::ToolError;
use clawlink_core::tool::{Tool, ToolContext, ToolResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
}

impl TodoStatus {
    fn marker(self) -> &'static str {
        match self {
            Self::Pending => "[ ]",
            Self::InProgress => "[~]",
            Self::Completed => "[x]",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoItem {
    pub content: String,
    pub status: TodoStatus,
}

#[derive(Deserialize)]
struct TodoArgs {
    todos: Vec<TodoItem>,
}

/// Per-session todo lists.
#[derive(Default)]
pub struct TodoWriteTool {
    lists: RwLock<HashMap<String, Vec<TodoItem>>>,
}

impl TodoWriteTool {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current list for a session (empty if never written).
    pub async fn list(&self, session_id: &str) -> Vec<TodoItem> {
        self.lists
            .read()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }
}

fn render(items: &[TodoItem]) -> String {
    if items.is_empty() {
        return "Todo list cleared.".into();
    }
    let done = items
        .iter()
        .filter(|i| i.status == TodoStatus::Completed)
        .count();
    let mut out = format!("Todos ({done}/{} completed):", items.len());
    for item in items {
        out.push('\n');
        out.push_str(item.status.marker());
        out.push(' ');
        out.push_str(&item.content);
    }
    out
}

#[async_trait]
impl Tool for TodoWriteTool {
    fn name(&self) -> &str {
        "todo_write"
    }

    fn description(&self) -> &str {
        "Create or update your todo list for the current task. Send the complete list every time; \
         it replaces the previous one. Keep at most one item in_progress."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "todos": {
                    "type": "array",
                    "description": "The full todo list",
                    "items": {
                        "type": "object",
                        "properties": {
                            "content": { "type": "string" },
                            "status": {
                                "type": "string",
                                "enum": ["pending", "in_progress", "completed"]
                            }
                        },
                        "required": ["content", "status"]
                    }
                }
            },
            "required": ["todos"]
        })
    }

    async fn execute(&self, ctx: &ToolContext, arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        let args: TodoArgs = serde_json::from_value(arguments)
            .map_err(|e| ToolError::InvalidArguments(format!("Invalid todo list: {e}")))?;

        if let Some(pos) = args.todos.iter().position(|i| i.content.trim().is_empty()) {
            return Err(ToolError::InvalidArguments(format!("Todo {pos} has empty content")));
        }
        let in_progress = args
            .todos
            .iter()
            .filter(|i| i.status == TodoStatus::InProgress)
            .count();
        if in_progress > 1 {
            return Err(ToolError::InvalidArguments(format!(
                "Only one todo may be in_progress, got {in_progress}"
            )));
        }

        let output = render(&args.todos);
        let data = serde_json::json!({ "todos": args.todos });
        debug!(session_id = %ctx.session_id, items = args.todos.len(), "Todo list updated");
        self.lists
            .write()
            .await
            .insert(ctx.session_id.clone(), args.todos);

        Ok(ToolResult {
            call_id: ctx.call_id.clone(),
            success: true,
            output,
            data: Some(data),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(session: &str) -> ToolContext {
        ToolContext {
            session_id: session.into(),
            request_id: "r1".into(),
            call_id: "call_1".into(),
        }
    }

    #[test]
    fn tool_definition() {
        let tool = TodoWriteTool::new();
        assert_eq!(tool.name(), "todo_write");
        let schema = tool.parameters_schema();
        assert_eq!(schema["required"], serde_json::json!(["todos"]));
    }

    #[tokio::test]
    async fn write_and_render() {
        let tool = TodoWriteTool::new();
        let result = tool
            .execute(
                &ctx("s1"),
                serde_json::json!({
                    "todos": [
                        { "content": "Read the logs", "status": "completed" },
                        { "content": "Find the bug", "status": "in_progress" },
                        { "content": "Write the fix", "status": "pending" }
                    ]
                }),
            )
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.call_id, "call_1");
        assert_eq!(
            result.output,
            "Todos (1/3 completed):\n[x] Read the logs\n[~] Find the bug\n[ ] Write the fix"
        );
        assert_eq!(tool.list("s1").await.len(), 3);
    }

    #[tokio::test]
    async fn lists_are_per_session_and_replaced() {
        let tool = TodoWriteTool::new();
        let one = serde_json::json!({ "todos": [{ "content": "a", "status": "pending" }] });
        tool.execute(&ctx("s1"), one).await.unwrap();
        tool.execute(&ctx("s2"), serde_json::json!({ "todos": [] }))
            .await
            .unwrap();

        let two = serde_json::json!({
            "todos": [{ "content": "b", "status": "completed" }, { "content": "c", "status": "pending" }]
        });
        tool.execute(&ctx("s1"), two).await.unwrap();

        let s1 = tool.list("s1").await;
        assert_eq!(s1.len(), 2);
        assert_eq!(s1[0].content, "b");
        assert!(tool.list("s2").await.is_empty());
        assert!(tool.list("unknown").await.is_empty());
    }

    #[tokio::test]
    async fn empty_list_clears() {
        let tool = TodoWriteTool::new();
        let result = tool
            .execute(&ctx("s1"), serde_json::json!({ "todos": [] }))
            .await
            .unwrap();
        assert_eq!(result.output, "Todo list cleared.");
    }

    #[tokio::test]
    async fn invalid_status_rejected() {
        let tool = TodoWriteTool::new();
        let err = tool
            .execute(
                &ctx("s1"),
                serde_json::json!({ "todos": [{ "content": "a", "status": "blocked" }] }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }

    #[tokio::test]
    async fn missing_todos_and_blank_content_rejected() {
        let tool = TodoWriteTool::new();
        assert!(tool.execute(&ctx("s1"), serde_json::json!({})).await.is_err());
        assert!(
            tool.execute(
                &ctx("s1"),
                serde_json::json!({ "todos": [{ "content": "  ", "status": "pending" }] })
            )
            .await
            .is_err()
        );
    }

    #[tokio::test]
    async fn two_in_progress_rejected() {
        let tool = TodoWriteTool::new();
        let result = tool
            .execute(
                &ctx("s1"),
                serde_json::json!({
                    "todos": [
                        { "content": "a", "status": "in_progress" },
                        { "content": "b", "status": "in_progress" }
                    ]
                }),
            )
            .await;
        assert!(result.is_err());
        assert!(tool.list("s1").await.is_empty());
    }
}
