//! Turn records — the units of conversation history.
//!
//! A session's history is an ordered log of [`TurnRecord`]s:
//! User sends a message → Agent calls the model → model requests tools →
//! tool results come back → model answers.
//!
//! The set of record kinds is closed. Every consumer (providers, persistence,
//! the gateway) matches exhaustively on it.

use serde::{Deserialize, Serialize};

/// The role of a record's producer, as sent to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions
    System,
    /// The end user
    User,
    /// The AI assistant
    Assistant,
    /// Tool execution result
    Tool,
}

/// A tool invocation requested by the model inside an assistant turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolInvocation {
    /// Unique ID for this call (assigned by the model)
    pub id: String,

    /// Name of the tool to invoke
    pub name: String,

    /// Arguments as a raw JSON string
    pub arguments: String,
}

impl ToolInvocation {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }

    /// Parse the raw argument string, falling back to an empty object.
    pub fn arguments_json(&self) -> serde_json::Value {
        if self.arguments.trim().is_empty() {
            return serde_json::json!({});
        }
        serde_json::from_str(&self.arguments).unwrap_or_else(|_| serde_json::json!({}))
    }
}

/// One immutable unit of conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TurnRecord {
    /// Instructions for the model.
    System { content: String },

    /// Input from the end user.
    User { content: String },

    /// Model output: either a final answer or a set of tool invocations
    /// (optionally with accompanying text).
    Assistant {
        content: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolInvocation>,
    },

    /// The result of one tool invocation.
    ToolResult {
        call_id: String,
        tool_name: String,
        success: bool,
        content: String,
    },
}

impl TurnRecord {
    pub fn system(content: impl Into<String>) -> Self {
        Self::System {
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::User {
            content: content.into(),
        }
    }

    /// A final assistant answer with no tool calls.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::Assistant {
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }

    /// An assistant turn that requests tool invocations.
    pub fn assistant_with_tools(content: impl Into<String>, tool_calls: Vec<ToolInvocation>) -> Self {
        Self::Assistant {
            content: content.into(),
            tool_calls,
        }
    }

    pub fn tool_result(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        success: bool,
        content: impl Into<String>,
    ) -> Self {
        Self::ToolResult {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            success,
            content: content.into(),
        }
    }

    pub fn role(&self) -> Role {
        match self {
            Self::System { .. } => Role::System,
            Self::User { .. } => Role::User,
            Self::Assistant { .. } => Role::Assistant,
            Self::ToolResult { .. } => Role::Tool,
        }
    }

    pub fn content(&self) -> &str {
        match self {
            Self::System { content }
            | Self::User { content }
            | Self::Assistant { content, .. }
            | Self::ToolResult { content, .. } => content,
        }
    }

    /// Tool invocations carried by an assistant record (empty otherwise).
    pub fn tool_calls(&self) -> &[ToolInvocation] {
        match self {
            Self::Assistant { tool_calls, .. } => tool_calls,
            Self::System { .. } | Self::User { .. } | Self::ToolResult { .. } => &[],
        }
    }

    /// The call this record answers, if it is a tool result.
    pub fn answered_call_id(&self) -> Option<&str> {
        match self {
            Self::ToolResult { call_id, .. } => Some(call_id),
            Self::System { .. } | Self::User { .. } | Self::Assistant { .. } => None,
        }
    }

    /// Short label used in logs and persistence.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::System { .. } => "system",
            Self::User { .. } => "user",
            Self::Assistant { .. } => "assistant",
            Self::ToolResult { .. } => "tool_result",
        }
    }
}

/// Check that every tool result answers an earlier, not yet answered, tool
/// call, that no call is answered twice and that no call is left without a
/// result.
///
/// Returns the number of matched (invocation, result) pairs.
pub fn matched_tool_pairs(records: &[TurnRecord]) -> Result<usize, String> {
    let mut outstanding: Vec<&str> = Vec::new();
    let mut answered: Vec<&str> = Vec::new();
    let mut pairs = 0;

    for (idx, record) in records.iter().enumerate() {
        match record {
            TurnRecord::Assistant { tool_calls, .. } => {
                outstanding.extend(tool_calls.iter().map(|c| c.id.as_str()));
            }
            TurnRecord::ToolResult { call_id, .. } => {
                if answered.contains(&call_id.as_str()) {
                    return Err(format!("record {idx}: call '{call_id}' answered twice"));
                }
                let Some(pos) = outstanding.iter().position(|id| *id == call_id) else {
                    return Err(format!("record {idx}: result for unknown call '{call_id}'"));
                };
                outstanding.remove(pos);
                answered.push(call_id);
                pairs += 1;
            }
            TurnRecord::System { .. } | TurnRecord::User { .. } => {}
        }
    }

    if !outstanding.is_empty() {
        return Err(format!("calls never answered: {}", outstanding.join(", ")));
    }
    Ok(pairs)
}

/// Invocations of the last assistant record that have no result yet.
pub fn unanswered_tool_calls(records: &[TurnRecord]) -> Vec<ToolInvocation> {
    let Some(pos) = records.iter().rposition(|r| matches!(r, TurnRecord::Assistant { .. })) else {
        return Vec::new();
    };
    let answered: Vec<&str> = records[pos + 1..]
        .iter()
        .filter_map(TurnRecord::answered_call_id)
        .collect();
    records[pos]
        .tool_calls()
        .iter()
        .filter(|c| !answered.contains(&c.id.as_str()))
        .cloned()
        .collect()
}

/// Give every unanswered invocation a failed result, placed right after the
/// results its assistant record did get.
///
/// Returns the repaired log and how many results were added.
pub fn close_unanswered_calls(records: Vec<TurnRecord>, reason: &str) -> (Vec<TurnRecord>, usize) {
    fn settle(out: &mut Vec<TurnRecord>, open: &mut Vec<ToolInvocation>, reason: &str) -> usize {
        let added = open.len();
        out.extend(
            open.drain(..)
                .map(|c| TurnRecord::tool_result(c.id, c.name, false, reason)),
        );
        added
    }

    let mut out = Vec::with_capacity(records.len());
    let mut open: Vec<ToolInvocation> = Vec::new();
    let mut added = 0;

    for record in records {
        match &record {
            TurnRecord::ToolResult { call_id, .. } => open.retain(|c| c.id != *call_id),
            TurnRecord::System { .. } | TurnRecord::User { .. } | TurnRecord::Assistant { .. } => {
                added += settle(&mut out, &mut open, reason);
                open.extend(record.tool_calls().iter().cloned());
            }
        }
        out.push(record);
    }
    added += settle(&mut out, &mut open, reason);

    (out, added)
}

/// The most recent `max` records, widened backwards so the window never
/// opens on a tool result whose invocation fell outside it. `0` keeps
/// everything.
pub fn history_window(records: &[TurnRecord], max: usize) -> &[TurnRecord] {
    if max == 0 || records.len() <= max {
        return records;
    }
    let mut start = records.len() - max;
    while start > 0 && matches!(records[start], TurnRecord::ToolResult { .. }) {
        start -= 1;
    }
    &records[start..]
}
