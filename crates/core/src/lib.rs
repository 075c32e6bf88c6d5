//! # ClawLink Core
//!
//! Domain types, traits, and error definitions for the ClawLink agent
//! runtime. Every other crate in the workspace depends inward on this one.
//!
//! ## Design Philosophy
//!
//! Collaborators of the agent loop (model providers, local tools, event
//! listeners) are defined as traits or closures here. Implementations live
//! in their respective crates, so tests can swap in scripted stand-ins.

pub mod error;
pub mod event;
pub mod execution;
pub mod message;
pub mod provider;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use error::{Error, MemoryError, ProviderError, Result, ToolError};
pub use event::{AgentEvent, EventDispatcher, EventKind, EventPayload, PromptKind, SubscriptionId};
pub use execution::{ExecutionId, ExecutionOutcome, ExecutionPhase};
pub use message::{Role, ToolInvocation, TurnRecord};
pub use provider::{Provider, ProviderRequest, ProviderResponse, StreamChunk, ToolDefinition};
pub use tool::{Tool, ToolCall, ToolContext, ToolRegistry, ToolResult, ToolRoute};
