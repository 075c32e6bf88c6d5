//! The agent execution layer of ClawLink.
//!
//! The agent follows a **Reason → Act → Observe** cycle per run:
//!
//! 1. **Admit** the run through the session's execution gate
//! 2. **Send** system prompt + conversation + tool catalog to the model
//! 3. **If tool calls**: run local tools in-process, hand client tools to the
//!    connection and wait for their results, append every result, loop to 2
//! 4. **If text**: append the answer and finish
//!
//! The loop also stops on interruption or when the iteration cap is used up.

pub mod correlation;
pub mod executor;
pub mod runtime;
pub mod session;

#[cfg(test)]
mod test_helpers;

pub use correlation::{CorrelationError, CorrelationRegistry, ToolResponse, WaitHandle, WaitKey, WaitOutcome};
pub use executor::{ExecutionReport, ExecutorSettings, ReactExecutor, RunInput};
pub use runtime::{Admission, AgentRuntime, ExecutionHandle, RunError};
pub use session::{ExecutionGuard, SessionContext};
