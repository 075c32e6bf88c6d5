//! Built-in local tool implementations for ClawLink.
//!
//! These tools run in-process. Everything that touches the user's machine
//! (files, shell, browser) is declared by the connected client and routed
//! back over the connection instead.

pub mod status_update;
pub mod todo_write;

use clawlink_core::tool::{Tool, ToolRegistry};
use tracing::warn;

pub use status_update::StatusUpdateTool;
pub use todo_write::{TodoItem, TodoStatus, TodoWriteTool};

/// Create a registry with all built-in tools.
pub fn default_registry() -> ToolRegistry {
    builtin_registry(&[])
}

/// Built-in tools, with the ones named in `approval` gated on the client's
/// consent.
pub fn builtin_registry(approval: &[String]) -> ToolRegistry {
    let builtins: Vec<Box<dyn Tool>> = vec![Box::new(TodoWriteTool::new()), Box::new(StatusUpdateTool)];

    let mut registry = ToolRegistry::new();
    for tool in builtins {
        if approval.iter().any(|name| name == tool.name()) {
            registry.register_with_approval(tool);
        } else {
            registry.register(tool);
        }
    }
    for name in approval.iter().filter(|name| !registry.contains(name)) {
        warn!(tool = %name, "Approval configured for an unknown tool");
    }
    registry
}
