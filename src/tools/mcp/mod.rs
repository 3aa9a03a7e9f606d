//! Model Context Protocol tool gateway over Streamable HTTP.

mod client;
pub mod health;
pub mod protocol;

pub use client::McpToolGateway;
pub use health::{ToolServerHealth, ToolServerHealthState, probe_tool_server};
pub use protocol::normalize_call_result;
