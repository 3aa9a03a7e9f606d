//! JSON-RPC framing, SSE decoding and result normalization for MCP.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::ToolError;
use crate::tools::{ToolCallOutput, ToolCatalogEntry};

pub const PROTOCOL_VERSION: &str = "2025-03-26";
pub const SESSION_HEADER: &str = "mcp-session-id";
pub const PROTOCOL_VERSION_HEADER: &str = "mcp-protocol-version";

#[derive(Debug, Serialize)]
pub struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

impl<'a> JsonRpcRequest<'a> {
    pub fn call(id: u64, method: &'a str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id: Some(id),
            method,
            params: Some(params),
        }
    }

    pub fn notification(method: &'a str) -> Self {
        Self {
            jsonrpc: "2.0",
            id: None,
            method,
            params: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub id: Value,
    pub result: Option<Value>,
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
}

impl JsonRpcResponse {
    pub fn matches(&self, id: u64) -> bool {
        self.id.as_u64() == Some(id)
    }

    pub fn into_result(self, operation: &str) -> Result<Value, ToolError> {
        if let Some(error) = self.error {
            return Err(ToolError::Protocol {
                operation: operation.to_string(),
                reason: format!("JSON-RPC error {}: {}", error.code, error.message),
            });
        }
        self.result.ok_or_else(|| ToolError::Protocol {
            operation: operation.to_string(),
            reason: "response has neither result nor error".to_string(),
        })
    }
}

pub fn initialize_params() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        }
    })
}

/// Incremental `text/event-stream` decoder yielding each event's `data`.
///
/// Chunks are buffered as bytes and only decoded once an event is complete,
/// so a character split across chunks survives.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    /// Feed a chunk; returns the data of every event it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(end) = event_end(&self.buffer) {
            let block: Vec<u8> = self.buffer.drain(..end).collect();
            if let Some(data) = event_data(&String::from_utf8_lossy(&block)) {
                events.push(data);
            }
        }
        events
    }

    /// Flush a trailing event that was not terminated by a blank line.
    pub fn finish(&mut self) -> Option<String> {
        let block = std::mem::take(&mut self.buffer);
        event_data(&String::from_utf8_lossy(&block))
    }
}

/// Offset just past the first blank line (`\n\n`, `\r\n\r\n` or mixed).
fn event_end(buffer: &[u8]) -> Option<usize> {
    buffer.iter().enumerate().find_map(|(i, &byte)| {
        if byte != b'\n' {
            return None;
        }
        let mut next = i + 1;
        if buffer.get(next) == Some(&b'\r') {
            next += 1;
        }
        (buffer.get(next) == Some(&b'\n')).then_some(next + 1)
    })
}

fn event_data(block: &str) -> Option<String> {
    let lines: Vec<&str> = block
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| data.strip_prefix(' ').unwrap_or(data))
        .collect();
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

pub fn parse_tool_list(result: Value) -> Result<Vec<ToolCatalogEntry>, ToolError> {
    let tools = result.get("tools").cloned().unwrap_or(Value::Array(Vec::new()));
    serde_json::from_value(tools).map_err(|e| ToolError::Protocol {
        operation: "tools/list".to_string(),
        reason: format!("invalid tool catalog: {e}"),
    })
}

/// Normalize a `tools/call` result.
///
/// The output text is the first `text` content block; without one it is the
/// JSON of the whole result. `isError: true` becomes [`ToolError::Rejected`].
pub fn normalize_call_result(name: &str, result: Value) -> Result<ToolCallOutput, ToolError> {
    let output_text = first_text_block(&result).unwrap_or_else(|| result.to_string());

    if result.get("isError").and_then(Value::as_bool) == Some(true) {
        return Err(ToolError::Rejected {
            name: name.to_string(),
            message: output_text,
        });
    }

    let raw_content = result.get("content").cloned().unwrap_or(result);
    Ok(ToolCallOutput {
        output_text,
        raw_content,
    })
}

fn first_text_block(result: &Value) -> Option<String> {
    result
        .get("content")?
        .as_array()?
        .iter()
        .find(|block| block.get("type").and_then(Value::as_str) == Some("text"))
        .map(|block| match block.get("text") {
            Some(Value::String(text)) => text.clone(),
            Some(other) => other.to_string(),
            None => block.to_string(),
        })
}
