//! Remote tool execution.
//!
//! Tools live on a remote MCP server that charges credits per call. Every
//! gateway operation authenticates with a fresh plan-scoped access token.

pub mod mcp;

use async_trait::async_trait;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Error;
use crate::ledger::CreditLedgerBridge;

/// A remotely invocable tool as advertised by `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCatalogEntry {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "empty_object_schema")]
    pub input_schema: Value,
}

fn empty_object_schema() -> Value {
    serde_json::json!({ "type": "object" })
}

/// Normalized result of a tool call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCallOutput {
    pub output_text: String,
    pub raw_content: Value,
}

/// Tool listing and invocation.
///
/// Implementations must keep "could not reach the tool server" (an
/// upstream error) apart from "the tool ran and reported failure"
/// ([`crate::error::ToolError::Rejected`]).
#[async_trait]
pub trait ToolGateway: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<ToolCatalogEntry>, Error>;

    async fn call_tool(&self, name: &str, args: &Map<String, Value>) -> Result<ToolCallOutput, Error>;
}

/// Source of the short-lived bearer token presented to the tool server.
#[async_trait]
pub trait AccessTokenSource: Send + Sync {
    async fn access_token(&self) -> Result<SecretString, Error>;
}

#[async_trait]
impl AccessTokenSource for CreditLedgerBridge {
    async fn access_token(&self) -> Result<SecretString, Error> {
        let token = CreditLedgerBridge::access_token(self).await?;
        if let Some(expires_at) = token.expires_at {
            tracing::debug!(%expires_at, "issued tool server access token");
        }
        Ok(token.token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_entry_defaults_missing_schema() {
        let entry: ToolCatalogEntry =
            serde_json::from_value(serde_json::json!({ "name": "weather.today" })).unwrap();
        assert_eq!(entry.input_schema, serde_json::json!({ "type": "object" }));
        assert_eq!(entry.description, None);
    }
}
