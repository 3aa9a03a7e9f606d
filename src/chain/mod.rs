//! Read-only access to the settlement chain over Ethereum JSON-RPC.
//!
//! Everything here is side-effect free, so a single client can be shared
//! freely across requests.

pub mod events;

use std::str::FromStr;
use std::time::Duration;

use alloy_primitives::U256;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::ChainError;

pub use events::{ChainEvent, EventKind, EventLocator};

/// The all-zero address; the native token when used as a settlement token.
pub const ZERO_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

/// `balanceOf(address)` selector.
const ERC20_BALANCE_OF_SELECTOR: &str = "70a08231";

/// Log query filter. Topic positions set to `None` match anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilter {
    pub address: String,
    pub topics: Vec<Option<String>>,
    pub from_block: u64,
    pub to_block: u64,
}

/// A raw log entry as returned by `eth_getLogs`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RpcLog {
    pub address: String,
    #[serde(default)]
    pub topics: Vec<String>,
    pub data: String,
    pub block_number: Option<String>,
    pub transaction_hash: Option<String>,
    pub log_index: Option<String>,
}

/// Chain RPC capability consumed by the ledger bridge and event locator.
#[async_trait]
pub trait ChainRpc: Send + Sync {
    /// Current chain head.
    async fn block_number(&self) -> Result<u64, ChainError>;

    /// ERC20 `balanceOf(owner)` on `token`.
    async fn erc20_balance(&self, token: &str, owner: &str) -> Result<U256, ChainError>;

    /// Native-token balance of `owner`.
    async fn native_balance(&self, owner: &str) -> Result<U256, ChainError>;

    /// Logs matching `filter`, inclusive block range.
    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<RpcLog>, ChainError>;
}

/// JSON-RPC over HTTP.
#[derive(Debug, Clone)]
pub struct HttpChainRpc {
    client: reqwest::Client,
    rpc_url: String,
}

impl HttpChainRpc {
    pub fn new(rpc_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            rpc_url: rpc_url.into(),
        }
    }

    pub fn from_config(config: &crate::config::ChainConfig) -> Self {
        Self::new(config.rpc_url.clone(), config.timeout)
    }

    async fn rpc_call(&self, method: &str, params: Value) -> Result<Value, ChainError> {
        let body = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        });

        let response = self
            .client
            .post(&self.rpc_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ChainError::Rpc {
                method: method.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ChainError::Rpc {
                method: method.to_string(),
                reason: format!("HTTP {}", status.as_u16()),
            });
        }

        let value: Value = response.json().await.map_err(|e| ChainError::Rpc {
            method: method.to_string(),
            reason: format!("failed to parse response JSON: {e}"),
        })?;
        if let Some(error) = value.get("error") {
            return Err(ChainError::RpcReturned {
                method: method.to_string(),
                detail: error.to_string(),
            });
        }
        value.get("result").cloned().ok_or_else(|| ChainError::Decode {
            field: format!("{method} result"),
            reason: "missing".to_string(),
        })
    }

    async fn quantity_call(&self, method: &str, params: Value) -> Result<U256, ChainError> {
        let result = self.rpc_call(method, params).await?;
        let raw = result.as_str().ok_or_else(|| ChainError::Decode {
            field: format!("{method} result"),
            reason: "expected a hex string".to_string(),
        })?;
        parse_hex_u256(raw, method)
    }
}

#[async_trait]
impl ChainRpc for HttpChainRpc {
    async fn block_number(&self) -> Result<u64, ChainError> {
        let result = self.rpc_call("eth_blockNumber", json!([])).await?;
        let raw = result.as_str().ok_or_else(|| ChainError::Decode {
            field: "eth_blockNumber".to_string(),
            reason: "expected a hex string".to_string(),
        })?;
        parse_hex_u64(raw, "eth_blockNumber")
    }

    async fn erc20_balance(&self, token: &str, owner: &str) -> Result<U256, ChainError> {
        let token = normalize_address(token)?;
        let calldata = format!(
            "0x{}{}",
            ERC20_BALANCE_OF_SELECTOR,
            address_to_topic(owner)?.trim_start_matches("0x")
        );
        self.quantity_call("eth_call", json!([{ "to": token, "data": calldata }, "latest"]))
            .await
    }

    async fn native_balance(&self, owner: &str) -> Result<U256, ChainError> {
        let owner = normalize_address(owner)?;
        self.quantity_call("eth_getBalance", json!([owner, "latest"]))
            .await
    }

    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<RpcLog>, ChainError> {
        let topics: Vec<Value> = filter
            .topics
            .iter()
            .map(|topic| match topic {
                Some(topic) => Value::String(topic.clone()),
                None => Value::Null,
            })
            .collect();
        let params = json!([{
            "address": filter.address,
            "topics": topics,
            "fromBlock": format!("0x{:x}", filter.from_block),
            "toBlock": format!("0x{:x}", filter.to_block),
        }]);

        let result = self.rpc_call("eth_getLogs", params).await?;
        serde_json::from_value::<Vec<RpcLog>>(result).map_err(|e| ChainError::Decode {
            field: "eth_getLogs result".to_string(),
            reason: e.to_string(),
        })
    }
}

pub fn parse_hex_u64(raw: &str, field: &str) -> Result<u64, ChainError> {
    let value = raw.trim();
    let without_prefix = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .ok_or_else(|| ChainError::Decode {
            field: field.to_string(),
            reason: "must be 0x-prefixed hex".to_string(),
        })?;
    u64::from_str_radix(without_prefix, 16).map_err(|e| ChainError::Decode {
        field: field.to_string(),
        reason: e.to_string(),
    })
}

pub fn parse_hex_u256(raw: &str, field: &str) -> Result<U256, ChainError> {
    let value = raw.trim().to_ascii_lowercase();
    let without_prefix = value.strip_prefix("0x").ok_or_else(|| ChainError::Decode {
        field: field.to_string(),
        reason: "must be 0x-prefixed hex".to_string(),
    })?;
    let digits = without_prefix.trim_start_matches('0');
    if digits.is_empty() {
        return Ok(U256::ZERO);
    }
    if digits.len() > 64 {
        return Err(ChainError::Decode {
            field: field.to_string(),
            reason: "exceeds 32 bytes".to_string(),
        });
    }
    U256::from_str_radix(digits, 16).map_err(|e| ChainError::Decode {
        field: field.to_string(),
        reason: e.to_string(),
    })
}

/// Parse a decimal or 0x-hex integer, e.g. a plan id used as an ERC-1155 token id.
pub fn parse_u256(raw: &str, field: &str) -> Result<U256, ChainError> {
    let trimmed = raw.trim();
    if trimmed.starts_with("0x") || trimmed.starts_with("0X") {
        return parse_hex_u256(trimmed, field);
    }
    if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ChainError::Decode {
            field: field.to_string(),
            reason: format!("'{trimmed}' is not a decimal integer"),
        });
    }
    U256::from_str(trimmed).map_err(|e| ChainError::Decode {
        field: field.to_string(),
        reason: e.to_string(),
    })
}

pub fn normalize_address(raw: &str) -> Result<String, ChainError> {
    let trimmed = raw.trim().to_ascii_lowercase();
    let valid = trimmed.len() == 42
        && trimmed.starts_with("0x")
        && trimmed.bytes().skip(2).all(|byte| byte.is_ascii_hexdigit());
    if !valid {
        return Err(ChainError::InvalidAddress(raw.to_string()));
    }
    Ok(trimmed)
}

/// Left-pad an address into a 32-byte topic word.
pub fn address_to_topic(raw: &str) -> Result<String, ChainError> {
    let normalized = normalize_address(raw)?;
    Ok(format!("0x{:0>64}", normalized.trim_start_matches("0x")))
}

pub fn is_zero_address(raw: &str) -> bool {
    normalize_address(raw).is_ok_and(|address| address == ZERO_ADDRESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_topic_is_left_padded() {
        let topic = address_to_topic("0x1111111111111111111111111111111111111111").unwrap();
        assert_eq!(
            topic,
            "0x0000000000000000000000001111111111111111111111111111111111111111"
        );
    }

    #[test]
    fn address_normalization_lowercases_and_validates() {
        assert_eq!(
            normalize_address("0xABCDEFabcdef0000000000000000000000000001").unwrap(),
            "0xabcdefabcdef0000000000000000000000000001"
        );
        assert!(normalize_address("0x123").is_err());
        assert!(normalize_address("1111111111111111111111111111111111111111xx").is_err());
    }

    #[test]
    fn hex_quantities_parse() {
        assert_eq!(parse_hex_u64("0x1a", "n").unwrap(), 26);
        assert!(parse_hex_u64("1a", "n").is_err());
        assert_eq!(parse_hex_u256("0x0", "v").unwrap(), U256::ZERO);
        assert_eq!(
            parse_hex_u256(
                "0x00000000000000000000000000000000000000000000000000000000004c4b40",
                "v"
            )
            .unwrap(),
            U256::from(5_000_000u64)
        );
    }

    #[test]
    fn plan_ids_parse_as_decimal_or_hex() {
        let decimal = parse_u256(
            "84510296744373839447364016464374522574917451025736539155539024766219637466398",
            "plan id",
        )
        .unwrap();
        assert!(decimal > U256::from(u128::MAX));
        assert_eq!(parse_u256("0x10", "plan id").unwrap(), U256::from(16u64));
        assert!(parse_u256("did:plan:1", "plan id").is_err());
    }

    #[test]
    fn zero_address_detection() {
        assert!(is_zero_address(ZERO_ADDRESS));
        assert!(!is_zero_address("0x036cbd53842c5426634e7929541ec2318f3dcf7e"));
    }
}
