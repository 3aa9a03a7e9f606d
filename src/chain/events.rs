//! Locate credit mint/burn events in chain logs.
//!
//! Credits are ERC-1155 balances, so a mint is a `TransferSingle` from the
//! zero address to the wallet and a burn is a `TransferSingle` from the
//! wallet to the zero address. Lookups are single-shot: retrying until an
//! event shows up is the caller's business.

use std::sync::Arc;

use alloy_primitives::{U256, keccak256};
use serde::{Serialize, Serializer};

use super::{ChainRpc, LogFilter, RpcLog, ZERO_ADDRESS, address_to_topic, parse_hex_u64};
use crate::error::ChainError;

const TRANSFER_SINGLE_SIGNATURE: &str = "TransferSingle(address,address,address,uint256,uint256)";

/// Which side of the zero address the transfer sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Transfer from the zero address: credits added.
    Mint,
    /// Transfer to the zero address: credits consumed.
    Burn,
}

/// An observed mint or burn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainEvent {
    pub kind: EventKind,
    pub tx_hash: String,
    #[serde(serialize_with = "serialize_decimal")]
    pub value: U256,
    pub block_number: u64,
}

pub(crate) fn serialize_decimal<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&value.to_string())
}

/// Stateless scanner over `eth_getLogs`.
#[derive(Clone)]
pub struct EventLocator {
    rpc: Arc<dyn ChainRpc>,
    max_block_range: u64,
}

impl EventLocator {
    pub fn new(rpc: Arc<dyn ChainRpc>, max_block_range: u64) -> Self {
        Self {
            rpc,
            max_block_range: max_block_range.max(1),
        }
    }

    /// Find the first matching event at or after `from_block`, in ascending
    /// block order. `None` means nothing has landed yet.
    pub async fn find_event(
        &self,
        kind: EventKind,
        contract: &str,
        wallet: &str,
        asset_id: U256,
        from_block: u64,
    ) -> Result<Option<ChainEvent>, ChainError> {
        let head = self.rpc.block_number().await?;
        if from_block > head {
            return Ok(None);
        }

        let wallet_topic = address_to_topic(wallet)?;
        let zero_topic = address_to_topic(ZERO_ADDRESS)?;
        let (from_topic, to_topic) = match kind {
            EventKind::Mint => (zero_topic, wallet_topic),
            EventKind::Burn => (wallet_topic, zero_topic),
        };
        let address = super::normalize_address(contract)?;

        let mut start = from_block;
        while start <= head {
            let end = head.min(start.saturating_add(self.max_block_range - 1));
            let filter = LogFilter {
                address: address.clone(),
                topics: vec![
                    Some(transfer_single_topic()),
                    None,
                    Some(from_topic.clone()),
                    Some(to_topic.clone()),
                ],
                from_block: start,
                to_block: end,
            };

            let logs = self.rpc.get_logs(&filter).await?;
            let mut matches = Vec::new();
            for log in &logs {
                if let Some(found) = decode_transfer_single(kind, log, asset_id)? {
                    matches.push(found);
                }
            }
            if let Some(first) = matches.into_iter().min_by_key(|(position, _)| *position) {
                tracing::debug!(
                    kind = ?kind,
                    block = first.1.block_number,
                    tx = %first.1.tx_hash,
                    "located credit event"
                );
                return Ok(Some(first.1));
            }

            match end.checked_add(1) {
                Some(next) => start = next,
                None => break,
            }
        }

        Ok(None)
    }
}

fn transfer_single_topic() -> String {
    format!("0x{}", alloy_primitives::hex::encode(keccak256(TRANSFER_SINGLE_SIGNATURE.as_bytes())))
}

/// Decode a `TransferSingle` log; `None` when it's for another token id.
/// Returns `((block, log_index), event)` so callers can order matches.
fn decode_transfer_single(
    kind: EventKind,
    log: &RpcLog,
    asset_id: U256,
) -> Result<Option<((u64, u64), ChainEvent)>, ChainError> {
    let data = log.data.trim().trim_start_matches("0x");
    if !data.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ChainError::Decode {
            field: "TransferSingle data".to_string(),
            reason: "not hex".to_string(),
        });
    }
    if data.len() < 128 {
        return Err(ChainError::Decode {
            field: "TransferSingle data".to_string(),
            reason: format!("expected 2 words, got {} hex chars", data.len()),
        });
    }
    let id = super::parse_hex_u256(&format!("0x{}", &data[..64]), "TransferSingle id")?;
    if id != asset_id {
        return Ok(None);
    }
    let value = super::parse_hex_u256(&format!("0x{}", &data[64..128]), "TransferSingle value")?;

    // Pending logs carry no block number; they can't confirm anything yet.
    let Some(block_raw) = log.block_number.as_deref() else {
        return Ok(None);
    };
    let block_number = parse_hex_u64(block_raw, "blockNumber")?;
    let log_index = log
        .log_index
        .as_deref()
        .map(|raw| parse_hex_u64(raw, "logIndex"))
        .transpose()?
        .unwrap_or(0);
    let tx_hash = log
        .transaction_hash
        .clone()
        .ok_or_else(|| ChainError::Decode {
            field: "transactionHash".to_string(),
            reason: "missing".to_string(),
        })?;

    Ok(Some((
        (block_number, log_index),
        ChainEvent {
            kind,
            tx_hash,
            value,
            block_number,
        },
    )))
}
