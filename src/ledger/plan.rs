//! Plan pricing records.

use alloy_primitives::U256;
use serde::Serialize;

use super::PlanDescriptor;
use crate::chain::{normalize_address, parse_u256};
use crate::error::LedgerError;

/// Plan metadata resolved once per bridge and then treated as immutable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanRecord {
    pub plan_id: String,
    pub price_amounts_raw: Vec<U256>,
    pub price_token_address: String,
    pub credits_amount: u64,
    pub nft_contract_address: String,
    /// ERC-1155 token id of the credits; identical to the plan id.
    pub token_id: U256,
}

impl PlanRecord {
    pub fn from_descriptor(plan_id: &str, descriptor: PlanDescriptor) -> Result<Self, LedgerError> {
        let incomplete = |field| LedgerError::PlanIncomplete {
            plan_id: plan_id.to_string(),
            field,
        };

        let price_token_address = descriptor
            .token_address
            .as_deref()
            .ok_or_else(|| incomplete("settlement token address"))
            .and_then(|raw| normalize_address(raw).map_err(|_| incomplete("settlement token address")))?;
        let nft_contract_address = descriptor
            .nft_address
            .as_deref()
            .ok_or_else(|| incomplete("NFT contract address"))
            .and_then(|raw| normalize_address(raw).map_err(|_| incomplete("NFT contract address")))?;
        if descriptor.price_amounts.is_empty() {
            return Err(incomplete("price amounts"));
        }
        let token_id = parse_u256(plan_id, "plan id").map_err(|_| incomplete("numeric token id"))?;

        Ok(Self {
            plan_id: plan_id.to_string(),
            price_amounts_raw: descriptor.price_amounts,
            price_token_address,
            credits_amount: descriptor.credits_amount,
            nft_contract_address,
            token_id,
        })
    }

    /// Total price across all components, saturating on overflow.
    pub fn price_total(&self) -> U256 {
        self.price_amounts_raw
            .iter()
            .fold(U256::ZERO, |acc, amount| acc.saturating_add(*amount))
    }

    /// Price in human units when settled in the stablecoin, raw otherwise.
    pub fn cost(&self, stablecoin_address: &str, stablecoin_decimals: u32) -> PlanCost {
        let total = self.price_total();
        let is_stablecoin = normalize_address(stablecoin_address)
            .is_ok_and(|stablecoin| stablecoin == self.price_token_address);
        let price_normalized = if is_stablecoin {
            format_units(total, stablecoin_decimals)
        } else {
            total.to_string()
        };
        PlanCost {
            price_normalized,
            credits: self.credits_amount,
        }
    }
}

/// Human-facing plan cost.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanCost {
    pub price_normalized: String,
    pub credits: u64,
}

/// Render `raw / 10^decimals` as a decimal string without trailing zeros.
pub fn format_units(raw: U256, decimals: u32) -> String {
    let digits = raw.to_string();
    let decimals = decimals as usize;
    if decimals == 0 {
        return digits;
    }

    let padded = if digits.len() <= decimals {
        format!("{}{}", "0".repeat(decimals - digits.len() + 1), digits)
    } else {
        digits
    };
    let (whole, fraction) = padded.split_at(padded.len() - decimals);
    let fraction = fraction.trim_end_matches('0');
    if fraction.is_empty() {
        whole.to_string()
    } else {
        format!("{whole}.{fraction}")
    }
}
