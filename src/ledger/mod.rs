//! Prepaid credit ledger: balance, pricing, purchase, redemption and
//! on-chain confirmation.
//!
//! The ledger service itself (plan registry, order/burn primitives, access
//! tokens) sits behind [`LedgerBackend`]; [`CreditLedgerBridge`] layers the
//! pre-flight checks and chain confirmation on top of it.

mod bridge;
pub mod confirm;
mod http;
pub mod plan;

use alloy_primitives::U256;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;

use crate::error::LedgerError;

pub use bridge::{BurnConfirmation, CreditLedgerBridge, OrderFailure, OrderOutcome, RedeemOutcome};
pub use confirm::{ConfirmationPoller, PollState};
pub use http::HttpLedgerBackend;
pub use plan::{PlanCost, PlanRecord, format_units};

/// Remote plan descriptor as published by the ledger service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanDescriptor {
    /// Raw integer price components; the plan price is their sum.
    pub price_amounts: Vec<U256>,
    pub token_address: Option<String>,
    pub credits_amount: u64,
    pub nft_address: Option<String>,
}

/// Result of the purchase primitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderReceipt {
    pub success: bool,
    pub tx_hash: Option<String>,
    pub message: Option<String>,
}

/// Result of the redemption (burn) primitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BurnReceipt {
    pub success: bool,
    pub tx_hash: Option<String>,
    pub message: Option<String>,
}

/// Short-lived bearer credential scoped to a plan + agent pair.
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: SecretString,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Ledger library surface consumed by the bridge.
#[async_trait]
pub trait LedgerBackend: Send + Sync {
    /// Credits currently available to the principal under `plan_id`.
    async fn plan_balance(&self, plan_id: &str) -> Result<u64, LedgerError>;

    async fn plan_descriptor(&self, plan_id: &str) -> Result<PlanDescriptor, LedgerError>;

    /// Purchase the plan for the principal.
    async fn order_plan(&self, plan_id: &str) -> Result<OrderReceipt, LedgerError>;

    /// Burn `amount` credits of the plan from the principal.
    async fn burn_credits(&self, plan_id: &str, amount: &str) -> Result<BurnReceipt, LedgerError>;

    async fn agent_access_token(
        &self,
        plan_id: &str,
        agent_id: &str,
    ) -> Result<AccessToken, LedgerError>;

    /// Wallet address of the authenticated principal, if the service knows one.
    async fn wallet_address(&self) -> Result<Option<String>, LedgerError>;
}
