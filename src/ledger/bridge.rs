use std::future::Future;
use std::sync::Arc;

use alloy_primitives::U256;
use serde::Serialize;
use tokio::sync::OnceCell;

use super::confirm::{ConfirmationPoller, PollState};
use super::plan::{PlanCost, PlanRecord};
use super::{AccessToken, LedgerBackend};
use crate::chain::events::serialize_decimal;
use crate::chain::{ChainRpc, EventKind, EventLocator, is_zero_address, normalize_address, parse_u256};
use crate::config::{ConfirmationConfig, LedgerConfig};
use crate::error::{ConfigError, Error, LedgerError, redact_sensitive_detail};

/// Why a purchase did not go through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderFailure {
    InsufficientBalance,
    PurchaseFailed,
}

/// Outcome of [`CreditLedgerBridge::order_plan`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_optional_decimal"
    )]
    pub credits_granted: Option<U256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<OrderFailure>,
    pub message: String,
}

fn serialize_optional_decimal<S: serde::Serializer>(
    value: &Option<U256>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match value {
        Some(value) => serialize_decimal(value, serializer),
        None => serializer.serialize_none(),
    }
}

/// Outcome of [`CreditLedgerBridge::redeem_credits`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RedeemOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    pub message: String,
}

/// Terminal result of [`CreditLedgerBridge::find_burn_confirmation`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BurnConfirmation {
    Confirmed {
        tx_hash: String,
        #[serde(serialize_with = "serialize_decimal")]
        credits: U256,
        plan_id: String,
        attempts: u32,
    },
    NotFound {
        attempts: u32,
    },
    Cancelled {
        attempts: u32,
    },
}

/// Ledger operations for one principal and one plan.
///
/// Plan metadata is fetched on first use and cached for the lifetime of the
/// bridge; balances are always queried fresh. Purchases and redemptions are
/// not serialized here: two concurrent `order_plan` calls can both pass the
/// pre-flight balance check.
pub struct CreditLedgerBridge {
    backend: Arc<dyn LedgerBackend>,
    rpc: Arc<dyn ChainRpc>,
    locator: EventLocator,
    poller: ConfirmationPoller,
    plan_id: String,
    agent_id: String,
    wallet_override: Option<String>,
    stablecoin_address: String,
    stablecoin_decimals: u32,
    plan: OnceCell<PlanRecord>,
}

impl CreditLedgerBridge {
    pub fn new(
        config: &LedgerConfig,
        confirmation: ConfirmationConfig,
        backend: Arc<dyn LedgerBackend>,
        rpc: Arc<dyn ChainRpc>,
        locator: EventLocator,
    ) -> Result<Self, ConfigError> {
        if config.plan_id.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "PLAN_ID".to_string(),
                hint: "A plan id is required for every ledger operation.".to_string(),
            });
        }

        Ok(Self {
            backend,
            rpc,
            locator,
            poller: ConfirmationPoller::new(confirmation),
            plan_id: config.plan_id.trim().to_string(),
            agent_id: config.agent_id.clone(),
            wallet_override: config.wallet_address.clone(),
            stablecoin_address: config.stablecoin_address.clone(),
            stablecoin_decimals: config.stablecoin_decimals,
            plan: OnceCell::new(),
        })
    }

    pub fn plan_id(&self) -> &str {
        &self.plan_id
    }

    /// Credits currently available. Never cached.
    pub async fn get_balance(&self) -> Result<u64, Error> {
        let balance = self.backend.plan_balance(&self.plan_id).await?;
        tracing::debug!(plan_id = %self.plan_id, balance, "fetched credit balance");
        Ok(balance)
    }

    pub async fn get_plan_cost(&self) -> Result<PlanCost, Error> {
        let plan = self.plan().await?;
        Ok(plan.cost(&self.stablecoin_address, self.stablecoin_decimals))
    }

    /// Bearer token for the tool server, scoped to this plan and agent.
    pub async fn access_token(&self) -> Result<AccessToken, Error> {
        Ok(self
            .backend
            .agent_access_token(&self.plan_id, &self.agent_id)
            .await?)
    }

    /// Purchase the plan: pre-flight balance check, order, then a single
    /// look for the mint.
    pub async fn order_plan(&self) -> Result<OrderOutcome, Error> {
        let plan = self.plan().await?;
        let wallet = self.wallet_address().await?;
        let price = plan.price_total();

        let held = if is_zero_address(&plan.price_token_address) {
            self.rpc.native_balance(&wallet).await?
        } else {
            self.rpc
                .erc20_balance(&plan.price_token_address, &wallet)
                .await?
        };
        if held < price {
            tracing::info!(
                plan_id = %self.plan_id,
                %wallet,
                held = %held,
                price = %price,
                "insufficient settlement balance, not ordering"
            );
            return Ok(OrderOutcome {
                success: false,
                tx_hash: None,
                credits_granted: None,
                failure: Some(OrderFailure::InsufficientBalance),
                message: "insufficient balance".to_string(),
            });
        }

        let from_block = self.rpc.block_number().await?;

        let receipt = match self.backend.order_plan(&self.plan_id).await {
            Ok(receipt) if receipt.success => receipt,
            Ok(receipt) => {
                let message = receipt
                    .message
                    .unwrap_or_else(|| "plan order was not accepted".to_string());
                return Ok(purchase_failed(message));
            }
            Err(err @ LedgerError::AuthFailed { .. }) => return Err(err.into()),
            Err(err) => {
                tracing::warn!(plan_id = %self.plan_id, "plan order failed: {}", err);
                return Ok(purchase_failed(redact_sensitive_detail(&err.to_string())));
            }
        };

        let minted = match self
            .locator
            .find_event(
                EventKind::Mint,
                &plan.nft_contract_address,
                &wallet,
                plan.token_id,
                from_block,
            )
            .await
        {
            Ok(minted) => minted,
            Err(err) => {
                tracing::warn!(plan_id = %self.plan_id, "mint lookup failed after order: {}", err);
                None
            }
        };

        match minted {
            Some(event) => {
                tracing::info!(
                    plan_id = %self.plan_id,
                    tx = %event.tx_hash,
                    credits = %event.value,
                    "plan ordered and mint observed"
                );
                Ok(OrderOutcome {
                    success: true,
                    tx_hash: Some(event.tx_hash),
                    credits_granted: Some(event.value),
                    failure: None,
                    message: "plan ordered".to_string(),
                })
            }
            None => {
                tracing::info!(
                    plan_id = %self.plan_id,
                    order_tx = ?receipt.tx_hash,
                    "plan ordered, mint not observed yet"
                );
                Ok(OrderOutcome {
                    success: true,
                    tx_hash: None,
                    credits_granted: None,
                    failure: None,
                    message: "plan ordered; credit mint not confirmed yet".to_string(),
                })
            }
        }
    }

    /// Burn `amount` credits. Confirmation is a separate call.
    pub async fn redeem_credits(&self, amount: &str) -> Result<RedeemOutcome, Error> {
        let amount = amount.trim();
        match parse_u256(amount, "amount") {
            Ok(value) if value > U256::ZERO => {}
            _ => return Err(LedgerError::InvalidAmount(amount.to_string()).into()),
        }

        match self.backend.burn_credits(&self.plan_id, amount).await {
            Ok(receipt) if receipt.success => {
                tracing::info!(plan_id = %self.plan_id, amount, tx = ?receipt.tx_hash, "credits redeemed");
                Ok(RedeemOutcome {
                    success: true,
                    tx_hash: receipt.tx_hash,
                    message: format!("redeemed {amount} credits"),
                })
            }
            Ok(receipt) => Ok(RedeemOutcome {
                success: false,
                tx_hash: receipt.tx_hash,
                message: receipt
                    .message
                    .unwrap_or_else(|| "redemption was not accepted".to_string()),
            }),
            Err(err @ LedgerError::AuthFailed { .. }) => Err(err.into()),
            Err(err) => {
                tracing::warn!(plan_id = %self.plan_id, "redemption failed: {}", err);
                Ok(RedeemOutcome {
                    success: false,
                    tx_hash: None,
                    message: redact_sensitive_detail(&err.to_string()),
                })
            }
        }
    }

    /// Poll for the principal's burn from `from_block` on the configured
    /// schedule. Not found is a normal outcome.
    pub async fn find_burn_confirmation(&self, from_block: u64) -> Result<BurnConfirmation, Error> {
        self.find_burn_confirmation_until(from_block, std::future::pending())
            .await
    }

    /// Like [`Self::find_burn_confirmation`], abandoning the poll as soon as
    /// `cancel` resolves.
    pub async fn find_burn_confirmation_until<C>(
        &self,
        from_block: u64,
        cancel: C,
    ) -> Result<BurnConfirmation, Error>
    where
        C: Future<Output = ()>,
    {
        let plan = self.plan().await?;
        let wallet = self.wallet_address().await?;

        let locator = &self.locator;
        let contract = plan.nft_contract_address.as_str();
        let token_id = plan.token_id;
        let wallet_ref = wallet.as_str();

        let state = self
            .poller
            .run(
                |_attempt| {
                    locator.find_event(EventKind::Burn, contract, wallet_ref, token_id, from_block)
                },
                cancel,
            )
            .await?;

        let confirmation = match state {
            PollState::Found { event, attempts } => {
                tracing::info!(plan_id = %self.plan_id, tx = %event.tx_hash, attempts, "burn confirmed");
                BurnConfirmation::Confirmed {
                    tx_hash: event.tx_hash,
                    credits: event.value,
                    plan_id: self.plan_id.clone(),
                    attempts,
                }
            }
            PollState::Exhausted { attempts } => {
                tracing::info!(plan_id = %self.plan_id, attempts, "burn not observed within retry budget");
                BurnConfirmation::NotFound { attempts }
            }
            PollState::Cancelled { attempts } => {
                tracing::info!(plan_id = %self.plan_id, attempts, "burn confirmation cancelled");
                BurnConfirmation::Cancelled { attempts }
            }
            PollState::Polling { attempt } => BurnConfirmation::Cancelled {
                attempts: attempt.saturating_sub(1),
            },
        };
        Ok(confirmation)
    }

    async fn plan(&self) -> Result<&PlanRecord, Error> {
        let record = self
            .plan
            .get_or_try_init(|| async {
                let descriptor = self.backend.plan_descriptor(&self.plan_id).await?;
                let record = PlanRecord::from_descriptor(&self.plan_id, descriptor)?;
                tracing::debug!(plan_id = %self.plan_id, "cached plan record");
                Ok::<_, LedgerError>(record)
            })
            .await?;
        Ok(record)
    }

    async fn wallet_address(&self) -> Result<String, Error> {
        if let Some(wallet) = &self.wallet_override {
            return Ok(wallet.clone());
        }
        let wallet = self
            .backend
            .wallet_address()
            .await?
            .ok_or(LedgerError::WalletUnavailable)?;
        let wallet = normalize_address(&wallet).map_err(|_| LedgerError::WalletUnavailable)?;
        Ok(wallet)
    }
}

fn purchase_failed(message: String) -> OrderOutcome {
    OrderOutcome {
        success: false,
        tx_hash: None,
        credits_granted: None,
        failure: Some(OrderFailure::PurchaseFailed),
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::events::tests::{NFT, WALLET, transfer_log};
    use crate::chain::{LogFilter, RpcLog, parse_hex_u64};
    use crate::error::ChainError;
    use crate::ledger::{BurnReceipt, OrderReceipt, PlanDescriptor};
    use async_trait::async_trait;
    use secrecy::SecretString;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    const USDC: &str = "0x036cbd53842c5426634e7929541ec2318f3dcf7e";
    const PLAN_ID: &str = "7";

    #[derive(Default)]
    struct FakeBackend {
        descriptor_calls: AtomicU32,
        balance_calls: AtomicU32,
        order_calls: AtomicU32,
        burn_calls: AtomicU32,
        order_fails: bool,
    }

    #[async_trait]
    impl LedgerBackend for FakeBackend {
        async fn plan_balance(&self, _plan_id: &str) -> Result<u64, LedgerError> {
            Ok(u64::from(self.balance_calls.fetch_add(1, Ordering::SeqCst)))
        }
        async fn plan_descriptor(&self, _plan_id: &str) -> Result<PlanDescriptor, LedgerError> {
            self.descriptor_calls.fetch_add(1, Ordering::SeqCst);
            Ok(PlanDescriptor {
                price_amounts: vec![U256::from(5_000_000u64)],
                token_address: Some(USDC.to_string()),
                credits_amount: 100,
                nft_address: Some(NFT.to_string()),
            })
        }
        async fn order_plan(&self, _plan_id: &str) -> Result<OrderReceipt, LedgerError> {
            self.order_calls.fetch_add(1, Ordering::SeqCst);
            if self.order_fails {
                return Err(LedgerError::RequestFailed {
                    operation: "order".to_string(),
                    reason: "execution reverted".to_string(),
                });
            }
            Ok(OrderReceipt {
                success: true,
                tx_hash: Some("0xorder".to_string()),
                message: None,
            })
        }
        async fn burn_credits(&self, _plan_id: &str, _amount: &str) -> Result<BurnReceipt, LedgerError> {
            self.burn_calls.fetch_add(1, Ordering::SeqCst);
            Ok(BurnReceipt {
                success: true,
                tx_hash: Some("0xburnreq".to_string()),
                message: None,
            })
        }
        async fn agent_access_token(
            &self,
            _plan_id: &str,
            _agent_id: &str,
        ) -> Result<AccessToken, LedgerError> {
            Ok(AccessToken {
                token: SecretString::from("tok"),
                expires_at: None,
            })
        }
        async fn wallet_address(&self) -> Result<Option<String>, LedgerError> {
            Ok(Some(WALLET.to_string()))
        }
    }

    struct FakeRpc {
        head: u64,
        usdc_balance: U256,
        logs: Mutex<Vec<RpcLog>>,
        log_calls: AtomicU32,
    }

    #[async_trait]
    impl ChainRpc for FakeRpc {
        async fn block_number(&self) -> Result<u64, ChainError> {
            Ok(self.head)
        }
        async fn erc20_balance(&self, token: &str, _owner: &str) -> Result<U256, ChainError> {
            assert_eq!(token, USDC);
            Ok(self.usdc_balance)
        }
        async fn native_balance(&self, _owner: &str) -> Result<U256, ChainError> {
            Ok(U256::ZERO)
        }
        async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<RpcLog>, ChainError> {
            self.log_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .logs
                .lock()
                .unwrap()
                .iter()
                .filter(|log| {
                    let block = parse_hex_u64(log.block_number.as_deref().unwrap(), "b").unwrap();
                    block >= filter.from_block && block <= filter.to_block
                })
                .cloned()
                .collect())
        }
    }

    fn ledger_config() -> LedgerConfig {
        LedgerConfig {
            api_url: "https://ledger.example.org".to_string(),
            api_key: SecretString::from("key"),
            plan_id: PLAN_ID.to_string(),
            agent_id: "did:agent:1".to_string(),
            wallet_address: None,
            stablecoin_address: USDC.to_string(),
            stablecoin_decimals: 6,
        }
    }

    fn bridge(backend: Arc<FakeBackend>, rpc: Arc<FakeRpc>) -> CreditLedgerBridge {
        let locator = EventLocator::new(rpc.clone(), 1_000);
        CreditLedgerBridge::new(
            &ledger_config(),
            ConfirmationConfig {
                max_attempts: 10,
                delay: Duration::from_secs(5),
            },
            backend,
            rpc,
            locator,
        )
        .unwrap()
    }

    fn rpc(usdc_balance: u64, logs: Vec<RpcLog>) -> Arc<FakeRpc> {
        Arc::new(FakeRpc {
            head: 100,
            usdc_balance: U256::from(usdc_balance),
            logs: Mutex::new(logs),
            log_calls: AtomicU32::new(0),
        })
    }

    #[tokio::test]
    async fn insufficient_balance_never_calls_purchase() {
        let backend = Arc::new(FakeBackend::default());
        let bridge = bridge(backend.clone(), rpc(4_999_999, Vec::new()));

        let outcome = bridge.order_plan().await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.failure, Some(OrderFailure::InsufficientBalance));
        assert_eq!(outcome.message, "insufficient balance");
        assert_eq!(backend.order_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn order_reports_observed_mint() {
        let backend = Arc::new(FakeBackend::default());
        let rpc = rpc(5_000_000, vec![transfer_log(100, 0, "0xmint", 7, 100)]);
        let bridge = bridge(backend.clone(), rpc);

        let outcome = bridge.order_plan().await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.tx_hash.as_deref(), Some("0xmint"));
        assert_eq!(outcome.credits_granted, Some(U256::from(100u64)));
        assert_eq!(backend.order_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn order_succeeds_without_mint_details_when_mint_lags() {
        let backend = Arc::new(FakeBackend::default());
        let bridge = bridge(backend, rpc(6_000_000, Vec::new()));

        let outcome = bridge.order_plan().await.unwrap();
        assert!(outcome.success);
        assert!(outcome.tx_hash.is_none());
        assert!(outcome.credits_granted.is_none());
    }

    #[tokio::test]
    async fn failed_purchase_is_a_negative_result() {
        let backend = Arc::new(FakeBackend {
            order_fails: true,
            ..FakeBackend::default()
        });
        let bridge = bridge(backend, rpc(6_000_000, Vec::new()));

        let outcome = bridge.order_plan().await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.failure, Some(OrderFailure::PurchaseFailed));
        assert!(outcome.message.contains("execution reverted"));
    }

    #[tokio::test]
    async fn plan_descriptor_is_fetched_once_balance_every_time() {
        let backend = Arc::new(FakeBackend::default());
        let bridge = bridge(backend.clone(), rpc(0, Vec::new()));

        assert_eq!(bridge.get_plan_cost().await.unwrap().price_normalized, "5");
        bridge.get_plan_cost().await.unwrap();
        bridge.order_plan().await.unwrap();
        assert_eq!(backend.descriptor_calls.load(Ordering::SeqCst), 1);

        assert_eq!(bridge.get_balance().await.unwrap(), 0);
        assert_eq!(bridge.get_balance().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn redeem_rejects_non_positive_amounts() {
        let backend = Arc::new(FakeBackend::default());
        let bridge = bridge(backend.clone(), rpc(0, Vec::new()));

        for bad in ["0", "-3", "ten", ""] {
            let err = bridge.redeem_credits(bad).await.unwrap_err();
            assert!(matches!(err, Error::Ledger(LedgerError::InvalidAmount(_))));
        }
        let ok = bridge.redeem_credits("3").await.unwrap();
        assert!(ok.success);
        assert_eq!(ok.tx_hash.as_deref(), Some("0xburnreq"));
        assert_eq!(backend.burn_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn burn_confirmation_exhausts_after_ten_probes() {
        let backend = Arc::new(FakeBackend::default());
        let rpc = rpc(0, Vec::new());
        let bridge = bridge(backend, rpc.clone());

        let confirmation = bridge.find_burn_confirmation(90).await.unwrap();
        assert_eq!(confirmation, BurnConfirmation::NotFound { attempts: 10 });
        assert_eq!(rpc.log_calls.load(Ordering::SeqCst), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn burn_confirmation_returns_match() {
        let backend = Arc::new(FakeBackend::default());
        let rpc = rpc(0, vec![transfer_log(95, 2, "0xburn", 7, 3)]);
        let bridge = bridge(backend, rpc);

        let confirmation = bridge.find_burn_confirmation(90).await.unwrap();
        assert_eq!(
            confirmation,
            BurnConfirmation::Confirmed {
                tx_hash: "0xburn".to_string(),
                credits: U256::from(3u64),
                plan_id: PLAN_ID.to_string(),
                attempts: 1,
            }
        );
    }
}
