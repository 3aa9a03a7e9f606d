//! REST client for the credit ledger service.

use std::time::Duration;

use alloy_primitives::U256;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use url::Url;

use super::{AccessToken, BurnReceipt, LedgerBackend, OrderReceipt, PlanDescriptor};
use crate::chain::parse_u256;
use crate::config::LedgerConfig;
use crate::error::{ConfigError, LedgerError, redact_sensitive_detail};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// [`LedgerBackend`] over the ledger service's JSON API, authenticated with
/// the principal's API key.
pub struct HttpLedgerBackend {
    client: Client,
    base_url: Url,
    api_key: SecretString,
}

impl HttpLedgerBackend {
    pub fn new(config: &LedgerConfig) -> Result<Self, ConfigError> {
        let base_url = Url::parse(&config.api_url).map_err(|e| ConfigError::InvalidValue {
            key: "LEDGER_API_URL".to_string(),
            message: e.to_string(),
        })?;
        if base_url.cannot_be_a_base() {
            return Err(ConfigError::InvalidValue {
                key: "LEDGER_API_URL".to_string(),
                message: "must be an absolute http(s) URL".to_string(),
            });
        }
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ConfigError::InvalidValue {
                key: "LEDGER_API_URL".to_string(),
                message: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            base_url,
            api_key: config.api_key.clone(),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn request<T: DeserializeOwned>(
        &self,
        operation: &str,
        method: Method,
        segments: &[&str],
        body: Option<Value>,
    ) -> Result<T, LedgerError> {
        let url = self.endpoint(segments);
        tracing::debug!(operation, %url, "ledger request");

        let mut request = self
            .client
            .request(method, url)
            .header(
                "Authorization",
                format!("Bearer {}", self.api_key.expose_secret()),
            )
            .header("Accept", "application/json");
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(|e| LedgerError::RequestFailed {
            operation: operation.to_string(),
            reason: redact_sensitive_detail(&e.to_string()),
        })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(LedgerError::AuthFailed {
                reason: format!("{operation} returned HTTP {}", status.as_u16()),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LedgerError::RequestFailed {
                operation: operation.to_string(),
                reason: redact_sensitive_detail(&format!("HTTP {}: {}", status.as_u16(), body)),
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|e| LedgerError::InvalidResponse {
                operation: operation.to_string(),
                reason: e.to_string(),
            })
    }
}

/// Integers arrive as JSON numbers or as decimal strings, depending on size.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Amount {
    Number(u64),
    Text(String),
}

impl Amount {
    fn to_u256(&self, operation: &str) -> Result<U256, LedgerError> {
        match self {
            Self::Number(n) => Ok(U256::from(*n)),
            Self::Text(raw) => parse_u256(raw, operation).map_err(|e| LedgerError::InvalidResponse {
                operation: operation.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    fn to_u64(&self, operation: &str) -> Result<u64, LedgerError> {
        let value = self.to_u256(operation)?;
        u64::try_from(value).map_err(|_| LedgerError::InvalidResponse {
            operation: operation.to_string(),
            reason: format!("{value} does not fit in 64 bits"),
        })
    }
}

#[derive(Debug, Deserialize)]
struct BalanceBody {
    balance: Amount,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlanBody {
    #[serde(default)]
    price_amounts: Vec<Amount>,
    token_address: Option<String>,
    credits_amount: Option<Amount>,
    nft_address: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceiptBody {
    success: bool,
    tx_hash: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccessTokenBody {
    access_token: String,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountBody {
    wallet_address: Option<String>,
}

impl PlanBody {
    fn into_descriptor(self) -> Result<PlanDescriptor, LedgerError> {
        let price_amounts = self
            .price_amounts
            .iter()
            .map(|amount| amount.to_u256("plan price"))
            .collect::<Result<Vec<_>, _>>()?;
        let credits_amount = match &self.credits_amount {
            Some(amount) => amount.to_u64("plan credits")?,
            None => 0,
        };
        Ok(PlanDescriptor {
            price_amounts,
            token_address: self.token_address.filter(|s| !s.trim().is_empty()),
            credits_amount,
            nft_address: self.nft_address.filter(|s| !s.trim().is_empty()),
        })
    }
}

#[async_trait]
impl LedgerBackend for HttpLedgerBackend {
    async fn plan_balance(&self, plan_id: &str) -> Result<u64, LedgerError> {
        let body: BalanceBody = self
            .request("plan balance", Method::GET, &["plans", plan_id, "balance"], None)
            .await?;
        body.balance.to_u64("plan balance")
    }

    async fn plan_descriptor(&self, plan_id: &str) -> Result<PlanDescriptor, LedgerError> {
        let body: PlanBody = self
            .request("plan descriptor", Method::GET, &["plans", plan_id], None)
            .await?;
        body.into_descriptor()
    }

    async fn order_plan(&self, plan_id: &str) -> Result<OrderReceipt, LedgerError> {
        let body: ReceiptBody = self
            .request("order plan", Method::POST, &["plans", plan_id, "order"], Some(json!({})))
            .await?;
        Ok(OrderReceipt {
            success: body.success,
            tx_hash: body.tx_hash,
            message: body.message,
        })
    }

    async fn burn_credits(&self, plan_id: &str, amount: &str) -> Result<BurnReceipt, LedgerError> {
        let body: ReceiptBody = self
            .request(
                "burn credits",
                Method::POST,
                &["plans", plan_id, "burn"],
                Some(json!({ "amount": amount })),
            )
            .await?;
        Ok(BurnReceipt {
            success: body.success,
            tx_hash: body.tx_hash,
            message: body.message,
        })
    }

    async fn agent_access_token(
        &self,
        plan_id: &str,
        agent_id: &str,
    ) -> Result<AccessToken, LedgerError> {
        let body: AccessTokenBody = self
            .request(
                "agent access token",
                Method::GET,
                &["plans", plan_id, "agents", agent_id, "access-token"],
                None,
            )
            .await?;
        if body.access_token.trim().is_empty() {
            return Err(LedgerError::InvalidResponse {
                operation: "agent access token".to_string(),
                reason: "empty token".to_string(),
            });
        }
        Ok(AccessToken {
            token: SecretString::from(body.access_token),
            expires_at: body.expires_at,
        })
    }

    async fn wallet_address(&self) -> Result<Option<String>, LedgerError> {
        let body: AccountBody = self
            .request("account", Method::GET, &["account"], None)
            .await?;
        Ok(body.wallet_address.filter(|s| !s.trim().is_empty()))
    }
}
