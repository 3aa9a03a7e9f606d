//! `creditgate doctor` - active health diagnostics.
//!
//! Resolves each configuration section on its own and probes the external
//! services behind it, so one missing setting does not hide the state of
//! everything else. A check whose prerequisites are unavailable is skipped
//! rather than failed.

use std::path::Path;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;

use crate::chain::{ChainRpc, HttpChainRpc};
use crate::config::{ChainConfig, Config, LedgerConfig, LlmConfig, ToolServerConfig};
use crate::ledger::{HttpLedgerBackend, LedgerBackend};
use crate::settings::Settings;
use crate::tools::mcp::probe_tool_server;

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
enum CheckResult {
    Pass(String),
    Fail(String),
    Skip(String),
}

#[derive(Debug, Serialize)]
struct CheckReport {
    name: &'static str,
    #[serde(flatten)]
    result: CheckResult,
}

#[derive(Debug, Default, Serialize)]
struct DoctorReport {
    passed: u32,
    failed: u32,
    checks: Vec<CheckReport>,
}

impl DoctorReport {
    fn check(&mut self, name: &'static str, result: CheckResult) {
        match &result {
            CheckResult::Pass(detail) => {
                self.passed += 1;
                tracing::debug!(check = name, "pass: {}", detail);
            }
            CheckResult::Fail(detail) => {
                self.failed += 1;
                tracing::warn!(check = name, "fail: {}", detail);
            }
            CheckResult::Skip(reason) => {
                tracing::debug!(check = name, "skip: {}", reason);
            }
        }
        self.checks.push(CheckReport { name, result });
    }
}

/// Run every check and print the report.
pub async fn run_doctor_command(config_path: Option<&Path>, strict: bool) -> anyhow::Result<()> {
    let mut report = DoctorReport::default();

    let settings = match Config::load_settings(config_path) {
        Ok(settings) => settings,
        Err(e) => {
            report.check("Configuration file", CheckResult::Fail(e.to_string()));
            Settings::default()
        }
    };

    report.check("Configuration", check_config(&settings));

    let llm = LlmConfig::resolve(&settings).map_err(|e| e.to_string());
    report.check("LLM endpoint", check_llm(&llm).await);

    let chain = ChainConfig::resolve(&settings).map_err(|e| e.to_string());
    report.check("Chain RPC head", check_chain(&chain).await);

    let ledger = LedgerConfig::resolve(&settings).map_err(|e| e.to_string());
    report.check("Ledger wallet", check_ledger_wallet(&ledger).await);

    let token = access_token(&ledger).await;
    let tool_server = ToolServerConfig::resolve(&settings).map_err(|e| e.to_string());
    report.check(
        "Tool server reachability",
        check_tool_server(&tool_server, token.as_ref()).await,
    );

    println!("{}", serde_json::to_string_pretty(&report)?);

    if report.failed > 0 && strict {
        anyhow::bail!("doctor strict mode failed with {} check(s)", report.failed);
    }
    Ok(())
}

fn check_config(settings: &Settings) -> CheckResult {
    match Config::from_settings(settings) {
        Ok(config) => CheckResult::Pass(format!(
            "plan {} via {}",
            config.ledger.plan_id, config.tool_server.url
        )),
        Err(e) => CheckResult::Fail(e.to_string()),
    }
}

async fn check_llm(config: &Result<LlmConfig, String>) -> CheckResult {
    let config = match config {
        Ok(config) => config,
        Err(e) => return CheckResult::Skip(e.clone()),
    };

    let client = match reqwest::Client::builder().timeout(PROBE_TIMEOUT).build() {
        Ok(client) => client,
        Err(e) => return CheckResult::Fail(format!("HTTP client init failed: {e}")),
    };
    let mut request = client.get(format!("{}/models", config.base_url.trim_end_matches('/')));
    if let Some(key) = &config.api_key {
        request = request.bearer_auth(key.expose_secret());
    }

    match request.send().await {
        Ok(response) if response.status().is_success() => {
            CheckResult::Pass(format!("{} reachable, model {}", config.base_url, config.model))
        }
        Ok(response)
            if response.status() == reqwest::StatusCode::UNAUTHORIZED
                || response.status() == reqwest::StatusCode::FORBIDDEN =>
        {
            CheckResult::Fail(format!(
                "authentication rejected (HTTP {}); check LLM_API_KEY",
                response.status().as_u16()
            ))
        }
        Ok(response) => CheckResult::Fail(format!("HTTP {}", response.status().as_u16())),
        Err(e) => CheckResult::Fail(format!("unreachable: {e}")),
    }
}

async fn check_chain(config: &Result<ChainConfig, String>) -> CheckResult {
    let config = match config {
        Ok(config) => config,
        Err(e) => return CheckResult::Skip(e.clone()),
    };
    let rpc = HttpChainRpc::new(config.rpc_url.clone(), PROBE_TIMEOUT);
    match rpc.block_number().await {
        Ok(head) => CheckResult::Pass(format!("head block {head}")),
        Err(e) => CheckResult::Fail(e.to_string()),
    }
}

async fn check_ledger_wallet(config: &Result<LedgerConfig, String>) -> CheckResult {
    let config = match config {
        Ok(config) => config,
        Err(e) => return CheckResult::Skip(e.clone()),
    };
    if let Some(wallet) = &config.wallet_address {
        return CheckResult::Pass(format!("{wallet} (WALLET_ADDRESS override)"));
    }

    let backend = match HttpLedgerBackend::new(config) {
        Ok(backend) => backend,
        Err(e) => return CheckResult::Fail(e.to_string()),
    };
    match backend.wallet_address().await {
        Ok(Some(wallet)) => CheckResult::Pass(wallet),
        Ok(None) => CheckResult::Fail(
            "ledger account has no wallet; set WALLET_ADDRESS to override".to_string(),
        ),
        Err(e) => CheckResult::Fail(e.to_string()),
    }
}

async fn access_token(config: &Result<LedgerConfig, String>) -> Option<SecretString> {
    let config = config.as_ref().ok()?;
    let backend = HttpLedgerBackend::new(config).ok()?;
    match backend
        .agent_access_token(&config.plan_id, &config.agent_id)
        .await
    {
        Ok(token) => Some(token.token),
        Err(e) => {
            tracing::debug!("no access token for tool server probe: {}", e);
            None
        }
    }
}

async fn check_tool_server(
    config: &Result<ToolServerConfig, String>,
    token: Option<&SecretString>,
) -> CheckResult {
    let config = match config {
        Ok(config) => config,
        Err(e) => return CheckResult::Skip(e.clone()),
    };
    let health = probe_tool_server(config, token).await;
    if health.is_healthy() {
        CheckResult::Pass(format!("{} ({})", health.url, health.detail))
    } else {
        let hint = if token.is_none() {
            " without an access token"
        } else {
            ""
        };
        CheckResult::Fail(format!(
            "{}{}: {}",
            health.state.as_str(),
            hint,
            health.detail
        ))
    }
}
