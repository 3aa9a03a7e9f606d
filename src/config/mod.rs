//! Configuration for creditgate.
//!
//! Settings are loaded with priority: env var > config.toml > default.
//! A local `.env` is loaded via dotenvy early in startup, so anything in it
//! behaves like a real env var.

pub(crate) mod helpers;

use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::settings::Settings;

use self::helpers::{
    optional_env, parse_optional_env, require, validate_address, validate_http_url,
};

/// Base Sepolia USDC, the settlement token priced in human units.
pub const DEFAULT_STABLECOIN_ADDRESS: &str = "0x036cbd53842c5426634e7929541ec2318f3dcf7e";
pub const DEFAULT_STABLECOIN_DECIMALS: u32 = 6;
pub const DEFAULT_CONFIRMATION_ATTEMPTS: u32 = 10;
pub const DEFAULT_CONFIRMATION_DELAY_MS: u64 = 5_000;
const DEFAULT_LLM_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_LLM_MODEL: &str = "gpt-4o-mini";
const DEFAULT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_MAX_BLOCK_RANGE: u64 = 10_000;
const DEFAULT_SELECTION_ATTEMPTS: u32 = 2;
const DEFAULT_AGENT_CONTEXT: &str = "a remote agent that performs paid tasks through its published tools";

/// Fully resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub llm: LlmConfig,
    pub ledger: LedgerConfig,
    pub chain: ChainConfig,
    pub tool_server: ToolServerConfig,
    pub confirmation: ConfirmationConfig,
    pub agent: AgentConfig,
}

/// Completion provider (OpenAI-compatible) settings.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: Option<SecretString>,
    pub model: String,
    pub timeout: Duration,
}

impl LlmConfig {
    pub fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let base_url = optional_env("LLM_BASE_URL")?
            .or_else(|| settings.llm.base_url.clone())
            .unwrap_or_else(|| DEFAULT_LLM_BASE_URL.to_string());
        let base_url = validate_http_url("LLM_BASE_URL", &base_url)?;

        let model = optional_env("LLM_MODEL")?
            .or_else(|| settings.llm.model.clone())
            .unwrap_or_else(|| DEFAULT_LLM_MODEL.to_string());

        let timeout_ms = parse_optional_env::<u64>("LLM_TIMEOUT_MS", "a positive integer")?
            .or(settings.llm.timeout_ms)
            .unwrap_or(DEFAULT_TIMEOUT_MS);
        if timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "LLM_TIMEOUT_MS".to_string(),
                message: "must be > 0".to_string(),
            });
        }

        Ok(Self {
            base_url,
            api_key: optional_env("LLM_API_KEY")?.map(SecretString::from),
            model,
            timeout: Duration::from_millis(timeout_ms),
        })
    }
}

/// Credit ledger service and plan identity.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub api_url: String,
    pub api_key: SecretString,
    pub plan_id: String,
    pub agent_id: String,
    /// Overrides the wallet the ledger service reports for the principal.
    pub wallet_address: Option<String>,
    pub stablecoin_address: String,
    pub stablecoin_decimals: u32,
}

impl LedgerConfig {
    pub fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let api_url = require(
            "LEDGER_API_URL",
            optional_env("LEDGER_API_URL")?.or_else(|| settings.ledger.api_url.clone()),
            "Set LEDGER_API_URL to the credit ledger service base URL.",
        )?;
        let api_url = validate_http_url("LEDGER_API_URL", &api_url)?;

        let api_key = require(
            "LEDGER_API_KEY",
            optional_env("LEDGER_API_KEY")?,
            "Set LEDGER_API_KEY to the principal's ledger API key.",
        )?;

        let plan_id = require(
            "PLAN_ID",
            optional_env("PLAN_ID")?.or_else(|| settings.ledger.plan_id.clone()),
            "Set PLAN_ID to the credit plan the agent is sold under.",
        )?;
        let agent_id = require(
            "AGENT_ID",
            optional_env("AGENT_ID")?.or_else(|| settings.ledger.agent_id.clone()),
            "Set AGENT_ID to the agent whose tools are unlocked by the plan.",
        )?;

        let wallet_address = optional_env("WALLET_ADDRESS")?
            .or_else(|| settings.ledger.wallet_address.clone())
            .map(|raw| validate_address("WALLET_ADDRESS", &raw))
            .transpose()?;

        let stablecoin_address = optional_env("STABLECOIN_ADDRESS")?
            .or_else(|| settings.ledger.stablecoin_address.clone())
            .unwrap_or_else(|| DEFAULT_STABLECOIN_ADDRESS.to_string());
        let stablecoin_address = validate_address("STABLECOIN_ADDRESS", &stablecoin_address)?;

        let stablecoin_decimals =
            parse_optional_env::<u32>("STABLECOIN_DECIMALS", "a non-negative integer")?
                .or(settings.ledger.stablecoin_decimals)
                .unwrap_or(DEFAULT_STABLECOIN_DECIMALS);
        if stablecoin_decimals > 36 {
            return Err(ConfigError::InvalidValue {
                key: "STABLECOIN_DECIMALS".to_string(),
                message: "must be <= 36".to_string(),
            });
        }

        Ok(Self {
            api_url,
            api_key: SecretString::from(api_key),
            plan_id,
            agent_id,
            wallet_address,
            stablecoin_address,
            stablecoin_decimals,
        })
    }
}

/// Chain JSON-RPC endpoint.
#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub rpc_url: String,
    pub max_block_range: u64,
    pub timeout: Duration,
}

impl ChainConfig {
    pub fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let rpc_url = require(
            "CHAIN_RPC_URL",
            optional_env("CHAIN_RPC_URL")?.or_else(|| settings.chain.rpc_url.clone()),
            "Set CHAIN_RPC_URL to an Ethereum JSON-RPC endpoint for the settlement chain.",
        )?;
        let rpc_url = validate_http_url("CHAIN_RPC_URL", &rpc_url)?;

        let max_block_range =
            parse_optional_env::<u64>("CHAIN_MAX_BLOCK_RANGE", "a positive integer")?
                .or(settings.chain.max_block_range)
                .unwrap_or(DEFAULT_MAX_BLOCK_RANGE);
        if max_block_range == 0 {
            return Err(ConfigError::InvalidValue {
                key: "CHAIN_MAX_BLOCK_RANGE".to_string(),
                message: "must be > 0".to_string(),
            });
        }

        let timeout_ms = parse_optional_env::<u64>("CHAIN_TIMEOUT_MS", "a positive integer")?
            .or(settings.chain.timeout_ms)
            .unwrap_or(DEFAULT_TIMEOUT_MS);
        if timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "CHAIN_TIMEOUT_MS".to_string(),
                message: "must be > 0".to_string(),
            });
        }

        Ok(Self {
            rpc_url,
            max_block_range,
            timeout: Duration::from_millis(timeout_ms),
        })
    }
}

/// Remote MCP tool server.
#[derive(Debug, Clone)]
pub struct ToolServerConfig {
    pub url: String,
    pub timeout: Duration,
}

impl ToolServerConfig {
    pub fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let url = require(
            "TOOL_SERVER_URL",
            optional_env("TOOL_SERVER_URL")?.or_else(|| settings.tool_server.url.clone()),
            "Set TOOL_SERVER_URL to the agent's MCP endpoint (e.g. https://agent.example/mcp).",
        )?;
        let url = validate_http_url("TOOL_SERVER_URL", &url)?;

        let timeout_ms = parse_optional_env::<u64>("TOOL_SERVER_TIMEOUT_MS", "a positive integer")?
            .or(settings.tool_server.timeout_ms)
            .unwrap_or(DEFAULT_TIMEOUT_MS);
        if timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "TOOL_SERVER_TIMEOUT_MS".to_string(),
                message: "must be > 0".to_string(),
            });
        }

        Ok(Self {
            url,
            timeout: Duration::from_millis(timeout_ms),
        })
    }
}

/// Burn confirmation polling schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmationConfig {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_CONFIRMATION_ATTEMPTS,
            delay: Duration::from_millis(DEFAULT_CONFIRMATION_DELAY_MS),
        }
    }
}

impl ConfirmationConfig {
    pub fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let max_attempts =
            parse_optional_env::<u32>("CONFIRMATION_MAX_ATTEMPTS", "a positive integer")?
                .or(settings.confirmation.max_attempts)
                .unwrap_or(DEFAULT_CONFIRMATION_ATTEMPTS);
        if max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "CONFIRMATION_MAX_ATTEMPTS".to_string(),
                message: "must be > 0".to_string(),
            });
        }

        let delay_ms =
            parse_optional_env::<u64>("CONFIRMATION_DELAY_MS", "a non-negative integer")?
                .or(settings.confirmation.delay_ms)
                .unwrap_or(DEFAULT_CONFIRMATION_DELAY_MS);

        Ok(Self {
            max_attempts,
            delay: Duration::from_millis(delay_ms),
        })
    }
}

/// Downstream agent description and intent synthesis knobs.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub context: String,
    pub selection_attempts: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            context: DEFAULT_AGENT_CONTEXT.to_string(),
            selection_attempts: DEFAULT_SELECTION_ATTEMPTS,
        }
    }
}

impl AgentConfig {
    pub fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let context = optional_env("AGENT_CONTEXT")?
            .or_else(|| settings.agent.context.clone())
            .unwrap_or_else(|| DEFAULT_AGENT_CONTEXT.to_string());

        let selection_attempts =
            parse_optional_env::<u32>("INTENT_SELECTION_ATTEMPTS", "a positive integer")?
                .or(settings.agent.selection_attempts)
                .unwrap_or(DEFAULT_SELECTION_ATTEMPTS);
        if selection_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "INTENT_SELECTION_ATTEMPTS".to_string(),
                message: "must be > 0".to_string(),
            });
        }

        Ok(Self {
            context,
            selection_attempts,
        })
    }
}

impl Config {
    /// Load from env with an optional TOML config file overlay.
    pub fn from_env_with_toml(toml_path: Option<&Path>) -> Result<Self, ConfigError> {
        let settings = Self::load_settings(toml_path)?;
        Self::from_settings(&settings)
    }

    /// Load `.env` and the TOML overlay without resolving any section.
    ///
    /// If `explicit_path` is `Some`, a missing or unreadable file is fatal.
    /// Otherwise the default `~/.creditgate/config.toml` is tried and a
    /// missing file is silently ignored.
    pub fn load_settings(explicit_path: Option<&Path>) -> Result<Settings, ConfigError> {
        let _ = dotenvy::dotenv();

        let path = explicit_path
            .map(PathBuf::from)
            .unwrap_or_else(Settings::default_toml_path);

        match Settings::load_toml(&path) {
            Ok(Some(settings)) => {
                tracing::debug!("Loaded TOML config from {}", path.display());
                Ok(settings)
            }
            Ok(None) => {
                if explicit_path.is_some() {
                    return Err(ConfigError::ParseError(format!(
                        "Config file not found: {}",
                        path.display()
                    )));
                }
                Ok(Settings::default())
            }
            Err(e) => {
                if explicit_path.is_some() {
                    return Err(ConfigError::ParseError(format!(
                        "Failed to load config file {}: {}",
                        path.display(),
                        e
                    )));
                }
                tracing::warn!("Failed to load default config file: {}", e);
                Ok(Settings::default())
            }
        }
    }

    /// Resolve every section from already-loaded settings plus the environment.
    pub fn from_settings(settings: &Settings) -> Result<Self, ConfigError> {
        Ok(Self {
            llm: LlmConfig::resolve(settings)?,
            ledger: LedgerConfig::resolve(settings)?,
            chain: ChainConfig::resolve(settings)?,
            tool_server: ToolServerConfig::resolve(settings)?,
            confirmation: ConfirmationConfig::resolve(settings)?,
            agent: AgentConfig::resolve(settings)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    fn clear_env() {
        // SAFETY: Guarded by ENV_MUTEX in tests.
        unsafe {
            for key in [
                "LEDGER_API_URL",
                "LEDGER_API_KEY",
                "PLAN_ID",
                "AGENT_ID",
                "WALLET_ADDRESS",
                "STABLECOIN_ADDRESS",
                "STABLECOIN_DECIMALS",
                "CONFIRMATION_MAX_ATTEMPTS",
                "CONFIRMATION_DELAY_MS",
                "TOOL_SERVER_URL",
                "TOOL_SERVER_TIMEOUT_MS",
                "CHAIN_RPC_URL",
                "CHAIN_MAX_BLOCK_RANGE",
                "CHAIN_TIMEOUT_MS",
            ] {
                std::env::remove_var(key);
            }
        }
    }

    #[test]
    fn confirmation_defaults_to_ten_attempts_five_seconds_apart() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        clear_env();

        let config = ConfirmationConfig::resolve(&Settings::default()).unwrap();
        assert_eq!(config, ConfirmationConfig::default());
        assert_eq!(config.max_attempts, 10);
        assert_eq!(config.delay, Duration::from_secs(5));
    }

    #[test]
    fn env_overrides_toml_settings() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        clear_env();

        let mut settings = Settings::default();
        settings.confirmation.max_attempts = Some(3);
        settings.confirmation.delay_ms = Some(100);

        // SAFETY: Guarded by ENV_MUTEX in tests.
        unsafe {
            std::env::set_var("CONFIRMATION_MAX_ATTEMPTS", "7");
        }
        let config = ConfirmationConfig::resolve(&settings).unwrap();
        assert_eq!(config.max_attempts, 7);
        assert_eq!(config.delay, Duration::from_millis(100));
        clear_env();
    }

    #[test]
    fn chain_timeout_resolves_like_the_other_sections() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        clear_env();

        let mut settings = Settings::default();
        settings.chain.rpc_url = Some("https://rpc.example.org".to_string());
        let config = ChainConfig::resolve(&settings).unwrap();
        assert_eq!(config.timeout, Duration::from_millis(DEFAULT_TIMEOUT_MS));

        settings.chain.timeout_ms = Some(2_500);
        let config = ChainConfig::resolve(&settings).unwrap();
        assert_eq!(config.timeout, Duration::from_millis(2_500));

        // SAFETY: Guarded by ENV_MUTEX in tests.
        unsafe {
            std::env::set_var("CHAIN_TIMEOUT_MS", "0");
        }
        let err = ChainConfig::resolve(&settings).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "CHAIN_TIMEOUT_MS"));
        clear_env();
    }

    #[test]
    fn missing_plan_id_is_a_configuration_error() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        clear_env();

        // SAFETY: Guarded by ENV_MUTEX in tests.
        unsafe {
            std::env::set_var("LEDGER_API_URL", "https://ledger.example.org");
            std::env::set_var("LEDGER_API_KEY", "key-123");
            std::env::set_var("AGENT_ID", "did:agent:1");
        }
        let err = LedgerConfig::resolve(&Settings::default()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired { ref key, .. } if key == "PLAN_ID"));
        clear_env();
    }

    #[test]
    fn ledger_defaults_to_stablecoin_settlement() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        clear_env();

        let mut settings = Settings::default();
        settings.ledger.api_url = Some("https://ledger.example.org/".to_string());
        settings.ledger.plan_id = Some("777".to_string());
        settings.ledger.agent_id = Some("did:agent:1".to_string());
        // SAFETY: Guarded by ENV_MUTEX in tests.
        unsafe {
            std::env::set_var("LEDGER_API_KEY", "key-123");
        }

        let ledger = LedgerConfig::resolve(&settings).unwrap();
        assert_eq!(ledger.api_url, "https://ledger.example.org");
        assert_eq!(ledger.stablecoin_address, DEFAULT_STABLECOIN_ADDRESS);
        assert_eq!(ledger.stablecoin_decimals, 6);
        assert!(ledger.wallet_address.is_none());
        clear_env();
    }

    #[test]
    fn rejects_invalid_wallet_override() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        clear_env();

        let mut settings = Settings::default();
        settings.ledger.api_url = Some("https://ledger.example.org".to_string());
        settings.ledger.plan_id = Some("777".to_string());
        settings.ledger.agent_id = Some("did:agent:1".to_string());
        // SAFETY: Guarded by ENV_MUTEX in tests.
        unsafe {
            std::env::set_var("LEDGER_API_KEY", "key-123");
            std::env::set_var("WALLET_ADDRESS", "0x1234");
        }

        let err = LedgerConfig::resolve(&settings).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "WALLET_ADDRESS"));
        clear_env();
    }

    #[test]
    fn explicit_missing_config_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load_settings(Some(&dir.path().join("nope.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }
}
