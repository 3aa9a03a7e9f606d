//! `creditgate` command-line surface.
//!
//! Every command prints one JSON document on stdout; logs go to stderr.

pub mod doctor;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{Map, Value, json};

use crate::agent::{ConversationMessage, Orchestrator};
use crate::chain::{ChainRpc, EventLocator, HttpChainRpc};
use crate::config::Config;
use crate::error::{Error, ErrorPayload};
use crate::ledger::{CreditLedgerBridge, HttpLedgerBackend};
use crate::llm::OpenAiCompatibleProvider;
use crate::tools::mcp::McpToolGateway;
use crate::tools::ToolGateway;

#[derive(Parser, Debug)]
#[command(name = "creditgate", version, about = "Credit-gated task orchestrator")]
pub struct Cli {
    /// Path to a TOML config file (default: ~/.creditgate/config.toml)
    #[arg(long, global = true, env = "CREDITGATE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Route one message: forward to the agent, offer a plan, or reply
    Chat {
        message: String,

        /// JSON file holding the prior conversation as [{role, content}, ...]
        #[arg(long)]
        history: Option<PathBuf>,
    },

    /// Show the current credit balance
    Balance,

    /// Show the plan price and credit grant
    Cost,

    /// Purchase the plan
    Order,

    /// Burn credits
    Redeem { amount: String },

    /// Wait for the burn of a redemption to land on chain (Ctrl-C cancels)
    ConfirmBurn {
        #[arg(long)]
        from_block: u64,
    },

    /// List the tools the agent exposes
    Tools,

    /// Call one tool directly
    Call {
        tool: String,

        /// Tool arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,
    },

    /// Probe configuration and external dependencies
    Doctor {
        /// Exit non-zero if any check fails
        #[arg(long)]
        strict: bool,
    },
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    if let Command::Doctor { strict } = cli.command {
        return doctor::run_doctor_command(cli.config.as_deref(), strict).await;
    }

    match execute(&cli.command, cli.config.as_deref()).await {
        Ok(value) => print_json(&value),
        Err(err) => {
            print_json(&json!({ "error": ErrorPayload::from(&err) }))?;
            Err(err.into())
        }
    }
}

async fn execute(command: &Command, config_path: Option<&Path>) -> Result<Value, Error> {
    let config = Config::from_env_with_toml(config_path)?;
    let ledger = build_ledger(&config)?;

    match command {
        Command::Chat { message, history } => {
            let history = match history {
                Some(path) => load_history(path)?,
                None => Vec::new(),
            };
            let provider = Arc::new(OpenAiCompatibleProvider::new(&config.llm)?);
            let gateway = Arc::new(McpToolGateway::new(&config.tool_server, ledger.clone())?);
            let orchestrator = Orchestrator::new(provider, ledger, gateway, &config.agent);
            to_json(&orchestrator.handle(message, &history).await?)
        }
        Command::Balance => Ok(json!({
            "plan_id": ledger.plan_id(),
            "credits": ledger.get_balance().await?,
        })),
        Command::Cost => to_json(&ledger.get_plan_cost().await?),
        Command::Order => to_json(&ledger.order_plan().await?),
        Command::Redeem { amount } => to_json(&ledger.redeem_credits(amount).await?),
        Command::ConfirmBurn { from_block } => {
            let confirmation = ledger
                .find_burn_confirmation_until(*from_block, ctrl_c())
                .await?;
            to_json(&confirmation)
        }
        Command::Tools => {
            let gateway = McpToolGateway::new(&config.tool_server, ledger)?;
            to_json(&gateway.list_tools().await?)
        }
        Command::Call { tool, args } => {
            let args = parse_args(args)?;
            let gateway = McpToolGateway::new(&config.tool_server, ledger)?;
            to_json(&gateway.call_tool(tool, &args).await?)
        }
        Command::Doctor { .. } => Ok(Value::Null),
    }
}

pub(crate) fn build_ledger(config: &Config) -> Result<Arc<CreditLedgerBridge>, Error> {
    let rpc: Arc<dyn ChainRpc> = Arc::new(HttpChainRpc::from_config(&config.chain));
    let backend = Arc::new(HttpLedgerBackend::new(&config.ledger)?);
    let locator = EventLocator::new(rpc.clone(), config.chain.max_block_range);
    let bridge =
        CreditLedgerBridge::new(&config.ledger, config.confirmation, backend, rpc, locator)?;
    Ok(Arc::new(bridge))
}

/// Resolves on Ctrl-C; never resolves if the signal can't be installed.
async fn ctrl_c() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!("failed to listen for Ctrl-C: {}", err);
        std::future::pending::<()>().await;
    }
}

fn load_history(path: &Path) -> Result<Vec<ConversationMessage>, Error> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        Error::InvalidInput(format!("cannot read history file {}: {e}", path.display()))
    })?;
    parse_history(&raw)
}

fn parse_history(raw: &str) -> Result<Vec<ConversationMessage>, Error> {
    serde_json::from_str(raw)
        .map_err(|e| Error::InvalidInput(format!("history must be a JSON array of messages: {e}")))
}

fn parse_args(raw: &str) -> Result<Map<String, Value>, Error> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(args)) => Ok(args),
        Ok(_) => Err(Error::InvalidInput("--args must be a JSON object".to_string())),
        Err(e) => Err(Error::InvalidInput(format!("--args is not valid JSON: {e}"))),
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<Value, Error> {
    serde_json::to_value(value).map_err(|e| Error::InvalidInput(format!("unserializable result: {e}")))
}

fn print_json(value: &Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Role;

    #[test]
    fn cli_parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "creditgate",
            "confirm-burn",
            "--from-block",
            "120",
            "--log-json",
        ])
        .unwrap();
        assert!(cli.log_json);
        assert!(matches!(cli.command, Command::ConfirmBurn { from_block: 120 }));
    }

    #[test]
    fn call_args_must_be_an_object() {
        assert_eq!(parse_args(r#"{"city":"Lima"}"#).unwrap()["city"], "Lima");
        assert!(matches!(parse_args("[1]"), Err(Error::InvalidInput(_))));
        assert!(matches!(parse_args("{"), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn history_file_uses_role_and_content() {
        let history =
            parse_history(r#"[{"role":"user","content":"hi"},{"role":"assistant","content":"hello"}]"#)
                .unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].role, Role::Assistant);
        assert!(parse_history(r#"[{"role":"system","content":"x"}]"#).is_err());
    }
}
