//! Per-message pipeline: credits, routing, then either a tool dispatch, a
//! plan purchase, or a direct reply.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::Instrument;
use uuid::Uuid;

use super::intent::{IntentSynthesizer, SynthesizedIntent};
use super::router::{ConversationMessage, Router, RouterAction};
use crate::error::Error;
use crate::ledger::{CreditLedgerBridge, OrderOutcome};
use crate::llm::CompletionProvider;
use crate::tools::{ToolCallOutput, ToolCatalogEntry, ToolGateway};

/// Result of handling one inbound message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OrchestratorOutcome {
    /// A tool was selected and executed.
    ToolResult {
        tool: String,
        args: Map<String, Value>,
        output: ToolCallOutput,
    },
    /// Work should be forwarded but no tool catalog was available; the
    /// instruction is returned undispatched.
    Instruction { text: String },
    PlanOrdered(OrderOutcome),
    /// The router's own reply, passed through verbatim.
    Reply {
        action: RouterAction,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

pub struct Orchestrator {
    ledger: Arc<CreditLedgerBridge>,
    tools: Arc<dyn ToolGateway>,
    router: Router,
    synthesizer: IntentSynthesizer,
    agent_context: String,
}

impl Orchestrator {
    pub fn new(
        provider: Arc<dyn CompletionProvider>,
        ledger: Arc<CreditLedgerBridge>,
        tools: Arc<dyn ToolGateway>,
        agent: &crate::config::AgentConfig,
    ) -> Self {
        Self {
            ledger,
            tools,
            router: Router::new(provider.clone()),
            synthesizer: IntentSynthesizer::new(provider, agent.selection_attempts),
            agent_context: agent.context.clone(),
        }
    }

    /// Handle one message. `history` is the conversation before `message`.
    pub async fn handle(
        &self,
        message: &str,
        history: &[ConversationMessage],
    ) -> Result<OrchestratorOutcome, Error> {
        if message.trim().is_empty() {
            return Err(Error::InvalidInput("message must not be empty".to_string()));
        }

        let span = tracing::info_span!("handle_message", request_id = %Uuid::new_v4());
        self.handle_inner(message, history).instrument(span).await
    }

    async fn handle_inner(
        &self,
        message: &str,
        history: &[ConversationMessage],
    ) -> Result<OrchestratorOutcome, Error> {
        let credits = match self.ledger.get_balance().await {
            Ok(credits) => credits,
            Err(err) => {
                tracing::warn!("credit balance lookup failed, routing with 0 credits: {}", err);
                0
            }
        };

        let decision = self.router.decide(message, history, credits).await?;

        match decision.action {
            RouterAction::Forward => self.forward(message, history).await,
            RouterAction::OrderPlan => Ok(OrchestratorOutcome::PlanOrdered(
                self.ledger.order_plan().await?,
            )),
            RouterAction::NoCredit | RouterAction::NoAction => Ok(OrchestratorOutcome::Reply {
                action: decision.action,
                message: decision.message,
            }),
            RouterAction::Unknown(raw) => {
                tracing::warn!(action = %raw, "unknown router action, treating as no_action");
                Ok(OrchestratorOutcome::Reply {
                    action: RouterAction::NoAction,
                    message: decision.message,
                })
            }
        }
    }

    async fn forward(
        &self,
        message: &str,
        history: &[ConversationMessage],
    ) -> Result<OrchestratorOutcome, Error> {
        let mut conversation = history.to_vec();
        conversation.push(ConversationMessage::user(message));

        let catalog = self.tool_catalog().await;
        let intent = self
            .synthesizer
            .synthesize(&conversation, &self.agent_context, catalog.as_deref())
            .await?;

        match intent {
            SynthesizedIntent::NaturalLanguageInstruction { text } => {
                Ok(OrchestratorOutcome::Instruction { text })
            }
            SynthesizedIntent::ToolInvocation { tool, args } => {
                let output = self.tools.call_tool(&tool, &args).await?;
                tracing::info!(%tool, "tool call completed");
                Ok(OrchestratorOutcome::ToolResult { tool, args, output })
            }
        }
    }

    async fn tool_catalog(&self) -> Option<Vec<ToolCatalogEntry>> {
        match self.tools.list_tools().await {
            Ok(catalog) if !catalog.is_empty() => Some(catalog),
            Ok(_) => {
                tracing::warn!("tool server advertises no tools, falling back to an instruction");
                None
            }
            Err(err) => {
                tracing::warn!("tool catalog unavailable, falling back to an instruction: {}", err);
                None
            }
        }
    }
}
