//! Per-message routing decisions.
//!
//! The router asks the completion provider what to do with a message given
//! the conversation so far and the principal's current credit balance. It
//! does not retry; provider errors propagate as-is.

use std::sync::Arc;

use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use super::prompts;
use crate::error::{Error, IntentError};
use crate::llm::{CompletionProvider, CompletionRequest};

const ROUTER_MAX_TOKENS: u32 = 256;
const ROUTER_TEMPERATURE: f32 = 0.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One chronological entry of the conversation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: Role,
    pub content: String,
}

impl ConversationMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Next step for the conversation.
///
/// Actions outside the known set are kept as `Unknown` rather than rejected;
/// the orchestrator handles them like `NoAction`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterAction {
    Forward,
    NoCredit,
    OrderPlan,
    NoAction,
    Unknown(String),
}

impl RouterAction {
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "forward" => Self::Forward,
            "no_credit" => Self::NoCredit,
            "order_plan" => Self::OrderPlan,
            "no_action" => Self::NoAction,
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Forward => "forward",
            Self::NoCredit => "no_credit",
            Self::OrderPlan => "order_plan",
            Self::NoAction => "no_action",
            Self::Unknown(raw) => raw,
        }
    }
}

impl Serialize for RouterAction {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouterDecision {
    pub action: RouterAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

pub struct Router {
    provider: Arc<dyn CompletionProvider>,
}

impl Router {
    pub fn new(provider: Arc<dyn CompletionProvider>) -> Self {
        Self { provider }
    }

    pub async fn decide(
        &self,
        message: &str,
        history: &[ConversationMessage],
        credits: u64,
    ) -> Result<RouterDecision, Error> {
        let request = CompletionRequest::new(
            prompts::router_system_prompt(),
            prompts::router_user_prompt(message, history, credits),
        )
        .with_max_tokens(ROUTER_MAX_TOKENS)
        .with_temperature(ROUTER_TEMPERATURE);

        let raw = self.provider.complete(&request).await?;
        let decision = parse_decision(&raw)?;
        tracing::debug!(
            action = decision.action.as_str(),
            credits,
            model = self.provider.model_name(),
            "router decision"
        );
        Ok(decision)
    }
}

/// Parse a decision from raw completion text: the whole text as JSON first,
/// then the first balanced `{...}` that yields a decision.
pub fn parse_decision(raw: &str) -> Result<RouterDecision, IntentError> {
    if let Ok(value) = serde_json::from_str::<Value>(raw.trim())
        && let Some(decision) = decision_from_value(&value)
    {
        return Ok(decision);
    }

    for candidate in balanced_objects(raw) {
        if let Ok(value) = serde_json::from_str::<Value>(candidate)
            && let Some(decision) = decision_from_value(&value)
        {
            return Ok(decision);
        }
    }

    Err(IntentError::MalformedResponse {
        reason: format!(
            "no JSON object with an `action` field in router output ({} chars)",
            raw.len()
        ),
    })
}

fn decision_from_value(value: &Value) -> Option<RouterDecision> {
    let object = value.as_object()?;
    let action = object.get("action")?.as_str()?;
    let message = object
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string);
    Some(RouterDecision {
        action: RouterAction::parse(action),
        message,
    })
}

/// Balanced `{...}` substrings in order of their opening brace. Braces inside
/// JSON string literals are ignored.
fn balanced_objects(raw: &str) -> impl Iterator<Item = &str> {
    raw.char_indices()
        .filter(|(_, c)| *c == '{')
        .filter_map(move |(start, _)| {
            let mut depth = 0usize;
            let mut in_string = false;
            let mut escaped = false;
            for (offset, c) in raw[start..].char_indices() {
                if in_string {
                    match c {
                        _ if escaped => escaped = false,
                        '\\' => escaped = true,
                        '"' => in_string = false,
                        _ => {}
                    }
                    continue;
                }
                match c {
                    '"' => in_string = true,
                    '{' => depth += 1,
                    '}' => {
                        depth -= 1;
                        if depth == 0 {
                            return Some(&raw[start..start + offset + c.len_utf8()]);
                        }
                    }
                    _ => {}
                }
            }
            None
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct ScriptedProvider {
        reply: Result<String, ()>,
        seen: Mutex<Vec<CompletionRequest>>,
    }

    #[async_trait]
    impl CompletionProvider for ScriptedProvider {
        fn model_name(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
            self.seen.lock().unwrap().push(request.clone());
            self.reply.clone().map_err(|_| LlmError::RequestFailed {
                provider: "scripted".to_string(),
                reason: "unavailable".to_string(),
            })
        }
    }

    #[test]
    fn parses_plain_json() {
        let decision = parse_decision(r#"{"action":"forward"}"#).unwrap();
        assert_eq!(decision.action, RouterAction::Forward);
        assert_eq!(decision.message, None);
    }

    #[test]
    fn extracts_object_embedded_in_prose() {
        let decision = parse_decision("Sure! {\"action\":\"no_credit\"} thanks").unwrap();
        assert_eq!(decision.action, RouterAction::NoCredit);
    }

    #[test]
    fn braces_inside_strings_do_not_break_matching() {
        let decision = parse_decision(
            "ok: {\"action\":\"no_action\",\"message\":\"use {braces} freely\"} done",
        )
        .unwrap();
        assert_eq!(decision.action, RouterAction::NoAction);
        assert_eq!(decision.message.as_deref(), Some("use {braces} freely"));
    }

    #[test]
    fn skips_objects_without_action() {
        let decision =
            parse_decision("{\"note\":1} then {\"action\":\"order_plan\",\"message\":\"buying\"}")
                .unwrap();
        assert_eq!(decision.action, RouterAction::OrderPlan);
        assert_eq!(decision.message.as_deref(), Some("buying"));
    }

    #[test]
    fn unknown_actions_are_preserved() {
        let decision = parse_decision(r#"{"action":"escalate"}"#).unwrap();
        assert_eq!(decision.action, RouterAction::Unknown("escalate".to_string()));
    }

    #[test]
    fn no_object_is_malformed() {
        for raw in ["I think you should forward this", "{\"action\": ", ""] {
            assert!(matches!(
                parse_decision(raw),
                Err(IntentError::MalformedResponse { .. })
            ));
        }
    }

    #[tokio::test]
    async fn decide_uses_low_temperature_and_embeds_credits() {
        let provider = Arc::new(ScriptedProvider {
            reply: Ok(r#"{"action":"no_credit","message":"Buy a plan first."}"#.to_string()),
            seen: Mutex::new(Vec::new()),
        });
        let router = Router::new(provider.clone());

        let decision = router
            .decide("weather in Lima", &[ConversationMessage::user("hi")], 0)
            .await
            .unwrap();
        assert_eq!(decision.action, RouterAction::NoCredit);

        let seen = provider.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].temperature, ROUTER_TEMPERATURE);
        assert_eq!(seen[0].max_tokens, ROUTER_MAX_TOKENS);
        assert!(seen[0].user_prompt.contains("Available credits: 0"));
    }

    #[tokio::test]
    async fn provider_failure_propagates_without_retry() {
        let provider = Arc::new(ScriptedProvider {
            reply: Err(()),
            seen: Mutex::new(Vec::new()),
        });
        let router = Router::new(provider.clone());

        let err = router.decide("hello", &[], 3).await.unwrap_err();
        assert!(matches!(err, Error::Llm(LlmError::RequestFailed { .. })));
        assert_eq!(provider.seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn action_serializes_as_wire_label() {
        let json = serde_json::to_value(RouterDecision {
            action: RouterAction::OrderPlan,
            message: None,
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({ "action": "order_plan" }));
    }
}
