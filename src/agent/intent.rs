//! Turn conversation history into something the remote agent can execute.
//!
//! Without a tool catalog the result is a one-sentence natural-language
//! instruction. With a catalog it is a tool invocation whose arguments have
//! been checked against the chosen tool's input schema; a selection that
//! fails the check is retried with the failure fed back to the model, up to
//! the configured number of attempts.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};

use super::prompts;
use super::router::ConversationMessage;
use crate::error::{Error, IntentError};
use crate::llm::{CompletionProvider, CompletionRequest};
use crate::tools::ToolCatalogEntry;

const INSTRUCTION_MAX_TOKENS: u32 = 80;
const SELECTION_MAX_TOKENS: u32 = 512;
const SELECTION_TEMPERATURE: f32 = 0.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SynthesizedIntent {
    NaturalLanguageInstruction { text: String },
    ToolInvocation { tool: String, args: Map<String, Value> },
}

pub struct IntentSynthesizer {
    provider: Arc<dyn CompletionProvider>,
    selection_attempts: u32,
}

impl IntentSynthesizer {
    pub fn new(provider: Arc<dyn CompletionProvider>, selection_attempts: u32) -> Self {
        Self {
            provider,
            selection_attempts: selection_attempts.max(1),
        }
    }

    pub async fn synthesize(
        &self,
        history: &[ConversationMessage],
        agent_context: &str,
        catalog: Option<&[ToolCatalogEntry]>,
    ) -> Result<SynthesizedIntent, Error> {
        match catalog {
            None => self.instruction(history, agent_context).await,
            Some(catalog) => self.select_tool(history, agent_context, catalog).await,
        }
    }

    async fn instruction(
        &self,
        history: &[ConversationMessage],
        agent_context: &str,
    ) -> Result<SynthesizedIntent, Error> {
        let request = CompletionRequest::new(
            prompts::instruction_system_prompt(agent_context),
            prompts::conversation_prompt(history),
        )
        .with_max_tokens(INSTRUCTION_MAX_TOKENS);

        let text = self.provider.complete(&request).await?.trim().to_string();
        if text.is_empty() {
            return Err(IntentError::MalformedResponse {
                reason: "empty instruction".to_string(),
            }
            .into());
        }
        Ok(SynthesizedIntent::NaturalLanguageInstruction { text })
    }

    async fn select_tool(
        &self,
        history: &[ConversationMessage],
        agent_context: &str,
        catalog: &[ToolCatalogEntry],
    ) -> Result<SynthesizedIntent, Error> {
        if catalog.is_empty() {
            return Err(IntentError::InvalidToolSelection {
                attempts: 0,
                reason: "tool catalog is empty".to_string(),
            }
            .into());
        }

        let system_prompt = prompts::tool_selection_system_prompt(agent_context, catalog);
        let conversation = prompts::conversation_prompt(history);
        let mut feedback = String::new();

        for attempt in 1..=self.selection_attempts {
            let request = CompletionRequest::new(
                system_prompt.clone(),
                format!("{conversation}{feedback}"),
            )
            .with_max_tokens(SELECTION_MAX_TOKENS)
            .with_temperature(SELECTION_TEMPERATURE);

            let raw = self.provider.complete(&request).await?;
            match parse_tool_selection(&raw, catalog) {
                Ok((tool, args)) => {
                    tracing::debug!(%tool, attempt, "tool selected");
                    return Ok(SynthesizedIntent::ToolInvocation { tool, args });
                }
                Err(problem) if attempt < self.selection_attempts => {
                    tracing::warn!(attempt, %problem, "tool selection rejected, retrying");
                    feedback = prompts::selection_feedback(raw.trim(), &problem);
                }
                Err(problem) => {
                    return Err(IntentError::InvalidToolSelection {
                        attempts: attempt,
                        reason: problem,
                    }
                    .into());
                }
            }
        }

        // selection_attempts is at least 1, so the loop always returns.
        Err(IntentError::InvalidToolSelection {
            attempts: self.selection_attempts,
            reason: "no selection attempted".to_string(),
        }
        .into())
    }
}

/// Parse `{tool, args}` and validate it against the catalog.
pub fn parse_tool_selection(
    raw: &str,
    catalog: &[ToolCatalogEntry],
) -> Result<(String, Map<String, Value>), String> {
    let value: Value = serde_json::from_str(strip_code_fence(raw))
        .map_err(|e| format!("output is not valid JSON: {e}"))?;
    let object = value
        .as_object()
        .ok_or_else(|| "output is not a JSON object".to_string())?;
    let tool = object
        .get("tool")
        .and_then(Value::as_str)
        .ok_or_else(|| "missing string field `tool`".to_string())?;
    let args = object
        .get("args")
        .and_then(Value::as_object)
        .ok_or_else(|| "missing object field `args`".to_string())?;

    let entry = catalog
        .iter()
        .find(|entry| entry.name == tool)
        .ok_or_else(|| format!("unknown tool `{tool}`"))?;
    validate_args(&entry.input_schema, args)?;

    Ok((tool.to_string(), args.clone()))
}

/// Check `args` against an object input schema: no undeclared keys, every
/// required key present, declared `type`/`enum` respected.
///
/// Undeclared keys are only accepted when the schema sets
/// `additionalProperties: true`. A tool advertised without a schema
/// therefore takes no arguments.
pub fn validate_args(schema: &Value, args: &Map<String, Value>) -> Result<(), String> {
    let empty = Map::new();
    let properties = schema
        .get("properties")
        .and_then(Value::as_object)
        .unwrap_or(&empty);
    let open = schema.get("additionalProperties") == Some(&Value::Bool(true));

    let mut extraneous: Vec<&str> = args
        .keys()
        .filter(|key| !open && !properties.contains_key(*key))
        .map(String::as_str)
        .collect();
    if !extraneous.is_empty() {
        extraneous.sort_unstable();
        return Err(format!("undeclared argument(s): {}", extraneous.join(", ")));
    }

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        let missing: Vec<&str> = required
            .iter()
            .filter_map(Value::as_str)
            .filter(|key| !args.contains_key(*key))
            .collect();
        if !missing.is_empty() {
            return Err(format!("missing required argument(s): {}", missing.join(", ")));
        }
    }

    for (key, value) in args {
        let Some(property) = properties.get(key) else {
            continue;
        };
        if let Some(expected) = property.get("type")
            && !type_matches(expected, value)
        {
            return Err(format!("argument `{key}` should be of type {expected}"));
        }
        if let Some(allowed) = property.get("enum").and_then(Value::as_array)
            && !allowed.contains(value)
        {
            return Err(format!("argument `{key}` is not one of {}", Value::Array(allowed.clone())));
        }
    }

    Ok(())
}

fn type_matches(expected: &Value, value: &Value) -> bool {
    match expected {
        Value::String(name) => json_type_is(name, value),
        Value::Array(names) => names
            .iter()
            .filter_map(Value::as_str)
            .any(|name| json_type_is(name, value)),
        _ => true,
    }
}

fn json_type_is(name: &str, value: &Value) -> bool {
    match name {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(body) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = body.strip_prefix("json").unwrap_or(body);
    body.strip_suffix("```").unwrap_or(body).trim()
}
