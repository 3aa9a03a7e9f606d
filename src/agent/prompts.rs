//! Prompt text for the router and intent synthesizer.

use super::router::ConversationMessage;
use crate::tools::ToolCatalogEntry;

const ROUTER_SYSTEM_PROMPT: &str = "\
You route messages for an assistant that can delegate paid work to a remote agent.
Every delegated task costs credits. Decide what happens next and answer with a single JSON object:
{\"action\": \"forward\" | \"no_credit\" | \"order_plan\" | \"no_action\", \"message\": \"<optional reply to the user>\"}
- forward: the user wants the agent to do something and there are credits left.
- no_credit: the user wants the agent to do something but there are no credits; explain how to buy a plan.
- order_plan: the user explicitly asked to buy or top up credits.
- no_action: small talk or anything the agent is not needed for; reply directly in `message`.
Respond with JSON only.";

const INSTRUCTION_SYSTEM_PROMPT: &str = "\
Summarize what the user wants from the agent described below as one short imperative sentence.
Do not add anything the user did not ask for. Output the sentence only.";

const TOOL_SELECTION_SYSTEM_PROMPT: &str = "\
Pick exactly one tool from the catalog below to satisfy the user's latest request, and fill in its arguments.
Answer with a single JSON object of the form {\"tool\": \"<name>\", \"args\": {...}}.
Use only argument names declared in the tool's input schema and include every required one.
Respond with JSON only.";

pub(crate) fn router_system_prompt() -> &'static str {
    ROUTER_SYSTEM_PROMPT
}

pub(crate) fn router_user_prompt(
    message: &str,
    history: &[ConversationMessage],
    credits: u64,
) -> String {
    format!(
        "Available credits: {credits}\n\nConversation so far:\n{}\n\nLatest message:\n{message}",
        render_history(history)
    )
}

pub(crate) fn instruction_system_prompt(agent_context: &str) -> String {
    format!("{INSTRUCTION_SYSTEM_PROMPT}\n\nAgent:\n{agent_context}")
}

pub(crate) fn tool_selection_system_prompt(
    agent_context: &str,
    catalog: &[ToolCatalogEntry],
) -> String {
    let tools = catalog
        .iter()
        .map(|entry| {
            let description = entry.description.as_deref().unwrap_or("");
            format!(
                "- {}: {}\n  input schema: {}",
                entry.name, description, entry.input_schema
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    format!("{TOOL_SELECTION_SYSTEM_PROMPT}\n\nAgent:\n{agent_context}\n\nCatalog:\n{tools}")
}

pub(crate) fn conversation_prompt(history: &[ConversationMessage]) -> String {
    format!("Conversation:\n{}", render_history(history))
}

/// Appended on a retry so the model can correct its previous selection.
pub(crate) fn selection_feedback(previous: &str, problem: &str) -> String {
    format!(
        "\n\nYour previous answer was rejected.\nPrevious answer: {previous}\nProblem: {problem}\nAnswer again with corrected JSON only."
    )
}

fn render_history(history: &[ConversationMessage]) -> String {
    if history.is_empty() {
        return "(empty)".to_string();
    }
    history
        .iter()
        .map(|entry| format!("{}: {}", entry.role.as_str(), entry.content))
        .collect::<Vec<_>>()
        .join("\n")
}
