//! Error types for creditgate.

use std::time::Duration;

use regex::Regex;
use serde::Serialize;

/// Top-level error type for the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Intent error: {0}")]
    Intent(#[from] IntentError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Caller-facing error taxonomy.
///
/// Callers map these onto user-facing messages; only `UpstreamProvider`
/// is worth retrying as a whole request.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Configuration,
    Authentication,
    UpstreamProvider,
    MalformedResponse,
    InvalidToolSelection,
    ToolRejected,
    InvalidInput,
}

impl ErrorClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Configuration => "configuration_error",
            Self::Authentication => "authentication_error",
            Self::UpstreamProvider => "upstream_provider_error",
            Self::MalformedResponse => "malformed_response",
            Self::InvalidToolSelection => "invalid_tool_selection",
            Self::ToolRejected => "tool_rejected",
            Self::InvalidInput => "invalid_input",
        }
    }

    pub fn is_retryable(self) -> bool {
        matches!(self, Self::UpstreamProvider)
    }
}

impl Error {
    /// Classify this error for the caller.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Config(_) => ErrorClass::Configuration,
            Self::Llm(err) => err.class(),
            Self::Intent(err) => err.class(),
            Self::Ledger(err) => err.class(),
            Self::Chain(_) => ErrorClass::UpstreamProvider,
            Self::Tool(err) => err.class(),
            Self::InvalidInput(_) => ErrorClass::InvalidInput,
        }
    }
}

/// Structured error payload for callers that frame results as JSON.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorPayload {
    pub class: ErrorClass,
    pub code: &'static str,
    pub retryable: bool,
    pub message: String,
}

impl From<&Error> for ErrorPayload {
    fn from(error: &Error) -> Self {
        let class = error.class();
        Self {
            class,
            code: class.as_str(),
            retryable: class.is_retryable(),
            message: redact_sensitive_detail(&error.to_string()),
        }
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Completion provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl LlmError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::AuthFailed { .. } => ErrorClass::Authentication,
            _ => ErrorClass::UpstreamProvider,
        }
    }
}

/// Failures turning completion output into a decision or intent.
#[derive(Debug, thiserror::Error)]
pub enum IntentError {
    #[error("Malformed completion response: {reason}")]
    MalformedResponse { reason: String },

    #[error("Invalid tool selection after {attempts} attempt(s): {reason}")]
    InvalidToolSelection { attempts: u32, reason: String },
}

impl IntentError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::MalformedResponse { .. } => ErrorClass::MalformedResponse,
            Self::InvalidToolSelection { .. } => ErrorClass::InvalidToolSelection,
        }
    }
}

/// Credit ledger errors.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Plan {plan_id} is missing {field}")]
    PlanIncomplete { plan_id: String, field: &'static str },

    #[error("Wallet address for the ledger principal is unavailable")]
    WalletUnavailable,

    #[error("Invalid credit amount '{0}': expected a positive integer")]
    InvalidAmount(String),

    #[error("Ledger authentication failed: {reason}")]
    AuthFailed { reason: String },

    #[error("Ledger request {operation} failed: {reason}")]
    RequestFailed { operation: String, reason: String },

    #[error("Invalid ledger response for {operation}: {reason}")]
    InvalidResponse { operation: String, reason: String },
}

impl LedgerError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::PlanIncomplete { .. } | Self::WalletUnavailable => ErrorClass::Configuration,
            Self::InvalidAmount(_) => ErrorClass::InvalidInput,
            Self::AuthFailed { .. } => ErrorClass::Authentication,
            Self::RequestFailed { .. } | Self::InvalidResponse { .. } => {
                ErrorClass::UpstreamProvider
            }
        }
    }
}

/// Chain RPC errors.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("RPC {method} failed: {reason}")]
    Rpc { method: String, reason: String },

    #[error("RPC returned error for {method}: {detail}")]
    RpcReturned { method: String, detail: String },

    #[error("Failed to decode {field}: {reason}")]
    Decode { field: String, reason: String },

    #[error("Invalid address '{0}': expected a 0x-prefixed 20-byte hex string")]
    InvalidAddress(String),
}

/// Tool gateway errors.
///
/// `Transport` means the agent could not be reached; `Rejected` means the
/// tool ran and reported failure. Callers must keep the two apart.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Tool server transport failed during {operation}: {reason}")]
    Transport { operation: String, reason: String },

    #[error("Tool server authentication failed: {reason}")]
    AuthFailed { reason: String },

    #[error("Tool server protocol error during {operation}: {reason}")]
    Protocol { operation: String, reason: String },

    #[error("Tool {name} reported failure: {message}")]
    Rejected { name: String, message: String },

    #[error("Tool server timed out after {timeout:?}")]
    Timeout { timeout: Duration },
}

impl ToolError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::AuthFailed { .. } => ErrorClass::Authentication,
            Self::Rejected { .. } => ErrorClass::ToolRejected,
            Self::Transport { .. } | Self::Protocol { .. } | Self::Timeout { .. } => {
                ErrorClass::UpstreamProvider
            }
        }
    }
}

/// Result type alias for the orchestrator.
pub type Result<T> = std::result::Result<T, Error>;

/// Scrub bearer tokens and key-like values out of free-form error detail.
pub fn redact_sensitive_detail(raw: &str) -> String {
    let mut value = raw.to_string();
    let patterns = [
        (r"(?i)\b(bearer)\s+[a-z0-9._\-~+/]+=*", "$1 [REDACTED]"),
        (
            r"(?i)\b(token|api[_\-]?key|secret|password)\b(\s*[:=]\s*)([^,\s]+)",
            "$1$2[REDACTED]",
        ),
        (r"(?i)\bsk-[a-z0-9\-]{10,}\b", "sk-[REDACTED]"),
    ];

    for (pattern, replacement) in patterns {
        if let Ok(re) = Regex::new(pattern) {
            value = re.replace_all(&value, replacement).to_string();
        }
    }

    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_rejection_is_distinct_from_transport_failure() {
        let rejected = Error::from(ToolError::Rejected {
            name: "weather.today".to_string(),
            message: "city unknown".to_string(),
        });
        let unreachable = Error::from(ToolError::Transport {
            operation: "tools/call".to_string(),
            reason: "connection refused".to_string(),
        });

        assert_eq!(rejected.class(), ErrorClass::ToolRejected);
        assert_eq!(unreachable.class(), ErrorClass::UpstreamProvider);
        assert!(!rejected.class().is_retryable());
        assert!(unreachable.class().is_retryable());
    }

    #[test]
    fn ledger_errors_map_onto_taxonomy() {
        let missing = Error::from(LedgerError::PlanIncomplete {
            plan_id: "42".to_string(),
            field: "token address",
        });
        assert_eq!(missing.class(), ErrorClass::Configuration);

        let auth = Error::from(LedgerError::AuthFailed {
            reason: "401".to_string(),
        });
        assert_eq!(auth.class(), ErrorClass::Authentication);
    }

    #[test]
    fn payload_redacts_bearer_tokens() {
        let error = Error::from(ToolError::Transport {
            operation: "initialize".to_string(),
            reason: "header Authorization: Bearer abc.def.ghi rejected".to_string(),
        });
        let payload = ErrorPayload::from(&error);
        assert!(!payload.message.contains("abc.def.ghi"));
        assert!(payload.message.contains("Bearer [REDACTED]"));
        assert_eq!(payload.code, "upstream_provider_error");
    }
}
