//! Tool server reachability probe used by `creditgate doctor`.

use std::error::Error as _;

use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;

use super::protocol::{
    JsonRpcRequest, PROTOCOL_VERSION, PROTOCOL_VERSION_HEADER, SESSION_HEADER, initialize_params,
};
use crate::config::ToolServerConfig;

/// Outcome classes for a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolServerHealthState {
    Healthy,
    InvalidUrl,
    DnsFailure,
    ConnectFailure,
    Timeout,
    AuthFailure,
    HttpFailure,
}

impl ToolServerHealthState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::InvalidUrl => "invalid_url",
            Self::DnsFailure => "dns_failure",
            Self::ConnectFailure => "connect_failure",
            Self::Timeout => "timeout",
            Self::AuthFailure => "auth_failure",
            Self::HttpFailure => "http_failure",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolServerHealth {
    pub url: String,
    pub state: ToolServerHealthState,
    pub detail: String,
    pub http_status: Option<u16>,
}

impl ToolServerHealth {
    pub fn is_healthy(&self) -> bool {
        self.state == ToolServerHealthState::Healthy
    }

    fn failed(url: &str, state: ToolServerHealthState, detail: impl Into<String>) -> Self {
        Self {
            url: url.to_string(),
            state,
            detail: detail.into(),
            http_status: None,
        }
    }
}

/// Send an MCP `initialize` and classify what comes back.
///
/// Without a token, an auth rejection still proves the server is reachable
/// and is reported as `AuthFailure` rather than a transport problem. A
/// session the server opens is deleted again before returning.
pub async fn probe_tool_server(
    config: &ToolServerConfig,
    token: Option<&SecretString>,
) -> ToolServerHealth {
    if reqwest::Url::parse(&config.url).is_err() {
        return ToolServerHealth::failed(&config.url, ToolServerHealthState::InvalidUrl, "URL parse failed");
    }

    let client = match reqwest::Client::builder().timeout(config.timeout).build() {
        Ok(client) => client,
        Err(error) => {
            return ToolServerHealth::failed(
                &config.url,
                ToolServerHealthState::ConnectFailure,
                format!("HTTP client init failed: {error}"),
            );
        }
    };

    let mut request = client
        .post(&config.url)
        .header("Accept", "application/json, text/event-stream")
        .json(&JsonRpcRequest::call(0, "initialize", initialize_params()));
    if let Some(token) = token {
        request = request.bearer_auth(token.expose_secret());
    }

    match request.send().await {
        Ok(response) => {
            let status = response.status();
            let state = if status == reqwest::StatusCode::UNAUTHORIZED
                || status == reqwest::StatusCode::FORBIDDEN
                || status == reqwest::StatusCode::PAYMENT_REQUIRED
            {
                ToolServerHealthState::AuthFailure
            } else if status.is_success() {
                ToolServerHealthState::Healthy
            } else {
                ToolServerHealthState::HttpFailure
            };

            if let Some(session) = response
                .headers()
                .get(SESSION_HEADER)
                .and_then(|value| value.to_str().ok())
            {
                let mut close = client
                    .delete(&config.url)
                    .header(SESSION_HEADER, session)
                    .header(PROTOCOL_VERSION_HEADER, PROTOCOL_VERSION);
                if let Some(token) = token {
                    close = close.bearer_auth(token.expose_secret());
                }
                if let Err(error) = close.send().await {
                    tracing::warn!("probe session close failed: {}", error);
                }
            }

            ToolServerHealth {
                url: config.url.clone(),
                state,
                detail: format!("HTTP {}", status.as_u16()),
                http_status: Some(status.as_u16()),
            }
        }
        Err(error) => ToolServerHealth::failed(
            &config.url,
            classify_transport_error(&error),
            error.to_string(),
        ),
    }
}

/// Classify a request failure by walking its source chain.
pub(crate) fn classify_transport_error(error: &reqwest::Error) -> ToolServerHealthState {
    if error.is_timeout() {
        return ToolServerHealthState::Timeout;
    }

    let mut source = error.source();
    while let Some(err) = source {
        if let Some(io_error) = err.downcast_ref::<std::io::Error>() {
            return match io_error.kind() {
                std::io::ErrorKind::NotFound => ToolServerHealthState::DnsFailure,
                _ => ToolServerHealthState::ConnectFailure,
            };
        }
        source = err.source();
    }

    let lowered = error.to_string().to_ascii_lowercase();
    if ["dns", "lookup", "name or service not known", "no such host"]
        .iter()
        .any(|needle| lowered.contains(needle))
    {
        ToolServerHealthState::DnsFailure
    } else {
        ToolServerHealthState::ConnectFailure
    }
}
