//! Streamable-HTTP MCP client.
//!
//! Every operation runs in its own session: `initialize`, the
//! `notifications/initialized` handshake, the request itself, then a
//! `DELETE` of the session. The session is closed on every exit path; close
//! failures are logged and otherwise ignored.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Map, Value, json};

use super::health::classify_transport_error;
use super::protocol::{
    JsonRpcRequest, JsonRpcResponse, PROTOCOL_VERSION, PROTOCOL_VERSION_HEADER, SESSION_HEADER,
    SseDecoder, initialize_params, normalize_call_result, parse_tool_list,
};
use crate::config::ToolServerConfig;
use crate::error::{Error, ToolError, redact_sensitive_detail};
use crate::tools::{AccessTokenSource, ToolCallOutput, ToolCatalogEntry, ToolGateway};

struct Session {
    id: Option<String>,
    token: SecretString,
}

pub struct McpToolGateway {
    client: Client,
    url: String,
    timeout: Duration,
    tokens: Arc<dyn AccessTokenSource>,
    next_id: AtomicU64,
}

impl McpToolGateway {
    pub fn new(
        config: &ToolServerConfig,
        tokens: Arc<dyn AccessTokenSource>,
    ) -> Result<Self, ToolError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ToolError::Transport {
                operation: "client init".to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            client,
            url: config.url.clone(),
            timeout: config.timeout,
            tokens,
            next_id: AtomicU64::new(1),
        })
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn open_session(&self) -> Result<Session, Error> {
        let token = self.tokens.access_token().await?;
        let mut session = Session { id: None, token };

        let id = self.next_id();
        let response = self
            .send(
                &session,
                "initialize",
                &JsonRpcRequest::call(id, "initialize", initialize_params()),
            )
            .await?;
        // The server may open a session even when the body that follows is unusable.
        session.id = session_header(&response);
        let initialized = match self.read_reply("initialize", response, Some(id)).await {
            Ok(Some(reply)) => reply.into_result("initialize").map(drop),
            Ok(None) => Ok(()),
            Err(err) => Err(err),
        };
        if let Err(err) = initialized {
            self.close_session(&session).await;
            return Err(err.into());
        }

        let handshake = self
            .post(
                &session,
                "notifications/initialized",
                &JsonRpcRequest::notification("notifications/initialized"),
                None,
            )
            .await;
        if let Err(err) = handshake {
            self.close_session(&session).await;
            return Err(err.into());
        }

        tracing::debug!(session = ?session.id, "tool server session opened");
        Ok(session)
    }

    async fn close_session(&self, session: &Session) {
        let Some(id) = &session.id else {
            return;
        };
        let result = self
            .client
            .delete(&self.url)
            .bearer_auth(session.token.expose_secret())
            .header(SESSION_HEADER, id)
            .header(PROTOCOL_VERSION_HEADER, PROTOCOL_VERSION)
            .send()
            .await;
        match result {
            Ok(response)
                if response.status().is_success()
                    || response.status() == StatusCode::METHOD_NOT_ALLOWED
                    || response.status() == StatusCode::NOT_FOUND => {}
            Ok(response) => {
                tracing::warn!(
                    session = %id,
                    status = response.status().as_u16(),
                    "tool server session close rejected"
                );
            }
            Err(err) => {
                tracing::warn!(
                    session = %id,
                    "tool server session close failed: {}",
                    redact_sensitive_detail(&err.to_string())
                );
            }
        }
    }

    /// Run one request inside a fresh session.
    async fn request(&self, method: &str, params: Value) -> Result<Value, Error> {
        let session = self.open_session().await?;
        let id = self.next_id();
        let result = self
            .post(&session, method, &JsonRpcRequest::call(id, method, params), Some(id))
            .await;
        self.close_session(&session).await;

        let response = result?.ok_or_else(|| ToolError::Protocol {
            operation: method.to_string(),
            reason: "server accepted the request without a response".to_string(),
        })?;
        Ok(response.into_result(method)?)
    }

    /// POST one JSON-RPC message. Returns the response matching `expect_id`,
    /// or `None` for accepted notifications.
    async fn post(
        &self,
        session: &Session,
        operation: &str,
        body: &JsonRpcRequest<'_>,
        expect_id: Option<u64>,
    ) -> Result<Option<JsonRpcResponse>, ToolError> {
        let response = self.send(session, operation, body).await?;
        self.read_reply(operation, response, expect_id).await
    }

    async fn send(
        &self,
        session: &Session,
        operation: &str,
        body: &JsonRpcRequest<'_>,
    ) -> Result<reqwest::Response, ToolError> {
        let mut request = self
            .client
            .post(&self.url)
            .bearer_auth(session.token.expose_secret())
            .header("Accept", "application/json, text/event-stream")
            .json(body);
        if let Some(id) = &session.id {
            request = request
                .header(SESSION_HEADER, id)
                .header(PROTOCOL_VERSION_HEADER, PROTOCOL_VERSION);
        }

        request
            .send()
            .await
            .map_err(|e| self.transport_error(operation, &e))
    }

    /// Map the status and read the body of a POST response.
    async fn read_reply(
        &self,
        operation: &str,
        response: reqwest::Response,
        expect_id: Option<u64>,
    ) -> Result<Option<JsonRpcResponse>, ToolError> {
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED
            || status == StatusCode::PAYMENT_REQUIRED
            || status == StatusCode::FORBIDDEN
        {
            return Err(ToolError::AuthFailed {
                reason: format!("{operation} returned HTTP {}", status.as_u16()),
            });
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ToolError::Transport {
                operation: operation.to_string(),
                reason: redact_sensitive_detail(&format!("HTTP {}: {}", status.as_u16(), detail)),
            });
        }

        let Some(expect_id) = expect_id else {
            return Ok(None);
        };
        if status == StatusCode::ACCEPTED {
            return Ok(None);
        }

        let is_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with("text/event-stream"));

        let message = if is_stream {
            self.read_stream(operation, response, expect_id).await?
        } else {
            let text = response
                .text()
                .await
                .map_err(|e| self.transport_error(operation, &e))?;
            find_response(operation, &text, expect_id)?
        };
        Ok(Some(message))
    }

    async fn read_stream(
        &self,
        operation: &str,
        response: reqwest::Response,
        expect_id: u64,
    ) -> Result<JsonRpcResponse, ToolError> {
        let mut decoder = SseDecoder::default();
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| self.transport_error(operation, &e))?;
            for data in decoder.push(&chunk) {
                if let Some(message) = decode_message(&data, expect_id) {
                    return Ok(message);
                }
            }
        }
        if let Some(data) = decoder.finish()
            && let Some(message) = decode_message(&data, expect_id)
        {
            return Ok(message);
        }

        Err(ToolError::Protocol {
            operation: operation.to_string(),
            reason: format!("event stream ended without a response to request {expect_id}"),
        })
    }

    fn transport_error(&self, operation: &str, error: &reqwest::Error) -> ToolError {
        if error.is_timeout() {
            return ToolError::Timeout {
                timeout: self.timeout,
            };
        }
        ToolError::Transport {
            operation: operation.to_string(),
            reason: format!(
                "{}: {}",
                classify_transport_error(error).as_str(),
                redact_sensitive_detail(&error.to_string())
            ),
        }
    }
}

fn session_header(response: &reqwest::Response) -> Option<String> {
    response
        .headers()
        .get(SESSION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

/// Parse a JSON-RPC message, skipping server requests and notifications.
fn decode_message(data: &str, expect_id: u64) -> Option<JsonRpcResponse> {
    serde_json::from_str::<JsonRpcResponse>(data)
        .ok()
        .filter(|message| message.matches(expect_id))
}

/// Plain JSON bodies may hold a single message or a batch.
fn find_response(operation: &str, text: &str, expect_id: u64) -> Result<JsonRpcResponse, ToolError> {
    let value: Value = serde_json::from_str(text).map_err(|e| ToolError::Protocol {
        operation: operation.to_string(),
        reason: format!("invalid JSON body: {e}"),
    })?;
    let candidates = match value {
        Value::Array(items) => items,
        single => vec![single],
    };
    candidates
        .into_iter()
        .filter_map(|item| serde_json::from_value::<JsonRpcResponse>(item).ok())
        .find(|message| message.matches(expect_id))
        .ok_or_else(|| ToolError::Protocol {
            operation: operation.to_string(),
            reason: format!("no response to request {expect_id}"),
        })
}

#[async_trait]
impl ToolGateway for McpToolGateway {
    async fn list_tools(&self) -> Result<Vec<ToolCatalogEntry>, Error> {
        let result = self.request("tools/list", json!({})).await?;
        let tools = parse_tool_list(result)?;
        tracing::debug!(count = tools.len(), "listed tools");
        Ok(tools)
    }

    async fn call_tool(&self, name: &str, args: &Map<String, Value>) -> Result<ToolCallOutput, Error> {
        let result = self
            .request(
                "tools/call",
                json!({ "name": name, "arguments": Value::Object(args.clone()) }),
            )
            .await?;
        Ok(normalize_call_result(name, result)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use axum::Router;
    use axum::body::Body;
    use axum::extract::State;
    use axum::http::HeaderMap;
    use axum::response::{IntoResponse, Response};
    use axum::routing::post;

    #[derive(Clone, Copy)]
    enum InitReply {
        Json,
        StreamWithoutResponse,
        Status(u16),
    }

    #[derive(Clone, Copy)]
    enum CallReply {
        SplitStream,
        RpcError,
        Status(u16),
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Seen {
        method: String,
        session: Option<String>,
        auth: Option<String>,
    }

    struct FakeToolServer {
        init: InitReply,
        call: CallReply,
        posts: Mutex<Vec<Seen>>,
        deletes: Mutex<Vec<Seen>>,
    }

    impl FakeToolServer {
        fn new(init: InitReply, call: CallReply) -> Self {
            Self {
                init,
                call,
                posts: Mutex::new(Vec::new()),
                deletes: Mutex::new(Vec::new()),
            }
        }

        fn deletes(&self) -> Vec<Seen> {
            self.deletes.lock().unwrap().clone()
        }

        fn methods(&self) -> Vec<String> {
            self.posts.lock().unwrap().iter().map(|seen| seen.method.clone()).collect()
        }
    }

    fn header(headers: &HeaderMap, name: &str) -> Option<String> {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    }

    fn status(code: u16) -> Response {
        StatusCode::from_u16(code).unwrap().into_response()
    }

    async fn handle_post(
        State(server): State<Arc<FakeToolServer>>,
        headers: HeaderMap,
        axum::Json(body): axum::Json<Value>,
    ) -> Response {
        let method = body["method"].as_str().unwrap_or_default().to_string();
        server.posts.lock().unwrap().push(Seen {
            method: method.clone(),
            session: header(&headers, SESSION_HEADER),
            auth: header(&headers, "authorization"),
        });
        let id = body["id"].clone();

        match method.as_str() {
            "initialize" => match server.init {
                InitReply::Json => (
                    [(SESSION_HEADER, "S1")],
                    axum::Json(json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "result": { "protocolVersion": PROTOCOL_VERSION, "capabilities": {} }
                    })),
                )
                    .into_response(),
                InitReply::StreamWithoutResponse => (
                    [(SESSION_HEADER, "S1"), ("content-type", "text/event-stream")],
                    "data: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/message\"}\n\n",
                )
                    .into_response(),
                InitReply::Status(code) => status(code),
            },
            "notifications/initialized" => StatusCode::ACCEPTED.into_response(),
            "tools/list" => axum::Json(json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": { "tools": [{
                    "name": "weather.today",
                    "inputSchema": { "type": "object", "properties": { "city": { "type": "string" } } }
                }] }
            }))
            .into_response(),
            "tools/call" => match server.call {
                CallReply::SplitStream => {
                    let event = format!(
                        "data: {}\n\n",
                        json!({
                            "jsonrpc": "2.0",
                            "id": id,
                            "result": { "content": [{ "type": "text", "text": "72\u{b0}F" }] }
                        })
                    )
                    .into_bytes();
                    let split = event.iter().position(|&b| b == 0xC2).unwrap() + 1;
                    let chunks = vec![event[..split].to_vec(), event[split..].to_vec()];
                    (
                        [("content-type", "text/event-stream")],
                        Body::from_stream(futures::stream::iter(
                            chunks.into_iter().map(Ok::<_, std::convert::Infallible>),
                        )),
                    )
                        .into_response()
                }
                CallReply::RpcError => axum::Json(json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": { "code": -32602, "message": "Unknown tool" }
                }))
                .into_response(),
                CallReply::Status(code) => status(code),
            },
            _ => StatusCode::BAD_REQUEST.into_response(),
        }
    }

    async fn handle_delete(State(server): State<Arc<FakeToolServer>>, headers: HeaderMap) -> StatusCode {
        server.deletes.lock().unwrap().push(Seen {
            method: "DELETE".to_string(),
            session: header(&headers, SESSION_HEADER),
            auth: header(&headers, "authorization"),
        });
        StatusCode::OK
    }

    struct FixedToken;

    #[async_trait]
    impl AccessTokenSource for FixedToken {
        async fn access_token(&self) -> Result<SecretString, Error> {
            Ok(SecretString::from("tool-token"))
        }
    }

    async fn gateway(init: InitReply, call: CallReply) -> (McpToolGateway, Arc<FakeToolServer>) {
        let server = Arc::new(FakeToolServer::new(init, call));
        let app = Router::new()
            .route("/mcp", post(handle_post).delete(handle_delete))
            .with_state(server.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let config = ToolServerConfig {
            url: format!("http://{addr}/mcp"),
            timeout: Duration::from_secs(5),
        };
        (McpToolGateway::new(&config, Arc::new(FixedToken)).unwrap(), server)
    }

    fn closed_session() -> Seen {
        Seen {
            method: "DELETE".to_string(),
            session: Some("S1".to_string()),
            auth: Some("Bearer tool-token".to_string()),
        }
    }

    #[tokio::test]
    async fn call_runs_one_session_and_closes_it() {
        let (gateway, server) = gateway(InitReply::Json, CallReply::SplitStream).await;
        let mut args = Map::new();
        args.insert("city".to_string(), json!("Lima"));

        let output = gateway.call_tool("weather.today", &args).await.unwrap();

        assert_eq!(output.output_text, "72\u{b0}F");
        assert_eq!(
            server.methods(),
            vec!["initialize", "notifications/initialized", "tools/call"]
        );
        let posts = server.posts.lock().unwrap().clone();
        assert_eq!(posts[0].session, None);
        for seen in &posts {
            assert_eq!(seen.auth.as_deref(), Some("Bearer tool-token"));
        }
        assert_eq!(posts[1].session.as_deref(), Some("S1"));
        assert_eq!(posts[2].session.as_deref(), Some("S1"));
        assert_eq!(server.deletes(), vec![closed_session()]);
    }

    #[tokio::test]
    async fn list_tools_closes_its_session() {
        let (gateway, server) = gateway(InitReply::Json, CallReply::SplitStream).await;
        let tools = gateway.list_tools().await.unwrap();
        assert_eq!(tools[0].name, "weather.today");
        assert_eq!(server.deletes(), vec![closed_session()]);
    }

    #[tokio::test]
    async fn rpc_error_still_closes_the_session() {
        let (gateway, server) = gateway(InitReply::Json, CallReply::RpcError).await;
        let err = gateway.call_tool("weather.today", &Map::new()).await.unwrap_err();
        assert!(matches!(err, Error::Tool(ToolError::Protocol { .. })));
        assert_eq!(server.deletes(), vec![closed_session()]);
    }

    #[tokio::test]
    async fn server_failure_still_closes_the_session() {
        let (gateway, server) = gateway(InitReply::Json, CallReply::Status(500)).await;
        let err = gateway.call_tool("weather.today", &Map::new()).await.unwrap_err();
        assert!(matches!(err, Error::Tool(ToolError::Transport { .. })));
        assert_eq!(server.deletes(), vec![closed_session()]);
    }

    #[tokio::test]
    async fn session_opened_by_a_broken_initialize_is_closed() {
        let (gateway, server) = gateway(InitReply::StreamWithoutResponse, CallReply::SplitStream).await;
        let err = gateway.list_tools().await.unwrap_err();
        assert!(matches!(err, Error::Tool(ToolError::Protocol { .. })));
        assert_eq!(server.methods(), vec!["initialize"]);
        assert_eq!(server.deletes(), vec![closed_session()]);
    }

    #[tokio::test]
    async fn auth_statuses_map_to_auth_failed() {
        for code in [401, 402, 403] {
            let (gateway, server) = gateway(InitReply::Status(code), CallReply::SplitStream).await;
            let err = gateway.list_tools().await.unwrap_err();
            assert!(
                matches!(err, Error::Tool(ToolError::AuthFailed { .. })),
                "HTTP {code}: {err:?}"
            );
            assert!(server.deletes().is_empty());
        }

        let (gateway, server) = gateway(InitReply::Json, CallReply::Status(402)).await;
        let err = gateway.call_tool("weather.today", &Map::new()).await.unwrap_err();
        assert_eq!(err.class(), crate::error::ErrorClass::Authentication);
        assert_eq!(server.deletes(), vec![closed_session()]);
    }

    #[test]
    fn batch_bodies_are_searched_by_id() {
        let body = r#"[{"jsonrpc":"2.0","method":"notifications/progress"},{"jsonrpc":"2.0","id":4,"result":{"tools":[]}}]"#;
        let response = find_response("tools/list", body, 4).unwrap();
        assert!(response.result.is_some());
    }

    #[test]
    fn mismatched_ids_are_protocol_errors() {
        let body = r#"{"jsonrpc":"2.0","id":3,"result":{}}"#;
        assert!(matches!(
            find_response("tools/list", body, 4),
            Err(ToolError::Protocol { .. })
        ));
    }

    #[test]
    fn stream_messages_without_matching_id_are_skipped() {
        assert!(decode_message(r#"{"jsonrpc":"2.0","method":"ping","id":"srv-1"}"#, 1).is_none());
        assert!(decode_message("not json", 1).is_none());
        assert!(decode_message(r#"{"jsonrpc":"2.0","id":1,"result":{}}"#, 1).is_some());
    }

    #[test]
    fn rpc_errors_surface_as_protocol_errors() {
        let response = find_response(
            "tools/call",
            r#"{"jsonrpc":"2.0","id":9,"error":{"code":-32602,"message":"Unknown tool"}}"#,
            9,
        )
        .unwrap();
        match response.into_result("tools/call") {
            Err(ToolError::Protocol { reason, .. }) => assert!(reason.contains("-32602")),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
