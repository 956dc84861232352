//! Driver RPC: line-delimited JSON-RPC 2.0 over stdio.
//!
//! The Driver sends one request per line and reads one response per line.
//! The advertised tools wrap the call manager's operations; results are
//! textual, errors come back as `{isError: true}` content rather than
//! protocol errors, and stack traces never cross this boundary.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, error, info};

use crate::call::CallManager;
use crate::errors::BridgeError;

pub const PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Serialize)]
pub struct RpcResponse {
    pub jsonrpc: &'static str,
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Serialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcResponse {
    fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    fn error(id: Option<Value>, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

mod error_codes {
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const PARSE_ERROR: i64 = -32700;
}

pub struct DriverRpc {
    manager: Arc<CallManager>,
}

impl DriverRpc {
    pub fn new(manager: Arc<CallManager>) -> Self {
        Self { manager }
    }

    /// Read requests line by line until EOF. Returns when the Driver goes
    /// away, which the caller treats as a shutdown signal.
    pub async fn run<R, W>(&self, reader: R, mut writer: W)
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = BufReader::new(reader).lines();
        info!("driver RPC ready");

        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let response = match serde_json::from_str::<RpcRequest>(line) {
                Ok(request) => {
                    // Notifications get no response.
                    if request.id.is_none() {
                        debug!(method = %request.method, "notification");
                        continue;
                    }
                    self.handle(request).await
                }
                Err(e) => RpcResponse::error(
                    None,
                    error_codes::PARSE_ERROR,
                    format!("invalid request: {e}"),
                ),
            };

            let mut serialized =
                serde_json::to_vec(&response).unwrap_or_else(|_| b"{}".to_vec());
            serialized.push(b'\n');
            if writer.write_all(&serialized).await.is_err() {
                error!("driver pipe closed while writing");
                break;
            }
            let _ = writer.flush().await;
        }
        info!("driver RPC loop ended");
    }

    pub async fn handle(&self, request: RpcRequest) -> RpcResponse {
        match request.method.as_str() {
            "initialize" => RpcResponse::success(
                request.id,
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": { "tools": {} },
                    "serverInfo": {
                        "name": "callbridge",
                        "version": env!("CARGO_PKG_VERSION"),
                    }
                }),
            ),
            "tools/list" => RpcResponse::success(request.id, json!({ "tools": tool_list() })),
            "tools/call" => self.handle_tool_call(request).await,
            other => RpcResponse::error(
                request.id,
                error_codes::METHOD_NOT_FOUND,
                format!("unknown method: {other}"),
            ),
        }
    }

    async fn handle_tool_call(&self, request: RpcRequest) -> RpcResponse {
        let Some(name) = request.params.get("name").and_then(Value::as_str) else {
            return RpcResponse::error(
                request.id,
                error_codes::INVALID_PARAMS,
                "missing 'name' in tools/call",
            );
        };
        let args = request
            .params
            .get("arguments")
            .cloned()
            .unwrap_or(json!({}));

        let message = args.get("message").and_then(Value::as_str).unwrap_or("");
        let call_id = args.get("call_id").and_then(Value::as_str);
        if matches!(name, "continue_call" | "speak_to_user" | "end_call") && call_id.is_none() {
            return RpcResponse::error(
                request.id,
                error_codes::INVALID_PARAMS,
                "missing 'call_id'",
            );
        }

        let outcome = match name {
            "initiate_call" | "continue_call" | "speak_to_user" | "end_call" | "send_text" => {
                self.dispatch(name, message, call_id).await
            }
            other => {
                return RpcResponse::error(
                    request.id,
                    error_codes::METHOD_NOT_FOUND,
                    format!("unknown tool: {other}"),
                );
            }
        };

        let content = match outcome {
            Ok(text) => json!({
                "content": [{ "type": "text", "text": text }]
            }),
            Err(e) => json!({
                "content": [{ "type": "text", "text": e.driver_message() }],
                "isError": true
            }),
        };
        RpcResponse::success(request.id, content)
    }

    async fn dispatch(
        &self,
        name: &str,
        message: &str,
        call_id: Option<&str>,
    ) -> Result<String, BridgeError> {
        match name {
            "initiate_call" => {
                let result = self.manager.initiate_call(message).await?;
                Ok(format!(
                    "Call initiated (call_id: {}). User said: {}",
                    result.call_id, result.response
                ))
            }
            "continue_call" => {
                let call_id = call_id.expect("checked by caller");
                let response = self.manager.continue_call(call_id, message).await?;
                Ok(format!("User said: {response}"))
            }
            "speak_to_user" => {
                let call_id = call_id.expect("checked by caller");
                self.manager.speak_to_user(call_id, message).await?;
                Ok("Message is being spoken to the user.".to_string())
            }
            "end_call" => {
                let call_id = call_id.expect("checked by caller");
                self.manager.end_call(call_id, message).await?;
                Ok("Call ended.".to_string())
            }
            // SMS transport lives outside the call core.
            _ => Err(BridgeError::Agent(crate::errors::AgentError::ProtocolError(
                "SMS transport is not configured".into(),
            ))),
        }
    }
}

/// Tool definitions advertised to the Driver.
pub fn tool_list() -> Vec<Value> {
    let message_only = json!({
        "type": "object",
        "properties": {
            "message": { "type": "string", "description": "What the agent should say" }
        },
        "required": ["message"]
    });
    let with_call_id = json!({
        "type": "object",
        "properties": {
            "call_id": { "type": "string", "description": "Id returned by initiate_call" },
            "message": { "type": "string", "description": "What the agent should say" }
        },
        "required": ["call_id", "message"]
    });

    vec![
        json!({
            "name": "initiate_call",
            "description": "Place a phone call to the user, speak the message, and return their reply.",
            "inputSchema": message_only,
        }),
        json!({
            "name": "continue_call",
            "description": "Speak a message on an active call and wait for the user's reply.",
            "inputSchema": with_call_id,
        }),
        json!({
            "name": "speak_to_user",
            "description": "Speak a message on an active call without waiting for a reply.",
            "inputSchema": with_call_id,
        }),
        json!({
            "name": "end_call",
            "description": "Say goodbye and hang up the call.",
            "inputSchema": with_call_id,
        }),
        json!({
            "name": "send_text",
            "description": "Send an SMS to the user.",
            "inputSchema": json!({
                "type": "object",
                "properties": {
                    "message": { "type": "string" },
                    "media_urls": { "type": "array", "items": { "type": "string" } }
                },
                "required": ["message"]
            }),
        }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::carrier::{CarrierPort, MediaConnectDirective};
    use crate::errors::CarrierError;
    use crate::tools::ToolRegistry;
    use async_trait::async_trait;

    struct DeadCarrier;

    #[async_trait]
    impl CarrierPort for DeadCarrier {
        async fn place_outbound(
            &self,
            _to: &str,
            _from: &str,
            _webhook_url: &str,
        ) -> Result<String, CarrierError> {
            Err(CarrierError::PlaceFailed("no carrier in tests".into()))
        }
        async fn start_media_stream(
            &self,
            _call_ref: &str,
            _ws_url: &str,
        ) -> Result<(), CarrierError> {
            Ok(())
        }
        async fn hangup(&self, _call_ref: &str) -> Result<(), CarrierError> {
            Ok(())
        }
        fn media_connect_directive(&self, _ws_url: &str) -> MediaConnectDirective {
            MediaConnectDirective {
                content_type: "text/xml",
                body: String::new(),
            }
        }
    }

    fn rpc() -> DriverRpc {
        DriverRpc::new(CallManager::new(
            Arc::new(crate::config::test_config()),
            Arc::new(DeadCarrier),
            Arc::new(ToolRegistry::empty()),
            reqwest::Client::new(),
        ))
    }

    fn request(method: &str, params: Value) -> RpcRequest {
        RpcRequest {
            id: Some(json!(1)),
            method: method.to_string(),
            params,
        }
    }

    #[tokio::test]
    async fn initialize_reports_server_info() {
        let response = rpc().handle(request("initialize", json!({}))).await;
        let result = response.result.unwrap();
        assert_eq!(result["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(result["serverInfo"]["name"], "callbridge");
    }

    #[tokio::test]
    async fn tools_list_advertises_call_tools() {
        let response = rpc().handle(request("tools/list", json!({}))).await;
        let tools = response.result.unwrap()["tools"].clone();
        let names: Vec<&str> = tools
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert_eq!(
            names,
            vec![
                "initiate_call",
                "continue_call",
                "speak_to_user",
                "end_call",
                "send_text"
            ]
        );
    }

    #[tokio::test]
    async fn unknown_method_is_a_protocol_error() {
        let response = rpc().handle(request("resources/list", json!({}))).await;
        assert_eq!(response.error.unwrap().code, error_codes::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn tool_errors_come_back_as_is_error_content() {
        let response = rpc()
            .handle(request(
                "tools/call",
                json!({"name": "continue_call",
                       "arguments": {"call_id": "nope", "message": "hi"}}),
            ))
            .await;
        let result = response.result.unwrap();
        assert_eq!(result["isError"], true);
        assert!(
            result["content"][0]["text"]
                .as_str()
                .unwrap()
                .contains("nope")
        );
    }

    #[tokio::test]
    async fn failed_placement_surfaces_carrier_error_text() {
        let response = rpc()
            .handle(request(
                "tools/call",
                json!({"name": "initiate_call", "arguments": {"message": "hello"}}),
            ))
            .await;
        let result = response.result.unwrap();
        assert_eq!(result["isError"], true);
        assert!(
            result["content"][0]["text"]
                .as_str()
                .unwrap()
                .contains("place outbound call")
        );
    }

    #[tokio::test]
    async fn run_loop_answers_over_a_pipe() {
        let rpc = rpc();
        let input = b"{\"jsonrpc\":\"2.0\",\"id\":7,\"method\":\"tools/list\"}\n" as &[u8];
        let mut output = Vec::new();
        rpc.run(input, &mut output).await;

        let line = String::from_utf8(output).unwrap();
        let response: Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(response["id"], 7);
        assert!(response["result"]["tools"].is_array());
    }
}
