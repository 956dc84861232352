//! LLM brain for split mode.
//!
//! Wraps a Claude-style messages API with tool support. The brain holds
//! the running conversation; the call session drives the tool loop by
//! calling [`LlmBrain::handle_tool_results`] while responses stop with
//! `tool_use`. Out-of-band context (Driver messages mid-call) is injected
//! through a configurable template so the model can tell relayed
//! instructions apart from the caller's speech.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::BrainConfig;
use crate::errors::AgentError;
use crate::tools::ToolSpec;

const API_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
}

/// One tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct BrainToolUse {
    pub id: String,
    pub name: String,
    pub input: Value,
}

/// A parsed model response.
#[derive(Debug, Clone)]
pub struct BrainResponse {
    pub text: String,
    pub tool_uses: Vec<BrainToolUse>,
    pub stop_reason: StopReason,
}

#[derive(Debug, Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: &'a [Value],
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    input: Option<Value>,
}

pub struct LlmBrain {
    config: BrainConfig,
    http: reqwest::Client,
    tools: Vec<ToolSpec>,
    /// Full conversation, in the API's message shape.
    messages: Mutex<Vec<Value>>,
}

impl LlmBrain {
    pub fn new(config: BrainConfig, http: reqwest::Client, tools: Vec<ToolSpec>) -> Self {
        Self {
            config,
            http,
            tools,
            messages: Mutex::new(Vec::new()),
        }
    }

    /// Respond to the user's transcribed speech.
    pub async fn respond(&self, user_text: &str) -> Result<BrainResponse, AgentError> {
        self.push_user(json!(user_text)).await;
        self.complete().await
    }

    /// Feed tool results back after executing the model's requests.
    pub async fn handle_tool_results(
        &self,
        tool_uses: &[BrainToolUse],
        results: &[(String, bool)],
    ) -> Result<BrainResponse, AgentError> {
        let blocks: Vec<Value> = tool_uses
            .iter()
            .zip(results)
            .map(|(tool_use, (output, is_error))| {
                json!({
                    "type": "tool_result",
                    "tool_use_id": tool_use.id,
                    "content": output,
                    "is_error": is_error,
                })
            })
            .collect();
        self.push_user(Value::Array(blocks)).await;
        self.complete().await
    }

    /// Inject out-of-band context through the configured template.
    pub async fn inject_context(&self, text: &str) -> Result<BrainResponse, AgentError> {
        let framed = self.config.context_template.replacen("{}", text, 1);
        self.respond(&framed).await
    }

    async fn push_user(&self, content: Value) {
        self.messages
            .lock()
            .await
            .push(json!({"role": "user", "content": content}));
    }

    async fn complete(&self) -> Result<BrainResponse, AgentError> {
        let tools: Vec<Value> = self
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.input_schema,
                })
            })
            .collect();

        // The history lock is held across the request so concurrent turns
        // (conversation loop vs. Driver injection) serialize cleanly.
        let mut messages = self.messages.lock().await;
        let request_body = serde_json::to_value(ApiRequest {
            model: &self.config.model_id,
            max_tokens: MAX_TOKENS,
            system: &self.config.system_prompt,
            messages: &messages,
            tools,
        })
        .map_err(|e| AgentError::ProtocolError(e.to_string()))?;

        let response = self
            .http
            .post(API_URL)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&request_body)
            .send()
            .await
            .map_err(|e| AgentError::StreamError(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::StreamError(format!("brain {status}: {body}")));
        }

        let parsed: ApiResponse = response
            .json()
            .await
            .map_err(|e| AgentError::ProtocolError(e.to_string()))?;

        // Record the assistant turn verbatim so tool_use ids line up when
        // results come back.
        let assistant_content: Vec<Value> = parsed
            .content
            .iter()
            .map(|block| match block.block_type.as_str() {
                "text" => json!({"type": "text", "text": block.text.clone().unwrap_or_default()}),
                "tool_use" => json!({
                    "type": "tool_use",
                    "id": block.id.clone().unwrap_or_default(),
                    "name": block.name.clone().unwrap_or_default(),
                    "input": block.input.clone().unwrap_or(json!({})),
                }),
                _ => json!({"type": "text", "text": ""}),
            })
            .collect();
        messages.push(json!({"role": "assistant", "content": assistant_content}));
        drop(messages);

        Ok(interpret(parsed))
    }
}

fn interpret(response: ApiResponse) -> BrainResponse {
    let mut text = String::new();
    let mut tool_uses = Vec::new();
    for block in response.content {
        match block.block_type.as_str() {
            "text" => {
                if let Some(t) = block.text {
                    if !text.is_empty() {
                        text.push(' ');
                    }
                    text.push_str(&t);
                }
            }
            "tool_use" => {
                tool_uses.push(BrainToolUse {
                    id: block.id.unwrap_or_default(),
                    name: block.name.unwrap_or_default(),
                    input: block.input.unwrap_or(json!({})),
                });
            }
            other => debug!(block = other, "ignoring content block"),
        }
    }

    let stop_reason = match response.stop_reason.as_deref() {
        Some("tool_use") => StopReason::ToolUse,
        Some("max_tokens") => StopReason::MaxTokens,
        _ => StopReason::EndTurn,
    };

    BrainResponse {
        text,
        tool_uses,
        stop_reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(body: &str) -> ApiResponse {
        serde_json::from_str(body).unwrap()
    }

    #[test]
    fn interprets_plain_text_response() {
        let response = interpret(parse(
            r#"{"content":[{"type":"text","text":"All services are healthy."}],
                "stop_reason":"end_turn"}"#,
        ));
        assert_eq!(response.text, "All services are healthy.");
        assert!(response.tool_uses.is_empty());
        assert_eq!(response.stop_reason, StopReason::EndTurn);
    }

    #[test]
    fn interprets_tool_use_response() {
        let response = interpret(parse(
            r#"{"content":[
                {"type":"text","text":"Checking."},
                {"type":"tool_use","id":"t1","name":"service_health","input":{"service":"all"}}],
                "stop_reason":"tool_use"}"#,
        ));
        assert_eq!(response.stop_reason, StopReason::ToolUse);
        assert_eq!(response.tool_uses.len(), 1);
        assert_eq!(response.tool_uses[0].name, "service_health");
        assert_eq!(response.tool_uses[0].input["service"], "all");
    }

    #[test]
    fn unknown_stop_reason_defaults_to_end_turn() {
        let response = interpret(parse(
            r#"{"content":[{"type":"text","text":"hi"}],"stop_reason":"something_new"}"#,
        ));
        assert_eq!(response.stop_reason, StopReason::EndTurn);
    }

    #[tokio::test]
    async fn context_template_frames_injection() {
        let brain = LlmBrain::new(
            BrainConfig {
                api_key: "k".into(),
                model_id: "m".into(),
                system_prompt: "s".into(),
                context_template: "[System: {}]".into(),
            },
            reqwest::Client::new(),
            Vec::new(),
        );
        // Only exercise the message shaping, not the network call.
        brain.push_user(json!("[System: wrap up the call]")).await;
        let messages = brain.messages.lock().await;
        assert_eq!(messages[0]["content"], "[System: wrap up the call]");
    }
}
