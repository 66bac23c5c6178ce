use anyhow::{Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{ChatMessage, LlmProvider, ModelReply, ToolCall};

const API_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<Value>,
    #[serde(skip_serializing_if = "<[_]>::is_empty")]
    tools: &'a [Value],
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    #[serde(other)]
    Other,
}

pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl AnthropicProvider {
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            model,
            max_tokens: 16384,
            temperature: 0.2,
        }
    }

    /// Map the transcript to the Messages API shape. System entries collapse
    /// into the top-level system parameter; consecutive tool results merge
    /// into one user message, as the API requires after a tool_use turn.
    fn build_payload(&self, messages: &[ChatMessage]) -> (Option<String>, Vec<Value>) {
        let mut system: Option<String> = None;
        let mut out: Vec<Value> = Vec::new();
        let mut pending_results: Vec<Value> = Vec::new();

        for message in messages {
            if !matches!(message, ChatMessage::ToolResult { .. }) && !pending_results.is_empty() {
                out.push(json!({
                    "role": "user",
                    "content": std::mem::take(&mut pending_results)
                }));
            }
            match message {
                ChatMessage::System(text) => match system {
                    Some(ref mut s) => {
                        s.push('\n');
                        s.push_str(text);
                    }
                    None => system = Some(text.clone()),
                },
                ChatMessage::User(text) => {
                    out.push(json!({ "role": "user", "content": text }));
                }
                ChatMessage::Assistant { text, tool_calls } => {
                    let mut blocks: Vec<Value> = Vec::new();
                    if !text.is_empty() {
                        blocks.push(json!({ "type": "text", "text": text }));
                    }
                    for call in tool_calls {
                        blocks.push(json!({
                            "type": "tool_use",
                            "id": call.id,
                            "name": call.name,
                            "input": call.arguments,
                        }));
                    }
                    if blocks.is_empty() {
                        blocks.push(json!({ "type": "text", "text": "" }));
                    }
                    out.push(json!({ "role": "assistant", "content": blocks }));
                }
                ChatMessage::ToolResult {
                    call_id,
                    content,
                    is_error,
                } => {
                    pending_results.push(json!({
                        "type": "tool_result",
                        "tool_use_id": call_id,
                        "content": content,
                        "is_error": is_error,
                    }));
                }
            }
        }
        if !pending_results.is_empty() {
            out.push(json!({ "role": "user", "content": pending_results }));
        }
        (system, out)
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn chat(&self, messages: &[ChatMessage], tools: &[Value]) -> Result<ModelReply> {
        let (system, payload_messages) = self.build_payload(messages);
        let req = MessagesRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            system,
            messages: payload_messages,
            tools,
        };

        let res = self
            .client
            .post(API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&req)
            .send()
            .await?;

        if !res.status().is_success() {
            return Err(anyhow!(
                "Anthropic API Error: {}",
                res.text().await.unwrap_or_default()
            ));
        }

        let parsed: MessagesResponse = res.json().await?;
        let mut reply = ModelReply::default();
        for block in parsed.content {
            match block {
                ContentBlock::Text { text } => {
                    if !reply.text.is_empty() {
                        reply.text.push(' ');
                    }
                    reply.text.push_str(&text);
                }
                ContentBlock::ToolUse { id, name, input } => {
                    reply.tool_calls.push(ToolCall {
                        id,
                        name,
                        arguments: input,
                    });
                }
                ContentBlock::Other => {}
            }
        }
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transcript_maps_to_messages_api_shape() {
        let provider = AnthropicProvider::new("key".into(), "model".into());
        let messages = vec![
            ChatMessage::System("be helpful".into()),
            ChatMessage::User("how many tickets?".into()),
            ChatMessage::Assistant {
                text: String::new(),
                tool_calls: vec![
                    ToolCall {
                        id: "c1".into(),
                        name: "query_fresh_service_tickets".into(),
                        arguments: json!({"sql": "SELECT COUNT(*) FROM tickets"}),
                    },
                    ToolCall {
                        id: "c2".into(),
                        name: "query_jira_demands".into(),
                        arguments: json!({"sql": "SELECT COUNT(*) FROM tickets"}),
                    },
                ],
            },
            ChatMessage::ToolResult {
                call_id: "c1".into(),
                content: "[{\"n\":5}]".into(),
                is_error: false,
            },
            ChatMessage::ToolResult {
                call_id: "c2".into(),
                content: "[{\"n\":3}]".into(),
                is_error: false,
            },
        ];

        let (system, payload) = provider.build_payload(&messages);
        assert_eq!(system.as_deref(), Some("be helpful"));
        assert_eq!(payload.len(), 3);
        assert_eq!(payload[1]["role"], "assistant");
        assert_eq!(payload[1]["content"].as_array().unwrap().len(), 2);
        // Both tool results collapse into a single user message.
        assert_eq!(payload[2]["role"], "user");
        let results = payload[2]["content"].as_array().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["tool_use_id"], "c1");
        assert_eq!(results[1]["tool_use_id"], "c2");
    }
}
