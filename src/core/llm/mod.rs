pub mod anthropic;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

/// A tool invocation emitted by the model, linked to its eventual outcome
/// by the correlation id.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// One entry of a conversation transcript.
#[derive(Debug, Clone)]
pub enum ChatMessage {
    System(String),
    User(String),
    Assistant {
        text: String,
        tool_calls: Vec<ToolCall>,
    },
    ToolResult {
        call_id: String,
        content: String,
        is_error: bool,
    },
}

/// What the model returned for one round: either a final text (no tool
/// calls) or a batch of tool invocations to execute.
#[derive(Debug, Clone, Default)]
pub struct ModelReply {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
}

/// The language model, treated as a black box: given a transcript and a
/// tool schema it returns either a final answer or tool invocations.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn model_id(&self) -> &str;

    async fn chat(&self, messages: &[ChatMessage], tools: &[Value]) -> Result<ModelReply>;
}
