use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::llm::{ChatMessage, LlmProvider, ToolCall};
use super::tools::{ToolDispatch, ToolReply, describe_invocation};

const SYSTEM_PROMPT: &str = "You are an intelligent AI assistant with access to the \
organization's ticketing systems.\n\n\
You have access to the following tools:\n\
- Query and analyze Freshservice tickets (IT service desk tickets)\n\
- Query and analyze JIRA demands/issues\n\
- Refresh data from these systems\n\
- Get status of cached data\n\n\
IMPORTANT SQL QUERY INSTRUCTIONS:\n\
- When using query_fresh_service_tickets or query_jira_demands, the data is in a table \
called 'tickets'\n\
- Always use 'SELECT * FROM tickets' or 'SELECT column FROM tickets WHERE...' format\n\
- Example queries:\n\
  - Count records: SELECT COUNT(*) FROM tickets\n\
  - Filter by status: SELECT * FROM tickets WHERE status = 'Open'\n\
  - Get specific columns: SELECT ticket_id, subject, status FROM tickets LIMIT 10\n\
- NEVER use just 'SELECT *' without 'FROM tickets'\n\n\
When users ask about tickets, issues, or demands:\n\
1. Use the appropriate query tool with proper SQL syntax\n\
2. Provide helpful insights and analysis\n\n\
Be concise, helpful, and data-driven in your responses.";

const CONCLUDE_PROMPT: &str =
    "Based on all the data gathered, please provide your final analysis and response. \
     Do not request any more tools.";

/// A prior turn supplied by the client.
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryEntry {
    pub sender: String,
    pub text: String,
}

/// Progress events for the streaming mode, emitted in strict chronological
/// order on one channel per request and serialized as discrete JSON objects
/// tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Content {
        content: String,
    },
    Thinking {
        text: String,
    },
    ToolCall {
        id: String,
        tool: String,
        args: Value,
        content: String,
    },
    ToolResult {
        id: String,
        tool: String,
        result: String,
        is_error: bool,
        content: String,
    },
    ToolComplete {
        content: String,
    },
    Error {
        error: String,
    },
    Done,
}

#[derive(Debug, Clone)]
pub struct ChatOptions {
    /// Hard bound on model-call rounds per conversation.
    pub max_rounds: usize,
    /// How many prior turns are carried into the transcript.
    pub history_limit: usize,
    /// Answer text is streamed in chunks of this many characters.
    pub chunk_size: usize,
    /// Pacing delays for the streaming path only; not correctness-bearing.
    pub chunk_delay: Duration,
    pub round_delay: Duration,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            max_rounds: 10,
            history_limit: 10,
            chunk_size: 20,
            chunk_delay: Duration::from_millis(10),
            round_delay: Duration::from_millis(500),
        }
    }
}

/// Send an event if a stream sender is attached. A gone receiver is
/// ignored: a disconnected client does not stop the underlying work.
async fn emit(tx: &Option<mpsc::Sender<StreamEvent>>, event: StreamEvent) {
    if let Some(tx) = tx {
        let _ = tx.send(event).await;
    }
}

fn narration(tool_calls: &[ToolCall]) -> String {
    let names: Vec<&str> = tool_calls.iter().map(|c| c.name.as_str()).collect();
    if names.contains(&"get_data_status") {
        "Let me check the current status of the cached data first...".to_string()
    } else if names.contains(&"query_fresh_service_tickets") {
        "I'll query the Freshservice tickets to get the information you need...".to_string()
    } else if names.contains(&"query_jira_demands") {
        "Let me check the JIRA demands for you...".to_string()
    } else if names.len() > 1 {
        format!(
            "I need to use {} tools to get complete information...",
            names.len()
        )
    } else {
        "Let me gather the information...".to_string()
    }
}

/// The round-based conversation state machine. One instance is shared by
/// all requests; each call owns its own transcript.
pub struct ChatService {
    llm: Arc<dyn LlmProvider>,
    tools: Arc<dyn ToolDispatch>,
    options: ChatOptions,
}

impl ChatService {
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        tools: Arc<dyn ToolDispatch>,
        options: ChatOptions,
    ) -> Self {
        Self {
            llm,
            tools,
            options,
        }
    }

    /// Synchronous mode: run the machine to completion and return the final
    /// text. Failures are contained here as a user-visible message; a
    /// conversation-level error never crashes the process.
    pub async fn respond(&self, message: &str, history: &[HistoryEntry]) -> String {
        match self.run(message, history, &None).await {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) => "Query completed.".to_string(),
            Err(e) => {
                error!("Error generating response: {:#}", e);
                format!("I encountered an error: {}", e)
            }
        }
    }

    /// Streaming mode: emit `StreamEvent`s as the machine progresses. Any
    /// failure emits a single terminal `error` event; the stream is never
    /// left open indefinitely.
    pub async fn respond_streaming(
        &self,
        message: &str,
        history: &[HistoryEntry],
        tx: mpsc::Sender<StreamEvent>,
    ) {
        let tx = Some(tx);
        if let Err(e) = self.run(message, history, &tx).await {
            error!("Streaming error: {:#}", e);
            emit(&tx, StreamEvent::Error {
                error: e.to_string(),
            })
            .await;
        }
    }

    fn build_transcript(&self, message: &str, history: &[HistoryEntry]) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::System(SYSTEM_PROMPT.to_string())];
        let start = history.len().saturating_sub(self.options.history_limit);
        for entry in &history[start..] {
            match entry.sender.as_str() {
                "user" => messages.push(ChatMessage::User(entry.text.clone())),
                "bot" => messages.push(ChatMessage::Assistant {
                    text: entry.text.clone(),
                    tool_calls: Vec::new(),
                }),
                _ => {}
            }
        }
        messages.push(ChatMessage::User(message.to_string()));
        messages
    }

    /// One state machine for both modes. `AwaitingModel` and `Dispatching`
    /// alternate for up to `max_rounds`; a model reply without tool calls
    /// finalizes, and round exhaustion forces a termination round.
    async fn run(
        &self,
        message: &str,
        history: &[HistoryEntry],
        tx: &Option<mpsc::Sender<StreamEvent>>,
    ) -> Result<String> {
        let mut messages = self.build_transcript(message, history);
        let schemas = self.tools.schemas();
        let mut total_tools = 0usize;

        for round in 1..=self.options.max_rounds {
            info!("Round {} - sending transcript to the model", round);
            // A model-call failure aborts the round and surfaces as the
            // top-level conversation failure.
            let reply = self.llm.chat(&messages, &schemas).await?;

            if reply.tool_calls.is_empty() {
                info!(
                    "Complete after {} round(s) with {} tool call(s)",
                    round, total_tools
                );
                return self.finalize(reply.text, tx).await;
            }

            total_tools += reply.tool_calls.len();
            emit(tx, StreamEvent::Thinking {
                text: narration(&reply.tool_calls),
            })
            .await;

            // Correlation ids pair each invocation with its outcome; fill
            // in ids for providers that omit them.
            let calls: Vec<ToolCall> = reply
                .tool_calls
                .into_iter()
                .map(|mut call| {
                    if call.id.is_empty() {
                        call.id = Uuid::new_v4().to_string();
                    }
                    call
                })
                .collect();

            messages.push(ChatMessage::Assistant {
                text: reply.text,
                tool_calls: calls.clone(),
            });

            info!("Model requested {} tool(s), dispatching in parallel", calls.len());

            // Fan-out: every invocation of the round runs concurrently.
            let mut handles = Vec::with_capacity(calls.len());
            for call in &calls {
                emit(tx, StreamEvent::ToolCall {
                    id: call.id.clone(),
                    tool: call.name.clone(),
                    args: call.arguments.clone(),
                    content: describe_invocation(&call.name, &call.arguments),
                })
                .await;
                let tools = self.tools.clone();
                let call = call.clone();
                handles.push(tokio::spawn(async move {
                    tools.dispatch(&call.name, &call.arguments).await
                }));
            }

            // Fan-in: await in request order so outcomes rejoin the
            // transcript in the order the invocations were issued.
            let mut outcomes: Vec<(String, ToolReply)> = Vec::with_capacity(calls.len());
            for (call, handle) in calls.iter().zip(handles) {
                let outcome = match handle.await {
                    Ok(reply) => reply,
                    // A panicking tool is contained to its own outcome.
                    Err(e) => ToolReply {
                        text: format!("Error: {}", e),
                        is_error: true,
                    },
                };
                emit(tx, StreamEvent::ToolResult {
                    id: call.id.clone(),
                    tool: call.name.clone(),
                    result: outcome.text.clone(),
                    is_error: outcome.is_error,
                    content: if outcome.is_error {
                        format!("Error from {}", call.name)
                    } else {
                        format!("Result from {}", call.name)
                    },
                })
                .await;
                outcomes.push((call.id.clone(), outcome));
            }

            emit(tx, StreamEvent::ToolComplete {
                content: format!(
                    "Processed {} tool{}",
                    calls.len(),
                    if calls.len() > 1 { "s" } else { "" }
                ),
            })
            .await;

            for (call_id, outcome) in outcomes {
                messages.push(ChatMessage::ToolResult {
                    call_id,
                    content: outcome.text,
                    is_error: outcome.is_error,
                });
            }

            if tx.is_some() {
                tokio::time::sleep(self.options.round_delay).await;
            }
        }

        // Round exhaustion is a designed degradation path, not an error:
        // one final call instructs the model to conclude from the data it
        // already gathered.
        warn!(
            "Reached max rounds ({}) with {} tool call(s), forcing final response",
            self.options.max_rounds, total_tools
        );
        messages.push(ChatMessage::User(CONCLUDE_PROMPT.to_string()));
        let text = match self.llm.chat(&messages, &[]).await {
            Ok(reply) if !reply.text.trim().is_empty() => reply.text,
            Ok(_) => synthesized_answer(total_tools),
            Err(e) => {
                error!("Failed to get final response: {:#}", e);
                synthesized_answer(total_tools)
            }
        };
        self.finalize(text, tx).await
    }

    /// Deliver the answer: streamed in fixed-size chunks with a terminal
    /// `done`, or returned whole in synchronous mode.
    async fn finalize(
        &self,
        text: String,
        tx: &Option<mpsc::Sender<StreamEvent>>,
    ) -> Result<String> {
        if tx.is_some() {
            let chars: Vec<char> = text.chars().collect();
            for chunk in chars.chunks(self.options.chunk_size.max(1)) {
                emit(tx, StreamEvent::Content {
                    content: chunk.iter().collect(),
                })
                .await;
                tokio::time::sleep(self.options.chunk_delay).await;
            }
            emit(tx, StreamEvent::Done).await;
        }
        Ok(text)
    }
}

fn synthesized_answer(total_tools: usize) -> String {
    format!(
        "Analysis complete after processing {} operations.",
        total_tools
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::llm::{ModelReply, ToolCall};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    /// Scripted provider: pops one reply per call; repeats the last one
    /// when the script runs out.
    struct ScriptedProvider {
        replies: Mutex<Vec<ModelReply>>,
        calls: Mutex<Vec<usize>>,
    }

    impl ScriptedProvider {
        fn new(mut replies: Vec<ModelReply>) -> Arc<Self> {
            replies.reverse();
            Arc::new(Self {
                replies: Mutex::new(replies),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        fn model_id(&self) -> &str {
            "scripted"
        }

        async fn chat(&self, _messages: &[ChatMessage], tools: &[Value]) -> Result<ModelReply> {
            self.calls.lock().unwrap().push(tools.len());
            let mut replies = self.replies.lock().unwrap();
            match replies.len() {
                0 => Ok(ModelReply::default()),
                1 => Ok(replies[0].clone()),
                _ => Ok(replies.pop().unwrap()),
            }
        }
    }

    struct EchoTools {
        latency: Duration,
    }

    #[async_trait]
    impl ToolDispatch for EchoTools {
        fn schemas(&self) -> Vec<Value> {
            vec![json!({"name": "echo", "input_schema": {"type": "object"}})]
        }

        async fn dispatch(&self, name: &str, args: &Value) -> ToolReply {
            tokio::time::sleep(self.latency).await;
            ToolReply {
                text: format!("{}:{}", name, args),
                is_error: name == "broken",
            }
        }
    }

    fn tool_reply(calls: Vec<(&str, Value)>) -> ModelReply {
        ModelReply {
            text: String::new(),
            tool_calls: calls
                .into_iter()
                .enumerate()
                .map(|(i, (name, arguments))| ToolCall {
                    id: format!("call-{}", i),
                    name: name.to_string(),
                    arguments,
                })
                .collect(),
        }
    }

    fn fast_options() -> ChatOptions {
        ChatOptions {
            chunk_delay: Duration::ZERO,
            round_delay: Duration::ZERO,
            ..ChatOptions::default()
        }
    }

    fn service(provider: Arc<ScriptedProvider>, latency: Duration) -> ChatService {
        ChatService::new(provider, Arc::new(EchoTools { latency }), fast_options())
    }

    #[tokio::test]
    async fn final_text_without_tool_calls_ends_in_one_round() {
        let provider = ScriptedProvider::new(vec![ModelReply {
            text: "There are 5 open tickets.".into(),
            tool_calls: vec![],
        }]);
        let svc = service(provider.clone(), Duration::ZERO);
        let answer = svc.respond("how many open?", &[]).await;
        assert_eq!(answer, "There are 5 open tickets.");
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn endless_tool_requests_terminate_at_max_rounds_with_answer() {
        // The script always requests a tool; the machine must stop after
        // max_rounds plus one termination call.
        let provider = ScriptedProvider::new(vec![tool_reply(vec![("echo", json!({}))])]);
        let svc = service(provider.clone(), Duration::ZERO);
        let answer = svc.respond("dig forever", &[]).await;
        assert!(!answer.trim().is_empty());
        assert_eq!(provider.call_count(), ChatOptions::default().max_rounds + 1);
    }

    #[tokio::test]
    async fn termination_round_is_called_without_tools() {
        let provider = ScriptedProvider::new(vec![tool_reply(vec![("echo", json!({}))])]);
        let svc = service(provider.clone(), Duration::ZERO);
        svc.respond("dig forever", &[]).await;
        let calls = provider.calls.lock().unwrap().clone();
        let last = *calls.last().unwrap();
        assert_eq!(last, 0, "termination round must not offer tools");
        assert!(calls[..calls.len() - 1].iter().all(|&n| n > 0));
    }

    #[tokio::test]
    async fn tool_fan_out_runs_concurrently() {
        let latency = Duration::from_millis(100);
        let provider = ScriptedProvider::new(vec![
            tool_reply(vec![
                ("echo", json!({"n": 1})),
                ("echo", json!({"n": 2})),
                ("echo", json!({"n": 3})),
            ]),
            ModelReply {
                text: "done".into(),
                tool_calls: vec![],
            },
        ]);
        let svc = service(provider, latency);
        let started = std::time::Instant::now();
        let answer = svc.respond("fan out", &[]).await;
        let elapsed = started.elapsed();
        assert_eq!(answer, "done");
        assert!(
            elapsed < latency * 2,
            "3 tools with latency {:?} took {:?}; expected concurrent execution",
            latency,
            elapsed
        );
    }

    #[tokio::test]
    async fn stream_pairs_every_tool_call_with_a_result() {
        let provider = ScriptedProvider::new(vec![
            tool_reply(vec![("echo", json!({"n": 1})), ("broken", json!({}))]),
            ModelReply {
                text: "all done".into(),
                tool_calls: vec![],
            },
        ]);
        let svc = service(provider, Duration::ZERO);
        let (tx, mut rx) = mpsc::channel(64);
        svc.respond_streaming("pair check", &[], tx).await;

        let mut events = Vec::new();
        while let Ok(evt) = rx.try_recv() {
            events.push(evt);
        }

        let call_ids: Vec<String> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ToolCall { id, .. } => Some(id.clone()),
                _ => None,
            })
            .collect();
        let result_ids: Vec<String> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ToolResult { id, .. } => Some(id.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(call_ids.len(), 2);
        assert_eq!(call_ids, result_ids);

        // Every tool_call precedes its matching tool_result.
        for id in &call_ids {
            let call_pos = events
                .iter()
                .position(|e| matches!(e, StreamEvent::ToolCall { id: i, .. } if i == id))
                .unwrap();
            let result_pos = events
                .iter()
                .position(|e| matches!(e, StreamEvent::ToolResult { id: i, .. } if i == id))
                .unwrap();
            assert!(call_pos < result_pos);
        }

        // One tool_complete for the round, then content chunks, then done.
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, StreamEvent::ToolComplete { .. }))
                .count(),
            1
        );
        assert!(matches!(events.last(), Some(StreamEvent::Done)));
        let streamed: String = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Content { content } => Some(content.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(streamed, "all done");
    }

    #[tokio::test]
    async fn failing_tool_outcome_does_not_abort_the_round() {
        let provider = ScriptedProvider::new(vec![
            tool_reply(vec![("broken", json!({}))]),
            ModelReply {
                text: "recovered".into(),
                tool_calls: vec![],
            },
        ]);
        let svc = service(provider, Duration::ZERO);
        let answer = svc.respond("try the broken one", &[]).await;
        assert_eq!(answer, "recovered");
    }

    #[tokio::test]
    async fn model_failure_surfaces_as_apologetic_message() {
        struct FailingProvider;

        #[async_trait]
        impl LlmProvider for FailingProvider {
            fn model_id(&self) -> &str {
                "failing"
            }
            async fn chat(&self, _: &[ChatMessage], _: &[Value]) -> Result<ModelReply> {
                anyhow::bail!("model transport down")
            }
        }

        let svc = ChatService::new(
            Arc::new(FailingProvider),
            Arc::new(EchoTools {
                latency: Duration::ZERO,
            }),
            fast_options(),
        );
        let answer = svc.respond("hello", &[]).await;
        assert!(answer.contains("I encountered an error"));
        assert!(answer.contains("model transport down"));
    }

    #[tokio::test]
    async fn model_failure_emits_terminal_error_event_in_stream() {
        struct FailingProvider;

        #[async_trait]
        impl LlmProvider for FailingProvider {
            fn model_id(&self) -> &str {
                "failing"
            }
            async fn chat(&self, _: &[ChatMessage], _: &[Value]) -> Result<ModelReply> {
                anyhow::bail!("model transport down")
            }
        }

        let svc = ChatService::new(
            Arc::new(FailingProvider),
            Arc::new(EchoTools {
                latency: Duration::ZERO,
            }),
            fast_options(),
        );
        let (tx, mut rx) = mpsc::channel(8);
        svc.respond_streaming("hello", &[], tx).await;
        let mut events = Vec::new();
        while let Ok(evt) = rx.try_recv() {
            events.push(evt);
        }
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], StreamEvent::Error { .. }));
    }

    #[tokio::test]
    async fn history_is_bounded_to_the_most_recent_turns() {
        let provider = ScriptedProvider::new(vec![ModelReply {
            text: "ok".into(),
            tool_calls: vec![],
        }]);
        let svc = service(provider, Duration::ZERO);
        let history: Vec<HistoryEntry> = (0..30)
            .map(|i| HistoryEntry {
                sender: if i % 2 == 0 { "user" } else { "bot" }.to_string(),
                text: format!("turn {}", i),
            })
            .collect();
        let transcript = svc.build_transcript("latest", &history);
        // system + bounded history + new user message
        assert_eq!(
            transcript.len(),
            1 + ChatOptions::default().history_limit + 1
        );
        match transcript.last().unwrap() {
            ChatMessage::User(text) => assert_eq!(text, "latest"),
            other => panic!("unexpected final message: {:?}", other),
        }
    }

    #[test]
    fn stream_events_serialize_with_type_tags() {
        let evt = StreamEvent::ToolResult {
            id: "c1".into(),
            tool: "query_jira_demands".into(),
            result: "[]".into(),
            is_error: false,
            content: "Result from query_jira_demands".into(),
        };
        let json = serde_json::to_value(&evt).unwrap();
        assert_eq!(json["type"], "tool_result");
        assert_eq!(json["id"], "c1");
        assert_eq!(json["is_error"], false);

        assert_eq!(
            serde_json::to_value(StreamEvent::Done).unwrap(),
            json!({"type": "done"})
        );
    }
}
