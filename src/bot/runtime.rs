//! Agent runtime port.
//!
//! The LLM-backed agent capability is an external collaborator behind
//! [`AgentRuntime`]: the orchestrator hands it a context (or a resumed
//! snapshot plus approval decisions) and consumes a stream of normalized
//! [`RunEvent`]s until the explicit `Completed` signal.

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::config::LlmConfig;
use crate::shared::models::{Agent, TokenUsage};

use super::snapshot::RunSnapshot;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("runtime provider error: {0}")]
    Provider(String),
    #[error("invalid run state: {0}")]
    InvalidState(String),
}

#[derive(Debug, Clone)]
pub struct ContextMessage {
    pub role: String,
    pub content: String,
}

/// Caller decision on one pending tool call.
#[derive(Debug, Clone, Deserialize)]
pub struct InterruptionDecision {
    pub id: String,
    pub action: String,
}

impl InterruptionDecision {
    pub fn approved(&self) -> bool {
        self.action == "approve"
    }
}

/// A decision already matched to its pending interruption.
#[derive(Debug, Clone)]
pub struct ResolvedDecision {
    pub correlation_id: String,
    pub approved: bool,
    pub raw_item: Value,
}

pub struct ResumeInput {
    pub snapshot: RunSnapshot,
    pub decisions: Vec<ResolvedDecision>,
}

pub struct RunInput {
    /// System-level context string: current timestamp, channel name.
    pub system_context: String,
    /// Fresh-turn context; ignored when `resume` is set.
    pub context: Vec<ContextMessage>,
    pub resume: Option<ResumeInput>,
}

#[derive(Debug)]
pub enum RunEvent {
    TextDelta(String),
    ResponseDone { text: String, model: String },
    ToolCall { id: String, name: String, arguments: Value },
    ToolOutput { id: String, output: Value },
    Usage(TokenUsage),
    Error(String),
    /// Explicit stream-complete signal. Non-empty `interruptions` means the
    /// run stopped for human approval; `raw_state` is the runtime's
    /// resumable state to sanitize and persist.
    Completed {
        interruptions: Vec<Value>,
        raw_state: Option<Value>,
    },
}

#[async_trait]
pub trait AgentRuntime: Send + Sync {
    /// Start one streaming run; events arrive on the returned receiver and
    /// end with exactly one `Completed`.
    async fn start_run(
        &self,
        agent: &Agent,
        input: RunInput,
    ) -> Result<mpsc::Receiver<RunEvent>, RuntimeError>;

    /// Deserialize persisted resumable state against the agent's tool
    /// definitions.
    fn parse_state(&self, agent: &Agent, raw: &str) -> Result<RunSnapshot, RuntimeError>;
}

/// OpenAI-compatible chat-completions runtime. Streams text deltas; plain
/// chat completions never interrupt, so `Completed` always comes back empty.
pub struct OpenAiRuntime {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAiRuntime {
    pub fn new(client: reqwest::Client, config: &LlmConfig) -> Self {
        Self {
            client,
            api_key: config.api_key.clone(),
            base_url: config.base_url.clone(),
            model: config.model.clone(),
        }
    }

    fn build_messages(&self, agent: &Agent, input: &RunInput) -> Vec<Value> {
        let mut messages = Vec::new();
        messages.push(serde_json::json!({
            "role": "system",
            "content": format!("{}\n\n{}", agent.system_prompt, input.system_context),
        }));
        if let Some(resume) = &input.resume {
            for item in &resume.snapshot.items {
                let text: String = item
                    .content
                    .iter()
                    .filter_map(|p| match p {
                        super::snapshot::ContentPart::Text { text } => Some(text.as_str()),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                messages.push(serde_json::json!({"role": item.role, "content": text}));
            }
            for decision in &resume.decisions {
                let verdict = if decision.approved { "approved" } else { "rejected" };
                messages.push(serde_json::json!({
                    "role": "system",
                    "content": format!("Tool call {} was {} by the user.", decision.correlation_id, verdict),
                }));
            }
        } else {
            for message in &input.context {
                messages.push(serde_json::json!({
                    "role": message.role,
                    "content": message.content,
                }));
            }
        }
        messages
    }
}

#[async_trait]
impl AgentRuntime for OpenAiRuntime {
    async fn start_run(
        &self,
        agent: &Agent,
        input: RunInput,
    ) -> Result<mpsc::Receiver<RunEvent>, RuntimeError> {
        let messages = self.build_messages(agent, &input);
        let model = if agent.model.is_empty() {
            self.model.clone()
        } else {
            agent.model.clone()
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&serde_json::json!({
                "model": model,
                "messages": messages,
                "stream": true,
                "stream_options": {"include_usage": true},
            }))
            .send()
            .await
            .map_err(|e| RuntimeError::Provider(e.to_string()))?;

        if !response.status().is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(RuntimeError::Provider(detail));
        }

        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut full_text = String::new();
            let mut carry = String::new();

            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tx.send(RunEvent::Error(e.to_string())).await;
                        break;
                    }
                };
                carry.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(pos) = carry.find('\n') {
                    let line = carry[..pos].trim().to_string();
                    carry.drain(..=pos);
                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    if data == "[DONE]" {
                        continue;
                    }
                    let Ok(parsed) = serde_json::from_str::<Value>(data) else {
                        continue;
                    };
                    if let Some(content) = parsed["choices"][0]["delta"]["content"].as_str() {
                        full_text.push_str(content);
                        if tx.send(RunEvent::TextDelta(content.to_string())).await.is_err() {
                            return;
                        }
                    }
                    if let Some(usage) = parsed.get("usage").filter(|u| !u.is_null()) {
                        let usage = TokenUsage {
                            prompt_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0),
                            completion_tokens: usage["completion_tokens"].as_u64().unwrap_or(0),
                            total_tokens: usage["total_tokens"].as_u64().unwrap_or(0),
                        };
                        if tx.send(RunEvent::Usage(usage)).await.is_err() {
                            return;
                        }
                    }
                }
            }

            let _ = tx
                .send(RunEvent::ResponseDone {
                    text: full_text,
                    model,
                })
                .await;
            let _ = tx
                .send(RunEvent::Completed {
                    interruptions: Vec::new(),
                    raw_state: None,
                })
                .await;
        });

        Ok(rx)
    }

    fn parse_state(&self, _agent: &Agent, raw: &str) -> Result<RunSnapshot, RuntimeError> {
        RunSnapshot::parse(raw).map_err(RuntimeError::InvalidState)
    }
}
