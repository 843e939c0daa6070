//! Run engine.
//!
//! [`BotOrchestrator`] drives one conversational turn end to end: resolve
//! the agent, load or create the conversation and message documents, build
//! the runtime input (fresh context or resumed snapshot plus decisions),
//! consume the runtime's event stream, and persist the outcome before the
//! terminal fragment is emitted. Callers receive the turn as a sequence of
//! [`TurnFragment`]s on an mpsc channel; the channel closing is the end of
//! the stream.

use std::sync::Arc;

use chrono::Utc;
use log::{error, warn};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::channels::ChannelKind;
use crate::shared::models::{Conversation, ConversationStatus, Message, PendingInterruption};
use crate::shared::state::AppState;

pub mod runtime;
pub mod snapshot;

use runtime::{
    ContextMessage, InterruptionDecision, ResolvedDecision, ResumeInput, RunEvent, RunInput,
};
use snapshot::RunSnapshot;

/// Prior query/response pairs included as fresh-turn context.
const CONTEXT_PAIRS: usize = 8;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub user_message: String,
    pub agent_id: Uuid,
    pub conversation_id: Option<Uuid>,
    pub message_id: Option<Uuid>,
    pub channel: ChannelKind,
    /// Provider chat id to stamp on a freshly created conversation.
    pub external_id: Option<String>,
    pub geo_location: Option<Value>,
    pub interruption_decisions: Vec<InterruptionDecision>,
}

impl TurnRequest {
    pub fn new(agent_id: Uuid, channel: ChannelKind, user_message: impl Into<String>) -> Self {
        Self {
            user_message: user_message.into(),
            agent_id,
            conversation_id: None,
            message_id: None,
            channel,
            external_id: None,
            geo_location: None,
            interruption_decisions: Vec::new(),
        }
    }
}

/// One wire fragment of a streamed turn.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnFragment {
    pub id: String,
    pub message_id: String,
    pub conversation_id: String,
    pub response_type: String,
    pub data: Value,
}

impl TurnFragment {
    fn chunk(message_id: Uuid, conversation_id: Uuid, delta: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            message_id: message_id.to_string(),
            conversation_id: conversation_id.to_string(),
            response_type: "chunk".to_string(),
            data: json!(delta),
        }
    }

    fn full(message_id: Uuid, conversation_id: Uuid, text: &str) -> Self {
        Self {
            id: message_id.to_string(),
            message_id: message_id.to_string(),
            conversation_id: conversation_id.to_string(),
            response_type: "full".to_string(),
            data: json!(text),
        }
    }

    fn interruption(message_id: Uuid, conversation_id: Uuid, partial: &str, items: &[Value]) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            message_id: message_id.to_string(),
            conversation_id: conversation_id.to_string(),
            response_type: "interruption".to_string(),
            data: json!({"text": partial, "interruptions": items}),
        }
    }

    /// Terminal marker; `id` is `end` or `awaiting_approval`.
    fn terminal(id: &str, message_id: String, conversation_id: String) -> Self {
        Self {
            id: id.to_string(),
            message_id,
            conversation_id,
            response_type: "full".to_string(),
            data: Value::Null,
        }
    }

    fn error(message_id: String, conversation_id: String, detail: String) -> Self {
        Self {
            id: "error".to_string(),
            message_id,
            conversation_id,
            response_type: "full".to_string(),
            data: json!({"error": detail}),
        }
    }
}

#[derive(Clone)]
pub struct BotOrchestrator {
    state: Arc<AppState>,
}

impl BotOrchestrator {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// Run one turn, streaming fragments to `tx`. Always terminates the
    /// stream: either `end` / `awaiting_approval`, or an error fragment
    /// followed by `end`. Dropping `tx` on return closes the stream.
    pub async fn run_turn(&self, req: TurnRequest, tx: mpsc::Sender<TurnFragment>) {
        let fallback_message = req.message_id.map(|id| id.to_string()).unwrap_or_default();
        let fallback_conversation = req
            .conversation_id
            .map(|id| id.to_string())
            .unwrap_or_default();

        if let Err(e) = self.execute_turn(req, &tx).await {
            error!("agent turn failed: {}", e);
            let _ = tx
                .send(TurnFragment::error(
                    fallback_message.clone(),
                    fallback_conversation.clone(),
                    e.to_string(),
                ))
                .await;
            let _ = tx
                .send(TurnFragment::terminal(
                    "end",
                    fallback_message,
                    fallback_conversation,
                ))
                .await;
        }
    }

    /// Run one turn and return the final response text. Used by webhook
    /// handlers that relay a single reply to the provider.
    pub async fn run_turn_collect(&self, req: TurnRequest) -> String {
        let (tx, mut rx) = mpsc::channel(32);
        let this = self.clone();
        tokio::spawn(async move {
            this.run_turn(req, tx).await;
        });

        let mut text = String::new();
        while let Some(fragment) = rx.recv().await {
            match fragment.response_type.as_str() {
                "chunk" => {
                    if let Some(delta) = fragment.data.as_str() {
                        text.push_str(delta);
                    }
                }
                "full" => {
                    if let Some(full) = fragment.data.as_str() {
                        text = full.to_string();
                    }
                }
                "interruption" => {
                    if let Some(partial) = fragment.data.get("text").and_then(|v| v.as_str()) {
                        if !partial.is_empty() {
                            text = partial.to_string();
                        }
                    }
                }
                _ => {}
            }
        }
        text
    }

    async fn execute_turn(
        &self,
        req: TurnRequest,
        tx: &mpsc::Sender<TurnFragment>,
    ) -> Result<(), BoxError> {
        let store = self.state.store.clone();

        let agent = store
            .agent(req.agent_id)
            .await?
            .ok_or("agent not found")?;

        let (conversation, message) = tokio::join!(
            async {
                match req.conversation_id {
                    Some(id) => store.conversation(id).await,
                    None => Ok(None),
                }
            },
            async {
                match req.message_id {
                    Some(id) => store.message(id).await,
                    None => Ok(None),
                }
            },
        );

        let mut conversation = match conversation? {
            Some(c) => c,
            None => {
                let mut c = Conversation::new(agent.business_id, agent.id, req.channel);
                c.external_id = req.external_id.clone();
                store.insert_conversation(&c).await?;
                c
            }
        };
        let mut message = match message? {
            Some(m) => m,
            None => {
                let m = Message::new(conversation.id, conversation.business_id, req.user_message.clone());
                store.insert_message(&m).await?;
                m
            }
        };

        if let Some(geo) = &req.geo_location {
            conversation.geo_location = Some(geo.clone());
        }
        if conversation.status == ConversationStatus::Initiated {
            conversation.status = ConversationStatus::Active;
        }
        store.update_conversation(&conversation).await?;

        let mut input = RunInput {
            system_context: format!(
                "Current time: {}. Channel: {}.",
                Utc::now().to_rfc3339(),
                conversation.channel
            ),
            context: Vec::new(),
            resume: None,
        };

        // Resume only when the caller supplied decisions and state is still
        // pending; taking the state clears both fields so a crash after this
        // point can never replay stale approvals.
        if !req.interruption_decisions.is_empty() && conversation.state.is_some() {
            if let Some((raw_state, pending)) = store.take_run_state(conversation.id).await? {
                conversation.state = None;
                conversation.pending_interruptions = Vec::new();
                match self.state.runtime.parse_state(&agent, &raw_state) {
                    Ok(snapshot) => {
                        let decisions =
                            resolve_decisions(&req.interruption_decisions, &pending);
                        input.resume = Some(ResumeInput { snapshot, decisions });
                    }
                    Err(e) => {
                        warn!(
                            "conversation {} has unparseable run state, falling back to a fresh turn: {}",
                            conversation.id, e
                        );
                    }
                }
            }
        }

        if input.resume.is_none() {
            // Fetch one extra: the current message is already stored and
            // must not consume a history slot.
            let history = store
                .recent_messages(conversation.id, CONTEXT_PAIRS + 1)
                .await?;
            let priors: Vec<&Message> =
                history.iter().filter(|m| m.id != message.id).collect();
            let skip = priors.len().saturating_sub(CONTEXT_PAIRS);
            for prior in &priors[skip..] {
                input.context.push(ContextMessage {
                    role: "user".to_string(),
                    content: prior.query.clone(),
                });
                if !prior.response.is_empty() {
                    input.context.push(ContextMessage {
                        role: "assistant".to_string(),
                        content: prior.response.clone(),
                    });
                }
            }
            input.context.push(ContextMessage {
                role: "user".to_string(),
                content: req.user_message.clone(),
            });
        }

        let mut events = self.state.runtime.start_run(&agent, input).await?;

        let mut response_text = String::new();
        let mut final_model = None;
        let mut usage = crate::shared::models::TokenUsage::default();
        let mut triggered = Vec::new();
        let mut interruption_items: Vec<Value> = Vec::new();
        let mut raw_state: Option<Value> = None;

        while let Some(event) = events.recv().await {
            match event {
                RunEvent::TextDelta(delta) => {
                    response_text.push_str(&delta);
                    let _ = tx
                        .send(TurnFragment::chunk(message.id, conversation.id, &delta))
                        .await;
                }
                RunEvent::ResponseDone { text, model } => {
                    if !text.is_empty() {
                        response_text = text;
                    }
                    final_model = Some(model);
                }
                RunEvent::ToolCall { name, .. } => triggered.push(name),
                RunEvent::ToolOutput { .. } => {}
                RunEvent::Usage(u) => usage.add(&u),
                RunEvent::Error(detail) => {
                    error!("runtime error mid-stream: {}", detail);
                    let _ = tx
                        .send(TurnFragment::error(
                            message.id.to_string(),
                            conversation.id.to_string(),
                            detail,
                        ))
                        .await;
                }
                RunEvent::Completed {
                    interruptions,
                    raw_state: state,
                } => {
                    interruption_items = interruptions;
                    raw_state = state;
                    break;
                }
            }
        }

        let interrupted = !interruption_items.is_empty();
        if interrupted {
            let snapshot = RunSnapshot::sanitize(&raw_state.unwrap_or(Value::Null));
            let serialized = snapshot.serialize();
            let pending: Vec<PendingInterruption> = interruption_items
                .iter()
                .cloned()
                .map(PendingInterruption::new)
                .collect();
            // Mirror the pair onto the local copy: the finalization write
            // below rewrites the whole document and must not clobber what
            // store_interruption just persisted.
            conversation.state = Some(serialized.clone());
            conversation.pending_interruptions = pending.clone();
            store
                .store_interruption(conversation.id, serialized, pending)
                .await?;
            conversation.status = ConversationStatus::Interrupted;
            let _ = tx
                .send(TurnFragment::interruption(
                    message.id,
                    conversation.id,
                    &response_text,
                    &interruption_items,
                ))
                .await;
        } else if conversation.status == ConversationStatus::Interrupted {
            conversation.status = ConversationStatus::Active;
        }

        // Finalize before the terminal fragment: a client that sees the
        // terminal may immediately re-read the conversation.
        message.response = if response_text.is_empty() {
            "Interrupted".to_string()
        } else {
            response_text.clone()
        };
        message.model = final_model;
        message.usage.response = usage;
        message.triggered_actions = triggered;
        store.update_message(&message).await?;

        conversation.usage.add(&usage);
        conversation.message_count += 1;
        conversation.updated_at = Utc::now();
        store.update_conversation(&conversation).await?;

        if !interrupted {
            let _ = tx
                .send(TurnFragment::full(
                    message.id,
                    conversation.id,
                    &message.response,
                ))
                .await;
        }
        let terminal = if interrupted { "awaiting_approval" } else { "end" };
        let _ = tx
            .send(TurnFragment::terminal(
                terminal,
                message.id.to_string(),
                conversation.id.to_string(),
            ))
            .await;
        Ok(())
    }
}

/// Match caller decisions to their pending tool calls by correlation id.
/// Decisions with no matching pending item are dropped with a warning.
fn resolve_decisions(
    decisions: &[InterruptionDecision],
    pending: &[PendingInterruption],
) -> Vec<ResolvedDecision> {
    let mut resolved = Vec::new();
    for decision in decisions {
        match pending
            .iter()
            .find(|p| p.correlation_id() == Some(decision.id.as_str()))
        {
            Some(item) => resolved.push(ResolvedDecision {
                correlation_id: decision.id.clone(),
                approved: decision.approved(),
                raw_item: item.raw_item.clone(),
            }),
            None => warn!("no pending interruption matches decision {}", decision.id),
        }
    }
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::HandshakeRegistry;
    use crate::config::AppConfig;
    use crate::jobs::JobQueue;
    use crate::shared::models::{Agent, TokenUsage};
    use crate::shared::notify::LogNotifier;
    use crate::store::memory::MemoryStore;
    use crate::store::Store;
    use async_trait::async_trait;
    use runtime::{AgentRuntime, RuntimeError};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    struct SeenInput {
        resumed: bool,
        approvals: Vec<(String, bool)>,
        context_len: usize,
    }

    struct ScriptedRuntime {
        scripts: Mutex<VecDeque<Vec<RunEvent>>>,
        seen: Mutex<Vec<SeenInput>>,
    }

    impl ScriptedRuntime {
        fn new(scripts: Vec<Vec<RunEvent>>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn seen(&self) -> Vec<SeenInput> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AgentRuntime for ScriptedRuntime {
        async fn start_run(
            &self,
            _agent: &Agent,
            input: RunInput,
        ) -> Result<mpsc::Receiver<RunEvent>, RuntimeError> {
            self.seen.lock().unwrap().push(SeenInput {
                resumed: input.resume.is_some(),
                approvals: input
                    .resume
                    .as_ref()
                    .map(|r| {
                        r.decisions
                            .iter()
                            .map(|d| (d.correlation_id.clone(), d.approved))
                            .collect()
                    })
                    .unwrap_or_default(),
                context_len: input.context.len(),
            });

            let script = self
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| RuntimeError::Provider("no script".to_string()))?;
            let (tx, rx) = mpsc::channel(32);
            tokio::spawn(async move {
                for event in script {
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            });
            Ok(rx)
        }

        fn parse_state(&self, _agent: &Agent, raw: &str) -> Result<RunSnapshot, RuntimeError> {
            RunSnapshot::parse(raw).map_err(RuntimeError::InvalidState)
        }
    }

    async fn build_orchestrator(
        runtime: Arc<ScriptedRuntime>,
    ) -> (BotOrchestrator, Arc<MemoryStore>, Agent) {
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(LogNotifier);
        let http = reqwest::Client::new();
        let state = Arc::new(AppState {
            config: AppConfig::from_env().unwrap(),
            store: store.clone(),
            runtime: runtime.clone(),
            handshakes: HandshakeRegistry::new(),
            http: http.clone(),
            notifier: notifier.clone(),
            jobs: JobQueue::start(store.clone(), notifier, http),
        });

        let agent = Agent {
            id: Uuid::new_v4(),
            business_id: Uuid::new_v4(),
            name: "support".to_string(),
            system_prompt: "You are a support agent.".to_string(),
            model: "gpt-test".to_string(),
            channel_ids: Vec::new(),
            tools: Vec::new(),
            collect_contact: false,
            collect_location: false,
        };
        store.upsert_agent(&agent).await.unwrap();
        (BotOrchestrator::new(state), store, agent)
    }

    async fn drain(orchestrator: &BotOrchestrator, req: TurnRequest) -> Vec<TurnFragment> {
        let (tx, mut rx) = mpsc::channel(64);
        orchestrator.run_turn(req, tx).await;
        let mut fragments = Vec::new();
        while let Some(f) = rx.recv().await {
            fragments.push(f);
        }
        fragments
    }

    #[tokio::test]
    async fn fresh_turn_streams_chunks_and_finalizes() {
        let runtime = ScriptedRuntime::new(vec![vec![
            RunEvent::TextDelta("Hel".to_string()),
            RunEvent::TextDelta("lo".to_string()),
            RunEvent::ResponseDone {
                text: "Hello".to_string(),
                model: "gpt-test".to_string(),
            },
            RunEvent::Usage(TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            }),
            RunEvent::Completed {
                interruptions: Vec::new(),
                raw_state: None,
            },
        ]]);
        let (orchestrator, store, agent) = build_orchestrator(runtime.clone()).await;

        let fragments = drain(
            &orchestrator,
            TurnRequest::new(agent.id, ChannelKind::Web, "hi"),
        )
        .await;

        let chunks: Vec<&TurnFragment> =
            fragments.iter().filter(|f| f.response_type == "chunk").collect();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].data, json!("Hel"));
        assert_eq!(fragments.last().unwrap().id, "end");

        let conversation_id: Uuid = fragments[0].conversation_id.parse().unwrap();
        let message_id: Uuid = fragments[0].message_id.parse().unwrap();
        let conversation = store.conversation(conversation_id).await.unwrap().unwrap();
        assert_eq!(conversation.status, ConversationStatus::Active);
        assert_eq!(conversation.message_count, 1);
        assert_eq!(conversation.usage.total_tokens, 15);

        let message = store.message(message_id).await.unwrap().unwrap();
        assert_eq!(message.response, "Hello");
        assert_eq!(message.model.as_deref(), Some("gpt-test"));
        assert_eq!(message.usage.response.completion_tokens, 5);

        // the fresh context carried exactly the current user message
        assert_eq!(runtime.seen()[0].context_len, 1);
    }

    #[tokio::test]
    async fn fresh_context_carries_eight_full_prior_pairs() {
        let runtime = ScriptedRuntime::new(vec![vec![
            RunEvent::ResponseDone {
                text: "ok".to_string(),
                model: "gpt-test".to_string(),
            },
            RunEvent::Completed {
                interruptions: Vec::new(),
                raw_state: None,
            },
        ]]);
        let (orchestrator, store, agent) = build_orchestrator(runtime.clone()).await;

        let conversation = Conversation::new(agent.business_id, agent.id, ChannelKind::Web);
        store.insert_conversation(&conversation).await.unwrap();
        for i in 0..9 {
            let mut prior = Message::new(
                conversation.id,
                conversation.business_id,
                format!("q{}", i),
            );
            prior.response = format!("a{}", i);
            prior.created_at = Utc::now() - chrono::Duration::seconds(60 - i);
            store.insert_message(&prior).await.unwrap();
        }

        let mut req = TurnRequest::new(agent.id, ChannelKind::Web, "latest question");
        req.conversation_id = Some(conversation.id);
        let fragments = drain(&orchestrator, req).await;

        assert_eq!(fragments.last().unwrap().id, "end");
        // 8 full prior pairs plus the current user message; the freshly
        // stored message never occupies a history slot.
        assert_eq!(runtime.seen()[0].context_len, 17);
    }

    #[tokio::test]
    async fn interruption_persists_state_and_pending_together() {
        let raw_state = json!({
            "items": [
                {"role": "user", "content": [{"type": "text", "text": "send the report"}]},
                {"role": "tool", "content": [{"type": "text", "text": "internal"}]},
            ]
        });
        let runtime = ScriptedRuntime::new(vec![vec![
            RunEvent::TextDelta("Working on it".to_string()),
            RunEvent::ToolCall {
                id: "call1".to_string(),
                name: "send_email".to_string(),
                arguments: json!({"to": "a@b.c"}),
            },
            RunEvent::Completed {
                interruptions: vec![json!({"id": "call1", "name": "send_email"})],
                raw_state: Some(raw_state),
            },
        ]]);
        let (orchestrator, store, agent) = build_orchestrator(runtime).await;

        let fragments = drain(
            &orchestrator,
            TurnRequest::new(agent.id, ChannelKind::Web, "email the report"),
        )
        .await;

        assert!(fragments.iter().any(|f| f.response_type == "interruption"));
        assert_eq!(fragments.last().unwrap().id, "awaiting_approval");

        let conversation_id: Uuid = fragments[0].conversation_id.parse().unwrap();
        let conversation = store.conversation(conversation_id).await.unwrap().unwrap();
        assert_eq!(conversation.status, ConversationStatus::Interrupted);
        // finalization ran (counters bumped) without wiping the pair
        assert_eq!(conversation.message_count, 1);
        // state and pending were written as a pair
        assert!(conversation.state.is_some());
        assert_eq!(conversation.pending_interruptions.len(), 1);
        assert_eq!(
            conversation.pending_interruptions[0].correlation_id(),
            Some("call1")
        );
        // the persisted snapshot dropped the tool-role item
        let snapshot = RunSnapshot::parse(conversation.state.as_deref().unwrap()).unwrap();
        assert_eq!(snapshot.items.len(), 1);

        let message_id: Uuid = fragments[0].message_id.parse().unwrap();
        let message = store.message(message_id).await.unwrap().unwrap();
        assert_eq!(message.response, "Working on it");
        assert_eq!(message.triggered_actions, vec!["send_email".to_string()]);
    }

    #[tokio::test]
    async fn resume_applies_decisions_and_clears_state() {
        let runtime = ScriptedRuntime::new(vec![vec![
            RunEvent::TextDelta("Sent.".to_string()),
            RunEvent::ResponseDone {
                text: "Sent.".to_string(),
                model: "gpt-test".to_string(),
            },
            RunEvent::Completed {
                interruptions: Vec::new(),
                raw_state: None,
            },
        ]]);
        let (orchestrator, store, agent) = build_orchestrator(runtime.clone()).await;

        let mut conversation =
            Conversation::new(agent.business_id, agent.id, ChannelKind::Web);
        conversation.status = ConversationStatus::Interrupted;
        store.insert_conversation(&conversation).await.unwrap();
        let snapshot = RunSnapshot::sanitize(&json!({
            "items": [{"role": "user", "content": [{"type": "text", "text": "send it"}]}]
        }));
        store
            .store_interruption(
                conversation.id,
                snapshot.serialize(),
                vec![PendingInterruption::new(
                    json!({"id": "call1", "name": "send_email"}),
                )],
            )
            .await
            .unwrap();

        let mut req = TurnRequest::new(agent.id, ChannelKind::Web, "yes go ahead");
        req.conversation_id = Some(conversation.id);
        req.interruption_decisions = vec![InterruptionDecision {
            id: "call1".to_string(),
            action: "approve".to_string(),
        }];
        let fragments = drain(&orchestrator, req).await;

        assert_eq!(fragments.last().unwrap().id, "end");
        let seen = runtime.seen();
        assert!(seen[0].resumed);
        assert_eq!(seen[0].approvals, vec![("call1".to_string(), true)]);

        let loaded = store.conversation(conversation.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ConversationStatus::Active);
        assert!(loaded.state.is_none());
        assert!(loaded.pending_interruptions.is_empty());
    }

    #[tokio::test]
    async fn corrupt_run_state_falls_back_to_fresh_turn() {
        let runtime = ScriptedRuntime::new(vec![vec![
            RunEvent::TextDelta("Starting over".to_string()),
            RunEvent::ResponseDone {
                text: "Starting over".to_string(),
                model: "gpt-test".to_string(),
            },
            RunEvent::Completed {
                interruptions: Vec::new(),
                raw_state: None,
            },
        ]]);
        let (orchestrator, store, agent) = build_orchestrator(runtime.clone()).await;

        let mut conversation =
            Conversation::new(agent.business_id, agent.id, ChannelKind::Web);
        conversation.status = ConversationStatus::Interrupted;
        store.insert_conversation(&conversation).await.unwrap();
        store
            .store_interruption(
                conversation.id,
                "not valid state".to_string(),
                vec![PendingInterruption::new(json!({"id": "call1"}))],
            )
            .await
            .unwrap();

        let mut req = TurnRequest::new(agent.id, ChannelKind::Web, "approve");
        req.conversation_id = Some(conversation.id);
        req.interruption_decisions = vec![InterruptionDecision {
            id: "call1".to_string(),
            action: "approve".to_string(),
        }];
        let fragments = drain(&orchestrator, req).await;

        assert_eq!(fragments.last().unwrap().id, "end");
        let seen = runtime.seen();
        assert!(!seen[0].resumed);
        assert!(seen[0].context_len >= 1);

        // the corrupt state was still consumed
        let loaded = store.conversation(conversation.id).await.unwrap().unwrap();
        assert!(loaded.state.is_none());
        assert!(loaded.pending_interruptions.is_empty());
    }

    #[tokio::test]
    async fn unknown_agent_yields_error_then_end() {
        let runtime = ScriptedRuntime::new(vec![]);
        let (orchestrator, _store, _agent) = build_orchestrator(runtime).await;

        let fragments = drain(
            &orchestrator,
            TurnRequest::new(Uuid::new_v4(), ChannelKind::Web, "hi"),
        )
        .await;

        assert_eq!(fragments[0].id, "error");
        assert_eq!(fragments.last().unwrap().id, "end");
    }
}
