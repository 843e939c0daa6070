use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

use crate::channels::ChannelKind;

/// One configured messaging endpoint for a business.
///
/// `secrets` is marked skip-serializing: a channel serialized into any API
/// response never carries provider credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub id: Uuid,
    pub business_id: Uuid,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ChannelKind,
    pub config: Value,
    #[serde(skip_serializing, default)]
    pub secrets: Value,
    pub status: String,
    pub webhook_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Channel {
    pub fn new(business_id: Uuid, name: String, kind: ChannelKind, config: Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            business_id,
            name,
            kind,
            config,
            secrets: Value::Object(Default::default()),
            status: "initiated".to_string(),
            webhook_url: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn set_secret(&mut self, key: &str, value: Value) {
        if let Some(map) = self.secrets.as_object_mut() {
            map.insert(key.to_string(), value);
        }
    }

    pub fn secret_str(&self, key: &str) -> Option<&str> {
        self.secrets.get(key).and_then(|v| v.as_str())
    }

    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(|v| v.as_str())
    }

    pub fn set_config(&mut self, key: &str, value: Value) {
        if let Some(map) = self.config.as_object_mut() {
            map.insert(key.to_string(), value);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Initiated,
    Active,
    Interrupted,
    Inactive,
    Disconnected,
}

/// A tool call awaiting human approval. `raw_item` is the runtime's own
/// request object and carries the correlation id used to match decisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingInterruption {
    pub raw_item: Value,
    pub requested_at: DateTime<Utc>,
    pub status: String,
}

impl PendingInterruption {
    pub fn new(raw_item: Value) -> Self {
        Self {
            raw_item,
            requested_at: Utc::now(),
            status: "pending".to_string(),
        }
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.raw_item.get("id").and_then(|v| v.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: &TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// Per-stage token accounting for one message.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageBreakdown {
    pub analysis: TokenUsage,
    pub embedding: TokenUsage,
    pub response: TokenUsage,
}

/// One ongoing exchange between an end user and an agent over one channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: Uuid,
    pub business_id: Uuid,
    pub agent_id: Uuid,
    pub channel: ChannelKind,
    pub channel_id: Option<Uuid>,
    /// Per-provider external chat identifier (telegram chat id, wa id,
    /// call SID, ...).
    pub external_id: Option<String>,
    pub contact_name: Option<String>,
    pub contact_phone: Option<String>,
    pub geo_location: Option<Value>,
    /// Two-level scratch space: actionId -> field path -> value.
    pub session: HashMap<String, HashMap<String, Value>>,
    /// Serialized resumable run state, present only while interruptions are
    /// pending.
    pub state: Option<String>,
    pub status: ConversationStatus,
    pub pending_interruptions: Vec<PendingInterruption>,
    pub call_details: Value,
    pub extracted_data: Value,
    pub usage: TokenUsage,
    pub message_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(business_id: Uuid, agent_id: Uuid, channel: ChannelKind) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            business_id,
            agent_id,
            channel,
            channel_id: None,
            external_id: None,
            contact_name: None,
            contact_phone: None,
            geo_location: None,
            session: HashMap::new(),
            state: None,
            status: ConversationStatus::Initiated,
            pending_interruptions: Vec::new(),
            call_details: Value::Object(Default::default()),
            extracted_data: Value::Object(Default::default()),
            usage: TokenUsage::default(),
            message_count: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reaction {
    Neutral,
    Like,
    Dislike,
}

impl std::str::FromStr for Reaction {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "neutral" => Ok(Self::Neutral),
            "like" => Ok(Self::Like),
            "dislike" => Ok(Self::Dislike),
            _ => Err(()),
        }
    }
}

/// One user-query/agent-response pair. `response` stays empty until the run
/// completes, interrupts or errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub business_id: Uuid,
    pub query: String,
    pub response: String,
    pub model: Option<String>,
    pub reaction: Reaction,
    pub usage: UsageBreakdown,
    pub triggered_actions: Vec<String>,
    pub context_sources: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(conversation_id: Uuid, business_id: Uuid, query: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id,
            business_id,
            query,
            response: String::new(),
            model: None,
            reaction: Reaction::Neutral,
            usage: UsageBreakdown::default(),
            triggered_actions: Vec::new(),
            context_sources: Vec::new(),
            created_at: Utc::now(),
        }
    }
}

/// Agent configuration bundle, consumed read-only by the run engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: Uuid,
    pub business_id: Uuid,
    pub name: String,
    pub system_prompt: String,
    pub model: String,
    pub channel_ids: Vec<Uuid>,
    pub tools: Vec<Value>,
    #[serde(default)]
    pub collect_contact: bool,
    #[serde(default)]
    pub collect_location: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_serialization_strips_secrets() {
        let mut channel = Channel::new(
            Uuid::new_v4(),
            "support bot".to_string(),
            ChannelKind::Telegram,
            serde_json::json!({"botUsername": "support_bot"}),
        );
        channel.set_secret("botToken", serde_json::json!("123:abc"));

        let rendered = serde_json::to_value(&channel).unwrap();
        assert!(rendered.get("secrets").is_none());
        assert!(rendered.to_string().find("123:abc").is_none());
        assert_eq!(rendered["type"], "telegram");
    }

    #[test]
    fn reaction_rejects_unknown_values() {
        assert!("superlike".parse::<Reaction>().is_err());
        assert_eq!("like".parse::<Reaction>().unwrap(), Reaction::Like);
    }

    #[test]
    fn pending_interruption_exposes_correlation_id() {
        let pending =
            PendingInterruption::new(serde_json::json!({"id": "call1", "name": "send_email"}));
        assert_eq!(pending.correlation_id(), Some("call1"));
        assert_eq!(pending.status, "pending");
    }
}
