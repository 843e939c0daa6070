//! Document-store port.
//!
//! Persistence lives in an external document store; this trait is the
//! crate's view of it. [`memory::MemoryStore`] is the in-process
//! implementation used for tests and single-node deployments.

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::channels::ChannelKind;
use crate::jobs::{Collection, ContentItem};
use crate::shared::models::{Agent, Channel, Conversation, Message, PendingInterruption, Reaction};

pub mod memory;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("store backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait Store: Send + Sync {
    // --- channels ---
    async fn insert_channel(&self, channel: &Channel) -> Result<(), StoreError>;
    async fn channel(&self, id: Uuid) -> Result<Option<Channel>, StoreError>;
    async fn update_channel(&self, channel: &Channel) -> Result<(), StoreError>;
    async fn delete_channel(&self, id: Uuid) -> Result<(), StoreError>;
    /// Look a channel up by a provider-scoped key in its public config
    /// (telegram `botId`, whatsapp `phone_number_id`, instagram `userId`).
    async fn channel_by_provider_key(
        &self,
        kind: ChannelKind,
        key: &str,
        value: &str,
    ) -> Result<Option<Channel>, StoreError>;

    // --- agents ---
    async fn agent(&self, id: Uuid) -> Result<Option<Agent>, StoreError>;
    async fn upsert_agent(&self, agent: &Agent) -> Result<(), StoreError>;
    async fn agent_for_channel(&self, channel_id: Uuid) -> Result<Option<Agent>, StoreError>;
    /// Pull a deleted channel's reference out of every agent.
    async fn detach_channel_from_agents(&self, channel_id: Uuid) -> Result<(), StoreError>;

    // --- conversations ---
    async fn conversation(&self, id: Uuid) -> Result<Option<Conversation>, StoreError>;
    async fn insert_conversation(&self, conversation: &Conversation) -> Result<(), StoreError>;
    async fn update_conversation(&self, conversation: &Conversation) -> Result<(), StoreError>;
    async fn conversation_by_external_id(
        &self,
        channel: ChannelKind,
        external_id: &str,
    ) -> Result<Option<Conversation>, StoreError>;
    /// Set-on-insert upsert keyed by the provider chat id: the seed document
    /// is written only if no conversation exists for that external id;
    /// subsequent calls return the stored document untouched.
    async fn upsert_conversation_by_external_id(
        &self,
        channel: ChannelKind,
        external_id: &str,
        seed: Conversation,
    ) -> Result<Conversation, StoreError>;

    /// Last-write-wins session write; creates intermediate maps as needed.
    async fn set_session_value(
        &self,
        conversation_id: Uuid,
        action_id: &str,
        field_path: &str,
        value: Value,
    ) -> Result<(), StoreError>;
    /// Missing actionId or fieldPath reads as `None`, never an error.
    async fn session_value(
        &self,
        conversation_id: Uuid,
        action_id: &str,
        field_path: &str,
    ) -> Result<Option<Value>, StoreError>;

    /// Persist resumable state and the pending tool calls as one write.
    async fn store_interruption(
        &self,
        conversation_id: Uuid,
        state: String,
        pending: Vec<PendingInterruption>,
    ) -> Result<(), StoreError>;
    /// Consume resumable state and pending interruptions atomically; both
    /// are cleared on the document before this returns.
    async fn take_run_state(
        &self,
        conversation_id: Uuid,
    ) -> Result<Option<(String, Vec<PendingInterruption>)>, StoreError>;

    /// Shallow-merge a patch into the conversation's call details without
    /// overwriting fields absent from the patch.
    async fn merge_call_details(
        &self,
        conversation_id: Uuid,
        patch: Value,
    ) -> Result<(), StoreError>;

    // --- messages ---
    async fn insert_message(&self, message: &Message) -> Result<(), StoreError>;
    async fn message(&self, id: Uuid) -> Result<Option<Message>, StoreError>;
    async fn update_message(&self, message: &Message) -> Result<(), StoreError>;
    /// Last `limit` messages of a conversation in chronological order.
    async fn recent_messages(
        &self,
        conversation_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError>;
    /// Returns false if the message does not exist.
    async fn set_reaction(&self, message_id: Uuid, reaction: Reaction)
        -> Result<bool, StoreError>;

    // --- knowledge collections / crawl jobs ---
    async fn insert_collection(&self, collection: &Collection) -> Result<(), StoreError>;
    async fn collection(&self, id: Uuid) -> Result<Option<Collection>, StoreError>;
    async fn set_collection_status(&self, id: Uuid, status: &str) -> Result<(), StoreError>;
    async fn insert_content_item(&self, item: &ContentItem) -> Result<(), StoreError>;
    async fn content_item(&self, id: Uuid) -> Result<Option<ContentItem>, StoreError>;
    /// Set the item status and append one line to its report.
    async fn update_content_item(
        &self,
        id: Uuid,
        status: &str,
        report_line: String,
    ) -> Result<(), StoreError>;
    /// Items of a collection still queued or in flight.
    async fn outstanding_items(&self, collection_id: Uuid) -> Result<usize, StoreError>;
}
