use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::channels::ChannelKind;
use crate::jobs::{Collection, ContentItem};
use crate::shared::models::{Agent, Channel, Conversation, Message, PendingInterruption, Reaction};

use super::{Store, StoreError};

/// In-process store backed by RwLock'd maps.
#[derive(Default)]
pub struct MemoryStore {
    channels: RwLock<HashMap<Uuid, Channel>>,
    agents: RwLock<HashMap<Uuid, Agent>>,
    conversations: RwLock<HashMap<Uuid, Conversation>>,
    messages: RwLock<HashMap<Uuid, Message>>,
    collections: RwLock<HashMap<Uuid, Collection>>,
    content_items: RwLock<HashMap<Uuid, ContentItem>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_channel(&self, channel: &Channel) -> Result<(), StoreError> {
        self.channels
            .write()
            .await
            .insert(channel.id, channel.clone());
        Ok(())
    }

    async fn channel(&self, id: Uuid) -> Result<Option<Channel>, StoreError> {
        Ok(self.channels.read().await.get(&id).cloned())
    }

    async fn update_channel(&self, channel: &Channel) -> Result<(), StoreError> {
        self.channels
            .write()
            .await
            .insert(channel.id, channel.clone());
        Ok(())
    }

    async fn delete_channel(&self, id: Uuid) -> Result<(), StoreError> {
        self.channels.write().await.remove(&id);
        Ok(())
    }

    async fn channel_by_provider_key(
        &self,
        kind: ChannelKind,
        key: &str,
        value: &str,
    ) -> Result<Option<Channel>, StoreError> {
        Ok(self
            .channels
            .read()
            .await
            .values()
            .find(|c| c.kind == kind && c.config_str(key) == Some(value))
            .cloned())
    }

    async fn agent(&self, id: Uuid) -> Result<Option<Agent>, StoreError> {
        Ok(self.agents.read().await.get(&id).cloned())
    }

    async fn upsert_agent(&self, agent: &Agent) -> Result<(), StoreError> {
        self.agents.write().await.insert(agent.id, agent.clone());
        Ok(())
    }

    async fn agent_for_channel(&self, channel_id: Uuid) -> Result<Option<Agent>, StoreError> {
        Ok(self
            .agents
            .read()
            .await
            .values()
            .find(|a| a.channel_ids.contains(&channel_id))
            .cloned())
    }

    async fn detach_channel_from_agents(&self, channel_id: Uuid) -> Result<(), StoreError> {
        let mut agents = self.agents.write().await;
        for agent in agents.values_mut() {
            agent.channel_ids.retain(|id| *id != channel_id);
        }
        Ok(())
    }

    async fn conversation(&self, id: Uuid) -> Result<Option<Conversation>, StoreError> {
        Ok(self.conversations.read().await.get(&id).cloned())
    }

    async fn insert_conversation(&self, conversation: &Conversation) -> Result<(), StoreError> {
        self.conversations
            .write()
            .await
            .insert(conversation.id, conversation.clone());
        Ok(())
    }

    async fn update_conversation(&self, conversation: &Conversation) -> Result<(), StoreError> {
        self.conversations
            .write()
            .await
            .insert(conversation.id, conversation.clone());
        Ok(())
    }

    async fn conversation_by_external_id(
        &self,
        channel: ChannelKind,
        external_id: &str,
    ) -> Result<Option<Conversation>, StoreError> {
        Ok(self
            .conversations
            .read()
            .await
            .values()
            .find(|c| c.channel == channel && c.external_id.as_deref() == Some(external_id))
            .cloned())
    }

    async fn upsert_conversation_by_external_id(
        &self,
        channel: ChannelKind,
        external_id: &str,
        seed: Conversation,
    ) -> Result<Conversation, StoreError> {
        let mut conversations = self.conversations.write().await;
        if let Some(existing) = conversations
            .values()
            .find(|c| c.channel == channel && c.external_id.as_deref() == Some(external_id))
        {
            return Ok(existing.clone());
        }
        conversations.insert(seed.id, seed.clone());
        Ok(seed)
    }

    async fn set_session_value(
        &self,
        conversation_id: Uuid,
        action_id: &str,
        field_path: &str,
        value: Value,
    ) -> Result<(), StoreError> {
        let mut conversations = self.conversations.write().await;
        let conversation = conversations
            .get_mut(&conversation_id)
            .ok_or(StoreError::NotFound)?;
        conversation
            .session
            .entry(action_id.to_string())
            .or_default()
            .insert(field_path.to_string(), value);
        conversation.updated_at = chrono::Utc::now();
        Ok(())
    }

    async fn session_value(
        &self,
        conversation_id: Uuid,
        action_id: &str,
        field_path: &str,
    ) -> Result<Option<Value>, StoreError> {
        Ok(self
            .conversations
            .read()
            .await
            .get(&conversation_id)
            .and_then(|c| c.session.get(action_id))
            .and_then(|fields| fields.get(field_path))
            .cloned())
    }

    async fn store_interruption(
        &self,
        conversation_id: Uuid,
        state: String,
        pending: Vec<PendingInterruption>,
    ) -> Result<(), StoreError> {
        let mut conversations = self.conversations.write().await;
        let conversation = conversations
            .get_mut(&conversation_id)
            .ok_or(StoreError::NotFound)?;
        conversation.state = Some(state);
        conversation.pending_interruptions = pending;
        conversation.updated_at = chrono::Utc::now();
        Ok(())
    }

    async fn take_run_state(
        &self,
        conversation_id: Uuid,
    ) -> Result<Option<(String, Vec<PendingInterruption>)>, StoreError> {
        let mut conversations = self.conversations.write().await;
        let conversation = conversations
            .get_mut(&conversation_id)
            .ok_or(StoreError::NotFound)?;
        let state = match conversation.state.take() {
            Some(state) => state,
            None => return Ok(None),
        };
        let pending = std::mem::take(&mut conversation.pending_interruptions);
        conversation.updated_at = chrono::Utc::now();
        Ok(Some((state, pending)))
    }

    async fn merge_call_details(
        &self,
        conversation_id: Uuid,
        patch: Value,
    ) -> Result<(), StoreError> {
        let mut conversations = self.conversations.write().await;
        let conversation = conversations
            .get_mut(&conversation_id)
            .ok_or(StoreError::NotFound)?;
        if let (Some(base), Some(new)) = (conversation.call_details.as_object_mut(), patch.as_object())
        {
            for (k, v) in new {
                base.insert(k.clone(), v.clone());
            }
        }
        conversation.updated_at = chrono::Utc::now();
        Ok(())
    }

    async fn insert_message(&self, message: &Message) -> Result<(), StoreError> {
        self.messages
            .write()
            .await
            .insert(message.id, message.clone());
        Ok(())
    }

    async fn message(&self, id: Uuid) -> Result<Option<Message>, StoreError> {
        Ok(self.messages.read().await.get(&id).cloned())
    }

    async fn update_message(&self, message: &Message) -> Result<(), StoreError> {
        self.messages
            .write()
            .await
            .insert(message.id, message.clone());
        Ok(())
    }

    async fn recent_messages(
        &self,
        conversation_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let messages = self.messages.read().await;
        let mut history: Vec<Message> = messages
            .values()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect();
        history.sort_by_key(|m| m.created_at);
        if history.len() > limit {
            history.drain(..history.len() - limit);
        }
        Ok(history)
    }

    async fn set_reaction(
        &self,
        message_id: Uuid,
        reaction: Reaction,
    ) -> Result<bool, StoreError> {
        let mut messages = self.messages.write().await;
        match messages.get_mut(&message_id) {
            Some(message) => {
                message.reaction = reaction;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn insert_collection(&self, collection: &Collection) -> Result<(), StoreError> {
        self.collections
            .write()
            .await
            .insert(collection.id, collection.clone());
        Ok(())
    }

    async fn collection(&self, id: Uuid) -> Result<Option<Collection>, StoreError> {
        Ok(self.collections.read().await.get(&id).cloned())
    }

    async fn set_collection_status(&self, id: Uuid, status: &str) -> Result<(), StoreError> {
        let mut collections = self.collections.write().await;
        let collection = collections.get_mut(&id).ok_or(StoreError::NotFound)?;
        collection.status = status.to_string();
        Ok(())
    }

    async fn insert_content_item(&self, item: &ContentItem) -> Result<(), StoreError> {
        self.content_items
            .write()
            .await
            .insert(item.id, item.clone());
        Ok(())
    }

    async fn content_item(&self, id: Uuid) -> Result<Option<ContentItem>, StoreError> {
        Ok(self.content_items.read().await.get(&id).cloned())
    }

    async fn update_content_item(
        &self,
        id: Uuid,
        status: &str,
        report_line: String,
    ) -> Result<(), StoreError> {
        let mut items = self.content_items.write().await;
        let item = items.get_mut(&id).ok_or(StoreError::NotFound)?;
        item.status = status.to_string();
        item.report.push(report_line);
        Ok(())
    }

    async fn outstanding_items(&self, collection_id: Uuid) -> Result<usize, StoreError> {
        Ok(self
            .content_items
            .read()
            .await
            .values()
            .filter(|i| {
                i.collection_id == collection_id
                    && matches!(i.status.as_str(), "queued" | "crawling")
            })
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn conversation() -> Conversation {
        Conversation::new(Uuid::new_v4(), Uuid::new_v4(), ChannelKind::Web)
    }

    #[tokio::test]
    async fn session_writes_are_last_write_wins() {
        let store = MemoryStore::new();
        let conv = conversation();
        store.insert_conversation(&conv).await.unwrap();

        store
            .set_session_value(conv.id, "book_meeting", "attendee.email", json!("a@x.com"))
            .await
            .unwrap();
        store
            .set_session_value(conv.id, "book_meeting", "attendee.email", json!("b@x.com"))
            .await
            .unwrap();

        let value = store
            .session_value(conv.id, "book_meeting", "attendee.email")
            .await
            .unwrap();
        assert_eq!(value, Some(json!("b@x.com")));
    }

    #[tokio::test]
    async fn missing_session_paths_read_as_none() {
        let store = MemoryStore::new();
        let conv = conversation();
        store.insert_conversation(&conv).await.unwrap();

        assert!(store
            .session_value(conv.id, "no_such_action", "field")
            .await
            .unwrap()
            .is_none());

        store
            .set_session_value(conv.id, "act", "a", json!(1))
            .await
            .unwrap();
        assert!(store
            .session_value(conv.id, "act", "missing")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn interruption_state_stored_and_consumed_together() {
        let store = MemoryStore::new();
        let conv = conversation();
        store.insert_conversation(&conv).await.unwrap();

        let pending = vec![PendingInterruption::new(json!({"id": "call1"}))];
        store
            .store_interruption(conv.id, "{\"version\":1,\"items\":[]}".to_string(), pending)
            .await
            .unwrap();

        let loaded = store.conversation(conv.id).await.unwrap().unwrap();
        assert!(loaded.state.is_some());
        assert_eq!(loaded.pending_interruptions.len(), 1);

        let taken = store.take_run_state(conv.id).await.unwrap().unwrap();
        assert_eq!(taken.1.len(), 1);

        let cleared = store.conversation(conv.id).await.unwrap().unwrap();
        assert!(cleared.state.is_none());
        assert!(cleared.pending_interruptions.is_empty());

        // second take is a no-op
        assert!(store.take_run_state(conv.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn upsert_by_external_id_is_set_on_insert() {
        let store = MemoryStore::new();
        let mut seed = conversation();
        seed.channel = ChannelKind::Telegram;
        seed.external_id = Some("555".to_string());
        let first_agent = seed.agent_id;

        let first = store
            .upsert_conversation_by_external_id(ChannelKind::Telegram, "555", seed)
            .await
            .unwrap();

        let mut second_seed = conversation();
        second_seed.channel = ChannelKind::Telegram;
        second_seed.external_id = Some("555".to_string());
        let second = store
            .upsert_conversation_by_external_id(ChannelKind::Telegram, "555", second_seed)
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.agent_id, first_agent);
    }

    #[tokio::test]
    async fn call_details_merge_preserves_existing_fields() {
        let store = MemoryStore::new();
        let conv = conversation();
        store.insert_conversation(&conv).await.unwrap();

        store
            .merge_call_details(conv.id, json!({"sid": "CA1", "status": "ringing"}))
            .await
            .unwrap();
        store
            .merge_call_details(conv.id, json!({"recordingUrl": "https://rec"}))
            .await
            .unwrap();

        let loaded = store.conversation(conv.id).await.unwrap().unwrap();
        assert_eq!(loaded.call_details["sid"], "CA1");
        assert_eq!(loaded.call_details["status"], "ringing");
        assert_eq!(loaded.call_details["recordingUrl"], "https://rec");
    }

    #[tokio::test]
    async fn recent_messages_are_chronological_and_bounded() {
        let store = MemoryStore::new();
        let conv = conversation();
        store.insert_conversation(&conv).await.unwrap();

        for i in 0..10 {
            let mut m = Message::new(conv.id, conv.business_id, format!("q{}", i));
            m.created_at = chrono::Utc::now() + chrono::Duration::seconds(i);
            store.insert_message(&m).await.unwrap();
        }

        let history = store.recent_messages(conv.id, 8).await.unwrap();
        assert_eq!(history.len(), 8);
        assert_eq!(history.first().unwrap().query, "q2");
        assert_eq!(history.last().unwrap().query, "q9");
    }
}
