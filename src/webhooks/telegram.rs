//! Telegram update ingestion.
//!
//! The webhook path is keyed by bot id, so one server hosts any number of
//! bots. A Conversation is upserted per chat id with set-on-insert
//! semantics; contact and location shares are persisted, and when the agent
//! still needs either, the reply is a native quick-reply keyboard instead
//! of an agent turn.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use log::{error, info};
use serde_json::Value;
use uuid::Uuid;

use crate::bot::{BotOrchestrator, TurnRequest};
use crate::channels::telegram::{contact_keyboard, location_keyboard, TelegramClient};
use crate::channels::ChannelKind;
use crate::shared::models::Conversation;
use crate::shared::state::AppState;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub async fn inbound(
    State(state): State<Arc<AppState>>,
    Path(bot_id): Path<String>,
    Json(update): Json<Value>,
) -> StatusCode {
    if let Err(e) = process_update(&state, &bot_id, &update).await {
        error!("telegram webhook processing failed for bot {}: {}", bot_id, e);
    }
    StatusCode::OK
}

async fn process_update(
    state: &Arc<AppState>,
    bot_id: &str,
    update: &Value,
) -> Result<(), BoxError> {
    let store = state.store.clone();

    let Some(channel) = store
        .channel_by_provider_key(ChannelKind::Telegram, "botId", bot_id)
        .await?
    else {
        info!("telegram update for unknown bot {}", bot_id);
        return Ok(());
    };
    let Some(token) = channel.secret_str("botToken").map(String::from) else {
        error!("telegram channel {} has no bot token", channel.id);
        return Ok(());
    };
    let Some(agent) = store.agent_for_channel(channel.id).await? else {
        info!("telegram channel {} has no agent attached", channel.id);
        return Ok(());
    };

    let message = &update["message"];
    let Some(chat_id) = message["chat"]["id"].as_i64() else {
        return Ok(());
    };
    let external = chat_id.to_string();

    let mut seed = Conversation::new(channel.business_id, agent.id, ChannelKind::Telegram);
    // Deterministic id: concurrent first messages from the same chat seed
    // the same document.
    seed.id = Uuid::new_v5(
        &Uuid::NAMESPACE_OID,
        format!("telegram:{}", external).as_bytes(),
    );
    seed.channel_id = Some(channel.id);
    seed.external_id = Some(external.clone());
    let mut conversation = store
        .upsert_conversation_by_external_id(ChannelKind::Telegram, &external, seed)
        .await?;

    let mut dirty = false;
    if let Some(contact) = message.get("contact") {
        conversation.contact_phone = contact
            .get("phone_number")
            .and_then(|v| v.as_str())
            .map(String::from);
        conversation.contact_name = contact
            .get("first_name")
            .and_then(|v| v.as_str())
            .map(String::from);
        dirty = true;
    }
    if let Some(location) = message.get("location") {
        conversation.geo_location = Some(location.clone());
        dirty = true;
    }
    if dirty {
        store.update_conversation(&conversation).await?;
    }

    // Supports self-hosted Bot API servers via a per-channel override.
    let client = match channel.config_str("apiBase") {
        Some(base) => TelegramClient::with_base_url(state.http.clone(), base),
        None => TelegramClient::new(state.http.clone()),
    };

    if agent.collect_contact && conversation.contact_phone.is_none() {
        client
            .send_message(
                &token,
                &external,
                "Please share your contact so we can assist you.",
                Some(contact_keyboard()),
            )
            .await?;
        return Ok(());
    }
    if agent.collect_location && conversation.geo_location.is_none() {
        client
            .send_message(
                &token,
                &external,
                "Please share your location to continue.",
                Some(location_keyboard()),
            )
            .await?;
        return Ok(());
    }

    let Some(text) = message.get("text").and_then(|v| v.as_str()) else {
        return Ok(());
    };

    let mut req = TurnRequest::new(agent.id, ChannelKind::Telegram, text);
    req.conversation_id = Some(conversation.id);
    req.external_id = Some(external.clone());
    let reply = BotOrchestrator::new(state.clone()).run_turn_collect(req).await;
    if !reply.is_empty() {
        client.send_message(&token, &external, &reply, None).await?;
    }
    Ok(())
}
