//! Instagram messaging webhook ingestion.
//!
//! The subscription is app-scoped, so the verify token comes from app
//! config rather than a channel record. Every POST must carry an
//! `x-hub-signature-256` header matching the HMAC-SHA256 of the raw body
//! under the app secret; a mismatch rejects the request before any parsing.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use hmac::{Hmac, Mac};
use log::{error, info, warn};
use serde_json::Value;
use sha2::Sha256;
use uuid::Uuid;

use crate::bot::{BotOrchestrator, TurnRequest};
use crate::channels::instagram::InstagramClient;
use crate::channels::ChannelKind;
use crate::shared::models::Conversation;
use crate::shared::state::AppState;

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type HmacSha256 = Hmac<Sha256>;

pub async fn verify(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let mode = params.get("hub.mode").map(String::as_str);
    let token = params.get("hub.verify_token").map(String::as_str);
    let challenge = params.get("hub.challenge").cloned().unwrap_or_default();

    if mode == Some("subscribe") && token == Some(state.config.meta.verify_token.as_str()) {
        info!("instagram webhook verified");
        (StatusCode::OK, challenge).into_response()
    } else {
        warn!("instagram webhook verification rejected");
        StatusCode::FORBIDDEN.into_response()
    }
}

pub async fn inbound(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !signature_matches(&state.config.meta.app_secret, &body, signature) {
        warn!("instagram webhook rejected: signature mismatch");
        return StatusCode::FORBIDDEN.into_response();
    }

    if let Err(e) = process_payload(&state, &body).await {
        error!("instagram webhook processing failed: {}", e);
    }
    (StatusCode::OK, "EVENT_RECEIVED").into_response()
}

/// Check `x-hub-signature-256: sha256=<hex>` against the raw request body.
/// Comparison runs in constant time on the MAC bytes.
pub fn signature_matches(app_secret: &str, body: &[u8], header: &str) -> bool {
    let Some(received) = header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(received) = hex::decode(received) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(app_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&received).is_ok()
}

async fn process_payload(state: &Arc<AppState>, body: &[u8]) -> Result<(), BoxError> {
    let payload: Value = serde_json::from_slice(body)?;
    if payload["object"].as_str() != Some("instagram") {
        return Ok(());
    }
    let store = state.store.clone();

    let empty = Vec::new();
    for entry in payload["entry"].as_array().unwrap_or(&empty) {
        let Some(ig_user_id) = entry["id"].as_str() else {
            continue;
        };
        let Some(channel) = store
            .channel_by_provider_key(ChannelKind::Instagram, "userId", ig_user_id)
            .await?
        else {
            info!("instagram event for unknown account {}", ig_user_id);
            continue;
        };
        let Some(token) = channel.secret_str("accessToken").map(String::from) else {
            error!("instagram channel {} has no access token", channel.id);
            continue;
        };
        let Some(agent) = store.agent_for_channel(channel.id).await? else {
            info!("instagram channel {} has no agent attached", channel.id);
            continue;
        };

        let client = match channel.config_str("graphApiBase") {
            Some(base) => InstagramClient::with_base_urls(
                state.http.clone(),
                base.to_string(),
                base.to_string(),
            ),
            None => InstagramClient::new(state.http.clone()),
        };

        for event in entry["messaging"].as_array().unwrap_or(&empty) {
            // echoes are our own outbound messages reflected back
            if event["message"]["is_echo"].as_bool().unwrap_or(false) {
                continue;
            }
            let Some(sender) = event["sender"]["id"].as_str() else {
                continue;
            };
            let Some(text) = event["message"]["text"].as_str() else {
                continue;
            };

            let mut seed =
                Conversation::new(channel.business_id, agent.id, ChannelKind::Instagram);
            seed.id = Uuid::new_v5(
                &Uuid::NAMESPACE_OID,
                format!("instagram:{}", sender).as_bytes(),
            );
            seed.channel_id = Some(channel.id);
            seed.external_id = Some(sender.to_string());
            let conversation = store
                .upsert_conversation_by_external_id(ChannelKind::Instagram, sender, seed)
                .await?;

            let mut req = TurnRequest::new(agent.id, ChannelKind::Instagram, text);
            req.conversation_id = Some(conversation.id);
            req.external_id = Some(sender.to_string());
            let reply = BotOrchestrator::new(state.clone()).run_turn_collect(req).await;
            if !reply.is_empty() {
                client.send_message(&token, ig_user_id, sender, &reply).await?;
            }
        }
    }
    Ok(())
}
