//! WhatsApp Business webhook ingestion.
//!
//! GET is Meta's verify-challenge handshake, checked against the verify
//! token generated for this channel during provisioning. POST walks the
//! nested `entry[].changes[].value` structure: inbound messages run an
//! agent turn and reply through the Graph API, delivery statuses are logged.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use log::{error, info, warn};
use serde_json::Value;
use uuid::Uuid;

use crate::bot::{BotOrchestrator, TurnRequest};
use crate::channels::whatsapp::WhatsAppClient;
use crate::channels::ChannelKind;
use crate::shared::models::Conversation;
use crate::shared::state::AppState;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub async fn verify(
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let mode = params.get("hub.mode").map(String::as_str);
    let token = params.get("hub.verify_token").map(String::as_str);
    let challenge = params.get("hub.challenge").cloned().unwrap_or_default();

    let channel = match channel_id.parse::<Uuid>() {
        Ok(id) => state.store.channel(id).await.ok().flatten(),
        Err(_) => None,
    };
    let expected = channel
        .as_ref()
        .and_then(|c| c.secret_str("verifyToken"));

    match (mode, token, expected) {
        (Some("subscribe"), Some(token), Some(expected)) if token == expected => {
            info!("whatsapp webhook verified for channel {}", channel_id);
            (StatusCode::OK, challenge).into_response()
        }
        _ => {
            warn!("whatsapp webhook verification rejected for {}", channel_id);
            StatusCode::FORBIDDEN.into_response()
        }
    }
}

pub async fn inbound(
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<String>,
    Json(payload): Json<Value>,
) -> StatusCode {
    if let Err(e) = process_payload(&state, &channel_id, &payload).await {
        error!(
            "whatsapp webhook processing failed for channel {}: {}",
            channel_id, e
        );
    }
    StatusCode::OK
}

async fn process_payload(
    state: &Arc<AppState>,
    channel_id: &str,
    payload: &Value,
) -> Result<(), BoxError> {
    let store = state.store.clone();
    let Ok(id) = channel_id.parse::<Uuid>() else {
        return Ok(());
    };
    let Some(channel) = store.channel(id).await? else {
        info!("whatsapp payload for unknown channel {}", channel_id);
        return Ok(());
    };
    let Some(token) = channel.secret_str("permanentAccessToken").map(String::from) else {
        error!("whatsapp channel {} has no access token", channel.id);
        return Ok(());
    };
    let Some(phone_number_id) = channel.config_str("phone_number_id").map(String::from) else {
        error!("whatsapp channel {} has no phone_number_id", channel.id);
        return Ok(());
    };
    let Some(agent) = store.agent_for_channel(channel.id).await? else {
        info!("whatsapp channel {} has no agent attached", channel.id);
        return Ok(());
    };

    let client = match channel.config_str("graphApiBase") {
        Some(base) => WhatsAppClient::with_base_url(state.http.clone(), base),
        None => WhatsAppClient::new(state.http.clone()),
    };

    let empty = Vec::new();
    for entry in payload["entry"].as_array().unwrap_or(&empty) {
        for change in entry["changes"].as_array().unwrap_or(&empty) {
            let value = &change["value"];

            for status in value["statuses"].as_array().unwrap_or(&empty) {
                info!(
                    "whatsapp delivery status {} for message {}",
                    status["status"].as_str().unwrap_or("?"),
                    status["id"].as_str().unwrap_or("?"),
                );
            }

            for message in value["messages"].as_array().unwrap_or(&empty) {
                let Some(from) = message["from"].as_str() else {
                    continue;
                };
                let Some(text) = extract_text(message) else {
                    continue;
                };
                let name = contact_name(value, from);

                let mut seed =
                    Conversation::new(channel.business_id, agent.id, ChannelKind::WhatsApp);
                seed.id = Uuid::new_v5(
                    &Uuid::NAMESPACE_OID,
                    format!("whatsapp:{}", from).as_bytes(),
                );
                seed.channel_id = Some(channel.id);
                seed.external_id = Some(from.to_string());
                seed.contact_name = name.clone();
                seed.contact_phone = Some(from.to_string());
                let conversation = store
                    .upsert_conversation_by_external_id(ChannelKind::WhatsApp, from, seed)
                    .await?;

                let mut req = TurnRequest::new(agent.id, ChannelKind::WhatsApp, text);
                req.conversation_id = Some(conversation.id);
                req.external_id = Some(from.to_string());
                let reply = BotOrchestrator::new(state.clone()).run_turn_collect(req).await;
                if !reply.is_empty() {
                    client.send_text(&phone_number_id, &token, from, &reply).await?;
                }
            }
        }
    }
    Ok(())
}

/// Pull a text representation out of a message regardless of its media type.
fn extract_text(message: &Value) -> Option<String> {
    match message["type"].as_str()? {
        "text" => message["text"]["body"].as_str().map(String::from),
        "image" => Some(
            message["image"]["caption"]
                .as_str()
                .map(String::from)
                .unwrap_or_else(|| "[image]".to_string()),
        ),
        "audio" => Some("[audio]".to_string()),
        "document" => Some(
            message["document"]["filename"]
                .as_str()
                .map(|f| format!("[document: {}]", f))
                .unwrap_or_else(|| "[document]".to_string()),
        ),
        other => {
            info!("ignoring unsupported whatsapp message type {}", other);
            None
        }
    }
}

/// Resolve the display name from the parallel `contacts` array.
fn contact_name(value: &Value, wa_id: &str) -> Option<String> {
    value["contacts"]
        .as_array()?
        .iter()
        .find(|c| c["wa_id"].as_str() == Some(wa_id))
        .and_then(|c| c["profile"]["name"].as_str())
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::runtime::OpenAiRuntime;
    use crate::channels::HandshakeRegistry;
    use crate::config::AppConfig;
    use crate::jobs::JobQueue;
    use crate::shared::models::Channel;
    use crate::shared::notify::LogNotifier;
    use crate::store::memory::MemoryStore;
    use crate::store::Store;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::json;
    use tower::ServiceExt;

    fn build_state(store: Arc<MemoryStore>) -> Arc<AppState> {
        let config = AppConfig::from_env().unwrap();
        let notifier = Arc::new(LogNotifier);
        let http = reqwest::Client::new();
        Arc::new(AppState {
            runtime: Arc::new(OpenAiRuntime::new(http.clone(), &config.llm)),
            config,
            store: store.clone(),
            handshakes: HandshakeRegistry::new(),
            http: http.clone(),
            notifier: notifier.clone(),
            jobs: JobQueue::start(store, notifier, http),
        })
    }

    async fn seed_channel(store: &Arc<MemoryStore>) -> Channel {
        let mut channel = Channel::new(
            Uuid::new_v4(),
            "wa".to_string(),
            ChannelKind::WhatsApp,
            json!({"phone_number_id": "111"}),
        );
        channel.set_secret("verifyToken", json!("expected-token"));
        channel.set_secret("permanentAccessToken", json!("tok"));
        store.insert_channel(&channel).await.unwrap();
        channel
    }

    #[tokio::test]
    async fn verify_echoes_challenge_on_matching_token() {
        let store = Arc::new(MemoryStore::new());
        let channel = seed_channel(&store).await;
        let app = crate::webhooks::configure().with_state(build_state(store));

        let uri = format!(
            "/webhook/whatsapp/{}?hub.mode=subscribe&hub.verify_token=expected-token&hub.challenge=12345",
            channel.id
        );
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"12345");
    }

    #[tokio::test]
    async fn verify_rejects_wrong_token() {
        let store = Arc::new(MemoryStore::new());
        let channel = seed_channel(&store).await;
        let app = crate::webhooks::configure().with_state(build_state(store));

        let uri = format!(
            "/webhook/whatsapp/{}?hub.mode=subscribe&hub.verify_token=wrong&hub.challenge=12345",
            channel.id
        );
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn inbound_always_acknowledges() {
        let store = Arc::new(MemoryStore::new());
        let app = crate::webhooks::configure().with_state(build_state(store));
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/webhook/whatsapp/{}", Uuid::new_v4()))
                    .header("content-type", "application/json")
                    .body(Body::from(json!({"object": "whatsapp_business_account"}).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn extract_text_handles_media_types() {
        assert_eq!(
            extract_text(&json!({"type": "text", "text": {"body": "hello"}})).as_deref(),
            Some("hello")
        );
        assert_eq!(
            extract_text(&json!({"type": "image", "image": {}})).as_deref(),
            Some("[image]")
        );
        assert_eq!(
            extract_text(&json!({"type": "document", "document": {"filename": "a.pdf"}}))
                .as_deref(),
            Some("[document: a.pdf]")
        );
        assert!(extract_text(&json!({"type": "sticker"})).is_none());
    }

    #[test]
    fn contact_name_matches_wa_id() {
        let value = json!({"contacts": [
            {"wa_id": "551199", "profile": {"name": "Ana"}},
            {"wa_id": "551188", "profile": {"name": "Bruno"}},
        ]});
        assert_eq!(contact_name(&value, "551188").as_deref(), Some("Bruno"));
        assert!(contact_name(&value, "551177").is_none());
    }
}
