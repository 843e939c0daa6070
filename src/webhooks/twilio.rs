//! Twilio voice/SMS callbacks.
//!
//! Every request is authenticated with Twilio's request-signature scheme
//! before any handler logic: HMAC-SHA1 over the externally visible URL plus
//! the form parameters sorted by key, base64-encoded, compared against the
//! `x-twilio-signature` header. The external URL is rebuilt from
//! reverse-proxy forwarding headers when present.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{OriginalUri, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Form;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use log::{error, info, warn};
use serde_json::{json, Map, Value};
use sha1::Sha1;
use uuid::Uuid;

use crate::channels::ChannelKind;
use crate::shared::models::{Conversation, ConversationStatus};
use crate::shared::state::AppState;

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type HmacSha1 = Hmac<Sha1>;

/// URL plus form parameters concatenated in sorted key order, the string
/// Twilio signs.
fn signed_payload(url: &str, params: &HashMap<String, String>) -> String {
    let mut data = url.to_string();
    let mut keys: Vec<&String> = params.keys().collect();
    keys.sort();
    for key in keys {
        data.push_str(key);
        data.push_str(&params[key]);
    }
    data
}

/// Compute the expected `x-twilio-signature` value for a request.
pub(crate) fn compute_signature(
    auth_token: &str,
    url: &str,
    params: &HashMap<String, String>,
) -> String {
    let Ok(mut mac) = HmacSha1::new_from_slice(auth_token.as_bytes()) else {
        return String::new();
    };
    mac.update(signed_payload(url, params).as_bytes());
    BASE64.encode(mac.finalize().into_bytes())
}

/// Constant-time check on the decoded MAC bytes.
pub fn validate_signature(
    auth_token: &str,
    signature: &str,
    url: &str,
    params: &HashMap<String, String>,
) -> bool {
    if auth_token.is_empty() {
        return false;
    }
    let Ok(received) = BASE64.decode(signature) else {
        return false;
    };
    let Ok(mut mac) = HmacSha1::new_from_slice(auth_token.as_bytes()) else {
        return false;
    };
    mac.update(signed_payload(url, params).as_bytes());
    mac.verify_slice(&received).is_ok()
}

/// Externally visible request URL, honoring reverse-proxy headers.
fn external_url(headers: &HeaderMap, uri: &axum::http::Uri) -> String {
    let proto = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http");
    let host = headers
        .get("x-forwarded-host")
        .or_else(|| headers.get("host"))
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    let path = uri
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/");
    format!("{}://{}{}", proto, host, path)
}

fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
    uri: &axum::http::Uri,
    params: &HashMap<String, String>,
) -> bool {
    let signature = headers
        .get("x-twilio-signature")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let url = external_url(headers, uri);
    let valid = validate_signature(&state.config.twilio.auth_token, signature, &url, params);
    if !valid {
        warn!("twilio signature rejected for {}", url);
    }
    valid
}

/// Inbound voice call: seed the conversation keyed by CallSid and answer
/// with minimal TwiML so the call stays up while status callbacks flow.
pub async fn voice(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    OriginalUri(uri): OriginalUri,
    Form(params): Form<HashMap<String, String>>,
) -> Response {
    if !authenticate(&state, &headers, &uri, &params) {
        return StatusCode::FORBIDDEN.into_response();
    }
    if let Err(e) = seed_call_conversation(&state, &params).await {
        error!("twilio voice processing failed: {}", e);
    }
    (
        StatusCode::OK,
        [("content-type", "application/xml")],
        "<Response/>",
    )
        .into_response()
}

pub async fn call_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    OriginalUri(uri): OriginalUri,
    Form(params): Form<HashMap<String, String>>,
) -> Response {
    if !authenticate(&state, &headers, &uri, &params) {
        return StatusCode::FORBIDDEN.into_response();
    }
    if let Err(e) = process_call_status(&state, &params).await {
        error!("twilio call-status processing failed: {}", e);
    }
    StatusCode::OK.into_response()
}

pub async fn recording_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    OriginalUri(uri): OriginalUri,
    Form(params): Form<HashMap<String, String>>,
) -> Response {
    if !authenticate(&state, &headers, &uri, &params) {
        return StatusCode::FORBIDDEN.into_response();
    }
    if let Err(e) = process_recording(&state, &params).await {
        error!("twilio recording processing failed: {}", e);
    }
    StatusCode::OK.into_response()
}

pub async fn sms_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    OriginalUri(uri): OriginalUri,
    Form(params): Form<HashMap<String, String>>,
) -> Response {
    if !authenticate(&state, &headers, &uri, &params) {
        return StatusCode::FORBIDDEN.into_response();
    }
    info!(
        "twilio sms {} status: {}",
        params.get("MessageSid").map(String::as_str).unwrap_or("?"),
        params.get("MessageStatus").map(String::as_str).unwrap_or("?"),
    );
    StatusCode::OK.into_response()
}

async fn seed_call_conversation(
    state: &Arc<AppState>,
    params: &HashMap<String, String>,
) -> Result<(), BoxError> {
    let store = state.store.clone();
    let Some(call_sid) = params.get("CallSid") else {
        return Ok(());
    };
    let Some(to) = params.get("To") else {
        return Ok(());
    };
    let Some(channel) = store
        .channel_by_provider_key(ChannelKind::Phone, "phoneNumber", to)
        .await?
    else {
        info!("inbound call to unknown number {}", to);
        return Ok(());
    };
    let Some(agent) = store.agent_for_channel(channel.id).await? else {
        info!("phone channel {} has no agent attached", channel.id);
        return Ok(());
    };

    let mut seed = Conversation::new(channel.business_id, agent.id, ChannelKind::Phone);
    seed.id = Uuid::new_v5(
        &Uuid::NAMESPACE_OID,
        format!("twilio:{}", call_sid).as_bytes(),
    );
    seed.channel_id = Some(channel.id);
    seed.external_id = Some(call_sid.clone());
    seed.contact_phone = params.get("From").cloned();
    let conversation = store
        .upsert_conversation_by_external_id(ChannelKind::Phone, call_sid, seed)
        .await?;
    store
        .merge_call_details(conversation.id, collect_params(params, &["From", "To", "Direction"]))
        .await?;
    Ok(())
}

async fn process_call_status(
    state: &Arc<AppState>,
    params: &HashMap<String, String>,
) -> Result<(), BoxError> {
    let store = state.store.clone();
    let Some(call_sid) = params.get("CallSid") else {
        return Ok(());
    };
    let Some(conversation) = store
        .conversation_by_external_id(ChannelKind::Phone, call_sid)
        .await?
    else {
        info!("call status for unknown call {}", call_sid);
        return Ok(());
    };

    store
        .merge_call_details(
            conversation.id,
            collect_params(
                params,
                &["CallStatus", "CallDuration", "From", "To", "Direction"],
            ),
        )
        .await?;

    if params.get("CallStatus").map(String::as_str) == Some("completed") {
        aggregate_call(&store, conversation.id, params).await?;
    }
    Ok(())
}

/// Terminal call: close the conversation and fold the call into its
/// extracted analytics.
async fn aggregate_call(
    store: &Arc<dyn crate::store::Store>,
    conversation_id: Uuid,
    params: &HashMap<String, String>,
) -> Result<(), BoxError> {
    // Refetch: merge_call_details just rewrote the document.
    let Some(mut conversation) = store.conversation(conversation_id).await? else {
        return Ok(());
    };
    conversation.status = ConversationStatus::Disconnected;
    let duration = params
        .get("CallDuration")
        .and_then(|d| d.parse::<u64>().ok())
        .unwrap_or(0);
    if let Some(extracted) = conversation.extracted_data.as_object_mut() {
        extracted.insert(
            "callSummary".to_string(),
            json!({
                "durationSeconds": duration,
                "messages": conversation.message_count,
                "endedAt": chrono::Utc::now().to_rfc3339(),
            }),
        );
    }
    store.update_conversation(&conversation).await?;
    info!(
        "call conversation {} completed after {}s",
        conversation_id, duration
    );
    Ok(())
}

async fn process_recording(
    state: &Arc<AppState>,
    params: &HashMap<String, String>,
) -> Result<(), BoxError> {
    let store = state.store.clone();
    let Some(call_sid) = params.get("CallSid") else {
        return Ok(());
    };
    let Some(conversation) = store
        .conversation_by_external_id(ChannelKind::Phone, call_sid)
        .await?
    else {
        info!("recording callback for unknown call {}", call_sid);
        return Ok(());
    };
    // Merge keeps whatever call fields are already there.
    store
        .merge_call_details(
            conversation.id,
            collect_params(
                params,
                &["RecordingSid", "RecordingUrl", "RecordingDuration", "RecordingStatus"],
            ),
        )
        .await?;
    Ok(())
}

fn collect_params(params: &HashMap<String, String>, keys: &[&str]) -> Value {
    let mut patch = Map::new();
    for key in keys {
        if let Some(value) = params.get(*key) {
            patch.insert((*key).to_string(), json!(value));
        }
    }
    Value::Object(patch)
}
