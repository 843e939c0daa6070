//! REST surface: channel lifecycle, agent management, the streaming agent
//! turn endpoint and message reactions.
//!
//! Responses are uniformly `{success, message, data}`; channels are
//! serialized with their `secrets` stripped by the model itself.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use futures::StreamExt;
use log::{error, info};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::bot::runtime::InterruptionDecision;
use crate::bot::{BotOrchestrator, TurnFragment, TurnRequest};
use crate::channels::{ChannelError, ChannelKind};
use crate::shared::models::{Agent, Channel, Reaction};
use crate::shared::state::AppState;

pub fn configure() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health))
        .route("/channels", post(create_channel))
        .route("/channels/:id", put(update_channel).delete(delete_channel))
        .route("/agents", post(upsert_agent))
        .route("/v1/agent", post(agent_turn))
        .route("/reaction", put(set_reaction))
}

fn envelope(success: bool, message: &str, data: Value) -> Json<Value> {
    Json(json!({"success": success, "message": message, "data": data}))
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelRequest {
    name: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    config: Option<Value>,
    business_id: Option<Uuid>,
}

async fn create_channel(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ChannelRequest>,
) -> Response {
    let Some(kind_raw) = body.kind.as_deref() else {
        return (
            StatusCode::BAD_REQUEST,
            envelope(false, "missing required field: type", Value::Null),
        )
            .into_response();
    };
    let kind: ChannelKind = match kind_raw.parse() {
        Ok(kind) => kind,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                envelope(false, &channel_error_message(&e), Value::Null),
            )
                .into_response();
        }
    };

    let mut channel = Channel::new(
        body.business_id.unwrap_or_else(Uuid::new_v4),
        body.name.unwrap_or_else(|| kind.to_string()),
        kind,
        body.config.unwrap_or_else(|| json!({})),
    );
    if let Err(e) = state.store.insert_channel(&channel).await {
        error!("channel insert failed: {}", e);
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            envelope(false, "store failure", Value::Null),
        )
            .into_response();
    }

    match state.handshakes.get(kind) {
        Some(handshake) => {
            let ctx = state.handshake_ctx();
            match handshake.create(&ctx, &mut channel).await {
                Ok(()) => channel_response(StatusCode::OK, "channel created", &channel),
                Err(e) => fail_handshake(&state, channel, e).await,
            }
        }
        // Web/SMS channels have no provider-side provisioning.
        None => {
            channel.status = "active".to_string();
            if let Err(e) = state.store.update_channel(&channel).await {
                error!("channel update failed: {}", e);
            }
            channel_response(StatusCode::OK, "channel created", &channel)
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChannelUpdateRequest {
    config: Value,
}

async fn update_channel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<ChannelUpdateRequest>,
) -> Response {
    let mut channel = match state.store.channel(id).await {
        Ok(Some(channel)) => channel,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                envelope(false, "channel not found", Value::Null),
            )
                .into_response();
        }
        Err(e) => {
            error!("channel load failed: {}", e);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                envelope(false, "store failure", Value::Null),
            )
                .into_response();
        }
    };

    match state.handshakes.get(channel.kind) {
        Some(handshake) => {
            let ctx = state.handshake_ctx();
            match handshake.update(&ctx, &mut channel, &body.config).await {
                Ok(()) => channel_response(StatusCode::OK, "channel updated", &channel),
                Err(e) => fail_handshake(&state, channel, e).await,
            }
        }
        None => {
            if let Some(config) = channel.config.as_object_mut() {
                if let Some(patch) = body.config.as_object() {
                    for (k, v) in patch {
                        config.insert(k.clone(), v.clone());
                    }
                }
            }
            if let Err(e) = state.store.update_channel(&channel).await {
                error!("channel update failed: {}", e);
            }
            channel_response(StatusCode::OK, "channel updated", &channel)
        }
    }
}

async fn delete_channel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Response {
    let channel = match state.store.channel(id).await {
        Ok(Some(channel)) => channel,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                envelope(false, "channel not found", Value::Null),
            )
                .into_response();
        }
        Err(e) => {
            error!("channel load failed: {}", e);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                envelope(false, "store failure", Value::Null),
            )
                .into_response();
        }
    };

    // Provider-side teardown is best-effort; local deletion proceeds
    // regardless of its outcome.
    if let Some(handshake) = state.handshakes.get(channel.kind) {
        let ctx = state.handshake_ctx();
        handshake.teardown(&ctx, &channel).await;
    }
    if let Err(e) = state.store.delete_channel(channel.id).await {
        error!("channel delete failed: {}", e);
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            envelope(false, "store failure", Value::Null),
        )
            .into_response();
    }
    if let Err(e) = state.store.detach_channel_from_agents(channel.id).await {
        error!("channel detach failed: {}", e);
    }
    info!("channel {} deleted", channel.id);
    (StatusCode::OK, envelope(true, "channel deleted", Value::Null)).into_response()
}

fn channel_error_message(e: &ChannelError) -> String {
    e.to_string()
}

/// Persist a failed status that keeps the last reached step, then answer
/// with the provider-mapped code. Already-completed handshake steps are not
/// rolled back.
async fn fail_handshake(state: &Arc<AppState>, mut channel: Channel, e: ChannelError) -> Response {
    error!("handshake failed for channel {}: {}", channel.id, e);
    channel.status = format!("failed: {}", channel.status);
    if let Err(persist) = state.store.update_channel(&channel).await {
        error!("failed-status persist failed: {}", persist);
    }
    let status =
        StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        envelope(
            false,
            &channel_error_message(&e),
            serde_json::to_value(&channel).unwrap_or(Value::Null),
        ),
    )
        .into_response()
}

fn channel_response(status: StatusCode, message: &str, channel: &Channel) -> Response {
    (
        status,
        envelope(
            true,
            message,
            serde_json::to_value(channel).unwrap_or(Value::Null),
        ),
    )
        .into_response()
}

async fn upsert_agent(
    State(state): State<Arc<AppState>>,
    Json(agent): Json<Agent>,
) -> Response {
    if let Err(e) = state.store.upsert_agent(&agent).await {
        error!("agent upsert failed: {}", e);
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            envelope(false, "store failure", Value::Null),
        )
            .into_response();
    }
    (
        StatusCode::OK,
        envelope(
            true,
            "agent saved",
            serde_json::to_value(&agent).unwrap_or(Value::Null),
        ),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AgentTurnBody {
    user_message: String,
    agent_id: Uuid,
    conversation_id: Option<Uuid>,
    message_id: Option<Uuid>,
    geo_location: Option<Value>,
    #[serde(default)]
    interruption_decisions: Vec<InterruptionDecision>,
}

/// Streaming turn: newline-delimited JSON fragments over a chunked body.
/// The stream always terminates with an `end` or `awaiting_approval`
/// fragment, even on error.
async fn agent_turn(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AgentTurnBody>,
) -> Response {
    let mut req = TurnRequest::new(body.agent_id, ChannelKind::Web, body.user_message);
    req.conversation_id = body.conversation_id;
    req.message_id = body.message_id;
    req.geo_location = body.geo_location;
    req.interruption_decisions = body.interruption_decisions;

    let (tx, rx) = mpsc::channel::<TurnFragment>(32);
    let orchestrator = BotOrchestrator::new(state.clone());
    tokio::spawn(async move {
        orchestrator.run_turn(req, tx).await;
    });

    let stream = ReceiverStream::new(rx).map(|fragment| {
        let mut line =
            serde_json::to_string(&fragment).unwrap_or_else(|_| "{}".to_string());
        line.push('\n');
        Ok::<_, Infallible>(Bytes::from(line))
    });
    (
        StatusCode::OK,
        [("content-type", "application/json")],
        Body::from_stream(stream),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReactionBody {
    message_id: Uuid,
    reaction: String,
}

async fn set_reaction(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ReactionBody>,
) -> Response {
    let reaction: Reaction = match body.reaction.parse() {
        Ok(reaction) => reaction,
        Err(()) => {
            return (
                StatusCode::BAD_REQUEST,
                envelope(false, "Undefined reaction", Value::Null),
            )
                .into_response();
        }
    };
    match state.store.set_reaction(body.message_id, reaction).await {
        Ok(true) => {
            (StatusCode::OK, envelope(true, "reaction saved", Value::Null)).into_response()
        }
        Ok(false) => (
            StatusCode::NOT_FOUND,
            envelope(false, "message not found", Value::Null),
        )
            .into_response(),
        Err(e) => {
            error!("reaction persist failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                envelope(false, "store failure", Value::Null),
            )
                .into_response()
        }
    }
}
