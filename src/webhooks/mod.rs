//! Inbound provider callbacks.
//!
//! One handler module per provider. Shared policy: handlers acknowledge with
//! 200 even when internal processing fails (providers retry aggressively on
//! anything else); the exceptions are the signature checks, which reject
//! before any payload parsing.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;

use crate::shared::state::AppState;

pub mod instagram;
pub mod telegram;
pub mod twilio;
pub mod whatsapp;

pub fn configure() -> Router<Arc<AppState>> {
    Router::new()
        .route("/webhook/telegram/:bot_id", post(telegram::inbound))
        .route(
            "/webhook/whatsapp/:channel_id",
            get(whatsapp::verify).post(whatsapp::inbound),
        )
        .route(
            "/webhook/instagram/main",
            get(instagram::verify).post(instagram::inbound),
        )
        .route("/webhook/twilio/voice", post(twilio::voice))
        .route("/webhook/twilio/call/status", post(twilio::call_status))
        .route("/webhook/twilio/call/recording", post(twilio::recording_status))
        .route("/webhook/twilio/sms/status", post(twilio::sms_status))
}
