//! Channel provisioning.
//!
//! Each messaging provider is a linear handshake state machine behind the
//! common [`ChannelHandshake`] trait: create turns raw credentials into a
//! verified, webhook-registered channel, update re-runs the provider steps
//! against new input, teardown is best-effort provider-side cleanup on
//! channel deletion. Every step persists the channel `status` before the
//! next network call so a crash mid-handshake leaves an inspectable trail.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::AppConfig;
use crate::shared::models::Channel;
use crate::shared::notify::{ProgressEvent, ProgressNotifier};
use crate::store::Store;

pub mod email;
pub mod instagram;
pub mod phone;
pub mod telegram;
pub mod whatsapp;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Telegram,
    WhatsApp,
    Web,
    Phone,
    Instagram,
    Sms,
    Email,
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Telegram => write!(f, "telegram"),
            Self::WhatsApp => write!(f, "whatsapp"),
            Self::Web => write!(f, "web"),
            Self::Phone => write!(f, "phone"),
            Self::Instagram => write!(f, "instagram"),
            Self::Sms => write!(f, "sms"),
            Self::Email => write!(f, "email"),
        }
    }
}

impl std::str::FromStr for ChannelKind {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "telegram" | "tg" => Ok(Self::Telegram),
            "whatsapp" | "wa" => Ok(Self::WhatsApp),
            "web" => Ok(Self::Web),
            "phone" | "voice" => Ok(Self::Phone),
            "instagram" | "ig" => Ok(Self::Instagram),
            "sms" => Ok(Self::Sms),
            "email" => Ok(Self::Email),
            _ => Err(ChannelError::UnknownKind(s.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("unknown channel type: {0}")]
    UnknownKind(String),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("{0}")]
    InvalidCredentials(String),
    #[error("provider error: {0}")]
    Provider(String),
    #[error("channel not found")]
    NotFound,
}

impl ChannelError {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::UnknownKind(_) | Self::MissingField(_) => 400,
            Self::InvalidCredentials(_) => 401,
            Self::NotFound => 404,
            Self::Provider(_) => 500,
        }
    }
}

/// Shared dependencies a handshake needs: the document store for per-step
/// checkpointing, an HTTP client, app config and the progress port.
pub struct HandshakeContext {
    pub store: Arc<dyn Store>,
    pub http: reqwest::Client,
    pub config: AppConfig,
    pub notifier: Arc<dyn ProgressNotifier>,
}

impl HandshakeContext {
    /// Persist the channel at its current handshake step. One store write per
    /// step, issued before the next provider call is attempted.
    pub async fn checkpoint(
        &self,
        channel: &mut Channel,
        status: &str,
    ) -> Result<(), ChannelError> {
        channel.status = status.to_string();
        channel.updated_at = chrono::Utc::now();
        self.store
            .update_channel(channel)
            .await
            .map_err(|e| ChannelError::Provider(e.to_string()))?;
        self.notifier.notify(ProgressEvent::HandshakeStep {
            channel_id: channel.id,
            status: status.to_string(),
        });
        Ok(())
    }
}

#[async_trait::async_trait]
pub trait ChannelHandshake: Send + Sync {
    fn kind(&self) -> ChannelKind;

    /// Run the full provisioning sequence for a freshly created channel.
    async fn create(
        &self,
        ctx: &HandshakeContext,
        channel: &mut Channel,
    ) -> Result<(), ChannelError>;

    /// Re-run the provider steps against new input, re-registering webhooks
    /// where relevant. Default: same steps as create with the new config.
    async fn update(
        &self,
        ctx: &HandshakeContext,
        channel: &mut Channel,
        new_config: &Value,
    ) -> Result<(), ChannelError> {
        merge_config(&mut channel.config, new_config);
        self.create(ctx, channel).await
    }

    /// Best-effort provider-side cleanup. Failures are logged, never
    /// surfaced; local deletion proceeds regardless.
    async fn teardown(&self, ctx: &HandshakeContext, channel: &Channel);
}

fn merge_config(config: &mut Value, patch: &Value) {
    if let (Some(base), Some(new)) = (config.as_object_mut(), patch.as_object()) {
        for (k, v) in new {
            base.insert(k.clone(), v.clone());
        }
    } else if patch.is_object() {
        *config = patch.clone();
    }
}

pub struct HandshakeRegistry {
    handlers: HashMap<ChannelKind, Arc<dyn ChannelHandshake>>,
}

impl HandshakeRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registry with every built-in provider registered.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(telegram::TelegramHandshake::new()));
        registry.register(Arc::new(whatsapp::WhatsAppHandshake::new()));
        registry.register(Arc::new(instagram::InstagramHandshake::new()));
        registry.register(Arc::new(email::EmailHandshake::new()));
        registry.register(Arc::new(phone::PhoneHandshake::new()));
        registry
    }

    pub fn register(&mut self, handshake: Arc<dyn ChannelHandshake>) {
        self.handlers.insert(handshake.kind(), handshake);
    }

    pub fn get(&self, kind: ChannelKind) -> Option<Arc<dyn ChannelHandshake>> {
        self.handlers.get(&kind).cloned()
    }
}

impl Default for HandshakeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Read a required string field out of a channel config object.
pub(crate) fn require_str<'a>(
    config: &'a Value,
    field: &'static str,
) -> Result<&'a str, ChannelError> {
    config
        .get(field)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or(ChannelError::MissingField(field))
}
