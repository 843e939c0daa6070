//! Telegram channel provisioning and Bot API client.
//!
//! Handshake: validate the bot token by fetching the bot identity, register
//! the webhook URL, then persist the token as a secret. The token is never
//! stored before webhook registration succeeds.

use log::{error, info};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::shared::models::Channel;

use super::{require_str, ChannelError, ChannelHandshake, ChannelKind, HandshakeContext};

const DEFAULT_BASE_URL: &str = "https://api.telegram.org";

pub struct TelegramClient {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
pub struct BotIdentity {
    pub id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

impl TelegramClient {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    pub async fn get_me(&self, token: &str) -> Result<BotIdentity, ChannelError> {
        let response = self
            .http
            .get(format!("{}/bot{}/getMe", self.base_url, token))
            .send()
            .await
            .map_err(|e| ChannelError::Provider(e.to_string()))?;

        let envelope: ApiEnvelope<BotIdentity> = response
            .json()
            .await
            .map_err(|e| ChannelError::Provider(e.to_string()))?;

        if !envelope.ok {
            return Err(ChannelError::InvalidCredentials(
                envelope
                    .description
                    .unwrap_or_else(|| "invalid bot token".to_string()),
            ));
        }
        envelope
            .result
            .ok_or_else(|| ChannelError::Provider("empty getMe result".to_string()))
    }

    pub async fn set_webhook(&self, token: &str, url: &str) -> Result<(), ChannelError> {
        self.call_bool(token, "setWebhook", json!({"url": url})).await
    }

    pub async fn delete_webhook(&self, token: &str) -> Result<(), ChannelError> {
        self.call_bool(token, "deleteWebhook", json!({})).await
    }

    /// Send a text message, optionally with a quick-reply keyboard
    /// (`request_contact` / `request_location` buttons).
    pub async fn send_message(
        &self,
        token: &str,
        chat_id: &str,
        text: &str,
        reply_markup: Option<Value>,
    ) -> Result<(), ChannelError> {
        let mut body = json!({"chat_id": chat_id, "text": text});
        if let Some(markup) = reply_markup {
            body["reply_markup"] = markup;
        }
        self.call_bool(token, "sendMessage", body).await
    }

    async fn call_bool(&self, token: &str, method: &str, body: Value) -> Result<(), ChannelError> {
        let response = self
            .http
            .post(format!("{}/bot{}/{}", self.base_url, token, method))
            .json(&body)
            .send()
            .await
            .map_err(|e| ChannelError::Provider(e.to_string()))?;

        let envelope: ApiEnvelope<Value> = response
            .json()
            .await
            .map_err(|e| ChannelError::Provider(e.to_string()))?;

        if !envelope.ok {
            return Err(ChannelError::Provider(
                envelope
                    .description
                    .unwrap_or_else(|| format!("{} failed", method)),
            ));
        }
        Ok(())
    }
}

/// Keyboard asking the user to share their contact via the native button.
pub fn contact_keyboard() -> Value {
    json!({
        "keyboard": [[{"text": "Share contact", "request_contact": true}]],
        "one_time_keyboard": true,
        "resize_keyboard": true,
    })
}

/// Keyboard asking the user to share their location via the native button.
pub fn location_keyboard() -> Value {
    json!({
        "keyboard": [[{"text": "Share location", "request_location": true}]],
        "one_time_keyboard": true,
        "resize_keyboard": true,
    })
}

pub struct TelegramHandshake {
    base_url: Option<String>,
}

impl TelegramHandshake {
    pub fn new() -> Self {
        Self { base_url: None }
    }

    /// Point the handshake at a different Bot API host.
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: Some(base_url.into()),
        }
    }

    fn client(&self, ctx: &HandshakeContext) -> TelegramClient {
        match &self.base_url {
            Some(base) => TelegramClient::with_base_url(ctx.http.clone(), base.clone()),
            None => TelegramClient::new(ctx.http.clone()),
        }
    }
}

impl Default for TelegramHandshake {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ChannelHandshake for TelegramHandshake {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Telegram
    }

    async fn create(
        &self,
        ctx: &HandshakeContext,
        channel: &mut Channel,
    ) -> Result<(), ChannelError> {
        let token = require_str(&channel.config, "botToken")?.to_string();
        let client = self.client(ctx);

        let identity = client.get_me(&token).await?;
        channel.set_config("botId", json!(identity.id.to_string()));
        if let Some(username) = identity.username {
            channel.set_config("botUsername", json!(username));
        }
        ctx.checkpoint(channel, "fetched bot details").await?;

        let webhook_url = ctx
            .config
            .webhook_url(&format!("webhook/telegram/{}", identity.id));
        client.set_webhook(&token, &webhook_url).await?;
        channel.webhook_url = Some(webhook_url);
        // Token becomes a secret only now that the webhook is registered.
        channel.set_secret("botToken", json!(token));
        if let Some(config) = channel.config.as_object_mut() {
            config.remove("botToken");
        }
        ctx.checkpoint(channel, "bot webhook set").await?;
        info!("telegram channel {} provisioned", channel.id);
        Ok(())
    }

    async fn teardown(&self, ctx: &HandshakeContext, channel: &Channel) {
        let Some(token) = channel.secret_str("botToken") else {
            return;
        };
        if let Err(e) = self.client(ctx).delete_webhook(token).await {
            error!(
                "telegram webhook removal failed for channel {}: {}",
                channel.id, e
            );
        }
    }
}
