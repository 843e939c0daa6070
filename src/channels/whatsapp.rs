//! WhatsApp Business channel provisioning and Graph API client.
//!
//! Handshake: exchange the authorization code for a permanent access token,
//! persist the token plus a generated registration PIN and webhook verify
//! token, register the webhook callback with the provider, then bind the
//! phone number with the PIN. Each provider call is wrapped independently; a
//! failure returns immediately without rolling back earlier steps, so the
//! channel keeps whatever status it last reached and can be retried.

use log::{error, info};
use serde_json::{json, Value};

use crate::shared::models::Channel;
use crate::shared::utils::{generate_pin, verification_token};

use super::{require_str, ChannelError, ChannelHandshake, ChannelKind, HandshakeContext};

const DEFAULT_GRAPH_URL: &str = "https://graph.facebook.com/v19.0";

pub struct WhatsAppClient {
    http: reqwest::Client,
    base_url: String,
}

impl WhatsAppClient {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            base_url: DEFAULT_GRAPH_URL.to_string(),
        }
    }

    pub fn with_base_url(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    /// Exchange an embedded-signup authorization code for a permanent token.
    pub async fn exchange_code(
        &self,
        app_id: &str,
        app_secret: &str,
        code: &str,
    ) -> Result<String, ChannelError> {
        let response = self
            .http
            .get(format!("{}/oauth/access_token", self.base_url))
            .query(&[
                ("client_id", app_id),
                ("client_secret", app_secret),
                ("code", code),
            ])
            .send()
            .await
            .map_err(|e| ChannelError::Provider(e.to_string()))?;

        if !response.status().is_success() {
            let detail = response.text().await.unwrap_or_default();
            error!("whatsapp token exchange failed: {}", detail);
            return Err(ChannelError::InvalidCredentials(
                "whatsapp code verification failed".to_string(),
            ));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ChannelError::Provider(e.to_string()))?;
        body.get("access_token")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| {
                ChannelError::InvalidCredentials("whatsapp code verification failed".to_string())
            })
    }

    /// Subscribe the app to the WABA, pointing the provider at our callback.
    pub async fn subscribe_app(
        &self,
        waba_id: &str,
        token: &str,
        callback_uri: &str,
        verify_token: &str,
    ) -> Result<(), ChannelError> {
        let response = self
            .http
            .post(format!("{}/{}/subscribed_apps", self.base_url, waba_id))
            .bearer_auth(token)
            .json(&json!({
                "override_callback_uri": callback_uri,
                "verify_token": verify_token,
            }))
            .send()
            .await
            .map_err(|e| ChannelError::Provider(e.to_string()))?;
        Self::check(response, "webhook registration").await
    }

    pub async fn unsubscribe_app(&self, waba_id: &str, token: &str) -> Result<(), ChannelError> {
        let response = self
            .http
            .delete(format!("{}/{}/subscribed_apps", self.base_url, waba_id))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| ChannelError::Provider(e.to_string()))?;
        Self::check(response, "app unsubscribe").await
    }

    /// Bind the phone number for cloud-API messaging using the PIN.
    pub async fn register_phone(
        &self,
        phone_number_id: &str,
        token: &str,
        pin: u32,
    ) -> Result<(), ChannelError> {
        let response = self
            .http
            .post(format!("{}/{}/register", self.base_url, phone_number_id))
            .bearer_auth(token)
            .json(&json!({
                "messaging_product": "whatsapp",
                "pin": format!("{}", pin),
            }))
            .send()
            .await
            .map_err(|e| ChannelError::Provider(e.to_string()))?;
        Self::check(response, "phone registration").await
    }

    pub async fn deregister_phone(
        &self,
        phone_number_id: &str,
        token: &str,
    ) -> Result<(), ChannelError> {
        let response = self
            .http
            .post(format!("{}/{}/deregister", self.base_url, phone_number_id))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| ChannelError::Provider(e.to_string()))?;
        Self::check(response, "phone deregistration").await
    }

    pub async fn send_text(
        &self,
        phone_number_id: &str,
        token: &str,
        to: &str,
        body: &str,
    ) -> Result<(), ChannelError> {
        let response = self
            .http
            .post(format!("{}/{}/messages", self.base_url, phone_number_id))
            .bearer_auth(token)
            .json(&json!({
                "messaging_product": "whatsapp",
                "to": to,
                "type": "text",
                "text": {"body": body},
            }))
            .send()
            .await
            .map_err(|e| ChannelError::Provider(e.to_string()))?;
        Self::check(response, "message send").await
    }

    async fn check(response: reqwest::Response, what: &str) -> Result<(), ChannelError> {
        if response.status().is_success() {
            return Ok(());
        }
        let detail = response.text().await.unwrap_or_default();
        error!("whatsapp {} failed: {}", what, detail);
        Err(ChannelError::Provider(format!("whatsapp {} failed", what)))
    }
}

pub struct WhatsAppHandshake {
    base_url: Option<String>,
}

impl WhatsAppHandshake {
    pub fn new() -> Self {
        Self { base_url: None }
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: Some(base_url.into()),
        }
    }

    fn client(&self, ctx: &HandshakeContext) -> WhatsAppClient {
        match &self.base_url {
            Some(base) => WhatsAppClient::with_base_url(ctx.http.clone(), base.clone()),
            None => WhatsAppClient::new(ctx.http.clone()),
        }
    }
}

impl Default for WhatsAppHandshake {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ChannelHandshake for WhatsAppHandshake {
    fn kind(&self) -> ChannelKind {
        ChannelKind::WhatsApp
    }

    async fn create(
        &self,
        ctx: &HandshakeContext,
        channel: &mut Channel,
    ) -> Result<(), ChannelError> {
        let code = require_str(&channel.config, "whatsappCode")?.to_string();
        let phone_number_id = require_str(&channel.config, "phone_number_id")?.to_string();
        let waba_id = require_str(&channel.config, "waba_id")?.to_string();
        require_str(&channel.config, "business_id")?;

        let client = self.client(ctx);

        let token = client
            .exchange_code(&ctx.config.meta.app_id, &ctx.config.meta.app_secret, &code)
            .await?;
        let pin = generate_pin();
        let verify_token = verification_token();
        channel.set_secret("permanentAccessToken", json!(token));
        channel.set_secret("pin", json!(pin));
        channel.set_secret("verifyToken", json!(verify_token.clone()));
        if let Some(config) = channel.config.as_object_mut() {
            config.remove("whatsappCode");
        }
        ctx.checkpoint(channel, "fetched access token").await?;

        let callback_uri = ctx
            .config
            .webhook_url(&format!("webhook/whatsapp/{}", channel.id));
        client
            .subscribe_app(&waba_id, &token, &callback_uri, &verify_token)
            .await?;
        channel.webhook_url = Some(callback_uri);
        ctx.checkpoint(channel, "webhook registered").await?;

        client.register_phone(&phone_number_id, &token, pin).await?;
        ctx.checkpoint(channel, "phone registered").await?;
        info!("whatsapp channel {} provisioned", channel.id);
        Ok(())
    }

    async fn teardown(&self, ctx: &HandshakeContext, channel: &Channel) {
        let Some(token) = channel.secret_str("permanentAccessToken") else {
            return;
        };
        let client = self.client(ctx);
        if let Some(waba_id) = channel.config_str("waba_id") {
            if let Err(e) = client.unsubscribe_app(waba_id, token).await {
                error!(
                    "whatsapp unsubscribe failed for channel {}: {}",
                    channel.id, e
                );
            }
        }
        if let Some(phone_number_id) = channel.config_str("phone_number_id") {
            if let Err(e) = client.deregister_phone(phone_number_id, token).await {
                error!(
                    "whatsapp phone deregistration failed for channel {}: {}",
                    channel.id, e
                );
            }
        }
    }
}
