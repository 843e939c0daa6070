//! Instagram messaging channel provisioning.
//!
//! Handshake: exchange the OAuth code for a short-lived token, exchange that
//! for a long-lived token (mandatory; the short-lived token is never cached
//! as final), then fetch the business profile fields.

use chrono::{Duration, Utc};
use log::info;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::shared::models::Channel;

use super::{require_str, ChannelError, ChannelHandshake, ChannelKind, HandshakeContext};

const DEFAULT_API_URL: &str = "https://api.instagram.com";
const DEFAULT_GRAPH_URL: &str = "https://graph.instagram.com";

pub struct InstagramClient {
    http: reqwest::Client,
    api_base: String,
    graph_base: String,
}

#[derive(Debug, Deserialize)]
pub struct ShortLivedToken {
    pub access_token: String,
    pub user_id: Value,
}

#[derive(Debug, Deserialize)]
pub struct LongLivedToken {
    pub access_token: String,
    pub expires_in: i64,
}

impl InstagramClient {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            api_base: DEFAULT_API_URL.to_string(),
            graph_base: DEFAULT_GRAPH_URL.to_string(),
        }
    }

    pub fn with_base_urls(
        http: reqwest::Client,
        api_base: impl Into<String>,
        graph_base: impl Into<String>,
    ) -> Self {
        Self {
            http,
            api_base: api_base.into(),
            graph_base: graph_base.into(),
        }
    }

    pub async fn exchange_code(
        &self,
        app_id: &str,
        app_secret: &str,
        redirect_uri: &str,
        code: &str,
    ) -> Result<ShortLivedToken, ChannelError> {
        let response = self
            .http
            .post(format!("{}/oauth/access_token", self.api_base))
            .form(&[
                ("client_id", app_id),
                ("client_secret", app_secret),
                ("grant_type", "authorization_code"),
                ("redirect_uri", redirect_uri),
                ("code", code),
            ])
            .send()
            .await
            .map_err(|e| ChannelError::Provider(e.to_string()))?;

        if !response.status().is_success() {
            let detail = response.text().await.unwrap_or_default();
            log::error!("instagram code exchange failed: {}", detail);
            return Err(ChannelError::InvalidCredentials(
                "instagram code verification failed".to_string(),
            ));
        }
        response
            .json()
            .await
            .map_err(|e| ChannelError::Provider(e.to_string()))
    }

    pub async fn exchange_long_lived(
        &self,
        app_secret: &str,
        short_token: &str,
    ) -> Result<LongLivedToken, ChannelError> {
        let response = self
            .http
            .get(format!("{}/access_token", self.graph_base))
            .query(&[
                ("grant_type", "ig_exchange_token"),
                ("client_secret", app_secret),
                ("access_token", short_token),
            ])
            .send()
            .await
            .map_err(|e| ChannelError::Provider(e.to_string()))?;

        if !response.status().is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ChannelError::Provider(format!(
                "instagram long-lived token exchange failed: {}",
                detail
            )));
        }
        response
            .json()
            .await
            .map_err(|e| ChannelError::Provider(e.to_string()))
    }

    pub async fn fetch_profile(&self, token: &str) -> Result<Value, ChannelError> {
        let response = self
            .http
            .get(format!("{}/me", self.graph_base))
            .query(&[
                ("fields", "id,username,account_type,name"),
                ("access_token", token),
            ])
            .send()
            .await
            .map_err(|e| ChannelError::Provider(e.to_string()))?;

        if !response.status().is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ChannelError::Provider(format!(
                "instagram profile fetch failed: {}",
                detail
            )));
        }
        response
            .json()
            .await
            .map_err(|e| ChannelError::Provider(e.to_string()))
    }

    pub async fn send_message(
        &self,
        token: &str,
        ig_user_id: &str,
        recipient_id: &str,
        text: &str,
    ) -> Result<(), ChannelError> {
        let response = self
            .http
            .post(format!("{}/{}/messages", self.graph_base, ig_user_id))
            .bearer_auth(token)
            .json(&json!({
                "recipient": {"id": recipient_id},
                "message": {"text": text},
            }))
            .send()
            .await
            .map_err(|e| ChannelError::Provider(e.to_string()))?;

        if !response.status().is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ChannelError::Provider(format!(
                "instagram message send failed: {}",
                detail
            )));
        }
        Ok(())
    }
}

pub struct InstagramHandshake {
    base_urls: Option<(String, String)>,
}

impl InstagramHandshake {
    pub fn new() -> Self {
        Self { base_urls: None }
    }

    pub fn with_base_urls(api_base: impl Into<String>, graph_base: impl Into<String>) -> Self {
        Self {
            base_urls: Some((api_base.into(), graph_base.into())),
        }
    }

    fn client(&self, ctx: &HandshakeContext) -> InstagramClient {
        match &self.base_urls {
            Some((api, graph)) => {
                InstagramClient::with_base_urls(ctx.http.clone(), api.clone(), graph.clone())
            }
            None => InstagramClient::new(ctx.http.clone()),
        }
    }
}

impl Default for InstagramHandshake {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ChannelHandshake for InstagramHandshake {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Instagram
    }

    async fn create(
        &self,
        ctx: &HandshakeContext,
        channel: &mut Channel,
    ) -> Result<(), ChannelError> {
        let code = require_str(&channel.config, "instagramCode")?.to_string();
        let redirect_uri = require_str(&channel.config, "redirectUri")?.to_string();
        let client = self.client(ctx);

        let short = client
            .exchange_code(
                &ctx.config.meta.app_id,
                &ctx.config.meta.app_secret,
                &redirect_uri,
                &code,
            )
            .await?;
        channel.set_config("userId", json!(short.user_id.to_string().trim_matches('"')));
        if let Some(config) = channel.config.as_object_mut() {
            config.remove("instagramCode");
        }
        ctx.checkpoint(channel, "fetched short-lived token").await?;

        let long = client
            .exchange_long_lived(&ctx.config.meta.app_secret, &short.access_token)
            .await?;
        let expires_at = Utc::now() + Duration::seconds(long.expires_in);
        channel.set_secret("accessToken", json!(long.access_token.clone()));
        channel.set_secret("expiresAt", json!(expires_at.to_rfc3339()));
        ctx.checkpoint(channel, "fetched long-lived token").await?;

        let profile = client.fetch_profile(&long.access_token).await?;
        if let Some(username) = profile.get("username").and_then(|v| v.as_str()) {
            channel.set_config("username", json!(username));
        }
        if let Some(id) = profile.get("id").and_then(|v| v.as_str()) {
            channel.set_config("userId", json!(id));
        }
        ctx.checkpoint(channel, "profile fetched").await?;
        info!("instagram channel {} provisioned", channel.id);
        Ok(())
    }

    async fn teardown(&self, _ctx: &HandshakeContext, channel: &Channel) {
        // No provider-side webhook to remove: the Instagram subscription is
        // app-scoped, not channel-scoped.
        log::info!("instagram channel {} removed locally", channel.id);
    }
}
