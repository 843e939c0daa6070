//! Email channel provisioning.
//!
//! Handshake: build an SMTP transport from the supplied fields (basic auth
//! or OAuth2) and verify it can authenticate before persisting anything.
//! A failed verification leaves the channel at `failed` with no secrets.

use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::SmtpTransport;
use log::info;
use serde_json::json;

use crate::shared::models::Channel;

use super::{require_str, ChannelError, ChannelHandshake, ChannelKind, HandshakeContext};

pub struct EmailHandshake;

impl EmailHandshake {
    pub fn new() -> Self {
        Self
    }

    fn build_transport(channel: &Channel) -> Result<(SmtpTransport, String), ChannelError> {
        let host = require_str(&channel.config, "smtpHost")?.to_string();
        let port = channel
            .config
            .get("smtpPort")
            .and_then(|v| v.as_u64())
            .map(|p| p as u16);
        let username = require_str(&channel.config, "username")?.to_string();

        let (secret, mechanism) =
            if let Some(token) = channel.config_str("oauthAccessToken") {
                (token.to_string(), Mechanism::Xoauth2)
            } else {
                let password = require_str(&channel.config, "password")?.to_string();
                (password, Mechanism::Login)
            };

        let mut builder = SmtpTransport::relay(&host)
            .map_err(|e| ChannelError::Provider(e.to_string()))?
            .credentials(Credentials::new(username, secret.clone()))
            .authentication(vec![mechanism]);
        if let Some(port) = port {
            builder = builder.port(port);
        }
        Ok((builder.build(), secret))
    }
}

impl Default for EmailHandshake {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ChannelHandshake for EmailHandshake {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Email
    }

    async fn create(
        &self,
        ctx: &HandshakeContext,
        channel: &mut Channel,
    ) -> Result<(), ChannelError> {
        let (transport, secret) = Self::build_transport(channel)?;
        ctx.checkpoint(channel, "transport built").await?;

        // lettre's SMTP probe is blocking I/O.
        let verified = tokio::task::spawn_blocking(move || transport.test_connection())
            .await
            .map_err(|e| ChannelError::Provider(e.to_string()))?
            .map_err(|e| ChannelError::InvalidCredentials(e.to_string()))?;
        if !verified {
            return Err(ChannelError::InvalidCredentials(
                "smtp authentication failed".to_string(),
            ));
        }

        let secret_key = if channel.config_str("oauthAccessToken").is_some() {
            "oauthAccessToken"
        } else {
            "password"
        };
        channel.set_secret(secret_key, json!(secret));
        if let Some(config) = channel.config.as_object_mut() {
            config.remove("password");
            config.remove("oauthAccessToken");
        }
        ctx.checkpoint(channel, "transport verified").await?;
        info!("email channel {} provisioned", channel.id);
        Ok(())
    }

    async fn teardown(&self, _ctx: &HandshakeContext, channel: &Channel) {
        log::info!("email channel {} removed locally", channel.id);
    }
}
