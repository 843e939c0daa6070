//! Phone (Twilio voice) channel provisioning.
//!
//! No external handshake call: the Twilio integration is account-level
//! config, so provisioning resolves that record and derives the voice and
//! status webhook URLs from the server's public base URL.

use log::info;
use serde_json::json;

use crate::shared::models::Channel;

use super::{ChannelError, ChannelHandshake, ChannelKind, HandshakeContext};

pub struct PhoneHandshake;

impl PhoneHandshake {
    pub fn new() -> Self {
        Self
    }
}

impl Default for PhoneHandshake {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ChannelHandshake for PhoneHandshake {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Phone
    }

    async fn create(
        &self,
        ctx: &HandshakeContext,
        channel: &mut Channel,
    ) -> Result<(), ChannelError> {
        if ctx.config.twilio.account_sid.is_empty() || ctx.config.twilio.auth_token.is_empty() {
            return Err(ChannelError::InvalidCredentials(
                "twilio integration is not configured".to_string(),
            ));
        }

        channel.set_config(
            "voiceUrl",
            json!(ctx.config.webhook_url("webhook/twilio/voice")),
        );
        channel.webhook_url = Some(ctx.config.webhook_url("webhook/twilio/call/status"));
        ctx.checkpoint(channel, "webhook urls derived").await?;
        info!("phone channel {} provisioned", channel.id);
        Ok(())
    }

    async fn teardown(&self, _ctx: &HandshakeContext, channel: &Channel) {
        log::info!("phone channel {} removed locally", channel.id);
    }
}
