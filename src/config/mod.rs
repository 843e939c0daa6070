use std::env;

#[derive(Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub public_base_url: String,
    pub meta: MetaConfig,
    pub twilio: TwilioConfig,
    pub llm: LlmConfig,
}

#[derive(Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Meta platform (WhatsApp Business / Instagram) application credentials.
#[derive(Clone)]
pub struct MetaConfig {
    pub app_id: String,
    pub app_secret: String,
    pub verify_token: String,
}

#[derive(Clone)]
pub struct TwilioConfig {
    pub account_sid: String,
    pub auth_token: String,
}

#[derive(Clone)]
pub struct LlmConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, env::VarError> {
        let host = env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("SERVER_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8080);

        let public_base_url =
            env::var("PUBLIC_BASE_URL").unwrap_or_else(|_| format!("http://{}:{}", host, port));

        Ok(Self {
            server: ServerConfig { host, port },
            public_base_url,
            meta: MetaConfig {
                app_id: env::var("META_APP_ID").unwrap_or_default(),
                app_secret: env::var("META_APP_SECRET").unwrap_or_default(),
                verify_token: env::var("META_VERIFY_TOKEN")
                    .unwrap_or_else(|_| "webhook_verify".to_string()),
            },
            twilio: TwilioConfig {
                account_sid: env::var("TWILIO_ACCOUNT_SID").unwrap_or_default(),
                auth_token: env::var("TWILIO_AUTH_TOKEN").unwrap_or_default(),
            },
            llm: LlmConfig {
                api_key: env::var("LLM_API_KEY").unwrap_or_else(|_| "empty".to_string()),
                base_url: env::var("LLM_URL")
                    .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
                model: env::var("LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            },
        })
    }

    /// Externally reachable URL for a webhook path, e.g. `/webhook/telegram/123`.
    pub fn webhook_url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.public_base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn webhook_url_joins_without_double_slash() {
        let mut cfg = AppConfig::from_env().unwrap();
        cfg.public_base_url = "https://bots.example.com/".to_string();
        assert_eq!(
            cfg.webhook_url("/webhook/telegram/42"),
            "https://bots.example.com/webhook/telegram/42"
        );
    }
}
