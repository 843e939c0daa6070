//! End-to-end handshake flows against mock provider servers.

use std::sync::{Arc, Mutex};

use axum::extract::Path;
use axum::routing::{get, post};
use axum::Json;
use serde_json::json;
use uuid::Uuid;

use agentserver::channels::telegram::TelegramHandshake;
use agentserver::channels::whatsapp::WhatsAppHandshake;
use agentserver::channels::{ChannelError, ChannelHandshake, ChannelKind, HandshakeContext};
use agentserver::config::AppConfig;
use agentserver::shared::models::Channel;
use agentserver::shared::notify::{ProgressEvent, ProgressNotifier};
use agentserver::store::memory::MemoryStore;
use agentserver::store::Store;

struct RecordingNotifier {
    statuses: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            statuses: Mutex::new(Vec::new()),
        })
    }

    fn statuses(&self) -> Vec<String> {
        self.statuses.lock().unwrap().clone()
    }
}

impl ProgressNotifier for RecordingNotifier {
    fn notify(&self, event: ProgressEvent) {
        if let ProgressEvent::HandshakeStep { status, .. } = event {
            self.statuses.lock().unwrap().push(status);
        }
    }
}

async fn serve(app: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn context(
    store: Arc<MemoryStore>,
    notifier: Arc<RecordingNotifier>,
) -> HandshakeContext {
    let mut config = AppConfig::from_env().unwrap();
    config.public_base_url = "https://bots.example.com".to_string();
    config.meta.app_id = "app-id".to_string();
    config.meta.app_secret = "app-secret".to_string();
    HandshakeContext {
        store,
        http: reqwest::Client::new(),
        config,
        notifier,
    }
}

async fn mock_telegram() -> String {
    let app = axum::Router::new()
        .route(
            "/:bot/getMe",
            get(|Path(bot): Path<String>| async move {
                if bot == "bot123:abc" {
                    Json(json!({"ok": true, "result": {
                        "id": 42, "username": "support_bot", "first_name": "Support",
                    }}))
                } else {
                    Json(json!({"ok": false, "description": "Unauthorized"}))
                }
            }),
        )
        .route(
            "/:bot/setWebhook",
            post(|| async { Json(json!({"ok": true, "result": true})) }),
        )
        .route(
            "/:bot/deleteWebhook",
            post(|| async { Json(json!({"ok": true, "result": true})) }),
        );
    serve(app).await
}

#[tokio::test]
async fn telegram_handshake_records_monotonic_status_trail() {
    let store = Arc::new(MemoryStore::new());
    let notifier = RecordingNotifier::new();
    let ctx = context(store.clone(), notifier.clone());
    let handshake = TelegramHandshake::with_base_url(mock_telegram().await);

    let mut channel = Channel::new(
        Uuid::new_v4(),
        "support".to_string(),
        ChannelKind::Telegram,
        json!({"botToken": "123:abc"}),
    );
    assert_eq!(channel.status, "initiated");
    store.insert_channel(&channel).await.unwrap();

    handshake.create(&ctx, &mut channel).await.unwrap();

    assert_eq!(
        notifier.statuses(),
        vec!["fetched bot details".to_string(), "bot webhook set".to_string()]
    );
    assert_eq!(channel.status, "bot webhook set");
    assert_eq!(channel.config_str("botId"), Some("42"));
    assert_eq!(channel.config_str("botUsername"), Some("support_bot"));
    // token moved out of public config into secrets
    assert!(channel.config_str("botToken").is_none());
    assert_eq!(channel.secret_str("botToken"), Some("123:abc"));
    assert_eq!(
        channel.webhook_url.as_deref(),
        Some("https://bots.example.com/webhook/telegram/42")
    );

    let persisted = store.channel(channel.id).await.unwrap().unwrap();
    assert_eq!(persisted.status, "bot webhook set");
}

#[tokio::test]
async fn telegram_bad_token_fails_with_401_and_saves_no_secret() {
    let store = Arc::new(MemoryStore::new());
    let notifier = RecordingNotifier::new();
    let ctx = context(store.clone(), notifier.clone());
    let handshake = TelegramHandshake::with_base_url(mock_telegram().await);

    let mut channel = Channel::new(
        Uuid::new_v4(),
        "support".to_string(),
        ChannelKind::Telegram,
        json!({"botToken": "bad-token"}),
    );
    store.insert_channel(&channel).await.unwrap();

    let err = handshake.create(&ctx, &mut channel).await.unwrap_err();
    assert_eq!(err.status_code(), 401);
    assert!(notifier.statuses().is_empty());
    assert!(channel.secret_str("botToken").is_none());

    let persisted = store.channel(channel.id).await.unwrap().unwrap();
    assert_eq!(persisted.status, "initiated");
}

async fn mock_whatsapp(exchange_ok: bool) -> String {
    let oauth = move || async move {
        if exchange_ok {
            (
                axum::http::StatusCode::OK,
                Json(json!({"access_token": "permanent-token"})),
            )
        } else {
            (
                axum::http::StatusCode::BAD_REQUEST,
                Json(json!({"error": {"message": "bad code"}})),
            )
        }
    };
    let app = axum::Router::new()
        .route("/oauth/access_token", get(oauth))
        .route(
            "/:waba/subscribed_apps",
            post(|| async { Json(json!({"success": true})) }),
        )
        .route(
            "/:phone/register",
            post(|| async { Json(json!({"success": true})) }),
        );
    serve(app).await
}

fn whatsapp_channel() -> Channel {
    Channel::new(
        Uuid::new_v4(),
        "wa".to_string(),
        ChannelKind::WhatsApp,
        json!({
            "whatsappCode": "abc",
            "phone_number_id": "1",
            "waba_id": "2",
            "business_id": "3",
        }),
    )
}

#[tokio::test]
async fn whatsapp_handshake_provisions_token_pin_and_webhook() {
    let store = Arc::new(MemoryStore::new());
    let notifier = RecordingNotifier::new();
    let ctx = context(store.clone(), notifier.clone());
    let handshake = WhatsAppHandshake::with_base_url(mock_whatsapp(true).await);

    let mut channel = whatsapp_channel();
    store.insert_channel(&channel).await.unwrap();

    handshake.create(&ctx, &mut channel).await.unwrap();

    assert_eq!(
        notifier.statuses(),
        vec![
            "fetched access token".to_string(),
            "webhook registered".to_string(),
            "phone registered".to_string(),
        ]
    );
    assert_eq!(channel.secret_str("permanentAccessToken"), Some("permanent-token"));
    assert!(channel.secrets.get("pin").and_then(|v| v.as_u64()).is_some());
    assert!(channel.secret_str("verifyToken").is_some());
    // the one-shot code never survives the exchange
    assert!(channel.config_str("whatsappCode").is_none());
    assert_eq!(
        channel.webhook_url.as_deref(),
        Some(format!("https://bots.example.com/webhook/whatsapp/{}", channel.id).as_str())
    );
}

#[tokio::test]
async fn whatsapp_code_exchange_failure_is_401_with_exact_message() {
    let store = Arc::new(MemoryStore::new());
    let notifier = RecordingNotifier::new();
    let ctx = context(store.clone(), notifier.clone());
    let handshake = WhatsAppHandshake::with_base_url(mock_whatsapp(false).await);

    let mut channel = whatsapp_channel();
    store.insert_channel(&channel).await.unwrap();

    let err = handshake.create(&ctx, &mut channel).await.unwrap_err();
    assert_eq!(err.status_code(), 401);
    match err {
        ChannelError::InvalidCredentials(message) => {
            assert_eq!(message, "whatsapp code verification failed");
        }
        other => panic!("unexpected error: {}", other),
    }
    assert!(channel.secret_str("permanentAccessToken").is_none());
    // the record survives with its partial config for a later retry
    let persisted = store.channel(channel.id).await.unwrap().unwrap();
    assert_eq!(persisted.config_str("phone_number_id"), Some("1"));
}
