use std::sync::Arc;

use log::info;
use tower_http::cors::CorsLayer;

use agentserver::bot::runtime::OpenAiRuntime;
use agentserver::channels::HandshakeRegistry;
use agentserver::config::AppConfig;
use agentserver::jobs::JobQueue;
use agentserver::shared::notify::LogNotifier;
use agentserver::shared::state::AppState;
use agentserver::store::memory::MemoryStore;
use agentserver::{api, webhooks};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = AppConfig::from_env()?;
    let http = reqwest::Client::new();
    let store = Arc::new(MemoryStore::new());
    let notifier = Arc::new(LogNotifier);
    let runtime = Arc::new(OpenAiRuntime::new(http.clone(), &config.llm));
    let jobs = JobQueue::start(store.clone(), notifier.clone(), http.clone());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let state = Arc::new(AppState {
        config,
        store,
        runtime,
        handshakes: HandshakeRegistry::with_defaults(),
        http,
        notifier,
        jobs,
    });

    let app = api::configure()
        .merge(webhooks::configure())
        .layer(CorsLayer::permissive())
        .with_state(state);

    info!("agentserver listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
