use std::sync::Arc;

use crate::bot::runtime::AgentRuntime;
use crate::channels::{HandshakeContext, HandshakeRegistry};
use crate::config::AppConfig;
use crate::jobs::JobQueue;
use crate::shared::notify::ProgressNotifier;
use crate::store::Store;

/// Process-wide dependencies shared by every HTTP handler.
pub struct AppState {
    pub config: AppConfig,
    pub store: Arc<dyn Store>,
    pub runtime: Arc<dyn AgentRuntime>,
    pub handshakes: HandshakeRegistry,
    pub http: reqwest::Client,
    pub notifier: Arc<dyn ProgressNotifier>,
    pub jobs: JobQueue,
}

impl AppState {
    pub fn handshake_ctx(&self) -> HandshakeContext {
        HandshakeContext {
            store: self.store.clone(),
            http: self.http.clone(),
            config: self.config.clone(),
            notifier: self.notifier.clone(),
        }
    }
}
