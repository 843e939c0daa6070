use uuid::Uuid;

/// Progress events emitted by long-running flows (handshakes, crawls).
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    HandshakeStep { channel_id: Uuid, status: String },
    CrawlItem { collection_id: Uuid, item_id: Uuid, status: String },
    CollectionActive { collection_id: Uuid },
}

/// Notification port. Components that emit progress take this injected
/// rather than reaching for a shared socket handle.
pub trait ProgressNotifier: Send + Sync {
    fn notify(&self, event: ProgressEvent);
}

/// Default sink: structured log lines only.
pub struct LogNotifier;

impl ProgressNotifier for LogNotifier {
    fn notify(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::HandshakeStep { channel_id, status } => {
                log::info!("channel {} handshake: {}", channel_id, status);
            }
            ProgressEvent::CrawlItem {
                collection_id,
                item_id,
                status,
            } => {
                log::info!(
                    "collection {} item {} crawl: {}",
                    collection_id,
                    item_id,
                    status
                );
            }
            ProgressEvent::CollectionActive { collection_id } => {
                log::info!("collection {} is now active", collection_id);
            }
        }
    }
}
