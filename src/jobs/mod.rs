//! Background job processing.
//!
//! Crawl jobs follow the same discipline as channel handshakes: every state
//! transition is persisted on the content item (status + append-only
//! report), and completion of the last outstanding job for a collection
//! flips the collection to active and emits a progress notification.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{error, info};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Semaphore};
use uuid::Uuid;

use crate::shared::notify::{ProgressEvent, ProgressNotifier};
use crate::store::Store;

/// Bounded parallelism for external fetches.
pub const WORKER_COUNT: usize = 3;
pub const MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Collection {
    pub id: Uuid,
    pub business_id: Uuid,
    pub name: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

impl Collection {
    pub fn new(business_id: Uuid, name: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            business_id,
            name,
            status: "ingesting".to_string(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentItem {
    pub id: Uuid,
    pub collection_id: Uuid,
    pub target: String,
    pub status: String,
    pub report: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl ContentItem {
    pub fn new(collection_id: Uuid, target: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            collection_id,
            target,
            status: "queued".to_string(),
            report: Vec::new(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CrawlJob {
    pub target: String,
    pub collection_id: Uuid,
    pub item_id: Uuid,
    pub attempts: u32,
}

#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<CrawlJob>,
}

impl JobQueue {
    /// Spawn the dispatcher and worker pool.
    pub fn start(
        store: Arc<dyn Store>,
        notifier: Arc<dyn ProgressNotifier>,
        http: reqwest::Client,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<CrawlJob>(256);
        let retry_tx = tx.clone();

        tokio::spawn(async move {
            let semaphore = Arc::new(Semaphore::new(WORKER_COUNT));
            while let Some(job) = rx.recv().await {
                let permit = match semaphore.clone().acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => break,
                };
                let store = store.clone();
                let notifier = notifier.clone();
                let http = http.clone();
                let retry_tx = retry_tx.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    process_job(job, store, notifier, http, retry_tx).await;
                });
            }
        });

        Self { tx }
    }

    pub async fn enqueue(&self, job: CrawlJob) -> bool {
        self.tx.send(job).await.is_ok()
    }
}

async fn process_job(
    mut job: CrawlJob,
    store: Arc<dyn Store>,
    notifier: Arc<dyn ProgressNotifier>,
    http: reqwest::Client,
    retry_tx: mpsc::Sender<CrawlJob>,
) {
    job.attempts += 1;
    let _ = store
        .update_content_item(
            job.item_id,
            "crawling",
            format!("attempt {}: fetching {}", job.attempts, job.target),
        )
        .await;
    notifier.notify(ProgressEvent::CrawlItem {
        collection_id: job.collection_id,
        item_id: job.item_id,
        status: "crawling".to_string(),
    });

    match fetch(&http, &job.target).await {
        Ok(bytes) => {
            let _ = store
                .update_content_item(job.item_id, "done", format!("fetched {} bytes", bytes))
                .await;
            notifier.notify(ProgressEvent::CrawlItem {
                collection_id: job.collection_id,
                item_id: job.item_id,
                status: "done".to_string(),
            });
        }
        Err(e) if job.attempts < MAX_ATTEMPTS => {
            let _ = store
                .update_content_item(job.item_id, "queued", format!("retrying after: {}", e))
                .await;
            if retry_tx.send(job.clone()).await.is_err() {
                error!("crawl retry queue closed, dropping job for {}", job.target);
            }
            return;
        }
        Err(e) => {
            let _ = store
                .update_content_item(job.item_id, "failed", format!("giving up: {}", e))
                .await;
            notifier.notify(ProgressEvent::CrawlItem {
                collection_id: job.collection_id,
                item_id: job.item_id,
                status: "failed".to_string(),
            });
        }
    }

    // Last outstanding job flips the collection to active.
    match store.outstanding_items(job.collection_id).await {
        Ok(0) => {
            if store
                .set_collection_status(job.collection_id, "active")
                .await
                .is_ok()
            {
                info!("collection {} fully ingested", job.collection_id);
                notifier.notify(ProgressEvent::CollectionActive {
                    collection_id: job.collection_id,
                });
            }
        }
        Ok(_) => {}
        Err(e) => error!("outstanding-item count failed: {}", e),
    }
}

async fn fetch(http: &reqwest::Client, target: &str) -> Result<usize, String> {
    let response = http
        .get(target)
        .send()
        .await
        .map_err(|e| e.to_string())?;
    if !response.status().is_success() {
        return Err(format!("status {}", response.status()));
    }
    let body = response.bytes().await.map_err(|e| e.to_string())?;
    Ok(body.len())
}
