//! Write Serializer: the single-consumer queue that funnels every
//! mutating cache operation through one writer, making concurrent
//! handler+refresher upserts on the same key deterministic ("last
//! enqueued wins") without any locking protocol between producers.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use pingora::server::ShutdownWatch;
use pingora::services::background::BackgroundService;
use tokio::sync::mpsc;

use crate::cache::CacheEntry;
use crate::metrics;
use crate::store::CacheStore;

/// A single write intent: either replace an entry in full, or remove it.
#[derive(Debug, Clone)]
pub enum WriteIntent {
    Upsert(CacheEntry),
    Delete(String),
}

pub type WriteSender = mpsc::UnboundedSender<WriteIntent>;

/// Enqueue an intent non-blockingly. Per §4.4, handler-class intents
/// must never be dropped; an unbounded channel gives that for free at
/// the scale this proxy operates at.
pub fn enqueue(tx: &WriteSender, intent: WriteIntent) {
    if tx.send(intent).is_err() {
        tracing::error!("write serializer consumer gone, dropping intent");
    }
}

/// The single consumer task. Applies intents strictly in enqueue order;
/// per-intent store errors are logged and do not stop the consumer.
pub async fn run(mut rx: mpsc::UnboundedReceiver<WriteIntent>, store: Arc<dyn CacheStore>) {
    while let Some(intent) = rx.recv().await {
        metrics::set_write_queue_depth(rx.len() as i64);
        match intent {
            WriteIntent::Upsert(entry) => {
                let key = entry.cache_key.clone();
                if let Err(e) = store.put(&entry).await {
                    tracing::error!(cache_key = %key, error = %e, "write serializer: upsert failed");
                }
            }
            WriteIntent::Delete(key) => {
                if let Err(e) = store.delete(&key).await {
                    tracing::error!(cache_key = %key, error = %e, "write serializer: delete failed");
                }
            }
        }
    }
    tracing::info!("write serializer stopped: all senders dropped");
}

/// Wraps the consumer loop as a `BackgroundService` so the Supervisor
/// can register it like any other long-lived worker.
pub struct WriterService {
    pub rx: Option<mpsc::UnboundedReceiver<WriteIntent>>,
    pub store: Arc<dyn CacheStore>,
}

impl BackgroundService for WriterService {
    fn start<'life0, 'async_trait>(
        &'life0 self,
        mut shutdown: ShutdownWatch,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'async_trait>>
    where
        'life0: 'async_trait,
        Self: 'async_trait,
    {
        // Safe: start is only ever called once per service registration.
        let rx = unsafe {
            let this = self as *const Self as *mut Self;
            (*this).rx.take().expect("start called twice")
        };
        let store = self.store.clone();

        Box::pin(async move {
            tracing::info!("starting write serializer");
            tokio::select! {
                _ = run(rx, store) => {}
                _ = shutdown.changed() => {
                    tracing::info!("write serializer shutting down");
                }
            }
        })
    }
}
