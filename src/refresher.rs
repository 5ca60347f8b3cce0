//! Refresher: the periodic background loop that proactively re-validates
//! cached entries before they expire.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use pingora::server::ShutdownWatch;
use pingora::services::background::BackgroundService;

use crate::cache::{is_refetch_due, CacheEntry};
use crate::codec;
use crate::metrics;
use crate::state::SharedState;
use crate::store::CacheStore;
use crate::writer::{self, WriteIntent};

const CYCLE_SLEEP: Duration = Duration::from_secs(1800);

pub struct Refresher {
    pub state: SharedState,
}

impl Refresher {
    pub fn new(state: SharedState) -> Self {
        Self { state }
    }

    async fn run_cycle(&self) {
        let now = now_unix();

        let keys = match self.state.store.list_keys(&self.state.config.key_prefix).await {
            Ok(keys) => keys,
            Err(e) => {
                tracing::error!(error = %e, "refresher: ListKeys failed, skipping cycle");
                metrics::record_refresh_cycle("list_keys_failed");
                return;
            }
        };

        for key in keys {
            if let Err(e) = self.refresh_key(&key, now).await {
                tracing::error!(error = %e, cache_key = %key, "refresher: aborting cycle");
                metrics::record_refresh_cycle("get_failed");
                return;
            }
        }

        metrics::record_refresh_cycle("completed");
    }

    async fn refresh_key(&self, key: &str, now: i64) -> crate::error::Result<()> {
        let entry = match self.state.store.get(key).await? {
            Some(entry) => entry,
            None => return Ok(()),
        };

        if !entry.satisfies_persist_invariants() {
            writer::enqueue(&self.state.write_tx, WriteIntent::Delete(key.to_string()));
            return Ok(());
        }

        if !is_refetch_due(entry.thisupd, entry.nextupd, entry.lastchecked, now) {
            return Ok(());
        }

        match self
            .state
            .fetcher
            .fetch(&entry.ocsp_responder, &entry.request)
            .await
        {
            Ok(response_bytes) => match codec::decode_response(&response_bytes) {
                Ok(decoded) => {
                    let refreshed = CacheEntry {
                        cache_key: key.to_string(),
                        ocsp_responder: entry.ocsp_responder.clone(),
                        request: entry.request.clone(),
                        response: response_bytes,
                        thisupd: decoded.this_update,
                        nextupd: decoded.next_update,
                        lastchecked: now,
                        status: decoded.cert_status,
                        nonce: decoded.nonce_count as u32,
                    };
                    if decoded.nonce_count == 0 {
                        writer::enqueue(&self.state.write_tx, WriteIntent::Upsert(refreshed));
                    } else {
                        tracing::debug!(cache_key = %key, "refresh response carries a nonce, skipping persistence");
                    }
                }
                Err(e) => {
                    // No deletion on transient failure during refresh.
                    tracing::warn!(error = %e, cache_key = %key, "refresher: decode failed");
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, cache_key = %key, "refresher: fetch failed");
            }
        }

        Ok(())
    }
}

impl BackgroundService for Refresher {
    fn start<'life0, 'async_trait>(
        &'life0 self,
        mut shutdown: ShutdownWatch,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'async_trait>>
    where
        'life0: 'async_trait,
        Self: 'async_trait,
    {
        Box::pin(async move {
            loop {
                tokio::select! {
                    _ = self.run_cycle() => {}
                    _ = shutdown.changed() => {
                        tracing::info!("refresher shutting down");
                        return;
                    }
                }
                tokio::select! {
                    _ = tokio::time::sleep(CYCLE_SLEEP) => {}
                    _ = shutdown.changed() => {
                        tracing::info!("refresher shutting down");
                        return;
                    }
                }
            }
        })
    }
}

fn now_unix() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}
