//! Request Handler: the `ProxyHttp` implementation that is the client
//! HTTP surface of §6. Every request this proxy answers is answered
//! entirely inside `request_filter`; Pingora's own peer-routing is
//! never reached, so `upstream_peer` is present only to satisfy the
//! trait.
//!
//! The decision logic (steps 4-9: decode, bypass, key derivation,
//! purge, lookup, miss) lives in `decide`, which takes already-extracted
//! plain values and returns an `Outcome` rather than touching `Session`
//! directly. `handle` is the thin glue that extracts those values from
//! a live `Session` and translates the `Outcome` back into a response.
//! Splitting it this way lets `decide` be exercised directly in tests
//! against an in-memory store and a mocked upstream, without a live
//! Pingora session.

use std::future::Future;
use std::pin::Pin;
use std::time::Instant;

use bytes::Bytes;
use pingora::http::{Method, ResponseHeader, StatusCode};
use pingora::upstreams::peer::HttpPeer;
use pingora::Result;
use pingora_proxy::{ProxyHttp, Session};

use crate::cache::{derive_cache_key, CacheEntry};
use crate::codec;
use crate::metrics;
use crate::state::SharedState;
use crate::store::CacheStore;
use crate::upstream::RawResponse;
use crate::writer::{self, WriteIntent};

pub struct OcspProxy {
    pub state: SharedState,
}

impl OcspProxy {
    pub fn new(state: SharedState) -> Self {
        Self { state }
    }
}

#[derive(Default)]
pub struct RequestCtx {
    pub start: Option<Instant>,
}

/// The result of deciding how to answer a request, before it has been
/// translated into a `Session` write.
#[derive(Debug)]
pub enum Outcome {
    /// A plain status reply with no body (400/403/410/503).
    Status(u16),
    /// Serve this (cached or just-fetched) entry with a 200.
    Served(CacheEntry),
    /// Relay this raw upstream response verbatim (multi-request bypass).
    Relayed(RawResponse),
}

impl ProxyHttp for OcspProxy {
    type CTX = RequestCtx;

    fn new_ctx(&self) -> Self::CTX {
        RequestCtx {
            start: Some(Instant::now()),
        }
    }

    fn request_filter<'life0, 'life1, 'life2, 'async_trait>(
        &'life0 self,
        session: &'life1 mut Session,
        ctx: &'life2 mut Self::CTX,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'async_trait>>
    where
        'life0: 'async_trait,
        'life1: 'async_trait,
        'life2: 'async_trait,
        Self: 'async_trait,
    {
        Box::pin(async move { self.handle(session, ctx).await })
    }

    fn upstream_peer<'life0, 'life1, 'life2, 'async_trait>(
        &'life0 self,
        _session: &'life1 mut Session,
        _ctx: &'life2 mut Self::CTX,
    ) -> Pin<Box<dyn Future<Output = Result<Box<HttpPeer>>> + Send + 'async_trait>>
    where
        'life0: 'async_trait,
        'life1: 'async_trait,
        'life2: 'async_trait,
        Self: 'async_trait,
    {
        // Every real request is fully answered in request_filter, which
        // always returns Ok(true); Pingora should never call this.
        Box::pin(async move {
            Err(pingora::Error::new_str(
                "ocspxy: upstream_peer is unreachable, all requests are handled locally",
            ))
        })
    }
}

impl OcspProxy {
    async fn handle(&self, session: &mut Session, ctx: &mut RequestCtx) -> Result<bool> {
        let method = session.req_header().method.clone();
        let host = session
            .req_header()
            .headers
            .get("host")
            .and_then(|h| h.to_str().ok())
            .map(|s| s.to_string());
        let prune_header = session
            .req_header()
            .headers
            .get("x-prune-from-cache")
            .is_some();
        let content_type = session
            .req_header()
            .headers
            .get("content-type")
            .and_then(|h| h.to_str().ok())
            .map(|s| s.to_string());

        // 1. Method check.
        if method != Method::POST {
            return self.finish(session, ctx, 403, "non-POST method", Bytes::new()).await;
        }

        // 2. Header check: neither Host nor X-prune-from-cache present.
        if host.is_none() && !prune_header {
            return self
                .finish(session, ctx, 400, "missing Host/X-prune-from-cache", Bytes::new())
                .await;
        }

        // 3. Content-Type check.
        if content_type.as_deref() != Some("application/ocsp-request") {
            return self
                .finish(session, ctx, 400, "wrong content-type", Bytes::new())
                .await;
        }

        let body = match session.read_request_body().await {
            Ok(Some(b)) => b,
            Ok(None) => Bytes::new(),
            Err(_) => {
                return self.finish(session, ctx, 400, "failed to read body", Bytes::new()).await;
            }
        };

        match self.decide(host, prune_header, &body).await {
            Outcome::Status(status) => {
                self.finish(session, ctx, status, status_reason(status), Bytes::new()).await
            }
            Outcome::Served(entry) => self.serve(session, ctx, &entry).await,
            Outcome::Relayed(raw) => self.relay(session, ctx, &raw).await,
        }
    }

    /// Steps 4-9 of the request state machine: decode, multi-request
    /// bypass, cache key derivation, purge, lookup, and miss handling.
    /// Pure with respect to `Session`; only touches the store, the
    /// fetcher, and the write-intent queue.
    pub async fn decide(&self, host: Option<String>, prune_header: bool, body: &Bytes) -> Outcome {
        // 4. Decode.
        let decoded = match codec::decode_request(body) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(error = %e, "request decode failed");
                return Outcome::Status(400);
            }
        };

        let host = host.unwrap_or_default();

        // 5. Multi-request bypass: forward verbatim, never cache. The
        // allowlist gates this bypass and the miss-path fetch only —
        // never a warm cache hit.
        if decoded.request_count > 1 {
            if !host.is_empty() && !self.state.config.responder_allowed(&host) {
                return Outcome::Status(403);
            }
            return self.bypass_multi_request(&host, body).await;
        }

        // 6. Compute cache key.
        let cache_key = derive_cache_key(
            &self.state.config.key_prefix,
            &decoded.issuer_key_hash,
            &decoded.serial_number,
        );

        // 7. Purge path.
        if prune_header {
            writer::enqueue(&self.state.write_tx, WriteIntent::Delete(cache_key.clone()));
            metrics::record_request("purge");
            return Outcome::Status(410);
        }

        // 8. Lookup.
        let now = now_unix();
        match self.state.store.get(&cache_key).await {
            Ok(Some(entry)) if entry.is_fresh(now) => {
                metrics::record_request("cache_hit");
                return Outcome::Served(entry);
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(error = %e, cache_key = %cache_key, "store unavailable on lookup");
                metrics::record_request("store_unavailable");
                return Outcome::Status(503);
            }
        }

        // 9. Miss path.
        self.handle_miss(&host, body, &cache_key, now).await
    }

    async fn handle_miss(
        &self,
        host: &str,
        request_body: &Bytes,
        cache_key: &str,
        now: i64,
    ) -> Outcome {
        // The allowlist gates the miss-path fetch, never a cache hit; it
        // is checked here rather than earlier in `decide` so that a warm
        // entry is always served regardless of the allowlist.
        if !self.state.config.responder_allowed(host) {
            return Outcome::Status(403);
        }

        let fetch_result = self.state.fetcher.fetch(host, request_body).await;

        let response_bytes = match fetch_result {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(error = %e, cache_key = %cache_key, "upstream fetch failed on miss");
                self.evict_on_failure(cache_key);
                metrics::record_request("upstream_failure");
                return Outcome::Status(503);
            }
        };

        let decoded_response = match codec::decode_response(&response_bytes) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(error = %e, cache_key = %cache_key, "upstream response decode failed");
                self.evict_on_failure(cache_key);
                metrics::record_request("upstream_failure");
                return Outcome::Status(503);
            }
        };

        let entry = CacheEntry {
            cache_key: cache_key.to_string(),
            ocsp_responder: host.to_string(),
            request: request_body.to_vec(),
            response: response_bytes.clone(),
            thisupd: decoded_response.this_update,
            nextupd: decoded_response.next_update,
            lastchecked: now,
            status: decoded_response.cert_status,
            nonce: decoded_response.nonce_count as u32,
        };

        if decoded_response.nonce_count == 0 {
            writer::enqueue(&self.state.write_tx, WriteIntent::Upsert(entry.clone()));
        } else {
            tracing::debug!(cache_key = %cache_key, "response carries a nonce, skipping persistence");
        }

        metrics::record_request("cache_miss");
        Outcome::Served(entry)
    }

    fn evict_on_failure(&self, cache_key: &str) {
        if self.state.config.evict_on_fetch_failure {
            writer::enqueue(&self.state.write_tx, WriteIntent::Delete(cache_key.to_string()));
        }
    }

    /// Step 5: relay the upstream response unchanged rather than reusing
    /// the validating miss-path `Fetcher::fetch`, which would discard
    /// non-200 statuses and every header but Content-Type/Content-Length.
    async fn bypass_multi_request(&self, host: &str, body: &Bytes) -> Outcome {
        match self.state.fetcher.fetch_raw(host, body).await {
            Ok(raw) => {
                metrics::record_request("bypass");
                Outcome::Relayed(raw)
            }
            Err(e) => {
                tracing::warn!(error = %e, host = %host, "multi-request bypass upstream failure");
                metrics::record_request("bypass_failure");
                Outcome::Status(503)
            }
        }
    }

    /// Step 10: serve a fresh (cached or just-fetched) entry to the client.
    async fn serve(&self, session: &mut Session, ctx: &mut RequestCtx, entry: &CacheEntry) -> Result<bool> {
        let body = Bytes::from(entry.response.clone());
        let mut header = ResponseHeader::build(StatusCode::OK, None)?;
        header.insert_header("Content-Type", "application/ocsp-response")?;
        header.insert_header("Content-Length", body.len().to_string())?;
        header.insert_header("Date", httpdate_now())?;
        header.insert_header("Expires", httpdate(entry.nextupd))?;
        header.insert_header("Last-Modified", httpdate(entry.thisupd))?;

        session.write_response_header(Box::new(header), false).await?;
        session.write_response_body(Some(body.clone()), true).await?;
        self.record_duration(ctx, "200");
        Ok(true)
    }

    /// Relay a raw upstream response (multi-request bypass) with its
    /// actual status code and headers, unlike `finish`, which always
    /// rebuilds a synthetic header set.
    async fn relay(&self, session: &mut Session, ctx: &mut RequestCtx, raw: &RawResponse) -> Result<bool> {
        let status = StatusCode::from_u16(raw.status).unwrap_or(StatusCode::BAD_GATEWAY);
        let mut header = ResponseHeader::build(status, None)?;
        for (name, value) in &raw.headers {
            header.insert_header(name.clone(), value.clone())?;
        }

        session.write_response_header(Box::new(header), false).await?;
        session
            .write_response_body(Some(Bytes::from(raw.body.clone())), true)
            .await?;
        self.record_duration(ctx, &raw.status.to_string());
        Ok(true)
    }

    /// Used for every status-only response path: purge (410), validation
    /// failures (400/403), and upstream/bypass failures (503).
    async fn finish(
        &self,
        session: &mut Session,
        ctx: &mut RequestCtx,
        status: u16,
        reason: &str,
        body: Bytes,
    ) -> Result<bool> {
        tracing::debug!(status, reason, "request finished");
        if body.is_empty() {
            session.respond_error_with_body(status, Bytes::new()).await?;
        } else {
            let mut header = ResponseHeader::build(status, None)?;
            header.insert_header("Content-Type", "application/ocsp-response")?;
            header.insert_header("Content-Length", body.len().to_string())?;
            session.write_response_header(Box::new(header), false).await?;
            session.write_response_body(Some(body), true).await?;
        }
        self.record_duration(ctx, &status.to_string());
        Ok(true)
    }

    fn record_duration(&self, ctx: &RequestCtx, outcome: &str) {
        if let Some(start) = ctx.start {
            metrics::observe_request_duration(outcome, start.elapsed().as_secs_f64());
        }
    }
}

fn status_reason(status: u16) -> &'static str {
    match status {
        400 => "bad request",
        403 => "responder not in allowlist",
        410 => "purged",
        503 => "upstream or store unavailable",
        _ => "request finished",
    }
}

fn now_unix() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

fn httpdate_now() -> String {
    httpdate(now_unix())
}

fn httpdate(unix_secs: i64) -> String {
    use time::format_description::well_known::Rfc2822;
    time::OffsetDateTime::from_unix_timestamp(unix_secs)
        .map(|t| t.format(&Rfc2822).unwrap_or_default())
        .unwrap_or_default()
}
