//! Caching forward proxy for OCSP.
//!
//! Sits between TLS-serving web servers and external OCSP responders.
//! Clients POST DER-encoded OCSP requests; responses are served from a
//! Redis-backed cache when fresh, or fetched from the upstream
//! responder named in the client's `Host` header otherwise. A
//! background refresher proactively re-validates cached entries on a
//! two-tier schedule so the serving path rarely pays upstream latency.
//!
//! The cache key intentionally omits the issuer name hash, using only
//! the issuer key hash and certificate serial. Two CAs sharing an
//! issuer key hash (unlikely, not impossible) would collide; this is a
//! preserved, documented limitation rather than an oversight.

pub mod cache;
pub mod codec;
pub mod config;
pub mod error;
pub mod metrics;
pub mod proxy;
pub mod refresher;
pub mod state;
pub mod store;
pub mod upstream;
pub mod writer;
