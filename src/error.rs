//! Crate-wide error taxonomy.

use thiserror::Error;

/// Every fallible operation in the cache coordination layer returns this
/// error type (or a `Result` aliased to it). Propagation stops at the
/// request or refresh-cycle boundary; nothing here is allowed to cross
/// into another request's handling.
#[derive(Debug, Error)]
pub enum OcspxyError {
    #[error("malformed OCSP ASN.1: {0}")]
    Decode(String),

    #[error("upstream transport error contacting {responder}: {source}")]
    UpstreamTransport {
        responder: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("upstream {responder} returned HTTP status {status}")]
    UpstreamStatus { responder: String, status: u16 },

    #[error("upstream {responder} returned unexpected content-type {content_type:?}")]
    UpstreamContentType {
        responder: String,
        content_type: Option<String>,
    },

    #[error("OCSP responder returned non-successful responseStatus: {0:?}")]
    ResponderStatusNonSuccess(x509_ocsp::OcspResponseStatus),

    #[error("cache store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("cache store entry corrupt for key {key}: {reason}")]
    StoreCorrupt { key: String, reason: String },

    #[error("response uncacheable: {0}")]
    Uncacheable(String),
}

pub type Result<T> = std::result::Result<T, OcspxyError>;
