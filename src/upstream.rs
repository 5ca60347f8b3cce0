//! Upstream Fetcher: issues the HTTP POST carrying the client's raw
//! OCSP request body to the responder named in `Host`, and validates
//! response framing.

use std::time::Duration;

use reqwest::Client;

use crate::error::{OcspxyError, Result};
use crate::metrics;

#[derive(Clone)]
pub struct Fetcher {
    client: Client,
}

impl Fetcher {
    pub fn new(timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent("ocspxy")
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client }
    }

    /// `Fetch(responderHost, requestBytes) -> (responseBytes, err)`.
    pub async fn fetch(&self, responder_host: &str, request_bytes: &[u8]) -> Result<Vec<u8>> {
        let url = format!("http://{responder_host}/");

        let response = self
            .client
            .post(&url)
            .header("Host", responder_host)
            .header("Content-Type", "application/ocsp-request")
            .header("Content-Length", request_bytes.len().to_string())
            .body(request_bytes.to_vec())
            .send()
            .await
            .map_err(|e| {
                metrics::record_upstream_fetch("transport_error");
                OcspxyError::UpstreamTransport {
                    responder: responder_host.to_string(),
                    source: e,
                }
            })?;

        if response.status().as_u16() != 200 {
            metrics::record_upstream_fetch("bad_status");
            return Err(OcspxyError::UpstreamStatus {
                responder: responder_host.to_string(),
                status: response.status().as_u16(),
            });
        }

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        if content_type.as_deref() != Some("application/ocsp-response") {
            metrics::record_upstream_fetch("bad_content_type");
            return Err(OcspxyError::UpstreamContentType {
                responder: responder_host.to_string(),
                content_type,
            });
        }

        let body = response.bytes().await.map_err(|e| {
            metrics::record_upstream_fetch("transport_error");
            OcspxyError::UpstreamTransport {
                responder: responder_host.to_string(),
                source: e,
            }
        })?;

        metrics::record_upstream_fetch("success");
        Ok(body.to_vec())
    }

    /// `FetchRaw(responderHost, requestBytes) -> RawResponse`. Used by the
    /// multi-request bypass path, which must relay the upstream's status,
    /// headers, and body unchanged rather than validating them the way
    /// the cached miss path does. Only a genuine transport failure is an
    /// error here; any HTTP status or content-type the responder sends
    /// back is passed through as-is.
    pub async fn fetch_raw(&self, responder_host: &str, request_bytes: &[u8]) -> Result<RawResponse> {
        let url = format!("http://{responder_host}/");

        let response = self
            .client
            .post(&url)
            .header("Host", responder_host)
            .header("Content-Type", "application/ocsp-request")
            .header("Content-Length", request_bytes.len().to_string())
            .body(request_bytes.to_vec())
            .send()
            .await
            .map_err(|e| {
                metrics::record_upstream_fetch("transport_error");
                OcspxyError::UpstreamTransport {
                    responder: responder_host.to_string(),
                    source: e,
                }
            })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        let body = response.bytes().await.map_err(|e| {
            metrics::record_upstream_fetch("transport_error");
            OcspxyError::UpstreamTransport {
                responder: responder_host.to_string(),
                source: e,
            }
        })?;

        metrics::record_upstream_fetch("bypass_relayed");
        Ok(RawResponse {
            status,
            headers,
            body: body.to_vec(),
        })
    }
}

/// An upstream HTTP response captured verbatim, for paths that must
/// relay it unchanged rather than validate and extract just the body.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}
