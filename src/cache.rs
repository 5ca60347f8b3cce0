//! The `CacheEntry` record, key derivation, and the pure scheduling
//! arithmetic shared between the Request Handler and the Refresher.

use crate::codec::CertStatus;

/// A record stored in the shared key-value store under `cache_key`.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub cache_key: String,
    pub ocsp_responder: String,
    pub request: Vec<u8>,
    pub response: Vec<u8>,
    pub thisupd: i64,
    pub nextupd: i64,
    pub lastchecked: i64,
    pub status: CertStatus,
    pub nonce: u32,
}

impl CacheEntry {
    /// An entry is fresh iff `nextupd > now`, `thisupd > 0`, and both
    /// `request` and `response` are present. Equality (`nextupd == now`)
    /// is deliberately not fresh.
    pub fn is_fresh(&self, now: i64) -> bool {
        self.nextupd > now
            && self.thisupd > 0
            && !self.request.is_empty()
            && !self.response.is_empty()
    }

    /// A persisted entry always has non-empty `request`/`response`/
    /// `ocsp_responder` and `thisupd > 0`. Used by the Refresher to
    /// detect malformed entries that should be evicted.
    pub fn satisfies_persist_invariants(&self) -> bool {
        !self.request.is_empty()
            && !self.response.is_empty()
            && !self.ocsp_responder.is_empty()
            && self.thisupd > 0
    }
}

/// `cache_key = <prefix> || lowercase_hex(issuerKeyHash) || "_" || lowercase_hex(serialNumber)`.
///
/// The issuer name hash is deliberately excluded; two CAs that happened
/// to share an issuer key hash would collide here. That is a known,
/// preserved limitation, not an oversight.
pub fn derive_cache_key(prefix: &str, issuer_key_hash: &[u8], serial_number: &[u8]) -> String {
    format!(
        "{prefix}{}_{}",
        hex::encode(issuer_key_hash),
        hex::encode(serial_number)
    )
}

/// The midpoint-based two-tier re-validation interval, in seconds.
///
/// `midpoint = thisupd + (nextupd - thisupd) / 2`. While comfortably in
/// the first half of validity (`midpoint > now`) entries are
/// re-validated once a day; past the midpoint, hourly.
pub fn revalidation_interval_secs(thisupd: i64, nextupd: i64, now: i64) -> i64 {
    let midpoint = thisupd + (nextupd - thisupd) / 2;
    if midpoint > now {
        86_400
    } else {
        3_600
    }
}

/// Whether a refetch is due: `lastchecked + interval < now`.
pub fn is_refetch_due(thisupd: i64, nextupd: i64, lastchecked: i64, now: i64) -> bool {
    let interval = revalidation_interval_secs(thisupd, nextupd, now);
    lastchecked + interval < now
}
