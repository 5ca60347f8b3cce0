//! ASN.1 decode logic for OCSP requests and responses.
//!
//! Decodes just enough of each structure to make caching decisions: the
//! codec is deliberately lenient about anything it doesn't need (unknown
//! extensions are ignored, optional fields default to absent) and never
//! panics on attacker-controlled input.

use der::asn1::{BitString, GeneralizedTime, UtcTime};
use der::{Decode, Encode, Reader, Sequence, Tag};
use x509_cert::spki::AlgorithmIdentifierOwned;
use x509_ocsp::{CertId, Extensions, ResponderId, Version};

use crate::error::{OcspxyError, Result};

const NONCE_OID: &str = "1.3.6.1.5.5.7.48.1.2";

/// The fields of the first (and, on the request path, only) `CertId` in
/// a decoded OCSP request, plus how many requests the request list held.
#[derive(Debug, Clone)]
pub struct DecodedRequest {
    pub request_count: usize,
    pub issuer_key_hash: Vec<u8>,
    pub serial_number: Vec<u8>,
}

/// Observed certificate status, mirroring the OCSP CHOICE tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertStatus {
    Good,
    Revoked,
    Unknown,
}

impl CertStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CertStatus::Good => "good",
            CertStatus::Revoked => "revoked",
            CertStatus::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "good" => Some(CertStatus::Good),
            "revoked" => Some(CertStatus::Revoked),
            "unknown" => Some(CertStatus::Unknown),
            _ => None,
        }
    }
}

/// The fields of the first `SingleResponse` in a decoded OCSP response,
/// plus the top-level responseStatus and a count of nonce extensions.
#[derive(Debug, Clone)]
pub struct DecodedResponse {
    pub response_status: x509_ocsp::OcspResponseStatus,
    pub this_update: i64,
    pub next_update: i64,
    pub cert_status: CertStatus,
    pub nonce_count: usize,
}

/// Decode an incoming client OCSP request enough to compute a cache key
/// and to detect the multi-request-bypass condition.
pub fn decode_request(bytes: &[u8]) -> Result<DecodedRequest> {
    let request = x509_ocsp::OcspRequest::from_der(bytes)
        .map_err(|e| OcspxyError::Decode(format!("OCSPRequest: {e}")))?;

    let request_count = request.tbs_request.request_list.len();

    let first = request
        .tbs_request
        .request_list
        .first()
        .ok_or_else(|| OcspxyError::Decode("OCSPRequest: empty requestList".to_string()))?;

    Ok(DecodedRequest {
        request_count,
        issuer_key_hash: first.req_cert.issuer_key_hash.as_bytes().to_vec(),
        serial_number: serial_bytes_no_sign_pad(first.req_cert.serial_number.as_bytes()),
    })
}

/// Decode an upstream OCSP response enough to extract `thisUpdate`,
/// `nextUpdate`, `certStatus`, and whether a nonce extension is present.
///
/// The OCSP wire format nests a `BasicOCSPResponse` inside an OCTET
/// STRING inside the outer `OCSPResponse`; this is a genuine two-decode
/// operation rather than a single pass.
///
/// RFC 6960 types `thisUpdate`/`nextUpdate` as `GeneralizedTime`, but
/// some responders in the wild emit `UTCTime` instead. `x509_ocsp`'s
/// `SingleResponse` hard-codes `GeneralizedTime`, so a `UTCTime`-bearing
/// response fails that crate's decode entirely; when that happens, retry
/// with a local structure that is identical except its per-response time
/// fields accept either tag.
pub fn decode_response(bytes: &[u8]) -> Result<DecodedResponse> {
    let response = x509_ocsp::OcspResponse::from_der(bytes)
        .map_err(|e| OcspxyError::Decode(format!("OCSPResponse: {e}")))?;

    if response.response_status != x509_ocsp::OcspResponseStatus::Successful {
        return Err(OcspxyError::ResponderStatusNonSuccess(
            response.response_status,
        ));
    }

    let response_bytes = response
        .response_bytes
        .as_ref()
        .ok_or_else(|| OcspxyError::Decode("OCSPResponse: missing responseBytes".to_string()))?;

    let basic_der = response_bytes.response.as_bytes();

    let extracted = match x509_ocsp::BasicOcspResponse::from_der(basic_der) {
        Ok(basic) => extract_from_strict(&basic)?,
        Err(strict_err) => {
            let lenient = LenientBasicOcspResponse::from_der(basic_der)
                .map_err(|_| OcspxyError::Decode(format!("BasicOCSPResponse: {strict_err}")))?;
            extract_from_lenient(&lenient)?
        }
    };

    Ok(DecodedResponse {
        response_status: response.response_status,
        this_update: extracted.this_update,
        next_update: extracted.next_update,
        cert_status: extracted.cert_status,
        nonce_count: extracted.nonce_count,
    })
}

struct Extracted {
    this_update: i64,
    next_update: i64,
    cert_status: CertStatus,
    nonce_count: usize,
}

fn count_nonce(extensions: &Option<Extensions>) -> usize {
    extensions
        .as_ref()
        .map(|exts| {
            exts.iter()
                .filter(|ext| ext.extn_id == der::asn1::ObjectIdentifier::new_unwrap(NONCE_OID))
                .count()
        })
        .unwrap_or(0)
}

fn map_cert_status(status: &x509_ocsp::CertStatus) -> CertStatus {
    match status {
        x509_ocsp::CertStatus::Good(_) => CertStatus::Good,
        x509_ocsp::CertStatus::Revoked(_) => CertStatus::Revoked,
        x509_ocsp::CertStatus::Unknown(_) => CertStatus::Unknown,
    }
}

fn extract_from_strict(basic: &x509_ocsp::BasicOcspResponse) -> Result<Extracted> {
    let nonce_count = count_nonce(&basic.tbs_response_data.response_extensions);
    let single = basic
        .tbs_response_data
        .responses
        .first()
        .ok_or_else(|| OcspxyError::Decode("BasicOCSPResponse: empty responses".to_string()))?;

    Ok(Extracted {
        this_update: single.this_update.0.to_unix_duration().as_secs() as i64,
        next_update: single
            .next_update
            .as_ref()
            .map(|t| t.0.to_unix_duration().as_secs() as i64)
            .unwrap_or(0),
        cert_status: map_cert_status(&single.cert_status),
        nonce_count,
    })
}

fn extract_from_lenient(basic: &LenientBasicOcspResponse) -> Result<Extracted> {
    let nonce_count = count_nonce(&basic.tbs_response_data.response_extensions);
    let single = basic
        .tbs_response_data
        .responses
        .first()
        .ok_or_else(|| OcspxyError::Decode("BasicOCSPResponse: empty responses".to_string()))?;

    Ok(Extracted {
        this_update: single.this_update.0,
        next_update: single.next_update.map(|t| t.0).unwrap_or(0),
        cert_status: map_cert_status(&single.cert_status),
        nonce_count,
    })
}

/// `thisUpdate`/`nextUpdate` accepting either `GeneralizedTime` (tag 0x18)
/// or `UTCTime` (tag 0x17). Stores the value already converted to Unix
/// seconds since the two source types don't share a common Rust type.
#[derive(Debug, Clone, Copy)]
struct FlexibleTime(i64);

impl<'a> Decode<'a> for FlexibleTime {
    type Error = der::Error;

    fn decode<R: Reader<'a>>(reader: &mut R) -> der::Result<Self> {
        match reader.peek_tag()? {
            Tag::GeneralizedTime => {
                let t = GeneralizedTime::decode(reader)?;
                Ok(FlexibleTime(t.0.to_unix_duration().as_secs() as i64))
            }
            _ => {
                let t = UtcTime::decode(reader)?;
                Ok(FlexibleTime(t.0.to_unix_duration().as_secs() as i64))
            }
        }
    }
}

impl Encode for FlexibleTime {
    fn encoded_len(&self) -> der::Result<der::Length> {
        GeneralizedTime::from_unix_duration(std::time::Duration::from_secs(self.0.max(0) as u64))?
            .encoded_len()
    }

    fn encode(&self, writer: &mut impl der::Writer) -> der::Result<()> {
        GeneralizedTime::from_unix_duration(std::time::Duration::from_secs(self.0.max(0) as u64))?
            .encode(writer)
    }
}

/// Mirrors `x509_ocsp::SingleResponse`, but with a `thisUpdate`/
/// `nextUpdate` type lenient to both ASN.1 time tags.
#[derive(Sequence)]
struct LenientSingleResponse {
    cert_id: CertId,
    cert_status: x509_ocsp::CertStatus,
    this_update: FlexibleTime,
    #[asn1(context_specific = "0", tag_mode = "EXPLICIT", optional = "true")]
    next_update: Option<FlexibleTime>,
    #[asn1(context_specific = "1", tag_mode = "EXPLICIT", optional = "true")]
    single_extensions: Option<der::Any>,
}

/// Mirrors `x509_ocsp::ResponseData`, with `responses` built from
/// `LenientSingleResponse` instead of the crate's fixed-tag type.
#[derive(Sequence)]
struct LenientResponseData {
    #[asn1(context_specific = "0", tag_mode = "EXPLICIT", optional = "true")]
    version: Option<Version>,
    responder_id: ResponderId,
    produced_at: GeneralizedTime,
    responses: Vec<LenientSingleResponse>,
    #[asn1(context_specific = "1", tag_mode = "EXPLICIT", optional = "true")]
    response_extensions: Option<Extensions>,
}

/// Mirrors `x509_ocsp::BasicOcspResponse`. `certs` is left opaque; this
/// codec never needs the embedded certificate chain.
#[derive(Sequence)]
struct LenientBasicOcspResponse {
    tbs_response_data: LenientResponseData,
    signature_algorithm: AlgorithmIdentifierOwned,
    signature: BitString,
    #[asn1(context_specific = "0", tag_mode = "EXPLICIT", optional = "true")]
    certs: Option<Vec<der::Any>>,
}

/// DER INTEGER encodes a leading 0x00 byte when the high bit of the
/// first content byte would otherwise be mistaken for a sign bit. The
/// cache key must hex-encode the serial with no such padding, so strip
/// a leading zero byte when the remainder is still non-empty and its
/// own high bit is set (the only case the padding byte exists for).
fn serial_bytes_no_sign_pad(bytes: &[u8]) -> Vec<u8> {
    if bytes.len() > 1 && bytes[0] == 0x00 && bytes[1] & 0x80 != 0 {
        bytes[1..].to_vec()
    } else {
        bytes.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use x509_cert::serial_number::SerialNumber;
    use x509_ocsp::{CertId, OcspRequest, Request, TbsRequest};

    fn build_request_der(issuer_key_hash: &[u8], serial: &[u8]) -> Vec<u8> {
        let cert_id = CertId {
            hash_algorithm: AlgorithmIdentifierOwned {
                oid: der::asn1::ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.2.1"),
                parameters: None,
            },
            issuer_name_hash: der::asn1::OctetString::new(vec![0xAA; 32]).unwrap(),
            issuer_key_hash: der::asn1::OctetString::new(issuer_key_hash.to_vec()).unwrap(),
            serial_number: SerialNumber::new(serial).unwrap(),
        };

        let tbs_request = TbsRequest {
            version: x509_ocsp::Version::V1,
            requestor_name: None,
            request_list: vec![Request {
                req_cert: cert_id,
                single_request_extensions: None,
            }],
            request_extensions: None,
        };

        let request = OcspRequest {
            tbs_request,
            optional_signature: None,
        };

        request.to_der().unwrap()
    }

    #[test]
    fn cert_status_round_trips_through_str() {
        for s in [CertStatus::Good, CertStatus::Revoked, CertStatus::Unknown] {
            assert_eq!(CertStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(CertStatus::parse("bogus"), None);
    }

    #[test]
    fn serial_strips_single_sign_pad_byte() {
        assert_eq!(serial_bytes_no_sign_pad(&[0x00, 0x80, 0x01]), vec![0x80, 0x01]);
        assert_eq!(serial_bytes_no_sign_pad(&[0x7f, 0x01]), vec![0x7f, 0x01]);
        assert_eq!(serial_bytes_no_sign_pad(&[0x00, 0x01]), vec![0x00, 0x01]);
        assert_eq!(serial_bytes_no_sign_pad(&[0x00]), vec![0x00]);
    }

    #[test]
    fn decode_request_rejects_garbage() {
        let err = decode_request(&[0x01, 0x02, 0x03]).unwrap_err();
        assert!(matches!(err, OcspxyError::Decode(_)));
    }

    #[test]
    fn decode_request_extracts_issuer_key_hash_and_serial() {
        let der_bytes = build_request_der(&[0xBB; 32], &[0x01, 0x02, 0x03]);
        let decoded = decode_request(&der_bytes).unwrap();
        assert_eq!(decoded.request_count, 1);
        assert_eq!(decoded.issuer_key_hash, vec![0xBB; 32]);
        assert_eq!(decoded.serial_number, vec![0x01, 0x02, 0x03]);
    }

    #[test]
    fn decode_request_strips_der_sign_pad_from_serial() {
        // A serial whose high bit is set gets a 0x00 sign-pad byte in DER;
        // the decoder must strip it so the cache key has no leading zero.
        let der_bytes = build_request_der(&[0xCC; 32], &[0x80, 0x01]);
        let decoded = decode_request(&der_bytes).unwrap();
        assert_eq!(decoded.serial_number, vec![0x80, 0x01]);
    }

    #[test]
    fn decode_response_rejects_garbage() {
        let err = decode_response(&[0x01, 0x02, 0x03]).unwrap_err();
        assert!(matches!(err, OcspxyError::Decode(_)));
    }

    #[test]
    fn flexible_time_accepts_generalized_and_utc_tags() {
        use der::asn1::{GeneralizedTime, UtcTime};
        use std::time::Duration;

        let secs = 1_700_000_000u64;
        let gt = GeneralizedTime::from_unix_duration(Duration::from_secs(secs)).unwrap();
        let gt_der = gt.to_der().unwrap();
        let decoded_gt = FlexibleTime::from_der(&gt_der).unwrap();
        assert_eq!(decoded_gt.0, secs as i64);

        // UTCTime only encodes a two-digit year; pick a timestamp safely
        // inside its representable range.
        let utc_secs = 1_600_000_000u64;
        let ut = UtcTime::from_unix_duration(Duration::from_secs(utc_secs)).unwrap();
        let ut_der = ut.to_der().unwrap();
        let decoded_ut = FlexibleTime::from_der(&ut_der).unwrap();
        assert_eq!(decoded_ut.0, utc_secs as i64);
    }
}
