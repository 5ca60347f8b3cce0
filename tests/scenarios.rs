//! Scenario-level tests for the Request Handler (§4.5/§8), exercising
//! `OcspProxy::decide` directly against an in-memory store and a
//! `wiremock`-mocked upstream responder rather than a live Pingora
//! session.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use ocspxy::cache::CacheEntry;
use ocspxy::codec::CertStatus;
use ocspxy::config::Config;
use ocspxy::proxy::{OcspProxy, Outcome};
use ocspxy::state::{AppState, SharedState};
use ocspxy::store::{CacheStore, MemoryStore};
use ocspxy::upstream::Fetcher;
use ocspxy::writer::WriteIntent;
use tokio::sync::mpsc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const ISSUER_KEY_HASH: [u8; 32] = [0xCC; 32];
const SERIAL: [u8; 3] = [0x01, 0x02, 0x03];
const THIS_UPDATE_STR: &str = "20240101000000Z";
const THIS_UPDATE_UNIX: i64 = 1_704_067_200;
const NEXT_UPDATE_STR: &str = "20260101000000Z";
const NEXT_UPDATE_UNIX: i64 = 1_767_225_600;
const NONCE_OID_BYTES: [u8; 9] = [0x2B, 0x06, 0x01, 0x05, 0x05, 0x07, 0x30, 0x01, 0x02];
const BASIC_RESPONSE_OID_BYTES: [u8; 9] = [0x2B, 0x06, 0x01, 0x05, 0x05, 0x07, 0x30, 0x01, 0x01];
const SHA256_OID_BYTES: [u8; 9] = [0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01];

fn test_config(allowed_responders: Vec<String>) -> Config {
    Config {
        bind_host: "127.0.0.1".into(),
        bind_port: 8888,
        redis_url: "redis://127.0.0.1:6379".into(),
        key_prefix: "ocspxy_".into(),
        verbose: false,
        metrics_bind: "127.0.0.1:9888".into(),
        upstream_timeout: Duration::from_secs(5),
        evict_on_fetch_failure: true,
        allowed_responders,
    }
}

struct TestHarness {
    proxy: OcspProxy,
    store: Arc<MemoryStore>,
    write_rx: mpsc::UnboundedReceiver<WriteIntent>,
}

fn build_harness(config: Config, fetcher: Fetcher) -> TestHarness {
    let store = Arc::new(MemoryStore::new());
    let store_dyn: Arc<dyn CacheStore> = store.clone();
    let (write_tx, write_rx) = mpsc::unbounded_channel();

    let state: SharedState = Arc::new(AppState {
        config,
        store: store_dyn,
        fetcher,
        write_tx,
    });

    TestHarness {
        proxy: OcspProxy::new(state),
        store,
        write_rx,
    }
}

fn responder_host(server: &MockServer) -> String {
    server.uri().trim_start_matches("http://").to_string()
}

// --- DER construction helpers, mirroring RFC 6960's wire layout ---

fn encode_len(buf: &mut Vec<u8>, len: usize) {
    if len < 128 {
        buf.push(len as u8);
    } else if len < 256 {
        buf.push(0x81);
        buf.push(len as u8);
    } else {
        buf.push(0x82);
        buf.push((len >> 8) as u8);
        buf.push((len & 0xFF) as u8);
    }
}

fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    encode_len(&mut out, content.len());
    out.extend_from_slice(content);
    out
}

fn alg_id_sha256() -> Vec<u8> {
    let mut content = tlv(0x06, &SHA256_OID_BYTES);
    content.extend(tlv(0x05, &[]));
    tlv(0x30, &content)
}

fn build_cert_id(issuer_key_hash: &[u8], serial: &[u8]) -> Vec<u8> {
    let issuer_name_hash = [0xAA_u8; 32];
    let mut content = alg_id_sha256();
    content.extend(tlv(0x04, &issuer_name_hash));
    content.extend(tlv(0x04, issuer_key_hash));
    content.extend(tlv(0x02, serial));
    tlv(0x30, &content)
}

fn build_request_der(entries: &[(&[u8], &[u8])]) -> Vec<u8> {
    let mut request_list = Vec::new();
    for (issuer_key_hash, serial) in entries {
        let cert_id = build_cert_id(issuer_key_hash, serial);
        request_list.extend(tlv(0x30, &cert_id)); // Request ::= SEQUENCE { reqCert }
    }
    let request_list = tlv(0x30, &request_list); // requestList SEQUENCE OF Request
    let tbs_request = tlv(0x30, &request_list); // TBSRequest SEQUENCE { requestList }
    tlv(0x30, &tbs_request) // OCSPRequest SEQUENCE { tbsRequest }
}

enum TestCertStatus {
    Good,
    Revoked,
    Unknown,
}

fn build_single_response(cert_id: &[u8], status: &TestCertStatus) -> Vec<u8> {
    let mut content = cert_id.to_vec();
    content.extend(match status {
        TestCertStatus::Good => tlv(0x80, &[]),
        TestCertStatus::Revoked => tlv(0xA1, &tlv(0x18, THIS_UPDATE_STR.as_bytes())),
        TestCertStatus::Unknown => tlv(0x82, &[]),
    });
    content.extend(tlv(0x18, THIS_UPDATE_STR.as_bytes()));
    content.extend(tlv(0xA0, &tlv(0x18, NEXT_UPDATE_STR.as_bytes())));
    tlv(0x30, &content)
}

fn build_response_data(cert_id: &[u8], status: &TestCertStatus, with_nonce: bool) -> Vec<u8> {
    let responder_key_hash = [0xBB_u8; 32];
    let mut content = tlv(0xA2, &tlv(0x04, &responder_key_hash)); // responderID byKey [2] EXPLICIT
    content.extend(tlv(0x18, THIS_UPDATE_STR.as_bytes())); // producedAt

    let single = build_single_response(cert_id, status);
    content.extend(tlv(0x30, &single)); // responses: SEQUENCE OF SingleResponse

    if with_nonce {
        let extension = {
            let mut e = tlv(0x06, &NONCE_OID_BYTES);
            e.extend(tlv(0x04, &[0xDE, 0xAD, 0xBE, 0xEF]));
            tlv(0x30, &e)
        };
        let extensions = tlv(0x30, &extension); // Extensions ::= SEQUENCE OF Extension
        content.extend(tlv(0xA1, &extensions)); // responseExtensions [1] EXPLICIT
    }

    tlv(0x30, &content)
}

fn build_response_der(issuer_key_hash: &[u8], serial: &[u8], status: TestCertStatus, with_nonce: bool) -> Vec<u8> {
    let cert_id = build_cert_id(issuer_key_hash, serial);
    let response_data = build_response_data(&cert_id, &status, with_nonce);

    let mut basic_content = response_data;
    basic_content.extend(alg_id_sha256()); // signatureAlgorithm
    let signature = {
        let mut s = vec![0x00_u8]; // 0 unused bits
        s.extend(vec![0u8; 32]);
        tlv(0x03, &s)
    };
    basic_content.extend(signature);
    let basic = tlv(0x30, &basic_content); // BasicOCSPResponse

    let mut response_bytes_content = tlv(0x06, &BASIC_RESPONSE_OID_BYTES);
    response_bytes_content.extend(tlv(0x04, &basic)); // response OCTET STRING wrapping BasicOCSPResponse
    let response_bytes = tlv(0x30, &response_bytes_content); // ResponseBytes

    let mut content = tlv(0x0A, &[0x00]); // responseStatus ENUMERATED successful(0)
    content.extend(tlv(0xA0, &response_bytes)); // responseBytes [0] EXPLICIT
    tlv(0x30, &content) // OCSPResponse
}

fn good_response_der() -> Vec<u8> {
    build_response_der(&ISSUER_KEY_HASH, &SERIAL, TestCertStatus::Good, false)
}

#[tokio::test]
async fn s1_cold_miss_fetches_decodes_and_caches() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/ocsp-response")
                .set_body_bytes(good_response_der()),
        )
        .mount(&server)
        .await;

    let host = responder_host(&server);
    let fetcher = Fetcher::new(Duration::from_secs(5));
    let mut harness = build_harness(test_config(vec![]), fetcher);

    let body = Bytes::from(build_request_der(&[(&ISSUER_KEY_HASH[..], &SERIAL[..])]));
    let outcome = harness.proxy.decide(Some(host), false, &body).await;

    let entry = match outcome {
        Outcome::Served(entry) => entry,
        other => panic!("expected Served, got {other:?}"),
    };
    assert_eq!(entry.status, CertStatus::Good);
    assert_eq!(entry.thisupd, THIS_UPDATE_UNIX);
    assert_eq!(entry.nextupd, NEXT_UPDATE_UNIX);

    match harness.write_rx.try_recv() {
        Ok(WriteIntent::Upsert(upserted)) => assert_eq!(upserted.cache_key, entry.cache_key),
        other => panic!("expected one Upsert intent, got {other:?}"),
    }
    assert!(harness.write_rx.try_recv().is_err(), "no further intents expected");
}

#[tokio::test]
async fn s2_warm_hit_is_served_even_when_host_is_not_allowlisted() {
    // Regression test: the allowlist must gate only the bypass path and
    // the miss-path fetch, never a warm cache hit.
    let fetcher = Fetcher::new(Duration::from_secs(5));
    let harness = build_harness(test_config(vec!["only-this-host.example.com".into()]), fetcher);

    let cache_key = "ocspxy_".to_string() + &hex::encode(ISSUER_KEY_HASH) + "_" + &hex::encode(SERIAL);
    let warm_entry = CacheEntry {
        cache_key: cache_key.clone(),
        ocsp_responder: "disallowed.example.com".into(),
        request: vec![0x01],
        response: good_response_der(),
        thisupd: THIS_UPDATE_UNIX,
        nextupd: NEXT_UPDATE_UNIX,
        lastchecked: THIS_UPDATE_UNIX,
        status: CertStatus::Good,
        nonce: 0,
    };
    harness.store.put(&warm_entry).await.unwrap();

    let body = Bytes::from(build_request_der(&[(&ISSUER_KEY_HASH[..], &SERIAL[..])]));
    let outcome = harness
        .proxy
        .decide(Some("disallowed.example.com".to_string()), false, &body)
        .await;

    match outcome {
        Outcome::Served(entry) => assert_eq!(entry.cache_key, cache_key),
        other => panic!("expected a warm cache hit to be served, got {other:?}"),
    }
}

#[tokio::test]
async fn s3_nonce_bearing_response_is_served_but_not_persisted() {
    let server = MockServer::start().await;
    let nonce_response = build_response_der(&ISSUER_KEY_HASH, &SERIAL, TestCertStatus::Good, true);
    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/ocsp-response")
                .set_body_bytes(nonce_response),
        )
        .mount(&server)
        .await;

    let host = responder_host(&server);
    let fetcher = Fetcher::new(Duration::from_secs(5));
    let mut harness = build_harness(test_config(vec![]), fetcher);

    let body = Bytes::from(build_request_der(&[(&ISSUER_KEY_HASH[..], &SERIAL[..])]));
    let outcome = harness.proxy.decide(Some(host), false, &body).await;

    assert!(matches!(outcome, Outcome::Served(_)));
    assert!(
        harness.write_rx.try_recv().is_err(),
        "a nonce-bearing response must never be persisted"
    );
}

#[tokio::test]
async fn s4_purge_enqueues_delete_and_returns_410() {
    let fetcher = Fetcher::new(Duration::from_secs(5));
    let mut harness = build_harness(test_config(vec![]), fetcher);

    let body = Bytes::from(build_request_der(&[(&ISSUER_KEY_HASH[..], &SERIAL[..])]));
    let outcome = harness.proxy.decide(None, true, &body).await;

    assert!(matches!(outcome, Outcome::Status(410)));
    match harness.write_rx.try_recv() {
        Ok(WriteIntent::Delete(key)) => assert!(key.starts_with("ocspxy_")),
        other => panic!("expected one Delete intent, got {other:?}"),
    }
}

#[tokio::test]
async fn s5_upstream_failure_on_miss_evicts_and_returns_503() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let host = responder_host(&server);
    let fetcher = Fetcher::new(Duration::from_secs(5));
    let mut harness = build_harness(test_config(vec![]), fetcher);

    let body = Bytes::from(build_request_der(&[(&ISSUER_KEY_HASH[..], &SERIAL[..])]));
    let outcome = harness.proxy.decide(Some(host), false, &body).await;

    assert!(matches!(outcome, Outcome::Status(503)));
    match harness.write_rx.try_recv() {
        Ok(WriteIntent::Delete(_)) => {}
        other => panic!("expected one Delete intent (evict_on_fetch_failure), got {other:?}"),
    }
}

#[tokio::test]
async fn s6_multi_request_bypass_relays_status_and_headers_verbatim() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(
            ResponseTemplate::new(503)
                .insert_header("x-responder-custom", "keep-me")
                .set_body_bytes(vec![0x01, 0x02, 0x03]),
        )
        .mount(&server)
        .await;

    let host = responder_host(&server);
    let fetcher = Fetcher::new(Duration::from_secs(5));
    let mut harness = build_harness(test_config(vec![]), fetcher);

    let body = Bytes::from(build_request_der(&[
        (&ISSUER_KEY_HASH[..], &SERIAL[..]),
        (&ISSUER_KEY_HASH[..], &[0x04, 0x05][..]),
    ]));
    let outcome = harness.proxy.decide(Some(host), false, &body).await;

    let raw = match outcome {
        Outcome::Relayed(raw) => raw,
        other => panic!("expected Relayed, got {other:?}"),
    };
    assert_eq!(raw.status, 503, "bypass must relay the real upstream status, not synthesize one");
    assert_eq!(raw.body, vec![0x01, 0x02, 0x03]);
    assert!(raw
        .headers
        .iter()
        .any(|(name, value)| name.eq_ignore_ascii_case("x-responder-custom") && value == "keep-me"));

    assert!(
        harness.write_rx.try_recv().is_err(),
        "the multi-request bypass must never enqueue a write intent"
    );
}

#[tokio::test]
async fn s6_multi_request_bypass_is_gated_by_allowlist() {
    let fetcher = Fetcher::new(Duration::from_secs(5));
    let harness = build_harness(test_config(vec!["only-this-host.example.com".into()]), fetcher);

    let body = Bytes::from(build_request_der(&[
        (&ISSUER_KEY_HASH[..], &SERIAL[..]),
        (&ISSUER_KEY_HASH[..], &[0x04, 0x05][..]),
    ]));
    let outcome = harness
        .proxy
        .decide(Some("not-allowed.example.com".to_string()), false, &body)
        .await;

    assert!(matches!(outcome, Outcome::Status(403)));
}
