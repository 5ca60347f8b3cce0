//! Prometheus metrics, scraped over HTTP by Pingora's built-in
//! `prometheus_http_service` from the process-global default registry.

use once_cell::sync::Lazy;
use prometheus::{register_counter_vec, register_histogram_vec, register_int_gauge, CounterVec, HistogramVec, IntGauge};

pub static REQUESTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "ocspxy_requests_total",
        "Client OCSP requests handled, by outcome",
        &["outcome"]
    )
    .unwrap_or_else(|e| {
        tracing::error!("failed to register ocspxy_requests_total: {e}");
        std::process::exit(1);
    })
});

pub static UPSTREAM_FETCH_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "ocspxy_upstream_fetch_total",
        "Upstream OCSP fetches, by outcome",
        &["outcome"]
    )
    .unwrap_or_else(|e| {
        tracing::error!("failed to register ocspxy_upstream_fetch_total: {e}");
        std::process::exit(1);
    })
});

pub static REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "ocspxy_request_duration_seconds",
        "Client-facing request handling latency",
        &["outcome"]
    )
    .unwrap_or_else(|e| {
        tracing::error!("failed to register ocspxy_request_duration_seconds: {e}");
        std::process::exit(1);
    })
});

pub static WRITE_QUEUE_DEPTH: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "ocspxy_write_queue_depth",
        "Pending write intents not yet applied to the store"
    )
    .unwrap_or_else(|e| {
        tracing::error!("failed to register ocspxy_write_queue_depth: {e}");
        std::process::exit(1);
    })
});

pub static REFRESH_CYCLES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "ocspxy_refresh_cycles_total",
        "Refresher cycles, by outcome",
        &["outcome"]
    )
    .unwrap_or_else(|e| {
        tracing::error!("failed to register ocspxy_refresh_cycles_total: {e}");
        std::process::exit(1);
    })
});

pub fn record_request(outcome: &str) {
    REQUESTS_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_upstream_fetch(outcome: &str) {
    UPSTREAM_FETCH_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn observe_request_duration(outcome: &str, secs: f64) {
    REQUEST_DURATION.with_label_values(&[outcome]).observe(secs);
}

pub fn set_write_queue_depth(depth: i64) {
    WRITE_QUEUE_DEPTH.set(depth);
}

pub fn record_refresh_cycle(outcome: &str) {
    REFRESH_CYCLES_TOTAL.with_label_values(&[outcome]).inc();
}
