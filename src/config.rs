//! Command-line / environment configuration.

use std::time::Duration;

use clap::Parser;

fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let (num, suffix) = s.split_at(s.len().saturating_sub(1));
    let unit = match suffix {
        "s" => 1u64,
        "m" => 60,
        "h" => 3_600,
        "d" => 86_400,
        _ => return num.parse::<u64>().map(Duration::from_secs).map_err(|e| e.to_string()),
    };
    num.parse::<u64>()
        .map(|n| Duration::from_secs(n * unit))
        .map_err(|e| e.to_string())
}

/// Caching forward proxy for OCSP.
#[derive(Debug, Parser, Clone)]
#[command(name = "ocspxy", about = "Caching forward proxy for OCSP")]
pub struct Config {
    /// Listen address for the client-facing OCSP HTTP surface.
    #[arg(long, env = "OCSPXY_BIND_HOST", default_value = "127.0.0.1")]
    pub bind_host: String,

    /// Listen port for the client-facing OCSP HTTP surface.
    #[arg(long, env = "OCSPXY_BIND_PORT", default_value_t = 8888)]
    pub bind_port: u16,

    /// Redis URL backing the Cache Store Adapter.
    #[arg(long, env = "OCSPXY_REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    pub redis_url: String,

    /// Prefix used for all cache keys.
    #[arg(long, env = "OCSPXY_KEY_PREFIX", default_value = "ocspxy_")]
    pub key_prefix: String,

    /// Enable debug logging.
    #[arg(short, long, env = "OCSPXY_VERBOSE")]
    pub verbose: bool,

    /// Listen address for the Prometheus `/metrics` surface.
    #[arg(long, env = "OCSPXY_METRICS_BIND", default_value = "127.0.0.1:9888")]
    pub metrics_bind: String,

    /// Per-fetch HTTP timeout against upstream OCSP responders, e.g. "10s", "1m".
    #[arg(long, env = "OCSPXY_UPSTREAM_TIMEOUT", default_value = "10s", value_parser = parse_duration)]
    pub upstream_timeout: Duration,

    /// Delete the cache entry when the handler miss-path fetch fails
    /// (fail-closed), rather than leaving a stale-but-present entry alone.
    #[arg(long, env = "OCSPXY_EVICT_ON_FETCH_FAILURE", default_value_t = true)]
    pub evict_on_fetch_failure: bool,

    /// Restrict the multi-request bypass and the miss-path fetch to these
    /// `Host` values. Empty (the default) means unrestricted.
    #[arg(long = "allowed-responder", env = "OCSPXY_ALLOWED_RESPONDERS", value_delimiter = ',')]
    pub allowed_responders: Vec<String>,
}

impl Config {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.bind_port)
    }

    /// Whether `host` is allowed to be contacted as an upstream responder,
    /// per the (possibly empty) allowlist.
    pub fn responder_allowed(&self, host: &str) -> bool {
        self.allowed_responders.is_empty() || self.allowed_responders.iter().any(|h| h == host)
    }
}
