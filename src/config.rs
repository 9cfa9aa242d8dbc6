use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tracing::info;

/// Raw on-disk configuration (JSON). Compiled into [`ResolverConfig`] and
/// [`CacheConfig`] before anything touches the network.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub version: Option<String>,
    /// Client secret key for shared-key derivation, hex encoded (64 chars).
    #[serde(default)]
    pub secret_key: String,
    /// Per-attempt exchange timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Relay endpoints tried in order during certificate retrieval.
    #[serde(default)]
    pub relays: Vec<String>,
    /// Skip validity-window checks (debugging aid, off by default).
    #[serde(default)]
    pub cert_ignore_timestamp: bool,
    /// Response cache capacity, rounded down to a power of two at build time.
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
    #[serde(default = "default_cache_min_ttl")]
    pub cache_min_ttl: u32,
    #[serde(default = "default_cache_max_ttl")]
    pub cache_max_ttl: u32,
    #[serde(default = "default_cache_neg_min_ttl")]
    pub cache_neg_min_ttl: u32,
    #[serde(default = "default_cache_neg_max_ttl")]
    pub cache_neg_max_ttl: u32,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty config deserializes")
    }
}

/// Immutable-after-construction resolver configuration shared by every
/// resolution flow. No ambient global access: values are passed into
/// constructors explicitly.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub secret_key: [u8; 32],
    pub timeout: Duration,
    pub relays: Vec<SocketAddr>,
    pub cert_ignore_timestamp: bool,
}

impl ResolverConfig {
    pub fn from_config(cfg: &ProxyConfig) -> Result<Self> {
        let secret_key = if cfg.secret_key.is_empty() {
            [0u8; 32]
        } else {
            decode_hex_key(&cfg.secret_key).context("parse secret_key")?
        };
        let mut relays = Vec::with_capacity(cfg.relays.len());
        for relay in &cfg.relays {
            let addr: SocketAddr = relay
                .parse()
                .with_context(|| format!("invalid relay address: {relay}"))?;
            relays.push(addr);
        }
        Ok(Self {
            secret_key,
            timeout: Duration::from_millis(cfg.timeout_ms),
            relays,
            cert_ignore_timestamp: cfg.cert_ignore_timestamp,
        })
    }
}

/// TTL bounds and capacity for the response cache.
#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    pub size: usize,
    pub min_ttl: u32,
    pub max_ttl: u32,
    pub neg_min_ttl: u32,
    pub neg_max_ttl: u32,
}

impl CacheConfig {
    pub fn from_config(cfg: &ProxyConfig) -> Self {
        Self {
            size: cfg.cache_size,
            min_ttl: cfg.cache_min_ttl,
            max_ttl: cfg.cache_max_ttl,
            neg_min_ttl: cfg.cache_neg_min_ttl,
            neg_max_ttl: cfg.cache_neg_max_ttl,
        }
    }
}

pub fn load_config(path: &Path) -> Result<ProxyConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read config file: {}", path.display()))?;
    let cfg: ProxyConfig = serde_json::from_str(&raw)
        .with_context(|| format!("parse config file: {}", path.display()))?;

    if let Some(version) = cfg.version.as_ref() {
        info!(target = "config", version = %version, "config loaded");
    }

    Ok(cfg)
}

fn decode_hex_key(hex: &str) -> Result<[u8; 32]> {
    if hex.len() != 64 {
        bail!("expected 64 hex characters, got {}", hex.len());
    }
    let mut key = [0u8; 32];
    for (i, chunk) in hex.as_bytes().chunks_exact(2).enumerate() {
        let hi = hex_nibble(chunk[0])?;
        let lo = hex_nibble(chunk[1])?;
        key[i] = (hi << 4) | lo;
    }
    Ok(key)
}

fn hex_nibble(b: u8) -> Result<u8> {
    match b {
        b'0'..=b'9' => Ok(b - b'0'),
        b'a'..=b'f' => Ok(b - b'a' + 10),
        b'A'..=b'F' => Ok(b - b'A' + 10),
        _ => bail!("invalid hex character: {}", b as char),
    }
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_cache_size() -> usize {
    512
}

fn default_cache_min_ttl() -> u32 {
    2400
}

fn default_cache_max_ttl() -> u32 {
    86400
}

fn default_cache_neg_min_ttl() -> u32 {
    60
}

fn default_cache_neg_max_ttl() -> u32 {
    600
}
