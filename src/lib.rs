//! Trust establishment and response caching for an anonymizing DNS
//! forwarding proxy.
//!
//! The crate covers two halves of such a proxy: fetching and verifying a
//! server's signed certificate over DNS (optionally through relays, with
//! padded queries), and a shared response cache keyed by the hashed
//! question with clamped TTLs and a stale side channel.

pub mod cache;
pub mod cache_key;
pub mod certs;
pub mod codec;
pub mod config;
pub mod log;
pub mod transport;
pub mod ttl;

pub use cache::{QuerySession, ResponseCache};
pub use cache_key::{CacheKey, cache_key, canonical_name};
pub use certs::{CertInfo, CertResolution, CertResolver, SharedKeyDeriver};
pub use codec::{Certificate, Construction};
pub use config::{CacheConfig, ProxyConfig, ResolverConfig, load_config};
pub use log::{LogSink, Severity};
pub use transport::{ExchangeReply, Exchanger, ProxyDialer, RelayFramer, Transport};
pub use ttl::min_ttl;
