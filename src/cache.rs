use std::time::Instant;

use hickory_proto::op::{Edns, Message, MessageType, ResponseCode};
use hickory_proto::rr::RecordType;
use moka::sync::Cache;

use crate::cache_key::{CacheKey, cache_key};
use crate::config::CacheConfig;
use crate::log::LogSink;
use crate::ttl;

/// Per-query scratch state threaded from lookup to insert. Built once from
/// the question and never rebuilt, so both halves agree on the key.
pub struct QuerySession {
    pub key: CacheKey,
    pub dnssec: bool,
    min_ttl: u32,
    max_ttl: u32,
    neg_min_ttl: u32,
    neg_max_ttl: u32,
    /// Expired entry surfaced for serve-stale decisions upstream.
    pub stale: Option<Message>,
    /// Response synthesized from a fresh entry.
    pub synth: Option<Message>,
    pub cache_hit: bool,
}

impl QuerySession {
    pub fn new(query: &Message, config: &CacheConfig) -> Option<Self> {
        let question = query.queries().first()?;
        let dnssec = query.extensions().as_ref().is_some_and(Edns::dnssec_ok);
        let key = cache_key(
            dnssec,
            u16::from(question.query_type()),
            u16::from(question.query_class()),
            &question.name().to_ascii(),
        );
        Some(Self {
            key,
            dnssec,
            min_ttl: config.min_ttl,
            max_ttl: config.max_ttl,
            neg_min_ttl: config.neg_min_ttl,
            neg_max_ttl: config.neg_max_ttl,
            stale: None,
            synth: None,
            cache_hit: false,
        })
    }
}

#[derive(Clone)]
struct CachedResponse {
    msg: Message,
    expiration: Instant,
}

/// Shared response cache keyed by the query's hashed question.
pub struct ResponseCache {
    cache: Cache<CacheKey, CachedResponse>,
    sink: LogSink,
}

impl ResponseCache {
    /// `size` is rounded down to a power of two, with a floor of 1.
    pub fn new(size: u64, sink: LogSink) -> Self {
        let capacity = if size <= 1 {
            1
        } else {
            1u64 << (63 - size.leading_zeros())
        };
        Self {
            cache: Cache::builder().max_capacity(capacity).build(),
            sink,
        }
    }

    /// Looks the session's key up. A fresh hit lands in `session.synth` with
    /// TTLs rewritten to the remaining lifetime; an expired hit is moved to
    /// `session.stale` instead and evicted lazily by moka.
    pub fn lookup(&self, session: &mut QuerySession, query: &Message) {
        let Some(cached) = self.cache.get(&session.key) else {
            return;
        };
        let mut msg = cached.msg;
        msg.set_id(query.id());
        msg.set_message_type(MessageType::Response);
        if Instant::now() > cached.expiration {
            self.sink
                .debug("cached response expired, handing over to the stale path");
            session.stale = Some(msg);
            return;
        }
        update_ttl(&mut msg, cached.expiration);
        session.synth = Some(msg);
        session.cache_hit = true;
    }

    /// Stores a forwarded response and rewrites its TTLs to the clamped
    /// value. Truncated responses and error rcodes other than NXDOMAIN and
    /// NOTAUTH are never cached.
    pub fn insert(&self, session: &QuerySession, msg: &mut Message) {
        match msg.response_code() {
            ResponseCode::NoError | ResponseCode::NXDomain | ResponseCode::NotAuth => {}
            _ => return,
        }
        if msg.truncated() {
            return;
        }
        let ttl = ttl::min_ttl(
            msg,
            session.min_ttl,
            session.max_ttl,
            session.neg_min_ttl,
            session.neg_max_ttl,
        );
        let expiration = Instant::now() + ttl;
        self.cache.insert(
            session.key,
            CachedResponse {
                msg: msg.clone(),
                expiration,
            },
        );
        update_ttl(msg, expiration);
    }
}

/// Rewrites every record's TTL to the remaining seconds before `expiration`,
/// leaving the OPT pseudo-record alone.
fn update_ttl(msg: &mut Message, expiration: Instant) {
    let remaining = expiration
        .saturating_duration_since(Instant::now())
        .as_secs() as u32;
    let answers: Vec<_> = msg
        .take_answers()
        .into_iter()
        .map(|mut record| {
            record.set_ttl(remaining);
            record
        })
        .collect();
    msg.insert_answers(answers);
    let authorities: Vec<_> = msg
        .take_name_servers()
        .into_iter()
        .map(|mut record| {
            record.set_ttl(remaining);
            record
        })
        .collect();
    msg.insert_name_servers(authorities);
    let additionals: Vec<_> = msg
        .take_additionals()
        .into_iter()
        .map(|mut record| {
            if record.record_type() != RecordType::OPT {
                record.set_ttl(remaining);
            }
            record
        })
        .collect();
    msg.insert_additionals(additionals);
}
