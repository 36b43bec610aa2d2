//! Short-term response cache keyed on the question tuple.
//!
//! Entries hold the wire-form response and an absolute expiry computed from
//! the minimum TTL across its records. Reads never promote entries, so a
//! full cache evicts the least recently inserted response.

use corten_dns_domain::ProxyError;
use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::{DNSClass, Record, RecordType};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    qname: String,
    qtype: RecordType,
    qclass: DNSClass,
}

impl CacheKey {
    fn from_message(message: &Message) -> Option<Self> {
        let question = message.queries().first()?;
        Some(Self {
            qname: question.name().to_utf8().to_lowercase(),
            qtype: question.query_type(),
            qclass: question.query_class(),
        })
    }
}

struct CacheEntry {
    wire: Vec<u8>,
    stored_at: Instant,
    expires_at: Instant,
}

pub struct ResponseCache {
    entries: Mutex<LruCache<CacheKey, CacheEntry>>,
}

impl ResponseCache {
    /// `None` when `capacity` is zero: a zero-sized cache is a disabled cache.
    pub fn new(capacity: usize) -> Option<Self> {
        NonZeroUsize::new(capacity).map(|capacity| Self {
            entries: Mutex::new(LruCache::new(capacity)),
        })
    }

    /// Looks up a fresh response for the request's question. The returned
    /// message carries the request's ID and TTLs reduced by the time the
    /// entry spent in the cache.
    pub fn get(&self, request: &Message) -> Option<Message> {
        let key = CacheKey::from_message(request)?;
        let mut entries = self.entries.lock().unwrap();

        let entry = entries.peek(&key)?;
        let now = Instant::now();
        if now >= entry.expires_at {
            entries.pop(&key);
            return None;
        }

        let elapsed_secs = now.duration_since(entry.stored_at).as_secs() as u32;
        let mut response = match Message::from_vec(&entry.wire) {
            Ok(message) => message,
            Err(_) => {
                entries.pop(&key);
                return None;
            }
        };
        drop(entries);

        response.set_id(request.id());
        age_records(&mut response, elapsed_secs);
        trace!(qname = %key.qname, "serving cached response");
        Some(response)
    }

    /// Stores a positive response. Responses whose minimum record TTL is zero
    /// (or that have no records at all) are not cacheable.
    pub fn insert(&self, response: &Message) -> Result<(), ProxyError> {
        if response.response_code() != ResponseCode::NoError {
            return Ok(());
        }
        let Some(key) = CacheKey::from_message(response) else {
            return Ok(());
        };
        let Some(ttl) = min_ttl(response) else {
            debug!(qname = %key.qname, "response not cacheable");
            return Ok(());
        };

        let wire = response
            .to_vec()
            .map_err(|e| ProxyError::Encode(e.to_string()))?;
        let now = Instant::now();
        let entry = CacheEntry {
            wire,
            stored_at: now,
            expires_at: now + Duration::from_secs(u64::from(ttl)),
        };
        self.entries.lock().unwrap().put(key, entry);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn cacheable_records(message: &Message) -> impl Iterator<Item = &Record> {
    message
        .answers()
        .iter()
        .chain(message.name_servers())
        .chain(message.additionals())
        .filter(|r| r.record_type() != RecordType::OPT)
}

/// Minimum TTL across all non-OPT records; `None` when the response has no
/// such records or the minimum is zero.
fn min_ttl(message: &Message) -> Option<u32> {
    cacheable_records(message)
        .map(Record::ttl)
        .min()
        .filter(|ttl| *ttl > 0)
}

fn age_records(message: &mut Message, elapsed_secs: u32) {
    if elapsed_secs == 0 {
        return;
    }
    let aged = |records: Vec<Record>| {
        records
            .into_iter()
            .map(|mut record| {
                if record.record_type() != RecordType::OPT {
                    let ttl = record.ttl().saturating_sub(elapsed_secs);
                    record.set_ttl(ttl);
                }
                record
            })
            .collect::<Vec<_>>()
    };
    let answers = aged(message.take_answers());
    message.insert_answers(answers);
    let authorities = aged(message.take_name_servers());
    message.insert_name_servers(authorities);
    let additionals = aged(message.take_additionals());
    message.insert_additionals(additionals);
}
