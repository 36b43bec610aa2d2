//! The request pipeline: policy refusals, cache, upstream exchange with
//! fallback, DNS64 synthesis, and event emission.

use crate::cache::ResponseCache;
use crate::codec;
use crate::context::{DnsContext, Proto};
use crate::dns64::{self, Nat64Prefix};
use crate::events::{self, ProcessedEvent};
use crate::ratelimit::UdpRateLimiter;
use crate::selector::UpstreamSelector;
use crate::upstream::Upstream;
use async_trait::async_trait;
use corten_dns_domain::ProxyError;
use hickory_proto::op::{Edns, Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::{RData, Record, RecordType};
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{debug, trace, warn};

/// EDNS0 payload size advertised on NOTIMPL refusals. A NOTIMPL without
/// EDNS0 reads as "this server does not speak EDNS at all".
const REFUSAL_EDNS_PAYLOAD: u16 = 1452;

/// Replaces the default resolution path when an embedder installs a custom
/// handler. The handler receives the pipeline so it can delegate back to
/// [`Pipeline::resolve`].
#[async_trait]
pub trait ResolveHandler: Send + Sync {
    async fn handle(&self, pipeline: &Pipeline, ctx: &mut DnsContext)
        -> Result<Message, ProxyError>;
}

/// Selected once at construction; the hot path dispatches on the variant.
#[derive(Default)]
pub enum ResolveHook {
    #[default]
    Default,
    Custom(Arc<dyn ResolveHandler>),
}

impl Clone for ResolveHook {
    fn clone(&self) -> Self {
        match self {
            ResolveHook::Default => ResolveHook::Default,
            ResolveHook::Custom(handler) => ResolveHook::Custom(Arc::clone(handler)),
        }
    }
}

pub struct Pipeline {
    selector: UpstreamSelector,
    fallbacks: Vec<Arc<dyn Upstream>>,
    cache: Option<ResponseCache>,
    limiter: UdpRateLimiter,
    exchange_permits: Semaphore,
    refuse_any: bool,
    nat64_prefix: OnceLock<Nat64Prefix>,
    hook: ResolveHook,
}

impl Pipeline {
    pub fn new(
        selector: UpstreamSelector,
        fallbacks: Vec<Arc<dyn Upstream>>,
        cache: Option<ResponseCache>,
        limiter: UdpRateLimiter,
        max_parallel: usize,
        refuse_any: bool,
        hook: ResolveHook,
    ) -> Self {
        Self {
            selector,
            fallbacks,
            cache,
            limiter,
            exchange_permits: Semaphore::new(max_parallel.max(1)),
            refuse_any,
            nat64_prefix: OnceLock::new(),
            hook,
        }
    }

    /// Installs the discovered NAT64 prefix. First write wins; the prefix is
    /// read-only afterwards.
    pub fn set_nat64_prefix(&self, prefix: Nat64Prefix) {
        let _ = self.nat64_prefix.set(prefix);
    }

    pub fn nat64_prefix(&self) -> Option<&Nat64Prefix> {
        self.nat64_prefix.get()
    }

    /// Processes one request to completion. `None` means deliberate silence:
    /// the rate limiter dropped the request, no response and no event.
    pub async fn handle(&self, ctx: &mut DnsContext) -> Option<Message> {
        if ctx.proto == Proto::Udp && !ctx.internal && !self.limiter.allow(ctx.peer.ip()) {
            trace!(peer = %ctx.peer, "rate limited, dropping request");
            return None;
        }

        let (response, error) = self.process(ctx).await;
        events::emit(&build_event(ctx, &response, error));
        Some(response)
    }

    async fn process(&self, ctx: &mut DnsContext) -> (Message, Option<String>) {
        if ctx.req.queries().len() != 1 {
            debug!(
                proto = %ctx.proto,
                questions = ctx.req.queries().len(),
                "refusing request with invalid question count"
            );
            return (server_failure(&ctx.req), None);
        }

        if self.refuse_any && ctx.req.queries()[0].query_type() == RecordType::ANY {
            trace!(proto = %ctx.proto, "refusing ANY request");
            return (not_implemented(&ctx.req), None);
        }

        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.get(&ctx.req) {
                return (hit, None);
            }
        }

        let result = match &self.hook {
            ResolveHook::Default => self.resolve(ctx).await,
            ResolveHook::Custom(handler) => handler.handle(self, ctx).await,
        };

        match result {
            Ok(reply) => (reply, None),
            Err(e) => {
                warn!(proto = %ctx.proto, error = %e, "upstream exchange failed");
                (server_failure(&ctx.req), Some(e.to_string()))
            }
        }
    }

    /// Default resolution: choose an upstream, exchange, feed the selector,
    /// fall back once on failure, store to cache, apply DNS64 synthesis.
    pub async fn resolve(&self, ctx: &mut DnsContext) -> Result<Message, ProxyError> {
        let (upstream, index) = self.selector.choose();
        ctx.upstream_addr = Some(upstream.address().to_string());
        ctx.upstream_idx = Some(index);
        trace!(upstream = upstream.address(), index, "chose upstream");

        // One permit covers every exchange this request makes: the primary,
        // a possible fallback, and the DNS64 sibling query.
        let _permit = self
            .exchange_permits
            .acquire()
            .await
            .map_err(|_| ProxyError::Io("exchange semaphore closed".into()))?;
        let exchange_start = Instant::now();
        let result = upstream.exchange(&ctx.req).await;
        let rtt_ms = exchange_start.elapsed().as_millis() as u64;

        match &result {
            Ok(_) => self.selector.record(index, rtt_ms),
            Err(_) => self.selector.record_failure(index),
        }

        let mut reply = match result {
            Ok(reply) => reply,
            Err(primary_error) => {
                // Fallback exchanges never feed the selector.
                let mut rescued = None;
                for fallback in &self.fallbacks {
                    debug!(
                        fallback = fallback.address(),
                        error = %primary_error,
                        "primary upstream failed, trying fallback"
                    );
                    if let Ok(reply) = fallback.exchange(&ctx.req).await {
                        ctx.upstream_addr = Some(fallback.address().to_string());
                        rescued = Some(reply);
                        break;
                    }
                }
                match rescued {
                    Some(reply) => reply,
                    None => return Err(primary_error),
                }
            }
        };

        if let Some(cache) = &self.cache {
            if let Err(e) = cache.insert(&reply) {
                debug!(error = %e, "failed to store response in cache");
            }
        }

        self.maybe_synthesize_dns64(ctx, &mut reply, upstream.as_ref())
            .await;

        Ok(reply)
    }

    /// For AAAA questions that came back NOERROR with no AAAA answers,
    /// queries the chosen upstream for the sibling A records and attaches
    /// synthetic AAAA answers under the discovered NAT64 prefix.
    async fn maybe_synthesize_dns64(
        &self,
        ctx: &DnsContext,
        reply: &mut Message,
        upstream: &dyn Upstream,
    ) {
        let Some(prefix) = self.nat64_prefix.get() else {
            return;
        };
        let question = &ctx.req.queries()[0];
        if question.query_type() != RecordType::AAAA
            || reply.response_code() != ResponseCode::NoError
            || reply
                .answers()
                .iter()
                .any(|r| r.record_type() == RecordType::AAAA)
        {
            return;
        }

        let sibling = codec::new_query(question.name().clone(), RecordType::A);
        let a_reply = match upstream.exchange(&sibling).await {
            Ok(reply) => reply,
            Err(e) => {
                debug!(error = %e, "sibling A query for DNS64 synthesis failed");
                return;
            }
        };

        let mut synthesized = 0;
        for record in a_reply.answers() {
            if let RData::A(a) = record.data() {
                let addr = dns64::synthesize_addr(prefix, a.0);
                reply.add_answer(Record::from_rdata(
                    record.name().clone(),
                    record.ttl(),
                    RData::AAAA(hickory_proto::rr::rdata::AAAA(addr)),
                ));
                synthesized += 1;
            }
        }
        if synthesized > 0 {
            debug!(qname = %question.name(), synthesized, "attached DNS64 answers");
        }
    }
}

/// SERVFAIL with the request's ID and question echoed back.
pub fn server_failure(request: &Message) -> Message {
    refusal(request, ResponseCode::ServFail)
}

/// NOTIMPL with an explicit EDNS0 marker.
pub fn not_implemented(request: &Message) -> Message {
    let mut response = refusal(request, ResponseCode::NotImp);
    let mut edns = Edns::new();
    edns.set_max_payload(REFUSAL_EDNS_PAYLOAD);
    edns.set_dnssec_ok(false);
    edns.set_version(0);
    response.set_edns(edns);
    response
}

fn refusal(request: &Message, code: ResponseCode) -> Message {
    let mut response = Message::new();
    response.set_id(request.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(OpCode::Query);
    response.set_response_code(code);
    response.set_recursion_desired(request.recursion_desired());
    response.set_recursion_available(true);
    for question in request.queries() {
        response.add_query(question.clone());
    }
    response
}

fn build_event(ctx: &DnsContext, response: &Message, error: Option<String>) -> ProcessedEvent {
    let question = ctx.req.queries().first();
    ProcessedEvent {
        qname: question.map(|q| q.name().to_utf8()).unwrap_or_default(),
        qtype: question.map(|q| u16::from(q.query_type())).unwrap_or(0),
        answer: response
            .answers()
            .first()
            .map(|r| r.data().to_string())
            .unwrap_or_default(),
        upstream_addr: ctx.upstream_addr.clone().unwrap_or_default(),
        elapsed_ms: ctx.start.elapsed().as_millis() as u64,
        error: error.unwrap_or_default(),
    }
}
