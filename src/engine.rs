use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::{A, PTR};
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable, BinEncoder};
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use crate::blocklist::{effective_blocked, load_blocked_domains};
use crate::cache::{clamp_ttls, question_fingerprint, DnsCache};
use crate::config::{Configuration, DnsProxyConfiguration};
use crate::doh::DohClient;
use crate::metrics::Metrics;
use crate::prefetch::{PrefetchRequestor, Prefetcher};
use crate::proto_utils::{canonical_name, parse_quick, QuickQuery};

/// Static A records for one configured forward domain.
pub struct ForwardZone {
    names: FxHashMap<String, Ipv4Addr>,
    response_ttl: u32,
}

/// Static PTR records for one configured reverse domain.
pub struct ReverseZone {
    names: FxHashMap<String, Name>,
    response_ttl: u32,
}

enum Handler {
    Proxy,
    Forward(Arc<ForwardZone>),
    Reverse(Arc<ReverseZone>),
    Blocked,
}

/// Routes a question name to its handler by longest matching domain suffix.
/// Built once at startup, read-only afterwards.
struct Router {
    routes: FxHashMap<String, Handler>,
    default_handler: Handler,
}

impl Router {
    fn build(cfg: &DnsProxyConfiguration) -> anyhow::Result<Self> {
        let mut routes = FxHashMap::default();

        for forward in &cfg.forward_domain_configurations {
            let mut names = FxHashMap::default();
            for entry in &forward.names_to_addresses {
                let addr: Ipv4Addr = entry.ip_address.parse().with_context(|| {
                    format!("forward entry {:?}: bad address {:?}", entry.name, entry.ip_address)
                })?;
                names.insert(canonical_name(&entry.name), addr);
            }
            let zone = Arc::new(ForwardZone {
                names,
                response_ttl: forward.response_ttl_seconds,
            });
            routes.insert(canonical_name(&forward.domain), Handler::Forward(zone));
        }

        for reverse in &cfg.reverse_domain_configurations {
            let mut names = FxHashMap::default();
            for entry in &reverse.addresses_to_names {
                let target = Name::from_str(&canonical_name(&entry.name)).with_context(|| {
                    format!(
                        "reverse entry {:?}: bad target name {:?}",
                        entry.reverse_address, entry.name
                    )
                })?;
                names.insert(canonical_name(&entry.reverse_address), target);
            }
            let zone = Arc::new(ReverseZone {
                names,
                response_ttl: reverse.response_ttl_seconds,
            });
            routes.insert(canonical_name(&reverse.domain), Handler::Reverse(zone));
        }

        if let Some(path) = &cfg.blocked_domains_file {
            let domains = load_blocked_domains(path)?;
            let total = domains.len();
            let (installed, skipped) = effective_blocked(domains);
            for domain in &installed {
                routes.insert(domain.clone(), Handler::Blocked);
            }
            info!(
                total,
                installed = installed.len(),
                skipped,
                "blocked domains installed"
            );
        }

        Ok(Self {
            routes,
            default_handler: Handler::Proxy,
        })
    }

    /// `qname` must be canonical (lowercase, dot-terminated). Walks the
    /// labels outward so the longest installed suffix wins; the root handler
    /// is the proxy.
    fn route(&self, qname: &str) -> &Handler {
        let mut rest = qname;
        loop {
            if let Some(handler) = self.routes.get(rest) {
                return handler;
            }
            match rest.split_once('.') {
                Some((_, tail)) if !tail.is_empty() => rest = tail,
                _ => return &self.default_handler,
            }
        }
    }
}

/// The query-serving engine shared by all listeners.
#[derive(Clone)]
pub struct Engine {
    router: Arc<Router>,
    cache: Arc<DnsCache>,
    doh: Arc<DohClient>,
    prefetcher: Arc<Prefetcher>,
    metrics: Arc<Metrics>,
    clamp_min_ttl: u32,
    clamp_max_ttl: u32,
}

impl Engine {
    pub fn new(cfg: &Configuration, metrics: Arc<Metrics>) -> anyhow::Result<Self> {
        let proxy_cfg = &cfg.dns_proxy_configuration;
        let router = Router::build(proxy_cfg).context("build router")?;
        let cache = DnsCache::new(cfg.cache_configuration.max_size);
        let doh = DohClient::new(
            &cfg.doh_client_configuration,
            proxy_cfg.pad_outgoing_requests,
            Arc::clone(&metrics),
        )
        .context("build doh client")?;
        let prefetcher = Prefetcher::new(&cfg.prefetch_configuration, Arc::clone(&metrics));

        Ok(Self {
            router: Arc::new(router),
            cache: Arc::new(cache),
            doh: Arc::new(doh),
            prefetcher: Arc::new(prefetcher),
            metrics,
            clamp_min_ttl: proxy_cfg.clamp_min_ttl_seconds,
            clamp_max_ttl: proxy_cfg.clamp_max_ttl_seconds,
        })
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Start the prefetch pool and the janitor. Call after the listeners are
    /// bound.
    pub fn start_background(&self, cfg: &Configuration) {
        self.prefetcher.start(Arc::new(self.clone()));

        let engine = self.clone();
        let interval = Duration::from_secs(cfg.timer_interval_seconds);
        let max_purges = cfg.cache_configuration.max_purges_per_timer_pop;
        tokio::spawn(async move {
            run_janitor(engine, interval, max_purges).await;
        });
    }

    /// Synchronous fast path for the UDP receive loop: local responders and
    /// cache hits complete without a task spawn. `Ok(None)` means the packet
    /// needs the async path.
    pub fn handle_packet_fast(&self, packet: &[u8]) -> anyhow::Result<Option<Bytes>> {
        let mut qname_buf = [0u8; 256];
        let Some(q) = parse_quick(packet, &mut qname_buf) else {
            return Ok(None);
        };

        // Odd names fall through to the full parser rather than failing here.
        let Ok(owner) = Name::from_ascii(q.qname) else {
            return Ok(None);
        };

        match self.router.route(q.qname) {
            Handler::Proxy => {
                let key = format!("{}:{}:{}", q.qname, q.qtype, q.qclass);
                let Some(mut cached) = self.cache.get(&key) else {
                    return Ok(None);
                };
                self.metrics.increment_cache_hits();
                self.note_prefetch_for_quick(&key, &q, owner);
                cached.set_id(q.tx_id);
                Ok(Some(encode_message(&cached)?))
            }
            Handler::Forward(zone) => {
                let answers = zone.answer(q.qname, RecordType::from(q.qtype), owner);
                let rcode = if answers.is_empty() {
                    ResponseCode::NXDomain
                } else {
                    ResponseCode::NoError
                };
                Ok(Some(build_quick_response(&q, rcode, true, answers)?))
            }
            Handler::Reverse(zone) => {
                let answers = zone.answer(q.qname, RecordType::from(q.qtype), owner);
                let rcode = if answers.is_empty() {
                    ResponseCode::NXDomain
                } else {
                    ResponseCode::NoError
                };
                Ok(Some(build_quick_response(&q, rcode, true, answers)?))
            }
            Handler::Blocked => {
                self.metrics.increment_blocked();
                Ok(Some(build_quick_response(
                    &q,
                    ResponseCode::NXDomain,
                    false,
                    Vec::new(),
                )?))
            }
        }
    }

    /// Full request pipeline. Parse failures bubble up and the listener
    /// drops the packet.
    pub async fn handle_packet(&self, packet: &[u8]) -> anyhow::Result<Bytes> {
        let request = Message::from_bytes(packet).context("parse request")?;

        let Some(first_query) = request.queries().first() else {
            return build_response(&request, ResponseCode::ServFail, false, Vec::new());
        };
        let qname = first_query.name().to_lowercase().to_string();

        match self.router.route(&qname) {
            Handler::Proxy => self.handle_proxy(request).await,
            Handler::Forward(zone) => {
                let query = &request.queries()[0];
                let answers = zone.answer(&qname, query.query_type(), query.name().clone());
                let rcode = if answers.is_empty() {
                    ResponseCode::NXDomain
                } else {
                    ResponseCode::NoError
                };
                build_response(&request, rcode, true, answers)
            }
            Handler::Reverse(zone) => {
                let query = &request.queries()[0];
                let answers = zone.answer(&qname, query.query_type(), query.name().clone());
                let rcode = if answers.is_empty() {
                    ResponseCode::NXDomain
                } else {
                    ResponseCode::NoError
                };
                build_response(&request, rcode, true, answers)
            }
            Handler::Blocked => {
                self.metrics.increment_blocked();
                build_response(&request, ResponseCode::NXDomain, false, Vec::new())
            }
        }
    }

    /// Cache lookup, then DoH on a miss. Only single-question requests reach
    /// the cache or the upstream.
    async fn handle_proxy(&self, mut request: Message) -> anyhow::Result<Bytes> {
        if request.queries().len() != 1 {
            return build_response(&request, ResponseCode::ServFail, false, Vec::new());
        }

        let cache_key = question_fingerprint(&request);
        let request_id = request.id();

        if let Some(mut cached) = self.cache.get(&cache_key) {
            self.metrics.increment_cache_hits();
            self.prefetcher.note(&cache_key, &request.queries()[0]);
            cached.set_id(request_id);
            return encode_message(&cached);
        }

        self.metrics.increment_cache_misses();
        request.set_id(0);
        match self.doh.query(request.clone()).await {
            Ok(mut response) => {
                if cacheable_rcode(response.response_code()) {
                    self.prefetcher.note(&cache_key, &request.queries()[0]);
                }
                self.clamp_and_cache(&cache_key, &mut response);
                response.set_id(request_id);
                encode_message(&response)
            }
            Err(err) => {
                self.metrics.increment_doh_client_errors();
                warn!(key = %cache_key, error = %err, "doh query failed");
                request.set_id(request_id);
                build_response(&request, ResponseCode::ServFail, false, Vec::new())
            }
        }
    }

    /// Clamp the response TTLs in place and store a copy. Responses with a
    /// non-cacheable rcode, no clampable RR, or an empty key are served but
    /// not stored.
    fn clamp_and_cache(&self, cache_key: &str, response: &mut Message) {
        if !cacheable_rcode(response.response_code()) {
            return;
        }
        let Some(min_ttl) = clamp_ttls(response, self.clamp_min_ttl, self.clamp_max_ttl) else {
            return;
        };
        if min_ttl == 0 || cache_key.is_empty() {
            return;
        }
        self.cache.insert(cache_key, response, min_ttl);
    }

    fn note_prefetch_for_quick(&self, cache_key: &str, q: &QuickQuery<'_>, owner: Name) {
        let mut query = Query::query(owner, RecordType::from(q.qtype));
        query.set_query_class(DNSClass::from(q.qclass));
        self.prefetcher.note(cache_key, &query);
    }
}

#[async_trait]
impl PrefetchRequestor for Engine {
    /// Re-resolve a tracked question and overwrite its cache entry, which
    /// also resets TTL decay.
    async fn refresh(&self, cache_key: &str, question: &Query) {
        self.metrics.increment_prefetch_requests();

        let mut request = Message::new();
        request.set_id(0);
        request.set_message_type(MessageType::Query);
        request.set_op_code(OpCode::Query);
        request.set_recursion_desired(true);
        request.add_query(question.clone());

        match self.doh.query(request).await {
            Ok(mut response) => {
                self.clamp_and_cache(cache_key, &mut response);
            }
            Err(err) => {
                // Left for the next tick; the entry ages out eventually.
                debug!(key = %cache_key, error = %err, "prefetch refresh failed");
            }
        }
    }
}

fn cacheable_rcode(rcode: ResponseCode) -> bool {
    matches!(rcode, ResponseCode::NoError | ResponseCode::NXDomain)
}

impl ForwardZone {
    fn answer(&self, qname: &str, qtype: RecordType, owner: Name) -> Vec<Record> {
        if qtype != RecordType::A {
            return Vec::new();
        }
        match self.names.get(qname) {
            Some(addr) => vec![Record::from_rdata(
                owner,
                self.response_ttl,
                RData::A(A(*addr)),
            )],
            None => Vec::new(),
        }
    }
}

impl ReverseZone {
    fn answer(&self, qname: &str, qtype: RecordType, owner: Name) -> Vec<Record> {
        if qtype != RecordType::PTR {
            return Vec::new();
        }
        match self.names.get(qname) {
            Some(target) => vec![Record::from_rdata(
                owner,
                self.response_ttl,
                RData::PTR(PTR(target.clone())),
            )],
            None => Vec::new(),
        }
    }
}

/// Periodic cache maintenance: bounded expired-entry purge plus the stats
/// line.
pub async fn run_janitor(engine: Engine, interval: Duration, max_purges: usize) {
    info!(interval = ?interval, max_purges, "janitor started");
    loop {
        tokio::time::sleep(interval).await;
        let purged = engine.cache.purge(max_purges);
        info!(
            cache_len = engine.cache.len(),
            purged,
            prefetch_len = engine.prefetcher.len(),
            metrics = %engine.metrics,
            "janitor tick"
        );
    }
}

fn encode_message(msg: &Message) -> anyhow::Result<Bytes> {
    let mut out = Vec::with_capacity(512);
    {
        let mut encoder = BinEncoder::new(&mut out);
        msg.emit(&mut encoder).context("encode response")?;
    }
    Ok(Bytes::from(out))
}

fn build_response(
    request: &Message,
    rcode: ResponseCode,
    authoritative: bool,
    answers: Vec<Record>,
) -> anyhow::Result<Bytes> {
    let mut msg = Message::new();
    msg.set_id(request.id());
    msg.set_message_type(MessageType::Response);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(request.recursion_desired());
    msg.set_recursion_available(true);
    msg.set_authoritative(authoritative);
    msg.set_response_code(rcode);
    msg.add_queries(request.queries().iter().cloned().collect::<Vec<_>>());
    for answer in answers {
        msg.add_answer(answer);
    }
    encode_message(&msg)
}

fn build_quick_response(
    q: &QuickQuery<'_>,
    rcode: ResponseCode,
    authoritative: bool,
    answers: Vec<Record>,
) -> anyhow::Result<Bytes> {
    let mut msg = Message::new();
    msg.set_id(q.tx_id);
    msg.set_message_type(MessageType::Response);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(q.recursion_desired);
    msg.set_recursion_available(true);
    msg.set_authoritative(authoritative);
    msg.set_response_code(rcode);

    let name = Name::from_ascii(q.qname).context("rebuild question name")?;
    let mut query = Query::query(name, RecordType::from(q.qtype));
    query.set_query_class(DNSClass::from(q.qclass));
    msg.add_query(query);

    for answer in answers {
        msg.add_answer(answer);
    }
    encode_message(&msg)
}
