use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use hickory_proto::op::ResponseCode;
use hickory_proto::rr::RecordType;
use rustc_hash::FxBuildHasher;

/// Process-wide counters, logged on every janitor tick.
///
/// Plain counters are lock-free atomics. The rcode and rrtype tallies have
/// tiny cardinality but unknown keys, so they live in a concurrent map of
/// atomics.
pub struct Metrics {
    blocked: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    prefetch_requests: AtomicU64,
    expired_prefetch_entries: AtomicU64,
    doh_client_errors: AtomicU64,
    write_response_errors: AtomicU64,
    rcodes: DashMap<ResponseCode, AtomicU64, FxBuildHasher>,
    rrtypes: DashMap<RecordType, AtomicU64, FxBuildHasher>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            blocked: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            prefetch_requests: AtomicU64::new(0),
            expired_prefetch_entries: AtomicU64::new(0),
            doh_client_errors: AtomicU64::new(0),
            write_response_errors: AtomicU64::new(0),
            rcodes: DashMap::with_hasher(FxBuildHasher::default()),
            rrtypes: DashMap::with_hasher(FxBuildHasher::default()),
        }
    }

    pub fn increment_blocked(&self) {
        self.blocked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn blocked(&self) -> u64 {
        self.blocked.load(Ordering::Relaxed)
    }

    pub fn increment_cache_hits(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    pub fn increment_cache_misses(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cache_misses(&self) -> u64 {
        self.cache_misses.load(Ordering::Relaxed)
    }

    pub fn increment_prefetch_requests(&self) {
        self.prefetch_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn prefetch_requests(&self) -> u64 {
        self.prefetch_requests.load(Ordering::Relaxed)
    }

    pub fn increment_expired_prefetch_entries(&self) {
        self.expired_prefetch_entries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn expired_prefetch_entries(&self) -> u64 {
        self.expired_prefetch_entries.load(Ordering::Relaxed)
    }

    pub fn increment_doh_client_errors(&self) {
        self.doh_client_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn doh_client_errors(&self) -> u64 {
        self.doh_client_errors.load(Ordering::Relaxed)
    }

    pub fn increment_write_response_errors(&self) {
        self.write_response_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn write_response_errors(&self) -> u64 {
        self.write_response_errors.load(Ordering::Relaxed)
    }

    pub fn record_rcode(&self, rcode: ResponseCode) {
        self.rcodes
            .entry(rcode)
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rrtype(&self, rrtype: RecordType) {
        self.rrtypes
            .entry(rrtype)
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn rcode_count(&self, rcode: ResponseCode) -> u64 {
        self.rcodes
            .get(&rcode)
            .map_or(0, |counter| counter.load(Ordering::Relaxed))
    }

    pub fn rrtype_count(&self, rrtype: RecordType) -> u64 {
        self.rrtypes
            .get(&rrtype)
            .map_or(0, |counter| counter.load(Ordering::Relaxed))
    }
}

impl fmt::Display for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "blocked={} cacheHits={} cacheMisses={} prefetchRequests={} \
             expiredPrefetchEntries={} dohClientErrors={} writeResponseErrors={}",
            self.blocked(),
            self.cache_hits(),
            self.cache_misses(),
            self.prefetch_requests(),
            self.expired_prefetch_entries(),
            self.doh_client_errors(),
            self.write_response_errors(),
        )?;

        // Sorted so consecutive log lines are comparable.
        let mut rcodes: Vec<(String, u64)> = self
            .rcodes
            .iter()
            .map(|entry| (format!("{:?}", entry.key()), entry.value().load(Ordering::Relaxed)))
            .collect();
        rcodes.sort();
        write!(f, " rcodes={rcodes:?}")?;

        let mut rrtypes: Vec<(String, u64)> = self
            .rrtypes
            .iter()
            .map(|entry| (entry.key().to_string(), entry.value().load(Ordering::Relaxed)))
            .collect();
        rrtypes.sort();
        write!(f, " rrtypes={rrtypes:?}")
    }
}
