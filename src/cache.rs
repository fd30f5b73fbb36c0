use std::fmt::Write as _;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hickory_proto::op::Message;
use hickory_proto::rr::Record;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHasher};

/// Shard count for the response cache. Prime, so fingerprint hashes spread
/// evenly regardless of the capacity.
const SHARD_COUNT: usize = 257;

const NIL: usize = usize::MAX;

/// Cache key for a request: `lower(name):qtype:qclass`, joined by `|` across
/// all questions. Transaction id, flags, and EDNS options do not participate,
/// so byte-different retransmissions of the same question share one entry.
pub fn question_fingerprint(msg: &Message) -> String {
    let mut key = String::with_capacity(48);
    for (i, query) in msg.queries().iter().enumerate() {
        if i > 0 {
            key.push('|');
        }
        let _ = write!(
            key,
            "{}:{}:{}",
            query.name().to_lowercase(),
            u16::from(query.query_type()),
            u16::from(query.query_class()),
        );
    }
    key
}

/// Clamp every RR header TTL in the answer, authority, and additional
/// sections into `[clamp_min, clamp_max]`, returning the minimum clamped TTL.
///
/// Returns `None` when the message carries no clampable RR at all. The OPT
/// pseudo-record is parsed into the message extensions, not the additional
/// section, so it is never touched here.
pub fn clamp_ttls(msg: &mut Message, clamp_min: u32, clamp_max: u32) -> Option<u32> {
    let mut min_seen: Option<u32> = None;

    let mut clamp_section = |records: &mut [Record]| {
        for record in records.iter_mut() {
            let ttl = record.ttl().clamp(clamp_min, clamp_max);
            record.set_ttl(ttl);
            min_seen = Some(min_seen.map_or(ttl, |m| m.min(ttl)));
        }
    };
    clamp_section(msg.answers_mut());
    clamp_section(msg.name_servers_mut());
    clamp_section(msg.additionals_mut());

    min_seen
}

/// One cached response. Immutable after insert; readers get decayed copies.
pub struct CacheEntry {
    cached_at: Instant,
    expires_at: Instant,
    message: Message,
}

impl CacheEntry {
    fn new(message: Message, min_ttl_secs: u32, now: Instant) -> Self {
        Self {
            cached_at: now,
            expires_at: now + Duration::from_secs(u64::from(min_ttl_secs)),
            message,
        }
    }

    fn expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }

    /// Copy of the stored message with every RR TTL reduced by the seconds
    /// elapsed since insert. `None` when the entry has expired or the
    /// subtraction would leave the 32-bit TTL range; the janitor collects the
    /// entry on a later pass.
    fn decayed_copy(&self, now: Instant) -> Option<Message> {
        if self.expired(now) {
            return None;
        }
        let elapsed = now.saturating_duration_since(self.cached_at).as_secs();
        let delta = u32::try_from(elapsed).ok()?;

        let mut copy = self.message.clone();
        let mut underflow = false;

        let mut decay_section = |records: &mut [Record]| {
            for record in records.iter_mut() {
                if let Some(ttl) = record.ttl().checked_sub(delta) {
                    record.set_ttl(ttl);
                } else {
                    underflow = true;
                }
            }
        };
        decay_section(copy.answers_mut());
        decay_section(copy.name_servers_mut());
        decay_section(copy.additionals_mut());

        if underflow {
            return None;
        }
        Some(copy)
    }
}

struct Node {
    key: Arc<str>,
    entry: Arc<CacheEntry>,
    prev: usize,
    next: usize,
}

/// One cache shard: hash map plus an index-linked recency list over a slab.
/// `head` is the most recently used slot, `tail` the least.
struct Shard {
    capacity: usize,
    map: FxHashMap<Arc<str>, usize>,
    slots: Vec<Option<Node>>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
}

impl Shard {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            map: FxHashMap::default(),
            slots: Vec::new(),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
        }
    }

    fn links(&self, idx: usize) -> (usize, usize) {
        match &self.slots[idx] {
            Some(node) => (node.prev, node.next),
            None => (NIL, NIL),
        }
    }

    fn set_prev(&mut self, idx: usize, prev: usize) {
        if let Some(node) = self.slots[idx].as_mut() {
            node.prev = prev;
        }
    }

    fn set_next(&mut self, idx: usize, next: usize) {
        if let Some(node) = self.slots[idx].as_mut() {
            node.next = next;
        }
    }

    fn detach(&mut self, idx: usize) {
        let (prev, next) = self.links(idx);
        if prev == NIL {
            self.head = next;
        } else {
            self.set_next(prev, next);
        }
        if next == NIL {
            self.tail = prev;
        } else {
            self.set_prev(next, prev);
        }
        self.set_prev(idx, NIL);
        self.set_next(idx, NIL);
    }

    fn attach_front(&mut self, idx: usize) {
        self.set_prev(idx, NIL);
        self.set_next(idx, self.head);
        if self.head != NIL {
            self.set_prev(self.head, idx);
        }
        self.head = idx;
        if self.tail == NIL {
            self.tail = idx;
        }
    }

    fn get(&mut self, key: &str) -> Option<Arc<CacheEntry>> {
        let idx = *self.map.get(key)?;
        let entry = Arc::clone(&self.slots[idx].as_ref()?.entry);
        self.detach(idx);
        self.attach_front(idx);
        Some(entry)
    }

    fn insert(&mut self, key: Arc<str>, entry: Arc<CacheEntry>) {
        if self.capacity == 0 {
            return;
        }
        if let Some(&idx) = self.map.get(&key) {
            if let Some(node) = self.slots[idx].as_mut() {
                node.entry = entry;
            }
            self.detach(idx);
            self.attach_front(idx);
            return;
        }
        if self.map.len() >= self.capacity {
            let oldest = self.tail;
            if oldest != NIL {
                self.remove_slot(oldest);
            }
        }
        let node = Node {
            key: Arc::clone(&key),
            entry,
            prev: NIL,
            next: NIL,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(node);
                idx
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };
        self.map.insert(key, idx);
        self.attach_front(idx);
    }

    fn remove_slot(&mut self, idx: usize) {
        self.detach(idx);
        if let Some(node) = self.slots[idx].take() {
            self.map.remove(&node.key);
            self.free.push(idx);
        }
    }

    /// Walk from the least recently used end removing expired entries.
    /// Stops at the first live entry or at `max_items` removals. Expired
    /// entries hiding behind a live one wait for a later pass.
    fn purge_oldest(&mut self, max_items: usize, now: Instant) -> usize {
        let mut purged = 0;
        while purged < max_items {
            let idx = self.tail;
            if idx == NIL {
                break;
            }
            let expired = match self.slots[idx].as_ref() {
                Some(node) => node.entry.expired(now),
                None => break,
            };
            if !expired {
                break;
            }
            self.remove_slot(idx);
            purged += 1;
        }
        purged
    }

    fn len(&self) -> usize {
        self.map.len()
    }
}

/// Sharded, fixed-capacity response cache with LRU eviction.
///
/// Each shard carries its own lock and its own recency list; the capacity
/// bound holds as the sum over all shards. Entries past `expires_at` read as
/// misses immediately but occupy a slot until the janitor purges them or LRU
/// pressure evicts them.
pub struct DnsCache {
    shards: Vec<Mutex<Shard>>,
}

impl DnsCache {
    pub fn new(max_size: usize) -> Self {
        let max_size = max_size.max(1);
        let shard_count = SHARD_COUNT.min(max_size);
        // Spread the capacity so shard capacities sum to exactly max_size.
        let base = max_size / shard_count;
        let remainder = max_size % shard_count;
        let shards = (0..shard_count)
            .map(|i| Mutex::new(Shard::new(base + usize::from(i < remainder))))
            .collect();
        Self { shards }
    }

    fn shard_for(&self, key: &str) -> &Mutex<Shard> {
        let mut hasher = FxHasher::default();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    pub fn get(&self, key: &str) -> Option<Message> {
        self.get_at(key, Instant::now())
    }

    pub fn get_at(&self, key: &str, now: Instant) -> Option<Message> {
        let entry = self.shard_for(key).lock().get(key)?;
        entry.decayed_copy(now)
    }

    /// Store a response under `key`, overwriting any previous entry. The
    /// stored copy has its transaction id zeroed; `min_ttl_secs` is the
    /// minimum clamped TTL computed by the caller and fixes the absolute
    /// expiration.
    pub fn insert(&self, key: &str, message: &Message, min_ttl_secs: u32) {
        self.insert_at(key, message, min_ttl_secs, Instant::now());
    }

    pub fn insert_at(&self, key: &str, message: &Message, min_ttl_secs: u32, now: Instant) {
        let mut stored = message.clone();
        stored.set_id(0);
        let entry = Arc::new(CacheEntry::new(stored, min_ttl_secs, now));
        self.shard_for(key).lock().insert(Arc::from(key), entry);
    }

    /// Janitor entry point: purge up to `max_items` expired entries across
    /// the shards. No lock is held between shard scans.
    pub fn purge(&self, max_items: usize) -> usize {
        self.purge_at(max_items, Instant::now())
    }

    pub fn purge_at(&self, max_items: usize, now: Instant) -> usize {
        let mut purged = 0;
        for shard in &self.shards {
            if purged >= max_items {
                break;
            }
            purged += shard.lock().purge_oldest(max_items - purged, now);
        }
        purged
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
    use std::net::Ipv4Addr;
    use std::str::FromStr;

    fn response_with_ttls(name: &str, ttls: &[u32]) -> Message {
        let owner = Name::from_str(name).expect("name");
        let mut msg = Message::new();
        msg.set_id(0x4242);
        msg.set_message_type(MessageType::Response);
        msg.set_op_code(OpCode::Query);
        msg.set_response_code(ResponseCode::NoError);
        msg.add_query(Query::query(owner.clone(), RecordType::A));
        for (i, &ttl) in ttls.iter().enumerate() {
            msg.add_answer(Record::from_rdata(
                owner.clone(),
                ttl,
                RData::A(A(Ipv4Addr::new(192, 0, 2, i as u8 + 1))),
            ));
        }
        msg
    }

    fn request(name: &str, qtype: RecordType, id: u16) -> Message {
        let mut msg = Message::new();
        msg.set_id(id);
        msg.set_message_type(MessageType::Query);
        let mut query = Query::query(Name::from_str(name).expect("name"), qtype);
        query.set_query_class(DNSClass::IN);
        msg.add_query(query);
        msg
    }

    #[test]
    fn fingerprint_ignores_id_and_case() {
        let a = request("Example.COM.", RecordType::A, 1);
        let b = request("example.com.", RecordType::A, 0xbeef);
        assert_eq!(question_fingerprint(&a), question_fingerprint(&b));
        assert_eq!(question_fingerprint(&a), "example.com.:1:1");
    }

    #[test]
    fn fingerprint_ignores_edns_padding() {
        use hickory_proto::op::Edns;
        use hickory_proto::rr::rdata::opt::{EdnsCode, EdnsOption};

        let plain = request("example.com.", RecordType::A, 1);
        let mut padded = request("example.com.", RecordType::A, 1);
        let mut edns = Edns::new();
        edns.options_mut()
            .insert(EdnsOption::Unknown(u16::from(EdnsCode::Padding), vec![0; 64]));
        *padded.extensions_mut() = Some(edns);

        assert_eq!(question_fingerprint(&plain), question_fingerprint(&padded));
    }

    #[test]
    fn fingerprint_joins_multiple_questions() {
        let mut msg = request("a.example.", RecordType::A, 1);
        msg.add_query(Query::query(
            Name::from_str("b.example.").expect("name"),
            RecordType::AAAA,
        ));
        assert_eq!(question_fingerprint(&msg), "a.example.:1:1|b.example.:28:1");
    }

    #[test]
    fn clamp_raises_low_ttls_and_lowers_high_ttls() {
        let mut msg = response_with_ttls("example.com.", &[10, 7200, 600]);
        let min = clamp_ttls(&mut msg, 60, 3600);
        assert_eq!(min, Some(60));
        let ttls: Vec<u32> = msg.answers().iter().map(Record::ttl).collect();
        assert_eq!(ttls, vec![60, 3600, 600]);
    }

    #[test]
    fn clamp_is_idempotent() {
        let mut msg = response_with_ttls("example.com.", &[10, 7200]);
        clamp_ttls(&mut msg, 60, 3600);
        let once: Vec<u32> = msg.answers().iter().map(Record::ttl).collect();
        let min = clamp_ttls(&mut msg, 60, 3600);
        let twice: Vec<u32> = msg.answers().iter().map(Record::ttl).collect();
        assert_eq!(once, twice);
        assert_eq!(min, Some(60));
    }

    #[test]
    fn clamp_reports_nothing_for_empty_message() {
        let mut msg = request("example.com.", RecordType::A, 1);
        assert_eq!(clamp_ttls(&mut msg, 60, 3600), None);
    }

    #[test]
    fn hit_returns_decayed_copy() {
        let cache = DnsCache::new(16);
        let mut msg = response_with_ttls("example.com.", &[10]);
        let t0 = Instant::now();
        let min = clamp_ttls(&mut msg, 60, 3600).expect("clamped");
        cache.insert_at("example.com.:1:1", &msg, min, t0);

        let hit = cache
            .get_at("example.com.:1:1", t0 + Duration::from_secs(25))
            .expect("hit");
        assert_eq!(hit.answers()[0].ttl(), 35);
        // the stored copy keeps a zeroed transaction id
        assert_eq!(hit.id(), 0);
    }

    #[test]
    fn hit_within_same_second_keeps_full_ttl() {
        let cache = DnsCache::new(16);
        let mut msg = response_with_ttls("example.com.", &[300]);
        let t0 = Instant::now();
        let min = clamp_ttls(&mut msg, 60, 3600).expect("clamped");
        cache.insert_at("k", &msg, min, t0);

        let hit = cache.get_at("k", t0).expect("hit");
        assert_eq!(hit.answers()[0].ttl(), 300);
    }

    #[test]
    fn expired_entry_misses_but_stays_for_janitor() {
        let cache = DnsCache::new(16);
        let mut msg = response_with_ttls("example.com.", &[60]);
        let t0 = Instant::now();
        let min = clamp_ttls(&mut msg, 60, 3600).expect("clamped");
        cache.insert_at("k", &msg, min, t0);

        assert!(cache.get_at("k", t0 + Duration::from_secs(61)).is_none());
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.purge_at(10, t0 + Duration::from_secs(61)), 1);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn insert_overwrites_and_resets_decay() {
        let cache = DnsCache::new(16);
        let t0 = Instant::now();

        let mut old = response_with_ttls("example.com.", &[60]);
        let min = clamp_ttls(&mut old, 60, 3600).expect("clamped");
        cache.insert_at("k", &old, min, t0);

        // overwrite 50 seconds later, as the prefetcher does
        let mut fresh = response_with_ttls("example.com.", &[60]);
        let min = clamp_ttls(&mut fresh, 60, 3600).expect("clamped");
        cache.insert_at("k", &fresh, min, t0 + Duration::from_secs(50));

        let hit = cache
            .get_at("k", t0 + Duration::from_secs(55))
            .expect("hit");
        assert_eq!(hit.answers()[0].ttl(), 55);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn capacity_bound_holds_and_evicts_least_recently_used() {
        let cache = DnsCache::new(4);
        let t0 = Instant::now();
        for i in 0..8 {
            let key = format!("name{i}.example.:1:1");
            let mut msg = response_with_ttls("example.com.", &[120]);
            let min = clamp_ttls(&mut msg, 60, 3600).expect("clamped");
            cache.insert_at(&key, &msg, min, t0);
        }
        assert!(cache.len() <= 4);
    }

    #[test]
    fn single_shard_evicts_coldest_entry_first() {
        let cache = DnsCache::new(1);
        let t0 = Instant::now();
        let mut msg = response_with_ttls("example.com.", &[120]);
        let min = clamp_ttls(&mut msg, 60, 3600).expect("clamped");
        cache.insert_at("first", &msg, min, t0);
        cache.insert_at("second", &msg, min, t0);
        assert!(cache.get_at("first", t0).is_none());
        assert!(cache.get_at("second", t0).is_some());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn janitor_removes_expired_entries_and_never_live_ones() {
        let cache = DnsCache::new(10_000);
        let t0 = Instant::now();

        // Short-lived entries first, so they sit at the old end of each shard.
        for i in 0..10 {
            let mut short = response_with_ttls("short.example.", &[60]);
            let min = clamp_ttls(&mut short, 60, 3600).expect("clamped");
            cache.insert_at(&format!("short{i}"), &short, min, t0);
        }
        for i in 0..10 {
            let mut long = response_with_ttls("long.example.", &[3600]);
            let min = clamp_ttls(&mut long, 60, 3600).expect("clamped");
            cache.insert_at(&format!("long{i}"), &long, min, t0);
        }

        let later = t0 + Duration::from_secs(120);
        let purged = cache.purge_at(1000, later);
        assert_eq!(purged, 10);
        assert_eq!(cache.len(), 10);
        for i in 0..10 {
            assert!(cache.get_at(&format!("long{i}"), later).is_some());
        }
    }

    #[test]
    fn concurrent_readers_and_writers_keep_the_capacity_bound() {
        let cache = Arc::new(DnsCache::new(64));
        let t0 = Instant::now();

        let handles: Vec<_> = (0..4)
            .map(|worker: usize| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let key = format!("w{worker}-n{i}.example.:1:1");
                        let mut msg = response_with_ttls("example.com.", &[120]);
                        let min = clamp_ttls(&mut msg, 60, 3600).expect("clamped");
                        cache.insert_at(&key, &msg, min, t0);
                        let _ = cache.get_at(&key, t0);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("worker");
        }

        assert!(cache.len() <= 64);
        assert!(cache.len() > 0);
    }

    #[test]
    fn purge_respects_max_items() {
        let cache = DnsCache::new(1);
        let t0 = Instant::now();
        let mut msg = response_with_ttls("example.com.", &[60]);
        let min = clamp_ttls(&mut msg, 60, 3600).expect("clamped");
        cache.insert_at("k", &msg, min, t0);
        assert_eq!(cache.purge_at(0, t0 + Duration::from_secs(120)), 0);
        assert_eq!(cache.len(), 1);
    }
}
