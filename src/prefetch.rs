use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use hickory_proto::op::Query;
use moka::sync::Cache;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::config::PrefetchConfiguration;
use crate::metrics::Metrics;

/// Capability the workers use to re-resolve a question and refresh the
/// response cache. The proxy engine provides it at start time, which keeps
/// this module free of any dependency on the dispatcher.
#[async_trait]
pub trait PrefetchRequestor: Send + Sync {
    async fn refresh(&self, cache_key: &str, question: &Query);
}

#[derive(Clone)]
struct PrefetchEntry {
    question: Query,
    expires_at: Instant,
}

impl PrefetchEntry {
    fn expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }
}

struct PrefetchJob {
    cache_key: String,
    question: Query,
}

/// Tracks recently answered questions and re-queries them on a timer so hot
/// cache entries are refreshed before they expire.
///
/// The store is a bounded LRU separate from the response cache; tracking a
/// question must not cost a response-cache slot. Entries age out after
/// `max_cache_entry_age` unless the proxy keeps re-noting them.
pub struct Prefetcher {
    store: Cache<String, PrefetchEntry>,
    job_tx: mpsc::Sender<PrefetchJob>,
    job_rx: parking_lot::Mutex<Option<mpsc::Receiver<PrefetchJob>>>,
    num_workers: usize,
    sleep_interval: std::time::Duration,
    max_entry_age: std::time::Duration,
    metrics: Arc<Metrics>,
}

impl Prefetcher {
    pub fn new(cfg: &PrefetchConfiguration, metrics: Arc<Metrics>) -> Self {
        let store = Cache::builder().max_capacity(cfg.max_cache_size).build();
        // Bounded at the worker count: a slow upstream backpressures the
        // periodic loop instead of queueing the whole key space.
        let (job_tx, job_rx) = mpsc::channel(cfg.num_workers);
        Self {
            store,
            job_tx,
            job_rx: parking_lot::Mutex::new(Some(job_rx)),
            num_workers: cfg.num_workers,
            sleep_interval: cfg.sleep_interval(),
            max_entry_age: cfg.max_cache_entry_age(),
            metrics,
        }
    }

    /// Record that `question` was just answered under `cache_key`, resetting
    /// its tracking age.
    pub fn note(&self, cache_key: &str, question: &Query) {
        if cache_key.is_empty() {
            return;
        }
        self.store.insert(
            cache_key.to_string(),
            PrefetchEntry {
                question: question.clone(),
                expires_at: Instant::now() + self.max_entry_age,
            },
        );
    }

    pub fn len(&self) -> u64 {
        self.store.entry_count()
    }

    /// Spawn the worker pool and the periodic scan. Call once, after the
    /// listeners are up.
    pub fn start(&self, requestor: Arc<dyn PrefetchRequestor>) {
        let Some(job_rx) = self.job_rx.lock().take() else {
            warn!("prefetcher started twice, ignoring");
            return;
        };
        let job_rx = Arc::new(AsyncMutex::new(job_rx));

        for worker in 0..self.num_workers {
            let job_rx = Arc::clone(&job_rx);
            let requestor = Arc::clone(&requestor);
            tokio::spawn(async move {
                run_worker(worker, job_rx, requestor).await;
            });
        }

        let store = self.store.clone();
        let job_tx = self.job_tx.clone();
        let sleep_interval = self.sleep_interval;
        let metrics = Arc::clone(&self.metrics);
        tokio::spawn(async move {
            run_periodic(store, job_tx, sleep_interval, metrics).await;
        });

        info!(
            workers = self.num_workers,
            interval = ?self.sleep_interval,
            "prefetcher started"
        );
    }
}

async fn run_worker(
    worker: usize,
    job_rx: Arc<AsyncMutex<mpsc::Receiver<PrefetchJob>>>,
    requestor: Arc<dyn PrefetchRequestor>,
) {
    debug!(worker, "prefetch worker started");
    loop {
        // Lock only to receive; the refresh itself runs unlocked so the
        // pool makes progress in parallel.
        let job = { job_rx.lock().await.recv().await };
        let Some(job) = job else {
            return;
        };
        requestor.refresh(&job.cache_key, &job.question).await;
    }
}

async fn run_periodic(
    store: Cache<String, PrefetchEntry>,
    job_tx: mpsc::Sender<PrefetchJob>,
    sleep_interval: std::time::Duration,
    metrics: Arc<Metrics>,
) {
    loop {
        tokio::time::sleep(sleep_interval).await;

        let now = Instant::now();
        let mut expired = 0usize;
        let mut submitted = 0usize;

        let keys: Vec<String> = store.iter().map(|(key, _)| (*key).clone()).collect();
        for cache_key in keys {
            let Some(entry) = store.get(&cache_key) else {
                continue;
            };
            if entry.expired(now) {
                store.invalidate(&cache_key);
                metrics.increment_expired_prefetch_entries();
                expired += 1;
                continue;
            }
            if job_tx
                .send(PrefetchJob {
                    cache_key,
                    question: entry.question,
                })
                .await
                .is_err()
            {
                return;
            }
            submitted += 1;
        }

        debug!(
            len = store.entry_count(),
            expired, submitted, "prefetch pass complete"
        );
    }
}
