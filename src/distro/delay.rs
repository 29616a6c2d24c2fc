//! Delay / Coalescing Engine
//!
//! Holds at most one pending `SyncTask` per `(peer, resource type)` bucket and
//! merges every new request for that bucket into it. A ticker promotes due
//! tasks to a dedicated worker per bucket, which processes its tasks one at a
//! time: while a sync is in flight the bucket keeps coalescing instead of
//! queueing a second batch behind it.
//!
//! Failed keys come back as single-key retry tasks with their own due time.
//! When due they fold into the bucket's pending batch and force it eligible.

use super::types::{BucketKey, DistroKey, RetryTask, SyncAction, SyncTask};
use crate::config::DistroConfig;
use crate::membership::types::NodeId;

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Consumer of fired tasks. Called from the bucket's worker, so calls for one
/// bucket never overlap.
#[async_trait]
pub trait SyncTaskProcessor: Send + Sync {
    async fn process(&self, task: SyncTask);
}

struct Worker {
    tx: mpsc::UnboundedSender<SyncTask>,
    busy: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl Worker {
    fn spawn(bucket: BucketKey, processor: Arc<dyn SyncTaskProcessor>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<SyncTask>();
        let busy = Arc::new(AtomicBool::new(false));
        let flag = busy.clone();

        let handle = tokio::spawn(async move {
            tracing::debug!("Sync worker for {} started", bucket);
            while let Some(task) = rx.recv().await {
                tracing::trace!(
                    "Worker {} processing batch #{} ({} keys)",
                    bucket,
                    task.key.sequence,
                    task.key.len()
                );
                processor.process(task).await;
                flag.store(false, Ordering::SeqCst);
            }
        });

        Self { tx, busy, handle }
    }
}

pub struct DelayTaskEngine {
    sync_delay: Duration,
    retry_delay: Duration,
    batch_size: usize,
    tick_interval: Duration,
    pending: DashMap<BucketKey, SyncTask>,
    retries: DashMap<DistroKey, RetryTask>,
    workers: DashMap<BucketKey, Worker>,
    sequence: AtomicU64,
    processor: Mutex<Option<Arc<dyn SyncTaskProcessor>>>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl DelayTaskEngine {
    pub fn new(config: &DistroConfig) -> Arc<Self> {
        Arc::new(Self {
            sync_delay: config.sync_delay(),
            retry_delay: config.sync_retry_delay(),
            batch_size: config.batch_sync_key_count.max(1),
            tick_interval: config.tick_interval(),
            pending: DashMap::new(),
            retries: DashMap::new(),
            workers: DashMap::new(),
            sequence: AtomicU64::new(0),
            processor: Mutex::new(None),
            ticker: Mutex::new(None),
        })
    }

    /// Starts the ticker; fired tasks are handed to `processor`.
    pub fn start(self: &Arc<Self>, processor: Arc<dyn SyncTaskProcessor>) {
        *lock(&self.processor) = Some(processor);

        let mut ticker = lock(&self.ticker);
        if ticker.is_some() {
            return;
        }

        let engine = self.clone();
        *ticker = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(engine.tick_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                engine.tick();
            }
        }));

        tracing::info!(
            "Delay engine started (delay={:?}, retry={:?}, batch={})",
            self.sync_delay,
            self.retry_delay,
            self.batch_size
        );
    }

    /// Stops the ticker and every worker. Pending tasks stay queued.
    pub fn stop(&self) {
        if let Some(handle) = lock(&self.ticker).take() {
            handle.abort();
        }
        for entry in self.workers.iter() {
            entry.value().handle.abort();
        }
        self.workers.clear();
        *lock(&self.processor) = None;
        tracing::info!("Delay engine stopped");
    }

    /// Merges a sync request into the pending batch of its bucket, creating
    /// the batch when none is pending.
    pub fn add_task(&self, key: DistroKey, action: SyncAction) {
        let now = Instant::now();
        // A fresh request supersedes a parked retry of the same key.
        self.retries.remove(&key);
        self.merge_pending(key, action, now, false);
    }

    /// Parks a single-key retry until `retry_delay` has passed. A retry
    /// already parked for the key keeps its due time.
    pub fn add_retry_task(&self, key: DistroKey, action: SyncAction) {
        let due_time = Instant::now() + self.retry_delay;
        self.retries
            .entry(key.clone())
            .and_modify(|task| task.action = task.action.merge(action))
            .or_insert(RetryTask {
                key,
                action,
                due_time,
            });
    }

    /// Drops every pending, parked and in-flight task for `peer`.
    /// Returns how many queued tasks were discarded.
    pub fn remove_peer(&self, peer: &NodeId) -> usize {
        let before = self.pending.len() + self.retries.len();
        self.pending.retain(|bucket, _| &bucket.target != peer);
        self.retries.retain(|key, _| &key.target != peer);
        let dropped = before - (self.pending.len() + self.retries.len());

        let buckets: Vec<BucketKey> = self
            .workers
            .iter()
            .filter(|entry| &entry.key().target == peer)
            .map(|entry| entry.key().clone())
            .collect();
        for bucket in buckets {
            if let Some((_, worker)) = self.workers.remove(&bucket) {
                worker.handle.abort();
            }
        }

        if dropped > 0 {
            tracing::info!("Cancelled {} sync task(s) for departed peer {}", dropped, peer);
        }
        dropped
    }

    /// One scheduler pass: promote due retries, then hand every due batch
    /// whose worker is idle to that worker.
    pub fn tick(&self) {
        let now = Instant::now();
        self.promote_retries(now);
        self.dispatch_due(now);
    }

    pub fn pending_task(&self, bucket: &BucketKey) -> Option<SyncTask> {
        self.pending.get(bucket).map(|task| task.value().clone())
    }

    pub fn retry_task(&self, key: &DistroKey) -> Option<RetryTask> {
        self.retries.get(key).map(|task| task.value().clone())
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn retry_len(&self) -> usize {
        self.retries.len()
    }

    pub fn is_in_flight(&self, bucket: &BucketKey) -> bool {
        self.workers
            .get(bucket)
            .map(|worker| worker.busy.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Nothing pending, parked or in flight.
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty()
            && self.retries.is_empty()
            && self
                .workers
                .iter()
                .all(|worker| !worker.busy.load(Ordering::SeqCst))
    }

    fn merge_pending(&self, key: DistroKey, action: SyncAction, now: Instant, force: bool) {
        let bucket = key.bucket();
        let mut task = self
            .pending
            .entry(bucket.clone())
            .or_insert_with(|| SyncTask::new(bucket, self.next_sequence(), action, now));

        task.merge(key.resource_key, action, now, self.sync_delay, self.batch_size);
        if force {
            task.force(now);
        }
    }

    fn promote_retries(&self, now: Instant) {
        let due: Vec<DistroKey> = self
            .retries
            .iter()
            .filter(|entry| entry.value().due_time <= now)
            .map(|entry| entry.key().clone())
            .collect();

        for key in due {
            if let Some((key, retry)) = self.retries.remove_if(&key, |_, task| task.due_time <= now)
            {
                tracing::debug!("Retrying sync {}", key);
                self.merge_pending(key, retry.action, now, true);
            }
        }
    }

    fn dispatch_due(&self, now: Instant) {
        let Some(processor) = lock(&self.processor).clone() else {
            return;
        };

        let due: Vec<BucketKey> = self
            .pending
            .iter()
            .filter(|entry| entry.value().is_ready(now))
            .map(|entry| entry.key().clone())
            .collect();

        for bucket in due {
            if self.is_in_flight(&bucket) {
                continue;
            }
            if let Some((bucket, task)) = self.pending.remove_if(&bucket, |_, task| task.is_ready(now))
            {
                self.dispatch(bucket, task, &processor);
            }
        }
    }

    fn dispatch(&self, bucket: BucketKey, task: SyncTask, processor: &Arc<dyn SyncTaskProcessor>) {
        let sent = {
            let worker = self
                .workers
                .entry(bucket.clone())
                .or_insert_with(|| Worker::spawn(bucket.clone(), processor.clone()));
            worker.busy.store(true, Ordering::SeqCst);
            worker.tx.send(task).map_err(|e| e.0)
        };

        if let Err(task) = sent {
            tracing::warn!("Sync worker for {} is gone, requeueing batch", bucket);
            self.workers.remove(&bucket);
            let now = Instant::now();
            let action = task.action;
            for key in task.key.split() {
                self.merge_pending(key, action, now, true);
            }
        }
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
