//! Windowed grouping of kill-by-pid requests.
//!
//! Requests with the same option shape that arrive within one window run
//! together through [`ProcessProvider::kill_many`]. Each key gets one timer;
//! batches run one at a time with a pause between them.

use crate::logging::events::event_names;
use crate::provider::{KillOptions, KillResult, ProcessProvider};
use pw_common::{Error, Result, Signal};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, info};

/// Options that must match for two kills to share a batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BatchKey {
    signal: Option<Signal>,
    force: bool,
    timeout_ms: Option<u128>,
    escalate: bool,
    include_children: bool,
}

impl BatchKey {
    fn of(options: &KillOptions) -> Self {
        Self {
            signal: options.signal,
            force: options.force,
            timeout_ms: options.timeout.map(|t| t.as_millis()),
            escalate: options.escalate,
            include_children: options.include_children,
        }
    }
}

type Waiter = oneshot::Sender<Result<KillResult>>;

#[derive(Debug)]
struct PendingBatch {
    generation: u64,
    options: KillOptions,
    members: Vec<(u32, Waiter)>,
}

#[derive(Debug)]
struct Inner {
    provider: Arc<ProcessProvider>,
    window: Duration,
    pause: Duration,
    max_members: usize,
    generation: AtomicU64,
    pending: Mutex<HashMap<BatchKey, PendingBatch>>,
    /// Serializes batch execution; holds when the last batch finished.
    last_run: tokio::sync::Mutex<Option<Instant>>,
}

/// Groups kill-by-pid requests into backend batches.
#[derive(Debug, Clone)]
pub struct Batcher {
    inner: Arc<Inner>,
}

impl Batcher {
    /// `max_members` caps a batch; a full batch runs without waiting for its
    /// window to close.
    pub fn new(
        provider: Arc<ProcessProvider>,
        window: Duration,
        pause: Duration,
        max_members: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                provider,
                window,
                pause,
                max_members: max_members.max(1),
                generation: AtomicU64::new(0),
                pending: Mutex::new(HashMap::new()),
                last_run: tokio::sync::Mutex::new(None),
            }),
        }
    }

    /// Queue a kill and wait for its batch to run.
    ///
    /// Dropping the returned future before the batch starts withdraws the
    /// pid from it.
    pub async fn submit(&self, pid: u32, options: &KillOptions) -> Result<KillResult> {
        let (tx, rx) = oneshot::channel();
        let key = BatchKey::of(options);

        let full = {
            let mut pending = self.inner.lock_pending();
            let batch = pending.entry(key.clone()).or_insert_with(|| {
                let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
                spawn_timer(Arc::clone(&self.inner), key.clone(), generation);
                PendingBatch {
                    generation,
                    options: options.clone(),
                    members: Vec::new(),
                }
            });
            batch.members.push((pid, tx));
            if batch.members.len() >= self.inner.max_members {
                pending.remove(&key)
            } else {
                None
            }
        };
        if let Some(batch) = full {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move { inner.run(batch).await });
        }

        rx.await.unwrap_or_else(|_| {
            Err(Error::execution(
                "kill_by_pid",
                pid,
                "batch was dropped before it ran",
            ))
        })
    }

    /// Run every pending batch now.
    pub async fn flush(&self) {
        let batches: Vec<PendingBatch> =
            self.inner.lock_pending().drain().map(|(_, b)| b).collect();
        for batch in batches {
            self.inner.run(batch).await;
        }
    }

    /// Requests waiting for their window to close.
    pub fn pending(&self) -> usize {
        self.inner
            .lock_pending()
            .values()
            .map(|b| b.members.len())
            .sum()
    }
}

fn spawn_timer(inner: Arc<Inner>, key: BatchKey, generation: u64) {
    tokio::spawn(async move {
        tokio::time::sleep(inner.window).await;
        let batch = {
            let mut pending = inner.lock_pending();
            match pending.get(&key) {
                Some(batch) if batch.generation == generation => pending.remove(&key),
                _ => None,
            }
        };
        if let Some(batch) = batch {
            inner.run(batch).await;
        }
    });
}

impl Inner {
    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<BatchKey, PendingBatch>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn run(&self, batch: PendingBatch) {
        let mut last_run = self.last_run.lock().await;
        if let Some(finished) = *last_run {
            let since = finished.elapsed();
            if since < self.pause {
                tokio::time::sleep(self.pause - since).await;
            }
        }

        let (pids, waiters): (Vec<u32>, Vec<Waiter>) = batch
            .members
            .into_iter()
            .filter(|(_, tx)| !tx.is_closed())
            .unzip();
        if pids.is_empty() {
            debug!("batch withdrawn before it ran");
            return;
        }

        let started = Instant::now();
        match self.provider.kill_many(&pids, &batch.options).await {
            Ok(results) => {
                let killed = results.iter().filter(|r| matches!(r, Ok(k) if k.success)).count();
                info!(
                    event = event_names::BATCH_FLUSHED,
                    size = pids.len(),
                    killed,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "kill batch finished"
                );
                for (tx, result) in waiters.into_iter().zip(results) {
                    let _ = tx.send(result);
                }
            }
            Err(e) => {
                info!(
                    event = event_names::BATCH_FLUSHED,
                    size = pids.len(),
                    error = %e,
                    "kill batch failed"
                );
                let message = e.to_string();
                for (pid, tx) in pids.into_iter().zip(waiters) {
                    let _ = tx.send(Err(Error::execution("kill_by_pid", pid, message.clone())));
                }
            }
        }
        *last_run = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::fake_provider;
    use pw_common::OsFamily;
    use pw_config::ProcwardConfig;

    fn batcher(
        window_ms: u64,
        max_members: usize,
    ) -> (Batcher, Arc<crate::test_utils::FakeBackend>) {
        let (provider, backend) = fake_provider(OsFamily::Unix, ProcwardConfig::default());
        for pid in 100..110 {
            backend.add_process(pid, 1, "worker");
        }
        let batcher = Batcher::new(
            Arc::new(provider),
            Duration::from_millis(window_ms),
            Duration::from_millis(5),
            max_members,
        );
        (batcher, backend)
    }

    #[tokio::test]
    async fn test_same_shape_kills_share_a_batch() {
        let (batcher, backend) = batcher(30, 50);
        let options = KillOptions::default();
        let results = futures::future::join_all(
            (100..104).map(|pid| {
                let batcher = batcher.clone();
                let options = options.clone();
                async move { batcher.submit(pid, &options).await }
            }),
        )
        .await;

        assert!(results.iter().all(|r| matches!(r, Ok(k) if k.success)));
        let batches = backend.batches();
        assert_eq!(batches.len(), 1);
        let mut pids = batches[0].clone();
        pids.sort_unstable();
        assert_eq!(pids, vec![100, 101, 102, 103]);
    }

    #[tokio::test]
    async fn test_different_shapes_split() {
        let (batcher, backend) = batcher(30, 50);
        let a = batcher.clone();
        let b = batcher.clone();
        let (r1, r2) = tokio::join!(
            async move { a.submit(100, &KillOptions::default()).await },
            async move { b.submit(101, &KillOptions::forced()).await },
        );
        assert!(r1.is_ok() && r2.is_ok());
        assert_eq!(backend.batches().len(), 2);
    }

    #[tokio::test]
    async fn test_full_batch_runs_before_window() {
        let (batcher, backend) = batcher(60_000, 2);
        let started = Instant::now();
        let a = batcher.clone();
        let b = batcher.clone();
        let (r1, r2) = tokio::join!(
            async move { a.submit(100, &KillOptions::default()).await },
            async move { b.submit(101, &KillOptions::default()).await },
        );
        assert!(r1.is_ok() && r2.is_ok());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(backend.batches(), vec![vec![100, 101]]);
    }

    #[tokio::test]
    async fn test_flush_runs_pending_early() {
        let (batcher, backend) = batcher(60_000, 50);
        let submitter = batcher.clone();
        let handle =
            tokio::spawn(async move { submitter.submit(105, &KillOptions::default()).await });
        while batcher.pending() == 0 {
            tokio::task::yield_now().await;
        }
        batcher.flush().await;
        let result = handle.await.unwrap();
        assert!(result.unwrap().success);
        assert!(!backend.is_alive(105));
        assert_eq!(batcher.pending(), 0);
    }

    #[tokio::test]
    async fn test_withdrawn_request_is_skipped() {
        let (batcher, backend) = batcher(60_000, 50);
        let submitter = batcher.clone();
        let handle =
            tokio::spawn(async move { submitter.submit(106, &KillOptions::default()).await });
        while batcher.pending() == 0 {
            tokio::task::yield_now().await;
        }
        handle.abort();
        let _ = handle.await;
        batcher.flush().await;
        assert!(backend.batches().is_empty());
        assert!(backend.is_alive(106));
    }

    #[tokio::test]
    async fn test_batch_failure_reaches_every_waiter() {
        let (batcher, backend) = batcher(10, 50);
        backend.fail_next(10);
        let a = batcher.clone();
        let b = batcher.clone();
        let (r1, r2) = tokio::join!(
            async move { a.submit(100, &KillOptions::default()).await },
            async move { b.submit(101, &KillOptions::default()).await },
        );
        assert!(r1.is_err());
        assert!(r2.is_err());
    }
}
