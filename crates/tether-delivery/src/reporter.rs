//! Reporter pool: workers that drain the delivery queue.
//!
//! Each worker loops forever: take the most urgent entry, drop it if it has
//! expired, put it back and wait if it is not due yet, otherwise send it.
//! Failures are rescheduled with exponential backoff until the entry's retry
//! budget runs out. Nothing a single entry does can stop a worker; only the
//! pool's shutdown signal does.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::queue::DeliveryQueue;
use crate::request::PendingRequest;
use crate::session::Transport;
use crate::stats::{WorkerSnapshot, WorkerStats};
use crate::DeliveryError;

/// Default number of workers.
pub const DEFAULT_WORKERS: usize = 4;

/// Default per-call timeout for requests that do not carry their own.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Delay before the next attempt once `retries_left` has been decremented.
///
/// `2^(retry_limit - retries_left)` seconds: 2s after the first failure, 4s
/// after the second, and so on.
pub fn retry_backoff(retry_limit: u32, retries_left: u32) -> Duration {
    let exponent = retry_limit.saturating_sub(retries_left);
    Duration::from_secs(2u64.saturating_pow(exponent))
}

/// Settings for [`ReporterPool::spawn`].
#[derive(Debug, Clone)]
pub struct ReporterConfig {
    pub workers: usize,
    pub request_timeout: Duration,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Fixed-size set of delivery workers sharing one queue and one transport.
pub struct ReporterPool {
    handles: Vec<JoinHandle<()>>,
    stats: Vec<Arc<WorkerStats>>,
    shutdown_tx: watch::Sender<bool>,
}

impl ReporterPool {
    /// Spawn `config.workers` workers on the current tokio runtime.
    pub fn spawn(
        config: ReporterConfig,
        queue: Arc<DeliveryQueue>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let workers = config.workers.max(1);
        let mut handles = Vec::with_capacity(workers);
        let mut stats = Vec::with_capacity(workers);

        for index in 0..workers {
            let worker = Worker {
                index,
                queue: Arc::clone(&queue),
                transport: Arc::clone(&transport),
                stats: Arc::new(WorkerStats::new()),
                request_timeout: config.request_timeout,
                shutdown: shutdown_rx.clone(),
            };
            stats.push(Arc::clone(&worker.stats));
            handles.push(tokio::spawn(worker.run()));
        }

        info!(workers, timeout = ?config.request_timeout, "reporter pool started");

        Self {
            handles,
            stats,
            shutdown_tx,
        }
    }

    /// Number of workers in the pool.
    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Per-worker counters.
    pub fn worker_stats(&self) -> Vec<WorkerSnapshot> {
        self.stats.iter().map(|s| s.snapshot()).collect()
    }

    /// Counters combined across all workers.
    pub fn stats(&self) -> WorkerSnapshot {
        WorkerSnapshot::combine(&self.worker_stats())
    }

    /// Signal every worker to stop and wait for them.
    ///
    /// Workers finish the call they are making; entries still queued stay in
    /// the queue.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "reporter worker ended abnormally");
            }
        }
        info!("reporter pool stopped");
    }
}

struct Worker {
    index: usize,
    queue: Arc<DeliveryQueue>,
    transport: Arc<dyn Transport>,
    stats: Arc<WorkerStats>,
    request_timeout: Duration,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    async fn run(mut self) {
        debug!(worker = self.index, "reporter worker started");
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            let request = tokio::select! {
                request = self.queue.dequeue() => request,
                _ = self.shutdown.changed() => break,
            };
            self.handle(request).await;
        }
        debug!(worker = self.index, "reporter worker stopped");
    }

    async fn handle(&mut self, mut request: PendingRequest) {
        let now = Instant::now();

        if request.is_expired(now) {
            debug!(worker = self.index, id = %request.id, path = %request.path, "request expired, dropping");
            self.stats.record_ignored();
            return;
        }

        if !request.is_due(now) {
            let due = request.due;
            self.queue.put_back(request);
            tokio::select! {
                _ = self.queue.wait_until(due) => {}
                _ = self.shutdown.changed() => {}
            }
            return;
        }

        let delay = now.saturating_duration_since(request.due);
        let timeout = request.timeout.unwrap_or(self.request_timeout);
        let started = Instant::now();
        let result = match tokio::time::timeout(timeout, self.transport.send(&request, timeout)).await
        {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::Timeout(timeout)),
        };
        let latency = started.elapsed();

        match result {
            Ok(status) => {
                self.stats.record_success(delay, latency);
                debug!(
                    worker = self.index,
                    id = %request.id,
                    method = %request.method,
                    path = %request.path,
                    status,
                    "delivered"
                );
            }
            Err(e) => {
                self.stats.record_failure(delay, latency);
                request.retries_left = request.retries_left.saturating_sub(1);
                if request.retries_left > 0 {
                    let backoff = retry_backoff(self.queue.retry_limit(), request.retries_left);
                    debug!(
                        worker = self.index,
                        id = %request.id,
                        path = %request.path,
                        error = %e,
                        retries_left = request.retries_left,
                        ?backoff,
                        "delivery failed, rescheduling"
                    );
                    request.due = Instant::now() + backoff;
                    self.queue.reschedule(request);
                } else {
                    warn!(
                        worker = self.index,
                        id = %request.id,
                        method = %request.method,
                        path = %request.path,
                        error = %e,
                        "delivery failed, retries exhausted; dropping"
                    );
                    self.stats.record_ignored();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        // retries_left after decrement: 4, 3, 2, 1
        let delays: Vec<u64> = (1..=4)
            .rev()
            .map(|left| retry_backoff(5, left).as_secs())
            .collect();
        assert_eq!(delays, vec![2, 4, 8, 16]);
    }

    #[test]
    fn backoff_saturates_instead_of_overflowing() {
        assert_eq!(retry_backoff(200, 0), Duration::from_secs(u64::MAX));
        assert_eq!(retry_backoff(5, 9), Duration::from_secs(1));
    }

    /// Records every attempt and answers with a fixed outcome.
    struct Scripted {
        fail: bool,
        attempts: Mutex<Vec<(String, u32, Instant)>>,
    }

    impl Scripted {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                fail,
                attempts: Mutex::new(Vec::new()),
            })
        }

        fn attempts(&self) -> Vec<(String, u32, Instant)> {
            self.attempts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for Scripted {
        async fn send(
            &self,
            request: &PendingRequest,
            _timeout: Duration,
        ) -> Result<u16, DeliveryError> {
            self.attempts.lock().unwrap().push((
                request.path.clone(),
                request.retries_left,
                Instant::now(),
            ));
            if self.fail {
                Err(DeliveryError::Status(500))
            } else {
                Ok(200)
            }
        }
    }

    fn pool_with(transport: Arc<Scripted>, queue: Arc<DeliveryQueue>, workers: usize) -> ReporterPool {
        ReporterPool::spawn(
            ReporterConfig {
                workers,
                request_timeout: Duration::from_secs(5),
            },
            queue,
            transport,
        )
    }

    async fn settle(pool: &ReporterPool, predicate: impl Fn(&WorkerSnapshot) -> bool) {
        for _ in 0..10_000 {
            if predicate(&pool.stats()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("pool did not settle: {:?}", pool.stats());
    }

    #[tokio::test(start_paused = true)]
    async fn success_is_counted_once() {
        let queue = Arc::new(DeliveryQueue::new());
        let transport = Scripted::new(false);
        let pool = pool_with(Arc::clone(&transport), Arc::clone(&queue), 2);

        queue.enqueue(PendingRequest::post("/ok/"));
        settle(&pool, |s| s.success_total == 1).await;

        assert_eq!(transport.attempts().len(), 1);
        assert_eq!(pool.stats().failure_total, 0);
        assert!(queue.is_empty());
        pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn five_failures_then_dropped() {
        let queue = Arc::new(DeliveryQueue::with_limits(100, 5));
        let transport = Scripted::new(true);
        let pool = pool_with(Arc::clone(&transport), Arc::clone(&queue), 1);

        queue.enqueue(PendingRequest::post("/always-fails/"));
        settle(&pool, |s| s.ignored_total == 1).await;
        // Give a stray reschedule the chance to show up.
        tokio::time::sleep(Duration::from_secs(120)).await;

        let attempts = transport.attempts();
        assert_eq!(attempts.len(), 5);
        let budgets: Vec<u32> = attempts.iter().map(|a| a.1).collect();
        assert_eq!(budgets, vec![5, 4, 3, 2, 1]);

        let gaps: Vec<u64> = attempts
            .windows(2)
            .map(|w| w[1].2.duration_since(w[0].2).as_secs())
            .collect();
        assert_eq!(gaps, vec![2, 4, 8, 16]);

        let stats = pool.stats();
        assert_eq!(stats.failure_total, 5);
        assert_eq!(stats.ignored_total, 1);
        assert_eq!(stats.success_total, 0);
        assert!(queue.is_empty());
        pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn expired_request_is_never_sent() {
        let queue = Arc::new(DeliveryQueue::new());
        let transport = Scripted::new(false);

        let now = Instant::now();
        queue.enqueue(PendingRequest::post("/stale/").with_expiry(now));
        queue.enqueue(PendingRequest::post("/fresh/").with_priority(90));

        let pool = pool_with(Arc::clone(&transport), Arc::clone(&queue), 1);
        settle(&pool, |s| s.ignored_total == 1 && s.success_total == 1).await;

        let paths: Vec<String> = transport.attempts().into_iter().map(|a| a.0).collect();
        assert_eq!(paths, vec!["/fresh/"]);
        pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn not_sent_before_due() {
        let queue = Arc::new(DeliveryQueue::new());
        let transport = Scripted::new(false);
        let pool = pool_with(Arc::clone(&transport), Arc::clone(&queue), 3);

        let start = Instant::now();
        queue.enqueue(PendingRequest::post("/later/").with_due(start + Duration::from_secs(30)));
        settle(&pool, |s| s.success_total == 1).await;

        let attempts = transport.attempts();
        assert_eq!(attempts.len(), 1);
        assert!(attempts[0].2 >= start + Duration::from_secs(30));
        pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn due_entries_go_out_in_priority_order() {
        let queue = Arc::new(DeliveryQueue::new());
        let transport = Scripted::new(false);

        queue.enqueue(PendingRequest::post("/p80/").with_priority(80));
        queue.enqueue(PendingRequest::post("/p10/").with_priority(10));
        queue.enqueue(PendingRequest::post("/p50/").with_priority(50));

        let pool = pool_with(Arc::clone(&transport), Arc::clone(&queue), 1);
        settle(&pool, |s| s.success_total == 3).await;

        let paths: Vec<String> = transport.attempts().into_iter().map(|a| a.0).collect();
        assert_eq!(paths, vec!["/p10/", "/p50/", "/p80/"]);
        pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn hung_transport_is_cut_off_by_timeout() {
        struct Hang;

        #[async_trait]
        impl Transport for Hang {
            async fn send(
                &self,
                _request: &PendingRequest,
                _timeout: Duration,
            ) -> Result<u16, DeliveryError> {
                std::future::pending().await
            }
        }

        let queue = Arc::new(DeliveryQueue::with_limits(10, 1));
        let pool = ReporterPool::spawn(
            ReporterConfig {
                workers: 1,
                request_timeout: Duration::from_secs(5),
            },
            Arc::clone(&queue),
            Arc::new(Hang),
        );
        queue.enqueue(PendingRequest::get("/hang/"));
        settle(&pool, |s| s.failure_total == 1 && s.ignored_total == 1).await;
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_stops_idle_workers() {
        let queue = Arc::new(DeliveryQueue::new());
        let pool = pool_with(Scripted::new(false), Arc::clone(&queue), 4);
        assert_eq!(pool.size(), 4);
        tokio::time::timeout(Duration::from_secs(5), pool.shutdown())
            .await
            .expect("idle workers should stop promptly");
    }
}
