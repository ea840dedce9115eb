//! Bounded work queue for background seeding.
//!
//! The relay frontend pushes accepted events here; a small pool of
//! workers runs the seeding handler with per-event dedup and exponential
//! backoff. Failures never reach the ingest path.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::event::Event;

type BoxFuture = Pin<Box<dyn Future<Output = crate::error::Result<()>> + Send>>;

/// Async job handler invoked once per queued event attempt.
pub type SeedJob = Arc<dyn Fn(Event) -> BoxFuture + Send + Sync>;

/// Queue tuning knobs.
#[derive(Debug, Clone)]
pub struct SeedingQueueConfig {
    /// Concurrent workers. Defaults to the CPU count.
    pub workers: usize,
    /// Attempts per event before it is dropped.
    pub max_attempts: u32,
    /// First backoff interval; doubles per attempt.
    pub backoff_base: Duration,
    /// Queue capacity; submissions beyond it are refused.
    pub capacity: usize,
}

impl Default for SeedingQueueConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2),
            max_attempts: 3,
            backoff_base: Duration::from_secs(5),
            capacity: 1024,
        }
    }
}

/// Bounded-concurrency seeding pool with per-event dedup.
pub struct SeedingQueue {
    tx: Mutex<Option<mpsc::Sender<Event>>>,
    pending: Arc<Mutex<HashSet<String>>>,
    closed: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl SeedingQueue {
    pub fn new<F, Fut>(job: F, config: SeedingQueueConfig) -> Arc<Self>
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = crate::error::Result<()>> + Send + 'static,
    {
        let job: SeedJob = Arc::new(move |ev| -> BoxFuture { Box::pin(job(ev)) });
        let (tx, rx) = mpsc::channel::<Event>(config.capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let pending: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
        let mut workers = Vec::new();
        for _ in 0..config.workers.max(1) {
            let rx = Arc::clone(&rx);
            let pending = Arc::clone(&pending);
            let job = Arc::clone(&job);
            let max_attempts = config.max_attempts.max(1);
            let base = config.backoff_base;
            workers.push(tokio::spawn(async move {
                loop {
                    let ev = match rx.lock().await.recv().await {
                        Some(ev) => ev,
                        None => break,
                    };
                    run_job(&job, ev.clone(), max_attempts, base).await;
                    pending.lock().remove(&ev.id);
                }
            }));
        }
        Arc::new(Self {
            tx: Mutex::new(Some(tx)),
            pending,
            closed: AtomicBool::new(false),
            workers: Mutex::new(workers),
        })
    }

    /// Enqueue an event. Returns false when the queue is closed, full, or
    /// already holds this event id.
    pub fn submit(&self, ev: Event) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        if !self.pending.lock().insert(ev.id.clone()) {
            return false;
        }
        let sender = self.tx.lock().clone();
        let id = ev.id.clone();
        match sender {
            Some(tx) => match tx.try_send(ev) {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(id = %id, "seeding queue refused event: {e}");
                    self.pending.lock().remove(&id);
                    false
                }
            },
            None => {
                self.pending.lock().remove(&id);
                false
            }
        }
    }

    /// Number of queued or in-flight events.
    pub fn backlog(&self) -> usize {
        self.pending.lock().len()
    }

    /// Refuse new submissions and wait for in-flight work to finish.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.tx.lock().take();
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            let _ = worker.await;
        }
    }
}

async fn run_job(job: &SeedJob, ev: Event, max_attempts: u32, base: Duration) {
    for attempt in 0..max_attempts {
        match job(ev.clone()).await {
            Ok(()) => return,
            Err(e) => {
                tracing::warn!(id = %ev.id, attempt, "seeding attempt failed: {e}");
                if attempt + 1 < max_attempts {
                    tokio::time::sleep(base * 2u32.pow(attempt)).await;
                }
            }
        }
    }
    tracing::warn!(id = %ev.id, "dropping event after {max_attempts} failed seeding attempts");
}
