//! Background job queue for long-running blockchain work.
//!
//! Jobs flow through a bounded `tokio` channel to a fixed pool of workers. A
//! job is tracked from enqueue until its handler returns; enqueuing a job that is
//! already tracked is a no-op, so one document never has two approvals in
//! flight.

use crate::config::JobConfig;
use crate::domain::document::DocumentId;
use crate::error::{MarketError, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Job {
    ApproveDocument(DocumentId),
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: Job) -> Result<()>;
}

#[derive(Clone)]
pub struct JobQueue {
    sender: mpsc::Sender<Job>,
    in_flight: Arc<Mutex<HashSet<Job>>>,
}

impl JobQueue {
    /// Spawns `config.workers` workers feeding jobs to `handler`.
    pub fn start(handler: Arc<dyn JobHandler>, config: &JobConfig) -> (Self, Vec<JoinHandle<()>>) {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        let in_flight = Arc::new(Mutex::new(HashSet::new()));

        let workers = (0..config.workers.max(1))
            .map(|worker| {
                let receiver = receiver.clone();
                let in_flight = in_flight.clone();
                let handler = handler.clone();
                tokio::spawn(async move {
                    loop {
                        let next = receiver.lock().await.recv().await;
                        let Some(job) = next else { break };
                        debug!(worker, ?job, "job started");
                        if let Err(e) = handler.handle(job).await {
                            error!(worker, ?job, error = %e, "job failed");
                        }
                        in_flight.lock().await.remove(&job);
                    }
                    debug!(worker, "job worker stopped");
                })
            })
            .collect();

        (Self { sender, in_flight }, workers)
    }

    /// Queues `job`; returns `false` if the same job is already pending or running.
    pub async fn enqueue(&self, job: Job) -> Result<bool> {
        let mut in_flight = self.in_flight.lock().await;
        if in_flight.contains(&job) {
            return Ok(false);
        }
        self.sender.try_send(job).map_err(|e| {
            MarketError::DocumentProcessingError(format!("Failed to queue job: {e}"))
        })?;
        in_flight.insert(job);
        Ok(true)
    }

    pub async fn in_flight(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    /// Waits until every queued job has finished, or `timeout` elapses.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.in_flight().await > 0 {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    struct CountingHandler {
        handled: AtomicU32,
        delay: Duration,
    }

    #[async_trait]
    impl JobHandler for CountingHandler {
        async fn handle(&self, _job: Job) -> Result<()> {
            tokio::time::sleep(self.delay).await;
            self.handled.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_jobs_are_processed() {
        let handler = Arc::new(CountingHandler {
            handled: AtomicU32::new(0),
            delay: Duration::ZERO,
        });
        let (queue, _workers) = JobQueue::start(handler.clone(), &JobConfig::default());
        for _ in 0..5 {
            assert!(
                queue
                    .enqueue(Job::ApproveDocument(Uuid::new_v4()))
                    .await
                    .unwrap()
            );
        }
        assert!(queue.wait_idle(Duration::from_secs(5)).await);
        assert_eq!(handler.handled.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_duplicate_job_is_ignored_while_in_flight() {
        let handler = Arc::new(CountingHandler {
            handled: AtomicU32::new(0),
            delay: Duration::from_millis(50),
        });
        let (queue, _workers) = JobQueue::start(handler.clone(), &JobConfig::default());
        let job = Job::ApproveDocument(Uuid::new_v4());

        assert!(queue.enqueue(job).await.unwrap());
        assert!(!queue.enqueue(job).await.unwrap());
        assert!(queue.wait_idle(Duration::from_secs(5)).await);
        assert_eq!(handler.handled.load(Ordering::SeqCst), 1);

        // once finished the same job may be queued again
        assert!(queue.enqueue(job).await.unwrap());
        assert!(queue.wait_idle(Duration::from_secs(5)).await);
        assert_eq!(handler.handled.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_full_queue_is_an_error() {
        let handler = Arc::new(CountingHandler {
            handled: AtomicU32::new(0),
            delay: Duration::from_millis(200),
        });
        let config = JobConfig {
            workers: 1,
            queue_capacity: 1,
        };
        let (queue, _workers) = JobQueue::start(handler, &config);

        let mut results = Vec::new();
        for _ in 0..4 {
            results.push(queue.enqueue(Job::ApproveDocument(Uuid::new_v4())).await);
        }
        assert!(
            results
                .iter()
                .any(|r| matches!(r, Err(MarketError::DocumentProcessingError(_))))
        );
    }
}
