//! FIFO job queue.
//!
//! Holds jobs waiting for installation with:
//! - Strict insertion-order processing (no priorities)
//! - 1-based position reporting on admission
//! - A capacity limit, rejecting admissions when full

use crate::error::{InstallError, Result};
use crate::protocol::InstallJob;
use std::collections::VecDeque;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Job queue shared between intake and the drain controller
pub struct JobQueue {
    /// Pending jobs, front = next to install
    jobs: Mutex<VecDeque<InstallJob>>,
    /// Maximum queue size
    max_size: usize,
}

impl JobQueue {
    /// Create a new job queue
    pub fn new(max_size: usize) -> Self {
        Self {
            jobs: Mutex::new(VecDeque::new()),
            max_size,
        }
    }

    /// Append a job to the back of the queue
    ///
    /// Returns the job's 1-based position.
    pub async fn enqueue(&self, job: InstallJob) -> Result<usize> {
        let mut jobs = self.jobs.lock().await;

        if jobs.len() >= self.max_size {
            warn!(
                "Queue at capacity ({}), rejecting {}",
                self.max_size, job.artifact_name
            );
            return Err(InstallError::QueueFull(self.max_size));
        }

        debug!("Enqueued {} ({})", job.artifact_name, job.short_id());
        jobs.push_back(job);
        Ok(jobs.len())
    }

    /// Remove and return the job at the front of the queue
    pub async fn dequeue_front(&self) -> Option<InstallJob> {
        self.jobs.lock().await.pop_front()
    }

    /// Get the current queue length
    pub async fn len(&self) -> usize {
        self.jobs.lock().await.len()
    }

    /// Check if queue is empty
    pub async fn is_empty(&self) -> bool {
        self.jobs.lock().await.is_empty()
    }

    /// Clone the first `n` jobs in processing order
    pub async fn peek_first_n(&self, n: usize) -> Vec<InstallJob> {
        self.jobs.lock().await.iter().take(n).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PayloadRef;

    fn job(name: &str) -> InstallJob {
        InstallJob::new(name.to_string(), PayloadRef::Path(name.into()))
    }

    #[tokio::test]
    async fn test_fifo_ordering() {
        let queue = JobQueue::new(10);
        let names = ["c.blueprint", "a.blueprint", "b.blueprint", "a.blueprint"];

        for name in names {
            queue.enqueue(job(name)).await.unwrap();
        }

        let mut drained = Vec::new();
        while let Some(job) = queue.dequeue_front().await {
            drained.push(job.artifact_name);
        }
        assert_eq!(drained, names);
    }

    #[tokio::test]
    async fn test_enqueue_reports_position() {
        let queue = JobQueue::new(10);
        assert_eq!(queue.enqueue(job("a.blueprint")).await.unwrap(), 1);
        assert_eq!(queue.enqueue(job("b.blueprint")).await.unwrap(), 2);

        queue.dequeue_front().await.unwrap();
        assert_eq!(queue.enqueue(job("c.blueprint")).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_dequeue_empty() {
        let queue = JobQueue::new(10);
        assert!(queue.dequeue_front().await.is_none());
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_capacity() {
        let queue = JobQueue::new(2);
        queue.enqueue(job("1.blueprint")).await.unwrap();
        queue.enqueue(job("2.blueprint")).await.unwrap();

        let result = queue.enqueue(job("3.blueprint")).await;
        assert!(matches!(result, Err(InstallError::QueueFull(2))));
        assert_eq!(queue.len().await, 2);
    }

    #[tokio::test]
    async fn test_peek_first_n() {
        let queue = JobQueue::new(10);
        for i in 0..5 {
            queue.enqueue(job(&format!("{i}.blueprint"))).await.unwrap();
        }

        let first = queue.peek_first_n(3).await;
        let names: Vec<_> = first.iter().map(|j| j.artifact_name.as_str()).collect();
        assert_eq!(names, ["0.blueprint", "1.blueprint", "2.blueprint"]);
        assert_eq!(queue.len().await, 5);

        assert_eq!(queue.peek_first_n(50).await.len(), 5);
    }
}
