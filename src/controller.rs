//! Drain controller: the single-flight loop that works through the queue.
//!
//! A drain cycle takes jobs from the front of the queue one at a time,
//! materializes the artifact, runs the installer and reports the outcome,
//! pausing between jobs. Only one cycle runs at a time; overlapping `run`
//! calls return immediately. A stop request is honored between jobs and never
//! interrupts a running install. Once closed, the controller starts no new
//! cycles.

use crate::artifact::{validate_artifact_name, ArtifactStore};
use crate::error::{InstallError, Result};
use crate::matcher::PromptMatcher;
use crate::progress::{publish_quietly, ProgressReporter, StatusSink};
use crate::protocol::{
    Config, InstallJob, InstallResult, JobSummary, PayloadRef, QueueSnapshot, StatusUpdate,
};
use crate::queue::JobQueue;
use crate::supervisor::{Launcher, Supervisor};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, info};

/// Process-wide drain state
#[derive(Debug, Default)]
pub struct RunState {
    processing: AtomicBool,
    stop_requested: AtomicBool,
    closed: AtomicBool,
}

impl RunState {
    /// Claim the drain; `false` if a cycle is already running
    fn try_begin(&self) -> bool {
        let claimed = self
            .processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if claimed {
            self.stop_requested.store(false, Ordering::SeqCst);
        }
        claimed
    }

    fn finish(&self) {
        self.stop_requested.store(false, Ordering::SeqCst);
        self.processing.store(false, Ordering::SeqCst);
    }

    fn request_stop(&self) -> bool {
        if !self.is_processing() {
            return false;
        }
        self.stop_requested.store(true, Ordering::SeqCst);
        true
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::SeqCst)
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// What a call to `run` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Another drain cycle was in progress
    AlreadyRunning,
    /// Nothing was queued
    Empty,
    /// The controller is shutting down
    Closed,
    /// A cycle ran to completion or until stopped
    Completed { processed: usize, stopped: bool },
}

/// A job admitted to the queue
#[derive(Debug, Clone)]
pub struct Submission {
    pub job: InstallJob,
    /// 1-based queue position
    pub position: usize,
    /// Whether a drain cycle was running at admission
    pub processing: bool,
}

/// Resets the run state even if the drain future is dropped mid-cycle
struct DrainGuard<'a> {
    state: &'a RunState,
    idle: &'a Notify,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.state.finish();
        self.idle.notify_waiters();
    }
}

pub struct DrainController {
    queue: JobQueue,
    state: RunState,
    idle: Notify,
    supervisor: Supervisor,
    artifacts: ArtifactStore,
    sink: Arc<dyn StatusSink>,
    cooldown: Duration,
    progress_interval: Duration,
    output_limit: usize,
}

impl DrainController {
    pub fn new(
        config: &Config,
        launcher: Arc<dyn Launcher>,
        matcher: PromptMatcher,
        sink: Arc<dyn StatusSink>,
    ) -> Self {
        Self {
            queue: JobQueue::new(config.queue_max),
            state: RunState::default(),
            idle: Notify::new(),
            supervisor: Supervisor::new(
                launcher,
                matcher,
                config.install_root.clone(),
                config.install_timeout,
            ),
            artifacts: ArtifactStore::new(config.install_root.clone(), config.staging_dir.clone()),
            sink,
            cooldown: config.cooldown,
            progress_interval: config.progress_interval,
            output_limit: config.output_limit,
        }
    }

    /// Admit an artifact to the queue
    pub async fn submit(&self, artifact_name: String, payload: PayloadRef) -> Result<Submission> {
        validate_artifact_name(&artifact_name)?;

        let job = InstallJob::new(artifact_name, payload);
        let position = self.queue.enqueue(job.clone()).await?;
        let processing = self.state.is_processing();

        info!(
            "Added {} to queue ({}). Position: {}",
            job.artifact_name,
            job.short_id(),
            position
        );
        publish_quietly(
            self.sink.as_ref(),
            job.id,
            &job.artifact_name,
            StatusUpdate::Queued {
                position,
                processing,
            },
        )
        .await;

        Ok(Submission {
            job,
            position,
            processing,
        })
    }

    /// Run one drain cycle, unless one is already running
    pub async fn run(&self) -> DrainOutcome {
        if self.state.is_closed() {
            debug!("Controller closed, not starting a drain cycle");
            return DrainOutcome::Closed;
        }
        if self.queue.is_empty().await {
            debug!("Queue is empty, nothing to process");
            return DrainOutcome::Empty;
        }
        if !self.state.try_begin() {
            info!("Still processing previous batch, skipping this run");
            return DrainOutcome::AlreadyRunning;
        }
        let _guard = DrainGuard {
            state: &self.state,
            idle: &self.idle,
        };

        // `close` may have landed between the check above and the claim
        if self.state.is_closed() {
            return DrainOutcome::Closed;
        }
        let queued = self.queue.len().await;
        if queued == 0 {
            debug!("Queue is empty, nothing to process");
            return DrainOutcome::Empty;
        }
        info!("Starting to process {} job(s) in queue", queued);

        let mut processed = 0;
        let mut stopped = false;

        loop {
            if self.state.is_stop_requested() {
                info!("Stop requested, halting queue processing");
                stopped = true;
                break;
            }

            let Some(job) = self.queue.dequeue_front().await else {
                break;
            };
            info!(
                "Processing {} ({}). Remaining in queue: {}",
                job.artifact_name,
                job.short_id(),
                self.queue.len().await
            );

            self.process_job_guarded(job).await;
            processed += 1;

            if !self.queue.is_empty().await && !self.state.is_stop_requested() {
                info!("Waiting {:?} before next job", self.cooldown);
                tokio::time::sleep(self.cooldown).await;
            }
        }

        info!(
            "Drain cycle finished: {} processed, {} still queued",
            processed,
            self.queue.len().await
        );
        DrainOutcome::Completed { processed, stopped }
    }

    /// Stop starting drain cycles and halt the running one after its job
    ///
    /// Returns `true` if a cycle was running. Pair with `wait_idle`.
    pub fn close(&self) -> bool {
        self.state.closed.store(true, Ordering::SeqCst);
        self.state.request_stop()
    }

    /// Ask the running drain cycle to halt after the current job
    ///
    /// Returns `false` when no cycle is running.
    pub fn request_stop(&self) -> bool {
        let accepted = self.state.request_stop();
        if accepted {
            info!("Stop requested. Current installation will finish, then processing halts");
        } else {
            info!("Stop requested but no installations are running");
        }
        accepted
    }

    pub async fn snapshot(&self, limit: usize) -> QueueSnapshot {
        let jobs = self.queue.peek_first_n(limit).await;
        QueueSnapshot {
            length: self.queue.len().await,
            processing: self.state.is_processing(),
            stop_requested: self.state.is_stop_requested(),
            jobs: jobs.iter().map(JobSummary::from).collect(),
        }
    }

    pub fn is_processing(&self) -> bool {
        self.state.is_processing()
    }

    /// Resolve once no drain cycle is running
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.state.is_processing() {
                return;
            }
            notified.await;
        }
    }

    /// Process one job, turning errors and panics into a `Failed` report
    async fn process_job_guarded(&self, job: InstallJob) {
        let outcome = AssertUnwindSafe(self.process_job(&job))
            .catch_unwind()
            .await;

        let error = match outcome {
            Ok(Ok(result)) => {
                info!(
                    "{} {}",
                    job.artifact_name,
                    if result.succeeded {
                        "installed successfully"
                    } else {
                        "failed to install"
                    }
                );
                return;
            }
            Ok(Err(e)) => e,
            Err(panic) => {
                self.artifacts.cleanup(&self.artifacts.staging_path(&job)).await;
                InstallError::Internal {
                    artifact: job.artifact_name.clone(),
                    reason: panic_message(panic.as_ref()),
                }
            }
        };

        error!("Error processing {}: {}", job.artifact_name, error);
        publish_quietly(
            self.sink.as_ref(),
            job.id,
            &job.artifact_name,
            StatusUpdate::Failed {
                error: error.to_string(),
            },
        )
        .await;
    }

    async fn process_job(&self, job: &InstallJob) -> Result<InstallResult> {
        let sink = self.sink.as_ref();
        publish_quietly(sink, job.id, &job.artifact_name, StatusUpdate::Started).await;

        let placed = self.artifacts.materialize(job).await?;
        publish_quietly(sink, job.id, &job.artifact_name, StatusUpdate::Installing).await;

        let mut reporter = ProgressReporter::new(
            Arc::clone(&self.sink),
            job.id,
            job.artifact_name.clone(),
            self.progress_interval,
            self.output_limit,
        );
        let result = self.supervisor.run(&job.artifact_name, &mut reporter).await;

        self.artifacts.cleanup(&placed.staging).await;
        reporter.finish(&result).await;
        Ok(result)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}
