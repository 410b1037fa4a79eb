//! Progress reporting for running installs.
//!
//! Turns the installer's growing output into status updates for the
//! downstream status channel:
//! - At most one progress update per throttle interval
//! - Output truncated to its most recent characters
//! - Downstream failures logged and swallowed, never surfaced to the install

use crate::protocol::{InstallResult, JobEvent, StatusUpdate};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Downstream status channel
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn publish(&self, event: JobEvent) -> Result<()>;
}

/// Status sink that fans events out to socket subscribers
pub struct BroadcastSink {
    tx: broadcast::Sender<JobEvent>,
}

impl BroadcastSink {
    pub fn new(tx: broadcast::Sender<JobEvent>) -> Self {
        Self { tx }
    }

    /// Subscribe to all job events published after this call
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl StatusSink for BroadcastSink {
    async fn publish(&self, event: JobEvent) -> Result<()> {
        match &event.update {
            StatusUpdate::Progress { output } => {
                debug!("{}: progress ({} chars)", event.artifact_name, output.len())
            }
            StatusUpdate::Finished {
                succeeded,
                exit_code,
                ..
            } => info!(
                "{}: finished (succeeded: {}, exit code: {:?})",
                event.artifact_name, succeeded, exit_code
            ),
            update => info!("{}: {:?}", event.artifact_name, update),
        }

        // No subscribers is not an error; nobody is watching this job
        let _ = self.tx.send(event);
        Ok(())
    }
}

/// Publish an update, logging instead of propagating failures
pub async fn publish_quietly(
    sink: &dyn StatusSink,
    job_id: Uuid,
    artifact_name: &str,
    update: StatusUpdate,
) {
    let event = JobEvent {
        job_id,
        artifact_name: artifact_name.to_string(),
        update,
    };
    if let Err(e) = sink.publish(event).await {
        warn!("Failed to publish status for {}: {:#}", artifact_name, e);
    }
}

/// Return the last `limit` characters of `text`
pub fn tail(text: &str, limit: usize) -> &str {
    let count = text.chars().count();
    if count <= limit {
        return text;
    }
    match text.char_indices().nth(count - limit) {
        Some((start, _)) => &text[start..],
        None => "",
    }
}

/// Throttled reporter for a single job
pub struct ProgressReporter {
    sink: Arc<dyn StatusSink>,
    job_id: Uuid,
    artifact_name: String,
    /// Minimum time between progress updates
    min_interval: Duration,
    /// Maximum characters per update
    output_limit: usize,
    last_update: Option<Instant>,
}

impl ProgressReporter {
    pub fn new(
        sink: Arc<dyn StatusSink>,
        job_id: Uuid,
        artifact_name: String,
        min_interval: Duration,
        output_limit: usize,
    ) -> Self {
        Self {
            sink,
            job_id,
            artifact_name,
            min_interval,
            output_limit,
            last_update: None,
        }
    }

    /// Report the accumulated output so far
    ///
    /// Returns `true` if an update was published, `false` if throttled.
    pub async fn on_output(&mut self, output: &str) -> bool {
        let now = Instant::now();
        if let Some(last) = self.last_update {
            if now.duration_since(last) < self.min_interval {
                return false;
            }
        }
        self.last_update = Some(now);

        let snapshot = tail(output, self.output_limit).to_string();
        publish_quietly(
            self.sink.as_ref(),
            self.job_id,
            &self.artifact_name,
            StatusUpdate::Progress { output: snapshot },
        )
        .await;
        true
    }

    /// Publish the terminal summary for the job
    pub async fn finish(&self, result: &InstallResult) {
        publish_quietly(
            self.sink.as_ref(),
            self.job_id,
            &self.artifact_name,
            StatusUpdate::Finished {
                succeeded: result.succeeded,
                exit_code: result.exit_code,
                output: tail(&result.output, self.output_limit).to_string(),
            },
        )
        .await;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tokio::sync::Mutex;

    /// Sink that records every event with the (tokio) time it arrived
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub events: Mutex<Vec<(Instant, JobEvent)>>,
    }

    impl RecordingSink {
        pub async fn updates(&self) -> Vec<StatusUpdate> {
            self.events
                .lock()
                .await
                .iter()
                .map(|(_, e)| e.update.clone())
                .collect()
        }

        pub async fn finished(&self) -> Vec<(Instant, String, bool, String)> {
            self.events
                .lock()
                .await
                .iter()
                .filter_map(|(at, e)| match &e.update {
                    StatusUpdate::Finished {
                        succeeded, output, ..
                    } => Some((*at, e.artifact_name.clone(), *succeeded, output.clone())),
                    _ => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl StatusSink for RecordingSink {
        async fn publish(&self, event: JobEvent) -> Result<()> {
            self.events.lock().await.push((Instant::now(), event));
            Ok(())
        }
    }

    /// Sink whose downstream is always unavailable
    pub(crate) struct FailingSink;

    #[async_trait]
    impl StatusSink for FailingSink {
        async fn publish(&self, _event: JobEvent) -> Result<()> {
            anyhow::bail!("status channel unavailable")
        }
    }

    fn reporter(sink: Arc<dyn StatusSink>, limit: usize) -> ProgressReporter {
        ProgressReporter::new(
            sink,
            Uuid::new_v4(),
            "a.blueprint".to_string(),
            Duration::from_millis(500),
            limit,
        )
    }

    #[test]
    fn test_tail_keeps_most_recent() {
        let text: String = (0..3000).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
        let cut = tail(&text, 1900);
        assert_eq!(cut.chars().count(), 1900);
        assert_eq!(cut, &text[1100..]);
    }

    #[test]
    fn test_tail_short_text_unchanged() {
        assert_eq!(tail("short", 1900), "short");
        assert_eq!(tail("", 10), "");
    }

    #[test]
    fn test_tail_counts_characters() {
        let text = "ééééé";
        assert_eq!(tail(text, 2), "éé");
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_burst() {
        let sink = Arc::new(RecordingSink::default());
        let mut reporter = reporter(sink.clone(), 1900);

        let mut output = String::new();
        let mut published = 0;
        for i in 0..20 {
            output.push_str(&format!("line {}\n", i));
            if reporter.on_output(&output).await {
                published += 1;
            }
        }
        assert_eq!(published, 1);

        tokio::time::advance(Duration::from_millis(499)).await;
        assert!(!reporter.on_output(&output).await);

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(reporter.on_output(&output).await);

        let updates = sink.updates().await;
        assert_eq!(updates.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_truncated() {
        let sink = Arc::new(RecordingSink::default());
        let mut reporter = reporter(sink.clone(), 10);

        reporter.on_output("0123456789abcdef").await;

        let updates = sink.updates().await;
        assert_eq!(
            updates,
            vec![StatusUpdate::Progress {
                output: "6789abcdef".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_downstream_errors_swallowed() {
        let mut reporter = reporter(Arc::new(FailingSink), 1900);
        assert!(reporter.on_output("line\n").await);
        reporter
            .finish(&InstallResult {
                succeeded: true,
                exit_code: Some(0),
                output: "line\n".to_string(),
            })
            .await;
    }

    #[tokio::test]
    async fn test_finish_publishes_tail() {
        let sink = Arc::new(RecordingSink::default());
        let reporter = reporter(sink.clone(), 4);

        reporter
            .finish(&InstallResult {
                succeeded: false,
                exit_code: Some(1),
                output: "boom: missing".to_string(),
            })
            .await;

        assert_eq!(
            sink.updates().await,
            vec![StatusUpdate::Finished {
                succeeded: false,
                exit_code: Some(1),
                output: "sing".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_broadcast_sink_without_subscribers() {
        let (tx, rx) = broadcast::channel(4);
        drop(rx);
        let sink = BroadcastSink::new(tx);
        let event = JobEvent {
            job_id: Uuid::new_v4(),
            artifact_name: "a.blueprint".to_string(),
            update: StatusUpdate::Started,
        };
        assert!(sink.publish(event).await.is_ok());
    }
}
