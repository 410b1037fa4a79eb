//! Protocol types for blueprint-queue.
//!
//! Defines the job model, install results, the JSON messages spoken on the
//! control socket, and the runtime configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Where the bytes of an artifact can be fetched from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadRef {
    /// File on the local filesystem
    Path(PathBuf),
    /// HTTP(S) download
    Url(String),
}

/// One pending installation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallJob {
    /// Unique job ID
    pub id: Uuid,
    /// Installer file name, also the file name under the install root
    pub artifact_name: String,
    /// Handle to the artifact bytes
    pub payload: PayloadRef,
    /// Unix timestamp in milliseconds
    pub submitted_at: u64,
}

impl InstallJob {
    pub fn new(artifact_name: String, payload: PayloadRef) -> Self {
        Self {
            id: Uuid::new_v4(),
            artifact_name,
            payload,
            submitted_at: current_timestamp_ms(),
        }
    }

    /// Short form of the job ID for log lines
    pub fn short_id(&self) -> String {
        self.id.simple().to_string()[..8].to_string()
    }
}

/// Outcome of one installer run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallResult {
    pub succeeded: bool,
    /// `None` when the process never started or was killed
    pub exit_code: Option<i32>,
    pub output: String,
}

impl InstallResult {
    pub fn failed(output: String) -> Self {
        Self {
            succeeded: false,
            exit_code: None,
            output,
        }
    }
}

/// Queue entry as shown in status snapshots
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: Uuid,
    pub artifact_name: String,
    pub submitted_at: u64,
}

impl From<&InstallJob> for JobSummary {
    fn from(job: &InstallJob) -> Self {
        Self {
            id: job.id,
            artifact_name: job.artifact_name.clone(),
            submitted_at: job.submitted_at,
        }
    }
}

/// Point-in-time view of the queue and drain state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    /// Total number of queued jobs
    pub length: usize,
    /// Whether a drain cycle is running
    pub processing: bool,
    /// Whether a stop was requested for the running drain cycle
    pub stop_requested: bool,
    /// First jobs in processing order
    pub jobs: Vec<JobSummary>,
}

/// Status of a single job, published to the downstream status channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StatusUpdate {
    /// Admitted to the queue at the given 1-based position
    Queued { position: usize, processing: bool },
    /// Dequeued; the artifact is being fetched
    Started,
    /// Artifact in place; the installer is running
    Installing,
    /// Throttled tail of the installer output
    Progress { output: String },
    /// Installer finished (successfully or not)
    Finished {
        succeeded: bool,
        exit_code: Option<i32>,
        output: String,
    },
    /// The job could not be run (transfer or internal error)
    Failed { error: String },
}

impl StatusUpdate {
    /// Whether no further updates follow for this job
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished { .. } | Self::Failed { .. })
    }
}

/// A status update tagged with the job it belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: Uuid,
    pub artifact_name: String,
    pub update: StatusUpdate,
}

/// Message sent to the control socket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Queue an artifact for installation
    Submit {
        artifact_name: String,
        payload: PayloadRef,
    },
    /// Query the queue
    Status {
        /// Maximum number of jobs to list
        #[serde(default)]
        limit: Option<usize>,
    },
    /// Halt the running drain cycle after the current install
    Stop,
    /// Start a drain cycle now
    Run,
    /// Graceful shutdown request
    Shutdown,
}

/// Response sent back through the control socket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// Artifact admitted to the queue
    Queued {
        id: Uuid,
        artifact_name: String,
        /// 1-based queue position
        position: usize,
        /// Whether a drain cycle is currently running
        processing: bool,
    },
    /// Artifact not admitted
    Rejected { artifact_name: String, reason: String },
    /// Streamed status update for a submitted job
    JobStatus {
        id: Uuid,
        artifact_name: String,
        update: StatusUpdate,
    },
    /// Queue status
    Status(QueueSnapshot),
    /// Stop acknowledgement; `accepted` is false when nothing was running
    Stop { accepted: bool },
    /// Drain cycle triggered
    RunTriggered,
    /// Shutdown acknowledged
    ShutdownAck,
    /// Error response
    Error {
        /// Error message
        message: String,
    },
}

impl From<JobEvent> for Response {
    fn from(event: JobEvent) -> Self {
        Response::JobStatus {
            id: event.job_id,
            artifact_name: event.artifact_name,
            update: event.update,
        }
    }
}

/// Runtime configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Unix socket path
    pub socket_path: String,
    /// Directory the installer runs in and artifacts are copied to
    pub install_root: PathBuf,
    /// Directory for transient working copies of artifacts
    pub staging_dir: PathBuf,
    /// Installer executable
    pub installer_binary: String,
    /// Flag passed before the artifact name
    pub install_flag: String,
    /// Accepted artifact file extensions
    pub extensions: Vec<String>,
    /// Maximum jobs in the queue
    pub queue_max: usize,
    /// Periodic drain interval
    pub run_interval: Duration,
    /// Pause between two installs of the same drain cycle
    pub cooldown: Duration,
    /// Minimum time between two progress updates
    pub progress_interval: Duration,
    /// Maximum characters of output in a status update
    pub output_limit: usize,
    /// Kill the installer after this long (no limit when `None`)
    pub install_timeout: Option<Duration>,
    /// Trigger a drain cycle whenever a job is submitted
    pub run_on_submit: bool,
    /// Default number of jobs listed by status queries
    pub status_limit: usize,
}

impl Config {
    /// Whether the artifact name carries an accepted extension
    pub fn accepts(&self, artifact_name: &str) -> bool {
        self.extensions
            .iter()
            .any(|ext| artifact_name.ends_with(ext.as_str()))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_path: "/tmp/blueprint-queue.sock".to_string(),
            install_root: PathBuf::from("/var/www/pterodactyl"),
            staging_dir: std::env::temp_dir(),
            installer_binary: "blueprint".to_string(),
            install_flag: "-i".to_string(),
            extensions: vec![".blueprint".to_string()],
            queue_max: 500,
            run_interval: Duration::from_secs(5 * 60),
            cooldown: Duration::from_secs(10),
            progress_interval: Duration::from_millis(500),
            output_limit: 1900,
            install_timeout: None,
            run_on_submit: false,
            status_limit: 10,
        }
    }
}

/// Get current timestamp in milliseconds
pub fn current_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submit_request_deserialization() {
        let json = r#"{"type":"submit","artifact_name":"theme.blueprint","payload":{"path":"/tmp/theme.blueprint"}}"#;
        let req: Request = serde_json::from_str(json).unwrap();
        match req {
            Request::Submit {
                artifact_name,
                payload,
            } => {
                assert_eq!(artifact_name, "theme.blueprint");
                assert_eq!(payload, PayloadRef::Path("/tmp/theme.blueprint".into()));
            }
            other => panic!("Unexpected request: {:?}", other),
        }
    }

    #[test]
    fn test_status_request_limit_optional() {
        let req: Request = serde_json::from_str(r#"{"type":"status"}"#).unwrap();
        assert!(matches!(req, Request::Status { limit: None }));
    }

    #[test]
    fn test_job_status_serialization() {
        let response = Response::JobStatus {
            id: Uuid::nil(),
            artifact_name: "a.blueprint".to_string(),
            update: StatusUpdate::Finished {
                succeeded: true,
                exit_code: Some(0),
                output: "done".to_string(),
            },
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"type\":\"job_status\""));
        assert!(json.contains("\"status\":\"finished\""));
        assert!(json.contains("\"exit_code\":0"));
    }

    #[test]
    fn test_config_accepts_extension() {
        let config = Config::default();
        assert!(config.accepts("theme.blueprint"));
        assert!(!config.accepts("theme.zip"));
        assert!(!config.accepts("blueprint"));
    }

    #[test]
    fn test_terminal_updates() {
        assert!(StatusUpdate::Failed {
            error: "x".to_string()
        }
        .is_terminal());
        assert!(!StatusUpdate::Started.is_terminal());
        assert!(!StatusUpdate::Progress {
            output: String::new()
        }
        .is_terminal());
    }
}
