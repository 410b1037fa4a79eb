//! Unix domain socket server for the install queue.
//!
//! Provides a socket interface (default `/tmp/blueprint-queue.sock`) that
//! accepts newline-delimited JSON requests:
//! - Artifact submissions
//! - Status queries
//! - Stop and run commands
//! - Shutdown commands
//!
//! For submissions, the connection stays open and streams every status
//! update of the job (Started → Installing → Progress → Finished/Failed)
//! back to the client.

use crate::controller::DrainController;
use crate::intake::IntakeHandle;
use crate::protocol::{Config, JobEvent, PayloadRef, Request, Response, StatusUpdate};
use crate::trigger;
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Everything a connection needs to serve requests
#[derive(Clone)]
pub struct ConnectionContext {
    pub config: Arc<Config>,
    pub controller: Arc<DrainController>,
    pub intake: IntakeHandle,
    /// Job events, subscribed to per connection
    pub events: broadcast::Sender<JobEvent>,
    /// Cancelled when a shutdown is requested
    pub shutdown: CancellationToken,
}

/// Socket server for queue requests
pub struct SocketServer {
    /// Path to the Unix socket
    socket_path: String,
    context: ConnectionContext,
}

impl SocketServer {
    /// Create a new socket server
    pub fn new(socket_path: String, context: ConnectionContext) -> Self {
        Self {
            socket_path,
            context,
        }
    }

    /// Bind the socket
    pub fn bind(&self) -> Result<UnixListener> {
        // Remove existing socket if present
        let path = Path::new(&self.socket_path);
        if path.exists() {
            std::fs::remove_file(path).context("Failed to remove existing socket")?;
        }

        // Create parent directory if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .context(format!("Failed to create socket directory {:?}", parent))?;
        }

        let listener = UnixListener::bind(&self.socket_path)
            .context(format!("Failed to bind socket at {}", self.socket_path))?;

        // Set socket permissions (0600 - owner only)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            if let Err(e) = std::fs::set_permissions(&self.socket_path, perms) {
                warn!("Failed to set socket permissions: {}", e);
            }
        }

        info!("Socket server listening at {}", self.socket_path);
        Ok(listener)
    }

    /// Accept connections until shutdown, then remove the socket file
    pub async fn serve(self, listener: UnixListener) {
        let shutdown = self.context.shutdown.clone();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let context = self.context.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, context).await {
                                error!("Connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                },
            }
        }

        drop(listener);
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            debug!("Failed to remove socket {}: {}", self.socket_path, e);
        }
        info!("Socket server stopped");
    }
}

/// Handle a single client connection
///
/// For submissions, this connection keeps streaming job updates until the
/// job reaches `finished` or `failed`.
async fn handle_connection(stream: UnixStream, context: ConnectionContext) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    // Subscribe before any submission so no update of our jobs is missed
    let mut events = context.events.subscribe();

    // Jobs submitted on this connection that have not finished yet
    let mut pending: HashSet<Uuid> = HashSet::new();

    debug!("New client connection");

    loop {
        tokio::select! {
            result = reader.read_line(&mut line) => {
                let bytes_read = result?;

                if bytes_read == 0 {
                    debug!("Client disconnected");
                    break;
                }

                let trimmed = line.trim();
                if trimmed.is_empty() {
                    line.clear();
                    continue;
                }

                match serde_json::from_str::<Request>(trimmed) {
                    Ok(request) => {
                        let is_shutdown = matches!(request, Request::Shutdown);
                        let response = handle_request(request, &context).await;

                        if let Response::Queued { id, .. } = &response {
                            debug!("Streaming updates for job {}", id);
                            pending.insert(*id);
                        }
                        write_response(&mut writer, &response).await?;

                        if is_shutdown {
                            return Ok(());
                        }
                    }
                    Err(e) => {
                        let response = Response::Error {
                            message: format!("Invalid JSON: {}", e),
                        };
                        write_response(&mut writer, &response).await?;
                    }
                }

                line.clear();
            }

            result = events.recv() => {
                match result {
                    Ok(event) => {
                        if !pending.contains(&event.job_id) {
                            continue;
                        }
                        // Queued is answered directly by the request handler
                        if matches!(event.update, StatusUpdate::Queued { .. }) {
                            continue;
                        }

                        let id = event.job_id;
                        let terminal = event.update.is_terminal();
                        write_response(&mut writer, &Response::from(event)).await?;

                        if terminal {
                            debug!("Job {} reached a final state", id);
                            pending.remove(&id);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Event receiver lagged by {} messages - some job updates were lost", n);
                        if !pending.is_empty() {
                            warn!("Jobs that may have lost updates: {:?}", pending);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Event channel closed");
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}

async fn write_response(writer: &mut OwnedWriteHalf, response: &Response) -> Result<()> {
    let response_json = serde_json::to_string(response)?;
    writer.write_all(response_json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

/// Handle a single request
async fn handle_request(request: Request, context: &ConnectionContext) -> Response {
    match request {
        Request::Submit {
            artifact_name,
            payload,
        } => {
            debug!("Submit request: {}", artifact_name);

            if !context.config.accepts(&artifact_name) {
                info!("Rejected {}: unsupported file type", artifact_name);
                return Response::Rejected {
                    reason: format!(
                        "Unsupported file type; expected {}",
                        context.config.extensions.join(", ")
                    ),
                    artifact_name,
                };
            }

            match context.intake.submit(artifact_name.clone(), payload).await {
                Ok(submission) => Response::Queued {
                    id: submission.job.id,
                    artifact_name: submission.job.artifact_name,
                    position: submission.position,
                    processing: submission.processing,
                },
                Err(e) => Response::Rejected {
                    artifact_name,
                    reason: format!("{:#}", e),
                },
            }
        }

        Request::Status { limit } => {
            let limit = limit.unwrap_or(context.config.status_limit);
            Response::Status(context.controller.snapshot(limit).await)
        }

        Request::Stop => Response::Stop {
            accepted: context.controller.request_stop(),
        },

        Request::Run => {
            info!("Run requested via socket");
            trigger::trigger_now(&context.controller);
            Response::RunTriggered
        }

        Request::Shutdown => {
            info!("Shutdown requested via socket");
            context.shutdown.cancel();
            Response::ShutdownAck
        }
    }
}

/// Client for connecting to the socket (for testing and integration)
pub struct SocketClient {
    socket_path: String,
}

impl SocketClient {
    pub fn new(socket_path: String) -> Self {
        Self { socket_path }
    }

    /// Submit an artifact; returns the immediate `queued`/`rejected` reply
    pub async fn submit(&self, artifact_name: String, payload: PayloadRef) -> Result<Response> {
        self.send_request(Request::Submit {
            artifact_name,
            payload,
        })
        .await
    }

    /// Query status
    pub async fn status(&self, limit: Option<usize>) -> Result<Response> {
        self.send_request(Request::Status { limit }).await
    }

    /// Request a stop of the running drain cycle
    pub async fn stop(&self) -> Result<Response> {
        self.send_request(Request::Stop).await
    }

    /// Start a drain cycle now
    pub async fn run(&self) -> Result<Response> {
        self.send_request(Request::Run).await
    }

    /// Request shutdown
    pub async fn shutdown(&self) -> Result<Response> {
        self.send_request(Request::Shutdown).await
    }

    async fn send_request(&self, request: Request) -> Result<Response> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .context("Failed to connect to socket")?;

        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        // Send request
        let request_json = serde_json::to_string(&request)?;
        writer.write_all(request_json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;

        // Read response
        let mut line = String::new();
        reader.read_line(&mut line).await?;

        let response: Response = serde_json::from_str(line.trim())?;
        Ok(response)
    }
}
