//! Intake channel between the outer surfaces and the drain controller.
//!
//! The socket server and the inbox watcher never touch the queue directly;
//! they send `IntakeRequest`s through an `mpsc` channel consumed by a single
//! task that owns admission.

use crate::controller::{DrainController, Submission};
use crate::error::InstallError;
use crate::protocol::PayloadRef;
use crate::trigger;
use anyhow::{anyhow, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// A submission waiting to be admitted
#[derive(Debug)]
pub struct IntakeRequest {
    pub artifact_name: String,
    pub payload: PayloadRef,
    pub reply: oneshot::Sender<std::result::Result<Submission, InstallError>>,
}

/// Sending side of the intake channel
#[derive(Debug, Clone)]
pub struct IntakeHandle {
    tx: mpsc::Sender<IntakeRequest>,
}

/// Create the intake channel
pub fn channel(capacity: usize) -> (IntakeHandle, mpsc::Receiver<IntakeRequest>) {
    let (tx, rx) = mpsc::channel(capacity);
    (IntakeHandle { tx }, rx)
}

impl IntakeHandle {
    /// Submit an artifact and wait for the admission decision
    pub async fn submit(&self, artifact_name: String, payload: PayloadRef) -> Result<Submission> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(IntakeRequest {
                artifact_name,
                payload,
                reply,
            })
            .await
            .map_err(|_| anyhow!("Intake channel closed"))?;

        let submission = response
            .await
            .map_err(|_| anyhow!("Intake dropped the request"))??;
        Ok(submission)
    }
}

/// Admit requests until every `IntakeHandle` is dropped
pub async fn run_intake(
    mut rx: mpsc::Receiver<IntakeRequest>,
    controller: Arc<DrainController>,
    run_on_submit: bool,
) {
    info!("Intake started (run on submit: {})", run_on_submit);

    while let Some(request) = rx.recv().await {
        let result = controller
            .submit(request.artifact_name, request.payload)
            .await;

        let admitted = result.is_ok();
        if let Err(e) = &result {
            warn!("Submission rejected: {}", e);
        }
        if request.reply.send(result).is_err() {
            debug!("Submitter went away before the reply");
        }

        if admitted && run_on_submit {
            trigger::trigger_now(&controller);
        }
    }

    info!("Intake channel closed");
}
