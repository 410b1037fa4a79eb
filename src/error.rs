//! Error taxonomy for the install queue.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum InstallError {
    #[error("Invalid artifact name {0:?}: must be a single file name")]
    InvalidArtifactName(String),

    #[error("Queue is full ({0} jobs)")]
    QueueFull(usize),

    #[error("Failed to fetch artifact {artifact}: {reason}")]
    Transfer { artifact: String, reason: String },

    #[error("Failed to materialize artifact at {path}: {source}")]
    Materialize {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Unexpected error while processing {artifact}: {reason}")]
    Internal { artifact: String, reason: String },
}

impl InstallError {
    pub fn transfer(artifact: &str, reason: impl ToString) -> Self {
        Self::Transfer {
            artifact: artifact.to_string(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, InstallError>;
