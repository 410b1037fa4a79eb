//! Artifact transfer and placement.
//!
//! Fetches artifact bytes from a job's payload reference and materializes
//! them where the installer expects them:
//! - a transient working copy in the staging directory
//! - the artifact itself at `<install_root>/<artifact_name>`

use crate::error::{InstallError, Result};
use crate::protocol::{InstallJob, PayloadRef};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

/// Files written for one job
#[derive(Debug, Clone)]
pub struct Materialized {
    /// Artifact under the install root
    pub target: PathBuf,
    /// Working copy, removed after the install
    pub staging: PathBuf,
}

/// Check that an artifact name is a single, plain file name
pub fn validate_artifact_name(name: &str) -> Result<()> {
    let invalid = || InstallError::InvalidArtifactName(name.to_string());

    if name.is_empty() || name.contains(['/', '\\', '\0']) {
        return Err(invalid());
    }
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(invalid()),
    }
}

pub struct ArtifactStore {
    client: reqwest::Client,
    install_root: PathBuf,
    staging_dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(install_root: PathBuf, staging_dir: PathBuf) -> Self {
        Self {
            client: reqwest::Client::new(),
            install_root,
            staging_dir,
        }
    }

    /// Where the working copy for `job` is written
    pub fn staging_path(&self, job: &InstallJob) -> PathBuf {
        self.staging_dir
            .join(format!("{}-{}", job.short_id(), job.artifact_name))
    }

    /// Read the artifact bytes
    pub async fn fetch(&self, job: &InstallJob) -> Result<Vec<u8>> {
        let name = &job.artifact_name;
        match &job.payload {
            PayloadRef::Path(path) => {
                debug!("Reading {} from {}", name, path.display());
                tokio::fs::read(path)
                    .await
                    .map_err(|e| InstallError::transfer(name, format!("{}: {}", path.display(), e)))
            }
            PayloadRef::Url(url) => {
                debug!("Downloading {} from {}", name, url);
                let response = self
                    .client
                    .get(url)
                    .send()
                    .await
                    .and_then(|r| r.error_for_status())
                    .map_err(|e| InstallError::transfer(name, e))?;
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|e| InstallError::transfer(name, e))?;
                Ok(bytes.to_vec())
            }
        }
    }

    /// Fetch the artifact and write the working copy and the install copy
    pub async fn materialize(&self, job: &InstallJob) -> Result<Materialized> {
        let data = self.fetch(job).await?;

        let staging = self.staging_path(job);
        let target = self.install_root.join(&job.artifact_name);

        write_file(&staging, &data).await?;
        debug!("Staged {} at {}", job.artifact_name, staging.display());

        if let Err(e) = tokio::fs::copy(&staging, &target).await {
            self.cleanup(&staging).await;
            return Err(InstallError::Materialize {
                path: target.display().to_string(),
                source: e,
            });
        }
        info!(
            "Copied {} ({} bytes) to {}",
            job.artifact_name,
            data.len(),
            target.display()
        );

        Ok(Materialized { target, staging })
    }

    /// Remove a working copy; a missing file is fine
    pub async fn cleanup(&self, staging: &Path) {
        match tokio::fs::remove_file(staging).await {
            Ok(()) => debug!("Removed working copy {}", staging.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove working copy {}: {}", staging.display(), e),
        }
    }
}

async fn write_file(path: &Path, data: &[u8]) -> Result<()> {
    tokio::fs::write(path, data)
        .await
        .map_err(|e| InstallError::Materialize {
            path: path.display().to_string(),
            source: e,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned HTTP response on a local port, returning its URL
    async fn serve_once(response: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            stream.write_all(response.as_bytes()).await.unwrap();
            let _ = stream.shutdown().await;
        });
        format!("http://{}/theme.blueprint", addr)
    }

    #[test]
    fn test_validate_artifact_name() {
        assert!(validate_artifact_name("theme.blueprint").is_ok());
        assert!(validate_artifact_name("my theme v2.blueprint").is_ok());

        for bad in ["", ".", "..", "../x.blueprint", "a/b.blueprint", "/x.blueprint", "a\\b", "a\0b"] {
            assert!(
                matches!(
                    validate_artifact_name(bad),
                    Err(InstallError::InvalidArtifactName(_))
                ),
                "{:?} should be rejected",
                bad
            );
        }
    }

    #[tokio::test]
    async fn test_materialize_from_path() {
        let source = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();

        let source_file = source.path().join("upload.bin");
        std::fs::write(&source_file, b"blueprint bytes").unwrap();

        let store = ArtifactStore::new(root.path().to_path_buf(), staging.path().to_path_buf());
        let job = InstallJob::new(
            "theme.blueprint".to_string(),
            PayloadRef::Path(source_file),
        );

        let placed = store.materialize(&job).await.unwrap();
        assert_eq!(placed.target, root.path().join("theme.blueprint"));
        assert_eq!(std::fs::read(&placed.target).unwrap(), b"blueprint bytes");
        assert!(placed.staging.exists());

        store.cleanup(&placed.staging).await;
        assert!(!placed.staging.exists());
        assert!(placed.target.exists());

        // Second cleanup is a no-op
        store.cleanup(&placed.staging).await;
    }

    #[tokio::test]
    async fn test_missing_source_is_transfer_error() {
        let root = TempDir::new().unwrap();
        let store = ArtifactStore::new(root.path().to_path_buf(), root.path().to_path_buf());
        let job = InstallJob::new(
            "theme.blueprint".to_string(),
            PayloadRef::Path(root.path().join("nope")),
        );

        let err = store.materialize(&job).await.unwrap_err();
        assert!(matches!(err, InstallError::Transfer { .. }));
        assert!(!root.path().join("theme.blueprint").exists());
    }

    #[tokio::test]
    async fn test_materialize_from_url() {
        let url = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Length: 15\r\nConnection: close\r\n\r\nblueprint bytes",
        )
        .await;
        let root = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let store = ArtifactStore::new(root.path().to_path_buf(), staging.path().to_path_buf());
        let job = InstallJob::new("theme.blueprint".to_string(), PayloadRef::Url(url));

        let placed = store.materialize(&job).await.unwrap();
        assert_eq!(std::fs::read(&placed.target).unwrap(), b"blueprint bytes");
        assert_eq!(placed.staging, store.staging_path(&job));
        assert_eq!(std::fs::read(&placed.staging).unwrap(), b"blueprint bytes");
    }

    #[tokio::test]
    async fn test_url_error_status_is_transfer_error() {
        let url = serve_once(
            "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;
        let root = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let store = ArtifactStore::new(root.path().to_path_buf(), staging.path().to_path_buf());
        let job = InstallJob::new("theme.blueprint".to_string(), PayloadRef::Url(url));

        let err = store.materialize(&job).await.unwrap_err();
        assert!(matches!(err, InstallError::Transfer { .. }));
        assert!(err.to_string().contains("404"));
        assert!(!root.path().join("theme.blueprint").exists());
        assert_eq!(std::fs::read_dir(staging.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_unwritable_root_cleans_staging() {
        let source = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let source_file = source.path().join("upload.bin");
        std::fs::write(&source_file, b"x").unwrap();

        let store = ArtifactStore::new(
            source.path().join("does/not/exist"),
            staging.path().to_path_buf(),
        );
        let job = InstallJob::new("t.blueprint".to_string(), PayloadRef::Path(source_file));

        let err = store.materialize(&job).await.unwrap_err();
        assert!(matches!(err, InstallError::Materialize { .. }));
        assert_eq!(std::fs::read_dir(staging.path()).unwrap().count(), 0);
    }
}
