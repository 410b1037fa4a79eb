//! Inbox directory intake.
//!
//! Watches a drop directory and submits every artifact file that appears in
//! it through the intake channel. Files already present at startup are
//! submitted too. Each path is submitted once while it exists; removing the
//! file forgets it so a re-dropped artifact is queued again. Files are never
//! deleted by the inbox.

use crate::intake::IntakeHandle;
use crate::protocol::PayloadRef;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Drop directory watcher
pub struct Inbox {
    /// Directory being watched
    path: PathBuf,
    /// Accepted artifact extensions
    extensions: Vec<String>,
    /// Paths already submitted and still present
    submitted: HashSet<PathBuf>,
    /// Channel to receive file system events
    fs_rx: Option<mpsc::UnboundedReceiver<notify::Result<Event>>>,
    /// The watcher (kept alive to continue watching)
    _watcher: Option<RecommendedWatcher>,
}

impl Inbox {
    pub fn new(path: PathBuf, extensions: Vec<String>) -> Self {
        Self {
            path,
            extensions,
            submitted: HashSet::new(),
            fs_rx: None,
            _watcher: None,
        }
    }

    /// Start the file watcher, creating the directory if needed
    pub fn start(&mut self) -> Result<(), notify::Error> {
        if !self.path.exists() {
            if let Err(e) = std::fs::create_dir_all(&self.path) {
                warn!("Failed to create inbox directory {:?}: {}", self.path, e);
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.fs_rx = Some(rx);

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = tx.send(res);
        })?;
        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;
        self._watcher = Some(watcher);

        info!("Inbox watching {:?}", self.path);
        Ok(())
    }

    /// Artifact name for a path, if it is a file the inbox should submit
    fn artifact_name(&self, path: &Path) -> Option<String> {
        let name = path.file_name()?.to_string_lossy().to_string();
        if name.starts_with('.') {
            return None;
        }
        if !self.extensions.iter().any(|ext| name.ends_with(ext.as_str())) {
            return None;
        }
        path.is_file().then_some(name)
    }

    /// Record `path` if it is new; returns it when it should be submitted
    fn track(&mut self, path: PathBuf) -> Option<(String, PathBuf)> {
        let name = self.artifact_name(&path)?;
        if !self.submitted.insert(path.clone()) {
            return None;
        }
        Some((name, path))
    }

    /// Forget a submitted path so it can be submitted again
    fn forget(&mut self, path: &Path) {
        if self.submitted.remove(path) {
            debug!("Inbox file removed: {}", path.display());
        }
    }

    /// Files present in the directory that were not submitted yet
    pub fn scan_existing(&mut self) -> Vec<(String, PathBuf)> {
        let mut found = Vec::new();
        match std::fs::read_dir(&self.path) {
            Ok(entries) => {
                let mut paths: Vec<PathBuf> = entries.flatten().map(|e| e.path()).collect();
                paths.sort();
                for path in paths {
                    if let Some(entry) = self.track(path) {
                        debug!("Found existing inbox file: {}", entry.0);
                        found.push(entry);
                    }
                }
            }
            Err(e) => warn!("Failed to read inbox {:?}: {}", self.path, e),
        }
        found
    }

    /// Handle a file system event, returning paths to submit
    fn handle_event(&mut self, event: Event) -> Vec<(String, PathBuf)> {
        let mut found = Vec::new();
        if !matches!(
            event.kind,
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
        ) {
            return found;
        }

        for path in event.paths {
            if path.exists() {
                if let Some(entry) = self.track(path) {
                    debug!("New inbox file: {}", entry.0);
                    found.push(entry);
                }
            } else {
                // Deleted or renamed away
                self.forget(&path);
            }
        }
        found
    }

    /// Wait for the next batch of new files; `None` once the watcher is gone
    pub async fn next_batch(&mut self) -> Option<Vec<(String, PathBuf)>> {
        loop {
            let rx = self.fs_rx.as_mut()?;
            let first = rx.recv().await?;

            let mut results = vec![first];
            while let Ok(more) = rx.try_recv() {
                results.push(more);
            }

            let mut found = Vec::new();
            for result in results {
                match result {
                    Ok(event) => found.extend(self.handle_event(event)),
                    Err(e) => warn!("File watcher error: {}", e),
                }
            }
            if !found.is_empty() {
                return Some(found);
            }
        }
    }

    /// Submit existing and new files until `shutdown` is cancelled
    pub async fn run(mut self, intake: IntakeHandle, shutdown: CancellationToken) {
        let existing = self.scan_existing();
        self.submit_all(&intake, existing).await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                batch = self.next_batch() => match batch {
                    Some(batch) => self.submit_all(&intake, batch).await,
                    None => {
                        warn!("Inbox watcher stopped");
                        break;
                    }
                },
            }
        }
    }

    async fn submit_all(&mut self, intake: &IntakeHandle, files: Vec<(String, PathBuf)>) {
        for (name, path) in files {
            match intake
                .submit(name.clone(), PayloadRef::Path(path.clone()))
                .await
            {
                Ok(submission) => info!(
                    "Inbox queued {} at position {}",
                    name, submission.position
                ),
                Err(e) => {
                    warn!("Inbox could not queue {}: {:#}", name, e);
                    // Allow a retry on the next change to the file
                    self.forget(&path);
                }
            }
        }
    }
}
