//! Installer process supervision.
//!
//! Spawns the installer for one artifact and drives it to completion:
//! - stdout and stderr drained concurrently, line by line
//! - stdout lines matched against the prompt table and answered on stdin
//! - stdout forwarded to the progress reporter
//! - optional timeout after which the installer is terminated
//!
//! The child is reached through the `Launcher` / `InstallerProcess` traits so
//! the interaction loop runs unchanged against in-memory pipes.

use crate::matcher::PromptMatcher;
use crate::progress::ProgressReporter;
use crate::protocol::InstallResult;
use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

/// Marker output for an installer that printed nothing
pub const NO_OUTPUT_MARKER: &str = "Installation completed with no output.";

/// Time a timed-out installer gets to exit after SIGTERM
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The installer's standard streams, seen from the supervisor
pub struct ProcessIo {
    pub stdin: BoxedWriter,
    pub stdout: BoxedReader,
    pub stderr: BoxedReader,
}

/// A running installer
#[async_trait]
pub trait InstallerProcess: Send {
    /// Take ownership of the standard streams (only once)
    fn take_io(&mut self) -> Option<ProcessIo>;

    /// Wait for exit; `None` when there is no exit code (e.g. killed by a signal)
    async fn wait(&mut self) -> io::Result<Option<i32>>;

    /// Ask the process to exit, forcing it after `grace`
    async fn terminate(&mut self, grace: Duration) -> io::Result<()>;
}

/// Starts installer processes
pub trait Launcher: Send + Sync {
    fn launch(&self, artifact_name: &str, working_dir: &Path)
        -> io::Result<Box<dyn InstallerProcess>>;
}

/// Launches `<binary> <flag> <artifact>` as a real child process
pub struct CommandLauncher {
    binary: String,
    flag: String,
}

impl CommandLauncher {
    pub fn new(binary: String, flag: String) -> Self {
        Self { binary, flag }
    }
}

impl Launcher for CommandLauncher {
    fn launch(
        &self,
        artifact_name: &str,
        working_dir: &Path,
    ) -> io::Result<Box<dyn InstallerProcess>> {
        info!(
            "Running: {} {} {} (in {})",
            self.binary,
            self.flag,
            artifact_name,
            working_dir.display()
        );

        let child = Command::new(&self.binary)
            .arg(&self.flag)
            .arg(artifact_name)
            .current_dir(working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(pid) = child.id() {
            info!("Spawned installer with PID {}", pid);
        }

        Ok(Box::new(ChildProcess { child }))
    }
}

/// `InstallerProcess` backed by a tokio child
///
/// The child is killed if this is dropped before it exits.
struct ChildProcess {
    child: Child,
}

#[async_trait]
impl InstallerProcess for ChildProcess {
    fn take_io(&mut self) -> Option<ProcessIo> {
        let stdin = self.child.stdin.take()?;
        let stdout = self.child.stdout.take()?;
        let stderr = self.child.stderr.take()?;
        Some(ProcessIo {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
        })
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        let status = self.child.wait().await?;
        Ok(status.code())
    }

    async fn terminate(&mut self, grace: Duration) -> io::Result<()> {
        if let Some(pid) = self.child.id() {
            if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                warn!("Failed to send SIGTERM to {}: {}", pid, e);
            } else if tokio::time::timeout(grace, self.child.wait()).await.is_ok() {
                return Ok(());
            }
        }
        self.child.kill().await
    }
}

/// Runs one installer at a time to completion
pub struct Supervisor {
    launcher: Arc<dyn Launcher>,
    matcher: PromptMatcher,
    working_dir: PathBuf,
    timeout: Option<Duration>,
}

impl Supervisor {
    pub fn new(
        launcher: Arc<dyn Launcher>,
        matcher: PromptMatcher,
        working_dir: PathBuf,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            launcher,
            matcher,
            working_dir,
            timeout,
        }
    }

    /// Install one artifact
    ///
    /// Never fails: spawn and I/O errors are folded into a failed result.
    pub async fn run(&self, artifact_name: &str, reporter: &mut ProgressReporter) -> InstallResult {
        let mut process = match self.launcher.launch(artifact_name, &self.working_dir) {
            Ok(process) => process,
            Err(e) => {
                error!("Failed to start installer for {}: {}", artifact_name, e);
                return InstallResult::failed(format!("Process error: {}", e));
            }
        };

        let Some(ProcessIo {
            stdin,
            stdout,
            stderr,
        }) = process.take_io()
        else {
            error!("Installer streams unavailable for {}", artifact_name);
            let _ = process.terminate(TERMINATE_GRACE).await;
            return InstallResult::failed("Process error: installer streams unavailable".into());
        };

        let mut output = String::new();
        let mut errors = String::new();

        let interaction = async {
            tokio::join!(
                read_and_respond(stdout, stdin, &self.matcher, &mut output, reporter),
                read_stderr(stderr, &mut errors),
            );
            process.wait().await
        };

        let outcome = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, interaction)
                .await
                .map_err(|_| limit),
            None => Ok(interaction.await),
        };

        match outcome {
            Ok(Ok(exit_code)) => {
                info!("Installer for {} exited with code {:?}", artifact_name, exit_code);
                build_result(exit_code, output, &errors)
            }
            Ok(Err(e)) => {
                error!("Failed to wait for installer of {}: {}", artifact_name, e);
                let mut result = build_result(None, output, &errors);
                result.output.push_str(&format!("\n\nProcess error: {}", e));
                result
            }
            Err(limit) => {
                warn!(
                    "Installer for {} timed out after {}s, terminating",
                    artifact_name,
                    limit.as_secs()
                );
                if let Err(e) = process.terminate(TERMINATE_GRACE).await {
                    error!("Failed to terminate installer for {}: {}", artifact_name, e);
                }
                let mut output = combine_output(output, &errors);
                if !output.is_empty() {
                    output.push_str("\n\n");
                }
                output.push_str(&format!("Installation timed out after {}s", limit.as_secs()));
                InstallResult::failed(output)
            }
        }
    }
}

/// Drain stdout, answering prompts and reporting progress
///
/// Consumes stdin so the installer sees EOF once its stdout closes.
async fn read_and_respond(
    stdout: BoxedReader,
    mut stdin: BoxedWriter,
    matcher: &PromptMatcher,
    output: &mut String,
    reporter: &mut ProgressReporter,
) {
    let mut reader = BufReader::new(stdout);
    let mut line = Vec::new();

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("Failed to read installer stdout: {}", e);
                break;
            }
        }

        let text = String::from_utf8_lossy(&line);
        output.push_str(&text);
        debug!("stdout: {}", text.trim_end());

        // Answer before reporting so a slow status channel never delays the installer
        if let Some(response) = matcher.match_line(&text) {
            info!("Auto-responding with {:?}", String::from_utf8_lossy(response));
            if let Err(e) = write_response(&mut stdin, response).await {
                warn!("Failed to answer installer prompt: {}", e);
            }
        }

        reporter.on_output(output).await;
    }
}

async fn write_response(stdin: &mut BoxedWriter, response: &[u8]) -> io::Result<()> {
    stdin.write_all(response).await?;
    stdin.flush().await
}

async fn read_stderr(stderr: BoxedReader, errors: &mut String) {
    let mut reader = BufReader::new(stderr);
    let mut line = Vec::new();

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                debug!("stderr: {}", text.trim_end());
                errors.push_str(&text);
            }
            Err(e) => {
                warn!("Failed to read installer stderr: {}", e);
                break;
            }
        }
    }
}

/// Stdout followed by the stderr section, if any
fn combine_output(mut output: String, errors: &str) -> String {
    if !errors.is_empty() {
        output.push_str("\n\nErrors:\n");
        output.push_str(errors);
    }
    output
}

fn build_result(exit_code: Option<i32>, output: String, errors: &str) -> InstallResult {
    let mut output = combine_output(output, errors);
    if output.is_empty() {
        output = NO_OUTPUT_MARKER.to_string();
    }
    InstallResult {
        succeeded: exit_code == Some(0),
        exit_code,
        output,
    }
}
