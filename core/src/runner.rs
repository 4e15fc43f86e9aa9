//! Runs activation commands with the bootstrap broker's elevated privilege.
//!
//! Commands execute on a dedicated worker task so the callback path that
//! requested them never waits on child I/O. Output is drained completely
//! before the exit status is collected, and the process handle is released
//! on every path out of [`run_once`].

use std::io;
use std::panic::AssertUnwindSafe;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::process::Child;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::error::ActivationFailure;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// A process started with elevated privilege.
#[async_trait]
pub trait ElevatedProcess: Send {
    fn take_stdout(&mut self) -> Option<BoxedReader>;

    fn take_stderr(&mut self) -> Option<BoxedReader>;

    /// Waits for exit and returns the exit code.
    async fn wait(&mut self) -> io::Result<i32>;

    /// Releases the process and any handles still held. Called exactly once
    /// per process by the runner, including after a clean exit.
    fn destroy(&mut self);
}

/// Elevated process spawning as exposed by a privileged transport.
#[async_trait]
pub trait ElevatedSpawner: Send + Sync {
    async fn new_process(&self, argv: &[String]) -> io::Result<Box<dyn ElevatedProcess>>;
}

/// Spawns argv directly, for callers that already hold the needed privilege.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalSpawner;

#[async_trait]
impl ElevatedSpawner for LocalSpawner {
    async fn new_process(&self, argv: &[String]) -> io::Result<Box<dyn ElevatedProcess>> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command line"))?;
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        Ok(Box::new(child))
    }
}

#[async_trait]
impl ElevatedProcess for Child {
    fn take_stdout(&mut self) -> Option<BoxedReader> {
        self.stdout
            .take()
            .map(|stdout| Box::new(stdout) as BoxedReader)
    }

    fn take_stderr(&mut self) -> Option<BoxedReader> {
        self.stderr
            .take()
            .map(|stderr| Box::new(stderr) as BoxedReader)
    }

    async fn wait(&mut self) -> io::Result<i32> {
        let status = Child::wait(self).await?;
        Ok(status.code().unwrap_or(-1))
    }

    fn destroy(&mut self) {
        // Already-exited children report an error here; nothing to release then.
        let _ = self.start_kill();
    }
}

/// A finished activation command: created per attempt, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationAttempt {
    pub command: String,
    pub exit_status: i32,
    pub stdout: String,
    pub stderr: String,
}

pub type ActivationResult = std::result::Result<ActivationAttempt, ActivationFailure>;

struct RunRequest {
    argv: Vec<String>,
    reply: oneshot::Sender<ActivationResult>,
}

/// Handle to the activation worker. Cloning shares the same worker, which
/// runs one command at a time in submission order.
#[derive(Clone)]
pub struct PrivilegedProcessRunner {
    tx: mpsc::UnboundedSender<RunRequest>,
}

impl PrivilegedProcessRunner {
    /// Starts the worker on the current Tokio runtime. It stops once every
    /// handle has been dropped.
    pub fn spawn(spawner: Arc<dyn ElevatedSpawner>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<RunRequest>();
        tokio::spawn(async move {
            while let Some(RunRequest { argv, reply }) = rx.recv().await {
                let result = AssertUnwindSafe(run_once(spawner.as_ref(), &argv))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| {
                        error!("activation command panicked");
                        Err(worker_failure(
                            display_command(&argv),
                            "panicked while running",
                        ))
                    });
                if reply.send(result).is_err() {
                    debug!("activation result dropped: requester went away");
                }
            }
            debug!("activation worker stopped");
        });
        Self { tx }
    }

    /// Queues `argv` and returns a receiver for its result.
    pub fn submit(&self, argv: Vec<String>) -> oneshot::Receiver<ActivationResult> {
        let (reply, rx) = oneshot::channel();
        if let Err(mpsc::error::SendError(request)) = self.tx.send(RunRequest { argv, reply }) {
            let failure = worker_gone(display_command(&request.argv));
            let _ = request.reply.send(Err(failure));
        }
        rx
    }

    pub async fn run(&self, argv: Vec<String>) -> ActivationResult {
        let command = display_command(&argv);
        self.submit(argv)
            .await
            .unwrap_or_else(|_| Err(worker_gone(command)))
    }
}

fn worker_gone(command: String) -> ActivationFailure {
    worker_failure(command, "activation worker stopped")
}

fn worker_failure(command: String, reason: &str) -> ActivationFailure {
    ActivationFailure {
        command,
        exit_status: None,
        stdout: String::new(),
        stderr: String::new(),
        reason: reason.to_string(),
    }
}

pub(crate) fn display_command(argv: &[String]) -> String {
    argv.join(" ")
}

/// Destroys the wrapped process when dropped.
struct ProcessGuard(Box<dyn ElevatedProcess>);

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        self.0.destroy();
    }
}

async fn read_all(reader: Option<BoxedReader>) -> (String, Option<io::Error>) {
    let Some(mut reader) = reader else {
        return (String::new(), None);
    };
    let mut buf = Vec::new();
    // Bytes read before an error stay in `buf`.
    let err = reader.read_to_end(&mut buf).await.err();
    (String::from_utf8_lossy(&buf).into_owned(), err)
}

pub(crate) async fn run_once(spawner: &dyn ElevatedSpawner, argv: &[String]) -> ActivationResult {
    let command = display_command(argv);
    info!("running activation command: {command}");

    let process = match spawner.new_process(argv).await {
        Ok(process) => process,
        Err(err) => {
            error!("failed to start activation command: {err}");
            return Err(ActivationFailure::spawn(&command, &err));
        }
    };
    let mut guard = ProcessGuard(process);
    let stdout = guard.0.take_stdout();
    let stderr = guard.0.take_stderr();
    let ((stdout, stdout_err), (stderr, stderr_err)) =
        tokio::join!(read_all(stdout), read_all(stderr));
    let status = guard.0.wait().await;
    drop(guard);

    if !stdout.is_empty() {
        info!("activation stdout: {stdout}");
    }
    if !stderr.is_empty() {
        warn!("activation stderr: {stderr}");
    }

    let exit_status = match status {
        Ok(code) => code,
        Err(err) => {
            error!("failed to wait for activation command: {err}");
            return Err(ActivationFailure {
                command,
                exit_status: None,
                stdout,
                stderr,
                reason: format!("failed to wait for process: {err}"),
            });
        }
    };

    if let Some(err) = stdout_err.or(stderr_err) {
        error!("failed to read activation output: {err}");
        return Err(ActivationFailure {
            command,
            exit_status: Some(exit_status),
            stdout,
            stderr,
            reason: format!("failed to read output: {err}"),
        });
    }

    if exit_status != 0 {
        error!("activation command exited with status {exit_status}");
        return Err(ActivationFailure {
            command,
            exit_status: Some(exit_status),
            stdout,
            stderr,
            reason: format!("exited with status {exit_status}"),
        });
    }

    Ok(ActivationAttempt {
        command,
        exit_status,
        stdout,
        stderr,
    })
}
