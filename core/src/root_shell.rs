//! Root shell access used by boot-time activation.

use std::io;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;
use tracing::info;
use tracing::warn;

/// An acquired root shell. Must be released with [`RootShellSession::close`]
/// whether or not root was actually granted.
#[async_trait]
pub trait RootShellSession: Send {
    fn is_root(&self) -> bool;

    /// Runs `command` through the shell and returns its exit code.
    async fn exec(&mut self, command: &str) -> io::Result<i32>;

    async fn close(self: Box<Self>);
}

#[async_trait]
pub trait RootShellProvider: Send + Sync {
    async fn open(&self) -> io::Result<Box<dyn RootShellSession>>;
}

/// Acquires root through an `su` binary, one `su -c` invocation per command.
#[derive(Debug, Clone)]
pub struct SuShellProvider {
    su_binary: String,
}

impl SuShellProvider {
    pub fn new(su_binary: impl Into<String>) -> Self {
        Self {
            su_binary: su_binary.into(),
        }
    }
}

impl Default for SuShellProvider {
    fn default() -> Self {
        Self::new("su")
    }
}

#[async_trait]
impl RootShellProvider for SuShellProvider {
    async fn open(&self) -> io::Result<Box<dyn RootShellSession>> {
        let is_root = match su_output(&self.su_binary, "id -u").await {
            Ok(output) if output.status.success() => {
                String::from_utf8_lossy(&output.stdout).trim() == "0"
            }
            Ok(output) => {
                debug!(
                    "{} refused root: {}",
                    self.su_binary,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
                false
            }
            // No su binary on this device means no root, not a failure.
            Err(err) if err.kind() == io::ErrorKind::NotFound => false,
            Err(err) => return Err(err),
        };
        Ok(Box::new(SuShellSession {
            su_binary: self.su_binary.clone(),
            is_root,
        }))
    }
}

async fn su_output(su_binary: &str, command: &str) -> io::Result<std::process::Output> {
    Command::new(su_binary)
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
}

struct SuShellSession {
    su_binary: String,
    is_root: bool,
}

#[async_trait]
impl RootShellSession for SuShellSession {
    fn is_root(&self) -> bool {
        self.is_root
    }

    async fn exec(&mut self, command: &str) -> io::Result<i32> {
        let output = su_output(&self.su_binary, command).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stdout.trim().is_empty() {
            info!("root shell stdout: {}", stdout.trim_end());
        }
        if !stderr.trim().is_empty() {
            warn!("root shell stderr: {}", stderr.trim_end());
        }
        Ok(output.status.code().unwrap_or(-1))
    }

    async fn close(self: Box<Self>) {
        debug!("released {} shell", self.su_binary);
    }
}
