use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::connection::ServiceIdentity;

pub type Result<T> = std::result::Result<T, ActivatorErr>;

#[derive(Debug, Error)]
pub enum ActivatorErr {
    /// The remote end of a connection could not be reached.
    #[error("{identity} service is unreachable")]
    TransportUnavailable { identity: ServiceIdentity },

    #[error(transparent)]
    ActivationExecution(#[from] ActivationFailure),

    /// Internal invariant violation. Logged and ignored by callers.
    #[error("unexpected state: {0}")]
    UnexpectedState(String),

    #[error("failed to parse config {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to parse settings {path}: {source}")]
    SettingsParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to serialize settings: {0}")]
    SettingsWrite(#[from] toml::ser::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Outcome of an activation command that did not exit cleanly.
///
/// Spawn errors, I/O errors while draining output and non-zero exit codes all
/// land here; whatever output was captured before the failure is preserved.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("activation command `{command}` failed: {reason}")]
pub struct ActivationFailure {
    pub command: String,
    pub exit_status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub reason: String,
}

impl ActivationFailure {
    pub(crate) fn spawn(command: &str, err: &io::Error) -> Self {
        Self {
            command: command.to_string(),
            exit_status: None,
            stdout: String::new(),
            stderr: String::new(),
            reason: format!("failed to spawn: {err}"),
        }
    }
}
