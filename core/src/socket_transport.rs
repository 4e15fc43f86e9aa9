use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UnixStream;
use tracing::trace;

use crate::connection::ServiceIdentity;
use crate::connection::ServiceTransport;
use crate::error::ActivatorErr;
use crate::error::Result;

pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_millis(500);

/// Reaches a service through the Unix socket it listens on. A service is
/// alive when the socket accepts a connection within the timeout.
#[derive(Debug, Clone)]
pub struct UnixSocketTransport {
    identity: ServiceIdentity,
    path: PathBuf,
    timeout: Duration,
}

impl UnixSocketTransport {
    pub fn new(identity: ServiceIdentity, path: impl Into<PathBuf>) -> Self {
        Self {
            identity,
            path: path.into(),
            timeout: DEFAULT_PING_TIMEOUT,
        }
    }
}

#[async_trait]
impl ServiceTransport for UnixSocketTransport {
    async fn ping(&self) -> Result<()> {
        let unavailable = || ActivatorErr::TransportUnavailable {
            identity: self.identity,
        };
        match tokio::time::timeout(self.timeout, UnixStream::connect(&self.path)).await {
            Ok(Ok(_stream)) => Ok(()),
            Ok(Err(err)) => {
                trace!("{} socket {}: {err}", self.identity, self.path.display());
                Err(unavailable())
            }
            Err(_) => {
                trace!("{} socket {} timed out", self.identity, self.path.display());
                Err(unavailable())
            }
        }
    }
}
