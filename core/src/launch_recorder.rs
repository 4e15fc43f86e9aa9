//! Remembers how the primary service was last started, so boot-time
//! activation knows whether root is available to it.

use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;
use tracing::warn;

use crate::connection::ListenerId;
use crate::connection::PrivilegedConnection;
use crate::connection::RemoteInfo;
use crate::settings::LaunchMethod;
use crate::settings::SettingsStore;

/// Records the [`LaunchMethod`] each time the primary service connects.
/// Dropping the recorder unregisters its listener.
///
/// Inside a Tokio runtime the writes are applied one at a time, in connect
/// order, by a single worker so the last connect always wins on disk.
pub struct LaunchRecorder {
    primary: Arc<PrivilegedConnection>,
    listener: ListenerId,
    writer: Option<JoinHandle<()>>,
}

impl LaunchRecorder {
    pub fn attach(primary: Arc<PrivilegedConnection>, settings: Arc<dyn SettingsStore>) -> Self {
        let (listener, writer) = match Handle::try_current() {
            Ok(runtime) => {
                let (tx, mut rx) = mpsc::unbounded_channel::<RemoteInfo>();
                let writer = runtime.spawn(async move {
                    while let Some(info) = rx.recv().await {
                        let settings = Arc::clone(&settings);
                        // Settings writes touch the disk; keep them off the runtime threads.
                        let write = tokio::task::spawn_blocking(move || {
                            record(settings.as_ref(), info);
                        });
                        if let Err(err) = write.await {
                            warn!("launch method write did not complete: {err}");
                        }
                    }
                });
                let listener = primary.on_connect(move |info| {
                    let _ = tx.send(info);
                });
                (listener, Some(writer))
            }
            Err(_) => {
                let listener = primary.on_connect(move |info| record(settings.as_ref(), info));
                (listener, None)
            }
        };
        Self {
            primary,
            listener,
            writer,
        }
    }

    /// Unregisters the listener and waits until every queued write has landed.
    pub async fn shutdown(mut self) {
        self.primary.remove_listener(self.listener);
        if let Some(writer) = self.writer.take()
            && let Err(err) = writer.await
        {
            warn!("launch method writer ended abnormally: {err}");
        }
    }
}

impl Drop for LaunchRecorder {
    fn drop(&mut self) {
        self.primary.remove_listener(self.listener);
    }
}

fn record(settings: &dyn SettingsStore, info: RemoteInfo) {
    let method = LaunchMethod::from_remote_uid(info.uid);
    match settings.set_last_launch_method(method) {
        Ok(()) => info!("primary service running as uid {}; launch method {method:?}", info.uid),
        Err(err) => warn!("failed to record launch method {method:?}: {err}"),
    }
}
