//! Handle around the live/dead connection to one privileged remote service.
//!
//! Transports own the wire and push [`TransportEvent`]s into the connection
//! through [`PrivilegedConnection::dispatch`]. Listeners registered here are
//! invoked on whatever thread the transport delivers on, so listener bodies
//! should hand work off (for example into a channel) instead of blocking.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use async_trait::async_trait;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::error::Result;
use crate::permissions::GrantResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ServiceIdentity {
    /// Helper service that authorizes and spawns the primary service.
    Bootstrap,
    /// The service the application ultimately wants connected.
    Primary,
}

impl fmt::Display for ServiceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bootstrap => f.write_str("bootstrap"),
            Self::Primary => f.write_str("primary"),
        }
    }
}

/// What the remote reported about itself when the connection came up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteInfo {
    pub version: u32,
    pub uid: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connected(RemoteInfo),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected(_))
    }
}

/// Raw events a transport raises for the connection it owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent {
    BinderReceived(RemoteInfo),
    BinderDead,
    PermissionResult(GrantResult),
}

/// Opaque capability interface to one remote service.
#[async_trait]
pub trait ServiceTransport: Send + Sync {
    /// Lightweight round trip to the remote. Errors mean "unreachable".
    async fn ping(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

type ConnectListener = Arc<dyn Fn(RemoteInfo) + Send + Sync>;
type DisconnectListener = Arc<dyn Fn() + Send + Sync>;
type GrantResultListener = Arc<dyn Fn(GrantResult) + Send + Sync>;

#[derive(Clone)]
enum Listener {
    Connect(ConnectListener),
    Disconnect(DisconnectListener),
    GrantResult(GrantResultListener),
}

#[derive(Default)]
struct Inner {
    state: ConnectionState,
    listeners: BTreeMap<ListenerId, Listener>,
    next_id: u64,
}

pub struct PrivilegedConnection {
    identity: ServiceIdentity,
    transport: Arc<dyn ServiceTransport>,
    inner: Mutex<Inner>,
    // Serializes listener delivery so a sticky replay can never interleave
    // with a concurrent transition. Listeners must not register new
    // listeners on the same connection from inside a callback.
    delivery: Mutex<()>,
}

impl fmt::Debug for PrivilegedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivilegedConnection")
            .field("identity", &self.identity)
            .field("state", &self.state())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PrivilegedConnection {
    pub fn new(identity: ServiceIdentity, transport: Arc<dyn ServiceTransport>) -> Self {
        Self {
            identity,
            transport,
            inner: Mutex::new(Inner::default()),
            delivery: Mutex::new(()),
        }
    }

    pub fn identity(&self) -> ServiceIdentity {
        self.identity
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.inner).state
    }

    pub fn remote_version(&self) -> Option<u32> {
        match self.state() {
            ConnectionState::Connected(info) => Some(info.version),
            ConnectionState::Disconnected => None,
        }
    }

    pub fn remote_uid(&self) -> Option<u32> {
        match self.state() {
            ConnectionState::Connected(info) => Some(info.uid),
            ConnectionState::Disconnected => None,
        }
    }

    /// Probes the remote. Unreachable remotes report `false` rather than an error.
    pub async fn is_alive(&self) -> bool {
        match self.transport.ping().await {
            Ok(()) => true,
            Err(err) => {
                debug!("{} ping failed: {err}", self.identity);
                false
            }
        }
    }

    /// Registers a sticky connect listener: if the connection is already up,
    /// `listener` fires once immediately with the current remote info.
    pub fn on_connect<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(RemoteInfo) + Send + Sync + 'static,
    {
        let listener: ConnectListener = Arc::new(listener);
        let _delivery = lock(&self.delivery);
        let (id, state) = {
            let mut inner = lock(&self.inner);
            let id = Self::insert(&mut inner, Listener::Connect(Arc::clone(&listener)));
            (id, inner.state)
        };
        if let ConnectionState::Connected(info) = state {
            listener(info);
        }
        id
    }

    pub fn on_disconnect<F>(&self, listener: F) -> ListenerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut inner = lock(&self.inner);
        Self::insert(&mut inner, Listener::Disconnect(Arc::new(listener)))
    }

    /// Registers a listener for capability request results, correlated by request code.
    pub fn on_grant_result<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(GrantResult) + Send + Sync + 'static,
    {
        let mut inner = lock(&self.inner);
        Self::insert(&mut inner, Listener::GrantResult(Arc::new(listener)))
    }

    /// Unregisters one listener. Returns whether it was still registered;
    /// removing an unknown or already removed id is a no-op.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        lock(&self.inner).listeners.remove(&id).is_some()
    }

    pub fn remove_listeners(&self, ids: &[ListenerId]) {
        let mut inner = lock(&self.inner);
        for id in ids {
            inner.listeners.remove(id);
        }
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.inner).listeners.len()
    }

    /// Applies an event raised by the transport identified by `origin`.
    ///
    /// Only this connection's own transport may move its state; events
    /// tagged with another identity are dropped. Returns whether the event
    /// was applied.
    pub fn dispatch(&self, origin: ServiceIdentity, event: TransportEvent) -> bool {
        if origin != self.identity {
            warn!(
                "dropping {event:?} from {origin} transport delivered to {} connection",
                self.identity
            );
            return false;
        }

        let _delivery = lock(&self.delivery);
        let listeners: Vec<Listener> = {
            let mut inner = lock(&self.inner);
            match event {
                TransportEvent::BinderReceived(info) => {
                    inner.state = ConnectionState::Connected(info);
                }
                TransportEvent::BinderDead => {
                    inner.state = ConnectionState::Disconnected;
                }
                TransportEvent::PermissionResult(_) => {}
            }
            inner.listeners.values().cloned().collect()
        };

        match event {
            TransportEvent::BinderReceived(info) => {
                info!(
                    "{} service connected (version {}, uid {})",
                    self.identity, info.version, info.uid
                );
                for listener in &listeners {
                    if let Listener::Connect(f) = listener {
                        f(info);
                    }
                }
            }
            TransportEvent::BinderDead => {
                info!("{} service connection died", self.identity);
                for listener in &listeners {
                    if let Listener::Disconnect(f) = listener {
                        f();
                    }
                }
            }
            TransportEvent::PermissionResult(result) => {
                for listener in &listeners {
                    if let Listener::GrantResult(f) = listener {
                        f(result);
                    }
                }
            }
        }
        true
    }

    fn insert(inner: &mut Inner, listener: Listener) -> ListenerId {
        let id = ListenerId(inner.next_id);
        inner.next_id += 1;
        inner.listeners.insert(id, listener);
        id
    }
}
