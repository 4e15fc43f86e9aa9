#![expect(clippy::expect_used)]

//! In-memory stand-ins for the transports, broker, spawner, root shell and
//! settings store used by the activation core.

use std::collections::BTreeSet;
use std::future::Future;
use std::io;
use std::io::Cursor;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use activator_core::Capability;
use activator_core::LaunchMethod;
use activator_core::PermissionBroker;
use activator_core::PrivilegedConnection;
use activator_core::ServiceIdentity;
use activator_core::ServiceTransport;
use activator_core::SettingsStore;
use activator_core::error::ActivatorErr;
use activator_core::error::Result;
use activator_core::root_shell::RootShellProvider;
use activator_core::root_shell::RootShellSession;
use activator_core::runner::BoxedReader;
use activator_core::runner::ElevatedProcess;
use activator_core::runner::ElevatedSpawner;
use anyhow::Context;
use async_trait::async_trait;
use tokio::sync::Semaphore;


/// Polls `predicate` until it holds, failing after two seconds.
pub async fn wait_until<F>(mut predicate: F) -> anyhow::Result<()>
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(Duration::from_secs(2), async {
        while !predicate() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .context("timed out waiting for condition")
}

/// Awaits `fut` with the same two second budget as [`wait_until`].
pub async fn within<T>(fut: impl Future<Output = T>) -> anyhow::Result<T> {
    tokio::time::timeout(Duration::from_secs(2), fut)
        .await
        .context("timed out")
}

pub struct FakeTransport {
    identity: ServiceIdentity,
    alive: AtomicBool,
    pings: AtomicUsize,
}

impl FakeTransport {
    pub fn new(identity: ServiceIdentity, alive: bool) -> Arc<Self> {
        Arc::new(Self {
            identity,
            alive: AtomicBool::new(alive),
            pings: AtomicUsize::new(0),
        })
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }

    pub fn ping_count(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ServiceTransport for FakeTransport {
    async fn ping(&self) -> Result<()> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ActivatorErr::TransportUnavailable {
                identity: self.identity,
            })
        }
    }
}

pub fn connection(transport: &Arc<FakeTransport>) -> Arc<PrivilegedConnection> {
    Arc::new(PrivilegedConnection::new(
        transport.identity,
        Arc::clone(transport) as Arc<dyn ServiceTransport>,
    ))
}

/// Broker whose grants are toggled by the test. Requests are only recorded;
/// results are delivered by dispatching on the bootstrap connection.
#[derive(Default)]
pub struct FakeBroker {
    granted: Mutex<BTreeSet<Capability>>,
    requests: Mutex<Vec<(Capability, i32)>>,
}

impl FakeBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn granting(capabilities: impl IntoIterator<Item = Capability>) -> Arc<Self> {
        let broker = Self::default();
        broker
            .granted
            .lock()
            .expect("granted lock")
            .extend(capabilities);
        Arc::new(broker)
    }

    pub fn grant(&self, capability: Capability) {
        self.granted
            .lock()
            .expect("granted lock")
            .insert(capability);
    }

    pub fn requests(&self) -> Vec<(Capability, i32)> {
        self.requests.lock().expect("requests lock").clone()
    }
}

#[async_trait]
impl PermissionBroker for FakeBroker {
    async fn check_self_permission(&self, capability: &Capability) -> Result<bool> {
        Ok(self
            .granted
            .lock()
            .expect("granted lock")
            .contains(capability))
    }

    async fn request_permission(&self, capability: &Capability, request_code: i32) -> Result<()> {
        self.requests
            .lock()
            .expect("requests lock")
            .push((capability.clone(), request_code));
        Ok(())
    }
}

/// Spawner that records argv and hands back scripted processes. With a gate,
/// every process blocks in `wait` until [`RecordingSpawner::release`].
pub struct RecordingSpawner {
    exit_code: i32,
    stdout: String,
    stderr: String,
    gate: Option<Arc<Semaphore>>,
    spawned: Mutex<Vec<Vec<String>>>,
    destroyed: Arc<AtomicUsize>,
}

impl RecordingSpawner {
    pub fn exiting(exit_code: i32) -> Arc<Self> {
        Arc::new(Self::new(exit_code, None))
    }

    pub fn gated(exit_code: i32) -> Arc<Self> {
        Arc::new(Self::new(exit_code, Some(Arc::new(Semaphore::new(0)))))
    }

    fn new(exit_code: i32, gate: Option<Arc<Semaphore>>) -> Self {
        Self {
            exit_code,
            stdout: "activator: service started\n".to_string(),
            stderr: String::new(),
            gate,
            spawned: Mutex::new(Vec::new()),
            destroyed: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(1);
        }
    }

    pub fn spawned(&self) -> Vec<Vec<String>> {
        self.spawned.lock().expect("spawned lock").clone()
    }

    pub fn spawn_count(&self) -> usize {
        self.spawned.lock().expect("spawned lock").len()
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ElevatedSpawner for RecordingSpawner {
    async fn new_process(&self, argv: &[String]) -> io::Result<Box<dyn ElevatedProcess>> {
        self.spawned
            .lock()
            .expect("spawned lock")
            .push(argv.to_vec());
        Ok(Box::new(ScriptedProcess {
            exit_code: self.exit_code,
            stdout: Some(self.stdout.clone()),
            stderr: Some(self.stderr.clone()),
            gate: self.gate.clone(),
            destroyed: Arc::clone(&self.destroyed),
        }))
    }
}

struct ScriptedProcess {
    exit_code: i32,
    stdout: Option<String>,
    stderr: Option<String>,
    gate: Option<Arc<Semaphore>>,
    destroyed: Arc<AtomicUsize>,
}

#[async_trait]
impl ElevatedProcess for ScriptedProcess {
    fn take_stdout(&mut self) -> Option<BoxedReader> {
        self.stdout
            .take()
            .map(|out| Box::new(Cursor::new(out.into_bytes())) as BoxedReader)
    }

    fn take_stderr(&mut self) -> Option<BoxedReader> {
        self.stderr
            .take()
            .map(|err| Box::new(Cursor::new(err.into_bytes())) as BoxedReader)
    }

    async fn wait(&mut self) -> io::Result<i32> {
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|err| io::Error::other(err.to_string()))?
                .forget();
        }
        Ok(self.exit_code)
    }

    fn destroy(&mut self) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct RootShellLog {
    opened: usize,
    closed: usize,
    executed: Vec<String>,
}

pub struct FakeRootShell {
    is_root: bool,
    exit_code: i32,
    log: Arc<Mutex<RootShellLog>>,
}

impl FakeRootShell {
    pub fn new(is_root: bool, exit_code: i32) -> Arc<Self> {
        Arc::new(Self {
            is_root,
            exit_code,
            log: Arc::new(Mutex::new(RootShellLog::default())),
        })
    }

    pub fn opened(&self) -> usize {
        self.log.lock().expect("shell log").opened
    }

    pub fn closed(&self) -> usize {
        self.log.lock().expect("shell log").closed
    }

    pub fn executed(&self) -> Vec<String> {
        self.log.lock().expect("shell log").executed.clone()
    }
}

#[async_trait]
impl RootShellProvider for FakeRootShell {
    async fn open(&self) -> io::Result<Box<dyn RootShellSession>> {
        self.log.lock().expect("shell log").opened += 1;
        Ok(Box::new(FakeRootSession {
            is_root: self.is_root,
            exit_code: self.exit_code,
            log: Arc::clone(&self.log),
        }))
    }
}

struct FakeRootSession {
    is_root: bool,
    exit_code: i32,
    log: Arc<Mutex<RootShellLog>>,
}

#[async_trait]
impl RootShellSession for FakeRootSession {
    fn is_root(&self) -> bool {
        self.is_root
    }

    async fn exec(&mut self, command: &str) -> io::Result<i32> {
        self.log
            .lock()
            .expect("shell log")
            .executed
            .push(command.to_string());
        Ok(self.exit_code)
    }

    async fn close(self: Box<Self>) {
        self.log.lock().expect("shell log").closed += 1;
    }
}

#[derive(Default)]
pub struct MemorySettings {
    method: Mutex<Option<LaunchMethod>>,
    writes: AtomicUsize,
}

impl MemorySettings {
    pub fn with(method: Option<LaunchMethod>) -> Arc<Self> {
        Arc::new(Self {
            method: Mutex::new(method),
            writes: AtomicUsize::new(0),
        })
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl SettingsStore for MemorySettings {
    fn last_launch_method(&self) -> Option<LaunchMethod> {
        *self.method.lock().expect("settings lock")
    }

    fn set_last_launch_method(&self, method: LaunchMethod) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        *self.method.lock().expect("settings lock") = Some(method);
        Ok(())
    }
}
