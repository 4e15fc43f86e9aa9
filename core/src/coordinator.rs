//! State machine that turns bootstrap-broker events into an activation of the
//! primary service.
//!
//! ```text
//! Idle --bootstrap connects--> AwaitingPermissions --fully authorized--> Authorized
//! Authorized --primary alive--> Idle
//! Authorized --primary absent--> Activating --exit 0--> Activated (one delayed re-probe)
//!                                Activating --failure--> ActivationFailed --> Authorized
//! ```
//!
//! Connection listeners only forward events into a channel; a single task
//! owns the state and processes events one at a time. `Activating` doubles as
//! the gate that keeps a second attempt from starting while one is in flight.
//!
//! The current state is published on a `watch` channel; every transition is
//! also broadcast so observers can follow states that are only held briefly.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::config::ActivatorConfig;
use crate::connection::ListenerId;
use crate::connection::PrivilegedConnection;
use crate::connection::RemoteInfo;
use crate::connection::ServiceIdentity;
use crate::error::ActivatorErr;
use crate::error::Result;
use crate::permissions::CapabilityRequest;
use crate::permissions::Evaluation;
use crate::permissions::GrantResult;
use crate::permissions::PermissionBroker;
use crate::permissions::PermissionNegotiator;
use crate::runner::ActivationResult;
use crate::runner::PrivilegedProcessRunner;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationState {
    Idle,
    AwaitingPermissions,
    Authorized,
    Activating,
    Activated,
    ActivationFailed,
}

#[derive(Debug)]
enum CoordinatorEvent {
    BootstrapConnected(RemoteInfo),
    BootstrapDisconnected,
    GrantResult(GrantResult),
    PrimaryConnected(RemoteInfo),
    ActivationFinished(ActivationResult),
    ReprobeDue,
    Shutdown,
}

pub struct CoordinatorParams {
    pub bootstrap: Arc<PrivilegedConnection>,
    pub primary: Arc<PrivilegedConnection>,
    pub broker: Arc<dyn PermissionBroker>,
    pub runner: PrivilegedProcessRunner,
    /// Fixed priority order for capability negotiation.
    pub capabilities: Vec<CapabilityRequest>,
    /// Full argv of the activation command, e.g. `sh -c "<launcher> --apk=<path>"`.
    pub activation_argv: Vec<String>,
    pub reprobe_delay: Duration,
}

impl CoordinatorParams {
    pub fn from_config(
        config: &ActivatorConfig,
        bootstrap: Arc<PrivilegedConnection>,
        primary: Arc<PrivilegedConnection>,
        broker: Arc<dyn PermissionBroker>,
        runner: PrivilegedProcessRunner,
    ) -> Self {
        Self {
            bootstrap,
            primary,
            broker,
            runner,
            capabilities: config.capabilities.clone(),
            activation_argv: config.starter().shell_argv(),
            reprobe_delay: config.reprobe_delay(),
        }
    }
}

pub struct ActivationCoordinator {
    primary: Arc<PrivilegedConnection>,
    bootstrap: Arc<PrivilegedConnection>,
    broker: Arc<dyn PermissionBroker>,
    runner: PrivilegedProcessRunner,
    negotiator: PermissionNegotiator,
    activation_argv: Vec<String>,
    reprobe_delay: Duration,
    state_tx: watch::Sender<ActivationState>,
    transitions_tx: broadcast::Sender<ActivationState>,
    events_tx: mpsc::UnboundedSender<CoordinatorEvent>,
}

const TRANSITION_CHANNEL_CAPACITY: usize = 64;

impl ActivationCoordinator {
    /// Registers listeners on both connections and starts the event loop on
    /// the current Tokio runtime.
    pub fn spawn(params: CoordinatorParams) -> Result<ActivationCoordinatorHandle> {
        let CoordinatorParams {
            bootstrap,
            primary,
            broker,
            runner,
            capabilities,
            activation_argv,
            reprobe_delay,
        } = params;

        for (conn, expected) in [
            (&bootstrap, ServiceIdentity::Bootstrap),
            (&primary, ServiceIdentity::Primary),
        ] {
            if conn.identity() != expected {
                return Err(ActivatorErr::UnexpectedState(format!(
                    "{expected} slot was given the {} connection",
                    conn.identity()
                )));
            }
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ActivationState::Idle);
        let (transitions_tx, _) = broadcast::channel(TRANSITION_CHANNEL_CAPACITY);

        let coordinator = Self {
            primary: Arc::clone(&primary),
            bootstrap: Arc::clone(&bootstrap),
            broker,
            runner,
            negotiator: PermissionNegotiator::new(capabilities),
            activation_argv,
            reprobe_delay,
            state_tx,
            transitions_tx: transitions_tx.clone(),
            events_tx: events_tx.clone(),
        };
        let task = tokio::spawn(coordinator.run(events_rx));

        let bootstrap_listeners = vec![
            bootstrap.on_connect(forward(&events_tx, CoordinatorEvent::BootstrapConnected)),
            bootstrap.on_disconnect({
                let tx = events_tx.clone();
                move || {
                    let _ = tx.send(CoordinatorEvent::BootstrapDisconnected);
                }
            }),
            bootstrap.on_grant_result(forward(&events_tx, CoordinatorEvent::GrantResult)),
        ];
        let primary_listeners = vec![primary.on_connect(forward(
            &events_tx,
            CoordinatorEvent::PrimaryConnected,
        ))];

        Ok(ActivationCoordinatorHandle {
            bootstrap,
            primary,
            bootstrap_listeners,
            primary_listeners,
            events_tx,
            state_rx,
            transitions_tx,
            task: Some(task),
        })
    }

    async fn run(mut self, mut events_rx: mpsc::UnboundedReceiver<CoordinatorEvent>) {
        while let Some(event) = events_rx.recv().await {
            if matches!(event, CoordinatorEvent::Shutdown) {
                break;
            }
            debug!("activation coordinator handling {event:?}");
            match AssertUnwindSafe(self.handle_event(event))
                .catch_unwind()
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(ActivatorErr::UnexpectedState(message))) => {
                    warn!("ignoring event in unexpected state: {message}");
                }
                Ok(Err(ActivatorErr::ActivationExecution(failure))) => {
                    error!(
                        "primary service activation failed: {failure}; stdout: {:?}; stderr: {:?}",
                        failure.stdout, failure.stderr
                    );
                    self.enter_failed();
                }
                Ok(Err(err)) => {
                    error!("activation transition failed: {err}");
                    self.recover_from_failed_transition();
                }
                Err(_) => {
                    error!("activation transition panicked");
                    self.recover_from_failed_transition();
                }
            }
        }
        debug!("activation coordinator stopped");
    }

    fn state(&self) -> ActivationState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, next: ActivationState) {
        let previous = self.state_tx.send_replace(next);
        if previous != next {
            info!("activation state {previous:?} -> {next:?}");
            let _ = self.transitions_tx.send(next);
        }
    }

    fn recover_from_failed_transition(&self) {
        // The attempt in flight still owns the gate; its result settles the state.
        if self.state() == ActivationState::Activating {
            warn!("keeping activation in flight after a failed transition");
            return;
        }
        self.enter_failed();
    }

    fn enter_failed(&self) {
        self.set_state(ActivationState::ActivationFailed);
        if self.negotiator.is_fully_granted() {
            self.set_state(ActivationState::Authorized);
        } else {
            self.set_state(ActivationState::AwaitingPermissions);
        }
    }

    async fn handle_event(&mut self, event: CoordinatorEvent) -> Result<()> {
        match event {
            CoordinatorEvent::BootstrapConnected(info) => {
                info!(
                    "bootstrap broker ready (version {}, uid {})",
                    info.version, info.uid
                );
                if self.state() != ActivationState::Activating {
                    self.set_state(ActivationState::AwaitingPermissions);
                }
                let evaluation = self.negotiator.evaluate(self.broker.as_ref()).await;
                self.apply_evaluation(evaluation).await
            }
            CoordinatorEvent::BootstrapDisconnected => {
                self.negotiator.reset_episode();
                if self.state() != ActivationState::Activating {
                    self.set_state(ActivationState::Idle);
                }
                Ok(())
            }
            CoordinatorEvent::GrantResult(result) => {
                if !self.bootstrap.state().is_connected() {
                    return Err(ActivatorErr::UnexpectedState(format!(
                        "grant result for request {} while the bootstrap broker is disconnected",
                        result.request_code
                    )));
                }
                let evaluation = self
                    .negotiator
                    .on_grant_result(result, self.broker.as_ref())
                    .await;
                self.apply_evaluation(evaluation).await
            }
            CoordinatorEvent::PrimaryConnected(info) => {
                info!("primary service observed alive (uid {})", info.uid);
                if matches!(
                    self.state(),
                    ActivationState::Authorized
                        | ActivationState::Activated
                        | ActivationState::ActivationFailed
                ) {
                    self.set_state(ActivationState::Idle);
                }
                Ok(())
            }
            CoordinatorEvent::ActivationFinished(result) => self.on_activation_finished(result),
            CoordinatorEvent::ReprobeDue => {
                if self.primary.is_alive().await {
                    info!("primary service is running after activation");
                } else {
                    warn!("primary service is still not reachable after activation");
                }
                Ok(())
            }
            CoordinatorEvent::Shutdown => Ok(()),
        }
    }

    async fn apply_evaluation(&mut self, evaluation: Evaluation) -> Result<()> {
        match evaluation {
            Evaluation::FullyAuthorized => self.on_authorized().await,
            Evaluation::AlreadyAuthorized => {
                debug!("authorization already reported for this episode");
                Ok(())
            }
            Evaluation::Requested(_)
            | Evaluation::Pending(_)
            | Evaluation::Denied(_)
            | Evaluation::Unreachable(_) => {
                if self.state() != ActivationState::Activating {
                    self.set_state(ActivationState::AwaitingPermissions);
                }
                Ok(())
            }
        }
    }

    async fn on_authorized(&mut self) -> Result<()> {
        if self.state() == ActivationState::Activating {
            return Err(ActivatorErr::UnexpectedState(
                "authorization reported while an activation is already in flight".to_string(),
            ));
        }
        if !self.negotiator.is_fully_granted() {
            return Err(ActivatorErr::UnexpectedState(
                "authorization reported with capabilities still missing".to_string(),
            ));
        }
        self.set_state(ActivationState::Authorized);

        if self.primary.is_alive().await {
            info!("primary service already running; nothing to activate");
            self.set_state(ActivationState::Idle);
            return Ok(());
        }

        info!("primary service not running; activating through the bootstrap broker");
        self.set_state(ActivationState::Activating);
        let runner = self.runner.clone();
        let argv = self.activation_argv.clone();
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            let result = runner.run(argv).await;
            let _ = events_tx.send(CoordinatorEvent::ActivationFinished(result));
        });
        Ok(())
    }

    fn on_activation_finished(&mut self, result: ActivationResult) -> Result<()> {
        if self.state() != ActivationState::Activating {
            return Err(ActivatorErr::UnexpectedState(format!(
                "activation result arrived in state {:?}",
                self.state()
            )));
        }

        match result {
            Ok(attempt) => {
                info!(
                    "primary service activated (exit status {})",
                    attempt.exit_status
                );
                self.set_state(ActivationState::Activated);
                self.schedule_reprobe();
            }
            Err(failure) => return Err(failure.into()),
        }
        Ok(())
    }

    fn schedule_reprobe(&self) {
        let delay = self.reprobe_delay;
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events_tx.send(CoordinatorEvent::ReprobeDue);
        });
    }
}

fn forward<T, F>(
    events_tx: &mpsc::UnboundedSender<CoordinatorEvent>,
    wrap: F,
) -> impl Fn(T) + Send + Sync + 'static
where
    T: 'static,
    F: Fn(T) -> CoordinatorEvent + Send + Sync + 'static,
{
    let events_tx = events_tx.clone();
    move |value| {
        let _ = events_tx.send(wrap(value));
    }
}

/// Owner of a running coordinator. Dropping it unregisters the listeners and
/// aborts the event loop; [`ActivationCoordinatorHandle::shutdown`] does the
/// same but waits for the loop to finish.
pub struct ActivationCoordinatorHandle {
    bootstrap: Arc<PrivilegedConnection>,
    primary: Arc<PrivilegedConnection>,
    bootstrap_listeners: Vec<ListenerId>,
    primary_listeners: Vec<ListenerId>,
    events_tx: mpsc::UnboundedSender<CoordinatorEvent>,
    state_rx: watch::Receiver<ActivationState>,
    transitions_tx: broadcast::Sender<ActivationState>,
    task: Option<JoinHandle<()>>,
}

impl fmt::Debug for ActivationCoordinatorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivationCoordinatorHandle")
            .field("state", &self.state())
            .field("running", &self.task.is_some())
            .finish()
    }
}

impl ActivationCoordinatorHandle {
    pub fn state(&self) -> ActivationState {
        *self.state_rx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ActivationState> {
        self.state_rx.clone()
    }

    /// Receives every state entered from now on, including transient ones.
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<ActivationState> {
        self.transitions_tx.subscribe()
    }

    pub async fn shutdown(mut self) {
        self.unregister_listeners();
        let _ = self.events_tx.send(CoordinatorEvent::Shutdown);
        if let Some(task) = self.task.take()
            && let Err(err) = task.await
        {
            warn!("activation coordinator task ended abnormally: {err}");
        }
    }

    fn unregister_listeners(&mut self) {
        self.bootstrap.remove_listeners(&self.bootstrap_listeners);
        self.primary.remove_listeners(&self.primary_listeners);
        self.bootstrap_listeners.clear();
        self.primary_listeners.clear();
    }
}

impl Drop for ActivationCoordinatorHandle {
    fn drop(&mut self) {
        self.unregister_listeners();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
