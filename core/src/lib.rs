//! Activation core: keeps a privileged primary service running by driving a
//! bootstrap broker through capability negotiation and elevated process
//! launch, plus a listener-free boot path through a local root shell.

#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod boot;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod error;
pub mod launch_recorder;
pub mod permissions;
pub mod root_shell;
pub mod runner;
pub mod settings;
#[cfg(unix)]
pub mod socket_transport;
pub mod starter;
pub mod user;

pub use boot::BootOutcome;
pub use boot::BootReconciler;
pub use boot::BootSignal;
pub use config::ActivatorConfig;
pub use connection::ConnectionState;
pub use connection::PrivilegedConnection;
pub use connection::RemoteInfo;
pub use connection::ServiceIdentity;
pub use connection::ServiceTransport;
pub use connection::TransportEvent;
pub use coordinator::ActivationCoordinator;
pub use coordinator::ActivationCoordinatorHandle;
pub use coordinator::ActivationState;
pub use coordinator::CoordinatorParams;
pub use error::ActivationFailure;
pub use error::ActivatorErr;
pub use launch_recorder::LaunchRecorder;
pub use permissions::Capability;
pub use permissions::CapabilityRequest;
pub use permissions::GrantResult;
pub use permissions::PermissionBroker;
pub use permissions::PermissionNegotiator;
pub use runner::ActivationAttempt;
pub use runner::PrivilegedProcessRunner;
pub use settings::LaunchMethod;
pub use settings::SettingsStore;
pub use settings::TomlSettingsStore;
pub use starter::Starter;
