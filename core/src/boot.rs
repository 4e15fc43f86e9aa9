//! Boot-time activation through a directly acquired root shell.
//!
//! Runs once per boot notification without any connection listeners: the
//! primary service is probed directly and the decision rests on the
//! persisted [`LaunchMethod`].

use std::fmt;
use std::sync::Arc;

use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::ActivatorConfig;
use crate::connection::ServiceTransport;
use crate::root_shell::RootShellProvider;
use crate::settings::LaunchMethod;
use crate::settings::SettingsStore;
use crate::user::UserContext;

/// Host notification that woke the boot path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootSignal {
    /// Delivered before the user unlocks the device for the first time.
    LockedBootCompleted,
    BootCompleted,
    Other(String),
}

impl BootSignal {
    pub fn parse(name: &str) -> Self {
        match name {
            "locked-boot-completed" => Self::LockedBootCompleted,
            "boot-completed" => Self::BootCompleted,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn is_boot_completion(&self) -> bool {
        matches!(self, Self::LockedBootCompleted | Self::BootCompleted)
    }
}

impl fmt::Display for BootSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LockedBootCompleted => f.write_str("locked-boot-completed"),
            Self::BootCompleted => f.write_str("boot-completed"),
            Self::Other(name) => f.write_str(name),
        }
    }
}

/// What a boot notification led to. Informational only; nothing about the
/// outcome is an error for the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootOutcome {
    IgnoredSignal,
    NotPrimaryUser,
    AlreadyRunning,
    /// No root launch on record; ADB elevation needs the user at the device.
    NotRootLaunched(Option<LaunchMethod>),
    NoRootAccess,
    Activated,
    ActivationFailed { exit_code: Option<i32> },
}

pub struct BootReconciler {
    user: Arc<dyn UserContext>,
    primary: Arc<dyn ServiceTransport>,
    settings: Arc<dyn SettingsStore>,
    root_shell: Arc<dyn RootShellProvider>,
    activation_command: String,
}

impl BootReconciler {
    pub fn new(
        user: Arc<dyn UserContext>,
        primary: Arc<dyn ServiceTransport>,
        settings: Arc<dyn SettingsStore>,
        root_shell: Arc<dyn RootShellProvider>,
        activation_command: impl Into<String>,
    ) -> Self {
        Self {
            user,
            primary,
            settings,
            root_shell,
            activation_command: activation_command.into(),
        }
    }

    pub fn from_config(
        config: &ActivatorConfig,
        user: Arc<dyn UserContext>,
        primary: Arc<dyn ServiceTransport>,
        settings: Arc<dyn SettingsStore>,
        root_shell: Arc<dyn RootShellProvider>,
    ) -> Self {
        Self::new(
            user,
            primary,
            settings,
            root_shell,
            config.starter().internal_command(),
        )
    }

    pub async fn on_boot(&self, signal: &BootSignal) -> BootOutcome {
        if !signal.is_boot_completion() {
            debug!("ignoring boot signal {signal}");
            return BootOutcome::IgnoredSignal;
        }
        if !self.user.is_primary_user() {
            info!(
                "skipping boot activation for secondary user {}",
                self.user.user_id()
            );
            return BootOutcome::NotPrimaryUser;
        }
        if self.primary.ping().await.is_ok() {
            info!("primary service already running at {signal}");
            return BootOutcome::AlreadyRunning;
        }

        match self.settings.last_launch_method() {
            Some(LaunchMethod::Root) => self.activate_with_root().await,
            method => {
                warn!("primary service not running at boot and last launch method is {method:?}; not starting it");
                BootOutcome::NotRootLaunched(method)
            }
        }
    }

    async fn activate_with_root(&self) -> BootOutcome {
        let mut shell = match self.root_shell.open().await {
            Ok(shell) => shell,
            Err(err) => {
                warn!("failed to open root shell at boot: {err}");
                return BootOutcome::NoRootAccess;
            }
        };
        if !shell.is_root() {
            warn!("root shell unavailable at boot; skipping activation");
            shell.close().await;
            return BootOutcome::NoRootAccess;
        }

        info!("activating primary service from root shell");
        let result = shell.exec(&self.activation_command).await;
        shell.close().await;

        match result {
            Ok(0) => {
                if let Err(err) = self.settings.set_last_launch_method(LaunchMethod::Root) {
                    warn!("failed to record root launch: {err}");
                }
                BootOutcome::Activated
            }
            Ok(code) => {
                warn!("boot activation exited with status {code}");
                BootOutcome::ActivationFailed {
                    exit_code: Some(code),
                }
            }
            Err(err) => {
                warn!("boot activation failed: {err}");
                BootOutcome::ActivationFailed { exit_code: None }
            }
        }
    }
}
