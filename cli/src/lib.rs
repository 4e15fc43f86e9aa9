#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod logging;

use std::path::Path;
use std::sync::Arc;

use activator_core::ActivatorConfig;
use activator_core::BootOutcome;
use activator_core::BootReconciler;
use activator_core::BootSignal;
use activator_core::LaunchMethod;
use activator_core::ServiceIdentity;
use activator_core::ServiceTransport;
use activator_core::SettingsStore;
use activator_core::TomlSettingsStore;
use activator_core::root_shell::SuShellProvider;
use activator_core::socket_transport::UnixSocketTransport;
use activator_core::user::ProcessUserContext;
use clap::Args;
use clap::Parser;
use clap::Subcommand;

#[derive(Debug, Parser)]
#[clap(author, version, bin_name = "activator")]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Handle a boot notification: restart the primary service from a root
    /// shell if it was last launched with root.
    Boot(BootArgs),

    /// Print the command that starts the primary service.
    Command(CommandArgs),

    /// Probe both services and show the last recorded launch method.
    Status,
}

#[derive(Debug, Args)]
pub struct BootArgs {
    /// Host signal name, e.g. `boot-completed` or `locked-boot-completed`.
    #[arg(long, default_value = "boot-completed")]
    pub signal: String,
}

#[derive(Debug, Args)]
#[group(multiple = false)]
pub struct CommandArgs {
    /// One-liner for `adb shell` that resolves the launcher via the package manager.
    #[arg(long)]
    pub adb: bool,

    /// The bare launcher path, for starting it from a root shell.
    #[arg(long)]
    pub user: bool,
}

pub fn activation_command(config: &ActivatorConfig, args: &CommandArgs) -> String {
    let starter = config.starter();
    if args.adb {
        starter.adb_command()
    } else if args.user {
        starter.user_command()
    } else {
        starter.internal_command()
    }
}

pub async fn run_boot(home: &Path, config: &ActivatorConfig, args: &BootArgs) -> BootOutcome {
    let reconciler = BootReconciler::from_config(
        config,
        Arc::new(ProcessUserContext),
        Arc::new(UnixSocketTransport::new(
            ServiceIdentity::Primary,
            &config.primary_socket,
        )),
        Arc::new(TomlSettingsStore::in_home(home)),
        Arc::new(SuShellProvider::new(config.su_binary.clone())),
    );
    reconciler.on_boot(&BootSignal::parse(&args.signal)).await
}

pub fn describe_boot_outcome(outcome: &BootOutcome) -> String {
    match outcome {
        BootOutcome::IgnoredSignal => "ignored: not a boot completion signal".to_string(),
        BootOutcome::NotPrimaryUser => "skipped: not the primary user".to_string(),
        BootOutcome::AlreadyRunning => "primary service already running".to_string(),
        BootOutcome::NotRootLaunched(Some(method)) => {
            format!("skipped: last launch method is {}", method_name(*method))
        }
        BootOutcome::NotRootLaunched(None) => "skipped: no launch recorded".to_string(),
        BootOutcome::NoRootAccess => "skipped: root shell unavailable".to_string(),
        BootOutcome::Activated => "primary service activated".to_string(),
        BootOutcome::ActivationFailed {
            exit_code: Some(code),
        } => format!("activation failed with status {code}"),
        BootOutcome::ActivationFailed { exit_code: None } => "activation failed".to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub primary_alive: bool,
    pub bootstrap_alive: bool,
    pub last_launch_method: Option<LaunchMethod>,
}

impl StatusReport {
    pub fn lines(&self) -> Vec<String> {
        vec![
            format!("primary:   {}", liveness(self.primary_alive)),
            format!("bootstrap: {}", liveness(self.bootstrap_alive)),
            format!(
                "last launch method: {}",
                self.last_launch_method.map_or("none", method_name)
            ),
        ]
    }
}

pub async fn run_status(home: &Path, config: &ActivatorConfig) -> StatusReport {
    let primary = UnixSocketTransport::new(ServiceIdentity::Primary, &config.primary_socket);
    let bootstrap = UnixSocketTransport::new(ServiceIdentity::Bootstrap, &config.bootstrap_socket);
    let (primary_alive, bootstrap_alive) = tokio::join!(primary.ping(), bootstrap.ping());
    StatusReport {
        primary_alive: primary_alive.is_ok(),
        bootstrap_alive: bootstrap_alive.is_ok(),
        last_launch_method: TomlSettingsStore::in_home(home).last_launch_method(),
    }
}

fn liveness(alive: bool) -> &'static str {
    if alive { "running" } else { "not running" }
}

fn method_name(method: LaunchMethod) -> &'static str {
    match method {
        LaunchMethod::Root => "root",
        LaunchMethod::Adb => "adb",
    }
}
