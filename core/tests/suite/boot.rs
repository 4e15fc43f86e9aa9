use std::sync::Arc;

use activator_core::BootOutcome;
use activator_core::BootReconciler;
use activator_core::BootSignal;
use activator_core::LaunchMethod;
use activator_core::ServiceIdentity;
use activator_core::SettingsStore;
use activator_core::user::FixedUserContext;
use core_test_support::FakeRootShell;
use core_test_support::FakeTransport;
use core_test_support::MemorySettings;
use pretty_assertions::assert_eq;

const COMMAND: &str = "/data/app/com.example.manager/lib/arm64/libstarter.so --apk=/data/app/com.example.manager/base.apk";

struct Boot {
    primary: Arc<FakeTransport>,
    settings: Arc<MemorySettings>,
    shell: Arc<FakeRootShell>,
    reconciler: BootReconciler,
}

fn boot(uid: u32, primary_alive: bool, method: Option<LaunchMethod>, shell: Arc<FakeRootShell>) -> Boot {
    let primary = FakeTransport::new(ServiceIdentity::Primary, primary_alive);
    let settings = MemorySettings::with(method);
    let reconciler = BootReconciler::new(
        Arc::new(FixedUserContext(uid)),
        primary.clone(),
        settings.clone(),
        shell.clone(),
        COMMAND,
    );
    Boot {
        primary,
        settings,
        shell,
        reconciler,
    }
}

#[tokio::test]
async fn root_launch_is_repeated_from_a_root_shell() {
    let b = boot(10_123, false, Some(LaunchMethod::Root), FakeRootShell::new(true, 0));

    let outcome = b.reconciler.on_boot(&BootSignal::BootCompleted).await;

    assert_eq!(outcome, BootOutcome::Activated);
    assert_eq!(b.shell.executed(), vec![COMMAND.to_string()]);
    assert_eq!(b.shell.closed(), 1);
    assert_eq!(b.settings.last_launch_method(), Some(LaunchMethod::Root));
}

#[tokio::test]
async fn locked_boot_signal_also_activates() {
    let b = boot(0, false, Some(LaunchMethod::Root), FakeRootShell::new(true, 0));

    let outcome = b
        .reconciler
        .on_boot(&BootSignal::LockedBootCompleted)
        .await;

    assert_eq!(outcome, BootOutcome::Activated);
}

#[tokio::test]
async fn failing_activation_is_reported_not_raised() {
    let b = boot(0, false, Some(LaunchMethod::Root), FakeRootShell::new(true, 127));

    let outcome = b.reconciler.on_boot(&BootSignal::BootCompleted).await;

    assert_eq!(
        outcome,
        BootOutcome::ActivationFailed {
            exit_code: Some(127)
        }
    );
    assert_eq!(b.shell.closed(), 1);
    assert_eq!(b.settings.writes(), 0);
}

#[tokio::test]
async fn adb_launch_takes_no_action() {
    let b = boot(0, false, Some(LaunchMethod::Adb), FakeRootShell::new(true, 0));

    let outcome = b.reconciler.on_boot(&BootSignal::BootCompleted).await;

    assert_eq!(outcome, BootOutcome::NotRootLaunched(Some(LaunchMethod::Adb)));
    assert_eq!(b.shell.opened(), 0);
    assert_eq!(b.settings.writes(), 0);
}

#[tokio::test]
async fn unknown_launch_method_takes_no_action() {
    let b = boot(0, false, None, FakeRootShell::new(true, 0));

    let outcome = b.reconciler.on_boot(&BootSignal::BootCompleted).await;

    assert_eq!(outcome, BootOutcome::NotRootLaunched(None));
    assert_eq!(b.shell.opened(), 0);
}

#[tokio::test]
async fn running_primary_short_circuits() {
    let b = boot(0, true, Some(LaunchMethod::Root), FakeRootShell::new(true, 0));

    let outcome = b.reconciler.on_boot(&BootSignal::BootCompleted).await;

    assert_eq!(outcome, BootOutcome::AlreadyRunning);
    assert_eq!(b.primary.ping_count(), 1);
    assert_eq!(b.shell.opened(), 0);
}

#[tokio::test]
async fn secondary_user_short_circuits_before_probing() {
    let b = boot(1_010_123, false, Some(LaunchMethod::Root), FakeRootShell::new(true, 0));

    let outcome = b.reconciler.on_boot(&BootSignal::BootCompleted).await;

    assert_eq!(outcome, BootOutcome::NotPrimaryUser);
    assert_eq!(b.primary.ping_count(), 0);
    assert_eq!(b.shell.opened(), 0);
}

#[tokio::test]
async fn shell_without_root_is_released_unused() {
    let b = boot(0, false, Some(LaunchMethod::Root), FakeRootShell::new(false, 0));

    let outcome = b.reconciler.on_boot(&BootSignal::BootCompleted).await;

    assert_eq!(outcome, BootOutcome::NoRootAccess);
    assert_eq!(b.shell.opened(), 1);
    assert_eq!(b.shell.closed(), 1);
    assert!(b.shell.executed().is_empty());
}

#[tokio::test]
async fn unrelated_signal_is_ignored() {
    let b = boot(0, false, Some(LaunchMethod::Root), FakeRootShell::new(true, 0));

    let outcome = b
        .reconciler
        .on_boot(&BootSignal::parse("package-replaced"))
        .await;

    assert_eq!(outcome, BootOutcome::IgnoredSignal);
    assert_eq!(b.primary.ping_count(), 0);
    assert_eq!(b.shell.opened(), 0);
}
