//! Command lines that start the primary service through the native launcher
//! shipped inside the application's installation.

use std::path::PathBuf;

/// Argument through which the launcher learns the installing package's path,
/// so the privileged process can verify where it was started from.
pub const APK_ARG_PREFIX: &str = "--apk=";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Starter {
    package_name: String,
    launcher_path: PathBuf,
    package_source_path: PathBuf,
}

impl Starter {
    pub fn new(
        package_name: impl Into<String>,
        launcher_path: impl Into<PathBuf>,
        package_source_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            package_name: package_name.into(),
            launcher_path: launcher_path.into(),
            package_source_path: package_source_path.into(),
        }
    }

    /// The bare launcher invocation, for users starting it from a root shell.
    pub fn user_command(&self) -> String {
        self.launcher_path.display().to_string()
    }

    /// One-liner for `adb shell` that locates the launcher through the
    /// package manager instead of a hard-coded install path.
    pub fn adb_command(&self) -> String {
        let launcher_file = self
            .launcher_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        format!(
            "`pm path {} | grep base | sed 's/package://;s|base.apk|lib/arm64/{launcher_file}|'`",
            self.package_name
        )
    }

    /// `<launcher> --apk=<package source path>`. The launcher binary depends on
    /// this exact shape.
    pub fn internal_command(&self) -> String {
        format!(
            "{} {APK_ARG_PREFIX}{}",
            self.launcher_path.display(),
            self.package_source_path.display()
        )
    }

    /// The activation command wrapped for `sh -c`.
    pub fn shell_argv(&self) -> Vec<String> {
        shell_argv(&self.internal_command())
    }
}

pub fn shell_argv(command: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), command.to_string()]
}
