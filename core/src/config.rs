use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::error::ActivatorErr;
use crate::error::Result;
use crate::permissions::CapabilityRequest;
use crate::permissions::default_capability_requests;
use crate::starter::Starter;

pub const CONFIG_TOML_FILE: &str = "config.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivatorConfig {
    /// Package whose installation ships the native launcher.
    pub package_name: String,
    /// Native launcher binary inside the application's installation.
    pub launcher_path: PathBuf,
    /// Passed to the launcher as `--apk=` so it can verify its origin.
    pub package_source_path: PathBuf,
    /// Delay before the single confirmation probe after a successful activation.
    pub reprobe_delay_ms: u64,
    /// Capabilities negotiated with the bootstrap broker, highest priority first.
    pub capabilities: Vec<CapabilityRequest>,
    /// Unix socket the primary service listens on.
    pub primary_socket: PathBuf,
    /// Unix socket the bootstrap broker listens on.
    pub bootstrap_socket: PathBuf,
    /// Binary used to acquire a root shell at boot.
    pub su_binary: String,
}

impl Default for ActivatorConfig {
    fn default() -> Self {
        Self {
            package_name: "dev.activator.manager".to_string(),
            launcher_path: PathBuf::from("/data/app/dev.activator.manager/lib/arm64/libstarter.so"),
            package_source_path: PathBuf::from("/data/app/dev.activator.manager/base.apk"),
            reprobe_delay_ms: 1_000,
            capabilities: default_capability_requests(),
            primary_socket: PathBuf::from("/data/local/tmp/activator/primary.sock"),
            bootstrap_socket: PathBuf::from("/data/local/tmp/activator/bootstrap.sock"),
            su_binary: "su".to_string(),
        }
    }
}

impl ActivatorConfig {
    /// Loads `<home>/config.toml`; a missing file yields the defaults.
    pub fn load(home: &Path) -> Result<Self> {
        Self::load_from_file(&home.join(CONFIG_TOML_FILE))
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => return Err(err.into()),
        };
        toml::from_str(&contents).map_err(|source| ActivatorErr::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn reprobe_delay(&self) -> Duration {
        Duration::from_millis(self.reprobe_delay_ms)
    }

    pub fn starter(&self) -> Starter {
        Starter::new(
            self.package_name.clone(),
            self.launcher_path.clone(),
            self.package_source_path.clone(),
        )
    }
}
