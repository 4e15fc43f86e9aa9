use std::io;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::warn;

use crate::error::ActivatorErr;
use crate::error::Result;

pub const SETTINGS_TOML_FILE: &str = "settings.toml";

/// Which privilege path last brought the primary service up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaunchMethod {
    Root,
    Adb,
}

impl LaunchMethod {
    /// A service running as uid 0 was started from root; anything else came
    /// through ADB's shell user.
    pub fn from_remote_uid(uid: u32) -> Self {
        if uid == 0 { Self::Root } else { Self::Adb }
    }
}

/// Narrow durable-settings surface used by the activation core.
pub trait SettingsStore: Send + Sync {
    fn last_launch_method(&self) -> Option<LaunchMethod>;

    fn set_last_launch_method(&self, method: LaunchMethod) -> Result<()>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SettingsFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_launch_method: Option<LaunchMethod>,
}

/// Settings persisted as TOML under the activator home directory.
#[derive(Debug, Clone)]
pub struct TomlSettingsStore {
    path: PathBuf,
}

impl TomlSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_home(home: &Path) -> Self {
        Self::new(home.join(SETTINGS_TOML_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<SettingsFile> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(SettingsFile::default());
            }
            Err(err) => return Err(err.into()),
        };
        toml::from_str(&contents).map_err(|source| ActivatorErr::SettingsParse {
            path: self.path.clone(),
            source,
        })
    }
}

impl SettingsStore for TomlSettingsStore {
    fn last_launch_method(&self) -> Option<LaunchMethod> {
        match self.load() {
            Ok(settings) => settings.last_launch_method,
            Err(err) => {
                warn!("ignoring unreadable settings: {err}");
                None
            }
        }
    }

    fn set_last_launch_method(&self, method: LaunchMethod) -> Result<()> {
        let mut settings = self.load().unwrap_or_else(|err| {
            warn!("replacing unreadable settings: {err}");
            SettingsFile::default()
        });
        if settings.last_launch_method == Some(method) {
            return Ok(());
        }
        settings.last_launch_method = Some(method);
        write_atomically(&self.path, &toml::to_string(&settings)?)?;
        Ok(())
    }
}

fn write_atomically(write_path: &Path, contents: &str) -> io::Result<()> {
    let parent = write_path.parent().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("path {} has no parent directory", write_path.display()),
        )
    })?;
    std::fs::create_dir_all(parent)?;
    let tmp = NamedTempFile::new_in(parent)?;
    std::fs::write(tmp.path(), contents)?;
    tmp.persist(write_path)?;
    Ok(())
}
