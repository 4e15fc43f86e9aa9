use dirs::home_dir;
use std::io;
use std::path::PathBuf;

/// Environment variable that overrides the state directory.
pub const ACTIVATOR_HOME_ENV_VAR: &str = "ACTIVATOR_HOME";

const DEFAULT_DIR_NAME: &str = ".activator";

/// Returns the directory holding `config.toml`, `settings.toml` and logs.
///
/// - If `ACTIVATOR_HOME` is set, the value must exist and be a directory. The
///   value will be canonicalized and this function will Err otherwise.
/// - If `ACTIVATOR_HOME` is not set, this function does not verify that the
///   directory exists.
pub fn find_activator_home() -> io::Result<PathBuf> {
    let env_value = std::env::var(ACTIVATOR_HOME_ENV_VAR)
        .ok()
        .filter(|val| !val.is_empty());
    find_activator_home_from_env(env_value.as_deref())
}

fn find_activator_home_from_env(env_value: Option<&str>) -> io::Result<PathBuf> {
    let Some(val) = env_value else {
        let mut p = home_dir()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "could not find home directory"))?;
        p.push(DEFAULT_DIR_NAME);
        return Ok(p);
    };

    let path = PathBuf::from(val);
    let metadata = std::fs::metadata(&path).map_err(|err| match err.kind() {
        io::ErrorKind::NotFound => io::Error::new(
            io::ErrorKind::NotFound,
            format!("{ACTIVATOR_HOME_ENV_VAR} points to {val:?}, but that path does not exist"),
        ),
        _ => io::Error::new(
            err.kind(),
            format!("failed to read {ACTIVATOR_HOME_ENV_VAR} {val:?}: {err}"),
        ),
    })?;

    if !metadata.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{ACTIVATOR_HOME_ENV_VAR} points to {val:?}, but that path is not a directory"),
        ));
    }

    path.canonicalize().map_err(|err| {
        io::Error::new(
            err.kind(),
            format!("failed to canonicalize {ACTIVATOR_HOME_ENV_VAR} {val:?}: {err}"),
        )
    })
}
