use std::path::{Path, PathBuf};

const HOME_ENV: &str = "WARDEN_HOME";

/// Get Warden's per-user home directory.
///
/// `$WARDEN_HOME` when set and non-empty, otherwise `~/.warden`.
pub fn warden_home_dir() -> Result<PathBuf, std::io::Error> {
    resolve_home(std::env::var(HOME_ENV).ok(), dirs::home_dir())
}

/// Directory holding the development root CA.
pub fn ca_dir() -> Result<PathBuf, std::io::Error> {
    Ok(warden_home_dir()?.join("ca"))
}

/// Default data dir (ACME cache, dev leaf).
///
/// In debug builds run from a source checkout this is `{repo}/local-dev/warden/data`.
pub fn default_data_dir() -> Result<PathBuf, std::io::Error> {
    if cfg!(debug_assertions)
        && let Ok(exe) = std::env::current_exe()
        && let Some(dir) = debug_default_data_dir_from_exe(&exe)
    {
        return Ok(dir);
    }
    Ok(warden_home_dir()?.join("data"))
}

fn resolve_home(env_value: Option<String>, home: Option<PathBuf>) -> Result<PathBuf, std::io::Error> {
    if let Some(v) = env_value
        && !v.trim().is_empty()
    {
        return Ok(PathBuf::from(v));
    }

    let home = home.ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "Could not determine home directory",
        )
    })?;

    Ok(home.join(".warden"))
}

/// If `warden-server` is being run from a path under a `target/` directory, return that
/// `target/` directory path.
pub fn target_dir_from_exe(exe_path: &Path) -> Option<PathBuf> {
    let mut cur = exe_path;
    loop {
        if cur.file_name().is_some_and(|n| n == "target") {
            return Some(cur.to_path_buf());
        }
        cur = cur.parent()?;
    }
}

/// Default data dir for debug builds when running from a source checkout.
pub fn debug_default_data_dir_from_exe(exe_path: &Path) -> Option<PathBuf> {
    target_dir_from_exe(exe_path)?
        .parent()
        .map(|root| root.join("local-dev").join("warden").join("data"))
}
