//! Install locations and project discovery.
//!
//! Functions here take the home directory and overrides as arguments; only the
//! `*_from_env` helpers read the process environment.

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};

use crate::error::LaunchError;

pub const RUNTIME_DIR_ENV: &str = "CLICKSPEAK_RUNTIME_DIR";
pub const PROJECT_DIR_ENV: &str = "CLICKSPEAK_PROJECT_DIR";
pub const BOOTSTRAP_PYTHON_ENV: &str = "CLICKSPEAK_PYTHON";
pub const DATA_DIR_ENV: &str = "CLICKSPEAK_DATA_DIR";

/// A project checkout is recognized by its package manifest.
pub const PROJECT_MARKER: &str = "pyproject.toml";

/// Probed in order under `$HOME`; first hit wins.
pub const PROJECT_CANDIDATES: &[&str] = &[
    "projects/clickspeak",
    "clickspeak",
    "work/clickspeak",
    "Workspace/clickspeak",
    "Documents/clickspeak",
];

/// Package-manager bin dirs that GUI launches don't inherit on PATH.
pub const PACKAGE_MANAGER_BIN_DIRS: &[&str] = &["/opt/homebrew/bin", "/usr/local/bin"];

pub const FALLBACK_PATH: &str = "/usr/bin:/bin";

/// Non-empty (after trimming) value of `key`, as a path.
pub fn env_path(key: &str) -> Option<PathBuf> {
    let raw = std::env::var(key).ok()?;
    let t = raw.trim();
    if t.is_empty() {
        return None;
    }
    Some(PathBuf::from(t))
}

pub fn home_dir() -> Result<PathBuf, LaunchError> {
    dirs::home_dir()
        .filter(|h| !h.as_os_str().is_empty())
        .ok_or(LaunchError::NoHome)
}

pub fn app_support_dir(home: &Path) -> PathBuf {
    home.join("Library")
        .join("Application Support")
        .join(crate::identity::CLICKSPEAK.name)
}

/// Where traces and panic logs go.
pub fn data_dir(home: &Path, override_dir: Option<PathBuf>) -> PathBuf {
    override_dir.unwrap_or_else(|| app_support_dir(home))
}

pub fn data_dir_from_env(home: &Path) -> PathBuf {
    data_dir(home, env_path(DATA_DIR_ENV))
}

pub fn default_runtime_dir(home: &Path) -> PathBuf {
    app_support_dir(home).join("runtime")
}

pub fn resolve_runtime_dir(home: &Path, override_dir: Option<PathBuf>) -> PathBuf {
    override_dir.unwrap_or_else(|| default_runtime_dir(home))
}

/// First candidate directory (relative to `home`) that holds the project marker.
pub fn discover_project<S: AsRef<Path>>(home: &Path, candidates: &[S]) -> Option<PathBuf> {
    candidates
        .iter()
        .map(|c| home.join(c))
        .find(|dir| dir.join(PROJECT_MARKER).exists())
}

/// Explicit override wins unconditionally; probing is skipped when `probe` is false.
pub fn resolve_project_dir(
    home: &Path,
    override_dir: Option<PathBuf>,
    probe: bool,
) -> Option<PathBuf> {
    if let Some(dir) = override_dir {
        return Some(dir);
    }
    if !probe {
        return None;
    }
    discover_project(home, PROJECT_CANDIDATES)
}

pub fn project_source_dir(project: &Path) -> PathBuf {
    project.join("src")
}

/// `PATH` with the package-manager dirs in front of whatever was inherited.
pub fn augmented_search_path(inherited: Option<&OsString>) -> Result<OsString, std::env::JoinPathsError> {
    let mut dirs: Vec<PathBuf> = PACKAGE_MANAGER_BIN_DIRS.iter().map(PathBuf::from).collect();
    match inherited {
        Some(p) if !p.is_empty() => dirs.extend(std::env::split_paths(p)),
        _ => dirs.extend(std::env::split_paths(FALLBACK_PATH)),
    }
    std::env::join_paths(dirs)
}
