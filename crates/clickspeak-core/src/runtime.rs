use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
};

use anyhow::{anyhow, Context, Result};

use crate::error::LaunchError;

/// CPython major.minor the runtime is pinned to.
pub const REQUIRED_VERSION: &str = "3.12";

/// Written last by the provisioner; its presence certifies a finished install.
pub const MARKER_FILE: &str = ".clickspeak-runtime";

/// One provisioned runtime directory tree (a virtual environment).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeInstallation {
    root: PathBuf,
    version: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    MissingInterpreter,
    InterpreterNotExecutable,
    MissingMarker,
    MarkerMismatch { found: String },
    InterpreterMismatch { found: Option<String> },
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    pub fn reason(&self) -> String {
        match self {
            Self::Ready => "ready".to_string(),
            Self::MissingInterpreter => "interpreter missing".to_string(),
            Self::InterpreterNotExecutable => "interpreter is not executable".to_string(),
            Self::MissingMarker => "marker file missing".to_string(),
            Self::MarkerMismatch { found } => format!("marker records version {found:?}"),
            Self::InterpreterMismatch { found: Some(v) } => {
                format!("interpreter reports version {v}")
            }
            Self::InterpreterMismatch { found: None } => {
                "interpreter failed the version check".to_string()
            }
        }
    }
}

impl RuntimeInstallation {
    pub fn new(root: impl Into<PathBuf>, version: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            version: version.into(),
        }
    }

    /// Installation at `root` pinned to [`REQUIRED_VERSION`].
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self::new(root, REQUIRED_VERSION)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn required_version(&self) -> &str {
        &self.version
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.root.join("bin")
    }

    pub fn interpreter(&self) -> PathBuf {
        self.bin_dir().join("python3")
    }

    pub fn package_dir(&self) -> PathBuf {
        self.root
            .join("lib")
            .join(format!("python{}", self.version))
            .join("site-packages")
    }

    pub fn marker_path(&self) -> PathBuf {
        self.root.join(MARKER_FILE)
    }

    /// Cheap checks first; the interpreter only runs once every file is in place.
    pub fn check(&self) -> Readiness {
        let python = self.interpreter();
        if !python.exists() {
            return Readiness::MissingInterpreter;
        }
        if !is_executable(&python) {
            return Readiness::InterpreterNotExecutable;
        }
        let marker = match fs::read_to_string(self.marker_path()) {
            Ok(s) => s,
            Err(_) => return Readiness::MissingMarker,
        };
        let recorded = strip_line_ending(&marker);
        if recorded != self.version {
            return Readiness::MarkerMismatch {
                found: recorded.to_string(),
            };
        }
        match interpreter_version(&python) {
            Ok(v) if v == self.version => Readiness::Ready,
            Ok(v) => Readiness::InterpreterMismatch { found: Some(v) },
            Err(_) => Readiness::InterpreterMismatch { found: None },
        }
    }

    pub fn ensure_ready(&self) -> Result<(), LaunchError> {
        match self.check() {
            Readiness::Ready => Ok(()),
            other => Err(LaunchError::RuntimeNotProvisioned {
                root: self.root.clone(),
                reason: other.reason(),
            }),
        }
    }

    pub fn write_marker(&self) -> Result<()> {
        let p = self.marker_path();
        fs::write(&p, self.version.as_bytes())
            .with_context(|| format!("write runtime marker failed: {}", p.display()))
    }
}

fn strip_line_ending(s: &str) -> &str {
    s.strip_suffix("\r\n")
        .or_else(|| s.strip_suffix('\n'))
        .unwrap_or(s)
}

#[cfg(unix)]
pub fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
pub fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// `"Python 3.12.4"` -> `"3.12"`.
pub fn parse_version_line(line: &str) -> Option<String> {
    let rest = line.trim().strip_prefix("Python")?.trim();
    let mut parts = rest.split('.');
    let major = parts.next()?;
    let minor: String = parts
        .next()?
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    if major.is_empty() || !major.chars().all(|c| c.is_ascii_digit()) || minor.is_empty() {
        return None;
    }
    Some(format!("{major}.{minor}"))
}

/// Major.minor reported by `python --version`.
pub fn interpreter_version(python: &Path) -> Result<String> {
    let out = Command::new(python)
        .arg("--version")
        .output()
        .with_context(|| format!("run python --version failed: {}", python.display()))?;
    if !out.status.success() {
        return Err(anyhow!(
            "E_PYTHON_VERSION: python --version exited with {} ({})",
            out.status,
            python.display()
        ));
    }
    let stdout = String::from_utf8_lossy(&out.stdout);
    let stderr = String::from_utf8_lossy(&out.stderr);
    let merged = if stdout.trim().is_empty() {
        stderr.to_string()
    } else {
        stdout.to_string()
    };
    let line = merged.lines().next().unwrap_or("").trim().to_string();
    parse_version_line(&line).ok_or_else(|| {
        anyhow!(
            "E_PYTHON_VERSION: unrecognized version output {:?} ({})",
            line,
            python.display()
        )
    })
}
