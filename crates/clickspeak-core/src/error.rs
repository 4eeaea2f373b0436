use std::path::PathBuf;

use thiserror::Error;

use crate::identity::PROVISION_COMMAND;

/// Every way the launch path and the install pipeline can fail.
///
/// The display form starts with the stable `E_*` code so it can be grepped in
/// terminal output and trace files alike.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("E_NO_HOME: home directory could not be determined")]
    NoHome,

    #[error(
        "E_RUNTIME_UNAVAILABLE: no Python {required} interpreter found (checked: {})",
        format_checked(.checked)
    )]
    RuntimeUnavailable {
        required: String,
        checked: Vec<String>,
    },

    #[error("E_RUNTIME_NOT_PROVISIONED: runtime at {} is not ready: {reason}", .root.display())]
    RuntimeNotProvisioned { root: PathBuf, reason: String },

    #[error(
        "E_HEADERS_MISSING: Python.h not found in {}; install the Python {version} development headers, then re-run `{}`",
        .include_dir.display(),
        PROVISION_COMMAND
    )]
    HeadersMissing { include_dir: PathBuf, version: String },

    #[error("E_RUNTIME_INIT_FAILED: {0}")]
    RuntimeInitFailed(String),

    #[error("E_ENTRY_POINT_FAILED: {0}")]
    EntryPointFailed(String),
}

fn format_checked(checked: &[String]) -> String {
    if checked.is_empty() {
        "nothing".to_string()
    } else {
        checked.join(", ")
    }
}

impl LaunchError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoHome => "E_NO_HOME",
            Self::RuntimeUnavailable { .. } => "E_RUNTIME_UNAVAILABLE",
            Self::RuntimeNotProvisioned { .. } => "E_RUNTIME_NOT_PROVISIONED",
            Self::HeadersMissing { .. } => "E_HEADERS_MISSING",
            Self::RuntimeInitFailed(_) => "E_RUNTIME_INIT_FAILED",
            Self::EntryPointFailed(_) => "E_ENTRY_POINT_FAILED",
        }
    }

    /// Short, actionable text for a dialog. The full display form goes to
    /// stderr and the trace instead.
    pub fn user_message(&self, app_name: &str) -> String {
        match self {
            Self::NoHome => "HOME environment variable is not set.".to_string(),
            Self::RuntimeUnavailable { required, .. } => format!(
                "Python {required} is required to set up {app_name}. Install it, then run: {PROVISION_COMMAND}"
            ),
            Self::RuntimeNotProvisioned { .. } => {
                format!("{app_name} runtime not found. Re-run: {PROVISION_COMMAND}")
            }
            Self::HeadersMissing { version, .. } => format!(
                "Python {version} development headers are missing. Install them, then re-run: {PROVISION_COMMAND}"
            ),
            Self::RuntimeInitFailed(_) => {
                format!("Python initialization failed. Re-run: {PROVISION_COMMAND}")
            }
            Self::EntryPointFailed(_) => format!("{app_name} exited with an error."),
        }
    }
}
