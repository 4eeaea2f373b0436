//! The seam between the launcher and the in-process interpreter.

use std::{ffi::OsString, path::PathBuf};

use clickspeak_core::{LaunchError, LaunchSettings, RuntimeInstallation};

/// Module and zero-argument function the application starts from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPoint {
    pub module: String,
    pub function: String,
}

impl EntryPoint {
    pub fn from_settings(settings: &LaunchSettings) -> Self {
        Self {
            module: settings.entry_module.clone(),
            function: settings.entry_function.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Reported as `sys.executable`; also anchors the runtime's prefix lookup.
    pub executable: PathBuf,
    pub parse_argv: bool,
    pub site_import: bool,
}

impl RuntimeConfig {
    pub fn for_installation(runtime: &RuntimeInstallation) -> Self {
        Self {
            executable: runtime.interpreter(),
            parse_argv: false,
            site_import: true,
        }
    }
}

/// An interpreter hosted inside this process.
///
/// Call order is fixed: `initialize`, `install_argv` once, `run_entry_point`,
/// then `finalize`.
pub trait EmbeddedRuntime {
    fn initialize(&mut self, config: &RuntimeConfig) -> Result<(), LaunchError>;

    fn install_argv(&mut self, argv: &[OsString]) -> Result<(), LaunchError>;

    /// `Ok` on a normal return or a successful `SystemExit`.
    fn run_entry_point(&mut self, entry: &EntryPoint) -> Result<(), LaunchError>;

    fn finalize(&mut self) -> Result<(), LaunchError>;
}

/// Process argv with index 0 replaced by the display name. Other arguments
/// keep their exact bytes.
pub fn embedded_argv<I>(process_argv: I, display_name: &str) -> Vec<OsString>
where
    I: IntoIterator,
    I::Item: Into<OsString>,
{
    let mut out = vec![OsString::from(display_name)];
    out.extend(process_argv.into_iter().skip(1).map(Into::into));
    out
}

/// Used when the launcher is built without the `embed-python` feature.
#[derive(Debug, Default)]
pub struct UnlinkedRuntime;

impl EmbeddedRuntime for UnlinkedRuntime {
    fn initialize(&mut self, _config: &RuntimeConfig) -> Result<(), LaunchError> {
        Err(LaunchError::RuntimeInitFailed(
            "launcher was built without an embedded runtime; rebuild it with `clickspeak-tools bundle`"
                .to_string(),
        ))
    }

    fn install_argv(&mut self, _argv: &[OsString]) -> Result<(), LaunchError> {
        Err(not_initialized())
    }

    fn run_entry_point(&mut self, _entry: &EntryPoint) -> Result<(), LaunchError> {
        Err(not_initialized())
    }

    fn finalize(&mut self) -> Result<(), LaunchError> {
        Ok(())
    }
}

fn not_initialized() -> LaunchError {
    LaunchError::RuntimeInitFailed("runtime is not initialized".to_string())
}
