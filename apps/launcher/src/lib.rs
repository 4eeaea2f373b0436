//! ClickSpeak's native launcher.
//!
//! The binary exists so the OS attributes microphone, accessibility and input
//! monitoring grants to `ClickSpeak.app` rather than to a shared interpreter.
//! It hosts the provisioned Python runtime in-process and hands control to the
//! application's entry point.

pub mod embed;
pub mod environment;
pub mod launch;
pub mod notify;
pub mod panic_log;
#[cfg(all(feature = "embed-python", unix))]
pub mod python;

pub use embed::{EmbeddedRuntime, EntryPoint, RuntimeConfig, UnlinkedRuntime};
pub use environment::LaunchEnvironment;
pub use launch::{LaunchInputs, LaunchOutcome, LaunchState, Launcher};
pub use notify::{DialogNotifier, UserNotifier};

#[cfg(all(feature = "embed-python", unix))]
pub type DefaultRuntime = python::PythonRuntime;
#[cfg(not(all(feature = "embed-python", unix)))]
pub type DefaultRuntime = UnlinkedRuntime;

/// Runs one launch of this process and returns its exit code.
pub fn run_process() -> i32 {
    let inputs = LaunchInputs::from_process();
    panic_log::install_best_effort(inputs.data_dir());
    let mut launcher = Launcher::new(inputs, DefaultRuntime::default(), DialogNotifier::default());
    launcher.run(std::env::args_os()).exit_code
}
