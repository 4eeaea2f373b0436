//! CPython hosted through PyO3's FFI layer.

use std::{
    ffi::{CStr, CString, OsString},
    os::unix::ffi::OsStrExt,
};

use clickspeak_core::LaunchError;
use pyo3::{exceptions::PySystemExit, ffi, prelude::*, types::PyList};

use crate::embed::{EmbeddedRuntime, EntryPoint, RuntimeConfig};

#[derive(Debug, Default)]
pub struct PythonRuntime {
    initialized: bool,
    argv_installed: bool,
}

fn status_message(status: &ffi::PyStatus) -> String {
    let describe = |p: *const std::os::raw::c_char| {
        if p.is_null() {
            None
        } else {
            // SAFETY: non-null status strings are static C strings owned by CPython.
            Some(unsafe { CStr::from_ptr(p) }.to_string_lossy().into_owned())
        }
    };
    match (describe(status.func), describe(status.err_msg)) {
        (Some(f), Some(m)) => format!("{f}: {m}"),
        (None, Some(m)) => m,
        (Some(f), None) => f,
        (None, None) => "(unknown error)".to_string(),
    }
}

impl EmbeddedRuntime for PythonRuntime {
    fn initialize(&mut self, config: &RuntimeConfig) -> Result<(), LaunchError> {
        if self.initialized {
            return Ok(());
        }
        let executable = CString::new(config.executable.as_os_str().as_bytes()).map_err(|_| {
            LaunchError::RuntimeInitFailed(format!(
                "interpreter path contains a NUL byte: {}",
                config.executable.display()
            ))
        })?;

        // SAFETY: the config is initialized by CPython before any field is
        // touched and cleared on every path out of this block.
        unsafe {
            let mut cfg = std::mem::MaybeUninit::<ffi::PyConfig>::zeroed();
            let cfg_ptr = cfg.as_mut_ptr();
            ffi::PyConfig_InitPythonConfig(cfg_ptr);
            (*cfg_ptr).parse_argv = i32::from(config.parse_argv);
            (*cfg_ptr).site_import = i32::from(config.site_import);

            let status = ffi::PyConfig_SetBytesString(
                cfg_ptr,
                std::ptr::addr_of_mut!((*cfg_ptr).executable),
                executable.as_ptr(),
            );
            if ffi::PyStatus_Exception(status) != 0 {
                let msg = status_message(&status);
                ffi::PyConfig_Clear(cfg_ptr);
                return Err(LaunchError::RuntimeInitFailed(format!(
                    "set executable failed: {msg}"
                )));
            }

            let status = ffi::Py_InitializeFromConfig(cfg_ptr);
            ffi::PyConfig_Clear(cfg_ptr);
            if ffi::PyStatus_Exception(status) != 0 {
                return Err(LaunchError::RuntimeInitFailed(status_message(&status)));
            }
        }
        self.initialized = true;
        Ok(())
    }

    fn install_argv(&mut self, argv: &[OsString]) -> Result<(), LaunchError> {
        if !self.initialized {
            return Err(LaunchError::RuntimeInitFailed(
                "runtime is not initialized".to_string(),
            ));
        }
        if self.argv_installed {
            return Err(LaunchError::RuntimeInitFailed(
                "sys.argv was already set".to_string(),
            ));
        }
        Python::with_gil(|py| -> PyResult<()> {
            let sys = py.import("sys")?;
            // Decoded with the filesystem encoding (surrogateescape), so
            // `os.fsencode(sys.argv[i])` gives back the original bytes.
            let list = PyList::new(py, argv.iter().map(OsString::as_os_str))?;
            sys.setattr("argv", list)?;
            Ok(())
        })
        .map_err(|e| LaunchError::RuntimeInitFailed(format!("set sys.argv failed: {e}")))?;
        self.argv_installed = true;
        Ok(())
    }

    fn run_entry_point(&mut self, entry: &EntryPoint) -> Result<(), LaunchError> {
        if !self.initialized {
            return Err(LaunchError::RuntimeInitFailed(
                "runtime is not initialized".to_string(),
            ));
        }
        Python::with_gil(|py| {
            let call = || -> PyResult<()> {
                let module = py.import(entry.module.as_str())?;
                module.getattr(entry.function.as_str())?.call0()?;
                Ok(())
            };
            match call() {
                Ok(()) => Ok(()),
                Err(err) if err.is_instance_of::<PySystemExit>(py) => system_exit(py, &err),
                Err(err) => {
                    let msg = format!("{}.{}: {err}", entry.module, entry.function);
                    err.print(py);
                    Err(LaunchError::EntryPointFailed(msg))
                }
            }
        })
    }

    fn finalize(&mut self) -> Result<(), LaunchError> {
        if !self.initialized {
            return Ok(());
        }
        self.initialized = false;
        // SAFETY: this thread initialized the runtime and still holds its GIL.
        let rc = unsafe { ffi::Py_FinalizeEx() };
        if rc != 0 {
            return Err(LaunchError::RuntimeInitFailed(
                "Py_FinalizeEx failed to flush buffered data".to_string(),
            ));
        }
        Ok(())
    }
}

/// `None` and `0` are clean exits; any other code is a failure.
fn system_exit(py: Python<'_>, err: &PyErr) -> Result<(), LaunchError> {
    let code = match err.value(py).getattr("code") {
        Ok(c) => c,
        Err(_) => return Err(LaunchError::EntryPointFailed("SystemExit".to_string())),
    };
    if code.is_none() {
        return Ok(());
    }
    match code.extract::<i64>() {
        Ok(0) => Ok(()),
        Ok(n) => Err(LaunchError::EntryPointFailed(format!("SystemExit({n})"))),
        Err(_) => {
            let text = code
                .str()
                .map(|s| s.to_string())
                .unwrap_or_else(|_| "<unprintable>".to_string());
            clickspeak_observability::safe_eprintln!("{text}");
            Err(LaunchError::EntryPointFailed(format!("SystemExit({text:?})")))
        }
    }
}
