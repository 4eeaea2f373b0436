use std::{
    ffi::{OsStr, OsString},
    path::{Path, PathBuf},
};

use clickspeak_core::{
    paths::{self, RUNTIME_DIR_ENV},
    AppIdentity, LaunchError, RuntimeInstallation,
};

/// What the environment is derived from.
#[derive(Debug, Clone)]
pub struct EnvironmentInputs<'a> {
    pub identity: &'a AppIdentity,
    pub runtime: &'a RuntimeInstallation,
    pub project: Option<&'a Path>,
    /// Application source shipped inside a release bundle.
    pub bundled_source: Option<&'a Path>,
    /// The launcher's own binary, when the OS reports it.
    pub executable: Option<&'a Path>,
    pub inherited_path: Option<&'a OsString>,
}

/// Variables, module search path and working directory for the embedded runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchEnvironment {
    pub vars: Vec<(String, OsString)>,
    /// Highest priority first.
    pub module_search_path: Vec<PathBuf>,
    pub working_dir: Option<PathBuf>,
}

/// Project source, then bundled source, then installed packages. Earlier
/// entries shadow later ones, so edits in a checkout win without reinstalling.
pub fn module_search_path(
    runtime: &RuntimeInstallation,
    project: Option<&Path>,
    bundled_source: Option<&Path>,
) -> Vec<PathBuf> {
    let mut out = Vec::with_capacity(3);
    if let Some(p) = project {
        out.push(paths::project_source_dir(p));
    }
    if let Some(b) = bundled_source {
        out.push(b.to_path_buf());
    }
    out.push(runtime.package_dir());
    out
}

impl LaunchEnvironment {
    pub fn build(inputs: &EnvironmentInputs<'_>) -> Result<Self, LaunchError> {
        let module_search_path =
            module_search_path(inputs.runtime, inputs.project, inputs.bundled_source);
        let pythonpath = std::env::join_paths(&module_search_path).map_err(|e| {
            LaunchError::RuntimeInitFailed(format!("module search path is not representable: {e}"))
        })?;
        let search_path = paths::augmented_search_path(inputs.inherited_path).map_err(|e| {
            LaunchError::RuntimeInitFailed(format!("PATH is not representable: {e}"))
        })?;

        let mut vars: Vec<(String, OsString)> = vec![
            ("PYTHONUNBUFFERED".to_string(), "1".into()),
            ("PYTHONNOUSERSITE".to_string(), "1".into()),
            ("PYTHONFAULTHANDLER".to_string(), "1".into()),
            (
                "CLICKSPEAK_BUNDLE_IDENTIFIER".to_string(),
                inputs.identity.bundle_identifier.into(),
            ),
            (
                "CLICKSPEAK_APP_NAME".to_string(),
                inputs.identity.display_name.into(),
            ),
            (
                RUNTIME_DIR_ENV.to_string(),
                inputs.runtime.root().as_os_str().to_owned(),
            ),
        ];
        if let Some(exe) = inputs.executable {
            vars.push((
                "CLICKSPEAK_APP_PATH".to_string(),
                exe.as_os_str().to_owned(),
            ));
        }
        vars.push(("PATH".to_string(), search_path));
        vars.push(("PYTHONPATH".to_string(), pythonpath));

        Ok(Self {
            vars,
            module_search_path,
            working_dir: inputs.project.map(Path::to_path_buf),
        })
    }

    pub fn var(&self, key: &str) -> Option<&OsStr> {
        self.vars
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_os_str())
    }

    /// Exports the variables into this process and moves into the working dir.
    ///
    /// Variables are always applied; the error only reports a failed chdir.
    pub fn apply(&self) -> std::io::Result<()> {
        for (k, v) in &self.vars {
            std::env::set_var(k, v);
        }
        match &self.working_dir {
            Some(dir) => std::env::set_current_dir(dir),
            None => Ok(()),
        }
    }
}
