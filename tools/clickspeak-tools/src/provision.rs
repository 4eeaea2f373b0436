//! Creates or rebuilds the isolated runtime.
//!
//! A rebuild never touches the live runtime until the replacement is complete:
//! the new environment is built in `<root>.staging-<pid>` and renamed over the
//! old one. An exclusive lock on `<parent>/.runtime.lock` serializes concurrent
//! provisioners.

use std::{
    ffi::OsString,
    fs::{self, File, OpenOptions},
    path::{Path, PathBuf},
    process::Command,
};

use anyhow::{anyhow, Context, Result};
use clickspeak_core::{
    paths::{self, PACKAGE_MANAGER_BIN_DIRS},
    runtime::{interpreter_version, is_executable},
    LaunchError, RuntimeInstallation,
};
use clickspeak_observability::Tracer;
use fs4::fs_std::FileExt;
use serde_json::json;

use crate::{
    process::{run_checked, traced},
    staging,
};

pub const LOCK_FILE: &str = ".runtime.lock";

/// Interpreter names looked up on the search path, in preference order.
pub const BOOTSTRAP_NAMES: &[&str] = &["python3.12", "python3"];

#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub runtime: RuntimeInstallation,
    /// Installed editable into the runtime.
    pub project: PathBuf,
    pub bootstrap_override: Option<PathBuf>,
    pub search_dirs: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionOutcome {
    AlreadyReady,
    Rebuilt { bootstrap: PathBuf },
}

/// Inherited `PATH` followed by the package-manager dirs it lacks.
pub fn default_search_dirs(inherited: Option<&OsString>) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = match inherited {
        Some(p) if !p.is_empty() => std::env::split_paths(p).collect(),
        _ => std::env::split_paths(paths::FALLBACK_PATH).collect(),
    };
    for extra in PACKAGE_MANAGER_BIN_DIRS {
        let extra = PathBuf::from(extra);
        if !dirs.contains(&extra) {
            dirs.push(extra);
        }
    }
    dirs
}

pub fn find_on_path(name: &str, dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .map(|d| d.join(name))
        .find(|p| is_executable(p))
}

/// Override first, then each of [`BOOTSTRAP_NAMES`] as found on `dirs`.
pub fn candidate_interpreters(override_python: Option<&Path>, dirs: &[PathBuf]) -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(p) = override_python {
        out.push(p.to_path_buf());
    }
    for name in BOOTSTRAP_NAMES {
        if let Some(p) = find_on_path(name, dirs) {
            if !out.contains(&p) {
                out.push(p);
            }
        }
    }
    out
}

/// First candidate reporting `required`; otherwise `RuntimeUnavailable`
/// listing what each candidate reported.
pub fn select_bootstrap(candidates: &[PathBuf], required: &str) -> Result<PathBuf> {
    let mut checked = Vec::with_capacity(candidates.len());
    for c in candidates {
        match interpreter_version(c) {
            Ok(v) if v == required => return Ok(c.clone()),
            Ok(v) => checked.push(format!("{} ({v})", c.display())),
            Err(e) => checked.push(format!("{} ({e})", c.display())),
        }
    }
    Err(LaunchError::RuntimeUnavailable {
        required: required.to_string(),
        checked,
    }
    .into())
}

/// Exclusive advisory lock; released when dropped.
#[derive(Debug)]
pub struct RuntimeLock {
    _file: File,
    path: PathBuf,
}

impl RuntimeLock {
    pub fn acquire(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("create {} failed", dir.display()))?;
        let path = dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("open runtime lock failed: {}", path.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("lock {} failed", path.display()))?;
        Ok(Self { _file: file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Rewrites `from` to `to` inside the text files of `bin_dir`.
///
/// Symlinks and non-UTF-8 files (the interpreter itself) are left alone.
pub fn relocate_scripts(bin_dir: &Path, from: &Path, to: &Path) -> Result<usize> {
    let from = from.to_string_lossy();
    let to = to.to_string_lossy();
    let mut rewritten = 0;
    let entries =
        fs::read_dir(bin_dir).with_context(|| format!("read {} failed", bin_dir.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("read {} failed", bin_dir.display()))?;
        let ft = entry.file_type()?;
        if !ft.is_file() {
            continue;
        }
        let p = entry.path();
        let Ok(text) = fs::read_to_string(&p) else {
            continue;
        };
        if !text.contains(from.as_ref()) {
            continue;
        }
        fs::write(&p, text.replace(from.as_ref(), to.as_ref()))
            .with_context(|| format!("rewrite {} failed", p.display()))?;
        rewritten += 1;
    }
    Ok(rewritten)
}

fn build_staging(
    staging_rt: &RuntimeInstallation,
    final_root: &Path,
    bootstrap: &Path,
    project: &Path,
    tracer: &Tracer,
) -> Result<()> {
    let staging = staging_rt.root();
    let python = staging_rt.interpreter();

    traced(tracer, "provision.venv", "E_VENV", Some(json!({ "bootstrap": bootstrap })), || {
        run_checked(
            Command::new(bootstrap).arg("-m").arg("venv").arg(staging),
            "python -m venv",
        )
    })?;
    traced(tracer, "provision.pip_upgrade", "E_PIP", None, || {
        run_checked(
            Command::new(&python).args(["-m", "pip", "install", "--upgrade", "pip"]),
            "pip install --upgrade pip",
        )
    })?;
    traced(
        tracer,
        "provision.install_project",
        "E_PIP",
        Some(json!({ "project": project })),
        || {
            run_checked(
                Command::new(&python)
                    .args(["-m", "pip", "install", "-e"])
                    .arg(project),
                "pip install -e",
            )
        },
    )?;

    let found = interpreter_version(&python)?;
    if found != staging_rt.required_version() {
        return Err(anyhow!(
            "E_PYTHON_VERSION: new runtime reports Python {found}, expected {}",
            staging_rt.required_version()
        ));
    }

    relocate_scripts(&staging_rt.bin_dir(), staging, final_root)?;
    staging_rt.write_marker()
}

/// Returns the runtime unchanged when it is ready; rebuilds it otherwise.
pub fn ensure_runtime(req: &ProvisionRequest, tracer: &Tracer) -> Result<ProvisionOutcome> {
    let root = req.runtime.root();
    let readiness = req.runtime.check();
    if readiness.is_ready() {
        return Ok(ProvisionOutcome::AlreadyReady);
    }
    tracer.event(
        "provision.check",
        "ok",
        Some(json!({ "runtime": root, "readiness": readiness.reason() })),
    );

    let parent = root
        .parent()
        .ok_or_else(|| anyhow!("E_RUNTIME_PATH: runtime dir has no parent: {}", root.display()))?;
    let _lock = RuntimeLock::acquire(parent)?;
    let swept = staging::sweep_stale(root)?;
    if !swept.is_empty() {
        tracer.event("provision.sweep", "ok", Some(json!({ "removed": swept })));
    }
    if req.runtime.check().is_ready() {
        return Ok(ProvisionOutcome::AlreadyReady);
    }

    let candidates = candidate_interpreters(req.bootstrap_override.as_deref(), &req.search_dirs);
    let bootstrap = select_bootstrap(&candidates, req.runtime.required_version())?;

    let staging = staging::staging_dir(root)?;
    let staging_rt = RuntimeInstallation::new(&staging, req.runtime.required_version());
    if let Err(e) = build_staging(&staging_rt, root, &bootstrap, &req.project, tracer) {
        let _ = fs::remove_dir_all(&staging);
        return Err(e);
    }

    let swapped = traced(
        tracer,
        "provision.swap",
        "E_RUNTIME_SWAP",
        Some(json!({ "runtime": root })),
        || staging::swap_into_place(&staging, root, "E_RUNTIME_SWAP"),
    );
    if let Err(e) = swapped {
        let _ = fs::remove_dir_all(&staging);
        return Err(e);
    }
    Ok(ProvisionOutcome::Rebuilt { bootstrap })
}
