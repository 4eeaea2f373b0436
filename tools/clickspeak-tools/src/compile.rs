use std::{
    ffi::OsString,
    fmt::Write as _,
    fs,
    path::{Path, PathBuf},
    process::Command,
};

use anyhow::{anyhow, Context, Result};
use clickspeak_core::RuntimeInstallation;
use clickspeak_observability::Tracer;
use serde_json::json;

use crate::{
    link::{self, LinkConfiguration, SysconfigProbe},
    process::{run_inherited, traced},
};

pub const LAUNCHER_PACKAGE: &str = "clickspeak-launcher";
pub const LAUNCHER_BIN: &str = "ClickSpeak";
pub const EMBED_FEATURE: &str = "embed-python";
pub const PYO3_CONFIG_FILE: &str = "pyo3-config.txt";

/// PyO3 interpreter config for the probed runtime.
///
/// PyO3's own link directives are suppressed; the ones from `link` are used
/// instead so framework builds link correctly.
pub fn pyo3_config(probe: &SysconfigProbe, link: &LinkConfiguration, executable: &Path) -> String {
    let mut s = String::new();
    let _ = writeln!(s, "implementation=CPython");
    let _ = writeln!(s, "version={}", probe.version);
    let _ = writeln!(s, "shared=true");
    let _ = writeln!(s, "abi3=false");
    let _ = writeln!(s, "lib_name=python{}", probe.ld_version);
    if let LinkConfiguration::SharedLibrary { lib_dir, .. } = link {
        let _ = writeln!(s, "lib_dir={}", lib_dir.display());
    }
    let _ = writeln!(s, "executable={}", executable.display());
    let _ = writeln!(s, "pointer_width={}", probe.pointer_width);
    let _ = writeln!(s, "build_flags=");
    let _ = writeln!(s, "suppress_build_script_link_lines=true");
    for line in link.link_lines() {
        let _ = writeln!(s, "extra_build_script_line={line}");
    }
    s
}

#[derive(Debug, Clone)]
pub struct BuildRequest<'a> {
    pub probe: &'a SysconfigProbe,
    pub link: &'a LinkConfiguration,
    pub interpreter: PathBuf,
}

/// Produces a launcher binary linked for `req`; returns where it was written.
pub trait LauncherBuilder {
    fn build(&self, req: &BuildRequest<'_>) -> Result<PathBuf>;
}

/// `cargo build` of the launcher crate in its own target dir.
#[derive(Debug, Clone)]
pub struct CargoBuilder {
    workspace_root: PathBuf,
    target_dir: PathBuf,
    cargo: OsString,
}

impl CargoBuilder {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        let workspace_root = workspace_root.into();
        let target_dir = workspace_root.join("target").join("bundle");
        let cargo = std::env::var_os("CARGO").unwrap_or_else(|| OsString::from("cargo"));
        Self {
            workspace_root,
            target_dir,
            cargo,
        }
    }

    /// The workspace this tool was compiled from.
    pub fn source_workspace_root() -> PathBuf {
        let manifest = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        manifest
            .parent()
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .unwrap_or(manifest)
    }

    pub fn config_path(&self) -> PathBuf {
        self.target_dir.join(PYO3_CONFIG_FILE)
    }

    pub fn product_path(&self) -> PathBuf {
        self.target_dir.join("release").join(LAUNCHER_BIN)
    }

    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.cargo);
        cmd.arg("build")
            .arg("--release")
            .arg("-p")
            .arg(LAUNCHER_PACKAGE)
            .arg("--features")
            .arg(EMBED_FEATURE)
            .arg("--manifest-path")
            .arg(self.workspace_root.join("Cargo.toml"))
            .env("PYO3_CONFIG_FILE", self.config_path())
            .env("CARGO_TARGET_DIR", &self.target_dir);
        cmd
    }
}

impl LauncherBuilder for CargoBuilder {
    fn build(&self, req: &BuildRequest<'_>) -> Result<PathBuf> {
        fs::create_dir_all(&self.target_dir)
            .with_context(|| format!("create {} failed", self.target_dir.display()))?;
        let config = self.config_path();
        fs::write(&config, pyo3_config(req.probe, req.link, &req.interpreter))
            .with_context(|| format!("write {} failed", config.display()))?;
        run_inherited(&mut self.command(), "cargo build (launcher)")?;
        let product = self.product_path();
        if !product.is_file() {
            return Err(anyhow!(
                "E_LAUNCHER_BUILD: cargo finished but {} is missing",
                product.display()
            ));
        }
        Ok(product)
    }
}

/// A runtime's probed build configuration.
#[derive(Debug, Clone)]
pub struct LinkedRuntime {
    pub probe: SysconfigProbe,
    pub link: LinkConfiguration,
}

/// Probes `runtime`; fails with `HeadersMissing` or `E_LIBPYTHON_MISSING`
/// before anything is built.
pub fn link_runtime(runtime: &RuntimeInstallation, tracer: &Tracer) -> Result<LinkedRuntime> {
    let (probe, link) = traced(tracer, "compile.link_config", "E_LINK_CONFIG", None, || {
        link::discover(runtime)
    })?;
    Ok(LinkedRuntime { probe, link })
}

#[derive(Debug, Clone)]
pub struct CompiledLauncher {
    pub path: PathBuf,
    pub probe: SysconfigProbe,
    pub link: LinkConfiguration,
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
        .with_context(|| format!("chmod {} failed", path.display()))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}

/// Links a launcher against `runtime` and installs it at `destination`.
pub fn compile_launcher(
    destination: &Path,
    runtime: &RuntimeInstallation,
    linked: LinkedRuntime,
    builder: &dyn LauncherBuilder,
    tracer: &Tracer,
) -> Result<CompiledLauncher> {
    let LinkedRuntime { probe, link } = linked;
    let built = traced(
        tracer,
        "compile.build",
        "E_LAUNCHER_BUILD",
        Some(json!({ "shape": link.shape(), "rpath": link.rpath() })),
        || {
            builder.build(&BuildRequest {
                probe: &probe,
                link: &link,
                interpreter: runtime.interpreter(),
            })
        },
    )?;

    if let Some(dir) = destination.parent() {
        fs::create_dir_all(dir).with_context(|| format!("create {} failed", dir.display()))?;
    }
    fs::copy(&built, destination).with_context(|| {
        format!("copy {} -> {} failed", built.display(), destination.display())
    })?;
    make_executable(destination)?;
    Ok(CompiledLauncher {
        path: destination.to_path_buf(),
        probe,
        link,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared_probe() -> (SysconfigProbe, LinkConfiguration) {
        let probe = SysconfigProbe {
            include_dir: PathBuf::from("/py/include/python3.12"),
            framework_name: String::new(),
            framework_prefix: PathBuf::new(),
            lib_dir: PathBuf::from("/py/lib"),
            ld_version: "3.12".to_string(),
            version: "3.12".to_string(),
            pointer_width: 64,
        };
        let link = LinkConfiguration::SharedLibrary {
            include_dir: probe.include_dir.clone(),
            lib_dir: probe.lib_dir.clone(),
            lib_name: "python3.12".to_string(),
            rpath: probe.lib_dir.clone(),
        };
        (probe, link)
    }

    #[test]
    fn config_suppresses_pyo3_links_and_adds_ours() {
        let (probe, link) = shared_probe();
        let cfg = pyo3_config(&probe, &link, Path::new("/rt/bin/python3"));
        let lines: Vec<&str> = cfg.lines().collect();
        assert!(lines.contains(&"version=3.12"));
        assert!(lines.contains(&"lib_dir=/py/lib"));
        assert!(lines.contains(&"executable=/rt/bin/python3"));
        assert!(lines.contains(&"suppress_build_script_link_lines=true"));
        assert!(lines.contains(&"extra_build_script_line=cargo:rustc-link-lib=dylib=python3.12"));
        assert!(lines.contains(&"extra_build_script_line=cargo:rustc-link-arg=-Wl,-rpath,/py/lib"));
    }

    #[test]
    fn framework_config_has_no_lib_dir() {
        let (probe, _) = shared_probe();
        let link = LinkConfiguration::Framework {
            include_dir: probe.include_dir.clone(),
            framework_prefix: PathBuf::from("/Library/Frameworks"),
            framework_name: "Python".to_string(),
            rpath: PathBuf::from("/Library/Frameworks"),
        };
        let cfg = pyo3_config(&probe, &link, Path::new("/rt/bin/python3"));
        assert!(!cfg.contains("lib_dir="));
        assert!(cfg.contains("extra_build_script_line=cargo:rustc-link-lib=framework=Python\n"));
    }

    #[test]
    fn cargo_command_targets_launcher_with_embedding() {
        let b = CargoBuilder::new("/ws");
        let cmd = b.command();
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec![
                "build",
                "--release",
                "-p",
                "clickspeak-launcher",
                "--features",
                "embed-python",
                "--manifest-path",
                "/ws/Cargo.toml",
            ]
        );
        let envs: Vec<(String, String)> = cmd
            .get_envs()
            .filter_map(|(k, v)| Some((k.to_string_lossy().into_owned(), v?.to_string_lossy().into_owned())))
            .collect();
        assert!(envs.contains(&(
            "PYO3_CONFIG_FILE".to_string(),
            "/ws/target/bundle/pyo3-config.txt".to_string()
        )));
        assert!(envs.contains(&("CARGO_TARGET_DIR".to_string(), "/ws/target/bundle".to_string())));
        assert_eq!(b.product_path(), PathBuf::from("/ws/target/bundle/release/ClickSpeak"));
    }

    #[test]
    fn source_workspace_root_holds_workspace_manifest() {
        let root = CargoBuilder::source_workspace_root();
        assert!(root.join("tools").join("clickspeak-tools").join("Cargo.toml").is_file());
    }
}
