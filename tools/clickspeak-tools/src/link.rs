//! How the launcher links against the provisioned runtime.
//!
//! The runtime's own `sysconfig` is the source of truth. A framework build
//! (python.org installers, Homebrew) links `-framework Python`; everything
//! else links `libpythonX.Y` directly.

use std::{
    path::{Path, PathBuf},
    process::Command,
};

use anyhow::{anyhow, Context, Result};
use clickspeak_core::{LaunchError, RuntimeInstallation};
use serde::{Deserialize, Serialize};

use crate::process::run_checked;

pub const SYSCONFIG_PROBE: &str = r#"
import json, sys, sysconfig
v = sysconfig.get_config_vars()
print(json.dumps({
    "include_dir": sysconfig.get_path("include") or v.get("INCLUDEPY") or "",
    "framework_name": v.get("PYTHONFRAMEWORK") or "",
    "framework_prefix": v.get("PYTHONFRAMEWORKPREFIX") or "",
    "lib_dir": v.get("LIBDIR") or "",
    "ld_version": v.get("LDVERSION") or sysconfig.get_python_version(),
    "version": "%d.%d" % sys.version_info[:2],
    "pointer_width": 64 if sys.maxsize > 2**32 else 32,
}))
"#;

/// Raw build variables reported by the runtime interpreter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SysconfigProbe {
    pub include_dir: PathBuf,
    pub framework_name: String,
    pub framework_prefix: PathBuf,
    pub lib_dir: PathBuf,
    pub ld_version: String,
    pub version: String,
    pub pointer_width: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum LinkConfiguration {
    Framework {
        include_dir: PathBuf,
        framework_prefix: PathBuf,
        framework_name: String,
        rpath: PathBuf,
    },
    SharedLibrary {
        include_dir: PathBuf,
        lib_dir: PathBuf,
        lib_name: String,
        rpath: PathBuf,
    },
}

/// Library file names accepted for `lib_name` (`python3.12` -> `libpython3.12.dylib`, ...).
pub fn shared_library_names(lib_name: &str) -> [String; 2] {
    [format!("lib{lib_name}.dylib"), format!("lib{lib_name}.so")]
}

impl LinkConfiguration {
    pub fn from_probe(probe: &SysconfigProbe) -> Result<Self> {
        let header = probe.include_dir.join("Python.h");
        if probe.include_dir.as_os_str().is_empty() || !header.is_file() {
            return Err(LaunchError::HeadersMissing {
                include_dir: probe.include_dir.clone(),
                version: probe.version.clone(),
            }
            .into());
        }

        if !probe.framework_name.is_empty() {
            if probe.framework_prefix.as_os_str().is_empty() {
                return Err(anyhow!(
                    "E_LINK_CONFIG: framework build {:?} reports no PYTHONFRAMEWORKPREFIX",
                    probe.framework_name
                ));
            }
            return Ok(Self::Framework {
                include_dir: probe.include_dir.clone(),
                framework_prefix: probe.framework_prefix.clone(),
                framework_name: probe.framework_name.clone(),
                rpath: probe.framework_prefix.clone(),
            });
        }

        let lib_name = format!("python{}", probe.ld_version);
        let found = shared_library_names(&lib_name)
            .iter()
            .any(|n| probe.lib_dir.join(n).is_file());
        if !found {
            return Err(anyhow!(
                "E_LIBPYTHON_MISSING: no lib{lib_name}.dylib or lib{lib_name}.so in {} (was the runtime built with --enable-shared?)",
                probe.lib_dir.display()
            ));
        }
        Ok(Self::SharedLibrary {
            include_dir: probe.include_dir.clone(),
            lib_dir: probe.lib_dir.clone(),
            lib_name,
            rpath: probe.lib_dir.clone(),
        })
    }

    pub fn shape(&self) -> &'static str {
        match self {
            Self::Framework { .. } => "framework",
            Self::SharedLibrary { .. } => "shared_library",
        }
    }

    pub fn include_dir(&self) -> &Path {
        match self {
            Self::Framework { include_dir, .. } | Self::SharedLibrary { include_dir, .. } => {
                include_dir
            }
        }
    }

    pub fn rpath(&self) -> &Path {
        match self {
            Self::Framework { rpath, .. } | Self::SharedLibrary { rpath, .. } => rpath,
        }
    }

    /// Build-script directives that link the launcher for this shape.
    pub fn link_lines(&self) -> Vec<String> {
        let mut lines = match self {
            Self::Framework {
                framework_prefix,
                framework_name,
                ..
            } => vec![
                format!(
                    "cargo:rustc-link-search=framework={}",
                    framework_prefix.display()
                ),
                format!("cargo:rustc-link-lib=framework={framework_name}"),
            ],
            Self::SharedLibrary {
                lib_dir, lib_name, ..
            } => vec![
                format!("cargo:rustc-link-search=native={}", lib_dir.display()),
                format!("cargo:rustc-link-lib=dylib={lib_name}"),
            ],
        };
        lines.push(format!(
            "cargo:rustc-link-arg=-Wl,-rpath,{}",
            self.rpath().display()
        ));
        lines
    }
}

pub fn probe_sysconfig(python: &Path) -> Result<SysconfigProbe> {
    let out = run_checked(
        Command::new(python).arg("-c").arg(SYSCONFIG_PROBE),
        "sysconfig probe",
    )?;
    let stdout = String::from_utf8_lossy(&out.stdout);
    let line = stdout
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("");
    serde_json::from_str(line)
        .with_context(|| format!("parse sysconfig probe output failed: {line:?}"))
}

/// Probes `runtime` and classifies it.
pub fn discover(runtime: &RuntimeInstallation) -> Result<(SysconfigProbe, LinkConfiguration)> {
    let probe = probe_sysconfig(&runtime.interpreter())?;
    let link = LinkConfiguration::from_probe(&probe)?;
    Ok((probe, link))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn probe(root: &Path, framework: &str) -> SysconfigProbe {
        SysconfigProbe {
            include_dir: root.join("include").join("python3.12"),
            framework_name: framework.to_string(),
            framework_prefix: if framework.is_empty() {
                PathBuf::new()
            } else {
                root.join("Frameworks")
            },
            lib_dir: root.join("lib"),
            ld_version: "3.12".to_string(),
            version: "3.12".to_string(),
            pointer_width: 64,
        }
    }

    fn with_headers(p: &SysconfigProbe) {
        fs::create_dir_all(&p.include_dir).expect("mkdir");
        fs::write(p.include_dir.join("Python.h"), "").expect("write");
    }

    #[test]
    fn framework_build_links_framework() {
        let td = tempfile::tempdir().expect("tempdir");
        let p = probe(td.path(), "Python");
        with_headers(&p);
        let link = LinkConfiguration::from_probe(&p).expect("link");
        assert_eq!(link.shape(), "framework");
        assert_eq!(link.rpath(), td.path().join("Frameworks"));
        let lines = link.link_lines();
        assert!(lines.contains(&"cargo:rustc-link-lib=framework=Python".to_string()));
        let rpath_line = format!(
            "cargo:rustc-link-arg=-Wl,-rpath,{}",
            td.path().join("Frameworks").display()
        );
        assert_eq!(lines.last(), Some(&rpath_line));
    }

    #[test]
    fn shared_build_requires_library_file() {
        let td = tempfile::tempdir().expect("tempdir");
        let p = probe(td.path(), "");
        with_headers(&p);
        let err = LinkConfiguration::from_probe(&p).unwrap_err();
        assert!(err.to_string().starts_with("E_LIBPYTHON_MISSING"), "{err}");

        fs::create_dir_all(&p.lib_dir).expect("mkdir");
        fs::write(p.lib_dir.join("libpython3.12.so"), "").expect("write");
        let link = LinkConfiguration::from_probe(&p).expect("link");
        match &link {
            LinkConfiguration::SharedLibrary { lib_name, rpath, .. } => {
                assert_eq!(lib_name, "python3.12");
                assert_eq!(rpath, &p.lib_dir);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(link
            .link_lines()
            .contains(&"cargo:rustc-link-lib=dylib=python3.12".to_string()));
    }

    #[test]
    fn missing_header_is_headers_missing() {
        let td = tempfile::tempdir().expect("tempdir");
        let p = probe(td.path(), "Python");
        let err = LinkConfiguration::from_probe(&p).unwrap_err();
        let launch = err.downcast_ref::<LaunchError>().expect("typed");
        assert_eq!(launch.code(), "E_HEADERS_MISSING");
        assert!(err.to_string().contains("clickspeak-tools provision"));
    }

    #[test]
    fn link_configuration_serializes_with_shape_tag() {
        let link = LinkConfiguration::SharedLibrary {
            include_dir: PathBuf::from("/i"),
            lib_dir: PathBuf::from("/l"),
            lib_name: "python3.12".to_string(),
            rpath: PathBuf::from("/l"),
        };
        let v = serde_json::to_value(&link).expect("json");
        assert_eq!(v["shape"], "shared_library");
        assert_eq!(v["lib_name"], "python3.12");
    }

    #[cfg(unix)]
    #[test]
    fn probe_output_is_parsed_from_last_line() {
        use std::os::unix::fs::PermissionsExt;
        let td = tempfile::tempdir().expect("tempdir");
        let py = td.path().join("python3");
        fs::write(
            &py,
            r#"#!/bin/sh
echo "some warning"
echo '{"include_dir":"/inc","framework_name":"","framework_prefix":"","lib_dir":"/lib","ld_version":"3.12","version":"3.12","pointer_width":64}'
"#,
        )
        .expect("write");
        fs::set_permissions(&py, fs::Permissions::from_mode(0o755)).expect("chmod");
        let p = probe_sysconfig(&py).expect("probe");
        assert_eq!(p.include_dir, PathBuf::from("/inc"));
        assert_eq!(p.framework_name, "");
        assert_eq!(p.pointer_width, 64);
    }
}
