//! Assembles `ClickSpeak.app`.
//!
//! The bundle is rebuilt wholesale every time. A fresh tree gets the metadata,
//! the launcher compiled into `Contents/MacOS`, and a signature; then stale
//! copies under old names are removed and the fresh tree replaces the
//! canonical bundle.

use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
};

use anyhow::{anyhow, Context, Result};
use clickspeak_core::{
    paths,
    settings::{save_settings, LaunchMode, LaunchSettings},
    AppIdentity, RuntimeInstallation,
};
use clickspeak_observability::Tracer;
use plist::{Dictionary, Value};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::{
    compile::{compile_launcher, link_runtime, LauncherBuilder, LinkedRuntime},
    process::{run_inherited, traced},
    sign::BundleSigner,
    staging,
};

pub const PKG_INFO: &str = "APPL????";
pub const ICON_FILE: &str = "ClickSpeak.icns";
pub const RECEIPT_FILE: &str = "build.json";
pub const BUNDLED_SOURCE_DIR: &str = "app";
pub const SMOKE_TEST_ARG: &str = "--check-permissions";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BundleMode {
    /// Runs from the project checkout when one is found.
    Dev,
    /// Ships a copy of the application source.
    Release,
}

impl BundleMode {
    pub fn launch_settings(self, identity: &AppIdentity) -> LaunchSettings {
        let (mode, bundled_source) = match self {
            Self::Dev => (LaunchMode::Development, None),
            Self::Release => (LaunchMode::Release, Some(BUNDLED_SOURCE_DIR.to_string())),
        };
        LaunchSettings {
            mode,
            entry_module: identity.entry_module.to_string(),
            entry_function: identity.entry_function.to_string(),
            bundled_source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleLayout {
    root: PathBuf,
    executable_name: String,
}

impl BundleLayout {
    pub fn new(root: impl Into<PathBuf>, identity: &AppIdentity) -> Self {
        Self {
            root: root.into(),
            executable_name: identity.name.to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn contents(&self) -> PathBuf {
        self.root.join("Contents")
    }

    pub fn macos_dir(&self) -> PathBuf {
        self.contents().join("MacOS")
    }

    pub fn executable(&self) -> PathBuf {
        self.macos_dir().join(&self.executable_name)
    }

    pub fn resources_dir(&self) -> PathBuf {
        self.contents().join("Resources")
    }

    pub fn info_plist(&self) -> PathBuf {
        self.contents().join("Info.plist")
    }

    pub fn pkg_info(&self) -> PathBuf {
        self.contents().join("PkgInfo")
    }

    pub fn receipt(&self) -> PathBuf {
        self.resources_dir().join(RECEIPT_FILE)
    }
}

pub fn canonical_bundle(apps_dir: &Path, identity: &AppIdentity) -> PathBuf {
    apps_dir.join(identity.bundle_dir_name())
}

/// Earlier install locations that would otherwise hold a second identity.
pub fn legacy_bundles(apps_dir: &Path, home: Option<&Path>, identity: &AppIdentity) -> Vec<PathBuf> {
    let mut out = vec![apps_dir.join(format!("{} Dev.app", identity.name))];
    if let Some(h) = home {
        out.push(h.join("Applications").join(identity.bundle_dir_name()));
    }
    out
}

fn same_location(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Removes each existing `legacy` bundle other than `canonical`.
pub fn remove_legacy_bundles(canonical: &Path, legacy: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    for old in legacy {
        if same_location(old, canonical) || !old.exists() {
            continue;
        }
        fs::remove_dir_all(old)
            .with_context(|| format!("remove legacy bundle {} failed", old.display()))?;
        removed.push(old.clone());
    }
    Ok(removed)
}

pub fn info_plist(identity: &AppIdentity, icon: Option<&str>) -> Dictionary {
    let s = |v: &str| Value::String(v.to_string());
    let mut d = Dictionary::new();
    d.insert("CFBundleIdentifier".into(), s(identity.bundle_identifier));
    d.insert("CFBundleName".into(), s(identity.name));
    d.insert("CFBundleDisplayName".into(), s(identity.display_name));
    d.insert("CFBundleExecutable".into(), s(identity.name));
    d.insert("CFBundlePackageType".into(), s("APPL"));
    d.insert("CFBundleVersion".into(), s(identity.version));
    d.insert("CFBundleShortVersionString".into(), s(identity.version));
    d.insert("CFBundleInfoDictionaryVersion".into(), s("6.0"));
    if let Some(icon) = icon {
        d.insert("CFBundleIconFile".into(), s(icon));
    }
    d.insert("LSUIElement".into(), Value::Boolean(identity.background_only));
    d.insert("LSApplicationCategoryType".into(), s(identity.category));
    d.insert("NSHighResolutionCapable".into(), Value::Boolean(true));
    for u in identity.usage_descriptions {
        d.insert(u.key.into(), s(u.text));
    }
    d
}

pub fn write_info_plist(path: &Path, dict: Dictionary) -> Result<()> {
    Value::Dictionary(dict)
        .to_file_xml(path)
        .with_context(|| format!("write {} failed", path.display()))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildReceipt {
    pub mode: BundleMode,
    pub built_at: String,
    pub app_version: String,
    pub launcher_sha256: String,
    pub link_shape: String,
    pub runtime_version: String,
}

pub fn read_receipt(layout: &BundleLayout) -> Result<BuildReceipt> {
    let p = layout.receipt();
    let s = fs::read_to_string(&p).with_context(|| format!("read {} failed", p.display()))?;
    serde_json::from_str(&s).with_context(|| format!("parse {} failed", p.display()))
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let bytes = fs::read(path).with_context(|| format!("read {} failed", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

/// Recursive copy that drops bytecode caches.
pub fn copy_source_tree(src: &Path, dst: &Path) -> Result<usize> {
    fs::create_dir_all(dst).with_context(|| format!("create {} failed", dst.display()))?;
    let mut copied = 0;
    let entries = fs::read_dir(src).with_context(|| format!("read {} failed", src.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("read {} failed", src.display()))?;
        let name = entry.file_name();
        if name == "__pycache__" {
            continue;
        }
        let from = entry.path();
        let to = dst.join(&name);
        let ft = entry.file_type()?;
        if ft.is_dir() {
            copied += copy_source_tree(&from, &to)?;
        } else if ft.is_file() {
            if from.extension().is_some_and(|e| e == "pyc") {
                continue;
            }
            fs::copy(&from, &to)
                .with_context(|| format!("copy {} -> {} failed", from.display(), to.display()))?;
            copied += 1;
        }
    }
    Ok(copied)
}

#[derive(Debug, Clone)]
pub struct BundleRequest<'a> {
    pub bundle: PathBuf,
    pub legacy: Vec<PathBuf>,
    pub mode: BundleMode,
    pub project: Option<PathBuf>,
    pub runtime: &'a RuntimeInstallation,
    pub identity: &'a AppIdentity,
}

#[derive(Debug, Clone)]
pub struct BundleReport {
    pub layout: BundleLayout,
    pub removed_legacy: Vec<PathBuf>,
    pub receipt: BuildReceipt,
}

/// Application source a release bundle ships; `None` for dev bundles.
fn release_source(req: &BundleRequest<'_>) -> Result<Option<PathBuf>> {
    if req.mode != BundleMode::Release {
        return Ok(None);
    }
    let project = req.project.as_deref().ok_or_else(|| {
        anyhow!("E_PROJECT_NOT_FOUND: release bundles need the project checkout to copy source from")
    })?;
    let src = paths::project_source_dir(project).join(req.identity.package);
    if !src.is_dir() {
        return Err(anyhow!(
            "E_PROJECT_NOT_FOUND: application source missing at {}",
            src.display()
        ));
    }
    Ok(Some(src))
}

fn write_metadata(
    req: &BundleRequest<'_>,
    layout: &BundleLayout,
    release_src: Option<&Path>,
) -> Result<()> {
    let contents = layout.contents();
    let resources = layout.resources_dir();
    fs::create_dir_all(layout.macos_dir())
        .with_context(|| format!("create {} failed", layout.macos_dir().display()))?;
    fs::create_dir_all(&resources)
        .with_context(|| format!("create {} failed", resources.display()))?;

    let icon_src = req.project.as_deref().map(|p| p.join(ICON_FILE));
    let icon = match icon_src {
        Some(src) if src.is_file() => {
            let dst = resources.join(ICON_FILE);
            fs::copy(&src, &dst)
                .with_context(|| format!("copy {} -> {} failed", src.display(), dst.display()))?;
            Some(ICON_FILE)
        }
        _ => None,
    };
    write_info_plist(&layout.info_plist(), info_plist(req.identity, icon))?;
    fs::write(layout.pkg_info(), PKG_INFO)
        .with_context(|| format!("write PkgInfo in {} failed", contents.display()))?;
    save_settings(&resources, &req.mode.launch_settings(req.identity))?;

    if let Some(src) = release_src {
        let dst = resources.join(BUNDLED_SOURCE_DIR).join(req.identity.package);
        copy_source_tree(src, &dst)?;
    }
    Ok(())
}

/// Fills `layout` (a staging tree), compiles the launcher into it and signs it.
fn assemble(
    req: &BundleRequest<'_>,
    layout: &BundleLayout,
    release_src: Option<&Path>,
    linked: LinkedRuntime,
    builder: &dyn LauncherBuilder,
    signer: &dyn BundleSigner,
    tracer: &Tracer,
) -> Result<BuildReceipt> {
    traced(
        tracer,
        "bundle.metadata",
        "E_BUNDLE_IO",
        Some(json!({ "bundle": layout.root(), "mode": req.mode })),
        || write_metadata(req, layout, release_src),
    )?;

    let compiled = compile_launcher(&layout.executable(), req.runtime, linked, builder, tracer)?;

    let receipt = BuildReceipt {
        mode: req.mode,
        built_at: chrono::Utc::now().to_rfc3339(),
        app_version: req.identity.version.to_string(),
        launcher_sha256: sha256_file(&compiled.path)?,
        link_shape: compiled.link.shape().to_string(),
        runtime_version: compiled.probe.version.clone(),
    };
    let receipt_json =
        serde_json::to_string_pretty(&receipt).context("serialize build receipt failed")?;
    fs::write(layout.receipt(), receipt_json)
        .with_context(|| format!("write {} failed", layout.receipt().display()))?;

    traced(tracer, "bundle.sign", "E_CODESIGN", None, || {
        signer.sign(layout.root())
    })?;
    Ok(receipt)
}

/// Rebuilds the bundle at `req.bundle` from scratch and signs it.
///
/// Everything that can reject the request runs before the installed bundle is
/// touched. The new bundle is assembled and signed beside the old one and
/// renamed over it last, so a failure leaves the installed app as it was.
pub fn write_bundle(
    req: &BundleRequest<'_>,
    builder: &dyn LauncherBuilder,
    signer: &dyn BundleSigner,
    tracer: &Tracer,
) -> Result<BundleReport> {
    req.runtime.ensure_ready()?;
    let release_src = release_source(req)?;
    let linked = link_runtime(req.runtime, tracer)?;

    staging::sweep_stale(&req.bundle)?;
    let staging_root = staging::staging_dir(&req.bundle)?;
    let staged = BundleLayout::new(&staging_root, req.identity);
    let receipt = match assemble(
        req,
        &staged,
        release_src.as_deref(),
        linked,
        builder,
        signer,
        tracer,
    ) {
        Ok(r) => r,
        Err(e) => {
            let _ = fs::remove_dir_all(&staging_root);
            return Err(e);
        }
    };

    let removed_legacy = traced(tracer, "bundle.remove_legacy", "E_BUNDLE_IO", None, || {
        remove_legacy_bundles(&req.bundle, &req.legacy)
    });
    let swapped = removed_legacy.and_then(|removed| {
        traced(
            tracer,
            "bundle.swap",
            "E_BUNDLE_SWAP",
            Some(json!({ "bundle": req.bundle })),
            || staging::swap_into_place(&staging_root, &req.bundle, "E_BUNDLE_SWAP"),
        )
        .map(|()| removed)
    });
    let removed_legacy = match swapped {
        Ok(removed) => removed,
        Err(e) => {
            let _ = fs::remove_dir_all(&staging_root);
            return Err(e);
        }
    };

    Ok(BundleReport {
        layout: BundleLayout::new(&req.bundle, req.identity),
        removed_legacy,
        receipt,
    })
}

/// Runs the installed launcher once with [`SMOKE_TEST_ARG`].
pub fn smoke_test(layout: &BundleLayout) -> Result<()> {
    run_inherited(
        Command::new(layout.executable()).arg(SMOKE_TEST_ARG),
        "launcher smoke test",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use clickspeak_core::identity::CLICKSPEAK;

    #[test]
    fn layout_paths() {
        let l = BundleLayout::new("/Applications/ClickSpeak.app", &CLICKSPEAK);
        assert_eq!(
            l.executable(),
            PathBuf::from("/Applications/ClickSpeak.app/Contents/MacOS/ClickSpeak")
        );
        assert_eq!(
            l.receipt(),
            PathBuf::from("/Applications/ClickSpeak.app/Contents/Resources/build.json")
        );
    }

    #[test]
    fn legacy_list_excludes_nothing_but_names_old_locations() {
        let got = legacy_bundles(Path::new("/Applications"), Some(Path::new("/Users/u")), &CLICKSPEAK);
        assert_eq!(
            got,
            vec![
                PathBuf::from("/Applications/ClickSpeak Dev.app"),
                PathBuf::from("/Users/u/Applications/ClickSpeak.app"),
            ]
        );
    }

    #[test]
    fn legacy_removal_never_touches_canonical() {
        let td = tempfile::tempdir().expect("tempdir");
        let canonical = td.path().join("ClickSpeak.app");
        let dev = td.path().join("ClickSpeak Dev.app");
        fs::create_dir_all(&canonical).expect("mkdir");
        fs::create_dir_all(&dev).expect("mkdir");
        let removed =
            remove_legacy_bundles(&canonical, &[dev.clone(), canonical.clone()]).expect("remove");
        assert_eq!(removed, vec![dev.clone()]);
        assert!(canonical.exists());
        assert!(!dev.exists());
    }

    #[test]
    fn plist_carries_identity_and_usage_strings() {
        let td = tempfile::tempdir().expect("tempdir");
        let p = td.path().join("Info.plist");
        write_info_plist(&p, info_plist(&CLICKSPEAK, Some(ICON_FILE))).expect("write");
        let v = Value::from_file(&p).expect("read");
        let d = v.as_dictionary().expect("dict");
        let get = |k: &str| d.get(k).and_then(Value::as_string).map(str::to_string);
        assert_eq!(get("CFBundleIdentifier").as_deref(), Some("com.lamosty.clickspeak"));
        assert_eq!(get("CFBundleExecutable").as_deref(), Some("ClickSpeak"));
        assert_eq!(get("CFBundleIconFile").as_deref(), Some("ClickSpeak.icns"));
        assert_eq!(
            get("LSApplicationCategoryType").as_deref(),
            Some("public.app-category.productivity")
        );
        assert!(get("NSMicrophoneUsageDescription").is_some());
        assert!(get("NSInputMonitoringUsageDescription").is_some());
        assert_eq!(d.get("LSUIElement").and_then(Value::as_boolean), Some(true));
    }

    #[test]
    fn plist_omits_icon_when_absent() {
        let d = info_plist(&CLICKSPEAK, None);
        assert!(d.get("CFBundleIconFile").is_none());
    }

    #[test]
    fn source_copy_skips_bytecode() {
        let td = tempfile::tempdir().expect("tempdir");
        let src = td.path().join("src");
        fs::create_dir_all(src.join("__pycache__")).expect("mkdir");
        fs::create_dir_all(src.join("sub")).expect("mkdir");
        fs::write(src.join("__init__.py"), "").expect("write");
        fs::write(src.join("sub").join("a.py"), "x = 1\n").expect("write");
        fs::write(src.join("stale.pyc"), "").expect("write");
        fs::write(src.join("__pycache__").join("x.pyc"), "").expect("write");

        let dst = td.path().join("dst");
        assert_eq!(copy_source_tree(&src, &dst).expect("copy"), 2);
        assert!(dst.join("sub").join("a.py").is_file());
        assert!(!dst.join("__pycache__").exists());
        assert!(!dst.join("stale.pyc").exists());
    }

    #[test]
    fn release_settings_point_at_bundled_source() {
        let s = BundleMode::Release.launch_settings(&CLICKSPEAK);
        assert_eq!(s.mode, LaunchMode::Release);
        assert_eq!(s.bundled_source.as_deref(), Some("app"));
        assert!(BundleMode::Dev.launch_settings(&CLICKSPEAK).probes_project());
    }

    #[test]
    fn sha256_matches_known_digest() {
        let td = tempfile::tempdir().expect("tempdir");
        let p = td.path().join("f");
        fs::write(&p, "abc").expect("write");
        assert_eq!(
            sha256_file(&p).expect("hash"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[cfg(unix)]
    mod assembly {
        use super::*;
        use crate::compile::BuildRequest;
        use std::{cell::RefCell, os::unix::fs::PermissionsExt};

        struct FakeBuilder {
            product: PathBuf,
            shapes: RefCell<Vec<&'static str>>,
        }

        impl LauncherBuilder for FakeBuilder {
            fn build(&self, req: &BuildRequest<'_>) -> Result<PathBuf> {
                self.shapes.borrow_mut().push(req.link.shape());
                fs::write(&self.product, "#!/bin/sh\nexit 0\n")?;
                fs::set_permissions(&self.product, fs::Permissions::from_mode(0o755))?;
                Ok(self.product.clone())
            }
        }

        #[derive(Default)]
        struct FakeSigner {
            signed: RefCell<Vec<PathBuf>>,
        }

        impl BundleSigner for FakeSigner {
            fn sign(&self, bundle: &Path) -> Result<()> {
                assert!(bundle.join("Contents").join("Resources").join(RECEIPT_FILE).is_file());
                self.signed.borrow_mut().push(bundle.to_path_buf());
                Ok(())
            }
        }

        /// Runtime whose interpreter answers `--version` and the sysconfig probe.
        fn probed_runtime(root: &Path, headers: &Path) -> RuntimeInstallation {
            let rt = RuntimeInstallation::at(root.join("runtime"));
            fs::create_dir_all(rt.bin_dir()).expect("mkdir");
            fs::create_dir_all(headers).expect("mkdir");
            fs::write(headers.join("Python.h"), "").expect("write");
            let probe = format!(
                r#"{{"include_dir":"{}","framework_name":"Python","framework_prefix":"/Library/Frameworks","lib_dir":"","ld_version":"3.12","version":"3.12","pointer_width":64}}"#,
                headers.display()
            );
            fs::write(
                rt.interpreter(),
                format!(
                    "#!/bin/sh\nif [ \"$1\" = \"--version\" ]; then echo 'Python 3.12.4'; exit 0; fi\necho '{probe}'\n"
                ),
            )
            .expect("write");
            fs::set_permissions(rt.interpreter(), fs::Permissions::from_mode(0o755))
                .expect("chmod");
            rt.write_marker().expect("marker");
            rt
        }

        fn project(root: &Path) -> PathBuf {
            let p = root.join("clickspeak");
            fs::create_dir_all(p.join("src").join("clickspeak")).expect("mkdir");
            fs::write(p.join("pyproject.toml"), "").expect("write");
            fs::write(p.join("src").join("clickspeak").join("__main__.py"), "def main(): pass\n")
                .expect("write");
            fs::write(p.join(ICON_FILE), "icns").expect("write");
            p
        }

        #[test]
        fn release_bundle_is_complete_and_signed() {
            let td = tempfile::tempdir().expect("tempdir");
            let rt = probed_runtime(td.path(), &td.path().join("include"));
            let apps = td.path().join("Applications");
            let dev = apps.join("ClickSpeak Dev.app");
            fs::create_dir_all(&dev).expect("mkdir");
            let bundle = canonical_bundle(&apps, &CLICKSPEAK);
            fs::create_dir_all(bundle.join("stale")).expect("mkdir");

            let builder = FakeBuilder {
                product: td.path().join("built-launcher"),
                shapes: RefCell::new(Vec::new()),
            };
            let signer = FakeSigner::default();
            let req = BundleRequest {
                bundle: bundle.clone(),
                legacy: legacy_bundles(&apps, None, &CLICKSPEAK),
                mode: BundleMode::Release,
                project: Some(project(td.path())),
                runtime: &rt,
                identity: &CLICKSPEAK,
            };
            let report =
                write_bundle(&req, &builder, &signer, &Tracer::disabled("test")).expect("bundle");

            assert_eq!(report.removed_legacy, vec![dev.clone()]);
            assert!(!dev.exists());
            assert!(!bundle.join("stale").exists());
            let layout = &report.layout;
            assert_eq!(fs::read_to_string(layout.pkg_info()).expect("read"), "APPL????");
            assert!(layout.info_plist().is_file());
            assert!(layout.resources_dir().join(ICON_FILE).is_file());
            assert!(layout
                .resources_dir()
                .join("app")
                .join("clickspeak")
                .join("__main__.py")
                .is_file());
            assert!(layout.executable().is_file());
            assert_eq!(*builder.shapes.borrow(), vec!["framework"]);
            assert_eq!(
                *signer.signed.borrow(),
                vec![staging::staging_dir(&bundle).expect("staging")]
            );
            assert!(!staging::staging_dir(&bundle).expect("staging").exists());

            let receipt = read_receipt(layout).expect("receipt");
            assert_eq!(receipt, report.receipt);
            assert_eq!(receipt.mode, BundleMode::Release);
            assert_eq!(receipt.link_shape, "framework");
            assert_eq!(receipt.launcher_sha256, sha256_file(&layout.executable()).expect("hash"));

            let settings =
                clickspeak_core::settings::load_settings(&layout.resources_dir()).expect("load");
            assert_eq!(settings.mode, LaunchMode::Release);
            smoke_test(layout).expect("smoke");
        }

        struct FailingBuilder;

        impl LauncherBuilder for FailingBuilder {
            fn build(&self, _req: &BuildRequest<'_>) -> Result<PathBuf> {
                Err(anyhow!("E_COMMAND_FAILED: cargo build (launcher) exited with 101"))
            }
        }

        /// An installed bundle whose launcher prints `old`.
        fn installed_bundle(apps: &Path) -> PathBuf {
            let bundle = canonical_bundle(apps, &CLICKSPEAK);
            let layout = BundleLayout::new(&bundle, &CLICKSPEAK);
            fs::create_dir_all(layout.macos_dir()).expect("mkdir");
            fs::write(layout.executable(), "old").expect("write");
            bundle
        }

        fn installed_launcher(bundle: &Path) -> String {
            fs::read_to_string(BundleLayout::new(bundle, &CLICKSPEAK).executable())
                .expect("installed launcher")
        }

        #[test]
        fn release_without_checkout_keeps_installed_app() {
            let td = tempfile::tempdir().expect("tempdir");
            let rt = probed_runtime(td.path(), &td.path().join("include"));
            let apps = td.path().join("Applications");
            let bundle = installed_bundle(&apps);
            let builder = FakeBuilder {
                product: td.path().join("p"),
                shapes: RefCell::new(Vec::new()),
            };
            let req = BundleRequest {
                bundle: bundle.clone(),
                legacy: legacy_bundles(&apps, None, &CLICKSPEAK),
                mode: BundleMode::Release,
                project: None,
                runtime: &rt,
                identity: &CLICKSPEAK,
            };
            let err = write_bundle(&req, &builder, &FakeSigner::default(), &Tracer::disabled("t"))
                .unwrap_err();
            assert!(err.to_string().starts_with("E_PROJECT_NOT_FOUND"), "{err}");
            assert_eq!(installed_launcher(&bundle), "old");
            assert!(builder.shapes.borrow().is_empty());
        }

        #[test]
        fn failed_compile_keeps_installed_app_and_legacy_copies() {
            let td = tempfile::tempdir().expect("tempdir");
            let rt = probed_runtime(td.path(), &td.path().join("include"));
            let apps = td.path().join("Applications");
            let bundle = installed_bundle(&apps);
            let dev = apps.join("ClickSpeak Dev.app");
            fs::create_dir_all(&dev).expect("mkdir");
            let signer = FakeSigner::default();
            let req = BundleRequest {
                bundle: bundle.clone(),
                legacy: legacy_bundles(&apps, None, &CLICKSPEAK),
                mode: BundleMode::Dev,
                project: Some(project(td.path())),
                runtime: &rt,
                identity: &CLICKSPEAK,
            };
            let err = write_bundle(&req, &FailingBuilder, &signer, &Tracer::disabled("t"))
                .unwrap_err();
            assert!(err.to_string().starts_with("E_COMMAND_FAILED"), "{err}");
            assert_eq!(installed_launcher(&bundle), "old");
            assert!(dev.exists());
            assert!(signer.signed.borrow().is_empty());
            assert!(!staging::staging_dir(&bundle).expect("staging").exists());
        }

        #[test]
        fn leftover_staging_tree_is_swept() {
            let td = tempfile::tempdir().expect("tempdir");
            let rt = probed_runtime(td.path(), &td.path().join("include"));
            let apps = td.path().join("Applications");
            let bundle = canonical_bundle(&apps, &CLICKSPEAK);
            let crashed = apps.join("ClickSpeak.app.staging-999999");
            fs::create_dir_all(crashed.join("Contents")).expect("mkdir");
            let builder = FakeBuilder {
                product: td.path().join("built-launcher"),
                shapes: RefCell::new(Vec::new()),
            };
            let req = BundleRequest {
                bundle: bundle.clone(),
                legacy: Vec::new(),
                mode: BundleMode::Dev,
                project: None,
                runtime: &rt,
                identity: &CLICKSPEAK,
            };
            write_bundle(&req, &builder, &FakeSigner::default(), &Tracer::disabled("t"))
                .expect("bundle");
            assert!(!crashed.exists());
            assert!(BundleLayout::new(&bundle, &CLICKSPEAK).executable().is_file());
        }

        #[test]
        fn unready_runtime_leaves_existing_bundle_alone() {
            let td = tempfile::tempdir().expect("tempdir");
            let rt = RuntimeInstallation::at(td.path().join("missing"));
            let bundle = td.path().join("ClickSpeak.app");
            fs::create_dir_all(&bundle).expect("mkdir");
            let builder = FakeBuilder {
                product: td.path().join("p"),
                shapes: RefCell::new(Vec::new()),
            };
            let req = BundleRequest {
                bundle: bundle.clone(),
                legacy: Vec::new(),
                mode: BundleMode::Dev,
                project: None,
                runtime: &rt,
                identity: &CLICKSPEAK,
            };
            let err = write_bundle(&req, &builder, &FakeSigner::default(), &Tracer::disabled("t"))
                .unwrap_err();
            assert!(err.to_string().starts_with("E_RUNTIME_NOT_PROVISIONED"), "{err}");
            assert!(bundle.exists());
        }

        #[test]
        fn missing_headers_fail_before_installed_app_is_touched() {
            let td = tempfile::tempdir().expect("tempdir");
            let headers = td.path().join("include");
            let rt = probed_runtime(td.path(), &headers);
            fs::remove_file(headers.join("Python.h")).expect("rm");
            let bundle = installed_bundle(td.path());
            let builder = FakeBuilder {
                product: td.path().join("p"),
                shapes: RefCell::new(Vec::new()),
            };
            let req = BundleRequest {
                bundle: bundle.clone(),
                legacy: Vec::new(),
                mode: BundleMode::Dev,
                project: None,
                runtime: &rt,
                identity: &CLICKSPEAK,
            };
            let err = write_bundle(&req, &builder, &FakeSigner::default(), &Tracer::disabled("t"))
                .unwrap_err();
            assert!(err.to_string().starts_with("E_HEADERS_MISSING"), "{err}");
            assert!(builder.shapes.borrow().is_empty());
            assert_eq!(installed_launcher(&bundle), "old");
        }
    }
}
