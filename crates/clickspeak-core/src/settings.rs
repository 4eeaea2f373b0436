use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::identity::CLICKSPEAK;

pub const SETTINGS_FILE: &str = "launcher.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LaunchMode {
    /// Defers to a live project checkout when one is found.
    #[default]
    Development,
    /// Runs the application source copied into the bundle.
    Release,
}

/// Per-bundle launch settings, written by the bundler into `Contents/Resources`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchSettings {
    pub mode: LaunchMode,
    pub entry_module: String,
    pub entry_function: String,
    /// Directory under `Resources` holding bundled application source.
    pub bundled_source: Option<String>,
}

impl Default for LaunchSettings {
    fn default() -> Self {
        Self {
            mode: LaunchMode::Development,
            entry_module: CLICKSPEAK.entry_module.to_string(),
            entry_function: CLICKSPEAK.entry_function.to_string(),
            bundled_source: None,
        }
    }
}

impl LaunchSettings {
    pub fn probes_project(&self) -> bool {
        self.mode == LaunchMode::Development
    }
}

/// `<bundle>/Contents/Resources` for an executable at `<bundle>/Contents/MacOS/<name>`.
pub fn resources_dir_for(executable: &Path) -> Option<PathBuf> {
    let contents = executable.parent()?.parent()?;
    Some(contents.join("Resources"))
}

pub fn settings_path(resources_dir: &Path) -> PathBuf {
    resources_dir.join(SETTINGS_FILE)
}

pub fn load_settings(resources_dir: &Path) -> Result<LaunchSettings> {
    let p = settings_path(resources_dir);
    if !p.exists() {
        return Ok(LaunchSettings::default());
    }
    let s = fs::read_to_string(&p)
        .with_context(|| format!("read {} failed", p.display()))?;
    let v: LaunchSettings = serde_json::from_str(&s)
        .with_context(|| format!("parse {} failed", p.display()))?;
    Ok(v)
}

pub fn save_settings(resources_dir: &Path, settings: &LaunchSettings) -> Result<()> {
    fs::create_dir_all(resources_dir)
        .with_context(|| format!("create {} failed", resources_dir.display()))?;
    let p = settings_path(resources_dir);
    let s = serde_json::to_string_pretty(settings).context("serialize launch settings failed")?;
    fs::write(&p, s).with_context(|| format!("write {} failed", p.display()))?;
    Ok(())
}
