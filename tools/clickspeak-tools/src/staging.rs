//! Build-beside-then-rename for trees that must never be seen half written.
//!
//! A replacement for `<root>` is assembled in `<root>.staging-<pid>` and moved
//! over `<root>` in one rename; the previous tree goes to
//! `<root>.retired-<pid>` first and is deleted afterwards.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context, Result};
use clickspeak_observability::safe_eprintln;

const STAGING_TAG: &str = "staging";
const RETIRED_TAG: &str = "retired";

fn prefix(root: &Path, tag: &str) -> Result<String> {
    let name = root
        .file_name()
        .ok_or_else(|| anyhow!("E_TREE_PATH: path has no final component: {}", root.display()))?;
    Ok(format!("{}.{tag}-", name.to_string_lossy()))
}

fn sibling(root: &Path, tag: &str) -> Result<PathBuf> {
    let p = prefix(root, tag)?;
    Ok(root.with_file_name(format!("{p}{}", std::process::id())))
}

pub fn staging_dir(root: &Path) -> Result<PathBuf> {
    sibling(root, STAGING_TAG)
}

pub fn retired_dir(root: &Path) -> Result<PathBuf> {
    sibling(root, RETIRED_TAG)
}

/// Deletes staging and retired siblings of `root` left by any process,
/// including ones that crashed. Callers must exclude concurrent writers.
pub fn sweep_stale(root: &Path) -> Result<Vec<PathBuf>> {
    let Some(parent) = root.parent() else {
        return Ok(Vec::new());
    };
    let prefixes = [prefix(root, STAGING_TAG)?, prefix(root, RETIRED_TAG)?];
    let entries = match fs::read_dir(parent) {
        Ok(e) => e,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("read {} failed", parent.display())),
    };
    let mut removed = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("read {} failed", parent.display()))?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !prefixes.iter().any(|p| name.starts_with(p.as_str())) {
            continue;
        }
        let p = entry.path();
        let res = if entry.file_type()?.is_dir() {
            fs::remove_dir_all(&p)
        } else {
            fs::remove_file(&p)
        };
        res.with_context(|| format!("remove stale {} failed", p.display()))?;
        removed.push(p);
    }
    removed.sort();
    Ok(removed)
}

/// Moves `staging` to `root`, retiring whatever was there.
///
/// On failure the previous tree is put back; if that also fails the error
/// says where the previous tree was left.
pub fn swap_into_place(staging: &Path, root: &Path, code: &str) -> Result<()> {
    swap_with(staging, root, code, |from, to| fs::rename(from, to))
}

fn swap_with<F>(staging: &Path, root: &Path, code: &str, rename: F) -> Result<()>
where
    F: Fn(&Path, &Path) -> io::Result<()>,
{
    let retired = retired_dir(root)?;
    let had_old = fs::symlink_metadata(root).is_ok();
    if had_old {
        if fs::symlink_metadata(&retired).is_ok() {
            fs::remove_dir_all(&retired)
                .with_context(|| format!("remove {} failed", retired.display()))?;
        }
        rename(root, &retired).map_err(|e| {
            anyhow!(
                "{code}: retire {} -> {} failed: {e}",
                root.display(),
                retired.display()
            )
        })?;
    }
    if let Err(e) = rename(staging, root) {
        let mut msg = format!(
            "{code}: move {} -> {} failed: {e}",
            staging.display(),
            root.display()
        );
        if had_old {
            match rename(&retired, root) {
                Ok(()) => msg.push_str("; previous tree restored"),
                Err(re) => msg.push_str(&format!(
                    "; restoring previous tree also failed ({re}); it is at {}",
                    retired.display()
                )),
            }
        }
        return Err(anyhow!(msg));
    }
    if had_old {
        if let Err(e) = fs::remove_dir_all(&retired) {
            safe_eprintln!("warning: could not remove retired {}: {e}", retired.display());
        }
    }
    Ok(())
}
