use std::{
    path::{Path, PathBuf},
    process::Command,
};

use anyhow::Result;

use crate::process::run_checked;

/// Ad-hoc signature: no certificate, but a stable code identity for TCC.
pub const ADHOC_IDENTITY: &str = "-";

pub trait BundleSigner {
    fn sign(&self, bundle: &Path) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct Codesign {
    program: PathBuf,
    identity: String,
}

impl Codesign {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            program: PathBuf::from("codesign"),
            identity: identity.into(),
        }
    }

    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn command(&self, bundle: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(["--force", "--deep", "--sign"])
            .arg(&self.identity)
            .arg(bundle);
        cmd
    }
}

impl Default for Codesign {
    fn default() -> Self {
        Self::new(ADHOC_IDENTITY)
    }
}

impl BundleSigner for Codesign {
    fn sign(&self, bundle: &Path) -> Result<()> {
        run_checked(&mut self.command(bundle), "codesign")?;
        Ok(())
    }
}
