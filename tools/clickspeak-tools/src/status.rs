use std::path::Path;

use clickspeak_core::{runtime::interpreter_version, AppIdentity, RuntimeInstallation};
use serde::Serialize;

use crate::bundle::{read_receipt, BuildReceipt, BundleLayout};

#[derive(Debug, Clone, Serialize)]
pub struct RuntimeStatus {
    pub ready: bool,
    pub code: Option<String>,
    pub message: Option<String>,
    pub runtime_dir: String,
    pub interpreter: String,
    pub required_version: String,
    pub python_version: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BundleStatus {
    pub present: bool,
    pub bundle_path: String,
    pub executable_present: bool,
    pub receipt: Option<BuildReceipt>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstallStatus {
    pub runtime: RuntimeStatus,
    pub bundle: BundleStatus,
}

pub fn runtime_status(runtime: &RuntimeInstallation) -> RuntimeStatus {
    let python = runtime.interpreter();
    let python_version = if python.exists() {
        interpreter_version(&python).ok()
    } else {
        None
    };
    let (ready, code, message) = match runtime.ensure_ready() {
        Ok(()) => (true, None, None),
        Err(e) => (false, Some(e.code().to_string()), Some(e.to_string())),
    };
    RuntimeStatus {
        ready,
        code,
        message,
        runtime_dir: runtime.root().display().to_string(),
        interpreter: python.display().to_string(),
        required_version: runtime.required_version().to_string(),
        python_version,
    }
}

pub fn bundle_status(bundle: &Path, identity: &AppIdentity) -> BundleStatus {
    let layout = BundleLayout::new(bundle, identity);
    BundleStatus {
        present: bundle.is_dir(),
        bundle_path: bundle.display().to_string(),
        executable_present: layout.executable().is_file(),
        receipt: read_receipt(&layout).ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clickspeak_core::identity::CLICKSPEAK;

    #[test]
    fn missing_runtime_reports_code() {
        let td = tempfile::tempdir().expect("tempdir");
        let s = runtime_status(&RuntimeInstallation::at(td.path().join("rt")));
        assert!(!s.ready);
        assert_eq!(s.code.as_deref(), Some("E_RUNTIME_NOT_PROVISIONED"));
        assert_eq!(s.python_version, None);
        assert_eq!(s.required_version, "3.12");
    }

    #[test]
    fn missing_bundle_is_absent() {
        let td = tempfile::tempdir().expect("tempdir");
        let s = bundle_status(&td.path().join("ClickSpeak.app"), &CLICKSPEAK);
        assert!(!s.present);
        assert!(!s.executable_present);
        assert!(s.receipt.is_none());
        let v = serde_json::to_value(&s).expect("json");
        assert_eq!(v["present"], false);
    }
}
