//! Install pipeline for ClickSpeak: runtime provisioning, launcher
//! compilation, bundle assembly and signing.

pub mod bundle;
pub mod compile;
pub mod link;
pub mod process;
pub mod provision;
pub mod sign;
pub mod staging;
pub mod status;

pub const TRACE_COMPONENT: &str = "tools";
