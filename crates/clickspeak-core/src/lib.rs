//! Shared model for the ClickSpeak launcher and its install pipeline.
//!
//! Everything both sides must agree on lives here: the application identity,
//! where the runtime and project live on disk, what makes a provisioned
//! runtime usable, and the error taxonomy reported to users and operators.

pub mod error;
pub mod identity;
pub mod paths;
pub mod runtime;
pub mod settings;

pub use error::LaunchError;
pub use identity::AppIdentity;
pub use runtime::{Readiness, RuntimeInstallation, REQUIRED_VERSION};
pub use settings::{LaunchMode, LaunchSettings};
