//! Dependency specs and isolated environment provisioning.
//!
//! - [`DependencySpec`]: packages keyed by package manager, validated up front
//! - [`Provisioner`]: the interface the environment manager provisions through
//! - [`RattlerProvisioner`]: conda packages via `rattler`, pip packages via `uv`
//!   (bootstrapped through rattler when missing from `PATH`)
//! - [`Activation`]: variables for running a process inside a prefix
//!
//! ```ignore
//! use capsule_env::{DependencySpec, Provisioner, RattlerProvisioner};
//!
//! let spec: DependencySpec = serde_json::from_str(r#"{"conda": ["numpy"]}"#)?;
//! spec.validate()?;
//! let prefix = RattlerProvisioner::new(root).create_env("analysis", &spec).await?;
//! ```

pub mod activation;
pub mod conda;
pub mod pip;
pub mod progress;
pub mod provisioner;
pub mod spec;
pub mod tools;

pub use activation::Activation;
pub use progress::{InstallReporter, LogHandler, ProgressHandler, ProvisionPhase};
pub use provisioner::{Provisioner, RattlerProvisioner};
pub use spec::{
    compute_env_hash, current_platform, Dependency, DependencyDetails, DependencySpec,
    ResolvedDependencies, SpecError,
};
