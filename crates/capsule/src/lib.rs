//! Run code modules inside isolated, dependency-scoped environments.
//!
//! An [`EnvironmentManager`] owns named environments under a root directory.
//! Each [`Environment`] gets its own launcher process, started inside its
//! provisioned prefix and spoken to over a framed channel on the process's
//! stdio. Imported modules come back as [`ModuleProxy`] values whose calls
//! travel to the launcher and back.
//!
//! ```ignore
//! use capsule::{EnvironmentManager, ManagerConfig};
//! use capsule_env::DependencySpec;
//!
//! let manager = EnvironmentManager::new(ManagerConfig::from_env()).await?;
//! let env = manager
//!     .create_and_launch("analysis", DependencySpec::new(), Duration::from_secs(60))
//!     .await?;
//! let sys = env.import_module("sys").await?;
//! let pid = sys.call("pid", vec![]).await?;
//! env.exit(Duration::from_secs(10)).await?;
//! ```

pub mod config;
pub mod descriptor;
pub mod environment;
pub mod error;
pub mod launcher;
pub mod manager;
pub mod proxy;

pub use config::{LauncherCommand, ManagerConfig};
pub use descriptor::EnvironmentDescriptor;
pub use environment::{
    CallOptions, CallOutput, Environment, EnvironmentState, RemoteLog, ShutdownKind,
};
pub use error::{Error, RemoteException, Result};
pub use manager::EnvironmentManager;
pub use proxy::{ModuleProxy, RemoteFunction};

pub use capsule_env::{Dependency, DependencySpec};
pub use capsule_protocol::{Kwargs, Value};
