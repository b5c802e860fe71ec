//! Environment provisioning.
//!
//! A [`Provisioner`] turns a named [`DependencySpec`] into an installed prefix.
//! [`RattlerProvisioner`] installs conda packages with rattler and pip packages
//! with `uv`, keyed by a hash of the spec so an unchanged spec is reused.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::info;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::OnceCell;

use crate::conda::{self, CondaRequest};
use crate::pip;
use crate::progress::{LogHandler, ProgressHandler, ProvisionPhase};
use crate::spec::{compute_env_hash, current_platform, DependencySpec};
use crate::tools;

/// File inside a prefix recording the hash of the spec it was built from.
pub const HASH_FILE: &str = ".capsule-env-hash";

#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Make sure the package-manager binary is available; returns its path.
    async fn ensure_installed(&self, root: &Path) -> Result<PathBuf>;

    /// Install `spec` for environment `name`; returns the prefix path.
    async fn create_env(&self, name: &str, spec: &DependencySpec) -> Result<PathBuf>;

    /// Delete whatever `create_env` installed for `name`. Absent is fine.
    async fn remove_env(&self, name: &str) -> Result<()>;
}

/// Provisions prefixes under `<root>/envs/<name>`.
pub struct RattlerProvisioner {
    root: PathBuf,
    handler: Arc<dyn ProgressHandler>,
    uv: OnceCell<PathBuf>,
}

impl RattlerProvisioner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_handler(root, Arc::new(LogHandler))
    }

    pub fn with_handler(root: impl Into<PathBuf>, handler: Arc<dyn ProgressHandler>) -> Self {
        Self {
            root: root.into(),
            handler,
            uv: OnceCell::new(),
        }
    }

    pub fn envs_dir(&self) -> PathBuf {
        self.root.join("envs")
    }

    pub fn env_path(&self, name: &str) -> PathBuf {
        self.envs_dir().join(name)
    }

    async fn uv_path(&self) -> Result<PathBuf> {
        self.uv
            .get_or_try_init(|| self.ensure_installed(&self.root))
            .await
            .cloned()
    }
}

/// Whether `prefix` was already built from a spec with hash `hash`.
pub async fn is_cached(prefix: &Path, hash: &str) -> bool {
    match tokio::fs::read_to_string(prefix.join(HASH_FILE)).await {
        Ok(stored) => {
            stored.trim() == hash && tools::python_path_for_env(prefix).exists()
        }
        Err(_) => false,
    }
}

#[async_trait]
impl Provisioner for RattlerProvisioner {
    async fn ensure_installed(&self, root: &Path) -> Result<PathBuf> {
        if tools::on_path("uv").await {
            info!("[provision] Using uv from PATH");
            return Ok(PathBuf::from("uv"));
        }
        info!("[provision] uv not found on PATH, bootstrapping via rattler...");
        tools::bootstrap_tool(&root.join("tools"), "uv", self.handler.clone()).await
    }

    async fn create_env(&self, name: &str, spec: &DependencySpec) -> Result<PathBuf> {
        let platform = current_platform();
        let resolved = spec.resolve(&platform)?;
        let hash = compute_env_hash(spec, &platform);
        let prefix = self.env_path(name);
        let prefix_str = prefix.to_string_lossy().to_string();

        self.handler.on_progress(
            name,
            ProvisionPhase::Starting {
                env_hash: hash.clone(),
            },
        );

        if is_cached(&prefix, &hash).await {
            self.handler.on_progress(
                name,
                ProvisionPhase::CacheHit {
                    prefix: prefix_str.clone(),
                },
            );
            self.handler
                .on_progress(name, ProvisionPhase::Ready { prefix: prefix_str });
            return Ok(prefix);
        }

        tokio::fs::create_dir_all(self.envs_dir()).await?;
        if prefix.exists() {
            info!("[provision] Replacing stale environment at {:?}", prefix);
            tokio::fs::remove_dir_all(&prefix).await?;
        }

        let mut specs = vec![conda::python_spec(spec.python.as_deref())];
        specs.extend(resolved.conda.iter().cloned());
        let request = CondaRequest {
            channels: spec.channels.clone(),
            specs,
            no_deps: resolved.conda_no_deps.clone(),
        };
        if let Err(e) = conda::install(name, &prefix, &request, self.handler.clone()).await {
            tokio::fs::remove_dir_all(&prefix).await.ok();
            return Err(e);
        }

        let python = tools::python_path_for_env(&prefix);
        if !python.exists() {
            tokio::fs::remove_dir_all(&prefix).await.ok();
            return Err(anyhow!("python not found at {:?} after install", python));
        }

        if resolved.has_pip() {
            let uv = self.uv_path().await?;
            let installed = async {
                pip::install(name, &uv, &python, &resolved.pip, false, &*self.handler).await?;
                pip::install(name, &uv, &python, &resolved.pip_no_deps, true, &*self.handler)
                    .await
            }
            .await;
            if let Err(e) = installed {
                tokio::fs::remove_dir_all(&prefix).await.ok();
                return Err(e);
            }
        }

        tokio::fs::write(prefix.join(HASH_FILE), &hash).await?;
        self.handler
            .on_progress(name, ProvisionPhase::Ready { prefix: prefix_str });
        Ok(prefix)
    }

    async fn remove_env(&self, name: &str) -> Result<()> {
        let prefix = self.env_path(name);
        match tokio::fs::remove_dir_all(&prefix).await {
            Ok(()) => {
                info!("[provision] Removed environment at {:?}", prefix);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
