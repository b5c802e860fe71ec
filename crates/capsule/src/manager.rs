//! Named environments under one root directory.
//!
//! ```text
//! <root>/environments/<name>.json   descriptor (name, spec, created_at)
//! <root>/envs/<name>/               provisioned prefix or working directory
//! <root>/locks/<name>.lock          cross-process lock held while creating/removing
//! <root>/tools/                     bootstrapped package-manager binaries
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use capsule_env::{DependencySpec, Provisioner, RattlerProvisioner};
use log::{info, warn};

use crate::config::ManagerConfig;
use crate::descriptor::{DescriptorStore, EnvironmentDescriptor, NameLock};
use crate::environment::{Environment, EnvironmentState, ShutdownKind};
use crate::error::{Error, Result};

pub const MAX_NAME_LEN: usize = 64;

/// Names become file names: `[A-Za-z0-9._-]`, 1 to 64 characters, not
/// starting with a dot.
pub fn validate_name(name: &str) -> Result<()> {
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if name.is_empty() || name.len() > MAX_NAME_LEN || !valid_chars || name.starts_with('.') {
        return Err(Error::InvalidSpec(format!(
            "invalid environment name `{}`: use 1-{} characters from [A-Za-z0-9._-], not starting with '.'",
            name, MAX_NAME_LEN
        )));
    }
    Ok(())
}

pub struct EnvironmentManager {
    config: Arc<ManagerConfig>,
    provisioner: Arc<dyn Provisioner>,
    store: DescriptorStore,
    environments: tokio::sync::Mutex<HashMap<String, Arc<Environment>>>,
    name_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl EnvironmentManager {
    /// Manager provisioning through rattler and uv under `config.root`.
    pub async fn new(config: ManagerConfig) -> Result<Self> {
        let provisioner = Arc::new(RattlerProvisioner::new(config.root.clone()));
        Self::with_provisioner(config, provisioner).await
    }

    /// Creates the root layout and registers every stored descriptor.
    pub async fn with_provisioner(
        config: ManagerConfig,
        provisioner: Arc<dyn Provisioner>,
    ) -> Result<Self> {
        for dir in [config.environments_dir(), config.envs_dir(), config.locks_dir()] {
            tokio::fs::create_dir_all(&dir).await?;
        }
        let config = Arc::new(config);
        let store = DescriptorStore::new(config.environments_dir());

        let mut environments = HashMap::new();
        for descriptor in store.load_all().await? {
            let env = Environment::new(
                descriptor.name.clone(),
                descriptor.spec,
                config.clone(),
                provisioner.clone(),
            );
            environments.insert(descriptor.name, env);
        }
        info!(
            "[manager] Opened {:?} with {} environment(s)",
            config.root,
            environments.len()
        );

        Ok(Self {
            config,
            provisioner,
            store,
            environments: tokio::sync::Mutex::new(environments),
            name_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    fn name_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.name_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(name.to_string()).or_default().clone()
    }

    /// Forget the in-process lock for `name` once nobody else holds it.
    fn release_name_lock(&self, name: &str) {
        let mut locks = self.name_locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks.get(name).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(name);
        }
    }

    /// Register a new environment. Nothing is installed or started until
    /// [`Environment::launch`].
    pub async fn create(&self, name: &str, spec: DependencySpec) -> Result<Arc<Environment>> {
        validate_name(name)?;
        spec.validate()?;

        let local = self.name_lock(name);
        let _local = local.lock().await;
        let _file = NameLock::acquire(&self.config.locks_dir(), name).await?;

        if self.environments.lock().await.contains_key(name) || self.store.exists(name).await {
            return Err(Error::EnvironmentAlreadyExists(name.to_string()));
        }

        let descriptor = EnvironmentDescriptor::new(name, spec.clone());
        self.store.write(&descriptor).await?;

        let env = Environment::new(name, spec, self.config.clone(), self.provisioner.clone());
        self.environments
            .lock()
            .await
            .insert(name.to_string(), env.clone());
        info!("[manager] Created environment {}", name);
        Ok(env)
    }

    /// Launch `name`, creating it first when absent. An existing environment
    /// is reused only when its spec equals `spec`.
    pub async fn create_and_launch(
        &self,
        name: &str,
        spec: DependencySpec,
        timeout: Duration,
    ) -> Result<Arc<Environment>> {
        let env = match self.get(name).await {
            Ok(existing) => existing,
            Err(Error::EnvironmentNotFound(_)) => match self.create(name, spec.clone()).await {
                Ok(env) => env,
                // Lost a race with another creator.
                Err(Error::EnvironmentAlreadyExists(_)) => self.get(name).await?,
                Err(e) => return Err(e),
            },
            Err(e) => return Err(e),
        };
        if env.spec() != &spec {
            return Err(Error::EnvironmentAlreadyExists(name.to_string()));
        }
        env.launch(timeout).await?;
        Ok(env)
    }

    pub async fn get(&self, name: &str) -> Result<Arc<Environment>> {
        self.environments
            .lock()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| Error::EnvironmentNotFound(name.to_string()))
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.environments.lock().await.contains_key(name)
    }

    /// Stored descriptors, sorted by name.
    pub async fn list(&self) -> Result<Vec<EnvironmentDescriptor>> {
        Ok(self.store.load_all().await?)
    }

    /// Stop `name` if it is running, then delete its descriptor and
    /// provisioned files.
    pub async fn remove(&self, name: &str) -> Result<()> {
        let env = self.get(name).await?;

        let local = self.name_lock(name);
        let guard = local.lock().await;
        let file_lock = NameLock::acquire(&self.config.locks_dir(), name).await?;

        if env.state() != EnvironmentState::Exited {
            if let Err(e) = env.exit(self.config.shutdown_timeout).await {
                warn!("[manager] {} did not shut down cleanly: {}", name, e);
            }
        }

        self.store.remove(name).await?;
        if let Err(e) = self.provisioner.remove_env(name).await {
            warn!("[manager] Could not remove files of {}: {:#}", name, e);
        }
        self.environments.lock().await.remove(name);
        drop(file_lock);
        drop(guard);
        drop(local);
        self.release_name_lock(name);
        info!("[manager] Removed environment {}", name);
        Ok(())
    }

    /// Exit every environment. Descriptors stay on disk.
    pub async fn shutdown(&self) -> Vec<(String, Result<ShutdownKind>)> {
        let environments: Vec<Arc<Environment>> =
            self.environments.lock().await.values().cloned().collect();
        let timeout = self.config.shutdown_timeout;
        let exits = environments.iter().map(|env| async move {
            (env.name().to_string(), env.exit(timeout).await)
        });
        let results = futures::future::join_all(exits).await;
        for (name, result) in &results {
            if let Err(e) = result {
                warn!("[manager] Shutting down {} failed: {}", name, e);
            }
        }
        info!("[manager] Shut down {} environment(s)", results.len());
        results
    }
}
