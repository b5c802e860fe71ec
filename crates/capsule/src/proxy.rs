//! Client-side stand-ins for modules imported into an environment.
//!
//! A [`ModuleProxy`] holds a weak reference to its environment: it never keeps
//! the environment alive, and once the environment is gone or no longer live
//! every call fails with `EnvironmentClosed` before touching the channel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use capsule_protocol::{from_value, Kwargs, Value};
use serde::de::DeserializeOwned;

use crate::environment::{CallOptions, Environment};
use crate::error::{Error, Result};

#[derive(Debug)]
pub struct ModuleProxy {
    module: String,
    attributes: Vec<String>,
    env: Weak<Environment>,
    cache: Mutex<HashMap<String, RemoteFunction>>,
}

impl ModuleProxy {
    pub(crate) fn new(module: String, attributes: Vec<String>, env: Weak<Environment>) -> Self {
        Self {
            module,
            attributes,
            env,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    /// Callables the module exported when it was imported.
    pub fn attributes(&self) -> &[String] {
        &self.attributes
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.attributes.iter().any(|a| a == name)
    }

    /// A callable for `name`. Unknown names are not rejected here; the
    /// environment reports them when called.
    pub fn attr(&self, name: &str) -> RemoteFunction {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache
            .entry(name.to_string())
            .or_insert_with(|| RemoteFunction {
                module: self.module.clone(),
                attribute: name.to_string(),
                env: self.env.clone(),
            })
            .clone()
    }

    pub async fn invoke(&self, attribute: &str, args: Vec<Value>, kwargs: Kwargs) -> Result<Value> {
        self.attr(attribute).call_with(args, kwargs).await
    }

    pub async fn call(&self, attribute: &str, args: Vec<Value>) -> Result<Value> {
        self.attr(attribute).call(args).await
    }
}

/// One remote callable bound to its module and environment.
#[derive(Debug, Clone)]
pub struct RemoteFunction {
    module: String,
    attribute: String,
    env: Weak<Environment>,
}

impl RemoteFunction {
    /// `module.attribute`.
    pub fn target(&self) -> String {
        format!("{}.{}", self.module, self.attribute)
    }

    fn environment(&self) -> Result<Arc<Environment>> {
        let env = self
            .env
            .upgrade()
            .ok_or_else(|| Error::EnvironmentClosed(self.module.clone()))?;
        if !env.state().is_live() {
            return Err(Error::EnvironmentClosed(env.name().to_string()));
        }
        Ok(env)
    }

    pub async fn call(&self, args: Vec<Value>) -> Result<Value> {
        self.call_with(args, Kwargs::new()).await
    }

    pub async fn call_with(&self, args: Vec<Value>, kwargs: Kwargs) -> Result<Value> {
        self.call_with_options(args, kwargs, CallOptions::default())
            .await
    }

    pub async fn call_with_options(
        &self,
        args: Vec<Value>,
        kwargs: Kwargs,
        options: CallOptions,
    ) -> Result<Value> {
        let env = self.environment()?;
        env.invoke(&self.module, &self.attribute, args, kwargs, options)
            .await
    }

    /// Call and decode the result into `T`.
    pub async fn call_as<T: DeserializeOwned>(&self, args: Vec<Value>) -> Result<T> {
        Ok(from_value(self.call(args).await?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManagerConfig;
    use capsule_env::{DependencySpec, RattlerProvisioner};

    #[tokio::test]
    async fn test_dropped_environment_is_closed() {
        let proxy = ModuleProxy::new("demo".into(), vec!["add".into()], Weak::new());
        assert!(proxy.has_attribute("add"));
        assert!(!proxy.has_attribute("sub"));

        let err = proxy.call("add", vec![1.into(), 2.into()]).await.unwrap_err();
        assert!(matches!(err, Error::EnvironmentClosed(_)));
    }

    #[tokio::test]
    async fn test_environment_not_live_is_closed() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = Arc::new(ManagerConfig::with_root(tmp.path()));
        let provisioner = Arc::new(RattlerProvisioner::new(tmp.path()));
        let env = Environment::new("p", DependencySpec::new(), config, provisioner);

        let proxy = ModuleProxy::new("demo".into(), vec![], Arc::downgrade(&env));
        let err = proxy.attr("anything").call(vec![]).await.unwrap_err();
        assert!(matches!(err, Error::EnvironmentClosed(ref name) if name == "p"));
    }

    #[test]
    fn test_attr_is_cached() {
        let proxy = ModuleProxy::new("demo".into(), vec![], Weak::new());
        let first = proxy.attr("add");
        let again = proxy.attr("add");
        assert_eq!(first.target(), "demo.add");
        assert_eq!(again.target(), first.target());
        assert_eq!(proxy.cache.lock().unwrap().len(), 1);
    }
}
