//! Module lookup by path for IMPORT and CALL.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::module::{Module, ModuleError};

/// Modules a launcher can import, keyed by module path.
#[derive(Clone, Default)]
pub struct ModuleRegistry {
    modules: BTreeMap<String, Arc<dyn Module>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, module: impl Module + 'static) -> &mut Self {
        let module: Arc<dyn Module> = Arc::new(module);
        self.modules.insert(module.name().to_string(), module);
        self
    }

    pub fn with(mut self, module: impl Module + 'static) -> Self {
        self.register(module);
        self
    }

    pub fn get(&self, path: &str) -> Option<Arc<dyn Module>> {
        self.modules.get(path).cloned()
    }

    /// Like [`get`](Self::get) but failing the way an IMPORT does.
    pub fn lookup(&self, path: &str) -> Result<Arc<dyn Module>, ModuleError> {
        self.get(path).ok_or_else(|| {
            ModuleError::new("ModuleNotFound", format!("No module named '{}'", path))
        })
    }

    pub fn contains(&self, path: &str) -> bool {
        self.modules.contains_key(path)
    }

    pub fn names(&self) -> Vec<String> {
        self.modules.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::module::FnModule;
    use capsule_protocol::Value;

    #[test]
    fn test_register_and_lookup() {
        let registry = ModuleRegistry::new()
            .with(FnModule::new("b").function("f", |_| Ok(Value::Null)))
            .with(FnModule::new("a"));

        assert_eq!(registry.names(), vec!["a", "b"]);
        assert!(registry.contains("b"));
        assert_eq!(registry.lookup("b").unwrap().attributes(), vec!["f"]);

        let err = registry.lookup("missing").err().unwrap();
        assert_eq!(err.error_type, "ModuleNotFound");
        assert_eq!(err.message, "No module named 'missing'");
    }

    #[test]
    fn test_later_registration_replaces() {
        let mut registry = ModuleRegistry::new();
        registry.register(FnModule::new("m").function("old", |_| Ok(Value::Null)));
        registry.register(FnModule::new("m").function("new", |_| Ok(Value::Null)));
        assert_eq!(registry.get("m").unwrap().attributes(), vec!["new"]);
    }
}
