//! Declarative dependency specs.
//!
//! A spec maps package-manager names to ordered package lists, plus an
//! optional python constraint and conda channels:
//!
//! ```json
//! {
//!   "python": "3.11",
//!   "channels": ["conda-forge"],
//!   "conda": ["numpy"],
//!   "pip": [{"name": "cellpose", "platforms": ["linux-64"], "optional": true}]
//! }
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Package managers a spec may name.
pub const PACKAGE_MANAGERS: &[&str] = &["conda", "pip"];

/// Oldest python an environment may request.
pub const MIN_PYTHON: (u32, u32) = (3, 9);

/// A spec that cannot be provisioned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpecError {
    #[error("unknown package manager `{0}` (expected one of: conda, pip)")]
    UnknownPackageManager(String),

    #[error("empty package constraint in `{manager}` dependencies")]
    EmptyConstraint { manager: String },

    #[error("invalid {manager} constraint `{constraint}`: {reason}")]
    InvalidConstraint {
        manager: String,
        constraint: String,
        reason: String,
    },

    #[error("pip dependency `{0}` has a channel specifier \"::\"; is it a conda dependency?")]
    PipChannelPrefix(String),

    #[error("invalid python constraint `{0}`")]
    InvalidPython(String),

    #[error("python {0} is too old; environments need python 3.9 or newer")]
    PythonTooOld(String),

    #[error(
        "the library {name} is not available on this platform ({platform}). \
         It is only available on the following platforms: {}.",
        .platforms.join(", ")
    )]
    Incompatible {
        name: String,
        platform: String,
        platforms: Vec<String>,
    },
}

/// One package requirement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Dependency {
    /// A bare constraint such as `numpy>=1.26` or `conda-forge::ffmpeg`.
    Constraint(String),
    Detailed(DependencyDetails),
}

/// Requirement with platform restrictions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyDetails {
    pub name: String,
    /// Conda platform names (`linux-64`, `osx-arm64`, ...). Empty or `all`
    /// means every platform.
    #[serde(default)]
    pub platforms: Vec<String>,
    /// Skip silently instead of failing on an unsupported platform.
    #[serde(default)]
    pub optional: bool,
    /// Install the package's own dependencies.
    #[serde(default = "default_true")]
    pub dependencies: bool,
}

fn default_true() -> bool {
    true
}

impl Dependency {
    pub fn name(&self) -> &str {
        match self {
            Dependency::Constraint(s) => s,
            Dependency::Detailed(d) => &d.name,
        }
    }

    pub fn available_on(&self, platform: &str) -> bool {
        match self {
            Dependency::Constraint(_) => true,
            Dependency::Detailed(d) => {
                d.platforms.is_empty()
                    || d.platforms.iter().any(|p| p == platform || p == "all")
            }
        }
    }

    pub fn is_optional(&self) -> bool {
        matches!(self, Dependency::Detailed(d) if d.optional)
    }

    pub fn with_dependencies(&self) -> bool {
        match self {
            Dependency::Constraint(_) => true,
            Dependency::Detailed(d) => d.dependencies,
        }
    }
}

impl From<&str> for Dependency {
    fn from(s: &str) -> Self {
        Dependency::Constraint(s.to_string())
    }
}

/// Dependency spec of one environment. Immutable once the environment is
/// provisioned.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencySpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub python: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub channels: Vec<String>,
    /// Keyed by package manager.
    #[serde(flatten)]
    pub packages: BTreeMap<String, Vec<Dependency>>,
}

/// Packages to install on one platform, split by manager and by whether
/// their own dependencies are installed too.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedDependencies {
    pub conda: Vec<String>,
    pub conda_no_deps: Vec<String>,
    pub pip: Vec<String>,
    pub pip_no_deps: Vec<String>,
}

impl ResolvedDependencies {
    pub fn has_conda(&self) -> bool {
        !self.conda.is_empty() || !self.conda_no_deps.is_empty()
    }

    pub fn has_pip(&self) -> bool {
        !self.pip.is_empty() || !self.pip_no_deps.is_empty()
    }
}

/// Conda name of the platform this process runs on.
pub fn current_platform() -> String {
    rattler_conda_types::Platform::current().to_string()
}

impl DependencySpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_python(mut self, python: impl Into<String>) -> Self {
        self.python = Some(python.into());
        self
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channels.push(channel.into());
        self
    }

    pub fn with(mut self, manager: &str, dependency: impl Into<Dependency>) -> Self {
        self.packages
            .entry(manager.to_string())
            .or_default()
            .push(dependency.into());
        self
    }

    /// No python constraint and no packages: runs on the host runtime.
    pub fn is_empty(&self) -> bool {
        self.python.is_none() && self.packages.values().all(Vec::is_empty)
    }

    pub fn dependencies(&self, manager: &str) -> &[Dependency] {
        self.packages.get(manager).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Validate against the current platform.
    pub fn validate(&self) -> Result<(), SpecError> {
        self.validate_for(&current_platform())
    }

    pub fn validate_for(&self, platform: &str) -> Result<(), SpecError> {
        if let Some(python) = &self.python {
            check_python(python)?;
        }
        for (manager, deps) in &self.packages {
            if !PACKAGE_MANAGERS.contains(&manager.as_str()) {
                return Err(SpecError::UnknownPackageManager(manager.clone()));
            }
            for dep in deps {
                check_constraint(manager, dep.name())?;
                if manager == "pip" && dep.name().contains("::") {
                    return Err(SpecError::PipChannelPrefix(dep.name().to_string()));
                }
            }
        }
        self.resolve(platform).map(|_| ())
    }

    /// Split the spec into install lists for `platform`. Optional packages
    /// unavailable there are dropped; required ones are an error.
    pub fn resolve(&self, platform: &str) -> Result<ResolvedDependencies, SpecError> {
        let mut resolved = ResolvedDependencies::default();
        for (manager, deps) in &self.packages {
            let (with_deps, no_deps) = match manager.as_str() {
                "conda" => (&mut resolved.conda, &mut resolved.conda_no_deps),
                "pip" => (&mut resolved.pip, &mut resolved.pip_no_deps),
                other => return Err(SpecError::UnknownPackageManager(other.to_string())),
            };
            for dep in deps {
                if !dep.available_on(platform) {
                    if dep.is_optional() {
                        log::debug!(
                            "[spec] Skipping optional {} package {} on {}",
                            manager,
                            dep.name(),
                            platform
                        );
                        continue;
                    }
                    let platforms = match dep {
                        Dependency::Detailed(d) => d.platforms.clone(),
                        Dependency::Constraint(_) => Vec::new(),
                    };
                    return Err(SpecError::Incompatible {
                        name: dep.name().to_string(),
                        platform: platform.to_string(),
                        platforms,
                    });
                }
                if dep.with_dependencies() {
                    with_deps.push(dep.name().to_string());
                } else {
                    no_deps.push(dep.name().to_string());
                }
            }
        }
        Ok(resolved)
    }
}

fn check_constraint(manager: &str, constraint: &str) -> Result<(), SpecError> {
    if constraint.trim().is_empty() {
        return Err(SpecError::EmptyConstraint {
            manager: manager.to_string(),
        });
    }
    if constraint.chars().any(char::is_whitespace) {
        return Err(SpecError::InvalidConstraint {
            manager: manager.to_string(),
            constraint: constraint.to_string(),
            reason: "whitespace is not allowed inside a constraint".to_string(),
        });
    }
    Ok(())
}

/// Extract `major.minor` from a python constraint such as `3.11`, `=3.10.*`
/// or `>=3.9`.
pub fn python_version(constraint: &str) -> Option<(u32, u32)> {
    let start = constraint.find(|c: char| c.is_ascii_digit())?;
    let mut parts = constraint[start..].split('.');
    let major = parts.next()?.parse().ok()?;
    let minor: String = parts
        .next()?
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    Some((major, minor.parse().ok()?))
}

fn check_python(python: &str) -> Result<(), SpecError> {
    if python.chars().any(char::is_whitespace) {
        return Err(SpecError::InvalidPython(python.to_string()));
    }
    match python_version(python) {
        None => Err(SpecError::InvalidPython(python.to_string())),
        Some(version) if version < MIN_PYTHON => Err(SpecError::PythonTooOld(python.to_string())),
        Some(_) => Ok(()),
    }
}

/// Stable cache key for a spec on a platform.
///
/// Independent of package order within a list; includes channels, python and
/// the platform.
pub fn compute_env_hash(spec: &DependencySpec, platform: &str) -> String {
    let mut hasher = Sha256::new();

    for (manager, deps) in &spec.packages {
        let mut entries: Vec<String> = deps
            .iter()
            .map(|d| {
                let mode = if d.with_dependencies() { "" } else { "nodeps:" };
                format!("{}:{}{}", manager, mode, d.name())
            })
            .collect();
        entries.sort();
        for entry in &entries {
            hasher.update(entry.as_bytes());
            hasher.update(b"\n");
        }
    }

    let mut channels = spec.channels.clone();
    channels.sort();
    for channel in &channels {
        hasher.update(b"channel:");
        hasher.update(channel.as_bytes());
        hasher.update(b"\n");
    }

    if let Some(ref py) = spec.python {
        hasher.update(b"python:");
        hasher.update(py.as_bytes());
        hasher.update(b"\n");
    }

    hasher.update(b"platform:");
    hasher.update(platform.as_bytes());

    hex::encode(hasher.finalize())[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> DependencySpec {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_parse_mixed_dependencies() {
        let spec = parse(
            r#"{
                "python": "3.11",
                "conda": ["numpy", "conda-forge::ffmpeg"],
                "pip": [{"name": "torch", "platforms": ["linux-64"], "optional": true, "dependencies": false}]
            }"#,
        );
        assert_eq!(spec.python.as_deref(), Some("3.11"));
        assert_eq!(spec.dependencies("conda").len(), 2);
        let torch = &spec.dependencies("pip")[0];
        assert_eq!(torch.name(), "torch");
        assert!(torch.is_optional());
        assert!(!torch.with_dependencies());
        assert!(torch.available_on("linux-64"));
        assert!(!torch.available_on("osx-arm64"));
    }

    #[test]
    fn test_empty_spec() {
        let spec = parse("{}");
        assert!(spec.is_empty());
        assert!(spec.validate().is_ok());
        assert!(!DependencySpec::new().with_python("3.12").is_empty());
    }

    #[test]
    fn test_serialize_flattens_packages() {
        let spec = DependencySpec::new().with("pip", "requests");
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json, serde_json::json!({ "pip": ["requests"] }));
    }

    #[test]
    fn test_unknown_manager_rejected() {
        let spec = parse(r#"{"npm": ["left-pad"]}"#);
        assert_eq!(
            spec.validate(),
            Err(SpecError::UnknownPackageManager("npm".into()))
        );
    }

    #[test]
    fn test_bad_constraints_rejected() {
        let empty = DependencySpec::new().with("conda", "  ");
        assert!(matches!(
            empty.validate(),
            Err(SpecError::EmptyConstraint { .. })
        ));

        let spaced = DependencySpec::new().with("pip", "numpy >=1");
        assert!(matches!(
            spaced.validate(),
            Err(SpecError::InvalidConstraint { .. })
        ));

        let channel = DependencySpec::new().with("pip", "conda-forge::numpy");
        assert!(matches!(
            channel.validate(),
            Err(SpecError::PipChannelPrefix(_))
        ));
    }

    #[test]
    fn test_python_version_checks() {
        assert_eq!(python_version("3.11"), Some((3, 11)));
        assert_eq!(python_version(">=3.9"), Some((3, 9)));
        assert_eq!(python_version("=3.10.*"), Some((3, 10)));
        assert_eq!(python_version("3"), None);

        assert!(DependencySpec::new().with_python("3.9").validate().is_ok());
        assert!(matches!(
            DependencySpec::new().with_python("3.8").validate(),
            Err(SpecError::PythonTooOld(_))
        ));
        assert!(matches!(
            DependencySpec::new().with_python("latest").validate(),
            Err(SpecError::InvalidPython(_))
        ));
    }

    #[test]
    fn test_resolve_filters_by_platform() {
        let spec = parse(
            r#"{
                "conda": ["numpy", {"name": "cuda-toolkit", "platforms": ["linux-64"], "optional": true}],
                "pip": [{"name": "plugin", "dependencies": false}]
            }"#,
        );

        let linux = spec.resolve("linux-64").unwrap();
        assert_eq!(linux.conda, vec!["numpy", "cuda-toolkit"]);
        assert_eq!(linux.pip_no_deps, vec!["plugin"]);
        assert!(linux.pip.is_empty());

        let mac = spec.resolve("osx-arm64").unwrap();
        assert_eq!(mac.conda, vec!["numpy"]);
        assert!(mac.has_pip());
    }

    #[test]
    fn test_required_incompatible_dependency() {
        let spec = parse(r#"{"conda": [{"name": "winonly", "platforms": ["win-64"]}]}"#);
        let err = spec.validate_for("linux-64").unwrap_err();
        assert!(err.to_string().contains("not available on this platform (linux-64)"));
        assert!(err.to_string().contains("win-64"));
        assert!(spec.validate_for("win-64").is_ok());
    }

    #[test]
    fn test_platform_all() {
        let spec = parse(r#"{"conda": [{"name": "x", "platforms": ["all"]}]}"#);
        assert!(spec.validate_for("linux-aarch64").is_ok());
    }

    #[test]
    fn test_compute_env_hash_stable() {
        let spec = DependencySpec::new().with("conda", "numpy").with("conda", "pandas");
        let a = compute_env_hash(&spec, "linux-64");
        let b = compute_env_hash(&spec, "linux-64");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn test_compute_env_hash_order_independent() {
        let a = DependencySpec::new().with("conda", "numpy").with("conda", "pandas");
        let b = DependencySpec::new().with("conda", "pandas").with("conda", "numpy");
        assert_eq!(
            compute_env_hash(&a, "linux-64"),
            compute_env_hash(&b, "linux-64")
        );
    }

    #[test]
    fn test_compute_env_hash_differs() {
        let base = DependencySpec::new().with("conda", "numpy");
        let pip = DependencySpec::new().with("pip", "numpy");
        let channel = base.clone().with_channel("bioconda");
        let python = base.clone().with_python("3.12");

        let h = compute_env_hash(&base, "linux-64");
        assert_ne!(h, compute_env_hash(&pip, "linux-64"));
        assert_ne!(h, compute_env_hash(&channel, "linux-64"));
        assert_ne!(h, compute_env_hash(&python, "linux-64"));
        assert_ne!(h, compute_env_hash(&base, "osx-64"));
    }
}
