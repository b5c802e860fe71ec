//! Manager configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// How to start the launcher process inside an environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LauncherCommand {
    pub program: PathBuf,
    /// Extra arguments appended after the ones the environment adds.
    pub args: Vec<String>,
    /// Passed as `--log-level`.
    pub log_level: String,
}

impl LauncherCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            log_level: "info".to_string(),
        }
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// `capsule-launcher` next to the current executable, else from `PATH`.
    pub fn default_program() -> PathBuf {
        let name = format!("capsule-launcher{}", std::env::consts::EXE_SUFFIX);
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(&name)))
            .filter(|candidate| candidate.exists())
            .unwrap_or_else(|| PathBuf::from(name))
    }
}

impl Default for LauncherCommand {
    fn default() -> Self {
        Self::new(Self::default_program())
    }
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Holds descriptors, provisioned prefixes, tools and locks.
    pub root: PathBuf,
    pub launcher: LauncherCommand,
    /// Bound on spawning the launcher and receiving READY.
    pub launch_timeout: Duration,
    /// Grace period for a SHUTDOWN before the process is killed.
    pub shutdown_timeout: Duration,
    /// Default per-call timeout; `None` waits indefinitely.
    pub call_timeout: Option<Duration>,
    /// Bound on installing an environment's packages.
    pub provision_timeout: Duration,
}

pub fn default_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("capsule")
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            launcher: LauncherCommand::default(),
            launch_timeout: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(10),
            call_timeout: None,
            provision_timeout: Duration::from_secs(30 * 60),
        }
    }
}

impl ManagerConfig {
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Defaults overridden by `CAPSULE_ROOT`, `CAPSULE_LAUNCHER` and
    /// `CAPSULE_LOG`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(root) = std::env::var_os("CAPSULE_ROOT").filter(|v| !v.is_empty()) {
            config.root = PathBuf::from(root);
        }
        if let Some(program) = std::env::var_os("CAPSULE_LAUNCHER").filter(|v| !v.is_empty()) {
            config.launcher.program = PathBuf::from(program);
        }
        if let Ok(level) = std::env::var("CAPSULE_LOG") {
            if !level.is_empty() {
                config.launcher.log_level = level;
            }
        }
        config
    }

    pub fn environments_dir(&self) -> PathBuf {
        self.root.join("environments")
    }

    pub fn envs_dir(&self) -> PathBuf {
        self.root.join("envs")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}
