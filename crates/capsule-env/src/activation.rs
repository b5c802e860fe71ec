//! Variables that make a process run inside a provisioned prefix.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Activation {
    pub prefix: PathBuf,
    /// Directories prepended to `PATH`, highest priority first.
    pub path_entries: Vec<PathBuf>,
    pub vars: BTreeMap<String, String>,
}

impl Activation {
    pub fn for_prefix(prefix: &Path) -> Self {
        #[cfg(target_os = "windows")]
        let path_entries = vec![
            prefix.to_path_buf(),
            prefix.join("Library").join("bin"),
            prefix.join("Scripts"),
        ];
        #[cfg(not(target_os = "windows"))]
        let path_entries = vec![prefix.join("bin")];

        let prefix_str = prefix.to_string_lossy().to_string();
        let mut vars = BTreeMap::new();
        vars.insert("CONDA_PREFIX".to_string(), prefix_str.clone());
        vars.insert("VIRTUAL_ENV".to_string(), prefix_str);

        Self {
            prefix: prefix.to_path_buf(),
            path_entries,
            vars,
        }
    }

    /// `PATH` with this prefix in front of `current`.
    pub fn path_value(&self, current: Option<OsString>) -> OsString {
        let existing: Vec<PathBuf> = current
            .as_deref()
            .map(|p| std::env::split_paths(p).collect())
            .unwrap_or_default();
        let joined = self.path_entries.iter().cloned().chain(existing);
        std::env::join_paths(joined).unwrap_or_else(|e| {
            log::warn!("[activation] Cannot extend PATH: {}", e);
            current.unwrap_or_default()
        })
    }

    /// Every variable to set on a child process, `PATH` included.
    pub fn env_vars(&self) -> Vec<(OsString, OsString)> {
        let mut out = vec![(
            OsString::from("PATH"),
            self.path_value(std::env::var_os("PATH")),
        )];
        out.extend(
            self.vars
                .iter()
                .map(|(k, v)| (OsString::from(k), OsString::from(v))),
        );
        out
    }
}
