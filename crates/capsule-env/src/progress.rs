//! Provisioning progress events.

use rattler::install::{Reporter, Transaction};
use rattler_conda_types::{PrefixRecord, RepoDataRecord};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

/// Phases of provisioning one environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum ProvisionPhase {
    Starting { env_hash: String },
    /// The prefix already holds this spec.
    CacheHit { prefix: String },
    /// Installing a helper tool (uv) into the tools cache.
    BootstrappingTool { tool: String },
    FetchingRepodata { channels: Vec<String> },
    RepodataComplete { record_count: usize, elapsed_ms: u64 },
    Solving { spec_count: usize },
    SolveComplete { package_count: usize, elapsed_ms: u64 },
    Installing { total: usize },
    DownloadProgress { completed: usize, total: usize },
    LinkProgress {
        completed: usize,
        total: usize,
        current_package: String,
    },
    InstallComplete { elapsed_ms: u64 },
    InstallingPip { packages: Vec<String>, no_deps: bool },
    Ready { prefix: String },
    Error { message: String },
}

/// Receives provisioning progress for a named environment.
pub trait ProgressHandler: Send + Sync {
    fn on_progress(&self, env_name: &str, phase: ProvisionPhase);
}

/// Writes progress to the `log` crate.
pub struct LogHandler;

impl ProgressHandler for LogHandler {
    fn on_progress(&self, env_name: &str, phase: ProvisionPhase) {
        match &phase {
            ProvisionPhase::Starting { env_hash } => {
                log::info!("[provision:{env_name}] Starting (hash: {env_hash})");
            }
            ProvisionPhase::CacheHit { prefix } => {
                log::info!("[provision:{env_name}] Reusing {prefix}");
            }
            ProvisionPhase::BootstrappingTool { tool } => {
                log::info!("[provision:{env_name}] Bootstrapping {tool}...");
            }
            ProvisionPhase::FetchingRepodata { channels } => {
                log::info!("[provision:{env_name}] Fetching repodata from: {channels:?}");
            }
            ProvisionPhase::RepodataComplete {
                record_count,
                elapsed_ms,
            } => {
                log::info!(
                    "[provision:{env_name}] Loaded {record_count} package records in {elapsed_ms}ms"
                );
            }
            ProvisionPhase::Solving { spec_count } => {
                log::info!("[provision:{env_name}] Solving {spec_count} specs...");
            }
            ProvisionPhase::SolveComplete {
                package_count,
                elapsed_ms,
            } => {
                log::info!(
                    "[provision:{env_name}] Resolved {package_count} packages in {elapsed_ms}ms"
                );
            }
            ProvisionPhase::Installing { total } => {
                log::info!("[provision:{env_name}] Installing {total} packages...");
            }
            ProvisionPhase::DownloadProgress { completed, total } => {
                log::debug!("[provision:{env_name}] Download {completed}/{total}");
            }
            ProvisionPhase::LinkProgress {
                completed,
                total,
                current_package,
            } => {
                log::debug!("[provision:{env_name}] Link {completed}/{total} {current_package}");
            }
            ProvisionPhase::InstallComplete { elapsed_ms } => {
                log::info!("[provision:{env_name}] Conda install complete in {elapsed_ms}ms");
            }
            ProvisionPhase::InstallingPip { packages, no_deps } => {
                let mode = if *no_deps { " (no deps)" } else { "" };
                log::info!("[provision:{env_name}] pip install{mode}: {packages:?}");
            }
            ProvisionPhase::Ready { prefix } => {
                log::info!("[provision:{env_name}] Ready at {prefix}");
            }
            ProvisionPhase::Error { message } => {
                log::error!("[provision:{env_name}] {message}");
            }
        }
    }
}

/// Forwards rattler install events to a [`ProgressHandler`].
pub struct InstallReporter {
    env_name: String,
    handler: Arc<dyn ProgressHandler>,
    total: AtomicUsize,
    downloaded: AtomicUsize,
    linked: AtomicUsize,
    names: RwLock<HashMap<usize, String>>,
}

impl InstallReporter {
    pub fn new(env_name: impl Into<String>, handler: Arc<dyn ProgressHandler>) -> Self {
        Self {
            env_name: env_name.into(),
            handler,
            total: AtomicUsize::new(0),
            downloaded: AtomicUsize::new(0),
            linked: AtomicUsize::new(0),
            names: RwLock::new(HashMap::new()),
        }
    }

    fn remember(&self, index: usize, record: &RepoDataRecord) -> String {
        let name = record.package_record.name.as_source().to_string();
        if let Ok(mut names) = self.names.write() {
            names.insert(index, name.clone());
        }
        name
    }

    fn name_of(&self, index: usize) -> String {
        self.names
            .read()
            .ok()
            .and_then(|names| names.get(&index).cloned())
            .unwrap_or_default()
    }

    fn emit_link(&self, current_package: String) {
        self.handler.on_progress(
            &self.env_name,
            ProvisionPhase::LinkProgress {
                completed: self.linked.load(Ordering::SeqCst),
                total: self.total.load(Ordering::SeqCst),
                current_package,
            },
        );
    }
}

impl Reporter for InstallReporter {
    fn on_transaction_start(&self, transaction: &Transaction<PrefixRecord, RepoDataRecord>) {
        self.total
            .store(transaction.operations.len(), Ordering::SeqCst);
    }

    fn on_transaction_operation_start(&self, _operation: usize) {}

    fn on_populate_cache_start(&self, cache_entry: usize, record: &RepoDataRecord) -> usize {
        self.remember(cache_entry, record);
        cache_entry
    }

    fn on_validate_start(&self, cache_entry: usize) -> usize {
        cache_entry
    }

    fn on_validate_complete(&self, _validate_idx: usize) {}

    fn on_download_start(&self, cache_entry: usize) -> usize {
        cache_entry
    }

    fn on_download_progress(&self, _download_idx: usize, _progress: u64, _total: Option<u64>) {}

    fn on_download_completed(&self, _download_idx: usize) {
        let completed = self.downloaded.fetch_add(1, Ordering::SeqCst) + 1;
        self.handler.on_progress(
            &self.env_name,
            ProvisionPhase::DownloadProgress {
                completed,
                total: self.total.load(Ordering::SeqCst),
            },
        );
    }

    fn on_populate_cache_complete(&self, _cache_entry: usize) {}

    fn on_unlink_start(&self, operation: usize, _record: &PrefixRecord) -> usize {
        operation
    }

    fn on_unlink_complete(&self, _index: usize) {}

    fn on_link_start(&self, operation: usize, record: &RepoDataRecord) -> usize {
        let name = self.remember(operation, record);
        self.emit_link(name);
        operation
    }

    fn on_link_complete(&self, index: usize) {
        self.linked.fetch_add(1, Ordering::SeqCst);
        self.emit_link(self.name_of(index));
    }

    fn on_transaction_operation_complete(&self, _operation: usize) {}

    fn on_transaction_complete(&self) {}

    fn on_post_link_start(&self, _package_name: &str, _script_path: &str) -> usize {
        0
    }

    fn on_post_link_complete(&self, _index: usize, _success: bool) {}

    fn on_pre_unlink_start(&self, _package_name: &str, _script_path: &str) -> usize {
        0
    }

    fn on_pre_unlink_complete(&self, _index: usize, _success: bool) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(String, ProvisionPhase)>>);

    impl ProgressHandler for Recorder {
        fn on_progress(&self, env_name: &str, phase: ProvisionPhase) {
            self.0.lock().unwrap().push((env_name.to_string(), phase));
        }
    }

    #[test]
    fn test_phase_serialization() {
        let phase = ProvisionPhase::CacheHit {
            prefix: "/tmp/envs/demo".into(),
        };
        let json = serde_json::to_value(&phase).unwrap();
        assert_eq!(json["phase"], "cache_hit");
        assert_eq!(json["prefix"], "/tmp/envs/demo");

        let back: ProvisionPhase = serde_json::from_value(json).unwrap();
        assert_eq!(back, phase);
    }

    #[test]
    fn test_download_events_count_up() {
        let recorder = Arc::new(Recorder::default());
        let reporter = InstallReporter::new("demo", recorder.clone());
        reporter.total.store(2, Ordering::SeqCst);
        reporter.on_download_completed(0);
        reporter.on_download_completed(1);

        let events = recorder.0.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].0, "demo");
        assert_eq!(
            events[1].1,
            ProvisionPhase::DownloadProgress {
                completed: 2,
                total: 2
            }
        );
    }
}
