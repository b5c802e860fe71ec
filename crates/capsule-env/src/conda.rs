//! Conda package installation via rattler.
//!
//! Fetches repodata for the requested channels, solves the full dependency
//! set, and installs it into a prefix. Packages requested without their
//! dependencies are not solved; the newest matching record is installed as is.

use anyhow::{anyhow, Result};
use log::info;
use rattler::{default_cache_dir, install::Installer, package_cache::PackageCache};
use rattler_conda_types::{
    Channel, ChannelConfig, GenericVirtualPackage, MatchSpec, Matches, ParseMatchSpecOptions,
    Platform, RepoDataRecord,
};
use rattler_repodata_gateway::{Gateway, RepoData};
use rattler_solve::{resolvo, SolverImpl, SolverTask};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use crate::progress::{InstallReporter, ProgressHandler, ProvisionPhase};

/// Channel used when a spec names none.
pub const DEFAULT_CHANNEL: &str = "conda-forge";

const MAX_RETRIES: u32 = 3;
const INITIAL_DELAY_MS: u64 = 1000;

/// What to install into one prefix.
#[derive(Debug, Clone, Default)]
pub struct CondaRequest {
    pub channels: Vec<String>,
    /// Solved together with their dependencies.
    pub specs: Vec<String>,
    /// Installed alone.
    pub no_deps: Vec<String>,
}

/// `python` match spec for a constraint such as `3.11` or `>=3.10`.
pub fn python_spec(constraint: Option<&str>) -> String {
    match constraint {
        Some(c) if c.starts_with(|ch: char| ch.is_ascii_digit()) => format!("python={}", c),
        Some(c) => format!("python{}", c),
        None => "python>=3.9".to_string(),
    }
}

/// Solve and install `request` into `prefix`.
pub async fn install(
    env_name: &str,
    prefix: &Path,
    request: &CondaRequest,
    handler: Arc<dyn ProgressHandler>,
) -> Result<()> {
    let root = prefix.parent().unwrap_or(prefix).to_path_buf();
    let channel_config = ChannelConfig::default_with_root_dir(root);

    let channel_names: Vec<String> = if request.channels.is_empty() {
        vec![DEFAULT_CHANNEL.to_string()]
    } else {
        request.channels.clone()
    };
    let channels = channel_names
        .iter()
        .map(|c| Channel::from_str(c, &channel_config))
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let options = ParseMatchSpecOptions::strict();
    let specs = request
        .specs
        .iter()
        .map(|s| MatchSpec::from_str(s, options))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let no_deps_specs = request
        .no_deps
        .iter()
        .map(|s| MatchSpec::from_str(s, options))
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let rattler_cache_dir = default_cache_dir()
        .map_err(|e| anyhow!("could not determine rattler cache directory: {}", e))?;
    rattler_cache::ensure_cache_dir(&rattler_cache_dir)
        .map_err(|e| anyhow!("could not create rattler cache directory: {}", e))?;

    let download_client = reqwest::Client::builder().build()?;
    let download_client = reqwest_middleware::ClientBuilder::new(download_client).build();

    let gateway = Gateway::builder()
        .with_cache_dir(rattler_cache_dir.join(rattler_cache::REPODATA_CACHE_DIR))
        .with_package_cache(PackageCache::new(
            rattler_cache_dir.join(rattler_cache::PACKAGE_CACHE_DIR),
        ))
        .with_client(download_client.clone())
        .finish();

    let install_platform = Platform::current();
    let platforms = vec![install_platform, Platform::NoArch];

    handler.on_progress(
        env_name,
        ProvisionPhase::FetchingRepodata {
            channels: channel_names,
        },
    );
    let repodata_start = Instant::now();
    let repo_data = query_with_retry(&gateway, &channels, &platforms, &specs, true)
        .await
        .map_err(|e| report(&*handler, env_name, e))?;
    let extra_data = if no_deps_specs.is_empty() {
        Vec::new()
    } else {
        query_with_retry(&gateway, &channels, &platforms, &no_deps_specs, false)
            .await
            .map_err(|e| report(&*handler, env_name, e))?
    };

    let record_count: usize = repo_data.iter().map(|r| r.len()).sum();
    handler.on_progress(
        env_name,
        ProvisionPhase::RepodataComplete {
            record_count,
            elapsed_ms: repodata_start.elapsed().as_millis() as u64,
        },
    );

    let virtual_packages = rattler_virtual_packages::VirtualPackage::detect(
        &rattler_virtual_packages::VirtualPackageOverrides::default(),
    )?
    .iter()
    .map(|vpkg| GenericVirtualPackage::from(vpkg.clone()))
    .collect::<Vec<_>>();

    handler.on_progress(
        env_name,
        ProvisionPhase::Solving {
            spec_count: specs.len(),
        },
    );
    let solve_start = Instant::now();
    let solver_task = SolverTask {
        virtual_packages,
        specs,
        ..SolverTask::from_iter(&repo_data)
    };
    let mut records = resolvo::Solver
        .solve(solver_task)
        .map_err(|e| {
            report(
                &*handler,
                env_name,
                anyhow!("Failed to solve dependencies: {}", e),
            )
        })?
        .records;

    for spec in &no_deps_specs {
        let record = latest_match(&extra_data, spec).ok_or_else(|| {
            report(
                &*handler,
                env_name,
                anyhow!("No package matches {}", spec),
            )
        })?;
        if !records
            .iter()
            .any(|r| r.package_record.name == record.package_record.name)
        {
            records.push(record);
        }
    }

    handler.on_progress(
        env_name,
        ProvisionPhase::SolveComplete {
            package_count: records.len(),
            elapsed_ms: solve_start.elapsed().as_millis() as u64,
        },
    );

    handler.on_progress(
        env_name,
        ProvisionPhase::Installing {
            total: records.len(),
        },
    );
    let install_start = Instant::now();
    Installer::new()
        .with_download_client(download_client)
        .with_target_platform(install_platform)
        .with_reporter(InstallReporter::new(env_name, handler.clone()))
        .install(prefix, records)
        .await
        .map_err(|e| {
            report(
                &*handler,
                env_name,
                anyhow!("Failed to install packages: {}", e),
            )
        })?;

    let elapsed = install_start.elapsed();
    info!("[provision] Installed conda packages into {:?} in {:?}", prefix, elapsed);
    handler.on_progress(
        env_name,
        ProvisionPhase::InstallComplete {
            elapsed_ms: elapsed.as_millis() as u64,
        },
    );
    Ok(())
}

fn report(handler: &dyn ProgressHandler, env_name: &str, err: anyhow::Error) -> anyhow::Error {
    handler.on_progress(
        env_name,
        ProvisionPhase::Error {
            message: err.to_string(),
        },
    );
    err
}

/// Server errors and dropped connections are worth another attempt.
fn is_retryable(message: &str) -> bool {
    ["500", "502", "503", "504", "timeout", "connection"]
        .iter()
        .any(|needle| message.contains(needle))
}

async fn query_with_retry(
    gateway: &Gateway,
    channels: &[Channel],
    platforms: &[Platform],
    specs: &[MatchSpec],
    recursive: bool,
) -> Result<Vec<RepoData>> {
    let mut attempt = 0;
    loop {
        match gateway
            .query(channels.to_vec(), platforms.to_vec(), specs.to_vec())
            .recursive(recursive)
            .await
        {
            Ok(data) => return Ok(data),
            Err(e) => {
                let message = e.to_string();
                attempt += 1;
                if !is_retryable(&message) || attempt >= MAX_RETRIES {
                    return Err(anyhow!("Failed to fetch package metadata: {}", message));
                }
                let delay_ms = INITIAL_DELAY_MS * (1 << (attempt - 1));
                info!(
                    "[provision] Transient repodata error (attempt {}/{}), retrying in {}ms: {}",
                    attempt, MAX_RETRIES, delay_ms, message
                );
                tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
            }
        }
    }
}

fn latest_match(repo_data: &[RepoData], spec: &MatchSpec) -> Option<RepoDataRecord> {
    repo_data
        .iter()
        .flat_map(|r| r.iter())
        .filter(|record| spec.matches(&record.package_record))
        .max_by(|a, b| a.package_record.version.cmp(&b.package_record.version))
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_python_spec() {
        assert_eq!(python_spec(Some("3.11")), "python=3.11");
        assert_eq!(python_spec(Some(">=3.10")), "python>=3.10");
        assert_eq!(python_spec(None), "python>=3.9");
    }

    #[test]
    fn test_python_spec_parses_strictly() {
        for constraint in [Some("3.11"), Some(">=3.10"), None] {
            let spec = python_spec(constraint);
            assert!(MatchSpec::from_str(&spec, ParseMatchSpecOptions::strict()).is_ok());
        }
    }

    #[test]
    fn test_retryable_errors() {
        assert!(is_retryable("HTTP status server error (503 Service Unavailable)"));
        assert!(is_retryable("operation timeout"));
        assert!(!is_retryable("404 Not Found"));
    }
}
