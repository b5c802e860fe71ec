//! Helper tool bootstrapping.
//!
//! `uv` is taken from `PATH` when present; otherwise it is installed from
//! conda-forge into `<root>/tools/uv-<hash>` and reused from there.

use anyhow::{anyhow, Result};
use log::info;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::conda::{self, CondaRequest};
use crate::progress::{ProgressHandler, ProvisionPhase};

/// Path of an executable inside an installed prefix.
pub fn binary_path_for_env(env_path: &Path, tool_name: &str) -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        env_path.join("Scripts").join(format!("{}.exe", tool_name))
    }
    #[cfg(not(target_os = "windows"))]
    {
        env_path.join("bin").join(tool_name)
    }
}

/// Python interpreter of an installed prefix.
pub fn python_path_for_env(env_path: &Path) -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        env_path.join("python.exe")
    }
    #[cfg(not(target_os = "windows"))]
    {
        env_path.join("bin").join("python")
    }
}

fn tool_hash(tool_name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tool_name.as_bytes());
    hasher.update(rattler_conda_types::Platform::current().to_string().as_bytes());
    hex::encode(hasher.finalize())[..12].to_string()
}

/// Where a bootstrapped tool lives under `tools_dir`.
pub fn cached_tool_path(tools_dir: &Path, tool_name: &str) -> PathBuf {
    let env_path = tools_dir.join(format!("{}-{}", tool_name, tool_hash(tool_name)));
    binary_path_for_env(&env_path, tool_name)
}

/// Whether `program --version` runs successfully.
pub async fn on_path(program: &str) -> bool {
    match tokio::process::Command::new(program)
        .arg("--version")
        .output()
        .await
    {
        Ok(output) => output.status.success(),
        Err(_) => false,
    }
}

/// Install `tool_name` from conda-forge into `tools_dir`, or return the
/// cached binary.
pub async fn bootstrap_tool(
    tools_dir: &Path,
    tool_name: &str,
    handler: Arc<dyn ProgressHandler>,
) -> Result<PathBuf> {
    let env_path = tools_dir.join(format!("{}-{}", tool_name, tool_hash(tool_name)));
    let binary_path = binary_path_for_env(&env_path, tool_name);

    if binary_path.exists() {
        info!("[provision] Using cached {} at {:?}", tool_name, binary_path);
        return Ok(binary_path);
    }

    handler.on_progress(
        tool_name,
        ProvisionPhase::BootstrappingTool {
            tool: tool_name.to_string(),
        },
    );
    tokio::fs::create_dir_all(tools_dir).await?;
    if env_path.exists() {
        tokio::fs::remove_dir_all(&env_path).await?;
    }

    let request = CondaRequest {
        channels: vec![conda::DEFAULT_CHANNEL.to_string()],
        specs: vec![tool_name.to_string()],
        no_deps: Vec::new(),
    };
    conda::install(tool_name, &env_path, &request, handler).await?;

    if !binary_path.exists() {
        return Err(anyhow!(
            "{} was installed but its binary is missing at {:?}",
            tool_name,
            binary_path
        ));
    }
    info!("[provision] Bootstrapped {} at {:?}", tool_name, binary_path);
    Ok(binary_path)
}
