//! pip package installation through `uv pip install`.

use anyhow::{anyhow, Result};
use std::path::Path;
use std::process::Stdio;

use crate::progress::{ProgressHandler, ProvisionPhase};

/// Install `packages` into the interpreter at `python`.
pub async fn install(
    env_name: &str,
    uv: &Path,
    python: &Path,
    packages: &[String],
    no_deps: bool,
    handler: &dyn ProgressHandler,
) -> Result<()> {
    if packages.is_empty() {
        return Ok(());
    }
    handler.on_progress(
        env_name,
        ProvisionPhase::InstallingPip {
            packages: packages.to_vec(),
            no_deps,
        },
    );

    let output = tokio::process::Command::new(uv)
        .args(install_args(python, packages, no_deps))
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let message = format!("Failed to install pip packages: {}", stderr.trim());
        handler.on_progress(
            env_name,
            ProvisionPhase::Error {
                message: message.clone(),
            },
        );
        return Err(anyhow!(message));
    }
    Ok(())
}

fn install_args(python: &Path, packages: &[String], no_deps: bool) -> Vec<String> {
    let mut args = vec![
        "pip".to_string(),
        "install".to_string(),
        "--python".to_string(),
        python.to_string_lossy().to_string(),
    ];
    if no_deps {
        args.push("--no-deps".to_string());
    }
    args.extend(packages.iter().cloned());
    args
}
