use std::path::PathBuf;

use async_trait::async_trait;

use crate::controller::{classify_failure, run_tool, ControllerError, ResourceController};

/// [`ResourceController`] backed by the `docker` CLI.
pub struct DockerCli {
    bin: PathBuf,
}

impl DockerCli {
    pub fn new(bin: impl Into<PathBuf>) -> Self {
        Self { bin: bin.into() }
    }

    async fn docker(&self, target: &str, args: &[&str]) -> Result<(), ControllerError> {
        let out = run_tool(&self.bin, args).await?;
        if out.status.success() {
            Ok(())
        } else {
            Err(classify_failure(target, &out))
        }
    }
}

#[async_trait]
impl ResourceController for DockerCli {
    async fn set_cpu_shares(&self, workload: &str, shares: u64) -> Result<(), ControllerError> {
        let shares = shares.to_string();
        self.docker(workload, &["update", "--cpu-shares", shares.as_str(), workload])
            .await
    }

    /// Swap is pinned to the memory limit so the ceiling is effective.
    async fn set_memory_limit(&self, workload: &str, limit: &str) -> Result<(), ControllerError> {
        self.docker(
            workload,
            &["update", "--memory", limit, "--memory-swap", limit, workload],
        )
        .await
    }

    async fn connect(&self, network: &str, workload: &str) -> Result<(), ControllerError> {
        self.docker(workload, &["network", "connect", network, workload])
            .await
    }

    async fn disconnect(&self, network: &str, workload: &str) -> Result<(), ControllerError> {
        self.docker(workload, &["network", "disconnect", network, workload])
            .await
    }
}
