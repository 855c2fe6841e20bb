//! Seams to the two external controllers: the container runtime and the
//! traffic-shaping tool. Every call is independent; the scheduler owns
//! timeouts and error localisation.

use std::future::Future;
use std::path::Path;
use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use fogagent_core::model::LiveRules;
use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("{0}: not found")]
    NotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("backend error: {0}")]
    Backend(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("malformed output: {0}")]
    Malformed(String),
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Full shaping rule for one interface. Absent attributes are left out of the
/// command line entirely.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShapingRule {
    pub bandwidth: Option<String>,
    pub delay: Option<String>,
    pub loss: Option<String>,
}

impl ShapingRule {
    pub fn is_empty(&self) -> bool {
        self.bandwidth.is_none() && self.delay.is_none() && self.loss.is_none()
    }
}

/// Container runtime operations on a named workload.
#[async_trait]
pub trait ResourceController: Send + Sync {
    async fn set_cpu_shares(&self, workload: &str, shares: u64) -> Result<(), ControllerError>;
    async fn set_memory_limit(&self, workload: &str, limit: &str) -> Result<(), ControllerError>;
    async fn connect(&self, network: &str, workload: &str) -> Result<(), ControllerError>;
    async fn disconnect(&self, network: &str, workload: &str) -> Result<(), ControllerError>;
}

/// Traffic-shaping operations on a named interface.
#[async_trait]
pub trait ShapingController: Send + Sync {
    /// Replaces the interface's rule with `rule`.
    async fn apply(&self, interface: &str, rule: &ShapingRule) -> Result<(), ControllerError>;
    async fn enable(&self, interface: &str) -> Result<(), ControllerError>;
    async fn disable(&self, interface: &str) -> Result<(), ControllerError>;
    /// Human-readable rule dump, for logs only.
    async fn show_rules(&self, interface: &str) -> Result<String, ControllerError>;
    async fn read_live_rules(&self, interface: &str) -> Result<LiveRules, ControllerError>;
    /// Drops every rule on the interface.
    async fn reset(&self, interface: &str) -> Result<(), ControllerError>;
}

/// Runs `fut`, turning expiry of `limit` into [`ControllerError::Timeout`].
pub async fn bounded<T, F>(limit: Duration, fut: F) -> Result<T, ControllerError>
where
    F: Future<Output = Result<T, ControllerError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res,
        Err(_) => Err(ControllerError::Timeout(limit)),
    }
}

/// Spawns an external tool and collects its output. The child is killed if
/// the returned future is dropped (e.g. by [`bounded`]).
pub(crate) async fn run_tool<I, S>(program: &Path, args: I) -> Result<Output, ControllerError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<std::ffi::OsStr>,
{
    Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| ControllerError::Spawn {
            program: program.display().to_string(),
            source,
        })
}

/// Maps a failed tool invocation onto the error taxonomy.
pub(crate) fn classify_failure(target: &str, output: &Output) -> ControllerError {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let msg = stderr.trim();
    let lower = msg.to_ascii_lowercase();

    if lower.contains("no such container")
        || lower.contains("no such network")
        || lower.contains("cannot find device")
        || lower.contains("not found")
    {
        ControllerError::NotFound(target.to_string())
    } else if lower.contains("not permitted") || lower.contains("permission denied") {
        ControllerError::PermissionDenied(target.to_string())
    } else if msg.is_empty() {
        ControllerError::Backend(format!("{target}: exited with {}", output.status))
    } else {
        ControllerError::Backend(format!("{target}: {msg}"))
    }
}
