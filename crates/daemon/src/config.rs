use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub listen: String,

    /// Wait after a batch's latest action before its snapshot is taken.
    pub settle: Duration,
    /// Upper bound for any single controller call.
    pub controller_timeout: Duration,

    /// Targets registered before the first batch arrives.
    pub tracked: Vec<String>,
    pub reset_on_start: bool,

    pub tools: ToolPaths,
}

/// External binaries driven by the controllers.
#[derive(Debug, Clone)]
pub struct ToolPaths {
    pub docker: PathBuf,
    pub tcset: PathBuf,
    pub tcshow: PathBuf,
    pub tcdel: PathBuf,
    pub ip: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            docker: "docker".into(),
            tcset: "tcset".into(),
            tcshow: "tcshow".into(),
            tcdel: "tcdel".into(),
            ip: "ip".into(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:20200".into(),
            settle: Duration::from_secs(1),
            controller_timeout: Duration::from_secs(10),
            tracked: vec!["docker0".into()],
            reset_on_start: false,
            tools: ToolPaths::default(),
        }
    }
}
