use std::path::PathBuf;

use async_trait::async_trait;
use fogagent_core::model::LiveRules;
use serde_json::Value;

use crate::config::ToolPaths;
use crate::controller::{
    classify_failure, run_tool, ControllerError, ShapingController, ShapingRule,
};

/// [`ShapingController`] backed by tcconfig (`tcset`/`tcshow`/`tcdel`) and
/// iproute2 (`ip link`).
pub struct TcCli {
    tcset: PathBuf,
    tcshow: PathBuf,
    tcdel: PathBuf,
    ip: PathBuf,
}

impl TcCli {
    pub fn new(tools: &ToolPaths) -> Self {
        Self {
            tcset: tools.tcset.clone(),
            tcshow: tools.tcshow.clone(),
            tcdel: tools.tcdel.clone(),
            ip: tools.ip.clone(),
        }
    }

    async fn link(&self, interface: &str, state: &str) -> Result<(), ControllerError> {
        let out = run_tool(&self.ip, ["link", "set", interface, state]).await?;
        if out.status.success() {
            return Ok(());
        }
        match classify_failure(interface, &out) {
            // `ip link` without CAP_NET_ADMIN reports all sorts of things.
            ControllerError::Backend(_) => Err(ControllerError::PermissionDenied(interface.into())),
            other => Err(other),
        }
    }

    async fn tcshow(&self, interface: &str) -> Result<String, ControllerError> {
        let out = run_tool(&self.tcshow, [interface]).await?;
        if !out.status.success() {
            return Err(classify_failure(interface, &out));
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }
}

#[async_trait]
impl ShapingController for TcCli {
    async fn apply(&self, interface: &str, rule: &ShapingRule) -> Result<(), ControllerError> {
        if rule.is_empty() {
            return Ok(());
        }
        let out = run_tool(&self.tcset, tcset_args(interface, rule)).await?;
        if out.status.success() {
            Ok(())
        } else {
            Err(classify_failure(interface, &out))
        }
    }

    async fn enable(&self, interface: &str) -> Result<(), ControllerError> {
        self.link(interface, "up").await
    }

    async fn disable(&self, interface: &str) -> Result<(), ControllerError> {
        self.link(interface, "down").await
    }

    async fn show_rules(&self, interface: &str) -> Result<String, ControllerError> {
        self.tcshow(interface).await
    }

    async fn read_live_rules(&self, interface: &str) -> Result<LiveRules, ControllerError> {
        let raw = self.tcshow(interface).await?;
        parse_tcshow(interface, &raw)
    }

    async fn reset(&self, interface: &str) -> Result<(), ControllerError> {
        let out = run_tool(&self.tcdel, [interface, "--all"]).await?;
        if out.status.success() {
            Ok(())
        } else {
            Err(classify_failure(interface, &out))
        }
    }
}

/// `--overwrite` replaces the whole rule, so callers pass the merged rule.
fn tcset_args(interface: &str, rule: &ShapingRule) -> Vec<String> {
    let mut args = vec![interface.to_string()];
    if let Some(rate) = &rule.bandwidth {
        args.extend(["--rate".into(), rate.clone()]);
    }
    if let Some(delay) = &rule.delay {
        args.extend(["--delay".into(), delay.clone()]);
    }
    if let Some(loss) = &rule.loss {
        args.extend(["--loss".into(), loss.clone()]);
    }
    args.push("--overwrite".into());
    args
}

/// Reads the outgoing rules from `tcshow` JSON:
///
/// ```json
/// {"docker0": {"outgoing": {"protocol=ip": {"delay": "10.0ms", "loss": "0.01%", "rate": "250Kbps"}}, "incoming": {}}}
/// ```
///
/// When several outgoing filters exist the last one listed wins.
fn parse_tcshow(interface: &str, raw: &str) -> Result<LiveRules, ControllerError> {
    let doc: Value =
        serde_json::from_str(raw).map_err(|e| ControllerError::Malformed(e.to_string()))?;
    let outgoing = doc
        .get(interface)
        .and_then(|v| v.get("outgoing"))
        .and_then(Value::as_object)
        .ok_or_else(|| ControllerError::Malformed(format!("no outgoing rules for {interface}")))?;

    let mut live = LiveRules::default();
    for filter in outgoing.values() {
        if let Some(v) = filter.get("delay").and_then(Value::as_str) {
            live.delay = Some(v.to_string());
        }
        if let Some(v) = filter.get("loss").and_then(Value::as_str) {
            live.loss = Some(v.to_string());
        }
        if let Some(v) = filter.get("rate").and_then(Value::as_str) {
            live.bandwidth = Some(v.to_string());
        }
    }
    Ok(live)
}
