//! In-memory controllers for exercising the agent without docker or tc.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fogagent_core::model::LiveRules;
use fogagent_daemon::api::AppState;
use fogagent_daemon::config::AgentConfig;
use fogagent_daemon::controller::{
    ControllerError, ResourceController, ShapingController, ShapingRule,
};

#[derive(Default)]
pub struct FakeResources {
    calls: Mutex<Vec<String>>,
    missing: HashSet<String>,
    delay: Option<Duration>,
}

impl FakeResources {
    /// Workloads in `missing` answer every call with `NotFound`.
    pub fn with_missing(missing: &[&str]) -> Self {
        Self {
            missing: missing.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    /// Every call takes `delay` before answering.
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    async fn record(&self, workload: &str, call: String) -> Result<(), ControllerError> {
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        self.calls.lock().unwrap().push(call);
        if self.missing.contains(workload) {
            return Err(ControllerError::NotFound(workload.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ResourceController for FakeResources {
    async fn set_cpu_shares(&self, workload: &str, shares: u64) -> Result<(), ControllerError> {
        self.record(workload, format!("cpu {workload} {shares}")).await
    }

    async fn set_memory_limit(&self, workload: &str, limit: &str) -> Result<(), ControllerError> {
        self.record(workload, format!("memory {workload} {limit}")).await
    }

    async fn connect(&self, network: &str, workload: &str) -> Result<(), ControllerError> {
        self.record(workload, format!("connect {network} {workload}")).await
    }

    async fn disconnect(&self, network: &str, workload: &str) -> Result<(), ControllerError> {
        self.record(workload, format!("disconnect {network} {workload}"))
            .await
    }
}

#[derive(Default)]
pub struct FakeShaping {
    calls: Mutex<Vec<String>>,
    rules: Mutex<HashMap<String, ShapingRule>>,
    live: Mutex<HashMap<String, LiveRules>>,
    deny_link: bool,
}

impl FakeShaping {
    /// `enable`/`disable` fail with `PermissionDenied`.
    pub fn without_link_permission() -> Self {
        Self {
            deny_link: true,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Last rule applied to `interface`.
    pub fn rule(&self, interface: &str) -> Option<ShapingRule> {
        self.rules.lock().unwrap().get(interface).cloned()
    }

    /// What `read_live_rules` reports for `interface`; unknown interfaces fail.
    pub fn set_live(&self, interface: &str, live: LiveRules) {
        self.live
            .lock()
            .unwrap()
            .insert(interface.to_string(), live);
    }

    /// Makes later `read_live_rules` calls for `interface` fail.
    pub fn clear_live(&self, interface: &str) {
        self.live.lock().unwrap().remove(interface);
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ShapingController for FakeShaping {
    async fn apply(&self, interface: &str, rule: &ShapingRule) -> Result<(), ControllerError> {
        self.record(format!("apply {interface}"));
        self.rules
            .lock()
            .unwrap()
            .insert(interface.to_string(), rule.clone());
        Ok(())
    }

    async fn enable(&self, interface: &str) -> Result<(), ControllerError> {
        self.record(format!("enable {interface}"));
        if self.deny_link {
            return Err(ControllerError::PermissionDenied(interface.to_string()));
        }
        Ok(())
    }

    async fn disable(&self, interface: &str) -> Result<(), ControllerError> {
        self.record(format!("disable {interface}"));
        if self.deny_link {
            return Err(ControllerError::PermissionDenied(interface.to_string()));
        }
        Ok(())
    }

    async fn show_rules(&self, interface: &str) -> Result<String, ControllerError> {
        Ok(format!("{:?}", self.rule(interface)))
    }

    async fn read_live_rules(&self, interface: &str) -> Result<LiveRules, ControllerError> {
        self.live
            .lock()
            .unwrap()
            .get(interface)
            .cloned()
            .ok_or_else(|| ControllerError::Malformed(format!("no rules for {interface}")))
    }

    async fn reset(&self, interface: &str) -> Result<(), ControllerError> {
        self.record(format!("reset {interface}"));
        self.rules.lock().unwrap().remove(interface);
        Ok(())
    }
}

pub struct TestAgent {
    pub state: AppState,
    pub resources: Arc<FakeResources>,
    pub shaping: Arc<FakeShaping>,
}

pub fn test_config() -> AgentConfig {
    AgentConfig {
        settle: Duration::from_millis(20),
        controller_timeout: Duration::from_millis(500),
        tracked: vec![],
        ..Default::default()
    }
}

impl TestAgent {
    pub fn new() -> Self {
        Self::with(test_config(), FakeResources::default(), FakeShaping::default())
    }

    pub fn with(config: AgentConfig, resources: FakeResources, shaping: FakeShaping) -> Self {
        let resources = Arc::new(resources);
        let shaping = Arc::new(shaping);
        let state = AppState::new(config, resources.clone(), shaping.clone());
        Self {
            state,
            resources,
            shaping,
        }
    }
}
