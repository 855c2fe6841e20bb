//! What the agent believes each workload and interface is configured as.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use fogagent_core::model::{ConnectionState, Snapshot, TargetStatus};
use fogagent_core::now_ms;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use crate::controller::{bounded, ShapingController};

/// Believed configuration of every target the agent has seen.
///
/// Records are created lazily and live for the whole process. Two locks are
/// involved: a short-lived map lock guarding the records, and one async lock
/// per target that callers hold across a controller round-trip so that
/// read-modify-write sequences on the same target never interleave.
pub struct StatusTracker {
    records: Mutex<BTreeMap<String, TargetStatus>>,
    target_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    shaping: Arc<dyn ShapingController>,
    refresh_timeout: Duration,
}

impl StatusTracker {
    pub fn new(shaping: Arc<dyn ShapingController>, refresh_timeout: Duration) -> Self {
        Self {
            records: Mutex::new(BTreeMap::new()),
            target_locks: Mutex::new(HashMap::new()),
            shaping,
            refresh_timeout,
        }
    }

    fn records(&self) -> MutexGuard<'_, BTreeMap<String, TargetStatus>> {
        // Records are plain values; a panicked writer cannot leave one half-built.
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the record for `target`, creating a zeroed one if needed.
    pub fn get_or_create(&self, target: &str) -> TargetStatus {
        self.records()
            .entry(target.to_string())
            .or_default()
            .clone()
    }

    pub fn get(&self, target: &str) -> Option<TargetStatus> {
        self.records().get(target).cloned()
    }

    /// Known target ids, sorted.
    pub fn targets(&self) -> Vec<String> {
        self.records().keys().cloned().collect()
    }

    /// Applies `f` to the record for `target`, creating it if needed.
    pub fn update(&self, target: &str, f: impl FnOnce(&mut TargetStatus)) {
        let mut records = self.records();
        f(records.entry(target.to_string()).or_default());
    }

    pub fn set_cpu_shares(&self, target: &str, shares: u64) {
        self.update(target, |s| s.cpu_shares = shares);
    }

    pub fn set_memory_limit(&self, target: &str, limit: &str) {
        self.update(target, |s| s.memory_limit = limit.to_string());
    }

    pub fn set_bandwidth(&self, target: &str, bandwidth: &str) {
        self.update(target, |s| s.bandwidth = bandwidth.to_string());
    }

    pub fn set_latency(&self, target: &str, latency: &str) {
        self.update(target, |s| s.latency = latency.to_string());
    }

    pub fn set_packet_loss(&self, target: &str, loss: &str) {
        self.update(target, |s| s.packet_loss = loss.to_string());
    }

    pub fn set_active(&self, target: &str, active: bool) {
        self.update(target, |s| s.active = Some(active));
    }

    pub fn set_connection(&self, target: &str, network: &str, state: ConnectionState) {
        self.update(target, |s| {
            s.connections.insert(network.to_string(), state);
        });
    }

    /// Exclusive access to `target` for the duration of a controller call.
    pub async fn lock_target(&self, target: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .target_locks
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(target.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    /// Pulls live shaping values for `target`. Any failure keeps the believed
    /// values untouched.
    pub async fn refresh(&self, target: &str) {
        let _guard = self.lock_target(target).await;
        match bounded(self.refresh_timeout, self.shaping.read_live_rules(target)).await {
            Ok(live) => self.update(target, |s| s.absorb_live(&live)),
            Err(e) => debug!(target_id = %target, error = %e, "live rules unavailable; keeping believed values"),
        }
    }

    /// Refreshes every known target, then copies all records.
    pub async fn snapshot(&self) -> Snapshot {
        for target in self.targets() {
            self.refresh(&target).await;
        }
        Snapshot {
            captured_at_ms: now_ms(),
            targets: self.records().clone(),
        }
    }
}
