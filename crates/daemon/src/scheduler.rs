//! Fires batches of timed actions and records a stage report once each batch
//! has settled.
//!
//! Every batch runs as its own task on the shared tokio timer; inside it each
//! action gets its own timed subtask, so a slow controller call only delays
//! the action that made it. Batches never share timing state and may overlap
//! freely. Writes to the same target are serialised through the tracker's
//! per-target lock.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fogagent_core::model::{
    Action, Batch, Change, ConnectionState, InterfaceChange, TargetKind, TargetStatus,
    WorkloadChange,
};
use fogagent_core::{now_ms, EpochMs};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::controller::{
    bounded, ControllerError, ResourceController, ShapingController, ShapingRule,
};
use crate::reports::StageReportStore;
use crate::status::StatusTracker;

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    resources: Arc<dyn ResourceController>,
    shaping: Arc<dyn ShapingController>,
    tracker: Arc<StatusTracker>,
    reports: Arc<StageReportStore>,
    settle: Duration,
    call_timeout: Duration,
    in_flight: AtomicUsize,
}

/// Receipt for a scheduled batch.
pub struct BatchHandle {
    pub batch_id: String,
    pub kind: TargetKind,
    pub actions: usize,
    /// When the snapshot becomes due (ms epoch).
    pub horizon_ms: EpochMs,
    join: JoinHandle<u64>,
}

impl BatchHandle {
    /// Waits for the batch to settle and returns its stage id.
    pub async fn stage(self) -> Result<u64, JoinError> {
        self.join.await
    }
}

/// Decrements the in-flight counter however the batch task ends.
struct InFlight(Arc<Inner>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Scheduler {
    pub fn new(
        resources: Arc<dyn ResourceController>,
        shaping: Arc<dyn ShapingController>,
        tracker: Arc<StatusTracker>,
        reports: Arc<StageReportStore>,
        settle: Duration,
        call_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                resources,
                shaping,
                tracker,
                reports,
                settle,
                call_timeout,
                in_flight: AtomicUsize::new(0),
            }),
        }
    }

    /// Batches whose stage report has not been appended yet.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Schedules every action of `batch` and returns without waiting for any
    /// of them. Actions already due fire immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit(&self, batch: Batch) -> BatchHandle {
        let kind = batch.kind();
        let latest_ms = batch.latest_ms();
        let (batch_id, actions) = batch.into_parts();
        let count = actions.len();

        let now = Instant::now();
        let wall = now_ms();
        let timed: Vec<(Instant, Action)> = actions
            .into_iter()
            .map(|a| (deadline(a.scheduled_at_ms, wall, now), a))
            .collect();
        let horizon = later(deadline(latest_ms, wall, now), self.inner.settle);
        let settle_ms = i64::try_from(self.inner.settle.as_millis()).unwrap_or(i64::MAX);
        let horizon_ms = latest_ms.max(wall).saturating_add(settle_ms);

        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = InFlight(Arc::clone(&self.inner));

        info!(batch = %batch_id, %kind, actions = count, horizon_ms, "batch scheduled");

        let inner = Arc::clone(&self.inner);
        let id = batch_id.clone();
        let join = tokio::spawn(async move {
            let _guard = guard;
            inner.run_batch(id, timed, horizon).await
        });

        BatchHandle {
            batch_id,
            kind,
            actions: count,
            horizon_ms,
            join,
        }
    }
}

/// Timers never wait longer than this; later instants are clamped to it.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

fn later(base: Instant, by: Duration) -> Instant {
    base.checked_add(by)
        .unwrap_or_else(|| base + FAR_FUTURE.min(by))
}

/// Converts an epoch deadline into a timer instant. Past deadlines map to now.
fn deadline(at_ms: EpochMs, wall_ms: EpochMs, now: Instant) -> Instant {
    let delay = at_ms.saturating_sub(wall_ms);
    if delay <= 0 {
        now
    } else {
        later(now, Duration::from_millis(delay as u64).min(FAR_FUTURE))
    }
}

impl Inner {
    async fn run_batch(
        self: Arc<Self>,
        batch_id: String,
        actions: Vec<(Instant, Action)>,
        horizon: Instant,
    ) -> u64 {
        let mut tasks = JoinSet::new();
        for (at, action) in actions {
            let this = Arc::clone(&self);
            let batch = batch_id.clone();
            tasks.spawn(async move {
                sleep_until(at).await;
                this.fire(&batch, action).await;
            });
        }

        // The snapshot must observe every action of this batch, even one whose
        // controller call outlived the horizon.
        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                error!(batch = %batch_id, error = %e, "action task aborted");
            }
        }
        sleep_until(horizon).await;

        let snapshot = self.tracker.snapshot().await;
        let stage = self.reports.append(&batch_id, snapshot);
        info!(batch = %batch_id, stage, "stage report appended");
        stage
    }

    async fn fire(&self, batch_id: &str, action: Action) {
        let Action {
            scheduled_at_ms,
            target,
            change,
        } = action;
        debug!(
            batch = %batch_id,
            target_id = %target,
            late_ms = now_ms().saturating_sub(scheduled_at_ms),
            "firing action"
        );

        if change.is_empty() {
            self.tracker.get_or_create(&target);
            debug!(batch = %batch_id, target_id = %target, "action carries no attributes");
            return;
        }

        match change {
            Change::Workload(c) => self.apply_workload(&target, c).await,
            Change::Interface(c) => self.apply_interface(&target, c).await,
        }
    }

    async fn call<T>(
        &self,
        fut: impl Future<Output = Result<T, ControllerError>>,
    ) -> Result<T, ControllerError> {
        bounded(self.call_timeout, fut).await
    }

    async fn apply_workload(&self, target: &str, change: WorkloadChange) {
        let _lock = self.tracker.lock_target(target).await;
        self.tracker.get_or_create(target);

        if let Some(shares) = change.cpu_shares {
            match self.call(self.resources.set_cpu_shares(target, shares)).await {
                Ok(()) => {
                    self.tracker.set_cpu_shares(target, shares);
                    info!(target_id = %target, shares, "cpu shares updated");
                }
                Err(e) => warn!(target_id = %target, error = %e, "cpu shares update failed"),
            }
        }

        if let Some(limit) = &change.memory_limit {
            match self.call(self.resources.set_memory_limit(target, limit)).await {
                Ok(()) => {
                    self.tracker.set_memory_limit(target, limit);
                    info!(target_id = %target, limit = %limit, "memory limit updated");
                }
                Err(e) => warn!(target_id = %target, error = %e, "memory limit update failed"),
            }
        }

        for (network, state) in &change.networks {
            let res = match state {
                ConnectionState::Connected => {
                    self.call(self.resources.connect(network, target)).await
                }
                ConnectionState::Disconnected => {
                    self.call(self.resources.disconnect(network, target)).await
                }
            };
            match res {
                Ok(()) => {
                    self.tracker.set_connection(target, network, *state);
                    info!(target_id = %target, network = %network, ?state, "network membership updated");
                }
                Err(e) => {
                    warn!(target_id = %target, network = %network, error = %e, "network membership update failed")
                }
            }
        }
    }

    async fn apply_interface(&self, target: &str, change: InterfaceChange) {
        let _lock = self.tracker.lock_target(target).await;
        let believed = self.tracker.get_or_create(target);

        if change.touches_rules() {
            let rule = merged_rule(&believed, &change);
            match self.call(self.shaping.apply(target, &rule)).await {
                Ok(()) => {
                    if let Some(v) = &change.bandwidth {
                        self.tracker.set_bandwidth(target, v);
                    }
                    if let Some(v) = &change.delay {
                        self.tracker.set_latency(target, v);
                    }
                    if let Some(v) = &change.loss {
                        self.tracker.set_packet_loss(target, v);
                    }
                    info!(target_id = %target, ?rule, "shaping rule applied");
                }
                Err(e) => warn!(target_id = %target, error = %e, "shaping update failed"),
            }
        }

        if let Some(active) = change.active {
            let res = if active {
                self.call(self.shaping.enable(target)).await
            } else {
                self.call(self.shaping.disable(target)).await
            };
            match res {
                Ok(()) => {
                    self.tracker.set_active(target, active);
                    info!(target_id = %target, active, "link state updated");
                }
                Err(e) => warn!(target_id = %target, active, error = %e, "link state update failed"),
            }
        }

        match self.call(self.shaping.show_rules(target)).await {
            Ok(rules) => debug!(target_id = %target, rules = %rules.trim(), "current shaping rules"),
            Err(e) => debug!(target_id = %target, error = %e, "could not list shaping rules"),
        }
    }
}

/// The believed rule with the change laid over it. The shaping tool replaces
/// whole rules, so attributes set by earlier actions must be resent.
fn merged_rule(believed: &TargetStatus, change: &InterfaceChange) -> ShapingRule {
    fn known(v: &str) -> Option<String> {
        (!v.is_empty()).then(|| v.to_string())
    }
    ShapingRule {
        bandwidth: change
            .bandwidth
            .clone()
            .or_else(|| known(&believed.bandwidth)),
        delay: change.delay.clone().or_else(|| known(&believed.latency)),
        loss: change.loss.clone().or_else(|| known(&believed.packet_loss)),
    }
}
