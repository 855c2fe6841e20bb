use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use fogagent_core::model::{
    Action, Batch, Change, ConnectionState, InterfaceChange, LiveRules, TargetKind,
    TargetStatus, WorkloadChange,
};
use fogagent_core::now_ms;
use fogagent_daemon::controller::ShapingRule;

mod common;
use common::{test_config, FakeResources, FakeShaping, TestAgent};

fn workload(at: i64, name: &str, change: WorkloadChange) -> Action {
    Action {
        scheduled_at_ms: at,
        target: name.into(),
        change: Change::Workload(change),
    }
}

fn interface(at: i64, id: &str, change: InterfaceChange) -> Action {
    Action {
        scheduled_at_ms: at,
        target: id.into(),
        change: Change::Interface(change),
    }
}

fn cpu(shares: u64) -> WorkloadChange {
    WorkloadChange {
        cpu_shares: Some(shares),
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn submit_does_not_wait_for_fire_time() {
    let agent = TestAgent::new();
    let batch = Batch::new(
        TargetKind::Workload,
        vec![workload(now_ms() + 10_000, "backend", cpu(512))],
    )
    .unwrap();

    let started = Instant::now();
    let handle = agent.state.scheduler.submit(batch);
    assert!(started.elapsed() < Duration::from_millis(200));

    assert_eq!(agent.state.scheduler.in_flight(), 1);
    assert!(agent.resources.calls().is_empty());
    assert!(agent.state.reports.is_empty());
    assert!(handle.horizon_ms >= now_ms() + 9_000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn workload_action_fires_at_its_time() {
    let agent = TestAgent::new();
    let batch = Batch::new(
        TargetKind::Workload,
        vec![workload(now_ms() + 100, "backend", cpu(512))],
    )
    .unwrap();
    let _handle = agent.state.scheduler.submit(batch);

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(agent.resources.calls().is_empty());

    tokio::time::sleep(Duration::from_millis(120)).await;
    let status = agent.state.tracker.get("backend").unwrap();
    assert_eq!(status.cpu_shares, 512);
    assert_eq!(agent.resources.calls(), vec!["cpu backend 512"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn past_actions_fire_immediately() {
    let agent = TestAgent::new();
    let batch = Batch::new(
        TargetKind::Workload,
        vec![workload(now_ms() - 60_000, "backend", cpu(128))],
    )
    .unwrap();
    let stage = agent.state.scheduler.submit(batch).stage().await.unwrap();

    assert_eq!(stage, 0);
    assert_eq!(agent.state.tracker.get("backend").unwrap().cpu_shares, 128);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn snapshot_is_taken_after_latest_action() {
    let agent = TestAgent::new();
    let base = now_ms();
    let latest = base + 120;
    let batch = Batch::new(
        TargetKind::Workload,
        vec![
            workload(latest, "backend", cpu(700)),
            workload(base + 50, "backend", cpu(300)),
        ],
    )
    .unwrap();

    let stage = agent.state.scheduler.submit(batch).stage().await.unwrap();
    let report = agent.state.reports.get(stage).unwrap();

    assert!(report.snapshot.captured_at_ms > latest);
    assert!(report.snapshot.captured_at_ms >= latest + 20);
    // The later action wins regardless of submission order.
    assert_eq!(report.snapshot.targets["backend"].cpu_shares, 700);
    assert_eq!(agent.state.scheduler.in_flight(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overlapping_batches_get_gapless_stages() {
    let agent = TestAgent::new();
    let at = now_ms() + 50;

    let handles: Vec<_> = (0..12u64)
        .map(|i| {
            let batch = Batch::new(
                TargetKind::Workload,
                vec![workload(at, &format!("w{i}"), cpu(i + 1))],
            )
            .unwrap();
            agent.state.scheduler.submit(batch)
        })
        .collect();

    let mut stages = BTreeSet::new();
    for h in handles {
        stages.insert(h.stage().await.unwrap());
    }
    assert_eq!(stages, (0..12).collect());
    assert_eq!(agent.state.reports.len(), 12);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_workload_does_not_stop_the_batch() {
    let agent = TestAgent::with(
        test_config(),
        FakeResources::with_missing(&["ghost"]),
        FakeShaping::default(),
    );
    let base = now_ms();
    let batch = Batch::new(
        TargetKind::Workload,
        vec![
            workload(
                base + 10,
                "ghost",
                WorkloadChange {
                    cpu_shares: Some(256),
                    memory_limit: Some("128m".into()),
                    ..Default::default()
                },
            ),
            workload(base + 40, "backend", cpu(512)),
        ],
    )
    .unwrap();

    let stage = agent.state.scheduler.submit(batch).stage().await.unwrap();
    let report = agent.state.reports.get(stage).unwrap();

    // Both calls on the missing workload were attempted independently.
    let calls = agent.resources.calls();
    assert!(calls.contains(&"cpu ghost 256".to_string()));
    assert!(calls.contains(&"memory ghost 128m".to_string()));
    assert!(calls.contains(&"cpu backend 512".to_string()));

    assert_eq!(report.snapshot.targets["backend"].cpu_shares, 512);
    let ghost = &report.snapshot.targets["ghost"];
    assert_eq!(ghost.cpu_shares, 0);
    assert!(ghost.memory_limit.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn hung_controller_call_times_out() {
    let config = fogagent_daemon::config::AgentConfig {
        controller_timeout: Duration::from_millis(50),
        ..test_config()
    };
    let agent = TestAgent::with(
        config,
        FakeResources::slow(Duration::from_secs(5)),
        FakeShaping::default(),
    );
    let batch = Batch::new(
        TargetKind::Workload,
        vec![workload(now_ms(), "backend", cpu(999))],
    )
    .unwrap();

    let started = Instant::now();
    let stage = agent.state.scheduler.submit(batch).stage().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));

    let report = agent.state.reports.get(stage).unwrap();
    assert_eq!(report.snapshot.targets["backend"].cpu_shares, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn same_time_interface_actions_both_land() {
    let agent = TestAgent::new();
    let at = now_ms() + 30;
    let batch = Batch::new(
        TargetKind::Interface,
        vec![
            interface(
                at,
                "eth0",
                InterfaceChange {
                    bandwidth: Some("10Mbps".into()),
                    ..Default::default()
                },
            ),
            interface(
                at,
                "eth0",
                InterfaceChange {
                    delay: Some("10ms".into()),
                    ..Default::default()
                },
            ),
        ],
    )
    .unwrap();

    let stage = agent.state.scheduler.submit(batch).stage().await.unwrap();
    let eth0 = &agent.state.reports.get(stage).unwrap().snapshot.targets["eth0"];
    assert_eq!(eth0.bandwidth, "10Mbps");
    assert_eq!(eth0.latency, "10ms");

    // Whichever fired second resent the attribute set by the first.
    assert_eq!(
        agent.shaping.rule("eth0"),
        Some(ShapingRule {
            bandwidth: Some("10Mbps".into()),
            delay: Some("10ms".into()),
            loss: None,
        })
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn repeating_an_interface_action_is_idempotent() {
    let agent = TestAgent::new();
    let change = InterfaceChange {
        bandwidth: Some("1Mbps".into()),
        delay: Some("25ms".into()),
        loss: Some("0.5".into()),
        active: Some(true),
    };

    let once = Batch::new(
        TargetKind::Interface,
        vec![interface(now_ms(), "eth0", change.clone())],
    )
    .unwrap();
    agent.state.scheduler.submit(once).stage().await.unwrap();
    let after_once = agent.state.tracker.get("eth0").unwrap();

    let again = Batch::new(
        TargetKind::Interface,
        vec![interface(now_ms(), "eth0", change)],
    )
    .unwrap();
    agent.state.scheduler.submit(again).stage().await.unwrap();
    let after_twice = agent.state.tracker.get("eth0").unwrap();

    assert_eq!(after_once, after_twice);
    assert_eq!(after_twice.active, Some(true));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn link_toggle_failure_is_local() {
    let agent = TestAgent::with(
        test_config(),
        FakeResources::default(),
        FakeShaping::without_link_permission(),
    );
    let batch = Batch::new(
        TargetKind::Interface,
        vec![interface(
            now_ms(),
            "eth0",
            InterfaceChange {
                loss: Some("3".into()),
                active: Some(false),
                ..Default::default()
            },
        )],
    )
    .unwrap();

    agent.state.scheduler.submit(batch).stage().await.unwrap();
    let eth0 = agent.state.tracker.get("eth0").unwrap();
    assert_eq!(eth0.packet_loss, "3");
    assert_eq!(eth0.active, None);
    assert!(agent.shaping.calls().contains(&"disable eth0".to_string()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn network_membership_is_tracked() {
    let agent = TestAgent::new();
    let mut networks = std::collections::BTreeMap::new();
    networks.insert("fognet".to_string(), ConnectionState::Connected);
    networks.insert("bridge".to_string(), ConnectionState::Disconnected);
    let batch = Batch::new(
        TargetKind::Workload,
        vec![workload(
            now_ms(),
            "backend",
            WorkloadChange {
                networks,
                ..Default::default()
            },
        )],
    )
    .unwrap();

    agent.state.scheduler.submit(batch).stage().await.unwrap();
    let status = agent.state.tracker.get("backend").unwrap();
    assert_eq!(status.connection("fognet"), ConnectionState::Connected);
    assert_eq!(status.connection("bridge"), ConnectionState::Disconnected);
    assert_eq!(status.connection("other"), ConnectionState::Disconnected);

    let calls = agent.resources.calls();
    assert!(calls.contains(&"connect fognet backend".to_string()));
    assert!(calls.contains(&"disconnect bridge backend".to_string()));
}

#[tokio::test]
async fn stage_snapshot_picks_up_live_rules() {
    let agent = TestAgent::new();
    agent.shaping.set_live(
        "eth0",
        LiveRules {
            bandwidth: Some("250Kbps".into()),
            delay: Some("10.0ms".into()),
            loss: None,
        },
    );
    let batch = Batch::new(
        TargetKind::Interface,
        vec![interface(
            now_ms(),
            "eth0",
            InterfaceChange {
                loss: Some("1".into()),
                ..Default::default()
            },
        )],
    )
    .unwrap();

    let stage = agent.state.scheduler.submit(batch).stage().await.unwrap();
    let eth0 = &agent.state.reports.get(stage).unwrap().snapshot.targets["eth0"];
    assert_eq!(eth0.bandwidth, "250Kbps");
    assert_eq!(eth0.latency, "10.0ms");
    assert_eq!(eth0.packet_loss, "1");
}

#[tokio::test]
async fn failed_refresh_keeps_the_record() {
    let agent = TestAgent::new();
    let tracker = &agent.state.tracker;
    tracker.get_or_create("eth0");
    tracker.set_packet_loss("eth0", "2");
    tracker.set_active("eth0", true);
    agent.shaping.set_live(
        "eth0",
        LiveRules {
            bandwidth: Some("1Mbps".into()),
            delay: Some("40.0ms".into()),
            loss: None,
        },
    );

    tracker.refresh("eth0").await;
    let before = tracker.get("eth0").unwrap();
    assert_eq!(before.bandwidth, "1Mbps");
    assert_eq!(before.latency, "40.0ms");
    assert_eq!(before.packet_loss, "2");

    agent.shaping.clear_live("eth0");
    tracker.refresh("eth0").await;
    assert_eq!(tracker.get("eth0").unwrap(), before);

    let snapshot = tracker.snapshot().await;
    assert_eq!(snapshot.targets["eth0"], before);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn attribute_less_actions_only_register_the_target() {
    let agent = TestAgent::new();
    let workloads = Batch::new(
        TargetKind::Workload,
        vec![workload(now_ms(), "idle", WorkloadChange::default())],
    )
    .unwrap();
    let interfaces = Batch::new(
        TargetKind::Interface,
        vec![interface(now_ms(), "eth9", InterfaceChange::default())],
    )
    .unwrap();

    agent.state.scheduler.submit(workloads).stage().await.unwrap();
    agent.state.scheduler.submit(interfaces).stage().await.unwrap();

    assert!(agent.resources.calls().is_empty());
    assert!(agent.shaping.calls().is_empty());
    assert_eq!(agent.state.tracker.get("idle"), Some(TargetStatus::default()));
    assert_eq!(agent.state.tracker.get("eth9"), Some(TargetStatus::default()));
    assert_eq!(agent.state.reports.len(), 2);
}
