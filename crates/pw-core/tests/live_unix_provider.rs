//! Unix provider against real child processes.
//!
//! Every test spawns its own children through `ProcessHarness` and never
//! touches processes it did not create.

#![cfg(unix)]

use pw_config::{DetectorSettings, KillSettings};
use pw_core::collect::ToolRunner;
use pw_core::detect::PlatformDetector;
use pw_core::provider::unix::UnixProvider;
use pw_core::provider::{KillMethod, KillOptions, ListOptions, ProcessControl};
use pw_core::test_utils::ProcessHarness;
use std::sync::Arc;
use std::time::Duration;

async fn live_provider() -> UnixProvider {
    let runner = Arc::new(ToolRunner::with_defaults());
    let detector = PlatformDetector::new(
        runner.clone(),
        DetectorSettings {
            probe_process_group: false,
            run_benchmarks: false,
            ..DetectorSettings::default()
        },
    );
    let platform = detector.detect(false).await.expect("host detection");
    UnixProvider::new(
        runner,
        platform,
        KillSettings {
            escalation_delay_ms: 300,
            poll_interval_ms: 20,
            verify_timeout_ms: 3_000,
            default_timeout_ms: 3_000,
            ..KillSettings::unix_defaults()
        },
    )
}

// Killed children stay zombies until reaped; only Linux reports those as gone
#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_escalating_kill_of_live_child() {
    if !ProcessHarness::is_available() {
        return;
    }
    let provider = live_provider().await;
    let child = ProcessHarness.spawn_sleep(60).expect("spawn sleep");
    assert!(provider.process_exists(child.pid()).await.unwrap());

    let result = provider
        .kill_by_pid(child.pid(), &KillOptions::escalating())
        .await
        .unwrap();
    assert!(result.success, "kill failed: {:?}", result.error);
    assert_eq!(result.method, KillMethod::Escalate);

    assert!(child.wait_for_exit(Duration::from_secs(3)));
    assert!(!provider.process_exists(child.pid()).await.unwrap());
}

// Killed children stay zombies until reaped; only Linux reports those as gone
#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_term_resistant_child_needs_escalation() {
    if !ProcessHarness::is_available() {
        return;
    }
    let provider = live_provider().await;
    let child = ProcessHarness.spawn_term_resistant().expect("spawn shell");
    // Give the shell time to install its trap
    tokio::time::sleep(Duration::from_millis(200)).await;

    let result = provider
        .kill_by_pid(child.pid(), &KillOptions::escalating())
        .await
        .unwrap();
    assert!(result.success);
    assert!(child.wait_for_exit(Duration::from_secs(3)));
}

#[tokio::test]
async fn test_missing_pid_is_validation_success() {
    let provider = live_provider().await;
    let result = provider
        .kill_by_pid(99_999_999, &KillOptions::escalating())
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(result.method, KillMethod::Validation);
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_tree_kill_leaves_no_member_alive() {
    if !ProcessHarness::is_available() {
        return;
    }
    let provider = live_provider().await;
    let parent = ProcessHarness.spawn_tree().expect("spawn tree");
    let children = parent.wait_for_children(2, Duration::from_secs(3));
    assert_eq!(children.len(), 2, "tree did not start");

    let result = provider
        .kill_process_tree(parent.pid(), &KillOptions::default())
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(result.total_processes, 3);

    assert!(parent.wait_for_exit(Duration::from_secs(3)));
    for pid in children.iter().copied().chain([parent.pid()]) {
        assert!(
            !provider.process_exists(pid).await.unwrap(),
            "pid {pid} survived the tree kill"
        );
    }
}

#[tokio::test]
async fn test_listing_and_lookup_see_our_child() {
    if !ProcessHarness::is_available() {
        return;
    }
    let provider = live_provider().await;
    let child = ProcessHarness.spawn_sleep(30).expect("spawn sleep");

    let snapshot = provider.list_processes(&ListOptions::default()).await.unwrap();
    assert!(snapshot.records.iter().any(|r| r.pid == std::process::id()));
    assert!(snapshot.records.iter().any(|r| r.pid == child.pid()));

    let info = provider.get_process_info(child.pid()).await.unwrap();
    let record = info.expect("child should be visible");
    assert_eq!(record.name, "sleep");
    assert_eq!(record.ppid, Some(std::process::id()));
}

#[tokio::test]
async fn test_non_terminating_signal_leaves_child_running() {
    if !ProcessHarness::is_available() {
        return;
    }
    let provider = live_provider().await;
    let child = ProcessHarness.spawn_sleep(30).expect("spawn sleep");

    let result = provider.send_signal(child.pid(), "CONT").await.unwrap();
    assert!(result.success);
    assert!(child.is_running());
}
