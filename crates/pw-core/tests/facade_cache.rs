//! Read caching and statistics of the `ProcessProvider` facade.

use pw_common::OsFamily;
use pw_config::{FacadeSettings, ProcwardConfig};
use pw_core::provider::{KillOptions, ListOptions, OperationKind, ProviderStatistics};
use pw_core::test_utils::fake_provider;
use std::time::Duration;

fn config_with_ttl(ttl_ms: u64) -> ProcwardConfig {
    ProcwardConfig {
        facade: FacadeSettings {
            read_cache_ttl_ms: ttl_ms,
            ..FacadeSettings::default()
        },
        ..ProcwardConfig::default()
    }
}

#[tokio::test]
async fn test_listing_is_cached_until_ttl_expires() {
    let (provider, backend) = fake_provider(OsFamily::Unix, config_with_ttl(150));
    backend.add_process(100, 1, "alpha");

    let first = provider.list_processes(&ListOptions::default()).await.unwrap();
    let second = provider.list_processes(&ListOptions::default()).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(backend.calls_of(OperationKind::ListProcesses), 1);

    tokio::time::sleep(Duration::from_millis(200)).await;
    provider.list_processes(&ListOptions::default()).await.unwrap();
    assert_eq!(backend.calls_of(OperationKind::ListProcesses), 2);

    let stats = provider.get_statistics();
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.cache_misses, 2);
}

#[tokio::test]
async fn test_different_list_options_are_cached_apart() {
    let (provider, backend) = fake_provider(OsFamily::Unix, config_with_ttl(10_000));
    backend.add_process(100, 1, "alpha");
    backend.add_process(101, 1, "beta");

    let all = provider.list_processes(&ListOptions::default()).await.unwrap();
    let filtered = provider
        .list_processes(&ListOptions {
            filter: Some("beta".into()),
            ..ListOptions::default()
        })
        .await
        .unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(filtered.len(), 1);
    assert_eq!(backend.calls_of(OperationKind::ListProcesses), 2);
}

#[tokio::test]
async fn test_kill_drops_cached_reads() {
    let (provider, backend) = fake_provider(OsFamily::Unix, config_with_ttl(10_000));
    backend.add_process(200, 1, "victim");

    let info = provider.get_process_info(200).await.unwrap();
    assert!(info.is_some());

    let result = provider.kill_by_pid(200, &KillOptions::default()).await.unwrap();
    assert!(result.success);

    let info = provider.get_process_info(200).await.unwrap();
    assert!(info.is_none(), "stale record served after kill");
    assert_eq!(backend.calls_of(OperationKind::GetProcessInfo), 2);
}

#[tokio::test]
async fn test_batched_kill_drops_cached_reads() {
    let (provider, backend) = fake_provider(OsFamily::Unix, config_with_ttl(10_000));
    backend.add_process(300, 1, "a");
    backend.add_process(301, 1, "b");

    assert_eq!(
        provider.list_processes(&ListOptions::default()).await.unwrap().len(),
        2
    );
    let results = provider
        .kill_many(&[300, 301], &KillOptions::default())
        .await
        .unwrap();
    assert!(results.iter().all(|r| matches!(r, Ok(k) if k.success)));
    assert!(provider
        .list_processes(&ListOptions::default())
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_existence_checks_are_never_cached() {
    let (provider, backend) = fake_provider(OsFamily::Unix, config_with_ttl(10_000));
    backend.add_process(400, 1, "alpha");
    assert!(provider.process_exists(400).await.unwrap());
    assert!(provider.process_exists(400).await.unwrap());
    assert_eq!(backend.calls_of(OperationKind::ProcessExists), 2);
}

#[tokio::test]
async fn test_disabled_cache_always_reaches_backend() {
    let mut config = config_with_ttl(10_000);
    config.facade.cache_enabled = false;
    let (provider, backend) = fake_provider(OsFamily::Unix, config);

    for _ in 0..3 {
        provider.list_processes(&ListOptions::default()).await.unwrap();
    }
    assert_eq!(backend.calls_of(OperationKind::ListProcesses), 3);
    let stats = provider.get_statistics();
    assert_eq!(stats.cache_hits + stats.cache_misses, 0);
}

#[tokio::test]
async fn test_reinitialize_resets_cache_and_statistics() {
    let (provider, backend) = fake_provider(OsFamily::Unix, config_with_ttl(10_000));
    provider.list_processes(&ListOptions::default()).await.unwrap();
    assert_eq!(provider.get_statistics().total_calls(), 1);

    provider.reinitialize().await.unwrap();
    assert_eq!(provider.get_statistics(), ProviderStatistics::default());
    assert_eq!(backend.self_test_count(), 2);

    provider.list_processes(&ListOptions::default()).await.unwrap();
    assert_eq!(backend.calls_of(OperationKind::ListProcesses), 2);
}

#[tokio::test]
async fn test_failed_calls_count_against_error_rate() {
    let (provider, backend) = fake_provider(OsFamily::Unix, config_with_ttl(0));
    backend.add_process(500, 1, "alpha");
    backend.fail_next(1);

    assert!(provider.process_exists(500).await.is_err());
    assert!(provider.process_exists(500).await.unwrap());

    let stats = provider.get_statistics();
    let exists = &stats.operations[&OperationKind::ProcessExists];
    assert_eq!(exists.calls, 2);
    assert_eq!(exists.failures, 1);
    assert!((stats.error_rate() - 0.5).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_slow_backend_fails_health_check() {
    let mut config = config_with_ttl(0);
    config.facade.max_avg_latency_ms = 10.0;
    let (provider, backend) = fake_provider(OsFamily::Unix, config);
    backend.set_latency(Duration::from_millis(40));

    provider.process_exists(1).await.unwrap();
    let report = provider.perform_health_check().await.unwrap();
    assert!(!report.healthy);
    assert!(report.self_test_passed);
    assert!(report.avg_latency_ms >= 40.0);
    assert!(report.reasons.iter().any(|r| r.contains("latency")));
}
