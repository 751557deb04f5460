//! Micro-benchmarks and the hints derived from them.

use super::platform::{BenchmarkStats, OptimizationHint, ToolInfo};
use crate::collect::tool_runner::CommandRunner;
use pw_common::OsFamily;
use pw_config::DetectorSettings;
use std::collections::BTreeMap;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

pub const PROCESS_LISTING: &str = "process_listing";
pub const NETWORK_LISTING: &str = "network_listing";
pub const FILESYSTEM: &str = "filesystem";
pub const TRIVIAL_COMMAND: &str = "trivial_command";

/// Time `iterations` runs of `attempt`, which reports success.
pub async fn run_benchmark<F, Fut>(iterations: u32, mut attempt: F) -> BenchmarkStats
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let iterations = iterations.max(1);
    let mut samples = Vec::with_capacity(iterations as usize);
    let mut successes = 0u32;

    for _ in 0..iterations {
        let start = Instant::now();
        if attempt().await {
            successes += 1;
        }
        samples.push(start.elapsed().as_secs_f64() * 1000.0);
    }

    summarize(&samples, successes)
}

fn summarize(samples_ms: &[f64], successes: u32) -> BenchmarkStats {
    let attempts = samples_ms.len().max(1) as f64;
    let sum: f64 = samples_ms.iter().sum();
    BenchmarkStats {
        avg_ms: sum / attempts,
        min_ms: if samples_ms.is_empty() {
            0.0
        } else {
            samples_ms.iter().copied().fold(f64::INFINITY, f64::min)
        },
        max_ms: samples_ms.iter().copied().fold(0.0, f64::max),
        reliability: successes as f64 / attempts,
        iterations: samples_ms.len() as u32,
    }
}

async fn command_succeeds(
    runner: &dyn CommandRunner,
    cmd: &str,
    args: &[&str],
    timeout: Duration,
) -> bool {
    matches!(
        runner.run_tool(cmd, args, Some(timeout)).await,
        Ok(output) if output.success()
    )
}

async fn filesystem_cycle() -> bool {
    let path = std::env::temp_dir().join(format!("procward-bench-{}", uuid::Uuid::new_v4()));
    let payload = b"procward filesystem benchmark";
    let ok = async {
        tokio::fs::write(&path, payload).await?;
        let read = tokio::fs::read(&path).await?;
        tokio::fs::remove_file(&path).await?;
        Ok::<bool, std::io::Error>(read == payload)
    }
    .await;
    match ok {
        Ok(matched) => matched,
        Err(e) => {
            trace!(error = %e, "filesystem benchmark iteration failed");
            let _ = tokio::fs::remove_file(&path).await;
            false
        }
    }
}

/// Run every benchmark that applies to the detected tool set.
pub async fn run_benchmarks(
    runner: &dyn CommandRunner,
    family: OsFamily,
    tools: &BTreeMap<String, ToolInfo>,
    settings: &DetectorSettings,
) -> BTreeMap<String, BenchmarkStats> {
    let iterations = settings.benchmark_iterations;
    let timeout = settings.benchmark_timeout();
    let has = |name: &str| tools.get(name).is_some_and(|t| t.available);
    let mut results = BTreeMap::new();

    let (list_cmd, list_args): (&str, &[&str]) = match family {
        OsFamily::Unix => ("ps", &["-A", "-o", "pid="]),
        OsFamily::Windows => ("tasklist", &["/FO", "CSV", "/NH"]),
    };
    if has(list_cmd) {
        let stats = run_benchmark(iterations, || {
            command_succeeds(runner, list_cmd, list_args, timeout)
        })
        .await;
        results.insert(PROCESS_LISTING.to_string(), stats);
    }

    let network: Option<(&str, &[&str])> = match family {
        OsFamily::Unix if has("ss") => Some(("ss", &["-tan"][..])),
        _ if has("netstat") => Some(("netstat", &["-an"][..])),
        _ => None,
    };
    if let Some((cmd, args)) = network {
        let stats =
            run_benchmark(iterations, || command_succeeds(runner, cmd, args, timeout)).await;
        results.insert(NETWORK_LISTING.to_string(), stats);
    }

    let stats = run_benchmark(iterations, filesystem_cycle).await;
    results.insert(FILESYSTEM.to_string(), stats);

    let (shell, shell_args): (&str, &[&str]) = match family {
        OsFamily::Unix => ("sh", &["-c", "exit 0"]),
        OsFamily::Windows => ("cmd", &["/C", "exit 0"]),
    };
    let stats = run_benchmark(iterations, || {
        command_succeeds(runner, shell, shell_args, timeout)
    })
    .await;
    results.insert(TRIVIAL_COMMAND.to_string(), stats);

    debug!(benchmarks = results.len(), "benchmarks complete");
    results
}

/// Derive tool preferences from benchmark numbers alone.
pub fn derive_hints(
    family: OsFamily,
    performance: &BTreeMap<String, BenchmarkStats>,
    tools: &BTreeMap<String, ToolInfo>,
    settings: &DetectorSettings,
) -> Vec<OptimizationHint> {
    let has = |name: &str| tools.get(name).is_some_and(|t| t.available);
    let mut hints = Vec::new();

    if let Some(listing) = performance.get(PROCESS_LISTING) {
        if listing.avg_ms > settings.slow_listing_threshold_ms {
            let alternate = match family {
                OsFamily::Unix => "pgrep",
                OsFamily::Windows => "powershell",
            };
            if has(alternate) {
                hints.push(OptimizationHint {
                    operation: "process_lookup".to_string(),
                    prefer: alternate.to_string(),
                    reason: format!(
                        "process listing averages {:.0}ms (threshold {:.0}ms)",
                        listing.avg_ms, settings.slow_listing_threshold_ms
                    ),
                });
            }
        }
        if family == OsFamily::Windows
            && listing.reliability < settings.min_reliability
            && has("wmic")
        {
            hints.push(OptimizationHint {
                operation: PROCESS_LISTING.to_string(),
                prefer: "wmic".to_string(),
                reason: format!("tasklist reliability {:.2}", listing.reliability),
            });
        }
    }

    if let Some(network) = performance.get(NETWORK_LISTING) {
        if network.reliability < settings.min_reliability {
            let alternate = match family {
                OsFamily::Unix if has("ss") && has("netstat") => Some("netstat"),
                OsFamily::Unix if has("lsof") => Some("lsof"),
                OsFamily::Windows if has("powershell") => Some("powershell"),
                _ => None,
            };
            if let Some(alternate) = alternate {
                hints.push(OptimizationHint {
                    operation: NETWORK_LISTING.to_string(),
                    prefer: alternate.to_string(),
                    reason: format!("network listing reliability {:.2}", network.reliability),
                });
            }
        }
    }

    hints
}
