//! `ProcessController`: the single entry point that ties the facade, the
//! optimization engine, the batcher and the optional integration hooks
//! together.

use crate::integration::{AuditEvent, AuditSink, SessionLookup};
use crate::logging::events::event_names;
use crate::optimize::{
    Batcher, OptimizationEngine, Recommendation, ResourceMonitor, SysinfoMonitor,
};
use crate::provider::{
    HealthReport, KillResult, Operation, OperationOutput, ProcessProvider, ProviderStatistics,
};
use pw_common::{Error, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

pub struct ProcessController {
    provider: Arc<ProcessProvider>,
    engine: OptimizationEngine,
    batcher: Batcher,
    audit: Option<Arc<dyn AuditSink>>,
    sessions: Option<Arc<dyn SessionLookup>>,
}

impl std::fmt::Debug for ProcessController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessController")
            .field("provider", &self.provider)
            .field("engine", &self.engine)
            .field("audit", &self.audit.is_some())
            .field("sessions", &self.sessions.is_some())
            .finish_non_exhaustive()
    }
}

impl ProcessController {
    /// Initialize the provider and build the engine and batcher around it,
    /// sampling host pressure through `sysinfo`.
    pub async fn start(provider: Arc<ProcessProvider>) -> Result<Self> {
        Self::start_with_monitor(provider, Arc::new(SysinfoMonitor::new())).await
    }

    pub async fn start_with_monitor(
        provider: Arc<ProcessProvider>,
        monitor: Arc<dyn ResourceMonitor>,
    ) -> Result<Self> {
        provider.initialize().await?;
        let platform = provider.platform().ok_or(Error::NotInitialized)?;
        let family = platform.family;

        let config = Arc::new(provider.config().clone());
        let kill = config.kill_settings(family);
        let batcher = Batcher::new(
            Arc::clone(&provider),
            config.optimizer.batch_window(),
            kill.batch_pause(),
            kill.batch_size,
        );
        let engine = OptimizationEngine::new(config, family, monitor);

        info!(
            platform = %platform.platform,
            strategies = ?engine.strategy_names(),
            "process controller started"
        );
        Ok(Self {
            provider,
            engine,
            batcher,
            audit: None,
            sessions: None,
        })
    }

    pub fn with_audit(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    pub fn with_sessions(mut self, lookup: Arc<dyn SessionLookup>) -> Self {
        self.sessions = Some(lookup);
        self
    }

    pub fn provider(&self) -> &Arc<ProcessProvider> {
        &self.provider
    }

    pub fn engine(&self) -> &OptimizationEngine {
        &self.engine
    }

    /// Optimize, run and learn from one operation.
    pub async fn execute(&self, operation: Operation) -> Result<OperationOutput> {
        let optimized = self.engine.optimize(&operation);
        if let Some(output) = optimized.cached {
            return Ok(output);
        }
        let operation = optimized.operation;

        let started = Instant::now();
        let result = self.provider.dispatch(operation.clone()).await;
        self.engine
            .record_operation(&operation, &result, started.elapsed());

        let result = result.map(|output| self.attach_sessions(output));
        self.audit(&operation, &result);
        result
    }

    /// Like [`Self::execute`], but kill-by-pid requests join a batch.
    pub async fn execute_batched(&self, operation: Operation) -> Result<OperationOutput> {
        let optimized = self.engine.optimize(&operation);
        let Operation::KillByPid { pid, options } = &optimized.operation else {
            return self.execute(operation).await;
        };

        let started = Instant::now();
        let result = self
            .batcher
            .submit(*pid, options)
            .await
            .map(OperationOutput::Kill);
        self.engine
            .record_operation(&optimized.operation, &result, started.elapsed());

        let result = result.map(|output| self.attach_sessions(output));
        self.audit(&optimized.operation, &result);
        result
    }

    /// Flush pending batches, then judge provider health.
    pub async fn health_check(&self) -> Result<HealthReport> {
        self.batcher.flush().await;
        self.provider.perform_health_check().await
    }

    pub async fn capabilities(&self) -> Result<BTreeMap<String, bool>> {
        self.provider.get_capabilities().await
    }

    pub fn statistics(&self) -> ProviderStatistics {
        self.provider.get_statistics()
    }

    pub fn recommendations(&self) -> Vec<Recommendation> {
        self.engine.recommendations()
    }

    /// Run pending batches and drop cached reads.
    pub async fn shutdown(&self) {
        self.batcher.flush().await;
        self.engine.clear_cache();
        self.provider.clear_cache();
        debug!("process controller shut down");
    }

    fn attach_sessions(&self, output: OperationOutput) -> OperationOutput {
        let Some(sessions) = &self.sessions else {
            return output;
        };
        let tag = |result: &mut KillResult| {
            if result.session_id.is_none() {
                result.session_id = sessions.session_for(result.pid);
            }
        };
        match output {
            OperationOutput::Kill(mut result) => {
                tag(&mut result);
                OperationOutput::Kill(result)
            }
            OperationOutput::KillByName(mut batch) => {
                batch.results.iter_mut().for_each(tag);
                OperationOutput::KillByName(batch)
            }
            other => other,
        }
    }

    fn audit(&self, operation: &Operation, result: &Result<OperationOutput>) {
        let kind = operation.kind();
        if !kind.is_kill() {
            return;
        }
        let event = match result {
            Ok(output) if output.succeeded() => event_names::KILL_SUCCEEDED,
            Ok(_) => event_names::KILL_FAILED,
            Err(e) if e.is_validation() => event_names::KILL_REJECTED,
            Err(_) => event_names::KILL_FAILED,
        };

        match result {
            Ok(output) if output.succeeded() => {
                info!(event, %kind, target = %operation.target(), "kill finished")
            }
            Ok(_) => warn!(event, %kind, target = %operation.target(), "kill did not succeed"),
            Err(e) => warn!(event, %kind, target = %operation.target(), error = %e, "kill failed"),
        }

        let Some(sink) = &self.audit else {
            return;
        };
        let mut record = AuditEvent::new(event)
            .with_field("operation", kind.as_str())
            .with_field("target", operation.target());
        match result {
            Ok(output) => {
                record = record.with_field("killed", output.killed_pids());
                if let OperationOutput::Kill(r) = output {
                    record = record.with_field("method", r.method);
                    if let Some(session) = &r.session_id {
                        record = record.with_field("session_id", session);
                    }
                }
            }
            Err(e) => {
                record = record
                    .with_field("error", e.to_string())
                    .with_field("code", e.code());
            }
        }
        sink.record(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integration::{MemoryAuditSink, SessionMap};
    use crate::optimize::FixedMonitor;
    use crate::provider::{KillMethod, KillOptions, ListOptions, OperationKind};
    use crate::test_utils::{fake_provider, FakeBackend};
    use pw_common::OsFamily;
    use pw_config::ProcwardConfig;

    async fn controller() -> (ProcessController, Arc<FakeBackend>) {
        let (provider, backend) = fake_provider(OsFamily::Unix, ProcwardConfig::default());
        let controller = ProcessController::start_with_monitor(
            Arc::new(provider),
            Arc::new(FixedMonitor::new(0.5, 0.5)),
        )
        .await
        .unwrap();
        (controller, backend)
    }

    #[tokio::test]
    async fn test_repeated_list_is_answered_by_engine() {
        let (controller, backend) = controller().await;
        backend.add_process(10, 1, "alpha");
        let op = Operation::ListProcesses {
            options: ListOptions::default(),
        };
        let first = controller.execute(op.clone()).await.unwrap();
        let second = controller.execute(op).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(backend.calls_of(OperationKind::ListProcesses), 1);
    }

    #[tokio::test]
    async fn test_kill_audit_and_session() {
        let (controller, backend) = controller().await;
        backend.add_process(20, 1, "worker");
        let sink = Arc::new(MemoryAuditSink::new());
        let sessions = Arc::new(SessionMap::new());
        sessions.insert(20, "sess-9");
        let controller = controller
            .with_audit(sink.clone())
            .with_sessions(sessions);

        let out = controller
            .execute(Operation::KillByPid {
                pid: 20,
                options: KillOptions::default(),
            })
            .await
            .unwrap();
        let OperationOutput::Kill(result) = out else {
            panic!("expected kill output");
        };
        assert_eq!(result.session_id.as_deref(), Some("sess-9"));

        let events = sink.named(event_names::KILL_SUCCEEDED);
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].field("session_id"),
            Some(&serde_json::Value::from("sess-9"))
        );
    }

    #[tokio::test]
    async fn test_rejected_kill_is_audited() {
        let (controller, _backend) = controller().await;
        let sink = Arc::new(MemoryAuditSink::new());
        let controller = controller.with_audit(sink.clone());
        let err = controller
            .execute(Operation::KillByName {
                pattern: "[".into(),
                options: KillOptions {
                    match_mode: crate::provider::MatchMode::Regex,
                    ..KillOptions::default()
                },
            })
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert_eq!(sink.named(event_names::KILL_REJECTED).len(), 1);
    }

    #[tokio::test]
    async fn test_batched_kills_share_backend_call() {
        let (controller, backend) = controller().await;
        for pid in 30..33 {
            backend.add_process(pid, 1, "worker");
        }
        let ops = (30..33).map(|pid| {
            controller.execute_batched(Operation::KillByPid {
                pid,
                options: KillOptions::default(),
            })
        });
        let results = futures::future::join_all(ops).await;
        for result in results {
            match result.unwrap() {
                OperationOutput::Kill(r) => {
                    assert!(r.success);
                    assert_ne!(r.method, KillMethod::Validation);
                }
                other => panic!("unexpected output {other:?}"),
            }
        }
        assert_eq!(backend.batches().len(), 1);
    }

    #[tokio::test]
    async fn test_batched_non_kill_runs_directly() {
        let (controller, backend) = controller().await;
        backend.add_process(40, 1, "worker");
        let out = controller
            .execute_batched(Operation::ProcessExists { pid: 40 })
            .await
            .unwrap();
        assert_eq!(out, OperationOutput::Exists(true));
        assert!(backend.batches().is_empty());
    }

    #[tokio::test]
    async fn test_health_check_and_recommendations() {
        let (controller, _backend) = controller().await;
        let report = controller.health_check().await.unwrap();
        assert!(report.healthy);
        assert!(controller.recommendations().is_empty());
        controller.shutdown().await;
    }
}
