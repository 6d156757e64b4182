//! Atomic topology switch engine.
//!
//! Executes the PREPARE → QUIESCE → COMMIT/ABORT protocol over the router's
//! dual queues. Only this engine advances the epoch, and only at COMMIT.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::time::Instant as TokioInstant;
use tracing::{debug, info, warn};

use crate::config::SwitchConfig;
use crate::error::Result;
use crate::metrics::RuntimeMetrics;
use crate::runtime::intent_log::{IntentLog, IntentRecord};
use crate::runtime::message::{Epoch, Topology};
use crate::runtime::router::Router;

/// QUIESCE drain poll granularity.
const QUIESCE_POLL: Duration = Duration::from_millis(1);

/// Optional PREPARE-phase warmup (health ping, adapter readiness, plan
/// pre-warm). A task that cannot finish inside the prepare deadline makes
/// the switch defer; it never aborts.
#[async_trait]
pub trait PrepareTask: Send + Sync {
    async fn warm_up(&self) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct SwitchStats {
    pub target: Topology,
    pub prepare: Duration,
    pub quiesce: Duration,
    pub migrated: usize,
    pub dropped_queue_full: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SwitchOutcome {
    Committed { epoch: Epoch, stats: SwitchStats },
    /// QUIESCE deadline elapsed with active traffic left; queues were merged
    /// back and the epoch did not move.
    Aborted { epoch: Epoch, stats: SwitchStats },
    /// A PREPARE warmup was not ready in time; nothing changed.
    Deferred { epoch: Epoch },
}

impl SwitchOutcome {
    pub fn committed(&self) -> bool {
        matches!(self, Self::Committed { .. })
    }
}

pub struct SwitchEngine {
    router: Arc<Router>,
    metrics: Arc<RuntimeMetrics>,
    quiesce_deadline: Duration,
    prepare_deadline: Duration,
    warmups: Vec<Arc<dyn PrepareTask>>,
    intent_log: Option<Mutex<IntentLog>>,
}

impl SwitchEngine {
    pub fn new(router: Arc<Router>, config: &SwitchConfig, metrics: Arc<RuntimeMetrics>) -> Self {
        Self {
            router,
            metrics,
            quiesce_deadline: Duration::from_millis(config.quiesce_deadline_ms),
            prepare_deadline: Duration::from_millis(config.prepare_deadline_ms),
            warmups: Vec::new(),
            intent_log: None,
        }
    }

    pub fn with_warmup(mut self, task: Arc<dyn PrepareTask>) -> Self {
        self.warmups.push(task);
        self
    }

    pub fn with_intent_log(mut self, log: IntentLog) -> Self {
        self.intent_log = Some(Mutex::new(log));
        self
    }

    /// Current `(topology, epoch)` pair, read atomically.
    pub fn active(&self) -> (Topology, Epoch) {
        self.router.active()
    }

    /// Run one full switch attempt. Never returns an error for a quiesce
    /// timeout; that path is the ordinary `Aborted` outcome.
    pub async fn execute_switch(&self, target: Topology) -> SwitchOutcome {
        let (_, epoch) = self.router.active();
        self.log_intent(IntentRecord::BeginPrepare {
            target,
            epoch,
            at: Utc::now(),
        });

        // PREPARE: buffer new ingress into Q_next, then run warmups against
        // the prepare deadline.
        let prepare_start = TokioInstant::now();
        self.router.begin_buffering();

        if !self.run_warmups().await {
            // Not ready: roll the buffering back (nothing or little has
            // accumulated) and let the coordinator defer.
            let stats = self.router.abort_switch();
            debug!(to = %target, "prepare warmup not ready; deferring");
            self.log_intent(IntentRecord::Abort {
                reason: "prepare_not_ready".into(),
                moved: stats.moved,
                dropped_queue_full: stats.dropped_queue_full,
                at: Utc::now(),
            });
            self.metrics.record_deferral();
            return SwitchOutcome::Deferred { epoch };
        }
        let prepare = prepare_start.elapsed();

        // QUIESCE: bounded wait for the active set to drain.
        let quiesce_start = TokioInstant::now();
        let deadline = quiesce_start + self.quiesce_deadline;
        let mut drained = self.router.active_drained();
        while !drained && TokioInstant::now() < deadline {
            tokio::time::sleep(QUIESCE_POLL).await;
            drained = self.router.active_drained();
        }
        let quiesce = quiesce_start.elapsed();

        if drained {
            let new_epoch = self.router.commit_switch(target);
            let stats = SwitchStats {
                target,
                prepare,
                quiesce,
                migrated: 0,
                dropped_queue_full: 0,
            };
            self.metrics.record_commit(prepare, quiesce);
            self.log_intent(IntentRecord::Commit {
                new_epoch,
                at: Utc::now(),
            });
            info!(to = %target, epoch = new_epoch, "topology switch committed");
            SwitchOutcome::Committed {
                epoch: new_epoch,
                stats,
            }
        } else {
            let abort = self.router.abort_switch();
            let stats = SwitchStats {
                target,
                prepare,
                quiesce,
                migrated: abort.moved,
                dropped_queue_full: abort.dropped_queue_full,
            };
            self.metrics.record_abort(prepare, quiesce);
            self.log_intent(IntentRecord::Abort {
                reason: "quiesce_timeout".into(),
                moved: abort.moved,
                dropped_queue_full: abort.dropped_queue_full,
                at: Utc::now(),
            });
            warn!(to = %target, epoch, "quiesce timeout; switch aborted");
            SwitchOutcome::Aborted { epoch, stats }
        }
    }

    /// Crash recovery: if the intent log tail is an unresolved prepare, the
    /// process died mid-switch. Force the ABORT merge (idempotent when the
    /// queues are already clean) without advancing the epoch.
    pub fn recover(&self) -> Result<()> {
        let Some(log) = &self.intent_log else {
            return Ok(());
        };
        let tail = log.lock().last()?;
        if let Some(IntentRecord::BeginPrepare { target, .. }) = tail {
            let stats = self.router.abort_switch();
            warn!(
                to = %target,
                moved = stats.moved,
                "recovered interrupted switch; forced abort"
            );
            log.lock().append(&IntentRecord::Abort {
                reason: "crash_restart".into(),
                moved: stats.moved,
                dropped_queue_full: stats.dropped_queue_full,
                at: Utc::now(),
            })?;
        }
        Ok(())
    }

    /// Run all warmups concurrently under the prepare deadline. A timeout or
    /// failure means "not ready".
    async fn run_warmups(&self) -> bool {
        if self.warmups.is_empty() {
            return true;
        }
        let all = async {
            for task in &self.warmups {
                if task.warm_up().await.is_err() {
                    return false;
                }
            }
            true
        };
        matches!(
            tokio::time::timeout(self.prepare_deadline, all).await,
            Ok(true)
        )
    }

    fn log_intent(&self, record: IntentRecord) {
        if let Some(log) = &self.intent_log {
            if let Err(e) = log.lock().append(&record) {
                warn!(error = %e, "failed to append switch intent record");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RouterConfig, TopologyConfig};
    use crate::error::ApexError;
    use crate::runtime::clock::MonotonicClock;
    use crate::runtime::message::{Message, Payload, Recipient};

    fn rig() -> (Arc<Router>, SwitchEngine) {
        let router = Arc::new(Router::new(
            &RouterConfig::default(),
            &TopologyConfig::default(),
            Arc::new(RuntimeMetrics::new()),
            Arc::new(MonotonicClock),
        ));
        let engine = SwitchEngine::new(router.clone(), &SwitchConfig::default(), Arc::new(RuntimeMetrics::new()));
        (router, engine)
    }

    fn msg(sender: &str, to: &str) -> Message {
        Message::new("ep-1", sender, Recipient::agent(to), Payload::empty())
    }

    #[tokio::test]
    async fn test_commit_on_empty_queues() {
        let (_, engine) = rig();
        let outcome = engine.execute_switch(Topology::Chain).await;
        assert!(outcome.committed());
        assert_eq!(engine.active(), (Topology::Chain, 2));
    }

    #[tokio::test]
    async fn test_abort_preserves_epoch_and_merges_suffix() {
        let (router, engine) = rig();
        // Undrainable: nobody consumes planner's queue.
        router.route(msg("system", "planner"));

        let outcome = engine.execute_switch(Topology::Chain).await;
        match outcome {
            SwitchOutcome::Aborted { epoch, .. } => assert_eq!(epoch, 1),
            other => panic!("expected abort, got {:?}", other),
        }
        assert_eq!(engine.active(), (Topology::Star, 1));

        // The pre-switch message is still deliverable.
        assert!(router.dequeue("planner").is_some());
    }

    #[tokio::test]
    async fn test_messages_during_quiesce_survive_abort_as_suffix() {
        let (router, engine) = rig();
        router.route(msg("system", "planner"));

        let engine = Arc::new(engine);
        let switch = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.execute_switch(Topology::Chain).await })
        };
        // Let PREPARE flip the buffering flag, then admit during QUIESCE.
        tokio::time::sleep(Duration::from_millis(5)).await;
        router.route(msg("system", "planner"));

        let outcome = switch.await.unwrap();
        assert!(matches!(outcome, SwitchOutcome::Aborted { .. }));

        // Both messages visible, original first, buffered one re-stamped to
        // the unchanged epoch and marked redelivered.
        let first = router.dequeue("planner").unwrap();
        assert_eq!(first.topo_epoch, 1);
        assert!(!first.redelivered);
        let second = router.dequeue("planner").unwrap();
        assert_eq!(second.topo_epoch, 1);
        assert!(second.redelivered);
    }

    struct SlowWarmup;

    #[async_trait]
    impl PrepareTask for SlowWarmup {
        async fn warm_up(&self) -> Result<()> {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(())
        }
    }

    struct FailingWarmup;

    #[async_trait]
    impl PrepareTask for FailingWarmup {
        async fn warm_up(&self) -> Result<()> {
            Err(ApexError::Timeout("adapter not ready".into()))
        }
    }

    #[tokio::test]
    async fn test_slow_warmup_defers_not_aborts() {
        let (_, engine) = rig();
        let engine = engine.with_warmup(Arc::new(SlowWarmup));

        let outcome = engine.execute_switch(Topology::Flat).await;
        assert_eq!(outcome, SwitchOutcome::Deferred { epoch: 1 });
        assert_eq!(engine.active(), (Topology::Star, 1));
    }

    #[tokio::test]
    async fn test_failing_warmup_defers() {
        let (_, engine) = rig();
        let engine = engine.with_warmup(Arc::new(FailingWarmup));
        assert_eq!(
            engine.execute_switch(Topology::Flat).await,
            SwitchOutcome::Deferred { epoch: 1 }
        );
    }

    #[tokio::test]
    async fn test_epochs_increase_without_gaps() {
        let (_, engine) = rig();
        for expected in 2..6 {
            let outcome = engine
                .execute_switch(if expected % 2 == 0 {
                    Topology::Chain
                } else {
                    Topology::Star
                })
                .await;
            match outcome {
                SwitchOutcome::Committed { epoch, .. } => assert_eq!(epoch, expected),
                other => panic!("expected commit, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_recover_forces_abort_after_unresolved_prepare() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("switch.intent");

        {
            let mut log = IntentLog::open(&log_path).unwrap();
            log.append(&IntentRecord::BeginPrepare {
                target: Topology::Chain,
                epoch: 1,
                at: Utc::now(),
            })
            .unwrap();
        }

        let (_, engine) = rig();
        let engine = engine.with_intent_log(IntentLog::open(&log_path).unwrap());
        engine.recover().unwrap();

        // Epoch unchanged, and the log now ends with the forced abort.
        assert_eq!(engine.active(), (Topology::Star, 1));
        let records = IntentLog::open(&log_path).unwrap().read_all().unwrap();
        assert!(matches!(records.last(), Some(IntentRecord::Abort { reason, .. }) if reason == "crash_restart"));
    }
}
