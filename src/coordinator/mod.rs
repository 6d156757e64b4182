//! Coordinator FSM: the only legal entrant to the switch engine.
//!
//! Serializes switch attempts behind a single lock, enforces dwell and
//! cooldown counted in controller ticks, holds a latest-wins slot for
//! requests that arrive mid-switch, and publishes topology-changed events
//! strictly after a commit has installed the new `(topology, epoch)`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::config::CoordinatorConfig;
use crate::metrics::RuntimeMetrics;
use crate::runtime::message::{Epoch, Topology};
use crate::runtime::switch::{SwitchEngine, SwitchOutcome};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Pre-switch health check. Optional; a probe that fails or misses its
/// deadline defers the switch and starts cooldown.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self, target: Topology) -> bool;
}

/// Canonical record for the active pair. A tuple conversion exists for
/// callers that historically consumed `(topology, epoch)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopologyStatus {
    pub topology: Topology,
    pub epoch: Epoch,
}

impl From<TopologyStatus> for (Topology, Epoch) {
    fn from(status: TopologyStatus) -> Self {
        (status.topology, status.epoch)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopologyChanged {
    pub from: Topology,
    pub to: Topology,
    pub epoch: Epoch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferReason {
    InFlight,
    Health,
    PrepareNotReady,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Dwell,
    Cooldown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchRequest {
    Committed { epoch: Epoch },
    /// The engine ran and aborted (quiesce timeout); a normal outcome.
    Aborted,
    Deferred(DeferReason),
    Rejected(RejectReason),
    /// Target equals the current topology; nothing to do.
    NoOp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FsmState {
    Stable,
    Switching,
    Cooldown,
}

#[derive(Debug)]
struct CoordState {
    fsm: FsmState,
    steps_since_switch: u32,
    cooldown_remaining: u32,
    /// Latest-wins slot for requests arriving while a switch is in flight.
    pending: Option<Topology>,
}

pub struct Coordinator {
    engine: Arc<SwitchEngine>,
    metrics: Arc<RuntimeMetrics>,
    state: Mutex<CoordState>,
    /// Held across the whole engine call; at most one switch in flight.
    switch_lock: tokio::sync::Mutex<()>,
    events: broadcast::Sender<TopologyChanged>,
    health_probe: Option<Arc<dyn HealthProbe>>,
    dwell_min_steps: u32,
    cooldown_steps: u32,
    probe_deadline: Duration,
}

impl Coordinator {
    pub fn new(
        engine: Arc<SwitchEngine>,
        config: &CoordinatorConfig,
        metrics: Arc<RuntimeMetrics>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            engine,
            metrics,
            state: Mutex::new(CoordState {
                fsm: FsmState::Stable,
                // A fresh coordinator has dwelled "long enough": the initial
                // topology was not produced by a switch.
                steps_since_switch: config.dwell_min_steps,
                cooldown_remaining: 0,
                pending: None,
            }),
            switch_lock: tokio::sync::Mutex::new(()),
            events,
            health_probe: None,
            dwell_min_steps: config.dwell_min_steps,
            cooldown_steps: config.cooldown_steps,
            probe_deadline: Duration::from_millis(config.health_probe_deadline_ms),
        }
    }

    pub fn with_health_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.health_probe = Some(probe);
        self
    }

    /// Current `(topology, epoch)` as the canonical record.
    pub fn active(&self) -> TopologyStatus {
        let (topology, epoch) = self.engine.active();
        TopologyStatus { topology, epoch }
    }

    /// Subscribe to topology-changed events. Events are emitted strictly
    /// after COMMIT has installed the new pair.
    pub fn subscribe(&self) -> broadcast::Receiver<TopologyChanged> {
        self.events.subscribe()
    }

    /// Await the next topology change. Only transitions committed after the
    /// call are observed; returns None if the coordinator is dropped.
    pub async fn wait_for_topology_change(&self) -> Option<TopologyChanged> {
        let mut events = self.subscribe();
        events.recv().await.ok()
    }

    /// Advance dwell/cooldown counters by one controller tick.
    pub fn note_tick(&self) {
        let mut state = self.state.lock();
        state.steps_since_switch = state.steps_since_switch.saturating_add(1);
        if state.cooldown_remaining > 0 {
            state.cooldown_remaining -= 1;
            if state.cooldown_remaining == 0 && state.fsm == FsmState::Cooldown {
                state.fsm = FsmState::Stable;
            }
        }
    }

    /// A deferred target recorded mid-switch, if one is waiting. Cleared on
    /// read; the controller replays it once dwell/cooldown allow.
    pub fn take_pending(&self) -> Option<Topology> {
        self.state.lock().pending.take()
    }

    /// Ticks spent in the current topology since the last commit.
    pub fn steps_since_switch(&self) -> u32 {
        self.state.lock().steps_since_switch
    }

    /// Request a topology switch. Enforces single-switch-in-flight, dwell,
    /// cooldown, and the optional health probe, then drives the engine.
    pub async fn request_switch(&self, target: Topology) -> SwitchRequest {
        if self.active().topology == target {
            return SwitchRequest::NoOp;
        }

        // In-flight check: record latest-wins and defer rather than queueing.
        let Ok(guard) = self.switch_lock.try_lock() else {
            let mut state = self.state.lock();
            state.pending = Some(target);
            debug!(to = %target, "switch already in flight; request deferred");
            self.metrics.record_deferral();
            return SwitchRequest::Deferred(DeferReason::InFlight);
        };

        {
            let mut state = self.state.lock();
            if state.cooldown_remaining > 0 {
                debug!(to = %target, remaining = state.cooldown_remaining, "rejected: cooldown");
                return SwitchRequest::Rejected(RejectReason::Cooldown);
            }
            if state.steps_since_switch < self.dwell_min_steps {
                debug!(
                    to = %target,
                    steps = state.steps_since_switch,
                    "rejected: dwell not satisfied"
                );
                return SwitchRequest::Rejected(RejectReason::Dwell);
            }
            state.fsm = FsmState::Switching;
        }

        if let Some(probe) = &self.health_probe {
            let healthy = tokio::time::timeout(self.probe_deadline, probe.check(target))
                .await
                .unwrap_or(false);
            if !healthy {
                let mut state = self.state.lock();
                state.fsm = FsmState::Cooldown;
                state.cooldown_remaining = self.cooldown_steps;
                debug!(to = %target, "health probe not ok; deferred into cooldown");
                self.metrics.record_deferral();
                return SwitchRequest::Deferred(DeferReason::Health);
            }
        }

        let from = self.active().topology;
        let outcome = self.engine.execute_switch(target).await;
        drop(guard);

        match outcome {
            SwitchOutcome::Committed { epoch, .. } => {
                {
                    let mut state = self.state.lock();
                    state.fsm = FsmState::Cooldown;
                    state.steps_since_switch = 0;
                    state.cooldown_remaining = self.cooldown_steps;
                    state.pending = None;
                }
                info!(from = %from, to = %target, epoch, "topology changed");
                // Receivers may come and go; a send with no subscribers is fine.
                let _ = self.events.send(TopologyChanged {
                    from,
                    to: target,
                    epoch,
                });
                SwitchRequest::Committed { epoch }
            }
            SwitchOutcome::Aborted { .. } => {
                self.state.lock().fsm = FsmState::Stable;
                SwitchRequest::Aborted
            }
            SwitchOutcome::Deferred { .. } => {
                let mut state = self.state.lock();
                state.fsm = FsmState::Cooldown;
                state.cooldown_remaining = self.cooldown_steps;
                SwitchRequest::Deferred(DeferReason::PrepareNotReady)
            }
        }
    }
}
