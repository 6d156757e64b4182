//! Epoch-gated message router.
//!
//! Sole ingress/egress point for all messages. Admission runs topology
//! validation, authoritative epoch stamping, per-recipient dedup, capacity
//! and TTL enforcement; delivery is strict FIFO per recipient within an
//! epoch. During a switch the router buffers new traffic into Q_next so
//! epoch N drains completely before any N+1 message becomes visible.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, error, warn};

use crate::config::{RouterConfig, TopologyConfig};
use crate::metrics::RuntimeMetrics;
use crate::runtime::clock::Clock;
use crate::runtime::dedup::DedupStore;
use crate::runtime::guard::{RoutingIntent, TopologyGuard};
use crate::runtime::message::{
    AgentId, DropReason, Epoch, Message, Recipient, Role, Topology, FORWARD_TO_KEY,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    Admitted {
        recipients: Vec<AgentId>,
        epoch: Epoch,
    },
    Rejected {
        reason: DropReason,
    },
}

impl RouteOutcome {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    Admitted { epoch: Epoch },
    Dropped { reason: DropReason },
}

/// Per-recipient drop tallies produced by an aborted switch.
#[derive(Debug, Clone, Default)]
pub struct AbortStats {
    pub moved: usize,
    pub dropped_queue_full: usize,
}

#[derive(Debug, Default)]
struct QueuePair {
    active: VecDeque<Message>,
    next: VecDeque<Message>,
}

struct RouterInner {
    queues: HashMap<AgentId, QueuePair>,
    dedup: DedupStore,
    topology: Topology,
    epoch: Epoch,
    /// True between PREPARE and COMMIT/ABORT; new traffic lands in Q_next
    /// stamped epoch+1. Toggled only by the switch engine.
    buffer_to_next: bool,
    jitter: SmallRng,
}

pub struct Router {
    inner: Mutex<RouterInner>,
    guard: TopologyGuard,
    metrics: Arc<RuntimeMetrics>,
    clock: Arc<dyn Clock>,
    notify: Notify,
    capacity: usize,
    message_ttl: Duration,
    max_attempts: u32,
    payload_max_bytes: usize,
    retry_backoff: Duration,
}

impl Router {
    pub fn new(
        router_cfg: &RouterConfig,
        topology_cfg: &TopologyConfig,
        metrics: Arc<RuntimeMetrics>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let mut queues = HashMap::new();
        for role in Role::ALL {
            queues.insert(role.as_str().to_string(), QueuePair::default());
        }

        Self {
            inner: Mutex::new(RouterInner {
                queues,
                dedup: DedupStore::new(
                    router_cfg.dedup_capacity,
                    Duration::from_secs(router_cfg.dedup_ttl_s),
                ),
                topology: Topology::Star,
                epoch: 1,
                buffer_to_next: false,
                jitter: SmallRng::from_entropy(),
            }),
            guard: TopologyGuard::new(topology_cfg.flat_fanout_limit),
            metrics,
            clock,
            notify: Notify::new(),
            capacity: router_cfg.queue_capacity_per_receiver,
            message_ttl: Duration::from_secs(router_cfg.message_ttl_s),
            max_attempts: router_cfg.max_attempts,
            payload_max_bytes: router_cfg.payload_max_bytes,
            retry_backoff: Duration::from_millis(router_cfg.retry_backoff_ms),
        }
    }

    /// Current `(topology, epoch)` snapshot as stamped at ingress.
    pub fn active(&self) -> (Topology, Epoch) {
        let inner = self.inner.lock();
        (inner.topology, inner.epoch)
    }

    /// Active-queue depth per recipient; observation hook for the controller.
    pub fn queue_depths(&self) -> HashMap<AgentId, usize> {
        let inner = self.inner.lock();
        inner
            .queues
            .iter()
            .map(|(agent, pair)| (agent.clone(), pair.active.len()))
            .collect()
    }

    /// Admit a message: validate, stamp the ingress epoch, enqueue.
    pub fn route(&self, mut msg: Message) -> RouteOutcome {
        if msg.payload.encoded_len() > self.payload_max_bytes {
            self.metrics.record_drop(DropReason::InvalidPayload);
            msg.drop_reason = Some(DropReason::InvalidPayload);
            return RouteOutcome::Rejected {
                reason: DropReason::InvalidPayload,
            };
        }

        let now = self.clock.now();
        let mut inner = self.inner.lock();

        let intent = match self.guard.validate(inner.topology, &msg.sender, &msg.recipient) {
            Ok(intent) => intent,
            Err(violation) => {
                debug!(
                    sender = %msg.sender,
                    topology = %inner.topology,
                    ?violation,
                    "admission rejected"
                );
                self.metrics.record_drop(DropReason::TopologyViolation);
                return RouteOutcome::Rejected {
                    reason: DropReason::TopologyViolation,
                };
            }
        };

        // Atomic region: read (buffer_to_next, stamping epoch), select the
        // queue side, append. One lock acquisition, so a concurrent COMMIT
        // cannot interleave.
        let stamp = if inner.buffer_to_next {
            inner.epoch + 1
        } else {
            inner.epoch
        };

        if msg.expires_ts.is_none() {
            msg.expires_ts = Some(now + self.message_ttl);
        }
        msg.topo_epoch = stamp;

        let copies = Self::materialize(msg, intent);

        // All-or-nothing capacity check before the first append.
        let mut load: HashMap<&str, usize> = HashMap::new();
        for copy in &copies {
            let target = Self::target_of(copy);
            *load.entry(target).or_insert(0) += 1;
        }
        for (target, extra) in &load {
            let pair = inner.queues.get(*target);
            let depth = pair.map_or(0, |p| {
                if inner.buffer_to_next {
                    p.next.len()
                } else {
                    p.active.len()
                }
            });
            if depth + extra > self.capacity {
                self.metrics.record_drop(DropReason::QueueFull);
                return RouteOutcome::Rejected {
                    reason: DropReason::QueueFull,
                };
            }
        }
        drop(load);

        let mut admitted = Vec::with_capacity(copies.len());
        let buffering = inner.buffer_to_next;
        for mut copy in copies {
            let target = Self::target_of(&copy).to_string();
            if inner.dedup.check_and_record(&target, copy.dedup_key(), now) {
                copy.redelivered = true;
                copy.drop_reason = Some(DropReason::DedupDuplicate);
                self.metrics.record_drop(DropReason::DedupDuplicate);
                debug!(msg_id = %copy.msg_id, recipient = %target, "duplicate enqueue dropped");
                continue;
            }

            let pair = inner
                .queues
                .entry(target.clone())
                .or_insert_with(QueuePair::default);
            if buffering {
                pair.next.push_back(copy);
            } else {
                pair.active.push_back(copy);
            }
            admitted.push(target);
        }

        drop(inner);

        if admitted.is_empty() {
            return RouteOutcome::Rejected {
                reason: DropReason::DedupDuplicate,
            };
        }

        self.metrics.record_admitted();
        self.notify.notify_waiters();
        RouteOutcome::Admitted {
            recipients: admitted,
            epoch: stamp,
        }
    }

    /// Non-blocking dequeue from the recipient's active queue. Epoch N+1
    /// messages live in Q_next and only become reachable through COMMIT, so
    /// delivery order across a switch is gated structurally.
    pub fn dequeue(&self, agent_id: &str) -> Option<Message> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let pair = inner.queues.get_mut(agent_id)?;

        while let Some(mut msg) = pair.active.pop_front() {
            if msg.is_expired(now) {
                msg.drop_reason = Some(DropReason::Expired);
                self.metrics.record_drop(DropReason::Expired);
                debug!(msg_id = %msg.msg_id, recipient = agent_id, "expired before delivery");
                continue;
            }
            return Some(msg);
        }
        None
    }

    /// Dequeue, waiting up to `timeout` for a message to arrive.
    pub async fn dequeue_wait(&self, agent_id: &str, timeout: Duration) -> Option<Message> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if let Some(msg) = self.dequeue(agent_id) {
                return Some(msg);
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    return self.dequeue(agent_id);
                }
            }
        }
    }

    /// Re-admit a message after a transient consumer failure. The router
    /// schedules nothing itself; the caller's await covers the jittered
    /// backoff. Identity `(episode_id, msg_id)` is preserved, so dedup is
    /// bypassed for the intentional redelivery.
    pub async fn retry(&self, mut msg: Message) -> RetryOutcome {
        msg.attempt += 1;
        msg.redelivered = true;

        if msg.attempt > self.max_attempts {
            msg.drop_reason = Some(DropReason::MaxAttempts);
            self.metrics.record_drop(DropReason::MaxAttempts);
            warn!(msg_id = %msg.msg_id, attempts = msg.attempt, "retry ceiling reached");
            return RetryOutcome::Dropped {
                reason: DropReason::MaxAttempts,
            };
        }

        let backoff = {
            let mut inner = self.inner.lock();
            let base = self.retry_backoff.as_secs_f64() * f64::from(1u32 << (msg.attempt - 1).min(16));
            let jitter = inner.jitter.gen_range(0.9..=1.1);
            Duration::from_secs_f64(base * jitter)
        };
        tokio::time::sleep(backoff).await;

        let mut inner = self.inner.lock();
        let stamp = if inner.buffer_to_next {
            inner.epoch + 1
        } else {
            inner.epoch
        };
        msg.topo_epoch = stamp;

        let target = Self::target_of(&msg).to_string();
        let buffering = inner.buffer_to_next;
        let pair = inner
            .queues
            .entry(target)
            .or_insert_with(QueuePair::default);
        let queue = if buffering { &mut pair.next } else { &mut pair.active };
        if queue.len() >= self.capacity {
            self.metrics.record_drop(DropReason::QueueFull);
            return RetryOutcome::Dropped {
                reason: DropReason::QueueFull,
            };
        }
        queue.push_back(msg);
        drop(inner);

        self.metrics.record_retry();
        self.notify.notify_waiters();
        RetryOutcome::Admitted { epoch: stamp }
    }

    // ---- switch-engine protocol surface ----
    //
    // The switch engine is the only caller of the methods below; it directs
    // every epoch advance (the router just holds the counter).

    /// PREPARE: clear Q_next and start buffering new traffic into it.
    pub(crate) fn begin_buffering(&self) {
        let mut inner = self.inner.lock();
        for pair in inner.queues.values_mut() {
            pair.next.clear();
        }
        inner.buffer_to_next = true;
    }

    /// True when every recipient's active queue is empty.
    pub(crate) fn active_drained(&self) -> bool {
        let inner = self.inner.lock();
        inner.queues.values().all(|pair| pair.active.is_empty())
    }

    /// COMMIT: advance the epoch, install Q_next as the new Q_active, set
    /// the new topology. Requires a fully drained active set.
    pub(crate) fn commit_switch(&self, target: Topology) -> Epoch {
        let mut inner = self.inner.lock();
        if !inner.buffer_to_next {
            // Protocol violation: commit without prepare would regress the
            // epoch stamping rule. Unreachable by construction.
            error!("commit_switch called outside a prepared switch");
            panic!("switch protocol violation: commit without prepare");
        }
        if !inner.queues.values().all(|pair| pair.active.is_empty()) {
            error!("commit_switch called with undrained active queues");
            panic!("switch protocol violation: commit before drain");
        }

        inner.epoch += 1;
        inner.buffer_to_next = false;
        inner.topology = target;
        for pair in inner.queues.values_mut() {
            std::mem::swap(&mut pair.active, &mut pair.next);
            pair.next.clear();
        }
        let epoch = inner.epoch;
        drop(inner);

        self.notify.notify_waiters();
        epoch
    }

    /// ABORT: fold Q_next back into Q_active as a per-recipient suffix,
    /// re-stamped to the active epoch and marked redelivered. The epoch does
    /// not advance.
    pub(crate) fn abort_switch(&self) -> AbortStats {
        let mut inner = self.inner.lock();
        let epoch = inner.epoch;
        let mut stats = AbortStats::default();

        for pair in inner.queues.values_mut() {
            while let Some(mut msg) = pair.next.pop_front() {
                msg.topo_epoch = epoch;
                msg.redelivered = true;
                if pair.active.len() >= self.capacity {
                    msg.drop_reason = Some(DropReason::QueueFull);
                    stats.dropped_queue_full += 1;
                    continue;
                }
                pair.active.push_back(msg);
                stats.moved += 1;
            }
        }
        inner.buffer_to_next = false;
        drop(inner);

        if stats.dropped_queue_full > 0 {
            warn!(dropped = stats.dropped_queue_full, "abort merge overflowed active queues");
            for _ in 0..stats.dropped_queue_full {
                self.metrics.record_drop(DropReason::QueueFull);
            }
        }
        self.notify.notify_waiters();
        stats
    }

    // ---- helpers ----

    fn materialize(msg: Message, intent: RoutingIntent) -> Vec<Message> {
        match intent {
            RoutingIntent::Direct { to } => {
                let mut copy = msg;
                copy.recipient = Recipient::Agent(to);
                vec![copy]
            }
            RoutingIntent::ViaHub { hub, forward_to } => {
                let mut copy = msg;
                copy.recipient = Recipient::Agent(hub);
                copy.payload
                    .insert(FORWARD_TO_KEY, Value::String(forward_to));
                vec![copy]
            }
            RoutingIntent::Fanout { to } => {
                let fresh_ids = to.len() > 1;
                to.into_iter()
                    .map(|target| {
                        let mut copy = msg.clone();
                        copy.recipient = Recipient::Agent(target);
                        if fresh_ids {
                            copy.msg_id = uuid::Uuid::new_v4().simple().to_string();
                        }
                        copy
                    })
                    .collect()
            }
        }
    }

    fn target_of(msg: &Message) -> &str {
        match &msg.recipient {
            Recipient::Agent(id) => id.as_str(),
            // Materialized copies always carry a single recipient.
            _ => unreachable!("materialized message without single recipient"),
        }
    }
}
