//! Switching controller: the decide → request → update loop.
//!
//! Runs on its own cadence; one `tick` is one decision. The controller only
//! ever talks to the Coordinator, never the switch engine, and keeps a
//! per-tick audit record it can flush as JSONL.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::budget::{BudgetGuard, ScopeKey};
use crate::config::ControllerConfig;
use crate::coordinator::{Coordinator, SwitchRequest};
use crate::error::Result;
use crate::metrics::RuntimeMetrics;
use crate::runtime::message::{Epoch, Topology};

use super::bandit::{Action, BanditPolicy};
use super::features::{FeatureSource, FEATURE_DIM};
use super::reward::{RewardModel, StepObservation};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SwitchAttempt {
    pub attempted: bool,
    pub committed: bool,
    pub epoch: Epoch,
}

/// One audit-log entry per decision tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub step: u64,
    pub topology_before: Topology,
    pub features: [f64; FEATURE_DIM],
    pub action: Action,
    pub epsilon: f64,
    pub decision_ms: f64,
    pub switch: SwitchAttempt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardRecord {
    pub step: u64,
    pub delta_pass_rate: f64,
    pub delta_tokens: i64,
    pub switch_committed: bool,
    pub reward: f64,
}

pub struct SwitchController {
    bandit: BanditPolicy,
    features: FeatureSource,
    coordinator: Arc<Coordinator>,
    budget: Arc<BudgetGuard>,
    metrics: Arc<RuntimeMetrics>,
    episode_scope: ScopeKey,
    reward_model: RewardModel,
    decision_log: Vec<DecisionRecord>,
    reward_log: Vec<RewardRecord>,
    step: u64,
}

impl SwitchController {
    pub fn new(
        config: &ControllerConfig,
        dwell_min_steps: u32,
        coordinator: Arc<Coordinator>,
        budget: Arc<BudgetGuard>,
        metrics: Arc<RuntimeMetrics>,
        episode_id: impl Into<String>,
        seed: u64,
    ) -> Self {
        Self {
            bandit: BanditPolicy::new(config, seed),
            features: FeatureSource::new(dwell_min_steps, config.feature_window),
            coordinator,
            budget,
            metrics,
            episode_scope: ScopeKey::Episode(episode_id.into()),
            reward_model: RewardModel::new(),
            decision_log: Vec::new(),
            reward_log: Vec::new(),
            step: 0,
        }
    }

    /// Count one routed message toward the role-share window. Wire this to
    /// the router's egress (the episode runner calls it per handled
    /// message).
    pub fn observe_sender(&mut self, sender: &str) {
        self.features.observe_sender(sender);
    }

    /// One decision tick: extract features, decide, maybe request a switch.
    pub async fn tick(&mut self) -> DecisionRecord {
        let started = Instant::now();
        self.step += 1;
        self.coordinator.note_tick();

        // Replay a target deferred during a previous in-flight switch.
        if let Some(pending) = self.coordinator.take_pending() {
            let replay = self.coordinator.request_switch(pending).await;
            debug!(to = %pending, ?replay, "replayed deferred switch target");
        }

        let status = self.coordinator.active();
        self.features
            .set_topology(status.topology, self.coordinator.steps_since_switch());
        let used = self.budget.used_tokens(&self.episode_scope);
        let budget = self.budget.token_budget(&self.episode_scope).unwrap_or(0);
        self.features.set_budget(used, budget);

        let x = self.features.vector();
        let decision = self.bandit.decide(&x);

        let mut switch = SwitchAttempt {
            attempted: false,
            committed: false,
            epoch: status.epoch,
        };
        if let Some(target) = decision.action.target() {
            if target != status.topology {
                switch.attempted = true;
                match self.coordinator.request_switch(target).await {
                    SwitchRequest::Committed { epoch } => {
                        switch.committed = true;
                        switch.epoch = epoch;
                    }
                    outcome => {
                        debug!(to = %target, ?outcome, "switch request not committed");
                    }
                }
            }
        }

        let elapsed = started.elapsed();
        self.metrics.record_decision_latency(elapsed);

        let record = DecisionRecord {
            step: self.step,
            topology_before: status.topology,
            features: x,
            action: decision.action,
            epsilon: decision.epsilon,
            decision_ms: elapsed.as_secs_f64() * 1000.0,
            switch,
        };
        self.decision_log.push(record.clone());
        self.features.step();
        record
    }

    /// Fold the observed transition into the bandit using the most recent
    /// decision's context, and append to the reward log.
    pub fn update_reward(&mut self, prev: &StepObservation, curr: &StepObservation) -> f64 {
        let reward = self.reward_model.step_reward(prev, curr);

        if let Some(last) = self.decision_log.last() {
            self.bandit.update(&last.features, last.action, reward);
            self.reward_log.push(RewardRecord {
                step: last.step,
                delta_pass_rate: curr.test_pass_rate - prev.test_pass_rate,
                delta_tokens: curr.tokens_used as i64 - prev.tokens_used as i64,
                switch_committed: curr.switch_committed,
                reward,
            });
        }
        reward
    }

    /// Terminal bonus at episode end, attributed to the final decision.
    pub fn finish_episode(&mut self, success: bool) -> f64 {
        let bonus = self.reward_model.final_bonus(success);
        if bonus != 0.0 {
            if let Some(last) = self.decision_log.last() {
                self.bandit.update(&last.features, last.action, bonus);
            }
        }
        bonus
    }

    pub fn decision_log(&self) -> &[DecisionRecord] {
        &self.decision_log
    }

    pub fn reward_log(&self) -> &[RewardRecord] {
        &self.reward_log
    }

    pub fn decision_count(&self) -> u64 {
        self.bandit.decision_count()
    }

    /// Write decision (and optionally reward) logs as JSONL.
    pub async fn flush_jsonl(
        &self,
        decisions_path: &Path,
        rewards_path: Option<&Path>,
    ) -> Result<()> {
        write_jsonl(decisions_path, &self.decision_log).await?;
        if let Some(path) = rewards_path {
            write_jsonl(path, &self.reward_log).await?;
        }
        Ok(())
    }
}

async fn write_jsonl<T: Serialize>(path: &Path, records: &[T]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut out = Vec::new();
    for record in records {
        out.extend_from_slice(&serde_json::to_vec(record)?);
        out.push(b'\n');
    }
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(&out).await?;
    file.flush().await?;
    Ok(())
}
