use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::{ApexError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ApexConfig {
    pub router: RouterConfig,
    pub topology: TopologyConfig,
    pub switch: SwitchConfig,
    pub coordinator: CoordinatorConfig,
    pub budget: BudgetConfig,
    pub controller: ControllerConfig,
    pub llm: LlmConfig,
}

impl ApexConfig {
    pub async fn load(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let content = fs::read_to_string(path).await?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        let content = toml::to_string_pretty(self).map_err(|e| ApexError::Config(e.to_string()))?;
        fs::write(path, content).await?;
        Ok(())
    }

    /// Validate configuration values for consistency and safety.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.router.queue_capacity_per_receiver == 0 {
            errors.push("router.queue_capacity_per_receiver must be greater than 0");
        }
        if self.router.max_attempts == 0 {
            errors.push("router.max_attempts must be greater than 0");
        }
        if self.router.payload_max_bytes == 0 {
            errors.push("router.payload_max_bytes must be greater than 0");
        }
        if self.router.dedup_capacity == 0 {
            errors.push("router.dedup_capacity must be greater than 0");
        }

        if self.topology.flat_fanout_limit == 0 {
            errors.push("topology.flat_fanout_limit must be greater than 0");
        }

        if self.switch.quiesce_deadline_ms == 0 {
            errors.push("switch.quiesce_deadline_ms must be greater than 0");
        }
        if self.switch.prepare_deadline_ms == 0 {
            errors.push("switch.prepare_deadline_ms must be greater than 0");
        }

        if !(1.0..).contains(&self.budget.safety_factor) {
            errors.push("budget.safety_factor must be >= 1.0");
        }
        if self.budget.reservation_ttl_s == 0 {
            errors.push("budget.reservation_ttl_s must be greater than 0");
        }

        if !(0.0..=1.0).contains(&self.controller.epsilon_start) {
            errors.push("controller.epsilon_start must be between 0.0 and 1.0");
        }
        if !(0.0..=1.0).contains(&self.controller.epsilon_end) {
            errors.push("controller.epsilon_end must be between 0.0 and 1.0");
        }
        if self.controller.epsilon_end > self.controller.epsilon_start {
            errors.push("controller.epsilon_end must not exceed controller.epsilon_start");
        }
        if self.controller.epsilon_schedule_n == 0 {
            errors.push("controller.epsilon_schedule_n must be greater than 0");
        }
        if self.controller.feature_window == 0 {
            errors.push("controller.feature_window must be greater than 0");
        }
        if self.controller.ridge_lambda <= 0.0 {
            errors.push("controller.ridge_lambda must be positive");
        }

        if self.llm.timeout_s == 0 {
            errors.push("llm.timeout_s must be greater than 0");
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ApexError::Config(errors.join("; ")))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Per-recipient bound for each of Q_active and Q_next.
    pub queue_capacity_per_receiver: usize,
    /// Default TTL applied when a message carries no explicit expiry.
    pub message_ttl_s: u64,
    /// Retry ceiling; attempts beyond this are dropped.
    pub max_attempts: u32,
    pub payload_max_bytes: usize,
    /// Base retry backoff; doubled per attempt, jittered ±10 %.
    pub retry_backoff_ms: u64,
    pub dedup_capacity: usize,
    pub dedup_ttl_s: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            queue_capacity_per_receiver: 10_000,
            message_ttl_s: 60,
            max_attempts: 5,
            payload_max_bytes: 512 * 1024,
            retry_backoff_ms: 25,
            dedup_capacity: 4096,
            dedup_ttl_s: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    /// Max peers addressable by a single Flat message.
    pub flat_fanout_limit: usize,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            flat_fanout_limit: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchConfig {
    pub quiesce_deadline_ms: u64,
    pub prepare_deadline_ms: u64,
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            quiesce_deadline_ms: 50,
            prepare_deadline_ms: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Minimum ticks in the current topology before another switch.
    pub dwell_min_steps: u32,
    /// Ticks after a commit during which requests are rejected.
    pub cooldown_steps: u32,
    pub health_probe_deadline_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            dwell_min_steps: 2,
            cooldown_steps: 2,
            health_probe_deadline_ms: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub daily_tokens: u64,
    pub episode_tokens: u64,
    /// Per-role token budgets; roles absent from the map are unbudgeted.
    pub agent_tokens: HashMap<String, u64>,
    pub safety_factor: f64,
    pub reservation_ttl_s: u64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            daily_tokens: 1_000_000,
            episode_tokens: 10_000,
            agent_tokens: HashMap::new(),
            safety_factor: 1.2,
            reservation_ttl_s: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub epsilon_start: f64,
    pub epsilon_end: f64,
    /// Decisions over which ε anneals linearly from start to end.
    pub epsilon_schedule_n: u64,
    /// Ticks of role-share history feeding the feature vector.
    pub feature_window: usize,
    pub ridge_lambda: f64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            epsilon_start: 0.20,
            epsilon_end: 0.05,
            epsilon_schedule_n: 5000,
            feature_window: 5,
            ridge_lambda: 0.01,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub timeout_s: u64,
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            timeout_s: 30,
            max_tokens: 2048,
        }
    }
}
