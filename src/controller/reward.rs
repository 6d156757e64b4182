//! Per-tick reward shaping for the switching policy.
//!
//! `r = 0.3·phase_advanced + 0.7·Δpass_rate − 1e-4·Δtokens −
//! 0.05·switch_committed`, plus a +1.0 terminal bonus on episode success.

use serde::{Deserialize, Serialize};

pub const PHASE_ADVANCE_REWARD: f64 = 0.3;
pub const PASS_RATE_SCALE: f64 = 0.7;
pub const TOKEN_COST: f64 = 1e-4;
pub const SWITCH_COST: f64 = 0.05;
pub const TERMINAL_BONUS: f64 = 1.0;

/// Episode phases in forward order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Planning,
    Coding,
    Testing,
    Critique,
    Done,
}

impl Phase {
    fn order(&self) -> u8 {
        match self {
            Self::Planning => 0,
            Self::Coding => 1,
            Self::Testing => 2,
            Self::Critique => 3,
            Self::Done => 4,
        }
    }
}

/// State sampled at a tick boundary for reward computation.
#[derive(Debug, Clone, Copy, Default)]
pub struct StepObservation {
    pub phase: Option<Phase>,
    pub test_pass_rate: f64,
    pub tokens_used: u64,
    pub switch_committed: bool,
}

#[derive(Debug, Default)]
pub struct RewardModel;

impl RewardModel {
    pub fn new() -> Self {
        Self
    }

    pub fn step_reward(&self, prev: &StepObservation, curr: &StepObservation) -> f64 {
        let mut reward = 0.0;

        if phase_advanced(prev.phase, curr.phase) {
            reward += PHASE_ADVANCE_REWARD;
        }

        reward += PASS_RATE_SCALE * (curr.test_pass_rate - prev.test_pass_rate);

        let delta_tokens = curr.tokens_used.saturating_sub(prev.tokens_used);
        reward -= TOKEN_COST * delta_tokens as f64;

        if curr.switch_committed {
            reward -= SWITCH_COST;
        }

        reward
    }

    pub fn final_bonus(&self, success: bool) -> f64 {
        if success {
            TERMINAL_BONUS
        } else {
            0.0
        }
    }
}

fn phase_advanced(prev: Option<Phase>, curr: Option<Phase>) -> bool {
    match (prev, curr) {
        (Some(prev), Some(curr)) => curr.order() > prev.order(),
        _ => false,
    }
}
