//! ε-greedy ridge contextual bandit over the four switching arms.
//!
//! Per arm the policy keeps the ridge design state `A = λI + Σ xxᵀ` as its
//! cached inverse (Sherman–Morrison updates) and `b = Σ r·x`, with weights
//! `w = A⁻¹ b`. The RNG is injected; given the same `(x, r, seed)` sequence
//! the weight trajectory and decisions are bit-identical across runs.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::config::ControllerConfig;
use crate::runtime::message::Topology;

use super::features::FEATURE_DIM;

const N_ACTIONS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Stay,
    Star,
    Chain,
    Flat,
}

impl Action {
    pub const ALL: [Action; N_ACTIONS] = [Action::Stay, Action::Star, Action::Chain, Action::Flat];

    pub fn index(&self) -> usize {
        match self {
            Self::Stay => 0,
            Self::Star => 1,
            Self::Chain => 2,
            Self::Flat => 3,
        }
    }

    pub fn from_index(index: usize) -> Action {
        Self::ALL[index % N_ACTIONS]
    }

    /// Topology this arm steers toward; `None` for stay.
    pub fn target(&self) -> Option<Topology> {
        match self {
            Self::Stay => None,
            Self::Star => Some(Topology::Star),
            Self::Chain => Some(Topology::Chain),
            Self::Flat => Some(Topology::Flat),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stay => "stay",
            Self::Star => "star",
            Self::Chain => "chain",
            Self::Flat => "flat",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    pub action: Action,
    pub epsilon: f64,
    /// True when this decision explored rather than exploited.
    pub explored: bool,
}

#[derive(Debug, Clone)]
pub struct BanditStats {
    pub decisions: u64,
    pub action_counts: [u64; N_ACTIONS],
    pub current_epsilon: f64,
}

type Vector = [f64; FEATURE_DIM];
type Matrix = [[f64; FEATURE_DIM]; FEATURE_DIM];

pub struct BanditPolicy {
    a_inv: [Matrix; N_ACTIONS],
    b: [Vector; N_ACTIONS],
    w: [Vector; N_ACTIONS],
    epsilon_start: f64,
    epsilon_end: f64,
    schedule_n: u64,
    decisions: u64,
    action_counts: [u64; N_ACTIONS],
    rng: StdRng,
}

impl BanditPolicy {
    pub fn new(config: &ControllerConfig, seed: u64) -> Self {
        let mut identity_over_lambda = [[0.0; FEATURE_DIM]; FEATURE_DIM];
        for (i, row) in identity_over_lambda.iter_mut().enumerate() {
            row[i] = 1.0 / config.ridge_lambda;
        }

        Self {
            a_inv: [identity_over_lambda; N_ACTIONS],
            b: [[0.0; FEATURE_DIM]; N_ACTIONS],
            w: [[0.0; FEATURE_DIM]; N_ACTIONS],
            epsilon_start: config.epsilon_start,
            epsilon_end: config.epsilon_end,
            schedule_n: config.epsilon_schedule_n,
            decisions: 0,
            action_counts: [0; N_ACTIONS],
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// ε for a given global decision count: linear from start to end over
    /// the first `schedule_n` decisions, constant afterwards. Pure in the
    /// count so the schedule is reproducible from it alone.
    pub fn epsilon_at(&self, decision_count: u64) -> f64 {
        if decision_count >= self.schedule_n {
            return self.epsilon_end;
        }
        let progress = decision_count as f64 / self.schedule_n as f64;
        self.epsilon_start - (self.epsilon_start - self.epsilon_end) * progress
    }

    pub fn decide(&mut self, x: &Vector) -> Decision {
        let epsilon = self.epsilon_at(self.decisions);

        let explored = self.rng.gen::<f64>() < epsilon;
        let action = if explored {
            Action::from_index(self.rng.gen_range(0..N_ACTIONS))
        } else {
            let mut best = 0;
            let mut best_score = dot(&self.w[0], x);
            for (arm, w) in self.w.iter().enumerate().skip(1) {
                let score = dot(w, x);
                if score > best_score {
                    best = arm;
                    best_score = score;
                }
            }
            Action::from_index(best)
        };

        self.decisions += 1;
        self.action_counts[action.index()] += 1;
        Decision {
            action,
            epsilon,
            explored,
        }
    }

    /// Fold an observed reward into the chosen arm:
    /// `A⁻¹ ← A⁻¹ − (A⁻¹x)(A⁻¹x)ᵀ / (1 + xᵀA⁻¹x)`, `b ← b + r·x`,
    /// `w ← A⁻¹ b`.
    pub fn update(&mut self, x: &Vector, action: Action, reward: f64) {
        let arm = action.index();

        let ax = mat_vec(&self.a_inv[arm], x);
        let denom = 1.0 + dot(x, &ax);
        for i in 0..FEATURE_DIM {
            for j in 0..FEATURE_DIM {
                self.a_inv[arm][i][j] -= ax[i] * ax[j] / denom;
            }
        }

        for (b, &xi) in self.b[arm].iter_mut().zip(x.iter()) {
            *b += reward * xi;
        }
        self.w[arm] = mat_vec(&self.a_inv[arm], &self.b[arm]);
    }

    pub fn weights(&self, action: Action) -> &Vector {
        &self.w[action.index()]
    }

    pub fn decision_count(&self) -> u64 {
        self.decisions
    }

    pub fn stats(&self) -> BanditStats {
        BanditStats {
            decisions: self.decisions,
            action_counts: self.action_counts,
            current_epsilon: self.epsilon_at(self.decisions),
        }
    }
}

fn dot(a: &Vector, b: &Vector) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

fn mat_vec(m: &Matrix, v: &Vector) -> Vector {
    let mut out = [0.0; FEATURE_DIM];
    for (i, row) in m.iter().enumerate() {
        out[i] = dot(row, v);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(seed: u64) -> BanditPolicy {
        BanditPolicy::new(&ControllerConfig::default(), seed)
    }

    #[test]
    fn test_epsilon_schedule_endpoints() {
        let bandit = policy(0);
        assert_eq!(bandit.epsilon_at(0), 0.20);
        assert_eq!(bandit.epsilon_at(5000), 0.05);
        assert_eq!(bandit.epsilon_at(100_000), 0.05);

        // Linear midpoint.
        let mid = bandit.epsilon_at(2500);
        assert!((mid - 0.125).abs() < 1e-12);
    }

    #[test]
    fn test_decisions_deterministic_for_same_seed() {
        let mut a = policy(42);
        let mut b = policy(42);
        let x = [0.5; FEATURE_DIM];

        for step in 0..200 {
            let da = a.decide(&x);
            let db = b.decide(&x);
            assert_eq!(da, db, "diverged at step {}", step);
            let reward = (step % 3) as f64 * 0.1;
            a.update(&x, da.action, reward);
            b.update(&x, db.action, reward);
        }
        for action in Action::ALL {
            assert_eq!(a.weights(action), b.weights(action));
        }
    }

    #[test]
    fn test_different_seeds_diverge() {
        let mut a = policy(1);
        let mut b = policy(2);
        let x = [0.5; FEATURE_DIM];

        let mut any_difference = false;
        for _ in 0..100 {
            if a.decide(&x) != b.decide(&x) {
                any_difference = true;
                break;
            }
        }
        assert!(any_difference);
    }

    #[test]
    fn test_update_pulls_argmax_toward_rewarded_arm() {
        let mut bandit = policy(7);
        let x = [1.0, 0.0, 0.0, 0.5, 0.2, 0.6, 0.2, 0.8];

        for _ in 0..50 {
            bandit.update(&x, Action::Chain, 1.0);
            bandit.update(&x, Action::Flat, -0.5);
        }

        let chain_score: f64 = bandit
            .weights(Action::Chain)
            .iter()
            .zip(x.iter())
            .map(|(w, xi)| w * xi)
            .sum();
        let flat_score: f64 = bandit
            .weights(Action::Flat)
            .iter()
            .zip(x.iter())
            .map(|(w, xi)| w * xi)
            .sum();
        assert!(chain_score > flat_score);
    }

    #[test]
    fn test_sherman_morrison_matches_definition() {
        // After one update with x, A = λI + xxᵀ. Check A · A⁻¹ ≈ I.
        let mut bandit = policy(0);
        let x = [0.3, 0.1, 0.0, 0.9, 0.5, 0.2, 0.7, 0.4];
        bandit.update(&x, Action::Stay, 1.0);

        let lambda = ControllerConfig::default().ridge_lambda;
        let mut a = [[0.0; FEATURE_DIM]; FEATURE_DIM];
        for i in 0..FEATURE_DIM {
            for j in 0..FEATURE_DIM {
                a[i][j] = x[i] * x[j];
                if i == j {
                    a[i][j] += lambda;
                }
            }
        }

        let a_inv = &bandit.a_inv[Action::Stay.index()];
        for i in 0..FEATURE_DIM {
            for j in 0..FEATURE_DIM {
                let mut product = 0.0;
                for (k, a_inv_row) in a_inv.iter().enumerate() {
                    product += a[i][k] * a_inv_row[j];
                }
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!(
                    (product - expected).abs() < 1e-9,
                    "A·A⁻¹[{}][{}] = {}",
                    i,
                    j,
                    product
                );
            }
        }
    }

    #[test]
    fn test_action_roundtrip() {
        for action in Action::ALL {
            assert_eq!(Action::from_index(action.index()), action);
        }
        assert_eq!(Action::Stay.target(), None);
        assert_eq!(Action::Chain.target(), Some(Topology::Chain));
    }
}
