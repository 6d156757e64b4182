//! Feature extraction for the switching policy.
//!
//! Produces the fixed 8-dimensional vector per tick:
//! three topology one-hots, normalized dwell progress, three role-group
//! message shares over a sliding window, and episode token headroom.
//! Window sums are maintained incrementally; the hot path does no sorting
//! and no percentile work.

use std::collections::VecDeque;

use crate::runtime::message::Topology;

pub const FEATURE_DIM: usize = 8;

#[derive(Debug, Clone, Copy, Default)]
struct RoleCounts {
    planner: u32,
    coder: u32,
    runner: u32,
    critic: u32,
}

impl RoleCounts {
    fn total(&self) -> u32 {
        self.planner + self.coder + self.runner + self.critic
    }
}

#[derive(Debug)]
pub struct FeatureSource {
    dwell_min_steps: u32,
    window: usize,
    committed: VecDeque<RoleCounts>,
    /// Running sums over `committed`, updated on push/evict.
    sum: RoleCounts,
    current: RoleCounts,
    topology: Topology,
    steps_since_switch: u32,
    tokens_used: u64,
    token_budget: u64,
}

impl FeatureSource {
    pub fn new(dwell_min_steps: u32, window: usize) -> Self {
        Self {
            dwell_min_steps,
            window: window.max(1),
            committed: VecDeque::with_capacity(window.max(1)),
            sum: RoleCounts::default(),
            current: RoleCounts::default(),
            topology: Topology::Star,
            steps_since_switch: 0,
            tokens_used: 0,
            token_budget: 0,
        }
    }

    /// Count one message by sender role. Unknown senders are ignored;
    /// summarizer traffic is not part of the share features.
    pub fn observe_sender(&mut self, sender: &str) {
        match sender {
            "planner" => self.current.planner += 1,
            "coder" => self.current.coder += 1,
            "runner" => self.current.runner += 1,
            "critic" => self.current.critic += 1,
            _ => {}
        }
    }

    /// Commit the current tick's counts into the sliding window.
    pub fn step(&mut self) {
        if self.committed.len() == self.window {
            if let Some(evicted) = self.committed.pop_front() {
                self.sum.planner -= evicted.planner;
                self.sum.coder -= evicted.coder;
                self.sum.runner -= evicted.runner;
                self.sum.critic -= evicted.critic;
            }
        }
        self.sum.planner += self.current.planner;
        self.sum.coder += self.current.coder;
        self.sum.runner += self.current.runner;
        self.sum.critic += self.current.critic;
        self.committed.push_back(self.current);
        self.current = RoleCounts::default();
    }

    pub fn set_topology(&mut self, topology: Topology, steps_since_switch: u32) {
        self.topology = topology;
        self.steps_since_switch = steps_since_switch;
    }

    pub fn set_budget(&mut self, used: u64, budget: u64) {
        self.tokens_used = used;
        self.token_budget = budget;
    }

    /// The 8-feature vector; every component in [0,1].
    pub fn vector(&self) -> [f64; FEATURE_DIM] {
        let one_hot = |t: Topology| if self.topology == t { 1.0 } else { 0.0 };
        let star = one_hot(Topology::Star);
        let chain = one_hot(Topology::Chain);
        let flat = one_hot(Topology::Flat);

        let dwell_norm = (f64::from(self.steps_since_switch)
            / f64::from(self.dwell_min_steps.max(1)))
        .clamp(0.0, 1.0);

        // Window totals plus the not-yet-committed current tick.
        let planner = self.sum.planner + self.current.planner;
        let coder_runner =
            self.sum.coder + self.current.coder + self.sum.runner + self.current.runner;
        let critic = self.sum.critic + self.current.critic;
        let total = self.sum.total() + self.current.total();

        let (planner_share, coder_runner_share, critic_share) = if total > 0 {
            let total = f64::from(total);
            (
                f64::from(planner) / total,
                f64::from(coder_runner) / total,
                f64::from(critic) / total,
            )
        } else {
            (0.0, 0.0, 0.0)
        };

        let headroom = if self.token_budget > 0 {
            (1.0 - self.tokens_used as f64 / self.token_budget as f64).max(0.0)
        } else {
            0.0
        };

        [
            star,
            chain,
            flat,
            dwell_norm,
            planner_share,
            coder_runner_share,
            critic_share,
            headroom,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vector_is_eight_dimensional_and_normalized() {
        let mut src = FeatureSource::new(2, 5);
        src.set_topology(Topology::Chain, 7);
        src.set_budget(2_000, 10_000);
        for _ in 0..3 {
            src.observe_sender("coder");
        }
        src.observe_sender("planner");

        let x = src.vector();
        assert_eq!(x.len(), FEATURE_DIM);
        for component in x {
            assert!((0.0..=1.0).contains(&component), "out of range: {}", component);
        }
    }

    #[test]
    fn test_topology_one_hot() {
        let mut src = FeatureSource::new(2, 5);
        src.set_topology(Topology::Flat, 0);
        let x = src.vector();
        assert_eq!(&x[0..3], &[0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_dwell_normalization_clips_at_one() {
        let mut src = FeatureSource::new(2, 5);
        src.set_topology(Topology::Star, 1);
        assert_eq!(src.vector()[3], 0.5);
        src.set_topology(Topology::Star, 10);
        assert_eq!(src.vector()[3], 1.0);
    }

    #[test]
    fn test_role_shares_sum_to_one_when_active() {
        let mut src = FeatureSource::new(2, 5);
        src.observe_sender("planner");
        src.observe_sender("coder");
        src.observe_sender("runner");
        src.observe_sender("critic");

        let x = src.vector();
        let share_sum = x[4] + x[5] + x[6];
        assert!((share_sum - 1.0).abs() < 1e-12);
        assert_eq!(x[5], 0.5); // coder + runner
    }

    #[test]
    fn test_window_evicts_old_ticks() {
        let mut src = FeatureSource::new(2, 2);
        src.observe_sender("planner");
        src.step();
        src.observe_sender("critic");
        src.step();
        // Third tick evicts the planner-only tick.
        src.observe_sender("critic");
        src.step();

        let x = src.vector();
        assert_eq!(x[4], 0.0); // planner share gone
        assert_eq!(x[6], 1.0);
    }

    #[test]
    fn test_headroom_zero_when_unbudgeted_or_exhausted() {
        let mut src = FeatureSource::new(2, 5);
        assert_eq!(src.vector()[7], 0.0);
        src.set_budget(12_000, 10_000);
        assert_eq!(src.vector()[7], 0.0);
        src.set_budget(2_500, 10_000);
        assert_eq!(src.vector()[7], 0.75);
    }

    #[test]
    fn test_quiet_window_shares_are_zero() {
        let src = FeatureSource::new(2, 5);
        let x = src.vector();
        assert_eq!(&x[4..7], &[0.0, 0.0, 0.0]);
    }
}
