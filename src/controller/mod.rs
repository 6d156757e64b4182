pub mod bandit;
mod controller;
pub mod features;
pub mod reward;

pub use bandit::{Action, BanditPolicy, BanditStats, Decision};
pub use controller::{DecisionRecord, RewardRecord, SwitchAttempt, SwitchController};
pub use features::{FeatureSource, FEATURE_DIM};
pub use reward::{Phase, RewardModel, StepObservation};
