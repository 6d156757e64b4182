pub mod estimator;
pub mod guard;

pub use estimator::{HeuristicEstimator, TiktokenEstimator, TokenEstimator};
pub use guard::{
    BudgetDecision, BudgetGuard, DenyReason, ReservationId, ScopeKey, ScopeUsage,
};
