//! APEX: a single-host coordination runtime for small teams of
//! role-specialized agents.
//!
//! The inter-agent communication topology (Star, Chain, Flat) is a
//! first-class, runtime-switchable primitive: a topology-enforcing router
//! with epoch-gated dual queues, an atomic PREPARE → QUIESCE → COMMIT/ABORT
//! switch engine, a coordinator FSM with dwell and cooldown, scoped
//! token/time budgets with reservations, and a contextual-bandit switching
//! controller under hard latency bounds.

pub mod agents;
pub mod budget;
pub mod config;
pub mod controller;
pub mod coordinator;
pub mod error;
pub mod integrations;
pub mod metrics;
pub mod runtime;

pub use budget::{BudgetDecision, BudgetGuard, ScopeKey, TokenEstimator};
pub use config::ApexConfig;
pub use controller::{Action, DecisionRecord, StepObservation, SwitchController};
pub use coordinator::{Coordinator, SwitchRequest, TopologyChanged, TopologyStatus};
pub use error::{ApexError, Result};
pub use metrics::RuntimeMetrics;
pub use runtime::{
    DropReason, Message, Payload, Recipient, Role, RouteOutcome, Router, SwitchEngine,
    SwitchOutcome, Topology,
};
