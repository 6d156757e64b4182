//! LLM client surface.
//!
//! The backend itself is an external collaborator; the core consumes a
//! narrow stateless-per-call contract and provides a deterministic mock
//! plus a budget-gated wrapper running the estimate → reserve → generate →
//! settle lifecycle.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::budget::{BudgetDecision, BudgetGuard, ScopeKey, TokenEstimator};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmStatus {
    Ok,
    Timeout,
    Error,
    BudgetDenied,
}

#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub prompt: String,
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl GenerateRequest {
    pub fn new(prompt: impl Into<String>, max_tokens: u32, timeout: Duration) -> Self {
        Self {
            prompt: prompt.into(),
            max_tokens,
            timeout,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Generation {
    pub text: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub status: LlmStatus,
}

impl Generation {
    pub fn total_tokens(&self) -> u64 {
        self.tokens_in + self.tokens_out
    }

    fn empty(status: LlmStatus) -> Self {
        Self {
            text: String::new(),
            tokens_in: 0,
            tokens_out: 0,
            status,
        }
    }
}

/// Stateless-per-call generation contract; session isolation is the
/// caller's concern.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn generate(&self, request: &GenerateRequest) -> Result<Generation>;
}

/// Deterministic mock backend for tests and offline runs.
pub struct MockLlm {
    /// Artificial per-call latency.
    latency: Duration,
}

impl MockLlm {
    pub fn new() -> Self {
        Self {
            latency: Duration::ZERO,
        }
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self { latency }
    }
}

impl Default for MockLlm {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn generate(&self, request: &GenerateRequest) -> Result<Generation> {
        if self.latency > request.timeout {
            return Ok(Generation::empty(LlmStatus::Timeout));
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let text = format!("mock response ({} prompt bytes)", request.prompt.len());
        let tokens_in = (request.prompt.len() / 4) as u64;
        let tokens_out = (text.len() / 4) as u64;
        Ok(Generation {
            text,
            tokens_in,
            tokens_out,
            status: LlmStatus::Ok,
        })
    }
}

/// Budget-gated client: reserves against the named scopes before calling
/// the inner backend and settles with actuals afterwards. A denial surfaces
/// as `BudgetDenied` without touching the backend.
pub struct BudgetedLlm<C> {
    inner: C,
    budget: Arc<BudgetGuard>,
    estimator: Arc<dyn TokenEstimator>,
    scopes: Vec<ScopeKey>,
}

impl<C: LlmClient> BudgetedLlm<C> {
    pub fn new(
        inner: C,
        budget: Arc<BudgetGuard>,
        estimator: Arc<dyn TokenEstimator>,
        scopes: Vec<ScopeKey>,
    ) -> Self {
        Self {
            inner,
            budget,
            estimator,
            scopes,
        }
    }
}

#[async_trait]
impl<C: LlmClient> LlmClient for BudgetedLlm<C> {
    async fn generate(&self, request: &GenerateRequest) -> Result<Generation> {
        let est_tokens =
            self.estimator.estimate(&request.prompt) + u64::from(request.max_tokens);
        let est_ms = request.timeout.as_millis() as u64;

        let reservation = match self.budget.check_and_reserve(&self.scopes, est_tokens, est_ms) {
            BudgetDecision::Allowed { reservation } => reservation,
            BudgetDecision::Denied { reasons } => {
                debug!(?reasons, est_tokens, "generation denied by budget");
                return Ok(Generation::empty(LlmStatus::BudgetDenied));
            }
        };

        let started = Instant::now();
        let outcome = tokio::time::timeout(request.timeout, self.inner.generate(request)).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let generation = match outcome {
            Ok(Ok(generation)) => generation,
            Ok(Err(e)) => {
                warn!(error = %e, "backend generation failed");
                Generation::empty(LlmStatus::Error)
            }
            Err(_) => Generation::empty(LlmStatus::Timeout),
        };

        self.budget
            .settle(&reservation, generation.total_tokens(), elapsed_ms)?;
        Ok(generation)
    }
}
