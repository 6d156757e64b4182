//! Scoped budget admission with reservations.
//!
//! Every external call is gated estimate → reserve → settle. Scopes are
//! independent keys (daily, per-episode, per-agent); admission requires
//! `used + reserved + safety_factor × estimate ≤ budget` in every named
//! scope. Reservations expire after a TTL, debiting the estimate as though
//! spent, so a crashed caller cannot hold a scope forever.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::BudgetConfig;
use crate::error::{ApexError, Result};
use crate::runtime::clock::Clock;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ScopeKey {
    Daily,
    Episode(String),
    Agent(String),
}

impl std::fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Daily => write!(f, "daily"),
            Self::Episode(id) => write!(f, "episode:{}", id),
            Self::Agent(role) => write!(f, "agent:{}", role),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    TokenHeadroom,
    TimeHeadroom,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BudgetDecision {
    Allowed { reservation: ReservationId },
    Denied { reasons: Vec<(ScopeKey, DenyReason)> },
}

impl BudgetDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

pub type ReservationId = String;

#[derive(Debug)]
struct Reservation {
    scopes: Vec<ScopeKey>,
    est_tokens: u64,
    est_ms: u64,
    created: Instant,
    ttl: Duration,
}

#[derive(Debug, Default)]
struct ScopeState {
    token_budget: Option<u64>,
    ms_budget: Option<u64>,
    used_tokens: u64,
    reserved_tokens: u64,
    used_ms: u64,
    reserved_ms: u64,
}

impl ScopeState {
    fn headroom(&self) -> f64 {
        match self.token_budget {
            Some(budget) if budget > 0 => {
                let committed = self.used_tokens + self.reserved_tokens;
                ((budget.saturating_sub(committed)) as f64 / budget as f64).clamp(0.0, 1.0)
            }
            _ => 0.0,
        }
    }
}

struct GuardInner {
    scopes: HashMap<ScopeKey, ScopeState>,
    reservations: HashMap<ReservationId, Reservation>,
    /// EMA of deny outcomes in [0,1]; fed to the controller as a feature.
    deny_rate: f64,
}

pub struct BudgetGuard {
    inner: Mutex<GuardInner>,
    clock: Arc<dyn Clock>,
    safety_factor: f64,
    reservation_ttl: Duration,
    episode_token_default: u64,
}

/// Smoothing constant for the deny-rate EMA.
const DENY_EMA_ALPHA: f64 = 0.2;

impl BudgetGuard {
    pub fn new(config: &BudgetConfig, clock: Arc<dyn Clock>) -> Self {
        let mut scopes = HashMap::new();
        scopes.insert(
            ScopeKey::Daily,
            ScopeState {
                token_budget: Some(config.daily_tokens),
                ..ScopeState::default()
            },
        );
        for (role, budget) in &config.agent_tokens {
            scopes.insert(
                ScopeKey::Agent(role.clone()),
                ScopeState {
                    token_budget: Some(*budget),
                    ..ScopeState::default()
                },
            );
        }

        Self {
            inner: Mutex::new(GuardInner {
                scopes,
                reservations: HashMap::new(),
                deny_rate: 0.0,
            }),
            clock,
            safety_factor: config.safety_factor,
            reservation_ttl: Duration::from_secs(config.reservation_ttl_s),
            episode_token_default: config.episode_tokens,
        }
    }

    /// Override the token budget for one scope (episode scopes default to
    /// the configured per-episode budget on first touch).
    pub fn set_token_budget(&self, scope: ScopeKey, budget: u64) {
        let mut inner = self.inner.lock();
        inner.scopes.entry(scope).or_default().token_budget = Some(budget);
    }

    pub fn set_ms_budget(&self, scope: ScopeKey, budget_ms: u64) {
        let mut inner = self.inner.lock();
        inner.scopes.entry(scope).or_default().ms_budget = Some(budget_ms);
    }

    /// Admission check and reservation across all named scopes. Denied
    /// admissions never mutate counters.
    pub fn check_and_reserve(
        &self,
        scope_tags: &[ScopeKey],
        est_tokens: u64,
        est_ms: u64,
    ) -> BudgetDecision {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        Self::expire_due(&mut inner, now);

        for tag in scope_tags {
            Self::ensure_scope(&mut inner, tag, self.episode_token_default);
        }

        let mut reasons = Vec::new();
        for tag in scope_tags {
            let scope = &inner.scopes[tag];
            if let Some(budget) = scope.token_budget {
                let projected = scope.used_tokens as f64
                    + scope.reserved_tokens as f64
                    + self.safety_factor * est_tokens as f64;
                if projected > budget as f64 {
                    reasons.push((tag.clone(), DenyReason::TokenHeadroom));
                }
            }
            if let Some(budget_ms) = scope.ms_budget {
                let projected = scope.used_ms as f64
                    + scope.reserved_ms as f64
                    + self.safety_factor * est_ms as f64;
                if projected > budget_ms as f64 {
                    reasons.push((tag.clone(), DenyReason::TimeHeadroom));
                }
            }
        }

        if !reasons.is_empty() {
            inner.deny_rate = inner.deny_rate * (1.0 - DENY_EMA_ALPHA) + DENY_EMA_ALPHA;
            debug!(?reasons, est_tokens, "budget reservation denied");
            return BudgetDecision::Denied { reasons };
        }
        inner.deny_rate *= 1.0 - DENY_EMA_ALPHA;

        for tag in scope_tags {
            let scope = inner.scopes.get_mut(tag).expect("scope ensured above");
            scope.reserved_tokens += est_tokens;
            scope.reserved_ms += est_ms;
        }

        let id = Uuid::new_v4().simple().to_string();
        inner.reservations.insert(
            id.clone(),
            Reservation {
                scopes: scope_tags.to_vec(),
                est_tokens,
                est_ms,
                created: now,
                ttl: self.reservation_ttl,
            },
        );
        BudgetDecision::Allowed { reservation: id }
    }

    /// Replace a reservation with actuals. Overshoot is allowed and
    /// accounted; the reserved slot is consumed either way.
    pub fn settle(&self, reservation: &str, actual_tokens: u64, actual_ms: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        let held = inner
            .reservations
            .remove(reservation)
            .ok_or_else(|| ApexError::ReservationNotFound(reservation.to_string()))?;

        for tag in &held.scopes {
            if let Some(scope) = inner.scopes.get_mut(tag) {
                scope.reserved_tokens = scope.reserved_tokens.saturating_sub(held.est_tokens);
                scope.reserved_ms = scope.reserved_ms.saturating_sub(held.est_ms);
                scope.used_tokens += actual_tokens;
                scope.used_ms += actual_ms;
            }
        }
        Ok(())
    }

    /// Expire overdue reservations, debiting estimates as though spent.
    /// Called lazily on admission and by the periodic sweeper.
    pub fn expire(&self) -> usize {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        Self::expire_due(&mut inner, now)
    }

    /// Spawn a background task sweeping expired reservations.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let guard = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let expired = guard.expire();
                if expired > 0 {
                    warn!(expired, "expired stale budget reservations");
                }
            }
        })
    }

    /// Remaining token headroom in [0,1] for a scope; 0 when unbudgeted.
    pub fn headroom(&self, scope: &ScopeKey) -> f64 {
        let inner = self.inner.lock();
        inner.scopes.get(scope).map_or(0.0, ScopeState::headroom)
    }

    pub fn used_tokens(&self, scope: &ScopeKey) -> u64 {
        let inner = self.inner.lock();
        inner.scopes.get(scope).map_or(0, |s| s.used_tokens)
    }

    pub fn reserved_tokens(&self, scope: &ScopeKey) -> u64 {
        let inner = self.inner.lock();
        inner.scopes.get(scope).map_or(0, |s| s.reserved_tokens)
    }

    pub fn token_budget(&self, scope: &ScopeKey) -> Option<u64> {
        let inner = self.inner.lock();
        inner.scopes.get(scope).and_then(|s| s.token_budget)
    }

    /// Deny-rate EMA in [0,1]; a controller feature input.
    pub fn deny_rate(&self) -> f64 {
        self.inner.lock().deny_rate
    }

    /// Per-scope usage snapshot for observability.
    pub fn usage_snapshot(&self) -> Vec<ScopeUsage> {
        let inner = self.inner.lock();
        let mut usage: Vec<ScopeUsage> = inner
            .scopes
            .iter()
            .map(|(key, scope)| ScopeUsage {
                scope: key.clone(),
                token_budget: scope.token_budget,
                used_tokens: scope.used_tokens,
                reserved_tokens: scope.reserved_tokens,
                used_ms: scope.used_ms,
            })
            .collect();
        usage.sort_by(|a, b| a.scope.cmp(&b.scope));
        usage
    }

    fn ensure_scope(inner: &mut GuardInner, tag: &ScopeKey, episode_default: u64) {
        if !inner.scopes.contains_key(tag) {
            let token_budget = match tag {
                ScopeKey::Episode(_) => Some(episode_default),
                _ => None,
            };
            inner.scopes.insert(
                tag.clone(),
                ScopeState {
                    token_budget,
                    ..ScopeState::default()
                },
            );
        }
    }

    fn expire_due(inner: &mut GuardInner, now: Instant) -> usize {
        let due: Vec<ReservationId> = inner
            .reservations
            .iter()
            .filter(|(_, r)| now.duration_since(r.created) >= r.ttl)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &due {
            if let Some(held) = inner.reservations.remove(id) {
                for tag in &held.scopes {
                    if let Some(scope) = inner.scopes.get_mut(tag) {
                        scope.reserved_tokens =
                            scope.reserved_tokens.saturating_sub(held.est_tokens);
                        scope.reserved_ms = scope.reserved_ms.saturating_sub(held.est_ms);
                        // Debited as though spent: a crashed caller must not
                        // hold the scope open.
                        scope.used_tokens += held.est_tokens;
                        scope.used_ms += held.est_ms;
                    }
                }
            }
        }
        due.len()
    }
}

#[derive(Debug, Clone)]
pub struct ScopeUsage {
    pub scope: ScopeKey,
    pub token_budget: Option<u64>,
    pub used_tokens: u64,
    pub reserved_tokens: u64,
    pub used_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::clock::ManualClock;

    fn guard_with(episode_tokens: u64) -> (BudgetGuard, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let config = BudgetConfig {
            episode_tokens,
            ..BudgetConfig::default()
        };
        (BudgetGuard::new(&config, clock.clone()), clock)
    }

    fn episode() -> ScopeKey {
        ScopeKey::Episode("ep-1".into())
    }

    #[test]
    fn test_denial_leaves_counters_untouched() {
        let (guard, _) = guard_with(1000);

        // 900 + 0 + 1.2 × 900 = 1980 > 1000
        let decision = guard.check_and_reserve(&[episode()], 900, 0);
        match decision {
            BudgetDecision::Denied { reasons } => {
                assert_eq!(reasons, vec![(episode(), DenyReason::TokenHeadroom)]);
            }
            other => panic!("expected denial, got {:?}", other),
        }
        assert_eq!(guard.used_tokens(&episode()), 0);
        assert_eq!(guard.reserved_tokens(&episode()), 0);
    }

    #[test]
    fn test_allow_then_settle() {
        let (guard, _) = guard_with(1000);

        // 0 + 0 + 1.2 × 500 = 600 ≤ 1000
        let decision = guard.check_and_reserve(&[episode()], 500, 0);
        let BudgetDecision::Allowed { reservation } = decision else {
            panic!("expected allow");
        };
        assert_eq!(guard.reserved_tokens(&episode()), 500);

        guard.settle(&reservation, 480, 0).unwrap();
        assert_eq!(guard.used_tokens(&episode()), 480);
        assert_eq!(guard.reserved_tokens(&episode()), 0);
    }

    #[test]
    fn test_overshoot_settle_accounted() {
        let (guard, _) = guard_with(10_000);
        let BudgetDecision::Allowed { reservation } =
            guard.check_and_reserve(&[episode()], 100, 0)
        else {
            panic!("expected allow");
        };
        guard.settle(&reservation, 250, 0).unwrap();
        assert_eq!(guard.used_tokens(&episode()), 250);
    }

    #[test]
    fn test_reservation_expiry_debits_estimate() {
        let (guard, clock) = guard_with(1000);
        let decision = guard.check_and_reserve(&[episode()], 300, 0);
        assert!(decision.is_allowed());

        // Exactly at TTL counts as expired.
        clock.advance(Duration::from_secs(10));
        assert_eq!(guard.expire(), 1);
        assert_eq!(guard.used_tokens(&episode()), 300);
        assert_eq!(guard.reserved_tokens(&episode()), 0);
    }

    #[test]
    fn test_settle_after_expiry_errors() {
        let (guard, clock) = guard_with(1000);
        let BudgetDecision::Allowed { reservation } =
            guard.check_and_reserve(&[episode()], 300, 0)
        else {
            panic!("expected allow");
        };
        clock.advance(Duration::from_secs(11));
        guard.expire();
        assert!(matches!(
            guard.settle(&reservation, 100, 0),
            Err(ApexError::ReservationNotFound(_))
        ));
    }

    #[test]
    fn test_multi_scope_denial_names_the_scope() {
        let (guard, _) = guard_with(100_000);
        guard.set_token_budget(ScopeKey::Agent("coder".into()), 100);

        let decision =
            guard.check_and_reserve(&[episode(), ScopeKey::Agent("coder".into())], 200, 0);
        match decision {
            BudgetDecision::Denied { reasons } => {
                assert_eq!(
                    reasons,
                    vec![(ScopeKey::Agent("coder".into()), DenyReason::TokenHeadroom)]
                );
            }
            other => panic!("expected denial, got {:?}", other),
        }
        // Neither scope was mutated.
        assert_eq!(guard.reserved_tokens(&episode()), 0);
    }

    #[test]
    fn test_reserved_plus_used_never_exceeds_budget() {
        let (guard, _) = guard_with(1000);
        let mut reservations = Vec::new();
        for _ in 0..10 {
            if let BudgetDecision::Allowed { reservation } =
                guard.check_and_reserve(&[episode()], 200, 0)
            {
                reservations.push(reservation);
            }
            let total = guard.used_tokens(&episode()) + guard.reserved_tokens(&episode());
            assert!(total <= 1000);
        }
        for r in reservations {
            guard.settle(&r, 200, 0).unwrap();
            let total = guard.used_tokens(&episode()) + guard.reserved_tokens(&episode());
            assert!(total <= 1000);
        }
    }

    #[test]
    fn test_ms_budget_denial() {
        let (guard, _) = guard_with(100_000);
        guard.set_ms_budget(episode(), 1000);

        let decision = guard.check_and_reserve(&[episode()], 10, 900);
        match decision {
            BudgetDecision::Denied { reasons } => {
                assert_eq!(reasons, vec![(episode(), DenyReason::TimeHeadroom)]);
            }
            other => panic!("expected denial, got {:?}", other),
        }
    }

    #[test]
    fn test_headroom_and_deny_rate_signal() {
        let (guard, _) = guard_with(1000);
        assert_eq!(guard.deny_rate(), 0.0);

        guard.check_and_reserve(&[episode()], 2000, 0);
        assert!(guard.deny_rate() > 0.0);

        let BudgetDecision::Allowed { reservation } =
            guard.check_and_reserve(&[episode()], 100, 0)
        else {
            panic!("expected allow");
        };
        guard.settle(&reservation, 100, 0).unwrap();
        assert!((guard.headroom(&episode()) - 0.9).abs() < 1e-9);
    }
}
