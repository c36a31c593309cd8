//! Circuit breaker for upstream protection.
//!
//! # States
//! - Closed: normal operation, calls pass through
//! - Open: dependency assumed down, calls fail fast
//! - Half-Open: a single trial call tests recovery
//!
//! # State Transitions
//! ```text
//! Closed → Open: failures within the rolling window >= threshold
//! Open → Half-Open: after the cool-down
//! Half-Open → Closed: trial call succeeds (counters reset)
//! Half-Open → Open: trial call fails (fresh cool-down)
//! ```
//!
//! State is per process. Instances behind a load balancer each keep their own view.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;

use crate::config::ResilienceConfig;
use crate::observability::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub rolling_window: Duration,
    pub cooldown: Duration,
}

impl From<&ResilienceConfig> for BreakerSettings {
    fn from(config: &ResilienceConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            rolling_window: Duration::from_secs(config.rolling_window_secs),
            cooldown: Duration::from_secs(config.cooldown_secs),
        }
    }
}

/// Rejection while open, with the remaining cool-down when known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejected {
    pub retry_after: Option<Duration>,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    settings: BreakerSettings,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, settings: BreakerSettings) -> Self {
        Self {
            name: name.into(),
            settings,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Ask to make one call. The returned permit must be resolved with the outcome;
    /// dropping it unresolved releases a half-open trial slot without recording anything.
    pub fn try_acquire(self: &Arc<Self>) -> Result<Permit, Rejected> {
        let now = Instant::now();
        let mut inner = self.lock();

        match inner.state {
            CircuitState::Closed => Ok(self.permit(false)),
            CircuitState::Open => {
                let opened_at = inner.opened_at.unwrap_or(now);
                let elapsed = now.saturating_duration_since(opened_at);
                if elapsed < self.settings.cooldown {
                    return Err(Rejected {
                        retry_after: Some(self.settings.cooldown - elapsed),
                    });
                }
                self.transition(&mut inner, CircuitState::HalfOpen);
                inner.trial_in_flight = true;
                Ok(self.permit(true))
            }
            CircuitState::HalfOpen if inner.trial_in_flight => Err(Rejected { retry_after: None }),
            CircuitState::HalfOpen => {
                inner.trial_in_flight = true;
                Ok(self.permit(true))
            }
        }
    }

    /// Recent failures and time spent open, for status endpoints.
    pub fn snapshot(&self) -> CircuitSnapshot {
        let now = Instant::now();
        let mut inner = self.lock();
        self.prune(&mut inner, now);
        CircuitSnapshot {
            name: self.name.clone(),
            state: inner.state,
            recent_failures: inner.failures.len(),
            open_for_secs: inner
                .opened_at
                .filter(|_| inner.state != CircuitState::Closed)
                .map(|at| now.saturating_duration_since(at).as_secs()),
        }
    }

    fn permit(self: &Arc<Self>, trial: bool) -> Permit {
        Permit {
            breaker: Arc::clone(self),
            trial,
            resolved: false,
        }
    }

    fn on_success(&self, trial: bool) {
        let mut inner = self.lock();
        inner.failures.clear();
        if trial {
            inner.trial_in_flight = false;
            inner.opened_at = None;
            self.transition(&mut inner, CircuitState::Closed);
        }
    }

    fn on_failure(&self, trial: bool) {
        let now = Instant::now();
        let mut inner = self.lock();

        if trial {
            inner.trial_in_flight = false;
            inner.opened_at = Some(now);
            self.transition(&mut inner, CircuitState::Open);
            return;
        }
        if inner.state != CircuitState::Closed {
            return;
        }

        inner.failures.push_back(now);
        self.prune(&mut inner, now);
        if inner.failures.len() >= self.settings.failure_threshold as usize {
            inner.opened_at = Some(now);
            self.transition(&mut inner, CircuitState::Open);
        }
    }

    fn on_abandon(&self, trial: bool) {
        if trial {
            self.lock().trial_in_flight = false;
        }
    }

    fn prune(&self, inner: &mut Inner, now: Instant) {
        while let Some(&oldest) = inner.failures.front() {
            if now.saturating_duration_since(oldest) > self.settings.rolling_window {
                inner.failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState) {
        if inner.state == to {
            return;
        }
        let from = inner.state;
        inner.state = to;
        if to == CircuitState::Closed {
            inner.failures.clear();
        }

        match to {
            CircuitState::Open => tracing::warn!(
                dependency = %self.name,
                from = ?from,
                cooldown_secs = self.settings.cooldown.as_secs(),
                "Circuit opened"
            ),
            _ => tracing::info!(
                dependency = %self.name,
                from = ?from,
                to = ?to,
                "Circuit state changed"
            ),
        }
        metrics::record_circuit_state(&self.name, to);
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Permission for one call through a breaker.
#[must_use = "resolve the permit with the call outcome"]
#[derive(Debug)]
pub struct Permit {
    breaker: Arc<CircuitBreaker>,
    trial: bool,
    resolved: bool,
}

impl Permit {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.resolved = true;
        self.breaker.on_success(self.trial);
    }

    pub fn failure(mut self) {
        self.resolved = true;
        self.breaker.on_failure(self.trial);
    }

    /// The dependency answered with a non-transient error. It does not count as a
    /// failure; a half-open trial that gets this far proves the dependency reachable.
    pub fn neutral(mut self) {
        self.resolved = true;
        if self.trial {
            self.breaker.on_success(true);
        }
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if !self.resolved {
            self.breaker.on_abandon(self.trial);
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub recent_failures: usize,
    pub open_for_secs: Option<u64>,
}

/// One breaker per named dependency.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    settings: BreakerSettings,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            breakers: DashMap::new(),
        }
    }

    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(name) {
            return Arc::clone(existing.value());
        }
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.settings)))
            .value()
            .clone()
    }

    /// Snapshots sorted by dependency name.
    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let mut all: Vec<_> = self.breakers.iter().map(|b| b.value().snapshot()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32) -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(
            "api",
            BreakerSettings {
                failure_threshold: threshold,
                rolling_window: Duration::from_secs(60),
                cooldown: Duration::from_secs(30),
            },
        ))
    }

    fn fail(b: &Arc<CircuitBreaker>, n: u32) {
        for _ in 0..n {
            b.try_acquire().unwrap().failure();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_and_rejects() {
        let b = breaker(3);
        fail(&b, 2);
        assert_eq!(b.state(), CircuitState::Closed);
        fail(&b, 1);
        assert_eq!(b.state(), CircuitState::Open);

        let rejected = b.try_acquire().unwrap_err();
        assert_eq!(rejected.retry_after, Some(Duration::from_secs(30)));
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_failure_count() {
        let b = breaker(3);
        fail(&b, 2);
        b.try_acquire().unwrap().success();
        fail(&b, 2);
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_outside_window_do_not_count() {
        let b = breaker(3);
        fail(&b, 2);
        tokio::time::advance(Duration::from_secs(61)).await;
        fail(&b, 2);
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn single_trial_after_cooldown() {
        let b = breaker(1);
        fail(&b, 1);
        tokio::time::advance(Duration::from_secs(30)).await;

        let trial = b.try_acquire().unwrap();
        assert!(trial.is_trial());
        assert_eq!(b.state(), CircuitState::HalfOpen);
        assert!(b.try_acquire().is_err());

        trial.success();
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.snapshot().recent_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_trial_reopens_with_fresh_cooldown() {
        let b = breaker(1);
        fail(&b, 1);
        tokio::time::advance(Duration::from_secs(31)).await;

        b.try_acquire().unwrap().failure();
        assert_eq!(b.state(), CircuitState::Open);
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(
            b.try_acquire().unwrap_err().retry_after,
            Some(Duration::from_secs(20))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_trial_releases_slot() {
        let b = breaker(1);
        fail(&b, 1);
        tokio::time::advance(Duration::from_secs(30)).await;

        drop(b.try_acquire().unwrap());
        assert_eq!(b.state(), CircuitState::HalfOpen);
        assert!(b.try_acquire().unwrap().is_trial());
    }

    #[tokio::test(start_paused = true)]
    async fn neutral_outcome_does_not_count() {
        let b = breaker(2);
        for _ in 0..5 {
            b.try_acquire().unwrap().neutral();
        }
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn registry_shares_breakers_by_name() {
        let settings = BreakerSettings::from(&ResilienceConfig::default());
        let registry = CircuitBreakerRegistry::new(settings);
        let a = registry.get("api");
        assert!(Arc::ptr_eq(&a, &registry.get("api")));
        registry.get("accounts");

        let names: Vec<_> = registry.snapshot().into_iter().map(|s| s.name).collect();
        assert_eq!(names, ["accounts", "api"]);
    }
}
