//! Circuit breaker for planner services
//!
//! Stops calling a planner that keeps failing. After `reset_timeout` one trial
//! request is let through; its outcome closes or re-opens the circuit.

use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use gridwarden_core::config::PlannerConfig;
use gridwarden_core::{PlannerGateway, PlannerRequest, PlannerResponse};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests pass through
    Closed,
    /// Requests fail fast
    Open,
    /// One trial request is allowed
    HalfOpen,
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening
    pub failure_threshold: u32,
    /// Wait before a trial request
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::from(&PlannerConfig::default())
    }
}

impl From<&PlannerConfig> for CircuitBreakerConfig {
    fn from(config: &PlannerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            reset_timeout: Duration::from_secs(config.reset_timeout_secs),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Circuit breaker for one provider
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Arc<RwLock<BreakerState>>,
    provider: String,
}

impl CircuitBreaker {
    /// Closed breaker
    pub fn new(provider: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Arc::new(RwLock::new(BreakerState {
                state: CircuitState::Closed,
                failures: 0,
                opened_at: None,
                trial_in_flight: false,
            })),
            provider: provider.into(),
        }
    }

    /// Admit a request, or refuse while the circuit is open
    pub async fn can_execute(&self) -> Result<()> {
        let mut inner = self.inner.write().await;
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.config.reset_timeout {
                    tracing::info!(provider = %self.provider, "circuit breaker half-open");
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    Ok(())
                } else {
                    Err(GatewayError::CircuitOpen {
                        provider: self.provider.clone(),
                        retry_after: Some(self.config.reset_timeout - elapsed),
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    Err(GatewayError::CircuitOpen {
                        provider: self.provider.clone(),
                        retry_after: None,
                    })
                } else {
                    inner.trial_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Record a successful call
    pub async fn record_success(&self) {
        let mut inner = self.inner.write().await;
        if inner.state != CircuitState::Closed {
            tracing::info!(provider = %self.provider, "circuit breaker closed, planner recovered");
        }
        inner.state = CircuitState::Closed;
        inner.failures = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }

    /// Record a failed call
    pub async fn record_failure(&self) {
        let mut inner = self.inner.write().await;
        inner.failures += 1;
        inner.trial_in_flight = false;
        let open = match inner.state {
            CircuitState::Closed => inner.failures >= self.config.failure_threshold,
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };
        if open {
            tracing::warn!(provider = %self.provider, failures = inner.failures, "circuit breaker opened");
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
        }
    }

    /// Current state
    pub async fn state(&self) -> CircuitState {
        self.inner.read().await.state
    }

    /// Consecutive failures counted so far
    pub async fn failures(&self) -> u32 {
        self.inner.read().await.failures
    }
}

/// Planner gateway guarded by a circuit breaker
pub struct GuardedPlanner {
    inner: Arc<dyn PlannerGateway>,
    breaker: CircuitBreaker,
}

impl std::fmt::Debug for GuardedPlanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardedPlanner")
            .field("breaker", &self.breaker)
            .finish()
    }
}

impl GuardedPlanner {
    /// Wrap a gateway
    pub fn new(inner: Arc<dyn PlannerGateway>, breaker: CircuitBreaker) -> Self {
        Self { inner, breaker }
    }

    /// The breaker
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }
}

#[async_trait]
impl PlannerGateway for GuardedPlanner {
    async fn complete(&self, request: PlannerRequest) -> anyhow::Result<PlannerResponse> {
        self.breaker.can_execute().await?;
        match self.inner.complete(request).await {
            Ok(response) => {
                self.breaker.record_success().await;
                Ok(response)
            }
            Err(err) => {
                let counts = err
                    .downcast_ref::<GatewayError>()
                    .map_or(true, GatewayError::counts_as_failure);
                if counts {
                    self.breaker.record_failure().await;
                }
                Err(err)
            }
        }
    }
}
