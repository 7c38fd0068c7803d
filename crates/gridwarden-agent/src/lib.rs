//! # GridWarden Agent
//!
//! Network-facing planner gateways for `gridwarden-core`.
//!
//! - [`OpenAiPlanner`]: chat-completions client implementing `PlannerGateway`
//! - [`GuardedPlanner`]: wraps any gateway with a [`CircuitBreaker`]
//! - [`connect`]: builds the guarded gateway from `PlannerConfig`

#![deny(unsafe_code)]
#![warn(missing_debug_implementations, rust_2018_idioms)]

pub mod circuit_breaker;
pub mod error;
pub mod openai;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState, GuardedPlanner};
pub use error::{GatewayError, Result};
pub use openai::OpenAiPlanner;

use gridwarden_core::config::PlannerConfig;
use gridwarden_core::PlannerGateway;
use std::sync::Arc;

/// Planner gateway for the configured endpoint, behind a circuit breaker
pub fn connect(config: &PlannerConfig) -> Result<Arc<dyn PlannerGateway>> {
    let planner = OpenAiPlanner::from_config(config)?;
    tracing::info!(provider = %planner.name, base_url = %config.base_url, model = %config.model, "planner gateway ready");
    let breaker = CircuitBreaker::new(planner.name.clone(), CircuitBreakerConfig::from(config));
    Ok(Arc::new(GuardedPlanner::new(Arc::new(planner), breaker)))
}
