//! Gateway error types

use std::time::Duration;
use thiserror::Error;

/// Result alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Errors raised while talking to a planner service
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Transport failure (connect, timeout, TLS)
    #[error("planner request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success HTTP status
    #[error("planner API error ({status}): {body}")]
    Api {
        /// HTTP status code
        status: u16,
        /// Response body, as returned
        body: String,
    },

    /// The response had no usable choice
    #[error("planner returned no completion")]
    EmptyCompletion,

    /// Requests are being refused until the service recovers
    #[error("circuit breaker open for {provider}{}", retry_hint(.retry_after))]
    CircuitOpen {
        /// Provider name
        provider: String,
        /// Time left before a trial request is allowed
        retry_after: Option<Duration>,
    },

    /// The configured key variable is unset
    #[error("API key variable {0} is not set")]
    MissingApiKey(String),
}

fn retry_hint(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(wait) => format!(" - retry after {:?}", wait),
        None => String::new(),
    }
}

impl GatewayError {
    /// Whether the failure says something about the service's health
    pub fn counts_as_failure(&self) -> bool {
        match self {
            GatewayError::Http(_) | GatewayError::EmptyCompletion => true,
            GatewayError::Api { status, .. } => *status == 429 || *status >= 500,
            GatewayError::CircuitOpen { .. } | GatewayError::MissingApiKey(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_do_not_trip_the_breaker() {
        let bad_request = GatewayError::Api {
            status: 400,
            body: "bad".into(),
        };
        assert!(!bad_request.counts_as_failure());
        let overloaded = GatewayError::Api {
            status: 503,
            body: "busy".into(),
        };
        assert!(overloaded.counts_as_failure());
        assert!(GatewayError::EmptyCompletion.counts_as_failure());
    }

    #[test]
    fn open_circuit_mentions_the_wait() {
        let err = GatewayError::CircuitOpen {
            provider: "openai".into(),
            retry_after: Some(Duration::from_secs(5)),
        };
        assert_eq!(err.to_string(), "circuit breaker open for openai - retry after 5s");
    }
}
