//! Failure isolation: circuit breakers and bounded retries.

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{
    BreakerError, BreakerSnapshot, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState,
};
pub use retry::{apply_jitter, calculate_backoff, BackoffPolicy, RetryManager};
