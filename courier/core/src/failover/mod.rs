//! Fault-Tolerant Delivery
//!
//! Per-channel failure isolation and recovery:
//!
//! - [`CircuitBreaker`]: stops traffic to a failing channel
//! - [`RetryExecutor`]: bounded exponential backoff for transient failures
//! - [`Batcher`]: coalesces low-priority fire-and-forget messages
//! - [`FailoverManager`]: composes the three around every registered channel

pub mod batch;
pub mod circuit_breaker;
pub mod config;
pub mod manager;
pub mod retry;

pub use batch::{Batch, Batcher, FlushReason};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerSnapshot, CircuitState};
pub use config::{BatchConfig, CircuitBreakerConfig, FailoverConfig, RetryConfig};
pub use manager::{FailoverManager, ProtectedChannel};
pub use retry::RetryExecutor;
