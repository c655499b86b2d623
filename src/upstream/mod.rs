pub mod circuit_breaker;
pub mod health;
pub mod loadbalance;

pub use circuit_breaker::{BreakerCheck, BreakerError, BreakerState, CircuitBreakerManager};
pub use health::{HealthMonitor, ProbeOutcome, SystemHealthSnapshot};
pub use loadbalance::{ConnectionGuard, LoadBalancer, Strategy};
