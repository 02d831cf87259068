pub mod circuit_breaker;
pub mod dlq;
pub mod event;
pub mod metrics;
pub mod retry;
pub mod time;
