pub mod circuit_breaker;
pub mod invoker;
pub mod registry;

pub use circuit_breaker::{
    BreakerMetrics, CallOutcome, CallPermission, CallPermit, CircuitBreaker, CircuitState,
};
pub use invoker::{BackendInvoker, BackendRequest, BackendResponse, HttpInvoker, InvokeError};
pub use registry::BreakerRegistry;
