//! Observability: structured logging, metrics collection and health reporting

pub mod health;
pub mod logging;
pub mod metrics;

// Re-export for convenience
pub use health::{HealthCheck, HealthMonitor, HealthStatus};
pub use logging::{init_logging, LogFormat, LogSettings};
pub use metrics::{MetricsCollector, MetricsSnapshot, metrics};

// Span macros for structured logging
pub use logging::{http_span, stage_span, task_span};
