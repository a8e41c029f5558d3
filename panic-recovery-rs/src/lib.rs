//! # Panic Recovery
//!
//! A panic-recovery interceptor for gRPC servers. A panic inside one request
//! handler becomes a single failed request: the panic value and a stack
//! trace are logged server-side and the caller receives a generic
//! `INTERNAL` error, while every other in-flight request keeps running.
//!
//! ## Features
//!
//! - `RecoveryHandlerFunc` policy: log the panic, return a generic error
//! - Per-task recovery guards for closures and futures
//! - Tower middleware for tonic/hyper services
//! - Optional panic hook recording the panic site
//! - Structured logging through `tracing`
//!

pub mod types;
pub mod stack;
pub mod logging;
pub mod handler;
pub mod boundary;
pub mod layer;
pub mod config;

// Re-export commonly used types
pub use types::{FailureValue, OpaquePayload, RecoveryError, Result};
pub use stack::{StackFrame, StackSnapshot};
pub use logging::{init_logging, FieldValue, InitError, InterceptLogger, LoggingConfig, MemoryLogger, TracingLogger, UNPRINTABLE_VALUE};
pub use handler::{new_panic_handler, RecoveryHandlerFunc, PANIC_LOG_MESSAGE};
pub use boundary::{install_panic_hook, recover, recover_async, HookConfig};
pub use layer::{status_for, RecoveryLayer, RecoveryMiddleware};
pub use crate::config::{ConfigError, RecoveryConfig};

use std::sync::Arc;

/// Sets up logging and the panic hook from `config` and returns the
/// recovery handler to register with the transport layer.
pub fn init(config: &RecoveryConfig) -> std::result::Result<RecoveryHandlerFunc, InitError> {
    init_logging(Some(config.logging.clone()))?;
    install_panic_hook(&config.hook);

    let logger = Arc::new(TracingLogger::new(config.logging.service_name.clone()));
    Ok(new_panic_handler(logger))
}
