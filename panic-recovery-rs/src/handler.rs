//! # Panic Handler
//!
//! Builds the `RecoveryHandlerFunc` the transport layer calls after a
//! request handler panics.

use std::sync::Arc;

use crate::boundary::recovered_panic_site;
use crate::logging::{FieldValue, InterceptLogger};
use crate::types::{FailureValue, RecoveryError};

/// Message of the log entry written for every recovered panic
pub const PANIC_LOG_MESSAGE: &str = "panic serving grpc request";

/// A recovery policy: turns a panic payload into the error returned to the
/// transport layer.
pub type RecoveryHandlerFunc = Arc<dyn Fn(FailureValue) -> RecoveryError + Send + Sync>;

/// Returns a `RecoveryHandlerFunc` that logs the panic and the stack trace
/// of the thread that recovered it, then returns the generic
/// `RecoveryError`.
///
/// When the call comes from `recover` or `recover_async` and the panic hook
/// recorded where the panic was raised, that site is attached as well. A
/// direct call never picks up hook data.
pub fn new_panic_handler<L>(logger: Arc<L>) -> RecoveryHandlerFunc
where
    L: InterceptLogger + ?Sized + 'static,
{
    Arc::new(move |failure: FailureValue| {
        let stack = logger.stacktrace();
        let site = recovered_panic_site();

        let mut fields = vec![
            ("panic", FieldValue::Failure(&failure)),
            ("stack", FieldValue::Stack(&stack)),
        ];
        if let Some(site) = &site {
            fields.push(("panic_location", FieldValue::Text(&site.location)));
            if let Some(panic_stack) = &site.stack {
                fields.push(("panic_stack", FieldValue::Stack(panic_stack)));
            }
        }

        logger.error(PANIC_LOG_MESSAGE, &fields);

        RecoveryError
    })
}
