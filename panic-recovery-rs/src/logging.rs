//! # Structured Logging
//!
//! This module defines the logging collaborator the recovery handler
//! reports through, a `tracing`-backed implementation of it, an in-memory
//! implementation, and the process-wide subscriber setup.

use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::{DefaultFields, Format};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{fmt as tracing_fmt, layer::SubscriberExt, EnvFilter, Registry};

use crate::stack::StackSnapshot;
use crate::types::FailureValue;

// Flag to track if logging has been initialized
static LOGGING_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Written in place of a value whose `Display` implementation fails
pub const UNPRINTABLE_VALUE: &str = "<unprintable panic payload>";

// Keeps the non-blocking file writer flushing for the life of the process
static FILE_GUARD: OnceCell<WorkerGuard> = OnceCell::new();

/// Errors raised while installing the global subscriber
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("Failed to set global subscriber: {0}")]
    Subscriber(#[from] tracing::subscriber::SetGlobalDefaultError),

    #[error("File output enabled but no log directory configured")]
    MissingLogDir,
}

/// A value attached to a log entry
#[derive(Debug, Clone, Copy)]
pub enum FieldValue<'a> {
    Failure(&'a FailureValue),
    Stack(&'a StackSnapshot),
    Text(&'a str),
}

impl fmt::Display for FieldValue<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Failure(value) => write!(f, "{}", value),
            FieldValue::Stack(stack) => write!(f, "{}", stack),
            FieldValue::Text(text) => write!(f, "{}", text),
        }
    }
}

impl FieldValue<'_> {
    /// Renders the value for a log entry.
    ///
    /// A payload whose `Display` returns an error is replaced by
    /// `UNPRINTABLE_VALUE` instead of panicking like `to_string` would.
    pub fn render(&self) -> String {
        let mut rendered = String::new();
        match write!(rendered, "{}", self) {
            Ok(()) => rendered,
            Err(_) => UNPRINTABLE_VALUE.to_string(),
        }
    }
}

/// The logging collaborator used by the recovery handler.
///
/// Implementations must be safe to call from many request tasks at once;
/// any synchronization is their own business.
pub trait InterceptLogger: Send + Sync {
    /// Emits one error-level entry with the given attachments
    fn error(&self, message: &str, fields: &[(&str, FieldValue<'_>)]);

    /// Captures the stack of the calling thread
    fn stacktrace(&self) -> StackSnapshot {
        StackSnapshot::capture()
    }
}

/// Logger that emits `tracing` events.
///
/// The well-known attachments become structured fields of the event, any
/// others are rendered into the `attrs` field as `key=value` pairs.
#[derive(Debug, Clone)]
pub struct TracingLogger {
    service: String,
}

impl TracingLogger {
    pub fn new<S: Into<String>>(service: S) -> Self {
        Self {
            service: service.into(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }
}

impl Default for TracingLogger {
    fn default() -> Self {
        Self::new("unknown-service")
    }
}

impl InterceptLogger for TracingLogger {
    fn error(&self, message: &str, fields: &[(&str, FieldValue<'_>)]) {
        let mut panic = None;
        let mut stack = None;
        let mut panic_location = None;
        let mut panic_stack = None;
        let mut extra = Vec::new();

        for (key, value) in fields {
            match *key {
                "panic" => panic = Some(value.render()),
                "stack" => stack = Some(value.render()),
                "panic_location" => panic_location = Some(value.render()),
                "panic_stack" => panic_stack = Some(value.render()),
                _ => extra.push(format!("{}={}", key, value.render())),
            }
        }

        let extra = if extra.is_empty() {
            None
        } else {
            Some(extra.join(" "))
        };

        tracing::error!(
            service = %self.service,
            panic = panic.as_deref(),
            stack = stack.as_deref(),
            panic_location = panic_location.as_deref(),
            panic_stack = panic_stack.as_deref(),
            attrs = extra.as_deref(),
            "{}",
            message
        );
    }
}

/// An entry recorded by `MemoryLogger`
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub level: Level,
    pub message: String,
    /// The value attached under `panic`
    pub failure: Option<FailureValue>,
    /// The snapshot attached under `stack`
    pub stack: Option<StackSnapshot>,
    /// Every attachment, rendered
    pub attrs: Vec<(String, String)>,
}

impl LogEntry {
    /// Returns the rendered attachment stored under `key`
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Logger that keeps every entry in memory
#[derive(Debug, Default)]
pub struct MemoryLogger {
    entries: Mutex<Vec<LogEntry>>,
}

impl MemoryLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of all recorded entries
    pub fn entries(&self) -> Vec<LogEntry> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<LogEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl InterceptLogger for MemoryLogger {
    fn error(&self, message: &str, fields: &[(&str, FieldValue<'_>)]) {
        let mut failure = None;
        let mut stack = None;
        let mut attrs = Vec::with_capacity(fields.len());

        for (key, value) in fields {
            match (*key, value) {
                ("panic", FieldValue::Failure(value)) => failure = Some((*value).clone()),
                ("stack", FieldValue::Stack(snapshot)) => stack = Some((*snapshot).clone()),
                _ => {}
            }
            attrs.push((key.to_string(), value.render()));
        }

        let entry = LogEntry {
            level: Level::ERROR,
            message: message.to_string(),
            failure,
            stack,
            attrs,
        };

        // One push per call keeps entries whole under concurrent use
        self.lock().push(entry);
    }
}

/// Configuration for the logging system
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// The log level to use (trace, debug, info, warn, error)
    pub level: String,
    /// The service name for identification
    pub service_name: String,
    /// Whether to output logs to a file
    pub file_output: bool,
    /// The directory to store log files in
    pub log_dir: Option<String>,
    /// Whether to use JSON formatting
    pub json_format: bool,
    /// Whether to include source code information
    pub include_source_code: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            service_name: "unknown-service".to_string(),
            file_output: false,
            log_dir: None,
            json_format: true,
            include_source_code: true,
        }
    }
}

/// Initializes the structured logging system.
///
/// Only the first successful call installs a subscriber; later calls return
/// `Ok(())` without touching it.
pub fn init_logging(config: Option<LoggingConfig>) -> Result<(), InitError> {
    if LOGGING_INITIALIZED.load(Ordering::SeqCst) {
        return Ok(());
    }

    let config = config.unwrap_or_default();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},warn", config.level)));

    let json_layer = config.json_format.then(|| {
        tracing_fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .with_file(config.include_source_code)
            .with_line_number(config.include_source_code)
    });

    let text_layer = (!config.json_format).then(|| {
        tracing_fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_file(config.include_source_code)
            .with_line_number(config.include_source_code)
    });

    let file_layer = if config.file_output {
        let log_dir = config.log_dir.as_deref().ok_or(InitError::MissingLogDir)?;
        let appender =
            tracing_appender::rolling::daily(log_dir, format!("{}.log", config.service_name));
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let _ = FILE_GUARD.set(guard);
        Some(file_writer_layer(&config, writer))
    } else {
        None
    };

    let subscriber = Registry::default()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .with(file_layer);

    if LOGGING_INITIALIZED
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return Ok(());
    }

    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        LOGGING_INITIALIZED.store(false, Ordering::SeqCst);
        return Err(InitError::Subscriber(err));
    }

    tracing::info!(
        service = %config.service_name,
        level = %config.level,
        json = %config.json_format,
        "Structured logging initialized"
    );

    Ok(())
}

// Plain-text layer for log files, honoring `include_source_code` like the
// console layers
fn file_writer_layer<S, W>(
    config: &LoggingConfig,
    writer: W,
) -> tracing_fmt::Layer<S, DefaultFields, Format, W>
where
    W: for<'writer> MakeWriter<'writer> + 'static,
{
    tracing_fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_file(config.include_source_code)
        .with_line_number(config.include_source_code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct Buffer(Arc<Mutex<Vec<u8>>>);

    impl Buffer {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    impl io::Write for Buffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Buffer {
        type Writer = Buffer;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn test_tracing_logger_emits_fields() {
        let buffer = Buffer::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(buffer.clone())
            .with_ansi(false)
            .finish();

        let failure = FailureValue::from("division by zero");
        let stack = StackSnapshot::capture();

        tracing::subscriber::with_default(subscriber, || {
            TracingLogger::new("billing").error(
                "panic serving grpc request",
                &[
                    ("panic", FieldValue::Failure(&failure)),
                    ("stack", FieldValue::Stack(&stack)),
                    ("method", FieldValue::Text("/billing.Ledger/Post")),
                ],
            );
        });

        let output = buffer.contents();
        assert!(output.contains("ERROR"));
        assert!(output.contains("panic serving grpc request"));
        assert!(output.contains("division by zero"));
        assert!(output.contains("billing"));
        assert!(output.contains("method=/billing.Ledger/Post"));
        assert!(output.contains("stack="));
        if let Some(symbol) = stack.frames()[0].symbol.as_deref() {
            assert!(output.contains(symbol));
        }
    }

    #[derive(Debug)]
    struct BrokenDisplay;

    impl fmt::Display for BrokenDisplay {
        fn fmt(&self, _f: &mut fmt::Formatter<'_>) -> fmt::Result {
            Err(fmt::Error)
        }
    }

    impl std::error::Error for BrokenDisplay {}

    #[test]
    fn test_render_replaces_failing_display() {
        let failure = FailureValue::error(BrokenDisplay);

        assert_eq!(FieldValue::Failure(&failure).render(), UNPRINTABLE_VALUE);
        assert_eq!(FieldValue::Text("fine").render(), "fine");
    }

    #[test]
    fn test_memory_logger_survives_failing_display() {
        let logger = MemoryLogger::new();
        let failure = FailureValue::error(BrokenDisplay);

        logger.error(
            "panic serving grpc request",
            &[
                ("panic", FieldValue::Failure(&failure)),
                ("note", FieldValue::Failure(&failure)),
            ],
        );

        let entries = logger.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].attr("panic"), Some(UNPRINTABLE_VALUE));
        assert_eq!(entries[0].attr("note"), Some(UNPRINTABLE_VALUE));
    }

    #[test]
    fn test_tracing_logger_survives_failing_display() {
        let buffer = Buffer::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(buffer.clone())
            .with_ansi(false)
            .finish();
        let failure = FailureValue::error(BrokenDisplay);

        tracing::subscriber::with_default(subscriber, || {
            TracingLogger::new("billing").error(
                "panic serving grpc request",
                &[
                    ("panic", FieldValue::Failure(&failure)),
                    ("note", FieldValue::Failure(&failure)),
                ],
            );
        });

        let output = buffer.contents();
        assert!(output.contains("panic serving grpc request"));
        assert!(output.contains(UNPRINTABLE_VALUE));
    }

    fn write_through_file_layer(include_source_code: bool) -> String {
        let buffer = Buffer::default();
        let config = LoggingConfig {
            include_source_code,
            ..LoggingConfig::default()
        };
        let subscriber = Registry::default().with(file_writer_layer(&config, buffer.clone()));

        tracing::subscriber::with_default(subscriber, || {
            tracing::error!("written to the log file");
        });

        buffer.contents()
    }

    #[test]
    fn test_file_layer_includes_source_location() {
        let output = write_through_file_layer(true);

        assert!(output.contains("written to the log file"));
        assert!(output.contains("logging.rs:"));
    }

    #[test]
    fn test_file_layer_omits_source_location() {
        let output = write_through_file_layer(false);

        assert!(output.contains("written to the log file"));
        assert!(!output.contains("logging.rs"));
    }

    #[test]
    fn test_memory_logger_records_entry() {
        let logger = MemoryLogger::new();
        let failure = FailureValue::Nil;
        let stack = StackSnapshot::capture();

        logger.error(
            "panic serving grpc request",
            &[
                ("panic", FieldValue::Failure(&failure)),
                ("stack", FieldValue::Stack(&stack)),
            ],
        );

        let entries = logger.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].level, Level::ERROR);
        assert!(entries[0].failure.as_ref().map_or(false, FailureValue::is_nil));
        assert_eq!(entries[0].attr("panic"), Some("<nil>"));
        assert!(entries[0].stack.is_some());
    }

    #[test]
    fn test_logging_config_defaults() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, "info");
        assert!(config.json_format);
        assert!(!config.file_output);
        assert!(config.log_dir.is_none());
    }
}
