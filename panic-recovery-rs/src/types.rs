//! # Failure Types
//!
//! This module defines the payload captured when a request handler panics
//! and the single error kind the recovery boundary hands back to the
//! transport layer.

use std::any::Any;
use std::error::Error as StdError;
use std::fmt;
use std::sync::{Arc, Mutex};

/// A type alias for Result with the error type defaulting to `RecoveryError`
pub type Result<T, E = RecoveryError> = std::result::Result<T, E>;

/// The error returned in place of a handler's output after a panic.
///
/// Its message is the same for every panic so that nothing from the
/// diagnostic payload reaches the remote caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, thiserror::Error)]
#[error("rpc: panic serving request")]
pub struct RecoveryError;

/// The diagnostic payload associated with a panic.
///
/// The recovery handler never inspects this value; it is handed to the
/// logger unmodified.
#[derive(Clone)]
pub enum FailureValue {
    /// No payload, as produced by `std::panic::panic_any(())`
    Nil,
    /// A textual payload, as produced by `panic!("...")`
    Message(String),
    /// A payload that is an error value
    Error(Arc<dyn StdError + Send + Sync>),
    /// Any other payload, kept as-is
    Opaque(OpaquePayload),
}

impl FailureValue {
    /// Converts the payload returned by `catch_unwind` into a `FailureValue`.
    ///
    /// The conversion is total: payloads of an unrecognised type end up in
    /// `FailureValue::Opaque` with the original box intact.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let payload = match payload.downcast::<&'static str>() {
            Ok(message) => return FailureValue::Message((*message).to_string()),
            Err(payload) => payload,
        };
        let payload = match payload.downcast::<String>() {
            Ok(message) => return FailureValue::Message(*message),
            Err(payload) => payload,
        };
        let payload = match payload.downcast::<()>() {
            Ok(_) => return FailureValue::Nil,
            Err(payload) => payload,
        };
        let payload = match payload.downcast::<FailureValue>() {
            Ok(value) => return *value,
            Err(payload) => payload,
        };
        let payload = match payload.downcast::<Box<dyn StdError + Send + Sync>>() {
            Ok(err) => return FailureValue::Error(Arc::from(*err)),
            Err(payload) => payload,
        };
        let payload = match payload.downcast::<anyhow::Error>() {
            Ok(err) => {
                let err: Box<dyn StdError + Send + Sync> = (*err).into();
                return FailureValue::Error(Arc::from(err));
            }
            Err(payload) => payload,
        };
        match payload.downcast::<std::io::Error>() {
            Ok(err) => FailureValue::Error(Arc::new(*err)),
            Err(payload) => FailureValue::Opaque(OpaquePayload::new(payload)),
        }
    }

    /// Wraps an error value
    pub fn error<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        FailureValue::Error(Arc::new(err))
    }

    /// Returns true if this is the `Nil` variant
    pub fn is_nil(&self) -> bool {
        matches!(self, FailureValue::Nil)
    }

    /// Returns the message for textual payloads
    pub fn as_message(&self) -> Option<&str> {
        match self {
            FailureValue::Message(message) => Some(message),
            _ => None,
        }
    }
}

impl fmt::Display for FailureValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureValue::Nil => write!(f, "<nil>"),
            FailureValue::Message(message) => write!(f, "{}", message),
            FailureValue::Error(err) => write!(f, "{}", err),
            FailureValue::Opaque(_) => write!(f, "<opaque panic payload>"),
        }
    }
}

impl fmt::Debug for FailureValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureValue::Nil => write!(f, "Nil"),
            FailureValue::Message(message) => f.debug_tuple("Message").field(message).finish(),
            FailureValue::Error(err) => f.debug_tuple("Error").field(err).finish(),
            FailureValue::Opaque(payload) => f.debug_tuple("Opaque").field(payload).finish(),
        }
    }
}

impl From<&str> for FailureValue {
    fn from(message: &str) -> Self {
        FailureValue::Message(message.to_string())
    }
}

impl From<String> for FailureValue {
    fn from(message: String) -> Self {
        FailureValue::Message(message)
    }
}

impl From<anyhow::Error> for FailureValue {
    fn from(err: anyhow::Error) -> Self {
        let err: Box<dyn StdError + Send + Sync> = err.into();
        FailureValue::Error(Arc::from(err))
    }
}

/// A panic payload of a type the recovery boundary does not recognise.
///
/// The box is shared behind a mutex so the value stays `Sync` and cheap to
/// clone while the original payload is preserved for downcasting.
#[derive(Clone)]
pub struct OpaquePayload {
    inner: Arc<Mutex<Box<dyn Any + Send>>>,
}

impl OpaquePayload {
    /// Wraps a boxed panic payload
    pub fn new(payload: Box<dyn Any + Send>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(payload)),
        }
    }

    /// Returns true if the payload is of type `T`
    pub fn is<T: Any>(&self) -> bool {
        self.downcast_with(|_: &T| ()).is_some()
    }

    /// Runs `f` against the payload if it is of type `T`
    pub fn downcast_with<T, R, F>(&self, f: F) -> Option<R>
    where
        T: Any,
        F: FnOnce(&T) -> R,
    {
        let guard = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.downcast_ref::<T>().map(f)
    }
}

impl fmt::Debug for OpaquePayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Any {{ .. }}")
    }
}
