//! # Recovery Boundary
//!
//! Guards that run a unit of request work and turn a panic inside it into
//! a `RecoveryError`, plus an optional process panic hook that records
//! where the panic happened.
//!
//! A guard only catches panics raised in the execution unit it runs in, so
//! it must be installed inside every task or thread that serves a request.

use std::any::Any;
use std::cell::RefCell;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};

use futures::future::{poll_fn, FutureExt};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::handler::RecoveryHandlerFunc;
use crate::stack::StackSnapshot;
use crate::types::{FailureValue, RecoveryError};

thread_local! {
    // Filled by the hook on every panic raised on this thread
    static PANIC_SITE: RefCell<Option<PanicSite>> = RefCell::new(None);
    // Set by a guard only while it hands a caught panic to the handler
    static RECOVERED_SITE: RefCell<Option<PanicSite>> = RefCell::new(None);
}

static HOOK_INSTALLED: OnceCell<()> = OnceCell::new();

/// Settings for the process panic hook
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HookConfig {
    /// Whether to install the hook at all
    pub enabled: bool,
    /// Whether to capture a stack snapshot at the panic site
    pub capture_backtrace: bool,
    /// Skip the previously installed hook (normally the stderr printer).
    /// Applies to every panic in the process, not only recovered ones.
    pub suppress_default_output: bool,
}

impl Default for HookConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capture_backtrace: true,
            suppress_default_output: false,
        }
    }
}

/// Where a panic was raised, as recorded by the panic hook
#[derive(Debug, Clone)]
pub struct PanicSite {
    /// `file:line:column` of the `panic!` call
    pub location: String,
    /// Stack at the panic site, when backtrace capture is enabled
    pub stack: Option<StackSnapshot>,
}

/// Installs the process panic hook.
///
/// Returns false when the hook is disabled or was already installed.
pub fn install_panic_hook(config: &HookConfig) -> bool {
    if !config.enabled {
        return false;
    }

    let mut installed = false;
    HOOK_INSTALLED.get_or_init(|| {
        let previous = panic::take_hook();
        let capture_backtrace = config.capture_backtrace;
        let chain = !config.suppress_default_output;

        panic::set_hook(Box::new(move |info| {
            let location = info
                .location()
                .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
                .unwrap_or_else(|| "<unknown>".to_string());
            let stack = capture_backtrace.then(StackSnapshot::capture);
            record_panic_site(PanicSite { location, stack });

            if chain {
                previous(info);
            }
        }));

        installed = true;
    });

    installed
}

/// Takes the panic site recorded on this thread, if any
pub fn take_panic_site() -> Option<PanicSite> {
    PANIC_SITE
        .try_with(|slot| slot.try_borrow_mut().ok().and_then(|mut slot| slot.take()))
        .ok()
        .flatten()
}

fn record_panic_site(site: PanicSite) {
    let _ = PANIC_SITE.try_with(|slot| {
        if let Ok(mut slot) = slot.try_borrow_mut() {
            *slot = Some(site);
        }
    });
}

fn clear_panic_site() {
    let _ = take_panic_site();
}

/// Returns the panic site of the failure currently being delivered by
/// `recover` or `recover_async`.
///
/// Outside of such a delivery this is always `None`, even when the hook
/// recorded an unrelated panic on this thread earlier.
pub fn recovered_panic_site() -> Option<PanicSite> {
    RECOVERED_SITE
        .try_with(|slot| slot.try_borrow().ok().and_then(|slot| slot.clone()))
        .ok()
        .flatten()
}

// Makes `site` visible to `recovered_panic_site` until dropped, restoring
// whatever was there before
struct RecoveredSiteScope {
    previous: Option<PanicSite>,
}

impl RecoveredSiteScope {
    fn enter(site: Option<PanicSite>) -> Self {
        let previous = RECOVERED_SITE
            .try_with(|slot| {
                slot.try_borrow_mut()
                    .ok()
                    .and_then(|mut slot| std::mem::replace(&mut *slot, site))
            })
            .ok()
            .flatten();
        Self { previous }
    }
}

impl Drop for RecoveredSiteScope {
    fn drop(&mut self) {
        let previous = self.previous.take();
        let _ = RECOVERED_SITE.try_with(|slot| {
            if let Ok(mut slot) = slot.try_borrow_mut() {
                *slot = previous;
            }
        });
    }
}

// Hands a caught panic to the handler together with the site the hook
// recorded for it
fn deliver(handler: &RecoveryHandlerFunc, payload: Box<dyn Any + Send>) -> RecoveryError {
    let site = take_panic_site();
    let failure = FailureValue::from_panic(payload);

    let _scope = RecoveredSiteScope::enter(site);
    handler(failure)
}

/// Runs `f`, converting a panic into `RecoveryError`.
///
/// On a normal return the value is passed through untouched. On a panic the
/// payload is handed to `handler` and its error is returned.
pub fn recover<T, F>(handler: &RecoveryHandlerFunc, f: F) -> Result<T, RecoveryError>
where
    F: FnOnce() -> T,
{
    clear_panic_site();

    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Ok(value),
        Err(payload) => Err(deliver(handler, payload)),
    }
}

/// Polls `future` to completion, converting a panic into `RecoveryError`.
///
/// The handler runs in the same poll that observed the panic, on the same
/// thread.
pub async fn recover_async<F>(
    handler: &RecoveryHandlerFunc,
    future: F,
) -> Result<F::Output, RecoveryError>
where
    F: Future,
{
    let mut guarded = std::pin::pin!(AssertUnwindSafe(future).catch_unwind());

    // Clear before every poll, the task may have moved threads
    let outcome = poll_fn(|cx| {
        clear_panic_site();
        guarded.as_mut().poll(cx)
    })
    .await;

    match outcome {
        Ok(value) => Ok(value),
        Err(payload) => Err(deliver(handler, payload)),
    }
}
