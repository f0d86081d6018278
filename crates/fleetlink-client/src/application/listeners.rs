//! Observer plumbing shared by the state machine, the event registry and the
//! error channel.
//!
//! Two rules hold for every callback invoked from this crate:
//!
//! 1. It is called without any internal lock held, so it may call back into
//!    the client (read the state, add another listener, ...).
//! 2. A panicking callback is caught and logged.  The remaining callbacks
//!    still run and the caller never sees the panic.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::error;

/// Locks a mutex, recovering the data if a previous holder panicked.
///
/// Callbacks never run under these locks, so a poisoned guard can only come
/// from a bug inside this crate; the protected data is still consistent.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Runs `f`, converting a panic into a logged error.
///
/// Returns `false` when `f` panicked.
pub(crate) fn invoke_isolated(label: &str, f: impl FnOnce()) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => true,
        Err(payload) => {
            error!("{label} panicked: {}", panic_message(payload.as_ref()));
            false
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

// ── ListenerHandle ────────────────────────────────────────────────────────────

/// De-registration handle returned whenever a callback is registered.
///
/// Dropping the handle does **not** remove the callback; it stays registered
/// until [`remove`](Self::remove) is called or the owner bulk-removes it.
#[must_use = "keep the handle to be able to remove the listener later"]
pub struct ListenerHandle {
    cancel: Box<dyn FnOnce() -> bool + Send + Sync>,
}

impl ListenerHandle {
    pub(crate) fn new(cancel: impl FnOnce() -> bool + Send + Sync + 'static) -> Self {
        Self {
            cancel: Box::new(cancel),
        }
    }

    /// Removes the listener.  Returns `false` if it was already gone.
    pub fn remove(self) -> bool {
        (self.cancel)()
    }
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle").finish_non_exhaustive()
    }
}

// ── ListenerSet ───────────────────────────────────────────────────────────────

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// An ordered set of callbacks receiving `&T`.
pub struct ListenerSet<T> {
    entries: Arc<Mutex<Vec<(u64, Callback<T>)>>>,
    next_id: AtomicU64,
    label: &'static str,
}

impl<T: 'static> ListenerSet<T> {
    /// Creates an empty set.  `label` names the set in panic logs.
    pub fn new(label: &'static str) -> Self {
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(1),
            label,
        }
    }

    /// Registers a callback.
    pub fn add(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> ListenerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.entries).push((id, Arc::new(callback)));

        let entries: Weak<Mutex<Vec<(u64, Callback<T>)>>> = Arc::downgrade(&self.entries);
        ListenerHandle::new(move || {
            let Some(entries) = entries.upgrade() else {
                return false;
            };
            let mut guard = lock(&entries);
            let before = guard.len();
            guard.retain(|(entry_id, _)| *entry_id != id);
            guard.len() != before
        })
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        lock(&self.entries).clear();
    }

    /// Calls every callback in registration order.
    ///
    /// Returns the number of callbacks that panicked.
    pub fn notify(&self, value: &T) -> usize {
        // Snapshot so callbacks may add or remove listeners while running.
        let callbacks: Vec<Callback<T>> =
            lock(&self.entries).iter().map(|(_, cb)| Arc::clone(cb)).collect();

        callbacks
            .iter()
            .filter(|cb| !invoke_isolated(self.label, || cb(value)))
            .count()
    }
}

impl<T> std::fmt::Debug for ListenerSet<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerSet")
            .field("label", &self.label)
            .field("len", &lock(&self.entries).len())
            .finish()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
