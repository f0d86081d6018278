//! Use case: track the connection lifecycle.
//!
//! [`ConnectionStateMachine`] is the single owner of the
//! [`ConnectionSnapshot`].  The transport session flips the transport flag,
//! the negotiator flips the schema flag, and the façade records driver
//! status; nobody else writes to it.
//!
//! # Transition rules
//!
//! | Call                              | Effect                                                   |
//! |-----------------------------------|----------------------------------------------------------|
//! | `set_transport_connected(true)`   | `Ready` if the schema is already complete, else `Connected` |
//! | `set_transport_connected(false)`  | clears schema + driver flags and schema info, `Disconnected` |
//! | `set_schema_complete(true)`       | `Ready` if the transport is up, else only the flag        |
//! | `set_schema_complete(false)`      | `Ready` falls back to `Connected`                         |
//! | `set_error(msg)`                  | records `msg`, forces `Error`                             |
//! | `reset()`                         | everything back to defaults                               |
//!
//! Each call is one atomic update followed by exactly one notification of
//! every subscriber, plus a publish on the watch channel.
//!
//! # Ordering
//!
//! The watch channel is written while the snapshot lock is held, so it can
//! never lag behind the machine.  Subscriber notifications are queued under
//! the same lock and delivered by a single drainer, in mutation order.  A
//! mutation made concurrently with a delivery, or from inside a subscriber,
//! is queued and delivered by the thread already draining.
//!
//! # Link epochs
//!
//! Every `set_transport_connected(true)` starts a new epoch.  The negotiator
//! records the epoch it negotiated for and completes the schema through
//! [`ConnectionStateMachine::complete_schema`], which refuses when the
//! transport is down or a newer link has opened since.

//! # Why is `driver_connected` cleared on transport loss?
//!
//! The gateway reports its driver status separately, so strictly speaking a
//! dropped socket says nothing about the driver.  The flag is still cleared
//! because no driver event can reach us until the next `start_listening`
//! dump, and a stale `true` would be worse than an unknown `false`.

use std::collections::VecDeque;
use std::sync::Mutex;

use fleetlink_core::{ConnectionSnapshot, ConnectionState, SchemaCompatibilityInfo};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::application::listeners::{lock, ListenerHandle, ListenerSet};

#[derive(Debug, Default)]
struct Inner {
    snapshot: ConnectionSnapshot,
    epoch: u64,
    /// Snapshots not yet delivered to subscribers.
    undelivered: VecDeque<ConnectionSnapshot>,
    draining: bool,
}

/// Connection lifecycle state with change notification.
#[derive(Debug)]
pub struct ConnectionStateMachine {
    inner: Mutex<Inner>,
    watch_tx: watch::Sender<ConnectionSnapshot>,
    subscribers: ListenerSet<ConnectionSnapshot>,
}

impl ConnectionStateMachine {
    pub fn new() -> Self {
        let (watch_tx, _) = watch::channel(ConnectionSnapshot::default());
        Self {
            inner: Mutex::new(Inner::default()),
            watch_tx,
            subscribers: ListenerSet::new("connection state subscriber"),
        }
    }

    // ── Queries ───────────────────────────────────────────────────────────────

    /// Current state as a read-only copy.
    pub fn snapshot(&self) -> ConnectionSnapshot {
        let mut snapshot = lock(&self.inner).snapshot.clone();
        snapshot.subscriber_count = self.subscribers.len();
        snapshot
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.inner).snapshot.state
    }

    /// `state == Ready && transport_connected && schema_complete`.
    pub fn is_ready(&self) -> bool {
        lock(&self.inner).snapshot.is_ready()
    }

    pub fn schema_info(&self) -> Option<SchemaCompatibilityInfo> {
        lock(&self.inner).snapshot.schema
    }

    /// Number of the current (or last) link; bumped on every open.
    pub fn connection_epoch(&self) -> u64 {
        lock(&self.inner).epoch
    }

    /// A receiver that always holds the latest snapshot.
    pub fn watch(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.watch_tx.subscribe()
    }

    /// Registers a callback invoked synchronously after every mutation.
    pub fn subscribe(
        &self,
        callback: impl Fn(&ConnectionSnapshot) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.subscribers.add(callback)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    // ── Mutations ─────────────────────────────────────────────────────────────

    pub fn set_transport_connected(&self, connected: bool) {
        self.update(|s, epoch| {
            if connected {
                *epoch += 1;
                s.transport_connected = true;
                s.state = if s.schema_complete {
                    ConnectionState::Ready
                } else {
                    ConnectionState::Connected
                };
            } else {
                s.transport_connected = false;
                s.schema_complete = false;
                s.driver_connected = false;
                s.schema = None;
                s.state = ConnectionState::Disconnected;
            }
        });
    }

    /// Marks a transport open as in progress.  Ignored while connected.
    pub fn set_connecting(&self) {
        self.update(|s, _| {
            if !s.transport_connected {
                s.state = ConnectionState::Connecting;
            }
        });
    }

    /// Marks schema negotiation as in flight.  Ignored without a transport.
    pub fn set_negotiating(&self) {
        self.update(|s, _| {
            if s.transport_connected {
                s.schema_complete = false;
                s.state = ConnectionState::NegotiatingSchema;
            }
        });
    }

    pub fn set_schema_complete(&self, complete: bool) {
        self.update(|s, _| {
            s.schema_complete = complete;
            if complete {
                if s.transport_connected {
                    s.state = ConnectionState::Ready;
                }
            } else if s.state == ConnectionState::Ready {
                s.state = ConnectionState::Connected;
            }
        });
    }

    /// Marks the schema complete for the link of `epoch`.
    ///
    /// Check and update happen under one lock: returns `false`, changing
    /// nothing, when the transport is down or a newer link has opened.
    pub fn complete_schema(&self, epoch: u64) -> bool {
        self.update(|s, current| {
            if !s.transport_connected || *current != epoch {
                return false;
            }
            s.schema_complete = true;
            s.state = ConnectionState::Ready;
            true
        })
    }

    /// Records the outcome of comparing schema ranges for this connection.
    pub fn set_schema_info(&self, info: SchemaCompatibilityInfo) {
        self.update(|s, _| s.schema = Some(info));
    }

    pub fn set_driver_connected(&self, connected: bool) {
        self.update(|s, _| s.driver_connected = connected);
    }

    /// Records a fault and forces the `Error` state.
    pub fn set_error(&self, message: impl Into<String>) {
        let message = message.into();
        warn!("connection error: {message}");
        self.update(|s, _| {
            s.last_error = Some(message);
            s.state = ConnectionState::Error;
        });
    }

    /// Back to a fresh `Disconnected` snapshot.  Subscribers stay registered.
    pub fn reset(&self) {
        self.update(|s, _| *s = ConnectionSnapshot::default());
    }

    fn update<R>(&self, mutate: impl FnOnce(&mut ConnectionSnapshot, &mut u64) -> R) -> R {
        let (result, drain) = {
            let mut guard = lock(&self.inner);
            let inner = &mut *guard;
            let before = inner.snapshot.state;
            let result = mutate(&mut inner.snapshot, &mut inner.epoch);
            inner.snapshot.subscriber_count = self.subscribers.len();
            let after = inner.snapshot.clone();

            if before != after.state {
                info!("connection state: {before} -> {}", after.state);
            } else {
                debug!("connection state unchanged ({before}), flags updated");
            }

            self.watch_tx.send_replace(after.clone());
            inner.undelivered.push_back(after);
            let drain = !inner.draining;
            inner.draining = true;
            (result, drain)
        };

        if drain {
            self.deliver();
        }
        result
    }

    /// Delivers queued snapshots until the queue is empty.
    fn deliver(&self) {
        loop {
            let next = {
                let mut inner = lock(&self.inner);
                match inner.undelivered.pop_front() {
                    Some(snapshot) => snapshot,
                    None => {
                        inner.draining = false;
                        return;
                    }
                }
            };
            self.subscribers.notify(&next);
        }
    }
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
