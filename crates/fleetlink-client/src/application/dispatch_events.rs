//! Use case: fan gateway events out to filtered subscribers.
//!
//! A subscription names an exact event type and may narrow it further by
//! event source and by entity serial number.  For each incoming event the
//! registry applies the filters in that order:
//!
//! 1. `event_type` must equal the event name;
//! 2. if the subscription names a `source`, it must equal the event source;
//! 3. if the subscription names a serial number **and** the event carries
//!    one, they must be equal.  Events without a serial number pass step 3.
//!
//! Every matching callback runs independently; a panic in one is logged and
//! does not prevent the others from running.
//!
//! Bulk removals scan the whole subscription list, which is fine for the
//! few hundred subscriptions a fleet dashboard holds.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use fleetlink_core::GatewayEvent;
use tracing::{debug, trace};

use crate::application::listeners::{invoke_isolated, lock, ListenerHandle};

/// Callback invoked for a matching event.
pub type EventCallback = Arc<dyn Fn(&GatewayEvent) + Send + Sync>;

/// Optional narrowing applied after the event-type match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionFilter {
    pub source: Option<String>,
    pub serial_number: Option<String>,
}

impl SubscriptionFilter {
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn serial_number(mut self, serial_number: impl Into<String>) -> Self {
        self.serial_number = Some(serial_number.into());
        self
    }

    fn matches(&self, event: &GatewayEvent) -> bool {
        if let Some(source) = &self.source {
            if *source != event.source {
                return false;
            }
        }
        match (&self.serial_number, event.serial_number()) {
            (Some(wanted), Some(actual)) => wanted == actual,
            _ => true,
        }
    }
}

struct Subscription {
    id: u64,
    event_type: String,
    filter: SubscriptionFilter,
    callback: EventCallback,
}

type Subscriptions = Arc<Mutex<Vec<Subscription>>>;

/// Registry of event subscriptions.
pub struct EventRegistry {
    subscriptions: Subscriptions,
    next_id: AtomicU64,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self {
            subscriptions: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers `callback` for events named `event_type` that pass `filter`.
    pub fn add(
        &self,
        event_type: impl Into<String>,
        filter: SubscriptionFilter,
        callback: impl Fn(&GatewayEvent) + Send + Sync + 'static,
    ) -> ListenerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let event_type = event_type.into();
        debug!(id, event_type = %event_type, ?filter, "event listener added");

        lock(&self.subscriptions).push(Subscription {
            id,
            event_type,
            filter,
            callback: Arc::new(callback),
        });

        let subscriptions = Arc::downgrade(&self.subscriptions);
        ListenerHandle::new(move || {
            subscriptions
                .upgrade()
                .map(|subs| remove_where(&subs, |s| s.id == id) > 0)
                .unwrap_or(false)
        })
    }

    /// Delivers `event` to every matching subscription.
    ///
    /// Returns how many callbacks were invoked.
    pub fn dispatch(&self, event: &GatewayEvent) -> usize {
        let matching: Vec<EventCallback> = lock(&self.subscriptions)
            .iter()
            .filter(|s| s.event_type == event.event && s.filter.matches(event))
            .map(|s| Arc::clone(&s.callback))
            .collect();

        trace!(
            source = %event.source,
            event = %event.event,
            listeners = matching.len(),
            "dispatching event"
        );

        for callback in &matching {
            invoke_isolated("event listener", || callback(event));
        }
        matching.len()
    }

    /// Removes every subscription for `event_type`.  Returns the count.
    pub fn remove_by_event_type(&self, event_type: &str) -> usize {
        remove_where(&self.subscriptions, |s| s.event_type == event_type)
    }

    /// Removes every subscription whose type is in `event_types`.
    pub fn remove_by_event_types(&self, event_types: &[&str]) -> usize {
        remove_where(&self.subscriptions, |s| {
            event_types.contains(&s.event_type.as_str())
        })
    }

    /// Removes every subscription filtered on `serial_number`.
    pub fn remove_by_serial_number(&self, serial_number: &str) -> usize {
        remove_where(&self.subscriptions, |s| {
            s.filter.serial_number.as_deref() == Some(serial_number)
        })
    }

    pub fn clear(&self) -> usize {
        remove_where(&self.subscriptions, |_| true)
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscriptions).len()
    }
}

impl Default for EventRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn remove_where(subscriptions: &Mutex<Vec<Subscription>>, pred: impl Fn(&Subscription) -> bool) -> usize {
    let mut guard = lock(subscriptions);
    let before = guard.len();
    guard.retain(|s| !pred(s));
    let removed = before - guard.len();
    if removed > 0 {
        debug!(removed, "event listeners removed");
    }
    removed
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};
    use std::sync::Mutex;

    fn event(source: &str, name: &str, serial: Option<&str>) -> GatewayEvent {
        let mut fields = Map::new();
        if let Some(serial) = serial {
            fields.insert("serialNumber".to_string(), json!(serial));
        }
        GatewayEvent {
            source: source.to_string(),
            event: name.to_string(),
            fields,
        }
    }

    fn tagging(log: &Arc<Mutex<Vec<&'static str>>>, tag: &'static str) -> impl Fn(&GatewayEvent) + Send + Sync {
        let log = Arc::clone(log);
        move |_| log.lock().unwrap().push(tag)
    }

    #[test]
    fn test_fan_out_applies_type_source_and_serial_filters() {
        // Arrange: A{X}, B{X, device}, C{X, device, S1}
        let registry = EventRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let _a = registry.add("X", SubscriptionFilter::default(), tagging(&log, "A"));
        let _b = registry.add("X", SubscriptionFilter::default().source("device"), tagging(&log, "B"));
        let _c = registry.add(
            "X",
            SubscriptionFilter::default().source("device").serial_number("S1"),
            tagging(&log, "C"),
        );

        // Act
        let invoked = registry.dispatch(&event("device", "X", Some("S2")));

        // Assert
        assert_eq!(invoked, 2);
        assert_eq!(*log.lock().unwrap(), vec!["A", "B"]);
    }

    #[test]
    fn test_serial_filter_is_skipped_when_event_has_no_serial() {
        let registry = EventRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let _c = registry.add(
            "connected",
            SubscriptionFilter::default().serial_number("S1"),
            tagging(&log, "C"),
        );

        registry.dispatch(&event("driver", "connected", None));

        assert_eq!(*log.lock().unwrap(), vec!["C"]);
    }

    #[test]
    fn test_source_mismatch_is_filtered_out() {
        let registry = EventRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let _s = registry.add("X", SubscriptionFilter::default().source("station"), tagging(&log, "S"));

        assert_eq!(registry.dispatch(&event("device", "X", None)), 0);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_event_type_must_match_exactly() {
        let registry = EventRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let _s = registry.add("motion", SubscriptionFilter::default(), tagging(&log, "M"));

        registry.dispatch(&event("device", "motion detected", None));

        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_panicking_callback_is_isolated() {
        // Arrange
        let registry = EventRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let _a = registry.add("X", SubscriptionFilter::default(), tagging(&log, "A"));
        let _p = registry.add("X", SubscriptionFilter::default(), |_| panic!("listener bug"));
        let _b = registry.add("X", SubscriptionFilter::default(), tagging(&log, "B"));

        // Act
        registry.dispatch(&event("device", "X", None));

        // Assert
        assert_eq!(*log.lock().unwrap(), vec!["A", "B"]);
        assert_eq!(registry.subscriber_count(), 3);
    }

    #[test]
    fn test_handle_remove_deregisters_one_subscription() {
        let registry = EventRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = registry.add("X", SubscriptionFilter::default(), tagging(&log, "A"));
        let _b = registry.add("X", SubscriptionFilter::default(), tagging(&log, "B"));

        assert!(a.remove());
        registry.dispatch(&event("device", "X", None));

        assert_eq!(*log.lock().unwrap(), vec!["B"]);
    }

    #[test]
    fn test_bulk_removals_return_counts() {
        // Arrange
        let registry = EventRegistry::new();
        let noop = |_: &GatewayEvent| {};
        let _1 = registry.add("X", SubscriptionFilter::default(), noop);
        let _2 = registry.add("X", SubscriptionFilter::default().serial_number("S1"), noop);
        let _3 = registry.add("Y", SubscriptionFilter::default().serial_number("S1"), noop);
        let _4 = registry.add("Z", SubscriptionFilter::default(), noop);
        let _5 = registry.add("W", SubscriptionFilter::default(), noop);

        // Act / Assert
        assert_eq!(registry.remove_by_serial_number("S1"), 2);
        assert_eq!(registry.remove_by_event_type("X"), 1);
        assert_eq!(registry.remove_by_event_types(&["Z", "W", "nope"]), 2);
        assert_eq!(registry.subscriber_count(), 0);
    }

    #[test]
    fn test_callback_may_add_listener_during_dispatch() {
        let registry = Arc::new(EventRegistry::new());
        let inner = Arc::clone(&registry);
        let _h = registry.add("X", SubscriptionFilter::default(), move |_| {
            let _ = inner.add("Y", SubscriptionFilter::default(), |_| {});
        });

        registry.dispatch(&event("device", "X", None));

        assert_eq!(registry.subscriber_count(), 2);
    }
}
