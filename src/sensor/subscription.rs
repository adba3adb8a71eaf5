//! Subscription registry and subscriber channel plumbing.
//!
//! Like the decoder registry, the subscription map is an immutable
//! snapshot published atomically: dispatch loads it once per sample and
//! iterates the subscribers registered for that sample's event id, while
//! subscribe/unsubscribe serialize on a writers' mutex and publish a fresh
//! snapshot. The subscription owns its data channel; the map holds only
//! sender handles, so tearing a subscription down closes the channel once
//! the last published snapshot referencing it is gone.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::mpsc;

use crate::events::TelemetryEvent;
use crate::filter::Predicate;

/// One subscriber as seen by the dispatch path.
pub struct Subscriber {
    /// Process-wide subscription id.
    pub id: u64,
    /// Optional predicate; events failing it are skipped for this
    /// subscriber only.
    pub filter: Option<Predicate>,
    /// Bounded sink. Dispatch uses `try_send`; a full channel drops the
    /// event for this subscriber (drop-newest).
    pub sink: mpsc::Sender<Arc<TelemetryEvent>>,
    /// Events dropped on a full sink.
    pub dropped: AtomicU64,
}

/// Per-subscription bookkeeping kept on the writers' side.
struct SubscriptionEntry {
    /// (event id, tracefs event name) pairs this subscription activated.
    events: Vec<(u16, String)>,
    subscriber: Arc<Subscriber>,
}

/// One immutable, atomically-published subscription state.
#[derive(Default)]
pub struct SubscriptionSnapshot {
    by_event: HashMap<u16, HashMap<u64, Arc<Subscriber>>>,
}

impl SubscriptionSnapshot {
    /// Subscribers registered for the given event id.
    pub fn subscribers(&self, event_id: u16) -> impl Iterator<Item = &Arc<Subscriber>> {
        self.by_event
            .get(&event_id)
            .into_iter()
            .flat_map(|subs| subs.values())
    }

    /// Whether any subscription is registered for the event id.
    pub fn has_event(&self, event_id: u16) -> bool {
        self.by_event.contains_key(&event_id)
    }
}

/// Map of event id to subscriber set, safe to mutate under live dispatch.
pub struct SubscriptionMap {
    active: ArcSwap<SubscriptionSnapshot>,
    entries: parking_lot::Mutex<HashMap<u64, SubscriptionEntry>>,
    next_id: AtomicU64,
}

impl SubscriptionMap {
    pub fn new() -> Self {
        Self {
            active: ArcSwap::from_pointee(SubscriptionSnapshot::default()),
            entries: parking_lot::Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// The current snapshot. Dispatch loads one per sample.
    pub fn snapshot(&self) -> Arc<SubscriptionSnapshot> {
        self.active.load_full()
    }

    /// Register a subscription covering the given events and return its id.
    /// Duplicate event ids in `events` collapse to one registration.
    pub fn subscribe(
        &self,
        mut events: Vec<(u16, String)>,
        filter: Option<Predicate>,
        sink: mpsc::Sender<Arc<TelemetryEvent>>,
    ) -> u64 {
        events.sort_by_key(|(id, _)| *id);
        events.dedup_by_key(|(id, _)| *id);

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let subscriber = Arc::new(Subscriber {
            id,
            filter,
            sink,
            dropped: AtomicU64::new(0),
        });

        let mut entries = self.entries.lock();
        let old = self.active.load();

        let mut by_event = old.by_event.clone();
        for (event_id, _) in &events {
            by_event
                .entry(*event_id)
                .or_default()
                .insert(id, Arc::clone(&subscriber));
        }

        entries.insert(
            id,
            SubscriptionEntry {
                events,
                subscriber,
            },
        );
        self.active
            .store(Arc::new(SubscriptionSnapshot { by_event }));

        id
    }

    /// Remove a subscription. For every event id whose subscriber set
    /// becomes empty, `on_last` is invoked once with the id and its
    /// tracefs name. Unknown ids are a no-op, making teardown idempotent.
    pub fn unsubscribe(&self, id: u64, mut on_last: impl FnMut(u16, &str)) -> bool {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.remove(&id) else {
            return false;
        };

        let old = self.active.load();
        let mut by_event = old.by_event.clone();

        for (event_id, name) in &entry.events {
            if let Some(subs) = by_event.get_mut(event_id) {
                subs.remove(&id);
                if subs.is_empty() {
                    by_event.remove(event_id);
                    on_last(*event_id, name);
                }
            }
        }

        self.active
            .store(Arc::new(SubscriptionSnapshot { by_event }));

        true
    }

    /// Subscriber handle for a live subscription.
    pub fn subscriber(&self, id: u64) -> Option<Arc<Subscriber>> {
        self.entries
            .lock()
            .get(&id)
            .map(|e| Arc::clone(&e.subscriber))
    }
}

impl Default for SubscriptionMap {
    fn default() -> Self {
        Self::new()
    }
}

/// Caller-facing handle to a subscription.
///
/// `data` yields events matching the subscription; dropping the stream (or
/// calling [`EventStream::close`]) closes the control side, which is the
/// sole teardown signal.
pub struct EventStream {
    pub(crate) id: u64,
    pub(crate) ctrl: Option<mpsc::Sender<()>>,
    pub(crate) data: mpsc::Receiver<Arc<TelemetryEvent>>,
}

impl EventStream {
    /// Process-wide subscription id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the next matching event. Returns `None` once the
    /// subscription is torn down and the channel drained.
    pub async fn next(&mut self) -> Option<Arc<TelemetryEvent>> {
        self.data.recv().await
    }

    /// Non-blocking read of an already-queued event.
    pub fn try_next(&mut self) -> Option<Arc<TelemetryEvent>> {
        self.data.try_recv().ok()
    }

    /// Close the control side, triggering teardown, while keeping the data
    /// side open so already-queued events can still be drained.
    pub fn cancel(&mut self) {
        self.ctrl = None;
    }

    /// Cancel the subscription and discard the stream.
    pub fn close(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink() -> mpsc::Sender<Arc<TelemetryEvent>> {
        mpsc::channel(4).0
    }

    #[test]
    fn test_subscribe_ids_are_monotonic() {
        let map = SubscriptionMap::new();
        let a = map.subscribe(vec![(1, "x/a".into())], None, sink());
        let b = map.subscribe(vec![(1, "x/a".into())], None, sink());
        assert_eq!(a, 1);
        assert_eq!(b, 2);
    }

    #[test]
    fn test_snapshot_routing() {
        let map = SubscriptionMap::new();
        let a = map.subscribe(vec![(1, "x/a".into()), (2, "x/b".into())], None, sink());
        let b = map.subscribe(vec![(2, "x/b".into())], None, sink());

        let snap = map.snapshot();
        let on_1: Vec<u64> = snap.subscribers(1).map(|s| s.id).collect();
        assert_eq!(on_1, vec![a]);

        let mut on_2: Vec<u64> = snap.subscribers(2).map(|s| s.id).collect();
        on_2.sort_unstable();
        assert_eq!(on_2, vec![a, b]);

        assert_eq!(snap.subscribers(3).count(), 0);
    }

    #[test]
    fn test_duplicate_event_ids_collapse() {
        let map = SubscriptionMap::new();
        let id = map.subscribe(
            vec![(7, "x/a".into()), (7, "x/a".into())],
            None,
            sink(),
        );

        let mut last = Vec::new();
        assert!(map.unsubscribe(id, |event_id, name| last.push((event_id, name.to_string()))));
        assert_eq!(last, vec![(7, "x/a".to_string())]);
    }

    #[test]
    fn test_unsubscribe_reports_last_user_only() {
        let map = SubscriptionMap::new();
        let a = map.subscribe(vec![(1, "x/a".into())], None, sink());
        let b = map.subscribe(vec![(1, "x/a".into()), (2, "x/b".into())], None, sink());

        let mut last = Vec::new();
        map.unsubscribe(a, |id, _| last.push(id));
        // Event 1 still has subscription b.
        assert!(last.is_empty());
        assert!(map.snapshot().has_event(1));

        map.unsubscribe(b, |id, _| last.push(id));
        last.sort_unstable();
        assert_eq!(last, vec![1, 2]);
        assert!(!map.snapshot().has_event(1));
        assert!(!map.snapshot().has_event(2));
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let map = SubscriptionMap::new();
        let id = map.subscribe(vec![(1, "x/a".into())], None, sink());

        assert!(map.unsubscribe(id, |_, _| {}));
        let mut called = false;
        assert!(!map.unsubscribe(id, |_, _| called = true));
        assert!(!called);
    }

    #[test]
    fn test_old_snapshot_unaffected_by_writes() {
        let map = SubscriptionMap::new();
        let a = map.subscribe(vec![(1, "x/a".into())], None, sink());

        let before = map.snapshot();
        map.unsubscribe(a, |_, _| {});

        // The previously-loaded snapshot still routes; the new one does not.
        assert_eq!(before.subscribers(1).count(), 1);
        assert_eq!(map.snapshot().subscribers(1).count(), 0);
    }
}
