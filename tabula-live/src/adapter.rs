//! Adapter turning document notifications into [`RecordEvent`]s.
//!
//! One adapter is owned by each subscription. It keeps the listener set and
//! the last known snapshot, and broadcasts every notification to all
//! listeners in receipt order.

use std::sync::{Arc, Mutex, MutexGuard};

use tabula_core::{metrics, Operation, RecordId, RecordSnapshot};

use crate::event::{ListenerId, RecordEvent, RecordListener};
use crate::sink::ErrorSink;
use crate::transport::{DocumentEvent, DocumentObserver};

type Listeners = Vec<(ListenerId, Arc<dyn RecordListener>)>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct AdapterState {
    listeners: Listeners,
    last: Option<RecordSnapshot>,
}

pub struct EventAdapter {
    record_id: RecordId,
    state: Mutex<AdapterState>,
    /// Held across every snapshot update and its delivery, and across a
    /// join and its initial delivery. `state` is never held while a listener
    /// runs, so listeners may remove themselves.
    delivery: Mutex<()>,
    sink: Arc<dyn ErrorSink>,
}

impl EventAdapter {
    pub fn new(record_id: RecordId, sink: Arc<dyn ErrorSink>) -> Self {
        Self {
            record_id,
            state: Mutex::new(AdapterState::default()),
            delivery: Mutex::new(()),
            sink,
        }
    }

    pub fn record_id(&self) -> &RecordId {
        &self.record_id
    }

    /// Register `listener` and hand it the current snapshot, if any.
    ///
    /// A listener never observes a snapshot older than one already
    /// broadcast to the listeners registered before it.
    pub fn add_listener(&self, id: ListenerId, listener: Arc<dyn RecordListener>) {
        let _ordered = lock(&self.delivery);
        let initial = {
            let mut state = lock(&self.state);
            state.listeners.push((id, Arc::clone(&listener)));
            state.last.clone()
        };
        if let Some(data) = initial {
            deliver(listener.as_ref(), &RecordEvent::snapshot(&self.record_id, data));
        }
    }

    /// Remove a listener. Returns how many remain, or `None` if `id` was not
    /// registered here.
    pub fn remove_listener(&self, id: ListenerId) -> Option<usize> {
        let mut state = lock(&self.state);
        let before = state.listeners.len();
        state.listeners.retain(|(lid, _)| *lid != id);
        (state.listeners.len() != before).then_some(state.listeners.len())
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.state).listeners.len()
    }

    pub fn last_snapshot(&self) -> Option<RecordSnapshot> {
        lock(&self.state).last.clone()
    }

    /// Seed the snapshot if none is known yet, without notifying anyone.
    pub fn prime(&self, data: Option<RecordSnapshot>) {
        let _ordered = lock(&self.delivery);
        let mut state = lock(&self.state);
        if state.last.is_none() {
            state.last = data;
        }
    }

    /// Drop every listener.
    pub fn clear(&self) {
        lock(&self.state).listeners.clear();
    }

    /// Apply `update` to the known snapshot, then broadcast the event it
    /// builds. Both steps happen under the delivery lock.
    fn publish(&self, update: impl FnOnce(&mut Option<RecordSnapshot>) -> RecordEvent) {
        let _ordered = lock(&self.delivery);
        let (event, listeners) = {
            let mut state = lock(&self.state);
            let event = update(&mut state.last);
            (event, state.listeners.clone())
        };
        for (_, listener) in &listeners {
            deliver(listener.as_ref(), &event);
        }
    }
}

fn deliver(listener: &dyn RecordListener, event: &RecordEvent) {
    listener.on_event(event);
    if let Some(m) = metrics() {
        m.record_event_delivered(event.kind.as_str());
    }
}

impl DocumentObserver for EventAdapter {
    fn on_event(&self, event: DocumentEvent, data: Option<RecordSnapshot>) {
        match event {
            DocumentEvent::Load => {
                let Some(data) = data else {
                    return;
                };
                self.publish(|last| {
                    *last = Some(data.clone());
                    RecordEvent::snapshot(&self.record_id, data)
                });
            }
            DocumentEvent::Op { entries, local } => {
                let operations = Operation {
                    record_id: self.record_id.clone(),
                    entries,
                };
                self.publish(|last| {
                    if data.is_some() {
                        *last = data;
                    }
                    let data = last.clone().unwrap_or_default();
                    RecordEvent::change(operations, local, data)
                });
            }
            DocumentEvent::Error(error) => {
                self.sink.report(&self.record_id, &error);
                self.publish(|last| {
                    RecordEvent::degraded(&self.record_id, last.clone().unwrap_or_default())
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::RecordEventKind;
    use crate::transport::TransportError;
    use proptest::prelude::*;
    use serde_json::json;
    use tabula_core::{build_field_update, FieldId};

    #[derive(Default)]
    struct Collect(Mutex<Vec<RecordEvent>>);

    impl RecordListener for Collect {
        fn on_event(&self, event: &RecordEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    #[derive(Default)]
    struct CountingSink(Mutex<usize>);

    impl ErrorSink for CountingSink {
        fn report(&self, _: &RecordId, _: &TransportError) {
            *self.0.lock().unwrap() += 1;
        }
    }

    fn snapshot(x: i64) -> RecordSnapshot {
        let mut s = RecordSnapshot::empty();
        s.fields.insert(FieldId::new("x"), json!(x));
        s
    }

    fn adapter() -> (EventAdapter, Arc<CountingSink>) {
        let sink = Arc::new(CountingSink::default());
        (EventAdapter::new(RecordId::new("r1"), sink.clone()), sink)
    }

    #[test]
    fn test_late_listener_gets_initial_snapshot() {
        let (adapter, _) = adapter();
        adapter.on_event(DocumentEvent::Load, Some(snapshot(5)));

        let listener = Arc::new(Collect::default());
        adapter.add_listener(ListenerId::next(), listener.clone());

        let events = listener.0.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, RecordEventKind::Snapshot);
        assert_eq!(events[0].data, snapshot(5));
    }

    #[test]
    fn test_ops_broadcast_in_order_to_all_listeners() {
        let (adapter, _) = adapter();
        let a = Arc::new(Collect::default());
        let b = Arc::new(Collect::default());
        adapter.add_listener(ListenerId::next(), a.clone());
        adapter.add_listener(ListenerId::next(), b.clone());

        for x in 1..=3 {
            let op = build_field_update(&RecordId::new("r1"), &FieldId::new("x"), Some(json!(x)), None);
            adapter.on_event(
                DocumentEvent::Op {
                    entries: op.entries,
                    local: x == 2,
                },
                Some(snapshot(x)),
            );
        }

        for listener in [&a, &b] {
            let events = listener.0.lock().unwrap();
            let seen: Vec<_> = events.iter().map(|e| e.data.clone()).collect();
            assert_eq!(seen, vec![snapshot(1), snapshot(2), snapshot(3)]);
            assert!(events[1].is_local_origin);
            assert!(!events[0].is_local_origin);
        }
    }

    #[test]
    fn test_error_delivers_last_known_snapshot() {
        let (adapter, sink) = adapter();
        let listener = Arc::new(Collect::default());
        adapter.add_listener(ListenerId::next(), listener.clone());

        adapter.on_event(DocumentEvent::Error(TransportError::Disconnected), None);
        adapter.on_event(DocumentEvent::Load, Some(snapshot(7)));
        adapter.on_event(DocumentEvent::Error(TransportError::Disconnected), None);

        let events = listener.0.lock().unwrap();
        assert_eq!(events[0].kind, RecordEventKind::Degraded);
        assert_eq!(events[0].data, RecordSnapshot::empty());
        assert_eq!(events[2].kind, RecordEventKind::Degraded);
        assert_eq!(events[2].data, snapshot(7));
        assert_eq!(*sink.0.lock().unwrap(), 2);
    }

    #[test]
    fn test_remove_listener_reports_remaining() {
        let (adapter, _) = adapter();
        let a = ListenerId::next();
        let b = ListenerId::next();
        adapter.add_listener(a, Arc::new(Collect::default()));
        adapter.add_listener(b, Arc::new(Collect::default()));

        assert_eq!(adapter.remove_listener(a), Some(1));
        assert_eq!(adapter.remove_listener(a), None);
        assert_eq!(adapter.remove_listener(b), Some(0));
    }

    #[test]
    fn test_prime_does_not_overwrite_newer_snapshot() {
        let (adapter, _) = adapter();
        adapter.prime(Some(snapshot(1)));
        adapter.on_event(DocumentEvent::Load, Some(snapshot(2)));
        adapter.prime(Some(snapshot(1)));
        assert_eq!(adapter.last_snapshot(), Some(snapshot(2)));
    }

    #[test]
    fn test_listeners_joining_during_updates_end_on_latest() {
        let (adapter, _) = adapter();
        let adapter = Arc::new(adapter);
        adapter.on_event(DocumentEvent::Load, Some(snapshot(0)));

        let writer = {
            let adapter = Arc::clone(&adapter);
            std::thread::spawn(move || {
                for x in 1..=500 {
                    let op = build_field_update(&RecordId::new("r1"), &FieldId::new("x"), Some(json!(x)), None);
                    adapter.on_event(
                        DocumentEvent::Op {
                            entries: op.entries,
                            local: false,
                        },
                        Some(snapshot(x)),
                    );
                }
            })
        };

        let joiners: Vec<_> = (0..8)
            .map(|_| {
                let adapter = Arc::clone(&adapter);
                std::thread::spawn(move || {
                    let mut joined = Vec::new();
                    for _ in 0..25 {
                        let listener = Arc::new(Collect::default());
                        adapter.add_listener(ListenerId::next(), listener.clone());
                        joined.push(listener);
                    }
                    joined
                })
            })
            .collect();

        writer.join().unwrap();
        let listeners: Vec<_> = joiners.into_iter().flat_map(|j| j.join().unwrap()).collect();

        assert_eq!(listeners.len(), 200);
        for listener in listeners {
            let events = listener.0.lock().unwrap();
            let last = events.last().expect("every joiner sees the current snapshot");
            assert_eq!(last.data, snapshot(500));
        }
    }

    fn op_event(x: i64) -> DocumentEvent {
        let op = build_field_update(&RecordId::new("r1"), &FieldId::new("x"), Some(json!(x)), None);
        DocumentEvent::Op {
            entries: op.entries,
            local: false,
        }
    }

    proptest! {
        #[test]
        fn prop_joiner_sees_current_then_every_later_change(
            loaded in any::<bool>(),
            writes in 0i64..20,
            join_at in 0i64..20,
        ) {
            let join_at = join_at.min(writes);
            let (adapter, _) = adapter();
            if loaded {
                adapter.on_event(DocumentEvent::Load, Some(snapshot(0)));
            }

            let listener = Arc::new(Collect::default());
            for x in 1..=writes {
                if x == join_at + 1 {
                    adapter.add_listener(ListenerId::next(), listener.clone());
                }
                adapter.on_event(op_event(x), Some(snapshot(x)));
            }
            if join_at == writes {
                adapter.add_listener(ListenerId::next(), listener.clone());
            }

            let events = listener.0.lock().unwrap();
            let has_initial = loaded || join_at > 0;
            let mut expected: Vec<RecordSnapshot> = Vec::new();
            if has_initial {
                expected.push(snapshot(join_at));
            }
            expected.extend((join_at + 1..=writes).map(snapshot));
            let seen: Vec<_> = events.iter().map(|e| e.data.clone()).collect();
            prop_assert_eq!(seen, expected);
            if has_initial {
                prop_assert!(events[0].kind == RecordEventKind::Snapshot);
            }
        }
    }
}
