use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock, Weak};

use tracing::{debug, trace};

use cascade_types::{CommitEvent, SessionId};

use crate::error::{SessionError, SessionResult};
use crate::session::Session;

/// Callback run on the subscriber's thread after each merged commit.
pub type MergeHook = Arc<dyn Fn(&Session, &CommitEvent) + Send + Sync>;

struct Subscription {
    subscriber: Weak<Session>,
    subscriber_id: SessionId,
    hook: Option<MergeHook>,
}

/// Release state of one source's commit events.
#[derive(Default)]
struct SourceOrder {
    /// Highest sequence delivered or withdrawn so far.
    released: u64,
    /// Settled events waiting on an earlier sequence. `None` marks a
    /// withdrawn event.
    settled: BTreeMap<u64, Option<CommitEvent>>,
}

/// Routes commit events from a source session to its subscribers.
///
/// Delivery is at-most-once: each event is queued on the subscriber's
/// dispatcher and merged there. Events from one source go out strictly by
/// sequence; an event settled early waits until every earlier one has been
/// delivered or withdrawn. Subscribers that were dropped or invalidated are
/// pruned on the next delivery and their events discarded.
pub struct MergeBus {
    routes: RwLock<HashMap<SessionId, Vec<Subscription>>>,
    order: Mutex<HashMap<SessionId, SourceOrder>>,
}

/// A commit event waiting for the rest of its cascade.
///
/// [`release`](Self::release) delivers it. Dropping it withdraws it, so
/// later events from the same source are not held up behind it.
pub struct HeldEvent {
    bus: Arc<MergeBus>,
    event: Option<CommitEvent>,
}

impl HeldEvent {
    pub fn event(&self) -> Option<&CommitEvent> {
        self.event.as_ref()
    }

    /// Deliver the event. Returns how many deliveries were queued, which
    /// includes later events this one was holding up.
    pub fn release(mut self) -> usize {
        match self.event.take() {
            Some(event) => self.bus.settle(event.source, event.sequence, Some(event)),
            None => 0,
        }
    }
}

impl Drop for HeldEvent {
    fn drop(&mut self) {
        if let Some(event) = self.event.take() {
            debug!(source = %event.source, sequence = event.sequence, "commit event withdrawn");
            self.bus.settle(event.source, event.sequence, None);
        }
    }
}

impl std::fmt::Debug for HeldEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeldEvent")
            .field("source", &self.event.as_ref().map(|e| e.source))
            .field("sequence", &self.event.as_ref().map(|e| e.sequence))
            .finish()
    }
}

impl MergeBus {
    pub fn new() -> Self {
        Self {
            routes: RwLock::new(HashMap::new()),
            order: Mutex::new(HashMap::new()),
        }
    }

    /// Refresh `subscriber` whenever `source` saves.
    pub fn subscribe(&self, subscriber: &Arc<Session>, source: &Session) -> SessionResult<()> {
        self.add(subscriber, source, None)
    }

    /// Like [`subscribe`](Self::subscribe), and run `hook` after each merge.
    pub fn subscribe_with<F>(&self, subscriber: &Arc<Session>, source: &Session, hook: F) -> SessionResult<()>
    where
        F: Fn(&Session, &CommitEvent) + Send + Sync + 'static,
    {
        self.add(subscriber, source, Some(Arc::new(hook)))
    }

    fn add(&self, subscriber: &Arc<Session>, source: &Session, hook: Option<MergeHook>) -> SessionResult<()> {
        if subscriber.id() == source.id() {
            return Err(SessionError::InvalidSubscription(format!(
                "{} cannot subscribe to itself",
                source.id()
            )));
        }
        for session in [subscriber.as_ref(), source] {
            if session.is_invalidated() {
                return Err(SessionError::SessionInvalidated(session.id()));
            }
        }

        let mut routes = self.routes.write().expect("merge bus lock poisoned");
        let list = routes.entry(source.id()).or_default();
        match list.iter_mut().find(|s| s.subscriber_id == subscriber.id()) {
            Some(existing) => existing.hook = hook,
            None => list.push(Subscription {
                subscriber: Arc::downgrade(subscriber),
                subscriber_id: subscriber.id(),
                hook,
            }),
        }
        debug!(subscriber = %subscriber.id(), source = %source.id(), "subscribed to commits");
        Ok(())
    }

    /// Returns `true` if a subscription was removed.
    pub fn unsubscribe(&self, subscriber: &Session, source: &Session) -> bool {
        let mut routes = self.routes.write().expect("merge bus lock poisoned");
        let Some(list) = routes.get_mut(&source.id()) else {
            return false;
        };
        let before = list.len();
        list.retain(|s| s.subscriber_id != subscriber.id());
        let removed = list.len() != before;
        if list.is_empty() {
            routes.remove(&source.id());
        }
        removed
    }

    /// Drop every subscription `session` takes part in, as subscriber or
    /// as source. Returns how many were removed.
    pub fn unsubscribe_all(&self, session: SessionId) -> usize {
        let mut routes = self.routes.write().expect("merge bus lock poisoned");
        let mut removed = routes.remove(&session).map_or(0, |list| list.len());
        for list in routes.values_mut() {
            let before = list.len();
            list.retain(|s| s.subscriber_id != session);
            removed += before - list.len();
        }
        routes.retain(|_, list| !list.is_empty());
        removed
    }

    /// Drop every subscription and forget every source's release order.
    pub fn clear(&self) {
        self.routes.write().expect("merge bus lock poisoned").clear();
        self.order.lock().expect("merge bus lock poisoned").clear();
    }

    pub fn subscriber_count(&self, source: SessionId) -> usize {
        self.routes
            .read()
            .expect("merge bus lock poisoned")
            .get(&source)
            .map_or(0, Vec::len)
    }

    /// Queue `event` for every live subscriber of its source, after any
    /// earlier events from that source still being held. Never blocks on a
    /// subscriber. Returns how many deliveries were queued.
    pub fn publish(&self, event: CommitEvent) -> usize {
        self.settle(event.source, event.sequence, Some(event))
    }

    /// Keep `event` back until the returned handle is released or dropped.
    pub fn hold(self: &Arc<Self>, event: CommitEvent) -> HeldEvent {
        trace!(source = %event.source, sequence = event.sequence, "commit event held");
        HeldEvent {
            bus: Arc::clone(self),
            event: Some(event),
        }
    }

    /// Events still waiting on an earlier sequence from `source`.
    pub fn pending_count(&self, source: SessionId) -> usize {
        self.order
            .lock()
            .expect("merge bus lock poisoned")
            .get(&source)
            .map_or(0, |o| o.settled.len())
    }

    /// Record the outcome of `sequence` and deliver every event that is now
    /// next in line. Delivery happens under the order lock so two settling
    /// threads never interleave one source's events.
    fn settle(&self, source: SessionId, sequence: u64, event: Option<CommitEvent>) -> usize {
        let mut order = self.order.lock().expect("merge bus lock poisoned");
        let entry = order.entry(source).or_default();
        if sequence <= entry.released {
            debug!(source = %source, sequence, released = entry.released, "stale commit event ignored");
            return 0;
        }
        entry.settled.insert(sequence, event);

        let mut queued = 0;
        while let Some(next) = entry.settled.remove(&(entry.released + 1)) {
            entry.released += 1;
            if let Some(event) = next {
                queued += self.deliver(event);
            }
        }
        if !entry.settled.is_empty() {
            trace!(
                source = %source,
                released = entry.released,
                waiting = entry.settled.len(),
                "commit events waiting on an earlier save"
            );
        }
        queued
    }

    fn deliver(&self, event: CommitEvent) -> usize {
        let mut targets = Vec::new();
        let mut stale = false;
        {
            let routes = self.routes.read().expect("merge bus lock poisoned");
            let Some(list) = routes.get(&event.source) else {
                return 0;
            };
            for sub in list {
                match sub.subscriber.upgrade() {
                    Some(session) if !session.is_invalidated() => {
                        targets.push((session, sub.hook.clone()));
                    }
                    _ => stale = true,
                }
            }
        }
        if stale {
            self.prune(event.source);
        }

        let event = Arc::new(event);
        let mut queued = 0;
        for (session, hook) in targets {
            let subscriber = session.id();
            let dispatcher = session.dispatcher().clone();
            let event = Arc::clone(&event);
            let delivery = dispatcher.perform(move || match session.merge(&event) {
                Ok(touched) => {
                    trace!(
                        subscriber = %session.id(),
                        source = %event.source,
                        sequence = event.sequence,
                        touched,
                        "commit delivered"
                    );
                    if let Some(hook) = hook {
                        hook(&session, &event);
                    }
                }
                Err(err) => {
                    trace!(subscriber = %session.id(), error = %err, "merge dropped");
                }
            });
            match delivery {
                Ok(()) => queued += 1,
                Err(err) => trace!(subscriber = %subscriber, error = %err, "delivery dropped"),
            }
        }
        queued
    }

    fn prune(&self, source: SessionId) {
        let mut routes = self.routes.write().expect("merge bus lock poisoned");
        if let Some(list) = routes.get_mut(&source) {
            list.retain(|s| {
                s.subscriber
                    .upgrade()
                    .is_some_and(|session| !session.is_invalidated())
            });
            if list.is_empty() {
                routes.remove(&source);
            }
        }
        trace!(source = %source, "pruned dead subscribers");
    }
}

impl Default for MergeBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MergeBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let routes = self.routes.read().expect("merge bus lock poisoned");
        let subscriptions: usize = routes.values().map(Vec::len).sum();
        f.debug_struct("MergeBus")
            .field("sources", &routes.len())
            .field("subscriptions", &subscriptions)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{Dispatcher, WorkerThread};
    use cascade_store::{AttributeKind, EntityDescription, InMemoryPersistentStore, ObjectModel};
    use cascade_types::{Attributes, SessionRole, VersionClock};
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    struct Fixture {
        root: Arc<Session>,
        background: Arc<Session>,
        workers: Vec<WorkerThread>,
    }

    fn fixture() -> Fixture {
        let model = ObjectModel::new()
            .with_entity(EntityDescription::new("User").attribute("name", AttributeKind::String));
        let root_worker = WorkerThread::spawn("bus-store").unwrap();
        let bg_worker = WorkerThread::spawn("bus-background").unwrap();
        let root = Session::root(
            root_worker.dispatcher(),
            Arc::new(InMemoryPersistentStore::new()),
            Arc::new(model),
            Arc::new(VersionClock::new()),
        );
        let background = Session::child(SessionRole::Background, bg_worker.dispatcher(), &root);
        Fixture {
            root,
            background,
            workers: vec![root_worker, bg_worker],
        }
    }

    fn insert_and_commit(session: &Arc<Session>, name: &str) -> CommitEvent {
        let target = Arc::clone(session);
        let name = name.to_string();
        session
            .dispatcher()
            .perform_and_wait(move || {
                let mut attrs = Attributes::new();
                attrs.insert("name".into(), json!(name));
                target.insert("User", attrs).unwrap();
                target.commit().unwrap().unwrap()
            })
            .unwrap()
    }

    #[test]
    fn self_subscription_is_rejected() {
        let f = fixture();
        let bus = MergeBus::new();
        assert!(matches!(
            bus.subscribe(&f.background, &f.background),
            Err(SessionError::InvalidSubscription(_))
        ));
    }

    #[test]
    fn duplicate_subscription_is_idempotent() {
        let f = fixture();
        let bus = MergeBus::new();
        bus.subscribe(&f.background, &f.root).unwrap();
        bus.subscribe(&f.background, &f.root).unwrap();
        assert_eq!(bus.subscriber_count(f.root.id()), 1);

        assert!(bus.unsubscribe(&f.background, &f.root));
        assert!(!bus.unsubscribe(&f.background, &f.root));
        assert_eq!(bus.subscriber_count(f.root.id()), 0);
    }

    #[test]
    fn events_arrive_in_commit_order() {
        let f = fixture();
        let bus = MergeBus::new();
        let run_loop = Dispatcher::for_current_thread("bus-main").unwrap();
        let main = Session::child(SessionRole::Main, run_loop.dispatcher(), &f.background);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe_with(&main, &f.background, move |session, event| {
            assert!(session.dispatcher().is_current());
            sink.lock().unwrap().push(event.sequence);
        })
        .unwrap();

        for i in 0..5 {
            let event = insert_and_commit(&f.background, &format!("user-{i}"));
            assert_eq!(bus.publish(event), 1);
        }
        assert!(run_loop.run_until(|| seen.lock().unwrap().len() == 5, Duration::from_secs(5)));
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3, 4, 5]);
        assert_eq!(main.registered_objects().len(), 5);
    }

    #[test]
    fn held_event_blocks_later_events_until_released() {
        let f = fixture();
        let bus = Arc::new(MergeBus::new());
        let worker = WorkerThread::spawn("bus-held").unwrap();
        let scratch = Session::child(SessionRole::Scratch, worker.dispatcher(), &f.background);
        bus.subscribe(&scratch, &f.background).unwrap();

        let first = bus.hold(insert_and_commit(&f.background, "ada"));
        let second = insert_and_commit(&f.background, "grace");
        assert_eq!(bus.publish(second), 0);
        assert_eq!(bus.pending_count(f.background.id()), 1);

        assert_eq!(first.release(), 2);
        assert_eq!(bus.pending_count(f.background.id()), 0);
        worker.dispatcher().perform_and_wait(|| ()).unwrap();
        assert_eq!(scratch.registered_objects().len(), 2);
    }

    #[test]
    fn dropped_held_event_is_withdrawn() {
        let f = fixture();
        let bus = Arc::new(MergeBus::new());
        let worker = WorkerThread::spawn("bus-withdrawn").unwrap();
        let scratch = Session::child(SessionRole::Scratch, worker.dispatcher(), &f.background);
        bus.subscribe(&scratch, &f.background).unwrap();

        let withdrawn = bus.hold(insert_and_commit(&f.background, "ada"));
        let second = insert_and_commit(&f.background, "grace");
        assert_eq!(bus.publish(second), 0);
        drop(withdrawn);
        assert_eq!(bus.pending_count(f.background.id()), 0);

        worker.dispatcher().perform_and_wait(|| ()).unwrap();
        let names: Vec<_> = scratch
            .registered_objects()
            .into_iter()
            .filter_map(|o| o.get("name").cloned())
            .collect();
        assert_eq!(names, vec![json!("grace")]);

        // A stale sequence is ignored.
        let replay = CommitEvent {
            source: f.background.id(),
            source_role: SessionRole::Background,
            sequence: 1,
            changes: Vec::new(),
        };
        assert_eq!(bus.publish(replay), 0);
    }

    #[test]
    fn dead_subscribers_are_pruned() {
        let mut f = fixture();
        let bus = MergeBus::new();
        let worker = WorkerThread::spawn("bus-scratch").unwrap();
        let scratch = Session::child(SessionRole::Scratch, worker.dispatcher(), &f.background);
        bus.subscribe(&scratch, &f.background).unwrap();
        f.workers.push(worker);
        drop(scratch);

        let event = insert_and_commit(&f.background, "ada");
        assert_eq!(bus.publish(event), 0);
        assert_eq!(bus.subscriber_count(f.background.id()), 0);
    }

    #[test]
    fn invalidated_subscribers_are_pruned() {
        let f = fixture();
        let bus = MergeBus::new();
        bus.subscribe(&f.background, &f.root).unwrap();
        f.background.invalidate();

        let event = CommitEvent {
            source: f.root.id(),
            source_role: SessionRole::Store,
            sequence: 1,
            changes: Vec::new(),
        };
        assert_eq!(bus.publish(event), 0);
        assert_eq!(bus.subscriber_count(f.root.id()), 0);
        assert!(matches!(
            bus.subscribe(&f.background, &f.root),
            Err(SessionError::SessionInvalidated(_))
        ));
    }

    #[test]
    fn unsubscribe_all_covers_both_directions() {
        let f = fixture();
        let bus = MergeBus::new();
        let worker = WorkerThread::spawn("bus-extra").unwrap();
        let scratch = Session::child(SessionRole::Scratch, worker.dispatcher(), &f.background);

        bus.subscribe(&f.background, &f.root).unwrap();
        bus.subscribe(&scratch, &f.background).unwrap();
        assert_eq!(bus.unsubscribe_all(f.background.id()), 2);
        assert_eq!(bus.subscriber_count(f.root.id()), 0);
        assert_eq!(bus.subscriber_count(f.background.id()), 0);
    }

    #[test]
    fn publish_without_subscribers_is_noop() {
        let f = fixture();
        let bus = MergeBus::new();
        let event = insert_and_commit(&f.background, "ada");
        assert_eq!(bus.publish(event), 0);
        assert!(format!("{bus:?}").contains("MergeBus"));
    }
}
