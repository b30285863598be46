//! Topic-keyed publish/subscribe bus.
//!
//! `emit` is synchronous: every handler registered for the topic runs in
//! registration order before `emit` returns. Handlers are snapshotted before
//! they run, so a handler may subscribe, unsubscribe or emit without
//! deadlocking the bus. A panicking handler is caught and logged; its
//! siblings still run.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

/// A bus callback. Compared by pointer identity in [`EventBus::off`].
pub type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Handle returned by `on`/`once`, accepted by `off_by_id`.
pub type SubscriptionId = Uuid;

#[derive(Clone)]
struct Subscription {
    id: SubscriptionId,
    handler: Handler,
    once: Option<Arc<AtomicBool>>,
}

#[derive(Default)]
struct BusInner {
    topics: DashMap<String, Vec<Subscription>>,
    index: DashMap<SubscriptionId, String>,
}

/// Process-wide event bus. Cloning shares the subscription table.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a persistent handler.
    pub fn on<F>(&self, topic: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.subscribe(topic, Arc::new(handler), false)
    }

    /// Register a handler that is removed after the first emission it sees.
    pub fn once<F>(&self, topic: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.subscribe(topic, Arc::new(handler), true)
    }

    /// Register a shared handler, keeping the `Arc` for a later `off`.
    pub fn subscribe(&self, topic: &str, handler: Handler, once: bool) -> SubscriptionId {
        let id = Uuid::now_v7();
        let subscription = Subscription {
            id,
            handler,
            once: once.then(|| Arc::new(AtomicBool::new(false))),
        };
        self.inner
            .topics
            .entry(topic.to_string())
            .or_default()
            .push(subscription);
        self.inner.index.insert(id, topic.to_string());
        tracing::trace!(topic, %id, once, "subscribed");
        id
    }

    /// Remove one handler (by identity) or every handler of a topic.
    pub fn off(&self, topic: &str, handler: Option<&Handler>) {
        let removed: Vec<SubscriptionId> = match self.inner.topics.get_mut(topic) {
            Some(mut subs) => {
                let (gone, kept): (Vec<_>, Vec<_>) = subs
                    .drain(..)
                    .partition(|s| handler.is_none_or(|h| Arc::ptr_eq(h, &s.handler)));
                *subs = kept;
                gone.into_iter().map(|s| s.id).collect()
            }
            None => return,
        };
        for id in removed {
            self.inner.index.remove(&id);
        }
        self.inner.topics.remove_if(topic, |_, subs| subs.is_empty());
    }

    /// Remove a subscription by id. Unknown ids are ignored.
    pub fn off_by_id(&self, id: SubscriptionId) {
        let Some((_, topic)) = self.inner.index.remove(&id) else {
            return;
        };
        if let Some(mut subs) = self.inner.topics.get_mut(&topic) {
            subs.retain(|s| s.id != id);
        }
        self.inner.topics.remove_if(&topic, |_, subs| subs.is_empty());
    }

    /// Run every handler for `topic` in registration order.
    pub fn emit(&self, topic: &str, payload: &Value) {
        let snapshot: Vec<Subscription> = match self.inner.topics.get(topic) {
            Some(subs) => subs.clone(),
            None => {
                tracing::trace!(topic, "emit with no listeners");
                return;
            }
        };

        let mut fired_once = Vec::new();
        for sub in &snapshot {
            if let Some(flag) = &sub.once {
                // A nested emission may already have consumed it.
                if flag.swap(true, Ordering::SeqCst) {
                    continue;
                }
                fired_once.push(sub.id);
            }
            let handler = sub.handler.clone();
            if catch_unwind(AssertUnwindSafe(|| handler(payload))).is_err() {
                tracing::error!(topic, subscription = %sub.id, "event handler panicked");
            }
        }

        for id in fired_once {
            self.off_by_id(id);
        }
    }

    /// Serialize `payload` and emit it.
    pub fn emit_json<T: Serialize>(&self, topic: &str, payload: &T) {
        match serde_json::to_value(payload) {
            Ok(value) => self.emit(topic, &value),
            Err(e) => tracing::warn!(topic, error = %e, "failed to serialize event payload"),
        }
    }

    pub fn listener_count(&self, topic: &str) -> usize {
        self.inner.topics.get(topic).map_or(0, |subs| subs.len())
    }

    /// Emitter that prefixes every topic with `scope:`.
    pub fn scoped(&self, scope: impl Into<String>) -> ScopedEmitter {
        ScopedEmitter {
            bus: self.clone(),
            scope: scope.into(),
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("topics", &self.inner.topics.len())
            .field("subscriptions", &self.inner.index.len())
            .finish()
    }
}

/// `emit(t)` on a scoped emitter is `emit("{scope}:{t}")` on the bus.
#[derive(Clone, Debug)]
pub struct ScopedEmitter {
    bus: EventBus,
    scope: String,
}

impl ScopedEmitter {
    pub fn topic(&self, topic: &str) -> String {
        format!("{}:{topic}", self.scope)
    }

    pub fn emit(&self, topic: &str, payload: &Value) {
        self.bus.emit(&self.topic(topic), payload);
    }

    pub fn once<F>(&self, topic: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.bus.once(&self.topic(topic), handler)
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> Handler) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log2 = log.clone();
        let make = move |name: &str| -> Handler {
            let log = log2.clone();
            let name = name.to_string();
            Arc::new(move |_: &Value| log.lock().unwrap().push(name.clone()))
        };
        (log, make)
    }

    #[test]
    fn handlers_run_in_registration_order_for_every_emission() {
        let bus = EventBus::new();
        let (log, make) = recorder();
        bus.subscribe("t", make("h1"), false);
        bus.subscribe("t", make("h2"), false);

        bus.emit("t", &json!(1));
        bus.emit("t", &json!(2));

        assert_eq!(*log.lock().unwrap(), vec!["h1", "h2", "h1", "h2"]);
    }

    #[test]
    fn once_handler_runs_a_single_time() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        bus.once("t", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit("t", &Value::Null);
        bus.emit("t", &Value::Null);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count("t"), 0);
    }

    #[test]
    fn once_handlers_are_removed_after_all_siblings_ran() {
        let bus = EventBus::new();
        let (log, make) = recorder();
        bus.subscribe("t", make("once"), true);
        bus.subscribe("t", make("persistent"), false);

        bus.emit("t", &Value::Null);
        bus.emit("t", &Value::Null);

        assert_eq!(
            *log.lock().unwrap(),
            vec!["once", "persistent", "persistent"]
        );
    }

    #[test]
    fn panicking_handler_does_not_stop_siblings() {
        let bus = EventBus::new();
        let (log, make) = recorder();
        bus.on("t", |_| panic!("handler failure"));
        bus.subscribe("t", make("after"), false);

        bus.emit("t", &Value::Null);

        assert_eq!(*log.lock().unwrap(), vec!["after"]);
    }

    #[test]
    fn off_removes_one_handler_or_all() {
        let bus = EventBus::new();
        let (log, make) = recorder();
        let h1 = make("h1");
        bus.subscribe("t", h1.clone(), false);
        bus.subscribe("t", make("h2"), false);

        bus.off("t", Some(&h1));
        bus.emit("t", &Value::Null);
        assert_eq!(*log.lock().unwrap(), vec!["h2"]);

        bus.off("t", None);
        assert_eq!(bus.listener_count("t"), 0);
    }

    #[test]
    fn off_by_id_removes_only_that_subscription() {
        let bus = EventBus::new();
        let (log, make) = recorder();
        let id = bus.subscribe("t", make("h1"), false);
        bus.subscribe("t", make("h2"), false);

        bus.off_by_id(id);
        bus.off_by_id(id);
        bus.emit("t", &Value::Null);

        assert_eq!(*log.lock().unwrap(), vec!["h2"]);
    }

    #[test]
    fn handler_may_emit_and_subscribe_reentrantly() {
        let bus = EventBus::new();
        let (log, make) = recorder();
        let inner_bus = bus.clone();
        let inner = make("inner");
        bus.on("outer", move |_| {
            inner_bus.subscribe("inner", inner.clone(), true);
            inner_bus.emit("inner", &Value::Null);
        });

        bus.emit("outer", &Value::Null);
        assert_eq!(*log.lock().unwrap(), vec!["inner"]);
    }

    #[test]
    fn scoped_emitter_prefixes_topics() {
        let bus = EventBus::new();
        let (log, make) = recorder();
        bus.subscribe("overlay:open", make("open"), false);

        bus.scoped("overlay").emit("open", &json!({}));

        assert_eq!(*log.lock().unwrap(), vec!["open"]);
    }
}
