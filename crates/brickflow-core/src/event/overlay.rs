//! Request/response over the bus.
//!
//! A request emits `overlay:open` with a fresh request id and parks a
//! oneshot sender. Whoever answers emits `overlay:resolve:<id>` or
//! `overlay:reject:<id>` (directly or through [`OverlayChannel::resolve`] /
//! [`OverlayChannel::reject`]). Whichever arrives first settles the request;
//! later answers find nothing pending and are ignored. Dropping the
//! returned future withdraws the request.

use std::future::Future;
use std::sync::Arc;

use brickflow_types::event::OVERLAY_SCOPE;
use dashmap::DashMap;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::oneshot;
use uuid::Uuid;

use super::bus::{EventBus, ScopedEmitter, SubscriptionId};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum OverlayError {
    #[error("overlay request rejected: {0}")]
    Rejected(Value),

    #[error("overlay request {0} was dropped before it settled")]
    Dropped(Uuid),
}

struct PendingRequest {
    sender: oneshot::Sender<Result<Value, Value>>,
    subscriptions: [SubscriptionId; 2],
}

/// Withdraws a request whose future is dropped before it settles.
struct Withdraw {
    request_id: Uuid,
    pending: Arc<DashMap<Uuid, PendingRequest>>,
    bus: EventBus,
}

impl Drop for Withdraw {
    fn drop(&mut self) {
        if let Some((_, request)) = self.pending.remove(&self.request_id) {
            tracing::debug!(request_id = %self.request_id, "overlay request withdrawn");
            for id in request.subscriptions {
                self.bus.off_by_id(id);
            }
        }
    }
}

/// Pending overlay requests, keyed by request id.
#[derive(Clone)]
pub struct OverlayChannel {
    emitter: ScopedEmitter,
    pending: Arc<DashMap<Uuid, PendingRequest>>,
}

impl OverlayChannel {
    pub fn new(bus: &EventBus) -> Self {
        Self {
            emitter: bus.scoped(OVERLAY_SCOPE),
            pending: Arc::new(DashMap::new()),
        }
    }

    /// Open an overlay and wait for its answer. The wait is unbounded.
    ///
    /// The request is registered and `overlay:open` is emitted before this
    /// returns; the returned future only waits for the answer.
    pub fn request(
        &self,
        component_id: &str,
        props: Value,
    ) -> (Uuid, impl Future<Output = Result<Value, OverlayError>> + Send + 'static) {
        let request_id = Uuid::now_v7();
        let (tx, rx) = oneshot::channel();

        let resolve_sub = self.settle_on(&format!("resolve:{request_id}"), request_id, true);
        let reject_sub = self.settle_on(&format!("reject:{request_id}"), request_id, false);
        self.pending.insert(
            request_id,
            PendingRequest {
                sender: tx,
                subscriptions: [resolve_sub, reject_sub],
            },
        );

        tracing::debug!(%request_id, component_id, "overlay opened");
        self.emitter.emit(
            "open",
            &json!({
                "requestId": request_id,
                "componentId": component_id,
                "props": props,
            }),
        );

        let withdraw = Withdraw {
            request_id,
            pending: self.pending.clone(),
            bus: self.emitter.bus().clone(),
        };
        let fut = async move {
            let _withdraw = withdraw;
            match rx.await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(reason)) => Err(OverlayError::Rejected(reason)),
                Err(_) => Err(OverlayError::Dropped(request_id)),
            }
        };
        (request_id, fut)
    }

    fn settle_on(&self, topic: &str, request_id: Uuid, resolve: bool) -> SubscriptionId {
        let pending = self.pending.clone();
        let bus = self.emitter.bus().clone();
        self.emitter.once(topic, move |payload| {
            let Some((_, request)) = pending.remove(&request_id) else {
                return;
            };
            for id in request.subscriptions {
                bus.off_by_id(id);
            }
            let outcome = if resolve {
                Ok(payload.clone())
            } else {
                Err(payload.clone())
            };
            // Receiver gone means the requester stopped waiting.
            let _ = request.sender.send(outcome);
        })
    }

    /// Answer a request. Returns `false` if it was not pending.
    pub fn resolve(&self, request_id: Uuid, data: Value) -> bool {
        self.answer(request_id, "resolve", data)
    }

    /// Reject a request. Returns `false` if it was not pending.
    pub fn reject(&self, request_id: Uuid, reason: Value) -> bool {
        self.answer(request_id, "reject", reason)
    }

    fn answer(&self, request_id: Uuid, verb: &str, payload: Value) -> bool {
        if !self.pending.contains_key(&request_id) {
            tracing::debug!(%request_id, verb, "overlay already settled");
            return false;
        }
        self.emitter.emit(&format!("{verb}:{request_id}"), &payload);
        true
    }

    pub fn is_pending(&self, request_id: Uuid) -> bool {
        self.pending.contains_key(&request_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn request_emits_open_and_resolves() {
        let bus = EventBus::new();
        let opened = Arc::new(Mutex::new(None));
        let o = opened.clone();
        bus.on("overlay:open", move |payload| {
            *o.lock().unwrap() = Some(payload.clone());
        });
        let overlay = OverlayChannel::new(&bus);

        let (id, answer) = overlay.request("pricing_dialog", json!({"plan": "pro"}));
        let open = opened.lock().unwrap().clone().unwrap();
        assert_eq!(open["componentId"], "pricing_dialog");
        assert_eq!(open["props"]["plan"], "pro");

        assert!(overlay.resolve(id, json!({"accepted": true})));
        assert_eq!(answer.await.unwrap(), json!({"accepted": true}));
    }

    #[tokio::test]
    async fn exactly_one_answer_settles() {
        let bus = EventBus::new();
        let overlay = OverlayChannel::new(&bus);

        let (id, answer) = overlay.request("dialog", Value::Null);
        assert!(overlay.reject(id, json!("closed")));
        assert!(!overlay.resolve(id, json!("late")));
        assert!(!overlay.reject(id, json!("later")));

        assert_eq!(
            answer.await,
            Err(OverlayError::Rejected(json!("closed")))
        );
        assert_eq!(bus.listener_count(&format!("overlay:resolve:{id}")), 0);
    }

    #[tokio::test]
    async fn dropping_the_answer_withdraws_the_request() {
        let bus = EventBus::new();
        let overlay = OverlayChannel::new(&bus);

        let (id, answer) = overlay.request("dialog", Value::Null);
        assert!(overlay.is_pending(id));
        drop(answer);

        assert!(!overlay.is_pending(id));
        assert_eq!(bus.listener_count(&format!("overlay:resolve:{id}")), 0);
        assert_eq!(bus.listener_count(&format!("overlay:reject:{id}")), 0);
        assert!(!overlay.resolve(id, json!("late")));
    }

    #[tokio::test]
    async fn raw_bus_answers_are_honoured() {
        let bus = EventBus::new();
        let overlay = OverlayChannel::new(&bus);

        let (id, answer) = overlay.request("dialog", Value::Null);
        bus.emit(&format!("overlay:resolve:{id}"), &json!(7));
        bus.emit(&format!("overlay:reject:{id}"), &json!("ignored"));

        assert_eq!(answer.await.unwrap(), json!(7));
        assert!(!overlay.is_pending(id));
    }
}
