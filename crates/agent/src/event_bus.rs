//! In-process pub/sub connecting producers to persistence, forwarders and
//! accounting.
//!
//! Handlers are registered per event name and invoked in subscription order
//! on the dispatching task. A failing handler is logged and contributes a
//! `None` result; the remaining handlers still run.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::events::{AgentEvent, EventHandler, EventKind, EventName, EventScope};

type Subscription = (EventName, Arc<dyn EventHandler>);

#[derive(Default)]
pub struct EventBus {
    subscriptions: Mutex<Vec<Subscription>>,
}

fn same_handler(a: &Arc<dyn EventHandler>, b: &Arc<dyn EventHandler>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one event name. Re-subscribing the same
    /// handler instance to the same name is a no-op.
    pub fn subscribe(&self, name: EventName, handler: Arc<dyn EventHandler>) {
        let mut subscriptions = self.subscriptions.lock();
        let duplicate = subscriptions
            .iter()
            .any(|(n, h)| *n == name && same_handler(h, &handler));
        if duplicate {
            return;
        }
        subscriptions.push((name, handler));
    }

    /// Register one handler for several names at once.
    pub fn subscribe_all(&self, names: &[EventName], handler: Arc<dyn EventHandler>) {
        for name in names {
            self.subscribe(*name, handler.clone());
        }
    }

    pub fn unsubscribe(&self, name: EventName, handler: &Arc<dyn EventHandler>) {
        self.subscriptions
            .lock()
            .retain(|(n, h)| !(*n == name && same_handler(h, handler)));
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    /// Dispatch an event to its subscribers in registration order, awaiting
    /// each in turn. Handler failures are isolated: they are logged with
    /// context and yield a `None` slot while later handlers still run.
    pub async fn dispatch(&self, event: AgentEvent) -> Vec<Option<Value>> {
        let handlers: Vec<Arc<dyn EventHandler>> = {
            self.subscriptions
                .lock()
                .iter()
                .filter(|(name, _)| *name == event.name)
                .map(|(_, handler)| handler.clone())
                .collect()
        };

        let mut results = Vec::with_capacity(handlers.len());
        for handler in handlers {
            match handler.on_event(&event).await {
                Ok(value) => results.push(value),
                Err(err) => {
                    log::error!(
                        "event handler for '{}' failed (session={}): {}",
                        event.name,
                        event.scope.session_id,
                        err
                    );
                    results.push(None);
                }
            }
        }
        results
    }

    /// Build and dispatch in one step.
    pub async fn emit(&self, scope: EventScope, kind: EventKind) -> Vec<Option<Value>> {
        self.dispatch(AgentEvent::new(scope, kind)).await
    }
}
