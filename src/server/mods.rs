//! Broker-side mod channels and call fan-out

use parking_lot::RwLock;
use rpcbus_client::{CallEntry, Endpoint};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};
use uuid::Uuid;

/// Routes calls on one channel to every subscribed endpoint
pub struct ModChannel {
    id: String,
    subscribers: RwLock<HashMap<Uuid, Arc<Endpoint>>>,
}

impl ModChannel {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Add `endpoint` unless it has already been disposed
    pub fn subscribe(&self, endpoint: &Arc<Endpoint>) {
        let mut subscribers = self.subscribers.write();
        if endpoint.is_disposed() {
            trace!(channel = %self.id, endpoint = %endpoint.id(), "Ignoring subscribe from disposed endpoint");
            return;
        }
        subscribers.insert(endpoint.id(), endpoint.clone());
        debug!(channel = %self.id, endpoint = %endpoint.id(), "Subscribed");
    }

    pub fn unsubscribe(&self, endpoint: &Endpoint) {
        if self.subscribers.write().remove(&endpoint.id()).is_some() {
            debug!(channel = %self.id, endpoint = %endpoint.id(), "Unsubscribed");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Deliver a call to every current subscriber, returning how many got it
    ///
    /// Subscribers added while the call is being delivered do not receive it.
    pub fn dispatch(&self, event: &str, arg: Option<Vec<u8>>) -> usize {
        let subscribers: Vec<Arc<Endpoint>> = self.subscribers.read().values().cloned().collect();
        let count = subscribers.len();

        if count == 0 {
            debug!(channel = %self.id, event = %event, "No subscribers for channel");
            return 0;
        }

        trace!(channel = %self.id, event = %event, subscriber_count = count, "Routing call");

        let call = CallEntry::new(self.id.clone(), event, arg);
        for subscriber in subscribers {
            subscriber.push_call(call.clone());
        }

        count
    }
}
