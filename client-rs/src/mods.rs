//! Client-side mod channels
//!
//! A mod channel is a named pub/sub channel for fire-and-forget calls. The
//! client keeps one [`Mod`] per id and asks the broker for the channel's calls
//! while at least one handler is registered.

use parking_lot::RwLock;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::client::ClientInner;
use crate::codec;
use crate::error::Result;
use crate::messages::CallEntry;
use crate::validate::check_id;

/// Handler for calls whose argument is passed through undecoded
pub type RawCallHandler = Arc<dyn Fn(&str, Option<&[u8]>) + Send + Sync>;

/// Handle for a registered call handler
pub struct Subscription {
    channel: Arc<Mod>,
    handler_id: Uuid,
}

impl Subscription {
    /// Get the channel id
    pub fn channel(&self) -> &str {
        self.channel.id()
    }

    /// Remove the handler; the last one unsubscribes the channel at the broker
    pub fn unsubscribe(self) {
        self.channel.remove_handler(self.handler_id);
    }
}

pub struct Mod {
    id: String,
    client: Weak<ClientInner>,
    handlers: RwLock<Vec<(Uuid, RawCallHandler)>>,
}

impl Mod {
    pub(crate) fn new(id: &str, client: Weak<ClientInner>) -> Self {
        Self {
            id: id.to_string(),
            client,
            handlers: RwLock::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether any handler is registered
    pub fn is_subscribed(&self) -> bool {
        !self.handlers.read().is_empty()
    }

    /// Register a handler receiving decoded arguments
    ///
    /// Arguments that fail to decode are logged and the call is skipped.
    pub fn subscribe<F>(self: &Arc<Self>, handler: F) -> Subscription
    where
        F: Fn(&str, Option<serde_json::Value>) + Send + Sync + 'static,
    {
        let channel = self.id.clone();
        self.subscribe_raw(move |event, arg| {
            let arg = match arg.map(codec::decode::<serde_json::Value>).transpose() {
                Ok(arg) => arg,
                Err(e) => {
                    warn!(channel = %channel, event = %event, error = %e, "Failed to decode call argument");
                    return;
                }
            };
            handler(event, arg);
        })
    }

    /// Register a handler receiving the argument bytes untouched
    pub fn subscribe_raw<F>(self: &Arc<Self>, handler: F) -> Subscription
    where
        F: Fn(&str, Option<&[u8]>) + Send + Sync + 'static,
    {
        let handler_id = Uuid::new_v4();
        let first = {
            let mut handlers = self.handlers.write();
            handlers.push((handler_id, Arc::new(handler)));
            handlers.len() == 1
        };

        if first {
            if let Some(client) = self.client.upgrade() {
                client.push_mod_subscribe(&self.id, true);
            }
        }

        Subscription {
            channel: self.clone(),
            handler_id,
        }
    }

    /// Call `event` on every subscriber of this channel
    pub fn call(&self, event: &str, arg: Option<&serde_json::Value>) -> Result<()> {
        let arg = arg.map(codec::encode).transpose()?;
        self.call_raw(event, arg)
    }

    /// Call `event` with pre-encoded argument bytes
    ///
    /// Fails without queuing anything if the channel id is empty.
    pub fn call_raw(&self, event: &str, arg: Option<Vec<u8>>) -> Result<()> {
        check_id("channel", &self.id)?;
        if let Some(client) = self.client.upgrade() {
            client.push_call(CallEntry::new(self.id.clone(), event, arg));
        }
        Ok(())
    }

    /// Run every handler for a call received from the broker
    pub(crate) fn dispatch(&self, event: &str, arg: Option<&[u8]>) {
        let handlers: Vec<RawCallHandler> =
            self.handlers.read().iter().map(|(_, h)| h.clone()).collect();

        if handlers.is_empty() {
            debug!(channel = %self.id, event = %event, "No handlers for call");
            return;
        }

        for handler in handlers {
            handler(event, arg);
        }
    }

    fn remove_handler(&self, handler_id: Uuid) {
        let last = {
            let mut handlers = self.handlers.write();
            let before = handlers.len();
            handlers.retain(|(id, _)| *id != handler_id);
            before > 0 && handlers.is_empty()
        };

        if last {
            if let Some(client) = self.client.upgrade() {
                client.push_mod_subscribe(&self.id, false);
            }
        }
    }
}
