//! Hub relay
//!
//! A [`Hub`] looks like a broker to its downstream connections and like a
//! single client to its upstream broker. Calls travel in both directions
//! through [`HubMod`]s; signal values come down from the uplink and the
//! downstream owner's writes go up through [`HubSignal`]s.

mod mods;
mod signals;

pub use mods::HubMod;
pub use signals::HubSignal;

use dashmap::DashMap;
use rpcbus_client::{
    Attach, CallEntry, Client, Endpoint, Link, Role, Scope, ScopeConfig, SignalUpdate,
};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use crate::server::ConnectionManager;

struct HubInner {
    client: Client,
    config: ScopeConfig,
    connections: ConnectionManager,
    mods: DashMap<String, Arc<HubMod>>,
    signals: DashMap<String, Arc<HubSignal>>,
    this: Weak<HubInner>,
}

/// Relay between downstream connections and one upstream client
///
/// This struct is cheaply cloneable as it uses an internal Arc.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    /// Create a hub relaying through `client`
    ///
    /// Downstream endpoints use the client's configuration.
    pub fn new(client: Client) -> Self {
        let config = client.config().clone();
        let inner = Arc::new_cyclic(|this| HubInner {
            client,
            config,
            connections: ConnectionManager::new(),
            mods: DashMap::new(),
            signals: DashMap::new(),
            this: this.clone(),
        });

        Self { inner }
    }

    /// The upstream client
    pub fn client(&self) -> &Client {
        &self.inner.client
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.inner.connections
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.count()
    }

    /// Get (or create) the hub mod channel with the given id
    pub fn mod_channel(&self, id: &str) -> Arc<HubMod> {
        self.inner.mod_channel(id)
    }

    /// Get (or create) the hub signal with the given id
    pub fn signal_channel(&self, id: &str) -> Arc<HubSignal> {
        self.inner.signal_channel(id)
    }

    /// Dispose every downstream connection and the upstream session
    pub fn shutdown(&self) {
        for endpoint in self.inner.connections.all() {
            endpoint.dispose();
        }
        self.inner.client.disconnect();
    }
}

impl Attach for Hub {
    fn open_link(&self) -> Link {
        let scope: Weak<dyn Scope> = self.inner.this.clone();
        let link = Endpoint::open(scope, &self.inner.config, Role::Connection);
        self.inner.connections.add(link.endpoint.clone());
        info!(endpoint = %link.endpoint.id(), "Downstream connection attached");
        link
    }
}

impl HubInner {
    fn mod_channel(&self, id: &str) -> Arc<HubMod> {
        if let Some(existing) = self.mods.get(id) {
            return existing.value().clone();
        }

        self.mods
            .entry(id.to_string())
            .or_insert_with(|| HubMod::new(&self.client, id))
            .value()
            .clone()
    }

    fn signal_channel(&self, id: &str) -> Arc<HubSignal> {
        if let Some(existing) = self.signals.get(id) {
            return existing.value().clone();
        }

        self.signals
            .entry(id.to_string())
            .or_insert_with(|| HubSignal::new(&self.client, id))
            .value()
            .clone()
    }
}

impl Scope for HubInner {
    fn mod_subscribe(&self, endpoint: &Arc<Endpoint>, channel: &str, subscribe: bool) {
        let channel = self.mod_channel(channel);
        if subscribe {
            channel.subscribe(endpoint);
        } else {
            channel.unsubscribe(endpoint);
        }
    }

    fn call(&self, endpoint: &Arc<Endpoint>, call: CallEntry) {
        debug!(endpoint = %endpoint.id(), channel = %call.channel, event = %call.event, "Forwarding call upstream");
        if let Err(e) = self.client.call_raw(&call.channel, &call.event, call.arg) {
            warn!(endpoint = %endpoint.id(), error = %e, "Dropping call");
        }
    }

    fn signal(&self, endpoint: &Arc<Endpoint>, id: &str, update: SignalUpdate) {
        self.signal_channel(id).receive(update, endpoint);
    }

    fn release(&self, endpoint: &Arc<Endpoint>) {
        self.connections.remove(endpoint.id());

        let mods: Vec<Arc<HubMod>> = self.mods.iter().map(|m| m.value().clone()).collect();
        for channel in mods {
            channel.unsubscribe(endpoint);
        }

        let signals: Vec<Arc<HubSignal>> =
            self.signals.iter().map(|s| s.value().clone()).collect();
        for signal in signals {
            signal.release(endpoint);
        }

        debug!(endpoint = %endpoint.id(), label = %endpoint.label(), "Downstream connection released");
    }
}
