//! rpcbus broker
//!
//! The [`Server`] owns the broker-side mod channels and signals and every
//! downstream connection. It also carries a built-in [`Client`] linked to
//! itself in-process, so code living next to the broker uses the same API as
//! remote peers.

mod connections;
mod mods;
mod signals;
pub mod websocket;

pub use connections::ConnectionManager;
pub use mods::ModChannel;
pub use signals::SignalChannel;
pub use websocket::{create_router, run_websocket_server, WsState};

use dashmap::DashMap;
use rpcbus_client::{
    attach_direct, Attach, CallEntry, Client, Endpoint, Link, Role, Scope, ScopeConfig,
    SignalUpdate,
};
use std::sync::{Arc, Weak};
use tracing::{debug, info};

struct ServerInner {
    config: ScopeConfig,
    connections: ConnectionManager,
    mods: DashMap<String, Arc<ModChannel>>,
    signals: DashMap<String, Arc<SignalChannel>>,
    this: Weak<ServerInner>,
}

/// Broker accepting any number of downstream connections
///
/// Must be created inside a tokio runtime. This struct is cheaply cloneable as
/// it uses an internal Arc.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
    client: Client,
}

impl Server {
    pub fn new(config: ScopeConfig) -> Self {
        let inner = Arc::new_cyclic(|this| ServerInner {
            config: config.clone(),
            connections: ConnectionManager::new(),
            mods: DashMap::new(),
            signals: DashMap::new(),
            this: this.clone(),
        });

        let client = Client::new(config);
        let server = Self { inner, client };
        attach_direct(&server, &server.client);
        server
    }

    pub fn config(&self) -> &ScopeConfig {
        &self.inner.config
    }

    /// The built-in client linked to this server in-process
    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.inner.connections
    }

    /// Number of attached connections, the built-in client included
    pub fn connection_count(&self) -> usize {
        self.inner.connections.count()
    }

    /// Get (or create) the mod channel with the given id
    pub fn mod_channel(&self, id: &str) -> Arc<ModChannel> {
        self.inner.mod_channel(id)
    }

    /// Get (or create) the signal with the given id
    pub fn signal_channel(&self, id: &str) -> Arc<SignalChannel> {
        self.inner.signal_channel(id)
    }

    /// Dispose every connection
    pub fn shutdown(&self) {
        for endpoint in self.inner.connections.all() {
            endpoint.dispose();
        }
    }
}

impl Attach for Server {
    fn open_link(&self) -> Link {
        let scope: Weak<dyn Scope> = self.inner.this.clone();
        let link = Endpoint::open(scope, &self.inner.config, Role::Connection);
        self.inner.connections.add(link.endpoint.clone());
        info!(endpoint = %link.endpoint.id(), "Connection attached");
        link
    }
}

impl ServerInner {
    fn mod_channel(&self, id: &str) -> Arc<ModChannel> {
        self.mods
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(ModChannel::new(id)))
            .value()
            .clone()
    }

    fn signal_channel(&self, id: &str) -> Arc<SignalChannel> {
        self.signals
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(SignalChannel::new(id)))
            .value()
            .clone()
    }
}

impl Scope for ServerInner {
    fn mod_subscribe(&self, endpoint: &Arc<Endpoint>, channel: &str, subscribe: bool) {
        let channel = self.mod_channel(channel);
        if subscribe {
            channel.subscribe(endpoint);
        } else {
            channel.unsubscribe(endpoint);
        }
    }

    fn call(&self, _endpoint: &Arc<Endpoint>, call: CallEntry) {
        self.mod_channel(&call.channel).dispatch(&call.event, call.arg);
    }

    fn signal(&self, endpoint: &Arc<Endpoint>, id: &str, update: SignalUpdate) {
        self.signal_channel(id).receive(update, endpoint);
    }

    fn release(&self, endpoint: &Arc<Endpoint>) {
        self.connections.remove(endpoint.id());

        let mods: Vec<Arc<ModChannel>> = self.mods.iter().map(|m| m.value().clone()).collect();
        for channel in mods {
            channel.unsubscribe(endpoint);
        }

        let signals: Vec<Arc<SignalChannel>> =
            self.signals.iter().map(|s| s.value().clone()).collect();
        for signal in signals {
            signal.release(endpoint);
        }

        debug!(endpoint = %endpoint.id(), label = %endpoint.label(), "Connection released");
    }
}
