//! rpcbus client implementation

use crate::config::ScopeConfig;
use crate::endpoint::{Attach, Endpoint, Link, Role, Scope};
use crate::error::Result;
use crate::messages::{merge_signal, CallEntry, SignalUpdate};
use crate::mods::{Mod, Subscription};
use crate::signal::Signal;
use crate::validate::check_id;

use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Connection state of the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No active session
    Disconnected,
    /// Attempting to connect
    Connecting,
    /// A session is attached
    Connected,
    /// Attempting to reconnect after disconnect
    Reconnecting,
}

/// Internal client state
pub(crate) struct ClientInner {
    config: ScopeConfig,
    state: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,

    mods: DashMap<String, Arc<Mod>>,
    signals: DashMap<String, Arc<Signal>>,

    // At most one session is active; outbound traffic without one is dropped
    session: RwLock<Option<Arc<Endpoint>>>,

    this: Weak<ClientInner>,
}

/// rpcbus client
///
/// Owns the client-side mod channels and signals and at most one session with
/// a broker. Attaching a new transport replaces the previous session. This
/// struct is cheaply cloneable as it uses an internal Arc.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Default for Client {
    fn default() -> Self {
        Self::new(ScopeConfig::default())
    }
}

impl Client {
    /// Create a new client with the given configuration
    pub fn new(config: ScopeConfig) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let inner = Arc::new_cyclic(|this| ClientInner {
            config,
            state: state_tx,
            state_rx,
            mods: DashMap::new(),
            signals: DashMap::new(),
            session: RwLock::new(None),
            this: this.clone(),
        });

        Self { inner }
    }

    pub fn config(&self) -> &ScopeConfig {
        &self.inner.config
    }

    /// Get the current connection state
    pub fn connection_state(&self) -> ConnectionState {
        *self.inner.state_rx.borrow()
    }

    /// Get a receiver for connection state changes
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_rx.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.session().is_some()
    }

    /// The active session, if any
    pub fn session(&self) -> Option<Arc<Endpoint>> {
        self.inner.session()
    }

    /// Get (or create) the mod channel with the given id
    pub fn channel(&self, id: &str) -> Arc<Mod> {
        self.inner.mod_channel(id)
    }

    /// Get (or create) the signal with the given id
    pub fn signal(&self, id: &str) -> Arc<Signal> {
        self.inner.signal_channel(id)
    }

    /// Call `event` on every subscriber of `channel`
    ///
    /// Fire-and-forget: without an active session the call is dropped.
    pub fn call(&self, channel: &str, event: &str, arg: Option<&serde_json::Value>) -> Result<()> {
        self.channel(channel).call(event, arg)
    }

    /// Call with pre-encoded argument bytes
    pub fn call_raw(&self, channel: &str, event: &str, arg: Option<Vec<u8>>) -> Result<()> {
        check_id("channel", channel)?;
        self.inner.push_call(CallEntry::new(channel, event, arg));
        Ok(())
    }

    /// Subscribe to calls on `channel`
    pub fn subscribe<F>(&self, channel: &str, handler: F) -> Subscription
    where
        F: Fn(&str, Option<serde_json::Value>) + Send + Sync + 'static,
    {
        self.channel(channel).subscribe(handler)
    }

    /// Subscribe to calls on `channel` without decoding their arguments
    pub fn subscribe_raw<F>(&self, channel: &str, handler: F) -> Subscription
    where
        F: Fn(&str, Option<&[u8]>) + Send + Sync + 'static,
    {
        self.channel(channel).subscribe_raw(handler)
    }

    /// End the active session, if any
    pub fn disconnect(&self) {
        if let Some(session) = self.inner.session() {
            session.dispose();
        }
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.inner.state.send_replace(state);
    }
}

impl Attach for Client {
    fn open_link(&self) -> Link {
        self.inner.open_session()
    }
}

impl ClientInner {
    fn session(&self) -> Option<Arc<Endpoint>> {
        self.session.read().clone()
    }

    fn mod_channel(&self, id: &str) -> Arc<Mod> {
        self.mods
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mod::new(id, self.this.clone())))
            .value()
            .clone()
    }

    fn signal_channel(&self, id: &str) -> Arc<Signal> {
        self.signals
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Signal::new(id, self.this.clone(), self.config.aggregate)))
            .value()
            .clone()
    }

    pub(crate) fn push_call(&self, call: CallEntry) {
        match self.session() {
            Some(session) => session.push_call(call),
            None => {
                debug!(channel = %call.channel, event = %call.event, "No active session, dropping call")
            }
        }
    }

    pub(crate) fn push_mod_subscribe(&self, channel: &str, subscribe: bool) {
        if let Err(e) = check_id("channel", channel) {
            warn!(error = %e, "Not subscribing to unroutable channel");
            return;
        }
        match self.session() {
            Some(session) => session.push_mod_subscribe(channel, subscribe),
            None => debug!(channel = %channel, "No active session, deferring subscription"),
        }
    }

    pub(crate) fn push_signal(&self, id: &str, update: SignalUpdate) {
        if let Err(e) = check_id("signal", id) {
            warn!(error = %e, "Dropping update for unroutable signal");
            return;
        }
        match self.session() {
            Some(session) => session.push_signal_update(id, update, merge_signal),
            None => debug!(signal = %id, "No active session, dropping signal update"),
        }
    }

    fn open_session(&self) -> Link {
        if let Some(previous) = self.session() {
            previous.dispose();
        }

        let scope: Weak<dyn Scope> = self.this.clone();
        let link = Endpoint::open(scope, &self.config, Role::Session);
        *self.session.write() = Some(link.endpoint.clone());
        self.state.send_replace(ConnectionState::Connected);
        info!(session = %link.endpoint.id(), "Session attached");

        let mods: Vec<Arc<Mod>> = self.mods.iter().map(|m| m.value().clone()).collect();
        for channel in mods.iter().filter(|m| m.is_subscribed()) {
            link.endpoint.push_mod_subscribe(channel.id(), true);
        }

        for signal in self.all_signals() {
            signal.reset();
        }

        link
    }

    fn all_signals(&self) -> Vec<Arc<Signal>> {
        self.signals.iter().map(|s| s.value().clone()).collect()
    }
}

impl Scope for ClientInner {
    fn mod_subscribe(&self, endpoint: &Arc<Endpoint>, channel: &str, _subscribe: bool) {
        debug!(endpoint = %endpoint.id(), channel = %channel, "Ignoring mod subscription sent to a client");
    }

    fn call(&self, _endpoint: &Arc<Endpoint>, call: CallEntry) {
        self.mod_channel(&call.channel)
            .dispatch(&call.event, call.arg.as_deref());
    }

    fn signal(&self, _endpoint: &Arc<Endpoint>, id: &str, update: SignalUpdate) {
        self.signal_channel(id).receive(update);
    }

    fn release(&self, endpoint: &Arc<Endpoint>) {
        let was_active = {
            let mut session = self.session.write();
            if session.as_ref().is_some_and(|s| s.id() == endpoint.id()) {
                *session = None;
                true
            } else {
                false
            }
        };

        if !was_active {
            return;
        }

        self.state.send_replace(ConnectionState::Disconnected);
        info!(session = %endpoint.id(), "Session ended");

        for signal in self.all_signals() {
            signal.off();
        }
    }
}
