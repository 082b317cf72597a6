//! Per-connection batching and inbound dispatch
//!
//! An [`Endpoint`] is one logical connection as seen from a scope. On a broker
//! it is a downstream connection, on a client it is the active session. Every
//! outbound push lands in a pending outbox that is flushed as a single
//! [`Envelope`] once the aggregation window elapses.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::config::ScopeConfig;
use crate::messages::{CallEntry, Envelope, MergeFn, SignalUpdate};
use crate::transport::spawn_stream;

/// Receives what endpoints dispatch and learns when they go away
pub trait Scope: Send + Sync {
    /// The peer asked to (un)subscribe to a mod channel
    fn mod_subscribe(&self, endpoint: &Arc<Endpoint>, channel: &str, subscribe: bool);

    /// The peer made a call
    fn call(&self, endpoint: &Arc<Endpoint>, call: CallEntry);

    /// The peer sent a signal update
    fn signal(&self, endpoint: &Arc<Endpoint>, id: &str, update: SignalUpdate);

    /// The endpoint was disposed; drop every reference the scope keeps to it
    fn release(&self, endpoint: &Arc<Endpoint>);
}

/// Something transports can attach endpoints to
pub trait Attach {
    /// Open a fresh endpoint and hand back its outbound queue
    fn open_link(&self) -> Link;

    /// Attach a duplex byte stream, returning the endpoint serving it
    fn attach<T>(&self, io: T) -> Arc<Endpoint>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
        Self: Sized,
    {
        let link = self.open_link();
        let endpoint = link.endpoint.clone();
        spawn_stream(link, io);
        endpoint
    }
}

/// A freshly opened endpoint plus the receiving half of its outbound queue
pub struct Link {
    pub endpoint: Arc<Endpoint>,
    pub outbound: mpsc::Receiver<Envelope>,
}

/// Which side of a link an endpoint serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// A downstream peer attached to a server or hub
    Connection,
    /// A client's link to its broker
    Session,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Connection => write!(f, "connection"),
            Role::Session => write!(f, "session"),
        }
    }
}

#[derive(Default)]
struct Outbox {
    label: Option<String>,
    mod_subscribe: HashMap<String, bool>,
    calls: Vec<CallEntry>,
    signals: HashMap<String, SignalUpdate>,
    timer: Option<JoinHandle<()>>,
    tx: Option<mpsc::Sender<Envelope>>,
}

impl Outbox {
    fn take_envelope(&mut self) -> Envelope {
        Envelope {
            label: self.label.take(),
            mod_subscribe: mem::take(&mut self.mod_subscribe),
            calls: mem::take(&mut self.calls),
            signals: mem::take(&mut self.signals),
        }
    }
}

pub struct Endpoint {
    id: Uuid,
    role: Role,
    label: RwLock<String>,
    aggregate: Duration,
    max_frame_len: usize,
    disposed: AtomicBool,
    outbox: Mutex<Outbox>,
    scope: Weak<dyn Scope>,
    this: Weak<Endpoint>,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("label", &*self.label.read())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl Endpoint {
    /// Open an endpoint dispatching into `scope`
    pub fn open(scope: Weak<dyn Scope>, config: &ScopeConfig, role: Role) -> Link {
        let (tx, outbound) = mpsc::channel(config.queue_capacity.max(1));
        let id = Uuid::new_v4();
        let short: String = id.simple().to_string().chars().take(6).collect();

        let endpoint = Arc::new_cyclic(|this| Endpoint {
            id,
            role,
            label: RwLock::new(short),
            aggregate: config.aggregate,
            max_frame_len: config.max_frame_len,
            disposed: AtomicBool::new(false),
            outbox: Mutex::new(Outbox {
                label: config.label.clone(),
                tx: Some(tx),
                ..Outbox::default()
            }),
            scope,
            this: this.clone(),
        });

        Link { endpoint, outbound }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// The label the peer announced, or a short form of the id
    pub fn label(&self) -> String {
        self.label.read().clone()
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Queue a call
    pub fn push_call(&self, call: CallEntry) {
        self.with_outbox("call", |outbox| outbox.calls.push(call));
    }

    /// Queue a mod subscribe/unsubscribe request
    pub fn push_mod_subscribe(&self, channel: &str, subscribe: bool) {
        self.with_outbox("mod_subscribe", |outbox| {
            outbox.mod_subscribe.insert(channel.to_string(), subscribe);
        });
    }

    /// Queue a signal update, merging with a pending one where possible
    ///
    /// If `merge` refuses, whatever is pending goes out right away and `update`
    /// starts the next batch.
    pub fn push_signal_update(&self, id: &str, update: SignalUpdate, merge: MergeFn) {
        let mut outbox = self.outbox.lock();
        if outbox.tx.is_none() {
            debug!(endpoint = %self.id, signal = %id, "Dropping signal update on disposed endpoint");
            return;
        }

        match outbox.signals.get(id).map(|pending| merge(pending, &update)) {
            None => {
                outbox.signals.insert(id.to_string(), update);
            }
            Some(Some(merged)) => {
                outbox.signals.insert(id.to_string(), merged);
            }
            Some(None) => {
                self.flush_locked(&mut outbox);
                outbox.signals.insert(id.to_string(), update);
            }
        }

        self.arm(&mut outbox);
    }

    /// Send everything pending now
    pub fn flush(&self) {
        let mut outbox = self.outbox.lock();
        self.flush_locked(&mut outbox);
    }

    /// Hand a received envelope to the scope
    ///
    /// Within one envelope the label is applied first, then mod subscriptions,
    /// then calls, then signal updates.
    pub fn dispatch_received(self: &Arc<Self>, envelope: Envelope) {
        if self.is_disposed() {
            debug!(endpoint = %self.id, "Ignoring envelope on disposed endpoint");
            return;
        }

        let Some(scope) = self.scope.upgrade() else {
            debug!(endpoint = %self.id, "Scope gone, ignoring envelope");
            return;
        };

        trace!(
            endpoint = %self.id,
            calls = envelope.calls.len(),
            signals = envelope.signals.len(),
            "RX envelope"
        );

        if let Some(label) = envelope.label {
            debug!(endpoint = %self.id, label = %label, "Peer label");
            *self.label.write() = label;
        }

        for (channel, subscribe) in envelope.mod_subscribe {
            scope.mod_subscribe(self, &channel, subscribe);
        }

        for call in envelope.calls {
            scope.call(self, call);
        }

        for (id, update) in envelope.signals {
            scope.signal(self, &id, update);
        }
    }

    /// Tear the endpoint down
    ///
    /// Pending output is discarded and the outbound queue closes, which ends the
    /// transport. The scope then releases every subscription and ownership the
    /// endpoint held. Calling this more than once has no further effect.
    pub fn dispose(self: &Arc<Self>) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        {
            let mut outbox = self.outbox.lock();
            if let Some(timer) = outbox.timer.take() {
                timer.abort();
            }
            *outbox = Outbox::default();
        }

        debug!(endpoint = %self.id, role = %self.role, label = %self.label(), "Endpoint disposed");

        if let Some(scope) = self.scope.upgrade() {
            scope.release(self);
        }
    }

    fn with_outbox(&self, what: &'static str, f: impl FnOnce(&mut Outbox)) {
        let mut outbox = self.outbox.lock();
        if outbox.tx.is_none() {
            debug!(endpoint = %self.id, what, "Dropping push on disposed endpoint");
            return;
        }
        f(&mut outbox);
        self.arm(&mut outbox);
    }

    fn arm(&self, outbox: &mut Outbox) {
        if outbox.timer.is_some() {
            return;
        }

        let this = self.this.clone();
        let delay = self.aggregate;
        outbox.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(endpoint) = this.upgrade() {
                endpoint.flush();
            }
        }));
    }

    fn flush_locked(&self, outbox: &mut Outbox) {
        if let Some(timer) = outbox.timer.take() {
            timer.abort();
        }

        let envelope = outbox.take_envelope();
        if envelope.is_empty() {
            return;
        }

        let Some(tx) = outbox.tx.as_ref() else {
            return;
        };

        trace!(
            endpoint = %self.id,
            calls = envelope.calls.len(),
            signals = envelope.signals.len(),
            "TX envelope"
        );

        match tx.try_send(envelope) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(endpoint = %self.id, "Outbound queue full, dropping envelope");
            }
            Err(TrySendError::Closed(_)) => {
                debug!(endpoint = %self.id, "Outbound queue closed, dropping envelope");
            }
        }
    }
}
