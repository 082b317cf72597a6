//! Client-side signals
//!
//! A [`Signal`] mirrors a broker-held value. The client may transmit its own
//! value, and the broker tells it (via `hold`) whether it is the owner whose
//! writes count. The visible value is recomputed after every change and
//! published through a `watch` channel and to versioned observers.

use parking_lot::{Mutex, MutexGuard, RwLock};
use serde_json::Value;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::client::ClientInner;
use crate::codec;
use crate::messages::SignalUpdate;

/// The resolved value of a signal
#[derive(Debug, Clone, PartialEq, Default)]
pub enum SignalValue {
    /// No value is known
    #[default]
    Invalid,
    Valid(Value),
}

impl SignalValue {
    pub fn is_valid(&self) -> bool {
        matches!(self, SignalValue::Valid(_))
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            SignalValue::Valid(value) => Some(value),
            SignalValue::Invalid => None,
        }
    }

    pub fn into_value(self) -> Option<Value> {
        match self {
            SignalValue::Valid(value) => Some(value),
            SignalValue::Invalid => None,
        }
    }
}

/// Observer called with `(version, value)` after every change
pub type SignalObserver = Arc<dyn Fn(u64, &SignalValue) + Send + Sync>;

#[derive(Default)]
struct SignalState {
    remote: Option<Value>,
    holding_remote: bool,
    transmitter: Option<Value>,
    had_signal: bool,
    requests: usize,
    version: u64,
}

impl SignalState {
    fn resolve(&self) -> SignalValue {
        match (&self.transmitter, &self.remote) {
            (Some(local), _) if self.holding_remote => SignalValue::Valid(local.clone()),
            (_, Some(remote)) => SignalValue::Valid(remote.clone()),
            _ => SignalValue::Invalid,
        }
    }
}

pub struct Signal {
    id: String,
    client: Weak<ClientInner>,
    aggregate: Duration,
    state: Mutex<SignalState>,
    current: watch::Sender<SignalValue>,
    observers: RwLock<Vec<(Uuid, SignalObserver)>>,
}

impl Signal {
    pub(crate) fn new(id: &str, client: Weak<ClientInner>, aggregate: Duration) -> Self {
        let (current, _) = watch::channel(SignalValue::Invalid);
        Self {
            id: id.to_string(),
            client,
            aggregate,
            state: Mutex::new(SignalState::default()),
            current,
            observers: RwLock::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The current resolved value
    pub fn value(&self) -> SignalValue {
        self.current.borrow().clone()
    }

    /// The current resolved value with the version it was published under
    pub fn snapshot(&self) -> (u64, SignalValue) {
        let state = self.state.lock();
        (state.version, state.resolve())
    }

    /// Subscribe to value changes
    pub fn watch(&self) -> watch::Receiver<SignalValue> {
        self.current.subscribe()
    }

    /// Register an observer called synchronously after every change
    ///
    /// Observers run outside the signal's lock, so two concurrent changes may
    /// reach an observer out of order; the version tells them apart.
    pub fn on_change<F>(&self, observer: F) -> Uuid
    where
        F: Fn(u64, &SignalValue) + Send + Sync + 'static,
    {
        let id = Uuid::new_v4();
        self.observers.write().push((id, Arc::new(observer)));
        id
    }

    pub fn remove_observer(&self, id: Uuid) {
        self.observers.write().retain(|(observer, _)| *observer != id);
    }

    /// Attach (`Some`) or detach (`None`) the local value
    ///
    /// The broker only accepts the value if no other endpoint owns the signal.
    pub fn transmit(&self, value: Option<Value>) {
        let mut state = self.state.lock();
        match value {
            Some(value) => {
                match codec::encode(&value) {
                    Ok(bytes) => {
                        state.had_signal = true;
                        self.send(SignalUpdate::with_value(bytes));
                    }
                    Err(e) => {
                        warn!(signal = %self.id, error = %e, "Failed to encode signal value");
                        return;
                    }
                }
                state.transmitter = Some(value);
            }
            None => {
                if state.had_signal {
                    self.send(SignalUpdate::dropped());
                }
                state.transmitter = None;
            }
        }
        self.commit(state);
    }

    /// Whether a local value is attached
    pub fn is_transmitting(&self) -> bool {
        self.state.lock().transmitter.is_some()
    }

    /// Whether the broker confirmed this client as owner
    pub fn is_holding(&self) -> bool {
        self.state.lock().holding_remote
    }

    /// Number of outstanding requests
    pub fn requests(&self) -> usize {
        self.state.lock().requests
    }

    /// Ask the broker for updates until the returned guard is released
    pub fn request(self: &Arc<Self>) -> SignalRequest {
        let mut state = self.state.lock();
        state.requests += 1;
        if state.requests == 1 {
            self.send(SignalUpdate::subscription(true));
        }
        drop(state);

        SignalRequest {
            signal: Some(self.clone()),
        }
    }

    /// Apply an update received from the broker
    pub(crate) fn receive(&self, update: SignalUpdate) {
        let mut state = self.state.lock();

        if update.drop {
            state.remote = None;
        } else if let Some(bytes) = &update.value {
            state.remote = match codec::decode(bytes) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!(signal = %self.id, error = %e, "Failed to decode signal value");
                    None
                }
            };
        }

        if let Some(hold) = update.hold {
            state.holding_remote = hold;
        }

        self.commit(state);
    }

    /// Replay local state onto a new session
    pub(crate) fn reset(&self) {
        let mut state = self.state.lock();
        state.had_signal = false;

        if let Some(value) = &state.transmitter {
            match codec::encode(value) {
                Ok(bytes) => {
                    self.send(SignalUpdate::with_value(bytes));
                    state.had_signal = true;
                }
                Err(e) => warn!(signal = %self.id, error = %e, "Failed to encode signal value"),
            }
        }

        if state.requests > 0 {
            self.send(SignalUpdate::subscription(true));
        }
    }

    /// Forget everything learned from a session that ended
    pub(crate) fn off(&self) {
        let mut state = self.state.lock();
        state.remote = None;
        state.holding_remote = false;
        state.had_signal = false;
        self.commit(state);
    }

    fn release_one(&self) {
        let mut state = self.state.lock();
        state.requests = state.requests.saturating_sub(1);
        if state.requests == 0 {
            debug!(signal = %self.id, "Last request released");
            self.send(SignalUpdate::subscription(false));
        }
    }

    fn send(&self, update: SignalUpdate) {
        if let Some(client) = self.client.upgrade() {
            client.push_signal(&self.id, update);
        }
    }

    fn commit(&self, mut state: MutexGuard<'_, SignalState>) {
        let next = state.resolve();
        let changed = self.current.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next.clone();
                true
            }
        });
        if !changed {
            return;
        }

        state.version += 1;
        let version = state.version;
        drop(state);

        let observers: Vec<SignalObserver> =
            self.observers.read().iter().map(|(_, o)| o.clone()).collect();
        for observer in observers {
            observer(version, &next);
        }
    }
}

/// Outstanding interest in a signal
///
/// Releasing (explicitly or by dropping) decrements the request count after
/// the aggregation window, so a release immediately followed by a new request
/// never unsubscribes at the broker.
pub struct SignalRequest {
    signal: Option<Arc<Signal>>,
}

impl SignalRequest {
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        let Some(signal) = self.signal.take() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let delay = signal.aggregate;
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    signal.release_one();
                });
            }
            Err(_) => signal.release_one(),
        }
    }
}

impl Drop for SignalRequest {
    fn drop(&mut self) {
        self.release_inner();
    }
}
