//! Hub-side signals
//!
//! A [`HubSignal`] arbitrates ownership among downstream endpoints the same way
//! a broker does, but the value it broadcasts is whatever its uplink signal
//! resolves to. The downstream owner's writes go upstream through
//! `uplink.transmit`, and each downstream subscriber keeps one request open on
//! the uplink.

use parking_lot::Mutex;
use rpcbus_client::{
    codec, merge_signal, Client, Endpoint, Signal, SignalRequest, SignalUpdate, SignalValue,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace, warn};
use uuid::Uuid;

struct Subscriber {
    endpoint: Arc<Endpoint>,
    _request: SignalRequest,
}

#[derive(Default)]
struct HubSignalState {
    owner: Option<Uuid>,
    value: Option<Vec<u8>>,
    seen_version: u64,
    subscribers: HashMap<Uuid, Subscriber>,
}

enum Uplink {
    Transmit(Value),
    Stop,
}

pub struct HubSignal {
    id: String,
    uplink: Arc<Signal>,
    state: Mutex<HubSignalState>,
}

impl HubSignal {
    pub(crate) fn new(client: &Client, id: &str) -> Arc<Self> {
        let uplink = client.signal(id);
        let signal = Arc::new(Self {
            id: id.to_string(),
            uplink: uplink.clone(),
            state: Mutex::new(HubSignalState::default()),
        });

        let weak = Arc::downgrade(&signal);
        uplink.on_change(move |version, value| {
            if let Some(signal) = weak.upgrade() {
                signal.relay_down(version, value);
            }
        });

        let (version, value) = uplink.snapshot();
        signal.relay_down(version, &value);
        signal
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The encoded value currently broadcast downstream
    pub fn value(&self) -> Option<Vec<u8>> {
        self.state.lock().value.clone()
    }

    pub fn owner(&self) -> Option<Uuid> {
        self.state.lock().owner
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    /// Apply an update sent by downstream endpoint `src`
    pub fn receive(&self, update: SignalUpdate, src: &Arc<Endpoint>) {
        let mut claimed = false;
        let action = {
            let mut state = self.state.lock();
            if src.is_disposed() {
                trace!(signal = %self.id, endpoint = %src.id(), "Ignoring update from disposed endpoint");
                return;
            }

            match update.subscribe {
                Some(true) => {
                    if !state.subscribers.contains_key(&src.id()) {
                        let request = self.uplink.request();
                        state.subscribers.insert(
                            src.id(),
                            Subscriber {
                                endpoint: src.clone(),
                                _request: request,
                            },
                        );
                    }
                    src.push_signal_update(
                        &self.id,
                        SignalUpdate::current(state.value.as_deref()),
                        merge_signal,
                    );
                }
                Some(false) => {
                    state.subscribers.remove(&src.id());
                }
                None => {}
            }

            if state.owner == Some(src.id()) {
                if update.drop {
                    Some(Uplink::Stop)
                } else {
                    update.value.as_deref().and_then(|bytes| self.decode(bytes, src))
                }
            } else if state.owner.is_none() && !update.drop {
                let action = update
                    .value
                    .as_deref()
                    .filter(|bytes| !bytes.is_empty())
                    .and_then(|bytes| self.decode(bytes, src));
                if action.is_some() {
                    debug!(signal = %self.id, endpoint = %src.id(), "Hub signal owner set");
                    state.owner = Some(src.id());
                    claimed = true;
                }
                action
            } else {
                if update.value.is_some() || update.drop {
                    trace!(signal = %self.id, endpoint = %src.id(), "Ignoring write from non-owner");
                }
                None
            }
        };

        match action {
            Some(Uplink::Transmit(value)) => self.uplink.transmit(Some(value)),
            Some(Uplink::Stop) => self.uplink.transmit(None),
            None => {}
        }

        if claimed {
            src.push_signal_update(&self.id, SignalUpdate::holding(true), merge_signal);
        }
    }

    /// Forget `endpoint`; if it owned the signal, stop transmitting upstream
    ///
    /// Downstream subscribers then see whatever the uplink resolves to without
    /// the hub's value, which is a drop only if nothing else is known upstream.
    pub fn release(&self, endpoint: &Endpoint) {
        let was_owner = {
            let mut state = self.state.lock();
            state.subscribers.remove(&endpoint.id());

            if state.owner == Some(endpoint.id()) {
                debug!(signal = %self.id, endpoint = %endpoint.id(), "Hub signal owner released");
                state.owner = None;
                true
            } else {
                false
            }
        };

        if was_owner {
            self.uplink.transmit(None);
            self.resync();
        }
    }

    fn resync(&self) {
        let (version, value) = self.uplink.snapshot();
        let bytes = self.encode(&value);

        let mut state = self.state.lock();
        if version < state.seen_version {
            return;
        }
        state.seen_version = version;
        self.update(&mut state, bytes);
    }

    fn decode(&self, bytes: &[u8], src: &Endpoint) -> Option<Uplink> {
        match codec::decode(bytes) {
            Ok(value) => Some(Uplink::Transmit(value)),
            Err(e) => {
                warn!(signal = %self.id, endpoint = %src.id(), error = %e, "Dropping undecodable signal value");
                None
            }
        }
    }

    fn encode(&self, value: &SignalValue) -> Option<Vec<u8>> {
        let value = value.as_value()?;
        match codec::encode(value) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!(signal = %self.id, error = %e, "Failed to encode uplink value");
                None
            }
        }
    }

    fn relay_down(&self, version: u64, value: &SignalValue) {
        let bytes = self.encode(value);

        let mut state = self.state.lock();
        if version <= state.seen_version {
            return;
        }
        state.seen_version = version;
        self.update(&mut state, bytes);
    }

    fn update(&self, state: &mut HubSignalState, value: Option<Vec<u8>>) {
        if state.value == value {
            return;
        }
        state.value = value;

        let update = SignalUpdate::current(state.value.as_deref());
        for subscriber in state.subscribers.values() {
            subscriber
                .endpoint
                .push_signal_update(&self.id, update.clone(), merge_signal);
        }
    }
}
