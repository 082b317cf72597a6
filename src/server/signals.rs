//! Broker-side signals with single-owner write arbitration
//!
//! The first endpoint to send a value for an unowned signal becomes its owner
//! and is told so with `hold`. Writes from anyone else are ignored until the
//! owner disconnects, at which point the value is dropped for everyone.

use parking_lot::Mutex;
use rpcbus_client::{merge_signal, Endpoint, SignalUpdate};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};
use uuid::Uuid;

#[derive(Default)]
struct SignalState {
    value: Option<Vec<u8>>,
    owner: Option<Uuid>,
    subscribers: HashMap<Uuid, Arc<Endpoint>>,
}

pub struct SignalChannel {
    id: String,
    state: Mutex<SignalState>,
}

impl SignalChannel {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            state: Mutex::new(SignalState::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The current encoded value
    pub fn value(&self) -> Option<Vec<u8>> {
        self.state.lock().value.clone()
    }

    pub fn owner(&self) -> Option<Uuid> {
        self.state.lock().owner
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    /// Apply an update sent by `src`
    pub fn receive(&self, update: SignalUpdate, src: &Arc<Endpoint>) {
        let mut state = self.state.lock();
        if src.is_disposed() {
            trace!(signal = %self.id, endpoint = %src.id(), "Ignoring update from disposed endpoint");
            return;
        }

        match update.subscribe {
            Some(true) => {
                state.subscribers.insert(src.id(), src.clone());
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
                self.update(&mut state, None);
            } else if let Some(value) = update.value {
                self.update(&mut state, Some(value));
            }
        } else if state.owner.is_none() && !update.drop {
            if let Some(value) = update.value {
                debug!(signal = %self.id, endpoint = %src.id(), "Signal owner set");
                state.owner = Some(src.id());
                self.update(&mut state, Some(value));
                src.push_signal_update(&self.id, SignalUpdate::holding(true), merge_signal);
            }
        } else if update.value.is_some() || update.drop {
            trace!(signal = %self.id, endpoint = %src.id(), "Ignoring write from non-owner");
        }
    }

    /// Forget `endpoint`; if it owned the signal the value is dropped
    pub fn release(&self, endpoint: &Endpoint) {
        let mut state = self.state.lock();
        state.subscribers.remove(&endpoint.id());

        if state.owner == Some(endpoint.id()) {
            debug!(signal = %self.id, endpoint = %endpoint.id(), "Signal owner released");
            state.owner = None;
            self.update(&mut state, None);
        }
    }

    fn update(&self, state: &mut SignalState, value: Option<Vec<u8>>) {
        if state.value == value {
            return;
        }
        state.value = value;

        let update = SignalUpdate::current(state.value.as_deref());
        for subscriber in state.subscribers.values() {
            subscriber.push_signal_update(&self.id, update.clone(), merge_signal);
        }
    }
}
