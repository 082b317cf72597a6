//! Hub-side mod channels
//!
//! A [`HubMod`] subscribes once to the upstream channel of the same id and
//! fans every upstream call out to its downstream subscribers.

use rpcbus_client::{Client, Endpoint, Subscription};
use std::sync::{Arc, Weak};

use crate::server::ModChannel;

pub struct HubMod {
    channel: ModChannel,
    _upstream: Subscription,
}

impl HubMod {
    pub(crate) fn new(client: &Client, id: &str) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<HubMod>| {
            let this = this.clone();
            let upstream = client.subscribe_raw(id, move |event, arg| {
                if let Some(hub_mod) = this.upgrade() {
                    hub_mod.channel.dispatch(event, arg.map(<[u8]>::to_vec));
                }
            });

            Self {
                channel: ModChannel::new(id),
                _upstream: upstream,
            }
        })
    }

    pub fn id(&self) -> &str {
        self.channel.id()
    }

    pub fn subscribe(&self, endpoint: &Arc<Endpoint>) {
        self.channel.subscribe(endpoint);
    }

    pub fn unsubscribe(&self, endpoint: &Endpoint) {
        self.channel.unsubscribe(endpoint);
    }

    pub fn subscriber_count(&self) -> usize {
        self.channel.subscriber_count()
    }
}
