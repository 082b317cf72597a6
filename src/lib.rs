//! rpcbus - batched RPC calls and owned signals over any byte stream
//!
//! A [`Server`] brokers fire-and-forget calls on named mod channels and named
//! signals whose value has a single owner at a time. A [`Hub`] relays a set of
//! downstream connections through one upstream client. Peers talk to either
//! through a [`Client`] from the `rpcbus-client` crate, re-exported here.

pub mod hub;
pub mod server;

pub use hub::{Hub, HubMod, HubSignal};
pub use rpcbus_client as client;
pub use rpcbus_client::{
    attach_direct, Attach, BusError, Client, Endpoint, ScopeConfig, Signal, SignalValue,
    Subscription, WebsocketClient, WebsocketConfig,
};
pub use server::{ConnectionManager, ModChannel, Server, SignalChannel, WsState};
