//! rpcbus client
//!
//! Peers exchange batched envelopes of fire-and-forget calls on named mod
//! channels and updates of named signals whose value is owned by one writer at
//! a time. This crate holds everything a peer needs: the wire format, the
//! per-connection [`Endpoint`], the [`Client`] and its transports.
//!
//! # Example
//!
//! ```no_run
//! use rpcbus_client::{Client, ScopeConfig, WebsocketClient, WebsocketConfig};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::new(ScopeConfig::new());
//!     let uplink = WebsocketClient::connect(client.clone(), WebsocketConfig::new("ws://localhost:8080/ws"));
//!
//!     // Handle calls on a channel
//!     let sub = client.subscribe("chat", |event, arg| {
//!         println!("{}: {:?}", event, arg);
//!     });
//!
//!     // Call every subscriber of the channel
//!     client.call("chat", "say", Some(&json!({"text": "hi"})))?;
//!
//!     // Follow a signal and offer a value for it
//!     let cursor = client.signal("cursor");
//!     let _interest = cursor.request();
//!     cursor.transmit(Some(json!({"x": 1, "y": 2})));
//!
//!     sub.unsubscribe();
//!     uplink.shutdown().await;
//!     Ok(())
//! }
//! ```

mod client;
pub mod codec;
mod config;
mod endpoint;
mod error;
mod messages;
mod mods;
mod signal;
mod transport;
pub mod validate;
mod websocket;

pub use client::{Client, ConnectionState};
pub use config::{ScopeConfig, WebsocketConfig};
pub use endpoint::{Attach, Endpoint, Link, Role, Scope};
pub use error::{BusError, Result};
pub use messages::{merge_signal, CallEntry, Envelope, MergeFn, SignalUpdate};
pub use mods::{Mod, RawCallHandler, Subscription};
pub use signal::{Signal, SignalObserver, SignalRequest, SignalValue};
pub use transport::{attach_direct, spawn_stream};
pub use websocket::WebsocketClient;
