//! Session tests for rpcbus-client
//!
//! A scripted broker reads and writes raw frames on the other end of a duplex
//! pipe, so these tests pin down exactly what the client puts on the wire.

use rpcbus_client::codec::{encode_frame, FrameDecoder};
use rpcbus_client::{
    Attach, CallEntry, Client, ConnectionState, Envelope, ScopeConfig, SignalUpdate, SignalValue,
};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

struct Broker {
    io: DuplexStream,
    decoder: FrameDecoder,
    pending: Vec<Envelope>,
}

impl Broker {
    fn attach(client: &Client) -> Self {
        let (client_side, io) = tokio::io::duplex(64 * 1024);
        client.attach(client_side);
        Self {
            io,
            decoder: FrameDecoder::new(1 << 20),
            pending: Vec::new(),
        }
    }

    async fn recv(&mut self) -> Envelope {
        let mut buf = [0u8; 4096];
        while self.pending.is_empty() {
            let n = timeout(WAIT, self.io.read(&mut buf))
                .await
                .expect("timed out waiting for a frame")
                .unwrap();
            assert!(n > 0, "client closed the stream");
            self.pending = self.decoder.decode(&buf[..n]).unwrap();
        }
        self.pending.remove(0)
    }

    async fn send(&mut self, envelope: &Envelope) {
        self.io.write_all(&encode_frame(envelope).unwrap()).await.unwrap();
    }

    async fn send_signal(&mut self, id: &str, update: SignalUpdate) {
        let mut envelope = Envelope::default();
        envelope.signals.insert(id.to_string(), update);
        self.send(&envelope).await;
    }
}

async fn eventually<F>(what: &str, condition: F)
where
    F: Fn() -> bool,
{
    let result = timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {}", what);
}

#[tokio::test]
async fn test_first_envelope_batches_everything() {
    let client = Client::new(ScopeConfig::new().label("scripted").aggregate(Duration::from_millis(20)));
    let mut broker = Broker::attach(&client);
    assert_eq!(client.connection_state(), ConnectionState::Connected);

    let _subscription = client.subscribe("news", |_, _| {});
    client.call("jobs", "run", Some(&json!(1))).unwrap();
    client.call("jobs", "stop", None).unwrap();
    client.signal("mode").transmit(Some(json!("auto")));

    let envelope = broker.recv().await;
    assert_eq!(envelope.label.as_deref(), Some("scripted"));
    assert_eq!(envelope.mod_subscribe.get("news"), Some(&true));
    assert_eq!(
        envelope.calls,
        vec![
            CallEntry::new("jobs", "run", Some(b"1".to_vec())),
            CallEntry::new("jobs", "stop", None),
        ]
    );
    assert_eq!(
        envelope.signals.get("mode"),
        Some(&SignalUpdate::with_value(b"\"auto\"".to_vec()))
    );
}

#[tokio::test]
async fn test_incoming_call_and_signal() {
    let client = Client::new(ScopeConfig::new());
    let mut broker = Broker::attach(&client);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let _subscription = client.subscribe("news", move |event, arg| {
        sink.lock().unwrap().push((event.to_string(), arg));
    });
    let temp = client.signal("temp");
    let _request = temp.request();

    let sent = broker.recv().await;
    assert_eq!(sent.signals.get("temp"), Some(&SignalUpdate::subscription(true)));

    let mut envelope = Envelope::default();
    envelope
        .calls
        .push(CallEntry::new("news", "flash", Some(b"{\"x\":5}".to_vec())));
    envelope
        .signals
        .insert("temp".to_string(), SignalUpdate::with_value(b"21".to_vec()));
    broker.send(&envelope).await;

    eventually("value", || temp.value() == SignalValue::Valid(json!(21))).await;
    assert_eq!(
        *seen.lock().unwrap(),
        vec![("flash".to_string(), Some(json!({"x": 5})))]
    );

    broker.send_signal("temp", SignalUpdate::dropped()).await;
    eventually("invalid", || temp.value() == SignalValue::Invalid).await;
}

#[tokio::test]
async fn test_hold_decides_visible_value() {
    let client = Client::new(ScopeConfig::new());
    let mut broker = Broker::attach(&client);

    let mode = client.signal("mode");
    let _request = mode.request();
    mode.transmit(Some(json!("mine")));
    broker.recv().await;

    // Someone else owns the signal
    broker
        .send_signal("mode", SignalUpdate::with_value(b"\"theirs\"".to_vec()))
        .await;
    eventually("theirs", || mode.value() == SignalValue::Valid(json!("theirs"))).await;

    broker.send_signal("mode", SignalUpdate::holding(true)).await;
    eventually("mine", || mode.value() == SignalValue::Valid(json!("mine"))).await;
    assert!(mode.is_holding());
}

#[tokio::test]
async fn test_new_session_replays_state() {
    let client = Client::new(ScopeConfig::new());
    let mut first = Broker::attach(&client);

    let _subscription = client.subscribe("news", |_, _| {});
    let status = client.signal("status");
    let _request = status.request();
    status.transmit(Some(json!("up")));
    first.recv().await;
    first.send_signal("status", SignalUpdate::holding(true)).await;
    eventually("holding", || status.is_holding()).await;

    drop(first);
    eventually("disconnected", || {
        client.connection_state() == ConnectionState::Disconnected
    })
    .await;
    assert!(!status.is_holding());
    assert_eq!(status.value(), SignalValue::Invalid);

    let mut second = Broker::attach(&client);
    let replay = second.recv().await;
    assert_eq!(replay.mod_subscribe.get("news"), Some(&true));
    assert_eq!(
        replay.signals.get("status"),
        Some(&SignalUpdate {
            value: Some(b"\"up\"".to_vec()),
            drop: false,
            subscribe: Some(true),
            hold: None,
        })
    );
}
