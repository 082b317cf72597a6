//! Integration tests for the rpcbus broker
//!
//! Every client talks to the broker over an in-memory duplex pipe, so the
//! full framing and batching path is exercised.

use rpcbus::client::ConnectionState;
use rpcbus::{Attach, Client, ScopeConfig, Server, SignalValue};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn connect(server: &Server, config: ScopeConfig) -> Client {
    let client = Client::new(config);
    let (broker_side, client_side) = tokio::io::duplex(64 * 1024);
    server.attach(broker_side);
    client.attach(client_side);
    client
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
async fn test_call_reaches_subscriber_exactly_once() {
    let server = Server::new(ScopeConfig::new());
    let a = connect(&server, ScopeConfig::new());
    let b = connect(&server, ScopeConfig::new());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _subscription = a.subscribe("foo", move |event, arg| {
        let _ = tx.send((event.to_string(), arg));
    });
    eventually("subscription", || server.mod_channel("foo").subscriber_count() == 1).await;

    b.call("foo", "bar", Some(&json!({"x": 5}))).unwrap();

    let (event, arg) = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(event, "bar");
    assert_eq!(arg, Some(json!({"x": 5})));

    // No duplicate delivery
    assert!(timeout(Duration::from_millis(50), rx.recv()).await.is_err());
}

#[tokio::test]
async fn test_calls_keep_their_order() {
    let server = Server::new(ScopeConfig::new());
    let a = connect(&server, ScopeConfig::new());
    let b = connect(&server, ScopeConfig::new());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _subscription = a.subscribe("seq", move |_, arg| {
        let _ = tx.send(arg);
    });
    eventually("subscription", || server.mod_channel("seq").subscriber_count() == 1).await;

    for i in 0..50 {
        b.call("seq", "n", Some(&json!(i))).unwrap();
    }

    for i in 0..50 {
        let arg = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(arg, Some(json!(i)));
    }
}

#[tokio::test]
async fn test_long_event_name_does_not_drop_batch() {
    let server = Server::new(ScopeConfig::new());
    let a = connect(&server, ScopeConfig::new());
    let b = connect(&server, ScopeConfig::new());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _subscription = a.subscribe("foo", move |event, _| {
        let _ = tx.send(event.to_string());
    });
    eventually("subscription", || server.mod_channel("foo").subscriber_count() == 1).await;

    let long = "e".repeat(300);
    b.call("foo", "ok-1", None).unwrap();
    b.call("foo", &long, None).unwrap();
    b.call("foo", "ok-2", None).unwrap();

    for expected in ["ok-1", long.as_str(), "ok-2"] {
        let event = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(event, expected);
    }
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let server = Server::new(ScopeConfig::new());
    let a = connect(&server, ScopeConfig::new());
    let b = connect(&server, ScopeConfig::new());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscription = a.subscribe("foo", move |event, _| {
        let _ = tx.send(event.to_string());
    });
    eventually("subscription", || server.mod_channel("foo").subscriber_count() == 1).await;

    subscription.unsubscribe();
    eventually("unsubscription", || server.mod_channel("foo").subscriber_count() == 0).await;

    b.call("foo", "bar", None).unwrap();
    assert!(timeout(Duration::from_millis(50), rx.recv()).await.is_err());
}

#[tokio::test]
async fn test_signal_follows_owner() {
    let server = Server::new(ScopeConfig::new());
    let a = connect(&server, ScopeConfig::new());
    let b = connect(&server, ScopeConfig::new());

    let watched = a.signal("s");
    let _request = watched.request();
    assert_eq!(watched.value(), SignalValue::Invalid);

    b.signal("s").transmit(Some(json!(5)));
    eventually("value 5", || watched.value() == SignalValue::Valid(json!(5))).await;

    b.signal("s").transmit(None);
    eventually("invalid value", || watched.value() == SignalValue::Invalid).await;
}

#[tokio::test]
async fn test_second_transmitter_is_ignored() {
    let server = Server::new(ScopeConfig::new());
    let a = connect(&server, ScopeConfig::new());
    let b = connect(&server, ScopeConfig::new());

    let a_signal = a.signal("mode");
    let b_signal = b.signal("mode");
    let _request = b_signal.request();

    a_signal.transmit(Some(json!("a")));
    eventually("a holds", || a_signal.is_holding()).await;
    assert_eq!(a_signal.value(), SignalValue::Valid(json!("a")));

    b_signal.transmit(Some(json!("b")));
    eventually("b sees a", || b_signal.value() == SignalValue::Valid(json!("a"))).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!b_signal.is_holding());
    assert_eq!(server.signal_channel("mode").value(), Some(b"\"a\"".to_vec()));

    // Dropping the value keeps ownership; b is still ignored
    a_signal.transmit(None);
    eventually("value dropped", || b_signal.value() == SignalValue::Invalid).await;
    b_signal.transmit(Some(json!("b")));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!b_signal.is_holding());
    assert_eq!(server.signal_channel("mode").value(), None);

    // Once a disconnects, b's next write is accepted
    a.disconnect();
    eventually("owner released", || server.signal_channel("mode").owner().is_none()).await;
    b_signal.transmit(Some(json!("b")));
    eventually("b holds", || b_signal.is_holding()).await;
    assert_eq!(b_signal.value(), SignalValue::Valid(json!("b")));
}

#[tokio::test]
async fn test_owner_disconnect_drops_value() {
    let server = Server::new(ScopeConfig::new());
    let a = connect(&server, ScopeConfig::new());
    let b = connect(&server, ScopeConfig::new());

    let watched = b.signal("s");
    let _request = watched.request();

    a.signal("s").transmit(Some(json!(1)));
    eventually("value 1", || watched.value() == SignalValue::Valid(json!(1))).await;

    a.disconnect();
    eventually("invalid value", || watched.value() == SignalValue::Invalid).await;
    assert!(server.signal_channel("s").owner().is_none());
}

#[tokio::test]
async fn test_built_in_client() {
    let server = Server::new(ScopeConfig::new());
    let remote = connect(&server, ScopeConfig::new());

    let (tx, mut rx) = mpsc::unbounded_channel::<Option<Value>>();
    let _subscription = server.client().subscribe("jobs", move |_, arg| {
        let _ = tx.send(arg);
    });
    eventually("subscription", || server.mod_channel("jobs").subscriber_count() == 1).await;

    remote.call("jobs", "run", Some(&json!("now"))).unwrap();
    let arg = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(arg, Some(json!("now")));

    server.client().signal("uptime").transmit(Some(json!(7)));
    let uptime = remote.signal("uptime");
    let _request = uptime.request();
    eventually("uptime", || uptime.value() == SignalValue::Valid(json!(7))).await;
}

#[tokio::test]
async fn test_label_and_connection_count() {
    let server = Server::new(ScopeConfig::new());
    assert_eq!(server.connection_count(), 1);

    let worker = connect(&server, ScopeConfig::new().label("worker-1"));
    assert_eq!(worker.connection_state(), ConnectionState::Connected);
    assert_eq!(server.connection_count(), 2);

    // The label travels with the first flush
    worker.call("noop", "ping", None).unwrap();
    eventually("label", || {
        server.connections().find_by_label("worker-1").len() == 1
    })
    .await;

    worker.disconnect();
    eventually("release", || server.connection_count() == 1).await;
    assert_eq!(worker.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_shutdown_releases_ownership() {
    let server = Server::new(ScopeConfig::new());
    let a = connect(&server, ScopeConfig::new());

    let signal = a.signal("s");
    signal.transmit(Some(json!(1)));
    eventually("a holds", || signal.is_holding()).await;
    let owner = server.signal_channel("s").owner().unwrap();
    assert!(server.connections().get(owner).is_some());

    server.shutdown();
    assert!(server.signal_channel("s").owner().is_none());
    assert_eq!(server.signal_channel("s").value(), None);
    assert_eq!(server.connection_count(), 0);
    eventually("client disconnected", || {
        a.connection_state() == ConnectionState::Disconnected
    })
    .await;
}
