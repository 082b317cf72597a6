//! Message types for the rpcbus protocol
//!
//! Every flush of an endpoint produces exactly one [`Envelope`]. Keys are single
//! characters on the wire and empty collections are never serialized, so an idle
//! field costs nothing. Argument and value bytes travel as standard base64.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(bytes) => serializer.serialize_str(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        encoded
            .map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// One batched message exchanged between two endpoints
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Human-readable identifier of the sending endpoint
    #[serde(rename = "l", default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    /// Mod channel subscribe (true) / unsubscribe (false) requests
    #[serde(rename = "m", default, skip_serializing_if = "HashMap::is_empty")]
    pub mod_subscribe: HashMap<String, bool>,

    /// Calls in the order they were made
    #[serde(rename = "c", default, skip_serializing_if = "Vec::is_empty")]
    pub calls: Vec<CallEntry>,

    /// At most one (merged) update per signal id
    #[serde(rename = "s", default, skip_serializing_if = "HashMap::is_empty")]
    pub signals: HashMap<String, SignalUpdate>,
}

impl Envelope {
    /// True when the envelope carries nothing worth sending
    pub fn is_empty(&self) -> bool {
        self.label.is_none()
            && self.mod_subscribe.is_empty()
            && self.calls.is_empty()
            && self.signals.is_empty()
    }
}

/// A fire-and-forget call on a mod channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallEntry {
    #[serde(rename = "m")]
    pub channel: String,

    #[serde(rename = "s")]
    pub event: String,

    /// Encoded argument, passed through untouched by relays
    #[serde(
        rename = "a",
        default,
        skip_serializing_if = "Option::is_none",
        with = "base64_bytes"
    )]
    pub arg: Option<Vec<u8>>,
}

impl CallEntry {
    pub fn new(channel: impl Into<String>, event: impl Into<String>, arg: Option<Vec<u8>>) -> Self {
        Self {
            channel: channel.into(),
            event: event.into(),
            arg,
        }
    }
}

/// A partial update of one signal
///
/// Every field is optional: an update only says what changed. `drop` takes
/// precedence over `value` when both are present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalUpdate {
    #[serde(
        rename = "v",
        default,
        skip_serializing_if = "Option::is_none",
        with = "base64_bytes"
    )]
    pub value: Option<Vec<u8>>,

    #[serde(rename = "d", default, skip_serializing_if = "is_false")]
    pub drop: bool,

    #[serde(rename = "s", default, skip_serializing_if = "Option::is_none")]
    pub subscribe: Option<bool>,

    #[serde(rename = "h", default, skip_serializing_if = "Option::is_none")]
    pub hold: Option<bool>,
}

impl SignalUpdate {
    /// An update carrying a new encoded value
    pub fn with_value(value: Vec<u8>) -> Self {
        Self {
            value: Some(value),
            ..Self::default()
        }
    }

    /// An update clearing the value
    pub fn dropped() -> Self {
        Self {
            drop: true,
            ..Self::default()
        }
    }

    /// A subscribe (true) or unsubscribe (false) request
    pub fn subscription(subscribe: bool) -> Self {
        Self {
            subscribe: Some(subscribe),
            ..Self::default()
        }
    }

    /// A hold notification sent by the broker to the signal owner
    pub fn holding(hold: bool) -> Self {
        Self {
            hold: Some(hold),
            ..Self::default()
        }
    }

    /// Convenience for the value a broker currently holds
    pub fn current(value: Option<&[u8]>) -> Self {
        match value {
            Some(bytes) => Self::with_value(bytes.to_vec()),
            None => Self::dropped(),
        }
    }

    /// The value change this update specifies
    ///
    /// `None` when the update says nothing about the value, `Some(None)` for a
    /// drop and `Some(Some(bytes))` for a new value.
    pub fn effective(&self) -> Option<Option<&[u8]>> {
        if self.drop {
            Some(None)
        } else {
            self.value.as_deref().map(Some)
        }
    }
}

/// Signature of the merge used when an update is already pending
pub type MergeFn = fn(&SignalUpdate, &SignalUpdate) -> Option<SignalUpdate>;

/// Merge a pending update `a` with a newer update `b`
///
/// Returns `None` when the two cannot share one envelope, which only happens
/// when both carry a different `hold`. Otherwise the later value change wins,
/// the later subscribe request wins and a single defined hold is kept.
pub fn merge_signal(a: &SignalUpdate, b: &SignalUpdate) -> Option<SignalUpdate> {
    let hold = match (a.hold, b.hold) {
        (x, y) if x == y => x,
        (None, y) => y,
        (x, None) => x,
        _ => return None,
    };

    let (value, drop) = match b.effective().or_else(|| a.effective()) {
        Some(Some(bytes)) => (Some(bytes.to_vec()), false),
        Some(None) => (None, true),
        None => (None, false),
    };

    Some(SignalUpdate {
        value,
        drop,
        subscribe: b.subscribe.or(a.subscribe),
        hold,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hold(h: Option<bool>) -> SignalUpdate {
        SignalUpdate {
            hold: h,
            ..SignalUpdate::default()
        }
    }

    #[test]
    fn test_call_entry_serialization() {
        let call = CallEntry::new("foo", "bar", Some(vec![1, 2, 3]));
        let json = serde_json::to_string(&call).unwrap();
        assert_eq!(json, r#"{"m":"foo","s":"bar","a":"AQID"}"#);
    }

    #[test]
    fn test_call_entry_without_arg() {
        let call = CallEntry::new("foo", "bar", None);
        let json = serde_json::to_string(&call).unwrap();
        assert_eq!(json, r#"{"m":"foo","s":"bar"}"#);

        let parsed: CallEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.arg, None);
    }

    #[test]
    fn test_signal_update_drop_serialization() {
        let json = serde_json::to_string(&SignalUpdate::dropped()).unwrap();
        assert_eq!(json, r#"{"d":true}"#);

        let json = serde_json::to_string(&SignalUpdate::with_value(vec![0xff])).unwrap();
        assert_eq!(json, r#"{"v":"/w=="}"#);
    }

    #[test]
    fn test_empty_envelope_serializes_to_empty_object() {
        let envelope = Envelope::default();
        assert!(envelope.is_empty());
        assert_eq!(serde_json::to_string(&envelope).unwrap(), "{}");
    }

    #[test]
    fn test_envelope_deserialization() {
        let json = r#"{"l":"abc123","m":{"foo":true},"c":[{"m":"foo","s":"bar","a":"NQ=="}],"s":{"x":{"s":true,"h":true}}}"#;
        let envelope: Envelope = serde_json::from_str(json).unwrap();

        assert_eq!(envelope.label.as_deref(), Some("abc123"));
        assert_eq!(envelope.mod_subscribe.get("foo"), Some(&true));
        assert_eq!(envelope.calls, vec![CallEntry::new("foo", "bar", Some(b"5".to_vec()))]);
        let update = &envelope.signals["x"];
        assert_eq!(update.subscribe, Some(true));
        assert_eq!(update.hold, Some(true));
        assert!(!update.drop);
    }

    #[test]
    fn test_invalid_base64_is_rejected() {
        let result = serde_json::from_str::<SignalUpdate>(r#"{"v":"not base64!"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_merge_hold_table() {
        let cases = [
            (None, None, Some(None)),
            (None, Some(true), Some(Some(true))),
            (None, Some(false), Some(Some(false))),
            (Some(true), None, Some(Some(true))),
            (Some(true), Some(true), Some(Some(true))),
            (Some(true), Some(false), None),
            (Some(false), None, Some(Some(false))),
            (Some(false), Some(true), None),
            (Some(false), Some(false), Some(Some(false))),
        ];

        for (a, b, expected) in cases {
            let merged = merge_signal(&hold(a), &hold(b)).map(|m| m.hold);
            assert_eq!(merged, expected, "hold merge of {:?} and {:?}", a, b);
        }
    }

    #[test]
    fn test_merge_later_value_wins() {
        let merged = merge_signal(
            &SignalUpdate::with_value(vec![1]),
            &SignalUpdate::with_value(vec![2]),
        )
        .unwrap();
        assert_eq!(merged, SignalUpdate::with_value(vec![2]));
    }

    #[test]
    fn test_merge_drop_then_value_and_value_then_drop() {
        let merged =
            merge_signal(&SignalUpdate::dropped(), &SignalUpdate::with_value(vec![7])).unwrap();
        assert_eq!(merged, SignalUpdate::with_value(vec![7]));

        let merged =
            merge_signal(&SignalUpdate::with_value(vec![7]), &SignalUpdate::dropped()).unwrap();
        assert_eq!(merged, SignalUpdate::dropped());
    }

    #[test]
    fn test_merge_keeps_earlier_value_when_later_is_silent() {
        let merged = merge_signal(
            &SignalUpdate::with_value(vec![3]),
            &SignalUpdate::subscription(true),
        )
        .unwrap();
        assert_eq!(merged.value, Some(vec![3]));
        assert_eq!(merged.subscribe, Some(true));
        assert!(!merged.drop);
    }

    #[test]
    fn test_merge_value_with_hold() {
        let merged =
            merge_signal(&SignalUpdate::with_value(vec![5]), &SignalUpdate::holding(true)).unwrap();
        assert_eq!(merged.value, Some(vec![5]));
        assert_eq!(merged.hold, Some(true));
    }

    #[test]
    fn test_merge_matches_last_specified_value() {
        let samples = [
            SignalUpdate::default(),
            SignalUpdate::with_value(vec![1]),
            SignalUpdate::with_value(vec![2]),
            SignalUpdate::dropped(),
            SignalUpdate {
                value: Some(vec![9]),
                drop: true,
                ..SignalUpdate::default()
            },
            SignalUpdate::subscription(false),
        ];

        for a in &samples {
            for b in &samples {
                for c in &samples {
                    let folded = merge_signal(a, b)
                        .and_then(|ab| merge_signal(&ab, c))
                        .unwrap();
                    let expected = [c, b, a].into_iter().find_map(|u| u.effective());
                    assert_eq!(folded.effective(), expected);
                }
            }
        }
    }
}
