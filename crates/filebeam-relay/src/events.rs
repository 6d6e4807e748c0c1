//! Relay protocol events
//!
//! Every WebSocket text frame carries one [`Envelope`]:
//!
//! ```json
//! { "event": "file-meta", "data": { "uid": "abc", "metadata": { "name": "a.txt" } } }
//! ```
//!
//! Payload fields the relay forwards (`metadata`, `buffer`) are opaque JSON and
//! pass through untouched. Missing fields decode to empty values instead of
//! failing, so a client that omits `uid` joins or targets the `""` room.
//!
//! # Binary attachments
//!
//! Raw bytes travel as binary frames. The text frame marks each one with a
//! placeholder object and the binary frames follow it, in order:
//!
//! ```json
//! { "event": "file-raw", "data": { "uid": "abc", "buffer": { "_placeholder": true, "num": 0 } } }
//! ```
//!
//! Forwarded events keep the placeholders and are followed by the same binary
//! frames, so the bytes reach the peer unchanged.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::EventError;

/// Inbound event names
pub const SENDER_JOIN: &str = "sender-join";
pub const RECEIVER_JOIN: &str = "receiver-join";
pub const FILE_META: &str = "file-meta";
pub const FS_START: &str = "fs-start";
pub const FILE_RAW: &str = "file-raw";

/// Outbound event names
pub const INIT: &str = "init";
pub const FS_META: &str = "fs-meta";
pub const FS_SHARE: &str = "fs-share";

/// Most binary frames a single event may announce
pub const MAX_ATTACHMENTS: usize = 16;

/// A named event and its payload, as carried in one text frame
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    /// Parse from JSON
    pub fn from_json(json: &str) -> Result<Self, EventError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Event data plus the binary frames that came with it
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Payload {
    pub data: Value,
    pub attachments: Vec<Vec<u8>>,
}

impl Payload {
    pub fn with_attachments(data: Value, attachments: Vec<Vec<u8>>) -> Self {
        Self { data, attachments }
    }
}

impl From<Value> for Payload {
    fn from(data: Value) -> Self {
        Self {
            data,
            attachments: Vec::new(),
        }
    }
}

/// Count `{"_placeholder": true, ...}` markers anywhere in `value`
pub fn count_placeholders(value: &Value) -> usize {
    match value {
        Value::Object(map) if map.get("_placeholder") == Some(&Value::Bool(true)) => 1,
        Value::Object(map) => map.values().map(count_placeholders).sum(),
        Value::Array(items) => items.iter().map(count_placeholders).sum(),
        _ => 0,
    }
}

/// A complete inbound event, attachments included
#[derive(Clone, Debug, PartialEq)]
pub struct Inbound {
    pub event: String,
    pub payload: Payload,
}

/// Reassembles events announced in a text frame with the binary frames that
/// follow it. One per connection.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    pending: Option<Pending>,
}

#[derive(Debug)]
struct Pending {
    event: String,
    data: Value,
    expected: usize,
    attachments: Vec<Vec<u8>>,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a text frame. Returns the event at once unless it announces
    /// attachments. An event still waiting for its attachments is abandoned.
    pub fn text(&mut self, text: &str) -> Result<Option<Inbound>, EventError> {
        if let Some(stale) = self.pending.take() {
            warn!(
                "Dropping {}: announced {} binary frame(s), got {}",
                stale.event,
                stale.expected,
                stale.attachments.len()
            );
        }

        let Envelope { event, data } = Envelope::from_json(text)?;
        let expected = count_placeholders(&data);

        if expected == 0 {
            return Ok(Some(Inbound {
                event,
                payload: Payload::from(data),
            }));
        }
        if expected > MAX_ATTACHMENTS {
            return Err(EventError::TooManyAttachments(expected));
        }

        self.pending = Some(Pending {
            event,
            data,
            expected,
            attachments: Vec::with_capacity(expected),
        });
        Ok(None)
    }

    /// Feed a binary frame. Returns the event once its last attachment is in.
    pub fn binary(&mut self, bytes: Vec<u8>) -> Result<Option<Inbound>, EventError> {
        let Some(pending) = self.pending.as_mut() else {
            return Err(EventError::UnexpectedBinary(bytes.len()));
        };

        pending.attachments.push(bytes);
        if pending.attachments.len() < pending.expected {
            return Ok(None);
        }

        Ok(self.pending.take().map(|p| Inbound {
            event: p.event,
            payload: Payload::with_attachments(p.data, p.attachments),
        }))
    }
}

/// `sender-join` payload
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct SenderJoin {
    pub uid: String,
}

/// `receiver-join` payload
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct ReceiverJoin {
    pub uid: String,
    pub sender_uid: String,
}

/// `file-meta` payload
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileMeta {
    pub uid: String,
    pub metadata: Value,
}

/// `fs-start` payload
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct FsStart {
    pub uid: String,
}

/// `file-raw` payload
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileRaw {
    pub uid: String,
    pub buffer: Value,
}

/// Decode an inbound payload into the shape expected by `event`
pub fn decode<T: for<'de> Deserialize<'de>>(
    event: &'static str,
    data: Value,
) -> Result<T, EventError> {
    // A bare `null` carries no fields at all
    let data = if data.is_null() {
        Value::Object(Default::default())
    } else {
        data
    };
    serde_json::from_value(data).map_err(|source| EventError::MalformedPayload { event, source })
}

/// Events the relay emits to clients
#[derive(Clone, Debug, PartialEq)]
pub enum OutboundEvent {
    /// A receiver announced itself; carries the receiver's uid
    Init(String),
    /// File metadata from the peer
    FsMeta(Value),
    /// Transfer start (`{}`) or a raw file chunk
    FsShare(Value),
}

impl OutboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            OutboundEvent::Init(_) => INIT,
            OutboundEvent::FsMeta(_) => FS_META,
            OutboundEvent::FsShare(_) => FS_SHARE,
        }
    }

    pub fn into_envelope(self) -> Envelope {
        let name = self.name();
        let data = match self {
            OutboundEvent::Init(uid) => Value::String(uid),
            OutboundEvent::FsMeta(v) | OutboundEvent::FsShare(v) => v,
        };
        Envelope::new(name, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_parse() {
        let env = Envelope::from_json(r#"{"event":"sender-join","data":{"uid":"abc"}}"#).unwrap();
        assert_eq!(env.event, SENDER_JOIN);

        let join: SenderJoin = decode(SENDER_JOIN, env.data).unwrap();
        assert_eq!(join.uid, "abc");
    }

    #[test]
    fn test_envelope_without_data() {
        let env = Envelope::from_json(r#"{"event":"fs-start"}"#).unwrap();
        assert!(env.data.is_null());

        let start: FsStart = decode(FS_START, env.data).unwrap();
        assert_eq!(start.uid, "");
    }

    #[test]
    fn test_invalid_frame() {
        let err = Envelope::from_json("not json").unwrap_err();
        assert!(matches!(err, EventError::MalformedFrame(_)));

        let err = Envelope::from_json(r#"{"data":{}}"#).unwrap_err();
        assert!(matches!(err, EventError::MalformedFrame(_)));
    }

    #[test]
    fn test_missing_fields_default() {
        let raw: FileRaw = decode(FILE_RAW, json!({ "uid": "abc" })).unwrap();
        assert_eq!(raw.uid, "abc");
        assert!(raw.buffer.is_null());

        let join: ReceiverJoin = decode(RECEIVER_JOIN, json!({ "uid": "xyz" })).unwrap();
        assert_eq!(join.sender_uid, "");
    }

    #[test]
    fn test_wrong_shape_is_malformed() {
        let err = decode::<FileMeta>(FILE_META, json!("abc")).unwrap_err();
        match err {
            EventError::MalformedPayload { event, .. } => assert_eq!(event, FILE_META),
            other => panic!("unexpected error: {:?}", other),
        }

        assert!(decode::<SenderJoin>(SENDER_JOIN, json!({ "uid": 42 })).is_err());
    }

    #[test]
    fn test_count_placeholders() {
        assert_eq!(count_placeholders(&json!({ "uid": "abc", "buffer": [1, 2] })), 0);
        assert_eq!(
            count_placeholders(&json!({ "uid": "abc", "buffer": { "_placeholder": true, "num": 0 } })),
            1
        );
        assert_eq!(
            count_placeholders(&json!([{ "_placeholder": true }, { "x": { "_placeholder": true } }])),
            2
        );
        assert_eq!(count_placeholders(&json!({ "_placeholder": false })), 0);
    }

    #[test]
    fn test_assembler_plain_text() {
        let mut asm = FrameAssembler::new();
        let inbound = asm
            .text(r#"{"event":"fs-start","data":{"uid":"abc"}}"#)
            .unwrap()
            .unwrap();

        assert_eq!(inbound.event, FS_START);
        assert!(inbound.payload.attachments.is_empty());
    }

    #[test]
    fn test_assembler_waits_for_binary() {
        let mut asm = FrameAssembler::new();
        let text = r#"{"event":"file-raw","data":{"uid":"abc","buffer":{"_placeholder":true,"num":0}}}"#;

        assert!(asm.text(text).unwrap().is_none());
        let inbound = asm.binary(vec![0, 159, 255]).unwrap().unwrap();

        assert_eq!(inbound.event, FILE_RAW);
        assert_eq!(inbound.payload.attachments, vec![vec![0, 159, 255]]);
        assert_eq!(
            inbound.payload.data["buffer"],
            json!({ "_placeholder": true, "num": 0 })
        );
    }

    #[test]
    fn test_assembler_rejects_stray_binary() {
        let mut asm = FrameAssembler::new();
        let err = asm.binary(vec![1, 2, 3]).unwrap_err();
        assert!(matches!(err, EventError::UnexpectedBinary(3)));
    }

    #[test]
    fn test_assembler_abandons_incomplete_event() {
        let mut asm = FrameAssembler::new();
        let two = r#"{"event":"file-meta","data":{"a":{"_placeholder":true},"b":{"_placeholder":true}}}"#;

        assert!(asm.text(two).unwrap().is_none());
        assert!(asm.binary(vec![1]).unwrap().is_none());

        // The next text frame still goes through; the partial event is gone
        let inbound = asm.text(r#"{"event":"fs-start"}"#).unwrap().unwrap();
        assert_eq!(inbound.event, FS_START);
        assert!(matches!(
            asm.binary(vec![2]).unwrap_err(),
            EventError::UnexpectedBinary(1)
        ));
    }

    #[test]
    fn test_assembler_limits_attachments() {
        let mut asm = FrameAssembler::new();
        let many: Vec<Value> = (0..=MAX_ATTACHMENTS)
            .map(|n| json!({ "_placeholder": true, "num": n }))
            .collect();
        let text = Envelope::new(FILE_RAW, json!({ "buffer": many }))
            .to_json()
            .unwrap();

        let err = asm.text(&text).unwrap_err();
        assert!(matches!(err, EventError::TooManyAttachments(n) if n == MAX_ATTACHMENTS + 1));
    }

    #[test]
    fn test_outbound_envelopes() {
        let init = OutboundEvent::Init("xyz".into()).into_envelope();
        assert_eq!(init.to_json().unwrap(), r#"{"event":"init","data":"xyz"}"#);

        let meta = OutboundEvent::FsMeta(json!({ "name": "a.txt", "size": 10 })).into_envelope();
        assert_eq!(meta.event, FS_META);
        assert_eq!(meta.data, json!({ "name": "a.txt", "size": 10 }));

        let start = OutboundEvent::FsShare(json!({})).into_envelope();
        assert_eq!(start.to_json().unwrap(), r#"{"event":"fs-share","data":{}}"#);
    }
}
